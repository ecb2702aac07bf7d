use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::{Arc, Mutex, OnceLock};
use std::time::{Duration, Instant};

use anyhow::{Context, Result};
use bytes::Bytes;
use futures::StreamExt;
use http_body_util::{BodyExt, Full};
use hyper::server::conn::http1;
use hyper::service::service_fn;
use hyper::{Request, Response, StatusCode};
use hyper_util::rt::TokioIo;
use serde::Serialize;
use tokio::net::{TcpListener, TcpStream};
use tokio::task::JoinHandle;
use tokio::time::timeout;
use tokio_yamux::config::Config as YamuxConfig;
use tokio_yamux::session::Session;
use tracing::{debug, error, info, warn};

use crate::auth;
use crate::config::ProxyConfig;
use crate::coordinator::Coordinator;
use crate::crypto::{BoxConn, CryptoStream};
use crate::message::{read_frame, write_frame, MsgType, NewClientMessage};
use crate::metrics::ProxyMetrics;

type BoxBody = http_body_util::combinators::BoxBody<Bytes, hyper::Error>;

/// Read deadline for the first frame on a freshly accepted stream.
const CONN_READ_TIMEOUT: Duration = Duration::from_secs(10);

/// The proxy: accepts client tunnels on one listener and scraper HTTP
/// traffic on another, and brokers scrapes onto per-client tunnels.
pub struct ProxyServer {
    tokens: Vec<String>,
    default_scrape_timeout: Duration,
    max_scrape_timeout: Duration,
    remotes: Mutex<HashMap<String, Arc<Coordinator>>>,
    metrics: Arc<ProxyMetrics>,
}

#[derive(Serialize)]
struct TargetGroup {
    targets: Vec<String>,
    labels: Option<HashMap<String, String>>,
}

impl ProxyServer {
    pub fn new(cfg: &ProxyConfig) -> Arc<Self> {
        Arc::new(ProxyServer {
            tokens: cfg.tokens.clone(),
            default_scrape_timeout: cfg.default_scrape_timeout,
            max_scrape_timeout: cfg.max_scrape_timeout,
            remotes: Mutex::new(HashMap::new()),
            metrics: Arc::new(ProxyMetrics::default()),
        })
    }

    pub fn metrics(&self) -> Arc<ProxyMetrics> {
        self.metrics.clone()
    }

    pub fn lookup(&self, fqdn: &str) -> Option<Arc<Coordinator>> {
        self.remotes.lock().expect("lock poisoned").get(fqdn).cloned()
    }

    /// Union of every coordinator's registered logical targets.
    pub fn known_targets(&self) -> Vec<String> {
        let remotes = self.remotes.lock().expect("lock poisoned");
        remotes.values().flat_map(|c| c.known_targets()).collect()
    }

    /// Installs a fresh coordinator for `fqdn`; a previous one is stopped
    /// asynchronously so the registry never holds two for the same client.
    fn install(&self, fqdn: &str, ctl_conn: BoxConn) -> Arc<Coordinator> {
        let coordinator = Coordinator::start(fqdn.to_string(), ctl_conn, self.metrics.clone());
        let old = self
            .remotes
            .lock()
            .expect("lock poisoned")
            .insert(fqdn.to_string(), coordinator.clone());
        if let Some(old) = old {
            debug!("replacing coordinator for {fqdn}");
            tokio::spawn(async move { old.stop().await });
        }
        coordinator
    }

    async fn handle_tunnel_conn(self: Arc<Self>, conn: TcpStream, peer: SocketAddr) {
        debug!("tunnel connection from {peer}");
        let mut session = Session::new_server(conn, YamuxConfig::default());
        // set once by a successful handshake; every stream accepted after
        // that is crypto-wrapped before its first frame is read
        let session_token: Arc<OnceLock<String>> = Arc::new(OnceLock::new());
        while let Some(next) = session.next().await {
            let stream = match next {
                Ok(stream) => stream,
                Err(err) => {
                    warn!("mux stream accept from {peer} failed: {err:?}");
                    break;
                }
            };
            let conn: BoxConn = match session_token.get() {
                Some(token) => Box::new(CryptoStream::new(stream, token.as_bytes())),
                None => Box::new(stream),
            };
            let server = self.clone();
            let session_token = session_token.clone();
            tokio::spawn(async move { server.handle_stream(conn, session_token, peer).await });
        }
        debug!("mux session from {peer} closed");
    }

    async fn handle_stream(
        self: Arc<Self>,
        mut conn: BoxConn,
        session_token: Arc<OnceLock<String>>,
        peer: SocketAddr,
    ) {
        let frame = match timeout(CONN_READ_TIMEOUT, read_frame(&mut conn)).await {
            Ok(Ok(frame)) => frame,
            Ok(Err(err)) => {
                debug!("failed to read the first frame from {peer}: {err}");
                return;
            }
            Err(_) => {
                debug!("timed out waiting for the first frame from {peer}");
                return;
            }
        };
        match frame {
            (MsgType::NewMachine, payload) => {
                let msg: NewClientMessage = match serde_json::from_slice(&payload) {
                    Ok(msg) => msg,
                    Err(err) => {
                        warn!("broken newMachine from {peer}: {err}");
                        return;
                    }
                };
                let Some(token) = auth::verify(&self.tokens, &msg) else {
                    // closed without a reply; auth failures must not be an oracle
                    warn!("auth failed for {} from {peer}", msg.fqdn);
                    return;
                };
                let token = token.to_string();
                let _ = session_token.set(token.clone());
                let mut ctl: BoxConn = Box::new(CryptoStream::new(conn, token.as_bytes()));
                if let Err(err) = write_frame(&mut ctl, MsgType::NewMachineOk, &[]).await {
                    error!("failed to confirm handshake of {}: {err}", msg.fqdn);
                    return;
                }
                info!("client {} connected from {peer}", msg.fqdn);
                self.install(&msg.fqdn, ctl);
            }
            (MsgType::NewScrapeConn, payload) => {
                let fqdn = String::from_utf8_lossy(&payload).into_owned();
                match self.lookup(&fqdn) {
                    Some(coordinator) => coordinator.park_scrape_conn(conn).await,
                    None => warn!("scrape stream from {peer} for unknown client {fqdn}"),
                }
            }
            (typ, _) => {
                warn!("unexpected {typ} as the first message from {peer}");
            }
        }
    }

    async fn handle_http(
        self: Arc<Self>,
        req: Request<hyper::body::Incoming>,
    ) -> Result<Response<BoxBody>> {
        // absolute-form targets are scrapes; everything else is the admin mux
        if req.uri().authority().is_some() {
            let started = Instant::now();
            let response = self.handle_scrape(req).await?;
            self.metrics
                .observe_scrape(response.status().as_u16(), started.elapsed().as_secs_f64());
            return Ok(response);
        }
        match req.uri().path() {
            "/targets" => self.handle_list_targets(),
            "/metrics" => Response::builder()
                .header("content-type", "text/plain; version=0.0.4")
                .body(full_body(self.metrics.render()))
                .context("failed to assemble metrics response"),
            _ => Ok(status_response(StatusCode::NOT_FOUND)),
        }
    }

    async fn handle_scrape(&self, req: Request<hyper::body::Incoming>) -> Result<Response<BoxBody>> {
        let Some(authority) = req.uri().authority() else {
            return Ok(status_response(StatusCode::INTERNAL_SERVER_ERROR));
        };
        // <process>.<fqdn>:80
        let host = authority.host().to_string();
        let Some((process, fqdn)) = host.split_once('.') else {
            return Ok(status_response(StatusCode::BAD_REQUEST));
        };
        let Some(coordinator) = self.lookup(fqdn) else {
            return Ok(status_response(StatusCode::NOT_FOUND));
        };
        let path_and_query = req
            .uri()
            .path_and_query()
            .map(|pq| pq.as_str().to_string())
            .unwrap_or_else(|| "/".to_string());
        let (parts, _body) = req.into_parts();
        match coordinator
            .forward(
                process,
                parts.method,
                parts.headers,
                &path_and_query,
                self.default_scrape_timeout,
                self.max_scrape_timeout,
            )
            .await
        {
            Ok(scraped) => {
                let mut builder = Response::builder().status(scraped.status);
                for (name, value) in &scraped.headers {
                    builder = builder.header(name, value);
                }
                builder
                    .body(full_body(scraped.body))
                    .context("failed to assemble scrape response")
            }
            Err(err) => {
                warn!("scrape of {host} failed: {err:#}");
                Ok(status_response(StatusCode::INTERNAL_SERVER_ERROR))
            }
        }
    }

    fn handle_list_targets(&self) -> Result<Response<BoxBody>> {
        let known = self.known_targets();
        let groups: Vec<TargetGroup> = known
            .iter()
            .map(|target| TargetGroup {
                targets: vec![target.clone()],
                labels: None,
            })
            .collect();
        let body = serde_json::to_string(&groups)?;
        debug!("responded to /targets with {} targets", known.len());
        Response::builder()
            .header("content-type", "application/json")
            .body(full_body(body))
            .context("failed to assemble target list")
    }
}

fn full_body(data: impl Into<Bytes>) -> BoxBody {
    Full::new(data.into())
        .map_err(|never| match never {})
        .boxed()
}

fn status_response(status: StatusCode) -> Response<BoxBody> {
    let mut response = Response::new(full_body(""));
    *response.status_mut() = status;
    response
}

/// A bound proxy: both listeners are live and serving on background tasks.
pub struct ProxyHandle {
    pub http_addr: SocketAddr,
    pub tunnel_addr: SocketAddr,
    server: Arc<ProxyServer>,
    tasks: Vec<JoinHandle<()>>,
}

impl ProxyHandle {
    pub fn server(&self) -> Arc<ProxyServer> {
        self.server.clone()
    }

    pub fn shutdown(&self) {
        for task in &self.tasks {
            task.abort();
        }
    }
}

/// Binds both listeners and spawns the accept loops.
pub async fn bind(cfg: ProxyConfig) -> Result<ProxyHandle> {
    let server = ProxyServer::new(&cfg);

    let tunnel_listener = TcpListener::bind(&cfg.server_address)
        .await
        .with_context(|| format!("failed to bind tunnel listener on {}", cfg.server_address))?;
    let tunnel_addr = tunnel_listener.local_addr()?;

    let http_listener = TcpListener::bind(&cfg.proxy_address)
        .await
        .with_context(|| format!("failed to bind http listener on {}", cfg.proxy_address))?;
    let http_addr = http_listener.local_addr()?;

    let tunnel_task = tokio::spawn({
        let server = server.clone();
        async move {
            loop {
                match tunnel_listener.accept().await {
                    Ok((conn, peer)) => {
                        tokio::spawn(server.clone().handle_tunnel_conn(conn, peer));
                    }
                    Err(err) => {
                        warn!("tunnel listener closed: {err}");
                        return;
                    }
                }
            }
        }
    });

    let http_task = tokio::spawn({
        let server = server.clone();
        async move {
            loop {
                match http_listener.accept().await {
                    Ok((conn, _peer)) => {
                        let server = server.clone();
                        tokio::spawn(async move {
                            let service = service_fn(move |req| server.clone().handle_http(req));
                            if let Err(err) = http1::Builder::new()
                                .serve_connection(TokioIo::new(conn), service)
                                .await
                            {
                                debug!("http connection error: {err}");
                            }
                        });
                    }
                    Err(err) => {
                        warn!("http listener closed: {err}");
                        return;
                    }
                }
            }
        }
    });

    Ok(ProxyHandle {
        http_addr,
        tunnel_addr,
        server,
        tasks: vec![tunnel_task, http_task],
    })
}

/// Runs the proxy until ctrl-c.
pub async fn run(cfg: ProxyConfig) -> Result<()> {
    let handle = bind(cfg).await?;
    info!("proxying scrapes on http://{}", handle.http_addr);
    info!("accepting client tunnels on {}", handle.tunnel_addr);
    tokio::signal::ctrl_c().await?;
    info!("shutting down proxy");
    handle.shutdown();
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    use tokio::io::AsyncReadExt;

    fn test_server() -> Arc<ProxyServer> {
        ProxyServer::new(&ProxyConfig {
            proxy_address: "127.0.0.1:0".into(),
            server_address: "127.0.0.1:0".into(),
            max_scrape_timeout: Duration::from_secs(300),
            default_scrape_timeout: Duration::from_secs(15),
            tokens: vec!["t1".into()],
        })
    }

    #[tokio::test]
    async fn install_replaces_the_previous_coordinator() {
        let server = test_server();
        let (ctl_a, mut peer_a) = tokio::io::duplex(1024);
        let first = server.install("node-a", Box::new(ctl_a));
        let (ctl_b, _peer_b) = tokio::io::duplex(1024);
        let second = server.install("node-a", Box::new(ctl_b));

        assert_eq!(server.remotes.lock().expect("lock poisoned").len(), 1);
        assert!(Arc::ptr_eq(
            &server.lookup("node-a").expect("coordinator"),
            &second
        ));

        // the replaced coordinator shuts down within a bounded delay
        let mut probe = [0u8; 1];
        let n = timeout(Duration::from_secs(2), peer_a.read(&mut probe))
            .await
            .expect("old control stream should close")
            .expect("read");
        assert_eq!(n, 0);
        timeout(Duration::from_secs(2), async {
            while !first.stopped() {
                tokio::time::sleep(Duration::from_millis(20)).await;
            }
        })
        .await
        .expect("old coordinator should stop");
    }

    #[tokio::test]
    async fn known_targets_spans_all_coordinators() {
        let server = test_server();
        let (ctl_a, mut peer_a) = tokio::io::duplex(1024);
        server.install("node-a", Box::new(ctl_a));
        let (ctl_b, mut peer_b) = tokio::io::duplex(1024);
        server.install("node-b", Box::new(ctl_b));

        write_frame(&mut peer_a, MsgType::Register, b"cpu").await.unwrap();
        write_frame(&mut peer_b, MsgType::Register, b"disk").await.unwrap();
        timeout(Duration::from_secs(2), async {
            while server.known_targets().len() != 2 {
                tokio::time::sleep(Duration::from_millis(20)).await;
            }
        })
        .await
        .expect("targets should appear");

        let mut targets = server.known_targets();
        targets.sort();
        assert_eq!(targets, vec!["cpu.node-a:80", "disk.node-b:80"]);
    }
}
