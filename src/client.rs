use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use anyhow::{anyhow, bail, Context, Result};
use futures::StreamExt;
use thiserror::Error;
use tokio::io::{ReadHalf, WriteHalf};
use tokio::net::TcpStream;
use tokio::sync::Mutex as AsyncMutex;
use tokio::task::JoinHandle;
use tokio::time::timeout;
use tokio_yamux::config::Config as YamuxConfig;
use tokio_yamux::Control;
use tokio_yamux::session::Session;
use tracing::{debug, error, info, warn};
use url::Url;

use crate::auth::sign_auth;
use crate::config::{endpoint_urls, ClientConfig, Endpoint};
use crate::crypto::{BoxConn, CryptoStream};
use crate::message::{read_frame, write_frame, MsgType, NewClientMessage};
use crate::modifier::{LabelInjector, ResponseModifier};
use crate::parse::{self, ScrapeRequest, ScrapeResponse};

/// How long the client waits for the handshake confirmation.
const HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(10);

/// The proxy never confirmed the handshake. There is no error channel on
/// the wire for this; the restart loop treats it as fatal.
#[derive(Debug, Error)]
#[error("authentication against the proxy failed (invalid token?)")]
pub struct AuthFailed;

/// One dialled tunnel: the TCP connection multiplexed into streams. The
/// session itself lives on a driver task; streams are opened through the
/// control handle.
struct Tunnel {
    token: String,
    control: Control,
    driver: JoinHandle<()>,
}

impl Tunnel {
    async fn connect(addr: &str, token: &str) -> Result<Self> {
        let conn = TcpStream::connect(addr)
            .await
            .with_context(|| format!("failed to dial proxy {addr}"))?;
        let mut session = Session::new_client(conn, YamuxConfig::default());
        let control = session.control();
        let driver = tokio::spawn(async move {
            // polling the session drives all tunnel i/o
            loop {
                match session.next().await {
                    Some(Ok(stream)) => {
                        warn!("dropping unexpected inbound stream");
                        drop(stream);
                    }
                    Some(Err(err)) => {
                        debug!("tunnel session error: {err:?}");
                        break;
                    }
                    None => {
                        debug!("tunnel session closed");
                        break;
                    }
                }
            }
        });
        Ok(Tunnel {
            token: token.to_string(),
            control,
            driver,
        })
    }

    async fn open_stream(&mut self, plain: bool) -> Result<BoxConn> {
        let stream = self
            .control
            .open_stream()
            .await
            .map_err(|err| anyhow!("failed to open tunnel stream: {err:?}"))?;
        Ok(if plain {
            Box::new(stream)
        } else {
            Box::new(CryptoStream::new(stream, self.token.as_bytes()))
        })
    }
}

impl Drop for Tunnel {
    fn drop(&mut self) {
        self.driver.abort();
    }
}

fn unix_now() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs() as i64)
        .unwrap_or(0)
}

/// Client-side coordinator: keeps the tunnel to the proxy, registers the
/// configured processes, and serves scrape requests against their local
/// HTTP endpoints.
pub struct Coordinator {
    proxy_addr: String,
    token: String,
    fqdn: String,
    processes: Mutex<HashMap<String, Url>>,
    http: reqwest::Client,
    modifier: Option<Arc<dyn ResponseModifier>>,
    ctl_writer: AsyncMutex<Option<WriteHalf<BoxConn>>>,
}

impl Coordinator {
    /// Validates the endpoint set (duplicate names are rejected here) and
    /// wires the label-injection hook when label pairs are configured.
    pub fn new(cfg: &ClientConfig) -> Result<Arc<Self>> {
        let processes = endpoint_urls(&cfg.endpoints)?;
        let modifier: Option<Arc<dyn ResponseModifier>> = if cfg.label_pairs.is_empty() {
            None
        } else {
            Some(Arc::new(LabelInjector::new(cfg.label_pairs.clone())))
        };
        Ok(Arc::new(Coordinator {
            proxy_addr: cfg.proxy_addr.clone(),
            token: cfg.token.clone(),
            fqdn: cfg.fqdn.clone(),
            processes: Mutex::new(processes),
            http: reqwest::Client::new(),
            modifier,
            ctl_writer: AsyncMutex::new(None),
        }))
    }

    pub fn fqdn(&self) -> &str {
        &self.fqdn
    }

    /// One tunnel lifecycle: dial, handshake, register, serve until the
    /// control stream dies. The caller restarts with backoff.
    pub async fn run(self: Arc<Self>) -> Result<()> {
        let mut tunnel = Tunnel::connect(&self.proxy_addr, &self.token).await?;
        let ctl = self.handshake(&mut tunnel).await?;
        let (mut ctl_reader, ctl_writer) = tokio::io::split(ctl);
        *self.ctl_writer.lock().await = Some(ctl_writer);
        let result = self.clone().serve(&mut tunnel, &mut ctl_reader).await;
        *self.ctl_writer.lock().await = None;
        result
    }

    /// Opens the control stream and authenticates: the `newMachine` frame
    /// goes out in the clear, then both sides wrap, then the confirmation
    /// arrives encrypted.
    async fn handshake(&self, tunnel: &mut Tunnel) -> Result<BoxConn> {
        let mut ctl = tunnel.open_stream(true).await?;
        let ts = unix_now();
        let hello = NewClientMessage {
            fqdn: self.fqdn.clone(),
            timestamp: ts,
            auth: sign_auth(&self.token, ts),
        };
        let payload = serde_json::to_vec(&hello).context("failed to encode newMachine")?;
        write_frame(&mut ctl, MsgType::NewMachine, &payload)
            .await
            .context("failed to send newMachine")?;

        let mut ctl: BoxConn = Box::new(CryptoStream::new(ctl, self.token.as_bytes()));
        match timeout(HANDSHAKE_TIMEOUT, read_frame(&mut ctl)).await {
            Ok(Ok((MsgType::NewMachineOk, _))) => Ok(ctl),
            Ok(Ok((typ, _))) => {
                debug!("expected newMachineOK, got {typ}");
                Err(AuthFailed.into())
            }
            Ok(Err(err)) => {
                debug!("handshake read failed: {err}");
                Err(AuthFailed.into())
            }
            Err(_) => Err(AuthFailed.into()),
        }
    }

    async fn serve(
        self: Arc<Self>,
        tunnel: &mut Tunnel,
        ctl_reader: &mut ReadHalf<BoxConn>,
    ) -> Result<()> {
        self.register_all().await?;
        info!("registered with proxy {} as {}", self.proxy_addr, self.fqdn);
        loop {
            let (typ, _) = read_frame(ctl_reader)
                .await
                .context("control stream read failed")?;
            match typ {
                MsgType::ReqScrapeConn => {
                    let mut sconn = match tunnel.open_stream(false).await {
                        Ok(conn) => conn,
                        Err(err) => {
                            error!("failed to open a scrape stream: {err:#}");
                            continue;
                        }
                    };
                    write_frame(&mut sconn, MsgType::NewScrapeConn, self.fqdn.as_bytes())
                        .await
                        .context("failed to send the scrape stream preamble")?;
                    let handler = self.clone();
                    tokio::spawn(async move { handler.handle_scrape_stream(sconn).await });
                }
                typ => bail!("unexpected {typ} message on the control stream"),
            }
        }
    }

    async fn register_all(&self) -> Result<()> {
        let names: Vec<String> = {
            let processes = self.processes.lock().expect("lock poisoned");
            processes.keys().cloned().collect()
        };
        let mut guard = self.ctl_writer.lock().await;
        let writer = guard.as_mut().context("not connected")?;
        for name in names {
            write_frame(writer, MsgType::Register, name.as_bytes())
                .await
                .with_context(|| format!("failed to register {name}"))?;
        }
        Ok(())
    }

    /// Swaps the registered endpoint set: deregisters every current name,
    /// then registers the new ones, serialised on the control stream.
    pub async fn update(&self, endpoints: &[Endpoint]) -> Result<()> {
        let new = endpoint_urls(endpoints)?;
        let mut guard = self.ctl_writer.lock().await;
        let writer = guard.as_mut().context("not connected")?;
        let old_names: Vec<String> = {
            let processes = self.processes.lock().expect("lock poisoned");
            processes.keys().cloned().collect()
        };
        for name in old_names {
            write_frame(writer, MsgType::Deregister, name.as_bytes())
                .await
                .with_context(|| format!("failed to deregister {name}"))?;
        }
        {
            let mut processes = self.processes.lock().expect("lock poisoned");
            *processes = new;
        }
        let names: Vec<String> = {
            let processes = self.processes.lock().expect("lock poisoned");
            processes.keys().cloned().collect()
        };
        for name in names {
            write_frame(writer, MsgType::Register, name.as_bytes())
                .await
                .with_context(|| format!("failed to register {name}"))?;
        }
        Ok(())
    }

    /// Serves scrape exchanges on one stream until it errors. The proxy
    /// holds on to the stream and reuses it across scrapes.
    async fn handle_scrape_stream(self: Arc<Self>, mut conn: BoxConn) {
        let mut buf = Vec::new();
        loop {
            let request = match parse::read_request(&mut conn, &mut buf).await {
                Ok(request) => request,
                Err(err) => {
                    debug!("scrape stream done: {err:#}");
                    return;
                }
            };

            if request.host() != Some(self.fqdn.as_str()) {
                if self
                    .respond_error(&mut conn, "scrape target doesn't match client fqdn")
                    .await
                    .is_err()
                {
                    return;
                }
                continue;
            }

            let target = request
                .process_name()
                .and_then(|name| {
                    let processes = self.processes.lock().expect("lock poisoned");
                    processes.get(name).cloned().map(|url| (name.to_string(), url))
                });
            let Some((process, target)) = target else {
                if self
                    .respond_error(&mut conn, "scrape target doesn't match client process name")
                    .await
                    .is_err()
                {
                    return;
                }
                continue;
            };

            // the proxy always stamps the timeout; a missing one is a
            // protocol fault, not a scrape failure
            let Ok(deadline) = parse::timeout_from_headers(&request.headers) else {
                let _ = self
                    .respond_error(&mut conn, "missing or invalid scrape timeout header")
                    .await;
                return;
            };

            let response = match self.scrape(&request, &process, target, deadline).await {
                Ok(response) => response,
                Err(err) => {
                    warn!("scrape of {process} failed: {err:#}");
                    ScrapeResponse::error(format!("{err:#}"))
                }
            };
            if let Err(err) = parse::write_response(&mut conn, &response).await {
                error!("failed to write a scrape response: {err:#}");
                return;
            }
        }
    }

    async fn respond_error(&self, conn: &mut BoxConn, reason: &str) -> Result<()> {
        debug!("rejecting scrape: {reason}");
        parse::write_response(conn, &ScrapeResponse::error(reason))
            .await
            .map_err(|err| {
                error!("failed to write a scrape error: {err:#}");
                err
            })
    }

    /// Round-trips one scrape against the local endpoint, bounded by the
    /// timeout the proxy forwarded.
    async fn scrape(
        &self,
        request: &ScrapeRequest,
        process: &str,
        target: Url,
        deadline: Duration,
    ) -> Result<ScrapeResponse> {
        let mut headers = request.headers.clone();
        headers.remove(http::header::HOST);
        headers.remove(http::header::CONTENT_LENGTH);

        let upstream = self
            .http
            .request(request.method.clone(), target.clone())
            .headers(headers)
            .timeout(deadline)
            .send()
            .await
            .with_context(|| format!("failed to scrape {target}"))?;

        let status = upstream.status();
        let headers = upstream.headers().clone();
        let body = upstream
            .bytes()
            .await
            .with_context(|| format!("failed to scrape {target}"))?;

        let mut response = ScrapeResponse {
            status,
            headers,
            body,
        };
        if let Some(modifier) = &self.modifier {
            modifier
                .modify(&mut response)
                .with_context(|| format!("failed to mutate scraped response, process: {process}"))?;
        }
        Ok(response)
    }
}
