use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use anyhow::{anyhow, bail, Context, Result};
use http::header::HeaderMap;
use http::Method;
use tokio::io::{ReadHalf, WriteHalf};
use tokio::sync::mpsc::error::{TryRecvError, TrySendError};
use tokio::sync::mpsc::{self, Receiver, Sender};
use tokio::sync::Mutex as AsyncMutex;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::crypto::BoxConn;
use crate::message::{read_frame, write_frame, MsgType};
use crate::metrics::ProxyMetrics;
use crate::parse::{self, ScrapeResponse};

/// How many idle scrape streams a coordinator parks for reuse.
pub const PARKED_STREAM_CAPACITY: usize = 10;

#[derive(Default)]
struct TargetState {
    stopped: bool,
    known: HashMap<String, Instant>,
}

/// Server-side peer of one connected client: owns the encrypted control
/// stream, the set of registered logical targets, and the broker of parked
/// scrape streams.
pub struct Coordinator {
    fqdn: String,
    state: Mutex<TargetState>,
    ctl_writer: AsyncMutex<WriteHalf<BoxConn>>,
    scrape_tx: Sender<BoxConn>,
    scrape_rx: AsyncMutex<Receiver<BoxConn>>,
    cancel: CancellationToken,
    metrics: Arc<ProxyMetrics>,
}

impl Coordinator {
    /// Creates the coordinator and spawns its control-stream reader.
    pub fn start(fqdn: String, ctl_conn: BoxConn, metrics: Arc<ProxyMetrics>) -> Arc<Self> {
        let (ctl_reader, ctl_writer) = tokio::io::split(ctl_conn);
        let (scrape_tx, scrape_rx) = mpsc::channel(PARKED_STREAM_CAPACITY);
        let coordinator = Arc::new(Coordinator {
            fqdn,
            state: Mutex::new(TargetState::default()),
            ctl_writer: AsyncMutex::new(ctl_writer),
            scrape_tx,
            scrape_rx: AsyncMutex::new(scrape_rx),
            cancel: CancellationToken::new(),
            metrics,
        });
        tokio::spawn({
            let coordinator = coordinator.clone();
            async move { coordinator.read_control(ctl_reader).await }
        });
        coordinator
    }

    pub fn fqdn(&self) -> &str {
        &self.fqdn
    }

    pub fn stopped(&self) -> bool {
        self.state.lock().expect("lock poisoned").stopped
    }

    async fn read_control(self: Arc<Self>, mut reader: ReadHalf<BoxConn>) {
        loop {
            let frame = tokio::select! {
                _ = self.cancel.cancelled() => break,
                frame = read_frame(&mut reader) => frame,
            };
            match frame {
                Ok((MsgType::Register, payload)) => {
                    let process = String::from_utf8_lossy(&payload).into_owned();
                    self.add_scrape_target(&process);
                }
                Ok((MsgType::Deregister, payload)) => {
                    let process = String::from_utf8_lossy(&payload).into_owned();
                    self.del_scrape_target(&process);
                }
                Ok((typ, _)) => {
                    warn!("unexpected {typ} message on the control stream of {}", self.fqdn);
                    break;
                }
                Err(err) => {
                    debug!("control stream of {} closed: {err}", self.fqdn);
                    break;
                }
            }
        }
        self.stop().await;
    }

    fn target_name(&self, process: &str) -> String {
        format!("{}.{}:80", process, self.fqdn)
    }

    fn add_scrape_target(&self, process: &str) {
        let mut state = self.state.lock().expect("lock poisoned");
        if state.stopped {
            return;
        }
        state.known.insert(self.target_name(process), Instant::now());
        self.metrics.set_targets(state.known.len());
    }

    fn del_scrape_target(&self, process: &str) {
        let mut state = self.state.lock().expect("lock poisoned");
        if state.stopped {
            return;
        }
        state.known.remove(&self.target_name(process));
        self.metrics.set_targets(state.known.len());
    }

    /// Logical targets this client has registered.
    pub fn known_targets(&self) -> Vec<String> {
        let state = self.state.lock().expect("lock poisoned");
        state.known.keys().cloned().collect()
    }

    /// Parks an incoming scrape stream. Blocks while the buffer is full;
    /// the stream is dropped if the coordinator stopped meanwhile.
    pub async fn park_scrape_conn(&self, conn: BoxConn) {
        if self.scrape_tx.send(conn).await.is_err() {
            debug!("dropping scrape stream for stopped coordinator {}", self.fqdn);
        }
    }

    /// Takes a parked scrape stream, or asks the client for a fresh one and
    /// waits up to `timeout` for it to arrive.
    async fn get_scrape_conn(&self, timeout: Duration) -> Result<BoxConn> {
        if self.stopped() {
            bail!("coordinator for {} is stopped", self.fqdn);
        }
        let mut rx = self.scrape_rx.lock().await;
        match rx.try_recv() {
            Ok(conn) => return Ok(conn),
            Err(TryRecvError::Disconnected) => bail!("scrape stream channel closed"),
            Err(TryRecvError::Empty) => {
                debug!("asking {} for a new scrape stream", self.fqdn);
                let mut writer = self.ctl_writer.lock().await;
                write_frame(&mut *writer, MsgType::ReqScrapeConn, &[])
                    .await
                    .map_err(|_| anyhow!("control stream of {} closed", self.fqdn))?;
            }
        }
        tokio::select! {
            conn = rx.recv() => conn.context("scrape stream channel closed"),
            _ = self.cancel.cancelled() => bail!("coordinator for {} is stopped", self.fqdn),
            _ = tokio::time::sleep(timeout) => bail!("timed out waiting for a scrape stream from {}", self.fqdn),
        }
    }

    /// Returns a scrape stream after use: parked for reuse unless the
    /// buffer is full, in which case it is closed.
    fn release_scrape_conn(&self, conn: BoxConn) {
        match self.scrape_tx.try_send(conn) {
            Ok(()) => {}
            Err(TrySendError::Full(conn)) | Err(TrySendError::Closed(conn)) => drop(conn),
        }
    }

    /// Forwards one scrape through a (possibly reused) scrape stream.
    ///
    /// The request write and the response read run concurrently and both
    /// finish before this returns. A stream that saw an I/O error is closed
    /// instead of parked.
    pub async fn forward(
        &self,
        process: &str,
        method: Method,
        mut headers: HeaderMap,
        path_and_query: &str,
        default_timeout: Duration,
        max_timeout: Duration,
    ) -> Result<ScrapeResponse> {
        parse::ensure_timeout_header(&mut headers, default_timeout, max_timeout);
        let timeout = parse::timeout_from_headers(&headers)?;
        let conn = self.get_scrape_conn(timeout).await?;
        let (mut read_half, mut write_half) = tokio::io::split(conn);

        // the client only sees its own fqdn and the process as the first
        // path segment
        let path = format!("/{}{}", process, path_and_query);
        let write = parse::write_request_head(&mut write_half, &method, &path, &self.fqdn, &headers);
        let read = async {
            let mut buf = Vec::new();
            parse::read_response(&mut read_half, &mut buf).await
        };
        let (wrote, response) = tokio::join!(write, read);
        match (wrote, response) {
            (Ok(()), Ok(response)) => {
                self.release_scrape_conn(read_half.unsplit(write_half));
                Ok(response)
            }
            (Err(err), _) | (_, Err(err)) => Err(err.context("scrape stream i/o failed")),
        }
    }

    /// Idempotent teardown: cancels the control reader, fails pending and
    /// future scrape requests, drops parked streams and known targets.
    pub async fn stop(&self) {
        {
            let mut state = self.state.lock().expect("lock poisoned");
            if state.stopped {
                return;
            }
            state.stopped = true;
            state.known.clear();
        }
        self.cancel.cancel();
        // waiters observe the cancellation and free the receiver promptly
        let mut rx = self.scrape_rx.lock().await;
        rx.close();
        while let Ok(conn) = rx.try_recv() {
            drop(conn);
        }
        let mut writer = self.ctl_writer.lock().await;
        let _ = tokio::io::AsyncWriteExt::shutdown(&mut *writer).await;
        debug!("coordinator for {} stopped", self.fqdn);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use tokio::io::AsyncReadExt;
    use tokio::time::timeout as with_timeout;

    const TICK: Duration = Duration::from_millis(50);
    const WAIT: Duration = Duration::from_secs(2);

    fn start_with_peer() -> (Arc<Coordinator>, tokio::io::DuplexStream) {
        let (ctl, peer) = tokio::io::duplex(64 * 1024);
        let coordinator = Coordinator::start(
            "node-a".into(),
            Box::new(ctl),
            Arc::new(ProxyMetrics::default()),
        );
        (coordinator, peer)
    }

    async fn wait_for<F: Fn() -> bool>(cond: F) {
        let deadline = Instant::now() + WAIT;
        while !cond() {
            assert!(Instant::now() < deadline, "condition not reached in time");
            tokio::time::sleep(TICK).await;
        }
    }

    #[tokio::test]
    async fn register_and_deregister_update_known_targets() {
        let (coordinator, mut peer) = start_with_peer();
        write_frame(&mut peer, MsgType::Register, b"cpu").await.unwrap();
        write_frame(&mut peer, MsgType::Register, b"disk").await.unwrap();
        wait_for(|| coordinator.known_targets().len() == 2).await;
        let mut targets = coordinator.known_targets();
        targets.sort();
        assert_eq!(targets, vec!["cpu.node-a:80", "disk.node-a:80"]);

        write_frame(&mut peer, MsgType::Deregister, b"cpu").await.unwrap();
        wait_for(|| coordinator.known_targets() == vec!["disk.node-a:80".to_string()]).await;
    }

    #[tokio::test]
    async fn control_stream_eof_stops_the_coordinator() {
        let (coordinator, peer) = start_with_peer();
        drop(peer);
        wait_for(|| coordinator.stopped()).await;
        assert!(coordinator.known_targets().is_empty());
        let err = coordinator
            .get_scrape_conn(Duration::from_millis(100))
            .await
            .unwrap_err();
        assert!(err.to_string().contains("stopped"));
    }

    #[tokio::test]
    async fn broker_reuses_a_parked_stream() {
        let (coordinator, mut peer) = start_with_peer();

        // first acquisition has nothing parked and must ask the client
        let acquire = tokio::spawn({
            let coordinator = coordinator.clone();
            async move { coordinator.get_scrape_conn(WAIT).await }
        });
        let (typ, _) = with_timeout(WAIT, read_frame(&mut peer)).await.unwrap().unwrap();
        assert_eq!(typ, MsgType::ReqScrapeConn);
        let (stream, _other_end) = tokio::io::duplex(1024);
        coordinator.park_scrape_conn(Box::new(stream)).await;
        let conn = acquire.await.unwrap().unwrap();

        // serialised reuse: release then re-acquire without a second request
        coordinator.release_scrape_conn(conn);
        let _conn = with_timeout(WAIT, coordinator.get_scrape_conn(WAIT))
            .await
            .unwrap()
            .unwrap();
        let mut probe = [0u8; 1];
        let second_request = with_timeout(Duration::from_millis(200), peer.read(&mut probe)).await;
        assert!(second_request.is_err(), "no second reqScrapeConn expected");
    }

    #[tokio::test]
    async fn broker_overflow_closes_the_eleventh_stream() {
        let (coordinator, _peer) = start_with_peer();
        let mut peers = Vec::new();
        for _ in 0..11 {
            let (stream, other_end) = tokio::io::duplex(1024);
            coordinator.release_scrape_conn(Box::new(stream));
            peers.push(other_end);
        }

        // the eleventh release found a full buffer and closed its stream
        let mut last = peers.pop().unwrap();
        let mut probe = [0u8; 1];
        let n = with_timeout(WAIT, last.read(&mut probe)).await.unwrap().unwrap();
        assert_eq!(n, 0, "overflowing stream should be closed");

        for _ in 0..10 {
            with_timeout(WAIT, coordinator.get_scrape_conn(WAIT))
                .await
                .unwrap()
                .unwrap();
        }
    }

    #[tokio::test]
    async fn acquisition_times_out_without_a_client_stream() {
        let (coordinator, mut peer) = start_with_peer();
        let started = Instant::now();
        let err = coordinator
            .get_scrape_conn(Duration::from_millis(200))
            .await
            .unwrap_err();
        assert!(err.to_string().contains("timed out"));
        assert!(started.elapsed() < WAIT);
        // the demand message still went out
        let (typ, _) = with_timeout(WAIT, read_frame(&mut peer)).await.unwrap().unwrap();
        assert_eq!(typ, MsgType::ReqScrapeConn);
    }

    #[tokio::test]
    async fn stop_closes_the_control_stream() {
        let (coordinator, mut peer) = start_with_peer();
        coordinator.stop().await;
        coordinator.stop().await; // idempotent
        let mut probe = [0u8; 1];
        let n = with_timeout(WAIT, peer.read(&mut probe)).await.unwrap().unwrap();
        assert_eq!(n, 0, "peer should observe eof after stop");
    }
}
