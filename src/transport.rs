//! Control socket to a single node.
//!
//! A [`Transport`] owns one background task that keeps the WebSocket open. The task walks an
//! explicit state machine (`Disconnected -> Connecting -> Connected -> Reconnecting -> ...`),
//! sleeping with jittered exponential backoff between attempts, until [`Transport::close`] is
//! called or the retry budget runs out (`Failed`).
//!
//! Outbound frames go through a queue that outlives individual sockets, so anything sent while
//! `Reconnecting` is flushed in order once the next socket is up.

use std::sync::{Arc, Mutex as StdMutex, PoisonError};
use std::time::Duration;

use futures::{SinkExt, StreamExt};
use log::{debug, error, info, warn};
use tokio::net::TcpStream;
use tokio::sync::{mpsc, watch, Mutex};
use tokio::task::JoinHandle;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::http::header::{HeaderMap, HeaderName, HeaderValue, AUTHORIZATION};
use tokio_tungstenite::tungstenite::protocol::Message as WsMessage;
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};
use tokio_util::sync::CancellationToken;
use url::Url;

use crate::config::ReconnectPolicy;
use crate::error::{ClientError, Result};
use crate::model::IncomingFrame;

const OUTBOUND_CAPACITY: usize = 64;

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
    Reconnecting,
    Failed,
}

impl ConnectionState {
    /// `Disconnected` and `Failed` reject commands; everything else queues them.
    pub fn accepts_commands(self) -> bool {
        !matches!(self, ConnectionState::Disconnected | ConnectionState::Failed)
    }
}

/// Full-jitter exponential backoff.
#[derive(Debug, Clone, Copy)]
pub(crate) struct Backoff {
    policy: ReconnectPolicy,
}

impl Backoff {
    pub(crate) fn new(policy: ReconnectPolicy) -> Self {
        Self { policy }
    }

    /// Upper bound of the delay before retry number `retry` (0-based).
    pub(crate) fn ceiling(&self, retry: u32) -> Duration {
        let factor = 1u32.checked_shl(retry).unwrap_or(u32::MAX);
        self.policy
            .base_delay
            .saturating_mul(factor)
            .min(self.policy.max_delay)
    }

    pub(crate) fn delay(&self, retry: u32) -> Duration {
        let ceiling = self.ceiling(retry).as_millis() as u64;
        Duration::from_millis(rand::random_range(0..=ceiling))
    }

    /// True once `retries` failed attempts exhaust the budget.
    pub(crate) fn exhausted(&self, retries: u32) -> bool {
        self.policy.max_retries.is_some_and(|max| retries >= max)
    }
}

enum Driver {
    Idle(mpsc::Receiver<String>),
    Running(JoinHandle<mpsc::Receiver<String>>),
}

pub struct Transport {
    name: String,
    url: Url,
    headers: HeaderMap,
    policy: ReconnectPolicy,
    state: Arc<watch::Sender<ConnectionState>>,
    outbound: mpsc::Sender<String>,
    inbound: mpsc::Sender<IncomingFrame>,
    driver: Mutex<Option<Driver>>,
    cancel: StdMutex<CancellationToken>,
}

impl Transport {
    pub fn new(
        name: impl Into<String>,
        url: Url,
        password: &str,
        user_id: &str,
        client_name: &str,
        policy: ReconnectPolicy,
        inbound: mpsc::Sender<IncomingFrame>,
    ) -> Result<Self> {
        let name = name.into();
        let header = |value: &str| {
            HeaderValue::from_str(value)
                .map_err(|e| ClientError::Config(format!("node {}: {}", name, e)))
        };

        let mut headers = HeaderMap::new();
        headers.insert(AUTHORIZATION, header(password)?);
        headers.insert(HeaderName::from_static("user-id"), header(user_id)?);
        headers.insert(HeaderName::from_static("client-name"), header(client_name)?);

        let (outbound, outbound_rx) = mpsc::channel(OUTBOUND_CAPACITY);
        let (state, _) = watch::channel(ConnectionState::Disconnected);

        Ok(Self {
            name,
            url,
            headers,
            policy,
            state: Arc::new(state),
            outbound,
            inbound,
            driver: Mutex::new(Some(Driver::Idle(outbound_rx))),
            cancel: StdMutex::new(CancellationToken::new()),
        })
    }

    pub fn state(&self) -> ConnectionState {
        *self.state.borrow()
    }

    pub fn watch_state(&self) -> watch::Receiver<ConnectionState> {
        self.state.subscribe()
    }

    /// Starts the connection task and waits for the outcome of its first attempt.
    ///
    /// On failure the error is returned but the task keeps retrying in the background,
    /// so a node that comes up later still gets picked up.
    pub async fn connect(&self) -> Result<()> {
        let mut driver = self.driver.lock().await;
        let outbound_rx = match driver.take() {
            Some(Driver::Running(handle)) if !handle.is_finished() => {
                *driver = Some(Driver::Running(handle));
                drop(driver);
                return self.wait_first_attempt().await;
            }
            Some(Driver::Running(handle)) => handle
                .await
                .map_err(|e| ClientError::Transport(format!("{}: {}", self.name, e)))?,
            Some(Driver::Idle(rx)) => rx,
            None => return Err(ClientError::Transport(format!("{}: outbound queue lost", self.name))),
        };

        let cancel = CancellationToken::new();
        *self.cancel.lock().unwrap_or_else(PoisonError::into_inner) = cancel.clone();
        self.state.send_replace(ConnectionState::Connecting);

        let link = Link {
            name: self.name.clone(),
            url: self.url.clone(),
            headers: self.headers.clone(),
            backoff: Backoff::new(self.policy),
            state: self.state.clone(),
            inbound: self.inbound.clone(),
        };
        *driver = Some(Driver::Running(tokio::spawn(link.run(outbound_rx, cancel))));
        drop(driver);

        self.wait_first_attempt().await
    }

    async fn wait_first_attempt(&self) -> Result<()> {
        let mut state = self.state.subscribe();
        let settled = state
            .wait_for(|s| *s != ConnectionState::Connecting)
            .await
            .map(|s| *s)
            .map_err(|_| ClientError::Transport(format!("{}: state channel closed", self.name)))?;

        match settled {
            ConnectionState::Connected => Ok(()),
            other => Err(ClientError::Transport(format!(
                "{}: first connection attempt failed ({:?})",
                self.name, other
            ))),
        }
    }

    /// Queues a text frame. Returns once it is queued, not once it is written.
    pub async fn send(&self, frame: String) -> Result<()> {
        self.outbound
            .send(frame)
            .await
            .map_err(|_| ClientError::Transport(format!("{}: outbound queue closed", self.name)))
    }

    /// Stops retrying, closes the socket and leaves the transport `Disconnected`.
    /// A later [`connect`](Transport::connect) starts over.
    pub async fn close(&self) {
        self.cancel.lock().unwrap_or_else(PoisonError::into_inner).cancel();

        let mut driver = self.driver.lock().await;
        if let Some(Driver::Running(handle)) = driver.take() {
            match handle.await {
                Ok(rx) => *driver = Some(Driver::Idle(rx)),
                Err(e) => error!("node {}: connection task ended abnormally: {}", self.name, e),
            }
        }
        self.state.send_replace(ConnectionState::Disconnected);
    }
}

impl Drop for Transport {
    fn drop(&mut self) {
        self.cancel.lock().unwrap_or_else(PoisonError::into_inner).cancel();
    }
}

#[cfg(test)]
impl Transport {
    /// Takes the outbound queue so tests can read frames without a socket.
    pub(crate) async fn detach(&self) -> mpsc::Receiver<String> {
        match self.driver.lock().await.take() {
            Some(Driver::Idle(rx)) => rx,
            _ => panic!("transport already running"),
        }
    }

    pub(crate) fn force_state(&self, state: ConnectionState) {
        self.state.send_replace(state);
    }

    pub(crate) fn inbound(&self) -> mpsc::Sender<IncomingFrame> {
        self.inbound.clone()
    }
}

enum SessionEnd {
    Cancelled,
    Lost(String),
}

/// Everything the connection task needs, detached from the [`Transport`] handle.
struct Link {
    name: String,
    url: Url,
    headers: HeaderMap,
    backoff: Backoff,
    state: Arc<watch::Sender<ConnectionState>>,
    inbound: mpsc::Sender<IncomingFrame>,
}

impl Link {
    async fn run(
        self,
        mut outbound: mpsc::Receiver<String>,
        cancel: CancellationToken,
    ) -> mpsc::Receiver<String> {
        let mut retries: u32 = 0;
        let mut unsent: Option<String> = None;

        loop {
            let attempt = tokio::select! {
                _ = cancel.cancelled() => break,
                attempt = self.open() => attempt,
            };

            match attempt {
                Ok(stream) => {
                    retries = 0;
                    self.state.send_replace(ConnectionState::Connected);
                    info!("node {}: connected to {}", self.name, self.url);

                    match self.pump(stream, &mut outbound, &mut unsent, &cancel).await {
                        SessionEnd::Cancelled => break,
                        SessionEnd::Lost(reason) => {
                            warn!("node {}: connection lost: {}", self.name, reason)
                        }
                    }
                }
                Err(e) => warn!("node {}: connection attempt failed: {}", self.name, e),
            }

            if self.backoff.exhausted(retries) {
                error!("node {}: giving up after {} retries", self.name, retries);
                self.state.send_replace(ConnectionState::Failed);
                return outbound;
            }

            self.state.send_replace(ConnectionState::Reconnecting);
            let delay = self.backoff.delay(retries);
            retries += 1;
            debug!("node {}: retry {} in {:?}", self.name, retries, delay);

            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = tokio::time::sleep(delay) => {}
            }
        }

        self.state.send_replace(ConnectionState::Disconnected);
        info!("node {}: closed", self.name);
        outbound
    }

    async fn open(&self) -> Result<WsStream> {
        let mut request = self.url.as_str().into_client_request()?;
        request.headers_mut().extend(self.headers.clone());
        let (stream, _) = connect_async(request).await?;
        Ok(stream)
    }

    async fn pump(
        &self,
        stream: WsStream,
        outbound: &mut mpsc::Receiver<String>,
        unsent: &mut Option<String>,
        cancel: &CancellationToken,
    ) -> SessionEnd {
        let (mut write, mut read) = stream.split();

        if let Some(frame) = unsent.take() {
            if let Err(e) = write.send(WsMessage::Text(frame.clone().into())).await {
                *unsent = Some(frame);
                return SessionEnd::Lost(e.to_string());
            }
        }

        loop {
            tokio::select! {
                _ = cancel.cancelled() => {
                    let _ = write.send(WsMessage::Close(None)).await;
                    return SessionEnd::Cancelled;
                }
                frame = outbound.recv() => match frame {
                    Some(frame) => {
                        if let Err(e) = write.send(WsMessage::Text(frame.clone().into())).await {
                            *unsent = Some(frame);
                            return SessionEnd::Lost(e.to_string());
                        }
                    }
                    None => return SessionEnd::Cancelled,
                },
                message = read.next() => match message {
                    Some(Ok(WsMessage::Text(text))) => self.dispatch(text.as_str()).await,
                    Some(Ok(WsMessage::Close(frame))) => {
                        return SessionEnd::Lost(format!("closed by node: {:?}", frame));
                    }
                    Some(Ok(_)) => {}
                    Some(Err(e)) => return SessionEnd::Lost(e.to_string()),
                    None => return SessionEnd::Lost("stream ended".into()),
                },
            }
        }
    }

    async fn dispatch(&self, text: &str) {
        match serde_json::from_str::<IncomingFrame>(text) {
            Ok(frame) => {
                if self.inbound.send(frame).await.is_err() {
                    debug!("node {}: router gone, dropping frame", self.name);
                }
            }
            Err(e) => warn!("node {}: dropping undecodable frame ({}): {}", self.name, e, text),
        }
    }
}
