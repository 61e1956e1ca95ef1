//! The Managed Socket: a reconnecting WebSocket with bounded exponential
//! backoff and a FIFO send queue that survives outages.
//!
//! This is deliberately a thin, protocol-agnostic layer: it moves
//! [`KernelMessage`] values across a wire, but knows nothing about futures,
//! comms, or kernel status. The kernel channel engine (§4.F) builds those
//! on top, including the "release the queue" hook described below.

use std::collections::VecDeque;
use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;

use futures_util::{SinkExt, TryStreamExt};
use std::sync::Mutex as StdMutex;

use tokio::sync::{mpsc, watch, Mutex, Notify};
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::http::header::AUTHORIZATION;
use tokio_tungstenite::tungstenite::Message;
use tokio_util::sync::{CancellationToken, DropGuard};
use tracing::{debug, info, warn};

use crate::error::Error;
use crate::protocol::codec::{self, WireFrame};
use crate::protocol::KernelMessage;

/// A boxed, error-unified sink half of the transport.
pub type BoxedSink = Pin<Box<dyn futures_util::Sink<Message, Error = Error> + Send>>;
/// A boxed, error-unified stream half of the transport.
pub type BoxedStream = futures_util::stream::BoxStream<'static, Result<Message, Error>>;

/// Opens the duplex transport the managed socket drives. The production
/// implementation is [`TungsteniteFactory`]; tests substitute an in-memory
/// pair so reconnect/backoff/flush behavior can be exercised without a real
/// network socket.
pub trait SocketFactory: Send + Sync {
    /// Open a connection to `url`, optionally carrying a bearer token.
    fn connect<'a>(
        &'a self,
        url: &'a str,
        token: Option<&'a str>,
    ) -> Pin<Box<dyn Future<Output = Result<(BoxedSink, BoxedStream), Error>> + Send + 'a>>;
}

/// Production [`SocketFactory`] backed by `tokio-tungstenite`.
pub struct TungsteniteFactory;

impl SocketFactory for TungsteniteFactory {
    fn connect<'a>(
        &'a self,
        url: &'a str,
        token: Option<&'a str>,
    ) -> Pin<Box<dyn Future<Output = Result<(BoxedSink, BoxedStream), Error>> + Send + 'a>> {
        Box::pin(async move {
            let mut req = url
                .into_client_request()
                .map_err(|err| Error::KernelConnect(err.to_string()))?;
            if let Some(token) = token {
                let value = format!("token {token}")
                    .parse()
                    .map_err(|err: tokio_tungstenite::tungstenite::http::header::InvalidHeaderValue| {
                        Error::KernelConnect(err.to_string())
                    })?;
                req.headers_mut().insert(AUTHORIZATION, value);
            }
            let (ws, _response) = tokio_tungstenite::connect_async(req).await?;
            let (sink, stream) = futures_util::StreamExt::split(ws);
            let sink = sink.sink_map_err(Error::from);
            let stream = stream.map_err(Error::from);
            Ok((
                Box::pin(sink) as BoxedSink,
                Box::pin(stream) as BoxedStream,
            ))
        })
    }
}

/// Connection tri-state, plus the terminal `Dead` state reached once the
/// reconnection budget is exhausted.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SocketState {
    /// No connection attempt is in flight and none has succeeded yet.
    Closed,
    /// A connection attempt (initial or after backoff) is in flight.
    Connecting,
    /// The transport is connected. Outgoing sends remain queued until the
    /// kernel engine calls [`ManagedSocket::release_queue`].
    Open,
    /// The previous connection dropped and a retry is scheduled.
    Reconnecting,
    /// The reconnection budget was exhausted; this socket will not retry
    /// again.
    Dead,
}

/// Configuration for a managed socket connection.
#[derive(Debug, Clone)]
pub struct ManagedSocketConfig {
    /// Full WebSocket URL, including the `session_id` query parameter.
    pub url: String,
    /// Bearer token, sent as `Authorization: token {tok}`.
    pub token: Option<String>,
    /// Maximum number of consecutive reconnect attempts before giving up.
    /// Backoff is `2^attempt` seconds, so the default of 7 caps the wait at
    /// 64 seconds between attempts.
    pub reconnect_limit: u32,
}

impl Default for ManagedSocketConfig {
    fn default() -> Self {
        ManagedSocketConfig {
            url: String::new(),
            token: None,
            reconnect_limit: 7,
        }
    }
}

struct Shared {
    queue: StdMutex<VecDeque<KernelMessage>>,
    gate_open: AtomicBool,
    wake: Notify,
    status: watch::Sender<SocketState>,
    attempts: AtomicU32,
}

/// A reconnecting WebSocket carrying [`KernelMessage`] frames.
pub struct ManagedSocket {
    shared: Arc<Shared>,
    inbound_rx: Mutex<mpsc::UnboundedReceiver<KernelMessage>>,
    status_rx: watch::Receiver<SocketState>,
    cancel: CancellationToken,
    _drop_guard: Arc<DropGuard>,
}

impl ManagedSocket {
    /// Start connecting and return a handle immediately; connection
    /// happens in the background.
    pub fn connect(factory: Arc<dyn SocketFactory>, config: ManagedSocketConfig) -> Self {
        let (inbound_tx, inbound_rx) = mpsc::unbounded_channel();
        let (status_tx, status_rx) = watch::channel(SocketState::Closed);
        let cancel = CancellationToken::new();

        let shared = Arc::new(Shared {
            queue: StdMutex::new(VecDeque::new()),
            gate_open: AtomicBool::new(false),
            wake: Notify::new(),
            status: status_tx,
            attempts: AtomicU32::new(0),
        });

        tokio::spawn(run(
            factory,
            config,
            shared.clone(),
            inbound_tx,
            cancel.clone(),
        ));

        ManagedSocket {
            shared,
            inbound_rx: Mutex::new(inbound_rx),
            status_rx,
            cancel: cancel.clone(),
            _drop_guard: Arc::new(cancel.drop_guard()),
        }
    }

    /// Enqueue a message for delivery. Never blocks on I/O and never fails
    /// synchronously; if the socket is dead the message simply sits in the
    /// queue forever (the engine is responsible for checking status before
    /// calling this).
    ///
    /// The push happens synchronously, on the caller's own stack, so two
    /// back-to-back calls from the same caller are guaranteed to land on
    /// the queue in call order — `tokio::spawn`-ing the push would leave
    /// that order to the scheduler.
    pub fn send(&self, msg: KernelMessage) {
        self.shared.queue.lock().unwrap().push_back(msg);
        self.shared.wake.notify_one();
    }

    /// Allow the FIFO queue to start (or resume) draining. The kernel
    /// engine calls this on the first post-(re)connect status iopub
    /// message whose `execution_state` is `starting`, `idle`, or `busy`
    /// (§4.C, §9 open question, resolved in favor of status-gated flush).
    pub fn release_queue(&self) {
        self.shared.gate_open.store(true, Ordering::SeqCst);
        self.shared.wake.notify_one();
    }

    /// Receive the next inbound message, or `None` once the socket has
    /// permanently closed.
    pub async fn recv(&self) -> Option<KernelMessage> {
        self.inbound_rx.lock().await.recv().await
    }

    /// The current connection state.
    pub fn state(&self) -> SocketState {
        *self.status_rx.borrow()
    }

    /// A receiver that observes every state transition.
    pub fn watch_state(&self) -> watch::Receiver<SocketState> {
        self.status_rx.clone()
    }

    /// Tear down the connection and stop retrying.
    pub fn close(&self) {
        self.cancel.cancel();
        let _ = self.shared.status.send(SocketState::Closed);
    }
}

async fn run(
    factory: Arc<dyn SocketFactory>,
    config: ManagedSocketConfig,
    shared: Arc<Shared>,
    inbound_tx: mpsc::UnboundedSender<KernelMessage>,
    cancel: CancellationToken,
) {
    loop {
        if cancel.is_cancelled() {
            return;
        }

        let attempt = shared.attempts.load(Ordering::SeqCst);
        let _ = shared.status.send(if attempt == 0 {
            SocketState::Connecting
        } else {
            SocketState::Reconnecting
        });

        match factory.connect(&config.url, config.token.as_deref()).await {
            Ok((sink, stream)) => {
                shared.attempts.store(0, Ordering::SeqCst);
                shared.gate_open.store(false, Ordering::SeqCst);
                let _ = shared.status.send(SocketState::Open);
                info!(url = %config.url, "kernel socket connected");

                let outcome = run_connection(sink, stream, &shared, &inbound_tx, &cancel).await;
                if cancel.is_cancelled() {
                    return;
                }
                if let Err(err) = outcome {
                    warn!(%err, "kernel socket connection dropped");
                }
            }
            Err(err) => {
                warn!(%err, attempt, "failed to open kernel socket");
            }
        }

        let attempt = shared.attempts.load(Ordering::SeqCst);
        if attempt >= config.reconnect_limit {
            let _ = shared.status.send(SocketState::Dead);
            info!("reconnection budget exhausted, kernel socket is dead");
            return;
        }

        let delay = Duration::from_secs(1u64 << attempt.min(20));
        debug!(?delay, attempt, "scheduling reconnect");
        tokio::select! {
            _ = tokio::time::sleep(delay) => {}
            _ = cancel.cancelled() => return,
        }
        shared.attempts.store(attempt + 1, Ordering::SeqCst);
    }
}

async fn run_connection(
    mut sink: BoxedSink,
    mut stream: BoxedStream,
    shared: &Arc<Shared>,
    inbound_tx: &mpsc::UnboundedSender<KernelMessage>,
    cancel: &CancellationToken,
) -> Result<(), Error> {
    // Drain anything already queued in case the gate was left open from a
    // previous connection generation before we reset it in `run`.
    loop {
        tokio::select! {
            _ = shared.wake.notified() => {
                drain(&mut sink, shared).await?;
            }
            next = futures_util::TryStreamExt::try_next(&mut stream) => {
                match next? {
                    Some(Message::Text(text)) => handle_frame(WireFrame::Text(text), inbound_tx),
                    Some(Message::Binary(bytes)) => handle_frame(WireFrame::Binary(bytes), inbound_tx),
                    Some(Message::Close(_)) | None => {
                        return Err(Error::KernelConnect("socket closed by peer".into()))
                    }
                    Some(_) => {} // ping/pong frames, nothing to route
                }
            }
            _ = cancel.cancelled() => return Ok(()),
        }
    }
}

async fn drain(sink: &mut BoxedSink, shared: &Arc<Shared>) -> Result<(), Error> {
    loop {
        if !shared.gate_open.load(Ordering::SeqCst) {
            return Ok(());
        }
        let next = {
            let queue = shared.queue.lock().unwrap();
            queue.front().cloned()
        };
        let Some(msg) = next else {
            return Ok(());
        };
        let frame = codec::encode(&msg)?;
        let wire = match frame {
            WireFrame::Text(text) => Message::Text(text),
            WireFrame::Binary(bytes) => Message::Binary(bytes),
        };
        // The message is only popped after the send returns successfully,
        // so a failed send leaves it at the head of the queue for retry on
        // the next connection.
        sink.send(wire).await?;
        shared.queue.lock().unwrap().pop_front();
    }
}

fn handle_frame(frame: WireFrame, inbound_tx: &mpsc::UnboundedSender<KernelMessage>) {
    match codec::decode(frame) {
        Ok(msg) => match crate::protocol::validator::validate(&msg) {
            Ok(()) => {
                let _ = inbound_tx.send(msg);
            }
            Err(err) => warn!(%err, "dropping invalid kernel message"),
        },
        Err(err) => warn!(%err, "dropping malformed kernel frame"),
    }
}
