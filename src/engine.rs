//! The kernel channel engine: the top-level coordinator that owns a
//! kernel's managed socket, correlates its shell/control replies through
//! the future registry, and routes its comm traffic through the comm
//! registry.
//!
//! One engine talks to exactly one kernel, at
//! `{wsUrl}/api/kernels/{id}/channels?session_id={clientId}`. Status
//! starts `Unknown` and only ever moves forward to `Dead`, which is
//! absorbing: once a kernel is declared dead, nothing moves it out of that
//! state short of constructing a brand new engine.

use std::sync::Arc;

use serde::{de::DeserializeOwned, Serialize};
use serde_json::{Map, Value};
use time::OffsetDateTime;
use tokio::sync::{broadcast, watch, OnceCell};
use tokio_util::sync::{CancellationToken, DropGuard};
use tracing::warn;
use uuid::Uuid;

use crate::comm::{Comm, CommRegistry, CommTargetHandler, CommTransport, OutgoingComm};
use crate::config::ClientConfig;
use crate::error::Error;
use crate::future::{FutureRegistry, KernelFuture};
use crate::kernelspec::KernelSpec;
use crate::protocol::{
    Channel, CommClose, CommInfoReply, CommInfoRequest, CommMsg, CommOpen, CompleteReply,
    CompleteRequest, ExecuteReply, ExecuteRequest, HistoryReply, HistoryRequest, InputReply,
    InspectReply, InspectRequest, InterruptReply, InterruptRequest, IoPubExecutionState,
    IsCompleteReply, IsCompleteRequest, KernelHeader, KernelInfoReply, KernelInfoRequest,
    KernelMessage, KernelMessageType, Reply, ShutdownReply, ShutdownRequest, StatusContent,
};
use crate::rest::JupyterRestClient;
use crate::socket::{ManagedSocket, ManagedSocketConfig, SocketFactory, SocketState};

/// The kernel's observed lifecycle state. `Dead` is absorbing: once
/// reached, [`KernelChannelEngine::status`] never reports anything else
/// for that engine instance again.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KernelStatus {
    /// No status has been observed yet.
    Unknown,
    /// The kernel process is starting up.
    Starting,
    /// The kernel is idle, ready to execute.
    Idle,
    /// The kernel is busy executing.
    Busy,
    /// The kernel is restarting.
    Restarting,
    /// The managed socket dropped and is retrying with backoff.
    Reconnecting,
    /// The kernel is gone: either it reported `dead`, or the socket
    /// exhausted its reconnection budget.
    Dead,
}

/// A running execution, giving access to its streamed iopub output as well
/// as its eventual shell reply.
pub struct ExecuteHandle {
    future: KernelFuture,
}

impl ExecuteHandle {
    /// The `msg_id` of the underlying `execute_request`.
    pub fn msg_id(&self) -> &str {
        self.future.msg_id()
    }

    /// Receive the next iopub message produced by this execution (stream,
    /// execute_input, display_data, execute_result, error, ...), or `None`
    /// once the kernel has gone idle and no more will arrive.
    pub async fn next_iopub(&mut self) -> Option<KernelMessage> {
        self.future.next_iopub().await
    }

    /// Receive the next stdin `input_request` raised by this execution.
    pub async fn next_stdin(&mut self) -> Option<KernelMessage> {
        self.future.next_stdin().await
    }

    /// Wait for the `execute_reply`.
    pub async fn reply(&mut self) -> Result<Reply<ExecuteReply>, Error> {
        decode_reply(self.future.reply().await?)
    }
}

struct EngineCommTransport {
    socket: Arc<ManagedSocket>,
    client_id: String,
    username: String,
}

impl CommTransport for EngineCommTransport {
    fn send(&self, payload: OutgoingComm) {
        let (msg_type, content, buffers) = match payload {
            OutgoingComm::Open {
                comm_id,
                target_name,
                data,
            } => (
                KernelMessageType::CommOpen,
                serde_json::to_value(CommOpen {
                    comm_id,
                    target_name,
                    data,
                    target_module: None,
                })
                .expect("comm_open content"),
                Vec::new(),
            ),
            OutgoingComm::Msg {
                comm_id,
                data,
                buffers,
            } => (
                KernelMessageType::CommMsg,
                serde_json::to_value(CommMsg { comm_id, data }).expect("comm_msg content"),
                buffers,
            ),
            OutgoingComm::Close { comm_id, data } => (
                KernelMessageType::CommClose,
                serde_json::to_value(CommClose { comm_id, data }).expect("comm_close content"),
                Vec::new(),
            ),
        };
        let msg = KernelMessage {
            header: fresh_header(msg_type, &self.client_id, &self.username),
            parent_header: None,
            channel: Channel::Shell,
            metadata: Map::new(),
            content,
            buffers,
        };
        self.socket.send(msg);
    }
}

fn fresh_header(msg_type: KernelMessageType, session: &str, username: &str) -> KernelHeader {
    KernelHeader {
        msg_id: Uuid::new_v4().to_string(),
        session: session.to_string(),
        username: username.to_string(),
        date: OffsetDateTime::now_utc(),
        msg_type,
        version: "5.4".into(),
    }
}

/// Parse a reply body as `Reply<T>`. Only `execute_reply` is guaranteed to
/// carry a `status` field on the wire; other reply types are tolerated
/// with or without one, defaulting to `Ok` when absent.
fn decode_reply<T: DeserializeOwned>(msg: KernelMessage) -> Result<Reply<T>, Error> {
    if msg.content.get("status").is_some() {
        serde_json::from_value(msg.content).map_err(|err| Error::MalformedModel(err.to_string()))
    } else {
        serde_json::from_value::<T>(msg.content)
            .map(Reply::Ok)
            .map_err(|err| Error::MalformedModel(err.to_string()))
    }
}

struct EngineInner {
    socket: Arc<ManagedSocket>,
    futures: FutureRegistry,
    comms: CommRegistry,
    rest: JupyterRestClient,
    config: ClientConfig,
    kernel_id: String,
    kernel_name: String,
    status_tx: watch::Sender<KernelStatus>,
    status_rx: watch::Receiver<KernelStatus>,
    iopub_tx: broadcast::Sender<KernelMessage>,
    unhandled_tx: broadcast::Sender<KernelMessage>,
    spec_cache: OnceCell<KernelSpec>,
}

impl EngineInner {
    fn build_message<T: Serialize>(&self, channel: Channel, msg_type: KernelMessageType, content: T) -> KernelMessage {
        KernelMessage {
            header: fresh_header(msg_type, &self.config.client_id, &self.config.username),
            parent_header: None,
            channel,
            metadata: Map::new(),
            content: serde_json::to_value(content).expect("engine message content"),
            buffers: Vec::new(),
        }
    }

    fn build_message_with_parent<T: Serialize>(
        &self,
        channel: Channel,
        msg_type: KernelMessageType,
        content: T,
        parent: KernelHeader,
    ) -> KernelMessage {
        let mut msg = self.build_message(channel, msg_type, content);
        msg.parent_header = Some(parent);
        msg
    }

    fn set_status(&self, status: KernelStatus) {
        if *self.status_rx.borrow() == KernelStatus::Dead {
            return;
        }
        let _ = self.status_tx.send(status);
    }

    fn handle_status(self: &Arc<Self>, msg: &KernelMessage) {
        let Ok(content) = serde_json::from_value::<StatusContent>(msg.content.clone()) else {
            return;
        };
        let mapped = match content.execution_state {
            IoPubExecutionState::Starting => KernelStatus::Starting,
            IoPubExecutionState::Idle => KernelStatus::Idle,
            IoPubExecutionState::Busy => KernelStatus::Busy,
            IoPubExecutionState::Restarting => KernelStatus::Restarting,
            IoPubExecutionState::Dead => KernelStatus::Dead,
        };
        self.set_status(mapped);
        if matches!(
            mapped,
            KernelStatus::Starting | KernelStatus::Idle | KernelStatus::Busy
        ) {
            self.socket.release_queue();
        }
        if mapped == KernelStatus::Dead {
            self.futures.reject_all();
        }
    }

    fn handle_inbound(self: &Arc<Self>, msg: KernelMessage) {
        match msg.channel {
            Channel::Shell | Channel::Control => {
                if !self.futures.dispatch_reply(&msg) {
                    let _ = self.unhandled_tx.send(msg);
                }
            }
            Channel::IoPub => {
                if msg.header.msg_type == KernelMessageType::Status {
                    self.handle_status(&msg);
                }
                let is_comm = matches!(
                    msg.header.msg_type,
                    KernelMessageType::CommOpen
                        | KernelMessageType::CommMsg
                        | KernelMessageType::CommClose
                );
                match msg.header.msg_type {
                    KernelMessageType::CommOpen => {
                        let comms = self.comms.clone();
                        let opened = msg.clone();
                        tokio::spawn(async move {
                            if let Err(err) = comms.dispatch_comm_open(&opened).await {
                                warn!(%err, "unresolved comm target");
                            }
                        });
                    }
                    KernelMessageType::CommMsg => self.comms.dispatch_comm_msg(&msg),
                    KernelMessageType::CommClose => self.comms.dispatch_comm_close(&msg),
                    _ => {}
                }
                let handled = self.futures.dispatch_iopub(&msg);
                let is_status = msg.header.msg_type == KernelMessageType::Status;
                let _ = self.iopub_tx.send(msg.clone());
                if !handled && !is_status && !is_comm {
                    let _ = self.unhandled_tx.send(msg);
                }
            }
            Channel::Stdin => {
                if !self.futures.dispatch_stdin(&msg) {
                    let _ = self.unhandled_tx.send(msg);
                }
            }
        }
    }
}

async fn run_dispatch(inner: Arc<EngineInner>, cancel: CancellationToken) {
    loop {
        tokio::select! {
            msg = inner.socket.recv() => {
                match msg {
                    Some(msg) => inner.handle_inbound(msg),
                    None => return,
                }
            }
            _ = cancel.cancelled() => return,
        }
    }
}

async fn run_status_watch(inner: Arc<EngineInner>, cancel: CancellationToken) {
    let mut socket_status = inner.socket.watch_state();
    loop {
        tokio::select! {
            changed = socket_status.changed() => {
                if changed.is_err() {
                    return;
                }
                match *socket_status.borrow() {
                    SocketState::Reconnecting => inner.set_status(KernelStatus::Reconnecting),
                    SocketState::Dead => {
                        inner.set_status(KernelStatus::Dead);
                        inner.futures.reject_all();
                    }
                    _ => {}
                }
            }
            _ = cancel.cancelled() => return,
        }
    }
}

/// Coordinates one kernel's shell/iopub/stdin/control traffic end to end.
#[derive(Clone)]
pub struct KernelChannelEngine {
    inner: Arc<EngineInner>,
    _drop_guard: Arc<DropGuard>,
}

impl KernelChannelEngine {
    /// Connect to the kernel identified by `kernel_id`, started from the
    /// kernelspec named `kernel_name`. Sends a `kernel_info_request`
    /// immediately; its reply is not awaited here (construction can't
    /// fail on a slow kernel), just dispatched like any other request.
    pub fn new(
        factory: Arc<dyn SocketFactory>,
        rest: JupyterRestClient,
        config: ClientConfig,
        kernel_id: impl Into<String>,
        kernel_name: impl Into<String>,
    ) -> Self {
        let kernel_id = kernel_id.into();
        let kernel_name = kernel_name.into();
        let url = format!(
            "{}api/kernels/{}/channels?session_id={}",
            config.ws_url, kernel_id, config.client_id
        );
        let socket = Arc::new(ManagedSocket::connect(
            factory,
            ManagedSocketConfig {
                url,
                token: config.token.clone(),
                reconnect_limit: config.reconnect_limit,
            },
        ));
        let (status_tx, status_rx) = watch::channel(KernelStatus::Unknown);
        let (iopub_tx, _) = broadcast::channel(1024);
        let (unhandled_tx, _) = broadcast::channel(256);

        let transport = Arc::new(EngineCommTransport {
            socket: socket.clone(),
            client_id: config.client_id.clone(),
            username: config.username.clone(),
        });
        let comms = CommRegistry::new(transport);

        let inner = Arc::new(EngineInner {
            socket,
            futures: FutureRegistry::new(),
            comms,
            rest,
            config,
            kernel_id,
            kernel_name,
            status_tx,
            status_rx,
            iopub_tx,
            unhandled_tx,
            spec_cache: OnceCell::new(),
        });

        let cancel = CancellationToken::new();
        tokio::spawn(run_dispatch(inner.clone(), cancel.clone()));
        tokio::spawn(run_status_watch(inner.clone(), cancel.clone()));

        let engine = KernelChannelEngine {
            inner,
            _drop_guard: Arc::new(cancel.drop_guard()),
        };
        let _ = engine.send_shell_message(KernelMessageType::KernelInfoRequest, KernelInfoRequest::default());
        engine
    }

    /// The kernel id this engine is attached to.
    pub fn kernel_id(&self) -> &str {
        &self.inner.kernel_id
    }

    /// Current kernel status.
    pub fn status(&self) -> KernelStatus {
        *self.inner.status_rx.borrow()
    }

    /// A receiver that observes every status transition.
    pub fn watch_status(&self) -> watch::Receiver<KernelStatus> {
        self.inner.status_rx.clone()
    }

    /// Subscribe to every iopub message this kernel broadcasts, regardless
    /// of whether it correlates to a request this engine made.
    pub fn subscribe_iopub(&self) -> broadcast::Receiver<KernelMessage> {
        self.inner.iopub_tx.subscribe()
    }

    /// Subscribe to messages that didn't correlate to any in-flight
    /// request and weren't status or comm traffic.
    pub fn subscribe_unhandled(&self) -> broadcast::Receiver<KernelMessage> {
        self.inner.unhandled_tx.subscribe()
    }

    /// Send an arbitrary message on the shell channel and get back a
    /// handle to its reply and side traffic.
    pub fn send_shell_message<T: Serialize>(
        &self,
        msg_type: KernelMessageType,
        content: T,
    ) -> Result<KernelFuture, Error> {
        self.send_message(Channel::Shell, msg_type, content)
    }

    fn send_control_message<T: Serialize>(
        &self,
        msg_type: KernelMessageType,
        content: T,
    ) -> Result<KernelFuture, Error> {
        self.send_message(Channel::Control, msg_type, content)
    }

    fn send_message<T: Serialize>(
        &self,
        channel: Channel,
        msg_type: KernelMessageType,
        content: T,
    ) -> Result<KernelFuture, Error> {
        if self.status() == KernelStatus::Dead {
            return Err(Error::KernelDead);
        }
        let msg = self.inner.build_message(channel, msg_type, content);
        let future = self.inner.futures.register(msg.header.msg_id.clone());
        self.inner.socket.send(msg);
        Ok(future)
    }

    /// `kernel_info_request` / `kernel_info_reply`.
    pub async fn kernel_info(&self) -> Result<Reply<KernelInfoReply>, Error> {
        let mut future = self.send_shell_message(KernelMessageType::KernelInfoRequest, KernelInfoRequest::default())?;
        decode_reply(future.reply().await?)
    }

    /// `inspect_request` / `inspect_reply`.
    pub async fn inspect(&self, request: InspectRequest) -> Result<Reply<InspectReply>, Error> {
        let mut future = self.send_shell_message(KernelMessageType::InspectRequest, request)?;
        decode_reply(future.reply().await?)
    }

    /// `complete_request` / `complete_reply`.
    pub async fn complete(&self, request: CompleteRequest) -> Result<Reply<CompleteReply>, Error> {
        let mut future = self.send_shell_message(KernelMessageType::CompleteRequest, request)?;
        decode_reply(future.reply().await?)
    }

    /// `history_request` / `history_reply`.
    pub async fn history(&self, request: HistoryRequest) -> Result<Reply<HistoryReply>, Error> {
        let mut future = self.send_shell_message(KernelMessageType::HistoryRequest, request)?;
        decode_reply(future.reply().await?)
    }

    /// `is_complete_request` / `is_complete_reply`.
    pub async fn is_complete(&self, request: IsCompleteRequest) -> Result<Reply<IsCompleteReply>, Error> {
        let mut future = self.send_shell_message(KernelMessageType::IsCompleteRequest, request)?;
        decode_reply(future.reply().await?)
    }

    /// `comm_info_request` / `comm_info_reply`.
    pub async fn comm_info(&self, request: CommInfoRequest) -> Result<Reply<CommInfoReply>, Error> {
        let mut future = self.send_shell_message(KernelMessageType::CommInfoRequest, request)?;
        decode_reply(future.reply().await?)
    }

    /// Execute a block of code, returning a handle that streams iopub
    /// output as it arrives and eventually resolves to the reply.
    pub fn execute(&self, request: ExecuteRequest) -> Result<ExecuteHandle, Error> {
        let future = self.send_shell_message(KernelMessageType::ExecuteRequest, request)?;
        Ok(ExecuteHandle { future })
    }

    /// Answer a kernel's `input_request` on the stdin channel.
    pub fn send_input_reply(&self, request: &KernelMessage, value: String) -> Result<(), Error> {
        if self.status() == KernelStatus::Dead {
            return Err(Error::KernelDead);
        }
        let msg = self.inner.build_message_with_parent(
            Channel::Stdin,
            KernelMessageType::InputReply,
            InputReply { value },
            request.header.clone(),
        );
        self.inner.socket.send(msg);
        Ok(())
    }

    /// `interrupt_request` / `interrupt_reply` on the control channel.
    pub async fn interrupt(&self) -> Result<Reply<InterruptReply>, Error> {
        let mut future = self.send_control_message(KernelMessageType::InterruptRequest, InterruptRequest::default())?;
        decode_reply(future.reply().await?)
    }

    /// `shutdown_request` / `shutdown_reply` on the control channel.
    pub async fn shutdown(&self, restart: bool) -> Result<Reply<ShutdownReply>, Error> {
        let mut future =
            self.send_control_message(KernelMessageType::ShutdownRequest, ShutdownRequest { restart })?;
        decode_reply(future.reply().await?)
    }

    /// Shut down the kernel in restart mode and wait for its reply.
    pub async fn restart(&self) -> Result<Reply<ShutdownReply>, Error> {
        self.shutdown(true).await
    }

    /// Register a handler for server-initiated `comm_open`s naming this
    /// target.
    pub fn register_comm_target(&self, name: impl Into<String>, handler: CommTargetHandler) {
        self.inner.comms.register_target(name, handler);
    }

    /// Open a comm from the client side.
    pub fn connect_to_comm(&self, target_name: impl Into<String>, data: Map<String, Value>) -> Comm {
        self.inner.comms.connect_to_comm(target_name, data)
    }

    /// Fetch this kernel's spec from the server's kernelspecs endpoint,
    /// memoized for the lifetime of this engine.
    pub async fn get_spec(&self) -> Result<KernelSpec, Error> {
        let kernel_name = self.inner.kernel_name.clone();
        self.inner
            .spec_cache
            .get_or_try_init(|| async {
                let bundle = self.inner.rest.kernelspecs().await?;
                bundle
                    .kernelspecs
                    .get(&kernel_name)
                    .map(|file| file.spec.clone())
                    .ok_or_else(|| Error::MalformedModel(format!("kernelspec {kernel_name:?} not found")))
            })
            .await
            .cloned()
    }
}
