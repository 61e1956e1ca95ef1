//! The comm registry: bidirectional named channels layered on top of the
//! shell/iopub traffic, used for widgets and other out-of-band kernel
//! extensions.
//!
//! A comm can be opened by either side. Client-initiated opens go through
//! [`CommRegistry::connect_to_comm`] and are assumed to succeed immediately
//! (the kernel doesn't reply to `comm_open`). Server-initiated opens go
//! through [`CommRegistry::dispatch_comm_open`], which resolves a target
//! handler — possibly asynchronously, via a host module loader — before
//! handing the kernel a usable [`Comm`]. Any `comm_msg`/`comm_close` frames
//! that arrive for a comm_id still being resolved are buffered in order and
//! replayed once resolution finishes, so a slow target never sees its
//! traffic reordered or dropped.

use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

use bytes::Bytes;
use dashmap::DashMap;
use serde_json::{Map, Value};
use tokio::sync::{mpsc, Mutex};
use uuid::Uuid;

use crate::error::Error;
use crate::protocol::{CommClose, CommMsg, CommOpen, KernelMessage};

/// A payload the comm registry asks its transport to send to the kernel.
#[derive(Debug, Clone)]
pub enum OutgoingComm {
    /// A client-initiated `comm_open`.
    Open {
        /// The new comm's id.
        comm_id: String,
        /// The target name the kernel should route this comm to.
        target_name: String,
        /// Initial data.
        data: Map<String, Value>,
    },
    /// A `comm_msg` on an already-open comm.
    Msg {
        /// The comm being messaged.
        comm_id: String,
        /// Message data.
        data: Map<String, Value>,
        /// Binary buffers accompanying the message.
        buffers: Vec<Bytes>,
    },
    /// A `comm_close`.
    Close {
        /// The comm being closed.
        comm_id: String,
        /// Final data.
        data: Map<String, Value>,
    },
}

/// Sends comm traffic out over the kernel's channels. The engine implements
/// this by wrapping its managed socket and session id.
pub trait CommTransport: Send + Sync {
    /// Send a comm payload to the kernel.
    fn send(&self, payload: OutgoingComm);
}

/// An event delivered to an open comm.
#[derive(Debug, Clone)]
pub enum CommEvent {
    /// A `comm_msg`.
    Msg {
        /// Message data.
        data: Map<String, Value>,
        /// Accompanying binary buffers.
        buffers: Vec<Bytes>,
    },
    /// A `comm_close`. No further events follow.
    Close {
        /// Final data.
        data: Map<String, Value>,
    },
}

/// Handler invoked once a server-initiated `comm_open`'s target resolves.
/// Receives the new comm and the `data` carried on the open message.
pub type CommTargetHandler = Arc<dyn Fn(Comm, Map<String, Value>) + Send + Sync>;

/// Async fallback used to resolve a target with no locally registered
/// handler, mirroring a host environment that can load comm targets from
/// extension modules on demand. Only consulted when the incoming
/// `comm_open` carries a `target_module`; receives `(target_module,
/// target_name)` and is expected to load the module and extract the
/// handler registered under `target_name`.
pub type HostModuleLoader = Arc<
    dyn Fn(String, String) -> Pin<Box<dyn Future<Output = Option<CommTargetHandler>> + Send>>
        + Send
        + Sync,
>;

enum CommSlot {
    Pending(Vec<CommEvent>),
    Open(mpsc::UnboundedSender<CommEvent>),
}

/// Tracks open and pending comms and the registered targets that can accept
/// server-initiated opens.
#[derive(Clone)]
pub struct CommRegistry {
    targets: Arc<DashMap<String, CommTargetHandler>>,
    slots: Arc<DashMap<String, CommSlot>>,
    host_loader: Arc<Mutex<Option<HostModuleLoader>>>,
    transport: Arc<dyn CommTransport>,
}

impl CommRegistry {
    /// Build a registry that sends outgoing comm traffic through `transport`.
    pub fn new(transport: Arc<dyn CommTransport>) -> Self {
        CommRegistry {
            targets: Arc::new(DashMap::new()),
            slots: Arc::new(DashMap::new()),
            host_loader: Arc::new(Mutex::new(None)),
            transport,
        }
    }

    /// Register a handler that accepts server-initiated opens for `name`.
    pub fn register_target(&self, name: impl Into<String>, handler: CommTargetHandler) {
        self.targets.insert(name.into(), handler);
    }

    /// Remove a previously registered target.
    pub fn unregister_target(&self, name: &str) {
        self.targets.remove(name);
    }

    /// Install a fallback resolver consulted when a server-initiated
    /// `comm_open` names a target with no local handler.
    pub async fn set_target_loader(&self, loader: HostModuleLoader) {
        *self.host_loader.lock().await = Some(loader);
    }

    /// Open a comm from the client side. Jupyter's protocol doesn't reply
    /// to `comm_open`, so the comm is considered open as soon as the
    /// message is handed to the transport.
    pub fn connect_to_comm(&self, target_name: impl Into<String>, data: Map<String, Value>) -> Comm {
        let comm_id = Uuid::new_v4().to_string();
        let target_name = target_name.into();
        let (tx, rx) = mpsc::unbounded_channel();
        self.slots.insert(comm_id.clone(), CommSlot::Open(tx));

        self.transport.send(OutgoingComm::Open {
            comm_id: comm_id.clone(),
            target_name: target_name.clone(),
            data,
        });

        Comm {
            comm_id,
            target_name,
            transport: self.transport.clone(),
            events_rx: Mutex::new(rx),
        }
    }

    /// Handle a server-initiated `comm_open`.
    pub async fn dispatch_comm_open(&self, msg: &KernelMessage) -> Result<(), Error> {
        let content: CommOpen = serde_json::from_value(msg.content.clone())
            .map_err(|err| Error::MalformedModel(err.to_string()))?;
        let comm_id = content.comm_id.clone();

        // Any comm_msg/comm_close that races with resolution buffers here.
        self.slots.insert(comm_id.clone(), CommSlot::Pending(Vec::new()));

        let handler = self
            .targets
            .get(&content.target_name)
            .map(|entry| entry.clone());
        let handler = match handler {
            Some(handler) => Some(handler),
            None => match &content.target_module {
                Some(target_module) => {
                    self.resolve_via_loader(target_module, &content.target_name).await
                }
                None => None,
            },
        };

        let Some(handler) = handler else {
            self.slots.remove(&comm_id);
            return Err(Error::CommTargetNotFound(content.target_name));
        };

        let (tx, rx) = mpsc::unbounded_channel();
        let buffered = match self.slots.insert(comm_id.clone(), CommSlot::Open(tx.clone())) {
            Some(CommSlot::Pending(events)) => events,
            _ => Vec::new(),
        };
        for event in buffered {
            let _ = tx.send(event);
        }

        let comm = Comm {
            comm_id,
            target_name: content.target_name,
            transport: self.transport.clone(),
            events_rx: Mutex::new(rx),
        };
        handler(comm, content.data);
        Ok(())
    }

    /// Route an inbound `comm_msg` to its comm, buffering it if the comm is
    /// still mid-resolution.
    pub fn dispatch_comm_msg(&self, msg: &KernelMessage) {
        let Ok(content) = serde_json::from_value::<CommMsg>(msg.content.clone()) else {
            return;
        };
        self.route_event(
            &content.comm_id,
            CommEvent::Msg {
                data: content.data,
                buffers: msg.buffers.clone(),
            },
        );
    }

    /// Route an inbound `comm_close`, then drop the slot: no further events
    /// can legally follow a close.
    pub fn dispatch_comm_close(&self, msg: &KernelMessage) {
        let Ok(content) = serde_json::from_value::<CommClose>(msg.content.clone()) else {
            return;
        };
        self.route_event(&content.comm_id, CommEvent::Close { data: content.data });
        self.slots.remove(&content.comm_id);
    }

    fn route_event(&self, comm_id: &str, event: CommEvent) {
        match self.slots.get_mut(comm_id) {
            Some(mut slot) => match &mut *slot {
                CommSlot::Open(tx) => {
                    let _ = tx.send(event);
                }
                CommSlot::Pending(buffered) => buffered.push(event),
            },
            None => {} // unknown comm_id: nothing to route to, drop silently
        }
    }

    async fn resolve_via_loader(&self, target_module: &str, target_name: &str) -> Option<CommTargetHandler> {
        let loader = self.host_loader.lock().await.clone()?;
        loader(target_module.to_string(), target_name.to_string()).await
    }

    /// Number of comms currently open or pending resolution.
    pub fn len(&self) -> usize {
        self.slots.len()
    }

    /// Whether no comms are open or pending.
    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }
}

/// A bidirectional named channel to the kernel.
pub struct Comm {
    comm_id: String,
    target_name: String,
    transport: Arc<dyn CommTransport>,
    events_rx: Mutex<mpsc::UnboundedReceiver<CommEvent>>,
}

impl Comm {
    /// This comm's id.
    pub fn comm_id(&self) -> &str {
        &self.comm_id
    }

    /// The target name this comm was opened against.
    pub fn target_name(&self) -> &str {
        &self.target_name
    }

    /// Send a `comm_msg`.
    pub fn send(&self, data: Map<String, Value>, buffers: Vec<Bytes>) {
        self.transport.send(OutgoingComm::Msg {
            comm_id: self.comm_id.clone(),
            data,
            buffers,
        });
    }

    /// Send a `comm_close`.
    pub fn close(&self, data: Map<String, Value>) {
        self.transport.send(OutgoingComm::Close {
            comm_id: self.comm_id.clone(),
            data,
        });
    }

    /// Receive the next event for this comm, or `None` once it has closed
    /// and no further events will arrive.
    pub async fn next_event(&self) -> Option<CommEvent> {
        self.events_rx.lock().await.recv().await
    }
}
