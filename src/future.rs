//! The future registry: correlates shell/control replies and iopub/stdin
//! side traffic back to the request that produced them, by `msg_id`.
//!
//! Every request sent on the shell or control channel registers a
//! [`KernelFuture`] keyed by its `msg_id`. Inbound messages whose
//! `parent_header.msg_id` matches are routed to that future; nothing else
//! in the engine needs to know about correlation at all.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use dashmap::DashMap;
use tokio::sync::{mpsc, oneshot, Mutex};

use crate::error::Error;
use crate::protocol::{IoPubExecutionState, KernelMessage, KernelMessageType};

/// A hook invoked for every iopub message delivered to a future, most
/// recently registered first. Returning `false` stops the chain: neither
/// earlier hooks nor the future's own iopub channel see the message.
pub type IoPubHook = Box<dyn Fn(&KernelMessage) -> bool + Send + Sync>;

struct Entry {
    reply_tx: Mutex<Option<oneshot::Sender<KernelMessage>>>,
    iopub_tx: mpsc::UnboundedSender<KernelMessage>,
    stdin_tx: mpsc::UnboundedSender<KernelMessage>,
    hooks: Mutex<VecDeque<IoPubHook>>,
    done_tx: Mutex<Option<oneshot::Sender<()>>>,
    disposed: AtomicBool,
    reply_received: AtomicBool,
    idle_received: AtomicBool,
}

/// Tracks in-flight shell/control requests and routes replies, iopub
/// broadcasts, and stdin requests back to whichever future is waiting on
/// them.
#[derive(Clone, Default)]
pub struct FutureRegistry {
    entries: Arc<DashMap<String, Arc<Entry>>>,
}

impl FutureRegistry {
    /// An empty registry.
    pub fn new() -> Self {
        FutureRegistry::default()
    }

    /// Register a new in-flight request and get back the handle used to
    /// await its reply and observe its side traffic.
    pub fn register(&self, msg_id: impl Into<String>) -> KernelFuture {
        let msg_id = msg_id.into();
        let (reply_tx, reply_rx) = oneshot::channel();
        let (iopub_tx, iopub_rx) = mpsc::unbounded_channel();
        let (stdin_tx, stdin_rx) = mpsc::unbounded_channel();
        let (done_tx, done_rx) = oneshot::channel();

        let entry = Arc::new(Entry {
            reply_tx: Mutex::new(Some(reply_tx)),
            iopub_tx,
            stdin_tx,
            hooks: Mutex::new(VecDeque::new()),
            done_tx: Mutex::new(Some(done_tx)),
            disposed: AtomicBool::new(false),
            reply_received: AtomicBool::new(false),
            idle_received: AtomicBool::new(false),
        });
        self.entries.insert(msg_id.clone(), entry.clone());

        KernelFuture {
            msg_id,
            reply_rx: Some(reply_rx),
            iopub_rx,
            stdin_rx,
            done_rx: Some(done_rx),
            entry,
            registry: self.clone(),
        }
    }

    fn parent_id(msg: &KernelMessage) -> Option<&str> {
        msg.parent_header.as_ref().map(|h| h.msg_id.as_str())
    }

    /// Route a shell/control reply to the future that requested it.
    ///
    /// Returns `true` if a future was found and the reply delivered.
    pub fn dispatch_reply(&self, msg: &KernelMessage) -> bool {
        let Some(parent) = Self::parent_id(msg) else {
            return false;
        };
        let Some(entry) = self.entries.get(parent).map(|e| e.clone()) else {
            return false;
        };
        if let Ok(mut slot) = entry.reply_tx.try_lock() {
            if let Some(tx) = slot.take() {
                let _ = tx.send(msg.clone());
                entry.reply_received.store(true, Ordering::SeqCst);
                if entry.idle_received.load(Ordering::SeqCst) {
                    self.dispose(parent);
                }
                return true;
            }
        }
        false
    }

    /// Route an iopub broadcast to the future whose request produced it,
    /// running its hooks in LIFO order first. A message with no matching
    /// future (e.g. unsolicited broadcasts) is not an error; callers treat
    /// it as unhandled.
    ///
    /// Idle status on the matched future's parent marks the future done
    /// and disposes of it, mirroring the rule that a request's lifecycle
    /// ends at the next idle status after its reply.
    pub fn dispatch_iopub(&self, msg: &KernelMessage) -> bool {
        let Some(parent) = Self::parent_id(msg) else {
            return false;
        };
        let Some(entry) = self.entries.get(parent).map(|e| e.clone()) else {
            return false;
        };

        let mut propagate = true;
        if let Ok(hooks) = entry.hooks.try_lock() {
            for hook in hooks.iter() {
                if !hook(msg) {
                    propagate = false;
                    break;
                }
            }
        }
        if propagate {
            let _ = entry.iopub_tx.send(msg.clone());
        }

        if msg.header.msg_type == KernelMessageType::Status {
            if let Ok(content) = serde_json::from_value::<crate::protocol::StatusContent>(
                msg.content.clone(),
            ) {
                if content.execution_state == IoPubExecutionState::Idle {
                    entry.idle_received.store(true, Ordering::SeqCst);
                    if entry.reply_received.load(Ordering::SeqCst) {
                        self.dispose(parent);
                    }
                }
            }
        }
        true
    }

    /// Route a stdin request (`input_request`) to the future that owns the
    /// execution prompting for it.
    pub fn dispatch_stdin(&self, msg: &KernelMessage) -> bool {
        let Some(parent) = Self::parent_id(msg) else {
            return false;
        };
        let Some(entry) = self.entries.get(parent) else {
            return false;
        };
        entry.stdin_tx.send(msg.clone()).is_ok()
    }

    /// Remove a future from the registry and fire its done signal. Safe to
    /// call more than once for the same `msg_id`.
    pub fn dispose(&self, msg_id: &str) {
        if let Some((_, entry)) = self.entries.remove(msg_id) {
            if !entry.disposed.swap(true, Ordering::SeqCst) {
                if let Ok(mut slot) = entry.done_tx.try_lock() {
                    if let Some(tx) = slot.take() {
                        let _ = tx.send(());
                    }
                }
            }
        }
    }

    /// Reject every outstanding future, used when the engine transitions
    /// to `Dead`: nobody is ever going to see a reply again.
    pub fn reject_all(&self) {
        let ids: Vec<String> = self.entries.iter().map(|e| e.key().clone()).collect();
        for id in ids {
            self.dispose(&id);
        }
    }

    /// Number of futures currently awaiting a reply. Exposed for tests and
    /// diagnostics.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Whether the registry currently has no outstanding futures.
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

/// A handle to an in-flight shell/control request.
///
/// Dropping a `KernelFuture` does not dispose of its registry entry (the
/// reply or the terminating idle status might still be in flight); call
/// [`KernelFuture::dispose`] explicitly once you're no longer interested.
pub struct KernelFuture {
    msg_id: String,
    reply_rx: Option<oneshot::Receiver<KernelMessage>>,
    iopub_rx: mpsc::UnboundedReceiver<KernelMessage>,
    stdin_rx: mpsc::UnboundedReceiver<KernelMessage>,
    done_rx: Option<oneshot::Receiver<()>>,
    entry: Arc<Entry>,
    registry: FutureRegistry,
}

impl KernelFuture {
    /// The `msg_id` this future is tracking.
    pub fn msg_id(&self) -> &str {
        &self.msg_id
    }

    /// Wait for the shell/control reply. Resolves to [`Error::KernelTerminated`]
    /// if the registry disposes of this future (e.g. on kernel death)
    /// before a reply arrives.
    pub async fn reply(&mut self) -> Result<KernelMessage, Error> {
        let Some(rx) = self.reply_rx.take() else {
            return Err(Error::KernelTerminated);
        };
        rx.await.map_err(|_| Error::KernelTerminated)
    }

    /// Receive the next iopub message correlated with this request, or
    /// `None` once the future is disposed and no more will arrive.
    pub async fn next_iopub(&mut self) -> Option<KernelMessage> {
        self.iopub_rx.recv().await
    }

    /// Receive the next stdin `input_request` correlated with this
    /// request, or `None` once no more will arrive.
    pub async fn next_stdin(&mut self) -> Option<KernelMessage> {
        self.stdin_rx.recv().await
    }

    /// Register an iopub hook. Hooks run most-recently-registered first;
    /// a hook returning `false` stops the chain for that message.
    pub async fn add_iopub_hook(&self, hook: IoPubHook) {
        self.entry.hooks.lock().await.push_front(hook);
    }

    /// Wait for this future to be marked done (idle status observed, or
    /// explicit disposal), consuming the done signal.
    pub async fn done(&mut self) {
        if let Some(rx) = self.done_rx.take() {
            let _ = rx.await;
        }
    }

    /// Remove this future from its registry. Idempotent.
    pub fn dispose(&self) {
        self.registry.dispose(&self.msg_id);
    }
}
