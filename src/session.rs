//! The session coordinator: a server session (a `{path, name, type}` tuple
//! bound to a kernel) and the bookkeeping needed to keep a local view of it
//! in sync with the server's.

use std::sync::Arc;

use serde_json::{json, Value};
use tokio::sync::{broadcast, Mutex};

use crate::config::ClientConfig;
use crate::engine::KernelChannelEngine;
use crate::error::Error;
use crate::rest::{JupyterRestClient, SessionModel};
use crate::socket::SocketFactory;

/// Fields of a session that can change and are worth telling listeners
/// about individually, in the order they're applied during reconciliation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionField {
    Kernel,
    Path,
    Name,
    Type,
}

/// Emitted whenever a session's local state changes, either from a local
/// setter or from reconciling a server response.
#[derive(Debug, Clone)]
pub enum SessionEvent {
    Changed(SessionField),
    Terminated,
}

struct State {
    id: Option<String>,
    path: String,
    name: String,
    session_type: String,
    kernel_id: Option<String>,
    kernel_name: Option<String>,
}

/// Builds the connected [`KernelChannelEngine`] for a kernel id/name pair.
/// Exists so `Session` doesn't need to know how to build a socket factory;
/// callers supply one, usually a small closure around their chosen
/// [`SocketFactory`].
pub trait KernelConnector: Send + Sync {
    fn connect(&self, kernel_id: &str, kernel_name: &str) -> KernelChannelEngine;
}

/// The default connector: builds a fresh [`KernelChannelEngine`] from a
/// shared socket factory, REST client, and config.
pub struct DefaultKernelConnector {
    factory: Arc<dyn SocketFactory>,
    rest: JupyterRestClient,
    config: ClientConfig,
}

impl DefaultKernelConnector {
    pub fn new(factory: Arc<dyn SocketFactory>, rest: JupyterRestClient, config: ClientConfig) -> Self {
        DefaultKernelConnector { factory, rest, config }
    }
}

impl KernelConnector for DefaultKernelConnector {
    fn connect(&self, kernel_id: &str, kernel_name: &str) -> KernelChannelEngine {
        KernelChannelEngine::new(
            self.factory.clone(),
            self.rest.clone(),
            self.config.clone(),
            kernel_id,
            kernel_name,
        )
    }
}

/// Options for starting the kernel backing a session.
#[derive(Debug, Clone, Default)]
pub struct StartKernelOptions {
    /// Kernelspec name to start from; `None` uses the server's default.
    pub kernel_name: Option<String>,
}

/// A client-side handle on one server session: a `{path, name, type}` tuple
/// bound to a kernel. Local setters optimistically update before the
/// network call resolves, and roll back on failure.
pub struct Session {
    rest: JupyterRestClient,
    connector: Arc<dyn KernelConnector>,
    state: Mutex<State>,
    kernel: Mutex<Option<KernelChannelEngine>>,
    events_tx: broadcast::Sender<SessionEvent>,
    /// Guards against reentrant `update()` calls while a PATCH we issued is
    /// still outstanding; without it, a server push racing our own PATCH
    /// response could apply stale fields on top of the one we're rolling
    /// forward.
    updating: Mutex<()>,
}

impl Session {
    /// Build a session around an already-known server model (e.g. returned
    /// by `GET /api/sessions` or `POST /api/sessions`).
    pub fn from_model(
        rest: JupyterRestClient,
        connector: Arc<dyn KernelConnector>,
        model: SessionModel,
    ) -> Self {
        let session = Session {
            rest,
            connector,
            state: Mutex::new(State {
                id: Some(model.id.clone()),
                path: model.path.clone(),
                name: model.name.clone(),
                session_type: model.session_type.clone(),
                kernel_id: Some(model.kernel.id.clone()),
                kernel_name: Some(model.kernel.name.clone()),
            }),
            kernel: Mutex::new(None),
            events_tx: broadcast::channel(64).0,
            updating: Mutex::new(()),
        };
        session
    }

    /// Build a session with no server id yet; `startKernel` will create it.
    pub fn new_local(
        rest: JupyterRestClient,
        connector: Arc<dyn KernelConnector>,
        path: impl Into<String>,
        name: impl Into<String>,
        session_type: impl Into<String>,
    ) -> Self {
        Session {
            rest,
            connector,
            state: Mutex::new(State {
                id: None,
                path: path.into(),
                name: name.into(),
                session_type: session_type.into(),
                kernel_id: None,
                kernel_name: None,
            }),
            kernel: Mutex::new(None),
            events_tx: broadcast::channel(64).0,
            updating: Mutex::new(()),
        }
    }

    /// The server session id, if the session has been started.
    pub async fn id(&self) -> Option<String> {
        self.state.lock().await.id.clone()
    }

    pub async fn path(&self) -> String {
        self.state.lock().await.path.clone()
    }

    pub async fn name(&self) -> String {
        self.state.lock().await.name.clone()
    }

    pub async fn session_type(&self) -> String {
        self.state.lock().await.session_type.clone()
    }

    /// The currently attached kernel engine, if the session has a running
    /// kernel.
    pub async fn kernel(&self) -> Option<KernelChannelEngine> {
        self.kernel.lock().await.clone()
    }

    /// A receiver that observes field changes and termination.
    pub fn subscribe(&self) -> broadcast::Receiver<SessionEvent> {
        self.events_tx.subscribe()
    }

    /// Set the document path, patching the server if the session already
    /// exists. A no-op if `path` is unchanged. Rolls back on a failed PATCH.
    pub async fn set_path(&self, path: impl Into<String>) -> Result<(), Error> {
        self.set_field(SessionField::Path, path.into(), "path").await
    }

    /// Set the display name, patching the server if the session already
    /// exists. A no-op if `name` is unchanged. Rolls back on a failed PATCH.
    pub async fn set_name(&self, name: impl Into<String>) -> Result<(), Error> {
        self.set_field(SessionField::Name, name.into(), "name").await
    }

    /// Set the session type, patching the server if the session already
    /// exists. A no-op if `session_type` is unchanged. Rolls back on a
    /// failed PATCH.
    pub async fn set_type(&self, session_type: impl Into<String>) -> Result<(), Error> {
        self.set_field(SessionField::Type, session_type.into(), "type").await
    }

    async fn set_field(&self, field: SessionField, value: String, json_key: &str) -> Result<(), Error> {
        let (id, previous) = {
            let mut state = self.state.lock().await;
            let previous = match field {
                SessionField::Path => std::mem::replace(&mut state.path, value.clone()),
                SessionField::Name => std::mem::replace(&mut state.name, value.clone()),
                SessionField::Type => std::mem::replace(&mut state.session_type, value.clone()),
                SessionField::Kernel => unreachable!("set_field is never called with Kernel"),
            };
            if previous == value {
                return Ok(());
            }
            (state.id.clone(), previous)
        };
        let _ = self.events_tx.send(SessionEvent::Changed(field));

        let Some(id) = id else {
            return Ok(());
        };
        let guard = self.updating.lock().await;
        let patch = json!({ json_key: value });
        let result = self.rest.patch_session(&id, &patch).await;
        drop(guard);
        match result {
            Ok(model) => {
                self.reconcile(model).await;
                Ok(())
            }
            Err(err) => {
                let mut state = self.state.lock().await;
                match field {
                    SessionField::Path => state.path = previous,
                    SessionField::Name => state.name = previous,
                    SessionField::Type => state.session_type = previous,
                    SessionField::Kernel => unreachable!(),
                }
                drop(state);
                let _ = self.events_tx.send(SessionEvent::Changed(field));
                Err(err)
            }
        }
    }

    /// Start (or restart) the kernel backing this session, disposing the
    /// old engine handle if one was attached. Creates the session on the
    /// server if it doesn't exist yet; otherwise PATCHes the existing one
    /// with the new kernel options.
    pub async fn start_kernel(&self, opts: StartKernelOptions) -> Result<KernelChannelEngine, Error> {
        *self.kernel.lock().await = None;

        let _guard = self.updating.lock().await;
        let id = self.state.lock().await.id.clone();
        let model = match id {
            None => {
                let (path, name, session_type) = {
                    let state = self.state.lock().await;
                    (state.path.clone(), state.name.clone(), state.session_type.clone())
                };
                self.rest
                    .create_session(&path, &name, &session_type, opts.kernel_name.as_deref())
                    .await?
            }
            Some(id) => {
                let patch = json!({ "kernel": { "name": opts.kernel_name } });
                self.rest.patch_session(&id, &patch).await?
            }
        };
        drop(_guard);
        self.reconcile(model).await;
        self.kernel
            .lock()
            .await
            .clone()
            .ok_or_else(|| Error::MalformedModel("session has no kernel after start".to_string()))
    }

    /// Null out the local id first so any concurrent PATCH short-circuits,
    /// then delete the session on the server and emit `Terminated`.
    pub async fn shutdown(&self) -> Result<(), Error> {
        let id = {
            let mut state = self.state.lock().await;
            state.id.take()
        };
        *self.kernel.lock().await = None;
        if let Some(id) = id {
            self.rest.delete_session(&id).await?;
        }
        let _ = self.events_tx.send(SessionEvent::Terminated);
        Ok(())
    }

    /// Reconcile local state from a server model, attaching a new kernel
    /// engine if the kernel id changed, then emitting `Changed` for every
    /// field that actually differs, kernel first.
    pub async fn reconcile(&self, model: SessionModel) {
        let _updating = self.updating.try_lock();
        if _updating.is_err() {
            return;
        }

        let mut changed = Vec::new();
        let kernel_changed;
        {
            let mut state = self.state.lock().await;
            state.id = Some(model.id.clone());
            kernel_changed = state.kernel_id.as_deref() != Some(model.kernel.id.as_str());
            if kernel_changed {
                state.kernel_id = Some(model.kernel.id.clone());
                state.kernel_name = Some(model.kernel.name.clone());
                changed.push(SessionField::Kernel);
            }
            if state.path != model.path {
                state.path = model.path.clone();
                changed.push(SessionField::Path);
            }
            if state.name != model.name {
                state.name = model.name.clone();
                changed.push(SessionField::Name);
            }
            if state.session_type != model.session_type {
                state.session_type = model.session_type.clone();
                changed.push(SessionField::Type);
            }
        }

        if kernel_changed {
            let engine = self.connector.connect(&model.kernel.id, &model.kernel.name);
            *self.kernel.lock().await = Some(engine);
        }

        for field in changed {
            let _ = self.events_tx.send(SessionEvent::Changed(field));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::rest::{RawResponse, RestTransport};
    use reqwest::Method;
    use serde_json::json;
    use std::future::Future;
    use std::pin::Pin;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex as StdMutex;

    #[derive(Default)]
    struct FakeTransport {
        responses: StdMutex<Vec<(u16, Value)>>,
        calls: AtomicUsize,
    }

    impl FakeTransport {
        fn push(&self, status: u16, body: Value) {
            self.responses.lock().unwrap().push((status, body));
        }
    }

    impl RestTransport for FakeTransport {
        fn execute<'a>(
            &'a self,
            _method: Method,
            _path: &'a str,
            _body: Option<Vec<u8>>,
        ) -> Pin<Box<dyn Future<Output = Result<RawResponse, Error>> + Send + 'a>> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            let (status, body) = self.responses.lock().unwrap().remove(0);
            Box::pin(async move {
                Ok(RawResponse {
                    status,
                    body: serde_json::to_vec(&body).unwrap().into(),
                })
            })
        }
    }

    struct NullConnector;
    impl KernelConnector for NullConnector {
        fn connect(&self, _kernel_id: &str, _kernel_name: &str) -> KernelChannelEngine {
            panic!("connect should not be called in this test");
        }
    }

    fn session_model(id: &str, path: &str, kernel_id: &str) -> Value {
        json!({
            "id": id,
            "path": path,
            "name": "nb",
            "type": "notebook",
            "kernel": { "id": kernel_id, "name": "python3" },
        })
    }

    #[tokio::test]
    async fn set_path_noop_when_unchanged() {
        let fake = Arc::new(FakeTransport::default());
        let rest = JupyterRestClient::new(fake.clone());
        let session = Session::new_local(rest, Arc::new(NullConnector), "a.ipynb", "nb", "notebook");
        session.set_path("a.ipynb").await.unwrap();
        assert_eq!(fake.calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn set_path_rolls_back_on_failed_patch() {
        let fake = Arc::new(FakeTransport::default());
        fake.push(500, json!({"message": "boom"}));
        let rest = JupyterRestClient::new(fake);
        let session = Session::from_model(
            rest,
            Arc::new(NullConnector),
            serde_json::from_value(session_model("s1", "a.ipynb", "k1")).unwrap(),
        );
        let err = session.set_path("b.ipynb").await;
        assert!(err.is_err());
        assert_eq!(session.path().await, "a.ipynb");
    }

    #[tokio::test]
    async fn from_model_seeds_kernel_id_so_reconcile_does_not_spuriously_reconnect() {
        let fake = Arc::new(FakeTransport::default());
        let rest = JupyterRestClient::new(fake);
        let model: SessionModel = serde_json::from_value(session_model("s1", "a.ipynb", "k1")).unwrap();
        let session = Session::from_model(rest, Arc::new(NullConnector), model.clone());
        // NullConnector panics if `connect` is ever called; reconciling the
        // same model right after construction must not treat the kernel id
        // as having changed.
        session.reconcile(model).await;
    }

    #[tokio::test]
    async fn shutdown_nulls_id_before_delete() {
        let fake = Arc::new(FakeTransport::default());
        fake.push(204, json!({}));
        let rest = JupyterRestClient::new(fake);
        let session = Session::from_model(
            rest,
            Arc::new(NullConnector),
            serde_json::from_value(session_model("s1", "a.ipynb", "k1")).unwrap(),
        );
        let mut events = session.subscribe();
        session.shutdown().await.unwrap();
        assert_eq!(session.id().await, None);
        assert!(matches!(events.recv().await.unwrap(), SessionEvent::Terminated));
    }
}
