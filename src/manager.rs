//! The manager layer: periodic pollers over a server's running kernels,
//! running sessions, and kernelspecs, with dedup so `start_new`/`connect_to`
//! never create two handles for the same id.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use tokio::sync::{broadcast, OnceCell, RwLock};
use tokio::time::MissedTickBehavior;
use tokio_util::sync::{CancellationToken, DropGuard};
use tracing::{debug, warn};

use crate::config::ClientConfig;
use crate::engine::KernelChannelEngine;
use crate::error::Error;
use crate::kernelspec::SpecsBundle;
use crate::rest::{JupyterRestClient, KernelModel, SessionModel};
use crate::session::{DefaultKernelConnector, KernelConnector, Session};
use crate::socket::SocketFactory;

const RUNNING_POLL_INTERVAL: Duration = Duration::from_secs(10);
const SPECS_POLL_INTERVAL: Duration = Duration::from_secs(61);

/// Polls `api/kernels`, keeping a cache of running kernels and handing out
/// [`KernelChannelEngine`] handles for them.
pub struct KernelManager {
    rest: JupyterRestClient,
    factory: Arc<dyn SocketFactory>,
    config: ClientConfig,
    cache: DashMap<String, KernelModel>,
    engines: DashMap<String, KernelChannelEngine>,
    running_changed: broadcast::Sender<()>,
    ready: OnceCell<()>,
    _drop_guard: DropGuard,
}

impl KernelManager {
    /// Build a manager and kick off its background poll loop. The first
    /// `api/kernels` fetch completes before `ready()` resolves.
    pub fn new(factory: Arc<dyn SocketFactory>, rest: JupyterRestClient, config: ClientConfig) -> Arc<Self> {
        let cancel = CancellationToken::new();
        let manager = Arc::new(KernelManager {
            rest,
            factory,
            config,
            cache: DashMap::new(),
            engines: DashMap::new(),
            running_changed: broadcast::channel(32).0,
            ready: OnceCell::new(),
            _drop_guard: cancel.clone().drop_guard(),
        });
        tokio::spawn(poll_running_kernels(manager.clone(), cancel));
        manager
    }

    /// Resolves once the first running-kernels snapshot has been fetched.
    pub async fn ready(&self) {
        let _ = self.ready.get_or_init(|| async {}).await;
    }

    /// Snapshot of the currently known running kernels.
    pub fn list(&self) -> Vec<KernelModel> {
        self.cache.iter().map(|entry| entry.value().clone()).collect()
    }

    /// A receiver notified whenever the running-kernels snapshot changes.
    pub fn watch_running(&self) -> broadcast::Receiver<()> {
        self.running_changed.subscribe()
    }

    /// Start a new kernel from `kernel_name` (or the server default) and
    /// return its engine, registering it so later polls don't duplicate it.
    pub async fn start_new(&self, kernel_name: Option<&str>) -> Result<KernelChannelEngine, Error> {
        let model = self.rest.start_kernel(kernel_name).await?;
        let engine = self.build_engine(&model.id, &model.name);
        self.cache.insert(model.id.clone(), model.clone());
        self.engines.insert(model.id, engine.clone());
        let _ = self.running_changed.send(());
        Ok(engine)
    }

    /// Attach to an already-running kernel by id, reusing a cached engine
    /// if one already exists for it.
    pub async fn connect_to(&self, kernel_id: &str) -> Result<KernelChannelEngine, Error> {
        if let Some(engine) = self.engines.get(kernel_id) {
            return Ok(engine.clone());
        }
        let model = self
            .rest
            .get_kernel(kernel_id)
            .await?
            .ok_or_else(|| Error::MalformedModel(format!("kernel {kernel_id} not found")))?;
        let engine = self.build_engine(&model.id, &model.name);
        self.cache.insert(model.id.clone(), model);
        self.engines.insert(kernel_id.to_string(), engine.clone());
        Ok(engine)
    }

    /// Remove `id` from the cache immediately (optimistic), then delete it
    /// on the server.
    pub async fn shutdown(&self, kernel_id: &str) -> Result<(), Error> {
        self.cache.remove(kernel_id);
        self.engines.remove(kernel_id);
        let _ = self.running_changed.send(());
        self.rest.delete_kernel(kernel_id).await
    }

    fn build_engine(&self, kernel_id: &str, kernel_name: &str) -> KernelChannelEngine {
        KernelChannelEngine::new(
            self.factory.clone(),
            self.rest.clone(),
            self.config.clone(),
            kernel_id,
            kernel_name,
        )
    }

    async fn refresh(&self) -> Result<(), Error> {
        let running = self.rest.list_kernels().await?;
        let fresh: HashMap<String, KernelModel> =
            running.into_iter().map(|model| (model.id.clone(), model)).collect();

        let changed = fresh.len() != self.cache.len()
            || fresh
                .iter()
                .any(|(id, model)| self.cache.get(id).map(|entry| &*entry != model).unwrap_or(true));

        if changed {
            self.cache.retain(|id, _| fresh.contains_key(id));
            for (id, model) in fresh {
                self.cache.insert(id, model);
            }
            let _ = self.running_changed.send(());
        }
        let _ = self.ready.get_or_init(|| async {}).await;
        Ok(())
    }
}

async fn poll_running_kernels(manager: Arc<KernelManager>, cancel: CancellationToken) {
    let mut interval = tokio::time::interval(RUNNING_POLL_INTERVAL);
    interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
    loop {
        tokio::select! {
            _ = interval.tick() => {
                if let Err(err) = manager.refresh().await {
                    warn!(error = %err, "failed to poll running kernels");
                    let _ = manager.ready.get_or_init(|| async {}).await;
                }
            }
            _ = cancel.cancelled() => return,
        }
    }
}

/// Polls `api/sessions`, keeping a cache of running sessions and handing
/// out [`Session`] handles for them.
pub struct SessionManager {
    rest: JupyterRestClient,
    connector: Arc<dyn KernelConnector>,
    cache: DashMap<String, SessionModel>,
    sessions: DashMap<String, Arc<Session>>,
    running_changed: broadcast::Sender<()>,
    ready: OnceCell<()>,
    _drop_guard: DropGuard,
}

impl SessionManager {
    /// Build a manager and kick off its background poll loop, reusing
    /// `kernel_manager`'s factory/config to connect kernels started via
    /// sessions.
    pub fn new(factory: Arc<dyn SocketFactory>, rest: JupyterRestClient, config: ClientConfig) -> Arc<Self> {
        let connector = Arc::new(DefaultKernelConnector::new(factory, rest.clone(), config));
        Self::with_connector(rest, connector)
    }

    /// Build a manager with a custom kernel connector, primarily for tests.
    pub fn with_connector(rest: JupyterRestClient, connector: Arc<dyn KernelConnector>) -> Arc<Self> {
        let cancel = CancellationToken::new();
        let manager = Arc::new(SessionManager {
            rest,
            connector,
            cache: DashMap::new(),
            sessions: DashMap::new(),
            running_changed: broadcast::channel(32).0,
            ready: OnceCell::new(),
            _drop_guard: cancel.clone().drop_guard(),
        });
        tokio::spawn(poll_running_sessions(manager.clone(), cancel));
        manager
    }

    /// Resolves once the first running-sessions snapshot has been fetched.
    pub async fn ready(&self) {
        let _ = self.ready.get_or_init(|| async {}).await;
    }

    /// Snapshot of the currently known running sessions.
    pub fn list(&self) -> Vec<SessionModel> {
        self.cache.iter().map(|entry| entry.value().clone()).collect()
    }

    /// A receiver notified whenever the running-sessions snapshot changes.
    pub fn watch_running(&self) -> broadcast::Receiver<()> {
        self.running_changed.subscribe()
    }

    /// Create a new session (and its backing kernel) and return a handle,
    /// registering it so later polls don't duplicate it.
    pub async fn start_new(
        &self,
        path: &str,
        name: &str,
        session_type: &str,
        kernel_name: Option<&str>,
    ) -> Result<Arc<Session>, Error> {
        let model = self.rest.create_session(path, name, session_type, kernel_name).await?;
        let session = Arc::new(Session::from_model(self.rest.clone(), self.connector.clone(), model.clone()));
        session.reconcile(model.clone()).await;
        self.cache.insert(model.id.clone(), model.clone());
        self.sessions.insert(model.id, session.clone());
        let _ = self.running_changed.send(());
        Ok(session)
    }

    /// Attach to an already-running session by id, reusing a cached handle
    /// if one already exists for it.
    pub async fn connect_to(&self, session_id: &str) -> Result<Arc<Session>, Error> {
        if let Some(session) = self.sessions.get(session_id) {
            return Ok(session.clone());
        }
        let model = self
            .rest
            .get_session(session_id)
            .await?
            .ok_or_else(|| Error::MalformedModel(format!("session {session_id} not found")))?;
        let session = Arc::new(Session::from_model(self.rest.clone(), self.connector.clone(), model.clone()));
        session.reconcile(model.clone()).await;
        self.cache.insert(model.id.clone(), model);
        self.sessions.insert(session_id.to_string(), session.clone());
        Ok(session)
    }

    /// Remove `id` from the cache immediately (optimistic), then delete it
    /// on the server.
    pub async fn shutdown(&self, session_id: &str) -> Result<(), Error> {
        self.cache.remove(session_id);
        if let Some((_, session)) = self.sessions.remove(session_id) {
            session.shutdown().await?;
        } else {
            self.rest.delete_session(session_id).await?;
        }
        let _ = self.running_changed.send(());
        Ok(())
    }

    async fn refresh(&self) -> Result<(), Error> {
        let running = self.rest.list_sessions().await?;
        let fresh: HashMap<String, SessionModel> =
            running.into_iter().map(|model| (model.id.clone(), model)).collect();

        let changed = fresh.len() != self.cache.len()
            || fresh
                .iter()
                .any(|(id, model)| self.cache.get(id).map(|entry| &*entry != model).unwrap_or(true));

        if changed {
            self.cache.retain(|id, _| fresh.contains_key(id));
            for (id, model) in &fresh {
                self.cache.insert(id.clone(), model.clone());
                if let Some(session) = self.sessions.get(id) {
                    session.reconcile(model.clone()).await;
                }
            }
            let _ = self.running_changed.send(());
        }
        let _ = self.ready.get_or_init(|| async {}).await;
        Ok(())
    }
}

async fn poll_running_sessions(manager: Arc<SessionManager>, cancel: CancellationToken) {
    let mut interval = tokio::time::interval(RUNNING_POLL_INTERVAL);
    interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
    loop {
        tokio::select! {
            _ = interval.tick() => {
                if let Err(err) = manager.refresh().await {
                    warn!(error = %err, "failed to poll running sessions");
                    let _ = manager.ready.get_or_init(|| async {}).await;
                }
            }
            _ = cancel.cancelled() => return,
        }
    }
}

/// Polls `api/kernelspecs` every [`SPECS_POLL_INTERVAL`] and caches the
/// result, same shape as [`KernelManager`]/[`SessionManager`] but over a
/// much slower interval since specs rarely change within a process
/// lifetime.
pub struct KernelSpecManager {
    rest: JupyterRestClient,
    cache: RwLock<Option<SpecsBundle>>,
    specs_changed: broadcast::Sender<()>,
    ready: OnceCell<()>,
    _drop_guard: DropGuard,
}

impl KernelSpecManager {
    /// Build a manager and kick off its background poll loop.
    pub fn new(rest: JupyterRestClient) -> Arc<Self> {
        let cancel = CancellationToken::new();
        let manager = Arc::new(KernelSpecManager {
            rest,
            cache: RwLock::new(None),
            specs_changed: broadcast::channel(8).0,
            ready: OnceCell::new(),
            _drop_guard: cancel.clone().drop_guard(),
        });
        tokio::spawn(poll_kernelspecs(manager.clone(), cancel));
        manager
    }

    /// Resolves once the first `api/kernelspecs` fetch has completed.
    pub async fn ready(&self) {
        let _ = self.ready.get_or_init(|| async {}).await;
    }

    /// The cached kernelspecs bundle, fetching it on first call.
    pub async fn get(&self) -> Result<SpecsBundle, Error> {
        if let Some(bundle) = self.cache.read().await.clone() {
            return Ok(bundle);
        }
        self.refresh().await
    }

    /// Force a re-fetch, replacing the cache and emitting `specs_changed`
    /// only if the bundle actually differs.
    pub async fn refresh(&self) -> Result<SpecsBundle, Error> {
        let fresh = self.rest.kernelspecs().await?;
        let changed = self.cache.read().await.as_ref() != Some(&fresh);
        if changed {
            debug!("kernelspecs changed");
            *self.cache.write().await = Some(fresh.clone());
            let _ = self.specs_changed.send(());
        }
        let _ = self.ready.get_or_init(|| async {}).await;
        Ok(fresh)
    }

    /// A receiver notified whenever `refresh()` observes a changed bundle.
    pub fn watch_specs(&self) -> broadcast::Receiver<()> {
        self.specs_changed.subscribe()
    }
}

async fn poll_kernelspecs(manager: Arc<KernelSpecManager>, cancel: CancellationToken) {
    let mut interval = tokio::time::interval(SPECS_POLL_INTERVAL);
    interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
    loop {
        tokio::select! {
            _ = interval.tick() => {
                if let Err(err) = manager.refresh().await {
                    warn!(error = %err, "failed to poll kernelspecs");
                    let _ = manager.ready.get_or_init(|| async {}).await;
                }
            }
            _ = cancel.cancelled() => return,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::rest::RawResponse;
    use std::future::Future;
    use std::pin::Pin;
    use std::sync::Mutex as StdMutex;

    #[derive(Default)]
    struct QueueTransport {
        responses: StdMutex<std::collections::VecDeque<(u16, serde_json::Value)>>,
    }

    impl QueueTransport {
        fn push(&self, status: u16, body: serde_json::Value) {
            self.responses.lock().unwrap().push_back((status, body));
        }
    }

    impl crate::rest::RestTransport for QueueTransport {
        fn execute<'a>(
            &'a self,
            _method: reqwest::Method,
            _path: &'a str,
            _body: Option<Vec<u8>>,
        ) -> Pin<Box<dyn Future<Output = Result<RawResponse, Error>> + Send + 'a>> {
            let (status, body) = self
                .responses
                .lock()
                .unwrap()
                .pop_front()
                .unwrap_or((200, serde_json::json!([])));
            Box::pin(async move {
                Ok(RawResponse {
                    status,
                    body: serde_json::to_vec(&body).unwrap().into(),
                })
            })
        }
    }

    struct PanicConnector;
    impl KernelConnector for PanicConnector {
        fn connect(&self, _kernel_id: &str, _kernel_name: &str) -> KernelChannelEngine {
            panic!("no kernel should be connected in this test");
        }
    }

    fn kernel_model(id: &str) -> serde_json::Value {
        serde_json::json!({
            "id": id,
            "name": "python3",
            "last_activity": "2024-01-01T00:00:00.000000Z",
            "execution_state": "idle",
            "connections": 1,
        })
    }

    #[tokio::test]
    async fn kernel_manager_shutdown_removes_from_cache_before_delete_resolves() {
        let transport = Arc::new(QueueTransport::default());
        transport.push(201, kernel_model("k1"));
        transport.push(204, serde_json::json!({}));
        let rest = JupyterRestClient::new(transport);
        struct NoSocketFactory;
        impl SocketFactory for NoSocketFactory {
            fn connect<'a>(
                &'a self,
                _url: &'a str,
                _token: Option<&'a str>,
            ) -> Pin<
                Box<
                    dyn Future<Output = Result<(crate::socket::BoxedSink, crate::socket::BoxedStream), Error>>
                        + Send
                        + 'a,
                >,
            > {
                Box::pin(async move { Err(Error::KernelConnect("not reached".into())) })
            }
        }
        let manager = KernelManager::new(Arc::new(NoSocketFactory), rest, ClientConfig::new("http://localhost:8888/"));
        let engine = manager.start_new(Some("python3")).await.unwrap();
        assert_eq!(manager.list().len(), 1);
        manager.shutdown(engine.kernel_id()).await.unwrap();
        assert_eq!(manager.list().len(), 0);
    }

    #[tokio::test]
    async fn session_manager_connect_to_reuses_cached_handle() {
        let transport = Arc::new(QueueTransport::default());
        transport.push(
            200,
            serde_json::json!({
                "id": "s1", "path": "a.ipynb", "name": "nb", "type": "notebook",
                "kernel": {"id": "k1", "name": "python3"},
            }),
        );
        let rest = JupyterRestClient::new(transport);
        let manager = SessionManager::with_connector(rest, Arc::new(PanicConnector));
        let first = manager.connect_to("s1").await.unwrap();
        let second = manager.connect_to("s1").await.unwrap();
        assert!(Arc::ptr_eq(&first, &second));
    }

    #[tokio::test]
    async fn kernelspec_manager_caches_until_refresh_sees_a_change() {
        let transport = Arc::new(QueueTransport::default());
        let bundle = serde_json::json!({
            "default": "python3",
            "kernelspecs": {
                "python3": {
                    "name": "python3",
                    "spec": {
                        "argv": ["python3"], "display_name": "Python 3", "language": "python",
                        "interrupt_mode": "signal", "env": {}, "metadata": {},
                    },
                    "resources": {},
                }
            }
        });
        transport.push(200, bundle.clone());
        transport.push(200, bundle);
        let rest = JupyterRestClient::new(transport);
        let manager = KernelSpecManager::new(rest);

        let first = manager.get().await.unwrap();
        let mut changed = manager.watch_specs();
        let second = manager.refresh().await.unwrap();
        assert_eq!(first, second);
        assert!(changed.try_recv().is_err());
    }
}
