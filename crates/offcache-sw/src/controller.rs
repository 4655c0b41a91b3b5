//! The cache lifecycle controller and its four handlers.

use std::sync::Arc;

use bytes::Bytes;
use http::{HeaderMap, HeaderName, HeaderValue, StatusCode};
use tokio::sync::{mpsc, RwLock};
use tracing::{debug, info, warn};

use offcache_net::{NetworkFetch, Request, RequestId, Response};
use offcache_store::{CacheEntry, CacheStorage};

use crate::{
    ActivateEvent, Clients, FetchEvent, InstallEvent, MessageEvent, SwError, WorkerConfig,
    WorkerEvent, WorkerId, WorkerState, SKIP_WAITING,
};

/// Build a cache entry from a request and the response that answered it.
///
/// Identity (method, URL) comes from the request, not the response, so
/// redirected fetches stay findable under the URL the manifest listed.
fn entry_from_response(request: &Request, response: &Response) -> CacheEntry {
    let mut entry = CacheEntry::new(
        request.url.as_str(),
        request.method.as_str(),
        response.status.as_u16(),
        response.body.to_vec(),
    );
    entry.headers = response
        .headers
        .iter()
        .filter_map(|(name, value)| {
            value
                .to_str()
                .ok()
                .map(|v| (name.as_str().to_string(), v.to_string()))
        })
        .collect();
    entry
}

/// Rebuild a response from a stored entry, verbatim.
fn response_from_entry(entry: &CacheEntry, request_id: RequestId) -> Result<Response, SwError> {
    let status = StatusCode::from_u16(entry.status)
        .map_err(|_| SwError::CorruptEntry(format!("status {} for {}", entry.status, entry.url)))?;
    let url = url::Url::parse(&entry.url)
        .map_err(|e| SwError::CorruptEntry(format!("{}: {}", entry.url, e)))?;

    let mut headers = HeaderMap::new();
    for (name, value) in &entry.headers {
        if let (Ok(name), Ok(value)) = (
            HeaderName::from_bytes(name.as_bytes()),
            HeaderValue::from_str(value),
        ) {
            headers.insert(name, value);
        }
    }

    Ok(Response {
        request_id,
        url,
        status,
        headers,
        body: Bytes::from(entry.body.clone()),
    })
}

/// The cache lifecycle controller.
///
/// One instance exists per deployed version tag. The host constructs it, then
/// delivers lifecycle signals by calling the `handle_*` methods and awaiting
/// the returned futures.
pub struct CacheLifecycleController {
    id: WorkerId,
    config: WorkerConfig,
    state: RwLock<WorkerState>,

    /// All cache generations, shared with the host.
    pub caches: Arc<RwLock<CacheStorage>>,

    /// Open clients, shared with the host.
    pub clients: Arc<RwLock<Clients>>,

    fetcher: Arc<dyn NetworkFetch>,
    event_tx: mpsc::UnboundedSender<WorkerEvent>,
}

impl CacheLifecycleController {
    /// Create a controller for the given deployment configuration.
    pub fn new(
        config: WorkerConfig,
        fetcher: Arc<dyn NetworkFetch>,
    ) -> (Self, mpsc::UnboundedReceiver<WorkerEvent>) {
        let (event_tx, event_rx) = mpsc::unbounded_channel();

        (
            Self {
                id: WorkerId::new(),
                config,
                state: RwLock::new(WorkerState::Parsed),
                caches: Arc::new(RwLock::new(CacheStorage::new())),
                clients: Arc::new(RwLock::new(Clients::new())),
                fetcher,
                event_tx,
            },
            event_rx,
        )
    }

    /// This controller's instance id.
    pub fn id(&self) -> WorkerId {
        self.id
    }

    /// The deployment configuration.
    pub fn config(&self) -> &WorkerConfig {
        &self.config
    }

    /// Current lifecycle state.
    pub async fn state(&self) -> WorkerState {
        *self.state.read().await
    }

    async fn set_state(&self, new_state: WorkerState) {
        *self.state.write().await = new_state;
        // Receiver may be gone; state changes are advisory.
        let _ = self.event_tx.send(WorkerEvent::StateChange {
            worker_id: self.id,
            new_state,
        });
    }

    /// Install: populate the current generation with the precache manifest.
    ///
    /// All-or-nothing: if any manifest resource cannot be fetched (transport
    /// error or non-2xx status), the install fails, no generation is written,
    /// and the worker becomes redundant. The host retries by deploying a
    /// fresh instance.
    pub async fn handle_install(&self, _event: InstallEvent) -> Result<(), SwError> {
        info!(version = %self.config.version, "oninstall");
        self.set_state(WorkerState::Installing).await;

        // Fetch everything before touching storage so a failure cannot leave
        // a half-populated generation behind.
        let mut entries = Vec::with_capacity(self.config.precache_manifest.len());
        for path in &self.config.precache_manifest {
            match self.precache_one(path).await {
                Ok(entry) => entries.push(entry),
                Err(err) => {
                    warn!(version = %self.config.version, path = %path, error = %err, "install failed");
                    self.set_state(WorkerState::Redundant).await;
                    return Err(err);
                }
            }
        }

        self.caches
            .write()
            .await
            .put_batch(&self.config.version, entries);

        self.set_state(WorkerState::Installed).await;
        debug!(
            version = %self.config.version,
            assets = self.config.precache_manifest.len(),
            "generation populated"
        );
        Ok(())
    }

    async fn precache_one(&self, path: &str) -> Result<CacheEntry, SwError> {
        let url = self.config.resolve(path)?;
        let request = Request::get(url);
        let response = self.fetcher.fetch(&request).await?;
        if !response.ok() {
            return Err(SwError::InstallFailed(format!(
                "{}: status {}",
                path, response.status
            )));
        }
        Ok(entry_from_response(&request, &response))
    }

    /// Activate: evict stale generations, then claim all in-scope clients.
    pub async fn handle_activate(&self, _event: ActivateEvent) -> Result<(), SwError> {
        info!(version = %self.config.version, "onactivate");
        self.run_activation().await
    }

    async fn run_activation(&self) -> Result<(), SwError> {
        self.set_state(WorkerState::Activating).await;
        self.evict_stale_generations().await;
        self.claim_clients().await;
        self.set_state(WorkerState::Activated).await;
        Ok(())
    }

    /// Delete every generation whose name differs from the version tag.
    ///
    /// Deletions are independent and best-effort; a name that vanishes
    /// between enumeration and deletion is logged, not fatal.
    async fn evict_stale_generations(&self) {
        let mut caches = self.caches.write().await;
        let stale: Vec<String> = caches
            .keys()
            .into_iter()
            .filter(|name| *name != self.config.version)
            .map(str::to_string)
            .collect();

        for name in stale {
            if caches.delete(&name) {
                debug!(version = %self.config.version, stale = %name, "generation evicted");
            } else {
                warn!(version = %self.config.version, stale = %name, "eviction missed generation");
            }
        }
    }

    /// Take control of all open, in-scope clients without a reload.
    async fn claim_clients(&self) {
        let claimed = self
            .clients
            .write()
            .await
            .claim(self.id, &self.config.scope);

        for client_id in claimed {
            debug!(version = %self.config.version, client = %client_id, "client claimed");
            let _ = self
                .event_tx
                .send(WorkerEvent::ControllerChange { client_id });
        }
    }

    /// Fetch: answer from any cache generation, falling back to the network.
    ///
    /// Exactly one source answers. A cache hit is returned verbatim and no
    /// network request is issued; a miss goes to the live network and the
    /// response is returned without being stored. A network failure on a
    /// miss propagates as [`SwError::Network`].
    pub async fn handle_fetch(&self, event: FetchEvent) -> Result<Response, SwError> {
        let request = event.request;
        info!(version = %self.config.version, url = %request.url, "onfetch");

        {
            let caches = self.caches.read().await;
            if let Some(entry) = caches.match_request(request.method.as_str(), request.url.as_str())
            {
                debug!(version = %self.config.version, url = %request.url, "cache hit");
                return response_from_entry(entry, request.id);
            }
        }

        debug!(version = %self.config.version, url = %request.url, "cache miss, going to network");
        Ok(self.fetcher.fetch(&request).await?)
    }

    /// Message: react to the skip-waiting control token, ignore everything
    /// else.
    pub async fn handle_message(&self, event: MessageEvent) -> Result<(), SwError> {
        info!(version = %self.config.version, data = %event.data, "onmessage");

        if event.data == SKIP_WAITING {
            return self.skip_waiting().await;
        }

        let _ = self.event_tx.send(WorkerEvent::Message { data: event.data });
        Ok(())
    }

    /// Promote an installed worker to activation immediately.
    ///
    /// Idempotent: a worker that is already active (or not yet installed)
    /// observes the token and does nothing.
    async fn skip_waiting(&self) -> Result<(), SwError> {
        let state = self.state().await;
        match state {
            WorkerState::Installed => {
                debug!(version = %self.config.version, "skip-waiting, activating now");
                self.run_activation().await
            }
            other => {
                debug!(version = %self.config.version, state = ?other, "skip-waiting ignored");
                Ok(())
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use hashbrown::HashMap;
    use offcache_net::NetError;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use url::Url;

    /// Scripted network double: serves a fixed URL → (status, body) table and
    /// counts every request that reaches it.
    struct ScriptedNet {
        responses: HashMap<String, (u16, &'static [u8])>,
        hits: AtomicUsize,
    }

    impl ScriptedNet {
        fn new(responses: &[(&str, u16, &'static [u8])]) -> Arc<Self> {
            Arc::new(Self {
                responses: responses
                    .iter()
                    .map(|(url, status, body)| (url.to_string(), (*status, *body)))
                    .collect(),
                hits: AtomicUsize::new(0),
            })
        }

        fn hits(&self) -> usize {
            self.hits.load(Ordering::SeqCst)
        }
    }

    #[async_trait]
    impl NetworkFetch for ScriptedNet {
        async fn fetch(&self, request: &Request) -> Result<Response, NetError> {
            self.hits.fetch_add(1, Ordering::SeqCst);
            match self.responses.get(request.url.as_str()) {
                Some((status, body)) => Ok(Response {
                    request_id: request.id,
                    url: request.url.clone(),
                    status: StatusCode::from_u16(*status).unwrap(),
                    headers: HeaderMap::new(),
                    body: Bytes::from_static(body),
                }),
                None => Err(NetError::RequestFailed(format!(
                    "unreachable: {}",
                    request.url
                ))),
            }
        }
    }

    fn scope() -> Url {
        Url::parse("https://app.example/").unwrap()
    }

    fn config(version: &str) -> WorkerConfig {
        WorkerConfig::new(
            version,
            vec!["index.html".into(), "index.js".into(), "sw.js".into()],
            scope(),
        )
    }

    fn app_net() -> Arc<ScriptedNet> {
        ScriptedNet::new(&[
            ("https://app.example/index.html", 200, b"<html>app</html>"),
            ("https://app.example/index.js", 200, b"console.log(1)"),
            ("https://app.example/sw.js", 200, b"// worker"),
            ("https://app.example/other.png", 200, b"PNG"),
        ])
    }

    fn get(url: &str) -> FetchEvent {
        FetchEvent::new(Request::get(Url::parse(url).unwrap()))
    }

    #[tokio::test]
    async fn test_install_populates_generation() {
        offcache_common::logging::init_test_logging();
        let net = app_net();
        let (controller, _rx) = CacheLifecycleController::new(config("SW0021"), net.clone());

        controller.handle_install(InstallEvent).await.unwrap();

        assert_eq!(controller.state().await, WorkerState::Installed);
        let mut caches = controller.caches.write().await;
        assert!(caches.has("SW0021"));
        assert_eq!(caches.open("SW0021").len(), 3);
        assert_eq!(net.hits(), 3);
    }

    #[tokio::test]
    async fn test_install_atomicity_on_transport_failure() {
        // index.js missing from the network entirely.
        let net = ScriptedNet::new(&[
            ("https://app.example/index.html", 200, b"<html>app</html>"),
            ("https://app.example/sw.js", 200, b"// worker"),
        ]);
        let (controller, _rx) = CacheLifecycleController::new(config("SW0021"), net);

        let result = controller.handle_install(InstallEvent).await;

        assert!(result.is_err());
        assert_eq!(controller.state().await, WorkerState::Redundant);
        assert!(!controller.caches.read().await.has("SW0021"));
    }

    #[tokio::test]
    async fn test_install_atomicity_on_error_status() {
        let net = ScriptedNet::new(&[
            ("https://app.example/index.html", 200, b"<html>app</html>"),
            ("https://app.example/index.js", 404, b""),
            ("https://app.example/sw.js", 200, b"// worker"),
        ]);
        let (controller, _rx) = CacheLifecycleController::new(config("SW0021"), net);

        let result = controller.handle_install(InstallEvent).await;

        assert!(matches!(result, Err(SwError::InstallFailed(_))));
        assert!(!controller.caches.read().await.has("SW0021"));
    }

    #[tokio::test]
    async fn test_activate_evicts_stale_generations() {
        let net = app_net();
        let (controller, _rx) = CacheLifecycleController::new(config("SW0021"), net);

        {
            let mut caches = controller.caches.write().await;
            caches.open("SW0019");
            caches.open("SW0020");
        }

        controller.handle_install(InstallEvent).await.unwrap();
        controller.handle_activate(ActivateEvent).await.unwrap();

        assert_eq!(controller.state().await, WorkerState::Activated);
        let caches = controller.caches.read().await;
        assert_eq!(caches.keys(), vec!["SW0021"]);
    }

    #[tokio::test]
    async fn test_activate_claims_in_scope_clients() {
        let net = app_net();
        let (controller, mut rx) = CacheLifecycleController::new(config("SW0021"), net);

        let (page, foreign) = {
            let mut clients = controller.clients.write().await;
            let page = clients.open(
                Url::parse("https://app.example/notes").unwrap(),
                crate::ClientType::Window,
            );
            let foreign = clients.open(
                Url::parse("https://other.example/").unwrap(),
                crate::ClientType::Window,
            );
            (page, foreign)
        };

        controller.handle_install(InstallEvent).await.unwrap();
        controller.handle_activate(ActivateEvent).await.unwrap();

        let clients = controller.clients.read().await;
        assert!(clients.get(&page.id).unwrap().controlled_by(controller.id()));
        assert!(clients.get(&foreign.id).unwrap().controller.is_none());

        // A ControllerChange notification fired for the claimed page.
        let mut saw_claim = false;
        while let Ok(event) = rx.try_recv() {
            if let WorkerEvent::ControllerChange { client_id } = event {
                assert_eq!(client_id, page.id);
                saw_claim = true;
            }
        }
        assert!(saw_claim);
    }

    #[tokio::test]
    async fn test_fetch_prefers_cache_and_skips_network() {
        let net = app_net();
        let (controller, _rx) = CacheLifecycleController::new(config("SW0021"), net.clone());

        controller.handle_install(InstallEvent).await.unwrap();
        controller.handle_activate(ActivateEvent).await.unwrap();
        let hits_after_install = net.hits();

        let response = controller
            .handle_fetch(get("https://app.example/index.html"))
            .await
            .unwrap();

        assert_eq!(response.status, StatusCode::OK);
        assert_eq!(&response.body[..], b"<html>app</html>");
        assert_eq!(net.hits(), hits_after_install);
    }

    #[tokio::test]
    async fn test_fetch_hits_any_generation() {
        let net = app_net();
        let (controller, _rx) = CacheLifecycleController::new(config("SW0021"), net.clone());

        // Entry left behind by an older deployment, eviction not yet run.
        {
            let mut caches = controller.caches.write().await;
            caches.open("SW0019").put(CacheEntry::new(
                "https://app.example/legacy.css",
                "GET",
                200,
                b"body{}".to_vec(),
            ));
        }

        let response = controller
            .handle_fetch(get("https://app.example/legacy.css"))
            .await
            .unwrap();

        assert_eq!(&response.body[..], b"body{}");
        assert_eq!(net.hits(), 0);
    }

    #[tokio::test]
    async fn test_fetch_falls_back_to_network_without_storing() {
        let net = app_net();
        let (controller, _rx) = CacheLifecycleController::new(config("SW0021"), net.clone());

        controller.handle_install(InstallEvent).await.unwrap();
        let hits_after_install = net.hits();

        let response = controller
            .handle_fetch(get("https://app.example/other.png"))
            .await
            .unwrap();

        assert_eq!(&response.body[..], b"PNG");
        assert_eq!(net.hits(), hits_after_install + 1);

        // Not stored: fetching again goes to the network again.
        controller
            .handle_fetch(get("https://app.example/other.png"))
            .await
            .unwrap();
        assert_eq!(net.hits(), hits_after_install + 2);

        let mut caches = controller.caches.write().await;
        assert_eq!(caches.open("SW0021").len(), 3);
    }

    #[tokio::test]
    async fn test_fetch_miss_propagates_network_failure() {
        let net = app_net();
        let (controller, _rx) = CacheLifecycleController::new(config("SW0021"), net);

        let result = controller
            .handle_fetch(get("https://app.example/offline-only.json"))
            .await;

        assert!(matches!(result, Err(SwError::Network(_))));
    }

    #[tokio::test]
    async fn test_skip_waiting_activates_installed_worker() {
        let net = app_net();
        let (controller, _rx) = CacheLifecycleController::new(config("SW0021"), net);

        {
            let mut caches = controller.caches.write().await;
            caches.open("SW0020");
        }

        controller.handle_install(InstallEvent).await.unwrap();
        assert_eq!(controller.state().await, WorkerState::Installed);

        controller
            .handle_message(MessageEvent::new(SKIP_WAITING))
            .await
            .unwrap();

        assert_eq!(controller.state().await, WorkerState::Activated);
        assert_eq!(controller.caches.read().await.keys(), vec!["SW0021"]);
    }

    #[tokio::test]
    async fn test_skip_waiting_is_idempotent_when_active() {
        let net = app_net();
        let (controller, mut rx) = CacheLifecycleController::new(config("SW0021"), net);

        controller.handle_install(InstallEvent).await.unwrap();
        controller.handle_activate(ActivateEvent).await.unwrap();
        while rx.try_recv().is_ok() {}

        controller
            .handle_message(MessageEvent::new(SKIP_WAITING))
            .await
            .unwrap();

        assert_eq!(controller.state().await, WorkerState::Activated);
        // No second activation: no state-change notifications fired.
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_unrecognized_message_is_ignored() {
        let net = app_net();
        let (controller, mut rx) = CacheLifecycleController::new(config("SW0021"), net);

        controller.handle_install(InstallEvent).await.unwrap();
        while rx.try_recv().is_ok() {}

        controller
            .handle_message(MessageEvent::new("hello"))
            .await
            .unwrap();

        assert_eq!(controller.state().await, WorkerState::Installed);
        assert!(matches!(
            rx.try_recv(),
            Ok(WorkerEvent::Message { data }) if data == "hello"
        ));
    }

    #[tokio::test]
    async fn test_end_to_end_deployment_scenario() {
        offcache_common::logging::init_test_logging();
        let net = app_net();
        let (controller, _rx) = CacheLifecycleController::new(config("SW0021"), net.clone());

        // Leftovers from two previous deployments.
        {
            let mut caches = controller.caches.write().await;
            caches.open("SW0019").put(CacheEntry::new(
                "https://app.example/index.html",
                "GET",
                200,
                b"old".to_vec(),
            ));
            caches.open("SW0020");
        }
        let page = controller
            .clients
            .write()
            .await
            .open(scope(), crate::ClientType::Window);

        // Install: generation SW0021 holds exactly the three manifest assets.
        controller.handle_install(InstallEvent).await.unwrap();
        {
            let mut caches = controller.caches.write().await;
            let current = caches.open("SW0021");
            assert_eq!(current.len(), 3);
            assert!(current
                .match_request("GET", "https://app.example/index.html")
                .is_some());
        }

        // Activate: old generations gone, the open page is controlled.
        controller.handle_activate(ActivateEvent).await.unwrap();
        assert_eq!(controller.caches.read().await.keys(), vec!["SW0021"]);
        assert!(controller
            .clients
            .read()
            .await
            .get(&page.id)
            .unwrap()
            .controlled_by(controller.id()));

        // Cached asset served without a network call.
        let hits = net.hits();
        let cached = controller
            .handle_fetch(get("https://app.example/index.html"))
            .await
            .unwrap();
        assert_eq!(&cached.body[..], b"<html>app</html>");
        assert_eq!(net.hits(), hits);

        // Uncached asset comes from the network and stays uncached.
        let fresh = controller
            .handle_fetch(get("https://app.example/other.png"))
            .await
            .unwrap();
        assert_eq!(&fresh.body[..], b"PNG");
        assert_eq!(net.hits(), hits + 1);
        assert!(controller
            .caches
            .read()
            .await
            .match_request("GET", "https://app.example/other.png")
            .is_none());
    }
}
