//! Registry of open pages and the claim operation.

use hashbrown::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use url::Url;

use crate::WorkerId;

/// Client type.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ClientType {
    #[default]
    Window,
    Worker,
    SharedWorker,
}

/// An open page (or worker context) the host knows about.
#[derive(Debug, Clone)]
pub struct Client {
    /// Client id, assigned by the registry.
    pub id: String,

    /// Client URL.
    pub url: Url,

    /// Client type.
    pub client_type: ClientType,

    /// Controller currently attached to this client, if any.
    pub controller: Option<WorkerId>,
}

impl Client {
    /// Check whether this client sits inside a scope URL.
    pub fn in_scope(&self, scope: &Url) -> bool {
        self.url.as_str().starts_with(scope.as_str())
    }

    /// Check whether this client is controlled by the given worker.
    pub fn controlled_by(&self, worker_id: WorkerId) -> bool {
        self.controller == Some(worker_id)
    }
}

fn next_client_id() -> String {
    static COUNTER: AtomicU64 = AtomicU64::new(1);
    format!("client-{:08x}", COUNTER.fetch_add(1, Ordering::Relaxed))
}

/// The set of open clients.
#[derive(Debug, Default)]
pub struct Clients {
    clients: HashMap<String, Client>,
}

impl Clients {
    /// Create an empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a newly opened page and return its client record.
    pub fn open(&mut self, url: Url, client_type: ClientType) -> Client {
        let client = Client {
            id: next_client_id(),
            url,
            client_type,
            controller: None,
        };
        self.clients.insert(client.id.clone(), client.clone());
        client
    }

    /// Get a client by id.
    pub fn get(&self, id: &str) -> Option<&Client> {
        self.clients.get(id)
    }

    /// All clients of a given type, or all clients when `client_type` is None.
    pub fn match_all(&self, client_type: Option<ClientType>) -> Vec<&Client> {
        self.clients
            .values()
            .filter(|c| client_type.map_or(true, |t| c.client_type == t))
            .collect()
    }

    /// Remove a client (page closed).
    pub fn remove(&mut self, id: &str) -> Option<Client> {
        self.clients.remove(id)
    }

    /// Attach `worker_id` to every in-scope client without a reload.
    ///
    /// Returns the ids of clients whose controller actually changed; clients
    /// already controlled by this worker are left as they are.
    pub fn claim(&mut self, worker_id: WorkerId, scope: &Url) -> Vec<String> {
        let mut claimed = Vec::new();
        for client in self.clients.values_mut() {
            if client.in_scope(scope) && client.controller != Some(worker_id) {
                client.controller = Some(worker_id);
                claimed.push(client.id.clone());
            }
        }
        claimed
    }

    /// Number of open clients.
    pub fn len(&self) -> usize {
        self.clients.len()
    }

    /// Whether the registry is empty.
    pub fn is_empty(&self) -> bool {
        self.clients.is_empty()
    }
}
