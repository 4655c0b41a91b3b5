//! # Offcache SW
//!
//! The cache lifecycle controller of the Offcache caching proxy: a
//! service-worker-style component that installs a versioned cache generation,
//! evicts stale generations on activation, and answers intercepted requests
//! cache-first.
//!
//! ## Architecture
//!
//! ```text
//! Host runtime
//!     │  install / activate / fetch / message
//!     ▼
//! CacheLifecycleController (one per deployed version tag)
//!     ├── CacheStorage          caches, one generation per version tag
//!     ├── Clients               open pages, claimed on activation
//!     └── dyn NetworkFetch      live network fallback
//! ```
//!
//! Each handler is an async method; the future it returns is the
//! completion-deferral (`waitUntil`) or response-substitution (`respondWith`)
//! capability, and the host awaits it.

use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicU64, Ordering};
use thiserror::Error;
use url::Url;

use offcache_common::OffcacheError;
use offcache_net::{NetError, Request};

pub mod clients;
pub mod controller;

pub use clients::{Client, ClientType, Clients};
pub use controller::CacheLifecycleController;

/// Control token that promotes a waiting worker to activation immediately.
pub const SKIP_WAITING: &str = "skip-waiting";

/// Errors that can occur in the lifecycle controller.
#[derive(Error, Debug)]
pub enum SwError {
    #[error("Install failed: {0}")]
    InstallFailed(String),

    #[error("Invalid resource path: {0}")]
    InvalidResource(String),

    #[error("Corrupt cache entry: {0}")]
    CorruptEntry(String),

    #[error("State error: {0}")]
    StateError(String),

    #[error(transparent)]
    Network(#[from] NetError),
}

impl From<SwError> for OffcacheError {
    fn from(err: SwError) -> Self {
        match err {
            SwError::Network(e) => OffcacheError::network_with_source("fetch failed", e),
            other => OffcacheError::lifecycle(other.to_string()),
        }
    }
}

/// Unique identifier for a controller instance.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct WorkerId(u64);

impl WorkerId {
    fn new() -> Self {
        static COUNTER: AtomicU64 = AtomicU64::new(1);
        Self(COUNTER.fetch_add(1, Ordering::Relaxed))
    }
}

/// Worker lifecycle state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum WorkerState {
    /// Initial state, nothing has run yet.
    Parsed,
    /// Installing (populating the current generation).
    Installing,
    /// Installed but waiting for activation.
    Installed,
    /// Activating (evicting stale generations, claiming clients).
    Activating,
    /// Active and controlling pages.
    Activated,
    /// Replaced, or install failed; eligible only for teardown.
    Redundant,
}

impl Default for WorkerState {
    fn default() -> Self {
        Self::Parsed
    }
}

impl WorkerState {
    /// Check if the worker is active.
    pub fn is_active(&self) -> bool {
        *self == Self::Activated
    }
}

/// Immutable per-deployment configuration.
///
/// The version tag changes only by deploying a new controller build; there is
/// no mutation path at runtime.
#[derive(Debug, Clone)]
pub struct WorkerConfig {
    /// Version tag; also the name of the current cache generation.
    pub version: String,

    /// Relative paths populated into the generation at install time.
    pub precache_manifest: Vec<String>,

    /// Scope URL bounding which clients this worker may claim.
    pub scope: Url,
}

impl WorkerConfig {
    /// Create a configuration.
    pub fn new(version: impl Into<String>, precache_manifest: Vec<String>, scope: Url) -> Self {
        Self {
            version: version.into(),
            precache_manifest,
            scope,
        }
    }

    /// Resolve a manifest path against the scope.
    pub fn resolve(&self, path: &str) -> Result<Url, SwError> {
        self.scope
            .join(path)
            .map_err(|e| SwError::InvalidResource(format!("{}: {}", path, e)))
    }
}

// ==================== Events ====================

/// Install signal from the host.
#[derive(Debug, Default)]
pub struct InstallEvent;

/// Activate signal from the host.
#[derive(Debug, Default)]
pub struct ActivateEvent;

/// An intercepted outgoing request.
#[derive(Debug)]
pub struct FetchEvent {
    /// The request to answer.
    pub request: Request,

    /// Id of the client that issued it, when known.
    pub client_id: Option<String>,
}

impl FetchEvent {
    /// Create a fetch event without client attribution.
    pub fn new(request: Request) -> Self {
        Self {
            request,
            client_id: None,
        }
    }
}

/// A message from a controlled page.
#[derive(Debug, Clone)]
pub struct MessageEvent {
    /// Arbitrary payload.
    pub data: String,

    /// Id of the sending client, when known.
    pub source: Option<String>,
}

impl MessageEvent {
    /// Create a message event without client attribution.
    pub fn new(data: impl Into<String>) -> Self {
        Self {
            data: data.into(),
            source: None,
        }
    }
}

/// Notifications emitted by the controller.
#[derive(Debug, Clone)]
pub enum WorkerEvent {
    /// Lifecycle state changed.
    StateChange {
        worker_id: WorkerId,
        new_state: WorkerState,
    },
    /// A client came under this controller's control.
    ControllerChange { client_id: String },
    /// A non-control message was observed.
    Message { data: String },
}
