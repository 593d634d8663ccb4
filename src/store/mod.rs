//! The coordination-store port consumed by the exchange and the announcer.
//!
//! The store is an external collaborator: a hierarchical KV with indexed
//! versions, directory listings, recursive watches and TTL expiry. This
//! module only defines the narrow capability set the crate needs, plus an
//! in-memory implementation for tests and demos.

pub mod memory;

pub use memory::MemoryStore;

use std::future::Future;
use std::time::Duration;

use tokio::sync::mpsc;

/// One key/value node with its store-wide modification index.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Node {
    pub key: String,
    pub value: String,
    pub modified_index: u64,
}

/// A directory read: the matching nodes and the store index at read time.
#[derive(Debug, Clone)]
pub struct Listing {
    pub nodes: Vec<Node>,
    pub index: u64,
}

/// What a watch event did to its node.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Action {
    Create,
    Set,
    Update,
    CompareAndSwap,
    Delete,
    Expire,
    CompareAndDelete,
}

impl Action {
    /// Creation- and update-like actions, which install routes.
    pub fn is_register(self) -> bool {
        matches!(self, Action::Create | Action::Set | Action::Update | Action::CompareAndSwap)
    }

    /// Removal-like actions, which withdraw routes.
    pub fn is_unregister(self) -> bool {
        matches!(self, Action::Delete | Action::Expire | Action::CompareAndDelete)
    }
}

/// A single mutation observed by a watch. For removal-like actions the node
/// carries the key but an empty value.
#[derive(Debug, Clone)]
pub struct Event {
    pub action: Action,
    pub node: Node,
    pub index: u64,
}

#[derive(Debug, Clone, thiserror::Error)]
pub enum StoreError {
    /// The store's "key absent" answer (code 100 in etcd terms).
    #[error("Key not found: {0}")]
    KeyNotFound(String),

    /// The store's "key already exists" answer, returned by racing directory
    /// creation.
    #[error("Key already exists: {0}")]
    KeyExists(String),

    /// The requested watch index has fallen out of the store's event window.
    #[error("Watch index {0} is no longer in the event window")]
    IndexOutdated(u64),

    #[error("Store transport error: {0}")]
    Transport(String),
}

impl StoreError {
    pub fn is_not_found(&self) -> bool {
        matches!(self, StoreError::KeyNotFound(_))
    }
}

pub trait Store: Send + Sync + 'static {
    /// Reads `key`, returning its node or, for a directory, the nodes below
    /// it (all descendants when `recursive`).
    fn get(
        &self,
        key: &str,
        recursive: bool,
    ) -> impl Future<Output = Result<Listing, StoreError>> + Send;

    /// Creates an empty directory at `key`.
    fn create_dir(&self, key: &str) -> impl Future<Output = Result<(), StoreError>> + Send;

    /// Writes `value` under `key`, overwriting any previous value. A `ttl`
    /// of `None` never expires. Returns the node's new modification index.
    fn set(
        &self,
        key: &str,
        value: &str,
        ttl: Option<Duration>,
    ) -> impl Future<Output = Result<u64, StoreError>> + Send;

    /// Deletes `key` (and, when `recursive`, everything below it). Absent
    /// keys answer [`StoreError::KeyNotFound`].
    fn delete(
        &self,
        key: &str,
        recursive: bool,
    ) -> impl Future<Output = Result<u64, StoreError>> + Send;

    /// Pushes every mutation under `key` with an index at or above
    /// `from_index` into `events`, until a value arrives on `stop` or the
    /// store fails. Dropping the `events` receiver also ends the watch.
    fn watch(
        &self,
        key: &str,
        from_index: u64,
        recursive: bool,
        events: mpsc::Sender<Event>,
        stop: mpsc::Receiver<()>,
    ) -> impl Future<Output = Result<(), StoreError>> + Send;
}
