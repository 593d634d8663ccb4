//! In-memory coordination store used by tests and demo programs.

use std::collections::{BTreeMap, HashSet, VecDeque};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::sync::{broadcast, mpsc};
use tokio::time::Instant;

use super::{Action, Event, Listing, Node, Store, StoreError};

/// How many past events a watch can be resumed from before the window is
/// considered lost and watchers get [`StoreError::IndexOutdated`].
const EVENT_WINDOW: usize = 256;

struct Stored {
    value: String,
    modified_index: u64,
    deadline: Option<Instant>,
}

struct State {
    nodes: BTreeMap<String, Stored>,
    dirs: HashSet<String>,
    index: u64,
    history: VecDeque<Event>,
    pruned_through: u64,
}

struct Inner {
    state: Mutex<State>,
    events: broadcast::Sender<Event>,
}

/// A hierarchical KV store held entirely in memory, with indexed mutations,
/// TTL expiry and resumable prefix watches. Clones share the same state.
#[derive(Clone)]
pub struct MemoryStore {
    inner: Arc<Inner>,
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryStore {
    pub fn new() -> Self {
        let (events, _) = broadcast::channel(EVENT_WINDOW);

        MemoryStore {
            inner: Arc::new(Inner {
                state: Mutex::new(State {
                    nodes: BTreeMap::new(),
                    dirs: HashSet::new(),
                    index: 0,
                    history: VecDeque::new(),
                    pruned_through: 0,
                }),
                events,
            }),
        }
    }
}

impl Inner {
    /// Records a mutation in the replay window and fans it out to live
    /// watchers. Must be called with the state lock held so watchers never
    /// observe an event both in their backlog snapshot and live.
    fn publish(&self, state: &mut State, action: Action, key: &str, value: &str) -> u64 {
        state.index += 1;
        let index = state.index;

        let event = Event {
            action,
            node: Node {
                key: key.to_owned(),
                value: value.to_owned(),
                modified_index: index,
            },
            index,
        };

        state.history.push_back(event.clone());
        while state.history.len() > EVENT_WINDOW {
            if let Some(pruned) = state.history.pop_front() {
                state.pruned_through = pruned.node.modified_index;
            }
        }

        // nobody watching is fine
        let _ = self.events.send(event);

        index
    }

    fn expire(&self, key: &str, set_index: u64) {
        let mut state = self.state.lock().unwrap();

        // the key was overwritten or deleted since this timer was armed
        match state.nodes.get(key) {
            Some(stored) if stored.modified_index == set_index => {}
            _ => return,
        }

        state.nodes.remove(key);
        self.publish(&mut state, Action::Expire, key, "");
    }
}

/// Stores treat a single leading `/` as equivalent to none.
fn normalize(key: &str) -> &str {
    key.strip_prefix('/').unwrap_or(key)
}

fn is_live(stored: &Stored, now: Instant) -> bool {
    stored.deadline.map_or(true, |deadline| deadline > now)
}

impl Store for MemoryStore {
    async fn get(&self, key: &str, recursive: bool) -> Result<Listing, StoreError> {
        let key = normalize(key);
        let now = Instant::now();
        let state = self.inner.state.lock().unwrap();

        let mut nodes = Vec::new();
        if let Some(stored) = state.nodes.get(key) {
            if is_live(stored, now) {
                nodes.push(Node {
                    key: key.to_owned(),
                    value: stored.value.clone(),
                    modified_index: stored.modified_index,
                });
            }
        }

        let prefix = format!("{key}/");
        let mut has_children = false;
        for (child, stored) in state.nodes.iter() {
            let Some(rest) = child.strip_prefix(&prefix) else { continue };
            has_children = true;
            if !is_live(stored, now) {
                continue;
            }
            if recursive || !rest.contains('/') {
                nodes.push(Node {
                    key: child.clone(),
                    value: stored.value.clone(),
                    modified_index: stored.modified_index,
                });
            }
        }

        if nodes.is_empty() && !has_children && !state.dirs.contains(key) {
            return Err(StoreError::KeyNotFound(key.to_owned()));
        }

        Ok(Listing { nodes, index: state.index })
    }

    async fn create_dir(&self, key: &str) -> Result<(), StoreError> {
        let key = normalize(key);
        let mut state = self.inner.state.lock().unwrap();

        let prefix = format!("{key}/");
        let occupied = state.nodes.contains_key(key)
            || state.dirs.contains(key)
            || state.nodes.keys().any(|child| child.starts_with(&prefix));
        if occupied {
            return Err(StoreError::KeyExists(key.to_owned()));
        }

        state.dirs.insert(key.to_owned());
        state.index += 1;
        Ok(())
    }

    async fn set(&self, key: &str, value: &str, ttl: Option<Duration>) -> Result<u64, StoreError> {
        let key = normalize(key);
        let deadline = ttl.map(|ttl| Instant::now() + ttl);

        let index = {
            let mut state = self.inner.state.lock().unwrap();
            let index = self.inner.publish(&mut state, Action::Set, key, value);
            state.nodes.insert(
                key.to_owned(),
                Stored { value: value.to_owned(), modified_index: index, deadline },
            );
            index
        };

        if let Some(deadline) = deadline {
            let inner = self.inner.clone();
            let key = key.to_owned();
            tokio::spawn(async move {
                tokio::time::sleep_until(deadline).await;
                inner.expire(&key, index);
            });
        }

        Ok(index)
    }

    async fn delete(&self, key: &str, recursive: bool) -> Result<u64, StoreError> {
        let key = normalize(key);
        let mut state = self.inner.state.lock().unwrap();

        if state.nodes.remove(key).is_some() {
            return Ok(self.inner.publish(&mut state, Action::Delete, key, ""));
        }

        let prefix = format!("{key}/");
        let children: Vec<String> =
            state.nodes.keys().filter(|child| child.starts_with(&prefix)).cloned().collect();

        if !state.dirs.contains(key) && children.is_empty() {
            return Err(StoreError::KeyNotFound(key.to_owned()));
        }
        if !recursive {
            return Err(StoreError::Transport(format!("{key} is a directory")));
        }

        let mut index = state.index;
        for child in children {
            state.nodes.remove(&child);
            index = self.inner.publish(&mut state, Action::Delete, &child, "");
        }
        state.dirs.retain(|dir| dir != key && !dir.starts_with(&prefix));
        Ok(index)
    }

    async fn watch(
        &self,
        key: &str,
        from_index: u64,
        recursive: bool,
        events: mpsc::Sender<Event>,
        mut stop: mpsc::Receiver<()>,
    ) -> Result<(), StoreError> {
        let key = normalize(key);
        let matches = |candidate: &str| {
            candidate == key
                || candidate
                    .strip_prefix(key)
                    .and_then(|rest| rest.strip_prefix('/'))
                    .is_some_and(|rest| recursive || !rest.contains('/'))
        };

        let (mut live, backlog) = {
            let state = self.inner.state.lock().unwrap();
            if from_index > 0 && from_index <= state.pruned_through {
                return Err(StoreError::IndexOutdated(from_index));
            }

            let backlog: Vec<Event> = state
                .history
                .iter()
                .filter(|event| event.node.modified_index >= from_index && matches(&event.node.key))
                .cloned()
                .collect();

            (self.inner.events.subscribe(), backlog)
        };

        let mut last = from_index.saturating_sub(1);
        for event in backlog {
            last = last.max(event.node.modified_index);
            if events.send(event).await.is_err() {
                return Ok(());
            }
        }

        loop {
            tokio::select! {
                _ = stop.recv() => return Ok(()),
                received = live.recv() => match received {
                    Ok(event) => {
                        if event.node.modified_index <= last || !matches(&event.node.key) {
                            continue;
                        }
                        last = event.node.modified_index;
                        if events.send(event).await.is_err() {
                            return Ok(());
                        }
                    }
                    Err(broadcast::error::RecvError::Lagged(_)) => {
                        return Err(StoreError::IndexOutdated(last + 1));
                    }
                    Err(broadcast::error::RecvError::Closed) => return Ok(()),
                },
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use tokio::sync::mpsc;

    use super::{Action, MemoryStore, Store, StoreError};

    #[tokio::test]
    async fn get_of_absent_key_is_not_found() {
        let store = MemoryStore::new();

        let err = store.get("missing", false).await.unwrap_err();
        assert!(err.is_not_found());
    }

    #[tokio::test]
    async fn set_then_get_round_trips() {
        let store = MemoryStore::new();

        let index = store.set("ns/a", "1", None).await.unwrap();
        let listing = store.get("ns/a", false).await.unwrap();

        assert_eq!(listing.nodes.len(), 1);
        assert_eq!(listing.nodes[0].value, "1");
        assert_eq!(listing.nodes[0].modified_index, index);
    }

    #[tokio::test]
    async fn leading_slash_is_equivalent_to_none() {
        let store = MemoryStore::new();

        store.set("/ns/a", "1", None).await.unwrap();
        assert!(store.get("ns/a", false).await.is_ok());
        assert!(store.get("/ns", true).await.is_ok());
    }

    #[tokio::test]
    async fn recursive_get_lists_descendants() {
        let store = MemoryStore::new();

        store.set("ns/a", "1", None).await.unwrap();
        store.set("ns/b/c", "2", None).await.unwrap();

        let recursive = store.get("ns", true).await.unwrap();
        assert_eq!(recursive.nodes.len(), 2);

        let direct = store.get("ns", false).await.unwrap();
        assert_eq!(direct.nodes.len(), 1);
        assert_eq!(direct.nodes[0].key, "ns/a");
    }

    #[tokio::test]
    async fn create_dir_conflicts_are_key_exists() {
        let store = MemoryStore::new();

        store.create_dir("ns").await.unwrap();
        assert!(matches!(
            store.create_dir("ns").await,
            Err(StoreError::KeyExists(_))
        ));

        let listing = store.get("ns", true).await.unwrap();
        assert!(listing.nodes.is_empty());
    }

    #[tokio::test]
    async fn delete_of_absent_key_is_not_found() {
        let store = MemoryStore::new();

        assert!(store.delete("ns/a", false).await.unwrap_err().is_not_found());
    }

    #[tokio::test]
    async fn recursive_delete_clears_a_directory() {
        let store = MemoryStore::new();

        store.set("ns/a", "1", None).await.unwrap();
        store.set("ns/b", "2", None).await.unwrap();
        store.delete("ns", true).await.unwrap();

        assert!(store.get("ns/a", false).await.unwrap_err().is_not_found());
        assert!(store.get("ns/b", false).await.unwrap_err().is_not_found());
    }

    #[tokio::test(start_paused = true)]
    async fn ttl_expires_keys() {
        let store = MemoryStore::new();

        store.set("ns/a", "1", Some(Duration::from_millis(50))).await.unwrap();
        assert!(store.get("ns/a", false).await.is_ok());

        tokio::time::sleep(Duration::from_millis(100)).await;
        assert!(store.get("ns/a", false).await.unwrap_err().is_not_found());
    }

    #[tokio::test(start_paused = true)]
    async fn overwrite_disarms_the_previous_ttl() {
        let store = MemoryStore::new();

        store.set("ns/a", "1", Some(Duration::from_millis(50))).await.unwrap();
        store.set("ns/a", "2", None).await.unwrap();

        tokio::time::sleep(Duration::from_millis(100)).await;
        let listing = store.get("ns/a", false).await.unwrap();
        assert_eq!(listing.nodes[0].value, "2");
    }

    #[tokio::test(start_paused = true)]
    async fn watch_replays_history_then_streams_live_events() {
        let store = MemoryStore::new();

        let first = store.set("ns/a", "1", None).await.unwrap();

        let (event_tx, mut events) = mpsc::channel(4);
        let (_stop_tx, stop_rx) = mpsc::channel(1);
        let watcher = {
            let store = store.clone();
            tokio::spawn(async move { store.watch("ns", first, true, event_tx, stop_rx).await })
        };

        let replayed = events.recv().await.unwrap();
        assert_eq!(replayed.action, Action::Set);
        assert_eq!(replayed.node.key, "ns/a");
        assert_eq!(replayed.node.modified_index, first);

        let second = store.set("ns/b", "2", None).await.unwrap();
        store.set("other/c", "3", None).await.unwrap();
        store.delete("ns/b", false).await.unwrap();

        let live = events.recv().await.unwrap();
        assert_eq!(live.node.key, "ns/b");
        assert_eq!(live.node.modified_index, second);

        // the unrelated prefix is filtered out
        let deleted = events.recv().await.unwrap();
        assert_eq!(deleted.action, Action::Delete);
        assert_eq!(deleted.node.key, "ns/b");
        assert_eq!(deleted.node.value, "");

        watcher.abort();
    }

    #[tokio::test]
    async fn watch_returns_when_stopped() {
        let store = MemoryStore::new();

        let (event_tx, _events) = mpsc::channel(4);
        let (stop_tx, stop_rx) = mpsc::channel(1);
        let watcher = {
            let store = store.clone();
            tokio::spawn(async move { store.watch("ns", 0, true, event_tx, stop_rx).await })
        };

        stop_tx.send(()).await.unwrap();
        assert!(watcher.await.unwrap().is_ok());
    }

    #[tokio::test]
    async fn watch_from_a_pruned_index_is_outdated() {
        let store = MemoryStore::new();

        for i in 0..(super::EVENT_WINDOW + 10) {
            store.set("ns/a", &i.to_string(), None).await.unwrap();
        }

        let (event_tx, _events) = mpsc::channel(4);
        let (_stop_tx, stop_rx) = mpsc::channel(1);
        let result = store.watch("ns", 1, true, event_tx, stop_rx).await;

        assert!(matches!(result, Err(StoreError::IndexOutdated(_))));
    }
}
