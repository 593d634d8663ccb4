use std::sync::Arc;
use std::time::Duration;

use rustc_hash::FxHashMap;
use tokio::sync::mpsc;

use crate::error::Error;
use crate::mux::ExchangeMux;
use crate::record::ServiceRecord;
use crate::store::{Event, Store, StoreError};

/// Lifecycle of an [`Exchange`]. Watching may only be entered after the
/// snapshot, and `Stopped` is terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum State {
    Created,
    Initialized,
    Watching,
    Stopped,
}

struct TrackedService {
    record: ServiceRecord,
    modified_index: u64,
}

/// Keeps an [`ExchangeMux`] in sync with the service records under one
/// coordination-store namespace: a bulk snapshot at startup
/// ([`init`](Self::init)), then incremental mutations applied as the store
/// emits them ([`watch`](Self::watch)).
///
/// The exchange is a cache over the store, not a source of truth; it retains
/// the last-seen record per service so that deletion events, which carry
/// only a key, can withdraw the right routes.
pub struct Exchange<S> {
    namespace: String,
    store: Arc<S>,
    mux: Arc<ExchangeMux>,
    wait_index: u64,
    services: FxHashMap<String, TrackedService>,
    state: State,
}

/// Pause between a failed watch and the resynchronizing snapshot in
/// [`Exchange::run`].
const RESYNC_DELAY: Duration = Duration::from_millis(200);

impl<S: Store> Exchange<S> {
    pub fn new(namespace: impl Into<String>, store: Arc<S>, mux: Arc<ExchangeMux>) -> Self {
        Exchange {
            namespace: namespace.into(),
            store,
            mux,
            wait_index: 0,
            services: FxHashMap::default(),
            state: State::Created,
        }
    }

    pub fn state(&self) -> State {
        self.state
    }

    pub fn mux(&self) -> &Arc<ExchangeMux> {
        &self.mux
    }

    /// Snapshots the namespace into the routing table. An absent namespace
    /// is created as an empty directory; losing that race to another
    /// process is fine. Malformed records are logged and skipped.
    ///
    /// Calling `init` again before watching re-snapshots from scratch.
    pub async fn init(&mut self) -> Result<(), Error> {
        if !matches!(self.state, State::Created | State::Initialized) {
            return Err(Error::InvalidState { expected: State::Created, actual: self.state });
        }

        self.withdraw_all();

        let listing = match self.store.get(&self.namespace, true).await {
            Ok(listing) => listing,
            Err(err) if err.is_not_found() => {
                match self.store.create_dir(&self.namespace).await {
                    Ok(()) | Err(StoreError::KeyExists(_)) => {}
                    Err(err) => return Err(err.into()),
                }
                self.store.get(&self.namespace, true).await?
            }
            Err(err) => return Err(err.into()),
        };

        for node in &listing.nodes {
            match serde_json::from_str::<ServiceRecord>(&node.value) {
                Ok(record) => self.install(record, node.modified_index),
                Err(err) => {
                    log::warn!("dropping malformed service record at {}: {err}", node.key);
                }
            }
        }

        self.wait_index = listing.index + 1;
        self.state = State::Initialized;
        Ok(())
    }

    /// Applies store mutations to the routing table until a value arrives on
    /// `stop` (clean stop, `Stopped` is entered) or the store watch fails
    /// (the error is returned and the exchange drops back to `Initialized`
    /// so it can be re-snapshotted).
    pub async fn watch(&mut self, stop: &mut mpsc::Receiver<()>) -> Result<(), Error> {
        if self.state != State::Initialized {
            return Err(Error::InvalidState { expected: State::Initialized, actual: self.state });
        }
        self.state = State::Watching;

        let (event_tx, mut events) = mpsc::channel(1);
        let (watch_stop_tx, watch_stop_rx) = mpsc::channel(1);

        let watcher = {
            let store = self.store.clone();
            let namespace = self.namespace.clone();
            let from_index = self.wait_index;
            tokio::spawn(async move {
                store.watch(&namespace, from_index, true, event_tx, watch_stop_rx).await
            })
        };

        let mut stopping = false;
        loop {
            tokio::select! {
                event = events.recv() => match event {
                    Some(event) => self.apply(event),
                    None => break,
                },
                _ = stop.recv(), if !stopping => {
                    stopping = true;
                    let _ = watch_stop_tx.send(()).await;
                }
            }
        }

        let result = match watcher.await {
            Ok(result) => result,
            Err(err) => Err(StoreError::Transport(err.to_string())),
        };

        if stopping {
            self.state = State::Stopped;
            return Ok(());
        }

        self.state = State::Initialized;
        match result {
            Ok(()) => Err(StoreError::Transport("watch ended unexpectedly".to_owned()).into()),
            Err(err) => Err(err.into()),
        }
    }

    /// Runs the discovery loop to completion: snapshot, watch, and on watch
    /// failure a full resynchronization (withdraw everything, snapshot
    /// again, resume watching). Returns once stopped, or with the error
    /// that kept the snapshot itself from completing.
    pub async fn run(&mut self, mut stop: mpsc::Receiver<()>) -> Result<(), Error> {
        loop {
            self.init().await?;
            match self.watch(&mut stop).await {
                Ok(()) => return Ok(()),
                Err(err) => {
                    log::warn!("watch failed, resynchronizing routes: {err}");
                    tokio::time::sleep(RESYNC_DELAY).await;
                }
            }
        }
    }

    /// Applies one watch event. Register-like actions install the decoded
    /// record's routes, withdrawing the previous record's routes first when
    /// the ID is already known; removal-like actions withdraw the remembered
    /// record. Replayed events (modified index at or below the last applied
    /// one for that service) and unknown actions are ignored.
    fn apply(&mut self, event: Event) {
        self.wait_index = self.wait_index.max(event.node.modified_index + 1);

        if event.action.is_register() {
            let record = match serde_json::from_str::<ServiceRecord>(&event.node.value) {
                Ok(record) => record,
                Err(err) => {
                    log::warn!("dropping malformed service record at {}: {err}", event.node.key);
                    return;
                }
            };

            if let Some(existing) = self.services.get(&record.id) {
                if event.node.modified_index <= existing.modified_index {
                    log::debug!("ignoring replayed register for service {}", record.id);
                    return;
                }
                if let Some(existing) = self.services.remove(&record.id) {
                    self.withdraw(&existing.record);
                }
            }

            log::debug!("installing routes for service {} at {}", record.id, record.address);
            self.install(record, event.node.modified_index);
        } else if event.action.is_unregister() {
            let Some(id) = self.service_id(&event.node.key) else {
                log::warn!("unregister event outside namespace: {}", event.node.key);
                return;
            };

            match self.services.get(id) {
                None => log::debug!("unregister for unknown service {id}"),
                Some(existing) if event.node.modified_index <= existing.modified_index => {
                    log::debug!("ignoring replayed unregister for service {id}");
                }
                Some(_) => {
                    if let Some(existing) = self.services.remove(id) {
                        log::debug!("withdrawing routes for service {id}");
                        self.withdraw(&existing.record);
                    }
                }
            }
        } else {
            log::warn!("ignoring unknown action {:?} on {}", event.action, event.node.key);
        }
    }

    fn install(&mut self, record: ServiceRecord, modified_index: u64) {
        for (method, patterns) in &record.routes {
            for pattern in patterns {
                self.mux.add(method, pattern, &record.address);
            }
        }
        self.services.insert(record.id.clone(), TrackedService { record, modified_index });
    }

    fn withdraw(&self, record: &ServiceRecord) {
        for (method, patterns) in &record.routes {
            for pattern in patterns {
                self.mux.remove(method, pattern, &record.address);
            }
        }
    }

    fn withdraw_all(&mut self) {
        for service in std::mem::take(&mut self.services).into_values() {
            self.withdraw(&service.record);
        }
    }

    /// Translates an event key back to the service ID by stripping the
    /// leading slash, the namespace and one separator.
    fn service_id<'a>(&self, key: &'a str) -> Option<&'a str> {
        key.strip_prefix('/')
            .unwrap_or(key)
            .strip_prefix(self.namespace.as_str())?
            .strip_prefix('/')
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::time::Duration;

    use tokio::sync::mpsc;

    use super::{Exchange, State};
    use crate::announce::Announcer;
    use crate::mux::ExchangeMux;
    use crate::record::Routes;
    use crate::store::{Action, Event, MemoryStore, Node, Store};

    fn user_routes() -> Routes {
        let mut routes = Routes::new();
        routes.insert("GET".to_owned(), vec!["/users".to_owned(), "/user/:id".to_owned()]);
        routes
    }

    fn fixture() -> (Arc<MemoryStore>, Arc<ExchangeMux>, Exchange<MemoryStore>) {
        let store = Arc::new(MemoryStore::new());
        let mux = Arc::new(ExchangeMux::new());
        let exchange = Exchange::new("test", store.clone(), mux.clone());
        (store, mux, exchange)
    }

    /// Polls the mux until `expected` shows up, or panics after the bounded
    /// wait the store is allowed to take to propagate an update.
    async fn wait_for_match(mux: &ExchangeMux, method: &str, path: &str, expected: Option<Vec<String>>) {
        for _ in 0..500 {
            if mux.match_route(method, path) == expected {
                return;
            }
            tokio::time::sleep(Duration::from_millis(1)).await;
        }
        panic!("mux never converged on {expected:?} for {method} {path}");
    }

    #[tokio::test]
    async fn init_creates_a_missing_namespace() {
        let (store, _mux, mut exchange) = fixture();

        exchange.init().await.unwrap();

        assert_eq!(exchange.state(), State::Initialized);
        assert!(store.get("test", false).await.is_ok());
    }

    #[tokio::test]
    async fn init_installs_the_snapshot() {
        let (store, mux, mut exchange) = fixture();

        let announcer = Announcer::new("test", store, "http://localhost:8080", user_routes());
        announcer.register(None).await.unwrap();

        exchange.init().await.unwrap();

        let expected = Some(vec!["http://localhost:8080".to_owned()]);
        assert_eq!(mux.match_route("GET", "/users"), expected);
        assert_eq!(mux.match_route("GET", "/user/123"), expected);
    }

    #[tokio::test]
    async fn init_skips_malformed_records() {
        let (store, mux, mut exchange) = fixture();

        store.set("test/garbage", "not a record", None).await.unwrap();
        let announcer = Announcer::new("test", store, "http://localhost:8080", user_routes());
        announcer.register(None).await.unwrap();

        exchange.init().await.unwrap();

        assert!(mux.match_route("GET", "/users").is_some());
    }

    #[tokio::test]
    async fn watch_requires_init_first() {
        let (_store, _mux, mut exchange) = fixture();

        let (_stop_tx, mut stop_rx) = mpsc::channel(1);
        let err = exchange.watch(&mut stop_rx).await.unwrap_err();
        assert!(matches!(err, crate::Error::InvalidState { .. }));
    }

    #[tokio::test]
    async fn watch_returns_when_stopped() {
        let (_store, _mux, mut exchange) = fixture();
        exchange.init().await.unwrap();

        let (stop_tx, mut stop_rx) = mpsc::channel(1);
        let task = tokio::spawn(async move {
            exchange.watch(&mut stop_rx).await.unwrap();
            exchange
        });

        stop_tx.send(()).await.unwrap();
        let exchange = task.await.unwrap();
        assert_eq!(exchange.state(), State::Stopped);
    }

    #[tokio::test]
    async fn watch_installs_newly_registered_services() {
        let (store, mux, mut exchange) = fixture();
        exchange.init().await.unwrap();

        let (stop_tx, mut stop_rx) = mpsc::channel(1);
        let task = tokio::spawn(async move { exchange.watch(&mut stop_rx).await });

        let announcer = Announcer::new("test", store, "http://localhost:8080", user_routes());
        announcer.register(None).await.unwrap();

        wait_for_match(&mux, "GET", "/users", Some(vec!["http://localhost:8080".to_owned()])).await;

        stop_tx.send(()).await.unwrap();
        task.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn watch_withdraws_unregistered_services() {
        let (store, mux, mut exchange) = fixture();

        let announcer = Announcer::new("test", store, "http://localhost:8080", user_routes());
        announcer.register(None).await.unwrap();
        exchange.init().await.unwrap();

        let (stop_tx, mut stop_rx) = mpsc::channel(1);
        let task = tokio::spawn(async move { exchange.watch(&mut stop_rx).await });

        announcer.unregister().await.unwrap();

        wait_for_match(&mux, "GET", "/users", None).await;
        wait_for_match(&mux, "GET", "/user/123", None).await;

        stop_tx.send(()).await.unwrap();
        task.await.unwrap().unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn watch_withdraws_expired_services() {
        let (store, mux, mut exchange) = fixture();

        let announcer = Announcer::new("test", store, "http://localhost:8080", user_routes());
        announcer.register(Some(Duration::from_millis(50))).await.unwrap();
        exchange.init().await.unwrap();

        let (stop_tx, mut stop_rx) = mpsc::channel(1);
        let task = tokio::spawn(async move { exchange.watch(&mut stop_rx).await });

        wait_for_match(&mux, "GET", "/users", None).await;

        stop_tx.send(()).await.unwrap();
        task.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn watch_replaces_routes_when_a_record_changes() {
        let (store, mux, mut exchange) = fixture();

        let announcer = Announcer::new("test", store.clone(), "http://localhost:8080", user_routes());
        announcer.register(None).await.unwrap();
        exchange.init().await.unwrap();

        let (stop_tx, mut stop_rx) = mpsc::channel(1);
        let task = tokio::spawn(async move { exchange.watch(&mut stop_rx).await });

        // same service ID, different routes
        let updated = format!(
            r#"{{"id":"{}","address":"http://localhost:8080","routes":{{"GET":["/people"]}}}}"#,
            announcer.id()
        );
        store.set(&format!("test/{}", announcer.id()), &updated, None).await.unwrap();

        wait_for_match(&mux, "GET", "/people", Some(vec!["http://localhost:8080".to_owned()])).await;
        wait_for_match(&mux, "GET", "/users", None).await;

        stop_tx.send(()).await.unwrap();
        task.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn replayed_events_are_ignored() {
        let (store, mux, mut exchange) = fixture();

        let announcer = Announcer::new("test", store, "http://localhost:8080", user_routes());
        let record = announcer.register(None).await.unwrap();
        exchange.init().await.unwrap();

        let installed = exchange.services[announcer.id()].modified_index;

        // a replayed set at the installed index must not disturb the table,
        // and a stale delete must not withdraw anything
        exchange.apply(Event {
            action: Action::Set,
            node: Node {
                key: format!("test/{}", announcer.id()),
                value: serde_json::to_string(&record).unwrap(),
                modified_index: installed,
            },
            index: installed,
        });
        exchange.apply(Event {
            action: Action::Delete,
            node: Node {
                key: format!("test/{}", announcer.id()),
                value: String::new(),
                modified_index: installed,
            },
            index: installed,
        });

        assert!(mux.match_route("GET", "/users").is_some());
        assert!(exchange.services.contains_key(announcer.id()));
    }

    #[tokio::test]
    async fn run_returns_when_stopped() {
        let (store, mux, mut exchange) = fixture();

        let (stop_tx, stop_rx) = mpsc::channel(1);
        let task = tokio::spawn(async move { exchange.run(stop_rx).await });

        let announcer = Announcer::new("test", store, "http://localhost:8080", user_routes());
        announcer.register(None).await.unwrap();
        wait_for_match(&mux, "GET", "/users", Some(vec!["http://localhost:8080".to_owned()])).await;

        stop_tx.send(()).await.unwrap();
        task.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn stopped_is_terminal() {
        let (_store, _mux, mut exchange) = fixture();
        exchange.init().await.unwrap();

        let (stop_tx, mut stop_rx) = mpsc::channel(1);
        stop_tx.send(()).await.unwrap();
        exchange.watch(&mut stop_rx).await.unwrap();

        assert!(matches!(
            exchange.init().await.unwrap_err(),
            crate::Error::InvalidState { .. }
        ));
    }

    #[test]
    fn service_ids_derive_from_keys() {
        let store = Arc::new(MemoryStore::new());
        let exchange = Exchange::new("test", store, Arc::new(ExchangeMux::new()));

        assert_eq!(exchange.service_id("/test/abc"), Some("abc"));
        assert_eq!(exchange.service_id("test/abc"), Some("abc"));
        assert_eq!(exchange.service_id("/other/abc"), None);
        assert_eq!(exchange.service_id("/test"), None);
    }
}
