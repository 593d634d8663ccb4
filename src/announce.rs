use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc;
use uuid::Uuid;

use crate::error::Error;
use crate::record::{Routes, ServiceRecord};
use crate::store::Store;

/// Advertises one backend service's presence in the coordination store.
///
/// The announcer writes a [`ServiceRecord`] under `<namespace>/<id>` and
/// keeps re-writing it under a TTL so that a crashed process falls out of
/// routing once the record expires. The ID is a fresh UUID minted once per
/// announcer; a restarted process is a new service as far as exchanges are
/// concerned.
pub struct Announcer<S> {
    id: String,
    namespace: String,
    address: String,
    routes: Routes,
    store: Arc<S>,
}

impl<S: Store> Announcer<S> {
    pub fn new(
        namespace: impl Into<String>,
        store: Arc<S>,
        address: impl Into<String>,
        routes: Routes,
    ) -> Self {
        Announcer {
            id: Uuid::new_v4().to_string(),
            namespace: namespace.into(),
            address: address.into(),
            routes,
            store,
        }
    }

    /// The UUID identifying this service process.
    pub fn id(&self) -> &str {
        &self.id
    }

    /// The base URL exchanges forward matching requests to.
    pub fn address(&self) -> &str {
        &self.address
    }

    pub fn routes(&self) -> &Routes {
        &self.routes
    }

    fn key(&self) -> String {
        format!("{}/{}", self.namespace, self.id)
    }

    /// Writes this service's record to the store. A `ttl` of `None` never
    /// expires; re-registering overwrites the previous record.
    pub async fn register(&self, ttl: Option<Duration>) -> Result<ServiceRecord, Error> {
        let record = ServiceRecord {
            id: self.id.clone(),
            address: self.address.clone(),
            routes: self.routes.clone(),
        };

        let value = serde_json::to_string(&record)?;
        self.store.set(&self.key(), &value, ttl).await?;

        Ok(record)
    }

    /// Deletes this service's record. Fails with the store's not-found
    /// answer if the service was never registered or already expired.
    pub async fn unregister(&self) -> Result<(), Error> {
        self.store.delete(&self.key(), false).await?;
        Ok(())
    }

    /// Registers immediately, then re-registers with the same `ttl` on every
    /// tick of `interval` until a value arrives on `stop`. Choosing
    /// `interval < ttl` is the caller's contract; failures are logged and
    /// the next tick tries again. Does not unregister on exit.
    pub async fn broadcast(
        &self,
        interval: Duration,
        ttl: Option<Duration>,
        mut stop: mpsc::Receiver<()>,
    ) {
        if let Err(err) = self.register(ttl).await {
            log::warn!("service {} registration failed: {err}", self.id);
        }

        let start = tokio::time::Instant::now() + interval;
        let mut ticker = tokio::time::interval_at(start, interval);

        loop {
            tokio::select! {
                _ = stop.recv() => return,
                _ = ticker.tick() => {
                    if let Err(err) = self.register(ttl).await {
                        log::warn!("service {} re-registration failed: {err}", self.id);
                    }
                }
            }
        }
    }
}
