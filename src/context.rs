// Process-lifetime state shared by every component, passed in at construction.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, RwLock};

use crate::error::StoreError;
use crate::models::Organization;
use crate::store_repo::StoreClient;

pub struct CollectorContext {
    pub store: Arc<dyn StoreClient>,
    /// Organization name the jobs are installed under.
    pub org_name: String,
    /// Namespace of every job this collector owns.
    pub base_name: String,
    /// Incremented once per hub event; read by the watchdog.
    events_received: Arc<AtomicU64>,
    organization: RwLock<Option<Organization>>,
}

impl CollectorContext {
    pub fn new(store: Arc<dyn StoreClient>, org_name: impl Into<String>, base_name: impl Into<String>) -> Self {
        Self {
            store,
            org_name: org_name.into(),
            base_name: base_name.into(),
            events_received: Arc::new(AtomicU64::new(0)),
            organization: RwLock::new(None),
        }
    }

    pub fn events_received(&self) -> Arc<AtomicU64> {
        self.events_received.clone()
    }

    pub fn events_received_total(&self) -> u64 {
        self.events_received.load(Ordering::Relaxed)
    }

    /// Looks the organization up in the store and caches it.
    pub async fn resolve_organization(&self) -> Result<Organization, StoreError> {
        let orgs = self.store.find_organizations(&self.org_name).await?;
        let org = orgs
            .into_iter()
            .find(|o| o.name == self.org_name)
            .ok_or_else(|| StoreError::NotFound(format!("organization '{}'", self.org_name)))?;
        if let Ok(mut cached) = self.organization.write() {
            *cached = Some(org.clone());
        }
        Ok(org)
    }

    /// Most recently resolved organization, resolving on first use.
    pub async fn organization(&self) -> Result<Organization, StoreError> {
        let cached = self.organization.read().ok().and_then(|o| o.clone());
        match cached {
            Some(org) => Ok(org),
            None => self.resolve_organization().await,
        }
    }
}
