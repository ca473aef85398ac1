//! Target registry
//!
//! Maps broker-assigned target ids to driver pages, tracks the active
//! target and optional unique human names, and reconciles against the
//! driver's authoritative page list.

use chromiumoxide::Page;
use chromiumoxide_cdp::cdp::browser_protocol::target::TargetId as CdpTargetId;
use parking_lot::Mutex;
use serde::Serialize;
use std::collections::HashMap;
use std::time::Duration;
use tracing::{debug, warn};

use crate::error::{BrokerError, Result};
use crate::ids::TargetId;

/// Bound on title/url reads when listing targets. Expired reads omit the
/// field rather than failing the listing.
const PAGE_READ_TIMEOUT: Duration = Duration::from_secs(2);

struct TargetEntry {
    page: Page,
    name: Option<String>,
}

#[derive(Default)]
struct RegistryInner {
    entries: HashMap<TargetId, TargetEntry>,
    /// Registration order, for active-target reassignment.
    order: Vec<TargetId>,
    active: Option<TargetId>,
}

/// Snapshot row returned by [`TargetRegistry::list`].
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TargetInfo {
    pub target_id: TargetId,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub title: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub url: Option<String>,
    pub active: bool,
    pub r#type: &'static str,
}

#[derive(Default)]
pub struct TargetRegistry {
    inner: Mutex<RegistryInner>,
}

impl TargetRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a page, optionally with a unique name. The first target
    /// registered becomes active.
    pub fn register(&self, page: Page, name: Option<String>) -> Result<TargetId> {
        let mut inner = self.inner.lock();
        if let Some(name) = &name {
            Self::ensure_name_free(&inner, name)?;
        }
        let id = TargetId::new();
        inner.entries.insert(id, TargetEntry { page, name });
        inner.order.push(id);
        if inner.active.is_none() {
            inner.active = Some(id);
        }
        debug!(target = %id, "registered target");
        Ok(id)
    }

    pub fn set_name(&self, id: TargetId, name: String) -> Result<()> {
        let mut inner = self.inner.lock();
        if inner
            .entries
            .iter()
            .any(|(other, e)| *other != id && e.name.as_deref() == Some(name.as_str()))
        {
            return Err(BrokerError::InvalidInput(format!("target name '{name}' already in use")));
        }
        let entry = inner
            .entries
            .get_mut(&id)
            .ok_or_else(|| BrokerError::InvalidInput(format!("unknown target {id}")))?;
        entry.name = Some(name);
        Ok(())
    }

    pub fn remove_name(&self, id: TargetId) -> Result<()> {
        let mut inner = self.inner.lock();
        let entry = inner
            .entries
            .get_mut(&id)
            .ok_or_else(|| BrokerError::InvalidInput(format!("unknown target {id}")))?;
        entry.name = None;
        Ok(())
    }

    /// All named targets as (name, id) pairs.
    pub fn list_named(&self) -> Vec<(String, TargetId)> {
        let inner = self.inner.lock();
        let mut named: Vec<(String, TargetId)> = inner
            .entries
            .iter()
            .filter_map(|(id, e)| e.name.clone().map(|n| (n, *id)))
            .collect();
        named.sort();
        named
    }

    pub fn resolve_name(&self, name: &str) -> Option<TargetId> {
        let inner = self.inner.lock();
        inner
            .entries
            .iter()
            .find(|(_, e)| e.name.as_deref() == Some(name))
            .map(|(id, _)| *id)
    }

    pub fn set_active(&self, id: TargetId) -> Result<()> {
        let mut inner = self.inner.lock();
        if !inner.entries.contains_key(&id) {
            return Err(BrokerError::InvalidInput(format!("unknown target {id}")));
        }
        inner.active = Some(id);
        Ok(())
    }

    pub fn active(&self) -> Option<TargetId> {
        self.inner.lock().active
    }

    /// Active target id, or `no_active_target`.
    pub fn require_active(&self) -> Result<TargetId> {
        self.active().ok_or(BrokerError::NoActiveTarget)
    }

    pub fn page(&self, id: TargetId) -> Result<Page> {
        self.inner
            .lock()
            .entries
            .get(&id)
            .map(|e| e.page.clone())
            .ok_or_else(|| BrokerError::InvalidInput(format!("unknown target {id}")))
    }

    pub fn contains(&self, id: TargetId) -> bool {
        self.inner.lock().entries.contains_key(&id)
    }

    pub fn len(&self) -> usize {
        self.inner.lock().entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.lock().entries.is_empty()
    }

    /// All registered pages in registration order.
    pub fn pages(&self) -> Vec<(TargetId, Page)> {
        let inner = self.inner.lock();
        inner
            .order
            .iter()
            .filter_map(|id| inner.entries.get(id).map(|e| (*id, e.page.clone())))
            .collect()
    }

    /// Snapshot of all targets. Title/url reads are bounded; a slow page
    /// yields a row with those fields omitted.
    pub async fn list(&self, include_urls: bool) -> Vec<TargetInfo> {
        let (rows, active) = {
            let inner = self.inner.lock();
            let rows: Vec<(TargetId, Option<String>, Page)> = inner
                .order
                .iter()
                .filter_map(|id| {
                    inner.entries.get(id).map(|e| (*id, e.name.clone(), e.page.clone()))
                })
                .collect();
            (rows, inner.active)
        };

        let mut out = Vec::with_capacity(rows.len());
        for (id, name, page) in rows {
            let title = bounded_title(&page).await;
            let url = if include_urls { bounded_url(&page).await } else { None };
            out.push(TargetInfo {
                target_id: id,
                name,
                title,
                url,
                active: active == Some(id),
                r#type: "page",
            });
        }
        out
    }

    /// Remove a target, reassigning active to the first remaining target in
    /// registration order (or none). Returns the removed page.
    pub fn remove(&self, id: TargetId) -> Result<Page> {
        let mut inner = self.inner.lock();
        let entry = inner
            .entries
            .remove(&id)
            .ok_or_else(|| BrokerError::InvalidInput(format!("unknown target {id}")))?;
        inner.order.retain(|other| *other != id);
        if inner.active == Some(id) {
            inner.active = inner.order.first().copied();
        }
        debug!(target = %id, new_active = ?inner.active, "removed target");
        Ok(entry.page)
    }

    /// Reconcile with the driver's page list: drop targets whose pages are
    /// gone, register pages the driver knows that we do not. Returns ids of
    /// dropped targets so callers can clear dependent state.
    pub fn sync(&self, driver_pages: Vec<Page>) -> Vec<TargetId> {
        let mut inner = self.inner.lock();

        let driver_ids: Vec<CdpTargetId> =
            driver_pages.iter().map(|p| p.target_id().clone()).collect();

        let stale: Vec<TargetId> = inner
            .entries
            .iter()
            .filter(|(_, e)| !driver_ids.contains(e.page.target_id()))
            .map(|(id, _)| *id)
            .collect();
        for id in &stale {
            inner.entries.remove(id);
            inner.order.retain(|other| other != id);
            warn!(target = %id, "dropped target closed on the driver side");
        }

        let known: Vec<CdpTargetId> =
            inner.entries.values().map(|e| e.page.target_id().clone()).collect();
        for page in driver_pages {
            if !known.contains(page.target_id()) {
                let id = TargetId::new();
                inner.entries.insert(id, TargetEntry { page, name: None });
                inner.order.push(id);
                debug!(target = %id, "registered driver-discovered target");
            }
        }

        if inner.active.is_none_or(|active| !inner.entries.contains_key(&active)) {
            inner.active = inner.order.first().copied();
        }
        stale
    }

    fn ensure_name_free(inner: &RegistryInner, name: &str) -> Result<()> {
        if inner.entries.values().any(|e| e.name.as_deref() == Some(name)) {
            return Err(BrokerError::InvalidInput(format!("target name '{name}' already in use")));
        }
        Ok(())
    }
}

async fn bounded_title(page: &Page) -> Option<String> {
    match tokio::time::timeout(PAGE_READ_TIMEOUT, page.get_title()).await {
        Ok(Ok(title)) => title,
        Ok(Err(_)) | Err(_) => None,
    }
}

async fn bounded_url(page: &Page) -> Option<String> {
    match tokio::time::timeout(PAGE_READ_TIMEOUT, page.url()).await {
        Ok(Ok(url)) => url,
        Ok(Err(_)) | Err(_) => None,
    }
}
