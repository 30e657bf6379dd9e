//! Router Table: an immutable snapshot mapping canonical domains to
//! their backend set, published by the Config Compositor and consumed
//! by the reverse proxy on every request. An `ArcSwap` holds the
//! current snapshot so readers never block on a writer, and a rebuild
//! is "construct the whole new thing, then swap the pointer" rather
//! than mutate-in-place.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use arc_swap::ArcSwap;
use haloyd_common::DeploymentId;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum RouteError {
    #[error("no route for host {0:?}")]
    UnknownHost(String),
    #[error("no healthy backend for {0:?}")]
    NoHealthyBackend(String),
    #[error("domain {0:?} is claimed by more than one app")]
    DomainConflict(String),
}

#[derive(Debug, Clone)]
pub struct Backend {
    pub container_name: String,
    pub addr: SocketAddr,
    pub healthy: bool,
    pub deployment_id: DeploymentId,
}

/// What `pick_backend` resolved a request to: where to send it, and
/// which deployment served it, for access logging.
#[derive(Debug, Clone, Copy)]
pub struct Picked {
    pub addr: SocketAddr,
    pub deployment_id: DeploymentId,
}

#[derive(Debug, Clone)]
pub struct RouteEntry {
    pub app_name: String,
    pub canonical: String,
    pub aliases: Vec<String>,
    pub backends: Vec<Backend>,
    /// Redirect aliases to the canonical with 308, enforcing one true
    /// hostname per app.
    pub redirect_aliases: bool,
}

impl RouteEntry {
    fn healthy_backends(&self) -> Vec<&Backend> {
        self.backends.iter().filter(|b| b.healthy).collect()
    }
}

pub struct Snapshot {
    by_canonical: HashMap<String, Arc<RouteEntry>>,
    by_alias: HashMap<String, String>,
    pub revision: u64,
}

impl Snapshot {
    pub fn empty() -> Self {
        Self {
            by_canonical: HashMap::new(),
            by_alias: HashMap::new(),
            revision: 0,
        }
    }

    pub fn route_for_canonical(&self, canonical: &str) -> Option<&Arc<RouteEntry>> {
        self.by_canonical.get(canonical)
    }

    pub fn canonical_for_alias(&self, alias: &str) -> Option<&str> {
        self.by_alias.get(alias).map(String::as_str)
    }

    pub fn len(&self) -> usize {
        self.by_canonical.len()
    }

    pub fn is_empty(&self) -> bool {
        self.by_canonical.is_empty()
    }
}

pub struct SnapshotBuilder {
    entries: Vec<RouteEntry>,
    revision: u64,
}

impl SnapshotBuilder {
    pub fn new(revision: u64) -> Self {
        Self {
            entries: Vec::new(),
            revision,
        }
    }

    pub fn add_route(&mut self, entry: RouteEntry) {
        self.entries.push(entry);
    }

    /// Rejects the whole rebuild if two apps claim the same domain.
    /// Falling back to the previous snapshot on conflict is the
    /// caller's job; this just refuses to build an ambiguous one.
    pub fn build(self) -> Result<Snapshot, RouteError> {
        let mut by_canonical = HashMap::new();
        let mut by_alias: HashMap<String, String> = HashMap::new();
        let mut claimed: HashMap<String, String> = HashMap::new();

        for entry in self.entries {
            if let Some(owner) = claimed.insert(entry.canonical.clone(), entry.app_name.clone()) {
                if owner != entry.app_name {
                    return Err(RouteError::DomainConflict(entry.canonical));
                }
            }
            for alias in &entry.aliases {
                if let Some(owner) = claimed.insert(alias.clone(), entry.app_name.clone()) {
                    if owner != entry.app_name {
                        return Err(RouteError::DomainConflict(alias.clone()));
                    }
                }
                by_alias.insert(alias.clone(), entry.canonical.clone());
            }
            by_canonical.insert(entry.canonical.clone(), Arc::new(entry));
        }

        Ok(Snapshot {
            by_canonical,
            by_alias,
            revision: self.revision,
        })
    }
}

/// Published router state plus the round-robin cursors, which persist
/// across snapshot swaps (a rebuild shouldn't reset where the balancer
/// was in its rotation for an app that stayed unchanged).
pub struct RouterTable {
    snapshot: ArcSwap<Snapshot>,
    cursors: Mutex<HashMap<String, Arc<AtomicUsize>>>,
}

impl Default for RouterTable {
    fn default() -> Self {
        Self::new()
    }
}

impl RouterTable {
    pub fn new() -> Self {
        Self {
            snapshot: ArcSwap::new(Arc::new(Snapshot::empty())),
            cursors: Mutex::new(HashMap::new()),
        }
    }

    pub fn publish(&self, snapshot: Snapshot) {
        tracing::info!(revision = snapshot.revision, routes = snapshot.len(), "router snapshot published");
        self.snapshot.store(Arc::new(snapshot));
    }

    pub fn current(&self) -> arc_swap::Guard<Arc<Snapshot>> {
        self.snapshot.load()
    }

    fn cursor_for(&self, canonical: &str) -> Arc<AtomicUsize> {
        let mut cursors = self.cursors.lock().unwrap();
        cursors
            .entry(canonical.to_owned())
            .or_insert_with(|| Arc::new(AtomicUsize::new(0)))
            .clone()
    }

    /// Resolves `host` to one backend address via round-robin over the
    /// healthy subset. Unknown canonical hosts are a 404; a known host
    /// with zero healthy backends is a 503 — the route stays
    /// registered, it just can't serve right now.
    pub fn pick_backend(&self, canonical: &str) -> Result<Picked, RouteError> {
        let snapshot = self.snapshot.load();
        let entry = snapshot
            .route_for_canonical(canonical)
            .ok_or_else(|| RouteError::UnknownHost(canonical.to_owned()))?;
        let healthy = entry.healthy_backends();
        if healthy.is_empty() {
            return Err(RouteError::NoHealthyBackend(canonical.to_owned()));
        }
        let cursor = self.cursor_for(canonical);
        let i = cursor.fetch_add(1, Ordering::Relaxed) % healthy.len();
        Ok(Picked { addr: healthy[i].addr, deployment_id: healthy[i].deployment_id })
    }

    /// Resolves an arbitrary `Host:` header: exact canonical first,
    /// then alias (the caller decides whether to redirect).
    pub fn resolve_host<'a>(&self, snapshot: &'a Snapshot, host: &str) -> Option<&'a str> {
        if snapshot.route_for_canonical(host).is_some() {
            return Some(host);
        }
        snapshot.canonical_for_alias(host)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn backend(port: u16, healthy: bool) -> Backend {
        Backend {
            container_name: format!("c{port}"),
            addr: SocketAddr::from(([127, 0, 0, 1], port)),
            healthy,
            deployment_id: DeploymentId::now(),
        }
    }

    fn entry(app: &str, canonical: &str, backends: Vec<Backend>) -> RouteEntry {
        RouteEntry {
            app_name: app.to_owned(),
            canonical: canonical.to_owned(),
            aliases: vec![],
            backends,
            redirect_aliases: true,
        }
    }

    #[test]
    fn unknown_host_is_404() {
        let table = RouterTable::new();
        let err = table.pick_backend("nope.example.com").unwrap_err();
        assert!(matches!(err, RouteError::UnknownHost(_)));
    }

    #[test]
    fn empty_healthy_set_is_503() {
        let mut builder = SnapshotBuilder::new(1);
        builder.add_route(entry("web", "web.example.com", vec![backend(8080, false)]));
        let table = RouterTable::new();
        table.publish(builder.build().unwrap());
        let err = table.pick_backend("web.example.com").unwrap_err();
        assert!(matches!(err, RouteError::NoHealthyBackend(_)));
    }

    #[test]
    fn round_robins_over_healthy_backends() {
        let mut builder = SnapshotBuilder::new(1);
        builder.add_route(entry(
            "web",
            "web.example.com",
            vec![backend(8080, true), backend(8081, true)],
        ));
        let table = RouterTable::new();
        table.publish(builder.build().unwrap());
        let first = table.pick_backend("web.example.com").unwrap();
        let second = table.pick_backend("web.example.com").unwrap();
        assert_ne!(first.addr, second.addr);
        let third = table.pick_backend("web.example.com").unwrap();
        assert_eq!(first.addr, third.addr);
    }

    #[test]
    fn conflicting_domain_claims_are_rejected() {
        let mut builder = SnapshotBuilder::new(1);
        builder.add_route(entry("a", "shared.example.com", vec![backend(1, true)]));
        builder.add_route(entry("b", "shared.example.com", vec![backend(2, true)]));
        assert!(matches!(builder.build(), Err(RouteError::DomainConflict(_))));
    }
}
