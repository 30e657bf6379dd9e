//! Config Compositor: the pure function that turns "the apps haloyd
//! knows about" plus "the containers Docker actually has running" plus
//! "what the Health Monitor currently believes is healthy" into one
//! Router Table snapshot. Nothing here talks to Docker or the network
//! directly — deciding the next snapshot stays separate from acting on
//! it.

use std::collections::HashMap;
use std::net::SocketAddr;

use haloyd_common::app::App;

use crate::docker_driver::Replica;
use crate::health::HealthMonitor;
use crate::router::{Backend, RouteEntry, RouteError, Snapshot, SnapshotBuilder};

/// Builds a new snapshot from the current declared apps and their live
/// replicas. A domain conflict fails the whole rebuild; the caller
/// (main's reconciliation loop) keeps serving the previous snapshot in
/// that case rather than publishing a half-built one.
pub fn compose(
    apps: &[App],
    replicas_by_app: &HashMap<String, Vec<Replica>>,
    health: &HealthMonitor,
    revision: u64,
) -> Result<Snapshot, RouteError> {
    let mut builder = SnapshotBuilder::new(revision);

    for app in apps {
        if app.domains.is_empty() {
            continue;
        }
        let replicas = replicas_by_app.get(&app.name).cloned().unwrap_or_default();
        let backends: Vec<Backend> = replicas
            .into_iter()
            .filter_map(|r| {
                let ip: std::net::IpAddr = r.ip_address.parse().ok()?;
                Some(Backend {
                    healthy: health.is_healthy(&r.container_name),
                    container_name: r.container_name,
                    addr: SocketAddr::new(ip, r.port),
                    deployment_id: r.deployment,
                })
            })
            .collect();

        for domain in &app.domains {
            builder.add_route(RouteEntry {
                app_name: app.name.clone(),
                canonical: domain.canonical.clone(),
                aliases: domain.aliases.clone(),
                backends: backends.clone(),
                redirect_aliases: true,
            });
        }
    }

    builder.build()
}

#[cfg(test)]
mod tests {
    use super::*;
    use haloyd_common::app::{Domain, HistoryStrategy, ImageSource, Preset, PushStrategy, RolloutStrategy};
    use std::sync::Arc;

    fn app(name: &str, canonical: &str) -> App {
        App {
            name: name.to_owned(),
            domains: vec![Domain {
                canonical: canonical.to_owned(),
                aliases: vec![],
                acme_email: None,
            }],
            replicas: 1,
            image: ImageSource::Local { reference: "x:latest".into() },
            env: Default::default(),
            volumes: vec![],
            health_check_path: "/".into(),
            port: 8080,
            strategy: RolloutStrategy::Rolling,
            history_strategy: HistoryStrategy::Local,
            push_strategy: PushStrategy::Server,
            preset: Preset::None,
            protected: false,
            keep: 5,
        }
    }

    struct NoTargets;
    #[async_trait::async_trait]
    impl crate::health::TargetProvider for NoTargets {
        async fn health_check_targets(&self) -> Vec<crate::health::HealthTarget> {
            vec![]
        }
    }

    #[test]
    fn skips_apps_with_no_domains() {
        let mut a = app("web", "web.example.com");
        a.domains.clear();
        let health = HealthMonitor::new(Arc::new(NoTargets), Default::default(), None);
        let snap = compose(&[a], &HashMap::new(), &health, 1).unwrap();
        assert!(snap.is_empty());
    }

    #[test]
    fn conflicting_apps_fail_the_whole_rebuild() {
        let a = app("a", "shared.example.com");
        let b = app("b", "shared.example.com");
        let health = HealthMonitor::new(Arc::new(NoTargets), Default::default(), None);
        assert!(compose(&[a, b], &HashMap::new(), &health, 1).is_err());
    }
}
