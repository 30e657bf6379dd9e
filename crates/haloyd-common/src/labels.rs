//! Container labels applied to every container haloyd starts. Discovery
//! queries filter on these so nothing outside haloyd's own containers is
//! ever touched.

use std::collections::HashMap;

use crate::DeploymentId;

pub const ROLE: &str = "haloy.role";
pub const APP: &str = "haloy.app";
pub const DEPLOYMENT: &str = "haloy.deployment";
pub const PORT: &str = "haloy.port";
pub const HEALTH_PATH: &str = "haloy.health_path";

pub const ROLE_APP: &str = "app";

#[derive(Debug, Clone)]
pub struct ManagedLabels {
    pub app: String,
    pub deployment: DeploymentId,
    pub port: u16,
    pub health_path: String,
}

impl ManagedLabels {
    pub fn to_map(&self) -> HashMap<String, String> {
        HashMap::from([
            (ROLE.to_owned(), ROLE_APP.to_owned()),
            (APP.to_owned(), self.app.clone()),
            (DEPLOYMENT.to_owned(), self.deployment.to_string()),
            (PORT.to_owned(), self.port.to_string()),
            (HEALTH_PATH.to_owned(), self.health_path.clone()),
        ])
    }

    /// Filter selector for `docker ps --filter label=...` style queries,
    /// scoped to a single app (and optionally a deployment).
    pub fn selector(app: &str, deployment: Option<&DeploymentId>) -> Vec<String> {
        let mut v = vec![format!("{ROLE}={ROLE_APP}"), format!("{APP}={app}")];
        if let Some(d) = deployment {
            v.push(format!("{DEPLOYMENT}={d}"));
        }
        v
    }

    pub fn from_map(m: &HashMap<String, String>) -> Option<Self> {
        Some(Self {
            app: m.get(APP)?.clone(),
            deployment: m.get(DEPLOYMENT)?.parse().ok()?,
            port: m.get(PORT)?.parse().ok()?,
            health_path: m.get(HEALTH_PATH)?.clone(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn round_trips_through_map() {
        let labels = ManagedLabels {
            app: "web".into(),
            deployment: DeploymentId::now(),
            port: 8080,
            health_path: "/healthz".into(),
        };
        let map = labels.to_map();
        let back = ManagedLabels::from_map(&map).unwrap();
        assert_eq!(back.app, labels.app);
        assert_eq!(back.port, labels.port);
    }
}
