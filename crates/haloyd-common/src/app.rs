//! Declarative application model. The dynamic config's sum types are
//! implemented as discriminated unions with explicit `kind` tags —
//! unknown kinds are rejected at deserialization time rather than
//! silently defaulted.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};

/// Where a configured value's runtime content comes from. Resolution
/// (reading the env, calling out to a secret provider) is a client/CLI
/// concern; the daemon only needs to know the shape for rollback replay.
#[derive(Debug, Clone, Deserialize, Serialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case", tag = "kind")]
pub enum ValueSource {
    Literal { value: String },
    EnvRef { name: String },
    SecretRef { provider: String, key: String },
}

/// Whether and how deployed images are tagged/retained.
#[derive(Debug, Clone, Copy, Deserialize, Serialize, PartialEq, Eq, Default)]
#[serde(rename_all = "snake_case")]
pub enum HistoryStrategy {
    /// Tag `<app>:<deploymentId>` locally and keep `keep` of them.
    #[default]
    Local,
    /// Rely on the registry for history; prune all local tags but the
    /// current one.
    Registry,
    /// No deployment row, no rollback.
    None,
}

/// How a locally-built image gets to the target host.
#[derive(Debug, Clone, Copy, Deserialize, Serialize, PartialEq, Eq, Default)]
#[serde(rename_all = "snake_case")]
pub enum PushStrategy {
    /// Client streams layers to haloyd's layer-upload API.
    #[default]
    Server,
    /// Client pushes to a registry the daemon then pulls from.
    Registry,
}

/// Lightweight resource presets an app can opt into; `None` means the
/// raw fields on `App` are used as-is.
#[derive(Debug, Clone, Copy, Deserialize, Serialize, PartialEq, Eq, Default)]
#[serde(rename_all = "snake_case")]
pub enum Preset {
    #[default]
    None,
    Service,
    Database,
}

/// Rollout strategy for `Deploy`.
#[derive(Debug, Clone, Copy, Deserialize, Serialize, PartialEq, Eq, Default)]
#[serde(rename_all = "snake_case")]
pub enum RolloutStrategy {
    #[default]
    Rolling,
    Replace,
}

/// Where the deployed image comes from.
#[derive(Debug, Clone, Deserialize, Serialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case", tag = "kind")]
pub enum ImageSource {
    /// Already loaded (e.g. via the layer-upload/assemble flow); the
    /// daemon must not attempt to pull it.
    Local { reference: String },
    Registry { reference: String },
}

impl ImageSource {
    pub fn reference(&self) -> &str {
        match self {
            ImageSource::Local { reference } | ImageSource::Registry { reference } => reference,
        }
    }
}

/// A canonical hostname plus zero or more aliases. Aliases redirect to
/// the canonical form via HTTP 308. `acme_email`, if set, overrides the
/// daemon-wide `certificates.acme_email` for this domain.
#[derive(Debug, Clone, Deserialize, Serialize, PartialEq, Eq)]
pub struct Domain {
    pub canonical: String,
    #[serde(default)]
    pub aliases: Vec<String>,
    #[serde(default)]
    pub acme_email: Option<String>,
}

impl Domain {
    pub fn all_hostnames(&self) -> impl Iterator<Item = &str> {
        std::iter::once(self.canonical.as_str()).chain(self.aliases.iter().map(String::as_str))
    }
}

#[derive(Debug, Clone, Deserialize, Serialize, PartialEq, Eq)]
pub struct VolumeMount {
    pub name: String,
    pub target: String,
}

/// An application as the engine understands it: everything needed to
/// produce one `Deploy` call. Identified by `name`, which must be a
/// valid Docker-ish identifier (lowercase alphanumeric plus `-`).
#[derive(Debug, Clone, Deserialize, Serialize, PartialEq, Eq)]
pub struct App {
    pub name: String,
    #[serde(default)]
    pub domains: Vec<Domain>,
    pub replicas: u32,
    pub image: ImageSource,
    #[serde(default)]
    pub env: HashMap<String, ValueSource>,
    #[serde(default)]
    pub volumes: Vec<VolumeMount>,
    #[serde(default = "default_health_path")]
    pub health_check_path: String,
    pub port: u16,
    #[serde(default)]
    pub strategy: RolloutStrategy,
    #[serde(default)]
    pub history_strategy: HistoryStrategy,
    #[serde(default)]
    pub push_strategy: PushStrategy,
    #[serde(default)]
    pub preset: Preset,
    #[serde(default)]
    pub protected: bool,
    /// How many prior deployments to retain for rollback.
    #[serde(default = "default_keep")]
    pub keep: u32,
}

fn default_health_path() -> String {
    "/".to_owned()
}

fn default_keep() -> u32 {
    5
}

pub fn is_valid_app_name(name: &str) -> bool {
    !name.is_empty()
        && name
            .chars()
            .all(|c| (c.is_ascii_lowercase() && c.is_alphanumeric()) || c.is_ascii_digit() || c == '-')
}

impl App {
    pub fn validate(&self) -> Result<(), String> {
        if !is_valid_app_name(&self.name) {
            return Err(format!(
                "app name {:?} must be lowercase alphanumeric with '-'",
                self.name
            ));
        }
        if self.replicas == 0 {
            return Err("replicas must be >= 1".to_owned());
        }
        let mut seen = std::collections::HashSet::new();
        for domain in &self.domains {
            for host in domain.all_hostnames() {
                if !seen.insert(host.to_owned()) {
                    return Err(format!("domain {host:?} declared more than once on app {:?}", self.name));
                }
            }
            if domain.aliases.contains(&domain.canonical) {
                return Err(format!("domain {:?} aliases itself", domain.canonical));
            }
        }
        Ok(())
    }

    pub fn image_tag(&self, deployment: &crate::DeploymentId) -> String {
        format!("{}:{}", self.name, deployment)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn minimal_app() -> App {
        App {
            name: "web".into(),
            domains: vec![],
            replicas: 1,
            image: ImageSource::Local {
                reference: "web:latest".into(),
            },
            env: HashMap::new(),
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

    #[test]
    fn rejects_zero_replicas() {
        let mut app = minimal_app();
        app.replicas = 0;
        assert!(app.validate().is_err());
    }

    #[test]
    fn rejects_self_alias() {
        let mut app = minimal_app();
        app.domains.push(Domain {
            canonical: "foo.com".into(),
            aliases: vec!["foo.com".into()],
            acme_email: None,
        });
        assert!(app.validate().is_err());
    }

    #[test]
    fn rejects_duplicate_domains_within_app() {
        let mut app = minimal_app();
        app.domains.push(Domain {
            canonical: "foo.com".into(),
            aliases: vec![],
            acme_email: None,
        });
        app.domains.push(Domain {
            canonical: "foo.com".into(),
            aliases: vec![],
            acme_email: None,
        });
        assert!(app.validate().is_err());
    }

    #[test]
    fn unknown_value_source_kind_is_rejected() {
        let json = r#"{"kind": "quantum_ref", "value": "x"}"#;
        assert!(serde_json::from_str::<ValueSource>(json).is_err());
    }
}
