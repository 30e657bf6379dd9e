//! Thin wrapper around [`bollard::Docker`]: a discriminated connection
//! mode that resolves to a live client.

use serde::{Deserialize, Serialize};

/// How to reach the Docker engine. Defaults to the local socket; `Tcp`
/// (no client cert) and `Ssl` (mTLS) cover a remote daemon.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(rename_all = "lowercase", tag = "type")]
pub enum DockerConnection {
    /// Connect over the local unix socket / named pipe using bollard's
    /// platform defaults.
    Local,
    /// Plain TCP, e.g. `tcp://127.0.0.1:2375` — for local development only.
    Tcp { address: String },
    /// mTLS, PEM-encoded in place (not paths) so the config file stays
    /// self-contained.
    Ssl {
        address: String,
        key: String,
        cert: String,
        ca: String,
    },
}

impl Default for DockerConnection {
    fn default() -> Self {
        Self::Local
    }
}

impl TryFrom<DockerConnection> for bollard::Docker {
    type Error = bollard::errors::Error;

    fn try_from(conn: DockerConnection) -> Result<Self, Self::Error> {
        match conn {
            DockerConnection::Local => bollard::Docker::connect_with_local_defaults(),
            DockerConnection::Tcp { address } => {
                bollard::Docker::connect_with_http(&address, 120, bollard::API_DEFAULT_VERSION)
            }
            DockerConnection::Ssl {
                address,
                key,
                cert,
                ca,
            } => {
                let basedir = std::env::temp_dir().join(format!(
                    "haloyd-docker-certs-{}",
                    address.replace([':', '.', '/'], "-")
                ));
                std::fs::create_dir_all(&basedir)?;
                let key_path = basedir.join("key.pem");
                let cert_path = basedir.join("cert.pem");
                let ca_path = basedir.join("ca.pem");
                std::fs::write(&key_path, key)?;
                std::fs::write(&cert_path, cert)?;
                std::fs::write(&ca_path, ca)?;
                bollard::Docker::connect_with_ssl(
                    &address,
                    &key_path,
                    &cert_path,
                    &ca_path,
                    120,
                    bollard::API_DEFAULT_VERSION,
                )
            }
        }
    }
}

/// Everything the Docker Driver needs that isn't part of a single
/// call's arguments: the live client plus registry credentials and the
/// fixed bridge network all managed containers join.
#[derive(Debug, Clone)]
pub struct DockerContext {
    pub docker: bollard::Docker,
    pub registry_auth: Option<bollard::auth::DockerCredentials>,
    pub network_name: String,
}

impl DockerContext {
    pub fn new(
        docker: bollard::Docker,
        registry_auth: Option<bollard::auth::DockerCredentials>,
        network_name: impl Into<String>,
    ) -> Self {
        Self {
            docker,
            registry_auth,
            network_name: network_name.into(),
        }
    }
}
