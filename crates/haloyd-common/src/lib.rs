pub mod app;
pub mod deployment_id;
pub mod docker;
pub mod labels;

pub use app::{App, Domain, HistoryStrategy, Preset, PushStrategy, RolloutStrategy, ValueSource};
pub use deployment_id::DeploymentId;
pub use docker::{DockerConnection, DockerContext};
