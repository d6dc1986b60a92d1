pub mod config;
pub mod protocol;
pub mod types;

pub use config::{Config, DeploymentMode};
pub use protocol::*;
pub use types::*;
