use std::env;
use std::time::Duration;

/// Deployment mode decides whether the live channel requires a run-scoped
/// auth token. Anything other than `production` is treated as local.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeploymentMode {
    Production,
    Local,
}

impl DeploymentMode {
    pub fn requires_channel_token(&self) -> bool {
        matches!(self, Self::Production)
    }
}

/// Application configuration loaded from environment variables.
#[derive(Debug, Clone)]
pub struct Config {
    /// Base URL of the verification backend, e.g. `https://coach.example.com/api`.
    pub backend_url: String,
    /// Live channel URL base, e.g. `wss://coach.example.com/ws`. The run id
    /// is appended as a path segment by the channel.
    pub channel_url: String,
    pub deployment: DeploymentMode,
    pub request_timeout: Duration,
    pub poll_interval: Duration,
}

impl Config {
    /// Load configuration from environment variables.
    /// Panics with a clear message if required vars are missing.
    pub fn from_env() -> Self {
        let deployment = match env::var("VERICOACH_ENV").as_deref() {
            Ok("production") => DeploymentMode::Production,
            _ => DeploymentMode::Local,
        };

        Self {
            backend_url: required_env("VERICOACH_BACKEND_URL"),
            channel_url: required_env("VERICOACH_CHANNEL_URL"),
            deployment,
            request_timeout: Duration::from_secs(
                env::var("VERICOACH_REQUEST_TIMEOUT_SECS")
                    .unwrap_or_else(|_| "15".to_string())
                    .parse()
                    .expect("VERICOACH_REQUEST_TIMEOUT_SECS must be a number"),
            ),
            poll_interval: Duration::from_secs(
                env::var("VERICOACH_POLL_INTERVAL_SECS")
                    .unwrap_or_else(|_| "5".to_string())
                    .parse()
                    .expect("VERICOACH_POLL_INTERVAL_SECS must be a number"),
            ),
        }
    }
}

fn required_env(key: &str) -> String {
    env::var(key).unwrap_or_else(|_| panic!("{key} environment variable is required"))
}
