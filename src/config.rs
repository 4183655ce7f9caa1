//! Runtime configuration.
//!
//! Every knob is readable from the environment so the sidecar can run under
//! a process manager with nothing but an env file. Command-line flags exist
//! mostly for local development.

use clap::Parser;
use std::path::PathBuf;

#[derive(Parser, Debug, Clone)]
#[command(name = "depot", version, about = "File-transfer sidecar")]
pub struct Config {
    /// Directory where uploaded archives are stored.
    #[arg(long, env = "STORAGE_PATH")]
    pub storage_path: PathBuf,

    /// Control-plane hostname.
    #[arg(long, env = "CONTROL_HOST")]
    pub control_host: String,

    /// Control-plane port.
    #[arg(long, env = "CONTROL_PORT", default_value_t = 4001)]
    pub control_port: u16,

    /// Bearer token presented during the link handshake.
    #[arg(long, env = "CONTROL_TOKEN", hide_env_values = true)]
    pub control_token: String,

    /// Runtime environment. "development" disables certificate validation
    /// so the sidecar can talk to a control plane with a self-signed cert.
    #[arg(long, env = "APP_ENV", default_value = "production")]
    pub app_env: String,
}

impl Config {
    pub fn is_development(&self) -> bool {
        self.app_env == "development"
    }
}
