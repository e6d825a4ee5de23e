use std::env;
use std::path::PathBuf;

/// Default port, scanned upward when taken.
pub const DEFAULT_PORT: u16 = 9876;

#[derive(Debug, Clone)]
pub struct Config {
    pub port: u16,
    pub workspace_root: PathBuf,
}

impl Config {
    pub fn from_env() -> Self {
        Self {
            port: env::var("ARIA_BRIDGE_PORT")
                .ok()
                .and_then(|p| p.parse().ok())
                .unwrap_or(DEFAULT_PORT),
            workspace_root: env::var("ARIA_BRIDGE_WORKSPACE")
                .map(PathBuf::from)
                .unwrap_or_else(|_| PathBuf::from(".")),
        }
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            port: DEFAULT_PORT,
            workspace_root: PathBuf::from("."),
        }
    }
}
