//! Load config from file and environment.

use serde::Deserialize;
use std::path::PathBuf;
use std::time::Duration;

use nanofiles_core::DEFAULT_FRAME_SIZE;

use crate::connector::{DEFAULT_MAX_ATTEMPTS, DEFAULT_TIMEOUT};

/// Host configuration. File: ~/.config/nanofiles/config.toml or /etc/nanofiles/config.toml.
/// Env overrides: NANOFILES_DIRECTORY_HOST, NANOFILES_DIRECTORY_PORT,
/// NANOFILES_DISCARD_PROBABILITY, NANOFILES_REQUEST_TIMEOUT_MS, NANOFILES_MAX_ATTEMPTS,
/// NANOFILES_SHARED_DIR.
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Config {
    /// Directory host name or IP (default localhost).
    #[serde(default = "default_directory_host")]
    pub directory_host: String,
    /// Directory UDP port (default 6868).
    #[serde(default = "default_directory_port")]
    pub directory_port: u16,
    /// Probability that the directory drops an inbound datagram (default 0).
    #[serde(default)]
    pub discard_probability: f64,
    /// Wait per directory attempt, in milliseconds (default 1000).
    #[serde(default = "default_request_timeout_ms")]
    pub request_timeout_ms: u64,
    /// Directory attempts before giving up (default 5).
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
    /// Folder whose files this peer shares (default nf-shared).
    #[serde(default = "default_shared_dir")]
    pub shared_dir: PathBuf,
    /// Raw bytes per `file` frame (default 32000).
    #[serde(default = "default_frame_size")]
    pub frame_size: usize,
    /// How often the peer listener checks for a stop request, in milliseconds.
    #[serde(default = "default_accept_poll_ms")]
    pub accept_poll_ms: u64,
}

fn default_directory_host() -> String {
    "localhost".to_string()
}
fn default_directory_port() -> u16 {
    6868
}
fn default_request_timeout_ms() -> u64 {
    DEFAULT_TIMEOUT.as_millis() as u64
}
fn default_max_attempts() -> u32 {
    DEFAULT_MAX_ATTEMPTS
}
fn default_shared_dir() -> PathBuf {
    PathBuf::from("nf-shared")
}
fn default_frame_size() -> usize {
    DEFAULT_FRAME_SIZE
}
fn default_accept_poll_ms() -> u64 {
    1000
}

impl Default for Config {
    fn default() -> Self {
        Self {
            directory_host: default_directory_host(),
            directory_port: default_directory_port(),
            discard_probability: 0.0,
            request_timeout_ms: default_request_timeout_ms(),
            max_attempts: default_max_attempts(),
            shared_dir: default_shared_dir(),
            frame_size: default_frame_size(),
            accept_poll_ms: default_accept_poll_ms(),
        }
    }
}

impl Config {
    pub fn request_timeout(&self) -> Duration {
        Duration::from_millis(self.request_timeout_ms)
    }

    pub fn accept_poll(&self) -> Duration {
        Duration::from_millis(self.accept_poll_ms)
    }

    /// Clamp values that would make the loops misbehave.
    fn normalize(mut self) -> Self {
        if !(0.0..=1.0).contains(&self.discard_probability) {
            self.discard_probability = self.discard_probability.clamp(0.0, 1.0);
        }
        if self.discard_probability.is_nan() {
            self.discard_probability = 0.0;
        }
        self.max_attempts = self.max_attempts.max(1);
        self
    }
}

/// Load config: merge default, then config file (if present), then env vars.
pub fn load() -> Config {
    let c = load_file().unwrap_or_default();
    apply_env(c, |key| std::env::var(key).ok()).normalize()
}

fn apply_env(mut c: Config, var: impl Fn(&str) -> Option<String>) -> Config {
    if let Some(s) = var("NANOFILES_DIRECTORY_HOST") {
        if !s.trim().is_empty() {
            c.directory_host = s.trim().to_string();
        }
    }
    if let Some(s) = var("NANOFILES_DIRECTORY_PORT") {
        if let Ok(p) = s.parse::<u16>() {
            c.directory_port = p;
        }
    }
    if let Some(s) = var("NANOFILES_DISCARD_PROBABILITY") {
        if let Ok(p) = s.parse::<f64>() {
            c.discard_probability = p;
        }
    }
    if let Some(s) = var("NANOFILES_REQUEST_TIMEOUT_MS") {
        if let Ok(ms) = s.parse::<u64>() {
            c.request_timeout_ms = ms;
        }
    }
    if let Some(s) = var("NANOFILES_MAX_ATTEMPTS") {
        if let Ok(n) = s.parse::<u32>() {
            c.max_attempts = n;
        }
    }
    if let Some(s) = var("NANOFILES_SHARED_DIR") {
        if !s.is_empty() {
            c.shared_dir = PathBuf::from(s);
        }
    }
    c
}

fn config_paths() -> Vec<PathBuf> {
    let home = std::env::var_os("HOME").map(PathBuf::from);
    let mut out = Vec::new();
    if let Some(h) = home {
        out.push(h.join(".config/nanofiles/config.toml"));
    }
    out.push(PathBuf::from("/etc/nanofiles/config.toml"));
    out
}

fn load_file() -> Option<Config> {
    for p in config_paths() {
        if p.exists() {
            match std::fs::read_to_string(&p) {
                Ok(s) => match toml::from_str::<Config>(&s) {
                    Ok(c) => return Some(c),
                    Err(e) => log::warn!("ignoring {}: {}", p.display(), e),
                },
                Err(e) => log::warn!("cannot read {}: {}", p.display(), e),
            }
            break;
        }
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    #[test]
    fn defaults_match_protocol_constants() {
        let c = Config::default();
        assert_eq!(c.directory_port, 6868);
        assert_eq!(c.request_timeout(), Duration::from_millis(1000));
        assert_eq!(c.max_attempts, 5);
        assert_eq!(c.frame_size, 32_000);
        assert_eq!(c.discard_probability, 0.0);
    }

    #[test]
    fn partial_toml_keeps_defaults() {
        let c: Config = toml::from_str("directory_port = 7000\ndiscard_probability = 0.25\n").unwrap();
        assert_eq!(c.directory_port, 7000);
        assert_eq!(c.discard_probability, 0.25);
        assert_eq!(c.directory_host, "localhost");
        assert_eq!(c.shared_dir, PathBuf::from("nf-shared"));
    }

    #[test]
    fn unknown_toml_field_is_rejected() {
        assert!(toml::from_str::<Config>("proxy_port = 3128\n").is_err());
    }

    #[test]
    fn env_overrides_and_ignores_garbage() {
        let env: HashMap<&str, &str> = [
            ("NANOFILES_DIRECTORY_HOST", "dir.example"),
            ("NANOFILES_DIRECTORY_PORT", "not-a-port"),
            ("NANOFILES_MAX_ATTEMPTS", "3"),
            ("NANOFILES_DISCARD_PROBABILITY", "7.5"),
        ]
        .into_iter()
        .collect();
        let c = apply_env(Config::default(), |k| env.get(k).map(|v| v.to_string())).normalize();
        assert_eq!(c.directory_host, "dir.example");
        assert_eq!(c.directory_port, 6868);
        assert_eq!(c.max_attempts, 3);
        assert_eq!(c.discard_probability, 1.0);
    }
}
