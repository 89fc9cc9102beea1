//! Controller-side settings for connections and request handling.

use anyhow::Context;
use serde::{Deserialize, Serialize};
use std::fs;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// The name of the settings file inside [config_dir].
pub const SETTINGS_FILE: &str = "settings.yaml";

/// Returns a [PathBuf] to the directory where Muster's configuration should live.
///
/// When compiled for testing, this returns `CARGO_MANIFEST_DIR` plus `resources/etc/muster`.
/// Otherwise, it returns `/etc/muster`.
pub fn config_dir() -> PathBuf {
    // Omit the leading slash so that PathBuf::push appends instead of replacing.
    const CONFIG_DIR: &str = "etc/muster";

    let mut path = PathBuf::new();

    #[cfg(test)]
    {
        path.push(env!("CARGO_MANIFEST_DIR"));
        path.push("resources");
    }

    #[cfg(not(test))]
    path.push("/");

    path.push(CONFIG_DIR);
    path
}

/// How to treat host keys that are missing from `known_hosts`.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum KnownHostsPolicy {
    /// Refuse to connect to unknown hosts.
    Strict,

    /// Add unknown hosts to `known_hosts`, but refuse hosts whose keys changed.
    #[default]
    Add,

    /// Accept any host key. Only suitable for throwaway test machines.
    Accept,
}

/// Settings that apply to every [Node] built from them.
///
/// Every field has a default, so a settings file only needs to mention what it changes:
///
/// ```
/// use muster::config::{KnownHostsPolicy, Settings};
/// use std::time::Duration;
///
/// let settings: Settings = serde_yaml::from_str("known_hosts: strict\nrequest_timeout_secs: 30\n")
///     .unwrap();
/// assert_eq!(KnownHostsPolicy::Strict, settings.known_hosts);
/// assert_eq!(Some(Duration::from_secs(30)), settings.request_timeout());
/// assert_eq!(None, settings.queue_capacity);
/// ```
///
/// [Node]: crate::Node
#[derive(Clone, Debug, Default, PartialEq, Eq, Deserialize, Serialize)]
#[serde(default)]
pub struct Settings {
    pub known_hosts: KnownHostsPolicy,

    /// Give up on connecting after this many seconds. `None` leaves the choice to ssh.
    pub connect_timeout_secs: Option<u64>,

    /// Where ssh keeps its multiplexing control sockets. `None` uses the transport's default.
    pub control_directory: Option<PathBuf>,

    /// Fail any request that runs longer than this many seconds.
    ///
    /// `None` (the default) lets remote commands run for as long as they like. A node whose
    /// command never finishes will then hold up every round that includes it.
    pub request_timeout_secs: Option<u64>,

    /// How many requests a node may have waiting in its queue.
    ///
    /// `None` (the default) means unbounded, so queuing never blocks. `Some(0)` makes every
    /// submission wait until the node's worker picks it up.
    pub queue_capacity: Option<usize>,
}

impl Settings {
    /// Reads settings from a YAML file.
    pub fn load(path: impl AsRef<Path>) -> anyhow::Result<Self> {
        let path = path.as_ref();
        let yaml = fs::read_to_string(path)
            .with_context(|| format!("failed to read settings file: {}", path.display()))?;
        serde_yaml::from_str(&yaml)
            .with_context(|| format!("failed to parse settings file: {}", path.display()))
    }

    /// Reads [SETTINGS_FILE] from [config_dir], or returns the defaults if there is no such file.
    pub fn load_default() -> anyhow::Result<Self> {
        let mut path = config_dir();
        path.push(SETTINGS_FILE);
        match fs::metadata(&path) {
            Err(err) if err.kind() == ErrorKind::NotFound => Ok(Self::default()),
            _ => Self::load(path),
        }
    }

    pub fn connect_timeout(&self) -> Option<Duration> {
        self.connect_timeout_secs.map(Duration::from_secs)
    }

    pub fn request_timeout(&self) -> Option<Duration> {
        self.request_timeout_secs.map(Duration::from_secs)
    }
}
