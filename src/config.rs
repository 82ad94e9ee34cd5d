//! YAML configuration and hot reload
use crate::ca::KeyAlgorithm;
use crate::errors::{Error, Result};
use crate::wiring::Wiring;
use notify::{EventKind, RecursiveMode, Watcher};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::sync::mpsc::channel;
use std::time::Duration;
use tracing::{debug, error, info};

/// Name of the config file inside the data directory
pub const CONFIG_FILE: &str = "config.yml";

/// Proxy configuration, read from `<data>/config.yml`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
  /// API keys; carried through load and save, nothing in the proxy checks them
  pub api_keys: Vec<String>,
  /// outbound routing table
  pub wire: Wiring,
  /// logged listener
  pub listen: String,
  /// unlogged listener
  pub listen_alt: Option<String>,
  /// reconstruct and export HTTP on the logged listener
  pub log_http: bool,
  /// how long reconstruction waits for more bytes
  pub read_timeout_secs: u64,
  /// SOCKS5 and TLS handshake bound
  pub handshake_timeout_secs: u64,
  /// how long protocol sniffing waits for a client that stays silent
  pub sniff_timeout_ms: u64,
  /// outbound connect bound
  pub connect_timeout_secs: u64,
  /// leaves cached per host, 0 disables the cache
  pub leaf_cache_capacity: u64,
  /// algorithm for a newly generated root key
  pub key_algorithm: KeyAlgorithm,
  /// organization named in the root certificate
  pub organization: String,
  /// records kept in the in-memory history
  pub history_size: usize,
  /// JSON lines export file
  pub export_path: Option<PathBuf>,
}

impl Default for Config {
  fn default() -> Self {
    Self {
      api_keys: Vec::new(),
      wire: Wiring::default(),
      listen: "localhost:1080".to_string(),
      listen_alt: None,
      log_http: true,
      read_timeout_secs: 5,
      handshake_timeout_secs: 10,
      sniff_timeout_ms: 2000,
      connect_timeout_secs: 10,
      leaf_cache_capacity: 0,
      key_algorithm: KeyAlgorithm::default(),
      organization: "tapsocks".to_string(),
      history_size: 500,
      export_path: None,
    }
  }
}

impl Config {
  /// Parse a config file. Absent fields take their defaults.
  pub fn load(path: &Path) -> Result<Self> {
    let contents = std::fs::read_to_string(path)
      .map_err(|e| Error::Config(format!("{}: {}", path.display(), e)))?;
    if contents.trim().is_empty() {
      return Ok(Self::default());
    }
    Ok(serde_yaml::from_str(&contents)?)
  }

  /// Like [`Config::load`], but a missing file yields the defaults.
  pub fn load_or_default(path: &Path) -> Result<Self> {
    if !path.exists() {
      info!("No config at {}, using defaults", path.display());
      return Ok(Self::default());
    }
    Self::load(path)
  }

  /// Write the config back as YAML.
  pub fn save(&self, path: &Path) -> Result<()> {
    let contents = serde_yaml::to_string(self)?;
    std::fs::write(path, contents)?;
    Ok(())
  }

  /// Reader timeout for HTTP reconstruction
  pub fn read_timeout(&self) -> Duration {
    Duration::from_secs(self.read_timeout_secs)
  }

  /// Handshake timeout
  pub fn handshake_timeout(&self) -> Duration {
    Duration::from_secs(self.handshake_timeout_secs)
  }

  /// Sniff timeout
  pub fn sniff_timeout(&self) -> Duration {
    Duration::from_millis(self.sniff_timeout_ms)
  }

  /// Connect timeout, `None` when set to 0
  pub fn connect_timeout(&self) -> Option<Duration> {
    (self.connect_timeout_secs > 0).then(|| Duration::from_secs(self.connect_timeout_secs))
  }
}

/// Re-reads the config file whenever it is created or written.
pub struct ConfigWatcher;

impl ConfigWatcher {
  /// Watch the directory holding `path` and call `on_change` with every
  /// successfully parsed new config. Parse errors are logged and skipped.
  pub fn watch<F>(path: PathBuf, on_change: F) -> Result<()>
  where
    F: Fn(Config) + Send + 'static,
  {
    let dir = path
      .parent()
      .map(Path::to_path_buf)
      .ok_or_else(|| Error::Config(format!("{} has no parent directory", path.display())))?;
    let (tx, rx) = channel::<notify::Result<notify::Event>>();
    let mut watcher =
      notify::recommended_watcher(tx).map_err(|e| Error::Config(format!("watcher: {}", e)))?;
    watcher
      .watch(&dir, RecursiveMode::NonRecursive)
      .map_err(|e| Error::Config(format!("watch {}: {}", dir.display(), e)))?;

    std::thread::spawn(move || {
      // the watcher stops when dropped
      let _watcher = watcher;
      let name = path.file_name().map(|n| n.to_os_string());
      for res in rx {
        let event: notify::Event = match res {
          Ok(event) => event,
          Err(e) => {
            error!("Watch error: {:?}", e);
            continue;
          }
        };
        if !matches!(event.kind, EventKind::Create(_) | EventKind::Modify(_)) {
          continue;
        }
        if !event
          .paths
          .iter()
          .any(|p| p.file_name().map(|n| n.to_os_string()) == name)
        {
          continue;
        }
        debug!("Config file changed: {:?}", event.kind);
        match Config::load(&path) {
          Ok(config) => {
            info!("Reloaded {}", path.display());
            on_change(config);
          }
          Err(e) => error!("Keeping previous config, reload failed: {}", e),
        }
      }
    });
    Ok(())
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn defaults() {
    let config = Config::default();
    assert_eq!(config.listen, "localhost:1080");
    assert!(config.log_http);
    assert_eq!(config.read_timeout(), Duration::from_secs(5));
    assert_eq!(config.leaf_cache_capacity, 0);
    assert_eq!(config.key_algorithm, KeyAlgorithm::EcdsaP256);
  }

  #[test]
  fn partial_yaml_keeps_defaults() {
    let config: Config = serde_yaml::from_str(
      "listen: 127.0.0.1:9050\nkey_algorithm: ed25519\nwire:\n  example.com: 127.0.0.1\n",
    )
    .unwrap();
    assert_eq!(config.listen, "127.0.0.1:9050");
    assert_eq!(config.key_algorithm, KeyAlgorithm::Ed25519);
    assert_eq!(config.wire.route("example.com:443").unwrap(), "127.0.0.1:443");
    assert_eq!(config.history_size, 500);
  }

  #[test]
  fn save_and_load() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join(CONFIG_FILE);
    assert_eq!(Config::load_or_default(&path).unwrap(), Config::default());

    let mut config = Config::default();
    config.api_keys.push("secret".into());
    config.wire.insert("a.test", "b.test");
    config.save(&path).unwrap();
    assert_eq!(Config::load(&path).unwrap(), config);

    std::fs::write(&path, "").unwrap();
    assert_eq!(Config::load(&path).unwrap(), Config::default());
    std::fs::write(&path, "listen: [not, a, string]").unwrap();
    assert!(Config::load(&path).is_err());
  }
}
