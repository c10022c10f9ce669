//! Packager configuration loader.

use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::Deserialize;

use crate::merge::{MergeOptions, RootPrecedence};
use crate::models::RequestedPackage;

/// File name looked up by [`PackagerConfig::discover`].
pub const DEFAULT_CONFIG_FILE: &str = "packager.config.json";

/// Discoverable packager configuration.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct PackagerConfig {
  /// Version segment prefixed to every store key.
  pub bundle_version: u32,
  /// Package names that never take part in a bundle's store key.
  pub excluded_from_key: Vec<String>,
  /// Packages added to every bundle request, name to version.
  pub implicit_dependencies: BTreeMap<String, String>,
  /// Policy for transient references to requested packages.
  pub root_precedence: RootPrecedence,
  /// Maximum number of remembered build failures.
  pub error_cache_capacity: usize,
  /// How long a build failure is remembered, in milliseconds.
  pub error_cache_ttl_ms: u64,
  /// Directory holding stored bundles, relative to the config directory.
  pub store_root: String,
}

impl Default for PackagerConfig {
  fn default() -> Self {
    Self {
      bundle_version: 1,
      excluded_from_key: vec!["node-libs-browser".into()],
      implicit_dependencies: BTreeMap::new(),
      root_precedence: RootPrecedence::Always,
      error_cache_capacity: 1024,
      error_cache_ttl_ms: 5000,
      store_root: "target/bundles".into(),
    }
  }
}

impl PackagerConfig {
  /// Load `packager.config.json` from `dir`, falling back to defaults when it is absent or
  /// invalid.
  pub fn discover(dir: &Path) -> Self {
    let candidate = dir.join(DEFAULT_CONFIG_FILE);
    match Self::from_path(&candidate) {
      Some(config) => config,
      None => {
        log::debug!("using default configuration, {} not loaded", candidate.display());
        Self::default()
      }
    }
  }

  /// Read configuration from a specific JSON file.
  pub fn from_path(path: &Path) -> Option<Self> {
    let content = fs::read_to_string(path).ok()?;
    match serde_json::from_str(&content) {
      Ok(config) => Some(config),
      Err(err) => {
        log::warn!("ignoring invalid {}: {}", path.display(), err);
        None
      }
    }
  }

  /// Merge settings derived from this configuration.
  pub fn merge_options(&self) -> MergeOptions {
    MergeOptions {
      root_precedence: self.root_precedence,
    }
  }

  /// Error cache TTL as a duration.
  pub fn error_cache_ttl(&self) -> Duration {
    Duration::from_millis(self.error_cache_ttl_ms)
  }

  /// Store directory resolved against `dir`.
  pub fn store_root_path(&self, dir: &Path) -> PathBuf {
    dir.join(&self.store_root)
  }

  /// `requested` followed by every implicit dependency it does not already name.
  pub fn with_implicit_dependencies(&self, requested: &[RequestedPackage]) -> Vec<RequestedPackage> {
    let mut packages = requested.to_vec();
    for (name, version) in &self.implicit_dependencies {
      if !requested.iter().any(|package| &package.name == name) {
        packages.push(RequestedPackage::new(name, version));
      }
    }
    packages
  }
}
