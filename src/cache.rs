//! Cache keys, request parsing and bundle storage.

use std::collections::{BTreeMap, HashMap, VecDeque};
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

use anyhow::{Result, anyhow};
use percent_encoding::{AsciiSet, NON_ALPHANUMERIC, utf8_percent_encode};
use serde::Serialize;
use serde::de::DeserializeOwned;

use crate::config::PackagerConfig;
use crate::models::{BundleManifest, RequestedPackage};

/// Characters `encodeURIComponent` escapes.
const COMPONENT: &AsciiSet = &NON_ALPHANUMERIC
  .remove(b'-')
  .remove(b'_')
  .remove(b'.')
  .remove(b'!')
  .remove(b'~')
  .remove(b'*')
  .remove(b'\'')
  .remove(b'(')
  .remove(b')');

/// Errors raised while parsing a combination request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ParseError {
  /// The request, or one of its `+`-separated segments, is empty.
  EmptySegment {
    /// Full request text.
    input: String,
  },
  /// A segment has no `@version` suffix.
  MissingVersion {
    /// Offending segment.
    segment: String,
  },
}

impl std::fmt::Display for ParseError {
  fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    match self {
      Self::EmptySegment { input } => write!(f, "empty package in request `{input}`"),
      Self::MissingVersion { segment } => {
        write!(f, "package `{segment}` has no @version suffix")
      }
    }
  }
}

impl std::error::Error for ParseError {}

/// Parse `a@1.0.0+@scope/b@2.0.0` into requested packages, in request order.
///
/// The version is everything after the last `@`, so scoped names keep their leading `@`.
pub fn parse_combination(input: &str) -> Result<Vec<RequestedPackage>, ParseError> {
  input
    .split('+')
    .map(|segment| {
      if segment.is_empty() {
        return Err(ParseError::EmptySegment {
          input: input.to_string(),
        });
      }
      match segment.rfind('@') {
        Some(at) if at > 0 && at + 1 < segment.len() => Ok(RequestedPackage::new(
          &segment[..at],
          &segment[at + 1..],
        )),
        _ => Err(ParseError::MissingVersion {
          segment: segment.to_string(),
        }),
      }
    })
    .collect()
}

/// Store key of the merged bundle for a set of requested packages.
///
/// Names excluded by configuration are left out and the rest are sorted by name. A name that is
/// requested twice keeps its last version.
pub fn bundle_path(packages: &[RequestedPackage], config: &PackagerConfig) -> String {
  let by_name: BTreeMap<&str, &str> = packages
    .iter()
    .filter(|package| !config.excluded_from_key.contains(&package.name))
    .map(|package| (package.name.as_str(), package.version.as_str()))
    .collect();

  let segments: Vec<String> = by_name
    .into_iter()
    .map(|(name, version)| {
      let flattened = name.replacen('/', "-", 1).replacen('@', "", 1);
      format!("{}@{version}", utf8_percent_encode(&flattened, COMPONENT))
    })
    .collect();

  format!(
    "v{}/combinations/{}.json",
    config.bundle_version,
    segments.join("+")
  )
}

/// Store key of a single packaged dependency.
pub fn package_path(package: &RequestedPackage, config: &PackagerConfig) -> String {
  format!(
    "v{}/packages/{}/{}.json",
    config.bundle_version, package.name, package.version
  )
}

/// Stable hash naming the install directory of a package set, `None` when the set is empty.
pub fn install_hash(packages: &[RequestedPackage]) -> Option<String> {
  if packages.is_empty() {
    return None;
  }

  let by_name: BTreeMap<&str, &str> = packages
    .iter()
    .map(|package| (package.name.as_str(), package.version.as_str()))
    .collect();
  let mut pairs: Vec<String> = by_name
    .into_iter()
    .map(|(name, version)| format!("{name}:{version}"))
    .collect();
  pairs.sort();

  let json = serde_json::to_string(&pairs).unwrap_or_default();
  Some(string_hash(&json).to_string())
}

/// djb2 variant folding UTF-16 code units from the end of the string with xor.
fn string_hash(text: &str) -> u32 {
  let units: Vec<u16> = text.encode_utf16().collect();
  let mut hash: i32 = 5381;
  for unit in units.into_iter().rev() {
    hash = hash.wrapping_mul(33) ^ i32::from(unit);
  }
  hash as u32
}

/// Short-lived memory of failed builds, so repeated requests fail fast.
///
/// Entries older than the TTL are ignored and evicted lazily. Reading an entry removes it.
#[derive(Debug)]
pub struct ErrorCache {
  capacity: usize,
  ttl: Duration,
  entries: HashMap<String, (Instant, String)>,
  order: VecDeque<String>,
}

impl ErrorCache {
  /// Create a cache holding at most `capacity` errors for `ttl` each.
  pub fn new(capacity: usize, ttl: Duration) -> Self {
    Self {
      capacity,
      ttl,
      entries: HashMap::new(),
      order: VecDeque::new(),
    }
  }

  /// Cache sized from configuration.
  pub fn from_config(config: &PackagerConfig) -> Self {
    Self::new(config.error_cache_capacity, config.error_cache_ttl())
  }

  /// Remember an error for `key`.
  pub fn insert(&mut self, key: impl Into<String>, message: impl Into<String>) {
    self.insert_at(key.into(), message.into(), Instant::now());
  }

  /// Remove and return a live error for `key`.
  pub fn take(&mut self, key: &str) -> Option<String> {
    self.take_at(key, Instant::now())
  }

  /// Number of stored entries, expired ones included.
  pub fn len(&self) -> usize {
    self.entries.len()
  }

  /// Whether nothing is stored.
  pub fn is_empty(&self) -> bool {
    self.entries.is_empty()
  }

  fn insert_at(&mut self, key: String, message: String, now: Instant) {
    if self.capacity == 0 {
      return;
    }
    self.evict_expired(now);
    if self.entries.contains_key(&key) {
      self.order.retain(|existing| existing != &key);
    }
    while self.entries.len() >= self.capacity && !self.entries.contains_key(&key) {
      let Some(oldest) = self.order.pop_front() else {
        break;
      };
      self.entries.remove(&oldest);
    }
    self.order.push_back(key.clone());
    self.entries.insert(key, (now, message));
  }

  fn take_at(&mut self, key: &str, now: Instant) -> Option<String> {
    let (stored_at, message) = self.entries.remove(key)?;
    self.order.retain(|existing| existing != key);
    (now.duration_since(stored_at) <= self.ttl).then_some(message)
  }

  fn evict_expired(&mut self, now: Instant) {
    while let Some(oldest) = self.order.front() {
      let expired = self
        .entries
        .get(oldest)
        .is_none_or(|(stored_at, _)| now.duration_since(*stored_at) > self.ttl);
      if !expired {
        break;
      }
      if let Some(oldest) = self.order.pop_front() {
        self.entries.remove(&oldest);
      }
    }
  }
}

/// Errors raised by a [`BundleStore`].
#[derive(Debug)]
pub enum StoreError {
  /// Failed to read or write a stored object.
  Io {
    /// Path that caused the error.
    path: PathBuf,
    /// Source I/O error.
    source: std::io::Error,
  },
  /// A stored object could not be encoded or decoded.
  Serialize {
    /// Store key of the object.
    key: String,
    /// Source serde error.
    source: serde_json::Error,
  },
}

impl std::fmt::Display for StoreError {
  fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    match self {
      Self::Io { path, source } => write!(f, "failed to access {}: {}", path.display(), source),
      Self::Serialize { key, source } => write!(f, "invalid stored object {key}: {source}"),
    }
  }
}

impl std::error::Error for StoreError {
  fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
    match self {
      Self::Io { source, .. } => Some(source),
      Self::Serialize { source, .. } => Some(source),
    }
  }
}

/// Keyed storage for packaged and merged bundles.
pub trait BundleStore {
  /// Raw object stored under `key`, if any.
  fn get(&self, key: &str) -> Result<Option<String>, StoreError>;

  /// Store `content` under `key`, replacing any previous object in one step.
  fn put(&self, key: &str, content: &str) -> Result<(), StoreError>;

  /// Decode the JSON object stored under `key`.
  fn get_json<T: DeserializeOwned>(&self, key: &str) -> Result<Option<T>, StoreError> {
    let Some(raw) = self.get(key)? else {
      return Ok(None);
    };
    serde_json::from_str(&raw)
      .map(Some)
      .map_err(|source| StoreError::Serialize {
        key: key.to_string(),
        source,
      })
  }

  /// Encode `value` as JSON and store it under `key`.
  fn put_json<T: Serialize>(&self, key: &str, value: &T) -> Result<(), StoreError> {
    let raw = serde_json::to_string(value).map_err(|source| StoreError::Serialize {
      key: key.to_string(),
      source,
    })?;
    self.put(key, &raw)
  }
}

/// Store keeping each object as a file below a root directory.
#[derive(Debug, Clone)]
pub struct DirectoryStore {
  root: PathBuf,
}

impl DirectoryStore {
  /// Create a store rooted at `root`. The directory is created on first write.
  pub fn new(root: impl Into<PathBuf>) -> Self {
    Self { root: root.into() }
  }

  /// Filesystem path of `key`.
  pub fn path_of(&self, key: &str) -> PathBuf {
    self.root.join(key)
  }
}

impl BundleStore for DirectoryStore {
  fn get(&self, key: &str) -> Result<Option<String>, StoreError> {
    let path = self.path_of(key);
    match fs::read_to_string(&path) {
      Ok(content) => Ok(Some(content)),
      Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(None),
      Err(source) => Err(StoreError::Io { path, source }),
    }
  }

  fn put(&self, key: &str, content: &str) -> Result<(), StoreError> {
    let path = self.path_of(key);
    let io_error = |path: &Path| {
      let path = path.to_path_buf();
      move |source: std::io::Error| StoreError::Io { path, source }
    };

    if let Some(parent) = path.parent() {
      fs::create_dir_all(parent).map_err(io_error(parent))?;
    }
    let temp = temp_sibling(&path);
    fs::write(&temp, content).map_err(io_error(&temp))?;
    if let Err(source) = fs::rename(&temp, &path) {
      let _ = fs::remove_file(&temp);
      return Err(StoreError::Io { path, source });
    }
    Ok(())
  }
}

fn temp_sibling(path: &Path) -> PathBuf {
  static COUNTER: AtomicU64 = AtomicU64::new(0);
  let unique = COUNTER.fetch_add(1, Ordering::Relaxed);
  let file_name = path
    .file_name()
    .map(|name| name.to_string_lossy().into_owned())
    .unwrap_or_default();
  path.with_file_name(format!(".{file_name}.{}.{unique}.tmp", std::process::id()))
}

/// Merged-bundle lookup in front of a store, remembering recent failures.
#[derive(Debug)]
pub struct BundleCache<S> {
  store: S,
  errors: ErrorCache,
  config: PackagerConfig,
}

impl<S: BundleStore> BundleCache<S> {
  /// Wrap a store using the cache settings of `config`.
  pub fn new(store: S, config: PackagerConfig) -> Self {
    Self {
      store,
      errors: ErrorCache::from_config(&config),
      config,
    }
  }

  /// Underlying store.
  pub fn store(&self) -> &S {
    &self.store
  }

  /// Return the stored bundle for `packages`, building and storing it on a miss.
  ///
  /// A build failure is remembered for the configured TTL and returned again, once, without
  /// rebuilding.
  pub fn get_or_build<F>(&mut self, packages: &[RequestedPackage], build: F) -> Result<BundleManifest>
  where
    F: FnOnce() -> Result<BundleManifest>,
  {
    let key = bundle_path(packages, &self.config);
    if let Some(message) = self.errors.take(&key) {
      log::debug!("returning cached failure for {key}");
      return Err(anyhow!(message));
    }
    if let Some(bundle) = self.store.get_json::<BundleManifest>(&key)? {
      log::info!("serving {key} from store");
      return Ok(bundle);
    }

    match build() {
      Ok(bundle) => {
        self.store.put_json(&key, &bundle)?;
        log::info!("stored {key}");
        Ok(bundle)
      }
      Err(err) => {
        self.errors.insert(key, format!("{err:#}"));
        Err(err)
      }
    }
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use std::cell::Cell;
  use tempfile::tempdir;

  fn packages(pairs: &[(&str, &str)]) -> Vec<RequestedPackage> {
    pairs
      .iter()
      .map(|(name, version)| RequestedPackage::new(*name, *version))
      .collect()
  }

  #[test]
  fn parses_scoped_combinations() {
    let parsed = parse_combination("react@16.0.0+@emotion/core@10.0.0").unwrap();
    assert_eq!(
      parsed,
      packages(&[("react", "16.0.0"), ("@emotion/core", "10.0.0")])
    );
  }

  #[test]
  fn rejects_malformed_combinations() {
    assert!(matches!(
      parse_combination("react@16.0.0++a@1.0.0"),
      Err(ParseError::EmptySegment { .. })
    ));
    assert_eq!(
      parse_combination("react"),
      Err(ParseError::MissingVersion {
        segment: "react".into()
      })
    );
    assert!(parse_combination("@scope/pkg").is_err());
    assert!(parse_combination("react@").is_err());
  }

  #[test]
  fn bundle_path_is_sorted_flattened_and_encoded() {
    let config = PackagerConfig::default();
    let requested = packages(&[
      ("react", "16.0.0"),
      ("node-libs-browser", "2.2.0"),
      ("@emotion/core", "10.0.0"),
      ("a+b", "1.0.0"),
    ]);

    assert_eq!(
      bundle_path(&requested, &config),
      "v1/combinations/emotion-core@10.0.0+a%2Bb@1.0.0+react@16.0.0.json"
    );
  }

  #[test]
  fn bundle_path_ignores_request_order() {
    let config = PackagerConfig::default();
    let forward = packages(&[("a", "1.0.0"), ("b", "2.0.0")]);
    let backward = packages(&[("b", "2.0.0"), ("a", "1.0.0")]);
    assert_eq!(bundle_path(&forward, &config), bundle_path(&backward, &config));
    assert_eq!(
      bundle_path(&forward, &config),
      "v1/combinations/a@1.0.0+b@2.0.0.json"
    );
  }

  #[test]
  fn package_path_keeps_scoped_name() {
    let config = PackagerConfig {
      bundle_version: 3,
      ..PackagerConfig::default()
    };
    assert_eq!(
      package_path(&RequestedPackage::new("@emotion/core", "10.0.0"), &config),
      "v3/packages/@emotion/core/10.0.0.json"
    );
  }

  #[test]
  fn install_hash_matches_string_hash() {
    assert_eq!(install_hash(&[]), None);
    assert_eq!(string_hash(""), 5381);
    assert_eq!(string_hash("a"), 177604);
    assert_eq!(string_hash("hello"), 181380007);

    let forward = install_hash(&packages(&[("react", "16.0.0"), ("fbjs", "1.0.0")]));
    let backward = install_hash(&packages(&[("fbjs", "1.0.0"), ("react", "16.0.0")]));
    assert_eq!(forward, backward);
    assert_eq!(
      forward,
      Some(string_hash(r#"["fbjs:1.0.0","react:16.0.0"]"#).to_string())
    );
  }

  #[test]
  fn error_cache_reads_once_and_expires() {
    let ttl = Duration::from_secs(5);
    let mut cache = ErrorCache::new(8, ttl);
    let start = Instant::now();

    cache.insert_at("a".into(), "boom".into(), start);
    assert_eq!(cache.take_at("a", start + Duration::from_secs(1)), Some("boom".into()));
    assert_eq!(cache.take_at("a", start + Duration::from_secs(1)), None);

    cache.insert_at("b".into(), "late".into(), start);
    assert_eq!(cache.take_at("b", start + Duration::from_secs(6)), None);
    assert!(cache.is_empty());
  }

  #[test]
  fn error_cache_evicts_oldest_at_capacity() {
    let mut cache = ErrorCache::new(2, Duration::from_secs(5));
    let start = Instant::now();
    cache.insert_at("a".into(), "1".into(), start);
    cache.insert_at("b".into(), "2".into(), start);
    cache.insert_at("c".into(), "3".into(), start);

    assert_eq!(cache.len(), 2);
    assert_eq!(cache.take_at("a", start), None);
    assert_eq!(cache.take_at("c", start), Some("3".into()));
  }

  #[test]
  fn directory_store_round_trips_and_replaces() {
    let dir = tempdir().unwrap();
    let store = DirectoryStore::new(dir.path());
    let key = "v1/combinations/a@1.0.0.json";

    assert_eq!(store.get(key).unwrap(), None);
    store.put(key, "first").unwrap();
    store.put(key, "second").unwrap();
    assert_eq!(store.get(key).unwrap().as_deref(), Some("second"));

    let leftovers: Vec<_> = fs::read_dir(dir.path().join("v1/combinations"))
      .unwrap()
      .flatten()
      .map(|entry| entry.file_name())
      .collect();
    assert_eq!(leftovers.len(), 1);
  }

  #[test]
  fn bundle_cache_builds_once_then_serves_store() {
    let dir = tempdir().unwrap();
    let mut cache = BundleCache::new(DirectoryStore::new(dir.path()), PackagerConfig::default());
    let requested = packages(&[("a", "1.0.0")]);
    let builds = Cell::new(0);

    let build = || -> Result<BundleManifest> {
      builds.set(builds.get() + 1);
      Ok(BundleManifest {
        dependencies: requested.clone(),
        ..BundleManifest::default()
      })
    };
    let first = cache.get_or_build(&requested, build).unwrap();
    let second = cache.get_or_build(&requested, build).unwrap();

    assert_eq!(first, second);
    assert_eq!(builds.get(), 1);
    assert!(dir.path().join("v1/combinations/a@1.0.0.json").is_file());
  }

  #[test]
  fn bundle_cache_remembers_failures_once() {
    let dir = tempdir().unwrap();
    let mut cache = BundleCache::new(DirectoryStore::new(dir.path()), PackagerConfig::default());
    let requested = packages(&[("a", "1.0.0")]);
    let builds = Cell::new(0);

    let failing = || -> Result<BundleManifest> {
      builds.set(builds.get() + 1);
      Err(anyhow!("install failed"))
    };
    assert!(cache.get_or_build(&requested, failing).is_err());
    let cached = cache.get_or_build(&requested, failing).unwrap_err();
    assert_eq!(cached.to_string(), "install failed");
    assert_eq!(builds.get(), 1);

    assert!(cache.get_or_build(&requested, failing).is_err());
    assert_eq!(builds.get(), 2);
  }
}
