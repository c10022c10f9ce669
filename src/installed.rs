//! Snapshot of an installed `node_modules` tree.
//!
//! Paths are stored as `/`-separated strings so that the virtual paths written into a bundle are
//! identical on every platform.

use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};

use crate::models::{ContentEntry, ContentMap, PackageManifest};

const NODE_MODULES: &str = "node_modules";
const MANIFEST_FILE: &str = "package.json";

/// Installed manifest along with the text it was parsed from.
#[derive(Debug, Clone)]
struct InstalledPackage {
  manifest: PackageManifest,
  source: String,
}

/// Every `package.json` found beneath an install root, keyed by absolute manifest path.
#[derive(Debug, Clone, Default)]
pub struct InstalledTree {
  root: String,
  packages: BTreeMap<String, InstalledPackage>,
}

/// Errors that can occur while loading an installed tree from disk.
#[derive(Debug)]
pub enum InstallError {
  /// Failed to read a directory or manifest.
  Io {
    /// Path that caused the error.
    path: PathBuf,
    /// Source I/O error.
    source: std::io::Error,
  },
  /// The install root has no `node_modules` directory.
  MissingNodeModules {
    /// Install root that was scanned.
    root: PathBuf,
  },
}

impl InstalledTree {
  /// Create an empty tree for the given install root.
  pub fn new(root: impl Into<String>) -> Self {
    Self {
      root: normalise(&root.into()),
      packages: BTreeMap::new(),
    }
  }

  /// Register a manifest found in `relative_dir` (e.g. `node_modules/a/node_modules/b`).
  pub fn insert(&mut self, relative_dir: &str, manifest: PackageManifest) {
    let source = serde_json::to_string(&manifest).unwrap_or_default();
    let path = format!(
      "{}/{}/{}",
      self.root,
      relative_dir.trim_matches('/'),
      MANIFEST_FILE
    );
    self.packages.insert(path, InstalledPackage { manifest, source });
  }

  /// Builder form of [`InstalledTree::insert`].
  pub fn with_package(mut self, relative_dir: &str, manifest: PackageManifest) -> Self {
    self.insert(relative_dir, manifest);
    self
  }

  /// Install root without trailing slash.
  pub fn root(&self) -> &str {
    &self.root
  }

  /// Directory holding the top-level install of `name`.
  pub fn package_dir(&self, name: &str) -> String {
    format!("{}/{}/{}", self.root, NODE_MODULES, name)
  }

  /// Manifest stored at an absolute manifest path.
  pub fn manifest(&self, manifest_path: &str) -> Option<&PackageManifest> {
    self
      .packages
      .get(manifest_path)
      .map(|package| &package.manifest)
  }

  /// Whether a file exists in the snapshot.
  pub fn contains(&self, path: &str) -> bool {
    self.packages.contains_key(path)
  }

  /// Path relative to the install root, keeping the leading slash.
  pub fn relative<'a>(&self, path: &'a str) -> &'a str {
    path.strip_prefix(self.root.as_str()).unwrap_or(path)
  }

  /// Whether a manifest lives directly under the root `node_modules`.
  pub fn is_root_install(&self, manifest_path: &str) -> bool {
    self.relative(manifest_path).matches("/node_modules/").count() == 1
  }

  /// Every manifest as a bundle file at its root-relative path.
  pub fn manifest_contents(&self) -> ContentMap {
    self
      .packages
      .iter()
      .map(|(path, package)| {
        (
          self.relative(path).to_string(),
          ContentEntry::new(package.source.clone()),
        )
      })
      .collect()
  }

  /// Number of manifests in the tree.
  pub fn len(&self) -> usize {
    self.packages.len()
  }

  /// Whether the tree holds no manifests.
  pub fn is_empty(&self) -> bool {
    self.packages.is_empty()
  }

  /// Scan `<root>/node_modules`, including scoped and nested installs.
  pub fn load(root: impl AsRef<Path>) -> Result<Self, InstallError> {
    let root = root.as_ref();
    let node_modules = root.join(NODE_MODULES);
    if !node_modules.is_dir() {
      return Err(InstallError::MissingNodeModules {
        root: root.to_path_buf(),
      });
    }

    let mut tree = Self::new(root.to_string_lossy());
    let mut package_dirs = Vec::new();
    collect_package_dirs(&node_modules, &mut package_dirs)?;

    for dir in package_dirs {
      let manifest_path = dir.join(MANIFEST_FILE);
      if !manifest_path.is_file() {
        continue;
      }
      let source = fs::read_to_string(&manifest_path).map_err(|source| InstallError::Io {
        path: manifest_path.clone(),
        source,
      })?;
      let manifest: PackageManifest = match serde_json::from_str(&source) {
        Ok(manifest) => manifest,
        Err(err) => {
          log::warn!("skipping unparseable {}: {}", manifest_path.display(), err);
          continue;
        }
      };
      tree.packages.insert(
        normalise(&manifest_path.to_string_lossy()),
        InstalledPackage { manifest, source },
      );
    }

    log::debug!("loaded {} manifests from {}", tree.len(), root.display());
    Ok(tree)
  }
}

fn collect_package_dirs(dir: &Path, found: &mut Vec<PathBuf>) -> Result<(), InstallError> {
  for child in sorted_subdirectories(dir)? {
    let is_scope = child
      .file_name()
      .is_some_and(|name| name.to_string_lossy().starts_with('@'));
    if is_scope {
      collect_package_dirs(&child, found)?;
      continue;
    }

    let nested = child.join(NODE_MODULES);
    found.push(child);
    if nested.is_dir() {
      collect_package_dirs(&nested, found)?;
    }
  }
  Ok(())
}

fn sorted_subdirectories(dir: &Path) -> Result<Vec<PathBuf>, InstallError> {
  let entries = fs::read_dir(dir).map_err(|source| InstallError::Io {
    path: dir.to_path_buf(),
    source,
  })?;

  let mut dirs: Vec<PathBuf> = entries
    .flatten()
    .filter(|entry| !entry.file_name().to_string_lossy().starts_with('.'))
    .filter(|entry| entry.file_type().is_ok_and(|ft| ft.is_dir()))
    .map(|entry| entry.path())
    .collect();
  dirs.sort();
  Ok(dirs)
}

fn normalise(path: &str) -> String {
  path.replace('\\', "/").trim_end_matches('/').to_string()
}

impl std::fmt::Display for InstallError {
  fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    match self {
      Self::Io { path, source } => {
        write!(f, "failed to read {}: {}", path.display(), source)
      }
      Self::MissingNodeModules { root } => {
        write!(f, "no node_modules directory in {}", root.display())
      }
    }
  }
}

impl std::error::Error for InstallError {
  fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
    match self {
      Self::Io { source, .. } => Some(source),
      Self::MissingNodeModules { .. } => None,
    }
  }
}
