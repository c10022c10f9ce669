//! Data structures produced while walking and merging dependency bundles.

use std::collections::{BTreeMap, BTreeSet};

use serde::{Deserialize, Serialize};

/// Dependency table keyed by dependency key (`name` or `name/version` when aliased).
pub type DependencyTable = BTreeMap<String, DependencyRecord>;

/// Per consuming package, original dependency name to the redirected dependency key.
pub type AliasTable = BTreeMap<String, BTreeMap<String, String>>;

/// Virtual file system rooted at `/node_modules/<key>/...`.
pub type ContentMap = BTreeMap<String, ContentEntry>;

/// Union of declared `peerDependencies`, name to range.
pub type PeerDependencies = BTreeMap<String, String>;

/// Subset of an installed `package.json` used while walking.
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PackageManifest {
  /// Package name as declared by the manifest.
  #[serde(default)]
  pub name: String,
  /// Absolute installed version.
  #[serde(default)]
  pub version: String,
  /// Declared runtime dependencies.
  #[serde(default)]
  pub dependencies: BTreeMap<String, String>,
  /// Declared peer dependencies.
  #[serde(default)]
  pub peer_dependencies: BTreeMap<String, String>,
  /// Entry field `main`.
  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub main: Option<String>,
  /// Entry field `module`.
  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub module: Option<String>,
  /// Entry field `browser`, either a path or a remapping object.
  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub browser: Option<serde_json::Value>,
  /// Entry field `unpkg`.
  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub unpkg: Option<String>,
}

impl PackageManifest {
  /// The first string-valued entry field, checked in `browser`, `main`, `unpkg`, `module` order.
  pub fn main_field(&self) -> Option<&str> {
    let browser = self.browser.as_ref().and_then(|value| value.as_str());
    browser
      .or(self.main.as_deref())
      .or(self.unpkg.as_deref())
      .or(self.module.as_deref())
  }
}

/// A requested top-level package at an absolute version.
#[derive(Debug, Clone, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Deserialize, Serialize)]
pub struct RequestedPackage {
  /// Package name, possibly scoped.
  pub name: String,
  /// Absolute version.
  pub version: String,
}

impl RequestedPackage {
  /// Construct a request from a name and version.
  pub fn new(name: impl Into<String>, version: impl Into<String>) -> Self {
    Self {
      name: name.into(),
      version: version.into(),
    }
  }
}

impl std::fmt::Display for RequestedPackage {
  fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    write!(f, "{}@{}", self.name, self.version)
  }
}

/// A transitive dependency as seen by the bundle.
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DependencyRecord {
  /// Range declared by the first parent that required the dependency.
  #[serde(rename = "semver")]
  pub semver_range: String,
  /// Installed version the range resolved to.
  #[serde(rename = "resolved")]
  pub resolved_version: String,
  /// Dependency keys (or top-level names) requiring this dependency.
  pub parents: BTreeSet<String>,
  /// Deep specifiers observed as used. Empty means the whole package.
  pub entries: BTreeSet<String>,
  /// Top-level packages whose walk contributed this record.
  #[serde(default)]
  pub parent_root_dependencies: BTreeSet<String>,
}

/// A single file in the bundle's virtual file system.
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ContentEntry {
  /// Raw file content.
  pub content: String,
  /// Specifiers discovered in the file, when it was analysed.
  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub requires: Option<Vec<String>>,
  /// Whether the file was detected as an ES module.
  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub is_module: Option<bool>,
}

impl ContentEntry {
  /// Entry carrying only file content.
  pub fn new(content: impl Into<String>) -> Self {
    Self {
      content: content.into(),
      requires: None,
      is_module: None,
    }
  }
}

/// Tables produced by walking one top-level package.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct WalkOutput {
  /// Transitive dependencies keyed by dependency key.
  pub dependency_table: DependencyTable,
  /// Redirections recorded for nested installs.
  pub alias_table: AliasTable,
  /// Union of encountered peer dependencies.
  pub peer_dependencies: PeerDependencies,
}

/// One packaged top-level dependency, as cached per package.
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PackageBundle {
  /// Files required by the package and its dependencies.
  #[serde(default)]
  pub contents: ContentMap,
  /// The packaged top-level dependency.
  pub dependency: RequestedPackage,
  /// Transitive dependency records.
  #[serde(default)]
  pub dependency_dependencies: DependencyTable,
  /// Alias redirections recorded while walking.
  #[serde(default)]
  pub dependency_aliases: AliasTable,
  /// Union of encountered peer dependencies.
  #[serde(default)]
  pub peer_dependencies: PeerDependencies,
}

impl PackageBundle {
  /// Assemble a bundle from a walk and the contents it rewrote.
  pub fn from_walk(dependency: RequestedPackage, contents: ContentMap, walk: WalkOutput) -> Self {
    Self {
      contents,
      dependency,
      dependency_dependencies: walk.dependency_table,
      dependency_aliases: walk.alias_table,
      peer_dependencies: walk.peer_dependencies,
    }
  }
}

/// The merged, deduplicated bundle consumed by the downstream bundler.
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct BundleManifest {
  /// Flat file-content map for every key in the bundle.
  #[serde(default)]
  pub contents: ContentMap,
  /// Requested top-level packages, ordered by name.
  #[serde(default)]
  pub dependencies: Vec<RequestedPackage>,
  /// Resolved transitive dependency graph.
  #[serde(default)]
  pub dependency_dependencies: DependencyTable,
  /// Alias redirections per consuming package.
  #[serde(default)]
  pub dependency_aliases: AliasTable,
  /// Union of all peer dependencies.
  #[serde(default)]
  pub peer_dependencies: PeerDependencies,
}

impl BundleManifest {
  /// Sort key used to order merge contributors deterministically.
  pub fn sort_key(&self) -> Vec<(&str, &str)> {
    self
      .dependencies
      .iter()
      .map(|package| (package.name.as_str(), package.version.as_str()))
      .collect()
  }

  /// Names of the top-level packages this manifest contributes.
  pub fn root_names(&self) -> BTreeSet<String> {
    self
      .dependencies
      .iter()
      .map(|package| package.name.clone())
      .collect()
  }
}

impl From<PackageBundle> for BundleManifest {
  fn from(bundle: PackageBundle) -> Self {
    Self {
      contents: bundle.contents,
      dependencies: vec![bundle.dependency],
      dependency_dependencies: bundle.dependency_dependencies,
      dependency_aliases: bundle.dependency_aliases,
      peer_dependencies: bundle.peer_dependencies,
    }
  }
}

/// Virtual directory prefix (without trailing slash) owned by a dependency key.
pub fn key_prefix(key: &str) -> String {
  format!("/node_modules/{key}")
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn record_uses_wire_field_names() {
    let record = DependencyRecord {
      semver_range: "^12.0.0".into(),
      resolved_version: "12.0.0".into(),
      parents: BTreeSet::from(["react".to_string()]),
      entries: BTreeSet::from(["fbjs".to_string()]),
      parent_root_dependencies: BTreeSet::new(),
    };

    let json = serde_json::to_value(&record).unwrap();
    assert_eq!(json["semver"], "^12.0.0");
    assert_eq!(json["resolved"], "12.0.0");
    assert_eq!(json["parents"], serde_json::json!(["react"]));
    assert_eq!(json["parentRootDependencies"], serde_json::json!([]));
  }

  #[test]
  fn reads_records_without_root_dependencies() {
    let record: DependencyRecord = serde_json::from_str(
      r#"{"semver":"^1.0.0","resolved":"1.0.1","parents":["b","a","a"],"entries":["x/y","x"]}"#,
    )
    .unwrap();

    assert_eq!(record.parents.iter().collect::<Vec<_>>(), vec!["a", "b"]);
    assert_eq!(record.entries.iter().collect::<Vec<_>>(), vec!["x", "x/y"]);
    assert!(record.parent_root_dependencies.is_empty());
  }

  #[test]
  fn manifest_always_serialises_every_field() {
    let json = serde_json::to_value(BundleManifest::default()).unwrap();
    for field in [
      "contents",
      "dependencies",
      "dependencyDependencies",
      "dependencyAliases",
      "peerDependencies",
    ] {
      assert!(json.get(field).is_some(), "missing {field}");
    }
  }

  #[test]
  fn main_field_prefers_browser_string() {
    let manifest: PackageManifest = serde_json::from_str(
      r#"{"name":"a","version":"1.0.0","main":"lib/index.js","browser":{"./x":false}}"#,
    )
    .unwrap();
    assert_eq!(manifest.main_field(), Some("lib/index.js"));

    let manifest: PackageManifest =
      serde_json::from_str(r#"{"name":"a","version":"1.0.0","main":"m.js","browser":"b.js"}"#)
        .unwrap();
    assert_eq!(manifest.main_field(), Some("b.js"));
  }
}
