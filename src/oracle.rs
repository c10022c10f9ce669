//! Seams to the module-resolution and static-analysis collaborators.

use crate::installed::InstalledTree;
use crate::models::PackageManifest;

/// Node-style resolution of manifests and entry files.
pub trait ResolutionOracle {
  /// Resolve `request` (e.g. `fbjs/package.json`) starting from `base_dir`.
  fn resolve_manifest_path(&self, base_dir: &str, request: &str) -> Option<String>;

  /// Entry files a consumer would load from the package in `package_dir`.
  fn resolve_entry_files(&self, package_dir: &str, manifest: &PackageManifest) -> Vec<String>;
}

/// Specifiers found in one file.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ExtractedSpecifiers {
  /// Module specifiers in source order, deduplicated.
  pub specifiers: Vec<String>,
  /// Whether the file uses ES module syntax.
  pub is_module: bool,
}

/// Extracts module specifiers from file content.
pub trait SpecifierExtractor {
  /// Analyse a single file.
  fn extract_specifiers(&self, content: &str) -> ExtractedSpecifiers;
}

/// Resolver answering manifest lookups from an [`InstalledTree`] snapshot.
///
/// Lookup walks up from the base directory trying `<dir>/node_modules/<request>`, the same order
/// Node uses, skipping directories that are themselves `node_modules`.
///
/// Entry files are only the manifest's main field (browser, main, unpkg, module), or `index.js`
/// without one. There is no fallback search of `dist`, `lib` or `build` directories and no
/// directory blacklist, so when the main field names a file that does not exist the crawl starts
/// from nothing; plug in another [`ResolutionOracle`] for that.
#[derive(Debug, Clone, Copy)]
pub struct NodeModulesResolver<'a> {
  tree: &'a InstalledTree,
}

impl<'a> NodeModulesResolver<'a> {
  /// Create a resolver over a tree.
  pub fn new(tree: &'a InstalledTree) -> Self {
    Self { tree }
  }
}

impl ResolutionOracle for NodeModulesResolver<'_> {
  fn resolve_manifest_path(&self, base_dir: &str, request: &str) -> Option<String> {
    let mut dir = base_dir.trim_end_matches('/');
    loop {
      if !dir.ends_with("/node_modules") {
        let candidate = format!("{dir}/node_modules/{request}");
        if self.tree.contains(&candidate) {
          return Some(candidate);
        }
      }
      if dir.len() <= self.tree.root().len() {
        return None;
      }
      dir = match dir.rfind('/') {
        Some(index) => &dir[..index],
        None => return None,
      };
    }
  }

  fn resolve_entry_files(&self, package_dir: &str, manifest: &PackageManifest) -> Vec<String> {
    let main = manifest.main_field().unwrap_or("index.js");
    let main = main.trim_start_matches("./");
    vec![format!("{}/{}", package_dir.trim_end_matches('/'), main)]
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  fn tree() -> InstalledTree {
    InstalledTree::new("/tmp/x")
      .with_package("node_modules/a", PackageManifest::default())
      .with_package("node_modules/b", PackageManifest::default())
      .with_package("node_modules/a/node_modules/b", PackageManifest::default())
  }

  #[test]
  fn prefers_nearest_node_modules() {
    let tree = tree();
    let resolver = NodeModulesResolver::new(&tree);

    assert_eq!(
      resolver.resolve_manifest_path("/tmp/x/node_modules/a", "b/package.json"),
      Some("/tmp/x/node_modules/a/node_modules/b/package.json".to_string())
    );
    assert_eq!(
      resolver.resolve_manifest_path("/tmp/x/node_modules/b", "a/package.json"),
      Some("/tmp/x/node_modules/a/package.json".to_string())
    );
  }

  #[test]
  fn misses_are_none() {
    let tree = tree();
    let resolver = NodeModulesResolver::new(&tree);
    assert_eq!(
      resolver.resolve_manifest_path("/tmp/x/node_modules/a", "zzz/package.json"),
      None
    );
  }

  #[test]
  fn entry_files_fall_back_to_index() {
    let tree = tree();
    let resolver = NodeModulesResolver::new(&tree);
    let manifest = PackageManifest {
      main: Some("./lib/main.js".into()),
      ..PackageManifest::default()
    };

    assert_eq!(
      resolver.resolve_entry_files("/tmp/x/node_modules/a", &manifest),
      vec!["/tmp/x/node_modules/a/lib/main.js".to_string()]
    );
    assert_eq!(
      resolver.resolve_entry_files("/tmp/x/node_modules/a", &PackageManifest::default()),
      vec!["/tmp/x/node_modules/a/index.js".to_string()]
    );
  }

  #[test]
  fn entry_files_never_guess_build_directories() {
    let tree = tree();
    let resolver = NodeModulesResolver::new(&tree);
    let manifest = PackageManifest {
      module: Some("dist/index.mjs".into()),
      ..PackageManifest::default()
    };

    assert_eq!(
      resolver.resolve_entry_files("/tmp/x/node_modules/b", &manifest),
      vec!["/tmp/x/node_modules/b/dist/index.mjs".to_string()]
    );
    assert_eq!(
      resolver.resolve_entry_files("/tmp/x/node_modules/b/", &PackageManifest::default()),
      vec!["/tmp/x/node_modules/b/index.js".to_string()]
    );
  }
}
