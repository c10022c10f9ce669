//! Per-package pipeline and the package-then-merge orchestration.

use std::fs;
use std::path::Path;
use std::thread;

use anyhow::{Context, Result};

use crate::crawl::crawl;
use crate::installed::InstalledTree;
use crate::merge::{MergeError, MergeOptions, merge_packages};
use crate::models::{
  BundleManifest, ContentEntry, ContentMap, DependencyTable, PackageBundle, RequestedPackage,
  key_prefix,
};
use crate::oracle::{ResolutionOracle, SpecifierExtractor};
use crate::requires::RequireUsage;
use crate::walker::walk;

const BUNDLED_EXTENSIONS: [&str; 5] = [".js", ".mjs", ".cjs", ".json", ".css"];

/// One top-level package to package, along with the files fetched for it.
#[derive(Debug, Clone, Default)]
pub struct PackageRequest {
  /// Requested package; an empty version is filled from the installed manifest.
  pub package: RequestedPackage,
  /// Files already fetched for the package, keyed by virtual path.
  pub contents: ContentMap,
}

impl PackageRequest {
  /// Request a package with no pre-fetched files.
  pub fn new(package: RequestedPackage) -> Self {
    Self {
      package,
      contents: ContentMap::new(),
    }
  }
}

/// Packages top-level dependencies out of one installed tree.
#[derive(Debug, Clone)]
pub struct Packager<'a, O, E> {
  tree: &'a InstalledTree,
  oracle: O,
  extractor: E,
}

impl<'a, O: ResolutionOracle, E: SpecifierExtractor> Packager<'a, O, E> {
  /// Create a packager over an installed tree.
  pub fn new(tree: &'a InstalledTree, oracle: O, extractor: E) -> Self {
    Self {
      tree,
      oracle,
      extractor,
    }
  }

  /// Walk one top-level package and assemble its bundle.
  ///
  /// Only files reachable from the package's entry files are kept, and only their specifiers
  /// decide which deep entries each dependency records. Installed manifests are added as files,
  /// then manifests of packages the walk never reached are dropped.
  pub fn package(&self, request: PackageRequest) -> PackageBundle {
    let PackageRequest {
      mut package,
      contents: fetched,
    } = request;

    if package.version.is_empty() {
      let manifest_path = format!("{}/package.json", self.tree.package_dir(&package.name));
      if let Some(manifest) = self.tree.manifest(&manifest_path) {
        package.version = manifest.version.clone();
      }
    }

    let crawled = crawl(
      &package.name,
      self.tree,
      &self.oracle,
      &self.extractor,
      &fetched,
    );
    let usage = RequireUsage::from_contents(&crawled);
    let mut contents = self.tree.manifest_contents();
    contents.extend(crawled);

    let walked = walk(&package.name, self.tree, &self.oracle, &usage, &mut contents);
    retain_reachable(&mut contents, &package.name, &walked.dependency_table);

    log::info!(
      "packaged {package} with {} dependencies and {} files",
      walked.dependency_table.len(),
      contents.len()
    );
    PackageBundle::from_walk(package, contents, walked)
  }
}

impl<O, E> Packager<'_, O, E>
where
  O: ResolutionOracle + Sync,
  E: SpecifierExtractor + Sync,
{
  /// Package every request on its own thread, returning bundles in request order.
  pub fn package_all(&self, requests: Vec<PackageRequest>) -> Vec<PackageBundle> {
    thread::scope(|scope| {
      let handles: Vec<_> = requests
        .into_iter()
        .map(|request| scope.spawn(move || self.package(request)))
        .collect();

      handles
        .into_iter()
        .filter_map(|handle| match handle.join() {
          Ok(bundle) => Some(bundle),
          Err(_) => {
            log::error!("packaging thread panicked");
            None
          }
        })
        .collect()
    })
  }

  /// Package every request and merge the results.
  pub fn build_bundle(
    &self,
    requests: Vec<PackageRequest>,
    options: &MergeOptions,
  ) -> Result<BundleManifest, MergeError> {
    merge_packages(self.package_all(requests), options)
  }
}

/// Keep only files under the top package or one of the walked dependency keys.
fn retain_reachable(contents: &mut ContentMap, top_package: &str, table: &DependencyTable) {
  let prefixes: Vec<String> = std::iter::once(top_package)
    .chain(table.keys().map(String::as_str))
    .map(|key| format!("{}/", key_prefix(key)))
    .collect();
  contents.retain(|path, _| prefixes.iter().any(|prefix| path.starts_with(prefix)));
}

/// Read every bundleable file below `<root>/node_modules` into a content map.
pub fn read_install_files(root: &Path) -> Result<ContentMap> {
  let mut contents = ContentMap::new();
  let node_modules = root.join("node_modules");
  read_dir_into(root, &node_modules, &mut contents)?;
  Ok(contents)
}

fn read_dir_into(root: &Path, dir: &Path, contents: &mut ContentMap) -> Result<()> {
  let entries =
    fs::read_dir(dir).with_context(|| format!("failed to read directory {}", dir.display()))?;

  for entry in entries {
    let entry = entry.with_context(|| format!("failed to read entry in {}", dir.display()))?;
    let path = entry.path();
    if entry.file_name().to_string_lossy().starts_with('.') {
      continue;
    }

    let file_type = entry
      .file_type()
      .with_context(|| format!("failed to stat {}", path.display()))?;
    if file_type.is_dir() {
      read_dir_into(root, &path, contents)?;
      continue;
    }

    let name = path.to_string_lossy();
    if !BUNDLED_EXTENSIONS.iter().any(|ext| name.ends_with(ext)) {
      continue;
    }
    let Ok(text) = fs::read_to_string(&path) else {
      log::warn!("skipping non UTF-8 file {}", path.display());
      continue;
    };
    let relative = path.strip_prefix(root).unwrap_or(&path);
    let virtual_path = format!("/{}", relative.to_string_lossy().replace('\\', "/"));
    contents.insert(virtual_path, ContentEntry::new(text));
  }
  Ok(())
}
