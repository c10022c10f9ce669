//! Entry-driven crawl of the files a top-level package actually loads.
//!
//! The crawl starts at the package's entry files and follows every specifier its scripts
//! require. Relative specifiers are tried with Node's extension and `index` fallbacks, bare
//! specifiers go through the nearest installed manifest, and a `glob:` directory pulls in every
//! script and JSON file below it. Anything never reached stays out of the bundle.

use std::collections::VecDeque;

use crate::installed::InstalledTree;
use crate::models::ContentMap;
use crate::oracle::{ResolutionOracle, SpecifierExtractor};
use crate::requires::{GLOB_PREFIX, analyse_entry, dependency_name};

const MANIFEST_FILE: &str = "package.json";
const RESOLVED_SUFFIXES: [&str; 5] = ["", ".js", ".json", "/index.js", "/index.json"];
const GLOBBED_EXTENSIONS: [&str; 4] = [".js", ".mjs", ".cjs", ".json"];

/// Collect the files of `available` reachable from the entry files of `top_package`.
///
/// Every reached script comes back analysed. Specifiers that resolve to nothing in `available`
/// (node builtins, files that were not fetched) are skipped.
pub fn crawl<O: ResolutionOracle, E: SpecifierExtractor>(
  top_package: &str,
  tree: &InstalledTree,
  oracle: &O,
  extractor: &E,
  available: &ContentMap,
) -> ContentMap {
  let crawler = Crawler {
    tree,
    oracle,
    available,
  };

  let package_dir = tree.package_dir(top_package);
  let Some(manifest) = tree.manifest(&format!("{package_dir}/{MANIFEST_FILE}")) else {
    log::warn!("{top_package} is not installed, nothing to crawl");
    return ContentMap::new();
  };

  let mut queue = VecDeque::new();
  for entry in oracle.resolve_entry_files(&package_dir, manifest) {
    let entry = tree.relative(&entry);
    match crawler.find_file(entry) {
      Some(path) => queue.push_back(path),
      None => log::warn!("entry file {entry} of {top_package} was not fetched"),
    }
  }

  let mut reached = ContentMap::new();
  while let Some(path) = queue.pop_front() {
    if reached.contains_key(&path) {
      continue;
    }
    let Some(entry) = available.get(&path) else {
      continue;
    };
    let mut entry = entry.clone();
    analyse_entry(&path, &mut entry, extractor);

    for specifier in entry.requires.iter().flatten() {
      for target in crawler.resolve(&path, specifier) {
        if !reached.contains_key(&target) {
          queue.push_back(target);
        }
      }
    }
    reached.insert(path, entry);
  }

  log::debug!("crawled {} files from {top_package}", reached.len());
  reached
}

struct Crawler<'a, O> {
  tree: &'a InstalledTree,
  oracle: &'a O,
  available: &'a ContentMap,
}

impl<O: ResolutionOracle> Crawler<'_, O> {
  /// Files `specifier` refers to when required from the file at `from`.
  fn resolve(&self, from: &str, specifier: &str) -> Vec<String> {
    let dir = parent_dir(from);

    if let Some(glob) = specifier.strip_prefix(GLOB_PREFIX) {
      return self.glob(&join_path(dir, glob));
    }
    if is_relative(specifier) {
      return self.find_file(&join_path(dir, specifier)).into_iter().collect();
    }

    let Some(name) = dependency_name(specifier) else {
      log::debug!("{from} requires unsupported specifier {specifier}");
      return Vec::new();
    };
    let base_dir = format!("{}{dir}", self.tree.root());
    let Some(manifest_path) = self
      .oracle
      .resolve_manifest_path(&base_dir, &format!("{name}/{MANIFEST_FILE}"))
    else {
      log::debug!("{from} requires {specifier}, which is not installed");
      return Vec::new();
    };
    let package_dir = manifest_path
      .strip_suffix(MANIFEST_FILE)
      .unwrap_or(manifest_path.as_str())
      .trim_end_matches('/');

    let subpath = &specifier[name.len()..];
    if !subpath.is_empty() {
      let target = format!("{}{subpath}", self.tree.relative(package_dir));
      return self.find_file(&target).into_iter().collect();
    }

    let Some(manifest) = self.tree.manifest(&manifest_path) else {
      return Vec::new();
    };
    self
      .oracle
      .resolve_entry_files(package_dir, manifest)
      .iter()
      .filter_map(|entry| self.find_file(self.tree.relative(entry)))
      .collect()
  }

  /// First of `path`, `path.js`, `path.json`, `path/index.js` and `path/index.json` that is
  /// available.
  fn find_file(&self, path: &str) -> Option<String> {
    let path = path.trim_end_matches('/');
    RESOLVED_SUFFIXES
      .iter()
      .map(|suffix| format!("{path}{suffix}"))
      .find(|candidate| self.available.contains_key(candidate))
  }

  fn glob(&self, dir: &str) -> Vec<String> {
    let prefix = format!("{}/", dir.trim_end_matches('/'));
    self
      .available
      .range(prefix.clone()..)
      .take_while(|(path, _)| path.starts_with(&prefix))
      .filter(|(path, _)| GLOBBED_EXTENSIONS.iter().any(|ext| path.ends_with(ext)))
      .map(|(path, _)| path.clone())
      .collect()
  }
}

fn is_relative(specifier: &str) -> bool {
  matches!(specifier, "." | "..") || specifier.starts_with("./") || specifier.starts_with("../")
}

fn parent_dir(path: &str) -> &str {
  match path.rfind('/') {
    Some(index) => &path[..index],
    None => "",
  }
}

/// Join `relative` onto `dir`, folding `.` and `..` segments. Never climbs above `/`.
fn join_path(dir: &str, relative: &str) -> String {
  let mut segments: Vec<&str> = dir.split('/').filter(|segment| !segment.is_empty()).collect();
  for segment in relative.split('/') {
    match segment {
      "" | "." => {}
      ".." => {
        segments.pop();
      }
      other => segments.push(other),
    }
  }
  format!("/{}", segments.join("/"))
}
