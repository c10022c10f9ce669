//! Depth-first walk of one top-level package's declared dependencies.

use std::collections::BTreeSet;

use crate::installed::InstalledTree;
use crate::models::{ContentMap, DependencyRecord, WalkOutput, key_prefix};
use crate::oracle::ResolutionOracle;
use crate::requires::RequireUsage;

const MANIFEST_FILE: &str = "package.json";

/// Build the dependency table of `top_package` as installed in `tree`.
///
/// Nested installs are keyed `name/version` and their files in `contents` are relocated to
/// `/node_modules/<name>/<version>/...`. Dependencies that cannot be resolved are skipped.
pub fn walk<O: ResolutionOracle>(
  top_package: &str,
  tree: &InstalledTree,
  oracle: &O,
  usage: &RequireUsage,
  contents: &mut ContentMap,
) -> WalkOutput {
  let mut walker = Walker {
    tree,
    oracle,
    usage,
    contents,
    output: WalkOutput::default(),
  };
  let base_dir = tree.package_dir(top_package);
  walker.visit(top_package, top_package, &base_dir);
  walker.output
}

struct Walker<'a, O> {
  tree: &'a InstalledTree,
  oracle: &'a O,
  usage: &'a RequireUsage,
  contents: &'a mut ContentMap,
  output: WalkOutput,
}

impl<O: ResolutionOracle> Walker<'_, O> {
  /// `key` is the dependency key of the package, `name` its real name on disk.
  fn visit(&mut self, key: &str, name: &str, base_dir: &str) {
    let (tree, oracle) = (self.tree, self.oracle);
    let request = format!("{name}/{MANIFEST_FILE}");
    let Some(manifest) = oracle
      .resolve_manifest_path(base_dir, &request)
      .and_then(|path| tree.manifest(&path))
    else {
      log::debug!("skipping unresolvable package {name} from {base_dir}");
      return;
    };

    for (peer, range) in &manifest.peer_dependencies {
      self
        .output
        .peer_dependencies
        .insert(peer.clone(), range.clone());
    }

    for (dependency, range) in &manifest.dependencies {
      let request = format!("{dependency}/{MANIFEST_FILE}");
      let Some((manifest_path, installed)) = oracle
        .resolve_manifest_path(base_dir, &request)
        .and_then(|path| tree.manifest(&path).map(|manifest| (path, manifest)))
      else {
        log::debug!("{key} declares {dependency}@{range} but it is not installed");
        continue;
      };

      let resolved = installed.version.clone();
      let dependency_key = if tree.is_root_install(&manifest_path) {
        dependency.clone()
      } else {
        let aliased = format!("{dependency}/{resolved}");
        let install_dir = tree
          .relative(&manifest_path)
          .trim_end_matches(MANIFEST_FILE)
          .trim_end_matches('/')
          .to_string();
        relocate(self.contents, &install_dir, &key_prefix(&aliased));
        self
          .output
          .alias_table
          .entry(key.to_string())
          .or_default()
          .insert(dependency.clone(), aliased.clone());
        aliased
      };

      if let Some(existing) = self.output.dependency_table.get_mut(&dependency_key) {
        existing.parents.insert(key.to_string());
        continue;
      }

      self
        .output
        .dependency_table
        .insert(dependency_key.clone(), DependencyRecord {
          semver_range: range.clone(),
          resolved_version: resolved,
          parents: BTreeSet::from([key.to_string()]),
          entries: self.usage.entries_for(dependency),
          parent_root_dependencies: BTreeSet::new(),
        });

      let next_base = parent_dir(&manifest_path);
      self.visit(&dependency_key, dependency, &next_base);
    }
  }
}

/// Move every file under `from_dir` to the same relative location under `to_dir`.
fn relocate(contents: &mut ContentMap, from_dir: &str, to_dir: &str) {
  let from = format!("{from_dir}/");
  let moved: Vec<String> = contents
    .range(from.clone()..)
    .take_while(|(path, _)| path.starts_with(&from))
    .map(|(path, _)| path.clone())
    .collect();

  for path in moved {
    if let Some(entry) = contents.remove(&path) {
      let relative = &path[from.len()..];
      contents.insert(format!("{to_dir}/{relative}"), entry);
    }
  }
}

fn parent_dir(path: &str) -> String {
  match path.rfind('/') {
    Some(index) => path[..index].to_string(),
    None => String::new(),
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::models::{ContentEntry, PackageManifest};
  use crate::oracle::NodeModulesResolver;
  use std::collections::BTreeMap;

  fn manifest(name: &str, version: &str, deps: &[(&str, &str)]) -> PackageManifest {
    PackageManifest {
      name: name.into(),
      version: version.into(),
      dependencies: deps
        .iter()
        .map(|(n, r)| (n.to_string(), r.to_string()))
        .collect(),
      ..PackageManifest::default()
    }
  }

  fn run(tree: &InstalledTree, top: &str, usage: &RequireUsage, contents: &mut ContentMap) -> WalkOutput {
    walk(top, tree, &NodeModulesResolver::new(tree), usage, contents)
  }

  #[test]
  fn records_root_dependencies_with_entries() {
    let tree = InstalledTree::new("/tmp/r")
      .with_package("node_modules/react", manifest("react", "16.0.0", &[
        ("fbjs", "^0.8.16"),
        ("object-assign", "^4.1.1"),
      ]))
      .with_package("node_modules/fbjs", manifest("fbjs", "0.8.17", &[(
        "object-assign",
        "^4.1.0",
      )]))
      .with_package("node_modules/object-assign", manifest("object-assign", "4.1.1", &[]));
    let usage = RequireUsage::from_specifiers(["fbjs/lib/invariant", "fbjs/lib/emptyFunction"]);

    let output = run(&tree, "react", &usage, &mut ContentMap::new());

    let fbjs = &output.dependency_table["fbjs"];
    assert_eq!(fbjs.resolved_version, "0.8.17");
    assert_eq!(fbjs.semver_range, "^0.8.16");
    assert_eq!(fbjs.parents, BTreeSet::from(["react".to_string()]));
    assert_eq!(
      fbjs.entries.iter().collect::<Vec<_>>(),
      vec!["fbjs/lib/emptyFunction", "fbjs/lib/invariant"]
    );

    let assign = &output.dependency_table["object-assign"];
    assert_eq!(
      assign.parents,
      BTreeSet::from(["fbjs".to_string(), "react".to_string()])
    );
    assert!(assign.entries.is_empty());
    assert!(output.alias_table.is_empty());
  }

  #[test]
  fn aliases_nested_installs_and_relocates_files() {
    let tree = InstalledTree::new("/tmp/r")
      .with_package("node_modules/a", manifest("a", "1.0.0", &[("b", "^2.0.0")]))
      .with_package("node_modules/b", manifest("b", "1.0.0", &[]))
      .with_package("node_modules/a/node_modules/b", manifest("b", "2.1.0", &[]));
    let mut contents = ContentMap::from([
      ("/node_modules/a/index.js".to_string(), ContentEntry::new("a")),
      (
        "/node_modules/a/node_modules/b/index.js".to_string(),
        ContentEntry::new("b2"),
      ),
      (
        "/node_modules/a/node_modules/b/lib/x.js".to_string(),
        ContentEntry::new("b2x"),
      ),
      ("/node_modules/b/index.js".to_string(), ContentEntry::new("b1")),
    ]);

    let output = run(&tree, "a", &RequireUsage::default(), &mut contents);

    assert!(output.dependency_table.contains_key("b/2.1.0"));
    assert!(!output.dependency_table.contains_key("b"));
    assert_eq!(
      output.alias_table["a"],
      BTreeMap::from([("b".to_string(), "b/2.1.0".to_string())])
    );
    assert_eq!(contents["/node_modules/b/2.1.0/index.js"].content, "b2");
    assert_eq!(contents["/node_modules/b/2.1.0/lib/x.js"].content, "b2x");
    assert_eq!(contents["/node_modules/b/index.js"].content, "b1");
    assert!(!contents.contains_key("/node_modules/a/node_modules/b/index.js"));
  }

  #[test]
  fn terminates_on_cycles_and_diamonds() {
    let tree = InstalledTree::new("/tmp/r")
      .with_package("node_modules/a", manifest("a", "1.0.0", &[("b", "^1.0.0"), ("c", "^1.0.0")]))
      .with_package("node_modules/b", manifest("b", "1.0.0", &[("d", "^1.0.0")]))
      .with_package("node_modules/c", manifest("c", "1.0.0", &[("d", "^1.0.0")]))
      .with_package("node_modules/d", manifest("d", "1.0.0", &[("a", "^1.0.0")]));

    let output = run(&tree, "a", &RequireUsage::default(), &mut ContentMap::new());

    assert_eq!(
      output.dependency_table["d"].parents,
      BTreeSet::from(["b".to_string(), "c".to_string()])
    );
    assert_eq!(
      output.dependency_table["a"].parents,
      BTreeSet::from(["d".to_string()])
    );
    assert_eq!(output.dependency_table.len(), 4);
  }

  #[test]
  fn skips_unresolvable_dependencies() {
    let tree = InstalledTree::new("/tmp/r").with_package(
      "node_modules/a",
      manifest("a", "1.0.0", &[("fsevents", "^2.0.0"), ("b", "^1.0.0")]),
    )
    .with_package("node_modules/b", manifest("b", "1.0.0", &[]));

    let output = run(&tree, "a", &RequireUsage::default(), &mut ContentMap::new());

    assert!(!output.dependency_table.contains_key("fsevents"));
    assert!(output.dependency_table.contains_key("b"));
  }

  #[test]
  fn missing_top_package_yields_empty_tables() {
    let tree = InstalledTree::new("/tmp/r");
    let output = run(&tree, "ghost", &RequireUsage::default(), &mut ContentMap::new());
    assert_eq!(output, WalkOutput::default());
  }

  #[test]
  fn unions_peer_dependencies_last_writer_wins() {
    let mut top = manifest("a", "1.0.0", &[("b", "^1.0.0")]);
    top.peer_dependencies = BTreeMap::from([("react".to_string(), "^15.0.0".to_string())]);
    let mut child = manifest("b", "1.0.0", &[]);
    child.peer_dependencies = BTreeMap::from([
      ("react".to_string(), "^16.0.0".to_string()),
      ("react-dom".to_string(), "^16.0.0".to_string()),
    ]);
    let tree = InstalledTree::new("/tmp/r")
      .with_package("node_modules/a", top)
      .with_package("node_modules/b", child);

    let output = run(&tree, "a", &RequireUsage::default(), &mut ContentMap::new());

    assert_eq!(output.peer_dependencies["react"], "^16.0.0");
    assert_eq!(output.peer_dependencies["react-dom"], "^16.0.0");
  }
}
