//! Key ownership of virtual paths and renaming a key through a bundle.

use std::collections::BTreeSet;

use crate::models::{BundleManifest, ContentMap, key_prefix};

use super::MergeError;

/// Keys that can own files in `bundle`: record keys plus requested package names.
pub(crate) fn owner_keys(bundle: &BundleManifest) -> BTreeSet<String> {
  bundle
    .dependency_dependencies
    .keys()
    .cloned()
    .chain(bundle.dependencies.iter().map(|package| package.name.clone()))
    .collect()
}

/// The longest key whose `/node_modules/<key>/` prefix contains `path`.
///
/// `/node_modules/fbjs/11.0.0/index.js` belongs to `fbjs/11.0.0`, not `fbjs`, when both keys exist.
pub(crate) fn owning_key<'k>(path: &str, keys: &'k BTreeSet<String>) -> Option<&'k str> {
  keys
    .iter()
    .filter(|key| {
      path
        .strip_prefix(key_prefix(key).as_str())
        .is_some_and(|rest| rest.starts_with('/'))
    })
    .max_by_key(|key| key.len())
    .map(String::as_str)
}

/// Paths in `contents` owned by `key`.
pub(crate) fn owned_paths(contents: &ContentMap, key: &str, keys: &BTreeSet<String>) -> Vec<String> {
  let prefix = format!("{}/", key_prefix(key));
  contents
    .range(prefix.clone()..)
    .take_while(|(path, _)| path.starts_with(&prefix))
    .filter(|(path, _)| owning_key(path, keys) == Some(key))
    .map(|(path, _)| path.clone())
    .collect()
}

/// Rename dependency key `from` to `to` throughout `bundle`.
///
/// Moves owned files, re-keys the record (folding it into an existing record at `to`), rewrites
/// every `parents` set and alias table reference, and points each parent's alias for `from` at `to`.
pub(crate) fn rename_key(bundle: &mut BundleManifest, from: &str, to: &str) -> Result<(), MergeError> {
  let keys = owner_keys(bundle);
  let prefix = key_prefix(from);
  let target = key_prefix(to);
  for path in owned_paths(&bundle.contents, from, &keys) {
    if let Some(entry) = bundle.contents.remove(&path) {
      let rest = &path[prefix.len()..];
      bundle.contents.insert(format!("{target}{rest}"), entry);
    }
  }

  let Some(record) = bundle.dependency_dependencies.remove(from) else {
    return Ok(());
  };
  let parents = record.parents.clone();
  match bundle.dependency_dependencies.get_mut(to) {
    Some(existing) if existing.resolved_version != record.resolved_version => {
      return Err(MergeError::KeyConflict {
        key: to.to_string(),
        existing: existing.resolved_version.clone(),
        incoming: record.resolved_version,
      });
    }
    Some(existing) => {
      existing.parents.extend(record.parents);
      existing.entries.extend(record.entries);
      existing
        .parent_root_dependencies
        .extend(record.parent_root_dependencies);
    }
    None => {
      bundle.dependency_dependencies.insert(to.to_string(), record);
    }
  }

  for record in bundle.dependency_dependencies.values_mut() {
    if record.parents.remove(from) {
      record.parents.insert(to.to_string());
    }
  }

  if let Some(aliases) = bundle.dependency_aliases.remove(from) {
    bundle
      .dependency_aliases
      .entry(to.to_string())
      .or_default()
      .extend(aliases);
  }
  for aliases in bundle.dependency_aliases.values_mut() {
    for value in aliases.values_mut() {
      if value == from {
        *value = to.to_string();
      }
    }
  }

  for parent in parents {
    let parent = if parent == from { to.to_string() } else { parent };
    bundle
      .dependency_aliases
      .entry(parent)
      .or_default()
      .insert(from.to_string(), to.to_string());
  }

  Ok(())
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::models::{ContentEntry, DependencyRecord, RequestedPackage};
  use std::collections::BTreeMap;

  fn record(resolved: &str, parents: &[&str]) -> DependencyRecord {
    DependencyRecord {
      semver_range: format!("^{resolved}"),
      resolved_version: resolved.into(),
      parents: parents.iter().map(|p| p.to_string()).collect(),
      ..DependencyRecord::default()
    }
  }

  fn bundle() -> BundleManifest {
    BundleManifest {
      contents: ContentMap::from([
        ("/node_modules/app/index.js".to_string(), ContentEntry::new("app")),
        ("/node_modules/fbjs/lib/index.js".to_string(), ContentEntry::new("12")),
        (
          "/node_modules/fbjs/11.0.0/lib/index.js".to_string(),
          ContentEntry::new("11"),
        ),
        ("/node_modules/fbjs-extra/index.js".to_string(), ContentEntry::new("x")),
      ]),
      dependencies: vec![RequestedPackage::new("app", "1.0.0")],
      dependency_dependencies: BTreeMap::from([
        ("fbjs".to_string(), record("12.0.0", &["app"])),
        ("fbjs/11.0.0".to_string(), record("11.0.0", &["legacy"])),
        ("fbjs-extra".to_string(), record("1.0.0", &["fbjs"])),
        ("legacy".to_string(), record("1.0.0", &["app"])),
      ]),
      dependency_aliases: BTreeMap::from([(
        "legacy".to_string(),
        BTreeMap::from([("fbjs".to_string(), "fbjs/11.0.0".to_string())]),
      )]),
      ..BundleManifest::default()
    }
  }

  #[test]
  fn longest_key_owns_path() {
    let keys = owner_keys(&bundle());
    assert_eq!(
      owning_key("/node_modules/fbjs/11.0.0/lib/index.js", &keys),
      Some("fbjs/11.0.0")
    );
    assert_eq!(owning_key("/node_modules/fbjs/lib/index.js", &keys), Some("fbjs"));
    assert_eq!(owning_key("/node_modules/fbjs-extra/index.js", &keys), Some("fbjs-extra"));
    assert_eq!(owning_key("/node_modules/unknown/index.js", &keys), None);
  }

  #[test]
  fn rename_moves_only_owned_files_and_rewrites_references() {
    let mut bundle = bundle();
    rename_key(&mut bundle, "fbjs", "fbjs/12.0.0").unwrap();

    assert!(bundle.contents.contains_key("/node_modules/fbjs/12.0.0/lib/index.js"));
    assert!(bundle.contents.contains_key("/node_modules/fbjs/11.0.0/lib/index.js"));
    assert!(bundle.contents.contains_key("/node_modules/fbjs-extra/index.js"));
    assert!(!bundle.contents.contains_key("/node_modules/fbjs/lib/index.js"));

    assert!(!bundle.dependency_dependencies.contains_key("fbjs"));
    assert_eq!(bundle.dependency_dependencies["fbjs/12.0.0"].resolved_version, "12.0.0");
    assert!(
      bundle.dependency_dependencies["fbjs-extra"]
        .parents
        .contains("fbjs/12.0.0")
    );
    assert_eq!(bundle.dependency_aliases["app"]["fbjs"], "fbjs/12.0.0");
    assert_eq!(bundle.dependency_aliases["legacy"]["fbjs"], "fbjs/11.0.0");
  }

  #[test]
  fn rename_into_conflicting_key_is_fatal() {
    let mut bundle = bundle();
    bundle
      .dependency_dependencies
      .insert("fbjs/12.0.0".into(), record("12.0.5", &["other"]));

    let err = rename_key(&mut bundle, "fbjs", "fbjs/12.0.0").unwrap_err();
    assert!(matches!(err, MergeError::KeyConflict { .. }));
  }
}
