//! Per-key conflict decisions and unification.

use std::collections::{BTreeMap, BTreeSet};

use crate::models::{BundleManifest, ContentMap, DependencyRecord, DependencyTable};
use crate::versions::{entries_equal, range_satisfied_by, ranges_intersect, version_gt};

use super::paths::{owned_paths, owner_keys};
use super::{MergeError, MergeOptions, RootPrecedence};

/// How a key of the current item must be treated before it can be combined.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum Decision {
  /// The key can be combined with the accumulator as is.
  Keep,
  /// The key must be renamed to `name/resolved`.
  Alias,
  /// The transient record is served by the requested root at this version.
  UseRoot(String),
}

/// Whether two differently resolved records may collapse into one.
pub(crate) fn unifiable(existing: &DependencyRecord, incoming: &DependencyRecord) -> bool {
  ranges_intersect(&existing.semver_range, &incoming.semver_range)
    && entries_equal(&existing.entries, &incoming.entries)
}

/// Decide what `key` needs given the requested roots and what has been accumulated so far.
pub(crate) fn decide(
  key: &str,
  record: &DependencyRecord,
  accumulated: &DependencyTable,
  roots: &BTreeMap<String, String>,
  item_roots: &BTreeSet<String>,
  options: &MergeOptions,
) -> Decision {
  if let Some(root_version) = roots.get(key) {
    let is_self = item_roots.contains(key) || record.parents.contains(key);
    if !is_self && *root_version != record.resolved_version {
      return match options.root_precedence {
        RootPrecedence::Always => Decision::Alias,
        RootPrecedence::WhenUnsatisfied
          if range_satisfied_by(&record.semver_range, root_version) =>
        {
          Decision::UseRoot(root_version.clone())
        }
        RootPrecedence::WhenUnsatisfied => Decision::Alias,
      };
    }
  }

  match accumulated.get(key) {
    Some(existing)
      if existing.resolved_version != record.resolved_version && !unifiable(existing, record) =>
    {
      Decision::Alias
    }
    _ => Decision::Keep,
  }
}

/// Combine a settled key of `item` into `accumulated`.
pub(crate) fn combine(
  accumulated: &mut BundleManifest,
  item: &mut BundleManifest,
  key: &str,
  item_roots: &BTreeSet<String>,
  roots: &BTreeMap<String, String>,
) -> Result<(), MergeError> {
  let Some(record) = item.dependency_dependencies.get_mut(key) else {
    return Ok(());
  };
  if record.parent_root_dependencies.is_empty() {
    record.parent_root_dependencies = item_roots.clone();
  }
  let incoming = record.clone();

  let existing = match accumulated.dependency_dependencies.get_mut(key) {
    Some(existing) => existing,
    None => {
      accumulated
        .dependency_dependencies
        .insert(key.to_string(), incoming);
      return Ok(());
    }
  };

  if existing.resolved_version == incoming.resolved_version {
    existing.parents.extend(incoming.parents);
    existing.entries.extend(incoming.entries);
    existing
      .parent_root_dependencies
      .extend(incoming.parent_root_dependencies);
    return Ok(());
  }

  if !unifiable(existing, &incoming) {
    return Err(MergeError::KeyConflict {
      key: key.to_string(),
      existing: existing.resolved_version.clone(),
      incoming: incoming.resolved_version,
    });
  }

  let mut parents = existing.parents.clone();
  parents.extend(incoming.parents.iter().cloned());
  let mut root_dependencies = existing.parent_root_dependencies.clone();
  root_dependencies.extend(incoming.parent_root_dependencies.iter().cloned());

  if version_gt(&incoming.resolved_version, &existing.resolved_version) {
    log::debug!(
      "unifying {key} at {} over {}",
      incoming.resolved_version,
      existing.resolved_version
    );
    *existing = DependencyRecord {
      parents,
      parent_root_dependencies: root_dependencies,
      ..incoming
    };
    let keys = owner_keys(accumulated);
    migrate(
      &accumulated.dependency_dependencies,
      &mut accumulated.contents,
      &keys,
      &item.contents,
      &owner_keys(item),
      key,
      roots,
    );
  } else {
    log::debug!(
      "unifying {key} at {} over {}",
      existing.resolved_version,
      incoming.resolved_version
    );
    existing.parents = parents;
    existing.parent_root_dependencies = root_dependencies;
    let keys = owner_keys(item);
    migrate(
      &item.dependency_dependencies,
      &mut item.contents,
      &keys,
      &accumulated.contents,
      &owner_keys(accumulated),
      key,
      roots,
    );
  }
  Ok(())
}

/// Replace the losing side's files for `key`, and for everything `key` transitively pulls in,
/// with the winning side's files so that no stale version survives the unification.
fn migrate(
  loser_table: &DependencyTable,
  loser_contents: &mut ContentMap,
  loser_keys: &BTreeSet<String>,
  winner_contents: &ContentMap,
  winner_keys: &BTreeSet<String>,
  key: &str,
  roots: &BTreeMap<String, String>,
) {
  for dependent in transitive_dependents(loser_table, key) {
    if dependent != key && roots.contains_key(&dependent) {
      continue;
    }
    let replacement = owned_paths(winner_contents, &dependent, winner_keys);
    if dependent != key && replacement.is_empty() {
      continue;
    }

    for path in owned_paths(loser_contents, &dependent, loser_keys) {
      loser_contents.remove(&path);
    }
    for path in replacement {
      if let Some(entry) = winner_contents.get(&path) {
        loser_contents.insert(path, entry.clone());
      }
    }
  }
}

/// `key` followed by every key whose parents chain leads back to it.
fn transitive_dependents(table: &DependencyTable, key: &str) -> Vec<String> {
  let mut found = vec![key.to_string()];
  let mut seen = BTreeSet::from([key.to_string()]);
  let mut cursor = 0;
  while cursor < found.len() {
    let current = found[cursor].clone();
    for (candidate, record) in table {
      if record.parents.contains(&current) && seen.insert(candidate.clone()) {
        found.push(candidate.clone());
      }
    }
    cursor += 1;
  }
  found
}

/// Keys of `table` with every key listed after the keys it pulls in.
///
/// Combining a key can migrate files of its dependents, so the dependents must already carry
/// their final version by then. Cycles are broken at the first key reached in name order.
pub(crate) fn combine_order(table: &DependencyTable) -> Vec<String> {
  let mut children: BTreeMap<&str, Vec<&str>> = BTreeMap::new();
  for (key, record) in table {
    for parent in &record.parents {
      children.entry(parent.as_str()).or_default().push(key.as_str());
    }
  }

  let mut order = Vec::with_capacity(table.len());
  let mut visited: BTreeSet<&str> = BTreeSet::new();
  for key in table.keys() {
    if !visited.insert(key.as_str()) {
      continue;
    }
    let mut stack: Vec<(&str, usize)> = vec![(key.as_str(), 0)];
    while let Some((current, next_child)) = stack.pop() {
      let pending = children
        .get(current)
        .and_then(|list| list.get(next_child))
        .copied();
      match pending {
        Some(child) => {
          stack.push((current, next_child + 1));
          if visited.insert(child) {
            stack.push((child, 0));
          }
        }
        None => order.push(current.to_string()),
      }
    }
  }
  order
}

/// Redirect `key` of `item` onto the requested root at `root_version`.
///
/// The item's files for `key` are dropped, and so is everything only `key` pulled in: those
/// records, their files and their alias tables.
pub(crate) fn release_to_root(
  item: &mut BundleManifest,
  key: &str,
  root_version: String,
  roots: &BTreeMap<String, String>,
) {
  let table = &item.dependency_dependencies;
  let mut orphans: BTreeSet<String> = transitive_dependents(table, key)
    .into_iter()
    .filter(|dependent| dependent != key && !roots.contains_key(dependent))
    .collect();
  loop {
    let kept: Vec<String> = orphans
      .iter()
      .filter(|dependent| {
        table[dependent.as_str()]
          .parents
          .iter()
          .any(|parent| parent != key && !orphans.contains(parent))
      })
      .cloned()
      .collect();
    if kept.is_empty() {
      break;
    }
    for dependent in kept {
      orphans.remove(&dependent);
    }
  }

  let keys = owner_keys(item);
  let mut dropped = owned_paths(&item.contents, key, &keys);
  for orphan in &orphans {
    dropped.extend(owned_paths(&item.contents, orphan, &keys));
  }
  for path in dropped {
    item.contents.remove(&path);
  }

  for orphan in &orphans {
    log::debug!("dropping {orphan}, only needed by the replaced {key}");
    item.dependency_dependencies.remove(orphan);
    item.dependency_aliases.remove(orphan);
  }
  item.dependency_aliases.remove(key);
  for aliases in item.dependency_aliases.values_mut() {
    aliases.retain(|_, target| !orphans.contains(target));
  }
  item.dependency_aliases.retain(|_, aliases| !aliases.is_empty());

  if let Some(record) = item.dependency_dependencies.get_mut(key) {
    record.resolved_version = root_version;
  }
}
