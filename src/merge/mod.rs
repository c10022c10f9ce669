//! Cross-package merge of independently walked bundles.
//!
//! Contributors are folded one at a time into an accumulator. Each contributor first reaches a
//! fixed point in which none of its keys needs renaming: a key that would shadow a requested root
//! at another version, or that conflicts with an accumulated record it cannot unify with, is
//! renamed to `name/version` and the pending keys are recomputed. Only then are its records
//! combined with the accumulator, dependents before the keys that pull them in, and its files and
//! aliases folded in.

mod conflicts;
mod paths;

use std::collections::{BTreeMap, BTreeSet};

use serde::{Deserialize, Serialize};

use crate::models::{BundleManifest, PackageBundle};

use conflicts::{Decision, combine, combine_order, decide, release_to_root};
use paths::rename_key;

/// How a transient reference to a requested top-level package is treated when versions differ.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub enum RootPrecedence {
  /// Any version mismatch aliases the transient reference.
  #[default]
  Always,
  /// Alias only when the root's version does not satisfy the transient range.
  WhenUnsatisfied,
}

/// Tunables for [`merge`].
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MergeOptions {
  /// Policy applied when a transient key names a requested root.
  pub root_precedence: RootPrecedence,
}

/// Errors that make a merged bundle unsafe to cache.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MergeError {
  /// Two records with different versions claim the same dependency key.
  KeyConflict {
    /// Contested dependency key.
    key: String,
    /// Version already held by the key.
    existing: String,
    /// Version that tried to claim it.
    incoming: String,
  },
}

impl std::fmt::Display for MergeError {
  fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    match self {
      Self::KeyConflict {
        key,
        existing,
        incoming,
      } => write!(
        f,
        "dependency key {key} is claimed by both {existing} and {incoming}"
      ),
    }
  }
}

impl std::error::Error for MergeError {}

/// Merge packaged dependencies into one bundle, sorting them by name first.
pub fn merge_packages(
  bundles: Vec<PackageBundle>,
  options: &MergeOptions,
) -> Result<BundleManifest, MergeError> {
  merge(bundles.into_iter().map(BundleManifest::from).collect(), options)
}

/// Merge contributors into one bundle.
///
/// Contributors are sorted by their requested packages before folding, so the result depends
/// only on the set of contributors.
pub fn merge(
  mut contributors: Vec<BundleManifest>,
  options: &MergeOptions,
) -> Result<BundleManifest, MergeError> {
  contributors.sort_by(|a, b| a.sort_key().cmp(&b.sort_key()));
  merge_in_order(contributors, options)
}

/// Fold contributors in the order given.
///
/// Which of two incompatible versions keeps the bare key depends on this order; use [`merge`]
/// for cache-stable output.
pub fn merge_in_order(
  contributors: Vec<BundleManifest>,
  options: &MergeOptions,
) -> Result<BundleManifest, MergeError> {
  let roots: BTreeMap<String, String> = contributors
    .iter()
    .flat_map(|contributor| contributor.dependencies.iter())
    .map(|package| (package.name.clone(), package.version.clone()))
    .collect();

  let mut accumulated = BundleManifest::default();
  for mut item in contributors {
    let item_roots = item.root_names();
    settle(&accumulated, &mut item, &roots, &item_roots, options)?;

    for key in combine_order(&item.dependency_dependencies) {
      combine(&mut accumulated, &mut item, &key, &item_roots, &roots)?;
    }
    fold(&mut accumulated, item);
  }

  Ok(accumulated)
}

/// Rename keys of `item` until none of them needs renaming.
fn settle(
  accumulated: &BundleManifest,
  item: &mut BundleManifest,
  roots: &BTreeMap<String, String>,
  item_roots: &BTreeSet<String>,
  options: &MergeOptions,
) -> Result<(), MergeError> {
  let mut settled: BTreeSet<String> = BTreeSet::new();
  loop {
    let pending = item
      .dependency_dependencies
      .iter()
      .find(|(key, _)| !settled.contains(*key))
      .map(|(key, record)| {
        let decision = decide(
          key,
          record,
          &accumulated.dependency_dependencies,
          roots,
          item_roots,
          options,
        );
        (key.clone(), record.resolved_version.clone(), decision)
      });

    let Some((key, resolved, decision)) = pending else {
      return Ok(());
    };

    match decision {
      Decision::Keep => {
        settled.insert(key);
      }
      Decision::Alias => {
        let aliased = format!("{key}/{resolved}");
        if item.dependency_dependencies.contains_key(&aliased) && settled.contains(&aliased) {
          settled.remove(&aliased);
        }
        if let Some(existing) = accumulated
          .dependency_dependencies
          .get(&aliased)
          .filter(|existing| existing.resolved_version != resolved)
        {
          return Err(MergeError::KeyConflict {
            existing: existing.resolved_version.clone(),
            key: aliased,
            incoming: resolved,
          });
        }
        log::debug!("aliasing {key} to {aliased}");
        rename_key(item, &key, &aliased)?;
      }
      Decision::UseRoot(root_version) => {
        log::debug!("{key}@{resolved} is served by requested {key}@{root_version}");
        release_to_root(item, &key, root_version, roots);
        settled.insert(key);
      }
    }
  }
}

fn fold(accumulated: &mut BundleManifest, item: BundleManifest) {
  accumulated.contents.extend(item.contents);
  for (consumer, aliases) in item.dependency_aliases {
    accumulated
      .dependency_aliases
      .entry(consumer)
      .or_default()
      .extend(aliases);
  }
  accumulated.peer_dependencies.extend(item.peer_dependencies);
  accumulated.dependencies.extend(item.dependencies);
}
