//! Semver comparisons that fail toward aliasing.
//!
//! Every helper here answers `false` when either side cannot be parsed as npm semver. A `false`
//! keeps two versions apart, which is always safe; a spurious `true` would collapse them.

use std::collections::BTreeSet;

use deno_semver::{Version, VersionReq};

/// Whether two npm ranges have at least one version in common.
pub fn ranges_intersect(left: &str, right: &str) -> bool {
  match (VersionReq::parse_from_npm(left), VersionReq::parse_from_npm(right)) {
    (Ok(left), Ok(right)) => left.intersects(&right),
    _ => false,
  }
}

/// Whether `left` is strictly greater than `right`.
pub fn version_gt(left: &str, right: &str) -> bool {
  match (Version::parse_from_npm(left), Version::parse_from_npm(right)) {
    (Ok(left), Ok(right)) => left > right,
    _ => false,
  }
}

/// Whether the installed `version` satisfies `range`.
pub fn range_satisfied_by(range: &str, version: &str) -> bool {
  match (VersionReq::parse_from_npm(range), Version::parse_from_npm(version)) {
    (Ok(range), Ok(version)) => range.matches(&version),
    _ => false,
  }
}

/// Strict element-wise equality of two entry sets.
pub fn entries_equal(left: &BTreeSet<String>, right: &BTreeSet<String>) -> bool {
  left.len() == right.len() && left.iter().zip(right).all(|(a, b)| a == b)
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn disjoint_majors_do_not_intersect() {
    assert!(!ranges_intersect("^12.0.0", "^13.0.0"));
    assert!(ranges_intersect("^12.0.0", "^12.x"));
    assert!(ranges_intersect("^12.0.0", "^12.2.0"));
    assert!(!ranges_intersect("^12.0.0", "^11.2.0"));
  }

  #[test]
  fn malformed_input_is_false() {
    assert!(!ranges_intersect("%%%", "^1.0.0"));
    assert!(!version_gt("banana", "1.0.0"));
    assert!(!version_gt("1.0.0", "banana"));
    assert!(!range_satisfied_by("^1.0.0", "nope"));
  }

  #[test]
  fn compares_versions_numerically() {
    assert!(version_gt("12.0.10", "12.0.9"));
    assert!(!version_gt("12.0.1", "12.0.1"));
    assert!(range_satisfied_by("^1.0.0", "1.4.2"));
    assert!(!range_satisfied_by("^1.0.0", "2.0.0"));
  }

  #[test]
  fn entries_compare_as_sets() {
    let left: BTreeSet<String> = ["fbjs/lib/b", "fbjs"].iter().map(|s| s.to_string()).collect();
    let right: BTreeSet<String> = ["fbjs", "fbjs/lib/b"].iter().map(|s| s.to_string()).collect();
    let prefix: BTreeSet<String> = ["fbjs"].iter().map(|s| s.to_string()).collect();

    assert!(entries_equal(&left, &right));
    assert!(!entries_equal(&left, &prefix));
    assert!(entries_equal(&BTreeSet::new(), &BTreeSet::new()));
  }
}
