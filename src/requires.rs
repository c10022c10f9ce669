//! Require extraction and per-dependency usage tracking.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::OnceLock;

use regex::Regex;

use crate::models::{ContentEntry, ContentMap};
use crate::oracle::{ExtractedSpecifiers, SpecifierExtractor};

/// Prefix marking a dynamically built require target that names a directory.
pub const GLOB_PREFIX: &str = "glob:";

const SCANNED_EXTENSIONS: [&str; 3] = [".js", ".mjs", ".cjs"];

struct ScannerPatterns {
  require: Regex,
  concat_require: Regex,
  static_from: Regex,
  bare_import: Regex,
  dynamic_import: Regex,
  module_syntax: Regex,
}

fn patterns() -> &'static ScannerPatterns {
  static PATTERNS: OnceLock<ScannerPatterns> = OnceLock::new();
  PATTERNS.get_or_init(|| ScannerPatterns {
    require: Regex::new(
      r#"\brequire(?:\.resolve)?\(\s*(?:'([^'\n]*)'|"([^"\n]*)"|`([^`$]*)`)\s*\)"#,
    )
    .expect("invalid require regex"),
    concat_require: Regex::new(r#"\brequire\(\s*(?:'([^'\n]*)'|"([^"\n]*)")\s*\+"#)
      .expect("invalid concatenated require regex"),
    static_from: Regex::new(r#"(?m)^\s*(?:import|export)\b[^'";]*?\bfrom\s*['"]([^'"\n]+)['"]"#)
      .expect("invalid import/export regex"),
    bare_import: Regex::new(r#"(?m)^\s*import\s*['"]([^'"\n]+)['"]"#)
      .expect("invalid bare import regex"),
    dynamic_import: Regex::new(
      r#"\bimport\(\s*(?:'([^'\n]*)'|"([^"\n]*)"|`([^`$]*)`)\s*\)"#,
    )
    .expect("invalid dynamic import regex"),
    module_syntax: Regex::new(r#"(?m)^\s*(?:import|export)[\s{*]|\bimport\("#)
      .expect("invalid module syntax regex"),
  })
}

/// Regex-based specifier extraction for CommonJS and ES module sources.
///
/// Only literal specifiers are reported. A require whose argument starts with a string literal
/// and continues with `+` is reported as `glob:<dir>` when the literal is a relative path.
#[derive(Debug, Clone, Copy, Default)]
pub struct RequireScanner;

impl SpecifierExtractor for RequireScanner {
  fn extract_specifiers(&self, content: &str) -> ExtractedSpecifiers {
    let patterns = patterns();
    let mut found: Vec<(usize, String)> = Vec::new();

    for regex in [&patterns.require, &patterns.dynamic_import] {
      for caps in regex.captures_iter(content) {
        if let Some(value) = caps.get(1).or(caps.get(2)).or(caps.get(3)) {
          found.push((value.start(), value.as_str().to_string()));
        }
      }
    }

    for regex in [&patterns.static_from, &patterns.bare_import] {
      for caps in regex.captures_iter(content) {
        if let Some(value) = caps.get(1) {
          found.push((value.start(), value.as_str().to_string()));
        }
      }
    }

    for caps in patterns.concat_require.captures_iter(content) {
      if let Some(value) = caps.get(1).or(caps.get(2)) {
        if let Some(dir) = glob_directory(value.as_str()) {
          found.push((value.start(), format!("{GLOB_PREFIX}{dir}")));
        }
      }
    }

    found.sort_by_key(|(position, _)| *position);
    let mut seen = BTreeSet::new();
    let specifiers = found
      .into_iter()
      .map(|(_, specifier)| specifier)
      .filter(|specifier| !specifier.is_empty() && seen.insert(specifier.clone()))
      .collect();

    ExtractedSpecifiers {
      specifiers,
      is_module: patterns.module_syntax.is_match(content),
    }
  }
}

fn glob_directory(literal: &str) -> Option<&str> {
  if !literal.starts_with('.') {
    return None;
  }
  let end = literal.rfind('/')?;
  Some(&literal[..=end])
}

/// Whether files at `path` are scanned for specifiers.
pub fn is_script(path: &str) -> bool {
  SCANNED_EXTENSIONS.iter().any(|ext| path.ends_with(ext))
}

/// Fill `requires` and `isModule` of the file at `path` unless it is not a script or was
/// already analysed.
pub fn analyse_entry<E: SpecifierExtractor>(path: &str, entry: &mut ContentEntry, extractor: &E) {
  if entry.requires.is_some() || !is_script(path) {
    return;
  }
  let extracted = extractor.extract_specifiers(&entry.content);
  entry.requires = Some(extracted.specifiers);
  entry.is_module = Some(extracted.is_module);
}

/// Dependency name a bare specifier refers to, e.g. `@scope/pkg` for `@scope/pkg/lib/x`.
///
/// Relative, absolute and `glob:` specifiers have no dependency name.
pub fn dependency_name(specifier: &str) -> Option<&str> {
  if specifier.starts_with(GLOB_PREFIX) {
    return None;
  }

  let mut chars = specifier.chars();
  let first = chars.next()?;
  let is_word = |c: char| c.is_alphanumeric() || c == '_';
  let valid = is_word(first) || (first == '@' && chars.next().is_some_and(is_word));
  if !valid {
    return None;
  }

  let segments = if first == '@' { 2 } else { 1 };
  let end = specifier
    .match_indices('/')
    .nth(segments - 1)
    .map(|(index, _)| index)
    .unwrap_or(specifier.len());
  Some(&specifier[..end])
}

/// Deep specifiers observed per dependency name.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RequireUsage {
  by_dependency: BTreeMap<String, BTreeSet<String>>,
}

impl RequireUsage {
  /// Group raw specifiers by the dependency they refer to.
  pub fn from_specifiers<I, S>(specifiers: I) -> Self
  where
    I: IntoIterator<Item = S>,
    S: AsRef<str>,
  {
    let mut by_dependency: BTreeMap<String, BTreeSet<String>> = BTreeMap::new();
    for specifier in specifiers {
      let specifier = specifier.as_ref();
      if let Some(name) = dependency_name(specifier) {
        by_dependency
          .entry(name.to_string())
          .or_default()
          .insert(specifier.to_string());
      }
    }
    Self { by_dependency }
  }

  /// Collect the `requires` of every analysed file.
  pub fn from_contents(contents: &ContentMap) -> Self {
    Self::from_specifiers(
      contents
        .values()
        .filter_map(|entry| entry.requires.as_ref())
        .flatten(),
    )
  }

  /// Entries used from `name`; empty when nothing deep was observed.
  pub fn entries_for(&self, name: &str) -> BTreeSet<String> {
    self.by_dependency.get(name).cloned().unwrap_or_default()
  }
}
