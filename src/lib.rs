#![doc = include_str!("../README.md")]
#![warn(missing_docs)]
#![allow(clippy::module_inception)]

pub mod cache;
pub mod config;
pub mod crawl;
pub mod installed;
pub mod merge;
pub mod models;
pub mod oracle;
pub mod packager;
pub mod requires;
pub mod versions;
pub mod walker;

pub use cache::{BundleCache, BundleStore, DirectoryStore, ErrorCache, bundle_path, parse_combination};
pub use config::PackagerConfig;
pub use crawl::crawl;
pub use installed::InstalledTree;
pub use merge::{MergeError, MergeOptions, RootPrecedence, merge, merge_in_order, merge_packages};
pub use models::{BundleManifest, DependencyRecord, PackageBundle, RequestedPackage};
pub use oracle::{NodeModulesResolver, ResolutionOracle, SpecifierExtractor};
pub use packager::{PackageRequest, Packager};
pub use requires::RequireScanner;
pub use walker::walk;
