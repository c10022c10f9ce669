//! Command line front end for packaging installed npm dependencies.

use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result, bail};
use clap::{Parser, Subcommand};
use serde::Serialize;

use npm_packager::cache::{
  BundleCache, BundleStore, DirectoryStore, bundle_path, install_hash, package_path,
};
use npm_packager::models::{BundleManifest, ContentMap, PackageBundle, RequestedPackage};
use npm_packager::packager::{PackageRequest, Packager, read_install_files};
use npm_packager::{
  InstalledTree, NodeModulesResolver, PackagerConfig, RequireScanner, merge, parse_combination,
};

#[derive(Debug, Parser)]
#[command(name = "npm-packager", version, about)]
struct Cli {
  /// Directory holding `packager.config.json`.
  #[arg(long, global = true, default_value = ".")]
  config_dir: PathBuf,

  #[command(subcommand)]
  command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
  /// Package one top-level dependency out of an installed tree.
  Package {
    /// Directory containing `node_modules`.
    #[arg(long)]
    root: PathBuf,
    /// Name of the dependency to package.
    #[arg(long)]
    name: String,
    /// Requested version; defaults to the installed one.
    #[arg(long)]
    version: Option<String>,
    /// JSON content map to package instead of reading files from disk.
    #[arg(long)]
    contents: Option<PathBuf>,
    /// Write the bundle here instead of stdout.
    #[arg(long)]
    out: Option<PathBuf>,
  },
  /// Merge packaged dependencies or bundles into one bundle.
  Merge {
    /// Package or bundle JSON files.
    #[arg(required = true)]
    files: Vec<PathBuf>,
    /// Also save the result in the configured store.
    #[arg(long)]
    store: bool,
    /// Write the bundle here instead of stdout.
    #[arg(long)]
    out: Option<PathBuf>,
  },
  /// Package and merge combinations out of one installed tree, using the store as a cache.
  Bundle {
    /// Directory containing `node_modules`.
    #[arg(long)]
    root: PathBuf,
    /// Requests such as `react@16.0.0+react-dom@16.0.0`.
    #[arg(required = true)]
    combinations: Vec<String>,
  },
  /// Print store keys for a combination.
  Key {
    /// Request such as `react@16.0.0+@emotion/core@10.0.0`.
    combination: String,
  },
}

fn main() {
  init_logger();
  if let Err(err) = run(Cli::parse()) {
    log::error!("{err:#}");
    std::process::exit(1);
  }
}

fn init_logger() {
  env_logger::Builder::from_env(
    env_logger::Env::new()
      .filter_or("PACKAGER_LOG", "info")
      .write_style("PACKAGER_LOG_STYLE"),
  )
  .format_timestamp(None)
  .init();
}

fn run(cli: Cli) -> Result<()> {
  let config = PackagerConfig::discover(&cli.config_dir);

  match cli.command {
    Command::Package {
      root,
      name,
      version,
      contents,
      out,
    } => {
      let tree = load_tree(&root)?;
      let contents = match contents {
        Some(path) => read_json::<ContentMap>(&path)?,
        None => read_install_files(&root)?,
      };
      let packager = Packager::new(&tree, NodeModulesResolver::new(&tree), RequireScanner);
      let bundle = packager.package(PackageRequest {
        package: RequestedPackage::new(name, version.unwrap_or_default()),
        contents,
      });
      log::info!("store key {}", package_path(&bundle.dependency, &config));
      write_json(&bundle, out.as_deref())
    }
    Command::Merge { files, store, out } => {
      let contributors = files
        .iter()
        .map(|path| read_contributor(path))
        .collect::<Result<Vec<_>>>()?;
      let bundle = merge(contributors, &config.merge_options())?;

      if store {
        let key = bundle_path(&bundle.dependencies, &config);
        let store = DirectoryStore::new(config.store_root_path(&cli.config_dir));
        store
          .put_json(&key, &bundle)
          .with_context(|| format!("failed to store {key}"))?;
        log::info!("stored {}", store.path_of(&key).display());
      }
      write_json(&bundle, out.as_deref())
    }
    Command::Bundle { root, combinations } => {
      let tree = load_tree(&root)?;
      let contents = read_install_files(&root)?;
      let packager = Packager::new(&tree, NodeModulesResolver::new(&tree), RequireScanner);
      let store = DirectoryStore::new(config.store_root_path(&cli.config_dir));
      let options = config.merge_options();
      let mut cache = BundleCache::new(store, config.clone());

      let mut failures = 0;
      for combination in &combinations {
        let requested = parse_combination(combination)?;
        let packages = config.with_implicit_dependencies(&requested);
        let built = cache.get_or_build(&packages, || {
          let requests = packages
            .iter()
            .map(|package| PackageRequest {
              package: package.clone(),
              contents: contents.clone(),
            })
            .collect();
          Ok(packager.build_bundle(requests, &options)?)
        });

        match built {
          Ok(_) => {
            let key = bundle_path(&packages, &config);
            println!("{}", cache.store().path_of(&key).display());
          }
          Err(err) => {
            log::error!("{combination}: {err:#}");
            failures += 1;
          }
        }
      }

      if failures > 0 {
        bail!("{failures} of {} combinations failed", combinations.len());
      }
      Ok(())
    }
    Command::Key { combination } => {
      let packages = config.with_implicit_dependencies(&parse_combination(&combination)?);
      println!("{}", bundle_path(&packages, &config));
      if let Some(hash) = install_hash(&packages) {
        println!("{hash}");
      }
      Ok(())
    }
  }
}

fn load_tree(root: &Path) -> Result<InstalledTree> {
  InstalledTree::load(root).with_context(|| format!("failed to load install at {}", root.display()))
}

fn read_json<T: serde::de::DeserializeOwned>(path: &Path) -> Result<T> {
  let text =
    fs::read_to_string(path).with_context(|| format!("failed to read {}", path.display()))?;
  serde_json::from_str(&text).with_context(|| format!("failed to parse {}", path.display()))
}

/// A packaged dependency carries a single `dependency`; anything else is read as a bundle.
fn read_contributor(path: &Path) -> Result<BundleManifest> {
  let value: serde_json::Value = read_json(path)?;
  let parsed = if value.get("dependency").is_some() {
    serde_json::from_value::<PackageBundle>(value).map(BundleManifest::from)
  } else {
    serde_json::from_value::<BundleManifest>(value)
  };
  parsed.with_context(|| format!("{} is neither a package nor a bundle", path.display()))
}

fn write_json<T: Serialize>(value: &T, out: Option<&Path>) -> Result<()> {
  let json = serde_json::to_string(value).context("failed to serialise bundle")?;
  match out {
    Some(path) => {
      if let Some(parent) = path.parent().filter(|parent| !parent.as_os_str().is_empty()) {
        fs::create_dir_all(parent)
          .with_context(|| format!("failed to create {}", parent.display()))?;
      }
      fs::write(path, json).with_context(|| format!("failed to write {}", path.display()))
    }
    None => {
      println!("{json}");
      Ok(())
    }
  }
}
