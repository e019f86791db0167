//! Plugin scanner. Lists the plugins found in the given directories.
//!
//! Build with `--features scanner`.

use std::path::PathBuf;
use std::process::ExitCode;

use clap::Parser;
use tracing_subscriber::EnvFilter;
use vstbridge_host::{default_search_paths, ModuleLoader, PluginCatalog};

#[derive(Parser, Debug)]
#[command(name = "vstbridge-scan", about = "List the VST 2.x plugins in a set of directories")]
struct Args {
    /// Descend into subdirectories
    #[arg(short, long)]
    recursive: bool,

    /// Catalog file reused between runs and rewritten afterwards
    #[arg(long, value_name = "FILE")]
    catalog: Option<PathBuf>,

    /// Directories to scan; the platform defaults when empty
    #[arg(value_name = "DIR")]
    dirs: Vec<PathBuf>,
}

fn main() -> ExitCode {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn")))
        .init();

    let args = Args::parse();
    let dirs = if args.dirs.is_empty() {
        default_search_paths()
    } else {
        args.dirs
    };

    let mut catalog = match &args.catalog {
        Some(file) if file.exists() => PluginCatalog::load(file).unwrap_or_else(|e| {
            tracing::warn!(path = %file.display(), "ignoring unreadable catalog: {e}");
            PluginCatalog::new()
        }),
        _ => PluginCatalog::new(),
    };

    catalog.scan_directories(ModuleLoader::global(), &dirs, args.recursive);

    for desc in catalog.plugins() {
        println!(
            "{:08x}\t{}\t{}\t{}\t{}in/{}out\t{}",
            desc.unique_id as u32,
            desc.name,
            desc.manufacturer,
            desc.category,
            desc.num_inputs,
            desc.num_outputs,
            desc.path.display()
        );
    }
    for file in catalog.failed_files() {
        eprintln!("failed\t{}", file.display());
    }

    if let Some(file) = &args.catalog {
        if let Err(e) = catalog.save(file) {
            eprintln!("could not write catalog {}: {e}", file.display());
            return ExitCode::FAILURE;
        }
    }
    ExitCode::SUCCESS
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    #[test]
    fn test_cli_definition() {
        Args::command().debug_assert();
    }

    #[test]
    fn test_parse_flags_and_dirs() {
        let args = Args::try_parse_from(["vstbridge-scan", "-r", "--catalog", "cache.bin", "/a", "/b"]).unwrap();
        assert!(args.recursive);
        assert_eq!(args.catalog, Some(PathBuf::from("cache.bin")));
        assert_eq!(args.dirs, vec![PathBuf::from("/a"), PathBuf::from("/b")]);

        let args = Args::try_parse_from(["vstbridge-scan"]).unwrap();
        assert!(!args.recursive);
        assert!(args.catalog.is_none());
        assert!(args.dirs.is_empty());
    }

    #[test]
    fn test_rejects_unknown_option() {
        assert!(Args::try_parse_from(["vstbridge-scan", "--frobnicate"]).is_err());
        assert!(Args::try_parse_from(["vstbridge-scan", "--catalog"]).is_err());
    }
}
