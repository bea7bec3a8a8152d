use std::env;
use std::path::PathBuf;

use catalog::{RunContext, ScanOptions, TagReader};
use tracing_subscriber::EnvFilter;

fn main() -> Result<(), Box<dyn std::error::Error>> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into());
    tracing_subscriber::fmt().with_env_filter(filter).init();

    let mut options = ScanOptions::default();
    let mut config_arg: Option<String> = None;
    for arg in env::args().skip(1) {
        match arg.as_str() {
            "--force" => options.force_refresh = true,
            "--skip-scan" => options.skip_scan = true,
            _ => config_arg = Some(arg),
        }
    }

    let config_path = config_arg
        .map(PathBuf::from)
        .unwrap_or_else(catalog::config_path_from_env);
    let (config, created) = catalog::load_or_create_config(&config_path)?;
    if created {
        println!(
            "Created default config at {:?}, set media_root and run again",
            config_path
        );
        return Ok(());
    }

    let ctx = RunContext::from_config(&config_path, config)?;
    let outcome = catalog::run_index(&ctx, options, &TagReader)?;

    println!(
        "Indexed: {} records ({} extracted, {} fresh, {} failed, {} pruned), {} categories, {} playlists",
        outcome.records.len(),
        outcome.stats.extracted,
        outcome.stats.fresh,
        outcome.stats.failed,
        outcome.stats.pruned,
        outcome.catalog.categories.len(),
        outcome.catalog.playlists.len()
    );

    Ok(())
}
