use std::sync::Arc;

use clap::Parser;
use clicktime_sync::cache::LookupCache;
use clicktime_sync::cli::Cli;
use clicktime_sync::clicktime::ClickTimeClient;
use clicktime_sync::config::{self, AppConfigOverrides};
use clicktime_sync::index::SearchIndex;
use clicktime_sync::logging;
use clicktime_sync::metrics::{log_summary, Metrics};
use clicktime_sync::sync::sync_projects;

fn main() -> Result<(), Box<dyn std::error::Error>> {
    let _ = dotenvy::dotenv();
    let cli = Cli::parse();

    let mut cfg = config::load()?;
    cfg.apply_overrides(&AppConfigOverrides::from_env())?;
    logging::init(cfg.logging.debug);

    let projects = cli.projects(&cfg.clicktime.projects);
    let metrics = Arc::new(Metrics::new());

    let clicktime = ClickTimeClient::new_with_metrics(
        &cfg.clicktime.base_url,
        cfg.clicktime.api_token.clone(),
        Arc::clone(&metrics),
    )?;
    let index = SearchIndex::new_with_metrics(
        &cfg.index.base_url,
        &cfg.index.alias,
        cfg.index.auth(),
        Arc::clone(&metrics),
    )?;
    tracing::info!(
        clicktime = %clicktime.base_url,
        index = %index.base_url,
        alias = %index.alias,
        projects = projects.len(),
        "starting clicktime sync"
    );

    match index.cluster_info() {
        Ok(info) => tracing::info!(
            cluster = ?info.cluster_name,
            version = ?info.version,
            "search index reachable"
        ),
        Err(err) => tracing::warn!(error = %err, "failed search index info probe"),
    }

    index.ensure_alias()?;

    let mut cache = LookupCache::new(Arc::clone(&metrics));
    let result = sync_projects(&clicktime, &index, &mut cache, &cfg.sync, &projects);
    log_summary(&metrics);
    let result = result?;

    tracing::info!(
        projects = result.projects.len(),
        indexed = result.entries_indexed(),
        deleted = result.stale_deleted(),
        "sync complete"
    );
    Ok(())
}
