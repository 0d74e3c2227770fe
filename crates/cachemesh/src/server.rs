use std::sync::Arc;

use anyhow::{Context, Result};

use cachemesh_service::caching::{self, DiskCache};
use cachemesh_service::config::Config;
use cachemesh_service::distrib::secrets::SecretStore;
use cachemesh_service::distrib::DistribCache;
use cachemesh_service::upstream::{HttpBackend, UpstreamKind};
use cachemesh_service::volatile::Volatiles;
use cachemesh_service::Backend;

/// Starts the node and serves until interrupted.
pub fn run(config: Config) -> Result<()> {
    anyhow::ensure!(
        !config.origin_url.is_empty(),
        "origin_url must be configured"
    );

    let runtime = tokio::runtime::Builder::new_multi_thread()
        .thread_name("cachemesh")
        .enable_all()
        .build()?;

    runtime.block_on(async move {
        let vols = Arc::new(Volatiles::from_env());
        let secrets = match &config.secret_file {
            Some(path) => Some(Arc::new(
                SecretStore::load(path.clone()).context("failed to load secret store")?,
            )),
            None => None,
        };

        let origin = Arc::new(HttpBackend::new(
            config.origin_url.clone(),
            &vols,
            UpstreamKind::Origin,
        ));
        let distrib =
            DistribCache::new(&config, Arc::clone(&vols), secrets, origin).await?;
        let cache = Arc::new(DiskCache::new(
            Arc::clone(&distrib) as Arc<dyn Backend>,
            config.cache_dir.clone(),
            &config.cache,
        ));
        distrib.set_server_backend(Arc::clone(&cache) as Arc<dyn Backend>);

        tracing::info!(
            url = distrib.server_url(),
            uuid = distrib.uuid(),
            "cache node running"
        );

        tokio::signal::ctrl_c()
            .await
            .context("failed to listen for shutdown signal")?;
        tracing::info!("interrupt received, shutting down");
        distrib.shutdown().await;
        Ok(())
    })
}

/// One sweep over the reply cache directory.
pub fn cleanup(config: Config) -> Result<()> {
    let Some(cache_dir) = &config.cache_dir else {
        anyhow::bail!("no cache_dir configured, nothing to clean");
    };
    let vols = Volatiles::from_env();
    let summary = caching::cleanup(cache_dir, &vols);
    tracing::info!(
        scanned = summary.scanned,
        removed = summary.removed,
        bytes_freed = summary.bytes_freed,
        "cache cleanup finished"
    );
    println!(
        "{}",
        serde_json::json!({
            "scanned": summary.scanned,
            "removed": summary.removed,
            "bytes_freed": summary.bytes_freed,
        })
    );
    Ok(())
}
