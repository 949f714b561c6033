use std::path::Path;
use std::sync::Arc;
use std::time::{Duration, Instant};

use futures::TryStreamExt;
use futures::future::join_all;
use rescache_engine::{
    DownloadCoordinator, FileSourceOpener, HttpSourceOpener, RecencyComparator, SourceRegistry,
    create_client,
};
use tokio::io::AsyncWriteExt;
use tracing::{error, info, warn};

use crate::cli::{Command, FetchArgs};
use crate::error::AppError;
use crate::utils::files::{
    FILE_SOURCE, HTTP_SOURCE, Target, create_dirs, output_file_name, parse_target,
};
use crate::utils::{format_age, format_bytes};

pub async fn run(coordinator: &DownloadCoordinator, command: &Command) -> Result<(), AppError> {
    match command {
        Command::Fetch(args) => fetch(coordinator, args).await,
        Command::List => {
            list(coordinator);
            Ok(())
        }
        Command::Stats => stats(coordinator),
        Command::Invalidate { keys } => {
            invalidate(coordinator, keys).await;
            Ok(())
        }
        Command::Evict => {
            evict(coordinator).await;
            Ok(())
        }
        Command::Clear => {
            let removed = coordinator.store().clear().await;
            info!(removed, "Cache cleared");
            Ok(())
        }
    }
}

fn build_registry(
    coordinator: &DownloadCoordinator,
    args: &FetchArgs,
) -> Result<SourceRegistry, AppError> {
    let client = create_client(
        Duration::from_secs(args.timeout),
        Duration::from_secs(args.connect_timeout),
    )?;
    let registry = SourceRegistry::new();
    registry.register_source(HTTP_SOURCE, Arc::new(HttpSourceOpener::new(client)));
    registry.register_source(
        FILE_SOURCE,
        Arc::new(
            FileSourceOpener::new(args.root.clone())
                .with_chunk_size(coordinator.config().chunk_size_bytes),
        ),
    );
    Ok(registry)
}

pub async fn fetch(coordinator: &DownloadCoordinator, args: &FetchArgs) -> Result<(), AppError> {
    let registry = build_registry(coordinator, args)?;
    if let Some(dir) = &args.output_dir {
        create_dirs(dir).await?;
    }

    let targets = args
        .input
        .iter()
        .map(|input| parse_target(input))
        .collect::<Result<Vec<_>, _>>()?;

    let registry = &registry;
    let output_dir = args.output_dir.as_deref();
    let fetches = targets.iter().map(|target| async move {
        let result = fetch_one(coordinator, registry, target, output_dir).await;
        if let Err(e) = &result {
            error!(source = target.source_id, resource = %target.resource_id, error = %e, "Fetch failed");
        }
        result
    });
    let results = join_all(fetches).await;

    let failed = results.iter().filter(|r| r.is_err()).count();
    if failed > 0 {
        return Err(AppError::FetchFailed {
            failed,
            total: results.len(),
        });
    }
    Ok(())
}

async fn fetch_one(
    coordinator: &DownloadCoordinator,
    registry: &SourceRegistry,
    target: &Target,
    output_dir: Option<&Path>,
) -> Result<u64, AppError> {
    let start = Instant::now();
    let mut handle = coordinator
        .resolve_from(registry, target.source_id, &target.resource_id)
        .await?;
    let key = handle.key().to_string();
    let origin = handle.origin();

    let written = match output_dir {
        Some(dir) => {
            let path = dir.join(output_file_name(
                handle.info().resource_name.as_deref(),
                &target.resource_id,
            ));
            let mut file = tokio::fs::File::create(&path).await?;
            let mut reader = handle.into_async_read();
            let written = tokio::io::copy(&mut reader, &mut file).await?;
            file.flush().await?;
            info!(key = %key, path = %path.display(), "Wrote resource");
            written
        }
        None => {
            let mut total = 0u64;
            while let Some(chunk) = handle.try_next().await? {
                total += chunk.len() as u64;
            }
            total
        }
    };

    info!(
        key = %key,
        origin = ?origin,
        size = %format_bytes(written),
        elapsed_ms = start.elapsed().as_millis() as u64,
        "Fetched resource"
    );
    Ok(written)
}

fn list(coordinator: &DownloadCoordinator) {
    let mut entries = coordinator.store().entries();
    RecencyComparator::sort(&mut entries);
    let now = coordinator.store().now_millis();

    for entry in &entries {
        println!(
            "{:<48} {:>12} {:>12} {}",
            entry.key,
            format_bytes(entry.size().unwrap_or(0)),
            format_age(entry.last_touched_millis, now),
            entry.resource_name.as_deref().unwrap_or("-"),
        );
    }
    info!(
        entries = entries.len(),
        total = %format_bytes(coordinator.store().total_size_bytes()),
        "Listed cache"
    );
}

fn stats(coordinator: &DownloadCoordinator) -> Result<(), AppError> {
    let json = serde_json::to_string_pretty(&coordinator.stats())
        .map_err(|e| AppError::InvalidInput(e.to_string()))?;
    println!("{json}");
    Ok(())
}

async fn invalidate(coordinator: &DownloadCoordinator, keys: &[String]) {
    for key in keys {
        if !coordinator.invalidate(key).await {
            warn!(key = %key, "Key was not cached");
        }
    }
}

async fn evict(coordinator: &DownloadCoordinator) {
    let report = coordinator.enforce_eviction().await;
    for key in report.evicted_keys() {
        info!(key, "Evicted");
    }
    for key in &report.skipped {
        warn!(key = %key, "Skipped entry in use");
    }
    info!(
        evicted = report.evicted.len(),
        freed = %format_bytes(report.bytes_freed),
        "Eviction finished"
    );
}
