#![warn(missing_docs)]

//! One-shot replication pass: reconcile, sync, and verify a local root
//! against a primary root.

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{bail, Context, Result};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use fleetsync_registry::cursor::CursorStore;
use fleetsync_registry::lease::{current_time_us, LeaseBackend, LeaseStore};
use fleetsync_registry::store::RegistryStore;

use fleetsync_repl::config::ReplConfig;
use fleetsync_repl::content::{dir_checksum, DirContent};
use fleetsync_repl::error::ReplError;
use fleetsync_repl::reconcile::{BatchReconciler, ModelIndex};
use fleetsync_repl::replicable::PrimaryChecksums;
use fleetsync_repl::sync::{SyncOrchestrator, SyncOutcome};
use fleetsync_repl::verify::{VerificationEngine, VerifyOutcome};

/// Checksums computed straight from the primary root's directories.
struct PrimaryDirChecksums {
    primary_root: PathBuf,
}

#[async_trait::async_trait]
impl PrimaryChecksums for PrimaryDirChecksums {
    async fn checksum_for(&self, _kind: &str, model_id: u64) -> Result<Option<String>, ReplError> {
        dir_checksum(&self.primary_root.join(model_id.to_string())).map(Some)
    }
}

fn load_config(path: Option<&str>) -> Result<ReplConfig> {
    match path {
        Some(path) => {
            let raw = std::fs::read_to_string(path)
                .with_context(|| format!("reading config {path}"))?;
            serde_json::from_str(&raw).with_context(|| format!("parsing config {path}"))
        }
        None => Ok(ReplConfig::default()),
    }
}

/// Units are the numerically named subdirectories of the primary root.
fn scan_primary(root: &PathBuf) -> Result<ModelIndex> {
    let index = ModelIndex::new();
    for entry in std::fs::read_dir(root).with_context(|| format!("reading {}", root.display()))? {
        let entry = entry?;
        if !entry.file_type()?.is_dir() {
            continue;
        }
        if let Ok(id) = entry.file_name().to_string_lossy().parse::<u64>() {
            index.insert(id);
        }
    }
    Ok(index)
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::registry()
        .with(fmt::layer())
        .with(EnvFilter::from_default_env())
        .init();

    let args: Vec<String> = std::env::args().collect();
    if args.len() < 3 {
        bail!("usage: {} <primary-root> <local-root> [config.json]", args[0]);
    }
    let primary_root = PathBuf::from(&args[1]);
    let local_root = PathBuf::from(&args[2]);
    let config = load_config(args.get(3).map(String::as_str))?;
    std::fs::create_dir_all(&local_root)?;

    tracing::info!(
        node = %config.node_name,
        primary = %primary_root.display(),
        local = %local_root.display(),
        "replication pass starting"
    );

    let registry = Arc::new(RegistryStore::new());
    let cursors = Arc::new(CursorStore::new());
    let leases: Arc<dyn LeaseBackend> = Arc::new(LeaseStore::new());
    let content = Arc::new(DirContent::new(
        "repository",
        primary_root.clone(),
        local_root,
    ));
    let index = Arc::new(scan_primary(&primary_root)?);
    let (scheduler, mut resyncs) = fleetsync_repl::replicable::ChannelScheduler::new();

    let reconciler = BatchReconciler::new(
        registry.clone(),
        cursors,
        index,
        "repository",
        config.reconcile_range_size,
    );
    let orchestrator = SyncOrchestrator::new(
        config.clone(),
        registry.clone(),
        leases.clone(),
        content.clone(),
        Arc::new(scheduler),
    );
    let verifier = VerificationEngine::new(
        config,
        registry.clone(),
        leases,
        content,
        Arc::new(PrimaryDirChecksums { primary_root }),
    );

    // Backfill registry rows for the whole id space.
    loop {
        let result = reconciler.run_one_range().await?;
        if result.wrapped {
            break;
        }
    }

    let now = current_time_us();
    let max_id = registry.max_id().await.unwrap_or(0);
    let mut synced = 0u64;
    let mut failed = 0u64;
    for record in registry.records_after(0, max_id).await {
        if !record.needs_sync(now) {
            continue;
        }
        match orchestrator.execute(record.model_id).await {
            SyncOutcome::Synced | SyncOutcome::MissingOnPrimary => synced += 1,
            SyncOutcome::Failed => failed += 1,
            SyncOutcome::Skipped => {}
        }
    }
    while let Ok((_, model_id)) = resyncs.try_recv() {
        orchestrator.execute(model_id).await;
    }

    let mut verified = 0u64;
    let mut mismatched = 0u64;
    loop {
        let batch = verifier.batch_to_verify().await;
        if batch.is_empty() {
            break;
        }
        for model_id in batch {
            match verifier.verify(model_id).await {
                VerifyOutcome::Verified => verified += 1,
                VerifyOutcome::Mismatch => mismatched += 1,
                VerifyOutcome::Failed | VerifyOutcome::Skipped => {}
            }
        }
    }

    tracing::info!(synced, failed, verified, mismatched, "replication pass complete");
    if failed > 0 || mismatched > 0 {
        bail!("{failed} units failed to sync, {mismatched} checksum mismatches");
    }
    Ok(())
}
