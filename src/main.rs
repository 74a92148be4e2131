use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Context;
use taskpool::config::PoolConfig;
use taskpool::import::Importer;
use taskpool::store::{Database, LibSqlBackend};
use taskpool::task_types::{TaskTypeRegistry, registry};
use taskpool::tasks::TaskAllocator;

const USAGE: &str = "Usage: taskpool <type_name> <batch_id> <file>...";

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .with_target(false)
        .init();

    let args: Vec<String> = std::env::args().skip(1).collect();
    let [type_name, batch_id, files @ ..] = args.as_slice() else {
        eprintln!("{USAGE}");
        std::process::exit(2);
    };
    if files.is_empty() {
        eprintln!("{USAGE}");
        std::process::exit(2);
    }
    let paths: Vec<PathBuf> = files.iter().map(PathBuf::from).collect();

    let config = PoolConfig::from_env();
    config.validate()?;

    eprintln!("taskpool v{}", env!("CARGO_PKG_VERSION"));
    eprintln!("   Database: {}", config.db_path.display());

    // ── Task types ──────────────────────────────────────────────────────
    let declared = config.load_task_types()?;
    let registry = registry::install(TaskTypeRegistry::from_configs(&declared)?)?;
    let handle = registry
        .resolve(type_name)
        .with_context(|| format!("There is no task type {type_name}"))?;

    // ── Database ────────────────────────────────────────────────────────
    let db: Arc<dyn Database> = Arc::new(
        LibSqlBackend::new_local(&config.db_path)
            .await
            .with_context(|| format!("Failed to open database at {}", config.db_path.display()))?,
    );

    // ── Import ──────────────────────────────────────────────────────────
    let allocator = Arc::new(
        TaskAllocator::new(Arc::clone(&db), registry)
            .with_max_attempts(config.complete_max_attempts),
    );
    let importer = Importer::new(Arc::clone(&allocator), config.default_batch.clone())
        .with_chunk_size(config.import_chunk_size);

    let report = importer.import_files(&handle, &paths, batch_id).await?;
    let batch = allocator.ledger().get(batch_id).await.ok();

    eprintln!("   Imported: {} tasks", report.imported);
    if let Some(batch) = batch {
        eprintln!("   {batch}");
    }
    for (path, reason) in &report.failed_sources {
        eprintln!("   Skipped {}: {}", path.display(), reason);
    }

    Ok(())
}
