use std::path::Path;
use std::sync::Arc;
use std::sync::atomic::Ordering;

use anyhow::Context;
use tracing::{error, info};
use tracing_subscriber::{EnvFilter, fmt, prelude::*};

use mail_knowledge::api::api_routes;
use mail_knowledge::config::PipelineConfig;
use mail_knowledge::error::PipelineError;
use mail_knowledge::llm::{LlmConfig, create_provider};
use mail_knowledge::mail::{MailSource, SpoolDirSource};
use mail_knowledge::pipeline::IntakeProcessor;
use mail_knowledge::pipeline::worker::{IntakeRunner, load_runtime_settings, spawn_intake_worker};
use mail_knowledge::store::{FsBlobStore, LibSqlBackend};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let _log_guard = init_tracing();

    let config = PipelineConfig::from_env().context("invalid pipeline configuration")?;
    let llm_config = LlmConfig::from_env().context("invalid LLM configuration")?;
    let llm = create_provider(&llm_config)?;

    let db_path = env_or("MAIL_KNOWLEDGE_DB_PATH", "./data/mail-knowledge.db");
    let blob_dir = env_or("MAIL_KNOWLEDGE_BLOB_DIR", "./data/archive");
    let spool_dir = env_or("MAIL_KNOWLEDGE_SPOOL_DIR", "./data/spool");
    let api_port: u16 = env_or("MAIL_KNOWLEDGE_API_PORT", "8080")
        .parse()
        .context("MAIL_KNOWLEDGE_API_PORT must be a port number")?;

    // ── Stores ───────────────────────────────────────────────────────────
    let db = Arc::new(
        LibSqlBackend::new_local(Path::new(&db_path))
            .await
            .with_context(|| format!("failed to open database at {db_path}"))?,
    );
    let blobs = Arc::new(
        FsBlobStore::new(&blob_dir)
            .await
            .with_context(|| format!("failed to open archive at {blob_dir}"))?,
    );

    let processor = Arc::new(IntakeProcessor::new(
        llm,
        db.clone(),
        db.clone(),
        blobs,
        &config,
    ));

    // ── One-shot reprocess ───────────────────────────────────────────────
    let args: Vec<String> = std::env::args().skip(1).collect();
    if let [command, message_id] = args.as_slice()
        && command == "reprocess"
    {
        let runtime = load_runtime_settings(&*db, &config.allowed_senders).await;
        processor.set_prompt(runtime.prompt);
        let outcome = match processor.reprocess(message_id, &runtime.allow_list).await {
            // Never archived (e.g. the archive write itself failed): use the spool copy.
            Err(PipelineError::NotArchived(_)) => {
                let message = SpoolDirSource::new(&spool_dir)
                    .fetch_new()
                    .await?
                    .into_iter()
                    .find(|m| m.id == *message_id)
                    .with_context(|| format!("{message_id} is neither archived nor in {spool_dir}"))?;
                processor.reprocess_message(&message, &runtime.allow_list).await
            }
            other => other,
        }
        .with_context(|| format!("reprocess of {message_id} failed"))?;
        eprintln!("{message_id}: {outcome:?}");
        return Ok(());
    }

    eprintln!("📬 Mail Knowledge v{}", env!("CARGO_PKG_VERSION"));
    eprintln!("   Model: {}", llm_config.model);
    eprintln!("   Database: {db_path}");
    eprintln!("   Archive: {blob_dir} ({:?})", config.archive_policy);
    eprintln!("   Spool: {spool_dir}");
    eprintln!("   API: http://0.0.0.0:{api_port}/api/runs\n");

    tokio::fs::create_dir_all(&spool_dir)
        .await
        .with_context(|| format!("failed to create spool directory {spool_dir}"))?;
    let source = Arc::new(SpoolDirSource::new(&spool_dir));

    // ── Operator API ─────────────────────────────────────────────────────
    let listener = tokio::net::TcpListener::bind(("0.0.0.0", api_port))
        .await
        .with_context(|| format!("failed to bind API port {api_port}"))?;
    let intake = IntakeRunner::new(
        source.clone(),
        processor.clone(),
        db.clone(),
        config.allowed_senders.clone(),
    );
    let app = api_routes(db.clone(), intake);
    tokio::spawn(async move {
        if let Err(e) = axum::serve(listener, app).await {
            error!("API server stopped: {e}");
        }
    });

    // ── Intake worker ────────────────────────────────────────────────────
    let (worker, shutdown) = spawn_intake_worker(source, processor, db.clone(), &config);

    tokio::signal::ctrl_c().await?;
    info!("Shutdown requested");
    shutdown.store(true, Ordering::Relaxed);
    worker.abort();
    Ok(())
}

/// stderr always; a daily rolling file too when `MAIL_KNOWLEDGE_LOG_DIR` is set.
fn init_tracing() -> Option<tracing_appender::non_blocking::WorkerGuard> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let stderr = fmt::layer().with_target(false).with_writer(std::io::stderr);

    match std::env::var("MAIL_KNOWLEDGE_LOG_DIR") {
        Ok(dir) => {
            let appender = tracing_appender::rolling::daily(dir, "mail-knowledge.log");
            let (writer, guard) = tracing_appender::non_blocking(appender);
            tracing_subscriber::registry()
                .with(filter)
                .with(stderr)
                .with(fmt::layer().with_ansi(false).with_writer(writer))
                .init();
            Some(guard)
        }
        Err(_) => {
            tracing_subscriber::registry().with(filter).with(stderr).init();
            None
        }
    }
}

fn env_or(key: &str, default: &str) -> String {
    std::env::var(key).unwrap_or_else(|_| default.to_string())
}
