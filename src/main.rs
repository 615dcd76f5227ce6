use std::sync::Arc;

use anyhow::Context;
use futures::StreamExt;
use tracing_subscriber::prelude::*;
use tracing_subscriber::{EnvFilter, fmt};

use petbot::channels::{Channel, CliChannel};
use petbot::config::AppConfig;
use petbot::intake::DialogueOrchestrator;
use petbot::llm::{ModelGateway, create_provider};
use petbot::store::{Database, LibSqlBackend};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let config = AppConfig::from_env().unwrap_or_else(|e| {
        eprintln!("Error: {e}");
        eprintln!("  export PETBOT_API_KEY=...");
        std::process::exit(1);
    });

    // Keep the guard alive so buffered file logs are flushed on exit.
    let _log_guard = init_tracing(&config);

    eprintln!("🐾 petbot v{}", env!("CARGO_PKG_VERSION"));
    eprintln!("   Model: {} ({:?})", config.llm.model, config.llm.backend);
    eprintln!("   Service tag: {}", config.intake.service_tag);
    eprintln!("   Type a message and press Enter. Prefix with `<phone>: ` to speak as another user.");
    eprintln!("   /reset clears all stored data, /quit exits.\n");

    // ── LLM ─────────────────────────────────────────────────────────────
    let llm = create_provider(&config.llm)?;
    let gateway = Arc::new(
        ModelGateway::new(llm, config.retry.clone()).with_temperature(config.llm.temperature),
    );

    // ── Database ────────────────────────────────────────────────────────
    let db: Arc<dyn Database> = Arc::new(
        LibSqlBackend::new_local(&config.db_path)
            .await
            .with_context(|| format!("opening database at {}", config.db_path.display()))?,
    );
    eprintln!("   Database: {}", config.db_path.display());

    // ── Intake ──────────────────────────────────────────────────────────
    let orchestrator = Arc::new(DialogueOrchestrator::new(
        Arc::clone(&db),
        gateway,
        config.intake.clone(),
    ));

    let channel = Arc::new(CliChannel::new(config.cli_user.clone()));
    let mut messages = channel.start().await?;
    tracing::info!(channel = channel.name(), "Channel started");

    while let Some(request) = messages.next().await {
        match request.text.trim() {
            "/quit" | "/exit" => break,
            "/reset" => {
                match db.reset_all().await {
                    Ok(()) => eprintln!("All clients, messages and reminders deleted."),
                    Err(e) => tracing::error!(error = %e, "Reset failed"),
                }
                eprint!("> ");
                continue;
            }
            _ => {}
        }

        let orchestrator = Arc::clone(&orchestrator);
        let channel = Arc::clone(&channel);
        tokio::spawn(async move {
            let report = orchestrator.handle_turn(&request).await;
            if let Err(e) = channel.respond(&request, report.reply).await {
                tracing::error!(error = %e, user_id = %request.user_id, "Failed to deliver reply");
            }
        });
    }

    channel.shutdown().await?;
    Ok(())
}

/// Console logging, plus daily-rolling file output when a log dir is set.
fn init_tracing(config: &AppConfig) -> Option<tracing_appender::non_blocking::WorkerGuard> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));

    let (file_layer, guard) = match &config.log_dir {
        Some(dir) => {
            let appender = tracing_appender::rolling::daily(dir, "petbot.log");
            let (writer, guard) = tracing_appender::non_blocking(appender);
            let layer = fmt::layer().with_writer(writer).with_ansi(false);
            (Some(layer), Some(guard))
        }
        None => (None, None),
    };

    tracing_subscriber::registry()
        .with(filter)
        .with(fmt::layer().with_target(false).with_writer(std::io::stderr))
        .with(file_layer)
        .init();

    guard
}
