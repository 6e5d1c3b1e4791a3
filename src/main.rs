use std::sync::Arc;

use anyhow::Context;
use funnel_intake::api::{AppState, api_routes};
use funnel_intake::config::IntakeConfig;
use funnel_intake::funnel::FunnelStateMachine;
use funnel_intake::mail::{ImapMailbox, transport_from_config};
use funnel_intake::pipeline::{
    AttachmentStore, ForwardingOrchestrator, IntakePipeline, MessageIngestor, PollingScheduler,
    extractor_from_config,
};
use funnel_intake::store::{Database, LibSqlBackend};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Install rustls crypto provider before any TLS usage
    rustls::crypto::ring::default_provider()
        .install_default()
        .map_err(|_| anyhow::anyhow!("Failed to install rustls crypto provider"))?;

    let config = IntakeConfig::from_env().context("Invalid configuration")?;
    let _log_guard = setup_logging(&config);

    eprintln!("📬 Funnel Intake v{}", env!("CARGO_PKG_VERSION"));
    eprintln!("   Accounts: {}", config.accounts.len());
    for account in &config.accounts {
        let state = if account.has_credentials() { "" } else { " (no password, skipped)" };
        eprintln!("     - {} <{}>{state}", account.name, account.address);
    }

    // ── Database ─────────────────────────────────────────────────────────
    let db: Arc<dyn Database> = Arc::new(
        LibSqlBackend::new_local(&config.db_path)
            .await
            .with_context(|| format!("Failed to open database at {}", config.db_path.display()))?,
    );
    eprintln!("   Database: {}", config.db_path.display());

    // ── Pipeline ─────────────────────────────────────────────────────────
    let attachments = AttachmentStore::new(&config.attachments);
    let transport = transport_from_config(&config.smtp);
    if !config.smtp.is_configured() {
        eprintln!("   SMTP: not configured, forwarding will record failures");
    }
    if config.extraction.api_key.is_none() {
        eprintln!("   Extraction: no API key, requests use subject/body fallback");
    }

    let forwarding = ForwardingOrchestrator::new(
        Arc::clone(&db),
        transport,
        config.department_addresses(),
        attachments.clone(),
    );
    let pipeline = Arc::new(IntakePipeline::new(
        Arc::clone(&db),
        MessageIngestor::new(Arc::clone(&db), attachments),
        extractor_from_config(&config.extraction),
        forwarding,
        &config.accounts,
    ));
    let scheduler = Arc::new(PollingScheduler::new(
        pipeline,
        Arc::new(ImapMailbox::new().with_max_message_size(config.max_message_size)),
        config.accounts.clone(),
        config.polling.clone(),
    ));
    let funnel = Arc::new(FunnelStateMachine::new(Arc::clone(&db)));

    let handle = if config.polling.enabled {
        eprintln!(
            "   Polling: every {}s",
            config.polling.interval.as_secs()
        );
        scheduler.start()
    } else {
        eprintln!("   Polling: disabled (use POST /api/emails/process)");
        None
    };

    // ── HTTP ─────────────────────────────────────────────────────────────
    let app = api_routes(AppState {
        scheduler: Arc::clone(&scheduler),
        funnel,
        db,
    });
    let listener = tokio::net::TcpListener::bind(format!("0.0.0.0:{}", config.http_port))
        .await
        .with_context(|| format!("Failed to bind port {}", config.http_port))?;
    eprintln!("   API: http://0.0.0.0:{}/api\n", config.http_port);
    tracing::info!(port = config.http_port, "HTTP server started");

    axum::serve(listener, app)
        .with_graceful_shutdown(async {
            if let Err(e) = tokio::signal::ctrl_c().await {
                tracing::error!("Failed to listen for shutdown signal: {e}");
            }
        })
        .await
        .context("HTTP server failed")?;

    if let Some(handle) = handle {
        handle.stop();
        handle.join().await;
    }
    tracing::info!("Shut down");
    Ok(())
}

/// Stderr logging plus a daily rolling file when a log directory is set.
fn setup_logging(config: &IntakeConfig) -> Option<tracing_appender::non_blocking::WorkerGuard> {
    use tracing_subscriber::layer::SubscriberExt;
    use tracing_subscriber::util::SubscriberInitExt;

    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"));
    let stderr_layer = tracing_subscriber::fmt::layer()
        .with_target(false)
        .with_writer(std::io::stderr);

    let log_dir = config
        .log_dir
        .as_ref()
        .filter(|dir| std::fs::create_dir_all(dir).is_ok());
    match log_dir {
        Some(dir) => {
            let file_appender = tracing_appender::rolling::daily(dir, "funnel-intake.log");
            let (writer, guard) = tracing_appender::non_blocking(file_appender);
            let file_layer = tracing_subscriber::fmt::layer()
                .with_ansi(false)
                .with_writer(writer);
            tracing_subscriber::registry()
                .with(env_filter)
                .with(stderr_layer)
                .with(file_layer)
                .init();
            Some(guard)
        }
        None => {
            tracing_subscriber::registry()
                .with(env_filter)
                .with(stderr_layer)
                .init();
            None
        }
    }
}
