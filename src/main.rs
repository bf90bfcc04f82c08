use chrono::{DateTime, Utc};
use coffee_match::config::{LoggingSettings, Settings};
use coffee_match::models::RunRoundRequest;
use coffee_match::services::{
    HistoryStore, InMemoryLock, InMemoryStore, LockError, LogNotifier, MatchSink, NotifyError, Notifier,
    ParticipantSource, PostgresStore, RedisLease, RoundLock, StoreError, WebhookNotifier,
};
use coffee_match::{RoundError, RoundOrchestrator, RoundResult};
use std::process::ExitCode;
use std::sync::Arc;
use std::time::Duration;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;
use validator::Validate;

/// Failures before or during the single round this binary runs
#[derive(Debug, thiserror::Error)]
enum CliError {
    #[error("Configuration error: {0}")]
    Config(#[from] config::ConfigError),

    #[error("Invalid trigger: {0}")]
    Trigger(String),

    #[error("Storage setup failed: {0}")]
    Store(#[from] StoreError),

    #[error("Lock setup failed: {0}")]
    Lock(#[from] LockError),

    #[error("Notifier setup failed: {0}")]
    Notifier(#[from] NotifyError),

    #[error(transparent)]
    Round(#[from] RoundError),
}

struct Backends {
    participants: Arc<dyn ParticipantSource>,
    history: Arc<dyn HistoryStore>,
    sink: Arc<dyn MatchSink>,
    lock: Arc<dyn RoundLock>,
    notifier: Arc<dyn Notifier>,
}

fn split_store<S>(store: Arc<S>) -> (Arc<dyn ParticipantSource>, Arc<dyn HistoryStore>, Arc<dyn MatchSink>)
where
    S: ParticipantSource + HistoryStore + MatchSink + 'static,
{
    (store.clone(), store.clone(), store)
}

#[tokio::main]
async fn main() -> ExitCode {
    // Load .env file if present
    dotenv::dotenv().ok();

    let settings = match Settings::load() {
        Ok(settings) => settings,
        Err(e) => {
            eprintln!("Failed to load configuration: {}", e);
            return ExitCode::from(2);
        }
    };

    init_tracing(&settings.logging);

    info!(
        "Starting coffee-match round for deployment {}",
        settings.deployment.id
    );

    match run(settings).await {
        Ok(result) => {
            match serde_json::to_string_pretty(&result) {
                Ok(json) => println!("{}", json),
                Err(e) => error!("Failed to serialize round result: {}", e),
            }
            ExitCode::SUCCESS
        }
        Err(CliError::Round(e)) => {
            let summary = serde_json::json!({
                "error": e.kind(),
                "message": e.to_string(),
                "retryable": e.is_retryable(),
            });
            println!("{}", summary);
            ExitCode::from(1)
        }
        Err(e) => {
            error!("{}", e);
            ExitCode::from(2)
        }
    }
}

fn init_tracing(logging: &LoggingSettings) {
    let level = std::env::var("LOG_LEVEL").unwrap_or_else(|_| logging.level.clone());
    let format = std::env::var("LOG_FORMAT").unwrap_or_else(|_| logging.format.clone());
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));

    // stdout carries the round summary
    let subscriber = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_level(true)
        .with_writer(std::io::stderr);

    if format == "pretty" {
        subscriber.pretty().init();
    } else {
        subscriber.json().init();
    }
}

async fn connect(settings: &Settings) -> Result<Backends, CliError> {
    let (participants, history, sink) = if settings.database.url.is_empty() {
        warn!("No database configured, running against an empty in-memory store");
        split_store(Arc::new(InMemoryStore::new()))
    } else {
        let store = PostgresStore::from_settings(
            &settings.database.url,
            settings.database.max_connections,
            settings.database.min_connections,
            settings.database.acquire_timeout_secs,
            settings.database.idle_timeout_secs,
        )
        .await?;
        info!("PostgreSQL store initialized");
        split_store(Arc::new(store))
    };

    let lock: Arc<dyn RoundLock> = match &settings.lease.redis_url {
        Some(url) => {
            let lease = RedisLease::new(url).await?;
            info!("Redis round lease initialized");
            Arc::new(lease)
        }
        None => {
            warn!("No Redis configured, round lock only covers this process");
            Arc::new(InMemoryLock::new())
        }
    };

    let notifier: Arc<dyn Notifier> = match &settings.notifier.webhook_url {
        Some(url) => Arc::new(WebhookNotifier::new(
            url.clone(),
            settings.notifier.api_key.clone(),
            Duration::from_secs(settings.notifier.timeout_secs),
        )?),
        None => Arc::new(LogNotifier),
    };

    Ok(Backends {
        participants,
        history,
        sink,
        lock,
        notifier,
    })
}

/// Trigger parameters from COFFEE_ROUND_ID, COFFEE_ROUND_INDEX and COFFEE_SCHEDULED_DATE
fn read_trigger(latest: Option<u64>) -> Result<RunRoundRequest, CliError> {
    let round_index = match std::env::var("COFFEE_ROUND_INDEX") {
        Ok(raw) => raw
            .trim()
            .parse::<u64>()
            .map_err(|e| CliError::Trigger(format!("COFFEE_ROUND_INDEX={:?}: {}", raw, e)))?,
        Err(_) => latest.map_or(1, |latest| latest + 1),
    };

    let round_id = std::env::var("COFFEE_ROUND_ID").unwrap_or_else(|_| format!("round-{}", round_index));

    let scheduled_date = match std::env::var("COFFEE_SCHEDULED_DATE") {
        Ok(raw) => Some(
            DateTime::parse_from_rfc3339(raw.trim())
                .map_err(|e| CliError::Trigger(format!("COFFEE_SCHEDULED_DATE={:?}: {}", raw, e)))?
                .with_timezone(&Utc),
        ),
        Err(_) => None,
    };

    let request = RunRoundRequest {
        round_id,
        round_index,
        scheduled_date,
    };
    request.validate().map_err(|e| CliError::Trigger(e.to_string()))?;
    Ok(request)
}

async fn run(settings: Settings) -> Result<RoundResult, CliError> {
    let backends = connect(&settings).await?;
    let deployment_id = settings.deployment.id.clone();

    let latest = backends.history.latest_round_index(&deployment_id).await?;
    let request = read_trigger(latest)?;

    let orchestrator = RoundOrchestrator::new(
        deployment_id,
        backends.participants,
        backends.history,
        backends.sink,
        backends.lock,
        backends.notifier,
        settings.orchestrator_options(),
    );

    let config = settings.round_config();
    let scheduled_date = request.scheduled_date.unwrap_or_else(Utc::now);

    let result = orchestrator
        .run_round_at(&request.round_id, request.round_index, &config, scheduled_date)
        .await?;

    Ok(result)
}
