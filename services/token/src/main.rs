//! Retention worker: periodically hard-deletes session records that expired
//! longer ago than the configured retention.

use anyhow::Context;
use rust_common::{init_tracing, Clock, SystemClock, TracingConfig};
use std::sync::Arc;
use token_lifecycle::session::SessionStore;
use token_lifecycle::storage::{self, RedisSessionStore};
use token_lifecycle::{AuthError, Config};
use tokio::time::MissedTickBehavior;
use tracing::{error, info};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let config = Config::from_env().context("loading configuration")?;

    init_tracing(
        &TracingConfig::default()
            .with_service_name("token-retention-worker")
            .with_log_level(config.log_level.clone())
            .with_json_output(config.log_json),
    )?;

    info!(
        interval_secs = config.retention_sweep_interval.as_secs(),
        retention_secs = config.session_retention.as_secs(),
        "Starting token retention worker"
    );

    let clock: Arc<dyn Clock> = Arc::new(SystemClock);
    let conn = storage::connect(&config.redis_url)
        .await
        .context("connecting to redis")?;
    let store = RedisSessionStore::new(
        conn,
        clock.clone(),
        config.refresh_token_ttl,
        config.session_retention,
    )?;
    let retention = chrono::Duration::from_std(config.session_retention)
        .context("SESSION_RETENTION out of range")?;

    let mut ticker = tokio::time::interval(config.retention_sweep_interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    let shutdown = tokio::signal::ctrl_c();
    tokio::pin!(shutdown);

    loop {
        tokio::select! {
            _ = ticker.tick() => {
                let cutoff = clock.now() - retention;
                match store.purge_expired(cutoff).await {
                    Ok(purged) => info!(purged, %cutoff, "retention sweep finished"),
                    Err(err) => {
                        let retryable = matches!(&err, AuthError::Storage(e) if e.is_retryable());
                        error!(error = %err, retryable, "retention sweep failed");
                    }
                }
            }
            _ = &mut shutdown => {
                info!("Shutting down token retention worker");
                break;
            }
        }
    }

    Ok(())
}
