//! Kitchen orders demo.
//!
//! Runs against `PostgreSQL` when `DATABASE_URL` is set, otherwise in memory.

use anyhow::Context;
use exactly_once_postgres::{DeadLetterQueue, PostgresRecordStore};
use exactly_once_runtime::MetricsServer;
use exactly_once_testing::InMemoryRecordStore;
use kitchen_orders::{DemoConfig, KitchenSummary, compare_policies, run_orders};
use std::sync::Arc;
use tracing::{info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "kitchen_orders=info,exactly_once_core=info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let config = DemoConfig::from_env();
    info!(
        store = if config.database_url.is_some() { "postgres" } else { "memory" },
        orders = config.orders,
        duplicates = config.duplicate_deliveries,
        fault_rate = config.faults.rate,
        "Configuration loaded"
    );

    let mut metrics = MetricsServer::new(
        config
            .metrics_address()
            .parse()
            .context("invalid metrics address")?,
    );
    metrics.start()?;

    for report in compare_policies(&config, config.duplicate_deliveries).await {
        info!(
            policy = report.policy.as_str(),
            calls = report.calls,
            documents = report.documents,
            "Side effects for {} copies of one event",
            config.duplicate_deliveries
        );
    }

    let summary = if let Some(url) = &config.database_url {
        info!("Connecting to record store database...");
        let store = PostgresRecordStore::new(url).await?;
        store.migrate().await?;
        let dead_letters = DeadLetterQueue::new(store.pool().clone());
        info!("Record store connected");

        let summary = run_orders(Arc::new(store), &config, Some(&dead_letters)).await?;
        let pending = dead_letters.count_pending().await?;
        if pending > 0 {
            warn!(pending, "Dead letters waiting for investigation");
        }
        summary
    } else {
        run_orders(Arc::new(InMemoryRecordStore::new()), &config, None).await?
    };

    report(&summary, config.orders);
    Ok(())
}

fn report(summary: &KitchenSummary, orders: usize) {
    info!(
        deliveries = summary.deliveries,
        acked = summary.acked,
        replayed = summary.replayed,
        dead_lettered = summary.dead_lettered,
        attempts = summary.attempts,
        injected_faults = summary.injected_faults,
        "Deliveries finished"
    );

    if summary.cooks_assigned <= orders && summary.cooks_notified <= orders {
        info!(
            orders,
            cooks_assigned = summary.cooks_assigned,
            cooks_notified = summary.cooks_notified,
            "No order was cooked or notified twice"
        );
    } else {
        warn!(
            orders,
            cooks_assigned = summary.cooks_assigned,
            cooks_notified = summary.cooks_notified,
            "Duplicate side effects detected"
        );
    }
}
