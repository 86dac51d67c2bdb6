//! Concurrent Clients - two staff sessions sharing one dropped-stock pool
//!
//! Ana and Ben each run their own `PoolManager` against the same pair of stores. Ana drops
//! stock into the pool, both of them race to move units into their orders, Ben releases his
//! hold again and the garbage collector tidies up. Every mirror refresh and notification is
//! logged, and the Prometheus metrics are printed at the end.
//!
//! # Running the Example
//!
//! ```bash
//! cargo run --bin concurrent-clients
//! RUST_LOG=debug DROPPOOL_DEBOUNCE_MS=50 cargo run --bin concurrent-clients
//! ```

use droppool_core::Decimal;
use droppool_core::environment::{Notification, NotificationLevel, Notifier, PoolView, RefreshSink};
use droppool_core::hold_store::TargetOrder;
use droppool_core::ids::{OrderId, UserId};
use droppool_core::pool_store::ProductInfo;
use droppool_runtime::{MetricsRecorder, PoolConfig, PoolEnvironment, PoolError, PoolManager};
use droppool_testing::{InMemoryHoldStore, InMemoryPoolStore};
use std::sync::Arc;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};
use uuid::Uuid;

/// Logs every refresh instead of rendering it.
struct LogSink {
    client: &'static str,
}

impl RefreshSink for LogSink {
    fn refresh(&self, view: PoolView) {
        tracing::info!(
            client = self.client,
            records = view.items.len(),
            free = view.free_units(),
            held = view.held_units(),
            "Pool view refreshed"
        );
        for entry in &view.items {
            let holders: Vec<String> = entry
                .holders
                .iter()
                .map(|h| format!("{} x{} ({})", h.name, h.quantity, h.order_label))
                .collect();
            tracing::debug!(
                client = self.client,
                product = %entry.item.display_name,
                free = entry.item.quantity,
                holders = ?holders,
                "Pool entry"
            );
        }
    }
}

struct LogNotifier {
    client: &'static str,
}

impl Notifier for LogNotifier {
    fn notify(&self, notification: Notification) {
        match notification.level {
            NotificationLevel::Success => {
                tracing::info!(client = self.client, "{}", notification.message);
            },
            NotificationLevel::Warning => {
                tracing::warn!(client = self.client, "{}", notification.message);
            },
            NotificationLevel::Error => {
                tracing::error!(client = self.client, "{}", notification.message);
            },
        }
    }
}

fn client(
    name: &'static str,
    pool: &InMemoryPoolStore,
    holds: &InMemoryHoldStore,
    config: PoolConfig,
) -> PoolManager {
    let env = PoolEnvironment::new(
        Arc::new(pool.clone()),
        Arc::new(holds.clone()),
        Arc::new(LogSink { client: name }),
        Arc::new(LogNotifier { client: name }),
    );
    PoolManager::new(env, config)
}

fn draft_order(user: &str, display_name: &str, campaign: &str) -> TargetOrder {
    TargetOrder {
        order_id: OrderId::new(Uuid::new_v4().to_string()),
        user_id: UserId::new(user),
        display_name: display_name.to_string(),
        order_label: campaign.to_string(),
        is_draft: true,
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let _ = dotenvy::dotenv();

    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info,droppool=debug".into()),
        )
        .with(tracing_subscriber::fmt::layer().with_target(false))
        .init();

    let mut recorder = MetricsRecorder::new();
    recorder.install()?;

    let config = PoolConfig::from_env();
    tracing::info!(
        debounce = ?config.debounce_window,
        settle = ?config.initial_sync_delay,
        "Starting two pool clients"
    );

    let pool = InMemoryPoolStore::new();
    let holds = InMemoryHoldStore::new();
    let ana = client("ana", &pool, &holds, config.clone());
    let ben = client("ben", &pool, &holds, config.clone());
    ana.init().await?;
    ben.init().await?;

    let yoghurt = ProductInfo::new("prod-yoghurt", "Greek yoghurt 500g", "YG-500")
        .with_unit_price(Decimal::new(189, 2));
    let yoghurt_product = yoghurt.product_id.clone();
    let bread = ProductInfo::new("prod-bread", "Sourdough loaf", "BR-SD")
        .with_unit_price(Decimal::new(349, 2));

    let yoghurt_id = ana.add_item(yoghurt.clone(), 2, "best before tomorrow").await?;
    ana.add_item(bread, 1, "crushed packaging").await?;
    // Merges into the yoghurt record Ana just pushed.
    ana.add_item(yoghurt, 1, "best before tomorrow").await?;

    let ana_order = draft_order("u-ana", "Ana", "Weekend campaign");
    let ben_order = draft_order("u-ben", "Ben", "Restaurant run");

    // Four requests race for three units.
    let (a1, b1, a2, b2) = tokio::join!(
        ana.transfer_to_order(&yoghurt_id, &ana_order),
        ben.transfer_to_order(&yoghurt_id, &ben_order),
        ana.transfer_to_order(&yoghurt_id, &ana_order),
        ben.transfer_to_order(&yoghurt_id, &ben_order),
    );
    let mut ben_hold = None;
    for result in [a1, b1, a2, b2] {
        match result {
            Ok(receipt) => {
                tracing::info!(
                    hold = %receipt.hold_key,
                    remaining = receipt.remaining,
                    "Transfer done"
                );
                if receipt.hold_key.user_id == ben_order.user_id {
                    ben_hold = Some(receipt.hold_key);
                }
            },
            Err(PoolError::Exhausted(id)) => tracing::info!(item_id = %id, "Lost the race"),
            Err(err) => return Err(err.into()),
        }
    }

    for holder in ben.get_holders(&yoghurt_product).await? {
        tracing::info!(
            name = %holder.name,
            quantity = holder.quantity,
            order = %holder.order_label,
            "Holder"
        );
    }

    if let Some(key) = ben_hold {
        let outcomes = ben.release_hold(&key).await?;
        tracing::info!(?outcomes, "Ben released the hold");
    }
    let swept = ana.sweep().await?;
    tracing::info!(checked = swept.len(), "Sweep done");

    tokio::time::sleep(config.debounce_window * 2).await;
    tracing::info!(
        ana_refreshes = ana.refresh_count(),
        ben_refreshes = ben.refresh_count(),
        records_left = pool.len(),
        "Simulation finished"
    );

    ana.teardown().await;
    ben.teardown().await;

    if let Some(rendered) = recorder.render() {
        println!("{rendered}");
    }
    Ok(())
}
