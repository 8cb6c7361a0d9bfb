// Operator CLI for the exchange store
//
//   trust-exchange init                  create / migrate the database
//   trust-exchange summary <user_id>     cached rating summary vs replay
//   trust-exchange disputes              transactions awaiting admin resolution
//   trust-exchange verify                compare every cached summary with its replay
//   trust-exchange rebuild-summaries     rebuild the rating cache from the event log
//   trust-exchange relay                 re-hand undispatched notifications

use anyhow::{bail, Context, Result};
use std::env;
use std::sync::Arc;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use trust_exchange::{Config, Exchange, LogEmitter, Store};

fn main() -> Result<()> {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info,trust_exchange=debug".into()),
        )
        .with(tracing_subscriber::fmt::layer().with_target(true))
        .init();

    let args: Vec<String> = env::args().collect();
    let config = Config::from_env()?;

    let store = Store::open(&config.db_path, config.store.clone())
        .with_context(|| format!("Failed to open database at {}", config.db_path.display()))?;
    let exchange = Exchange::new(store, Arc::new(LogEmitter));

    match args.get(1).map(String::as_str) {
        Some("init") | None => run_init(&config),
        Some("summary") => {
            let user_id = args.get(2).context("usage: trust-exchange summary <user_id>")?;
            run_summary(&exchange, user_id)
        }
        Some("disputes") => run_disputes(&exchange),
        Some("verify") => run_verify(&exchange),
        Some("rebuild-summaries") => run_rebuild(&exchange),
        Some("relay") => run_relay(&exchange),
        Some(other) => bail!("unknown command: {}", other),
    }
}

fn run_init(config: &Config) -> Result<()> {
    println!("✓ Database ready at {}", config.db_path.display());
    Ok(())
}

fn run_summary(exchange: &Exchange, user_id: &str) -> Result<()> {
    let cached = exchange.get_summary(user_id)?;
    let replayed = exchange.ratings().replay_summary(user_id)?;

    if cached.is_new_member() {
        println!("{}: new member, no ratings yet", user_id);
    } else {
        println!("{}", user_id);
        println!(
            "  overall  {:.2} ({} ratings)",
            cached.overall_average, cached.overall_count
        );
        println!(
            "  seller   {:.2} ({} ratings)",
            cached.seller_average, cached.seller_count
        );
        println!(
            "  buyer    {:.2} ({} ratings)",
            cached.buyer_average, cached.buyer_count
        );
    }

    if cached != replayed {
        println!("⚠ cache differs from event log, run: trust-exchange rebuild-summaries");
    }
    Ok(())
}

fn run_disputes(exchange: &Exchange) -> Result<()> {
    let disputed = exchange.list_disputed()?;

    if disputed.is_empty() {
        println!("No open disputes");
        return Ok(());
    }

    println!("{} disputed transaction(s)", disputed.len());
    for item in disputed {
        println!(
            "  {}  listing {}  raised by {} at {} (was {})",
            item.transaction.id,
            item.transaction.listing_id,
            item.entry.raised_by,
            item.entry.raised_at.to_rfc3339(),
            item.entry.prior_state,
        );
        println!("      \"{}\"", item.entry.reason);
    }
    Ok(())
}

fn run_verify(exchange: &Exchange) -> Result<()> {
    let drift = exchange.ratings().verify_summaries()?;

    if drift.is_empty() {
        println!("✓ Every cached summary matches its replay");
        return Ok(());
    }

    for d in &drift {
        println!(
            "✗ {}: cached {} ratings / {:.4}, replay {} ratings / {:.4}",
            d.user_id,
            d.cached.overall_count,
            d.cached.overall_average,
            d.replayed.overall_count,
            d.replayed.overall_average,
        );
    }
    bail!("{} summaries drifted from the event log", drift.len())
}

fn run_rebuild(exchange: &Exchange) -> Result<()> {
    let rebuilt = exchange.ratings().rebuild_all_summaries()?;
    println!("✓ Rebuilt {} rating summaries", rebuilt);
    Ok(())
}

fn run_relay(exchange: &Exchange) -> Result<()> {
    let delivered = exchange.outbox().relay_pending()?;
    println!("✓ Relayed {} notification(s)", delivered);
    Ok(())
}
