//! Runs one uneven trade end to end: proposal, escrow, shipping, verification and ratings.
//!
//! ```text
//! TRADE_DB_PATH=/tmp/walkthrough.db RUST_LOG=debug cargo run --example walkthrough
//! ```
use anyhow::Context;
use tracing::info;
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt};
use trade_escrow::{MarketConfig, RatingScores, TradeResponse, TradeService, TradeTerms};

fn main() -> anyhow::Result<()> {
    let config = MarketConfig::from_env()?;
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| config.log_filter.clone().into()),
        )
        .with(fmt::layer())
        .init();

    let service = TradeService::from_config(&config)
        .with_context(|| format!("opening {}", config.database_path.display()))?;

    let alice = service.register_user("alice", 0)?;
    let bob = service.register_user("bob", 0)?;
    service.deposit_funds(&bob.id, 25_000)?;

    let card = service.list_item(&alice.id, "Charizard 1st edition", 120_000)?;
    let watch = service.list_item(&bob.id, "Seiko SKX007", 100_000)?;

    let terms = TradeTerms::new()
        .offer_items([card.id.as_str()])
        .request_items([watch.id.as_str()]);
    let preview = service.cash_differential_preview(&alice.id, &bob.id, &terms)?;
    info!(description = %preview.description, "previewed differential");

    let trade = service.propose_trade(&alice.id, &bob.id, terms)?;
    let trade = service.respond_to_trade(&trade.id, &bob.id, TradeResponse::Accept)?;
    info!(trade_id = %trade.id, status = %trade.status, "accepted");

    let escrow = service.get_escrow(&trade.id)?;
    let hold = service.fund_escrow(&trade.id, &bob.id, escrow.differential.amount)?;
    info!(hold_id = %hold.id, amount = hold.amount, "escrow funded");

    service.submit_tracking(&trade.id, &alice.id, "1Z999AA10123456784", "UPS")?;
    service.submit_tracking(&trade.id, &bob.id, "9400111899223100000000", "USPS")?;
    service.verify_satisfaction(&trade.id, &alice.id)?;
    let trade = service.verify_satisfaction(&trade.id, &bob.id)?;
    info!(status = %trade.status, settled = trade.settled, "both parties verified");

    service.rate_trade(&trade.id, &alice.id, RatingScores::new(5).shipping(4), None)?;
    let outcome = service.rate_trade(
        &trade.id,
        &bob.id,
        RatingScores::new(5),
        Some("Card exactly as pictured".to_string()),
    )?;
    info!(status = %outcome.trade_status, "ratings revealed");

    for witness in service.history(&trade.id)? {
        info!(actor = %witness.actor, action = ?witness.action, "witness");
    }
    info!(
        intact = service.verify_history(&trade.id)?,
        alice = service.get_user(&alice.id)?.balance,
        bob = service.get_user(&bob.id)?.balance,
        "done"
    );
    Ok(())
}
