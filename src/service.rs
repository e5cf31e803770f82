//! Service layer API for the trade lifecycle
use super::audit::{self, Witness, WitnessAction, verify_chain};
use super::config::MarketConfig;
use super::differential::{CashDifferential, calculate_cash_differential};
use super::error::{Result, TradeError, ValidationError};
use super::escrow::{EscrowCoordinator, EscrowHold, EscrowStatus, PaymentProvider};
use super::ledger::{Item, User, tx_claim_items, tx_set_reservation, tx_valuation};
use super::notify::{
    Notification, Notifier, PriceSignalSink, TracingNotifier, TracingSignalSink, TradeEvent,
};
use super::settlement::{Settlement, settle};
use super::store::{Store, Tx, TxResult, compound_key, tx_load, tx_mark, tx_put};
use super::trade::{Party, Trade, TradeStatus, TradeTerms};
use super::utils::{TRADE_HRP, new_id};
use chrono::Duration;
use std::sync::Arc;
use tracing::{debug, info, warn};

pub const DEFAULT_RATING_WINDOW_DAYS: u32 = 14;

/// The receiver's answer to a proposal.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TradeResponse {
    Accept,
    Reject,
}

pub struct TradeService {
    pub(crate) store: Store,
    pub(crate) escrow: EscrowCoordinator,
    pub(crate) notifier: Arc<dyn Notifier>,
    pub(crate) signals: Arc<dyn PriceSignalSink>,
    pub(crate) rating_window: Duration,
}

impl TradeService {
    pub fn new(instance: Arc<sled::Db>, provider: Arc<dyn PaymentProvider>) -> Result<Self> {
        let store = Store::open(instance)?;
        Ok(Self {
            escrow: EscrowCoordinator::new(store.clone(), provider),
            store,
            notifier: Arc::new(TracingNotifier),
            signals: Arc::new(TracingSignalSink),
            rating_window: Duration::days(DEFAULT_RATING_WINDOW_DAYS.into()),
        })
    }

    /// Opens the configured database and resolves the configured payment provider.
    pub fn from_config(config: &MarketConfig) -> anyhow::Result<Self> {
        let db = sled::open(&config.database_path)?;
        let service = Self::new(Arc::new(db), config.payment_provider())?
            .with_rating_window_days(config.rating_window_days);
        Ok(service)
    }

    pub fn with_notifier(mut self, notifier: Arc<dyn Notifier>) -> Self {
        self.notifier = notifier;
        self
    }

    pub fn with_price_signals(mut self, signals: Arc<dyn PriceSignalSink>) -> Self {
        self.signals = signals;
        self
    }

    pub fn with_rating_window_days(mut self, days: u32) -> Self {
        self.rating_window = Duration::days(days.into());
        self
    }

    pub fn store(&self) -> &Store {
        &self.store
    }

    pub fn escrow(&self) -> &EscrowCoordinator {
        &self.escrow
    }

    pub(crate) fn notify(
        &self,
        user_id: &str,
        event: TradeEvent,
        trade_id: &str,
        message: impl Into<String>,
    ) {
        self.notifier
            .notify(Notification::new(user_id, event, trade_id, message));
    }

    /// Post-commit side effects of a settlement.
    pub(crate) fn after_settlement(&self, settlement: &Settlement) {
        for signal in settlement.price_signals() {
            self.signals.record_signal(signal);
        }
        for user_id in [&settlement.proposer_id, &settlement.receiver_id] {
            self.notify(
                user_id,
                TradeEvent::TradeSettled,
                &settlement.trade_id,
                "Trade settled. Items and cash have been exchanged; please rate your partner.",
            );
        }
        info!(
            trade_id = %settlement.trade_id,
            items = settlement.transfers.len(),
            "trade settled"
        );
    }

    /// Creates a trade in `Proposed`. Items the parties do not currently own are let through
    /// with a warning; ownership is enforced on accept.
    pub fn propose_trade(
        &self,
        proposer_id: &str,
        receiver_id: &str,
        terms: TradeTerms,
    ) -> Result<Trade> {
        if proposer_id == receiver_id {
            return Err(ValidationError::SelfTrade.into());
        }
        let terms_hash = terms.validate_and_finalise()?;
        let trade_id = new_id(TRADE_HRP);

        let (trade, mismatches) = self.store.transaction(|tx| {
            let mut trade = Trade::new(
                trade_id.clone(),
                proposer_id.to_string(),
                receiver_id.to_string(),
                terms.clone(),
                terms_hash.clone(),
            );
            let mismatches = tx_insert_proposal(tx, &mut trade, proposer_id)?;
            Ok((trade, mismatches))
        })?;

        for item_id in &mismatches {
            warn!(trade_id = %trade.id, item_id = %item_id, "proposed item not owned by its stated party");
        }
        info!(trade_id = %trade.id, proposer_id, receiver_id, "trade proposed");
        self.notify(
            receiver_id,
            TradeEvent::TradeProposed,
            &trade.id,
            "You have received a new trade proposal.",
        );
        Ok(trade)
    }

    /// Receiver accepts or rejects a proposal. An even accept settles immediately; otherwise
    /// the items are reserved and the trade waits for escrow.
    pub fn respond_to_trade(
        &self,
        trade_id: &str,
        user_id: &str,
        response: TradeResponse,
    ) -> Result<Trade> {
        let rating_window = self.rating_window;
        let (trade, settlement) = self.store.transaction(|tx| {
            let mut trade: Trade = tx_load(tx.trades, "trade", trade_id)?;
            if user_id != trade.receiver_id {
                return Err(TradeError::forbidden(user_id, "respond to this trade").into());
            }
            if trade.status != TradeStatus::Proposed {
                let action = match response {
                    TradeResponse::Accept => "accept",
                    TradeResponse::Reject => "reject",
                };
                return Err(TradeError::InvalidStateTransition {
                    action,
                    status: trade.status,
                }
                .into());
            }

            if response == TradeResponse::Reject {
                trade.transition(TradeStatus::Rejected, "reject")?;
                audit::record(tx, &mut trade, user_id, WitnessAction::Rejected)?;
                tx_put(tx.trades, trade_id, &trade)?;
                return Ok((trade, None));
            }

            tx_claim_items(
                tx,
                trade.terms.items_of(Party::Proposer),
                &trade.proposer_id,
                trade_id,
            )?;
            tx_claim_items(
                tx,
                trade.terms.items_of(Party::Receiver),
                &trade.receiver_id,
                trade_id,
            )?;
            let differential = calculate_cash_differential(
                &trade.proposer_id,
                &trade.receiver_id,
                &tx_valuation(tx, &trade.terms)?,
            )
            .map_err(TradeError::from)?;

            audit::record(tx, &mut trade, user_id, WitnessAction::Accepted)?;
            let settlement = if differential.is_even() {
                Some(settle(tx, &mut trade, user_id, rating_window)?)
            } else {
                trade.transition(TradeStatus::Accepted, "accept")?;
                tx_set_reservation(tx, &trade.terms, trade_id, true)?;
                None
            };
            tx_put(tx.trades, trade_id, &trade)?;
            Ok((trade, settlement))
        })?;

        match response {
            TradeResponse::Accept => {
                info!(trade_id, user_id, status = %trade.status, "trade accepted");
                self.notify(
                    &trade.proposer_id,
                    TradeEvent::TradeAccepted,
                    trade_id,
                    "Your trade proposal was accepted.",
                );
            }
            TradeResponse::Reject => {
                info!(trade_id, user_id, "trade rejected");
                self.notify(
                    &trade.proposer_id,
                    TradeEvent::TradeRejected,
                    trade_id,
                    "Your trade proposal was declined.",
                );
            }
        }
        if let Some(settlement) = &settlement {
            self.after_settlement(settlement);
        }
        Ok(trade)
    }

    /// Proposer withdraws the trade. Reserved items are freed and any escrow is returned to
    /// its payer. If that refund fails the trade stays cancelled and the error is returned so
    /// the refund can be retried with [`TradeService::refund_escrow`].
    pub fn cancel_trade(&self, trade_id: &str, user_id: &str) -> Result<Trade> {
        let trade = self.store.transaction(|tx| {
            let mut trade: Trade = tx_load(tx.trades, "trade", trade_id)?;
            if user_id != trade.proposer_id {
                return Err(TradeError::forbidden(user_id, "cancel this trade").into());
            }
            if !matches!(
                trade.status,
                TradeStatus::Proposed | TradeStatus::Accepted | TradeStatus::EscrowFunded
            ) {
                return Err(TradeError::InvalidStateTransition {
                    action: "cancel",
                    status: trade.status,
                }
                .into());
            }
            trade.transition(TradeStatus::Cancelled, "cancel")?;
            tx_set_reservation(tx, &trade.terms, trade_id, false)?;
            audit::record(tx, &mut trade, user_id, WitnessAction::Cancelled)?;
            tx_put(tx.trades, trade_id, &trade)?;
            Ok(trade)
        })?;

        info!(trade_id, user_id, "trade cancelled");
        self.notify(
            &trade.receiver_id,
            TradeEvent::TradeCancelled,
            trade_id,
            "The trade was cancelled by the proposer.",
        );

        let refunded = self.escrow.unwind_hold(trade_id, user_id).map_err(|e| {
            warn!(trade_id, error = %e, "escrow refund after cancel failed");
            e
        })?;
        if let Some(hold) = refunded {
            self.notify_refund(&hold);
            return self.store.get_trade(trade_id);
        }
        Ok(trade)
    }

    /// Receiver answers a proposal with new terms. The original trade moves to `Countered`
    /// and a fresh proposal runs the other way, linked back through `parent_trade_id`.
    /// `terms` are written from the counter-proposer's point of view.
    pub fn counter_trade(
        &self,
        trade_id: &str,
        user_id: &str,
        terms: TradeTerms,
        message: Option<String>,
    ) -> Result<Trade> {
        let terms_hash = terms.validate_and_finalise()?;
        let counter_id = new_id(TRADE_HRP);

        let (counter, mismatches) = self.store.transaction(|tx| {
            let mut original: Trade = tx_load(tx.trades, "trade", trade_id)?;
            if user_id != original.receiver_id {
                return Err(TradeError::forbidden(user_id, "counter this trade").into());
            }
            if original.status != TradeStatus::Proposed {
                return Err(TradeError::InvalidStateTransition {
                    action: "counter",
                    status: original.status,
                }
                .into());
            }

            let mut counter = Trade::new(
                counter_id.clone(),
                original.receiver_id.clone(),
                original.proposer_id.clone(),
                terms.clone(),
                terms_hash.clone(),
            );
            counter.parent_trade_id = Some(original.id.clone());
            counter.counter_message = message.clone();
            let mismatches = tx_insert_proposal(tx, &mut counter, user_id)?;

            original.transition(TradeStatus::Countered, "counter")?;
            audit::record(
                tx,
                &mut original,
                user_id,
                WitnessAction::Countered {
                    counter_trade_id: counter.id.clone(),
                },
            )?;
            tx_put(tx.trades, trade_id, &original)?;
            Ok((counter, mismatches))
        })?;

        for item_id in &mismatches {
            warn!(trade_id = %counter.id, item_id = %item_id, "countered item not owned by its stated party");
        }
        info!(trade_id, counter_trade_id = %counter.id, user_id, "trade countered");
        self.notify(
            &counter.receiver_id,
            TradeEvent::TradeCountered,
            &counter.id,
            message.unwrap_or_else(|| "Your trade proposal received a counter-offer.".into()),
        );
        Ok(counter)
    }

    pub fn fund_escrow(&self, trade_id: &str, user_id: &str, amount: u64) -> Result<EscrowHold> {
        let hold = self.escrow.fund_escrow(trade_id, user_id, amount)?;
        self.notify(
            &hold.recipient_id,
            TradeEvent::EscrowFunded,
            trade_id,
            "Escrow for the cash differential has been funded.",
        );
        Ok(hold)
    }

    pub fn get_escrow(&self, trade_id: &str) -> Result<EscrowStatus> {
        self.escrow.escrow_status(trade_id)
    }

    pub fn release_escrow(&self, trade_id: &str, actor: &str) -> Result<EscrowHold> {
        let hold = self.escrow.release_escrow(trade_id, actor)?;
        self.notify(
            &hold.recipient_id,
            TradeEvent::EscrowReleased,
            trade_id,
            "Escrowed funds have been released to you.",
        );
        Ok(hold)
    }

    pub fn refund_escrow(
        &self,
        trade_id: &str,
        amount: Option<u64>,
        actor: &str,
    ) -> Result<EscrowHold> {
        let hold = self.escrow.refund_escrow(trade_id, amount, actor)?;
        self.notify_refund(&hold);
        Ok(hold)
    }

    pub(crate) fn notify_refund(&self, hold: &EscrowHold) {
        self.notify(
            &hold.payer_id,
            TradeEvent::EscrowRefunded,
            &hold.trade_id,
            "Escrowed funds have been returned to you.",
        );
    }

    pub fn submit_tracking(
        &self,
        trade_id: &str,
        user_id: &str,
        tracking_number: &str,
        carrier: &str,
    ) -> Result<Trade> {
        if tracking_number.trim().is_empty() {
            return Err(ValidationError::Blank("tracking number").into());
        }
        if carrier.trim().is_empty() {
            return Err(ValidationError::Blank("carrier").into());
        }

        let trade = self.store.transaction(|tx| {
            let mut trade: Trade = tx_load(tx.trades, "trade", trade_id)?;
            let party = trade
                .party_of(user_id)
                .ok_or_else(|| TradeError::forbidden(user_id, "submit tracking for this trade"))?;
            if !matches!(
                trade.status,
                TradeStatus::Accepted
                    | TradeStatus::EscrowFunded
                    | TradeStatus::CompletedAwaitingRating
            ) {
                return Err(TradeError::InvalidStateTransition {
                    action: "submit tracking",
                    status: trade.status,
                }
                .into());
            }
            let progress = trade.progress_mut(party);
            progress.tracking_number = Some(tracking_number.to_string());
            progress.carrier = Some(carrier.to_string());
            progress.tracking_submitted = true;
            audit::record(
                tx,
                &mut trade,
                user_id,
                WitnessAction::TrackingSubmitted {
                    carrier: carrier.to_string(),
                    tracking_number: tracking_number.to_string(),
                },
            )?;
            tx_put(tx.trades, trade_id, &trade)?;
            Ok(trade)
        })?;

        debug!(trade_id, user_id, carrier, "tracking submitted");
        if let Some(party) = trade.party_of(user_id) {
            self.notify(
                trade.user_of(party.other()),
                TradeEvent::TrackingSubmitted,
                trade_id,
                format!("Your trade partner shipped with {carrier}: {tracking_number}"),
            );
        }
        Ok(trade)
    }

    /// Marks the caller's side as satisfied. The verification that makes both sides
    /// satisfied settles the trade in the same transaction, then releases the escrow.
    pub fn verify_satisfaction(&self, trade_id: &str, user_id: &str) -> Result<Trade> {
        let rating_window = self.rating_window;
        let (trade, settlement) = self.store.transaction(|tx| {
            let mut trade: Trade = tx_load(tx.trades, "trade", trade_id)?;
            let party = trade
                .party_of(user_id)
                .ok_or_else(|| TradeError::forbidden(user_id, "verify this trade"))?;
            if !matches!(
                trade.status,
                TradeStatus::EscrowFunded | TradeStatus::CompletedAwaitingRating
            ) {
                return Err(TradeError::InvalidStateTransition {
                    action: "verify satisfaction",
                    status: trade.status,
                }
                .into());
            }
            trade.progress_mut(party).satisfaction_verified = true;
            audit::record(tx, &mut trade, user_id, WitnessAction::Verified)?;

            let settlement = if trade.status == TradeStatus::EscrowFunded && trade.both_verified()
            {
                Some(settle(tx, &mut trade, user_id, rating_window)?)
            } else {
                None
            };
            tx_put(tx.trades, trade_id, &trade)?;
            Ok((trade, settlement))
        })?;

        debug!(trade_id, user_id, "satisfaction verified");
        let Some(settlement) = settlement else {
            return Ok(trade);
        };
        self.after_settlement(&settlement);

        if self.escrow.active_hold(trade_id)?.is_some() {
            self.release_escrow(trade_id, user_id).map_err(|e| {
                warn!(trade_id, error = %e, "escrow release after settlement failed");
                e
            })?;
            return self.store.get_trade(trade_id);
        }
        Ok(trade)
    }

    pub fn get_trade(&self, trade_id: &str) -> Result<Trade> {
        self.store.get_trade(trade_id)
    }

    /// Every trade the user is a party to, oldest first.
    pub fn trades_for_user(&self, user_id: &str) -> Result<Vec<Trade>> {
        let mut trades = self
            .store
            .index_suffixes(&self.store.user_trades, user_id)?
            .iter()
            .map(|trade_id| self.store.get_trade(trade_id))
            .collect::<Result<Vec<_>>>()?;
        trades.sort_by_key(|t| t.created_at.to_datetime_utc());
        Ok(trades)
    }

    /// Every trade that has offered or requested the item, oldest first.
    pub fn trades_for_item(&self, item_id: &str) -> Result<Vec<Trade>> {
        let mut trades = self
            .store
            .index_suffixes(&self.store.item_trades, item_id)?
            .iter()
            .map(|trade_id| self.store.get_trade(trade_id))
            .collect::<Result<Vec<_>>>()?;
        trades.sort_by_key(|t| t.created_at.to_datetime_utc());
        Ok(trades)
    }

    /// The negotiation a trade belongs to, from the first proposal down to `trade_id`.
    pub fn counter_chain(&self, trade_id: &str) -> Result<Vec<Trade>> {
        let mut chain = vec![self.store.get_trade(trade_id)?];
        while let Some(parent_id) = chain.last().and_then(|t| t.parent_trade_id.clone()) {
            chain.push(self.store.get_trade(&parent_id)?);
        }
        chain.reverse();
        Ok(chain)
    }

    /// Differential the given terms would produce at current item values.
    pub fn cash_differential_preview(
        &self,
        proposer_id: &str,
        receiver_id: &str,
        terms: &TradeTerms,
    ) -> Result<CashDifferential> {
        let valuation = self.store.valuation(terms)?;
        Ok(calculate_cash_differential(
            proposer_id,
            receiver_id,
            &valuation,
        )?)
    }

    pub fn history(&self, trade_id: &str) -> Result<Vec<Witness>> {
        self.store.get_trade(trade_id)?;
        self.store.scan_records(&self.store.witnesses, trade_id)
    }

    /// Recomputes the trade's audit hash chain and checks it against the stored head.
    pub fn verify_history(&self, trade_id: &str) -> Result<bool> {
        let trade = self.store.get_trade(trade_id)?;
        let witnesses = self.store.scan_records(&self.store.witnesses, trade_id)?;
        Ok(verify_chain(&trade, &witnesses))
    }
}

/// Writes a new proposal with its indexes and first witness. Returns the ids of items that
/// do not belong to the party offering them; unknown items abort.
fn tx_insert_proposal(tx: &Tx<'_>, trade: &mut Trade, actor: &str) -> TxResult<Vec<String>> {
    let _: User = tx_load(tx.users, "user", &trade.proposer_id)?;
    let _: User = tx_load(tx.users, "user", &trade.receiver_id)?;

    let mut mismatches = vec![];
    for party in [Party::Proposer, Party::Receiver] {
        let owner = trade.user_of(party).to_string();
        for item_id in trade.terms.items_of(party) {
            let item: Item = tx_load(tx.items, "item", item_id)?;
            if item.owner_id != owner {
                mismatches.push(item_id.clone());
            }
            tx_mark(tx.item_trades, &compound_key(item_id, &trade.id))?;
        }
    }
    tx_mark(tx.user_trades, &compound_key(&trade.proposer_id, &trade.id))?;
    tx_mark(tx.user_trades, &compound_key(&trade.receiver_id, &trade.id))?;

    let terms_hash = trade.terms_hash.clone();
    audit::record(tx, trade, actor, WitnessAction::Proposed { terms_hash })?;
    tx_put(tx.trades, &trade.id, &*trade)?;
    Ok(mismatches)
}
