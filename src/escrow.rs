//! Escrow holds for cash differentials and the payment provider they are executed through.
//!
//! The coordinator never calls the provider inside a storage transaction. Funding writes a
//! `Pending` hold first (the one-active-hold-per-trade guard), calls the provider with the
//! hold id as idempotency key, then flips the hold to `Funded` in a second transaction. A
//! provider failure therefore leaves the hold exactly as it was before the call.
use super::audit::{self, WitnessAction};
use super::differential::{CashDifferential, calculate_cash_differential};
use super::error::{Result, TradeError, ValidationError};
use super::ledger::tx_valuation;
use super::store::{
    Store, Tx, TxResult, compound_key, get, tx_get, tx_get_str, tx_load, tx_put, tx_put_str,
    tx_remove,
};
use super::trade::{TimeStamp, Trade, TradeStatus};
use super::utils::{HOLD_HRP, new_id};
use chrono::Utc;
use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex, PoisonError};
use tracing::{info, warn};

#[derive(minicbor::Encode, minicbor::Decode, Debug, Clone, Copy, PartialEq, Eq)]
pub enum HoldStatus {
    #[n(0)]
    Pending,
    #[n(1)]
    Funded,
    #[n(2)]
    Released,
    #[n(3)]
    Refunded,
    #[n(4)]
    Disputed,
    // a release or refund call to the provider is in flight
    #[n(5)]
    Releasing,
    #[n(6)]
    Refunding,
}

impl HoldStatus {
    pub fn is_terminal(self) -> bool {
        matches!(self, HoldStatus::Released | HoldStatus::Refunded)
    }
}

#[derive(minicbor::Encode, minicbor::Decode, Debug, Clone, PartialEq, Eq)]
pub struct EscrowHold {
    #[n(0)]
    pub id: String,
    #[n(1)]
    pub trade_id: String,
    #[n(2)]
    pub payer_id: String,
    #[n(3)]
    pub recipient_id: String,
    #[n(4)]
    pub amount: u64,
    #[n(5)]
    pub refunded_amount: u64,
    #[n(6)]
    pub status: HoldStatus,
    #[n(7)]
    pub provider: String,
    #[n(8)]
    pub provider_reference: Option<String>,
    #[n(9)]
    pub created_at: TimeStamp<Utc>,
    #[n(10)]
    pub updated_at: TimeStamp<Utc>,
}

impl EscrowHold {
    pub fn remaining(&self) -> u64 {
        self.amount.saturating_sub(self.refunded_amount)
    }

    fn key(&self) -> String {
        compound_key(&self.trade_id, &self.id)
    }

    fn expect(&self, expected: HoldStatus) -> Result<()> {
        if self.status != expected {
            return Err(TradeError::InvalidEscrowState {
                hold_id: self.id.clone(),
                status: self.status,
                expected,
            });
        }
        Ok(())
    }

    fn touch(&mut self) {
        self.updated_at = TimeStamp::new();
    }
}

/// Read-only view of a trade's escrow, with the differential recomputed on every call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EscrowStatus {
    pub trade_id: String,
    pub holds: Vec<EscrowHold>,
    pub active_hold: Option<EscrowHold>,
    pub differential: CashDifferential,
}

#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
pub enum ProviderError {
    #[error("request timed out")]
    Timeout,
    #[error("provider unavailable: {0}")]
    Unavailable(String),
    #[error("declined: {0}")]
    Declined(String),
    #[error("unknown reference {0}")]
    UnknownReference(String),
}

impl ProviderError {
    pub fn is_retryable(&self) -> bool {
        matches!(self, ProviderError::Timeout | ProviderError::Unavailable(_))
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HoldRequest {
    pub hold_id: String, // idempotency key
    pub trade_id: String,
    pub payer_id: String,
    pub recipient_id: String,
    pub amount: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProviderHoldState {
    Held,
    Released,
    Refunded,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProviderHold {
    pub hold_id: String,
    pub reference: String,
    pub payer_id: String,
    pub amount: u64,
    pub refunded: u64,
    pub state: ProviderHoldState,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PaymentIntent {
    pub id: String,
    pub customer_id: String,
    pub amount: u64,
    pub captured: bool,
    pub refunded: u64,
}

/// A payment backend. Holds are addressed by the marketplace hold id, which the provider
/// treats as an idempotency key.
pub trait PaymentProvider: Send + Sync {
    fn name(&self) -> &str;
    fn create_payment_intent(
        &self,
        customer_id: &str,
        amount: u64,
    ) -> Result<PaymentIntent, ProviderError>;
    fn capture_payment(&self, intent_id: &str) -> Result<PaymentIntent, ProviderError>;
    fn refund_payment(
        &self,
        intent_id: &str,
        amount: Option<u64>,
    ) -> Result<PaymentIntent, ProviderError>;
    fn hold_funds(&self, request: &HoldRequest) -> Result<ProviderHold, ProviderError>;
    fn release_funds(
        &self,
        hold_id: &str,
        recipient_id: &str,
    ) -> Result<ProviderHold, ProviderError>;
    fn refund_held_funds(
        &self,
        hold_id: &str,
        amount: Option<u64>,
    ) -> Result<ProviderHold, ProviderError>;
    fn get_hold(&self, hold_id: &str) -> Result<Option<ProviderHold>, ProviderError>;
}

#[derive(Default)]
struct MockLedger {
    holds: HashMap<String, ProviderHold>,
    intents: HashMap<String, PaymentIntent>,
    failures: VecDeque<ProviderError>,
    calls: Vec<&'static str>,
    next_reference: u64,
}

impl MockLedger {
    fn reference(&mut self, kind: &str) -> String {
        self.next_reference += 1;
        format!("mock_{kind}_{}", self.next_reference)
    }

    fn hold_mut(&mut self, hold_id: &str) -> Result<&mut ProviderHold, ProviderError> {
        self.holds
            .get_mut(hold_id)
            .ok_or_else(|| ProviderError::UnknownReference(hold_id.to_string()))
    }
}

/// In-process provider. Failures queued with [`MockPaymentProvider::fail_next`] are
/// returned by the next calls, in order, before any state changes.
#[derive(Default)]
pub struct MockPaymentProvider {
    ledger: Mutex<MockLedger>,
}

impl MockPaymentProvider {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn fail_next(&self, error: ProviderError) {
        self.lock().failures.push_back(error);
    }

    /// Names of the provider methods called so far.
    pub fn calls(&self) -> Vec<&'static str> {
        self.lock().calls.clone()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, MockLedger> {
        self.ledger.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn call<T>(
        &self,
        name: &'static str,
        f: impl FnOnce(&mut MockLedger) -> Result<T, ProviderError>,
    ) -> Result<T, ProviderError> {
        let mut ledger = self.lock();
        ledger.calls.push(name);
        if let Some(error) = ledger.failures.pop_front() {
            return Err(error);
        }
        f(&mut *ledger)
    }
}

impl PaymentProvider for MockPaymentProvider {
    fn name(&self) -> &str {
        "mock"
    }

    fn create_payment_intent(
        &self,
        customer_id: &str,
        amount: u64,
    ) -> Result<PaymentIntent, ProviderError> {
        self.call("create_payment_intent", |ledger| {
            if amount == 0 {
                return Err(ProviderError::Declined("amount must be positive".into()));
            }
            let intent = PaymentIntent {
                id: ledger.reference("pi"),
                customer_id: customer_id.to_string(),
                amount,
                captured: false,
                refunded: 0,
            };
            ledger.intents.insert(intent.id.clone(), intent.clone());
            Ok(intent)
        })
    }

    fn capture_payment(&self, intent_id: &str) -> Result<PaymentIntent, ProviderError> {
        self.call("capture_payment", |ledger| {
            let intent = ledger
                .intents
                .get_mut(intent_id)
                .ok_or_else(|| ProviderError::UnknownReference(intent_id.to_string()))?;
            intent.captured = true;
            Ok(intent.clone())
        })
    }

    fn refund_payment(
        &self,
        intent_id: &str,
        amount: Option<u64>,
    ) -> Result<PaymentIntent, ProviderError> {
        self.call("refund_payment", |ledger| {
            let intent = ledger
                .intents
                .get_mut(intent_id)
                .ok_or_else(|| ProviderError::UnknownReference(intent_id.to_string()))?;
            if !intent.captured {
                return Err(ProviderError::Declined("payment was never captured".into()));
            }
            let refundable = intent.amount - intent.refunded;
            let amount = amount.unwrap_or(refundable);
            if amount > refundable {
                return Err(ProviderError::Declined(format!(
                    "refund {amount} exceeds refundable {refundable}"
                )));
            }
            intent.refunded += amount;
            Ok(intent.clone())
        })
    }

    fn hold_funds(&self, request: &HoldRequest) -> Result<ProviderHold, ProviderError> {
        self.call("hold_funds", |ledger| {
            if let Some(existing) = ledger.holds.get(&request.hold_id) {
                if existing.amount != request.amount {
                    return Err(ProviderError::Declined(
                        "idempotency key reused with a different amount".into(),
                    ));
                }
                return Ok(existing.clone());
            }
            let hold = ProviderHold {
                hold_id: request.hold_id.clone(),
                reference: ledger.reference("hold"),
                payer_id: request.payer_id.clone(),
                amount: request.amount,
                refunded: 0,
                state: ProviderHoldState::Held,
            };
            ledger.holds.insert(hold.hold_id.clone(), hold.clone());
            Ok(hold)
        })
    }

    fn release_funds(
        &self,
        hold_id: &str,
        _recipient_id: &str,
    ) -> Result<ProviderHold, ProviderError> {
        self.call("release_funds", |ledger| {
            let hold = ledger.hold_mut(hold_id)?;
            match hold.state {
                ProviderHoldState::Held => hold.state = ProviderHoldState::Released,
                ProviderHoldState::Released => {}
                ProviderHoldState::Refunded => {
                    return Err(ProviderError::Declined("hold was refunded".into()));
                }
            }
            Ok(hold.clone())
        })
    }

    fn refund_held_funds(
        &self,
        hold_id: &str,
        amount: Option<u64>,
    ) -> Result<ProviderHold, ProviderError> {
        self.call("refund_held_funds", |ledger| {
            let hold = ledger.hold_mut(hold_id)?;
            match hold.state {
                ProviderHoldState::Refunded => return Ok(hold.clone()),
                ProviderHoldState::Released => {
                    return Err(ProviderError::Declined("hold was released".into()));
                }
                ProviderHoldState::Held => {}
            }
            let refundable = hold.amount - hold.refunded;
            let amount = amount.unwrap_or(refundable);
            if amount > refundable {
                return Err(ProviderError::Declined(format!(
                    "refund {amount} exceeds held {refundable}"
                )));
            }
            hold.refunded += amount;
            if hold.refunded == hold.amount {
                hold.state = ProviderHoldState::Refunded;
            }
            Ok(hold.clone())
        })
    }

    fn get_hold(&self, hold_id: &str) -> Result<Option<ProviderHold>, ProviderError> {
        self.call("get_hold", |ledger| Ok(ledger.holds.get(hold_id).cloned()))
    }
}

pub(crate) fn tx_active_hold(tx: &Tx<'_>, trade_id: &str) -> TxResult<Option<EscrowHold>> {
    match tx_get_str(tx.active_holds, trade_id)? {
        Some(hold_id) => tx_get(tx.holds, &compound_key(trade_id, &hold_id)),
        None => Ok(None),
    }
}

fn tx_save_hold(tx: &Tx<'_>, hold: &EscrowHold) -> TxResult<()> {
    tx_put(tx.holds, &hold.key(), hold)?;
    if hold.status.is_terminal() {
        tx_remove(tx.active_holds, &hold.trade_id)?;
    }
    Ok(())
}

/// Funds, releases and refunds escrow holds through the injected [`PaymentProvider`].
#[derive(Clone)]
pub struct EscrowCoordinator {
    store: Store,
    provider: Arc<dyn PaymentProvider>,
}

impl EscrowCoordinator {
    pub fn new(store: Store, provider: Arc<dyn PaymentProvider>) -> Self {
        Self { store, provider }
    }

    pub fn provider(&self) -> &Arc<dyn PaymentProvider> {
        &self.provider
    }

    pub fn active_hold(&self, trade_id: &str) -> Result<Option<EscrowHold>> {
        let Some(hold_id) = self.store.active_holds.get(trade_id.as_bytes())? else {
            return Ok(None);
        };
        let hold_id = String::from_utf8_lossy(&hold_id);
        get(&self.store.holds, &compound_key(trade_id, &hold_id))
    }

    pub fn escrow_status(&self, trade_id: &str) -> Result<EscrowStatus> {
        let trade = self.store.get_trade(trade_id)?;
        let valuation = self.store.valuation(&trade.terms)?;
        Ok(EscrowStatus {
            trade_id: trade_id.to_string(),
            holds: self.store.scan_records(&self.store.holds, trade_id)?,
            active_hold: self.active_hold(trade_id)?,
            differential: calculate_cash_differential(
                &trade.proposer_id,
                &trade.receiver_id,
                &valuation,
            )?,
        })
    }

    /// Holds the trade's cash differential from its payer and moves the trade to
    /// `EscrowFunded`.
    pub fn fund_escrow(&self, trade_id: &str, payer_id: &str, amount: u64) -> Result<EscrowHold> {
        let provider_name = self.provider.name().to_string();
        let fresh_hold_id = new_id(HOLD_HRP);

        let pending = self.store.transaction(|tx| {
            let trade: Trade = tx_load(tx.trades, "trade", trade_id)?;
            if trade.party_of(payer_id).is_none() {
                return Err(TradeError::forbidden(payer_id, "fund escrow for this trade").into());
            }
            match trade.status {
                TradeStatus::Accepted => {}
                TradeStatus::EscrowFunded => {
                    return Err(TradeError::AlreadyFunded(trade_id.to_string()).into());
                }
                status => {
                    return Err(TradeError::InvalidStateTransition {
                        action: "fund escrow",
                        status,
                    }
                    .into());
                }
            }

            let differential = calculate_cash_differential(
                &trade.proposer_id,
                &trade.receiver_id,
                &tx_valuation(tx, &trade.terms)?,
            )
            .map_err(TradeError::from)?;
            let (Some(required_payer), Some(recipient)) =
                (differential.payer_id, differential.recipient_id)
            else {
                return Err(TradeError::NoCashDifferential(trade_id.to_string()).into());
            };
            if required_payer != payer_id {
                return Err(TradeError::WrongPayer {
                    expected: required_payer,
                    actual: payer_id.to_string(),
                }
                .into());
            }
            if amount != differential.amount {
                return Err(TradeError::from(ValidationError::AmountMismatch {
                    amount,
                    required: differential.amount,
                })
                .into());
            }

            if let Some(existing) = tx_active_hold(tx, trade_id)? {
                // a pending hold is a previous attempt whose provider call failed; retry it
                if existing.status == HoldStatus::Pending && existing.amount == amount {
                    return Ok(existing);
                }
                if existing.status != HoldStatus::Pending {
                    return Err(TradeError::AlreadyFunded(trade_id.to_string()).into());
                }
                let mut stale = existing;
                stale.status = HoldStatus::Refunded;
                stale.touch();
                tx_save_hold(tx, &stale)?;
            }

            let now = TimeStamp::new();
            let hold = EscrowHold {
                id: fresh_hold_id.clone(),
                trade_id: trade_id.to_string(),
                payer_id: payer_id.to_string(),
                recipient_id: recipient,
                amount,
                refunded_amount: 0,
                status: HoldStatus::Pending,
                provider: provider_name.clone(),
                provider_reference: None,
                created_at: now.clone(),
                updated_at: now,
            };
            tx_save_hold(tx, &hold)?;
            tx_put_str(tx.active_holds, trade_id, &hold.id)?;
            Ok(hold)
        })?;

        let request = HoldRequest {
            hold_id: pending.id.clone(),
            trade_id: trade_id.to_string(),
            payer_id: pending.payer_id.clone(),
            recipient_id: pending.recipient_id.clone(),
            amount: pending.amount,
        };
        let provider_hold = self.provider.hold_funds(&request).map_err(|e| {
            warn!(trade_id, hold_id = %pending.id, error = %e, "hold_funds failed, hold left pending");
            TradeError::from(e)
        })?;

        let funded = self.store.transaction(|tx| {
            let mut hold: EscrowHold = tx_load(tx.holds, "escrow hold", &pending.key())?;
            if hold.status == HoldStatus::Funded {
                return Err(TradeError::AlreadyFunded(trade_id.to_string()).into());
            }
            let mut trade: Trade = tx_load(tx.trades, "trade", trade_id)?;
            // a cancellation or dispute may have landed while the provider call was in flight
            if tx_get_str(tx.active_disputes, trade_id)?.is_some() {
                return Err(TradeError::DisputeAlreadyOpen(trade_id.to_string()).into());
            }
            if hold.status != HoldStatus::Pending || trade.status != TradeStatus::Accepted {
                return Err(TradeError::InvalidStateTransition {
                    action: "fund escrow",
                    status: trade.status,
                }
                .into());
            }
            trade.transition(TradeStatus::EscrowFunded, "fund escrow")?;

            hold.status = HoldStatus::Funded;
            hold.provider_reference = Some(provider_hold.reference.clone());
            hold.touch();
            tx_save_hold(tx, &hold)?;

            audit::record(
                tx,
                &mut trade,
                payer_id,
                WitnessAction::EscrowFunded {
                    hold_id: hold.id.clone(),
                    amount: hold.amount,
                },
            )?;
            tx_put(tx.trades, trade_id, &trade)?;
            Ok(hold)
        });

        match funded {
            Ok(hold) => {
                info!(trade_id, hold_id = %hold.id, amount = hold.amount, payer_id, "escrow funded");
                Ok(hold)
            }
            Err(TradeError::AlreadyFunded(id)) => Err(TradeError::AlreadyFunded(id)),
            Err(e) => {
                // the provider holds money the trade no longer wants
                warn!(trade_id, hold_id = %pending.id, error = %e, "funding aborted, returning held funds");
                match self.provider.refund_held_funds(&pending.id, None) {
                    Ok(remote) => {
                        if let Err(void_err) = self.void_pending(&pending, remote.refunded, payer_id)
                        {
                            warn!(trade_id, hold_id = %pending.id, error = %void_err, "voiding pending hold failed");
                        }
                    }
                    Err(refund_err) => {
                        warn!(trade_id, hold_id = %pending.id, error = %refund_err, "compensating refund failed, hold left pending");
                    }
                }
                Err(e)
            }
        }
    }

    /// Pays a funded hold out to its recipient. Only legal once the trade has settled.
    pub fn release_escrow(&self, trade_id: &str, actor: &str) -> Result<EscrowHold> {
        let hold = self.store.transaction(|tx| {
            let trade: Trade = tx_load(tx.trades, "trade", trade_id)?;
            if !trade.settled || trade.status == TradeStatus::Disputed {
                return Err(TradeError::InvalidStateTransition {
                    action: "release escrow",
                    status: trade.status,
                }
                .into());
            }
            let mut hold = tx_active_hold(tx, trade_id)?
                .ok_or_else(|| TradeError::NoEscrowFound(trade_id.to_string()))?;
            hold.expect(HoldStatus::Funded)?;
            hold.status = HoldStatus::Releasing;
            hold.touch();
            tx_save_hold(tx, &hold)?;
            Ok(hold)
        })?;

        let provider_hold = match self.provider.release_funds(&hold.id, &hold.recipient_id) {
            Ok(provider_hold) => provider_hold,
            Err(e) => {
                self.restore_funded(&hold);
                return Err(e.into());
            }
        };

        let released = self.store.transaction(|tx| {
            let mut current: EscrowHold = tx_load(tx.holds, "escrow hold", &hold.key())?;
            current.expect(HoldStatus::Releasing)?;
            current.status = HoldStatus::Released;
            current.provider_reference = Some(provider_hold.reference.clone());
            current.touch();
            tx_save_hold(tx, &current)?;

            let mut trade: Trade = tx_load(tx.trades, "trade", trade_id)?;
            audit::record(
                tx,
                &mut trade,
                actor,
                WitnessAction::EscrowReleased {
                    hold_id: current.id.clone(),
                    amount: current.remaining(),
                },
            )?;
            tx_put(tx.trades, trade_id, &trade)?;
            Ok(current)
        })?;

        info!(trade_id, hold_id = %released.id, recipient_id = %released.recipient_id, "escrow released");
        Ok(released)
    }

    /// Returns held funds to the payer, all of them unless `amount` is given. Legal while the
    /// trade is funded but unsettled, or after it was cancelled.
    pub fn refund_escrow(
        &self,
        trade_id: &str,
        amount: Option<u64>,
        actor: &str,
    ) -> Result<EscrowHold> {
        let trade = self.store.get_trade(trade_id)?;
        // retry path for a cancellation whose pending hold could not be unwound
        if trade.status == TradeStatus::Cancelled && amount.is_none() {
            if let Some(hold) = self.active_hold(trade_id)? {
                if hold.status == HoldStatus::Pending {
                    return self
                        .unwind_hold(trade_id, actor)?
                        .ok_or_else(|| TradeError::NoEscrowFound(trade_id.to_string()));
                }
            }
        }
        self.refund_hold(trade_id, amount, actor)
    }

    /// Marks the funded hold `Refunding`, calls the provider, then books the refund. A dispute
    /// cannot freeze the hold while the provider call is in flight.
    fn refund_hold(&self, trade_id: &str, amount: Option<u64>, actor: &str) -> Result<EscrowHold> {
        let (hold, requested) = self.store.transaction(|tx| {
            let trade: Trade = tx_load(tx.trades, "trade", trade_id)?;
            if !matches!(
                trade.status,
                TradeStatus::EscrowFunded | TradeStatus::Cancelled
            ) {
                return Err(TradeError::InvalidStateTransition {
                    action: "refund escrow",
                    status: trade.status,
                }
                .into());
            }
            let mut hold = tx_active_hold(tx, trade_id)?
                .ok_or_else(|| TradeError::NoEscrowFound(trade_id.to_string()))?;
            hold.expect(HoldStatus::Funded)?;

            let remaining = hold.remaining();
            let requested = amount.unwrap_or(remaining);
            if requested == 0 {
                return Err(TradeError::from(ValidationError::ZeroAmount("refund amount")).into());
            }
            if requested > remaining {
                return Err(TradeError::from(ValidationError::RefundExceedsHold {
                    requested,
                    held: remaining,
                })
                .into());
            }
            hold.status = HoldStatus::Refunding;
            hold.touch();
            tx_save_hold(tx, &hold)?;
            Ok((hold, requested))
        })?;

        if let Err(e) = self.provider.refund_held_funds(&hold.id, Some(requested)) {
            self.restore_funded(&hold);
            return Err(e.into());
        }

        let refunded = self.store.transaction(|tx| {
            let mut current: EscrowHold = tx_load(tx.holds, "escrow hold", &hold.key())?;
            current.expect(HoldStatus::Refunding)?;
            current.refunded_amount += requested;
            current.status = if current.remaining() == 0 {
                HoldStatus::Refunded
            } else {
                HoldStatus::Funded
            };
            current.touch();
            tx_save_hold(tx, &current)?;

            let mut trade: Trade = tx_load(tx.trades, "trade", trade_id)?;
            if current.status == HoldStatus::Refunded && trade.status == TradeStatus::EscrowFunded {
                trade.transition(TradeStatus::Accepted, "refund escrow")?;
            }
            audit::record(
                tx,
                &mut trade,
                actor,
                WitnessAction::EscrowRefunded {
                    hold_id: current.id.clone(),
                    amount: requested,
                },
            )?;
            tx_put(tx.trades, trade_id, &trade)?;
            Ok(current)
        })?;

        info!(trade_id, hold_id = %refunded.id, amount = requested, "escrow refunded");
        Ok(refunded)
    }

    /// Puts a hold whose provider call failed back to `Funded` so the call can be retried.
    fn restore_funded(&self, hold: &EscrowHold) {
        let restored = self.store.transaction(|tx| {
            let mut current: EscrowHold = tx_load(tx.holds, "escrow hold", &hold.key())?;
            if matches!(current.status, HoldStatus::Releasing | HoldStatus::Refunding) {
                current.status = HoldStatus::Funded;
                current.touch();
                tx_save_hold(tx, &current)?;
            }
            Ok(())
        });
        if let Err(e) = restored {
            warn!(trade_id = %hold.trade_id, hold_id = %hold.id, error = %e, "hold left in flight after provider failure");
        }
    }

    /// Closes a `Pending` hold as refunded with whatever the provider returned. Returns
    /// `None` when the hold has already left `Pending`.
    fn void_pending(
        &self,
        hold: &EscrowHold,
        refunded: u64,
        actor: &str,
    ) -> Result<Option<EscrowHold>> {
        let voided = self.store.transaction(|tx| {
            let mut current: EscrowHold = tx_load(tx.holds, "escrow hold", &hold.key())?;
            if current.status != HoldStatus::Pending {
                return Ok(None);
            }
            current.status = HoldStatus::Refunded;
            current.refunded_amount = refunded;
            current.touch();
            tx_save_hold(tx, &current)?;

            let mut trade: Trade = tx_load(tx.trades, "trade", &hold.trade_id)?;
            audit::record(
                tx,
                &mut trade,
                actor,
                WitnessAction::EscrowRefunded {
                    hold_id: current.id.clone(),
                    amount: refunded,
                },
            )?;
            tx_put(tx.trades, &hold.trade_id, &trade)?;
            Ok(Some(current))
        })?;
        if let Some(voided) = &voided {
            info!(trade_id = %voided.trade_id, hold_id = %voided.id, refunded, "pending escrow hold voided");
        }
        Ok(voided)
    }

    /// Returns whatever a cancelled trade's active hold still has at the provider, including a
    /// pending hold whose funding call may or may not have landed.
    pub(crate) fn unwind_hold(&self, trade_id: &str, actor: &str) -> Result<Option<EscrowHold>> {
        let Some(hold) = self.active_hold(trade_id)? else {
            return Ok(None);
        };
        match hold.status {
            HoldStatus::Funded => self.refund_hold(trade_id, None, actor).map(Some),
            HoldStatus::Pending => {
                let refunded = match self.provider.get_hold(&hold.id)? {
                    Some(remote) if remote.state == ProviderHoldState::Held => {
                        self.provider.refund_held_funds(&hold.id, None)?;
                        remote.amount - remote.refunded
                    }
                    _ => 0,
                };
                self.void_pending(&hold, refunded, actor)
            }
            HoldStatus::Releasing | HoldStatus::Refunding => {
                Err(TradeError::EscrowBusy(hold.id.clone()))
            }
            _ => Ok(None),
        }
    }
}

/// Freezes or unfreezes a trade's funded hold around a dispute. No-op without a hold. A hold
/// with a provider call in flight cannot be frozen.
pub(crate) fn tx_set_dispute_freeze(tx: &Tx<'_>, trade_id: &str, frozen: bool) -> TxResult<()> {
    let Some(mut hold) = tx_active_hold(tx, trade_id)? else {
        return Ok(());
    };
    if frozen && matches!(hold.status, HoldStatus::Releasing | HoldStatus::Refunding) {
        return Err(TradeError::EscrowBusy(hold.id.clone()).into());
    }
    let (from, to) = if frozen {
        (HoldStatus::Funded, HoldStatus::Disputed)
    } else {
        (HoldStatus::Disputed, HoldStatus::Funded)
    };
    if hold.status == from {
        hold.status = to;
        hold.touch();
        tx_save_hold(tx, &hold)?;
    }
    Ok(())
}
