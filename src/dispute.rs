//! Disputes: a side state machine that freezes a trade while a mediator decides it.
//!
//! The dispute record is authoritative. The trade's `Disputed` status is a projection kept in
//! step with it, and the state the trade had before is kept on the dispute so a resolution can
//! put it back.
use super::audit::{self, WitnessAction};
use super::error::{Result, TradeError, ValidationError};
use super::escrow::{HoldStatus, tx_active_hold, tx_set_dispute_freeze};
use super::ledger::tx_set_reservation;
use super::notify::TradeEvent;
use super::service::TradeService;
use super::settlement::settle;
use super::store::{get, tx_get_str, tx_load, tx_put, tx_put_str, tx_remove};
use super::trade::{TimeStamp, Trade, TradeStatus};
use super::utils::{DISPUTE_HRP, new_id};
use chrono::Utc;
use tracing::{info, warn};

#[derive(minicbor::Encode, minicbor::Decode, Debug, Clone, Copy, PartialEq, Eq)]
pub enum DisputeType {
    #[n(0)]
    ItemNotReceived,
    #[n(1)]
    ItemNotAsDescribed,
    #[n(2)]
    ItemDamaged,
    #[n(3)]
    WrongItem,
    #[n(4)]
    Other,
}

#[derive(minicbor::Encode, minicbor::Decode, Debug, Clone, Copy, PartialEq, Eq)]
pub enum DisputeStatus {
    #[n(0)]
    OpenAwaitingResponse,
    #[n(1)]
    InMediation,
    #[n(2)]
    Resolved,
}

impl DisputeStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            DisputeStatus::OpenAwaitingResponse => "OPEN_AWAITING_RESPONSE",
            DisputeStatus::InMediation => "IN_MEDIATION",
            DisputeStatus::Resolved => "RESOLVED",
        }
    }
}

#[derive(minicbor::Encode, minicbor::Decode, Debug, Clone, Copy, PartialEq, Eq)]
pub enum Resolution {
    #[n(0)]
    RefundInitiator,
    #[n(1)]
    MutuallyResolved,
    #[n(2)]
    TradeUpheld,
}

#[derive(minicbor::Encode, minicbor::Decode, Debug, Clone, PartialEq, Eq)]
pub struct Dispute {
    #[n(0)]
    pub id: String,
    #[n(1)]
    pub trade_id: String,
    #[n(2)]
    pub initiator_id: String,
    #[n(3)]
    pub respondent_id: String,
    #[n(4)]
    pub dispute_type: DisputeType,
    #[n(5)]
    pub statement: String,
    #[n(6)]
    pub response: Option<String>,
    #[n(7)]
    pub status: DisputeStatus,
    #[n(8)]
    pub prior_status: TradeStatus,
    #[n(9)]
    pub resolution: Option<Resolution>,
    #[n(10)]
    pub resolution_notes: Option<String>,
    #[n(11)]
    pub created_at: TimeStamp<Utc>,
    #[n(12)]
    pub updated_at: TimeStamp<Utc>,
}

impl Dispute {
    fn invalid(&self, action: &'static str) -> TradeError {
        TradeError::InvalidDisputeState {
            dispute_id: self.id.clone(),
            action,
            status: self.status.as_str(),
        }
    }
}

/// Escrow work a resolution leaves for after its transaction commits.
enum FollowUp {
    None,
    Refund,
    Release,
}

impl TradeService {
    pub fn open_dispute(
        &self,
        trade_id: &str,
        initiator_id: &str,
        dispute_type: DisputeType,
        statement: &str,
    ) -> Result<Dispute> {
        if statement.trim().is_empty() {
            return Err(ValidationError::Blank("dispute statement").into());
        }
        let dispute_id = new_id(DISPUTE_HRP);

        let dispute = self.store.transaction(|tx| {
            let mut trade: Trade = tx_load(tx.trades, "trade", trade_id)?;
            let party = trade
                .party_of(initiator_id)
                .ok_or_else(|| TradeError::forbidden(initiator_id, "dispute this trade"))?;
            if tx_get_str(tx.active_disputes, trade_id)?.is_some() {
                return Err(TradeError::DisputeAlreadyOpen(trade_id.to_string()).into());
            }
            if !matches!(
                trade.status,
                TradeStatus::Accepted
                    | TradeStatus::EscrowFunded
                    | TradeStatus::CompletedAwaitingRating
            ) {
                return Err(TradeError::InvalidStateTransition {
                    action: "open a dispute on",
                    status: trade.status,
                }
                .into());
            }

            let now = TimeStamp::new();
            let dispute = Dispute {
                id: dispute_id.clone(),
                trade_id: trade_id.to_string(),
                initiator_id: initiator_id.to_string(),
                respondent_id: trade.user_of(party.other()).to_string(),
                dispute_type,
                statement: statement.to_string(),
                response: None,
                status: DisputeStatus::OpenAwaitingResponse,
                prior_status: trade.status,
                resolution: None,
                resolution_notes: None,
                created_at: now.clone(),
                updated_at: now,
            };
            trade.transition(TradeStatus::Disputed, "open a dispute on")?;
            trade.dispute_id = Some(dispute.id.clone());
            tx_set_dispute_freeze(tx, trade_id, true)?;
            audit::record(
                tx,
                &mut trade,
                initiator_id,
                WitnessAction::DisputeOpened {
                    dispute_id: dispute.id.clone(),
                },
            )?;

            tx_put(tx.disputes, &dispute.id, &dispute)?;
            tx_put_str(tx.active_disputes, trade_id, &dispute.id)?;
            tx_put(tx.trades, trade_id, &trade)?;
            Ok(dispute)
        })?;

        info!(trade_id, dispute_id = %dispute.id, initiator_id, "dispute opened");
        self.notify(
            &dispute.respondent_id,
            TradeEvent::DisputeOpened,
            trade_id,
            "Your trade partner opened a dispute. Please respond.",
        );
        Ok(dispute)
    }

    /// The other party answers the dispute, which hands it to mediation.
    pub fn respond_dispute(
        &self,
        dispute_id: &str,
        respondent_id: &str,
        statement: &str,
    ) -> Result<Dispute> {
        if statement.trim().is_empty() {
            return Err(ValidationError::Blank("dispute response").into());
        }
        let dispute = self.store.transaction(|tx| {
            let mut dispute: Dispute = tx_load(tx.disputes, "dispute", dispute_id)?;
            if respondent_id != dispute.respondent_id {
                return Err(TradeError::forbidden(respondent_id, "respond to this dispute").into());
            }
            if dispute.status != DisputeStatus::OpenAwaitingResponse {
                return Err(dispute.invalid("take a response").into());
            }
            dispute.response = Some(statement.to_string());
            dispute.status = DisputeStatus::InMediation;
            dispute.updated_at = TimeStamp::new();
            tx_put(tx.disputes, dispute_id, &dispute)?;
            Ok(dispute)
        })?;

        info!(dispute_id, trade_id = %dispute.trade_id, "dispute in mediation");
        self.notify(
            &dispute.initiator_id,
            TradeEvent::DisputeResponse,
            &dispute.trade_id,
            "Your trade partner responded to the dispute.",
        );
        Ok(dispute)
    }

    /// Mediator closes the dispute and applies the resolution to the trade and its escrow.
    ///
    /// Before settlement a refund cancels the trade and returns the escrow to its payer, an
    /// upheld funded trade settles and pays out, and anything else puts the trade back where
    /// it was. After settlement every resolution puts the trade back to awaiting ratings.
    /// Escrow calls happen after the resolution commits; if one fails the error is returned
    /// and [`TradeService::refund_escrow`] or [`TradeService::release_escrow`] retries it.
    pub fn resolve_dispute(
        &self,
        dispute_id: &str,
        mediator_id: &str,
        resolution: Resolution,
        notes: Option<String>,
    ) -> Result<Dispute> {
        let rating_window = self.rating_window;
        let (dispute, trade, settlement, follow_up) = self.store.transaction(|tx| {
            let mut dispute: Dispute = tx_load(tx.disputes, "dispute", dispute_id)?;
            if dispute.status == DisputeStatus::Resolved {
                return Err(dispute.invalid("be resolved").into());
            }
            let mut trade: Trade = tx_load(tx.trades, "trade", &dispute.trade_id)?;
            let trade_id = trade.id.clone();

            dispute.status = DisputeStatus::Resolved;
            dispute.resolution = Some(resolution);
            dispute.resolution_notes = notes.clone();
            dispute.updated_at = TimeStamp::new();
            tx_put(tx.disputes, dispute_id, &dispute)?;
            tx_remove(tx.active_disputes, &trade_id)?;
            tx_set_dispute_freeze(tx, &trade_id, false)?;
            audit::record(
                tx,
                &mut trade,
                mediator_id,
                WitnessAction::DisputeResolved {
                    dispute_id: dispute_id.to_string(),
                    resolution,
                },
            )?;

            let funded = tx_active_hold(tx, &trade_id)?
                .is_some_and(|hold| hold.status == HoldStatus::Funded);
            let mut settlement = None;
            let follow_up = match (trade.settled, resolution) {
                (true, _) => {
                    trade.transition(dispute.prior_status, "resolve dispute")?;
                    if funded { FollowUp::Release } else { FollowUp::None }
                }
                (false, Resolution::RefundInitiator) => {
                    trade.transition(TradeStatus::Cancelled, "refund a disputed trade")?;
                    tx_set_reservation(tx, &trade.terms, &trade_id, false)?;
                    audit::record(tx, &mut trade, mediator_id, WitnessAction::Cancelled)?;
                    FollowUp::Refund
                }
                (false, Resolution::TradeUpheld) if funded => {
                    settlement = Some(settle(tx, &mut trade, mediator_id, rating_window)?);
                    FollowUp::Release
                }
                (false, _) => {
                    trade.transition(dispute.prior_status, "resolve dispute")?;
                    FollowUp::None
                }
            };
            tx_put(tx.trades, &trade_id, &trade)?;
            Ok((dispute, trade, settlement, follow_up))
        })?;

        info!(
            dispute_id,
            trade_id = %trade.id,
            resolution = ?resolution,
            status = %trade.status,
            "dispute resolved"
        );
        for user_id in [&trade.proposer_id, &trade.receiver_id] {
            self.notify(
                user_id,
                TradeEvent::DisputeResolved,
                &trade.id,
                format!("The dispute was resolved: {resolution:?}"),
            );
        }
        if let Some(settlement) = &settlement {
            self.after_settlement(settlement);
        }

        let escrow_result = match follow_up {
            FollowUp::None => Ok(()),
            FollowUp::Refund => self
                .escrow
                .unwind_hold(&trade.id, mediator_id)
                .map(|hold| hold.iter().for_each(|h| self.notify_refund(h))),
            FollowUp::Release => self.release_escrow(&trade.id, mediator_id).map(|_| ()),
        };
        escrow_result.map_err(|e| {
            warn!(dispute_id, trade_id = %trade.id, error = %e, "escrow follow-up after resolution failed");
            e
        })?;
        Ok(dispute)
    }

    pub fn get_dispute(&self, dispute_id: &str) -> Result<Dispute> {
        get(&self.store.disputes, dispute_id)?
            .ok_or_else(|| TradeError::not_found("dispute", dispute_id))
    }

    /// The dispute currently holding the trade, if any.
    pub fn active_dispute(&self, trade_id: &str) -> Result<Option<Dispute>> {
        match self.store.active_disputes.get(trade_id.as_bytes())? {
            Some(id) => self.get_dispute(&String::from_utf8_lossy(&id)).map(Some),
            None => Ok(None),
        }
    }
}
