//! Blind mutual ratings that gate a settled trade's completion.
use super::audit::{self, WitnessAction};
use super::error::{Result, TradeError, ValidationError};
use super::notify::TradeEvent;
use super::service::TradeService;
use super::store::{Tx, TxResult, compound_key, get, tx_get, tx_load, tx_put};
use super::trade::{TimeStamp, Trade, TradeStatus};
use super::utils::{RATING_HRP, new_id};
use chrono::{DateTime, Utc};
use tracing::{debug, info};

/// Actor recorded on transitions the marketplace makes on its own.
pub const SYSTEM_ACTOR: &str = "system";

#[derive(minicbor::Encode, minicbor::Decode, Debug, Clone, Copy, PartialEq, Eq)]
pub struct RatingScores {
    #[n(0)]
    pub overall: u8,
    #[n(1)]
    pub communication: Option<u8>,
    #[n(2)]
    pub accuracy: Option<u8>,
    #[n(3)]
    pub shipping: Option<u8>,
}

impl RatingScores {
    pub fn new(overall: u8) -> Self {
        Self {
            overall,
            communication: None,
            accuracy: None,
            shipping: None,
        }
    }
    pub fn communication(mut self, score: u8) -> Self {
        self.communication = Some(score);
        self
    }
    pub fn accuracy(mut self, score: u8) -> Self {
        self.accuracy = Some(score);
        self
    }
    pub fn shipping(mut self, score: u8) -> Self {
        self.shipping = Some(score);
        self
    }

    /// Every score given must be within 1..=5.
    pub fn validate(&self) -> Result<(), ValidationError> {
        let scores = [
            ("overall", Some(self.overall)),
            ("communication", self.communication),
            ("accuracy", self.accuracy),
            ("shipping", self.shipping),
        ];
        for (field, score) in scores {
            if let Some(score) = score.filter(|s| !(1..=5).contains(s)) {
                return Err(ValidationError::ScoreOutOfRange { field, score });
            }
        }
        Ok(())
    }
}

#[derive(minicbor::Encode, minicbor::Decode, Debug, Clone, PartialEq, Eq)]
pub struct TradeRating {
    #[n(0)]
    pub id: String,
    #[n(1)]
    pub trade_id: String,
    #[n(2)]
    pub rater_id: String,
    #[n(3)]
    pub ratee_id: String,
    #[n(4)]
    pub scores: RatingScores,
    #[n(5)]
    pub comments: Option<String>,
    #[n(6)]
    pub is_revealed: bool,
    #[n(7)]
    pub created_at: TimeStamp<Utc>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RatingOutcome {
    pub rating_id: String,
    pub both_rated: bool,
    pub trade_status: TradeStatus,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Reputation {
    pub user_id: String,
    pub rating_count: usize,
    pub average_overall: Option<f64>,
}

/// Marks every stored rating of the trade as revealed.
fn tx_reveal_all(tx: &Tx<'_>, trade: &Trade) -> TxResult<()> {
    for rater_id in [&trade.proposer_id, &trade.receiver_id] {
        let key = compound_key(&trade.id, rater_id);
        if let Some(mut rating) = tx_get::<TradeRating>(tx.ratings, &key)? {
            if !rating.is_revealed {
                rating.is_revealed = true;
                tx_put(tx.ratings, &key, &rating)?;
            }
        }
    }
    Ok(())
}

impl TradeService {
    /// Records the rater's blind rating of their partner. The second rating reveals both and
    /// completes the trade in the same transaction.
    pub fn rate_trade(
        &self,
        trade_id: &str,
        rater_id: &str,
        scores: RatingScores,
        comments: Option<String>,
    ) -> Result<RatingOutcome> {
        scores.validate()?;
        let rating_id = new_id(RATING_HRP);

        let (trade, ratee_id) = self.store.transaction(|tx| {
            let mut trade: Trade = tx_load(tx.trades, "trade", trade_id)?;
            let party = trade
                .party_of(rater_id)
                .ok_or_else(|| TradeError::forbidden(rater_id, "rate this trade"))?;
            if !matches!(
                trade.status,
                TradeStatus::CompletedAwaitingRating | TradeStatus::Completed
            ) {
                return Err(TradeError::InvalidStateTransition {
                    action: "rate",
                    status: trade.status,
                }
                .into());
            }
            let key = compound_key(trade_id, rater_id);
            if trade.progress(party).rated || tx_get::<TradeRating>(tx.ratings, &key)?.is_some() {
                return Err(TradeError::AlreadyRated {
                    trade_id: trade_id.to_string(),
                    rater_id: rater_id.to_string(),
                }
                .into());
            }

            let ratee_id = trade.user_of(party.other()).to_string();
            let rating = TradeRating {
                id: rating_id.clone(),
                trade_id: trade_id.to_string(),
                rater_id: rater_id.to_string(),
                ratee_id: ratee_id.clone(),
                scores,
                comments: comments.clone(),
                // after the window closed nothing is left to wait for
                is_revealed: trade.status == TradeStatus::Completed,
                created_at: TimeStamp::new(),
            };
            tx_put(tx.ratings, &key, &rating)?;
            trade.progress_mut(party).rated = true;
            audit::record(
                tx,
                &mut trade,
                rater_id,
                WitnessAction::Rated {
                    rating_id: rating_id.clone(),
                },
            )?;

            if trade.both_rated() {
                tx_reveal_all(tx, &trade)?;
                if trade.status == TradeStatus::CompletedAwaitingRating {
                    trade.transition(TradeStatus::Completed, "reveal ratings")?;
                }
                audit::record(tx, &mut trade, rater_id, WitnessAction::RatingsRevealed)?;
            }
            tx_put(tx.trades, trade_id, &trade)?;
            Ok((trade, ratee_id))
        })?;

        let both_rated = trade.both_rated();
        info!(trade_id, rater_id, both_rated, "trade rated");
        self.notify(
            &ratee_id,
            TradeEvent::RatingReceived,
            trade_id,
            "Your trade partner has left a rating.",
        );
        if both_rated {
            for user_id in [&trade.proposer_id, &trade.receiver_id] {
                self.notify(
                    user_id,
                    TradeEvent::RatingsRevealed,
                    trade_id,
                    "Both ratings are in and are now visible.",
                );
            }
        }
        Ok(RatingOutcome {
            rating_id,
            both_rated,
            trade_status: trade.status,
        })
    }

    /// Ratings of a trade as `viewer_id` may see them: their own, and their partner's once
    /// revealed.
    pub fn ratings_for_trade(&self, trade_id: &str, viewer_id: &str) -> Result<Vec<TradeRating>> {
        let trade = self.store.get_trade(trade_id)?;
        if trade.party_of(viewer_id).is_none() {
            return Err(TradeError::forbidden(viewer_id, "view ratings of this trade"));
        }
        let ratings: Vec<TradeRating> = self.store.scan_records(&self.store.ratings, trade_id)?;
        Ok(ratings
            .into_iter()
            .filter(|r| r.rater_id == viewer_id || r.is_revealed)
            .collect())
    }

    /// Average overall score over the revealed ratings the user has received.
    pub fn user_reputation(&self, user_id: &str) -> Result<Reputation> {
        self.store.get_user(user_id)?;
        let mut scores = vec![];
        for trade_id in self.store.index_suffixes(&self.store.user_trades, user_id)? {
            let ratings: Vec<TradeRating> =
                self.store.scan_records(&self.store.ratings, &trade_id)?;
            scores.extend(
                ratings
                    .into_iter()
                    .filter(|r| r.ratee_id == user_id && r.is_revealed)
                    .map(|r| f64::from(r.scores.overall)),
            );
        }
        let average_overall =
            (!scores.is_empty()).then(|| scores.iter().sum::<f64>() / scores.len() as f64);
        Ok(Reputation {
            user_id: user_id.to_string(),
            rating_count: scores.len(),
            average_overall,
        })
    }

    pub fn get_rating(&self, trade_id: &str, rater_id: &str) -> Result<TradeRating> {
        let key = compound_key(trade_id, rater_id);
        get(&self.store.ratings, &key)?.ok_or_else(|| TradeError::not_found("rating", key))
    }

    /// Completes every trade whose rating deadline is at or before `now`, revealing whatever
    /// ratings were submitted. Returns the ids of the trades it closed.
    pub fn close_expired_rating_windows(&self, now: DateTime<Utc>) -> Result<Vec<String>> {
        let mut expired = vec![];
        for entry in self.store.trades.iter() {
            let (_, bytes) = entry?;
            let trade: Trade = minicbor::decode(&bytes)?;
            let due = trade
                .rating_deadline
                .as_ref()
                .is_some_and(|deadline| deadline.to_datetime_utc() <= now);
            if trade.status == TradeStatus::CompletedAwaitingRating && due {
                expired.push(trade.id);
            }
        }

        let mut closed = vec![];
        for trade_id in expired {
            let was_closed = self.store.transaction(|tx| {
                let mut trade: Trade = tx_load(tx.trades, "trade", &trade_id)?;
                // rated or disputed since the scan
                if trade.status != TradeStatus::CompletedAwaitingRating {
                    return Ok(false);
                }
                trade.transition(TradeStatus::Completed, "close rating window")?;
                tx_reveal_all(tx, &trade)?;
                audit::record(tx, &mut trade, SYSTEM_ACTOR, WitnessAction::RatingWindowClosed)?;
                tx_put(tx.trades, &trade_id, &trade)?;
                Ok(true)
            })?;
            if was_closed {
                debug!(trade_id = %trade_id, "rating window closed");
                closed.push(trade_id);
            }
        }
        if !closed.is_empty() {
            info!(count = closed.len(), "expired rating windows closed");
        }
        Ok(closed)
    }
}
