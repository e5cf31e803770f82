//! Core trade record, lifecycle states and offered terms
use super::error::{Result, ValidationError};
use chrono::{DateTime, Duration, TimeZone, Utc};
use std::collections::HashSet;

#[derive(Debug, PartialEq, Eq, PartialOrd, Ord, Clone)]
pub struct TimeStamp<T: TimeZone>(DateTime<T>);

impl TimeStamp<Utc> {
    pub fn new() -> Self {
        Self(Utc::now())
    }
    pub fn new_with(
        year: i32,
        month: u32,
        day: u32,
        hour: u32,
        min: u32,
        sec: u32,
    ) -> Option<Self> {
        Utc.with_ymd_and_hms(year, month, day, hour, min, sec)
            .single()
            .map(Self)
    }
    pub fn to_datetime_utc(&self) -> DateTime<Utc> {
        self.0
    }
    pub fn plus(&self, duration: Duration) -> Self {
        Self(self.0 + duration)
    }
}

impl Default for TimeStamp<Utc> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T: TimeZone> From<DateTime<T>> for TimeStamp<T> {
    fn from(value: DateTime<T>) -> Self {
        TimeStamp(value)
    }
}

impl<C> minicbor::Encode<C> for TimeStamp<Utc> {
    fn encode<W: minicbor::encode::Write>(
        &self,
        e: &mut minicbor::Encoder<W>,
        _: &mut C,
    ) -> Result<(), minicbor::encode::Error<W::Error>> {
        if let Some(nsec) = self.0.timestamp_nanos_opt() {
            return e.i64(nsec)?.ok();
        }

        Err(minicbor::encode::Error::message(
            "failed to encode timestamp. timestamp_nanos_opt returned None",
        ))
    }
}

impl<'b, C> minicbor::Decode<'b, C> for TimeStamp<Utc> {
    fn decode(d: &mut minicbor::Decoder<'b>, _: &mut C) -> Result<Self, minicbor::decode::Error> {
        let nsecs = d.i64()?;

        Ok(TimeStamp(DateTime::from_timestamp_nanos(nsecs)))
    }
}

/// Lifecycle states of a trade.
///
/// `Rejected`, `Cancelled`, `Countered` and `Completed` are terminal. `Disputed` is a
/// projection of an open dispute; the dispute record carries the authoritative sub-state.
#[derive(minicbor::Encode, minicbor::Decode, Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TradeStatus {
    #[n(0)]
    Proposed,
    #[n(1)]
    Accepted,
    #[n(2)]
    Rejected,
    #[n(3)]
    Cancelled,
    #[n(4)]
    Countered,
    #[n(5)]
    EscrowFunded,
    #[n(6)]
    CompletedAwaitingRating,
    #[n(7)]
    Completed,
    #[n(8)]
    Disputed,
}

impl TradeStatus {
    pub const ALL: [TradeStatus; 9] = [
        TradeStatus::Proposed,
        TradeStatus::Accepted,
        TradeStatus::Rejected,
        TradeStatus::Cancelled,
        TradeStatus::Countered,
        TradeStatus::EscrowFunded,
        TradeStatus::CompletedAwaitingRating,
        TradeStatus::Completed,
        TradeStatus::Disputed,
    ];

    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            TradeStatus::Rejected
                | TradeStatus::Cancelled
                | TradeStatus::Countered
                | TradeStatus::Completed
        )
    }

    /// The directed transition graph. Nothing ever leads back to `Proposed`.
    pub fn can_transition_to(self, next: TradeStatus) -> bool {
        use TradeStatus::*;
        match self {
            Proposed => matches!(
                next,
                Accepted | Rejected | Cancelled | Countered | CompletedAwaitingRating
            ),
            // a full escrow refund drops a funded trade back to accepted
            Accepted => matches!(next, EscrowFunded | Cancelled | Disputed),
            EscrowFunded => matches!(
                next,
                Accepted | Cancelled | Disputed | CompletedAwaitingRating
            ),
            CompletedAwaitingRating => matches!(next, Completed | Disputed),
            Disputed => matches!(
                next,
                Accepted | EscrowFunded | Cancelled | CompletedAwaitingRating
            ),
            Rejected | Cancelled | Countered | Completed => false,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            TradeStatus::Proposed => "PROPOSED",
            TradeStatus::Accepted => "ACCEPTED",
            TradeStatus::Rejected => "REJECTED",
            TradeStatus::Cancelled => "CANCELLED",
            TradeStatus::Countered => "COUNTERED",
            TradeStatus::EscrowFunded => "ESCROW_FUNDED",
            TradeStatus::CompletedAwaitingRating => "COMPLETED_AWAITING_RATING",
            TradeStatus::Completed => "COMPLETED",
            TradeStatus::Disputed => "DISPUTED",
        }
    }
}

impl std::fmt::Display for TradeStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Party {
    Proposer,
    Receiver,
}

impl Party {
    pub fn other(self) -> Party {
        match self {
            Party::Proposer => Party::Receiver,
            Party::Receiver => Party::Proposer,
        }
    }
}

/// The items and cash each side puts into a trade, in minor currency units.
#[derive(minicbor::Encode, minicbor::Decode, Debug, Default, Clone, PartialEq, Eq)]
pub struct TradeTerms {
    #[n(0)]
    pub proposer_item_ids: Vec<String>,
    #[n(1)]
    pub receiver_item_ids: Vec<String>,
    #[n(2)]
    pub proposer_cash: u64,
    #[n(3)]
    pub receiver_cash: u64,
}

impl TradeTerms {
    pub fn new() -> Self {
        Self::default()
    }
    pub fn offer_items<I, S>(mut self, item_ids: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.proposer_item_ids = item_ids.into_iter().map(Into::into).collect();
        self
    }
    pub fn request_items<I, S>(mut self, item_ids: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.receiver_item_ids = item_ids.into_iter().map(Into::into).collect();
        self
    }
    pub fn offer_cash(mut self, amount: u64) -> Self {
        self.proposer_cash = amount;
        self
    }
    pub fn request_cash(mut self, amount: u64) -> Self {
        self.receiver_cash = amount;
        self
    }

    /// Every item id on both sides, proposer side first.
    pub fn all_item_ids(&self) -> impl Iterator<Item = &String> {
        self.proposer_item_ids
            .iter()
            .chain(self.receiver_item_ids.iter())
    }

    pub fn items_of(&self, party: Party) -> &[String] {
        match party {
            Party::Proposer => &self.proposer_item_ids,
            Party::Receiver => &self.receiver_item_ids,
        }
    }

    pub fn cash_of(&self, party: Party) -> u64 {
        match party {
            Party::Proposer => self.proposer_cash,
            Party::Receiver => self.receiver_cash,
        }
    }

    /// Checks the terms are non-empty and no item is listed twice, then returns the
    /// sha256 of the terms serialised into cbor.
    pub fn validate_and_finalise(&self) -> Result<String> {
        let nothing_offered = self.proposer_item_ids.is_empty() && self.proposer_cash == 0;
        let nothing_asked = self.receiver_item_ids.is_empty() && self.receiver_cash == 0;
        if nothing_offered && nothing_asked {
            return Err(ValidationError::EmptyOffer.into());
        }

        let mut seen = HashSet::new();
        for item_id in self.all_item_ids() {
            if !seen.insert(item_id.as_str()) {
                return Err(ValidationError::DuplicateItem(item_id.clone()).into());
            }
        }

        let contents = minicbor::to_vec(self)?;
        Ok(sha256::digest(&contents))
    }
}

/// Shipping, verification and rating progress of one side of a trade.
#[derive(minicbor::Encode, minicbor::Decode, Debug, Default, Clone, PartialEq, Eq)]
pub struct PartyProgress {
    #[n(0)]
    pub tracking_number: Option<String>,
    #[n(1)]
    pub carrier: Option<String>,
    #[n(2)]
    pub tracking_submitted: bool,
    #[n(3)]
    pub satisfaction_verified: bool,
    #[n(4)]
    pub rated: bool,
}

#[derive(minicbor::Encode, minicbor::Decode, Debug, Clone, PartialEq, Eq)]
pub struct Trade {
    #[n(0)]
    pub id: String,
    #[n(1)]
    pub proposer_id: String,
    #[n(2)]
    pub receiver_id: String,
    #[n(3)]
    pub terms: TradeTerms,
    #[n(4)]
    pub terms_hash: String,
    #[n(5)]
    pub status: TradeStatus,
    #[n(6)]
    pub parent_trade_id: Option<String>,
    #[n(7)]
    pub counter_message: Option<String>,
    #[n(8)]
    pub proposer_progress: PartyProgress,
    #[n(9)]
    pub receiver_progress: PartyProgress,
    #[n(10)]
    pub settled: bool,
    #[n(11)]
    pub rating_deadline: Option<TimeStamp<Utc>>,
    #[n(12)]
    pub dispute_id: Option<String>,
    #[n(13)]
    pub created_at: TimeStamp<Utc>,
    #[n(14)]
    pub updated_at: TimeStamp<Utc>,
    #[n(15)]
    pub witness_count: u32,
    #[n(16)]
    pub head_hash: Option<String>, // sha256 of the latest witness
}

impl Trade {
    pub(crate) fn new(
        id: String,
        proposer_id: String,
        receiver_id: String,
        terms: TradeTerms,
        terms_hash: String,
    ) -> Self {
        let now = TimeStamp::new();
        Self {
            id,
            proposer_id,
            receiver_id,
            terms,
            terms_hash,
            status: TradeStatus::Proposed,
            parent_trade_id: None,
            counter_message: None,
            proposer_progress: PartyProgress::default(),
            receiver_progress: PartyProgress::default(),
            settled: false,
            rating_deadline: None,
            dispute_id: None,
            created_at: now.clone(),
            updated_at: now,
            witness_count: 0,
            head_hash: None,
        }
    }

    pub fn party_of(&self, user_id: &str) -> Option<Party> {
        if user_id == self.proposer_id {
            Some(Party::Proposer)
        } else if user_id == self.receiver_id {
            Some(Party::Receiver)
        } else {
            None
        }
    }

    pub fn user_of(&self, party: Party) -> &str {
        match party {
            Party::Proposer => &self.proposer_id,
            Party::Receiver => &self.receiver_id,
        }
    }

    pub fn progress(&self, party: Party) -> &PartyProgress {
        match party {
            Party::Proposer => &self.proposer_progress,
            Party::Receiver => &self.receiver_progress,
        }
    }

    pub fn progress_mut(&mut self, party: Party) -> &mut PartyProgress {
        match party {
            Party::Proposer => &mut self.proposer_progress,
            Party::Receiver => &mut self.receiver_progress,
        }
    }

    pub fn both_verified(&self) -> bool {
        self.proposer_progress.satisfaction_verified && self.receiver_progress.satisfaction_verified
    }

    pub fn both_rated(&self) -> bool {
        self.proposer_progress.rated && self.receiver_progress.rated
    }

    /// Moves to `next` if the edge exists in the status graph.
    pub(crate) fn transition(
        &mut self,
        next: TradeStatus,
        action: &'static str,
    ) -> Result<()> {
        if !self.status.can_transition_to(next) {
            return Err(super::error::TradeError::InvalidStateTransition {
                action,
                status: self.status,
            });
        }
        self.status = next;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn timestamp_encoding() {
        let original = TimeStamp::new();

        let encoding = minicbor::to_vec(original.clone()).unwrap();
        let decode: TimeStamp<Utc> = minicbor::decode(&encoding).unwrap();

        assert_eq!(original, decode);
    }

    #[test]
    fn terms_reject_duplicate_items() {
        let terms = TradeTerms::new()
            .offer_items(["item_a"])
            .request_items(["item_a"]);

        assert_eq!(
            terms.validate_and_finalise().unwrap_err().to_string(),
            ValidationError::DuplicateItem("item_a".into()).to_string()
        );
    }

    #[test]
    fn identical_terms_hash_identically() {
        let a = TradeTerms::new().offer_items(["item_a"]).offer_cash(1_000);
        let b = TradeTerms::new().offer_items(["item_a"]).offer_cash(1_000);
        let c = TradeTerms::new().offer_items(["item_a"]).offer_cash(1_001);

        assert_eq!(
            a.validate_and_finalise().unwrap(),
            b.validate_and_finalise().unwrap()
        );
        assert_ne!(
            a.validate_and_finalise().unwrap(),
            c.validate_and_finalise().unwrap()
        );
    }

    #[test]
    fn terminal_states_have_no_exits() {
        for from in TradeStatus::ALL.into_iter().filter(|s| s.is_terminal()) {
            for to in TradeStatus::ALL {
                assert!(!from.can_transition_to(to), "{from} -> {to}");
            }
        }
    }

    #[test]
    fn trade_record_roundtrips_through_cbor() {
        let mut trade = Trade::new(
            "trade_1".into(),
            "user_1".into(),
            "user_2".into(),
            TradeTerms::new().offer_items(["item_1"]).offer_cash(500),
            "hash".into(),
        );
        trade.proposer_progress.tracking_number = Some("1Z999".into());

        let encoded = minicbor::to_vec(&trade).unwrap();
        let decoded: Trade = minicbor::decode(&encoded).unwrap();
        assert_eq!(trade, decoded);
    }
}
