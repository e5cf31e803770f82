//! Hash-chained audit trail of every transition a trade goes through.
use super::dispute::Resolution;
use super::error::TradeError;
use super::store::{Tx, TxResult, compound_key, tx_put};
use super::trade::{TimeStamp, Trade};
use chrono::Utc;

#[derive(Debug, PartialEq, Eq, minicbor::Encode, minicbor::Decode, Clone)]
pub struct Witness {
    #[n(0)]
    pub trade_id: String, // a unique string that is a reference to [`Trade`]
    #[n(1)]
    pub actor: String,
    #[n(2)]
    pub timestamp: TimeStamp<Utc>,
    #[n(3)]
    pub action: WitnessAction,
    #[n(4)]
    pub prev_hash: Option<String>,
}

#[derive(Debug, PartialEq, Eq, minicbor::Encode, minicbor::Decode, Clone)]
pub enum WitnessAction {
    #[n(0)]
    Proposed {
        #[n(0)]
        terms_hash: String,
    },
    #[n(1)]
    Accepted,
    #[n(2)]
    Rejected,
    #[n(3)]
    Cancelled,
    #[n(4)]
    Countered {
        #[n(0)]
        counter_trade_id: String,
    },
    #[n(5)]
    EscrowFunded {
        #[n(0)]
        hold_id: String,
        #[n(1)]
        amount: u64,
    },
    #[n(6)]
    EscrowReleased {
        #[n(0)]
        hold_id: String,
        #[n(1)]
        amount: u64,
    },
    #[n(7)]
    EscrowRefunded {
        #[n(0)]
        hold_id: String,
        #[n(1)]
        amount: u64,
    },
    #[n(8)]
    TrackingSubmitted {
        #[n(0)]
        carrier: String,
        #[n(1)]
        tracking_number: String,
    },
    #[n(9)]
    Verified,
    #[n(10)]
    Settled,
    #[n(11)]
    Rated {
        #[n(0)]
        rating_id: String,
    },
    #[n(12)]
    RatingsRevealed,
    #[n(13)]
    DisputeOpened {
        #[n(0)]
        dispute_id: String,
    },
    #[n(14)]
    DisputeResolved {
        #[n(0)]
        dispute_id: String,
        #[n(1)]
        resolution: Resolution,
    },
    #[n(15)]
    RatingWindowClosed,
}

impl Witness {
    pub fn new(
        trade_id: String,
        actor: String,
        timestamp: TimeStamp<Utc>,
        action: WitnessAction,
        prev_hash: Option<String>,
    ) -> Self {
        Self {
            trade_id,
            actor,
            timestamp,
            action,
            prev_hash,
        }
    }
    pub fn build(&self) -> anyhow::Result<(String, Vec<u8>)> {
        super::utils::hash_cbor(self)
    }
}

pub(crate) fn witness_key(trade_id: &str, sequence: u32) -> String {
    compound_key(trade_id, &format!("{sequence:010}"))
}

/// Appends a witness for `trade` and advances its head hash. The caller writes the trade.
pub(crate) fn record(
    tx: &Tx<'_>,
    trade: &mut Trade,
    actor: &str,
    action: WitnessAction,
) -> TxResult<()> {
    let witness = Witness::new(
        trade.id.clone(),
        actor.to_string(),
        TimeStamp::new(),
        action,
        trade.head_hash.clone(),
    );
    let (hash, _) = witness
        .build()
        .map_err(|e| TradeError::Codec(e.to_string()))?;

    tx_put(tx.witnesses, &witness_key(&trade.id, trade.witness_count), &witness)?;
    trade.witness_count += 1;
    trade.head_hash = Some(hash);
    trade.updated_at = witness.timestamp;
    Ok(())
}

/// Recomputes the hash chain over `witnesses` and checks it ends at the trade's head.
pub fn verify_chain(trade: &Trade, witnesses: &[Witness]) -> bool {
    if witnesses.len() != trade.witness_count as usize {
        return false;
    }
    let mut prev: Option<String> = None;
    for witness in witnesses {
        if witness.trade_id != trade.id || witness.prev_hash != prev {
            return false;
        }
        match witness.build() {
            Ok((hash, _)) => prev = Some(hash),
            Err(_) => return false,
        }
    }
    prev == trade.head_hash
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::trade::TradeTerms;

    fn chain_of(trade: &mut Trade, actions: Vec<WitnessAction>) -> Vec<Witness> {
        let mut out = vec![];
        for action in actions {
            let witness = Witness::new(
                trade.id.clone(),
                "user_1".into(),
                TimeStamp::new(),
                action,
                trade.head_hash.clone(),
            );
            let (hash, _) = witness.build().unwrap();
            trade.head_hash = Some(hash);
            trade.witness_count += 1;
            out.push(witness);
        }
        out
    }

    #[test]
    fn untouched_chain_verifies() {
        let mut trade = Trade::new(
            "trade_1".into(),
            "user_1".into(),
            "user_2".into(),
            TradeTerms::new().offer_cash(10),
            "h".into(),
        );
        let chain = chain_of(
            &mut trade,
            vec![
                WitnessAction::Proposed {
                    terms_hash: "h".into(),
                },
                WitnessAction::Accepted,
                WitnessAction::Settled,
            ],
        );
        assert!(verify_chain(&trade, &chain));
    }

    #[test]
    fn tampered_chain_fails() {
        let mut trade = Trade::new(
            "trade_1".into(),
            "user_1".into(),
            "user_2".into(),
            TradeTerms::new().offer_cash(10),
            "h".into(),
        );
        let mut chain = chain_of(
            &mut trade,
            vec![
                WitnessAction::Proposed {
                    terms_hash: "h".into(),
                },
                WitnessAction::Rejected,
            ],
        );
        chain[1].action = WitnessAction::Accepted;
        assert!(!verify_chain(&trade, &chain));

        chain.pop();
        assert!(!verify_chain(&trade, &chain));
    }
}
