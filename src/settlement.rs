//! Atomic settlement: item ownership swap and cash legs, applied in one transaction.
use super::audit::{self, WitnessAction};
use super::differential::OfferValuation;
use super::error::TradeError;
use super::ledger::{Item, User, tx_claim_items};
use super::notify::PriceSignal;
use super::store::{Tx, TxResult, tx_load, tx_put};
use super::trade::{Party, TimeStamp, Trade, TradeStatus};
use chrono::Duration;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ItemTransfer {
    pub item_id: String,
    pub from_user_id: String,
    pub to_user_id: String,
    pub estimated_value: u64,
}

/// What a committed settlement moved, kept for the post-commit side effects.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Settlement {
    pub trade_id: String,
    pub proposer_id: String,
    pub receiver_id: String,
    pub transfers: Vec<ItemTransfer>,
    pub valuation: OfferValuation,
}

impl Settlement {
    /// Implied value of every traded item.
    ///
    /// Each side's items are priced at what that side received for them: the other side's
    /// items and cash, less the cash the side put in itself. That consideration is split
    /// across the side's items by their share of its estimated value.
    pub fn price_signals(&self) -> Vec<PriceSignal> {
        let v = &self.valuation;
        let proposer_consideration = (v.receiver_items_total() + v.receiver_cash as u128)
            .saturating_sub(v.proposer_cash as u128);
        let receiver_consideration = (v.proposer_items_total() + v.proposer_cash as u128)
            .saturating_sub(v.receiver_cash as u128);

        let mut out = self.side_signals(
            &self.proposer_id,
            v.proposer_items_total(),
            proposer_consideration,
        );
        out.extend(self.side_signals(
            &self.receiver_id,
            v.receiver_items_total(),
            receiver_consideration,
        ));
        out
    }

    fn side_signals(&self, owner_id: &str, side_total: u128, consideration: u128) -> Vec<PriceSignal> {
        let side: Vec<&ItemTransfer> = self
            .transfers
            .iter()
            .filter(|t| t.from_user_id == owner_id)
            .collect();
        let count = side.len() as u128;
        side.into_iter()
            .map(|transfer| {
                let (implied, confidence) = if side_total == 0 {
                    (consideration / count, 1.0 / count as f64)
                } else {
                    let value = transfer.estimated_value as u128;
                    (
                        consideration * value / side_total,
                        value as f64 / side_total as f64,
                    )
                };
                PriceSignal {
                    trade_id: self.trade_id.clone(),
                    item_id: transfer.item_id.clone(),
                    implied_value_cents: u64::try_from(implied).unwrap_or(u64::MAX),
                    confidence,
                }
            })
            .collect()
    }
}

fn cash_leg(user: &User, cash: u64) -> TxResult<i64> {
    match i64::try_from(cash) {
        Ok(amount) if user.balance >= amount => Ok(amount),
        _ => Err(TradeError::InsufficientBalance {
            user_id: user.id.clone(),
            balance: user.balance,
            required: cash,
        }
        .into()),
    }
}

/// Swaps item ownership, moves both cash legs and marks the trade settled. Either every write
/// lands with the caller's transaction or none do. The caller writes the trade.
pub(crate) fn settle(
    tx: &Tx<'_>,
    trade: &mut Trade,
    actor: &str,
    rating_window: Duration,
) -> TxResult<Settlement> {
    if trade.settled {
        return Err(TradeError::InvalidStateTransition {
            action: "settle",
            status: trade.status,
        }
        .into());
    }

    let proposer_items = tx_claim_items(
        tx,
        trade.terms.items_of(Party::Proposer),
        &trade.proposer_id,
        &trade.id,
    )?;
    let receiver_items = tx_claim_items(
        tx,
        trade.terms.items_of(Party::Receiver),
        &trade.receiver_id,
        &trade.id,
    )?;

    // balances are checked against what each party held before the trade
    let mut proposer: User = tx_load(tx.users, "user", &trade.proposer_id)?;
    let mut receiver: User = tx_load(tx.users, "user", &trade.receiver_id)?;
    let proposer_pays = cash_leg(&proposer, trade.terms.proposer_cash)?;
    let receiver_pays = cash_leg(&receiver, trade.terms.receiver_cash)?;

    let now = TimeStamp::new();
    proposer.balance = proposer.balance - proposer_pays + receiver_pays;
    receiver.balance = receiver.balance - receiver_pays + proposer_pays;
    proposer.updated_at = now.clone();
    receiver.updated_at = now.clone();
    tx_put(tx.users, &proposer.id, &proposer)?;
    tx_put(tx.users, &receiver.id, &receiver)?;

    let mut transfers = Vec::with_capacity(proposer_items.len() + receiver_items.len());
    let sides = [
        (proposer_items, &trade.proposer_id, &trade.receiver_id),
        (receiver_items, &trade.receiver_id, &trade.proposer_id),
    ];
    let mut valuation = OfferValuation {
        proposer_cash: trade.terms.proposer_cash,
        receiver_cash: trade.terms.receiver_cash,
        ..OfferValuation::default()
    };
    for (side, (items, from, to)) in sides.into_iter().enumerate() {
        for mut item in items {
            if side == 0 {
                valuation.proposer_item_values.push(item.estimated_market_value);
            } else {
                valuation.receiver_item_values.push(item.estimated_market_value);
            }
            transfers.push(ItemTransfer {
                item_id: item.id.clone(),
                from_user_id: from.clone(),
                to_user_id: to.clone(),
                estimated_value: item.estimated_market_value,
            });
            item.owner_id = to.clone();
            item.reserved_by = None;
            item.updated_at = now.clone();
            tx_put::<Item>(tx.items, &item.id, &item)?;
        }
    }

    trade.transition(TradeStatus::CompletedAwaitingRating, "settle")?;
    trade.settled = true;
    trade.rating_deadline = Some(now.plus(rating_window));
    audit::record(tx, trade, actor, WitnessAction::Settled)?;

    Ok(Settlement {
        trade_id: trade.id.clone(),
        proposer_id: trade.proposer_id.clone(),
        receiver_id: trade.receiver_id.clone(),
        transfers,
        valuation,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn transfer(item_id: &str, from: &str, to: &str, value: u64) -> ItemTransfer {
        ItemTransfer {
            item_id: item_id.into(),
            from_user_id: from.into(),
            to_user_id: to.into(),
            estimated_value: value,
        }
    }

    #[test]
    fn signals_split_consideration_by_value_share() {
        let settlement = Settlement {
            trade_id: "trade_1".into(),
            proposer_id: "alice".into(),
            receiver_id: "bob".into(),
            transfers: vec![
                transfer("a1", "alice", "bob", 3_000),
                transfer("a2", "alice", "bob", 1_000),
                transfer("b1", "bob", "alice", 5_000),
            ],
            valuation: OfferValuation {
                proposer_item_values: vec![3_000, 1_000],
                receiver_item_values: vec![5_000],
                proposer_cash: 0,
                receiver_cash: 0,
            },
        };

        let signals = settlement.price_signals();
        assert_eq!(signals.len(), 3);
        // alice's side fetched 5_000 in total
        assert_eq!(signals[0].implied_value_cents, 3_750);
        assert_eq!(signals[0].confidence, 0.75);
        assert_eq!(signals[1].implied_value_cents, 1_250);
        // bob's item fetched 4_000 of goods
        assert_eq!(signals[2].item_id, "b1");
        assert_eq!(signals[2].implied_value_cents, 4_000);
        assert_eq!(signals[2].confidence, 1.0);
    }

    #[test]
    fn own_cash_is_deducted_from_consideration() {
        let settlement = Settlement {
            trade_id: "trade_1".into(),
            proposer_id: "alice".into(),
            receiver_id: "bob".into(),
            transfers: vec![transfer("b1", "bob", "alice", 2_000)],
            valuation: OfferValuation {
                proposer_item_values: vec![],
                receiver_item_values: vec![2_000],
                proposer_cash: 1_500,
                receiver_cash: 0,
            },
        };

        let signals = settlement.price_signals();
        assert_eq!(signals.len(), 1);
        assert_eq!(signals[0].implied_value_cents, 1_500);
    }
}
