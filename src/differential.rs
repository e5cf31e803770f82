//! Cash differential calculation: who owes whom so both sides of a trade carry equal value.
//!
//! This is the single source of truth for the payer, the recipient and the amount. The
//! escrow coordinator and any preview endpoint both call [`calculate_cash_differential`].
use super::error::ValidationError;

/// Estimated item values and cash for both sides of a trade, in minor currency units.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct OfferValuation {
    pub proposer_item_values: Vec<u64>,
    pub receiver_item_values: Vec<u64>,
    pub proposer_cash: u64,
    pub receiver_cash: u64,
}

impl OfferValuation {
    pub fn proposer_total(&self) -> u128 {
        side_total(&self.proposer_item_values, self.proposer_cash)
    }
    pub fn receiver_total(&self) -> u128 {
        side_total(&self.receiver_item_values, self.receiver_cash)
    }
    pub fn proposer_items_total(&self) -> u128 {
        side_total(&self.proposer_item_values, 0)
    }
    pub fn receiver_items_total(&self) -> u128 {
        side_total(&self.receiver_item_values, 0)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CashDifferential {
    pub payer_id: Option<String>,
    pub recipient_id: Option<String>,
    pub amount: u64,
    pub proposer_total: u128,
    pub receiver_total: u128,
    pub description: String,
}

impl CashDifferential {
    pub fn is_even(&self) -> bool {
        self.amount == 0
    }
}

fn side_total(item_values: &[u64], cash: u64) -> u128 {
    item_values.iter().map(|v| u128::from(*v)).sum::<u128>() + u128::from(cash)
}

/// Formats minor units as a two-decimal major amount, e.g. `123456` -> `1234.56`.
pub fn format_minor_units(amount: u64) -> String {
    format!("{}.{:02}", amount / 100, amount % 100)
}

/// Fails with `AmountTooLarge` when the gap between the sides does not fit in a `u64`.
pub fn calculate_cash_differential(
    proposer_id: &str,
    receiver_id: &str,
    valuation: &OfferValuation,
) -> Result<CashDifferential, ValidationError> {
    let proposer_total = valuation.proposer_total();
    let receiver_total = valuation.receiver_total();

    // Values are integral minor units, so anything under one unit apart is exactly equal.
    let (payer, recipient, difference) = match proposer_total.cmp(&receiver_total) {
        std::cmp::Ordering::Equal => (None, None, 0),
        // receiver is under-offering
        std::cmp::Ordering::Greater => (
            Some(receiver_id),
            Some(proposer_id),
            proposer_total - receiver_total,
        ),
        std::cmp::Ordering::Less => (
            Some(proposer_id),
            Some(receiver_id),
            receiver_total - proposer_total,
        ),
    };
    let amount =
        u64::try_from(difference).map_err(|_| ValidationError::AmountTooLarge(difference))?;

    let description = match (payer, recipient) {
        (Some(payer), Some(recipient)) => format!(
            "{payer} pays {recipient} {} to balance the trade",
            format_minor_units(amount)
        ),
        _ => "Even trade: no cash differential".to_string(),
    };

    Ok(CashDifferential {
        payer_id: payer.map(str::to_owned),
        recipient_id: recipient.map(str::to_owned),
        amount,
        proposer_total,
        receiver_total,
        description,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn valuation(p: &[u64], r: &[u64], pc: u64, rc: u64) -> OfferValuation {
        OfferValuation {
            proposer_item_values: p.to_vec(),
            receiver_item_values: r.to_vec(),
            proposer_cash: pc,
            receiver_cash: rc,
        }
    }

    #[test]
    fn even_trade_has_no_payer() {
        let diff = calculate_cash_differential("a", "b", &valuation(&[5_000], &[4_000], 0, 1_000)).unwrap();
        assert!(diff.is_even());
        assert_eq!(diff.payer_id, None);
        assert_eq!(diff.recipient_id, None);
        assert_eq!(diff.description, "Even trade: no cash differential");
    }

    #[test]
    fn receiver_pays_when_proposer_offers_more() {
        let diff = calculate_cash_differential("a", "b", &valuation(&[10_000], &[7_500], 0, 0)).unwrap();
        assert_eq!(diff.payer_id.as_deref(), Some("b"));
        assert_eq!(diff.recipient_id.as_deref(), Some("a"));
        assert_eq!(diff.amount, 2_500);
        assert_eq!(diff.description, "b pays a 25.00 to balance the trade");
    }

    #[test]
    fn proposer_pays_when_receiver_offers_more() {
        let diff = calculate_cash_differential("a", "b", &valuation(&[1_000, 1_000], &[3_050], 0, 0)).unwrap();
        assert_eq!(diff.payer_id.as_deref(), Some("a"));
        assert_eq!(diff.recipient_id.as_deref(), Some("b"));
        assert_eq!(diff.amount, 1_050);
    }

    #[test]
    fn totals_do_not_overflow() {
        let diff =
            calculate_cash_differential("a", "b", &valuation(&[u64::MAX, 10], &[u64::MAX], 0, 0))
                .unwrap();
        assert_eq!(diff.amount, 10);
        assert_eq!(diff.proposer_total, u128::from(u64::MAX) + 10);
    }

    #[test]
    fn gap_wider_than_u64_is_rejected() {
        let err = calculate_cash_differential("a", "b", &valuation(&[u64::MAX, u64::MAX], &[], 0, 0))
            .unwrap_err();
        assert_eq!(err, ValidationError::AmountTooLarge(2 * u128::from(u64::MAX)));
    }
}
