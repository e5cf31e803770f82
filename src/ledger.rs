//! Users, their balances, and the items they own.
use super::differential::OfferValuation;
use super::error::{Result, TradeError, ValidationError};
use super::service::TradeService;
use super::store::{Store, Tx, TxResult, get, tx_load, tx_put};
use super::trade::{TimeStamp, TradeTerms};
use super::utils::{ITEM_HRP, USER_HRP, new_id};
use chrono::Utc;
use tracing::{info, warn};

#[derive(minicbor::Encode, minicbor::Decode, Debug, Clone, PartialEq, Eq)]
pub struct User {
    #[n(0)]
    pub id: String,
    #[n(1)]
    pub display_name: String,
    #[n(2)]
    pub balance: i64, // minor units
    #[n(3)]
    pub created_at: TimeStamp<Utc>,
    #[n(4)]
    pub updated_at: TimeStamp<Utc>,
}

#[derive(minicbor::Encode, minicbor::Decode, Debug, Clone, PartialEq, Eq)]
pub struct Item {
    #[n(0)]
    pub id: String,
    #[n(1)]
    pub owner_id: String,
    #[n(2)]
    pub title: String,
    #[n(3)]
    pub estimated_market_value: u64, // minor units
    #[n(4)]
    pub reserved_by: Option<String>, // trade holding the item until it settles or unwinds
    #[n(5)]
    pub created_at: TimeStamp<Utc>,
    #[n(6)]
    pub updated_at: TimeStamp<Utc>,
}

impl Store {
    pub fn get_user(&self, user_id: &str) -> Result<User> {
        get(&self.users, user_id)?.ok_or_else(|| TradeError::not_found("user", user_id))
    }

    pub fn get_item(&self, item_id: &str) -> Result<Item> {
        get(&self.items, item_id)?.ok_or_else(|| TradeError::not_found("item", item_id))
    }

    /// Current estimated values of every item in `terms`.
    pub fn valuation(&self, terms: &TradeTerms) -> Result<OfferValuation> {
        let values = |ids: &[String]| -> Result<Vec<u64>> {
            ids.iter()
                .map(|id| self.get_item(id).map(|item| item.estimated_market_value))
                .collect()
        };
        Ok(OfferValuation {
            proposer_item_values: values(&terms.proposer_item_ids)?,
            receiver_item_values: values(&terms.receiver_item_ids)?,
            proposer_cash: terms.proposer_cash,
            receiver_cash: terms.receiver_cash,
        })
    }
}

pub(crate) fn tx_valuation(tx: &Tx<'_>, terms: &TradeTerms) -> TxResult<OfferValuation> {
    let values = |ids: &[String]| -> TxResult<Vec<u64>> {
        let mut out = Vec::with_capacity(ids.len());
        for id in ids {
            let item: Item = tx_load(tx.items, "item", id)?;
            out.push(item.estimated_market_value);
        }
        Ok(out)
    };
    Ok(OfferValuation {
        proposer_item_values: values(&terms.proposer_item_ids)?,
        receiver_item_values: values(&terms.receiver_item_ids)?,
        proposer_cash: terms.proposer_cash,
        receiver_cash: terms.receiver_cash,
    })
}

/// Loads `item_ids`, failing unless each is owned by `owner_id` and free or already held by
/// `trade_id`.
pub(crate) fn tx_claim_items(
    tx: &Tx<'_>,
    item_ids: &[String],
    owner_id: &str,
    trade_id: &str,
) -> TxResult<Vec<Item>> {
    let mut out = Vec::with_capacity(item_ids.len());
    for id in item_ids {
        let item: Item = tx_load(tx.items, "item", id)?;
        if item.owner_id != owner_id {
            return Err(TradeError::OwnershipMismatch {
                item_id: id.clone(),
                expected_owner: owner_id.to_string(),
            }
            .into());
        }
        if let Some(holder) = item.reserved_by.as_deref().filter(|h| *h != trade_id) {
            return Err(TradeError::ItemReserved {
                item_id: id.clone(),
                trade_id: holder.to_string(),
            }
            .into());
        }
        out.push(item);
    }
    Ok(out)
}

pub(crate) fn tx_set_reservation(
    tx: &Tx<'_>,
    terms: &TradeTerms,
    trade_id: &str,
    reserve: bool,
) -> TxResult<()> {
    for id in terms.all_item_ids() {
        let mut item: Item = tx_load(tx.items, "item", id)?;
        let held_here = item.reserved_by.as_deref() == Some(trade_id);
        if reserve && !held_here {
            item.reserved_by = Some(trade_id.to_string());
        } else if !reserve && held_here {
            item.reserved_by = None;
        } else {
            continue;
        }
        item.updated_at = TimeStamp::new();
        tx_put(tx.items, id, &item)?;
    }
    Ok(())
}

impl TradeService {
    pub fn register_user(&self, display_name: &str, opening_balance: i64) -> Result<User> {
        if display_name.trim().is_empty() {
            return Err(ValidationError::Blank("display name").into());
        }
        let now = TimeStamp::new();
        let user = User {
            id: new_id(USER_HRP),
            display_name: display_name.to_string(),
            balance: opening_balance,
            created_at: now.clone(),
            updated_at: now,
        };
        self.store
            .transaction(|tx| tx_put(tx.users, &user.id, &user))?;
        info!(user_id = %user.id, opening_balance, "user registered");
        Ok(user)
    }

    pub fn get_user(&self, user_id: &str) -> Result<User> {
        self.store.get_user(user_id)
    }

    /// Charges the user's card through the payment provider and credits the balance.
    pub fn deposit_funds(&self, user_id: &str, amount: u64) -> Result<User> {
        if amount == 0 {
            return Err(ValidationError::ZeroAmount("deposit").into());
        }
        let credit = i64::try_from(amount).map_err(|_| ValidationError::AmountTooLarge(amount.into()))?;
        self.store.get_user(user_id)?;

        let provider = self.escrow.provider();
        let intent = provider.create_payment_intent(user_id, amount)?;
        let intent = provider.capture_payment(&intent.id)?;

        let credited = self.store.transaction(|tx| {
            let mut user: User = tx_load(tx.users, "user", user_id)?;
            user.balance += credit;
            user.updated_at = TimeStamp::new();
            tx_put(tx.users, user_id, &user)?;
            Ok(user)
        });
        match credited {
            Ok(user) => {
                info!(user_id, amount, intent_id = %intent.id, "deposit credited");
                Ok(user)
            }
            Err(e) => {
                if let Err(refund_err) = provider.refund_payment(&intent.id, None) {
                    warn!(user_id, intent_id = %intent.id, error = %refund_err, "deposit refund failed");
                }
                Err(e)
            }
        }
    }

    pub fn list_item(&self, owner_id: &str, title: &str, estimated_value: u64) -> Result<Item> {
        if title.trim().is_empty() {
            return Err(ValidationError::Blank("item title").into());
        }
        let now = TimeStamp::new();
        let item = Item {
            id: new_id(ITEM_HRP),
            owner_id: owner_id.to_string(),
            title: title.to_string(),
            estimated_market_value: estimated_value,
            reserved_by: None,
            created_at: now.clone(),
            updated_at: now,
        };
        self.store.transaction(|tx| {
            let _: User = tx_load(tx.users, "user", owner_id)?;
            tx_put(tx.items, &item.id, &item)
        })?;
        info!(item_id = %item.id, owner_id, estimated_value, "item listed");
        Ok(item)
    }

    pub fn get_item(&self, item_id: &str) -> Result<Item> {
        self.store.get_item(item_id)
    }

    /// Updates an item's estimated value. Items held by an in-flight trade keep their value
    /// so an escrowed differential cannot drift.
    pub fn revalue_item(&self, item_id: &str, owner_id: &str, estimated_value: u64) -> Result<Item> {
        let item = self.store.transaction(|tx| {
            let mut item: Item = tx_load(tx.items, "item", item_id)?;
            if item.owner_id != owner_id {
                return Err(TradeError::forbidden(owner_id, "revalue this item").into());
            }
            if let Some(trade_id) = &item.reserved_by {
                return Err(TradeError::ItemReserved {
                    item_id: item_id.to_string(),
                    trade_id: trade_id.clone(),
                }
                .into());
            }
            item.estimated_market_value = estimated_value;
            item.updated_at = TimeStamp::new();
            tx_put(tx.items, item_id, &item)?;
            Ok(item)
        })?;
        info!(item_id, estimated_value, "item revalued");
        Ok(item)
    }
}
