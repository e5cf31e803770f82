//! sled-backed repository. Records are cbor encoded and keyed by their bech32 id.
use super::error::{Result, TradeError};
use super::trade::Trade;
use sled::Transactional;
use sled::transaction::{ConflictableTransactionResult, TransactionalTree};
use std::sync::Arc;

/// Handles to every tree the marketplace uses. Cloning is cheap; trees are reference counted.
#[derive(Clone)]
pub struct Store {
    db: Arc<sled::Db>,
    pub(crate) users: sled::Tree,
    pub(crate) items: sled::Tree,
    pub(crate) trades: sled::Tree,
    pub(crate) user_trades: sled::Tree, // user_id/trade_id -> ()
    pub(crate) item_trades: sled::Tree, // item_id/trade_id -> ()
    pub(crate) holds: sled::Tree, // trade_id/hold_id -> EscrowHold
    pub(crate) active_holds: sled::Tree, // trade_id -> hold_id
    pub(crate) ratings: sled::Tree, // trade_id/rater_id -> TradeRating
    pub(crate) disputes: sled::Tree, // dispute_id -> Dispute
    pub(crate) active_disputes: sled::Tree, // trade_id -> dispute_id
    pub(crate) witnesses: sled::Tree, // trade_id/sequence -> Witness
}

/// Transactional views over every tree, handed to closures run by [`Store::transaction`].
pub(crate) struct Tx<'a> {
    pub users: &'a TransactionalTree,
    pub items: &'a TransactionalTree,
    pub trades: &'a TransactionalTree,
    pub user_trades: &'a TransactionalTree,
    pub item_trades: &'a TransactionalTree,
    pub holds: &'a TransactionalTree,
    pub active_holds: &'a TransactionalTree,
    pub ratings: &'a TransactionalTree,
    pub disputes: &'a TransactionalTree,
    pub active_disputes: &'a TransactionalTree,
    pub witnesses: &'a TransactionalTree,
}

pub(crate) type TxResult<T> = ConflictableTransactionResult<T, TradeError>;

pub(crate) fn compound_key(prefix: &str, suffix: &str) -> String {
    format!("{prefix}/{suffix}")
}

impl Store {
    pub fn open(db: Arc<sled::Db>) -> Result<Self> {
        Ok(Self {
            users: db.open_tree("users")?,
            items: db.open_tree("items")?,
            trades: db.open_tree("trades")?,
            user_trades: db.open_tree("user_trades")?,
            item_trades: db.open_tree("item_trades")?,
            holds: db.open_tree("escrow_holds")?,
            active_holds: db.open_tree("active_holds")?,
            ratings: db.open_tree("ratings")?,
            disputes: db.open_tree("disputes")?,
            active_disputes: db.open_tree("active_disputes")?,
            witnesses: db.open_tree("witnesses")?,
            db,
        })
    }

    pub fn flush(&self) -> Result<usize> {
        Ok(self.db.flush()?)
    }

    /// Runs `f` atomically across all trees. sled may re-run `f` on conflict, so it must
    /// not have side effects outside the transaction.
    pub(crate) fn transaction<T, F>(&self, f: F) -> Result<T>
    where
        F: Fn(&Tx<'_>) -> TxResult<T>,
    {
        let out = (
            &self.users,
            &self.items,
            &self.trades,
            &self.user_trades,
            &self.item_trades,
            &self.holds,
            &self.active_holds,
            &self.ratings,
            &self.disputes,
            &self.active_disputes,
            &self.witnesses,
        )
            .transaction(
                |(
                    users,
                    items,
                    trades,
                    user_trades,
                    item_trades,
                    holds,
                    active_holds,
                    ratings,
                    disputes,
                    active_disputes,
                    witnesses,
                )| {
                    let tx = Tx {
                        users,
                        items,
                        trades,
                        user_trades,
                        item_trades,
                        holds,
                        active_holds,
                        ratings,
                        disputes,
                        active_disputes,
                        witnesses,
                    };
                    f(&tx)
                },
            )?;
        Ok(out)
    }

    pub fn get_trade(&self, trade_id: &str) -> Result<Trade> {
        get(&self.trades, trade_id)?.ok_or_else(|| TradeError::not_found("trade", trade_id))
    }

    /// Ids stored under `prefix/` in an index tree, in key order.
    pub(crate) fn index_suffixes(&self, tree: &sled::Tree, prefix: &str) -> Result<Vec<String>> {
        let prefix = format!("{prefix}/");
        let mut out = vec![];
        for entry in tree.scan_prefix(prefix.as_bytes()) {
            let (key, _) = entry?;
            let key = String::from_utf8_lossy(&key);
            if let Some(suffix) = key.strip_prefix(&prefix) {
                out.push(suffix.to_string());
            }
        }
        Ok(out)
    }

    /// Decodes every value stored under `prefix/`.
    pub(crate) fn scan_records<T>(&self, tree: &sled::Tree, prefix: &str) -> Result<Vec<T>>
    where
        T: for<'b> minicbor::Decode<'b, ()>,
    {
        let prefix = format!("{prefix}/");
        let mut out = vec![];
        for entry in tree.scan_prefix(prefix.as_bytes()) {
            let (_, value) = entry?;
            out.push(minicbor::decode(&value)?);
        }
        Ok(out)
    }
}

pub(crate) fn get<T>(tree: &sled::Tree, key: &str) -> Result<Option<T>>
where
    T: for<'b> minicbor::Decode<'b, ()>,
{
    match tree.get(key.as_bytes())? {
        Some(bytes) => Ok(Some(minicbor::decode(&bytes)?)),
        None => Ok(None),
    }
}

pub(crate) fn tx_get<T>(tree: &TransactionalTree, key: &str) -> TxResult<Option<T>>
where
    T: for<'b> minicbor::Decode<'b, ()>,
{
    match tree.get(key.as_bytes())? {
        Some(bytes) => {
            let value = minicbor::decode(&bytes).map_err(TradeError::from)?;
            Ok(Some(value))
        }
        None => Ok(None),
    }
}

/// Like [`tx_get`] but a missing record aborts with `NotFound`.
pub(crate) fn tx_load<T>(tree: &TransactionalTree, entity: &'static str, key: &str) -> TxResult<T>
where
    T: for<'b> minicbor::Decode<'b, ()>,
{
    match tx_get(tree, key)? {
        Some(value) => Ok(value),
        None => Err(TradeError::not_found(entity, key).into()),
    }
}

pub(crate) fn tx_put<T>(tree: &TransactionalTree, key: &str, value: &T) -> TxResult<()>
where
    T: minicbor::Encode<()>,
{
    let bytes = minicbor::to_vec(value).map_err(TradeError::from)?;
    tree.insert(key.as_bytes(), bytes)?;
    Ok(())
}

pub(crate) fn tx_mark(tree: &TransactionalTree, key: &str) -> TxResult<()> {
    tree.insert(key.as_bytes(), &[] as &[u8])?;
    Ok(())
}

pub(crate) fn tx_get_str(tree: &TransactionalTree, key: &str) -> TxResult<Option<String>> {
    Ok(tree
        .get(key.as_bytes())?
        .map(|v| String::from_utf8_lossy(&v).into_owned()))
}

pub(crate) fn tx_put_str(tree: &TransactionalTree, key: &str, value: &str) -> TxResult<()> {
    tree.insert(key.as_bytes(), value.as_bytes())?;
    Ok(())
}

pub(crate) fn tx_remove(tree: &TransactionalTree, key: &str) -> TxResult<()> {
    tree.remove(key.as_bytes())?;
    Ok(())
}
