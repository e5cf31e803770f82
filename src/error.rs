//! Error taxonomy for trade, escrow, rating and dispute operations
use crate::escrow::{HoldStatus, ProviderError};
use crate::trade::TradeStatus;
use sled::transaction::{ConflictableTransactionError, TransactionError};

pub type Result<T, E = TradeError> = std::result::Result<T, E>;

/// Coarse category a caller can branch on without matching every variant.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    NotFound,
    Forbidden,
    InvalidState,
    Duplicate,
    Validation,
    Provider,
    Storage,
}

#[derive(thiserror::Error, Debug)]
pub enum TradeError {
    #[error("{entity} {id} not found")]
    NotFound { entity: &'static str, id: String },
    #[error("user {user_id} may not {action}")]
    Forbidden { user_id: String, action: &'static str },
    #[error("cannot {action} a trade in state {status:?}")]
    InvalidStateTransition {
        action: &'static str,
        status: TradeStatus,
    },
    #[error("user {rater_id} has already rated trade {trade_id}")]
    AlreadyRated { trade_id: String, rater_id: String },
    #[error("trade {0} already has an active dispute")]
    DisputeAlreadyOpen(String),
    #[error("dispute {dispute_id} cannot {action} while {status}")]
    InvalidDisputeState {
        dispute_id: String,
        action: &'static str,
        status: &'static str,
    },
    #[error("item {item_id} is not owned by {expected_owner}")]
    OwnershipMismatch {
        item_id: String,
        expected_owner: String,
    },
    #[error("item {item_id} is reserved by trade {trade_id}")]
    ItemReserved { item_id: String, trade_id: String },
    #[error("user {user_id} has balance {balance}, needs {required}")]
    InsufficientBalance {
        user_id: String,
        balance: i64,
        required: u64,
    },

    // Escrow coordinator failures
    #[error("trade {0} has no cash differential to escrow")]
    NoCashDifferential(String),
    #[error("user {actual} is not the required payer {expected}")]
    WrongPayer { expected: String, actual: String },
    #[error("trade {0} already has a funded escrow hold")]
    AlreadyFunded(String),
    #[error("no escrow hold found for trade {0}")]
    NoEscrowFound(String),
    #[error("escrow hold {0} has a provider call in flight")]
    EscrowBusy(String),
    #[error("escrow hold {hold_id} is {status:?}, expected {expected:?}")]
    InvalidEscrowState {
        hold_id: String,
        status: HoldStatus,
        expected: HoldStatus,
    },

    #[error(transparent)]
    Validation(#[from] ValidationError),
    #[error("payment provider: {0}")]
    Provider(#[from] ProviderError),
    #[error("storage: {0}")]
    Storage(#[from] sled::Error),
    #[error("failed to encode or decode {0}")]
    Codec(String),
}

#[derive(thiserror::Error, Debug, PartialEq, Eq)]
pub enum ValidationError {
    #[error("a user cannot trade with themselves")]
    SelfTrade,
    #[error("a trade must offer at least one item or some cash")]
    EmptyOffer,
    #[error("item {0} appears more than once in the offer")]
    DuplicateItem(String),
    #[error("{field} score {score} is outside 1..=5")]
    ScoreOutOfRange { field: &'static str, score: u8 },
    #[error("{0} must be greater than zero")]
    ZeroAmount(&'static str),
    #[error("amount {0} exceeds the largest representable amount")]
    AmountTooLarge(u128),
    #[error("amount {amount} does not match the required {required}")]
    AmountMismatch { amount: u64, required: u64 },
    #[error("refund of {requested} exceeds the held {held}")]
    RefundExceedsHold { requested: u64, held: u64 },
    #[error("{0} must not be empty")]
    Blank(&'static str),
}

impl TradeError {
    pub fn not_found(entity: &'static str, id: impl Into<String>) -> Self {
        Self::NotFound {
            entity,
            id: id.into(),
        }
    }

    pub fn forbidden(user_id: impl Into<String>, action: &'static str) -> Self {
        Self::Forbidden {
            user_id: user_id.into(),
            action,
        }
    }

    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::NotFound { .. } | Self::NoEscrowFound(_) => ErrorKind::NotFound,
            Self::Forbidden { .. } | Self::WrongPayer { .. } => ErrorKind::Forbidden,
            Self::InvalidStateTransition { .. }
            | Self::InvalidDisputeState { .. }
            | Self::InvalidEscrowState { .. }
            | Self::EscrowBusy(_)
            | Self::NoCashDifferential(_)
            | Self::ItemReserved { .. } => ErrorKind::InvalidState,
            Self::AlreadyRated { .. } | Self::DisputeAlreadyOpen(_) | Self::AlreadyFunded(_) => {
                ErrorKind::Duplicate
            }
            Self::Validation(_)
            | Self::OwnershipMismatch { .. }
            | Self::InsufficientBalance { .. } => ErrorKind::Validation,
            Self::Provider(_) => ErrorKind::Provider,
            Self::Storage(_) | Self::Codec(_) => ErrorKind::Storage,
        }
    }

    /// True when repeating the same call may succeed without the caller changing anything.
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::Provider(e) => e.is_retryable(),
            Self::Storage(_) | Self::EscrowBusy(_) => true,
            _ => false,
        }
    }
}

impl From<minicbor::decode::Error> for TradeError {
    fn from(value: minicbor::decode::Error) -> Self {
        TradeError::Codec(value.to_string())
    }
}

impl<E: std::fmt::Display> From<minicbor::encode::Error<E>> for TradeError {
    fn from(value: minicbor::encode::Error<E>) -> Self {
        TradeError::Codec(value.to_string())
    }
}

impl From<TransactionError<TradeError>> for TradeError {
    fn from(value: TransactionError<TradeError>) -> Self {
        match value {
            TransactionError::Abort(e) => e,
            TransactionError::Storage(e) => TradeError::Storage(e),
        }
    }
}

impl From<TradeError> for ConflictableTransactionError<TradeError> {
    fn from(value: TradeError) -> Self {
        ConflictableTransactionError::Abort(value)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn provider_timeouts_are_retryable_but_roles_are_not() {
        let timeout = TradeError::Provider(ProviderError::Timeout);
        assert!(timeout.is_retryable());
        assert_eq!(timeout.kind(), ErrorKind::Provider);

        let wrong_role = TradeError::forbidden("user_1", "accept this trade");
        assert!(!wrong_role.is_retryable());
        assert_eq!(wrong_role.kind(), ErrorKind::Forbidden);

        let rated = TradeError::AlreadyRated {
            trade_id: "trade_1".into(),
            rater_id: "user_1".into(),
        };
        assert!(!rated.is_retryable());
        assert_eq!(rated.kind(), ErrorKind::Duplicate);
    }

    #[test]
    fn aborted_transactions_unwrap_to_the_inner_error() {
        let err: TradeError =
            TransactionError::Abort(TradeError::AlreadyFunded("trade_1".into())).into();
        assert!(matches!(err, TradeError::AlreadyFunded(id) if id == "trade_1"));
    }
}
