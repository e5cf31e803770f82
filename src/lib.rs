pub mod audit;
pub mod config;
pub mod differential;
pub mod dispute;
pub mod error;
pub mod escrow;
pub mod ledger;
pub mod notify;
pub mod rating;
pub mod service;
pub mod settlement;
pub mod store;
pub mod trade;
pub mod utils;

pub use config::{MarketConfig, ProviderKind};
pub use differential::{CashDifferential, OfferValuation, calculate_cash_differential};
pub use dispute::{Dispute, DisputeStatus, DisputeType, Resolution};
pub use error::{ErrorKind, Result, TradeError, ValidationError};
pub use escrow::{
    EscrowCoordinator, EscrowHold, EscrowStatus, HoldStatus, MockPaymentProvider,
    PaymentProvider, ProviderError,
};
pub use ledger::{Item, User};
pub use rating::{RatingOutcome, RatingScores, Reputation, TradeRating};
pub use service::{TradeResponse, TradeService};
pub use trade::{Party, TimeStamp, Trade, TradeStatus, TradeTerms};
