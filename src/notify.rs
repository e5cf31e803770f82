//! Fire-and-forget collaborators: user notifications and price signals from settled trades.
use std::sync::{Mutex, PoisonError};
use tracing::info;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TradeEvent {
    TradeProposed,
    TradeAccepted,
    TradeRejected,
    TradeCancelled,
    TradeCountered,
    EscrowFunded,
    EscrowReleased,
    EscrowRefunded,
    TrackingSubmitted,
    TradeSettled,
    RatingReceived,
    RatingsRevealed,
    DisputeOpened,
    DisputeResponse,
    DisputeResolved,
}

impl TradeEvent {
    pub fn as_str(self) -> &'static str {
        match self {
            TradeEvent::TradeProposed => "trade_proposed",
            TradeEvent::TradeAccepted => "trade_accepted",
            TradeEvent::TradeRejected => "trade_rejected",
            TradeEvent::TradeCancelled => "trade_cancelled",
            TradeEvent::TradeCountered => "trade_countered",
            TradeEvent::EscrowFunded => "escrow_funded",
            TradeEvent::EscrowReleased => "escrow_released",
            TradeEvent::EscrowRefunded => "escrow_refunded",
            TradeEvent::TrackingSubmitted => "tracking_submitted",
            TradeEvent::TradeSettled => "trade_settled",
            TradeEvent::RatingReceived => "rating_received",
            TradeEvent::RatingsRevealed => "ratings_revealed",
            TradeEvent::DisputeOpened => "dispute_opened",
            TradeEvent::DisputeResponse => "dispute_response",
            TradeEvent::DisputeResolved => "dispute_resolved",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Notification {
    pub user_id: String,
    pub event: TradeEvent,
    pub trade_id: String,
    pub message: String,
}

impl Notification {
    pub fn new(
        user_id: impl Into<String>,
        event: TradeEvent,
        trade_id: impl Into<String>,
        message: impl Into<String>,
    ) -> Self {
        Self {
            user_id: user_id.into(),
            event,
            trade_id: trade_id.into(),
            message: message.into(),
        }
    }
}

/// Delivery must not fail the transition that produced the notification.
pub trait Notifier: Send + Sync {
    fn notify(&self, notification: Notification);
}

/// Writes notifications to the log. Used when no delivery channel is wired in.
#[derive(Debug, Default)]
pub struct TracingNotifier;

impl Notifier for TracingNotifier {
    fn notify(&self, notification: Notification) {
        info!(
            user_id = %notification.user_id,
            trade_id = %notification.trade_id,
            event = notification.event.as_str(),
            "{}",
            notification.message
        );
    }
}

/// Keeps every notification in memory.
#[derive(Debug, Default)]
pub struct RecordingNotifier {
    sent: Mutex<Vec<Notification>>,
}

impl RecordingNotifier {
    pub fn new() -> Self {
        Self::default()
    }
    pub fn sent(&self) -> Vec<Notification> {
        self.sent
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }
    pub fn events_for(&self, user_id: &str) -> Vec<TradeEvent> {
        self.sent()
            .into_iter()
            .filter(|n| n.user_id == user_id)
            .map(|n| n.event)
            .collect()
    }
}

impl Notifier for RecordingNotifier {
    fn notify(&self, notification: Notification) {
        self.sent
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(notification);
    }
}

/// What a completed trade implies an item is worth.
#[derive(Debug, Clone, PartialEq)]
pub struct PriceSignal {
    pub trade_id: String,
    pub item_id: String,
    pub implied_value_cents: u64,
    pub confidence: f64,
}

/// Best effort; a sink that drops signals is valid.
pub trait PriceSignalSink: Send + Sync {
    fn record_signal(&self, signal: PriceSignal);
}

#[derive(Debug, Default)]
pub struct TracingSignalSink;

impl PriceSignalSink for TracingSignalSink {
    fn record_signal(&self, signal: PriceSignal) {
        info!(
            trade_id = %signal.trade_id,
            item_id = %signal.item_id,
            implied_value_cents = signal.implied_value_cents,
            confidence = signal.confidence,
            "price signal"
        );
    }
}

#[derive(Debug, Default)]
pub struct RecordingSignalSink {
    signals: Mutex<Vec<PriceSignal>>,
}

impl RecordingSignalSink {
    pub fn new() -> Self {
        Self::default()
    }
    pub fn signals(&self) -> Vec<PriceSignal> {
        self.signals
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }
}

impl PriceSignalSink for RecordingSignalSink {
    fn record_signal(&self, signal: PriceSignal) {
        self.signals
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(signal);
    }
}
