//! Smoke screen unit tests for the marketplace components
//!
//! These tests span the codebase and check one behaviour at a time, mostly the guards that
//! reject the wrong actor, the wrong state or a repeated action.

use sled::open;
use std::sync::Arc;
use tempfile::{TempDir, tempdir};
use trade_escrow::{
    ErrorKind, HoldStatus, MockPaymentProvider, RatingScores, TradeError, TradeResponse,
    TradeService, TradeStatus, TradeTerms, ValidationError,
    utils::{ITEM_HRP, TRADE_HRP, USER_HRP, new_uuid_to_bech32},
};

fn service(name: &str) -> anyhow::Result<(TradeService, TempDir)> {
    let temp_dir = tempdir()?;
    let db = Arc::new(open(temp_dir.path().join(name))?);
    db.clear()?;
    let service = TradeService::new(db, Arc::new(MockPaymentProvider::new()))?;
    Ok((service, temp_dir))
}

/// alice owns a 1_000 item, bob a 1_000 item, carol is a bystander.
fn parties(service: &TradeService) -> anyhow::Result<[String; 5]> {
    let alice = service.register_user("alice", 10_000)?.id;
    let bob = service.register_user("bob", 10_000)?.id;
    let carol = service.register_user("carol", 10_000)?.id;
    let a_item = service.list_item(&alice, "Pikachu promo", 1_000)?.id;
    let b_item = service.list_item(&bob, "Mew promo", 1_000)?.id;
    Ok([alice, bob, carol, a_item, b_item])
}

// UTILS TESTS
mod utils_tests {
    use super::*;

    /// Ids carry their entity prefix followed by the bech32 separator
    #[test]
    fn ids_carry_their_prefix() {
        for hrp in [TRADE_HRP, USER_HRP, ITEM_HRP] {
            let id = new_uuid_to_bech32(hrp).unwrap();
            assert!(id.starts_with(&format!("{hrp}1")));
        }
    }

    /// An empty prefix is not a valid bech32 hrp
    #[test]
    fn empty_prefix_is_rejected() {
        assert!(new_uuid_to_bech32("").is_err());
    }

    /// Two ids minted back to back never collide
    #[test]
    fn ids_are_unique() {
        let a = new_uuid_to_bech32(TRADE_HRP).unwrap();
        let b = new_uuid_to_bech32(TRADE_HRP).unwrap();
        assert_ne!(a, b);
    }
}

// PROPOSAL TESTS
mod proposal_tests {
    use super::*;

    /// A user cannot propose a trade to themselves
    #[test]
    fn self_trade_is_rejected() -> anyhow::Result<()> {
        let (service, _dir) = service("self_trade.db")?;
        let [alice, _, _, a_item, _] = parties(&service)?;

        let err = service
            .propose_trade(&alice, &alice, TradeTerms::new().offer_items([a_item]))
            .unwrap_err();
        assert!(matches!(
            err,
            TradeError::Validation(ValidationError::SelfTrade)
        ));
        assert_eq!(err.kind(), ErrorKind::Validation);
        Ok(())
    }

    /// Terms with nothing on either side are rejected before anything is stored
    #[test]
    fn empty_offer_is_rejected() -> anyhow::Result<()> {
        let (service, _dir) = service("empty_offer.db")?;
        let [alice, bob, ..] = parties(&service)?;

        let err = service
            .propose_trade(&alice, &bob, TradeTerms::new())
            .unwrap_err();
        assert!(matches!(
            err,
            TradeError::Validation(ValidationError::EmptyOffer)
        ));
        assert!(service.trades_for_user(&alice)?.is_empty());
        Ok(())
    }

    /// Proposing someone else's item is allowed through; accepting it is not
    #[test]
    fn ownership_is_soft_on_propose_and_strict_on_accept() -> anyhow::Result<()> {
        let (service, _dir) = service("soft_ownership.db")?;
        let [alice, bob, _, _, b_item] = parties(&service)?;

        // alice offers bob's own item back to him
        let trade = service.propose_trade(
            &alice,
            &bob,
            TradeTerms::new().offer_items([b_item.as_str()]).request_cash(1_000),
        )?;
        assert_eq!(trade.status, TradeStatus::Proposed);

        let err = service
            .respond_to_trade(&trade.id, &bob, TradeResponse::Accept)
            .unwrap_err();
        assert!(matches!(err, TradeError::OwnershipMismatch { .. }));
        assert_eq!(service.get_trade(&trade.id)?.status, TradeStatus::Proposed);
        Ok(())
    }

    /// Unknown items fail the proposal outright
    #[test]
    fn unknown_item_is_not_found() -> anyhow::Result<()> {
        let (service, _dir) = service("unknown_item.db")?;
        let [alice, bob, ..] = parties(&service)?;

        let err = service
            .propose_trade(&alice, &bob, TradeTerms::new().offer_items(["item_missing"]))
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::NotFound);
        Ok(())
    }

    /// Both parties see the trade in their index
    #[test]
    fn trades_are_indexed_per_user() -> anyhow::Result<()> {
        let (service, _dir) = service("user_index.db")?;
        let [alice, bob, carol, a_item, _] = parties(&service)?;

        let trade = service.propose_trade(&alice, &bob, TradeTerms::new().offer_items([a_item]))?;
        assert_eq!(service.trades_for_user(&alice)?[0].id, trade.id);
        assert_eq!(service.trades_for_user(&bob)?[0].id, trade.id);
        assert!(service.trades_for_user(&carol)?.is_empty());
        Ok(())
    }

    /// Index queries list trades in the order they were proposed
    #[test]
    fn indexed_trades_come_back_oldest_first() -> anyhow::Result<()> {
        let (service, _dir) = service("index_order.db")?;
        let [alice, bob, carol, a_item, _] = parties(&service)?;

        let mut proposed = vec![];
        for receiver in [&bob, &carol, &bob, &carol] {
            let trade = service.propose_trade(
                &alice,
                receiver,
                TradeTerms::new().offer_items([a_item.as_str()]),
            )?;
            proposed.push(trade.id);
        }

        let by_user: Vec<String> = service
            .trades_for_user(&alice)?
            .into_iter()
            .map(|t| t.id)
            .collect();
        assert_eq!(by_user, proposed);

        let by_item: Vec<String> = service
            .trades_for_item(&a_item)?
            .into_iter()
            .map(|t| t.id)
            .collect();
        assert_eq!(by_item, proposed);
        Ok(())
    }
}

// ROLE AND STATE GUARD TESTS
mod guard_tests {
    use super::*;

    /// Only the receiver may accept or reject
    #[test]
    fn only_receiver_may_respond() -> anyhow::Result<()> {
        let (service, _dir) = service("receiver_only.db")?;
        let [alice, bob, carol, a_item, b_item] = parties(&service)?;
        let trade = service.propose_trade(
            &alice,
            &bob,
            TradeTerms::new().offer_items([a_item]).request_items([b_item]),
        )?;

        for actor in [&alice, &carol] {
            for response in [TradeResponse::Accept, TradeResponse::Reject] {
                let err = service
                    .respond_to_trade(&trade.id, actor, response)
                    .unwrap_err();
                assert_eq!(err.kind(), ErrorKind::Forbidden);
            }
        }
        assert_eq!(service.get_trade(&trade.id)?.status, TradeStatus::Proposed);
        Ok(())
    }

    /// Only the proposer may cancel
    #[test]
    fn only_proposer_may_cancel() -> anyhow::Result<()> {
        let (service, _dir) = service("proposer_only.db")?;
        let [alice, bob, carol, a_item, _] = parties(&service)?;
        let trade = service.propose_trade(&alice, &bob, TradeTerms::new().offer_items([a_item]))?;

        for actor in [&bob, &carol] {
            let err = service.cancel_trade(&trade.id, actor).unwrap_err();
            assert_eq!(err.kind(), ErrorKind::Forbidden);
        }
        let trade = service.cancel_trade(&trade.id, &alice)?;
        assert_eq!(trade.status, TradeStatus::Cancelled);
        Ok(())
    }

    /// Accepting a completed trade fails and leaves it untouched
    #[test]
    fn accepting_a_completed_trade_fails() -> anyhow::Result<()> {
        let (service, _dir) = service("accept_completed.db")?;
        let [alice, bob, _, a_item, b_item] = parties(&service)?;
        let trade = service.propose_trade(
            &alice,
            &bob,
            TradeTerms::new().offer_items([a_item]).request_items([b_item]),
        )?;
        service.respond_to_trade(&trade.id, &bob, TradeResponse::Accept)?;
        service.rate_trade(&trade.id, &alice, RatingScores::new(5), None)?;
        service.rate_trade(&trade.id, &bob, RatingScores::new(5), None)?;
        let before = service.get_trade(&trade.id)?;
        assert_eq!(before.status, TradeStatus::Completed);

        let err = service
            .respond_to_trade(&trade.id, &bob, TradeResponse::Accept)
            .unwrap_err();
        assert!(matches!(
            err,
            TradeError::InvalidStateTransition {
                status: TradeStatus::Completed,
                ..
            }
        ));
        assert_eq!(service.get_trade(&trade.id)?, before);
        Ok(())
    }

    /// Tracking can only be submitted by a party, and not before acceptance
    #[test]
    fn tracking_requires_a_party_and_an_accepted_trade() -> anyhow::Result<()> {
        let (service, _dir) = service("tracking_guard.db")?;
        let [alice, bob, carol, a_item, _] = parties(&service)?;
        let trade = service.propose_trade(
            &alice,
            &bob,
            TradeTerms::new().offer_items([a_item]).request_cash(2_000),
        )?;

        let err = service
            .submit_tracking(&trade.id, &carol, "1Z1", "UPS")
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Forbidden);
        let err = service
            .submit_tracking(&trade.id, &alice, "1Z1", "UPS")
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::InvalidState);

        service.respond_to_trade(&trade.id, &bob, TradeResponse::Accept)?;
        let trade = service.submit_tracking(&trade.id, &alice, "1Z1", "UPS")?;
        assert!(trade.proposer_progress.tracking_submitted);
        assert_eq!(trade.proposer_progress.carrier.as_deref(), Some("UPS"));
        assert_eq!(trade.status, TradeStatus::Accepted);
        Ok(())
    }

    /// A missing trade is reported as not found, distinct from forbidden
    #[test]
    fn missing_trade_is_not_found() -> anyhow::Result<()> {
        let (service, _dir) = service("missing_trade.db")?;
        let [alice, ..] = parties(&service)?;
        let err = service.cancel_trade("trade_missing", &alice).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::NotFound);
        Ok(())
    }
}

// ESCROW TESTS
mod escrow_tests {
    use super::*;

    fn accepted(service: &TradeService) -> anyhow::Result<(String, String, String)> {
        let [alice, bob, _, a_item, _] = parties(service)?;
        // alice gives an item worth 1_000 and wants 1_500 cash, so she owes 500
        let trade = service.propose_trade(
            &alice,
            &bob,
            TradeTerms::new().offer_items([a_item]).request_cash(1_500),
        )?;
        service.respond_to_trade(&trade.id, &bob, TradeResponse::Accept)?;
        Ok((trade.id, alice, bob))
    }

    /// Funding twice fails with a duplicate error and leaves exactly one funded hold
    #[test]
    fn duplicate_funding_is_rejected() -> anyhow::Result<()> {
        let (service, _dir) = service("duplicate_funding.db")?;
        let (trade_id, alice, _) = accepted(&service)?;

        service.fund_escrow(&trade_id, &alice, 500)?;
        let err = service.fund_escrow(&trade_id, &alice, 500).unwrap_err();
        assert!(matches!(err, TradeError::AlreadyFunded(_)));
        assert_eq!(err.kind(), ErrorKind::Duplicate);

        let holds = service.get_escrow(&trade_id)?.holds;
        assert_eq!(holds.len(), 1);
        assert_eq!(holds[0].status, HoldStatus::Funded);
        Ok(())
    }

    /// The amount must match the differential exactly
    #[test]
    fn funding_amount_must_match() -> anyhow::Result<()> {
        let (service, _dir) = service("funding_amount.db")?;
        let (trade_id, alice, _) = accepted(&service)?;

        let err = service.fund_escrow(&trade_id, &alice, 400).unwrap_err();
        assert!(matches!(
            err,
            TradeError::Validation(ValidationError::AmountMismatch {
                amount: 400,
                required: 500
            })
        ));
        assert!(service.get_escrow(&trade_id)?.holds.is_empty());
        Ok(())
    }

    /// Release is refused until the trade has settled
    #[test]
    fn release_before_settlement_is_refused() -> anyhow::Result<()> {
        let (service, _dir) = service("early_release.db")?;
        let (trade_id, alice, bob) = accepted(&service)?;
        service.fund_escrow(&trade_id, &alice, 500)?;

        let err = service.release_escrow(&trade_id, &bob).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::InvalidState);
        Ok(())
    }

    /// A partial refund keeps the hold funded; refunding the rest returns the trade to accepted
    #[test]
    fn partial_then_full_refund() -> anyhow::Result<()> {
        let (service, _dir) = service("partial_refund.db")?;
        let (trade_id, alice, bob) = accepted(&service)?;
        service.fund_escrow(&trade_id, &alice, 500)?;

        let err = service
            .refund_escrow(&trade_id, Some(600), &bob)
            .unwrap_err();
        assert!(matches!(
            err,
            TradeError::Validation(ValidationError::RefundExceedsHold { .. })
        ));

        let hold = service.refund_escrow(&trade_id, Some(200), &bob)?;
        assert_eq!(hold.status, HoldStatus::Funded);
        assert_eq!(hold.remaining(), 300);

        let hold = service.refund_escrow(&trade_id, None, &bob)?;
        assert_eq!(hold.status, HoldStatus::Refunded);
        assert_eq!(hold.refunded_amount, 500);
        assert_eq!(service.get_trade(&trade_id)?.status, TradeStatus::Accepted);
        Ok(())
    }

    /// An even trade has nothing to escrow
    #[test]
    fn even_preview_has_no_payer() -> anyhow::Result<()> {
        let (service, _dir) = service("even_preview.db")?;
        let [alice, bob, _, a_item, b_item] = parties(&service)?;
        let preview = service.cash_differential_preview(
            &alice,
            &bob,
            &TradeTerms::new().offer_items([a_item]).request_items([b_item]),
        )?;
        assert!(preview.is_even());
        assert_eq!(preview.payer_id, None);
        Ok(())
    }

    /// A gap too wide for a u64 amount is an error, both in the preview and on accept
    #[test]
    fn oversized_differential_is_rejected() -> anyhow::Result<()> {
        let (service, _dir) = service("oversized_differential.db")?;
        let [alice, bob, ..] = parties(&service)?;
        let vault = service.list_item(&alice, "Vault", u64::MAX)?.id;
        let safe = service.list_item(&alice, "Safe", u64::MAX)?.id;
        let terms = TradeTerms::new().offer_items([vault, safe]);

        let err = service
            .cash_differential_preview(&alice, &bob, &terms)
            .unwrap_err();
        assert!(matches!(
            err,
            TradeError::Validation(ValidationError::AmountTooLarge(_))
        ));

        let trade = service.propose_trade(&alice, &bob, terms)?;
        let err = service
            .respond_to_trade(&trade.id, &bob, TradeResponse::Accept)
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Validation);
        assert_eq!(service.get_trade(&trade.id)?.status, TradeStatus::Proposed);
        Ok(())
    }
}

// RATING TESTS
mod rating_tests {
    use super::*;

    fn settled(service: &TradeService) -> anyhow::Result<(String, String, String, String)> {
        let [alice, bob, carol, a_item, b_item] = parties(service)?;
        let trade = service.propose_trade(
            &alice,
            &bob,
            TradeTerms::new().offer_items([a_item]).request_items([b_item]),
        )?;
        service.respond_to_trade(&trade.id, &bob, TradeResponse::Accept)?;
        Ok((trade.id, alice, bob, carol))
    }

    /// A second rating by the same rater fails with a duplicate error
    #[test]
    fn rating_twice_is_rejected() -> anyhow::Result<()> {
        let (service, _dir) = service("duplicate_rating.db")?;
        let (trade_id, alice, _, _) = settled(&service)?;

        service.rate_trade(&trade_id, &alice, RatingScores::new(4), None)?;
        let err = service
            .rate_trade(&trade_id, &alice, RatingScores::new(5), None)
            .unwrap_err();
        assert!(matches!(err, TradeError::AlreadyRated { .. }));
        assert!(!err.is_retryable());

        let rating = service.get_rating(&trade_id, &alice)?;
        assert_eq!(rating.scores.overall, 4);
        assert!(!rating.is_revealed);
        Ok(())
    }

    /// Scores outside 1..=5 are a validation error
    #[test]
    fn out_of_range_scores_are_rejected() -> anyhow::Result<()> {
        let (service, _dir) = service("score_range.db")?;
        let (trade_id, alice, _, _) = settled(&service)?;

        let err = service
            .rate_trade(&trade_id, &alice, RatingScores::new(6), None)
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Validation);
        Ok(())
    }

    /// Outsiders cannot rate, and nobody can rate before settlement
    #[test]
    fn rating_requires_a_party_and_a_settled_trade() -> anyhow::Result<()> {
        let (service, _dir) = service("rating_guard.db")?;
        let (trade_id, _, _, carol) = settled(&service)?;
        let err = service
            .rate_trade(&trade_id, &carol, RatingScores::new(3), None)
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Forbidden);

        let [alice, bob, _, a_item, _] = parties(&service)?;
        let open = service.propose_trade(&alice, &bob, TradeTerms::new().offer_items([a_item]))?;
        let err = service
            .rate_trade(&open.id, &alice, RatingScores::new(3), None)
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::InvalidState);
        Ok(())
    }
}

// LEDGER TESTS
mod ledger_tests {
    use super::*;

    /// Deposits go through the provider and land on the balance
    #[test]
    fn deposit_credits_the_balance() -> anyhow::Result<()> {
        let (service, _dir) = service("deposit.db")?;
        let user = service.register_user("dana", 0)?;
        let user = service.deposit_funds(&user.id, 2_500)?;
        assert_eq!(user.balance, 2_500);

        let err = service.deposit_funds(&user.id, 0).unwrap_err();
        assert!(matches!(
            err,
            TradeError::Validation(ValidationError::ZeroAmount(_))
        ));
        Ok(())
    }

    /// Items reserved by an accepted trade cannot be revalued
    #[test]
    fn reserved_items_keep_their_value() -> anyhow::Result<()> {
        let (service, _dir) = service("revalue.db")?;
        let [alice, bob, _, a_item, _] = parties(&service)?;
        service.revalue_item(&a_item, &alice, 1_200)?;
        assert_eq!(service.get_item(&a_item)?.estimated_market_value, 1_200);

        let err = service.revalue_item(&a_item, &bob, 1).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Forbidden);

        let trade = service.propose_trade(
            &alice,
            &bob,
            TradeTerms::new().offer_items([a_item.as_str()]).request_cash(100),
        )?;
        service.respond_to_trade(&trade.id, &bob, TradeResponse::Accept)?;
        let err = service.revalue_item(&a_item, &alice, 5_000).unwrap_err();
        assert!(matches!(err, TradeError::ItemReserved { .. }));
        Ok(())
    }
}
