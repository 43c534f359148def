//! Consistency tests for the Postgres ledger store

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use chrono::Utc;
    use rust_decimal::Decimal;
    use serde_json::json;
    use sqlx::PgPool;
    use uuid::Uuid;

    use marketplace_escrow_server::db::run_migrations;
    use marketplace_escrow_server::escrow::{
        split_amount, EventClaim, LedgerStore, NewWebhookEvent, Payment, PaymentStatus, Payout,
        PayoutStatus, PgLedgerStore, Recipient, StoreError, TransferAssignment,
        WebhookEventStatus,
    };

    /// Helper to create a test database pool
    async fn setup_test_db() -> PgPool {
        let database_url = std::env::var("TEST_DATABASE_URL")
            .unwrap_or_else(|_| "postgresql://localhost/marketplace_escrow_test".to_string());

        let pool = sqlx::postgres::PgPoolOptions::new()
            .max_connections(4)
            .connect(&database_url)
            .await
            .expect("Failed to connect to test database");

        run_migrations(&pool)
            .await
            .expect("Failed to run migrations");
        pool
    }

    /// Helper to create a payment held in escrow
    async fn escrowed_payment(store: &PgLedgerStore) -> Payment {
        let amount = Decimal::new(1000, 0);
        let (escrow_amount, platform_fee) = split_amount(amount, Decimal::new(10, 0));
        let now = Utc::now();
        let payment = Payment {
            id: Uuid::new_v4(),
            booking_id: Uuid::new_v4(),
            provider_id: Uuid::new_v4(),
            amount,
            currency: "NGN".to_string(),
            status: PaymentStatus::Pending,
            processor_reference: format!("pay_{}", Uuid::new_v4().simple()),
            escrow_amount,
            platform_fee,
            needs_review: false,
            review_reason: None,
            created_at: now,
            updated_at: now,
        };

        store.insert_payment(&payment).await.unwrap();
        store
            .transition_payment(payment.id, PaymentStatus::Pending, PaymentStatus::Escrow)
            .await
            .unwrap()
    }

    const LEASE: Duration = Duration::from_secs(60);

    fn assignment(payout: &Payout, attempt: i32) -> TransferAssignment {
        TransferAssignment {
            reference: format!("po_{}_{}_test", payout.id.simple(), attempt),
            transfer_code: format!("TRF_{}", attempt),
            recipient_code: "RCP_test".to_string(),
        }
    }

    #[tokio::test]
    #[ignore] // Requires database setup
    async fn test_duplicate_booking_is_conflict() {
        let store = PgLedgerStore::new(setup_test_db().await);
        let payment = escrowed_payment(&store).await;

        let mut duplicate = payment.clone();
        duplicate.id = Uuid::new_v4();
        duplicate.processor_reference = format!("pay_{}", Uuid::new_v4().simple());

        let result = store.insert_payment(&duplicate).await;
        assert!(matches!(result, Err(StoreError::Conflict(_))));
    }

    #[tokio::test]
    #[ignore] // Requires database setup
    async fn test_one_active_payout_per_payment() {
        let store = PgLedgerStore::new(setup_test_db().await);
        let payment = escrowed_payment(&store).await;

        let payout_a = Payout::for_payment(&payment);
        let payout_b = Payout::for_payment(&payment);
        let (first, second) = tokio::join!(
            store.insert_payout(&payout_a),
            store.insert_payout(&payout_b),
        );
        assert_eq!([first.is_ok(), second.is_ok()].iter().filter(|ok| **ok).count(), 1);

        let payouts = store.list_payouts_for_payment(payment.id).await.unwrap();
        assert_eq!(payouts.len(), 1);
    }

    #[tokio::test]
    #[ignore] // Requires database setup
    async fn test_completion_releases_payment_atomically() {
        let store = PgLedgerStore::new(setup_test_db().await);
        let payment = escrowed_payment(&store).await;
        let payout = store.insert_payout(&Payout::for_payment(&payment)).await.unwrap();

        // not yet processing
        assert!(matches!(
            store.complete_payout(payout.id).await,
            Err(StoreError::Conflict(_))
        ));

        let first = assignment(&payout, 1);
        store
            .claim_payout_attempt(payout.id, &first.reference)
            .await
            .unwrap();
        store.record_transfer(payout.id, &first).await.unwrap();
        let (completed, released) = store.complete_payout(payout.id).await.unwrap();

        assert_eq!(completed.status, PayoutStatus::Completed);
        assert_eq!(released.status, PaymentStatus::Released);

        // a second verdict finds nothing to complete
        assert!(store.complete_payout(payout.id).await.is_err());
    }

    #[tokio::test]
    #[ignore] // Requires database setup
    async fn test_failure_keeps_funds_in_escrow() {
        let store = PgLedgerStore::new(setup_test_db().await);
        let payment = escrowed_payment(&store).await;
        let payout = store.insert_payout(&Payout::for_payment(&payment)).await.unwrap();
        let first = assignment(&payout, 1);

        store
            .claim_payout_attempt(payout.id, &first.reference)
            .await
            .unwrap();
        let requeued = store
            .requeue_payout(payout.id, PayoutStatus::Processing, 1, "transfer.failed")
            .await
            .unwrap();
        assert_eq!(requeued.status, PayoutStatus::Pending);
        assert_eq!(requeued.attempts, 1);

        // a reference is never reused
        assert!(store
            .claim_payout_attempt(payout.id, &first.reference)
            .await
            .is_err());

        store
            .claim_payout_attempt(payout.id, &assignment(&payout, 2).reference)
            .await
            .unwrap();
        let (failed, held) = store
            .fail_payout(payout.id, PayoutStatus::Processing, 2, "transfer.failed")
            .await
            .unwrap();

        assert_eq!(failed.status, PayoutStatus::Failed);
        assert_eq!(held.status, PaymentStatus::Escrow);
        assert!(held.needs_review);

        // refund is allowed once no payout is active
        let refunded = store.refund_payment(payment.id).await.unwrap();
        assert_eq!(refunded.status, PaymentStatus::Refunded);
    }

    #[tokio::test]
    #[ignore] // Requires database setup
    async fn test_concurrent_attempt_claims() {
        let store = PgLedgerStore::new(setup_test_db().await);
        let payment = escrowed_payment(&store).await;
        let payout = store.insert_payout(&Payout::for_payment(&payment)).await.unwrap();
        let (a, b) = (assignment(&payout, 1), assignment(&payout, 101));

        let (first, second) = tokio::join!(
            store.claim_payout_attempt(payout.id, &a.reference),
            store.claim_payout_attempt(payout.id, &b.reference),
        );
        assert_eq!([first.is_ok(), second.is_ok()].iter().filter(|ok| **ok).count(), 1);

        let claimed = store.get_payout(payout.id).await.unwrap().unwrap();
        assert_eq!(claimed.status, PayoutStatus::Processing);
        assert_eq!(claimed.transfer_code, None);
        let unconfirmed = store.list_unconfirmed_dispatches().await.unwrap();
        assert!(unconfirmed.iter().any(|p| p.id == payout.id));

        // only the winning reference can record its transfer
        let winner = if first.is_ok() { &a } else { &b };
        let loser = if first.is_ok() { &b } else { &a };
        assert!(matches!(
            store.record_transfer(payout.id, loser).await,
            Err(StoreError::Conflict(_))
        ));
        let recorded = store.record_transfer(payout.id, winner).await.unwrap();
        assert_eq!(recorded.transfer_code.as_deref(), Some(winner.transfer_code.as_str()));

        let flagged = store
            .flag_payment_for_review(payment.id, "outcome unknown")
            .await
            .unwrap();
        assert!(flagged.needs_review);
    }

    #[tokio::test]
    #[ignore] // Requires database setup
    async fn test_webhook_claim_is_check_and_set() {
        let pool = setup_test_db().await;
        let store = PgLedgerStore::new(pool.clone());
        let event = NewWebhookEvent {
            external_id: format!("evt_{}", Uuid::new_v4()),
            event_type: "transfer.success".to_string(),
            payload: json!({"reference": "po_1"}),
        };

        let (a, b) = tokio::join!(
            store.claim_webhook_event(&event, LEASE),
            store.claim_webhook_event(&event, LEASE),
        );
        let claims = [a.unwrap(), b.unwrap()];
        assert_eq!(claims.iter().filter(|c| **c == EventClaim::Claimed).count(), 1);

        // a failed event may be claimed again
        store
            .complete_webhook_event(&event.external_id, Some("payout not found"))
            .await
            .unwrap();
        assert_eq!(
            store.claim_webhook_event(&event, LEASE).await.unwrap(),
            EventClaim::Claimed
        );

        store
            .complete_webhook_event(&event.external_id, None)
            .await
            .unwrap();
        assert_eq!(
            store.claim_webhook_event(&event, LEASE).await.unwrap(),
            EventClaim::AlreadyProcessed
        );

        let status: WebhookEventStatus =
            sqlx::query_scalar("SELECT status FROM webhook_events WHERE external_id = $1")
                .bind(&event.external_id)
                .fetch_one(&pool)
                .await
                .unwrap();
        assert_eq!(status, WebhookEventStatus::Processed);
    }

    #[tokio::test]
    #[ignore] // Requires database setup
    async fn test_abandoned_webhook_claim_is_reclaimed() {
        let store = PgLedgerStore::new(setup_test_db().await);
        let event = NewWebhookEvent {
            external_id: format!("evt_{}", Uuid::new_v4()),
            event_type: "transfer.success".to_string(),
            payload: json!({"reference": "po_2"}),
        };
        let lease = Duration::from_millis(200);

        assert_eq!(
            store.claim_webhook_event(&event, lease).await.unwrap(),
            EventClaim::Claimed
        );
        assert_eq!(
            store.claim_webhook_event(&event, lease).await.unwrap(),
            EventClaim::InFlight
        );

        tokio::time::sleep(Duration::from_millis(500)).await;
        assert_eq!(
            store.claim_webhook_event(&event, lease).await.unwrap(),
            EventClaim::Claimed
        );
    }

    #[tokio::test]
    #[ignore] // Requires database setup
    async fn test_recipient_code_cleared_on_new_destination() {
        let store = PgLedgerStore::new(setup_test_db().await);
        let now = Utc::now();
        let recipient = Recipient {
            provider_id: Uuid::new_v4(),
            bank_code: "058".to_string(),
            account_number: "0123456789".to_string(),
            account_name: "Ada Obi".to_string(),
            recipient_code: None,
            created_at: now,
            updated_at: now,
        };

        let stored = store.upsert_recipient(&recipient).await.unwrap();
        let cached = store.set_recipient_code(&stored, "RCP_first").await.unwrap();
        assert_eq!(cached.recipient_code.as_deref(), Some("RCP_first"));

        let same = store.upsert_recipient(&recipient).await.unwrap();
        assert_eq!(same.recipient_code.as_deref(), Some("RCP_first"));

        let mut moved = recipient.clone();
        moved.account_number = "9876543210".to_string();
        let moved = store.upsert_recipient(&moved).await.unwrap();
        assert_eq!(moved.recipient_code, None);

        // a code created for the old destination is refused
        assert!(matches!(
            store.set_recipient_code(&stored, "RCP_stale").await,
            Err(StoreError::Conflict(_))
        ));
    }
}
