//! PostgreSQL ledger store
//!
//! Multi-row operations run in one transaction and take row locks before
//! checking preconditions. Lock order is always payment row, then payout row.

use std::time::Duration;

use async_trait::async_trait;
use sqlx::{PgConnection, PgPool};
use uuid::Uuid;

use super::error::{StoreError, StoreResult};
use super::model::{
    EventClaim, NewWebhookEvent, Payment, PaymentStatus, Payout, PayoutStatus, Recipient,
    TransferAssignment, WebhookEventStatus,
};
use super::store::LedgerStore;

#[derive(Clone)]
pub struct PgLedgerStore {
    pool: PgPool,
}

impl PgLedgerStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

async fn lock_payment(conn: &mut PgConnection, id: Uuid) -> StoreResult<Payment> {
    sqlx::query_as::<_, Payment>("SELECT * FROM payments WHERE id = $1 FOR UPDATE")
        .bind(id)
        .fetch_optional(conn)
        .await?
        .ok_or_else(|| StoreError::NotFound(format!("payment {}", id)))
}

async fn lock_payout(conn: &mut PgConnection, id: Uuid) -> StoreResult<Payout> {
    sqlx::query_as::<_, Payout>("SELECT * FROM payouts WHERE id = $1 FOR UPDATE")
        .bind(id)
        .fetch_optional(conn)
        .await?
        .ok_or_else(|| StoreError::NotFound(format!("payout {}", id)))
}

/// Lock a payout together with its payment, payment first
async fn lock_payout_with_payment(
    conn: &mut PgConnection,
    payout_id: Uuid,
) -> StoreResult<(Payout, Payment)> {
    let payment_id: Uuid = sqlx::query_scalar("SELECT payment_id FROM payouts WHERE id = $1")
        .bind(payout_id)
        .fetch_optional(&mut *conn)
        .await?
        .ok_or_else(|| StoreError::NotFound(format!("payout {}", payout_id)))?;

    let payment = lock_payment(&mut *conn, payment_id).await?;
    let payout = lock_payout(&mut *conn, payout_id).await?;
    Ok((payout, payment))
}

async fn has_payout_in(
    conn: &mut PgConnection,
    payment_id: Uuid,
    statuses: &[PayoutStatus],
) -> StoreResult<bool> {
    let names: Vec<String> = statuses
        .iter()
        .map(|status| status.as_str().to_lowercase())
        .collect();

    let exists: bool = sqlx::query_scalar(
        "SELECT EXISTS(SELECT 1 FROM payouts WHERE payment_id = $1 AND status::text = ANY($2))",
    )
    .bind(payment_id)
    .bind(names)
    .fetch_one(conn)
    .await?;

    Ok(exists)
}

fn expect_payment(payment: &Payment, expected: PaymentStatus) -> StoreResult<()> {
    if payment.status != expected {
        return Err(StoreError::Conflict(format!(
            "payment {} is {}, expected {}",
            payment.id, payment.status, expected
        )));
    }
    Ok(())
}

fn expect_payout(payout: &Payout, expected: PayoutStatus) -> StoreResult<()> {
    if payout.status != expected {
        return Err(StoreError::Conflict(format!(
            "payout {} is {}, expected {}",
            payout.id, payout.status, expected
        )));
    }
    Ok(())
}

#[async_trait]
impl LedgerStore for PgLedgerStore {
    async fn insert_payment(&self, payment: &Payment) -> StoreResult<Payment> {
        let payment = sqlx::query_as::<_, Payment>(
            r#"
            INSERT INTO payments (
                id, booking_id, provider_id, amount, currency, status, processor_reference,
                escrow_amount, platform_fee, needs_review, review_reason, created_at, updated_at
            )
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13)
            RETURNING *
            "#,
        )
        .bind(payment.id)
        .bind(payment.booking_id)
        .bind(payment.provider_id)
        .bind(payment.amount)
        .bind(&payment.currency)
        .bind(payment.status)
        .bind(&payment.processor_reference)
        .bind(payment.escrow_amount)
        .bind(payment.platform_fee)
        .bind(payment.needs_review)
        .bind(&payment.review_reason)
        .bind(payment.created_at)
        .bind(payment.updated_at)
        .fetch_one(&self.pool)
        .await?;

        Ok(payment)
    }

    async fn get_payment(&self, id: Uuid) -> StoreResult<Option<Payment>> {
        let payment = sqlx::query_as::<_, Payment>("SELECT * FROM payments WHERE id = $1")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;

        Ok(payment)
    }

    async fn find_payment_by_reference(
        &self,
        processor_reference: &str,
    ) -> StoreResult<Option<Payment>> {
        let payment =
            sqlx::query_as::<_, Payment>("SELECT * FROM payments WHERE processor_reference = $1")
                .bind(processor_reference)
                .fetch_optional(&self.pool)
                .await?;

        Ok(payment)
    }

    async fn transition_payment(
        &self,
        id: Uuid,
        from: PaymentStatus,
        to: PaymentStatus,
    ) -> StoreResult<Payment> {
        let mut tx = self.pool.begin().await?;

        let payment = lock_payment(&mut tx, id).await?;
        expect_payment(&payment, from)?;

        let payment = sqlx::query_as::<_, Payment>(
            "UPDATE payments SET status = $2, updated_at = NOW() WHERE id = $1 RETURNING *",
        )
        .bind(id)
        .bind(to)
        .fetch_one(&mut *tx)
        .await?;

        tx.commit().await?;
        Ok(payment)
    }

    async fn refund_payment(&self, id: Uuid) -> StoreResult<Payment> {
        let mut tx = self.pool.begin().await?;

        let payment = lock_payment(&mut tx, id).await?;
        expect_payment(&payment, PaymentStatus::Escrow)?;

        if has_payout_in(
            &mut tx,
            id,
            &[PayoutStatus::Pending, PayoutStatus::Processing],
        )
        .await?
        {
            return Err(StoreError::Conflict(format!(
                "payment {} has a payout in flight",
                id
            )));
        }

        let payment = sqlx::query_as::<_, Payment>(
            r#"
            UPDATE payments
            SET status = $2, needs_review = FALSE, review_reason = NULL, updated_at = NOW()
            WHERE id = $1
            RETURNING *
            "#,
        )
        .bind(id)
        .bind(PaymentStatus::Refunded)
        .fetch_one(&mut *tx)
        .await?;

        tx.commit().await?;
        Ok(payment)
    }

    async fn insert_payout(&self, payout: &Payout) -> StoreResult<Payout> {
        let mut tx = self.pool.begin().await?;

        let payment = lock_payment(&mut tx, payout.payment_id).await?;
        expect_payment(&payment, PaymentStatus::Escrow)?;

        if has_payout_in(
            &mut tx,
            payout.payment_id,
            &[
                PayoutStatus::Pending,
                PayoutStatus::Processing,
                PayoutStatus::Completed,
            ],
        )
        .await?
        {
            return Err(StoreError::Conflict(format!(
                "payment {} already has an active payout",
                payout.payment_id
            )));
        }

        let inserted = sqlx::query_as::<_, Payout>(
            r#"
            INSERT INTO payouts (
                id, payment_id, provider_id, amount, currency, status, transfer_code,
                recipient_code, transfer_reference, attempts, retries_halted, last_error,
                created_at, updated_at
            )
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14)
            RETURNING *
            "#,
        )
        .bind(payout.id)
        .bind(payout.payment_id)
        .bind(payout.provider_id)
        .bind(payout.amount)
        .bind(&payout.currency)
        .bind(payout.status)
        .bind(&payout.transfer_code)
        .bind(&payout.recipient_code)
        .bind(&payout.transfer_reference)
        .bind(payout.attempts)
        .bind(payout.retries_halted)
        .bind(&payout.last_error)
        .bind(payout.created_at)
        .bind(payout.updated_at)
        .fetch_one(&mut *tx)
        .await?;

        sqlx::query(
            r#"
            UPDATE payments
            SET needs_review = FALSE, review_reason = NULL, updated_at = NOW()
            WHERE id = $1
            "#,
        )
        .bind(payout.payment_id)
        .execute(&mut *tx)
        .await?;

        tx.commit().await?;
        Ok(inserted)
    }

    async fn get_payout(&self, id: Uuid) -> StoreResult<Option<Payout>> {
        let payout = sqlx::query_as::<_, Payout>("SELECT * FROM payouts WHERE id = $1")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;

        Ok(payout)
    }

    async fn find_payout_by_reference(&self, reference: &str) -> StoreResult<Option<Payout>> {
        let payout =
            sqlx::query_as::<_, Payout>("SELECT * FROM payouts WHERE transfer_reference = $1")
                .bind(reference)
                .fetch_optional(&self.pool)
                .await?;

        Ok(payout)
    }

    async fn list_payouts_for_payment(&self, payment_id: Uuid) -> StoreResult<Vec<Payout>> {
        let payouts = sqlx::query_as::<_, Payout>(
            "SELECT * FROM payouts WHERE payment_id = $1 ORDER BY created_at",
        )
        .bind(payment_id)
        .fetch_all(&self.pool)
        .await?;

        Ok(payouts)
    }

    async fn list_pending_payouts(&self) -> StoreResult<Vec<Payout>> {
        let payouts = sqlx::query_as::<_, Payout>(
            r#"
            SELECT * FROM payouts
            WHERE status = $1 AND retries_halted = FALSE
            ORDER BY created_at
            "#,
        )
        .bind(PayoutStatus::Pending)
        .fetch_all(&self.pool)
        .await?;

        Ok(payouts)
    }

    async fn claim_payout_attempt(&self, id: Uuid, reference: &str) -> StoreResult<Payout> {
        let mut tx = self.pool.begin().await?;

        let payout = lock_payout(&mut tx, id).await?;
        expect_payout(&payout, PayoutStatus::Pending)?;
        if payout.retries_halted {
            return Err(StoreError::Conflict(format!(
                "payout {} has retries halted",
                payout.id
            )));
        }
        if payout.transfer_reference.as_deref() == Some(reference) {
            return Err(StoreError::Conflict(format!(
                "reference {} was already used",
                reference
            )));
        }

        // the unique index on transfer_reference turns a reference taken by
        // another payout into a Conflict
        let payout = sqlx::query_as::<_, Payout>(
            r#"
            UPDATE payouts
            SET status = $2, transfer_reference = $3, transfer_code = NULL, recipient_code = NULL,
                last_error = NULL, updated_at = NOW()
            WHERE id = $1
            RETURNING *
            "#,
        )
        .bind(id)
        .bind(PayoutStatus::Processing)
        .bind(reference)
        .fetch_one(&mut *tx)
        .await?;

        tx.commit().await?;
        Ok(payout)
    }

    async fn record_transfer(
        &self,
        id: Uuid,
        assignment: &TransferAssignment,
    ) -> StoreResult<Payout> {
        let payout = sqlx::query_as::<_, Payout>(
            r#"
            UPDATE payouts
            SET transfer_code = $3, recipient_code = $4, updated_at = NOW()
            WHERE id = $1 AND status = $2 AND transfer_reference = $5
            RETURNING *
            "#,
        )
        .bind(id)
        .bind(PayoutStatus::Processing)
        .bind(&assignment.transfer_code)
        .bind(&assignment.recipient_code)
        .bind(&assignment.reference)
        .fetch_optional(&self.pool)
        .await?;

        payout.ok_or_else(|| {
            StoreError::Conflict(format!(
                "payout {} no longer holds the claim for {}",
                id, assignment.reference
            ))
        })
    }

    async fn list_unconfirmed_dispatches(&self) -> StoreResult<Vec<Payout>> {
        let payouts = sqlx::query_as::<_, Payout>(
            r#"
            SELECT * FROM payouts
            WHERE status = $1 AND transfer_code IS NULL
            ORDER BY created_at
            "#,
        )
        .bind(PayoutStatus::Processing)
        .fetch_all(&self.pool)
        .await?;

        Ok(payouts)
    }

    async fn flag_payment_for_review(&self, id: Uuid, reason: &str) -> StoreResult<Payment> {
        let payment = sqlx::query_as::<_, Payment>(
            r#"
            UPDATE payments
            SET needs_review = TRUE, review_reason = $3, updated_at = NOW()
            WHERE id = $1 AND status = $2
            RETURNING *
            "#,
        )
        .bind(id)
        .bind(PaymentStatus::Escrow)
        .bind(reason)
        .fetch_optional(&self.pool)
        .await?;

        payment.ok_or_else(|| StoreError::Conflict(format!("payment {} is not in escrow", id)))
    }

    async fn requeue_payout(
        &self,
        id: Uuid,
        from: PayoutStatus,
        attempts: i32,
        error: &str,
    ) -> StoreResult<Payout> {
        let mut tx = self.pool.begin().await?;

        let payout = lock_payout(&mut tx, id).await?;
        expect_payout(&payout, from)?;

        let payout = sqlx::query_as::<_, Payout>(
            r#"
            UPDATE payouts
            SET status = $2, attempts = $3, last_error = $4, updated_at = NOW()
            WHERE id = $1
            RETURNING *
            "#,
        )
        .bind(id)
        .bind(PayoutStatus::Pending)
        .bind(attempts)
        .bind(error)
        .fetch_one(&mut *tx)
        .await?;

        tx.commit().await?;
        Ok(payout)
    }

    async fn complete_payout(&self, id: Uuid) -> StoreResult<(Payout, Payment)> {
        let mut tx = self.pool.begin().await?;

        let (payout, payment) = lock_payout_with_payment(&mut tx, id).await?;
        expect_payout(&payout, PayoutStatus::Processing)?;
        expect_payment(&payment, PaymentStatus::Escrow)?;

        let payout = sqlx::query_as::<_, Payout>(
            r#"
            UPDATE payouts
            SET status = $2, last_error = NULL, updated_at = NOW()
            WHERE id = $1
            RETURNING *
            "#,
        )
        .bind(id)
        .bind(PayoutStatus::Completed)
        .fetch_one(&mut *tx)
        .await?;

        let payment = sqlx::query_as::<_, Payment>(
            r#"
            UPDATE payments
            SET status = $2, needs_review = FALSE, review_reason = NULL, updated_at = NOW()
            WHERE id = $1
            RETURNING *
            "#,
        )
        .bind(payment.id)
        .bind(PaymentStatus::Released)
        .fetch_one(&mut *tx)
        .await?;

        tx.commit().await?;
        Ok((payout, payment))
    }

    async fn fail_payout(
        &self,
        id: Uuid,
        from: PayoutStatus,
        attempts: i32,
        error: &str,
    ) -> StoreResult<(Payout, Payment)> {
        let mut tx = self.pool.begin().await?;

        let (payout, payment) = lock_payout_with_payment(&mut tx, id).await?;
        expect_payout(&payout, from)?;

        let payout = sqlx::query_as::<_, Payout>(
            r#"
            UPDATE payouts
            SET status = $2, attempts = $3, last_error = $4, updated_at = NOW()
            WHERE id = $1
            RETURNING *
            "#,
        )
        .bind(id)
        .bind(PayoutStatus::Failed)
        .bind(attempts)
        .bind(error)
        .fetch_one(&mut *tx)
        .await?;

        let payment = sqlx::query_as::<_, Payment>(
            r#"
            UPDATE payments
            SET needs_review = TRUE, review_reason = $2, updated_at = NOW()
            WHERE id = $1
            RETURNING *
            "#,
        )
        .bind(payment.id)
        .bind(error)
        .fetch_one(&mut *tx)
        .await?;

        tx.commit().await?;
        Ok((payout, payment))
    }

    async fn halt_payout_retries(&self, id: Uuid) -> StoreResult<Payout> {
        let mut tx = self.pool.begin().await?;

        let payout = lock_payout(&mut tx, id).await?;
        if payout.status.is_terminal() {
            return Err(StoreError::Conflict(format!(
                "payout {} is already {}",
                payout.id, payout.status
            )));
        }

        let payout = sqlx::query_as::<_, Payout>(
            "UPDATE payouts SET retries_halted = TRUE, updated_at = NOW() WHERE id = $1 RETURNING *",
        )
        .bind(id)
        .fetch_one(&mut *tx)
        .await?;

        tx.commit().await?;
        Ok(payout)
    }

    async fn get_recipient(&self, provider_id: Uuid) -> StoreResult<Option<Recipient>> {
        let recipient =
            sqlx::query_as::<_, Recipient>("SELECT * FROM recipients WHERE provider_id = $1")
                .bind(provider_id)
                .fetch_optional(&self.pool)
                .await?;

        Ok(recipient)
    }

    async fn upsert_recipient(&self, recipient: &Recipient) -> StoreResult<Recipient> {
        let recipient = sqlx::query_as::<_, Recipient>(
            r#"
            INSERT INTO recipients (
                provider_id, bank_code, account_number, account_name, recipient_code,
                created_at, updated_at
            )
            VALUES ($1, $2, $3, $4, NULL, NOW(), NOW())
            ON CONFLICT (provider_id) DO UPDATE SET
                recipient_code = CASE
                    WHEN recipients.bank_code = EXCLUDED.bank_code
                     AND recipients.account_number = EXCLUDED.account_number
                     AND recipients.account_name = EXCLUDED.account_name
                    THEN recipients.recipient_code
                    ELSE NULL
                END,
                bank_code = EXCLUDED.bank_code,
                account_number = EXCLUDED.account_number,
                account_name = EXCLUDED.account_name,
                updated_at = NOW()
            RETURNING *
            "#,
        )
        .bind(recipient.provider_id)
        .bind(&recipient.bank_code)
        .bind(&recipient.account_number)
        .bind(&recipient.account_name)
        .fetch_one(&self.pool)
        .await?;

        Ok(recipient)
    }

    async fn set_recipient_code(
        &self,
        snapshot: &Recipient,
        code: &str,
    ) -> StoreResult<Recipient> {
        let mut tx = self.pool.begin().await?;

        let current = sqlx::query_as::<_, Recipient>(
            "SELECT * FROM recipients WHERE provider_id = $1 FOR UPDATE",
        )
        .bind(snapshot.provider_id)
        .fetch_optional(&mut *tx)
        .await?
        .ok_or_else(|| StoreError::NotFound(format!("recipient {}", snapshot.provider_id)))?;

        if !current.same_destination(snapshot) {
            return Err(StoreError::Conflict(format!(
                "payout destination for provider {} changed",
                snapshot.provider_id
            )));
        }

        if current.recipient_code.is_some() {
            tx.commit().await?;
            return Ok(current);
        }

        let recipient = sqlx::query_as::<_, Recipient>(
            r#"
            UPDATE recipients SET recipient_code = $2, updated_at = NOW()
            WHERE provider_id = $1
            RETURNING *
            "#,
        )
        .bind(snapshot.provider_id)
        .bind(code)
        .fetch_one(&mut *tx)
        .await?;

        tx.commit().await?;
        Ok(recipient)
    }

    async fn claim_webhook_event(
        &self,
        event: &NewWebhookEvent,
        lease: Duration,
    ) -> StoreResult<EventClaim> {
        // New events are inserted. Events that errored, or whose handler held
        // the claim past the lease, are reclaimed.
        let claimed: Option<String> = sqlx::query_scalar(
            r#"
            INSERT INTO webhook_events (external_id, event_type, status, payload, created_at, updated_at)
            VALUES ($1, $2, $3, $4, NOW(), NOW())
            ON CONFLICT (external_id) DO UPDATE SET
                status = EXCLUDED.status,
                payload = EXCLUDED.payload,
                error = NULL,
                updated_at = NOW()
            WHERE webhook_events.status = $5
               OR (webhook_events.status = $3
                   AND webhook_events.updated_at < NOW() - make_interval(secs => $6))
            RETURNING external_id
            "#,
        )
        .bind(&event.external_id)
        .bind(&event.event_type)
        .bind(WebhookEventStatus::Received)
        .bind(&event.payload)
        .bind(WebhookEventStatus::Error)
        .bind(lease.as_secs_f64())
        .fetch_optional(&self.pool)
        .await?;

        if claimed.is_some() {
            return Ok(EventClaim::Claimed);
        }

        let status: Option<WebhookEventStatus> =
            sqlx::query_scalar("SELECT status FROM webhook_events WHERE external_id = $1")
                .bind(&event.external_id)
                .fetch_optional(&self.pool)
                .await?;

        match status {
            Some(WebhookEventStatus::Processed) => Ok(EventClaim::AlreadyProcessed),
            _ => Ok(EventClaim::InFlight),
        }
    }

    async fn complete_webhook_event(
        &self,
        external_id: &str,
        error: Option<&str>,
    ) -> StoreResult<()> {
        let status = match error {
            Some(_) => WebhookEventStatus::Error,
            None => WebhookEventStatus::Processed,
        };

        let result = sqlx::query(
            r#"
            UPDATE webhook_events
            SET status = $2, error = $3, updated_at = NOW()
            WHERE external_id = $1
            "#,
        )
        .bind(external_id)
        .bind(status)
        .bind(error)
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            return Err(StoreError::NotFound(format!("webhook event {}", external_id)));
        }
        Ok(())
    }

    async fn ping(&self) -> StoreResult<()> {
        sqlx::query("SELECT 1").execute(&self.pool).await?;
        Ok(())
    }
}
