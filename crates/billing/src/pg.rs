//! Postgres entitlement store
//!
//! Every multi-entity operation runs inside one transaction with a single
//! commit point. The owner's account row (`SELECT ... FOR UPDATE`) is the
//! serialization point for concurrent activations; the partial unique index
//! on Success payment rows turns a lost race into a retryable conflict
//! instead of a double-activation. Transactions are committed or dropped
//! (rolled back) before any return.

use async_trait::async_trait;
use sqlx::PgPool;
use time::OffsetDateTime;
use uuid::Uuid;

use bidcraft_shared::{AccountRole, BillingStatus};

use crate::error::{BillingError, BillingResult};
use crate::store::{ActivationCommit, EntitlementStore};
use crate::types::{
    AccountProfile, BillingCycle, NewPayment, Payment, PaymentStatus, Plan, QuotaCounter,
    QuotaSet, QuotaUsage, Subscription,
};

/// Stuck "processing" claims older than this may be re-claimed.
const CLAIM_RECOVERY_MINUTES: i32 = 30;

pub struct PgStore {
    pool: PgPool,
}

impl PgStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[derive(sqlx::FromRow)]
struct PlanRow {
    id: Uuid,
    name: String,
    monthly_price_cents: i64,
    yearly_price_cents: i64,
    gateway_product_ref: Option<String>,
    gateway_price_monthly: Option<String>,
    gateway_price_yearly: Option<String>,
    editor_seats: i64,
    viewer_seats: i64,
    rfp_credits: i64,
    grant_credits: i64,
    is_active: bool,
    is_custom: bool,
}

impl From<PlanRow> for Plan {
    fn from(row: PlanRow) -> Self {
        Plan {
            id: row.id,
            name: row.name,
            monthly_price_cents: row.monthly_price_cents,
            yearly_price_cents: row.yearly_price_cents,
            gateway_product_ref: row.gateway_product_ref,
            gateway_price_monthly: row.gateway_price_monthly,
            gateway_price_yearly: row.gateway_price_yearly,
            quotas: QuotaSet {
                editor_seats: row.editor_seats,
                viewer_seats: row.viewer_seats,
                rfp_credits: row.rfp_credits,
                grant_credits: row.grant_credits,
            },
            is_active: row.is_active,
            is_custom: row.is_custom,
        }
    }
}

const PLAN_COLUMNS: &str = "id, name, monthly_price_cents, yearly_price_cents, \
     gateway_product_ref, gateway_price_monthly, gateway_price_yearly, \
     editor_seats, viewer_seats, rfp_credits, grant_credits, is_active, is_custom";

#[derive(sqlx::FromRow)]
struct SubscriptionRow {
    id: Uuid,
    account_id: Uuid,
    plan_name: String,
    price_cents: i64,
    billing_cycle: String,
    start_date: OffsetDateTime,
    end_date: OffsetDateTime,
    renewal_date: Option<OffsetDateTime>,
    auto_renew: bool,
    canceled_at: Option<OffsetDateTime>,
    gateway_subscription_ref: Option<String>,
    gateway_price_ref: Option<String>,
    gateway_product_ref: Option<String>,
    max_editor_seats: i64,
    used_editor_seats: i64,
    max_viewer_seats: i64,
    used_viewer_seats: i64,
    max_rfp_credits: i64,
    used_rfp_credits: i64,
    max_grant_credits: i64,
    used_grant_credits: i64,
}

impl TryFrom<SubscriptionRow> for Subscription {
    type Error = BillingError;

    fn try_from(row: SubscriptionRow) -> Result<Self, Self::Error> {
        let billing_cycle = BillingCycle::parse(&row.billing_cycle).ok_or_else(|| {
            BillingError::Database(format!("unknown billing cycle '{}'", row.billing_cycle))
        })?;
        Ok(Subscription {
            id: row.id,
            account_id: row.account_id,
            plan_name: row.plan_name,
            price_cents: row.price_cents,
            billing_cycle,
            start_date: row.start_date,
            end_date: row.end_date,
            renewal_date: row.renewal_date,
            auto_renew: row.auto_renew,
            canceled_at: row.canceled_at,
            gateway_subscription_ref: row.gateway_subscription_ref,
            gateway_price_ref: row.gateway_price_ref,
            gateway_product_ref: row.gateway_product_ref,
            quotas: QuotaUsage {
                editor_seats: QuotaCounter {
                    max: row.max_editor_seats,
                    used: row.used_editor_seats,
                },
                viewer_seats: QuotaCounter {
                    max: row.max_viewer_seats,
                    used: row.used_viewer_seats,
                },
                rfp_credits: QuotaCounter {
                    max: row.max_rfp_credits,
                    used: row.used_rfp_credits,
                },
                grant_credits: QuotaCounter {
                    max: row.max_grant_credits,
                    used: row.used_grant_credits,
                },
            },
        })
    }
}

const SUBSCRIPTION_COLUMNS: &str = "id, account_id, plan_name, price_cents, billing_cycle, \
     start_date, end_date, renewal_date, auto_renew, canceled_at, \
     gateway_subscription_ref, gateway_price_ref, gateway_product_ref, \
     max_editor_seats, used_editor_seats, max_viewer_seats, used_viewer_seats, \
     max_rfp_credits, used_rfp_credits, max_grant_credits, used_grant_credits";

#[derive(sqlx::FromRow)]
struct PaymentRow {
    id: Uuid,
    account_id: Uuid,
    subscription_id: Option<Uuid>,
    amount_cents: i64,
    status: String,
    gateway_txn_ref: Option<String>,
    gateway_session_ref: Option<String>,
    refund_ref: Option<String>,
    failure_reason: Option<String>,
    plan_name: String,
    payer_name: String,
    paid_at: OffsetDateTime,
}

impl TryFrom<PaymentRow> for Payment {
    type Error = BillingError;

    fn try_from(row: PaymentRow) -> Result<Self, Self::Error> {
        let status = PaymentStatus::parse(&row.status).ok_or_else(|| {
            BillingError::Database(format!("unknown payment status '{}'", row.status))
        })?;
        Ok(Payment {
            id: row.id,
            account_id: row.account_id,
            subscription_id: row.subscription_id,
            amount_cents: row.amount_cents,
            status,
            gateway_txn_ref: row.gateway_txn_ref,
            gateway_session_ref: row.gateway_session_ref,
            refund_ref: row.refund_ref,
            failure_reason: row.failure_reason,
            plan_name: row.plan_name,
            payer_name: row.payer_name,
            paid_at: row.paid_at,
        })
    }
}

const PAYMENT_COLUMNS: &str = "id, account_id, subscription_id, amount_cents, status, \
     gateway_txn_ref, gateway_session_ref, refund_ref, failure_reason, \
     plan_name, payer_name, paid_at";

#[derive(sqlx::FromRow)]
struct AccountRow {
    id: Uuid,
    email: String,
    display_name: String,
    role: String,
    billing_status: String,
    gateway_customer_ref: Option<String>,
}

impl TryFrom<AccountRow> for AccountProfile {
    type Error = BillingError;

    fn try_from(row: AccountRow) -> Result<Self, Self::Error> {
        let role = AccountRole::parse(&row.role)
            .ok_or_else(|| BillingError::Database(format!("unknown role '{}'", row.role)))?;
        let billing_status = BillingStatus::parse(&row.billing_status).ok_or_else(|| {
            BillingError::Database(format!("unknown billing status '{}'", row.billing_status))
        })?;
        Ok(AccountProfile {
            id: row.id,
            email: row.email,
            display_name: row.display_name,
            role,
            billing_status,
            gateway_customer_ref: row.gateway_customer_ref,
        })
    }
}

/// Map a unique-violation insert into a retryable conflict.
fn map_payment_insert_error(e: sqlx::Error) -> BillingError {
    if let Some(db_err) = e.as_database_error() {
        if db_err.is_unique_violation() {
            return BillingError::ConcurrentModification(
                "payment for this transaction reference already recorded".to_string(),
            );
        }
    }
    BillingError::Database(e.to_string())
}

/// Insert a payment row inside an open transaction.
async fn insert_payment_tx(
    tx: &mut sqlx::Transaction<'_, sqlx::Postgres>,
    payment: &NewPayment,
) -> BillingResult<Payment> {
    let row: PaymentRow = sqlx::query_as(&format!(
        r#"
        INSERT INTO payments (
            account_id, subscription_id, amount_cents, status,
            gateway_txn_ref, gateway_session_ref, refund_ref, failure_reason,
            plan_name, payer_name
        )
        VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10)
        RETURNING {PAYMENT_COLUMNS}
        "#
    ))
    .bind(payment.account_id)
    .bind(payment.subscription_id)
    .bind(payment.amount_cents)
    .bind(payment.status.as_str())
    .bind(&payment.gateway_txn_ref)
    .bind(&payment.gateway_session_ref)
    .bind(&payment.refund_ref)
    .bind(&payment.failure_reason)
    .bind(&payment.plan_name)
    .bind(&payment.payer_name)
    .fetch_one(&mut **tx)
    .await
    .map_err(map_payment_insert_error)?;

    row.try_into()
}

#[async_trait]
impl EntitlementStore for PgStore {
    async fn plan_by_name(&self, name: &str) -> BillingResult<Option<Plan>> {
        let row: Option<PlanRow> =
            sqlx::query_as(&format!("SELECT {PLAN_COLUMNS} FROM plans WHERE name = $1"))
                .bind(name)
                .fetch_optional(&self.pool)
                .await?;
        Ok(row.map(Plan::from))
    }

    async fn plans_by_product_ref(&self, product_ref: &str) -> BillingResult<Vec<Plan>> {
        let rows: Vec<PlanRow> = sqlx::query_as(&format!(
            "SELECT {PLAN_COLUMNS} FROM plans WHERE gateway_product_ref = $1"
        ))
        .bind(product_ref)
        .fetch_all(&self.pool)
        .await?;
        Ok(rows.into_iter().map(Plan::from).collect())
    }

    async fn list_active_plans(&self) -> BillingResult<Vec<Plan>> {
        let rows: Vec<PlanRow> = sqlx::query_as(&format!(
            "SELECT {PLAN_COLUMNS} FROM plans WHERE is_active AND NOT is_custom ORDER BY monthly_price_cents"
        ))
        .fetch_all(&self.pool)
        .await?;
        Ok(rows.into_iter().map(Plan::from).collect())
    }

    async fn update_plan_price(
        &self,
        plan_name: &str,
        cycle: BillingCycle,
        amount_cents: i64,
        price_ref: &str,
    ) -> BillingResult<()> {
        let query = match cycle {
            BillingCycle::Monthly => {
                r#"
                UPDATE plans SET
                    monthly_price_cents = $2,
                    gateway_price_monthly = $3,
                    updated_at = NOW()
                WHERE name = $1
                "#
            }
            BillingCycle::Yearly => {
                r#"
                UPDATE plans SET
                    yearly_price_cents = $2,
                    gateway_price_yearly = $3,
                    updated_at = NOW()
                WHERE name = $1
                "#
            }
        };
        let result = sqlx::query(query)
            .bind(plan_name)
            .bind(amount_cents)
            .bind(price_ref)
            .execute(&self.pool)
            .await?;
        if result.rows_affected() == 0 {
            return Err(BillingError::PlanNotFound(plan_name.to_string()));
        }
        Ok(())
    }

    async fn account_profile(&self, account_id: Uuid) -> BillingResult<Option<AccountProfile>> {
        let row: Option<AccountRow> = sqlx::query_as(
            "SELECT id, email, display_name, role, billing_status, gateway_customer_ref \
             FROM accounts WHERE id = $1",
        )
        .bind(account_id)
        .fetch_optional(&self.pool)
        .await?;
        row.map(AccountProfile::try_from).transpose()
    }

    async fn set_customer_ref(&self, account_id: Uuid, customer_ref: &str) -> BillingResult<()> {
        let result = sqlx::query(
            "UPDATE accounts SET gateway_customer_ref = $2, updated_at = NOW() WHERE id = $1",
        )
        .bind(account_id)
        .bind(customer_ref)
        .execute(&self.pool)
        .await?;
        if result.rows_affected() == 0 {
            return Err(BillingError::NotFound(format!("account {}", account_id)));
        }
        Ok(())
    }

    async fn find_success_payment(&self, txn_ref: &str) -> BillingResult<Option<Payment>> {
        // PendingRefund rows started life as Success; they still satisfy the
        // idempotency check so a replay never re-activates.
        let row: Option<PaymentRow> = sqlx::query_as(&format!(
            "SELECT {PAYMENT_COLUMNS} FROM payments \
             WHERE gateway_txn_ref = $1 AND status IN ('success', 'pending_refund') \
             LIMIT 1"
        ))
        .bind(txn_ref)
        .fetch_optional(&self.pool)
        .await?;
        row.map(Payment::try_from).transpose()
    }

    async fn record_payment(&self, payment: NewPayment) -> BillingResult<Payment> {
        let mut tx = self.pool.begin().await?;
        let recorded = insert_payment_tx(&mut tx, &payment).await?;
        tx.commit().await?;
        Ok(recorded)
    }

    async fn append_refund(&self, txn_ref: &str, refund_ref: &str) -> BillingResult<bool> {
        let result = sqlx::query(
            r#"
            UPDATE payments SET
                refund_ref = $2,
                status = 'pending_refund'
            WHERE gateway_txn_ref = $1 AND status = 'success'
            "#,
        )
        .bind(txn_ref)
        .bind(refund_ref)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() > 0)
    }

    async fn mark_session_payment_failed(
        &self,
        session_ref: &str,
        reason: &str,
    ) -> BillingResult<bool> {
        let result = sqlx::query(
            r#"
            UPDATE payments SET
                status = 'failed',
                failure_reason = $2
            WHERE gateway_session_ref = $1 AND status = 'pending'
            "#,
        )
        .bind(session_ref)
        .bind(reason)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() > 0)
    }

    async fn subscription_by_owner(
        &self,
        account_id: Uuid,
    ) -> BillingResult<Option<Subscription>> {
        let row: Option<SubscriptionRow> = sqlx::query_as(&format!(
            "SELECT {SUBSCRIPTION_COLUMNS} FROM subscriptions WHERE account_id = $1"
        ))
        .bind(account_id)
        .fetch_optional(&self.pool)
        .await?;
        row.map(Subscription::try_from).transpose()
    }

    async fn subscriptions_by_price_ref(
        &self,
        price_ref: &str,
    ) -> BillingResult<Vec<Subscription>> {
        let rows: Vec<SubscriptionRow> = sqlx::query_as(&format!(
            "SELECT {SUBSCRIPTION_COLUMNS} FROM subscriptions \
             WHERE gateway_price_ref = $1 AND canceled_at IS NULL"
        ))
        .bind(price_ref)
        .fetch_all(&self.pool)
        .await?;
        rows.into_iter().map(Subscription::try_from).collect()
    }

    async fn subscription_by_gateway_ref(
        &self,
        sub_ref: &str,
    ) -> BillingResult<Option<Subscription>> {
        let row: Option<SubscriptionRow> = sqlx::query_as(&format!(
            "SELECT {SUBSCRIPTION_COLUMNS} FROM subscriptions WHERE gateway_subscription_ref = $1"
        ))
        .bind(sub_ref)
        .fetch_optional(&self.pool)
        .await?;
        row.map(Subscription::try_from).transpose()
    }

    async fn set_subscription_price_ref(
        &self,
        subscription_id: Uuid,
        new_price_ref: &str,
    ) -> BillingResult<()> {
        let result = sqlx::query(
            "UPDATE subscriptions SET gateway_price_ref = $2, updated_at = NOW() WHERE id = $1",
        )
        .bind(subscription_id)
        .bind(new_price_ref)
        .execute(&self.pool)
        .await?;
        if result.rows_affected() == 0 {
            return Err(BillingError::NotFound(format!(
                "subscription {}",
                subscription_id
            )));
        }
        Ok(())
    }

    async fn commit_activation(&self, commit: ActivationCommit) -> BillingResult<Subscription> {
        let mut tx = self.pool.begin().await?;

        // Serialization point: concurrent activations for the same owner
        // queue on this row lock.
        let locked: Option<(Uuid,)> =
            sqlx::query_as("SELECT id FROM accounts WHERE id = $1 FOR UPDATE")
                .bind(commit.account_id)
                .fetch_optional(&mut *tx)
                .await?;
        if locked.is_none() {
            return Err(BillingError::NotFound(format!(
                "account {}",
                commit.account_id
            )));
        }

        let row: SubscriptionRow = sqlx::query_as(&format!(
            r#"
            INSERT INTO subscriptions (
                account_id, plan_name, price_cents, billing_cycle,
                start_date, end_date, renewal_date, auto_renew, canceled_at,
                gateway_subscription_ref, gateway_price_ref, gateway_product_ref,
                max_editor_seats, used_editor_seats,
                max_viewer_seats, used_viewer_seats,
                max_rfp_credits, used_rfp_credits,
                max_grant_credits, used_grant_credits
            )
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, NULL,
                    $9, $10, $11, $12, 0, $13, 0, $14, 0, $15, 0)
            ON CONFLICT (account_id) DO UPDATE SET
                plan_name = EXCLUDED.plan_name,
                price_cents = EXCLUDED.price_cents,
                billing_cycle = EXCLUDED.billing_cycle,
                start_date = EXCLUDED.start_date,
                end_date = EXCLUDED.end_date,
                renewal_date = EXCLUDED.renewal_date,
                auto_renew = EXCLUDED.auto_renew,
                canceled_at = NULL,
                gateway_subscription_ref = EXCLUDED.gateway_subscription_ref,
                gateway_price_ref = EXCLUDED.gateway_price_ref,
                gateway_product_ref = EXCLUDED.gateway_product_ref,
                max_editor_seats = EXCLUDED.max_editor_seats,
                used_editor_seats = 0,
                max_viewer_seats = EXCLUDED.max_viewer_seats,
                used_viewer_seats = 0,
                max_rfp_credits = EXCLUDED.max_rfp_credits,
                used_rfp_credits = 0,
                max_grant_credits = EXCLUDED.max_grant_credits,
                used_grant_credits = 0,
                updated_at = NOW()
            RETURNING {SUBSCRIPTION_COLUMNS}
            "#
        ))
        .bind(commit.account_id)
        .bind(&commit.plan_name)
        .bind(commit.price_cents)
        .bind(commit.billing_cycle.as_str())
        .bind(commit.start_date)
        .bind(commit.end_date)
        .bind(commit.renewal_date)
        .bind(commit.auto_renew)
        .bind(&commit.gateway_subscription_ref)
        .bind(&commit.gateway_price_ref)
        .bind(&commit.gateway_product_ref)
        .bind(commit.quotas.editor_seats.max)
        .bind(commit.quotas.viewer_seats.max)
        .bind(commit.quotas.rfp_credits.max)
        .bind(commit.quotas.grant_credits.max)
        .fetch_one(&mut *tx)
        .await?;
        let subscription: Subscription = row.try_into()?;

        sqlx::query(
            "UPDATE accounts SET billing_status = 'active', updated_at = NOW() WHERE id = $1",
        )
        .bind(commit.account_id)
        .execute(&mut *tx)
        .await?;

        let mut payment = commit.payment;
        payment.subscription_id = Some(subscription.id);
        insert_payment_tx(&mut tx, &payment).await?;

        tx.commit().await?;
        Ok(subscription)
    }

    async fn mark_past_due(&self, account_id: Uuid, payment: NewPayment) -> BillingResult<()> {
        let mut tx = self.pool.begin().await?;

        let result = sqlx::query(
            "UPDATE subscriptions SET auto_renew = FALSE, updated_at = NOW() WHERE account_id = $1",
        )
        .bind(account_id)
        .execute(&mut *tx)
        .await?;
        if result.rows_affected() == 0 {
            return Err(BillingError::NotFound(format!(
                "subscription for {}",
                account_id
            )));
        }

        sqlx::query(
            "UPDATE accounts SET billing_status = 'past_due', updated_at = NOW() WHERE id = $1",
        )
        .bind(account_id)
        .execute(&mut *tx)
        .await?;

        insert_payment_tx(&mut tx, &payment).await?;

        tx.commit().await?;
        Ok(())
    }

    async fn mark_canceled(
        &self,
        account_id: Uuid,
        canceled_at: OffsetDateTime,
    ) -> BillingResult<()> {
        let mut tx = self.pool.begin().await?;

        let result = sqlx::query(
            r#"
            UPDATE subscriptions SET
                canceled_at = $2,
                auto_renew = FALSE,
                updated_at = NOW()
            WHERE account_id = $1
            "#,
        )
        .bind(account_id)
        .bind(canceled_at)
        .execute(&mut *tx)
        .await?;
        if result.rows_affected() == 0 {
            return Err(BillingError::NotFound(format!(
                "subscription for {}",
                account_id
            )));
        }

        sqlx::query(
            "UPDATE accounts SET billing_status = 'inactive', updated_at = NOW() WHERE id = $1",
        )
        .bind(account_id)
        .execute(&mut *tx)
        .await?;

        tx.commit().await?;
        Ok(())
    }

    async fn apply_quota_topup(
        &self,
        account_id: Uuid,
        add: QuotaSet,
        payment: NewPayment,
    ) -> BillingResult<Subscription> {
        let mut tx = self.pool.begin().await?;

        let row: Option<SubscriptionRow> = sqlx::query_as(&format!(
            r#"
            UPDATE subscriptions SET
                max_editor_seats = max_editor_seats + $2,
                max_viewer_seats = max_viewer_seats + $3,
                max_rfp_credits = max_rfp_credits + $4,
                max_grant_credits = max_grant_credits + $5,
                updated_at = NOW()
            WHERE account_id = $1 AND canceled_at IS NULL AND end_date > NOW()
            RETURNING {SUBSCRIPTION_COLUMNS}
            "#
        ))
        .bind(account_id)
        .bind(add.editor_seats)
        .bind(add.viewer_seats)
        .bind(add.rfp_credits)
        .bind(add.grant_credits)
        .fetch_optional(&mut *tx)
        .await?;

        let subscription: Subscription = match row {
            Some(row) => row.try_into()?,
            None => {
                return Err(BillingError::NotFound(format!(
                    "live subscription for {}",
                    account_id
                )));
            }
        };

        let mut payment = payment;
        payment.subscription_id = Some(subscription.id);
        insert_payment_tx(&mut tx, &payment).await?;

        tx.commit().await?;
        Ok(subscription)
    }

    async fn claim_event(
        &self,
        event_id: &str,
        event_type: &str,
        event_timestamp: OffsetDateTime,
    ) -> BillingResult<bool> {
        // INSERT..ON CONFLICT..RETURNING: only one concurrent delivery can
        // claim processing rights. Claims stuck in 'processing' beyond the
        // recovery window may be re-claimed.
        let claimed: Option<(Uuid,)> = sqlx::query_as(
            r#"
            INSERT INTO gateway_webhook_events
                (gateway_event_id, event_type, event_timestamp, processing_result, processing_started_at)
            VALUES ($1, $2, $3, 'processing', NOW())
            ON CONFLICT (gateway_event_id) DO UPDATE SET
                processing_result = 'processing',
                processing_started_at = NOW(),
                error_message = CONCAT('Recovered from stuck state at ', NOW()::TEXT)
            WHERE gateway_webhook_events.processing_result = 'processing'
              AND gateway_webhook_events.processing_started_at < NOW() - make_interval(mins => $4)
            RETURNING id
            "#,
        )
        .bind(event_id)
        .bind(event_type)
        .bind(event_timestamp)
        .bind(CLAIM_RECOVERY_MINUTES)
        .fetch_optional(&self.pool)
        .await?;

        Ok(claimed.is_some())
    }

    async fn finish_event(
        &self,
        event_id: &str,
        success: bool,
        error_message: Option<&str>,
    ) -> BillingResult<()> {
        let result_label = if success { "success" } else { "error" };
        let update = sqlx::query(
            r#"
            UPDATE gateway_webhook_events
            SET processing_result = $1, error_message = $2
            WHERE gateway_event_id = $3
            "#,
        )
        .bind(result_label)
        .bind(error_message)
        .bind(event_id)
        .execute(&self.pool)
        .await;

        // The audit record matters for idempotency; retry once before giving
        // up and reporting the failure.
        if let Err(e) = update {
            tracing::warn!(
                event_id = %event_id,
                error = %e,
                "Failed to update webhook event record, retrying"
            );
            sqlx::query(
                r#"
                UPDATE gateway_webhook_events
                SET processing_result = $1, error_message = $2
                WHERE gateway_event_id = $3
                "#,
            )
            .bind(result_label)
            .bind(error_message)
            .bind(event_id)
            .execute(&self.pool)
            .await
            .map_err(|retry_err| {
                tracing::error!(
                    event_id = %event_id,
                    error = %retry_err,
                    "Failed to update webhook event record after retry; \
                     event may appear stuck in processing"
                );
                BillingError::Database(retry_err.to_string())
            })?;
        }

        Ok(())
    }
}
