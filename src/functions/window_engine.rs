use chrono::{DateTime, Duration as ChronoDuration, Utc};
use forge::prelude::*;
use serde::{Deserialize, Serialize};
use sqlx::PgPool;
use uuid::Uuid;

use crate::error::CoreError;
use crate::schema::WindowStatus;

pub const WINDOW_DURATION: ChronoDuration = ChronoDuration::hours(24);

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WindowStatusView {
    pub status: WindowStatus,
    pub hours_remaining: f64,
    pub minutes_remaining: f64,
    pub is_within_window: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ValidateResult {
    pub is_valid: bool,
    pub reason: Option<String>,
    pub window_status: WindowStatus,
    pub template_required: bool,
    pub hours_remaining: f64,
}

struct WindowRow {
    id: Uuid,
    ends_at: DateTime<Utc>,
    is_active: bool,
    status: WindowStatus,
}

/// A pure read. If the window's `ends_at` has passed but it is still marked
/// active, flips it to `expired` as an idempotent side effect before
/// returning the now-accurate view.
pub async fn status(db: &PgPool, now: DateTime<Utc>, conversation_id: Uuid) -> CoreResultView<WindowStatusView> {
    let row = sqlx::query_as!(
        WindowRow,
        r#"
        SELECT id, ends_at, is_active, status as "status: WindowStatus"
        FROM conversation_windows
        WHERE conversation_id = $1
        "#,
        conversation_id
    )
    .fetch_optional(db)
    .await
    .map_err(CoreError::from)?
    .ok_or_else(|| CoreError::NotFound(format!("window for conversation {conversation_id}")))?;

    let mut status = row.status;
    let mut is_active = row.is_active;

    if is_active && row.ends_at <= now {
        sqlx::query!(
            r#"
            UPDATE conversation_windows
            SET is_active = false, status = 'expired', version = version + 1, updated_at = now()
            WHERE id = $1 AND is_active = true
            "#,
            row.id
        )
        .execute(db)
        .await
        .map_err(CoreError::from)?;
        status = WindowStatus::Expired;
        is_active = false;
    }

    let remaining_minutes = ((row.ends_at - now).num_seconds() as f64 / 60.0).max(0.0);

    Ok(WindowStatusView {
        status,
        hours_remaining: remaining_minutes / 60.0,
        minutes_remaining: remaining_minutes,
        is_within_window: is_active && now < row.ends_at,
    })
}

pub async fn can_send_free_message(
    db: &PgPool,
    now: DateTime<Utc>,
    conversation_id: Uuid,
) -> CoreResultView<bool> {
    Ok(status(db, now, conversation_id).await?.is_within_window)
}

pub async fn validate(
    db: &PgPool,
    now: DateTime<Utc>,
    conversation_id: Uuid,
    is_template: bool,
) -> CoreResultView<ValidateResult> {
    let view = status(db, now, conversation_id).await?;

    if is_template {
        return Ok(ValidateResult {
            is_valid: true,
            reason: None,
            window_status: view.status,
            template_required: false,
            hours_remaining: view.hours_remaining,
        });
    }

    Ok(ValidateResult {
        is_valid: view.is_within_window,
        reason: (!view.is_within_window).then(|| "window closed".to_string()),
        window_status: view.status,
        template_required: !view.is_within_window,
        hours_remaining: view.hours_remaining,
    })
}

/// Called by C8 on every inbound customer message. Idempotent within the
/// same instant: re-running with no elapsed wall-clock time is a no-op in
/// effect (it rewrites the same `started_at`/`ends_at` pair).
pub async fn reset_on_inbound(db: &PgPool, now: DateTime<Utc>, conversation_id: Uuid) -> CoreResultView<()> {
    let ends_at = now + WINDOW_DURATION;
    let mut tx = db.begin().await.map_err(CoreError::from)?;

    sqlx::query!(
        r#"
        UPDATE conversation_windows
        SET started_at = $2, ends_at = $3, is_active = true, status = 'active',
            version = version + 1, updated_at = now()
        WHERE conversation_id = $1
        "#,
        conversation_id,
        now,
        ends_at
    )
    .execute(&mut *tx)
    .await
    .map_err(CoreError::from)?;

    sqlx::query!(
        r#"
        UPDATE conversations
        SET last_user_message_at = $2, window_expires_at = $3, updated_at = now()
        WHERE id = $1
        "#,
        conversation_id,
        now,
        ends_at
    )
    .execute(&mut *tx)
    .await
    .map_err(CoreError::from)?;

    tx.commit().await.map_err(CoreError::from)?;
    Ok(())
}

/// Admin override. Writes an `AdminAction` audit row in the same
/// transaction as the window update.
pub async fn extend(
    db: &PgPool,
    now: DateTime<Utc>,
    conversation_id: Uuid,
    organization_id: Uuid,
    hours: i64,
    actor: Option<Uuid>,
    reason: Option<String>,
) -> CoreResultView<()> {
    if hours <= 0 {
        return Err(CoreError::Validation("extend hours must be positive".to_string()));
    }

    let ends_at = now + ChronoDuration::hours(hours);
    let mut tx = db.begin().await.map_err(CoreError::from)?;

    let updated = sqlx::query!(
        r#"
        UPDATE conversation_windows
        SET ends_at = $2, status = 'manually_extended', is_active = true,
            version = version + 1, updated_at = now()
        WHERE conversation_id = $1
        "#,
        conversation_id,
        ends_at
    )
    .execute(&mut *tx)
    .await
    .map_err(CoreError::from)?;

    if updated.rows_affected() == 0 {
        return Err(CoreError::NotFound(format!("window for conversation {conversation_id}")));
    }

    sqlx::query!(
        r#"
        INSERT INTO admin_actions (id, organization_id, conversation_id, action, actor, reason, payload)
        VALUES ($1, $2, $3, 'window_extend', $4, $5, $6)
        "#,
        Uuid::new_v4(),
        organization_id,
        conversation_id,
        actor,
        reason,
        serde_json::json!({ "hours": hours, "new_ends_at": ends_at })
    )
    .execute(&mut *tx)
    .await
    .map_err(CoreError::from)?;

    tx.commit().await.map_err(CoreError::from)?;
    Ok(())
}

/// Batch sweep called by C9. Idempotent under concurrent invocation: the
/// `WHERE is_active = true` guard means a second concurrent run closes zero
/// rows once the first has committed.
pub async fn close_expired(db: &PgPool, now: DateTime<Utc>, organization_id: Uuid) -> CoreResultView<u64> {
    let result = sqlx::query!(
        r#"
        UPDATE conversation_windows
        SET is_active = false, status = 'expired', close_reason = 'Window expired',
            version = version + 1, updated_at = now()
        WHERE organization_id = $1 AND is_active = true AND ends_at <= $2
        "#,
        organization_id,
        now
    )
    .execute(db)
    .await
    .map_err(CoreError::from)?;

    Ok(result.rows_affected())
}

/// Alias so callers reading this module in isolation don't need to know the
/// crate-wide `Result` is `forge`'s; every function here returns `CoreError`
/// directly and the query/mutation wrappers convert it at the boundary.
pub type CoreResultView<T> = std::result::Result<T, CoreError>;

#[derive(Debug, Deserialize)]
pub struct GetWindowStatusInput {
    pub conversation_id: Uuid,
}

#[forge::query(public)]
pub async fn get_window_status(
    ctx: &QueryContext,
    input: GetWindowStatusInput,
) -> Result<WindowStatusView> {
    status(ctx.db(), Utc::now(), input.conversation_id)
        .await
        .map_err(ForgeError::from)
}

#[derive(Debug, Deserialize)]
pub struct ResetWindowInput {
    pub conversation_id: Uuid,
}

#[forge::mutation(public)]
pub async fn reset_window(ctx: &MutationContext, input: ResetWindowInput) -> Result<()> {
    reset_on_inbound(ctx.db(), Utc::now(), input.conversation_id)
        .await
        .map_err(ForgeError::from)
}

#[derive(Debug, Deserialize)]
pub struct ExtendWindowInput {
    pub conversation_id: Uuid,
    pub organization_id: Uuid,
    pub hours: i64,
    pub actor: Option<Uuid>,
    pub reason: Option<String>,
}

#[forge::mutation(public)]
pub async fn extend_window(ctx: &MutationContext, input: ExtendWindowInput) -> Result<()> {
    extend(
        ctx.db(),
        Utc::now(),
        input.conversation_id,
        input.organization_id,
        input.hours,
        input.actor,
        input.reason,
    )
    .await
    .map_err(ForgeError::from)
}

#[cfg(test)]
mod tests {
    use super::*;
    use forge::testing::*;

    async fn setup() -> (IsolatedTestDb, PgPool) {
        let base = TestDatabase::embedded().await.unwrap();
        let db = base.isolated("window_engine").await.unwrap();
        db.run_sql(
            r#"
            CREATE TABLE conversations (
                id uuid PRIMARY KEY,
                organization_id uuid NOT NULL,
                last_user_message_at timestamptz,
                window_expires_at timestamptz,
                updated_at timestamptz NOT NULL DEFAULT now()
            );

            CREATE TABLE conversation_windows (
                id uuid PRIMARY KEY DEFAULT gen_random_uuid(),
                organization_id uuid NOT NULL,
                conversation_id uuid NOT NULL UNIQUE,
                started_at timestamptz NOT NULL,
                ends_at timestamptz NOT NULL,
                is_active bool NOT NULL DEFAULT true,
                status text NOT NULL DEFAULT 'active',
                close_reason text,
                version int NOT NULL DEFAULT 0,
                created_at timestamptz NOT NULL DEFAULT now(),
                updated_at timestamptz NOT NULL DEFAULT now()
            );

            CREATE TABLE admin_actions (
                id uuid PRIMARY KEY,
                organization_id uuid NOT NULL,
                conversation_id uuid NOT NULL,
                action text NOT NULL,
                actor uuid,
                reason text,
                payload jsonb NOT NULL DEFAULT '{}'::jsonb,
                created_at timestamptz NOT NULL DEFAULT now()
            );
            "#,
        )
        .await
        .unwrap();
        let pool = db.pool().clone();
        (db, pool)
    }

    async fn seed_window(pool: &PgPool, organization_id: Uuid, conversation_id: Uuid, ends_at: DateTime<Utc>) {
        sqlx::query(
            "INSERT INTO conversations (id, organization_id) VALUES ($1, $2)",
        )
        .bind(conversation_id)
        .bind(organization_id)
        .execute(pool)
        .await
        .unwrap();

        sqlx::query(
            r#"
            INSERT INTO conversation_windows (organization_id, conversation_id, started_at, ends_at, is_active, status)
            VALUES ($1, $2, $3, $4, true, 'active')
            "#,
        )
        .bind(organization_id)
        .bind(conversation_id)
        .bind(ends_at - WINDOW_DURATION)
        .bind(ends_at)
        .execute(pool)
        .await
        .unwrap();
    }

    #[tokio::test]
    async fn boundary_send_one_ms_before_and_after_expiry() {
        let (_db, pool) = setup().await;
        let org = Uuid::new_v4();
        let conv = Uuid::new_v4();
        let now = Utc::now();
        seed_window(&pool, org, conv, now + ChronoDuration::milliseconds(1)).await;

        let before = can_send_free_message(&pool, now, conv).await.unwrap();
        assert!(before);

        let after = can_send_free_message(&pool, now + ChronoDuration::milliseconds(2), conv)
            .await
            .unwrap();
        assert!(!after);
    }

    #[tokio::test]
    async fn template_bypasses_closed_window() {
        let (_db, pool) = setup().await;
        let org = Uuid::new_v4();
        let conv = Uuid::new_v4();
        let now = Utc::now();
        seed_window(&pool, org, conv, now - ChronoDuration::hours(1)).await;

        let free_form = validate(&pool, now, conv, false).await.unwrap();
        assert!(!free_form.is_valid);
        assert!(free_form.template_required);

        let templated = validate(&pool, now, conv, true).await.unwrap();
        assert!(templated.is_valid);
    }

    #[tokio::test]
    async fn inbound_resets_expired_window() {
        let (_db, pool) = setup().await;
        let org = Uuid::new_v4();
        let conv = Uuid::new_v4();
        let now = Utc::now();
        seed_window(&pool, org, conv, now - ChronoDuration::hours(1)).await;

        reset_on_inbound(&pool, now, conv).await.unwrap();

        let view = status(&pool, now, conv).await.unwrap();
        assert!(view.is_within_window);
        assert!(matches!(view.status, WindowStatus::Active));
    }

    #[tokio::test]
    async fn close_expired_is_idempotent() {
        let (_db, pool) = setup().await;
        let org = Uuid::new_v4();
        let conv = Uuid::new_v4();
        let now = Utc::now();
        seed_window(&pool, org, conv, now - ChronoDuration::minutes(1)).await;

        let first = close_expired(&pool, now, org).await.unwrap();
        assert_eq!(first, 1);
        let second = close_expired(&pool, now, org).await.unwrap();
        assert_eq!(second, 0);
    }

    #[tokio::test]
    async fn extend_writes_admin_action_audit_row() {
        let (_db, pool) = setup().await;
        let org = Uuid::new_v4();
        let conv = Uuid::new_v4();
        let now = Utc::now();
        seed_window(&pool, org, conv, now + ChronoDuration::hours(1)).await;

        extend(&pool, now, conv, org, 48, None, Some("customer requested".to_string()))
            .await
            .unwrap();

        let audit_count: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM admin_actions WHERE conversation_id = $1")
            .bind(conv)
            .fetch_one(&pool)
            .await
            .unwrap();
        assert_eq!(audit_count, 1);
    }
}
