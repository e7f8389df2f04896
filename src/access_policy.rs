use crate::error::Result;
use async_trait::async_trait;
use sqlx::postgres::PgPool;

/// Paywall collaborator boundary.
///
/// Whether an asset is free derives from container entities (film, training
/// chapter, character version) owned by the wider platform, and subscription
/// state is billing's concern. This service only asks the two yes/no
/// questions it needs to gate downloads.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait AccessPolicy: Send + Sync {
    /// Is the asset available without a subscription?
    async fn is_free(&self, asset_id: i64) -> Result<bool>;

    /// Does the user currently hold an active subscription?
    async fn has_active_subscription(&self, user_id: i64) -> Result<bool>;
}

/// Access policy backed by the platform's shared Postgres tables.
///
/// `asset_access` and `subscriptions` are written by other services; this
/// side only reads them. An asset without an access row is paywalled.
pub struct PgAccessPolicy {
    pool: PgPool,
}

impl PgAccessPolicy {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl AccessPolicy for PgAccessPolicy {
    async fn is_free(&self, asset_id: i64) -> Result<bool> {
        let row: Option<(bool,)> =
            sqlx::query_as("SELECT is_free FROM asset_access WHERE asset_id = $1")
                .bind(asset_id)
                .fetch_optional(&self.pool)
                .await?;

        Ok(row.map(|(is_free,)| is_free).unwrap_or(false))
    }

    async fn has_active_subscription(&self, user_id: i64) -> Result<bool> {
        let row: (bool,) = sqlx::query_as(
            "SELECT EXISTS(SELECT 1 FROM subscriptions WHERE user_id = $1 AND status = 'active')",
        )
        .bind(user_id)
        .fetch_one(&self.pool)
        .await?;

        Ok(row.0)
    }
}
