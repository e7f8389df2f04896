use crate::error::Result;
use sqlx::postgres::PgPool;
use std::net::IpAddr;
use tracing::{debug, info, instrument};

/// Kind of visit observation, tagging rows in the shared `asset_visits`
/// ledger table. Each kind folds into its own aggregate counter.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VisitKind {
    View,
    Download,
}

impl VisitKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            VisitKind::View => "view",
            VisitKind::Download => "download",
        }
    }

    /// Aggregate counter column on `assets` that this kind folds into.
    fn counter_column(&self) -> &'static str {
        match self {
            VisitKind::View => "view_count",
            VisitKind::Download => "download_count",
        }
    }
}

/// Who performed a visit: an authenticated user, or an anonymous client
/// identified by IP address. Exactly one of the two, never both.
///
/// An IP address is not a unique visitor, but it is a good enough compromise
/// between counting unique anonymous visits and the storage cost of doing
/// better without cookies.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VisitIdentity {
    User(i64),
    Anonymous(IpAddr),
}

impl VisitIdentity {
    fn user_id(&self) -> Option<i64> {
        match self {
            VisitIdentity::User(id) => Some(*id),
            VisitIdentity::Anonymous(_) => None,
        }
    }

    fn ip_address(&self) -> Option<String> {
        match self {
            VisitIdentity::User(_) => None,
            VisitIdentity::Anonymous(ip) => Some(ip.to_string()),
        }
    }
}

/// Transient, append-only log of visit observations awaiting aggregation.
///
/// The write path is a single conflict-tolerant insert per request; the fold
/// path is the sole mutator of the durable counters and runs from one
/// scheduled task at a time.
pub struct VisitLedger {
    pool: PgPool,
}

impl VisitLedger {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Record a visit observation, suppressing duplicates per identity.
    ///
    /// Implemented as a single `INSERT ... ON CONFLICT DO NOTHING` round
    /// trip; the partial unique indexes on `(kind, asset_id, user_id)` and
    /// `(kind, asset_id, ip_address)` arbitrate concurrent inserts, so a
    /// check-then-insert race cannot produce duplicate rows. Returns whether
    /// a new row was actually created.
    #[instrument(skip(self), fields(kind = kind.as_str(), asset_id = asset_id))]
    pub async fn record_visit(
        &self,
        kind: VisitKind,
        asset_id: i64,
        identity: VisitIdentity,
    ) -> Result<bool> {
        let result = sqlx::query(
            r#"
            INSERT INTO asset_visits (kind, asset_id, user_id, ip_address)
            VALUES ($1, $2, $3, $4)
            ON CONFLICT DO NOTHING
            "#,
        )
        .bind(kind.as_str())
        .bind(asset_id)
        .bind(identity.user_id())
        .bind(identity.ip_address())
        .execute(&self.pool)
        .await?;

        let inserted = result.rows_affected() == 1;
        if inserted {
            metrics::counter!("visits.recorded", "kind" => kind.as_str()).increment(1);
        } else {
            debug!("Duplicate visit suppressed");
            metrics::counter!("visits.deduplicated", "kind" => kind.as_str()).increment(1);
        }

        Ok(inserted)
    }

    /// Fold all ledger rows of a kind into the asset counters and clear them.
    ///
    /// Runs as one statement: rows are deleted with `RETURNING`, grouped,
    /// and added to the counters, so the counted set is exactly the deleted
    /// set. Rows inserted concurrently are either folded now or left intact
    /// for the next cycle; a retried run after a successful fold sees zero
    /// rows and is a no-op. Returns the number of visits folded.
    #[instrument(skip(self), fields(kind = kind.as_str()))]
    pub async fn fold_and_truncate(&self, kind: VisitKind) -> Result<u64> {
        let folded: Vec<(i64,)> = sqlx::query_as(&fold_statement(kind))
            .bind(kind.as_str())
            .fetch_all(&self.pool)
            .await?;

        let visit_count: u64 = folded.iter().map(|(count,)| *count as u64).sum();

        info!(
            assets_updated = folded.len(),
            visits_folded = visit_count,
            "Visit counters folded"
        );
        metrics::counter!("visits.folded", "kind" => kind.as_str()).increment(visit_count);

        Ok(visit_count)
    }
}

/// Build the atomic fold statement for a visit kind.
///
/// The counter column is interpolated from the kind enum, never from input.
fn fold_statement(kind: VisitKind) -> String {
    format!(
        r#"
        WITH removed AS (
            DELETE FROM asset_visits
            WHERE kind = $1
            RETURNING asset_id
        ),
        counts AS (
            SELECT asset_id, COUNT(*) AS visit_count
            FROM removed
            GROUP BY asset_id
        )
        UPDATE assets
        SET {counter} = {counter} + counts.visit_count,
            date_updated = NOW()
        FROM counts
        WHERE assets.id = counts.asset_id
        RETURNING counts.visit_count
        "#,
        counter = kind.counter_column()
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_kind_tags() {
        assert_eq!(VisitKind::View.as_str(), "view");
        assert_eq!(VisitKind::Download.as_str(), "download");
    }

    #[test]
    fn test_identity_columns_are_mutually_exclusive() {
        let user = VisitIdentity::User(42);
        assert_eq!(user.user_id(), Some(42));
        assert_eq!(user.ip_address(), None);

        let anon = VisitIdentity::Anonymous("1.2.3.4".parse().unwrap());
        assert_eq!(anon.user_id(), None);
        assert_eq!(anon.ip_address(), Some("1.2.3.4".to_string()));
    }

    #[test]
    fn test_ipv6_identity_is_canonicalized() {
        let anon = VisitIdentity::Anonymous("2001:db8:0:0:0:0:0:1".parse().unwrap());
        assert_eq!(anon.ip_address(), Some("2001:db8::1".to_string()));
    }

    #[test]
    fn test_fold_statement_targets_only_its_counter() {
        let download = fold_statement(VisitKind::Download);
        assert!(download.contains("download_count = download_count + counts.visit_count"));
        assert!(!download.contains("view_count"));

        let view = fold_statement(VisitKind::View);
        assert!(view.contains("view_count = view_count + counts.visit_count"));
        assert!(!view.contains("download_count"));
    }

    #[test]
    fn test_fold_statement_deletes_and_counts_the_same_rows() {
        // The DELETE ... RETURNING feeds the GROUP BY, so the folded set is
        // exactly the deleted set regardless of concurrent inserts.
        let sql = fold_statement(VisitKind::View);
        assert!(sql.contains("DELETE FROM asset_visits"));
        assert!(sql.contains("RETURNING asset_id"));
        assert!(sql.contains("FROM removed"));
    }
}
