use crate::models::{ApprovalRecord, ApprovalStatus};
use chrono::{DateTime, Utc};
use rusqlite::{OptionalExtension, Row, TransactionBehavior, params};
use std::path::PathBuf;
use std::time::Duration;
use thiserror::Error;

/// Durable store of approval records. Every mutation commits before the
/// call returns; records are never deleted, terminal states are kept for
/// audit.
#[derive(Clone, Debug)]
pub struct ApprovalStore {
    path: PathBuf,
}

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("approval {0} not found")]
    NotFound(i64),
    #[error("approval {id} is already {status}")]
    InvalidTransition { id: i64, status: ApprovalStatus },
    #[error("sqlite join error: {0}")]
    Join(#[from] tokio::task::JoinError),
    #[error("sqlite error: {0}")]
    Sqlite(#[from] rusqlite::Error),
    #[error("record encoding error: {0}")]
    Json(#[from] serde_json::Error),
    #[error("timestamp parse error: {0}")]
    TimeParse(#[from] chrono::ParseError),
}

impl ApprovalStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub async fn init(&self) -> Result<(), StoreError> {
        let path = self.path.clone();
        tokio::task::spawn_blocking(move || -> Result<(), StoreError> {
            let conn = open_connection(path)?;
            init_schema(&conn)?;
            Ok(())
        })
        .await?
    }

    /// Inserts a new record in `pending` status and returns its id. Does
    /// not deduplicate by product; callers that want at-most-one pending
    /// record per product check `find_pending_by_product` first.
    pub async fn add_pending(
        &self,
        product_ref: &str,
        original_images: &[String],
        processed_images: &[String],
        variant_tag: Option<String>,
    ) -> Result<i64, StoreError> {
        let path = self.path.clone();
        let product_ref = product_ref.to_string();
        let originals = serde_json::to_string(original_images)?;
        let processed = serde_json::to_string(processed_images)?;
        let created_at = Utc::now().to_rfc3339();

        tokio::task::spawn_blocking(move || -> Result<i64, StoreError> {
            let conn = open_connection(path)?;
            init_schema(&conn)?;
            conn.execute(
                "INSERT INTO approval (product_ref, variant_tag, original_images,
                                       processed_images, status, created_at)
                 VALUES (?1, ?2, ?3, ?4, 'pending', ?5)",
                params![product_ref, variant_tag, originals, processed, created_at],
            )?;
            Ok(conn.last_insert_rowid())
        })
        .await?
    }

    /// Pending records, most recent first.
    pub async fn list_pending(&self) -> Result<Vec<ApprovalRecord>, StoreError> {
        let path = self.path.clone();
        tokio::task::spawn_blocking(move || -> Result<Vec<ApprovalRecord>, StoreError> {
            let conn = open_connection(path)?;
            init_schema(&conn)?;
            let mut stmt = conn.prepare(&format!(
                "SELECT {RECORD_COLUMNS} FROM approval
                 WHERE status = 'pending'
                 ORDER BY created_at DESC, id DESC"
            ))?;
            let rows = stmt.query_map([], record_from_row)?;
            let mut records = Vec::new();
            for row in rows {
                records.push(row??);
            }
            Ok(records)
        })
        .await?
    }

    /// The most recent pending record for a product, if any. Used by the
    /// ingestion workflow to skip products already waiting on review.
    pub async fn find_pending_by_product(
        &self,
        product_ref: &str,
    ) -> Result<Option<ApprovalRecord>, StoreError> {
        let path = self.path.clone();
        let product_ref = product_ref.to_string();
        tokio::task::spawn_blocking(move || -> Result<Option<ApprovalRecord>, StoreError> {
            let conn = open_connection(path)?;
            init_schema(&conn)?;
            let row = conn
                .query_row(
                    &format!(
                        "SELECT {RECORD_COLUMNS} FROM approval
                         WHERE product_ref = ?1 AND status = 'pending'
                         ORDER BY created_at DESC, id DESC
                         LIMIT 1"
                    ),
                    params![product_ref],
                    record_from_row,
                )
                .optional()?;
            row.transpose()
        })
        .await?
    }

    pub async fn get(&self, id: i64) -> Result<ApprovalRecord, StoreError> {
        let path = self.path.clone();
        tokio::task::spawn_blocking(move || -> Result<ApprovalRecord, StoreError> {
            let conn = open_connection(path)?;
            init_schema(&conn)?;
            let row = conn
                .query_row(
                    &format!("SELECT {RECORD_COLUMNS} FROM approval WHERE id = ?1"),
                    params![id],
                    record_from_row,
                )
                .optional()?;
            match row {
                Some(record) => Ok(record?),
                None => Err(StoreError::NotFound(id)),
            }
        })
        .await?
    }

    /// `pending -> approved`. Fails with `NotFound` for unknown ids and
    /// `InvalidTransition` for records already in a terminal state.
    pub async fn approve(&self, id: i64) -> Result<ApprovalRecord, StoreError> {
        self.transition(id, Transition::Approve).await
    }

    /// `pending -> rejected`. An empty or missing reason is stored as
    /// "No reason provided".
    pub async fn reject(
        &self,
        id: i64,
        reason: Option<String>,
    ) -> Result<ApprovalRecord, StoreError> {
        let reason = reason
            .map(|r| r.trim().to_string())
            .filter(|r| !r.is_empty())
            .unwrap_or_else(|| "No reason provided".to_string());
        self.transition(id, Transition::Reject(reason)).await
    }

    async fn transition(
        &self,
        id: i64,
        transition: Transition,
    ) -> Result<ApprovalRecord, StoreError> {
        let path = self.path.clone();
        tokio::task::spawn_blocking(move || -> Result<ApprovalRecord, StoreError> {
            let mut conn = open_connection(path)?;
            init_schema(&conn)?;
            // IMMEDIATE takes the write lock before the status read, so a
            // concurrent approve/reject pair serializes: one commits, the
            // other observes the terminal state.
            let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;

            let status: Option<String> = tx
                .query_row(
                    "SELECT status FROM approval WHERE id = ?1",
                    params![id],
                    |row| row.get(0),
                )
                .optional()?;
            let status = status.ok_or(StoreError::NotFound(id))?;
            if status != "pending" {
                return Err(StoreError::InvalidTransition {
                    id,
                    status: ApprovalStatus::from_str(&status).unwrap_or(ApprovalStatus::Rejected),
                });
            }

            match &transition {
                Transition::Approve => {
                    tx.execute(
                        "UPDATE approval SET status = 'approved', approved_at = ?2 WHERE id = ?1",
                        params![id, Utc::now().to_rfc3339()],
                    )?;
                }
                Transition::Reject(reason) => {
                    tx.execute(
                        "UPDATE approval SET status = 'rejected', reject_reason = ?2 WHERE id = ?1",
                        params![id, reason],
                    )?;
                }
            }

            let record = tx.query_row(
                &format!("SELECT {RECORD_COLUMNS} FROM approval WHERE id = ?1"),
                params![id],
                record_from_row,
            )??;
            tx.commit()?;
            Ok(record)
        })
        .await?
    }
}

enum Transition {
    Approve,
    Reject(String),
}

const RECORD_COLUMNS: &str = "id, product_ref, variant_tag, original_images, \
                              processed_images, status, created_at, approved_at, reject_reason";

fn record_from_row(row: &Row<'_>) -> rusqlite::Result<Result<ApprovalRecord, StoreError>> {
    let id: i64 = row.get(0)?;
    let product_ref: String = row.get(1)?;
    let variant_tag: Option<String> = row.get(2)?;
    let originals: String = row.get(3)?;
    let processed: String = row.get(4)?;
    let status: String = row.get(5)?;
    let created_at: String = row.get(6)?;
    let approved_at: Option<String> = row.get(7)?;
    let reject_reason: Option<String> = row.get(8)?;

    Ok(decode_record(
        id,
        product_ref,
        variant_tag,
        originals,
        processed,
        status,
        created_at,
        approved_at,
        reject_reason,
    ))
}

#[allow(clippy::too_many_arguments)]
fn decode_record(
    id: i64,
    product_ref: String,
    variant_tag: Option<String>,
    originals: String,
    processed: String,
    status: String,
    created_at: String,
    approved_at: Option<String>,
    reject_reason: Option<String>,
) -> Result<ApprovalRecord, StoreError> {
    Ok(ApprovalRecord {
        id,
        product_ref,
        variant_tag,
        original_images: serde_json::from_str(&originals)?,
        processed_images: serde_json::from_str(&processed)?,
        status: ApprovalStatus::from_str(&status).unwrap_or(ApprovalStatus::Pending),
        created_at: parse_timestamp(&created_at)?,
        approved_at: approved_at.as_deref().map(parse_timestamp).transpose()?,
        reject_reason,
    })
}

fn parse_timestamp(raw: &str) -> Result<DateTime<Utc>, chrono::ParseError> {
    DateTime::parse_from_rfc3339(raw).map(|ts| ts.with_timezone(&Utc))
}

fn open_connection(path: PathBuf) -> Result<rusqlite::Connection, rusqlite::Error> {
    if let Some(parent) = path.parent()
        && !parent.as_os_str().is_empty()
    {
        let _ = std::fs::create_dir_all(parent);
    }
    let conn = rusqlite::Connection::open(path)?;
    let _ = conn.busy_timeout(Duration::from_secs(5));
    let _ = conn.execute_batch("PRAGMA journal_mode = WAL; PRAGMA synchronous = NORMAL;");
    Ok(conn)
}

fn init_schema(conn: &rusqlite::Connection) -> Result<(), rusqlite::Error> {
    conn.execute_batch(
        "CREATE TABLE IF NOT EXISTS approval (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            product_ref TEXT NOT NULL,
            variant_tag TEXT,
            original_images TEXT NOT NULL,
            processed_images TEXT NOT NULL,
            status TEXT NOT NULL CHECK(status IN ('pending', 'approved', 'rejected')),
            created_at TEXT NOT NULL,
            approved_at TEXT,
            reject_reason TEXT
        );
        CREATE INDEX IF NOT EXISTS idx_approval_status
            ON approval(status);
        CREATE INDEX IF NOT EXISTS idx_approval_product_ref
            ON approval(product_ref);",
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn temp_store() -> (tempfile::TempDir, ApprovalStore) {
        let dir = tempfile::tempdir().expect("tempdir");
        let store = ApprovalStore::new(dir.path().join("approvals.db"));
        store.init().await.expect("init");
        (dir, store)
    }

    fn images(n: usize) -> Vec<String> {
        (0..n)
            .map(|i| format!("https://cdn.example.com/img-{i}.jpg"))
            .collect()
    }

    #[tokio::test]
    async fn add_pending_then_list_most_recent_first() {
        let (_dir, store) = temp_store().await;
        let first = store
            .add_pending("101", &images(2), &images(2), None)
            .await
            .expect("add first");
        let second = store
            .add_pending("102", &images(1), &images(1), Some("Supplier:apify".into()))
            .await
            .expect("add second");

        let pending = store.list_pending().await.expect("list");
        assert_eq!(pending.len(), 2);
        assert_eq!(pending[0].id, second);
        assert_eq!(pending[1].id, first);
        assert_eq!(pending[0].variant_tag.as_deref(), Some("Supplier:apify"));
        assert_eq!(pending[1].status, ApprovalStatus::Pending);
    }

    #[tokio::test]
    async fn find_pending_by_product_ignores_terminal_records() {
        let (_dir, store) = temp_store().await;
        let id = store
            .add_pending("77", &images(1), &images(1), None)
            .await
            .expect("add");
        assert!(
            store
                .find_pending_by_product("77")
                .await
                .expect("find")
                .is_some()
        );

        store.approve(id).await.expect("approve");
        assert!(
            store
                .find_pending_by_product("77")
                .await
                .expect("find after approve")
                .is_none()
        );
        assert!(
            store
                .find_pending_by_product("unknown")
                .await
                .expect("find unknown")
                .is_none()
        );
    }

    #[tokio::test]
    async fn approve_then_reject_is_invalid_transition() {
        let (_dir, store) = temp_store().await;
        let id = store
            .add_pending("55", &images(1), &images(3), None)
            .await
            .expect("add");

        let approved = store.approve(id).await.expect("approve");
        assert_eq!(approved.status, ApprovalStatus::Approved);
        assert!(approved.approved_at.is_some());

        let err = store.reject(id, Some("late change".into())).await;
        assert!(matches!(
            err,
            Err(StoreError::InvalidTransition {
                status: ApprovalStatus::Approved,
                ..
            })
        ));

        // The record stays approved.
        let record = store.get(id).await.expect("get");
        assert_eq!(record.status, ApprovalStatus::Approved);
        assert!(record.reject_reason.is_none());
    }

    #[tokio::test]
    async fn reject_defaults_blank_reason() {
        let (_dir, store) = temp_store().await;
        let id = store
            .add_pending("56", &images(1), &images(1), None)
            .await
            .expect("add");
        let rejected = store.reject(id, Some("   ".into())).await.expect("reject");
        assert_eq!(rejected.status, ApprovalStatus::Rejected);
        assert_eq!(rejected.reject_reason.as_deref(), Some("No reason provided"));
    }

    #[tokio::test]
    async fn approve_unknown_id_is_not_found() {
        let (_dir, store) = temp_store().await;
        assert!(matches!(
            store.approve(9999).await,
            Err(StoreError::NotFound(9999))
        ));
    }

    #[tokio::test]
    async fn concurrent_approve_and_reject_have_one_winner() {
        let (_dir, store) = temp_store().await;
        let id = store
            .add_pending("race", &images(1), &images(1), None)
            .await
            .expect("add");

        let approver = store.clone();
        let rejecter = store.clone();
        let (a, r) = tokio::join!(
            tokio::spawn(async move { approver.approve(id).await }),
            tokio::spawn(async move { rejecter.reject(id, None).await }),
        );
        let a = a.expect("join");
        let r = r.expect("join");

        let successes = [a.is_ok(), r.is_ok()].iter().filter(|ok| **ok).count();
        assert_eq!(successes, 1);
        let loser = if a.is_ok() { r } else { a };
        assert!(matches!(
            loser,
            Err(StoreError::InvalidTransition { .. })
        ));

        let record = store.get(id).await.expect("get");
        assert_ne!(record.status, ApprovalStatus::Pending);
    }

    #[tokio::test]
    async fn records_survive_reopen() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("approvals.db");
        let id = {
            let store = ApprovalStore::new(&path);
            store.init().await.expect("init");
            store
                .add_pending("300", &images(2), &images(2), Some("sale".into()))
                .await
                .expect("add")
        };

        let reopened = ApprovalStore::new(&path);
        let record = reopened.get(id).await.expect("get after reopen");
        assert_eq!(record.product_ref, "300");
        assert_eq!(record.original_images.len(), 2);
        assert_eq!(record.status, ApprovalStatus::Pending);
    }
}
