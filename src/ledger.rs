use chrono::NaiveDate;
use rusqlite::{OptionalExtension, TransactionBehavior, params};
use std::path::PathBuf;
use std::time::Duration;
use thiserror::Error;

/// Daily spend ledger for metered external calls, keyed by UTC calendar
/// date. Amounts are integer micro-USD so repeated small charges sum
/// exactly. Entries are created lazily on the first charge of a day and
/// never pruned.
#[derive(Clone, Debug)]
pub struct CostLedger {
    path: PathBuf,
}

#[derive(Debug, Error)]
pub enum LedgerError {
    #[error("sqlite join error: {0}")]
    Join(#[from] tokio::task::JoinError),
    #[error("sqlite error: {0}")]
    Sqlite(#[from] rusqlite::Error),
}

pub fn usd_to_micros(usd: f64) -> u64 {
    if usd <= 0.0 {
        return 0;
    }
    (usd * 1_000_000.0).round() as u64
}

pub fn micros_to_usd(micros: u64) -> f64 {
    micros as f64 / 1_000_000.0
}

impl CostLedger {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub async fn init(&self) -> Result<(), LedgerError> {
        let path = self.path.clone();
        tokio::task::spawn_blocking(move || -> Result<(), LedgerError> {
            let conn = open_connection(path)?;
            init_schema(&conn)?;
            Ok(())
        })
        .await?
    }

    /// Cumulative spend recorded for `day`, zero if nothing was charged.
    pub async fn current_spend(&self, day: NaiveDate) -> Result<u64, LedgerError> {
        let path = self.path.clone();
        let key = day_key(day);
        tokio::task::spawn_blocking(move || -> Result<u64, LedgerError> {
            let conn = open_connection(path)?;
            init_schema(&conn)?;
            let spent: Option<i64> = conn
                .query_row(
                    "SELECT spent_usd_micros FROM cost_ledger WHERE day = ?1",
                    params![key],
                    |row| row.get(0),
                )
                .optional()?;
            Ok(spent.map(i64_to_u64).unwrap_or(0))
        })
        .await?
    }

    /// Adds `usd_micros` to the day's total and returns the new total.
    /// Durable on return: a restart observes the updated amount. There is
    /// no refund operation; by the time a charge is recorded the external
    /// spend has already happened.
    pub async fn charge(&self, day: NaiveDate, usd_micros: u64) -> Result<u64, LedgerError> {
        let path = self.path.clone();
        let key = day_key(day);
        let amount = micros_to_i64(usd_micros);
        tokio::task::spawn_blocking(move || -> Result<u64, LedgerError> {
            let mut conn = open_connection(path)?;
            init_schema(&conn)?;
            let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
            tx.execute(
                "INSERT OR IGNORE INTO cost_ledger (day, spent_usd_micros) VALUES (?1, 0)",
                params![key],
            )?;
            tx.execute(
                "UPDATE cost_ledger SET spent_usd_micros = spent_usd_micros + ?2 WHERE day = ?1",
                params![key, amount],
            )?;
            let total: i64 = tx.query_row(
                "SELECT spent_usd_micros FROM cost_ledger WHERE day = ?1",
                params![key],
                |row| row.get(0),
            )?;
            tx.commit()?;
            Ok(i64_to_u64(total))
        })
        .await?
    }
}

fn day_key(day: NaiveDate) -> String {
    day.format("%Y-%m-%d").to_string()
}

fn micros_to_i64(micros: u64) -> i64 {
    if micros > i64::MAX as u64 {
        i64::MAX
    } else {
        micros as i64
    }
}

fn i64_to_u64(value: i64) -> u64 {
    if value <= 0 { 0 } else { value as u64 }
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
        "CREATE TABLE IF NOT EXISTS cost_ledger (
            day TEXT PRIMARY KEY NOT NULL,
            spent_usd_micros INTEGER NOT NULL DEFAULT 0
        );",
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    fn day(s: &str) -> NaiveDate {
        NaiveDate::parse_from_str(s, "%Y-%m-%d").unwrap()
    }

    #[tokio::test]
    async fn charge_accumulates_per_day() {
        let dir = tempfile::tempdir().expect("tempdir");
        let ledger = CostLedger::new(dir.path().join("costs.db"));
        ledger.init().await.expect("init");

        let monday = day("2025-03-03");
        let tuesday = day("2025-03-04");

        assert_eq!(ledger.current_spend(monday).await.expect("spend"), 0);
        assert_eq!(ledger.charge(monday, 8_000).await.expect("charge"), 8_000);
        assert_eq!(ledger.charge(monday, 5_000).await.expect("charge"), 13_000);
        assert_eq!(ledger.current_spend(monday).await.expect("spend"), 13_000);

        // Days are independent entries.
        assert_eq!(ledger.current_spend(tuesday).await.expect("spend"), 0);
        assert_eq!(ledger.charge(tuesday, 2_000).await.expect("charge"), 2_000);
        assert_eq!(ledger.current_spend(monday).await.expect("spend"), 13_000);
    }

    #[tokio::test]
    async fn totals_survive_reopen() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("costs.db");
        let friday = day("2025-03-07");
        {
            let ledger = CostLedger::new(&path);
            ledger.init().await.expect("init");
            ledger.charge(friday, 42_000).await.expect("charge");
        }
        let reopened = CostLedger::new(&path);
        assert_eq!(
            reopened.current_spend(friday).await.expect("spend"),
            42_000
        );
    }

    #[test]
    fn usd_micro_conversions_are_exact_for_call_prices() {
        assert_eq!(usd_to_micros(0.008), 8_000);
        assert_eq!(usd_to_micros(0.005), 5_000);
        assert_eq!(usd_to_micros(0.002), 2_000);
        assert_eq!(usd_to_micros(5.00), 5_000_000);
        assert_eq!(usd_to_micros(-1.0), 0);
        assert!((micros_to_usd(8_000) - 0.008).abs() < 1e-9);
    }
}
