//! `DuckDB`-backed statistics store.
//!
//! One row per counter: `(category, date, field) -> value`, where `date`
//! is `year * 100 + month` and `field` is the one-letter-prefixed counter
//! name. Appends upsert with `value = value + excluded.value` inside a
//! transaction, so an append is applied completely or not at all.
//!
//! `DuckDB` calls block, so each runs on tokio's blocking pool behind a
//! shared connection lock.

use std::path::Path;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use duckdb::{Connection, params};
use taxi_stat_models::StatAggregate;
use taxi_trip_models::{Category, Period};

use crate::{CommitOutcome, StatStore, StatStoreError};

/// Statistics stored in a `DuckDB` database.
pub struct DuckDbStatStore {
    conn: Arc<Mutex<Connection>>,
}

impl DuckDbStatStore {
    /// Opens (or creates) the database at `path` and ensures the schema
    /// exists.
    ///
    /// # Errors
    ///
    /// Returns [`StatStoreError`] if the connection or schema creation
    /// fails.
    pub fn open(path: &Path) -> Result<Self, StatStoreError> {
        if let Some(parent) = path.parent()
            && !parent.as_os_str().is_empty()
        {
            crate::paths::ensure_dir(parent)?;
        }
        let conn = Connection::open(path)?;
        log::info!("Opened statistics store {}", path.display());
        Self::with_connection(conn)
    }

    /// Opens a private in-memory database.
    ///
    /// # Errors
    ///
    /// Returns [`StatStoreError`] if the connection or schema creation
    /// fails.
    pub fn open_in_memory() -> Result<Self, StatStoreError> {
        Self::with_connection(Connection::open_in_memory()?)
    }

    fn with_connection(conn: Connection) -> Result<Self, StatStoreError> {
        create_schema(&conn)?;
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    /// Runs `f` against the connection on the blocking thread pool.
    async fn with_conn<T, F>(&self, f: F) -> Result<T, StatStoreError>
    where
        T: Send + 'static,
        F: FnOnce(&mut Connection) -> Result<T, StatStoreError> + Send + 'static,
    {
        let conn = Arc::clone(&self.conn);
        tokio::task::spawn_blocking(move || {
            let mut conn = conn.lock().map_err(|_| StatStoreError::Poisoned)?;
            f(&mut conn)
        })
        .await?
    }
}

fn create_schema(conn: &Connection) -> Result<(), StatStoreError> {
    conn.execute_batch(
        "CREATE TABLE IF NOT EXISTS trip_stats (
            category TEXT NOT NULL,
            date BIGINT NOT NULL,
            field TEXT NOT NULL,
            value BIGINT NOT NULL,
            PRIMARY KEY (category, date, field)
        );

        CREATE TABLE IF NOT EXISTS task_commits (
            marker TEXT PRIMARY KEY,
            category TEXT NOT NULL,
            date BIGINT NOT NULL
        );",
    )?;
    Ok(())
}

/// Upserts every counter of `aggregate` using `conn` (usually a
/// transaction).
fn add_counters(conn: &Connection, aggregate: &StatAggregate) -> Result<usize, StatStoreError> {
    let category = aggregate.category.as_ref();
    let date = aggregate.period.date_key();
    let mut stmt = conn.prepare(
        "INSERT INTO trip_stats (category, date, field, value) VALUES (?, ?, ?, ?)
         ON CONFLICT (category, date, field) DO UPDATE SET value = value + excluded.value",
    )?;

    let fields = aggregate.counters();
    for (field, value) in &fields {
        let value = i64::try_from(*value).map_err(|_| StatStoreError::Conversion {
            message: format!("counter {field} = {value} exceeds BIGINT"),
        })?;
        stmt.execute(params![category, date, field, value])?;
    }
    Ok(fields.len())
}

#[async_trait]
impl StatStore for DuckDbStatStore {
    async fn append(&self, aggregate: &StatAggregate) -> Result<(), StatStoreError> {
        let aggregate = aggregate.clone();
        self.with_conn(move |conn| {
            let tx = conn.transaction()?;
            let fields = add_counters(&tx, &aggregate)?;
            tx.commit()?;
            log::info!(
                "Appended {fields} counters to {}-{}",
                aggregate.category,
                aggregate.period
            );
            Ok(())
        })
        .await
    }

    async fn append_once(
        &self,
        marker: &str,
        aggregate: &StatAggregate,
    ) -> Result<CommitOutcome, StatStoreError> {
        let marker = marker.to_string();
        let aggregate = aggregate.clone();
        self.with_conn(move |conn| {
            let tx = conn.transaction()?;
            let inserted = tx.execute(
                "INSERT INTO task_commits (marker, category, date) VALUES (?, ?, ?)
                 ON CONFLICT DO NOTHING",
                params![
                    marker,
                    aggregate.category.as_ref(),
                    aggregate.period.date_key()
                ],
            )?;

            if inserted == 0 {
                tx.rollback()?;
                log::warn!("Commit {marker} already applied, skipping");
                return Ok(CommitOutcome::Duplicate);
            }

            let fields = add_counters(&tx, &aggregate)?;
            tx.commit()?;
            log::info!(
                "Appended {fields} counters to {}-{} (commit {marker})",
                aggregate.category,
                aggregate.period
            );
            Ok(CommitOutcome::Committed)
        })
        .await
    }

    async fn try_get(
        &self,
        category: Category,
        period: Period,
    ) -> Result<StatAggregate, StatStoreError> {
        self.with_conn(move |conn| {
            let mut stmt = conn
                .prepare("SELECT field, value FROM trip_stats WHERE category = ? AND date = ?")?;
            let rows = stmt.query_map(params![category.as_ref(), period.date_key()], |row| {
                Ok((row.get::<_, String>(0)?, row.get::<_, i64>(1)?))
            })?;

            let mut fields = Vec::new();
            for row in rows {
                let (field, value) = row?;
                fields.push((field, u64::try_from(value).unwrap_or(0)));
            }
            Ok(StatAggregate::from_counters(category, period, fields))
        })
        .await
    }

    async fn periods(&self, category: Category) -> Result<Vec<Period>, StatStoreError> {
        self.with_conn(move |conn| {
            let mut stmt = conn.prepare(
                "SELECT DISTINCT date FROM trip_stats WHERE category = ? ORDER BY date",
            )?;
            let rows = stmt.query_map(params![category.as_ref()], |row| row.get::<_, i64>(0))?;

            let mut periods = Vec::new();
            for row in rows {
                let key = row?;
                match Period::from_date_key(key) {
                    Ok(period) => periods.push(period),
                    Err(e) => log::warn!("Skipping stored {category} statistics: {e}"),
                }
            }
            Ok(periods)
        })
        .await
    }

    async fn purge(&self, category: Category) -> Result<u64, StatStoreError> {
        self.with_conn(move |conn| {
            let tx = conn.transaction()?;
            let removed = tx.execute(
                "DELETE FROM trip_stats WHERE category = ?",
                params![category.as_ref()],
            )?;
            tx.execute(
                "DELETE FROM task_commits WHERE category = ?",
                params![category.as_ref()],
            )?;
            tx.commit()?;
            log::info!("Purged {removed} {category} counters");
            Ok(removed as u64)
        })
        .await
    }
}

#[cfg(test)]
mod tests {
    use taxi_stat_models::Table;

    use super::*;

    fn aggregate(category: Category, month: u32, scale: u64) -> StatAggregate {
        let mut agg = StatAggregate::empty(category, Period::new(2016, month).unwrap());
        agg.total = 10 * scale;
        agg.invalid = scale;
        agg.add(Table::Pickups, 10_401, 4 * scale);
        agg.add(Table::Dropoffs, 40_101, 5 * scale);
        agg.add(Table::Hour, 8, 9 * scale);
        agg.add(Table::Fare, 10, 9 * scale);
        agg.derive_region_totals();
        agg
    }

    #[tokio::test]
    async fn appends_are_additive() {
        let store = DuckDbStatStore::open_in_memory().unwrap();
        store.append(&aggregate(Category::Yellow, 1, 1)).await.unwrap();
        store.append(&aggregate(Category::Yellow, 1, 2)).await.unwrap();

        let got = store.get(Category::Yellow, Period::new(2016, 1).unwrap()).await;
        assert_eq!(got, aggregate(Category::Yellow, 1, 3));
    }

    #[tokio::test]
    async fn missing_key_reads_as_zero() {
        let store = DuckDbStatStore::open_in_memory().unwrap();
        let period = Period::new(2015, 3).unwrap();
        let got = store.get(Category::Green, period).await;
        assert!(got.is_empty());
        assert_eq!(got.period, period);
    }

    #[tokio::test]
    async fn marker_guarded_commit_applies_once() {
        let store = DuckDbStatStore::open_in_memory().unwrap();
        let agg = aggregate(Category::Green, 2, 1);

        assert_eq!(
            store.append_once("green,2016,2,0,100,3600", &agg).await.unwrap(),
            CommitOutcome::Committed
        );
        assert_eq!(
            store.append_once("green,2016,2,0,100,3600", &agg).await.unwrap(),
            CommitOutcome::Duplicate
        );
        assert_eq!(
            store.append_once("green,2016,2,100,200,3600", &agg).await.unwrap(),
            CommitOutcome::Committed
        );

        let got = store.get(Category::Green, Period::new(2016, 2).unwrap()).await;
        assert_eq!(got.total, 20);
    }

    #[tokio::test]
    async fn lists_periods_and_purges_one_category() {
        let store = DuckDbStatStore::open_in_memory().unwrap();
        store.append(&aggregate(Category::Yellow, 3, 1)).await.unwrap();
        store.append(&aggregate(Category::Yellow, 1, 1)).await.unwrap();
        store.append(&aggregate(Category::Green, 1, 1)).await.unwrap();

        let periods = store.periods(Category::Yellow).await.unwrap();
        assert_eq!(
            periods,
            vec![Period::new(2016, 1).unwrap(), Period::new(2016, 3).unwrap()]
        );

        assert!(store.purge(Category::Yellow).await.unwrap() > 0);
        assert!(store.periods(Category::Yellow).await.unwrap().is_empty());
        assert_eq!(store.periods(Category::Green).await.unwrap().len(), 1);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn concurrent_appends_all_land() {
        let store = Arc::new(DuckDbStatStore::open_in_memory().unwrap());
        let mut set = tokio::task::JoinSet::new();
        for _ in 0..8 {
            let store = Arc::clone(&store);
            set.spawn(async move { store.append(&aggregate(Category::Green, 6, 1)).await });
        }
        while let Some(result) = set.join_next().await {
            result.unwrap().unwrap();
        }

        let got = store.get(Category::Green, Period::new(2016, 6).unwrap()).await;
        assert_eq!(got, aggregate(Category::Green, 6, 8));
    }

    #[tokio::test]
    async fn persists_to_file() {
        let dir = std::env::temp_dir().join("taxi_stat_db_file_test");
        let _ = std::fs::remove_dir_all(&dir);
        let path = dir.join("stats.duckdb");
        {
            let store = DuckDbStatStore::open(&path).unwrap();
            store.append(&aggregate(Category::Yellow, 5, 1)).await.unwrap();
        }
        let store = DuckDbStatStore::open(&path).unwrap();
        let got = store.get(Category::Yellow, Period::new(2016, 5).unwrap()).await;
        assert_eq!(got.total, 10);

        std::fs::remove_dir_all(&dir).ok();
    }
}
