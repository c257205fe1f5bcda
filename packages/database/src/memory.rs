//! In-memory statistics store for tests and dry runs.

use std::collections::{BTreeMap, BTreeSet};

use async_trait::async_trait;
use taxi_stat_models::StatAggregate;
use taxi_trip_models::{Category, Period};
use tokio::sync::Mutex;

use crate::{CommitOutcome, StatStore, StatStoreError};

#[derive(Default)]
struct State {
    aggregates: BTreeMap<(Category, Period), StatAggregate>,
    markers: BTreeSet<(Category, String)>,
}

impl State {
    fn add(&mut self, aggregate: &StatAggregate) {
        self.aggregates
            .entry((aggregate.category, aggregate.period))
            .or_insert_with(|| StatAggregate::empty(aggregate.category, aggregate.period))
            .merge(aggregate);
    }
}

/// Statistics held in process memory. Lost on drop.
#[derive(Default)]
pub struct MemoryStatStore {
    state: Mutex<State>,
}

impl MemoryStatStore {
    /// Creates an empty store.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl StatStore for MemoryStatStore {
    async fn append(&self, aggregate: &StatAggregate) -> Result<(), StatStoreError> {
        self.state.lock().await.add(aggregate);
        Ok(())
    }

    async fn append_once(
        &self,
        marker: &str,
        aggregate: &StatAggregate,
    ) -> Result<CommitOutcome, StatStoreError> {
        let mut state = self.state.lock().await;
        if !state
            .markers
            .insert((aggregate.category, marker.to_string()))
        {
            return Ok(CommitOutcome::Duplicate);
        }
        state.add(aggregate);
        Ok(CommitOutcome::Committed)
    }

    async fn try_get(
        &self,
        category: Category,
        period: Period,
    ) -> Result<StatAggregate, StatStoreError> {
        Ok(self
            .state
            .lock()
            .await
            .aggregates
            .get(&(category, period))
            .cloned()
            .unwrap_or_else(|| StatAggregate::empty(category, period)))
    }

    async fn periods(&self, category: Category) -> Result<Vec<Period>, StatStoreError> {
        Ok(self
            .state
            .lock()
            .await
            .aggregates
            .keys()
            .filter(|(c, _)| *c == category)
            .map(|(_, p)| *p)
            .collect())
    }

    async fn purge(&self, category: Category) -> Result<u64, StatStoreError> {
        let mut state = self.state.lock().await;
        let mut removed = 0;
        state.aggregates.retain(|(c, _), aggregate| {
            if *c == category {
                removed += aggregate.counters().len() as u64;
                false
            } else {
                true
            }
        });
        state.markers.retain(|(c, _)| *c != category);
        Ok(removed)
    }
}

#[cfg(test)]
mod tests {
    use taxi_stat_models::Table;

    use super::*;

    fn aggregate(month: u32) -> StatAggregate {
        let mut agg = StatAggregate::empty(Category::Green, Period::new(2015, month).unwrap());
        agg.total = 3;
        agg.add(Table::Hour, 0, 3);
        agg
    }

    #[tokio::test]
    async fn accumulates_and_reads_back() {
        let store = MemoryStatStore::new();
        store.append(&aggregate(1)).await.unwrap();
        store.append(&aggregate(1)).await.unwrap();

        let got = store.get(Category::Green, Period::new(2015, 1).unwrap()).await;
        assert_eq!(got.total, 6);
        assert_eq!(got.hour.get(&0), Some(&6));
        assert!(store.get(Category::Yellow, Period::new(2015, 1).unwrap()).await.is_empty());
    }

    #[tokio::test]
    async fn duplicate_marker_is_skipped() {
        let store = MemoryStatStore::new();
        let agg = aggregate(2);
        assert_eq!(store.append_once("a", &agg).await.unwrap(), CommitOutcome::Committed);
        assert_eq!(store.append_once("a", &agg).await.unwrap(), CommitOutcome::Duplicate);

        let got = store.get(Category::Green, Period::new(2015, 2).unwrap()).await;
        assert_eq!(got.total, 3);
    }

    #[tokio::test]
    async fn purge_removes_category_and_markers() {
        let store = MemoryStatStore::new();
        store.append_once("a", &aggregate(3)).await.unwrap();
        store.append(&aggregate(1)).await.unwrap();

        assert_eq!(
            store.periods(Category::Green).await.unwrap(),
            vec![Period::new(2015, 1).unwrap(), Period::new(2015, 3).unwrap()]
        );
        assert_eq!(store.purge(Category::Green).await.unwrap(), 4);
        assert!(store.periods(Category::Green).await.unwrap().is_empty());
        assert_eq!(
            store.append_once("a", &aggregate(3)).await.unwrap(),
            CommitOutcome::Committed
        );
    }
}
