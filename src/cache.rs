use std::collections::HashMap;
use std::sync::Arc;

use tokio::sync::RwLock;
use tracing::debug;

use crate::error::StoreError;
use crate::records::{
    ASSET_PRICES_TABLE, AssetPriceRecord, CORRELATION_TABLE, CorrelationRecord,
    RELATIVE_STRENGTH_TABLE, RelativeStrengthRecord,
};
use crate::store::{ResultStore, SeriesQuery};

type Entries<R> = RwLock<HashMap<SeriesQuery, Arc<Vec<R>>>>;

/// Memoized reads over one or two `ResultStore`s, keyed by table and query.
///
/// Entries live until `invalidate` is called for their table; the pipeline
/// does that after every successful commit.
pub struct ReadCache {
    correlation_store: ResultStore,
    strength_store: ResultStore,
    correlations: Entries<CorrelationRecord>,
    relative_strength: Entries<RelativeStrengthRecord>,
    asset_prices: Entries<AssetPriceRecord>,
}

impl ReadCache {
    pub fn new(correlation_store: ResultStore, strength_store: ResultStore) -> Self {
        Self {
            correlation_store,
            strength_store,
            correlations: RwLock::default(),
            relative_strength: RwLock::default(),
            asset_prices: RwLock::default(),
        }
    }

    pub async fn correlations(
        &self,
        query: &SeriesQuery,
    ) -> Result<Arc<Vec<CorrelationRecord>>, StoreError> {
        if let Some(hit) = self.correlations.read().await.get(query) {
            return Ok(hit.clone());
        }
        let rows = Arc::new(self.correlation_store.correlations(query).await?);
        self.correlations
            .write()
            .await
            .insert(query.clone(), rows.clone());
        Ok(rows)
    }

    pub async fn relative_strength(
        &self,
        query: &SeriesQuery,
    ) -> Result<Arc<Vec<RelativeStrengthRecord>>, StoreError> {
        if let Some(hit) = self.relative_strength.read().await.get(query) {
            return Ok(hit.clone());
        }
        let rows = Arc::new(self.strength_store.relative_strength(query).await?);
        self.relative_strength
            .write()
            .await
            .insert(query.clone(), rows.clone());
        Ok(rows)
    }

    pub async fn asset_prices(
        &self,
        query: &SeriesQuery,
    ) -> Result<Arc<Vec<AssetPriceRecord>>, StoreError> {
        if let Some(hit) = self.asset_prices.read().await.get(query) {
            return Ok(hit.clone());
        }
        let rows = Arc::new(self.strength_store.asset_prices(query).await?);
        self.asset_prices
            .write()
            .await
            .insert(query.clone(), rows.clone());
        Ok(rows)
    }

    /// Drop every cached entry of the named tables. Unknown names are ignored.
    pub async fn invalidate(&self, tables: &[&str]) {
        for table in tables {
            match *table {
                CORRELATION_TABLE => self.correlations.write().await.clear(),
                RELATIVE_STRENGTH_TABLE => self.relative_strength.write().await.clear(),
                ASSET_PRICES_TABLE => self.asset_prices.write().await.clear(),
                _ => continue,
            }
            debug!("cache invalidated for {}", table);
        }
    }

    pub async fn invalidate_all(&self) {
        self.invalidate(&[CORRELATION_TABLE, RELATIVE_STRENGTH_TABLE, ASSET_PRICES_TABLE])
            .await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::NaiveDate;

    fn row(day: u32, v: f64) -> CorrelationRecord {
        CorrelationRecord {
            date: NaiveDate::from_ymd_opt(2024, 3, day).unwrap(),
            pair: "BTC-USD/ETH-USD".into(),
            window: 7,
            rolling_correlation: Some(v),
        }
    }

    #[tokio::test]
    async fn test_hits_until_invalidated() {
        let dir = tempfile::tempdir().unwrap();
        let url = format!("sqlite://{}", dir.path().join("c.db").display());
        let store = ResultStore::connect(&url).await.unwrap();
        store.replace(&[row(1, 0.1)]).await.unwrap();

        let cache = ReadCache::new(store.clone(), store.clone());
        let q = SeriesQuery::default();
        let first = cache.correlations(&q).await.unwrap();
        assert_eq!(first.len(), 1);

        store.replace(&[row(1, 0.1), row(2, 0.2)]).await.unwrap();
        let stale = cache.correlations(&q).await.unwrap();
        assert!(Arc::ptr_eq(&first, &stale));

        // other tables do not touch correlation entries
        cache.invalidate(&[ASSET_PRICES_TABLE]).await;
        assert_eq!(cache.correlations(&q).await.unwrap().len(), 1);

        cache.invalidate(&[CORRELATION_TABLE]).await;
        assert_eq!(cache.correlations(&q).await.unwrap().len(), 2);
    }

    #[tokio::test]
    async fn test_queries_are_cached_separately() {
        let dir = tempfile::tempdir().unwrap();
        let url = format!("sqlite://{}", dir.path().join("c.db").display());
        let store = ResultStore::connect(&url).await.unwrap();
        store.replace(&[row(1, 0.1), row(2, 0.2)]).await.unwrap();

        let cache = ReadCache::new(store.clone(), store);
        let all = cache.correlations(&SeriesQuery::default()).await.unwrap();
        let recent = cache
            .correlations(&SeriesQuery::default().since(NaiveDate::from_ymd_opt(2024, 3, 2).unwrap()))
            .await
            .unwrap();
        assert_eq!(all.len(), 2);
        assert_eq!(recent.len(), 1);

        cache.invalidate_all().await;
        assert!(cache.relative_strength(&SeriesQuery::default()).await.unwrap().is_empty());
    }
}
