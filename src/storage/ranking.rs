use super::{decode, get_json, put_json, KeyValueStore, StorageError};
use crate::models::{EnrichedStock, RankingCache};
use chrono::{DateTime, Utc};
use std::collections::BTreeMap;
use std::sync::Arc;
use tracing::warn;

const NAMESPACE: &str = "ranking";
const META_NAMESPACE: &str = "meta";
const LAST_UPDATED_KEY: &str = "ranking.last_updated";

/// Enriched snapshots keyed by ticker. Merging upserts; tickers not in the
/// batch are left untouched.
#[derive(Clone)]
pub struct RankingStore {
    store: Arc<dyn KeyValueStore>,
}

impl RankingStore {
    pub fn new(store: Arc<dyn KeyValueStore>) -> Self {
        Self { store }
    }

    /// Upsert `stocks` by ticker in one write. Later duplicates win.
    pub fn merge(&self, stocks: &[EnrichedStock], now: DateTime<Utc>) -> Result<usize, StorageError> {
        let mut by_ticker = BTreeMap::new();
        for stock in stocks {
            by_ticker.insert(stock.ticker.clone(), stock);
        }

        let entries = by_ticker
            .into_iter()
            .map(|(ticker, stock)| Ok((ticker, serde_json::to_string(stock)?)))
            .collect::<Result<Vec<_>, StorageError>>()?;

        self.store.put_many(NAMESPACE, &entries)?;
        put_json(self.store.as_ref(), META_NAMESPACE, LAST_UPDATED_KEY, &now)?;
        Ok(entries.len())
    }

    /// Every cached stock in ticker order. Unreadable rows are skipped.
    pub fn load(&self) -> Result<RankingCache, StorageError> {
        let mut stocks = Vec::new();
        for (ticker, raw) in self.store.entries(NAMESPACE)? {
            match decode::<EnrichedStock>(NAMESPACE, &ticker, &raw) {
                Ok(stock) => stocks.push(stock),
                Err(e) => warn!("Skipping ranking row: {}", e),
            }
        }

        Ok(RankingCache {
            last_updated: self.last_updated()?,
            stocks,
        })
    }

    pub fn last_updated(&self) -> Result<Option<DateTime<Utc>>, StorageError> {
        get_json(self.store.as_ref(), META_NAMESPACE, LAST_UPDATED_KEY)
    }

    pub fn get(&self, ticker: &str) -> Result<Option<EnrichedStock>, StorageError> {
        get_json(self.store.as_ref(), NAMESPACE, &ticker.trim().to_uppercase())
    }

    pub fn count(&self) -> Result<usize, StorageError> {
        Ok(self.store.list_keys(NAMESPACE)?.len())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::metrics::enrich::tests::as_of;
    use crate::screener::tests::stock;
    use crate::storage::MemoryStore;

    #[test]
    fn test_merge_upserts_by_ticker() {
        let store: Arc<dyn KeyValueStore> = Arc::new(MemoryStore::new());
        let ranking = RankingStore::new(store.clone());

        ranking
            .merge(&[stock("AAA", 4.0, 5.0, 1.0, 1.2), stock("BBB", 4.0, 5.0, 1.0, 1.2)], as_of())
            .unwrap();

        let mut updated = stock("AAA", 4.0, 5.0, 1.0, 1.2);
        updated.price = 123.0;
        let written = ranking
            .merge(&[stock("AAA", 1.0, 1.0, 1.0, 1.0), updated, stock("CCC", 4.0, 5.0, 1.0, 1.2)], as_of())
            .unwrap();
        assert_eq!(written, 2);

        let cache = ranking.load().unwrap();
        let tickers: Vec<&str> = cache.stocks.iter().map(|s| s.ticker.as_str()).collect();
        assert_eq!(tickers, ["AAA", "BBB", "CCC"]);
        assert_eq!(cache.stocks[0].price, 123.0);
        assert_eq!(cache.last_updated, Some(as_of()));
        assert_eq!(ranking.count().unwrap(), 3);
        assert_eq!(ranking.get("bbb").unwrap().map(|s| s.ticker).as_deref(), Some("BBB"));
    }

    #[test]
    fn test_load_skips_corrupt_rows() {
        let store: Arc<dyn KeyValueStore> = Arc::new(MemoryStore::new());
        let ranking = RankingStore::new(store.clone());
        ranking.merge(&[stock("AAA", 4.0, 5.0, 1.0, 1.2)], as_of()).unwrap();
        store.put(NAMESPACE, "BAD", "{").unwrap();

        let cache = ranking.load().unwrap();
        assert_eq!(cache.stocks.len(), 1);
    }

    #[test]
    fn test_empty_cache() {
        let ranking = RankingStore::new(Arc::new(MemoryStore::new()));
        let cache = ranking.load().unwrap();
        assert!(cache.stocks.is_empty());
        assert_eq!(cache.last_updated, None);
    }
}
