use super::{get_json, KeyValueStore, StorageError};
use crate::models::Exclusion;
use std::collections::BTreeMap;
use std::sync::Arc;

const NAMESPACE: &str = "exclusion";

/// Latest reason each ticker was dropped before reaching the ranking cache.
/// A ticker that later enriches is cleared.
#[derive(Clone)]
pub struct ExclusionStore {
    store: Arc<dyn KeyValueStore>,
}

impl ExclusionStore {
    pub fn new(store: Arc<dyn KeyValueStore>) -> Self {
        Self { store }
    }

    /// Upsert by ticker in one write. Later duplicates win.
    pub fn record(&self, exclusions: &[Exclusion]) -> Result<usize, StorageError> {
        let mut by_ticker = BTreeMap::new();
        for e in exclusions {
            by_ticker.insert(e.ticker.clone(), e);
        }

        let entries = by_ticker
            .into_iter()
            .map(|(ticker, e)| Ok((ticker, serde_json::to_string(e)?)))
            .collect::<Result<Vec<_>, StorageError>>()?;

        self.store.put_many(NAMESPACE, &entries)?;
        Ok(entries.len())
    }

    /// Forget any recorded exclusion for `tickers`.
    pub fn clear<'a>(&self, tickers: impl IntoIterator<Item = &'a str>) -> Result<(), StorageError> {
        for ticker in tickers {
            self.store.delete(NAMESPACE, ticker)?;
        }
        Ok(())
    }

    pub fn get(&self, ticker: &str) -> Result<Option<Exclusion>, StorageError> {
        get_json(self.store.as_ref(), NAMESPACE, &ticker.trim().to_uppercase())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::Stage;
    use crate::storage::MemoryStore;

    #[test]
    fn test_record_get_and_clear() {
        let exclusions = ExclusionStore::new(Arc::new(MemoryStore::new()));
        exclusions
            .record(&[
                Exclusion::new("PINK", Stage::Eligibility, "OTC/pink-sheet venue (OTC)"),
                Exclusion::new("THIN", Stage::Enrichment, "no quarterly income statements"),
                Exclusion::new("THIN", Stage::Enrichment, "no quote data"),
            ])
            .unwrap();

        let thin = exclusions.get("thin").unwrap().unwrap();
        assert_eq!(thin.stage, Stage::Enrichment);
        assert_eq!(thin.reason, "no quote data");

        exclusions.clear(["THIN", "NEVER"]).unwrap();
        assert!(exclusions.get("THIN").unwrap().is_none());
        assert_eq!(exclusions.get("PINK").unwrap().map(|e| e.stage), Some(Stage::Eligibility));
    }
}
