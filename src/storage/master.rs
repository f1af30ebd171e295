use super::{decode, KeyValueStore, StorageError};
use crate::models::{RawFinancials, RawFinancialsPatch};
use chrono::{DateTime, Utc};
use std::sync::Arc;

const NAMESPACE: &str = "master";

/// Raw provider data, one document per symbol.
#[derive(Clone)]
pub struct MasterStore {
    store: Arc<dyn KeyValueStore>,
}

fn normalize(symbol: &str) -> String {
    symbol.trim().to_uppercase()
}

impl MasterStore {
    pub fn new(store: Arc<dyn KeyValueStore>) -> Self {
        Self { store }
    }

    /// Shallow-merge `patch` into the stored record (creating it if absent)
    /// and stamp `last_updated`. Returns the merged record.
    pub fn save(
        &self,
        symbol: &str,
        patch: RawFinancialsPatch,
        now: DateTime<Utc>,
    ) -> Result<RawFinancials, StorageError> {
        let key = normalize(symbol);
        let mut patch = Some(patch);

        let merged = self.store.update(NAMESPACE, &key, &mut |current| {
            let mut record = match current {
                Some(raw) => decode::<RawFinancials>(NAMESPACE, &key, &raw)?,
                None => RawFinancials::empty(&key),
            };
            record.apply(patch.take().unwrap_or_default());
            record.last_updated = now;
            Ok(serde_json::to_string(&record)?)
        })?;

        decode(NAMESPACE, &key, &merged)
    }

    pub fn get(&self, symbol: &str) -> Result<Option<RawFinancials>, StorageError> {
        super::get_json(self.store.as_ref(), NAMESPACE, &normalize(symbol))
    }

    pub fn list_keys(&self) -> Result<Vec<String>, StorageError> {
        self.store.list_keys(NAMESPACE)
    }

    pub fn delete(&self, symbol: &str) -> Result<bool, StorageError> {
        self.store.delete(NAMESPACE, &normalize(symbol))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{CompanyProfile, Quote};
    use crate::storage::MemoryStore;
    use chrono::Duration;

    fn quote(price: f64) -> Quote {
        Quote { symbol: "MSFT".into(), price, ..Default::default() }
    }

    #[test]
    fn test_save_merges_sections() {
        let master = MasterStore::new(Arc::new(MemoryStore::new()));
        let t0 = Utc::now();

        master
            .save("msft", RawFinancialsPatch { quote: Some(quote(400.0)), ..Default::default() }, t0)
            .unwrap();
        let merged = master
            .save(
                " MSFT ",
                RawFinancialsPatch {
                    profile: Some(CompanyProfile { symbol: "MSFT".into(), ..Default::default() }),
                    ..Default::default()
                },
                t0 + Duration::minutes(5),
            )
            .unwrap();

        assert_eq!(merged.quote.map(|q| q.price), Some(400.0));
        assert!(merged.profile.is_some());
        assert_eq!(merged.last_updated, t0 + Duration::minutes(5));
        assert_eq!(master.list_keys().unwrap(), ["MSFT"]);
        assert_eq!(master.get("msft").unwrap().map(|r| r.symbol).as_deref(), Some("MSFT"));
    }

    #[test]
    fn test_save_replaces_present_sections() {
        let master = MasterStore::new(Arc::new(MemoryStore::new()));
        let now = Utc::now();
        master
            .save("MSFT", RawFinancialsPatch { quote: Some(quote(1.0)), ..Default::default() }, now)
            .unwrap();
        master
            .save("MSFT", RawFinancialsPatch { quote: Some(quote(2.0)), ..Default::default() }, now)
            .unwrap();

        let stored = master.get("MSFT").unwrap().unwrap();
        assert_eq!(stored.quote.map(|q| q.price), Some(2.0));
        assert!(master.delete("MSFT").unwrap());
        assert!(master.get("MSFT").unwrap().is_none());
    }
}
