//! Shared fixtures: a small recipe database and the sources that read it.

#![allow(dead_code)]

use batchql_runtime::{async_trait, BatchKey, Dataloader, FetchError, Source};
use indexmap::IndexMap;
use parking_lot::Mutex;
use serde::{Serialize, Serializer};
use serde_json::{json, Value};
use std::sync::Arc;
use std::time::Duration;

/// Recipes and ingredients keyed by id, plus a log of every fetch.
#[derive(Debug, Clone)]
pub struct Database {
    records: Arc<IndexMap<String, Value>>,
    log: Arc<Mutex<Vec<(&'static str, Vec<String>)>>>,
}

/// Every handle on the same database shares one batch key.
impl Serialize for Database {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_unit_struct("Database")
    }
}

impl Database {
    pub fn recipes() -> Self {
        let records = [
            json!({"id": "1", "name": "Wheat", "type": "Grain"}),
            json!({"id": "2", "name": "Corn", "type": "Grain"}),
            json!({"id": "3", "name": "Butter", "type": "Dairy"}),
            json!({"id": "4", "name": "Baking Soda", "type": "LeaveningAgent"}),
            json!({"id": "5", "name": "Cornbread", "type": "Recipe", "ingredient_ids": ["1", "2", "3", "4"]}),
            json!({"id": "6", "name": "Grits", "type": "Recipe", "ingredient_ids": ["2", "3", "7"]}),
            json!({"id": "7", "name": "Cheese", "type": "Dairy"}),
        ];
        Self {
            records: Arc::new(
                records
                    .into_iter()
                    .map(|record| (record["id"].as_str().unwrap_or_default().to_string(), record))
                    .collect(),
            ),
            log: Arc::default(),
        }
    }

    pub fn get(&self, id: &str) -> Value {
        self.records.get(id).cloned().unwrap_or(Value::Null)
    }

    pub fn by_column(&self, column: &str, value: &str) -> Vec<Value> {
        self.records
            .values()
            .filter(|record| record[column] == value)
            .cloned()
            .collect()
    }

    pub fn record_fetch(&self, source: &'static str, keys: &[String]) {
        self.log.lock().push((source, keys.to_vec()));
    }

    /// Every fetch so far, as `(source, keys)`.
    pub fn log(&self) -> Vec<(&'static str, Vec<String>)> {
        self.log.lock().clone()
    }

    /// Keys of every fetch so far.
    pub fn fetched(&self) -> Vec<Vec<String>> {
        self.log.lock().iter().map(|(_, keys)| keys.clone()).collect()
    }

    pub fn clear_log(&self) {
        self.log.lock().clear();
    }
}

pub fn keys(ids: &[&str]) -> Vec<String> {
    ids.iter().map(|id| (*id).to_string()).collect()
}

/// Records by id.
pub struct DataObject {
    db: Database,
}

#[async_trait]
impl Source for DataObject {
    type Args = Database;
    type Key = String;
    type Value = Value;

    fn new(db: Database) -> Self {
        Self { db }
    }

    async fn fetch(&self, _loader: &Dataloader, keys: &[String]) -> Result<Vec<Value>, FetchError> {
        self.db.record_fetch("DataObject", keys);
        Ok(keys.iter().map(|key| self.db.get(key)).collect())
    }
}

/// Records by id, loaded through [`DataObject`].
pub struct NestedDataObject {
    db: Database,
}

#[async_trait]
impl Source for NestedDataObject {
    type Args = Database;
    type Key = String;
    type Value = Value;

    fn new(db: Database) -> Self {
        Self { db }
    }

    async fn fetch(&self, loader: &Dataloader, keys: &[String]) -> Result<Vec<Value>, FetchError> {
        self.db.record_fetch("NestedDataObject", keys);
        loader
            .with::<DataObject>(self.db.clone())
            .load_all(keys.to_vec())
            .await
            .map_err(FetchError::new)
    }
}

/// Arguments whose label does not affect which instance is used.
#[derive(Debug, Clone, Serialize)]
pub struct LabeledArgs {
    pub label: String,
    pub db: Database,
}

/// Records by id; instances are shared regardless of label.
pub struct KeyedDataObject {
    db: Database,
    pub label: String,
}

#[async_trait]
impl Source for KeyedDataObject {
    type Args = LabeledArgs;
    type Key = String;
    type Value = Value;

    fn new(args: LabeledArgs) -> Self {
        Self {
            db: args.db,
            label: args.label,
        }
    }

    fn batch_key_for(args: &LabeledArgs) -> BatchKey {
        BatchKey::of(&args.db)
    }

    async fn fetch(&self, _loader: &Dataloader, keys: &[String]) -> Result<Vec<Value>, FetchError> {
        self.db.record_fetch("KeyedDataObject", keys);
        Ok(keys.iter().map(|key| self.db.get(key)).collect())
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct ColumnArgs {
    pub column: String,
    pub db: Database,
}

/// Every record whose `column` equals the key.
pub struct ByColumn {
    db: Database,
    column: String,
}

#[async_trait]
impl Source for ByColumn {
    type Args = ColumnArgs;
    type Key = String;
    type Value = Vec<Value>;

    fn new(args: ColumnArgs) -> Self {
        Self {
            db: args.db,
            column: args.column,
        }
    }

    async fn fetch(&self, _loader: &Dataloader, keys: &[String]) -> Result<Vec<Vec<Value>>, FetchError> {
        self.db.record_fetch("ByColumn", keys);
        Ok(keys
            .iter()
            .map(|key| self.db.by_column(&self.column, key))
            .collect())
    }
}

/// Fails every batch.
pub struct FailingSource {
    db: Database,
}

#[async_trait]
impl Source for FailingSource {
    type Args = Database;
    type Key = String;
    type Value = Value;

    fn new(db: Database) -> Self {
        Self { db }
    }

    async fn fetch(&self, _loader: &Dataloader, keys: &[String]) -> Result<Vec<Value>, FetchError> {
        self.db.record_fetch("FailingSource", keys);
        Err(FetchError::msg("Data not found"))
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct SlowArgs {
    pub name: &'static str,
    pub delay_ms: u64,
    pub db: Database,
}

/// Blocks a worker thread for `delay_ms` before answering.
pub struct SlowSource {
    args: SlowArgs,
}

#[async_trait]
impl Source for SlowSource {
    type Args = SlowArgs;
    type Key = String;
    type Value = Value;

    fn new(args: SlowArgs) -> Self {
        Self { args }
    }

    async fn fetch(&self, _loader: &Dataloader, keys: &[String]) -> Result<Vec<Value>, FetchError> {
        self.args.db.record_fetch(self.args.name, keys);
        let delay = Duration::from_millis(self.args.delay_ms);
        tokio::task::spawn_blocking(move || std::thread::sleep(delay))
            .await
            .map_err(FetchError::new)?;
        Ok(keys.iter().map(|key| self.args.db.get(key)).collect())
    }
}
