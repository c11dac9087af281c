//! In-memory records served through a batch source.
//!
//! Records are JSON objects with an `id`. Every lookup goes through
//! [`RecordSource`], one instance per column, so the fetch log shows exactly
//! which batches the runtime issued.

use batchql_runtime::resolver::{read_property, ResolverFuture};
use batchql_runtime::{
    async_trait, Context, Dataloader, FetchError, FieldValue, Resolver, ResolverArgs,
    ResolverError, ResolverInfo, ResolverResult, Source, SourceHandle,
};
use parking_lot::Mutex;
use serde::Serialize;
use serde_json::Value;
use std::path::Path;
use std::sync::Arc;
use thiserror::Error;
use tracing::debug;

/// Failure to build a [`RecordStore`].
#[derive(Debug, Error)]
pub enum RecordError {
    #[error("failed to read records: {0}")]
    Io(#[from] std::io::Error),

    #[error("invalid records file: {0}")]
    Json(#[from] serde_json::Error),

    #[error("record {index} has no string or numeric `id`")]
    MissingId { index: usize },
}

/// One call to [`RecordSource::fetch`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct FetchBatch {
    pub column: String,
    pub keys: Vec<String>,
}

/// Records plus a log of the batches fetched from them.
#[derive(Debug, Clone, Default)]
pub struct RecordStore {
    records: Arc<Vec<Value>>,
    fetches: Arc<Mutex<Vec<FetchBatch>>>,
}

impl RecordStore {
    /// Creates a store, rejecting anything that is not an object with an `id`.
    pub fn new(records: Vec<Value>) -> Result<Self, RecordError> {
        for (index, record) in records.iter().enumerate() {
            match record.get("id") {
                Some(Value::String(_) | Value::Number(_)) => {}
                _ => return Err(RecordError::MissingId { index }),
            }
        }
        Ok(Self {
            records: Arc::new(records),
            fetches: Arc::default(),
        })
    }

    /// Reads a JSON array of records from a file.
    pub fn load(path: &Path) -> Result<Self, RecordError> {
        let source = std::fs::read_to_string(path)?;
        let records: Vec<Value> = serde_json::from_str(&source)?;
        Self::new(records)
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    /// Batches fetched so far, in order.
    pub fn fetches(&self) -> Vec<FetchBatch> {
        self.fetches.lock().clone()
    }

    /// The record with this id, or every record whose `column` matches.
    ///
    /// `id` lookups yield one record or null; other columns yield a list.
    pub fn lookup(&self, column: &str, key: &str) -> Value {
        let mut matches = self
            .records
            .iter()
            .filter(|record| record.get(column).is_some_and(|v| key_string(v) == key));
        if column == "id" {
            matches.next().cloned().unwrap_or(Value::Null)
        } else {
            Value::Array(matches.cloned().collect())
        }
    }

    fn log_fetch(&self, column: &str, keys: &[String]) {
        self.fetches.lock().push(FetchBatch {
            column: column.to_string(),
            keys: keys.to_vec(),
        });
    }
}

/// Keys are compared as strings, so `1` and `"1"` are the same record.
pub fn key_string(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

/// Constructor arguments for [`RecordSource`].
///
/// Only the column takes part in the batch key.
#[derive(Debug, Clone, Serialize)]
pub struct ColumnArgs {
    pub column: String,
    #[serde(skip)]
    pub store: RecordStore,
}

/// Looks records up by one column.
pub struct RecordSource {
    column: String,
    store: RecordStore,
}

#[async_trait]
impl Source for RecordSource {
    type Args = ColumnArgs;
    type Key = String;
    type Value = Value;

    fn new(args: ColumnArgs) -> Self {
        Self {
            column: args.column,
            store: args.store,
        }
    }

    async fn fetch(&self, _loader: &Dataloader, keys: &[String]) -> Result<Vec<Value>, FetchError> {
        debug!(column = %self.column, keys = keys.len(), "fetching records");
        self.store.log_fetch(&self.column, keys);
        Ok(keys
            .iter()
            .map(|key| self.store.lookup(&self.column, key))
            .collect())
    }
}

/// Resolves every field of a record query.
///
/// Root fields take one argument: `id` loads a record, `ids` loads several,
/// and any other argument loads by that column. A nested field `x` follows
/// `x_id` or `x_ids` when the parent has them and reads the property
/// otherwise.
pub struct RecordResolver {
    store: RecordStore,
    root_type: String,
}

impl RecordResolver {
    pub fn new(store: RecordStore) -> Self {
        Self {
            store,
            root_type: "Query".to_string(),
        }
    }

    /// Handles root fields of `root_type` instead of `Query`.
    pub fn with_root_type(mut self, root_type: impl Into<String>) -> Self {
        self.root_type = root_type.into();
        self
    }

    fn records(&self, ctx: &Context, column: &str) -> SourceHandle<RecordSource> {
        ctx.dataloader().with::<RecordSource>(ColumnArgs {
            column: column.to_string(),
            store: self.store.clone(),
        })
    }

    fn resolve_root(&self, args: &ResolverArgs, ctx: &Context, info: &ResolverInfo) -> ResolverResult {
        let mut pairs = args.all().iter();
        let (Some((column, value)), None) = (pairs.next(), pairs.next()) else {
            return Err(ResolverError::Custom(format!(
                "Field '{}' takes exactly one argument",
                info.field_name
            )));
        };

        if column == "ids" {
            let keys = value.as_array().ok_or_else(|| {
                ResolverError::ArgumentParseError("ids".to_string(), "expected a list".to_string())
            })?;
            return Ok(self.load_many(ctx, keys));
        }
        let request = self.records(ctx, column).request(key_string(value));
        Ok(FieldValue::from_request(request))
    }

    fn resolve_nested(&self, parent: &Value, ctx: &Context, info: &ResolverInfo) -> ResolverResult {
        let name = &info.field_name;
        if let Some(id) = parent.get(format!("{name}_id")) {
            if id.is_null() {
                return Ok(FieldValue::Ready(Value::Null));
            }
            let request = self.records(ctx, "id").request(key_string(id));
            return Ok(FieldValue::from_request(request));
        }
        if let Some(ids) = parent.get(format!("{name}_ids")).and_then(Value::as_array) {
            return Ok(self.load_many(ctx, ids));
        }
        read_property(parent, name).map(FieldValue::Ready)
    }

    fn load_many(&self, ctx: &Context, ids: &[Value]) -> FieldValue {
        let requests = self
            .records(ctx, "id")
            .request_all(ids.iter().map(key_string));
        FieldValue::lazy(async move { Ok(Value::Array(requests.load().await?)) })
    }
}

impl Resolver for RecordResolver {
    fn resolve<'a>(
        &'a self,
        parent: &'a Value,
        args: &'a ResolverArgs,
        ctx: &'a Context,
        info: &'a ResolverInfo,
    ) -> ResolverFuture<'a> {
        let result = if info.parent_type == self.root_type {
            self.resolve_root(args, ctx, info)
        } else {
            self.resolve_nested(parent, ctx, info)
        };
        Box::pin(async move { result })
    }
}
