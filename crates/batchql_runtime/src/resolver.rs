//! Resolver system for batchql.
//!
//! Resolvers produce a [`FieldValue`] for one field. A value is either
//! ready, or lazy: a future the executor parks during the first pass and
//! forces while settling, so its load joins whatever batch is pending then.

use crate::error::LoadError;
use crate::executor::{Context, FieldError, PathSegment};
use crate::request::PendingRequest;
use crate::source::Source;
use futures::future::BoxFuture;
use rustc_hash::FxHashMap;
use serde::Serialize;
use serde_json::Value;
use std::collections::HashMap;
use std::fmt;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use thiserror::Error;

/// Arguments passed to a resolver.
#[derive(Debug, Clone, Default)]
pub struct ResolverArgs {
    args: HashMap<String, Value>,
}

impl ResolverArgs {
    /// Creates new resolver args.
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates resolver args from a list of (name, value) pairs.
    pub fn from_pairs(pairs: Vec<(String, Value)>) -> Self {
        Self {
            args: pairs.into_iter().collect(),
        }
    }

    /// Gets an argument by name.
    pub fn get(&self, name: &str) -> Option<&Value> {
        self.args.get(name)
    }

    /// Gets an argument as a specific type.
    pub fn get_as<T: serde::de::DeserializeOwned>(&self, name: &str) -> Option<T> {
        self.args
            .get(name)
            .and_then(|v| serde_json::from_value(v.clone()).ok())
    }

    /// Gets a required argument, returning an error if not found.
    pub fn require<T: serde::de::DeserializeOwned>(&self, name: &str) -> Result<T, ResolverError> {
        self.args
            .get(name)
            .ok_or_else(|| ResolverError::MissingArgument(name.to_string()))
            .and_then(|v| {
                serde_json::from_value(v.clone())
                    .map_err(|e| ResolverError::ArgumentParseError(name.to_string(), e.to_string()))
            })
    }

    /// Returns all arguments.
    pub fn all(&self) -> &HashMap<String, Value> {
        &self.args
    }

    /// Returns true if empty.
    pub fn is_empty(&self) -> bool {
        self.args.is_empty()
    }

    /// Sets an argument.
    pub fn set(&mut self, name: impl Into<String>, value: Value) {
        self.args.insert(name.into(), value);
    }
}

/// Info about the field being resolved.
#[derive(Debug, Clone)]
pub struct ResolverInfo {
    /// The field name being resolved.
    pub field_name: String,

    /// The return type name.
    pub return_type: String,

    /// The parent type name.
    pub parent_type: String,

    /// Path to this field.
    pub path: Vec<PathSegment>,

    /// Selected sub-fields (for object types).
    pub selected_fields: Vec<String>,
}

impl ResolverInfo {
    /// Creates new resolver info.
    pub fn new(field_name: impl Into<String>, parent_type: impl Into<String>) -> Self {
        Self {
            field_name: field_name.into(),
            return_type: String::new(),
            parent_type: parent_type.into(),
            path: Vec::new(),
            selected_fields: Vec::new(),
        }
    }

    /// Sets the return type.
    pub fn with_return_type(mut self, ty: impl Into<String>) -> Self {
        self.return_type = ty.into();
        self
    }

    /// Sets the path.
    pub fn with_path(mut self, path: Vec<PathSegment>) -> Self {
        self.path = path;
        self
    }

    /// Sets the selected fields.
    pub fn with_selected_fields(mut self, fields: Vec<String>) -> Self {
        self.selected_fields = fields;
        self
    }
}

/// A deferred field value.
pub type LazyValue = BoxFuture<'static, Result<Value, ResolverError>>;

/// What a resolver produced.
pub enum FieldValue {
    /// A value available now.
    Ready(Value),
    /// A value forced later, while settling.
    Lazy(LazyValue),
}

impl FieldValue {
    /// Wraps a future as a lazy value.
    pub fn lazy<F>(future: F) -> Self
    where
        F: Future<Output = Result<Value, ResolverError>> + Send + 'static,
    {
        Self::Lazy(Box::pin(future))
    }

    /// A lazy value backed by a request that has not been loaded.
    ///
    /// The key is already pending, so it rides along with the next flush
    /// of its source even though nothing waits on it yet.
    pub fn from_request<S>(request: PendingRequest<S>) -> Self
    where
        S: Source,
        S::Value: Serialize,
    {
        Self::lazy(async move {
            let value = request.load().await?;
            serde_json::to_value(value).map_err(|e| ResolverError::Custom(e.to_string()))
        })
    }

    /// Returns true for lazy values.
    pub fn is_lazy(&self) -> bool {
        matches!(self, Self::Lazy(_))
    }
}

impl From<Value> for FieldValue {
    fn from(value: Value) -> Self {
        Self::Ready(value)
    }
}

impl fmt::Debug for FieldValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Ready(value) => f.debug_tuple("Ready").field(value).finish(),
            Self::Lazy(_) => f.write_str("Lazy(..)"),
        }
    }
}

/// Result type for resolvers.
pub type ResolverResult = Result<FieldValue, ResolverError>;

/// Future type for async resolvers.
pub type ResolverFuture<'a> = Pin<Box<dyn Future<Output = ResolverResult> + Send + 'a>>;

/// Error from a resolver.
///
/// Every variant except `Internal` becomes an error on the field and leaves
/// the rest of the query running. `Internal` aborts the whole multiplex.
#[derive(Debug, Clone, Error)]
pub enum ResolverError {
    /// Field not found.
    #[error("Field not found: {0}")]
    FieldNotFound(String),

    /// Missing required argument.
    #[error("Missing required argument: {0}")]
    MissingArgument(String),

    /// Argument parse error.
    #[error("Failed to parse argument '{0}': {1}")]
    ArgumentParseError(String, String),

    /// Null value for non-nullable field.
    #[error("Null value for non-nullable field: {0}")]
    NullValue(String),

    /// Custom error.
    #[error("{0}")]
    Custom(String),

    /// A load the resolver depended on failed.
    #[error(transparent)]
    Load(#[from] LoadError),

    /// Internal error.
    #[error("Internal error: {0}")]
    Internal(String),
}

impl ResolverError {
    /// Returns true for errors that escape the query.
    pub fn is_internal(&self) -> bool {
        matches!(self, Self::Internal(_))
    }
}

impl From<ResolverError> for FieldError {
    fn from(error: ResolverError) -> Self {
        FieldError::new(error.to_string())
    }
}

/// Trait for field resolvers.
pub trait Resolver: Send + Sync {
    /// Resolves a field value.
    fn resolve<'a>(
        &'a self,
        parent: &'a Value,
        args: &'a ResolverArgs,
        ctx: &'a Context,
        info: &'a ResolverInfo,
    ) -> ResolverFuture<'a>;
}

/// A boxed resolver.
pub type BoxedResolver = Box<dyn Resolver>;

/// A sync resolver function.
pub type SyncResolverFn =
    Arc<dyn Fn(&Value, &ResolverArgs, &Context, &ResolverInfo) -> ResolverResult + Send + Sync>;

/// A wrapper for sync resolver functions.
pub struct FnResolver {
    func: SyncResolverFn,
}

impl FnResolver {
    /// Creates a new function resolver.
    pub fn new<F>(f: F) -> Self
    where
        F: Fn(&Value, &ResolverArgs, &Context, &ResolverInfo) -> ResolverResult
            + Send
            + Sync
            + 'static,
    {
        Self { func: Arc::new(f) }
    }
}

impl Resolver for FnResolver {
    fn resolve<'a>(
        &'a self,
        parent: &'a Value,
        args: &'a ResolverArgs,
        ctx: &'a Context,
        info: &'a ResolverInfo,
    ) -> ResolverFuture<'a> {
        let result = (self.func)(parent, args, ctx, info);
        Box::pin(async move { result })
    }
}

/// An async resolver function type.
pub type AsyncResolverFn = Arc<
    dyn Fn(Value, ResolverArgs, Context, ResolverInfo) -> ResolverFuture<'static> + Send + Sync,
>;

/// A wrapper for async resolver functions.
///
/// The function receives owned copies of its inputs, so it can hold them
/// across loads.
pub struct AsyncFnResolver {
    func: AsyncResolverFn,
}

impl AsyncFnResolver {
    /// Creates a new async function resolver.
    pub fn new<F, Fut>(f: F) -> Self
    where
        F: Fn(Value, ResolverArgs, Context, ResolverInfo) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = ResolverResult> + Send + 'static,
    {
        Self {
            func: Arc::new(move |parent, args, ctx, info| Box::pin(f(parent, args, ctx, info))),
        }
    }
}

impl Resolver for AsyncFnResolver {
    fn resolve<'a>(
        &'a self,
        parent: &'a Value,
        args: &'a ResolverArgs,
        ctx: &'a Context,
        info: &'a ResolverInfo,
    ) -> ResolverFuture<'a> {
        (self.func)(parent.clone(), args.clone(), ctx.clone(), info.clone())
    }
}

/// Default resolver that reads properties from the parent object.
pub struct DefaultResolver;

impl Resolver for DefaultResolver {
    fn resolve<'a>(
        &'a self,
        parent: &'a Value,
        _args: &'a ResolverArgs,
        _ctx: &'a Context,
        info: &'a ResolverInfo,
    ) -> ResolverFuture<'a> {
        let result = read_property(parent, &info.field_name).map(FieldValue::Ready);
        Box::pin(async move { result })
    }
}

/// Reads `field_name` (or its snake_case form) from an object.
pub fn read_property(parent: &Value, field_name: &str) -> Result<Value, ResolverError> {
    match parent {
        Value::Object(map) => Ok(map
            .get(field_name)
            .or_else(|| map.get(&to_snake_case(field_name)))
            .cloned()
            .unwrap_or(Value::Null)),
        Value::Null => Ok(Value::Null),
        _ => Err(ResolverError::FieldNotFound(field_name.to_string())),
    }
}

/// Converts camelCase to snake_case.
fn to_snake_case(s: &str) -> String {
    let mut result = String::with_capacity(s.len() + 4);
    for (i, c) in s.chars().enumerate() {
        if c.is_uppercase() {
            if i > 0 {
                result.push('_');
            }
            result.extend(c.to_lowercase());
        } else {
            result.push(c);
        }
    }
    result
}

/// Storage for resolvers organized by type and field.
pub struct ResolverMap {
    /// Resolvers indexed by "TypeName.fieldName".
    resolvers: FxHashMap<String, BoxedResolver>,

    /// Fallback for unregistered fields.
    default_resolver: Option<BoxedResolver>,
}

impl Default for ResolverMap {
    fn default() -> Self {
        Self::new()
    }
}

impl ResolverMap {
    /// Creates a resolver map that falls back to [`DefaultResolver`].
    pub fn new() -> Self {
        Self {
            resolvers: FxHashMap::default(),
            default_resolver: Some(Box::new(DefaultResolver)),
        }
    }

    /// Registers a resolver for a specific type and field.
    pub fn register<R: Resolver + 'static>(
        &mut self,
        type_name: impl Into<String>,
        field_name: impl Into<String>,
        resolver: R,
    ) {
        let key = format!("{}.{}", type_name.into(), field_name.into());
        self.resolvers.insert(key, Box::new(resolver));
    }

    /// Registers a sync function as a resolver.
    pub fn register_fn<F>(
        &mut self,
        type_name: impl Into<String>,
        field_name: impl Into<String>,
        f: F,
    ) where
        F: Fn(&Value, &ResolverArgs, &Context, &ResolverInfo) -> ResolverResult
            + Send
            + Sync
            + 'static,
    {
        self.register(type_name, field_name, FnResolver::new(f));
    }

    /// Registers an async function as a resolver.
    pub fn register_async<F, Fut>(
        &mut self,
        type_name: impl Into<String>,
        field_name: impl Into<String>,
        f: F,
    ) where
        F: Fn(Value, ResolverArgs, Context, ResolverInfo) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = ResolverResult> + Send + 'static,
    {
        self.register(type_name, field_name, AsyncFnResolver::new(f));
    }

    /// Gets a resolver for a type and field.
    pub fn get(&self, type_name: &str, field_name: &str) -> Option<&dyn Resolver> {
        let key = format!("{type_name}.{field_name}");
        self.resolvers
            .get(&key)
            .map(|r| r.as_ref())
            .or(self.default_resolver.as_ref().map(|r| r.as_ref()))
    }

    /// Sets the default resolver.
    pub fn set_default<R: Resolver + 'static>(&mut self, resolver: R) {
        self.default_resolver = Some(Box::new(resolver));
    }

    /// Removes the default resolver.
    pub fn remove_default(&mut self) {
        self.default_resolver = None;
    }

    /// Number of registered resolvers.
    pub fn len(&self) -> usize {
        self.resolvers.len()
    }

    /// Returns true if no resolvers are registered.
    pub fn is_empty(&self) -> bool {
        self.resolvers.is_empty()
    }
}

impl fmt::Debug for ResolverMap {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ResolverMap")
            .field("resolver_count", &self.resolvers.len())
            .field("has_default", &self.default_resolver.is_some())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::FetchError;

    async fn ready(result: ResolverResult) -> Value {
        match result.unwrap() {
            FieldValue::Ready(value) => value,
            FieldValue::Lazy(lazy) => lazy.await.unwrap(),
        }
    }

    #[test]
    fn test_resolver_args() {
        let mut args = ResolverArgs::new();
        args.set("id", serde_json::json!(123));
        args.set("name", serde_json::json!("test"));

        assert_eq!(args.get_as::<i64>("id"), Some(123));
        assert_eq!(args.get_as::<String>("name"), Some("test".to_string()));
        assert_eq!(args.get_as::<i64>("missing"), None);
        assert!(matches!(
            args.require::<i64>("name"),
            Err(ResolverError::ArgumentParseError(..))
        ));
    }

    #[test]
    fn test_to_snake_case() {
        assert_eq!(to_snake_case("ingredientIds"), "ingredient_ids");
        assert_eq!(to_snake_case("id"), "id");
    }

    #[test]
    fn test_load_error_becomes_field_error() {
        let err = ResolverError::from(LoadError::Fetch {
            source_name: "ErrorSource",
            error: FetchError::msg("Nope"),
        });
        assert!(!err.is_internal());
        assert_eq!(FieldError::from(err).message, "Nope");
        assert!(ResolverError::Internal("boom".into()).is_internal());
    }

    #[tokio::test]
    async fn test_default_resolver() {
        let resolver = DefaultResolver;
        let parent = serde_json::json!({"name": "Wheat", "ingredient_ids": ["1"]});
        let args = ResolverArgs::new();
        let ctx = Context::new();

        let info = ResolverInfo::new("name", "Ingredient");
        let result = resolver.resolve(&parent, &args, &ctx, &info).await;
        assert_eq!(ready(result).await, serde_json::json!("Wheat"));

        let info = ResolverInfo::new("ingredientIds", "Recipe");
        let result = resolver.resolve(&parent, &args, &ctx, &info).await;
        assert_eq!(ready(result).await, serde_json::json!(["1"]));
    }

    #[tokio::test]
    async fn test_fn_resolver() {
        let resolver = FnResolver::new(|_parent, args, _ctx, _info| {
            let id: i64 = args.require("id")?;
            Ok(serde_json::json!({"id": id}).into())
        });

        let parent = serde_json::json!({});
        let mut args = ResolverArgs::new();
        args.set("id", serde_json::json!(42));
        let ctx = Context::new();
        let info = ResolverInfo::new("recipe", "Query");

        let result = resolver.resolve(&parent, &args, &ctx, &info).await;
        assert_eq!(ready(result).await, serde_json::json!({"id": 42}));
    }

    #[tokio::test]
    async fn test_async_resolver_returns_lazy() {
        let resolver = AsyncFnResolver::new(|_parent, _args, _ctx, _info| async {
            Ok(FieldValue::lazy(async { Ok(serde_json::json!("later")) }))
        });

        let parent = serde_json::json!({});
        let args = ResolverArgs::new();
        let ctx = Context::new();
        let info = ResolverInfo::new("later", "Query");

        let result = resolver.resolve(&parent, &args, &ctx, &info).await;
        assert!(result.as_ref().is_ok_and(FieldValue::is_lazy));
        assert_eq!(ready(result).await, serde_json::json!("later"));
    }

    #[tokio::test]
    async fn test_resolver_map_default_fallback() {
        let mut map = ResolverMap::new();
        map.register_fn("Query", "hello", |_parent, _args, _ctx, _info| {
            Ok(serde_json::json!("Hello, World!").into())
        });
        assert_eq!(map.len(), 1);

        let parent = serde_json::json!({"name": "Bob"});
        let args = ResolverArgs::new();
        let ctx = Context::new();

        let info = ResolverInfo::new("hello", "Query");
        let resolver = map.get("Query", "hello").unwrap();
        let result = resolver.resolve(&parent, &args, &ctx, &info).await;
        assert_eq!(ready(result).await, serde_json::json!("Hello, World!"));

        let info = ResolverInfo::new("name", "User");
        let resolver = map.get("User", "name").unwrap();
        let result = resolver.resolve(&parent, &args, &ctx, &info).await;
        assert_eq!(ready(result).await, serde_json::json!("Bob"));

        map.remove_default();
        assert!(map.get("User", "name").is_none());
    }
}
