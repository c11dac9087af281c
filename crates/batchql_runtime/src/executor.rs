//! Query execution for batchql.
//!
//! Every top-level field of an operation runs as its own dataloader job, so
//! sibling fields, and sibling queries in a multiplex, coalesce their loads
//! into shared batches. Nested selections resolve with `join_all` inside
//! their parent's job for the same reason.
//!
//! Lazy field values are parked during this first pass and forced by
//! [`Executor::sync_lazies`] once the first run has drained.

use crate::dataloader::Dataloader;
use crate::error::JobError;
use crate::query::{FieldInfo, OperationKind, PlanNode, QueryPlan};
use crate::resolver::{FieldValue, LazyValue, ResolverArgs, ResolverError, ResolverInfo};
use crate::scheduler::JobResult;
use crate::schema::Schema;
use futures::future::{join_all, BoxFuture};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tracing::{debug, debug_span, trace, trace_span, Instrument, Span};

/// Executor configuration.
#[derive(Debug, Clone, Default)]
pub struct ExecutorConfig {
    /// Run each field resolver inside a `resolve_field` trace span.
    pub tracing: bool,
    /// Fields nested deeper than this report an error instead of resolving.
    pub max_depth: Option<usize>,
}

impl ExecutorConfig {
    /// Enables per-field tracing.
    pub fn with_tracing(mut self, tracing: bool) -> Self {
        self.tracing = tracing;
        self
    }

    /// Sets the maximum field depth.
    pub fn with_max_depth(mut self, depth: usize) -> Self {
        self.max_depth = Some(depth);
        self
    }
}

/// The query executor.
#[derive(Clone)]
pub struct Executor {
    schema: Schema,
}

impl fmt::Debug for Executor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Executor")
            .field("config", self.config())
            .finish()
    }
}

/// A parked lazy value and where its result goes.
struct Lazy {
    value: LazyValue,
    info: ResolverInfo,
    children: Option<PlanNode>,
    path: Vec<PathSegment>,
}

/// Execution state of one query.
pub struct QueryRuntime {
    plan: QueryPlan,
    ctx: Context,
    data: Mutex<Map<String, Value>>,
    lazies: Mutex<Vec<Lazy>>,
    settling: AtomicBool,
}

impl fmt::Debug for QueryRuntime {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("QueryRuntime")
            .field("operation", &self.plan.operation_name)
            .field("lazies", &self.pending_lazies())
            .field("settling", &self.is_settling())
            .finish()
    }
}

impl QueryRuntime {
    fn new(plan: QueryPlan, ctx: Context) -> Self {
        let data = plan
            .root
            .response_keys()
            .into_iter()
            .map(|key| (key, Value::Null))
            .collect();
        Self {
            plan,
            ctx,
            data: Mutex::new(data),
            lazies: Mutex::new(Vec::new()),
            settling: AtomicBool::new(false),
        }
    }

    /// The plan being executed.
    pub fn plan(&self) -> &QueryPlan {
        &self.plan
    }

    /// The query's context.
    pub fn context(&self) -> &Context {
        &self.ctx
    }

    /// Number of lazy values waiting to be forced.
    pub fn pending_lazies(&self) -> usize {
        self.lazies.lock().len()
    }

    /// Returns true once lazies are forced where they are found.
    pub fn is_settling(&self) -> bool {
        self.settling.load(Ordering::Acquire)
    }

    /// Materializes the current result.
    pub fn response(&self) -> Response {
        let errors = self.ctx.errors();
        let extensions = self.ctx.extensions();
        Response {
            data: Some(Value::Object(self.data.lock().clone())),
            errors: (!errors.is_empty()).then_some(errors),
            extensions: (!extensions.is_empty()).then_some(extensions),
        }
    }

    fn merge_root(&self, value: Value) {
        if let Value::Object(map) = value {
            let mut data = self.data.lock();
            for (key, value) in map {
                data.insert(key, value);
            }
        }
    }

    fn defer(&self, lazy: Lazy) {
        self.lazies.lock().push(lazy);
    }

    fn write_at(&self, path: &[PathSegment], value: Value) {
        let mut data = self.data.lock();
        match slot_at(&mut data, path) {
            Some(slot) => *slot = value,
            None => trace!(?path, "lazy result has no place in the response"),
        }
    }
}

fn slot_at<'v>(root: &'v mut Map<String, Value>, path: &[PathSegment]) -> Option<&'v mut Value> {
    let (PathSegment::Field(first), rest) = path.split_first()? else {
        return None;
    };
    let mut current = root.get_mut(first)?;
    for segment in rest {
        current = match segment {
            PathSegment::Field(key) => current.get_mut(key.as_str())?,
            PathSegment::Index(index) => current.get_mut(*index)?,
        };
    }
    Some(current)
}

fn merge(into: &mut Map<String, Value>, value: Value) {
    if let Value::Object(map) = value {
        into.extend(map);
    }
}

impl Executor {
    /// Creates an executor for a schema.
    pub fn new(schema: Schema) -> Self {
        Self { schema }
    }

    /// The executor configuration.
    pub fn config(&self) -> &ExecutorConfig {
        self.schema.executor_config()
    }

    /// Starts a query: appends one job per top-level field to the context's
    /// dataloader. Nothing runs until the dataloader does.
    ///
    /// Mutations append a single job so their fields run in order. Fails
    /// when the schema has no root type for the operation kind.
    pub fn evaluate(&self, plan: &QueryPlan, ctx: Context) -> Result<Arc<QueryRuntime>, FieldError> {
        let Some(root_type) = self.schema.root_type(plan.operation_kind) else {
            return Err(FieldError::new(format!(
                "Schema is not configured for {}s",
                plan.operation_kind
            )));
        };
        let _span = debug_span!(
            "evaluate_query",
            operation = plan.operation_name.as_deref().unwrap_or("anonymous"),
            root = root_type
        )
        .entered();

        let loader = ctx.dataloader().clone();
        let runtime = Arc::new(QueryRuntime::new(plan.clone(), ctx));
        let roots = match (&plan.operation_kind, &plan.root) {
            (OperationKind::Mutation, root) => vec![root.clone()],
            (_, PlanNode::Parallel(nodes)) => nodes.clone(),
            (_, root) => vec![root.clone()],
        };

        debug!(jobs = roots.len(), complexity = plan.complexity, "scheduling query");
        for node in roots {
            let executor = self.clone();
            let runtime = Arc::clone(&runtime);
            loader.append_job(async move {
                let value = executor
                    .execute_node(&node, Value::Object(Map::new()), Vec::new(), &runtime)
                    .await?;
                runtime.merge_root(value);
                Ok(())
            });
        }
        Ok(runtime)
    }

    /// Forces every parked lazy value, breadth-first across queries.
    ///
    /// Appends one job per lazy and switches each query to settling, so
    /// lazies found while forcing are awaited in place. Calling it again
    /// once nothing is parked does nothing. Returns the number of jobs
    /// appended.
    pub fn sync_lazies(&self, runtimes: &[Arc<QueryRuntime>]) -> usize {
        let mut queues: Vec<_> = runtimes
            .iter()
            .map(|runtime| {
                runtime.settling.store(true, Ordering::Release);
                let lazies = std::mem::take(&mut *runtime.lazies.lock());
                (Arc::clone(runtime), lazies.into_iter())
            })
            .collect();

        let mut appended = 0;
        loop {
            let mut progressed = false;
            for (runtime, lazies) in &mut queues {
                let Some(lazy) = lazies.next() else {
                    continue;
                };
                progressed = true;
                appended += 1;

                let executor = self.clone();
                let runtime = Arc::clone(runtime);
                let loader = runtime.ctx.dataloader().clone();
                loader.append_job(async move { executor.force_lazy(lazy, &runtime).await });
            }
            if !progressed {
                break;
            }
        }

        if appended > 0 {
            debug!(lazies = appended, queries = runtimes.len(), "settling lazy values");
        }
        appended
    }

    async fn force_lazy(&self, lazy: Lazy, runtime: &Arc<QueryRuntime>) -> JobResult {
        let Lazy {
            value,
            info,
            children,
            path,
        } = lazy;
        let outcome = value.await;
        let value = self
            .complete(outcome, &info, children.as_ref(), path.clone(), runtime)
            .await?;
        runtime.write_at(&path, value);
        Ok(())
    }

    /// Executes a plan node, returning the object fragment it contributes.
    fn execute_node<'a>(
        &'a self,
        node: &'a PlanNode,
        parent: Value,
        path: Vec<PathSegment>,
        runtime: &'a Arc<QueryRuntime>,
    ) -> BoxFuture<'a, Result<Value, JobError>> {
        Box::pin(async move {
            match node {
                PlanNode::Sequence(nodes) => {
                    let mut result = Map::new();
                    for node in nodes {
                        let value = self
                            .execute_node(node, parent.clone(), path.clone(), runtime)
                            .await?;
                        merge(&mut result, value);
                    }
                    Ok(Value::Object(result))
                }
                PlanNode::Parallel(nodes) => {
                    let values = join_all(
                        nodes
                            .iter()
                            .map(|node| self.execute_node(node, parent.clone(), path.clone(), runtime)),
                    )
                    .await;
                    let mut result = Map::new();
                    for value in values {
                        merge(&mut result, value?);
                    }
                    Ok(Value::Object(result))
                }
                PlanNode::Field { info, children } => {
                    self.execute_field(info, Some(children.as_ref()), &parent, path, runtime)
                        .await
                }
                PlanNode::Leaf { field } => {
                    self.execute_field(field, None, &parent, path, runtime).await
                }
                PlanNode::TypeCondition { type_name, node } => {
                    match parent.get("__typename").and_then(Value::as_str) {
                        Some(typename) if typename != type_name => Ok(Value::Object(Map::new())),
                        // Without __typename the condition is assumed to match.
                        _ => self.execute_node(node, parent, path, runtime).await,
                    }
                }
                PlanNode::Conditional { condition, node } => {
                    if *condition {
                        self.execute_node(node, parent, path, runtime).await
                    } else {
                        Ok(Value::Object(Map::new()))
                    }
                }
            }
        })
    }

    /// Executes a field, returning `{response_key: value}`.
    async fn execute_field(
        &self,
        info: &FieldInfo,
        children: Option<&PlanNode>,
        parent: &Value,
        mut path: Vec<PathSegment>,
        runtime: &Arc<QueryRuntime>,
    ) -> Result<Value, JobError> {
        let key = info.response_key().to_string();
        path.push(PathSegment::Field(key.clone()));
        let value = self.resolve_field(info, children, parent, path, runtime).await?;

        let mut obj = Map::new();
        obj.insert(key, value);
        Ok(Value::Object(obj))
    }

    /// Resolves a single field and completes its selections.
    async fn resolve_field(
        &self,
        info: &FieldInfo,
        children: Option<&PlanNode>,
        parent: &Value,
        path: Vec<PathSegment>,
        runtime: &Arc<QueryRuntime>,
    ) -> Result<Value, JobError> {
        if info.is_introspection && info.name == "__typename" {
            return Ok(Value::String(info.parent_type.clone()));
        }

        let config = self.config();
        if let Some(max) = config.max_depth {
            let depth = path
                .iter()
                .filter(|segment| matches!(segment, PathSegment::Field(_)))
                .count();
            if depth > max {
                runtime.ctx.add_error(
                    FieldError::new(format!("Field '{}' exceeds max depth of {max}", info.name))
                        .with_path(path),
                );
                return Ok(Value::Null);
            }
        }
        let span = if config.tracing {
            trace_span!("resolve_field", parent = %info.parent_type, field = %info.name)
        } else {
            Span::none()
        };

        let args = ResolverArgs::from_pairs(info.arguments.clone());
        let resolver_info = ResolverInfo::new(&info.name, &info.parent_type)
            .with_return_type(&info.return_type)
            .with_path(path.clone())
            .with_selected_fields(children.map(PlanNode::selected_fields).unwrap_or_default());

        let resolved = match self.schema.resolvers().get(&info.parent_type, &info.name) {
            Some(resolver) => {
                resolver
                    .resolve(parent, &args, &runtime.ctx, &resolver_info)
                    .instrument(span)
                    .await
            }
            None => Ok(FieldValue::Ready(
                parent.get(&info.name).cloned().unwrap_or(Value::Null),
            )),
        };

        let outcome = match resolved {
            Ok(FieldValue::Ready(value)) => Ok(value),
            Ok(FieldValue::Lazy(lazy)) if runtime.is_settling() => lazy.await,
            Ok(FieldValue::Lazy(lazy)) => {
                runtime.defer(Lazy {
                    value: lazy,
                    info: resolver_info,
                    children: children.cloned(),
                    path,
                });
                return Ok(Value::Null);
            }
            Err(err) => Err(err),
        };
        self.complete(outcome, &resolver_info, children, path, runtime)
            .await
    }

    /// Applies error handling to a resolved value, then resolves its selections.
    async fn complete(
        &self,
        outcome: Result<Value, ResolverError>,
        info: &ResolverInfo,
        children: Option<&PlanNode>,
        path: Vec<PathSegment>,
        runtime: &Arc<QueryRuntime>,
    ) -> Result<Value, JobError> {
        let value = match outcome {
            Ok(value) => value,
            Err(err) => match self.handle_error(err, info, &runtime.ctx)? {
                Some(value) => value,
                None => return Ok(Value::Null),
            },
        };
        match children {
            Some(children) => self.complete_children(value, children, path, runtime).await,
            None => Ok(value),
        }
    }

    /// Routes a resolver error through the schema's error handler.
    ///
    /// Returns the recovered value, or `None` after recording a field error.
    fn handle_error(
        &self,
        err: ResolverError,
        info: &ResolverInfo,
        ctx: &Context,
    ) -> Result<Option<Value>, JobError> {
        let err = match self.schema.error_handler() {
            Some(handler) => match handler(err, info, ctx) {
                Ok(value) => return Ok(Some(value)),
                Err(err) => err,
            },
            None => err,
        };
        if err.is_internal() {
            return Err(JobError::application(err));
        }

        ctx.add_error(FieldError::from(err).with_path(info.path.clone()));
        Ok(None)
    }

    /// Resolves selections against an object, or each item of a list.
    fn complete_children<'a>(
        &'a self,
        value: Value,
        children: &'a PlanNode,
        path: Vec<PathSegment>,
        runtime: &'a Arc<QueryRuntime>,
    ) -> BoxFuture<'a, Result<Value, JobError>> {
        Box::pin(async move {
            match value {
                Value::Array(items) => {
                    let items = items.into_iter().enumerate().map(|(index, item)| {
                        let mut item_path = path.clone();
                        item_path.push(PathSegment::Index(index));
                        self.complete_children(item, children, item_path, runtime)
                    });
                    let values = join_all(items)
                        .await
                        .into_iter()
                        .collect::<Result<Vec<_>, _>>()?;
                    Ok(Value::Array(values))
                }
                Value::Null => Ok(Value::Null),
                other => self.execute_node(children, other, path, runtime).await,
            }
        })
    }
}

/// Execution context.
///
/// Cloning shares the dataloader and the error and extension lists.
#[derive(Debug, Clone)]
pub struct Context {
    /// Request-scoped data.
    pub data: HashMap<String, Value>,
    /// Variables from the request.
    pub variables: HashMap<String, Value>,
    loader: Dataloader,
    errors: Arc<Mutex<Vec<FieldError>>>,
    extensions: Arc<Mutex<Map<String, Value>>>,
}

impl Default for Context {
    fn default() -> Self {
        Self::new()
    }
}

impl Context {
    /// Creates a new context with its own dataloader.
    pub fn new() -> Self {
        Self::with_dataloader(Dataloader::new())
    }

    /// Creates a context around an existing dataloader.
    pub fn with_dataloader(loader: Dataloader) -> Self {
        Self {
            data: HashMap::new(),
            variables: HashMap::new(),
            loader,
            errors: Arc::default(),
            extensions: Arc::default(),
        }
    }

    /// Creates a context with variables.
    pub fn with_variables(variables: HashMap<String, Value>) -> Self {
        Self {
            variables,
            ..Self::new()
        }
    }

    /// A copy for one query: shares `loader`, with fresh error and
    /// extension lists.
    pub(crate) fn for_query(&self, loader: &Dataloader) -> Self {
        Self {
            data: self.data.clone(),
            variables: self.variables.clone(),
            loader: loader.clone(),
            errors: Arc::default(),
            extensions: Arc::default(),
        }
    }

    /// The dataloader shared by every query in the multiplex.
    pub fn dataloader(&self) -> &Dataloader {
        &self.loader
    }

    /// Sets a value in the context.
    pub fn set<T: Serialize>(&mut self, key: impl Into<String>, value: T) {
        if let Ok(v) = serde_json::to_value(value) {
            self.data.insert(key.into(), v);
        }
    }

    /// Gets a value from the context.
    pub fn get<T: for<'de> Deserialize<'de>>(&self, key: &str) -> Option<T> {
        self.data
            .get(key)
            .and_then(|v| serde_json::from_value(v.clone()).ok())
    }

    /// Gets a variable by name.
    pub fn variable(&self, name: &str) -> Option<&Value> {
        self.variables.get(name)
    }

    /// Gets a variable as a specific type.
    pub fn variable_as<T: for<'de> Deserialize<'de>>(&self, name: &str) -> Option<T> {
        self.variables
            .get(name)
            .and_then(|v| serde_json::from_value(v.clone()).ok())
    }

    /// Records an error on the query.
    pub fn add_error(&self, error: FieldError) {
        self.errors.lock().push(error);
    }

    /// Errors recorded so far.
    pub fn errors(&self) -> Vec<FieldError> {
        self.errors.lock().clone()
    }

    /// Adds an entry to the response's `extensions`.
    pub fn add_extension(&self, key: impl Into<String>, value: Value) {
        self.extensions.lock().insert(key.into(), value);
    }

    /// Extensions recorded so far.
    pub fn extensions(&self) -> Map<String, Value> {
        self.extensions.lock().clone()
    }
}

/// A GraphQL response.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Response {
    /// The data.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
    /// The errors.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub errors: Option<Vec<FieldError>>,
    /// Entries added by resolvers.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub extensions: Option<Map<String, Value>>,
}

impl Response {
    /// Creates a successful response with data.
    pub fn data(data: Value) -> Self {
        Self {
            data: Some(data),
            ..Self::default()
        }
    }

    /// Creates an error response.
    pub fn error(error: FieldError) -> Self {
        Self::errors(vec![error])
    }

    /// Creates an error response with multiple errors.
    pub fn errors(errors: Vec<FieldError>) -> Self {
        Self {
            errors: Some(errors),
            ..Self::default()
        }
    }

    /// Returns true if the response has errors.
    pub fn has_errors(&self) -> bool {
        self.errors.as_ref().is_some_and(|e| !e.is_empty())
    }

    /// Returns true if the response has data.
    pub fn has_data(&self) -> bool {
        self.data.is_some()
    }

    /// Returns true for the empty response of a query that did not run.
    pub fn is_empty(&self) -> bool {
        self.data.is_none() && self.errors.is_none() && self.extensions.is_none()
    }

    /// The response as JSON.
    pub fn to_json(&self) -> Value {
        serde_json::to_value(self).unwrap_or(Value::Null)
    }
}

/// A field error.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FieldError {
    /// The error message.
    pub message: String,
    /// The path to the field.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub path: Option<Vec<PathSegment>>,
    /// Error extensions.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub extensions: Option<HashMap<String, Value>>,
}

/// A path segment.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum PathSegment {
    Field(String),
    Index(usize),
}

impl FieldError {
    /// Creates a new field error.
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            path: None,
            extensions: None,
        }
    }

    /// Adds a path to the error.
    pub fn with_path(mut self, path: Vec<PathSegment>) -> Self {
        self.path = Some(path);
        self
    }

    /// Adds an extension.
    pub fn with_extension(mut self, key: impl Into<String>, value: Value) -> Self {
        self.extensions
            .get_or_insert_with(HashMap::new)
            .insert(key.into(), value);
        self
    }

    /// Sets the error code extension.
    pub fn with_code(self, code: impl Into<String>) -> Self {
        self.with_extension("code", Value::String(code.into()))
    }
}
