//! Schema definition for batchql.
//!
//! A schema names its root types and carries everything execution needs:
//! resolvers, the complexity limit, the error handler, instrumentation
//! hooks and executor configuration.

use crate::error::JobError;
use crate::executor::{Context, ExecutorConfig, Response};
use crate::multiplex::{Instrumentation, Multiplex};
use crate::query::{OperationKind, Query};
use crate::resolver::{
    Resolver, ResolverArgs, ResolverError, ResolverInfo, ResolverMap, ResolverResult,
};
use serde_json::Value;
use std::fmt;
use std::future::Future;
use std::sync::Arc;

/// Converts a resolver error into a value, or hands back an error.
pub type ErrorHandler =
    Arc<dyn Fn(ResolverError, &ResolverInfo, &Context) -> Result<Value, ResolverError> + Send + Sync>;

/// A GraphQL schema.
///
/// Cheap to clone; resolvers and hooks are shared.
#[derive(Clone, Default)]
pub struct Schema {
    pub name: Option<String>,
    pub query_type: Option<String>,
    pub mutation_type: Option<String>,
    pub subscription_type: Option<String>,
    /// Default limit for the summed complexity of a multiplex.
    pub max_complexity: Option<usize>,
    resolvers: Arc<ResolverMap>,
    error_handler: Option<ErrorHandler>,
    instrumenters: Vec<Arc<dyn Instrumentation>>,
    executor_config: ExecutorConfig,
}

impl fmt::Debug for Schema {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Schema")
            .field("name", &self.name)
            .field("query_type", &self.query_type)
            .field("mutation_type", &self.mutation_type)
            .field("subscription_type", &self.subscription_type)
            .field("max_complexity", &self.max_complexity)
            .field("resolvers", &self.resolvers)
            .field("error_handler", &self.error_handler.is_some())
            .field("instrumenters", &self.instrumenters.len())
            .finish()
    }
}

impl Schema {
    /// Creates a schema with a `Query` root and no resolvers.
    pub fn new() -> Self {
        SchemaBuilder::new().build()
    }

    /// Root type name for an operation kind.
    pub fn root_type(&self, kind: OperationKind) -> Option<&str> {
        match kind {
            OperationKind::Query => self.query_type.as_deref(),
            OperationKind::Mutation => self.mutation_type.as_deref(),
            OperationKind::Subscription => self.subscription_type.as_deref(),
        }
    }

    pub fn resolvers(&self) -> &ResolverMap {
        &self.resolvers
    }

    pub fn error_handler(&self) -> Option<&ErrorHandler> {
        self.error_handler.as_ref()
    }

    pub fn instrumenters(&self) -> &[Arc<dyn Instrumentation>] {
        &self.instrumenters
    }

    pub fn executor_config(&self) -> &ExecutorConfig {
        &self.executor_config
    }

    /// Runs several queries sharing one dataloader.
    pub async fn multiplex(
        &self,
        queries: Vec<Query>,
        context: Context,
    ) -> Result<Vec<Response>, JobError> {
        Multiplex::run_all(self.clone(), queries, context, None).await
    }

    /// Runs one query (a multiplex of one).
    pub async fn execute(&self, query: Query) -> Result<Response, JobError> {
        let context = query.context.clone().unwrap_or_default();
        let responses = self.multiplex(vec![query], context).await?;
        Ok(responses.into_iter().next().unwrap_or_default())
    }
}

/// Schema builder.
#[derive(Default)]
pub struct SchemaBuilder {
    schema: Schema,
    resolvers: ResolverMap,
}

impl fmt::Debug for SchemaBuilder {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SchemaBuilder")
            .field("schema", &self.schema)
            .field("resolvers", &self.resolvers)
            .finish()
    }
}

impl SchemaBuilder {
    /// Creates a builder with a `Query` root type.
    pub fn new() -> Self {
        let mut builder = Self::default();
        builder.schema.query_type = Some("Query".to_string());
        builder
    }

    /// Sets the schema name.
    pub fn name(mut self, name: impl Into<String>) -> Self {
        self.schema.name = Some(name.into());
        self
    }

    /// Sets the query type.
    pub fn query_type(mut self, name: impl Into<String>) -> Self {
        self.schema.query_type = Some(name.into());
        self
    }

    /// Sets the mutation type.
    pub fn mutation_type(mut self, name: impl Into<String>) -> Self {
        self.schema.mutation_type = Some(name.into());
        self
    }

    /// Sets the subscription type.
    pub fn subscription_type(mut self, name: impl Into<String>) -> Self {
        self.schema.subscription_type = Some(name.into());
        self
    }

    /// Replaces the resolver map.
    pub fn resolvers(mut self, resolvers: ResolverMap) -> Self {
        self.resolvers = resolvers;
        self
    }

    /// Registers a resolver.
    pub fn resolver<R: Resolver + 'static>(
        mut self,
        type_name: impl Into<String>,
        field_name: impl Into<String>,
        resolver: R,
    ) -> Self {
        self.resolvers.register(type_name, field_name, resolver);
        self
    }

    /// Registers a sync function as a resolver.
    pub fn resolver_fn<F>(
        mut self,
        type_name: impl Into<String>,
        field_name: impl Into<String>,
        f: F,
    ) -> Self
    where
        F: Fn(&Value, &ResolverArgs, &Context, &ResolverInfo) -> ResolverResult
            + Send
            + Sync
            + 'static,
    {
        self.resolvers.register_fn(type_name, field_name, f);
        self
    }

    /// Registers an async function as a resolver.
    pub fn resolver_async<F, Fut>(
        mut self,
        type_name: impl Into<String>,
        field_name: impl Into<String>,
        f: F,
    ) -> Self
    where
        F: Fn(Value, ResolverArgs, Context, ResolverInfo) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = ResolverResult> + Send + 'static,
    {
        self.resolvers.register_async(type_name, field_name, f);
        self
    }

    /// Sets the fallback resolver for unregistered fields.
    pub fn default_resolver<R: Resolver + 'static>(mut self, resolver: R) -> Self {
        self.resolvers.set_default(resolver);
        self
    }

    /// Sets the default multiplex complexity limit.
    pub fn max_complexity(mut self, max: usize) -> Self {
        self.schema.max_complexity = Some(max);
        self
    }

    /// Installs the error handler.
    ///
    /// The handler sees every resolver error. Returning `Ok` recovers the
    /// field with that value; returning `Err` reports the error instead.
    pub fn rescue_from<F>(mut self, handler: F) -> Self
    where
        F: Fn(ResolverError, &ResolverInfo, &Context) -> Result<Value, ResolverError>
            + Send
            + Sync
            + 'static,
    {
        self.schema.error_handler = Some(Arc::new(handler));
        self
    }

    /// Adds an instrumentation hook.
    pub fn instrument<I: Instrumentation + 'static>(mut self, instrumenter: I) -> Self {
        self.schema.instrumenters.push(Arc::new(instrumenter));
        self
    }

    /// Sets the executor configuration.
    pub fn executor_config(mut self, config: ExecutorConfig) -> Self {
        self.schema.executor_config = config;
        self
    }

    /// Builds the schema.
    pub fn build(self) -> Schema {
        Schema {
            resolvers: Arc::new(self.resolvers),
            ..self.schema
        }
    }
}
