//! Runtime for batchql.
//!
//! This crate provides a batching query runtime:
//! - `dataloader`: the scheduler that runs jobs and flushes sources
//! - `source`: batch sources and their handles
//! - `request`: deferred handles to requested keys
//! - `registry`: one source instance per type and batch key
//! - `scheduler`: the cooperative job queue
//! - `query`: query plans and the JSON planner
//! - `resolver`: field resolvers and lazy values
//! - `executor`: query execution and the settle pass
//! - `schema`: schema definition and building
//! - `multiplex`: several queries sharing one dataloader

pub mod dataloader;
pub mod error;
pub mod executor;
pub mod multiplex;
pub mod query;
pub mod registry;
pub mod request;
pub mod resolver;
pub mod scheduler;
pub mod schema;
pub mod source;

pub use dataloader::Dataloader;
pub use error::{FetchError, JobError, LoadError, Throw};
pub use executor::{
    Context, Executor, ExecutorConfig, FieldError, PathSegment, QueryRuntime, Response,
};
pub use multiplex::{complexity_error, Instrumentation, Multiplex};
pub use query::{
    FieldInfo, FieldSpec, OperationKind, OperationSpec, PlanNode, PlannerConfig, Query,
    QueryDocument, QueryPlan, QueryPlanner,
};
pub use registry::BatchKey;
pub use request::{PendingRequest, PendingRequestAll};
pub use resolver::{
    AsyncFnResolver, DefaultResolver, FieldValue, FnResolver, LazyValue, Resolver, ResolverArgs,
    ResolverError, ResolverInfo, ResolverMap, ResolverResult,
};
pub use scheduler::{Job, JobKind, JobResult, SchedulerStats, StatsSnapshot};
pub use schema::{ErrorHandler, Schema, SchemaBuilder};
pub use source::{Source, SourceHandle};

// Sources implement `Source` with `#[async_trait]`.
pub use async_trait::async_trait;
