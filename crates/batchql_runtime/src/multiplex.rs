//! Multiplex execution.
//!
//! Runs several queries under one dataloader so identical keys requested by
//! different queries are fetched once. Execution has two rounds: the root
//! jobs of every query, then a settle round that forces the lazy values the
//! first round left behind.

use crate::dataloader::Dataloader;
use crate::error::JobError;
use crate::executor::{Context, Executor, FieldError, QueryRuntime, Response};
use crate::query::{Query, QueryPlan};
use crate::schema::Schema;
use parking_lot::Mutex;
use std::sync::Arc;
use tracing::{debug, info_span, warn, Instrument};

/// Hooks around multiplex and query execution.
///
/// After-hooks run even when the multiplex fails.
pub trait Instrumentation: Send + Sync {
    /// Called once before any query is prepared.
    fn before_multiplex(&self, _multiplex: &Multiplex) {}

    /// Called once after every query's after-hook.
    fn after_multiplex(&self, _multiplex: &Multiplex) {}

    /// Called for each query, in order, before preparation.
    fn before_query(&self, _query: &Query) {}

    /// Called for each query with its stored result.
    ///
    /// `response` is `None` only if the query never got a result.
    fn after_query(&self, _query: &Query, _response: Option<&Response>) {}
}

/// What a query does in this multiplex.
enum Prepared {
    /// Failed validation or analysis; never executed.
    Invalid(Vec<FieldError>),
    /// No operation to run.
    NoOperation,
    Execute {
        plan: QueryPlan,
        ctx: Context,
        runtime: Arc<Mutex<Option<Arc<QueryRuntime>>>>,
    },
}

/// Several queries sharing one dataloader.
pub struct Multiplex {
    schema: Schema,
    queries: Vec<Query>,
    context: Context,
    max_complexity: Option<usize>,
    results: Vec<Option<Response>>,
}

impl std::fmt::Debug for Multiplex {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Multiplex")
            .field("queries", &self.queries.len())
            .field("max_complexity", &self.max_complexity)
            .field("executed", &self.results.iter().filter(|r| r.is_some()).count())
            .finish()
    }
}

/// Error for a plan whose complexity is over the limit.
pub fn complexity_error(complexity: usize, max: usize) -> FieldError {
    FieldError::new(format!(
        "Query has complexity of {complexity}, which exceeds max complexity of {max}"
    ))
}

impl Multiplex {
    /// Creates a multiplex. `max_complexity` defaults to the schema's.
    pub fn new(
        schema: Schema,
        queries: Vec<Query>,
        context: Context,
        max_complexity: Option<usize>,
    ) -> Self {
        let max_complexity = max_complexity.or(schema.max_complexity);
        let results = vec![None; queries.len()];
        Self {
            schema,
            queries,
            context,
            max_complexity,
            results,
        }
    }

    /// Builds and runs a multiplex in one call.
    pub async fn run_all(
        schema: Schema,
        queries: Vec<Query>,
        context: Context,
        max_complexity: Option<usize>,
    ) -> Result<Vec<Response>, JobError> {
        Self::new(schema, queries, context, max_complexity).run().await
    }

    pub fn queries(&self) -> &[Query] {
        &self.queries
    }

    pub fn context(&self) -> &Context {
        &self.context
    }

    /// The dataloader every query shares.
    pub fn dataloader(&self) -> &Dataloader {
        self.context.dataloader()
    }

    pub fn max_complexity(&self) -> Option<usize> {
        self.max_complexity
    }

    /// Per-query results; `None` until the query has run.
    ///
    /// After a failed run every entry is an empty response.
    pub fn results(&self) -> &[Option<Response>] {
        &self.results
    }

    /// Runs every query and returns one response per query, in order.
    ///
    /// An application error or throw from any job aborts the whole
    /// multiplex: the error is returned and no query keeps a usable result.
    pub async fn run(&mut self) -> Result<Vec<Response>, JobError> {
        let span = info_span!("execute_multiplex", queries = self.queries.len());
        self.run_instrumented().instrument(span).await
    }

    async fn run_instrumented(&mut self) -> Result<Vec<Response>, JobError> {
        let instrumenters = self.schema.instrumenters().to_vec();
        for instrumenter in &instrumenters {
            instrumenter.before_multiplex(self);
        }
        for query in &self.queries {
            for instrumenter in &instrumenters {
                instrumenter.before_query(query);
            }
        }

        let outcome = self.execute().await;
        match &outcome {
            Ok(responses) => {
                self.results = responses.iter().cloned().map(Some).collect();
            }
            Err(err) => {
                warn!(error = %err, "multiplex aborted");
                self.results = vec![Some(Response::default()); self.queries.len()];
            }
        }

        for (query, result) in self.queries.iter().zip(&self.results) {
            for instrumenter in instrumenters.iter().rev() {
                instrumenter.after_query(query, result.as_ref());
            }
        }
        for instrumenter in instrumenters.iter().rev() {
            instrumenter.after_multiplex(self);
        }
        outcome
    }

    async fn execute(&self) -> Result<Vec<Response>, JobError> {
        let loader = self.dataloader().clone();
        let executor = Executor::new(self.schema.clone());
        let prepared = self.prepare();

        for query in &prepared {
            let Prepared::Execute { plan, ctx, runtime } = query else {
                continue;
            };
            let executor = executor.clone();
            let plan = plan.clone();
            let ctx = ctx.clone();
            let slot = Arc::clone(runtime);
            loader.append_job(async move {
                match executor.evaluate(&plan, ctx.clone()) {
                    Ok(runtime) => *slot.lock() = Some(runtime),
                    Err(err) => ctx.add_error(err),
                }
                Ok(())
            });
        }
        loader.run().await?;

        let runtimes: Vec<Arc<QueryRuntime>> = prepared
            .iter()
            .filter_map(|query| match query {
                Prepared::Execute { runtime, .. } => runtime.lock().clone(),
                _ => None,
            })
            .collect();
        let settle = executor.clone();
        loader.append_job(async move {
            settle.sync_lazies(&runtimes);
            Ok(())
        });
        loader.run().await?;

        Ok(prepared.into_iter().map(Self::collect).collect())
    }

    /// Validates each query and applies complexity limits.
    fn prepare(&self) -> Vec<Prepared> {
        let loader = self.dataloader();
        let mut prepared: Vec<Prepared> = self
            .queries
            .iter()
            .map(|query| {
                let errors = query.validation_errors();
                if !errors.is_empty() {
                    return Prepared::Invalid(errors);
                }
                let Some(plan) = query.selected_operation() else {
                    return Prepared::NoOperation;
                };
                if let Some(max) = query.max_complexity {
                    if plan.complexity > max {
                        return Prepared::Invalid(vec![complexity_error(plan.complexity, max)]);
                    }
                }
                Prepared::Execute {
                    plan: plan.clone(),
                    ctx: query.context.as_ref().unwrap_or(&self.context).for_query(loader),
                    runtime: Arc::default(),
                }
            })
            .collect();

        if let Some(max) = self.max_complexity {
            let total: usize = prepared
                .iter()
                .filter_map(|query| match query {
                    Prepared::Execute { plan, .. } => Some(plan.complexity),
                    _ => None,
                })
                .sum();
            if total > max {
                debug!(total, max, "multiplex exceeds max complexity");
                for query in &mut prepared {
                    if matches!(query, Prepared::Execute { .. }) {
                        *query = Prepared::Invalid(vec![complexity_error(total, max)]);
                    }
                }
            }
        }
        prepared
    }

    fn collect(query: Prepared) -> Response {
        match query {
            Prepared::Invalid(errors) => Response::errors(errors),
            Prepared::NoOperation => Response::default(),
            Prepared::Execute { ctx, runtime, .. } => match runtime.lock().take() {
                Some(runtime) => runtime.response(),
                // Evaluation failed before any field ran.
                None => Response::errors(ctx.errors()),
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::query::{FieldInfo, PlanNode};
    use crate::schema::SchemaBuilder;
    use serde_json::json;

    fn hello() -> Query {
        Query::new(QueryPlan::query(vec![PlanNode::leaf(FieldInfo::new("hello", "Query"))]))
    }

    fn schema() -> Schema {
        SchemaBuilder::new()
            .resolver_fn("Query", "hello", |_parent, _args, _ctx, _info| {
                Ok(json!("hi").into())
            })
            .build()
    }

    #[derive(Default)]
    struct Recorder {
        events: Arc<Mutex<Vec<String>>>,
    }

    impl Instrumentation for Recorder {
        fn before_multiplex(&self, multiplex: &Multiplex) {
            self.events
                .lock()
                .push(format!("before_multiplex:{}", multiplex.queries().len()));
        }

        fn after_multiplex(&self, multiplex: &Multiplex) {
            let executed = multiplex.results().iter().filter(|r| r.is_some()).count();
            self.events.lock().push(format!("after_multiplex:{executed}"));
        }

        fn before_query(&self, _query: &Query) {
            self.events.lock().push("before_query".to_string());
        }

        fn after_query(&self, _query: &Query, response: Option<&Response>) {
            let empty = response.is_some_and(Response::is_empty);
            self.events.lock().push(format!("after_query:{empty}"));
        }
    }

    #[tokio::test]
    async fn test_invalid_and_empty_queries() {
        let queries = vec![
            hello(),
            Query::invalid(vec![FieldError::new("Syntax error")]),
            Query::default(),
        ];
        let responses = schema().multiplex(queries, Context::new()).await.unwrap();

        assert_eq!(responses[0].to_json(), json!({"data": {"hello": "hi"}}));
        assert_eq!(responses[1].to_json(), json!({"errors": [{"message": "Syntax error"}]}));
        assert!(responses[2].is_empty());
    }

    #[tokio::test]
    async fn test_multiplex_complexity() {
        let mut multiplex = Multiplex::new(schema(), vec![hello(), hello()], Context::new(), Some(1));
        let responses = multiplex.run().await.unwrap();

        for response in &responses {
            assert_eq!(
                response.errors.as_ref().unwrap()[0].message,
                "Query has complexity of 2, which exceeds max complexity of 1"
            );
            assert!(response.data.is_none());
        }
        assert!(multiplex.results().iter().all(Option::is_some));
    }

    #[tokio::test]
    async fn test_query_complexity() {
        let queries = vec![hello().with_max_complexity(0), hello()];
        let responses = schema().multiplex(queries, Context::new()).await.unwrap();

        assert_eq!(
            responses[0].errors.as_ref().unwrap()[0].message,
            "Query has complexity of 1, which exceeds max complexity of 0"
        );
        assert_eq!(responses[1].data, Some(json!({"hello": "hi"})));
    }

    #[tokio::test]
    async fn test_instrumentation_runs_after_failure() {
        let recorder = Recorder::default();
        let events = Arc::clone(&recorder.events);
        let schema = SchemaBuilder::new()
            .resolver_fn("Query", "hello", |_parent, _args, _ctx, _info| {
                Err(crate::resolver::ResolverError::Internal("boom".to_string()))
            })
            .instrument(recorder)
            .build();

        let mut multiplex = Multiplex::new(schema, vec![hello(), hello()], Context::new(), None);
        let err = multiplex.run().await.unwrap_err();
        assert_eq!(err.to_string(), "Internal error: boom");
        assert!(multiplex
            .results()
            .iter()
            .all(|r| r.as_ref().is_some_and(Response::is_empty)));

        assert_eq!(
            *events.lock(),
            vec![
                "before_multiplex:2",
                "before_query",
                "before_query",
                "after_query:true",
                "after_query:true",
                "after_multiplex:2",
            ]
        );
    }

    #[tokio::test]
    async fn test_missing_root_is_a_query_error() {
        let schema = schema();
        let subscription = Query::new(QueryPlan::new(
            crate::query::OperationKind::Subscription,
            PlanNode::Parallel(vec![PlanNode::leaf(FieldInfo::new("ticks", "Subscription"))]),
        ));

        let responses = schema
            .multiplex(vec![subscription, hello()], Context::new())
            .await
            .unwrap();
        assert_eq!(
            responses[0].to_json(),
            json!({"errors": [{"message": "Schema is not configured for subscriptions"}]})
        );
        assert_eq!(responses[1].data, Some(json!({"hello": "hi"})));
    }
}
