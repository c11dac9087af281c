//! Query planning for batchql.
//!
//! A [`QueryPlan`] is the resolution tree of one operation. Plans are built
//! by hand from [`PlanNode`]s or by [`QueryPlanner`] from a JSON
//! [`QueryDocument`].

use crate::executor::{Context, FieldError};
use crate::schema::Schema;
use indexmap::IndexMap;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;

/// Kind of operation a plan executes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OperationKind {
    #[default]
    Query,
    Mutation,
    Subscription,
}

impl OperationKind {
    /// Conventional root type name for this kind.
    pub fn default_root_name(self) -> &'static str {
        match self {
            Self::Query => "Query",
            Self::Mutation => "Mutation",
            Self::Subscription => "Subscription",
        }
    }
}

impl fmt::Display for OperationKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Query => "query",
            Self::Mutation => "mutation",
            Self::Subscription => "subscription",
        })
    }
}

/// Field information for planning.
#[derive(Debug, Clone, PartialEq)]
pub struct FieldInfo {
    /// Field name.
    pub name: String,
    /// Alias (if any).
    pub alias: Option<String>,
    /// Parent type name.
    pub parent_type: String,
    /// Return type name.
    pub return_type: String,
    /// Arguments.
    pub arguments: Vec<(String, Value)>,
    /// Whether this is an introspection field.
    pub is_introspection: bool,
}

impl FieldInfo {
    /// Creates field info for `parent_type.name`.
    pub fn new(name: impl Into<String>, parent_type: impl Into<String>) -> Self {
        let name = name.into();
        Self {
            is_introspection: name.starts_with("__"),
            name,
            alias: None,
            parent_type: parent_type.into(),
            return_type: String::new(),
            arguments: Vec::new(),
        }
    }

    /// Sets the alias.
    pub fn with_alias(mut self, alias: impl Into<String>) -> Self {
        self.alias = Some(alias.into());
        self
    }

    /// Sets the return type.
    pub fn with_return_type(mut self, ty: impl Into<String>) -> Self {
        self.return_type = ty.into();
        self
    }

    /// Adds an argument.
    pub fn with_argument(mut self, name: impl Into<String>, value: Value) -> Self {
        self.arguments.push((name.into(), value));
        self
    }

    /// Returns the response key (alias or name).
    pub fn response_key(&self) -> &str {
        self.alias.as_deref().unwrap_or(&self.name)
    }
}

/// A node in the query plan.
#[derive(Debug, Clone)]
pub enum PlanNode {
    /// Resolve children one after another.
    Sequence(Vec<PlanNode>),
    /// Resolve children together so their loads share batches.
    Parallel(Vec<PlanNode>),
    /// A field with nested selections.
    Field {
        info: FieldInfo,
        children: Box<PlanNode>,
    },
    /// A field without selections.
    Leaf { field: FieldInfo },
    /// Applies only when the parent's `__typename` matches.
    TypeCondition {
        type_name: String,
        node: Box<PlanNode>,
    },
    /// Included only when the condition holds.
    Conditional {
        condition: bool,
        node: Box<PlanNode>,
    },
}

impl PlanNode {
    /// A field whose selections resolve in parallel.
    pub fn field(info: FieldInfo, children: Vec<PlanNode>) -> Self {
        Self::Field {
            info,
            children: Box::new(Self::Parallel(children)),
        }
    }

    /// A leaf field.
    pub fn leaf(info: FieldInfo) -> Self {
        Self::Leaf { field: info }
    }

    /// Number of fields in this subtree; each field costs 1.
    pub fn complexity(&self) -> usize {
        match self {
            Self::Sequence(nodes) | Self::Parallel(nodes) => nodes.iter().map(Self::complexity).sum(),
            Self::Field { children, .. } => 1 + children.complexity(),
            Self::Leaf { .. } => 1,
            Self::TypeCondition { node, .. } | Self::Conditional { node, .. } => node.complexity(),
        }
    }

    /// Deepest field nesting in this subtree.
    pub fn depth(&self) -> usize {
        match self {
            Self::Sequence(nodes) | Self::Parallel(nodes) => {
                nodes.iter().map(Self::depth).max().unwrap_or(0)
            }
            Self::Field { children, .. } => 1 + children.depth(),
            Self::Leaf { .. } => 1,
            Self::TypeCondition { node, .. } | Self::Conditional { node, .. } => node.depth(),
        }
    }

    /// Response keys this node contributes to its parent object, in order.
    pub fn response_keys(&self) -> Vec<String> {
        let mut keys = Vec::new();
        self.collect_response_keys(&mut keys);
        keys
    }

    fn collect_response_keys(&self, keys: &mut Vec<String>) {
        match self {
            Self::Sequence(nodes) | Self::Parallel(nodes) => {
                for node in nodes {
                    node.collect_response_keys(keys);
                }
            }
            Self::Field { info, .. } | Self::Leaf { field: info } => {
                let key = info.response_key();
                if !keys.iter().any(|existing| existing == key) {
                    keys.push(key.to_string());
                }
            }
            Self::TypeCondition { node, .. } => node.collect_response_keys(keys),
            Self::Conditional { condition, node } => {
                if *condition {
                    node.collect_response_keys(keys);
                }
            }
        }
    }

    /// Names of the fields selected directly below this node.
    pub fn selected_fields(&self) -> Vec<String> {
        match self {
            Self::Sequence(nodes) | Self::Parallel(nodes) => {
                nodes.iter().flat_map(Self::selected_fields).collect()
            }
            Self::Field { info, .. } | Self::Leaf { field: info } => vec![info.name.clone()],
            Self::TypeCondition { node, .. } | Self::Conditional { node, .. } => {
                node.selected_fields()
            }
        }
    }
}

/// A query plan.
#[derive(Debug, Clone)]
pub struct QueryPlan {
    /// The root node of the plan.
    pub root: PlanNode,
    /// Operation name.
    pub operation_name: Option<String>,
    /// Operation kind.
    pub operation_kind: OperationKind,
    /// Field count of the plan.
    pub complexity: usize,
}

impl QueryPlan {
    /// Creates an anonymous plan.
    pub fn new(operation_kind: OperationKind, root: PlanNode) -> Self {
        Self {
            complexity: root.complexity(),
            root,
            operation_name: None,
            operation_kind,
        }
    }

    /// Shorthand for a query whose root fields resolve in parallel.
    pub fn query(fields: Vec<PlanNode>) -> Self {
        Self::new(OperationKind::Query, PlanNode::Parallel(fields))
    }

    /// Names the operation.
    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.operation_name = Some(name.into());
        self
    }
}

/// One query submitted to a multiplex.
///
/// Carries every operation of its document plus the name of the one to run.
/// Upstream validation failures travel as `static_errors`; a query with any
/// of those is never executed.
#[derive(Debug, Clone, Default)]
pub struct Query {
    pub operations: Vec<QueryPlan>,
    pub operation_name: Option<String>,
    pub static_errors: Vec<FieldError>,
    /// Replaces the multiplex context for this query (the dataloader is
    /// always the multiplex's).
    pub context: Option<Context>,
    pub max_complexity: Option<usize>,
}

impl Query {
    /// A query with a single operation.
    pub fn new(plan: QueryPlan) -> Self {
        Self {
            operations: vec![plan],
            ..Self::default()
        }
    }

    /// A query that failed validation upstream.
    pub fn invalid(errors: Vec<FieldError>) -> Self {
        Self {
            static_errors: errors,
            ..Self::default()
        }
    }

    /// Adds an operation.
    pub fn with_operation(mut self, plan: QueryPlan) -> Self {
        self.operations.push(plan);
        self
    }

    /// Selects the operation to run by name.
    pub fn with_operation_name(mut self, name: impl Into<String>) -> Self {
        self.operation_name = Some(name.into());
        self
    }

    /// Sets a query-specific context.
    pub fn with_context(mut self, context: Context) -> Self {
        self.context = Some(context);
        self
    }

    /// Sets a complexity limit for this query alone.
    pub fn with_max_complexity(mut self, max: usize) -> Self {
        self.max_complexity = Some(max);
        self
    }

    /// The operation that will run, if any.
    pub fn selected_operation(&self) -> Option<&QueryPlan> {
        match &self.operation_name {
            Some(name) => self
                .operations
                .iter()
                .find(|plan| plan.operation_name.as_deref() == Some(name.as_str())),
            None if self.operations.len() == 1 => self.operations.first(),
            None => None,
        }
    }

    /// Static errors plus operation-selection errors.
    pub fn validation_errors(&self) -> Vec<FieldError> {
        let mut errors = self.static_errors.clone();
        match &self.operation_name {
            Some(name) if self.selected_operation().is_none() => {
                errors.push(FieldError::new(format!("No operation named \"{name}\"")));
            }
            None if self.operations.len() > 1 => {
                errors.push(FieldError::new(
                    "An operation name is required when the document has several operations",
                ));
            }
            _ => {}
        }
        errors
    }

    /// Returns true if the query may execute.
    pub fn is_valid(&self) -> bool {
        self.validation_errors().is_empty()
    }
}

/// A field selection in a JSON query document.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct FieldSpec {
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub alias: Option<String>,
    #[serde(default, skip_serializing_if = "IndexMap::is_empty")]
    pub arguments: IndexMap<String, Value>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub selections: Vec<FieldSpec>,
    /// Return type name; nested selections resolve against it.
    #[serde(default, rename = "type", skip_serializing_if = "Option::is_none")]
    pub return_type: Option<String>,
}

/// A named operation in a JSON query document.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct OperationSpec {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(default)]
    pub kind: OperationKind,
    pub fields: Vec<FieldSpec>,
}

/// A query as submitted in JSON.
///
/// Either `fields` (one anonymous query) or `operations` is given.
/// `errors` carries validation failures found upstream.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct QueryDocument {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub operation_name: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub fields: Vec<FieldSpec>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub operations: Vec<OperationSpec>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub errors: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_complexity: Option<usize>,
}

/// Query planner configuration.
#[derive(Debug, Clone)]
pub struct PlannerConfig {
    /// Return type assumed for fields with selections but no `type`.
    pub default_object_type: String,
    /// Complexity limit applied to documents that set none.
    pub max_complexity: Option<usize>,
}

impl Default for PlannerConfig {
    fn default() -> Self {
        Self {
            default_object_type: "Object".to_string(),
            max_complexity: None,
        }
    }
}

/// Turns JSON query documents into executable queries.
#[derive(Debug, Default)]
pub struct QueryPlanner {
    config: PlannerConfig,
}

impl QueryPlanner {
    /// Creates a new query planner.
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates a query planner with configuration.
    pub fn with_config(config: PlannerConfig) -> Self {
        Self { config }
    }

    /// Plans every operation of a document.
    pub fn plan(&self, document: &QueryDocument, schema: &Schema) -> Query {
        let mut operations: Vec<QueryPlan> = document
            .operations
            .iter()
            .map(|operation| self.plan_operation(operation, schema))
            .collect();
        if !document.fields.is_empty() {
            let anonymous = OperationSpec {
                name: None,
                kind: OperationKind::Query,
                fields: document.fields.clone(),
            };
            operations.push(self.plan_operation(&anonymous, schema));
        }

        Query {
            operations,
            operation_name: document.operation_name.clone(),
            static_errors: document.errors.iter().map(FieldError::new).collect(),
            context: None,
            max_complexity: document.max_complexity.or(self.config.max_complexity),
        }
    }

    fn plan_operation(&self, operation: &OperationSpec, schema: &Schema) -> QueryPlan {
        let root_type = schema
            .root_type(operation.kind)
            .unwrap_or_else(|| operation.kind.default_root_name());
        let fields = operation
            .fields
            .iter()
            .map(|field| self.plan_field(field, root_type))
            .collect();
        let root = match operation.kind {
            OperationKind::Mutation => PlanNode::Sequence(fields),
            OperationKind::Query | OperationKind::Subscription => PlanNode::Parallel(fields),
        };

        let plan = QueryPlan::new(operation.kind, root);
        match &operation.name {
            Some(name) => plan.with_name(name.clone()),
            None => plan,
        }
    }

    fn plan_field(&self, spec: &FieldSpec, parent_type: &str) -> PlanNode {
        let mut info = FieldInfo::new(&spec.name, parent_type);
        info.alias.clone_from(&spec.alias);
        info.arguments = spec
            .arguments
            .iter()
            .map(|(name, value)| (name.clone(), value.clone()))
            .collect();

        if spec.selections.is_empty() {
            info.return_type = spec.return_type.clone().unwrap_or_default();
            return PlanNode::leaf(info);
        }

        let child_type = spec
            .return_type
            .clone()
            .unwrap_or_else(|| self.config.default_object_type.clone());
        let children = spec
            .selections
            .iter()
            .map(|child| self.plan_field(child, &child_type))
            .collect();
        PlanNode::field(info.with_return_type(child_type), children)
    }
}
