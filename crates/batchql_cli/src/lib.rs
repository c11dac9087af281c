//! Command-line interface for batchql.
//!
//! # Usage
//!
//! ```bash
//! # Run queries against a JSON record file, one shared dataloader
//! batchql run --records records.json --queries queries.json
//!
//! # Also list the batches each source fetched
//! batchql run --records records.json --queries queries.json --show-fetches
//!
//! # Print plan shapes and complexity without running anything
//! batchql explain --queries queries.json
//! ```

pub mod records;

use batchql_runtime::{
    Context, FieldInfo, JobError, Multiplex, PlanNode, Query, QueryDocument, QueryPlanner,
    Response, Schema, SchemaBuilder,
};
use clap::{Parser, Subcommand};
use colored::Colorize;
use records::{FetchBatch, RecordResolver, RecordStore};
use serde::Deserialize;
use std::path::{Path, PathBuf};
use tracing::info;

#[derive(Parser, Debug)]
#[command(name = "batchql")]
#[command(author, version, about, long_about = None)]
pub struct Cli {
    #[arg(short, long, global = true)]
    pub verbose: bool,

    #[arg(short, long, global = true)]
    pub quiet: bool,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Run queries against a record file
    Run {
        /// JSON array of records, each with an `id`
        #[arg(long)]
        records: PathBuf,

        /// JSON query document, or an array of them
        #[arg(long)]
        queries: PathBuf,

        /// Limit on the summed complexity of all queries
        #[arg(long)]
        max_complexity: Option<usize>,

        /// Print the batches fetched from each source
        #[arg(long)]
        show_fetches: bool,
    },

    /// Print each query's plan and complexity
    Explain {
        /// JSON query document, or an array of them
        #[arg(long)]
        queries: PathBuf,
    },
}

/// A queries file holds one document or a list of them.
#[derive(Deserialize)]
#[serde(untagged)]
enum QueryFile {
    Many(Vec<QueryDocument>),
    One(QueryDocument),
}

pub async fn run(cli: Cli) -> Result<i32, Box<dyn std::error::Error>> {
    match cli.command {
        Commands::Run {
            records,
            queries,
            max_complexity,
            show_fetches,
        } => {
            let store = RecordStore::load(&records)?;
            let documents = read_documents(&queries)?;
            info!(records = store.len(), queries = documents.len(), "running queries");

            let responses = execute_documents(&store, &documents, max_complexity).await?;
            for response in &responses {
                println!("{}", serde_json::to_string_pretty(&response.to_json())?);
            }
            if show_fetches {
                print_fetches(&store.fetches());
            }
            Ok(0)
        }
        Commands::Explain { queries } => {
            let documents = read_documents(&queries)?;
            let schema = record_schema(&RecordStore::default());
            let planner = QueryPlanner::new();
            for (index, document) in documents.iter().enumerate() {
                let query = planner.plan(document, &schema);
                println!("{}", format!("Query {index}").bold());
                for line in explain_query(&query) {
                    println!("{line}");
                }
            }
            Ok(0)
        }
    }
}

/// Reads a queries file.
pub fn read_documents(path: &Path) -> Result<Vec<QueryDocument>, Box<dyn std::error::Error>> {
    let source = std::fs::read_to_string(path)?;
    Ok(match serde_json::from_str(&source)? {
        QueryFile::Many(documents) => documents,
        QueryFile::One(document) => vec![document],
    })
}

/// A schema whose every field is resolved from `store`.
pub fn record_schema(store: &RecordStore) -> Schema {
    SchemaBuilder::new()
        .name("records")
        .default_resolver(RecordResolver::new(store.clone()))
        .build()
}

/// Plans the documents and runs them as one multiplex.
pub async fn execute_documents(
    store: &RecordStore,
    documents: &[QueryDocument],
    max_complexity: Option<usize>,
) -> Result<Vec<Response>, JobError> {
    let schema = record_schema(store);
    let planner = QueryPlanner::new();
    let queries: Vec<Query> = documents
        .iter()
        .map(|document| planner.plan(document, &schema))
        .collect();

    let mut multiplex = Multiplex::new(schema, queries, Context::new(), max_complexity);
    let responses = multiplex.run().await?;
    let stats = multiplex.dataloader().stats();
    info!(
        fetches = stats.fetch_calls,
        keys = stats.keys_fetched,
        rounds = stats.flush_rounds,
        "multiplex finished"
    );
    Ok(responses)
}

/// Describes a planned query, one line per plan entry.
pub fn explain_query(query: &Query) -> Vec<String> {
    let mut lines = Vec::new();
    for error in query.validation_errors() {
        lines.push(format!("  {} {}", "error:".red(), error.message));
    }
    if !lines.is_empty() {
        return lines;
    }
    let selected = query.selected_operation();
    for plan in &query.operations {
        let marker = if selected.is_some_and(|s| std::ptr::eq(s, plan)) {
            "*"
        } else {
            " "
        };
        lines.push(format!(
            "{marker} {} {}: complexity {}, depth {}",
            plan.operation_kind,
            plan.operation_name.as_deref().unwrap_or("(anonymous)"),
            plan.complexity,
            plan.root.depth()
        ));
        describe_node(&plan.root, 2, &mut lines);
    }
    lines
}

fn describe_node(node: &PlanNode, indent: usize, lines: &mut Vec<String>) {
    let pad = " ".repeat(indent * 2);
    match node {
        PlanNode::Parallel(nodes) => {
            for node in nodes {
                describe_node(node, indent, lines);
            }
        }
        PlanNode::Sequence(nodes) => {
            lines.push(format!("{pad}(in sequence)"));
            for node in nodes {
                describe_node(node, indent + 1, lines);
            }
        }
        PlanNode::Field { info, children } => {
            lines.push(format!("{pad}{}", field_label(info)));
            describe_node(children, indent + 1, lines);
        }
        PlanNode::Leaf { field } => lines.push(format!("{pad}{}", field_label(field))),
        PlanNode::TypeCondition { type_name, node } => {
            lines.push(format!("{pad}... on {type_name}"));
            describe_node(node, indent + 1, lines);
        }
        PlanNode::Conditional { condition, node } => {
            if *condition {
                describe_node(node, indent, lines);
            }
        }
    }
}

fn field_label(info: &FieldInfo) -> String {
    let mut label = match &info.alias {
        Some(alias) => format!("{alias}: {}", info.name),
        None => info.name.clone(),
    };
    if !info.arguments.is_empty() {
        let args: Vec<String> = info
            .arguments
            .iter()
            .map(|(name, value)| format!("{name}: {value}"))
            .collect();
        label.push_str(&format!("({})", args.join(", ")));
    }
    label
}

fn print_fetches(fetches: &[FetchBatch]) {
    println!("{}", "Fetches:".blue().bold());
    for (index, batch) in fetches.iter().enumerate() {
        println!(
            "  {} {} [{}]",
            format!("{}.", index + 1).dimmed(),
            batch.column,
            batch.keys.join(", ")
        );
    }
}
