#![forbid(unsafe_code)]

use std::collections::{HashMap, VecDeque};
use std::error::Error;
use std::fmt;

use ep_command::{Command, CommandError, CommandKind, ExecContext, parse_command};
use ep_lang::Functions;
use ep_value::{Results, TimeRange, ValueError, Vars};
use serde::Deserialize;
use thiserror::Error as ThisError;

/// Datasource UID that marks a query as a server-side expression.
pub const EXPRESSION_DATASOURCE_UID: &str = "__expr__";
/// Legacy numeric datasource ID with the same meaning.
pub const LEGACY_EXPRESSION_DATASOURCE_UID: &str = "-100";

// ── Wire model ──────────────────────────────────────────────────────────

#[derive(Debug, Clone, Deserialize)]
pub struct Request {
    pub queries: Vec<Query>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct Query {
    #[serde(rename = "refId")]
    pub ref_id: String,
    #[serde(default)]
    pub datasource: Option<DataSourceRef>,
    #[serde(rename = "timeRange", default)]
    pub time_range: Option<RawTimeRange>,
    #[serde(rename = "type", default)]
    pub query_type: Option<String>,
    #[serde(flatten)]
    pub body: serde_json::Map<String, serde_json::Value>,
}

impl Query {
    /// A query is an expression when its datasource carries the sentinel
    /// UID or type, legacy numeric ID included.
    #[must_use]
    pub fn is_expression(&self) -> bool {
        self.datasource.as_ref().is_some_and(|ds| {
            ds.uid.as_deref() == Some(EXPRESSION_DATASOURCE_UID)
                || ds.uid.as_deref() == Some(LEGACY_EXPRESSION_DATASOURCE_UID)
                || ds.ds_type.as_deref() == Some(EXPRESSION_DATASOURCE_UID)
        })
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct DataSourceRef {
    #[serde(default)]
    pub uid: Option<String>,
    #[serde(rename = "type", default)]
    pub ds_type: Option<String>,
}

/// Evaluation window as epoch milliseconds.
#[derive(Debug, Clone, Copy, Deserialize)]
pub struct RawTimeRange {
    pub from: i64,
    pub to: i64,
}

// ── Errors ──────────────────────────────────────────────────────────────

#[derive(Debug, ThisError)]
pub enum BuildError {
    #[error("duplicate refId '{0}'")]
    DuplicateRefId(String),
    #[error("expression '{0}' cannot reference itself. Must be query or another expression")]
    SelfReference(String),
    #[error("unable to find dependent node '{0}'")]
    MissingDependency(String),
    #[error("only data source queries may be inputs to a classic condition")]
    ClassicConditionInput,
    #[error("classic conditions may not be the input for other expressions")]
    ClassicConditionOutput,
    #[error("cyclic components in expression graph: {0}")]
    Cycle(String),
    #[error("expression '{0}' is missing the command type")]
    MissingType(String),
    #[error(transparent)]
    InvalidTimeRange(#[from] ValueError),
    #[error(transparent)]
    Command(#[from] CommandError),
}

#[derive(Debug, ThisError)]
pub enum ExecuteError {
    #[error("failed to execute expression '{ref_id}'")]
    Node {
        ref_id: String,
        #[source]
        source: CommandError,
    },
    #[error("failed to query data for '{ref_id}'")]
    Datasource {
        ref_id: String,
        #[source]
        source: Box<dyn Error + Send + Sync>,
    },
}

// ── Pipeline ────────────────────────────────────────────────────────────

/// Supplies results for the non-expression queries of a pipeline.
pub trait DataSourceHandler {
    fn query_data(
        &self,
        query: &Query,
        time_range: Option<TimeRange>,
    ) -> Result<Results, Box<dyn Error + Send + Sync>>;
}

#[derive(Debug)]
pub enum NodeKind {
    Datasource {
        query: Query,
    },
    Expression {
        command_kind: CommandKind,
        command: Box<dyn Command>,
    },
}

#[derive(Debug)]
pub struct Node {
    pub ref_id: String,
    pub time_range: Option<TimeRange>,
    pub kind: NodeKind,
}

/// A validated expression graph in execution order.
#[derive(Debug)]
pub struct Pipeline {
    nodes: Vec<Node>,
}

impl Pipeline {
    #[must_use]
    pub fn nodes(&self) -> &[Node] {
        &self.nodes
    }

    pub fn ref_ids(&self) -> impl Iterator<Item = &str> {
        self.nodes.iter().map(|n| n.ref_id.as_str())
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }
}

// ── Service ─────────────────────────────────────────────────────────────

/// Builds and runs expression pipelines against a function registry.
pub struct Service {
    functions: Functions,
}

impl Service {
    #[must_use]
    pub fn new() -> Self {
        Self {
            functions: Functions::builtin(),
        }
    }

    #[must_use]
    pub fn with_functions(functions: Functions) -> Self {
        Self { functions }
    }

    #[must_use]
    pub fn functions(&self) -> &Functions {
        &self.functions
    }

    /// Validate a request and produce its pipeline, topologically sorted
    /// so every node runs after the nodes it reads.
    pub fn build_pipeline(&self, request: &Request) -> Result<Pipeline, BuildError> {
        let mut nodes: Vec<Node> = Vec::with_capacity(request.queries.len());
        let mut deps: Vec<Vec<String>> = Vec::with_capacity(request.queries.len());
        let mut index: HashMap<String, usize> = HashMap::with_capacity(request.queries.len());

        for query in &request.queries {
            if index.contains_key(&query.ref_id) {
                return Err(BuildError::DuplicateRefId(query.ref_id.clone()));
            }

            let time_range = query
                .time_range
                .map(|r| TimeRange::from_epoch_millis(r.from, r.to))
                .transpose()?;

            let (kind, node_deps) = if query.is_expression() {
                let command_type = query
                    .query_type
                    .as_deref()
                    .ok_or_else(|| BuildError::MissingType(query.ref_id.clone()))?;
                let body = serde_json::Value::Object(query.body.clone());
                let (command_kind, command) =
                    parse_command(&query.ref_id, command_type, &body, &self.functions)?;

                let mut needed = Vec::new();
                for var in command.needs_vars() {
                    if !needed.contains(&var) {
                        needed.push(var);
                    }
                }
                (
                    NodeKind::Expression {
                        command_kind,
                        command,
                    },
                    needed,
                )
            } else {
                (
                    NodeKind::Datasource {
                        query: query.clone(),
                    },
                    Vec::new(),
                )
            };

            index.insert(query.ref_id.clone(), nodes.len());
            nodes.push(Node {
                ref_id: query.ref_id.clone(),
                time_range,
                kind,
            });
            deps.push(node_deps);
        }

        // Edges are validated against the full arena so declaration
        // order in the request does not matter.
        for (i, node_deps) in deps.iter().enumerate() {
            let is_classic = matches!(
                nodes[i].kind,
                NodeKind::Expression {
                    command_kind: CommandKind::ClassicConditions,
                    ..
                }
            );
            for dep in node_deps {
                if *dep == nodes[i].ref_id {
                    return Err(BuildError::SelfReference(nodes[i].ref_id.clone()));
                }
                let Some(&dep_idx) = index.get(dep) else {
                    return Err(BuildError::MissingDependency(dep.clone()));
                };
                match &nodes[dep_idx].kind {
                    NodeKind::Datasource { .. } => {}
                    NodeKind::Expression { command_kind, .. } => {
                        if is_classic {
                            return Err(BuildError::ClassicConditionInput);
                        }
                        if *command_kind == CommandKind::ClassicConditions {
                            return Err(BuildError::ClassicConditionOutput);
                        }
                    }
                }
            }
        }

        // Kahn's algorithm; refId is the sole node identity. The queue
        // is seeded in request order so ties execute deterministically.
        let mut dependents: Vec<Vec<usize>> = vec![Vec::new(); nodes.len()];
        let mut in_degree: Vec<usize> = vec![0; nodes.len()];
        for (i, node_deps) in deps.iter().enumerate() {
            in_degree[i] = node_deps.len();
            for dep in node_deps {
                dependents[index[dep.as_str()]].push(i);
            }
        }

        let mut queue: VecDeque<usize> = (0..nodes.len()).filter(|&i| in_degree[i] == 0).collect();
        let mut order: Vec<usize> = Vec::with_capacity(nodes.len());
        while let Some(i) = queue.pop_front() {
            order.push(i);
            for &next in &dependents[i] {
                in_degree[next] -= 1;
                if in_degree[next] == 0 {
                    queue.push_back(next);
                }
            }
        }

        if order.len() < nodes.len() {
            let mut placed = vec![false; nodes.len()];
            for &i in &order {
                placed[i] = true;
            }
            let stuck: Vec<&str> = nodes
                .iter()
                .enumerate()
                .filter(|(i, _)| !placed[*i])
                .map(|(_, n)| n.ref_id.as_str())
                .collect();
            return Err(BuildError::Cycle(stuck.join(", ")));
        }

        let mut arena: Vec<Option<Node>> = nodes.into_iter().map(Some).collect();
        let ordered = order
            .into_iter()
            .filter_map(|i| arena[i].take())
            .collect();
        Ok(Pipeline { nodes: ordered })
    }

    /// Run a pipeline, filling the shared binding one node at a time.
    /// Execution is strictly sequential and aborts on the first failure.
    pub fn execute_pipeline(
        &self,
        pipeline: &Pipeline,
        handler: &dyn DataSourceHandler,
    ) -> Result<Vars, ExecuteError> {
        let mut vars = Vars::with_capacity(pipeline.len());
        for node in &pipeline.nodes {
            let results = match &node.kind {
                NodeKind::Datasource { query } => {
                    tracing::debug!(ref_id = %node.ref_id, "querying datasource node");
                    handler
                        .query_data(query, node.time_range)
                        .map_err(|source| ExecuteError::Datasource {
                            ref_id: node.ref_id.clone(),
                            source,
                        })?
                }
                NodeKind::Expression {
                    command_kind,
                    command,
                } => {
                    tracing::debug!(ref_id = %node.ref_id, kind = %command_kind,
                        "executing expression node");
                    let ctx = ExecContext {
                        time_range: node.time_range,
                    };
                    command
                        .execute(&ctx, &vars)
                        .map_err(|source| ExecuteError::Node {
                            ref_id: node.ref_id.clone(),
                            source,
                        })?
                }
            };
            vars.insert(node.ref_id.clone(), results);
        }
        Ok(vars)
    }
}

impl Default for Service {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for Service {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Service").finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;
    use std::error::Error;

    use ep_value::{Labels, Number, Results, TimeRange, Value, Vars};
    use serde_json::json;

    use super::{BuildError, DataSourceHandler, Query, Request, Service};

    struct StaticHandler(HashMap<String, Results>);

    impl DataSourceHandler for StaticHandler {
        fn query_data(
            &self,
            query: &Query,
            _time_range: Option<TimeRange>,
        ) -> Result<Results, Box<dyn Error + Send + Sync>> {
            self.0
                .get(&query.ref_id)
                .cloned()
                .ok_or_else(|| format!("no stub data for '{}'", query.ref_id).into())
        }
    }

    fn request(queries: serde_json::Value) -> Request {
        serde_json::from_value(json!({ "queries": queries })).expect("request json")
    }

    fn number_results(value: f64) -> Results {
        Results::new(vec![Value::Number(Number::new(Labels::new(), Some(value)))])
    }

    fn single_value(vars: &Vars, ref_id: &str) -> Option<f64> {
        match &vars[ref_id].values[0] {
            Value::Number(n) => n.value,
            other => panic!("expected number, got {other:?}"),
        }
    }

    #[test]
    fn build_orders_dependencies_before_dependents() {
        let req = request(json!([
            {
                "refId": "C",
                "datasource": {"uid": "__expr__"},
                "type": "math",
                "expression": "$B + 1"
            },
            {
                "refId": "B",
                "datasource": {"uid": "__expr__"},
                "type": "math",
                "expression": "$A * 2"
            },
            {"refId": "A", "datasource": {"uid": "prometheus"}}
        ]));
        let service = Service::new();
        let pipeline = service.build_pipeline(&req).expect("build");
        let order: Vec<&str> = pipeline.ref_ids().collect();
        assert_eq!(order, ["A", "B", "C"]);
    }

    #[test]
    fn execute_runs_math_over_datasource_results() {
        let req = request(json!([
            {"refId": "A", "datasource": {"uid": "prometheus"}},
            {
                "refId": "B",
                "datasource": {"uid": "__expr__"},
                "type": "math",
                "expression": "$A * 2"
            }
        ]));
        let service = Service::new();
        let pipeline = service.build_pipeline(&req).expect("build");

        let handler = StaticHandler(HashMap::from([("A".to_owned(), number_results(21.0))]));
        let vars = service.execute_pipeline(&pipeline, &handler).expect("run");
        assert_eq!(single_value(&vars, "B"), Some(42.0));
    }

    #[test]
    fn self_reference_is_rejected_with_exact_message() {
        let req = request(json!([
            {
                "refId": "B",
                "datasource": {"uid": "__expr__"},
                "type": "math",
                "expression": "$B + 1"
            }
        ]));
        let err = Service::new().build_pipeline(&req).expect_err("must fail");
        assert_eq!(
            err.to_string(),
            "expression 'B' cannot reference itself. Must be query or another expression"
        );
    }

    #[test]
    fn missing_dependency_is_rejected_with_exact_message() {
        let req = request(json!([
            {
                "refId": "B",
                "datasource": {"uid": "__expr__"},
                "type": "math",
                "expression": "$A + 1"
            }
        ]));
        let err = Service::new().build_pipeline(&req).expect_err("must fail");
        assert_eq!(err.to_string(), "unable to find dependent node 'A'");
    }

    #[test]
    fn cycle_is_rejected_with_member_list() {
        let req = request(json!([
            {
                "refId": "B",
                "datasource": {"uid": "__expr__"},
                "type": "math",
                "expression": "$C + 1"
            },
            {
                "refId": "C",
                "datasource": {"uid": "__expr__"},
                "type": "math",
                "expression": "$B + 1"
            }
        ]));
        let err = Service::new().build_pipeline(&req).expect_err("must fail");
        assert_eq!(err.to_string(), "cyclic components in expression graph: B, C");
    }

    #[test]
    fn duplicate_ref_id_is_rejected() {
        let req = request(json!([
            {"refId": "A", "datasource": {"uid": "prometheus"}},
            {"refId": "A", "datasource": {"uid": "prometheus"}}
        ]));
        let err = Service::new().build_pipeline(&req).expect_err("must fail");
        assert_eq!(err.to_string(), "duplicate refId 'A'");
    }

    #[test]
    fn classic_condition_input_must_be_datasource() {
        let req = request(json!([
            {"refId": "A", "datasource": {"uid": "prometheus"}},
            {
                "refId": "B",
                "datasource": {"uid": "__expr__"},
                "type": "reduce",
                "expression": "$A",
                "reducer": "last"
            },
            {
                "refId": "C",
                "datasource": {"uid": "__expr__"},
                "type": "classic_conditions",
                "conditions": [{
                    "evaluator": {"type": "gt", "params": [1.0]},
                    "query": {"params": ["B"]},
                    "reducer": {"type": "last"}
                }]
            }
        ]));
        let err = Service::new().build_pipeline(&req).expect_err("must fail");
        assert_eq!(
            err.to_string(),
            "only data source queries may be inputs to a classic condition"
        );
    }

    #[test]
    fn classic_condition_output_may_not_feed_expressions() {
        let req = request(json!([
            {"refId": "A", "datasource": {"uid": "prometheus"}},
            {
                "refId": "B",
                "datasource": {"uid": "__expr__"},
                "type": "classic_conditions",
                "conditions": [{
                    "evaluator": {"type": "gt", "params": [1.0]},
                    "query": {"params": ["A"]},
                    "reducer": {"type": "last"}
                }]
            },
            {
                "refId": "C",
                "datasource": {"uid": "__expr__"},
                "type": "math",
                "expression": "$B + 1"
            }
        ]));
        let err = Service::new().build_pipeline(&req).expect_err("must fail");
        assert_eq!(
            err.to_string(),
            "classic conditions may not be the input for other expressions"
        );
    }

    #[test]
    fn legacy_datasource_id_marks_expressions() {
        let query: Query = serde_json::from_value(json!({
            "refId": "B",
            "datasource": {"uid": "-100"},
            "type": "math",
            "expression": "1"
        }))
        .expect("query json");
        assert!(query.is_expression());

        let query: Query = serde_json::from_value(json!({
            "refId": "A",
            "datasource": {"uid": "prometheus", "type": "prometheus"}
        }))
        .expect("query json");
        assert!(!query.is_expression());
    }

    #[test]
    fn expression_without_type_is_rejected() {
        let req = request(json!([
            {"refId": "B", "datasource": {"uid": "__expr__"}, "expression": "1"}
        ]));
        let err = Service::new().build_pipeline(&req).expect_err("must fail");
        assert!(matches!(err, BuildError::MissingType(ref_id) if ref_id == "B"));
    }

    #[test]
    fn time_range_flows_to_resample_nodes() {
        let req = request(json!([
            {"refId": "A", "datasource": {"uid": "prometheus"}},
            {
                "refId": "B",
                "datasource": {"uid": "__expr__"},
                "type": "resample",
                "timeRange": {"from": 0, "to": 60_000},
                "expression": "$A",
                "window": "10S",
                "downsampler": "mean",
                "upsampler": "fillna"
            }
        ]));
        let service = Service::new();
        let pipeline = service.build_pipeline(&req).expect("build");

        let handler = StaticHandler(HashMap::from([("A".to_owned(), Results::no_data())]));
        let vars = service.execute_pipeline(&pipeline, &handler).expect("run");
        assert!(vars["B"].is_no_data());
    }

    #[test]
    fn datasource_failure_names_the_node() {
        let req = request(json!([
            {"refId": "A", "datasource": {"uid": "prometheus"}}
        ]));
        let service = Service::new();
        let pipeline = service.build_pipeline(&req).expect("build");

        let handler = StaticHandler(HashMap::new());
        let err = service
            .execute_pipeline(&pipeline, &handler)
            .expect_err("must fail");
        assert_eq!(err.to_string(), "failed to query data for 'A'");
    }
}
