#![forbid(unsafe_code)]

use std::collections::{HashMap, HashSet};
use std::fmt;

use ep_lang::{EvalError, Expr, Functions, LangError};
use ep_reduce::{
    ClassicReducer, Downsampler, ReduceError, ReduceMapper, StrictReducer, Upsampler, parse_rule,
    resample,
};
use ep_value::{
    Fingerprint, Labels, Notice, Number, Results, Scalar, TimeRange, Value, ValueKind, Vars,
};
use regex::Regex;
use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum CommandError {
    #[error("command is missing variable '{0}'")]
    MissingVariable(String),
    #[error(transparent)]
    Lang(#[from] LangError),
    #[error(transparent)]
    Eval(#[from] EvalError),
    #[error(transparent)]
    Reduce(#[from] ReduceError),
    #[error("bad settings for {command} expression '{ref_id}': {message}")]
    BadSettings {
        command: &'static str,
        ref_id: String,
        message: String,
    },
    #[error("expression '{ref_id}' expected series input, got {kind}")]
    NotASeries { ref_id: String, kind: ValueKind },
    #[error("expression '{ref_id}' requires an evaluation time range")]
    MissingTimeRange { ref_id: String },
    #[error("join inputs must be reduced to numbers, got {kind}")]
    JoinInputNotNumbers { kind: ValueKind },
    #[error("merge inputs must share a kind, got {left} and {right}")]
    MergeMixedTypes { left: ValueKind, right: ValueKind },
    #[error("merge does not support {0} input")]
    MergeUnsupportedKind(ValueKind),
    #[error("unsupported conflict resolution '{0}'")]
    UnsupportedConflictResolution(String),
    #[error("unknown expression command type '{0}'")]
    UnknownCommandType(String),
    #[error("sql expressions are executed by an external engine; none is configured")]
    SqlUnsupported,
    #[error(transparent)]
    Regex(#[from] regex::Error),
}

/// Per-evaluation context shared by every node of a pipeline run.
#[derive(Debug, Clone, Copy, Default)]
pub struct ExecContext {
    pub time_range: Option<TimeRange>,
}

/// A single expression node behavior: what it reads from the binding
/// and how it produces its results.
pub trait Command: fmt::Debug + Send + Sync {
    fn needs_vars(&self) -> Vec<String>;
    fn execute(&self, ctx: &ExecContext, vars: &Vars) -> Result<Results, CommandError>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CommandKind {
    Math,
    Reduce,
    Resample,
    ClassicConditions,
    Threshold,
    Join,
    Merge,
    LabelsRewrite,
    Sql,
}

impl fmt::Display for CommandKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Math => "math",
            Self::Reduce => "reduce",
            Self::Resample => "resample",
            Self::ClassicConditions => "classic_conditions",
            Self::Threshold => "threshold",
            Self::Join => "join",
            Self::Merge => "merge",
            Self::LabelsRewrite => "labels_rewrite",
            Self::Sql => "sql",
        };
        f.write_str(name)
    }
}

// ── Math ────────────────────────────────────────────────────────────────

#[derive(Debug)]
pub struct MathCommand {
    ref_id: String,
    expr: Expr,
}

impl MathCommand {
    pub fn new(
        ref_id: impl Into<String>,
        expression: &str,
        functions: &Functions,
    ) -> Result<Self, CommandError> {
        Ok(Self {
            ref_id: ref_id.into(),
            expr: Expr::parse(expression, functions)?,
        })
    }

    #[must_use]
    pub fn ref_id(&self) -> &str {
        &self.ref_id
    }
}

impl Command for MathCommand {
    fn needs_vars(&self) -> Vec<String> {
        self.expr.var_names().to_vec()
    }

    fn execute(&self, _ctx: &ExecContext, vars: &Vars) -> Result<Results, CommandError> {
        Ok(self.expr.execute(vars)?)
    }
}

// ── Reduce ──────────────────────────────────────────────────────────────

#[derive(Debug)]
pub struct ReduceCommand {
    ref_id: String,
    var_name: String,
    reducer: StrictReducer,
    mapper: Option<ReduceMapper>,
}

impl ReduceCommand {
    pub fn new(
        ref_id: impl Into<String>,
        var_name: impl Into<String>,
        reducer: StrictReducer,
        mapper: Option<ReduceMapper>,
    ) -> Self {
        Self {
            ref_id: ref_id.into(),
            var_name: var_name.into(),
            reducer,
            mapper,
        }
    }
}

impl Command for ReduceCommand {
    fn needs_vars(&self) -> Vec<String> {
        vec![self.var_name.clone()]
    }

    fn execute(&self, _ctx: &ExecContext, vars: &Vars) -> Result<Results, CommandError> {
        let input = vars
            .get(&self.var_name)
            .ok_or_else(|| CommandError::MissingVariable(self.var_name.clone()))?;

        let mut out = Vec::with_capacity(input.values.len());
        for value in &input.values {
            match value {
                Value::Series(series) => {
                    let filtered = match self.mapper {
                        Some(mapper) => mapper.apply(series),
                        None => series.clone(),
                    };
                    out.push(Value::Number(self.reducer.reduce(&filtered)));
                }
                Value::Number(_) | Value::Scalar(_) => {
                    // Already reduced data passes through untouched, with
                    // a notice so the user sees the redundant step.
                    tracing::debug!(ref_id = %self.ref_id, var = %self.var_name,
                        "reduce input is already reduced");
                    let mut passed = value.clone();
                    passed.add_notice(Notice::warning(format!(
                        "reduce operation is not needed. Input query or expression {} is already reduced data",
                        self.var_name
                    )));
                    out.push(passed);
                }
                Value::NoData(nd) => out.push(Value::NoData(nd.clone())),
                Value::Table(_) => {
                    return Err(CommandError::NotASeries {
                        ref_id: self.ref_id.clone(),
                        kind: ValueKind::Table,
                    });
                }
            }
        }
        Ok(Results::new(out))
    }
}

// ── Resample ────────────────────────────────────────────────────────────

#[derive(Debug)]
pub struct ResampleCommand {
    ref_id: String,
    var_name: String,
    rule: chrono::Duration,
    downsampler: Downsampler,
    upsampler: Upsampler,
}

impl ResampleCommand {
    pub fn new(
        ref_id: impl Into<String>,
        var_name: impl Into<String>,
        window: &str,
        downsampler: Downsampler,
        upsampler: Upsampler,
    ) -> Result<Self, CommandError> {
        Ok(Self {
            ref_id: ref_id.into(),
            var_name: var_name.into(),
            rule: parse_rule(window)?,
            downsampler,
            upsampler,
        })
    }
}

impl Command for ResampleCommand {
    fn needs_vars(&self) -> Vec<String> {
        vec![self.var_name.clone()]
    }

    fn execute(&self, ctx: &ExecContext, vars: &Vars) -> Result<Results, CommandError> {
        let time_range = ctx.time_range.ok_or_else(|| CommandError::MissingTimeRange {
            ref_id: self.ref_id.clone(),
        })?;
        let input = vars
            .get(&self.var_name)
            .ok_or_else(|| CommandError::MissingVariable(self.var_name.clone()))?;

        let mut out = Vec::with_capacity(input.values.len());
        for value in &input.values {
            match value {
                Value::Series(series) => out.push(Value::Series(resample(
                    series,
                    self.rule,
                    self.downsampler,
                    self.upsampler,
                    time_range,
                )?)),
                Value::NoData(nd) => out.push(Value::NoData(nd.clone())),
                other => {
                    return Err(CommandError::NotASeries {
                        ref_id: self.ref_id.clone(),
                        kind: other.kind(),
                    });
                }
            }
        }
        Ok(Results::new(out))
    }
}

// ── Classic conditions ──────────────────────────────────────────────────

/// Threshold check used by classic conditions. Absent values never fire
/// except against `NoValue`. Range bounds are normalized so parameter
/// order does not matter.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum ClassicEvaluator {
    Above(f64),
    Below(f64),
    WithinRange(f64, f64),
    OutsideRange(f64, f64),
    NoValue,
}

impl ClassicEvaluator {
    #[must_use]
    pub fn evaluate(self, value: Option<f64>) -> bool {
        let Some(v) = value else {
            return matches!(self, Self::NoValue);
        };
        match self {
            Self::Above(t) => v > t,
            Self::Below(t) => v < t,
            Self::WithinRange(a, b) => {
                let (lo, hi) = ordered(a, b);
                v > lo && v < hi
            }
            Self::OutsideRange(a, b) => {
                let (lo, hi) = ordered(a, b);
                v < lo || v > hi
            }
            Self::NoValue => false,
        }
    }
}

fn ordered(a: f64, b: f64) -> (f64, f64) {
    if a <= b { (a, b) } else { (b, a) }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConditionOperator {
    And,
    Or,
}

#[derive(Debug)]
pub struct ClassicCondition {
    pub query_var: String,
    pub reducer: ClassicReducer,
    pub evaluator: ClassicEvaluator,
    pub operator: ConditionOperator,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct EvalMatch {
    value: Option<f64>,
    metric: String,
    labels: Labels,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct ClassicMeta {
    eval_matches: Vec<EvalMatch>,
}

/// Legacy dashboard-alerting conditions: each condition reduces a query
/// to one value per series and checks it, then the per-condition firing
/// states chain with and/or. The output is a single unlabeled number,
/// 1 for firing, with the per-series matches attached as metadata.
#[derive(Debug)]
pub struct ClassicConditionsCommand {
    ref_id: String,
    conditions: Vec<ClassicCondition>,
}

impl ClassicConditionsCommand {
    pub fn new(ref_id: impl Into<String>, conditions: Vec<ClassicCondition>) -> Self {
        Self {
            ref_id: ref_id.into(),
            conditions,
        }
    }
}

impl Command for ClassicConditionsCommand {
    fn needs_vars(&self) -> Vec<String> {
        self.conditions.iter().map(|c| c.query_var.clone()).collect()
    }

    fn execute(&self, _ctx: &ExecContext, vars: &Vars) -> Result<Results, CommandError> {
        let mut fires = false;
        let mut matches = Vec::new();

        for (i, condition) in self.conditions.iter().enumerate() {
            let input = vars
                .get(&condition.query_var)
                .ok_or_else(|| CommandError::MissingVariable(condition.query_var.clone()))?;

            let mut condition_fires = false;
            for value in &input.values {
                let (reduced, metric, labels) = match value {
                    Value::Series(s) => {
                        let metric = if s.labels.is_empty() {
                            "Series".to_owned()
                        } else {
                            s.labels.to_string()
                        };
                        (condition.reducer.reduce(s), metric, s.labels.clone())
                    }
                    Value::Number(n) => {
                        let metric = if n.labels.is_empty() {
                            "Number".to_owned()
                        } else {
                            n.labels.to_string()
                        };
                        (n.value, metric, n.labels.clone())
                    }
                    Value::Scalar(s) => (s.value, "Scalar".to_owned(), Labels::new()),
                    Value::NoData(_) => (None, "NoData".to_owned(), Labels::new()),
                    Value::Table(_) => {
                        return Err(CommandError::NotASeries {
                            ref_id: self.ref_id.clone(),
                            kind: ValueKind::Table,
                        });
                    }
                };
                if condition.evaluator.evaluate(reduced) {
                    condition_fires = true;
                    matches.push(EvalMatch {
                        value: reduced,
                        metric,
                        labels,
                    });
                }
            }
            if input.values.is_empty() && matches!(condition.evaluator, ClassicEvaluator::NoValue) {
                condition_fires = true;
            }

            fires = if i == 0 {
                condition_fires
            } else {
                match condition.operator {
                    ConditionOperator::And => fires && condition_fires,
                    ConditionOperator::Or => fires || condition_fires,
                }
            };
        }

        let mut number = Number::new(Labels::new(), Some(if fires { 1.0 } else { 0.0 }));
        number.metadata = serde_json::to_value(ClassicMeta {
            eval_matches: matches,
        })
        .ok();
        Ok(Results::new(vec![Value::Number(number)]))
    }
}

// ── Threshold and hysteresis ────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ThresholdKind {
    Gt,
    Lt,
    Eq,
    Ne,
    Gte,
    Lte,
    WithinRange,
    OutsideRange,
    WithinRangeIncluded,
    OutsideRangeIncluded,
}

impl ThresholdKind {
    pub fn from_name(ref_id: &str, name: &str) -> Result<Self, CommandError> {
        match name {
            "gt" => Ok(Self::Gt),
            "lt" => Ok(Self::Lt),
            "eq" => Ok(Self::Eq),
            "ne" => Ok(Self::Ne),
            "gte" => Ok(Self::Gte),
            "lte" => Ok(Self::Lte),
            "within_range" => Ok(Self::WithinRange),
            "outside_range" => Ok(Self::OutsideRange),
            "within_range_included" => Ok(Self::WithinRangeIncluded),
            "outside_range_included" => Ok(Self::OutsideRangeIncluded),
            other => Err(CommandError::BadSettings {
                command: "threshold",
                ref_id: ref_id.to_owned(),
                message: format!("unsupported threshold function '{other}'"),
            }),
        }
    }

    #[must_use]
    pub fn param_count(self) -> usize {
        match self {
            Self::Gt | Self::Lt | Self::Eq | Self::Ne | Self::Gte | Self::Lte => 1,
            Self::WithinRange
            | Self::OutsideRange
            | Self::WithinRangeIncluded
            | Self::OutsideRangeIncluded => 2,
        }
    }
}

/// Threshold is sugar over math: the condition compiles to a comparison
/// expression against the input variable and delegates evaluation.
#[derive(Debug)]
pub struct ThresholdCommand {
    math: MathCommand,
}

impl ThresholdCommand {
    pub fn new(
        ref_id: impl Into<String>,
        var_name: &str,
        kind: ThresholdKind,
        params: &[f64],
        functions: &Functions,
    ) -> Result<Self, CommandError> {
        let ref_id = ref_id.into();
        if params.len() < kind.param_count() {
            return Err(CommandError::BadSettings {
                command: "threshold",
                ref_id,
                message: format!(
                    "expected {} parameter(s), got {}",
                    kind.param_count(),
                    params.len()
                ),
            });
        }

        let v = var_name;
        let expression = match kind {
            ThresholdKind::Gt => format!("${{{v}}} > {}", params[0]),
            ThresholdKind::Lt => format!("${{{v}}} < {}", params[0]),
            ThresholdKind::Eq => format!("${{{v}}} == {}", params[0]),
            ThresholdKind::Ne => format!("${{{v}}} != {}", params[0]),
            ThresholdKind::Gte => format!("${{{v}}} >= {}", params[0]),
            ThresholdKind::Lte => format!("${{{v}}} <= {}", params[0]),
            ThresholdKind::WithinRange => {
                format!("${{{v}}} > {} && ${{{v}}} < {}", params[0], params[1])
            }
            ThresholdKind::OutsideRange => {
                format!("${{{v}}} < {} || ${{{v}}} > {}", params[0], params[1])
            }
            ThresholdKind::WithinRangeIncluded => {
                format!("${{{v}}} >= {} && ${{{v}}} <= {}", params[0], params[1])
            }
            ThresholdKind::OutsideRangeIncluded => {
                format!("${{{v}}} <= {} || ${{{v}}} >= {}", params[0], params[1])
            }
        };

        Ok(Self {
            math: MathCommand::new(ref_id, &expression, functions)?,
        })
    }
}

impl Command for ThresholdCommand {
    fn needs_vars(&self) -> Vec<String> {
        self.math.needs_vars()
    }

    fn execute(&self, ctx: &ExecContext, vars: &Vars) -> Result<Results, CommandError> {
        self.math.execute(ctx, vars)
    }
}

/// Two-threshold condition with state: dimensions whose fingerprint is
/// in the loaded set are held against the unloading threshold, everyone
/// else against the loading threshold.
#[derive(Debug)]
pub struct HysteresisCommand {
    var_name: String,
    loading: ThresholdCommand,
    unloading: ThresholdCommand,
    loaded_dimensions: HashSet<Fingerprint>,
}

impl HysteresisCommand {
    pub fn new(
        var_name: impl Into<String>,
        loading: ThresholdCommand,
        unloading: ThresholdCommand,
        loaded_dimensions: HashSet<Fingerprint>,
    ) -> Self {
        Self {
            var_name: var_name.into(),
            loading,
            unloading,
            loaded_dimensions,
        }
    }
}

impl Command for HysteresisCommand {
    fn needs_vars(&self) -> Vec<String> {
        vec![self.var_name.clone()]
    }

    fn execute(&self, ctx: &ExecContext, vars: &Vars) -> Result<Results, CommandError> {
        let input = vars
            .get(&self.var_name)
            .ok_or_else(|| CommandError::MissingVariable(self.var_name.clone()))?;

        if self.loaded_dimensions.is_empty() || input.is_no_data() {
            return self.loading.execute(ctx, vars);
        }

        let (loaded, unloaded): (Vec<Value>, Vec<Value>) = input
            .values
            .iter()
            .cloned()
            .partition(|v| self.loaded_dimensions.contains(&v.labels().fingerprint()));

        if loaded.is_empty() {
            return self.loading.execute(ctx, vars);
        }
        if unloaded.is_empty() {
            return self.unloading.execute(ctx, vars);
        }

        // Each leg sees only its partition; the caller's binding is
        // never mutated.
        let mut scoped = vars.clone();
        scoped.insert(self.var_name.clone(), Results::new(unloaded));
        let mut out = self.loading.execute(ctx, &scoped)?;

        scoped.insert(self.var_name.clone(), Results::new(loaded));
        let mut held = self.unloading.execute(ctx, &scoped)?;
        out.values.append(&mut held.values);
        Ok(out)
    }
}

// ── Join ────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JoinType {
    Inner,
    Left,
}

impl JoinType {
    pub fn from_name(ref_id: &str, name: &str) -> Result<Self, CommandError> {
        match name {
            "inner" => Ok(Self::Inner),
            "left" | "outer" => Ok(Self::Left),
            other => Err(CommandError::BadSettings {
                command: "join",
                ref_id: ref_id.to_owned(),
                message: format!("unsupported join type '{other}'"),
            }),
        }
    }
}

/// Row-wise join of two number sets on a label subset, evaluating a math
/// expression per matched pair. Left rows with no partner are skipped on
/// an inner join and paired with NaN on a left join.
#[derive(Debug)]
pub struct JoinCommand {
    left_var: String,
    right_var: String,
    on: Vec<String>,
    join_type: JoinType,
    expr: Expr,
}

impl JoinCommand {
    pub fn new(
        ref_id: impl Into<String>,
        left_var: impl Into<String>,
        right_var: impl Into<String>,
        on: Vec<String>,
        join_type: JoinType,
        expression: &str,
        functions: &Functions,
    ) -> Result<Self, CommandError> {
        let ref_id = ref_id.into();
        let left_var = left_var.into();
        let right_var = right_var.into();
        if left_var == right_var {
            return Err(CommandError::BadSettings {
                command: "join",
                ref_id,
                message: "left and right inputs must differ".to_owned(),
            });
        }
        let expr = Expr::parse(expression, functions)?;
        for name in expr.var_names() {
            if *name != left_var && *name != right_var {
                return Err(CommandError::BadSettings {
                    command: "join",
                    ref_id,
                    message: format!(
                        "expression references '{name}', which is neither join input"
                    ),
                });
            }
        }
        Ok(Self {
            left_var,
            right_var,
            on,
            join_type,
            expr,
        })
    }
}

impl Command for JoinCommand {
    fn needs_vars(&self) -> Vec<String> {
        vec![self.left_var.clone(), self.right_var.clone()]
    }

    fn execute(&self, _ctx: &ExecContext, vars: &Vars) -> Result<Results, CommandError> {
        let left = vars
            .get(&self.left_var)
            .ok_or_else(|| CommandError::MissingVariable(self.left_var.clone()))?;
        let right = vars
            .get(&self.right_var)
            .ok_or_else(|| CommandError::MissingVariable(self.right_var.clone()))?;

        if left.is_no_data() || right.is_no_data() {
            return Ok(Results::no_data());
        }
        for value in left.values.iter().chain(&right.values) {
            if !matches!(value, Value::Number(_)) {
                return Err(CommandError::JoinInputNotNumbers { kind: value.kind() });
            }
        }

        // First writer wins on duplicate keys; rows missing a join label
        // can never match.
        let mut by_key: HashMap<Fingerprint, &Value> = HashMap::new();
        for value in &right.values {
            if let Some(key) = value.labels().fingerprint_of(&self.on) {
                by_key.entry(key).or_insert(value);
            }
        }

        let mut out = Vec::new();
        for left_value in &left.values {
            let partner = left_value
                .labels()
                .fingerprint_of(&self.on)
                .and_then(|key| by_key.get(&key).copied());

            let (right_value, right_labels) = match partner {
                Some(v) => (v.clone(), v.labels().clone()),
                None => match self.join_type {
                    JoinType::Inner => continue,
                    JoinType::Left => (
                        Value::Scalar(Scalar::new(Some(f64::NAN))),
                        Labels::new(),
                    ),
                },
            };

            let mut scoped = Vars::new();
            scoped.insert(
                self.left_var.clone(),
                Results::new(vec![left_value.clone()]),
            );
            scoped.insert(self.right_var.clone(), Results::new(vec![right_value]));

            let row = self.expr.execute(&scoped)?;
            let labels = left_value.labels().merged_with(&right_labels);
            for mut value in row.values {
                value.set_labels(labels.clone());
                out.push(value);
            }
        }
        Ok(Results::new(out))
    }
}

// ── Merge ───────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConflictResolution {
    Drop,
}

impl ConflictResolution {
    pub fn from_name(name: &str) -> Result<Self, CommandError> {
        match name {
            "drop" => Ok(Self::Drop),
            other => Err(CommandError::UnsupportedConflictResolution(other.to_owned())),
        }
    }
}

/// Concatenate several inputs into one result set. Values whose label
/// fingerprint already arrived from a *different* input are dropped;
/// duplicates within one input are preserved as-is.
#[derive(Debug)]
pub struct MergeCommand {
    var_names: Vec<String>,
    conflict_resolution: ConflictResolution,
}

impl MergeCommand {
    pub fn new(var_names: Vec<String>, conflict_resolution: ConflictResolution) -> Self {
        Self {
            var_names,
            conflict_resolution,
        }
    }
}

impl Command for MergeCommand {
    fn needs_vars(&self) -> Vec<String> {
        self.var_names.clone()
    }

    fn execute(&self, _ctx: &ExecContext, vars: &Vars) -> Result<Results, CommandError> {
        let mut out: Vec<Value> = Vec::new();
        let mut seen: HashMap<Fingerprint, usize> = HashMap::new();
        let mut merged_kind: Option<ValueKind> = None;

        for (input_idx, name) in self.var_names.iter().enumerate() {
            let input = vars
                .get(name)
                .ok_or_else(|| CommandError::MissingVariable(name.clone()))?;
            for value in &input.values {
                match value.kind() {
                    ValueKind::NoData => continue,
                    ValueKind::Series | ValueKind::Number => {}
                    other => return Err(CommandError::MergeUnsupportedKind(other)),
                }
                match merged_kind {
                    None => merged_kind = Some(value.kind()),
                    Some(kind) if kind != value.kind() => {
                        return Err(CommandError::MergeMixedTypes {
                            left: kind,
                            right: value.kind(),
                        });
                    }
                    Some(_) => {}
                }

                let fp = value.labels().fingerprint();
                match seen.get(&fp) {
                    Some(&first_idx) if first_idx != input_idx => match self.conflict_resolution {
                        ConflictResolution::Drop => {
                            tracing::debug!(input = %name, labels = %value.labels(),
                                "merge dropped conflicting dimension");
                            continue;
                        }
                    },
                    Some(_) => {}
                    None => {
                        seen.insert(fp, input_idx);
                    }
                }
                out.push(value.clone());
            }
        }

        if out.is_empty() {
            Ok(Results::no_data())
        } else {
            Ok(Results::new(out))
        }
    }
}

// ── Labels rewrite ──────────────────────────────────────────────────────

pub const ORIGINAL_FP_LABEL: &str = "__original_fp__";

#[derive(Debug)]
pub enum RewriteRule {
    Remove {
        label: String,
    },
    Replace {
        label: String,
        pattern: Option<Regex>,
        value: String,
    },
    Add {
        label: String,
        value: String,
        template: bool,
    },
}

impl RewriteRule {
    fn apply(&self, labels: &mut Labels, original: &Labels) {
        match self {
            Self::Remove { label } => {
                labels.remove(label);
            }
            Self::Replace {
                label,
                pattern,
                value,
            } => {
                let Some(existing) = labels.get(label).map(str::to_owned) else {
                    return;
                };
                let replaced = match pattern {
                    Some(re) => re.replace_all(&existing, value.as_str()).into_owned(),
                    None => value.clone(),
                };
                labels.insert(label.clone(), replaced);
            }
            Self::Add {
                label,
                value,
                template,
            } => {
                if original.contains_key(label) {
                    return;
                }
                let rendered = if *template {
                    expand_template(value, original)
                } else {
                    value.clone()
                };
                labels.insert(label.clone(), rendered);
            }
        }
    }
}

/// Expand `{{key}}` placeholders against a label set. Unknown keys
/// render as the empty string.
fn expand_template(template: &str, labels: &Labels) -> String {
    let mut out = String::with_capacity(template.len());
    let mut rest = template;
    while let Some(start) = rest.find("{{") {
        out.push_str(&rest[..start]);
        let after = &rest[start + 2..];
        match after.find("}}") {
            Some(end) => {
                let key = after[..end].trim();
                if let Some(value) = labels.get(key) {
                    out.push_str(value);
                }
                rest = &after[end + 2..];
            }
            None => {
                out.push_str(&rest[start..]);
                return out;
            }
        }
    }
    out.push_str(rest);
    out
}

struct FirstWriter {
    index: usize,
    original_fp: Fingerprint,
    marked: bool,
}

/// Rewrite the label sets of every value in an input. When two rewritten
/// values collide on the same fingerprint, each collider is disambiguated
/// with its pre-rewrite fingerprint under `__original_fp__` instead of
/// being dropped.
#[derive(Debug)]
pub struct LabelsRewriteCommand {
    var_name: String,
    rules: Vec<RewriteRule>,
}

impl LabelsRewriteCommand {
    pub fn new(var_name: impl Into<String>, rules: Vec<RewriteRule>) -> Self {
        Self {
            var_name: var_name.into(),
            rules,
        }
    }
}

impl Command for LabelsRewriteCommand {
    fn needs_vars(&self) -> Vec<String> {
        vec![self.var_name.clone()]
    }

    fn execute(&self, _ctx: &ExecContext, vars: &Vars) -> Result<Results, CommandError> {
        let input = vars
            .get(&self.var_name)
            .ok_or_else(|| CommandError::MissingVariable(self.var_name.clone()))?;

        let mut out: Vec<Value> = Vec::new();
        let mut seen: HashMap<Fingerprint, FirstWriter> = HashMap::new();

        for value in &input.values {
            if matches!(value, Value::NoData(_)) {
                out.push(value.clone());
                continue;
            }

            let original = value.labels().clone();
            let original_fp = original.fingerprint();
            let mut labels = original.clone();
            for rule in &self.rules {
                rule.apply(&mut labels, &original);
            }

            let mut rewritten = value.clone();
            let new_fp = labels.fingerprint();
            match seen.get_mut(&new_fp) {
                None => {
                    rewritten.set_labels(labels);
                    out.push(rewritten);
                    seen.insert(
                        new_fp,
                        FirstWriter {
                            index: out.len() - 1,
                            original_fp,
                            marked: false,
                        },
                    );
                }
                Some(first) => {
                    tracing::debug!(labels = %labels,
                        "labels rewrite collision, disambiguating with original fingerprint");
                    if !first.marked {
                        let mut first_labels = out[first.index].labels().clone();
                        first_labels.insert(ORIGINAL_FP_LABEL, first.original_fp.to_string());
                        out[first.index].set_labels(first_labels);
                        first.marked = true;
                    }
                    let mut collider_labels = labels;
                    collider_labels.insert(ORIGINAL_FP_LABEL, original_fp.to_string());
                    rewritten.set_labels(collider_labels);
                    out.push(rewritten);
                }
            }
        }
        Ok(Results::new(out))
    }
}

// ── Sql ─────────────────────────────────────────────────────────────────

/// SQL expressions are parsed for their table references so the graph
/// can wire dependencies, but execution requires an external engine.
#[derive(Debug)]
pub struct SqlCommand {
    deps: Vec<String>,
}

impl SqlCommand {
    pub fn new(expression: &str) -> Result<Self, CommandError> {
        let var_ref = Regex::new(r"\$([A-Za-z_][A-Za-z0-9_]*)")?;
        let mut deps = Vec::new();
        for capture in var_ref.captures_iter(expression) {
            let name = &capture[1];
            if !deps.iter().any(|d| d == name) {
                deps.push(name.to_owned());
            }
        }
        Ok(Self { deps })
    }
}

impl Command for SqlCommand {
    fn needs_vars(&self) -> Vec<String> {
        self.deps.clone()
    }

    fn execute(&self, _ctx: &ExecContext, _vars: &Vars) -> Result<Results, CommandError> {
        Err(CommandError::SqlUnsupported)
    }
}

// ── Wire parsing ────────────────────────────────────────────────────────

#[derive(Deserialize)]
struct MathQuery {
    expression: String,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct ReduceQuery {
    expression: String,
    reducer: String,
    #[serde(default)]
    settings: Option<ReduceSettings>,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct ReduceSettings {
    mode: String,
    #[serde(default)]
    replace_with_value: Option<f64>,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct ResampleQuery {
    expression: String,
    window: String,
    downsampler: String,
    upsampler: String,
}

#[derive(Deserialize)]
struct ClassicQuery {
    conditions: Vec<ClassicConditionJson>,
}

#[derive(Deserialize)]
struct ClassicConditionJson {
    evaluator: EvaluatorJson,
    #[serde(default)]
    operator: Option<OperatorJson>,
    query: QueryRefJson,
    reducer: ReducerJson,
}

#[derive(Deserialize)]
struct EvaluatorJson {
    #[serde(rename = "type")]
    kind: String,
    #[serde(default)]
    params: Vec<Option<f64>>,
}

#[derive(Deserialize)]
struct OperatorJson {
    #[serde(rename = "type")]
    kind: String,
}

#[derive(Deserialize)]
struct QueryRefJson {
    params: Vec<String>,
}

#[derive(Deserialize)]
struct ReducerJson {
    #[serde(rename = "type")]
    kind: String,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct ThresholdQuery {
    expression: String,
    conditions: Vec<ThresholdConditionJson>,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct ThresholdConditionJson {
    evaluator: EvaluatorJson,
    #[serde(default)]
    unload_evaluator: Option<EvaluatorJson>,
    #[serde(default)]
    loaded_dimensions: Option<Vec<u64>>,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct JoinQuery {
    left: String,
    right: String,
    on: Vec<String>,
    #[serde(default)]
    join_type: Option<String>,
    expression: String,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct MergeQuery {
    expressions: Vec<String>,
    #[serde(default)]
    conflict_resolution: Option<String>,
}

#[derive(Deserialize)]
struct LabelsRewriteQuery {
    expression: String,
    rules: Vec<RewriteRuleJson>,
}

#[derive(Deserialize)]
struct RewriteRuleJson {
    #[serde(rename = "type")]
    kind: String,
    label: String,
    #[serde(rename = "match", default)]
    pattern: Option<String>,
    #[serde(default)]
    value: Option<String>,
    #[serde(default)]
    template: Option<String>,
}

#[derive(Deserialize)]
struct SqlQuery {
    expression: String,
}

/// `"$A"` and `"${A}"` style input references; a bare name passes
/// through unchanged.
fn parse_var_expression(expression: &str) -> String {
    let trimmed = expression.trim();
    if let Some(inner) = trimmed.strip_prefix("${") {
        if let Some(name) = inner.strip_suffix('}') {
            return name.to_owned();
        }
    }
    if let Some(name) = trimmed.strip_prefix('$') {
        return name.to_owned();
    }
    trimmed.to_owned()
}

fn bad_settings(
    command: &'static str,
    ref_id: &str,
    message: impl Into<String>,
) -> CommandError {
    CommandError::BadSettings {
        command,
        ref_id: ref_id.to_owned(),
        message: message.into(),
    }
}

fn decode<T: serde::de::DeserializeOwned>(
    command: &'static str,
    ref_id: &str,
    body: &serde_json::Value,
) -> Result<T, CommandError> {
    serde_json::from_value(body.clone()).map_err(|e| bad_settings(command, ref_id, e.to_string()))
}

fn classic_evaluator(
    command: &'static str,
    ref_id: &str,
    json: &EvaluatorJson,
) -> Result<ClassicEvaluator, CommandError> {
    let param = |i: usize| -> Result<f64, CommandError> {
        json.params
            .get(i)
            .copied()
            .flatten()
            .ok_or_else(|| bad_settings(command, ref_id, format!("evaluator is missing parameter {i}")))
    };
    match json.kind.as_str() {
        "gt" => Ok(ClassicEvaluator::Above(param(0)?)),
        "lt" => Ok(ClassicEvaluator::Below(param(0)?)),
        "within_range" => Ok(ClassicEvaluator::WithinRange(param(0)?, param(1)?)),
        "outside_range" => Ok(ClassicEvaluator::OutsideRange(param(0)?, param(1)?)),
        "no_value" => Ok(ClassicEvaluator::NoValue),
        other => Err(bad_settings(
            command,
            ref_id,
            format!("unknown evaluator type '{other}'"),
        )),
    }
}

fn threshold_params(
    ref_id: &str,
    json: &EvaluatorJson,
    kind: ThresholdKind,
) -> Result<Vec<f64>, CommandError> {
    let mut params = Vec::with_capacity(kind.param_count());
    for i in 0..kind.param_count() {
        params.push(json.params.get(i).copied().flatten().ok_or_else(|| {
            bad_settings("threshold", ref_id, format!("evaluator is missing parameter {i}"))
        })?);
    }
    Ok(params)
}

fn parse_threshold_leg(
    ref_id: &str,
    var_name: &str,
    json: &EvaluatorJson,
    functions: &Functions,
) -> Result<ThresholdCommand, CommandError> {
    let kind = ThresholdKind::from_name(ref_id, &json.kind)?;
    let params = threshold_params(ref_id, json, kind)?;
    ThresholdCommand::new(ref_id, var_name, kind, &params, functions)
}

/// Decode one wire query body into an executable command.
pub fn parse_command(
    ref_id: &str,
    command_type: &str,
    body: &serde_json::Value,
    functions: &Functions,
) -> Result<(CommandKind, Box<dyn Command>), CommandError> {
    match command_type {
        "math" => {
            let q: MathQuery = decode("math", ref_id, body)?;
            Ok((
                CommandKind::Math,
                Box::new(MathCommand::new(ref_id, &q.expression, functions)?),
            ))
        }
        "reduce" => {
            let q: ReduceQuery = decode("reduce", ref_id, body)?;
            let reducer = StrictReducer::from_name(&q.reducer)?;
            let mapper = match &q.settings {
                None => None,
                Some(settings) => match settings.mode.as_str() {
                    "" => None,
                    "dropNN" => Some(ReduceMapper::DropNonNumber),
                    "replaceNN" => {
                        let replacement = settings.replace_with_value.ok_or_else(|| {
                            bad_settings("reduce", ref_id, "replaceNN mode needs replaceWithValue")
                        })?;
                        Some(ReduceMapper::ReplaceNonNumberWithValue(replacement))
                    }
                    other => {
                        return Err(bad_settings(
                            "reduce",
                            ref_id,
                            format!("unknown reduce mode '{other}'"),
                        ));
                    }
                },
            };
            Ok((
                CommandKind::Reduce,
                Box::new(ReduceCommand::new(
                    ref_id,
                    parse_var_expression(&q.expression),
                    reducer,
                    mapper,
                )),
            ))
        }
        "resample" => {
            let q: ResampleQuery = decode("resample", ref_id, body)?;
            Ok((
                CommandKind::Resample,
                Box::new(ResampleCommand::new(
                    ref_id,
                    parse_var_expression(&q.expression),
                    &q.window,
                    Downsampler::from_name(&q.downsampler)?,
                    Upsampler::from_name(&q.upsampler)?,
                )?),
            ))
        }
        "classic_conditions" => {
            let q: ClassicQuery = decode("classic_conditions", ref_id, body)?;
            if q.conditions.is_empty() {
                return Err(bad_settings(
                    "classic_conditions",
                    ref_id,
                    "at least one condition is required",
                ));
            }
            let mut conditions = Vec::with_capacity(q.conditions.len());
            for json in &q.conditions {
                let query_var = json.query.params.first().ok_or_else(|| {
                    bad_settings("classic_conditions", ref_id, "condition has no query refId")
                })?;
                let operator = match json.operator.as_ref().map(|o| o.kind.as_str()) {
                    None | Some("and") => ConditionOperator::And,
                    Some("or") => ConditionOperator::Or,
                    Some(other) => {
                        return Err(bad_settings(
                            "classic_conditions",
                            ref_id,
                            format!("unknown condition operator '{other}'"),
                        ));
                    }
                };
                conditions.push(ClassicCondition {
                    query_var: parse_var_expression(query_var),
                    reducer: ClassicReducer::from_name(&json.reducer.kind)?,
                    evaluator: classic_evaluator("classic_conditions", ref_id, &json.evaluator)?,
                    operator,
                });
            }
            Ok((
                CommandKind::ClassicConditions,
                Box::new(ClassicConditionsCommand::new(ref_id, conditions)),
            ))
        }
        "threshold" => {
            let q: ThresholdQuery = decode("threshold", ref_id, body)?;
            let condition = q.conditions.first().ok_or_else(|| {
                bad_settings("threshold", ref_id, "at least one condition is required")
            })?;
            let var_name = parse_var_expression(&q.expression);
            let loading = parse_threshold_leg(ref_id, &var_name, &condition.evaluator, functions)?;

            match &condition.unload_evaluator {
                None => Ok((CommandKind::Threshold, Box::new(loading))),
                Some(unload) => {
                    let unloading = parse_threshold_leg(ref_id, &var_name, unload, functions)?;
                    let loaded_dimensions = condition
                        .loaded_dimensions
                        .iter()
                        .flatten()
                        .map(|fp| Fingerprint(*fp))
                        .collect();
                    Ok((
                        CommandKind::Threshold,
                        Box::new(HysteresisCommand::new(
                            var_name,
                            loading,
                            unloading,
                            loaded_dimensions,
                        )),
                    ))
                }
            }
        }
        "join" => {
            let q: JoinQuery = decode("join", ref_id, body)?;
            let join_type = match q.join_type.as_deref() {
                None => JoinType::Inner,
                Some(name) => JoinType::from_name(ref_id, name)?,
            };
            Ok((
                CommandKind::Join,
                Box::new(JoinCommand::new(
                    ref_id,
                    parse_var_expression(&q.left),
                    parse_var_expression(&q.right),
                    q.on,
                    join_type,
                    &q.expression,
                    functions,
                )?),
            ))
        }
        "merge" => {
            let q: MergeQuery = decode("merge", ref_id, body)?;
            if q.expressions.is_empty() {
                return Err(bad_settings("merge", ref_id, "at least one input is required"));
            }
            let conflict = match q.conflict_resolution.as_deref() {
                None => ConflictResolution::Drop,
                Some(name) => ConflictResolution::from_name(name)?,
            };
            let vars = q.expressions.iter().map(|e| parse_var_expression(e)).collect();
            Ok((
                CommandKind::Merge,
                Box::new(MergeCommand::new(vars, conflict)),
            ))
        }
        "labels_rewrite" => {
            let q: LabelsRewriteQuery = decode("labels_rewrite", ref_id, body)?;
            let mut rules = Vec::with_capacity(q.rules.len());
            for json in q.rules {
                let rule = match json.kind.as_str() {
                    "remove" => RewriteRule::Remove { label: json.label },
                    "replace" => RewriteRule::Replace {
                        label: json.label,
                        pattern: json.pattern.as_deref().map(Regex::new).transpose()?,
                        value: json.value.unwrap_or_default(),
                    },
                    "add" => match (json.value, json.template) {
                        (_, Some(template)) => RewriteRule::Add {
                            label: json.label,
                            value: template,
                            template: true,
                        },
                        (Some(value), None) => RewriteRule::Add {
                            label: json.label,
                            value,
                            template: false,
                        },
                        (None, None) => {
                            return Err(bad_settings(
                                "labels_rewrite",
                                ref_id,
                                "add rule needs a value or a template",
                            ));
                        }
                    },
                    other => {
                        return Err(bad_settings(
                            "labels_rewrite",
                            ref_id,
                            format!("unknown rewrite rule type '{other}'"),
                        ));
                    }
                };
                rules.push(rule);
            }
            Ok((
                CommandKind::LabelsRewrite,
                Box::new(LabelsRewriteCommand::new(
                    parse_var_expression(&q.expression),
                    rules,
                )),
            ))
        }
        "sql" => {
            let q: SqlQuery = decode("sql", ref_id, body)?;
            Ok((CommandKind::Sql, Box::new(SqlCommand::new(&q.expression)?)))
        }
        other => Err(CommandError::UnknownCommandType(other.to_owned())),
    }
}
