#![forbid(unsafe_code)]

//! Facade over the exprpipe workspace crates. Most users only need the
//! [`Service`] to build and run pipelines, a [`DataSourceHandler`] for
//! their backend, and the value types for the results.

pub use ep_command::{
    ClassicCondition, ClassicConditionsCommand, ClassicEvaluator, Command, CommandError, CommandKind,
    ConditionOperator, ConflictResolution, ExecContext, HysteresisCommand, JoinCommand, JoinType,
    LabelsRewriteCommand, MathCommand, MergeCommand, ORIGINAL_FP_LABEL, ReduceCommand,
    ResampleCommand, RewriteRule, SqlCommand, ThresholdCommand, ThresholdKind, parse_command,
};
pub use ep_graph::{
    BuildError, DataSourceHandler, DataSourceRef, EXPRESSION_DATASOURCE_UID, ExecuteError,
    LEGACY_EXPRESSION_DATASOURCE_UID, Node, NodeKind, Pipeline, Query, RawTimeRange, Request,
    Service,
};
pub use ep_lang::{BinaryOp, EvalError, Expr, FuncArg, FuncDef, Functions, LangError, ReturnKind};
pub use ep_reduce::{
    ClassicReducer, Downsampler, ReduceError, ReduceMapper, StrictReducer, Upsampler, parse_rule,
    resample,
};
pub use ep_value::{
    Fingerprint, Labels, NoData, Notice, Number, Point, Results, Scalar, Series, Severity,
    TableData, TimeRange, Value, ValueError, ValueKind, Vars,
};
