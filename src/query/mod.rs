//! Query Compiler
//!
//! Criteria, sort and projection are parsed into an AST, compiled against
//! the composite schema into a typed [`QueryPlan`], rendered to one
//! parameterized statement and executed.

mod ast;
mod compiler;
mod errors;
mod executor;
mod plan;
mod relevance;
mod render;

pub use ast::{
    CompareOp, Criteria, Literal, Projection, Query, SortDirection, SortSpec, HIDREC_KEY,
    JUNCTION_RECID_KEY, RELEVANCE_KEY,
};
pub use compiler::QueryCompiler;
pub use errors::{CompileError, CompileErrorCode, CompileResult};
pub use executor::QueryExecutor;
pub use plan::{
    ColumnExpr, ColumnRole, ColumnSource, HistoryField, JoinArena, JoinHandle, JoinKind,
    OrderExpr, OrderTerm, Pagination, PlanColumn, Predicate, QueryPlan, TableSource, TempSet,
};
pub use relevance::{rank_from_matchinfo, COLUMN_WEIGHT};
pub use render::{render, render_count, RenderedQuery};
