//! Query construction and post-query matching.
//!
//! A subscription's specs are compiled twice:
//! - by [`QueryBuilder`] into a [`FactQuery`] the backend executes, and
//! - by [`PostQueryMatcher`] into in-memory evaluators for the free-form
//!   filter predicates the backend cannot evaluate.

mod builder;
mod filter;
mod matcher;

pub use builder::{Condition, FactQuery, FactSpec, Param, ParamRef, QueryBuilder};
pub use filter::FilterExpr;
pub use matcher::{PostQueryMatcher, SpecEvaluator};
