//! Query model, normalization and parameter binding.
//!
//! A [`Query`] is parsed once per distinct SQL string and shared; a
//! [`ParamBinder`] turns caller-supplied values into an ordered [`ParamSet`]
//! for each execution.

pub mod binder;
pub mod parser;
mod types;

pub use binder::ParamBinder;
pub use parser::parse_query;
pub use types::{
    BindValue, BoundParam, CoerceError, ParamSet, ParamType, Query, QueryKind, TypedValue,
};
