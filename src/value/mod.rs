//! # Value Kernel
//!
//! Primary values, three-valued logic, coercion, comparison and arithmetic.
//! Everything downstream of the parser works in terms of these types; the
//! comparison rules here are also the basis for sorting and grouping keys
//! (see `query::sort_value`).

pub mod compare;
pub mod datetime;
pub mod primary;
pub mod ternary;

pub use compare::{
    all_matches, any_matches, calculate, compare, compare_combinedly, compare_row_values, equal,
    is, like, ArithmeticOp, ComparisonOp, ComparisonResult,
};
pub use datetime::{datetime_to_float, datetime_to_string, float_to_datetime, str_to_datetime};
pub use primary::Primary;
pub use ternary::Ternary;
