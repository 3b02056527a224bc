//! Composable reader filters.
//!
//! A filter owns its parent reader and projects a different view of the
//! same dataset; the chain is a simple linked list exposed through
//! [`PlaneSeparator::parent`]-style accessors.

mod plane_separator;

pub use self::plane_separator::PlaneSeparator;
