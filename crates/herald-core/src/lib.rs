//! # herald-core
//!
//! Shared building blocks for the Herald report cache.
//!
//! Every data source is reduced to a [`RawTable`], turned into a canonical
//! [`RowSet`] by the [`Normalizer`], filtered by a [`FilterEvaluator`] and
//! sliced into pages by [`paginate`]. The same pipeline runs whether the rows
//! came from a live backend fetch or from a cached full dataset, so the
//! response contract does not depend on the tier that served it.
//!
//! ```ignore
//! use herald_core::{FilterSet, InMemoryEvaluator, FilterEvaluator, paginate};
//!
//! let predicates = filters.resolve("inventory", &fields, UnknownFilterPolicy::Reject)?;
//! let filtered = InMemoryEvaluator.apply(row_set, &predicates);
//! let page = paginate(filtered.rows, 1, 50)?;
//! ```

pub mod error;
pub mod filter;
pub mod normalize;
pub mod pagination;
pub mod rowset;
pub mod value;

pub use error::{ErrorCategory, HeraldError};
pub use filter::{
    FieldMatch, FilterEvaluator, FilterField, FilterOp, FilterSet, InMemoryEvaluator, Predicate,
    PredicateSet, PushedDownEvaluator, UnknownFilterPolicy,
};
pub use normalize::{Normalizer, NormalizerOptions};
pub use pagination::{Page, paginate};
pub use rowset::{RawTable, Row, RowSet};
pub use value::CellValue;

/// Convenience result alias used across Herald crates.
pub type Result<T> = std::result::Result<T, HeraldError>;
