//! Data-holder abstraction: a uniform interface over heterogeneous in-process frame types
//! that executes projection and filter pushdown in the frame's own compute layer.
//!
//! Per the design notes, variants are dispatched through one tagged enum rather than a
//! trait-object hierarchy — the variant set is closed and small.

mod arrow_holder;
#[cfg(feature = "polars")]
mod polars_holder;

pub use arrow_holder::{ArrowLazyHolder, ArrowTableHolder, LazyArrowSource};
#[cfg(feature = "polars")]
pub use polars_holder::{PolarsEagerHolder, PolarsLazyHolder};

use std::collections::HashMap;
use std::sync::Arc;

use arrow::datatypes::SchemaRef;
use arrow::record_batch::RecordBatchReader;

use crate::config::StatisticsSpec;
use crate::error::Result;
use crate::filter::FilterNode;
use crate::statistics::StatTuple;

/// `projected_columns` from spec.md §4.1: either every column, or an explicit subset.
#[derive(Debug, Clone)]
pub enum Projection {
    All,
    Columns(Vec<String>),
}

impl Projection {
    pub fn is_empty_and_no_filters(&self, filters: &HashMap<usize, FilterNode>) -> bool {
        matches!(self, Projection::Columns(c) if c.is_empty()) && filters.is_empty()
    }
}

/// The closed set of frame-backed holder variants (spec.md §3, "Variants").
pub enum Holder {
    ArrowTable(ArrowTableHolder),
    ArrowLazy(ArrowLazyHolder),
    #[cfg(feature = "polars")]
    PolarsEager(PolarsEagerHolder),
    #[cfg(feature = "polars")]
    PolarsLazy(PolarsLazyHolder),
}

impl Holder {
    pub fn schema(&self) -> SchemaRef {
        match self {
            Holder::ArrowTable(h) => h.schema(),
            Holder::ArrowLazy(h) => h.schema(),
            #[cfg(feature = "polars")]
            Holder::PolarsEager(h) => h.schema(),
            #[cfg(feature = "polars")]
            Holder::PolarsLazy(h) => h.schema(),
        }
    }

    pub fn num_rows(&self) -> Option<usize> {
        match self {
            Holder::ArrowTable(h) => h.num_rows(),
            Holder::ArrowLazy(_) => None,
            #[cfg(feature = "polars")]
            Holder::PolarsEager(h) => h.num_rows(),
            #[cfg(feature = "polars")]
            Holder::PolarsLazy(_) => None,
        }
    }

    pub fn column_names(&self) -> Vec<String> {
        self.schema()
            .fields()
            .iter()
            .map(|f| f.name().clone())
            .collect()
    }

    /// Whether `produce_filtered` may be invoked concurrently and repeatedly
    /// (spec.md GLOSSARY, "Reusable holder").
    pub fn is_reusable(&self) -> bool {
        match self {
            Holder::ArrowTable(_) => true,
            Holder::ArrowLazy(_) => false,
            #[cfg(feature = "polars")]
            Holder::PolarsEager(_) => true,
            #[cfg(feature = "polars")]
            Holder::PolarsLazy(_) => true,
        }
    }

    /// Produces the (projected, filtered) stream along with whatever filters this holder
    /// could not push down natively — the residual the caller (normally [`crate::scan_adapter::ScanAdapter`])
    /// must report back to the engine so it applies them itself (spec.md §4.5, step 2).
    pub fn produce_filtered(
        &self,
        projected: Projection,
        filters: &HashMap<usize, FilterNode>,
    ) -> Result<(Box<dyn RecordBatchReader + Send>, HashMap<usize, FilterNode>)> {
        if projected.is_empty_and_no_filters(filters) {
            return Ok((empty_schema_stream(), HashMap::new()));
        }
        match self {
            Holder::ArrowTable(h) => h.produce_filtered(projected, filters),
            Holder::ArrowLazy(h) => h.produce_filtered(projected, filters),
            #[cfg(feature = "polars")]
            Holder::PolarsEager(h) => h.produce_filtered(projected, filters),
            #[cfg(feature = "polars")]
            Holder::PolarsLazy(h) => h.produce_filtered(projected, filters),
        }
    }

    pub fn compute_statistics(&self, spec: &StatisticsSpec) -> Result<Vec<StatTuple>> {
        let column_names = self.column_names();
        let schema = self.schema();
        let is_numeric = |name: &str| {
            schema
                .field_with_name(name)
                .map(|f| crate::statistics::is_numeric_type(f.data_type()))
                .unwrap_or(false)
        };
        let targets = spec.resolve(&column_names, is_numeric)?;
        if targets.is_empty() {
            return Ok(Vec::new());
        }
        match self {
            Holder::ArrowTable(h) => h.compute_statistics(&targets),
            Holder::ArrowLazy(_) => Ok(Vec::new()),
            #[cfg(feature = "polars")]
            Holder::PolarsEager(h) => h.compute_statistics(&targets),
            #[cfg(feature = "polars")]
            Holder::PolarsLazy(_) => Ok(Vec::new()),
        }
    }
}

/// The engine's schema-probe convention (spec.md §4.1): an empty projection with no
/// filters yields a zero-column, zero-batch stream.
fn empty_schema_stream() -> Box<dyn RecordBatchReader + Send> {
    use arrow::datatypes::Schema;
    let schema = Arc::new(Schema::empty());
    Box::new(arrow::record_batch::RecordBatchIterator::new(
        std::iter::empty::<std::result::Result<arrow::record_batch::RecordBatch, arrow::error::ArrowError>>(),
        schema,
    ))
}
