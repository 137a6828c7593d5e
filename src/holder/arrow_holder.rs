//! The Arrow-backed holder variants: an in-memory reusable table, and a lazy single-use
//! scanner abstraction (spec.md §3, "ArrowHolder").

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use arrow::datatypes::{Schema, SchemaRef};
use arrow::record_batch::{RecordBatch, RecordBatchIterator, RecordBatchReader};

use crate::error::{Error, Result, Status};
use crate::filter::{FilterNode, FilterTranslator};
use crate::holder::Projection;
use crate::statistics::{self, StatTuple};

/// An in-memory columnar table: multiple concurrent readers are allowed (spec.md §3).
pub struct ArrowTableHolder {
    schema: SchemaRef,
    batches: Vec<RecordBatch>,
}

impl ArrowTableHolder {
    pub fn new(schema: SchemaRef, batches: Vec<RecordBatch>) -> Self {
        Self { schema, batches }
    }

    pub fn schema(&self) -> SchemaRef {
        self.schema.clone()
    }

    pub fn num_rows(&self) -> Option<usize> {
        Some(self.batches.iter().map(|b| b.num_rows()).sum())
    }

    pub fn produce_filtered(
        &self,
        projected: Projection,
        filters: &HashMap<usize, FilterNode>,
    ) -> Result<(Box<dyn RecordBatchReader + Send>, HashMap<usize, FilterNode>)> {
        let projected_schema = project_schema(&self.schema, &projected)?;
        let indices = projection_indices(&self.schema, &projected)?;

        let (pushed, residual) = FilterTranslator::translate(filters, &self.schema);

        let mut out = Vec::with_capacity(self.batches.len());
        for batch in &self.batches {
            let filtered = apply_pushed_filters(batch, &pushed)?;
            out.push(filtered.project(&indices)?);
        }

        Ok((
            Box::new(RecordBatchIterator::new(out.into_iter().map(Ok), projected_schema)),
            residual,
        ))
    }

    pub fn compute_statistics(&self, columns: &[String]) -> Result<Vec<StatTuple>> {
        statistics::compute_over_batches(&self.schema, &self.batches, columns)
    }
}

/// A lazy Arrow source: cardinality unknown until scanned, and scanned at most once
/// (spec.md §3, "Lazy variant may be single-use per underlying source").
pub trait LazyArrowSource: Send + Sync {
    fn schema(&self) -> SchemaRef;
    fn scan(&self) -> Result<Box<dyn RecordBatchReader + Send>>;
}

pub struct ArrowLazyHolder {
    source: Arc<dyn LazyArrowSource>,
    consumed: AtomicBool,
}

impl ArrowLazyHolder {
    pub fn new(source: Arc<dyn LazyArrowSource>) -> Self {
        Self {
            source,
            consumed: AtomicBool::new(false),
        }
    }

    pub fn schema(&self) -> SchemaRef {
        self.source.schema()
    }

    pub fn produce_filtered(
        &self,
        projected: Projection,
        filters: &HashMap<usize, FilterNode>,
    ) -> Result<(Box<dyn RecordBatchReader + Send>, HashMap<usize, FilterNode>)> {
        if self.consumed.swap(true, Ordering::SeqCst) {
            return Err(Error::stream_already_consumed("<lazy arrow source>"));
        }

        let schema = self.source.schema();
        let projected_schema = project_schema(&schema, &projected)?;
        let indices = projection_indices(&schema, &projected)?;
        let (pushed, residual) = FilterTranslator::translate(filters, &schema);

        let reader = self.source.scan()?;
        let mut out = Vec::new();
        for batch in reader {
            let batch = batch?;
            let filtered = apply_pushed_filters(&batch, &pushed)?;
            out.push(filtered.project(&indices)?);
        }

        Ok((
            Box::new(RecordBatchIterator::new(out.into_iter().map(Ok), projected_schema)),
            residual,
        ))
    }
}

fn project_schema(schema: &SchemaRef, projected: &Projection) -> Result<SchemaRef> {
    match projected {
        Projection::All => Ok(schema.clone()),
        Projection::Columns(names) => {
            let fields = names
                .iter()
                .map(|n| {
                    schema.field_with_name(n).cloned().map_err(|_| {
                        Error::new(format!("unknown projected column: {n}"), Status::Internal)
                    })
                })
                .collect::<Result<Vec<_>>>()?;
            Ok(Arc::new(Schema::new(fields)))
        }
    }
}

fn projection_indices(schema: &SchemaRef, projected: &Projection) -> Result<Vec<usize>> {
    match projected {
        Projection::All => Ok((0..schema.fields().len()).collect()),
        Projection::Columns(names) => names
            .iter()
            .map(|n| {
                schema.index_of(n).map_err(|_| {
                    Error::new(format!("unknown projected column: {n}"), Status::Internal)
                })
            })
            .collect(),
    }
}

/// Apply every pushed per-column predicate, ANDing the resulting masks, and filter the
/// batch. Each predicate was translated against a single column (see `filter::translate`),
/// so it's evaluated against a one-column sub-batch for that column.
pub(crate) fn apply_pushed_filters(
    batch: &RecordBatch,
    pushed: &HashMap<usize, crate::filter::NativePredicate>,
) -> Result<RecordBatch> {
    if pushed.is_empty() {
        return Ok(batch.clone());
    }

    let mut mask: Option<arrow::array::BooleanArray> = None;
    for (col_idx, predicate) in pushed {
        let sub = batch.project(&[*col_idx])?;
        let this_mask = predicate.evaluate(&sub)?;
        mask = Some(match mask {
            None => this_mask,
            Some(prev) => arrow::compute::and(&prev, &this_mask)?,
        });
    }

    match mask {
        Some(mask) => Ok(arrow::compute::filter_record_batch(batch, &mask)?),
        None => Ok(batch.clone()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use arrow::array::{ArrayRef, Int64Array, StringArray};
    use arrow::datatypes::{DataType, Field};
    use crate::filter::{ComparisonOp, ScalarValue};

    fn sample_holder() -> ArrowTableHolder {
        let schema = Arc::new(Schema::new(vec![
            Field::new("id", DataType::Int64, false),
            Field::new("label", DataType::Utf8, false),
        ]));
        let id: ArrayRef = Arc::new(Int64Array::from(vec![1, 2, 3]));
        let label: ArrayRef = Arc::new(StringArray::from(vec!["a", "b", "c"]));
        let batch = RecordBatch::try_new(schema.clone(), vec![id, label]).unwrap();
        ArrowTableHolder::new(schema, vec![batch])
    }

    #[test]
    fn empty_projection_and_filters_yields_empty_schema() {
        use crate::holder::Holder;
        let holder = Holder::ArrowTable(sample_holder());
        let (mut reader, residual) = holder
            .produce_filtered(Projection::Columns(vec![]), &HashMap::new())
            .unwrap();
        assert!(residual.is_empty());
        assert_eq!(reader.schema().fields().len(), 0);
        assert!(reader.next().is_none());
    }

    #[test]
    fn filter_pushdown_selects_matching_rows() {
        let holder = sample_holder();
        let mut filters = HashMap::new();
        filters.insert(
            0,
            FilterNode::ConstantComparison {
                op: ComparisonOp::Gt,
                value: ScalarValue::Int64(1),
            },
        );
        let (reader, residual) = holder.produce_filtered(Projection::All, &filters).unwrap();
        assert!(residual.is_empty());
        let batches: Vec<_> = reader.map(|b| b.unwrap()).collect();
        let total: usize = batches.iter().map(|b| b.num_rows()).sum();
        assert_eq!(total, 2);
    }

    #[test]
    fn reading_lazy_holder_twice_fails() {
        struct Once(SchemaRef);
        impl LazyArrowSource for Once {
            fn schema(&self) -> SchemaRef {
                self.0.clone()
            }
            fn scan(&self) -> Result<Box<dyn RecordBatchReader + Send>> {
                Ok(Box::new(RecordBatchIterator::new(
                    std::iter::empty::<std::result::Result<RecordBatch, arrow::error::ArrowError>>(),
                    self.0.clone(),
                )))
            }
        }
        let schema = Arc::new(Schema::new(vec![Field::new("x", DataType::Int64, true)]));
        let holder = ArrowLazyHolder::new(Arc::new(Once(schema)));
        assert!(holder.produce_filtered(Projection::All, &HashMap::new()).is_ok());
        let err = holder
            .produce_filtered(Projection::All, &HashMap::new())
            .unwrap_err();
        assert_eq!(err.status, Status::StreamAlreadyConsumed);
    }
}
