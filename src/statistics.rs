//! Per-column statistics extraction (spec.md §4.4): min/max/null-count precomputed for the
//! engine's optimizer, aggregated across every chunk of a holder's data.

use arrow::array::{Array, Float64Array, Int64Array, StringArray};
use arrow::compute::kernels::cast;
use arrow::datatypes::{DataType, SchemaRef, TimeUnit};
use arrow::record_batch::RecordBatch;

use crate::error::Result;

/// `type_tag` in spec.md §3 ("Statistics tuple").
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TypeTag {
    Int,
    Float,
    Str,
    Null,
}

/// `(column_index, type_tag, null_count, num_rows, min_int, max_int, min_double, max_double,
/// max_str_len, min_str, max_str)` from spec.md §3.
#[derive(Debug, Clone, PartialEq)]
pub struct StatTuple {
    pub column_index: usize,
    pub type_tag: TypeTag,
    pub null_count: usize,
    pub num_rows: usize,
    pub min_int: Option<i64>,
    pub max_int: Option<i64>,
    pub min_double: Option<f64>,
    pub max_double: Option<f64>,
    pub max_str_len: Option<usize>,
    pub min_str: Option<String>,
    pub max_str: Option<String>,
}

impl StatTuple {
    fn all_null(column_index: usize, num_rows: usize) -> Self {
        Self {
            column_index,
            type_tag: TypeTag::Null,
            null_count: num_rows,
            num_rows,
            min_int: None,
            max_int: None,
            min_double: None,
            max_double: None,
            max_str_len: None,
            min_str: None,
            max_str: None,
        }
    }
}

/// Columns that `"numeric"` statistics specs include (spec.md §4.4).
pub fn is_numeric_type(dt: &DataType) -> bool {
    matches!(
        dt,
        DataType::Int8
            | DataType::Int16
            | DataType::Int32
            | DataType::Int64
            | DataType::UInt8
            | DataType::UInt16
            | DataType::UInt32
            | DataType::UInt64
            | DataType::Float32
            | DataType::Float64
            | DataType::Date32
            | DataType::Date64
            | DataType::Timestamp(_, _)
    )
}

fn is_view_encoded(dt: &DataType) -> bool {
    matches!(dt, DataType::Utf8View | DataType::BinaryView)
}

/// Integer-like types whose physical representation is an integer: plain ints, plus
/// dates-as-days and timestamps-as-microseconds (spec.md §4.4, "integer-like types").
fn is_integer_like(dt: &DataType) -> bool {
    matches!(
        dt,
        DataType::Int8
            | DataType::Int16
            | DataType::Int32
            | DataType::Int64
            | DataType::UInt8
            | DataType::UInt16
            | DataType::UInt32
            | DataType::UInt64
            | DataType::Date32
            | DataType::Date64
            | DataType::Timestamp(_, _)
    )
}

/// Aggregate statistics for `columns` across every batch of a holder (spec.md §4.4,
/// "Multi-chunk frames").
pub fn compute_over_batches(
    schema: &SchemaRef,
    batches: &[RecordBatch],
    columns: &[String],
) -> Result<Vec<StatTuple>> {
    let total_rows: usize = batches.iter().map(|b| b.num_rows()).sum();
    if total_rows == 0 {
        return Ok(Vec::new());
    }

    let mut out = Vec::with_capacity(columns.len());

    for name in columns {
        let idx = match schema.index_of(name) {
            Ok(idx) => idx,
            Err(_) => continue,
        };
        let field = schema.field(idx);

        if is_view_encoded(field.data_type()) {
            continue;
        }

        let columns_for_field: Vec<_> = batches.iter().map(|b| b.column(idx).clone()).collect();
        let null_count: usize = columns_for_field.iter().map(|c| c.null_count()).sum();

        if null_count == total_rows {
            out.push(StatTuple::all_null(idx, total_rows));
            continue;
        }

        if is_integer_like(field.data_type()) {
            if let Some(tuple) = aggregate_int(&columns_for_field, idx, null_count, total_rows)? {
                out.push(tuple);
            }
            continue;
        }

        if matches!(field.data_type(), DataType::Float32 | DataType::Float64) {
            match aggregate_float(&columns_for_field, idx, null_count, total_rows)? {
                Some(tuple) => out.push(tuple),
                None => continue, // NaN present: skip per spec.md §4.4
            }
            continue;
        }

        if matches!(field.data_type(), DataType::Utf8 | DataType::LargeUtf8) {
            if let Some(tuple) = aggregate_str(&columns_for_field, idx, null_count, total_rows)? {
                out.push(tuple);
            }
            continue;
        }
        // Other types (bool, binary, nested): no statistics shape defined, skip.
    }

    Ok(out)
}

fn aggregate_int(
    arrays: &[arrow::array::ArrayRef],
    column_index: usize,
    null_count: usize,
    num_rows: usize,
) -> Result<Option<StatTuple>> {
    let mut min: Option<i64> = None;
    let mut max: Option<i64> = None;
    for arr in arrays {
        let casted = cast::cast(arr, &DataType::Int64)?;
        let ints = casted.as_any().downcast_ref::<Int64Array>().unwrap();
        for v in ints.iter().flatten() {
            min = Some(min.map_or(v, |m| m.min(v)));
            max = Some(max.map_or(v, |m| m.max(v)));
        }
    }
    Ok(Some(StatTuple {
        column_index,
        type_tag: TypeTag::Int,
        null_count,
        num_rows,
        min_int: min,
        max_int: max,
        min_double: None,
        max_double: None,
        max_str_len: None,
        min_str: None,
        max_str: None,
    }))
}

fn aggregate_float(
    arrays: &[arrow::array::ArrayRef],
    column_index: usize,
    null_count: usize,
    num_rows: usize,
) -> Result<Option<StatTuple>> {
    let mut min: Option<f64> = None;
    let mut max: Option<f64> = None;
    for arr in arrays {
        let casted = cast::cast(arr, &DataType::Float64)?;
        let floats = casted.as_any().downcast_ref::<Float64Array>().unwrap();
        for v in floats.iter().flatten() {
            if v.is_nan() {
                return Ok(None);
            }
            min = Some(min.map_or(v, |m| m.min(v)));
            max = Some(max.map_or(v, |m| m.max(v)));
        }
    }
    Ok(Some(StatTuple {
        column_index,
        type_tag: TypeTag::Float,
        null_count,
        num_rows,
        min_int: None,
        max_int: None,
        min_double: min,
        max_double: max,
        max_str_len: None,
        min_str: None,
        max_str: None,
    }))
}

fn aggregate_str(
    arrays: &[arrow::array::ArrayRef],
    column_index: usize,
    null_count: usize,
    num_rows: usize,
) -> Result<Option<StatTuple>> {
    let mut min: Option<String> = None;
    let mut max: Option<String> = None;
    let mut max_len: usize = 0;
    for arr in arrays {
        let strs = arr.as_any().downcast_ref::<StringArray>().ok_or_else(|| {
            crate::error::Error::new("expected Utf8 array", crate::error::Status::Internal)
        })?;
        for v in strs.iter().flatten() {
            max_len = max_len.max(v.len());
            min = Some(match min {
                None => v.to_string(),
                Some(m) if v < m.as_str() => v.to_string(),
                Some(m) => m,
            });
            max = Some(match max {
                None => v.to_string(),
                Some(m) if v > m.as_str() => v.to_string(),
                Some(m) => m,
            });
        }
    }
    Ok(Some(StatTuple {
        column_index,
        type_tag: TypeTag::Str,
        null_count,
        num_rows,
        min_int: None,
        max_int: None,
        min_double: None,
        max_double: None,
        max_str_len: Some(max_len),
        min_str: min,
        max_str: max,
    }))
}

#[allow(dead_code)]
fn timestamp_unit_matches(_unit: &TimeUnit) -> bool {
    true
}

#[cfg(test)]
mod tests {
    use super::*;
    use arrow::array::{ArrayRef, Float64Array as F64, Int64Array as I64};
    use arrow::datatypes::{Field, Schema};
    use std::sync::Arc;

    #[test]
    fn nan_containing_float_column_is_skipped() {
        let schema = Arc::new(Schema::new(vec![Field::new("a", DataType::Float64, true)]));
        let arr: ArrayRef = Arc::new(F64::from(vec![1.0, f64::NAN, 3.0]));
        let batch = RecordBatch::try_new(schema.clone(), vec![arr]).unwrap();
        let stats = compute_over_batches(&schema, &[batch], &["a".to_string()]).unwrap();
        assert!(stats.is_empty());
    }

    #[test]
    fn int_column_aggregates_across_chunks() {
        let schema = Arc::new(Schema::new(vec![Field::new("a", DataType::Int64, true)]));
        let b1_arr: ArrayRef = Arc::new(I64::from(vec![5, 1]));
        let b2_arr: ArrayRef = Arc::new(I64::from(vec![9, -3]));
        let b1 = RecordBatch::try_new(schema.clone(), vec![b1_arr]).unwrap();
        let b2 = RecordBatch::try_new(schema.clone(), vec![b2_arr]).unwrap();
        let stats = compute_over_batches(&schema, &[b1, b2], &["a".to_string()]).unwrap();
        assert_eq!(stats.len(), 1);
        assert_eq!(stats[0].min_int, Some(-3));
        assert_eq!(stats[0].max_int, Some(9));
        assert_eq!(stats[0].null_count, 0);
        assert_eq!(stats[0].num_rows, 4);
    }

    #[test]
    fn all_null_column_emits_null_tag() {
        let schema = Arc::new(Schema::new(vec![Field::new("a", DataType::Int64, true)]));
        let arr: ArrayRef = Arc::new(I64::from(vec![None, None, None]));
        let batch = RecordBatch::try_new(schema.clone(), vec![arr]).unwrap();
        let stats = compute_over_batches(&schema, &[batch], &["a".to_string()]).unwrap();
        assert_eq!(stats.len(), 1);
        assert_eq!(stats[0].type_tag, TypeTag::Null);
        assert_eq!(stats[0].null_count, 3);
    }
}
