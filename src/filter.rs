//! Filter translation: mapping the engine's abstract filter tree onto a native predicate
//! that a [`crate::holder::DataHolder`] can evaluate in its own compute layer.
//!
//! Mirrors `teide-sql`'s expression walker (`sqlparser::ast::Expr` → a Teide DAG node) but
//! starting from the engine's already-abstracted filter shape (spec.md §3) rather than raw
//! SQL text, and targeting `arrow::compute` kernels instead of a bespoke engine.

use std::collections::HashMap;
use std::sync::Arc;

use arrow::array::{Array, ArrayRef, BooleanArray, Float32Array, Float64Array};
use arrow::compute::kernels::boolean::{and, not, or};
use arrow::compute::kernels::cmp;
use arrow::datatypes::{DataType, Schema, TimeUnit};
use arrow::record_batch::RecordBatch;

use crate::error::{Error, Result, Status};

/// Comparison operator carried by [`FilterNode::ConstantComparison`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ComparisonOp {
    Eq,
    Ne,
    Lt,
    Le,
    Gt,
    Ge,
}

/// A typed scalar as handed to us by the engine; its physical shape is expected to match
/// the column's logical type, modulo the coercions in spec.md §4.3's table.
#[derive(Debug, Clone, PartialEq)]
pub enum ScalarValue {
    Null,
    Bool(bool),
    Int64(i64),
    Float64(f64),
    Utf8(String),
}

impl ScalarValue {
    fn is_nan(&self) -> bool {
        matches!(self, ScalarValue::Float64(f) if f.is_nan())
    }
}

/// The engine's abstract filter tree (spec.md §3, "Filter node").
#[derive(Debug, Clone)]
pub enum FilterNode {
    ConstantComparison { op: ComparisonOp, value: ScalarValue },
    IsNull,
    IsNotNull,
    And(Vec<FilterNode>),
    Or(Vec<FilterNode>),
    In(Vec<ScalarValue>),
    StructExtract { child_idx: usize, child: Box<FilterNode> },
    Dynamic,
    Optional,
}

/// A scalar already coerced to match the column's physical Arrow type.
#[derive(Debug, Clone)]
enum NativeScalar {
    Bool(bool),
    Int64(i64),
    Float64(f64),
    Utf8(String),
    Date32(i32),
    TimestampMicros(i64, Option<Arc<str>>),
}

/// The frame-native predicate a [`crate::holder::DataHolder`] can evaluate directly,
/// equivalent to a PyArrow `dataset.Expression` or a Polars boolean `Expr`.
#[derive(Debug, Clone)]
pub enum NativePredicate {
    Const(bool),
    Compare {
        col: usize,
        op: ComparisonOp,
        value: NativeScalar,
    },
    /// Special-cased NaN comparisons (spec.md §4.3, "NaN semantics").
    IsNan(usize),
    IsNotNan(usize),
    IsNull(usize),
    IsNotNull(usize),
    And(Vec<NativePredicate>),
    Or(Vec<NativePredicate>),
    In(usize, Vec<NativeScalar>),
    StructExtract {
        col: usize,
        child_idx: usize,
        child: Box<NativePredicate>,
    },
}

impl NativePredicate {
    /// Evaluate against a batch, producing the boolean selection mask.
    pub fn evaluate(&self, batch: &RecordBatch) -> Result<BooleanArray> {
        match self {
            NativePredicate::Const(b) => {
                Ok(BooleanArray::from(vec![*b; batch.num_rows()]))
            }
            NativePredicate::IsNull(col) => Ok(arrow::compute::is_null(column(batch, *col)?)?),
            NativePredicate::IsNotNull(col) => {
                Ok(arrow::compute::is_not_null(column(batch, *col)?)?)
            }
            NativePredicate::IsNan(col) => is_nan_mask(column(batch, *col)?),
            NativePredicate::IsNotNan(col) => {
                let nan = is_nan_mask(column(batch, *col)?)?;
                Ok(not(&nan)?)
            }
            NativePredicate::And(children) => combine(children, batch, true),
            NativePredicate::Or(children) => combine(children, batch, false),
            NativePredicate::In(col, values) => {
                let arr = column(batch, *col)?;
                let mut acc: Option<BooleanArray> = None;
                for v in values {
                    let mask = compare_scalar(arr, ComparisonOp::Eq, v)?;
                    acc = Some(match acc {
                        None => mask,
                        Some(prev) => or(&prev, &mask)?,
                    });
                }
                Ok(acc.unwrap_or_else(|| BooleanArray::from(vec![false; batch.num_rows()])))
            }
            NativePredicate::Compare { col, op, value } => {
                let arr = column(batch, *col)?;
                compare_scalar(arr, *op, value)
            }
            NativePredicate::StructExtract { col, child_idx, child } => {
                let arr = column(batch, *col)?;
                let struct_arr = arr
                    .as_any()
                    .downcast_ref::<arrow::array::StructArray>()
                    .ok_or_else(|| {
                        Error::new("StructExtract on a non-struct column", Status::Internal)
                    })?;
                let field_array = struct_arr
                    .columns()
                    .get(*child_idx)
                    .ok_or_else(|| {
                        Error::new(
                            format!("struct field index {child_idx} out of range"),
                            Status::Internal,
                        )
                    })?
                    .clone();
                let field = struct_arr.fields()[*child_idx].clone();
                // Child filters address a named field of the struct; rebuild a one-column
                // batch around it so the child predicate's column index (0) resolves.
                let sub_batch = RecordBatch::try_new(Arc::new(Schema::new(vec![field])), vec![field_array])?;
                child.evaluate(&sub_batch)
            }
        }
    }
}

fn combine(children: &[NativePredicate], batch: &RecordBatch, is_and: bool) -> Result<BooleanArray> {
    if children.is_empty() {
        return Ok(BooleanArray::from(vec![is_and; batch.num_rows()]));
    }
    let mut iter = children.iter();
    let mut acc = iter.next().unwrap().evaluate(batch)?;
    for child in iter {
        let next = child.evaluate(batch)?;
        acc = if is_and { and(&acc, &next)? } else { or(&acc, &next)? };
    }
    Ok(acc)
}

fn column(batch: &RecordBatch, idx: usize) -> Result<&ArrayRef> {
    batch.columns().get(idx).ok_or_else(|| {
        Error::new(
            format!("filter references out-of-range column index {idx}"),
            Status::Internal,
        )
    })
}

fn is_nan_mask(arr: &ArrayRef) -> Result<BooleanArray> {
    match arr.data_type() {
        DataType::Float32 => {
            let a = arr.as_any().downcast_ref::<Float32Array>().unwrap();
            Ok(BooleanArray::from_iter(
                a.iter().map(|v| v.map(|x| x.is_nan())),
            ))
        }
        DataType::Float64 => {
            let a = arr.as_any().downcast_ref::<Float64Array>().unwrap();
            Ok(BooleanArray::from_iter(
                a.iter().map(|v| v.map(|x| x.is_nan())),
            ))
        }
        other => Err(Error::new(
            format!("is_nan requested on non-floating column of type {other:?}"),
            Status::Internal,
        )),
    }
}

fn compare_scalar(arr: &ArrayRef, op: ComparisonOp, value: &NativeScalar) -> Result<BooleanArray> {
    use arrow::array::{
        BooleanArray as BArr, Date32Array, Int64Array, StringArray as SArr,
        TimestampMicrosecondArray,
    };

    let scalar_arr: ArrayRef = match value {
        NativeScalar::Bool(b) => Arc::new(BArr::from(vec![*b])),
        NativeScalar::Int64(i) => Arc::new(Int64Array::from(vec![*i])),
        NativeScalar::Float64(f) => Arc::new(Float64Array::from(vec![*f])),
        NativeScalar::Utf8(s) => Arc::new(SArr::from(vec![s.as_str()])),
        NativeScalar::Date32(d) => Arc::new(Date32Array::from(vec![*d])),
        NativeScalar::TimestampMicros(us, tz) => Arc::new(
            TimestampMicrosecondArray::from(vec![*us]).with_timezone_opt(tz.clone()),
        ),
    };
    let scalar = arrow::array::Scalar::new(scalar_arr);

    let out = match op {
        ComparisonOp::Eq => cmp::eq(arr, &scalar)?,
        ComparisonOp::Ne => cmp::neq(arr, &scalar)?,
        ComparisonOp::Lt => cmp::lt(arr, &scalar)?,
        ComparisonOp::Le => cmp::lt_eq(arr, &scalar)?,
        ComparisonOp::Gt => cmp::gt(arr, &scalar)?,
        ComparisonOp::Ge => cmp::gt_eq(arr, &scalar)?,
    };
    Ok(out)
}

/// Types that bypass predicate pushdown entirely (spec.md §4.1/§4.3, "Unsupported types").
fn is_view_or_unsupported_type(dt: &DataType) -> bool {
    matches!(
        dt,
        DataType::Utf8View
            | DataType::BinaryView
            | DataType::Decimal128(_, _)
            | DataType::Decimal256(_, _)
            | DataType::Binary
            | DataType::LargeBinary
            | DataType::List(_)
            | DataType::LargeList(_)
            | DataType::Map(_, _)
    )
}

/// Maps abstract filter nodes to native frame predicates (spec.md §4.3).
pub struct FilterTranslator;

impl FilterTranslator {
    /// Translate every per-column filter, partitioning into "pushed" (successfully
    /// translated) and "residual" (handed back to the engine, per spec.md §4.5).
    pub fn translate(
        filters: &HashMap<usize, FilterNode>,
        schema: &Schema,
    ) -> (HashMap<usize, NativePredicate>, HashMap<usize, FilterNode>) {
        let mut pushed = HashMap::new();
        let mut residual = HashMap::new();

        for (col_idx, node) in filters {
            // Unknown column index → silently drop; engine applies it (spec.md §4.1).
            let field = match schema.fields().get(*col_idx) {
                Some(f) => f,
                None => continue,
            };

            match Self::translate_one(node, field.data_type()) {
                Ok(predicate) => {
                    pushed.insert(*col_idx, predicate);
                }
                Err(e) => {
                    log::debug!(
                        "failed to translate filter for column {} ({}): {}",
                        col_idx,
                        field.name(),
                        e
                    );
                    residual.insert(*col_idx, node.clone());
                }
            }
        }

        (pushed, residual)
    }

    fn translate_one(node: &FilterNode, column_type: &DataType) -> Result<NativePredicate> {
        if is_view_or_unsupported_type(column_type) && !matches!(node, FilterNode::StructExtract { .. })
        {
            return Err(unsupported("column type does not support pushdown"));
        }

        match node {
            FilterNode::ConstantComparison { op, value } => {
                Self::translate_comparison(*op, value, column_type)
            }
            FilterNode::IsNull => Ok(NativePredicate::IsNull(0)),
            FilterNode::IsNotNull => Ok(NativePredicate::IsNotNull(0)),
            FilterNode::And(children) => {
                if children.is_empty() {
                    return Ok(NativePredicate::Const(true));
                }
                let mut out = Vec::with_capacity(children.len());
                for c in children {
                    out.push(Self::translate_one(c, column_type)?);
                }
                Ok(NativePredicate::And(out))
            }
            FilterNode::Or(children) => {
                if children.is_empty() {
                    return Ok(NativePredicate::Const(false));
                }
                let mut out = Vec::with_capacity(children.len());
                for c in children {
                    out.push(Self::translate_one(c, column_type)?);
                }
                Ok(NativePredicate::Or(out))
            }
            FilterNode::In(values) => {
                if values.is_empty() {
                    return Ok(NativePredicate::Const(false));
                }
                let mut out = Vec::with_capacity(values.len());
                for v in values {
                    out.push(coerce(v, column_type)?);
                }
                Ok(NativePredicate::In(0, out))
            }
            FilterNode::StructExtract { child_idx, child } => {
                let DataType::Struct(fields) = column_type else {
                    return Err(unsupported("StructExtract on a non-struct column"));
                };
                let child_type = fields
                    .get(*child_idx)
                    .map(|f| f.data_type().clone())
                    .ok_or_else(|| unsupported("struct field index out of range"))?;
                let translated = Self::translate_one(child, &child_type)?;
                Ok(NativePredicate::StructExtract {
                    col: 0,
                    child_idx: *child_idx,
                    child: Box::new(translated),
                })
            }
            FilterNode::Dynamic | FilterNode::Optional => Ok(NativePredicate::Const(true)),
        }
    }

    fn translate_comparison(
        op: ComparisonOp,
        value: &ScalarValue,
        column_type: &DataType,
    ) -> Result<NativePredicate> {
        if matches!(value, ScalarValue::Null) {
            return Err(unsupported("constant comparison against NULL"));
        }

        // NaN semantics (spec.md §4.3): re-expressed as dedicated predicate kinds so the
        // holder doesn't need to special-case scalar equality against NaN.
        if matches!(column_type, DataType::Float32 | DataType::Float64) && value.is_nan() {
            return Ok(match op {
                ComparisonOp::Eq => NativePredicate::IsNan(0),
                ComparisonOp::Ne => NativePredicate::IsNotNan(0),
                ComparisonOp::Gt => NativePredicate::Const(false),
                ComparisonOp::Ge => NativePredicate::IsNan(0),
                ComparisonOp::Lt => NativePredicate::IsNotNan(0),
                ComparisonOp::Le => NativePredicate::Const(true),
            });
        }

        let native = coerce(value, column_type)?;
        Ok(NativePredicate::Compare { col: 0, op, value: native })
    }
}

fn unsupported(msg: &str) -> Error {
    Error::new(msg, Status::Internal)
}

/// Coerce an engine-supplied scalar to the column's logical type (spec.md §4.3 table).
fn coerce(value: &ScalarValue, column_type: &DataType) -> Result<NativeScalar> {
    match (value, column_type) {
        (ScalarValue::Int64(days), DataType::Date32) => Ok(NativeScalar::Date32(*days as i32)),
        (ScalarValue::Int64(micros), DataType::Timestamp(TimeUnit::Microsecond, tz)) => {
            Ok(NativeScalar::TimestampMicros(*micros, tz.clone()))
        }
        (ScalarValue::Int64(i), DataType::Int8 | DataType::Int16 | DataType::Int32 | DataType::Int64 | DataType::UInt8 | DataType::UInt16 | DataType::UInt32 | DataType::UInt64) => {
            Ok(NativeScalar::Int64(*i))
        }
        (ScalarValue::Float64(f), DataType::Float32 | DataType::Float64) => {
            Ok(NativeScalar::Float64(*f))
        }
        (ScalarValue::Int64(i), DataType::Float32 | DataType::Float64) => {
            Ok(NativeScalar::Float64(*i as f64))
        }
        (ScalarValue::Utf8(s), DataType::Utf8 | DataType::LargeUtf8) => {
            Ok(NativeScalar::Utf8(s.clone()))
        }
        (ScalarValue::Bool(b), DataType::Boolean) => Ok(NativeScalar::Bool(*b)),
        _ => Err(unsupported(&format!(
            "value {value:?} does not coerce to column type {column_type:?}"
        ))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use arrow::array::Float64Array;
    use arrow::datatypes::Field;

    fn batch_of_floats(values: Vec<f64>) -> RecordBatch {
        let schema = Arc::new(Schema::new(vec![Field::new("a", DataType::Float64, true)]));
        let arr: ArrayRef = Arc::new(Float64Array::from(values));
        RecordBatch::try_new(schema, vec![arr]).unwrap()
    }

    #[test]
    fn nan_equality_matches_only_nan() {
        let batch = batch_of_floats(vec![f64::INFINITY, f64::NAN, 0.3, 42.0, f64::NEG_INFINITY]);
        let mut filters = HashMap::new();
        filters.insert(
            0,
            FilterNode::ConstantComparison {
                op: ComparisonOp::Eq,
                value: ScalarValue::Float64(f64::NAN),
            },
        );
        let (pushed, residual) = FilterTranslator::translate(&filters, batch.schema().as_ref());
        assert!(residual.is_empty());
        let mask = pushed[&0].evaluate(&batch).unwrap();
        assert_eq!(mask.values().iter().filter(|b| b).count(), 1);
        assert!(mask.value(1));
    }

    #[test]
    fn nan_greater_than_is_always_false() {
        let batch = batch_of_floats(vec![1.0, f64::NAN, -1.0]);
        let mut filters = HashMap::new();
        filters.insert(
            0,
            FilterNode::ConstantComparison {
                op: ComparisonOp::Gt,
                value: ScalarValue::Float64(f64::NAN),
            },
        );
        let (pushed, _) = FilterTranslator::translate(&filters, batch.schema().as_ref());
        let mask = pushed[&0].evaluate(&batch).unwrap();
        assert!((0..mask.len()).all(|i| !mask.value(i)));
    }

    #[test]
    fn nan_less_or_equal_is_always_true() {
        let batch = batch_of_floats(vec![1.0, f64::NAN, -1.0]);
        let mut filters = HashMap::new();
        filters.insert(
            0,
            FilterNode::ConstantComparison {
                op: ComparisonOp::Le,
                value: ScalarValue::Float64(f64::NAN),
            },
        );
        let (pushed, _) = FilterTranslator::translate(&filters, batch.schema().as_ref());
        let mask = pushed[&0].evaluate(&batch).unwrap();
        assert!((0..mask.len()).all(|i| mask.value(i)));
    }

    #[test]
    fn unknown_column_index_is_dropped_silently() {
        let batch = batch_of_floats(vec![1.0]);
        let mut filters = HashMap::new();
        filters.insert(
            7,
            FilterNode::ConstantComparison {
                op: ComparisonOp::Eq,
                value: ScalarValue::Float64(1.0),
            },
        );
        let (pushed, residual) = FilterTranslator::translate(&filters, batch.schema().as_ref());
        assert!(pushed.is_empty());
        assert!(residual.is_empty());
    }

    #[test]
    fn view_types_are_never_pushed() {
        let schema = Schema::new(vec![Field::new("a", DataType::Utf8View, true)]);
        let mut filters = HashMap::new();
        filters.insert(
            0,
            FilterNode::ConstantComparison {
                op: ComparisonOp::Eq,
                value: ScalarValue::Utf8("x".into()),
            },
        );
        let (pushed, residual) = FilterTranslator::translate(&filters, &schema);
        assert!(pushed.is_empty());
        assert_eq!(residual.len(), 1);
    }

    #[test]
    fn struct_extract_recurses_into_the_addressed_field() {
        use arrow::array::{Int64Array, StructArray};
        use arrow::datatypes::Fields;

        let fields = Fields::from(vec![
            Field::new("x", DataType::Int64, true),
            Field::new("y", DataType::Int64, true),
        ]);
        let x: ArrayRef = Arc::new(Int64Array::from(vec![1, 2, 3]));
        let y: ArrayRef = Arc::new(Int64Array::from(vec![10, 20, 30]));
        let struct_arr = StructArray::new(fields.clone(), vec![x, y], None);
        let schema = Arc::new(Schema::new(vec![Field::new(
            "point",
            DataType::Struct(fields),
            true,
        )]));
        let batch = RecordBatch::try_new(schema.clone(), vec![Arc::new(struct_arr)]).unwrap();

        let mut filters = HashMap::new();
        filters.insert(
            0,
            FilterNode::StructExtract {
                child_idx: 1,
                child: Box::new(FilterNode::ConstantComparison {
                    op: ComparisonOp::Eq,
                    value: ScalarValue::Int64(20),
                }),
            },
        );
        let (pushed, residual) = FilterTranslator::translate(&filters, schema.as_ref());
        assert!(residual.is_empty());
        let mask = pushed[&0].evaluate(&batch).unwrap();
        assert!(!mask.value(0));
        assert!(mask.value(1));
        assert!(!mask.value(2));
    }
}
