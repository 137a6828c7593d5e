//! Polars-backed holder variants. Polars' own Arrow implementation has diverged from the
//! `arrow` crate we use at the FFI boundary, so this module carries a small schema/array
//! conversion shim (the same shape as `callisto_engines`' `polars_to_arrow` module) rather
//! than assuming the two crates interoperate directly.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, OnceLock};

use arrow::array::{
    ArrayRef, BooleanArray, Date32Array, Float64Array, Int64Array, StringArray,
    TimestampMicrosecondArray,
};
use arrow::datatypes::{DataType, Field, Schema, SchemaRef, TimeUnit};
use arrow::record_batch::{RecordBatch, RecordBatchIterator, RecordBatchReader};

use polars::prelude::*;

use crate::error::{Error, Result, Status};
use crate::filter::FilterNode;
use crate::holder::Projection;
use crate::holder::arrow_holder::apply_pushed_filters;
use crate::statistics::StatTuple;

fn polars_dtype_to_arrow(dt: &polars::datatypes::DataType) -> Result<DataType> {
    use polars::datatypes::DataType as PD;
    Ok(match dt {
        PD::Boolean => DataType::Boolean,
        PD::Int8 | PD::Int16 | PD::Int32 | PD::Int64 | PD::UInt8 | PD::UInt16 | PD::UInt32 | PD::UInt64 => {
            DataType::Int64
        }
        PD::Float32 | PD::Float64 => DataType::Float64,
        PD::String => DataType::Utf8,
        PD::Date => DataType::Date32,
        PD::Datetime(_, tz) => {
            DataType::Timestamp(TimeUnit::Microsecond, tz.clone().map(Arc::from))
        }
        other => {
            return Err(Error::new(
                format!("unsupported polars dtype for frame bridging: {other:?}"),
                Status::Internal,
            ))
        }
    })
}

fn polars_schema_to_arrow(schema: &polars::prelude::Schema) -> Result<SchemaRef> {
    let fields = schema
        .iter()
        .map(|(name, dt)| Ok(Field::new(name.as_str(), polars_dtype_to_arrow(dt)?, true)))
        .collect::<Result<Vec<_>>>()?;
    Ok(Arc::new(Schema::new(fields)))
}

fn series_to_array(series: &Series, target: &DataType) -> Result<ArrayRef> {
    let array: ArrayRef = match target {
        DataType::Boolean => Arc::new(BooleanArray::from_iter(series.bool()?.into_iter())),
        DataType::Int64 => {
            let casted = series.cast(&polars::datatypes::DataType::Int64)?;
            Arc::new(Int64Array::from_iter(casted.i64()?.into_iter()))
        }
        DataType::Float64 => {
            let casted = series.cast(&polars::datatypes::DataType::Float64)?;
            Arc::new(Float64Array::from_iter(casted.f64()?.into_iter()))
        }
        DataType::Utf8 => Arc::new(StringArray::from_iter(series.str()?.into_iter())),
        DataType::Date32 => {
            let casted = series.cast(&polars::datatypes::DataType::Date)?;
            Arc::new(Date32Array::from_iter(casted.date()?.as_ref().physical().into_iter()))
        }
        DataType::Timestamp(TimeUnit::Microsecond, tz) => {
            let casted = series.cast(&polars::datatypes::DataType::Datetime(
                polars::datatypes::TimeUnit::Microseconds,
                tz.as_deref().map(|s| s.to_string()),
            ))?;
            Arc::new(
                TimestampMicrosecondArray::from_iter(casted.datetime()?.as_ref().physical().into_iter())
                    .with_timezone_opt(tz.clone()),
            )
        }
        other => {
            return Err(Error::new(
                format!("unsupported target array type {other:?}"),
                Status::Internal,
            ))
        }
    };
    Ok(array)
}

fn dataframe_to_batch(df: &DataFrame, schema: &SchemaRef) -> Result<RecordBatch> {
    let mut columns = Vec::with_capacity(schema.fields().len());
    for field in schema.fields() {
        let series = df
            .column(field.name())
            .map_err(|e| Error::new(e.to_string(), Status::Internal))?;
        columns.push(series_to_array(series.as_materialized_series(), field.data_type())?);
    }
    Ok(RecordBatch::try_new(schema.clone(), columns)?)
}

fn select_and_rename(schema: &SchemaRef, projected: &Projection) -> Result<(Vec<String>, SchemaRef)> {
    match projected {
        Projection::All => {
            let names = schema.fields().iter().map(|f| f.name().clone()).collect();
            Ok((names, schema.clone()))
        }
        Projection::Columns(names) => {
            let fields = names
                .iter()
                .map(|n| {
                    schema.field_with_name(n).cloned().map_err(|_| {
                        Error::new(format!("unknown projected column: {n}"), Status::Internal)
                    })
                })
                .collect::<Result<Vec<_>>>()?;
            Ok((names.clone(), Arc::new(Schema::new(fields))))
        }
    }
}

/// A reusable, already-materialized Polars frame.
pub struct PolarsEagerHolder {
    schema: SchemaRef,
    frame: DataFrame,
}

impl PolarsEagerHolder {
    pub fn new(frame: DataFrame) -> Result<Self> {
        let schema = polars_schema_to_arrow(&frame.schema())?;
        Ok(Self { schema, frame })
    }

    pub fn schema(&self) -> SchemaRef {
        self.schema.clone()
    }

    pub fn num_rows(&self) -> Option<usize> {
        Some(self.frame.height())
    }

    pub fn produce_filtered(
        &self,
        projected: Projection,
        filters: &HashMap<usize, FilterNode>,
    ) -> Result<(Box<dyn RecordBatchReader + Send>, HashMap<usize, FilterNode>)> {
        let (names, projected_schema) = select_and_rename(&self.schema, &projected)?;

        let full_batch = dataframe_to_batch(&self.frame, &self.schema)?;
        let (pushed, residual) = crate::filter::FilterTranslator::translate(filters, &self.schema);
        let filtered = apply_pushed_filters(&full_batch, &pushed)?;

        let indices = names
            .iter()
            .map(|n| self.schema.index_of(n))
            .collect::<std::result::Result<Vec<_>, _>>()
            .map_err(|e| Error::new(e.to_string(), Status::Internal))?;
        let out = filtered.project(&indices)?;

        Ok((
            Box::new(RecordBatchIterator::new(std::iter::once(Ok(out)), projected_schema)),
            residual,
        ))
    }

    pub fn compute_statistics(&self, columns: &[String]) -> Result<Vec<StatTuple>> {
        let batch = dataframe_to_batch(&self.frame, &self.schema)?;
        crate::statistics::compute_over_batches(&self.schema, &[batch], columns)
    }
}

/// A lazy Polars computation plan. A materialization with no filters applied is cached
/// for reuse (spec.md §3, "one materialization is cached on first non-filtered scan").
pub struct PolarsLazyHolder {
    schema: SchemaRef,
    plan: Mutex<Option<LazyFrame>>,
    cache: OnceLock<DataFrame>,
}

impl PolarsLazyHolder {
    pub fn new(plan: LazyFrame) -> Result<Self> {
        let collected_schema = plan
            .clone()
            .collect_schema()
            .map_err(|e| Error::new(e.to_string(), Status::Internal))?;
        let schema = polars_schema_to_arrow(&collected_schema)?;
        Ok(Self {
            schema,
            plan: Mutex::new(Some(plan)),
            cache: OnceLock::new(),
        })
    }

    pub fn schema(&self) -> SchemaRef {
        self.schema.clone()
    }

    pub fn produce_filtered(
        &self,
        projected: Projection,
        filters: &HashMap<usize, FilterNode>,
    ) -> Result<(Box<dyn RecordBatchReader + Send>, HashMap<usize, FilterNode>)> {
        let (names, projected_schema) = select_and_rename(&self.schema, &projected)?;

        let df = if filters.is_empty() {
            if let Some(cached) = self.cache.get() {
                cached.clone()
            } else {
                let plan = self
                    .plan
                    .lock()
                    .unwrap()
                    .clone()
                    .ok_or_else(|| Error::new("lazy plan already consumed", Status::Internal))?;
                let collected = plan
                    .collect()
                    .map_err(|e| Error::new(e.to_string(), Status::Internal))?;
                let _ = self.cache.set(collected.clone());
                collected
            }
        } else {
            let plan = self
                .plan
                .lock()
                .unwrap()
                .clone()
                .ok_or_else(|| Error::new("lazy plan already consumed", Status::Internal))?;
            plan.collect().map_err(|e| Error::new(e.to_string(), Status::Internal))?
        };

        let full_batch = dataframe_to_batch(&df, &self.schema)?;
        let (pushed, residual) = crate::filter::FilterTranslator::translate(filters, &self.schema);
        let filtered = apply_pushed_filters(&full_batch, &pushed)?;

        let indices = names
            .iter()
            .map(|n| self.schema.index_of(n))
            .collect::<std::result::Result<Vec<_>, _>>()
            .map_err(|e| Error::new(e.to_string(), Status::Internal))?;
        let out = filtered.project(&indices)?;

        Ok((
            Box::new(RecordBatchIterator::new(std::iter::once(Ok(out)), projected_schema)),
            residual,
        ))
    }
}
