//! A minimal, fully in-process `Engine` sufficient to exercise this crate's own testable
//! properties (spec.md §8) without linking a real embedded SQL engine. It understands only
//! the handful of query shapes the scan-adapter and preprocessing layers need to drive:
//! `SELECT <cols|*> FROM <name> [WHERE ...] [ORDER BY col [ASC|DESC]] [LIMIT n]` and
//! `SELECT count(*) FROM <name> [WHERE ...]`.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use arrow::array::{Array, Int64Array};
use arrow::record_batch::{RecordBatch, RecordBatchIterator, RecordBatchReader};
use sqlparser::ast::{
    BinaryOperator, Expr, OrderByExpr, Query, Select, SelectItem, SetExpr, Statement, TableFactor,
    Value,
};
use sqlparser::dialect::DuckDbDialect;
use sqlparser::parser::Parser;

use crate::error::{Error, Result, Status};
use crate::engine::{Engine, FactoryHandle, ParsedQuery, QueryParams};
use crate::filter::{ComparisonOp, FilterNode, ScalarValue};
use crate::holder::{Holder, Projection};

struct ScanEntry {
    holder: Arc<Holder>,
    handle: FactoryHandle,
}

#[derive(Default)]
pub struct ReferenceEngine {
    scans: Mutex<HashMap<String, ScanEntry>>,
    next_handle: AtomicU64,
}

impl ReferenceEngine {
    pub fn new() -> Self {
        Self::default()
    }

    fn dialect(&self) -> DuckDbDialect {
        DuckDbDialect {}
    }
}

impl Engine for ReferenceEngine {
    fn parse(&self, sql: &str) -> Result<ParsedQuery> {
        let statements = Parser::parse_sql(&self.dialect(), sql)?;
        Ok(ParsedQuery { statements })
    }

    fn table_exists(&self, name: &str) -> bool {
        self.scans.lock().unwrap().contains_key(name)
    }

    fn register_scan(&self, name: &str, holder: Arc<Holder>) -> Result<FactoryHandle> {
        let handle = FactoryHandle(self.next_handle.fetch_add(1, Ordering::SeqCst));
        self.scans
            .lock()
            .unwrap()
            .insert(name.to_string(), ScanEntry { holder, handle });
        Ok(handle)
    }

    fn unregister_scan(&self, handle: FactoryHandle) -> Result<()> {
        self.scans.lock().unwrap().retain(|_, v| v.handle != handle);
        Ok(())
    }

    fn execute(&self, sql: &str, _params: QueryParams) -> Result<Box<dyn RecordBatchReader + Send>> {
        let parsed = self.parse(sql)?;
        let stmt = parsed
            .statements
            .first()
            .ok_or_else(|| Error::new("empty query", Status::EngineError))?;

        let query = match stmt {
            Statement::Query(q) => q.as_ref(),
            other => {
                return Err(Error::new(
                    format!("ReferenceEngine only executes SELECT, got: {other}"),
                    Status::EngineError,
                ))
            }
        };

        self.execute_query(query)
    }
}

impl ReferenceEngine {
    fn execute_query(&self, query: &Query) -> Result<Box<dyn RecordBatchReader + Send>> {
        let select = match query.body.as_ref() {
            SetExpr::Select(s) => s.as_ref(),
            other => {
                return Err(Error::new(
                    format!("unsupported query body: {other}"),
                    Status::EngineError,
                ))
            }
        };

        let table_name = table_name_of(select)?;
        let entry_holder = {
            let scans = self.scans.lock().unwrap();
            let entry = scans.get(&table_name).ok_or_else(|| {
                Error::new(
                    format!("Table with name {table_name} does not exist"),
                    Status::EngineError,
                )
            })?;
            entry.holder.clone()
        };

        let schema = entry_holder.schema();
        let is_count_star = is_count_star(select);
        let projection = if is_count_star {
            Projection::All
        } else {
            select_projection(select)?
        };

        let filters = match &select.selection {
            Some(expr) => translate_where(expr, &schema)?,
            None => HashMap::new(),
        };

        let (reader, residual) = entry_holder.produce_filtered(projection, &filters)?;
        if !residual.is_empty() {
            // This reference engine has nowhere to apply a residual filter itself (it
            // only understands the comparisons it already turned into `FilterNode`s); say
            // so rather than returning rows the WHERE clause didn't actually narrow.
            return Err(Error::new(
                format!("{} filter(s) could not be pushed down onto the scan and this reference engine cannot apply them itself", residual.len()),
                Status::EngineError,
            ));
        }
        let mut batches: Vec<RecordBatch> = Vec::new();
        for b in reader {
            batches.push(b?);
        }

        if is_count_star {
            let total: i64 = batches.iter().map(|b| b.num_rows() as i64).sum();
            let out_schema = Arc::new(arrow::datatypes::Schema::new(vec![
                arrow::datatypes::Field::new("count_star()", arrow::datatypes::DataType::Int64, false),
            ]));
            let arr: arrow::array::ArrayRef = Arc::new(Int64Array::from(vec![total]));
            let batch = RecordBatch::try_new(out_schema.clone(), vec![arr])?;
            return Ok(Box::new(RecordBatchIterator::new(
                std::iter::once(Ok(batch)),
                out_schema,
            )));
        }

        if let Some(order_by) = query.order_by.as_ref() {
            batches = apply_order_by(batches, order_by)?;
        }

        if let Some(limit_expr) = &query.limit {
            let n = literal_int(limit_expr)? as usize;
            batches = apply_limit(batches, n);
        }

        let out_schema = batches
            .first()
            .map(|b| b.schema())
            .unwrap_or_else(|| entry_holder.schema());
        Ok(Box::new(RecordBatchIterator::new(
            batches.into_iter().map(Ok),
            out_schema,
        )))
    }
}

fn table_name_of(select: &Select) -> Result<String> {
    let from = select
        .from
        .first()
        .ok_or_else(|| Error::new("no FROM clause", Status::EngineError))?;
    match &from.relation {
        TableFactor::Table { name, .. } => Ok(name.to_string()),
        other => Err(Error::new(
            format!("unsupported FROM relation: {other}"),
            Status::EngineError,
        )),
    }
}

fn is_count_star(select: &Select) -> bool {
    select.projection.len() == 1
        && matches!(
            &select.projection[0],
            SelectItem::UnnamedExpr(Expr::Function(f)) if f.name.to_string().eq_ignore_ascii_case("count")
        )
}

fn select_projection(select: &Select) -> Result<Projection> {
    if select.projection.len() == 1 && matches!(select.projection[0], SelectItem::Wildcard(_)) {
        return Ok(Projection::All);
    }
    let mut names = Vec::with_capacity(select.projection.len());
    for item in &select.projection {
        match item {
            SelectItem::UnnamedExpr(Expr::Identifier(ident)) => names.push(ident.value.clone()),
            other => {
                return Err(Error::new(
                    format!("unsupported select item: {other}"),
                    Status::EngineError,
                ))
            }
        }
    }
    Ok(Projection::Columns(names))
}

fn literal_int(expr: &Expr) -> Result<i64> {
    match expr {
        Expr::Value(Value::Number(n, _)) => n
            .parse()
            .map_err(|_| Error::new(format!("not an integer literal: {n}"), Status::EngineError)),
        other => Err(Error::new(
            format!("expected integer literal, got {other}"),
            Status::EngineError,
        )),
    }
}

fn apply_limit(batches: Vec<RecordBatch>, n: usize) -> Vec<RecordBatch> {
    let mut remaining = n;
    let mut out = Vec::new();
    for batch in batches {
        if remaining == 0 {
            break;
        }
        let take = remaining.min(batch.num_rows());
        out.push(batch.slice(0, take));
        remaining -= take;
    }
    out
}

fn apply_order_by(batches: Vec<RecordBatch>, order_by: &sqlparser::ast::OrderBy) -> Result<Vec<RecordBatch>> {
    if batches.is_empty() {
        return Ok(batches);
    }
    let schema = batches[0].schema();
    let combined = arrow::compute::concat_batches(&schema, &batches)?;

    let exprs: Vec<OrderByExpr> = order_by.exprs.clone();
    let first = exprs
        .first()
        .ok_or_else(|| Error::new("empty ORDER BY", Status::EngineError))?;
    let col_name = match &first.expr {
        Expr::Identifier(ident) => ident.value.clone(),
        other => {
            return Err(Error::new(
                format!("unsupported ORDER BY expression: {other}"),
                Status::EngineError,
            ))
        }
    };
    let descending = first.asc == Some(false);
    let col_idx = schema.index_of(&col_name)?;
    let column = combined.column(col_idx);

    let sort_options = arrow::compute::SortOptions {
        descending,
        nulls_first: false,
    };
    let indices = arrow::compute::sort_to_indices(column, Some(sort_options), None)?;
    let columns = combined
        .columns()
        .iter()
        .map(|c| arrow::compute::take(c, &indices, None))
        .collect::<std::result::Result<Vec<_>, _>>()?;
    Ok(vec![RecordBatch::try_new(schema, columns)?])
}

/// The engine's own WHERE-clause-to-FilterNode translation. This is explicitly an
/// engine-side concern (spec.md §1 puts SQL parsing/planning out of scope for the core);
/// it exists only so the reference engine can drive `FilterTranslator` end to end.
fn translate_where(expr: &Expr, schema: &arrow::datatypes::SchemaRef) -> Result<HashMap<usize, FilterNode>> {
    let mut out = HashMap::new();
    collect_where(expr, schema, &mut out)?;
    Ok(out)
}

fn collect_where(
    expr: &Expr,
    schema: &arrow::datatypes::SchemaRef,
    out: &mut HashMap<usize, FilterNode>,
) -> Result<()> {
    match expr {
        Expr::BinaryOp { left, op: BinaryOperator::And, right } => {
            collect_where(left, schema, out)?;
            collect_where(right, schema, out)?;
            Ok(())
        }
        Expr::BinaryOp { left, op, right } => {
            let (col, value) = match (left.as_ref(), right.as_ref()) {
                (Expr::Identifier(ident), v) => (ident.value.clone(), value_of(v)?),
                (v, Expr::Identifier(ident)) => (ident.value.clone(), value_of(v)?),
                _ => {
                    return Err(Error::new(
                        "only `column OP literal` predicates are supported",
                        Status::EngineError,
                    ))
                }
            };
            let idx = schema.index_of(&col)?;
            let cmp = comparison_op(op)?;
            out.entry(idx)
                .and_modify(|existing| {
                    let prev = std::mem::replace(existing, FilterNode::IsNull);
                    *existing = FilterNode::And(vec![
                        prev,
                        FilterNode::ConstantComparison { op: cmp, value: value.clone() },
                    ]);
                })
                .or_insert(FilterNode::ConstantComparison { op: cmp, value });
            Ok(())
        }
        Expr::IsNull(inner) => {
            if let Expr::Identifier(ident) = inner.as_ref() {
                let idx = schema.index_of(&ident.value)?;
                out.insert(idx, FilterNode::IsNull);
            }
            Ok(())
        }
        Expr::IsNotNull(inner) => {
            if let Expr::Identifier(ident) = inner.as_ref() {
                let idx = schema.index_of(&ident.value)?;
                out.insert(idx, FilterNode::IsNotNull);
            }
            Ok(())
        }
        other => Err(Error::new(
            format!("unsupported WHERE expression: {other}"),
            Status::EngineError,
        )),
    }
}

fn comparison_op(op: &BinaryOperator) -> Result<ComparisonOp> {
    Ok(match op {
        BinaryOperator::Eq => ComparisonOp::Eq,
        BinaryOperator::NotEq => ComparisonOp::Ne,
        BinaryOperator::Lt => ComparisonOp::Lt,
        BinaryOperator::LtEq => ComparisonOp::Le,
        BinaryOperator::Gt => ComparisonOp::Gt,
        BinaryOperator::GtEq => ComparisonOp::Ge,
        other => {
            return Err(Error::new(
                format!("unsupported comparison operator: {other}"),
                Status::EngineError,
            ))
        }
    })
}

fn value_of(expr: &Expr) -> Result<ScalarValue> {
    match expr {
        Expr::Value(Value::Number(n, _)) => {
            if let Ok(i) = n.parse::<i64>() {
                Ok(ScalarValue::Int64(i))
            } else {
                n.parse::<f64>()
                    .map(ScalarValue::Float64)
                    .map_err(|_| Error::new(format!("bad numeric literal: {n}"), Status::EngineError))
            }
        }
        Expr::Value(Value::SingleQuotedString(s)) => {
            if s.eq_ignore_ascii_case("nan") {
                Ok(ScalarValue::Float64(f64::NAN))
            } else if let Some(days) = parse_date_literal(s) {
                Ok(ScalarValue::Int64(days))
            } else {
                Ok(ScalarValue::Utf8(s.clone()))
            }
        }
        Expr::Value(Value::Boolean(b)) => Ok(ScalarValue::Bool(*b)),
        Expr::UnaryOp { op: sqlparser::ast::UnaryOperator::Minus, expr } => match value_of(expr)? {
            ScalarValue::Int64(i) => Ok(ScalarValue::Int64(-i)),
            ScalarValue::Float64(f) => Ok(ScalarValue::Float64(-f)),
            other => Ok(other),
        },
        other => Err(Error::new(
            format!("unsupported literal: {other}"),
            Status::EngineError,
        )),
    }
}

/// Parse an ISO `YYYY-MM-DD` literal into days-since-epoch, matching the coercion table
/// applied to date columns (spec.md §4.3).
fn parse_date_literal(s: &str) -> Option<i64> {
    let parts: Vec<&str> = s.split('-').collect();
    if parts.len() != 3 {
        return None;
    }
    let y: i32 = parts[0].parse().ok()?;
    let m: u32 = parts[1].parse().ok()?;
    let d: u32 = parts[2].parse().ok()?;
    let date = chrono_like_days_from_civil(y, m, d)?;
    Some(date)
}

/// Days since the Unix epoch for a Gregorian calendar date, Howard Hinnant's
/// `days_from_civil` algorithm (avoids pulling in `chrono` just for this).
fn chrono_like_days_from_civil(y: i32, m: u32, d: u32) -> Option<i64> {
    if !(1..=12).contains(&m) || !(1..=31).contains(&d) {
        return None;
    }
    let y = if m <= 2 { y - 1 } else { y } as i64;
    let era = if y >= 0 { y } else { y - 399 } / 400;
    let yoe = (y - era * 400) as i64;
    let mp = ((m as i64 + 9) % 12) as i64;
    let doy = (153 * mp + 2) / 5 + d as i64 - 1;
    let doe = yoe * 365 + yoe / 4 - yoe / 100 + doy;
    Some(era * 146097 + doe - 719468)
}
