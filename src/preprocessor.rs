//! Parse the query, resolve unknown table references against the caller's lexical scope
//! (replacement scan) and against registered UDTFs, and rewrite the SQL so the engine only
//! ever sees names it already knows about (spec.md §4.6).

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use sqlparser::ast::{Expr, SetExpr, Statement, TableFactor, Value};

use crate::engine::Engine;
use crate::error::Result;
use crate::filter::ScalarValue;
use crate::holder::Holder;
use crate::udtf::{UdtfArgs, UdtfRegistry};

/// A binding in the caller's lexical scope. Only bindings that already expose an Arrow
/// stream capability are eligible for replacement scan (spec.md §4.6).
pub trait ArrowCapable: Send + Sync {
    fn into_holder(&self) -> Result<Arc<Holder>>;
}

/// One frame of the caller's lexical scope, searched outward (spec.md §4.6, "Walk the
/// caller's lexical scope outward"). Resolution is lexical-only per this crate's resolution
/// of spec.md §9's open question (b): module globals are not consulted.
#[derive(Default)]
pub struct Scope {
    frames: Vec<HashMap<String, ScopeBinding>>,
}

pub enum ScopeBinding {
    Arrow(Arc<dyn ArrowCapable>),
    /// Present under this name, but not something we can scan (spec.md §4.6, "Bindings
    /// without the Arrow capability are not adopted").
    NotArrowCapable,
}

impl Scope {
    pub fn new() -> Self {
        Self::default()
    }

    /// Innermost frame first; `push_frame` adds a new innermost frame.
    pub fn push_frame(&mut self, frame: HashMap<String, ScopeBinding>) {
        self.frames.insert(0, frame);
    }

    fn resolve(&self, name: &str) -> Option<&ScopeBinding> {
        self.frames.iter().find_map(|frame| frame.get(name))
    }
}

#[derive(Debug, Clone)]
struct FunctionCallRef {
    name: String,
    positional: Vec<ScalarValue>,
    named: HashMap<String, ScalarValue>,
    source_text: String,
}

/// Result of preprocessing: the (possibly rewritten) SQL, and the transient/resolved
/// bindings the caller must register for the query's duration.
pub struct PreprocessResult {
    pub sql: String,
    pub bindings: HashMap<String, Arc<Holder>>,
}

pub struct Preprocessor;

impl Preprocessor {
    /// `preprocess(sql, user_data)` from spec.md §4.6.
    pub fn preprocess(
        sql: &str,
        user_data: &HashMap<String, Arc<Holder>>,
        scope: &Scope,
        engine: &dyn Engine,
        enable_replacement_scan: bool,
        udtfs: &UdtfRegistry,
        udtf_invoke: impl Fn(&str, UdtfArgs) -> Result<Arc<Holder>>,
    ) -> Result<PreprocessResult> {
        // Fast path (spec.md §4.6).
        if !enable_replacement_scan && !any_udtf_registered(sql, udtfs) {
            return Ok(PreprocessResult {
                sql: sql.to_string(),
                bindings: user_data.clone(),
            });
        }

        let parsed = match engine.parse(sql) {
            Ok(p) => p,
            Err(_) => {
                // Parse error: let the engine surface it at execution (spec.md §4.6 step 1).
                return Ok(PreprocessResult {
                    sql: sql.to_string(),
                    bindings: user_data.clone(),
                });
            }
        };

        let (referenced_tables, function_calls) = collect_refs(&parsed.statements);

        let mut bindings = user_data.clone();
        let mut rewritten = sql.to_string();

        if enable_replacement_scan {
            for table in &referenced_tables {
                if table.is_empty() || engine.table_exists(table) || user_data.contains_key(table) {
                    continue;
                }
                match scope.resolve(table) {
                    Some(ScopeBinding::Arrow(capable)) => {
                        log::debug!("replacement scan resolved '{table}' from lexical scope");
                        bindings.insert(table.clone(), capable.into_holder()?);
                    }
                    Some(ScopeBinding::NotArrowCapable) => {
                        log::warn!(
                            "replacement scan found '{table}' in scope but it has no Arrow stream capability"
                        );
                    }
                    None => {
                        // unresolved; propagates to the engine as an unknown-table error.
                    }
                }
            }
        }

        for call in &function_calls {
            if !udtfs.contains(&call.name) {
                continue;
            }
            let args = UdtfArgs {
                positional: call.positional.clone(),
                named: call.named.clone(),
            };
            let holder = udtf_invoke(&call.name, args)?;
            let transient_name = format!("_udtf_{}_{}", call.name, short_hex());
            log::debug!("UDTF '{}' bound to transient source '{}'", call.name, transient_name);
            bindings.insert(transient_name.clone(), holder);
            rewritten = rewritten.replacen(&call.source_text, &transient_name, 1);
        }

        Ok(PreprocessResult { sql: rewritten, bindings })
    }
}

fn any_udtf_registered(_sql: &str, udtfs: &UdtfRegistry) -> bool {
    // The fast path only cares whether *any* UDTF exists at all; a cheap emptiness check
    // avoids walking the AST for the common case of a connection with none registered.
    udtfs.has_any()
}

fn short_hex() -> String {
    let id = uuid::Uuid::new_v4();
    id.simple().to_string()[..8].to_string()
}

fn collect_refs(statements: &[Statement]) -> (HashSet<String>, Vec<FunctionCallRef>) {
    let mut tables = HashSet::new();
    let mut calls = Vec::new();
    for stmt in statements {
        if let Statement::Query(query) = stmt {
            walk_set_expr(&query.body, &mut tables, &mut calls);
        }
    }
    (tables, calls)
}

fn walk_set_expr(expr: &SetExpr, tables: &mut HashSet<String>, calls: &mut Vec<FunctionCallRef>) {
    match expr {
        SetExpr::Select(select) => {
            for twj in &select.from {
                walk_table_factor(&twj.relation, tables, calls);
                for join in &twj.joins {
                    walk_table_factor(&join.relation, tables, calls);
                }
            }
        }
        SetExpr::SetOperation { left, right, .. } => {
            walk_set_expr(left, tables, calls);
            walk_set_expr(right, tables, calls);
        }
        _ => {}
    }
}

fn walk_table_factor(factor: &TableFactor, tables: &mut HashSet<String>, calls: &mut Vec<FunctionCallRef>) {
    match factor {
        TableFactor::Table { name, args: Some(args), .. } => {
            let func_name = name.to_string();
            if func_name.is_empty() {
                return;
            }
            let mut positional = Vec::new();
            let mut named = HashMap::new();
            for arg in &args.args {
                match arg {
                    sqlparser::ast::FunctionArg::Unnamed(sqlparser::ast::FunctionArgExpr::Expr(e)) => {
                        positional.push(parse_safe_literal(e));
                    }
                    sqlparser::ast::FunctionArg::Named { name, arg: sqlparser::ast::FunctionArgExpr::Expr(e), .. } => {
                        named.insert(name.value.clone(), parse_safe_literal(e));
                    }
                    _ => {}
                }
            }
            calls.push(FunctionCallRef {
                name: func_name,
                positional,
                named,
                source_text: factor.to_string(),
            });
        }
        TableFactor::Table { name, args: None, .. } => {
            let table_name = name.to_string();
            if !table_name.is_empty() {
                tables.insert(table_name);
            }
        }
        TableFactor::Derived { subquery, .. } => {
            walk_set_expr(&subquery.body, tables, calls);
        }
        _ => {}
    }
}

/// Safe literal evaluator (spec.md §9, "UDTF argument parsing"): no `eval`, no name
/// lookup. Unparseable expressions are forwarded as a raw string.
fn parse_safe_literal(expr: &Expr) -> ScalarValue {
    match expr {
        Expr::Value(Value::Number(n, _)) => n
            .parse::<i64>()
            .map(ScalarValue::Int64)
            .or_else(|_| n.parse::<f64>().map(ScalarValue::Float64))
            .unwrap_or_else(|_| ScalarValue::Utf8(n.clone())),
        Expr::Value(Value::SingleQuotedString(s)) | Expr::Value(Value::DoubleQuotedString(s)) => {
            ScalarValue::Utf8(s.clone())
        }
        Expr::Value(Value::Boolean(b)) => ScalarValue::Bool(*b),
        Expr::Value(Value::Null) => ScalarValue::Null,
        Expr::UnaryOp { op: sqlparser::ast::UnaryOperator::Minus, expr } => match parse_safe_literal(expr) {
            ScalarValue::Int64(i) => ScalarValue::Int64(-i),
            ScalarValue::Float64(f) => ScalarValue::Float64(-f),
            other => other,
        },
        other => ScalarValue::Utf8(other.to_string()),
    }
}
