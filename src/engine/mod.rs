//! The three engine hooks this crate builds around (spec.md §2): Parser, Query, and
//! ScanFunction. `Engine` is a trait object so a production build can plug in a real
//! embedded SQL engine's binding without this crate depending on it directly.

pub mod reference;

use std::collections::HashMap;
use std::sync::Arc;

use arrow::record_batch::RecordBatchReader;
use sqlparser::ast::Statement;

use crate::error::Result;
use crate::filter::FilterNode;
use crate::holder::Holder;

/// Result of the Parser hook: the engine's AST for a SQL string.
#[derive(Debug, Clone)]
pub struct ParsedQuery {
    pub statements: Vec<Statement>,
}

/// Parameters bound to a query (spec.md §6, "Execute API").
#[derive(Debug, Clone, Default)]
pub enum QueryParams {
    #[default]
    None,
    Positional(Vec<crate::filter::ScalarValue>),
    Named(HashMap<String, crate::filter::ScalarValue>),
}

/// Opaque engine-side identifier for a registered scan source (spec.md §3, "factory_handle").
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct FactoryHandle(pub u64);

/// The scan-function callback invoked on the engine's threads (spec.md §5, "Suspension
/// points"): must be re-entrant and must never acquire the connection query lock.
///
/// Returns the produced stream alongside whatever filters the holder could not push down
/// natively (spec.md §4.5, step 2) — the engine is responsible for applying that residual
/// itself before trusting the rows it gets back.
pub type ScanCallback = Arc<
    dyn Fn(
            Option<Vec<String>>,
            HashMap<usize, FilterNode>,
        ) -> Result<(Box<dyn RecordBatchReader + Send>, HashMap<usize, FilterNode>)>
        + Send
        + Sync,
>;

/// The embedded engine, abstracted behind its three hooks.
pub trait Engine: Send + Sync {
    /// Parser hook.
    fn parse(&self, sql: &str) -> Result<ParsedQuery>;

    /// Whether `name` already resolves in the engine's own catalog (used by replacement
    /// scan to know which names are *not* ambiguous).
    fn table_exists(&self, name: &str) -> bool;

    /// Query hook.
    fn execute(&self, sql: &str, params: QueryParams) -> Result<Box<dyn RecordBatchReader + Send>>;

    /// ScanFunction hook: register a named scan source, returning its factory handle.
    fn register_scan(&self, name: &str, holder: Arc<Holder>) -> Result<FactoryHandle>;

    /// ScanFunction hook: destroy a previously registered factory. Must be idempotent from
    /// the registry's point of view (the registry itself guards against double calls, but
    /// an engine binding may still see a handle it already destroyed during forced close).
    fn unregister_scan(&self, handle: FactoryHandle) -> Result<()>;

    /// Run `init_sql` against a freshly opened connection.
    fn run_init_sql(&self, statements: &[String]) -> Result<()> {
        for stmt in statements {
            self.execute(stmt, QueryParams::None)?;
        }
        Ok(())
    }
}
