//! Owns the engine handle and the two registries, serializes engine-unsafe calls, and
//! offers the `execute`/`register`/`cursor` surface (spec.md §4.7).

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use arrow::datatypes::SchemaRef;
use arrow::record_batch::{RecordBatch, RecordBatchReader};

use crate::config::{Config, StatisticsSpec};
use crate::engine::{Engine, QueryParams};
use crate::error::{Error, Result, Status};
use crate::holder::arrow_holder::LazyArrowSource;
use crate::holder::{ArrowLazyHolder, ArrowTableHolder, Holder};
#[cfg(feature = "polars")]
use crate::holder::{PolarsEagerHolder, PolarsLazyHolder};
use crate::preprocessor::{Preprocessor, Scope};
use crate::registry::HolderRegistry;
use crate::udtf::{UdtfArgs, UdtfRegistry, UdtfSignature, UdtfCallable};

/// A source handed to `register` before it becomes a [`Holder`] (spec.md §6,
/// "Registration API"). Because Rust is statically typed there is no untyped "unrecognized
/// source" case the way the original duck-typed registration had — `HolderSource` is closed,
/// so every variant builds successfully; see DESIGN.md for this adaptation.
pub enum HolderSource {
    ArrowTable(SchemaRef, Vec<RecordBatch>),
    ArrowLazy(Arc<dyn LazyArrowSource>),
    #[cfg(feature = "polars")]
    PolarsEager(polars::prelude::DataFrame),
    #[cfg(feature = "polars")]
    PolarsLazy(polars::prelude::LazyFrame),
}

impl HolderSource {
    fn is_lazy(&self) -> bool {
        match self {
            HolderSource::ArrowLazy(_) => true,
            #[cfg(feature = "polars")]
            HolderSource::PolarsLazy(_) => true,
            _ => false,
        }
    }

    fn into_holder(self) -> Result<Holder> {
        Ok(match self {
            HolderSource::ArrowTable(schema, batches) => {
                Holder::ArrowTable(ArrowTableHolder::new(schema, batches))
            }
            HolderSource::ArrowLazy(src) => Holder::ArrowLazy(ArrowLazyHolder::new(src)),
            #[cfg(feature = "polars")]
            HolderSource::PolarsEager(df) => Holder::PolarsEager(PolarsEagerHolder::new(df)?),
            #[cfg(feature = "polars")]
            HolderSource::PolarsLazy(lf) => Holder::PolarsLazy(PolarsLazyHolder::new(lf)?),
        })
    }
}

pub struct ConnectionCore {
    engine: Arc<dyn Engine>,
    registry: Arc<HolderRegistry>,
    udtfs: Arc<UdtfRegistry>,
    config: Config,
    query_lock: Mutex<()>,
    /// Backs the weak handle every [`crate::registry::HolderRegistry`] registration holds
    /// (spec.md §9, "Weak back-references").
    alive: Arc<()>,
    last_result_rows: Mutex<Option<usize>>,
}

impl ConnectionCore {
    /// `open(database_path?, config, read_only)` (spec.md §4.7). `build_engine` constructs
    /// the concrete engine handle under the process-wide init lock.
    pub fn open(
        build_engine: impl FnOnce(&Config) -> Result<Arc<dyn Engine>>,
        config: Config,
    ) -> Result<Arc<Self>> {
        config.validate()?;

        let engine = {
            let _guard = crate::registry::global_init_lock();
            let _guard = _guard.lock().unwrap();
            build_engine(&config)?
        };

        let alive = Arc::new(());
        let registry = Arc::new(HolderRegistry::new(
            engine.clone(),
            crate::registry::global_init_lock(),
            Arc::downgrade(&alive),
        ));

        let core = Arc::new(Self {
            engine,
            registry,
            udtfs: Arc::new(UdtfRegistry::new()),
            config,
            query_lock: Mutex::new(()),
            alive,
            last_result_rows: Mutex::new(None),
        });

        core.engine.run_init_sql(&core.config.init_sql)?;
        Ok(core)
    }

    /// `execute(sql, parameters, output_format, extra_data)` (spec.md §4.7).
    pub fn execute(
        self: &Arc<Self>,
        sql: &str,
        params: QueryParams,
        extra_data: HashMap<String, Arc<Holder>>,
        scope: &Scope,
    ) -> Result<Box<dyn RecordBatchReader + Send>> {
        let _guard = self.query_lock.lock().unwrap();

        // UDTFs that inject `conn` get a cursor, not this connection directly: the query
        // lock just taken above is not reentrant, and a UDTF that runs its own query on
        // the very same connection is exactly the deadlock scenario spec.md §5/§9 calls
        // out (a lazy scan re-entering its own executor).
        let injected_conn = self.cursor();
        let udtfs = self.udtfs.clone();
        let result = Preprocessor::preprocess(
            sql,
            &extra_data,
            scope,
            self.engine.as_ref(),
            self.config.enable_replacement_scan,
            &udtfs,
            |name, args| udtfs.invoke(name, args, Some(injected_conn.clone())),
        )?;

        for (name, holder) in &result.bindings {
            self.registry.register(name, holder.clone(), true)?;
        }

        let outcome = self.engine.execute(&result.sql, params);

        for name in result.bindings.keys() {
            self.registry.unregister(name)?;
        }

        let reader = outcome?;
        *self.last_result_rows.lock().unwrap() = Some(0);
        Ok(Box::new(RowCountingReader {
            inner: reader,
            conn: self.clone(),
        }))
    }

    /// `register(name, holder_source, statistics_spec, replace)` (spec.md §4.7).
    pub fn register(
        &self,
        name: &str,
        source: HolderSource,
        statistics: Option<StatisticsSpec>,
        replace: bool,
    ) -> Result<()> {
        let spec = statistics.unwrap_or_else(|| self.config.default_statistics.clone());
        if source.is_lazy() && !matches!(spec, StatisticsSpec::Disabled) {
            return Err(Error::new(
                "cannot compute statistics on a lazy source; collect it explicitly first",
                Status::LazyFrameRejected,
            ));
        }

        let holder = Arc::new(source.into_holder()?);

        if Config::statistics_globally_enabled() && !matches!(spec, StatisticsSpec::Disabled) {
            let stats = holder.compute_statistics(&spec)?;
            log::debug!("computed {} statistics tuple(s) for '{name}'", stats.len());
        }

        self.registry.register(name, holder, replace)
    }

    pub fn unregister(&self, name: &str) -> Result<()> {
        self.registry.unregister(name)
    }

    pub fn register_udtf(&self, name: &str, signature: UdtfSignature, callable: UdtfCallable) {
        self.udtfs.register(name, signature, callable);
    }

    /// A new `ConnectionCore` sharing the engine handle and both registries with its
    /// parent, but holding its own query lock and last-result slot (spec.md §4.7,
    /// "cursor()"; supplemented from `connection_api.py`'s `Connection`/`Cursor` split).
    pub fn cursor(self: &Arc<Self>) -> Arc<Self> {
        Arc::new(Self {
            engine: self.engine.clone(),
            registry: self.registry.clone(),
            udtfs: self.udtfs.clone(),
            config: self.config.clone(),
            query_lock: Mutex::new(()),
            alive: self.alive.clone(),
            last_result_rows: Mutex::new(None),
        })
    }

    /// No-op when there is no active transaction (spec.md §7, supplemented from
    /// `connection_compat.py`). This core does not model explicit transactions.
    pub fn commit(&self) -> Result<()> {
        Ok(())
    }

    pub fn rollback(&self) -> Result<()> {
        Ok(())
    }

    /// Close registry first, then the engine handle (spec.md §4.7).
    pub fn close(&self) -> Result<()> {
        self.registry.close_all();
        Ok(())
    }

    fn add_result_rows(&self, rows: usize) {
        let mut slot = self.last_result_rows.lock().unwrap();
        *slot = Some(slot.unwrap_or(0) + rows);
    }

    pub fn last_result_rows(&self) -> Option<usize> {
        *self.last_result_rows.lock().unwrap()
    }
}

/// Wraps a query's result stream to tally rows into the connection's own `last_result_rows`
/// slot as they are pulled, so a cursor's count stays independent of its parent's (spec.md
/// §4, supplemented; testable property 10).
struct RowCountingReader {
    inner: Box<dyn RecordBatchReader + Send>,
    conn: Arc<ConnectionCore>,
}

impl Iterator for RowCountingReader {
    type Item = std::result::Result<RecordBatch, arrow::error::ArrowError>;

    fn next(&mut self) -> Option<Self::Item> {
        let next = self.inner.next();
        if let Some(Ok(batch)) = &next {
            self.conn.add_result_rows(batch.num_rows());
        }
        next
    }
}

impl RecordBatchReader for RowCountingReader {
    fn schema(&self) -> SchemaRef {
        self.inner.schema()
    }
}
