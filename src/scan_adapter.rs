//! The engine-facing callback glue: what a real engine binding installs as the
//! ScanFunction hook for a registered name (spec.md §4.5).

use std::collections::HashMap;
use std::sync::Arc;

use crate::engine::ScanCallback;
use crate::error::Error;
use crate::filter::FilterNode;
use crate::holder::Projection;
use crate::registry::HolderRegistry;

pub struct ScanAdapter;

impl ScanAdapter {
    /// Build the callback the engine invokes with `(projection, filters)` whenever it
    /// scans the relation registered under `name`. Looking up the holder happens on every
    /// call so a concurrent `replace` is picked up without re-registering the callback
    /// itself (spec.md §4.2, "replace atomicity").
    ///
    /// The returned stream only has the *pushed* filters applied; whatever the holder
    /// couldn't translate natively comes back as the residual map so the engine applies it
    /// itself (spec.md §4.5, step 2) instead of silently trusting unfiltered rows.
    pub fn callback_for(registry: Arc<HolderRegistry>, name: String) -> ScanCallback {
        Arc::new(move |projection: Option<Vec<String>>, filters: HashMap<usize, FilterNode>| {
            let holder = registry
                .lookup(&name)
                .ok_or_else(|| Error::unknown_scan_source(&name))?;

            let projection = match projection {
                Some(cols) => Projection::Columns(cols),
                None => Projection::All,
            };

            holder.produce_filtered(projection, &filters)
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::reference::ReferenceEngine;
    use crate::engine::Engine;
    use crate::holder::{ArrowTableHolder, Holder};
    use arrow::array::{ArrayRef, Int64Array};
    use arrow::datatypes::{DataType, Field, Schema};
    use std::sync::Mutex;

    #[test]
    fn unknown_scan_source_fails() {
        let engine: Arc<dyn Engine> = Arc::new(ReferenceEngine::new());
        let alive = Arc::new(());
        let registry = Arc::new(HolderRegistry::new(
            engine,
            Arc::new(Mutex::new(())),
            Arc::downgrade(&alive),
        ));
        let callback = ScanAdapter::callback_for(registry, "missing".to_string());
        let err = callback(None, HashMap::new()).unwrap_err();
        assert_eq!(err.status, crate::error::Status::UnknownScanSource);
    }

    #[test]
    fn callback_sees_live_holder() {
        let engine: Arc<dyn Engine> = Arc::new(ReferenceEngine::new());
        let alive = Arc::new(());
        let registry = Arc::new(HolderRegistry::new(
            engine,
            Arc::new(Mutex::new(())),
            Arc::downgrade(&alive),
        ));
        let schema = Arc::new(Schema::new(vec![Field::new("a", DataType::Int64, true)]));
        let arr: ArrayRef = Arc::new(Int64Array::from(vec![1, 2, 3]));
        let batch = arrow::record_batch::RecordBatch::try_new(schema.clone(), vec![arr]).unwrap();
        let holder = Arc::new(Holder::ArrowTable(ArrowTableHolder::new(schema, vec![batch])));
        registry.register("t", holder, true).unwrap();

        let callback = ScanAdapter::callback_for(registry, "t".to_string());
        let (reader, residual) = callback(None, HashMap::new()).unwrap();
        assert!(residual.is_empty());
        let total: usize = reader.map(|b| b.unwrap().num_rows()).sum();
        assert_eq!(total, 3);
    }
}
