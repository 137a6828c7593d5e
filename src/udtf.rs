//! User-defined table functions: a host-language callable appearing as a relation in SQL
//! (spec.md §3, "UDTF registration").

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use crate::connection::ConnectionCore;
use crate::error::{Error, Result, Status};
use crate::filter::ScalarValue;
use crate::holder::Holder;

/// Arguments bound for one UDTF invocation, already parsed from the call-site literals
/// (spec.md §4.6, "Parse literal arguments").
#[derive(Debug, Clone, Default)]
pub struct UdtfArgs {
    pub positional: Vec<ScalarValue>,
    pub named: HashMap<String, ScalarValue>,
}

/// Arity introspection for a registered UDTF (spec.md §3).
#[derive(Debug, Clone)]
pub struct UdtfSignature {
    pub param_names: Vec<String>,
    /// Whether the final declared parameter is named `conn`, in which case the current
    /// connection is injected rather than bound from the call site (spec.md §3/§4.6).
    pub injects_conn: bool,
}

impl UdtfSignature {
    pub fn new(param_names: Vec<String>) -> Self {
        let injects_conn = param_names.last().map(|p| p == "conn").unwrap_or(false);
        Self { param_names, injects_conn }
    }
}

pub type UdtfCallable =
    Arc<dyn Fn(UdtfArgs, Option<Arc<ConnectionCore>>) -> Result<Arc<Holder>> + Send + Sync>;

struct UdtfEntry {
    signature: UdtfSignature,
    callable: UdtfCallable,
}

/// Name → (callable, arity introspection), per spec.md §3.
#[derive(Default)]
pub struct UdtfRegistry {
    entries: Mutex<HashMap<String, UdtfEntry>>,
}

impl UdtfRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&self, name: &str, signature: UdtfSignature, callable: UdtfCallable) {
        self.entries
            .lock()
            .unwrap()
            .insert(name.to_string(), UdtfEntry { signature, callable });
    }

    pub fn contains(&self, name: &str) -> bool {
        self.entries.lock().unwrap().contains_key(name)
    }

    pub fn has_any(&self) -> bool {
        !self.entries.lock().unwrap().is_empty()
    }

    pub fn injects_conn(&self, name: &str) -> bool {
        self.entries
            .lock()
            .unwrap()
            .get(name)
            .map(|e| e.signature.injects_conn)
            .unwrap_or(false)
    }

    /// Invoke the UDTF, injecting the connection when its signature asks for it
    /// (spec.md §4.6). A callable failure is wrapped as `UdtfExecutionFailed`.
    pub fn invoke(
        &self,
        name: &str,
        args: UdtfArgs,
        conn: Option<Arc<ConnectionCore>>,
    ) -> Result<Arc<Holder>> {
        let (callable, injects_conn) = {
            let entries = self.entries.lock().unwrap();
            let entry = entries
                .get(name)
                .ok_or_else(|| Error::new(format!("no UDTF registered: {name}"), Status::UdtfNotRegistered))?;
            (entry.callable.clone(), entry.signature.injects_conn)
        };

        let injected = if injects_conn { conn } else { None };

        callable(args, injected).map_err(|e| {
            Error::new(
                format!("UDTF '{name}' failed: {}", e.message),
                Status::UdtfExecutionFailed,
            )
        })
    }
}
