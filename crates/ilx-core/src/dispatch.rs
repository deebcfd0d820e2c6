use std::collections::BTreeMap;
use std::fmt;
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use serde_json::Value;

use crate::method::{MethodError, MethodHandler, MethodResult};

/// Method name prefix owned by the runtime itself (handshake and friends).
pub const RESERVED_PREFIX: &str = "ilx.";

/// Handle returned when a method is registered.
///
/// The handle stays valid after the server starts listening and reports how
/// many times the host has dispatched to the method.
#[derive(Debug, Clone)]
pub struct MethodHandle {
    name: String,
    calls: Arc<AtomicU64>,
}

impl MethodHandle {
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Number of dispatches routed to this method so far.
    pub fn calls(&self) -> u64 {
        self.calls.load(Ordering::Relaxed)
    }
}

/// Registration failures.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RegistrationError {
    EmptyName,
    ReservedName(String),
    Duplicate(String),
}

impl fmt::Display for RegistrationError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::EmptyName => write!(f, "method name must not be empty"),
            Self::ReservedName(name) => {
                write!(f, "method name {name:?} uses reserved prefix {RESERVED_PREFIX:?}")
            }
            Self::Duplicate(name) => write!(f, "duplicate method name: {name}"),
        }
    }
}

impl std::error::Error for RegistrationError {}

struct RegisteredMethod {
    handler: Box<dyn MethodHandler>,
    calls: Arc<AtomicU64>,
}

/// Mapping from remote method name to its handler.
pub struct DispatchTable {
    methods: BTreeMap<String, RegisteredMethod>,
}

impl Default for DispatchTable {
    fn default() -> Self {
        Self::new()
    }
}

impl DispatchTable {
    pub fn new() -> Self {
        Self {
            methods: BTreeMap::new(),
        }
    }

    pub fn register(
        &mut self,
        name: &str,
        handler: Box<dyn MethodHandler>,
    ) -> std::result::Result<MethodHandle, RegistrationError> {
        if name.trim().is_empty() {
            return Err(RegistrationError::EmptyName);
        }
        if name.starts_with(RESERVED_PREFIX) {
            return Err(RegistrationError::ReservedName(name.to_string()));
        }
        if self.methods.contains_key(name) {
            return Err(RegistrationError::Duplicate(name.to_string()));
        }

        let calls = Arc::new(AtomicU64::new(0));
        self.methods.insert(
            name.to_string(),
            RegisteredMethod {
                handler,
                calls: calls.clone(),
            },
        );
        tracing::debug!(method = name, "registered remote method");

        Ok(MethodHandle {
            name: name.to_string(),
            calls,
        })
    }

    pub fn contains(&self, name: &str) -> bool {
        self.methods.contains_key(name)
    }

    /// Registered method names in sorted order.
    pub fn names(&self) -> Vec<&str> {
        self.methods.keys().map(String::as_str).collect()
    }

    pub fn len(&self) -> usize {
        self.methods.len()
    }

    pub fn is_empty(&self) -> bool {
        self.methods.is_empty()
    }

    /// Invoke the handler registered under `name`.
    ///
    /// Returns `None` when no such method exists; the handler is never touched
    /// in that case. A panicking handler is reported as [`MethodError::Failed`].
    pub fn dispatch(&self, name: &str, params: &[Value]) -> Option<MethodResult> {
        let method = self.methods.get(name)?;
        method.calls.fetch_add(1, Ordering::Relaxed);

        let outcome = panic::catch_unwind(AssertUnwindSafe(|| method.handler.invoke(params)));
        Some(outcome.unwrap_or_else(|_| {
            tracing::error!(method = name, "method handler panicked");
            Err(MethodError::Failed(format!("handler for {name} panicked")))
        }))
    }
}
