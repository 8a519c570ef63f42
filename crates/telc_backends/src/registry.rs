use std::collections::HashMap;
use std::sync::Arc;

use once_cell::sync::Lazy;
use parking_lot::Mutex;
use telc_ir::{Function, RuntimeModule};
use thiserror::Error;
use tracing::debug;

/// Namespace under which external compilers are registered.
pub const EXTERNAL_CODEGEN_NAMESPACE: &str = "codegen.ext";

/// Registry key of the backend for the `compiler` tag of a function.
pub fn external_codegen_key(compiler: &str) -> String {
    format!("{EXTERNAL_CODEGEN_NAMESPACE}.{compiler}")
}

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum BackendError {
    #[error("backend `{backend}` failed to compile `{symbol}`: {message}")]
    Compile {
        backend: String,
        symbol: String,
        message: String,
    },
    #[error("backend `{backend}` rejected the function: {message}")]
    Unsupported { backend: String, message: String },
}

/// Compiles one high-level function into an opaque runtime module. `None`
/// means the backend produced nothing to link, which callers tolerate.
pub type BackendFn =
    Arc<dyn Fn(&Function) -> Result<Option<RuntimeModule>, BackendError> + Send + Sync>;

/// Static registration hook collected from every linked crate.
pub struct BackendProvider {
    pub register: fn(&BackendRegistry),
}

inventory::collect!(BackendProvider);

#[derive(Clone, Default)]
pub struct BackendRegistry {
    inner: Arc<Mutex<HashMap<String, BackendFn>>>,
}

impl BackendRegistry {
    /// An empty registry, without the statically submitted backends.
    pub fn new() -> Self {
        Self::default()
    }

    /// A fresh registry holding every statically submitted backend.
    pub fn with_providers() -> Self {
        let registry = Self::new();
        for provider in inventory::iter::<BackendProvider> {
            (provider.register)(&registry);
        }
        registry
    }

    /// The process-wide registry.
    pub fn global() -> &'static Self {
        static GLOBAL: Lazy<BackendRegistry> = Lazy::new(BackendRegistry::with_providers);
        &GLOBAL
    }

    /// Registers `backend` under `key`, replacing any previous entry.
    pub fn register<F>(&self, key: impl Into<String>, backend: F)
    where
        F: Fn(&Function) -> Result<Option<RuntimeModule>, BackendError> + Send + Sync + 'static,
    {
        let key = key.into();
        debug!(backend = %key, "registering codegen backend");
        self.inner.lock().insert(key, Arc::new(backend));
    }

    /// Shorthand for registering an external compiler by its `compiler` tag.
    pub fn register_external<F>(&self, compiler: &str, backend: F)
    where
        F: Fn(&Function) -> Result<Option<RuntimeModule>, BackendError> + Send + Sync + 'static,
    {
        self.register(external_codegen_key(compiler), backend);
    }

    pub fn lookup(&self, key: &str) -> Option<BackendFn> {
        self.inner.lock().get(key).cloned()
    }

    pub fn contains(&self, key: &str) -> bool {
        self.inner.lock().contains_key(key)
    }

    pub fn remove(&self, key: &str) -> bool {
        self.inner.lock().remove(key).is_some()
    }

    /// Registered keys, sorted.
    pub fn keys(&self) -> Vec<String> {
        let mut keys: Vec<String> = self.inner.lock().keys().cloned().collect();
        keys.sort();
        keys
    }
}

impl std::fmt::Debug for BackendRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BackendRegistry")
            .field("backends", &self.keys())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use telc_ir::{Expr, Type};

    fn register_echo(registry: &BackendRegistry) {
        registry.register_external("echo", |function: &Function| {
            let symbol = function.attrs.global_symbol.clone().unwrap_or_default();
            Ok(Some(RuntimeModule::new("echo", "c").with_symbol(symbol)))
        });
    }

    inventory::submit! {
        BackendProvider {
            register: register_echo,
        }
    }

    #[test]
    fn static_providers_seed_fresh_registries() {
        let registry = BackendRegistry::with_providers();
        assert!(registry.contains("codegen.ext.echo"));
        assert!(BackendRegistry::global().contains("codegen.ext.echo"));
        assert!(!BackendRegistry::new().contains("codegen.ext.echo"));
    }

    #[test]
    fn lookup_invokes_registered_backend() {
        let registry = BackendRegistry::new();
        register_echo(&registry);
        let backend = registry
            .lookup(&external_codegen_key("echo"))
            .expect("echo backend registered");

        let mut function = Function::new(Vec::new(), Expr::Tuple(Vec::new()), Type::Unknown);
        function.attrs.global_symbol = Some("default_echo_main_0".into());
        let module = backend(&function).expect("compile").expect("module");
        assert!(module.provides("default_echo_main_0", false));
    }

    #[test]
    fn register_replaces_and_remove_drops() {
        let registry = BackendRegistry::new();
        registry.register("codegen.ext.a", |_: &Function| Ok(None));
        registry.register("codegen.ext.a", |_: &Function| {
            Err(BackendError::Unsupported {
                backend: "a".into(),
                message: "nope".into(),
            })
        });
        assert_eq!(registry.keys(), vec!["codegen.ext.a".to_string()]);
        assert!(registry.remove("codegen.ext.a"));
        assert!(registry.lookup("codegen.ext.a").is_none());
    }
}
