//! The compilation cache and the context that owns it.

mod artifact;
mod cache;
mod external;
mod key;
mod names;

pub use artifact::{CachedArtifact, CachedFunc};
pub use cache::{CacheStats, CompilationCache};
pub use external::ExternalCodegenDispatcher;
pub use key::CompilationKey;
pub use names::{NameTable, mangle_name};

use std::collections::BTreeMap;
use std::sync::Arc;

use telc_backends::BackendRegistry;
use telc_ir::{BaseFunc, GlobalVar, IrModule, excerpt};

use crate::config::LowerConfig;
use crate::error::{LowerError, Result};
use crate::scheduler::{ReferenceScheduler, Scheduler};

pub(crate) const EXCERPT_LINES: usize = 12;

/// Everything one lowering run needs: the cache, the backends external
/// functions are dispatched to, and the run configuration. Constructed by
/// the driver and passed explicitly to each stage.
#[derive(Debug)]
pub struct Compiler {
    cache: CompilationCache,
    registry: BackendRegistry,
    config: LowerConfig,
}

impl Compiler {
    pub fn new(
        scheduler: Arc<dyn Scheduler>,
        registry: BackendRegistry,
        config: LowerConfig,
    ) -> Self {
        Self {
            cache: CompilationCache::new(scheduler),
            registry,
            config,
        }
    }

    /// The reference scheduler and the process-wide backend registry.
    pub fn with_config(config: LowerConfig) -> Self {
        Self::new(
            Arc::new(ReferenceScheduler),
            BackendRegistry::global().clone(),
            config,
        )
    }

    /// An isolated instance: its own cache and its own registry holding only
    /// the statically linked backends.
    pub fn for_tests() -> Self {
        Self::new(
            Arc::new(ReferenceScheduler),
            BackendRegistry::with_providers(),
            LowerConfig::default(),
        )
    }

    pub fn cache(&self) -> &CompilationCache {
        &self.cache
    }

    pub fn registry(&self) -> &BackendRegistry {
        &self.registry
    }

    pub fn config(&self) -> &LowerConfig {
        &self.config
    }

    pub fn dispatcher(&self) -> ExternalCodegenDispatcher<'_> {
        ExternalCodegenDispatcher::new(&self.cache, &self.registry)
            .with_namespace(&self.config.external_namespace)
    }

    pub fn list_cache_entries(&self) -> Vec<(CompilationKey, CachedArtifact)> {
        self.cache.list_entries()
    }

    pub fn clear_cache(&self) {
        self.cache.clear();
    }

    /// Use count of every lowered primitive, keyed by entry name.
    pub fn operator_weights(&self) -> BTreeMap<String, u64> {
        self.cache.op_weights()
    }
}

/// Binds `var` in `module`, failing with both definitions when it is taken.
pub(crate) fn add_definition(module: &mut IrModule, var: GlobalVar, func: BaseFunc) -> Result<()> {
    if let Some(existing) = module.lookup(&var) {
        return Err(LowerError::DuplicateGlobal {
            name: var.name,
            existing: excerpt(&existing.to_string(), EXCERPT_LINES),
            new: excerpt(&func.to_string(), EXCERPT_LINES),
        });
    }
    module.add(var, func)?;
    Ok(())
}
