use telc_backends::{BackendFn, BackendRegistry, EXTERNAL_CODEGEN_NAMESPACE};
use telc_ir::{FuncAttrs, Function, IrModule, RuntimeModule, excerpt};
use telc_utils::suggest::find_best_match;
use tracing::{debug, warn};

use super::cache::CompilationCache;
use super::key::CompilationKey;
use super::{EXCERPT_LINES, add_definition};
use crate::error::{LowerError, Result};

/// Hands functions tagged for external toolchains to their registered
/// backends and leaves stubs for them in the module.
pub struct ExternalCodegenDispatcher<'a> {
    cache: &'a CompilationCache,
    registry: &'a BackendRegistry,
    namespace: &'a str,
}

struct Job {
    key: CompilationKey,
    compiler: String,
    symbol: String,
    backend: BackendFn,
}

impl<'a> ExternalCodegenDispatcher<'a> {
    pub fn new(cache: &'a CompilationCache, registry: &'a BackendRegistry) -> Self {
        Self {
            cache,
            registry,
            namespace: EXTERNAL_CODEGEN_NAMESPACE,
        }
    }

    /// Looks backends up under `namespace` instead of `codegen.ext`.
    pub fn with_namespace(mut self, namespace: &'a str) -> Self {
        self.namespace = namespace;
        self
    }

    fn backend_key(&self, compiler: &str) -> String {
        format!("{}.{compiler}", self.namespace)
    }

    /// Removes every definition tagged with a compiler and binds a stub,
    /// carrying only `external_symbol`, for each external function the cache
    /// holds.
    pub fn add_externs(&self, module: &mut IrModule) -> Result<()> {
        let tagged: Vec<_> = module
            .iter()
            .filter(|(_, func)| func.as_function().is_some_and(|f| f.is_external()))
            .map(|(var, _)| var.clone())
            .collect();
        for var in &tagged {
            module.remove(var);
        }

        for (_, cached) in self.cache.external_entries() {
            for (var, func) in cached.funcs.iter() {
                let Some(function) = func.as_function() else {
                    continue;
                };
                let stub = Function {
                    attrs: FuncAttrs {
                        external_symbol: Some(var.name.clone()),
                        ..FuncAttrs::default()
                    },
                    ..Function::clone(function)
                };
                debug!(global = %var, "adding external stub");
                add_definition(module, var.clone(), stub.into())?;
            }
        }
        Ok(())
    }

    /// Compiles every external entry with its backend and evicts those
    /// entries from the cache. Backends are resolved for all entries before
    /// any of them runs, so a missing registration produces nothing.
    pub fn lower_external_functions(&self) -> Result<Vec<RuntimeModule>> {
        let mut jobs = Vec::new();
        for (key, _) in self.cache.external_entries() {
            let Some(compiler) = key.external_compiler().map(str::to_string) else {
                continue;
            };
            let symbol = key.source().attrs.global_symbol.clone().ok_or_else(|| {
                LowerError::MissingGlobalSymbol {
                    excerpt: excerpt(&key.source().to_string(), EXCERPT_LINES),
                }
            })?;
            let backend_key = self.backend_key(&compiler);
            let Some(backend) = self.registry.lookup(&backend_key) else {
                let suggestion = find_best_match(&backend_key, self.registry.keys());
                return Err(LowerError::MissingBackend {
                    key: backend_key,
                    suggestion,
                });
            };
            jobs.push(Job {
                key,
                compiler,
                symbol,
                backend,
            });
        }

        let mut modules = Vec::new();
        let mut evicted = Vec::with_capacity(jobs.len());
        for job in jobs {
            debug!(
                compiler = %job.compiler,
                symbol = %job.symbol,
                "using external codegen"
            );
            // The compiler tag has served its purpose once the backend is chosen.
            let mut source = Function::clone(job.key.source());
            source.attrs.compiler = None;

            match (job.backend)(&source)? {
                Some(module) => {
                    if !module.provides(&job.symbol, true) {
                        debug!(
                            compiler = %job.compiler,
                            symbol = %job.symbol,
                            "external runtime module does not define the symbol; \
                             assuming it is tracked separately"
                        );
                    }
                    modules.push(module);
                }
                None => warn!(
                    compiler = %job.compiler,
                    "no external runtime module was generated by external codegen"
                ),
            }
            evicted.push(job.key);
        }

        self.cache.evict(&evicted);
        Ok(modules)
    }
}
