use std::collections::BTreeMap;
use std::sync::Arc;

use ahash::AHashMap;
use parking_lot::Mutex;
use telc_ir::{BaseFunc, GlobalVar, IrModule, Target, excerpt};
use tracing::debug;

use super::EXCERPT_LINES;
use super::artifact::{CachedArtifact, CachedFunc};
use super::key::CompilationKey;
use super::names::{NameTable, mangle_name};
use crate::error::{LowerError, Result};
use crate::scheduler::{ScheduledFunc, Scheduler};

#[derive(Debug, Default)]
struct CacheState {
    primitives: AHashMap<CompilationKey, CachedArtifact>,
    shape_funcs: AHashMap<CompilationKey, CachedArtifact>,
    names: NameTable,
    /// Entry global of each external function to its toolchain name.
    device_contexts: BTreeMap<GlobalVar, String>,
}

/// Memoizes lowering results per `(function, target)`.
///
/// One lock guards both maps, the name table and the device contexts, so a
/// key is never lowered twice and use counts stay consistent with the
/// existence check. Lowering runs under the lock.
pub struct CompilationCache {
    scheduler: Arc<dyn Scheduler>,
    state: Mutex<CacheState>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CacheStats {
    pub primitive_entries: usize,
    pub shape_func_entries: usize,
    pub external_entries: usize,
    pub total_uses: u64,
}

impl CompilationCache {
    pub fn new(scheduler: Arc<dyn Scheduler>) -> Self {
        Self {
            scheduler,
            state: Mutex::new(CacheState::default()),
        }
    }

    /// A cache whose name table already holds every global of `module`.
    pub fn for_module(scheduler: Arc<dyn Scheduler>, module: &IrModule) -> Self {
        let cache = Self::new(scheduler);
        cache.reset_for_module(module);
        cache
    }

    /// Drops every entry and device context and reseeds the name table with
    /// the globals of `module`.
    pub fn reset_for_module(&self, module: &IrModule) {
        let mut state = self.state.lock();
        state.primitives.clear();
        state.shape_funcs.clear();
        state.device_contexts.clear();
        state.names = NameTable::seeded(module.global_vars().map(|var| var.name.clone()));
    }

    /// Lowers `key`, or returns the existing result. Every call counts as a
    /// use. Names minted for the result pass through `mangle` and are then
    /// made unique in the module.
    pub fn lower<M>(&self, key: &CompilationKey, mangle: M) -> Result<CachedFunc>
    where
        M: Fn(&str) -> String,
    {
        debug!(%key, "lowering");
        let mut guard = self.state.lock();
        let state = &mut *guard;

        let artifact = state
            .primitives
            .entry(key.clone())
            .and_modify(|artifact| artifact.use_count += 1)
            .or_insert_with(|| CachedArtifact::with_use_count(1));
        if let Some(cached) = &artifact.cached_func {
            debug!(entry = %cached.prim_fn_var, "already lowered");
            return Ok(cached.clone());
        }

        let cached = if let Some(compiler) = key.external_compiler() {
            let cached = wrap_external(key)?;
            state
                .device_contexts
                .insert(cached.prim_fn_var.clone(), compiler.to_string());
            debug!(
                compiler,
                entry = %cached.prim_fn_var,
                "deferring to external codegen"
            );
            cached
        } else {
            let names = &mut state.names;
            let mut resolver = |name: &str| names.unique_name(&mangle(name));
            let scheduled =
                self.scheduler
                    .schedule(key.source(), key.target(), &mut resolver)?;
            complete(self.scheduler.as_ref(), key.target(), scheduled)?
        };

        debug!(
            entry = %cached.prim_fn_var,
            definitions = cached.funcs.len(),
            "lowered"
        );
        artifact.cached_func = Some(cached.clone());
        Ok(cached)
    }

    /// [`lower`](Self::lower) with names qualified by `module_name`.
    pub fn lower_with_module_name(
        &self,
        key: &CompilationKey,
        module_name: &str,
    ) -> Result<CachedFunc> {
        self.lower(key, |name| mangle_name(module_name, name))
    }

    /// Lowers the shape function of `key`'s source for `key`'s target. A
    /// fresh entry starts at zero uses; later lookups count.
    pub fn lower_shape_function(&self, key: &CompilationKey) -> Result<CachedFunc> {
        debug!(%key, "lowering dynamic shape function");
        let mut guard = self.state.lock();
        let state = &mut *guard;

        let artifact = state
            .shape_funcs
            .entry(key.clone())
            .and_modify(|artifact| artifact.use_count += 1)
            .or_insert_with(|| CachedArtifact::with_use_count(0));
        if let Some(cached) = &artifact.cached_func {
            return Ok(cached.clone());
        }

        let names = &mut state.names;
        let mut resolver = |name: &str| names.unique_name(name);
        let scheduled =
            self.scheduler
                .schedule_shape_func(key.source(), key.target(), &mut resolver)?;
        let cached = complete(self.scheduler.as_ref(), key.target(), scheduled)?;

        debug!(entry = %cached.prim_fn_var, "lowered shape function");
        artifact.cached_func = Some(cached.clone());
        Ok(cached)
    }

    /// Drops every entry of both maps.
    pub fn clear(&self) {
        let mut state = self.state.lock();
        state.primitives.clear();
        state.shape_funcs.clear();
    }

    /// Snapshot of the primitive map.
    pub fn list_entries(&self) -> Vec<(CompilationKey, CachedArtifact)> {
        let state = self.state.lock();
        state
            .primitives
            .iter()
            .map(|(key, artifact)| (key.clone(), artifact.clone()))
            .collect()
    }

    /// Snapshot of the shape-function map.
    pub fn list_shape_func_entries(&self) -> Vec<(CompilationKey, CachedArtifact)> {
        let state = self.state.lock();
        state
            .shape_funcs
            .iter()
            .map(|(key, artifact)| (key.clone(), artifact.clone()))
            .collect()
    }

    pub fn use_count(&self, key: &CompilationKey) -> Option<u64> {
        self.state
            .lock()
            .primitives
            .get(key)
            .map(|artifact| artifact.use_count)
    }

    pub fn shape_func_use_count(&self, key: &CompilationKey) -> Option<u64> {
        self.state
            .lock()
            .shape_funcs
            .get(key)
            .map(|artifact| artifact.use_count)
    }

    pub fn stats(&self) -> CacheStats {
        let state = self.state.lock();
        CacheStats {
            primitive_entries: state.primitives.len(),
            shape_func_entries: state.shape_funcs.len(),
            external_entries: state
                .primitives
                .keys()
                .filter(|key| key.external_compiler().is_some())
                .count(),
            total_uses: state
                .primitives
                .values()
                .chain(state.shape_funcs.values())
                .map(|artifact| artifact.use_count)
                .sum(),
        }
    }

    /// Every prim func produced so far, outside of external entries, each
    /// annotated with the target of the key that produced it.
    pub fn lowered_functions(&self) -> Result<IrModule> {
        let state = self.state.lock();
        let mut module = IrModule::new();

        let primitives = state
            .primitives
            .iter()
            .filter(|(key, _)| key.external_compiler().is_none());
        for (key, artifact) in primitives.chain(state.shape_funcs.iter()) {
            let Some(cached) = &artifact.cached_func else {
                continue;
            };
            for (var, func) in cached.funcs.iter() {
                if func.as_function().is_some_and(|function| function.is_external()) {
                    continue;
                }
                let BaseFunc::Prim(prim) = func else {
                    return Err(unexpected_definition(var, "a prim func", func));
                };
                module.update(var.clone(), prim.clone().with_target(key.target().clone()));
            }
        }
        Ok(module)
    }

    /// Lowered external entries, ordered by entry name.
    pub fn external_entries(&self) -> Vec<(CompilationKey, CachedFunc)> {
        let state = self.state.lock();
        let mut entries: Vec<_> = state
            .primitives
            .iter()
            .filter(|(key, _)| key.external_compiler().is_some())
            .filter_map(|(key, artifact)| {
                artifact
                    .cached_func
                    .as_ref()
                    .map(|cached| (key.clone(), cached.clone()))
            })
            .collect();
        entries.sort_by(|(_, a), (_, b)| a.prim_fn_var.cmp(&b.prim_fn_var));
        entries
    }

    /// Removes the given keys from the primitive map.
    pub fn evict(&self, keys: &[CompilationKey]) {
        let mut state = self.state.lock();
        for key in keys {
            state.primitives.remove(key);
        }
    }

    /// Entry name to use count for every lowered primitive.
    pub fn op_weights(&self) -> BTreeMap<String, u64> {
        let state = self.state.lock();
        state
            .primitives
            .values()
            .filter_map(|artifact| {
                artifact
                    .cached_func
                    .as_ref()
                    .map(|cached| (cached.prim_fn_var.name.clone(), artifact.use_count))
            })
            .collect()
    }

    pub fn device_contexts(&self) -> BTreeMap<GlobalVar, String> {
        self.state.lock().device_contexts.clone()
    }

    /// Moves the device contexts out of the cache.
    pub fn take_device_contexts(&self) -> BTreeMap<GlobalVar, String> {
        std::mem::take(&mut self.state.lock().device_contexts)
    }
}

impl std::fmt::Debug for CompilationCache {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CompilationCache")
            .field("stats", &self.stats())
            .finish_non_exhaustive()
    }
}

/// The cached form of an external function: the function itself, unchanged,
/// as the only definition of a module for the external device.
fn wrap_external(key: &CompilationKey) -> Result<CachedFunc> {
    let source = key.source();
    let symbol = source.attrs.global_symbol.clone().ok_or_else(|| {
        LowerError::MissingGlobalSymbol {
            excerpt: excerpt(&source.to_string(), EXCERPT_LINES),
        }
    })?;
    // Bound to its global symbol as is: the toolchain exports the function
    // under exactly that name.
    let prim_fn_var = GlobalVar::new(symbol);
    let mut funcs = IrModule::new();
    funcs.add(prim_fn_var.clone(), Arc::clone(source))?;
    Ok(CachedFunc {
        target: Target::ext_dev(),
        prim_fn_var,
        inputs: Vec::new(),
        outputs: Vec::new(),
        prim_func: None,
        funcs,
        shape_func_param_states: Vec::new(),
    })
}

/// Collects the definitions of a scheduled function, lowering the schedule
/// unless the scheduler already finished the entry.
fn complete(
    scheduler: &dyn Scheduler,
    target: &Target,
    scheduled: ScheduledFunc,
) -> Result<CachedFunc> {
    let mut funcs = IrModule::new();
    if let Some(prim) = &scheduled.prim_func {
        debug!(entry = %scheduled.prim_fn_var, "scheduler produced a finished prim func");
        funcs.add(scheduled.prim_fn_var.clone(), prim.clone())?;
    } else {
        let lowered = scheduler.lower_schedule(&scheduled, scheduled.prim_fn_var.name())?;
        // Schedulers mint their own globals; the entry keeps the name
        // assigned before scheduling.
        for (var, func) in lowered.funcs.functions {
            let var = if var == lowered.entry {
                scheduled.prim_fn_var.clone()
            } else {
                var
            };
            funcs.add(var, func)?;
        }
    }

    match funcs.lookup(&scheduled.prim_fn_var) {
        Some(BaseFunc::Prim(_)) => {}
        Some(other) => {
            return Err(unexpected_definition(
                &scheduled.prim_fn_var,
                "a prim func",
                other,
            ));
        }
        None => {
            return Err(LowerError::UnexpectedDefinition {
                name: scheduled.prim_fn_var.name.clone(),
                expected: "a prim func",
                found: "nothing".to_string(),
                excerpt: excerpt(&funcs.to_string(), EXCERPT_LINES),
            });
        }
    }

    Ok(CachedFunc {
        target: target.clone(),
        prim_fn_var: scheduled.prim_fn_var,
        inputs: scheduled.inputs,
        outputs: scheduled.outputs,
        prim_func: scheduled.prim_func,
        funcs,
        shape_func_param_states: scheduled.shape_func_param_states,
    })
}

pub(crate) fn unexpected_definition(
    var: &GlobalVar,
    expected: &'static str,
    found: &BaseFunc,
) -> LowerError {
    LowerError::UnexpectedDefinition {
        name: var.name.clone(),
        expected,
        found: found.type_key().to_string(),
        excerpt: excerpt(&found.to_string(), EXCERPT_LINES),
    }
}
