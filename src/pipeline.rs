//! The lowering driver: rewrite, extract externals, merge, annotate.

use std::collections::btree_map::Entry;

use telc_ir::{IrModule, Target};
use tracing::{debug, info};

use crate::compiler::{Compiler, add_definition};
use crate::error::{LowerError, Result};
use crate::lower::{AnnotatedFunction, lower_tensor_exprs};

impl Compiler {
    /// Lowers every primitive and external function `module` calls.
    ///
    /// The result holds the rewritten functions, one external stub per
    /// externally compiled function, and every lowered prim func. The
    /// external runtime modules, the external device contexts and, when
    /// enabled, the operator weights are added to its attributes.
    /// `process_fn` sees each function as it is lowered. Any failure aborts
    /// the whole run.
    pub fn lower_module<F>(
        &self,
        module: &IrModule,
        module_name: &str,
        process_fn: F,
        host_target: &Target,
    ) -> Result<IrModule>
    where
        F: FnMut(AnnotatedFunction) -> Result<()>,
    {
        info!(module_name, functions = module.len(), "lowering module");
        self.cache().reset_for_module(module);

        let mut lowered =
            lower_tensor_exprs(module, self.cache(), module_name, host_target, process_fn)?;

        let dispatcher = self.dispatcher();
        dispatcher.add_externs(&mut lowered)?;

        let prim_funcs = self.cache().lowered_functions()?;
        debug!(prim_funcs = prim_funcs.len(), "merging lowered functions");
        for (var, func) in prim_funcs.functions {
            add_definition(&mut lowered, var, func)?;
        }

        let external_mods = dispatcher.lower_external_functions()?;
        if !external_mods.is_empty() {
            info!(count = external_mods.len(), "collected external runtime modules");
        }
        lowered.attrs.external_mods.extend(external_mods);

        for (var, compiler) in self.cache().take_device_contexts() {
            match lowered.attrs.device_contexts.entry(var) {
                Entry::Occupied(entry) => {
                    return Err(LowerError::DuplicateAttr {
                        attr: "device_contexts",
                        key: entry.key().name.clone(),
                    });
                }
                Entry::Vacant(entry) => {
                    entry.insert(compiler);
                }
            }
        }

        if self.config().record_op_weights {
            for (name, weight) in self.cache().op_weights() {
                match lowered.attrs.op_weights.entry(name) {
                    Entry::Occupied(entry) => {
                        return Err(LowerError::DuplicateAttr {
                            attr: "op_weights",
                            key: entry.key().clone(),
                        });
                    }
                    Entry::Vacant(entry) => {
                        entry.insert(weight);
                    }
                }
            }
        }

        info!(
            module_name,
            functions = lowered.len(),
            external_mods = lowered.attrs.external_mods.len(),
            "lowered module"
        );
        Ok(lowered)
    }

    /// [`lower_module`](Self::lower_module) with the configured module name
    /// and host target, ignoring the per-function callback.
    pub fn lower(&self, module: &IrModule) -> Result<IrModule> {
        let config = self.config();
        self.lower_module(module, &config.module_name, |_| Ok(()), &config.host_target)
    }
}
