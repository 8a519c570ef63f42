//! Splits a lowered module into one module per target.

use std::collections::BTreeMap;

use telc_ir::{BaseFunc, IrModule, Target};
use tracing::debug;

use crate::error::{LowerError, Result};

/// Groups the prim funcs of a fully lowered `module` by their target. Every
/// partition carries the module attributes. High-level functions are left
/// out; any other definition means lowering did not finish.
pub fn per_target_modules(module: &IrModule) -> Result<BTreeMap<Target, IrModule>> {
    let mut partitions: BTreeMap<Target, IrModule> = BTreeMap::new();
    for (var, func) in module.iter() {
        match func {
            BaseFunc::Function(_) => {}
            BaseFunc::Prim(prim) => {
                let target = prim
                    .target()
                    .ok_or_else(|| LowerError::MissingTarget {
                        name: var.name.clone(),
                    })?
                    .clone();
                partitions
                    .entry(target)
                    .or_insert_with(|| IrModule::with_attrs(module.attrs.clone()))
                    .update(var.clone(), prim.clone());
            }
            BaseFunc::Opaque { type_key } => {
                return Err(LowerError::UnsupportedDefinition {
                    name: var.name.clone(),
                    type_key: type_key.clone(),
                });
            }
        }
    }
    debug!(targets = partitions.len(), "partitioned module by target");
    Ok(partitions)
}

#[cfg(test)]
mod tests {
    use super::*;
    use telc_ir::{Buffer, DType, Expr, Function, GlobalVar, PrimFunc, Stmt, TensorType, Type};

    fn prim(target: Option<&str>) -> PrimFunc {
        let tensor = TensorType::fixed(&[4], DType::Float32);
        let prim = PrimFunc::from_buffers(vec![Buffer::new("x", &tensor)], Stmt::NoOp);
        match target {
            Some(kind) => prim.with_target(Target::new(kind)),
            None => prim,
        }
    }

    #[test]
    fn prim_funcs_are_grouped_by_target() {
        let mut module = IrModule::new();
        module.attrs.extra.insert("executor".into(), "graph".into());
        module.update(GlobalVar::new("a"), prim(Some("llvm")));
        module.update(GlobalVar::new("b"), prim(Some("cuda")));
        module.update(GlobalVar::new("c"), prim(Some("llvm")));
        module.update(
            GlobalVar::new("main"),
            Function::new(Vec::new(), Expr::Tuple(Vec::new()), Type::Tuple(Vec::new())),
        );

        let parts = per_target_modules(&module).expect("partition");
        assert_eq!(parts.len(), 2);
        let cpu = &parts[&Target::new("llvm")];
        assert_eq!(cpu.len(), 2);
        assert!(cpu.contains("a") && cpu.contains("c"));
        assert_eq!(cpu.attrs, module.attrs);
        assert_eq!(parts[&Target::new("cuda")].len(), 1);
    }

    #[test]
    fn missing_target_is_fatal() {
        let mut module = IrModule::new();
        module.update(GlobalVar::new("kernel"), prim(None));
        let err = per_target_modules(&module).expect_err("no target");
        assert_eq!(
            err,
            LowerError::MissingTarget {
                name: "kernel".into()
            }
        );
    }

    #[test]
    fn unknown_definitions_are_fatal() {
        let mut module = IrModule::new();
        module.update(
            GlobalVar::new("blob"),
            BaseFunc::Opaque {
                type_key: "relay.Constructor".into(),
            },
        );
        assert!(matches!(
            per_target_modules(&module),
            Err(LowerError::UnsupportedDefinition { .. })
        ));
    }
}
