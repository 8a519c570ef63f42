use std::collections::BTreeMap;
use std::sync::Arc;

use telc_ir::{
    BaseFunc, Call, CallLowered, CallLoweredAttrs, DeviceCopy, Expr, FuncAttrs, Function,
    GlobalVar, If, IrModule, Let, Op, PrimFunc, ShapeFuncInfo, Target, VirtualDevice, excerpt,
};
use tracing::{debug, trace};

use super::classify::{CallTarget, classify, resolve};
use super::scope::LetScope;
use crate::compiler::{CompilationCache, CompilationKey};
use crate::error::{LowerError, Result};

const EXCERPT_LINES: usize = 8;

/// What the lowering of one function produced.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LoweringAnnotation {
    pub prim_fn_var: GlobalVar,
    /// Every prim func belonging to the entry; empty for external functions.
    pub prim_funcs: BTreeMap<GlobalVar, PrimFunc>,
    pub target: Option<Target>,
}

/// A function handed to the per-function callback. Functions reached
/// through a lowered call carry their annotation; function literals that
/// were only called carry none.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AnnotatedFunction {
    pub func: BaseFunc,
    pub annotation: Option<LoweringAnnotation>,
}

impl AnnotatedFunction {
    pub fn plain(func: impl Into<BaseFunc>) -> Self {
        Self {
            func: func.into(),
            annotation: None,
        }
    }
}

/// Rewrites calls to primitive, external and already lowered functions into
/// lowered calls, lowering through the cache as it goes.
pub struct LoweringRewriter<'a, F> {
    module: &'a IrModule,
    cache: &'a CompilationCache,
    module_name: &'a str,
    host_target: &'a Target,
    process_fn: F,
    scope: LetScope,
}

impl<'a, F> LoweringRewriter<'a, F>
where
    F: FnMut(AnnotatedFunction) -> Result<()>,
{
    pub fn new(
        module: &'a IrModule,
        cache: &'a CompilationCache,
        module_name: &'a str,
        host_target: &'a Target,
        process_fn: F,
    ) -> Self {
        Self {
            module,
            cache,
            module_name,
            host_target,
            process_fn,
            scope: LetScope::new(),
        }
    }

    /// The function with its body rewritten.
    pub fn rewrite_function(&mut self, function: &Function) -> Result<Function> {
        let priors: Vec<_> = function
            .params
            .iter()
            .map(|param| self.scope.enter(param, None))
            .collect();
        let body = self.rewrite(&function.body);
        for (param, prior) in function.params.iter().zip(priors) {
            self.scope.exit(param, prior);
        }
        Ok(Function {
            body: body?,
            ..function.clone()
        })
    }

    pub fn rewrite(&mut self, expr: &Expr) -> Result<Expr> {
        match expr {
            Expr::Call(_) | Expr::CallLowered(_) => self.rewrite_call(expr),
            Expr::Let(binding) => self.rewrite_let(binding),
            Expr::Function(function) => {
                if function.is_primitive() || function.is_external() {
                    Ok(expr.clone())
                } else {
                    Ok(Expr::function(self.rewrite_function(function)?))
                }
            }
            Expr::Tuple(fields) => Ok(Expr::Tuple(self.rewrite_all(fields)?)),
            Expr::TupleGetItem { tuple, index } => Ok(Expr::TupleGetItem {
                tuple: Box::new(self.rewrite(tuple)?),
                index: *index,
            }),
            Expr::If(branch) => Ok(Expr::If(If {
                cond: Box::new(self.rewrite(&branch.cond)?),
                then_branch: Box::new(self.rewrite(&branch.then_branch)?),
                else_branch: Box::new(self.rewrite(&branch.else_branch)?),
            })),
            Expr::DeviceCopy(copy) => Ok(Expr::DeviceCopy(DeviceCopy {
                value: Box::new(self.rewrite(&copy.value)?),
                ..copy.clone()
            })),
            Expr::Var(_) | Expr::GlobalVar(_) | Expr::Op(_) | Expr::Constant(_) => {
                Ok(expr.clone())
            }
        }
    }

    fn rewrite_all(&mut self, exprs: &[Expr]) -> Result<Vec<Expr>> {
        exprs.iter().map(|expr| self.rewrite(expr)).collect()
    }

    fn rewrite_let(&mut self, binding: &Let) -> Result<Expr> {
        let value = self.rewrite(&binding.value)?;
        let target = resolve(&binding.value, &self.scope, self.module);
        let callable = target.is_callable();

        let prior = self
            .scope
            .enter(&binding.var, callable.then_some(target));
        let body = self.rewrite(&binding.body);
        self.scope.exit(&binding.var, prior);
        if callable {
            trace!(var = %binding.var.name, "calls through binding lowered");
        }
        // The variable may also appear outside call position.
        Ok(Expr::Let(Let {
            var: binding.var.clone(),
            value: Box::new(value),
            body: Box::new(body?),
        }))
    }

    fn rewrite_call(&mut self, expr: &Expr) -> Result<Expr> {
        let target = classify(expr, &self.scope, self.module);
        let call = match (expr, &target) {
            (Expr::CallLowered(lowered), CallTarget::Passthrough) => {
                return Ok(Expr::CallLowered(CallLowered {
                    args: self.rewrite_all(&lowered.args)?,
                    ..lowered.clone()
                }));
            }
            (Expr::Call(call), _) => call,
            _ => return Ok(expr.clone()),
        };

        match target {
            CallTarget::Primitive(function) => {
                let args = self.rewrite_all(&call.args)?;
                if let Some(copy) = device_copy_body(&function, &call.op)? {
                    return rewrite_device_copy(&function, &call.op, copy, args);
                }
                let target = call_target(call, &function)?;
                self.make_lowered_call(&function, target, args, call)
            }
            CallTarget::External(function) => {
                let args = self.rewrite_all(&call.args)?;
                self.make_lowered_call(&function, Target::ext_dev(), args, call)
            }
            CallTarget::Lowered(var, prim) => {
                let args = self.rewrite_all(&call.args)?;
                self.make_call_to_lowered(var, prim, args, call)
            }
            CallTarget::Unresolved => {
                let op = self.rewrite(&call.op)?;
                if let Expr::Function(function) = &op {
                    (self.process_fn)(AnnotatedFunction::plain(Arc::clone(function)))?;
                }
                Ok(Expr::Call(Call {
                    op: Box::new(op),
                    args: self.rewrite_all(&call.args)?,
                    ..call.clone()
                }))
            }
            CallTarget::Passthrough => Ok(expr.clone()),
        }
    }

    fn make_lowered_call(
        &mut self,
        function: &Arc<Function>,
        target: Target,
        args: Vec<Expr>,
        call: &Call,
    ) -> Result<Expr> {
        let key = CompilationKey::new(Arc::clone(function), target);
        let cached = self.cache.lower_with_module_name(&key, self.module_name)?;
        let external = cached.is_external();
        debug!(
            entry = %cached.prim_fn_var,
            target = %cached.target,
            external,
            "rewriting call to lowered function"
        );

        let prim_funcs = if external {
            BTreeMap::new()
        } else {
            cached
                .funcs
                .prim_funcs()
                .map(|(var, prim)| (var.clone(), prim.clone()))
                .collect()
        };
        (self.process_fn)(AnnotatedFunction {
            func: BaseFunc::Function(Arc::clone(function)),
            annotation: Some(LoweringAnnotation {
                prim_fn_var: cached.prim_fn_var.clone(),
                prim_funcs,
                target: Some(cached.target.clone()),
            }),
        })?;

        let mut attrs = CallLoweredAttrs {
            relay_attrs: function.attrs.clone(),
            all_prim_fn_vars: cached.funcs.global_vars().cloned().collect(),
            reshape_only: !external && function.attrs.reshape_only,
            shape_func: None,
        };

        if function.ret_type.is_dynamic() {
            let shape_key = CompilationKey::new(Arc::clone(function), self.host_target.clone());
            let shape_func = self.cache.lower_shape_function(&shape_key)?;
            debug!(
                entry = %cached.prim_fn_var,
                shape_func = %shape_func.prim_fn_var,
                "attaching shape function"
            );
            attrs.shape_func = Some(ShapeFuncInfo {
                prim_shape_fn_var: shape_func.prim_fn_var.clone(),
                prim_shape_fn_states: shape_func.shape_func_param_states.clone(),
                num_inputs: shape_func.inputs.len(),
                num_outputs: shape_func.outputs.len(),
                all_prim_shape_fn_vars: shape_func.funcs.global_vars().cloned().collect(),
            });
        }

        Ok(Expr::CallLowered(CallLowered {
            callee: cached.prim_fn_var,
            args,
            attrs,
            ty: call.ty.clone(),
            virtual_device: call.virtual_device.clone(),
        }))
    }

    fn make_call_to_lowered(
        &mut self,
        var: GlobalVar,
        prim: PrimFunc,
        args: Vec<Expr>,
        call: &Call,
    ) -> Result<Expr> {
        if call.ty.is_dynamic() {
            return Err(LowerError::DynamicLoweredCall {
                name: var.name,
                ty: call.ty.to_string(),
            });
        }
        let relay_attrs = FuncAttrs {
            global_symbol: prim.attrs.global_symbol.clone(),
            target: prim.attrs.target.clone(),
            extra: prim.attrs.extra.clone(),
            ..FuncAttrs::default()
        };
        let target = prim.target().cloned();
        (self.process_fn)(AnnotatedFunction {
            func: BaseFunc::Prim(prim.clone()),
            annotation: Some(LoweringAnnotation {
                prim_fn_var: var.clone(),
                prim_funcs: BTreeMap::from([(var.clone(), prim)]),
                target,
            }),
        })?;

        Ok(Expr::CallLowered(CallLowered {
            callee: var.clone(),
            args,
            attrs: CallLoweredAttrs {
                relay_attrs,
                all_prim_fn_vars: vec![var],
                reshape_only: false,
                shape_func: None,
            },
            ty: call.ty.clone(),
            virtual_device: call.virtual_device.clone(),
        }))
    }
}

/// Source and destination of a primitive whose body is nothing but a
/// device copy.
struct CopyBody {
    src: VirtualDevice,
    dst: VirtualDevice,
}

/// The copy a primitive wraps, if its body is nothing but a device copy.
/// A bare `device_copy` op call names no source device and is rejected.
fn device_copy_body(function: &Function, callee: &Expr) -> Result<Option<CopyBody>> {
    match &function.body {
        Expr::DeviceCopy(copy) => Ok(Some(CopyBody {
            src: copy.src.clone(),
            dst: copy.dst.clone(),
        })),
        Expr::Call(inner) if matches!(inner.op.as_ref(), Expr::Op(op) if op.name == Op::DEVICE_COPY) => {
            Err(LowerError::DeviceCopyWithoutSource {
                name: callee_label(callee, function),
                excerpt: excerpt(&function.body.to_string(), EXCERPT_LINES),
            })
        }
        _ => Ok(None),
    }
}

fn rewrite_device_copy(
    function: &Function,
    callee: &Expr,
    copy: CopyBody,
    args: Vec<Expr>,
) -> Result<Expr> {
    let arity = args.len();
    let Ok::<[Expr; 1], _>([value]) = args.try_into() else {
        return Err(LowerError::DeviceCopyArity {
            name: callee_label(callee, function),
            arity,
        });
    };
    trace!("unfusing device copy");
    Ok(Expr::device_copy(value, copy.src, copy.dst))
}

/// The target a non-external primitive call is lowered for.
fn call_target(call: &Call, function: &Function) -> Result<Target> {
    match &call.virtual_device.target {
        Some(target) if !call.virtual_device.is_fully_unconstrained() => Ok(target.clone()),
        _ => Err(LowerError::UnresolvedTarget {
            callee: callee_label(&call.op, function),
            excerpt: excerpt(&Expr::Call(call.clone()).to_string(), EXCERPT_LINES),
        }),
    }
}

fn callee_label(callee: &Expr, function: &Function) -> String {
    match callee {
        Expr::Var(var) => format!("%{}", var.name),
        Expr::GlobalVar(global) => global.to_string(),
        _ => function
            .attrs
            .global_symbol
            .clone()
            .unwrap_or_else(|| format!("fn[{}]", function.op_names().join(", "))),
    }
}
