use std::sync::Arc;

use telc_ir::{BaseFunc, Expr, Function, GlobalVar, IrModule, PrimFunc};

use super::scope::LetScope;

/// What a call expression invokes, as far as lowering is concerned.
#[derive(Debug, Clone)]
pub enum CallTarget {
    /// Anything that is not lowered: ordinary functions, operators, closures.
    Unresolved,
    /// A primitive function the built-in scheduler lowers.
    Primitive(Arc<Function>),
    /// A global already bound to a prim func.
    Lowered(GlobalVar, PrimFunc),
    /// A function tagged for an external toolchain.
    External(Arc<Function>),
    /// A lowered call left by an earlier run.
    Passthrough,
}

impl CallTarget {
    /// Whether a let binding resolving to this target is recorded in scope.
    pub fn is_callable(&self) -> bool {
        matches!(
            self,
            CallTarget::Primitive(_) | CallTarget::Lowered(..) | CallTarget::External(_)
        )
    }
}

/// Classifies a call expression. Anything that is not a call classifies as
/// [`CallTarget::Unresolved`].
pub fn classify(expr: &Expr, scope: &LetScope, module: &IrModule) -> CallTarget {
    match expr {
        Expr::CallLowered(_) => CallTarget::Passthrough,
        Expr::Call(call) => resolve(&call.op, scope, module),
        _ => CallTarget::Unresolved,
    }
}

/// Resolves a callee, following let-bound variables and module globals.
pub fn resolve(callee: &Expr, scope: &LetScope, module: &IrModule) -> CallTarget {
    match callee {
        Expr::Var(var) => scope
            .lookup(var)
            .cloned()
            .unwrap_or(CallTarget::Unresolved),
        Expr::GlobalVar(global) => match module.lookup(global) {
            Some(BaseFunc::Prim(prim)) => CallTarget::Lowered(global.clone(), prim.clone()),
            Some(BaseFunc::Function(function)) => resolve_function(function),
            Some(BaseFunc::Opaque { .. }) | None => CallTarget::Unresolved,
        },
        Expr::Function(function) => resolve_function(function),
        _ => CallTarget::Unresolved,
    }
}

fn resolve_function(function: &Arc<Function>) -> CallTarget {
    if !function.is_primitive() && !function.is_external() {
        return CallTarget::Unresolved;
    }
    // Debug hooks stay interpretable.
    if function.single_op_body().is_some_and(|op| op.is_debug()) {
        return CallTarget::Unresolved;
    }
    if function.is_external() {
        CallTarget::External(Arc::clone(function))
    } else {
        CallTarget::Primitive(Arc::clone(function))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use telc_ir::{Buffer, DType, FuncAttrs, Op, Stmt, Target, TensorType, Type, Var};

    fn tensor() -> TensorType {
        TensorType::fixed(&[4], DType::Float32)
    }

    fn unary(op: &str, attrs: FuncAttrs) -> Arc<Function> {
        let x = Var::tensor("x", tensor());
        let body = Expr::call(Expr::op(op), vec![Expr::var(&x)], tensor().into());
        Arc::new(Function::new(vec![x], body, Type::Tensor(tensor())).with_attrs(attrs))
    }

    fn call_to(callee: Expr) -> Expr {
        Expr::call(callee, vec![Expr::constant(tensor())], tensor().into())
    }

    #[test]
    fn function_literals_classify_by_tag() {
        let module = IrModule::new();
        let scope = LetScope::new();

        let primitive = call_to(Expr::Function(unary("exp", FuncAttrs::primitive())));
        assert!(matches!(
            classify(&primitive, &scope, &module),
            CallTarget::Primitive(_)
        ));

        let external = call_to(Expr::Function(unary(
            "exp",
            FuncAttrs::external("ccompiler", "ccompiler_0"),
        )));
        assert!(matches!(
            classify(&external, &scope, &module),
            CallTarget::External(_)
        ));

        let plain = call_to(Expr::Function(unary("exp", FuncAttrs::default())));
        assert!(matches!(
            classify(&plain, &scope, &module),
            CallTarget::Unresolved
        ));
    }

    #[test]
    fn debug_hooks_are_never_lowered() {
        let module = IrModule::new();
        let hook = call_to(Expr::Function(unary(Op::DEBUG, FuncAttrs::primitive())));
        assert!(matches!(
            classify(&hook, &LetScope::new(), &module),
            CallTarget::Unresolved
        ));
    }

    #[test]
    fn globals_resolve_through_the_module() {
        let prim = PrimFunc::from_buffers(vec![Buffer::new("x", &tensor())], Stmt::NoOp)
            .with_target(Target::new("llvm"));
        let mut module = IrModule::new();
        module.update(GlobalVar::new("kernel"), prim);

        let lowered = call_to(Expr::global("kernel"));
        assert!(matches!(
            classify(&lowered, &LetScope::new(), &module),
            CallTarget::Lowered(ref var, _) if var.name() == "kernel"
        ));

        let missing = call_to(Expr::global("absent"));
        assert!(matches!(
            classify(&missing, &LetScope::new(), &module),
            CallTarget::Unresolved
        ));
    }

    #[test]
    fn variables_resolve_through_scope() {
        let module = IrModule::new();
        let mut scope = LetScope::new();
        let f = Var::new("f", Type::Unknown);
        let call = call_to(Expr::var(&f));

        assert!(matches!(
            classify(&call, &scope, &module),
            CallTarget::Unresolved
        ));
        let prior = scope.enter(&f, Some(CallTarget::Primitive(unary("exp", FuncAttrs::primitive()))));
        assert!(matches!(
            classify(&call, &scope, &module),
            CallTarget::Primitive(_)
        ));
        scope.exit(&f, prior);
        assert!(matches!(
            classify(&call, &scope, &module),
            CallTarget::Unresolved
        ));
    }
}
