use ahash::AHashMap;

use telc_ir::Var;

use super::classify::CallTarget;

/// What each let-bound variable in scope resolves to, when it resolves to
/// something callable.
#[derive(Debug, Default)]
pub struct LetScope {
    bindings: AHashMap<u32, CallTarget>,
}

impl LetScope {
    pub fn new() -> Self {
        Self::default()
    }

    /// Binds `var` for the scope being entered. `None` hides any outer
    /// binding of the same variable. Returns the binding to restore on exit.
    pub fn enter(&mut self, var: &Var, target: Option<CallTarget>) -> Option<CallTarget> {
        match target {
            Some(target) => self.bindings.insert(var.id, target),
            None => self.bindings.remove(&var.id),
        }
    }

    pub fn exit(&mut self, var: &Var, prior: Option<CallTarget>) {
        match prior {
            Some(prior) => {
                self.bindings.insert(var.id, prior);
            }
            None => {
                self.bindings.remove(&var.id);
            }
        }
    }

    pub fn lookup(&self, var: &Var) -> Option<&CallTarget> {
        self.bindings.get(&var.id)
    }

    pub fn is_empty(&self) -> bool {
        self.bindings.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::*;
    use telc_ir::{DType, Expr, FuncAttrs, Function, TensorType, Type};

    fn primitive() -> CallTarget {
        let tensor = TensorType::fixed(&[2], DType::Float32);
        let x = Var::tensor("x", tensor.clone());
        let body = Expr::call(Expr::op("exp"), vec![Expr::var(&x)], tensor.clone().into());
        CallTarget::Primitive(Arc::new(
            Function::new(vec![x], body, Type::Tensor(tensor)).with_attrs(FuncAttrs::primitive()),
        ))
    }

    #[test]
    fn inner_binding_is_gone_after_exit() {
        let mut scope = LetScope::new();
        let f = Var::new("f", Type::Unknown);

        let prior = scope.enter(&f, Some(primitive()));
        assert!(scope.lookup(&f).is_some());
        scope.exit(&f, prior);
        assert!(scope.lookup(&f).is_none());
        assert!(scope.is_empty());
    }

    #[test]
    fn shadowing_restores_outer_binding() {
        let mut scope = LetScope::new();
        let f = Var::new("f", Type::Unknown);

        let outer = scope.enter(&f, Some(primitive()));
        let inner = scope.enter(&f, None);
        assert!(scope.lookup(&f).is_none());
        scope.exit(&f, inner);
        assert!(matches!(scope.lookup(&f), Some(CallTarget::Primitive(_))));
        scope.exit(&f, outer);
        assert!(scope.lookup(&f).is_none());
    }
}
