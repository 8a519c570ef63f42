//! Structural hashing and equality of functions up to renaming of the
//! variables they bind. Free variables keep their identity.

use std::hash::{Hash, Hasher};

use ahash::AHashMap;

use crate::expr::{Expr, Var};
use crate::function::Function;

/// Feeds `function` into `state` so that alpha-equivalent functions hash
/// alike.
pub fn hash_function<H: Hasher>(function: &Function, state: &mut H) {
    let mut hasher = StructuralHasher {
        state,
        bound: AHashMap::new(),
    };
    hasher.function(function);
}

/// Whether `a` and `b` are equal up to consistent renaming of bound
/// variables.
pub fn function_eq(a: &Function, b: &Function) -> bool {
    let mut eq = StructuralEq {
        lhs: AHashMap::new(),
        rhs: AHashMap::new(),
        next: 0,
    };
    eq.function(a, b)
}

struct StructuralHasher<'h, H: Hasher> {
    state: &'h mut H,
    bound: AHashMap<u32, usize>,
}

impl<H: Hasher> StructuralHasher<'_, H> {
    fn bind(&mut self, var: &Var) {
        let index = self.bound.len();
        self.bound.insert(var.id, index);
        var.ty.hash(self.state);
    }

    fn var(&mut self, var: &Var) {
        match self.bound.get(&var.id) {
            Some(index) => {
                0u8.hash(self.state);
                index.hash(self.state);
            }
            None => {
                1u8.hash(self.state);
                var.id.hash(self.state);
            }
        }
    }

    fn function(&mut self, function: &Function) {
        function.params.len().hash(self.state);
        for param in &function.params {
            self.bind(param);
        }
        function.ret_type.hash(self.state);
        function.attrs.hash(self.state);
        self.expr(&function.body);
    }

    fn exprs(&mut self, exprs: &[Expr]) {
        exprs.len().hash(self.state);
        for expr in exprs {
            self.expr(expr);
        }
    }

    fn expr(&mut self, expr: &Expr) {
        std::mem::discriminant(expr).hash(self.state);
        match expr {
            Expr::Var(var) => self.var(var),
            Expr::GlobalVar(global) => global.hash(self.state),
            Expr::Op(op) => op.hash(self.state),
            Expr::Constant(constant) => constant.hash(self.state),
            Expr::Tuple(fields) => self.exprs(fields),
            Expr::TupleGetItem { tuple, index } => {
                index.hash(self.state);
                self.expr(tuple);
            }
            Expr::Call(call) => {
                self.expr(&call.op);
                self.exprs(&call.args);
                call.ty.hash(self.state);
                call.virtual_device.hash(self.state);
            }
            Expr::CallLowered(call) => {
                call.callee.hash(self.state);
                self.exprs(&call.args);
                call.attrs.hash(self.state);
                call.ty.hash(self.state);
                call.virtual_device.hash(self.state);
            }
            Expr::Let(binding) => {
                self.expr(&binding.value);
                self.bind(&binding.var);
                self.expr(&binding.body);
            }
            Expr::If(branch) => {
                self.expr(&branch.cond);
                self.expr(&branch.then_branch);
                self.expr(&branch.else_branch);
            }
            Expr::Function(function) => self.function(function),
            Expr::DeviceCopy(copy) => {
                self.expr(&copy.value);
                copy.src.hash(self.state);
                copy.dst.hash(self.state);
            }
        }
    }
}

struct StructuralEq {
    lhs: AHashMap<u32, usize>,
    rhs: AHashMap<u32, usize>,
    next: usize,
}

impl StructuralEq {
    fn bind(&mut self, a: &Var, b: &Var) -> bool {
        if a.ty != b.ty {
            return false;
        }
        self.lhs.insert(a.id, self.next);
        self.rhs.insert(b.id, self.next);
        self.next += 1;
        true
    }

    fn var(&self, a: &Var, b: &Var) -> bool {
        match (self.lhs.get(&a.id), self.rhs.get(&b.id)) {
            (Some(x), Some(y)) => x == y,
            (None, None) => a == b,
            _ => false,
        }
    }

    fn function(&mut self, a: &Function, b: &Function) -> bool {
        a.params.len() == b.params.len()
            && a.ret_type == b.ret_type
            && a.attrs == b.attrs
            && a.params.iter().zip(&b.params).all(|(x, y)| self.bind(x, y))
            && self.expr(&a.body, &b.body)
    }

    fn exprs(&mut self, a: &[Expr], b: &[Expr]) -> bool {
        a.len() == b.len() && a.iter().zip(b).all(|(x, y)| self.expr(x, y))
    }

    fn expr(&mut self, a: &Expr, b: &Expr) -> bool {
        match (a, b) {
            (Expr::Var(x), Expr::Var(y)) => self.var(x, y),
            (Expr::GlobalVar(x), Expr::GlobalVar(y)) => x == y,
            (Expr::Op(x), Expr::Op(y)) => x == y,
            (Expr::Constant(x), Expr::Constant(y)) => x == y,
            (Expr::Tuple(x), Expr::Tuple(y)) => self.exprs(x, y),
            (
                Expr::TupleGetItem { tuple: x, index: i },
                Expr::TupleGetItem { tuple: y, index: j },
            ) => i == j && self.expr(x, y),
            (Expr::Call(x), Expr::Call(y)) => {
                x.ty == y.ty
                    && x.virtual_device == y.virtual_device
                    && self.expr(&x.op, &y.op)
                    && self.exprs(&x.args, &y.args)
            }
            (Expr::CallLowered(x), Expr::CallLowered(y)) => {
                x.callee == y.callee
                    && x.attrs == y.attrs
                    && x.ty == y.ty
                    && x.virtual_device == y.virtual_device
                    && self.exprs(&x.args, &y.args)
            }
            (Expr::Let(x), Expr::Let(y)) => {
                self.expr(&x.value, &y.value)
                    && self.bind(&x.var, &y.var)
                    && self.expr(&x.body, &y.body)
            }
            (Expr::If(x), Expr::If(y)) => {
                self.expr(&x.cond, &y.cond)
                    && self.expr(&x.then_branch, &y.then_branch)
                    && self.expr(&x.else_branch, &y.else_branch)
            }
            (Expr::Function(x), Expr::Function(y)) => self.function(x, y),
            (Expr::DeviceCopy(x), Expr::DeviceCopy(y)) => {
                x.src == y.src && x.dst == y.dst && self.expr(&x.value, &y.value)
            }
            _ => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use std::collections::hash_map::DefaultHasher;

    use super::*;
    use crate::function::FuncAttrs;
    use crate::ty::{DType, TensorType, Type};

    fn scale(name: &str, op: &str) -> Function {
        let tensor = TensorType::fixed(&[3], DType::Float32);
        let x = Var::tensor(name, tensor.clone());
        let tmp = Var::tensor("tmp", tensor.clone());
        let body = Expr::let_in(
            tmp.clone(),
            Expr::call(Expr::op(op), vec![Expr::var(&x)], tensor.clone().into()),
            Expr::call(Expr::op("nn.relu"), vec![Expr::var(&tmp)], tensor.clone().into()),
        );
        Function::new(vec![x], body, Type::Tensor(tensor)).with_attrs(FuncAttrs::primitive())
    }

    fn hash_of(function: &Function) -> u64 {
        let mut hasher = DefaultHasher::new();
        hash_function(function, &mut hasher);
        hasher.finish()
    }

    #[test]
    fn renamed_bindings_are_equal() {
        let a = scale("x", "negative");
        let b = scale("input", "negative");
        assert_ne!(a, b);
        assert!(function_eq(&a, &b));
        assert_eq!(hash_of(&a), hash_of(&b));
    }

    #[test]
    fn different_operators_are_not_equal() {
        let a = scale("x", "negative");
        let b = scale("x", "exp");
        assert!(!function_eq(&a, &b));
    }

    #[test]
    fn free_variables_keep_identity() {
        let tensor = TensorType::fixed(&[3], DType::Float32);
        let free_a = Var::tensor("w", tensor.clone());
        let free_b = Var::tensor("w", tensor.clone());
        let make = |free: &Var| {
            Function::new(Vec::new(), Expr::var(free), Type::Tensor(tensor.clone()))
        };
        assert!(function_eq(&make(&free_a), &make(&free_a)));
        assert!(!function_eq(&make(&free_a), &make(&free_b)));
    }
}
