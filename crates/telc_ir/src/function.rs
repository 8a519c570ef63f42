use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::expr::{Expr, Op, Var};
use crate::target::Target;
use crate::ty::Type;

/// Attributes recognised on high-level functions.
#[derive(Debug, Clone, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(default)]
pub struct FuncAttrs {
    /// Set by operator fusion on schedulable compute units.
    pub primitive: bool,
    /// Name of the external toolchain that must compile this function.
    pub compiler: Option<String>,
    /// Symbol the compiled function will be exported under.
    pub global_symbol: Option<String>,
    /// Marks a stub whose definition lives in an external runtime module.
    pub external_symbol: Option<String>,
    pub reshape_only: bool,
    pub target: Option<Target>,
    pub extra: BTreeMap<String, String>,
}

impl FuncAttrs {
    pub fn primitive() -> Self {
        Self {
            primitive: true,
            ..Self::default()
        }
    }

    pub fn external(compiler: impl Into<String>, global_symbol: impl Into<String>) -> Self {
        Self {
            primitive: true,
            compiler: Some(compiler.into()),
            global_symbol: Some(global_symbol.into()),
            ..Self::default()
        }
    }

    pub fn is_empty(&self) -> bool {
        self == &Self::default()
    }
}

/// A high-level function.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct Function {
    pub params: Vec<Var>,
    pub body: Expr,
    #[serde(default)]
    pub ret_type: Type,
    #[serde(default)]
    pub attrs: FuncAttrs,
}

impl Function {
    pub fn new(params: Vec<Var>, body: Expr, ret_type: Type) -> Self {
        Self {
            params,
            body,
            ret_type,
            attrs: FuncAttrs::default(),
        }
    }

    pub fn with_attrs(mut self, attrs: FuncAttrs) -> Self {
        self.attrs = attrs;
        self
    }

    pub fn is_primitive(&self) -> bool {
        self.attrs.primitive
    }

    pub fn compiler(&self) -> Option<&str> {
        self.attrs.compiler.as_deref()
    }

    pub fn is_external(&self) -> bool {
        self.attrs.compiler.is_some()
    }

    pub fn is_external_stub(&self) -> bool {
        self.attrs.external_symbol.is_some()
    }

    /// Operator called by a body consisting of exactly one call to an operator.
    pub fn single_op_body(&self) -> Option<&Op> {
        match &self.body {
            Expr::Call(call) => match call.op.as_ref() {
                Expr::Op(op) => Some(op),
                _ => None,
            },
            _ => None,
        }
    }

    /// Operator names appearing in the body, in post-order.
    pub fn op_names(&self) -> Vec<&str> {
        let mut names = Vec::new();
        collect_op_names(&self.body, &mut names);
        names
    }

    pub fn param_types(&self) -> Vec<Type> {
        self.params.iter().map(|param| param.ty.clone()).collect()
    }

    pub fn checked_type(&self) -> Type {
        Type::Func {
            params: self.param_types(),
            ret: Box::new(self.ret_type.clone()),
        }
    }
}

fn collect_op_names<'a>(expr: &'a Expr, out: &mut Vec<&'a str>) {
    match expr {
        Expr::Call(call) => {
            for arg in &call.args {
                collect_op_names(arg, out);
            }
            if let Expr::Op(op) = call.op.as_ref() {
                out.push(op.name.as_str());
            }
        }
        Expr::Tuple(fields) => fields.iter().for_each(|field| collect_op_names(field, out)),
        Expr::TupleGetItem { tuple, .. } => collect_op_names(tuple, out),
        Expr::Let(binding) => {
            collect_op_names(&binding.value, out);
            collect_op_names(&binding.body, out);
        }
        Expr::If(branch) => {
            collect_op_names(&branch.cond, out);
            collect_op_names(&branch.then_branch, out);
            collect_op_names(&branch.else_branch, out);
        }
        Expr::DeviceCopy(copy) => {
            collect_op_names(&copy.value, out);
            out.push(Op::DEVICE_COPY);
        }
        Expr::Var(_)
        | Expr::GlobalVar(_)
        | Expr::Op(_)
        | Expr::Constant(_)
        | Expr::Function(_)
        | Expr::CallLowered(_) => {}
    }
}
