use std::sync::Arc;
use std::sync::atomic::{AtomicU32, Ordering};

use serde::{Deserialize, Serialize};

use crate::function::{FuncAttrs, Function};
use crate::target::VirtualDevice;
use crate::ty::{TensorType, Type};

static NEXT_VAR_ID: AtomicU32 = AtomicU32::new(1);

/// A local variable. Identity is the id, so two variables may share a
/// name hint without aliasing each other.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct Var {
    pub id: u32,
    pub name: String,
    #[serde(default)]
    pub ty: Type,
}

impl Var {
    pub fn new(name: impl Into<String>, ty: Type) -> Self {
        Self {
            id: NEXT_VAR_ID.fetch_add(1, Ordering::Relaxed),
            name: name.into(),
            ty,
        }
    }

    pub fn tensor(name: impl Into<String>, tensor: TensorType) -> Self {
        Self::new(name, Type::Tensor(tensor))
    }
}

/// A module-level name. Globals compare by name.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct GlobalVar {
    pub name: String,
}

impl GlobalVar {
    pub fn new(name: impl Into<String>) -> Self {
        Self { name: name.into() }
    }

    pub fn name(&self) -> &str {
        &self.name
    }
}

/// A built-in operator.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct Op {
    pub name: String,
}

impl Op {
    pub const DEBUG: &'static str = "debug";
    pub const DEVICE_COPY: &'static str = "device_copy";

    pub fn new(name: impl Into<String>) -> Self {
        Self { name: name.into() }
    }

    pub fn is_debug(&self) -> bool {
        self.name == Self::DEBUG
    }
}

#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct Constant {
    pub ty: TensorType,
    #[serde(default)]
    pub data: Vec<u8>,
}

#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct Call {
    pub op: Box<Expr>,
    pub args: Vec<Expr>,
    /// Checked result type.
    #[serde(default)]
    pub ty: Type,
    #[serde(default)]
    pub virtual_device: VirtualDevice,
}

#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct Let {
    pub var: Var,
    pub value: Box<Expr>,
    pub body: Box<Expr>,
}

#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct If {
    pub cond: Box<Expr>,
    pub then_branch: Box<Expr>,
    pub else_branch: Box<Expr>,
}

#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct DeviceCopy {
    pub value: Box<Expr>,
    pub src: VirtualDevice,
    pub dst: VirtualDevice,
}

/// How a shape function consumes one parameter of the primitive it
/// accompanies.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum ShapeParamState {
    Shape,
    Data,
    ShapeAndData,
}

/// Calling convention for the companion shape function of a dynamically
/// shaped lowered call.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct ShapeFuncInfo {
    pub prim_shape_fn_var: GlobalVar,
    pub prim_shape_fn_states: Vec<ShapeParamState>,
    pub num_inputs: usize,
    pub num_outputs: usize,
    pub all_prim_shape_fn_vars: Vec<GlobalVar>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct CallLoweredAttrs {
    /// Attributes of the high-level function the call was lowered from.
    pub relay_attrs: FuncAttrs,
    #[serde(default)]
    pub all_prim_fn_vars: Vec<GlobalVar>,
    #[serde(default)]
    pub reshape_only: bool,
    #[serde(default)]
    pub shape_func: Option<ShapeFuncInfo>,
}

/// A call to a lowered global, carrying the metadata executors need.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct CallLowered {
    pub callee: GlobalVar,
    pub args: Vec<Expr>,
    pub attrs: CallLoweredAttrs,
    #[serde(default)]
    pub ty: Type,
    #[serde(default)]
    pub virtual_device: VirtualDevice,
}

#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum Expr {
    Var(Var),
    GlobalVar(GlobalVar),
    Op(Op),
    Constant(Constant),
    Tuple(Vec<Expr>),
    TupleGetItem { tuple: Box<Expr>, index: usize },
    Call(Call),
    Let(Let),
    If(If),
    Function(Arc<Function>),
    CallLowered(CallLowered),
    DeviceCopy(DeviceCopy),
}

impl Expr {
    pub fn var(var: &Var) -> Self {
        Expr::Var(var.clone())
    }

    pub fn global(name: impl Into<String>) -> Self {
        Expr::GlobalVar(GlobalVar::new(name))
    }

    pub fn op(name: impl Into<String>) -> Self {
        Expr::Op(Op::new(name))
    }

    pub fn constant(ty: TensorType) -> Self {
        Expr::Constant(Constant {
            ty,
            data: Vec::new(),
        })
    }

    pub fn function(function: Function) -> Self {
        Expr::Function(Arc::new(function))
    }

    /// A call with no device annotation.
    pub fn call(op: Expr, args: Vec<Expr>, ty: Type) -> Self {
        Expr::Call(Call {
            op: Box::new(op),
            args,
            ty,
            virtual_device: VirtualDevice::unconstrained(),
        })
    }

    pub fn call_on(op: Expr, args: Vec<Expr>, ty: Type, virtual_device: VirtualDevice) -> Self {
        Expr::Call(Call {
            op: Box::new(op),
            args,
            ty,
            virtual_device,
        })
    }

    pub fn let_in(var: Var, value: Expr, body: Expr) -> Self {
        Expr::Let(Let {
            var,
            value: Box::new(value),
            body: Box::new(body),
        })
    }

    pub fn if_else(cond: Expr, then_branch: Expr, else_branch: Expr) -> Self {
        Expr::If(If {
            cond: Box::new(cond),
            then_branch: Box::new(then_branch),
            else_branch: Box::new(else_branch),
        })
    }

    pub fn device_copy(value: Expr, src: VirtualDevice, dst: VirtualDevice) -> Self {
        Expr::DeviceCopy(DeviceCopy {
            value: Box::new(value),
            src,
            dst,
        })
    }

    pub fn as_function(&self) -> Option<&Arc<Function>> {
        match self {
            Expr::Function(function) => Some(function),
            _ => None,
        }
    }

    /// Type of the value this expression produces, as far as the IR records it.
    pub fn checked_type(&self) -> Type {
        match self {
            Expr::Var(var) => var.ty.clone(),
            Expr::Constant(constant) => Type::Tensor(constant.ty.clone()),
            Expr::Tuple(fields) => Type::Tuple(fields.iter().map(Expr::checked_type).collect()),
            Expr::TupleGetItem { tuple, index } => match tuple.checked_type() {
                Type::Tuple(mut fields) if *index < fields.len() => fields.swap_remove(*index),
                _ => Type::Unknown,
            },
            Expr::Call(call) => call.ty.clone(),
            Expr::CallLowered(call) => call.ty.clone(),
            Expr::Let(binding) => binding.body.checked_type(),
            Expr::If(branch) => branch.then_branch.checked_type(),
            Expr::Function(function) => function.checked_type(),
            Expr::DeviceCopy(copy) => copy.value.checked_type(),
            Expr::GlobalVar(_) | Expr::Op(_) => Type::Unknown,
        }
    }

    /// Short node-kind label used in diagnostics.
    pub fn kind(&self) -> &'static str {
        match self {
            Expr::Var(_) => "Var",
            Expr::GlobalVar(_) => "GlobalVar",
            Expr::Op(_) => "Op",
            Expr::Constant(_) => "Constant",
            Expr::Tuple(_) => "Tuple",
            Expr::TupleGetItem { .. } => "TupleGetItem",
            Expr::Call(_) => "Call",
            Expr::Let(_) => "Let",
            Expr::If(_) => "If",
            Expr::Function(_) => "Function",
            Expr::CallLowered(_) => "CallLowered",
            Expr::DeviceCopy(_) => "DeviceCopy",
        }
    }
}

impl From<Var> for Expr {
    fn from(value: Var) -> Self {
        Expr::Var(value)
    }
}

impl From<GlobalVar> for Expr {
    fn from(value: GlobalVar) -> Self {
        Expr::GlobalVar(value)
    }
}

impl From<Function> for Expr {
    fn from(value: Function) -> Self {
        Expr::function(value)
    }
}
