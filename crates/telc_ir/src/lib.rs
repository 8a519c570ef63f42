//! Intermediate representation consumed and produced by the telc lowering
//! stage: high-level tensor functions, low-level prim funcs, and the module
//! that binds them to globals.

pub mod expr;
pub mod function;
pub mod module;
pub mod prim;
pub mod printer;
pub mod structural;
pub mod target;
pub mod ty;

pub use expr::{
    Call, CallLowered, CallLoweredAttrs, Constant, DeviceCopy, Expr, GlobalVar, If, Let, Op,
    ShapeFuncInfo, ShapeParamState, Var,
};
pub use function::{FuncAttrs, Function};
pub use module::{BaseFunc, IrError, IrModule, ModuleAttrs, RuntimeModule};
pub use prim::{Allocate, Buffer, PrimFunc, PrimFuncAttrs, PrimParam, StorageScope, Stmt};
pub use printer::excerpt;
pub use target::{DeviceType, Target, VirtualDevice};
pub use ty::{DType, Dim, TensorType, Type, static_element_count};
