#![allow(dead_code)]

use std::sync::Arc;

use telc_ir::{
    BaseFunc, DType, Expr, FuncAttrs, Function, GlobalVar, IrModule, Target, TensorType, Type,
    Var, VirtualDevice,
};

pub fn llvm() -> Target {
    Target::new("llvm")
}

pub fn cuda() -> Target {
    Target::new("cuda")
}

pub fn f32_tensor(shape: &[u64]) -> TensorType {
    TensorType::fixed(shape, DType::Float32)
}

/// `fn (%x) { op(%x) }`, tagged primitive.
pub fn unary_primitive(op: &str, shape: &[u64]) -> Arc<Function> {
    let tensor = f32_tensor(shape);
    let x = Var::tensor("x", tensor.clone());
    let body = Expr::call(Expr::op(op), vec![Expr::var(&x)], tensor.clone().into());
    Arc::new(Function::new(vec![x], body, Type::Tensor(tensor)).with_attrs(FuncAttrs::primitive()))
}

/// `fn (%x, %y) { nn.relu(add(%x, %y)) }`, tagged primitive.
pub fn add_relu_primitive(shape: &[u64]) -> Arc<Function> {
    let ty = Type::Tensor(f32_tensor(shape));
    let x = Var::tensor("x", f32_tensor(shape));
    let y = Var::tensor("y", f32_tensor(shape));
    let add = Expr::call(Expr::op("add"), vec![Expr::var(&x), Expr::var(&y)], ty.clone());
    let relu = Expr::call(Expr::op("nn.relu"), vec![add], ty.clone());
    Arc::new(Function::new(vec![x, y], relu, ty).with_attrs(FuncAttrs::primitive()))
}

/// A call placed on `target` by device planning.
pub fn call_on(callee: Expr, args: Vec<Expr>, ty: Type, target: &Target) -> Expr {
    Expr::call_on(callee, args, ty, VirtualDevice::for_target(target.clone()))
}

pub fn module_with_main(main: Function) -> IrModule {
    let mut module = IrModule::new();
    module.update(GlobalVar::new("main"), main);
    module
}

pub fn main_of(module: &IrModule) -> Arc<Function> {
    match module.lookup_name("main") {
        Some(BaseFunc::Function(main)) => Arc::clone(main),
        other => panic!("expected main to be a function, got {other:?}"),
    }
}
