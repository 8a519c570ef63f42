mod common;

use std::collections::BTreeMap;
use std::sync::Arc;

use common::*;
use telc::{AnnotatedFunction, Compiler, LowerError, Result, per_target_modules};
use telc_ir::{
    BaseFunc, Buffer, DType, Dim, Expr, FuncAttrs, Function, GlobalVar, IrModule, Op, PrimFunc,
    ShapeParamState, Stmt, TensorType, Type, Var, VirtualDevice,
};

fn lower(compiler: &Compiler, module: &IrModule) -> Result<IrModule> {
    compiler.lower_module(module, "default", |_| Ok(()), &llvm())
}

#[test]
fn primitive_call_is_rewritten_and_lowered() -> Result<()> {
    let tensor = f32_tensor(&[4]);
    let x = Var::tensor("x", tensor.clone());
    let body = call_on(
        Expr::Function(unary_primitive("exp", &[4])),
        vec![Expr::var(&x)],
        tensor.clone().into(),
        &llvm(),
    );
    let module = module_with_main(Function::new(vec![x.clone()], body, tensor.into()));

    let compiler = Compiler::for_tests();
    let lowered = lower(&compiler, &module)?;

    let main = main_of(&lowered);
    let Expr::CallLowered(call) = &main.body else {
        panic!("expected a lowered call, got {}", main.body);
    };
    assert_eq!(call.callee.name(), "default_fused_exp");
    assert_eq!(call.args, vec![Expr::var(&x)]);
    assert_eq!(call.attrs.all_prim_fn_vars, vec![GlobalVar::new("default_fused_exp")]);
    assert!(call.attrs.relay_attrs.primitive);
    assert!(call.attrs.shape_func.is_none());

    let prim = lowered
        .lookup_name("default_fused_exp")
        .and_then(BaseFunc::as_prim)
        .expect("prim func merged into the module");
    assert_eq!(prim.target(), Some(&llvm()));
    assert_eq!(lowered.attrs.op_weights.get("default_fused_exp"), Some(&1));
    Ok(())
}

#[test]
fn equal_primitives_share_one_entry() -> Result<()> {
    let tensor = f32_tensor(&[4]);
    let x = Var::tensor("x", tensor.clone());
    let inner = call_on(
        Expr::Function(unary_primitive("exp", &[4])),
        vec![Expr::var(&x)],
        tensor.clone().into(),
        &llvm(),
    );
    // A separately built but identical literal.
    let outer = call_on(
        Expr::Function(unary_primitive("exp", &[4])),
        vec![inner],
        tensor.clone().into(),
        &llvm(),
    );
    let module = module_with_main(Function::new(vec![x], outer, tensor.into()));

    let compiler = Compiler::for_tests();
    let lowered = lower(&compiler, &module)?;

    let entries = compiler.list_cache_entries();
    assert_eq!(entries.len(), 1);
    assert_eq!(entries[0].1.use_count, 2);
    assert_eq!(lowered.attrs.op_weights.get("default_fused_exp"), Some(&2));
    assert_eq!(lowered.prim_funcs().count(), 1);
    Ok(())
}

#[test]
fn distinct_primitives_with_one_base_name_get_distinct_entries() -> Result<()> {
    let small = f32_tensor(&[4]);
    let large = f32_tensor(&[16]);
    let x = Var::tensor("x", small.clone());
    let y = Var::tensor("y", large.clone());
    let body = Expr::Tuple(vec![
        call_on(
            Expr::Function(unary_primitive("exp", &[4])),
            vec![Expr::var(&x)],
            small.clone().into(),
            &llvm(),
        ),
        call_on(
            Expr::Function(unary_primitive("exp", &[16])),
            vec![Expr::var(&y)],
            large.clone().into(),
            &llvm(),
        ),
    ]);
    let ret = Type::Tuple(vec![small.into(), large.into()]);
    let module = module_with_main(Function::new(vec![x, y], body, ret));

    let compiler = Compiler::for_tests();
    let lowered = lower(&compiler, &module)?;

    let names: Vec<&str> = lowered.prim_funcs().map(|(var, _)| var.name()).collect();
    assert_eq!(names, ["default_fused_exp", "default_fused_exp_1"]);
    Ok(())
}

#[test]
fn lowering_a_lowered_module_changes_nothing() -> Result<()> {
    let tensor = f32_tensor(&[4]);
    let x = Var::tensor("x", tensor.clone());
    let y = Var::tensor("y", tensor.clone());
    let body = call_on(
        Expr::Function(add_relu_primitive(&[4])),
        vec![Expr::var(&x), Expr::var(&y)],
        tensor.clone().into(),
        &llvm(),
    );
    let module = module_with_main(Function::new(vec![x, y], body, tensor.into()));

    let compiler = Compiler::for_tests();
    let once = lower(&compiler, &module)?;
    let twice = lower(&compiler, &once)?;
    assert_eq!(twice, once);
    Ok(())
}

#[test]
fn unplaced_primitive_call_is_fatal() {
    let tensor = f32_tensor(&[4]);
    let x = Var::tensor("x", tensor.clone());
    let body = Expr::call(
        Expr::Function(unary_primitive("exp", &[4])),
        vec![Expr::var(&x)],
        tensor.clone().into(),
    );
    let module = module_with_main(Function::new(vec![x], body, tensor.into()));

    let err = lower(&Compiler::for_tests(), &module).expect_err("no target");
    let LowerError::UnresolvedTarget { callee, excerpt } = err else {
        panic!("expected an unresolved target, got {err}");
    };
    assert_eq!(callee, "fn[exp]");
    assert!(excerpt.contains("exp"));
}

#[test]
fn dynamic_results_carry_a_shape_function() -> Result<()> {
    let n = Var::tensor("n", TensorType::scalar(DType::Int32));
    let dynamic = Type::Tensor(TensorType::new(vec![Dim::Any], DType::Int32));
    let primitive = {
        let n = Var::tensor("n", TensorType::scalar(DType::Int32));
        let body = Expr::call(Expr::op("arange"), vec![Expr::var(&n)], dynamic.clone());
        Arc::new(Function::new(vec![n], body, dynamic.clone()).with_attrs(FuncAttrs::primitive()))
    };
    let body = call_on(
        Expr::Function(primitive),
        vec![Expr::var(&n)],
        dynamic.clone(),
        &cuda(),
    );
    let module = module_with_main(Function::new(vec![n], body, dynamic));

    let compiler = Compiler::for_tests();
    let lowered = lower(&compiler, &module)?;

    let main = main_of(&lowered);
    let Expr::CallLowered(call) = &main.body else {
        panic!("expected a lowered call, got {}", main.body);
    };
    let shape_func = call.attrs.shape_func.as_ref().expect("shape function attached");
    assert_eq!(shape_func.prim_shape_fn_var.name(), "fused_arange_shape_func");
    assert_eq!(shape_func.prim_shape_fn_states, vec![ShapeParamState::Data]);
    assert_eq!(shape_func.num_inputs, 1);
    assert_eq!(shape_func.num_outputs, 1);

    let shape_entries = compiler.cache().list_shape_func_entries();
    assert_eq!(shape_entries.len(), 1);
    assert_eq!(shape_entries[0].0.target(), &llvm());
    assert_eq!(shape_entries[0].1.use_count, 0);

    // The shape function runs on the host, the primitive where it was placed.
    let by_target = per_target_modules(&lowered)?;
    assert!(by_target[&llvm()].contains("fused_arange_shape_func"));
    assert!(by_target[&cuda()].contains("default_fused_arange"));
    Ok(())
}

#[test]
fn fused_device_copy_is_unfused() -> Result<()> {
    let tensor = f32_tensor(&[8]);
    let src = VirtualDevice::for_target(llvm());
    let dst = VirtualDevice::for_target(cuda());
    let copy = {
        let x = Var::tensor("x", tensor.clone());
        let body = Expr::device_copy(Expr::var(&x), src.clone(), dst.clone());
        Arc::new(
            Function::new(vec![x], body, tensor.clone().into()).with_attrs(FuncAttrs::primitive()),
        )
    };
    let x = Var::tensor("x", tensor.clone());
    let body = call_on(Expr::Function(copy), vec![Expr::var(&x)], tensor.clone().into(), &cuda());
    let module = module_with_main(Function::new(vec![x.clone()], body, tensor.into()));

    let compiler = Compiler::for_tests();
    let lowered = lower(&compiler, &module)?;

    assert_eq!(main_of(&lowered).body, Expr::device_copy(Expr::var(&x), src, dst));
    assert!(compiler.list_cache_entries().is_empty());
    Ok(())
}

/// A primitive wrapping `body`, which copies its parameter `x`.
fn copy_primitive(tensor: &TensorType, body: impl FnOnce(&Var) -> Expr) -> Arc<Function> {
    let x = Var::tensor("x", tensor.clone());
    let body = body(&x);
    Arc::new(Function::new(vec![x], body, tensor.clone().into()).with_attrs(FuncAttrs::primitive()))
}

#[test]
fn device_copy_called_with_two_arguments_is_fatal() {
    let tensor = f32_tensor(&[8]);
    let copy = copy_primitive(&tensor, |x| {
        Expr::device_copy(
            Expr::var(x),
            VirtualDevice::for_target(llvm()),
            VirtualDevice::for_target(cuda()),
        )
    });
    let x = Var::tensor("x", tensor.clone());
    let body = call_on(
        Expr::Function(copy),
        vec![Expr::var(&x), Expr::var(&x)],
        tensor.clone().into(),
        &cuda(),
    );
    let module = module_with_main(Function::new(vec![x], body, tensor.into()));

    let err = lower(&Compiler::for_tests(), &module).expect_err("arity");
    assert!(matches!(err, LowerError::DeviceCopyArity { arity: 2, .. }));
}

#[test]
fn device_copy_op_without_source_is_rejected() {
    let tensor = f32_tensor(&[8]);
    let copy = copy_primitive(&tensor, |x| {
        Expr::call_on(
            Expr::op(Op::DEVICE_COPY),
            vec![Expr::var(x)],
            tensor.clone().into(),
            VirtualDevice::for_target(cuda()),
        )
    });
    let x = Var::tensor("x", tensor.clone());
    let body = call_on(Expr::Function(copy), vec![Expr::var(&x)], tensor.clone().into(), &cuda());
    let module = module_with_main(Function::new(vec![x], body, tensor.into()));

    let compiler = Compiler::for_tests();
    let err = lower(&compiler, &module).expect_err("no source device");
    assert!(matches!(err, LowerError::DeviceCopyWithoutSource { ref excerpt, .. } if excerpt.contains("device_copy")));
    assert!(compiler.list_cache_entries().is_empty());
}

#[test]
fn debug_hooks_stay_interpretable() -> Result<()> {
    let tensor = f32_tensor(&[4]);
    let x = Var::tensor("x", tensor.clone());
    let body = call_on(
        Expr::Function(unary_primitive(Op::DEBUG, &[4])),
        vec![Expr::var(&x)],
        tensor.clone().into(),
        &llvm(),
    );
    let module = module_with_main(Function::new(vec![x], body.clone(), tensor.into()));

    let compiler = Compiler::for_tests();
    let mut seen = Vec::new();
    let lowered = compiler.lower_module(
        &module,
        "default",
        |annotated: AnnotatedFunction| {
            seen.push(annotated);
            Ok(())
        },
        &llvm(),
    )?;

    assert_eq!(main_of(&lowered).body, body);
    assert_eq!(seen.len(), 1);
    assert!(seen[0].annotation.is_none());
    assert!(compiler.list_cache_entries().is_empty());
    Ok(())
}

#[test]
fn primitive_binding_does_not_leak_out_of_its_scope() -> Result<()> {
    let tensor = f32_tensor(&[4]);
    let ty: Type = tensor.clone().into();
    let x = Var::tensor("x", tensor.clone());
    let f = Var::new("f", Type::Unknown);

    let ordinary = {
        let p = Var::tensor("p", tensor.clone());
        Function::new(vec![p.clone()], Expr::var(&p), ty.clone())
    };
    let inner_call = call_on(Expr::var(&f), vec![Expr::var(&x)], ty.clone(), &llvm());
    let outer_call = call_on(Expr::var(&f), vec![Expr::var(&x)], ty.clone(), &llvm());
    let body = Expr::let_in(
        f.clone(),
        Expr::function(ordinary.clone()),
        Expr::Tuple(vec![
            Expr::let_in(
                f.clone(),
                Expr::Function(unary_primitive("exp", &[4])),
                inner_call,
            ),
            outer_call.clone(),
        ]),
    );
    let ret = Type::Tuple(vec![ty.clone(), ty]);
    let module = module_with_main(Function::new(vec![x], body, ret));

    let lowered = lower(&Compiler::for_tests(), &module)?;

    let main = main_of(&lowered);
    let Expr::Let(outer) = &main.body else {
        panic!("outer binding must survive, got {}", main.body);
    };
    let Expr::Tuple(fields) = outer.body.as_ref() else {
        panic!("expected a tuple, got {}", outer.body);
    };
    let Expr::Let(inner) = &fields[0] else {
        panic!("inner binding must survive, got {}", fields[0]);
    };
    assert!(matches!(inner.body.as_ref(), Expr::CallLowered(call) if call.callee.name() == "default_fused_exp"));
    assert_eq!(fields[1], outer_call);
    Ok(())
}

#[test]
fn primitive_bound_by_let_stays_usable_as_a_value() -> Result<()> {
    let tensor = f32_tensor(&[4]);
    let ty: Type = tensor.clone().into();
    let x = Var::tensor("x", tensor.clone());
    let f = Var::new("f", Type::Unknown);
    let exp = unary_primitive("exp", &[4]);

    let body = Expr::let_in(
        f.clone(),
        Expr::Function(Arc::clone(&exp)),
        Expr::Tuple(vec![
            call_on(Expr::var(&f), vec![Expr::var(&x)], ty.clone(), &llvm()),
            Expr::var(&f),
        ]),
    );
    let module = module_with_main(Function::new(vec![x], body, Type::Tuple(vec![ty, Type::Unknown])));

    let lowered = lower(&Compiler::for_tests(), &module)?;

    let main = main_of(&lowered);
    let Expr::Let(binding) = &main.body else {
        panic!("binding of %f must survive, got {}", main.body);
    };
    assert_eq!(binding.var, f);
    assert_eq!(*binding.value, Expr::Function(exp));
    let Expr::Tuple(fields) = binding.body.as_ref() else {
        panic!("expected a tuple, got {}", binding.body);
    };
    assert!(matches!(&fields[0], Expr::CallLowered(call) if call.callee.name() == "default_fused_exp"));
    assert_eq!(fields[1], Expr::var(&f));
    Ok(())
}

#[test]
fn calls_to_lowered_globals_are_not_relowered() -> Result<()> {
    let tensor = f32_tensor(&[4]);
    let prim = PrimFunc::from_buffers(
        vec![Buffer::new("x", &tensor), Buffer::new("out", &tensor)],
        Stmt::Compute {
            output: "out".into(),
            op: "tanh".into(),
            inputs: vec!["x".into()],
        },
    )
    .with_target(llvm());
    let x = Var::tensor("x", tensor.clone());
    let body = call_on(Expr::global("kernel"), vec![Expr::var(&x)], tensor.clone().into(), &llvm());
    let mut module = module_with_main(Function::new(vec![x], body, tensor.into()));
    module.update(GlobalVar::new("kernel"), prim.clone());

    let compiler = Compiler::for_tests();
    let mut annotations = Vec::new();
    let lowered = compiler.lower_module(
        &module,
        "default",
        |annotated: AnnotatedFunction| {
            annotations.extend(annotated.annotation);
            Ok(())
        },
        &llvm(),
    )?;

    let main = main_of(&lowered);
    let Expr::CallLowered(call) = &main.body else {
        panic!("expected a lowered call, got {}", main.body);
    };
    assert_eq!(call.callee.name(), "kernel");
    assert!(compiler.list_cache_entries().is_empty());

    assert_eq!(annotations.len(), 1);
    assert_eq!(annotations[0].prim_fn_var.name(), "kernel");
    assert_eq!(
        annotations[0].prim_funcs,
        BTreeMap::from([(GlobalVar::new("kernel"), prim)])
    );
    assert_eq!(annotations[0].target, Some(llvm()));
    Ok(())
}

#[test]
fn dynamic_call_to_lowered_global_is_fatal() {
    let dynamic = TensorType::new(vec![Dim::Any], DType::Float32);
    let prim = PrimFunc::from_buffers(vec![Buffer::new("x", &dynamic)], Stmt::NoOp)
        .with_target(llvm());
    let x = Var::tensor("x", dynamic.clone());
    let body = call_on(Expr::global("kernel"), vec![Expr::var(&x)], dynamic.clone().into(), &llvm());
    let mut module = module_with_main(Function::new(vec![x], body, dynamic.into()));
    module.update(GlobalVar::new("kernel"), prim);

    let err = lower(&Compiler::for_tests(), &module).expect_err("dynamic");
    assert!(matches!(err, LowerError::DynamicLoweredCall { ref name, .. } if name == "kernel"));
}

#[test]
fn calls_in_both_branches_are_lowered() -> Result<()> {
    let tensor = f32_tensor(&[4]);
    let ty: Type = tensor.clone().into();
    let cond = Var::tensor("cond", TensorType::scalar(DType::Bool));
    let x = Var::tensor("x", tensor.clone());
    let branch = |op: &str| {
        call_on(
            Expr::Function(unary_primitive(op, &[4])),
            vec![Expr::var(&x)],
            ty.clone(),
            &llvm(),
        )
    };
    let body = Expr::if_else(Expr::var(&cond), branch("exp"), branch("tanh"));
    let module = module_with_main(Function::new(vec![cond, x], body, ty.clone()));

    let lowered = lower(&Compiler::for_tests(), &module)?;

    let main = main_of(&lowered);
    let Expr::If(branch) = &main.body else {
        panic!("expected a conditional, got {}", main.body);
    };
    assert!(matches!(branch.cond.as_ref(), Expr::Var(_)));
    assert!(matches!(branch.then_branch.as_ref(), Expr::CallLowered(call) if call.callee.name() == "default_fused_exp"));
    assert!(matches!(branch.else_branch.as_ref(), Expr::CallLowered(call) if call.callee.name() == "default_fused_tanh"));
    Ok(())
}

#[test]
fn clearing_the_cache_drops_every_entry() -> Result<()> {
    let tensor = f32_tensor(&[4]);
    let x = Var::tensor("x", tensor.clone());
    let body = call_on(
        Expr::Function(unary_primitive("sigmoid", &[4])),
        vec![Expr::var(&x)],
        tensor.clone().into(),
        &llvm(),
    );
    let module = module_with_main(Function::new(vec![x], body, tensor.into()));

    let compiler = Compiler::for_tests();
    lower(&compiler, &module)?;
    assert_eq!(compiler.operator_weights().len(), 1);
    compiler.clear_cache();
    assert!(compiler.list_cache_entries().is_empty());
    assert!(compiler.operator_weights().is_empty());
    Ok(())
}
