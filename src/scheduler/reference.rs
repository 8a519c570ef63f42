use std::collections::BTreeMap;

use ahash::{AHashMap, AHashSet};
use telc_ir::{
    Allocate, Buffer, DType, Expr, Function, GlobalVar, IrModule, PrimFunc, ShapeParamState,
    StorageScope, Stmt, Target, TensorType, Type,
};
use tracing::debug;

use super::{LoweredSchedule, NameResolver, ScheduledFunc, Scheduler, Stage, TensorDecl};
use crate::error::{LowerError, Result};

const MAX_FUNC_NAME_LEN: usize = 80;

/// Operators that only reinterpret their input; a function made solely of
/// these needs no schedule.
const LAYOUT_ONLY_OPS: &[&str] = &["reshape", "reshape_like", "squeeze", "expand_dims"];

/// Operators whose output shape depends on input values, not only shapes.
const DATA_DEPENDENT_OPS: &[&str] = &[
    "arange",
    "nonzero",
    "unique",
    "dyn.reshape",
    "dyn.full",
    "dyn.broadcast_to",
    "dyn.strided_slice",
];

/// Deterministic scheduler emitting one compute statement per operator call,
/// with every intermediate tensor in its own global allocation.
#[derive(Debug, Clone, Copy, Default)]
pub struct ReferenceScheduler;

impl ReferenceScheduler {
    pub fn new() -> Self {
        Self
    }
}

/// `fused_<op>_<op>...` in evaluation order, capped in length.
pub fn fused_name(source: &Function) -> String {
    let mut name = String::from("fused");
    for op in source.op_names() {
        name.push('_');
        name.push_str(op);
    }
    if name.len() > MAX_FUNC_NAME_LEN {
        let mut cut = MAX_FUNC_NAME_LEN;
        while !name.is_char_boundary(cut) {
            cut -= 1;
        }
        name.truncate(cut);
    }
    name
}

impl Scheduler for ReferenceScheduler {
    fn schedule(
        &self,
        source: &Function,
        target: &Target,
        names: &mut NameResolver<'_>,
    ) -> Result<ScheduledFunc> {
        let base = fused_name(source);
        let prim_fn_var = GlobalVar::new(names(&base));
        debug!(%target, entry = %prim_fn_var, "scheduling primitive");

        let mut builder = StageBuilder::new(prim_fn_var.name());
        let inputs = builder.bind_params(source)?;
        let results = builder.emit(&source.body)?;
        let outputs = output_decls(source, prim_fn_var.name())?;
        let stages = builder.finish(results, &outputs)?;

        let layout_only = !stages.is_empty()
            && source
                .op_names()
                .iter()
                .all(|op| LAYOUT_ONLY_OPS.contains(op));

        let mut scheduled = ScheduledFunc {
            prim_fn_var,
            inputs,
            outputs,
            stages,
            prim_func: None,
            shape_func_param_states: Vec::new(),
        };
        if layout_only {
            scheduled.prim_func = Some(build_prim_func(&scheduled, scheduled.prim_fn_var.name()));
        }
        Ok(scheduled)
    }

    fn schedule_shape_func(
        &self,
        source: &Function,
        target: &Target,
        names: &mut NameResolver<'_>,
    ) -> Result<ScheduledFunc> {
        let prim_fn_var = GlobalVar::new(names(&format!("{}_shape_func", fused_name(source))));
        debug!(%target, entry = %prim_fn_var, "scheduling shape function");

        let states = shape_param_states(source);
        let mut inputs = Vec::new();
        for (param, state) in source.params.iter().zip(&states) {
            let tensors = param_tensors(prim_fn_var.name(), &param.name, &param.ty)?;
            for (name, tensor) in tensors {
                if matches!(state, ShapeParamState::Shape | ShapeParamState::ShapeAndData) {
                    inputs.push(TensorDecl::new(format!("{name}_shape"), shape_tensor(&tensor)));
                }
                if matches!(state, ShapeParamState::Data | ShapeParamState::ShapeAndData) {
                    inputs.push(TensorDecl::new(name, tensor));
                }
            }
        }

        let op = source
            .op_names()
            .last()
            .map_or_else(|| "identity".to_string(), |op| (*op).to_string());
        let input_names: Vec<String> = inputs.iter().map(|decl| decl.name.clone()).collect();
        let mut outputs = Vec::new();
        let mut stages = Vec::new();
        for (idx, tensor) in source.ret_type.flatten().into_iter().enumerate() {
            let decl = TensorDecl::new(format!("T_shape_{idx}"), shape_tensor(tensor));
            stages.push(Stage {
                op: format!("shape_func.{op}"),
                output: decl.clone(),
                inputs: input_names.clone(),
            });
            outputs.push(decl);
        }

        let mut scheduled = ScheduledFunc {
            prim_fn_var,
            inputs,
            outputs,
            stages,
            prim_func: None,
            shape_func_param_states: states,
        };
        scheduled.prim_func = Some(build_prim_func(&scheduled, scheduled.prim_fn_var.name()));
        Ok(scheduled)
    }

    fn lower_schedule(
        &self,
        scheduled: &ScheduledFunc,
        func_name: &str,
    ) -> Result<LoweredSchedule> {
        let entry = GlobalVar::new(func_name);
        let mut funcs = IrModule::new();
        funcs.add(entry.clone(), build_prim_func(scheduled, func_name))?;
        Ok(LoweredSchedule { entry, funcs })
    }
}

fn shape_tensor(tensor: &TensorType) -> TensorType {
    TensorType::fixed(&[tensor.rank() as u64], DType::Int64)
}

fn scheduler_error(name: &str, message: impl Into<String>) -> LowerError {
    LowerError::Scheduler {
        name: name.to_string(),
        message: message.into(),
    }
}

/// Flattened tensors of one parameter with the names they are bound under.
fn param_tensors(func: &str, name: &str, ty: &Type) -> Result<Vec<(String, TensorType)>> {
    let tensors = ty.flatten();
    match tensors.as_slice() {
        [] => Err(scheduler_error(
            func,
            format!("parameter `{name}` has no tensor type ({ty})"),
        )),
        [single] => Ok(vec![(name.to_string(), (*single).clone())]),
        many => Ok(many
            .iter()
            .enumerate()
            .map(|(idx, tensor)| (format!("{name}_{idx}"), (*tensor).clone()))
            .collect()),
    }
}

fn output_decls(source: &Function, func: &str) -> Result<Vec<TensorDecl>> {
    let last_op = source
        .op_names()
        .last()
        .map_or_else(|| "output".to_string(), |op| op.replace('.', "_"));
    let tensors = source.ret_type.flatten();
    if tensors.is_empty() {
        return Err(scheduler_error(
            func,
            format!("result type {} has no tensors", source.ret_type),
        ));
    }
    let single = tensors.len() == 1;
    Ok(tensors
        .into_iter()
        .enumerate()
        .map(|(idx, tensor)| {
            let name = if single {
                format!("T_{last_op}")
            } else {
                format!("T_{last_op}_{idx}")
            };
            TensorDecl::new(name, tensor.clone())
        })
        .collect())
}

/// Per-parameter contribution to the shape computation: data when a
/// data-dependent operator reads the parameter directly, shape otherwise.
fn shape_param_states(source: &Function) -> Vec<ShapeParamState> {
    let mut shape_uses = AHashSet::new();
    let mut data_uses = AHashSet::new();
    collect_param_uses(&source.body, &mut shape_uses, &mut data_uses);
    source
        .params
        .iter()
        .map(|param| {
            match (
                shape_uses.contains(&param.id),
                data_uses.contains(&param.id),
            ) {
                (true, true) => ShapeParamState::ShapeAndData,
                (false, true) => ShapeParamState::Data,
                _ => ShapeParamState::Shape,
            }
        })
        .collect()
}

fn collect_param_uses(expr: &Expr, shape_uses: &mut AHashSet<u32>, data_uses: &mut AHashSet<u32>) {
    match expr {
        Expr::Call(call) => {
            if let Expr::Op(op) = call.op.as_ref() {
                let uses = if DATA_DEPENDENT_OPS.contains(&op.name.as_str()) {
                    &mut *data_uses
                } else {
                    &mut *shape_uses
                };
                for arg in &call.args {
                    if let Expr::Var(var) = arg {
                        uses.insert(var.id);
                    }
                }
            }
            for arg in &call.args {
                collect_param_uses(arg, shape_uses, data_uses);
            }
        }
        Expr::Tuple(fields) => {
            for field in fields {
                collect_param_uses(field, shape_uses, data_uses);
            }
        }
        Expr::TupleGetItem { tuple, .. } => collect_param_uses(tuple, shape_uses, data_uses),
        Expr::Let(binding) => {
            collect_param_uses(&binding.value, shape_uses, data_uses);
            collect_param_uses(&binding.body, shape_uses, data_uses);
        }
        _ => {}
    }
}

/// Walks a primitive body and records one stage per operator call.
struct StageBuilder {
    func: String,
    env: AHashMap<u32, Vec<String>>,
    decls: AHashMap<String, TensorDecl>,
    stages: Vec<Stage>,
    counter: usize,
}

impl StageBuilder {
    fn new(func: &str) -> Self {
        Self {
            func: func.to_string(),
            env: AHashMap::new(),
            decls: AHashMap::new(),
            stages: Vec::new(),
            counter: 0,
        }
    }

    fn bind_params(&mut self, source: &Function) -> Result<Vec<TensorDecl>> {
        let mut inputs = Vec::new();
        for param in &source.params {
            let mut bound = Vec::new();
            for (name, tensor) in param_tensors(&self.func, &param.name, &param.ty)? {
                let decl = TensorDecl::new(name.clone(), tensor);
                self.decls.insert(name.clone(), decl.clone());
                inputs.push(decl);
                bound.push(name);
            }
            self.env.insert(param.id, bound);
        }
        Ok(inputs)
    }

    fn fresh(&mut self, stem: &str) -> String {
        let name = format!("T_{}_{}", stem.replace('.', "_"), self.counter);
        self.counter += 1;
        name
    }

    fn push_stage(&mut self, op: &str, ty: &Type, inputs: &[String]) -> Result<Vec<String>> {
        let tensors: Vec<TensorType> = ty.flatten().into_iter().cloned().collect();
        if tensors.is_empty() {
            return Err(scheduler_error(
                &self.func,
                format!("call to `{op}` has no tensor result type"),
            ));
        }
        let mut produced = Vec::with_capacity(tensors.len());
        for tensor in tensors {
            let name = self.fresh(op);
            let decl = TensorDecl::new(name.clone(), tensor);
            self.decls.insert(name.clone(), decl.clone());
            self.stages.push(Stage {
                op: op.to_string(),
                output: decl,
                inputs: inputs.to_vec(),
            });
            produced.push(name);
        }
        Ok(produced)
    }

    fn emit(&mut self, expr: &Expr) -> Result<Vec<String>> {
        match expr {
            Expr::Var(var) => self.env.get(&var.id).cloned().ok_or_else(|| {
                scheduler_error(&self.func, format!("unbound variable `%{}`", var.name))
            }),
            Expr::Constant(constant) => {
                self.push_stage("constant", &Type::Tensor(constant.ty.clone()), &[])
            }
            Expr::Call(call) => {
                let Expr::Op(op) = call.op.as_ref() else {
                    return Err(scheduler_error(
                        &self.func,
                        format!("cannot schedule a call to a {}", call.op.kind()),
                    ));
                };
                let mut inputs = Vec::new();
                for arg in &call.args {
                    inputs.extend(self.emit(arg)?);
                }
                self.push_stage(&op.name, &call.ty, &inputs)
            }
            Expr::Tuple(fields) => {
                let mut produced = Vec::new();
                for field in fields {
                    produced.extend(self.emit(field)?);
                }
                Ok(produced)
            }
            Expr::TupleGetItem { tuple, index } => {
                let produced = self.emit(tuple)?;
                produced
                    .get(*index)
                    .cloned()
                    .map(|name| vec![name])
                    .ok_or_else(|| {
                        scheduler_error(&self.func, format!("tuple index {index} out of range"))
                    })
            }
            Expr::Let(binding) => {
                let value = self.emit(&binding.value)?;
                self.env.insert(binding.var.id, value);
                self.emit(&binding.body)
            }
            other => Err(scheduler_error(
                &self.func,
                format!("cannot schedule a {} inside a primitive", other.kind()),
            )),
        }
    }

    /// Renames the stages producing the body's results to the declared
    /// outputs; results that are not produced by a stage get a copy stage.
    fn finish(mut self, results: Vec<String>, outputs: &[TensorDecl]) -> Result<Vec<Stage>> {
        if results.len() != outputs.len() {
            return Err(scheduler_error(
                &self.func,
                format!(
                    "body produces {} tensors but the result type declares {}",
                    results.len(),
                    outputs.len()
                ),
            ));
        }

        let mut renames = BTreeMap::new();
        for (result, output) in results.iter().zip(outputs) {
            let producer = self
                .stages
                .iter()
                .position(|stage| &stage.output.name == result);
            match producer {
                Some(idx) if !renames.contains_key(result) => {
                    renames.insert(result.clone(), output.name.clone());
                    self.stages[idx].output.name.clone_from(&output.name);
                }
                _ => {
                    let source = renames.get(result).unwrap_or(result).clone();
                    self.stages.push(Stage {
                        op: "copy".to_string(),
                        output: output.clone(),
                        inputs: vec![source],
                    });
                }
            }
        }

        for stage in &mut self.stages {
            for input in &mut stage.inputs {
                if let Some(renamed) = renames.get(input) {
                    input.clone_from(renamed);
                }
            }
        }
        Ok(self.stages)
    }
}

/// Builds the low-level function for a schedule: one buffer parameter per
/// argument and a global allocation for every intermediate stage output.
fn build_prim_func(scheduled: &ScheduledFunc, name: &str) -> PrimFunc {
    let args: Vec<&TensorDecl> = scheduled.all_args().collect();
    let arg_names: AHashSet<&str> = args.iter().map(|decl| decl.name.as_str()).collect();

    let computes = scheduled
        .stages
        .iter()
        .map(|stage| Stmt::Compute {
            output: stage.output.name.clone(),
            op: stage.op.clone(),
            inputs: stage.inputs.clone(),
        })
        .collect::<Vec<_>>();
    let mut body = match computes.len() {
        0 => Stmt::NoOp,
        1 => computes.into_iter().next().unwrap_or(Stmt::NoOp),
        _ => Stmt::Seq(computes),
    };

    for stage in scheduled.stages.iter().rev() {
        if arg_names.contains(stage.output.name.as_str()) {
            continue;
        }
        body = Stmt::Allocate(Allocate {
            buffer: stage.output.name.clone(),
            dtype: stage.output.ty.dtype,
            extents: stage.output.ty.shape.clone(),
            scope: StorageScope::Global,
            body: Box::new(body),
        });
    }

    let buffers = args
        .into_iter()
        .map(|decl| Buffer::new(decl.name.clone(), &decl.ty))
        .collect();
    let mut prim = PrimFunc::from_buffers(buffers, body);
    prim.attrs.global_symbol = Some(name.to_string());
    prim
}

#[cfg(test)]
mod tests {
    use super::*;
    use telc_ir::{FuncAttrs, Var};

    fn tensor(shape: &[u64]) -> TensorType {
        TensorType::fixed(shape, DType::Float32)
    }

    fn add_relu() -> Function {
        let x = Var::tensor("x", tensor(&[4]));
        let y = Var::tensor("y", tensor(&[4]));
        let ty = Type::Tensor(tensor(&[4]));
        let add = Expr::call(
            Expr::op("add"),
            vec![Expr::var(&x), Expr::var(&y)],
            ty.clone(),
        );
        let relu = Expr::call(Expr::op("nn.relu"), vec![add], ty.clone());
        Function::new(vec![x, y], relu, ty).with_attrs(FuncAttrs::primitive())
    }

    #[test]
    fn names_follow_fused_operators() {
        assert_eq!(fused_name(&add_relu()), "fused_add_nn.relu");
    }

    #[test]
    fn schedule_emits_stage_per_operator() {
        let mut names = |name: &str| name.replace('.', "_");
        let scheduled = ReferenceScheduler
            .schedule(&add_relu(), &Target::new("llvm"), &mut names)
            .expect("schedule");

        assert_eq!(scheduled.prim_fn_var.name(), "fused_add_nn_relu");
        assert_eq!(scheduled.inputs.len(), 2);
        assert_eq!(scheduled.outputs[0].name, "T_nn_relu");
        assert_eq!(scheduled.stages.len(), 2);
        assert_eq!(scheduled.stages[1].inputs, vec![scheduled.stages[0].output.name.clone()]);
        assert!(scheduled.prim_func.is_none());
    }

    #[test]
    fn lowered_schedule_allocates_intermediates() {
        let mut names = |name: &str| name.to_string();
        let scheduled = ReferenceScheduler
            .schedule(&add_relu(), &Target::new("llvm"), &mut names)
            .expect("schedule");
        let lowered = ReferenceScheduler
            .lower_schedule(&scheduled, "fused_add_nn_relu")
            .expect("lower");
        let prim = lowered
            .funcs
            .lookup(&lowered.entry)
            .and_then(|func| func.as_prim())
            .expect("entry is a prim func");

        assert_eq!(prim.params.len(), 3);
        match &prim.body {
            Stmt::Allocate(alloc) => assert_eq!(alloc.buffer, "T_add_0"),
            other => panic!("expected an allocation, got {other:?}"),
        }
    }

    #[test]
    fn reshape_only_functions_are_finished_without_lowering() {
        let x = Var::tensor("x", tensor(&[2, 2]));
        let ty = Type::Tensor(tensor(&[4]));
        let body = Expr::call(Expr::op("reshape"), vec![Expr::var(&x)], ty.clone());
        let function = Function::new(vec![x], body, ty).with_attrs(FuncAttrs::primitive());
        let mut names = |name: &str| name.to_string();
        let scheduled = ReferenceScheduler
            .schedule(&function, &Target::new("llvm"), &mut names)
            .expect("schedule");
        assert!(scheduled.prim_func.is_some());
    }

    #[test]
    fn shape_func_marks_data_dependent_params() {
        let n = Var::tensor("n", TensorType::scalar(DType::Int32));
        let ty = Type::Tensor(TensorType::new(vec![telc_ir::Dim::Any], DType::Int32));
        let body = Expr::call(Expr::op("arange"), vec![Expr::var(&n)], ty.clone());
        let function = Function::new(vec![n], body, ty).with_attrs(FuncAttrs::primitive());
        let mut names = |name: &str| name.to_string();
        let scheduled = ReferenceScheduler
            .schedule_shape_func(&function, &Target::new("llvm"), &mut names)
            .expect("shape func");

        assert_eq!(scheduled.prim_fn_var.name(), "fused_arange_shape_func");
        assert_eq!(scheduled.shape_func_param_states, vec![ShapeParamState::Data]);
        assert_eq!(scheduled.inputs.len(), 1);
        assert_eq!(scheduled.outputs.len(), 1);
        assert!(scheduled.prim_func.is_some());
    }
}
