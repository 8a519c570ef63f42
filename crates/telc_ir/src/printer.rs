//! Text rendering of IR nodes, used for logging and for the excerpts
//! embedded in lowering diagnostics.

use std::fmt::{self, Write};

use crate::expr::{CallLoweredAttrs, Expr, GlobalVar, Var};
use crate::function::{FuncAttrs, Function};
use crate::module::{BaseFunc, IrModule};
use crate::prim::{PrimFunc, Stmt, StorageScope};

const INDENT: &str = "  ";

struct Printer {
    out: String,
    indent: usize,
}

impl Printer {
    fn new() -> Self {
        Self {
            out: String::new(),
            indent: 0,
        }
    }

    fn newline(&mut self) {
        self.out.push('\n');
        for _ in 0..self.indent {
            self.out.push_str(INDENT);
        }
    }

    fn var(&mut self, var: &Var) {
        let _ = write!(self.out, "%{}", var.name);
    }

    fn list(&mut self, exprs: &[Expr]) {
        for (idx, expr) in exprs.iter().enumerate() {
            if idx > 0 {
                self.out.push_str(", ");
            }
            self.expr(expr);
        }
    }

    fn expr(&mut self, expr: &Expr) {
        match expr {
            Expr::Var(var) => self.var(var),
            Expr::GlobalVar(global) => {
                let _ = write!(self.out, "{global}");
            }
            Expr::Op(op) => self.out.push_str(&op.name),
            Expr::Constant(constant) => {
                let _ = write!(self.out, "meta[Constant]<{}>", constant.ty);
            }
            Expr::Tuple(fields) => {
                self.out.push('(');
                self.list(fields);
                self.out.push(')');
            }
            Expr::TupleGetItem { tuple, index } => {
                self.expr(tuple);
                let _ = write!(self.out, ".{index}");
            }
            Expr::Call(call) => {
                self.expr(&call.op);
                self.out.push('(');
                self.list(&call.args);
                self.out.push(')');
                if !call.virtual_device.is_fully_unconstrained() {
                    let _ = write!(self.out, " /* on {} */", call.virtual_device);
                }
            }
            Expr::CallLowered(call) => {
                let _ = write!(self.out, "call_lowered({}, (", call.callee);
                self.list(&call.args);
                self.out.push(')');
                self.lowered_attrs(&call.attrs);
                self.out.push(')');
            }
            Expr::DeviceCopy(copy) => {
                self.out.push_str("device_copy(");
                self.expr(&copy.value);
                let _ = write!(self.out, ", src={}, dst={})", copy.src, copy.dst);
            }
            Expr::Let(binding) => {
                self.out.push_str("let ");
                self.var(&binding.var);
                self.out.push_str(" = ");
                self.expr(&binding.value);
                self.out.push(';');
                self.newline();
                self.expr(&binding.body);
            }
            Expr::If(branch) => {
                self.out.push_str("if (");
                self.expr(&branch.cond);
                self.out.push_str(") {");
                self.indent += 1;
                self.newline();
                self.expr(&branch.then_branch);
                self.indent -= 1;
                self.newline();
                self.out.push_str("} else {");
                self.indent += 1;
                self.newline();
                self.expr(&branch.else_branch);
                self.indent -= 1;
                self.newline();
                self.out.push('}');
            }
            Expr::Function(function) => self.function(None, function),
        }
    }

    fn lowered_attrs(&mut self, attrs: &CallLoweredAttrs) {
        if !attrs.all_prim_fn_vars.is_empty() {
            self.out.push_str(", prim_fns=[");
            self.globals(&attrs.all_prim_fn_vars);
            self.out.push(']');
        }
        if attrs.reshape_only {
            self.out.push_str(", reshape_only");
        }
        if let Some(shape) = &attrs.shape_func {
            let _ = write!(
                self.out,
                ", shape_fn={} ({} -> {})",
                shape.prim_shape_fn_var, shape.num_inputs, shape.num_outputs
            );
        }
    }

    fn globals(&mut self, globals: &[GlobalVar]) {
        for (idx, global) in globals.iter().enumerate() {
            if idx > 0 {
                self.out.push_str(", ");
            }
            let _ = write!(self.out, "{global}");
        }
    }

    fn func_attrs(&mut self, attrs: &FuncAttrs) {
        if attrs.is_empty() {
            return;
        }
        let mut parts = Vec::new();
        if attrs.primitive {
            parts.push("Primitive=1".to_string());
        }
        if let Some(compiler) = &attrs.compiler {
            parts.push(format!("Compiler=\"{compiler}\""));
        }
        if let Some(symbol) = &attrs.global_symbol {
            parts.push(format!("global_symbol=\"{symbol}\""));
        }
        if let Some(symbol) = &attrs.external_symbol {
            parts.push(format!("ExternalSymbol=\"{symbol}\""));
        }
        if attrs.reshape_only {
            parts.push("relay.reshape_only=1".to_string());
        }
        if let Some(target) = &attrs.target {
            parts.push(format!("target=\"{target}\""));
        }
        for (key, value) in &attrs.extra {
            parts.push(format!("{key}=\"{value}\""));
        }
        let _ = write!(self.out, " [{}]", parts.join(", "));
    }

    fn function(&mut self, name: Option<&GlobalVar>, function: &Function) {
        match name {
            Some(name) => {
                let _ = write!(self.out, "def {name}(");
            }
            None => self.out.push_str("fn ("),
        }
        for (idx, param) in function.params.iter().enumerate() {
            if idx > 0 {
                self.out.push_str(", ");
            }
            self.var(param);
            let _ = write!(self.out, ": {}", param.ty);
        }
        let _ = write!(self.out, ") -> {}", function.ret_type);
        self.func_attrs(&function.attrs);
        self.out.push_str(" {");
        self.indent += 1;
        self.newline();
        self.expr(&function.body);
        self.indent -= 1;
        self.newline();
        self.out.push('}');
    }

    fn prim_func(&mut self, name: Option<&GlobalVar>, prim: &PrimFunc) {
        match name {
            Some(name) => {
                let _ = write!(self.out, "primfn {name}(");
            }
            None => self.out.push_str("primfn ("),
        }
        for (idx, param) in prim.params.iter().enumerate() {
            if idx > 0 {
                self.out.push_str(", ");
            }
            let _ = write!(self.out, "{}: handle", param.name);
        }
        self.out.push(')');
        if let Some(target) = prim.target() {
            let _ = write!(self.out, " [target=\"{target}\"]");
        }
        self.out.push_str(" {");
        self.indent += 1;
        for (param, buffer) in &prim.buffer_map {
            self.newline();
            let dims = buffer
                .shape
                .iter()
                .map(ToString::to_string)
                .collect::<Vec<_>>()
                .join(", ");
            let _ = write!(
                self.out,
                "buffer {}: {}[({dims})] <- {param}",
                buffer.name, buffer.dtype
            );
        }
        self.newline();
        self.stmt(&prim.body);
        self.indent -= 1;
        self.newline();
        self.out.push('}');
    }

    fn stmt(&mut self, stmt: &Stmt) {
        match stmt {
            Stmt::Allocate(alloc) => {
                let dims = alloc
                    .extents
                    .iter()
                    .map(ToString::to_string)
                    .collect::<Vec<_>>()
                    .join(", ");
                let scope = match alloc.scope {
                    StorageScope::Global => "global",
                    StorageScope::Shared => "shared",
                    StorageScope::Local => "local",
                };
                let _ = write!(
                    self.out,
                    "allocate {}: {}[({dims})], {scope} {{",
                    alloc.buffer, alloc.dtype
                );
                self.indent += 1;
                self.newline();
                self.stmt(&alloc.body);
                self.indent -= 1;
                self.newline();
                self.out.push('}');
            }
            Stmt::Seq(stmts) => {
                for (idx, inner) in stmts.iter().enumerate() {
                    if idx > 0 {
                        self.newline();
                    }
                    self.stmt(inner);
                }
            }
            Stmt::For { var, extent, body } => {
                let _ = write!(self.out, "for {var} in 0..{extent} {{");
                self.indent += 1;
                self.newline();
                self.stmt(body);
                self.indent -= 1;
                self.newline();
                self.out.push('}');
            }
            Stmt::Compute { output, op, inputs } => {
                let _ = write!(self.out, "{output} = {op}({})", inputs.join(", "));
            }
            Stmt::CallExtern { callee, args } => {
                let _ = write!(self.out, "call_extern(\"{callee}\", {})", args.join(", "));
            }
            Stmt::NoOp => self.out.push_str("no_op"),
        }
    }

    fn base_func(&mut self, name: Option<&GlobalVar>, func: &BaseFunc) {
        match func {
            BaseFunc::Function(function) => self.function(name, function),
            BaseFunc::Prim(prim) => self.prim_func(name, prim),
            BaseFunc::Opaque { type_key } => {
                if let Some(name) = name {
                    let _ = write!(self.out, "{name} = ");
                }
                let _ = write!(self.out, "<opaque {type_key}>");
            }
        }
    }

    fn finish(self) -> String {
        self.out
    }
}

impl fmt::Display for GlobalVar {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "@{}", self.name)
    }
}

impl fmt::Display for Expr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut printer = Printer::new();
        printer.expr(self);
        f.write_str(&printer.finish())
    }
}

impl fmt::Display for Function {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut printer = Printer::new();
        printer.function(None, self);
        f.write_str(&printer.finish())
    }
}

impl fmt::Display for PrimFunc {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut printer = Printer::new();
        printer.prim_func(None, self);
        f.write_str(&printer.finish())
    }
}

impl fmt::Display for Stmt {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut printer = Printer::new();
        printer.stmt(self);
        f.write_str(&printer.finish())
    }
}

impl fmt::Display for BaseFunc {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut printer = Printer::new();
        printer.base_func(None, self);
        f.write_str(&printer.finish())
    }
}

impl fmt::Display for IrModule {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut printer = Printer::new();
        for (idx, (var, func)) in self.functions.iter().enumerate() {
            if idx > 0 {
                printer.out.push_str("\n\n");
            }
            printer.base_func(Some(var), func);
        }
        f.write_str(&printer.finish())
    }
}

/// Renders `text` truncated to at most `max_lines` lines, for diagnostics.
pub fn excerpt(text: &str, max_lines: usize) -> String {
    let mut lines = text.lines();
    let mut out = lines
        .by_ref()
        .take(max_lines)
        .collect::<Vec<_>>()
        .join("\n");
    let rest = lines.count();
    if rest > 0 {
        let _ = write!(out, "\n  ... ({rest} more lines)");
    }
    out
}
