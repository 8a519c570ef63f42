use std::collections::BTreeMap;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::expr::GlobalVar;
use crate::function::Function;
use crate::prim::PrimFunc;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum IrError {
    #[error("global `{name}` is already defined in the module")]
    DuplicateGlobal { name: String },
}

/// A definition bound to a global.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum BaseFunc {
    Function(Arc<Function>),
    Prim(PrimFunc),
    /// A definition of a kind the lowering stage does not understand,
    /// identified only by its type key.
    Opaque { type_key: String },
}

impl BaseFunc {
    pub fn as_function(&self) -> Option<&Arc<Function>> {
        match self {
            BaseFunc::Function(function) => Some(function),
            _ => None,
        }
    }

    pub fn as_prim(&self) -> Option<&PrimFunc> {
        match self {
            BaseFunc::Prim(prim) => Some(prim),
            _ => None,
        }
    }

    pub fn type_key(&self) -> &str {
        match self {
            BaseFunc::Function(_) => "Function",
            BaseFunc::Prim(_) => "PrimFunc",
            BaseFunc::Opaque { type_key } => type_key,
        }
    }
}

impl From<Function> for BaseFunc {
    fn from(value: Function) -> Self {
        BaseFunc::Function(Arc::new(value))
    }
}

impl From<Arc<Function>> for BaseFunc {
    fn from(value: Arc<Function>) -> Self {
        BaseFunc::Function(value)
    }
}

impl From<PrimFunc> for BaseFunc {
    fn from(value: PrimFunc) -> Self {
        BaseFunc::Prim(value)
    }
}

/// An opaque compiled unit produced by an external toolchain.
#[derive(Debug, Clone, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct RuntimeModule {
    pub name: String,
    pub format: String,
    #[serde(default)]
    pub symbols: Vec<String>,
    #[serde(default)]
    pub imports: Vec<RuntimeModule>,
    #[serde(default)]
    pub payload: Vec<u8>,
}

impl RuntimeModule {
    pub fn new(name: impl Into<String>, format: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            format: format.into(),
            ..Self::default()
        }
    }

    pub fn with_symbol(mut self, symbol: impl Into<String>) -> Self {
        self.symbols.push(symbol.into());
        self
    }

    /// Whether the module, or optionally one of its imports, defines `symbol`.
    pub fn provides(&self, symbol: &str, query_imports: bool) -> bool {
        self.symbols.iter().any(|candidate| candidate == symbol)
            || (query_imports
                && self
                    .imports
                    .iter()
                    .any(|import| import.provides(symbol, true)))
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ModuleAttrs {
    /// Compiled units produced by external toolchains.
    pub external_mods: Vec<RuntimeModule>,
    /// Entry global of each externally compiled function to its toolchain.
    pub device_contexts: BTreeMap<GlobalVar, String>,
    /// Use counts of lowered primitives, keyed by entry name.
    pub op_weights: BTreeMap<String, u64>,
    pub extra: BTreeMap<String, String>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct IrModule {
    pub functions: BTreeMap<GlobalVar, BaseFunc>,
    #[serde(default)]
    pub attrs: ModuleAttrs,
}

impl IrModule {
    pub fn new() -> Self {
        Self::default()
    }

    /// An empty module sharing `attrs`.
    pub fn with_attrs(attrs: ModuleAttrs) -> Self {
        Self {
            functions: BTreeMap::new(),
            attrs,
        }
    }

    /// Binds a fresh global; fails if the name is taken.
    pub fn add(&mut self, var: GlobalVar, func: impl Into<BaseFunc>) -> Result<(), IrError> {
        if self.functions.contains_key(&var) {
            return Err(IrError::DuplicateGlobal { name: var.name });
        }
        self.functions.insert(var, func.into());
        Ok(())
    }

    /// Binds or rebinds a global.
    pub fn update(&mut self, var: GlobalVar, func: impl Into<BaseFunc>) {
        self.functions.insert(var, func.into());
    }

    pub fn remove(&mut self, var: &GlobalVar) -> Option<BaseFunc> {
        self.functions.remove(var)
    }

    pub fn lookup(&self, var: &GlobalVar) -> Option<&BaseFunc> {
        self.functions.get(var)
    }

    pub fn lookup_name(&self, name: &str) -> Option<&BaseFunc> {
        self.functions.get(&GlobalVar::new(name))
    }

    pub fn contains(&self, name: &str) -> bool {
        self.functions.contains_key(&GlobalVar::new(name))
    }

    pub fn global_vars(&self) -> impl Iterator<Item = &GlobalVar> {
        self.functions.keys()
    }

    pub fn len(&self) -> usize {
        self.functions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.functions.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&GlobalVar, &BaseFunc)> {
        self.functions.iter()
    }

    pub fn prim_funcs(&self) -> impl Iterator<Item = (&GlobalVar, &PrimFunc)> {
        self.functions
            .iter()
            .filter_map(|(var, func)| func.as_prim().map(|prim| (var, prim)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::expr::{Expr, Var};
    use crate::prim::{Buffer, Stmt};
    use crate::target::Target;
    use crate::ty::{DType, TensorType, Type};

    fn sample_module() -> IrModule {
        let tensor = TensorType::fixed(&[2, 2], DType::Float32);
        let x = Var::tensor("x", tensor.clone());
        let main = Function::new(
            vec![x.clone()],
            Expr::call(Expr::global("add_one"), vec![Expr::var(&x)], tensor.clone().into()),
            Type::Tensor(tensor.clone()),
        );
        let prim = PrimFunc::from_buffers(
            vec![Buffer::new("x", &tensor), Buffer::new("out", &tensor)],
            Stmt::Compute {
                output: "out".into(),
                op: "add".into(),
                inputs: vec!["x".into()],
            },
        )
        .with_target(Target::new("llvm"));

        let mut module = IrModule::new();
        module.add(GlobalVar::new("main"), main).expect("fresh global");
        module.add(GlobalVar::new("add_one"), prim).expect("fresh global");
        module
    }

    #[test]
    fn add_rejects_duplicate_globals() {
        let mut module = sample_module();
        let err = module
            .add(GlobalVar::new("main"), BaseFunc::Opaque { type_key: "x".into() })
            .expect_err("duplicate");
        assert_eq!(err, IrError::DuplicateGlobal { name: "main".into() });
    }

    #[test]
    fn json_round_trip_preserves_module() {
        let module = sample_module();
        let text = serde_json::to_string(&module).expect("serialize");
        let back: IrModule = serde_json::from_str(&text).expect("deserialize");
        assert_eq!(back, module);
        assert_eq!(back.prim_funcs().count(), 1);
    }

    #[test]
    fn runtime_module_queries_imports_on_request() {
        let inner = RuntimeModule::new("inner", "c").with_symbol("kernel");
        let mut outer = RuntimeModule::new("outer", "metadata");
        outer.imports.push(inner);
        assert!(!outer.provides("kernel", false));
        assert!(outer.provides("kernel", true));
    }
}
