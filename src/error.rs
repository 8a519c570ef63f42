use telc_backends::BackendError;
use telc_ir::IrError;
use thiserror::Error;

/// Every failure the lowering stage can report. All of them abort the run;
/// no partially lowered module is ever returned.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum LowerError {
    #[error(
        "call to `{callee}` has no target; device planning must assign one before lowering:\n{excerpt}"
    )]
    UnresolvedTarget { callee: String, excerpt: String },

    #[error("duplicate bindings for `{name}`. Existing is:\n{existing}\nwhile new is:\n{new}")]
    DuplicateGlobal {
        name: String,
        existing: String,
        new: String,
    },

    #[error("external function has not been given a `global_symbol`:\n{excerpt}")]
    MissingGlobalSymbol { excerpt: String },

    #[error("failed to find the codegen tool for `{key}`{}", suggestion_suffix(.suggestion))]
    MissingBackend {
        key: String,
        suggestion: Option<String>,
    },

    #[error(transparent)]
    Backend(#[from] BackendError),

    #[error("`{name}` must be bound to {expected}, found {found}:\n{excerpt}")]
    UnexpectedDefinition {
        name: String,
        expected: &'static str,
        found: String,
        excerpt: String,
    },

    #[error("primitive `{name}` wraps a device copy but is called with {arity} arguments")]
    DeviceCopyArity { name: String, arity: usize },

    #[error("primitive `{name}` calls `device_copy` without a source device:\n{excerpt}")]
    DeviceCopyWithoutSource { name: String, excerpt: String },

    #[error("call to already lowered `{name}` has dynamically shaped result {ty}")]
    DynamicLoweredCall { name: String, ty: String },

    #[error("prim func `{name}` has no target annotation")]
    MissingTarget { name: String },

    #[error("module definitions must be functions or prim funcs, `{name}` is a {type_key}")]
    UnsupportedDefinition { name: String, type_key: String },

    #[error("module has no `main` function")]
    MissingMain,

    #[error("`{name}` was not annotated by the lowering pass: {missing} not set")]
    MissingAnnotation { name: String, missing: &'static str },

    #[error("no target is specified for device `{device}`; available targets: {available}")]
    NoTargetForDevice { device: String, available: String },

    #[error("storage info for {excerpt} has {ids} storage ids but {devices} devices")]
    StorageMismatch {
        excerpt: String,
        ids: usize,
        devices: usize,
    },

    #[error("`{key}` is already recorded in module attribute `{attr}`")]
    DuplicateAttr { attr: &'static str, key: String },

    #[error("scheduler failed on `{name}`: {message}")]
    Scheduler { name: String, message: String },

    #[error("invalid configuration: {0}")]
    Config(String),

    #[error(transparent)]
    Ir(#[from] IrError),
}

fn suggestion_suffix(suggestion: &Option<String>) -> String {
    suggestion
        .as_ref()
        .map(|name| format!(" (did you mean `{name}`?)"))
        .unwrap_or_default()
}

pub type Result<T, E = LowerError> = std::result::Result<T, E>;
