//! Registry of external code generators.
//!
//! Backends are addressed by `"<namespace>.<name>"`; the lowering stage looks
//! up `codegen.ext.<compiler>` for every function tagged with a compiler.
//! Backends linked into the binary register themselves through
//! [`BackendProvider`] and `inventory::submit!`; others can be added at run
//! time with [`BackendRegistry::register`].

mod registry;

pub use inventory;
pub use registry::{
    BackendError, BackendFn, BackendProvider, BackendRegistry, EXTERNAL_CODEGEN_NAMESPACE,
    external_codegen_key,
};
