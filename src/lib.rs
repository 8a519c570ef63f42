//! Lowering stage of a tensor-program compiler.
//!
//! [`Compiler::lower_module`] rewrites every call to a primitive function
//! into a call to a per-target prim func, hands functions tagged for
//! external toolchains to their registered backends, and records what it
//! produced on the module. [`partition`] and [`workspace`] then split the
//! result by target and account for its memory.

pub mod cli;
pub mod compiler;
pub mod config;
pub mod error;
pub mod lower;
pub mod partition;
pub mod pipeline;
pub mod scheduler;
pub mod usmp;
pub mod workspace;

pub use compiler::{
    CacheStats, CachedArtifact, CachedFunc, CompilationCache, CompilationKey, Compiler,
    ExternalCodegenDispatcher,
};
pub use config::LowerConfig;
pub use error::{LowerError, Result};
pub use lower::{AnnotatedFunction, CallTarget, LoweringAnnotation};
pub use partition::per_target_modules;
pub use scheduler::{ReferenceScheduler, Scheduler};
pub use workspace::{
    ByteSize, FunctionInfo, StorageInfo, TargetMap, update_function_metadata,
    update_main_workspace_size,
};
