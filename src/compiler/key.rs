use std::fmt;
use std::hash::{Hash, Hasher};
use std::sync::Arc;

use ahash::AHasher;
use telc_ir::structural::{function_eq, hash_function};
use telc_ir::{Function, Target};

/// Identity of one lowering: a source function and the target it is lowered
/// for. Two keys are equal when their functions are structurally equal up to
/// the names of the variables they bind, no matter which call site they were
/// reached from.
#[derive(Debug, Clone)]
pub struct CompilationKey {
    source: Arc<Function>,
    target: Target,
    hash: u64,
}

impl CompilationKey {
    pub fn new(source: Arc<Function>, target: Target) -> Self {
        let mut hasher = AHasher::default();
        hash_function(&source, &mut hasher);
        target.hash(&mut hasher);
        let hash = hasher.finish();
        Self {
            source,
            target,
            hash,
        }
    }

    pub fn source(&self) -> &Arc<Function> {
        &self.source
    }

    pub fn target(&self) -> &Target {
        &self.target
    }

    /// The `compiler` tag of the source function, if it is bound for an
    /// external toolchain.
    pub fn external_compiler(&self) -> Option<&str> {
        self.source.compiler()
    }
}

impl PartialEq for CompilationKey {
    fn eq(&self, other: &Self) -> bool {
        self.hash == other.hash
            && self.target == other.target
            && (Arc::ptr_eq(&self.source, &other.source) || function_eq(&self.source, &other.source))
    }
}

impl Eq for CompilationKey {}

impl Hash for CompilationKey {
    fn hash<H: Hasher>(&self, state: &mut H) {
        state.write_u64(self.hash);
    }
}

impl fmt::Display for CompilationKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let ops = self.source.op_names().join(", ");
        write!(f, "fn[{ops}] for {}", self.target)
    }
}
