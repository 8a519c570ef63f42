//! Input model of the static memory planner: the buffers a lowered function
//! allocates, the pools they may live in, and where they ended up.

use std::collections::BTreeMap;
use std::fmt;

use telc_ir::{Allocate, PrimFunc, Stmt, StorageScope, Target, static_element_count};

use crate::workspace::ByteSize;

pub const DEFAULT_ALIGNMENT: u64 = 16;

/// A memory pool and the targets that may access it, with the kind of
/// access each one has.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct PoolInfo {
    pub pool_name: String,
    pub target_access: BTreeMap<Target, String>,
    /// Capacity of the pool, when it is bounded.
    pub size_hint_bytes: Option<u64>,
}

impl PoolInfo {
    pub const READ_WRITE_ACCESS: &'static str = "rw";
    pub const READ_ONLY_ACCESS: &'static str = "ro";

    pub fn new(pool_name: impl Into<String>, target_access: BTreeMap<Target, String>) -> Self {
        Self {
            pool_name: pool_name.into(),
            target_access,
            size_hint_bytes: None,
        }
    }

    pub fn with_size_hint(mut self, bytes: u64) -> Self {
        self.size_hint_bytes = Some(bytes);
        self
    }

    pub fn accessible_from(&self, target: &Target) -> bool {
        self.target_access.contains_key(target)
    }
}

impl fmt::Display for PoolInfo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "PoolInfo({}, targets=[", self.pool_name)?;
        for (idx, (target, access)) in self.target_access.iter().enumerate() {
            if idx > 0 {
                f.write_str(", ")?;
            }
            write!(f, "{target}: {access}")?;
        }
        f.write_str("]")?;
        if let Some(bytes) = self.size_hint_bytes {
            write!(f, ", size_hint={bytes}B")?;
        }
        f.write_str(")")
    }
}

/// One buffer to be placed by the planner.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BufferInfo {
    pub name_hint: String,
    pub size_bytes: ByteSize,
    pub pool_candidates: Vec<PoolInfo>,
    pub alignment: u64,
    /// Name hints of the buffers live at the same time as this one.
    pub conflicts: Vec<String>,
}

impl BufferInfo {
    pub fn new(
        name_hint: impl Into<String>,
        size_bytes: ByteSize,
        pool_candidates: Vec<PoolInfo>,
    ) -> Self {
        Self {
            name_hint: name_hint.into(),
            size_bytes,
            pool_candidates,
            alignment: DEFAULT_ALIGNMENT,
            conflicts: Vec::new(),
        }
    }

    pub fn with_alignment(mut self, alignment: u64) -> Self {
        self.alignment = alignment;
        self
    }

    pub fn set_conflicts(&mut self, conflicts: Vec<String>) {
        self.conflicts = conflicts;
    }
}

impl fmt::Display for BufferInfo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let pools: Vec<&str> = self
            .pool_candidates
            .iter()
            .map(|pool| pool.pool_name.as_str())
            .collect();
        write!(
            f,
            "BufferInfo({}, size={}, pools=[{}], alignment={})",
            self.name_hint,
            self.size_bytes,
            pools.join(", "),
            self.alignment
        )
    }
}

/// Where the planner placed a buffer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PoolAllocation {
    pub pool_info: PoolInfo,
    pub byte_offset: u64,
}

impl fmt::Display for PoolAllocation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}@{}", self.pool_info.pool_name, self.byte_offset)
    }
}

/// Every buffer of a function with the allocation statement introducing it,
/// and the most memory ever live at once.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BufferInfoAnalysis {
    pub buffer_info_stmts: Vec<(BufferInfo, Stmt)>,
    pub memory_pressure: ByteSize,
}

impl fmt::Display for BufferInfoAnalysis {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "memory pressure: {}", self.memory_pressure)?;
        for (info, _) in &self.buffer_info_stmts {
            writeln!(f, "  {info}")?;
        }
        Ok(())
    }
}

/// Bytes an allocation needs, undefined when an extent is symbolic or the
/// size overflows.
pub fn calculate_extents_size(alloc: &Allocate) -> ByteSize {
    static_element_count(&alloc.extents)
        .and_then(|count| count.checked_mul(alloc.dtype.bytes()))
        .into()
}

/// The buffers of an analysis, in order.
pub fn create_array_buffer_info(buffer_info_stmts: &[(BufferInfo, Stmt)]) -> Vec<BufferInfo> {
    buffer_info_stmts
        .iter()
        .map(|(info, _)| info.clone())
        .collect()
}

/// Collects a [`BufferInfo`] for each global allocation of `prim`. Pool
/// candidates are the pools accessible from the prim func's target (all of
/// them when it has none); allocations that are live together conflict.
pub fn buffer_info_analysis(
    prim: &PrimFunc,
    pools: &[PoolInfo],
    alignment: u64,
) -> BufferInfoAnalysis {
    let candidates: Vec<PoolInfo> = pools
        .iter()
        .filter(|pool| prim.target().is_none_or(|target| pool.accessible_from(target)))
        .cloned()
        .collect();
    let mut walker = AllocationWalker {
        candidates,
        alignment,
        live: Vec::new(),
        found: Vec::new(),
    };
    let memory_pressure = walker.visit(&prim.body);

    let AllocationWalker { found, .. } = walker;
    let buffer_info_stmts = found
        .into_iter()
        .map(|found| {
            let mut info = found.info;
            info.set_conflicts(found.conflicts);
            (info, found.stmt)
        })
        .collect();
    BufferInfoAnalysis {
        buffer_info_stmts,
        memory_pressure,
    }
}

struct FoundBuffer {
    info: BufferInfo,
    stmt: Stmt,
    conflicts: Vec<String>,
}

struct AllocationWalker {
    candidates: Vec<PoolInfo>,
    alignment: u64,
    /// Indices into `found` of the allocations enclosing the current point.
    live: Vec<usize>,
    found: Vec<FoundBuffer>,
}

impl AllocationWalker {
    /// Returns the peak of live global bytes under `stmt`.
    fn visit(&mut self, stmt: &Stmt) -> ByteSize {
        match stmt {
            Stmt::Allocate(alloc) if alloc.scope == StorageScope::Global => {
                let size = calculate_extents_size(alloc);
                let idx = self.found.len();
                for &outer in &self.live {
                    self.found[outer].conflicts.push(alloc.buffer.clone());
                }
                let conflicts = self
                    .live
                    .iter()
                    .map(|&outer| self.found[outer].info.name_hint.clone())
                    .collect();
                self.found.push(FoundBuffer {
                    info: BufferInfo::new(alloc.buffer.clone(), size, self.candidates.clone())
                        .with_alignment(self.alignment),
                    stmt: stmt.clone(),
                    conflicts,
                });

                self.live.push(idx);
                let inner = self.visit(&alloc.body);
                self.live.pop();
                size.align_to(self.alignment) + inner
            }
            Stmt::Allocate(alloc) => self.visit(&alloc.body),
            Stmt::Seq(stmts) => stmts
                .iter()
                .map(|stmt| self.visit(stmt))
                .fold(ByteSize::ZERO, ByteSize::max),
            Stmt::For { body, .. } => self.visit(body),
            Stmt::Compute { .. } | Stmt::CallExtern { .. } | Stmt::NoOp => ByteSize::ZERO,
        }
    }
}
