//! Memory accounting handed to the static memory planner: workspace, I/O
//! and constant bytes per target, for `main` and for each lowered function.

use std::collections::BTreeMap;
use std::fmt;
use std::ops::Add;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use telc_ir::{
    BaseFunc, DeviceType, Expr, Function, IrModule, PrimFunc, Target, Type, VirtualDevice, excerpt,
};
use tracing::{debug, trace};

use crate::error::{LowerError, Result};
use crate::lower::AnnotatedFunction;
use crate::usmp::buffer_info_analysis;

/// A byte count that may not be statically known. `Undefined` absorbs every
/// value it is combined with, and arithmetic that overflows is `Undefined`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ByteSize {
    Bytes(u64),
    Undefined,
}

impl ByteSize {
    pub const ZERO: Self = Self::Bytes(0);

    pub fn as_bytes(self) -> Option<u64> {
        match self {
            Self::Bytes(bytes) => Some(bytes),
            Self::Undefined => None,
        }
    }

    pub fn is_defined(self) -> bool {
        matches!(self, Self::Bytes(_))
    }

    pub fn max(self, other: Self) -> Self {
        match (self, other) {
            (Self::Bytes(a), Self::Bytes(b)) => Self::Bytes(a.max(b)),
            _ => Self::Undefined,
        }
    }

    /// Rounds up to a multiple of `alignment`.
    pub fn align_to(self, alignment: u64) -> Self {
        match self {
            Self::Bytes(bytes) if alignment > 1 => bytes
                .div_ceil(alignment)
                .checked_mul(alignment)
                .into(),
            other => other,
        }
    }
}

impl Default for ByteSize {
    fn default() -> Self {
        Self::ZERO
    }
}

impl From<u64> for ByteSize {
    fn from(value: u64) -> Self {
        Self::Bytes(value)
    }
}

impl From<Option<u64>> for ByteSize {
    fn from(value: Option<u64>) -> Self {
        value.map_or(Self::Undefined, Self::Bytes)
    }
}

impl Add for ByteSize {
    type Output = Self;

    fn add(self, rhs: Self) -> Self {
        match (self, rhs) {
            (Self::Bytes(a), Self::Bytes(b)) => a.checked_add(b).into(),
            _ => Self::Undefined,
        }
    }
}

impl std::iter::Sum for ByteSize {
    fn sum<I: Iterator<Item = Self>>(iter: I) -> Self {
        iter.fold(Self::ZERO, Add::add)
    }
}

impl fmt::Display for ByteSize {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Bytes(bytes) => write!(f, "{bytes}B"),
            Self::Undefined => f.write_str("undefined"),
        }
    }
}

/// Memory footprint of one function, per target.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FunctionInfo {
    pub workspace_sizes: BTreeMap<Target, ByteSize>,
    pub io_sizes: BTreeMap<Target, ByteSize>,
    pub constant_sizes: BTreeMap<Target, ByteSize>,
    pub prim_funcs: BTreeMap<Target, PrimFunc>,
    pub relay_funcs: BTreeMap<Target, Arc<Function>>,
}

impl fmt::Display for FunctionInfo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut targets: Vec<&Target> = self
            .workspace_sizes
            .keys()
            .chain(self.io_sizes.keys())
            .chain(self.constant_sizes.keys())
            .collect();
        targets.sort();
        targets.dedup();
        for (idx, target) in targets.into_iter().enumerate() {
            if idx > 0 {
                f.write_str("; ")?;
            }
            let get = |map: &BTreeMap<Target, ByteSize>| map.get(target).copied().unwrap_or_default();
            write!(
                f,
                "{target}: workspace={} io={} constants={}",
                get(&self.workspace_sizes),
                get(&self.io_sizes),
                get(&self.constant_sizes)
            )?;
        }
        Ok(())
    }
}

/// Device family to the target compiling for it.
pub type TargetMap = BTreeMap<DeviceType, Target>;

/// Where the storage allocator placed one value: a storage id and a device
/// per flattened tensor.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct StorageInfo {
    pub storage_ids: Vec<i64>,
    pub virtual_devices: Vec<VirtualDevice>,
}

impl StorageInfo {
    pub fn new(storage_ids: Vec<i64>, virtual_devices: Vec<VirtualDevice>) -> Self {
        Self {
            storage_ids,
            virtual_devices,
        }
    }

    /// A single tensor in slot `storage_id` on `target`.
    pub fn single(storage_id: i64, target: &Target) -> Self {
        Self::new(vec![storage_id], vec![VirtualDevice::for_target(target.clone())])
    }
}

/// Computes the scratch memory a prim func needs at run time.
pub trait WorkspaceSizer {
    fn workspace_bytes(&self, prim: &PrimFunc, alignment: u64) -> ByteSize;
}

/// Peak of the global-scope allocations live at once, each padded to the
/// alignment, as measured by [`buffer_info_analysis`]. Sibling statements
/// reuse memory; nested allocations stack.
#[derive(Debug, Clone, Copy, Default)]
pub struct PeakAllocationSizer;

impl WorkspaceSizer for PeakAllocationSizer {
    fn workspace_bytes(&self, prim: &PrimFunc, alignment: u64) -> ByteSize {
        buffer_info_analysis(prim, &[], alignment).memory_pressure
    }
}

/// Bytes of every tensor in `ty`; undefined when any extent is not static.
pub fn type_size_bytes(ty: &Type) -> ByteSize {
    ty.flatten()
        .into_iter()
        .map(|tensor| ByteSize::from(tensor.size_bytes()))
        .sum()
}

/// The target compiling for `device`. A map with a single target is
/// homogeneous and answers for every device.
pub fn target_for_device(device: DeviceType, targets: &TargetMap) -> Result<Target> {
    if targets.len() == 1 {
        if let Some(target) = targets.values().next() {
            return Ok(target.clone());
        }
    }
    targets
        .get(&device)
        .cloned()
        .ok_or_else(|| LowerError::NoTargetForDevice {
            device: device.to_string(),
            available: targets
                .iter()
                .map(|(device, target)| format!("{device} -> {target}"))
                .collect::<Vec<_>>()
                .join(", "),
        })
}

/// Sizes of `main` from the storage assignment of its values. Constants and
/// program inputs and outputs are summed per target; every other value is
/// sized as the largest value sharing its storage slot, and slots are summed
/// per target.
pub fn update_main_workspace_size(
    module: &IrModule,
    targets: &TargetMap,
    storage_info: &[(Expr, StorageInfo)],
) -> Result<FunctionInfo> {
    let main = match module.lookup_name("main") {
        Some(BaseFunc::Function(main)) => Arc::clone(main),
        _ => return Err(LowerError::MissingMain),
    };
    debug!(
        targets = targets.len(),
        values = storage_info.len(),
        "calculating workspace of main"
    );

    let mut slot_sizes: BTreeMap<DeviceType, BTreeMap<i64, ByteSize>> = BTreeMap::new();
    let mut device_io: BTreeMap<DeviceType, ByteSize> = BTreeMap::new();
    let mut device_consts: BTreeMap<DeviceType, ByteSize> = BTreeMap::new();

    for (expr, info) in storage_info {
        if info.storage_ids.len() != info.virtual_devices.len() {
            return Err(LowerError::StorageMismatch {
                excerpt: excerpt(&expr.to_string(), 4),
                ids: info.storage_ids.len(),
                devices: info.virtual_devices.len(),
            });
        }
        for (sid, device) in info.storage_ids.iter().zip(&info.virtual_devices) {
            let device = device.device_type();
            slot_sizes.entry(device).or_default().insert(*sid, ByteSize::ZERO);
            device_io.insert(device, ByteSize::ZERO);
            device_consts.insert(device, ByteSize::ZERO);
        }
    }

    for (expr, info) in storage_info {
        let size = type_size_bytes(&expr.checked_type());
        trace!(value = expr.kind(), %size, "sizing value");
        let devices = info.virtual_devices.iter().map(VirtualDevice::device_type);
        match expr {
            Expr::Constant(_) => {
                for device in devices {
                    let total = device_consts.entry(device).or_default();
                    *total = *total + size;
                }
            }
            _ if matches!(expr, Expr::Var(_)) || *expr == main.body => {
                for device in devices {
                    let total = device_io.entry(device).or_default();
                    *total = *total + size;
                }
            }
            _ => {
                for (sid, device) in info.storage_ids.iter().zip(devices) {
                    let slot = slot_sizes
                        .entry(device)
                        .or_default()
                        .entry(*sid)
                        .or_default();
                    *slot = slot.max(size);
                }
            }
        }
    }

    let mut function_info = FunctionInfo::default();
    for target in targets.values() {
        function_info
            .workspace_sizes
            .insert(target.clone(), ByteSize::ZERO);
    }

    // Devices sharing a target add up.
    for (device, slots) in &slot_sizes {
        let target = target_for_device(*device, targets)?;
        let total: ByteSize = slots.values().copied().sum();
        add_to(&mut function_info.workspace_sizes, &target, total);
        function_info
            .relay_funcs
            .insert(target, Arc::clone(&main));
    }
    for (device, total) in &device_io {
        let target = target_for_device(*device, targets)?;
        add_to(&mut function_info.io_sizes, &target, *total);
    }
    for (device, total) in &device_consts {
        let target = target_for_device(*device, targets)?;
        add_to(&mut function_info.constant_sizes, &target, *total);
    }

    debug!(info = %function_info, "workspace of main");
    Ok(function_info)
}

fn add_to(sizes: &mut BTreeMap<Target, ByteSize>, target: &Target, size: ByteSize) {
    let entry = sizes.entry(target.clone()).or_default();
    *entry = *entry + size;
}

/// Records the footprint of a function lowered by the rewriter under its
/// entry name, using [`PeakAllocationSizer`] for workspace.
pub fn update_function_metadata(
    annotated: &AnnotatedFunction,
    metadata: &mut BTreeMap<String, FunctionInfo>,
    workspace_byte_alignment: u64,
) -> Result<()> {
    update_function_metadata_with(
        annotated,
        metadata,
        workspace_byte_alignment,
        &PeakAllocationSizer,
    )
}

/// [`update_function_metadata`] with a caller-supplied workspace sizer.
pub fn update_function_metadata_with(
    annotated: &AnnotatedFunction,
    metadata: &mut BTreeMap<String, FunctionInfo>,
    workspace_byte_alignment: u64,
    sizer: &dyn WorkspaceSizer,
) -> Result<()> {
    let name = || match &annotated.func {
        BaseFunc::Prim(prim) => prim
            .attrs
            .global_symbol
            .clone()
            .unwrap_or_else(|| "<prim func>".to_string()),
        BaseFunc::Function(function) => function
            .attrs
            .global_symbol
            .clone()
            .unwrap_or_else(|| format!("fn[{}]", function.op_names().join(", "))),
        BaseFunc::Opaque { type_key } => type_key.clone(),
    };
    let annotation = annotated
        .annotation
        .as_ref()
        .ok_or_else(|| LowerError::MissingAnnotation {
            name: name(),
            missing: "prim_funcs",
        })?;
    let relay_target = annotation
        .target
        .as_ref()
        .ok_or_else(|| LowerError::MissingAnnotation {
            name: annotation.prim_fn_var.name.clone(),
            missing: "target",
        })?;

    let mut info = FunctionInfo::default();
    for prim in annotation.prim_funcs.values() {
        let target = prim.target().unwrap_or(relay_target).clone();
        let workspace = sizer.workspace_bytes(prim, workspace_byte_alignment);
        let io: ByteSize = prim
            .params
            .iter()
            .map(|param| {
                prim.buffer_for(param)
                    .map_or(ByteSize::ZERO, |buffer| buffer.size_bytes_or_zero().into())
            })
            .sum();

        let entry = info.workspace_sizes.entry(target.clone()).or_default();
        *entry = entry.max(workspace);
        let entry = info.io_sizes.entry(target.clone()).or_default();
        *entry = entry.max(io);
        info.constant_sizes.insert(target.clone(), ByteSize::ZERO);
        info.prim_funcs.insert(target.clone(), prim.clone());
        if let BaseFunc::Function(function) = &annotated.func {
            info.relay_funcs.insert(target, Arc::clone(function));
        }
    }

    debug!(entry = %annotation.prim_fn_var, info = %info, "function metadata");
    metadata.insert(annotation.prim_fn_var.name.clone(), info);
    Ok(())
}
