use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

/// Physical device families a target can execute on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum DeviceType {
    Cpu,
    Cuda,
    OpenCl,
    Vulkan,
    Metal,
    Rocm,
    /// Synthetic device for functions handed to external toolchains.
    ExtDev,
    Unknown,
}

impl DeviceType {
    pub fn name(self) -> &'static str {
        match self {
            DeviceType::Cpu => "cpu",
            DeviceType::Cuda => "cuda",
            DeviceType::OpenCl => "opencl",
            DeviceType::Vulkan => "vulkan",
            DeviceType::Metal => "metal",
            DeviceType::Rocm => "rocm",
            DeviceType::ExtDev => "ext_dev",
            DeviceType::Unknown => "unknown",
        }
    }
}

impl fmt::Display for DeviceType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// A compilation target. Identity is structural: two targets with the same
/// kind and attributes are the same target.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct Target {
    pub kind: String,
    #[serde(default)]
    pub attrs: BTreeMap<String, String>,
}

impl Target {
    pub const EXT_DEV: &'static str = "ext_dev";

    pub fn new(kind: impl Into<String>) -> Self {
        Self {
            kind: kind.into(),
            attrs: BTreeMap::new(),
        }
    }

    /// The generic target used for everything compiled by an external toolchain.
    pub fn ext_dev() -> Self {
        Self::new(Self::EXT_DEV)
    }

    pub fn with_attr(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.attrs.insert(key.into(), value.into());
        self
    }

    pub fn device_type(&self) -> DeviceType {
        match self.kind.as_str() {
            "llvm" | "c" | "cpu" => DeviceType::Cpu,
            "cuda" | "nvptx" => DeviceType::Cuda,
            "opencl" => DeviceType::OpenCl,
            "vulkan" => DeviceType::Vulkan,
            "metal" => DeviceType::Metal,
            "rocm" => DeviceType::Rocm,
            Self::EXT_DEV => DeviceType::ExtDev,
            _ => DeviceType::Unknown,
        }
    }

    pub fn is_ext_dev(&self) -> bool {
        self.kind == Self::EXT_DEV
    }
}

impl fmt::Display for Target {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.kind)?;
        for (key, value) in &self.attrs {
            write!(f, " -{key}={value}")?;
        }
        Ok(())
    }
}

/// Parses the [`Display`](fmt::Display) form: a kind followed by
/// `-key=value` attributes separated by whitespace.
impl FromStr for Target {
    type Err = String;

    fn from_str(text: &str) -> Result<Self, Self::Err> {
        let mut parts = text.split_whitespace();
        let kind = parts
            .next()
            .ok_or_else(|| "empty target string".to_string())?;
        let mut target = Self::new(kind);
        for part in parts {
            let attr = part
                .strip_prefix('-')
                .and_then(|attr| attr.split_once('='))
                .ok_or_else(|| format!("malformed target attribute `{part}`"))?;
            target = target.with_attr(attr.0, attr.1);
        }
        Ok(target)
    }
}

/// Where a value lives and which target computes it, as assigned by device
/// planning. Call sites reaching the lowering stage must be constrained.
#[derive(Debug, Clone, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct VirtualDevice {
    #[serde(default)]
    pub device_type: Option<DeviceType>,
    #[serde(default)]
    pub target: Option<Target>,
}

impl VirtualDevice {
    pub fn unconstrained() -> Self {
        Self::default()
    }

    pub fn for_target(target: Target) -> Self {
        Self {
            device_type: Some(target.device_type()),
            target: Some(target),
        }
    }

    pub fn is_fully_unconstrained(&self) -> bool {
        self.device_type.is_none() && self.target.is_none()
    }

    pub fn device_type(&self) -> DeviceType {
        self.device_type
            .or_else(|| self.target.as_ref().map(Target::device_type))
            .unwrap_or(DeviceType::Unknown)
    }
}

impl fmt::Display for VirtualDevice {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match (&self.device_type, &self.target) {
            (None, None) => f.write_str("?"),
            (Some(device), None) => write!(f, "{device}"),
            (_, Some(target)) => write!(f, "{}:{target}", self.device_type()),
        }
    }
}
