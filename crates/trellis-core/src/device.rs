use std::fmt;

// DeviceId — Where a matrix is resident
//
// Placement and transfer machinery belong to the surrounding trainer. The
// criterion layer only needs to know where each tensor lives, so that
//   1. a node can migrate all of its owned tensors to one target device, and
//   2. loops that read label values element by element can insist on host
//      residency.
//
// The engine in this crate keeps every buffer in host memory; the device id
// is the residency tag a real transfer layer keys on.

/// Identifies a compute device.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum DeviceId {
    /// Host memory.
    #[default]
    Cpu,
    /// An accelerator, by ordinal.
    Gpu(u32),
}

impl DeviceId {
    /// A human-readable name for this device (e.g., "cpu", "cuda:0").
    pub fn name(&self) -> String {
        match self {
            DeviceId::Cpu => "cpu".to_string(),
            DeviceId::Gpu(ordinal) => format!("cuda:{}", ordinal),
        }
    }

    pub fn is_cpu(&self) -> bool {
        matches!(self, DeviceId::Cpu)
    }
}

impl fmt::Display for DeviceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.name())
    }
}
