use std::fmt;

/// Opaque handle naming where collaborator computation runs.
///
/// Device enumeration and selection live outside this crate; the session
/// only threads the handle through to the optimizer and minibatch sources.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Device {
    Cpu,
    Gpu(usize),
}

impl Default for Device {
    fn default() -> Self {
        Device::Cpu
    }
}

impl fmt::Display for Device {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Device::Cpu => write!(f, "cpu"),
            Device::Gpu(ordinal) => write!(f, "gpu:{}", ordinal),
        }
    }
}
