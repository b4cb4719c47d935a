use crate::error::BenchError;
use serde::{Deserialize, Serialize};
use std::fmt::{self, Debug, Display};

/// A device to execute on.
///
/// Only the host backend is implemented. Accelerators can be described (ie selected by the
/// `--use-accelerator` flag) but [`.ensure_available()`](Device::ensure_available) rejects them.
#[derive(Clone, Copy, Eq, PartialEq, Serialize, Deserialize)]
pub enum Device {
    /// The host (cpu).
    Host,
    /// An accelerator with an index.
    Accelerator(usize),
}

impl Default for Device {
    fn default() -> Self {
        Self::Host
    }
}

impl Device {
    /// The host device.
    pub fn host() -> Self {
        Self::Host
    }
    /// The accelerator at `index`.
    pub fn accelerator(index: usize) -> Self {
        Self::Accelerator(index)
    }
    /// Selects the first accelerator if `use_accelerator` is true, the host otherwise.
    pub fn select(use_accelerator: bool) -> Self {
        if use_accelerator {
            Self::accelerator(0)
        } else {
            Self::host()
        }
    }
    /// Whether the device is the host.
    pub fn is_host(&self) -> bool {
        matches!(self, Self::Host)
    }
    /// Errors if there is no backend for the device.
    pub fn ensure_available(&self) -> Result<(), BenchError> {
        if self.is_host() {
            Ok(())
        } else {
            Err(BenchError::DeviceUnavailable(self.to_string()))
        }
    }
}

impl Debug for Device {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            Self::Host => f.write_str("Host"),
            Self::Accelerator(index) => f.debug_tuple("Accelerator").field(index).finish(),
        }
    }
}

impl Display for Device {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            Self::Host => f.write_str("host"),
            Self::Accelerator(index) => write!(f, "accelerator({index})"),
        }
    }
}
