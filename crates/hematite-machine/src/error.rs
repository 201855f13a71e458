use core::fmt;

/// Errors raised while assembling a machine. Runtime access outside the
/// configured physical map is a kernel bug and panics instead.
#[derive(Debug, PartialEq)]
pub enum MachineError {
    BadDramSize(usize),
    BadDiskSize(usize),
}

impl fmt::Display for MachineError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            MachineError::BadDramSize(sz) => {
                write!(f, "dram size {:#x} is not page-aligned", sz)
            }
            MachineError::BadDiskSize(sz) => {
                write!(f, "disk size {:#x} is not a whole number of sectors", sz)
            }
        }
    }
}

impl std::error::Error for MachineError {}
