use thiserror::Error;

/// User-visible failures. These surface as a negative return from the
/// originating system call and leave kernel state unchanged; invariant
/// breaches and resource exhaustion panic instead.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum KernelError {
    #[error("bad user address")]
    BadAddress,
    #[error("bad argument")]
    BadArg,
    #[error("file exists")]
    Exists,
    #[error("bad file descriptor")]
    BadFd,
    #[error("too many open files")]
    NoFile,
    #[error("file too large")]
    FileTooLarge,
    #[error("address space limit reached")]
    NoSpace,
}

pub type Result<T> = core::result::Result<T, KernelError>;
