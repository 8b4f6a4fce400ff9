use thiserror::Error;

#[derive(Error, Debug)]
pub enum UsmError {
    #[error("I/O Error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Out of memory: requested {0} bytes")]
    OutOfMemory(u64),

    #[error("Invalid allocation size: {0}")]
    InvalidSize(u64),

    #[error("Invalid argument: {0}")]
    InvalidArgument(String),

    #[error("Invalid root device index: {0}")]
    InvalidRootDevice(u32),

    #[error("Memory manager error: {0}")]
    Backing(String),
}

// A convenient alias
pub type UsmResult<T> = Result<T, UsmError>;
