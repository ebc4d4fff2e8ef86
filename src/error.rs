use thiserror::Error;

#[derive(Error, Debug)]
pub enum VmemError {
    #[error("Cannot identify running image: {0}")]
    Introspection(String),

    #[error("Invalid architecture descriptor: {0}")]
    InvalidDescriptor(String),

    #[error("Invalid region at {base:#x} ({len} bytes): {reason}")]
    InvalidRegion {
        base: usize,
        len: usize,
        reason: String,
    },

    #[error("Out of memory: cannot satisfy request of {requested} bytes")]
    OutOfMemory { requested: usize },

    #[error("Invalid argument: {0}")]
    InvalidArgument(String),

    #[error("Invalid handle: {0:#x} is not a live allocation of this arena")]
    InvalidHandle(usize),

    #[error("Fork handler registration failed with code {0}")]
    ForkRegistration(i32),

    #[error("Arena consistency check failed: {0}")]
    Corrupted(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, VmemError>;
