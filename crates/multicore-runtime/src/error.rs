use thiserror::Error;

#[derive(Error, Debug)]
pub enum RuntimeError {
    #[error("No available workers in pool (pool size {pool_size})")]
    PoolExhausted { pool_size: usize },

    #[error("Unknown thread id {0}")]
    UnknownThread(u32),

    #[error("Thread {0} was already joined")]
    AlreadyJoined(u32),

    #[error("Thread {0} is detached and cannot be joined")]
    JoinAfterDetach(u32),

    #[error("Thread {0} is still running")]
    StillRunning(u32),

    #[error("Arena access out of bounds: offset {offset}, len {len}")]
    OutOfBounds { offset: u32, len: u32 },

    #[error("Misaligned atomic access at offset {0}")]
    Misaligned(u32),

    #[error("Barrier id {id} outside configured capacity {capacity}")]
    UnknownBarrier { id: u32, capacity: u32 },

    #[error("Barrier {0} has no participant count configured")]
    BarrierUnconfigured(u32),

    #[error("Completion flag index {index} outside capacity {capacity}")]
    FlagOutOfRange { index: u32, capacity: u32 },

    #[error("TLS slot {slot} outside allocated slots {slots}")]
    TlsSlotOutOfRange { slot: u32, slots: u32 },

    #[error("Arena layout overlap: {first} intersects {second}")]
    LayoutOverlap { first: String, second: String },

    #[error("TLS region needs {needed} bytes but the guest reserved {reserved}")]
    TlsRegionTooSmall { needed: u64, reserved: u32 },

    #[error("Thread {0} was retired and its bookkeeping has been dropped")]
    Retired(u32),

    #[error("Guest module is missing export '{0}'")]
    MissingExport(String),

    #[error("Invalid runtime configuration: {0}")]
    Config(String),

    #[error("Guest ABI violation: {0}")]
    InvalidAbi(String),

    #[error("Execution context {index} failed to instantiate: {message}")]
    Instantiation { index: usize, message: String },

    #[error("Failed to dispatch run request to execution context {index}")]
    Dispatch { index: usize },

    #[error("Runtime control words are not installed yet")]
    NotReady,

    #[error("Guest exited with code {0}")]
    Exit(i32),

    #[error("Lock poisoned: {0}")]
    Poisoned(String),

    #[error("Shared memory trap: {0}")]
    Trap(#[from] wasmtime::Trap),

    #[error("Generic error: {0}")]
    Generic(#[from] anyhow::Error),
}

pub type RuntimeResult<T> = Result<T, RuntimeError>;

pub(crate) fn lock_err<T>(err: std::sync::PoisonError<T>) -> RuntimeError {
    RuntimeError::Poisoned(err.to_string())
}
