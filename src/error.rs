#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KernelError {
    /// The resource is unavailable and the caller asked not to wait.
    WouldBlock,
    /// The caller suspended and the wait expired before the resource
    /// became available.
    TimedOut,
    /// The requested state transition is not legal for the target thread
    /// (stale handle, cancel after start, and similar).
    InvalidState,
    /// The thread registry is full.
    MaxThreadsReached,
}

impl KernelError {
    pub fn as_str(self) -> &'static str {
        match self {
            KernelError::WouldBlock => "Resource unavailable, would block",
            KernelError::TimedOut => "Timed out waiting for resource",
            KernelError::InvalidState => "Invalid thread state for operation",
            KernelError::MaxThreadsReached => "Maximum number of threads reached",
        }
    }
}

pub type KernelResult<T> = Result<T, KernelError>;
