/// Errors that can occur while driving a local kernel
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum KernelError {
    /// Failed to launch the kernel process
    #[error("Failed to spawn kernel: {0}")]
    SpawnFailed(String),
    /// No kernel registered under this id
    #[error("Kernel not found: {0}")]
    NotFound(String),
    /// The id cannot be used as the host label that routes to the kernel
    #[error("Invalid kernel id '{0}': expected a lowercase host label")]
    InvalidId(String),
    /// A kernel is already registered under this id
    #[error("Kernel already registered: {0}")]
    AlreadyRegistered(String),
    /// Failed to write a frame to the kernel
    #[error("Failed to write to kernel: {0}")]
    WriteFailed(String),
    /// Failed to signal the kernel process
    #[error("Failed to kill kernel: {0}")]
    KillFailed(String),
    /// The kernel has exited (or its peer went away)
    #[error("Kernel has exited")]
    ProcessExited,
    /// Actor channel communication error
    #[error("Channel error: {0}")]
    ChannelError(String),
}
