//! Kernel-wide error type.
//!
//! Every fallible kernel operation surfaces one of these variants; syscall
//! handlers flatten them to `-1` at the user boundary.

use core::fmt;

/// Result alias used across the kernel.
pub type KernelResult<T> = Result<T, KernelError>;

/// Errors surfaced by the kernel core.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[must_use = "kernel errors must be handled, not silently discarded"]
pub enum KernelError {
    /// The physical frame allocator is exhausted.
    OutOfFrames,
    /// The kernel bump heap is exhausted.
    OutOfHeap,
    /// Frame allocation failed during a page-table walk; the partial walk
    /// is left in place.
    MapFailure,
    /// Lookup on an absent translation.
    NotMapped,
    /// Invalid or closed file descriptor.
    BadDescriptor,
    /// Malformed path, bad alignment or out-of-range LBA.
    InvalidArgument,
    /// A filesystem name already exists.
    Exists,
    /// A filesystem name lookup found nothing.
    NotFound,
    /// A bitmap is exhausted or the direct-block limit was reached.
    NoSpace,
    /// Block device status error or poll timeout.
    IoError,
    /// Filesystem operation attempted without a mounted filesystem.
    NotMounted,
    /// Unknown system-call number.
    InvalidCall,
}

impl fmt::Display for KernelError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let msg = match *self {
            Self::OutOfFrames => "out of physical frames",
            Self::OutOfHeap => "out of kernel heap",
            Self::MapFailure => "page-table allocation failed",
            Self::NotMapped => "address not mapped",
            Self::BadDescriptor => "bad file descriptor",
            Self::InvalidArgument => "invalid argument",
            Self::Exists => "already exists",
            Self::NotFound => "not found",
            Self::NoSpace => "no space",
            Self::IoError => "I/O error",
            Self::NotMounted => "filesystem not mounted",
            Self::InvalidCall => "invalid system call",
        };
        f.write_str(msg)
    }
}
