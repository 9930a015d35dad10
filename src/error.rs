//! Error types for the toolchain host
//!
//! Every failure ends up as terminal output, so each variant carries enough
//! context to render a one-line explanation.

use crate::pipeline::Stage;
use crate::vfs::NodeKind;
use std::fmt;

/// Result type for host runtime operations
pub type RuntimeResult<T> = Result<T, RuntimeError>;

/// Errors raised by the host runtime, its guests and the pipeline
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RuntimeError {
    /// Archive header or entry is malformed or of an unsupported type
    ArchiveFormat { offset: usize, reason: String },

    /// Path is not registered in the filesystem
    NotFound { path: String },

    /// Path is already registered with an incompatible kind
    PathConflict { path: String, existing: NodeKind },

    /// Path does not fit the filesystem engine's scratch buffer
    PathTooLong { len: usize, max: usize },

    /// Guest called a syscall the shim deliberately does not implement
    UnsupportedSyscall {
        module: &'static str,
        name: &'static str,
    },

    /// Guest passed a descriptor the bridged syscall does not accept
    BadDescriptor { syscall: &'static str, fd: i32 },

    /// Memory access out of bounds
    MemoryAccessOutOfBounds {
        address: u64,
        size: u64,
        memory_size: u64,
    },

    /// Guest faulted during execution (already reported to the terminal)
    GuestTrap { message: String },

    /// Guest exited with a failing code (already reported to the terminal)
    GuestExit { code: i32 },

    /// A pipeline stage failed; the remaining stages were not run
    StageFailed {
        stage: Stage,
        cause: Box<RuntimeError>,
    },

    /// Module binary is malformed or invalid
    InvalidModule { reason: String },

    /// Required export is missing
    MissingExport { name: &'static str },

    /// Module instantiation failed
    InstantiationFailed { reason: String },

    /// Module or archive could not be fetched
    Fetch { name: String, reason: String },

    /// Stdin mailbox handshake failed
    Mailbox { reason: String },

    /// Filesystem engine aborted
    Aborted { reason: String },

    /// Command line names no known tool or binary
    CommandNotFound { name: String },

    /// A run request arrived before `init`
    NotInitialized,

    /// Inbound message could not be understood
    Protocol { reason: String },
}

impl RuntimeError {
    /// Whether GuestRuntime already wrote a diagnostic for this failure
    pub fn is_reported(&self) -> bool {
        match self {
            Self::GuestTrap { .. } | Self::GuestExit { .. } => true,
            Self::StageFailed { cause, .. } => cause.is_reported(),
            _ => false,
        }
    }

    /// Wrap this error as the failure of a pipeline stage
    pub fn in_stage(self, stage: Stage) -> Self {
        match self {
            already @ Self::StageFailed { .. } => already,
            cause => Self::StageFailed {
                stage,
                cause: Box::new(cause),
            },
        }
    }
}

impl fmt::Display for RuntimeError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::ArchiveFormat { offset, reason } => {
                write!(f, "malformed archive at offset {}: {}", offset, reason)
            }
            Self::NotFound { path } => write!(f, "no such file: {}", path),
            Self::PathConflict { path, existing } => {
                write!(f, "path already registered as a {}: {}", existing, path)
            }
            Self::PathTooLong { len, max } => {
                write!(f, "path of {} bytes exceeds the {} byte limit", len, max)
            }
            Self::UnsupportedSyscall { module, name } => {
                write!(f, "unsupported syscall: {}.{}", module, name)
            }
            Self::BadDescriptor { syscall, fd } => {
                write!(f, "{} called with unsupported descriptor {}", syscall, fd)
            }
            Self::MemoryAccessOutOfBounds {
                address,
                size,
                memory_size,
            } => {
                write!(
                    f,
                    "memory access out of bounds: address {} + size {} > memory size {}",
                    address, size, memory_size
                )
            }
            Self::GuestTrap { message } => write!(f, "{}", message),
            Self::GuestExit { code } => write!(f, "process exited with code {}.", code),
            Self::StageFailed { stage, cause } => write!(f, "{} failed: {}", stage, cause),
            Self::InvalidModule { reason } => write!(f, "invalid WASM module: {}", reason),
            Self::MissingExport { name } => write!(f, "missing required export: '{}'", name),
            Self::InstantiationFailed { reason } => {
                write!(f, "module instantiation failed: {}", reason)
            }
            Self::Fetch { name, reason } => write!(f, "failed to fetch {}: {}", name, reason),
            Self::Mailbox { reason } => write!(f, "stdin mailbox: {}", reason),
            Self::Aborted { reason } => write!(f, "filesystem engine aborted: {}", reason),
            Self::CommandNotFound { name } => write!(f, "command not found: {}", name),
            Self::NotInitialized => write!(f, "toolchain is not initialized"),
            Self::Protocol { reason } => write!(f, "bad message: {}", reason),
        }
    }
}

impl std::error::Error for RuntimeError {}
