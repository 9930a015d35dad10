//! Guest ABI types and constants
//!
//! This module defines the stable interface between the host and guest modules.

use bytemuck::{Pod, Zeroable};

/// Required export names
pub mod exports {
    /// The linear memory export name
    pub const MEMORY: &str = "memory";
    /// The command entry point
    pub const START: &str = "_start";
}

/// Import module namespaces
pub mod namespaces {
    /// Process surface and the filesystem engine's file syscalls
    pub const WASI: &str = "wasi_unstable";
    /// Filesystem engine imports and application extras
    pub const ENV: &str = "env";
}

/// Process-surface syscall names (imported by guests)
pub mod syscalls {
    pub const PROC_EXIT: &str = "proc_exit";
    pub const ENVIRON_SIZES_GET: &str = "environ_sizes_get";
    pub const ENVIRON_GET: &str = "environ_get";
    pub const ARGS_SIZES_GET: &str = "args_sizes_get";
    pub const ARGS_GET: &str = "args_get";
    pub const RANDOM_GET: &str = "random_get";
    pub const CLOCK_TIME_GET: &str = "clock_time_get";
    pub const POLL_ONEOFF: &str = "poll_oneoff";
    /// File syscalls the filesystem engine exports to guests
    pub const FD_WRITE: &str = "fd_write";
    pub const FD_READ: &str = "fd_read";
}

/// Filesystem engine exports the host drives directly
pub mod fs_exports {
    pub const INIT: &str = "init";
    pub const GET_PATH_BUF: &str = "GetPathBuf";
    pub const ADD_DIRECTORY_NODE: &str = "AddDirectoryNode";
    pub const ADD_FILE_NODE: &str = "AddFileNode";
    pub const FIND_NODE: &str = "FindNode";
    pub const GET_FILE_NODE_ADDRESS: &str = "GetFileNodeAddress";
    pub const GET_FILE_NODE_SIZE: &str = "GetFileNodeSize";

    /// Size of the engine's scratch path buffer
    pub const PATH_BUF_CAPACITY: usize = 1024;
}

/// Imports the filesystem engine expects from the host
pub mod fs_imports {
    pub const ABORT: &str = "abort";
    pub const HOST_WRITE: &str = "host_write";
    pub const HOST_READ: &str = "host_read";
    pub const MEMFS_LOG: &str = "memfs_log";
    pub const COPY_IN: &str = "copy_in";
    pub const COPY_OUT: &str = "copy_out";
}

/// Standard file descriptors
pub mod fd {
    pub const STDIN: i32 = 0;
    pub const STDOUT: i32 = 1;
    pub const STDERR: i32 = 2;

    pub fn is_stdio(fd: i32) -> bool {
        (STDIN..=STDERR).contains(&fd)
    }
}

/// WASI errno values returned by the shim
pub mod errno {
    pub const SUCCESS: i32 = 0;
    pub const BADF: i32 = 8;
    pub const INVAL: i32 = 28;
    pub const NOENT: i32 = 44;
}

/// `path_open` open flags
pub mod oflags {
    pub const CREAT: u16 = 1;
    pub const TRUNC: u16 = 8;
}

/// Exit code meaning "exited, but keep scheduling this guest"
///
/// Application convention, not a POSIX status: a guest that wants to keep
/// receiving callbacks after `_start` finishes exits with this code.
pub const CONTINUE_SCHEDULING_EXIT_CODE: i32 = 0xC0C0A;

/// One scatter/gather segment as laid out in guest memory
#[derive(Debug, Clone, Copy, PartialEq, Eq, Pod, Zeroable)]
#[repr(C)]
pub struct RawIovec {
    /// Guest address of the segment
    pub buf: u32,
    /// Segment length in bytes
    pub len: u32,
}

impl RawIovec {
    pub const SIZE: usize = 8;

    /// Decode a packed array of iovecs (little-endian fields)
    pub fn decode_all(bytes: &[u8]) -> Vec<RawIovec> {
        bytes
            .chunks_exact(Self::SIZE)
            .map(|chunk| {
                let raw: RawIovec = bytemuck::pod_read_unaligned(chunk);
                RawIovec {
                    buf: u32::from_le(raw.buf),
                    len: u32::from_le(raw.len),
                }
            })
            .collect()
    }
}

/// String table layout helper
///
/// `args_get` and `environ_get` share one protocol:
/// 1. The guest asks for the entry count and total buffer size
/// 2. It allocates a pointer array and a string buffer
/// 3. The host writes NUL-terminated strings into the buffer and a pointer to
///    each one into the array
#[derive(Debug)]
pub struct StringTable {
    entries: Vec<String>,
    /// Offsets of each string from the start of the string buffer
    offsets: Vec<usize>,
    /// Total bytes needed for strings (including null terminators)
    buf_size: usize,
}

impl StringTable {
    /// Calculate layout for the given entries
    pub fn new(entries: Vec<String>) -> Self {
        let mut buf_size = 0;
        let mut offsets = Vec::with_capacity(entries.len());

        for entry in &entries {
            offsets.push(buf_size);
            buf_size += entry.len() + 1; // +1 for null terminator
        }

        Self {
            entries,
            offsets,
            buf_size,
        }
    }

    pub fn count(&self) -> usize {
        self.entries.len()
    }

    pub fn buf_size(&self) -> usize {
        self.buf_size
    }

    /// Serialize into a pointer array and a string buffer
    ///
    /// `buf_addr` is the guest address the string buffer will be written to.
    pub fn encode(&self, buf_addr: u32) -> (Vec<u8>, Vec<u8>) {
        let mut pointers = Vec::with_capacity(self.count() * 4);
        let mut strings = vec![0u8; self.buf_size];

        for (entry, &offset) in self.entries.iter().zip(&self.offsets) {
            let ptr = buf_addr + offset as u32;
            pointers.extend_from_slice(&ptr.to_le_bytes());
            strings[offset..offset + entry.len()].copy_from_slice(entry.as_bytes());
        }

        (pointers, strings)
    }
}
