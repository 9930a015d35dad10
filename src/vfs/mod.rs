//! Virtual File System
//!
//! Name-addressed byte store shared by every pipeline stage. The node table
//! itself lives inside a filesystem engine with its own linear memory; the
//! host drives it through a handful of primitives and moves bytes in and out
//! of the engine's memory.
//!
//! Duplicate registration policy:
//! - `add_directory` on an existing directory is a no-op
//! - `add_file` on an existing file replaces its contents
//! - either call on a path registered with the other kind is `PathConflict`

pub mod archive;
pub mod heap;

pub use archive::{ArchiveLoader, ArchiveSummary};
pub use heap::HeapFsEngine;

use crate::error::{RuntimeError, RuntimeResult};
use crate::guest::abi::fs_exports::PATH_BUF_CAPACITY;
use crate::memory::MemoryView;
use std::cell::RefCell;
use std::collections::BTreeMap;
use std::fmt;
use std::rc::Rc;

/// Kind of a registered node
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NodeKind {
    File,
    Directory,
}

impl fmt::Display for NodeKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            NodeKind::File => write!(f, "file"),
            NodeKind::Directory => write!(f, "directory"),
        }
    }
}

/// Primitives exported by a filesystem engine
///
/// Paths are never passed directly: the caller writes the path into the
/// engine's scratch buffer (`path_buf`) and passes its byte length.
pub trait FsEngine {
    /// The engine's own linear memory
    fn memory(&self) -> MemoryView;

    /// Address of the scratch path buffer
    fn path_buf(&self) -> RuntimeResult<u32>;

    fn add_directory_node(&self, path_len: u32) -> RuntimeResult<u32>;

    /// Allocate a file node of `size` bytes, returning its inode
    fn add_file_node(&self, path_len: u32, size: u32) -> RuntimeResult<u32>;

    /// Inode of the path, or `None`
    fn find_node(&self, path_len: u32) -> RuntimeResult<Option<u32>>;

    fn file_node_address(&self, inode: u32) -> RuntimeResult<u32>;

    fn file_node_size(&self, inode: u32) -> RuntimeResult<u32>;

    /// Guest `fd_write`, pointers in the guest's memory
    fn fd_write(&self, fd: i32, iovs: u32, iovs_len: u32, nwritten: u32) -> RuntimeResult<i32>;

    /// Guest `fd_read`, pointers in the guest's memory
    fn fd_read(&self, fd: i32, iovs: u32, iovs_len: u32, nread: u32) -> RuntimeResult<i32>;
}

/// Strip `./` prefixes and a trailing slash (except for the root)
pub fn normalize_path(path: &str) -> String {
    let mut path = path;
    while let Some(rest) = path.strip_prefix("./") {
        path = rest;
    }
    if path.len() > 1 && path.ends_with('/') {
        path = path.trim_end_matches('/');
        if path.is_empty() {
            return "/".to_string();
        }
    }
    path.to_string()
}

/// Last component of a path
pub fn base_name(path: &str) -> &str {
    path.rsplit('/').next().unwrap_or(path)
}

/// Host view of the engine's node table
pub struct VirtualFileSystem {
    engine: Rc<dyn FsEngine>,
    /// Kinds of the nodes the host registered
    registered: RefCell<BTreeMap<String, NodeKind>>,
}

impl VirtualFileSystem {
    pub fn new(engine: Rc<dyn FsEngine>) -> Self {
        Self {
            engine,
            registered: RefCell::new(BTreeMap::new()),
        }
    }

    pub fn engine(&self) -> &Rc<dyn FsEngine> {
        &self.engine
    }

    /// Write `path` into the engine's scratch buffer
    fn stage_path(&self, path: &str) -> RuntimeResult<u32> {
        if path.len() > PATH_BUF_CAPACITY {
            return Err(RuntimeError::PathTooLong {
                len: path.len(),
                max: PATH_BUF_CAPACITY,
            });
        }
        let buf = self.engine.path_buf()?;
        self.engine.memory().write_bytes(buf, path)?;
        Ok(path.len() as u32)
    }

    pub fn add_directory(&self, path: &str) -> RuntimeResult<()> {
        let path = normalize_path(path);
        match self.kind_of(&path) {
            Some(NodeKind::Directory) => return Ok(()),
            Some(NodeKind::File) => {
                return Err(RuntimeError::PathConflict {
                    path,
                    existing: NodeKind::File,
                });
            }
            None => {}
        }

        let len = self.stage_path(&path)?;
        self.engine.add_directory_node(len)?;
        self.registered
            .borrow_mut()
            .insert(path, NodeKind::Directory);
        Ok(())
    }

    pub fn add_file(&self, path: &str, contents: impl AsRef<[u8]>) -> RuntimeResult<()> {
        let path = normalize_path(path);
        let contents = contents.as_ref();
        if self.kind_of(&path) == Some(NodeKind::Directory) {
            return Err(RuntimeError::PathConflict {
                path,
                existing: NodeKind::Directory,
            });
        }

        let len = self.stage_path(&path)?;
        let inode = self.engine.add_file_node(len, contents.len() as u32)?;
        let address = self.engine.file_node_address(inode)?;
        self.engine.memory().write_bytes(address, contents)?;
        self.registered.borrow_mut().insert(path, NodeKind::File);
        Ok(())
    }

    /// Exact-size copy of a file's contents
    ///
    /// Finds files created by guests as well as by the host.
    pub fn get_file_contents(&self, path: &str) -> RuntimeResult<Vec<u8>> {
        let path = normalize_path(path);
        if self.kind_of(&path) == Some(NodeKind::Directory) {
            return Err(RuntimeError::NotFound { path });
        }

        let len = self.stage_path(&path)?;
        let inode = self
            .engine
            .find_node(len)?
            .ok_or_else(|| RuntimeError::NotFound { path: path.clone() })?;
        let address = self.engine.file_node_address(inode)?;
        let size = self.engine.file_node_size(inode)?;
        self.engine.memory().read_bytes(address, size as usize)
    }

    pub fn exists(&self, path: &str) -> RuntimeResult<bool> {
        let path = normalize_path(path);
        if self.registered.borrow().contains_key(&path) {
            return Ok(true);
        }
        let len = self.stage_path(&path)?;
        Ok(self.engine.find_node(len)?.is_some())
    }

    /// Kind of a host-registered node
    pub fn kind_of(&self, path: &str) -> Option<NodeKind> {
        self.registered.borrow().get(&normalize_path(path)).copied()
    }

    /// Host-registered nodes in path order
    pub fn entries(&self) -> Vec<(String, NodeKind)> {
        self.registered
            .borrow()
            .iter()
            .map(|(path, kind)| (path.clone(), *kind))
            .collect()
    }
}
