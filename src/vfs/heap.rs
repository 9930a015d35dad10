//! Native filesystem engine
//!
//! An in-process stand-in for the browser's memfs module, used outside the
//! browser and by tests. It owns a separate linear memory laid out as:
//!
//! ```text
//! 0x0010  path buffer   (PATH_BUF_CAPACITY bytes)
//! 0x0410  scratch area  (iovec arrays, out-parameters)
//! 0x1000  content heap  (bump allocated, grows page-wise)
//! ```
//!
//! Guest-facing syscalls receive guest pointers and move bytes only through
//! the bridge's `copy_in`/`copy_out`.

use super::{FsEngine, NodeKind, normalize_path};
use crate::bridge::Bridge;
use crate::error::{RuntimeError, RuntimeResult};
use crate::guest::abi::fs_exports::PATH_BUF_CAPACITY;
use crate::guest::abi::{RawIovec, errno, fd, oflags};
use crate::memory::{LinearBuffer, MemoryView, PAGE_SIZE};
use slab::Slab;
use std::cell::{Cell, RefCell};
use std::collections::HashMap;
use std::rc::Rc;

const PATH_BUF: u32 = 0x10;
const SCRATCH: u32 = PATH_BUF + PATH_BUF_CAPACITY as u32;
const SCRATCH_CAPACITY: usize = 1024;
const HEAP_BASE: u32 = 0x1000;

/// First descriptor handed out for opened files
const FIRST_FILE_FD: i32 = 3;

#[derive(Debug, Clone, Copy)]
struct Node {
    kind: NodeKind,
    address: u32,
    size: u32,
    capacity: u32,
}

struct OpenFile {
    node: usize,
    position: u32,
}

pub struct HeapFsEngine {
    buffer: LinearBuffer,
    memory: MemoryView,
    nodes: RefCell<Slab<Node>>,
    /// Path -> node key
    index: RefCell<HashMap<String, usize>>,
    open_files: RefCell<Slab<OpenFile>>,
    heap_top: Cell<u32>,
    bridge: Rc<Bridge>,
}

impl HeapFsEngine {
    /// Create the engine and hand its memory to the bridge
    pub fn new(bridge: Rc<Bridge>) -> Self {
        let buffer = LinearBuffer::new(1);
        let memory = MemoryView::from_buffer(buffer.clone());
        bridge.attach_fs_memory(memory.clone());
        Self {
            buffer,
            memory,
            nodes: RefCell::new(Slab::new()),
            index: RefCell::new(HashMap::new()),
            open_files: RefCell::new(Slab::new()),
            heap_top: Cell::new(HEAP_BASE),
            bridge,
        }
    }

    /// Number of nodes in the table
    pub fn node_count(&self) -> usize {
        self.nodes.borrow().len()
    }

    /// Bump-allocate `size` bytes, growing memory as needed
    fn alloc(&self, size: u32) -> RuntimeResult<u32> {
        let address = (self.heap_top.get() + 7) & !7;
        let end = address
            .checked_add(size)
            .ok_or_else(|| RuntimeError::Aborted {
                reason: format!("out of memory allocating {} bytes", size),
            })?;

        let have = self.buffer.pages() * PAGE_SIZE;
        if end as usize > have {
            let missing = end as usize - have;
            self.buffer.grow(missing.div_ceil(PAGE_SIZE));
        }
        self.heap_top.set(end);
        Ok(address)
    }

    fn read_path(&self, path_len: u32) -> RuntimeResult<String> {
        if path_len as usize > PATH_BUF_CAPACITY {
            return Err(RuntimeError::PathTooLong {
                len: path_len as usize,
                max: PATH_BUF_CAPACITY,
            });
        }
        let path = self.memory.read_string(PATH_BUF, Some(path_len as usize))?;
        Ok(normalize_path(&path))
    }

    fn key_of(inode: u32) -> Option<usize> {
        (inode as usize).checked_sub(1)
    }

    fn node(&self, inode: u32) -> RuntimeResult<Node> {
        Self::key_of(inode)
            .and_then(|key| self.nodes.borrow().get(key).copied())
            .ok_or_else(|| RuntimeError::NotFound {
                path: format!("inode {}", inode),
            })
    }

    fn file_node(&self, inode: u32) -> RuntimeResult<Node> {
        let node = self.node(inode)?;
        if node.kind != NodeKind::File {
            return Err(RuntimeError::NotFound {
                path: format!("inode {} is a directory", inode),
            });
        }
        Ok(node)
    }

    fn insert(&self, path: String, node: Node) -> u32 {
        let key = self.nodes.borrow_mut().insert(node);
        self.index.borrow_mut().insert(path, key);
        key as u32 + 1
    }

    /// Make room for `needed` bytes in a file, moving it if necessary
    fn reserve(&self, key: usize, needed: u32) -> RuntimeResult<Node> {
        let node = self.nodes.borrow()[key];
        if needed <= node.capacity {
            return Ok(node);
        }

        let capacity = needed.max(node.capacity.saturating_mul(2)).max(64);
        let address = self.alloc(capacity)?;
        let existing = self.memory.read_bytes(node.address, node.size as usize)?;
        self.memory.write_bytes(address, existing)?;

        let moved = Node {
            address,
            capacity,
            ..node
        };
        self.nodes.borrow_mut()[key] = moved;
        Ok(moved)
    }

    /// Bring a guest's iovec array into the scratch area and decode it
    fn guest_iovecs(&self, iovs: u32, iovs_len: u32) -> RuntimeResult<Option<Vec<RawIovec>>> {
        let Some(size) = (iovs_len as usize)
            .checked_mul(RawIovec::SIZE)
            .filter(|&size| size <= SCRATCH_CAPACITY)
        else {
            return Ok(None);
        };
        self.bridge.copy_in(SCRATCH, iovs, size as u32)?;
        let bytes = self.memory.read_bytes(SCRATCH, size)?;
        Ok(Some(RawIovec::decode_all(&bytes)))
    }

    /// Store a u32 out-parameter at a guest address
    fn store_guest_u32(&self, guest_ptr: u32, value: u32) -> RuntimeResult<()> {
        self.memory.write32(SCRATCH, value)?;
        self.bridge.copy_out(guest_ptr, SCRATCH, 4)
    }

    /// Open-file slot of a descriptor; stdio and negatives have none
    fn slot_of(fd_num: i32) -> Option<usize> {
        fd_num
            .checked_sub(FIRST_FILE_FD)
            .and_then(|slot| usize::try_from(slot).ok())
    }

    fn open_file(&self, fd_num: i32) -> Option<(usize, u32)> {
        let slot = Self::slot_of(fd_num)?;
        self.open_files
            .borrow()
            .get(slot)
            .map(|file| (file.node, file.position))
    }

    fn set_position(&self, fd_num: i32, position: u32) {
        let Some(slot) = Self::slot_of(fd_num) else {
            return;
        };
        if let Some(file) = self.open_files.borrow_mut().get_mut(slot) {
            file.position = position;
        }
    }

    /// Guest `path_open`: path in guest memory, descriptor stored at `fd_out`
    pub fn path_open(&self, path_ptr: u32, path_len: u32, flags: u16, fd_out: u32) -> RuntimeResult<i32> {
        if path_len as usize > PATH_BUF_CAPACITY {
            return Ok(errno::INVAL);
        }
        self.bridge.copy_in(PATH_BUF, path_ptr, path_len)?;
        let path = self.read_path(path_len)?;

        let existing = self.index.borrow().get(&path).copied();
        let key = match existing {
            Some(key) => {
                let mut nodes = self.nodes.borrow_mut();
                let node = &mut nodes[key];
                if node.kind == NodeKind::Directory {
                    return Ok(errno::INVAL);
                }
                if flags & oflags::TRUNC != 0 {
                    node.size = 0;
                }
                key
            }
            None if flags & oflags::CREAT != 0 => {
                let inode = self.insert(
                    path,
                    Node {
                        kind: NodeKind::File,
                        address: HEAP_BASE,
                        size: 0,
                        capacity: 0,
                    },
                );
                inode as usize - 1
            }
            None => return Ok(errno::NOENT),
        };

        let slot = self
            .open_files
            .borrow_mut()
            .insert(OpenFile { node: key, position: 0 });
        self.store_guest_u32(fd_out, slot as u32 + FIRST_FILE_FD as u32)?;
        Ok(errno::SUCCESS)
    }

    /// Guest `fd_close`
    pub fn fd_close(&self, fd_num: i32) -> i32 {
        match Self::slot_of(fd_num) {
            Some(slot) if self.open_files.borrow().contains(slot) => {
                self.open_files.borrow_mut().remove(slot);
                errno::SUCCESS
            }
            _ => errno::BADF,
        }
    }
}

impl FsEngine for HeapFsEngine {
    fn memory(&self) -> MemoryView {
        self.memory.clone()
    }

    fn path_buf(&self) -> RuntimeResult<u32> {
        Ok(PATH_BUF)
    }

    fn add_directory_node(&self, path_len: u32) -> RuntimeResult<u32> {
        let path = self.read_path(path_len)?;
        let existing = self.index.borrow().get(&path).copied();
        if let Some(key) = existing {
            let kind = self.nodes.borrow()[key].kind;
            if kind == NodeKind::File {
                return Err(RuntimeError::PathConflict {
                    path,
                    existing: kind,
                });
            }
            return Ok(key as u32 + 1);
        }

        Ok(self.insert(
            path,
            Node {
                kind: NodeKind::Directory,
                address: 0,
                size: 0,
                capacity: 0,
            },
        ))
    }

    fn add_file_node(&self, path_len: u32, size: u32) -> RuntimeResult<u32> {
        let path = self.read_path(path_len)?;
        let existing = self.index.borrow().get(&path).copied();
        match existing {
            Some(key) => {
                let old = self.nodes.borrow()[key];
                if old.kind == NodeKind::Directory {
                    return Err(RuntimeError::PathConflict {
                        path,
                        existing: old.kind,
                    });
                }
                // replacement contents that fit stay in the old slot
                let node = if size <= old.capacity {
                    Node { size, ..old }
                } else {
                    Node {
                        kind: NodeKind::File,
                        address: self.alloc(size)?,
                        size,
                        capacity: size,
                    }
                };
                self.nodes.borrow_mut()[key] = node;
                Ok(key as u32 + 1)
            }
            None => {
                let node = Node {
                    kind: NodeKind::File,
                    address: self.alloc(size)?,
                    size,
                    capacity: size,
                };
                Ok(self.insert(path, node))
            }
        }
    }

    fn find_node(&self, path_len: u32) -> RuntimeResult<Option<u32>> {
        let path = self.read_path(path_len)?;
        Ok(self.index.borrow().get(&path).map(|&key| key as u32 + 1))
    }

    fn file_node_address(&self, inode: u32) -> RuntimeResult<u32> {
        Ok(self.file_node(inode)?.address)
    }

    fn file_node_size(&self, inode: u32) -> RuntimeResult<u32> {
        Ok(self.file_node(inode)?.size)
    }

    fn fd_write(&self, fd_num: i32, iovs: u32, iovs_len: u32, nwritten: u32) -> RuntimeResult<i32> {
        if fd::is_stdio(fd_num) {
            self.bridge.host_write(fd_num, iovs, iovs_len, nwritten)?;
            return Ok(errno::SUCCESS);
        }

        let Some((key, mut position)) = self.open_file(fd_num) else {
            return Ok(errno::BADF);
        };
        let Some(iovecs) = self.guest_iovecs(iovs, iovs_len)? else {
            return Ok(errno::INVAL);
        };

        // the whole write must stay addressable before any byte moves
        let mut end = position;
        for iov in &iovecs {
            match end.checked_add(iov.len) {
                Some(next) => end = next,
                None => return Ok(errno::INVAL),
            }
        }

        let mut total = 0u32;
        for iov in iovecs {
            let end = position + iov.len;
            let node = self.reserve(key, end)?;
            self.bridge.copy_in(node.address + position, iov.buf, iov.len)?;
            let mut nodes = self.nodes.borrow_mut();
            let stored = &mut nodes[key];
            stored.size = stored.size.max(end);
            position = end;
            total += iov.len;
        }

        self.set_position(fd_num, position);
        self.store_guest_u32(nwritten, total)?;
        Ok(errno::SUCCESS)
    }

    fn fd_read(&self, fd_num: i32, iovs: u32, iovs_len: u32, nread: u32) -> RuntimeResult<i32> {
        if fd_num == fd::STDIN {
            self.bridge.host_read(fd_num, iovs, iovs_len, nread)?;
            return Ok(errno::SUCCESS);
        }

        let Some((key, mut position)) = self.open_file(fd_num) else {
            return Ok(errno::BADF);
        };
        let Some(iovecs) = self.guest_iovecs(iovs, iovs_len)? else {
            return Ok(errno::INVAL);
        };

        let node = self.nodes.borrow()[key];
        let mut total = 0u32;
        for iov in iovecs {
            let n = iov.len.min(node.size.saturating_sub(position));
            if n == 0 {
                break;
            }
            self.bridge.copy_out(iov.buf, node.address + position, n)?;
            position += n;
            total += n;
        }

        self.set_position(fd_num, position);
        self.store_guest_u32(nread, total)?;
        Ok(errno::SUCCESS)
    }
}
