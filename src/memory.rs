//! Guest linear memory access
//!
//! A guest's memory can grow whenever control passes into guest code, and on
//! the web growing detaches every typed-array view derived from the old
//! buffer. `MemoryView` therefore never trusts a cached view: each accessor
//! revalidates against the backing store first and rebinds when it changed.

use crate::error::{RuntimeError, RuntimeResult};
use std::cell::{Cell, RefCell};
use std::rc::Rc;

/// WASM page size in bytes (64KB)
pub const PAGE_SIZE: usize = 65536;

/// A growable byte store owned by one guest instance
///
/// Implementations hold whatever derived views their platform needs and
/// re-derive them in `rebind`.
pub trait LinearMemory {
    /// Size of the backing store right now, in bytes
    fn byte_len(&self) -> usize;

    /// Whether cached views no longer track the backing store even though
    /// its size is unchanged (a same-size buffer replacement)
    fn is_detached(&self) -> bool {
        false
    }

    /// Re-derive cached views over the current backing store
    fn rebind(&self);

    /// Copy `buf.len()` bytes starting at `offset` (already bounds-checked)
    fn read_into(&self, offset: usize, buf: &mut [u8]);

    /// Copy `data` to `offset` (already bounds-checked)
    fn write_from(&self, offset: usize, data: &[u8]);
}

/// Native backing store: a shared, page-granular byte vector
#[derive(Clone, Default)]
pub struct LinearBuffer {
    data: Rc<RefCell<Vec<u8>>>,
}

impl LinearBuffer {
    /// Create memory with the given number of pages
    pub fn new(pages: usize) -> Self {
        Self {
            data: Rc::new(RefCell::new(vec![0; pages * PAGE_SIZE])),
        }
    }

    /// Current size in pages
    pub fn pages(&self) -> usize {
        self.data.borrow().len() / PAGE_SIZE
    }

    /// Grow by `delta` pages, returning the previous page count
    pub fn grow(&self, delta: usize) -> usize {
        let mut data = self.data.borrow_mut();
        let previous = data.len() / PAGE_SIZE;
        let new_len = data.len() + delta * PAGE_SIZE;
        data.resize(new_len, 0);
        previous
    }
}

impl LinearMemory for LinearBuffer {
    fn byte_len(&self) -> usize {
        self.data.borrow().len()
    }

    fn rebind(&self) {}

    fn read_into(&self, offset: usize, buf: &mut [u8]) {
        let data = self.data.borrow();
        buf.copy_from_slice(&data[offset..offset + buf.len()]);
    }

    fn write_from(&self, offset: usize, data: &[u8]) {
        self.data.borrow_mut()[offset..offset + data.len()].copy_from_slice(data);
    }
}

/// Validated accessor over one guest's linear memory
///
/// Cheap to clone; clones share the backing store.
#[derive(Clone)]
pub struct MemoryView {
    memory: Rc<dyn LinearMemory>,
    /// Size the current derived views were bound at
    bound_len: Rc<Cell<usize>>,
}

impl MemoryView {
    pub fn new(memory: Rc<dyn LinearMemory>) -> Self {
        let bound_len = memory.byte_len();
        Self {
            memory,
            bound_len: Rc::new(Cell::new(bound_len)),
        }
    }

    /// View over a native buffer
    pub fn from_buffer(buffer: LinearBuffer) -> Self {
        Self::new(Rc::new(buffer))
    }

    /// Rebind derived views if the backing store changed size or was
    /// replaced
    ///
    /// Returns whether a rebind happened. Every accessor calls this first.
    pub fn revalidate(&self) -> bool {
        let current = self.memory.byte_len();
        if current == self.bound_len.get() && !self.memory.is_detached() {
            return false;
        }
        self.memory.rebind();
        self.bound_len.set(current);
        true
    }

    /// Memory size in bytes
    pub fn size(&self) -> usize {
        self.revalidate();
        self.bound_len.get()
    }

    fn check(&self, offset: u32, len: usize) -> RuntimeResult<usize> {
        self.revalidate();
        let start = offset as usize;
        let memory_size = self.bound_len.get();
        match start.checked_add(len) {
            Some(end) if end <= memory_size => Ok(start),
            _ => Err(RuntimeError::MemoryAccessOutOfBounds {
                address: offset as u64,
                size: len as u64,
                memory_size: memory_size as u64,
            }),
        }
    }

    pub fn read8(&self, offset: u32) -> RuntimeResult<u8> {
        let mut buf = [0u8; 1];
        self.read_into(offset, &mut buf)?;
        Ok(buf[0])
    }

    pub fn read32(&self, offset: u32) -> RuntimeResult<u32> {
        let mut buf = [0u8; 4];
        self.read_into(offset, &mut buf)?;
        Ok(u32::from_le_bytes(buf))
    }

    pub fn write8(&self, offset: u32, value: u8) -> RuntimeResult<()> {
        self.write_bytes(offset, [value]).map(|_| ())
    }

    pub fn write32(&self, offset: u32, value: u32) -> RuntimeResult<()> {
        self.write_bytes(offset, value.to_le_bytes()).map(|_| ())
    }

    pub fn write64(&self, offset: u32, value: u64) -> RuntimeResult<()> {
        self.write_bytes(offset, value.to_le_bytes()).map(|_| ())
    }

    /// Fill `buf` from memory starting at `offset`
    pub fn read_into(&self, offset: u32, buf: &mut [u8]) -> RuntimeResult<()> {
        let start = self.check(offset, buf.len())?;
        self.memory.read_into(start, buf);
        Ok(())
    }

    pub fn read_bytes(&self, offset: u32, len: usize) -> RuntimeResult<Vec<u8>> {
        let mut buf = vec![0u8; len];
        self.read_into(offset, &mut buf)?;
        Ok(buf)
    }

    /// Write anything viewable as bytes, returning the count written
    pub fn write_bytes(&self, offset: u32, data: impl AsRef<[u8]>) -> RuntimeResult<usize> {
        let data = data.as_ref();
        let start = self.check(offset, data.len())?;
        self.memory.write_from(start, data);
        Ok(data.len())
    }

    /// Write `text` followed by a NUL terminator, returning `len + 1`
    pub fn write_string(&self, offset: u32, text: &str) -> RuntimeResult<usize> {
        let start = self.check(offset, text.len() + 1)?;
        self.memory.write_from(start, text.as_bytes());
        self.memory.write_from(start + text.len(), &[0]);
        Ok(text.len() + 1)
    }

    /// Decode text at `offset`, stopping at a NUL or after `length` bytes
    ///
    /// Without a length the scan runs to the first NUL or the end of memory.
    pub fn read_string(&self, offset: u32, length: Option<usize>) -> RuntimeResult<String> {
        let len = match length {
            Some(len) => len,
            None => {
                let size = self.size();
                if offset as usize > size {
                    return Err(RuntimeError::MemoryAccessOutOfBounds {
                        address: offset as u64,
                        size: 1,
                        memory_size: size as u64,
                    });
                }
                size - offset as usize
            }
        };

        let bytes = self.read_bytes(offset, len)?;
        let end = bytes.iter().position(|&b| b == 0).unwrap_or(bytes.len());
        Ok(String::from_utf8_lossy(&bytes[..end]).into_owned())
    }
}

impl std::fmt::Debug for MemoryView {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MemoryView")
            .field("bound_len", &self.bound_len.get())
            .finish()
    }
}
