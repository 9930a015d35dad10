//! Process surface given to every guest
//!
//! argv, one environment pair, pseudo-random bytes and `proc_exit`. Clock
//! and poll are deliberately missing: calling them fails loudly instead of
//! handing the guest zeroed data that looks plausible.

use super::abi::{StringTable, errno, namespaces, syscalls};
use crate::error::{RuntimeError, RuntimeResult};
use crate::memory::MemoryView;
use crate::vfs::FsEngine;
use std::cell::{Cell, RefCell};
use std::rc::Rc;

/// Syscall implementations for one guest instance
pub struct SyscallShim {
    args: StringTable,
    environ: StringTable,
    /// xorshift64* state
    rng: Cell<u64>,
    exit_code: Cell<Option<i32>>,
    /// Host-side failure raised inside a syscall
    fault: RefCell<Option<RuntimeError>>,
    memory: RefCell<Option<MemoryView>>,
    fs: Rc<dyn FsEngine>,
}

impl SyscallShim {
    /// `argv` includes the program name; `environ` is one `KEY=value` pair
    pub fn new(argv: Vec<String>, environ: String, fs: Rc<dyn FsEngine>, seed: u64) -> Self {
        Self {
            args: StringTable::new(argv),
            environ: StringTable::new(vec![environ]),
            // xorshift state must never be zero
            rng: Cell::new(seed | 1),
            exit_code: Cell::new(None),
            fault: RefCell::new(None),
            memory: RefCell::new(None),
            fs,
        }
    }

    pub fn attach_memory(&self, memory: MemoryView) {
        *self.memory.borrow_mut() = Some(memory);
    }

    fn memory(&self) -> RuntimeResult<MemoryView> {
        self.memory
            .borrow()
            .clone()
            .ok_or_else(|| RuntimeError::InstantiationFailed {
                reason: "guest memory not attached".to_string(),
            })
    }

    /// Code passed to `proc_exit`, if the guest called it
    pub fn exit_code(&self) -> Option<i32> {
        self.exit_code.get()
    }

    /// Forget a previous exit before invoking the guest again
    pub fn clear_exit(&self) {
        self.exit_code.set(None);
    }

    pub fn record_fault(&self, err: RuntimeError) -> String {
        let message = err.to_string();
        *self.fault.borrow_mut() = Some(err);
        message
    }

    pub fn take_fault(&self) -> Option<RuntimeError> {
        self.fault.borrow_mut().take()
    }

    /// `proc_exit(code)`: records the code; the engine unwinds the guest
    pub fn proc_exit(&self, code: i32) {
        self.exit_code.set(Some(code));
    }

    fn sizes_get(&self, table: &StringTable, count_ptr: u32, size_ptr: u32) -> RuntimeResult<i32> {
        let memory = self.memory()?;
        memory.write32(count_ptr, table.count() as u32)?;
        memory.write32(size_ptr, table.buf_size() as u32)?;
        Ok(errno::SUCCESS)
    }

    fn table_get(&self, table: &StringTable, ptrs: u32, buf: u32) -> RuntimeResult<i32> {
        let memory = self.memory()?;
        let (pointers, strings) = table.encode(buf);
        memory.write_bytes(ptrs, pointers)?;
        memory.write_bytes(buf, strings)?;
        Ok(errno::SUCCESS)
    }

    pub fn args_sizes_get(&self, argc_ptr: u32, size_ptr: u32) -> RuntimeResult<i32> {
        self.sizes_get(&self.args, argc_ptr, size_ptr)
    }

    pub fn args_get(&self, argv_ptr: u32, buf_ptr: u32) -> RuntimeResult<i32> {
        self.table_get(&self.args, argv_ptr, buf_ptr)
    }

    pub fn environ_sizes_get(&self, count_ptr: u32, size_ptr: u32) -> RuntimeResult<i32> {
        self.sizes_get(&self.environ, count_ptr, size_ptr)
    }

    pub fn environ_get(&self, environ_ptr: u32, buf_ptr: u32) -> RuntimeResult<i32> {
        self.table_get(&self.environ, environ_ptr, buf_ptr)
    }

    /// Non-cryptographic pseudo-random bytes; never use for security
    pub fn random_get(&self, buf: u32, len: u32) -> RuntimeResult<i32> {
        let mut bytes = Vec::with_capacity(len as usize);
        while bytes.len() < len as usize {
            let mut x = self.rng.get();
            x ^= x >> 12;
            x ^= x << 25;
            x ^= x >> 27;
            self.rng.set(x);
            let word = x.wrapping_mul(0x2545_F491_4F6C_DD1D);
            let take = (len as usize - bytes.len()).min(8);
            bytes.extend_from_slice(&word.to_le_bytes()[..take]);
        }
        self.memory()?.write_bytes(buf, bytes)?;
        Ok(errno::SUCCESS)
    }

    pub fn clock_time_get(&self, _clock_id: u32, _precision: u64, _time_ptr: u32) -> RuntimeResult<i32> {
        Err(RuntimeError::UnsupportedSyscall {
            module: namespaces::WASI,
            name: syscalls::CLOCK_TIME_GET,
        })
    }

    pub fn poll_oneoff(&self, _in_ptr: u32, _out_ptr: u32, _nsubs: u32, _nevents_ptr: u32) -> RuntimeResult<i32> {
        Err(RuntimeError::UnsupportedSyscall {
            module: namespaces::WASI,
            name: syscalls::POLL_ONEOFF,
        })
    }

    /// `fd_write`, served by the filesystem engine
    pub fn fd_write(&self, fd: i32, iovs: u32, iovs_len: u32, nwritten: u32) -> RuntimeResult<i32> {
        self.fs.fd_write(fd, iovs, iovs_len, nwritten)
    }

    /// `fd_read`, served by the filesystem engine
    pub fn fd_read(&self, fd: i32, iovs: u32, iovs_len: u32, nread: u32) -> RuntimeResult<i32> {
        self.fs.fd_read(fd, iovs, iovs_len, nread)
    }
}
