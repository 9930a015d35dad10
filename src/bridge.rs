//! Filesystem-engine bridge
//!
//! The filesystem engine and the currently executing guest each own a
//! linear memory. They are disjoint address spaces: a pointer from one means
//! nothing in the other. Every transfer between them goes through
//! `copy_in`/`copy_out` here, and stdio leaves the worker through
//! `host_write`/`host_read`.

use crate::channel::{HostChannel, Outbound};
use crate::console_log;
use crate::error::{RuntimeError, RuntimeResult};
use crate::guest::abi::{RawIovec, fd};
use crate::mailbox::StdinSource;
use crate::memory::MemoryView;
use std::cell::RefCell;
use std::collections::VecDeque;
use std::rc::Rc;

/// Rewrites an internal file token to the name the user knows
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DiagnosticRewriter {
    token: String,
    replacement: String,
}

impl DiagnosticRewriter {
    pub fn new(token: impl Into<String>, replacement: impl Into<String>) -> Self {
        Self {
            token: token.into(),
            replacement: replacement.into(),
        }
    }

    pub fn apply(&self, text: &str) -> String {
        if self.token.is_empty() || self.token == self.replacement {
            return text.to_string();
        }
        text.replace(&self.token, &self.replacement)
    }
}

/// Host side of the filesystem engine's imports
pub struct Bridge {
    channel: Rc<dyn HostChannel>,
    fs_memory: RefCell<Option<MemoryView>>,
    guest_memory: RefCell<Option<MemoryView>>,
    stdin: RefCell<Option<Box<dyn StdinSource>>>,
    /// Delivered bytes that did not fit the last read
    pending_input: RefCell<VecDeque<u8>>,
    rewriter: RefCell<Option<DiagnosticRewriter>>,
    /// Host-side failure raised while the guest was running
    fault: RefCell<Option<RuntimeError>>,
}

impl Bridge {
    pub fn new(channel: Rc<dyn HostChannel>) -> Self {
        Self {
            channel,
            fs_memory: RefCell::new(None),
            guest_memory: RefCell::new(None),
            stdin: RefCell::new(None),
            pending_input: RefCell::new(VecDeque::new()),
            rewriter: RefCell::new(None),
            fault: RefCell::new(None),
        }
    }

    /// Attach the mailbox `host_read` blocks on
    pub fn set_stdin(&self, source: Box<dyn StdinSource>) {
        *self.stdin.borrow_mut() = Some(source);
    }

    pub fn attach_fs_memory(&self, memory: MemoryView) {
        *self.fs_memory.borrow_mut() = Some(memory);
    }

    /// Bind the memory of the guest that is about to run
    pub fn attach_guest(&self, memory: MemoryView) {
        *self.guest_memory.borrow_mut() = Some(memory);
    }

    /// Unbind the guest memory once its instance is torn down
    pub fn detach_guest(&self) {
        self.guest_memory.borrow_mut().take();
    }

    pub fn set_rewriter(&self, rewriter: Option<DiagnosticRewriter>) {
        *self.rewriter.borrow_mut() = rewriter;
    }

    /// Send text straight to the terminal
    pub fn emit(&self, text: &str) {
        if !text.is_empty() {
            self.channel.post(Outbound::write(text));
        }
    }

    /// Remember a host-side failure and return its message
    pub fn record_fault(&self, err: RuntimeError) -> String {
        let message = err.to_string();
        *self.fault.borrow_mut() = Some(err);
        message
    }

    pub fn take_fault(&self) -> Option<RuntimeError> {
        self.fault.borrow_mut().take()
    }

    fn guest(&self) -> RuntimeResult<MemoryView> {
        self.guest_memory
            .borrow()
            .clone()
            .ok_or_else(|| RuntimeError::InstantiationFailed {
                reason: "no guest memory attached".to_string(),
            })
    }

    fn fs(&self) -> RuntimeResult<MemoryView> {
        self.fs_memory
            .borrow()
            .clone()
            .ok_or_else(|| RuntimeError::InstantiationFailed {
                reason: "filesystem engine memory not attached".to_string(),
            })
    }

    fn iovecs(memory: &MemoryView, iovs: u32, iovs_len: u32) -> RuntimeResult<Vec<RawIovec>> {
        let bytes = memory.read_bytes(iovs, iovs_len as usize * RawIovec::SIZE)?;
        Ok(RawIovec::decode_all(&bytes))
    }

    /// `host_write(fd, iovs, iovs_len, nwritten_out)`
    ///
    /// Gathers every iovec into one payload and posts it as a single
    /// `write` event.
    pub fn host_write(&self, fd_num: i32, iovs: u32, iovs_len: u32, nwritten: u32) -> RuntimeResult<u32> {
        if !fd::is_stdio(fd_num) {
            return Err(RuntimeError::BadDescriptor {
                syscall: "host_write",
                fd: fd_num,
            });
        }

        let memory = self.guest()?;
        let mut payload = Vec::new();
        for iov in Self::iovecs(&memory, iovs, iovs_len)? {
            payload.extend(memory.read_bytes(iov.buf, iov.len as usize)?);
        }

        let text = String::from_utf8_lossy(&payload);
        let text = match self.rewriter.borrow().as_ref() {
            Some(rewriter) => rewriter.apply(&text),
            None => text.into_owned(),
        };
        self.emit(&text);

        let total = payload.len() as u32;
        memory.write32(nwritten, total)?;
        Ok(total)
    }

    /// `host_read(fd, iovs, iovs_len, nread_out)`
    ///
    /// Blocks on the mailbox when no input is buffered. Short reads are
    /// normal; bytes beyond the supplied capacity wait for the next read.
    pub fn host_read(&self, fd_num: i32, iovs: u32, iovs_len: u32, nread: u32) -> RuntimeResult<u32> {
        if fd_num != fd::STDIN {
            return Err(RuntimeError::BadDescriptor {
                syscall: "host_read",
                fd: fd_num,
            });
        }

        let memory = self.guest()?;
        let iovecs = Self::iovecs(&memory, iovs, iovs_len)?;

        if self.pending_input.borrow().is_empty() {
            if let Some(source) = self.stdin.borrow_mut().as_mut() {
                self.channel.post(Outbound::ReadStdinRequest);
                let bytes = source.receive()?;
                self.pending_input.borrow_mut().extend(bytes);
            }
        }

        let mut pending = self.pending_input.borrow_mut();
        let mut total = 0u32;
        for iov in iovecs {
            if pending.is_empty() {
                break;
            }
            let take = pending.len().min(iov.len as usize);
            let chunk: Vec<u8> = pending.drain(..take).collect();
            memory.write_bytes(iov.buf, &chunk)?;
            total += take as u32;
        }

        memory.write32(nread, total)?;
        Ok(total)
    }

    /// `memfs_log(buf, len)`: diagnostics from the engine itself
    pub fn log(&self, buf: u32, len: u32) -> RuntimeResult<()> {
        let text = self.fs()?.read_string(buf, Some(len as usize))?;
        console_log!("[memfs] {}", text.trim_end());
        Ok(())
    }

    /// Copy `size` bytes from engine address `src` to guest address `dst`
    pub fn copy_out(&self, dst: u32, src: u32, size: u32) -> RuntimeResult<()> {
        let bytes = self.fs()?.read_bytes(src, size as usize)?;
        self.guest()?.write_bytes(dst, bytes)?;
        Ok(())
    }

    /// Copy `size` bytes from guest address `src` to engine address `dst`
    pub fn copy_in(&self, dst: u32, src: u32, size: u32) -> RuntimeResult<()> {
        let bytes = self.guest()?.read_bytes(src, size as usize)?;
        self.fs()?.write_bytes(dst, bytes)?;
        Ok(())
    }

    /// The engine hit an unrecoverable state
    pub fn abort(&self) -> RuntimeError {
        RuntimeError::Aborted {
            reason: "abort() called".to_string(),
        }
    }
}
