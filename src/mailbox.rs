//! Single-slot stdin mailbox
//!
//! The worker blocks here while a guest waits for input; the controlling
//! thread fills the payload region and signals. One payload is in flight at a
//! time: the sender refuses a second delivery until the receiver has drained
//! and cleared the first, and the receiver is a unique handle whose every
//! receive takes it mutably, so two read requests can never overlap.

use crate::error::{RuntimeError, RuntimeResult};
use std::sync::{Arc, Condvar, Mutex, MutexGuard};
use std::time::Duration;

/// Source of stdin payloads for the bridged `read` syscall
pub trait StdinSource {
    /// Block until a payload is delivered, then drain it
    fn receive(&mut self) -> RuntimeResult<Vec<u8>>;
}

/// Control word plus payload region
struct Slot {
    /// Set by the producer after the payload is written
    signalled: bool,
    len: usize,
    payload: Box<[u8]>,
}

struct Shared {
    slot: Mutex<Slot>,
    ready: Condvar,
}

impl Shared {
    fn lock(&self) -> RuntimeResult<MutexGuard<'_, Slot>> {
        self.slot.lock().map_err(|_| RuntimeError::Mailbox {
            reason: "mailbox lock poisoned".to_string(),
        })
    }
}

/// Create a mailbox with a payload region of `capacity` bytes
pub fn stdin_mailbox(capacity: usize) -> (StdinSender, StdinReceiver) {
    let shared = Arc::new(Shared {
        slot: Mutex::new(Slot {
            signalled: false,
            len: 0,
            payload: vec![0u8; capacity].into_boxed_slice(),
        }),
        ready: Condvar::new(),
    });
    (
        StdinSender {
            shared: Arc::clone(&shared),
        },
        StdinReceiver { shared },
    )
}

/// Producer half, held by the controlling thread
#[derive(Clone)]
pub struct StdinSender {
    shared: Arc<Shared>,
}

impl StdinSender {
    /// Write a payload and signal the waiting reader
    pub fn deliver(&self, bytes: &[u8]) -> RuntimeResult<()> {
        let mut slot = self.shared.lock()?;
        if slot.signalled {
            return Err(RuntimeError::Mailbox {
                reason: "previous input has not been consumed".to_string(),
            });
        }
        if bytes.len() > slot.payload.len() {
            return Err(RuntimeError::Mailbox {
                reason: format!(
                    "input of {} bytes exceeds the {} byte mailbox",
                    bytes.len(),
                    slot.payload.len()
                ),
            });
        }

        slot.payload[..bytes.len()].copy_from_slice(bytes);
        slot.len = bytes.len();
        slot.signalled = true;
        self.shared.ready.notify_one();
        Ok(())
    }

    /// Whether a delivered payload is still waiting to be drained
    pub fn is_pending(&self) -> bool {
        self.shared.lock().map(|slot| slot.signalled).unwrap_or(false)
    }
}

/// Consumer half, owned by the worker
pub struct StdinReceiver {
    shared: Arc<Shared>,
}

impl StdinReceiver {
    /// Like `receive`, but give up after `timeout`
    pub fn receive_timeout(&mut self, timeout: Duration) -> RuntimeResult<Option<Vec<u8>>> {
        let slot = self.shared.lock()?;
        let (mut slot, _) = self
            .shared
            .ready
            .wait_timeout_while(slot, timeout, |slot| !slot.signalled)
            .map_err(|_| RuntimeError::Mailbox {
                reason: "mailbox lock poisoned".to_string(),
            })?;

        if !slot.signalled {
            return Ok(None);
        }
        Ok(Some(drain(&mut slot)))
    }
}

impl StdinSource for StdinReceiver {
    fn receive(&mut self) -> RuntimeResult<Vec<u8>> {
        let slot = self.shared.lock()?;
        let mut slot = self
            .shared
            .ready
            .wait_while(slot, |slot| !slot.signalled)
            .map_err(|_| RuntimeError::Mailbox {
                reason: "mailbox lock poisoned".to_string(),
            })?;
        Ok(drain(&mut slot))
    }
}

/// Copy out the payload, then zero it and reset the control word
fn drain(slot: &mut Slot) -> Vec<u8> {
    let len = slot.len;
    let bytes = slot.payload[..len].to_vec();
    slot.payload[..len].fill(0);
    slot.len = 0;
    slot.signalled = false;
    bytes
}
