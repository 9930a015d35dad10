//! Guest execution
//!
//! An `Engine` compiles and instantiates modules; `GuestRuntime` binds one
//! instance to a `SyscallShim` and the filesystem bridge, runs it on the
//! caller's stack and classifies how it ended.
//!
//! State transitions:
//! ```text
//! Instantiated -> Running -> Finished(NormalExit | Trap | ProcessExit)
//! ```
//!
//! `proc_exit` is how a guest program normally ends, so it is a terminal
//! variant here, never an error. Engines unwind the guest however their
//! platform requires; the recorded exit code decides the outcome.

use super::abi::{CONTINUE_SCHEDULING_EXIT_CODE, exports};
use super::shim::SyscallShim;
use crate::bridge::Bridge;
use crate::error::{RuntimeError, RuntimeResult};
use crate::memory::MemoryView;
use crate::vfs::FsEngine;
use std::future::Future;
use std::rc::Rc;

const HIGHLIGHT: &str = "\x1b[91m";
const RESET: &str = "\x1b[0m";

/// A fault raised while guest code was running
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Trap {
    pub message: String,
    /// Call-stack excerpt, when the engine provides one
    pub stack: Option<String>,
}

impl Trap {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            stack: None,
        }
    }
}

/// How a guest run ended
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Termination {
    /// Entry point returned
    NormalExit(i32),
    Trap(Trap),
    /// Guest called `proc_exit`
    ProcessExit(i32),
}

impl Termination {
    /// Only the continue-scheduling sentinel permits further calls
    pub fn allows_scheduling(&self) -> bool {
        matches!(self, Termination::ProcessExit(CONTINUE_SCHEDULING_EXIT_CODE))
    }

    /// Exit code, if the guest exited rather than trapped
    pub fn exit_code(&self) -> Option<i32> {
        match self {
            Termination::NormalExit(code) | Termination::ProcessExit(code) => Some(*code),
            Termination::Trap(_) => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum InstanceState {
    Instantiated,
    Running,
    Finished(Termination),
}

/// One instantiated module as the engine sees it
pub trait EngineInstance {
    /// The exported linear memory
    fn memory(&self) -> RuntimeResult<MemoryView>;

    /// Call an exported function taking no arguments
    fn call(&self, export: &str) -> Result<(), Trap>;
}

/// Compiles and instantiates modules on one platform
pub trait Engine {
    /// Compiled module handle; cloning shares the compiled code
    type Module: Clone;
    type Instance: EngineInstance;
    type Fs: FsEngine + 'static;

    /// Fetch a named resource (archive, module binary)
    fn fetch(&self, name: &str) -> impl Future<Output = RuntimeResult<Vec<u8>>>;

    /// Fetch and compile a module by logical name
    fn compile_named(&self, name: &str) -> impl Future<Output = RuntimeResult<Self::Module>>;

    /// Compile a module from bytes
    fn compile_bytes(&self, bytes: &[u8]) -> impl Future<Output = RuntimeResult<Self::Module>>;

    /// Instantiate the filesystem engine module, wiring its imports to `bridge`
    fn instantiate_fs(
        &self,
        name: &str,
        bridge: Rc<Bridge>,
    ) -> impl Future<Output = RuntimeResult<Rc<Self::Fs>>>;

    /// Instantiate a guest against the shim's syscalls
    fn instantiate(&self, module: &Self::Module, shim: Rc<SyscallShim>) -> RuntimeResult<Self::Instance>;
}

/// A guest bound to its argv, environment and memory
pub struct GuestInstance<I> {
    handle: I,
    shim: Rc<SyscallShim>,
    bridge: Rc<Bridge>,
    memory: MemoryView,
    state: InstanceState,
}

impl<I: EngineInstance> GuestInstance<I> {
    pub fn state(&self) -> &InstanceState {
        &self.state
    }

    pub fn memory(&self) -> &MemoryView {
        &self.memory
    }

    pub fn allows_scheduling(&self) -> bool {
        matches!(&self.state, InstanceState::Finished(t) if t.allows_scheduling())
    }

    /// Run the `_start` entry point
    pub fn run(&mut self) -> RuntimeResult<Termination> {
        if self.state != InstanceState::Instantiated {
            return Err(RuntimeError::InstantiationFailed {
                reason: "instance already started".to_string(),
            });
        }
        Ok(self.enter(exports::START))
    }

    /// Call another export after `_start` exited with the sentinel code
    pub fn invoke(&mut self, export: &str) -> RuntimeResult<Termination> {
        if !self.allows_scheduling() {
            return Err(RuntimeError::InstantiationFailed {
                reason: format!("guest may not be scheduled again to call {}", export),
            });
        }
        self.shim.clear_exit();
        Ok(self.enter(export))
    }

    fn enter(&mut self, export: &str) -> Termination {
        self.state = InstanceState::Running;
        self.bridge.attach_guest(self.memory.clone());
        let outcome = self.handle.call(export);
        self.bridge.detach_guest();

        let termination = match (self.shim.exit_code(), outcome) {
            (Some(code), _) => Termination::ProcessExit(code),
            (None, Ok(())) => Termination::NormalExit(0),
            (None, Err(trap)) => Termination::Trap(self.explain(trap)),
        };
        self.state = InstanceState::Finished(termination.clone());
        termination
    }

    /// Prefer the host-side fault that caused the trap over the engine's
    /// generic unwind message
    fn explain(&self, trap: Trap) -> Trap {
        match self.shim.take_fault().or_else(|| self.bridge.take_fault()) {
            Some(fault) => Trap {
                message: fault.to_string(),
                stack: trap.stack,
            },
            None => trap,
        }
    }
}

/// Wrap text in the terminal's error highlight, ending with one newline
pub fn highlight(text: &str) -> String {
    format!("{}{}{}\n", HIGHLIGHT, text.trim_end(), RESET)
}

/// Render a trap as one highlighted error line plus stack context
pub fn render_trap(trap: &Trap) -> String {
    match &trap.stack {
        Some(stack) => highlight(&format!("Error: {}\n{}", trap.message, stack)),
        None => highlight(&format!("Error: {}", trap.message)),
    }
}

/// Render any failure as one highlighted error line
pub fn render_error(err: &RuntimeError) -> String {
    render_trap(&Trap::new(err.to_string()))
}

/// Runs guests of one engine against a shared filesystem
pub struct GuestRuntime<'a, E: Engine> {
    engine: &'a E,
    bridge: Rc<Bridge>,
    fs: Rc<dyn FsEngine>,
    environ: String,
    seed: u64,
}

impl<'a, E: Engine> GuestRuntime<'a, E> {
    pub fn new(engine: &'a E, bridge: Rc<Bridge>, fs: Rc<dyn FsEngine>, environ: String) -> Self {
        Self {
            engine,
            bridge,
            fs,
            environ,
            seed: 0x9E37_79B9_7F4A_7C15,
        }
    }

    /// Seed for the guests' pseudo-random bytes
    pub fn with_seed(mut self, seed: u64) -> Self {
        self.seed = seed;
        self
    }

    /// Instantiate with argv = [program, ...args]
    pub fn instantiate(
        &self,
        module: &E::Module,
        program: &str,
        args: &[String],
    ) -> RuntimeResult<GuestInstance<E::Instance>> {
        let argv = std::iter::once(program.to_string())
            .chain(args.iter().cloned())
            .collect();
        let shim = Rc::new(SyscallShim::new(
            argv,
            self.environ.clone(),
            Rc::clone(&self.fs),
            self.seed,
        ));

        let handle = self.engine.instantiate(module, Rc::clone(&shim))?;
        let memory = handle.memory()?;
        shim.attach_memory(memory.clone());

        Ok(GuestInstance {
            handle,
            shim,
            bridge: Rc::clone(&self.bridge),
            memory,
            state: InstanceState::Instantiated,
        })
    }

    /// Instantiate, run to completion and report failures to the terminal
    ///
    /// Traps and failing exit codes are written through the output sink
    /// before being returned as `GuestTrap`/`GuestExit`.
    pub fn run(&self, module: &E::Module, program: &str, args: &[String]) -> RuntimeResult<Termination> {
        let mut instance = self.instantiate(module, program, args)?;
        let termination = instance.run()?;

        match &termination {
            Termination::Trap(trap) => {
                self.bridge.emit(&render_trap(trap));
                Err(RuntimeError::GuestTrap {
                    message: trap.message.clone(),
                })
            }
            Termination::ProcessExit(code)
                if *code != 0 && !termination.allows_scheduling() =>
            {
                let err = RuntimeError::GuestExit { code: *code };
                self.bridge.emit(&render_error(&err));
                Err(err)
            }
            _ => Ok(termination),
        }
    }
}
