//! Guest modules
//!
//! Everything the toolchain and user programs run against: the ABI
//! constants, the process-surface shim, binary validation and the runtime
//! that drives one instance to completion.

pub mod abi;
mod runtime;
mod shim;
mod validate;

pub use runtime::*;
pub use shim::SyscallShim;
pub use validate::ModuleValidator;
