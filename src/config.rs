//! Toolchain configuration
//!
//! Carried in the `init` message. Every field has a default so an empty
//! object (or no config at all) yields a working toolchain.

use serde::Deserialize;

/// Settings for the compile/link/run pipeline and its guests
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct ToolchainConfig {
    /// Logical name of the compiler front-end module
    pub clang_module: String,
    /// Logical name of the linker module
    pub lld_module: String,
    /// Logical name of the filesystem engine module
    pub memfs_module: String,
    /// Archive that seeds the filesystem (headers, runtime libraries)
    pub sysroot_archive: String,
    /// Version directory of the compiler's resource headers
    pub clang_version: String,
    /// Optimization level passed as `-O<n>`
    pub opt_level: String,
    /// `-ferror-limit`
    pub error_limit: u32,
    /// `-fmessage-length`
    pub message_length: u32,
    /// Linker stack reservation in bytes
    pub stack_size: u32,
    /// Directory holding `crt1.o` and the runtime libraries
    pub lib_dir: String,
    /// Libraries linked into every program, without the `-l` prefix
    pub libs: Vec<String>,
    /// The single environment pair every guest sees
    pub env_key: String,
    pub env_value: String,
    /// Capacity of the stdin mailbox payload region
    pub stdin_capacity: usize,
    /// Write `> command` lines to the terminal before running a tool
    pub echo_commands: bool,
    /// Log elapsed time of fetch/compile/untar steps
    pub show_timing: bool,
}

impl Default for ToolchainConfig {
    fn default() -> Self {
        Self {
            clang_module: "clang".to_string(),
            lld_module: "lld".to_string(),
            memfs_module: "memfs".to_string(),
            sysroot_archive: "sysroot.tar".to_string(),
            clang_version: "8.0.1".to_string(),
            opt_level: "2".to_string(),
            error_limit: 19,
            message_length: 80,
            stack_size: 1_048_576,
            lib_dir: "lib/wasm32-wasi".to_string(),
            libs: vec!["c".to_string(), "c++".to_string(), "c++abi".to_string()],
            env_key: "PWD".to_string(),
            env_value: "/".to_string(),
            stdin_capacity: 4096,
            echo_commands: false,
            show_timing: true,
        }
    }
}

impl ToolchainConfig {
    /// The environment pair as a `KEY=value` string
    pub fn environ(&self) -> String {
        format!("{}={}", self.env_key, self.env_value)
    }

    /// Parse from JSON, falling back to defaults for absent fields
    pub fn from_json(json: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(json)
    }
}
