//! Integration tests for the webcc pipeline
//!
//! The toolchain modules are replaced by scripted guests: Rust closures that
//! drive the same syscall shim and filesystem engine a real guest would
//! import, against their own linear memory. The fake linker emits a real
//! (if empty) module so the run stage validates and "compiles" it like any
//! other binary.

use futures::executor::block_on;
use serde_json::json;
use std::cell::RefCell;
use std::collections::HashMap;
use std::rc::Rc;
use std::sync::mpsc;
use std::thread;
use std::time::Duration;
use tar::{EntryType, Header};
use webcc::bridge::Bridge;
use webcc::channel::{BufferedChannel, Inbound, Outbound, SourceFile};
use webcc::config::ToolchainConfig;
use webcc::error::{RuntimeError, RuntimeResult};
use webcc::guest::abi::{CONTINUE_SCHEDULING_EXIT_CODE, errno, oflags};
use webcc::guest::{Engine, EngineInstance, GuestRuntime, SyscallShim, Termination, Trap};
use webcc::mailbox::stdin_mailbox;
use webcc::memory::{LinearBuffer, MemoryView};
use webcc::pipeline::{PipelineOrchestrator, Stage};
use webcc::vfs::{HeapFsEngine, NodeKind};
use webcc::worker::Worker;

// ============================================================================
// Scripted guests
// ============================================================================

/// Guest memory layout used by the scripted programs
const SIZES: u32 = 0x10;
const IOVEC: u32 = 0x1000;
const OUT: u32 = 0x1010;
const FD_OUT: u32 = 0x1020;
const TABLE: u32 = 0x1100;
const STRINGS: u32 = 0x1400;
const PATH: u32 = 0x3000;
const DATA: u32 = 0x4000;
const DATA_CAPACITY: usize = 0x4000;

/// What a guest sees while it runs
struct Ctx {
    shim: Rc<SyscallShim>,
    memory: MemoryView,
    fs: Rc<HeapFsEngine>,
}

impl Ctx {
    /// Turn a host-side failure into a trap, as the browser engine's throw does
    fn check<T>(&self, result: RuntimeResult<T>) -> Result<T, Trap> {
        result.map_err(|err| Trap::new(self.shim.record_fault(err)))
    }

    fn exit(&self, code: i32) -> Result<(), Trap> {
        self.shim.proc_exit(code);
        Err(Trap::new("proc_exit"))
    }

    fn strings(&self, sizes: RuntimeResult<i32>, get: impl Fn() -> RuntimeResult<i32>) -> Result<Vec<String>, Trap> {
        self.check(sizes)?;
        let count = self.check(self.memory.read32(SIZES))?;
        self.check(get())?;
        (0..count)
            .map(|i| {
                let ptr = self.check(self.memory.read32(TABLE + 4 * i))?;
                self.check(self.memory.read_string(ptr, None))
            })
            .collect()
    }

    fn args(&self) -> Result<Vec<String>, Trap> {
        self.strings(self.shim.args_sizes_get(SIZES, SIZES + 4), || {
            self.shim.args_get(TABLE, STRINGS)
        })
    }

    fn environ(&self) -> Result<Vec<String>, Trap> {
        self.strings(self.shim.environ_sizes_get(SIZES, SIZES + 4), || {
            self.shim.environ_get(TABLE, STRINGS)
        })
    }

    fn set_iovec(&self, len: usize) -> Result<(), Trap> {
        self.check(self.memory.write32(IOVEC, DATA))?;
        self.check(self.memory.write32(IOVEC + 4, len as u32))
    }

    /// `fd_write` of `data` in one iovec; returns the count written
    fn write(&self, fd: i32, data: &[u8]) -> Result<u32, Trap> {
        self.check(self.memory.write_bytes(DATA, data))?;
        self.set_iovec(data.len())?;
        let code = self.check(self.shim.fd_write(fd, IOVEC, 1, OUT))?;
        if code != errno::SUCCESS {
            return Err(Trap::new(format!("fd_write errno {}", code)));
        }
        self.check(self.memory.read32(OUT))
    }

    /// One `fd_read` of up to `capacity` bytes
    fn read(&self, fd: i32, capacity: usize) -> Result<Vec<u8>, Trap> {
        self.set_iovec(capacity)?;
        let code = self.check(self.shim.fd_read(fd, IOVEC, 1, OUT))?;
        if code != errno::SUCCESS {
            return Err(Trap::new(format!("fd_read errno {}", code)));
        }
        let n = self.check(self.memory.read32(OUT))?;
        self.check(self.memory.read_bytes(DATA, n as usize))
    }

    fn open(&self, path: &str, flags: u16) -> Result<Option<i32>, Trap> {
        self.check(self.memory.write_bytes(PATH, path))?;
        let code = self.check(self.fs.path_open(PATH, path.len() as u32, flags, FD_OUT))?;
        if code != errno::SUCCESS {
            return Ok(None);
        }
        Ok(Some(self.check(self.memory.read32(FD_OUT))? as i32))
    }

    fn read_file(&self, path: &str) -> Result<Option<Vec<u8>>, Trap> {
        let Some(fd) = self.open(path, 0)? else {
            return Ok(None);
        };
        let mut contents = Vec::new();
        loop {
            let chunk = self.read(fd, DATA_CAPACITY)?;
            if chunk.is_empty() {
                break;
            }
            contents.extend(chunk);
        }
        self.fs.fd_close(fd);
        Ok(Some(contents))
    }

    fn write_file(&self, path: &str, contents: &[u8]) -> Result<(), Trap> {
        let fd = self
            .open(path, oflags::CREAT | oflags::TRUNC)?
            .ok_or_else(|| Trap::new(format!("cannot create {}", path)))?;
        for chunk in contents.chunks(DATA_CAPACITY) {
            self.write(fd, chunk)?;
        }
        self.fs.fd_close(fd);
        Ok(())
    }
}

/// A guest body, called with the export being invoked
type Program = Rc<dyn Fn(&Ctx, &str) -> Result<(), Trap>>;

fn program(body: impl Fn(&Ctx) -> Result<(), Trap> + 'static) -> Program {
    Rc::new(move |ctx: &Ctx, export: &str| match export {
        "_start" => body(ctx),
        other => Err(Trap::new(format!("no export {}", other))),
    })
}

fn value_after<'a>(args: &'a [String], flag: &str) -> Option<&'a str> {
    let at = args.iter().position(|a| a == flag)?;
    args.get(at + 1).map(String::as_str)
}

/// Front-end stand-in: `#error <msg>` fails, anything else becomes the object
fn clang() -> Program {
    program(|ctx| {
        let args = ctx.args()?;
        let (Some(object), Some(source)) = (value_after(&args, "-o"), args.last()) else {
            ctx.write(2, b"clang: error: missing arguments\n")?;
            return ctx.exit(1);
        };
        let Some(text) = ctx.read_file(source)? else {
            ctx.write(2, format!("clang: error: no such file: {}\n", source).as_bytes())?;
            return ctx.exit(1);
        };

        let text = String::from_utf8_lossy(&text).into_owned();
        if let Some(message) = text.strip_prefix("#error ") {
            let diagnostic = format!("{}:1:2: error: {}\n", source, message.trim());
            ctx.write(2, diagnostic.as_bytes())?;
            return ctx.exit(1);
        }
        ctx.write_file(object, text.as_bytes())
    })
}

/// Linker stand-in: wraps the objects' contents in a runnable module
fn lld() -> Program {
    program(|ctx| {
        let args = ctx.args()?;
        let Some(output) = value_after(&args, "-o") else {
            return ctx.exit(1);
        };
        let Some(crt1) = args.iter().find(|a| a.ends_with("crt1.o")) else {
            return ctx.exit(1);
        };
        if ctx.read_file(crt1)?.is_none() {
            ctx.write(2, format!("wasm-ld: error: cannot open {}\n", crt1).as_bytes())?;
            return ctx.exit(1);
        }

        let mut payload = Vec::new();
        for object in args.iter().filter(|a| a.ends_with(".o") && *a != crt1) {
            match ctx.read_file(object)? {
                Some(contents) => payload.extend(contents),
                None => {
                    ctx.write(2, format!("wasm-ld: error: cannot open {}\n", object).as_bytes())?;
                    return ctx.exit(1);
                }
            }
        }
        ctx.write_file(output, &module_bytes(&payload))
    })
}

/// User programs, keyed by their source text
fn user_programs() -> HashMap<String, Program> {
    let mut programs: HashMap<String, Program> = HashMap::new();
    programs.insert("int main() { return 0; }".into(), program(|_| Ok(())));
    programs.insert(
        "hello".into(),
        program(|ctx| {
            let n = ctx.write(1, b"Hello\n")?;
            ctx.exit(if n == 6 { 0 } else { 9 })
        }),
    );
    programs.insert(
        "args".into(),
        program(|ctx| {
            let line = format!("{}\n{}\n", ctx.args()?.join(" "), ctx.environ()?.join(" "));
            ctx.write(1, line.as_bytes())?;
            Ok(())
        }),
    );
    programs.insert(
        "trap".into(),
        program(|_| {
            Err(Trap {
                message: "unreachable executed".to_string(),
                stack: Some("at main\nat _start\n".to_string()),
            })
        }),
    );
    programs.insert("fail".into(), program(|ctx| ctx.exit(3)));
    programs.insert(
        "clock".into(),
        program(|ctx| {
            ctx.check(ctx.shim.clock_time_get(0, 0, SIZES))?;
            ctx.write(1, b"unreachable\n")?;
            Ok(())
        }),
    );
    programs.insert("park".into(), program(|ctx| ctx.exit(CONTINUE_SCHEDULING_EXIT_CODE)));
    programs.insert(
        "resumable".into(),
        Rc::new(|ctx: &Ctx, export: &str| match export {
            "_start" => ctx.exit(CONTINUE_SCHEDULING_EXIT_CODE),
            "resume" => ctx.write(1, b"resumed\n").map(|_| ()),
            other => Err(Trap::new(format!("no export {}", other))),
        }),
    );
    programs
}

// ============================================================================
// Scripted engine
// ============================================================================

const SCRIPT_MARKER: &[u8] = b"\x06script";

fn leb128(out: &mut Vec<u8>, mut value: usize) {
    loop {
        let byte = (value & 0x7f) as u8;
        value >>= 7;
        if value == 0 {
            out.push(byte);
            return;
        }
        out.push(byte | 0x80);
    }
}

/// A module exporting `memory` and `_start`, with `payload` in a custom section
fn module_bytes(payload: &[u8]) -> Vec<u8> {
    let mut bytes = b"\0asm\x01\0\0\0".to_vec();

    let mut exports = vec![2u8];
    for (name, kind) in [("memory", 2u8), ("_start", 0u8)] {
        exports.push(name.len() as u8);
        exports.extend_from_slice(name.as_bytes());
        exports.push(kind);
        exports.push(0);
    }
    bytes.push(7);
    leb128(&mut bytes, exports.len());
    bytes.extend(exports);

    let mut custom = SCRIPT_MARKER.to_vec();
    custom.extend_from_slice(payload);
    bytes.push(0);
    leb128(&mut bytes, custom.len());
    bytes.extend(custom);
    bytes
}

#[derive(Clone)]
struct Script(Program);

struct ScriptedInstance {
    program: Program,
    ctx: Ctx,
}

impl EngineInstance for ScriptedInstance {
    fn memory(&self) -> RuntimeResult<MemoryView> {
        Ok(self.ctx.memory.clone())
    }

    fn call(&self, export: &str) -> Result<(), Trap> {
        (self.program)(&self.ctx, export)
    }
}

struct ScriptedEngine {
    sysroot: Vec<u8>,
    tools: HashMap<String, Program>,
    programs: HashMap<String, Program>,
    /// Names passed to `compile_named`, in order
    compiled: Rc<RefCell<Vec<String>>>,
    fs: RefCell<Option<Rc<HeapFsEngine>>>,
}

impl ScriptedEngine {
    fn new(sysroot: Vec<u8>) -> Self {
        let mut tools = HashMap::new();
        tools.insert("clang".to_string(), clang());
        tools.insert("lld".to_string(), lld());
        Self {
            sysroot,
            tools,
            programs: user_programs(),
            compiled: Rc::new(RefCell::new(Vec::new())),
            fs: RefCell::new(None),
        }
    }
}

impl Engine for ScriptedEngine {
    type Module = Script;
    type Instance = ScriptedInstance;
    type Fs = HeapFsEngine;

    async fn fetch(&self, name: &str) -> RuntimeResult<Vec<u8>> {
        if name == "sysroot.tar" {
            return Ok(self.sysroot.clone());
        }
        Err(RuntimeError::Fetch {
            name: name.to_string(),
            reason: "HTTP 404".to_string(),
        })
    }

    async fn compile_named(&self, name: &str) -> RuntimeResult<Script> {
        self.compiled.borrow_mut().push(name.to_string());
        self.tools
            .get(name)
            .cloned()
            .map(Script)
            .ok_or_else(|| RuntimeError::Fetch {
                name: name.to_string(),
                reason: "HTTP 404".to_string(),
            })
    }

    async fn compile_bytes(&self, bytes: &[u8]) -> RuntimeResult<Script> {
        let invalid = || RuntimeError::InvalidModule {
            reason: "not a scripted module".to_string(),
        };
        let at = bytes
            .windows(SCRIPT_MARKER.len())
            .position(|w| w == SCRIPT_MARKER)
            .ok_or_else(invalid)?;
        let payload = String::from_utf8_lossy(&bytes[at + SCRIPT_MARKER.len()..]).into_owned();
        self.programs.get(&payload).cloned().map(Script).ok_or_else(invalid)
    }

    async fn instantiate_fs(&self, _name: &str, bridge: Rc<Bridge>) -> RuntimeResult<Rc<HeapFsEngine>> {
        let fs = Rc::new(HeapFsEngine::new(bridge));
        *self.fs.borrow_mut() = Some(Rc::clone(&fs));
        Ok(fs)
    }

    fn instantiate(&self, module: &Script, shim: Rc<SyscallShim>) -> RuntimeResult<ScriptedInstance> {
        let fs = self.fs.borrow().clone().ok_or(RuntimeError::NotInitialized)?;
        Ok(ScriptedInstance {
            program: Rc::clone(&module.0),
            ctx: Ctx {
                shim,
                memory: MemoryView::from_buffer(LinearBuffer::new(2)),
                fs,
            },
        })
    }
}

// ============================================================================
// Fixtures
// ============================================================================

fn append(builder: &mut tar::Builder<Vec<u8>>, path: &str, kind: EntryType, data: &[u8]) {
    let mut header = Header::new_gnu();
    header.set_entry_type(kind);
    header.set_size(data.len() as u64);
    header.set_mode(if kind == EntryType::Directory { 0o755 } else { 0o644 });
    builder.append_data(&mut header, path, data).unwrap();
}

fn sysroot_with(extra: impl FnOnce(&mut tar::Builder<Vec<u8>>)) -> Vec<u8> {
    let mut builder = tar::Builder::new(Vec::new());
    append(&mut builder, "include/", EntryType::Directory, b"");
    append(&mut builder, "include/stdio.h", EntryType::Regular, b"int printf(const char *, ...);\n");
    append(&mut builder, "lib/", EntryType::Directory, b"");
    append(&mut builder, "lib/wasm32-wasi/", EntryType::Directory, b"");
    append(&mut builder, "lib/wasm32-wasi/crt1.o", EntryType::Regular, b"crt1");
    extra(&mut builder);
    builder.into_inner().unwrap()
}

fn sysroot() -> Vec<u8> {
    sysroot_with(|_| {})
}

fn config() -> ToolchainConfig {
    ToolchainConfig {
        show_timing: false,
        ..ToolchainConfig::default()
    }
}

fn boot_with(engine: ScriptedEngine, config: ToolchainConfig) -> (Rc<BufferedChannel>, PipelineOrchestrator<ScriptedEngine>) {
    let channel = Rc::new(BufferedChannel::new());
    let bridge = Rc::new(Bridge::new(channel.clone()));
    let orchestrator = block_on(PipelineOrchestrator::boot(engine, bridge, config)).unwrap();
    (channel, orchestrator)
}

fn boot() -> (Rc<BufferedChannel>, PipelineOrchestrator<ScriptedEngine>) {
    boot_with(ScriptedEngine::new(sysroot()), config())
}

fn stage_of(err: &RuntimeError) -> Option<Stage> {
    match err {
        RuntimeError::StageFailed { stage, .. } => Some(*stage),
        _ => None,
    }
}

// ============================================================================
// Boot
// ============================================================================

#[test]
fn test_boot_materializes_sysroot() {
    let (channel, orchestrator) = boot();
    let vfs = orchestrator.vfs();

    assert_eq!(vfs.kind_of("include"), Some(NodeKind::Directory));
    assert_eq!(vfs.kind_of("lib/wasm32-wasi/"), Some(NodeKind::Directory));
    assert_eq!(
        vfs.get_file_contents("include/stdio.h").unwrap(),
        b"int printf(const char *, ...);\n"
    );
    assert!(channel.events().is_empty());
}

#[test]
fn test_boot_rejects_unsupported_entry() {
    let archive = sysroot_with(|builder| {
        let mut header = Header::new_gnu();
        header.set_entry_type(EntryType::Symlink);
        header.set_size(0);
        header.set_link_name("stdio.h").unwrap();
        builder.append_data(&mut header, "include/cstdio", &[][..]).unwrap();
    });
    let channel = Rc::new(BufferedChannel::new());
    let bridge = Rc::new(Bridge::new(channel.clone()));
    let result = block_on(PipelineOrchestrator::boot(ScriptedEngine::new(archive), bridge, config()));

    assert!(matches!(result, Err(RuntimeError::ArchiveFormat { .. })));
}

#[test]
fn test_boot_reports_missing_archive() {
    let mut config = config();
    config.sysroot_archive = "missing.tar".to_string();
    let channel = Rc::new(BufferedChannel::new());
    let bridge = Rc::new(Bridge::new(channel.clone()));
    let result = block_on(PipelineOrchestrator::boot(ScriptedEngine::new(sysroot()), bridge, config));

    assert!(matches!(result, Err(RuntimeError::Fetch { .. })));
}

// ============================================================================
// Pipeline
// ============================================================================

#[test]
fn test_clean_compile_link_run() {
    let (channel, mut orchestrator) = boot();
    let termination = block_on(orchestrator.compile_link_run("main.c", "int main() { return 0; }", &[])).unwrap();

    assert_eq!(termination, Termination::NormalExit(0));
    assert!(channel.events().is_empty());
    assert!(orchestrator.vfs().exists("main.o").unwrap());
    assert!(orchestrator.vfs().exists("main.wasm").unwrap());
}

#[test]
fn test_output_is_bridged_as_one_event() {
    let (channel, mut orchestrator) = boot();
    let termination = block_on(orchestrator.compile_link_run("hello.cc", "hello", &[])).unwrap();

    assert_eq!(termination, Termination::ProcessExit(0));
    assert_eq!(channel.events(), vec![Outbound::write("Hello\n")]);
}

#[test]
fn test_compile_failure_prevents_link() {
    let engine = ScriptedEngine::new(sysroot());
    let compiled = Rc::clone(&engine.compiled);
    let (channel, mut orchestrator) = boot_with(engine, config());

    let err = block_on(orchestrator.compile_link_run("main.c", "#error nope", &[])).unwrap_err();

    assert_eq!(stage_of(&err), Some(Stage::Compile));
    assert!(err.is_reported());
    assert_eq!(
        channel.text(),
        "main.c:1:2: error: nope\n\x1b[91mError: process exited with code 1.\x1b[0m\n"
    );
    assert_eq!(*compiled.borrow(), vec!["clang".to_string()]);
    assert!(!orchestrator.vfs().exists("main.wasm").unwrap());
}

#[test]
fn test_trap_is_highlighted() {
    let (channel, mut orchestrator) = boot();
    let err = block_on(orchestrator.compile_link_run("main.c", "trap", &[])).unwrap_err();

    assert_eq!(stage_of(&err), Some(Stage::Run));
    assert!(err.is_reported());
    assert_eq!(
        channel.text(),
        "\x1b[91mError: unreachable executed\nat main\nat _start\x1b[0m\n"
    );
}

#[test]
fn test_failing_exit_code() {
    let (channel, mut orchestrator) = boot();
    let err = block_on(orchestrator.compile_link_run("main.c", "fail", &[])).unwrap_err();

    assert_eq!(
        err,
        RuntimeError::StageFailed {
            stage: Stage::Run,
            cause: Box::new(RuntimeError::GuestExit { code: 3 }),
        }
    );
    assert_eq!(channel.text(), "\x1b[91mError: process exited with code 3.\x1b[0m\n");
}

#[test]
fn test_unsupported_syscall_traps() {
    let (channel, mut orchestrator) = boot();
    let err = block_on(orchestrator.compile_link_run("main.c", "clock", &[])).unwrap_err();

    assert!(err.is_reported());
    assert_eq!(
        channel.text(),
        "\x1b[91mError: unsupported syscall: wasi_unstable.clock_time_get\x1b[0m\n"
    );
}

#[test]
fn test_sentinel_exit_is_not_a_failure() {
    let (channel, mut orchestrator) = boot();
    let termination = block_on(orchestrator.compile_link_run("main.c", "park", &[])).unwrap();

    assert_eq!(termination, Termination::ProcessExit(CONTINUE_SCHEDULING_EXIT_CODE));
    assert!(termination.allows_scheduling());
    assert!(channel.events().is_empty());
}

#[test]
fn test_sentinel_exit_allows_scheduling() {
    let engine = ScriptedEngine::new(Vec::new());
    let channel = Rc::new(BufferedChannel::new());
    let bridge = Rc::new(Bridge::new(channel.clone()));
    let fs = block_on(engine.instantiate_fs("memfs", Rc::clone(&bridge))).unwrap();
    let runtime = GuestRuntime::new(&engine, bridge, fs, "PWD=/".to_string());

    let module = block_on(engine.compile_bytes(&module_bytes(b"resumable"))).unwrap();
    let mut instance = runtime.instantiate(&module, "resumable", &[]).unwrap();
    assert_eq!(
        instance.run().unwrap(),
        Termination::ProcessExit(CONTINUE_SCHEDULING_EXIT_CODE)
    );
    assert!(instance.allows_scheduling());

    assert_eq!(instance.invoke("resume").unwrap(), Termination::NormalExit(0));
    assert_eq!(channel.text(), "resumed\n");
    assert!(!instance.allows_scheduling());
    assert!(instance.invoke("resume").is_err());
}

#[test]
fn test_ordinary_exit_forbids_scheduling() {
    let engine = ScriptedEngine::new(Vec::new());
    let channel = Rc::new(BufferedChannel::new());
    let bridge = Rc::new(Bridge::new(channel.clone()));
    let fs = block_on(engine.instantiate_fs("memfs", Rc::clone(&bridge))).unwrap();
    let runtime = GuestRuntime::new(&engine, bridge, fs, "PWD=/".to_string());

    let module = block_on(engine.compile_bytes(&module_bytes(b"hello"))).unwrap();
    let mut instance = runtime.instantiate(&module, "hello", &[]).unwrap();
    assert_eq!(instance.run().unwrap(), Termination::ProcessExit(0));
    assert!(instance.invoke("resume").is_err());
    assert!(instance.run().is_err());
}

#[test]
fn test_module_cache_compiles_each_tool_once() {
    let engine = ScriptedEngine::new(sysroot());
    let compiled = Rc::clone(&engine.compiled);
    let (_, mut orchestrator) = boot_with(engine, config());

    block_on(orchestrator.compile_link_run("a.c", "int main() { return 0; }", &[])).unwrap();
    block_on(orchestrator.compile_link_run("b.c", "hello", &[])).unwrap();

    assert_eq!(*compiled.borrow(), vec!["clang".to_string(), "lld".to_string()]);
    assert_eq!(orchestrator.cache().len(), 2);
    assert!(orchestrator.cache().contains("clang"));
}

#[test]
fn test_run_validates_binary() {
    let (_, mut orchestrator) = boot();
    orchestrator.vfs().add_file("junk.wasm", b"not a module").unwrap();

    let err = block_on(orchestrator.run("junk.wasm", &[])).unwrap_err();
    assert!(matches!(
        err,
        RuntimeError::StageFailed { stage: Stage::Run, ref cause }
            if matches!(**cause, RuntimeError::InvalidModule { .. })
    ));
    assert!(!err.is_reported());
}

#[test]
fn test_run_requires_binary() {
    let (_, mut orchestrator) = boot();
    let err = block_on(orchestrator.run("nope.wasm", &[])).unwrap_err();
    assert_eq!(
        err.to_string(),
        "run failed: no such file: nope.wasm"
    );
}

#[test]
fn test_echo_commands() {
    let mut config = config();
    config.echo_commands = true;
    let (channel, mut orchestrator) = boot_with(ScriptedEngine::new(sysroot()), config);

    block_on(orchestrator.compile_link_run("main.c", "int main() { return 0; }", &[])).unwrap();
    let text = channel.text();
    let lines: Vec<&str> = text.lines().collect();

    assert_eq!(lines.len(), 3);
    assert!(lines[0].starts_with("> clang -cc1 -emit-obj -disable-free -isysroot /"));
    assert!(lines[0].ends_with("-O2 -o main.o -x c main.c"));
    assert!(lines[1].starts_with("> wasm-ld --no-threads --export-dynamic -z stack-size=1048576"));
    assert!(lines[1].ends_with("main.o -lc -lc++ -lc++abi -o main.wasm"));
    assert_eq!(lines[2], "> main.wasm ");
}

// ============================================================================
// Command lines
// ============================================================================

#[test]
fn test_driver_compile_then_link() {
    let (channel, mut orchestrator) = boot();
    orchestrator.vfs().add_file("src/util.c", "args").unwrap();

    block_on(orchestrator.run_command_line("clang -c src/util.c")).unwrap();
    assert!(orchestrator.vfs().exists("src/util.o").unwrap());

    block_on(orchestrator.run_command_line("clang src/util.o -o prog")).unwrap();
    block_on(orchestrator.run_command_line("./prog one 'two words'")).unwrap();
    assert_eq!(channel.text(), "prog one two words\nPWD=/\n");
}

#[test]
fn test_driver_defaults_to_a_out() {
    let (channel, mut orchestrator) = boot();
    orchestrator.vfs().add_file("main.cpp", "hello").unwrap();

    block_on(orchestrator.run_command_line("clang++ -O0 main.cpp")).unwrap();
    block_on(orchestrator.run_command_line("run a.out")).unwrap();
    assert_eq!(channel.text(), "Hello\n");
}

#[test]
fn test_diagnostics_name_the_user_file() {
    let (channel, mut orchestrator) = boot();
    orchestrator.vfs().add_file("tmp/work/bad.c", "#error oops").unwrap();

    let err = block_on(orchestrator.run_command_line("clang -c tmp/work/bad.c")).unwrap_err();
    assert_eq!(stage_of(&err), Some(Stage::Compile));
    assert!(channel.text().starts_with("bad.c:1:2: error: oops\n"));
}

#[test]
fn test_unknown_command_fails() {
    let (_, mut orchestrator) = boot();
    let err = block_on(orchestrator.run_command_line("make all")).unwrap_err();
    assert_eq!(
        err,
        RuntimeError::CommandNotFound {
            name: "make".to_string()
        }
    );

    // directories are not runnable
    let err = block_on(orchestrator.run_command_line("include")).unwrap_err();
    assert!(matches!(err, RuntimeError::CommandNotFound { .. }));
}

#[test]
fn test_blank_command_line_is_a_no_op() {
    let (channel, mut orchestrator) = boot();
    block_on(orchestrator.run_command_line("   ")).unwrap();
    assert!(channel.events().is_empty());
}

// ============================================================================
// Worker
// ============================================================================

fn ready_worker() -> (Rc<BufferedChannel>, Worker<ScriptedEngine>) {
    let channel = Rc::new(BufferedChannel::new());
    let mut worker = Worker::new(ScriptedEngine::new(sysroot()), channel.clone());
    block_on(worker.init(config())).unwrap();
    assert_eq!(channel.take(), vec![Outbound::Ready]);
    (channel, worker)
}

fn source(name: &str, contents: &str) -> SourceFile {
    SourceFile {
        name: name.to_string(),
        contents: contents.to_string(),
    }
}

#[test]
fn test_worker_run_source() {
    let (channel, mut worker) = ready_worker();
    let message = Inbound::from_json(
        r#"{"id":"runSource","activeFileName":"hello.c",
            "files":[{"name":"hello.c","contents":"hello"}]}"#,
    )
    .unwrap();

    block_on(worker.handle(message)).unwrap();
    assert_eq!(
        channel.take(),
        vec![Outbound::write("Hello\n"), Outbound::RunCompleted]
    );
}

#[test]
fn test_worker_filename_substitution() {
    let (channel, mut worker) = ready_worker();
    let message = Inbound::RunCommand {
        token: json!("t-1"),
        active_file_name: "proj/hello.c".to_string(),
        command_lines: vec![
            "clang -c proj/<filename>".to_string(),
            "clang proj/hello.o -o <filename>.wasm".to_string(),
            "run <filename>.wasm".to_string(),
        ],
        files: vec![source("proj/hello.c", "hello")],
    };

    block_on(worker.handle(message)).unwrap();
    assert_eq!(
        channel.take(),
        vec![
            Outbound::write("Hello\n"),
            Outbound::CommandCompleted { token: json!("t-1") },
        ]
    );
    let vfs = worker.orchestrator().unwrap().vfs();
    assert!(vfs.exists("hello.c.wasm").unwrap());
}

#[test]
fn test_worker_reports_each_failure_once() {
    let (channel, mut worker) = ready_worker();
    let message = Inbound::RunSource {
        active_file_name: "main.c".to_string(),
        files: vec![source("main.c", "fail")],
    };

    let err = block_on(worker.handle(message)).unwrap_err();
    assert!(err.is_reported());
    assert_eq!(
        channel.take(),
        vec![
            Outbound::write("\x1b[91mError: process exited with code 3.\x1b[0m\n"),
            Outbound::RunCompleted,
        ]
    );
}

// ============================================================================
// Stdin
// ============================================================================

#[test]
fn test_blocking_read_waits_for_each_payload() {
    let (sender, receiver) = stdin_mailbox(64);
    let (done_tx, done_rx) = mpsc::channel();

    let guest = thread::spawn(move || {
        let channel = Rc::new(BufferedChannel::new());
        let bridge = Bridge::new(channel.clone());
        bridge.set_stdin(Box::new(receiver));
        let memory = MemoryView::from_buffer(LinearBuffer::new(1));
        bridge.attach_guest(memory.clone());
        memory.write32(0x100, 0x200).unwrap();
        memory.write32(0x104, 10).unwrap();

        for _ in 0..2 {
            let n = bridge.host_read(0, 0x100, 1, 0x110).unwrap();
            let stored = memory.read32(0x110).unwrap();
            let bytes = memory.read_bytes(0x200, n as usize).unwrap();
            let requests = channel
                .events()
                .iter()
                .filter(|e| **e == Outbound::ReadStdinRequest)
                .count();
            done_tx.send((n, stored, bytes, requests)).unwrap();
        }
    });

    sender.deliver(b"42\n").unwrap();
    let (n, stored, bytes, requests) = done_rx.recv_timeout(Duration::from_secs(5)).unwrap();
    assert_eq!((n, stored), (3, 3));
    assert_eq!(bytes, b"42\n");
    assert_eq!(requests, 1);

    // no new signal: the second read stays blocked
    assert!(done_rx.recv_timeout(Duration::from_millis(150)).is_err());

    sender.deliver(b"7\n").unwrap();
    let (n, _, bytes, requests) = done_rx.recv_timeout(Duration::from_secs(5)).unwrap();
    assert_eq!(n, 2);
    assert_eq!(bytes, b"7\n");
    assert_eq!(requests, 2);
    guest.join().unwrap();
}
