//! Browser Platform Implementation
//!
//! Runs inside a dedicated worker:
//! - `BrowserEngine` fetches, compiles and instantiates modules through the
//!   `WebAssembly` JS API
//! - `JsFsEngine` drives the memfs module's exports
//! - `SharedMailbox` blocks on a `SharedArrayBuffer` for stdin
//! - `PortChannel` posts events back to the page
//!
//! Host functions handed to guests report failures by recording them and
//! throwing, which unwinds the guest. Nothing may hold a `RefCell` borrow
//! across a throw: the unwind skips destructors.

use crate::bridge::Bridge;
use crate::channel::{HostChannel, Inbound, Outbound};
use crate::console_log;
use crate::error::{RuntimeError, RuntimeResult};
use crate::guest::abi::{exports, fs_exports, fs_imports, namespaces, syscalls};
use crate::guest::{Engine, EngineInstance, SyscallShim, Trap};
use crate::mailbox::StdinSource;
use crate::memory::{LinearMemory, MemoryView};
use crate::vfs::FsEngine;
use crate::worker::Worker;
use futures::lock::Mutex;
use js_sys::{Array, ArrayBuffer, Atomics, Function, Int32Array, Object, Reflect, Uint8Array, WebAssembly};
use std::any::Any;
use std::cell::RefCell;
use std::rc::Rc;
use wasm_bindgen::JsCast;
use wasm_bindgen::closure::WasmClosure;
use wasm_bindgen::prelude::*;
use wasm_bindgen_futures::JsFuture;

/// Control word layout of the stdin buffer: [state, length]
const STATE_INDEX: u32 = 0;
const LENGTH_INDEX: u32 = 1;
const PAYLOAD_OFFSET: u32 = 8;

fn describe(value: &JsValue) -> String {
    if let Some(error) = value.dyn_ref::<js_sys::Error>() {
        return String::from(error.message());
    }
    value.as_string().unwrap_or_else(|| format!("{:?}", value))
}

fn get(target: &JsValue, key: &str) -> RuntimeResult<JsValue> {
    Reflect::get(target, &JsValue::from_str(key)).map_err(|e| RuntimeError::Protocol {
        reason: format!("cannot read {}: {}", key, describe(&e)),
    })
}

fn set(target: &Object, key: &str, value: &JsValue) -> RuntimeResult<()> {
    Reflect::set(target, &JsValue::from_str(key), value)
        .map(|_| ())
        .map_err(|e| RuntimeError::InstantiationFailed {
            reason: format!("cannot set import {}: {}", key, describe(&e)),
        })
}

fn function(instance_exports: &Object, name: &'static str) -> RuntimeResult<Function> {
    get(instance_exports, name)?
        .dyn_into::<Function>()
        .map_err(|_| RuntimeError::MissingExport { name })
}

fn exported_memory(instance_exports: &Object) -> RuntimeResult<MemoryView> {
    let memory = get(instance_exports, exports::MEMORY)?
        .dyn_into::<WebAssembly::Memory>()
        .map_err(|_| RuntimeError::MissingExport {
            name: exports::MEMORY,
        })?;
    Ok(MemoryView::new(Rc::new(JsMemory::new(memory))))
}

/// Report a host-side failure to the guest by unwinding it
fn throw(message: String) -> ! {
    wasm_bindgen::throw_str(&message)
}

// ===== Memory =====

/// `WebAssembly.Memory` with a cached byte view
///
/// Any `grow`, even by zero pages, detaches the old `ArrayBuffer`, so the
/// view is re-derived whenever the memory's buffer is no longer the one the
/// view was made from.
pub struct JsMemory {
    memory: WebAssembly::Memory,
    buffer: RefCell<JsValue>,
    view: RefCell<Uint8Array>,
}

impl JsMemory {
    pub fn new(memory: WebAssembly::Memory) -> Self {
        let buffer = memory.buffer();
        let view = Uint8Array::new(&buffer);
        Self {
            memory,
            buffer: RefCell::new(buffer),
            view: RefCell::new(view),
        }
    }
}

impl LinearMemory for JsMemory {
    fn byte_len(&self) -> usize {
        self.memory.buffer().unchecked_into::<ArrayBuffer>().byte_length() as usize
    }

    fn is_detached(&self) -> bool {
        !Object::is(&self.memory.buffer(), &self.buffer.borrow())
    }

    fn rebind(&self) {
        let buffer = self.memory.buffer();
        *self.view.borrow_mut() = Uint8Array::new(&buffer);
        *self.buffer.borrow_mut() = buffer;
    }

    fn read_into(&self, offset: usize, buf: &mut [u8]) {
        let end = offset + buf.len();
        self.view
            .borrow()
            .subarray(offset as u32, end as u32)
            .copy_to(buf);
    }

    fn write_from(&self, offset: usize, data: &[u8]) {
        let end = offset + data.len();
        self.view
            .borrow()
            .subarray(offset as u32, end as u32)
            .copy_from(data);
    }
}

// ===== Filesystem engine =====

/// The memfs module, driven through its exports
pub struct JsFsEngine {
    exports: Object,
    memory: MemoryView,
    bridge: Rc<Bridge>,
    /// `env` host functions the instance calls back into
    _imports: ImportSet,
}

impl JsFsEngine {
    fn call(&self, name: &'static str, args: &[f64]) -> RuntimeResult<f64> {
        let func = function(&self.exports, name)?;
        let args: Array = args.iter().map(|a| JsValue::from_f64(*a)).collect();
        let result = func.apply(&JsValue::UNDEFINED, &args).map_err(|e| {
            self.bridge.take_fault().unwrap_or_else(|| RuntimeError::Aborted {
                reason: describe(&e),
            })
        })?;
        Ok(result.as_f64().unwrap_or(0.0))
    }

    /// Call an export returning a pointer or size
    fn call_u32(&self, name: &'static str, args: &[u32]) -> RuntimeResult<u32> {
        let args: Vec<f64> = args.iter().map(|a| *a as f64).collect();
        Ok(self.call(name, &args)? as i64 as u32)
    }

    fn call_errno(&self, name: &'static str, fd: i32, args: [u32; 3]) -> RuntimeResult<i32> {
        let result = self.call(
            name,
            &[fd as f64, args[0] as f64, args[1] as f64, args[2] as f64],
        )?;
        Ok(result as i32)
    }
}

impl FsEngine for JsFsEngine {
    fn memory(&self) -> MemoryView {
        self.memory.clone()
    }

    fn path_buf(&self) -> RuntimeResult<u32> {
        self.call_u32(fs_exports::GET_PATH_BUF, &[])
    }

    fn add_directory_node(&self, path_len: u32) -> RuntimeResult<u32> {
        self.call_u32(fs_exports::ADD_DIRECTORY_NODE, &[path_len])
    }

    fn add_file_node(&self, path_len: u32, size: u32) -> RuntimeResult<u32> {
        self.call_u32(fs_exports::ADD_FILE_NODE, &[path_len, size])
    }

    fn find_node(&self, path_len: u32) -> RuntimeResult<Option<u32>> {
        let inode = self.call_u32(fs_exports::FIND_NODE, &[path_len])?;
        Ok((inode != 0).then_some(inode))
    }

    fn file_node_address(&self, inode: u32) -> RuntimeResult<u32> {
        self.call_u32(fs_exports::GET_FILE_NODE_ADDRESS, &[inode])
    }

    fn file_node_size(&self, inode: u32) -> RuntimeResult<u32> {
        self.call_u32(fs_exports::GET_FILE_NODE_SIZE, &[inode])
    }

    fn fd_write(&self, fd: i32, iovs: u32, iovs_len: u32, nwritten: u32) -> RuntimeResult<i32> {
        self.call_errno(syscalls::FD_WRITE, fd, [iovs, iovs_len, nwritten])
    }

    fn fd_read(&self, fd: i32, iovs: u32, iovs_len: u32, nread: u32) -> RuntimeResult<i32> {
        self.call_errno(syscalls::FD_READ, fd, [iovs, iovs_len, nread])
    }
}

// ===== Engine =====

/// Host functions installed in an import object, kept alive with it
#[derive(Default)]
struct ImportSet {
    closures: Vec<Box<dyn Any>>,
}

impl ImportSet {
    fn add<T: ?Sized + WasmClosure + 'static>(&mut self, target: &Object, name: &str, closure: Closure<T>) -> RuntimeResult<()> {
        set(target, name, closure.as_ref())?;
        self.closures.push(Box::new(closure));
        Ok(())
    }
}

fn env_imports(bridge: &Rc<Bridge>, imports: &mut ImportSet) -> RuntimeResult<Object> {
    let env = Object::new();

    let b = Rc::clone(bridge);
    imports.add(&env, fs_imports::ABORT, Closure::wrap(Box::new(move || {
        let fault = b.abort();
        let message = b.record_fault(fault);
        wasm_bindgen::throw_str(&message);
    }) as Box<dyn Fn()>))?;

    let b = Rc::clone(bridge);
    imports.add(&env, fs_imports::HOST_WRITE, Closure::wrap(Box::new(move |fd: i32, iovs: u32, len: u32, out: u32| {
        let result = b.host_write(fd, iovs, len, out);
        result.unwrap_or_else(|err| throw(b.record_fault(err)))
    }) as Box<dyn Fn(i32, u32, u32, u32) -> u32>))?;

    let b = Rc::clone(bridge);
    imports.add(&env, fs_imports::HOST_READ, Closure::wrap(Box::new(move |fd: i32, iovs: u32, len: u32, out: u32| {
        let result = b.host_read(fd, iovs, len, out);
        result.unwrap_or_else(|err| throw(b.record_fault(err)))
    }) as Box<dyn Fn(i32, u32, u32, u32) -> u32>))?;

    let b = Rc::clone(bridge);
    imports.add(&env, fs_imports::MEMFS_LOG, Closure::wrap(Box::new(move |buf: u32, len: u32| {
        if let Err(err) = b.log(buf, len) {
            console_log!("[memfs] unreadable log message: {}", err);
        }
    }) as Box<dyn Fn(u32, u32)>))?;

    let b = Rc::clone(bridge);
    imports.add(&env, fs_imports::COPY_OUT, Closure::wrap(Box::new(move |dst: u32, src: u32, size: u32| {
        let result = b.copy_out(dst, src, size);
        result.unwrap_or_else(|err| throw(b.record_fault(err)))
    }) as Box<dyn Fn(u32, u32, u32)>))?;

    let b = Rc::clone(bridge);
    imports.add(&env, fs_imports::COPY_IN, Closure::wrap(Box::new(move |dst: u32, src: u32, size: u32| {
        let result = b.copy_in(dst, src, size);
        result.unwrap_or_else(|err| throw(b.record_fault(err)))
    }) as Box<dyn Fn(u32, u32, u32)>))?;

    Ok(env)
}

fn errno(shim: &SyscallShim, result: RuntimeResult<i32>) -> i32 {
    result.unwrap_or_else(|err| throw(shim.record_fault(err)))
}

/// `wasi_unstable` for a guest: the memfs file syscalls with the process
/// surface layered on top
fn wasi_imports(memfs: &Object, shim: &Rc<SyscallShim>, imports: &mut ImportSet) -> RuntimeResult<Object> {
    let wasi = Object::assign(&Object::new(), memfs);

    let s = Rc::clone(shim);
    imports.add(&wasi, syscalls::PROC_EXIT, Closure::wrap(Box::new(move |code: i32| {
        s.proc_exit(code);
        wasm_bindgen::throw_str(&format!("proc_exit({})", code));
    }) as Box<dyn Fn(i32)>))?;

    let s = Rc::clone(shim);
    imports.add(&wasi, syscalls::ARGS_SIZES_GET, Closure::wrap(Box::new(move |argc: u32, size: u32| {
        errno(&s, s.args_sizes_get(argc, size))
    }) as Box<dyn Fn(u32, u32) -> i32>))?;

    let s = Rc::clone(shim);
    imports.add(&wasi, syscalls::ARGS_GET, Closure::wrap(Box::new(move |argv: u32, buf: u32| {
        errno(&s, s.args_get(argv, buf))
    }) as Box<dyn Fn(u32, u32) -> i32>))?;

    let s = Rc::clone(shim);
    imports.add(&wasi, syscalls::ENVIRON_SIZES_GET, Closure::wrap(Box::new(move |count: u32, size: u32| {
        errno(&s, s.environ_sizes_get(count, size))
    }) as Box<dyn Fn(u32, u32) -> i32>))?;

    let s = Rc::clone(shim);
    imports.add(&wasi, syscalls::ENVIRON_GET, Closure::wrap(Box::new(move |environ: u32, buf: u32| {
        errno(&s, s.environ_get(environ, buf))
    }) as Box<dyn Fn(u32, u32) -> i32>))?;

    let s = Rc::clone(shim);
    imports.add(&wasi, syscalls::RANDOM_GET, Closure::wrap(Box::new(move |buf: u32, len: u32| {
        errno(&s, s.random_get(buf, len))
    }) as Box<dyn Fn(u32, u32) -> i32>))?;

    let s = Rc::clone(shim);
    imports.add(&wasi, syscalls::CLOCK_TIME_GET, Closure::wrap(Box::new(move |id: u32, precision: u64, out: u32| {
        errno(&s, s.clock_time_get(id, precision, out))
    }) as Box<dyn Fn(u32, u64, u32) -> i32>))?;

    let s = Rc::clone(shim);
    imports.add(&wasi, syscalls::POLL_ONEOFF, Closure::wrap(Box::new(move |input: u32, output: u32, n: u32, events: u32| {
        errno(&s, s.poll_oneoff(input, output, n, events))
    }) as Box<dyn Fn(u32, u32, u32, u32) -> i32>))?;

    Ok(wasi)
}

/// Engine over the browser's `WebAssembly` API
#[derive(Default)]
pub struct BrowserEngine {
    /// URL prefix for modules and archives
    base_url: String,
    /// memfs exports, merged into every guest's `wasi_unstable`
    memfs_exports: RefCell<Option<Object>>,
}

impl BrowserEngine {
    pub fn new(base_url: impl Into<String>) -> Self {
        Self {
            base_url: base_url.into(),
            memfs_exports: RefCell::new(None),
        }
    }

    fn fetch_error(name: &str, err: &JsValue) -> RuntimeError {
        RuntimeError::Fetch {
            name: name.to_string(),
            reason: describe(err),
        }
    }
}

/// A running guest and the host functions it imports
pub struct BrowserInstance {
    exports: Object,
    _imports: ImportSet,
}

impl EngineInstance for BrowserInstance {
    fn memory(&self) -> RuntimeResult<MemoryView> {
        exported_memory(&self.exports)
    }

    fn call(&self, export: &str) -> Result<(), Trap> {
        let entry = get(&self.exports, export)
            .ok()
            .and_then(|f| f.dyn_into::<Function>().ok())
            .ok_or_else(|| Trap::new(format!("missing export {}", export)))?;

        entry.call0(&JsValue::UNDEFINED).map(|_| ()).map_err(|err| Trap {
            message: describe(&err),
            stack: Reflect::get(&err, &JsValue::from_str("stack"))
                .ok()
                .and_then(|s| s.as_string()),
        })
    }
}

impl Engine for BrowserEngine {
    type Module = WebAssembly::Module;
    type Instance = BrowserInstance;
    type Fs = JsFsEngine;

    async fn fetch(&self, name: &str) -> RuntimeResult<Vec<u8>> {
        let url = format!("{}{}", self.base_url, name);
        let scope: web_sys::WorkerGlobalScope = js_sys::global().unchecked_into();

        let response: web_sys::Response = JsFuture::from(scope.fetch_with_str(&url))
            .await
            .map_err(|e| Self::fetch_error(name, &e))?
            .dyn_into()
            .map_err(|_| RuntimeError::Fetch {
                name: name.to_string(),
                reason: "not a Response".to_string(),
            })?;
        if !response.ok() {
            return Err(RuntimeError::Fetch {
                name: name.to_string(),
                reason: format!("HTTP {}", response.status()),
            });
        }

        let promise = response.array_buffer().map_err(|e| Self::fetch_error(name, &e))?;
        let buffer = JsFuture::from(promise)
            .await
            .map_err(|e| Self::fetch_error(name, &e))?;
        Ok(Uint8Array::new(&buffer).to_vec())
    }

    async fn compile_named(&self, name: &str) -> RuntimeResult<WebAssembly::Module> {
        let bytes = self.fetch(name).await?;
        self.compile_bytes(&bytes).await
    }

    async fn compile_bytes(&self, bytes: &[u8]) -> RuntimeResult<WebAssembly::Module> {
        let module = JsFuture::from(WebAssembly::compile(&Uint8Array::from(bytes)))
            .await
            .map_err(|e| RuntimeError::InvalidModule { reason: describe(&e) })?;
        Ok(module.unchecked_into())
    }

    async fn instantiate_fs(&self, name: &str, bridge: Rc<Bridge>) -> RuntimeResult<Rc<JsFsEngine>> {
        let module = self.compile_named(name).await?;

        let mut imports = ImportSet::default();
        let env = env_imports(&bridge, &mut imports)?;
        let import_object = Object::new();
        set(&import_object, namespaces::ENV, &env)?;

        let instance: WebAssembly::Instance =
            JsFuture::from(WebAssembly::instantiate_module(&module, &import_object))
                .await
                .map_err(|e| RuntimeError::InstantiationFailed { reason: describe(&e) })?
                .unchecked_into();
        let exports = instance.exports();

        let memory = exported_memory(&exports)?;
        bridge.attach_fs_memory(memory.clone());
        function(&exports, fs_exports::INIT)?
            .call0(&JsValue::UNDEFINED)
            .map_err(|e| RuntimeError::InstantiationFailed { reason: describe(&e) })?;

        *self.memfs_exports.borrow_mut() = Some(exports.clone());

        Ok(Rc::new(JsFsEngine {
            exports,
            memory,
            bridge,
            _imports: imports,
        }))
    }

    fn instantiate(&self, module: &WebAssembly::Module, shim: Rc<SyscallShim>) -> RuntimeResult<BrowserInstance> {
        let memfs = self
            .memfs_exports
            .borrow()
            .clone()
            .ok_or(RuntimeError::NotInitialized)?;

        let mut imports = ImportSet::default();
        let wasi = wasi_imports(&memfs, &shim, &mut imports)?;
        let import_object = Object::new();
        set(&import_object, namespaces::WASI, &wasi)?;
        set(&import_object, namespaces::ENV, &Object::new())?;

        let instance = WebAssembly::Instance::new(module, &import_object)
            .map_err(|e| RuntimeError::InstantiationFailed { reason: describe(&e) })?;
        Ok(BrowserInstance {
            exports: instance.exports(),
            _imports: imports,
        })
    }
}

// ===== Stdin =====

/// Consumer side of the page's `SharedArrayBuffer` stdin slot
///
/// Layout: `Int32Array` control word at byte 0 (`[0]` state, `[1]` length),
/// payload from byte 8.
pub struct SharedMailbox {
    control: Int32Array,
    payload: Uint8Array,
}

impl SharedMailbox {
    pub fn new(buffer: &js_sys::SharedArrayBuffer) -> Self {
        Self {
            control: Int32Array::new_with_byte_offset_and_length(buffer, 0, 2),
            payload: Uint8Array::new_with_byte_offset(buffer, PAYLOAD_OFFSET),
        }
    }

    fn error(err: JsValue) -> RuntimeError {
        RuntimeError::Mailbox {
            reason: describe(&err),
        }
    }
}

impl StdinSource for SharedMailbox {
    fn receive(&mut self) -> RuntimeResult<Vec<u8>> {
        while Atomics::load(&self.control, STATE_INDEX).map_err(Self::error)? == 0 {
            Atomics::wait(&self.control, STATE_INDEX, 0).map_err(Self::error)?;
        }

        let len = Atomics::load(&self.control, LENGTH_INDEX).map_err(Self::error)? as u32;
        if len > self.payload.length() {
            return Err(RuntimeError::Mailbox {
                reason: format!("payload of {} bytes overflows the buffer", len),
            });
        }
        let bytes = self.payload.subarray(0, len).to_vec();

        self.payload.fill(0, 0, len);
        Atomics::store(&self.control, LENGTH_INDEX, 0).map_err(Self::error)?;
        Atomics::store(&self.control, STATE_INDEX, 0).map_err(Self::error)?;
        Ok(bytes)
    }
}

// ===== Channel =====

/// Posts events to the page
pub enum PortChannel {
    /// Port handed over in `init`
    Port(web_sys::MessagePort),
    /// The worker's own scope, when no port was given
    Scope(web_sys::DedicatedWorkerGlobalScope),
}

impl HostChannel for PortChannel {
    fn post(&self, event: Outbound) {
        let message = match js_sys::JSON::parse(&event.to_json()) {
            Ok(message) => message,
            Err(err) => {
                console_log!("[worker] cannot encode event: {}", describe(&err));
                return;
            }
        };
        let posted = match self {
            PortChannel::Port(port) => port.post_message(&message),
            PortChannel::Scope(scope) => scope.post_message(&message),
        };
        if let Err(err) = posted {
            console_log!("[worker] post failed: {}", describe(&err));
        }
    }
}

// ===== Worker entry =====

thread_local! {
    static WORKER: RefCell<Option<Rc<Mutex<Worker<BrowserEngine>>>>> = const { RefCell::new(None) };
}

/// Create the worker on `init`, wiring the port and the stdin buffer
fn create_worker(data: &JsValue, scope: &web_sys::DedicatedWorkerGlobalScope) -> Rc<Mutex<Worker<BrowserEngine>>> {
    let channel = match get(data, "channel").map(|c| c.dyn_into::<web_sys::MessagePort>()) {
        Ok(Ok(port)) => PortChannel::Port(port),
        _ => PortChannel::Scope(scope.clone()),
    };
    let worker = Worker::new(BrowserEngine::default(), Rc::new(channel));

    match get(data, "sharedBuffer").map(|b| b.dyn_into::<js_sys::SharedArrayBuffer>()) {
        Ok(Ok(buffer)) => worker.bridge().set_stdin(Box::new(SharedMailbox::new(&buffer))),
        _ => console_log!("[worker] no shared buffer, stdin reads end of input"),
    }
    Rc::new(Mutex::new(worker))
}

fn on_message(event: web_sys::MessageEvent, scope: &web_sys::DedicatedWorkerGlobalScope) {
    let data = event.data();
    let message = js_sys::JSON::stringify(&data)
        .map(String::from)
        .map_err(|e| RuntimeError::Protocol { reason: describe(&e) })
        .and_then(|json| Inbound::from_json(&json));
    let message = match message {
        Ok(message) => message,
        Err(err) => {
            console_log!("[worker] dropped message: {}", err);
            return;
        }
    };

    let worker = WORKER.with(|slot| {
        let mut slot = slot.borrow_mut();
        if slot.is_none() && matches!(message, Inbound::Init { .. }) {
            *slot = Some(create_worker(&data, scope));
        }
        slot.clone()
    });
    let Some(worker) = worker else {
        console_log!("[worker] request before init dropped");
        return;
    };

    // one request at a time, in arrival order
    wasm_bindgen_futures::spawn_local(async move {
        let mut worker = worker.lock().await;
        let _ = worker.handle(message).await;
    });
}

/// Install the message handler on the worker scope
pub fn start() {
    let scope: web_sys::DedicatedWorkerGlobalScope = match js_sys::global().dyn_into() {
        Ok(scope) => scope,
        Err(_) => {
            console_log!("[worker] not running in a dedicated worker");
            return;
        }
    };

    let handler_scope = scope.clone();
    let onmessage = Closure::wrap(Box::new(move |event: web_sys::MessageEvent| {
        on_message(event, &handler_scope);
    }) as Box<dyn FnMut(web_sys::MessageEvent)>);
    scope.set_onmessage(Some(onmessage.as_ref().unchecked_ref()));
    onmessage.forget();
    console_log!("[worker] listening");
}
