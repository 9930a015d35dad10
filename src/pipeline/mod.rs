//! Compile, link and run
//!
//! The orchestrator owns the filesystem, the module cache and the engine.
//! Every stage reads its input artifact from the shared VFS and leaves its
//! output there for the next one:
//!
//! ```text
//! source --clang--> <stem>.o --wasm-ld--> <stem>.wasm --run--> terminal
//! ```
//!
//! Stages only suspend while a toolchain module is fetched or compiled.
//! Guest execution itself is synchronous.

mod cache;
pub mod command;
mod timed;

pub use cache::ModuleCache;
pub use timed::{Timed, timed};

use crate::bridge::{Bridge, DiagnosticRewriter};
use crate::config::ToolchainConfig;
use crate::console_log;
use crate::error::{RuntimeError, RuntimeResult};
use crate::guest::{Engine, GuestRuntime, ModuleValidator, Termination};
use crate::platform::now_ms;
use crate::vfs::{ArchiveLoader, ArchiveSummary, FsEngine, NodeKind, VirtualFileSystem, base_name};
use command::{DriverArgs, binary_path, object_path, tokenize};
use std::cell::Cell;
use std::fmt;
use std::rc::Rc;

/// One step of the pipeline
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Stage {
    Compile,
    Link,
    Run,
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Stage::Compile => write!(f, "compile"),
            Stage::Link => write!(f, "link"),
            Stage::Run => write!(f, "run"),
        }
    }
}

/// Source language, decided by file extension
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Language {
    C,
    Cxx,
    Python,
}

impl Language {
    pub fn from_file_name(name: &str) -> Option<Self> {
        let (_, ext) = base_name(name).rsplit_once('.')?;
        match ext {
            "c" => Some(Language::C),
            // `.C` is C++ by convention, unlike `.c`
            "cc" | "cpp" | "cxx" | "C" => Some(Language::Cxx),
            "py" => Some(Language::Python),
            _ => None,
        }
    }

    /// Value for the front-end's `-x` flag
    pub fn clang_name(self) -> Option<&'static str> {
        match self {
            Language::C => Some("c"),
            Language::Cxx => Some("c++"),
            Language::Python => None,
        }
    }
}

/// Drives the toolchain modules over one shared filesystem
pub struct PipelineOrchestrator<E: Engine> {
    engine: E,
    config: ToolchainConfig,
    bridge: Rc<Bridge>,
    fs: Rc<E::Fs>,
    vfs: VirtualFileSystem,
    cache: ModuleCache<E>,
    /// Guests started so far; varies each guest's random seed
    launches: Cell<u64>,
}

impl<E: Engine> PipelineOrchestrator<E> {
    /// Instantiate the filesystem engine and seed it from the sysroot archive
    pub async fn boot(engine: E, bridge: Rc<Bridge>, config: ToolchainConfig) -> RuntimeResult<Self> {
        let show = config.show_timing;

        let fs = timed(
            format!("instantiated {}", config.memfs_module),
            show,
            engine.instantiate_fs(&config.memfs_module, Rc::clone(&bridge)),
        )
        .await?;
        let fs_engine: Rc<dyn FsEngine> = fs.clone();
        let vfs = VirtualFileSystem::new(fs_engine);

        let archive = timed(
            format!("fetched {}", config.sysroot_archive),
            show,
            engine.fetch(&config.sysroot_archive),
        )
        .await?;

        let started = now_ms();
        let summary = ArchiveLoader::new().load(&archive, &vfs)?;
        if show {
            console_log!(
                "[pipeline] untarred {} in {:.0}ms",
                config.sysroot_archive,
                now_ms() - started
            );
        }
        log_summary(&summary);

        Ok(Self {
            engine,
            config,
            bridge,
            fs,
            vfs,
            cache: ModuleCache::new(),
            launches: Cell::new(0),
        })
    }

    pub fn config(&self) -> &ToolchainConfig {
        &self.config
    }

    pub fn vfs(&self) -> &VirtualFileSystem {
        &self.vfs
    }

    pub fn fs(&self) -> &Rc<E::Fs> {
        &self.fs
    }

    pub fn bridge(&self) -> &Rc<Bridge> {
        &self.bridge
    }

    pub fn cache(&self) -> &ModuleCache<E> {
        &self.cache
    }

    /// Write the source, then compile it to `object_path`
    pub async fn compile(
        &mut self,
        source_path: &str,
        source_text: &str,
        object_path: &str,
        language: Language,
    ) -> RuntimeResult<()> {
        self.vfs
            .add_file(source_path, source_text)
            .map_err(|e| e.in_stage(Stage::Compile))?;
        self.compile_file(source_path, object_path, language, None).await
    }

    /// Compile a source already in the filesystem
    ///
    /// `opt_level` overrides the configured level.
    pub async fn compile_file(
        &mut self,
        source_path: &str,
        object_path: &str,
        language: Language,
        opt_level: Option<&str>,
    ) -> RuntimeResult<()> {
        self.compile_stage(source_path, object_path, language, opt_level)
            .await
            .map_err(|e| e.in_stage(Stage::Compile))
    }

    async fn compile_stage(
        &mut self,
        source_path: &str,
        object_path: &str,
        language: Language,
        opt_level: Option<&str>,
    ) -> RuntimeResult<()> {
        self.require(source_path)?;
        let lang = language.clang_name().ok_or_else(|| RuntimeError::CommandNotFound {
            name: format!("compiler for {}", source_path),
        })?;
        let opt = opt_level.unwrap_or(self.config.opt_level.as_str()).to_string();
        let args = self.clang_args(source_path, object_path, lang, &opt);

        self.bridge.set_rewriter(Some(DiagnosticRewriter::new(
            source_path,
            base_name(source_path),
        )));
        let module = self.config.clang_module.clone();
        let outcome = self.run_tool(&module, "clang", args).await;
        self.bridge.set_rewriter(None);
        outcome?;

        self.require(object_path)
    }

    fn clang_args(&self, source: &str, object: &str, lang: &str, opt: &str) -> Vec<String> {
        let resource_include = format!("/lib/clang/{}/include", self.config.clang_version);
        let mut args: Vec<String> = [
            "-cc1",
            "-emit-obj",
            "-disable-free",
            "-isysroot",
            "/",
            "-internal-isystem",
            "/include/c++/v1",
            "-internal-isystem",
            "/include",
            "-internal-isystem",
            resource_include.as_str(),
            "-ferror-limit",
        ]
        .iter()
        .map(|s| s.to_string())
        .collect();
        args.push(self.config.error_limit.to_string());
        args.push("-fmessage-length".to_string());
        args.push(self.config.message_length.to_string());
        args.push("-fcolor-diagnostics".to_string());
        args.push(format!("-O{}", opt));
        args.extend(["-o", object, "-x", lang, source].map(String::from));
        args
    }

    /// Link one object into an executable
    pub async fn link(&mut self, object_path: &str, output_path: &str) -> RuntimeResult<()> {
        self.link_objects(&[object_path.to_string()], output_path).await
    }

    pub async fn link_objects(&mut self, objects: &[String], output_path: &str) -> RuntimeResult<()> {
        self.link_stage(objects, output_path)
            .await
            .map_err(|e| e.in_stage(Stage::Link))
    }

    async fn link_stage(&mut self, objects: &[String], output_path: &str) -> RuntimeResult<()> {
        for object in objects {
            self.require(object)?;
        }
        let args = self.lld_args(objects, output_path);
        let module = self.config.lld_module.clone();
        self.run_tool(&module, "wasm-ld", args).await?;
        self.require(output_path)
    }

    fn lld_args(&self, objects: &[String], output: &str) -> Vec<String> {
        let lib_dir = &self.config.lib_dir;
        let mut args = vec![
            "--no-threads".to_string(),
            "--export-dynamic".to_string(),
            "-z".to_string(),
            format!("stack-size={}", self.config.stack_size),
            format!("-L{}", lib_dir),
            format!("{}/crt1.o", lib_dir),
        ];
        args.extend(objects.iter().cloned());
        args.extend(self.config.libs.iter().map(|lib| format!("-l{}", lib)));
        args.push("-o".to_string());
        args.push(output.to_string());
        args
    }

    /// Validate, compile and run a linked binary from the filesystem
    pub async fn run(&mut self, binary_path: &str, args: &[String]) -> RuntimeResult<Termination> {
        self.run_stage(binary_path, args)
            .await
            .map_err(|e| e.in_stage(Stage::Run))
    }

    async fn run_stage(&mut self, binary_path: &str, args: &[String]) -> RuntimeResult<Termination> {
        self.require(binary_path)?;
        let bytes = self.vfs.get_file_contents(binary_path)?;
        ModuleValidator::validate(&bytes)?;

        // user binaries change between runs; never cached
        let module = self.engine.compile_bytes(&bytes).await?;
        let program = base_name(binary_path).to_string();
        self.echo(&program, args);
        self.runtime().run(&module, &program, args)
    }

    /// Compile, link and run one source file
    pub async fn compile_link_run(
        &mut self,
        file_name: &str,
        source_text: &str,
        args: &[String],
    ) -> RuntimeResult<Termination> {
        let language = Language::from_file_name(file_name).unwrap_or(Language::C);
        let object = object_path(file_name);
        let binary = binary_path(file_name);

        self.compile(file_name, source_text, &object, language).await?;
        self.link(&object, &binary).await?;
        self.run(&binary, args).await
    }

    /// Execute one command line from a `runCommand` request
    pub async fn run_command_line(&mut self, line: &str) -> RuntimeResult<()> {
        let tokens = tokenize(line);
        let Some((name, args)) = tokens.split_first() else {
            return Ok(());
        };

        match name.as_str() {
            "clang" => self.drive(Language::C, args).await,
            "clang++" => self.drive(Language::Cxx, args).await,
            "wasm-ld" | "lld" => {
                let module = self.config.lld_module.clone();
                self.run_tool(&module, "wasm-ld", args.to_vec())
                    .await
                    .map(|_| ())
                    .map_err(|e| e.in_stage(Stage::Link))
            }
            "run" => match args.split_first() {
                Some((binary, rest)) => self.run(binary, rest).await.map(|_| ()),
                None => Err(RuntimeError::CommandNotFound {
                    name: "run".to_string(),
                }),
            },
            path if self.is_binary(path)? => self.run(path, args).await.map(|_| ()),
            other => Err(RuntimeError::CommandNotFound {
                name: other.to_string(),
            }),
        }
    }

    /// Emulate the compiler driver: compile each source, then link
    async fn drive(&mut self, language: Language, args: &[String]) -> RuntimeResult<()> {
        if args.iter().any(|arg| arg == "-cc1") {
            let module = self.config.clang_module.clone();
            return self
                .run_tool(&module, "clang", args.to_vec())
                .await
                .map(|_| ())
                .map_err(|e| e.in_stage(Stage::Compile));
        }

        let driver = DriverArgs::parse(args, language).map_err(|reason| {
            RuntimeError::StageFailed {
                stage: Stage::Compile,
                cause: Box::new(RuntimeError::Protocol { reason }),
            }
        })?;

        let mut objects = driver.objects.clone();
        for (source, lang) in &driver.sources {
            let object = match (&driver.output, driver.compile_only) {
                (Some(output), true) => output.clone(),
                _ => object_path(source),
            };
            self.compile_file(source, &object, *lang, driver.opt_level.as_deref())
                .await?;
            objects.push(object);
        }

        if driver.compile_only {
            return Ok(());
        }
        let output = driver.output.as_deref().unwrap_or("a.out");
        self.link_objects(&objects, output).await
    }

    /// Fetch (once), compile (once) and run a toolchain module
    async fn run_tool(&mut self, module_name: &str, program: &str, args: Vec<String>) -> RuntimeResult<Termination> {
        let show = self.config.show_timing;
        let module = timed(
            format!("{} ready", module_name),
            show && !self.cache.contains(module_name),
            self.cache.get_or_compile(&self.engine, module_name),
        )
        .await?;

        self.echo(program, &args);
        let started = now_ms();
        let termination = self.runtime().run(&module, program, &args);
        if show {
            console_log!("[pipeline] {} ran in {:.0}ms", program, now_ms() - started);
        }
        termination
    }

    fn runtime(&self) -> GuestRuntime<'_, E> {
        let launch = self.launches.get() + 1;
        self.launches.set(launch);
        GuestRuntime::new(
            &self.engine,
            Rc::clone(&self.bridge),
            Rc::clone(self.vfs.engine()),
            self.config.environ(),
        )
        .with_seed(0x2545_F491_4F6C_DD1D_u64.wrapping_mul(launch))
    }

    fn echo(&self, program: &str, args: &[String]) {
        if self.config.echo_commands {
            self.bridge.emit(&format!("> {} {}\n", program, args.join(" ")));
        }
    }

    fn is_binary(&self, path: &str) -> RuntimeResult<bool> {
        if self.vfs.kind_of(path) == Some(NodeKind::Directory) {
            return Ok(false);
        }
        self.vfs.exists(path)
    }

    fn require(&self, path: &str) -> RuntimeResult<()> {
        if self.vfs.exists(path)? {
            Ok(())
        } else {
            Err(RuntimeError::NotFound {
                path: path.to_string(),
            })
        }
    }
}

fn log_summary(summary: &ArchiveSummary) {
    console_log!(
        "[vfs] sysroot: {} files, {} directories, {} bytes",
        summary.files,
        summary.directories,
        summary.bytes
    );
}
