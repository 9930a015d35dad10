//! Request dispatch
//!
//! One `Worker` per worker thread. It owns the orchestrator once `init` has
//! booted it, and every request ends with exactly one completion event no
//! matter how it went. Failures the guest runtime has not already printed
//! are rendered here, once.

use crate::bridge::{Bridge, DiagnosticRewriter};
use crate::channel::{HostChannel, Inbound, Outbound, SourceFile};
use crate::config::ToolchainConfig;
use crate::console_log;
use crate::error::{RuntimeError, RuntimeResult};
use crate::guest::{Engine, highlight, render_error};
use crate::pipeline::command::substitute_filename;
use crate::pipeline::{Language, PipelineOrchestrator};
use crate::vfs::base_name;
use std::rc::Rc;

/// Token the interpreter's execution wrapper uses in place of a file name
pub const EXEC_TOKEN: &str = "<exec>";

/// What an interpreter run produced
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StageOutput {
    /// Bytes for the terminal
    Text(Vec<u8>),
    /// A value with no textual form; nothing is printed
    Opaque,
}

/// An interpreter run that raised
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InterpreterFailure {
    pub traceback: String,
}

/// Embedded high-level-language interpreter
pub trait Interpreter {
    fn run(&mut self, file_name: &str, source: &str) -> Result<StageOutput, InterpreterFailure>;
}

pub struct Worker<E: Engine> {
    channel: Rc<dyn HostChannel>,
    bridge: Rc<Bridge>,
    engine: Option<E>,
    orchestrator: Option<PipelineOrchestrator<E>>,
    interpreter: Option<Box<dyn Interpreter>>,
}

impl<E: Engine> Worker<E> {
    pub fn new(engine: E, channel: Rc<dyn HostChannel>) -> Self {
        let bridge = Rc::new(Bridge::new(Rc::clone(&channel)));
        Self {
            channel,
            bridge,
            engine: Some(engine),
            orchestrator: None,
            interpreter: None,
        }
    }

    /// The bridge every guest of this worker runs against
    pub fn bridge(&self) -> &Rc<Bridge> {
        &self.bridge
    }

    pub fn set_interpreter(&mut self, interpreter: Box<dyn Interpreter>) {
        self.interpreter = Some(interpreter);
    }

    pub fn orchestrator(&self) -> Option<&PipelineOrchestrator<E>> {
        self.orchestrator.as_ref()
    }

    pub fn is_ready(&self) -> bool {
        self.orchestrator.is_some()
    }

    /// Handle one request; the outcome has already been reported to the host
    pub async fn handle(&mut self, message: Inbound) -> RuntimeResult<()> {
        match message {
            Inbound::Init { config } => self.init(config.unwrap_or_default()).await,
            Inbound::RunSource {
                active_file_name,
                files,
            } => {
                let outcome = self.run_source(&active_file_name, &files).await;
                self.finish(outcome, Outbound::RunCompleted)
            }
            Inbound::RunCommand {
                token,
                active_file_name,
                command_lines,
                files,
            } => {
                let outcome = self
                    .run_command(&active_file_name, &command_lines, &files)
                    .await;
                self.finish(outcome, Outbound::CommandCompleted { token })
            }
        }
    }

    /// Boot the toolchain and announce readiness
    pub async fn init(&mut self, config: ToolchainConfig) -> RuntimeResult<()> {
        if self.orchestrator.is_some() {
            self.channel.post(Outbound::Ready);
            return Ok(());
        }
        let engine = self.engine.take().ok_or(RuntimeError::NotInitialized)?;

        match PipelineOrchestrator::boot(engine, Rc::clone(&self.bridge), config).await {
            Ok(orchestrator) => {
                console_log!("[worker] toolchain ready");
                self.orchestrator = Some(orchestrator);
                self.channel.post(Outbound::Ready);
                Ok(())
            }
            Err(err) => {
                console_log!("[worker] boot failed: {}", err);
                self.bridge.emit(&render_error(&err));
                Err(err)
            }
        }
    }

    async fn run_source(&mut self, active_file_name: &str, files: &[SourceFile]) -> RuntimeResult<()> {
        let orchestrator = self.orchestrator.as_mut().ok_or(RuntimeError::NotInitialized)?;
        write_files(orchestrator, files)?;

        let source = match files.iter().find(|f| f.name == active_file_name) {
            Some(file) => file.contents.clone(),
            None => {
                let bytes = orchestrator.vfs().get_file_contents(active_file_name)?;
                String::from_utf8_lossy(&bytes).into_owned()
            }
        };

        match Language::from_file_name(active_file_name) {
            Some(Language::Python) => self.interpret(active_file_name, &source),
            Some(_) => orchestrator
                .compile_link_run(active_file_name, &source, &[])
                .await
                .map(|_| ()),
            None => Err(RuntimeError::CommandNotFound {
                name: active_file_name.to_string(),
            }),
        }
    }

    async fn run_command(
        &mut self,
        active_file_name: &str,
        command_lines: &[String],
        files: &[SourceFile],
    ) -> RuntimeResult<()> {
        let orchestrator = self.orchestrator.as_mut().ok_or(RuntimeError::NotInitialized)?;
        write_files(orchestrator, files)?;

        let file_name = base_name(active_file_name);
        for line in command_lines {
            let line = substitute_filename(line, file_name);
            orchestrator.run_command_line(&line).await?;
        }
        Ok(())
    }

    fn interpret(&mut self, file_name: &str, source: &str) -> RuntimeResult<()> {
        let interpreter = self
            .interpreter
            .as_mut()
            .ok_or_else(|| RuntimeError::CommandNotFound {
                name: "python".to_string(),
            })?;

        match interpreter.run(file_name, source) {
            Ok(StageOutput::Text(bytes)) => {
                self.bridge.emit(&String::from_utf8_lossy(&bytes));
                Ok(())
            }
            Ok(StageOutput::Opaque) => Ok(()),
            Err(failure) => {
                let traceback = DiagnosticRewriter::new(EXEC_TOKEN, file_name).apply(&failure.traceback);
                self.bridge.emit(&highlight(&traceback));
                Err(RuntimeError::GuestTrap { message: traceback })
            }
        }
    }

    fn finish(&self, outcome: RuntimeResult<()>, completion: Outbound) -> RuntimeResult<()> {
        if let Err(err) = &outcome {
            console_log!("[worker] request failed: {}", err);
            if !err.is_reported() {
                self.bridge.emit(&render_error(err));
            }
        }
        self.channel.post(completion);
        outcome
    }
}

fn write_files<E: Engine>(orchestrator: &PipelineOrchestrator<E>, files: &[SourceFile]) -> RuntimeResult<()> {
    for file in files {
        orchestrator.vfs().add_file(&file.name, &file.contents)?;
    }
    Ok(())
}
