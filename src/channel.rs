//! Message boundary with the controlling thread
//!
//! Messages are JSON objects tagged by `id`. Commands come in, output and
//! input requests go out.

use crate::config::ToolchainConfig;
use crate::error::{RuntimeError, RuntimeResult};
use serde::{Deserialize, Serialize};
use std::cell::RefCell;

/// A file shipped with a run request
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SourceFile {
    pub name: String,
    pub contents: String,
}

/// Commands from the controlling thread
///
/// `init` also carries a message port and an optional shared buffer; those
/// are platform objects and are extracted by the platform layer.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(tag = "id", rename_all = "camelCase")]
pub enum Inbound {
    Init {
        #[serde(default)]
        config: Option<ToolchainConfig>,
    },
    #[serde(rename_all = "camelCase")]
    RunSource {
        active_file_name: String,
        files: Vec<SourceFile>,
    },
    #[serde(rename_all = "camelCase")]
    RunCommand {
        /// Opaque to us; echoed back in `commandCompleted`
        token: serde_json::Value,
        active_file_name: String,
        command_lines: Vec<String>,
        files: Vec<SourceFile>,
    },
}

impl Inbound {
    pub fn from_json(json: &str) -> RuntimeResult<Self> {
        serde_json::from_str(json).map_err(|e| RuntimeError::Protocol {
            reason: e.to_string(),
        })
    }
}

/// Events for the controlling thread
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "id", rename_all = "camelCase")]
pub enum Outbound {
    /// Toolchain loaded, run requests accepted
    Ready,
    /// Append text to the terminal
    Write { text: String },
    /// A guest is blocked on stdin; write the shared buffer and signal
    ReadStdinRequest,
    RunCompleted,
    CommandCompleted { token: serde_json::Value },
}

impl Outbound {
    pub fn write(text: impl Into<String>) -> Self {
        Self::Write { text: text.into() }
    }

    pub fn to_json(&self) -> String {
        // Only strings and JSON values inside, serialization cannot fail
        serde_json::to_string(self).unwrap_or_default()
    }
}

/// Sink for outbound events
pub trait HostChannel {
    fn post(&self, event: Outbound);
}

/// Channel that keeps every event, for tools and tests
#[derive(Default)]
pub struct BufferedChannel {
    events: RefCell<Vec<Outbound>>,
}

impl BufferedChannel {
    pub fn new() -> Self {
        Self::default()
    }

    /// Snapshot of all events posted so far
    pub fn events(&self) -> Vec<Outbound> {
        self.events.borrow().clone()
    }

    /// Remove and return all events posted so far
    pub fn take(&self) -> Vec<Outbound> {
        std::mem::take(&mut *self.events.borrow_mut())
    }

    /// Concatenated text of all `write` events
    pub fn text(&self) -> String {
        self.events
            .borrow()
            .iter()
            .filter_map(|event| match event {
                Outbound::Write { text } => Some(text.as_str()),
                _ => None,
            })
            .collect()
    }
}

impl HostChannel for BufferedChannel {
    fn post(&self, event: Outbound) {
        self.events.borrow_mut().push(event);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_parse_run_source() {
        let msg = Inbound::from_json(
            r#"{"id":"runSource","activeFileName":"main.c",
                "files":[{"name":"main.c","contents":"int main(){}"}]}"#,
        )
        .unwrap();
        assert_eq!(
            msg,
            Inbound::RunSource {
                active_file_name: "main.c".to_string(),
                files: vec![SourceFile {
                    name: "main.c".to_string(),
                    contents: "int main(){}".to_string(),
                }],
            }
        );
    }

    #[test]
    fn test_parse_run_command_keeps_token() {
        let msg = Inbound::from_json(
            r#"{"id":"runCommand","token":{"button":3},"activeFileName":"a.cc",
                "commandLines":["clang++ -c <filename>"],"files":[]}"#,
        )
        .unwrap();
        match msg {
            Inbound::RunCommand {
                token,
                command_lines,
                ..
            } => {
                assert_eq!(token, json!({"button": 3}));
                assert_eq!(command_lines, vec!["clang++ -c <filename>"]);
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn test_parse_init_without_config() {
        assert_eq!(
            Inbound::from_json(r#"{"id":"init"}"#).unwrap(),
            Inbound::Init { config: None }
        );
    }

    #[test]
    fn test_unknown_message_is_protocol_error() {
        assert!(matches!(
            Inbound::from_json(r#"{"id":"reboot"}"#),
            Err(RuntimeError::Protocol { .. })
        ));
    }

    #[test]
    fn test_outbound_wire_format() {
        assert_eq!(Outbound::Ready.to_json(), r#"{"id":"ready"}"#);
        assert_eq!(
            Outbound::write("Hello\n").to_json(),
            r#"{"id":"write","text":"Hello\n"}"#
        );
        assert_eq!(
            Outbound::ReadStdinRequest.to_json(),
            r#"{"id":"readStdinRequest"}"#
        );
        assert_eq!(
            Outbound::CommandCompleted { token: json!(7) }.to_json(),
            r#"{"id":"commandCompleted","token":7}"#
        );
    }

    #[test]
    fn test_buffered_channel_text() {
        let channel = BufferedChannel::new();
        channel.post(Outbound::write("a"));
        channel.post(Outbound::ReadStdinRequest);
        channel.post(Outbound::write("b"));
        assert_eq!(channel.text(), "ab");
        assert_eq!(channel.take().len(), 3);
        assert!(channel.events().is_empty());
    }
}
