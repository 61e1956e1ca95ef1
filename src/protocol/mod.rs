//! Jupyter kernel wire protocol message types.
//!
//! See the [Messaging in Jupyter](https://jupyter-client.readthedocs.io/en/stable/messaging.html)
//! page for documentation about how this works. Messages travel over four
//! channels multiplexed onto one WebSocket (`shell`, `iopub`, `stdin`,
//! `control`); the wire framing is handled by [`codec`], and structural
//! sanity checks live in [`validator`].

use std::collections::BTreeMap;

use bytes::Bytes;
use serde::{de::DeserializeOwned, Deserialize, Serialize};
use serde_json::{Map, Value};
use time::OffsetDateTime;
use uuid::Uuid;

use crate::error::Error;

pub mod codec;
pub mod validator;

/// Which of the four multiplexed channels a message travels on.
#[derive(Serialize, Deserialize, Clone, Copy, Debug, PartialEq, Eq, Hash)]
#[serde(rename_all = "lowercase")]
pub enum Channel {
    /// Main channel for code execution and info requests.
    Shell,
    /// Broadcast channel for side effects and status.
    IoPub,
    /// Kernel-to-client requests for interactive input.
    Stdin,
    /// Like Shell, but kept separate so interrupts aren't queued behind it.
    Control,
}

impl Channel {
    /// The literal string used for this channel on the wire.
    pub fn as_str(self) -> &'static str {
        match self {
            Channel::Shell => "shell",
            Channel::IoPub => "iopub",
            Channel::Stdin => "stdin",
            Channel::Control => "control",
        }
    }

    /// Parse a channel from its wire literal.
    pub fn parse(s: &str) -> Option<Channel> {
        match s {
            "shell" => Some(Channel::Shell),
            "iopub" => Some(Channel::IoPub),
            "stdin" => Some(Channel::Stdin),
            "control" => Some(Channel::Control),
            _ => None,
        }
    }
}

/// Type of a kernel wire protocol message, either request or reply.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
#[non_exhaustive]
pub enum KernelMessageType {
    /// Execute a block of code.
    ExecuteRequest,
    /// Return execution results.
    ExecuteReply,
    /// Request detailed information about a piece of code.
    InspectRequest,
    /// Return detailed information about the inspected code.
    InspectReply,
    /// Request code completions or suggestions.
    CompleteRequest,
    /// Return completions or suggestions for the code.
    CompleteReply,
    /// Request execution history.
    HistoryRequest,
    /// Return the requested execution history.
    HistoryReply,
    /// Request to check if code is complete.
    IsCompleteRequest,
    /// Reply indicating if code is complete.
    IsCompleteReply,
    /// Request information about existing comms.
    CommInfoRequest,
    /// Reply with information about existing comms.
    CommInfoReply,
    /// Request kernel information.
    KernelInfoRequest,
    /// Reply with kernel information.
    KernelInfoReply,
    /// Request kernel shutdown.
    ShutdownRequest,
    /// Reply to confirm kernel shutdown.
    ShutdownReply,
    /// Request to interrupt kernel execution.
    InterruptRequest,
    /// Reply to confirm kernel interruption.
    InterruptReply,
    /// Kernel-to-client request for standard input.
    InputRequest,
    /// Client-to-kernel reply on the stdin channel.
    InputReply,
    /// Open a comm channel.
    CommOpen,
    /// Send a message over an already-open comm channel.
    CommMsg,
    /// Close a comm channel.
    CommClose,
    /// Streams of output (stdout, stderr) from the kernel.
    Stream,
    /// Bring back data to be displayed in frontends.
    DisplayData,
    /// Update display data with new information.
    UpdateDisplayData,
    /// Re-broadcast of code in ExecuteRequest.
    ExecuteInput,
    /// Results of a code execution.
    ExecuteResult,
    /// When an error occurs during code execution.
    Error,
    /// Updates about kernel status.
    Status,
    /// Clear output visible on the frontend.
    ClearOutput,
    /// Another kernel message type that is unrecognized.
    #[serde(untagged)]
    Other(String),
}

/// Header of a message, the `{header, parent_header, metadata, content,
/// buffers}` 5-tuple plus the channel it travels on.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
pub struct KernelHeader {
    /// Unique per message; the correlation key used to match replies.
    pub msg_id: String,
    /// Unique per client session.
    pub session: String,
    /// The username of the user sending the message.
    pub username: String,
    /// ISO 8601 timestamp for when the message is created.
    #[serde(with = "time::serde::iso8601")]
    pub date: OffsetDateTime,
    /// The message type.
    pub msg_type: KernelMessageType,
    /// Message protocol version.
    pub version: String,
}

/// A message sent to or received from a Jupyter kernel.
#[derive(Clone, Debug, PartialEq)]
pub struct KernelMessage<T = Value> {
    /// The message header.
    pub header: KernelHeader,
    /// The parent message header, if any.
    pub parent_header: Option<KernelHeader>,
    /// Which of the four channels this message travels on.
    pub channel: Channel,
    /// Free-form metadata.
    pub metadata: Map<String, Value>,
    /// The content of the message.
    pub content: T,
    /// Buffers for large data, if any (used by extensions).
    pub buffers: Vec<Bytes>,
}

impl<T> KernelMessage<T> {
    /// Create a basic kernel message with the given header and content.
    pub fn new(channel: Channel, msg_type: KernelMessageType, session: &str, content: T) -> Self {
        Self {
            header: KernelHeader {
                msg_id: Uuid::new_v4().to_string(),
                session: session.to_string(),
                username: "username".to_string(),
                date: OffsetDateTime::now_utc(),
                msg_type,
                version: "5.4".into(),
            },
            parent_header: None,
            channel,
            metadata: Map::new(),
            content,
            buffers: Vec::new(),
        }
    }
}

impl<T: Serialize> KernelMessage<T> {
    /// Produce a variant of the message with its content serialized as JSON.
    pub fn into_json(self) -> KernelMessage {
        KernelMessage {
            header: self.header,
            parent_header: self.parent_header,
            channel: self.channel,
            metadata: self.metadata,
            content: serde_json::to_value(&self.content).expect("KernelMessage JSON content"),
            buffers: self.buffers,
        }
    }
}

impl KernelMessage {
    /// Deserialize the content of the message into a specific type.
    pub fn into_typed<T: DeserializeOwned>(self) -> Result<KernelMessage<T>, Error> {
        Ok(KernelMessage {
            header: self.header,
            parent_header: self.parent_header,
            channel: self.channel,
            metadata: self.metadata,
            content: serde_json::from_value(self.content)
                .map_err(|err| Error::MalformedModel(err.to_string()))?,
            buffers: self.buffers,
        })
    }
}

/// The content of a reply to a kernel message, with status attached.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum Reply<T> {
    /// The request was processed successfully.
    Ok(T),
    /// The request failed due to an error.
    Error(ErrorReply),
    /// Same as `status="error"` but with no information about the error.
    #[serde(alias = "aborted")]
    Abort,
}

/// Content of an error response message.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
pub struct ErrorReply {
    /// The error name, such as 'NameError'.
    pub ename: String,
    /// The error message.
    pub evalue: String,
    /// The traceback frames of the error.
    pub traceback: Vec<String>,
}

/// Execute code on behalf of the user.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
pub struct ExecuteRequest {
    /// Source code to be executed by the kernel, one or more lines.
    pub code: String,
    /// If true, signals the kernel to execute the code as quietly as
    /// possible.
    pub silent: bool,
    /// If true, signals the kernel to populate the history.
    pub store_history: bool,
    /// Expressions to be evaluated in the user's namespace after execution.
    pub user_expressions: BTreeMap<String, String>,
    /// If true, code running in the kernel can prompt for input.
    pub allow_stdin: bool,
    /// If true, aborts the execution queue if an exception is encountered.
    pub stop_on_error: bool,
}

impl Default for ExecuteRequest {
    fn default() -> Self {
        ExecuteRequest {
            code: String::new(),
            silent: false,
            store_history: true,
            user_expressions: BTreeMap::new(),
            allow_stdin: true,
            stop_on_error: false,
        }
    }
}

impl ExecuteRequest {
    /// Build a request for the given code, with the default field values
    /// from spec.md's `execute()` wrapper.
    pub fn new(code: impl Into<String>) -> Self {
        ExecuteRequest {
            code: code.into(),
            ..Default::default()
        }
    }
}

/// Represents a reply to an execute request.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
pub struct ExecuteReply {
    /// The execution count, which increments with each request that stores
    /// history.
    pub execution_count: i64,
    /// Results for the user expressions evaluated during execution.
    #[serde(default)]
    pub user_expressions: Option<BTreeMap<String, Value>>,
}

/// Request for introspection of code.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
pub struct InspectRequest {
    /// The code context in which introspection is requested.
    pub code: String,
    /// The cursor position within 'code', in Unicode characters.
    pub cursor_pos: u32,
    /// 0 for basic info (`x?`), 1 for more detail (`x??`).
    pub detail_level: u8,
}

/// Represents a reply to an inspect request.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
pub struct InspectReply {
    /// Whether an object was found during inspection.
    pub found: bool,
    /// MIME bundle representing the inspected object.
    pub data: BTreeMap<String, Value>,
    /// Metadata associated with the data.
    pub metadata: BTreeMap<String, Value>,
}

/// Request for code completion.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
pub struct CompleteRequest {
    /// The code context in which completion is requested.
    pub code: String,
    /// The cursor position within 'code', in Unicode characters.
    pub cursor_pos: u32,
}

/// Represents a reply to a completion request.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
pub struct CompleteReply {
    /// All matches to the completion request.
    pub matches: Vec<String>,
    /// The starting position of the text to be replaced.
    pub cursor_start: u32,
    /// The ending position of the text to be replaced.
    pub cursor_end: u32,
    /// Metadata about the completions.
    pub metadata: BTreeMap<String, Value>,
}

/// Request for execution history (rarely used in practice).
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
pub struct HistoryRequest {
    /// Whether to include output in the history.
    pub output: bool,
    /// Whether to also return raw (non-transformed) history.
    pub raw: bool,
    /// One of `range`, `tail`, or `search`.
    pub hist_access_type: String,
    /// Session to get history from, 0 requesting all sessions.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub session: Option<i64>,
    /// First line to retrieve, for `range` access.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub start: Option<i64>,
    /// Last line to retrieve, for `range` access.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub stop: Option<i64>,
    /// Get the last n lines, for `tail` and `search` access.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub n: Option<i64>,
    /// Glob-style pattern, for `search` access.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub pattern: Option<String>,
    /// Only return the most recent occurrence of duplicate history, for
    /// `search` access.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub unique: Option<bool>,
}

/// Represents a reply to a history request. Each entry is `(session, line,
/// source)` or `(session, line, (source, output))` depending on `output`.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
pub struct HistoryReply {
    /// The returned history entries.
    pub history: Vec<Value>,
}

/// Request to check if code is complete.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
pub struct IsCompleteRequest {
    /// The code being checked for completeness.
    pub code: String,
}

/// Reply indicating if code is complete.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
pub struct IsCompleteReply {
    /// One of `complete`, `incomplete`, `invalid`, or `unknown`.
    pub status: String,
    /// If `incomplete`, the whitespace the frontend should insert on the
    /// next line.
    #[serde(default)]
    pub indent: String,
}

/// Request information about existing comms.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Default)]
pub struct CommInfoRequest {
    /// Only return comms with this target name, if given.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub target_name: Option<String>,
}

/// Reply with information about existing comms.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
pub struct CommInfoReply {
    /// Map from comm id to a small record naming its target.
    pub comms: BTreeMap<String, CommInfoEntry>,
}

/// One entry in a `comm_info_reply`.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
pub struct CommInfoEntry {
    /// The target name the comm was opened with.
    pub target_name: String,
}

/// Request for information about the kernel.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Default)]
pub struct KernelInfoRequest {}

/// Represents a reply to a kernel_info request.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
pub struct KernelInfoReply {
    /// Version of the messaging protocol used by the kernel.
    pub protocol_version: String,
    /// The name of the kernel implementation (e.g., 'ipython').
    pub implementation: String,
    /// The version of the kernel's implementation.
    pub implementation_version: String,
    /// Detailed information about the kernel's language.
    pub language_info: LanguageInfo,
    /// A banner of information about the kernel.
    pub banner: String,
    /// Whether the kernel supports debugging.
    #[serde(default)]
    pub debugger: bool,
    /// Available help links.
    #[serde(default)]
    pub help_links: Vec<HelpLink>,
}

/// One entry in a kernel_info_reply's `help_links`.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
pub struct HelpLink {
    /// Display text for the link.
    pub text: String,
    /// Target URL.
    pub url: String,
}

/// Detailed information about the programming language of the kernel.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
pub struct LanguageInfo {
    /// Name of the programming language.
    pub name: String,
    /// Version number of the language.
    pub version: String,
    /// MIME type for script files in this language.
    pub mimetype: String,
    /// File extension for script files in this language.
    pub file_extension: String,
    /// Nbconvert exporter, if notebooks are exported differently.
    #[serde(default)]
    pub nbconvert_exporter: String,
}

/// Request to shut down the kernel, possibly to prepare for a restart.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
pub struct ShutdownRequest {
    /// Whether the shutdown is final or precedes a restart.
    pub restart: bool,
}

/// Represents a reply to a shutdown request.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
pub struct ShutdownReply {
    /// Matches the restart flag from the request.
    pub restart: bool,
}

/// Request to interrupt the kernel's current operation.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Default)]
pub struct InterruptRequest {}

/// Represents a reply to an interrupt request.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Default)]
pub struct InterruptReply {}

/// Kernel-to-client request for standard input.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
pub struct InputRequest {
    /// Prompt text to show the user.
    pub prompt: String,
    /// Whether the input should be obscured (e.g. a password).
    #[serde(default)]
    pub password: bool,
}

/// Client-to-kernel reply on the stdin channel.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
pub struct InputReply {
    /// The text the user entered.
    pub value: String,
}

/// Streams of output from the kernel, such as stdout and stderr.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
pub struct Stream {
    /// The name of the stream, one of 'stdout' or 'stderr'.
    pub name: String,
    /// The text to be displayed in the stream.
    pub text: String,
}

/// Data to be displayed in frontends, such as images or HTML.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
pub struct DisplayData {
    /// MIME bundle to be displayed.
    pub data: BTreeMap<String, Value>,
    /// Metadata associated with the data.
    pub metadata: BTreeMap<String, Value>,
    /// Information not to be persisted to a notebook.
    #[serde(default)]
    pub transient: Option<DisplayDataTransient>,
}

/// Transient data associated with display data, such as display IDs.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Default)]
pub struct DisplayDataTransient {
    /// An ID for the display, which can be updated.
    pub display_id: Option<String>,
}

/// Re-broadcast of code in an execute request to let all frontends know.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
pub struct ExecuteInput {
    /// The code that was executed.
    pub code: String,
    /// The execution count.
    pub execution_count: i64,
}

/// Results of a code execution, such as the output or return value.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
pub struct ExecuteResult {
    /// The execution count.
    pub execution_count: i64,
    /// MIME bundle to be displayed; `text/plain` should always be present.
    pub data: BTreeMap<String, Value>,
    /// Metadata associated with the result.
    pub metadata: BTreeMap<String, Value>,
}

/// Used by frontends to monitor the status of the kernel.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
pub struct StatusContent {
    /// The iopub-reported execution state.
    pub execution_state: IoPubExecutionState,
}

/// The execution-state literal carried on iopub `status` messages. This is
/// a strict subset of [`crate::engine::KernelStatus`]: the wire protocol
/// never says `unknown` or `reconnecting`, those are states the engine
/// itself introduces around connection lifecycle.
#[derive(Serialize, Deserialize, Copy, Clone, Debug, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum IoPubExecutionState {
    /// The kernel is starting up; published exactly once at process start.
    Starting,
    /// The kernel is ready to execute code.
    Idle,
    /// The kernel is currently executing code.
    Busy,
    /// The kernel is restarting.
    Restarting,
    /// The kernel has died.
    Dead,
}

/// Request to clear output visible on the frontend.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
pub struct ClearOutput {
    /// If true, wait to clear until new output arrives.
    pub wait: bool,
}

/// Content of a `comm_open` message.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
pub struct CommOpen {
    /// Unique id for the comm, must be unique for the lifetime of the
    /// kernel.
    pub comm_id: String,
    /// Name used to route the comm to its handler on each side.
    pub target_name: String,
    /// Initial data for the comm.
    #[serde(default)]
    pub data: Map<String, Value>,
    /// Optional host-loadable module providing the target, used when no
    /// local target with this name is registered.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub target_module: Option<String>,
}

/// Content of a `comm_msg` message.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
pub struct CommMsg {
    /// The comm this message belongs to.
    pub comm_id: String,
    /// Message-specific data.
    #[serde(default)]
    pub data: Map<String, Value>,
}

/// Content of a `comm_close` message.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
pub struct CommClose {
    /// The comm being closed.
    pub comm_id: String,
    /// Final data sent with the close.
    #[serde(default)]
    pub data: Map<String, Value>,
}
