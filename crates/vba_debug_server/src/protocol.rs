//! Debug Adapter Protocol messages and Content-Length framing.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::io;
use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncReadExt, AsyncWrite, AsyncWriteExt};

/// Upper bound on a single message body.
pub const MAX_MESSAGE_LEN: usize = 16 * 1024 * 1024;

pub const THREAD_ID: u64 = 1;

#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct Request {
    pub seq: u64,
    pub command: String,
    #[serde(default)]
    pub arguments: Value,
}

impl Request {
    pub fn from_value(value: Value) -> Result<Self, String> {
        match value.get("type").and_then(Value::as_str) {
            Some("request") => {}
            Some(other) => return Err(format!("expected a request, got '{other}'")),
            None => return Err("message has no type".to_string()),
        }
        serde_json::from_value(value).map_err(|e| format!("malformed request: {e}"))
    }

    /// Typed arguments; absent arguments deserialize from an empty object.
    pub fn arguments<T: for<'de> Deserialize<'de>>(&self) -> Result<T, String> {
        let arguments = match &self.arguments {
            Value::Null => Value::Object(Default::default()),
            other => other.clone(),
        };
        serde_json::from_value(arguments)
            .map_err(|e| format!("invalid arguments for '{}': {e}", self.command))
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum Outgoing {
    Response {
        request_seq: u64,
        success: bool,
        command: String,
        #[serde(skip_serializing_if = "Option::is_none")]
        message: Option<String>,
        #[serde(skip_serializing_if = "Option::is_none")]
        body: Option<Value>,
    },
    Event {
        event: String,
        #[serde(skip_serializing_if = "Option::is_none")]
        body: Option<Value>,
    },
}

impl Outgoing {
    pub fn success(request: &Request, body: Option<Value>) -> Self {
        Outgoing::Response {
            request_seq: request.seq,
            success: true,
            command: request.command.clone(),
            message: None,
            body,
        }
    }

    pub fn failure(request_seq: u64, command: &str, message: impl Into<String>) -> Self {
        let message = message.into();
        Outgoing::Response {
            request_seq,
            success: false,
            command: command.to_string(),
            body: Some(serde_json::json!({ "error": { "id": 1, "format": message.clone() } })),
            message: Some(message),
        }
    }

    pub fn event(event: &str, body: Option<Value>) -> Self {
        Outgoing::Event {
            event: event.to_string(),
            body,
        }
    }
}

#[derive(Debug, Serialize)]
struct Envelope<'a> {
    seq: u64,
    #[serde(flatten)]
    message: &'a Outgoing,
}

// Arguments

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InitializeArguments {
    #[serde(rename = "clientID")]
    pub client_id: Option<String>,
    #[serde(rename = "adapterID")]
    pub adapter_id: Option<String>,
    pub lines_start_at1: Option<bool>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StartArguments {
    /// Open document to debug, e.g. `Book1.xlsm`.
    #[serde(alias = "program", alias = "file")]
    pub document: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Source {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub path: Option<String>,
}

impl Source {
    /// Module name for a source: the file stem of its path or name.
    pub fn module_name(&self) -> Option<String> {
        let raw = self.path.as_deref().or(self.name.as_deref())?;
        let file = raw.rsplit(['/', '\\']).next().unwrap_or(raw);
        let stem = match file.rsplit_once('.') {
            Some((stem, _)) if !stem.is_empty() => stem,
            _ => file,
        };
        (!stem.is_empty()).then(|| stem.to_string())
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SourceBreakpoint {
    pub line: u32,
    pub condition: Option<String>,
    pub hit_condition: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SetBreakpointsArguments {
    pub source: Source,
    pub breakpoints: Option<Vec<SourceBreakpoint>>,
    /// Deprecated form some clients still send.
    pub lines: Option<Vec<u32>>,
}

impl SetBreakpointsArguments {
    pub fn requested_lines(&self) -> Vec<u32> {
        match &self.breakpoints {
            Some(breakpoints) => breakpoints.iter().map(|bp| bp.line).collect(),
            None => self.lines.clone().unwrap_or_default(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ScopesArguments {
    pub frame_id: u64,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct VariablesArguments {
    pub variables_reference: u64,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EvaluateArguments {
    pub expression: String,
    pub frame_id: Option<u64>,
    pub context: Option<String>,
}

// Bodies

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Capabilities {
    pub supports_configuration_done_request: bool,
    pub supports_evaluate_for_hovers: bool,
    pub supports_conditional_breakpoints: bool,
    pub supports_hit_conditional_breakpoints: bool,
    pub supports_step_back: bool,
    pub supports_set_variable: bool,
    pub supports_restart_frame: bool,
    pub supports_terminate_request: bool,
}

impl Default for Capabilities {
    fn default() -> Self {
        Self {
            supports_configuration_done_request: true,
            supports_evaluate_for_hovers: true,
            supports_conditional_breakpoints: false,
            supports_hit_conditional_breakpoints: false,
            supports_step_back: false,
            supports_set_variable: false,
            supports_restart_frame: false,
            supports_terminate_request: false,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ProtocolBreakpoint {
    pub id: u64,
    pub verified: bool,
    pub line: u32,
    pub source: Source,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ProtocolStackFrame {
    pub id: u32,
    pub name: String,
    pub source: Source,
    pub line: u32,
    pub column: u32,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ProtocolScope {
    pub name: String,
    pub presentation_hint: &'static str,
    pub variables_reference: u64,
    pub expensive: bool,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ProtocolVariable {
    pub name: String,
    pub value: String,
    #[serde(rename = "type", skip_serializing_if = "Option::is_none")]
    pub type_name: Option<String>,
    pub variables_reference: u64,
}

/// Reads one framed message. Returns `Ok(None)` on a clean end of stream.
pub async fn read_message<R>(reader: &mut R) -> io::Result<Option<Value>>
where
    R: AsyncBufRead + Unpin,
{
    let mut content_length: Option<usize> = None;
    let mut first = true;

    loop {
        let mut line = String::new();
        let bytes_read = reader.read_line(&mut line).await?;
        if bytes_read == 0 {
            if first {
                return Ok(None);
            }
            return Err(io::Error::new(
                io::ErrorKind::UnexpectedEof,
                "stream closed while reading message headers",
            ));
        }
        first = false;

        let trimmed = line.trim_end_matches(&['\r', '\n'][..]);
        if trimmed.is_empty() {
            break;
        }

        if let Some((key, value)) = trimmed.split_once(':') {
            if key.trim().eq_ignore_ascii_case("content-length") {
                let parsed = value.trim().parse::<usize>().map_err(|e| {
                    io::Error::new(
                        io::ErrorKind::InvalidData,
                        format!("invalid Content-Length value: {e}"),
                    )
                })?;
                content_length = Some(parsed);
            }
        }
    }

    let length = content_length.ok_or_else(|| {
        io::Error::new(
            io::ErrorKind::InvalidData,
            "missing required Content-Length header",
        )
    })?;
    if length > MAX_MESSAGE_LEN {
        return Err(io::Error::new(
            io::ErrorKind::InvalidData,
            format!("message of {length} bytes exceeds the limit"),
        ));
    }

    let mut body = vec![0_u8; length];
    reader.read_exact(&mut body).await?;
    serde_json::from_slice::<Value>(&body).map(Some).map_err(|e| {
        io::Error::new(
            io::ErrorKind::InvalidData,
            format!("invalid JSON payload: {e}"),
        )
    })
}

pub async fn write_message<W>(writer: &mut W, seq: u64, message: &Outgoing) -> io::Result<()>
where
    W: AsyncWrite + Unpin,
{
    let body = serde_json::to_string(&Envelope { seq, message })?;
    let framed = format!("Content-Length: {}\r\n\r\n{}", body.len(), body);
    writer.write_all(framed.as_bytes()).await?;
    writer.flush().await
}
