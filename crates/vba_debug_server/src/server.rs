//! Debug adapter front end: one [`Session`] per client connection, all
//! connections sharing the same target.

use crate::protocol::{
    read_message, write_message, Capabilities, EvaluateArguments, InitializeArguments, Outgoing,
    ProtocolBreakpoint, ProtocolScope, ProtocolStackFrame, ProtocolVariable, Request,
    ScopesArguments, SetBreakpointsArguments, Source, StartArguments, VariablesArguments, THREAD_ID,
};
use serde_json::{json, Value};
use std::fmt;
use std::io;
use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::io::{AsyncRead, AsyncWrite, BufReader};
use tokio::net::TcpListener;
use tokio::sync::mpsc;
use tracing::{debug, error, info, warn, Instrument};
use uuid::Uuid;
use vba_bridge_core::inspector::{StackFrame, VariableEntry};
use vba_bridge_core::session::{command_name, SessionEvent, StartKind};
use vba_bridge_core::{
    Breakpoint, CommandKind, DebugConfig, DebugError, MonitorEvent, Session, SessionId,
    SessionMode, TargetHandle,
};

/// Shown for a variable whose value the host could not produce.
pub const UNAVAILABLE: &str = "<unavailable>";

const EXECUTION_COMMANDS: [CommandKind; 5] = [
    CommandKind::Continue,
    CommandKind::StepOver,
    CommandKind::StepIn,
    CommandKind::StepOut,
    CommandKind::Pause,
];

pub const DEFAULT_BIND: &str = "127.0.0.1:5678";

/// How the binary exposes the server.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServerConfig {
    pub bind: String,
    pub stdio: bool,
    /// Directory of exported modules the target debugs.
    pub modules_dir: Option<PathBuf>,
    /// Load `modules_dir` into memory instead of editing the files in place.
    pub in_memory: bool,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind: DEFAULT_BIND.to_string(),
            stdio: false,
            modules_dir: None,
            in_memory: false,
        }
    }
}

pub struct Server {
    target: Arc<TargetHandle>,
    config: DebugConfig,
    next_session: AtomicU64,
}

impl Server {
    pub fn new(target: Arc<TargetHandle>, config: DebugConfig) -> Self {
        Self {
            target,
            config,
            // 0 belongs to system-owned bridge calls.
            next_session: AtomicU64::new(1),
        }
    }

    pub fn target(&self) -> &Arc<TargetHandle> {
        &self.target
    }

    pub fn config(&self) -> &DebugConfig {
        &self.config
    }

    fn next_session_id(&self) -> SessionId {
        self.next_session.fetch_add(1, Ordering::SeqCst)
    }

    /// Accepts clients until the listener fails.
    pub async fn serve_tcp(self: Arc<Self>, listener: TcpListener) -> io::Result<()> {
        info!(address = ?listener.local_addr().ok(), "Listening for debug clients");
        loop {
            let (stream, peer) = listener.accept().await?;
            let server = self.clone();
            let span = tracing::info_span!("connection", id = %Uuid::new_v4(), %peer);
            tokio::spawn(
                async move {
                    let (reader, writer) = stream.into_split();
                    server.serve_connection(reader, writer).await;
                }
                .instrument(span),
            );
        }
    }

    pub async fn serve_stdio(&self) {
        let span = tracing::info_span!("connection", id = %Uuid::new_v4(), peer = "stdio");
        self.serve_connection(tokio::io::stdin(), tokio::io::stdout())
            .instrument(span)
            .await;
    }

    /// Runs one client conversation to completion. A client that goes away
    /// without `disconnect` gets the same cleanup as one that asked for it.
    pub async fn serve_connection<R, W>(&self, reader: R, writer: W)
    where
        R: AsyncRead + Unpin + Send + 'static,
        W: AsyncWrite + Unpin + Send + 'static,
    {
        let (out_tx, out_rx) = mpsc::unbounded_channel();
        let writer_task = tokio::spawn(write_loop(writer, out_rx));
        let (in_tx, mut in_rx) = mpsc::unbounded_channel();
        let reader_task = tokio::spawn(read_loop(BufReader::new(reader), in_tx));

        let (event_tx, mut event_rx) = mpsc::unbounded_channel();
        let id = self.next_session_id();
        let session = Session::new(id, self.target.clone(), self.config.clone(), event_tx);
        let mut connection = Connection {
            session,
            out: out_tx,
            line_base: 1,
        };
        info!(session = id, "Client connected");

        loop {
            let step = tokio::select! {
                incoming = in_rx.recv() => Step::Incoming(incoming),
                Some(event) = connection.session.next_monitor_event() => Step::Monitor(event),
            };
            match step {
                Step::Incoming(Some(Ok(message))) => connection.handle(message).await,
                Step::Incoming(Some(Err(err))) => {
                    warn!(session = id, "Dropping client: {err}");
                    break;
                }
                Step::Incoming(None) => {
                    debug!(session = id, "Client closed the stream");
                    break;
                }
                Step::Monitor(event) => connection.session.handle_monitor_event(event).await,
            }
            connection.forward_events(&mut event_rx);
            if connection.session.mode() == SessionMode::Terminated {
                break;
            }
        }

        if connection.session.mode() != SessionMode::Terminated {
            let gone = io::Error::new(io::ErrorKind::ConnectionAborted, "client went away");
            let report = connection.session.fail(&DebugError::Transport(gone)).await;
            info!(session = id, %report, "Cleaned up after lost client");
        }
        connection.forward_events(&mut event_rx);

        reader_task.abort();
        drop(connection);
        match writer_task.await {
            Ok(Err(err)) => debug!(session = id, "Writer stopped: {err}"),
            Err(err) => error!(session = id, "Writer task failed: {err}"),
            Ok(Ok(())) => {}
        }
        info!(session = id, "Client disconnected");
    }
}

enum Step {
    Incoming(Option<io::Result<Value>>),
    Monitor(MonitorEvent),
}

enum Failure {
    Request(String),
    Debug(DebugError),
}

impl From<DebugError> for Failure {
    fn from(err: DebugError) -> Self {
        Failure::Debug(err)
    }
}

impl fmt::Display for Failure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Failure::Request(message) => f.write_str(message),
            Failure::Debug(err) => write!(f, "{err}"),
        }
    }
}

struct Connection {
    session: Session,
    out: mpsc::UnboundedSender<Outgoing>,
    /// Line number the client counts from.
    line_base: u32,
}

impl Connection {
    fn send(&self, message: Outgoing) {
        // A closed writer means the client is gone; the read side notices.
        let _ = self.out.send(message);
    }

    fn to_wire(&self, line: u32) -> u32 {
        line.saturating_add(self.line_base).saturating_sub(1)
    }

    /// `None` when the client's line has no 1-based counterpart.
    fn from_wire(&self, line: u32) -> Option<u32> {
        line.checked_add(1)?.checked_sub(self.line_base)
    }

    async fn handle(&mut self, message: Value) {
        let request = match Request::from_value(message.clone()) {
            Ok(request) => request,
            Err(reason) => {
                let seq = message.get("seq").and_then(Value::as_u64).unwrap_or(0);
                let command = message.get("command").and_then(Value::as_str).unwrap_or("unknown");
                warn!(session = self.session.id(), "Rejected message: {reason}");
                self.send(Outgoing::failure(seq, command, reason));
                return;
            }
        };

        debug!(session = self.session.id(), command = %request.command, seq = request.seq, "Request");
        match self.dispatch(&request).await {
            Ok(body) => self.send(Outgoing::success(&request, body)),
            Err(failure) => {
                warn!(session = self.session.id(), command = %request.command, "Request failed: {failure}");
                self.send(Outgoing::failure(request.seq, &request.command, failure.to_string()));
                if let Failure::Debug(err) = &failure {
                    self.session.handle_error(err).await;
                }
            }
        }
    }

    async fn dispatch(&mut self, request: &Request) -> Result<Option<Value>, Failure> {
        let body = match request.command.as_str() {
            "initialize" => {
                let args: InitializeArguments = request.arguments().map_err(Failure::Request)?;
                self.session.initialize()?;
                self.line_base = u32::from(args.lines_start_at1.unwrap_or(true));
                info!(client = ?args.client_id, adapter = ?args.adapter_id, "Initialize");
                Some(to_value(&Capabilities::default()))
            }
            "launch" | "attach" => {
                let args: StartArguments = request.arguments().map_err(Failure::Request)?;
                let kind = if request.command == "launch" {
                    StartKind::Launch
                } else {
                    StartKind::Attach
                };
                self.session.start(kind, args.document).await?;
                None
            }
            "setBreakpoints" => {
                let args: SetBreakpointsArguments = request.arguments().map_err(Failure::Request)?;
                let module = args.source.module_name().ok_or_else(|| {
                    Failure::Request("setBreakpoints needs a source path or name".to_string())
                })?;
                let requested = args.requested_lines();
                let lines: Vec<u32> = requested
                    .iter()
                    .filter_map(|&line| self.from_wire(line))
                    .collect();
                let mut set = self.session.set_breakpoints(&module, &lines).await?.into_iter();
                let breakpoints: Vec<ProtocolBreakpoint> = requested
                    .iter()
                    .filter_map(|&wire| match self.from_wire(wire) {
                        Some(_) => set
                            .next()
                            .map(|bp| self.breakpoint(&bp, Some(args.source.clone()))),
                        None => {
                            let reason = format!("line {wire} is out of range");
                            let bp = self.session.manager().rejected(&module, 0, reason);
                            Some(ProtocolBreakpoint {
                                line: wire,
                                ..self.breakpoint(&bp, Some(args.source.clone()))
                            })
                        }
                    })
                    .collect();
                Some(json!({ "breakpoints": breakpoints }))
            }
            "configurationDone" => {
                self.session.configuration_done()?;
                None
            }
            "threads" => Some(json!({ "threads": [{ "id": THREAD_ID, "name": "VBA" }] })),
            "continue" | "next" | "stepIn" | "stepOut" | "pause" => {
                let command = EXECUTION_COMMANDS
                    .into_iter()
                    .find(|kind| command_name(*kind) == request.command)
                    .unwrap_or(CommandKind::Continue);
                self.session.execute(command).await?;
                (command == CommandKind::Continue).then(|| json!({ "allThreadsContinued": true }))
            }
            "stackTrace" => {
                let frames: Vec<ProtocolStackFrame> = self
                    .session
                    .stack_trace()
                    .await?
                    .iter()
                    .map(|frame| self.stack_frame(frame))
                    .collect();
                Some(json!({ "stackFrames": frames, "totalFrames": frames.len() }))
            }
            "scopes" => {
                let args: ScopesArguments = request.arguments().map_err(Failure::Request)?;
                let scopes: Vec<ProtocolScope> = self
                    .session
                    .scopes(args.frame_id)?
                    .into_iter()
                    .map(|scope| ProtocolScope {
                        name: scope.name.to_string(),
                        presentation_hint: if scope.name == "Locals" { "locals" } else { "globals" },
                        variables_reference: scope.reference,
                        expensive: false,
                    })
                    .collect();
                Some(json!({ "scopes": scopes }))
            }
            "variables" => {
                let args: VariablesArguments = request.arguments().map_err(Failure::Request)?;
                let variables: Vec<ProtocolVariable> = self
                    .session
                    .variables(args.variables_reference)
                    .await?
                    .into_iter()
                    .map(variable)
                    .collect();
                Some(json!({ "variables": variables }))
            }
            "evaluate" => {
                let args: EvaluateArguments = request.arguments().map_err(Failure::Request)?;
                let result = self.session.evaluate(&args.expression).await?;
                Some(json!({ "result": result, "variablesReference": 0 }))
            }
            "disconnect" => {
                let report = self.session.disconnect().await?;
                info!(session = self.session.id(), %report, "Disconnect");
                None
            }
            other => return Err(Failure::Request(format!("Unsupported command '{other}'"))),
        };
        Ok(body)
    }

    /// Sends every event the session queued, after the response that caused them.
    fn forward_events(&self, events: &mut mpsc::UnboundedReceiver<SessionEvent>) {
        while let Ok(event) = events.try_recv() {
            let message = self.event(event);
            self.send(message);
        }
    }

    fn event(&self, event: SessionEvent) -> Outgoing {
        match event {
            SessionEvent::Initialized => Outgoing::event("initialized", None),
            SessionEvent::Stopped { reason, frame } => {
                let mut body = json!({
                    "reason": reason.as_str(),
                    "threadId": THREAD_ID,
                    "allThreadsStopped": true,
                });
                if let Some(frame) = frame {
                    body["frame"] = json!({
                        "module": frame.module,
                        "procedure": frame.procedure,
                        "line": self.to_wire(frame.line),
                    });
                }
                Outgoing::event("stopped", Some(body))
            }
            SessionEvent::Continued => Outgoing::event(
                "continued",
                Some(json!({ "threadId": THREAD_ID, "allThreadsContinued": true })),
            ),
            SessionEvent::Terminated => Outgoing::event("terminated", None),
            SessionEvent::Breakpoint(bp) => {
                let breakpoint = self.breakpoint(&bp, None);
                Outgoing::event(
                    "breakpoint",
                    Some(json!({ "reason": "changed", "breakpoint": breakpoint })),
                )
            }
            SessionEvent::Output { category, text } => Outgoing::event(
                "output",
                Some(json!({ "category": category.as_str(), "output": format!("{text}\n") })),
            ),
        }
    }

    fn breakpoint(&self, bp: &Breakpoint, source: Option<Source>) -> ProtocolBreakpoint {
        ProtocolBreakpoint {
            id: bp.id,
            verified: bp.verified,
            line: self.to_wire(bp.line),
            source: source.unwrap_or_else(|| Source {
                name: Some(bp.module.clone()),
                path: None,
            }),
            message: bp.message.clone(),
        }
    }

    fn stack_frame(&self, frame: &StackFrame) -> ProtocolStackFrame {
        let name = match &frame.procedure {
            Some(procedure) => format!("{}.{}", frame.module, procedure),
            None => frame.module.clone(),
        };
        ProtocolStackFrame {
            id: frame.id,
            name,
            source: Source {
                name: Some(frame.module.clone()),
                path: None,
            },
            line: self.to_wire(frame.line),
            column: 1,
        }
    }
}

fn variable(entry: VariableEntry) -> ProtocolVariable {
    ProtocolVariable {
        name: entry.name,
        value: entry.value.unwrap_or_else(|| UNAVAILABLE.to_string()),
        type_name: entry.declared_type,
        variables_reference: 0,
    }
}

fn to_value<T: serde::Serialize>(value: &T) -> Value {
    serde_json::to_value(value).unwrap_or(Value::Null)
}

async fn read_loop<R>(mut reader: BufReader<R>, tx: mpsc::UnboundedSender<io::Result<Value>>)
where
    R: AsyncRead + Unpin,
{
    loop {
        match read_message(&mut reader).await {
            Ok(Some(message)) => {
                if tx.send(Ok(message)).is_err() {
                    return;
                }
            }
            Ok(None) => return,
            Err(err) => {
                let _ = tx.send(Err(err));
                return;
            }
        }
    }
}

async fn write_loop<W>(mut writer: W, mut rx: mpsc::UnboundedReceiver<Outgoing>) -> io::Result<()>
where
    W: AsyncWrite + Unpin,
{
    let mut seq = 1_u64;
    while let Some(message) = rx.recv().await {
        write_message(&mut writer, seq, &message).await?;
        seq += 1;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;
    use tokio::io::{AsyncWriteExt, DuplexStream, ReadHalf, WriteHalf};
    use vba_bridge_core::MemoryTarget;

    const MOD1: &str = "Option Explicit\n\
Private total As Long\n\
\n\
Public Sub Main()\n\
    total = 0\n\
    Dim i As Long\n\
    For i = 1 To 3\n\
        Accumulate i\n\
    Next\n\
    Debug.Print total\n\
End Sub\n\
\n\
Private Sub Accumulate(ByVal n As Long)\n\
    total = total + n\n\
End Sub\n";

    struct Client {
        reader: BufReader<ReadHalf<DuplexStream>>,
        writer: WriteHalf<DuplexStream>,
        seq: u64,
        pending: Vec<Value>,
    }

    impl Client {
        async fn send(&mut self, command: &str, arguments: Value) -> u64 {
            self.seq += 1;
            let body = json!({
                "seq": self.seq, "type": "request", "command": command, "arguments": arguments
            })
            .to_string();
            let framed = format!("Content-Length: {}\r\n\r\n{}", body.len(), body);
            self.writer.write_all(framed.as_bytes()).await.unwrap();
            self.seq
        }

        async fn next(&mut self) -> Option<Value> {
            tokio::time::timeout(Duration::from_secs(5), read_message(&mut self.reader))
                .await
                .expect("no message within 5s")
                .unwrap()
        }

        async fn request(&mut self, command: &str, arguments: Value) -> Value {
            let seq = self.send(command, arguments).await;
            loop {
                let message = self.next().await.expect("stream closed before response");
                if message["type"] == "response" && message["request_seq"] == seq {
                    return message;
                }
                self.pending.push(message);
            }
        }

        async fn event(&mut self, name: &str) -> Value {
            if let Some(index) = self.pending.iter().position(|m| m["event"] == name) {
                return self.pending.remove(index);
            }
            loop {
                let message = self.next().await.expect("stream closed before event");
                if message["event"] == name {
                    return message;
                }
                self.pending.push(message);
            }
        }

        async fn attach(&mut self) {
            let init = self.request("initialize", json!({ "adapterID": "vba" })).await;
            assert_eq!(init["success"], true);
            let attach = self.request("attach", json!({})).await;
            assert_eq!(attach["success"], true);
        }
    }

    struct Fixture {
        target: MemoryTarget,
        server: Arc<Server>,
    }

    fn fixture() -> Fixture {
        let target = MemoryTarget::new().with_module("Mod1", MOD1);
        target.set_projects(&["VBAProject (Book1.xlsm)"]);
        let adapter = target.clone();
        let handle = Arc::new(TargetHandle::spawn("test", move || adapter).unwrap());
        let config = DebugConfig::default()
            .with_call_timeout(Duration::from_secs(2))
            .with_poll_interval(Duration::from_millis(10))
            .with_retries(0, Duration::ZERO)
            .with_reconnect(2, Duration::from_millis(10));
        Fixture {
            target,
            server: Arc::new(Server::new(handle, config)),
        }
    }

    fn connect(server: &Arc<Server>) -> (Client, tokio::task::JoinHandle<()>) {
        let (client_side, server_side) = tokio::io::duplex(64 * 1024);
        let (server_read, server_write) = tokio::io::split(server_side);
        let server = server.clone();
        let task = tokio::spawn(async move { server.serve_connection(server_read, server_write).await });
        let (reader, writer) = tokio::io::split(client_side);
        let client = Client {
            reader: BufReader::new(reader),
            writer,
            seq: 0,
            pending: Vec::new(),
        };
        (client, task)
    }

    fn set_breakpoints(lines: &[u32]) -> Value {
        json!({
            "source": { "path": "C:\\export\\Mod1.bas" },
            "breakpoints": lines.iter().map(|l| json!({ "line": l })).collect::<Vec<_>>()
        })
    }

    #[tokio::test]
    async fn test_initialize_reports_capabilities() {
        let f = fixture();
        let (mut client, _task) = connect(&f.server);
        let response = client.request("initialize", json!({})).await;
        assert_eq!(response["success"], true);
        assert_eq!(response["body"]["supportsConfigurationDoneRequest"], true);
        assert_eq!(response["body"]["supportsConditionalBreakpoints"], false);

        let attach = client.request("attach", json!({ "document": "Book1.xlsm" })).await;
        assert_eq!(attach["success"], true);
        let output = client.event("output").await;
        assert!(output["body"]["output"]
            .as_str()
            .unwrap()
            .contains("VBAProject (Book1.xlsm)"));
        client.event("initialized").await;
    }

    #[tokio::test]
    async fn test_requests_before_attach_fail() {
        let f = fixture();
        let (mut client, _task) = connect(&f.server);
        client.request("initialize", json!({})).await;

        let response = client.request("continue", json!({ "threadId": 1 })).await;
        assert_eq!(response["success"], false);
        assert_eq!(
            response["message"],
            "'continue' is not valid while the session is initializing"
        );
        assert!(f.target.commands().is_empty());

        let unknown = client.request("restartFrame", json!({ "frameId": 0 })).await;
        assert_eq!(unknown["success"], false);
        assert_eq!(unknown["message"], "Unsupported command 'restartFrame'");

        let threads = client.request("threads", json!({})).await;
        assert_eq!(threads["body"]["threads"][0]["id"], 1);
    }

    #[tokio::test]
    async fn test_breakpoint_stop_and_inspect() {
        let f = fixture();
        let (mut client, _task) = connect(&f.server);
        client.attach().await;

        let response = client.request("setBreakpoints", set_breakpoints(&[5, 14])).await;
        let verified: Vec<bool> = response["body"]["breakpoints"]
            .as_array()
            .unwrap()
            .iter()
            .map(|bp| bp["verified"].as_bool().unwrap())
            .collect();
        assert_eq!(verified, vec![true, true]);
        assert_eq!(response["body"]["breakpoints"][1]["line"], 14);

        client.request("configurationDone", json!({})).await;
        let response = client.request("continue", json!({ "threadId": 1 })).await;
        assert_eq!(response["success"], true);

        f.target.set_value("n", "2");
        f.target.halt_at("Mod1", None, 14);
        let stopped = client.event("stopped").await;
        assert_eq!(stopped["body"]["reason"], "breakpoint");
        assert_eq!(stopped["body"]["threadId"], 1);
        assert_eq!(stopped["body"]["frame"]["module"], "Mod1");
        assert_eq!(stopped["body"]["frame"]["procedure"], "Accumulate");
        assert_eq!(stopped["body"]["frame"]["line"], 14);

        let trace = client.request("stackTrace", json!({ "threadId": 1 })).await;
        assert_eq!(trace["body"]["totalFrames"], 1);
        assert_eq!(trace["body"]["stackFrames"][0]["name"], "Mod1.Accumulate");

        let scopes = client.request("scopes", json!({ "frameId": 0 })).await;
        let locals_ref = scopes["body"]["scopes"][0]["variablesReference"].clone();
        assert_eq!(locals_ref, 1);

        let vars = client
            .request("variables", json!({ "variablesReference": locals_ref }))
            .await;
        assert_eq!(vars["body"]["variables"][0]["name"], "n");
        assert_eq!(vars["body"]["variables"][0]["value"], "2");
        assert_eq!(vars["body"]["variables"][0]["type"], "Long");

        let globals = client.request("variables", json!({ "variablesReference": 2 })).await;
        assert_eq!(globals["body"]["variables"][0]["name"], "total");
        assert_eq!(globals["body"]["variables"][0]["value"], UNAVAILABLE);

        let next = client.request("next", json!({ "threadId": 1 })).await;
        assert_eq!(next["success"], true);
        assert_eq!(f.target.commands(), vec![CommandKind::Continue, CommandKind::StepOver]);
    }

    #[tokio::test]
    async fn test_disconnect_restores_source() {
        let f = fixture();
        let (mut client, task) = connect(&f.server);
        client.attach().await;
        client.request("setBreakpoints", set_breakpoints(&[5, 8, 14])).await;
        assert_ne!(f.target.module("Mod1").unwrap(), MOD1);

        let response = client.request("disconnect", json!({})).await;
        assert_eq!(response["success"], true);
        client.event("terminated").await;
        assert_eq!(f.target.module("Mod1").unwrap(), MOD1);
        assert!(f.server.target().registry.is_empty());

        tokio::time::timeout(Duration::from_secs(5), task)
            .await
            .unwrap()
            .unwrap();
    }

    #[tokio::test]
    async fn test_dropped_client_is_cleaned_up() {
        let f = fixture();
        let (mut client, task) = connect(&f.server);
        client.attach().await;
        client.request("setBreakpoints", set_breakpoints(&[5])).await;
        assert!(!f.server.target().registry.is_empty());

        drop(client);
        tokio::time::timeout(Duration::from_secs(5), task)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(f.target.module("Mod1").unwrap(), MOD1);
    }

    #[tokio::test]
    async fn test_protected_line_is_unverified() {
        let f = fixture();
        f.target.protect_line("Mod1", 10);
        let (mut client, _task) = connect(&f.server);
        client.attach().await;

        let response = client.request("setBreakpoints", set_breakpoints(&[10, 3])).await;
        let breakpoints = response["body"]["breakpoints"].as_array().unwrap();
        assert_eq!(breakpoints[0]["verified"], false);
        assert!(breakpoints[0]["message"].is_string());
        assert_eq!(breakpoints[1]["verified"], false);
        assert_eq!(f.target.module("Mod1").unwrap(), MOD1);
    }

    #[tokio::test]
    async fn test_zero_based_client_lines() {
        let f = fixture();
        let (mut client, _task) = connect(&f.server);
        client.request("initialize", json!({ "linesStartAt1": false })).await;
        client.request("attach", json!({})).await;

        let response = client.request("setBreakpoints", set_breakpoints(&[4])).await;
        assert_eq!(response["body"]["breakpoints"][0]["verified"], true);
        assert_eq!(response["body"]["breakpoints"][0]["line"], 4);
        assert!(f.server.target().manager.is_verified_at("Mod1", 5));
    }

    #[tokio::test]
    async fn test_out_of_range_lines_are_unverified() {
        let f = fixture();
        let (mut client, task) = connect(&f.server);
        client.request("initialize", json!({ "linesStartAt1": false })).await;
        client.request("attach", json!({})).await;

        let response = client
            .request("setBreakpoints", set_breakpoints(&[4, u32::MAX]))
            .await;
        assert_eq!(response["success"], true);
        let breakpoints = response["body"]["breakpoints"].as_array().unwrap();
        assert_eq!(breakpoints.len(), 2);
        assert_eq!(breakpoints[0]["verified"], true);
        assert_eq!(breakpoints[1]["verified"], false);
        assert_eq!(breakpoints[1]["line"], u32::MAX);
        assert!(breakpoints[1]["message"].is_string());

        let threads = client.request("threads", json!({})).await;
        assert_eq!(threads["success"], true);

        client.request("disconnect", json!({})).await;
        client.event("terminated").await;
        assert_eq!(f.target.module("Mod1").unwrap(), MOD1);
        tokio::time::timeout(Duration::from_secs(5), task)
            .await
            .unwrap()
            .unwrap();
    }

    #[tokio::test]
    async fn test_unknown_frame_fails_only_the_request() {
        let f = fixture();
        let (mut client, task) = connect(&f.server);
        client.attach().await;
        client.request("setBreakpoints", set_breakpoints(&[14])).await;
        client.request("configurationDone", json!({})).await;
        client.request("continue", json!({ "threadId": 1 })).await;
        f.target.halt_at("Mod1", None, 14);
        client.event("stopped").await;

        let scopes = client
            .request("scopes", json!({ "frameId": u64::MAX / 10 }))
            .await;
        assert_eq!(scopes["success"], false);
        assert!(scopes["message"].as_str().unwrap().contains("frame"));

        let trace = client.request("stackTrace", json!({ "threadId": 1 })).await;
        assert_eq!(trace["success"], true);
        let scopes = client.request("scopes", json!({ "frameId": 0 })).await;
        assert_eq!(scopes["success"], true);

        client.request("disconnect", json!({})).await;
        client.event("terminated").await;
        assert_eq!(f.target.module("Mod1").unwrap(), MOD1);
        tokio::time::timeout(Duration::from_secs(5), task)
            .await
            .unwrap()
            .unwrap();
    }

    #[tokio::test]
    async fn test_sessions_share_breakpoints() {
        let f = fixture();
        let (mut first, _a) = connect(&f.server);
        let (mut second, _b) = connect(&f.server);
        first.attach().await;
        second.attach().await;

        first.request("setBreakpoints", set_breakpoints(&[5])).await;
        second.request("setBreakpoints", set_breakpoints(&[5])).await;
        assert_eq!(f.target.write_count(), 1);

        first.request("disconnect", json!({})).await;
        assert!(f.server.target().manager.is_verified_at("Mod1", 5));
        assert_ne!(f.target.module("Mod1").unwrap(), MOD1);

        second.request("disconnect", json!({})).await;
        assert_eq!(f.target.module("Mod1").unwrap(), MOD1);
    }
}
