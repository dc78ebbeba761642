//! Companion session state.
//!
//! Two session kinds share one transport abstraction:
//!
//! - [`ControlSession`]: framed binary commands (see [`crate::control`])
//!   answered synchronously.
//! - [`TelemetrySession`]: text subscription commands in, rendered data
//!   frames out (see [`crate::stream`]).
//!
//! Both kinds buffer reads until a complete message arrives and buffer
//! writes until the dispatcher reports the socket writable. A failure on
//! one session never touches another; protocol faults close only the
//! session that produced them.

use crate::control::{ControlEngine, SessionGate, decode_frame};
use crate::stream::{Encoding, SliceHistory, StreamEngine, SubscriptionSpec};
use crate::task::{TaskId, TaskRegistry};
use crate::trace::{debug, info};
use mio::event::Source;
use mio::net::{TcpStream, UnixStream};
use std::fmt;
use std::io::{self, Read, Write};

/// Random identifier tagging a session in log output and diagnostics.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SessionId(u32);

impl SessionId {
    fn generate() -> Self {
        SessionId(rand::random())
    }
}

impl fmt::Display for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:08x}", self.0)
    }
}

/// Byte-stream transport; control and telemetry can each run on either.
pub enum Transport {
    Tcp(TcpStream),
    Unix(UnixStream),
}

impl Transport {
    pub fn source(&mut self) -> &mut dyn Source {
        match self {
            Transport::Tcp(s) => s,
            Transport::Unix(s) => s,
        }
    }
}

impl Read for Transport {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        match self {
            Transport::Tcp(s) => s.read(buf),
            Transport::Unix(s) => s.read(buf),
        }
    }
}

impl Write for Transport {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        match self {
            Transport::Tcp(s) => s.write(buf),
            Transport::Unix(s) => s.write(buf),
        }
    }

    fn flush(&mut self) -> io::Result<()> {
        match self {
            Transport::Tcp(s) => s.flush(),
            Transport::Unix(s) => s.flush(),
        }
    }
}

/// What a session wants from the dispatcher after an I/O callback.
#[derive(Debug, Clone, Copy, Default)]
pub struct SessionIo {
    pub closed: bool,
    pub wants_write: bool,
}

const READ_CHUNK: usize = 4096;

/// Drains the socket into `inbuf`; true when the peer closed.
fn fill_inbuf(transport: &mut Transport, inbuf: &mut Vec<u8>) -> io::Result<bool> {
    let mut chunk = [0u8; READ_CHUNK];
    loop {
        match transport.read(&mut chunk) {
            Ok(0) => return Ok(true),
            Ok(n) => inbuf.extend_from_slice(&chunk[..n]),
            Err(err) if err.kind() == io::ErrorKind::WouldBlock => return Ok(false),
            Err(err) => return Err(err),
        }
    }
}

/// Writes as much of `outbuf` as the socket accepts.
fn flush_outbuf(transport: &mut Transport, outbuf: &mut Vec<u8>) -> io::Result<()> {
    while !outbuf.is_empty() {
        match transport.write(outbuf) {
            Ok(0) => return Err(io::ErrorKind::WriteZero.into()),
            Ok(n) => {
                outbuf.drain(..n);
            }
            Err(err) if err.kind() == io::ErrorKind::WouldBlock => return Ok(()),
            Err(err) => return Err(err),
        }
    }
    Ok(())
}

/// A binary control-channel session.
pub struct ControlSession {
    id: SessionId,
    transport: Transport,
    inbuf: Vec<u8>,
    outbuf: Vec<u8>,
    gate: SessionGate,
}

impl ControlSession {
    #[must_use]
    pub fn new(transport: Transport) -> Self {
        ControlSession {
            id: SessionId::generate(),
            transport,
            inbuf: Vec::new(),
            outbuf: Vec::new(),
            gate: SessionGate::new(),
        }
    }

    #[must_use]
    pub fn id(&self) -> SessionId {
        self.id
    }

    pub fn source(&mut self) -> &mut dyn Source {
        self.transport.source()
    }

    pub fn on_readable(&mut self, registry: &TaskRegistry) -> io::Result<SessionIo> {
        let peer_closed = fill_inbuf(&mut self.transport, &mut self.inbuf)?;
        let mut io_state = SessionIo::default();

        let engine = ControlEngine::new(registry);
        loop {
            match decode_frame(&self.inbuf) {
                Ok(Some((frame, consumed))) => {
                    self.inbuf.drain(..consumed);
                    let response = engine.execute(&mut self.gate, &frame);
                    self.outbuf.extend_from_slice(&response.encode());
                }
                Ok(None) => break,
                Err(_err) => {
                    debug!(session = %self.id, err = %_err, "control session protocol fault");
                    io_state.closed = true;
                    break;
                }
            }
        }

        io_state.closed |= peer_closed;
        io_state.wants_write = !self.outbuf.is_empty();
        Ok(io_state)
    }

    pub fn on_writable(&mut self) -> io::Result<SessionIo> {
        flush_outbuf(&mut self.transport, &mut self.outbuf)?;
        Ok(SessionIo {
            closed: false,
            wants_write: !self.outbuf.is_empty(),
        })
    }

    #[cfg(test)]
    fn ingest(&mut self, registry: &TaskRegistry, bytes: &[u8]) -> SessionIo {
        self.inbuf.extend_from_slice(bytes);
        let engine = ControlEngine::new(registry);
        let mut io_state = SessionIo::default();
        loop {
            match decode_frame(&self.inbuf) {
                Ok(Some((frame, consumed))) => {
                    self.inbuf.drain(..consumed);
                    let response = engine.execute(&mut self.gate, &frame);
                    self.outbuf.extend_from_slice(&response.encode());
                }
                Ok(None) => break,
                Err(_) => {
                    io_state.closed = true;
                    break;
                }
            }
        }
        io_state.wants_write = !self.outbuf.is_empty();
        io_state
    }
}

/// A text telemetry session: subscription commands in, data frames out.
pub struct TelemetrySession {
    id: SessionId,
    transport: Transport,
    inbuf: Vec<u8>,
    outbuf: Vec<u8>,
    engine: StreamEngine,
    attached: Option<TaskId>,
    /// Byte cap on unread output, mirroring the ring's own capacity; frames
    /// beyond it are dropped with an explicit `<overflow/>` marker.
    out_limit: usize,
    overflowed: bool,
}

const DEFAULT_OUT_LIMIT: usize = 256 * 1024;

/// Longest accepted command tag. Valid tags are well under this; a peer
/// that streams bytes without ever closing a tag is cut off rather than
/// allowed to grow the input buffer without bound.
const MAX_COMMAND_LEN: usize = 1024;

impl TelemetrySession {
    #[must_use]
    pub fn new(transport: Transport, engine: StreamEngine) -> Self {
        TelemetrySession {
            id: SessionId::generate(),
            transport,
            inbuf: Vec::new(),
            outbuf: Vec::new(),
            engine,
            attached: None,
            out_limit: DEFAULT_OUT_LIMIT,
            overflowed: false,
        }
    }

    #[must_use]
    pub fn id(&self) -> SessionId {
        self.id
    }

    pub fn source(&mut self) -> &mut dyn Source {
        self.transport.source()
    }

    /// Which task this session streams from, once attached.
    #[must_use]
    pub fn attached(&self) -> Option<TaskId> {
        self.attached
    }

    pub fn on_readable(&mut self, registry: &TaskRegistry) -> io::Result<SessionIo> {
        let peer_closed = fill_inbuf(&mut self.transport, &mut self.inbuf)?;
        self.process_commands(registry);
        // Whatever remains is an unterminated tag; it may legitimately
        // complete on the next read, but never past the command length cap.
        let oversized = self.inbuf.len() > MAX_COMMAND_LEN;
        if oversized {
            self.reply_err("command too long");
            // The session is about to close; flush what the socket accepts.
            let _ = flush_outbuf(&mut self.transport, &mut self.outbuf);
        }
        Ok(SessionIo {
            closed: peer_closed || oversized,
            wants_write: !self.outbuf.is_empty(),
        })
    }

    pub fn on_writable(&mut self) -> io::Result<SessionIo> {
        flush_outbuf(&mut self.transport, &mut self.outbuf)?;
        Ok(SessionIo {
            closed: false,
            wants_write: !self.outbuf.is_empty(),
        })
    }

    /// Renders subscription output for one drained slice. Frames are
    /// dropped while the session is backlogged; resumption is announced
    /// with a single overflow marker so the loss is never silent.
    pub fn on_slice(&mut self, hist: &SliceHistory, seq: u64, fill_percent: u8) {
        if self.outbuf.len() > self.out_limit {
            self.overflowed = true;
            return;
        }
        if self.overflowed {
            self.outbuf.extend_from_slice(b"<overflow/>\n");
            self.overflowed = false;
        }
        let mut rendered = String::new();
        self.engine.on_slice(hist, seq, fill_percent, &mut rendered);
        self.outbuf.extend_from_slice(rendered.as_bytes());
    }

    #[must_use]
    pub fn wants_write(&self) -> bool {
        !self.outbuf.is_empty()
    }

    /// The snapshot ring itself overflowed: announce the gap on this
    /// session before the next rendered batch.
    pub fn note_ring_overflow(&mut self) {
        self.overflowed = true;
    }

    fn process_commands(&mut self, registry: &TaskRegistry) {
        // Commands are short tags; anything before '<' is ignored noise.
        while let Some(end) = self.inbuf.iter().position(|&b| b == b'>') {
            let raw: Vec<u8> = self.inbuf.drain(..=end).collect();
            let text = String::from_utf8_lossy(&raw);
            match text.find('<') {
                Some(start) => {
                    let tag = &text[start..];
                    self.run_command(registry, tag);
                }
                None => continue,
            }
        }
    }

    fn reply_err(&mut self, message: &str) {
        debug!(message, "telemetry command rejected");
        self.outbuf
            .extend_from_slice(format!("<error text=\"{message}\"/>\n").as_bytes());
    }

    fn reply_ack(&mut self, cmd: &str) {
        self.outbuf
            .extend_from_slice(format!("<ack cmd=\"{cmd}\"/>\n").as_bytes());
    }

    fn run_command(&mut self, registry: &TaskRegistry, tag: &str) {
        let Some((name, attrs)) = parse_tag(tag) else {
            self.reply_err("malformed command");
            return;
        };
        match name.as_str() {
            "ping" => self.outbuf.extend_from_slice(b"<pong/>\n"),
            "attach" => self.cmd_attach(registry, &attrs),
            "start" => self.cmd_start(registry, &attrs),
            "stop" => self.cmd_stop(&attrs),
            other => self.reply_err(&format!("unknown command `{other}`")),
        }
    }

    fn cmd_attach(&mut self, registry: &TaskRegistry, attrs: &[(String, String)]) {
        let Some(raw) = attr(attrs, "task").and_then(|v| v.parse::<u16>().ok()) else {
            self.reply_err("attach needs a task id");
            return;
        };
        let Some(task) = registry.get(TaskId::from_raw(raw)) else {
            self.reply_err("no such task");
            return;
        };
        // Cap unread output at the ring's own capacity in bytes.
        self.out_limit = task.ring().capacity() * task.slice_len();
        self.attached = Some(task.id());
        self.engine.clear();
        info!(session = %self.id, task = %task.name(), "telemetry session attached");
        self.reply_ack("attach");
    }

    fn cmd_start(&mut self, registry: &TaskRegistry, attrs: &[(String, String)]) {
        let Some(task) = self.attached.and_then(|id| registry.get(id)) else {
            self.reply_err("not attached to a task");
            return;
        };
        let Some(channel) = attr(attrs, "channel").and_then(|v| v.parse::<u32>().ok()) else {
            self.reply_err("start needs a channel index");
            return;
        };
        let Some(desc) = task.signals().iter().find(|ch| ch.index == channel) else {
            self.reply_err("no such channel");
            return;
        };

        let num = |key: &str, default: u32| {
            attr(attrs, key)
                .and_then(|v| v.parse::<u32>().ok())
                .unwrap_or(default)
        };
        let encoding = match attr(attrs, "coding") {
            None => Encoding::Text,
            Some(name) => match Encoding::from_name(name) {
                Some(encoding) => encoding,
                None => {
                    self.reply_err("unknown coding");
                    return;
                }
            },
        };
        let spec = SubscriptionSpec {
            channel,
            decimation: num("reduction", 1),
            block: num("blocksize", 1),
            event: num("event", 0) != 0,
            encoding,
            delta: num("compression", 0) != 0,
        };
        match self.engine.subscribe(desc, spec) {
            Ok(()) => self.reply_ack("start"),
            Err(err) => self.reply_err(&err.to_string()),
        }
    }

    fn cmd_stop(&mut self, attrs: &[(String, String)]) {
        match attr(attrs, "channel").and_then(|v| v.parse::<u32>().ok()) {
            Some(channel) => {
                if self.engine.unsubscribe(channel) {
                    self.reply_ack("stop");
                } else {
                    self.reply_err("channel not subscribed");
                }
            }
            // Bare <stop/> clears every subscription.
            None => {
                self.engine.clear();
                self.reply_ack("stop");
            }
        }
    }
}

fn attr<'a>(attrs: &'a [(String, String)], key: &str) -> Option<&'a str> {
    attrs
        .iter()
        .find(|(k, _)| k == key)
        .map(|(_, v)| v.as_str())
}

/// Parses `<name key="value" .../>` into its name and attribute pairs.
fn parse_tag(tag: &str) -> Option<(String, Vec<(String, String)>)> {
    let inner = tag
        .trim()
        .strip_prefix('<')?
        .strip_suffix('>')?
        .trim_end_matches('/')
        .trim();
    let mut parts = inner.splitn(2, char::is_whitespace);
    let name = parts.next()?.to_owned();
    if name.is_empty() || !name.chars().all(|c| c.is_ascii_alphanumeric() || c == '_') {
        return None;
    }

    let mut attrs = Vec::new();
    let mut rest = parts.next().unwrap_or("").trim();
    while !rest.is_empty() {
        let eq = rest.find('=')?;
        let key = rest[..eq].trim().to_owned();
        let after = rest[eq + 1..].trim_start();
        let quoted = after.strip_prefix('"')?;
        let close = quoted.find('"')?;
        attrs.push((key, quoted[..close].to_owned()));
        rest = quoted[close + 1..].trim_start();
    }
    Some((name, attrs))
}
