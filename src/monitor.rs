//! Control monitor (C6): a line-delimited JSON request/response server,
//! per SPEC_FULL.md §4.5. Framing on the way in follows the original's
//! `JSONMessageParser` token-streamer (one `serde_json::Value` at a time,
//! independent of where newlines fall); framing on the way out is
//! strictly one object per line, `\n`-terminated, with every `\n` in the
//! serialized buffer translated to `\r\n`.
//!
//! concurrency model: per SPEC_FULL.md §4.6 the whole engine is
//! single-threaded, so the "recursive monitor lock" of the original
//! degenerates to an invariant: no command handler here re-enters the
//! event loop, so nothing needs an actual `Mutex`. documented, not
//! encoded, matching the disposition of the process-wide iothread lock.

use std::cell::Cell;
use std::collections::HashMap;
use std::io::{self, ErrorKind, Read, Write};
use std::os::unix::net::{UnixListener, UnixStream};
use std::rc::Rc;

use log::{debug, trace, warn};
use mio::Interest;
use serde_json::{Value, json};
use std::os::fd::AsRawFd;

use crate::error::MonitorError;

/// Which command table is active for a connection. Negotiation only
/// accepts `qmp_capabilities`; once that succeeds the connection switches
/// to the full running table for its lifetime.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum CommandTable {
    Negotiation,
    Running,
}

/// Commands dispatchable once negotiation has completed. Listed here so
/// `query_commands` has something real to enumerate rather than a
/// hardcoded duplicate list.
const RUNNING_COMMANDS: &[&str] = &["qmp_capabilities", "query_version", "query_commands", "quit"];

fn error_response(id: Option<Value>, err: &MonitorError) -> Value {
    let mut obj = json!({
        "error": {
            "class": err.class(),
            "desc": err.to_string(),
        }
    });
    if let Some(id) = id {
        obj.as_object_mut().unwrap().insert("id".to_string(), id);
    }
    obj
}

fn success_response(id: Option<Value>, ret: Value) -> Value {
    let mut obj = json!({ "return": ret });
    if let Some(id) = id {
        obj.as_object_mut().unwrap().insert("id".to_string(), id);
    }
    obj
}

fn greeting() -> Value {
    json!({
        "QMP": {
            "version": {
                "package": "blkback",
                "blkback": {
                    "major": 1u32,
                    "minor": 0u32,
                    "micro": 0u32,
                }
            },
            // SPEC_FULL.md §9 Open Question 1: accepted but not applied.
            // No capabilities are currently defined by this backend.
            "capabilities": []
        }
    })
}

/// Dispatch one already-parsed command against `table`, possibly
/// switching it to `Running`. Never returns a Rust `Err` past this
/// function: control-plane errors are always folded into a QMP-shaped
/// `{"error": ...}` value (SPEC_FULL.md §7).
fn dispatch(table: &mut CommandTable, value: Value, run: &Rc<Cell<bool>>) -> Value {
    let execute = value.get("execute").and_then(Value::as_str).map(str::to_string);
    let arguments = value.get("arguments").cloned();
    let id = value.get("id").cloned();

    let execute = match execute {
        Some(e) => e,
        None => return error_response(id, &MonitorError::MissingExecute),
    };

    let result = match (*table, execute.as_str()) {
        (CommandTable::Negotiation, "qmp_capabilities") => {
            match check_capabilities_empty(&arguments) {
                Ok(()) => {
                    *table = CommandTable::Running;
                    Ok(json!({}))
                }
                Err(e) => Err(e),
            }
        }
        (CommandTable::Negotiation, other) => Err(MonitorError::CommandNotFound(other.to_string())),
        (CommandTable::Running, "qmp_capabilities") => Err(MonitorError::CapabilitiesAlreadyNegotiated),
        (CommandTable::Running, "query_version") => Ok(json!({
            "package": "blkback",
            "version": { "major": 1u32, "minor": 0u32, "micro": 0u32 },
        })),
        (CommandTable::Running, "query_commands") => {
            Ok(Value::Array(RUNNING_COMMANDS.iter().map(|c| json!({ "name": c })).collect()))
        }
        (CommandTable::Running, "quit") => {
            run.set(false);
            Ok(json!({}))
        }
        (CommandTable::Running, other) => Err(MonitorError::CommandNotFound(other.to_string())),
    };

    match result {
        Ok(ret) => success_response(id, ret),
        Err(e) => error_response(id, &e),
    }
}

/// `qmp_capabilities` is accepted with no `enable` array, or an empty
/// one. SPEC_FULL.md §9 resolves the "capability negotiation" open
/// question by rejecting a non-empty request rather than silently
/// ignoring it.
fn check_capabilities_empty(arguments: &Option<Value>) -> Result<(), MonitorError> {
    let Some(args) = arguments else { return Ok(()) };
    match args.get("enable") {
        None => Ok(()),
        Some(Value::Array(v)) if v.is_empty() => Ok(()),
        Some(_) => Err(MonitorError::UnsupportedCapability),
    }
}

/// One accepted control-channel connection: its own parser state,
/// command table, and output buffer. Channel-closed resets the JSON
/// parser (by dropping the connection entirely) but the command tables
/// are per-connection here, so there is nothing else to preserve.
pub struct Connection {
    stream: UnixStream,
    table: CommandTable,
    read_buf: Vec<u8>,
    write_buf: Vec<u8>,
    write_pos: usize,
    want_write: bool,
    pub closed: bool,
}

impl Connection {
    fn new(stream: UnixStream) -> Self {
        stream.set_nonblocking(true).ok();
        let mut conn = Connection {
            stream,
            table: CommandTable::Negotiation,
            read_buf: Vec::new(),
            write_buf: Vec::new(),
            write_pos: 0,
            want_write: false,
            closed: false,
        };
        conn.queue(&greeting());
        conn
    }

    fn queue(&mut self, value: &Value) {
        let mut text = serde_json::to_string(value).expect("monitor responses are always serializable");
        text.push('\n');
        // Outgoing text translates every `\n` to `\r\n` in the buffer.
        let translated = text.replace('\n', "\r\n");
        self.write_buf.extend_from_slice(translated.as_bytes());
    }

    /// Read whatever is available, run it through the streaming JSON
    /// parser, and dispatch every complete value found. framing is
    /// whatever the parser consumes, not strictly newline-split.
    pub fn on_readable(&mut self, run: &Rc<Cell<bool>>) {
        let mut chunk = [0u8; 4096];
        loop {
            match self.stream.read(&mut chunk) {
                Ok(0) => {
                    self.closed = true;
                    return;
                }
                Ok(n) => self.read_buf.extend_from_slice(&chunk[..n]),
                Err(e) if e.kind() == ErrorKind::WouldBlock => break,
                Err(e) => {
                    warn!("monitor connection read error: {e}");
                    self.closed = true;
                    return;
                }
            }
        }

        loop {
            let mut de = serde_json::Deserializer::from_slice(&self.read_buf).into_iter::<Value>();
            match de.next() {
                Some(Ok(value)) => {
                    let consumed = de.byte_offset();
                    drop(de);
                    self.read_buf.drain(..consumed);
                    trace!("monitor: dispatching {value}");
                    let response = dispatch(&mut self.table, value, run);
                    self.queue(&response);
                }
                Some(Err(e)) if e.is_eof() => {
                    // Incomplete value buffered for more bytes. Parse
                    // failures that are *not* "ran out of input" still
                    // synthesize an error response and drop the buffer,
                    // since we cannot know where a malformed value ends.
                    break;
                }
                Some(Err(e)) => {
                    let err = MonitorError::Parse(e);
                    let response = error_response(None, &err);
                    self.queue(&response);
                    self.read_buf.clear();
                    break;
                }
                None => break,
            }
        }

        self.try_flush();
    }

    pub fn on_writable(&mut self) {
        self.try_flush();
    }

    fn try_flush(&mut self) {
        while self.write_pos < self.write_buf.len() {
            match self.stream.write(&self.write_buf[self.write_pos..]) {
                Ok(0) => {
                    self.closed = true;
                    return;
                }
                Ok(n) => self.write_pos += n,
                Err(e) if e.kind() == ErrorKind::WouldBlock => {
                    self.want_write = true;
                    return;
                }
                Err(e) => {
                    warn!("monitor connection write error: {e}");
                    self.closed = true;
                    return;
                }
            }
        }
        self.write_buf.clear();
        self.write_pos = 0;
        self.want_write = false;
    }

    pub fn interest(&self) -> Interest {
        if self.want_write {
            Interest::READABLE | Interest::WRITABLE
        } else {
            Interest::READABLE
        }
    }
}

/// Owns the listening socket and every accepted connection. One process
/// owns exactly one `Monitor`, created by the main-loop scope rather than
/// read out of a global singleton (SPEC_FULL.md §9 "no global monitor
/// singleton").
pub struct Monitor {
    listener: UnixListener,
    pub connections: HashMap<mio::Token, Connection>,
}

impl Monitor {
    pub fn bind(path: &str) -> io::Result<Self> {
        let _ = std::fs::remove_file(path);
        let listener = UnixListener::bind(path)?;
        listener.set_nonblocking(true)?;
        Ok(Monitor {
            listener,
            connections: HashMap::new(),
        })
    }

    pub fn listener_fd(&self) -> std::os::fd::RawFd {
        self.listener.as_raw_fd()
    }

    /// Accept every pending connection, returning their new tokens so the
    /// caller can register them with the reactor.
    pub fn accept_all(&mut self, mut next_token: impl FnMut() -> mio::Token) -> Vec<mio::Token> {
        let mut accepted = Vec::new();
        loop {
            match self.listener.accept() {
                Ok((stream, _addr)) => {
                    let token = next_token();
                    debug!("monitor: accepted connection as {token:?}");
                    self.connections.insert(token, Connection::new(stream));
                    accepted.push(token);
                }
                Err(e) if e.kind() == ErrorKind::WouldBlock => break,
                Err(e) => {
                    warn!("monitor: accept failed: {e}");
                    break;
                }
            }
        }
        accepted
    }

    pub fn connection_raw_fd(&self, token: mio::Token) -> Option<std::os::fd::RawFd> {
        self.connections.get(&token).map(|c| c.stream.as_raw_fd())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn run_cell() -> Rc<Cell<bool>> {
        Rc::new(Cell::new(true))
    }

    #[test]
    fn query_version_before_capabilities_is_rejected() {
        let mut table = CommandTable::Negotiation;
        let run = run_cell();
        let resp = dispatch(&mut table, json!({"execute": "query_version", "id": 7}), &run);
        assert!(resp.get("error").is_some());
        assert_eq!(resp["id"], 7);
    }

    #[test]
    fn capabilities_then_query_version_round_trips_id() {
        let mut table = CommandTable::Negotiation;
        let run = run_cell();
        let resp = dispatch(&mut table, json!({"execute": "qmp_capabilities"}), &run);
        assert!(resp.get("return").is_some());
        assert_eq!(table, CommandTable::Running);

        let resp = dispatch(&mut table, json!({"execute": "query_version", "id": 7}), &run);
        assert!(resp.get("return").is_some());
        assert_eq!(resp["id"], 7);
    }

    #[test]
    fn repeated_capabilities_negotiation_is_command_not_found_class() {
        let mut table = CommandTable::Running;
        let run = run_cell();
        let resp = dispatch(&mut table, json!({"execute": "qmp_capabilities"}), &run);
        assert_eq!(resp["error"]["class"], "CommandNotFound");
    }

    #[test]
    fn nonempty_enable_list_is_rejected() {
        let mut table = CommandTable::Negotiation;
        let run = run_cell();
        let resp = dispatch(
            &mut table,
            json!({"execute": "qmp_capabilities", "arguments": {"enable": ["oob"]}}),
            &run,
        );
        assert!(resp.get("error").is_some());
        assert_eq!(table, CommandTable::Negotiation);
    }

    #[test]
    fn quit_clears_the_run_flag() {
        let mut table = CommandTable::Running;
        let run = run_cell();
        dispatch(&mut table, json!({"execute": "quit"}), &run);
        assert!(!run.get());
    }
}
