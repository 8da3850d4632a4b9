//! Line-protocol request decoding and command dispatch.
//!
//! The decoder consumes the inline array form
//!
//! ```text
//! *N\r\n$L1\r\n<arg1>\r\n...$LN\r\n<argN>\r\n
//! ```
//!
//! incrementally: [`decode`] returns the parsed request plus the number
//! of bytes consumed, or `None` when more input is needed. It is purely
//! syntactic — command semantics live in [`Command::parse`], a tagged
//! variant with a single dispatch point rather than a per-command type
//! hierarchy. Command names are lower-cased before dispatch.
//!
//! A buffer still incomplete past 64 KiB is a protocol error, as is a
//! missing `*` header, a non-numeric count or length, or a declared bulk
//! length beyond the size limit.
//!
//! [`Shard`] is the thin layer the outer server drives: one decoded
//! request in, one RESP-encoded reply out, with the engine's error
//! taxonomy mapped to `-ERR` / `-PROTOCOL` / `-TIMEOUT` /
//! `-WRONGTYPE` strings.


use std::time::Duration;

use thiserror::Error;
use tracing::trace;

use crate::Deadline;
use crate::engine::{ColumnFamily, EngineError};

/// Largest request the decoder will buffer before giving up.
pub const MAX_REQUEST_SIZE: usize = 64 * 1024;

/// Errors produced by the decoder and command parser.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum ProtocolError {
    /// The input does not follow the wire format.
    #[error("protocol error: {0}")]
    Malformed(&'static str),

    /// The request grew past [`MAX_REQUEST_SIZE`] without completing.
    #[error("protocol error: request exceeds {MAX_REQUEST_SIZE} bytes")]
    BulkTooLarge,

    /// The command name is not recognised.
    #[error("unknown command '{0}'")]
    UnknownCommand(String),

    /// Known command, wrong argument count.
    #[error("wrong number of arguments for '{0}'")]
    WrongArity(&'static str),

    /// An argument failed validation (bad number, out of range).
    #[error("invalid argument: {0}")]
    InvalidArgument(String),
}

/// A decoded request: the command name (lower-cased) and its arguments.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Request {
    /// Lower-cased command bytes.
    pub command: Vec<u8>,
    /// Positional arguments, command excluded.
    pub args: Vec<Vec<u8>>,
}

impl Request {
    /// Number of arguments.
    pub fn args_count(&self) -> usize {
        self.args.len()
    }
}

// ------------------------------------------------------------------------------------------------
// Decoder
// ------------------------------------------------------------------------------------------------

/// Try to decode one request from the front of `buf`.
///
/// Returns `Ok(Some((request, consumed)))` on success, `Ok(None)` when
/// the buffer holds an incomplete request, and an error when the input
/// can never become valid.
pub fn decode(buf: &[u8]) -> Result<Option<(Request, usize)>, ProtocolError> {
    if buf.is_empty() {
        return Ok(None);
    }
    if buf[0] != b'*' {
        return Err(ProtocolError::Malformed("expected '*' array header"));
    }

    let Some((count_digits, after_header)) = read_line(buf, 1)? else {
        return need_more(buf);
    };
    let count = parse_number(count_digits)?;
    if count == 0 {
        return Err(ProtocolError::Malformed("empty command array"));
    }

    let mut cursor = after_header;
    let mut parts: Vec<Vec<u8>> = Vec::with_capacity(count);
    for _ in 0..count {
        if cursor >= buf.len() {
            return need_more(buf);
        }
        if buf[cursor] != b'$' {
            return Err(ProtocolError::Malformed("expected '$' bulk header"));
        }
        let Some((len_digits, after_len)) = read_line(buf, cursor + 1)? else {
            return need_more(buf);
        };
        let len = parse_number(len_digits)?;
        if len > MAX_REQUEST_SIZE {
            return Err(ProtocolError::BulkTooLarge);
        }
        let end = after_len + len;
        if buf.len() < end + 2 {
            return need_more(buf);
        }
        if &buf[end..end + 2] != b"\r\n" {
            return Err(ProtocolError::Malformed("bulk payload not CRLF-terminated"));
        }
        parts.push(buf[after_len..end].to_vec());
        cursor = end + 2;
    }

    let mut command = parts.remove(0);
    command.make_ascii_lowercase();
    trace!(
        command = %String::from_utf8_lossy(&command),
        args = parts.len(),
        consumed = cursor,
        "request decoded"
    );
    Ok(Some((
        Request {
            command,
            args: parts,
        },
        cursor,
    )))
}

/// Incomplete input: `None`, unless the buffer has already outgrown the
/// limit and can never complete.
fn need_more(buf: &[u8]) -> Result<Option<(Request, usize)>, ProtocolError> {
    if buf.len() > MAX_REQUEST_SIZE {
        return Err(ProtocolError::BulkTooLarge);
    }
    Ok(None)
}

/// Bytes of the line starting at `start` up to CRLF, with the offset just
/// past the CRLF. `None` when the terminator has not arrived.
fn read_line(buf: &[u8], start: usize) -> Result<Option<(&[u8], usize)>, ProtocolError> {
    let mut i = start;
    while i + 1 < buf.len() {
        if buf[i] == b'\r' {
            if buf[i + 1] != b'\n' {
                return Err(ProtocolError::Malformed("bare CR inside header line"));
            }
            return Ok(Some((&buf[start..i], i + 2)));
        }
        i += 1;
    }
    Ok(None)
}

fn parse_number(digits: &[u8]) -> Result<usize, ProtocolError> {
    if digits.is_empty() || !digits.iter().all(u8::is_ascii_digit) {
        return Err(ProtocolError::Malformed("non-numeric count"));
    }
    std::str::from_utf8(digits)
        .ok()
        .and_then(|s| s.parse::<usize>().ok())
        .ok_or(ProtocolError::Malformed("count out of range"))
}

// ------------------------------------------------------------------------------------------------
// Commands
// ------------------------------------------------------------------------------------------------

/// The engine-facing command set: SET/GET/DEL-shaped operations with
/// TTL modifiers. One tagged variant per command, one dispatch point.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Command {
    /// `SET key value [EX seconds | PX milliseconds]`
    Set {
        /// Key bytes.
        key: Vec<u8>,
        /// Value bytes.
        value: Vec<u8>,
        /// Optional expiry from an `EX`/`PX` modifier. Validated here,
        /// enforced by the expiry layer above the engine.
        expire: Option<Duration>,
    },
    /// `GET key`
    Get {
        /// Key bytes.
        key: Vec<u8>,
    },
    /// `DEL key [key ...]`
    Del {
        /// Keys to delete.
        keys: Vec<Vec<u8>>,
    },
}

impl Command {
    /// Interpret a decoded request.
    pub fn parse(request: &Request) -> Result<Command, ProtocolError> {
        match request.command.as_slice() {
            b"set" => {
                if request.args.len() < 2 {
                    return Err(ProtocolError::WrongArity("set"));
                }
                let key = request.args[0].clone();
                let value = request.args[1].clone();
                let expire = Self::parse_expire(&request.args[2..])?;
                Ok(Command::Set { key, value, expire })
            }
            b"get" => {
                if request.args.len() != 1 {
                    return Err(ProtocolError::WrongArity("get"));
                }
                Ok(Command::Get {
                    key: request.args[0].clone(),
                })
            }
            b"del" => {
                if request.args.is_empty() {
                    return Err(ProtocolError::WrongArity("del"));
                }
                Ok(Command::Del {
                    keys: request.args.clone(),
                })
            }
            other => Err(ProtocolError::UnknownCommand(
                String::from_utf8_lossy(other).into_owned(),
            )),
        }
    }

    fn parse_expire(modifiers: &[Vec<u8>]) -> Result<Option<Duration>, ProtocolError> {
        match modifiers {
            [] => Ok(None),
            [unit, amount] => {
                let n = std::str::from_utf8(amount)
                    .ok()
                    .and_then(|s| s.parse::<u64>().ok())
                    .filter(|n| *n > 0)
                    .ok_or_else(|| {
                        ProtocolError::InvalidArgument("expiry is not a positive integer".into())
                    })?;
                let mut unit = unit.clone();
                unit.make_ascii_lowercase();
                match unit.as_slice() {
                    b"ex" => Ok(Some(Duration::from_secs(n))),
                    b"px" => Ok(Some(Duration::from_millis(n))),
                    _ => Err(ProtocolError::InvalidArgument(
                        "unknown SET modifier".into(),
                    )),
                }
            }
            _ => Err(ProtocolError::WrongArity("set")),
        }
    }
}

// ------------------------------------------------------------------------------------------------
// Replies
// ------------------------------------------------------------------------------------------------

/// A successful reply, before wire encoding.
#[derive(Debug, PartialEq, Eq)]
pub enum Reply {
    /// `+OK\r\n`
    Ok,
    /// `$len\r\n<bytes>\r\n`, or `$-1\r\n` for an absent value.
    Bulk(Option<Vec<u8>>),
    /// `:n\r\n`
    Integer(i64),
}

impl Reply {
    /// Encode to wire bytes.
    pub fn encode(&self) -> Vec<u8> {
        match self {
            Reply::Ok => b"+OK\r\n".to_vec(),
            Reply::Bulk(None) => b"$-1\r\n".to_vec(),
            Reply::Bulk(Some(value)) => {
                let mut out = format!("${}\r\n", value.len()).into_bytes();
                out.extend_from_slice(value);
                out.extend_from_slice(b"\r\n");
                out
            }
            Reply::Integer(n) => format!(":{n}\r\n").into_bytes(),
        }
    }
}

/// Encode an engine error as a RESP error string.
pub fn encode_engine_error(err: &EngineError) -> Vec<u8> {
    let (token, detail) = match err {
        EngineError::Timeout => ("TIMEOUT", "deadline exceeded".to_string()),
        EngineError::InvalidArgument(d) => ("ERR", d.clone()),
        other => ("ERR", other.to_string()),
    };
    format!("-{token} {detail}\r\n").into_bytes()
}

/// Encode a protocol error as a RESP error string.
pub fn encode_protocol_error(err: &ProtocolError) -> Vec<u8> {
    let token = match err {
        ProtocolError::Malformed(_) | ProtocolError::BulkTooLarge => "PROTOCOL",
        ProtocolError::UnknownCommand(_) => "ERR",
        ProtocolError::WrongArity(_) | ProtocolError::InvalidArgument(_) => "ERR",
    };
    format!("-{token} {err}\r\n").into_bytes()
}

// ------------------------------------------------------------------------------------------------
// Shard
// ------------------------------------------------------------------------------------------------

/// The per-shard dispatch layer: decoded requests in, encoded replies
/// out. The outer server owns the sockets; this owns the engine calls.
pub struct Shard {
    engine: ColumnFamily,
}

impl Shard {
    /// Wrap an engine.
    pub fn new(engine: ColumnFamily) -> Shard {
        Shard { engine }
    }

    /// Borrow the underlying engine.
    pub fn engine(&self) -> &ColumnFamily {
        &self.engine
    }

    /// Execute one decoded request and encode its reply.
    ///
    /// Errors never escape: every failure maps to a RESP error string so
    /// the connection stays usable.
    pub fn apply(&self, request: &Request, deadline: &Deadline) -> Vec<u8> {
        let command = match Command::parse(request) {
            Ok(command) => command,
            Err(e) => return encode_protocol_error(&e),
        };
        match self.dispatch(command, deadline) {
            Ok(reply) => reply.encode(),
            Err(e) => encode_engine_error(&e),
        }
    }

    fn dispatch(&self, command: Command, deadline: &Deadline) -> Result<Reply, EngineError> {
        match command {
            Command::Set { key, value, .. } => {
                self.engine.put(key, value, deadline)?;
                Ok(Reply::Ok)
            }
            Command::Get { key } => {
                let value = self.engine.get(&key, deadline)?;
                Ok(Reply::Bulk(value))
            }
            Command::Del { keys } => {
                // Redis counts keys that existed; one read per key keeps
                // that contract.
                let mut removed = 0i64;
                for key in keys {
                    if self.engine.get(&key, deadline)?.is_some() {
                        removed += 1;
                    }
                    self.engine.delete(key, deadline)?;
                }
                Ok(Reply::Integer(removed))
            }
        }
    }
}
