//! Value tree codec.
//!
//! fail2ban speaks Python pickle on its control socket. Requests are a
//! pickled list of strings; responses are arbitrarily nested tuples and
//! lists of integers and strings. This module translates between those
//! bytes and the [`Value`] tree the rest of the client works with.
//!
//! Decoding rejects trailing bytes after the pickle STOP opcode. The
//! transport hands the decoder exactly the bytes preceding the
//! end-of-command sentinel, so a conforming daemon never produces them.
//!
//! Objects the client has no use for (exception instances, `IPAddr`
//! entries in ban lists, dicts and sets) decode to [`Value::Nil`] so that
//! one exotic entry does not fail a whole response.

use std::fmt;

use serde_pickle::{DeOptions, SerOptions};

type PickleValue = serde_pickle::Value;

/// Maximum nesting accepted in a decoded value. Checked on the raw opcode
/// stream before any tree is built.
pub const MAX_DEPTH: usize = 64;

/// A decoded daemon value.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Value {
    Integer(i64),
    Text(String),
    /// Python lists and tuples alike. Order is significant.
    Sequence(Vec<Value>),
    /// `None`, or an object the client cannot rebuild (such as the
    /// exception instance that accompanies a failed command, or an
    /// instance's state dict).
    Nil,
}

impl Value {
    /// Short name of the variant, used in error messages.
    pub fn kind(&self) -> &'static str {
        match self {
            Value::Integer(_) => "integer",
            Value::Text(_) => "text",
            Value::Sequence(_) => "sequence",
            Value::Nil => "nil",
        }
    }

    pub fn as_integer(&self) -> Option<i64> {
        match self {
            Value::Integer(n) => Some(*n),
            _ => None,
        }
    }

    pub fn as_text(&self) -> Option<&str> {
        match self {
            Value::Text(s) => Some(s),
            _ => None,
        }
    }

    pub fn as_sequence(&self) -> Option<&[Value]> {
        match self {
            Value::Sequence(items) => Some(items),
            _ => None,
        }
    }

    /// View this value as a `(label, value)` entry.
    ///
    /// Only the shape is checked: a two-element sequence. The label is
    /// returned as-is so callers can decide whether they care about it.
    pub fn as_entry(&self) -> Option<(&Value, &Value)> {
        match self.as_sequence()? {
            [label, value] => Some((label, value)),
            _ => None,
        }
    }
}

impl From<i64> for Value {
    fn from(n: i64) -> Self {
        Value::Integer(n)
    }
}

impl From<&str> for Value {
    fn from(s: &str) -> Self {
        Value::Text(s.to_string())
    }
}

impl From<String> for Value {
    fn from(s: String) -> Self {
        Value::Text(s)
    }
}

impl From<Vec<Value>> for Value {
    fn from(items: Vec<Value>) -> Self {
        Value::Sequence(items)
    }
}

/// A command sent to the daemon, e.g. `status sshd`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Command {
    args: Vec<String>,
}

impl Command {
    pub fn new<I, S>(args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            args: args.into_iter().map(Into::into).collect(),
        }
    }

    /// `status`, optionally scoped to one jail.
    pub fn status(jail: Option<&str>) -> Self {
        let mut args = vec!["status".to_string()];
        args.extend(jail.map(str::to_string));
        Self { args }
    }

    pub fn args(&self) -> &[String] {
        &self.args
    }

    /// The command as the list of texts that goes on the wire.
    pub fn to_value(&self) -> Value {
        Value::Sequence(self.args.iter().cloned().map(Value::Text).collect())
    }
}

impl fmt::Display for Command {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.args.join(" "))
    }
}

/// Failure to serialize a value.
#[derive(Debug, thiserror::Error)]
#[error("failed to encode value: {0}")]
pub struct EncodingError(#[source] serde_pickle::Error);

/// Failure to turn received bytes into a [`Value`].
#[derive(Debug, thiserror::Error)]
pub enum DecodingError {
    #[error("response ended before the value was complete")]
    Truncated,

    #[error("unsupported opcode {0:?} in response")]
    UnsupportedOpcode(char),

    #[error("unsupported {0} value in response")]
    UnsupportedType(&'static str),

    #[error("response nests deeper than {MAX_DEPTH} levels")]
    TooDeep,

    #[error("malformed response: {0}")]
    Malformed(String),
}

impl From<serde_pickle::Error> for DecodingError {
    fn from(err: serde_pickle::Error) -> Self {
        use serde_pickle::{Error, ErrorCode};

        match err {
            Error::Eval(ErrorCode::EOFWhileParsing, _) | Error::Syntax(ErrorCode::EOFWhileParsing) => {
                DecodingError::Truncated
            }
            Error::Io(ref e) if e.kind() == std::io::ErrorKind::UnexpectedEof => {
                DecodingError::Truncated
            }
            Error::Eval(ErrorCode::Unsupported(op), _) | Error::Syntax(ErrorCode::Unsupported(op)) => {
                DecodingError::UnsupportedOpcode(op)
            }
            other => DecodingError::Malformed(other.to_string()),
        }
    }
}

/// Serialize a command for the wire (without the sentinel).
pub fn encode(cmd: &Command) -> Result<Vec<u8>, EncodingError> {
    encode_value(&cmd.to_value())
}

/// Serialize an arbitrary value tree. Sequences are written as lists.
pub fn encode_value(value: &Value) -> Result<Vec<u8>, EncodingError> {
    serde_pickle::value_to_vec(&to_pickle(value), SerOptions::new()).map_err(EncodingError)
}

/// Parse one complete pickled value.
pub fn decode(bytes: &[u8]) -> Result<Value, DecodingError> {
    super::shape::check(bytes)?;
    let options = DeOptions::new().replace_unresolved_globals();
    let pickled = serde_pickle::value_from_slice(bytes, options)?;
    from_pickle(pickled, 0)
}

fn to_pickle(value: &Value) -> PickleValue {
    match value {
        Value::Integer(n) => PickleValue::I64(*n),
        Value::Text(s) => PickleValue::String(s.clone()),
        Value::Sequence(items) => PickleValue::List(items.iter().map(to_pickle).collect()),
        Value::Nil => PickleValue::None,
    }
}

fn from_pickle(value: PickleValue, depth: usize) -> Result<Value, DecodingError> {
    if depth > MAX_DEPTH {
        return Err(DecodingError::TooDeep);
    }
    match value {
        PickleValue::I64(n) => Ok(Value::Integer(n)),
        PickleValue::Bool(b) => Ok(Value::Integer(i64::from(b))),
        PickleValue::String(s) => Ok(Value::Text(s)),
        // Python 2 daemons send byte strings.
        PickleValue::Bytes(bytes) => String::from_utf8(bytes)
            .map(Value::Text)
            .map_err(|_| DecodingError::UnsupportedType("non-utf8 bytes")),
        PickleValue::List(items) | PickleValue::Tuple(items) => items
            .into_iter()
            .map(|item| from_pickle(item, depth + 1))
            .collect::<Result<Vec<_>, _>>()
            .map(Value::Sequence),
        // Unresolved instances arrive as their state dict.
        PickleValue::None
        | PickleValue::Dict(_)
        | PickleValue::Set(_)
        | PickleValue::FrozenSet(_) => Ok(Value::Nil),
        PickleValue::Int(_) => Err(DecodingError::UnsupportedType("big integer")),
        PickleValue::F64(_) => Err(DecodingError::UnsupportedType("float")),
    }
}
