//! Structural check of a pickle stream before it is decoded.
//!
//! serde-pickle builds, converts and drops its value tree recursively, so a
//! few kilobytes of nested containers are enough to overflow the stack.
//! [`check`] walks the opcode stream once without recursion and rejects
//! such input up front.
//!
//! Every container becomes a node in a graph. Memo references alias: a
//! container fetched from the memo and appended to later deepens every
//! container that already holds it. Nodes are therefore shared rather than
//! copied, which can only overestimate nesting, never miss it.

use std::collections::BTreeMap;

use super::value::{DecodingError, MAX_DEPTH};

/// Maximum number of values a response may expand to once shared memo
/// entries are copied out.
pub const MAX_VALUES: usize = 1 << 22;

// Opcodes understood by serde-pickle (protocols 0 through 5).
const MARK: u8 = b'(';
const STOP: u8 = b'.';
const POP: u8 = b'0';
const POP_MARK: u8 = b'1';
const DUP: u8 = b'2';
const FLOAT: u8 = b'F';
const INT: u8 = b'I';
const BININT: u8 = b'J';
const BININT1: u8 = b'K';
const LONG: u8 = b'L';
const BININT2: u8 = b'M';
const NONE: u8 = b'N';
const REDUCE: u8 = b'R';
const STRING: u8 = b'S';
const BINSTRING: u8 = b'T';
const SHORT_BINSTRING: u8 = b'U';
const UNICODE: u8 = b'V';
const BINUNICODE: u8 = b'X';
const APPEND: u8 = b'a';
const BUILD: u8 = b'b';
const GLOBAL: u8 = b'c';
const DICT: u8 = b'd';
const EMPTY_DICT: u8 = b'}';
const APPENDS: u8 = b'e';
const GET: u8 = b'g';
const BINGET: u8 = b'h';
const INST: u8 = b'i';
const LONG_BINGET: u8 = b'j';
const LIST: u8 = b'l';
const EMPTY_LIST: u8 = b']';
const OBJ: u8 = b'o';
const PUT: u8 = b'p';
const BINPUT: u8 = b'q';
const LONG_BINPUT: u8 = b'r';
const SETITEM: u8 = b's';
const TUPLE: u8 = b't';
const EMPTY_TUPLE: u8 = b')';
const SETITEMS: u8 = b'u';
const BINFLOAT: u8 = b'G';
const PROTO: u8 = 0x80;
const NEWOBJ: u8 = 0x81;
const TUPLE1: u8 = 0x85;
const TUPLE2: u8 = 0x86;
const TUPLE3: u8 = 0x87;
const NEWTRUE: u8 = 0x88;
const NEWFALSE: u8 = 0x89;
const LONG1: u8 = 0x8a;
const LONG4: u8 = 0x8b;
const BINBYTES: u8 = b'B';
const SHORT_BINBYTES: u8 = b'C';
const SHORT_BINUNICODE: u8 = 0x8c;
const BINUNICODE8: u8 = 0x8d;
const BINBYTES8: u8 = 0x8e;
const EMPTY_SET: u8 = 0x8f;
const ADDITEMS: u8 = 0x90;
const FROZENSET: u8 = 0x91;
const NEWOBJ_EX: u8 = 0x92;
const STACK_GLOBAL: u8 = 0x93;
const MEMOIZE: u8 = 0x94;
const FRAME: u8 = 0x95;
const BYTEARRAY8: u8 = 0x96;

/// Reject pickles that nest deeper than [`MAX_DEPTH`] or expand to more
/// than [`MAX_VALUES`] values. Trailing bytes after STOP are left for the
/// decoder to report.
pub fn check(bytes: &[u8]) -> Result<(), DecodingError> {
    let mut scanner = Scanner {
        bytes,
        pos: 0,
        nodes: Vec::new(),
        stack: Vec::new(),
        frames: Vec::new(),
        memo: BTreeMap::new(),
    };
    let root = scanner.run()?;
    measure(&scanner.nodes, root)
}

/// Children of each node, by index.
type Nodes = Vec<Vec<usize>>;

struct Scanner<'a> {
    bytes: &'a [u8],
    pos: usize,
    nodes: Nodes,
    stack: Vec<usize>,
    /// Stacks saved by MARK.
    frames: Vec<Vec<usize>>,
    memo: BTreeMap<u32, usize>,
}

impl<'a> Scanner<'a> {
    fn run(&mut self) -> Result<usize, DecodingError> {
        loop {
            let op = self.byte()?;
            match op {
                PROTO => self.skip(1)?,
                FRAME => self.skip(8)?,
                STOP => return self.pop(),
                MARK => {
                    let outer = std::mem::take(&mut self.stack);
                    self.frames.push(outer);
                }
                POP => {
                    if self.stack.is_empty() {
                        self.pop_mark()?;
                    } else {
                        self.pop()?;
                    }
                }
                POP_MARK => {
                    self.pop_mark()?;
                }
                DUP => {
                    let top = self.top()?;
                    self.stack.push(top);
                }

                PUT => {
                    let id = ascii_id(self.line())?;
                    self.memoize(id)?;
                }
                BINPUT => {
                    let id = u32::from(self.byte()?);
                    self.memoize(id)?;
                }
                LONG_BINPUT => {
                    let id = self.le_u32()?;
                    self.memoize(id)?;
                }
                MEMOIZE => {
                    let id = u32::try_from(self.memo.len())
                        .map_err(|_| DecodingError::Malformed("memo overflow".to_string()))?;
                    self.memoize(id)?;
                }
                GET => {
                    let id = ascii_id(self.line())?;
                    self.recall(id)?;
                }
                BINGET => {
                    let id = u32::from(self.byte()?);
                    self.recall(id)?;
                }
                LONG_BINGET => {
                    let id = self.le_u32()?;
                    self.recall(id)?;
                }

                NONE | NEWTRUE | NEWFALSE => self.leaf(),
                INT | LONG | FLOAT | STRING | UNICODE => {
                    self.line();
                    self.leaf();
                }
                BININT1 => self.fixed(1)?,
                BININT2 => self.fixed(2)?,
                BININT => self.fixed(4)?,
                BINFLOAT => self.fixed(8)?,
                LONG1 | SHORT_BINBYTES | SHORT_BINSTRING | SHORT_BINUNICODE => {
                    self.prefixed(1)?;
                }
                LONG4 | BINBYTES | BINSTRING | BINUNICODE => self.prefixed(4)?,
                BINBYTES8 | BINUNICODE8 | BYTEARRAY8 => self.prefixed(8)?,

                EMPTY_TUPLE | EMPTY_LIST | EMPTY_DICT | EMPTY_SET => self.leaf(),
                TUPLE1 => {
                    let a = self.pop()?;
                    self.node(vec![a]);
                }
                TUPLE2 => {
                    let b = self.pop()?;
                    let a = self.pop()?;
                    self.node(vec![a, b]);
                }
                TUPLE3 => {
                    let c = self.pop()?;
                    let b = self.pop()?;
                    let a = self.pop()?;
                    self.node(vec![a, b, c]);
                }
                TUPLE | LIST | DICT | FROZENSET => {
                    let items = self.pop_mark()?;
                    self.node(items);
                }
                APPEND => {
                    let item = self.pop()?;
                    self.adopt(vec![item])?;
                }
                SETITEM => {
                    let value = self.pop()?;
                    let key = self.pop()?;
                    self.adopt(vec![key, value])?;
                }
                APPENDS | SETITEMS | ADDITEMS => {
                    let items = self.pop_mark()?;
                    self.adopt(items)?;
                }

                GLOBAL => {
                    self.line();
                    self.line();
                    self.leaf();
                }
                STACK_GLOBAL => {
                    self.pop()?;
                    self.pop()?;
                    self.leaf();
                }
                REDUCE => {
                    let args = self.pop()?;
                    let callable = self.pop()?;
                    self.node(vec![callable, args]);
                }
                INST => {
                    self.line();
                    self.line();
                    let args = self.pop_mark()?;
                    self.node(args);
                }
                OBJ => {
                    let mut args = self.pop_mark()?;
                    args.push(self.pop()?);
                    self.node(args);
                }
                NEWOBJ => {
                    let args = self.pop()?;
                    let class = self.pop()?;
                    self.node(vec![class, args]);
                }
                NEWOBJ_EX => {
                    let kwargs = self.pop()?;
                    let args = self.pop()?;
                    let class = self.pop()?;
                    self.node(vec![class, args, kwargs]);
                }
                BUILD => {
                    // The decoder replaces the object with its state.
                    let state = self.pop()?;
                    self.pop()?;
                    self.stack.push(state);
                }

                other => return Err(DecodingError::UnsupportedOpcode(other as char)),
            }
        }
    }

    fn byte(&mut self) -> Result<u8, DecodingError> {
        let byte = *self.bytes.get(self.pos).ok_or(DecodingError::Truncated)?;
        self.pos += 1;
        Ok(byte)
    }

    fn take(&mut self, n: usize) -> Result<&'a [u8], DecodingError> {
        let end = self
            .pos
            .checked_add(n)
            .filter(|&end| end <= self.bytes.len())
            .ok_or(DecodingError::Truncated)?;
        let slice = &self.bytes[self.pos..end];
        self.pos = end;
        Ok(slice)
    }

    fn skip(&mut self, n: usize) -> Result<(), DecodingError> {
        self.take(n).map(|_| ())
    }

    /// Everything up to and including the next newline, or the rest of the
    /// input if there is none.
    fn line(&mut self) -> &'a [u8] {
        let rest = &self.bytes[self.pos..];
        let len = rest
            .iter()
            .position(|&b| b == b'\n')
            .map_or(rest.len(), |i| i + 1);
        self.pos += len;
        &rest[..len]
    }

    fn le_len(&mut self, width: usize) -> Result<usize, DecodingError> {
        let raw = self.take(width)?;
        let mut buf = [0u8; 8];
        buf[..width].copy_from_slice(raw);
        usize::try_from(u64::from_le_bytes(buf)).map_err(|_| DecodingError::Truncated)
    }

    fn le_u32(&mut self) -> Result<u32, DecodingError> {
        let raw = self.take(4)?;
        Ok(u32::from_le_bytes([raw[0], raw[1], raw[2], raw[3]]))
    }

    /// A scalar with a fixed-width payload.
    fn fixed(&mut self, width: usize) -> Result<(), DecodingError> {
        self.skip(width)?;
        self.leaf();
        Ok(())
    }

    /// A scalar whose payload length precedes it.
    fn prefixed(&mut self, width: usize) -> Result<(), DecodingError> {
        let len = self.le_len(width)?;
        self.fixed(len)
    }

    fn leaf(&mut self) {
        self.node(Vec::new());
    }

    fn node(&mut self, children: Vec<usize>) {
        self.nodes.push(children);
        self.stack.push(self.nodes.len() - 1);
    }

    fn pop(&mut self) -> Result<usize, DecodingError> {
        self.stack.pop().ok_or_else(underflow)
    }

    fn top(&self) -> Result<usize, DecodingError> {
        self.stack.last().copied().ok_or_else(underflow)
    }

    fn pop_mark(&mut self) -> Result<Vec<usize>, DecodingError> {
        let outer = self.frames.pop().ok_or_else(underflow)?;
        Ok(std::mem::replace(&mut self.stack, outer))
    }

    /// Add children to the container on top of the stack.
    fn adopt(&mut self, children: Vec<usize>) -> Result<(), DecodingError> {
        let top = self.top()?;
        self.nodes[top].extend(children);
        Ok(())
    }

    fn memoize(&mut self, id: u32) -> Result<(), DecodingError> {
        let top = self.top()?;
        self.memo.insert(id, top);
        Ok(())
    }

    fn recall(&mut self, id: u32) -> Result<(), DecodingError> {
        let node = *self
            .memo
            .get(&id)
            .ok_or_else(|| DecodingError::Malformed(format!("missing memo entry {id}")))?;
        self.stack.push(node);
        Ok(())
    }
}

fn underflow() -> DecodingError {
    DecodingError::Malformed("stack underflow".to_string())
}

fn ascii_id(line: &[u8]) -> Result<u32, DecodingError> {
    std::str::from_utf8(line)
        .ok()
        .and_then(|s| s.trim_end().parse().ok())
        .ok_or_else(|| DecodingError::Malformed("invalid memo id".to_string()))
}

#[derive(Clone, Copy, PartialEq)]
enum Visit {
    New,
    Open,
    Done,
}

/// Depth-first walk from `root` with an explicit stack. Each node's height
/// and expanded size are settled once all of its children are.
fn measure(nodes: &[Vec<usize>], root: usize) -> Result<(), DecodingError> {
    let mut visit = vec![Visit::New; nodes.len()];
    let mut height = vec![0usize; nodes.len()];
    let mut size = vec![0usize; nodes.len()];
    let mut work: Vec<(usize, usize)> = vec![(root, 0)];
    visit[root] = Visit::Open;

    while let Some(frame) = work.last_mut() {
        let (node, next) = *frame;
        if let Some(&child) = nodes[node].get(next) {
            frame.1 += 1;
            match visit[child] {
                Visit::Done => {}
                Visit::Open => {
                    return Err(DecodingError::Malformed(
                        "recursive structure".to_string(),
                    ));
                }
                Visit::New => {
                    if work.len() > MAX_DEPTH {
                        return Err(DecodingError::TooDeep);
                    }
                    visit[child] = Visit::Open;
                    work.push((child, 0));
                }
            }
            continue;
        }

        let children = &nodes[node];
        let h = children.iter().map(|&c| height[c] + 1).max().unwrap_or(0);
        if h > MAX_DEPTH {
            return Err(DecodingError::TooDeep);
        }
        let s = children
            .iter()
            .fold(1usize, |acc, &c| acc.saturating_add(size[c]));
        if s > MAX_VALUES {
            return Err(DecodingError::Malformed(format!(
                "response expands to more than {MAX_VALUES} values"
            )));
        }
        height[node] = h;
        size[node] = s;
        visit[node] = Visit::Done;
        work.pop();
    }
    Ok(())
}
