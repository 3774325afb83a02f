//! Peer transfer protocol: `field:value` lines closed by a blank line.
//!
//! The first line is always `operation:<name>`. Field names parse case-insensitively;
//! values are trimmed. File payloads travel base64-encoded in the `data` field.

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;

use crate::catalog::FileInfo;

const DELIMITER: char = ':';
const END_LINE: char = '\n';

pub const FIELD_OPERATION: &str = "operation";
pub const FIELD_HASH: &str = "hash";
pub const FIELD_DATA: &str = "data";
pub const FIELD_SEQ: &str = "seq";
pub const FIELD_NAME: &str = "name";
pub const FIELD_SIZE: &str = "size";

pub const OP_DOWNLOAD: &str = "download";
pub const OP_FILE: &str = "file";
pub const OP_FILE_NOT_FOUND: &str = "fileNotFound";
pub const OP_GET_FILES: &str = "getFiles";
pub const OP_SERVED_FILES: &str = "servedFiles";
pub const OP_CLOSE: &str = "close";

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PeerMessage {
    /// Ask the serving peer for the file identified by `hash` (full digest or prefix).
    Download { hash: String },
    /// One frame of file content. `seq` counts down; 0 marks the last frame.
    File { data: Vec<u8>, seq: u32 },
    FileNotFound,
    GetFiles,
    ServedFiles { files: Vec<FileInfo> },
    Close,
}

impl PeerMessage {
    pub fn operation(&self) -> &'static str {
        match self {
            PeerMessage::Download { .. } => OP_DOWNLOAD,
            PeerMessage::File { .. } => OP_FILE,
            PeerMessage::FileNotFound => OP_FILE_NOT_FOUND,
            PeerMessage::GetFiles => OP_GET_FILES,
            PeerMessage::ServedFiles { .. } => OP_SERVED_FILES,
            PeerMessage::Close => OP_CLOSE,
        }
    }

    /// Render as text, including the terminating blank line.
    pub fn render(&self) -> String {
        let mut out = String::new();
        push_field(&mut out, FIELD_OPERATION, self.operation());
        match self {
            PeerMessage::Download { hash } => push_field(&mut out, FIELD_HASH, hash),
            PeerMessage::File { data, seq } => {
                push_field(&mut out, FIELD_DATA, &BASE64.encode(data));
                push_field(&mut out, FIELD_SEQ, &seq.to_string());
            }
            PeerMessage::ServedFiles { files } => {
                for f in files {
                    push_field(&mut out, FIELD_NAME, &f.name);
                    push_field(&mut out, FIELD_SIZE, &f.size.to_string());
                    push_field(&mut out, FIELD_HASH, &f.hash);
                }
            }
            PeerMessage::FileNotFound | PeerMessage::GetFiles | PeerMessage::Close => {}
        }
        out.push(END_LINE);
        out
    }

    /// Parse one message. The operation is taken from the first field and only the
    /// field layout legal for it is accepted.
    pub fn parse(text: &str) -> Result<PeerMessage, ParseError> {
        let fields = split_fields(text)?;
        let (first, rest) = fields.split_first().ok_or(ParseError::Empty)?;
        if first.0 != FIELD_OPERATION {
            return Err(ParseError::MissingOperation);
        }
        let op = first.1;
        let msg = match op {
            OP_DOWNLOAD => {
                let [hash] = expect_fields(op, rest, [FIELD_HASH])?;
                PeerMessage::Download {
                    hash: hash.to_string(),
                }
            }
            OP_FILE => {
                let [data, seq] = expect_fields(op, rest, [FIELD_DATA, FIELD_SEQ])?;
                let data = BASE64
                    .decode(data)
                    .map_err(|e| ParseError::InvalidValue(FIELD_DATA, e.to_string()))?;
                let seq = seq
                    .parse()
                    .map_err(|_| ParseError::InvalidValue(FIELD_SEQ, seq.to_string()))?;
                PeerMessage::File { data, seq }
            }
            OP_FILE_NOT_FOUND => {
                expect_fields(op, rest, [])?;
                PeerMessage::FileNotFound
            }
            OP_GET_FILES => {
                expect_fields(op, rest, [])?;
                PeerMessage::GetFiles
            }
            OP_CLOSE => {
                expect_fields(op, rest, [])?;
                PeerMessage::Close
            }
            OP_SERVED_FILES => {
                if rest.len() % 3 != 0 {
                    return Err(ParseError::UnexpectedLayout(op.to_string()));
                }
                let mut files = Vec::with_capacity(rest.len() / 3);
                for triple in rest.chunks(3) {
                    let [name, size, hash] =
                        expect_fields(op, triple, [FIELD_NAME, FIELD_SIZE, FIELD_HASH])?;
                    let size = size
                        .parse()
                        .map_err(|_| ParseError::InvalidValue(FIELD_SIZE, size.to_string()))?;
                    files.push(FileInfo::new(name, hash, size));
                }
                PeerMessage::ServedFiles { files }
            }
            other => return Err(ParseError::UnknownOperation(other.to_string())),
        };
        Ok(msg)
    }
}

fn push_field(out: &mut String, name: &str, value: &str) {
    out.push_str(name);
    out.push(DELIMITER);
    out.push_str(value);
    out.push(END_LINE);
}

/// Split into (lowercased field name, trimmed value) pairs up to the blank line.
fn split_fields(text: &str) -> Result<Vec<(String, &str)>, ParseError> {
    let mut fields = Vec::new();
    for raw in text.split_inclusive(END_LINE) {
        let Some(line) = raw.strip_suffix(END_LINE) else {
            break;
        };
        let line = line.strip_suffix('\r').unwrap_or(line);
        if line.is_empty() {
            return Ok(fields);
        }
        let (name, value) = line
            .split_once(DELIMITER)
            .ok_or_else(|| ParseError::MalformedLine(line.to_string()))?;
        fields.push((name.trim().to_ascii_lowercase(), value.trim()));
    }
    Err(ParseError::Unterminated)
}

fn expect_fields<'a, const N: usize>(
    op: &str,
    fields: &[(String, &'a str)],
    names: [&'static str; N],
) -> Result<[&'a str; N], ParseError> {
    let layout_err = || ParseError::UnexpectedLayout(op.to_string());
    if fields.len() != N {
        return Err(layout_err());
    }
    let mut values = [""; N];
    for (i, ((name, value), expected)) in fields.iter().zip(names).enumerate() {
        if name != expected {
            return Err(layout_err());
        }
        values[i] = *value;
    }
    Ok(values)
}

/// Error parsing a peer text message.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ParseError {
    #[error("empty message")]
    Empty,
    #[error("message not terminated by a blank line")]
    Unterminated,
    #[error("malformed line {0:?}")]
    MalformedLine(String),
    #[error("first field is not the operation")]
    MissingOperation,
    #[error("unknown operation {0:?}")]
    UnknownOperation(String),
    #[error("unexpected field layout for {0}")]
    UnexpectedLayout(String),
    #[error("invalid value for {0}: {1}")]
    InvalidValue(&'static str, String),
}
