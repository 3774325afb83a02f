//! Directory wire codec: one opcode byte, then operation-specific fields.
//!
//! Integers are big-endian. Strings are a 4-byte byte length followed by raw UTF-8,
//! with no terminator. Each [`DirMessage`] variant carries only the fields legal for
//! its operation, so a request can never be encoded with the wrong payload.

use std::net::SocketAddr;

use bytes::{Buf, BufMut};

use crate::catalog::FileInfo;

/// Largest datagram the directory transport carries.
pub const PACKET_MAX_SIZE: usize = 65_507;

/// Marker appended to a serving peer's nickname in USER_LIST.
pub const SERVER_MARKER: &str = "   <SERVER>";

const LEN_SIZE: usize = 4;

/// Operation codes, one byte on the wire.
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum OpCode {
    Login = 1,
    LoginOk = 2,
    Register = 3,
    RegisterOk = 4,
    RegisterFail = 5,
    GetUsers = 6,
    UserList = 7,
    ServeFiles = 8,
    ServeFilesOk = 9,
    Lookup = 10,
    LookupFound = 11,
    LookupNotFound = 12,
    Logoff = 13,
    Quit = 14,
    StopServing = 15,
    StopServingOk = 16,
    GetFiles = 17,
    FileList = 18,
}

impl OpCode {
    pub fn name(self) -> &'static str {
        match self {
            OpCode::Login => "LOGIN",
            OpCode::LoginOk => "LOGIN_OK",
            OpCode::Register => "REGISTER",
            OpCode::RegisterOk => "REGISTER_OK",
            OpCode::RegisterFail => "REGISTER_FAIL",
            OpCode::GetUsers => "GET_USERS",
            OpCode::UserList => "USER_LIST",
            OpCode::ServeFiles => "SERVE_FILES",
            OpCode::ServeFilesOk => "SERVE_FILES_OK",
            OpCode::Lookup => "LOOKUP",
            OpCode::LookupFound => "LOOKUP_FOUND",
            OpCode::LookupNotFound => "LOOKUP_NOT_FOUND",
            OpCode::Logoff => "LOGOFF",
            OpCode::Quit => "QUIT",
            OpCode::StopServing => "STOP_SERVING",
            OpCode::StopServingOk => "STOP_SERVING_OK",
            OpCode::GetFiles => "GET_FILES",
            OpCode::FileList => "FILE_LIST",
        }
    }
}

impl std::fmt::Display for OpCode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.name())
    }
}

impl TryFrom<u8> for OpCode {
    type Error = DecodeError;

    fn try_from(b: u8) -> Result<Self, Self::Error> {
        use OpCode::*;
        Ok(match b {
            1 => Login,
            2 => LoginOk,
            3 => Register,
            4 => RegisterOk,
            5 => RegisterFail,
            6 => GetUsers,
            7 => UserList,
            8 => ServeFiles,
            9 => ServeFilesOk,
            10 => Lookup,
            11 => LookupFound,
            12 => LookupNotFound,
            13 => Logoff,
            14 => Quit,
            15 => StopServing,
            16 => StopServingOk,
            17 => GetFiles,
            18 => FileList,
            other => return Err(DecodeError::UnknownOpcode(other)),
        })
    }
}

/// One entry of USER_LIST.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UserEntry {
    pub nick: String,
    pub serving: bool,
}

/// All directory messages, requests and responses.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DirMessage {
    Login,
    LoginOk { servers: u32 },
    Register { nick: String },
    RegisterOk,
    RegisterFail,
    GetUsers,
    UserList { users: Vec<UserEntry> },
    ServeFiles {
        nick: String,
        port: u16,
        files: Vec<FileInfo>,
    },
    ServeFilesOk,
    Lookup { nick: String },
    LookupFound { addr: SocketAddr },
    LookupNotFound,
    Logoff { nick: String },
    Quit,
    StopServing { nick: String },
    StopServingOk,
    GetFiles,
    FileList { files: Vec<FileInfo> },
}

impl DirMessage {
    pub fn opcode(&self) -> OpCode {
        match self {
            DirMessage::Login => OpCode::Login,
            DirMessage::LoginOk { .. } => OpCode::LoginOk,
            DirMessage::Register { .. } => OpCode::Register,
            DirMessage::RegisterOk => OpCode::RegisterOk,
            DirMessage::RegisterFail => OpCode::RegisterFail,
            DirMessage::GetUsers => OpCode::GetUsers,
            DirMessage::UserList { .. } => OpCode::UserList,
            DirMessage::ServeFiles { .. } => OpCode::ServeFiles,
            DirMessage::ServeFilesOk => OpCode::ServeFilesOk,
            DirMessage::Lookup { .. } => OpCode::Lookup,
            DirMessage::LookupFound { .. } => OpCode::LookupFound,
            DirMessage::LookupNotFound => OpCode::LookupNotFound,
            DirMessage::Logoff { .. } => OpCode::Logoff,
            DirMessage::Quit => OpCode::Quit,
            DirMessage::StopServing { .. } => OpCode::StopServing,
            DirMessage::StopServingOk => OpCode::StopServingOk,
            DirMessage::GetFiles => OpCode::GetFiles,
            DirMessage::FileList { .. } => OpCode::FileList,
        }
    }

    /// Encode into a single datagram payload.
    pub fn encode(&self) -> Result<Vec<u8>, EncodeError> {
        let mut out = Vec::with_capacity(64);
        out.put_u8(self.opcode() as u8);
        match self {
            DirMessage::Login
            | DirMessage::RegisterOk
            | DirMessage::RegisterFail
            | DirMessage::GetUsers
            | DirMessage::ServeFilesOk
            | DirMessage::LookupNotFound
            | DirMessage::Quit
            | DirMessage::StopServingOk
            | DirMessage::GetFiles => {}
            DirMessage::LoginOk { servers } => out.put_u32(*servers),
            DirMessage::Register { nick }
            | DirMessage::Lookup { nick }
            | DirMessage::Logoff { nick }
            | DirMessage::StopServing { nick } => put_string(&mut out, nick)?,
            DirMessage::UserList { users } => {
                put_count(&mut out, users.len())?;
                for user in users {
                    if user.serving {
                        put_string(&mut out, &format!("{}{}", user.nick, SERVER_MARKER))?;
                    } else {
                        put_string(&mut out, &user.nick)?;
                    }
                }
            }
            DirMessage::ServeFiles { nick, port, files } => {
                put_string(&mut out, nick)?;
                out.put_u32(u32::from(*port));
                put_files(&mut out, files)?;
            }
            DirMessage::LookupFound { addr } => put_string(&mut out, &addr.to_string())?,
            DirMessage::FileList { files } => put_files(&mut out, files)?,
        }
        if out.len() > PACKET_MAX_SIZE {
            return Err(EncodeError::TooLarge(out.len()));
        }
        Ok(out)
    }

    /// Decode a received datagram. Unknown opcodes, short payloads and trailing
    /// bytes all fail; a failed decode is never a valid negative answer.
    pub fn decode(bytes: &[u8]) -> Result<DirMessage, DecodeError> {
        let mut buf = bytes;
        if !buf.has_remaining() {
            return Err(DecodeError::Empty);
        }
        let opcode = OpCode::try_from(buf.get_u8())?;
        let msg = match opcode {
            OpCode::Login => DirMessage::Login,
            OpCode::LoginOk => DirMessage::LoginOk {
                servers: get_u32(&mut buf)?,
            },
            OpCode::Register => DirMessage::Register {
                nick: get_string(&mut buf)?,
            },
            OpCode::RegisterOk => DirMessage::RegisterOk,
            OpCode::RegisterFail => DirMessage::RegisterFail,
            OpCode::GetUsers => DirMessage::GetUsers,
            OpCode::UserList => {
                let count = get_count(&mut buf, LEN_SIZE)?;
                let mut users = Vec::with_capacity(count);
                for _ in 0..count {
                    let raw = get_string(&mut buf)?;
                    users.push(match raw.strip_suffix(SERVER_MARKER) {
                        Some(nick) => UserEntry {
                            nick: nick.to_string(),
                            serving: true,
                        },
                        None => UserEntry {
                            nick: raw,
                            serving: false,
                        },
                    });
                }
                DirMessage::UserList { users }
            }
            OpCode::ServeFiles => {
                let nick = get_string(&mut buf)?;
                let port = get_u32(&mut buf)?;
                let port = u16::try_from(port).map_err(|_| DecodeError::InvalidPort(port))?;
                let files = get_files(&mut buf)?;
                DirMessage::ServeFiles { nick, port, files }
            }
            OpCode::ServeFilesOk => DirMessage::ServeFilesOk,
            OpCode::Lookup => DirMessage::Lookup {
                nick: get_string(&mut buf)?,
            },
            OpCode::LookupFound => {
                let s = get_string(&mut buf)?;
                let addr = s.parse().map_err(|_| DecodeError::InvalidAddress(s))?;
                DirMessage::LookupFound { addr }
            }
            OpCode::LookupNotFound => DirMessage::LookupNotFound,
            OpCode::Logoff => DirMessage::Logoff {
                nick: get_string(&mut buf)?,
            },
            OpCode::Quit => DirMessage::Quit,
            OpCode::StopServing => DirMessage::StopServing {
                nick: get_string(&mut buf)?,
            },
            OpCode::StopServingOk => DirMessage::StopServingOk,
            OpCode::GetFiles => DirMessage::GetFiles,
            OpCode::FileList => DirMessage::FileList {
                files: get_files(&mut buf)?,
            },
        };
        if buf.has_remaining() {
            return Err(DecodeError::TrailingBytes(buf.remaining()));
        }
        Ok(msg)
    }
}

fn put_count(out: &mut Vec<u8>, n: usize) -> Result<(), EncodeError> {
    let n = i32::try_from(n).map_err(|_| EncodeError::TooLarge(n))?;
    out.put_i32(n);
    Ok(())
}

fn put_string(out: &mut Vec<u8>, s: &str) -> Result<(), EncodeError> {
    put_count(out, s.len())?;
    out.put_slice(s.as_bytes());
    Ok(())
}

fn put_files(out: &mut Vec<u8>, files: &[FileInfo]) -> Result<(), EncodeError> {
    put_count(out, files.len())?;
    for f in files {
        put_string(out, &f.name)?;
        put_string(out, &f.hash)?;
        out.put_u64(f.size);
    }
    Ok(())
}

fn need(buf: &&[u8], n: usize) -> Result<(), DecodeError> {
    if buf.remaining() < n {
        return Err(DecodeError::Truncated {
            needed: n,
            available: buf.remaining(),
        });
    }
    Ok(())
}

fn get_u32(buf: &mut &[u8]) -> Result<u32, DecodeError> {
    need(buf, 4)?;
    Ok(buf.get_u32())
}

fn get_u64(buf: &mut &[u8]) -> Result<u64, DecodeError> {
    need(buf, 8)?;
    Ok(buf.get_u64())
}

/// Read a signed count and bound it by what the remaining bytes could hold,
/// given the minimum encoded size of one element.
fn get_count(buf: &mut &[u8], min_elem: usize) -> Result<usize, DecodeError> {
    need(buf, 4)?;
    let n = buf.get_i32();
    let n = usize::try_from(n).map_err(|_| DecodeError::NegativeLength(n))?;
    let min_total = n.saturating_mul(min_elem);
    need(buf, min_total)?;
    Ok(n)
}

fn get_string(buf: &mut &[u8]) -> Result<String, DecodeError> {
    let len = get_count(buf, 1)?;
    let s = std::str::from_utf8(&buf[..len])
        .map_err(|_| DecodeError::InvalidUtf8)?
        .to_string();
    buf.advance(len);
    Ok(s)
}

fn get_files(buf: &mut &[u8]) -> Result<Vec<FileInfo>, DecodeError> {
    // name length + hash length + size
    let count = get_count(buf, LEN_SIZE * 2 + 8)?;
    let mut files = Vec::with_capacity(count);
    for _ in 0..count {
        let name = get_string(buf)?;
        let hash = get_string(buf)?;
        let size = get_u64(buf)?;
        files.push(FileInfo { name, hash, size });
    }
    Ok(files)
}

/// Error encoding a directory message.
#[derive(Debug, thiserror::Error)]
pub enum EncodeError {
    #[error("message too large: {0} bytes")]
    TooLarge(usize),
}

/// Error decoding a directory datagram.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum DecodeError {
    #[error("empty datagram")]
    Empty,
    #[error("unknown opcode {0}")]
    UnknownOpcode(u8),
    #[error("truncated message: needed {needed} bytes, {available} available")]
    Truncated { needed: usize, available: usize },
    #[error("negative length {0}")]
    NegativeLength(i32),
    #[error("invalid utf-8 in string field")]
    InvalidUtf8,
    #[error("invalid port {0}")]
    InvalidPort(u32),
    #[error("invalid peer address {0:?}")]
    InvalidAddress(String),
    #[error("{0} trailing bytes after message")]
    TrailingBytes(usize),
}
