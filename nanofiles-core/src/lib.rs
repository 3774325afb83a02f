//! NanoFiles protocol core.
//! Host-driven: no I/O; host passes decoded requests and frames, receives responses.

pub mod catalog;
pub mod chunk;
pub mod dir_message;
pub mod directory;
pub mod integrity;
pub mod peer_message;

pub use catalog::{Catalog, FileCatalog, FileInfo, SharedFile};
pub use chunk::{split_into_frames, FrameStep, Reassembler, ReassemblyError, DEFAULT_FRAME_SIZE};
pub use dir_message::{DecodeError, DirMessage, EncodeError, OpCode, UserEntry, PACKET_MAX_SIZE};
pub use directory::{validate_nickname, DirectoryState, NicknameError};
pub use peer_message::{ParseError, PeerMessage};
