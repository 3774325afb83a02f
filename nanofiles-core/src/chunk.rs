//! Frame manager: split file contents into `file` messages and track reassembly.

use crate::peer_message::PeerMessage;

/// Default frame size in raw bytes, safely below the stream's string-message limit
/// once base64-encoded.
pub const DEFAULT_FRAME_SIZE: usize = 32_000;

/// Number of frames needed for `total_len` bytes. An empty file still takes one frame.
pub fn frame_count(total_len: usize, frame_size: usize) -> usize {
    let size = effective_frame_size(frame_size);
    total_len.div_ceil(size).max(1)
}

fn effective_frame_size(frame_size: usize) -> usize {
    if frame_size == 0 {
        DEFAULT_FRAME_SIZE
    } else {
        frame_size
    }
}

/// Split contents into `file` messages whose `seq` counts down from `frameCount - 1` to 0.
pub fn split_into_frames(contents: &[u8], frame_size: usize) -> Vec<PeerMessage> {
    let size = effective_frame_size(frame_size);
    let count = frame_count(contents.len(), size);
    if contents.is_empty() {
        return vec![PeerMessage::File {
            data: Vec::new(),
            seq: 0,
        }];
    }
    contents
        .chunks(size)
        .enumerate()
        .map(|(i, slice)| PeerMessage::File {
            data: slice.to_vec(),
            seq: (count - 1 - i) as u32,
        })
        .collect()
}

/// What the receiver should do with the frame it just accepted.
#[derive(Debug, PartialEq, Eq)]
pub enum FrameStep<'a> {
    /// Append these bytes; more frames follow.
    More(&'a [u8]),
    /// Append these bytes; this was the terminal frame.
    Last(&'a [u8]),
    /// The serving peer does not have the file. Nothing was received.
    NotFound,
}

/// Receiver-side frame state: enforces the descending sequence.
#[derive(Default)]
pub struct Reassembler {
    expected_seq: Option<u32>,
    frames: usize,
    done: bool,
    bytes: u64,
}

impl Reassembler {
    pub fn new() -> Self {
        Self::default()
    }

    /// Accept the next message of a download reply.
    pub fn accept<'a>(&mut self, msg: &'a PeerMessage) -> Result<FrameStep<'a>, ReassemblyError> {
        if self.done {
            return Err(ReassemblyError::AlreadyComplete);
        }
        match msg {
            PeerMessage::FileNotFound if self.frames == 0 => {
                self.done = true;
                Ok(FrameStep::NotFound)
            }
            PeerMessage::File { data, seq } => {
                if let Some(expected) = self.expected_seq {
                    if *seq != expected {
                        return Err(ReassemblyError::OutOfOrder {
                            expected,
                            got: *seq,
                        });
                    }
                }
                self.frames += 1;
                self.bytes += data.len() as u64;
                if *seq == 0 {
                    self.done = true;
                    Ok(FrameStep::Last(data))
                } else {
                    self.expected_seq = Some(*seq - 1);
                    Ok(FrameStep::More(data))
                }
            }
            other => Err(ReassemblyError::Unexpected(other.operation())),
        }
    }

    pub fn is_complete(&self) -> bool {
        self.done
    }

    pub fn frames_received(&self) -> usize {
        self.frames
    }

    pub fn bytes_received(&self) -> u64 {
        self.bytes
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ReassemblyError {
    #[error("frame out of order: expected seq {expected}, got {got}")]
    OutOfOrder { expected: u32, got: u32 },
    #[error("unexpected {0} message during transfer")]
    Unexpected(&'static str),
    #[error("transfer already complete")]
    AlreadyComplete,
}
