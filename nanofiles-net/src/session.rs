//! Transfer session over a peer stream.
//!
//! Serving side: answer `download` and `getFiles` until the peer sends `close`.
//! Downloading side: [`PeerConnector`] requests a file, writes frames to disk as they
//! arrive and verifies the written file. Any failure removes the partial file.

use std::io;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};

use log::{debug, info, warn};
use nanofiles_core::chunk::split_into_frames;
use nanofiles_core::integrity::{self, DigestWriter};
use nanofiles_core::{FileCatalog, FileInfo, FrameStep, PeerMessage, Reassembler, ReassemblyError};
use tokio::fs::{File, OpenOptions};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::TcpStream;

use crate::framing::{read_message, write_message, FramingError};

const VERIFY_BLOCK: usize = 64 * 1024;

#[derive(Debug, thiserror::Error)]
pub enum TransferError {
    #[error("i/o error: {0}")]
    Io(#[from] io::Error),
    #[error(transparent)]
    Framing(#[from] FramingError),
    #[error(transparent)]
    Reassembly(#[from] ReassemblyError),
    #[error("peer has no file matching {0}")]
    NotFound(String),
    #[error("downloaded file does not match {expected} (got {actual})")]
    Corrupted { expected: String, actual: String },
    #[error("{} already exists", .0.display())]
    AlreadyExists(PathBuf),
    #[error("unexpected {0} message")]
    Unexpected(&'static str),
}

/// Serve one connected peer until it closes. Returns the number of files sent.
pub async fn serve_session<S, C>(
    stream: &mut S,
    catalog: &C,
    frame_size: usize,
) -> Result<usize, TransferError>
where
    S: AsyncRead + AsyncWrite + Unpin,
    C: FileCatalog + ?Sized,
{
    let mut sent = 0;
    loop {
        let msg = match read_message(stream).await {
            Ok(m) => m,
            Err(FramingError::Closed) => {
                debug!("peer went away without close");
                return Ok(sent);
            }
            Err(e) => return Err(e.into()),
        };
        match msg {
            PeerMessage::Download { hash } => {
                if send_file(stream, catalog, &hash, frame_size).await? {
                    sent += 1;
                }
            }
            PeerMessage::GetFiles => {
                let files = catalog.list_local_files();
                write_message(stream, &PeerMessage::ServedFiles { files }).await?;
            }
            PeerMessage::Close => return Ok(sent),
            other => return Err(TransferError::Unexpected(other.operation())),
        }
    }
}

/// Stream the file for `hash` as descending-seq frames, or answer `fileNotFound`.
async fn send_file<S, C>(
    stream: &mut S,
    catalog: &C,
    hash: &str,
    frame_size: usize,
) -> Result<bool, TransferError>
where
    S: AsyncWrite + Unpin,
    C: FileCatalog + ?Sized,
{
    let contents = match catalog.resolve_path(hash) {
        Some(path) => match tokio::fs::read(path).await {
            Ok(c) => Some(c),
            Err(e) => {
                warn!("cannot read {}: {}", path.display(), e);
                None
            }
        },
        None => None,
    };
    let Some(contents) = contents else {
        info!("no shared file matches {}", hash);
        write_message(stream, &PeerMessage::FileNotFound).await?;
        return Ok(false);
    };
    let frames = split_into_frames(&contents, frame_size);
    info!(
        "sending {} ({} bytes, {} frames)",
        hash,
        contents.len(),
        frames.len()
    );
    for frame in &frames {
        write_message(stream, frame).await?;
    }
    Ok(true)
}

/// Client side of a peer connection.
pub struct PeerConnector<S> {
    stream: S,
}

impl PeerConnector<TcpStream> {
    pub async fn connect(addr: SocketAddr) -> Result<Self, TransferError> {
        let stream = TcpStream::connect(addr).await?;
        debug!("connected to peer {}", addr);
        Ok(Self::new(stream))
    }
}

impl<S: AsyncRead + AsyncWrite + Unpin> PeerConnector<S> {
    pub fn new(stream: S) -> Self {
        Self { stream }
    }

    /// Download the file identified by `hash` (full digest or unique prefix) into
    /// `output`. Refuses to touch an existing file. Returns bytes written.
    pub async fn download(&mut self, hash: &str, output: &Path) -> Result<u64, TransferError> {
        if tokio::fs::try_exists(output).await? {
            return Err(TransferError::AlreadyExists(output.to_path_buf()));
        }
        write_message(
            &mut self.stream,
            &PeerMessage::Download {
                hash: hash.to_string(),
            },
        )
        .await?;

        let mut file = None;
        let result = self.receive(hash, output, &mut file).await;
        let created = file.is_some();
        drop(file);
        match result {
            Ok(n) => Ok(n),
            Err(e) => {
                if created {
                    if let Err(rm) = tokio::fs::remove_file(output).await {
                        warn!("cannot remove partial {}: {}", output.display(), rm);
                    } else {
                        info!("removed partial {}", output.display());
                    }
                }
                Err(e)
            }
        }
    }

    async fn receive(
        &mut self,
        hash: &str,
        output: &Path,
        file: &mut Option<File>,
    ) -> Result<u64, TransferError> {
        let mut frames = Reassembler::new();
        loop {
            let msg = read_message(&mut self.stream).await?;
            let (bytes, last) = match frames.accept(&msg)? {
                FrameStep::NotFound => return Err(TransferError::NotFound(hash.to_string())),
                FrameStep::More(bytes) => (bytes, false),
                FrameStep::Last(bytes) => (bytes, true),
            };
            if file.is_none() {
                let f = OpenOptions::new()
                    .write(true)
                    .create_new(true)
                    .open(output)
                    .await?;
                *file = Some(f);
            }
            if let Some(f) = file.as_mut() {
                f.write_all(bytes).await?;
                if last {
                    f.flush().await?;
                    break;
                }
            }
        }
        debug!(
            "received {} frames, {} bytes",
            frames.frames_received(),
            frames.bytes_received()
        );

        let actual = digest_file(output).await?;
        if !integrity::matches_target(&actual, hash) {
            return Err(TransferError::Corrupted {
                expected: hash.to_string(),
                actual,
            });
        }
        info!(
            "downloaded {} ({} bytes) to {}",
            actual,
            frames.bytes_received(),
            output.display()
        );
        Ok(frames.bytes_received())
    }

    /// Ask the peer for the files it shares.
    pub async fn query_files(&mut self) -> Result<Vec<FileInfo>, TransferError> {
        write_message(&mut self.stream, &PeerMessage::GetFiles).await?;
        match read_message(&mut self.stream).await? {
            PeerMessage::ServedFiles { files } => Ok(files),
            other => Err(TransferError::Unexpected(other.operation())),
        }
    }

    /// Tell the peer the session is over.
    pub async fn close(mut self) -> Result<(), TransferError> {
        write_message(&mut self.stream, &PeerMessage::Close).await?;
        self.stream.shutdown().await?;
        Ok(())
    }
}

async fn digest_file(path: &Path) -> io::Result<String> {
    let mut f = File::open(path).await?;
    let mut digest = DigestWriter::new();
    let mut buf = vec![0u8; VERIFY_BLOCK];
    loop {
        let n = f.read(&mut buf).await?;
        if n == 0 {
            break;
        }
        digest.update(&buf[..n]);
    }
    Ok(digest.finish_hex())
}
