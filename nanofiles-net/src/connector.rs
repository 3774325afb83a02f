//! Directory connector: request/response over UDP with timeout and bounded retransmission.
//!
//! Each attempt sends the identical request and waits up to the configured timeout
//! for a datagram from the directory. When every attempt times out the connector
//! reports [`ConnectorError::Unreachable`], which callers treat as fatal for the
//! directory session.
//!
//! Known weakness, inherited from the protocol: requests carry no id. A reply that
//! arrives after its attempt timed out is taken as the answer to whatever is asked
//! next, and a REGISTER or SERVE_FILES retransmitted after the directory already
//! acted on it is applied again (REGISTER then answers REGISTER_FAIL).

use std::net::SocketAddr;
use std::time::Duration;

use log::{debug, error, warn};
use nanofiles_core::{
    validate_nickname, DecodeError, DirMessage, EncodeError, FileInfo, NicknameError, OpCode,
    UserEntry, PACKET_MAX_SIZE,
};
use tokio::net::UdpSocket;
use tokio::time::Instant;

/// Wait per attempt.
pub const DEFAULT_TIMEOUT: Duration = Duration::from_millis(1000);
/// Attempts before the directory is declared unreachable.
pub const DEFAULT_MAX_ATTEMPTS: u32 = 5;

pub struct DirectoryConnector {
    socket: UdpSocket,
    directory: SocketAddr,
    timeout: Duration,
    max_attempts: u32,
}

impl DirectoryConnector {
    /// Resolve the directory and open a local socket for the rest of the session.
    pub async fn connect(
        host: &str,
        port: u16,
        timeout: Duration,
        max_attempts: u32,
    ) -> Result<Self, ConnectorError> {
        let directory = tokio::net::lookup_host((host, port))
            .await?
            .next()
            .ok_or_else(|| ConnectorError::Resolve(host.to_string()))?;
        Self::with_addr(directory, timeout, max_attempts).await
    }

    pub async fn with_addr(
        directory: SocketAddr,
        timeout: Duration,
        max_attempts: u32,
    ) -> Result<Self, ConnectorError> {
        let bind: SocketAddr = if directory.is_ipv4() {
            ([0, 0, 0, 0], 0).into()
        } else {
            (std::net::Ipv6Addr::UNSPECIFIED, 0).into()
        };
        let socket = UdpSocket::bind(bind).await?;
        Ok(Self {
            socket,
            directory,
            timeout,
            max_attempts: max_attempts.max(1),
        })
    }

    pub fn directory_addr(&self) -> SocketAddr {
        self.directory
    }

    /// Send `request` and return the first datagram the directory sends back.
    /// Datagrams from any other address are ignored and do not extend the wait.
    pub async fn exchange(&self, request: &[u8]) -> Result<Vec<u8>, ConnectorError> {
        let mut buf = vec![0u8; PACKET_MAX_SIZE];
        for attempt in 1..=self.max_attempts {
            self.socket.send_to(request, self.directory).await?;
            let deadline = Instant::now() + self.timeout;
            loop {
                match tokio::time::timeout_at(deadline, self.socket.recv_from(&mut buf)).await {
                    Ok(Ok((n, from))) if from == self.directory => {
                        buf.truncate(n);
                        return Ok(buf);
                    }
                    Ok(Ok((_, from))) => {
                        debug!("ignoring datagram from {}", from);
                    }
                    Ok(Err(e)) => return Err(ConnectorError::Io(e)),
                    Err(_) => break,
                }
            }
            warn!(
                "no response from directory {} (attempt {}/{})",
                self.directory, attempt, self.max_attempts
            );
        }
        error!(
            "directory {} unreachable after {} attempts",
            self.directory, self.max_attempts
        );
        Err(ConnectorError::Unreachable {
            addr: self.directory,
            attempts: self.max_attempts,
        })
    }

    /// Encode, exchange, decode.
    pub async fn request(&self, msg: &DirMessage) -> Result<DirMessage, ConnectorError> {
        let bytes = msg.encode()?;
        let reply = self.exchange(&bytes).await?;
        Ok(DirMessage::decode(&reply)?)
    }

    /// Returns the number of peers currently serving files.
    pub async fn login(&self) -> Result<u32, ConnectorError> {
        match self.request(&DirMessage::Login).await? {
            DirMessage::LoginOk { servers } => Ok(servers),
            other => Err(unexpected(&other)),
        }
    }

    /// Returns false if the directory already has this nickname.
    pub async fn register(&self, nick: &str) -> Result<bool, ConnectorError> {
        validate_nickname(nick)?;
        let msg = DirMessage::Register {
            nick: nick.to_string(),
        };
        match self.request(&msg).await? {
            DirMessage::RegisterOk => Ok(true),
            DirMessage::RegisterFail => Ok(false),
            other => Err(unexpected(&other)),
        }
    }

    pub async fn users(&self) -> Result<Vec<UserEntry>, ConnectorError> {
        match self.request(&DirMessage::GetUsers).await? {
            DirMessage::UserList { users } => Ok(users),
            other => Err(unexpected(&other)),
        }
    }

    /// Publish `files` as served by `nick` on TCP `port`. The directory always accepts.
    pub async fn serve_files(
        &self,
        nick: &str,
        port: u16,
        files: Vec<FileInfo>,
    ) -> Result<(), ConnectorError> {
        let msg = DirMessage::ServeFiles {
            nick: nick.to_string(),
            port,
            files,
        };
        match self.request(&msg).await? {
            DirMessage::ServeFilesOk => Ok(()),
            other => Err(unexpected(&other)),
        }
    }

    /// Address where `nick` serves files, or `None` if it is not serving.
    pub async fn lookup(&self, nick: &str) -> Result<Option<SocketAddr>, ConnectorError> {
        let msg = DirMessage::Lookup {
            nick: nick.to_string(),
        };
        match self.request(&msg).await? {
            DirMessage::LookupFound { addr } => Ok(Some(addr)),
            DirMessage::LookupNotFound => Ok(None),
            other => Err(unexpected(&other)),
        }
    }

    pub async fn logoff(&self, nick: &str) -> Result<bool, ConnectorError> {
        let msg = DirMessage::Logoff {
            nick: nick.to_string(),
        };
        match self.request(&msg).await? {
            DirMessage::Quit => Ok(true),
            other => Err(unexpected(&other)),
        }
    }

    pub async fn stop_serving(&self, nick: &str) -> Result<bool, ConnectorError> {
        let msg = DirMessage::StopServing {
            nick: nick.to_string(),
        };
        match self.request(&msg).await? {
            DirMessage::StopServingOk => Ok(true),
            other => Err(unexpected(&other)),
        }
    }

    pub async fn files(&self) -> Result<Vec<FileInfo>, ConnectorError> {
        match self.request(&DirMessage::GetFiles).await? {
            DirMessage::FileList { files } => Ok(files),
            other => Err(unexpected(&other)),
        }
    }
}

fn unexpected(msg: &DirMessage) -> ConnectorError {
    ConnectorError::UnexpectedResponse(msg.opcode())
}

#[derive(Debug, thiserror::Error)]
pub enum ConnectorError {
    #[error("directory {addr} unreachable after {attempts} attempts")]
    Unreachable { addr: SocketAddr, attempts: u32 },
    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),
    #[error("cannot resolve directory host {0}")]
    Resolve(String),
    #[error("cannot encode request: {0}")]
    Encode(#[from] EncodeError),
    #[error("malformed response: {0}")]
    Decode(#[from] DecodeError),
    #[error("unexpected response {0}")]
    UnexpectedResponse(OpCode),
    #[error("invalid nickname: {0}")]
    InvalidNickname(#[from] NicknameError),
}

impl ConnectorError {
    /// The directory session cannot continue; the host decides whether to exit or reconnect.
    pub fn is_fatal(&self) -> bool {
        matches!(self, ConnectorError::Unreachable { .. })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const SHORT: Duration = Duration::from_millis(60);

    async fn silent_directory() -> UdpSocket {
        UdpSocket::bind("127.0.0.1:0").await.unwrap()
    }

    fn drain(socket: &UdpSocket) -> usize {
        let mut buf = [0u8; 64];
        let mut n = 0;
        while socket.try_recv_from(&mut buf).is_ok() {
            n += 1;
        }
        n
    }

    #[tokio::test]
    async fn gives_up_after_max_attempts() {
        let silent = silent_directory().await;
        let addr = silent.local_addr().unwrap();
        let connector = DirectoryConnector::with_addr(addr, SHORT, DEFAULT_MAX_ATTEMPTS)
            .await
            .unwrap();

        let started = std::time::Instant::now();
        let err = connector.exchange(&[1]).await.unwrap_err();
        let elapsed = started.elapsed();

        assert!(err.is_fatal());
        assert!(matches!(err, ConnectorError::Unreachable { attempts: 5, .. }));
        assert!(elapsed >= SHORT * DEFAULT_MAX_ATTEMPTS);
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(drain(&silent), DEFAULT_MAX_ATTEMPTS as usize);
    }

    #[tokio::test]
    async fn retransmits_identical_request_until_answered() {
        let dir = silent_directory().await;
        let addr = dir.local_addr().unwrap();
        let connector = DirectoryConnector::with_addr(addr, SHORT, DEFAULT_MAX_ATTEMPTS)
            .await
            .unwrap();

        // Answer only the third copy of the request.
        let responder = tokio::spawn(async move {
            let mut buf = [0u8; 128];
            let mut seen = Vec::new();
            loop {
                let (n, from) = dir.recv_from(&mut buf).await.unwrap();
                seen.push(buf[..n].to_vec());
                if seen.len() == 3 {
                    let reply = DirMessage::LoginOk { servers: 2 }.encode().unwrap();
                    dir.send_to(&reply, from).await.unwrap();
                    return seen;
                }
            }
        });

        assert_eq!(connector.login().await.unwrap(), 2);
        let seen = responder.await.unwrap();
        let login = DirMessage::Login.encode().unwrap();
        assert!(seen.iter().all(|req| *req == login));
    }

    #[tokio::test]
    async fn undecodable_reply_is_not_a_negative_answer() {
        let dir = silent_directory().await;
        let addr = dir.local_addr().unwrap();
        let connector = DirectoryConnector::with_addr(addr, SHORT, 2).await.unwrap();
        tokio::spawn(async move {
            let mut buf = [0u8; 128];
            let (_, from) = dir.recv_from(&mut buf).await.unwrap();
            dir.send_to(&[0xEE], from).await.unwrap();
        });
        let err = connector.lookup("bob").await.unwrap_err();
        assert!(matches!(
            err,
            ConnectorError::Decode(DecodeError::UnknownOpcode(0xEE))
        ));
        assert!(!err.is_fatal());
    }

    #[tokio::test]
    async fn invalid_nickname_is_rejected_locally() {
        let silent = silent_directory().await;
        let connector =
            DirectoryConnector::with_addr(silent.local_addr().unwrap(), SHORT, 1)
                .await
                .unwrap();
        let err = connector.register("ip:port").await.unwrap_err();
        assert!(matches!(err, ConnectorError::InvalidNickname(_)));
        assert_eq!(drain(&silent), 0);
    }
}
