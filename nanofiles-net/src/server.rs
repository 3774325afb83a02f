//! Directory service loop: one UDP socket, one owner of the directory state.
//!
//! Requests are handled strictly one at a time. Each inbound datagram may be
//! dropped with the configured probability to exercise client retransmission.

use std::io;
use std::net::SocketAddr;

use log::{debug, info, warn};
use nanofiles_core::{DirMessage, DirectoryState, PACKET_MAX_SIZE};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use tokio::net::UdpSocket;
use tokio::sync::watch;

pub struct DirectoryServer {
    socket: UdpSocket,
    state: DirectoryState,
    discard_probability: f64,
    rng: StdRng,
}

impl DirectoryServer {
    pub async fn bind(addr: SocketAddr, discard_probability: f64) -> io::Result<Self> {
        let socket = UdpSocket::bind(addr).await?;
        Ok(Self {
            socket,
            state: DirectoryState::new(),
            discard_probability: discard_probability.clamp(0.0, 1.0),
            rng: StdRng::from_entropy(),
        })
    }

    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        self.socket.local_addr()
    }

    #[cfg(test)]
    pub fn state(&self) -> &DirectoryState {
        &self.state
    }

    /// Serve until `shutdown` flips to true (or its sender is dropped).
    pub async fn run(mut self, mut shutdown: watch::Receiver<bool>) -> io::Result<()> {
        info!(
            "directory listening on {} (discard probability {})",
            self.socket.local_addr()?,
            self.discard_probability
        );
        let mut buf = vec![0u8; PACKET_MAX_SIZE];
        loop {
            if *shutdown.borrow() {
                break;
            }
            let received = tokio::select! {
                r = self.socket.recv_from(&mut buf) => r,
                changed = shutdown.changed() => {
                    if changed.is_err() {
                        break;
                    }
                    continue;
                }
            };
            match received {
                Ok((n, from)) => self.handle_datagram(&buf[..n], from).await,
                Err(e) if is_transient(&e) => debug!("recv error ignored: {}", e),
                Err(e) => return Err(e),
            }
        }
        info!(
            "directory stopped ({} users, {} serving)",
            self.state.users().len(),
            self.state.serving_count()
        );
        Ok(())
    }

    /// Receive and handle exactly one datagram.
    #[cfg(test)]
    pub async fn serve_one(&mut self) -> io::Result<()> {
        let mut buf = vec![0u8; PACKET_MAX_SIZE];
        let (n, from) = self.socket.recv_from(&mut buf).await?;
        self.handle_datagram(&buf[..n], from).await;
        Ok(())
    }

    async fn handle_datagram(&mut self, datagram: &[u8], from: SocketAddr) {
        if self.should_discard() {
            warn!("discarding {} bytes from {}", datagram.len(), from);
            return;
        }
        let request = match DirMessage::decode(datagram) {
            Ok(m) => m,
            Err(e) => {
                warn!("malformed datagram from {}: {}", from, e);
                return;
            }
        };
        let op = request.opcode();
        let Some(response) = self.state.handle(request, from) else {
            debug!("no response for {} from {}", op, from);
            return;
        };
        info!("{} from {} -> {}", op, from, response.opcode());
        let bytes = match response.encode() {
            Ok(b) => b,
            Err(e) => {
                warn!("cannot answer {} from {}: {}", op, from, e);
                return;
            }
        };
        if let Err(e) = self.socket.send_to(&bytes, from).await {
            warn!("send to {} failed: {}", from, e);
        }
    }

    fn should_discard(&mut self) -> bool {
        self.discard_probability > 0.0 && self.rng.gen::<f64>() < self.discard_probability
    }
}

/// ICMP feedback from an earlier send can surface on the next receive.
fn is_transient(e: &io::Error) -> bool {
    matches!(
        e.kind(),
        io::ErrorKind::ConnectionReset | io::ErrorKind::ConnectionRefused
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::connector::{ConnectorError, DirectoryConnector};
    use nanofiles_core::{FileInfo, UserEntry};
    use std::time::Duration;

    const TIMEOUT: Duration = Duration::from_millis(200);

    async fn start(discard: f64) -> (SocketAddr, watch::Sender<bool>, tokio::task::JoinHandle<io::Result<()>>) {
        let server = DirectoryServer::bind("127.0.0.1:0".parse().unwrap(), discard)
            .await
            .unwrap();
        let addr = server.local_addr().unwrap();
        let (tx, rx) = watch::channel(false);
        let handle = tokio::spawn(server.run(rx));
        (addr, tx, handle)
    }

    async fn client(addr: SocketAddr, attempts: u32) -> DirectoryConnector {
        DirectoryConnector::with_addr(addr, TIMEOUT, attempts)
            .await
            .unwrap()
    }

    #[tokio::test]
    async fn full_directory_session() {
        let (addr, stop, handle) = start(0.0).await;
        let alice = client(addr, 5).await;
        let bob = client(addr, 5).await;

        assert_eq!(alice.login().await.unwrap(), 0);
        assert!(alice.register("alice").await.unwrap());
        assert!(!bob.register("alice").await.unwrap());
        assert!(bob.register("bob").await.unwrap());

        let files = vec![
            FileInfo::new("a.txt", "aaa1", 1),
            FileInfo::new("b.txt", "bbb2", 2),
        ];
        alice.serve_files("alice", 10_000, files.clone()).await.unwrap();
        assert_eq!(bob.login().await.unwrap(), 1);
        assert_eq!(bob.files().await.unwrap(), files);
        assert_eq!(
            bob.lookup("alice").await.unwrap(),
            Some("127.0.0.1:10000".parse().unwrap())
        );
        assert_eq!(bob.lookup("carol").await.unwrap(), None);
        assert_eq!(
            bob.users().await.unwrap(),
            vec![
                UserEntry {
                    nick: "alice".into(),
                    serving: true
                },
                UserEntry {
                    nick: "bob".into(),
                    serving: false
                },
            ]
        );

        assert!(alice.stop_serving("alice").await.unwrap());
        assert!(bob.files().await.unwrap().is_empty());
        assert_eq!(bob.lookup("alice").await.unwrap(), None);
        assert!(alice.logoff("alice").await.unwrap());
        assert!(bob.register("alice").await.unwrap());

        stop.send(true).unwrap();
        handle.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn dropping_every_datagram_is_fatal_for_the_client() {
        let (addr, stop, handle) = start(1.0).await;
        let c = DirectoryConnector::with_addr(addr, Duration::from_millis(50), 3)
            .await
            .unwrap();
        let err = c.login().await.unwrap_err();
        assert!(err.is_fatal());
        assert!(matches!(err, ConnectorError::Unreachable { attempts: 3, .. }));
        stop.send(true).unwrap();
        handle.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn discarded_datagram_changes_nothing() {
        let mut server = DirectoryServer::bind("127.0.0.1:0".parse().unwrap(), 1.0)
            .await
            .unwrap();
        let addr = server.local_addr().unwrap();
        let sock = UdpSocket::bind("127.0.0.1:0").await.unwrap();

        let register = DirMessage::Register {
            nick: "alice".into(),
        }
        .encode()
        .unwrap();
        sock.send_to(&register, addr).await.unwrap();
        server.serve_one().await.unwrap();
        let serve = DirMessage::ServeFiles {
            nick: "alice".into(),
            port: 4242,
            files: vec![FileInfo::new("a.txt", "aaa1", 1)],
        }
        .encode()
        .unwrap();
        sock.send_to(&serve, addr).await.unwrap();
        server.serve_one().await.unwrap();

        let mut buf = [0u8; 64];
        let quiet = tokio::time::timeout(Duration::from_millis(100), sock.recv_from(&mut buf)).await;
        assert!(quiet.is_err());
        assert!(server.state().users().is_empty());
        assert!(server.state().files().is_empty());
        assert_eq!(server.state().serving_count(), 0);
    }

    #[tokio::test]
    async fn malformed_and_response_datagrams_get_no_answer() {
        let mut server = DirectoryServer::bind("127.0.0.1:0".parse().unwrap(), 0.0)
            .await
            .unwrap();
        let addr = server.local_addr().unwrap();
        let sock = UdpSocket::bind("127.0.0.1:0").await.unwrap();

        sock.send_to(&[0xEE, 1, 2], addr).await.unwrap();
        server.serve_one().await.unwrap();
        let ok = DirMessage::RegisterOk.encode().unwrap();
        sock.send_to(&ok, addr).await.unwrap();
        server.serve_one().await.unwrap();

        let mut buf = [0u8; 64];
        let quiet = tokio::time::timeout(Duration::from_millis(100), sock.recv_from(&mut buf)).await;
        assert!(quiet.is_err());
        assert!(server.state().users().is_empty());
    }

    #[tokio::test]
    async fn serving_address_uses_datagram_source() {
        let mut server = DirectoryServer::bind("127.0.0.1:0".parse().unwrap(), 0.0)
            .await
            .unwrap();
        let addr = server.local_addr().unwrap();
        let sock = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let req = DirMessage::ServeFiles {
            nick: "alice".into(),
            port: 4242,
            files: vec![],
        }
        .encode()
        .unwrap();
        sock.send_to(&req, addr).await.unwrap();
        server.serve_one().await.unwrap();

        let mut buf = [0u8; 64];
        let (n, _) = sock.recv_from(&mut buf).await.unwrap();
        assert_eq!(DirMessage::decode(&buf[..n]).unwrap(), DirMessage::ServeFilesOk);
        assert_eq!(
            server.state().lookup("alice"),
            Some("127.0.0.1:4242".parse().unwrap())
        );
    }
}
