//! Peer listener: accepts one connection at a time and serves it to completion.
//!
//! Accept is polled with a short timeout so a stop request is noticed between
//! connections. A session in progress is never interrupted by a stop.

use std::io;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use log::{info, warn};
use nanofiles_core::FileCatalog;
use tokio::net::TcpListener;
use tokio::sync::watch;

use crate::session::serve_session;

pub struct PeerListener<C> {
    listener: TcpListener,
    catalog: Arc<C>,
    frame_size: usize,
    poll: Duration,
}

impl<C: FileCatalog> PeerListener<C> {
    /// Bind on all interfaces. Port 0 picks an ephemeral port; see [`Self::local_addr`].
    pub async fn bind(
        port: u16,
        catalog: Arc<C>,
        frame_size: usize,
        poll: Duration,
    ) -> io::Result<Self> {
        let listener = TcpListener::bind(("0.0.0.0", port)).await?;
        Ok(Self::from_listener(listener, catalog, frame_size, poll))
    }

    pub fn from_listener(
        listener: TcpListener,
        catalog: Arc<C>,
        frame_size: usize,
        poll: Duration,
    ) -> Self {
        Self {
            listener,
            catalog,
            frame_size,
            poll,
        }
    }

    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        self.listener.local_addr()
    }

    /// Serve peers until `stop` reads true. Returns how many sessions were served.
    pub async fn run(self, stop: watch::Receiver<bool>) -> io::Result<usize> {
        info!("serving files on {}", self.listener.local_addr()?);
        let mut served = 0;
        while !*stop.borrow() {
            let accepted = match tokio::time::timeout(self.poll, self.listener.accept()).await {
                Err(_) => continue,
                Ok(r) => r,
            };
            let (mut stream, peer) = match accepted {
                Ok(a) => a,
                Err(e) => {
                    warn!("accept failed: {}", e);
                    continue;
                }
            };
            info!("peer {} connected", peer);
            match serve_session(&mut stream, &*self.catalog, self.frame_size).await {
                Ok(files) => info!("peer {} done ({} files sent)", peer, files),
                Err(e) => warn!("session with {} ended: {}", peer, e),
            }
            served += 1;
        }
        info!("stopped serving files");
        Ok(served)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::session::PeerConnector;
    use nanofiles_core::{integrity, Catalog, FileInfo, SharedFile};

    const POLL: Duration = Duration::from_millis(50);

    async fn listener_for(catalog: Catalog) -> PeerListener<Catalog> {
        let tcp = TcpListener::bind("127.0.0.1:0").await.unwrap();
        PeerListener::from_listener(tcp, Arc::new(catalog), 64, POLL)
    }

    #[tokio::test]
    async fn stop_without_connections() {
        let listener = listener_for(Catalog::default()).await;
        let (tx, rx) = watch::channel(false);
        let handle = tokio::spawn(listener.run(rx));
        tokio::time::sleep(POLL * 2).await;
        tx.send(true).unwrap();
        let served = tokio::time::timeout(POLL * 4, handle).await.unwrap().unwrap().unwrap();
        assert_eq!(served, 0);
    }

    #[tokio::test]
    async fn serves_sequential_peers_then_stops() {
        let shared = tempfile::tempdir().unwrap();
        let dest = tempfile::tempdir().unwrap();
        let path = shared.path().join("note.txt");
        std::fs::write(&path, b"sequential sessions").unwrap();
        let hash = integrity::digest_hex(b"sequential sessions");
        let catalog = Catalog::new(vec![SharedFile {
            info: FileInfo::new("note.txt", hash.clone(), 19),
            path,
        }]);

        let listener = listener_for(catalog).await;
        let addr = listener.local_addr().unwrap();
        let (tx, rx) = watch::channel(false);
        let handle = tokio::spawn(listener.run(rx));

        for i in 0..2 {
            let mut peer = PeerConnector::connect(addr).await.unwrap();
            let out = dest.path().join(format!("copy{}.txt", i));
            assert_eq!(peer.download(&hash, &out).await.unwrap(), 19);
            peer.close().await.unwrap();
        }

        tx.send(true).unwrap();
        let served = handle.await.unwrap().unwrap();
        assert_eq!(served, 2);
    }
}
