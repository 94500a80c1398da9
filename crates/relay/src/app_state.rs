use std::{
    collections::HashMap,
    sync::atomic::{AtomicU64, Ordering},
};

use tokio::sync::{mpsc, RwLock};

/// Outbound queue of one live socket, tagged with its connection id.
struct Peer {
    connection_id: u64,
    frames: mpsc::UnboundedSender<String>,
}

/// Registered users and their live sockets. The relay keeps no history.
#[derive(Default)]
pub(crate) struct AppState {
    peers: RwLock<HashMap<String, Peer>>,
    next_connection_id: AtomicU64,
}

impl AppState {
    pub(crate) fn next_connection_id(&self) -> u64 {
        self.next_connection_id.fetch_add(1, Ordering::Relaxed)
    }

    /// Binds `user_id` to this connection, replacing any earlier socket.
    pub(crate) async fn register(
        &self,
        user_id: &str,
        connection_id: u64,
        frames: mpsc::UnboundedSender<String>,
    ) {
        self.peers.write().await.insert(
            user_id.to_string(),
            Peer {
                connection_id,
                frames,
            },
        );
    }

    /// Drops the registration only if it still belongs to `connection_id`.
    pub(crate) async fn unregister(&self, user_id: &str, connection_id: u64) {
        let mut peers = self.peers.write().await;
        if peers
            .get(user_id)
            .is_some_and(|peer| peer.connection_id == connection_id)
        {
            peers.remove(user_id);
        }
    }

    /// Queues `frame` for every connected target; returns how many got it.
    pub(crate) async fn fan_out(&self, targets: &[String], frame: &str) -> usize {
        let peers = self.peers.read().await;
        targets
            .iter()
            .filter_map(|target| peers.get(target))
            .filter(|peer| peer.frames.send(frame.to_string()).is_ok())
            .count()
    }

    pub(crate) async fn connected_users(&self) -> usize {
        self.peers.read().await.len()
    }
}
