pub mod adapter;
pub mod chat;
pub mod connection;
pub mod media;

use std::collections::HashSet;
use std::sync::{Arc, OnceLock};

use dashmap::DashMap;
use tokio::sync::mpsc;
use uuid::Uuid;

use crate::types::events::Frame;
use self::adapter::ClusterAdapter;

pub type SocketId = String;

/// What the per-connection sender task consumes.
#[derive(Debug)]
pub enum Outbound {
    Frame(Frame),
    /// Force-close the socket (single-socket eviction, auth failure).
    Close,
}

struct ConnectionHandle {
    user_id: Option<String>,
    display_name: Option<String>,
    sender: mpsc::UnboundedSender<Outbound>,
}

/// In-memory socket registry for both namespaces: connections, room
/// subscriptions, and fan-out. Cross-node delivery goes through the cluster
/// adapter when one is attached.
pub struct GatewayState {
    node_id: String,
    connections: DashMap<SocketId, ConnectionHandle>,
    /// room -> subscribed socket ids
    rooms: DashMap<String, HashSet<SocketId>>,
    /// socket -> rooms it joined (for cleanup)
    socket_rooms: DashMap<SocketId, HashSet<String>>,
    adapter: OnceLock<Arc<ClusterAdapter>>,
}

impl GatewayState {
    pub fn new() -> Self {
        Self {
            node_id: Uuid::new_v4().to_string(),
            connections: DashMap::new(),
            rooms: DashMap::new(),
            socket_rooms: DashMap::new(),
            adapter: OnceLock::new(),
        }
    }

    pub fn node_id(&self) -> &str {
        &self.node_id
    }

    pub fn set_adapter(&self, adapter: Arc<ClusterAdapter>) {
        let _ = self.adapter.set(adapter);
    }

    pub fn register(&self, socket: &SocketId, sender: mpsc::UnboundedSender<Outbound>) {
        self.connections.insert(
            socket.clone(),
            ConnectionHandle {
                user_id: None,
                display_name: None,
                sender,
            },
        );
    }

    pub fn set_identity(&self, socket: &SocketId, user_id: &str, display_name: Option<&str>) {
        if let Some(mut handle) = self.connections.get_mut(socket) {
            handle.user_id = Some(user_id.to_string());
            handle.display_name = display_name.map(str::to_string);
        }
    }

    pub fn user_of(&self, socket: &SocketId) -> Option<String> {
        self.connections.get(socket).and_then(|h| h.user_id.clone())
    }

    pub fn unregister(&self, socket: &SocketId) {
        self.connections.remove(socket);
        if let Some((_, joined)) = self.socket_rooms.remove(socket) {
            for room in joined {
                if let Some(mut members) = self.rooms.get_mut(&room) {
                    members.remove(socket);
                    if members.is_empty() {
                        drop(members);
                        self.rooms.remove(&room);
                    }
                }
            }
        }
    }

    pub fn join_room(&self, room: &str, socket: &SocketId) {
        self.rooms
            .entry(room.to_string())
            .or_default()
            .insert(socket.clone());
        self.socket_rooms
            .entry(socket.clone())
            .or_default()
            .insert(room.to_string());
    }

    pub fn leave_room(&self, room: &str, socket: &SocketId) {
        if let Some(mut members) = self.rooms.get_mut(room) {
            members.remove(socket);
            if members.is_empty() {
                drop(members);
                self.rooms.remove(room);
            }
        }
        if let Some(mut joined) = self.socket_rooms.get_mut(socket) {
            joined.remove(room);
        }
    }

    pub fn sockets_in_room(&self, room: &str) -> Vec<SocketId> {
        self.rooms
            .get(room)
            .map(|members| members.iter().cloned().collect())
            .unwrap_or_default()
    }

    /// Send to one local socket; false when it is gone.
    pub fn send_to_socket(&self, socket: &SocketId, frame: Frame) -> bool {
        match self.connections.get(socket) {
            Some(handle) => handle.sender.send(Outbound::Frame(frame)).is_ok(),
            None => false,
        }
    }

    /// Deliver to local members and mirror to the cluster.
    pub fn broadcast_to_room(&self, room: &str, frame: Frame, exclude: Option<&SocketId>) {
        self.deliver_local(room, &frame, exclude);
        if let Some(adapter) = self.adapter.get() {
            adapter.publish_room(room, frame, exclude.cloned());
        }
    }

    pub(crate) fn deliver_local(&self, room: &str, frame: &Frame, exclude: Option<&SocketId>) {
        if let Some(members) = self.rooms.get(room) {
            for socket in members.iter() {
                if exclude == Some(socket) {
                    continue;
                }
                if let Some(handle) = self.connections.get(socket) {
                    let _ = handle.sender.send(Outbound::Frame(frame.clone()));
                }
            }
        }
    }

    /// Force-close sockets wherever in the cluster they live.
    pub fn disconnect_sockets(&self, socket_ids: &[SocketId]) {
        self.disconnect_local(socket_ids);
        if let Some(adapter) = self.adapter.get() {
            adapter.publish_disconnect(socket_ids.to_vec());
        }
    }

    pub(crate) fn disconnect_local(&self, socket_ids: &[SocketId]) {
        for socket in socket_ids {
            if let Some(handle) = self.connections.get(socket) {
                let _ = handle.sender.send(Outbound::Close);
            }
        }
    }

    pub fn connection_count(&self) -> usize {
        self.connections.len()
    }

    pub fn room_count(&self) -> usize {
        self.rooms.len()
    }
}

impl Default for GatewayState {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn register(gw: &GatewayState, socket: &str) -> mpsc::UnboundedReceiver<Outbound> {
        let (tx, rx) = mpsc::unbounded_channel();
        gw.register(&socket.to_string(), tx);
        rx
    }

    fn next_frame(rx: &mut mpsc::UnboundedReceiver<Outbound>) -> Option<Frame> {
        match rx.try_recv() {
            Ok(Outbound::Frame(frame)) => Some(frame),
            _ => None,
        }
    }

    #[tokio::test]
    async fn broadcast_excludes_sender() {
        let gw = GatewayState::new();
        let mut a = register(&gw, "a");
        let mut b = register(&gw, "b");
        gw.join_room("r1", &"a".to_string());
        gw.join_room("r1", &"b".to_string());

        gw.broadcast_to_room("r1", Frame::event("typing", json!({})), Some(&"a".to_string()));

        assert!(next_frame(&mut a).is_none());
        assert_eq!(next_frame(&mut b).unwrap().event, "typing");
    }

    #[tokio::test]
    async fn unregister_clears_room_membership() {
        let gw = GatewayState::new();
        let _rx = register(&gw, "a");
        gw.join_room("r1", &"a".to_string());
        assert_eq!(gw.sockets_in_room("r1").len(), 1);

        gw.unregister(&"a".to_string());
        assert!(gw.sockets_in_room("r1").is_empty());
        assert_eq!(gw.room_count(), 0);
    }

    #[tokio::test]
    async fn disconnect_sends_close_signal() {
        let gw = GatewayState::new();
        let mut rx = register(&gw, "stale");
        gw.disconnect_sockets(&["stale".to_string()]);
        assert!(matches!(rx.try_recv(), Ok(Outbound::Close)));
    }
}
