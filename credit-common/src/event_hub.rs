//! # EventHub
//!
//! Single-process publish/subscribe fan-out to connected observers,
//! addressing three scopes: global, per-country, and per-user (spec §4.6).
//!
//! Grounded in the dispatch-loop shape of `HealthRegistry`
//! (`crate::health`): a small set of `mpsc` senders feed a single spawned
//! task that owns the shared state, so publishers never need an external
//! lock. Here the shared state is the client index rather than a health
//! map, and there are three input channels instead of one.

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, RwLock};

use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::sync::mpsc;
use tracing::warn;
use uuid::Uuid;

/// Bounded capacity of a session's outbound queue (spec §4.6).
const SESSION_QUEUE_CAPACITY: usize = 256;

/// The wire shape of an event delivered to an observer (spec §6).
#[derive(Debug, Clone, Serialize)]
pub struct Event {
    pub r#type: String,
    pub data: serde_json::Value,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub country_id: Option<Uuid>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub target_user: Option<Uuid>,
    pub timestamp: DateTime<Utc>,
}

/// A connected observer session: a bounded outbound queue plus its
/// addressing attributes.
pub struct Session {
    pub id: Uuid,
    pub user_id: Option<Uuid>,
    pub country_ids: Vec<Uuid>,
    sender: mpsc::Sender<Event>,
}

impl Session {
    /// Create a new session and the receiver its owner should read events
    /// from (e.g. to forward onto a websocket).
    pub fn new(user_id: Option<Uuid>, country_ids: Vec<Uuid>) -> (Self, mpsc::Receiver<Event>) {
        let (sender, receiver) = mpsc::channel(SESSION_QUEUE_CAPACITY);
        (
            Self {
                id: Uuid::new_v4(),
                user_id,
                country_ids,
                sender,
            },
            receiver,
        )
    }
}

enum Command {
    Register(Session),
    Unregister(Uuid),
    Broadcast(Event),
    BroadcastToCountry(Uuid, Event),
    SendToUser(Uuid, Event),
}

#[derive(Default)]
struct ClientIndex {
    clients: HashMap<Uuid, Session>,
    clients_by_country: HashMap<Uuid, HashSet<Uuid>>,
}

impl ClientIndex {
    fn register(&mut self, session: Session) {
        let id = session.id;
        for country_id in &session.country_ids {
            self.clients_by_country
                .entry(*country_id)
                .or_default()
                .insert(id);
        }
        self.clients.insert(id, session);
    }

    fn unregister(&mut self, id: Uuid) {
        if let Some(session) = self.clients.remove(&id) {
            for country_id in &session.country_ids {
                if let Some(set) = self.clients_by_country.get_mut(country_id) {
                    set.remove(&id);
                }
            }
        }
    }

    /// Deliver to a session, forcibly evicting it on a full queue
    /// (spec §4.6, §7 SLOW_CONSUMER).
    fn deliver(&mut self, id: Uuid, event: &Event) {
        let evict = match self.clients.get(&id) {
            Some(session) => match session.sender.try_send(event.clone()) {
                Ok(()) => false,
                Err(mpsc::error::TrySendError::Full(_)) => {
                    warn!(session_id = %id, "evicting slow-consuming observer session");
                    true
                }
                Err(mpsc::error::TrySendError::Closed(_)) => true,
            },
            None => false,
        };
        if evict {
            self.unregister(id);
        }
    }

    fn broadcast(&mut self, event: &Event) {
        let ids: Vec<Uuid> = self.clients.keys().copied().collect();
        for id in ids {
            self.deliver(id, event);
        }
    }

    fn broadcast_to_country(&mut self, country_id: Uuid, event: &Event) {
        let ids: Vec<Uuid> = self
            .clients_by_country
            .get(&country_id)
            .map(|set| set.iter().copied().collect())
            .unwrap_or_default();
        for id in ids {
            self.deliver(id, event);
        }
    }

    fn send_to_user(&mut self, user_id: Uuid, event: &Event) {
        let ids: Vec<Uuid> = self
            .clients
            .iter()
            .filter(|(_, session)| session.user_id == Some(user_id))
            .map(|(id, _)| *id)
            .collect();
        for id in ids {
            self.deliver(id, event);
        }
    }
}

/// Handle used by publishers to reach the hub's single dispatch loop.
#[derive(Clone)]
pub struct EventHub {
    sender: mpsc::Sender<Command>,
    connected: Arc<RwLock<usize>>,
}

impl EventHub {
    pub fn new() -> Self {
        let (sender, mut receiver) = mpsc::channel::<Command>(1024);
        let connected = Arc::new(RwLock::new(0usize));
        let connected_counter = connected.clone();

        tokio::spawn(async move {
            let mut index = ClientIndex::default();
            while let Some(command) = receiver.recv().await {
                match command {
                    Command::Register(session) => {
                        index.register(session);
                        if let Ok(mut count) = connected_counter.write() {
                            *count = index.clients.len();
                        }
                    }
                    Command::Unregister(id) => {
                        index.unregister(id);
                        if let Ok(mut count) = connected_counter.write() {
                            *count = index.clients.len();
                        }
                    }
                    Command::Broadcast(event) => index.broadcast(&event),
                    Command::BroadcastToCountry(country_id, event) => {
                        index.broadcast_to_country(country_id, &event)
                    }
                    Command::SendToUser(user_id, event) => index.send_to_user(user_id, &event),
                }
            }
        });

        Self { sender, connected }
    }

    pub fn connected_count(&self) -> usize {
        self.connected.read().map(|c| *c).unwrap_or(0)
    }

    pub async fn register(&self, session: Session) {
        if self.sender.send(Command::Register(session)).await.is_err() {
            warn!("event hub dispatch loop is gone; dropping registration");
        }
    }

    pub async fn unregister(&self, session_id: Uuid) {
        if self
            .sender
            .send(Command::Unregister(session_id))
            .await
            .is_err()
        {
            warn!("event hub dispatch loop is gone; dropping unregistration");
        }
    }

    fn event(event_type: &str, data: serde_json::Value) -> Event {
        Event {
            r#type: event_type.to_owned(),
            data,
            country_id: None,
            target_user: None,
            timestamp: Utc::now(),
        }
    }

    pub async fn broadcast(&self, event_type: &str, data: serde_json::Value) {
        let event = Self::event(event_type, data);
        if self
            .sender
            .send(Command::Broadcast(event))
            .await
            .is_err()
        {
            warn!("event hub dispatch loop is gone; dropping broadcast");
        }
    }

    pub async fn broadcast_to_country(&self, country_id: Uuid, event_type: &str, data: serde_json::Value) {
        let mut event = Self::event(event_type, data);
        event.country_id = Some(country_id);
        if self
            .sender
            .send(Command::BroadcastToCountry(country_id, event))
            .await
            .is_err()
        {
            warn!("event hub dispatch loop is gone; dropping country broadcast");
        }
    }

    pub async fn send_to_user(&self, user_id: Uuid, event_type: &str, data: serde_json::Value) {
        let mut event = Self::event(event_type, data);
        event.target_user = Some(user_id);
        if self
            .sender
            .send(Command::SendToUser(user_id, event))
            .await
            .is_err()
        {
            warn!("event hub dispatch loop is gone; dropping user-targeted send");
        }
    }
}

impl Default for EventHub {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[tokio::test]
    async fn broadcast_delivers_to_all_sessions() {
        let hub = EventHub::new();
        let (session_a, mut rx_a) = Session::new(None, vec![]);
        let (session_b, mut rx_b) = Session::new(None, vec![]);
        hub.register(session_a).await;
        hub.register(session_b).await;

        hub.broadcast("ping", json!({"n": 1})).await;

        let event_a = rx_a.recv().await.expect("session a should receive event");
        let event_b = rx_b.recv().await.expect("session b should receive event");
        assert_eq!(event_a.r#type, "ping");
        assert_eq!(event_b.r#type, "ping");
    }

    #[tokio::test]
    async fn country_scoped_event_only_reaches_matching_sessions() {
        let hub = EventHub::new();
        let country_a = Uuid::new_v4();
        let country_b = Uuid::new_v4();

        let (session_in_a, mut rx_in_a) = Session::new(None, vec![country_a]);
        let (session_in_b, mut rx_in_b) = Session::new(None, vec![country_b]);
        hub.register(session_in_a).await;
        hub.register(session_in_b).await;

        hub.broadcast_to_country(country_a, "application_updated", json!({}))
            .await;

        let event = rx_in_a.recv().await.expect("session in country a should receive");
        assert_eq!(event.country_id, Some(country_a));

        let nothing = tokio::time::timeout(std::time::Duration::from_millis(50), rx_in_b.recv()).await;
        assert!(nothing.is_err(), "session in country b must not receive the event");
    }

    #[tokio::test]
    async fn send_to_user_targets_only_that_users_sessions() {
        let hub = EventHub::new();
        let user = Uuid::new_v4();

        let (session_user, mut rx_user) = Session::new(Some(user), vec![]);
        let (session_other, mut rx_other) = Session::new(Some(Uuid::new_v4()), vec![]);
        hub.register(session_user).await;
        hub.register(session_other).await;

        hub.send_to_user(user, "status_changed", json!({})).await;

        let event = rx_user.recv().await.expect("targeted user should receive");
        assert_eq!(event.target_user, Some(user));

        let nothing = tokio::time::timeout(std::time::Duration::from_millis(50), rx_other.recv()).await;
        assert!(nothing.is_err(), "other user must not receive the event");
    }

    #[tokio::test]
    async fn unregister_removes_session_from_country_index() {
        let hub = EventHub::new();
        let country = Uuid::new_v4();
        let (session, mut rx) = Session::new(None, vec![country]);
        let id = session.id;
        hub.register(session).await;
        hub.unregister(id).await;

        hub.broadcast_to_country(country, "noop", json!({})).await;

        let nothing = tokio::time::timeout(std::time::Duration::from_millis(50), rx.recv()).await;
        assert!(nothing.is_err(), "unregistered session must not receive events");
    }
}
