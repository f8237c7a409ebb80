//! Per-process delivery of broadcast events to local connections.
//!
//! The first connection registered for a document opens that document's
//! update stream on a background task; the last one to leave (or dropping
//! the router) aborts it.
//! Every event is turned into client messages under a single mutex, so a
//! document's connections always observe the same order.

use std::collections::HashMap;
use std::collections::hash_map::Entry;
use std::sync::{Arc, Mutex, Weak};

use tokio::task::AbortHandle;

use super::{ClientMessage, ConnectionSink};
use crate::broadcast::{BroadcastChannel, BroadcastEvent, PubSub, UpdateStream};
use crate::document::{ConnectionId, DocumentId};
use crate::error::{LockResultExt, SyncResult};
use crate::updates::AppliedUpdate;

const LOG_TARGET: &str = "collab_sync::router";

/// What a single event turned into.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DeliveryReport {
    pub acks: usize,
    pub updates: usize,
    pub resyncs: usize,
    /// The event was a redelivery of a version already handled
    pub skipped: bool,
    /// Connections dropped because their sink failed
    pub evicted: Vec<ConnectionId>,
}

struct Member {
    id: ConnectionId,
    sink: Arc<dyn ConnectionSink>,
}

struct Room {
    members: Vec<Member>,
    /// Last version delivered; `None` until the first update or after a reset
    last_version: Option<u64>,
    subscription: Option<AbortHandle>,
}

impl Room {
    fn upsert(&mut self, id: ConnectionId, sink: Arc<dyn ConnectionSink>) {
        match self.members.iter_mut().find(|member| member.id == id) {
            Some(member) => member.sink = sink,
            None => self.members.push(Member { id, sink }),
        }
    }

    fn close(self) {
        if let Some(handle) = self.subscription {
            handle.abort();
        }
    }

    fn deliver_update(&mut self, doc_id: &DocumentId, update: AppliedUpdate, report: &mut DeliveryReport) {
        if update.doc_id != *doc_id {
            log::error!(
                target: LOG_TARGET,
                "Received update for {} on the stream of {}",
                update.doc_id,
                doc_id
            );
            self.last_version = None;
            self.resync_all(doc_id, "update for another document", report);
            return;
        }

        let ack = ClientMessage::VersionAck {
            doc_id: doc_id.clone(),
            version: update.version,
        };

        if update.dup {
            if let Some(source) = &update.source {
                self.send_to(source, ack, report);
            }
            return;
        }

        if let Some(last) = self.last_version {
            if update.version <= last {
                log::trace!(
                    target: LOG_TARGET,
                    "Skipping redelivered version {} of {} (last {})",
                    update.version,
                    doc_id,
                    last
                );
                report.skipped = true;
                return;
            }
            if update.version > last + 1 {
                log::warn!(
                    target: LOG_TARGET,
                    "Gap on {}: expected version {}, got {}",
                    doc_id,
                    last + 1,
                    update.version
                );
                self.last_version = Some(update.version);
                self.resync_all(doc_id, "missed updates", report);
                return;
            }
        }
        self.last_version = Some(update.version);

        let apply = ClientMessage::ApplyUpdate {
            doc_id: doc_id.clone(),
            version: update.version,
            op: update.op,
        };
        let mut failed = Vec::new();
        for member in &self.members {
            let is_source = update.source.as_ref() == Some(&member.id);
            let message = if is_source { ack.clone() } else { apply.clone() };
            match member.sink.deliver(message) {
                Ok(()) if is_source => report.acks += 1,
                Ok(()) => report.updates += 1,
                Err(e) => {
                    log::warn!(
                        target: LOG_TARGET,
                        "Evicting {} from {}: {}",
                        member.id,
                        doc_id,
                        e
                    );
                    failed.push(member.id.clone());
                }
            }
        }
        self.evict(failed, report);
    }

    fn send_to(&mut self, id: &ConnectionId, message: ClientMessage, report: &mut DeliveryReport) {
        let Some(member) = self.members.iter().find(|member| &member.id == id) else {
            return;
        };
        match member.sink.deliver(message) {
            Ok(()) => report.acks += 1,
            Err(e) => {
                log::warn!(target: LOG_TARGET, "Evicting {}: {}", id, e);
                self.evict(vec![id.clone()], report);
            }
        }
    }

    fn resync_all(&mut self, doc_id: &DocumentId, reason: &str, report: &mut DeliveryReport) {
        let mut failed = Vec::new();
        for member in &self.members {
            let message = ClientMessage::ForceResync {
                doc_id: doc_id.clone(),
                reason: reason.to_string(),
            };
            match member.sink.deliver(message) {
                Ok(()) => report.resyncs += 1,
                Err(e) => {
                    log::warn!(target: LOG_TARGET, "Evicting {}: {}", member.id, e);
                    failed.push(member.id.clone());
                }
            }
        }
        self.evict(failed, report);
    }

    fn evict(&mut self, failed: Vec<ConnectionId>, report: &mut DeliveryReport) {
        if failed.is_empty() {
            return;
        }
        self.members.retain(|member| !failed.contains(&member.id));
        report.evicted.extend(failed);
    }
}

#[derive(Default)]
struct RouterState {
    rooms: HashMap<DocumentId, Room>,
    /// Reverse index: which document each connection is on
    connections: HashMap<ConnectionId, DocumentId>,
}

impl RouterState {
    /// Detach `conn` from its document, returning the room if it became empty.
    fn detach(&mut self, conn: &ConnectionId) -> Option<Room> {
        let doc_id = self.connections.remove(conn)?;
        let room = self.rooms.get_mut(&doc_id)?;
        room.members.retain(|member| &member.id != conn);
        if room.members.is_empty() {
            self.rooms.remove(&doc_id)
        } else {
            None
        }
    }
}

struct RouterInner<P> {
    broadcast: BroadcastChannel<P>,
    state: Mutex<RouterState>,
}

impl<P: PubSub> RouterInner<P> {
    fn handle_event(&self, doc_id: &DocumentId, event: BroadcastEvent) -> DeliveryReport {
        let mut report = DeliveryReport::default();
        let mut state = self.state.lock().recover_poison("ConnectionRouter::handle_event");
        let RouterState { rooms, connections } = &mut *state;

        let Some(room) = rooms.get_mut(doc_id) else {
            log::trace!(target: LOG_TARGET, "No local connections on {}", doc_id);
            return report;
        };

        match event {
            BroadcastEvent::Update(update) => room.deliver_update(doc_id, update, &mut report),
            BroadcastEvent::Rejected { message, .. } => {
                log::warn!(
                    target: LOG_TARGET,
                    "Update on {} was rejected: {}",
                    doc_id,
                    message
                );
                room.resync_all(doc_id, "update rejected", &mut report);
            }
            BroadcastEvent::Undecodable(e) => {
                log::error!(target: LOG_TARGET, "{}", e);
                room.last_version = None;
                room.resync_all(doc_id, "undecodable update", &mut report);
            }
            BroadcastEvent::Interrupted => {
                log::warn!(
                    target: LOG_TARGET,
                    "Update stream of {} was interrupted",
                    doc_id
                );
                room.last_version = None;
                room.resync_all(doc_id, "update stream interrupted", &mut report);
            }
        }

        for conn in &report.evicted {
            connections.remove(conn);
        }
        if room.members.is_empty() {
            if let Some(room) = rooms.remove(doc_id) {
                room.close();
            }
        }
        report
    }
}

impl<P> Drop for RouterInner<P> {
    fn drop(&mut self) {
        // Subscription tasks only hold a `Weak`; stop them with the router.
        let state = self.state.get_mut().recover_poison("RouterInner::drop");
        for (_, room) in state.rooms.drain() {
            room.close();
        }
    }
}

/// Delivers applied updates to the connections held by this process.
pub struct ConnectionRouter<P> {
    inner: Arc<RouterInner<P>>,
}

impl<P> Clone for ConnectionRouter<P> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<P: PubSub> ConnectionRouter<P> {
    pub fn new(broadcast: BroadcastChannel<P>) -> Self {
        Self {
            inner: Arc::new(RouterInner {
                broadcast,
                state: Mutex::new(RouterState::default()),
            }),
        }
    }

    /// Attach `conn` to `doc_id`.
    ///
    /// Registering an id that is already attached replaces its sink (or moves
    /// it to the new document), so a connection never receives a message
    /// twice.
    pub async fn register_connection(
        &self,
        doc_id: DocumentId,
        conn: ConnectionId,
        sink: Arc<dyn ConnectionSink>,
    ) -> SyncResult<()> {
        {
            let mut state = self.lock_state("register_connection");
            if state.connections.get(&conn) != Some(&doc_id) {
                if let Some(room) = state.detach(&conn) {
                    room.close();
                }
            }
            if let Some(room) = state.rooms.get_mut(&doc_id) {
                room.upsert(conn.clone(), sink);
                state.connections.insert(conn, doc_id);
                return Ok(());
            }
        }

        // Subscribe before taking the lock again; nothing published after
        // this point is missed.
        let stream = self.inner.broadcast.subscribe(&doc_id).await?;

        let mut state = self.lock_state("register_connection");
        match state.rooms.entry(doc_id.clone()) {
            Entry::Occupied(mut entry) => {
                // Someone else opened the room meanwhile; our stream is dropped.
                entry.get_mut().upsert(conn.clone(), sink);
            }
            Entry::Vacant(entry) => {
                log::debug!(target: LOG_TARGET, "Subscribing to updates of {}", doc_id);
                let subscription =
                    spawn_subscription(Arc::downgrade(&self.inner), doc_id.clone(), stream);
                let mut room = Room {
                    members: Vec::new(),
                    last_version: None,
                    subscription: Some(subscription),
                };
                room.upsert(conn.clone(), sink);
                entry.insert(room);
            }
        }
        state.connections.insert(conn, doc_id);
        Ok(())
    }

    /// Detach `conn`. Returns `false` if it was not registered.
    pub fn unregister_connection(&self, conn: &ConnectionId) -> bool {
        let mut state = self.lock_state("unregister_connection");
        let registered = state.connections.contains_key(conn);
        if let Some(room) = state.detach(conn) {
            log::debug!(target: LOG_TARGET, "Last connection left, unsubscribing");
            room.close();
        }
        registered
    }

    /// Turn one broadcast event into client messages for `doc_id`.
    pub fn handle_event(&self, doc_id: &DocumentId, event: BroadcastEvent) -> DeliveryReport {
        self.inner.handle_event(doc_id, event)
    }

    /// Abort every subscription and forget all connections.
    pub fn shutdown(&self) {
        let mut state = self.lock_state("shutdown");
        for (_, room) in state.rooms.drain() {
            room.close();
        }
        state.connections.clear();
        log::debug!(target: LOG_TARGET, "Router shut down");
    }

    pub fn connection_count(&self, doc_id: &DocumentId) -> usize {
        self.lock_state("connection_count")
            .rooms
            .get(doc_id)
            .map_or(0, |room| room.members.len())
    }

    pub fn is_subscribed(&self, doc_id: &DocumentId) -> bool {
        self.lock_state("is_subscribed").rooms.contains_key(doc_id)
    }

    /// Last version delivered to the connections of `doc_id`.
    pub fn last_version(&self, doc_id: &DocumentId) -> Option<u64> {
        self.lock_state("last_version")
            .rooms
            .get(doc_id)
            .and_then(|room| room.last_version)
    }

    fn lock_state(&self, context: &str) -> std::sync::MutexGuard<'_, RouterState> {
        self.inner.state.lock().recover_poison(context)
    }
}

fn spawn_subscription<P: PubSub>(
    router: Weak<RouterInner<P>>,
    doc_id: DocumentId,
    mut stream: UpdateStream<P>,
) -> AbortHandle {
    let task = tokio::spawn(async move {
        loop {
            let event = stream.next().await;
            let Some(router) = router.upgrade() else {
                break;
            };
            router.handle_event(&doc_id, event);
        }
    });
    task.abort_handle()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::broadcast::{BroadcastDecodeError, MemoryPubSub};
    use crate::document::EditOperation;
    use tokio::sync::mpsc;

    fn router() -> (ConnectionRouter<MemoryPubSub>, Arc<MemoryPubSub>) {
        let bus = Arc::new(MemoryPubSub::new());
        (
            ConnectionRouter::new(BroadcastChannel::new(bus.clone())),
            bus,
        )
    }

    async fn connect(
        router: &ConnectionRouter<MemoryPubSub>,
        doc: &str,
        conn: &str,
    ) -> mpsc::Receiver<ClientMessage> {
        let (tx, rx) = mpsc::channel(16);
        router
            .register_connection(DocumentId::new(doc), ConnectionId::new(conn), Arc::new(tx))
            .await
            .unwrap();
        rx
    }

    fn update(version: u64, source: Option<&str>, dup: bool) -> AppliedUpdate {
        AppliedUpdate {
            doc_id: DocumentId::new("d1"),
            version,
            op: EditOperation::insert(0, "x", version.saturating_sub(1)),
            source: source.map(ConnectionId::new),
            dup,
        }
    }

    fn doc() -> DocumentId {
        DocumentId::new("d1")
    }

    #[tokio::test]
    async fn source_gets_ack_others_get_full_update() {
        let (router, _bus) = router();
        let mut source = connect(&router, "d1", "c1").await;
        let mut other = connect(&router, "d1", "c2").await;

        let report = router.handle_event(&doc(), BroadcastEvent::Update(update(1, Some("c1"), false)));

        assert_eq!((report.acks, report.updates), (1, 1));
        assert_eq!(
            source.try_recv().unwrap(),
            ClientMessage::VersionAck {
                doc_id: doc(),
                version: 1
            }
        );
        assert!(matches!(
            other.try_recv().unwrap(),
            ClientMessage::ApplyUpdate { version: 1, .. }
        ));
    }

    #[tokio::test]
    async fn duplicate_is_only_acked_to_its_source() {
        let (router, _bus) = router();
        let mut source = connect(&router, "d1", "c1").await;
        let mut other = connect(&router, "d1", "c2").await;

        let report = router.handle_event(&doc(), BroadcastEvent::Update(update(3, Some("c1"), true)));

        assert_eq!((report.acks, report.updates), (1, 0));
        assert!(matches!(
            source.try_recv().unwrap(),
            ClientMessage::VersionAck { version: 3, .. }
        ));
        assert!(other.try_recv().is_err());
    }

    #[tokio::test]
    async fn redelivered_versions_are_skipped() {
        let (router, _bus) = router();
        let mut rx = connect(&router, "d1", "c1").await;

        router.handle_event(&doc(), BroadcastEvent::Update(update(1, None, false)));
        router.handle_event(&doc(), BroadcastEvent::Update(update(2, None, false)));
        let report = router.handle_event(&doc(), BroadcastEvent::Update(update(2, None, false)));

        assert!(report.skipped);
        assert!(rx.try_recv().is_ok());
        assert!(rx.try_recv().is_ok());
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn version_gap_forces_resync() {
        let (router, _bus) = router();
        let mut rx = connect(&router, "d1", "c1").await;

        router.handle_event(&doc(), BroadcastEvent::Update(update(1, None, false)));
        let report = router.handle_event(&doc(), BroadcastEvent::Update(update(4, None, false)));

        assert_eq!(report.resyncs, 1);
        assert!(matches!(rx.try_recv().unwrap(), ClientMessage::ApplyUpdate { .. }));
        assert!(matches!(rx.try_recv().unwrap(), ClientMessage::ForceResync { .. }));
        assert_eq!(router.last_version(&doc()), Some(4));
    }

    #[tokio::test]
    async fn undecodable_event_forces_resync_and_resets_tracking() {
        let (router, _bus) = router();
        let mut rx = connect(&router, "d1", "c1").await;
        router.handle_event(&doc(), BroadcastEvent::Update(update(1, None, false)));
        let _ = rx.try_recv();

        let report = router.handle_event(
            &doc(),
            BroadcastEvent::Undecodable(BroadcastDecodeError {
                topic: "applied-ops:d1".into(),
                reason: "expected value".into(),
            }),
        );

        assert_eq!(report.resyncs, 1);
        assert!(matches!(rx.try_recv().unwrap(), ClientMessage::ForceResync { .. }));
        assert_eq!(router.last_version(&doc()), None);
    }

    #[tokio::test]
    async fn update_for_another_document_forces_resync() {
        let (router, _bus) = router();
        let mut rx = connect(&router, "d1", "c1").await;
        let mut foreign = update(1, None, false);
        foreign.doc_id = DocumentId::new("d2");

        let report = router.handle_event(&doc(), BroadcastEvent::Update(foreign));

        assert_eq!((report.resyncs, report.updates), (1, 0));
        assert!(matches!(rx.try_recv().unwrap(), ClientMessage::ForceResync { .. }));
    }

    #[tokio::test]
    async fn closed_sinks_are_evicted() {
        let (router, _bus) = router();
        let rx = connect(&router, "d1", "c1").await;
        let mut alive = connect(&router, "d1", "c2").await;
        drop(rx);

        let report = router.handle_event(&doc(), BroadcastEvent::Update(update(1, None, false)));

        assert_eq!(report.evicted, vec![ConnectionId::new("c1")]);
        assert_eq!(router.connection_count(&doc()), 1);
        assert!(alive.try_recv().is_ok());
        assert!(!router.unregister_connection(&ConnectionId::new("c1")));
    }

    #[tokio::test]
    async fn reregistering_replaces_the_sink() {
        let (router, _bus) = router();
        let mut old = connect(&router, "d1", "c1").await;
        let mut new = connect(&router, "d1", "c1").await;

        router.handle_event(&doc(), BroadcastEvent::Update(update(1, None, false)));

        assert_eq!(router.connection_count(&doc()), 1);
        assert!(new.try_recv().is_ok());
        assert!(old.try_recv().is_err());
    }

    #[tokio::test]
    async fn subscription_follows_connection_lifetime() {
        let (router, bus) = router();
        let _a = connect(&router, "d1", "c1").await;
        let _b = connect(&router, "d1", "c2").await;
        assert!(router.is_subscribed(&doc()));
        assert_eq!(bus.subscriber_count("applied-ops:d1"), 1);

        assert!(router.unregister_connection(&ConnectionId::new("c1")));
        assert!(router.is_subscribed(&doc()));

        assert!(router.unregister_connection(&ConnectionId::new("c2")));
        assert!(!router.is_subscribed(&doc()));
    }

    #[tokio::test]
    async fn dropping_the_router_ends_its_subscriptions() {
        let (router, bus) = router();
        let _a = connect(&router, "d1", "c1").await;
        let _b = connect(&router, "d2", "c2").await;
        assert_eq!(bus.subscriber_count("applied-ops:d1"), 1);

        drop(router);

        let deadline = tokio::time::Instant::now() + std::time::Duration::from_secs(1);
        while bus.subscriber_count("applied-ops:d1") + bus.subscriber_count("applied-ops:d2") > 0 {
            assert!(tokio::time::Instant::now() < deadline, "subscriptions outlived the router");
            tokio::task::yield_now().await;
        }
    }

    #[tokio::test]
    async fn published_updates_reach_connections() {
        let (router, bus) = router();
        let channel = BroadcastChannel::new(bus);
        let mut rx = connect(&router, "d1", "c2").await;

        channel.publish(&update(1, Some("c1"), false)).await.unwrap();

        let message = tokio::time::timeout(std::time::Duration::from_secs(1), rx.recv())
            .await
            .unwrap()
            .unwrap();
        assert!(matches!(message, ClientMessage::ApplyUpdate { version: 1, .. }));
        router.shutdown();
        assert!(!router.is_subscribed(&doc()));
    }
}
