//! Applied updates flowing from a flush to client connections on two routers.

use std::sync::Arc;
use std::time::Duration;

use collab_sync::broadcast::{BroadcastChannel, MemoryPubSub};
use collab_sync::document::{ConnectionId, DocumentId, EditOperation, MemoryDocumentStore};
use collab_sync::lock::{LockManager, LockOptions};
use collab_sync::router::{ClientMessage, ConnectionRouter};
use collab_sync::store::MemoryStore;
use collab_sync::updates::{FlushMode, FlushWorker, QueueOptions, UpdateQueue};
use tokio::sync::mpsc;

async fn recv(rx: &mut mpsc::Receiver<ClientMessage>) -> ClientMessage {
    tokio::time::timeout(Duration::from_secs(2), rx.recv())
        .await
        .expect("timed out waiting for a client message")
        .expect("connection closed")
}

#[tokio::test]
async fn submitter_gets_an_ack_and_everyone_else_the_op() {
    let store = Arc::new(MemoryStore::new());
    let documents = Arc::new(MemoryDocumentStore::new());
    let broadcast = BroadcastChannel::new(Arc::new(MemoryPubSub::new()));
    let worker = FlushWorker::new(
        store.clone(),
        documents.clone(),
        Arc::new(LockManager::new(store.clone(), LockOptions::default())),
        broadcast.clone(),
        QueueOptions::default(),
    );
    let queue = UpdateQueue::new(store, QueueOptions::default());
    let doc = DocumentId::new("doc");
    documents.create(&doc, "");

    // Two processes, each with its own router on the same bus.
    let router_a = ConnectionRouter::new(broadcast.clone());
    let router_b = ConnectionRouter::new(broadcast.clone());
    let (tx_alice, mut rx_alice) = mpsc::channel(16);
    let (tx_bob, mut rx_bob) = mpsc::channel(16);
    let (tx_carol, mut rx_carol) = mpsc::channel(16);
    router_a
        .register_connection(doc.clone(), ConnectionId::new("alice"), Arc::new(tx_alice))
        .await
        .unwrap();
    router_a
        .register_connection(doc.clone(), ConnectionId::new("bob"), Arc::new(tx_bob))
        .await
        .unwrap();
    router_b
        .register_connection(doc.clone(), ConnectionId::new("carol"), Arc::new(tx_carol))
        .await
        .unwrap();

    let op = EditOperation::insert(0, "hi", 0).with_source(ConnectionId::new("alice"));
    queue.enqueue(&doc, &op).await.unwrap();
    worker.flush(&doc, FlushMode::Blocking).await.unwrap();

    assert_eq!(
        recv(&mut rx_alice).await,
        ClientMessage::VersionAck {
            doc_id: doc.clone(),
            version: 1
        }
    );
    for rx in [&mut rx_bob, &mut rx_carol] {
        match recv(rx).await {
            ClientMessage::ApplyUpdate {
                doc_id,
                version,
                op: delivered,
            } => {
                assert_eq!(doc_id, doc);
                assert_eq!(version, 1);
                assert_eq!(delivered.components, op.components);
            }
            other => panic!("expected ApplyUpdate, got {:?}", other),
        }
    }

    // The resubmitted copy only re-acks the submitter.
    let retry = op.with_dup_if_source(vec![ConnectionId::new("alice")]);
    queue.enqueue(&doc, &retry).await.unwrap();
    worker.flush(&doc, FlushMode::Blocking).await.unwrap();

    assert_eq!(
        recv(&mut rx_alice).await,
        ClientMessage::VersionAck {
            doc_id: doc.clone(),
            version: 1
        }
    );
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert!(rx_bob.try_recv().is_err());
    assert!(rx_carol.try_recv().is_err());
    assert_eq!(router_a.last_version(&doc), Some(1));
    assert_eq!(router_b.last_version(&doc), Some(1));
}

#[tokio::test]
async fn rejected_op_forces_every_connection_to_resync() {
    let store = Arc::new(MemoryStore::new());
    let documents = Arc::new(MemoryDocumentStore::new());
    let broadcast = BroadcastChannel::new(Arc::new(MemoryPubSub::new()));
    let worker = FlushWorker::new(
        store.clone(),
        documents.clone(),
        Arc::new(LockManager::new(store.clone(), LockOptions::default())),
        broadcast.clone(),
        QueueOptions::default(),
    );
    let queue = UpdateQueue::new(store, QueueOptions::default());
    let doc = DocumentId::new("doc");
    documents.create(&doc, "abc");

    let router = ConnectionRouter::new(broadcast);
    let (tx, mut rx) = mpsc::channel(16);
    router
        .register_connection(doc.clone(), ConnectionId::new("c1"), Arc::new(tx))
        .await
        .unwrap();

    queue
        .enqueue(&doc, &EditOperation::delete(1, "zz", 0))
        .await
        .unwrap();
    assert!(worker.flush(&doc, FlushMode::Blocking).await.is_err());

    assert!(matches!(
        recv(&mut rx).await,
        ClientMessage::ForceResync { doc_id, .. } if doc_id == doc
    ));
}
