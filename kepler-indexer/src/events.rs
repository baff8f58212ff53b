//! In-process chain event fan-out.
//!
//! After a successful import the block fetcher publishes one event per
//! non-empty result group. Delivery is fire-and-forget and at-most-once:
//! a subscriber with a full channel misses the event, a dropped subscriber
//! is pruned on the next broadcast. Import success never depends on
//! delivery.

use std::collections::HashMap;
use std::sync::{
    atomic::{AtomicU64, Ordering},
    Arc, Mutex,
};

use tokio::sync::mpsc;
use tracing::debug;

use kepler_core::models::{AddressHash, BlockHash, TxHash};
use kepler_storage::postgres::import::Imported;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum ChainEventKind {
    Addresses,
    CoinBalances,
    Blocks,
    InternalTransactions,
    Logs,
    TokenTransfers,
    Transactions,
}

/// Which pipeline produced the batch; realtime consumers typically only
/// care about `Realtime`.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum BroadcastKind {
    Realtime,
    Catchup,
}

#[derive(Clone, Debug, PartialEq)]
pub enum EventPayload {
    Addresses(Vec<AddressHash>),
    CoinBalances(Vec<(AddressHash, u64)>),
    Blocks(Vec<(BlockHash, u64)>),
    InternalTransactions(Vec<(TxHash, u64)>),
    Logs(Vec<(TxHash, u64)>),
    TokenTransfers(Vec<(TxHash, u64)>),
    Transactions(Vec<TxHash>),
}

#[derive(Clone, Debug, PartialEq)]
pub struct ChainEvent {
    pub kind: ChainEventKind,
    pub broadcast: BroadcastKind,
    pub payload: EventPayload,
}

#[derive(Clone, Default)]
pub struct EventBus {
    subscribers: Arc<Mutex<HashMap<u64, mpsc::Sender<ChainEvent>>>>,
    next_id: Arc<AtomicU64>,
}

impl EventBus {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn subscribe(&self, capacity: usize) -> mpsc::Receiver<ChainEvent> {
        let (tx, rx) = mpsc::channel(capacity);
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        self.subscribers
            .lock()
            .expect("subscriber lock poisoned")
            .insert(id, tx);
        rx
    }

    /// Publishes one event per non-empty group of an import result.
    pub fn broadcast_import(&self, imported: &Imported, broadcast: BroadcastKind) {
        let mut events = Vec::new();
        if !imported.addresses.is_empty() {
            events.push((
                ChainEventKind::Addresses,
                EventPayload::Addresses(imported.addresses.clone()),
            ));
        }
        if !imported.coin_balances.is_empty() {
            events.push((
                ChainEventKind::CoinBalances,
                EventPayload::CoinBalances(imported.coin_balances.clone()),
            ));
        }
        if !imported.blocks.is_empty() {
            events.push((ChainEventKind::Blocks, EventPayload::Blocks(imported.blocks.clone())));
        }
        if !imported.internal_transactions.is_empty() {
            events.push((
                ChainEventKind::InternalTransactions,
                EventPayload::InternalTransactions(imported.internal_transactions.clone()),
            ));
        }
        if !imported.logs.is_empty() {
            events.push((ChainEventKind::Logs, EventPayload::Logs(imported.logs.clone())));
        }
        if !imported.token_transfers.is_empty() {
            events.push((
                ChainEventKind::TokenTransfers,
                EventPayload::TokenTransfers(imported.token_transfers.clone()),
            ));
        }
        if !imported.transactions.is_empty() {
            events.push((
                ChainEventKind::Transactions,
                EventPayload::Transactions(imported.transactions.clone()),
            ));
        }

        for (kind, payload) in events {
            self.publish(ChainEvent { kind, broadcast, payload });
        }
    }

    fn publish(&self, event: ChainEvent) {
        let mut subscribers = self.subscribers.lock().expect("subscriber lock poisoned");
        let mut dead = Vec::new();
        for (id, tx) in subscribers.iter() {
            match tx.try_send(event.clone()) {
                Ok(()) => {}
                Err(mpsc::error::TrySendError::Full(_)) => {
                    debug!(subscriber = id, "subscriber lagging, event dropped");
                }
                Err(mpsc::error::TrySendError::Closed(_)) => dead.push(*id),
            }
        }
        for id in dead {
            subscribers.remove(&id);
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use kepler_core::Bytes;
    use pretty_assertions::assert_eq;

    fn imported() -> Imported {
        Imported {
            blocks: vec![(Bytes::from(vec![1; 32]), 1)],
            transactions: vec![Bytes::from(vec![2; 32])],
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn broadcasts_only_non_empty_groups() {
        let bus = EventBus::new();
        let mut rx = bus.subscribe(8);

        bus.broadcast_import(&imported(), BroadcastKind::Realtime);

        let first = rx.recv().await.unwrap();
        let second = rx.recv().await.unwrap();
        assert_eq!(first.kind, ChainEventKind::Blocks);
        assert_eq!(second.kind, ChainEventKind::Transactions);
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn dropped_subscribers_are_pruned() {
        let bus = EventBus::new();
        let rx = bus.subscribe(1);
        drop(rx);

        bus.broadcast_import(&imported(), BroadcastKind::Catchup);
        assert!(bus.subscribers.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn full_subscriber_does_not_block_import() {
        let bus = EventBus::new();
        let mut rx = bus.subscribe(1);

        bus.broadcast_import(&imported(), BroadcastKind::Realtime);
        // only the first event fit; the second was dropped, not blocked on
        assert_eq!(rx.recv().await.unwrap().kind, ChainEventKind::Blocks);
        assert!(rx.try_recv().is_err());
    }
}
