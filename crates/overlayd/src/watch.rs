//! Lease watch loop feeding event batches to a network reconciler.

use ipnet::Ipv4Net;
use overlay_common::{Event, EventType, Lease, LeaseError, LeaseStore};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// Delay before retrying after a store error.
const RETRY_DELAY: Duration = Duration::from_secs(1);

/// Leases seen so far, keyed by subnet.
#[derive(Debug, Default)]
struct LeaseView {
    leases: HashMap<Ipv4Net, Lease>,
}

impl LeaseView {
    /// Replace the view with `snapshot` and return the difference as events.
    ///
    /// A lease whose attributes changed is reported as removed then added so
    /// the old peer state is torn down first.
    fn reset(&mut self, snapshot: Vec<Lease>) -> Vec<Event> {
        let mut batch = Vec::new();
        let mut next: HashMap<Ipv4Net, Lease> = HashMap::with_capacity(snapshot.len());

        for lease in snapshot {
            match self.leases.remove(&lease.subnet) {
                Some(old) if old.same_allocation(&lease) => {}
                Some(old) => {
                    batch.push(Event::removed(old));
                    batch.push(Event::added(lease.clone()));
                }
                None => batch.push(Event::added(lease.clone())),
            }
            next.insert(lease.subnet, lease);
        }

        let mut vanished: Vec<Lease> = self.leases.drain().map(|(_, l)| l).collect();
        vanished.sort_by_key(|l| l.subnet);
        batch.extend(vanished.into_iter().map(Event::removed));

        self.leases = next;
        batch
    }

    fn apply(&mut self, events: &[Event]) {
        for event in events {
            match event.event_type {
                EventType::Added => {
                    self.leases.insert(event.lease.subnet, event.lease.clone());
                }
                EventType::Removed => {
                    self.leases.remove(&event.lease.subnet);
                }
            }
        }
    }
}

/// Watch `store` and send batches of peer events on `tx` until `cancel`
/// fires or the receiver goes away.
///
/// Events for `own_lease`'s subnet are dropped. The first call returns a
/// snapshot that is diffed against what was seen before, so a restarted
/// watch only reports real changes.
pub async fn watch_leases(
    cancel: CancellationToken,
    store: Arc<dyn LeaseStore>,
    own_lease: Lease,
    tx: mpsc::Sender<Vec<Event>>,
) {
    let mut view = LeaseView::default();
    let mut cursor: Option<u64> = None;

    loop {
        let result = tokio::select! {
            biased;
            _ = cancel.cancelled() => break,
            r = store.watch_leases(&cancel, cursor) => r,
        };

        let mut batch = match result {
            Ok(result) => {
                cursor = Some(result.cursor);
                match result.snapshot {
                    Some(snapshot) => {
                        debug!(leases = snapshot.len(), "Received lease snapshot");
                        view.reset(snapshot)
                    }
                    None => {
                        view.apply(&result.events);
                        result.events
                    }
                }
            }
            Err(e) if e.is_shutdown() => {
                debug!(error = %e, "Lease watch stopped");
                break;
            }
            Err(LeaseError::CursorExpired(c)) => {
                warn!(cursor = c, "Watch cursor expired, resynchronizing");
                cursor = None;
                continue;
            }
            Err(e) => {
                error!(error = %e, "Watch of subnet leases failed");
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = tokio::time::sleep(RETRY_DELAY) => {}
                }
                continue;
            }
        };

        batch.retain(|e| e.lease.subnet != own_lease.subnet);
        if batch.is_empty() {
            continue;
        }

        debug!(events = batch.len(), "Delivering lease batch");
        tokio::select! {
            _ = cancel.cancelled() => break,
            sent = tx.send(batch) => {
                if sent.is_err() {
                    break;
                }
            }
        }
    }

    info!("Lease watch exited");
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use overlay_common::{LeaseAttrs, LeaseWatchResult, MemoryLeaseStore};
    use overlay_common::memory_store::EVENT_LOG_CAPACITY;
    use overlay_test::{added, network_config, removed, vxlan_lease};
    use pretty_assertions::assert_eq;
    use serde_json::json;
    use std::sync::atomic::{AtomicUsize, Ordering};

    /// Forwards to a [`MemoryLeaseStore`], failing the first `failures`
    /// watch calls and counting snapshots and expired cursors.
    struct CountingStore {
        inner: Arc<MemoryLeaseStore>,
        failures_left: AtomicUsize,
        snapshots: AtomicUsize,
        expired: AtomicUsize,
    }

    impl CountingStore {
        fn new(inner: Arc<MemoryLeaseStore>, failures: usize) -> Self {
            Self {
                inner,
                failures_left: AtomicUsize::new(failures),
                snapshots: AtomicUsize::new(0),
                expired: AtomicUsize::new(0),
            }
        }
    }

    #[async_trait]
    impl LeaseStore for CountingStore {
        async fn acquire_lease(
            &self,
            cancel: &CancellationToken,
            attrs: &LeaseAttrs,
        ) -> Result<Lease, LeaseError> {
            self.inner.acquire_lease(cancel, attrs).await
        }

        async fn watch_leases(
            &self,
            cancel: &CancellationToken,
            cursor: Option<u64>,
        ) -> Result<LeaseWatchResult, LeaseError> {
            let failing = self
                .failures_left
                .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
                .is_ok();
            if failing {
                return Err(LeaseError::other("store unavailable"));
            }
            if cursor.is_none() {
                self.snapshots.fetch_add(1, Ordering::SeqCst);
            }
            let result = self.inner.watch_leases(cancel, cursor).await;
            if matches!(result, Err(LeaseError::CursorExpired(_))) {
                self.expired.fetch_add(1, Ordering::SeqCst);
            }
            result
        }
    }

    fn memory_store() -> Arc<MemoryLeaseStore> {
        Arc::new(MemoryLeaseStore::new(network_config(json!({"Type": "vxlan"}))))
    }

    fn subnets(view: &LeaseView) -> Vec<Ipv4Net> {
        let mut subnets: Vec<Ipv4Net> = view.leases.keys().copied().collect();
        subnets.sort();
        subnets
    }

    #[test]
    fn test_reset_diffs_snapshot() {
        let a = vxlan_lease("10.1.15.0/24", "192.168.1.5", "aa:bb:cc:dd:ee:01");
        let b = vxlan_lease("10.1.16.0/24", "192.168.1.6", "aa:bb:cc:dd:ee:02");
        let b2 = vxlan_lease("10.1.16.0/24", "192.168.1.7", "aa:bb:cc:dd:ee:02");
        let c = vxlan_lease("10.1.17.0/24", "192.168.1.8", "aa:bb:cc:dd:ee:03");

        let mut view = LeaseView::default();
        let first = view.reset(vec![a.clone(), b.clone()]);
        assert_eq!(first, vec![added(&a), added(&b)]);

        // a gone, b changed, c new
        let second = view.reset(vec![b2.clone(), c.clone()]);
        assert_eq!(
            second,
            vec![removed(&b), added(&b2), added(&c), removed(&a)]
        );

        assert!(view.reset(vec![b2, c]).is_empty());
    }

    #[test]
    fn test_apply_tracks_incremental_events() {
        let a = vxlan_lease("10.1.15.0/24", "192.168.1.5", "aa:bb:cc:dd:ee:01");
        let mut view = LeaseView::default();

        view.apply(&[added(&a)]);
        assert!(view.reset(vec![a.clone()]).is_empty());

        view.apply(&[removed(&a)]);
        assert_eq!(view.reset(vec![a.clone()]), vec![added(&a)]);
    }

    #[tokio::test]
    async fn test_expired_cursor_resyncs_from_snapshot() {
        let store = memory_store();
        let own = vxlan_lease("10.1.1.0/24", "192.168.1.2", "aa:bb:cc:dd:ee:00");
        let a = vxlan_lease("10.1.20.0/24", "192.168.1.20", "aa:bb:cc:dd:ee:20");
        let b = vxlan_lease("10.1.21.0/24", "192.168.1.21", "aa:bb:cc:dd:ee:21");
        let c = vxlan_lease("10.1.30.0/24", "192.168.1.30", "aa:bb:cc:dd:ee:30");
        for lease in [&own, &a, &b, &c] {
            store.insert_lease(lease.clone()).unwrap();
        }

        let counting = Arc::new(CountingStore::new(store.clone(), 0));
        let (tx, mut rx) = mpsc::channel(1);
        let cancel = CancellationToken::new();
        let handle = tokio::spawn(watch_leases(
            cancel.clone(),
            counting.clone(),
            own.clone(),
            tx,
        ));

        let mut consumer = LeaseView::default();
        let first = rx.recv().await.unwrap();
        assert_eq!(first, vec![added(&a), added(&b), added(&c)]);
        consumer.apply(&first);

        // Churn one subnet past the retained history without yielding to
        // the watcher, then withdraw two subnets.
        let churn = EVENT_LOG_CAPACITY + 100;
        for i in 0..churn {
            let ip = format!("192.168.2.{}", i % 200 + 1);
            store
                .insert_lease(vxlan_lease("10.1.20.0/24", &ip, "aa:bb:cc:dd:ee:20"))
                .unwrap();
        }
        store.remove_lease(&a.subnet).unwrap();
        store.remove_lease(&b.subnet).unwrap();

        let expected: Vec<Ipv4Net> = store
            .leases()
            .unwrap()
            .into_iter()
            .map(|l| l.subnet)
            .filter(|sn| *sn != own.subnet)
            .collect();
        assert_eq!(expected, vec![c.subnet]);

        for _ in 0..200 {
            while let Ok(batch) = rx.try_recv() {
                assert!(batch.iter().all(|e| e.lease.subnet != own.subnet));
                consumer.apply(&batch);
            }
            if subnets(&consumer) == expected {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert_eq!(subnets(&consumer), expected);
        assert_eq!(counting.expired.load(Ordering::SeqCst), 1);
        assert_eq!(counting.snapshots.load(Ordering::SeqCst), 2);

        cancel.cancel();
        handle.await.unwrap();
    }

    #[tokio::test]
    async fn test_store_error_is_retried() {
        let store = memory_store();
        let own = vxlan_lease("10.1.1.0/24", "192.168.1.2", "aa:bb:cc:dd:ee:00");
        let peer = vxlan_lease("10.1.20.0/24", "192.168.1.20", "aa:bb:cc:dd:ee:20");
        store.insert_lease(peer.clone()).unwrap();

        let counting = Arc::new(CountingStore::new(store.clone(), 1));
        let (tx, mut rx) = mpsc::channel(1);
        let cancel = CancellationToken::new();
        let handle = tokio::spawn(watch_leases(cancel.clone(), counting.clone(), own, tx));

        let batch = tokio::time::timeout(Duration::from_secs(5), rx.recv())
            .await
            .expect("watch did not recover")
            .unwrap();
        assert_eq!(batch, vec![added(&peer)]);
        assert_eq!(counting.failures_left.load(Ordering::SeqCst), 0);
        assert_eq!(counting.snapshots.load(Ordering::SeqCst), 1);

        cancel.cancel();
        handle.await.unwrap();
    }

    #[tokio::test]
    async fn test_cancel_during_retry_delay_exits() {
        let counting = Arc::new(CountingStore::new(memory_store(), usize::MAX));
        let own = vxlan_lease("10.1.1.0/24", "192.168.1.2", "aa:bb:cc:dd:ee:00");
        let (tx, mut rx) = mpsc::channel(1);
        let cancel = CancellationToken::new();
        let handle = tokio::spawn(watch_leases(cancel.clone(), counting, own, tx));

        tokio::time::sleep(Duration::from_millis(20)).await;
        cancel.cancel();
        tokio::time::timeout(Duration::from_millis(500), handle)
            .await
            .expect("watch ignored cancellation")
            .unwrap();
        assert!(rx.recv().await.is_none());
    }
}
