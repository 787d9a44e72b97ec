//! In-memory lease store.
//!
//! Allocates per-node subnets out of a [`NetworkConfig`] and keeps a
//! bounded change log that watchers read by cursor. Used as the store of a
//! single-node deployment and as the lease store in tests.

use async_trait::async_trait;
use chrono::{Duration, Utc};
use ipnet::Ipv4Net;
use std::collections::{BTreeMap, VecDeque};
use std::sync::Mutex;
use tokio::sync::Notify;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use crate::config::NetworkConfig;
use crate::lease::{Event, Lease, LeaseAttrs, LeaseError, LeaseStore, LeaseWatchResult};

/// Number of change events retained for cursor-based watchers.
pub const EVENT_LOG_CAPACITY: usize = 1000;

/// Lease lifetime stamped on acquired leases.
const LEASE_TTL_HOURS: i64 = 24;

#[derive(Debug, Default)]
struct State {
    leases: BTreeMap<Ipv4Net, Lease>,
    /// (sequence, event), oldest first.
    log: VecDeque<(u64, Event)>,
    /// Sequence number of the most recent event; 0 before any change.
    head: u64,
}

impl State {
    fn record(&mut self, event: Event) {
        self.head += 1;
        self.log.push_back((self.head, event));
        while self.log.len() > EVENT_LOG_CAPACITY {
            self.log.pop_front();
        }
    }

    /// Events after `cursor`, or `CursorExpired` if some were dropped.
    fn since(&self, cursor: u64) -> Result<Vec<Event>, LeaseError> {
        let oldest = self.log.front().map(|(seq, _)| *seq).unwrap_or(self.head + 1);
        if cursor + 1 < oldest {
            return Err(LeaseError::CursorExpired(cursor));
        }
        Ok(self
            .log
            .iter()
            .filter(|(seq, _)| *seq > cursor)
            .map(|(_, event)| event.clone())
            .collect())
    }
}

#[derive(Debug)]
pub struct MemoryLeaseStore {
    config: NetworkConfig,
    state: Mutex<State>,
    changed: Notify,
}

impl MemoryLeaseStore {
    pub fn new(config: NetworkConfig) -> Self {
        Self {
            config,
            state: Mutex::new(State::default()),
            changed: Notify::new(),
        }
    }

    pub fn config(&self) -> &NetworkConfig {
        &self.config
    }

    fn lock(&self) -> Result<std::sync::MutexGuard<'_, State>, LeaseError> {
        self.state
            .lock()
            .map_err(|_| LeaseError::other("lease store state poisoned"))
    }

    /// Publish a lease owned by another node.
    pub fn insert_lease(&self, lease: Lease) -> Result<(), LeaseError> {
        {
            let mut state = self.lock()?;
            if let Some(existing) = state.leases.get(&lease.subnet) {
                if existing.same_allocation(&lease) {
                    return Ok(());
                }
            }
            // A changed lease is withdrawn first so watchers drop the old peer state.
            if let Some(old) = state.leases.insert(lease.subnet, lease.clone()) {
                state.record(Event::removed(old));
            }
            state.record(Event::added(lease));
        }
        self.changed.notify_waiters();
        Ok(())
    }

    /// Withdraw a lease; returns it if it existed.
    pub fn remove_lease(&self, subnet: &Ipv4Net) -> Result<Option<Lease>, LeaseError> {
        let removed = {
            let mut state = self.lock()?;
            let removed = state.leases.remove(subnet);
            if let Some(lease) = &removed {
                state.record(Event::removed(lease.clone()));
            }
            removed
        };
        if removed.is_some() {
            self.changed.notify_waiters();
        }
        Ok(removed)
    }

    /// Current leases ordered by subnet.
    pub fn leases(&self) -> Result<Vec<Lease>, LeaseError> {
        Ok(self.lock()?.leases.values().cloned().collect())
    }
}

#[async_trait]
impl LeaseStore for MemoryLeaseStore {
    async fn acquire_lease(
        &self,
        cancel: &CancellationToken,
        attrs: &LeaseAttrs,
    ) -> Result<Lease, LeaseError> {
        if cancel.is_cancelled() {
            return Err(LeaseError::Canceled);
        }

        let lease = {
            let mut state = self.lock()?;
            let expiration = Some(Utc::now() + Duration::hours(LEASE_TTL_HOURS));

            let held = state
                .leases
                .values()
                .find(|l| l.attrs.public_ip == attrs.public_ip)
                .map(|l| l.subnet);

            let subnet = match held {
                Some(subnet) => subnet,
                None => self
                    .config
                    .subnets()
                    .find(|sn| !state.leases.contains_key(sn))
                    .ok_or_else(|| {
                        LeaseError::other(format!("out of subnets in {}", self.config.network))
                    })?,
            };

            let mut lease = Lease::new(subnet, attrs.clone());
            lease.expiration = expiration;

            match state.leases.insert(subnet, lease.clone()) {
                Some(old) if old.same_allocation(&lease) => {}
                Some(old) => {
                    state.record(Event::removed(old));
                    state.record(Event::added(lease.clone()));
                }
                None => state.record(Event::added(lease.clone())),
            }
            if held.is_some() {
                debug!(subnet = %subnet, "Renewed lease");
            } else {
                info!(subnet = %subnet, public_ip = %attrs.public_ip, "Allocated lease");
            }
            lease
        };

        self.changed.notify_waiters();
        Ok(lease)
    }

    async fn watch_leases(
        &self,
        cancel: &CancellationToken,
        cursor: Option<u64>,
    ) -> Result<LeaseWatchResult, LeaseError> {
        loop {
            let notified = self.changed.notified();

            {
                let state = self.lock()?;
                match cursor {
                    None => {
                        return Ok(LeaseWatchResult {
                            events: Vec::new(),
                            snapshot: Some(state.leases.values().cloned().collect()),
                            cursor: state.head,
                        });
                    }
                    Some(cursor) => {
                        let events = state.since(cursor)?;
                        if !events.is_empty() {
                            return Ok(LeaseWatchResult {
                                events,
                                snapshot: None,
                                cursor: state.head,
                            });
                        }
                    }
                }
            }

            tokio::select! {
                _ = cancel.cancelled() => return Err(LeaseError::Canceled),
                _ = notified => {}
            }
        }
    }
}
