//! Preemptible server
//!
//! A capacity limited resource. Requests carry a priority (lower value is more
//! urgent) and are granted in (priority, arrival) order. When the server is full
//! and a request arrives that is strictly more urgent than the least urgent
//! holder, that holder is evicted and the new request takes its place.
//!
//! The server itself is passive: it only updates its holder set and wait queue
//! and reports what happened. Waking processes and delivering the "preempted"
//! interrupt is the scheduler's job.

use crate::qn_interface::{GrantId, LoadMetrics, Priority, ProcessId, ServerId};

/// Default multiplier turning cpu load into latency
pub const DEFAULT_LATENCY_SCALE: f64 = 10.0;

/// Default number of times the capacity fits in memory
pub const DEFAULT_MEMORY_FACTOR: f64 = 10.0;

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ResourceError {
    #[error("grant {grant} is neither held nor queued on {server}")]
    NotHeld { grant: GrantId, server: String },
}

/// A request occupying or waiting for one unit of capacity
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct Slot {
    pub grant: GrantId,
    pub priority: Priority,
    pub owner: ProcessId,
    sequence: u64,
}

impl Slot {
    fn key(&self) -> (Priority, u64) {
        (self.priority, self.sequence)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RequestOutcome {
    /// Capacity was free
    Granted,
    /// Waiting in the queue
    Queued,
    /// Granted by evicting `victim`
    Preempted { victim: Slot },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Release {
    /// false when a queued request was withdrawn
    pub was_held: bool,
    /// queued requests promoted to holders by this release
    pub woken: Vec<Slot>,
}

#[derive(Debug, Clone)]
pub struct Server {
    id: ServerId,
    name: String,
    kind: String,
    capacity: usize,
    latency_scale: f64,
    base_latency_scale: f64,
    memory_factor: f64,
    holders: Vec<Slot>,
    // sorted by (priority, sequence)
    queue: Vec<Slot>,
    metrics: LoadMetrics,
    peak_users: usize,
    sequence: u64,
}

impl Server {
    pub fn new(id: ServerId, kind: &str, capacity: usize) -> Self {
        Self::with_scales(id, kind, capacity, DEFAULT_LATENCY_SCALE, DEFAULT_MEMORY_FACTOR)
    }

    pub fn with_scales(
        id: ServerId,
        kind: &str,
        capacity: usize,
        latency_scale: f64,
        memory_factor: f64,
    ) -> Self {
        debug_assert!(capacity > 0, "server capacity must be positive");

        Self {
            id,
            name: format!("{}#{}", kind, id.index),
            kind: kind.to_string(),
            capacity,
            latency_scale,
            base_latency_scale: latency_scale,
            memory_factor,
            holders: Vec::new(),
            queue: Vec::new(),
            metrics: LoadMetrics::default(),
            peak_users: 0,
            sequence: 0,
        }
    }

    pub fn id(&self) -> ServerId {
        self.id
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn kind(&self) -> &str {
        &self.kind
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn users(&self) -> usize {
        self.holders.len()
    }

    pub fn queued(&self) -> usize {
        self.queue.len()
    }

    /// queued + active, the figure the pool balances on
    pub fn load(&self) -> usize {
        self.holders.len() + self.queue.len()
    }

    pub fn peak_users(&self) -> usize {
        self.peak_users
    }

    pub fn holds(&self, grant: GrantId) -> bool {
        self.holders.iter().any(|s| s.grant == grant)
    }

    pub fn is_queued(&self, grant: GrantId) -> bool {
        self.queue.iter().any(|s| s.grant == grant)
    }

    pub fn holders(&self) -> &[Slot] {
        &self.holders
    }

    /// Current load metrics, as of the last request/release
    pub fn utilization(&self) -> LoadMetrics {
        self.metrics
    }

    pub fn is_degraded(&self) -> bool {
        self.latency_scale != self.base_latency_scale
    }

    /// Multiply the latency scale, e.g. while a fault is active
    pub fn degrade(&mut self, factor: f64) {
        self.latency_scale = self.base_latency_scale * factor;
        self.refresh();
    }

    pub fn restore(&mut self) {
        self.latency_scale = self.base_latency_scale;
        self.refresh();
    }

    pub fn request(&mut self, grant: GrantId, priority: Priority, owner: ProcessId) -> RequestOutcome {
        let slot = Slot {
            grant,
            priority,
            owner,
            sequence: self.sequence,
        };
        self.sequence += 1;

        let outcome = if self.holders.len() < self.capacity {
            self.holders.push(slot);
            RequestOutcome::Granted
        } else {
            // least urgent holder; latest arrival among equals
            let victim_idx = self
                .holders
                .iter()
                .enumerate()
                .max_by_key(|(_, s)| s.key())
                .map(|(idx, _)| idx);

            match victim_idx {
                Some(idx) if priority < self.holders[idx].priority => {
                    let victim = self.holders.swap_remove(idx);
                    self.holders.push(slot);
                    RequestOutcome::Preempted { victim }
                }
                _ => {
                    let pos = self.queue.partition_point(|s| s.key() <= slot.key());
                    self.queue.insert(pos, slot);
                    RequestOutcome::Queued
                }
            }
        };

        self.refresh();
        outcome
    }

    /// Free a held grant, or withdraw a queued one.
    pub fn release(&mut self, grant: GrantId) -> Result<Release, ResourceError> {
        if let Some(idx) = self.holders.iter().position(|s| s.grant == grant) {
            self.holders.remove(idx);
            let woken = self.promote();
            self.refresh();
            return Ok(Release {
                was_held: true,
                woken,
            });
        }

        if let Some(idx) = self.queue.iter().position(|s| s.grant == grant) {
            self.queue.remove(idx);
            self.refresh();
            return Ok(Release {
                was_held: false,
                woken: Vec::new(),
            });
        }

        Err(ResourceError::NotHeld {
            grant,
            server: self.name.clone(),
        })
    }

    fn promote(&mut self) -> Vec<Slot> {
        let mut woken = Vec::new();
        while self.holders.len() < self.capacity && !self.queue.is_empty() {
            let next = self.queue.remove(0);
            self.holders.push(next);
            woken.push(next);
        }
        woken
    }

    fn refresh(&mut self) {
        debug_assert!(self.holders.len() <= self.capacity);

        let users = self.holders.len();
        let queue = self.queue.len();
        let cpu = users as f64 / self.capacity as f64;

        self.metrics = LoadMetrics {
            queue,
            users,
            cpu,
            memory: (users + queue) as f64 / (self.capacity as f64 * self.memory_factor),
            latency: cpu * self.latency_scale,
        };
        self.peak_users = self.peak_users.max(users);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn server(capacity: usize) -> Server {
        Server::new(ServerId { pool: 0, index: 0 }, "balance", capacity)
    }

    #[test]
    fn test_grant_until_full_then_queue() {
        let mut s = server(2);
        assert_eq!(s.request(1, 1, 10), RequestOutcome::Granted);
        assert_eq!(s.request(2, 1, 11), RequestOutcome::Granted);
        assert_eq!(s.request(3, 1, 12), RequestOutcome::Queued);
        assert_eq!(s.users(), 2);
        assert_eq!(s.queued(), 1);
        assert_eq!(s.load(), 3);
        assert_eq!(s.name(), "balance#0");
    }

    #[test]
    fn test_release_wakes_next_in_priority_order() {
        let mut s = server(1);
        s.request(1, 1, 10);
        s.request(2, 5, 11);
        s.request(3, 1, 12);
        s.request(4, 1, 13);

        let release = s.release(1).unwrap();
        assert!(release.was_held);
        // more urgent first, FIFO among equals
        assert_eq!(release.woken.len(), 1);
        assert_eq!(release.woken[0].grant, 3);

        assert_eq!(s.release(3).unwrap().woken[0].grant, 4);
        assert_eq!(s.release(4).unwrap().woken[0].grant, 2);
    }

    #[test]
    fn test_preempts_least_urgent_holder() {
        let mut s = server(1);
        s.request(1, 5, 10);

        match s.request(2, 1, 11) {
            RequestOutcome::Preempted { victim } => {
                assert_eq!(victim.grant, 1);
                assert_eq!(victim.owner, 10);
            }
            other => panic!("expected preemption, got {:?}", other),
        }
        assert!(s.holds(2));
        assert!(!s.holds(1));
        assert_eq!(s.users(), 1);
    }

    #[test]
    fn test_equal_priority_does_not_preempt() {
        let mut s = server(1);
        s.request(1, 1, 10);
        assert_eq!(s.request(2, 1, 11), RequestOutcome::Queued);
        assert!(s.holds(1));
    }

    #[test]
    fn test_victim_is_latest_among_least_urgent() {
        let mut s = server(3);
        s.request(1, 3, 10);
        s.request(2, 3, 11);
        s.request(3, 2, 12);

        match s.request(4, 0, 13) {
            RequestOutcome::Preempted { victim } => assert_eq!(victim.grant, 2),
            other => panic!("expected preemption, got {:?}", other),
        }
    }

    #[test]
    fn test_withdraw_queued_and_release_unknown() {
        let mut s = server(1);
        s.request(1, 1, 10);
        s.request(2, 1, 11);

        let release = s.release(2).unwrap();
        assert!(!release.was_held);
        assert_eq!(s.queued(), 0);

        assert!(matches!(s.release(99), Err(ResourceError::NotHeld { grant: 99, .. })));
        // releasing twice is an error, not a double free
        s.release(1).unwrap();
        assert!(s.release(1).is_err());
        assert_eq!(s.users(), 0);
    }

    #[test]
    fn test_metrics_follow_load() {
        let mut s = server(4);
        s.request(1, 1, 10);
        s.request(2, 1, 10);

        let m = s.utilization();
        assert_eq!(m.users, 2);
        assert_eq!(m.cpu, 0.5);
        assert_eq!(m.latency, 5.0);
        assert_eq!(m.memory, 2.0 / 40.0);

        s.degrade(10.0);
        assert!(s.is_degraded());
        assert_eq!(s.utilization().latency, 50.0);

        s.restore();
        s.release(1).unwrap();
        assert_eq!(s.utilization().latency, 2.5);
        assert_eq!(s.peak_users(), 2);
    }

    #[test]
    fn test_holders_never_exceed_capacity() {
        let mut s = server(3);
        for grant in 0..20u64 {
            s.request(grant, (grant % 4) as Priority, grant);
            assert!(s.users() <= s.capacity());
        }
        assert_eq!(s.peak_users(), 3);
    }
}
