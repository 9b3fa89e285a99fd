// shared types for the queueing-network engine

use std::cell::RefCell;
use std::cmp::Ordering;
use std::fmt;
use std::ops::{Add, Sub};
use std::rc::Rc;

pub type ProcessId = u64;
pub type GrantId = u64;
pub type TransactionId = u64;

/// Lower value = more urgent
pub type Priority = i32;

/// Priority used by ordinary transaction traffic
pub const DEFAULT_PRIORITY: Priority = 1;

/// Requester name used for the first hop of every transaction
pub const CLIENT: &str = "client";

/// Virtual time.
///
/// Ordered with `f64::total_cmp` so it can key the event queue. The scheduler
/// only ever produces finite, non-negative values.
#[derive(Copy, Clone, Debug, Default)]
pub struct SimTime(pub f64);

impl SimTime {
    pub const ZERO: SimTime = SimTime(0.0);

    pub fn as_f64(self) -> f64 {
        self.0
    }
}

impl PartialEq for SimTime {
    fn eq(&self, other: &Self) -> bool {
        self.cmp(other) == Ordering::Equal
    }
}

impl Eq for SimTime {}

impl Ord for SimTime {
    fn cmp(&self, other: &Self) -> Ordering {
        self.0.total_cmp(&other.0)
    }
}

impl PartialOrd for SimTime {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Add<f64> for SimTime {
    type Output = SimTime;

    fn add(self, delay: f64) -> SimTime {
        SimTime(self.0 + delay)
    }
}

impl Sub for SimTime {
    type Output = f64;

    fn sub(self, other: SimTime) -> f64 {
        self.0 - other.0
    }
}

impl fmt::Display for SimTime {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Handle of a server inside the pool registry: (pool index, server index)
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ServerId {
    pub pool: usize,
    pub index: usize,
}

/// Snapshot of a server's load, recomputed on every request/release
#[derive(Copy, Clone, Debug, Default, PartialEq)]
pub struct LoadMetrics {
    /// pending requests
    pub queue: usize,
    /// current holders
    pub users: usize,
    /// users / capacity
    pub cpu: f64,
    /// (users + queue) / (capacity * memory_factor)
    pub memory: f64,
    /// cpu * latency scale
    pub latency: f64,
}

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum Status {
    Info,
    Error,
}

impl fmt::Display for Status {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Status::Info => write!(f, "INFO"),
            Status::Error => write!(f, "ERROR"),
        }
    }
}

// ============================================================================
// Event Record Stream
// ============================================================================

/// One structured record per hop and per error.
///
/// Field order is fixed: time, requester, status, load metrics, transaction,
/// server, message. Downstream tooling reads the `Display` form, which is one
/// semicolon separated line in that order (metrics expand to cpu;memory;latency
/// and are left empty when absent).
#[derive(Clone, Debug, PartialEq)]
pub struct EventRecord {
    pub time: SimTime,
    pub requester: String,
    pub status: Status,
    pub metrics: Option<LoadMetrics>,
    pub transaction: Option<TransactionId>,
    pub server: Option<String>,
    pub message: String,
}

impl EventRecord {
    pub fn info(time: SimTime, requester: &str, message: String) -> Self {
        Self {
            time,
            requester: requester.to_string(),
            status: Status::Info,
            metrics: None,
            transaction: None,
            server: None,
            message,
        }
    }

    pub fn error(time: SimTime, requester: &str, message: String) -> Self {
        Self {
            status: Status::Error,
            ..Self::info(time, requester, message)
        }
    }

    pub fn with_metrics(mut self, metrics: LoadMetrics) -> Self {
        self.metrics = Some(metrics);
        self
    }

    pub fn with_transaction(mut self, transaction: TransactionId) -> Self {
        self.transaction = Some(transaction);
        self
    }

    pub fn with_server(mut self, server: &str) -> Self {
        self.server = Some(server.to_string());
        self
    }

    pub fn is_error(&self) -> bool {
        self.status == Status::Error
    }
}

impl fmt::Display for EventRecord {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{};{};{};", self.time, self.requester, self.status)?;
        match &self.metrics {
            Some(m) => write!(f, "{};{};{};", m.cpu, m.memory, m.latency)?,
            None => write!(f, ";;;")?,
        }
        match self.transaction {
            Some(tx) => write!(f, "{:016x};", tx)?,
            None => write!(f, ";")?,
        }
        write!(
            f,
            "{};{}",
            self.server.as_deref().unwrap_or_default(),
            self.message
        )
    }
}

// ============================================================================
// Observers
// ============================================================================

/// Observer attached to the scheduler
pub trait EventSink {
    fn on_record(&mut self, record: &EventRecord);

    /// Called for every process resumption, before the process body runs.
    fn on_resume(&mut self, _time: SimTime, _process: ProcessId, _wake: &str) {}
}

/// No-op event sink
pub struct NoOpSink;

impl EventSink for NoOpSink {
    #[inline(always)]
    fn on_record(&mut self, _record: &EventRecord) {}
}

// lets a caller keep a handle on a sink the scheduler owns
impl<T: EventSink> EventSink for Rc<RefCell<T>> {
    fn on_record(&mut self, record: &EventRecord) {
        self.borrow_mut().on_record(record);
    }

    fn on_resume(&mut self, time: SimTime, process: ProcessId, wake: &str) {
        self.borrow_mut().on_resume(time, process, wake);
    }
}
