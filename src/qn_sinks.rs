//! In-process event sinks

use log::info;

use crate::qn_interface::{EventRecord, EventSink, ProcessId, SimTime, Status, TransactionId};

// ============================================================================
// Console Logging Sink
// ============================================================================

/// Mirrors every record into the `log` facade at info level
pub struct ConsoleEventSink {
    enabled: bool,
}

impl ConsoleEventSink {
    pub fn new(enabled: bool) -> Self {
        Self { enabled }
    }
}

impl EventSink for ConsoleEventSink {
    fn on_record(&mut self, record: &EventRecord) {
        if self.enabled {
            info!("{}", record);
        }
    }
}

// ============================================================================
// Collector Event Sink (In-Memory)
// ============================================================================

/// Collects records in memory for programmatic analysis
#[derive(Debug, Default)]
pub struct CollectorEventSink {
    pub records: Vec<EventRecord>,
}

#[derive(Debug, Default, PartialEq, Eq)]
pub struct StatusCounts {
    pub info: usize,
    pub error: usize,
}

impl CollectorEventSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn errors(&self) -> impl Iterator<Item = &EventRecord> {
        self.records.iter().filter(|r| r.status == Status::Error)
    }

    pub fn infos(&self) -> impl Iterator<Item = &EventRecord> {
        self.records.iter().filter(|r| r.status == Status::Info)
    }

    pub fn for_transaction(&self, transaction: TransactionId) -> impl Iterator<Item = &EventRecord> {
        self.records
            .iter()
            .filter(move |r| r.transaction == Some(transaction))
    }

    pub fn for_server<'a>(&'a self, server: &'a str) -> impl Iterator<Item = &'a EventRecord> {
        self.records
            .iter()
            .filter(move |r| r.server.as_deref() == Some(server))
    }

    pub fn count_by_status(&self) -> StatusCounts {
        let mut counts = StatusCounts::default();
        for record in &self.records {
            match record.status {
                Status::Info => counts.info += 1,
                Status::Error => counts.error += 1,
            }
        }
        counts
    }

    /// Every record as its semicolon line, newline terminated
    pub fn to_lines(&self) -> String {
        self.records.iter().map(|r| format!("{}\n", r)).collect()
    }
}

impl EventSink for CollectorEventSink {
    fn on_record(&mut self, record: &EventRecord) {
        self.records.push(record.clone());
    }
}

// ============================================================================
// Multi Sink (Combine Multiple Sinks)
// ============================================================================

/// Fans records out to several sinks
#[derive(Default)]
pub struct MultiEventSink {
    sinks: Vec<Box<dyn EventSink>>,
}

impl MultiEventSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_sink(&mut self, sink: Box<dyn EventSink>) {
        self.sinks.push(sink);
    }
}

impl EventSink for MultiEventSink {
    fn on_record(&mut self, record: &EventRecord) {
        for sink in &mut self.sinks {
            sink.on_record(record);
        }
    }

    fn on_resume(&mut self, time: SimTime, process: ProcessId, wake: &str) {
        for sink in &mut self.sinks {
            sink.on_resume(time, process, wake);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::RefCell;
    use std::rc::Rc;

    fn records() -> Vec<EventRecord> {
        vec![
            EventRecord::info(SimTime(1.0), "client", "Requesting balance by client".into())
                .with_transaction(1)
                .with_server("balance#0"),
            EventRecord::error(SimTime(2.0), "client", "Error due to timeout".into())
                .with_transaction(2)
                .with_server("balance#1"),
            EventRecord::info(SimTime(3.0), "balance#0", "Requesting credit by balance".into())
                .with_transaction(1)
                .with_server("credit#0"),
        ]
    }

    #[test]
    fn test_collector_queries() {
        let mut collector = CollectorEventSink::new();
        for record in records() {
            collector.on_record(&record);
        }

        assert_eq!(collector.count_by_status(), StatusCounts { info: 2, error: 1 });
        assert_eq!(collector.for_transaction(1).count(), 2);
        assert_eq!(collector.for_server("balance#1").count(), 1);
        assert_eq!(collector.errors().next().unwrap().time, SimTime(2.0));
        assert_eq!(collector.to_lines().lines().count(), 3);
    }

    #[test]
    fn test_multi_sink_fans_out() {
        let a = Rc::new(RefCell::new(CollectorEventSink::new()));
        let b = Rc::new(RefCell::new(CollectorEventSink::new()));
        let mut multi = MultiEventSink::new();
        multi.add_sink(Box::new(a.clone()));
        multi.add_sink(Box::new(b.clone()));
        multi.add_sink(Box::new(ConsoleEventSink::new(false)));

        for record in records() {
            multi.on_record(&record);
        }
        assert_eq!(a.borrow().records.len(), 3);
        assert_eq!(b.borrow().records, a.borrow().records);
    }
}
