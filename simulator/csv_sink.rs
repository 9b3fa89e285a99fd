// CSV export of the record stream

use std::fs::File;
use std::io::{BufWriter, Write};
use std::path::Path;

use qn_sim::{EventRecord, EventSink};

pub const CSV_HEADER: &str = "time;requester;status;cpu;memory;latency;transaction;server;message";

/// Writes one semicolon separated line per record
pub struct CsvEventSink {
    writer: BufWriter<File>,
}

impl CsvEventSink {
    pub fn new<P: AsRef<Path>>(path: P) -> std::io::Result<Self> {
        let file = File::create(path)?;
        let mut writer = BufWriter::new(file);

        writeln!(writer, "{}", CSV_HEADER)?;

        Ok(Self { writer })
    }

    pub fn flush(&mut self) -> std::io::Result<()> {
        self.writer.flush()
    }
}

impl EventSink for CsvEventSink {
    fn on_record(&mut self, record: &EventRecord) {
        if let Err(e) = writeln!(self.writer, "{}", record) {
            eprintln!("Error writing to CSV: {}", e);
        }
    }
}

impl Drop for CsvEventSink {
    fn drop(&mut self) {
        let _ = self.flush();
    }
}
