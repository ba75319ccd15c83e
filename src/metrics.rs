//! Atomic counters surfaced through `serverStatus`.

use std::collections::HashMap;
use std::sync::Mutex;
use std::sync::atomic::{AtomicU64, Ordering};

use crate::doc;
use crate::types::{Document, Value};

#[derive(Default)]
pub struct Metrics {
    connections_accepted: AtomicU64,
    requests_total: AtomicU64,
    command_errors: AtomicU64,
    commands: Mutex<HashMap<String, u64>>,
}

impl Metrics {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record_connection(&self) {
        self.connections_accepted.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_request(&self) {
        self.requests_total.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_command(&self, name: &str) {
        let mut commands = self.commands.lock().expect("metrics poisoned");
        *commands.entry(name.to_string()).or_insert(0) += 1;
    }

    pub fn record_command_error(&self) {
        self.command_errors.fetch_add(1, Ordering::Relaxed);
    }

    pub fn connections_accepted(&self) -> u64 {
        self.connections_accepted.load(Ordering::Relaxed)
    }

    pub fn requests_total(&self) -> u64 {
        self.requests_total.load(Ordering::Relaxed)
    }

    pub fn command_errors(&self) -> u64 {
        self.command_errors.load(Ordering::Relaxed)
    }

    /// Snapshot as a reply fragment, commands sorted by name for stable
    /// output.
    pub fn to_document(&self) -> Document {
        let mut entries: Vec<(String, u64)> = {
            let commands = self.commands.lock().expect("metrics poisoned");
            commands.iter().map(|(k, v)| (k.clone(), *v)).collect()
        };
        entries.sort();
        let mut commands = Document::new();
        for (name, count) in entries {
            commands.insert(name, Value::Int64(count as i64));
        }
        doc! {
            "connectionsAccepted": self.connections_accepted() as i64,
            "requestsTotal": self.requests_total() as i64,
            "commandErrors": self.command_errors() as i64,
            "commands": commands,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_counters_accumulate() {
        let m = Metrics::new();
        m.record_connection();
        m.record_request();
        m.record_request();
        m.record_command("find");
        m.record_command("find");
        m.record_command("insert");
        m.record_command_error();

        let doc = m.to_document();
        assert_eq!(doc.get_i64("connectionsAccepted"), Some(1));
        assert_eq!(doc.get_i64("requestsTotal"), Some(2));
        assert_eq!(doc.get_i64("commandErrors"), Some(1));
        let commands = doc.get_document("commands").unwrap();
        assert_eq!(commands.get_i64("find"), Some(2));
        assert_eq!(commands.get_i64("insert"), Some(1));
    }
}
