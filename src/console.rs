use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::sync::{Arc, Mutex, PoisonError};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ConsoleDirection {
    Sent,
    Received,
}

/// One line of station traffic
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConsoleEntry {
    pub timestamp: DateTime<Utc>,
    pub direction: ConsoleDirection,
    pub content: String,
}

/// Bounded log of sent commands and received lines; oldest entries go first
#[derive(Clone)]
pub struct Console {
    entries: Arc<Mutex<VecDeque<ConsoleEntry>>>,
    capacity: usize,
}

impl Console {
    pub fn new(capacity: usize) -> Self {
        Self {
            entries: Arc::new(Mutex::new(VecDeque::with_capacity(capacity.min(1024)))),
            capacity,
        }
    }

    pub fn push(&self, direction: ConsoleDirection, content: impl Into<String>) {
        if self.capacity == 0 {
            return;
        }
        let mut entries = self.entries.lock().unwrap_or_else(PoisonError::into_inner);
        while entries.len() >= self.capacity {
            entries.pop_front();
        }
        entries.push_back(ConsoleEntry {
            timestamp: Utc::now(),
            direction,
            content: content.into(),
        });
    }

    /// Entries oldest first
    pub fn entries(&self) -> Vec<ConsoleEntry> {
        self.entries
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .cloned()
            .collect()
    }

    pub fn len(&self) -> usize {
        self.entries.lock().unwrap_or_else(PoisonError::into_inner).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn clear(&self) {
        self.entries
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn keeps_most_recent_entries() {
        let console = Console::new(3);
        for i in 0..5 {
            console.push(ConsoleDirection::Sent, format!("<t 3 {i} 1>"));
        }
        let contents: Vec<String> = console.entries().into_iter().map(|e| e.content).collect();
        assert_eq!(contents, vec!["<t 3 2 1>", "<t 3 3 1>", "<t 3 4 1>"]);
    }

    #[test]
    fn clear_and_zero_capacity() {
        let console = Console::new(2);
        console.push(ConsoleDirection::Received, "*");
        assert_eq!(console.entries()[0].direction, ConsoleDirection::Received);
        console.clear();
        assert!(console.is_empty());

        let disabled = Console::new(0);
        disabled.push(ConsoleDirection::Sent, "<1>");
        assert!(disabled.is_empty());
    }

    #[test]
    fn entries_serialize_with_lowercase_direction() {
        let console = Console::new(1);
        console.push(ConsoleDirection::Sent, "<!>");
        let json = serde_json::to_value(&console.entries()[0]).unwrap();
        assert_eq!(json["direction"], "sent");
        assert_eq!(json["content"], "<!>");
    }
}
