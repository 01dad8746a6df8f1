use rustc_hash::FxHashMap;
use std::collections::BTreeSet;
use std::time::Instant;

/// One deadline per in-progress task, fired from the coordinator's loop.
#[derive(Default)]
pub struct Watchdog {
    deadlines: FxHashMap<String, Instant>,
    queue: BTreeSet<(Instant, String)>,
}

impl Watchdog {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.deadlines.len()
    }

    pub fn is_empty(&self) -> bool {
        self.deadlines.is_empty()
    }

    pub fn is_armed(&self, request_id: &str) -> bool {
        self.deadlines.contains_key(request_id)
    }

    /// Arms or re-arms the timer for `request_id`.
    pub fn arm(&mut self, request_id: &str, deadline: Instant) {
        self.disarm(request_id);
        self.deadlines.insert(request_id.to_string(), deadline);
        self.queue.insert((deadline, request_id.to_string()));
    }

    /// Returns the deadline that was pending, if any.
    pub fn disarm(&mut self, request_id: &str) -> Option<Instant> {
        let deadline = self.deadlines.remove(request_id)?;
        self.queue.remove(&(deadline, request_id.to_string()));
        Some(deadline)
    }

    pub fn next_deadline(&self) -> Option<Instant> {
        self.queue.first().map(|(deadline, _)| *deadline)
    }

    /// Removes and returns every task whose deadline is at or before `now`.
    pub fn expired(&mut self, now: Instant) -> Vec<String> {
        let mut fired = Vec::new();
        while let Some((deadline, _)) = self.queue.first() {
            if *deadline > now {
                break;
            }
            if let Some((_, request_id)) = self.queue.pop_first() {
                self.deadlines.remove(&request_id);
                fired.push(request_id);
            }
        }
        fired
    }
}
