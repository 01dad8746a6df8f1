use crate::channel_manager::{ConfirmEvent, DeliveryTag};
use crate::error::CrackError;
use crate::task::{CreatedTask, Task, TaskResult, TaskStatus};
use crossbeam_channel::Sender;
use rustc_hash::FxHashMap;
use std::collections::BTreeMap;
use std::time::{Duration, Instant};
use tracing::{debug, warn};

pub type CreateReply = Sender<Result<CreatedTask, CrackError>>;
pub type ReportReply = Sender<Result<bool, CrackError>>;

/// A found word together with the delivery that carried it, if any.
pub struct ResultReport {
    pub result: TaskResult,
    pub delivery: Option<DeliveryTag>,
    pub reply: Option<ReportReply>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EmissionKind {
    /// A new task; it is persisted once every partition is resolved.
    Create,
    /// A stored `WAITING` task being sent out again.
    Reemit,
}

struct PendingEmission {
    task: Task,
    kind: EmissionKind,
    part_count: u32,
    confirmed: Vec<u32>,
    failed: Vec<u32>,
    started: Instant,
    reply: Option<CreateReply>,
    waiters: Vec<CreateReply>,
    early_reports: Vec<ResultReport>,
}

impl PendingEmission {
    fn is_resolved(&self) -> bool {
        (self.confirmed.len() + self.failed.len()) as u32 >= self.part_count
    }

    fn unresolved_parts(&self) -> Vec<u32> {
        (1..=self.part_count)
            .filter(|part| !self.confirmed.contains(part) && !self.failed.contains(part))
            .collect()
    }
}

/// An emission whose partitions have all been acked, nacked or abandoned.
pub struct CompletedEmission {
    pub task: Task,
    pub kind: EmissionKind,
    pub part_count: u32,
    pub failed_parts: Vec<u32>,
    pub reply: Option<CreateReply>,
    pub waiters: Vec<CreateReply>,
    /// Results that arrived before the last confirmation; replayed once the
    /// task's status is settled.
    pub early_reports: Vec<ResultReport>,
}

impl CompletedEmission {
    /// Any unconfirmed partition leaves the task waiting for re-emission.
    pub fn status(&self) -> TaskStatus {
        if self.failed_parts.is_empty() {
            TaskStatus::InProgress
        } else {
            TaskStatus::Waiting
        }
    }
}

/// Counts publisher confirmations per task. Completion is driven by the count
/// of resolved partitions, never by a timer, except for `expire`.
#[derive(Default)]
pub struct ConfirmTracker {
    pending: FxHashMap<String, PendingEmission>,
    tags: BTreeMap<DeliveryTag, (String, u32)>,
}

impl ConfirmTracker {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.pending.len()
    }

    pub fn is_empty(&self) -> bool {
        self.pending.is_empty()
    }

    pub fn contains(&self, request_id: &str) -> bool {
        self.pending.contains_key(request_id)
    }

    /// A task for `hash` whose partitions are still being confirmed.
    pub fn find_by_hash(&self, hash: &str) -> Option<&Task> {
        self.pending
            .values()
            .map(|emission| &emission.task)
            .find(|task| task.hash == hash)
    }

    /// Registers a duplicate create request; it is answered when the emission completes.
    pub fn attach_waiter(&mut self, request_id: &str, reply: CreateReply) -> Result<(), CreateReply> {
        match self.pending.get_mut(request_id) {
            Some(emission) => {
                emission.waiters.push(reply);
                Ok(())
            }
            None => Err(reply),
        }
    }

    /// Keeps a result for a task still being emitted. Hands the report back
    /// when no emission for its task is pending.
    pub fn hold_report(&mut self, report: ResultReport) -> Result<(), ResultReport> {
        match self.pending.get_mut(&report.result.request_id) {
            Some(emission) => {
                emission.early_reports.push(report);
                Ok(())
            }
            None => Err(report),
        }
    }

    pub fn begin(&mut self, task: Task, kind: EmissionKind, part_count: u32, reply: Option<CreateReply>) {
        debug!(request_id = %task.request_id, ?kind, part_count, "tracking emission");
        self.pending.insert(
            task.request_id.clone(),
            PendingEmission {
                task,
                kind,
                part_count,
                confirmed: Vec::new(),
                failed: Vec::new(),
                started: Instant::now(),
                reply,
                waiters: Vec::new(),
                early_reports: Vec::new(),
            },
        );
    }

    pub fn record_published(&mut self, request_id: &str, part_number: u32, delivery: DeliveryTag) {
        if self.pending.contains_key(request_id) {
            self.tags.insert(delivery, (request_id.to_string(), part_number));
        }
    }

    /// A publish that failed synchronously counts as a negative confirmation.
    pub fn record_failed(&mut self, request_id: &str, part_number: u32) -> Option<CompletedEmission> {
        let emission = self.pending.get_mut(request_id)?;
        emission.failed.push(part_number);
        self.take_if_resolved(request_id)
    }

    pub fn confirm(&mut self, event: ConfirmEvent) -> Vec<CompletedEmission> {
        let upper = DeliveryTag {
            epoch: event.epoch,
            tag: event.delivery_tag,
        };
        let matched: Vec<DeliveryTag> = if event.multiple {
            let lower = DeliveryTag {
                epoch: event.epoch,
                tag: 0,
            };
            self.tags.range(lower..=upper).map(|(tag, _)| *tag).collect()
        } else if self.tags.contains_key(&upper) {
            vec![upper]
        } else {
            Vec::new()
        };
        if matched.is_empty() {
            debug!(?event, "confirmation matched no tracked publish");
            return Vec::new();
        }

        let mut touched = Vec::new();
        for tag in matched {
            let Some((request_id, part_number)) = self.tags.remove(&tag) else {
                continue;
            };
            if let Some(emission) = self.pending.get_mut(&request_id) {
                if event.ack {
                    emission.confirmed.push(part_number);
                } else {
                    warn!(%request_id, part_number, "broker nacked partition");
                    emission.failed.push(part_number);
                }
            }
            if !touched.contains(&request_id) {
                touched.push(request_id);
            }
        }
        touched
            .iter()
            .filter_map(|request_id| self.take_if_resolved(request_id))
            .collect()
    }

    /// The session that carried these publishes is gone; nothing left will be confirmed.
    pub fn abandon_all(&mut self) -> Vec<CompletedEmission> {
        self.tags.clear();
        let request_ids: Vec<String> = self.pending.keys().cloned().collect();
        request_ids
            .iter()
            .filter_map(|request_id| self.abandon(request_id))
            .collect()
    }

    /// Abandons emissions that have waited longer than `max_wait` for confirmations.
    pub fn expire(&mut self, now: Instant, max_wait: Duration) -> Vec<CompletedEmission> {
        let stale: Vec<String> = self
            .pending
            .iter()
            .filter(|(_, emission)| now.saturating_duration_since(emission.started) >= max_wait)
            .map(|(request_id, _)| request_id.clone())
            .collect();
        if stale.is_empty() {
            return Vec::new();
        }
        self.tags.retain(|_, (request_id, _)| !stale.contains(request_id));
        stale
            .iter()
            .filter_map(|request_id| {
                warn!(%request_id, "confirmations timed out");
                self.abandon(request_id)
            })
            .collect()
    }

    fn abandon(&mut self, request_id: &str) -> Option<CompletedEmission> {
        let emission = self.pending.get_mut(request_id)?;
        let unresolved = emission.unresolved_parts();
        emission.failed.extend(unresolved);
        self.take_if_resolved(request_id)
    }

    fn take_if_resolved(&mut self, request_id: &str) -> Option<CompletedEmission> {
        if !self.pending.get(request_id)?.is_resolved() {
            return None;
        }
        let mut emission = self.pending.remove(request_id)?;
        emission.failed.sort_unstable();
        Some(CompletedEmission {
            task: emission.task,
            kind: emission.kind,
            part_count: emission.part_count,
            failed_parts: emission.failed,
            reply: emission.reply,
            waiters: emission.waiters,
            early_reports: emission.early_reports,
        })
    }
}
