use crate::channel_manager::{
    BrokerConnector, ChannelManager, DeliveryTag, HeartbeatStatus, ReceiverSession, Settlement,
};
use crate::config::WorkerConfig;
use crate::error::CrackError;
use crate::matcher::{HashMatcher, MatchOutcome, MatchProgress, TargetHash};
use crate::partition::PartitionRange;
use crate::task::{SubTask, TaskResult};
use crossbeam_channel::{select, tick, Receiver, Sender};
use rustc_hash::FxHashMap;
use std::panic::{self, AssertUnwindSafe};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

pub enum WorkerEvent {
    SubTask { sub_task: SubTask, delivery: DeliveryTag },
    MalformedDelivery(DeliveryTag),
    /// Stop broadcast carrying a request id.
    Stop(String),
    UnitFinished(UnitReport),
    Shutdown,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum UnitOutcome {
    Found(String),
    NotFound,
    Cancelled,
    /// The unit failed or panicked; the partition is treated as exhausted.
    Aborted(String),
}

impl From<MatchOutcome> for UnitOutcome {
    fn from(outcome: MatchOutcome) -> Self {
        match outcome {
            MatchOutcome::Found(word) => UnitOutcome::Found(word),
            MatchOutcome::NotFound => UnitOutcome::NotFound,
            MatchOutcome::Cancelled => UnitOutcome::Cancelled,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UnitReport {
    pub request_id: String,
    pub part_number: u32,
    pub part_count: u32,
    pub delivery: DeliveryTag,
    pub outcome: UnitOutcome,
    pub checked: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WorkerSettings {
    pub heartbeat_interval: Duration,
    pub progress_log_interval: u64,
}

impl From<&WorkerConfig> for WorkerSettings {
    fn from(config: &WorkerConfig) -> Self {
        Self {
            heartbeat_interval: config.broker.heartbeat_interval,
            progress_log_interval: config.progress_log_interval,
        }
    }
}

/// A partition is identified by its number together with the count it was
/// cut from; the same number under another count is a different range.
type PartKey = (u32, u32);

struct ActiveUnit {
    delivery: DeliveryTag,
    cancel: CancellationToken,
    progress: Arc<MatchProgress>,
    handle: JoinHandle<()>,
}

/// Searches one partition. An empty partition is exhausted immediately.
pub fn run_partition(
    sub_task: &SubTask,
    cancel: &CancellationToken,
    progress: &MatchProgress,
    progress_log_interval: u64,
) -> Result<MatchOutcome, CrackError> {
    let target = TargetHash::parse(&sub_task.hash)?;
    let range = PartitionRange::compute(sub_task.max_length, sub_task.part_count, sub_task.part_number)?;
    if range.is_empty() {
        return Ok(MatchOutcome::NotFound);
    }
    let matcher = HashMatcher::new(target).with_progress_log_interval(progress_log_interval);
    Ok(matcher.search(&range, cancel, progress))
}

fn spawn_unit(
    sub_task: SubTask,
    delivery: DeliveryTag,
    cancel: CancellationToken,
    progress: Arc<MatchProgress>,
    progress_log_interval: u64,
    events: Sender<WorkerEvent>,
) -> Result<JoinHandle<()>, CrackError> {
    let name = format!("unit-{}-{}of{}", sub_task.request_id, sub_task.part_number, sub_task.part_count);
    let handle = thread::Builder::new().name(name).spawn(move || {
        let searched = panic::catch_unwind(AssertUnwindSafe(|| {
            run_partition(&sub_task, &cancel, &progress, progress_log_interval)
        }));
        let outcome = match searched {
            Ok(Ok(outcome)) => outcome.into(),
            Ok(Err(e)) => UnitOutcome::Aborted(e.to_string()),
            Err(_) => UnitOutcome::Aborted("execution unit panicked".to_string()),
        };
        let _ = events.send(WorkerEvent::UnitFinished(UnitReport {
            request_id: sub_task.request_id,
            part_number: sub_task.part_number,
            part_count: sub_task.part_count,
            delivery,
            outcome,
            checked: progress.checked(),
        }));
    })?;
    Ok(handle)
}

/// Runs partitions on dedicated threads and settles each delivery only after
/// its unit has terminated, so a crash leaves the partition on the queue.
pub struct WorkerCoordinator<C>
where
    C: BrokerConnector,
    C::Session: ReceiverSession,
{
    channel: ChannelManager<C>,
    units: FxHashMap<String, FxHashMap<PartKey, ActiveUnit>>,
    events: Sender<WorkerEvent>,
    settings: WorkerSettings,
}

impl<C> WorkerCoordinator<C>
where
    C: BrokerConnector,
    C::Session: ReceiverSession,
{
    /// `events` is the sender half of the channel later passed to `run`;
    /// finished units report through it.
    pub fn new(connector: C, events: Sender<WorkerEvent>, settings: WorkerSettings) -> Self {
        Self {
            channel: ChannelManager::new(connector),
            units: FxHashMap::default(),
            events,
            settings,
        }
    }

    pub fn channel(&self) -> &ChannelManager<C> {
        &self.channel
    }

    pub fn active_units(&self) -> usize {
        self.units.values().map(|parts| parts.len()).sum()
    }

    pub fn is_running(&self, request_id: &str) -> bool {
        self.units.get(request_id).is_some_and(|parts| !parts.is_empty())
    }

    /// Candidates checked so far by the running units of a task.
    pub fn progress(&self, request_id: &str) -> u64 {
        self.units
            .get(request_id)
            .map(|parts| parts.values().map(|unit| unit.progress.checked()).sum())
            .unwrap_or(0)
    }

    /// Returns false when the loop should stop.
    pub fn handle(&mut self, event: WorkerEvent) -> bool {
        match event {
            WorkerEvent::SubTask { sub_task, delivery } => self.on_sub_task(sub_task, delivery),
            WorkerEvent::MalformedDelivery(delivery) => {
                warn!(?delivery, "rejecting undecodable sub-task");
                self.settle(delivery, Settlement::Reject);
            }
            WorkerEvent::Stop(request_id) => {
                self.on_stop(&request_id);
            }
            WorkerEvent::UnitFinished(report) => self.on_unit_finished(report),
            WorkerEvent::Shutdown => return false,
        }
        true
    }

    fn settle(&mut self, delivery: DeliveryTag, settlement: Settlement) {
        if let Err(e) = self.channel.settle(delivery, settlement) {
            warn!(?delivery, ?settlement, error = %e, "failed to settle sub-task delivery");
        }
    }

    pub fn on_sub_task(&mut self, sub_task: SubTask, delivery: DeliveryTag) {
        let request_id = sub_task.request_id.clone();
        let part_number = sub_task.part_number;
        let key = (part_number, sub_task.part_count);
        if self.units.get(&request_id).is_some_and(|parts| parts.contains_key(&key)) {
            warn!(%request_id, part_number, part_count = sub_task.part_count, "partition already running; requeueing duplicate");
            self.settle(delivery, Settlement::Requeue);
            return;
        }

        let cancel = CancellationToken::new();
        let progress = Arc::new(MatchProgress::new());
        info!(%request_id, part_number, part_count = sub_task.part_count, "starting partition");
        match spawn_unit(
            sub_task,
            delivery,
            cancel.clone(),
            progress.clone(),
            self.settings.progress_log_interval,
            self.events.clone(),
        ) {
            Ok(handle) => {
                self.units.entry(request_id).or_default().insert(
                    key,
                    ActiveUnit {
                        delivery,
                        cancel,
                        progress,
                        handle,
                    },
                );
            }
            Err(e) => {
                error!(%request_id, part_number, error = %e, "failed to start execution unit");
                self.settle(delivery, Settlement::Requeue);
            }
        }
    }

    /// Cancels every running unit of `request_id`. Returns how many were signalled.
    pub fn on_stop(&mut self, request_id: &str) -> usize {
        let Some(parts) = self.units.get(request_id) else {
            debug!(request_id, "stop for task with no running units");
            return 0;
        };
        for unit in parts.values() {
            unit.cancel.cancel();
        }
        info!(request_id, units = parts.len(), "stopping partitions");
        parts.len()
    }

    /// Publishes a found word, then settles the partition's delivery.
    pub fn on_unit_finished(&mut self, report: UnitReport) {
        if let Some(unit) = self.take_unit(&report.request_id, (report.part_number, report.part_count))
            && unit.handle.join().is_err()
        {
            warn!(request_id = %report.request_id, part_number = report.part_number, "execution unit thread panicked");
        }

        let settlement = match &report.outcome {
            UnitOutcome::Found(word) => {
                info!(request_id = %report.request_id, part_number = report.part_number, word = %word, "word found");
                let result = TaskResult {
                    request_id: report.request_id.clone(),
                    word: word.clone(),
                };
                match self.channel.publish_result(&result) {
                    Ok(()) => Settlement::Ack,
                    Err(e) => {
                        // Redo the partition rather than lose the word.
                        error!(request_id = %report.request_id, error = %e, "failed to publish result");
                        Settlement::Requeue
                    }
                }
            }
            UnitOutcome::NotFound => {
                info!(request_id = %report.request_id, part_number = report.part_number, checked = report.checked, "partition exhausted");
                Settlement::Ack
            }
            UnitOutcome::Cancelled => {
                info!(request_id = %report.request_id, part_number = report.part_number, checked = report.checked, "partition cancelled");
                Settlement::Ack
            }
            UnitOutcome::Aborted(reason) => {
                error!(request_id = %report.request_id, part_number = report.part_number, reason = %reason, "partition aborted");
                Settlement::Ack
            }
        };
        self.settle(report.delivery, settlement);
    }

    fn take_unit(&mut self, request_id: &str, key: PartKey) -> Option<ActiveUnit> {
        let parts = self.units.get_mut(request_id)?;
        let unit = parts.remove(&key);
        if parts.is_empty() {
            self.units.remove(request_id);
        }
        unit
    }

    /// On a fresh session the broker has already requeued every delivery of
    /// the old one, so units still working on those deliveries are cancelled.
    pub fn on_heartbeat(&mut self) -> HeartbeatStatus {
        let status = self.channel.heartbeat();
        match status {
            HeartbeatStatus::Alive => {}
            HeartbeatStatus::Init => {
                let epoch = self.channel.epoch();
                for parts in self.units.values() {
                    for unit in parts.values().filter(|unit| Some(unit.delivery.epoch) != epoch) {
                        unit.cancel.cancel();
                    }
                }
                if let Err(e) = self.channel.start_consuming() {
                    error!(error = %e, "failed to subscribe to sub-tasks; reconnecting on next heartbeat");
                }
            }
            HeartbeatStatus::Broke => warn!("broker unreachable; retrying on next heartbeat"),
        }
        status
    }

    fn shutdown(&mut self) {
        for (_, parts) in self.units.drain() {
            for (_, unit) in parts {
                unit.cancel.cancel();
                let _ = unit.handle.join();
            }
        }
    }

    pub fn run(mut self, events: Receiver<WorkerEvent>) {
        let ticker = tick(self.settings.heartbeat_interval);
        self.on_heartbeat();
        loop {
            select! {
                recv(events) -> event => match event {
                    Ok(event) => {
                        if !self.handle(event) {
                            break;
                        }
                    }
                    Err(_) => break,
                },
                recv(ticker) -> _ => {
                    self.on_heartbeat();
                }
            }
        }
        self.shutdown();
        info!("worker stopped");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::matcher::HashAlgorithm;

    fn sub_task(hash: &str, max_length: u32, part_number: u32, part_count: u32) -> SubTask {
        SubTask {
            request_id: "r-1".to_string(),
            hash: hash.to_string(),
            max_length,
            part_number,
            part_count,
        }
    }

    #[test]
    fn test_run_partition_finds_word_in_its_range() {
        let hash = HashAlgorithm::Md5.digest_hex(b"ab");
        let cancel = CancellationToken::new();
        let progress = MatchProgress::new();
        let found = run_partition(&sub_task(&hash, 2, 1, 1), &cancel, &progress, 0).unwrap();
        assert_eq!(found, MatchOutcome::Found("ab".to_string()));
        assert!(progress.checked() > 0);
    }

    #[test]
    fn test_empty_partition_is_exhausted() {
        let hash = HashAlgorithm::Md5.digest_hex(b"a");
        let cancel = CancellationToken::new();
        let outcome = run_partition(&sub_task(&hash, 1, 1, 40), &cancel, &MatchProgress::new(), 0).unwrap();
        assert_eq!(outcome, MatchOutcome::NotFound);
    }

    #[test]
    fn test_invalid_sub_task_is_an_error() {
        let cancel = CancellationToken::new();
        assert!(run_partition(&sub_task("nothex", 2, 1, 1), &cancel, &MatchProgress::new(), 0).is_err());
        let hash = HashAlgorithm::Md5.digest_hex(b"a");
        assert!(run_partition(&sub_task(&hash, 2, 3, 2), &cancel, &MatchProgress::new(), 0).is_err());
    }

    #[test]
    fn test_match_outcome_maps_to_unit_outcome() {
        assert_eq!(UnitOutcome::from(MatchOutcome::NotFound), UnitOutcome::NotFound);
        assert_eq!(
            UnitOutcome::from(MatchOutcome::Found("x".to_string())),
            UnitOutcome::Found("x".to_string())
        );
    }
}
