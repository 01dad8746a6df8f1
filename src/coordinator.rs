use crate::channel_manager::{
    BrokerConnector, ChannelManager, ConfirmEvent, DeliveryTag, EmitterSession, HeartbeatStatus, Settlement,
};
use crate::config::ManagerConfig;
use crate::confirm_tracker::{CompletedEmission, ConfirmTracker, CreateReply, EmissionKind, ReportReply, ResultReport};
use crate::error::CrackError;
use crate::matcher::TargetHash;
use crate::partition::{total_words, validate_max_length};
use crate::store::TaskStoreLike;
use crate::task::{CreateOutcome, CreatedTask, SubTask, Task, TaskResult, TaskStatus, TaskView};
use crate::watchdog::Watchdog;
use crossbeam_channel::{after, bounded, never, select, tick, Receiver, Sender};
use std::time::{Duration, Instant};
use tracing::{debug, error, info, warn};

pub enum ManagerEvent {
    CreateTask {
        hash: String,
        max_length: u32,
        reply: CreateReply,
    },
    TaskStatus {
        request_id: String,
        reply: Sender<Result<Option<TaskView>, CrackError>>,
    },
    /// A found word, either consumed from the result queue (with its delivery)
    /// or reported directly.
    ReportResult {
        result: TaskResult,
        delivery: Option<DeliveryTag>,
        reply: Option<ReportReply>,
    },
    MalformedDelivery(DeliveryTag),
    Confirm(ConfirmEvent),
    Shutdown,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CoordinatorSettings {
    pub task_timeout: Duration,
    pub confirm_timeout: Duration,
    pub heartbeat_interval: Duration,
}

impl From<&ManagerConfig> for CoordinatorSettings {
    fn from(config: &ManagerConfig) -> Self {
        Self {
            task_timeout: config.task_timeout,
            confirm_timeout: config.confirm_timeout,
            heartbeat_interval: config.broker.heartbeat_interval,
        }
    }
}

/// Parses and bounds-checks a create request.
pub fn validate_request(hash: &str, max_length: u32) -> Result<TargetHash, CrackError> {
    let target = TargetHash::parse(hash)?;
    validate_max_length(max_length)?;
    Ok(target)
}

/// Number of partitions for a task: one per live consumer, at least one,
/// never more than there are words.
pub fn part_count_for(consumers: u32, max_length: u32) -> Result<u32, CrackError> {
    let total = total_words(max_length)?;
    let wanted = consumers.max(1) as u128;
    Ok(wanted.min(total) as u32)
}

/// Owns the task lifecycle on the manager side. Every mutation of the store,
/// the watchdog and the confirmation tracker happens on the thread running
/// `run`, so none of them need locking.
pub struct TaskCoordinator<S, C>
where
    S: TaskStoreLike,
    C: BrokerConnector,
    C::Session: EmitterSession,
{
    store: S,
    channel: ChannelManager<C>,
    tracker: ConfirmTracker,
    watchdog: Watchdog,
    settings: CoordinatorSettings,
}

impl<S, C> TaskCoordinator<S, C>
where
    S: TaskStoreLike,
    C: BrokerConnector,
    C::Session: EmitterSession,
{
    pub fn new(store: S, connector: C, settings: CoordinatorSettings) -> Self {
        Self {
            store,
            channel: ChannelManager::new(connector),
            tracker: ConfirmTracker::new(),
            watchdog: Watchdog::new(),
            settings,
        }
    }

    pub fn store(&self) -> &S {
        &self.store
    }

    pub fn store_mut(&mut self) -> &mut S {
        &mut self.store
    }

    pub fn channel(&self) -> &ChannelManager<C> {
        &self.channel
    }

    pub fn watchdog(&self) -> &Watchdog {
        &self.watchdog
    }

    pub fn pending_emissions(&self) -> usize {
        self.tracker.len()
    }

    /// Returns false when the loop should stop.
    pub fn handle(&mut self, event: ManagerEvent) -> bool {
        match event {
            ManagerEvent::CreateTask {
                hash,
                max_length,
                reply,
            } => self.create_task(&hash, max_length, reply),
            ManagerEvent::TaskStatus { request_id, reply } => {
                let _ = reply.send(self.task_status(&request_id));
            }
            ManagerEvent::ReportResult {
                result,
                delivery,
                reply,
            } => self.on_report(ResultReport {
                result,
                delivery,
                reply,
            }),
            ManagerEvent::MalformedDelivery(delivery) => {
                warn!(?delivery, "rejecting undecodable result message");
                self.settle(delivery, Settlement::Reject);
            }
            ManagerEvent::Confirm(event) => self.on_confirm(event),
            ManagerEvent::Shutdown => return false,
        }
        true
    }

    /// Applies a result and settles its delivery. A result for a task whose
    /// partitions are still awaiting confirmation waits for that emission.
    fn on_report(&mut self, report: ResultReport) {
        let request_id = report.result.request_id.clone();
        let report = match self.tracker.hold_report(report) {
            Ok(()) => {
                debug!(%request_id, "holding result until the task's partitions are confirmed");
                return;
            }
            Err(report) => report,
        };
        let outcome = self.report_result(&report.result);
        if let Some(delivery) = report.delivery {
            // A store failure leaves the task unchanged; requeue so the word is reported again.
            let settlement = if outcome.is_ok() {
                Settlement::Ack
            } else {
                Settlement::Requeue
            };
            self.settle(delivery, settlement);
        }
        if let Some(reply) = report.reply {
            let _ = reply.send(outcome);
        }
    }

    fn settle(&mut self, delivery: DeliveryTag, settlement: Settlement) {
        if let Err(e) = self.channel.settle(delivery, settlement) {
            warn!(?delivery, ?settlement, error = %e, "failed to settle result delivery");
        }
    }

    /// Creates a task or returns the active one for the same hash. The reply
    /// is sent once every partition has been confirmed or failed.
    pub fn create_task(&mut self, hash: &str, max_length: u32, reply: CreateReply) {
        let target = match validate_request(hash, max_length) {
            Ok(target) => target,
            Err(e) => {
                debug!(hash, max_length, error = %e, "rejecting create request");
                let _ = reply.send(Err(e));
                return;
            }
        };
        let hash = target.as_hex();

        match self.store.find_active_by_hash(hash) {
            Ok(Some(existing)) => {
                info!(hash, request_id = %existing.request_id, status = %existing.status, "task already exists");
                let _ = reply.send(Ok(CreatedTask {
                    task: existing,
                    outcome: CreateOutcome::Exist,
                }));
                return;
            }
            Ok(None) => {}
            Err(e) => {
                let _ = reply.send(Err(e));
                return;
            }
        }

        let in_flight = self.tracker.find_by_hash(hash).map(|task| task.request_id.clone());
        let reply = match in_flight {
            Some(request_id) => match self.tracker.attach_waiter(&request_id, reply) {
                Ok(()) => {
                    debug!(hash, %request_id, "create request joined an in-flight emission");
                    return;
                }
                Err(reply) => reply,
            },
            None => reply,
        };

        let task = Task::new(hash, max_length, TaskStatus::InProgress);
        info!(hash, request_id = %task.request_id, max_length, "creating task");
        self.emit(task, EmissionKind::Create, Some(reply));
    }

    fn emit(&mut self, task: Task, kind: EmissionKind, reply: Option<CreateReply>) {
        let consumers = self.channel.consumer_count();
        let part_count = match part_count_for(consumers, task.max_length) {
            Ok(count) => count,
            Err(e) => {
                error!(request_id = %task.request_id, error = %e, "cannot partition task");
                if let Some(reply) = reply {
                    let _ = reply.send(Err(e));
                }
                return;
            }
        };
        let request_id = task.request_id.clone();
        let sub_tasks: Vec<SubTask> = (1..=part_count)
            .map(|part_number| task.sub_task(part_number, part_count))
            .collect();
        debug!(%request_id, part_count, consumers, ?kind, "emitting partitions");
        self.tracker.begin(task, kind, part_count, reply);

        let mut completed = None;
        for sub_task in &sub_tasks {
            match self.channel.emit_sub_task(sub_task, self.settings.task_timeout) {
                Ok(delivery) => self.tracker.record_published(&request_id, sub_task.part_number, delivery),
                Err(e) => {
                    warn!(%request_id, part_number = sub_task.part_number, error = %e, "failed to publish partition");
                    if let Some(done) = self.tracker.record_failed(&request_id, sub_task.part_number) {
                        completed = Some(done);
                    }
                }
            }
        }
        if let Some(done) = completed {
            self.finish_emission(done);
        }
    }

    fn finish_emission(&mut self, mut completed: CompletedEmission) {
        let status = completed.status();
        let early_reports = std::mem::take(&mut completed.early_reports);
        match completed.kind {
            EmissionKind::Create => self.finish_create(completed, status),
            EmissionKind::Reemit => self.finish_reemit(completed, status),
        }
        for report in early_reports {
            self.on_report(report);
        }
    }

    fn finish_create(&mut self, completed: CompletedEmission, status: TaskStatus) {
        let mut task = completed.task;
        task.status = status;
        let request_id = task.request_id.clone();

        if let Err(e) = self.store.insert(&task) {
            error!(%request_id, error = %e, "failed to persist task");
            // Partitions that did reach workers would run for a task nobody tracks.
            if let Err(e) = self.channel.broadcast_stop(&request_id) {
                warn!(%request_id, error = %e, "failed to stop orphaned partitions");
            }
            let message = format!("could not create task {}: {}", request_id, e);
            for reply in completed.reply.into_iter().chain(completed.waiters) {
                let _ = reply.send(Err(CrackError::Store(message.clone())));
            }
            return;
        }

        if status == TaskStatus::InProgress {
            self.watchdog.arm(&request_id, Instant::now() + self.settings.task_timeout);
            info!(%request_id, parts = completed.part_count, "task in progress");
        } else {
            warn!(%request_id, failed_parts = ?completed.failed_parts, "task waiting for re-emission");
        }

        if let Some(reply) = completed.reply {
            let _ = reply.send(Ok(CreatedTask {
                task: task.clone(),
                outcome: CreateOutcome::Create,
            }));
        }
        for waiter in completed.waiters {
            let _ = waiter.send(Ok(CreatedTask {
                task: task.clone(),
                outcome: CreateOutcome::Exist,
            }));
        }
    }

    fn finish_reemit(&mut self, completed: CompletedEmission, status: TaskStatus) {
        let request_id = completed.task.request_id;
        if status != TaskStatus::InProgress {
            warn!(%request_id, failed_parts = ?completed.failed_parts, "re-emission incomplete; task stays waiting");
            return;
        }
        match self
            .store
            .transition(&request_id, &[TaskStatus::Waiting], TaskStatus::InProgress, None)
        {
            Ok(true) => {
                self.watchdog.arm(&request_id, Instant::now() + self.settings.task_timeout);
                info!(%request_id, parts = completed.part_count, "re-emitted task in progress");
            }
            Ok(false) => debug!(%request_id, "task left WAITING before re-emission completed"),
            Err(e) => error!(%request_id, error = %e, "failed to mark re-emitted task in progress"),
        }
    }

    pub fn task_status(&mut self, request_id: &str) -> Result<Option<TaskView>, CrackError> {
        Ok(self.store.find_by_request_id(request_id)?.map(|task| task.view()))
    }

    /// Records a found word. Returns Ok(false) when the report is ignored:
    /// unknown task, task no longer in progress, or a word that does not hash
    /// to the target.
    pub fn report_result(&mut self, result: &TaskResult) -> Result<bool, CrackError> {
        let request_id = result.request_id.as_str();
        let Some(task) = self.store.find_by_request_id(request_id)? else {
            warn!(request_id, "result for unknown task");
            return Ok(false);
        };
        if task.status != TaskStatus::InProgress {
            info!(request_id, status = %task.status, "ignoring result for task not in progress");
            return Ok(false);
        }
        let target = match TargetHash::parse(&task.hash) {
            Ok(target) => target,
            Err(e) => {
                error!(request_id, hash = %task.hash, error = %e, "stored task has an unusable hash");
                return Ok(false);
            }
        };
        if !target.matches(result.word.as_bytes()) {
            warn!(request_id, word = %result.word, "reported word does not match the target hash");
            return Ok(false);
        }

        let deadline = self.watchdog.disarm(request_id);
        let updated = match self.store.transition(
            request_id,
            &[TaskStatus::InProgress],
            TaskStatus::Ready,
            Some(&result.word),
        ) {
            Ok(updated) => updated,
            Err(e) => {
                if let Some(deadline) = deadline {
                    self.watchdog.arm(request_id, deadline);
                }
                return Err(e);
            }
        };
        if !updated {
            debug!(request_id, "task changed status before the result was stored");
            return Ok(false);
        }

        info!(request_id, word = %result.word, "task ready");
        if let Err(e) = self.channel.broadcast_stop(request_id) {
            warn!(request_id, error = %e, "failed to broadcast stop");
        }
        Ok(true)
    }

    pub fn on_confirm(&mut self, event: ConfirmEvent) {
        for completed in self.tracker.confirm(event) {
            self.finish_emission(completed);
        }
    }

    pub fn on_heartbeat(&mut self, now: Instant) {
        match self.channel.heartbeat() {
            HeartbeatStatus::Alive => {}
            HeartbeatStatus::Init => {
                for completed in self.tracker.abandon_all() {
                    self.finish_emission(completed);
                }
                match self.channel.start_consuming() {
                    Ok(()) => self.reemit_waiting(),
                    Err(e) => error!(error = %e, "failed to subscribe to results; reconnecting on next heartbeat"),
                }
            }
            HeartbeatStatus::Broke => warn!("broker unreachable; retrying on next heartbeat"),
        }
        for completed in self.tracker.expire(now, self.settings.confirm_timeout) {
            self.finish_emission(completed);
        }
    }

    /// Re-publishes every stored `WAITING` task not already being emitted.
    pub fn reemit_waiting(&mut self) {
        let waiting = match self.store.find_waiting() {
            Ok(waiting) => waiting,
            Err(e) => {
                error!(error = %e, "failed to load waiting tasks");
                return;
            }
        };
        for task in waiting {
            if self.tracker.contains(&task.request_id) {
                continue;
            }
            info!(request_id = %task.request_id, "re-emitting waiting task");
            self.emit(task, EmissionKind::Reemit, None);
        }
    }

    /// Moves timed-out tasks to `ERROR` and stops their partitions.
    pub fn fire_expired(&mut self, now: Instant) -> usize {
        let mut fired = 0;
        for request_id in self.watchdog.expired(now) {
            match self
                .store
                .transition(&request_id, &[TaskStatus::InProgress], TaskStatus::Error, None)
            {
                Ok(true) => {
                    fired += 1;
                    warn!(%request_id, "task timed out");
                    if let Err(e) = self.channel.broadcast_stop(&request_id) {
                        warn!(%request_id, error = %e, "failed to broadcast stop");
                    }
                }
                Ok(false) => debug!(%request_id, "timeout fired for task no longer in progress"),
                Err(e) => {
                    error!(%request_id, error = %e, "failed to time out task; retrying");
                    self.watchdog.arm(&request_id, now + self.settings.heartbeat_interval);
                }
            }
        }
        fired
    }

    pub fn run(mut self, events: Receiver<ManagerEvent>) {
        let ticker = tick(self.settings.heartbeat_interval);
        self.on_heartbeat(Instant::now());
        loop {
            let deadline = match self.watchdog.next_deadline() {
                Some(deadline) => after(deadline.saturating_duration_since(Instant::now())),
                None => never(),
            };
            select! {
                recv(events) -> event => match event {
                    Ok(event) => {
                        if !self.handle(event) {
                            break;
                        }
                    }
                    Err(_) => break,
                },
                recv(ticker) -> _ => self.on_heartbeat(Instant::now()),
                recv(deadline) -> _ => {
                    self.fire_expired(Instant::now());
                }
            }
        }
        info!("task coordinator stopped");
    }
}

/// Blocking front door to a running `TaskCoordinator`.
#[derive(Clone)]
pub struct CoordinatorHandle {
    events: Sender<ManagerEvent>,
}

impl CoordinatorHandle {
    pub fn new(events: Sender<ManagerEvent>) -> Self {
        Self { events }
    }

    fn send(&self, event: ManagerEvent) -> Result<(), CrackError> {
        self.events
            .send(event)
            .map_err(|_| CrackError::Other("task coordinator is not running".to_string()))
    }

    fn wait<T>(reply: Receiver<Result<T, CrackError>>) -> Result<T, CrackError> {
        reply
            .recv()
            .map_err(|_| CrackError::Other("task coordinator dropped the request".to_string()))?
    }

    pub fn create_task(&self, hash: &str, max_length: u32) -> Result<CreatedTask, CrackError> {
        let (reply, response) = bounded(1);
        self.send(ManagerEvent::CreateTask {
            hash: hash.to_string(),
            max_length,
            reply,
        })?;
        Self::wait(response)
    }

    pub fn task_status(&self, request_id: &str) -> Result<Option<TaskView>, CrackError> {
        let (reply, response) = bounded(1);
        self.send(ManagerEvent::TaskStatus {
            request_id: request_id.to_string(),
            reply,
        })?;
        Self::wait(response)
    }

    pub fn report_result(&self, request_id: &str, word: &str) -> Result<bool, CrackError> {
        let (reply, response) = bounded(1);
        self.send(ManagerEvent::ReportResult {
            result: TaskResult {
                request_id: request_id.to_string(),
                word: word.to_string(),
            },
            delivery: None,
            reply: Some(reply),
        })?;
        Self::wait(response)
    }

    pub fn shutdown(&self) {
        let _ = self.events.send(ManagerEvent::Shutdown);
    }
}
