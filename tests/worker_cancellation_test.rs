use crackhash::channel_manager::{DeliveryTag, HeartbeatStatus, Settlement};
use crackhash::matcher::HashAlgorithm;
use crackhash::memory_broker::InMemoryBroker;
use crackhash::worker::{UnitOutcome, UnitReport, WorkerCoordinator, WorkerEvent, WorkerSettings};
use crackhash::{SubTask, TaskResult};
use crossbeam_channel::{unbounded, Receiver, Sender};
use std::thread;
use std::time::{Duration, Instant};

const REPORT_TIMEOUT: Duration = Duration::from_secs(30);

fn settings() -> WorkerSettings {
    WorkerSettings {
        heartbeat_interval: Duration::from_millis(20),
        progress_log_interval: 0,
    }
}

fn start(broker: &InMemoryBroker) -> (WorkerCoordinator<InMemoryBroker>, Sender<WorkerEvent>, Receiver<WorkerEvent>) {
    let (events, inbox) = unbounded();
    let mut worker = WorkerCoordinator::new(broker.clone(), events.clone(), settings());
    assert_eq!(worker.on_heartbeat(), HeartbeatStatus::Init);
    (worker, events, inbox)
}

fn sub_task(request_id: &str, word: &str, max_length: u32) -> SubTask {
    SubTask {
        request_id: request_id.to_string(),
        hash: HashAlgorithm::Md5.digest_hex(word.as_bytes()),
        max_length,
        part_number: 1,
        part_count: 1,
    }
}

fn next_report(inbox: &Receiver<WorkerEvent>) -> UnitReport {
    loop {
        match inbox.recv_timeout(REPORT_TIMEOUT).expect("execution unit should report") {
            WorkerEvent::UnitFinished(report) => return report,
            _ => continue,
        }
    }
}

fn tag(epoch: u64, tag: u64) -> DeliveryTag {
    DeliveryTag { epoch, tag }
}

#[test]
fn test_found_word_is_published_then_acked() {
    let broker = InMemoryBroker::new(1);
    let (mut worker, _events, inbox) = start(&broker);
    worker.on_sub_task(sub_task("r-1", "ab", 2), tag(1, 1));
    assert!(worker.is_running("r-1"));

    let report = next_report(&inbox);
    assert_eq!(report.outcome, UnitOutcome::Found("ab".to_string()));
    worker.on_unit_finished(report);

    assert_eq!(
        broker.results(),
        vec![TaskResult {
            request_id: "r-1".to_string(),
            word: "ab".to_string()
        }]
    );
    assert_eq!(broker.settlements(), vec![(tag(1, 1), Settlement::Ack)]);
    assert_eq!(worker.active_units(), 0);
}

#[test]
fn test_failed_result_publish_requeues_partition() {
    let broker = InMemoryBroker::new(1);
    let (mut worker, _events, inbox) = start(&broker);
    broker.fail_results(true);
    worker.on_sub_task(sub_task("r-1", "ab", 2), tag(1, 1));

    let report = next_report(&inbox);
    assert_eq!(report.outcome, UnitOutcome::Found("ab".to_string()));
    worker.on_unit_finished(report);

    assert!(broker.results().is_empty());
    assert_eq!(broker.settlements(), vec![(tag(1, 1), Settlement::Requeue)]);
}

#[test]
fn test_exhausted_partition_is_acked_without_result() {
    let broker = InMemoryBroker::new(1);
    let (mut worker, _events, inbox) = start(&broker);
    worker.on_sub_task(sub_task("r-1", "abcd", 2), tag(1, 1));

    let report = next_report(&inbox);
    assert_eq!(report.outcome, UnitOutcome::NotFound);
    assert_eq!(report.checked, 36 + 36 * 36);
    worker.on_unit_finished(report);
    assert!(broker.results().is_empty());
    assert_eq!(broker.settlements(), vec![(tag(1, 1), Settlement::Ack)]);
}

#[test]
fn test_stop_cancels_matching_units_only() {
    let broker = InMemoryBroker::new(1);
    let (mut worker, _events, inbox) = start(&broker);
    worker.on_sub_task(sub_task("r-1", "unfindable", 6), tag(1, 1));

    assert_eq!(worker.on_stop("r-other"), 0);
    assert!(worker.is_running("r-1"));
    assert_eq!(worker.on_stop("r-1"), 1);

    let report = next_report(&inbox);
    assert_eq!(report.outcome, UnitOutcome::Cancelled);
    worker.on_unit_finished(report);
    assert!(!worker.is_running("r-1"));
    assert!(broker.results().is_empty());
    assert_eq!(broker.settlements(), vec![(tag(1, 1), Settlement::Ack)]);
}

#[test]
fn test_invalid_sub_task_aborts_and_acks() {
    let broker = InMemoryBroker::new(1);
    let (mut worker, _events, inbox) = start(&broker);
    let mut bad = sub_task("r-1", "a", 2);
    bad.part_number = 5;
    worker.on_sub_task(bad, tag(1, 1));

    let report = next_report(&inbox);
    assert!(matches!(report.outcome, UnitOutcome::Aborted(_)));
    worker.on_unit_finished(report);
    assert_eq!(broker.settlements(), vec![(tag(1, 1), Settlement::Ack)]);
}

#[test]
fn test_duplicate_partition_is_requeued() {
    let broker = InMemoryBroker::new(1);
    let (mut worker, _events, inbox) = start(&broker);
    worker.on_sub_task(sub_task("r-1", "unfindable", 6), tag(1, 1));
    worker.on_sub_task(sub_task("r-1", "unfindable", 6), tag(1, 2));
    assert_eq!(worker.active_units(), 1);
    assert_eq!(broker.settlements(), vec![(tag(1, 2), Settlement::Requeue)]);

    worker.on_stop("r-1");
    let report = next_report(&inbox);
    worker.on_unit_finished(report);
}

#[test]
fn test_same_part_number_under_new_part_count_runs_alongside() {
    let broker = InMemoryBroker::new(1);
    let (mut worker, _events, inbox) = start(&broker);
    worker.on_sub_task(sub_task("r-1", "unfindable", 6), tag(1, 1));
    let mut resplit = sub_task("r-1", "unfindable", 6);
    resplit.part_count = 2;
    worker.on_sub_task(resplit, tag(1, 2));
    assert_eq!(worker.active_units(), 2);
    assert!(broker.settlements().is_empty());

    assert_eq!(worker.on_stop("r-1"), 2);
    for _ in 0..2 {
        let report = next_report(&inbox);
        assert_eq!(report.outcome, UnitOutcome::Cancelled);
        worker.on_unit_finished(report);
    }
    assert_eq!(worker.active_units(), 0);
    assert_eq!(broker.settlements().len(), 2);
}

#[test]
fn test_failed_subscription_reconnects_on_next_heartbeat() {
    let broker = InMemoryBroker::new(1);
    broker.fail_subscriptions(true);
    let (events, _inbox) = unbounded();
    let mut worker = WorkerCoordinator::new(broker.clone(), events, settings());
    assert_eq!(worker.on_heartbeat(), HeartbeatStatus::Init);
    assert_eq!(broker.subscriptions(), 0);

    broker.fail_subscriptions(false);
    assert_eq!(worker.on_heartbeat(), HeartbeatStatus::Init);
    assert_eq!(broker.subscriptions(), 1);
    assert_eq!(worker.on_heartbeat(), HeartbeatStatus::Alive);
}

#[test]
fn test_reconnect_cancels_units_from_old_session() {
    let broker = InMemoryBroker::new(1);
    let (mut worker, _events, inbox) = start(&broker);
    worker.on_sub_task(sub_task("r-1", "unfindable", 6), tag(1, 1));

    broker.sever();
    assert_eq!(worker.on_heartbeat(), HeartbeatStatus::Init);
    assert_eq!(broker.subscriptions(), 2);

    let report = next_report(&inbox);
    assert_eq!(report.outcome, UnitOutcome::Cancelled);
    worker.on_unit_finished(report);
    // The old channel's delivery was requeued by the broker; nothing to settle.
    assert!(broker.settlements().is_empty());
}

#[test]
fn test_run_loop_processes_events_until_shutdown() {
    let broker = InMemoryBroker::new(1);
    let (events, inbox) = unbounded();
    let worker = WorkerCoordinator::new(broker.clone(), events.clone(), settings());
    let runner = thread::spawn(move || worker.run(inbox));

    let deadline = Instant::now() + REPORT_TIMEOUT;
    while broker.subscriptions() == 0 && Instant::now() < deadline {
        thread::sleep(Duration::from_millis(5));
    }
    events
        .send(WorkerEvent::SubTask {
            sub_task: sub_task("r-1", "z9", 2),
            delivery: tag(1, 1),
        })
        .unwrap();
    while broker.settlements().is_empty() && Instant::now() < deadline {
        thread::sleep(Duration::from_millis(5));
    }
    events.send(WorkerEvent::Shutdown).unwrap();
    runner.join().unwrap();

    assert_eq!(broker.results().len(), 1);
    assert_eq!(broker.results()[0].word, "z9");
    assert_eq!(broker.settlements(), vec![(tag(1, 1), Settlement::Ack)]);
}
