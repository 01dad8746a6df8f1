use crackhash::channel_manager::{ChannelManager, ChannelState, ConfirmEvent, HeartbeatStatus};
use crackhash::coordinator::{CoordinatorHandle, CoordinatorSettings, ManagerEvent, TaskCoordinator};
use crackhash::matcher::HashAlgorithm;
use crackhash::memory_broker::InMemoryBroker;
use crackhash::store::InMemoryTaskStore;
use crackhash::{CreateOutcome, TaskStatus};
use crossbeam_channel::{bounded, unbounded};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread;
use std::time::{Duration, Instant};

type Coordinator = TaskCoordinator<InMemoryTaskStore, InMemoryBroker>;

const CONFIRM_TIMEOUT: Duration = Duration::from_secs(30);

fn settings() -> CoordinatorSettings {
    CoordinatorSettings {
        task_timeout: Duration::from_secs(60),
        confirm_timeout: CONFIRM_TIMEOUT,
        heartbeat_interval: Duration::from_millis(20),
    }
}

fn start(broker: &InMemoryBroker) -> Coordinator {
    let mut coordinator = TaskCoordinator::new(InMemoryTaskStore::new(), broker.clone(), settings());
    coordinator.on_heartbeat(Instant::now());
    coordinator
}

fn md5(word: &str) -> String {
    HashAlgorithm::Md5.digest_hex(word.as_bytes())
}

#[test]
fn test_startup_subscribes_to_results() {
    let broker = InMemoryBroker::new(1);
    let coordinator = start(&broker);
    assert_eq!(coordinator.channel().state(), ChannelState::Bound);
    assert_eq!(broker.subscriptions(), 1);
}

#[test]
fn test_failed_subscription_forces_a_fresh_session() {
    let broker = InMemoryBroker::new(1);
    let mut manager = ChannelManager::new(broker.clone());
    broker.fail_subscriptions(true);
    assert_eq!(manager.heartbeat(), HeartbeatStatus::Init);
    assert!(manager.start_consuming().is_err());
    assert!(!manager.is_bound());

    broker.fail_subscriptions(false);
    assert_eq!(manager.heartbeat(), HeartbeatStatus::Init);
    assert!(manager.start_consuming().is_ok());
    assert_eq!(broker.subscriptions(), 1);
    assert_eq!(broker.connections(), 2);
    assert_eq!(manager.heartbeat(), HeartbeatStatus::Alive);
}

#[test]
fn test_coordinator_resubscribes_after_failed_subscription() {
    let broker = InMemoryBroker::new(1);
    broker.fail_subscriptions(true);
    let mut coordinator = start(&broker);
    assert_eq!(broker.subscriptions(), 0);
    assert_eq!(coordinator.channel().state(), ChannelState::Disconnected);

    broker.fail_subscriptions(false);
    coordinator.on_heartbeat(Instant::now());
    assert_eq!(broker.subscriptions(), 1);
    assert_eq!(coordinator.channel().state(), ChannelState::Bound);

    coordinator.on_heartbeat(Instant::now());
    assert_eq!(broker.subscriptions(), 1);
    assert_eq!(broker.connections(), 2);
}

#[test]
fn test_reconnect_abandons_pending_and_reemits() {
    let broker = InMemoryBroker::new(2);
    let mut coordinator = start(&broker);
    let (reply, response) = bounded(1);
    coordinator.create_task(&md5("cat"), 3, reply);
    let stale = broker.take_emitted();
    assert_eq!(stale.len(), 2);

    broker.sever();
    coordinator.on_heartbeat(Instant::now());
    let created = response.recv().unwrap().unwrap();
    assert_eq!(created.outcome, CreateOutcome::Create);
    assert_eq!(created.task.status, TaskStatus::Waiting);
    assert_eq!(broker.subscriptions(), 2);

    let fresh = broker.take_emitted();
    assert_eq!(fresh.len(), 2);
    assert!(fresh.iter().all(|m| m.delivery.epoch == 2));

    // Confirmations from the dead session must not count toward the new emission.
    for message in &stale {
        coordinator.on_confirm(ConfirmEvent::ack(message.delivery));
    }
    assert_eq!(coordinator.pending_emissions(), 1);

    for message in &fresh {
        coordinator.on_confirm(ConfirmEvent::ack(message.delivery));
    }
    let view = coordinator.task_status(&created.task.request_id).unwrap().unwrap();
    assert_eq!(view.status, TaskStatus::InProgress);
    assert_eq!(coordinator.pending_emissions(), 0);
}

#[test]
fn test_missing_confirmations_expire_to_waiting() {
    let broker = InMemoryBroker::new(1);
    let mut coordinator = start(&broker);
    let (reply, response) = bounded(1);
    coordinator.create_task(&md5("cat"), 3, reply);

    coordinator.on_heartbeat(Instant::now());
    assert!(response.try_recv().is_err());
    coordinator.on_heartbeat(Instant::now() + CONFIRM_TIMEOUT + Duration::from_secs(1));
    let created = response.recv().unwrap().unwrap();
    assert_eq!(created.task.status, TaskStatus::Waiting);
    assert_eq!(coordinator.pending_emissions(), 0);
}

#[test]
fn test_waiting_tasks_survive_broker_outage() {
    let broker = InMemoryBroker::new(1);
    let mut coordinator = start(&broker);
    broker.set_reachable(false);

    let (reply, response) = bounded(1);
    coordinator.create_task(&md5("cat"), 3, reply);
    let created = response.recv().unwrap().unwrap();
    assert_eq!(created.task.status, TaskStatus::Waiting);

    for _ in 0..3 {
        coordinator.on_heartbeat(Instant::now());
        assert_eq!(coordinator.channel().state(), ChannelState::Disconnected);
    }
    assert!(broker.emitted().is_empty());

    broker.set_reachable(true);
    coordinator.on_heartbeat(Instant::now());
    let emitted = broker.take_emitted();
    assert_eq!(emitted.len(), 1);
    coordinator.on_confirm(ConfirmEvent::ack(emitted[0].delivery));
    let view = coordinator.task_status(&created.task.request_id).unwrap().unwrap();
    assert_eq!(view.status, TaskStatus::InProgress);
}

#[test]
fn test_coordinator_loop_serves_handle_requests() {
    let broker = InMemoryBroker::new(2);
    let (events, inbox) = unbounded();
    let coordinator = TaskCoordinator::new(InMemoryTaskStore::new(), broker.clone(), settings());
    let runner = thread::spawn(move || coordinator.run(inbox));

    // Stands in for the broker's confirm stream.
    let acking = Arc::new(AtomicBool::new(true));
    let acker = {
        let broker = broker.clone();
        let events = events.clone();
        let acking = acking.clone();
        thread::spawn(move || {
            while acking.load(Ordering::SeqCst) {
                for message in broker.take_emitted() {
                    let _ = events.send(ManagerEvent::Confirm(ConfirmEvent::ack(message.delivery)));
                }
                thread::sleep(Duration::from_millis(2));
            }
        })
    };

    let handle = CoordinatorHandle::new(events);
    let created = handle.create_task(&md5("cat"), 3).unwrap();
    assert_eq!(created.outcome, CreateOutcome::Create);
    assert_eq!(created.task.status, TaskStatus::InProgress);

    let again = handle.create_task(&md5("cat"), 3).unwrap();
    assert_eq!(again.outcome, CreateOutcome::Exist);

    assert!(handle.report_result(&created.task.request_id, "cat").unwrap());
    let view = handle.task_status(&created.task.request_id).unwrap().unwrap();
    assert_eq!(view.status, TaskStatus::Ready);
    assert_eq!(view.data.as_deref(), Some("cat"));
    assert_eq!(broker.stops(), vec![created.task.request_id.clone()]);

    acking.store(false, Ordering::SeqCst);
    acker.join().unwrap();
    handle.shutdown();
    runner.join().unwrap();
}
