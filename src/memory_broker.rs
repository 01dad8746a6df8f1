use crate::channel_manager::{
    BrokerConnector, BrokerSession, DeliveryTag, EmitterSession, ReceiverSession, Settlement,
};
use crate::error::CrackError;
use crate::task::{SubTask, TaskResult};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EmittedSubTask {
    pub delivery: DeliveryTag,
    pub sub_task: SubTask,
    pub expiration: Duration,
}

struct BrokerState {
    reachable: bool,
    consumers: u32,
    epoch: u64,
    open_epoch: Option<u64>,
    next_tag: u64,
    failing_parts: Vec<u32>,
    failing_results: bool,
    failing_subscriptions: bool,
    topology_assertions: u64,
    subscriptions: u64,
    emitted: Vec<EmittedSubTask>,
    stops: Vec<String>,
    results: Vec<TaskResult>,
    settlements: Vec<(DeliveryTag, Settlement)>,
}

/// Broker double shared between a connector and every session it opens.
/// Clones observe the same state, so tests keep one handle to steer and
/// inspect what the coordinators did.
#[derive(Clone)]
pub struct InMemoryBroker {
    state: Arc<Mutex<BrokerState>>,
}

impl InMemoryBroker {
    pub fn new(consumers: u32) -> Self {
        Self {
            state: Arc::new(Mutex::new(BrokerState {
                reachable: true,
                consumers,
                epoch: 0,
                open_epoch: None,
                next_tag: 0,
                failing_parts: Vec::new(),
                failing_results: false,
                failing_subscriptions: false,
                topology_assertions: 0,
                subscriptions: 0,
                emitted: Vec::new(),
                stops: Vec::new(),
                results: Vec::new(),
                settlements: Vec::new(),
            })),
        }
    }

    fn lock(&self) -> MutexGuard<'_, BrokerState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// An unreachable broker refuses new connections and closes the open session.
    pub fn set_reachable(&self, reachable: bool) {
        let mut state = self.lock();
        state.reachable = reachable;
        if !reachable {
            state.open_epoch = None;
        }
    }

    pub fn set_consumers(&self, consumers: u32) {
        self.lock().consumers = consumers;
    }

    /// Closes the current session as if the connection dropped.
    pub fn sever(&self) {
        self.lock().open_epoch = None;
    }

    /// Publishes of these part numbers fail synchronously.
    pub fn fail_parts(&self, parts: &[u32]) {
        self.lock().failing_parts = parts.to_vec();
    }

    pub fn fail_results(&self, failing: bool) {
        self.lock().failing_results = failing;
    }

    /// Consumer registration fails while the session itself stays open.
    pub fn fail_subscriptions(&self, failing: bool) {
        self.lock().failing_subscriptions = failing;
    }

    pub fn connections(&self) -> u64 {
        self.lock().epoch
    }

    pub fn topology_assertions(&self) -> u64 {
        self.lock().topology_assertions
    }

    pub fn subscriptions(&self) -> u64 {
        self.lock().subscriptions
    }

    pub fn emitted(&self) -> Vec<EmittedSubTask> {
        self.lock().emitted.clone()
    }

    pub fn take_emitted(&self) -> Vec<EmittedSubTask> {
        std::mem::take(&mut self.lock().emitted)
    }

    pub fn stops(&self) -> Vec<String> {
        self.lock().stops.clone()
    }

    pub fn results(&self) -> Vec<TaskResult> {
        self.lock().results.clone()
    }

    pub fn settlements(&self) -> Vec<(DeliveryTag, Settlement)> {
        self.lock().settlements.clone()
    }
}

impl BrokerConnector for InMemoryBroker {
    type Session = InMemorySession;

    fn connect(&self) -> Result<InMemorySession, CrackError> {
        let mut state = self.lock();
        if !state.reachable {
            return Err(CrackError::BrokerUnavailable("connection refused".to_string()));
        }
        state.epoch += 1;
        state.open_epoch = Some(state.epoch);
        state.next_tag = 0;
        Ok(InMemorySession {
            broker: self.clone(),
            epoch: state.epoch,
        })
    }
}

pub struct InMemorySession {
    broker: InMemoryBroker,
    epoch: u64,
}

impl InMemorySession {
    fn open_state(&self) -> Result<MutexGuard<'_, BrokerState>, CrackError> {
        let state = self.broker.lock();
        if state.open_epoch != Some(self.epoch) {
            return Err(CrackError::Broker("channel closed".to_string()));
        }
        Ok(state)
    }
}

impl BrokerSession for InMemorySession {
    fn epoch(&self) -> u64 {
        self.epoch
    }

    fn is_open(&self) -> bool {
        self.broker.lock().open_epoch == Some(self.epoch)
    }

    fn probe(&mut self) -> Result<u32, CrackError> {
        Ok(self.open_state()?.consumers)
    }

    fn assert_topology(&mut self) -> Result<(), CrackError> {
        self.open_state()?.topology_assertions += 1;
        Ok(())
    }

    fn start_consuming(&mut self) -> Result<(), CrackError> {
        let mut state = self.open_state()?;
        if state.failing_subscriptions {
            return Err(CrackError::Broker("basic.consume refused".to_string()));
        }
        state.subscriptions += 1;
        Ok(())
    }

    fn settle(&mut self, delivery: DeliveryTag, settlement: Settlement) -> Result<(), CrackError> {
        self.open_state()?.settlements.push((delivery, settlement));
        Ok(())
    }
}

impl EmitterSession for InMemorySession {
    fn emit_sub_task(&mut self, sub_task: &SubTask, expiration: Duration) -> Result<DeliveryTag, CrackError> {
        let mut state = self.open_state()?;
        if state.failing_parts.contains(&sub_task.part_number) {
            return Err(CrackError::Broker(format!(
                "publish of part {} rejected",
                sub_task.part_number
            )));
        }
        state.next_tag += 1;
        let delivery = DeliveryTag {
            epoch: self.epoch,
            tag: state.next_tag,
        };
        state.emitted.push(EmittedSubTask {
            delivery,
            sub_task: sub_task.clone(),
            expiration,
        });
        Ok(delivery)
    }

    fn broadcast_stop(&mut self, request_id: &str) -> Result<(), CrackError> {
        self.open_state()?.stops.push(request_id.to_string());
        Ok(())
    }
}

impl ReceiverSession for InMemorySession {
    fn publish_result(&mut self, result: &TaskResult) -> Result<(), CrackError> {
        let mut state = self.open_state()?;
        if state.failing_results {
            return Err(CrackError::Broker("result publish rejected".to_string()));
        }
        state.results.push(result.clone());
        Ok(())
    }
}
