use crate::error::CrackError;
use crate::task::{SubTask, TaskResult};
use std::time::Duration;
use tracing::{debug, error, info, warn};

/// Broker tag scoped to the session (epoch) that issued it. Tags restart on
/// every reconnect, so the epoch keeps old confirmations and deliveries apart
/// from the current session's.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct DeliveryTag {
    pub epoch: u64,
    pub tag: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Settlement {
    Ack,
    Requeue,
    Reject,
}

/// Publisher confirmation as reported by the broker.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ConfirmEvent {
    pub epoch: u64,
    pub delivery_tag: u64,
    pub multiple: bool,
    pub ack: bool,
}

impl ConfirmEvent {
    pub fn ack(delivery: DeliveryTag) -> Self {
        Self {
            epoch: delivery.epoch,
            delivery_tag: delivery.tag,
            multiple: false,
            ack: true,
        }
    }

    pub fn nack(delivery: DeliveryTag) -> Self {
        Self {
            ack: false,
            ..Self::ack(delivery)
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HeartbeatStatus {
    /// Session healthy, bindings re-asserted.
    Alive,
    /// A fresh session was bound; post-connect actions must run once.
    Init,
    /// Reconnecting failed; the next tick retries.
    Broke,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChannelState {
    Disconnected,
    Connecting,
    Bound,
}

pub trait BrokerSession {
    fn epoch(&self) -> u64;
    /// False once a close or error listener has fired for this session.
    fn is_open(&self) -> bool;
    /// Checks the well-known task queue and returns its consumer count.
    fn probe(&mut self) -> Result<u32, CrackError>;
    /// Declares exchanges, queues and bindings. Idempotent.
    fn assert_topology(&mut self) -> Result<(), CrackError>;
    fn start_consuming(&mut self) -> Result<(), CrackError>;
    fn settle(&mut self, delivery: DeliveryTag, settlement: Settlement) -> Result<(), CrackError>;
}

/// Manager-side publishing.
pub trait EmitterSession: BrokerSession {
    /// Publishes persistently; the returned tag is later matched by a `ConfirmEvent`.
    fn emit_sub_task(&mut self, sub_task: &SubTask, expiration: Duration) -> Result<DeliveryTag, CrackError>;
    fn broadcast_stop(&mut self, request_id: &str) -> Result<(), CrackError>;
}

/// Worker-side publishing.
pub trait ReceiverSession: BrokerSession {
    fn publish_result(&mut self, result: &TaskResult) -> Result<(), CrackError>;
}

pub trait BrokerConnector {
    type Session: BrokerSession;
    fn connect(&self) -> Result<Self::Session, CrackError>;
}

/// Owns the broker session and keeps it alive through heartbeats.
pub struct ChannelManager<C: BrokerConnector> {
    connector: C,
    session: Option<C::Session>,
    state: ChannelState,
    consumer_count: u32,
}

impl<C: BrokerConnector> ChannelManager<C> {
    pub fn new(connector: C) -> Self {
        Self {
            connector,
            session: None,
            state: ChannelState::Disconnected,
            consumer_count: 0,
        }
    }

    pub fn connector(&self) -> &C {
        &self.connector
    }

    pub fn state(&self) -> ChannelState {
        self.state
    }

    pub fn epoch(&self) -> Option<u64> {
        self.session.as_ref().map(|session| session.epoch())
    }

    pub fn is_bound(&self) -> bool {
        self.session.as_ref().is_some_and(|session| session.is_open())
    }

    /// Consumer count seen by the last successful probe.
    pub fn observed_consumer_count(&self) -> u32 {
        self.consumer_count
    }

    pub fn heartbeat(&mut self) -> HeartbeatStatus {
        if let Some(session) = self.session.as_mut() {
            if session.is_open() {
                match Self::refresh(session) {
                    Ok(count) => {
                        self.consumer_count = count;
                        self.state = ChannelState::Bound;
                        return HeartbeatStatus::Alive;
                    }
                    Err(e) => warn!(error = %e, "heartbeat probe failed"),
                }
            } else {
                info!(epoch = session.epoch(), "broker session closed");
            }
        }

        self.teardown();
        self.state = ChannelState::Connecting;
        match self.connect_session() {
            Ok((session, count)) => {
                info!(epoch = session.epoch(), consumers = count, "broker session bound");
                self.session = Some(session);
                self.consumer_count = count;
                self.state = ChannelState::Bound;
                HeartbeatStatus::Init
            }
            Err(e) => {
                error!(error = %e, "failed to connect to broker");
                self.state = ChannelState::Disconnected;
                HeartbeatStatus::Broke
            }
        }
    }

    fn refresh(session: &mut C::Session) -> Result<u32, CrackError> {
        let count = session.probe()?;
        session.assert_topology()?;
        Ok(count)
    }

    fn connect_session(&self) -> Result<(C::Session, u32), CrackError> {
        let mut session = self.connector.connect()?;
        session.assert_topology()?;
        let count = session.probe()?;
        Ok((session, count))
    }

    fn teardown(&mut self) {
        if let Some(session) = self.session.take() {
            debug!(epoch = session.epoch(), "tearing down broker session");
        }
        self.state = ChannelState::Disconnected;
    }

    fn bound_session(&mut self) -> Result<&mut C::Session, CrackError> {
        match self.session.as_mut() {
            Some(session) if session.is_open() => Ok(session),
            _ => Err(CrackError::BrokerUnavailable("no open broker session".to_string())),
        }
    }

    /// Live consumer count when a session is bound, otherwise the last one observed.
    pub fn consumer_count(&mut self) -> u32 {
        match self.bound_session().and_then(|session| session.probe()) {
            Ok(count) => self.consumer_count = count,
            Err(e) => debug!(error = %e, cached = self.consumer_count, "using cached consumer count"),
        }
        self.consumer_count
    }

    /// A failed subscription drops the session, so the next heartbeat
    /// reconnects and reports `Init` again.
    pub fn start_consuming(&mut self) -> Result<(), CrackError> {
        let subscribed = self.bound_session()?.start_consuming();
        if let Err(e) = &subscribed {
            warn!(error = %e, "subscription failed; dropping broker session");
            self.teardown();
        }
        subscribed
    }

    /// Settles a delivery. Deliveries from an earlier session are skipped: the
    /// broker already requeued them when that channel closed.
    pub fn settle(&mut self, delivery: DeliveryTag, settlement: Settlement) -> Result<(), CrackError> {
        let session = self.bound_session()?;
        if session.epoch() != delivery.epoch {
            debug!(?delivery, current = session.epoch(), "skipping settlement from an earlier session");
            return Ok(());
        }
        session.settle(delivery, settlement)
    }
}

impl<C> ChannelManager<C>
where
    C: BrokerConnector,
    C::Session: EmitterSession,
{
    pub fn emit_sub_task(&mut self, sub_task: &SubTask, expiration: Duration) -> Result<DeliveryTag, CrackError> {
        self.bound_session()?.emit_sub_task(sub_task, expiration)
    }

    pub fn broadcast_stop(&mut self, request_id: &str) -> Result<(), CrackError> {
        self.bound_session()?.broadcast_stop(request_id)
    }
}

impl<C> ChannelManager<C>
where
    C: BrokerConnector,
    C::Session: ReceiverSession,
{
    pub fn publish_result(&mut self, result: &TaskResult) -> Result<(), CrackError> {
        self.bound_session()?.publish_result(result)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory_broker::InMemoryBroker;

    #[test]
    fn test_first_heartbeat_binds_and_reports_init() {
        let broker = InMemoryBroker::new(3);
        let mut manager = ChannelManager::new(broker.clone());
        assert_eq!(manager.state(), ChannelState::Disconnected);
        assert_eq!(manager.heartbeat(), HeartbeatStatus::Init);
        assert_eq!(manager.state(), ChannelState::Bound);
        assert_eq!(manager.observed_consumer_count(), 3);
        assert_eq!(manager.heartbeat(), HeartbeatStatus::Alive);
        assert_eq!(broker.connections(), 1);
    }

    #[test]
    fn test_alive_heartbeat_refreshes_consumers_and_bindings() {
        let broker = InMemoryBroker::new(1);
        let mut manager = ChannelManager::new(broker.clone());
        manager.heartbeat();
        let asserted = broker.topology_assertions();
        broker.set_consumers(5);
        assert_eq!(manager.heartbeat(), HeartbeatStatus::Alive);
        assert_eq!(manager.observed_consumer_count(), 5);
        assert_eq!(broker.topology_assertions(), asserted + 1);
    }

    #[test]
    fn test_closed_session_reconnects_once() {
        let broker = InMemoryBroker::new(2);
        let mut manager = ChannelManager::new(broker.clone());
        manager.heartbeat();
        broker.sever();
        assert!(!manager.is_bound());
        assert_eq!(manager.heartbeat(), HeartbeatStatus::Init);
        assert_eq!(manager.epoch(), Some(2));
        assert_eq!(manager.heartbeat(), HeartbeatStatus::Alive);
    }

    #[test]
    fn test_unreachable_broker_keeps_reporting_broke() {
        let broker = InMemoryBroker::new(1);
        broker.set_reachable(false);
        let mut manager = ChannelManager::new(broker.clone());
        for _ in 0..3 {
            assert_eq!(manager.heartbeat(), HeartbeatStatus::Broke);
            assert_eq!(manager.state(), ChannelState::Disconnected);
        }
        broker.set_reachable(true);
        assert_eq!(manager.heartbeat(), HeartbeatStatus::Init);
    }

    #[test]
    fn test_publishing_without_session_is_unavailable() {
        let broker = InMemoryBroker::new(1);
        let mut manager = ChannelManager::new(broker);
        let err = manager.broadcast_stop("r-1").unwrap_err();
        assert!(matches!(err, CrackError::BrokerUnavailable(_)));
    }

    #[test]
    fn test_stale_settlement_is_skipped() {
        let broker = InMemoryBroker::new(1);
        let mut manager = ChannelManager::new(broker.clone());
        manager.heartbeat();
        broker.sever();
        manager.heartbeat();
        manager
            .settle(DeliveryTag { epoch: 1, tag: 7 }, Settlement::Ack)
            .expect("stale settlement is not an error");
        assert!(broker.settlements().is_empty());
        manager.settle(DeliveryTag { epoch: 2, tag: 1 }, Settlement::Ack).unwrap();
        assert_eq!(broker.settlements().len(), 1);
    }

    #[test]
    fn test_consumer_count_falls_back_to_cache() {
        let broker = InMemoryBroker::new(4);
        let mut manager = ChannelManager::new(broker.clone());
        manager.heartbeat();
        broker.set_consumers(6);
        assert_eq!(manager.consumer_count(), 6);
        broker.sever();
        broker.set_consumers(9);
        assert_eq!(manager.consumer_count(), 6);
    }
}
