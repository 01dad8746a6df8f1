use crate::channel_manager::{
    BrokerConnector, BrokerSession, ConfirmEvent, DeliveryTag, EmitterSession, ReceiverSession, Settlement,
};
use crate::config::BrokerConfig;
use crate::coordinator::ManagerEvent;
use crate::error::CrackError;
use crate::task::{SubTask, TaskResult};
use crate::worker::WorkerEvent;
use amiquip::{
    AmqpProperties, Channel, Confirm, Connection, Consumer, ConsumerMessage, ConsumerOptions,
    ExchangeDeclareOptions, ExchangeType, FieldTable, Publish, QueueDeclareOptions,
};
use crossbeam_channel::{bounded, unbounded, Receiver, Sender};
use rustc_hash::FxHashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::thread;
use std::time::Duration;
use tracing::{debug, error, info, warn};

const PERSISTENT: u8 = 2;
const CONSUMER_POLL: Duration = Duration::from_millis(50);
const CONSUMER_SETUP_TIMEOUT: Duration = Duration::from_secs(10);

struct AckRequest {
    delivery: DeliveryTag,
    settlement: Settlement,
}

enum QueueSource {
    /// A durable queue declared with the shared topology.
    Named(String),
    /// An exclusive, server-named queue bound to a fanout exchange.
    Broadcast { exchange: String, routing_key: String },
}

struct ConsumerSetup {
    source: QueueSource,
    no_ack: bool,
    prefetch: Option<u16>,
}

fn durable_exchange() -> ExchangeDeclareOptions {
    ExchangeDeclareOptions {
        durable: true,
        ..ExchangeDeclareOptions::default()
    }
}

fn durable_queue() -> QueueDeclareOptions {
    QueueDeclareOptions {
        durable: true,
        ..QueueDeclareOptions::default()
    }
}

fn persistent() -> AmqpProperties {
    AmqpProperties::default().with_delivery_mode(PERSISTENT)
}

/// One connection plus the publishing channel. Consumers get channels of
/// their own on dedicated threads.
struct AmqpLink {
    config: BrokerConfig,
    epoch: u64,
    connection: Option<Connection>,
    channel: Option<Channel>,
    open: Arc<AtomicBool>,
    acks: Option<Sender<AckRequest>>,
    published: u64,
}

impl AmqpLink {
    fn open(config: &BrokerConfig, epoch: u64) -> Result<Self, CrackError> {
        let mut connection = if config.url.starts_with("amqps://") {
            Connection::open(&config.url)?
        } else {
            Connection::insecure_open(&config.url)?
        };
        let channel = connection.open_channel(None)?;
        debug!(epoch, "amqp connection opened");
        Ok(Self {
            config: config.clone(),
            epoch,
            connection: Some(connection),
            channel: Some(channel),
            open: Arc::new(AtomicBool::new(true)),
            acks: None,
            published: 0,
        })
    }

    fn is_open(&self) -> bool {
        self.open.load(Ordering::SeqCst) && self.channel.is_some()
    }

    fn channel(&self) -> Result<&Channel, CrackError> {
        match self.channel.as_ref() {
            Some(channel) if self.open.load(Ordering::SeqCst) => Ok(channel),
            _ => Err(CrackError::BrokerUnavailable("amqp channel closed".to_string())),
        }
    }

    /// Any protocol error closes the channel on the broker side.
    fn guard<T>(&self, result: Result<T, amiquip::Error>) -> Result<T, CrackError> {
        result.map_err(|e| {
            self.open.store(false, Ordering::SeqCst);
            CrackError::from(e)
        })
    }

    fn probe(&self) -> Result<u32, CrackError> {
        let channel = self.channel()?;
        let queue = self.guard(channel.queue_declare_passive(self.config.task_queue.as_str()))?;
        Ok(queue.declared_consumer_count().unwrap_or(0))
    }

    fn assert_topology(&self) -> Result<(), CrackError> {
        let channel = self.channel()?;
        let config = &self.config;
        let direct = self.guard(channel.exchange_declare(
            ExchangeType::Direct,
            config.direct_exchange.as_str(),
            durable_exchange(),
        ))?;
        self.guard(channel.exchange_declare(
            ExchangeType::Fanout,
            config.fanout_exchange.as_str(),
            durable_exchange(),
        ))?;
        let tasks = self.guard(channel.queue_declare(config.task_queue.as_str(), durable_queue()))?;
        let results = self.guard(channel.queue_declare(config.result_queue.as_str(), durable_queue()))?;
        self.guard(tasks.bind(&direct, config.task_routing_key.as_str(), FieldTable::default()))?;
        self.guard(results.bind(&direct, config.result_routing_key.as_str(), FieldTable::default()))?;
        Ok(())
    }

    /// Returns the publisher sequence number the broker will confirm.
    fn publish(
        &mut self,
        exchange: &str,
        routing_key: &str,
        body: &[u8],
        properties: AmqpProperties,
    ) -> Result<DeliveryTag, CrackError> {
        let channel = self.channel()?;
        self.guard(channel.basic_publish(exchange, Publish::with_properties(body, routing_key, properties)))?;
        self.published += 1;
        Ok(DeliveryTag {
            epoch: self.epoch,
            tag: self.published,
        })
    }

    fn forward_confirms(&self, events: Sender<ManagerEvent>) -> Result<(), CrackError> {
        let confirms = self.guard(self.channel()?.listen_for_publisher_confirms())?;
        self.guard(self.channel()?.enable_publisher_confirms())?;
        let epoch = self.epoch;
        let open = self.open.clone();
        thread::Builder::new()
            .name(format!("amqp-confirms-{}", epoch))
            .spawn(move || {
                for confirm in confirms.iter() {
                    let event = match confirm {
                        Confirm::Ack(payload) => ConfirmEvent {
                            epoch,
                            delivery_tag: payload.delivery_tag,
                            multiple: payload.multiple,
                            ack: true,
                        },
                        Confirm::Nack(payload) => ConfirmEvent {
                            epoch,
                            delivery_tag: payload.delivery_tag,
                            multiple: payload.multiple,
                            ack: false,
                        },
                    };
                    if events.send(ManagerEvent::Confirm(event)).is_err() {
                        break;
                    }
                }
                open.store(false, Ordering::SeqCst);
                debug!(epoch, "confirm stream ended");
            })?;
        Ok(())
    }

    /// Starts a consumer thread and waits until its subscription is in place.
    fn spawn_consumer<E, F>(&mut self, setup: ConsumerSetup, events: Sender<E>, decode: F) -> Result<(), CrackError>
    where
        E: Send + 'static,
        F: Fn(DeliveryTag, &[u8]) -> E + Send + 'static,
    {
        let open = self.open.clone();
        let epoch = self.epoch;
        let connection = self
            .connection
            .as_mut()
            .ok_or_else(|| CrackError::BrokerUnavailable("amqp connection closed".to_string()))?;
        let channel = connection.open_channel(None).map_err(|e| {
            open.store(false, Ordering::SeqCst);
            CrackError::from(e)
        })?;

        let (ready_tx, ready_rx) = bounded(1);
        let (ack_tx, ack_rx) = unbounded();
        let no_ack = setup.no_ack;
        thread::Builder::new()
            .name(format!("amqp-consumer-{}", epoch))
            .spawn(move || consume(channel, setup, epoch, open, events, ack_rx, ready_tx, decode))?;

        let subscribed = match ready_rx.recv_timeout(CONSUMER_SETUP_TIMEOUT) {
            Ok(result) => result,
            Err(_) => Err(CrackError::Broker("consumer setup timed out".to_string())),
        };
        if let Err(e) = subscribed {
            self.open.store(false, Ordering::SeqCst);
            return Err(e);
        }
        if !no_ack {
            self.acks = Some(ack_tx);
        }
        Ok(())
    }

    fn settle(&self, delivery: DeliveryTag, settlement: Settlement) -> Result<(), CrackError> {
        let acks = self
            .acks
            .as_ref()
            .ok_or_else(|| CrackError::Broker("no acknowledging consumer on this session".to_string()))?;
        acks.send(AckRequest { delivery, settlement })
            .map_err(|_| CrackError::BrokerUnavailable("consumer thread stopped".to_string()))
    }
}

impl Drop for AmqpLink {
    fn drop(&mut self) {
        self.open.store(false, Ordering::SeqCst);
        self.acks = None;
        if let Some(channel) = self.channel.take() {
            let _ = channel.close();
        }
        if let Some(connection) = self.connection.take()
            && let Err(e) = connection.close()
        {
            debug!(epoch = self.epoch, error = %e, "closing amqp connection failed");
        }
    }
}

fn open_consumer<'a>(channel: &'a Channel, setup: &ConsumerSetup) -> Result<Consumer<'a>, CrackError> {
    if let Some(prefetch) = setup.prefetch {
        channel.qos(0, prefetch, false)?;
    }
    let queue_name = match &setup.source {
        QueueSource::Named(name) => channel.queue_declare(name.as_str(), durable_queue())?.name().to_string(),
        QueueSource::Broadcast { exchange, routing_key } => {
            let queue = channel.queue_declare(
                "",
                QueueDeclareOptions {
                    exclusive: true,
                    auto_delete: true,
                    ..QueueDeclareOptions::default()
                },
            )?;
            let fanout = channel.exchange_declare(ExchangeType::Fanout, exchange.as_str(), durable_exchange())?;
            queue.bind(&fanout, routing_key.as_str(), FieldTable::default())?;
            queue.name().to_string()
        }
    };
    let options = ConsumerOptions {
        no_ack: setup.no_ack,
        ..ConsumerOptions::default()
    };
    Ok(channel.basic_consume(queue_name, options)?)
}

#[allow(clippy::too_many_arguments)]
fn consume<E, F>(
    channel: Channel,
    setup: ConsumerSetup,
    epoch: u64,
    open: Arc<AtomicBool>,
    events: Sender<E>,
    acks: Receiver<AckRequest>,
    ready: Sender<Result<(), CrackError>>,
    decode: F,
) where
    F: Fn(DeliveryTag, &[u8]) -> E,
{
    let consumer = match open_consumer(&channel, &setup) {
        Ok(consumer) => {
            let _ = ready.send(Ok(()));
            consumer
        }
        Err(e) => {
            open.store(false, Ordering::SeqCst);
            let _ = ready.send(Err(e));
            return;
        }
    };

    let mut unsettled = FxHashMap::default();
    'consume: loop {
        while let Ok(request) = acks.try_recv() {
            let Some(delivery) = unsettled.remove(&request.delivery.tag) else {
                debug!(delivery = ?request.delivery, "settlement for unknown delivery");
                continue;
            };
            let settled = match request.settlement {
                Settlement::Ack => consumer.ack(delivery),
                Settlement::Requeue => consumer.nack(delivery, true),
                Settlement::Reject => consumer.reject(delivery, false),
            };
            if let Err(e) = settled {
                warn!(epoch, error = %e, "failed to settle delivery");
                break 'consume;
            }
        }

        match consumer.receiver().recv_timeout(CONSUMER_POLL) {
            Ok(ConsumerMessage::Delivery(delivery)) => {
                let tag = DeliveryTag {
                    epoch,
                    tag: delivery.delivery_tag(),
                };
                let event = decode(tag, &delivery.body);
                if !setup.no_ack {
                    unsettled.insert(tag.tag, delivery);
                }
                if events.send(event).is_err() {
                    break;
                }
            }
            Ok(other) => {
                info!(epoch, message = ?other, "consumer ended");
                break;
            }
            Err(e) if e.is_timeout() => {}
            Err(_) => break,
        }
    }
    open.store(false, Ordering::SeqCst);
    drop(consumer);
    let _ = channel.close();
}

/// Connects the manager: publishes sub-tasks and stops, consumes results.
pub struct AmqpEmitterConnector {
    config: BrokerConfig,
    events: Sender<ManagerEvent>,
    epochs: AtomicU64,
}

impl AmqpEmitterConnector {
    pub fn new(config: BrokerConfig, events: Sender<ManagerEvent>) -> Self {
        Self {
            config,
            events,
            epochs: AtomicU64::new(0),
        }
    }
}

impl BrokerConnector for AmqpEmitterConnector {
    type Session = AmqpEmitterSession;

    fn connect(&self) -> Result<AmqpEmitterSession, CrackError> {
        let epoch = self.epochs.fetch_add(1, Ordering::SeqCst) + 1;
        let link = AmqpLink::open(&self.config, epoch)?;
        link.forward_confirms(self.events.clone())?;
        Ok(AmqpEmitterSession {
            link,
            events: self.events.clone(),
        })
    }
}

pub struct AmqpEmitterSession {
    link: AmqpLink,
    events: Sender<ManagerEvent>,
}

impl BrokerSession for AmqpEmitterSession {
    fn epoch(&self) -> u64 {
        self.link.epoch
    }

    fn is_open(&self) -> bool {
        self.link.is_open()
    }

    fn probe(&mut self) -> Result<u32, CrackError> {
        self.link.probe()
    }

    fn assert_topology(&mut self) -> Result<(), CrackError> {
        self.link.assert_topology()
    }

    fn start_consuming(&mut self) -> Result<(), CrackError> {
        let setup = ConsumerSetup {
            source: QueueSource::Named(self.link.config.result_queue.clone()),
            no_ack: false,
            prefetch: None,
        };
        self.link.spawn_consumer(setup, self.events.clone(), |delivery, body| {
            match TaskResult::decode(body) {
                Ok(result) => ManagerEvent::ReportResult {
                    result,
                    delivery: Some(delivery),
                    reply: None,
                },
                Err(e) => {
                    warn!(?delivery, error = %e, "undecodable result message");
                    ManagerEvent::MalformedDelivery(delivery)
                }
            }
        })
    }

    fn settle(&mut self, delivery: DeliveryTag, settlement: Settlement) -> Result<(), CrackError> {
        self.link.settle(delivery, settlement)
    }
}

impl EmitterSession for AmqpEmitterSession {
    fn emit_sub_task(&mut self, sub_task: &SubTask, expiration: Duration) -> Result<DeliveryTag, CrackError> {
        let body = sub_task.encode()?;
        let properties = persistent().with_expiration(expiration.as_millis().to_string().into());
        let exchange = self.link.config.direct_exchange.clone();
        let routing_key = self.link.config.task_routing_key.clone();
        self.link.publish(&exchange, &routing_key, &body, properties)
    }

    fn broadcast_stop(&mut self, request_id: &str) -> Result<(), CrackError> {
        let exchange = self.link.config.fanout_exchange.clone();
        let routing_key = self.link.config.stop_routing_key.clone();
        // Stops consume a confirm sequence number too; the tracker ignores it.
        self.link
            .publish(&exchange, &routing_key, request_id.as_bytes(), AmqpProperties::default())
            .map(|_| ())
    }
}

/// Connects a worker: consumes sub-tasks and stops, publishes results.
pub struct AmqpReceiverConnector {
    config: BrokerConfig,
    prefetch: u16,
    events: Sender<WorkerEvent>,
    epochs: AtomicU64,
}

impl AmqpReceiverConnector {
    pub fn new(config: BrokerConfig, prefetch: u16, events: Sender<WorkerEvent>) -> Self {
        Self {
            config,
            prefetch,
            events,
            epochs: AtomicU64::new(0),
        }
    }
}

impl BrokerConnector for AmqpReceiverConnector {
    type Session = AmqpReceiverSession;

    fn connect(&self) -> Result<AmqpReceiverSession, CrackError> {
        let epoch = self.epochs.fetch_add(1, Ordering::SeqCst) + 1;
        Ok(AmqpReceiverSession {
            link: AmqpLink::open(&self.config, epoch)?,
            prefetch: self.prefetch,
            events: self.events.clone(),
        })
    }
}

pub struct AmqpReceiverSession {
    link: AmqpLink,
    prefetch: u16,
    events: Sender<WorkerEvent>,
}

impl BrokerSession for AmqpReceiverSession {
    fn epoch(&self) -> u64 {
        self.link.epoch
    }

    fn is_open(&self) -> bool {
        self.link.is_open()
    }

    fn probe(&mut self) -> Result<u32, CrackError> {
        self.link.probe()
    }

    fn assert_topology(&mut self) -> Result<(), CrackError> {
        self.link.assert_topology()
    }

    fn start_consuming(&mut self) -> Result<(), CrackError> {
        let stops = ConsumerSetup {
            source: QueueSource::Broadcast {
                exchange: self.link.config.fanout_exchange.clone(),
                routing_key: self.link.config.stop_routing_key.clone(),
            },
            no_ack: true,
            prefetch: None,
        };
        self.link.spawn_consumer(stops, self.events.clone(), |_, body| {
            WorkerEvent::Stop(String::from_utf8_lossy(body).trim().to_string())
        })?;

        let tasks = ConsumerSetup {
            source: QueueSource::Named(self.link.config.task_queue.clone()),
            no_ack: false,
            prefetch: Some(self.prefetch),
        };
        self.link.spawn_consumer(tasks, self.events.clone(), |delivery, body| {
            match SubTask::decode(body) {
                Ok(sub_task) => WorkerEvent::SubTask { sub_task, delivery },
                Err(e) => {
                    error!(?delivery, error = %e, "undecodable sub-task message");
                    WorkerEvent::MalformedDelivery(delivery)
                }
            }
        })
    }

    fn settle(&mut self, delivery: DeliveryTag, settlement: Settlement) -> Result<(), CrackError> {
        self.link.settle(delivery, settlement)
    }
}

impl ReceiverSession for AmqpReceiverSession {
    fn publish_result(&mut self, result: &TaskResult) -> Result<(), CrackError> {
        let body = result.encode()?;
        let exchange = self.link.config.direct_exchange.clone();
        let routing_key = self.link.config.result_routing_key.clone();
        self.link.publish(&exchange, &routing_key, &body, persistent()).map(|_| ())
    }
}
