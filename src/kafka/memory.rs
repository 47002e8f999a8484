//! In-memory broker and producer for tests and local runs.
//!
//! [`MemoryProducer`] behaves like a real client from the caller's point of
//! view: `send` only enqueues, and a background thread acknowledges messages
//! in submission order, optionally after a delay. [`MemoryBroker::set_available`]
//! simulates an outage; while it lasts the worker retries each message with
//! exponential backoff up to the configured retry budget.

use super::producer::{
    validate_identity, DeliveryCallback, DeliveryReceipt, EventProducer, ProducerProvider,
    WireMessage,
};
use crate::{Error, Result};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::mpsc;
use std::sync::{Arc, Condvar, Mutex, MutexGuard, PoisonError};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};
use tracing::{debug, trace, warn};

const MAX_BACKOFF: Duration = Duration::from_secs(1);

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Shared log of everything acknowledged, inspectable by tests.
#[derive(Clone, Default)]
pub struct MemoryBroker {
    state: Arc<BrokerState>,
}

#[derive(Default)]
struct BrokerState {
    log: Mutex<Vec<WireMessage>>,
    appended: Condvar,
    unavailable: AtomicBool,
}

impl MemoryBroker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Toggles a simulated outage. While unavailable, every delivery attempt
    /// fails.
    pub fn set_available(&self, available: bool) {
        self.state.unavailable.store(!available, Ordering::SeqCst);
    }

    pub fn is_available(&self) -> bool {
        !self.state.unavailable.load(Ordering::SeqCst)
    }

    /// All acknowledged messages in acknowledgment order.
    pub fn messages(&self) -> Vec<WireMessage> {
        lock(&self.state.log).clone()
    }

    pub fn messages_on(&self, topic: &str) -> Vec<WireMessage> {
        lock(&self.state.log)
            .iter()
            .filter(|m| m.topic == topic)
            .cloned()
            .collect()
    }

    /// Waits until at least `count` messages were acknowledged. Returns
    /// `false` on timeout.
    pub fn wait_for(&self, count: usize, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        let mut log = lock(&self.state.log);
        while log.len() < count {
            let now = Instant::now();
            if now >= deadline {
                return false;
            }
            log = self
                .state
                .appended
                .wait_timeout(log, deadline - now)
                .unwrap_or_else(PoisonError::into_inner)
                .0;
        }
        true
    }

    fn append(&self, message: WireMessage) -> DeliveryReceipt {
        let mut log = lock(&self.state.log);
        let receipt = DeliveryReceipt {
            topic: message.topic.clone(),
            partition: 0,
            offset: log.len() as i64,
        };
        log.push(message);
        self.state.appended.notify_all();
        receipt
    }
}

/// Counter of queued-but-unfinished messages that can be waited on.
#[derive(Default)]
struct Pending {
    count: Mutex<usize>,
    drained: Condvar,
}

impl Pending {
    fn increment(&self) {
        *lock(&self.count) += 1;
    }

    fn decrement(&self) {
        let mut count = lock(&self.count);
        *count = count.saturating_sub(1);
        if *count == 0 {
            self.drained.notify_all();
        }
    }

    fn get(&self) -> usize {
        *lock(&self.count)
    }

    fn wait_empty(&self, timeout: Duration) -> bool {
        let (count, result) = self
            .drained
            .wait_timeout_while(lock(&self.count), timeout, |count| *count > 0)
            .unwrap_or_else(PoisonError::into_inner);
        drop(count);
        !result.timed_out()
    }
}

#[derive(Debug, Clone)]
struct WorkerSettings {
    ack_delay: Duration,
    retries: u32,
    retry_backoff: Duration,
}

type Job = (WireMessage, DeliveryCallback);

pub struct MemoryProducer {
    sender: Mutex<Option<mpsc::Sender<Job>>>,
    worker: Mutex<Option<JoinHandle<()>>>,
    pending: Arc<Pending>,
    purging: Arc<AtomicBool>,
}

impl MemoryProducer {
    fn spawn(client_id: &str, broker: MemoryBroker, settings: WorkerSettings) -> Result<Self> {
        let (sender, receiver) = mpsc::channel::<Job>();
        let pending = Arc::new(Pending::default());
        let purging = Arc::new(AtomicBool::new(false));

        let worker = {
            let pending = Arc::clone(&pending);
            let purging = Arc::clone(&purging);
            thread::Builder::new()
                .name(format!("memory-producer-{}", client_id))
                .spawn(move || {
                    for (message, on_delivery) in receiver {
                        let outcome = if purging.load(Ordering::Acquire) {
                            Err(send_error(&message, "message purged on close"))
                        } else {
                            deliver(&broker, &settings, &purging, message)
                        };
                        on_delivery(outcome);
                        pending.decrement();
                    }
                    trace!("Memory producer worker exiting");
                })?
        };

        Ok(Self {
            sender: Mutex::new(Some(sender)),
            worker: Mutex::new(Some(worker)),
            pending,
            purging,
        })
    }
}

fn send_error(message: &WireMessage, reason: &str) -> Error {
    Error::Send {
        topic: message.topic.clone(),
        key: message.key.clone(),
        message: reason.to_string(),
    }
}

fn deliver(
    broker: &MemoryBroker,
    settings: &WorkerSettings,
    purging: &AtomicBool,
    message: WireMessage,
) -> std::result::Result<DeliveryReceipt, Error> {
    if !settings.ack_delay.is_zero() {
        thread::sleep(settings.ack_delay);
    }

    let mut attempt = 0u32;
    let mut backoff = settings.retry_backoff;
    loop {
        if broker.is_available() {
            return Ok(broker.append(message));
        }
        if attempt >= settings.retries || purging.load(Ordering::Acquire) {
            return Err(send_error(
                &message,
                &format!("broker unavailable after {} retries", attempt),
            ));
        }
        attempt += 1;
        debug!(topic = %message.topic, attempt, "Broker unavailable, retrying");
        thread::sleep(backoff);
        backoff = (backoff * 2).min(MAX_BACKOFF);
    }
}

impl EventProducer for MemoryProducer {
    fn send(&self, message: WireMessage, on_delivery: DeliveryCallback) -> Result<()> {
        let sender = lock(&self.sender);
        let Some(sender) = sender.as_ref() else {
            return Err(send_error(&message, "producer is closed"));
        };

        self.pending.increment();
        sender.send((message, on_delivery)).map_err(|mpsc::SendError((message, _))| {
            self.pending.decrement();
            send_error(&message, "producer worker stopped")
        })
    }

    fn flush(&self, timeout: Duration) -> Result<()> {
        if self.pending.wait_empty(timeout) {
            Ok(())
        } else {
            Err(Error::Timeout {
                message: format!("{} messages still in flight", self.pending.get()),
            })
        }
    }

    fn in_flight(&self) -> usize {
        self.pending.get()
    }

    fn close(&self) {
        let Some(sender) = lock(&self.sender).take() else {
            return;
        };
        drop(sender);

        let remaining = self.pending.get();
        if remaining > 0 {
            warn!(remaining, "Purging undelivered messages on close");
            self.purging.store(true, Ordering::Release);
        }
        if let Some(worker) = lock(&self.worker).take() {
            if worker.join().is_err() {
                warn!("Memory producer worker panicked");
            }
        }
    }
}

impl Drop for MemoryProducer {
    fn drop(&mut self) {
        self.close();
    }
}

/// Provider handing out [`MemoryProducer`]s that all write to one
/// [`MemoryBroker`].
///
/// Honors the `retries` and `retry.backoff.ms` properties the same way a real
/// client would.
pub struct MemoryProducerProvider {
    broker: MemoryBroker,
    ack_delay: Duration,
    created: AtomicUsize,
}

impl MemoryProducerProvider {
    pub fn new(broker: MemoryBroker) -> Self {
        Self {
            broker,
            ack_delay: Duration::ZERO,
            created: AtomicUsize::new(0),
        }
    }

    /// Delays every acknowledgment, emulating a broker round trip.
    pub fn with_ack_delay(mut self, ack_delay: Duration) -> Self {
        self.ack_delay = ack_delay;
        self
    }

    /// How many producers this provider has built.
    pub fn producers_created(&self) -> usize {
        self.created.load(Ordering::SeqCst)
    }
}

fn parse_property<T: std::str::FromStr>(
    properties: &HashMap<String, String>,
    key: &str,
    default: T,
) -> Result<T> {
    match properties.get(key) {
        Some(raw) => raw
            .parse()
            .map_err(|_| Error::Config(format!("Property '{}' has invalid value '{}'", key, raw))),
        None => Ok(default),
    }
}

impl ProducerProvider for MemoryProducerProvider {
    fn create_producer(
        &self,
        client_id: &str,
        bootstrap_servers: &str,
        optional_properties: &HashMap<String, String>,
    ) -> Result<Arc<dyn EventProducer>> {
        validate_identity(client_id, bootstrap_servers)?;

        let settings = WorkerSettings {
            ack_delay: self.ack_delay,
            retries: parse_property(optional_properties, "retries", 0u32)?,
            retry_backoff: Duration::from_millis(parse_property(
                optional_properties,
                "retry.backoff.ms",
                100u64,
            )?),
        };

        let producer = MemoryProducer::spawn(client_id, self.broker.clone(), settings)?;
        self.created.fetch_add(1, Ordering::SeqCst);
        debug!(client_id, "Memory producer created");
        Ok(Arc::new(producer))
    }
}
