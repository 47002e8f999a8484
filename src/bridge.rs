//! The listener the host calls into for every event.
//!
//! [`KafkaEventListener`] moves through `Running → Draining → Closed`. It is
//! built (and its producer created) by [`KafkaEventListener::start`]; a failure
//! there means the bridge never exists, which is the uninitialized state.
//! While running, each event is serialized, routed and handed to the producer
//! without waiting for the broker. [`KafkaEventListener::shutdown`] stops
//! admitting events, waits for outstanding sends up to the drain timeout and
//! closes the producer exactly once.

use crate::config::BridgeConfig;
use crate::kafka::{
    EventProducer, EventSerializer, JsonSerializer, KeyStrategy, ProducerProvider, TopicRouter,
    WireMessage,
};
use crate::keycloak::{AdminEvent, Event, HostEvent};
use crate::{Error, Result};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Condvar, Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};
use tracing::{debug, error, info, trace, warn};

/// What the host talks to. Both entry points return immediately and never
/// report delivery problems back to the caller.
pub trait EventListener: Send + Sync {
    fn on_event(&self, event: &Event);

    fn on_admin_event(&self, event: &AdminEvent, include_representation: bool);

    /// Host shutdown hook.
    fn close(&self);
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BridgeState {
    Running,
    Draining,
    Closed,
}

/// Point-in-time counters.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct BridgeStats {
    /// Handed to the producer.
    pub submitted: u64,
    /// Acknowledged by the broker.
    pub delivered: u64,
    /// Failed to serialize, to enqueue, or to deliver.
    pub failed: u64,
    /// Arrived after shutdown began.
    pub rejected: u64,
    /// Skipped by the event type filter.
    pub filtered: u64,
    pub in_flight: usize,
}

/// Outcome of [`KafkaEventListener::shutdown`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ShutdownReport {
    pub delivered: u64,
    pub failed: u64,
    /// Sends still outstanding when the drain timeout expired.
    pub abandoned: usize,
    pub elapsed: Duration,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

struct Gate {
    state: BridgeState,
    in_flight: usize,
}

#[derive(Default)]
struct Counters {
    submitted: AtomicU64,
    delivered: AtomicU64,
    failed: AtomicU64,
    rejected: AtomicU64,
    filtered: AtomicU64,
}

/// State shared with delivery callbacks. Holds no reference to the producer,
/// so a callback can never keep it alive.
struct Shared {
    gate: Mutex<Gate>,
    settled: Condvar,
    counters: Counters,
}

impl Shared {
    /// Reserves an in-flight slot if the bridge is still running.
    fn admit(&self) -> bool {
        let mut gate = lock(&self.gate);
        if gate.state != BridgeState::Running {
            return false;
        }
        gate.in_flight += 1;
        true
    }

    fn release(&self) {
        let mut gate = lock(&self.gate);
        gate.in_flight = gate.in_flight.saturating_sub(1);
        if gate.in_flight == 0 {
            self.settled.notify_all();
        }
    }

    /// Waits until nothing is in flight or `deadline` passes; returns what is
    /// still outstanding.
    fn wait_settled(&self, deadline: Instant) -> usize {
        let mut gate = lock(&self.gate);
        while gate.in_flight > 0 {
            let now = Instant::now();
            if now >= deadline {
                break;
            }
            gate = self
                .settled
                .wait_timeout(gate, deadline - now)
                .unwrap_or_else(PoisonError::into_inner)
                .0;
        }
        gate.in_flight
    }

    fn set_state(&self, state: BridgeState) {
        lock(&self.gate).state = state;
    }
}

pub struct KafkaEventListener {
    config: BridgeConfig,
    router: TopicRouter,
    key_strategy: KeyStrategy,
    serializer: Box<dyn EventSerializer>,
    producer: Arc<dyn EventProducer>,
    shared: Arc<Shared>,
    report: Mutex<Option<ShutdownReport>>,
}

impl KafkaEventListener {
    /// Validates `config`, then asks `provider` for the one producer this
    /// bridge will own. Any error is fatal: no bridge is returned.
    pub fn start<P>(config: BridgeConfig, provider: &P) -> Result<Self>
    where
        P: ProducerProvider + ?Sized,
    {
        let serializer = Box::new(JsonSerializer::new(config.format));
        Self::start_with_serializer(config, provider, serializer)
    }

    pub fn start_with_serializer<P>(
        config: BridgeConfig,
        provider: &P,
        serializer: Box<dyn EventSerializer>,
    ) -> Result<Self>
    where
        P: ProducerProvider + ?Sized,
    {
        config.validate()?;
        let router = TopicRouter::new(&config.events_topic, &config.admin_events_topic)?;

        let producer = provider.create_producer(
            &config.client_id,
            &config.bootstrap_servers,
            &config.producer.to_properties(),
        )?;

        info!(
            client_id = %config.client_id,
            bootstrap_servers = %config.bootstrap_servers,
            events_topic = %router.events_topic(),
            admin_events_topic = %router.admin_events_topic(),
            key_strategy = ?config.key_strategy,
            "Kafka event listener started"
        );

        Ok(Self {
            key_strategy: config.key_strategy,
            config,
            router,
            serializer,
            producer,
            shared: Arc::new(Shared {
                gate: Mutex::new(Gate {
                    state: BridgeState::Running,
                    in_flight: 0,
                }),
                settled: Condvar::new(),
                counters: Counters::default(),
            }),
            report: Mutex::new(None),
        })
    }

    pub fn state(&self) -> BridgeState {
        lock(&self.shared.gate).state
    }

    pub fn stats(&self) -> BridgeStats {
        let counters = &self.shared.counters;
        BridgeStats {
            submitted: counters.submitted.load(Ordering::Relaxed),
            delivered: counters.delivered.load(Ordering::Relaxed),
            failed: counters.failed.load(Ordering::Relaxed),
            rejected: counters.rejected.load(Ordering::Relaxed),
            filtered: counters.filtered.load(Ordering::Relaxed),
            in_flight: lock(&self.shared.gate).in_flight,
        }
    }

    fn publish(&self, event: HostEvent<'_>) {
        let counters = &self.shared.counters;
        let topic = self.router.topic_for(event);
        let key = self.key_strategy.extract_key(event);

        let payload = match self.serializer.serialize(event) {
            Ok(payload) => payload,
            Err(e) => {
                counters.failed.fetch_add(1, Ordering::Relaxed);
                error!(error = %e, topic, event = event.label(), "Failed to serialize event");
                return;
            }
        };

        if !self.shared.admit() {
            counters.rejected.fetch_add(1, Ordering::Relaxed);
            warn!(
                error = %Error::Shutdown,
                topic,
                event = event.label(),
                realm = event.realm_id(),
                "Dropping event received after shutdown began"
            );
            return;
        }

        let replay = payload.clone();
        let shared = Arc::clone(&self.shared);
        let message = WireMessage {
            topic: topic.to_string(),
            key,
            payload,
        };

        let on_delivery = Box::new(move |outcome: crate::kafka::DeliveryResult| {
            match outcome {
                Ok(receipt) => {
                    shared.counters.delivered.fetch_add(1, Ordering::Relaxed);
                    trace!(
                        topic = %receipt.topic,
                        partition = receipt.partition,
                        offset = receipt.offset,
                        "Event delivered"
                    );
                }
                Err(e) => {
                    shared.counters.failed.fetch_add(1, Ordering::Relaxed);
                    error!(error = %e, payload = %replay, "Event delivery failed");
                }
            }
            shared.release();
        });

        match self.producer.send(message, on_delivery) {
            Ok(()) => {
                counters.submitted.fetch_add(1, Ordering::Relaxed);
                debug!(topic, event = event.label(), "Event submitted");
            }
            Err(e) => {
                self.shared.release();
                counters.failed.fetch_add(1, Ordering::Relaxed);
                error!(error = %e, event = event.label(), "Failed to enqueue event");
            }
        }
    }

    /// Stops admitting events, waits for outstanding sends up to the drain
    /// timeout, then closes the producer. Later calls return the first
    /// report.
    pub fn shutdown(&self) -> ShutdownReport {
        let mut report = lock(&self.report);
        if let Some(report) = *report {
            return report;
        }

        let started = Instant::now();
        let deadline = started + self.config.drain_timeout();
        self.shared.set_state(BridgeState::Draining);
        info!(
            in_flight = self.stats().in_flight,
            timeout = ?self.config.drain_timeout(),
            "Draining Kafka event listener"
        );

        if let Err(e) = self.producer.flush(self.config.drain_timeout()) {
            warn!(error = %e, "Producer flush did not complete");
        }
        let abandoned = self.shared.wait_settled(deadline);
        if abandoned > 0 {
            warn!(abandoned, "Drain timeout expired with sends still in flight");
        }

        self.producer.close();
        self.shared.set_state(BridgeState::Closed);

        let stats = self.stats();
        let result = ShutdownReport {
            delivered: stats.delivered,
            failed: stats.failed,
            abandoned,
            elapsed: started.elapsed(),
        };
        info!(
            delivered = result.delivered,
            failed = result.failed,
            abandoned = result.abandoned,
            rejected = stats.rejected,
            "Kafka event listener closed"
        );

        *report = Some(result);
        result
    }
}

impl EventListener for KafkaEventListener {
    fn on_event(&self, event: &Event) {
        if !self.config.publishes(event.event_type) {
            self.shared.counters.filtered.fetch_add(1, Ordering::Relaxed);
            trace!(event = %event.event_type, "Event type not selected for publishing");
            return;
        }
        self.publish(HostEvent::Standard(event));
    }

    fn on_admin_event(&self, event: &AdminEvent, include_representation: bool) {
        if !self.config.admin_events_enabled {
            self.shared.counters.filtered.fetch_add(1, Ordering::Relaxed);
            return;
        }
        self.publish(HostEvent::Admin {
            event,
            include_representation,
        });
    }

    fn close(&self) {
        self.shutdown();
    }
}

impl Drop for KafkaEventListener {
    fn drop(&mut self) {
        if self.state() == BridgeState::Running {
            self.shutdown();
        }
    }
}
