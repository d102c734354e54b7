//! Delivery handling: one stage, one trigger, at-least-once semantics.
//!
//! A [`Worker`] pulls deliveries from its [`Trigger`], runs its [`Stage`] on
//! every event a delivery carries, publishes follow-up events and only then
//! acknowledges the delivery. A failed delivery is never acknowledged, so the
//! transport redelivers it once its visibility timeout lapses; every stage is
//! safe to repeat.

use crate::error::Result;
use crate::io::cloud::QueueIO;
use crate::stages::{Stage, StageOutcome, StorageEvent};
use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex};
use tracing::{debug, error, info, warn};

/// One message handed to a worker.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Delivery {
    pub id: String,
    pub body: String,
    /// Token needed to acknowledge the delivery, if the transport has one.
    pub receipt: Option<String>,
}

/// A source of deliveries and a sink for follow-up events.
pub trait Trigger: Send + Sync {
    /// Up to `max` pending deliveries; empty when nothing is waiting.
    ///
    /// # Errors
    /// Returns an error if the transport cannot be read.
    fn next_deliveries(&self, max: usize) -> Result<Vec<Delivery>>;

    /// Acknowledge a delivery so it is never redelivered.
    ///
    /// # Errors
    /// Returns an error if the acknowledgement is rejected.
    fn complete(&self, delivery: &Delivery) -> Result<()>;

    /// Hand a follow-up event to the next stage.
    ///
    /// # Errors
    /// Returns an error if the event cannot be published.
    fn publish(&self, event: &StorageEvent) -> Result<()>;
}

// ============================================================================
// Queue trigger
// ============================================================================

/// Polls a queue; optionally publishes follow-ups to a second queue.
pub struct QueueTrigger<Q: QueueIO> {
    queue: Q,
    input: String,
    output: Option<String>,
    visibility_timeout_secs: u32,
}

impl<Q: QueueIO> QueueTrigger<Q> {
    pub fn new(queue: Q, input: impl Into<String>, visibility_timeout_secs: u32) -> Self {
        Self {
            queue,
            input: input.into(),
            output: None,
            visibility_timeout_secs,
        }
    }

    #[must_use]
    pub fn with_output(mut self, output: impl Into<String>) -> Self {
        self.output = Some(output.into());
        self
    }
}

impl<Q: QueueIO> Trigger for QueueTrigger<Q> {
    fn next_deliveries(&self, max: usize) -> Result<Vec<Delivery>> {
        let max = u32::try_from(max).unwrap_or(u32::MAX);
        let messages = self.queue.receive(&self.input, max, self.visibility_timeout_secs)?;
        Ok(messages
            .into_iter()
            .map(|m| Delivery {
                id: m.id,
                body: m.body,
                receipt: Some(m.receipt_handle),
            })
            .collect())
    }

    fn complete(&self, delivery: &Delivery) -> Result<()> {
        match &delivery.receipt {
            Some(receipt) => Ok(self.queue.delete(&self.input, receipt)?),
            None => Ok(()),
        }
    }

    fn publish(&self, event: &StorageEvent) -> Result<()> {
        if let Some(output) = &self.output {
            let id = self.queue.send(output, &event.to_notification(), HashMap::new())?;
            debug!(queue = %output, message = %id, key = %event.key, "published follow-up event");
        }
        Ok(())
    }
}

// ============================================================================
// Direct trigger
// ============================================================================

/// Deliveries pushed in-process (a direct invocation or job arguments).
/// Published events are recorded instead of sent anywhere.
#[derive(Clone, Default)]
pub struct DirectTrigger {
    pending: Arc<Mutex<VecDeque<Delivery>>>,
    published: Arc<Mutex<Vec<StorageEvent>>>,
    completed: Arc<Mutex<Vec<String>>>,
    next_id: Arc<Mutex<u64>>,
}

impl DirectTrigger {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Queue a raw message body.
    ///
    /// # Panics
    ///
    /// Panics if a mutex is poisoned.
    pub fn push_body(&self, body: impl Into<String>) {
        let mut next = self.next_id.lock().expect("next_id mutex poisoned");
        *next += 1;
        let id = format!("direct-{}", *next);
        drop(next);
        self.pending
            .lock()
            .expect("pending mutex poisoned")
            .push_back(Delivery {
                id,
                body: body.into(),
                receipt: None,
            });
    }

    /// Queue an event.
    pub fn push(&self, event: &StorageEvent) {
        self.push_body(event.to_notification());
    }

    /// # Panics
    ///
    /// Panics if the mutex is poisoned.
    #[must_use]
    pub fn published(&self) -> Vec<StorageEvent> {
        self.published.lock().expect("published mutex poisoned").clone()
    }

    /// Ids of acknowledged deliveries.
    ///
    /// # Panics
    ///
    /// Panics if the mutex is poisoned.
    #[must_use]
    pub fn completed(&self) -> Vec<String> {
        self.completed.lock().expect("completed mutex poisoned").clone()
    }
}

impl Trigger for DirectTrigger {
    fn next_deliveries(&self, max: usize) -> Result<Vec<Delivery>> {
        let mut pending = self.pending.lock().expect("pending mutex poisoned");
        let n = max.min(pending.len());
        Ok(pending.drain(..n).collect())
    }

    fn complete(&self, delivery: &Delivery) -> Result<()> {
        self.completed
            .lock()
            .expect("completed mutex poisoned")
            .push(delivery.id.clone());
        Ok(())
    }

    fn publish(&self, event: &StorageEvent) -> Result<()> {
        self.published
            .lock()
            .expect("published mutex poisoned")
            .push(event.clone());
        Ok(())
    }
}

// ============================================================================
// Worker
// ============================================================================

/// What happened to one delivery.
#[derive(Debug, Clone, PartialEq)]
pub enum DeliveryReport {
    /// Every event was processed and the delivery acknowledged.
    Processed(Vec<StageOutcome>),
    /// The body was not a storage notification; acknowledged and dropped.
    Dropped,
    /// Processing failed; the delivery stays unacknowledged.
    Failed(String),
}

/// How a worker spreads a batch of deliveries.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WorkerMode {
    Sequential,
    /// Deliveries run concurrently on the rayon pool; `threads` sizes a
    /// dedicated pool, `None` shares the global one.
    #[cfg(feature = "parallel-workers")]
    Parallel { threads: Option<usize> },
}

impl Default for WorkerMode {
    fn default() -> Self {
        #[cfg(feature = "parallel-workers")]
        {
            Self::Parallel { threads: None }
        }
        #[cfg(not(feature = "parallel-workers"))]
        {
            Self::Sequential
        }
    }
}

pub struct Worker<T: Trigger> {
    trigger: T,
    stage: Arc<dyn Stage>,
    mode: WorkerMode,
}

impl<T: Trigger> Worker<T> {
    pub fn new(trigger: T, stage: Arc<dyn Stage>) -> Self {
        Self {
            trigger,
            stage,
            mode: WorkerMode::default(),
        }
    }

    #[must_use]
    pub fn with_mode(mut self, mode: WorkerMode) -> Self {
        self.mode = mode;
        self
    }

    #[must_use]
    pub fn trigger(&self) -> &T {
        &self.trigger
    }

    /// Handle at most one delivery. Returns `None` when nothing is waiting.
    ///
    /// # Errors
    /// Returns an error only if the trigger cannot be read; stage failures
    /// are reported as [`DeliveryReport::Failed`].
    pub fn run_once(&self) -> Result<Option<DeliveryReport>> {
        let delivery = self.trigger.next_deliveries(1)?.into_iter().next();
        Ok(delivery.map(|d| self.handle(&d)))
    }

    /// Pull up to `max` deliveries and handle them, concurrently in parallel
    /// mode. Reports come back in delivery order.
    ///
    /// # Errors
    /// Returns an error if the trigger cannot be read.
    pub fn drain(&self, max: usize) -> Result<Vec<DeliveryReport>> {
        let deliveries = self.trigger.next_deliveries(max)?;
        info!(stage = self.stage.name(), deliveries = deliveries.len(), "draining deliveries");
        match self.mode {
            WorkerMode::Sequential => Ok(deliveries.iter().map(|d| self.handle(d)).collect()),
            #[cfg(feature = "parallel-workers")]
            WorkerMode::Parallel { threads } => {
                use rayon::prelude::*;
                let run = || deliveries.par_iter().map(|d| self.handle(d)).collect::<Vec<_>>();
                match threads {
                    Some(n) => {
                        let pool = rayon::ThreadPoolBuilder::new()
                            .num_threads(n.clamp(1, 4 * num_cpus::get().max(1)))
                            .build()
                            .map_err(|e| crate::error::PipelineError::Config(format!("worker pool: {e}")))?;
                        Ok(pool.install(run))
                    }
                    None => Ok(run()),
                }
            }
        }
    }

    /// Process one delivery end to end.
    pub fn handle(&self, delivery: &Delivery) -> DeliveryReport {
        let stage = self.stage.name();
        let Some(events) = StorageEvent::parse_notification(&delivery.body) else {
            warn!(stage, delivery = %delivery.id, "unrecognised message body; dropping");
            return match self.trigger.complete(delivery) {
                Ok(()) => DeliveryReport::Dropped,
                Err(e) => DeliveryReport::Failed(e.to_string()),
            };
        };

        let mut outcomes = Vec::with_capacity(events.len());
        for event in &events {
            info!(stage, bucket = %event.bucket, key = %event.key, "processing event");
            let outcome = match self.stage.process(event) {
                Ok(outcome) => outcome,
                Err(e) => {
                    error!(stage, delivery = %delivery.id, key = %event.key, error = %e, "delivery left for redelivery");
                    return DeliveryReport::Failed(e.to_string());
                }
            };
            if let StageOutcome::Forward(next) = &outcome
                && let Err(e) = self.trigger.publish(next)
            {
                error!(stage, delivery = %delivery.id, key = %next.key, error = %e, "could not publish follow-up");
                return DeliveryReport::Failed(e.to_string());
            }
            outcomes.push(outcome);
        }

        match self.trigger.complete(delivery) {
            Ok(()) => DeliveryReport::Processed(outcomes),
            Err(e) => {
                error!(stage, delivery = %delivery.id, error = %e, "could not acknowledge delivery");
                DeliveryReport::Failed(e.to_string())
            }
        }
    }
}
