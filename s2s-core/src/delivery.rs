//! Delivery controller: a background thread that collects batches and pushes
//! them through transactions, rescheduled and retried by a [`PollingPolicy`].
//!
//! Cancellation is cooperative. `stop()` only raises a flag; the loop notices
//! it at the top of each cycle and right after every sleep, so an in-flight
//! request finishes first.

use std::sync::mpsc::Sender;
use std::sync::{Arc, Condvar, Mutex, MutexGuard};
use std::thread;
use std::time::SystemTime;

use crate::client::SiteToSiteClient;
use crate::error::{DeliveryError, Error, Result};
use crate::packet::DataPacket;
use crate::policy::PollingPolicy;
use crate::transaction::{Transaction, TransactionCompletion};

/// Source of the packets to deliver. An empty batch is legitimate.
pub trait DataCollector: Send {
    fn collect(&mut self) -> Vec<Box<dyn DataPacket>>;
}

impl<F> DataCollector for F
where
    F: FnMut() -> Vec<Box<dyn DataPacket>> + Send,
{
    fn collect(&mut self) -> Vec<Box<dyn DataPacket>> {
        self()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StopReason {
    /// `stop()` was called.
    Requested,
    /// The policy declined to schedule another run.
    PolicyExhausted,
}

/// Progress notifications, published when a sender is attached.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DeliveryEvent {
    Completed(TransactionCompletion),
    CreateFailed { consecutive_failures: u32, error: String },
    SendFailed { consecutive_failures: u32, error: String },
    Stopped { reason: StopReason },
}

#[derive(Default)]
struct RunState {
    running: bool,
    stop_requested: bool,
}

struct Shared {
    client: Arc<SiteToSiteClient>,
    collector: Mutex<Box<dyn DataCollector>>,
    policy: Mutex<Box<dyn PollingPolicy>>,
    skip_empty_batches: bool,
    events: Mutex<Option<Sender<DeliveryEvent>>>,
    last_completion: Mutex<Option<TransactionCompletion>>,
    state: Mutex<RunState>,
    wake: Condvar,
}

fn lock<T: ?Sized>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

pub struct DeliveryController {
    shared: Arc<Shared>,
}

impl DeliveryController {
    /// `skip_empty_batches` skips transaction creation when the collector
    /// returns nothing; otherwise an empty transaction is still opened and
    /// confirmed.
    pub fn new(
        client: Arc<SiteToSiteClient>,
        collector: Box<dyn DataCollector>,
        policy: Box<dyn PollingPolicy>,
        skip_empty_batches: bool,
    ) -> Self {
        Self {
            shared: Arc::new(Shared {
                client,
                collector: Mutex::new(collector),
                policy: Mutex::new(policy),
                skip_empty_batches,
                events: Mutex::new(None),
                last_completion: Mutex::new(None),
                state: Mutex::new(RunState::default()),
                wake: Condvar::new(),
            }),
        }
    }

    pub fn with_events(self, events: Sender<DeliveryEvent>) -> Self {
        *lock(&self.shared.events) = Some(events);
        self
    }

    /// Start the loop thread. No-op while it is running; restarts it after
    /// a stop or policy exhaustion.
    pub fn start(&self) -> Result<()> {
        let mut state = lock(&self.shared.state);
        state.stop_requested = false;
        if state.running {
            return Ok(());
        }
        state.running = true;
        drop(state);

        let shared = self.shared.clone();
        let spawned = thread::Builder::new()
            .name("s2s-delivery".into())
            .spawn(move || shared.run());
        if let Err(e) = spawned {
            lock(&self.shared.state).running = false;
            return Err(Error::Io(e));
        }
        tracing::info!(port = self.shared.client.port_identifier(), "delivery loop started");
        Ok(())
    }

    /// Ask the loop to stop and return immediately.
    pub fn stop(&self) {
        lock(&self.shared.state).stop_requested = true;
        self.shared.wake.notify_all();
    }

    pub fn running(&self) -> bool {
        lock(&self.shared.state).running
    }

    /// Metrics of the most recent successful batch.
    pub fn last_completion(&self) -> Option<TransactionCompletion> {
        *lock(&self.shared.last_completion)
    }
}

impl Drop for DeliveryController {
    fn drop(&mut self) {
        self.stop();
    }
}

impl Shared {
    fn run(&self) {
        let mut next_run = lock(&self.policy).next_desired_runtime(None);
        let mut batch: Option<Vec<Box<dyn DataPacket>>> = None;
        let mut create_failures = 0u32;
        let mut send_failures = 0u32;

        loop {
            let Some(at) = next_run else {
                self.finish(StopReason::PolicyExhausted);
                return;
            };
            if self.sleep_until(at) && self.finish(StopReason::Requested) {
                return;
            }

            let packets = match batch.take() {
                Some(packets) => packets,
                None => {
                    let packets = lock(&self.collector).collect();
                    if packets.is_empty() && self.skip_empty_batches {
                        tracing::debug!("nothing to deliver");
                        next_run = lock(&self.policy).next_desired_runtime(None);
                        continue;
                    }
                    packets
                }
            };

            match self.deliver(&packets) {
                Ok(completion) => {
                    create_failures = 0;
                    send_failures = 0;
                    *lock(&self.last_completion) = Some(completion);
                    self.publish(DeliveryEvent::Completed(completion));
                    next_run = lock(&self.policy).next_desired_runtime(Some(&completion));
                }
                Err(DeliveryError::Create(e)) => {
                    create_failures += 1;
                    tracing::error!(error = %e, attempt = create_failures, "transaction create failed, will retry");
                    self.publish(DeliveryEvent::CreateFailed {
                        consecutive_failures: create_failures,
                        error: e.to_string(),
                    });
                    batch = Some(packets);
                    next_run = lock(&self.policy).next_retry_after_failed_transaction_create(create_failures);
                }
                Err(DeliveryError::Send(e)) => {
                    create_failures = 0;
                    send_failures += 1;
                    tracing::error!(error = %e, attempt = send_failures, "batch delivery failed, will retry");
                    self.publish(DeliveryEvent::SendFailed {
                        consecutive_failures: send_failures,
                        error: e.to_string(),
                    });
                    batch = Some(packets);
                    next_run = lock(&self.policy).next_retry_after_failed_send(send_failures);
                }
            }
        }
    }

    /// Sleep until `at` or until stop is requested. Returns true when stop
    /// was requested.
    fn sleep_until(&self, at: SystemTime) -> bool {
        let mut state = lock(&self.state);
        loop {
            if state.stop_requested {
                return true;
            }
            let remaining = match at.duration_since(SystemTime::now()) {
                Ok(d) if !d.is_zero() => d,
                _ => return false,
            };
            state = match self.wake.wait_timeout(state, remaining) {
                Ok((guard, _)) => guard,
                Err(poisoned) => poisoned.into_inner().0,
            };
        }
    }

    /// Publish `Stopped` and clear `running` under the state lock, so a
    /// `start()` that sees the loop stopped spawns a thread whose events
    /// follow this one. Returns false if a `start()` withdrew the stop
    /// request in the meantime; the loop then carries on.
    fn finish(&self, reason: StopReason) -> bool {
        let mut state = lock(&self.state);
        if reason == StopReason::Requested && !state.stop_requested {
            return false;
        }
        tracing::info!(?reason, "delivery loop stopped");
        self.publish(DeliveryEvent::Stopped { reason });
        state.running = false;
        true
    }

    fn deliver(&self, packets: &[Box<dyn DataPacket>]) -> std::result::Result<TransactionCompletion, DeliveryError> {
        let mut transaction = match self.client.create_transaction() {
            Ok(Some(tx)) => tx,
            Ok(None) => {
                return Err(DeliveryError::Create(Error::Protocol(
                    "no peer offered a transaction".into(),
                )))
            }
            Err(e) => return Err(DeliveryError::Create(e)),
        };

        send_batch(&mut transaction, packets).map_err(|e| {
            if let Err(cancel_err) = transaction.cancel() {
                tracing::debug!(url = transaction.url(), error = %cancel_err, "cancel after failed send did not complete");
            }
            DeliveryError::Send(e)
        })
    }

    fn publish(&self, event: DeliveryEvent) {
        if let Some(events) = lock(&self.events).as_ref() {
            let _ = events.send(event);
        }
    }
}

fn send_batch(transaction: &mut Transaction, packets: &[Box<dyn DataPacket>]) -> Result<TransactionCompletion> {
    for packet in packets {
        transaction.send(packet.as_ref())?;
    }
    transaction.confirm()?;
    transaction.complete()
}
