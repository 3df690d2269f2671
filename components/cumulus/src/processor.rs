/* This Source Code Form is subject to the terms of the Mozilla Public
 * License, v. 2.0. If a copy of the MPL was not distributed with this
 * file, You can obtain one at http://mozilla.org/MPL/2.0/. */

//! The asynchronous event pipeline. Producers (decision and tracking calls)
//! enqueue onto a bounded channel without ever blocking; a single background
//! thread accumulates a batch and flushes it when the batch fills, when the
//! flush interval elapses, on an explicit flush, or at shutdown.
//!
//! There is no durable queue: whatever cannot be handed to the dispatcher is
//! logged and dropped.

use crate::error::{debug, warn, CumulusError, Result};
use crate::events::{build_batch, EventBatch, UserEvent};
use crossbeam_channel::{bounded, Receiver, RecvTimeoutError, Sender, TrySendError};
use once_cell::sync::Lazy;
use std::sync::{Arc, Mutex};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};
use url::Url;

pub const DEFAULT_BATCH_SIZE: usize = 10;
pub const DEFAULT_FLUSH_INTERVAL: Duration = Duration::from_secs(30);
pub const DEFAULT_QUEUE_CAPACITY: usize = 1000;
pub const DEFAULT_SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(5);

pub const DEFAULT_EVENTS_URL: &str = "https://logx.optimizely.com/v1/events";

static DEFAULT_ENDPOINT: Lazy<Url> =
    Lazy::new(|| Url::parse(DEFAULT_EVENTS_URL).expect("default events URL parses"));

/// A fully-built payload on its way out: where to POST and what.
#[derive(Debug, Clone)]
pub struct LogEvent {
    pub url: String,
    pub params: EventBatch,
}

/// The transport seam. The SDK never performs HTTP itself; each flush hands
/// one payload to this trait and moves on. Failures are logged, not retried.
pub trait EventDispatcher: Send + Sync {
    fn dispatch_event(&self, event: LogEvent) -> Result<()>;
}

/// The fallback dispatcher when none is wired up: drops payloads on the
/// floor, loudly enough to notice in development.
pub struct NoopDispatcher;

impl EventDispatcher for NoopDispatcher {
    fn dispatch_event(&self, event: LogEvent) -> Result<()> {
        debug!(
            "No event dispatcher configured, dropping a batch of {} visitors",
            event.params.visitors.len()
        );
        Ok(())
    }
}

/// Called with every flushed payload, just before dispatch. The client uses
/// this to feed log-event notification listeners.
pub type FlushHook = Box<dyn Fn(&LogEvent) + Send + Sync>;

#[derive(Debug, Clone)]
pub struct BatchConfig {
    pub batch_size: usize,
    pub flush_interval: Duration,
    pub queue_capacity: usize,
    pub endpoint: Url,
}

impl Default for BatchConfig {
    fn default() -> Self {
        Self {
            batch_size: DEFAULT_BATCH_SIZE,
            flush_interval: DEFAULT_FLUSH_INTERVAL,
            queue_capacity: DEFAULT_QUEUE_CAPACITY,
            endpoint: DEFAULT_ENDPOINT.clone(),
        }
    }
}

enum Signal {
    Event(Box<UserEvent>),
    Flush,
    // Carries the deadline by which draining must finish.
    Shutdown(Instant),
}

pub struct BatchEventProcessor {
    sender: Sender<Signal>,
    handle: Mutex<Option<JoinHandle<()>>>,
}

impl BatchEventProcessor {
    pub fn new(
        dispatcher: Arc<dyn EventDispatcher>,
        config: BatchConfig,
        on_flush: Option<FlushHook>,
    ) -> Self {
        let (sender, receiver) = bounded(config.queue_capacity.max(1));
        let consumer = Consumer {
            receiver,
            dispatcher,
            config,
            on_flush,
            batch: Vec::new(),
            deadline: None,
        };
        let handle = thread::Builder::new()
            .name("cumulus-event-processor".into())
            .spawn(move || consumer.run())
            .expect("spawning the event processor thread");
        Self {
            sender,
            handle: Mutex::new(Some(handle)),
        }
    }

    /// Enqueue an event. Never blocks: with the queue full the event is
    /// dropped and the loss logged.
    pub fn process(&self, event: UserEvent) {
        match self.sender.try_send(Signal::Event(Box::new(event))) {
            Ok(()) => (),
            Err(TrySendError::Full(_)) => warn!("{}", CumulusError::QueueFull),
            Err(TrySendError::Disconnected(_)) => warn!("{}", CumulusError::ProcessorShutDown),
        }
    }

    /// Ask the consumer to flush whatever batch it has accumulated.
    pub fn flush(&self) {
        if self.sender.try_send(Signal::Flush).is_err() {
            debug!("Could not enqueue a flush signal");
        }
    }

    /// Drain the queue (bounded by `timeout`), flush remaining events and
    /// join the background thread. Idempotent.
    pub fn close(&self, timeout: Duration) {
        let Some(handle) = self.handle.lock().unwrap().take() else {
            return;
        };
        let deadline = Instant::now() + timeout;
        if self
            .sender
            .send_timeout(Signal::Shutdown(deadline), timeout)
            .is_err()
        {
            warn!("Could not signal the event processor to shut down");
        }
        if handle.join().is_err() {
            warn!("The event processor thread panicked");
        }
    }
}

impl Drop for BatchEventProcessor {
    fn drop(&mut self) {
        self.close(DEFAULT_SHUTDOWN_TIMEOUT);
    }
}

struct Consumer {
    receiver: Receiver<Signal>,
    dispatcher: Arc<dyn EventDispatcher>,
    config: BatchConfig,
    on_flush: Option<FlushHook>,
    batch: Vec<UserEvent>,
    // Set when the batch is non-empty: first-event time + flush interval.
    deadline: Option<Instant>,
}

impl Consumer {
    fn run(mut self) {
        loop {
            let signal = match self.deadline {
                Some(deadline) => match self.receiver.recv_deadline(deadline) {
                    Ok(signal) => signal,
                    Err(RecvTimeoutError::Timeout) => {
                        self.flush();
                        continue;
                    }
                    Err(RecvTimeoutError::Disconnected) => break,
                },
                None => match self.receiver.recv() {
                    Ok(signal) => signal,
                    Err(_) => break,
                },
            };
            match signal {
                Signal::Event(event) => self.accept(*event),
                Signal::Flush => self.flush(),
                Signal::Shutdown(drain_deadline) => {
                    self.drain(drain_deadline);
                    self.flush();
                    return;
                }
            }
        }
        // All senders vanished; whatever is left still goes out.
        self.flush();
    }

    fn accept(&mut self, event: UserEvent) {
        if let Some(first) = self.batch.first() {
            // A batch only ever carries one (account, project, revision,
            // anonymize-ip) header.
            if first.context() != event.context() {
                debug!("Event context changed, flushing the current batch");
                self.flush();
            }
        }
        if self.batch.is_empty() {
            self.deadline = Some(Instant::now() + self.config.flush_interval);
        }
        self.batch.push(event);
        if self.batch.len() >= self.config.batch_size {
            self.flush();
        }
    }

    fn drain(&mut self, deadline: Instant) {
        while Instant::now() < deadline {
            match self.receiver.try_recv() {
                Ok(Signal::Event(event)) => self.accept(*event),
                Ok(Signal::Flush) => self.flush(),
                Ok(Signal::Shutdown(_)) => (),
                Err(_) => break,
            }
        }
    }

    fn flush(&mut self) {
        self.deadline = None;
        if self.batch.is_empty() {
            return;
        }
        let events = std::mem::take(&mut self.batch);
        let Some(params) = build_batch(&events) else {
            return;
        };
        let log_event = LogEvent {
            url: self.config.endpoint.to_string(),
            params,
        };
        if let Some(hook) = &self.on_flush {
            hook(&log_event);
        }
        debug!("Dispatching a batch of {} events", events.len());
        if let Err(e) = self.dispatcher.dispatch_event(log_event) {
            warn!("Dispatching a batch of {} events failed: {}", events.len(), e);
        }
    }
}
