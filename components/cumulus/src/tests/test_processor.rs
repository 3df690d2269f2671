/* This Source Code Form is subject to the terms of the Mozilla Public
* License, v. 2.0. If a copy of the MPL was not distributed with this
* file, You can obtain one at https://mozilla.org/MPL/2.0/. */

use crate::events::{ConversionEvent, EventContext, UserEvent};
use crate::processor::{BatchConfig, BatchEventProcessor, EventDispatcher, LogEvent};
use crate::tests::helpers::CollectingDispatcher;
use serde_json::Map;
use std::sync::Arc;
use std::time::{Duration, Instant};

fn test_context(revision: &str) -> EventContext {
    EventContext {
        account_id: "12001".to_string(),
        project_id: "10001".to_string(),
        revision: revision.to_string(),
        anonymize_ip: true,
    }
}

fn conversion(revision: &str, user_id: &str) -> UserEvent {
    UserEvent::Conversion(ConversionEvent {
        context: test_context(revision),
        user_id: user_id.to_string(),
        attributes: Vec::new(),
        event_id: "77701".to_string(),
        event_key: "purchase".to_string(),
        tags: Map::new(),
        revenue: None,
        value: None,
        timestamp: 12345,
        uuid: "5f2fdc82-4cb2-42ba-9dbc-4a9e99a11e18".to_string(),
    })
}

fn small_batch_config() -> BatchConfig {
    BatchConfig {
        batch_size: 3,
        flush_interval: Duration::from_secs(60),
        queue_capacity: 16,
        ..Default::default()
    }
}

#[test]
fn test_flush_on_batch_size() {
    let dispatcher = Arc::new(CollectingDispatcher::default());
    let processor = BatchEventProcessor::new(
        Arc::clone(&dispatcher) as Arc<dyn EventDispatcher>,
        small_batch_config(),
        None,
    );
    for i in 0..7 {
        processor.process(conversion("42", &format!("u{}", i)));
    }
    processor.close(Duration::from_secs(5));

    let batches = dispatcher.events.lock().unwrap();
    // Two full batches of three plus the shutdown flush of the remainder.
    let sizes: Vec<usize> = batches.iter().map(|b| b.params.visitors.len()).collect();
    assert_eq!(sizes, vec![3, 3, 1]);
    let total: usize = sizes.iter().sum();
    assert_eq!(total, 7);
}

#[test]
fn test_flush_on_interval() {
    let dispatcher = Arc::new(CollectingDispatcher::default());
    let processor = BatchEventProcessor::new(
        Arc::clone(&dispatcher) as Arc<dyn EventDispatcher>,
        BatchConfig {
            batch_size: 100,
            flush_interval: Duration::from_millis(50),
            queue_capacity: 16,
            ..Default::default()
        },
        None,
    );
    processor.process(conversion("42", "u1"));

    // Wait for the interval flush without shutting down.
    let deadline = Instant::now() + Duration::from_secs(5);
    loop {
        if !dispatcher.events.lock().unwrap().is_empty() {
            break;
        }
        assert!(Instant::now() < deadline, "interval flush never happened");
        std::thread::sleep(Duration::from_millis(10));
    }
    processor.close(Duration::from_secs(5));
    assert_eq!(dispatcher.events.lock().unwrap().len(), 1);
}

#[test]
fn test_explicit_flush_signal() {
    let dispatcher = Arc::new(CollectingDispatcher::default());
    let processor = BatchEventProcessor::new(
        Arc::clone(&dispatcher) as Arc<dyn EventDispatcher>,
        small_batch_config(),
        None,
    );
    processor.process(conversion("42", "u1"));
    processor.flush();

    let deadline = Instant::now() + Duration::from_secs(5);
    while dispatcher.events.lock().unwrap().is_empty() {
        assert!(Instant::now() < deadline, "flush signal never flushed");
        std::thread::sleep(Duration::from_millis(10));
    }
    processor.close(Duration::from_secs(5));
    let batches = dispatcher.events.lock().unwrap();
    assert_eq!(batches.len(), 1);
    assert_eq!(batches[0].params.visitors.len(), 1);
}

#[test]
fn test_revision_change_splits_batches() {
    let dispatcher = Arc::new(CollectingDispatcher::default());
    let processor = BatchEventProcessor::new(
        Arc::clone(&dispatcher) as Arc<dyn EventDispatcher>,
        small_batch_config(),
        None,
    );
    processor.process(conversion("42", "u1"));
    processor.process(conversion("42", "u2"));
    // A new datafile revision arrives mid-stream.
    processor.process(conversion("43", "u3"));
    processor.close(Duration::from_secs(5));

    let batches = dispatcher.events.lock().unwrap();
    assert_eq!(batches.len(), 2);
    assert_eq!(batches[0].params.revision, "42");
    assert_eq!(batches[0].params.visitors.len(), 2);
    assert_eq!(batches[1].params.revision, "43");
    assert_eq!(batches[1].params.visitors.len(), 1);
}

#[test]
fn test_full_queue_drops_without_blocking() {
    struct BlockedDispatcher;
    impl EventDispatcher for BlockedDispatcher {
        fn dispatch_event(&self, _event: LogEvent) -> crate::error::Result<()> {
            Ok(())
        }
    }
    let processor = BatchEventProcessor::new(
        Arc::new(BlockedDispatcher),
        BatchConfig {
            batch_size: 1000,
            flush_interval: Duration::from_secs(60),
            queue_capacity: 2,
            ..Default::default()
        },
        None,
    );
    // Far more events than the queue holds; the producer must not block.
    let started = Instant::now();
    for i in 0..1000 {
        processor.process(conversion("42", &format!("u{}", i)));
    }
    assert!(started.elapsed() < Duration::from_secs(2));
    processor.close(Duration::from_secs(5));
}

#[test]
fn test_close_flushes_everything_queued() {
    let dispatcher = Arc::new(CollectingDispatcher::default());
    let processor = BatchEventProcessor::new(
        Arc::clone(&dispatcher) as Arc<dyn EventDispatcher>,
        BatchConfig {
            batch_size: 100,
            flush_interval: Duration::from_secs(60),
            queue_capacity: 64,
            ..Default::default()
        },
        None,
    );
    for i in 0..5 {
        processor.process(conversion("42", &format!("u{}", i)));
    }
    processor.close(Duration::from_secs(5));
    let total: usize = dispatcher
        .events
        .lock()
        .unwrap()
        .iter()
        .map(|b| b.params.visitors.len())
        .sum();
    assert_eq!(total, 5);
}

#[test]
fn test_flush_hook_sees_every_payload() {
    let dispatcher = Arc::new(CollectingDispatcher::default());
    let seen = Arc::new(std::sync::Mutex::new(Vec::new()));
    let hook_seen = Arc::clone(&seen);
    let processor = BatchEventProcessor::new(
        Arc::clone(&dispatcher) as Arc<dyn EventDispatcher>,
        small_batch_config(),
        Some(Box::new(move |log_event: &LogEvent| {
            hook_seen.lock().unwrap().push(log_event.url.clone());
        })),
    );
    for i in 0..4 {
        processor.process(conversion("42", &format!("u{}", i)));
    }
    processor.close(Duration::from_secs(5));
    assert_eq!(seen.lock().unwrap().len(), 2);
    assert_eq!(
        dispatcher.events.lock().unwrap().len(),
        seen.lock().unwrap().len()
    );
}
