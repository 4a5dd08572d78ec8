// Copyright 2025 Kore Ledger, SL
// SPDX-License-Identifier: Apache-2.0

//! Subscription tests against an in-memory data source.

use client::{
    DataSource, Error, Event, EventKind, Executor, GpClient, ListenerScope,
    ReadExpressionExt, ReadSource, ReadSubscription, ScanMode, Task, Value, WriteCallback,
    WriteSubscription, channel, channels, now, queue,
};
use tokio::time::{Duration, sleep};
use tracing_test::traced_test;

use std::{
    collections::{HashMap, HashSet},
    sync::{
        Arc, Mutex,
        atomic::{AtomicUsize, Ordering},
    },
};

/// Data source driven by the test.
#[derive(Default)]
struct FakeSource {
    reads: Mutex<HashMap<String, Vec<ReadSubscription>>>,
    written: Arc<Mutex<Vec<(String, Value)>>>,
    failing: Arc<Mutex<HashSet<String>>>,
}

impl FakeSource {
    fn subscriptions(&self, channel: &str) -> Vec<ReadSubscription> {
        self.reads
            .lock()
            .unwrap()
            .get(channel)
            .cloned()
            .unwrap_or_default()
    }

    fn publish(&self, channel: &str, value: Value) {
        for subscription in self.subscriptions(channel) {
            subscription.collector().update_value(value.clone());
        }
    }

    fn connect(&self, channel: &str, value: Value) {
        for subscription in self.subscriptions(channel) {
            subscription
                .collector()
                .update_value_and_connection(value.clone(), true);
        }
    }

    fn set_connected(&self, channel: &str, connected: bool) {
        for subscription in self.subscriptions(channel) {
            subscription.collector().update_connection(connected);
        }
    }

    fn readers(&self, channel: &str) -> usize {
        self.subscriptions(channel).len()
    }
}

impl DataSource for FakeSource {
    fn start_read(&self, subscription: ReadSubscription) -> Result<(), Error> {
        self.reads
            .lock()
            .unwrap()
            .entry(subscription.channel().to_owned())
            .or_default()
            .push(subscription);
        Ok(())
    }

    fn stop_read(&self, subscription: &ReadSubscription) {
        if let Some(list) =
            self.reads.lock().unwrap().get_mut(subscription.channel())
        {
            list.retain(|s| !s.same_collector(subscription));
        }
    }

    fn start_write(&self, subscription: WriteSubscription) -> Result<(), Error> {
        let channel = subscription.channel().to_owned();
        let written = self.written.clone();
        let failing = self.failing.clone();
        subscription.collector().set_write_handler(Some(Arc::new(
            move |value: Value, callback: WriteCallback| {
                if failing.lock().unwrap().contains(&channel) {
                    callback(Event::write_failed(Error::Write(format!(
                        "{} refused",
                        channel
                    ))));
                } else {
                    written.lock().unwrap().push((channel.clone(), value));
                    callback(Event::write_succeeded());
                }
            },
        )));
        subscription.collector().update_connection(true);
        Ok(())
    }

    fn stop_write(&self, subscription: &WriteSubscription) {
        subscription.collector().set_write_handler(None);
    }
}

/// Executor holding tasks until the test releases them.
#[derive(Default)]
struct GateExecutor {
    tasks: Mutex<Vec<Task>>,
}

impl GateExecutor {
    fn release(&self) -> usize {
        let tasks = std::mem::take(&mut *self.tasks.lock().unwrap());
        let count = tasks.len();
        for task in tasks {
            task();
        }
        count
    }
}

impl Executor for GateExecutor {
    fn execute(&self, task: Task) {
        self.tasks.lock().unwrap().push(task);
    }
}

type Recorded = Arc<Mutex<Vec<Event>>>;

fn recorded() -> (Recorded, Recorded) {
    let events = Arc::new(Mutex::new(Vec::new()));
    (events.clone(), events)
}

fn client(source: &Arc<FakeSource>) -> GpClient {
    GpClient::builder()
        .data_source(source.clone())
        .max_rate(Duration::from_millis(50))
        .build()
        .unwrap()
}

#[tokio::test(start_paused = true)]
async fn test_burst_is_coalesced() {
    let source = Arc::new(FakeSource::default());
    let client = client(&source);
    let (events, sink) = recorded();
    let pv = client
        .read(channel("a"))
        .add_listener(move |event, _| sink.lock().unwrap().push(event.clone()))
        .start()
        .unwrap();

    source.connect("a", Value::Int(0));
    sleep(Duration::from_millis(100)).await;
    assert_eq!(
        *events.lock().unwrap(),
        vec![Event::read_connection_and_value()]
    );

    for i in 1..=5 {
        source.publish("a", Value::Int(i));
        sleep(Duration::from_millis(2)).await;
    }
    sleep(Duration::from_millis(100)).await;
    {
        let events = events.lock().unwrap();
        assert_eq!(events.len(), 2);
        assert_eq!(events[1], Event::value());
    }
    assert_eq!(pv.value(), Some(Some(Value::Int(5))));
    assert!(pv.is_connected());
    pv.close();
}

#[tokio::test(start_paused = true)]
async fn test_repeated_value_is_not_notified() {
    let source = Arc::new(FakeSource::default());
    let client = client(&source);
    let (events, sink) = recorded();
    let pv = client
        .read(channel("a"))
        .add_listener(move |event, _| sink.lock().unwrap().push(event.clone()))
        .start()
        .unwrap();

    source.connect("a", Value::Int(1));
    sleep(Duration::from_millis(100)).await;
    source.publish("a", Value::Int(1));
    sleep(Duration::from_millis(100)).await;
    source.set_connected("a", true);
    sleep(Duration::from_millis(100)).await;
    assert_eq!(events.lock().unwrap().len(), 1);
    pv.close();
}

#[tokio::test(start_paused = true)]
async fn test_aggregate_connection() {
    let source = Arc::new(FakeSource::default());
    let client = client(&source);
    let (events, sink) = recorded();
    let pv = client
        .read(channels(&["a", "b"]))
        .add_read_listener(move |event, _| sink.lock().unwrap().push(event.clone()))
        .start()
        .unwrap();

    source.connect("a", Value::Int(1));
    sleep(Duration::from_millis(100)).await;
    assert!(!pv.is_connected());
    source.connect("b", Value::Int(2));
    sleep(Duration::from_millis(100)).await;
    assert!(pv.is_connected());
    assert_eq!(
        pv.value(),
        Some(vec![Some(Value::Int(1)), Some(Value::Int(2))])
    );

    let before = events.lock().unwrap().len();
    source.set_connected("a", false);
    source.set_connected("b", false);
    sleep(Duration::from_millis(100)).await;
    let events = events.lock().unwrap();
    assert_eq!(events.len(), before + 1);
    assert_eq!(events[before], Event::read_connection());
    assert!(!pv.is_connected());
}

#[tokio::test]
async fn test_write_and_wait_reports_failure() {
    let source = Arc::new(FakeSource::default());
    source.failing.lock().unwrap().insert("y".to_owned());
    let client = client(&source);
    let pv = client.write(channels(&["x", "y", "z"])).start().unwrap();

    let result = pv
        .write_and_wait(vec![Value::Int(1), Value::Int(2), Value::Int(3)])
        .await;
    assert_eq!(result, Err(Error::Write("y refused".to_owned())));
    // Channels after the failing one are left untouched.
    assert_eq!(
        *source.written.lock().unwrap(),
        vec![("x".to_owned(), Value::Int(1))]
    );

    source.failing.lock().unwrap().clear();
    pv.write_and_wait(vec![Value::Int(4), Value::Int(5), Value::Int(6)])
        .await
        .unwrap();
    let written = source.written.lock().unwrap().clone();
    assert!(written.contains(&("y".to_owned(), Value::Int(5))));
    assert!(!written.contains(&("y".to_owned(), Value::Int(2))));

    // Length mismatch fails in the write function.
    let result = pv.write_and_wait(vec![Value::Int(1)]).await;
    assert!(matches!(result, Err(Error::Write(_))));
    pv.close();
}

#[tokio::test]
async fn test_write_outcome_reaches_listeners() {
    let source = Arc::new(FakeSource::default());
    let client = client(&source);
    let (events, sink) = recorded();
    let pv = client
        .read_and_write(channel("w"))
        .add_write_listener(move |event, _| sink.lock().unwrap().push(event.clone()))
        .start()
        .unwrap();

    pv.write(Value::Double(1.5)).unwrap();
    let (sender, receiver) = tokio::sync::oneshot::channel();
    pv.write_with(Value::Double(2.5), move |event| {
        let _ = sender.send(event);
    })
    .unwrap();
    assert_eq!(receiver.await.unwrap(), Event::write_succeeded());
    sleep(Duration::from_millis(50)).await;

    let events = events.lock().unwrap();
    assert!(events.contains(&Event::write_succeeded()));
    assert!(events.iter().all(|event| event.kinds().iter().all(|k| k.is_write())));
    assert_eq!(
        *source.written.lock().unwrap(),
        vec![
            ("w".to_owned(), Value::Double(1.5)),
            ("w".to_owned(), Value::Double(2.5))
        ]
    );
}

#[tokio::test]
async fn test_read_only_subscription_rejects_writes() {
    let source = Arc::new(FakeSource::default());
    let client = client(&source);
    let pv = client.read(channel("r")).start().unwrap();
    assert_eq!(pv.write(()), Err(Error::ReadOnly));
    pv.close();
    assert_eq!(pv.write(()), Err(Error::Closed));
}

#[tokio::test(start_paused = true)]
async fn test_pause_delivers_at_most_one_stray_notification() {
    let source = Arc::new(FakeSource::default());
    let client = client(&source);
    let gate = Arc::new(GateExecutor::default());
    let (events, sink) = recorded();
    let pv = client
        .read(channel("p"))
        .notify_on(gate.clone())
        .add_listener(move |event, _| sink.lock().unwrap().push(event.clone()))
        .start()
        .unwrap();

    source.connect("p", Value::Int(1));
    sleep(Duration::from_millis(10)).await;
    // In flight, held by the gate.
    pv.set_paused(true);
    assert!(pv.is_paused());
    assert_eq!(gate.release(), 1);
    assert_eq!(events.lock().unwrap().len(), 1);

    for i in 2..10 {
        source.publish("p", Value::Int(i));
        sleep(Duration::from_millis(20)).await;
    }
    sleep(Duration::from_millis(200)).await;
    assert_eq!(gate.release(), 0);
    assert_eq!(events.lock().unwrap().len(), 1);

    pv.set_paused(false);
    sleep(Duration::from_millis(10)).await;
    assert_eq!(gate.release(), 1);
    assert_eq!(events.lock().unwrap().len(), 2);
    assert_eq!(pv.value(), Some(Some(Value::Int(9))));

    // Normal throttled delivery afterwards.
    source.publish("p", Value::Int(10));
    sleep(Duration::from_millis(100)).await;
    assert_eq!(gate.release(), 1);
    assert_eq!(pv.value(), Some(Some(Value::Int(10))));
    pv.close();
}

#[tokio::test(start_paused = true)]
async fn test_read_error_is_notified_once() {
    let source = Arc::new(FakeSource::default());
    let client = client(&source);
    let (events, sink) = recorded();
    let pv = client
        .read(channel("e").try_map(|value| match value {
            Some(Value::Int(i)) if i >= 0 => Ok(i),
            _ => Err(Error::Read("negative".to_owned())),
        }))
        .add_listener(move |event, _| sink.lock().unwrap().push(event.clone()))
        .start()
        .unwrap();

    source.connect("e", Value::Int(3));
    sleep(Duration::from_millis(100)).await;
    source.publish("e", Value::Int(-1));
    sleep(Duration::from_millis(100)).await;
    source.publish("e", Value::Int(-2));
    sleep(Duration::from_millis(100)).await;

    let events = events.lock().unwrap();
    assert_eq!(events.len(), 2);
    assert_eq!(events[1], Event::exception(Error::Read("negative".to_owned())));
    assert_eq!(pv.value(), Some(3));
}

#[tokio::test(start_paused = true)]
#[traced_test]
async fn test_panicking_read_function_releases_scheduler() {
    let source = Arc::new(FakeSource::default());
    let client = client(&source);
    let pv = client
        .read(channel("x").map(|value| match value {
            Some(Value::Int(0)) => panic!("division by zero"),
            other => other,
        }))
        .start()
        .unwrap();

    source.connect("x", Value::Int(0));
    sleep(Duration::from_millis(100)).await;
    assert!(logs_contain("Read function panicked"));
    assert_eq!(pv.value(), None);

    source.publish("x", Value::Int(1));
    sleep(Duration::from_millis(100)).await;
    assert_eq!(pv.value(), Some(Some(Value::Int(1))));
}

#[tokio::test(start_paused = true)]
async fn test_exception_handler_runs_per_error() {
    let source = Arc::new(FakeSource::default());
    let client = client(&source);
    let errors = Arc::new(AtomicUsize::new(0));
    let counter = errors.clone();
    let pv = client
        .read(channel("missing"))
        .on_exception(move |_error| {
            counter.fetch_add(1, Ordering::SeqCst);
        })
        .connection_timeout(Duration::from_millis(30), "missing")
        .start()
        .unwrap();
    sleep(Duration::from_millis(100)).await;
    assert_eq!(errors.load(Ordering::SeqCst), 1);
    pv.close();
}

#[tokio::test(start_paused = true)]
async fn test_timeout_is_retracted_on_connection() {
    let source = Arc::new(FakeSource::default());
    let client = client(&source);
    let (events, sink) = recorded();
    let pv = client
        .read(channel("slow"))
        .connection_timeout(Duration::from_millis(200), "slow not connected")
        .add_listener(move |event, _| sink.lock().unwrap().push(event.clone()))
        .start()
        .unwrap();

    sleep(Duration::from_millis(300)).await;
    assert_eq!(
        *events.lock().unwrap(),
        vec![Event::exception(Error::Timeout("slow not connected".to_owned()))]
    );

    source.connect("slow", Value::Text("up".to_owned()));
    sleep(Duration::from_millis(100)).await;
    let events = events.lock().unwrap();
    assert_eq!(events.len(), 2);
    assert_eq!(events[1], Event::read_connection_and_value());
    assert!(pv.is_connected());
}

#[tokio::test(start_paused = true)]
async fn test_timeout_not_fired_when_connected() {
    let source = Arc::new(FakeSource::default());
    let client = client(&source);
    let (events, sink) = recorded();
    let _pv = client
        .read(channel("fast"))
        .connection_timeout(Duration::from_millis(200), "fast not connected")
        .add_listener(move |event, _| sink.lock().unwrap().push(event.clone()))
        .start()
        .unwrap();
    source.connect("fast", Value::Bool(true));
    sleep(Duration::from_millis(500)).await;
    assert!(
        events
            .lock()
            .unwrap()
            .iter()
            .all(|event| !event.is_kind(EventKind::Exception))
    );
}

#[tokio::test(start_paused = true)]
#[traced_test]
async fn test_dropped_handle_is_closed() {
    let source = Arc::new(FakeSource::default());
    let client = client(&source);
    let pv = client.read(channel("leak")).start().unwrap();
    assert_eq!(client.open_subscriptions(), 1);
    drop(pv);

    source.connect("leak", Value::Int(1));
    sleep(Duration::from_millis(100)).await;
    assert!(logs_contain("was dropped without being closed"));
    assert!(logs_contain("subscription_tests.rs"));
    assert_eq!(client.open_subscriptions(), 0);
    assert_eq!(source.readers("leak"), 0);
}

#[tokio::test]
async fn test_client_close_closes_everything() {
    let source = Arc::new(FakeSource::default());
    let client = client(&source);
    let first = client.read(channel("a")).start().unwrap();
    let second = client.read(queue("b")).start().unwrap();
    assert_eq!(source.readers("a"), 1);
    assert_eq!(source.readers("b"), 1);

    client.close();
    assert!(first.is_closed());
    assert!(second.is_closed());
    assert_eq!(source.readers("a"), 0);
    assert_eq!(source.readers("b"), 0);
    assert_eq!(client.open_subscriptions(), 0);
    assert!(matches!(
        client.read(channel("c")).start(),
        Err(Error::Closed)
    ));
}

#[tokio::test(start_paused = true)]
async fn test_listeners_in_order_and_isolated() {
    let source = Arc::new(FakeSource::default());
    let client = client(&source);
    let order = Arc::new(Mutex::new(Vec::new()));
    let pv = client.read(channel("l")).start().unwrap();

    let first = order.clone();
    pv.add_listener(move |_event, _pv| {
        first.lock().unwrap().push("first");
        panic!("listener failure");
    });
    let second = order.clone();
    let removed = pv.add_listener(move |_event, _pv| {
        second.lock().unwrap().push("second");
    });
    let third = order.clone();
    pv.add_scoped_listener(
        ListenerScope::Write,
        Arc::new(move |_event, _pv| third.lock().unwrap().push("write")),
    );

    source.connect("l", Value::Int(1));
    sleep(Duration::from_millis(100)).await;
    assert_eq!(*order.lock().unwrap(), vec!["first", "second"]);

    assert!(pv.remove_listener(removed));
    assert!(!pv.remove_listener(removed));
    source.publish("l", Value::Int(2));
    sleep(Duration::from_millis(100)).await;
    assert_eq!(*order.lock().unwrap(), vec!["first", "second", "first"]);
}

#[tokio::test(start_paused = true)]
async fn test_queue_delivers_every_value() {
    let source = Arc::new(FakeSource::default());
    let client = client(&source);
    let received = Arc::new(Mutex::new(Vec::new()));
    let sink = received.clone();
    let _pv = client
        .read(queue("q"))
        .add_read_listener(move |event, pv| {
            if event.is_kind(EventKind::Value) {
                sink.lock().unwrap().extend(pv.value().unwrap_or_default());
            }
        })
        .start()
        .unwrap();

    for i in 0..20 {
        source.publish("q", Value::Int(i));
        sleep(Duration::from_millis(7)).await;
    }
    sleep(Duration::from_millis(100)).await;
    let expected: Vec<Value> = (0..20).map(Value::Int).collect();
    assert_eq!(*received.lock().unwrap(), expected);
}

#[tokio::test(start_paused = true)]
async fn test_queue_delivers_repeated_values() {
    let source = Arc::new(FakeSource::default());
    let client = client(&source);
    let received = Arc::new(Mutex::new(Vec::new()));
    let sink = received.clone();
    let _pv = client
        .read(queue("q"))
        .add_read_listener(move |event, pv| {
            if event.is_kind(EventKind::Value) {
                sink.lock().unwrap().extend(pv.value().unwrap_or_default());
            }
        })
        .start()
        .unwrap();

    // One equal batch per notification window.
    for _ in 0..3 {
        source.publish("q", Value::Int(7));
        sleep(Duration::from_millis(100)).await;
    }
    assert_eq!(*received.lock().unwrap(), vec![Value::Int(7); 3]);
}

#[tokio::test(start_paused = true)]
async fn test_time_dependent_expression_is_sampled() {
    let source = Arc::new(FakeSource::default());
    let client = client(&source);
    let (events, sink) = recorded();
    let pv = client
        .read(now())
        .max_rate(Duration::from_millis(100))
        .add_read_listener(move |event, _| sink.lock().unwrap().push(event.clone()))
        .start()
        .unwrap();
    sleep(Duration::from_millis(350)).await;
    pv.close();
    assert!(events.lock().unwrap().len() >= 3);
}

#[tokio::test(start_paused = true)]
async fn test_forced_active_scan() {
    let source = Arc::new(FakeSource::default());
    let client = client(&source);
    let pv = client
        .read(channel("s"))
        .scan_mode(ScanMode::Active)
        .start()
        .unwrap();
    assert_eq!(pv.director().decoupler().max_duration(), Duration::from_millis(50));
    source.connect("s", Value::Int(4));
    sleep(Duration::from_millis(120)).await;
    assert_eq!(pv.value(), Some(Some(Value::Int(4))));
    pv.close();
}

#[tokio::test]
async fn test_configuration_errors() {
    let source = Arc::new(FakeSource::default());
    assert!(matches!(
        GpClient::builder().build(),
        Err(Error::Config(_))
    ));
    assert!(matches!(
        GpClient::builder()
            .data_source(source.clone())
            .max_rate(Duration::from_millis(1))
            .build(),
        Err(Error::Config(_))
    ));
    let client = client(&source);
    assert!(matches!(
        client
            .read(channel("a"))
            .max_rate(Duration::from_millis(4))
            .start(),
        Err(Error::Config(_))
    ));
    assert_eq!(client.open_subscriptions(), 0);
}

#[tokio::test(start_paused = true)]
async fn test_dynamic_expression() {
    let source = Arc::new(FakeSource::default());
    let client = client(&source);
    let pv = client.read(channel("main")).start().unwrap();
    let extra: Arc<dyn ReadSource> = Arc::new(channel("extra"));
    pv.director().context().connect_read_expression(extra.clone());
    assert_eq!(source.readers("extra"), 1);

    // The extra channel counts towards the connection.
    source.connect("main", Value::Int(1));
    sleep(Duration::from_millis(100)).await;
    assert!(!pv.is_connected());

    pv.director().context().disconnect_read_expression(&extra);
    assert_eq!(source.readers("extra"), 0);
    source.set_connected("main", true);
    source.publish("main", Value::Int(2));
    sleep(Duration::from_millis(100)).await;
    assert!(pv.is_connected());
    pv.close();
}
