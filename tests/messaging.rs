//! Messaging runtime integration tests.
//!
//! Every test binds loopback ports, so tests run serially and each one uses
//! its own port offset.
//! Run with: cargo test --test messaging

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use crossbeam_channel::Receiver;
use serial_test::serial;

use telebus::bus::{
    BusError, ChannelMode, ChannelProducer, ChannelType, Envelope, MessagingRuntime, PortLayout,
};
use telebus::config::Config;

// ============================================================================
// Test Fixtures
// ============================================================================

fn runtime(offset: u16) -> MessagingRuntime {
    MessagingRuntime::new(Config::for_test(offset).unwrap().messaging)
}

fn wait_until(timeout: Duration, condition: impl Fn() -> bool) -> bool {
    let deadline = Instant::now() + timeout;
    while Instant::now() < deadline {
        if condition() {
            return true;
        }
        thread::sleep(Duration::from_millis(10));
    }
    condition()
}

fn has_socket(runtime: &MessagingRuntime, mode: ChannelMode, channel_type: ChannelType) -> bool {
    runtime
        .live_sockets()
        .iter()
        .any(|entry| entry.mode == mode && entry.channel_type == channel_type)
}

/// Keeps publishing `payload` until stopped, so subscription propagation
/// through the broker cannot make the test flaky.
struct RepeatingPublisher {
    stop: Arc<AtomicBool>,
    handle: Option<thread::JoinHandle<()>>,
}

impl RepeatingPublisher {
    fn start(writer: crossbeam_channel::Sender<String>, payload: &str) -> Self {
        let stop = Arc::new(AtomicBool::new(false));
        let flag = Arc::clone(&stop);
        let payload = payload.to_string();
        let handle = thread::spawn(move || {
            while !flag.load(Ordering::SeqCst) {
                if writer.send(payload.clone()).is_err() {
                    break;
                }
                thread::sleep(Duration::from_millis(50));
            }
        });
        Self {
            stop,
            handle: Some(handle),
        }
    }
}

impl Drop for RepeatingPublisher {
    fn drop(&mut self) {
        self.stop.store(true, Ordering::SeqCst);
        if let Some(handle) = self.handle.take() {
            let _ = handle.join();
        }
    }
}

fn first_envelope(reader: &Receiver<Envelope>) -> Envelope {
    reader
        .recv_timeout(Duration::from_secs(3))
        .expect("no message delivered")
}

fn echo_until_closed(requests: Receiver<String>, responses: crossbeam_channel::Sender<String>) {
    thread::spawn(move || {
        for request in requests.iter() {
            if responses.send(format!("reply:{request}")).is_err() {
                break;
            }
        }
    });
}

// ============================================================================
// Publish / subscribe
// ============================================================================

#[test]
#[serial]
fn test_round_trip_through_broker() {
    let runtime = runtime(23000);
    let _broker = runtime.run_broker(ChannelType::Counters).unwrap();
    let (reader, _closer) = runtime
        .open_subscribe_channel(ChannelType::Counters, ChannelProducer::Plugin, "disk")
        .unwrap();
    let writer = runtime
        .open_publish_channel(ChannelType::Counters, ChannelProducer::Plugin, "disk")
        .unwrap();

    let publisher = RepeatingPublisher::start(writer, r#"{"util":42}"#);
    let envelope = first_envelope(&reader);
    drop(publisher);

    assert_eq!(envelope.topic, "Plugin/disk");
    assert_eq!(envelope.payload, r#"{"util":42}"#);
    assert!(runtime.shutdown(Duration::from_secs(3)));
}

#[test]
#[serial]
fn test_subscriber_started_before_broker() {
    let runtime = runtime(23100);
    let (reader, _closer) = runtime
        .open_subscribe_channel(ChannelType::Events, ChannelProducer::Engine, "")
        .unwrap();
    let writer = runtime
        .open_publish_channel(ChannelType::Events, ChannelProducer::Engine, "ignored")
        .unwrap();
    thread::sleep(Duration::from_millis(100));
    let _broker = runtime.run_broker(ChannelType::Events).unwrap();

    let publisher = RepeatingPublisher::start(writer, "fault");
    let envelope = first_envelope(&reader);
    drop(publisher);

    assert_eq!(envelope.topic, "Engine/");
    assert_eq!(envelope.payload, "fault");
    assert!(runtime.shutdown(Duration::from_secs(3)));
}

#[test]
#[serial]
fn test_topic_filter_excludes_other_producers() {
    let runtime = runtime(23200);
    let _broker = runtime.run_broker(ChannelType::RedButton).unwrap();
    let (reader, _closer) = runtime
        .open_subscribe_channel(ChannelType::RedButton, ChannelProducer::Engine, "")
        .unwrap();
    let writer = runtime
        .open_publish_channel(ChannelType::RedButton, ChannelProducer::Other, "cli")
        .unwrap();

    let publisher = RepeatingPublisher::start(writer, "stop");
    assert!(reader.recv_timeout(Duration::from_millis(400)).is_err());
    drop(publisher);
    assert!(runtime.shutdown(Duration::from_secs(3)));
}

#[test]
#[serial]
fn test_single_publish_is_delivered_exactly_once() {
    let runtime = runtime(24500);
    let _broker = runtime.run_broker(ChannelType::Counters).unwrap();
    let (reader, _closer) = runtime
        .open_subscribe_channel(ChannelType::Counters, ChannelProducer::Plugin, "disk")
        .unwrap();
    let writer = runtime
        .open_publish_channel(ChannelType::Counters, ChannelProducer::Plugin, "disk")
        .unwrap();

    // Past the connect-settle delay, so the subscription has reached the publisher.
    thread::sleep(Duration::from_millis(300));
    writer.send(r#"{"util":42}"#.to_string()).unwrap();

    let envelope = first_envelope(&reader);
    assert_eq!(envelope.topic, "Plugin/disk");
    assert_eq!(envelope.payload, r#"{"util":42}"#);
    assert!(reader.recv_timeout(Duration::from_millis(300)).is_err());
    assert!(runtime.shutdown(Duration::from_secs(3)));
}

#[test]
#[serial]
fn test_empty_filter_receives_every_producer() {
    let runtime = runtime(24600);
    let _broker = runtime.run_broker(ChannelType::Events).unwrap();
    let (reader, _closer) = runtime
        .open_subscribe_channel(ChannelType::Events, ChannelProducer::Empty, "")
        .unwrap();
    let writer = runtime
        .open_publish_channel(ChannelType::Events, ChannelProducer::Plugin, "x")
        .unwrap();

    let publisher = RepeatingPublisher::start(writer, "up");
    let envelope = first_envelope(&reader);
    drop(publisher);

    assert_eq!(envelope.topic, "Plugin/x");
    assert_eq!(envelope.payload, "up");
    assert!(runtime.shutdown(Duration::from_secs(3)));
}

#[test]
#[serial]
fn test_raw_publisher_interoperates() {
    let runtime = runtime(23300);
    let _broker = runtime.run_broker(ChannelType::Events).unwrap();
    let (reader, _closer) = runtime
        .open_subscribe_channel(ChannelType::Events, ChannelProducer::PluginMgr, "inst-1")
        .unwrap();

    // A foreign process only knows the address formula and the two-frame layout.
    let context = zmq::Context::new();
    let publisher = context.socket(zmq::PUB).unwrap();
    publisher.set_linger(0).unwrap();
    publisher
        .connect(
            &PortLayout::with_offset(23300)
                .unwrap()
                .address(ChannelMode::Publisher, ChannelType::Events)
                .unwrap(),
        )
        .unwrap();

    let deadline = Instant::now() + Duration::from_secs(3);
    let envelope = loop {
        publisher
            .send_multipart(["PluginMgr/inst-1", "{\"up\":true}"], 0)
            .unwrap();
        if let Ok(envelope) = reader.recv_timeout(Duration::from_millis(50)) {
            break envelope;
        }
        assert!(Instant::now() < deadline, "no message delivered");
    };
    drop(publisher);

    assert_eq!(envelope.topic, "PluginMgr/inst-1");
    assert_eq!(envelope.payload, "{\"up\":true}");
    assert!(runtime.shutdown(Duration::from_secs(3)));
}

#[test]
#[serial]
fn test_duplicate_subscriber_and_missing_suffix() {
    let runtime = runtime(23400);
    let (_reader, _closer) = runtime
        .open_subscribe_channel(ChannelType::Counters, ChannelProducer::Engine, "")
        .unwrap();
    assert!(matches!(
        runtime.open_subscribe_channel(ChannelType::Counters, ChannelProducer::Engine, ""),
        Err(BusError::DuplicateChannel {
            mode: ChannelMode::Subscriber,
            channel_type: ChannelType::Counters
        })
    ));
    for producer in [
        ChannelProducer::PluginMgr,
        ChannelProducer::Plugin,
        ChannelProducer::Other,
    ] {
        assert!(matches!(
            runtime.open_subscribe_channel(ChannelType::Events, producer, ""),
            Err(BusError::MissingSuffix { .. })
        ));
    }
    assert!(runtime.shutdown(Duration::from_secs(3)));
}

#[test]
#[serial]
fn test_unread_subscriber_closes_after_idle_timeout() {
    let runtime = runtime(23500);
    let _broker = runtime.run_broker(ChannelType::Counters).unwrap();
    let (reader, _closer) = runtime
        .open_subscribe_channel(ChannelType::Counters, ChannelProducer::Engine, "")
        .unwrap();
    let writer = runtime
        .open_publish_channel(ChannelType::Counters, ChannelProducer::Engine, "")
        .unwrap();
    let publisher = RepeatingPublisher::start(writer, "tick");

    assert!(wait_until(Duration::from_secs(5), || !has_socket(
        &runtime,
        ChannelMode::Subscriber,
        ChannelType::Counters
    )));
    drop(publisher);

    let err = reader
        .recv_timeout(Duration::from_millis(200))
        .unwrap_err();
    assert!(err.is_disconnected());
    assert!(runtime.shutdown(Duration::from_secs(3)));
}

#[test]
#[serial]
fn test_closer_stops_subscriber() {
    let runtime = runtime(23600);
    let (reader, closer) = runtime
        .open_subscribe_channel(ChannelType::Events, ChannelProducer::Plugin, "disk")
        .unwrap();

    closer.close();
    closer.close();
    assert!(closer.is_closed());
    let err = reader.recv_timeout(Duration::from_secs(2)).unwrap_err();
    assert!(err.is_disconnected());
    assert!(wait_until(Duration::from_secs(2), || runtime.is_messaging_idle()));

    // The type is free again once the worker is gone.
    assert!(wait_until(Duration::from_secs(2), || runtime
        .open_subscribe_channel(ChannelType::Events, ChannelProducer::Plugin, "disk")
        .is_ok()));
    assert!(runtime.shutdown(Duration::from_secs(3)));
}

#[test]
#[serial]
fn test_broker_close_releases_relay() {
    let runtime = runtime(23700);
    let handle = runtime.run_broker(ChannelType::Events).unwrap();
    assert!(has_socket(
        &runtime,
        ChannelMode::ProxyControlSubscribe,
        ChannelType::Events
    ));

    handle.close();
    handle.close();
    assert!(wait_until(Duration::from_secs(3), || runtime.is_messaging_idle()));
    assert!(runtime.shutdown(Duration::from_secs(3)));
}

// ============================================================================
// Request / response
// ============================================================================

#[tokio::test]
#[serial]
async fn test_echo_request_response() {
    let runtime = runtime(23800);
    let (requests, responses) = runtime.register_request_handler(ChannelType::Echo).unwrap();
    echo_until_closed(requests, responses);

    let reply = runtime.send_request(ChannelType::Echo, "ping").unwrap().await;
    assert_eq!(reply.unwrap(), "reply:ping");

    // The cached dispatcher serves later requests too.
    let reply = runtime.send_request(ChannelType::Echo, "again").unwrap().await;
    assert_eq!(reply.unwrap(), "reply:again");
    assert!(runtime.shutdown(Duration::from_secs(3)));
}

#[tokio::test]
#[serial]
async fn test_concurrent_requests_get_their_own_replies() {
    let runtime = runtime(23900);
    let (requests, responses) = runtime
        .register_request_handler(ChannelType::Command)
        .unwrap();
    echo_until_closed(requests, responses);

    let first = runtime.send_request(ChannelType::Command, "a").unwrap();
    let second = runtime.send_request(ChannelType::Command, "b").unwrap();
    let (first, second) = tokio::join!(first, second);
    assert_eq!(first.unwrap(), "reply:a");
    assert_eq!(second.unwrap(), "reply:b");
    assert!(runtime.shutdown(Duration::from_secs(3)));
}

#[test]
#[serial]
fn test_blocking_wait_for_reply() {
    let runtime = runtime(24000);
    let (requests, responses) = runtime.register_request_handler(ChannelType::Echo).unwrap();
    echo_until_closed(requests, responses);

    let reply = runtime
        .send_request(ChannelType::Echo, "sync")
        .unwrap()
        .wait();
    assert_eq!(reply.unwrap(), "reply:sync");
    assert!(runtime.shutdown(Duration::from_secs(3)));
}

#[test]
#[serial]
fn test_second_handler_is_duplicate() {
    let runtime = runtime(24100);
    let _handler = runtime.register_request_handler(ChannelType::Echo).unwrap();
    assert!(matches!(
        runtime.register_request_handler(ChannelType::Echo),
        Err(BusError::DuplicateHandler(ChannelType::Echo))
    ));
    assert!(runtime.shutdown(Duration::from_secs(3)));
}

#[tokio::test]
#[serial]
async fn test_request_without_handler_times_out() {
    let runtime = runtime(24200);
    let pending = runtime.send_request(ChannelType::Echo, "ping").unwrap();
    let outcome = tokio::time::timeout(Duration::from_secs(3), pending)
        .await
        .expect("request hung");
    assert!(matches!(
        outcome,
        Err(BusError::RequestTimeout(ChannelType::Echo))
    ));
    assert!(runtime.shutdown(Duration::from_secs(3)));
}

#[test]
#[serial]
fn test_handler_stops_when_responses_dropped() {
    let runtime = runtime(24300);
    let (requests, responses) = runtime.register_request_handler(ChannelType::Echo).unwrap();
    drop(responses);

    let pending = runtime.send_request(ChannelType::Echo, "ping").unwrap();
    assert_eq!(
        requests.recv_timeout(Duration::from_secs(2)).unwrap(),
        "ping"
    );
    assert!(requests
        .recv_timeout(Duration::from_secs(2))
        .unwrap_err()
        .is_disconnected());
    assert!(matches!(
        pending.wait(),
        Err(BusError::RequestTimeout(ChannelType::Echo))
    ));
    assert!(runtime.shutdown(Duration::from_secs(3)));
}

// ============================================================================
// Shutdown
// ============================================================================

#[test]
#[serial]
fn test_shutdown_is_idempotent_and_drains_everything() {
    let runtime = runtime(24400);
    let _broker = runtime.run_broker(ChannelType::Events).unwrap();
    let (reader, _closer) = runtime
        .open_subscribe_channel(ChannelType::Events, ChannelProducer::Plugin, "disk")
        .unwrap();
    let _writer = runtime
        .open_publish_channel(ChannelType::Events, ChannelProducer::Plugin, "disk")
        .unwrap();
    let (requests, _responses) = runtime.register_request_handler(ChannelType::Echo).unwrap();
    assert!(!runtime.is_messaging_idle());

    assert!(runtime.shutdown(Duration::from_secs(3)));
    assert!(runtime.shutdown(Duration::from_secs(3)));
    assert!(runtime.is_messaging_idle());
    assert!(runtime.live_sockets().is_empty());

    assert!(reader
        .recv_timeout(Duration::from_millis(200))
        .unwrap_err()
        .is_disconnected());
    assert!(requests
        .recv_timeout(Duration::from_millis(200))
        .unwrap_err()
        .is_disconnected());
    assert!(wait_until(Duration::from_secs(2), || !runtime
        .has_transport_context()));

    assert!(matches!(
        runtime.open_subscribe_channel(ChannelType::Counters, ChannelProducer::Engine, ""),
        Err(BusError::ShuttingDown)
    ));
}
