//! Visibility Extension Tests
//!
//! Run on a paused clock so handler durations of tens of seconds are
//! simulated exactly.

mod common;

use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;

use common::{bounded, wait_until, Behavior, MockTransport, TestHandler};
use sl_container::{ContainerOptions, DeletionPolicy, EndpointDescriptor, ListenerContainer};

const WAIT: Duration = Duration::from_secs(300);

fn descriptor(minimum_visibility: Duration) -> EndpointDescriptor {
    EndpointDescriptor::builder(["q1"])
        .with_max_inflight_per_queue(1)
        .with_poll_timeout(Duration::from_secs(5))
        .with_minimum_visibility(minimum_visibility)
        .with_deletion_policy(DeletionPolicy::OnSuccess)
        .build()
        .unwrap()
}

#[tokio::test(start_paused = true)]
async fn test_long_handler_is_extended_before_deadline() {
    let transport = Arc::new(MockTransport::with_visibility_timeout(Some(Duration::from_secs(30))));
    let handler = Arc::new(TestHandler::with_default(Behavior::Sleep(Duration::from_secs(25))));
    transport.push("q1", "m1");

    let container = ListenerContainer::new(
        descriptor(Duration::from_secs(10)),
        transport.clone(),
        handler.clone(),
    );
    container.start().await.unwrap();

    wait_until(WAIT, || transport.deleted_ids() == vec!["m1"]).await;
    // Give the extender several more ticks to misbehave
    tokio::time::sleep(Duration::from_secs(30)).await;
    bounded(container.stop()).await;

    let received_at = transport.received.lock()[0].1;
    let finished_at = handler.finished.lock()[0].1;
    let extensions = transport.extensions.lock().clone();

    assert!(finished_at - received_at >= Duration::from_secs(25));
    assert_eq!(extensions.len(), 1);

    let (id, timeout, extended_at) = &extensions[0];
    assert_eq!(id, "m1");
    assert!(*timeout > Duration::from_secs(10));
    // Not before the remaining visibility dropped under the minimum, and before the deadline
    assert!(*extended_at >= received_at + Duration::from_secs(20));
    assert!(*extended_at < received_at + Duration::from_secs(25));
    assert!(extensions.iter().all(|(_, _, at)| *at <= finished_at));

    let deleted_at = transport.deletes.lock()[0].2;
    assert!(deleted_at >= finished_at);
    assert_eq!(container.metrics().extensions, 1);
}

#[tokio::test(start_paused = true)]
async fn test_failed_extension_is_retried_next_tick() {
    let transport = Arc::new(MockTransport::with_visibility_timeout(Some(Duration::from_secs(30))));
    transport.fail_next_extensions(1);
    let handler = Arc::new(TestHandler::with_default(Behavior::Sleep(Duration::from_secs(28))));
    transport.push("q1", "m1");

    let container = ListenerContainer::new(
        descriptor(Duration::from_secs(10)),
        transport.clone(),
        handler.clone(),
    );
    container.start().await.unwrap();

    wait_until(WAIT, || transport.deleted_ids() == vec!["m1"]).await;
    bounded(container.stop()).await;

    let received_at = transport.received.lock()[0].1;
    let extensions = transport.extensions.lock().clone();
    assert_eq!(extensions.len(), 1);
    assert!(extensions[0].2 < received_at + Duration::from_secs(30));

    let metrics = container.metrics();
    assert_eq!(metrics.extension_failures, 1);
    assert_eq!(metrics.extensions, 1);
}

#[tokio::test(start_paused = true)]
async fn test_short_handler_is_never_extended() {
    let transport = Arc::new(MockTransport::with_visibility_timeout(Some(Duration::from_secs(30))));
    let handler = Arc::new(TestHandler::with_default(Behavior::Sleep(Duration::from_secs(5))));
    transport.push("q1", "m1");

    let container = ListenerContainer::new(
        descriptor(Duration::from_secs(10)),
        transport.clone(),
        handler.clone(),
    );
    container.start().await.unwrap();

    wait_until(WAIT, || transport.deleted_ids() == vec!["m1"]).await;
    tokio::time::sleep(Duration::from_secs(60)).await;
    bounded(container.stop()).await;

    assert_eq!(transport.extension_count(), 0);
}

#[tokio::test(start_paused = true)]
async fn test_extension_keeps_very_long_handler_invisible() {
    let transport = Arc::new(MockTransport::with_visibility_timeout(Some(Duration::from_secs(30))));
    let handler = Arc::new(TestHandler::with_default(Behavior::Sleep(Duration::from_secs(120))));
    transport.push("q1", "m1");

    let container = ListenerContainer::new(
        descriptor(Duration::from_secs(10)),
        transport.clone(),
        handler.clone(),
    );
    container.start().await.unwrap();
    let started = Instant::now();

    wait_until(WAIT, || transport.deleted_ids() == vec!["m1"]).await;
    bounded(container.stop()).await;

    // Each extension must land before the previous deadline expired
    let received_at = transport.received.lock()[0].1;
    let mut deadline = received_at + Duration::from_secs(30);
    for (_, timeout, at) in transport.extensions.lock().iter() {
        assert!(*at < deadline, "extension at {:?} after deadline", *at - started);
        deadline = *at + *timeout;
    }
    assert!(deadline >= handler.finished.lock()[0].1);
}

#[tokio::test(start_paused = true)]
async fn test_explicit_tick_and_margin() {
    let transport = Arc::new(MockTransport::with_visibility_timeout(Some(Duration::from_secs(30))));
    let handler = Arc::new(TestHandler::with_default(Behavior::Sleep(Duration::from_secs(25))));
    transport.push("q1", "m1");

    let container = ListenerContainer::new(
        descriptor(Duration::from_secs(10)),
        transport.clone(),
        handler.clone(),
    )
    .with_options(ContainerOptions {
        extension_tick: Some(Duration::from_secs(1)),
        extension_safety_margin: Some(Duration::from_secs(5)),
        ..Default::default()
    });
    container.start().await.unwrap();

    wait_until(WAIT, || transport.deleted_ids() == vec!["m1"]).await;
    bounded(container.stop()).await;

    let received_at = transport.received.lock()[0].1;
    let extensions = transport.extensions.lock().clone();
    assert_eq!(extensions.len(), 1);
    assert_eq!(extensions[0].1, Duration::from_secs(15));
    assert!(extensions[0].2 <= received_at + Duration::from_secs(21));
}
