//! Container Registry Tests

mod common;

use std::sync::Arc;
use std::time::Duration;

use common::{bounded, wait_until, MockTransport, TestHandler};
use sl_container::{
    ContainerRegistry, ContainerState, DeletionPolicy, EndpointDescriptor, ListenerContainer,
    ListenerError,
};

fn listener(id: &str, queue: &str, transport: &Arc<MockTransport>, handler: &Arc<TestHandler>) -> ListenerContainer {
    let descriptor = EndpointDescriptor::builder([queue])
        .with_container_id(id)
        .with_poll_timeout(Duration::from_secs(1))
        .with_deletion_policy(DeletionPolicy::OnSuccess)
        .build()
        .unwrap();
    ListenerContainer::new(descriptor, transport.clone(), handler.clone())
}

#[tokio::test]
async fn test_register_rejects_duplicate_ids() {
    let transport = Arc::new(MockTransport::new());
    let handler = Arc::new(TestHandler::new());
    let mut registry = ContainerRegistry::new();

    registry.register(listener("orders", "q1", &transport, &handler)).unwrap();
    let duplicate = registry.register(listener("orders", "q2", &transport, &handler));

    assert!(matches!(duplicate, Err(ListenerError::DuplicateContainer(id)) if id == "orders"));
    assert_eq!(registry.len(), 1);
}

#[tokio::test]
async fn test_get_unknown_container() {
    let registry = ContainerRegistry::new();
    assert!(registry.is_empty());
    assert!(matches!(registry.get("missing"), Err(ListenerError::ContainerNotFound(_))));
}

#[tokio::test]
async fn test_start_all_and_stop_all() {
    let transport = Arc::new(MockTransport::new());
    let handler = Arc::new(TestHandler::new());
    let mut registry = ContainerRegistry::new();
    registry.register(listener("orders", "q1", &transport, &handler)).unwrap();
    registry.register(listener("billing", "q2", &transport, &handler)).unwrap();

    assert_eq!(registry.ids(), vec!["orders", "billing"]);

    tokio_test::assert_ok!(registry.start_all().await);
    transport.push("q1", "m1");
    transport.push("q2", "m2");
    wait_until(Duration::from_secs(5), || transport.deleted_ids().len() == 2).await;

    assert!(registry
        .states()
        .iter()
        .all(|(_, state)| *state == ContainerState::Running));

    bounded(registry.stop_all()).await;
    assert_eq!(
        registry.states(),
        vec![
            ("orders".to_string(), ContainerState::Stopped),
            ("billing".to_string(), ContainerState::Stopped),
        ]
    );
    assert_eq!(registry.get("orders").unwrap().metrics().succeeded, 1);
}

#[tokio::test]
async fn test_start_all_stops_at_first_failure() {
    let transport = Arc::new(MockTransport::new());
    let handler = Arc::new(TestHandler::new());
    let mut registry = ContainerRegistry::new();

    let invalid = EndpointDescriptor::builder(["q1"])
        .with_container_id("too-slow")
        .with_poll_timeout(Duration::from_secs(60))
        .build()
        .unwrap();
    registry
        .register(ListenerContainer::new(invalid, transport.clone(), handler.clone()))
        .unwrap();
    registry.register(listener("never-started", "q2", &transport, &handler)).unwrap();

    let result = registry.start_all().await;
    assert!(matches!(result, Err(ListenerError::Configuration(_))));
    assert_eq!(
        registry.states(),
        vec![
            ("too-slow".to_string(), ContainerState::Stopped),
            ("never-started".to_string(), ContainerState::Created),
        ]
    );

    bounded(registry.stop_all()).await;
}
