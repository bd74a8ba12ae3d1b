//! Topic and subscription provisioning against the in-process transport

mod common;

use arrakis_pubsub::resources::MAX_TOPIC_RETENTION;
use arrakis_pubsub::transport::MemoryTransport;
use arrakis_pubsub::{Options, PubSubError, SubscriptionSettings, TopicSpec, TransportErrorKind};
use common::{memory_client, scripted_client, ScriptedTransport};
use std::collections::BTreeMap;
use std::time::Duration;

const DAY: Duration = Duration::from_secs(24 * 60 * 60);

#[tokio::test]
async fn topic_retention_is_capped_at_seven_days() {
    let (client, memory) = memory_client(Options::new());

    client
        .create_topic(&TopicSpec::new("long-lived").with_retention(DAY * 30))
        .await
        .unwrap();
    client
        .create_topic(&TopicSpec::new("short-lived").with_retention(DAY * 3))
        .await
        .unwrap();

    assert_eq!(memory.topic("long-lived").unwrap().retention, Some(MAX_TOPIC_RETENTION));
    assert_eq!(memory.topic("short-lived").unwrap().retention, Some(DAY * 3));
}

#[tokio::test]
async fn existing_topic_is_left_untouched() {
    let (client, memory) = memory_client(Options::new());

    client
        .create_topic(&TopicSpec::new("orders").with_retention(DAY))
        .await
        .unwrap();
    client
        .create_topic(&TopicSpec::new("orders").with_retention(DAY * 5))
        .await
        .unwrap();

    assert_eq!(memory.topic("orders").unwrap().retention, Some(DAY));
}

#[tokio::test]
async fn subscription_batch_is_idempotent() {
    let (client, memory) = memory_client(Options::new());
    client.create_topic(&TopicSpec::new("orders")).await.unwrap();

    let batch = [("orders-audit", ""), ("orders-eu", r#"attributes.region = "eu""#)];
    let settings = SubscriptionSettings::default();

    client
        .create_subscriptions("orders", batch, &settings)
        .await
        .unwrap();
    client
        .create_subscriptions("orders", batch, &settings)
        .await
        .unwrap();

    assert_eq!(memory.subscription_count(), 2);
}

#[tokio::test]
async fn missing_topic_is_a_precondition_failure() {
    let (client, memory) = memory_client(Options::new());

    let err = client
        .create_subscriptions("missing", [("sub-a", "")], &SubscriptionSettings::default())
        .await
        .unwrap_err();

    match err {
        PubSubError::Precondition { ref topic } => assert_eq!(topic, "missing"),
        ref other => panic!("expected precondition error, got {other:?}"),
    }
    assert!(err.to_string().contains("missing"));
    assert_eq!(memory.subscription_count(), 0);
}

#[tokio::test]
async fn single_subscription_checks_the_topic_too() {
    let (client, memory) = memory_client(Options::new());

    let err = client
        .create_subscription("missing", "sub-a", "", &SubscriptionSettings::default())
        .await
        .unwrap_err();

    assert!(matches!(err, PubSubError::Precondition { .. }));
    assert!(memory.subscription("sub-a").is_none());
}

#[tokio::test]
async fn filter_is_only_set_when_non_empty() {
    let (client, memory) = memory_client(Options::new());
    client.create_topic(&TopicSpec::new("orders")).await.unwrap();

    let batch = BTreeMap::from([
        ("unfiltered", ""),
        ("eu-only", r#"attributes.region = "eu""#),
    ]);
    client
        .create_subscriptions("orders", batch, &SubscriptionSettings::default())
        .await
        .unwrap();

    assert_eq!(memory.subscription("unfiltered").unwrap().filter, None);
    assert_eq!(
        memory.subscription("eu-only").unwrap().filter.as_deref(),
        Some(r#"attributes.region = "eu""#)
    );
}

#[tokio::test]
async fn whitespace_filter_is_handed_to_the_transport() {
    let (client, memory) = memory_client(Options::new());
    client.create_topic(&TopicSpec::new("orders")).await.unwrap();

    let err = client
        .create_subscription("orders", "blank", "   ", &SubscriptionSettings::default())
        .await
        .unwrap_err();

    assert_eq!(
        err.transport_error().map(|e| e.kind()),
        Some(TransportErrorKind::InvalidArgument)
    );
    assert!(memory.subscription("blank").is_none());
}

#[tokio::test]
async fn settings_apply_to_every_subscription_in_the_batch() {
    let (client, memory) = memory_client(Options::new());
    client.create_topic(&TopicSpec::new("orders")).await.unwrap();

    let settings = SubscriptionSettings::ordered()
        .with_retain_acked(true)
        .with_ack_deadline(Duration::from_secs(3600));
    client
        .create_subscriptions("orders", [("sub-a", ""), ("sub-b", "")], &settings)
        .await
        .unwrap();

    for id in ["sub-a", "sub-b"] {
        let spec = memory.subscription(id).unwrap();
        assert_eq!(spec.topic, "orders");
        assert!(spec.enable_ordering);
        assert!(spec.retain_acked);
        assert_eq!(spec.ack_deadline, Some(Duration::from_secs(600)));
    }
}

#[tokio::test]
async fn existing_subscription_keeps_its_configuration() {
    let (client, memory) = memory_client(Options::new());
    client.create_topic(&TopicSpec::new("orders")).await.unwrap();

    client
        .create_subscription("orders", "sub-a", "", &SubscriptionSettings::default())
        .await
        .unwrap();
    client
        .create_subscription(
            "orders",
            "sub-a",
            "attributes:region",
            &SubscriptionSettings::ordered(),
        )
        .await
        .unwrap();

    let spec = memory.subscription("sub-a").unwrap();
    assert_eq!(spec.filter, None);
    assert!(!spec.enable_ordering);
}

#[tokio::test]
async fn failed_creation_aborts_the_batch_without_rollback() {
    let (client, transport) =
        scripted_client(ScriptedTransport::new(MemoryTransport::new()).refusing("sub-b"));
    client.create_topic(&TopicSpec::new("orders")).await.unwrap();

    let batch = vec![("sub-a", ""), ("sub-b", ""), ("sub-c", "")];
    let err = client
        .create_subscriptions("orders", batch, &SubscriptionSettings::default())
        .await
        .unwrap_err();

    assert_eq!(
        err.transport_error().map(|e| e.kind()),
        Some(TransportErrorKind::PermissionDenied)
    );
    assert!(err.to_string().contains("caller may not create subscription sub-b"));

    assert!(transport.memory.subscription("sub-a").is_some());
    assert!(transport.memory.subscription("sub-b").is_none());
    assert!(transport.memory.subscription("sub-c").is_none());
    assert_eq!(transport.created_subscriptions(), 1);
}

#[tokio::test]
async fn invalid_filter_is_reported_by_the_transport() {
    let (client, memory) = memory_client(Options::new());
    client.create_topic(&TopicSpec::new("orders")).await.unwrap();

    let err = client
        .create_subscription(
            "orders",
            "sub-a",
            "attributes.region = eu",
            &SubscriptionSettings::default(),
        )
        .await
        .unwrap_err();

    assert_eq!(
        err.transport_error().map(|e| e.kind()),
        Some(TransportErrorKind::InvalidArgument)
    );
    assert_eq!(memory.subscription_count(), 0);
}
