use std::time::Duration;

use conduit_core::testutil::MockConnector;
use conduit_core::{
    AttemptError, CallOptions, Capabilities, CircuitBreakerConfig, CircuitState, ConnectorError,
    ManagerConfig, Operation, RateConfig, Request,
};
use tokio::time::Instant;

use crate::common::{health_of, labels, manager, manager_with, options, pid};

fn transient() -> ConnectorError {
    ConnectorError::TransientNetwork("timeout talking to upstream".into())
}

#[tokio::test]
async fn empty_resolve_resets_failure_count() {
    let a = MockConnector::new("a").with_replies(vec![Err(transient()), Err(transient()), Ok(0)]);
    let manager = manager(&[&a]);
    let request = Request::list_items("series-9");

    for _ in 0..2 {
        manager.resolve(&pid("a"), &request, &options()).await.unwrap_err();
    }
    assert_eq!(health_of(&manager, "a").consecutive_failures, 2);

    let resolved = manager.resolve(&pid("a"), &request, &options()).await.unwrap();
    assert!(resolved.payload.is_empty());
    assert_eq!(resolved.served_by, vec![pid("a")]);
    assert_eq!(health_of(&manager, "a").consecutive_failures, 0);
    assert_eq!(manager.graph().node_weights(&pid("a")).successes, 0.0);
}

#[tokio::test]
async fn resolve_does_not_fall_back() {
    let a = MockConnector::new("a")
        .with_priority(10)
        .failing(ConnectorError::Parse("missing field `title`".into()));
    let b = MockConnector::new("b").with_priority(20);
    let manager = manager(&[&a, &b]);

    let summary = manager
        .resolve(&pid("a"), &Request::search("x", 1), &options())
        .await
        .unwrap_err();

    assert_eq!(summary.attempts.len(), 1);
    assert!(matches!(
        summary.primary(),
        Some(AttemptError::Connector(ConnectorError::Parse(_)))
    ));
    assert_eq!(b.calls(), 0);
}

#[tokio::test]
async fn resolve_success_records_graph_success() {
    let a = MockConnector::new("a").returning(3);
    let manager = manager(&[&a]);

    let resolved = manager
        .resolve(&pid("a"), &Request::list_sub_items("ch-3"), &options())
        .await
        .unwrap();

    let pages = resolved.payload.as_sub_items().unwrap();
    assert_eq!(pages.len(), 3);
    assert_eq!(pages[0].external_id, "ch-3-0");
    assert_eq!(manager.graph().node_weights(&pid("a")).successes, 1.0);
    assert_eq!(
        a.requests(),
        vec![Request::list_sub_items("ch-3")]
    );
}

#[tokio::test]
async fn unknown_provider_is_reported() {
    let a = MockConnector::new("a");
    let manager = manager(&[&a]);

    let summary = manager
        .resolve(&pid("ghost"), &Request::search("x", 1), &options())
        .await
        .unwrap_err();

    assert_eq!(labels(&summary), vec![("ghost".to_string(), "unknown_provider")]);
}

#[tokio::test]
async fn undeclared_operation_is_unsupported_without_a_call() {
    let a = MockConnector::new("a").with_capabilities(Capabilities::search_only());
    let manager = manager(&[&a]);

    let summary = manager
        .resolve(&pid("a"), &Request::list_items("p"), &options())
        .await
        .unwrap_err();

    assert!(matches!(
        summary.primary(),
        Some(AttemptError::Connector(ConnectorError::Unsupported(Operation::ListItems)))
    ));
    assert_eq!(a.calls(), 0);
    assert_eq!(health_of(&manager, "a").consecutive_failures, 0);
}

#[tokio::test]
async fn open_breaker_rejects_pinned_call() {
    let a = MockConnector::new("a").failing(ConnectorError::Blocked("account banned".into()));
    let manager = manager(&[&a]);
    let request = Request::search("x", 1);

    manager.resolve(&pid("a"), &request, &options()).await.unwrap_err();
    let summary = manager.resolve(&pid("a"), &request, &options()).await.unwrap_err();

    assert_eq!(labels(&summary), vec![("a".to_string(), "circuit_open")]);
    assert_eq!(a.calls(), 1);
}

#[tokio::test(start_paused = true)]
async fn pinned_calls_follow_token_bucket() {
    let a = MockConnector::new("a").with_rate(RateConfig::new(2.0, 3));
    let manager = manager(&[&a]);
    let request = Request::search("x", 1);

    let start = Instant::now();
    let mut admitted = Vec::new();
    for _ in 0..5 {
        manager
            .resolve(&pid("a"), &request, &CallOptions::default())
            .await
            .unwrap();
        admitted.push((Instant::now() - start).as_secs_f64());
    }

    assert!(admitted[..3].iter().all(|t| *t < 0.01), "{admitted:?}");
    assert!((admitted[3] - 0.5).abs() < 0.01, "{admitted:?}");
    assert!((admitted[4] - 1.0).abs() < 0.01, "{admitted:?}");
}

#[tokio::test(start_paused = true)]
async fn half_open_admits_a_single_trial() {
    let a = MockConnector::new("a")
        .with_delay(Duration::from_secs(5))
        .with_replies(vec![Err(transient())]);
    let config = ManagerConfig::default().with_breaker(CircuitBreakerConfig {
        failure_threshold: 1,
        cooldown: Duration::from_secs(10),
        half_open_max_trials: 1,
        ..Default::default()
    });
    let manager = manager_with(config, &[&a]);
    let request = Request::search("x", 1);

    manager
        .resolve(&pid("a"), &request, &CallOptions::default())
        .await
        .unwrap_err();
    assert_eq!(manager.breaker_state(&pid("a")), Some(CircuitState::Open));

    tokio::time::sleep(Duration::from_secs(10)).await;

    let id = pid("a");
    let opts = CallOptions::default();
    let (trial, rejected) = tokio::join!(
        manager.resolve(&id, &request, &opts),
        manager.resolve(&id, &request, &opts),
    );

    assert!(trial.is_ok());
    let rejected = rejected.unwrap_err();
    assert_eq!(labels(&rejected), vec![("a".to_string(), "circuit_open")]);
    assert_eq!(a.calls(), 2);
    assert_eq!(manager.breaker_state(&pid("a")), Some(CircuitState::Closed));
}

#[tokio::test]
async fn duplicate_ids_are_rejected() {
    let result = conduit_core::SourceManager::builder()
        .register(MockConnector::new("dup"))
        .register(MockConnector::new("dup"))
        .build();

    assert!(matches!(
        result,
        Err(conduit_core::AppError::DuplicateProvider(id)) if id.as_str() == "dup"
    ));
}

#[tokio::test]
async fn invalid_rate_envelopes_are_rejected() {
    for rate in [
        RateConfig::new(0.0, 1),
        RateConfig::new(f64::NAN, 1),
        RateConfig::new(2.0, 0),
    ] {
        let result = conduit_core::SourceManager::builder()
            .register(MockConnector::new("bad").with_rate(rate))
            .build();
        assert!(matches!(
            result,
            Err(conduit_core::AppError::ConfigError(msg)) if msg.contains("'bad'")
        ));
    }
}

#[tokio::test(start_paused = true)]
async fn vanishing_rate_fails_fast_instead_of_panicking() {
    let a = MockConnector::new("a").with_rate(RateConfig::new(1e-20, 1));
    let manager = manager(&[&a]);
    let request = Request::search("x", 1);

    manager
        .resolve(&pid("a"), &request, &options())
        .await
        .unwrap();
    let summary = manager
        .resolve(&pid("a"), &request, &options())
        .await
        .unwrap_err();

    assert_eq!(labels(&summary), vec![("a".to_string(), "rate_limited_locally")]);
    assert_eq!(a.calls(), 1);
}
