use conduit_core::health::{OutcomeKind, SkipReason};
use conduit_core::testutil::MockConnector;
use conduit_core::{
    AttemptError, Capabilities, CircuitState, ConnectorError, DiscoveryMode, ErrorClass,
    ManagerConfig, Operation, Request,
};

use crate::common::{health_of, manager, manager_with, options, pid};

#[tokio::test]
async fn snapshot_reports_breaker_tokens_and_outcomes() {
    let a = MockConnector::new("a").with_priority(20).returning(2);
    let b = MockConnector::new("b")
        .with_priority(10)
        .failing(ConnectorError::Timeout(std::time::Duration::from_secs(3)));
    let manager = manager(&[&a, &b]);
    let request = Request::search("x", 1);

    manager.resolve(&pid("a"), &request, &options()).await.unwrap();
    manager.resolve(&pid("b"), &request, &options()).await.unwrap_err();

    let snapshot = manager.health_snapshot();
    let ids: Vec<_> = snapshot.iter().map(|h| h.provider_id.to_string()).collect();
    assert_eq!(ids, vec!["a", "b"]);

    let a_health = &snapshot[0];
    assert_eq!(a_health.breaker_state, CircuitState::Closed);
    assert!(a_health.token_level >= 0.0);
    assert!(a_health.token_level <= a_health.token_capacity);
    assert_eq!(a_health.recent_outcomes.len(), 1);
    assert_eq!(a_health.recent_outcomes[0].kind, OutcomeKind::Success { items: 2 });
    assert_eq!(a_health.recent_outcomes[0].operation, Operation::Search);

    let b_health = &snapshot[1];
    assert_eq!(b_health.consecutive_failures, 1);
    assert!(b_health.last_error.is_some());
    assert_eq!(
        b_health.recent_outcomes[0].kind,
        OutcomeKind::Failed {
            class: ErrorClass::Timeout
        }
    );
}

#[tokio::test]
async fn skipped_candidates_are_recorded() {
    let a = MockConnector::new("a")
        .with_priority(20)
        .failing(ConnectorError::Blocked("ip banned".into()));
    let b = MockConnector::new("b").with_priority(10);
    let manager = manager(&[&a, &b]);
    let request = Request::search("x", 1);

    for _ in 0..2 {
        manager
            .discover(&request, &options(), DiscoveryMode::FirstSuccess)
            .await
            .unwrap();
    }

    let a_health = health_of(&manager, "a");
    assert_eq!(a_health.breaker_state, CircuitState::Open);
    assert!(a_health.retry_after_ms.is_some());
    let kinds: Vec<_> = a_health.recent_outcomes.iter().map(|r| r.kind.clone()).collect();
    assert_eq!(
        kinds,
        vec![
            OutcomeKind::Failed {
                class: ErrorClass::BlockedOrBanned
            },
            OutcomeKind::Skipped {
                reason: SkipReason::CircuitOpen
            },
        ]
    );
}

#[tokio::test]
async fn outcome_history_is_bounded() {
    let a = MockConnector::new("a");
    let manager = manager_with(ManagerConfig::default().with_recent_outcomes(2), &[&a]);

    for _ in 0..5 {
        manager
            .resolve(&pid("a"), &Request::search("x", 1), &options())
            .await
            .unwrap();
    }

    assert_eq!(health_of(&manager, "a").recent_outcomes.len(), 2);
}

#[tokio::test]
async fn ranks_cover_every_provider_and_sum_to_one() {
    let a = MockConnector::new("a")
        .with_priority(30)
        .failing(ConnectorError::TransientNetwork("reset".into()));
    let b = MockConnector::new("b").with_priority(20).returning(5);
    let idle = MockConnector::new("idle").with_capabilities(Capabilities::search_only().with(Operation::HealthCheck));
    let manager = manager(&[&a, &b, &idle]);

    for _ in 0..3 {
        manager
            .discover(&Request::list_items("p"), &options(), DiscoveryMode::FirstSuccess)
            .await
            .unwrap();
    }

    let ranks = manager.reliability_ranks();
    assert_eq!(ranks.scores.len(), 3);
    let total: f64 = ranks.scores.values().sum();
    assert!((total - 1.0).abs() < 1e-6);
    assert!(ranks.scores.values().all(|s| *s >= 0.0));
    assert!(ranks.score(&pid("b")) > ranks.score(&pid("a")));
    assert!(ranks.score(&pid("b")) > ranks.score(&pid("idle")));
}

#[tokio::test]
async fn probes_feed_breakers() {
    let healthy = MockConnector::new("healthy");
    let banned = MockConnector::new("banned")
        .with_health(Err(ConnectorError::Blocked("403 Forbidden".into())));
    let silent = MockConnector::new("silent").with_capabilities(Capabilities::search_only());
    let manager = manager(&[&healthy, &banned, &silent]);

    let mut results = manager.probe_all(&options()).await;
    results.sort_by(|a, b| a.0.cmp(&b.0));

    assert_eq!(results.len(), 2);
    assert_eq!(results[0].0, pid("banned"));
    assert!(matches!(
        results[0].1,
        Err(AttemptError::Connector(ConnectorError::Blocked(_)))
    ));
    assert_eq!(results[1].0, pid("healthy"));
    assert!(results[1].1.is_ok());

    assert_eq!(healthy.health_checks(), 1);
    assert_eq!(silent.health_checks(), 0);
    assert_eq!(manager.breaker_state(&pid("banned")), Some(CircuitState::Open));
    assert_eq!(
        health_of(&manager, "healthy").recent_outcomes[0].kind,
        OutcomeKind::Healthy
    );

    assert!(matches!(
        manager.probe(&pid("silent"), &options()).await,
        Err(AttemptError::Connector(ConnectorError::Unsupported(Operation::HealthCheck)))
    ));
    assert!(matches!(
        manager.probe(&pid("ghost"), &options()).await,
        Err(AttemptError::UnknownProvider)
    ));
}

#[tokio::test]
async fn snapshot_serializes_for_reporting() {
    let a = MockConnector::new("a");
    let manager = manager(&[&a]);
    manager
        .resolve(&pid("a"), &Request::search("x", 1), &options())
        .await
        .unwrap();

    let json = serde_json::to_value(manager.health_snapshot()).unwrap();
    assert_eq!(json[0]["provider_id"], "a");
    assert_eq!(json[0]["breaker_state"], "closed");
    assert_eq!(json[0]["recent_outcomes"][0]["kind"], "success");
    assert_eq!(json[0]["recent_outcomes"][0]["items"], 1);
}
