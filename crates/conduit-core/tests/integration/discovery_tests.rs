use std::time::Duration;

use conduit_core::health::OutcomeKind;
use conduit_core::testutil::MockConnector;
use conduit_core::{
    CallOptions, Capabilities, CircuitState, ConnectorError, DiscoveryMode, ManagerConfig,
    Operation, Payload, RankPolicy, RateConfig, Request,
};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use crate::common::{health_of, labels, manager, manager_with, options, pid};

fn transient() -> ConnectorError {
    ConnectorError::TransientNetwork("connection reset".into())
}

#[tokio::test]
async fn falls_back_past_network_error_and_ban() {
    let a = MockConnector::new("a").with_priority(30).failing(transient());
    let b = MockConnector::new("b")
        .with_priority(20)
        .failing(ConnectorError::Blocked("captcha".into()));
    let c = MockConnector::new("c").with_priority(10).returning(5);
    let manager = manager(&[&a, &b, &c]);

    let resolved = manager
        .discover(&Request::search("naruto", 1), &options(), DiscoveryMode::FirstSuccess)
        .await
        .unwrap();

    assert_eq!(resolved.payload.len(), 5);
    assert_eq!(resolved.served_by, vec![pid("c")]);
    assert_eq!(resolved.failures.len(), 2);

    let graph = manager.graph();
    assert_eq!(graph.edge_weight(&pid("a"), &pid("b")), 1.0);
    assert_eq!(graph.edge_weight(&pid("b"), &pid("c")), 1.0);
    assert_eq!(graph.edge_weight(&pid("a"), &pid("c")), 0.0);
    assert_eq!(graph.node_weights(&pid("c")).successes, 1.0);

    let a_health = health_of(&manager, "a");
    assert_eq!(a_health.consecutive_failures, 1);
    assert_eq!(a_health.breaker_state, CircuitState::Closed);

    let b_health = health_of(&manager, "b");
    assert_eq!(b_health.consecutive_failures, 5);
    assert_eq!(b_health.breaker_state, CircuitState::Open);
}

#[tokio::test]
async fn empty_answer_is_terminal() {
    let a = MockConnector::new("a").with_priority(20).returning(0);
    let b = MockConnector::new("b").with_priority(10).returning(3);
    let manager = manager(&[&a, &b]);

    let resolved = manager
        .discover(&Request::list_items("series-1"), &options(), DiscoveryMode::FirstSuccess)
        .await
        .unwrap();

    assert!(resolved.payload.is_empty());
    assert!(matches!(resolved.payload, Payload::Items(_)));
    assert_eq!(resolved.served_by, vec![pid("a")]);
    assert_eq!(b.calls(), 0);
    assert_eq!(manager.graph().node_weights(&pid("a")).successes, 0.0);
}

#[tokio::test]
async fn success_stops_the_chain() {
    let a = MockConnector::new("a").with_priority(20).returning(2);
    let b = MockConnector::new("b").with_priority(10).returning(3);
    let manager = manager(&[&a, &b]);

    let resolved = manager
        .discover(&Request::search("x", 1), &options(), DiscoveryMode::FirstSuccess)
        .await
        .unwrap();

    assert_eq!(resolved.served_by, vec![pid("a")]);
    assert!(resolved.failures.is_empty());
    assert_eq!(a.calls(), 1);
    assert_eq!(b.calls(), 0);
}

#[tokio::test]
async fn skipped_candidate_creates_no_edge() {
    let a = MockConnector::new("a").with_priority(30).failing(transient());
    let b = MockConnector::new("b")
        .with_priority(20)
        .failing(ConnectorError::Blocked("banned".into()));
    let c = MockConnector::new("c").with_priority(10).returning(1);
    let manager = manager(&[&a, &b, &c]);

    // Open b's breaker up front.
    let _ = manager
        .resolve(&pid("b"), &Request::search("x", 1), &options())
        .await;
    assert_eq!(manager.breaker_state(&pid("b")), Some(CircuitState::Open));

    let resolved = manager
        .discover(&Request::search("x", 1), &options(), DiscoveryMode::FirstSuccess)
        .await
        .unwrap();

    assert_eq!(resolved.served_by, vec![pid("c")]);
    assert_eq!(
        resolved
            .failures
            .iter()
            .map(|f| f.error.label())
            .collect::<Vec<_>>(),
        vec!["transient_network", "circuit_open"]
    );
    assert_eq!(b.calls(), 1);

    let graph = manager.graph();
    assert_eq!(graph.edge_weight(&pid("a"), &pid("c")), 1.0);
    assert_eq!(graph.edge_weight(&pid("a"), &pid("b")), 0.0);
    assert_eq!(graph.edge_weight(&pid("b"), &pid("c")), 0.0);
}

#[tokio::test]
async fn exhaustion_reports_every_candidate() {
    let a = MockConnector::new("a")
        .with_priority(20)
        .failing(ConnectorError::Parse("unexpected markup".into()));
    let b = MockConnector::new("b")
        .with_priority(10)
        .failing(ConnectorError::RateLimited { retry_after: None });
    let manager = manager(&[&a, &b]);

    let summary = manager
        .discover(&Request::search("x", 1), &options(), DiscoveryMode::FirstSuccess)
        .await
        .unwrap_err();

    assert_eq!(summary.operation, Operation::Search);
    assert_eq!(
        labels(&summary),
        vec![
            ("a".to_string(), "parse_error"),
            ("b".to_string(), "rate_limited_by_provider"),
        ]
    );
    assert_eq!(manager.graph().edge_weight(&pid("a"), &pid("b")), 1.0);
    assert_eq!(health_of(&manager, "b").consecutive_failures, 2);
    assert!(summary.to_string().contains("a=parse_error"));
}

#[tokio::test]
async fn only_capable_providers_are_candidates() {
    let a = MockConnector::new("a")
        .with_priority(20)
        .with_capabilities(Capabilities::search_only());
    let b = MockConnector::new("b").with_priority(10).returning(4);
    let manager = manager(&[&a, &b]);

    let resolved = manager
        .discover(&Request::list_sub_items("ch-1"), &options(), DiscoveryMode::FirstSuccess)
        .await
        .unwrap();

    assert_eq!(resolved.served_by, vec![pid("b")]);
    assert_eq!(a.calls(), 0);
    assert!(resolved.failures.is_empty());
}

#[tokio::test]
async fn no_capable_provider_is_an_empty_summary() {
    let a = MockConnector::new("a").with_capabilities(Capabilities::search_only());
    let manager = manager(&[&a]);

    let summary = manager
        .discover(&Request::list_items("p"), &options(), DiscoveryMode::FirstSuccess)
        .await
        .unwrap_err();

    assert!(summary.attempts.is_empty());
    assert_eq!(summary.to_string(), "No provider supports 'list_items'");
}

#[tokio::test]
async fn broad_merges_in_priority_order() {
    let a = MockConnector::new("a").with_priority(30).returning(2);
    let b = MockConnector::new("b").with_priority(20).failing(transient());
    let c = MockConnector::new("c").with_priority(10).returning(3);
    let manager = manager(&[&a, &b, &c]);

    let resolved = manager
        .discover(&Request::search("x", 1), &options(), DiscoveryMode::Broad)
        .await
        .unwrap();

    let providers: Vec<_> = resolved
        .payload
        .as_search()
        .unwrap()
        .iter()
        .map(|item| item.provider_id.to_string())
        .collect();
    assert_eq!(providers, vec!["a", "a", "c", "c", "c"]);
    assert_eq!(resolved.served_by, vec![pid("a"), pid("c")]);
    assert_eq!(labels_of(&resolved.failures), vec!["transient_network"]);

    // Broad discovery has no fallback transitions.
    assert_eq!(manager.graph().edge_weight(&pid("b"), &pid("c")), 0.0);
    assert_eq!(manager.graph().node_weights(&pid("a")).successes, 1.0);
    assert_eq!(manager.graph().node_weights(&pid("c")).successes, 1.0);
}

fn labels_of(failures: &[conduit_core::FailedAttempt]) -> Vec<&'static str> {
    failures.iter().map(|f| f.error.label()).collect()
}

#[tokio::test]
async fn broad_does_not_deduplicate() {
    let a = MockConnector::new("a").returning(1);
    let b = MockConnector::new("b").returning(1);
    let manager = manager(&[&a, &b]);

    let resolved = manager
        .discover(&Request::search("x", 1), &options(), DiscoveryMode::Broad)
        .await
        .unwrap();

    let ids: Vec<_> = resolved
        .payload
        .as_search()
        .unwrap()
        .iter()
        .map(|item| item.external_id.clone())
        .collect();
    assert_eq!(ids, vec!["0", "0"]);
}

#[tokio::test]
async fn broad_all_empty_is_authoritative() {
    let a = MockConnector::new("a").returning(0);
    let b = MockConnector::new("b").failing(transient());
    let manager = manager(&[&a, &b]);

    let resolved = manager
        .discover(&Request::search("x", 1), &options(), DiscoveryMode::Broad)
        .await
        .unwrap();

    assert!(resolved.payload.is_empty());
    assert_eq!(resolved.served_by, vec![pid("a")]);
    assert_eq!(resolved.failures.len(), 1);
}

#[tokio::test]
async fn broad_all_failed_is_a_summary() {
    let a = MockConnector::new("a").with_priority(2).failing(transient());
    let b = MockConnector::new("b")
        .with_priority(1)
        .failing(ConnectorError::Blocked("403".into()));
    let manager = manager(&[&a, &b]);

    let summary = manager
        .discover(&Request::search("x", 1), &options(), DiscoveryMode::Broad)
        .await
        .unwrap_err();

    assert_eq!(
        labels(&summary),
        vec![
            ("a".to_string(), "transient_network"),
            ("b".to_string(), "blocked_or_banned"),
        ]
    );
}

#[tokio::test(start_paused = true)]
async fn broad_concurrency_is_bounded() {
    let connectors: Vec<MockConnector> = ["a", "b", "c", "d"]
        .iter()
        .map(|id| MockConnector::new(id).with_delay(Duration::from_secs(1)))
        .collect();
    let refs: Vec<&MockConnector> = connectors.iter().collect();
    let manager = manager_with(ManagerConfig::default().with_broad_concurrency(2), &refs);

    let started = Instant::now();
    let resolved = manager
        .discover(&Request::search("x", 1), &options(), DiscoveryMode::Broad)
        .await
        .unwrap();

    assert_eq!(resolved.payload.len(), 4);
    let elapsed = started.elapsed();
    assert!(elapsed >= Duration::from_secs(2), "elapsed {elapsed:?}");
    assert!(elapsed < Duration::from_secs(3), "elapsed {elapsed:?}");
}

#[tokio::test(start_paused = true)]
async fn slow_provider_times_out_at_deadline() {
    let a = MockConnector::new("a").with_delay(Duration::from_secs(10));
    let manager = manager(&[&a]);

    let started = Instant::now();
    let summary = manager
        .discover(
            &Request::search("x", 1),
            &CallOptions::with_timeout(Duration::from_secs(1)),
            DiscoveryMode::FirstSuccess,
        )
        .await
        .unwrap_err();

    assert_eq!(labels(&summary), vec![("a".to_string(), "timeout")]);
    let elapsed = started.elapsed();
    assert!(elapsed >= Duration::from_secs(1) && elapsed < Duration::from_secs(2));
    assert_eq!(health_of(&manager, "a").consecutive_failures, 1);
}

#[tokio::test(start_paused = true)]
async fn exhausted_bucket_skips_without_penalty() {
    let a = MockConnector::new("a")
        .with_priority(20)
        .with_rate(RateConfig::new(1.0, 1));
    let b = MockConnector::new("b").with_priority(10);
    let manager = manager(&[&a, &b]);
    let request = Request::search("x", 1);
    let short = || CallOptions::with_timeout(Duration::from_millis(100));

    let first = manager
        .discover(&request, &short(), DiscoveryMode::FirstSuccess)
        .await
        .unwrap();
    assert_eq!(first.served_by, vec![pid("a")]);

    let second = manager
        .discover(&request, &short(), DiscoveryMode::FirstSuccess)
        .await
        .unwrap();
    assert_eq!(second.served_by, vec![pid("b")]);
    assert_eq!(labels_of(&second.failures), vec!["rate_limited_locally"]);
    assert_eq!(a.calls(), 1);

    let a_health = health_of(&manager, "a");
    assert_eq!(a_health.consecutive_failures, 0);
    assert_eq!(a_health.breaker_state, CircuitState::Closed);
    assert_eq!(manager.graph().edge_weight(&pid("a"), &pid("b")), 0.0);
}

#[tokio::test]
async fn cancelled_before_start_calls_nothing() {
    let a = MockConnector::new("a");
    let manager = manager(&[&a]);
    let token = CancellationToken::new();
    token.cancel();

    let summary = manager
        .discover(
            &Request::search("x", 1),
            &options().with_cancel(token),
            DiscoveryMode::FirstSuccess,
        )
        .await
        .unwrap_err();

    assert!(summary.was_cancelled());
    assert_eq!(labels(&summary), vec![("a".to_string(), "cancelled")]);
    assert_eq!(a.calls(), 0);
}

#[tokio::test(start_paused = true)]
async fn cancellation_aborts_in_flight_chain() {
    let a = MockConnector::new("a")
        .with_priority(20)
        .with_delay(Duration::from_secs(10));
    let b = MockConnector::new("b").with_priority(10);
    let manager = manager(&[&a, &b]);

    let token = CancellationToken::new();
    let trigger = token.clone();
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_secs(1)).await;
        trigger.cancel();
    });

    let started = Instant::now();
    let summary = manager
        .discover(
            &Request::search("x", 1),
            &options().with_cancel(token),
            DiscoveryMode::FirstSuccess,
        )
        .await
        .unwrap_err();

    assert!(summary.was_cancelled());
    let elapsed = started.elapsed();
    assert!(elapsed >= Duration::from_secs(1) && elapsed < Duration::from_secs(2));
    assert_eq!(b.calls(), 0);
    // An abandoned call is not a provider failure.
    assert_eq!(health_of(&manager, "a").consecutive_failures, 0);
}

#[tokio::test(start_paused = true)]
async fn cancellation_stops_broad_collection() {
    let a = MockConnector::new("a").with_delay(Duration::from_secs(10));
    let b = MockConnector::new("b").with_delay(Duration::from_secs(10));
    let manager = manager(&[&a, &b]);

    let token = CancellationToken::new();
    let trigger = token.clone();
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_secs(1)).await;
        trigger.cancel();
    });

    let summary = manager
        .discover(
            &Request::search("x", 1),
            &options().with_cancel(token),
            DiscoveryMode::Broad,
        )
        .await
        .unwrap_err();

    assert!(summary.was_cancelled());
    assert_eq!(summary.attempts.len(), 2);

    // Launched calls run to completion and still feed health.
    tokio::time::sleep(Duration::from_secs(20)).await;
    assert_eq!(a.calls(), 1);
    assert_eq!(b.calls(), 1);
    for id in ["a", "b"] {
        let health = health_of(&manager, id);
        assert!(
            health
                .recent_outcomes
                .iter()
                .any(|r| r.kind == OutcomeKind::Success { items: 1 }),
            "{id}: {:?}",
            health.recent_outcomes
        );
        assert_eq!(health.consecutive_failures, 0);
    }
}

#[tokio::test]
async fn blended_policy_promotes_reliable_provider() {
    let a = MockConnector::new("a").with_priority(20).failing(transient());
    let b = MockConnector::new("b").with_priority(10).returning(1);
    let config = ManagerConfig::default().with_rank_policy(RankPolicy::Blended {
        weight: 1.0,
        refresh: Duration::from_secs(300),
    });
    let manager = manager_with(config, &[&a, &b]);
    assert_eq!(manager.priority_order(), vec![pid("a"), pid("b")]);

    for _ in 0..3 {
        manager
            .discover(&Request::search("x", 1), &options(), DiscoveryMode::FirstSuccess)
            .await
            .unwrap();
    }
    // Ordering only changes on refresh.
    assert_eq!(manager.priority_order(), vec![pid("a"), pid("b")]);

    manager.refresh_ordering();
    assert_eq!(manager.priority_order(), vec![pid("b"), pid("a")]);
}

#[tokio::test]
async fn static_policy_ignores_ranks() {
    let a = MockConnector::new("a").with_priority(20).failing(transient());
    let b = MockConnector::new("b").with_priority(10);
    let manager = manager(&[&a, &b]);

    manager
        .discover(&Request::search("x", 1), &options(), DiscoveryMode::FirstSuccess)
        .await
        .unwrap();
    manager.refresh_ordering();

    assert_eq!(manager.priority_order(), vec![pid("a"), pid("b")]);
}

#[tokio::test]
async fn equal_priority_breaks_ties_by_id() {
    let z = MockConnector::new("zeta");
    let a = MockConnector::new("alpha");
    let manager = manager(&[&z, &a]);
    assert_eq!(manager.priority_order(), vec![pid("alpha"), pid("zeta")]);
}

#[tokio::test(start_paused = true)]
async fn rank_refresher_applies_new_order() {
    let a = MockConnector::new("a").with_priority(20).failing(transient());
    let b = MockConnector::new("b").with_priority(10);
    let config = ManagerConfig::default().with_rank_policy(RankPolicy::Blended {
        weight: 1.0,
        refresh: Duration::from_secs(60),
    });
    let manager = std::sync::Arc::new(manager_with(config, &[&a, &b]));

    manager
        .discover(&Request::search("x", 1), &options(), DiscoveryMode::FirstSuccess)
        .await
        .unwrap();

    let cancel = CancellationToken::new();
    let handle = manager.spawn_rank_refresher(cancel.clone()).unwrap();

    tokio::time::sleep(Duration::from_secs(61)).await;
    assert_eq!(manager.priority_order(), vec![pid("b"), pid("a")]);

    cancel.cancel();
    handle.await.unwrap();
}
