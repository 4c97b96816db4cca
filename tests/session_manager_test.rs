// tests/session_manager_test.rs
// Session manager behaviour against scripted providers
//
// Covers:
// 1. Timeout on one attempt, success on the next
// 2. Retry bound and timeout classification
// 3. Single-flight starts
// 4. Stop idempotence and cancellation of in-flight starts
// 5. At most one live tunnel per session
// 6. Configuration errors and offline mode

mod common;

use std::sync::Arc;
use std::time::{Duration, Instant};

use common::{Outcome, ScriptedProvider, fast_config, scripted_manager};
use devtunnel::provider::ProviderContext;
use devtunnel::{
    ProviderKind, TunnelConfig, TunnelEnv, TunnelError, TunnelSessionManager, TunnelState,
    TunnelStatus,
};

// ============================================================================
// Retry Loop
// ============================================================================

#[tokio::test]
async fn test_timeout_then_success_on_second_attempt() {
    let provider = ScriptedProvider::new(
        vec![Outcome::Hang, Outcome::Url("https://abc123.example.tunnel")],
        Outcome::Hang,
    );
    let manager = scripted_manager(provider.clone());
    let config = fast_config(8081).with_max_attempts(2);
    let key = config.key();

    let url = manager.start(config).await.unwrap();
    assert_eq!(url.as_deref(), Some("https://abc123.example.tunnel"));

    let snapshot = manager.snapshot(&key).await.unwrap();
    assert_eq!(snapshot.state, TunnelState::Connected);
    assert_eq!(snapshot.attempts, 2);
    assert_eq!(provider.counters.live(), 1);
    assert_eq!(provider.counters.peak(), 1);
    assert_eq!(
        manager.get_active_url(&key).await.as_deref(),
        Some("https://abc123.example.tunnel")
    );
}

#[tokio::test]
async fn test_retry_bound_is_exact() {
    let provider = ScriptedProvider::new(vec![], Outcome::Fail(TunnelError::connect("flaky")));
    let manager = scripted_manager(provider.clone());

    let err = manager
        .start(fast_config(3000).with_max_attempts(4))
        .await
        .unwrap_err();
    assert!(matches!(err, TunnelError::Connect { .. }));
    assert_eq!(provider.counters.connects(), 4);
    assert_eq!(provider.counters.live(), 0);
}

#[tokio::test]
async fn test_hanging_provider_times_out() {
    let provider = ScriptedProvider::new(vec![], Outcome::Hang);
    let manager = scripted_manager(provider.clone());
    let config = fast_config(3001)
        .with_connect_timeout(Duration::from_millis(100))
        .with_max_attempts(2);
    let key = config.key();

    let started = Instant::now();
    let err = manager.start(config).await.unwrap_err();
    assert!(err.is_timeout(), "expected timeout, got {:?}", err);
    assert!(err.remediation().is_some());
    assert!(started.elapsed() < Duration::from_secs(5));

    assert_eq!(provider.counters.connects(), 2);
    assert_eq!(provider.counters.live(), 0);
    let snapshot = manager.snapshot(&key).await.unwrap();
    assert_eq!(snapshot.state, TunnelState::Failed);
}

#[tokio::test]
async fn test_non_retryable_error_is_not_retried() {
    let provider = ScriptedProvider::new(
        vec![Outcome::Fail(TunnelError::fatal(
            "subdomain taken",
            Some("pick another".into()),
        ))],
        Outcome::Url("https://never.example.tunnel"),
    );
    let manager = scripted_manager(provider.clone());

    let err = manager
        .start(fast_config(3002).with_max_attempts(3))
        .await
        .unwrap_err();
    assert_eq!(err.remediation(), Some("pick another"));
    assert_eq!(provider.counters.connects(), 1);
}

// ============================================================================
// Single Flight
// ============================================================================

#[tokio::test]
async fn test_concurrent_starts_share_one_connect() {
    let provider = ScriptedProvider::new(
        vec![Outcome::UrlAfter(
            Duration::from_millis(100),
            "https://shared.example.tunnel",
        )],
        Outcome::Hang,
    );
    let manager = Arc::new(scripted_manager(provider.clone()));

    let handles: Vec<_> = (0..8)
        .map(|_| {
            let manager = manager.clone();
            tokio::spawn(async move { manager.start(fast_config(4000)).await })
        })
        .collect();

    for handle in handles {
        let url = handle.await.unwrap().unwrap();
        assert_eq!(url.as_deref(), Some("https://shared.example.tunnel"));
    }
    assert_eq!(provider.counters.connects(), 1);
}

#[tokio::test]
async fn test_connected_start_reuses_tunnel() {
    let provider = ScriptedProvider::new(vec![Outcome::Url("https://once.example.tunnel")], Outcome::Hang);
    let manager = scripted_manager(provider.clone());

    manager.start(fast_config(4001)).await.unwrap();
    let again = manager.start(fast_config(4001)).await.unwrap();
    assert_eq!(again.as_deref(), Some("https://once.example.tunnel"));
    assert_eq!(provider.counters.connects(), 1);
}

#[tokio::test]
async fn test_dead_tunnel_is_reconnected() {
    let provider = ScriptedProvider::new(
        vec![
            Outcome::Url("https://first.example.tunnel"),
            Outcome::Url("https://second.example.tunnel"),
        ],
        Outcome::Hang,
    );
    let manager = scripted_manager(provider.clone());
    let config = fast_config(4002);
    let key = config.key();

    manager.start(config.clone()).await.unwrap();
    provider.kill_links();
    assert!(manager.get_active_url(&key).await.is_none());

    let url = manager.start(config).await.unwrap();
    assert_eq!(url.as_deref(), Some("https://second.example.tunnel"));
    assert_eq!(provider.counters.connects(), 2);
    assert_eq!(provider.counters.live(), 1);
}

#[tokio::test]
async fn test_sessions_for_different_ports_are_independent() {
    let provider = ScriptedProvider::new(vec![], Outcome::Url("https://any.example.tunnel"));
    let manager = scripted_manager(provider.clone());

    manager.start(fast_config(5000)).await.unwrap();
    manager.start(fast_config(5001)).await.unwrap();
    assert_eq!(manager.active_keys().await.len(), 2);

    manager.stop(&fast_config(5000).key()).await;
    assert!(manager.get_active_url(&fast_config(5001).key()).await.is_some());
    assert_eq!(provider.counters.live(), 1);
}

// ============================================================================
// Stop
// ============================================================================

#[tokio::test]
async fn test_stop_is_idempotent() {
    let provider = ScriptedProvider::new(vec![], Outcome::Url("https://stop.example.tunnel"));
    let manager = scripted_manager(provider.clone());
    let config = fast_config(6000);
    let key = config.key();

    // Nothing to stop yet
    manager.stop(&key).await;

    manager.start(config).await.unwrap();
    manager.stop(&key).await;
    manager.stop(&key).await;

    assert!(manager.get_active_url(&key).await.is_none());
    assert!(manager.snapshot(&key).await.is_none());
    assert_eq!(provider.counters.live(), 0);
}

#[tokio::test]
async fn test_stop_cancels_in_flight_start() {
    let provider = ScriptedProvider::new(vec![], Outcome::Hang);
    let manager = Arc::new(scripted_manager(provider.clone()));
    let config = fast_config(6001).with_connect_timeout(Duration::from_secs(30));
    let key = config.key();

    let starting = {
        let manager = manager.clone();
        tokio::spawn(async move { manager.start(config).await })
    };
    tokio::time::sleep(Duration::from_millis(50)).await;

    manager.stop(&key).await;
    let result = tokio::time::timeout(Duration::from_secs(5), starting)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(result, Err(TunnelError::Cancelled));
    assert_eq!(provider.counters.live(), 0);
    assert!(manager.snapshot(&key).await.is_none());
}

#[tokio::test]
async fn test_at_most_one_live_tunnel_across_restarts() {
    let provider = ScriptedProvider::new(
        vec![
            Outcome::Hang,
            Outcome::Fail(TunnelError::connect("crashed")),
            Outcome::Url("https://a.example.tunnel"),
        ],
        Outcome::Url("https://b.example.tunnel"),
    );
    let manager = scripted_manager(provider.clone());
    let config = fast_config(6002).with_max_attempts(3);
    let key = config.key();

    for _ in 0..3 {
        manager.start(config.clone()).await.unwrap();
        manager.stop(&key).await;
    }
    manager.start(config).await.unwrap();

    assert_eq!(provider.counters.peak(), 1);
    assert_eq!(provider.counters.live(), 1);
    manager.shutdown().await;
    assert_eq!(provider.counters.live(), 0);
    assert!(manager.active_keys().await.is_empty());
}

#[tokio::test]
async fn test_start_during_stop_survives_the_stop() {
    let provider = ScriptedProvider::new(
        vec![Outcome::Hang],
        Outcome::Url("https://after-stop.example.tunnel"),
    );
    provider.set_stop_delay(Duration::from_millis(300));
    let manager = Arc::new(scripted_manager(provider.clone()));
    let config = fast_config(6003).with_connect_timeout(Duration::from_secs(30));
    let key = config.key();

    let first = {
        let manager = manager.clone();
        let config = config.clone();
        tokio::spawn(async move { manager.start(config).await })
    };
    tokio::time::sleep(Duration::from_millis(50)).await;

    // Cancels the hanging start, then waits while its link shuts down
    let stopping = {
        let manager = manager.clone();
        let key = key.clone();
        tokio::spawn(async move { manager.stop(&key).await })
    };
    tokio::time::sleep(Duration::from_millis(50)).await;

    let url = manager.start(config).await.unwrap();
    assert_eq!(url.as_deref(), Some("https://after-stop.example.tunnel"));

    tokio::time::timeout(Duration::from_secs(5), stopping)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(first.await.unwrap(), Err(TunnelError::Cancelled));

    // The older stop must not have torn down or forgotten the new tunnel
    assert_eq!(manager.get_active_url(&key).await, url);
    assert_eq!(manager.snapshot(&key).await.unwrap().state, TunnelState::Connected);
    assert_eq!(provider.counters.live(), 1);
    assert_eq!(provider.counters.peak(), 1);
}

// ============================================================================
// Notifications
// ============================================================================

#[tokio::test]
async fn test_status_events() {
    let provider = ScriptedProvider::new(
        vec![
            Outcome::Fail(TunnelError::connect("flaky")),
            Outcome::Url("https://events.example.tunnel"),
        ],
        Outcome::Hang,
    );
    let manager = scripted_manager(provider);
    let mut events = manager.subscribe();
    let config = fast_config(7000);
    let key = config.key();

    manager.start(config).await.unwrap();
    manager.stop(&key).await;

    let mut statuses = Vec::new();
    while let Ok(event) = events.try_recv() {
        assert_eq!(event.key, key);
        statuses.push(event.status);
    }
    assert_eq!(
        statuses,
        vec![
            TunnelStatus::Connecting { attempt: 1 },
            TunnelStatus::Connecting { attempt: 2 },
            TunnelStatus::Connected {
                url: "https://events.example.tunnel".into()
            },
            TunnelStatus::Closed,
        ]
    );
}

// ============================================================================
// Configuration
// ============================================================================

#[tokio::test]
async fn test_relay_on_wrong_port_is_rejected_up_front() {
    let manager = TunnelSessionManager::new(
        Arc::new(ProviderContext::from_defaults()),
        TunnelEnv::default(),
    );
    let config = TunnelConfig::new("/tmp/devtunnel-test", 9999, ProviderKind::ProprietaryRelay);
    let key = config.key();

    let err = manager.start(config).await.unwrap_err();
    assert!(matches!(err, TunnelError::Configuration(_)));
    assert!(manager.snapshot(&key).await.is_none());
}

#[tokio::test]
async fn test_offline_env_skips_everything() {
    let provider = ScriptedProvider::new(vec![], Outcome::Url("https://never.example.tunnel"));
    let env = TunnelEnv::from_lookup(|key| (key == "DEVTUNNEL_OFFLINE").then(|| "1".to_string()));
    let manager = TunnelSessionManager::new(Arc::new(common::ScriptedFactory(provider.clone())), env);

    assert_eq!(manager.start(fast_config(8000)).await.unwrap(), None);
    assert_eq!(provider.counters.connects(), 0);
}

#[tokio::test]
async fn test_env_overrides_attempt_policy() {
    let provider = ScriptedProvider::new(vec![], Outcome::Fail(TunnelError::connect("down")));
    let env = TunnelEnv::from_lookup(|key| match key {
        "DEVTUNNEL_MAX_ATTEMPTS" => Some("5".to_string()),
        _ => None,
    });
    let manager = TunnelSessionManager::new(Arc::new(common::ScriptedFactory(provider.clone())), env);

    // Attempts left unset in the config, so the env value applies
    assert!(manager.start(fast_config(8001)).await.is_err());
    assert_eq!(provider.counters.connects(), 5);
}

#[tokio::test]
async fn test_explicit_attempts_beat_env_even_at_default() {
    let provider = ScriptedProvider::new(vec![], Outcome::Fail(TunnelError::connect("down")));
    let env = TunnelEnv::from_lookup(|key| match key {
        "DEVTUNNEL_MAX_ATTEMPTS" => Some("5".to_string()),
        _ => None,
    });
    let manager = TunnelSessionManager::new(Arc::new(common::ScriptedFactory(provider.clone())), env);

    let config = fast_config(8002).with_max_attempts(devtunnel::config::DEFAULT_MAX_ATTEMPTS);
    assert!(manager.start(config).await.is_err());
    assert_eq!(provider.counters.connects(), 3);
}
