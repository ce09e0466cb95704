//! Integration tests for the common Tether workflows over HTTP.
//!
//! A mock server plays the remote data service; the manual clock makes retry
//! delays and staleness instantaneous.

use serde_json::{Value, json};
use std::sync::Arc;
use std::time::Duration;
use tether::prelude::*;
use tether::{CircuitBreakerConfig, ManualClock, RetryConfig};
use wiremock::matchers::{method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

fn config() -> TetherConfig {
    TetherConfig::builder()
        .retry(RetryConfig {
            max_attempts: 2,
            base_delay: Duration::from_millis(100),
            max_delay: Duration::from_secs(1),
            backoff_factor: 2.0,
        })
        .circuit_breaker(CircuitBreakerConfig::default().failure_threshold(2))
        .check_interval(Duration::ZERO)
        .auto_replay(false)
        .build()
}

fn remote(server: &MockServer) -> RemoteApi {
    RemoteApi::new(
        RemoteApiConfig::builder(server.uri())
            .timeout(Duration::from_secs(2))
            .build(),
    )
    .unwrap()
}

// =============================================================================
// Reads
// =============================================================================

#[tokio::test]
async fn read_falls_back_to_stale_cache() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/Patient/1"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({"name": "Ada"})))
        .up_to_n_times(1)
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .and(path("/Patient/1"))
        .respond_with(ResponseTemplate::new(502))
        .mount(&server)
        .await;

    let clock = ManualClock::new();
    let api = remote(&server);
    let client = ResilientClient::builder(config())
        .clock(clock.shared())
        .build()
        .unwrap();
    let request = || ReadRequest::new(keys::patient("1")).class(keys::PATIENT);

    let fresh: Fetched<Value> = client
        .read(request(), || api.get_json("/Patient/1"))
        .await
        .unwrap();
    assert!(!fresh.from_cache);

    clock.advance(Duration::from_secs(10 * 60));
    let stale: Fetched<Value> = client
        .read(request(), || api.get_json("/Patient/1"))
        .await
        .unwrap();
    assert!(stale.from_cache);
    assert!(stale.is_stale);
    assert_eq!(stale.data["name"], "Ada");
}

#[tokio::test]
async fn breaker_stops_hitting_a_failing_service() {
    let server = MockServer::start().await;
    // Two reads of two attempts each trip the breaker.
    Mock::given(method("GET"))
        .respond_with(ResponseTemplate::new(500))
        .expect(4)
        .mount(&server)
        .await;

    let api = remote(&server);
    let client = ResilientClient::builder(config())
        .clock(ManualClock::new().shared())
        .build()
        .unwrap();

    for _ in 0..2 {
        let err = client
            .read::<Value, _, _>(ReadRequest::new("resource:Observation:list"), || {
                api.get_json("/Observation")
            })
            .await
            .unwrap_err();
        assert_eq!(err.status_code(), Some(500));
    }
    assert_eq!(client.circuit_breaker_state(), CircuitState::Open);

    let rejected = client
        .read::<Value, _, _>(ReadRequest::new("resource:Observation:list"), || {
            api.get_json("/Observation")
        })
        .await
        .unwrap_err();
    assert!(rejected.is_circuit_open());

    let stats = &client.circuit_breaker_stats()[0];
    assert_eq!(stats.total_failures, 2);
    assert_eq!(stats.total_rejections, 1);
}

// =============================================================================
// Offline mutations
// =============================================================================

#[tokio::test]
async fn offline_mutations_replay_over_http_in_order() {
    let server = MockServer::start().await;
    Mock::given(method("HEAD"))
        .and(path("/health"))
        .respond_with(ResponseTemplate::new(200))
        .mount(&server)
        .await;
    Mock::given(method("POST"))
        .and(path("/Patient"))
        .respond_with(ResponseTemplate::new(201).set_body_json(json!({"id": "p1"})))
        .expect(1)
        .mount(&server)
        .await;
    Mock::given(method("PUT"))
        .and(path("/Patient/p1"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({"id": "p1"})))
        .expect(1)
        .mount(&server)
        .await;

    let api = remote(&server);
    let mut settings = config();
    settings.connectivity.initial_online = false;
    let probe = api.probe(&settings.connectivity).unwrap();
    let client = ResilientClient::builder(settings)
        .clock(ManualClock::new().shared())
        .probe(Arc::new(probe))
        .build()
        .unwrap();

    let create_api = api.clone();
    client.register_replay("createPatient", move |op| {
        let api = create_api.clone();
        async move {
            api.post_json::<_, Value>("Patient", &op.payload)
                .await
                .map(|_| ())
        }
    });
    let update_api = api.clone();
    client.register_replay("updatePatient", move |op| {
        let api = update_api.clone();
        async move {
            api.put_json::<_, Value>("Patient/p1", &op.payload)
                .await
                .map(|_| ())
        }
    });

    let create = json!({"name": "Ada"});
    let err = client
        .mutate(
            Mutation::new("createPatient", create.clone()).class(keys::PATIENT),
            || api.post_json::<_, Value>("Patient", &create),
        )
        .await
        .unwrap_err();
    assert!(err.is_queued_for_offline());

    let update = json!({"name": "Ada Lovelace"});
    let err = client
        .mutate(
            Mutation::new("updatePatient", update.clone()).class(keys::PATIENT),
            || api.put_json::<_, Value>("Patient/p1", &update),
        )
        .await
        .unwrap_err();
    assert!(err.is_queued_for_offline());
    assert_eq!(client.queue_status().pending, 2);

    assert!(client.check_connection().await);
    let report = client.retry_failed_operations().await.unwrap();
    assert_eq!(report.processed, 2);
    assert_eq!(client.queue_status().pending, 0);

    let writes: Vec<String> = server
        .received_requests()
        .await
        .unwrap()
        .into_iter()
        .filter(|r| r.method.as_str() != "HEAD")
        .map(|r| format!("{} {}", r.method.as_str(), r.url.path()))
        .collect();
    assert_eq!(writes, vec!["POST /Patient", "PUT /Patient/p1"]);
}

#[tokio::test]
async fn probe_failure_keeps_queue_intact() {
    let server = MockServer::start().await;
    Mock::given(method("HEAD"))
        .respond_with(ResponseTemplate::new(503))
        .mount(&server)
        .await;

    let api = remote(&server);
    let mut settings = config();
    settings.connectivity.initial_online = false;
    let client = ResilientClient::builder(settings.clone())
        .clock(ManualClock::new().shared())
        .probe(Arc::new(api.probe(&settings.connectivity).unwrap()))
        .build()
        .unwrap();

    let _ = client
        .mutate(Mutation::new("createPatient", json!({})), || async { Ok(()) })
        .await;

    assert!(!client.check_connection().await);
    let err = client.retry_failed_operations().await.unwrap_err();
    assert!(matches!(err, Error::Offline));
    assert_eq!(client.queue_status().pending, 1);
}
