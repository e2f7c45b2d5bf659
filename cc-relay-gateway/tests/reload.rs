//! Hot-reload behaviour: router counter preservation across unrelated
//! reloads, strategy swaps taking effect without a restart, and in-flight
//! safety of pool rebuilds.

mod common;

use wiremock::matchers::method;
use wiremock::{Mock, MockServer, ResponseTemplate};

use cc_relay_gateway::config::Config;
use common::{messages_body, relay};

fn two_provider_config(uri_a: &str, uri_b: &str, strategy: &str, debug: bool) -> String {
    format!(
        r#"
        [[providers]]
        name = "a"
        type = "anthropic"
        base_url = "{uri_a}"

        [[providers.keys]]
        api_key = "sk-a"
        rpm = 100

        [[providers]]
        name = "b"
        type = "anthropic"
        base_url = "{uri_b}"

        [[providers.keys]]
        api_key = "sk-b"
        rpm = 100

        [routing]
        strategy = "{strategy}"
        failover_timeout_ms = 5000
        debug = {debug}
        "#
    )
}

fn ok_response() -> ResponseTemplate {
    ResponseTemplate::new(200).set_body_json(serde_json::json!({
        "id": "msg_01",
        "type": "message",
        "role": "assistant",
        "content": [{ "type": "text", "text": "ok" }],
        "model": "claude-sonnet-4-20250514",
        "stop_reason": "end_turn",
        "usage": { "input_tokens": 1, "output_tokens": 1 }
    }))
}

#[tokio::test]
async fn round_robin_counter_survives_unrelated_reload() {
    let backend_a = MockServer::start().await;
    let backend_b = MockServer::start().await;
    for backend in [&backend_a, &backend_b] {
        Mock::given(method("POST"))
            .respond_with(ok_response())
            .mount(backend)
            .await;
    }

    let relay = relay(&two_provider_config(
        &backend_a.uri(),
        &backend_b.uri(),
        "round-robin",
        false,
    ))
    .await;

    for _ in 0..4 {
        let response = relay
            .server
            .post("/v1/messages")
            .json(&messages_body())
            .await;
        assert_eq!(response.status_code(), 200);
    }
    assert_eq!(backend_a.received_requests().await.unwrap().len(), 2);
    assert_eq!(backend_b.received_requests().await.unwrap().len(), 2);

    // Reload with only the debug flag flipped: the router instance — and
    // its rotation counter — must survive.
    let updated = Config::parse(&two_provider_config(
        &backend_a.uri(),
        &backend_b.uri(),
        "round-robin",
        true,
    ))
    .unwrap();
    relay.lifecycle.apply(updated).await.unwrap();

    for _ in 0..4 {
        let response = relay
            .server
            .post("/v1/messages")
            .json(&messages_body())
            .await;
        assert_eq!(response.status_code(), 200);
    }

    // A naive rebuild would have reset the counter and produced 4/0 for
    // the second batch; preserved state yields exactly 4/4 overall.
    assert_eq!(backend_a.received_requests().await.unwrap().len(), 4);
    assert_eq!(backend_b.received_requests().await.unwrap().len(), 4);
    relay.lifecycle.shutdown().await;
}

#[tokio::test]
async fn strategy_swap_is_hot() {
    let backend_a = MockServer::start().await;
    let backend_b = MockServer::start().await;
    for backend in [&backend_a, &backend_b] {
        Mock::given(method("POST"))
            .respond_with(ok_response())
            .mount(backend)
            .await;
    }

    let relay = relay(&two_provider_config(
        &backend_a.uri(),
        &backend_b.uri(),
        "round-robin",
        true,
    ))
    .await;

    let response = relay
        .server
        .post("/v1/messages")
        .json(&messages_body())
        .await;
    assert_eq!(
        response.headers().get("x-cc-relay-strategy").unwrap(),
        "round-robin"
    );

    // Swap to failover (a = priority 0, b = priority 0; config order
    // breaks the tie) without restarting the server.
    let updated = Config::parse(&two_provider_config(
        &backend_a.uri(),
        &backend_b.uri(),
        "failover",
        true,
    ))
    .unwrap();
    relay.lifecycle.apply(updated).await.unwrap();

    for _ in 0..3 {
        let response = relay
            .server
            .post("/v1/messages")
            .json(&messages_body())
            .await;
        assert_eq!(
            response.headers().get("x-cc-relay-strategy").unwrap(),
            "failover"
        );
        assert_eq!(response.headers().get("x-cc-relay-provider").unwrap(), "a");
    }
    relay.lifecycle.shutdown().await;
}

#[tokio::test]
async fn reload_does_not_disturb_requests_in_flight() {
    let backend = MockServer::start().await;
    // A slow backend so the request is mid-flight during the reload.
    Mock::given(method("POST"))
        .respond_with(ok_response().set_delay(std::time::Duration::from_millis(300)))
        .mount(&backend)
        .await;

    let raw = common::single_provider_config(
        &backend.uri(),
        r#"
        [[providers.keys]]
        api_key = "sk-1"
        rpm = 100
        "#,
        "",
    );
    let relay = relay(&raw).await;

    let in_flight = relay.server.post("/v1/messages").json(&messages_body());

    let reload = async {
        // Give the request time to reach the backend, then reload under it.
        tokio::time::sleep(std::time::Duration::from_millis(100)).await;
        let updated = Config::parse(&common::single_provider_config(
            &backend.uri(),
            r#"
            [[providers.keys]]
            api_key = "sk-1-rotated"
            rpm = 100
            "#,
            "",
        ))
        .unwrap();
        relay.lifecycle.apply(updated).await.unwrap();
    };

    // The in-flight request completes against the old pool.
    let (response, ()) = tokio::join!(in_flight, reload);
    assert_eq!(response.status_code(), 200);

    // New requests pick up the rotated key.
    let response = relay
        .server
        .post("/v1/messages")
        .json(&messages_body())
        .await;
    assert_eq!(response.status_code(), 200);
    let last = backend.received_requests().await.unwrap();
    assert_eq!(
        last.last().unwrap().headers.get("x-api-key").unwrap(),
        "sk-1-rotated"
    );
    relay.lifecycle.shutdown().await;
}

#[tokio::test]
async fn invalid_reload_keeps_last_good_snapshot() {
    let backend = MockServer::start().await;
    Mock::given(method("POST"))
        .respond_with(ok_response())
        .mount(&backend)
        .await;

    let raw = common::single_provider_config(
        &backend.uri(),
        r#"
        [[providers.keys]]
        api_key = "sk-1"
        rpm = 100
        "#,
        "",
    );
    let relay = relay(&raw).await;

    // A provider type with no adapter fails the rebuild...
    let bad = format!(
        r#"
        [[providers]]
        name = "aws"
        type = "bedrock"
        base_url = "https://bedrock.test"

        [[providers.keys]]
        api_key = "sk-aws"
        "#
    );
    let bad_config = Config::parse(&bad).unwrap();
    assert!(relay.lifecycle.apply(bad_config).await.is_err());

    // ...and the relay keeps serving from the previous snapshot.
    let response = relay
        .server
        .post("/v1/messages")
        .json(&messages_body())
        .await;
    assert_eq!(response.status_code(), 200);
    assert_eq!(relay.lifecycle.config().providers[0].name, "anthropic");
    relay.lifecycle.shutdown().await;
}
