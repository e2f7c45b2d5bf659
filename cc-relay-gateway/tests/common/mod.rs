//! Shared fixtures for the gateway integration suites: a relay wired to
//! wiremock backends, plus request helpers.

use std::sync::Arc;

use axum_test::TestServer;
use serde_json::json;

use cc_relay_gateway::config::Config;
use cc_relay_gateway::lifecycle::Lifecycle;
use cc_relay_gateway::server::create_server;

pub struct TestRelay {
    pub server: TestServer,
    pub lifecycle: Arc<Lifecycle>,
}

/// Boot a relay from raw TOML (validated like production config).
pub async fn relay(raw_config: &str) -> TestRelay {
    let config = Config::parse(raw_config).expect("test config must validate");
    let lifecycle = Lifecycle::new(config, None)
        .await
        .expect("lifecycle boot");
    let server = TestServer::new(create_server(Arc::clone(&lifecycle))).expect("test server");
    TestRelay { server, lifecycle }
}

/// A minimal, valid Messages request body.
pub fn messages_body() -> serde_json::Value {
    json!({
        "model": "claude-sonnet-4-20250514",
        "max_tokens": 32,
        "messages": [{ "role": "user", "content": "hello" }]
    })
}

/// Config for a single provider with the given keys section.
pub fn single_provider_config(base_url: &str, keys: &str, extra: &str) -> String {
    format!(
        r#"
        [[providers]]
        name = "anthropic"
        type = "anthropic"
        base_url = "{base_url}"

        {keys}

        {extra}
        "#
    )
}
