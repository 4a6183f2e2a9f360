//! Configuration reloads while serving.

use indoc::{formatdoc, indoc};
use integration_tests::{
    TestServer,
    llms::{LlmMock, provider_config},
};
use serde_json::{Value, json};

fn chat() -> Value {
    json!({
        "model": "gpt-4o",
        "messages": [{"role": "user", "content": "Hello"}]
    })
}

#[tokio::test]
async fn reload_switches_providers() {
    let first = LlmMock::openai("first");
    let first_requests = first.recorded();

    let second = LlmMock::openai("second");
    let second_requests = second.recorded();
    let second = second.spawn().await.unwrap();

    let mut builder = TestServer::builder();
    builder.spawn_llm(first).await;

    let server = builder.build("").await;

    let (status, _) = server.client.post_json("/v1/chat/completions", &chat()).await;
    assert_eq!(status, 200);
    assert_eq!(first_requests.count(), 1);

    let version = server.reload(&provider_config(&second)).unwrap();
    assert_eq!(version, 2);

    let (status, _) = server.client.post_json("/v1/chat/completions", &chat()).await;
    assert_eq!(status, 200);

    assert_eq!(first_requests.count(), 1);
    assert_eq!(second_requests.count(), 1);

    let health: Value = server.client.get("/health").await.json().await.unwrap();
    assert_eq!(health["config_version"], 2);
}

#[tokio::test]
async fn invalid_reload_keeps_serving_the_old_config() {
    let mut builder = TestServer::builder();
    builder.spawn_llm(LlmMock::openai("openai")).await;

    let server = builder.build("").await;

    let invalid = indoc! {r#"
        [providers.broken]
        type = "openai"
        weight = 0
    "#};

    assert!(server.reload(&invalid).is_err());
    assert_eq!(server.gateway.version(), 1);

    let (status, _) = server.client.post_json("/v1/chat/completions", &chat()).await;
    assert_eq!(status, 200);
}

#[tokio::test]
async fn reload_applies_new_credentials() {
    let mut builder = TestServer::builder();
    builder.spawn_llm(LlmMock::openai("openai")).await;

    let server = builder.build("").await;

    let (status, _) = server.client.post_json("/v1/chat/completions", &chat()).await;
    assert_eq!(status, 200);

    let snapshot = server.gateway.snapshot();
    let base = snapshot.provider("openai").unwrap().base_url.clone();

    let locked = formatdoc! {r#"
        [providers.openai]
        type = "openai"
        api_key = "test-key"
        api_base = "{base}"

        [credentials.team]
        key_hash = "2bb80d537b1da3e38bd30361aa855686bde0eacd7162fef6a25fe97bf527a25b"
    "#,
        base = base,
    };

    server.reload(&locked).unwrap();

    let (status, _) = server.client.post_json("/v1/chat/completions", &chat()).await;
    assert_eq!(status, 401);

    let (status, _) = server
        .client
        .with_api_key("secret")
        .post_json("/v1/chat/completions", &chat())
        .await;

    assert_eq!(status, 200);
}
