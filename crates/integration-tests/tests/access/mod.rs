//! Authentication, per-credential rate limits and model allow-lists.

use indoc::indoc;
use integration_tests::{TestServer, llms::LlmMock};
use serde_json::{Value, json};

const CREDENTIALS: &str = indoc! {r#"
    [credentials.team]
    key_hash = "2bb80d537b1da3e38bd30361aa855686bde0eacd7162fef6a25fe97bf527a25b"
    allowed_models = ["gpt-4o-mini"]
    rate_limit = { requests_per_second = 1 }
"#};

fn chat(model: &str) -> Value {
    json!({
        "model": model,
        "messages": [{"role": "user", "content": "Hello"}]
    })
}

async fn server() -> TestServer {
    let mut builder = TestServer::builder();
    builder.spawn_llm(LlmMock::openai("openai")).await;
    builder.build(CREDENTIALS).await
}

#[tokio::test]
async fn missing_key_is_rejected_in_openai_format() {
    let server = server().await;

    let (status, body) = server.client.post_json("/v1/chat/completions", &chat("gpt-4o-mini")).await;
    assert_eq!(status, 401);

    insta::assert_json_snapshot!(body, @r#"
    {
      "error": {
        "code": 401,
        "message": "Invalid or missing API key",
        "type": "authentication_error"
      }
    }
    "#);
}

#[tokio::test]
async fn unknown_key_is_rejected_in_anthropic_format() {
    let server = server().await;

    let request = json!({
        "model": "gpt-4o-mini",
        "max_tokens": 16,
        "messages": [{"role": "user", "content": "Hello"}]
    });

    let response = server
        .client
        .post_with_header("/v1/messages", &request, "x-api-key", "not-the-key")
        .await;

    assert_eq!(response.status(), 401);

    let body: Value = response.json().await.unwrap();

    insta::assert_json_snapshot!(body, @r#"
    {
      "error": {
        "message": "Invalid or missing API key",
        "type": "authentication_error"
      },
      "type": "error"
    }
    "#);
}

#[tokio::test]
async fn anthropic_clients_authenticate_with_x_api_key() {
    let server = server().await;

    let request = json!({
        "model": "gpt-4o-mini",
        "max_tokens": 16,
        "messages": [{"role": "user", "content": "Hello"}]
    });

    let response = server
        .client
        .post_with_header("/v1/messages", &request, "x-api-key", "secret")
        .await;

    assert_eq!(response.status(), 200);

    let body: Value = response.json().await.unwrap();
    assert_eq!(body["type"], "message");
}

#[tokio::test]
async fn second_request_within_the_second_is_rate_limited() {
    let server = server().await;
    let client = server.client.with_api_key("secret");

    let response = client.post("/v1/chat/completions", &chat("gpt-4o-mini")).await;
    assert_eq!(response.status(), 200);

    let response = client.post("/v1/chat/completions", &chat("gpt-4o-mini")).await;
    assert_eq!(response.status(), 429);

    let retry_after = response.headers().get("retry-after").unwrap().to_str().unwrap().to_string();
    assert_eq!(retry_after, "1");

    let body: Value = response.json().await.unwrap();
    assert_eq!(body["error"]["type"], "rate_limit_error");
}

#[tokio::test]
async fn token_counting_is_not_rate_limited() {
    let server = server().await;
    let client = server.client.with_api_key("secret");

    let request = json!({
        "model": "gpt-4o-mini",
        "messages": [{"role": "user", "content": "Hello, world"}]
    });

    for _ in 0..3 {
        let (status, body) = client.post_json("/v1/messages/count_tokens", &request).await;

        assert_eq!(status, 200);
        assert!(body["input_tokens"].as_u64().unwrap() > 0);
    }
}

#[tokio::test]
async fn model_outside_the_allow_list_is_forbidden() {
    let server = server().await;
    let client = server.client.with_api_key("secret");

    let (status, body) = client.post_json("/v1/chat/completions", &chat("gpt-4o")).await;
    assert_eq!(status, 403);
    assert_eq!(body["error"]["type"], "permission_error");
}

#[tokio::test]
async fn models_are_listed_per_credential() {
    let config = indoc! {r#"
        [gateway]
        model_prefix = "conduit/"

        [credentials.team]
        key_hash = "2bb80d537b1da3e38bd30361aa855686bde0eacd7162fef6a25fe97bf527a25b"
        allowed_models = ["fast"]
    "#};

    let mut builder = TestServer::builder();

    builder
        .spawn_llm(LlmMock::openai("openai").with_config(
            r#"model_mapping = [{ from = "fast", to = "gpt-4o-mini" }, { from = "smart", to = "gpt-4o" }]"#,
        ))
        .await;

    let server = builder.build(config).await;

    let response = server.client.with_api_key("secret").get("/v1/models").await;
    assert_eq!(response.status(), 200);

    let body: Value = response.json().await.unwrap();

    insta::assert_json_snapshot!(body, @r#"
    {
      "data": [
        {
          "created": 1719475200,
          "id": "conduit/fast",
          "object": "model",
          "owned_by": "conduit"
        }
      ],
      "object": "list"
    }
    "#);
}
