use std::time::Duration;

use indoc::indoc;
use integration_tests::{
    TestServer,
    llms::{Failure, LlmMock},
    sse_data,
};
use serde_json::{Value, json};

#[tokio::test]
async fn upstream_rate_limit_is_passed_through() {
    let mock = LlmMock::openai("openai").with_failure(Failure::Status(429, "Rate limit reached for gpt-4o".into()));

    let mut builder = TestServer::builder();
    builder.spawn_llm(mock).await;

    let server = builder.build("").await;

    let request = json!({
        "model": "gpt-4o",
        "messages": [{"role": "user", "content": "Hello"}]
    });

    let (status, body) = server.client.post_json("/v1/chat/completions", &request).await;
    assert_eq!(status, 429);

    insta::assert_json_snapshot!(body, @r#"
    {
      "error": {
        "code": 429,
        "message": "Provider API error (429): Rate limit reached for gpt-4o",
        "type": "rate_limit_error"
      }
    }
    "#);
}

#[tokio::test]
async fn upstream_error_in_anthropic_format() {
    let mock = LlmMock::openai("openai").with_failure(Failure::Status(401, "bad upstream key".into()));

    let mut builder = TestServer::builder();
    builder.spawn_llm(mock).await;

    let server = builder.build("").await;

    let request = json!({
        "model": "gpt-4o",
        "max_tokens": 16,
        "messages": [{"role": "user", "content": "Hello"}]
    });

    let (status, body) = server.client.post_json("/v1/messages", &request).await;
    assert_eq!(status, 401);

    insta::assert_json_snapshot!(body, @r#"
    {
      "error": {
        "message": "Provider API error (401): bad upstream key",
        "type": "authentication_error"
      },
      "type": "error"
    }
    "#);
}

#[tokio::test]
async fn client_errors_do_not_open_the_breaker() {
    let config = indoc! {r#"
        [breaker]
        min_requests = 1
    "#};

    let mock = LlmMock::openai("openai").with_failure(Failure::Status(400, "bad request".into()));
    let recorded = mock.recorded();

    let mut builder = TestServer::builder();
    builder.spawn_llm(mock).await;

    let server = builder.build(config).await;

    let request = json!({
        "model": "gpt-4o",
        "messages": [{"role": "user", "content": "Hello"}]
    });

    for _ in 0..3 {
        let (status, _) = server.client.post_json("/v1/chat/completions", &request).await;
        assert_eq!(status, 400);
    }

    assert_eq!(recorded.count(), 3);
    assert_eq!(server.gateway.breakers().status("openai"), llm::BreakerStatus::Closed);
}

#[tokio::test]
async fn broken_stream_ends_with_one_error_event() {
    let mock = LlmMock::openai("openai").with_failure(Failure::AbortStream);

    let mut builder = TestServer::builder();
    builder.spawn_llm(mock).await;

    let server = builder.build("").await;

    let request = json!({
        "model": "gpt-4o",
        "messages": [{"role": "user", "content": "Hello"}],
        "stream": true
    });

    let response = server.client.post("/v1/chat/completions", &request).await;
    assert_eq!(response.status(), 200);

    let body = response.text().await.unwrap();
    let data = sse_data(&body);

    assert!(!data.iter().any(|data| data == "[DONE]"));

    let events: Vec<Value> = data.iter().map(|data| serde_json::from_str(data).unwrap()).collect();
    let errors: Vec<_> = events.iter().filter(|event| event.get("error").is_some()).collect();

    assert_eq!(errors.len(), 1);
    assert_eq!(errors[0]["error"]["type"], "network_error");
    assert!(events.last().unwrap().get("error").is_some());

    assert!(events
        .iter()
        .any(|event| event["choices"][0]["delta"]["content"] == "Hello"));
}

#[tokio::test]
async fn slow_first_token_times_out() {
    let config = indoc! {r#"
        [gateway]
        ttft_timeout = "200ms"
    "#};

    let mock = LlmMock::openai("openai").with_delay(Duration::from_secs(5));

    let mut builder = TestServer::builder();
    builder.spawn_llm(mock).await;

    let server = builder.build(config).await;

    let request = json!({
        "model": "gpt-4o",
        "messages": [{"role": "user", "content": "Hello"}],
        "stream": true
    });

    let (status, body) = server.client.post_json("/v1/chat/completions", &request).await;
    assert_eq!(status, 504);
    assert_eq!(body["error"]["type"], "timeout_error");
}

#[tokio::test]
async fn slow_response_hits_the_request_timeout() {
    let config = indoc! {r#"
        [gateway]
        request_timeout = "300ms"
        ttft_timeout = "100ms"
    "#};

    let mock = LlmMock::openai("openai").with_delay(Duration::from_secs(5));

    let mut builder = TestServer::builder();
    builder.spawn_llm(mock).await;

    let server = builder.build(config).await;

    let request = json!({
        "model": "gpt-4o",
        "messages": [{"role": "user", "content": "Hello"}]
    });

    let (status, body) = server.client.post_json("/v1/chat/completions", &request).await;
    assert_eq!(status, 504);
    assert_eq!(body["error"]["message"], "Upstream request timeout exceeded");
}

#[tokio::test]
async fn missing_model_is_rejected() {
    let mut builder = TestServer::builder();
    builder.spawn_llm(LlmMock::openai("openai")).await;

    let server = builder.build("").await;

    let request = json!({
        "messages": [{"role": "user", "content": "Hello"}]
    });

    let (status, body) = server.client.post_json("/v1/chat/completions", &request).await;
    assert_eq!(status, 400);
    assert_eq!(body["error"]["type"], "invalid_request_error");
}
