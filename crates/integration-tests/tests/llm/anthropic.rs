use integration_tests::{TestServer, llms::LlmMock, sse_data, sse_event_names};
use serde_json::{Value, json};

#[tokio::test]
async fn messages_client_is_served_by_openai() {
    let mock = LlmMock::openai("openai");
    let recorded = mock.recorded();

    let mut builder = TestServer::builder();
    builder.spawn_llm(mock).await;

    let server = builder.build("").await;

    let request = json!({
        "model": "gpt-4o-mini",
        "max_tokens": 64,
        "system": "Be brief.",
        "messages": [{"role": "user", "content": "Hello"}]
    });

    let (status, body) = server.client.post_json("/v1/messages", &request).await;
    assert_eq!(status, 200);

    assert_eq!(body["type"], "message");
    assert_eq!(body["role"], "assistant");
    assert_eq!(body["model"], "gpt-4o-mini");
    assert_eq!(body["stop_reason"], "end_turn");

    insta::assert_json_snapshot!(body["content"], @r#"
    [
      {
        "text": "Test response to: Hello",
        "type": "text"
      }
    ]
    "#);

    assert_eq!(body["usage"]["input_tokens"], 10);
    assert_eq!(body["usage"]["output_tokens"], 15);

    let upstream = recorded.last();
    let roles: Vec<_> = upstream.body["messages"]
        .as_array()
        .unwrap()
        .iter()
        .map(|message| message["role"].as_str().unwrap().to_string())
        .collect();

    assert_eq!(roles, vec!["system", "user"]);
}

#[tokio::test]
async fn openai_client_is_served_by_anthropic() {
    let mock = LlmMock::anthropic("anthropic");
    let recorded = mock.recorded();

    let mut builder = TestServer::builder();
    builder.spawn_llm(mock).await;

    let server = builder.build("").await;

    let request = json!({
        "model": "claude-sonnet-4",
        "messages": [
            {"role": "system", "content": "Be brief."},
            {"role": "user", "content": "Hello"}
        ]
    });

    let (status, body) = server.client.post_json("/v1/chat/completions", &request).await;
    assert_eq!(status, 200);

    assert_eq!(body["choices"][0]["message"]["content"], "Test response to: Hello");
    assert_eq!(body["choices"][0]["finish_reason"], "stop");
    assert_eq!(body["model"], "claude-sonnet-4");

    let upstream = recorded.last();
    assert_eq!(upstream.path, "/v1/messages");
    assert_eq!(upstream.headers["x-api-key"], "test-key");
    assert_eq!(upstream.headers["anthropic-version"], "2023-06-01");
    assert_eq!(upstream.body["system"], "Be brief.");
    assert!(upstream.body["max_tokens"].as_u64().is_some());
}

#[tokio::test]
async fn messages_stream_from_anthropic_keeps_event_names() {
    let mut builder = TestServer::builder();
    builder.spawn_llm(LlmMock::anthropic("anthropic")).await;

    let server = builder.build("").await;

    let request = json!({
        "model": "claude-sonnet-4",
        "max_tokens": 64,
        "stream": true,
        "messages": [{"role": "user", "content": "Hello"}]
    });

    let response = server.client.post("/v1/messages", &request).await;
    assert_eq!(response.status(), 200);

    let body = response.text().await.unwrap();
    let names = sse_event_names(&body);

    assert_eq!(names.first().map(String::as_str), Some("message_start"));
    assert_eq!(names.last().map(String::as_str), Some("message_stop"));
    assert!(names.iter().any(|name| name == "message_delta"));

    let text: String = sse_data(&body)
        .iter()
        .filter_map(|data| serde_json::from_str::<Value>(data).ok())
        .filter(|event| event["type"] == "content_block_delta")
        .filter_map(|event| event["delta"]["text"].as_str().map(str::to_string))
        .collect();

    assert_eq!(text, "Hello world");
}

#[tokio::test]
async fn token_count_for_messages() {
    let mut builder = TestServer::builder();
    builder.spawn_llm(LlmMock::anthropic("anthropic")).await;

    let server = builder.build("").await;

    let request = json!({
        "model": "claude-sonnet-4",
        "messages": [{"role": "user", "content": "Hello"}]
    });

    let (status, body) = server.client.post_json("/v1/messages/count_tokens", &request).await;
    assert_eq!(status, 200);

    let tokens = body["input_tokens"].as_u64().unwrap();
    assert!(tokens > 0 && tokens < 32, "unexpected count {tokens}");
}
