use integration_tests::{TestServer, llms::LlmMock, sse_data};
use serde_json::{Value, json};

#[tokio::test]
async fn chat_completion_passes_through() {
    let mock = LlmMock::openai("openai");
    let recorded = mock.recorded();

    let mut builder = TestServer::builder();
    builder.spawn_llm(mock).await;

    let server = builder.build("").await;

    let request = json!({
        "model": "gpt-4o-mini",
        "messages": [{"role": "user", "content": "Hello"}],
        "temperature": 0.2
    });

    let (status, body) = server.client.post_json("/v1/chat/completions", &request).await;
    assert_eq!(status, 200);

    assert_eq!(body["object"], "chat.completion");
    assert_eq!(body["model"], "gpt-4o-mini");

    insta::assert_json_snapshot!(body["choices"], @r#"
    [
      {
        "finish_reason": "stop",
        "index": 0,
        "message": {
          "content": "Test response to: Hello",
          "role": "assistant"
        }
      }
    ]
    "#);

    assert_eq!(body["usage"]["prompt_tokens"], 10);
    assert_eq!(body["usage"]["completion_tokens"], 15);
    assert_eq!(body["usage"]["total_tokens"], 25);

    let upstream = recorded.last();
    assert_eq!(upstream.path, "/v1/chat/completions");
    assert_eq!(upstream.headers["authorization"], "Bearer test-key");
    assert_eq!(upstream.body["model"], "gpt-4o-mini");
    assert_eq!(upstream.body["temperature"], 0.2);
}

#[tokio::test]
async fn chat_completion_streams_until_done() {
    let mut builder = TestServer::builder();
    builder.spawn_llm(LlmMock::openai("openai")).await;

    let server = builder.build("").await;

    let request = json!({
        "model": "gpt-4o-mini",
        "messages": [{"role": "user", "content": "Hello"}],
        "stream": true
    });

    let response = server.client.post("/v1/chat/completions", &request).await;
    assert_eq!(response.status(), 200);
    assert_eq!(response.headers()["content-type"], "text/event-stream");

    let body = response.text().await.unwrap();
    let data = sse_data(&body);

    assert_eq!(data.last().map(String::as_str), Some("[DONE]"));

    let chunks: Vec<Value> = data[..data.len() - 1]
        .iter()
        .map(|chunk| serde_json::from_str(chunk).unwrap())
        .collect();

    let text: String = chunks
        .iter()
        .filter_map(|chunk| chunk["choices"][0]["delta"]["content"].as_str())
        .collect();

    assert_eq!(text, "Hello world");

    let finish_reasons: Vec<_> = chunks
        .iter()
        .filter_map(|chunk| chunk["choices"][0]["finish_reason"].as_str())
        .collect();

    assert_eq!(finish_reasons, vec!["stop"]);
    assert!(chunks.iter().all(|chunk| chunk["model"] == "gpt-4o-mini"));
}

#[tokio::test]
async fn legacy_completion_is_served_by_a_chat_provider() {
    let mock = LlmMock::openai("openai");
    let recorded = mock.recorded();

    let mut builder = TestServer::builder();
    builder.spawn_llm(mock).await;

    let server = builder.build("").await;

    let request = json!({
        "model": "gpt-4o-mini",
        "prompt": "Say hi",
        "max_tokens": 8
    });

    let (status, body) = server.client.post_json("/v1/completions", &request).await;
    assert_eq!(status, 200);

    assert_eq!(body["object"], "text_completion");
    assert_eq!(body["choices"][0]["text"], "Test response to: Say hi");

    let upstream = recorded.last();
    assert_eq!(upstream.body["messages"][0]["role"], "user");
}

#[tokio::test]
async fn invalid_json_is_rejected_in_openai_format() {
    let mut builder = TestServer::builder();
    builder.spawn_llm(LlmMock::openai("openai")).await;

    let server = builder.build("").await;

    let response = reqwest::Client::new()
        .post(format!("http://{}/v1/chat/completions", server.address))
        .header("content-type", "application/json")
        .body("{not json")
        .send()
        .await
        .unwrap();

    assert_eq!(response.status(), 400);

    let body: Value = response.json().await.unwrap();
    assert_eq!(body["error"]["type"], "invalid_request_error");
    assert_eq!(body["error"]["code"], 400);
}
