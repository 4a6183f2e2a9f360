use integration_tests::{TestServer, llms::LlmMock, sse_data};
use serde_json::{Value, json};

#[tokio::test]
async fn openai_client_is_served_by_gemini() {
    let mock = LlmMock::google("gemini");
    let recorded = mock.recorded();

    let mut builder = TestServer::builder();
    builder.spawn_llm(mock).await;

    let server = builder.build("").await;

    let request = json!({
        "model": "gemini-2.0-flash",
        "messages": [{"role": "user", "content": "Hello"}]
    });

    let (status, body) = server.client.post_json("/v1/chat/completions", &request).await;
    assert_eq!(status, 200);

    assert_eq!(body["choices"][0]["message"]["content"], "Test response to: Hello");
    assert_eq!(body["choices"][0]["finish_reason"], "stop");
    assert_eq!(body["usage"]["total_tokens"], 25);

    let upstream = recorded.last();
    assert_eq!(upstream.path, "/v1beta/models/gemini-2.0-flash:generateContent");
    assert_eq!(upstream.headers["x-goog-api-key"], "test-key");
    assert_eq!(upstream.body["contents"][0]["role"], "user");
}

#[tokio::test]
async fn gemini_stream_reaches_an_openai_client() {
    let mock = LlmMock::google("gemini");
    let recorded = mock.recorded();

    let mut builder = TestServer::builder();
    builder.spawn_llm(mock).await;

    let server = builder.build("").await;

    let request = json!({
        "model": "gemini-2.0-flash",
        "messages": [{"role": "user", "content": "Hello"}],
        "stream": true
    });

    let response = server.client.post("/v1/chat/completions", &request).await;
    assert_eq!(response.status(), 200);

    let body = response.text().await.unwrap();
    let data = sse_data(&body);

    assert_eq!(data.last().map(String::as_str), Some("[DONE]"));

    let text: String = data
        .iter()
        .filter_map(|chunk| serde_json::from_str::<Value>(chunk).ok())
        .filter_map(|chunk| chunk["choices"][0]["delta"]["content"].as_str().map(str::to_string))
        .collect();

    assert_eq!(text, "Hello world");

    let upstream = recorded.last();
    assert_eq!(upstream.path, "/v1beta/models/gemini-2.0-flash:streamGenerateContent");
}
