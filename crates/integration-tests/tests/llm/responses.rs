use integration_tests::{TestServer, llms::LlmMock, sse_data};
use serde_json::{Value, json};

#[tokio::test]
async fn responses_client_is_served_by_chat_completions() {
    let mock = LlmMock::openai("openai");
    let recorded = mock.recorded();

    let mut builder = TestServer::builder();
    builder.spawn_llm(mock).await;

    let server = builder.build("").await;

    let request = json!({
        "model": "gpt-4o-mini",
        "instructions": "Be brief.",
        "input": "Hello"
    });

    let (status, body) = server.client.post_json("/v1/responses", &request).await;
    assert_eq!(status, 200);

    assert_eq!(body["object"], "response");
    assert_eq!(body["status"], "completed");
    assert_eq!(body["model"], "gpt-4o-mini");

    let text = body["output"]
        .as_array()
        .unwrap()
        .iter()
        .filter(|item| item["type"] == "message")
        .flat_map(|item| item["content"].as_array().unwrap().iter())
        .filter_map(|part| part["text"].as_str())
        .collect::<String>();

    assert_eq!(text, "Test response to: Hello");

    let upstream = recorded.last();
    assert_eq!(upstream.body["messages"][0]["role"], "system");
}

#[tokio::test]
async fn responses_stream_ends_with_completed() {
    let mut builder = TestServer::builder();
    builder.spawn_llm(LlmMock::openai("openai")).await;

    let server = builder.build("").await;

    let request = json!({
        "model": "gpt-4o-mini",
        "input": "Hello",
        "stream": true
    });

    let response = server.client.post("/v1/responses", &request).await;
    assert_eq!(response.status(), 200);

    let body = response.text().await.unwrap();

    let events: Vec<Value> = sse_data(&body)
        .iter()
        .filter_map(|data| serde_json::from_str(data).ok())
        .collect();

    assert_eq!(events.first().unwrap()["type"], "response.created");
    assert_eq!(events.last().unwrap()["type"], "response.completed");

    let text: String = events
        .iter()
        .filter(|event| event["type"] == "response.output_text.delta")
        .filter_map(|event| event["delta"].as_str())
        .collect();

    assert_eq!(text, "Hello world");
}
