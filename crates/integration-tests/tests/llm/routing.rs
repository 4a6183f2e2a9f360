//! Provider selection: model mapping, prefixes, weights and circuit breakers.

use indoc::indoc;
use integration_tests::{
    TestServer,
    llms::{Failure, LlmMock},
};
use serde_json::{Value, json};

fn chat(model: &str) -> Value {
    json!({
        "model": model,
        "messages": [{"role": "user", "content": "Hello"}]
    })
}

#[tokio::test]
async fn prefixed_alias_is_mapped_to_the_provider_model() {
    let config = indoc! {r#"
        [gateway]
        model_prefix = "conduit/"
    "#};

    let openai = LlmMock::openai("openai").with_config(r#"model_mapping = [{ from = "fast", to = "gpt-4o-mini" }]"#);
    let openai_requests = openai.recorded();

    let claude = LlmMock::anthropic("claude").with_config(r#"model_mapping = [{ from = "claude-*", to = "claude-sonnet-4" }]"#);
    let claude_requests = claude.recorded();

    let mut builder = TestServer::builder();
    builder.spawn_llm(openai).await;
    builder.spawn_llm(claude).await;

    let server = builder.build(config).await;

    let (status, body) = server.client.post_json("/v1/chat/completions", &chat("conduit/fast")).await;
    assert_eq!(status, 200);
    assert_eq!(body["model"], "conduit/fast");
    assert_eq!(openai_requests.last().body["model"], "gpt-4o-mini");

    let (status, _) = server.client.post_json("/v1/chat/completions", &chat("claude-latest")).await;
    assert_eq!(status, 200);
    assert_eq!(claude_requests.last().body["model"], "claude-sonnet-4");

    assert_eq!(openai_requests.count(), 1);
    assert_eq!(claude_requests.count(), 1);
}

#[tokio::test]
async fn unmapped_model_has_no_provider() {
    let mut builder = TestServer::builder();

    builder
        .spawn_llm(LlmMock::openai("openai").with_config(r#"model_mapping = [{ from = "fast", to = "gpt-4o-mini" }]"#))
        .await;

    let server = builder.build("").await;

    let (status, body) = server.client.post_json("/v1/chat/completions", &chat("slow")).await;
    assert_eq!(status, 503);

    insta::assert_json_snapshot!(body, @r#"
    {
      "error": {
        "code": "no_eligible_provider",
        "message": "No eligible provider for model 'slow'",
        "type": "no_eligible_provider"
      }
    }
    "#);
}

#[tokio::test]
async fn disabled_provider_is_skipped() {
    let disabled = LlmMock::openai("disabled").with_config("enabled = false");
    let disabled_requests = disabled.recorded();

    let active = LlmMock::openai("active");
    let active_requests = active.recorded();

    let mut builder = TestServer::builder();
    builder.spawn_llm(disabled).await;
    builder.spawn_llm(active).await;

    let server = builder.build("").await;

    for _ in 0..5 {
        let (status, _) = server.client.post_json("/v1/chat/completions", &chat("gpt-4o")).await;
        assert_eq!(status, 200);
    }

    assert_eq!(disabled_requests.count(), 0);
    assert_eq!(active_requests.count(), 5);
}

#[tokio::test]
async fn open_breaker_takes_the_provider_out_of_rotation() {
    let config = indoc! {r#"
        [breaker]
        min_requests = 2
        cooldown = "60s"
    "#};

    let mock = LlmMock::openai("flaky").with_failure(Failure::Status(500, "boom".into()));
    let recorded = mock.recorded();

    let mut builder = TestServer::builder();
    builder.spawn_llm(mock).await;

    let server = builder.build(config).await;

    for _ in 0..2 {
        let (status, body) = server.client.post_json("/v1/chat/completions", &chat("gpt-4o")).await;

        assert_eq!(status, 500);
        assert_eq!(body["error"]["type"], "api_error");
    }

    let (status, body) = server.client.post_json("/v1/chat/completions", &chat("gpt-4o")).await;
    assert_eq!(status, 503);
    assert_eq!(body["error"]["type"], "no_eligible_provider");

    assert_eq!(recorded.count(), 2);
    assert_eq!(server.gateway.breakers().status("flaky"), llm::BreakerStatus::Open);
}

#[tokio::test]
async fn healthy_provider_takes_over_from_an_open_breaker() {
    let config = indoc! {r#"
        [breaker]
        min_requests = 1
        failure_threshold = 0.5
    "#};

    let broken = LlmMock::openai("broken").with_failure(Failure::Status(503, "overloaded".into()));
    let broken_requests = broken.recorded();

    let healthy = LlmMock::openai("healthy");
    let healthy_requests = healthy.recorded();

    let mut builder = TestServer::builder();
    builder.spawn_llm(broken).await;
    builder.spawn_llm(healthy).await;

    let server = builder.build(config).await;

    // Until the broken provider is drawn once, requests may fail; afterwards they must not.
    for _ in 0..20 {
        if broken_requests.count() > 0 {
            break;
        }

        server.client.post_json("/v1/chat/completions", &chat("gpt-4o")).await;
    }

    assert_eq!(broken_requests.count(), 1);

    let served = healthy_requests.count();

    for _ in 0..5 {
        let (status, _) = server.client.post_json("/v1/chat/completions", &chat("gpt-4o")).await;
        assert_eq!(status, 200);
    }

    assert_eq!(broken_requests.count(), 1);
    assert_eq!(healthy_requests.count(), served + 5);
}
