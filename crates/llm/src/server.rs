//! The request pipeline.

use std::sync::Arc;

use axum::{
    Json,
    response::{IntoResponse, Response},
};
use config::Config;
use opentelemetry::{KeyValue, metrics::Counter};
use rate_limit::RateLimiter;
use serde_json::{Value, json};
use telemetry::metrics::{CONDUIT_RATE_LIMITED, Recorder};
use tokio::time::timeout_at;

use crate::{
    breaker::{BreakerPermit, CircuitBreakers},
    error::{ErrorCategory, LlmError, TimeoutKind},
    metrics::{ActiveRequestGuard, PipelineMetrics, RequestLabels},
    protocol::WireFormat,
    request::RequestContext,
    selector::{self, Selection},
    snapshot::{ConfigSource, Snapshot, SnapshotError, SnapshotStore},
    sse,
    stream::{self, StreamSetup},
    token_counter,
    transform::Transformer,
    upstream,
};

/// Fixed creation timestamp reported in model listings.
const MODEL_CREATED: u64 = 1_719_475_200;

/// The gateway: configuration store plus the state that outlives snapshots.
///
/// Breakers and rate-limit buckets are keyed by provider and credential id and survive reloads.
/// Entries whose id disappears from the configuration are pruned on reload.
pub struct Gateway {
    store: SnapshotStore,
    breakers: Arc<CircuitBreakers>,
    limiter: RateLimiter,
    metrics: PipelineMetrics,
    rate_limited: Counter<u64>,
}

impl Gateway {
    pub fn new(config: &Config) -> Result<Self, SnapshotError> {
        let store = SnapshotStore::new(config)?;

        log::info!(
            "Gateway initialized with {} provider(s)",
            store.current().providers.len()
        );

        Ok(Self {
            store,
            breakers: Arc::new(CircuitBreakers::new()),
            limiter: RateLimiter::new(),
            metrics: PipelineMetrics::default(),
            rate_limited: telemetry::metrics::meter().u64_counter(CONDUIT_RATE_LIMITED).build(),
        })
    }

    pub fn snapshot(&self) -> Arc<Snapshot> {
        self.store.current()
    }

    pub fn version(&self) -> u64 {
        self.store.version()
    }

    /// Requests currently in flight, streams included.
    pub fn active_requests(&self) -> i64 {
        self.metrics.active_requests()
    }

    pub fn breakers(&self) -> &CircuitBreakers {
        &self.breakers
    }

    /// Swaps in a snapshot built from `config`. The old one stays active on error.
    pub fn reload(&self, config: &Config) -> Result<u64, SnapshotError> {
        let version = self.store.reload(config)?;
        self.prune();

        Ok(version)
    }

    /// Reloads from a backing source. The old snapshot stays active on error.
    pub fn reload_from(&self, source: &dyn ConfigSource) -> Result<u64, SnapshotError> {
        let version = self.store.reload_from(source)?;
        self.prune();

        Ok(version)
    }

    fn prune(&self) {
        let snapshot = self.store.current();

        self.breakers.retain(|id| snapshot.provider(id).is_some());
        self.limiter.retain(|id| snapshot.has_credential(id));
    }

    /// Authenticates a key against the current snapshot.
    pub fn authenticate(&self, key: Option<&str>) -> crate::Result<RequestContext> {
        let snapshot = self.store.current();

        match snapshot.authenticate(key) {
            Some(credential) => Ok(RequestContext::new(snapshot, credential)),
            None => {
                log::debug!("Rejected request with {} API key", if key.is_some() { "an unknown" } else { "no" });
                Err(LlmError::Unauthorized)
            }
        }
    }

    /// Takes one token from the credential's bucket.
    pub fn check_rate_limit(&self, context: &RequestContext) -> crate::Result<()> {
        let credential = &context.credential;

        self.limiter
            .try_acquire(&credential.id, credential.rate_limit.as_ref())
            .into_result(&credential.id)
            .map_err(|error| {
                log::debug!("{error}, retry after {:?}", error.retry_after());

                self.rate_limited
                    .add(1, &[KeyValue::new("client.id", credential.id.clone())]);

                LlmError::RateLimited {
                    retry_after: error.retry_after(),
                }
            })
    }

    /// Runs a generation request from a client speaking `client`.
    pub(crate) async fn handle(&self, context: RequestContext, client: WireFormat, body: Value) -> crate::Result<Response> {
        let RequestContext {
            snapshot,
            credential,
            started,
        } = context;

        let requested = body
            .get("model")
            .and_then(Value::as_str)
            .filter(|model| !model.is_empty())
            .ok_or_else(|| LlmError::InvalidRequest("missing required field 'model'".into()))?
            .to_string();

        let stream = body.get("stream").and_then(Value::as_bool).unwrap_or(false);

        let Selection {
            provider,
            model,
            permit,
        } = selector::select(&snapshot, &self.breakers, &requested, &credential)?;

        log::debug!(
            "Routing '{requested}' to provider '{}' as '{model}' (stream: {stream})",
            provider.id
        );

        let transformer = Transformer::new(
            client,
            provider.wire_format,
            provider.script.clone(),
            &provider.id,
            &model,
            stream,
        );

        let mut request = transformer.decode_request(body)?;
        request.model = model.clone();
        request.parameters.stream = stream;

        let payload = transformer.encode_request(&request)?;

        let labels = RequestLabels {
            operation: operation_name(client),
            provider: provider.id.clone(),
            model: requested.clone(),
            credential: credential.id.clone(),
        };

        let mut recorder = self.metrics.operation_recorder(&labels, std::time::Instant::now());
        let mut guard = ActiveRequestGuard::new(self.metrics.clone(), labels);

        let gateway = &snapshot.gateway;
        let request_deadline = started + gateway.request_timeout;

        if stream {
            // Headers must arrive within both deadlines, the first token is still to come.
            let (deadline, kind) = if gateway.ttft_timeout < gateway.request_timeout {
                (started + gateway.ttft_timeout, TimeoutKind::FirstToken)
            } else {
                (request_deadline, TimeoutKind::Overall)
            };

            let sent = upstream::send(&snapshot.http, provider, &model, true, payload);

            let response = match timeout_at(deadline, sent).await {
                Ok(Ok(response)) => response,
                Ok(Err(error)) => return Err(self.upstream_failed(error, permit, &guard, recorder)),
                Err(_) => return Err(self.upstream_failed(LlmError::Timeout(kind), permit, &guard, recorder)),
            };

            let events = stream::client_stream(StreamSetup {
                events: upstream::event_stream(&provider.id, response),
                transform: transformer.stream(),
                client_model: requested,
                started,
                request_timeout: gateway.request_timeout,
                ttft_timeout: gateway.ttft_timeout,
                permit,
                guard,
                recorder,
            });

            return Ok(sse::client_events_to_sse(events).into_response());
        }

        let exchange = async {
            let response = upstream::send(&snapshot.http, provider, &model, false, payload).await?;
            upstream::read_json(&provider.id, response).await
        };

        let body = match timeout_at(request_deadline, exchange).await {
            Ok(Ok(body)) => body,
            Ok(Err(error)) => return Err(self.upstream_failed(error, permit, &guard, recorder)),
            Err(_) => {
                let error = LlmError::Timeout(TimeoutKind::Overall);
                return Err(self.upstream_failed(error, permit, &guard, recorder));
            }
        };

        permit.success();

        let encoded = transformer.decode_response(body).and_then(|mut response| {
            response.model = requested;
            guard.complete(response.usage);

            Ok((transformer.encode_response(&response)?, response.stop_reason))
        });

        match encoded {
            Ok((body, stop_reason)) => {
                recorder.push_attribute("gen_ai.response.finish_reason", stop_reason.as_str());
                recorder.record();

                Ok(Json(body).into_response())
            }
            Err(error) => {
                recorder.push_attribute("error.type", ErrorCategory::InternalError.as_str());
                recorder.record();

                Err(error)
            }
        }
    }

    /// Records an upstream failure against the provider and passes the error on.
    fn upstream_failed(
        &self,
        error: LlmError,
        permit: BreakerPermit,
        guard: &ActiveRequestGuard,
        mut recorder: Recorder,
    ) -> LlmError {
        let category = error.category().unwrap_or(ErrorCategory::InternalError);
        let labels = guard.labels();

        match &error {
            LlmError::Transform(message) => log::error!("Request to '{}' failed in transform: {message}", labels.provider),
            _ => log::warn!("Request to provider '{}' failed ({category}): {error}", labels.provider),
        }

        if category != ErrorCategory::InternalError {
            self.metrics.record_upstream_error(labels, category);
        }

        permit.failure(category);

        recorder.push_attribute("error.type", category.as_str());
        recorder.record();

        error
    }

    /// Estimated input tokens of an Anthropic-shaped body.
    pub(crate) fn count_tokens(&self, mut body: Value) -> crate::Result<Value> {
        // Token counting bodies carry no max_tokens.
        if let Value::Object(map) = &mut body {
            map.entry("max_tokens").or_insert_with(|| Value::from(1));
        }

        let request = WireFormat::Anthropic.hooks().decode_request(body)?;
        let input_tokens = token_counter::count_request(&request);

        log::debug!("Estimated {input_tokens} input tokens for model '{}'", request.model);

        Ok(json!({ "input_tokens": input_tokens }))
    }

    /// The OpenAI model list for a credential.
    pub(crate) fn list_models(&self, context: &RequestContext) -> Value {
        let prefix = context.snapshot.gateway.model_prefix.as_deref().unwrap_or_default();

        let data: Vec<Value> = context
            .snapshot
            .models_for(&context.credential)
            .into_iter()
            .map(|model| {
                json!({
                    "id": format!("{prefix}{model}"),
                    "object": "model",
                    "created": MODEL_CREATED,
                    "owned_by": "conduit",
                })
            })
            .collect();

        log::debug!("Listing {} models for credential '{}'", data.len(), context.credential.id);

        json!({ "object": "list", "data": data })
    }
}

fn operation_name(client: WireFormat) -> &'static str {
    match client {
        WireFormat::OpenAiCompletions => "text_completion",
        WireFormat::OpenAiChat | WireFormat::Anthropic | WireFormat::Gemini | WireFormat::Responses => "chat",
    }
}

#[cfg(test)]
mod tests {
    use config::Config;
    use indoc::indoc;
    use insta::assert_json_snapshot;

    use super::*;

    fn gateway() -> Gateway {
        let config = Config::parse(indoc! {r#"
            [gateway]
            model_prefix = "conduit/"

            [providers.openai]
            type = "openai"
            api_key = "sk-openai"
            model_mapping = [
                { from = "gpt-4o", to = "gpt-4o-2024-08-06" },
                { from = "gpt-4o-mini", to = "gpt-4o-mini" },
            ]

            [providers.claude]
            type = "anthropic"
            api_key = "sk-ant"
            model_mapping = [{ from = "claude-sonnet", to = "claude-3-5-sonnet-20241022" }]

            [credentials.team]
            key_hash = "2bb80d537b1da3e38bd30361aa855686bde0eacd7162fef6a25fe97bf527a25b"
            allowed_models = ["gpt-4o-mini"]
            rate_limit = { requests_per_second = 1 }
        "#})
        .unwrap();

        Gateway::new(&config).unwrap()
    }

    #[test]
    fn authenticates_against_the_current_snapshot() {
        let gateway = gateway();

        let context = gateway.authenticate(Some("secret")).unwrap();
        assert_eq!(context.credential.id, "team");
        assert_eq!(context.snapshot.version, 1);

        assert!(matches!(gateway.authenticate(Some("wrong")), Err(LlmError::Unauthorized)));
        assert!(matches!(gateway.authenticate(None), Err(LlmError::Unauthorized)));
    }

    #[tokio::test(start_paused = true)]
    async fn rate_limits_per_credential() {
        let gateway = gateway();
        let context = gateway.authenticate(Some("secret")).unwrap();

        assert!(gateway.check_rate_limit(&context).is_ok());

        let Err(LlmError::RateLimited { retry_after }) = gateway.check_rate_limit(&context) else {
            unreachable!("second request within the second must be denied");
        };

        assert!(retry_after <= std::time::Duration::from_secs(1));

        tokio::time::advance(std::time::Duration::from_secs(1)).await;
        assert!(gateway.check_rate_limit(&context).is_ok());
    }

    #[test]
    fn restricted_credential_lists_its_models() {
        let gateway = gateway();
        let context = gateway.authenticate(Some("secret")).unwrap();

        assert_json_snapshot!(gateway.list_models(&context), @r#"
        {
          "data": [
            {
              "created": 1719475200,
              "id": "conduit/gpt-4o-mini",
              "object": "model",
              "owned_by": "conduit"
            }
          ],
          "object": "list"
        }
        "#);
    }

    #[test]
    fn unrestricted_credential_lists_every_mapped_model() {
        let gateway = gateway();
        let snapshot = gateway.snapshot();
        let context = RequestContext::new(snapshot, Arc::new(crate::snapshot::Credential::anonymous()));

        let listed = gateway.list_models(&context);
        let ids: Vec<_> = listed["data"]
            .as_array()
            .unwrap()
            .iter()
            .map(|model| model["id"].as_str().unwrap().to_string())
            .collect();

        assert_eq!(ids, ["conduit/claude-sonnet", "conduit/gpt-4o", "conduit/gpt-4o-mini"]);
    }

    #[test]
    fn counts_tokens_without_max_tokens() {
        let gateway = gateway();

        let counted = gateway
            .count_tokens(json!({
                "model": "claude-sonnet",
                "messages": [{"role": "user", "content": "Hello, world!"}]
            }))
            .unwrap();

        // 3 priming + (3 + 4) message
        assert_eq!(counted, json!({"input_tokens": 10}));
    }

    #[test]
    fn reload_prunes_removed_credentials() {
        let gateway = gateway();
        let context = gateway.authenticate(Some("secret")).unwrap();
        gateway.check_rate_limit(&context).unwrap();
        assert_eq!(gateway.limiter.len(), 1);

        let config = Config::parse(indoc! {r#"
            [providers.openai]
            type = "openai"
        "#})
        .unwrap();

        assert_eq!(gateway.reload(&config).unwrap(), 2);
        assert!(gateway.limiter.is_empty());

        // The old context still reads the snapshot it started with.
        assert_eq!(context.snapshot.version, 1);
        assert_eq!(gateway.version(), 2);
    }

    #[tokio::test]
    async fn missing_model_is_an_invalid_request() {
        let gateway = gateway();
        let context = gateway.authenticate(Some("secret")).unwrap();

        let Err(error) = gateway.handle(context, WireFormat::OpenAiChat, json!({"messages": []})).await else {
            unreachable!("a body without a model cannot be routed");
        };

        assert_eq!(error.status_code().as_u16(), 400);
    }
}
