//! Metric names, following the OpenTelemetry GenAI semantic conventions where one exists.

/// Duration of a whole gateway operation, in milliseconds.
pub const GEN_AI_CLIENT_OPERATION_DURATION: &str = "gen_ai.client.operation.duration";
/// Time from request start to the first streamed content delta, in milliseconds.
pub const GEN_AI_SERVER_TIME_TO_FIRST_TOKEN: &str = "gen_ai.server.time_to_first_token";
/// Input and output token counts, split by `gen_ai.token.type`.
pub const GEN_AI_CLIENT_TOKEN_USAGE: &str = "gen_ai.client.token.usage";
/// Output tokens per second measured from the first token.
pub const CONDUIT_TOKENS_PER_SECOND: &str = "conduit.gateway.tokens_per_second";
/// Requests currently being served.
pub const CONDUIT_ACTIVE_REQUESTS: &str = "conduit.gateway.active_requests";
/// Upstream failures by category.
pub const CONDUIT_UPSTREAM_ERRORS: &str = "conduit.gateway.upstream.errors";
/// Requests rejected by the rate limiter.
pub const CONDUIT_RATE_LIMITED: &str = "conduit.gateway.rate_limited";
/// Circuit breaker state transitions.
pub const CONDUIT_BREAKER_TRANSITIONS: &str = "conduit.gateway.breaker.transitions";
