//! Per-provider transform scripts.
//!
//! A script is a minijinja template that may define the macros `request_in`, `request_out`,
//! `response_in` and `response_out`. Each takes `(data, ctx)` and renders JSON. A macro that
//! is missing or renders only whitespace declines, and the built-in converter runs instead.
//!
//! ```jinja
//! {% set protocols = ["openai_chat"] %}
//! {% macro request_out(data, ctx) %}{{ data | tojson }}{% endmacro %}
//! ```

use std::{
    collections::BTreeSet,
    fmt,
    path::{Path, PathBuf},
};

use minijinja::{Environment, Value as JinjaValue, context};
use serde::Serialize;
use serde_json::Value;

use crate::{error::LlmError, protocol::WireFormat};

const TEMPLATE_NAME: &str = "transform";

/// Instruction budget for one script evaluation.
const FUEL: u64 = 500_000;

/// Errors from loading or running a transform script.
#[derive(Debug, thiserror::Error)]
pub enum ScriptError {
    #[error("Failed to read transform script {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Transform script error: {0}")]
    Template(#[from] minijinja::Error),

    #[error("Transform script lists unknown protocol '{0}'")]
    UnknownProtocol(String),

    #[error("Transform hook {hook} rendered invalid JSON: {message}")]
    InvalidOutput { hook: Hook, message: String },
}

impl From<ScriptError> for LlmError {
    fn from(error: ScriptError) -> Self {
        log::error!("Request failed in transform script: {error}");
        LlmError::Transform(error.to_string())
    }
}

/// The four pipeline hooks a script may override.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum Hook {
    /// Client payload to UIF request.
    RequestIn,
    /// UIF request to provider payload.
    RequestOut,
    /// Provider payload (or stream event) to UIF.
    ResponseIn,
    /// UIF to client payload (or stream event).
    ResponseOut,
}

impl Hook {
    pub const ALL: [Hook; 4] = [Hook::RequestIn, Hook::RequestOut, Hook::ResponseIn, Hook::ResponseOut];

    pub fn as_str(self) -> &'static str {
        match self {
            Hook::RequestIn => "request_in",
            Hook::RequestOut => "request_out",
            Hook::ResponseIn => "response_in",
            Hook::ResponseOut => "response_out",
        }
    }

    /// Whether the hook faces the client side of the pairing rather than the provider side.
    fn client_side(self) -> bool {
        matches!(self, Hook::RequestIn | Hook::ResponseOut)
    }
}

impl fmt::Display for Hook {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// What a hook sees besides its payload.
#[derive(Debug, Clone, Serialize)]
pub struct HookContext {
    pub client_protocol: WireFormat,
    pub provider_protocol: WireFormat,
    pub provider: String,
    pub model: String,
    pub stream: bool,
    /// SSE event name, for stream hooks.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub event: Option<String>,
}

impl HookContext {
    fn protocol_for(&self, hook: Hook) -> WireFormat {
        if hook.client_side() {
            self.client_protocol
        } else {
            self.provider_protocol
        }
    }
}

/// A compiled override of the pipeline hooks.
pub trait TransformScript: Send + Sync {
    /// Runs `hook`. `Ok(None)` means the script declined and the built-in converter applies.
    fn run(&self, hook: Hook, data: &Value, ctx: &HookContext) -> Result<Option<Value>, ScriptError>;
}

/// A transform script backed by a sandboxed minijinja environment: no loader, so templates
/// cannot include files, and a fuel limit per evaluation.
pub struct TemplateScript {
    env: Environment<'static>,
    hooks: BTreeSet<Hook>,
    protocols: Vec<WireFormat>,
}

impl fmt::Debug for TemplateScript {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TemplateScript")
            .field("hooks", &self.hooks)
            .field("protocols", &self.protocols)
            .finish_non_exhaustive()
    }
}

impl TemplateScript {
    /// Reads and compiles the script at `path`.
    pub fn load(path: &Path, default_protocol: WireFormat) -> Result<Self, ScriptError> {
        let source = std::fs::read_to_string(path).map_err(|source| ScriptError::Io {
            path: path.to_path_buf(),
            source,
        })?;

        Self::compile(source, default_protocol)
    }

    /// Compiles a script from source. `default_protocol` is the guard when the script sets no
    /// `protocols` list.
    pub fn compile(source: String, default_protocol: WireFormat) -> Result<Self, ScriptError> {
        let mut env = Environment::new();
        env.set_fuel(Some(FUEL));
        env.add_template_owned(TEMPLATE_NAME, source)?;

        let (hooks, protocols) = {
            let template = env.get_template(TEMPLATE_NAME)?;
            let state = template.eval_to_state(context! {})?;

            let hooks = Hook::ALL
                .into_iter()
                .filter(|hook| state.lookup(hook.as_str()).is_some_and(|value| !value.is_undefined()))
                .collect::<BTreeSet<_>>();

            let protocols = match state.lookup("protocols") {
                Some(list) if !list.is_undefined() && !list.is_none() => {
                    let mut protocols = Vec::new();

                    for name in list.try_iter()? {
                        let name = name.to_string();
                        let protocol = WireFormat::from_name(&name).ok_or(ScriptError::UnknownProtocol(name))?;
                        protocols.push(protocol);
                    }

                    protocols
                }
                _ => vec![default_protocol],
            };

            (hooks, protocols)
        };

        Ok(Self { env, hooks, protocols })
    }

    pub fn defines(&self, hook: Hook) -> bool {
        self.hooks.contains(&hook)
    }

    pub fn protocols(&self) -> &[WireFormat] {
        &self.protocols
    }
}

impl TransformScript for TemplateScript {
    fn run(&self, hook: Hook, data: &Value, ctx: &HookContext) -> Result<Option<Value>, ScriptError> {
        if !self.defines(hook) || !self.protocols.contains(&ctx.protocol_for(hook)) {
            return Ok(None);
        }

        let template = self.env.get_template(TEMPLATE_NAME)?;
        let state = template.eval_to_state(context! {})?;

        let Some(callable) = state.lookup(hook.as_str()) else {
            return Ok(None);
        };

        let rendered = callable.call(
            &state,
            &[JinjaValue::from_serialize(data), JinjaValue::from_serialize(ctx)],
        )?;

        let rendered = rendered.to_string();
        let rendered = rendered.trim();

        if rendered.is_empty() {
            return Ok(None);
        }

        let value = serde_json::from_str(rendered).map_err(|e| ScriptError::InvalidOutput {
            hook,
            message: e.to_string(),
        })?;

        Ok(Some(value))
    }
}
