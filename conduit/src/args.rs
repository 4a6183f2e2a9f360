use std::{fmt, io::IsTerminal, net::SocketAddr, path::PathBuf, str::FromStr};

use anyhow::Context;
use clap::{Parser, ValueEnum};
use config::Config;
use logforth::filter::EnvFilter;

/// Crates whose logs follow `--log`. Everything else stays at `warn`.
const WORKSPACE_TARGETS: [&str; 6] = ["conduit", "server", "llm", "config", "rate_limit", "telemetry"];

#[derive(Debug, Parser)]
#[command(name = "Conduit", version, long_about = concat!("Conduit LLM gateway v", env!("CARGO_PKG_VERSION")))]
pub struct Args {
    /// Address to listen on, overriding `server.listen_address`.
    /// Default: 127.0.0.1:8000
    #[arg(short, long, env = "CONDUIT_LISTEN_ADDRESS")]
    pub listen_address: Option<SocketAddr>,
    /// Path to the TOML configuration file. Re-read on SIGHUP.
    #[arg(long, short, env = "CONDUIT_CONFIG_PATH", default_value = "./conduit.toml")]
    pub config: PathBuf,
    /// Log level for the gateway's own crates.
    #[arg(long = "log", env = "CONDUIT_LOG", default_value_t = LogLevel::default())]
    pub log_level: LogLevel,
    /// Log output format.
    #[arg(long, env = "CONDUIT_LOG_STYLE", default_value_t = LogStyle::default())]
    pub log_style: LogStyle,
}

impl Args {
    pub fn config(&self) -> anyhow::Result<Config> {
        Config::load(&self.config).with_context(|| format!("failed to load {}", self.config.display()))
    }
}

#[derive(Debug, Copy, Clone, PartialEq, Eq, ValueEnum)]
pub(crate) enum LogStyle {
    /// Colorized text, the default on a terminal
    Color,
    /// Plain text, the default otherwise
    Text,
    /// One JSON object per line
    Json,
}

impl Default for LogStyle {
    fn default() -> Self {
        if std::io::stdout().is_terminal() {
            LogStyle::Color
        } else {
            LogStyle::Text
        }
    }
}

impl fmt::Display for LogStyle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            LogStyle::Color => "color",
            LogStyle::Text => "text",
            LogStyle::Json => "json",
        })
    }
}

#[derive(Default, Debug, Copy, Clone, PartialEq, Eq, ValueEnum)]
pub(crate) enum LogLevel {
    Off,
    Error,
    Warn,
    #[default]
    Info,
    Debug,
    Trace,
}

impl LogLevel {
    fn directives(self) -> String {
        if self == LogLevel::Off {
            return "off".to_string();
        }

        std::iter::once("warn".to_string())
            .chain(WORKSPACE_TARGETS.iter().map(|target| format!("{target}={self}")))
            .collect::<Vec<_>>()
            .join(",")
    }

    pub fn env_filter(self) -> anyhow::Result<EnvFilter> {
        let directives = self.directives();

        EnvFilter::from_str(&directives).map_err(|e| anyhow::anyhow!("invalid log filter '{directives}': {e}"))
    }
}

impl fmt::Display for LogLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            LogLevel::Off => "off",
            LogLevel::Error => "error",
            LogLevel::Warn => "warn",
            LogLevel::Info => "info",
            LogLevel::Debug => "debug",
            LogLevel::Trace => "trace",
        })
    }
}
