use std::fmt::Write;

use jiff::{Zoned, tz::TimeZone};
use log::Record;
use logforth::{
    append::Stdout,
    layout::{JsonLayout, Layout},
};

use crate::args::{Args, LogStyle};

/// Timestamp, level, target and message on one line.
#[derive(Debug, Clone, Default)]
struct TextLayout {
    no_color: bool,
}

impl TextLayout {
    fn no_color(mut self) -> Self {
        self.no_color = true;
        self
    }

    fn level(&self, level: log::Level) -> String {
        if self.no_color {
            return format!("{level:>5}");
        }

        let color = match level {
            log::Level::Error => 31,
            log::Level::Warn => 33,
            log::Level::Info => 32,
            log::Level::Debug => 34,
            log::Level::Trace => 35,
        };

        format!("\x1b[{color}m{level:>5}\x1b[0m")
    }
}

impl Layout for TextLayout {
    fn format(
        &self,
        record: &Record<'_>,
        _diagnostics: &[Box<dyn logforth::diagnostic::Diagnostic>],
    ) -> anyhow::Result<Vec<u8>> {
        let mut output = String::new();
        let now = Zoned::now().with_time_zone(TimeZone::UTC);

        write!(output, "{} ", now.strftime("%Y-%m-%dT%H:%M:%S%.6fZ"))?;
        write!(output, "{}  ", self.level(record.level()))?;
        write!(output, "{}: {}", record.target(), record.args())?;

        Ok(output.into_bytes())
    }
}

pub(super) fn init(args: &Args) -> anyhow::Result<()> {
    let filter = args.log_level.env_filter()?;

    logforth::builder()
        .dispatch(|d| {
            let d = d.filter(filter);

            match args.log_style {
                LogStyle::Color => d.append(Stdout::default().with_layout(TextLayout::default())),
                LogStyle::Text => d.append(Stdout::default().with_layout(TextLayout::default().no_color())),
                LogStyle::Json => d.append(Stdout::default().with_layout(JsonLayout::default())),
            }
        })
        .apply();

    Ok(())
}
