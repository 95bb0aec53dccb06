//! Logging for the daemon.
//!
//! The binary calls [`init_journald_or_stdout`] once at startup. Everything
//! else imports `crate::tracing::prelude::*` for the `trace!()` through
//! `error!()` macros and logs with structured fields.

use std::env;
use std::fmt;

use time::OffsetDateTime;
use tracing::field::{Field, Visit};
use tracing::{Event, Level, Subscriber};
use tracing_subscriber::{
    filter::{EnvFilter, LevelFilter},
    fmt::{
        format::{DefaultFields, Writer},
        time::FormatTime,
        FmtContext, FormatEvent, FormatFields,
    },
    prelude::*,
    registry::LookupSpan,
};

pub mod prelude {
    #[allow(unused_imports)]
    pub use tracing::{debug, error, info, trace, warn};
}

use prelude::*;

/// Prefix stripped from our own targets.
const CRATE_PREFIX: &str = "poolmux::";

/// Width of the timestamp and level columns, for indenting field lines.
const FIELD_INDENT: usize = 15;

/// Initialize logging.
///
/// Under systemd (`JOURNAL_STREAM` set) events go to journald; otherwise to
/// stdout. `level` replaces the default INFO level, and `RUST_LOG`
/// directives refine it in both cases.
pub fn init_journald_or_stdout(level: Option<LevelFilter>) {
    let filter = || {
        EnvFilter::builder()
            .with_default_directive(level.unwrap_or(LevelFilter::INFO).into())
            .with_env_var("RUST_LOG")
            .from_env_lossy()
    };

    if env::var("JOURNAL_STREAM").is_ok() {
        match tracing_journald::layer() {
            Ok(layer) => {
                tracing_subscriber::registry()
                    .with(filter())
                    .with(layer)
                    .init();
                return;
            }
            Err(e) => {
                init_stdout(filter());
                error!(error = %e, "Failed to initialize journald logging, using stdout.");
                return;
            }
        }
    }
    init_stdout(filter());
}

fn init_stdout(filter: EnvFilter) {
    tracing_subscriber::registry()
        .with(filter)
        .with(
            tracing_subscriber::fmt::layer()
                .fmt_fields(DefaultFields::new())
                .event_format(LineFormat),
        )
        .init();
}

/// One line per event: local time, coloured level, short target and
/// message, with structured fields dimmed on a second line.
struct LineFormat;

impl<S, N> FormatEvent<S, N> for LineFormat
where
    S: Subscriber + for<'a> LookupSpan<'a>,
    N: for<'a> FormatFields<'a> + 'static,
{
    fn format_event(
        &self,
        _ctx: &FmtContext<'_, S, N>,
        mut writer: Writer<'_>,
        event: &Event<'_>,
    ) -> fmt::Result {
        let mut fields = Fields::default();
        event.record(&mut fields);

        LocalTimer.format_time(&mut writer)?;
        let (colour, label) = level_style(*event.metadata().level());
        write!(writer, " {}{}\x1b[0m ", colour, label)?;

        let target = short_target(event.metadata().target(), &fields.values);
        write!(writer, "{}: ", target)?;
        if let Some(message) = &fields.message {
            write!(writer, "{}", message)?;
        }

        // log.* fields are bookkeeping of the log compatibility layer
        let shown: Vec<&(String, String)> = fields
            .values
            .iter()
            .filter(|(name, _)| !name.starts_with("log."))
            .collect();
        if !shown.is_empty() {
            write!(writer, "\n\x1b[90m{:width$}", "", width = FIELD_INDENT)?;
            for (i, (name, value)) in shown.into_iter().enumerate() {
                let separator = if i == 0 { "" } else { ", " };
                write!(writer, "{}{}={}", separator, name, value)?;
            }
            write!(writer, "\x1b[0m")?;
        }

        writeln!(writer)
    }
}

fn level_style(level: Level) -> (&'static str, &'static str) {
    match level {
        Level::ERROR => ("\x1b[31m", "ERROR"),
        Level::WARN => ("\x1b[33m", "WARN "),
        Level::INFO => ("\x1b[32m", "INFO "),
        Level::DEBUG => ("\x1b[34m", "DEBUG"),
        Level::TRACE => ("\x1b[35m", "TRACE"),
    }
}

/// Our own module paths lose the crate prefix; events bridged from the
/// `log` crate show their original target; dependencies keep theirs.
fn short_target<'a>(target: &'a str, fields: &'a [(String, String)]) -> &'a str {
    if let Some(module) = target.strip_prefix(CRATE_PREFIX) {
        return module;
    }
    if target == "log" {
        if let Some((_, original)) = fields.iter().find(|(name, _)| name == "log.target") {
            return original;
        }
    }
    target
}

/// Event fields rendered for display, with quotes and `Some(..)` removed.
#[derive(Default)]
struct Fields {
    message: Option<String>,
    values: Vec<(String, String)>,
}

impl Visit for Fields {
    fn record_str(&mut self, field: &Field, value: &str) {
        self.record(field, value.to_string());
    }

    fn record_debug(&mut self, field: &Field, value: &dyn fmt::Debug) {
        let rendered = format!("{:?}", value);
        let rendered = match rendered.strip_prefix("Some(") {
            Some(inner) => inner.strip_suffix(')').unwrap_or(inner).to_string(),
            None => rendered,
        };
        self.record(field, rendered.trim_matches('"').to_string());
    }
}

impl Fields {
    fn record(&mut self, field: &Field, value: String) {
        if field.name() == "message" {
            self.message = Some(value);
        } else {
            self.values.push((field.name().to_string(), value));
        }
    }
}

/// Local wall-clock time to the second.
struct LocalTimer;

impl FormatTime for LocalTimer {
    fn format_time(&self, w: &mut Writer<'_>) -> fmt::Result {
        let now = OffsetDateTime::now_local().unwrap_or_else(|_| OffsetDateTime::now_utc());
        let formatted = now
            .format(time::macros::format_description!(
                "[hour]:[minute]:[second]"
            ))
            .map_err(|_| fmt::Error)?;
        write!(w, "{}", formatted)
    }
}
