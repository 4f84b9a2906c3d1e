//! Logging setup for the miner.
//!
//! Call [`init_journald_or_stdout`] once at startup. Everything else pulls
//! the level macros in through `use crate::tracing::prelude::*`.
//!
//! Events carrying a `device` field, or emitted inside a span named
//! `device`, get the device name hoisted into the line prefix so output
//! from several boards stays readable when interleaved.

use std::env;
use std::fmt::Write as _;

use time::OffsetDateTime;
use tracing_subscriber::{
    filter::{EnvFilter, LevelFilter},
    fmt::{
        format::Writer, time::FormatTime, FmtContext, FormatEvent, FormatFields, FormattedFields,
    },
    prelude::*,
    registry::LookupSpan,
};

pub mod prelude {
    #[allow(unused_imports)]
    pub use tracing::{debug, error, info, trace, warn};
}

use prelude::*;

/// Install a subscriber: journald under systemd, stdout otherwise.
pub fn init_journald_or_stdout() {
    if env::var("JOURNAL_STREAM").is_ok() {
        match tracing_journald::layer() {
            Ok(layer) => tracing_subscriber::registry()
                .with(filter())
                .with(layer)
                .init(),
            Err(e) => {
                use_stdout();
                error!(error = %e, "journald unavailable, logging to stdout");
            }
        }
    } else {
        use_stdout();
    }
}

// RUST_LOG wins; otherwise INFO.
fn filter() -> EnvFilter {
    EnvFilter::builder()
        .with_default_directive(LevelFilter::INFO.into())
        .with_env_var("RUST_LOG")
        .from_env_lossy()
}

fn use_stdout() {
    tracing_subscriber::registry()
        .with(filter())
        .with(tracing_subscriber::fmt::layer().event_format(DeviceFormatter))
        .init();
}

/// One line per event: `hh:mm:ss LEVEL [device] target: message key=value...`
struct DeviceFormatter;

#[derive(Default)]
struct Fields {
    message: String,
    device: Option<String>,
    rest: String,
}

impl tracing::field::Visit for Fields {
    fn record_str(&mut self, field: &tracing::field::Field, value: &str) {
        match field.name() {
            "message" => self.message.push_str(value),
            "device" => self.device = Some(value.to_string()),
            name => {
                let _ = write!(self.rest, " {}={}", name, value);
            }
        }
    }

    fn record_debug(&mut self, field: &tracing::field::Field, value: &dyn std::fmt::Debug) {
        match field.name() {
            "message" => {
                let _ = write!(self.message, "{:?}", value);
            }
            "device" => self.device = Some(format!("{:?}", value).trim_matches('"').to_string()),
            name if name.starts_with("log.") => {}
            name => {
                let _ = write!(self.rest, " {}={:?}", name, value);
            }
        }
    }
}

impl<S, N> FormatEvent<S, N> for DeviceFormatter
where
    S: tracing::Subscriber + for<'a> LookupSpan<'a>,
    N: for<'a> FormatFields<'a> + 'static,
{
    fn format_event(
        &self,
        ctx: &FmtContext<'_, S, N>,
        mut writer: Writer<'_>,
        event: &tracing::Event<'_>,
    ) -> std::fmt::Result {
        let mut fields = Fields::default();
        event.record(&mut fields);

        LocalTimer.format_time(&mut writer)?;

        let level = *event.metadata().level();
        let color = match level {
            tracing::Level::ERROR => "\x1b[31m",
            tracing::Level::WARN => "\x1b[33m",
            tracing::Level::INFO => "\x1b[32m",
            tracing::Level::DEBUG => "\x1b[34m",
            tracing::Level::TRACE => "\x1b[35m",
        };
        write!(writer, " {}{:<5}\x1b[0m ", color, level)?;

        let device = fields.device.take().or_else(|| span_device::<S, N>(ctx));
        if let Some(device) = &device {
            write!(writer, "\x1b[36m[{}]\x1b[0m ", device)?;
        }

        let target = event.metadata().target();
        let target = target.strip_prefix("hbm_miner::").unwrap_or(target);
        write!(writer, "{}: {}", target, fields.message)?;

        if !fields.rest.is_empty() {
            write!(writer, "\x1b[90m{}\x1b[0m", fields.rest)?;
        }
        writeln!(writer)
    }
}

// Device name recorded on the nearest enclosing `device` span.
fn span_device<S, N>(ctx: &FmtContext<'_, S, N>) -> Option<String>
where
    S: tracing::Subscriber + for<'a> LookupSpan<'a>,
    N: for<'a> FormatFields<'a> + 'static,
{
    let span = ctx
        .event_scope()?
        .find(|span| span.name() == "device")?;
    let ext = span.extensions();
    let recorded = ext.get::<FormattedFields<N>>()?;
    let value = recorded.fields.as_str();
    Some(value.strip_prefix("device=").unwrap_or(value).to_string())
}

// Local wall-clock time to the second.
struct LocalTimer;

impl FormatTime for LocalTimer {
    fn format_time(&self, w: &mut Writer<'_>) -> std::fmt::Result {
        let now = OffsetDateTime::now_local().unwrap_or_else(|_| OffsetDateTime::now_utc());
        let formatted = now
            .format(time::macros::format_description!(
                "[hour]:[minute]:[second]"
            ))
            .map_err(|_| std::fmt::Error)?;
        write!(w, "{}", formatted)
    }
}
