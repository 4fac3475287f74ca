use std::{fmt, path::Path, str::FromStr};

use ansi_term::{Colour, Style};
use snafu::{ResultExt, Snafu};
use tracing_core::{event::Event, Metadata};
use tracing_log::{LogTracer, NormalizeEvent};
use tracing_subscriber::{
    fmt::{
        format::{self, FmtSpan, FormatEvent, FormatFields},
        FmtContext,
        FormattedFields,
    },
    registry::LookupSpan,
    EnvFilter,
};

#[derive(Debug, Snafu)]
#[snafu(visibility(pub(crate)), context(suffix(false)))]
pub enum LoggerError {
    #[snafu(display("Failed to initialise the log bridge: {}", source))]
    Bridge {
        source: tracing_log::log::SetLoggerError,
    },
    #[snafu(display("Failed to set the default subscriber: {}", source))]
    Subscriber {
        source: tracing::subscriber::SetGlobalDefaultError,
    },
}

/// How log lines are written.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub enum LogFormat {
    /// Human readable lines, coloured on a terminal.
    #[default]
    Default,
    /// One json object per line.
    Json,
}

impl FromStr for LogFormat {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "default" => Ok(Self::Default),
            "json" => Ok(Self::Json),
            _ => Err(format!("Invalid log format: {}", s)),
        }
    }
}

impl fmt::Display for LogFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Default => f.write_str("default"),
            Self::Json => f.write_str("json"),
        }
    }
}

// Custom struct used to format the log/trace LEVEL
struct FormatLevel<'a> {
    level: &'a tracing::Level,
    ansi: bool,
}

impl<'a> FormatLevel<'a> {
    fn new(level: &'a tracing::Level, ansi: bool) -> Self {
        Self {
            level,
            ansi,
        }
    }
}

// Display trace LEVEL.
impl fmt::Display for FormatLevel<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        const TRACE: &str = "TRACE";
        const DEBUG: &str = "DEBUG";
        const INFO: &str = " INFO";
        const WARN: &str = " WARN";
        const ERROR: &str = "ERROR";

        let (name, colour) = match *self.level {
            tracing::Level::TRACE => (TRACE, Colour::Purple),
            tracing::Level::DEBUG => (DEBUG, Colour::Blue),
            tracing::Level::INFO => (INFO, Colour::Green),
            tracing::Level::WARN => (WARN, Colour::Yellow),
            tracing::Level::ERROR => (ERROR, Colour::Red),
        };
        if self.ansi {
            write!(f, "{}", colour.paint(name))
        } else {
            f.pad(name)
        }
    }
}

// Custom struct used to format trace context (span) information
struct CustomContext<'a, S, N>
where
    S: tracing_core::subscriber::Subscriber + for<'s> LookupSpan<'s>,
    N: for<'w> FormatFields<'w> + 'static,
{
    context: &'a FmtContext<'a, S, N>,
    span: Option<&'a tracing_core::span::Id>,
    ansi: bool,
}

impl<'a, S, N> CustomContext<'a, S, N>
where
    S: tracing_core::subscriber::Subscriber + for<'s> LookupSpan<'s>,
    N: for<'w> FormatFields<'w> + 'static,
{
    fn new(
        context: &'a FmtContext<'a, S, N>,
        span: Option<&'a tracing_core::span::Id>,
        ansi: bool,
    ) -> Self {
        Self {
            context,
            span,
            ansi,
        }
    }
}

// Display trace context (span) information
impl<'a, S, N> fmt::Display for CustomContext<'a, S, N>
where
    S: tracing_core::subscriber::Subscriber + for<'s> LookupSpan<'s>,
    N: for<'w> FormatFields<'w> + 'static,
{
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let bold = if self.ansi {
            Style::new().bold()
        } else {
            Style::new()
        };
        let scope = self
            .span
            .and_then(|id| self.context.span(id))
            .or_else(|| self.context.lookup_current())
            .into_iter()
            .flat_map(|span| span.scope().from_root());

        for span in scope {
            write!(f, ":{}", bold.paint(span.metadata().name()))?;

            let extensions = span.extensions();
            if let Some(fields) = extensions.get::<FormattedFields<N>>() {
                if !fields.is_empty() {
                    write!(
                        f,
                        "{}{}{}",
                        bold.paint("{"),
                        fields,
                        bold.paint("}")
                    )?;
                }
            }
        }

        Ok(())
    }
}

fn basename(path: &str) -> &str {
    Path::new(path)
        .file_name()
        .and_then(|name| name.to_str())
        .unwrap_or(path)
}

// Custom struct used to format a callsite location (filename and line number)
struct Location<'a> {
    meta: &'a Metadata<'a>,
}

impl<'a> Location<'a> {
    fn new(meta: &'a Metadata<'a>) -> Self {
        Self {
            meta,
        }
    }
}

// Display callsite location (filename and line number) from metadata
impl fmt::Display for Location<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if let (Some(file), Some(line)) = (self.meta.file(), self.meta.line()) {
            write!(f, ":{}:{}", basename(file), line)?;
        }
        Ok(())
    }
}

// Custom struct used to format trace events.
struct CustomFormat {
    ansi: bool,
}

// Format a trace event.
impl<S, N> FormatEvent<S, N> for CustomFormat
where
    S: tracing_core::subscriber::Subscriber + for<'s> LookupSpan<'s>,
    N: for<'w> FormatFields<'w> + 'static,
{
    fn format_event(
        &self,
        context: &FmtContext<'_, S, N>,
        mut writer: format::Writer<'_>,
        event: &Event<'_>,
    ) -> fmt::Result {
        let normalized = event.normalized_metadata();
        let meta = normalized.as_ref().unwrap_or_else(|| event.metadata());

        write!(
            writer,
            "[{} {} {}{}{}] ",
            chrono::Local::now().format("%FT%T%.9f%Z"),
            FormatLevel::new(meta.level(), self.ansi),
            meta.target(),
            CustomContext::new(context, event.parent(), self.ansi),
            Location::new(meta)
        )?;

        context.format_fields(writer.by_ref(), event)?;

        writeln!(writer)
    }
}

/// Configure the logging format. The log level is taken from `RUST_LOG` when
/// set, i.e. `RUST_LOG=sma=trace` prints all trace!() and higher messages,
/// and from `level` otherwise.
pub fn init(level: &str, format: LogFormat) -> Result<(), LoggerError> {
    // Translate "log" records of third party crates into trace events.
    LogTracer::init().context(Bridge {})?;

    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(level));

    match format {
        LogFormat::Default => {
            let subscriber = tracing_subscriber::fmt::Subscriber::builder()
                .with_span_events(FmtSpan::CLOSE)
                .event_format(CustomFormat {
                    ansi: atty::is(atty::Stream::Stdout),
                })
                .with_env_filter(filter)
                .finish();
            tracing::subscriber::set_global_default(subscriber)
                .context(Subscriber {})
        }
        LogFormat::Json => {
            let subscriber = tracing_subscriber::fmt::Subscriber::builder()
                .json()
                .with_current_span(true)
                .with_env_filter(filter)
                .finish();
            tracing::subscriber::set_global_default(subscriber)
                .context(Subscriber {})
        }
    }
}
