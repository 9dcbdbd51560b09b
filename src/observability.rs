//! Logging setup for the hub binary and module processes.
//!
//! Besides local output, records at INFO and above can be queued by a
//! [`LogForwardLayer`] and broadcast as [`LogEvent`]s by
//! [`Module::forward_logs`](crate::Module::forward_logs).

use crate::events::LogEvent;
use chrono::Utc;
use std::fmt::{self, Write as _};
use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, OnceLock};
use tokio::sync::mpsc;
use tracing::field::{Field, Visit};
use tracing::{Level, Subscriber};
use tracing_subscriber::layer::Context;
use tracing_subscriber::{fmt as fmt_layer, prelude::*, EnvFilter, Layer};

static TRACING_INIT: OnceLock<()> = OnceLock::new();

/// Environment variable selecting the output format.
pub const LOG_FORMAT_ENV: &str = "OBSBUS_LOG_FORMAT";

/// Output format of the process-wide subscriber.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum LogFormat {
    #[default]
    Compact,
    Json,
}

impl LogFormat {
    /// `json` (any case) selects JSON; anything else is compact text.
    pub fn parse(value: &str) -> Self {
        if value.trim().eq_ignore_ascii_case("json") {
            LogFormat::Json
        } else {
            LogFormat::Compact
        }
    }

    pub fn from_env() -> Self {
        std::env::var(LOG_FORMAT_ENV)
            .map(|v| Self::parse(&v))
            .unwrap_or_default()
    }
}

/// Initialize tracing subscriber once for the process.
///
/// Filter defaults to `info` if `RUST_LOG` is unset; the format comes from
/// `OBSBUS_LOG_FORMAT`.
pub fn init_tracing() {
    init_tracing_with(LogFormat::from_env());
}

pub fn init_tracing_with(format: LogFormat) {
    install(format, None);
}

/// [`init_tracing_with`] plus a forwarding queue of `capacity` records.
///
/// Returns `None` when the process subscriber was already installed.
pub fn init_tracing_forwarded(format: LogFormat, capacity: usize) -> Option<LogRecords> {
    let (layer, records) = log_forwarding(capacity);
    install(format, Some(layer)).then_some(records)
}

fn install(format: LogFormat, forward: Option<LogForwardLayer>) -> bool {
    let mut installed = false;
    TRACING_INIT.get_or_init(|| {
        let env_filter =
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));

        let result = match format {
            LogFormat::Json => tracing_subscriber::registry()
                .with(env_filter)
                .with(forward)
                .with(fmt_layer::layer().json())
                .try_init(),
            LogFormat::Compact => tracing_subscriber::registry()
                .with(env_filter)
                .with(forward)
                .with(fmt_layer::layer().compact())
                .try_init(),
        };

        match result {
            Ok(()) => installed = true,
            Err(err) => eprintln!("tracing init skipped: {err}"),
        }
    });
    installed
}

// =============================================================================
// Log forwarding
// =============================================================================

tokio::task_local! {
    static FORWARDING: ();
}

/// Run `task` with log capture switched off, so that whatever it logs while
/// publishing records is not queued again.
pub fn without_capture<F: Future>(task: F) -> impl Future<Output = F::Output> {
    FORWARDING.scope((), task)
}

fn capture_suppressed() -> bool {
    FORWARDING.try_with(|_| ()).is_ok()
}

/// A forwarding layer and the queue it feeds.
pub fn log_forwarding(capacity: usize) -> (LogForwardLayer, LogRecords) {
    let (tx, rx) = mpsc::channel(capacity.max(1));
    let dropped = Arc::new(AtomicU64::new(0));
    (
        LogForwardLayer {
            tx,
            dropped: dropped.clone(),
        },
        LogRecords { rx, dropped },
    )
}

/// Queues INFO and above as [`LogEvent`]s. A full queue drops the record.
pub struct LogForwardLayer {
    tx: mpsc::Sender<LogEvent>,
    dropped: Arc<AtomicU64>,
}

impl fmt::Debug for LogForwardLayer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LogForwardLayer")
            .field("capacity", &self.tx.max_capacity())
            .field("dropped", &self.dropped.load(Ordering::Relaxed))
            .finish()
    }
}

impl<S: Subscriber> Layer<S> for LogForwardLayer {
    fn on_event(&self, event: &tracing::Event<'_>, _ctx: Context<'_, S>) {
        let meta = event.metadata();
        if *meta.level() > Level::INFO || capture_suppressed() {
            return;
        }

        let mut visitor = MessageVisitor::default();
        event.record(&mut visitor);
        let record = LogEvent {
            time: Some(Utc::now()),
            level: meta.level().to_string(),
            target: Some(meta.target().to_string()),
            filename: meta.file().map(str::to_string),
            line: meta.line(),
            message: visitor.finish(),
        };
        if self.tx.try_send(record).is_err() {
            self.dropped.fetch_add(1, Ordering::Relaxed);
        }
    }
}

/// Receiving end of a [`LogForwardLayer`].
pub struct LogRecords {
    rx: mpsc::Receiver<LogEvent>,
    dropped: Arc<AtomicU64>,
}

impl fmt::Debug for LogRecords {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LogRecords")
            .field("queued", &self.rx.len())
            .field("dropped", &self.dropped())
            .finish()
    }
}

impl LogRecords {
    pub async fn recv(&mut self) -> Option<LogEvent> {
        self.rx.recv().await
    }

    pub fn try_recv(&mut self) -> Option<LogEvent> {
        self.rx.try_recv().ok()
    }

    /// Records lost to a full queue so far.
    pub fn dropped(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }
}

/// Message text followed by the remaining fields as `name=value`.
#[derive(Default)]
struct MessageVisitor {
    message: String,
    fields: String,
}

impl MessageVisitor {
    fn finish(self) -> String {
        if self.fields.is_empty() {
            self.message
        } else if self.message.is_empty() {
            self.fields
        } else {
            format!("{} {}", self.message, self.fields)
        }
    }

    fn push_field(&mut self, name: &str, value: fmt::Arguments<'_>) {
        if !self.fields.is_empty() {
            self.fields.push(' ');
        }
        let _ = write!(self.fields, "{}={}", name, value);
    }
}

impl Visit for MessageVisitor {
    fn record_str(&mut self, field: &Field, value: &str) {
        if field.name() == "message" {
            self.message = value.to_string();
        } else {
            self.push_field(field.name(), format_args!("{}", value));
        }
    }

    fn record_debug(&mut self, field: &Field, value: &dyn fmt::Debug) {
        if field.name() == "message" {
            self.message = format!("{:?}", value);
        } else {
            self.push_field(field.name(), format_args!("{:?}", value));
        }
    }
}
