//! Logging setup and helpers.
//!
//! Records go to stderr (or a log file) through `tracing-subscriber`; warnings
//! and errors are also forwarded to the event bus as [`LogMessage`]s so a UI
//! can render them as status lines.

use std::fmt;
use std::fs::OpenOptions;
use std::path::Path;
use std::sync::Mutex;

use anyhow::{Context as _, Result};
use chrono::{DateTime, Utc};
use tracing::field::{Field, Visit};
use tracing::{Event, Level, Subscriber};
use tracing_subscriber::layer::{Context, Layer, SubscriberExt};
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{EnvFilter, fmt as tracing_fmt};

use crate::config::ensure_parent_dir;
use crate::pubsub::{Broker, EventKind};

/// A log record as seen by bus subscribers.
#[derive(Debug, Clone, PartialEq)]
pub struct LogMessage {
    pub level: Level,
    pub message: String,
    pub time: DateTime<Utc>,
    /// Keep the status line visible until replaced.
    pub persist: bool,
}

/// `tracing` layer that republishes records on the event bus.
pub struct BusLayer {
    broker: Broker<LogMessage>,
    max_level: Level,
}

impl BusLayer {
    /// Forward records at `max_level` or more severe.
    #[must_use]
    pub fn new(broker: Broker<LogMessage>, max_level: Level) -> Self {
        Self { broker, max_level }
    }
}

impl<S: Subscriber> Layer<S> for BusLayer {
    fn on_event(&self, event: &Event<'_>, _ctx: Context<'_, S>) {
        let level = *event.metadata().level();
        if level > self.max_level {
            return;
        }
        let mut visitor = MessageVisitor::default();
        event.record(&mut visitor);
        let persist = visitor.persist;
        self.broker.publish(
            EventKind::Created,
            LogMessage {
                level,
                message: visitor.render(),
                time: Utc::now(),
                persist,
            },
        );
    }
}

#[derive(Default)]
struct MessageVisitor {
    message: String,
    fields: Vec<(String, String)>,
    persist: bool,
}

impl MessageVisitor {
    fn render(self) -> String {
        let mut out = self.message;
        for (name, value) in self.fields {
            if !out.is_empty() {
                out.push(' ');
            }
            out.push_str(&name);
            out.push('=');
            out.push_str(&value);
        }
        out
    }
}

impl Visit for MessageVisitor {
    fn record_str(&mut self, field: &Field, value: &str) {
        if field.name() == "message" {
            self.message = value.to_string();
        } else {
            self.fields
                .push((field.name().to_string(), value.to_string()));
        }
    }

    fn record_bool(&mut self, field: &Field, value: bool) {
        if field.name() == "persist" {
            self.persist = value;
        } else {
            self.fields
                .push((field.name().to_string(), value.to_string()));
        }
    }

    fn record_debug(&mut self, field: &Field, value: &dyn fmt::Debug) {
        if field.name() == "message" {
            self.message = format!("{value:?}");
        } else {
            self.fields
                .push((field.name().to_string(), format!("{value:?}")));
        }
    }
}

/// Install the global subscriber.
///
/// `RUST_LOG` wins over the `verbose` default. With a `log_file`, records are
/// appended there instead of stderr.
pub fn init(verbose: bool, log_file: Option<&Path>, bus: Option<Broker<LogMessage>>) -> Result<()> {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(if verbose { "debug" } else { "warn" }));

    let file_layer = match log_file {
        Some(path) => {
            ensure_parent_dir(path)?;
            let file = OpenOptions::new()
                .create(true)
                .append(true)
                .open(path)
                .with_context(|| format!("Failed to open log file: {}", path.display()))?;
            Some(
                tracing_fmt::layer()
                    .with_ansi(false)
                    .with_writer(Mutex::new(file)),
            )
        }
        None => None,
    };
    let stderr_layer = log_file
        .is_none()
        .then(|| tracing_fmt::layer().with_writer(std::io::stderr));
    let bus_layer = bus.map(|broker| BusLayer::new(broker, Level::WARN));

    tracing_subscriber::registry()
        .with(filter)
        .with(file_layer)
        .with(stderr_layer)
        .with(bus_layer)
        .try_init()
        .context("Failed to install tracing subscriber")
}

pub fn info(message: impl AsRef<str>) {
    tracing::info!("{}", message.as_ref());
}

pub fn warn(message: impl AsRef<str>) {
    tracing::warn!("{}", message.as_ref());
}

pub fn error(message: impl AsRef<str>) {
    tracing::error!("{}", message.as_ref());
}
