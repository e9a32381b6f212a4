use std::time::Duration;

use anyhow::{Result, anyhow};
use tracing_subscriber::{EnvFilter, fmt};

use crate::cli::LogFormat;

const DEFAULT_FILTER: &str = "info";

/// Installs the global subscriber. `RUST_LOG` overrides the default
/// `info` filter.
pub fn init_logger(format: LogFormat) -> Result<()> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(DEFAULT_FILTER));
    let builder = fmt::fmt().with_env_filter(filter);
    let installed = match format {
        LogFormat::Json => builder
            .json()
            .flatten_event(true)
            .with_current_span(false)
            .with_span_list(false)
            .try_init(),
        LogFormat::Text => builder.compact().try_init(),
    };
    installed.map_err(|err| anyhow!("failed to install logger: {err}"))
}

/// One line per media fetch, emitted under the `fetch_log` target.
#[derive(Debug, Clone)]
pub struct FetchLogEvent {
    pub url: String,
    pub key: Option<String>,
    pub owner: Option<String>,
    pub media_type: Option<String>,
    pub outcome: &'static str,
    pub bytes: Option<u64>,
    pub elapsed_ms: u128,
    pub error_kind: Option<&'static str>,
    pub error_detail: Option<String>,
}

#[derive(Debug)]
pub struct FetchLogBuilder {
    event: FetchLogEvent,
}

impl FetchLogBuilder {
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            event: FetchLogEvent {
                url: url.into(),
                key: None,
                owner: None,
                media_type: None,
                outcome: "unknown",
                bytes: None,
                elapsed_ms: 0,
                error_kind: None,
                error_detail: None,
            },
        }
    }

    pub fn key(mut self, key: impl Into<String>) -> Self {
        self.event.key = Some(key.into());
        self
    }

    pub fn owner(mut self, owner: impl Into<String>) -> Self {
        self.event.owner = Some(owner.into());
        self
    }

    pub fn media_type(mut self, media_type: impl Into<String>) -> Self {
        self.event.media_type = Some(media_type.into());
        self
    }

    pub fn outcome(mut self, outcome: &'static str) -> Self {
        self.event.outcome = outcome;
        self
    }

    pub fn bytes(mut self, bytes: u64) -> Self {
        self.event.bytes = Some(bytes);
        self
    }

    pub fn elapsed(mut self, elapsed: Duration) -> Self {
        self.event.elapsed_ms = elapsed.as_millis();
        self
    }

    pub fn error(mut self, kind: &'static str, detail: impl Into<String>) -> Self {
        self.event.error_kind = Some(kind);
        self.event.error_detail = Some(detail.into());
        self
    }

    pub fn build(self) -> FetchLogEvent {
        self.event
    }

    pub fn log(self) {
        log_fetch(self.build());
    }
}

pub fn log_fetch(event: FetchLogEvent) {
    let FetchLogEvent {
        url,
        key,
        owner,
        media_type,
        outcome,
        bytes,
        elapsed_ms,
        error_kind,
        error_detail,
    } = event;

    if error_kind.is_some() {
        tracing::warn!(
            target: "fetch_log",
            url,
            key = key.as_deref(),
            owner = owner.as_deref(),
            media_type = media_type.as_deref(),
            outcome,
            elapsed_ms,
            error_kind,
            error_detail = error_detail.as_deref()
        );
    } else {
        tracing::info!(
            target: "fetch_log",
            url,
            key = key.as_deref(),
            owner = owner.as_deref(),
            media_type = media_type.as_deref(),
            outcome,
            bytes,
            elapsed_ms
        );
    }
}
