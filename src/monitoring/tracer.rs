/*!
 * Tracing
 * Subscriber setup and timed spans for report generation
 */

use std::time::Instant;
use tracing::{debug, info, span, warn, Level};
use tracing_subscriber::{fmt::format::FmtSpan, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

/// Initialize structured tracing
///
/// Environment variables:
/// - RUST_LOG: Set log level (default: info)
/// - MEMPOOL_TRACE_JSON: Enable JSON output (default: false)
///
/// `log` records from the config loader are bridged into the subscriber.
pub fn init_tracing() {
    let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));

    let use_json = std::env::var("MEMPOOL_TRACE_JSON")
        .map(|v| v == "1" || v == "true")
        .unwrap_or(false);

    let registry = tracing_subscriber::registry().with(env_filter);

    if use_json {
        registry
            .with(
                tracing_subscriber::fmt::layer()
                    .json()
                    .with_target(true)
                    .with_line_number(true)
                    .with_file(true)
                    .with_current_span(true)
                    .with_span_list(true)
                    .with_span_events(FmtSpan::CLOSE),
            )
            .init();
        info!("Structured tracing initialized with JSON output");
    } else {
        registry
            .with(
                tracing_subscriber::fmt::layer()
                    .with_target(true)
                    .with_line_number(true)
                    .with_span_events(FmtSpan::CLOSE)
                    .compact(),
            )
            .init();
        info!("Structured tracing initialized");
    }
}

/// Timed span around one report
pub struct ReportSpan {
    span: tracing::Span,
    start: Instant,
}

impl ReportSpan {
    pub fn new(report: &str) -> Self {
        let span = span!(
            Level::DEBUG,
            "report",
            report = report,
            duration_us = tracing::field::Empty,
            rows = tracing::field::Empty,
        );
        Self {
            span,
            start: Instant::now(),
        }
    }

    pub fn record_rows(&self, rows: usize) {
        self.span.record("rows", rows);
    }

    pub fn enter(&self) -> tracing::span::Entered<'_> {
        self.span.enter()
    }
}

impl Drop for ReportSpan {
    fn drop(&mut self) {
        let duration = self.start.elapsed();
        let _entered = self.span.enter();
        self.span.record("duration_us", duration.as_micros() as u64);

        if duration.as_millis() > 100 {
            warn!(duration_ms = duration.as_millis() as u64, slow = true, "slow report");
        } else {
            debug!(duration_us = duration.as_micros() as u64, "report completed");
        }
    }
}

#[inline]
pub fn span_report(report: &str) -> ReportSpan {
    ReportSpan::new(report)
}
