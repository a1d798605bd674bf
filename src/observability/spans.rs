//! Structured spans for passes and units.

use std::time::Instant;

use tracing::{Level, Span, field, span};
use uuid::Uuid;

/// One scheduling pass. Unit spans opened while it is entered nest under it.
pub struct PassSpan {
    pass_id: Uuid,
    span: Span,
    start: Instant,
}

impl PassSpan {
    pub fn new(scope: &str) -> Self {
        let pass_id = Uuid::new_v4();
        let span = span!(
            Level::INFO,
            "reconcile.pass",
            pass_id = %pass_id,
            scope = scope,
            otel.name = "reconcile.pass",
            units = field::Empty,
            failed = field::Empty,
            duration_ms = field::Empty,
        );
        Self {
            pass_id,
            span,
            start: Instant::now(),
        }
    }

    pub fn pass_id(&self) -> Uuid {
        self.pass_id
    }

    pub fn span(&self) -> &Span {
        &self.span
    }

    pub fn finish(self, units: usize, failed: usize) {
        self.span.record("units", units as u64);
        self.span.record("failed", failed as u64);
        self.span
            .record("duration_ms", self.start.elapsed().as_millis() as u64);
    }
}

/// One (cluster, account) unit of work.
pub struct UnitSpan {
    span: Span,
    start: Instant,
}

impl UnitSpan {
    pub fn new(cluster: &str, account: &str) -> Self {
        let span = span!(
            Level::INFO,
            "reconcile.unit",
            cluster = cluster,
            account = account,
            otel.name = "reconcile.unit",
            outcome = field::Empty,
            duration_ms = field::Empty,
        );
        Self {
            span,
            start: Instant::now(),
        }
    }

    pub fn span(&self) -> &Span {
        &self.span
    }

    pub fn elapsed_ms(&self) -> f64 {
        self.start.elapsed().as_secs_f64() * 1000.0
    }

    pub fn finish(self, outcome: &str) -> f64 {
        let elapsed = self.elapsed_ms();
        self.span.record("outcome", outcome);
        self.span.record("duration_ms", elapsed as u64);
        elapsed
    }
}
