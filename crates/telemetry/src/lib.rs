//! Structured logging and metrics for the approval engine.

#![deny(unsafe_code)]

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use thiserror::Error;
use tracing_subscriber::{fmt, layer::SubscriberExt, EnvFilter, Registry};

#[derive(Debug, Error)]
pub enum TelemetryError {
    #[error("otel setup failed: {0}")]
    Otel(String),
}

/// Initialize structured logging (JSON) with env filter.
/// Set RUST_LOG, e.g., "info,telemetry=debug".
pub fn init_json_logging() {
    let fmt_layer = fmt::layer().json().with_current_span(true).with_span_list(true);
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let subscriber = Registry::default().with(filter).with(fmt_layer);
    tracing::subscriber::set_global_default(subscriber).ok();
}

/// Initialize OpenTelemetry tracer (optional; behind `otel` feature). No tracing subscriber hookup.
#[cfg(feature = "otel")]
pub fn init_otel(service_name: &str) -> Result<(), TelemetryError> {
    use opentelemetry::KeyValue;
    use opentelemetry_sdk::trace as sdktrace;
    use opentelemetry_sdk::{runtime, Resource};

    let resource = Resource::new(vec![KeyValue::new("service.name", service_name.to_owned())]);
    let _tracer_provider = opentelemetry_otlp::new_pipeline()
        .tracing()
        .with_exporter(opentelemetry_otlp::new_exporter().http())
        .with_trace_config(sdktrace::config().with_resource(resource))
        .install_batch(runtime::Tokio)
        .map_err(|e| TelemetryError::Otel(e.to_string()))?;
    Ok(())
}

#[cfg(feature = "otel")]
pub mod metrics {
    //! OTel metrics (OTLP) for gate verdicts.
    use super::TelemetryError;
    use once_cell::sync::OnceCell;
    use opentelemetry::global;
    use opentelemetry::metrics::{Counter, Meter, Unit};

    static METRICS_INIT: OnceCell<()> = OnceCell::new();

    fn detect_service_name() -> String {
        std::env::var("OTEL_SERVICE_NAME")
            .or_else(|_| std::env::var("APPROVAL_ENGINE_SERVICE_NAME"))
            .unwrap_or_else(|_| "approval-engine".to_string())
    }

    fn init_metrics_from_env() -> Result<(), TelemetryError> {
        // Configure OTLP metrics pipeline via env (OTEL_EXPORTER_*).
        let _svc = detect_service_name();
        let provider = opentelemetry_otlp::new_pipeline()
            .metrics(opentelemetry_sdk::runtime::Tokio)
            .with_exporter(opentelemetry_otlp::new_exporter().http())
            .build()
            .map_err(|e| TelemetryError::Otel(e.to_string()))?;
        global::set_meter_provider(provider);
        Ok(())
    }

    /// Initialize (idempotent) global metrics provider from env.
    fn ensure_metrics_provider() {
        let _ = METRICS_INIT.get_or_init(|| {
            let _ = init_metrics_from_env();
        });
    }

    #[derive(Clone)]
    pub struct GateInstruments {
        verdicts: Counter<u64>,
    }

    impl GateInstruments {
        pub fn record(&self, verdict: &str) {
            self.verdicts.add(1, &[opentelemetry::KeyValue::new("verdict", verdict.to_string())]);
        }
    }

    pub fn init_gate_instruments() -> GateInstruments {
        ensure_metrics_provider();
        let meter: Meter = global::meter("approval_engine.gate");
        let verdicts = meter
            .u64_counter("approval_engine.gate.verdicts")
            .with_description("Gate verdicts (admit/block/deny)")
            .with_unit(Unit::new("1"))
            .init();
        GateInstruments { verdicts }
    }
}

/// Returns whether telemetry is initialized (stubbed).
pub fn is_initialized() -> bool {
    true
}

/// In-process counters for gate verdicts and flow terminal outcomes,
/// always available even without the `otel` feature.
#[derive(Clone, Default)]
pub struct ApprovalMetrics {
    gate_admit: Arc<AtomicU64>,
    gate_block: Arc<AtomicU64>,
    gate_deny: Arc<AtomicU64>,
    flow_approved: Arc<AtomicU64>,
    flow_rejected: Arc<AtomicU64>,
    flow_cancelled: Arc<AtomicU64>,
}

impl ApprovalMetrics {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record_gate_admit(&self) {
        self.gate_admit.fetch_add(1, Ordering::Relaxed);
    }
    pub fn record_gate_block(&self) {
        self.gate_block.fetch_add(1, Ordering::Relaxed);
    }
    pub fn record_gate_deny(&self) {
        self.gate_deny.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_flow_approved(&self) {
        self.flow_approved.fetch_add(1, Ordering::Relaxed);
    }
    pub fn record_flow_rejected(&self) {
        self.flow_rejected.fetch_add(1, Ordering::Relaxed);
    }
    pub fn record_flow_cancelled(&self) {
        self.flow_cancelled.fetch_add(1, Ordering::Relaxed);
    }

    /// `(admit, block, deny, approved, rejected, cancelled)`.
    pub fn snapshot(&self) -> (u64, u64, u64, u64, u64, u64) {
        (
            self.gate_admit.load(Ordering::Relaxed),
            self.gate_block.load(Ordering::Relaxed),
            self.gate_deny.load(Ordering::Relaxed),
            self.flow_approved.load(Ordering::Relaxed),
            self.flow_rejected.load(Ordering::Relaxed),
            self.flow_cancelled.load(Ordering::Relaxed),
        )
    }
}
