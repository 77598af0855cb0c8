//! Prometheus export of per-step scheduler counters.
//!
//! ## Metrics
//! - `plume_step_tasks_submitted{step}` - Gauge
//! - `plume_step_tasks_running{step}` - Gauge
//! - `plume_step_tasks_done{step}` - Gauge
//! - `plume_step_tasks_failed{step}` - Gauge
//!
//! Gauges are refreshed from a scheduler snapshot by [`SchedulerMetrics::observe`]; the crate
//! does not serve `/metrics` itself.
//!
//! ```rust,ignore
//! let metrics = SchedulerMetrics::new()?;
//! metrics.observe(&dispatcher, &[step.id.clone()]);
//! let body = metrics.encode_text()?;
//! ```

use plume_core::Scheduler;
use plume_model::{StepId, StepStatus};
use prometheus::{IntGaugeVec, Opts, Registry};
use thiserror::Error;

pub use prometheus::{Encoder, TextEncoder, proto::MetricFamily};

#[derive(Debug, Error)]
pub enum MetricsError {
    #[error("prometheus: {0}")]
    Prometheus(#[from] prometheus::Error),
    #[error("metrics text is not utf-8: {0}")]
    Encoding(#[from] std::string::FromUtf8Error),
}

/// Per-step task gauges on their own registry.
#[derive(Clone)]
pub struct SchedulerMetrics {
    registry: Registry,
    submitted: IntGaugeVec,
    running: IntGaugeVec,
    done: IntGaugeVec,
    failed: IntGaugeVec,
}

fn step_gauge(registry: &Registry, name: &str, help: &str) -> Result<IntGaugeVec, MetricsError> {
    let gauge = IntGaugeVec::new(Opts::new(name, help), &["step"])?;
    registry.register(Box::new(gauge.clone()))?;
    Ok(gauge)
}

impl SchedulerMetrics {
    pub fn new() -> Result<Self, MetricsError> {
        Self::with_registry(Registry::new())
    }

    /// Register the gauges on an existing registry.
    pub fn with_registry(registry: Registry) -> Result<Self, MetricsError> {
        Ok(Self {
            submitted: step_gauge(&registry, "plume_step_tasks_submitted", "Tasks submitted for a step")?,
            running: step_gauge(&registry, "plume_step_tasks_running", "Tasks of a step that started running")?,
            done: step_gauge(&registry, "plume_step_tasks_done", "Tasks of a step that finished")?,
            failed: step_gauge(&registry, "plume_step_tasks_failed", "Tasks of a step that failed")?,
            registry,
        })
    }

    pub fn registry(&self) -> &Registry {
        &self.registry
    }

    pub fn record(&self, status: &StepStatus) {
        let step = status.step_id.as_str();
        self.submitted.with_label_values(&[step]).set(status.submitted as i64);
        self.running.with_label_values(&[step]).set(status.running as i64);
        self.done.with_label_values(&[step]).set(status.done as i64);
        self.failed.with_label_values(&[step]).set(status.failed as i64);
    }

    /// Refresh the gauges of `steps` from `scheduler`.
    pub fn observe(&self, scheduler: &dyn Scheduler, steps: &[StepId]) {
        for step in steps {
            self.record(&scheduler.status(step));
        }
    }

    /// Drop the series of a step that is no longer tracked.
    pub fn forget(&self, step: &StepId) {
        for gauge in [&self.submitted, &self.running, &self.done, &self.failed] {
            let _ = gauge.remove_label_values(&[step.as_str()]);
        }
    }

    pub fn gather(&self) -> Vec<MetricFamily> {
        self.registry.gather()
    }

    /// Text exposition format, ready to serve on `/metrics`.
    pub fn encode_text(&self) -> Result<String, MetricsError> {
        let mut buf = Vec::new();
        TextEncoder::new().encode(&self.gather(), &mut buf)?;
        Ok(String::from_utf8(buf)?)
    }
}
