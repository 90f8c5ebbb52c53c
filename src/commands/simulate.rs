/*!
 * Simulate Command - drive the publish pipeline against the in-memory broker
 *
 * Useful for checking how a configuration behaves during an outage: take
 * the primary and/or secondary namespace down and watch where messages go.
 */

use crate::broker::memory::MemoryBroker;
use crate::broker::Message;
use crate::config::BusguardConfig;
use crate::error::{PublishError, EXIT_PARTIAL, EXIT_SUCCESS};
use crate::failure_log::{FailureLogStats, InMemoryFailureLog};
use crate::pipeline::{PipelineStats, PublishPipeline, PublishStatus};
use anyhow::Result;
use busguard_core_resilience::Target;
use futures::stream::{self, StreamExt};
use serde::Serialize;
use std::fmt::Write as _;
use std::sync::Arc;
use std::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::info;

/// Simulation parameters
#[derive(Debug, Clone)]
pub struct SimulateOptions {
    pub messages: usize,
    pub topic: String,
    /// In-flight publishes
    pub concurrency: usize,
    pub primary_down: bool,
    pub secondary_down: bool,
}

impl Default for SimulateOptions {
    fn default() -> Self {
        Self {
            messages: 100,
            topic: "simulated".to_string(),
            concurrency: 8,
            primary_down: false,
            secondary_down: false,
        }
    }
}

/// Outcome counts for a simulation run
#[derive(Debug, Clone, Serialize)]
pub struct SimulationReport {
    pub messages: usize,
    pub published_primary: usize,
    pub published_secondary: usize,
    pub write_failed: usize,
    pub write_to_log_failed: usize,
    pub rejected: usize,
    pub cancelled: usize,
    pub elapsed_ms: u128,
    pub pipeline: PipelineStats,
    pub failure_log: FailureLogStats,
}

impl SimulationReport {
    /// Messages that did not reach any broker
    pub fn undelivered(&self) -> usize {
        self.write_failed + self.write_to_log_failed + self.rejected + self.cancelled
    }

    pub fn exit_code(&self) -> i32 {
        if self.undelivered() == 0 {
            EXIT_SUCCESS
        } else {
            EXIT_PARTIAL
        }
    }

    /// Human-readable summary
    pub fn render(&self) -> String {
        let mut out = String::new();
        let _ = writeln!(
            out,
            "Simulated {} message(s) in {} ms",
            self.messages, self.elapsed_ms
        );
        let _ = writeln!(out, "  published via primary:   {}", self.published_primary);
        let _ = writeln!(
            out,
            "  published via secondary: {}",
            self.published_secondary
        );
        let _ = writeln!(out, "  written to failure log:  {}", self.write_failed);
        let _ = writeln!(
            out,
            "  failure log rejected:    {}",
            self.write_to_log_failed
        );
        let _ = writeln!(out, "  rejected by broker:      {}", self.rejected);
        let _ = writeln!(out, "  cancelled:               {}", self.cancelled);
        let _ = writeln!(
            out,
            "  active target: {} (trips: {})",
            self.pipeline.failover.active, self.pipeline.failover.trips
        );
        out
    }
}

/// Run a simulation. Cancelling `cancel` stops in-flight retries; the
/// remaining messages are counted as cancelled.
pub async fn run_simulation(
    config: &BusguardConfig,
    options: &SimulateOptions,
    cancel: CancellationToken,
) -> Result<SimulationReport> {
    let broker = MemoryBroker::new();
    broker.set_down(&config.primary.name, options.primary_down);
    if let Some(secondary) = &config.secondary {
        broker.set_down(&secondary.name, options.secondary_down);
    }

    let failure_log = Arc::new(InMemoryFailureLog::new(config.publish.failure_log_capacity));
    let pipeline = PublishPipeline::new(config, Arc::new(broker), failure_log.clone())?;

    info!(
        messages = options.messages,
        topic = %options.topic,
        primary_down = options.primary_down,
        secondary_down = options.secondary_down,
        "starting simulation"
    );

    let started = Instant::now();
    let results: Vec<_> = stream::iter(0..options.messages)
        .map(|sequence| {
            let payload = format!("{{\"sequence\":{}}}", sequence);
            let message = Message::new(options.topic.as_str(), payload)
                .with_publisher("busguard-simulate")
                .with_property("sequence", sequence.to_string());
            let pipeline = &pipeline;
            let cancel = &cancel;
            async move { pipeline.publish_with_cancel(message, cancel).await }
        })
        .buffer_unordered(options.concurrency.max(1))
        .collect()
        .await;

    let mut report = SimulationReport {
        messages: options.messages,
        published_primary: 0,
        published_secondary: 0,
        write_failed: 0,
        write_to_log_failed: 0,
        rejected: 0,
        cancelled: 0,
        elapsed_ms: started.elapsed().as_millis(),
        pipeline: pipeline.stats(),
        failure_log: failure_log.stats(),
    };

    for result in results {
        match result {
            Ok(PublishStatus::Published {
                target: Target::Primary,
            }) => report.published_primary += 1,
            Ok(PublishStatus::Published {
                target: Target::Secondary,
            }) => report.published_secondary += 1,
            Ok(PublishStatus::WriteFailed) => report.write_failed += 1,
            Ok(PublishStatus::WriteToLogFailed) => report.write_to_log_failed += 1,
            Err(PublishError::Undelivered { logged: true, .. }) => report.write_failed += 1,
            Err(PublishError::Undelivered { logged: false, .. }) => {
                report.write_to_log_failed += 1
            }
            Err(PublishError::Cancelled { .. }) => report.cancelled += 1,
            Err(PublishError::Fatal { .. }) | Err(PublishError::InvalidMessage(_)) => {
                report.rejected += 1
            }
        }
    }

    pipeline.shutdown().await;
    info!(
        undelivered = report.undelivered(),
        elapsed_ms = report.elapsed_ms as u64,
        "simulation finished"
    );

    Ok(report)
}
