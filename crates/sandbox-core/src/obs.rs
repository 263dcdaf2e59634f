//! Structured job lifecycle events.
//!
//! Every job runs inside a [`job_span`] so all events it logs carry the run
//! and VM ids. The `emit_*` helpers log one `event = "job.*"` record each.

use std::time::Duration;

use tracing::{info, warn, Span};

use crate::executor::JobPhase;

/// Span tagging everything a job logs.
pub fn job_span(run_id: &str, vm_id: &str) -> Span {
    tracing::info_span!("sandbox.job", run_id = %run_id, vm_id = %vm_id)
}

pub fn emit_job_started(run_id: &str, agent_type: &str, isolated: bool) {
    info!(event = "job.started", run_id = %run_id, agent_type, isolated);
}

pub fn emit_phase(phase: JobPhase) {
    info!(event = "job.phase", phase = %phase);
}

pub fn emit_job_finished(run_id: &str, phase: JobPhase, exit_code: i32, duration: Duration) {
    info!(
        event = "job.finished",
        run_id = %run_id,
        outcome = %phase,
        exit_code,
        duration_ms = duration.as_millis() as u64,
    );
}

/// A cleanup step failed; the job result is unaffected.
pub fn emit_cleanup_error(step: &str, error: &dyn std::fmt::Display) {
    warn!(event = "job.cleanup_error", step, error = %error);
}
