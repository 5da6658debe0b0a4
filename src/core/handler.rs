//! Entry point for rotation invocations: validate the event, run the step, record it.

use crate::core::audit_log::{AuditEvent, AuditLog};
use crate::core::rotation::{RollbackReport, RotationError, RotationReport, Rotator, StepOutcome};
use crate::models::event::RotationEvent;
use tracing::{error, warn};

pub struct RotationHandler {
    rotator: Rotator,
    audit: Option<AuditLog>,
}

impl RotationHandler {
    pub fn new(rotator: Rotator, audit: Option<AuditLog>) -> Self {
        Self { rotator, audit }
    }

    pub fn rotator(&self) -> &Rotator {
        &self.rotator
    }

    fn record(&self, event: AuditEvent) {
        if let Some(log) = &self.audit {
            if let Err(e) = log.append(event) {
                warn!(path = %log.path().display(), error = %format!("{:#}", e), "failed to write audit entry");
            }
        }
    }

    /// Run one scheduler step.
    pub async fn handle(&self, event: RotationEvent) -> Result<StepOutcome, RotationError> {
        let secret_id = event
            .secret_id
            .clone()
            .filter(|id| !id.is_empty())
            .unwrap_or_else(|| "-".to_string());
        let request = match event.into_request() {
            Ok(request) => request,
            Err(reason) => {
                let err = RotationError::InvalidEvent(reason);
                self.record(AuditEvent::new("rotation_step", &secret_id).failed(&err));
                return Err(err);
            }
        };

        let result = self.rotator.execute(&request).await;
        let audit = AuditEvent::new("rotation_step", &request.secret_id)
            .step(request.step)
            .token(&request.token);
        match &result {
            Ok(StepOutcome::Completed) => self.record(audit),
            Ok(StepOutcome::AlreadyCurrent) => self.record(audit.detail("already AWSCURRENT")),
            Err(e) => {
                error!(secret_id = %request.secret_id, step = %request.step, error = %e, "rotation step failed");
                self.record(audit.failed(error_chain(e)));
            }
        }
        result
    }

    /// Run one step from a raw JSON payload.
    pub async fn handle_json(&self, payload: &[u8]) -> Result<StepOutcome, RotationError> {
        let event: RotationEvent = serde_json::from_slice(payload)
            .map_err(|e| RotationError::InvalidEvent(format!("payload is not a rotation event: {}", e)))?;
        self.handle(event).await
    }

    pub async fn rotate(&self, secret_id: &str) -> Result<RotationReport, RotationError> {
        let result = self.rotator.rotate(secret_id).await;
        let audit = AuditEvent::new("rotate", secret_id);
        match &result {
            Ok(report) => self.record(audit.token(&report.token)),
            Err(e) => self.record(audit.failed(error_chain(e))),
        }
        result
    }

    pub async fn rollback(&self, secret_id: &str) -> Result<RollbackReport, RotationError> {
        let result = self.rotator.rollback(secret_id).await;
        let audit = AuditEvent::new("rollback", secret_id);
        match &result {
            Ok(report) => self.record(audit.token(&report.restored_version)),
            Err(e) => self.record(audit.failed(error_chain(e))),
        }
        result
    }
}

/// `outer: inner: root` rendering of an error and its sources.
pub fn error_chain(err: &(dyn std::error::Error + 'static)) -> String {
    let mut out = err.to_string();
    let mut source = err.source();
    while let Some(cause) = source {
        out.push_str(": ");
        out.push_str(&cause.to_string());
        source = cause.source();
    }
    out
}
