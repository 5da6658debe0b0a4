//! Rotation trigger event, as delivered by the scheduler.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Raw invocation payload. Every field is optional so that a malformed event
/// deserializes and is rejected by [`RotationEvent::into_request`] with a precise reason.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RotationEvent {
    #[serde(rename = "SecretId", default)]
    pub secret_id: Option<String>,
    #[serde(rename = "ClientRequestToken", default)]
    pub client_request_token: Option<String>,
    #[serde(rename = "Step", default)]
    pub step: Option<String>,
}

/// The four rotation steps, in execution order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum RotationStep {
    #[serde(rename = "createSecret")]
    Create,
    #[serde(rename = "setSecret")]
    Set,
    #[serde(rename = "testSecret")]
    Test,
    #[serde(rename = "finishSecret")]
    Finish,
}

impl RotationStep {
    pub const ALL: [RotationStep; 4] = [
        RotationStep::Create,
        RotationStep::Set,
        RotationStep::Test,
        RotationStep::Finish,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            RotationStep::Create => "createSecret",
            RotationStep::Set => "setSecret",
            RotationStep::Test => "testSecret",
            RotationStep::Finish => "finishSecret",
        }
    }
}

impl fmt::Display for RotationStep {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for RotationStep {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        RotationStep::ALL
            .into_iter()
            .find(|step| step.as_str() == s)
            .ok_or_else(|| {
                format!(
                    "invalid step '{}', must be one of: createSecret, setSecret, testSecret, finishSecret",
                    s
                )
            })
    }
}

/// A validated event.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RotationRequest {
    pub secret_id: String,
    pub token: String,
    pub step: RotationStep,
}

impl RotationEvent {
    pub fn new(secret_id: &str, token: &str, step: RotationStep) -> Self {
        Self {
            secret_id: Some(secret_id.to_string()),
            client_request_token: Some(token.to_string()),
            step: Some(step.as_str().to_string()),
        }
    }

    pub fn into_request(self) -> Result<RotationRequest, String> {
        let secret_id = required(self.secret_id, "SecretId")?;
        let token = required(self.client_request_token, "ClientRequestToken")?;
        let step = required(self.step, "Step")?.parse()?;
        Ok(RotationRequest {
            secret_id,
            token,
            step,
        })
    }
}

fn required(value: Option<String>, field: &str) -> Result<String, String> {
    match value {
        Some(v) if !v.trim().is_empty() => Ok(v),
        Some(_) => Err(format!("event field '{}' is empty", field)),
        None => Err(format!("event is missing '{}'", field)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_scheduler_payload() {
        let json = r#"{
            "SecretId": "arn:aws:secretsmanager:eu-west-1:123:secret:snowflake/etl",
            "ClientRequestToken": "3f1c7c3e-6a0e-4a33-9a52-0f7c3bd1e6a4",
            "Step": "setSecret",
            "RotationToken": "ignored"
        }"#;
        let event: RotationEvent = serde_json::from_str(json).unwrap();
        let req = event.into_request().unwrap();
        assert_eq!(req.step, RotationStep::Set);
        assert_eq!(req.token, "3f1c7c3e-6a0e-4a33-9a52-0f7c3bd1e6a4");
    }

    #[test]
    fn test_missing_field_rejected() {
        let event: RotationEvent =
            serde_json::from_str(r#"{"SecretId": "s", "Step": "createSecret"}"#).unwrap();
        let err = event.into_request().unwrap_err();
        assert!(err.contains("ClientRequestToken"));
    }

    #[test]
    fn test_blank_field_rejected() {
        let event = RotationEvent {
            secret_id: Some("  ".into()),
            client_request_token: Some("t".into()),
            step: Some("createSecret".into()),
        };
        assert!(event.into_request().unwrap_err().contains("empty"));
    }

    #[test]
    fn test_unknown_step_rejected() {
        let event = RotationEvent {
            secret_id: Some("s".into()),
            client_request_token: Some("t".into()),
            step: Some("dropSecret".into()),
        };
        assert!(event.into_request().unwrap_err().contains("invalid step"));
    }

    #[test]
    fn test_step_names_match_wire_format() {
        for step in RotationStep::ALL {
            assert_eq!(step.as_str().parse::<RotationStep>().unwrap(), step);
            let json = serde_json::to_string(&step).unwrap();
            assert_eq!(json, format!("\"{}\"", step.as_str()));
        }
    }
}
