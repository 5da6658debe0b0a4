//! AWS Secrets Manager backend.

use super::{SecretStore, StoreError};
use crate::core::password::PasswordPolicy;
use crate::models::config::StoreSection;
use crate::models::secret::{SecretMetadata, SecretValue};
use async_trait::async_trait;
use aws_sdk_secretsmanager::error::{DisplayErrorContext, SdkError};
use aws_sdk_secretsmanager::Client;
use std::collections::BTreeMap;
use zeroize::Zeroizing;

#[derive(Debug, Clone)]
pub struct AwsSecretStore {
    client: Client,
}

fn backend_error<E, R>(operation: &'static str, err: SdkError<E, R>) -> StoreError
where
    E: std::error::Error + 'static,
    R: std::fmt::Debug,
{
    StoreError::Backend {
        operation,
        message: DisplayErrorContext(&err).to_string(),
    }
}

impl AwsSecretStore {
    /// Build a client from the default credential chain, honouring the configured
    /// region and endpoint override.
    pub async fn connect(section: &StoreSection) -> Self {
        let mut loader = aws_config::defaults(aws_config::BehaviorVersion::latest());
        if let Some(region) = &section.region {
            loader = loader.region(aws_config::Region::new(region.clone()));
        }
        if let Some(endpoint) = &section.endpoint_url {
            loader = loader.endpoint_url(endpoint);
        }
        let sdk_config = loader.load().await;
        tracing::debug!(
            region = ?sdk_config.region(),
            endpoint = ?section.endpoint_url,
            "initialized Secrets Manager client"
        );
        Self::from_client(Client::new(&sdk_config))
    }

    pub fn from_client(client: Client) -> Self {
        Self { client }
    }
}

#[async_trait]
impl SecretStore for AwsSecretStore {
    fn backend(&self) -> &'static str {
        "aws"
    }

    async fn describe_secret(&self, secret_id: &str) -> Result<SecretMetadata, StoreError> {
        let out = self
            .client
            .describe_secret()
            .secret_id(secret_id)
            .send()
            .await
            .map_err(|err| {
                if err
                    .as_service_error()
                    .is_some_and(|e| e.is_resource_not_found_exception())
                {
                    StoreError::NotFound {
                        secret_id: secret_id.to_string(),
                        what: "secret".into(),
                    }
                } else {
                    backend_error("DescribeSecret", err)
                }
            })?;

        let versions: BTreeMap<String, Vec<String>> = out
            .version_ids_to_stages()
            .map(|map| map.iter().map(|(k, v)| (k.clone(), v.clone())).collect())
            .unwrap_or_default();

        Ok(SecretMetadata {
            name: out.name().map(str::to_string),
            rotation_enabled: out.rotation_enabled().unwrap_or(false),
            versions,
        })
    }

    async fn get_secret_value(
        &self,
        secret_id: &str,
        version_id: Option<&str>,
        stage: Option<&str>,
    ) -> Result<SecretValue, StoreError> {
        let out = self
            .client
            .get_secret_value()
            .secret_id(secret_id)
            .set_version_id(version_id.map(str::to_string))
            .set_version_stage(stage.map(str::to_string))
            .send()
            .await
            .map_err(|err| {
                if err
                    .as_service_error()
                    .is_some_and(|e| e.is_resource_not_found_exception())
                {
                    StoreError::NotFound {
                        secret_id: secret_id.to_string(),
                        what: format!(
                            "version {} / stage {}",
                            version_id.unwrap_or("-"),
                            stage.unwrap_or("-")
                        ),
                    }
                } else {
                    backend_error("GetSecretValue", err)
                }
            })?;

        let secret_string = out.secret_string().ok_or_else(|| StoreError::InvalidRequest {
            secret_id: secret_id.to_string(),
            reason: "secret has no string value (binary secrets are not supported)".into(),
        })?;
        Ok(SecretValue {
            version_id: out.version_id().unwrap_or_default().to_string(),
            secret_string: Zeroizing::new(secret_string.to_string()),
        })
    }

    async fn put_secret_value(
        &self,
        secret_id: &str,
        token: &str,
        secret_string: &str,
        stages: &[&str],
    ) -> Result<(), StoreError> {
        let stages = (!stages.is_empty()).then(|| stages.iter().map(|s| s.to_string()).collect());
        self.client
            .put_secret_value()
            .secret_id(secret_id)
            .client_request_token(token)
            .secret_string(secret_string)
            .set_version_stages(stages)
            .send()
            .await
            .map_err(|err| backend_error("PutSecretValue", err))?;
        Ok(())
    }

    async fn update_version_stage(
        &self,
        secret_id: &str,
        stage: &str,
        move_to: Option<&str>,
        remove_from: Option<&str>,
    ) -> Result<(), StoreError> {
        self.client
            .update_secret_version_stage()
            .secret_id(secret_id)
            .version_stage(stage)
            .set_move_to_version_id(move_to.map(str::to_string))
            .set_remove_from_version_id(remove_from.map(str::to_string))
            .send()
            .await
            .map_err(|err| backend_error("UpdateSecretVersionStage", err))?;
        Ok(())
    }

    async fn random_password(
        &self,
        policy: &PasswordPolicy,
    ) -> Result<Zeroizing<String>, StoreError> {
        policy.validate()?;
        let out = self
            .client
            .get_random_password()
            .password_length(policy.length as i64)
            .set_exclude_characters(
                (!policy.exclude_characters.is_empty()).then(|| policy.exclude_characters.clone()),
            )
            .exclude_punctuation(policy.exclude_punctuation)
            .require_each_included_type(policy.require_each_included_type)
            .send()
            .await
            .map_err(|err| backend_error("GetRandomPassword", err))?;
        out.random_password()
            .map(|p| Zeroizing::new(p.to_string()))
            .ok_or(StoreError::Backend {
                operation: "GetRandomPassword",
                message: "response carried no password".into(),
            })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::constants::{STAGE_CURRENT, STAGE_PENDING};
    use aws_sdk_secretsmanager::config::retry::RetryConfig;
    use aws_sdk_secretsmanager::config::{BehaviorVersion, Credentials, Region};
    use wiremock::matchers::{body_partial_json, header, method, HeaderExactMatcher};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    const AMZ_JSON: &str = "application/x-amz-json-1.1";

    fn store(server: &MockServer) -> AwsSecretStore {
        let config = aws_sdk_secretsmanager::Config::builder()
            .behavior_version(BehaviorVersion::latest())
            .region(Region::new("eu-west-1"))
            .credentials_provider(Credentials::new("AKIDTEST", "test-secret", None, None, "test"))
            .endpoint_url(server.uri())
            .retry_config(RetryConfig::disabled())
            .build();
        AwsSecretStore::from_client(Client::from_conf(config))
    }

    fn target(operation: &str) -> HeaderExactMatcher {
        header("x-amz-target", format!("secretsmanager.{}", operation))
    }

    fn ok(body: serde_json::Value) -> ResponseTemplate {
        ResponseTemplate::new(200).set_body_raw(body.to_string(), AMZ_JSON)
    }

    fn service_error(code: &str) -> ResponseTemplate {
        ResponseTemplate::new(400)
            .insert_header("x-amzn-errortype", code)
            .set_body_raw(
                serde_json::json!({ "__type": code, "Message": "rejected by test server" })
                    .to_string(),
                AMZ_JSON,
            )
    }

    #[tokio::test]
    async fn test_describe_maps_stages_and_rotation_flag() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(target("DescribeSecret"))
            .and(body_partial_json(serde_json::json!({ "SecretId": "snowflake/etl" })))
            .respond_with(ok(serde_json::json!({
                "Name": "snowflake/etl",
                "RotationEnabled": true,
                "VersionIdsToStages": {
                    "v1": ["AWSCURRENT"],
                    "v0": ["AWSPREVIOUS"],
                    "tok": ["AWSPENDING"]
                }
            })))
            .expect(1)
            .mount(&server)
            .await;

        let meta = store(&server).describe_secret("snowflake/etl").await.unwrap();
        assert_eq!(meta.name.as_deref(), Some("snowflake/etl"));
        assert!(meta.rotation_enabled);
        assert_eq!(meta.current_version(), Some("v1"));
        assert_eq!(meta.previous_version(), Some("v0"));
        assert!(meta.has_stage("tok", STAGE_PENDING));
    }

    #[tokio::test]
    async fn test_describe_without_rotation_flag_is_disabled() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(target("DescribeSecret"))
            .respond_with(ok(serde_json::json!({
                "Name": "s",
                "VersionIdsToStages": { "v1": ["AWSCURRENT"] }
            })))
            .mount(&server)
            .await;

        let meta = store(&server).describe_secret("s").await.unwrap();
        assert!(!meta.rotation_enabled);
    }

    #[tokio::test]
    async fn test_missing_secret_is_not_found() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(target("DescribeSecret"))
            .respond_with(service_error("ResourceNotFoundException"))
            .mount(&server)
            .await;

        let err = store(&server).describe_secret("gone").await.unwrap_err();
        assert!(err.is_not_found(), "{err:?}");
    }

    #[tokio::test]
    async fn test_pending_lookup_not_found() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(target("GetSecretValue"))
            .and(body_partial_json(serde_json::json!({
                "SecretId": "s",
                "VersionId": "tok",
                "VersionStage": "AWSPENDING"
            })))
            .respond_with(service_error("ResourceNotFoundException"))
            .expect(1)
            .mount(&server)
            .await;

        let err = store(&server)
            .get_secret_value("s", Some("tok"), Some(STAGE_PENDING))
            .await
            .unwrap_err();
        match err {
            StoreError::NotFound { secret_id, what } => {
                assert_eq!(secret_id, "s");
                assert!(what.contains("tok"));
            }
            other => panic!("unexpected error: {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_other_service_errors_are_backend_errors() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(target("GetSecretValue"))
            .respond_with(service_error("InvalidRequestException"))
            .mount(&server)
            .await;

        let err = store(&server)
            .get_secret_value("s", None, Some(STAGE_CURRENT))
            .await
            .unwrap_err();
        match err {
            StoreError::Backend { operation, message } => {
                assert_eq!(operation, "GetSecretValue");
                assert!(message.contains("InvalidRequestException"), "{message}");
            }
            other => panic!("unexpected error: {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_get_current_value() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(target("GetSecretValue"))
            .respond_with(ok(serde_json::json!({
                "Name": "s",
                "VersionId": "v1",
                "SecretString": "{\"username\":\"U\",\"password\":\"p\"}",
                "VersionStages": ["AWSCURRENT"]
            })))
            .mount(&server)
            .await;

        let value = store(&server).get_secret_value("s", None, None).await.unwrap();
        assert_eq!(value.version_id, "v1");
        assert!(value.secret_string.contains("\"username\":\"U\""));
    }

    #[tokio::test]
    async fn test_binary_secret_rejected() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(target("GetSecretValue"))
            .respond_with(ok(serde_json::json!({
                "Name": "s",
                "VersionId": "v1",
                "SecretBinary": "AAEC"
            })))
            .mount(&server)
            .await;

        let err = store(&server).get_secret_value("s", None, None).await.unwrap_err();
        assert!(matches!(err, StoreError::InvalidRequest { .. }), "{err:?}");
    }

    #[tokio::test]
    async fn test_put_sends_token_and_stages() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(target("PutSecretValue"))
            .respond_with(ok(serde_json::json!({ "Name": "s", "VersionId": "tok" })))
            .expect(2)
            .mount(&server)
            .await;

        let store = store(&server);
        store
            .put_secret_value("s", "tok", "{}", &[STAGE_PENDING])
            .await
            .unwrap();
        store.put_secret_value("s", "tok2", "{}", &[]).await.unwrap();

        let requests = server.received_requests().await.unwrap();
        let bodies: Vec<serde_json::Value> = requests
            .iter()
            .map(|r| serde_json::from_slice(&r.body).unwrap())
            .collect();
        assert_eq!(bodies[0]["ClientRequestToken"], "tok");
        assert_eq!(bodies[0]["VersionStages"], serde_json::json!(["AWSPENDING"]));
        assert_eq!(bodies[1]["ClientRequestToken"], "tok2");
        assert!(bodies[1].get("VersionStages").is_none());
    }

    #[tokio::test]
    async fn test_update_stage_sends_move_and_remove() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(target("UpdateSecretVersionStage"))
            .and(body_partial_json(serde_json::json!({
                "SecretId": "s",
                "VersionStage": "AWSCURRENT",
                "MoveToVersionId": "tok",
                "RemoveFromVersionId": "v1"
            })))
            .respond_with(ok(serde_json::json!({ "Name": "s" })))
            .expect(1)
            .mount(&server)
            .await;

        store(&server)
            .update_version_stage("s", STAGE_CURRENT, Some("tok"), Some("v1"))
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_random_password_passes_policy() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(target("GetRandomPassword"))
            .and(body_partial_json(serde_json::json!({
                "PasswordLength": 32,
                "ExcludeCharacters": crate::constants::DEFAULT_EXCLUDE_CHARACTERS,
                "RequireEachIncludedType": true
            })))
            .respond_with(ok(serde_json::json!({ "RandomPassword": "Zx9-generated-by-aws" })))
            .expect(1)
            .mount(&server)
            .await;

        let password = store(&server)
            .random_password(&PasswordPolicy::default())
            .await
            .unwrap();
        assert_eq!(password.as_str(), "Zx9-generated-by-aws");
    }
}
