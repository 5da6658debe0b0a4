//! Snowflake over its session/query REST endpoints.
//!
//! Login: `POST /session/v1/login-request` returns a session token.
//! Statements: `POST /queries/v1/query-request` with `Authorization: Snowflake Token="..."`.
//! Logout: `POST /session?delete=true`.
//! Errors come back as `{"success": false, "code": "003002", "message": ...}`.

use super::{SetPasswordOutcome, TargetError, TargetSystem};
use crate::constants::{APP_NAME, SNOWFLAKE_PRIOR_USE_ERROR};
use crate::models::config::SnowflakeSection;
use async_trait::async_trait;
use reqwest::header::{ACCEPT, AUTHORIZATION};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::Duration;
use tracing::{debug, warn};
use zeroize::Zeroizing;

/// Principal allowed to alter other users' passwords.
pub struct AdminCredentials {
    pub user: String,
    pub password: Zeroizing<String>,
}

impl AdminCredentials {
    pub fn new(user: &str, password: &str) -> Self {
        Self {
            user: user.to_string(),
            password: Zeroizing::new(password.to_string()),
        }
    }
}

impl fmt::Debug for AdminCredentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AdminCredentials")
            .field("user", &self.user)
            .finish_non_exhaustive()
    }
}

#[derive(Debug, Clone)]
pub struct SnowflakeSettings {
    pub account: String,
    pub base_url: String,
    pub role: String,
    pub warehouse: Option<String>,
    pub timeout: Duration,
}

impl SnowflakeSettings {
    pub fn from_section(section: &SnowflakeSection) -> Result<Self, TargetError> {
        let account = section
            .account
            .clone()
            .filter(|a| !a.trim().is_empty())
            .ok_or_else(|| TargetError::NotConfigured("snowflake.account is not set".into()))?;
        let base_url = section
            .base_url
            .clone()
            .unwrap_or_else(|| format!("https://{}.snowflakecomputing.com", account));
        Ok(Self {
            account,
            base_url: base_url.trim_end_matches('/').to_string(),
            role: section.role.clone(),
            warehouse: section.warehouse.clone(),
            timeout: Duration::from_secs(section.timeout_secs),
        })
    }

    /// Account locator sent at login (`xy12345.eu-west-1` -> `xy12345`).
    fn account_name(&self) -> &str {
        self.account.split('.').next().unwrap_or(&self.account)
    }
}

#[derive(Serialize)]
struct LoginRequest<'a> {
    data: LoginData<'a>,
}

#[derive(Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
struct LoginData<'a> {
    client_app_id: &'a str,
    client_app_version: &'a str,
    account_name: &'a str,
    login_name: &'a str,
    password: &'a str,
}

#[derive(Deserialize)]
struct LoginResponseData {
    #[serde(default)]
    token: Option<String>,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct QueryRequest<'a> {
    sql_text: &'a str,
    async_exec: bool,
    sequence_id: u64,
    query_submission_time: i64,
}

#[derive(Deserialize)]
struct Envelope<T> {
    data: Option<T>,
    #[serde(default)]
    code: Option<String>,
    #[serde(default)]
    message: Option<String>,
    #[serde(default)]
    success: bool,
}

impl<T> Envelope<T> {
    fn code(&self) -> Option<i64> {
        self.code.as_deref().and_then(|c| c.trim().parse().ok())
    }

    fn message(&self) -> String {
        self.message.clone().unwrap_or_else(|| "no message".into())
    }
}

struct Session {
    token: Zeroizing<String>,
}

pub struct SnowflakeTarget {
    http: reqwest::Client,
    settings: SnowflakeSettings,
    admin: AdminCredentials,
}

impl SnowflakeTarget {
    pub fn new(settings: SnowflakeSettings, admin: AdminCredentials) -> Result<Self, TargetError> {
        let http = reqwest::Client::builder()
            .timeout(settings.timeout)
            .user_agent(format!("{}/{}", APP_NAME, env!("CARGO_PKG_VERSION")))
            .build()?;
        Ok(Self {
            http,
            settings,
            admin,
        })
    }

    async fn post<B, T>(
        &self,
        url: &str,
        query: &[(&str, &str)],
        token: Option<&str>,
        body: &B,
    ) -> Result<Envelope<T>, TargetError>
    where
        B: Serialize + ?Sized,
        T: DeserializeOwned,
    {
        let mut request = self
            .http
            .post(url)
            .query(query)
            .header(ACCEPT, "application/json")
            .json(body);
        if let Some(token) = token {
            request = request.header(AUTHORIZATION, format!("Snowflake Token=\"{}\"", token));
        }
        let response = request.send().await?;
        let status = response.status();
        let text = response.text().await?;
        serde_json::from_str(&text).map_err(|e| {
            TargetError::Protocol(format!(
                "HTTP {} from {}: {} ({})",
                status,
                url,
                truncate(&text, 200),
                e
            ))
        })
    }

    async fn login(
        &self,
        user: &str,
        password: &str,
        role: Option<&str>,
    ) -> Result<Session, TargetError> {
        let url = format!("{}/session/v1/login-request", self.settings.base_url);
        let request_id = uuid::Uuid::new_v4().to_string();
        let mut query = vec![("request_id", request_id.as_str())];
        if let Some(role) = role {
            query.push(("roleName", role));
        }
        if let Some(warehouse) = self.settings.warehouse.as_deref() {
            query.push(("warehouse", warehouse));
        }
        let body = LoginRequest {
            data: LoginData {
                client_app_id: APP_NAME,
                client_app_version: env!("CARGO_PKG_VERSION"),
                account_name: self.settings.account_name(),
                login_name: user,
                password,
            },
        };
        let envelope: Envelope<LoginResponseData> = self.post(&url, &query, None, &body).await?;
        if !envelope.success {
            return Err(TargetError::AuthenticationFailed {
                user: user.to_string(),
                message: format!(
                    "{} (code {})",
                    envelope.message(),
                    envelope.code.as_deref().unwrap_or("?")
                ),
            });
        }
        let token = envelope
            .data
            .and_then(|d| d.token)
            .ok_or_else(|| TargetError::Protocol("login succeeded without a session token".into()))?;
        debug!(user, "snowflake session opened");
        Ok(Session {
            token: Zeroizing::new(token),
        })
    }

    async fn execute(&self, session: &Session, sql: &str) -> Result<(), TargetError> {
        let url = format!("{}/queries/v1/query-request", self.settings.base_url);
        let request_id = uuid::Uuid::new_v4().to_string();
        let body = QueryRequest {
            sql_text: sql,
            async_exec: false,
            sequence_id: 1,
            query_submission_time: chrono::Utc::now().timestamp_millis(),
        };
        let envelope: Envelope<serde_json::Value> = self
            .post(
                &url,
                &[("requestId", request_id.as_str())],
                Some(session.token.as_str()),
                &body,
            )
            .await?;
        if envelope.success {
            return Ok(());
        }
        Err(TargetError::Statement {
            code: envelope.code(),
            message: envelope.message(),
        })
    }

    /// Best-effort logout; a dangling session expires on its own.
    async fn close(&self, session: Session) {
        let url = format!("{}/session", self.settings.base_url);
        let result: Result<Envelope<serde_json::Value>, _> = self
            .post(&url, &[("delete", "true")], Some(session.token.as_str()), &serde_json::json!({}))
            .await;
        if let Err(e) = result {
            warn!(error = %e, "snowflake logout failed");
        }
    }
}

#[async_trait]
impl TargetSystem for SnowflakeTarget {
    fn describe(&self) -> String {
        format!("snowflake:{}", self.settings.account)
    }

    async fn set_password(
        &self,
        username: &str,
        password: &str,
    ) -> Result<SetPasswordOutcome, TargetError> {
        let user_ident = quote_identifier(username)?;
        let role_ident = quote_identifier(&self.settings.role)?;
        let session = self
            .login(&self.admin.user, &self.admin.password, Some(&self.settings.role))
            .await?;

        let use_role = format!("USE ROLE {}", role_ident);
        let alter = Zeroizing::new(format!(
            "ALTER USER {} SET PASSWORD = '{}'",
            user_ident,
            escape_literal(password).as_str()
        ));
        let result = match self.execute(&session, &use_role).await {
            Ok(()) => self.execute(&session, &alter).await,
            Err(e) => Err(e),
        };
        self.close(session).await;

        match result {
            Ok(()) => Ok(SetPasswordOutcome::Applied),
            Err(TargetError::Statement {
                code: Some(SNOWFLAKE_PRIOR_USE_ERROR),
                message,
            }) => {
                warn!(username, %message, "password already used for this user");
                Ok(SetPasswordOutcome::AlreadyUsed)
            }
            Err(e) => Err(e),
        }
    }

    async fn verify_login(&self, username: &str, password: &str) -> Result<(), TargetError> {
        let session = self.login(username, password, None).await?;
        self.close(session).await;
        Ok(())
    }
}

/// Render `name` as a Snowflake identifier: bare when it is a valid unquoted
/// identifier, otherwise double-quoted with embedded quotes doubled.
pub fn quote_identifier(name: &str) -> Result<String, TargetError> {
    if name.is_empty() || name.len() > 255 || name.chars().any(char::is_control) {
        return Err(TargetError::InvalidIdentifier(name.escape_debug().to_string()));
    }
    let mut chars = name.chars();
    let bare = chars
        .next()
        .is_some_and(|c| c.is_ascii_alphabetic() || c == '_')
        && chars.all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '$');
    if bare {
        Ok(name.to_string())
    } else {
        Ok(format!("\"{}\"", name.replace('"', "\"\"")))
    }
}

/// Escape a value for a single-quoted string literal.
pub fn escape_literal(value: &str) -> Zeroizing<String> {
    let mut out = Zeroizing::new(String::with_capacity(value.len() + 8));
    for c in value.chars() {
        match c {
            '\\' => out.push_str("\\\\"),
            '\'' => out.push_str("\\'"),
            c => out.push(c),
        }
    }
    out
}

fn truncate(s: &str, max: usize) -> &str {
    match s.char_indices().nth(max) {
        Some((idx, _)) => &s[..idx],
        None => s,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use wiremock::matchers::{body_partial_json, body_string_contains, header, method, path, query_param};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn target(server: &MockServer) -> SnowflakeTarget {
        let settings = SnowflakeSettings {
            account: "xy12345.eu-west-1".into(),
            base_url: server.uri(),
            role: "SECURITYADMIN".into(),
            warehouse: None,
            timeout: Duration::from_secs(5),
        };
        SnowflakeTarget::new(settings, AdminCredentials::new("ROTATOR", "admin-pass")).unwrap()
    }

    async fn mount_login(server: &MockServer, user: &str, token: &str) {
        Mock::given(method("POST"))
            .and(path("/session/v1/login-request"))
            .and(body_partial_json(json!({"data": {"LOGIN_NAME": user, "ACCOUNT_NAME": "xy12345"}})))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "data": {"token": token, "masterToken": "m"},
                "code": null,
                "message": null,
                "success": true
            })))
            .mount(server)
            .await;
    }

    async fn mount_logout(server: &MockServer) {
        Mock::given(method("POST"))
            .and(path("/session"))
            .and(query_param("delete", "true"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({"success": true})))
            .mount(server)
            .await;
    }

    #[test]
    fn test_quote_identifier() {
        assert_eq!(quote_identifier("ETL_USER").unwrap(), "ETL_USER");
        assert_eq!(quote_identifier("etl$1").unwrap(), "etl$1");
        assert_eq!(quote_identifier("etl.user").unwrap(), "\"etl.user\"");
        assert_eq!(
            quote_identifier("x\"; DROP USER y; --").unwrap(),
            "\"x\"\"; DROP USER y; --\""
        );
        assert!(quote_identifier("").is_err());
        assert!(quote_identifier("bad\nname").is_err());
    }

    #[test]
    fn test_escape_literal() {
        assert_eq!(escape_literal("a'b\\c").as_str(), "a\\'b\\\\c");
        assert_eq!(escape_literal("plain").as_str(), "plain");
    }

    #[test]
    fn test_settings_require_account() {
        let section = SnowflakeSection::default();
        assert!(matches!(
            SnowflakeSettings::from_section(&section),
            Err(TargetError::NotConfigured(_))
        ));
        let section = SnowflakeSection {
            account: Some("xy12345".into()),
            ..Default::default()
        };
        let settings = SnowflakeSettings::from_section(&section).unwrap();
        assert_eq!(settings.base_url, "https://xy12345.snowflakecomputing.com");
    }

    #[tokio::test]
    async fn test_set_password_runs_statements_as_admin() {
        let server = MockServer::start().await;
        mount_login(&server, "ROTATOR", "admin-token").await;
        mount_logout(&server).await;
        Mock::given(method("POST"))
            .and(path("/queries/v1/query-request"))
            .and(header("authorization", "Snowflake Token=\"admin-token\""))
            .and(body_string_contains("USE ROLE SECURITYADMIN"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({"success": true, "data": {}})))
            .expect(1)
            .mount(&server)
            .await;
        Mock::given(method("POST"))
            .and(path("/queries/v1/query-request"))
            .and(body_string_contains("ALTER USER ETL_USER SET PASSWORD = 'n3w\\\\'pw'"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({"success": true, "data": {}})))
            .expect(1)
            .mount(&server)
            .await;

        let outcome = target(&server).set_password("ETL_USER", "n3w'pw").await.unwrap();
        assert_eq!(outcome, SetPasswordOutcome::Applied);
    }

    #[tokio::test]
    async fn test_prior_use_is_already_used() {
        let server = MockServer::start().await;
        mount_login(&server, "ROTATOR", "admin-token").await;
        mount_logout(&server).await;
        Mock::given(method("POST"))
            .and(path("/queries/v1/query-request"))
            .and(body_string_contains("USE ROLE"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({"success": true})))
            .mount(&server)
            .await;
        Mock::given(method("POST"))
            .and(path("/queries/v1/query-request"))
            .and(body_string_contains("ALTER USER"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "success": false,
                "code": "003002",
                "message": "PRIOR USE of password is not allowed"
            })))
            .mount(&server)
            .await;

        let outcome = target(&server).set_password("ETL_USER", "pw").await.unwrap();
        assert_eq!(outcome, SetPasswordOutcome::AlreadyUsed);
    }

    #[tokio::test]
    async fn test_other_statement_errors_propagate() {
        let server = MockServer::start().await;
        mount_login(&server, "ROTATOR", "admin-token").await;
        mount_logout(&server).await;
        Mock::given(method("POST"))
            .and(path("/queries/v1/query-request"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "success": false,
                "code": "003001",
                "message": "Insufficient privileges"
            })))
            .mount(&server)
            .await;

        let err = target(&server).set_password("ETL_USER", "pw").await.unwrap_err();
        assert!(matches!(err, TargetError::Statement { code: Some(3001), .. }));
    }

    #[tokio::test]
    async fn test_verify_login() {
        let server = MockServer::start().await;
        mount_login(&server, "ETL_USER", "user-token").await;
        mount_logout(&server).await;
        target(&server).verify_login("ETL_USER", "pw").await.unwrap();
    }

    #[tokio::test]
    async fn test_verify_login_rejected() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/session/v1/login-request"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "data": null,
                "code": "390100",
                "message": "Incorrect username or password was specified.",
                "success": false
            })))
            .mount(&server)
            .await;

        let err = target(&server).verify_login("ETL_USER", "wrong").await.unwrap_err();
        match err {
            TargetError::AuthenticationFailed { user, message } => {
                assert_eq!(user, "ETL_USER");
                assert!(message.contains("390100"));
            }
            other => panic!("unexpected error: {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_non_json_response_is_protocol_error() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/session/v1/login-request"))
            .respond_with(ResponseTemplate::new(503).set_body_string("<html>down</html>"))
            .mount(&server)
            .await;
        let err = target(&server).verify_login("ETL_USER", "pw").await.unwrap_err();
        assert!(matches!(err, TargetError::Protocol(msg) if msg.contains("503")));
    }
}
