//! Client for the function host's runtime API: poll for an invocation, run it,
//! post the response or the error.

use crate::constants::{RUNTIME_API_VERSION, RUNTIME_REQUEST_ID_HEADER};
use crate::core::handler::{error_chain, RotationHandler};
use anyhow::{bail, Context, Result};
use serde::Serialize;
use tracing::{error, info, info_span, Instrument};

const RUNTIME_API_ENV: &str = "AWS_LAMBDA_RUNTIME_API";
const TRACE_ID_HEADER: &str = "lambda-runtime-trace-id";
const ERROR_TYPE_HEADER: &str = "Lambda-Runtime-Function-Error-Type";

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct ErrorBody<'a> {
    error_message: &'a str,
    error_type: &'a str,
}

#[derive(Debug)]
pub struct Invocation {
    pub request_id: String,
    pub trace_id: Option<String>,
    pub payload: Vec<u8>,
}

#[derive(Debug, Clone)]
pub struct RuntimeClient {
    base: String,
    http: reqwest::Client,
}

impl RuntimeClient {
    /// `api` is `host:port`, as published in `AWS_LAMBDA_RUNTIME_API`.
    pub fn new(api: &str) -> Self {
        let base = if api.starts_with("http://") || api.starts_with("https://") {
            api.trim_end_matches('/').to_string()
        } else {
            format!("http://{}", api.trim_end_matches('/'))
        };
        Self {
            base: format!("{}/{}/runtime", base, RUNTIME_API_VERSION),
            http: reqwest::Client::new(),
        }
    }

    pub fn from_env() -> Result<Self> {
        let api = std::env::var(RUNTIME_API_ENV)
            .with_context(|| format!("{} is not set; not running under a function host", RUNTIME_API_ENV))?;
        Ok(Self::new(&api))
    }

    /// Block until the host hands over the next event. `None` means the host sent
    /// an invocation without a request id, which cannot be answered.
    pub async fn next_invocation(&self) -> Result<Option<Invocation>> {
        let resp = self
            .http
            .get(format!("{}/invocation/next", self.base))
            .send()
            .await
            .context("poll next invocation")?;
        if !resp.status().is_success() {
            bail!("runtime API returned {} for next invocation", resp.status());
        }
        let header = |name: &str| {
            resp.headers()
                .get(name)
                .and_then(|v| v.to_str().ok())
                .map(str::to_string)
        };
        let Some(request_id) = header(RUNTIME_REQUEST_ID_HEADER) else {
            error!("invocation has no request id header, skipping");
            return Ok(None);
        };
        let trace_id = header(TRACE_ID_HEADER);
        let payload = resp.bytes().await.context("read invocation payload")?.to_vec();
        Ok(Some(Invocation {
            request_id,
            trace_id,
            payload,
        }))
    }

    pub async fn respond(&self, request_id: &str, body: &serde_json::Value) -> Result<()> {
        let resp = self
            .http
            .post(format!("{}/invocation/{}/response", self.base, request_id))
            .json(body)
            .send()
            .await
            .context("post invocation response")?;
        if !resp.status().is_success() {
            bail!("runtime API rejected response for {}: {}", request_id, resp.status());
        }
        Ok(())
    }

    pub async fn report_error(&self, request_id: &str, kind: &str, message: &str) -> Result<()> {
        let url = format!("{}/invocation/{}/error", self.base, request_id);
        self.post_error(&url, kind, message).await
    }

    /// Report a failure to start; the host then stops the environment.
    pub async fn report_init_error(&self, kind: &str, message: &str) -> Result<()> {
        let url = format!("{}/init/error", self.base);
        self.post_error(&url, kind, message).await
    }

    async fn post_error(&self, url: &str, kind: &str, message: &str) -> Result<()> {
        let resp = self
            .http
            .post(url)
            .header(ERROR_TYPE_HEADER, kind)
            .json(&ErrorBody {
                error_message: message,
                error_type: kind,
            })
            .send()
            .await
            .context("post error report")?;
        if !resp.status().is_success() {
            bail!("runtime API rejected error report: {}", resp.status());
        }
        Ok(())
    }

    /// Handle a single invocation end to end.
    pub async fn serve_once(&self, handler: &RotationHandler) -> Result<()> {
        let Some(invocation) = self.next_invocation().await? else {
            return Ok(());
        };
        let span = info_span!(
            "invocation",
            request_id = %invocation.request_id,
            trace_id = invocation.trace_id.as_deref().unwrap_or("-")
        );
        async {
            match handler.handle_json(&invocation.payload).await {
                Ok(outcome) => {
                    info!(?outcome, "invocation succeeded");
                    self.respond(&invocation.request_id, &serde_json::Value::Null)
                        .await
                }
                Err(e) => {
                    let message = error_chain(&e);
                    error!(kind = e.kind(), error = %message, "invocation failed");
                    self.report_error(&invocation.request_id, e.kind(), &message)
                        .await
                }
            }
        }
        .instrument(span)
        .await
    }

    /// Serve invocations until the runtime API itself fails.
    pub async fn serve(&self, handler: &RotationHandler) -> Result<()> {
        info!(base = %self.base, "waiting for invocations");
        loop {
            self.serve_once(handler).await?;
        }
    }
}
