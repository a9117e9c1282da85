//! Remote verification backends.
//!
//! Both supported providers speak the same three-call protocol
//! (start, submit frame, verify). They differ in how URLs are built, in
//! request field names, and in auth, so one client type covers both with a
//! closed [`Provider`] enum doing the shaping.

use std::fmt;
use std::future::Future;
use std::pin::Pin;
use std::time::Duration;

use base64::Engine as _;
use reqwest::Url;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use thiserror::Error;
use tumtum_core::{ChallengeSession, GuidanceBox, Rect};

use crate::config::{BackendKind, Settings};

const AWS_PATH_TEMPLATE: &str = "/Prod/challenge/";
const REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BackendErrorKind {
    /// Could not build a request URL.
    Url,
    /// Connection, TLS or timeout failure.
    Transport,
    /// Server answered with a non-2xx status.
    Status,
    /// Response body did not have the expected shape.
    Decode,
}

impl fmt::Display for BackendErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            BackendErrorKind::Url => "url",
            BackendErrorKind::Transport => "transport",
            BackendErrorKind::Status => "http status",
            BackendErrorKind::Decode => "decode",
        })
    }
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("backend {kind} error{}: {body}", .status.map(|s| format!(" ({s})")).unwrap_or_default())]
pub struct BackendError {
    pub kind: BackendErrorKind,
    pub status: Option<u16>,
    pub body: String,
}

impl BackendError {
    fn new(kind: BackendErrorKind, status: Option<u16>, body: impl Into<String>) -> Self {
        Self {
            kind,
            status,
            body: body.into(),
        }
    }

    fn transport(e: reqwest::Error) -> Self {
        Self::new(
            BackendErrorKind::Transport,
            e.status().map(|s| s.as_u16()),
            e.to_string(),
        )
    }
}

/// Verify response, kept whole so callers can branch on it later.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Verdict {
    pub body: Value,
}

impl Verdict {
    fn from_body(text: &str) -> Self {
        let body = if text.trim().is_empty() {
            Value::Null
        } else {
            serde_json::from_str(text).unwrap_or_else(|_| Value::String(text.to_string()))
        };
        Self { body }
    }

    /// `success` (or `verified`) flag of the response, when present.
    pub fn success(&self) -> Option<bool> {
        self.body
            .get("success")
            .or_else(|| self.body.get("verified"))
            .and_then(Value::as_bool)
    }
}

pub type BackendFuture<'a, T> = Pin<Box<dyn Future<Output = Result<T, BackendError>> + Send + 'a>>;

/// The three challenge calls, independent of provider.
pub trait VerificationBackend: Send + Sync {
    fn name(&self) -> &'static str;

    fn start(&self, image_width: u32, image_height: u32) -> BackendFuture<'_, ChallengeSession>;

    fn submit_frame<'a>(
        &'a self,
        session: &'a ChallengeSession,
        jpeg: &'a [u8],
        timestamp_ms: i64,
    ) -> BackendFuture<'a, ()>;

    fn verify<'a>(&'a self, session: &'a ChallengeSession) -> BackendFuture<'a, Verdict>;
}

/// Start response. Both providers answer in camelCase, but older
/// deployments use snake_case and name the user `external_person_id`.
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ChallengeInfo {
    id: String,
    #[serde(alias = "user_id", alias = "externalPersonId", alias = "external_person_id")]
    user_id: String,
    #[serde(alias = "image_width")]
    image_width: u32,
    #[serde(alias = "image_height")]
    image_height: u32,
    #[serde(alias = "area_left")]
    area_left: i32,
    #[serde(alias = "area_top")]
    area_top: i32,
    #[serde(alias = "area_width")]
    area_width: i32,
    #[serde(alias = "area_height")]
    area_height: i32,
    #[serde(alias = "min_face_area_percent")]
    min_face_area_percent: u32,
    #[serde(alias = "nose_left")]
    nose_left: i32,
    #[serde(alias = "nose_top")]
    nose_top: i32,
    #[serde(alias = "nose_width")]
    nose_width: i32,
    #[serde(alias = "nose_height")]
    nose_height: i32,
    #[serde(default)]
    token: Option<String>,
}

impl ChallengeInfo {
    fn into_session(self) -> ChallengeSession {
        ChallengeSession {
            id: self.id,
            user_id: self.user_id,
            frame_width: self.image_width,
            frame_height: self.image_height,
            target: GuidanceBox {
                area: Rect::new(self.area_left, self.area_top, self.area_width, self.area_height),
                nose: Rect::new(self.nose_left, self.nose_top, self.nose_width, self.nose_height),
                min_face_area_percent: self.min_face_area_percent,
            },
            token: self.token,
        }
    }
}

/// Request shaping per provider.
#[derive(Debug, Clone)]
enum Provider {
    /// Fixed path template on a per-deployment domain, no request auth.
    DomainKeyed { base: Url },
    /// Configurable base URL, basic auth on every request.
    Credentialed {
        base: Url,
        username: String,
        password: String,
    },
}

/// HTTP client for one configured provider.
#[derive(Debug, Clone)]
pub struct BackendClient {
    http: reqwest::Client,
    provider: Provider,
}

impl BackendClient {
    /// Domain-keyed deployment: `https://{domain}/Prod/challenge/…`.
    pub fn domain_keyed(domain: &str) -> Result<Self, BackendError> {
        let base = parse_url(&format!("https://{domain}{AWS_PATH_TEMPLATE}"))?;
        Self::with_provider(Provider::DomainKeyed { base })
    }

    /// Credentialed deployment rooted at `base_url`.
    pub fn credentialed(base_url: &str, username: &str, password: &str) -> Result<Self, BackendError> {
        Self::with_provider(Provider::Credentialed {
            base: parse_url(base_url)?,
            username: username.to_string(),
            password: password.to_string(),
        })
    }

    pub fn from_settings(kind: BackendKind, settings: &Settings) -> Result<Self, BackendError> {
        match kind {
            BackendKind::AwsDemo => Self::domain_keyed(&settings.aws_demo.domain),
            BackendKind::Sst => Self::credentialed(
                &settings.sst.base_url,
                &settings.sst.username,
                &settings.sst.password,
            ),
        }
    }

    fn with_provider(provider: Provider) -> Result<Self, BackendError> {
        let http = reqwest::Client::builder()
            .timeout(REQUEST_TIMEOUT)
            .build()
            .map_err(BackendError::transport)?;
        Ok(Self { http, provider })
    }

    fn base(&self) -> &Url {
        match &self.provider {
            Provider::DomainKeyed { base } | Provider::Credentialed { base, .. } => base,
        }
    }

    fn start_request(&self, image_width: u32, image_height: u32) -> Result<(Url, Value), BackendError> {
        let url = endpoint(self.base(), &["start"])?;
        let person = uuid::Uuid::new_v4().to_string();
        let body = match self.provider {
            Provider::DomainKeyed { .. } => json!({
                "userId": person,
                "imageWidth": image_width,
                "imageHeight": image_height,
            }),
            Provider::Credentialed { .. } => json!({
                "external_person_id": person,
                "image_width": image_width,
                "image_height": image_height,
            }),
        };
        Ok((url, body))
    }

    fn frame_request(
        &self,
        session: &ChallengeSession,
        jpeg: &[u8],
        timestamp_ms: i64,
    ) -> Result<(Url, Value), BackendError> {
        let url = endpoint(self.base(), &[session.id.as_str(), "frames"])?;
        let encoded = base64::engine::general_purpose::STANDARD.encode(jpeg);
        let body = match self.provider {
            Provider::DomainKeyed { .. } => json!({
                "frameBase64": encoded,
                "timestamp": timestamp_ms,
                "token": session.token,
            }),
            Provider::Credentialed { .. } => json!({ "content": encoded }),
        };
        Ok((url, body))
    }

    fn verify_request(&self, session: &ChallengeSession) -> Result<(Url, Value), BackendError> {
        let url = endpoint(self.base(), &[session.id.as_str(), "verify"])?;
        Ok((url, json!({ "token": session.token })))
    }

    /// POST `body` as JSON and return the response text of a 2xx answer.
    async fn post(&self, url: Url, body: &Value) -> Result<String, BackendError> {
        tracing::debug!(%url, backend = self.name(), "POST");
        let mut request = self.http.post(url).json(body);
        if let Provider::Credentialed {
            username, password, ..
        } = &self.provider
        {
            request = request.basic_auth(username, Some(password));
        }

        let response = request.send().await.map_err(BackendError::transport)?;
        let status = response.status();
        if !status.is_success() {
            let text = response.text().await.unwrap_or_default();
            return Err(BackendError::new(
                BackendErrorKind::Status,
                Some(status.as_u16()),
                text,
            ));
        }
        response.text().await.map_err(BackendError::transport)
    }
}

impl VerificationBackend for BackendClient {
    fn name(&self) -> &'static str {
        match self.provider {
            Provider::DomainKeyed { .. } => BackendKind::AwsDemo.as_str(),
            Provider::Credentialed { .. } => BackendKind::Sst.as_str(),
        }
    }

    fn start(&self, image_width: u32, image_height: u32) -> BackendFuture<'_, ChallengeSession> {
        Box::pin(async move {
            let (url, body) = self.start_request(image_width, image_height)?;
            let text = self.post(url, &body).await?;
            let info: ChallengeInfo = serde_json::from_str(&text)
                .map_err(|e| BackendError::new(BackendErrorKind::Decode, None, format!("{e}: {text}")))?;
            Ok(info.into_session())
        })
    }

    fn submit_frame<'a>(
        &'a self,
        session: &'a ChallengeSession,
        jpeg: &'a [u8],
        timestamp_ms: i64,
    ) -> BackendFuture<'a, ()> {
        Box::pin(async move {
            let (url, body) = self.frame_request(session, jpeg, timestamp_ms)?;
            self.post(url, &body).await?;
            Ok(())
        })
    }

    fn verify<'a>(&'a self, session: &'a ChallengeSession) -> BackendFuture<'a, Verdict> {
        Box::pin(async move {
            let (url, body) = self.verify_request(session)?;
            let text = self.post(url, &body).await?;
            Ok(Verdict::from_body(&text))
        })
    }
}

fn parse_url(s: &str) -> Result<Url, BackendError> {
    Url::parse(s).map_err(|e| BackendError::new(BackendErrorKind::Url, None, format!("{s}: {e}")))
}

/// Append path segments to `base`, percent-encoding each one.
fn endpoint(base: &Url, segments: &[&str]) -> Result<Url, BackendError> {
    let mut url = base.clone();
    url.path_segments_mut()
        .map_err(|_| BackendError::new(BackendErrorKind::Url, None, base.to_string()))?
        .pop_if_empty()
        .extend(segments);
    Ok(url)
}
