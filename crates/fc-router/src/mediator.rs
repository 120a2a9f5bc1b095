//! Mediation - the side effect performed for one message.
//!
//! The initial variant is an HTTP POST to the pointer's target. A mediator
//! never returns an error across the boundary: every failure mode collapses
//! to a [`MediationOutcome`] variant, and the pool worker turns that into an
//! ack or nack. Retries are owned by the broker redelivery cycle, not by the
//! mediator.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use hmac::{Hmac, Mac};
use reqwest::Client;
use sha2::Sha256;
use tracing::{debug, info, warn};

use fc_common::{MediationOutcome, MediationType, MessagePointer};

pub const MESSAGE_ID_HEADER: &str = "X-FlowCatalyst-Message-Id";
pub const POOL_HEADER: &str = "X-FlowCatalyst-Pool";
pub const SIGNATURE_HEADER: &str = "X-FlowCatalyst-Signature";
pub const TIMESTAMP_HEADER: &str = "X-FlowCatalyst-Timestamp";

type HmacSha256 = Hmac<Sha256>;

#[async_trait]
pub trait Mediator: Send + Sync {
    async fn mediate(&self, message: &MessagePointer) -> MediationOutcome;
}

/// HMAC-SHA256 over timestamp + body, hex encoded. The timestamp rides along
/// in its own header so the receiver can reconstruct the signed payload.
fn sign_payload(body: &str, signing_secret: &str) -> (String, String) {
    let timestamp = Utc::now().format("%Y-%m-%dT%H:%M:%S%.3fZ").to_string();
    let signature_payload = format!("{timestamp}{body}");

    let mut mac = HmacSha256::new_from_slice(signing_secret.as_bytes())
        .expect("HMAC accepts keys of any size");
    mac.update(signature_payload.as_bytes());
    let signature = hex::encode(mac.finalize().into_bytes());

    (signature, timestamp)
}

#[derive(Debug, Clone)]
pub struct HttpMediatorConfig {
    pub timeout: Duration,
    pub connect_timeout: Duration,
    /// When set, requests carry signature and timestamp headers.
    pub signing_secret: Option<String>,
}

impl Default for HttpMediatorConfig {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(30),
            connect_timeout: Duration::from_secs(10),
            signing_secret: None,
        }
    }
}

/// HTTP mediator: POST to the mediation target with identity headers and an
/// empty JSON body, classify the response.
pub struct HttpMediator {
    client: Client,
    config: HttpMediatorConfig,
}

impl HttpMediator {
    pub fn new() -> crate::Result<Self> {
        Self::with_config(HttpMediatorConfig::default())
    }

    pub fn with_config(config: HttpMediatorConfig) -> crate::Result<Self> {
        let client = Client::builder()
            .timeout(config.timeout)
            .connect_timeout(config.connect_timeout)
            .pool_max_idle_per_host(10)
            .build()?;

        info!(
            timeout_secs = config.timeout.as_secs(),
            signing = config.signing_secret.is_some(),
            "HttpMediator initialized"
        );

        Ok(Self { client, config })
    }
}

#[async_trait]
impl Mediator for HttpMediator {
    async fn mediate(&self, message: &MessagePointer) -> MediationOutcome {
        let body = String::new();

        let mut request = self
            .client
            .post(&message.mediation_target)
            .header("Content-Type", "application/json")
            .header(MESSAGE_ID_HEADER, &message.id)
            .header(POOL_HEADER, &message.pool_code);

        if let Some(ref secret) = self.config.signing_secret {
            let (signature, timestamp) = sign_payload(&body, secret);
            request = request
                .header(SIGNATURE_HEADER, signature)
                .header(TIMESTAMP_HEADER, timestamp);
        }

        if let Some(ref token) = message.auth_token {
            request = request.bearer_auth(token);
        }

        let response = match request.body(body).send().await {
            Ok(response) => response,
            Err(e) if e.is_timeout() => {
                warn!(
                    message_id = %message.id,
                    target = %message.mediation_target,
                    "Mediation request timed out"
                );
                return MediationOutcome::timeout(format!("request timeout: {e}"));
            }
            Err(e) => {
                warn!(
                    message_id = %message.id,
                    target = %message.mediation_target,
                    error = %e,
                    "Mediation request failed"
                );
                return MediationOutcome::server_error(None, format!("request failed: {e}"));
            }
        };

        let status = response.status();
        let status_code = status.as_u16();

        if status.is_success() {
            // The response body is opaque, but an unreadable one means the
            // exchange cannot be trusted.
            if let Err(e) = response.bytes().await {
                return MediationOutcome::invalid(format!("unreadable response body: {e}"));
            }
            debug!(
                message_id = %message.id,
                status_code = status_code,
                "Message delivered"
            );
            return MediationOutcome::success(status_code);
        }

        match status_code {
            429 => {
                let retry_after = response
                    .headers()
                    .get("Retry-After")
                    .and_then(|v| v.to_str().ok())
                    .and_then(|s| s.parse::<u32>().ok());
                warn!(
                    message_id = %message.id,
                    retry_after = ?retry_after,
                    "Target rate limited the request"
                );
                MediationOutcome::rate_limited(retry_after)
            }
            408 | 425 => MediationOutcome::server_error(
                Some(status_code),
                format!("HTTP {status_code}: retryable client-side condition"),
            ),
            code if status.is_server_error() => {
                warn!(
                    message_id = %message.id,
                    status_code = code,
                    "Server error from mediation target"
                );
                MediationOutcome::server_error(Some(code), format!("HTTP {code}: server error"))
            }
            code if status.is_client_error() => {
                warn!(
                    message_id = %message.id,
                    status_code = code,
                    "Permanent client error from mediation target"
                );
                MediationOutcome::client_error(code, format!("HTTP {code}: client error"))
            }
            code => MediationOutcome::invalid(format!("HTTP {code}: unclassifiable status")),
        }
    }
}

/// Tagged dispatch over mediation variants. Adding a transport means
/// implementing [`Mediator`] and registering it for its type.
pub struct MediatorRegistry {
    mediators: HashMap<MediationType, Arc<dyn Mediator>>,
}

impl MediatorRegistry {
    pub fn new() -> Self {
        Self {
            mediators: HashMap::new(),
        }
    }

    /// Registry with the default HTTP mediator.
    pub fn with_http(config: HttpMediatorConfig) -> crate::Result<Self> {
        let mut registry = Self::new();
        registry.register(MediationType::Http, Arc::new(HttpMediator::with_config(config)?));
        Ok(registry)
    }

    pub fn register(&mut self, mediation_type: MediationType, mediator: Arc<dyn Mediator>) {
        self.mediators.insert(mediation_type, mediator);
    }
}

#[async_trait]
impl Mediator for MediatorRegistry {
    async fn mediate(&self, message: &MessagePointer) -> MediationOutcome {
        match self.mediators.get(&message.mediation_type) {
            Some(mediator) => mediator.mediate(message).await,
            None => MediationOutcome::invalid(format!(
                "no mediator registered for {:?}",
                message.mediation_type
            )),
        }
    }
}

impl Default for MediatorRegistry {
    fn default() -> Self {
        Self::new()
    }
}
