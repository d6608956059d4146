use assay_core::{AssayError, AssayResult};
use assay_orchestrator::{Callback, CompletionNotifier, TaskRecord};
use async_trait::async_trait;
use hmac::{Hmac, Mac};
use sha2::Sha256;
use std::time::Duration;
use tracing::{info, warn};

type HmacSha256 = Hmac<Sha256>;

/// Header carrying `sha256=<hex hmac>` of the raw request body.
pub const SIGNATURE_HEADER: &str = "X-Signature";

/// Header carrying the task id, for receivers that route on it.
pub const TASK_ID_HEADER: &str = "X-Assay-Task-Id";

/// Compute the `X-Signature` value for a body: `sha256=` + hex HMAC-SHA256.
pub fn sign_payload(secret: &str, body: &[u8]) -> AssayResult<String> {
    let mut mac = HmacSha256::new_from_slice(secret.as_bytes())
        .map_err(|e| AssayError::Config(format!("invalid HMAC key: {e}")))?;
    mac.update(body);
    Ok(format!("sha256={}", hex::encode(mac.finalize().into_bytes())))
}

/// Check an `X-Signature` header value against a body in constant time.
pub fn verify_signature(secret: &str, body: &[u8], header: &str) -> bool {
    let Some(expected) = header
        .strip_prefix("sha256=")
        .and_then(|h| hex::decode(h).ok())
    else {
        return false;
    };
    let Ok(mut mac) = HmacSha256::new_from_slice(secret.as_bytes()) else {
        return false;
    };
    mac.update(body);
    mac.verify_slice(&expected).is_ok()
}

/// Delivers terminal task records to submitter callbacks.
///
/// One attempt per task. Failures are logged as `WebhookDeliveryFailed` and
/// never touch the stored record.
pub struct WebhookNotifier {
    http: reqwest::Client,
}

impl WebhookNotifier {
    pub fn new(timeout: Duration) -> AssayResult<Self> {
        let http = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| AssayError::Config(format!("HTTP client: {e}")))?;
        Ok(Self { http })
    }

    /// Deliver and report the outcome.
    pub async fn deliver(&self, record: &TaskRecord, callback: &Callback) -> AssayResult<()> {
        let body = serde_json::to_vec(record)?;
        let mut request = self
            .http
            .post(&callback.url)
            .header(reqwest::header::CONTENT_TYPE, "application/json")
            .header(TASK_ID_HEADER, record.task_id.to_string());
        if let Some(secret) = &callback.secret {
            request = request.header(SIGNATURE_HEADER, sign_payload(secret, &body)?);
        }

        let resp = request
            .body(body)
            .send()
            .await
            .map_err(|e| AssayError::WebhookDeliveryFailed(e.to_string()))?;
        let status = resp.status();
        if !status.is_success() {
            return Err(AssayError::WebhookDeliveryFailed(format!(
                "receiver answered {status}"
            )));
        }
        Ok(())
    }
}

#[async_trait]
impl CompletionNotifier for WebhookNotifier {
    async fn notify(&self, record: &TaskRecord, callback: &Callback) {
        match self.deliver(record, callback).await {
            Ok(()) => info!(
                task_id = %record.task_id,
                url = %callback.url,
                status = %record.status,
                "Completion webhook delivered"
            ),
            Err(e) => warn!(
                task_id = %record.task_id,
                url = %callback.url,
                error = %e,
                "Completion webhook not delivered"
            ),
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;

    #[test]
    fn test_sign_and_verify() {
        let body = br#"{"taskId":"abc"}"#;
        let sig = sign_payload("topsecret", body).unwrap();
        assert!(sig.starts_with("sha256="));
        assert_eq!(sig.len(), "sha256=".len() + 64);
        assert!(verify_signature("topsecret", body, &sig));
        assert!(!verify_signature("other", body, &sig));
        assert!(!verify_signature("topsecret", b"tampered", &sig));
    }

    #[test]
    fn test_known_vector() {
        // RFC 4231 test case 2
        let sig = sign_payload("Jefe", b"what do ya want for nothing?").unwrap();
        assert_eq!(
            sig,
            "sha256=5bdcc146bf60754e6a042426089575c75a003f089d2739839dec58b964ec3843"
        );
    }

    #[test]
    fn test_malformed_header_rejected() {
        assert!(!verify_signature("s", b"x", "md5=abcd"));
        assert!(!verify_signature("s", b"x", "sha256=not-hex"));
    }
}
