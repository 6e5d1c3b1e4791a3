//! Structured extraction of product, quantity, and specifications.
//!
//! The external service is advisory. Every failure becomes
//! [`Extraction::Degraded`] instead of an error, so a missing key or a
//! flaky endpoint never blocks request creation.

use std::collections::BTreeMap;
use std::sync::Arc;

use async_trait::async_trait;
use secrecy::{ExposeSecret, SecretString};
use serde::Deserialize;
use tracing::{debug, warn};

use crate::config::ExtractionConfig;
use crate::error::TransportError;
use crate::pipeline::types::{Extraction, ExtractionResult};

/// Confidence assumed when the service omits one.
const DEFAULT_CONFIDENCE: f64 = 0.5;

/// Characters of body text sent to the service.
const MAX_BODY_CHARS: usize = 8_000;

/// Turns free-text mail into a structured guess. Never fails.
#[async_trait]
pub trait Extractor: Send + Sync {
    async fn extract(&self, body_text: &str, subject: &str) -> Extraction;
}

/// Build the HTTP extractor when a key is configured, otherwise one that
/// always reports the missing key.
pub fn extractor_from_config(config: &ExtractionConfig) -> Arc<dyn Extractor> {
    match &config.api_key {
        Some(key) if !key.expose_secret().is_empty() => {
            match HttpExtractor::new(config, key.clone()) {
                Ok(extractor) => Arc::new(extractor),
                Err(e) => {
                    warn!("Extraction client unavailable: {e}");
                    Arc::new(DisabledExtractor::new(format!("client setup failed: {e}")))
                }
            }
        }
        _ => Arc::new(DisabledExtractor::new("no API key configured")),
    }
}

/// Extractor used when the service cannot be reached at all.
#[derive(Debug, Clone)]
pub struct DisabledExtractor {
    reason: String,
}

impl DisabledExtractor {
    pub fn new(reason: impl Into<String>) -> Self {
        Self {
            reason: reason.into(),
        }
    }
}

#[async_trait]
impl Extractor for DisabledExtractor {
    async fn extract(&self, _body_text: &str, _subject: &str) -> Extraction {
        Extraction::degraded(self.reason.clone())
    }
}

/// Client for an OpenAI-compatible `/chat/completions` endpoint.
pub struct HttpExtractor {
    client: reqwest::Client,
    api_base: String,
    api_key: SecretString,
    model: String,
}

impl std::fmt::Debug for HttpExtractor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HttpExtractor")
            .field("api_base", &self.api_base)
            .field("model", &self.model)
            .finish()
    }
}

impl HttpExtractor {
    pub fn new(config: &ExtractionConfig, api_key: SecretString) -> Result<Self, TransportError> {
        let client = reqwest::Client::builder()
            .timeout(config.timeout)
            .build()
            .map_err(|e| TransportError::Extraction(format!("HTTP client: {e}")))?;
        Ok(Self {
            client,
            api_base: config.api_base.trim_end_matches('/').to_string(),
            api_key,
            model: config.model.clone(),
        })
    }

    fn completions_url(&self) -> String {
        format!("{}/chat/completions", self.api_base)
    }

    async fn complete(&self, prompt: String) -> Result<String, TransportError> {
        let body = serde_json::json!({
            "model": self.model,
            "temperature": 0.1,
            "messages": [{ "role": "user", "content": prompt }],
        });

        let response = self
            .client
            .post(self.completions_url())
            .bearer_auth(self.api_key.expose_secret())
            .json(&body)
            .send()
            .await
            .map_err(|e| TransportError::Extraction(format!("request failed: {e}")))?;

        let status = response.status();
        if !status.is_success() {
            let text = response.text().await.unwrap_or_default();
            let snippet: String = text.chars().take(200).collect();
            return Err(TransportError::Extraction(format!("HTTP {status}: {snippet}")));
        }

        let completion: ChatCompletion = response
            .json()
            .await
            .map_err(|e| TransportError::Extraction(format!("invalid response body: {e}")))?;
        completion
            .choices
            .into_iter()
            .next()
            .and_then(|c| c.message.content)
            .ok_or_else(|| TransportError::Extraction("response had no content".into()))
    }
}

#[async_trait]
impl Extractor for HttpExtractor {
    async fn extract(&self, body_text: &str, subject: &str) -> Extraction {
        debug!(model = %self.model, "Requesting extraction");
        let content = match self.complete(build_prompt(body_text, subject)).await {
            Ok(content) => content,
            Err(e) => {
                warn!("Extraction degraded: {e}");
                return Extraction::degraded(e.to_string());
            }
        };
        match parse_extraction_response(&content) {
            Ok(result) => Extraction::Ok(result),
            Err(reason) => {
                warn!("Extraction degraded: {reason}");
                Extraction::degraded(reason)
            }
        }
    }
}

#[derive(Deserialize)]
struct ChatCompletion {
    #[serde(default)]
    choices: Vec<Choice>,
}

#[derive(Deserialize)]
struct Choice {
    message: ChoiceMessage,
}

#[derive(Deserialize)]
struct ChoiceMessage {
    content: Option<String>,
}

fn build_prompt(body_text: &str, subject: &str) -> String {
    let body: String = body_text.chars().take(MAX_BODY_CHARS).collect();
    format!(
        r#"Extract product information from this customer email.

Subject: {subject}

Body:
{body}

Respond with ONLY a JSON object with these fields:
- "productName": the product or service requested, or null
- "quantity": the number of units requested as an integer, or null
- "specifications": an object of specification names to values (may be empty)
- "confidence": a number between 0 and 1 for how sure you are"#
    )
}

/// Shape the service is asked for. Fields are loose on purpose: models
/// return numbers as strings and nulls in odd places.
#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct RawExtraction {
    #[serde(default)]
    product_name: Option<serde_json::Value>,
    #[serde(default)]
    quantity: Option<serde_json::Value>,
    #[serde(default)]
    specifications: Option<serde_json::Value>,
    #[serde(default)]
    confidence: Option<serde_json::Value>,
}

/// Parse the service's text reply into a validated result.
pub fn parse_extraction_response(content: &str) -> Result<ExtractionResult, String> {
    let json_str = extract_json_object(content);
    let raw: RawExtraction =
        serde_json::from_str(&json_str).map_err(|e| format!("JSON parse error: {e}"))?;

    let product_name = raw
        .product_name
        .as_ref()
        .and_then(value_as_text)
        .filter(|p| !p.is_empty());

    let quantity = raw.quantity.as_ref().and_then(value_as_quantity);

    let specifications = match raw.specifications {
        Some(serde_json::Value::Object(map)) => map
            .iter()
            .filter_map(|(k, v)| value_as_text(v).map(|v| (k.clone(), v)))
            .collect(),
        _ => BTreeMap::new(),
    };

    let confidence = raw
        .confidence
        .as_ref()
        .and_then(value_as_number)
        .filter(|c| c.is_finite())
        .unwrap_or(DEFAULT_CONFIDENCE)
        .clamp(0.0, 1.0);

    Ok(ExtractionResult {
        product_name,
        quantity,
        specifications,
        confidence,
        raw: json_str,
    })
}

fn value_as_text(value: &serde_json::Value) -> Option<String> {
    match value {
        serde_json::Value::String(s) => Some(s.trim().to_string()),
        serde_json::Value::Number(n) => Some(n.to_string()),
        serde_json::Value::Bool(b) => Some(b.to_string()),
        _ => None,
    }
}

fn value_as_number(value: &serde_json::Value) -> Option<f64> {
    match value {
        serde_json::Value::Number(n) => n.as_f64(),
        serde_json::Value::String(s) => s.trim().parse().ok(),
        _ => None,
    }
}

/// Non-negative whole numbers only; anything else is dropped.
fn value_as_quantity(value: &serde_json::Value) -> Option<u64> {
    let n = value_as_number(value)?;
    if n.is_finite() && n >= 0.0 && n.fract() == 0.0 && n <= u64::MAX as f64 {
        Some(n as u64)
    } else {
        None
    }
}

/// Extract a JSON object from text that may be wrapped in markdown code blocks.
fn extract_json_object(text: &str) -> String {
    let trimmed = text.trim();

    if trimmed.starts_with('{') {
        return trimmed.to_string();
    }

    if let Some(start) = trimmed.find("```json") {
        let after = &trimmed[start + 7..];
        if let Some(end) = after.find("```") {
            return after[..end].trim().to_string();
        }
    }

    if let Some(start) = trimmed.find("```") {
        let after = &trimmed[start + 3..];
        if let Some(end) = after.find("```") {
            return after[..end].trim().to_string();
        }
    }

    if let (Some(start), Some(end)) = (trimmed.find('{'), trimmed.rfind('}'))
        && start < end
    {
        return trimmed[start..=end].to_string();
    }

    trimmed.to_string()
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use wiremock::matchers::{body_partial_json, header, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    use super::*;

    fn config(api_base: &str) -> ExtractionConfig {
        ExtractionConfig {
            api_key: Some(SecretString::from("test-key")),
            api_base: api_base.to_string(),
            model: "gemini-1.5-flash".into(),
            timeout: Duration::from_secs(5),
        }
    }

    fn completion(content: &str) -> serde_json::Value {
        serde_json::json!({
            "id": "chatcmpl-1",
            "choices": [{
                "index": 0,
                "message": { "role": "assistant", "content": content },
                "finish_reason": "stop"
            }]
        })
    }

    // ── Response parsing ────────────────────────────────────────────

    #[test]
    fn parses_plain_json() {
        let result = parse_extraction_response(
            r#"{"productName": "Dell R750", "quantity": 5, "specifications": {"ram": "64GB", "cpu": 2}, "confidence": 0.92}"#,
        )
        .unwrap();
        assert_eq!(result.product_name.as_deref(), Some("Dell R750"));
        assert_eq!(result.quantity, Some(5));
        assert_eq!(result.specifications.get("cpu").map(String::as_str), Some("2"));
        assert!((result.confidence - 0.92).abs() < 1e-9);
    }

    #[test]
    fn parses_fenced_json() {
        let result =
            parse_extraction_response("Sure!\n```json\n{\"productName\": \"Laptop\"}\n```").unwrap();
        assert_eq!(result.product_name.as_deref(), Some("Laptop"));
        assert_eq!(result.confidence, DEFAULT_CONFIDENCE);
    }

    #[test]
    fn confidence_is_clamped() {
        let high = parse_extraction_response(r#"{"confidence": 7}"#).unwrap();
        assert_eq!(high.confidence, 1.0);
        let low = parse_extraction_response(r#"{"confidence": -0.3}"#).unwrap();
        assert_eq!(low.confidence, 0.0);
    }

    #[test]
    fn invalid_quantities_are_dropped() {
        for q in ["-4", "2.5", "\"many\"", "null"] {
            let result =
                parse_extraction_response(&format!(r#"{{"quantity": {q}}}"#)).unwrap();
            assert_eq!(result.quantity, None, "quantity {q}");
        }
        let result = parse_extraction_response(r#"{"quantity": "12"}"#).unwrap();
        assert_eq!(result.quantity, Some(12));
    }

    #[test]
    fn non_json_is_an_error() {
        assert!(parse_extraction_response("I cannot help with that").is_err());
    }

    // ── HTTP extractor ──────────────────────────────────────────────

    #[tokio::test]
    async fn disabled_extractor_degrades() {
        let extractor = extractor_from_config(&ExtractionConfig {
            api_key: None,
            ..config("http://unused")
        });
        let extraction = extractor.extract("body", "subject").await;
        assert_eq!(extraction, Extraction::degraded("no API key configured"));
    }

    #[tokio::test]
    async fn http_extractor_success() {
        let mock_server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/chat/completions"))
            .and(header("Authorization", "Bearer test-key"))
            .and(body_partial_json(serde_json::json!({ "model": "gemini-1.5-flash" })))
            .respond_with(ResponseTemplate::new(200).set_body_json(completion(
                r#"{"productName": "Server", "quantity": 5, "specifications": {}, "confidence": 0.8}"#,
            )))
            .expect(1)
            .mount(&mock_server)
            .await;

        let extractor = extractor_from_config(&config(&mock_server.uri()));
        let extraction = extractor.extract("Need 5 servers", "Quote").await;

        assert_eq!(extraction.product_name(), Some("Server"));
        assert_eq!(extraction.quantity(), Some(5));
        assert!((extraction.confidence() - 0.8).abs() < 1e-9);
    }

    #[tokio::test]
    async fn http_error_degrades() {
        let mock_server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/chat/completions"))
            .respond_with(ResponseTemplate::new(500).set_body_string("boom"))
            .mount(&mock_server)
            .await;

        let extractor = extractor_from_config(&config(&mock_server.uri()));
        let extraction = extractor.extract("body", "subject").await;

        let Extraction::Degraded { reason } = extraction else {
            panic!("expected degraded extraction");
        };
        assert!(reason.contains("500"));
    }

    #[tokio::test]
    async fn unparseable_reply_degrades() {
        let mock_server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/chat/completions"))
            .respond_with(ResponseTemplate::new(200).set_body_json(completion("no idea")))
            .mount(&mock_server)
            .await;

        let extractor = extractor_from_config(&config(&mock_server.uri()));
        assert!(extractor.extract("body", "subject").await.is_degraded());
    }
}
