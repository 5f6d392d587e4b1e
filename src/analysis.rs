//! Client for the text analysis service.
//!
//! Sends extracted document text to an OpenAI-compatible chat completions
//! endpoint and asks for a strict JSON object with title, subject,
//! summary, keywords, entities, and the document's own date. The response
//! is parsed leniently through [`AnalysisRecord::from_json`] so a
//! half-malformed reply still yields its usable fields.

use anyhow::{bail, Result};
use std::time::Duration;

use crate::config::AnalysisConfig;
use crate::models::AnalysisRecord;

const SYSTEM_PROMPT: &str = "You are a legal document analyst. Given the text of an official \
legal document, reply with a single JSON object and nothing else, with these keys: \
\"title\" (official designation of the act or decision), \"subject\" (one-line matter \
description), \"summary\" (3-5 sentence summary), \"keywords\" (array of at most 5 terms), \
\"entities\" (array of institutions and parties mentioned), \"date\" (the date the document \
was issued, DD/MM/YYYY), \"language\" (ISO 639-1 code of the text). Use null for anything \
you cannot determine.";

pub struct TextAnalysisClient {
    config: AnalysisConfig,
    api_key: String,
    client: reqwest::Client,
}

impl TextAnalysisClient {
    /// Requires `OPENAI_API_KEY`; a missing key is a configuration error
    /// reported before any document is touched.
    pub fn new(config: &AnalysisConfig) -> Result<Self> {
        let api_key = std::env::var("OPENAI_API_KEY")
            .map_err(|_| anyhow::anyhow!("OPENAI_API_KEY environment variable not set"))?;
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.timeout_secs))
            .build()?;
        Ok(Self {
            config: config.clone(),
            api_key,
            client,
        })
    }

    /// Analyze one language variant of a document. The text is truncated
    /// to the configured excerpt length before sending.
    pub async fn analyze(&self, text: &str) -> Result<AnalysisRecord> {
        let excerpt: String = text.chars().take(self.config.excerpt_chars).collect();
        let body = serde_json::json!({
            "model": self.config.model,
            "response_format": {"type": "json_object"},
            "messages": [
                {"role": "system", "content": SYSTEM_PROMPT},
                {"role": "user", "content": excerpt},
            ],
        });

        let url = format!(
            "{}/chat/completions",
            self.config.api_base.trim_end_matches('/')
        );
        let mut last_err = None;

        for attempt in 0..=self.config.max_retries {
            if attempt > 0 {
                let delay = Duration::from_secs(1 << (attempt - 1).min(5));
                tokio::time::sleep(delay).await;
            }

            let resp = self
                .client
                .post(&url)
                .header("Authorization", format!("Bearer {}", self.api_key))
                .header("Content-Type", "application/json")
                .json(&body)
                .send()
                .await;

            match resp {
                Ok(response) => {
                    let status = response.status();

                    if status.is_success() {
                        let json: serde_json::Value = response.json().await?;
                        return Ok(parse_completion(&json));
                    }

                    if status.as_u16() == 429 || status.is_server_error() {
                        let body_text = response.text().await.unwrap_or_default();
                        last_err = Some(anyhow::anyhow!(
                            "Analysis API error {}: {}",
                            status,
                            body_text
                        ));
                        continue;
                    }

                    let body_text = response.text().await.unwrap_or_default();
                    bail!("Analysis API error {}: {}", status, body_text);
                }
                Err(e) => {
                    last_err = Some(e.into());
                    continue;
                }
            }
        }

        Err(last_err.unwrap_or_else(|| anyhow::anyhow!("Analysis failed after retries")))
    }
}

/// Pull the first choice's message content out of a chat completions
/// response and parse it as an [`AnalysisRecord`]. A missing or
/// non-string content field parses as an empty record.
fn parse_completion(json: &serde_json::Value) -> AnalysisRecord {
    let content = json
        .get("choices")
        .and_then(|c| c.as_array())
        .and_then(|c| c.first())
        .and_then(|c| c.get("message"))
        .and_then(|m| m.get("content"))
        .and_then(|c| c.as_str())
        .unwrap_or("");
    AnalysisRecord::from_json(content)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_completion_extracts_fields() {
        let resp = serde_json::json!({
            "choices": [{
                "message": {
                    "content": "{\"title\":\"Order 24-07\",\"summary\":\"Appoints members.\",\"keywords\":[\"appointment\"],\"date\":\"02/01/2024\"}"
                }
            }]
        });
        let rec = parse_completion(&resp);
        assert_eq!(rec.title.as_deref(), Some("Order 24-07"));
        assert_eq!(rec.date.as_deref(), Some("2024-01-02"));
    }

    #[test]
    fn parse_completion_tolerates_missing_content() {
        let rec = parse_completion(&serde_json::json!({"choices": []}));
        assert!(rec.is_empty());
    }
}
