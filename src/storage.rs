//! Object storage for harvested files and extracted text.
//!
//! Talks to any S3-compatible store through the REST API with AWS
//! Signature V4 authentication, using only pure-Rust crypto (`hmac`,
//! `sha2`). Supports header-signed PUT/GET/DELETE plus query-string
//! presigned GET URLs, and buckets fronted by a public base URL.
//!
//! # Environment Variables
//!
//! Credentials are read from environment variables:
//! - `AWS_ACCESS_KEY_ID` — required for signed access
//! - `AWS_SECRET_ACCESS_KEY` — required for signed access
//! - `AWS_SESSION_TOKEN` — optional (temporary credentials)
//!
//! A store configured with `public_base_url` and no credentials can still
//! resolve and probe objects; uploads then fail with a credential error.

use std::collections::HashMap;
use std::sync::Mutex;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use async_trait::async_trait;
use chrono::Utc;
use hmac::{Hmac, Mac};
use sha2::{Digest, Sha256};

use crate::config::StorageConfig;

type HmacSha256 = Hmac<Sha256>;

/// AWS credentials loaded from environment variables.
#[derive(Clone)]
struct AwsCredentials {
    access_key_id: String,
    secret_access_key: String,
    session_token: Option<String>,
}

impl AwsCredentials {
    fn from_env() -> Result<Self> {
        let access_key_id = std::env::var("AWS_ACCESS_KEY_ID")
            .context("AWS_ACCESS_KEY_ID environment variable not set")?;
        let secret_access_key = std::env::var("AWS_SECRET_ACCESS_KEY")
            .context("AWS_SECRET_ACCESS_KEY environment variable not set")?;
        let session_token = std::env::var("AWS_SESSION_TOKEN").ok();

        Ok(Self {
            access_key_id,
            secret_access_key,
            session_token,
        })
    }
}

/// Handle to the configured bucket. Cheap to clone config-wise but the
/// pipeline shares a single instance behind an `Arc`.
pub struct ObjectStore {
    config: StorageConfig,
    creds: Option<AwsCredentials>,
    client: reqwest::Client,
}

impl ObjectStore {
    /// Build a store from config. Missing credentials are tolerated when a
    /// public base URL is configured, since reads can go through it.
    pub fn from_config(config: &StorageConfig) -> Result<ObjectStore> {
        let creds = match AwsCredentials::from_env() {
            Ok(c) => Some(c),
            Err(e) => {
                if config.public_base_url.is_none() {
                    return Err(e);
                }
                None
            }
        };
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.probe_timeout_secs.max(10)))
            .build()
            .context("Failed to build storage HTTP client")?;
        Ok(ObjectStore {
            config: config.clone(),
            creds,
            client,
        })
    }

    fn host(&self) -> String {
        if let Some(ref endpoint) = self.config.endpoint_url {
            endpoint
                .trim_start_matches("https://")
                .trim_start_matches("http://")
                .trim_end_matches('/')
                .to_string()
        } else {
            format!(
                "{}.s3.{}.amazonaws.com",
                self.config.bucket, self.config.region
            )
        }
    }

    /// Strip any accidental scheme/host wrapping and apply the configured
    /// prefix. Stored paths are keys, but older rows may hold full URLs.
    pub fn normalize_key(&self, raw: &str) -> String {
        let mut key = raw.trim();
        for scheme in ["https://", "http://"] {
            if let Some(rest) = key.strip_prefix(scheme) {
                key = rest.split_once('/').map(|(_, k)| k).unwrap_or("");
            }
        }
        let key = key.trim_start_matches('/');
        let prefix = self.config.prefix.trim_matches('/');
        if prefix.is_empty() || key.starts_with(&format!("{prefix}/")) {
            key.to_string()
        } else {
            format!("{prefix}/{key}")
        }
    }

    /// Public URL for a key, when the bucket is fronted by one.
    pub fn public_url(&self, path: &str) -> Option<String> {
        let base = self.config.public_base_url.as_deref()?;
        let key = self.normalize_key(path);
        if key.is_empty() {
            return None;
        }
        Some(format!("{}/{}", base.trim_end_matches('/'), key))
    }

    /// Query-string presigned GET URL, valid for the configured TTL.
    /// Returns `None` for empty paths or when no credentials are loaded.
    pub fn presigned_url(&self, path: &str) -> Option<String> {
        let key = self.normalize_key(path);
        if key.is_empty() {
            return None;
        }
        let creds = self.creds.as_ref()?;

        let host = self.host();
        let encoded_key = key
            .split('/')
            .map(uri_encode)
            .collect::<Vec<_>>()
            .join("/");
        let now = Utc::now();
        let date_stamp = now.format("%Y%m%d").to_string();
        let amz_date = now.format("%Y%m%dT%H%M%SZ").to_string();
        let credential_scope = format!("{}/{}/s3/aws4_request", date_stamp, self.config.region);
        let credential = format!("{}/{}", creds.access_key_id, credential_scope);

        let mut query_params = vec![
            ("X-Amz-Algorithm".to_string(), "AWS4-HMAC-SHA256".to_string()),
            ("X-Amz-Credential".to_string(), credential),
            ("X-Amz-Date".to_string(), amz_date.clone()),
            (
                "X-Amz-Expires".to_string(),
                self.config.presign_ttl_secs.to_string(),
            ),
            ("X-Amz-SignedHeaders".to_string(), "host".to_string()),
        ];
        if let Some(ref token) = creds.session_token {
            query_params.push(("X-Amz-Security-Token".to_string(), token.clone()));
        }
        query_params.sort_by(|a, b| a.0.cmp(&b.0));

        let canonical_querystring: String = query_params
            .iter()
            .map(|(k, v)| format!("{}={}", uri_encode(k), uri_encode(v)))
            .collect::<Vec<_>>()
            .join("&");

        let canonical_request = format!(
            "GET\n/{}\n{}\nhost:{}\n\nhost\nUNSIGNED-PAYLOAD",
            encoded_key, canonical_querystring, host
        );
        let string_to_sign = format!(
            "AWS4-HMAC-SHA256\n{}\n{}\n{}",
            amz_date,
            credential_scope,
            hex_sha256(canonical_request.as_bytes())
        );
        let signing_key = derive_signing_key(
            &creds.secret_access_key,
            &date_stamp,
            &self.config.region,
            "s3",
        );
        let signature = hex_hmac_sha256(&signing_key, string_to_sign.as_bytes());

        Some(format!(
            "https://{}/{}?{}&X-Amz-Signature={}",
            host, encoded_key, canonical_querystring, signature
        ))
    }

    /// Any URL under which the object can be fetched: presigned first,
    /// then the public base. `None` means the object has no address at
    /// all and must be treated as missing without touching the network.
    pub fn access_url(&self, path: &str) -> Option<String> {
        self.presigned_url(path).or_else(|| self.public_url(path))
    }

    fn signed_request(
        &self,
        method: &str,
        key: &str,
        payload: &[u8],
        content_type: Option<&str>,
    ) -> Result<reqwest::RequestBuilder> {
        let Some(ref creds) = self.creds else {
            bail!("storage credentials not available for signed {method} request");
        };
        let host = self.host();
        let encoded_key = key
            .split('/')
            .map(uri_encode)
            .collect::<Vec<_>>()
            .join("/");
        let url = format!("https://{}/{}", host, encoded_key);

        let now = Utc::now();
        let date_stamp = now.format("%Y%m%d").to_string();
        let amz_date = now.format("%Y%m%dT%H%M%SZ").to_string();
        let payload_hash = hex_sha256(payload);

        let mut headers = vec![
            ("host".to_string(), host.clone()),
            ("x-amz-content-sha256".to_string(), payload_hash.clone()),
            ("x-amz-date".to_string(), amz_date.clone()),
        ];
        if let Some(ct) = content_type {
            headers.push(("content-type".to_string(), ct.to_string()));
        }
        if let Some(ref token) = creds.session_token {
            headers.push(("x-amz-security-token".to_string(), token.clone()));
        }
        headers.sort_by(|a, b| a.0.cmp(&b.0));

        let signed_headers: String = headers
            .iter()
            .map(|(k, _)| k.as_str())
            .collect::<Vec<_>>()
            .join(";");
        let canonical_headers: String =
            headers.iter().map(|(k, v)| format!("{}:{}\n", k, v)).collect();

        let canonical_request = format!(
            "{}\n/{}\n\n{}\n{}\n{}",
            method, encoded_key, canonical_headers, signed_headers, payload_hash
        );
        let credential_scope = format!("{}/{}/s3/aws4_request", date_stamp, self.config.region);
        let string_to_sign = format!(
            "AWS4-HMAC-SHA256\n{}\n{}\n{}",
            amz_date,
            credential_scope,
            hex_sha256(canonical_request.as_bytes())
        );
        let signing_key = derive_signing_key(
            &creds.secret_access_key,
            &date_stamp,
            &self.config.region,
            "s3",
        );
        let signature = hex_hmac_sha256(&signing_key, string_to_sign.as_bytes());
        let authorization = format!(
            "AWS4-HMAC-SHA256 Credential={}/{}, SignedHeaders={}, Signature={}",
            creds.access_key_id, credential_scope, signed_headers, signature
        );

        let mut builder = match method {
            "PUT" => self.client.put(&url),
            "DELETE" => self.client.delete(&url),
            _ => self.client.get(&url),
        };
        builder = builder
            .header("Authorization", &authorization)
            .header("x-amz-content-sha256", &payload_hash)
            .header("x-amz-date", &amz_date);
        if let Some(ct) = content_type {
            builder = builder.header("Content-Type", ct);
        }
        if let Some(ref token) = creds.session_token {
            builder = builder.header("x-amz-security-token", token);
        }
        Ok(builder)
    }

    /// Upload bytes under `key` and return the normalized key that was
    /// written, suitable for storing in the database.
    pub async fn upload(&self, key: &str, bytes: &[u8], content_type: &str) -> Result<String> {
        let key = self.normalize_key(key);
        let resp = self
            .signed_request("PUT", &key, bytes, Some(content_type))?
            .body(bytes.to_vec())
            .send()
            .await
            .with_context(|| format!("Failed to upload object '{key}'"))?;
        if !resp.status().is_success() {
            let status = resp.status();
            let body = resp.text().await.unwrap_or_default();
            bail!(
                "Object upload failed (HTTP {}) for key '{}': {}",
                status,
                key,
                body.chars().take(300).collect::<String>()
            );
        }
        Ok(key)
    }

    /// Delete an object. Returns `Ok(false)` when the path was empty.
    pub async fn delete(&self, path: &str) -> Result<bool> {
        let key = self.normalize_key(path);
        if key.is_empty() {
            return Ok(false);
        }
        let resp = self
            .signed_request("DELETE", &key, b"", None)?
            .send()
            .await
            .with_context(|| format!("Failed to delete object '{key}'"))?;
        // S3 returns 204 for deletes, including of absent keys.
        if !resp.status().is_success() && resp.status().as_u16() != 404 {
            bail!("Object delete failed (HTTP {}) for key '{}'", resp.status(), key);
        }
        Ok(true)
    }

    /// Fetch an object's bytes, or `None` when it cannot be resolved or
    /// retrieved. Read errors are swallowed because callers treat a
    /// missing body the same as a missing object.
    pub async fn fetch_bytes(&self, path: &str) -> Option<Vec<u8>> {
        let url = self.access_url(path)?;
        let resp = self.client.get(&url).send().await.ok()?;
        if !resp.status().is_success() {
            return None;
        }
        resp.bytes().await.ok().map(|b| b.to_vec())
    }

    /// Fetch an object as UTF-8 text, lossily decoded.
    pub async fn fetch_text(&self, path: &str) -> Option<String> {
        let bytes = self.fetch_bytes(path).await?;
        Some(String::from_utf8_lossy(&bytes).to_string())
    }
}

/// Answers "does this stored artifact exist right now". Abstracted so the
/// batch validator and reconciler can run against a fake in tests.
#[async_trait]
pub trait ExistenceProbe: Send + Sync {
    async fn object_exists(&self, path: &str) -> bool;
}

#[async_trait]
impl ExistenceProbe for ObjectStore {
    /// Probe with a bounded HEAD request. A 403 can mean the URL allows
    /// GET but not HEAD, so it falls back to a GET whose body is never
    /// read. Every failure mode answers `false`: treating an unknown
    /// artifact as present would let reconciliation mark unfinished work
    /// as done.
    async fn object_exists(&self, path: &str) -> bool {
        let Some(url) = self.access_url(path) else {
            return false;
        };
        let timeout = Duration::from_secs(self.config.probe_timeout_secs);
        let head = self.client.head(&url).timeout(timeout).send().await;
        match head {
            Ok(resp) if resp.status().is_success() => true,
            Ok(resp) if resp.status().as_u16() == 403 => {
                match self.client.get(&url).timeout(timeout).send().await {
                    Ok(get_resp) => get_resp.status().is_success(),
                    Err(_) => false,
                }
            }
            _ => false,
        }
    }
}

/// Memoized existence answers for one top-level operation.
///
/// A single batch or reconciliation pass may ask about the same artifact
/// several times; within that window a repeated probe must return the
/// same answer, so results are cached until `clear` is called at the
/// start of the next operation.
pub struct ExistenceOracle<'a> {
    probe: &'a dyn ExistenceProbe,
    cache: Mutex<HashMap<String, bool>>,
}

impl<'a> ExistenceOracle<'a> {
    pub fn new(probe: &'a dyn ExistenceProbe) -> Self {
        ExistenceOracle {
            probe,
            cache: Mutex::new(HashMap::new()),
        }
    }

    /// Cached existence check. Empty or missing paths are `false` without
    /// touching the network.
    pub async fn exists(&self, path: Option<&str>) -> bool {
        let Some(path) = path else { return false };
        let path = path.trim();
        if path.is_empty() {
            return false;
        }
        if let Some(&hit) = self.cache.lock().unwrap_or_else(|e| e.into_inner()).get(path) {
            return hit;
        }
        let answer = self.probe.object_exists(path).await;
        self.cache
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .insert(path.to_string(), answer);
        answer
    }

    pub fn clear(&self) {
        self.cache.lock().unwrap_or_else(|e| e.into_inner()).clear();
    }
}

// ============ AWS SigV4 Helpers ============

fn hex_sha256(data: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(data);
    hex::encode(hasher.finalize())
}

fn hmac_sha256(key: &[u8], data: &[u8]) -> Vec<u8> {
    let mut mac = HmacSha256::new_from_slice(key).expect("HMAC can take key of any size");
    mac.update(data);
    mac.finalize().into_bytes().to_vec()
}

fn hex_hmac_sha256(key: &[u8], data: &[u8]) -> String {
    hex::encode(hmac_sha256(key, data))
}

/// Derive the AWS SigV4 signing key for a given date, region, and service.
///
/// ```text
/// kDate    = HMAC("AWS4" + secret, dateStamp)
/// kRegion  = HMAC(kDate, region)
/// kService = HMAC(kRegion, service)
/// kSigning = HMAC(kService, "aws4_request")
/// ```
fn derive_signing_key(secret_key: &str, date_stamp: &str, region: &str, service: &str) -> Vec<u8> {
    let k_date = hmac_sha256(
        format!("AWS4{}", secret_key).as_bytes(),
        date_stamp.as_bytes(),
    );
    let k_region = hmac_sha256(&k_date, region.as_bytes());
    let k_service = hmac_sha256(&k_region, service.as_bytes());
    hmac_sha256(&k_service, b"aws4_request")
}

/// URI-encode a string per RFC 3986 (used in SigV4 canonical requests).
fn uri_encode(s: &str) -> String {
    let mut result = String::new();
    for byte in s.bytes() {
        match byte {
            b'A'..=b'Z' | b'a'..=b'z' | b'0'..=b'9' | b'-' | b'_' | b'.' | b'~' => {
                result.push(byte as char);
            }
            _ => {
                result.push_str(&format!("%{:02X}", byte));
            }
        }
    }
    result
}
