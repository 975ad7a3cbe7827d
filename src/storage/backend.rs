//! Persistence collaborator.
//!
//! The backend is a functions-style HTTP API: named mutations, queries and
//! actions are invoked with `POST {base}/api/{kind}` and a JSON body of
//! `{path, args, format: "json"}`. Binary media goes through short-lived
//! upload URLs handed out by the backend.

use async_trait::async_trait;
use reqwest::Client;
use serde_json::{json, Value};
use std::time::Duration;
use tracing::debug;

use crate::error::PersistError;
use crate::utils::preview;

use super::persist::{CoursePayload, ModuleRecord};

const FUNCTION_TIMEOUT_SECS: u64 = 20;
const UPLOAD_TIMEOUT_SECS: u64 = 120;

/// Operations the pipeline needs from the course store.
#[async_trait]
pub trait PersistenceBackend: Send + Sync {
    /// Create a course document and return its id.
    async fn create_course(&self, payload: &CoursePayload) -> Result<String, PersistError>;

    async fn upsert_module(&self, record: &ModuleRecord) -> Result<(), PersistError>;

    async fn finalize_course(&self, course_id: &str, module_ids: &[String]) -> Result<(), PersistError>;

    /// A one-shot URL that accepts a single file body.
    async fn generate_upload_url(&self) -> Result<String, PersistError>;

    /// Upload `bytes` and return the storage id.
    async fn put_bytes(
        &self,
        upload_url: &str,
        bytes: Vec<u8>,
        content_type: &str,
    ) -> Result<String, PersistError>;

    /// Public URL of a stored file, if it still exists.
    async fn get_url(&self, storage_id: &str) -> Result<Option<String>, PersistError>;

    async fn update_progress(&self, course_id: &str, status: &str, percent: u8) -> Result<(), PersistError>;
}

/// HTTP client for the functions API.
pub struct HttpPersistenceBackend {
    client: Client,
    base_url: String,
    deploy_key: Option<String>,
    user_bearer: Option<String>,
}

impl std::fmt::Debug for HttpPersistenceBackend {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HttpPersistenceBackend")
            .field("base_url", &self.base_url)
            .field("deploy_key", &self.deploy_key.as_ref().map(|_| "<redacted>"))
            .field("user_bearer", &self.user_bearer.as_ref().map(|_| "<redacted>"))
            .finish()
    }
}

impl HttpPersistenceBackend {
    /// Create a client for the deployment at `base_url`.
    pub fn new(
        base_url: impl Into<String>,
        deploy_key: Option<String>,
        user_bearer: Option<String>,
    ) -> Result<Self, PersistError> {
        let base_url = base_url.into().trim_end_matches('/').to_string();
        if base_url.is_empty() {
            return Err(PersistError::NotConfigured);
        }

        let client = Client::builder()
            .timeout(Duration::from_secs(FUNCTION_TIMEOUT_SECS))
            .build()
            .map_err(|e| PersistError::RequestFailed(format!("Failed to build HTTP client: {e}")))?;

        Ok(Self {
            client,
            base_url,
            deploy_key: deploy_key.filter(|k| !k.is_empty()),
            user_bearer: user_bearer.filter(|t| !t.is_empty()),
        })
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    /// `Authorization` header value.
    ///
    /// Admin calls use the deploy key; others prefer the user token and fall
    /// back to the deploy key.
    fn authorization(&self, admin: bool) -> Option<String> {
        let deploy = self.deploy_key.as_ref().map(|k| format!("Convex {k}"));
        let bearer = self.user_bearer.as_ref().map(|t| format!("Bearer {t}"));
        if admin {
            deploy.or(bearer)
        } else {
            bearer.or(deploy)
        }
    }

    async fn post(&self, url: String, body: Value, admin: bool) -> Result<Value, PersistError> {
        let mut request = self
            .client
            .post(&url)
            .header("Content-Type", "application/json")
            .json(&body);
        if let Some(auth) = self.authorization(admin) {
            request = request.header("Authorization", auth);
        }

        let response = request
            .send()
            .await
            .map_err(|e| PersistError::RequestFailed(e.to_string()))?;
        let status = response.status();
        let text = response
            .text()
            .await
            .map_err(|e| PersistError::RequestFailed(e.to_string()))?;

        if !status.is_success() {
            return Err(PersistError::ApiError {
                code: status.as_u16(),
                message: preview(&text, None),
            });
        }

        let value: Value = serde_json::from_str(&text)?;
        unwrap_envelope(value)
    }

    /// Run a named mutation.
    pub async fn mutation(&self, path: &str, args: Value) -> Result<Value, PersistError> {
        debug!(path, "Backend mutation");
        let url = format!("{}/api/mutation", self.base_url);
        self.post(url, json!({"path": path, "args": args, "format": "json"}), false)
            .await
    }

    /// Run a named query.
    pub async fn query(&self, path: &str, args: Value) -> Result<Value, PersistError> {
        debug!(path, "Backend query");
        let url = format!("{}/api/query", self.base_url);
        self.post(url, json!({"path": path, "args": args, "format": "json"}), false)
            .await
    }

    /// Run any function by identifier.
    pub async fn run(&self, function: &str, args: Value, admin: bool) -> Result<Value, PersistError> {
        debug!(function, admin, "Backend run");
        let url = format!("{}/api/run/{}", self.base_url, function);
        self.post(url, json!({"args": args, "format": "json"}), admin).await
    }
}

/// Strip the `{status, value}` envelope when the API returns one.
fn unwrap_envelope(value: Value) -> Result<Value, PersistError> {
    match value.get("status").and_then(Value::as_str) {
        Some("success") => Ok(value.get("value").cloned().unwrap_or(Value::Null)),
        Some("error") => Err(PersistError::UnexpectedResponse(
            value
                .get("errorMessage")
                .and_then(Value::as_str)
                .unwrap_or("unknown error")
                .to_string(),
        )),
        _ => Ok(value),
    }
}

/// First string field among `keys`, or the value itself when it is a string.
fn string_field(value: &Value, keys: &[&str]) -> Option<String> {
    if let Some(s) = value.as_str() {
        return Some(s.to_string());
    }
    keys.iter()
        .find_map(|k| value.get(*k).and_then(Value::as_str))
        .map(str::to_string)
}

#[async_trait]
impl PersistenceBackend for HttpPersistenceBackend {
    async fn create_course(&self, payload: &CoursePayload) -> Result<String, PersistError> {
        let response = self
            .mutation("courses:createDetailed", serde_json::to_value(payload)?)
            .await?;
        string_field(&response, &["id", "courseId", "_id"]).ok_or_else(|| {
            PersistError::UnexpectedResponse(format!(
                "course creation returned no id: {}",
                preview(&response.to_string(), None)
            ))
        })
    }

    async fn upsert_module(&self, record: &ModuleRecord) -> Result<(), PersistError> {
        self.mutation("modules:upsert", serde_json::to_value(record)?)
            .await?;
        Ok(())
    }

    async fn finalize_course(&self, course_id: &str, module_ids: &[String]) -> Result<(), PersistError> {
        self.mutation(
            "courses:finalize",
            json!({"courseId": course_id, "moduleIds": module_ids}),
        )
        .await?;
        Ok(())
    }

    async fn generate_upload_url(&self) -> Result<String, PersistError> {
        let response = self.run("files:generateUploadUrl", json!({}), false).await?;
        string_field(&response, &["uploadUrl", "url"]).ok_or_else(|| {
            PersistError::UnexpectedResponse("upload URL missing from response".to_string())
        })
    }

    async fn put_bytes(
        &self,
        upload_url: &str,
        bytes: Vec<u8>,
        content_type: &str,
    ) -> Result<String, PersistError> {
        let size = bytes.len();
        let response = self
            .client
            .put(upload_url)
            .header("Content-Type", content_type)
            .timeout(Duration::from_secs(UPLOAD_TIMEOUT_SECS))
            .body(bytes)
            .send()
            .await
            .map_err(|e| PersistError::RequestFailed(e.to_string()))?;

        let status = response.status();
        if !status.is_success() {
            let message = response.text().await.unwrap_or_default();
            return Err(PersistError::ApiError {
                code: status.as_u16(),
                message: preview(&message, None),
            });
        }

        let body: Value = response
            .json()
            .await
            .map_err(|e| PersistError::UnexpectedResponse(e.to_string()))?;
        let storage_id = string_field(&body, &["storageId", "storage_id"]).ok_or_else(|| {
            PersistError::UnexpectedResponse("storage id missing from upload response".to_string())
        })?;

        debug!(size, content_type, storage_id = %storage_id, "Uploaded file");
        Ok(storage_id)
    }

    async fn get_url(&self, storage_id: &str) -> Result<Option<String>, PersistError> {
        let response = self
            .query("files:getUrl", json!({"storageId": storage_id}))
            .await?;
        Ok(string_field(&response, &["url"]))
    }

    async fn update_progress(&self, course_id: &str, status: &str, percent: u8) -> Result<(), PersistError> {
        self.mutation(
            "courses:updateProgress",
            json!({"courseId": course_id, "status": status, "progress": percent}),
        )
        .await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_empty_base_url_not_configured() {
        let err = HttpPersistenceBackend::new("", None, None).unwrap_err();
        assert!(matches!(err, PersistError::NotConfigured));
    }

    #[test]
    fn test_base_url_trimmed() {
        let backend = HttpPersistenceBackend::new("https://x.convex.cloud/", None, None).unwrap();
        assert_eq!(backend.base_url(), "https://x.convex.cloud");
    }

    #[test]
    fn test_authorization_selection() {
        let both = HttpPersistenceBackend::new(
            "https://x",
            Some("prod:abc".to_string()),
            Some("jwt".to_string()),
        )
        .unwrap();
        assert_eq!(both.authorization(true).as_deref(), Some("Convex prod:abc"));
        assert_eq!(both.authorization(false).as_deref(), Some("Bearer jwt"));

        let deploy_only =
            HttpPersistenceBackend::new("https://x", Some("prod:abc".to_string()), Some(String::new()))
                .unwrap();
        assert_eq!(deploy_only.authorization(false).as_deref(), Some("Convex prod:abc"));

        let anonymous = HttpPersistenceBackend::new("https://x", None, None).unwrap();
        assert!(anonymous.authorization(true).is_none());
    }

    #[test]
    fn test_debug_redacts_secrets() {
        let backend =
            HttpPersistenceBackend::new("https://x", Some("prod:abc".to_string()), None).unwrap();
        let debug = format!("{backend:?}");
        assert!(!debug.contains("prod:abc"));
        assert!(debug.contains("<redacted>"));
    }

    #[test]
    fn test_unwrap_envelope() {
        let ok = unwrap_envelope(json!({"status": "success", "value": {"id": "c1"}})).unwrap();
        assert_eq!(ok, json!({"id": "c1"}));

        let raw = unwrap_envelope(json!({"id": "c2"})).unwrap();
        assert_eq!(raw, json!({"id": "c2"}));

        let err = unwrap_envelope(json!({"status": "error", "errorMessage": "bad args"})).unwrap_err();
        assert!(err.to_string().contains("bad args"));
    }

    #[test]
    fn test_string_field() {
        assert_eq!(string_field(&json!("abc"), &["id"]).as_deref(), Some("abc"));
        assert_eq!(
            string_field(&json!({"_id": "x"}), &["id", "_id"]).as_deref(),
            Some("x")
        );
        assert!(string_field(&json!({"id": 5}), &["id"]).is_none());
    }
}
