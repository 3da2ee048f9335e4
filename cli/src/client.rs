//! Thin HTTP client over the control plane's management surface.
//!
//! The CLI never talks to providers or the fleet directly; every verb is
//! a call against the same dashboard API the UI uses.

use anyhow::{Context, Result, bail};
use serde_json::Value;

use moltagent_control_plane::config::DEFAULT_CP_PORT;

/// Bearer-authenticated JSON client for `/moltagent/*` routes.
pub struct ApiClient {
    http: reqwest::Client,
    base: String,
    token: String,
}

impl ApiClient {
    /// Build from `MOLTAGENT_API_URL` / `MOLTAGENT_CP_PORT` /
    /// `MOLTAGENT_API_TOKEN`, defaulting to the local control plane.
    #[must_use]
    pub fn from_env() -> Self {
        let base = std::env::var("MOLTAGENT_API_URL").unwrap_or_else(|_| {
            let port = std::env::var("MOLTAGENT_CP_PORT")
                .ok()
                .and_then(|p| p.parse::<u16>().ok())
                .unwrap_or(DEFAULT_CP_PORT);
            format!("http://127.0.0.1:{port}")
        });
        Self {
            http: reqwest::Client::new(),
            base: base.trim_end_matches('/').to_string(),
            token: std::env::var("MOLTAGENT_API_TOKEN").unwrap_or_default(),
        }
    }

    fn request(&self, method: reqwest::Method, path: &str) -> reqwest::RequestBuilder {
        let mut builder = self
            .http
            .request(method, format!("{}/moltagent{path}", self.base));
        if !self.token.is_empty() {
            builder = builder.bearer_auth(&self.token);
        }
        builder
    }

    async fn execute(&self, builder: reqwest::RequestBuilder) -> Result<Value> {
        let response = builder
            .send()
            .await
            .context("cannot reach the control plane (is the orchestrator running?)")?;
        let status = response.status();
        let body: Value = response.json().await.unwrap_or(Value::Null);
        if !status.is_success() {
            let detail = body["error"].as_str().unwrap_or("request failed");
            bail!("control plane returned {status}: {detail}");
        }
        Ok(body)
    }

    /// GET a dashboard route.
    ///
    /// # Errors
    ///
    /// Returns an error on transport failure or a non-2xx response.
    pub async fn get(&self, path: &str) -> Result<Value> {
        self.execute(self.request(reqwest::Method::GET, path)).await
    }

    /// POST a JSON body to a dashboard route.
    ///
    /// # Errors
    ///
    /// Returns an error on transport failure or a non-2xx response.
    pub async fn post(&self, path: &str, body: &Value) -> Result<Value> {
        self.execute(self.request(reqwest::Method::POST, path).json(body))
            .await
    }

    /// DELETE a dashboard route.
    ///
    /// # Errors
    ///
    /// Returns an error on transport failure or a non-2xx response.
    pub async fn delete(&self, path: &str) -> Result<Value> {
        self.execute(self.request(reqwest::Method::DELETE, path))
            .await
    }
}
