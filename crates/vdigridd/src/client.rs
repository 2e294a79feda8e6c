//! HTTP client for the running daemon's application API.

use std::time::Duration;

use anyhow::{Context, anyhow};
use reqwest::Client;
use serde::Serialize;
use serde::de::DeserializeOwned;

use vdigrid_api::{ApiResponse, ApplicationRequest};
use vdigrid_state::Application;

pub struct DaemonClient {
    client: Client,
    base_url: String,
}

impl DaemonClient {
    pub fn new(base_url: &str) -> anyhow::Result<Self> {
        let client = Client::builder()
            .timeout(Duration::from_secs(10))
            .build()?;
        Ok(Self {
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
        })
    }

    pub async fn list_applications(&self) -> anyhow::Result<Vec<Application>> {
        self.get("/api/v1/applications").await
    }

    pub async fn put_application(&self, req: &ApplicationRequest) -> anyhow::Result<Application> {
        self.post("/api/v1/applications", req).await
    }

    pub async fn remove_application(&self, name: &str) -> anyhow::Result<()> {
        let _: String = self.delete(&format!("/api/v1/applications/{name}")).await?;
        Ok(())
    }

    async fn get<T: DeserializeOwned>(&self, path: &str) -> anyhow::Result<T> {
        let url = format!("{}{}", self.base_url, path);
        let response = self.client.get(&url).send().await;
        self.handle_response(response).await
    }

    async fn post<B: Serialize, T: DeserializeOwned>(
        &self,
        path: &str,
        body: &B,
    ) -> anyhow::Result<T> {
        let url = format!("{}{}", self.base_url, path);
        let response = self.client.post(&url).json(body).send().await;
        self.handle_response(response).await
    }

    async fn delete<T: DeserializeOwned>(&self, path: &str) -> anyhow::Result<T> {
        let url = format!("{}{}", self.base_url, path);
        let response = self.client.delete(&url).send().await;
        self.handle_response(response).await
    }

    async fn handle_response<T: DeserializeOwned>(
        &self,
        response: reqwest::Result<reqwest::Response>,
    ) -> anyhow::Result<T> {
        let response = response.with_context(|| {
            format!(
                "cannot reach vdigridd at {}; start `vdigridd run` or pass --offline",
                self.base_url
            )
        })?;
        let status = response.status();
        let body: ApiResponse<T> = response
            .json()
            .await
            .with_context(|| format!("unexpected response from daemon ({status})"))?;
        if !status.is_success() || !body.success {
            let message = body.error.unwrap_or_else(|| status.to_string());
            return Err(anyhow!("daemon rejected request: {message}"));
        }
        body.data
            .ok_or_else(|| anyhow!("daemon response carried no data"))
    }
}
