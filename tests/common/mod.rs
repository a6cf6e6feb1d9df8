#![allow(dead_code)]

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::{Context, Result};
use reqwest::StatusCode;
use serde_json::{json, Value};

use user_api::config::AppConfig;
use user_api::database::MemoryModel;
use user_api::models::user;

pub struct TestServer {
    pub port: u16,
    pub base_url: String,
    pub client: reqwest::Client,
}

impl TestServer {
    /// Start the full router in-process on a free port, backed by a fresh memory store.
    pub async fn spawn() -> Result<Self> {
        Self::spawn_with(AppConfig::test()).await
    }

    pub async fn spawn_with(config: AppConfig) -> Result<Self> {
        // Pick an unused port for isolation
        let port = portpicker::pick_unused_port().context("failed to pick free port")?;
        let base_url = format!("http://127.0.0.1:{}", port);

        let listener = tokio::net::TcpListener::bind(("127.0.0.1", port))
            .await
            .with_context(|| format!("failed to bind port {}", port))?;
        let model = Arc::new(MemoryModel::new(user::schema()));
        let app = user_api::app(model, &config);
        tokio::spawn(async move {
            let _ = axum::serve(listener, app.into_make_service_with_connect_info::<SocketAddr>()).await;
        });

        let server = Self { port, base_url, client: reqwest::Client::new() };
        server.wait_ready(Duration::from_secs(5)).await?;
        Ok(server)
    }

    async fn wait_ready(&self, timeout: Duration) -> Result<()> {
        let deadline = Instant::now() + timeout;
        while Instant::now() < deadline {
            if let Ok(resp) = self.client.get(self.url("/health")).send().await {
                if resp.status() == StatusCode::OK {
                    return Ok(());
                }
            }
            tokio::time::sleep(Duration::from_millis(50)).await;
        }
        anyhow::bail!("server did not become ready on {} within {:?}", self.base_url, timeout)
    }

    pub fn url(&self, path: &str) -> String {
        format!("{}{}", self.base_url, path)
    }

    pub async fn get(&self, path: &str) -> Result<(StatusCode, Value)> {
        let resp = self.client.get(self.url(path)).send().await?;
        read(resp).await
    }

    pub async fn post(&self, path: &str, body: &Value) -> Result<(StatusCode, Value)> {
        let resp = self.client.post(self.url(path)).json(body).send().await?;
        read(resp).await
    }

    pub async fn patch(&self, path: &str, body: &Value) -> Result<(StatusCode, Value)> {
        let resp = self.client.patch(self.url(path)).json(body).send().await?;
        read(resp).await
    }

    pub async fn delete(&self, path: &str) -> Result<(StatusCode, Value)> {
        let resp = self.client.delete(self.url(path)).send().await?;
        read(resp).await
    }

    /// Create a user and return its identifier.
    pub async fn create_user(&self, name: &str, email: &str) -> Result<String> {
        let (status, body) = self
            .post("/api/users", &json!({"name": name, "email": email, "password": "secret123"}))
            .await?;
        anyhow::ensure!(status == StatusCode::CREATED, "create failed: {} {}", status, body);
        body["data"]["_id"]
            .as_str()
            .map(str::to_string)
            .context("created user has no _id")
    }
}

/// Status plus JSON body; an empty body reads as `null`.
async fn read(resp: reqwest::Response) -> Result<(StatusCode, Value)> {
    let status = resp.status();
    let text = resp.text().await?;
    let body = if text.is_empty() {
        Value::Null
    } else {
        serde_json::from_str(&text).with_context(|| format!("response is not JSON: {}", text))?
    };
    Ok((status, body))
}
