//! HTTP client for the mining API.
//!
//! A thin typed wrapper over the two endpoints. `get_block_template`
//! deliberately carries no request timeout: a matching long-poll id
//! parks the request server-side until the template changes.

use anyhow::{bail, Result};
use serde::de::DeserializeOwned;
use serde::Serialize;

use crate::types::Block;

use super::types::{GetBlockTemplateRequest, GetBlockTemplateResponse, SubmitBlockRequest};

/// Client for a mining API server.
#[derive(Debug, Clone)]
pub struct Client {
    http: reqwest::Client,
    base_url: String,
    password: Option<String>,
}

impl Client {
    /// Creates a client for the API mounted at `base_url` (including
    /// the mount prefix, e.g. `http://localhost:9980/mining`).
    pub fn new(base_url: impl Into<String>) -> Client {
        let mut base_url = base_url.into();
        while base_url.ends_with('/') {
            base_url.pop();
        }
        Client {
            http: reqwest::Client::new(),
            base_url,
            password: None,
        }
    }

    /// Sets the basic-auth password sent with every request.
    pub fn with_password(mut self, password: impl Into<String>) -> Client {
        self.password = Some(password.into());
        self
    }

    async fn post<Req: Serialize>(&self, path: &str, body: &Req) -> Result<reqwest::Response> {
        let mut req = self.http.post(format!("{}{path}", self.base_url)).json(body);
        if let Some(password) = &self.password {
            req = req.basic_auth("", Some(password));
        }
        let resp = req.send().await?;
        let status = resp.status();
        if !status.is_success() {
            let text = resp.text().await.unwrap_or_default();
            bail!("POST {path}: {status}: {text}");
        }
        Ok(resp)
    }

    async fn post_json<Req: Serialize, Resp: DeserializeOwned>(
        &self,
        path: &str,
        body: &Req,
    ) -> Result<Resp> {
        Ok(self.post(path, body).await?.json().await?)
    }

    /// Fetches a block template. Pass the id of a previously fetched
    /// template to long-poll until a different one exists; pass an
    /// empty string for an immediate response.
    pub async fn get_block_template(&self, long_poll_id: &str) -> Result<GetBlockTemplateResponse> {
        self.post_json(
            "/getblocktemplate",
            &GetBlockTemplateRequest {
                long_poll_id: long_poll_id.into(),
            },
        )
        .await
    }

    /// Submits a mined block, encoded in the layout matching its
    /// version.
    pub async fn submit_block(&self, block: &Block) -> Result<()> {
        let raw = match &block.v2 {
            Some(_) => block.v2_wire_bytes(),
            None => block.v1_wire_bytes(),
        };
        self.post(
            "/submitblock",
            &SubmitBlockRequest {
                params: vec![hex::encode(raw)],
            },
        )
        .await?;
        Ok(())
    }
}
