//! HTTP client for the Shanoir server: Keycloak authentication, SolR search,
//! dataset download, and remote execution management.

use anyhow::{anyhow, Context, Result};
use reqwest::{Client, Response, StatusCode};
use serde_json::{json, Value};
use std::path::Path;
use std::time::Duration;
use tokio::sync::Mutex;

use crate::pipeline::{Failure, FailureReason, Fetcher};
use crate::state::Item;

#[derive(Clone)]
struct Tokens {
    access: String,
    refresh: String,
}

/// Authenticated session against one Shanoir domain.
///
/// The access/refresh token pair lives inside the client and is refreshed in
/// place when the server answers 401, then the request is retried once.
pub struct ShanoirClient {
    client: Client,
    domain: String,
    username: String,
    password: String,
    tokens: Mutex<Option<Tokens>>,
}

impl ShanoirClient {
    /// Build a client for `domain`. The password comes from the CLI/config or
    /// the `SHANOIR_PASSWORD` environment variable.
    pub fn new(
        domain: &str,
        username: &str,
        password: &str,
        timeout: Duration,
        accept_invalid_certs: bool,
    ) -> Result<Self> {
        let client = Client::builder()
            .danger_accept_invalid_certs(accept_invalid_certs)
            .timeout(timeout)
            .build()
            .context("Failed to build HTTP client")?;
        Ok(Self {
            client,
            domain: domain.trim_end_matches('/').to_string(),
            username: username.to_string(),
            password: password.to_string(),
            tokens: Mutex::new(None),
        })
    }

    fn auth_url(&self) -> String {
        format!(
            "https://{}/auth/realms/shanoir-ng/protocol/openid-connect/token",
            self.domain
        )
    }

    async fn request_tokens(&self, params: &[(&str, &str)]) -> Result<Tokens> {
        let response = self
            .client
            .post(self.auth_url())
            .form(params)
            .send()
            .await
            .context("Failed to reach the authentication server")?;
        let status = response.status();
        let body: Value = response.json().await.context("Invalid token response")?;
        if status != StatusCode::OK {
            let description = body
                .get("error_description")
                .and_then(|v| v.as_str())
                .unwrap_or("no error description");
            return Err(anyhow!("Authentication failed ({status}): {description}"));
        }
        let access = body
            .get("access_token")
            .and_then(|v| v.as_str())
            .ok_or_else(|| anyhow!("Token response without access_token"))?;
        let refresh = body
            .get("refresh_token")
            .and_then(|v| v.as_str())
            .unwrap_or("");
        Ok(Tokens {
            access: access.to_string(),
            refresh: refresh.to_string(),
        })
    }

    async fn obtain_tokens(&self) -> Result<Tokens> {
        println!("get keycloak token...");
        self.request_tokens(&[
            ("client_id", "shanoir-uploader"),
            ("grant_type", "password"),
            ("username", &self.username),
            ("password", &self.password),
            ("scope", "offline_access"),
        ])
        .await
    }

    async fn refresh_tokens(&self, refresh: &str) -> Result<Tokens> {
        println!("refresh keycloak token...");
        self.request_tokens(&[
            ("client_id", "shanoir-uploader"),
            ("grant_type", "refresh_token"),
            ("refresh_token", refresh),
        ])
        .await
    }

    /// Current access token, obtaining the initial pair on first use.
    async fn access_token(&self) -> Result<String> {
        let mut guard = self.tokens.lock().await;
        if guard.is_none() {
            *guard = Some(self.obtain_tokens().await?);
        }
        Ok(guard.as_ref().map(|t| t.access.clone()).unwrap_or_default())
    }

    /// Refresh token for execution payloads, which the server wants verbatim.
    pub async fn refresh_token(&self) -> Result<String> {
        self.access_token().await?;
        let guard = self.tokens.lock().await;
        Ok(guard.as_ref().map(|t| t.refresh.clone()).unwrap_or_default())
    }

    async fn refresh_in_place(&self) -> Result<String> {
        let mut guard = self.tokens.lock().await;
        let refresh = guard.as_ref().map(|t| t.refresh.clone()).unwrap_or_default();
        let tokens = self.refresh_tokens(&refresh).await?;
        let access = tokens.access.clone();
        *guard = Some(tokens);
        Ok(access)
    }

    /// Send an authorized request, retrying once with a refreshed token when
    /// the first answer is 401.
    async fn send_authorized(
        &self,
        build: impl Fn(&Client) -> reqwest::RequestBuilder,
    ) -> Result<Response> {
        let token = self.access_token().await?;
        let response = build(&self.client).bearer_auth(&token).send().await?;
        if response.status() != StatusCode::UNAUTHORIZED {
            return Ok(response);
        }
        let token = self.refresh_in_place().await?;
        Ok(build(&self.client).bearer_auth(&token).send().await?)
    }

    /// Full-text SolR search; returns one item per dataset found.
    pub async fn search(&self, search_text: &str, page_size: usize) -> Result<Vec<Item>> {
        let url = format!("https://{}/shanoir-ng/datasets/solr", self.domain);
        let payload = json!({
            "searchText": search_text,
            "expertMode": true,
        });
        let size = page_size.to_string();
        let response = self
            .send_authorized(|client| {
                client
                    .post(&url)
                    .query(&[("page", "0"), ("size", size.as_str())])
                    .json(&payload)
            })
            .await
            .context("SolR search request failed")?
            .error_for_status()?;

        let body: Value = response.json().await?;
        let content = body
            .get("content")
            .and_then(|v| v.as_array())
            .ok_or_else(|| anyhow!("SolR response without content array"))?;

        let mut items = Vec::new();
        for entry in content {
            let Some(id) = entry.get("id") else { continue };
            let sequence_id = match id {
                Value::String(s) => s.clone(),
                Value::Number(n) => n.to_string(),
                _ => continue,
            };
            items.push(Item {
                sequence_id,
                shanoir_name: entry
                    .get("subjectName")
                    .and_then(|v| v.as_str())
                    .map(str::to_string),
                series_description: entry
                    .get("datasetName")
                    .and_then(|v| v.as_str())
                    .map(str::to_string),
                patient_id: None,
            });
        }
        Ok(items)
    }

    /// Download the DICOM archive of one dataset into `destination`.
    pub async fn download_dataset(
        &self,
        sequence_id: &str,
        destination: &Path,
    ) -> Result<(), Failure> {
        let url = format!(
            "https://{}/shanoir-ng/datasets/datasets/download/{sequence_id}",
            self.domain
        );
        let response = self
            .send_authorized(|client| client.get(&url).query(&[("format", "dcm")]))
            .await
            .map_err(|err| Failure::new(FailureReason::UnknownHttpError, format!("{err:#}")))?;

        let status = response.status();
        if !status.is_success() {
            let reason = status.canonical_reason().unwrap_or("unknown");
            return Err(Failure::new(
                FailureReason::StatusCode(status.as_u16()),
                format!(
                    "Response status code: {}, reason: {reason}",
                    status.as_u16()
                ),
            ));
        }

        let file_name =
            attachment_file_name(&response).unwrap_or_else(|| format!("{sequence_id}.zip"));
        let bytes = response
            .bytes()
            .await
            .map_err(|err| Failure::new(FailureReason::UnknownHttpError, err.to_string()))?;
        std::fs::write(destination.join(file_name), &bytes)
            .map_err(|err| Failure::new(FailureReason::UnknownHttpError, err.to_string()))?;
        Ok(())
    }

    /// Submit one execution. The server expects the refresh token and a
    /// timestamped name inside the payload.
    pub async fn create_execution(&self, mut execution: Value) -> Result<Value> {
        let url = format!(
            "https://{}/shanoir-ng/datasets/carmin-data/createExecution",
            self.domain
        );
        let suffix = chrono::Local::now().format("%m%d%Y%H%M%S").to_string();
        let refresh_token = self.refresh_token().await?;
        if let Some(object) = execution.as_object_mut() {
            let name = object
                .get("name")
                .and_then(|v| v.as_str())
                .unwrap_or("execution")
                .to_string();
            object.insert("name".into(), json!(format!("{name}_{suffix}")));
            object.insert("identifier".into(), json!(""));
            object.insert("client".into(), json!("shanoir-uploader"));
            object.insert("refreshToken".into(), json!(refresh_token));
        }
        let response = self
            .send_authorized(|client| client.post(&url).json(&execution))
            .await
            .context("createExecution request failed")?;
        let status = response.status();
        let body: Value = response.json().await.unwrap_or(Value::Null);
        if status != StatusCode::OK {
            return Err(anyhow!("Error while creating execution {status}: {body}"));
        }
        Ok(body)
    }

    /// Current status string of a submitted execution.
    pub async fn execution_status(&self, identifier: &str) -> Result<String> {
        let url = format!(
            "https://{}/shanoir-ng/datasets/carmin-data/execution/{identifier}",
            self.domain
        );
        let response = self
            .send_authorized(|client| client.get(&url))
            .await
            .context("Execution status request failed")?
            .error_for_status()?;
        let body: Value = response.json().await?;
        body.get("status")
            .and_then(|v| v.as_str())
            .map(str::to_string)
            .ok_or_else(|| anyhow!("Execution status response without status field"))
    }
}

impl Fetcher for ShanoirClient {
    async fn fetch(&self, sequence_id: &str, destination: &Path) -> Result<(), Failure> {
        self.download_dataset(sequence_id, destination).await
    }
}

/// File name advertised by a Content-Disposition attachment header, if any.
fn attachment_file_name(response: &Response) -> Option<String> {
    let header = response
        .headers()
        .get(reqwest::header::CONTENT_DISPOSITION)?
        .to_str()
        .ok()?;
    parse_attachment_file_name(header)
}

fn parse_attachment_file_name(header: &str) -> Option<String> {
    let mut plain = None;
    for part in header.split(';').map(str::trim) {
        if let Some(value) = part.strip_prefix("filename*=") {
            // RFC 5987 form: charset''value. The charset prefix is dropped;
            // percent-escapes are kept as-is, they are safe in a file name.
            if let Some((_, encoded)) = value.trim_matches('"').split_once("''") {
                if !encoded.is_empty() {
                    return Some(encoded.to_string());
                }
            }
        } else if let Some(value) = part.strip_prefix("filename=") {
            let value = value.trim_matches('"');
            if !value.is_empty() {
                plain = Some(value.to_string());
            }
        }
    }
    plain
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn attachment_file_name_is_parsed_from_content_disposition() {
        assert_eq!(
            parse_attachment_file_name("attachment; filename=\"1234_seq.zip\"").as_deref(),
            Some("1234_seq.zip")
        );
        assert_eq!(
            parse_attachment_file_name("attachment; filename=plain.zip").as_deref(),
            Some("plain.zip")
        );
        assert_eq!(parse_attachment_file_name("inline"), None);
        assert_eq!(parse_attachment_file_name("attachment; filename=\"\""), None);
    }

    #[test]
    fn extended_file_name_syntax_is_preferred() {
        assert_eq!(
            parse_attachment_file_name("attachment; filename*=UTF-8''1234_seq.zip").as_deref(),
            Some("1234_seq.zip")
        );
        assert_eq!(
            parse_attachment_file_name(
                "attachment; filename=\"fallback.zip\"; filename*=UTF-8''pr%C3%A9f%C3%A9r%C3%A9.zip"
            )
            .as_deref(),
            Some("pr%C3%A9f%C3%A9r%C3%A9.zip")
        );
    }
}
