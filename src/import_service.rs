use async_trait::async_trait;
use chrono::NaiveDate;
use reqwest::Url;
use std::time::Duration;
use tracing::debug;

use crate::error::ImportServiceError;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StartRequest {
    pub dataset_pattern: String,
    pub start_date: NaiveDate,
    pub full_update: bool,
}

impl StartRequest {
    pub fn query(&self) -> Vec<(&'static str, String)> {
        let mut query = vec![
            ("set", self.dataset_pattern.clone()),
            ("start", self.start_date.format("%Y-%m-%d").to_string()),
            ("updateonchange", "true".to_string()),
        ];
        if self.full_update {
            query.push(("fullupdate", "true".to_string()));
        }
        query
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServiceResponse {
    pub status: u16,
    pub body: String,
}

impl ServiceResponse {
    pub fn ok(body: impl Into<String>) -> Self {
        ServiceResponse {
            status: 200,
            body: body.into(),
        }
    }

    pub fn is_success(&self) -> bool {
        (200..300).contains(&self.status)
    }

    /// Number of datasets the service still has to import. `None` when the document does not
    /// hold a non-negative integer.
    pub fn remaining_datasets(&self) -> Option<u64> {
        let text = strip_markup(&self.body);
        match text.trim().parse::<i64>() {
            Ok(n) if n >= 0 => Some(n as u64),
            _ => None,
        }
    }
}

fn strip_markup(document: &str) -> String {
    let mut text = String::with_capacity(document.len());
    let mut in_tag = false;
    for c in document.chars() {
        match c {
            '<' => in_tag = true,
            '>' => in_tag = false,
            c if !in_tag => text.push(c),
            _ => {}
        }
    }
    text
}

/// The external service that performs the actual ERP data import.
#[async_trait]
pub trait ImportService: Send + Sync {
    async fn start(&self, request: &StartRequest) -> Result<ServiceResponse, ImportServiceError>;

    async fn progress(&self) -> Result<ServiceResponse, ImportServiceError>;
}

pub struct HttpImportService {
    client: reqwest::Client,
    base_url: String,
}

/// Parses a service base URL, accepting only http(s).
pub fn parse_base_url(base_url: &str) -> Result<String, ImportServiceError> {
    let url = Url::parse(base_url)
        .map_err(|e| ImportServiceError::InvalidUrl(format!("{base_url}: {e}")))?;
    match url.scheme() {
        "http" | "https" => Ok(url.as_str().trim_end_matches('/').to_string()),
        scheme => Err(ImportServiceError::InvalidUrl(format!(
            "{base_url}: unsupported scheme '{scheme}'"
        ))),
    }
}

impl HttpImportService {
    pub fn new(base_url: &str, request_timeout: Duration) -> Result<Self, ImportServiceError> {
        let base_url = parse_base_url(base_url)?;
        let client = reqwest::Client::builder()
            .timeout(request_timeout)
            .user_agent(format!("importq/{}", env!("CARGO_PKG_VERSION")))
            .build()?;
        Ok(HttpImportService { client, base_url })
    }

    async fn get(
        &self,
        path: &str,
        query: &[(&'static str, String)],
    ) -> Result<ServiceResponse, ImportServiceError> {
        let url = format!("{}/{}", self.base_url, path);
        debug!(message = "Calling import service", url = %url, query = ?query);
        let response = self.client.get(&url).query(query).send().await?;
        let status = response.status().as_u16();
        let body = response.text().await?;
        Ok(ServiceResponse { status, body })
    }
}

#[async_trait]
impl ImportService for HttpImportService {
    async fn start(&self, request: &StartRequest) -> Result<ServiceResponse, ImportServiceError> {
        self.get("start", &request.query()).await
    }

    async fn progress(&self) -> Result<ServiceResponse, ImportServiceError> {
        self.get("progress", &[]).await
    }
}
