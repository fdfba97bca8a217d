//! HTTP clients for coverage aggregation, docs hosting and package publishing

use crate::core::identity::IdentityToken;
use crate::runner::{RunnerConfig, RunnerError};
use reqwest::header::{HeaderMap, HeaderValue, AUTHORIZATION};
use reqwest::multipart::{Form, Part};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::{debug, info};

/// Client for the external services steps talk to
#[derive(Debug, Clone)]
pub struct ServiceClient {
    client: reqwest::Client,
    coverage_url: String,
    package_index_url: String,
    package_upload_url: String,
    pages_url: Option<String>,
}

#[derive(Serialize)]
struct TokenRequest<'a> {
    token: &'a str,
}

#[derive(Deserialize)]
struct TokenResponse {
    token: String,
}

#[derive(Serialize)]
struct DeploymentRequest<'a> {
    artifact: &'a str,
    sha: &'a str,
    files: &'a [String],
}

#[derive(Deserialize)]
struct DeploymentResponse {
    page_url: String,
}

impl ServiceClient {
    pub fn new(config: &RunnerConfig) -> Result<Self, RunnerError> {
        let client = reqwest::Client::builder()
            .user_agent(concat!("stagegate/", env!("CARGO_PKG_VERSION")))
            .timeout(Duration::from_secs(config.request_timeout_secs))
            .build()?;

        Ok(Self {
            client,
            coverage_url: trim_base(&config.coverage_url),
            package_index_url: trim_base(&config.package_index_url),
            package_upload_url: config.package_upload_url.clone(),
            pages_url: config.pages_url.as_deref().map(trim_base),
        })
    }

    /// Upload a coverage report, authenticated with the per-run token
    pub async fn upload_coverage(
        &self,
        file: &Path,
        token: &str,
        flags: &[String],
        sha: &str,
    ) -> Result<(), RunnerError> {
        let report = read_file(file).await?;
        let url = format!("{}/upload", self.coverage_url);
        debug!("Uploading {} bytes of coverage to {}", report.len(), url);

        let mut headers = HeaderMap::new();
        headers.insert(
            AUTHORIZATION,
            HeaderValue::from_str(&format!("token {}", token))
                .map_err(|e| RunnerError::Internal(format!("Invalid coverage token: {}", e)))?,
        );

        let flags = flags.join(",");
        let response = self
            .client
            .post(&url)
            .headers(headers)
            .query(&[("sha", sha), ("flags", flags.as_str())])
            .body(report)
            .send()
            .await?;
        check_status("coverage", response).await?;

        info!("Coverage report {} uploaded", file.display());
        Ok(())
    }

    /// Publish a docs artifact; returns the page URL
    pub async fn deploy_pages(
        &self,
        artifact: &str,
        files: &[String],
        sha: &str,
    ) -> Result<String, RunnerError> {
        let base = self
            .pages_url
            .as_deref()
            .ok_or(RunnerError::MissingEndpoint("pages"))?;
        let url = format!("{}/deployments", base);
        debug!("Deploying artifact '{}' ({} files) to {}", artifact, files.len(), url);

        let response = self
            .client
            .post(&url)
            .json(&DeploymentRequest {
                artifact,
                sha,
                files,
            })
            .send()
            .await?;
        let deployment: DeploymentResponse = check_status("pages", response).await?.json().await?;

        info!("Deployed '{}' to {}", artifact, deployment.page_url);
        Ok(deployment.page_url)
    }

    /// Trusted publish: exchange the identity token for a short-lived
    /// upload token, then upload every file with it. Returns the uploaded
    /// file names.
    pub async fn publish(
        &self,
        files: &[PathBuf],
        repository_url: Option<&str>,
        identity: &IdentityToken,
    ) -> Result<Vec<String>, RunnerError> {
        if identity.is_expired() {
            return Err(RunnerError::TokenExpired(identity.expires_at));
        }

        let mint_url = format!("{}/_/oidc/mint-token", self.package_index_url);
        debug!("Exchanging identity token for {} at {}", identity.subject, mint_url);
        let response = self
            .client
            .post(&mint_url)
            .json(&TokenRequest {
                token: identity.value(),
            })
            .send()
            .await?;
        let minted: TokenResponse = check_status("package index", response).await?.json().await?;

        let upload_url = repository_url.unwrap_or(&self.package_upload_url);
        let mut uploaded = Vec::with_capacity(files.len());
        for file in files {
            let file_name = file
                .file_name()
                .map(|n| n.to_string_lossy().into_owned())
                .ok_or_else(|| RunnerError::Internal(format!("Not a file: {}", file.display())))?;
            let content = read_file(file).await?;

            let form = Form::new()
                .text(":action", "file_upload")
                .text("protocol_version", "1")
                .text("filetype", distribution_type(&file_name))
                .part("content", Part::bytes(content).file_name(file_name.clone()));

            let response = self
                .client
                .post(upload_url)
                .basic_auth("__token__", Some(&minted.token))
                .multipart(form)
                .send()
                .await?;
            check_status("package upload", response).await?;

            info!("Uploaded {} to {}", file_name, upload_url);
            uploaded.push(file_name);
        }

        Ok(uploaded)
    }
}

fn trim_base(url: &str) -> String {
    url.trim_end_matches('/').to_string()
}

fn distribution_type(file_name: &str) -> &'static str {
    if file_name.ends_with(".whl") {
        "bdist_wheel"
    } else {
        "sdist"
    }
}

async fn read_file(path: &Path) -> Result<Vec<u8>, RunnerError> {
    tokio::fs::read(path).await.map_err(|source| RunnerError::Io {
        path: path.display().to_string(),
        source,
    })
}

async fn check_status(
    service: &'static str,
    response: reqwest::Response,
) -> Result<reqwest::Response, RunnerError> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }
    let body = response.text().await.unwrap_or_default();
    Err(RunnerError::Service {
        service,
        status: status.as_u16(),
        body,
    })
}
