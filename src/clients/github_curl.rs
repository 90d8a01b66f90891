use anyhow::Context;
use anyhow::Result;
use anyhow::bail;
use serde::Deserialize;
use tokio::process::Command;
use tracing::trace;

const USER_AGENT: &str = "User-Agent: gitpromote";
const ACCEPT_JSON: &str = "Accept: application/vnd.github+json";
const API_VERSION: &str = "X-GitHub-Api-Version: 2022-11-28";

/// HTTP client using curl for making GitHub API requests
pub struct GithubCurlClient {
    token: String,
}

#[derive(Debug, Deserialize)]
struct GitHubError {
    message: String,
    #[serde(default)]
    errors: Vec<GitHubErrorDetail>,
}

#[derive(Debug, Deserialize)]
struct GitHubErrorDetail {
    #[serde(default)]
    message: Option<String>,
}

impl GithubCurlClient {
    pub fn new(token: String) -> Self {
        Self { token }
    }

    pub async fn get(&self, url: &str) -> Result<String> {
        self.send("GET", url, None).await
    }

    pub async fn post(&self, url: &str, json_data: &str) -> Result<String> {
        self.send("POST", url, Some(json_data)).await
    }

    async fn send(&self, method: &str, url: &str, json_data: Option<&str>) -> Result<String> {
        let auth = format!("Authorization: Bearer {}", self.token);
        let mut args = vec![
            "-s",
            "-w",
            "\n%{http_code}",
            "-X",
            method,
            "-H",
            auth.as_str(),
            "-H",
            ACCEPT_JSON,
            "-H",
            API_VERSION,
            "-H",
            USER_AGENT,
        ];
        if let Some(json_data) = json_data {
            args.extend(["-H", "Content-Type: application/json", "-d", json_data]);
        }
        args.push(url);

        trace!(method, url, "curl");
        let output = Command::new("curl")
            .args(&args)
            .output()
            .await
            .context("Failed to execute curl command")?;

        if !output.status.success() {
            bail!(
                "curl command failed: {}",
                String::from_utf8_lossy(&output.stderr)
            );
        }

        parse_response(output.stdout)
    }
}

/// Split off the status code curl appends and turn 4xx/5xx into errors.
fn parse_response(stdout: Vec<u8>) -> Result<String> {
    let output_str = String::from_utf8(stdout)?;
    let (response, status) = output_str
        .rsplit_once('\n')
        .unwrap_or(("", output_str.as_str()));
    let status_code = status.trim().parse::<u16>().unwrap_or(0);

    if status_code >= 400 || status_code == 0 {
        if let Ok(error) = serde_json::from_str::<GitHubError>(response) {
            let details: Vec<String> = error
                .errors
                .into_iter()
                .filter_map(|e| e.message)
                .collect();
            if details.is_empty() {
                bail!("GitHub API error ({}): {}", status_code, error.message);
            }
            bail!(
                "GitHub API error ({}): {}: {}",
                status_code,
                error.message,
                details.join("; ")
            );
        }
        bail!(
            "GitHub API request failed with status {}: {}",
            status_code,
            response
        );
    }

    Ok(response.to_string())
}
