// Copyright 2025 Actionhost Authors
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

//! One-shot action invocation.

use anyhow::{anyhow, Result};
use serde_json::Value;

/// Validates that a URL string starts with http:// or https://
pub fn validate_http_url(url: &str, description: &str) -> Result<()> {
    if url.starts_with("http://") || url.starts_with("https://") {
        Ok(())
    } else {
        Err(anyhow!(
            "Invalid {}: '{}' must start with http:// or https://",
            description,
            url
        ))
    }
}

/// What came back from an action.
#[derive(Debug, Clone, PartialEq)]
pub enum CallOutput {
    Json(Value),
    /// A streamed download, passed through as raw bytes.
    Download(Vec<u8>),
}

/// Calls the action at `url`. With `args` the call is a POST carrying them
/// as the JSON body, otherwise a GET.
///
/// Any non-success status is an error carrying the reply body.
pub async fn call_action(client: &reqwest::Client, url: &str, args: Option<&Value>) -> Result<CallOutput> {
    validate_http_url(url, "action URL")?;

    let request = match args {
        Some(args) => client.post(url).json(args),
        None => client.get(url),
    };
    let response = request.send().await?;
    let status = response.status();
    let is_json = response
        .headers()
        .get(reqwest::header::CONTENT_TYPE)
        .and_then(|v| v.to_str().ok())
        .is_some_and(|v| v.starts_with("application/json"));
    let bytes = response.bytes().await?;

    if !status.is_success() {
        return Err(anyhow!("{}: {}", status, String::from_utf8_lossy(&bytes)));
    }

    if is_json {
        Ok(CallOutput::Json(serde_json::from_slice(&bytes)?))
    } else {
        Ok(CallOutput::Download(bytes.to_vec()))
    }
}
