use std::path::Path;

use reqwest::header::{HeaderMap, HeaderValue, ACCEPT, AUTHORIZATION};
use reqwest::Method;
use serde_json::Value;
use thiserror::Error;
use tracing::info;

use crate::http_client::{HttpClient, HttpError};
use crate::job::DownloadedFile;

const PAGE_CAP: u32 = 10;
const PAGE_SIZE: u32 = 100;

#[derive(Error, Debug)]
pub enum SearchError {
    #[error(transparent)]
    Http(#[from] HttpError),
    #[error("failed to write {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },
}

/// Alternate fetch path used when bulk export is unsupported or too large:
/// paginated FHIR search per resource type, capped at 10 pages
/// (≤ 1000 records per type at `_count=100`) even when a `next` link keeps
/// offering more.
pub async fn run(
    http: &HttpClient,
    job_dir: &Path,
    fhir_server_url: &str,
    resource_types: &[String],
    since: Option<&str>,
    auth_header: &HeaderValue,
) -> Result<Vec<DownloadedFile>, SearchError> {
    tokio::fs::create_dir_all(job_dir)
        .await
        .map_err(|source| SearchError::Io {
            path: job_dir.display().to_string(),
            source,
        })?;

    let mut files = Vec::new();
    for resource_type in resource_types {
        let records = fetch_all_pages(http, fhir_server_url, resource_type, since, auth_header).await?;
        let local_path = job_dir.join(format!("{resource_type}.ndjson"));

        let mut body = String::new();
        for record in &records {
            body.push_str(&record.to_string());
            body.push('\n');
        }
        tokio::fs::write(&local_path, body.as_bytes())
            .await
            .map_err(|source| SearchError::Io {
                path: local_path.display().to_string(),
                source,
            })?;

        files.push(DownloadedFile {
            resource_type: resource_type.clone(),
            local_path: local_path.display().to_string(),
            size_bytes: body.len() as u64,
        });
    }

    Ok(files)
}

async fn fetch_all_pages(
    http: &HttpClient,
    fhir_server_url: &str,
    resource_type: &str,
    since: Option<&str>,
    auth_header: &HeaderValue,
) -> Result<Vec<Value>, SearchError> {
    let mut url = format!(
        "{}/{}?_count={}",
        fhir_server_url.trim_end_matches('/'),
        resource_type,
        PAGE_SIZE
    );
    if let Some(since) = since {
        url.push_str(&format!("&_lastUpdated=ge{since}"));
    }

    let mut records = Vec::new();
    let mut page = 0;
    let mut next_url = Some(url);

    while let Some(current_url) = next_url.take() {
        if page >= PAGE_CAP {
            info!(resource_type, page, "search fallback reached page cap, stopping");
            break;
        }

        let mut headers = HeaderMap::new();
        headers.insert(ACCEPT, HeaderValue::from_static("application/fhir+json"));
        headers.insert(AUTHORIZATION, auth_header.clone());

        let response = http.request(Method::GET, &current_url, headers, None).await?;
        let bundle: Value = response.json().await.map_err(|source| HttpError::Request {
            url: current_url.clone(),
            source,
        })?;

        if let Some(entries) = bundle.get("entry").and_then(Value::as_array) {
            for entry in entries {
                if let Some(resource) = entry.get("resource") {
                    records.push(resource.clone());
                }
            }
        }

        page += 1;
        next_url = bundle
            .get("link")
            .and_then(Value::as_array)
            .and_then(|links| {
                links.iter().find(|link| {
                    link.get("relation").and_then(Value::as_str) == Some("next")
                })
            })
            .and_then(|link| link.get("url").and_then(Value::as_str))
            .map(str::to_string);
    }

    Ok(records)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn page_cap_matches_spec_budget() {
        assert_eq!(PAGE_CAP * PAGE_SIZE, 1000);
    }
}
