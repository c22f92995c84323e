//! External service clients
//!
//! The engine's only external collaborator is the datapoint store: action
//! outputs and uploaded workflow files are promoted to datapoints and
//! referenced by id everywhere else. `DataClient` talks to a remote data
//! server when one is configured and otherwise keeps datapoints in-process,
//! so a workcell can run standalone and tests need no network.

use std::collections::HashMap;
use std::path::PathBuf;

use anyhow::{anyhow, Context, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::RwLock;

use crate::types::{new_ulid, Ownership};

/// A stored value or file produced by an action.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Datapoint {
    #[serde(default = "new_ulid")]
    pub datapoint_id: String,
    pub label: String,
    /// "value" or "file".
    pub data_type: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub value: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub path: Option<String>,
    #[serde(default)]
    pub ownership: Ownership,
    pub created_at: DateTime<Utc>,
}

impl Datapoint {
    pub fn value_datapoint(label: impl Into<String>, value: Value, ownership: Ownership) -> Self {
        Self {
            datapoint_id: new_ulid(),
            label: label.into(),
            data_type: "value".to_string(),
            value: Some(value),
            path: None,
            ownership,
            created_at: Utc::now(),
        }
    }

    pub fn file_datapoint(
        label: impl Into<String>,
        path: impl Into<String>,
        ownership: Ownership,
    ) -> Self {
        Self {
            datapoint_id: new_ulid(),
            label: label.into(),
            data_type: "file".to_string(),
            value: None,
            path: Some(path.into()),
            ownership,
            created_at: Utc::now(),
        }
    }
}

enum DataBackend {
    Remote {
        http: reqwest::Client,
        base_url: String,
    },
    Local {
        datapoints: RwLock<HashMap<String, Datapoint>>,
        staging_dir: PathBuf,
    },
}

pub struct DataClient {
    backend: DataBackend,
}

impl DataClient {
    /// Remote client against a data server.
    pub fn remote(base_url: impl Into<String>, http: reqwest::Client) -> Self {
        Self {
            backend: DataBackend::Remote {
                http,
                base_url: base_url.into().trim_end_matches('/').to_string(),
            },
        }
    }

    /// In-process store; files are staged under `staging_dir`.
    pub fn local(staging_dir: PathBuf) -> Self {
        Self {
            backend: DataBackend::Local {
                datapoints: RwLock::new(HashMap::new()),
                staging_dir,
            },
        }
    }

    /// Submit a datapoint; returns its id.
    pub async fn submit_datapoint(&self, datapoint: Datapoint) -> Result<String> {
        match &self.backend {
            DataBackend::Remote { http, base_url } => {
                let response = http
                    .post(format!("{}/datapoint", base_url))
                    .json(&datapoint)
                    .send()
                    .await
                    .context("Failed to submit datapoint")?
                    .error_for_status()
                    .context("Datapoint submission rejected")?;
                let body: Value = response
                    .json()
                    .await
                    .context("Failed to parse datapoint response")?;
                body.get("datapoint_id")
                    .and_then(|v| v.as_str())
                    .map(|s| s.to_string())
                    .ok_or_else(|| anyhow!("datapoint response missing datapoint_id"))
            }
            DataBackend::Local { datapoints, .. } => {
                let id = datapoint.datapoint_id.clone();
                datapoints.write().await.insert(id.clone(), datapoint);
                Ok(id)
            }
        }
    }

    pub async fn get_datapoint(&self, datapoint_id: &str) -> Result<Datapoint> {
        match &self.backend {
            DataBackend::Remote { http, base_url } => http
                .get(format!("{}/datapoint/{}", base_url, datapoint_id))
                .send()
                .await
                .context("Failed to fetch datapoint")?
                .error_for_status()
                .context("Datapoint fetch rejected")?
                .json()
                .await
                .context("Failed to parse datapoint"),
            DataBackend::Local { datapoints, .. } => datapoints
                .read()
                .await
                .get(datapoint_id)
                .cloned()
                .ok_or_else(|| anyhow!("no datapoint {}", datapoint_id)),
        }
    }

    /// Stage an uploaded workflow file and submit it as a file datapoint.
    pub async fn stage_file(
        &self,
        label: &str,
        file_name: &str,
        bytes: &[u8],
        ownership: Ownership,
    ) -> Result<String> {
        let dir = match &self.backend {
            DataBackend::Local { staging_dir, .. } => staging_dir.clone(),
            DataBackend::Remote { .. } => std::env::temp_dir().join("workcelld-staging"),
        };
        let file_dir = dir.join(new_ulid());
        tokio::fs::create_dir_all(&file_dir)
            .await
            .context("Failed to create staging directory")?;
        let path = file_dir.join(file_name);
        tokio::fs::write(&path, bytes)
            .await
            .context("Failed to stage uploaded file")?;

        self.submit_datapoint(Datapoint::file_datapoint(
            label,
            path.to_string_lossy().to_string(),
            ownership,
        ))
        .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[tokio::test]
    async fn local_round_trip() {
        let client = DataClient::local(std::env::temp_dir().join("workcelld-test-staging"));
        let id = client
            .submit_datapoint(Datapoint::value_datapoint(
                "absorbance",
                json!(0.42),
                Ownership::default(),
            ))
            .await
            .unwrap();

        let datapoint = client.get_datapoint(&id).await.unwrap();
        assert_eq!(datapoint.label, "absorbance");
        assert_eq!(datapoint.value, Some(json!(0.42)));
        assert_eq!(datapoint.data_type, "value");
    }

    #[tokio::test]
    async fn missing_datapoint_errors() {
        let client = DataClient::local(std::env::temp_dir().join("workcelld-test-staging"));
        assert!(client.get_datapoint("nope").await.is_err());
    }
}
