//! REST calls the copy, exec and build commands depend on

use crate::config::Config;
use crate::error::CopyError;
use crate::resolve::EndpointStat;
use anyhow::{anyhow, bail, Context, Result};
use bytes::Bytes;
use futures::Stream;
use reqwest::header::{ACCEPT, AUTHORIZATION, CACHE_CONTROL};
use serde::Deserialize;

/// Remote stat result
#[derive(Debug, Clone, Default, Deserialize)]
pub struct PathInfo {
    #[serde(default)]
    pub exists: bool,
    #[serde(default)]
    pub is_dir: bool,
    #[serde(default)]
    pub is_file: bool,
    #[serde(default)]
    pub is_symlink: bool,
    #[serde(default)]
    pub error: Option<String>,
}

impl PathInfo {
    pub fn endpoint(&self) -> EndpointStat {
        EndpointStat {
            exists: self.exists,
            is_dir: self.is_dir,
            is_file: self.is_file,
            is_symlink: self.is_symlink,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct InstanceSummary {
    pub id: String,
    #[serde(default)]
    pub name: String,
}

/// Shorten an ID for display
pub fn truncate_id(id: &str) -> &str {
    match id.char_indices().nth(12) {
        Some((idx, _)) => &id[..idx],
        None => id,
    }
}

/// Resolve an identifier by exact ID, exact name, then unique ID prefix.
pub fn match_instance<'a>(instances: &'a [InstanceSummary], ident: &str) -> Result<&'a str> {
    if let Some(inst) = instances.iter().find(|i| i.id == ident || i.name == ident) {
        return Ok(&inst.id);
    }
    let matches: Vec<&InstanceSummary> = instances
        .iter()
        .filter(|i| i.id.starts_with(ident))
        .collect();
    match matches.as_slice() {
        [] => bail!("no instance found matching {:?}", ident),
        [only] => Ok(&only.id),
        many => {
            let ids: Vec<&str> = many.iter().map(|i| truncate_id(&i.id)).collect();
            bail!(
                "ambiguous instance identifier {:?} matches: {}",
                ident,
                ids.join(", ")
            )
        }
    }
}

pub struct ApiClient {
    http: reqwest::Client,
    config: Config,
}

impl ApiClient {
    pub fn new(config: Config) -> Result<Self> {
        let http = reqwest::Client::builder()
            .user_agent(concat!("hypeman/", env!("CARGO_PKG_VERSION")))
            .build()
            .context("build HTTP client")?;
        Ok(ApiClient { http, config })
    }

    async fn get(&self, path: &str, query: &[(&str, &str)]) -> Result<reqwest::Response> {
        let url = self.config.api_url(path)?;
        let response = self
            .http
            .get(url)
            .query(query)
            .header(AUTHORIZATION, self.config.bearer())
            .send()
            .await
            .with_context(|| format!("GET {}", path))?;
        Ok(response)
    }

    async fn get_json<T: serde::de::DeserializeOwned>(
        &self,
        path: &str,
        query: &[(&str, &str)],
    ) -> Result<T> {
        let response = self.get(path, query).await?;
        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            bail!("GET {} failed (HTTP {}): {}", path, status.as_u16(), body.trim());
        }
        response
            .json::<T>()
            .await
            .with_context(|| format!("decode response from {}", path))
    }

    pub async fn list_instances(&self) -> Result<Vec<InstanceSummary>> {
        self.get_json("/instances", &[])
            .await
            .context("failed to list instances")
    }

    pub async fn resolve_instance(&self, ident: &str) -> Result<String> {
        let instances = self.list_instances().await?;
        match_instance(&instances, ident).map(str::to_string)
    }

    /// Stat a guest path; an `error` reported by the guest fails the call.
    pub async fn stat_path(
        &self,
        instance_id: &str,
        guest_path: &str,
        follow_links: bool,
    ) -> Result<PathInfo> {
        let mut query = vec![("path", guest_path)];
        if follow_links {
            query.push(("follow_links", "true"));
        }
        let info: PathInfo = self
            .get_json(&format!("/instances/{}/stat", instance_id), &query)
            .await
            .context("stat path")?;
        if let Some(err) = info.error.as_deref().filter(|e| !e.is_empty()) {
            bail!("stat path {}: {}", guest_path, err);
        }
        Ok(info)
    }

    /// Stat a pull source; a missing path is an error.
    pub async fn stat_source(
        &self,
        instance_id: &str,
        guest_path: &str,
        follow_links: bool,
    ) -> Result<PathInfo> {
        let info = self
            .stat_path(instance_id, guest_path, follow_links)
            .await
            .context("stat source")?;
        if !info.exists {
            return Err(CopyError::SourceMissing(guest_path.to_string()).into());
        }
        Ok(info)
    }

    /// Open the server-sent event stream for a build.
    pub async fn build_events(
        &self,
        build_id: &str,
    ) -> Result<impl Stream<Item = reqwest::Result<Bytes>>> {
        let path = format!("/builds/{}/events", build_id);
        let url = self.config.api_url(&path)?;
        let response = self
            .http
            .get(url)
            .query(&[("follow", "true")])
            .header(ACCEPT, "text/event-stream")
            .header(CACHE_CONTROL, "no-cache")
            .header(AUTHORIZATION, self.config.bearer())
            .send()
            .await
            .map_err(|e| anyhow!("failed to connect to build events: {}", e))?;
        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            bail!(
                "failed to connect to build events (HTTP {}): {}",
                status.as_u16(),
                body
            );
        }
        Ok(response.bytes_stream())
    }
}
