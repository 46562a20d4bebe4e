use std::path::{Component as PathComponent, Path, PathBuf};

use async_trait::async_trait;
use reqwest::header::{ACCEPT, AUTHORIZATION, USER_AGENT};
use serde::Deserialize;
use tracing::{debug, info};

use crate::error::{Error, Result};

/// Copies a remote template source into a local directory.
#[async_trait]
pub trait SourceFetcher: Send + Sync + 'static {
    /// Returns the directory that holds the fetched source.
    async fn fetch(&self, url: &str, dest: &Path) -> Result<PathBuf>;
}

#[derive(Debug, Deserialize)]
struct ContentEntry {
    path: String,
    url: String,
    download_url: Option<String>,
}

/// Reads a repository directory through the GitHub contents API.
#[derive(Clone)]
pub struct GithubFetcher {
    http: reqwest::Client,
    token: Option<String>,
}

impl GithubFetcher {
    pub fn new(token: Option<String>) -> Self {
        Self {
            http: reqwest::Client::new(),
            token,
        }
    }

    fn request(&self, url: &str) -> reqwest::RequestBuilder {
        let request = self
            .http
            .get(url)
            .header(USER_AGENT, concat!("charles-operator/", env!("CARGO_PKG_VERSION")))
            .header(ACCEPT, "application/vnd.github+json");
        match &self.token {
            Some(token) => request.header(AUTHORIZATION, format!("token {}", token)),
            None => request,
        }
    }

    async fn list(&self, url: &str) -> Result<Vec<ContentEntry>> {
        let response = self.request(url).send().await.map_err(fetch_error(url))?;
        if !response.status().is_success() {
            return Err(Error::Fetch(format!("{} answered {}", url, response.status())));
        }
        let body = response.text().await.map_err(fetch_error(url))?;
        serde_json::from_str(&body)
            .map_err(|e| Error::Fetch(format!("{} is not a directory listing: {}", url, e)))
    }

    async fn download(&self, url: &str, target: &Path) -> Result<()> {
        debug!("Downloading {} to {}", url, target.display());
        let response = self.request(url).send().await.map_err(fetch_error(url))?;
        if !response.status().is_success() {
            return Err(Error::Fetch(format!("{} answered {}", url, response.status())));
        }
        let bytes = response.bytes().await.map_err(fetch_error(url))?;
        if let Some(dir) = target.parent() {
            tokio::fs::create_dir_all(dir)
                .await
                .map_err(fetch_error(dir.display()))?;
        }
        tokio::fs::write(target, &bytes)
            .await
            .map_err(fetch_error(target.display()))?;
        Ok(())
    }
}

#[async_trait]
impl SourceFetcher for GithubFetcher {
    async fn fetch(&self, url: &str, dest: &Path) -> Result<PathBuf> {
        info!("Fetching template source {}", url);
        tokio::fs::create_dir_all(dest)
            .await
            .map_err(fetch_error(dest.display()))?;

        let mut base: Option<String> = None;
        let mut pending = vec![url.to_string()];
        let mut files = 0usize;

        while let Some(listing) = pending.pop() {
            for entry in self.list(&listing).await? {
                let root = base.get_or_insert_with(|| parent_path(&entry.path).to_string());
                match entry.download_url {
                    Some(download_url) => {
                        let relative = relative_path(root, &entry.path)?;
                        self.download(&download_url, &dest.join(relative)).await?;
                        files += 1;
                    }
                    None => pending.push(entry.url),
                }
            }
        }

        debug!("Fetched {} files from {}", files, url);
        Ok(dest.to_path_buf())
    }
}

pub(crate) fn fetch_error<E: std::fmt::Display>(what: impl std::fmt::Display) -> impl FnOnce(E) -> Error {
    move |e| Error::Fetch(format!("{}: {}", what, e))
}

fn parent_path(path: &str) -> &str {
    path.rsplit_once('/').map_or("", |(parent, _)| parent)
}

fn relative_path(base: &str, path: &str) -> Result<PathBuf> {
    let stripped = if base.is_empty() {
        path
    } else {
        path.strip_prefix(base)
            .and_then(|p| p.strip_prefix('/'))
            .ok_or_else(|| Error::Fetch(format!("{} lies outside {}", path, base)))?
    };
    let relative = PathBuf::from(stripped);
    let escapes = relative
        .components()
        .any(|c| !matches!(c, PathComponent::Normal(_)));
    if escapes || stripped.is_empty() {
        return Err(Error::Fetch(format!("refusing to write {}", path)));
    }
    Ok(relative)
}
