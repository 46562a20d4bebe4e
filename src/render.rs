use std::collections::HashMap;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use async_trait::async_trait;
use kube::api::DynamicObject;
use parking_lot::Mutex;
use serde::Deserialize;
use tokio::process::Command;
use tracing::debug;

use crate::error::{Error, Result};
use crate::fetch::{fetch_error, SourceFetcher};

/// Turns a component's chart reference into concrete manifests. Must be
/// deterministic for a given chart and free of side effects on the cluster.
#[async_trait]
pub trait Renderer: Send + Sync + 'static {
    async fn render(&self, chart: &str) -> Result<Vec<DynamicObject>>;
}

/// Splits a multi-document YAML stream into objects, skipping empty documents.
pub fn parse_manifests(chart: &str, yaml: &str) -> Result<Vec<DynamicObject>> {
    let mut manifests = Vec::new();
    for document in serde_yaml::Deserializer::from_str(yaml) {
        let value = serde_yaml::Value::deserialize(document)
            .map_err(|e| Error::render(chart, format!("invalid YAML: {}", e)))?;
        if value.is_null() {
            continue;
        }
        let manifest: DynamicObject = serde_yaml::from_value(value)
            .map_err(|e| Error::render(chart, format!("invalid manifest: {}", e)))?;
        manifests.push(manifest);
    }
    Ok(manifests)
}

/// Runs `kustomize build` on a local kustomization directory.
#[derive(Clone, Debug)]
pub struct KustomizeRenderer {
    binary: PathBuf,
}

impl Default for KustomizeRenderer {
    fn default() -> Self {
        Self::new("kustomize")
    }
}

impl KustomizeRenderer {
    pub fn new(binary: impl Into<PathBuf>) -> Self {
        Self { binary: binary.into() }
    }

    pub async fn build(&self, dir: &Path) -> Result<Vec<DynamicObject>> {
        let chart = dir.display().to_string();
        if !dir.is_dir() {
            return Err(Error::Configuration(format!("{} is not a directory", chart)));
        }

        debug!("Running {} build {}", self.binary.display(), chart);
        let output = Command::new(&self.binary)
            .arg("build")
            .arg(dir)
            .output()
            .await
            .map_err(|e| Error::render(&chart, format!("cannot run {}: {}", self.binary.display(), e)))?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(Error::render(
                &chart,
                format!("kustomize exited with {}: {}", output.status, stderr.trim()),
            ));
        }

        let stdout = String::from_utf8(output.stdout)
            .map_err(|e| Error::render(&chart, format!("output is not UTF-8: {}", e)))?;
        parse_manifests(&chart, &stdout)
    }
}

#[async_trait]
impl Renderer for KustomizeRenderer {
    async fn render(&self, chart: &str) -> Result<Vec<DynamicObject>> {
        self.build(Path::new(chart)).await
    }
}

/// Downloads remote charts into a local cache before handing them to kustomize.
/// Charts that are not `http(s)://` URLs are treated as local directories.
///
/// Each render fetches into a fresh staging directory and swaps it in for the
/// previous checkout. Renders of the same chart are serialized from fetch to
/// the end of the build, so kustomize never reads a half-written checkout.
pub struct FetchingRenderer {
    kustomize: KustomizeRenderer,
    fetcher: Arc<dyn SourceFetcher>,
    cache_dir: PathBuf,
    checkouts: Mutex<HashMap<PathBuf, Arc<tokio::sync::Mutex<()>>>>,
}

impl FetchingRenderer {
    pub fn new(kustomize: KustomizeRenderer, fetcher: Arc<dyn SourceFetcher>, cache_dir: impl Into<PathBuf>) -> Self {
        Self {
            kustomize,
            fetcher,
            cache_dir: cache_dir.into(),
            checkouts: Mutex::new(HashMap::new()),
        }
    }

    pub fn checkout_dir(&self, url: &str) -> PathBuf {
        self.cache_dir.join(checkout_name(url))
    }

    fn checkout_lock(&self, dir: &Path) -> Arc<tokio::sync::Mutex<()>> {
        Arc::clone(self.checkouts.lock().entry(dir.to_path_buf()).or_default())
    }

    /// Replaces the checkout at `dir` with a fresh copy of `url` and returns
    /// the kustomization root inside it.
    async fn refresh(&self, url: &str, dir: &Path) -> Result<PathBuf> {
        tokio::fs::create_dir_all(&self.cache_dir)
            .await
            .map_err(fetch_error(self.cache_dir.display()))?;
        let staging = tempfile::Builder::new()
            .prefix(".fetch-")
            .tempdir_in(&self.cache_dir)
            .map_err(fetch_error(self.cache_dir.display()))?;

        let fetched = self.fetcher.fetch(url, staging.path()).await?;
        let root = fetched
            .strip_prefix(staging.path())
            .map_err(|_| Error::Fetch(format!("{} was fetched outside {}", url, staging.path().display())))?
            .to_path_buf();

        match tokio::fs::remove_dir_all(dir).await {
            Ok(()) => {}
            Err(e) if e.kind() == io::ErrorKind::NotFound => {}
            Err(e) => return Err(fetch_error(dir.display())(e)),
        }
        tokio::fs::rename(staging.path(), dir)
            .await
            .map_err(fetch_error(dir.display()))?;
        debug!("Checked out {} into {}", url, dir.display());
        Ok(dir.join(root))
    }
}

#[async_trait]
impl Renderer for FetchingRenderer {
    async fn render(&self, chart: &str) -> Result<Vec<DynamicObject>> {
        if !is_remote(chart) {
            return self.kustomize.build(Path::new(chart)).await;
        }
        let dir = self.checkout_dir(chart);
        let lock = self.checkout_lock(&dir);
        let _checkout = lock.lock().await;
        let root = self.refresh(chart, &dir).await?;
        self.kustomize.build(&root).await
    }
}

pub fn is_remote(chart: &str) -> bool {
    chart.starts_with("https://") || chart.starts_with("http://")
}

fn checkout_name(url: &str) -> String {
    let trimmed = url
        .trim_start_matches("https://")
        .trim_start_matches("http://");
    let trimmed = trimmed.split(['?', '#']).next().unwrap_or_default();
    trimmed
        .chars()
        .map(|c| if c.is_ascii_alphanumeric() || c == '.' || c == '-' { c } else { '_' })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn multi_document_output_is_split_in_order() {
        let yaml = r#"
apiVersion: apps/v1
kind: Deployment
metadata:
  name: web
---
---
apiVersion: v1
kind: Service
metadata:
  name: web
"#;
        let manifests = parse_manifests("./web", yaml).unwrap();
        assert_eq!(manifests.len(), 2);
        assert_eq!(manifests[0].types.as_ref().unwrap().kind, "Deployment");
        assert_eq!(manifests[1].types.as_ref().unwrap().kind, "Service");
    }

    #[test]
    fn garbage_output_is_a_render_error() {
        let err = parse_manifests("./web", "- just\n- a list\n").unwrap_err();
        assert!(matches!(err, Error::Render { .. }));
    }

    #[test]
    fn checkout_names_are_stable_and_flat() {
        let url = "https://api.github.com/repos/acme/charts/contents/web?ref=main";
        assert_eq!(checkout_name(url), checkout_name(url));
        assert_eq!(checkout_name(url), "api.github.com_repos_acme_charts_contents_web");
        assert!(is_remote(url));
        assert!(!is_remote("./charts/web"));
    }

    #[tokio::test]
    async fn missing_directory_is_a_configuration_error() {
        let renderer = KustomizeRenderer::default();
        let err = renderer.render("/definitely/not/here").await.unwrap_err();
        assert!(matches!(err, Error::Configuration(_)));
    }
}
