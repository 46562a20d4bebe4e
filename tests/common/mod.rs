#![allow(dead_code)]

use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use charles_operator::prelude::*;
use charles_operator::render::Renderer;
use parking_lot::Mutex;

/// Serves fixed manifests per chart and records which charts were rendered.
#[derive(Clone, Default)]
pub struct StaticRenderer {
    charts: Arc<Mutex<HashMap<String, std::result::Result<Vec<DynamicObject>, String>>>>,
    calls: Arc<Mutex<Vec<String>>>,
}

impl StaticRenderer {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_chart(self, chart: &str, manifests: Vec<DynamicObject>) -> Self {
        self.charts.lock().insert(chart.to_string(), Ok(manifests));
        self
    }

    pub fn with_failure(self, chart: &str, message: &str) -> Self {
        self.charts.lock().insert(chart.to_string(), Err(message.to_string()));
        self
    }

    pub fn calls(&self) -> Vec<String> {
        self.calls.lock().clone()
    }
}

#[async_trait]
impl Renderer for StaticRenderer {
    async fn render(&self, chart: &str) -> Result<Vec<DynamicObject>> {
        self.calls.lock().push(chart.to_string());
        match self.charts.lock().get(chart) {
            Some(Ok(manifests)) => Ok(manifests.clone()),
            Some(Err(message)) => Err(Error::render(chart, message.clone())),
            None => Err(Error::render(chart, "unknown chart")),
        }
    }
}

pub fn parent(namespace: &str, name: &str, components: &[(&str, &str)]) -> CharlesDeployment {
    let mut parent = CharlesDeployment::new(
        name,
        CharlesDeploymentSpec {
            components: components
                .iter()
                .map(|(name, chart)| Component::new(*name, *chart))
                .collect(),
        },
    );
    parent.metadata.namespace = Some(namespace.to_string());
    parent
}

pub fn deployment(name: &str) -> DynamicObject {
    serde_json::from_value(serde_json::json!({
        "apiVersion": "apps/v1",
        "kind": "Deployment",
        "metadata": { "name": name },
        "spec": {
            "selector": { "matchLabels": { "app": name } },
            "template": {
                "metadata": { "labels": { "app": name } },
                "spec": { "containers": [{ "name": name, "image": "nginx:1.27" }] }
            }
        }
    }))
    .unwrap()
}

pub fn service(name: &str) -> DynamicObject {
    serde_json::from_value(serde_json::json!({
        "apiVersion": "v1",
        "kind": "Service",
        "metadata": { "name": name },
        "spec": { "ports": [{ "port": 80 }] }
    }))
    .unwrap()
}

pub async fn eventually<F, Fut>(mut check: F)
where
    F: FnMut() -> Fut,
    Fut: Future<Output = bool>,
{
    tokio::time::timeout(Duration::from_secs(5), async {
        while !check().await {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .expect("condition not reached within 5s");
}
