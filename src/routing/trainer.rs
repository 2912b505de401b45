//! Offline route layer training
//!
//! Encodes route utterances once, optionally fits per-route thresholds on a
//! labelled dataset, and writes the result with cached embeddings.

use crate::routing::RouterError;
use crate::routing::encoder::Encoder;
use crate::routing::layer::{FitReport, LabeledUtterance, LayerFile, Route, RouteLayer};
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::info;

/// Default number of coordinate search passes
pub const DEFAULT_MAX_ITER: usize = 500;

#[derive(Debug, Clone)]
pub struct TrainOptions {
    pub routes_path: PathBuf,
    pub output_path: PathBuf,
    pub dataset_path: Option<PathBuf>,
    pub top_k: usize,
    pub max_iter: usize,
}

/// Route definitions: a full layer file or a bare array of routes
#[derive(Deserialize)]
#[serde(untagged)]
enum RouteSource {
    Layer(LayerFile),
    Routes(Vec<Route>),
}

fn read_routes(path: &Path) -> Result<Vec<Route>, RouterError> {
    let content = std::fs::read_to_string(path)?;
    Ok(match serde_json::from_str(&content)? {
        RouteSource::Layer(file) => file.routes,
        RouteSource::Routes(routes) => routes,
    })
}

fn read_dataset(path: &Path) -> Result<Vec<LabeledUtterance>, RouterError> {
    let content = std::fs::read_to_string(path)?;
    Ok(serde_json::from_str(&content)?)
}

/// Train and save a route layer; returns the fit report when a dataset was given
pub async fn train(
    options: &TrainOptions,
    encoder: Arc<dyn Encoder>,
) -> Result<Option<FitReport>, RouterError> {
    let routes = read_routes(&options.routes_path)?;
    info!(
        "Training {} routes from {} with encoder {}",
        routes.len(),
        options.routes_path.display(),
        encoder.name()
    );

    let mut layer = RouteLayer::new(encoder, routes, options.top_k, None).await?;

    let report = match &options.dataset_path {
        Some(dataset_path) => {
            let samples = read_dataset(dataset_path)?;
            let report = layer.fit(&samples, options.max_iter).await?;
            info!(
                "Fitted thresholds on {} samples: accuracy {:.2}% -> {:.2}%",
                samples.len(),
                report.accuracy_before * 100.0,
                report.accuracy_after * 100.0
            );
            for (route, threshold) in &report.thresholds {
                info!("  {}: {:.2}", route, threshold);
            }
            Some(report)
        }
        None => None,
    };

    layer.save(&options.output_path)?;
    info!("Route layer written to {}", options.output_path.display());
    Ok(report)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::routing::encoder::HashingEncoder;
    use crate::routing::layer::tests::sample_routes;

    fn options(dir: &Path, dataset: Option<PathBuf>) -> TrainOptions {
        TrainOptions {
            routes_path: dir.join("routes.json"),
            output_path: dir.join("out").join("layer.json"),
            dataset_path: dataset,
            top_k: 5,
            max_iter: 20,
        }
    }

    #[tokio::test]
    async fn test_train_from_bare_routes() {
        let dir = tempfile::tempdir().unwrap();
        let opts = options(dir.path(), None);
        std::fs::write(
            &opts.routes_path,
            serde_json::to_string(&sample_routes()).unwrap(),
        )
        .unwrap();

        let report = train(&opts, Arc::new(HashingEncoder::new())).await.unwrap();
        assert!(report.is_none());

        let written = LayerFile::from_path(&opts.output_path).unwrap();
        assert_eq!(written.encoder_type.as_deref(), Some("hashing"));
        assert_eq!(written.encoder_name.as_deref(), Some("hashing-512"));
        assert_eq!(written.routes.len(), 3);
        assert_eq!(written.embeddings.unwrap().len(), 9);
    }

    #[tokio::test]
    async fn test_train_with_dataset_sets_thresholds() {
        let dir = tempfile::tempdir().unwrap();
        let dataset_path = dir.path().join("dataset.json");
        let opts = options(dir.path(), Some(dataset_path.clone()));

        let layer_file = serde_json::json!({
            "encoder_type": "openai",
            "encoder_name": "text-embedding-3-small",
            "routes": sample_routes(),
        });
        std::fs::write(&opts.routes_path, layer_file.to_string()).unwrap();
        std::fs::write(
            &dataset_path,
            r#"[
                {"utterance": "generate an image of a horse", "route": "image-generation"},
                {"utterance": "hello how are you doing", "route": "casual-conversation"},
                {"utterance": "describe this picture for me", "route": "vision-image-processing"}
            ]"#,
        )
        .unwrap();

        let report = train(&opts, Arc::new(HashingEncoder::new()))
            .await
            .unwrap()
            .unwrap();
        assert!(report.accuracy_after >= report.accuracy_before);
        assert_eq!(report.accuracy_after, 1.0);

        let written = LayerFile::from_path(&opts.output_path).unwrap();
        assert!(written.routes.iter().all(|r| r.score_threshold.is_some()));
    }

    #[tokio::test]
    async fn test_missing_routes_file_fails() {
        let dir = tempfile::tempdir().unwrap();
        let opts = options(dir.path(), None);
        let result = train(&opts, Arc::new(HashingEncoder::new())).await;
        assert!(matches!(result, Err(RouterError::Io(_))));
    }
}
