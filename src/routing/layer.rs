//! Semantic route layer
//!
//! A layer holds named routes, each described by example utterances. A query
//! is routed by comparing its embedding with every utterance embedding: the
//! `top_k` nearest utterances vote for their routes by summed similarity,
//! and the winning route is accepted only if its best single similarity
//! reaches the route's threshold.

use crate::core::config::RouterConfig;
use crate::routing::RouterError;
use crate::routing::encoder::{Encoder, cosine_similarity};
use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::collections::HashSet;
use std::path::Path;
use std::sync::Arc;
use tracing::{debug, info};

/// Threshold grid resolution used by `fit`
const THRESHOLD_STEPS: u32 = 100;

/// A named route and its example utterances
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Route {
    pub name: String,
    pub utterances: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub score_threshold: Option<f32>,
}

/// Embedding of one utterance, cached in layer files
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IndexEntry {
    pub route: String,
    pub utterance: String,
    pub vector: Vec<f32>,
}

/// On-disk representation of a route layer
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LayerFile {
    #[serde(default)]
    pub encoder_type: Option<String>,
    #[serde(default)]
    pub encoder_name: Option<String>,
    pub routes: Vec<Route>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub embeddings: Option<Vec<IndexEntry>>,
}

impl LayerFile {
    pub fn from_path<P: AsRef<Path>>(path: P) -> Result<Self, RouterError> {
        let content = std::fs::read_to_string(path)?;
        Ok(serde_json::from_str(&content)?)
    }
}

/// Result of classifying a query
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RouteChoice {
    /// Route name, `None` when no route passed its threshold
    pub name: Option<String>,
    /// Best similarity of the winning candidate route
    pub score: Option<f32>,
}

/// An utterance with its expected route, for evaluation and fitting
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct LabeledUtterance {
    pub utterance: String,
    #[serde(default)]
    pub route: Option<String>,
}

/// Outcome of threshold fitting
#[derive(Debug, Clone, Serialize)]
pub struct FitReport {
    pub accuracy_before: f32,
    pub accuracy_after: f32,
    pub thresholds: Vec<(String, f32)>,
}

/// Routes with their utterance index, ready to classify queries
pub struct RouteLayer {
    encoder: Arc<dyn Encoder>,
    routes: Vec<Route>,
    /// Route position for every index entry
    index_routes: Vec<usize>,
    index: Vec<IndexEntry>,
    top_k: usize,
    default_threshold: f32,
}

impl RouteLayer {
    /// Build a layer, encoding every utterance
    pub async fn new(
        encoder: Arc<dyn Encoder>,
        routes: Vec<Route>,
        top_k: usize,
        threshold: Option<f32>,
    ) -> Result<Self, RouterError> {
        let file = LayerFile {
            encoder_type: None,
            encoder_name: None,
            routes,
            embeddings: None,
        };
        Self::from_layer_file(file, encoder, top_k, threshold).await
    }

    /// Build a layer from a layer file
    ///
    /// Cached embeddings are reused when they were produced by the same
    /// encoder and cover exactly the file's utterances; otherwise all
    /// utterances are re-encoded.
    pub async fn from_layer_file(
        file: LayerFile,
        encoder: Arc<dyn Encoder>,
        top_k: usize,
        threshold: Option<f32>,
    ) -> Result<Self, RouterError> {
        validate_routes(&file.routes)?;
        if top_k == 0 {
            return Err(RouterError::InvalidLayer("top_k must be at least 1".to_string()));
        }

        let expected: Vec<(&str, &str)> = file
            .routes
            .iter()
            .flat_map(|r| r.utterances.iter().map(move |u| (r.name.as_str(), u.as_str())))
            .collect();

        let same_encoder = file.encoder_name.as_deref() == Some(encoder.name())
            && file.encoder_type.as_deref() == Some(encoder.kind().as_str());

        let cached = file.embeddings.as_ref().filter(|index| {
            same_encoder
                && index.len() == expected.len()
                && index
                    .iter()
                    .zip(&expected)
                    .all(|(e, (route, utterance))| e.route == *route && e.utterance == *utterance)
        });

        let index = match cached {
            Some(index) => {
                info!("Using {} cached utterance embeddings", index.len());
                index.clone()
            }
            None => {
                info!(
                    "Encoding {} utterances with {}",
                    expected.len(),
                    encoder.name()
                );
                let docs: Vec<String> = expected.iter().map(|(_, u)| u.to_string()).collect();
                let vectors = encoder.encode(&docs).await?;
                if vectors.len() != docs.len() {
                    return Err(RouterError::InvalidLayer(format!(
                        "encoder returned {} vectors for {} utterances",
                        vectors.len(),
                        docs.len()
                    )));
                }
                expected
                    .iter()
                    .zip(vectors)
                    .map(|((route, utterance), vector)| IndexEntry {
                        route: route.to_string(),
                        utterance: utterance.to_string(),
                        vector,
                    })
                    .collect()
            }
        };

        let index_routes = index
            .iter()
            .map(|e| {
                file.routes
                    .iter()
                    .position(|r| r.name == e.route)
                    .unwrap_or_default()
            })
            .collect();

        let default_threshold = threshold.unwrap_or_else(|| encoder.default_threshold());

        Ok(Self {
            encoder,
            routes: file.routes,
            index_routes,
            index,
            top_k,
            default_threshold,
        })
    }

    /// Load a layer file from disk
    pub async fn from_file<P: AsRef<Path>>(
        path: P,
        encoder: Arc<dyn Encoder>,
        top_k: usize,
        threshold: Option<f32>,
    ) -> Result<Self, RouterError> {
        let file = LayerFile::from_path(path)?;
        Self::from_layer_file(file, encoder, top_k, threshold).await
    }

    /// Load the layer named by the router configuration
    pub async fn from_config(
        config: &RouterConfig,
        encoder: Arc<dyn Encoder>,
    ) -> Result<Self, RouterError> {
        Self::from_file(&config.layer_path, encoder, config.top_k, config.score_threshold).await
    }

    pub fn to_layer_file(&self) -> LayerFile {
        LayerFile {
            encoder_type: Some(self.encoder.kind().as_str().to_string()),
            encoder_name: Some(self.encoder.name().to_string()),
            routes: self.routes.clone(),
            embeddings: Some(self.index.clone()),
        }
    }

    /// Write the layer, including embeddings, as pretty JSON
    pub fn save<P: AsRef<Path>>(&self, path: P) -> Result<(), RouterError> {
        let path = path.as_ref();
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent)?;
        }
        let json = serde_json::to_string_pretty(&self.to_layer_file())?;
        std::fs::write(path, json)?;
        Ok(())
    }

    pub fn routes(&self) -> &[Route] {
        &self.routes
    }

    pub fn encoder_name(&self) -> &str {
        self.encoder.name()
    }

    fn threshold_of(&self, route_idx: usize) -> f32 {
        self.routes[route_idx]
            .score_threshold
            .unwrap_or(self.default_threshold)
    }

    /// Threshold applied to a route, `None` for unknown routes
    pub fn threshold_for(&self, route: &str) -> Option<f32> {
        self.routes
            .iter()
            .position(|r| r.name == route)
            .map(|idx| self.threshold_of(idx))
    }

    /// Winning route and its best similarity, before thresholding
    fn top_route(&self, vector: &[f32]) -> Option<(usize, f32)> {
        let mut scored: Vec<(usize, f32)> = self
            .index
            .iter()
            .zip(&self.index_routes)
            .map(|(entry, route_idx)| (*route_idx, cosine_similarity(vector, &entry.vector)))
            .collect();
        scored.sort_by(|a, b| b.1.partial_cmp(&a.1).unwrap_or(Ordering::Equal));
        scored.truncate(self.top_k);

        // (route, summed score, best score), in order of first appearance
        let mut totals: Vec<(usize, f32, f32)> = Vec::new();
        for (route_idx, score) in scored {
            match totals.iter_mut().find(|(r, _, _)| *r == route_idx) {
                Some(total) => {
                    total.1 += score;
                    total.2 = total.2.max(score);
                }
                None => totals.push((route_idx, score, score)),
            }
        }

        totals
            .into_iter()
            .fold(None, |best: Option<(usize, f32, f32)>, candidate| match best {
                Some(b) if b.1 >= candidate.1 => Some(b),
                _ => Some(candidate),
            })
            .map(|(route_idx, _, best)| (route_idx, best))
    }

    fn passes(&self, top: Option<(usize, f32)>, thresholds: &[f32]) -> Option<usize> {
        top.filter(|(route_idx, score)| *score >= thresholds[*route_idx])
            .map(|(route_idx, _)| route_idx)
    }

    fn current_thresholds(&self) -> Vec<f32> {
        (0..self.routes.len()).map(|i| self.threshold_of(i)).collect()
    }

    /// Classify an already-encoded query
    pub fn classify_vector(&self, vector: &[f32]) -> RouteChoice {
        let top = self.top_route(vector);
        let passed = self.passes(top, &self.current_thresholds());
        RouteChoice {
            name: passed.map(|idx| self.routes[idx].name.clone()),
            score: top.map(|(_, score)| score),
        }
    }

    /// Classify a user query
    pub async fn classify(&self, query: &str) -> Result<RouteChoice, RouterError> {
        let vectors = self.encoder.encode(&[query.to_string()]).await?;
        let vector = vectors
            .into_iter()
            .next()
            .ok_or_else(|| RouterError::InvalidLayer("encoder returned no vector".to_string()))?;
        let choice = self.classify_vector(&vector);
        debug!("Query classified: {:?}", choice);
        Ok(choice)
    }

    /// Encode samples once, pairing each winner with its expected route
    async fn prepare(
        &self,
        samples: &[LabeledUtterance],
    ) -> Result<Vec<(Option<(usize, f32)>, Option<usize>)>, RouterError> {
        if samples.is_empty() {
            return Err(RouterError::InvalidLayer("no labelled samples".to_string()));
        }

        let mut labels = Vec::with_capacity(samples.len());
        for sample in samples {
            let label = match &sample.route {
                Some(name) => Some(
                    self.routes
                        .iter()
                        .position(|r| &r.name == name)
                        .ok_or_else(|| {
                            RouterError::InvalidLayer(format!("unknown route in samples: {}", name))
                        })?,
                ),
                None => None,
            };
            labels.push(label);
        }

        let docs: Vec<String> = samples.iter().map(|s| s.utterance.clone()).collect();
        let vectors = self.encoder.encode(&docs).await?;

        Ok(vectors
            .iter()
            .map(|v| self.top_route(v))
            .zip(labels)
            .collect())
    }

    fn accuracy(
        &self,
        prepared: &[(Option<(usize, f32)>, Option<usize>)],
        thresholds: &[f32],
    ) -> f32 {
        let correct = prepared
            .iter()
            .filter(|(top, label)| self.passes(*top, thresholds) == *label)
            .count();
        correct as f32 / prepared.len() as f32
    }

    /// Share of samples routed to their expected route
    pub async fn evaluate(&self, samples: &[LabeledUtterance]) -> Result<f32, RouterError> {
        let prepared = self.prepare(samples).await?;
        Ok(self.accuracy(&prepared, &self.current_thresholds()))
    }

    /// Optimise per-route thresholds on labelled samples
    ///
    /// Coordinate search on a 0.01 grid: each route's threshold moves to the
    /// value that most improves accuracy, repeated until a pass changes
    /// nothing or `max_iter` passes have run.
    pub async fn fit(
        &mut self,
        samples: &[LabeledUtterance],
        max_iter: usize,
    ) -> Result<FitReport, RouterError> {
        let prepared = self.prepare(samples).await?;
        let mut thresholds = self.current_thresholds();
        let accuracy_before = self.accuracy(&prepared, &thresholds);
        let mut best = accuracy_before;

        for pass in 0..max_iter {
            let mut improved = false;
            for route_idx in 0..self.routes.len() {
                for step in 0..=THRESHOLD_STEPS {
                    let candidate = step as f32 / THRESHOLD_STEPS as f32;
                    let previous = thresholds[route_idx];
                    thresholds[route_idx] = candidate;
                    let accuracy = self.accuracy(&prepared, &thresholds);
                    if accuracy > best {
                        best = accuracy;
                        improved = true;
                    } else {
                        thresholds[route_idx] = previous;
                    }
                }
            }
            debug!("Fit pass {}: accuracy {:.3}", pass + 1, best);
            if !improved {
                break;
            }
        }

        for (route, threshold) in self.routes.iter_mut().zip(&thresholds) {
            route.score_threshold = Some(*threshold);
        }

        Ok(FitReport {
            accuracy_before,
            accuracy_after: best,
            thresholds: self
                .routes
                .iter()
                .map(|r| (r.name.clone(), r.score_threshold.unwrap_or(self.default_threshold)))
                .collect(),
        })
    }
}

fn validate_routes(routes: &[Route]) -> Result<(), RouterError> {
    if routes.is_empty() {
        return Err(RouterError::InvalidLayer("layer has no routes".to_string()));
    }

    let mut seen = HashSet::new();
    for route in routes {
        if route.name.trim().is_empty() {
            return Err(RouterError::InvalidLayer("route without a name".to_string()));
        }
        if !seen.insert(route.name.as_str()) {
            return Err(RouterError::InvalidLayer(format!(
                "duplicate route: {}",
                route.name
            )));
        }
        if route.utterances.is_empty() {
            return Err(RouterError::InvalidLayer(format!(
                "route {} has no utterances",
                route.name
            )));
        }
        if let Some(threshold) = route.score_threshold {
            if !(0.0..=1.0).contains(&threshold) {
                return Err(RouterError::InvalidLayer(format!(
                    "route {} threshold out of range",
                    route.name
                )));
            }
        }
    }
    Ok(())
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::routing::encoder::HashingEncoder;
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicUsize, Ordering as AtomicOrdering};

    pub(crate) fn sample_routes() -> Vec<Route> {
        vec![
            Route {
                name: "image-generation".to_string(),
                utterances: vec![
                    "generate an image of a cat".to_string(),
                    "draw a picture of a castle".to_string(),
                    "create an image of a sunset over the ocean".to_string(),
                ],
                description: None,
                score_threshold: None,
            },
            Route {
                name: "vision-image-processing".to_string(),
                utterances: vec![
                    "what is in this image".to_string(),
                    "describe this picture".to_string(),
                    "explain this photo to me".to_string(),
                ],
                description: None,
                score_threshold: None,
            },
            Route {
                name: "casual-conversation".to_string(),
                utterances: vec![
                    "hello how are you".to_string(),
                    "how is your day going".to_string(),
                    "nice to meet you".to_string(),
                ],
                description: None,
                score_threshold: None,
            },
        ]
    }

    /// Hashing encoder that counts how many texts it encoded
    struct CountingEncoder {
        inner: HashingEncoder,
        encoded: AtomicUsize,
    }

    #[async_trait]
    impl Encoder for CountingEncoder {
        fn kind(&self) -> crate::core::config::EncoderKind {
            self.inner.kind()
        }

        fn name(&self) -> &str {
            self.inner.name()
        }

        fn default_threshold(&self) -> f32 {
            self.inner.default_threshold()
        }

        async fn encode(&self, docs: &[String]) -> Result<Vec<Vec<f32>>, RouterError> {
            self.encoded.fetch_add(docs.len(), AtomicOrdering::SeqCst);
            self.inner.encode(docs).await
        }
    }

    pub(crate) async fn hashing_layer() -> RouteLayer {
        RouteLayer::new(Arc::new(HashingEncoder::new()), sample_routes(), 5, None)
            .await
            .unwrap()
    }

    #[tokio::test]
    async fn test_classifies_matching_route() {
        let layer = hashing_layer().await;
        let choice = layer
            .classify("please generate an image of a dragon")
            .await
            .unwrap();
        assert_eq!(choice.name.as_deref(), Some("image-generation"));
        assert!(choice.score.unwrap() > 0.3);

        let choice = layer.classify("hello how are you today").await.unwrap();
        assert_eq!(choice.name.as_deref(), Some("casual-conversation"));
    }

    #[tokio::test]
    async fn test_unrelated_query_has_no_route() {
        let layer = hashing_layer().await;
        let choice = layer
            .classify("quantum chromodynamics lattice simulations")
            .await
            .unwrap();
        assert_eq!(choice.name, None);
    }

    #[tokio::test]
    async fn test_route_threshold_overrides_default() {
        let mut routes = sample_routes();
        routes[0].score_threshold = Some(0.99);
        let layer = RouteLayer::new(Arc::new(HashingEncoder::new()), routes, 5, None)
            .await
            .unwrap();
        let choice = layer
            .classify("please generate an image of a dragon")
            .await
            .unwrap();
        assert_eq!(choice.name, None);
        assert!(choice.score.is_some());
        assert_eq!(layer.threshold_for("image-generation"), Some(0.99));
        assert_eq!(layer.threshold_for("casual-conversation"), Some(0.3));
        assert_eq!(layer.threshold_for("missing"), None);
    }

    #[test]
    fn test_summed_votes_beat_single_best_match() {
        // One very close "b" utterance loses to two fairly close "a" ones
        let layer = RouteLayer {
            encoder: Arc::new(HashingEncoder::with_dimensions(2)),
            routes: vec![
                Route {
                    name: "a".to_string(),
                    utterances: vec!["a1".to_string(), "a2".to_string()],
                    description: None,
                    score_threshold: Some(0.1),
                },
                Route {
                    name: "b".to_string(),
                    utterances: vec!["b1".to_string()],
                    description: None,
                    score_threshold: Some(0.1),
                },
            ],
            index_routes: vec![0, 0, 1],
            index: vec![
                IndexEntry {
                    route: "a".to_string(),
                    utterance: "a1".to_string(),
                    vector: vec![0.8, 0.6],
                },
                IndexEntry {
                    route: "a".to_string(),
                    utterance: "a2".to_string(),
                    vector: vec![0.8, 0.6],
                },
                IndexEntry {
                    route: "b".to_string(),
                    utterance: "b1".to_string(),
                    vector: vec![1.0, 0.0],
                },
            ],
            top_k: 3,
            default_threshold: 0.5,
        };
        let choice = layer.classify_vector(&[1.0, 0.0]);
        assert_eq!(choice.name.as_deref(), Some("a"));
        assert!((choice.score.unwrap() - 0.8).abs() < 1e-6);
    }

    #[tokio::test]
    async fn test_rejects_invalid_routes() {
        let encoder: Arc<dyn Encoder> = Arc::new(HashingEncoder::new());
        let mut duplicate = sample_routes();
        duplicate[2].name = "image-generation".to_string();
        assert!(matches!(
            RouteLayer::new(encoder.clone(), duplicate, 5, None).await,
            Err(RouterError::InvalidLayer(_))
        ));

        let mut empty = sample_routes();
        empty[0].utterances.clear();
        assert!(RouteLayer::new(encoder.clone(), empty, 5, None).await.is_err());
        assert!(RouteLayer::new(encoder, vec![], 5, None).await.is_err());
    }

    #[tokio::test]
    async fn test_save_and_reload_reuses_embeddings() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("layers").join("layer.json");
        hashing_layer().await.save(&path).unwrap();

        let encoder = Arc::new(CountingEncoder {
            inner: HashingEncoder::new(),
            encoded: AtomicUsize::new(0),
        });
        let layer = RouteLayer::from_file(&path, encoder.clone(), 5, None).await.unwrap();
        assert_eq!(encoder.encoded.load(AtomicOrdering::SeqCst), 0);
        assert_eq!(layer.routes().len(), 3);
    }

    #[tokio::test]
    async fn test_stale_embeddings_are_recomputed() {
        let mut file = hashing_layer().await.to_layer_file();
        file.routes[0].utterances.push("paint a portrait".to_string());

        let encoder = Arc::new(CountingEncoder {
            inner: HashingEncoder::new(),
            encoded: AtomicUsize::new(0),
        });
        RouteLayer::from_layer_file(file, encoder.clone(), 5, None)
            .await
            .unwrap();
        assert_eq!(encoder.encoded.load(AtomicOrdering::SeqCst), 10);
    }

    #[tokio::test]
    async fn test_fit_improves_accuracy() {
        let mut routes = sample_routes();
        // Unreachable thresholds: nothing is routed before fitting
        for route in routes.iter_mut() {
            route.score_threshold = Some(1.0);
        }
        let mut layer = RouteLayer::new(Arc::new(HashingEncoder::new()), routes, 5, None)
            .await
            .unwrap();

        let samples = vec![
            LabeledUtterance {
                utterance: "generate an image of a dog".to_string(),
                route: Some("image-generation".to_string()),
            },
            LabeledUtterance {
                utterance: "draw a picture of a tree".to_string(),
                route: Some("image-generation".to_string()),
            },
            LabeledUtterance {
                utterance: "hello how are you doing".to_string(),
                route: Some("casual-conversation".to_string()),
            },
        ];

        let before = layer.evaluate(&samples).await.unwrap();
        assert_eq!(before, 0.0);

        let report = layer.fit(&samples, 10).await.unwrap();
        assert_eq!(report.accuracy_before, 0.0);
        assert_eq!(report.accuracy_after, 1.0);
        assert_eq!(layer.evaluate(&samples).await.unwrap(), 1.0);
        let threshold = |name: &str| {
            report
                .thresholds
                .iter()
                .find(|(route, _)| route == name)
                .map(|(_, t)| *t)
                .unwrap()
        };
        assert!(threshold("image-generation") < 1.0);
        assert!(threshold("casual-conversation") < 1.0);
        // No sample exercises vision, so its threshold is left alone
        assert_eq!(threshold("vision-image-processing"), 1.0);
    }

    #[tokio::test]
    async fn test_fit_rejects_unknown_labels() {
        let mut layer = hashing_layer().await;
        let samples = vec![LabeledUtterance {
            utterance: "hi".to_string(),
            route: Some("weather".to_string()),
        }];
        assert!(layer.fit(&samples, 5).await.is_err());
        assert!(layer.evaluate(&[]).await.is_err());
    }

    #[tokio::test]
    async fn test_shipped_layer_loads() {
        let file: LayerFile =
            serde_json::from_str(include_str!("../../router/semantic_route_layers.json")).unwrap();
        assert!(file.embeddings.is_none());

        let layer = RouteLayer::from_layer_file(file, Arc::new(HashingEncoder::new()), 5, None)
            .await
            .unwrap();
        let names: Vec<&str> = layer.routes().iter().map(|r| r.name.as_str()).collect();
        for name in [
            "text-processing",
            "vision-image-processing",
            "casual-conversation",
            "image-generation",
            "curious",
        ] {
            assert!(names.contains(&name), "missing route {}", name);
        }

        let choice = layer.classify("draw a picture of a castle").await.unwrap();
        assert_eq!(choice.name.as_deref(), Some("image-generation"));
    }
}
