//! Multivariate outlier scoring.
//!
//! The engine only depends on the `AnomalyModel` contract: a real-valued
//! score where lower means more abnormal, plus a per-feature attribution.
//! Models are trained elsewhere and installed at runtime; the default
//! implementation is an isolation forest fitted on a reference population.

use std::sync::Arc;

use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use smallvec::SmallVec;
use tracing::info;

use crate::algo::IsolationForest;
use crate::alert::Severity;
use crate::config::{ForestConfig, ScorerConfig};
use crate::error::ScoreError;
use crate::features::{Feature, FeatureVector, NUM_FEATURES};

/// Per-feature contributions, largest first.
pub type Attribution = SmallVec<[(Feature, f64); NUM_FEATURES]>;

// ============================================================================
// MODEL CONTRACT
// ============================================================================

pub trait AnomalyModel: Send + Sync {
    fn name(&self) -> &str;

    /// Real-valued score; lower is more abnormal.
    fn score(&self, vector: &FeatureVector) -> f64;

    /// Typical vector of the reference population, used for occlusion.
    fn reference(&self) -> FeatureVector {
        FeatureVector::neutral()
    }

    /// Occlusion attribution: how much the score rises when each feature is
    /// replaced by its reference value. Positive means the feature pulled the
    /// score toward abnormal.
    fn attribute(&self, vector: &FeatureVector, score: f64) -> Attribution {
        let reference = self.reference();
        let mut contributions: Attribution = Feature::ALL
            .iter()
            .map(|&feature| {
                let mut occluded = *vector;
                occluded.set(feature, reference.get(feature));
                (feature, self.score(&occluded) - score)
            })
            .collect();
        contributions.sort_by(|a, b| b.1.total_cmp(&a.1));
        contributions
    }
}

// ============================================================================
// ISOLATION FOREST MODEL
// ============================================================================

/// Isolation forest over one-sided features.
///
/// Every feature measures irregularity or size, so only values above the
/// typical level can be abnormal: a query point is lifted to the per-feature median
/// of the training population before it is isolated. The measure
/// `s(x) in (0, 1]` is mapped to `score = 1 - 2 s(x)`, putting the average
/// point (`s = 0.5`) at 0 and a point with `s = 0.65` at -0.3.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IsolationForestModel {
    forest: IsolationForest,
    /// Per-feature median of the training population
    reference: FeatureVector,
    training_size: usize,
}

impl IsolationForestModel {
    /// Fit on a reference population. `None` if it is empty.
    pub fn fit(vectors: &[FeatureVector], config: &ForestConfig) -> Option<Self> {
        let forest =
            IsolationForest::fit(vectors, config.num_trees, config.sample_size, config.seed)?;
        let mut reference = FeatureVector::neutral();
        for feature in Feature::ALL {
            let mut column: Vec<f64> = vectors.iter().map(|v| v.get(feature)).collect();
            column.sort_by(f64::total_cmp);
            reference.set(feature, column[column.len() / 2]);
        }
        info!(
            training_size = vectors.len(),
            trees = forest.num_trees(),
            "isolation forest fitted"
        );
        Some(Self {
            forest,
            reference,
            training_size: vectors.len(),
        })
    }

    pub fn training_size(&self) -> usize {
        self.training_size
    }

    fn lift(&self, vector: &FeatureVector) -> FeatureVector {
        let mut lifted = *vector;
        for (v, r) in lifted.0.iter_mut().zip(self.reference.0.iter()) {
            *v = v.max(*r);
        }
        lifted
    }
}

impl AnomalyModel for IsolationForestModel {
    fn name(&self) -> &str {
        "isolation_forest"
    }

    fn score(&self, vector: &FeatureVector) -> f64 {
        1.0 - 2.0 * self.forest.anomaly_measure(self.lift(vector).as_slice())
    }

    fn reference(&self) -> FeatureVector {
        self.reference
    }
}

// ============================================================================
// SCORER
// ============================================================================

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AnomalyScore {
    pub record_ref: String,
    pub score: f64,
    pub attributed_features: Attribution,
    pub model: String,
}

impl AnomalyScore {
    /// Features that pushed the score toward abnormal, strongest first.
    pub fn top_features(&self, n: usize) -> impl Iterator<Item = &(Feature, f64)> {
        self.attributed_features
            .iter()
            .filter(|(_, c)| *c > 0.0)
            .take(n)
    }
}

/// Applies the installed model to validated feature vectors.
pub struct AnomalyScorer {
    config: ScorerConfig,
    model: RwLock<Option<Arc<dyn AnomalyModel>>>,
}

impl AnomalyScorer {
    pub fn new(config: ScorerConfig) -> Self {
        Self {
            config,
            model: RwLock::new(None),
        }
    }

    pub fn config(&self) -> &ScorerConfig {
        &self.config
    }

    /// Swap in a new model; in-flight scores finish on the old one.
    pub fn install(&self, model: Arc<dyn AnomalyModel>) {
        info!(model = model.name(), "anomaly model installed");
        *self.model.write() = Some(model);
    }

    pub fn is_ready(&self) -> bool {
        self.model.read().is_some()
    }

    pub fn score(&self, record_ref: &str, vector: &FeatureVector) -> Result<AnomalyScore, ScoreError> {
        vector.validate()?;
        let model = self
            .model
            .read()
            .as_ref()
            .map(Arc::clone)
            .ok_or(ScoreError::ModelNotInstalled)?;

        let score = model.score(vector);
        let attributed_features = model.attribute(vector, score);
        Ok(AnomalyScore {
            record_ref: record_ref.to_string(),
            score,
            attributed_features,
            model: model.name().to_string(),
        })
    }

    pub fn is_anomalous(&self, score: &AnomalyScore) -> bool {
        score.score < self.config.threshold
    }

    pub fn severity(&self, score: &AnomalyScore) -> Severity {
        self.config.classify(score.score)
    }
}
