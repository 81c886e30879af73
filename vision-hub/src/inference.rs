//! An inference-ready classifier and its per-class scores.

use std::{fmt, sync::Arc};

use anyhow::{Context, ensure};
use itertools::Itertools;
use serde::{Deserialize, Serialize};
use tracing::debug;
use tract_onnx::prelude::*;

/// Plan evaluating the optimized graph.
pub type Plan = RunnableModel<TypedFact, Box<dyn TypedOp>, TypedModel>;

/// A loaded model, immutable once built.
///
/// Two views of the same network are kept: the decluttered graph, which is what gets traced
/// and serialized, and an optimized plan used for inference. Decluttering already removed the
/// training-only operators (dropout and friends become identities), so evaluation is
/// deterministic.
#[derive(Clone)]
pub struct PretrainedModel {
    name: String,
    source_sha256: String,
    graph: Arc<TypedModel>,
    plan: Arc<Plan>,
}

impl PretrainedModel {
    pub fn from_graph(
        name: impl Into<String>,
        source_sha256: impl Into<String>,
        graph: TypedModel,
    ) -> anyhow::Result<Self> {
        let name = name.into();
        let plan = graph
            .clone()
            .into_optimized()
            .with_context(|| format!("optimizing {name}"))?
            .into_runnable()?;
        debug!("{name}: {} nodes after declutter", graph.nodes().len());
        Ok(Self {
            name,
            source_sha256: source_sha256.into(),
            graph: Arc::new(graph),
            plan: Arc::new(plan),
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Hex SHA-256 of the file the model was loaded from.
    pub fn source_sha256(&self) -> &str {
        &self.source_sha256
    }

    pub fn graph(&self) -> &TypedModel {
        &self.graph
    }

    pub fn input_shape(&self) -> anyhow::Result<Vec<usize>> {
        let fact = self.graph.input_fact(0)?;
        fact.shape
            .as_concrete()
            .map(|dims| dims.to_vec())
            .with_context(|| format!("{} has a symbolic input shape {:?}", self.name, fact.shape))
    }

    /// One forward evaluation. Read-only: nothing in the model changes and nothing is written.
    pub fn infer(&self, input: &Tensor) -> anyhow::Result<Scores> {
        let expected = self.input_shape()?;
        ensure!(
            input.shape() == expected.as_slice(),
            "input of shape {:?} does not match the {:?} expected by {}",
            input.shape(),
            expected,
            self.name
        );
        let outputs = self.plan.run(tvec!(input.clone().into()))?;
        let output = outputs
            .first()
            .with_context(|| format!("{} produced no output", self.name))?;
        Ok(Scores::new(output.as_slice::<f32>()?.to_vec()))
    }
}

/// Raw per-class scores of a single-item batch.
#[derive(Debug, Clone, PartialEq)]
pub struct Scores(Vec<f32>);

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Prediction {
    pub index: usize,
    pub score: f32,
}

impl fmt::Display for Prediction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "max score {:.4} at index {}", self.score, self.index)
    }
}

impl Scores {
    pub fn new(scores: Vec<f32>) -> Self {
        Self(scores)
    }

    pub fn as_slice(&self) -> &[f32] {
        &self.0
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Max over classes, the first index wins on ties.
    pub fn top(&self) -> Option<Prediction> {
        self.0
            .iter()
            .copied()
            .enumerate()
            .fold(None, |best: Option<Prediction>, (index, score)| match best {
                Some(b) if score.total_cmp(&b.score).is_le() => Some(b),
                _ => Some(Prediction { index, score }),
            })
    }

    /// The `k` best classes, best first.
    pub fn top_k(&self, k: usize) -> Vec<Prediction> {
        self.0
            .iter()
            .copied()
            .enumerate()
            .map(|(index, score)| Prediction { index, score })
            .sorted_by(|a, b| b.score.total_cmp(&a.score))
            .take(k)
            .collect()
    }

    /// Largest element-wise distance, `None` when the class counts differ.
    pub fn max_abs_diff(&self, other: &Scores) -> Option<f32> {
        if self.len() != other.len() {
            return None;
        }
        Some(
            self.0
                .iter()
                .zip(other.0.iter())
                .map(|(a, b)| (a - b).abs())
                .fold(0.0, f32::max),
        )
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::{hub::load_onnx, preprocess::IMAGENET_INPUT_SHAPE, testing};

    #[test]
    fn test_top_prefers_first_max() {
        let scores = Scores::new(vec![0.5, 2.0, -1.0, 2.0]);
        assert_eq!(
            scores.top(),
            Some(Prediction {
                index: 1,
                score: 2.0
            })
        );
        assert_eq!(Scores::new(vec![]).top(), None);
    }

    #[test]
    fn test_top_k_is_sorted_and_stable() {
        let scores = Scores::new(vec![0.1, 3.0, 0.7, 3.0, -2.0]);
        let top: Vec<usize> = scores.top_k(3).iter().map(|p| p.index).collect();
        assert_eq!(top, vec![1, 3, 2]);
        assert_eq!(scores.top_k(10).len(), 5);
    }

    #[test]
    fn test_max_abs_diff() {
        let a = Scores::new(vec![1.0, 2.0, 3.0]);
        let b = Scores::new(vec![1.0, 2.5, 2.0]);
        assert_eq!(a.max_abs_diff(&b), Some(1.0));
        assert_eq!(a.max_abs_diff(&Scores::new(vec![1.0])), None);
    }

    #[test]
    fn test_infer_matches_hand_computed_scores() -> anyhow::Result<()> {
        let dir = tempfile::tempdir()?;
        let path = testing::write_tiny_classifier(dir.path(), 4)?;
        let model = load_onnx("tiny", &path, IMAGENET_INPUT_SHAPE)?;

        // every channel constant, so global average pooling yields the channel value itself
        let channels = [0.25f32, -1.0, 2.0];
        let input = testing::constant_input(channels);
        let scores = model.infer(&input)?;

        let expected = testing::tiny_classifier_scores(channels, 4);
        assert_eq!(scores.len(), 4);
        let diff = scores.max_abs_diff(&Scores::new(expected)).unwrap();
        assert!(diff < 1e-4, "diff {diff}");
        Ok(())
    }

    #[test]
    fn test_infer_is_deterministic() -> anyhow::Result<()> {
        let dir = tempfile::tempdir()?;
        let path = testing::write_tiny_classifier(dir.path(), 7)?;
        let model = load_onnx("tiny", &path, IMAGENET_INPUT_SHAPE)?;
        let input = testing::constant_input([0.1, 0.2, 0.3]);

        let first = model.infer(&input)?;
        for _ in 0..3 {
            assert_eq!(model.infer(&input)?, first);
        }
        Ok(())
    }

    #[test]
    fn test_infer_rejects_wrong_shape() -> anyhow::Result<()> {
        let dir = tempfile::tempdir()?;
        let path = testing::write_tiny_classifier(dir.path(), 2)?;
        let model = load_onnx("tiny", &path, IMAGENET_INPUT_SHAPE)?;
        let input = Tensor::zero::<f32>(&[1, 3, 32, 32])?;
        assert!(model.infer(&input).is_err());
        Ok(())
    }
}
