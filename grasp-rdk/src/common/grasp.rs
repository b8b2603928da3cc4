use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use thiserror::Error;

use super::math_utils::{self, Matrix4, Vector3};

/// One proposed gripper pose. Candidates keep the order in which the detector
/// reported them, which is not necessarily sorted by score.
#[derive(Clone, Debug, PartialEq)]
pub struct GraspCandidate {
    transform: Matrix4,
    width: f64,
    score: f64,
}

impl GraspCandidate {
    pub(crate) fn new(transform: Matrix4, width: f64, score: f64) -> Self {
        Self {
            transform,
            width,
            score,
        }
    }

    pub fn transform(&self) -> &Matrix4 {
        &self.transform
    }

    pub fn width(&self) -> f64 {
        self.width
    }

    pub fn score(&self) -> f64 {
        self.score
    }

    pub fn translation(&self) -> Vector3 {
        math_utils::translation_of(&self.transform)
    }

    /// Returns a copy whose translation is shifted by `offset`. Purely additive:
    /// calling it twice shifts twice.
    pub fn translated(&self, offset: Vector3) -> Self {
        Self {
            transform: math_utils::translate(&self.transform, offset),
            width: self.width,
            score: self.score,
        }
    }
}

#[derive(Error, Debug, PartialEq)]
#[error("response arrays differ in length: {transforms} transforms, {widths} widths, {scores} scores")]
pub struct LengthMismatch {
    pub transforms: usize,
    pub widths: usize,
    pub scores: usize,
}

/// Wire shape of a successful `/detect_grasps` response: three parallel arrays
/// plus an optional link to the rendered snapshot.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct DetectionResponse {
    pub tf_matrices: Vec<Matrix4>,
    pub widths: Vec<f64>,
    pub scores: Vec<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub visualization_url: Option<String>,
}

impl DetectionResponse {
    pub fn from_candidates(candidates: &[GraspCandidate]) -> Self {
        Self {
            tf_matrices: candidates.iter().map(|c| c.transform).collect(),
            widths: candidates.iter().map(|c| c.width).collect(),
            scores: candidates.iter().map(|c| c.score).collect(),
            visualization_url: None,
        }
    }

    pub fn with_visualization_url(mut self, url: impl Into<String>) -> Self {
        self.visualization_url = Some(url.into());
        self
    }

    pub fn len(&self) -> usize {
        self.scores.len()
    }

    pub fn is_empty(&self) -> bool {
        self.scores.is_empty()
    }

    pub fn into_candidates(self) -> Result<Vec<GraspCandidate>, LengthMismatch> {
        let (transforms, widths, scores) =
            (self.tf_matrices.len(), self.widths.len(), self.scores.len());
        if transforms != widths || widths != scores {
            return Err(LengthMismatch {
                transforms,
                widths,
                scores,
            });
        }
        Ok(self
            .tf_matrices
            .into_iter()
            .zip(self.widths)
            .zip(self.scores)
            .map(|((transform, width), score)| GraspCandidate::new(transform, width, score))
            .collect())
    }
}

/// Outcome of picking the highest scoring candidate. An empty candidate set is
/// a regular result, not an error.
#[derive(Clone, Debug, PartialEq)]
pub enum BestGrasp {
    Found(GraspCandidate),
    NoGrasps,
}

impl BestGrasp {
    pub fn select(candidates: &[GraspCandidate]) -> Self {
        // first maximum wins on ties, NaN scores never win
        let mut best: Option<&GraspCandidate> = None;
        for candidate in candidates {
            if candidate.score.is_nan() {
                continue;
            }
            if best.map_or(true, |current| candidate.score > current.score) {
                best = Some(candidate);
            }
        }
        match best {
            Some(candidate) => BestGrasp::Found(candidate.clone()),
            None => BestGrasp::NoGrasps,
        }
    }

    pub fn to_json(&self) -> Value {
        match self {
            BestGrasp::Found(grasp) => json!({
                "success": true,
                "transform": grasp.transform,
                "width": grasp.width,
                "score": grasp.score,
            }),
            BestGrasp::NoGrasps => json!({
                "success": false,
                "message": "No grasps found",
            }),
        }
    }
}
