//! Turns detector stdout into grasp candidates.
//!
//! Two dialects exist, picked per deployment. The structured one is the only
//! source of measured poses; the textual log is a degraded fallback for
//! detector builds that only print progress, and the geometry it yields is
//! synthesized from grasp indices and scores.
use serde::Deserialize;
use thiserror::Error;

use super::{
    config::OutputDialect,
    grasp::GraspCandidate,
    math_utils::{self, Matrix4, Vector3},
};

pub const SELECTED_SECTION_HEADER: &str = "======== Selected grasps ========";
pub const RUNTIMES_SECTION_HEADER: &str = "======== RUNTIMES ========";

#[derive(Error, Debug)]
pub enum ParseError {
    #[error("detector output is not a valid result document: {0}")]
    MalformedJson(#[from] serde_json::Error),
    #[error("result arrays differ in length: {transforms} transforms, {widths} widths, {scores} scores")]
    LengthMismatch {
        transforms: usize,
        widths: usize,
        scores: usize,
    },
    #[error("grasp {index} has invalid width {width}")]
    InvalidWidth { index: usize, width: f64 },
    #[error("grasp {index} has a non-finite transform")]
    NonFiniteTransform { index: usize },
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Normalizer {
    dialect: OutputDialect,
}

impl Normalizer {
    pub fn new(dialect: OutputDialect) -> Self {
        Self { dialect }
    }

    pub fn dialect(&self) -> OutputDialect {
        self.dialect
    }

    pub fn parse(&self, stdout: &str) -> Result<Vec<GraspCandidate>, ParseError> {
        match self.dialect {
            OutputDialect::Structured => parse_structured(stdout),
            OutputDialect::TextualLog => Ok(parse_textual_log(stdout)),
        }
    }
}

#[derive(Deserialize)]
struct StructuredResult {
    tf_matrices: Vec<Matrix4>,
    widths: Vec<f64>,
    scores: Vec<f64>,
}

/// Parses a single JSON document carrying `tf_matrices`, `widths` and
/// `scores`.
pub fn parse_structured(stdout: &str) -> Result<Vec<GraspCandidate>, ParseError> {
    let result: StructuredResult = serde_json::from_str(stdout.trim())?;
    let (transforms, widths, scores) = (
        result.tf_matrices.len(),
        result.widths.len(),
        result.scores.len(),
    );
    if transforms != widths || widths != scores {
        return Err(ParseError::LengthMismatch {
            transforms,
            widths,
            scores,
        });
    }
    result
        .tf_matrices
        .into_iter()
        .zip(result.widths)
        .zip(result.scores)
        .enumerate()
        .map(|(index, ((transform, width), score))| {
            if !math_utils::is_finite(&transform) {
                return Err(ParseError::NonFiniteTransform { index });
            }
            if !(width.is_finite() && width >= 0.0) {
                return Err(ParseError::InvalidWidth { index, width });
            }
            Ok(GraspCandidate::new(transform, width, score))
        })
        .collect()
}

/// Scans a progress log for the selected grasps section and synthesizes a
/// candidate per `Grasp <index>: <score>` line. Lines that do not parse are
/// skipped.
pub fn parse_textual_log(stdout: &str) -> Vec<GraspCandidate> {
    let mut selected = false;
    let mut candidates = vec![];
    for line in stdout.lines().map(str::trim) {
        if line == SELECTED_SECTION_HEADER {
            selected = true;
            continue;
        }
        if line == RUNTIMES_SECTION_HEADER {
            if selected {
                break;
            }
            continue;
        }
        if !selected {
            continue;
        }
        if let Some((index, score)) = grasp_line(line) {
            candidates.push(GraspCandidate::new(
                placeholder_transform(index),
                placeholder_width(score),
                score,
            ));
        }
    }
    if !candidates.is_empty() {
        log::warn!(
            "{} grasps recovered from a textual log, poses and widths are placeholders",
            candidates.len()
        );
    }
    candidates
}

fn grasp_line(line: &str) -> Option<(usize, f64)> {
    let (index, score) = line.strip_prefix("Grasp ")?.split_once(':')?;
    let index = index.trim().parse::<usize>().ok()?;
    // `nan` and `inf` parse as f64 but are not scores
    let score = score.trim().parse::<f64>().ok().filter(|s| s.is_finite())?;
    Some((index, score))
}

// Not a measured pose: grasps are spread on a 1cm grid, 10cm up.
fn placeholder_transform(index: usize) -> Matrix4 {
    math_utils::from_translation(Vector3::new(
        0.01 * (index % 3) as f64,
        0.01 * (index / 3) as f64,
        0.1,
    ))
}

// Clamped at zero, very negative scores would otherwise give a negative width.
fn placeholder_width(score: f64) -> f64 {
    (0.05 + 0.03 * score / 1000.0).max(0.0)
}

#[cfg(test)]
mod tests {
    use super::{parse_structured, parse_textual_log, Normalizer, ParseError};
    use crate::common::{
        config::OutputDialect,
        math_utils::{Vector3, IDENTITY},
    };

    const IDENTITY_JSON: &str = "[[1,0,0,0],[0,1,0,0],[0,0,1,0],[0,0,0,1]]";

    #[test_log::test]
    fn test_structured_single_candidate() {
        let stdout = format!(
            "{{\"tf_matrices\":[{IDENTITY_JSON}],\"widths\":[0.05],\"scores\":[10.0]}}\n"
        );
        let candidates = Normalizer::new(OutputDialect::Structured)
            .parse(&stdout)
            .unwrap();
        assert_eq!(candidates.len(), 1);
        assert_eq!(candidates[0].width(), 0.05);
        assert_eq!(candidates[0].score(), 10.0);
        assert_eq!(candidates[0].transform(), &IDENTITY);
    }

    #[test_log::test]
    fn test_structured_keeps_detector_order() {
        let stdout = format!(
            "{{\"tf_matrices\":[{IDENTITY_JSON},{IDENTITY_JSON}],\"widths\":[0.04,0.06],\"scores\":[1.0,9.0]}}"
        );
        let scores: Vec<f64> = parse_structured(&stdout)
            .unwrap()
            .iter()
            .map(|c| c.score())
            .collect();
        assert_eq!(scores, vec![1.0, 9.0]);
    }

    #[test_log::test]
    fn test_structured_empty_is_valid() {
        let candidates = parse_structured(r#"{"tf_matrices":[],"widths":[],"scores":[]}"#).unwrap();
        assert!(candidates.is_empty());
    }

    #[test_log::test]
    fn test_structured_failures() {
        assert!(matches!(
            parse_structured("Loading point cloud...\n"),
            Err(ParseError::MalformedJson(_))
        ));
        assert!(matches!(
            parse_structured(""),
            Err(ParseError::MalformedJson(_))
        ));
        assert!(matches!(
            parse_structured(r#"{"widths":[],"scores":[]}"#),
            Err(ParseError::MalformedJson(_))
        ));
        assert!(matches!(
            parse_structured(r#"{"tf_matrices":[[[1,0,0],[0,1,0],[0,0,1]]],"widths":[0.1],"scores":[1]}"#),
            Err(ParseError::MalformedJson(_))
        ));
        assert!(matches!(
            parse_structured(&format!(
                "{{\"tf_matrices\":[{IDENTITY_JSON}],\"widths\":[],\"scores\":[1.0]}}"
            )),
            Err(ParseError::LengthMismatch {
                transforms: 1,
                widths: 0,
                scores: 1
            })
        ));
        assert!(matches!(
            parse_structured(&format!(
                "{{\"tf_matrices\":[{IDENTITY_JSON}],\"widths\":[-0.01],\"scores\":[1.0]}}"
            )),
            Err(ParseError::InvalidWidth { index: 0, .. })
        ));
    }

    // The textual dialect has no pose data: every transform and width checked
    // below is synthesized from the grasp index and score, not measured.
    #[test_log::test]
    fn test_textual_log_synthetic_geometry() {
        let stdout = "Processing cloud with 1500 points\n\
                      ======== Selected grasps ========\n\
                      Grasp 0: 100.0\n\
                      Grasp 1: 50.0\n\
                      ======== RUNTIMES ========\n\
                      Grasp 7: 1.0\n";
        let candidates = Normalizer::new(OutputDialect::TextualLog)
            .parse(stdout)
            .unwrap();
        let scores: Vec<f64> = candidates.iter().map(|c| c.score()).collect();
        assert_eq!(scores, vec![100.0, 50.0]);
        assert_eq!(candidates[0].translation(), Vector3::new(0.0, 0.0, 0.1));
        assert_eq!(candidates[1].translation(), Vector3::new(0.01, 0.0, 0.1));
        assert!((candidates[0].width() - 0.053).abs() < 1e-12);
        assert!((candidates[1].width() - 0.0515).abs() < 1e-12);
        for candidate in &candidates {
            let t = candidate.transform();
            assert_eq!([t[0][0], t[1][1], t[2][2], t[3][3]], [1.0; 4]);
        }
    }

    #[test_log::test]
    fn test_textual_log_index_grid() {
        let stdout = "======== Selected grasps ========\nGrasp 4: 0\nGrasp 5: 0\n";
        let candidates = parse_textual_log(stdout);
        // runs to end of input without a runtimes header
        assert_eq!(candidates.len(), 2);
        let t = candidates[0].translation();
        assert!((t.x - 0.01).abs() < 1e-12 && (t.y - 0.01).abs() < 1e-12);
        let t = candidates[1].translation();
        assert!((t.x - 0.02).abs() < 1e-12 && (t.y - 0.01).abs() < 1e-12);
        assert_eq!(candidates[0].width(), 0.05);
    }

    #[test_log::test]
    fn test_textual_log_skips_noise() {
        let stdout = "Grasp 0: 99.0\n\
                      ======== Selected grasps ========\n\
                      Grasp x: 10.0\n\
                      Grasp 2: high\n\
                      Grasps found: 3\n\
                      \n\
                      Grasp 3: 12.5\n";
        let candidates = parse_textual_log(stdout);
        assert_eq!(candidates.len(), 1);
        assert_eq!(candidates[0].score(), 12.5);
    }

    #[test_log::test]
    fn test_textual_log_skips_non_finite_scores() {
        let stdout = "======== Selected grasps ========\n\
                      Grasp 0: nan\n\
                      Grasp 1: inf\n\
                      Grasp 2: -inf\n\
                      Grasp 3: infinity\n\
                      Grasp 4: -5000\n";
        let candidates = parse_textual_log(stdout);
        assert_eq!(candidates.len(), 1);
        assert_eq!(candidates[0].score(), -5000.0);
        assert_eq!(candidates[0].width(), 0.0);
        for candidate in &candidates {
            assert!(candidate.width().is_finite() && candidate.width() >= 0.0);
        }
    }

    #[test_log::test]
    fn test_textual_log_empty_is_valid() {
        assert!(parse_textual_log("").is_empty());
        assert!(parse_textual_log(
            "======== Selected grasps ========\n======== RUNTIMES ========\n"
        )
        .is_empty());
    }
}
