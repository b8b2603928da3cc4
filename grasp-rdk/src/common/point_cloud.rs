use std::fmt::Write;
use thiserror::Error;

use super::math_utils::Vector3;

#[derive(Error, Debug, PartialEq)]
pub enum PointCloudError {
    #[error("point cloud is empty")]
    Empty,
    #[error("PCD header is missing {0}")]
    MissingHeader(&'static str),
    #[error("PCD data is {0}, only ascii is supported")]
    UnsupportedData(String),
    #[error("PCD has no {0} field")]
    MissingField(char),
    #[error("bad point on line {line}: {content:?}")]
    BadPoint { line: usize, content: String },
}

/// Axis aligned bounding box.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct Aabb {
    pub min: Vector3,
    pub max: Vector3,
}

impl Aabb {
    pub fn center(&self) -> Vector3 {
        (self.min + self.max) * 0.5
    }
}

/// Unordered set of 3D points, the geometry a grasp request is computed on.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct PointCloud {
    points: Vec<Vector3>,
}

impl PointCloud {
    pub fn new(points: Vec<Vector3>) -> Self {
        Self { points }
    }

    pub fn points(&self) -> &[Vector3] {
        &self.points
    }

    pub fn len(&self) -> usize {
        self.points.len()
    }

    pub fn is_empty(&self) -> bool {
        self.points.is_empty()
    }

    /// Concatenation of both clouds, duplicates are kept.
    pub fn merged(&self, other: &PointCloud) -> PointCloud {
        let mut points = Vec::with_capacity(self.len() + other.len());
        points.extend_from_slice(&self.points);
        points.extend_from_slice(&other.points);
        PointCloud { points }
    }

    pub fn bounding_box(&self) -> Result<Aabb, PointCloudError> {
        let (first, rest) = self.points.split_first().ok_or(PointCloudError::Empty)?;
        Ok(rest.iter().fold(
            Aabb {
                min: *first,
                max: *first,
            },
            |bounds, p| Aabb {
                min: bounds.min.min(*p),
                max: bounds.max.max(*p),
            },
        ))
    }

    /// Encodes the cloud as an ASCII PCD v0.7 document.
    pub fn to_pcd(&self) -> Vec<u8> {
        let n = self.len();
        let mut out = String::with_capacity(200 + n * 32);
        // writing to a String cannot fail
        let _ = write!(
            out,
            "# .PCD v0.7 - Point Cloud Data file format\n\
             VERSION 0.7\n\
             FIELDS x y z\n\
             SIZE 4 4 4\n\
             TYPE F F F\n\
             COUNT 1 1 1\n\
             WIDTH {n}\n\
             HEIGHT 1\n\
             VIEWPOINT 0 0 0 1 0 0 0\n\
             POINTS {n}\n\
             DATA ascii\n"
        );
        for p in &self.points {
            let _ = writeln!(out, "{} {} {}", p.x, p.y, p.z);
        }
        out.into_bytes()
    }

    /// Reads an ASCII PCD document, extra fields such as `rgb` are ignored.
    pub fn from_pcd(text: &str) -> Result<Self, PointCloudError> {
        let mut fields: Option<Vec<&str>> = None;
        let mut lines = text.lines().enumerate();
        for (_, line) in lines.by_ref() {
            let line = line.trim();
            if line.is_empty() || line.starts_with('#') {
                continue;
            }
            let mut parts = line.split_whitespace();
            match parts.next() {
                Some("FIELDS") => fields = Some(parts.collect()),
                Some("DATA") => {
                    let kind = parts.next().unwrap_or("");
                    if kind != "ascii" {
                        return Err(PointCloudError::UnsupportedData(kind.to_owned()));
                    }
                    break;
                }
                _ => {}
            }
        }
        let fields = fields.ok_or(PointCloudError::MissingHeader("FIELDS"))?;
        let column = |axis: char| {
            fields
                .iter()
                .position(|f| f.len() == 1 && f.starts_with(axis))
                .ok_or(PointCloudError::MissingField(axis))
        };
        let (ix, iy, iz) = (column('x')?, column('y')?, column('z')?);

        let mut points = vec![];
        for (number, line) in lines {
            let values: Vec<&str> = line.split_whitespace().collect();
            if values.is_empty() {
                continue;
            }
            let bad = || PointCloudError::BadPoint {
                line: number + 1,
                content: line.to_owned(),
            };
            let value = |i: usize| {
                values
                    .get(i)
                    .and_then(|v| v.parse::<f64>().ok())
                    .ok_or_else(bad)
            };
            let point = Vector3::new(value(ix)?, value(iy)?, value(iz)?);
            // PCL marks invalid points with NaN
            if point.is_finite() {
                points.push(point);
            }
        }
        Ok(Self { points })
    }

    /// A 10x10x10 cube item resting just above a 20x20 plane.
    pub fn demo_scene() -> (PointCloud, PointCloud) {
        let item = (0..10)
            .flat_map(|i| (0..10).flat_map(move |j| (0..10).map(move |k| (i, j, k))))
            .map(|(i, j, k)| {
                Vector3::new(
                    linspace(-0.05, 0.05, 10, i),
                    linspace(-0.05, 0.05, 10, j),
                    linspace(0.0, 0.1, 10, k),
                )
            })
            .collect();
        let env = (0..20)
            .flat_map(|i| (0..20).map(move |j| (i, j)))
            .map(|(i, j)| {
                Vector3::new(
                    linspace(-0.2, 0.2, 20, i),
                    linspace(-0.2, 0.2, 20, j),
                    -0.01,
                )
            })
            .collect();
        (PointCloud::new(item), PointCloud::new(env))
    }
}

fn linspace(start: f64, end: f64, count: usize, index: usize) -> f64 {
    start + (end - start) * index as f64 / (count - 1) as f64
}
