use serde::{Deserialize, Serialize};
use std::ops::{Add, Mul};

/// Row-major 4x4 homogeneous transform, the translation lives in column 3.
pub type Matrix4 = [[f64; 4]; 4];

pub const IDENTITY: Matrix4 = [
    [1.0, 0.0, 0.0, 0.0],
    [0.0, 1.0, 0.0, 0.0],
    [0.0, 0.0, 1.0, 0.0],
    [0.0, 0.0, 0.0, 1.0],
];

#[derive(Clone, Copy, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct Vector3 {
    pub x: f64,
    pub y: f64,
    pub z: f64,
}

impl Vector3 {
    pub fn new(x: f64, y: f64, z: f64) -> Self {
        Vector3 { x, y, z }
    }

    pub fn min(self, other: Vector3) -> Self {
        Vector3 {
            x: self.x.min(other.x),
            y: self.y.min(other.y),
            z: self.z.min(other.z),
        }
    }

    pub fn max(self, other: Vector3) -> Self {
        Vector3 {
            x: self.x.max(other.x),
            y: self.y.max(other.y),
            z: self.z.max(other.z),
        }
    }

    pub fn is_finite(&self) -> bool {
        self.x.is_finite() && self.y.is_finite() && self.z.is_finite()
    }
}

impl Add for Vector3 {
    type Output = Vector3;
    fn add(self, rhs: Vector3) -> Self::Output {
        Vector3 {
            x: self.x + rhs.x,
            y: self.y + rhs.y,
            z: self.z + rhs.z,
        }
    }
}

impl Mul<f64> for Vector3 {
    type Output = Vector3;
    fn mul(self, rhs: f64) -> Self::Output {
        Vector3 {
            x: self.x * rhs,
            y: self.y * rhs,
            z: self.z * rhs,
        }
    }
}

impl From<[f64; 3]> for Vector3 {
    fn from(value: [f64; 3]) -> Self {
        Vector3::new(value[0], value[1], value[2])
    }
}

pub fn translation_of(transform: &Matrix4) -> Vector3 {
    Vector3::new(transform[0][3], transform[1][3], transform[2][3])
}

/// Identity rotation placed at `translation`.
pub fn from_translation(translation: Vector3) -> Matrix4 {
    let mut transform = IDENTITY;
    transform[0][3] = translation.x;
    transform[1][3] = translation.y;
    transform[2][3] = translation.z;
    transform
}

/// Adds `offset` to the translation column, leaving rotation untouched.
pub fn translate(transform: &Matrix4, offset: Vector3) -> Matrix4 {
    let mut out = *transform;
    out[0][3] += offset.x;
    out[1][3] += offset.y;
    out[2][3] += offset.z;
    out
}

pub fn is_finite(transform: &Matrix4) -> bool {
    transform.iter().flatten().all(|v| v.is_finite())
}
