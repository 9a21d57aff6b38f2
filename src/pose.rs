//! Cartesian targets (XYZ position + quaternion orientation)
//!
//! Targets may be given either as `[[x, y, z], [q0, q1, q2, q3]]` or as a flat
//! `[x, y, z, q0, q1, q2, q3]` list. Both shapes normalize to [`Pose`].

use crate::{AbbError, Result};
use serde::{Deserialize, Serialize};
use tracing::warn;

/// Canonical two-part pose
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Pose {
    pub position: [f64; 3],
    pub orientation: [f64; 4],
}

/// Pose as supplied by a caller or a config file, before shape validation
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum PoseInput {
    Nested(Vec<Vec<f64>>),
    Flat(Vec<f64>),
}

impl Pose {
    /// Zero offset with identity orientation
    pub const IDENTITY: Pose = Pose {
        position: [0.0, 0.0, 0.0],
        orientation: [1.0, 0.0, 0.0, 0.0],
    };

    pub fn new(position: [f64; 3], orientation: [f64; 4]) -> Self {
        Self { position, orientation }
    }

    /// Build from separate position and orientation slices
    pub fn from_parts(position: &[f64], orientation: &[f64]) -> Result<Self> {
        let position: [f64; 3] = position.try_into().map_err(|_| {
            malformed(format!("position needs 3 values, got {}", position.len()))
        })?;
        let orientation: [f64; 4] = orientation.try_into().map_err(|_| {
            malformed(format!("orientation needs 4 values, got {}", orientation.len()))
        })?;
        Ok(Self { position, orientation })
    }

    /// Build from a flat 7-element list
    pub fn from_flat(values: &[f64]) -> Result<Self> {
        if values.len() != 7 {
            return Err(malformed(format!("flat pose needs 7 values, got {}", values.len())));
        }
        Self::from_parts(&values[0..3], &values[3..7])
    }

    /// Normalize either accepted shape into the canonical form
    pub fn normalize(input: &PoseInput) -> Result<Self> {
        match input {
            PoseInput::Nested(parts) if parts.len() == 2 => Self::from_parts(&parts[0], &parts[1]),
            PoseInput::Nested(parts) => Err(malformed(format!(
                "nested pose needs [position, orientation], got {} parts",
                parts.len()
            ))),
            PoseInput::Flat(values) => Self::from_flat(values),
        }
    }

    /// Flat `[x, y, z, q0, q1, q2, q3]` view
    pub fn to_flat(&self) -> [f64; 7] {
        let [x, y, z] = self.position;
        let [q0, q1, q2, q3] = self.orientation;
        [x, y, z, q0, q1, q2, q3]
    }
}

impl Default for Pose {
    fn default() -> Self {
        Self::IDENTITY
    }
}

impl From<Pose> for PoseInput {
    fn from(pose: Pose) -> Self {
        PoseInput::Nested(vec![pose.position.to_vec(), pose.orientation.to_vec()])
    }
}

impl From<Vec<f64>> for PoseInput {
    fn from(values: Vec<f64>) -> Self {
        PoseInput::Flat(values)
    }
}

impl From<[f64; 7]> for PoseInput {
    fn from(values: [f64; 7]) -> Self {
        PoseInput::Flat(values.to_vec())
    }
}

impl TryFrom<&PoseInput> for Pose {
    type Error = AbbError;

    fn try_from(input: &PoseInput) -> Result<Self> {
        Pose::normalize(input)
    }
}

fn malformed(reason: String) -> AbbError {
    warn!("Received malformed coordinate: {}", reason);
    AbbError::MalformedPose(reason)
}
