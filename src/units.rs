//! Unit handling for outgoing poses
//!
//! The RAPID server works in millimeters and degrees. Callers may configure other
//! units; positions are scaled before encoding while quaternions pass through.

use crate::{pose::Pose, AbbError, Result};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LinearUnit {
    Millimeters,
    Meters,
    Inches,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AngularUnit {
    Degrees,
    Radians,
}

impl LinearUnit {
    /// Millimeters per unit
    pub fn scale(self) -> f64 {
        match self {
            LinearUnit::Millimeters => 1.0,
            LinearUnit::Meters => 1000.0,
            LinearUnit::Inches => 25.4,
        }
    }

    pub fn name(self) -> &'static str {
        match self {
            LinearUnit::Millimeters => "millimeters",
            LinearUnit::Meters => "meters",
            LinearUnit::Inches => "inches",
        }
    }
}

impl AngularUnit {
    /// Degrees per unit
    pub fn scale(self) -> f64 {
        match self {
            AngularUnit::Degrees => 1.0,
            AngularUnit::Radians => 57.2957795,
        }
    }

    pub fn name(self) -> &'static str {
        match self {
            AngularUnit::Degrees => "degrees",
            AngularUnit::Radians => "radians",
        }
    }
}

impl FromStr for LinearUnit {
    type Err = AbbError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "millimeters" => Ok(LinearUnit::Millimeters),
            "meters" => Ok(LinearUnit::Meters),
            "inches" => Ok(LinearUnit::Inches),
            other => Err(AbbError::Unit(format!("linear unit '{}'", other))),
        }
    }
}

impl FromStr for AngularUnit {
    type Err = AbbError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "degrees" => Ok(AngularUnit::Degrees),
            "radians" => Ok(AngularUnit::Radians),
            other => Err(AbbError::Unit(format!("angular unit '{}'", other))),
        }
    }
}

impl fmt::Display for LinearUnit {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl fmt::Display for AngularUnit {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Scale factors applied to poses before they are framed
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct CoordinateTransform {
    linear: LinearUnit,
    angular: AngularUnit,
}

impl CoordinateTransform {
    pub fn new(linear: LinearUnit, angular: AngularUnit) -> Self {
        Self { linear, angular }
    }

    /// Select units by name. Both names are validated before either is applied.
    pub fn set_units(&mut self, linear: &str, angular: &str) -> Result<()> {
        let linear = linear.parse::<LinearUnit>()?;
        let angular = angular.parse::<AngularUnit>()?;
        self.linear = linear;
        self.angular = angular;
        Ok(())
    }

    pub fn linear(&self) -> LinearUnit {
        self.linear
    }

    pub fn angular(&self) -> AngularUnit {
        self.angular
    }

    pub fn linear_scale(&self) -> f64 {
        self.linear.scale()
    }

    pub fn angular_scale(&self) -> f64 {
        self.angular.scale()
    }

    /// Convert a pose into controller units
    pub fn apply(&self, pose: &Pose) -> Pose {
        let scale = self.linear_scale();
        Pose {
            position: pose.position.map(|v| v * scale),
            orientation: pose.orientation,
        }
    }
}

impl Default for CoordinateTransform {
    fn default() -> Self {
        Self::new(LinearUnit::Millimeters, AngularUnit::Degrees)
    }
}
