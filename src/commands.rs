//! Command set of the RAPID motion server
//!
//! Each builder only fixes the opcode, field layout and dispatch flags. Values are
//! supplied by the caller; poses are converted to controller units first.

use crate::{
    pose::Pose,
    protocol::{Command, FieldSpec, Opcode},
    units::CoordinateTransform,
    AbbError, Result,
};
use serde::{Deserialize, Serialize};

const POSITION_FIELD: FieldSpec = FieldSpec::new(8, 1);
const QUATERNION_FIELD: FieldSpec = FieldSpec::new(8, 5);
const FLAG_FIELD: FieldSpec = FieldSpec::new(2, 0);
/// Wide enough for the z200 values (`+300.0000`)
const ZONE_FIELD: FieldSpec = FieldSpec::new(9, 4);
const LINEAR_SPEED_FIELD: FieldSpec = FieldSpec::new(8, 1);
const ANGULAR_SPEED_FIELD: FieldSpec = FieldSpec::new(8, 2);

/// Default speed: TCP linear (mm/s), TCP orientation (deg/s), external linear, external orientation
pub const DEFAULT_SPEED: [f64; 4] = [100.0, 50.0, 50.0, 50.0];

/// Fly-by zones from the RAPID handbook: `[pzone_tcp mm, pzone_ori mm, zone_ori deg]`
pub const ZONE_TABLE: [(&str, [f64; 3]); 10] = [
    ("z0", [0.3, 0.3, 0.03]),
    ("z1", [1.0, 1.0, 0.1]),
    ("z5", [5.0, 8.0, 0.8]),
    ("z10", [10.0, 15.0, 1.5]),
    ("z15", [15.0, 23.0, 2.3]),
    ("z20", [20.0, 30.0, 3.0]),
    ("z30", [30.0, 45.0, 4.5]),
    ("z50", [50.0, 75.0, 7.5]),
    ("z100", [100.0, 150.0, 15.0]),
    ("z200", [200.0, 300.0, 30.0]),
];

/// Zone name that selects point motion
pub const POINT_MOTION_ZONE: &str = "fine";

/// How closely the robot must pass intermediate targets.
///
/// In YAML: `z10`, `fine`, or `[pzone_tcp, pzone_ori, zone_ori]`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ZoneSetting {
    /// `[pzone_tcp, pzone_ori, zone_ori]`
    Manual([f64; 3]),
    /// Handbook zone such as `z10`, or `fine` to stop exactly on each target
    Named(String),
}

impl Default for ZoneSetting {
    fn default() -> Self {
        ZoneSetting::Named("z1".to_string())
    }
}

impl ZoneSetting {
    pub fn point_motion() -> Self {
        ZoneSetting::Named(POINT_MOTION_ZONE.to_string())
    }

    /// Point-motion flag and zone values sent to the controller
    pub fn resolve(&self) -> Result<(bool, [f64; 3])> {
        match self {
            ZoneSetting::Named(key) if key == POINT_MOTION_ZONE => Ok((true, [0.0; 3])),
            ZoneSetting::Manual(values) => Ok((false, *values)),
            ZoneSetting::Named(key) => ZONE_TABLE
                .iter()
                .find(|(name, _)| *name == key.as_str())
                .map(|(_, values)| (false, *values))
                .ok_or_else(|| AbbError::UnknownZone {
                    key: key.clone(),
                    accepted: accepted_zone_names(),
                }),
        }
    }
}

/// `fine, z0, z1, ...` for error messages
fn accepted_zone_names() -> String {
    std::iter::once(POINT_MOTION_ZONE)
        .chain(ZONE_TABLE.iter().map(|(name, _)| *name))
        .collect::<Vec<_>>()
        .join(", ")
}

fn pose_command(opcode: Opcode, transform: &CoordinateTransform, pose: &Pose) -> Command {
    let pose = transform.apply(pose);
    Command::new(opcode)
        .fields(pose.position, POSITION_FIELD)
        .fields(pose.orientation, QUATERNION_FIELD)
}

/// Tool centre point, as an offset from tool0 at the flange face
pub fn set_tool(transform: &CoordinateTransform, tool: &Pose) -> Command {
    pose_command(Opcode::from_static("06"), transform, tool).prioritized(true)
}

/// Local frame that later cartesian targets are expressed in
pub fn set_workobject(transform: &CoordinateTransform, work_object: &Pose) -> Command {
    pose_command(Opcode::from_static("07"), transform, work_object).prioritized(true)
}

pub fn set_speed(speed: [f64; 4]) -> Command {
    let [tcp, orientation, ext_linear, ext_orientation] = speed;
    Command::new(Opcode::from_static("08"))
        .field(tcp, LINEAR_SPEED_FIELD)
        .field(orientation, ANGULAR_SPEED_FIELD)
        .field(ext_linear, LINEAR_SPEED_FIELD)
        .field(ext_orientation, ANGULAR_SPEED_FIELD)
}

pub fn set_zone(zone: &ZoneSetting) -> Result<Command> {
    let (point_motion, values) = zone.resolve()?;
    Ok(Command::new(Opcode::from_static("09"))
        .field(if point_motion { 1.0 } else { 0.0 }, FLAG_FIELD)
        .fields(values, ZONE_FIELD))
}

/// Append one target to the controller's motion buffer. Executes at the current speed.
pub fn buffer_add(transform: &CoordinateTransform, pose: &Pose) -> Command {
    pose_command(Opcode::from_static("30"), transform, pose).expect_reply(false)
}

pub fn clear_buffer() -> Command {
    Command::new(Opcode::from_static("31"))
}

/// Workobject calculation step `code` (opcode `8<code>`)
pub fn calculate_workobject(code: u8, transform: &CoordinateTransform, pose: &Pose) -> Result<Command> {
    if code > 9 {
        return Err(AbbError::InvalidOpcode(format!(
            "workobject calculation code {} does not fit opcode 8x",
            code
        )));
    }
    Ok(pose_command(Opcode::new(&format!("8{}", code))?, transform, pose))
}

pub fn pause() -> Command {
    Command::new(Opcode::from_static("90")).prioritized(true)
}

pub fn resume() -> Command {
    Command::new(Opcode::from_static("91")).prioritized(true)
}

/// Ends the server's session; the controller does not answer it
pub fn disconnect() -> Command {
    Command::new(Opcode::from_static("99")).expect_reply(false)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::FRAME_LEN;

    #[test]
    fn test_zone_frames() {
        let frame = set_zone(&ZoneSetting::Named("z0".into())).unwrap().encode().unwrap();
        assert_eq!(
            frame.as_str(),
            format!("09 +0 +000.3000 +000.3000 +000.0300 {}#", "*".repeat(30))
        );

        let frame = set_zone(&ZoneSetting::Named("z200".into())).unwrap().encode().unwrap();
        assert_eq!(
            frame.as_str(),
            format!("09 +0 +200.0000 +300.0000 +030.0000 {}#", "*".repeat(30))
        );
    }

    #[test]
    fn test_zone_variants() {
        assert_eq!(ZoneSetting::point_motion().resolve().unwrap(), (true, [0.0; 3]));
        assert_eq!(ZoneSetting::Named("fine".into()).resolve().unwrap(), (true, [0.0; 3]));
        assert_eq!(
            ZoneSetting::Manual([2.0, 3.0, 0.5]).resolve().unwrap(),
            (false, [2.0, 3.0, 0.5])
        );
        match ZoneSetting::Named("z7".into()).resolve() {
            Err(AbbError::UnknownZone { key, accepted }) => {
                assert_eq!(key, "z7");
                assert!(accepted.starts_with("fine, z0, z1"));
                assert!(accepted.ends_with("z200"));
            }
            other => panic!("expected UnknownZone, got {:?}", other),
        }

        let frame = set_zone(&ZoneSetting::point_motion()).unwrap().encode().unwrap();
        assert!(frame.as_str().starts_with("09 +1 +000.0000 +000.0000 +000.0000 "));
        for (key, _) in ZONE_TABLE {
            let frame = set_zone(&ZoneSetting::Named(key.into()))
                .unwrap()
                .encode()
                .unwrap_or_else(|e| panic!("zone {} does not encode: {}", key, e));
            assert_eq!(frame.len(), FRAME_LEN, "zone {}", key);
        }
    }

    #[test]
    fn test_tool_is_scaled_and_prioritized() {
        let mut transform = CoordinateTransform::default();
        transform.set_units("meters", "degrees").unwrap();
        let command = set_tool(&transform, &Pose::new([0.0, 0.0, 0.12], [1.0, 0.0, 0.0, 0.0]));

        assert!(command.priority());
        assert!(command.expects_reply());
        assert_eq!(
            command.encode().unwrap().as_str(),
            "06 +00000.0 +00000.0 +00120.0 +1.00000 +0.00000 +0.00000 +0.00000 #"
        );
    }

    #[test]
    fn test_speed_layout() {
        let frame = set_speed(DEFAULT_SPEED).encode().unwrap();
        assert!(frame
            .as_str()
            .starts_with("08 +00100.0 +0050.00 +00050.0 +0050.00 *"));
    }

    #[test]
    fn test_dispatch_flags() {
        let transform = CoordinateTransform::default();
        assert!(!buffer_add(&transform, &Pose::IDENTITY).expects_reply());
        assert!(!disconnect().expects_reply());
        assert!(pause().priority() && resume().priority());
        assert!(!clear_buffer().priority());
        let parsed: ZoneSetting = serde_yaml::from_str("[1, 2, 0.5]").unwrap();
        assert_eq!(parsed, ZoneSetting::Manual([1.0, 2.0, 0.5]));
        let parsed: ZoneSetting = serde_yaml::from_str("z50").unwrap();
        assert_eq!(parsed, ZoneSetting::Named("z50".into()));
        assert_eq!(
            calculate_workobject(2, &transform, &Pose::IDENTITY).unwrap().opcode().as_str(),
            "82"
        );
        assert!(matches!(
            calculate_workobject(12, &transform, &Pose::IDENTITY),
            Err(AbbError::InvalidOpcode(_))
        ));
    }
}
