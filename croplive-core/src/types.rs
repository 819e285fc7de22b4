use serde::{Deserialize, Serialize};
use uuid::Uuid;

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct SessionId(pub Uuid);

impl SessionId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for SessionId {
    fn default() -> Self {
        Self::new()
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct CameraId(pub String);

impl CameraId {
    pub fn new(value: impl Into<String>) -> Self {
        Self(value.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct MicrophoneId(pub String);

impl MicrophoneId {
    pub fn new(value: impl Into<String>) -> Self {
        Self(value.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum CameraFacing {
    Front,
    Rear,
    Unknown,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CameraDevice {
    pub id: CameraId,
    pub label: String,
    pub facing: CameraFacing,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MicrophoneDevice {
    pub id: MicrophoneId,
    pub label: String,
}

/// Enumerated capture hardware, refreshed on manager construction and after
/// camera switches.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct DeviceInventory {
    pub cameras: Vec<CameraDevice>,
    pub microphones: Vec<MicrophoneDevice>,
}

impl DeviceInventory {
    /// Default camera pick when the caller didn't select one: prefer a
    /// rear-facing camera, fall back to the first enumerated one.
    pub fn default_camera(&self) -> Option<&CameraDevice> {
        self.cameras
            .iter()
            .find(|c| c.facing == CameraFacing::Rear)
            .or_else(|| self.cameras.first())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn cam(id: &str, facing: CameraFacing) -> CameraDevice {
        CameraDevice {
            id: CameraId::new(id),
            label: id.to_string(),
            facing,
        }
    }

    #[test]
    fn default_camera_prefers_rear_facing() {
        let inv = DeviceInventory {
            cameras: vec![cam("front", CameraFacing::Front), cam("rear", CameraFacing::Rear)],
            microphones: vec![],
        };
        assert_eq!(inv.default_camera().unwrap().id.as_str(), "rear");
    }

    #[test]
    fn default_camera_falls_back_to_first() {
        let inv = DeviceInventory {
            cameras: vec![cam("a", CameraFacing::Unknown), cam("b", CameraFacing::Front)],
            microphones: vec![],
        };
        assert_eq!(inv.default_camera().unwrap().id.as_str(), "a");
    }

    #[test]
    fn default_camera_empty_inventory_is_none() {
        assert!(DeviceInventory::default().default_camera().is_none());
    }
}
