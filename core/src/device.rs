use serde::{Deserialize, Serialize};

/// A closed three-way enum; new form factors extend this list rather than
/// falling back to a string.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DeviceType {
    Desktop,
    Mobile,
    Tablet,
}

impl DeviceType {
    pub fn as_str(&self) -> &'static str {
        match self {
            DeviceType::Desktop => "desktop",
            DeviceType::Mobile => "mobile",
            DeviceType::Tablet => "tablet",
        }
    }
}

impl std::str::FromStr for DeviceType {
    type Err = crate::error::FamilyVaultError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "desktop" => Ok(DeviceType::Desktop),
            "mobile" => Ok(DeviceType::Mobile),
            "tablet" => Ok(DeviceType::Tablet),
            other => Err(crate::error::FamilyVaultError::InvalidArgument(format!(
                "unknown device type: {other}"
            ))),
        }
    }
}

impl std::fmt::Display for DeviceType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// This installation's identity. `family_secret` lives in
/// `SecureStorage`, not here — this struct is the non-secret half that is
/// also what gets announced over discovery and exchanged during pairing.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeviceIdentity {
    pub device_id: String,
    pub device_name: String,
    pub device_type: DeviceType,
}

impl DeviceIdentity {
    pub fn new(device_name: impl Into<String>, device_type: DeviceType) -> Self {
        Self {
            device_id: crate::crypto::uuid_v4(),
            device_name: device_name.into(),
            device_type,
        }
    }
}
