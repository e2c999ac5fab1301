use serde::{Deserialize, Serialize};

/// Which side of the pipeline an endpoint sits on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Direction {
    Input,
    Output,
}

/// An endpoint as presented to a device picker.
///
/// `index` is the backend's ordinal and is what `start` takes.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeviceInfo {
    pub index: usize,
    #[serde(rename = "displayName")]
    pub name: String,
    pub direction: Direction,
}
