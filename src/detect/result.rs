use serde::{Deserialize, Serialize};

use crate::frame::BoundingBox;

/// One tracked object in one frame.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct TrackedObject {
    pub track_id: u64,
    pub bbox: BoundingBox,
    pub confidence: f32,
    #[serde(default)]
    pub class: ObjectClass,
}

impl TrackedObject {
    /// Bottom-center anchor point in pixel space.
    pub fn anchor(&self) -> [f64; 2] {
        self.bbox.bottom_center()
    }
}

#[non_exhaustive]
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ObjectClass {
    Car,
    Motorcycle,
    Bus,
    Truck,
    #[default]
    Unknown,
}
