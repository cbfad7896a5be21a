use std::fmt;

use serde::{Deserialize, Serialize};

use crate::TimePoint;

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[serde(rename_all = "snake_case")]
pub enum Stage {
    Locate,
    ClassCenters,
    Segmentation,
    RegionMap,
    Tracking,
    Lifespan,
    Cleaning,
    Overlay,
    Extraction(String),
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Stage::Locate => f.write_str("locate"),
            Stage::ClassCenters => f.write_str("class_centers"),
            Stage::Segmentation => f.write_str("segmentation"),
            Stage::RegionMap => f.write_str("region_map"),
            Stage::Tracking => f.write_str("tracking"),
            Stage::Lifespan => f.write_str("lifespan"),
            Stage::Cleaning => f.write_str("cleaning"),
            Stage::Overlay => f.write_str("overlay"),
            Stage::Extraction(name) => write!(f, "extraction[{name}]"),
        }
    }
}

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "kind", content = "detail", rename_all = "snake_case")]
pub enum DropReason {
    /// No input passed the quality selection.
    SelectionMiss(String),
    JobFailed(String),
    Configuration(String),
    /// An upstream result for this time point is absent.
    MissingDependency(String),
    /// Too close to the run end to know region lifespans.
    Deferred,
}

impl fmt::Display for DropReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DropReason::SelectionMiss(d) => write!(f, "selection miss: {d}"),
            DropReason::JobFailed(d) => write!(f, "job failed: {d}"),
            DropReason::Configuration(d) => write!(f, "configuration error: {d}"),
            DropReason::MissingDependency(d) => write!(f, "missing dependency: {d}"),
            DropReason::Deferred => f.write_str("deferred until lifespan is known"),
        }
    }
}

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
pub struct DroppedTimePoint {
    pub time: TimePoint,
    pub stage: Stage,
    pub reason: DropReason,
}
