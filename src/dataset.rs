// src/dataset.rs
//! CDB dataset kinds and the output path groups they map to.

use std::fmt;

use crate::error::{Error, Result};

/// The CDB content kinds the converter understands.
///
/// Each variant carries the CDB dataset code used in tile file names and a
/// canonical directory name used for the output layout.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Dataset {
    Elevation,
    Imagery,
    RMTexture,
    RMDescriptor,
    GSFeature,
    GSModelGeometry,
    GSModelTexture,
    GTFeature,
    GTModelGeometry500,
    GTModelTexture,
    RoadNetwork,
    RailRoadNetwork,
    PowerlineNetwork,
    HydrographyNetwork,
}

impl Dataset {
    /// CDB dataset code, the `Dxxx` component of tile names.
    pub fn code(&self) -> u32 {
        match self {
            Dataset::Elevation => 1,
            Dataset::Imagery => 4,
            Dataset::RMTexture => 5,
            Dataset::RMDescriptor => 6,
            Dataset::GSFeature => 100,
            Dataset::GSModelGeometry => 300,
            Dataset::GSModelTexture => 301,
            Dataset::GTFeature => 101,
            Dataset::GTModelGeometry500 => 500,
            Dataset::GTModelTexture => 511,
            Dataset::RoadNetwork => 201,
            Dataset::RailRoadNetwork => 202,
            Dataset::PowerlineNetwork => 203,
            Dataset::HydrographyNetwork => 204,
        }
    }

    /// Canonical directory name inside a geocell.
    pub fn directory_name(&self) -> &'static str {
        match self {
            Dataset::Elevation => "Elevation",
            Dataset::Imagery => "Imagery",
            Dataset::RMTexture => "RMTexture",
            Dataset::RMDescriptor => "RMDescriptor",
            Dataset::GSFeature => "GSFeature",
            Dataset::GSModelGeometry => "GSModelGeometry",
            Dataset::GSModelTexture => "GSModelTexture",
            Dataset::GTFeature => "GTFeature",
            Dataset::GTModelGeometry500 => "GTModelGeometry",
            Dataset::GTModelTexture => "GTModelTexture",
            Dataset::RoadNetwork => "RoadNetwork",
            Dataset::RailRoadNetwork => "RailRoadNetwork",
            Dataset::PowerlineNetwork => "PowerlineNetwork",
            Dataset::HydrographyNetwork => "HydrographyNetwork",
        }
    }
}

impl fmt::Display for Dataset {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.directory_name())
    }
}

/// Output path tokens accepted in combine requests, one per emitted
/// dataset group. Several CDB datasets share one group (e.g. all the
/// GS datasets land under `GSModels`).
pub const DATASET_GROUP_PATHS: [&str; 7] = [
    "Elevation",
    "RoadNetwork",
    "RailRoadNetwork",
    "PowerlineNetwork",
    "HydrographyNetwork",
    "GTModels",
    "GSModels",
];

pub const ELEVATIONS_PATH: &str = "Elevation";
pub const ROAD_NETWORK_PATH: &str = "RoadNetwork";
pub const RAILROAD_NETWORK_PATH: &str = "RailRoadNetwork";
pub const POWERLINE_NETWORK_PATH: &str = "PowerlineNetwork";
pub const HYDROGRAPHY_NETWORK_PATH: &str = "HydrographyNetwork";
pub const GTMODEL_PATH: &str = "GTModels";
pub const GSMODEL_PATH: &str = "GSModels";

/// A parsed `{DatasetName}_{CS1}_{CS2}` combine token.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CombineToken {
    pub dataset_group: String,
    pub cs_1: u32,
    pub cs_2: u32,
}

/// Validates a combine request token.
///
/// The dataset name must be one of [`DATASET_GROUP_PATHS`] and both
/// component selectors must be non-empty digit strings.
pub fn parse_combine_token(token: &str) -> Result<CombineToken> {
    let malformed = |detail: &str| {
        Error::MalformedCombineToken(format!(
            "{token:?}: {detail}; required format is {{DatasetName}}_{{Component Selector 1}}_{{Component Selector 2}}"
        ))
    };

    let (name, rest) = token
        .split_once('_')
        .ok_or_else(|| malformed("missing component selectors"))?;
    if !DATASET_GROUP_PATHS.contains(&name) {
        return Err(Error::MalformedCombineToken(format!(
            "unrecognized dataset {name:?}; correct dataset names are: {}",
            DATASET_GROUP_PATHS.join(", ")
        )));
    }

    let (cs_1, cs_2) = rest
        .split_once('_')
        .ok_or_else(|| malformed("missing component selector 2"))?;
    if cs_1.is_empty() || !cs_1.bytes().all(|b| b.is_ascii_digit()) {
        return Err(malformed("component selector 1 has to be a number"));
    }
    if cs_2.is_empty() || !cs_2.bytes().all(|b| b.is_ascii_digit()) {
        return Err(malformed("component selector 2 has to be a number"));
    }

    Ok(CombineToken {
        dataset_group: name.to_string(),
        // digit strings within u32 range by construction of CDB selectors
        cs_1: cs_1.parse().map_err(|_| malformed("component selector 1 out of range"))?,
        cs_2: cs_2.parse().map_err(|_| malformed("component selector 2 out of range"))?,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_accepts_valid_tokens() {
        let t = parse_combine_token("Elevation_1_1").unwrap();
        assert_eq!(t.dataset_group, "Elevation");
        assert_eq!((t.cs_1, t.cs_2), (1, 1));

        assert!(parse_combine_token("GTModels_2_10").is_ok());
    }

    #[test]
    fn test_rejects_unknown_dataset() {
        let err = parse_combine_token("Unknown_1_1").unwrap_err();
        let msg = err.to_string();
        assert!(msg.contains("Unknown"));
        // the diagnostic lists every valid dataset name
        for name in DATASET_GROUP_PATHS {
            assert!(msg.contains(name), "missing {name} in {msg}");
        }
    }

    #[test]
    fn test_rejects_non_digit_selectors() {
        assert!(matches!(
            parse_combine_token("Elevation_1_x"),
            Err(Error::MalformedCombineToken(_))
        ));
        assert!(matches!(
            parse_combine_token("Elevation_x_1"),
            Err(Error::MalformedCombineToken(_))
        ));
        assert!(matches!(
            parse_combine_token("Elevation_1_"),
            Err(Error::MalformedCombineToken(_))
        ));
        assert!(matches!(
            parse_combine_token("Elevation"),
            Err(Error::MalformedCombineToken(_))
        ));
    }
}
