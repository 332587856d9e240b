//
// libskry_r - astronomical image stacking
// Copyright (c) 2017 Filip Szczerek <ga.software@yahoo.com>
//
// This project is licensed under the terms of the MIT license
// (see the LICENSE file for details).
//
//
// File description:
//   Processing pipeline configuration (JSON).
//

use crate::defs::Point;
use crate::img_align::AlignmentMethod;
use crate::ref_pt_align::RefPtAlignmentConfig;
use serde::{Deserialize, Serialize};
use std::path::Path;
use thiserror::Error;


#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("cannot read configuration file: {0}")]
    Io(#[from] std::io::Error),

    #[error("invalid configuration: {0}")]
    Parse(#[from] serde_json::Error)
}


/// Parameters of quality estimation.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct QualityConfig {
    /// Size (in pixels) of the square estimation areas.
    pub area_size: u32,

    /// Box blur radius used for quality estimation.
    pub detail_scale: u32
}


impl Default for QualityConfig {
    fn default() -> QualityConfig {
        QualityConfig{ area_size: 40, detail_scale: 3 }
    }
}


/// Parameters of all processing phases. Missing fields take default values.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PipelineConfig {
    pub alignment: AlignmentMethod,

    pub quality: QualityConfig,

    pub ref_pt_alignment: RefPtAlignmentConfig,

    /// Reference point positions within the images' intersection; placed automatically if absent.
    pub ref_points: Option<Vec<Point>>
}


impl PipelineConfig {
    pub fn from_json(json: &str) -> Result<PipelineConfig, ConfigError> {
        Ok(serde_json::from_str(json)?)
    }


    pub fn load<P: AsRef<Path>>(path: P) -> Result<PipelineConfig, ConfigError> {
        let contents = std::fs::read_to_string(path)?;
        let config = PipelineConfig::from_json(&contents)?;
        log::debug!("loaded configuration: {:?}", config);
        Ok(config)
    }
}


#[cfg(test)]
mod tests {
    use super::*;
    use crate::img_align::AnchorConfig;
    use crate::ref_pt_align::QualityCriterion;
    use std::io::Write;

    #[test]
    fn empty_object_gives_defaults() {
        assert_eq!(PipelineConfig::default(), PipelineConfig::from_json("{}").unwrap());
    }

    #[test]
    fn partial_config_overrides_given_fields() {
        let config = PipelineConfig::from_json(r#"{
            "alignment": { "method": "anchors", "initial_anchors": [{ "x": 60, "y": 50 }], "search_radius": 16 },
            "quality": { "area_size": 30 },
            "ref_pt_alignment": { "quality_criterion": { "number_best": 5 } },
            "ref_points": [{ "x": 10, "y": 20 }]
        }"#).unwrap();

        assert_eq!(AlignmentMethod::Anchors(AnchorConfig{
            initial_anchors: Some(vec![Point{ x: 60, y: 50 }]),
            search_radius: 16,
            ..AnchorConfig::default()
        }), config.alignment);
        assert_eq!(QualityConfig{ area_size: 30, detail_scale: 3 }, config.quality);
        assert_eq!(QualityCriterion::NumberBest(5), config.ref_pt_alignment.quality_criterion);
        assert_eq!(40, config.ref_pt_alignment.spacing);
        assert_eq!(Some(vec![Point{ x: 10, y: 20 }]), config.ref_points);
    }

    #[test]
    fn loads_from_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(file, r#"{{ "alignment": {{ "method": "centroid" }} }}"#).unwrap();

        let config = PipelineConfig::load(file.path()).unwrap();
        assert_eq!(AlignmentMethod::Centroid, config.alignment);
    }

    #[test]
    fn reports_errors() {
        assert!(matches!(PipelineConfig::from_json(r#"{ "quality": { "area_size": -1 } }"#), Err(ConfigError::Parse(_))));
        assert!(matches!(PipelineConfig::load("/nonexistent/skry_config.json"), Err(ConfigError::Io(_))));
    }
}
