//! Path metadata extraction.
//!
//! Dataset trees encode identity in directory position rather than in the
//! files themselves. Each convention is a [`PathStrategy`] returning a tagged
//! [`Extraction`]; a path that does not follow the convention is a skip, not
//! an error.

use crate::error::SkipReason;
use regex::Regex;
use std::path::{Component, Path};

/// Outcome of applying a path convention
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Extraction<T> {
    Resolved(T),
    Skipped(SkipReason),
}

/// A directory/file naming convention
pub trait PathStrategy {
    type Output;

    fn extract(&self, path: &Path) -> Extraction<Self::Output>;
}

/// Vehicle and sensor recovered from `<marker>/<vehicle>/<sensor>/...`
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SensorLocation {
    pub vehicle: String,
    pub sensor: String,
}

/// Directory segments of a path, excluding the file name
fn dir_segments(path: &Path) -> Vec<String> {
    let parent = path.parent().unwrap_or_else(|| Path::new(""));
    parent
        .components()
        .filter_map(|c| match c {
            Component::Normal(s) => Some(s.to_string_lossy().into_owned()),
            _ => None,
        })
        .collect()
}

/// Segments following the first occurrence of `marker`
fn after_marker(path: &Path, marker: &str) -> Result<Vec<String>, SkipReason> {
    let segments = dir_segments(path);
    let idx = segments
        .iter()
        .position(|s| s == marker)
        .ok_or_else(|| SkipReason::NoMarker(marker.to_string()))?;
    Ok(segments[idx + 1..].to_vec())
}

/// `<marker>/<vehicle>/<sensor>/<file>` convention of the flat datasets
#[derive(Debug, Clone)]
pub struct MarkerPathParser {
    marker: String,
}

impl MarkerPathParser {
    pub fn new(marker: impl Into<String>) -> Self {
        Self {
            marker: marker.into(),
        }
    }
}

impl PathStrategy for MarkerPathParser {
    type Output = SensorLocation;

    fn extract(&self, path: &Path) -> Extraction<SensorLocation> {
        let following = match after_marker(path, &self.marker) {
            Ok(following) => following,
            Err(reason) => return Extraction::Skipped(reason),
        };

        match following.as_slice() {
            [vehicle, sensor, ..] => Extraction::Resolved(SensorLocation {
                vehicle: vehicle.clone(),
                sensor: sensor.clone(),
            }),
            _ => Extraction::Skipped(SkipReason::TooFewSegments {
                needed: 2,
                found: following.len(),
            }),
        }
    }
}

/// Sensor modality encoded in columnar file names
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Modality {
    Audio,
    Seismic,
}

impl Modality {
    pub fn from_code(code: &str) -> Option<Self> {
        match code {
            "mic" => Some(Modality::Audio),
            "geo" => Some(Modality::Seismic),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Modality::Audio => "audio",
            Modality::Seismic => "seismic",
        }
    }
}

/// Identity of one columnar sensor file
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RunFile {
    pub scene: String,
    pub run_id: u32,
    /// `rs<digits>`, used as the sensor name
    pub sensor: String,
    pub modality: Modality,
}

/// `<marker>/<scene>/.../run<N>_rs<N>_<mod>.<ext>` convention of M3N-VC
#[derive(Debug, Clone)]
pub struct RunFilePathParser {
    marker: String,
    pattern: Regex,
}

impl RunFilePathParser {
    pub fn new(marker: impl Into<String>) -> Self {
        Self {
            marker: marker.into(),
            pattern: Regex::new(r"^run(\d+)_(rs\d+)_([A-Za-z]{3})$")
                .expect("run file pattern is valid"),
        }
    }
}

impl PathStrategy for RunFilePathParser {
    type Output = RunFile;

    fn extract(&self, path: &Path) -> Extraction<RunFile> {
        let scene = match after_marker(path, &self.marker) {
            Ok(following) => match following.into_iter().next() {
                Some(scene) => scene,
                None => {
                    return Extraction::Skipped(SkipReason::TooFewSegments {
                        needed: 1,
                        found: 0,
                    })
                }
            },
            Err(reason) => return Extraction::Skipped(reason),
        };

        let stem = path
            .file_stem()
            .map(|s| s.to_string_lossy().into_owned())
            .unwrap_or_default();

        let Some(caps) = self.pattern.captures(&stem) else {
            return Extraction::Skipped(SkipReason::FilenamePattern(stem));
        };

        let Ok(run_id) = caps[1].parse::<u32>() else {
            return Extraction::Skipped(SkipReason::FilenamePattern(stem));
        };

        match Modality::from_code(&caps[3]) {
            Some(modality) => Extraction::Resolved(RunFile {
                scene,
                run_id,
                sensor: caps[2].to_string(),
                modality,
            }),
            None => Extraction::Skipped(SkipReason::UnknownModality(caps[3].to_string())),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_marker_resolves_vehicle_and_sensor() {
        let parser = MarkerPathParser::new("MOD_vehicle");
        let result = parser.extract(Path::new("/data/MOD_vehicle/truck1/s01/aud.csv"));
        assert_eq!(
            result,
            Extraction::Resolved(SensorLocation {
                vehicle: "truck1".to_string(),
                sensor: "s01".to_string(),
            })
        );
    }

    #[test]
    fn test_marker_ignores_deeper_segments() {
        let parser = MarkerPathParser::new("MOD_vehicle");
        let result = parser.extract(Path::new("MOD_vehicle/tesla/rs3/session2/ehz.csv"));
        assert!(matches!(
            result,
            Extraction::Resolved(SensorLocation { ref vehicle, ref sensor })
                if vehicle == "tesla" && sensor == "rs3"
        ));
    }

    #[test]
    fn test_repeated_marker_uses_first_occurrence() {
        let parser = MarkerPathParser::new("MOD_vehicle");
        let result = parser.extract(Path::new("/data/MOD_vehicle/truck1/MOD_vehicle/s01/aud.csv"));
        assert_eq!(
            result,
            Extraction::Resolved(SensorLocation {
                vehicle: "truck1".to_string(),
                sensor: "MOD_vehicle".to_string(),
            })
        );
    }

    #[test]
    fn test_missing_marker_is_skip() {
        let parser = MarkerPathParser::new("MOD_vehicle");
        let result = parser.extract(Path::new("/data/other/truck1/s01/aud.csv"));
        assert_eq!(
            result,
            Extraction::Skipped(SkipReason::NoMarker("MOD_vehicle".to_string()))
        );
    }

    #[test]
    fn test_too_few_segments_is_skip() {
        let parser = MarkerPathParser::new("MOD_vehicle");
        // the file name does not count as the sensor segment
        let result = parser.extract(Path::new("/data/MOD_vehicle/truck1/aud.csv"));
        assert_eq!(
            result,
            Extraction::Skipped(SkipReason::TooFewSegments { needed: 2, found: 1 })
        );
    }

    #[test]
    fn test_run_file_resolves() {
        let parser = RunFilePathParser::new("M3NVC");
        let result = parser.extract(Path::new("/ds/M3NVC/scene_a/rs2/run12_rs2_geo.parquet"));
        assert_eq!(
            result,
            Extraction::Resolved(RunFile {
                scene: "scene_a".to_string(),
                run_id: 12,
                sensor: "rs2".to_string(),
                modality: Modality::Seismic,
            })
        );
    }

    #[test]
    fn test_run_file_unknown_modality() {
        let parser = RunFilePathParser::new("M3NVC");
        let result = parser.extract(Path::new("/ds/M3NVC/scene_a/run1_rs2_acc.parquet"));
        assert_eq!(
            result,
            Extraction::Skipped(SkipReason::UnknownModality("acc".to_string()))
        );
    }

    #[test]
    fn test_run_file_pattern_must_match_exactly() {
        let parser = RunFilePathParser::new("M3NVC");
        for name in ["run1_rs2_mic_v2.parquet", "xrun1_rs2_mic.parquet", "run_rs2_mic.parquet"] {
            let path = Path::new("/ds/M3NVC/scene_a").join(name);
            assert!(
                matches!(
                    parser.extract(&path),
                    Extraction::Skipped(SkipReason::FilenamePattern(_))
                ),
                "{name} should not match"
            );
        }
    }

    #[test]
    fn test_modality_codes() {
        assert_eq!(Modality::from_code("mic"), Some(Modality::Audio));
        assert_eq!(Modality::from_code("geo"), Some(Modality::Seismic));
        assert_eq!(Modality::from_code("gps"), None);
    }
}
