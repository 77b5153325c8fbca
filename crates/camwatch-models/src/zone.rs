//! Zone analytics configuration.
//!
//! `ZoneConfigSpec` is the loose shape received from external configuration.
//! It is converted into a `ZoneConfig` exactly once, at task start, and any
//! structural inconsistency is rejected there.

use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

use crate::error::{ModelError, ModelResult};
use crate::geometry::Point;

/// Travel direction relative to a zone or line.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "snake_case")]
pub enum Direction {
    In,
    Out,
}

impl Direction {
    pub fn as_str(&self) -> &'static str {
        match self {
            Direction::In => "in",
            Direction::Out => "out",
        }
    }
}

/// Raw analysis family as it appears in configuration.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "snake_case")]
pub enum AnalysisKindSpec {
    Behavior,
    Counting,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "snake_case")]
pub enum GeometryKindSpec {
    Line,
    Polygon,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "snake_case")]
pub enum ModeSpec {
    #[default]
    Simple,
    Directional,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "snake_case")]
pub enum CountingKindSpec {
    Occupancy,
    Flow,
}

/// Which crossings a flow counter accepts.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "snake_case")]
pub enum FlowFilter {
    #[default]
    Bidirectional,
    In,
    Out,
}

impl FlowFilter {
    pub fn accepts(&self, direction: Direction) -> bool {
        match self {
            FlowFilter::Bidirectional => true,
            FlowFilter::In => direction == Direction::In,
            FlowFilter::Out => direction == Direction::Out,
        }
    }
}

/// Zone configuration as received from external configuration.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
pub struct ZoneConfigSpec {
    pub analysis_kind: AnalysisKindSpec,
    pub geometry: GeometryKindSpec,
    /// Normalized `[0,1]` vertices; two for a line, three or more for a polygon.
    pub points: Vec<Point>,
    #[serde(default)]
    pub mode: ModeSpec,
    #[serde(default)]
    pub direction: Option<Direction>,
    #[serde(default)]
    pub counting_kind: Option<CountingKindSpec>,
    #[serde(default)]
    pub flow_direction: FlowFilter,
    #[serde(default)]
    pub cooldown_seconds: Option<u64>,
    #[serde(default)]
    pub alert_enabled: bool,
    #[serde(default)]
    pub alert_threshold: Option<u32>,
    #[serde(default)]
    pub push_tag: Option<String>,
}

/// Validated zone geometry in normalized coordinates.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ZoneGeometry {
    Line { start: Point, end: Point },
    Polygon { vertices: Vec<Point> },
}

impl ZoneGeometry {
    /// Scale the geometry to pixel coordinates for a frame.
    pub fn denormalize(&self, width: u32, height: u32) -> ZoneGeometry {
        match self {
            ZoneGeometry::Line { start, end } => ZoneGeometry::Line {
                start: start.denormalize(width, height),
                end: end.denormalize(width, height),
            },
            ZoneGeometry::Polygon { vertices } => ZoneGeometry::Polygon {
                vertices: vertices
                    .iter()
                    .map(|p| p.denormalize(width, height))
                    .collect(),
            },
        }
    }

    pub fn is_line(&self) -> bool {
        matches!(self, ZoneGeometry::Line { .. })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
#[serde(tag = "mode", content = "direction", rename_all = "snake_case")]
pub enum BehaviorMode {
    Simple,
    Directional(Direction),
}

impl BehaviorMode {
    /// Whether an observed transition in `direction` should be emitted.
    pub fn accepts(&self, direction: Direction) -> bool {
        match self {
            BehaviorMode::Simple => true,
            BehaviorMode::Directional(wanted) => *wanted == direction,
        }
    }
}

/// Validated analysis configuration.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ZoneAnalysis {
    Behavior { mode: BehaviorMode },
    Occupancy,
    Flow { filter: FlowFilter },
}

impl ZoneAnalysis {
    pub fn as_str(&self) -> &'static str {
        match self {
            ZoneAnalysis::Behavior { .. } => "behavior",
            ZoneAnalysis::Occupancy => "occupancy",
            ZoneAnalysis::Flow { .. } => "flow",
        }
    }
}

/// Validated zone configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
pub struct ZoneConfig {
    pub geometry: ZoneGeometry,
    pub analysis: ZoneAnalysis,
    /// Overrides the task-level event cooldown for zone events when set.
    pub cooldown_seconds: Option<u64>,
    /// Occupancy alert threshold; `None` means alerting is disabled.
    pub alert_threshold: Option<u32>,
    pub push_tag: Option<String>,
}

impl TryFrom<ZoneConfigSpec> for ZoneConfig {
    type Error = ModelError;

    fn try_from(spec: ZoneConfigSpec) -> ModelResult<Self> {
        for p in &spec.points {
            if !(0.0..=1.0).contains(&p.x) || !(0.0..=1.0).contains(&p.y) {
                return Err(ModelError::invalid_zone(format!(
                    "point ({}, {}) is outside the normalized [0,1] range",
                    p.x, p.y
                )));
            }
        }

        let geometry = match spec.geometry {
            GeometryKindSpec::Line => {
                if spec.points.len() != 2 {
                    return Err(ModelError::invalid_zone(format!(
                        "line geometry needs exactly 2 points, got {}",
                        spec.points.len()
                    )));
                }
                ZoneGeometry::Line {
                    start: spec.points[0],
                    end: spec.points[1],
                }
            }
            GeometryKindSpec::Polygon => {
                if spec.points.len() < 3 {
                    return Err(ModelError::invalid_zone(format!(
                        "polygon geometry needs at least 3 points, got {}",
                        spec.points.len()
                    )));
                }
                ZoneGeometry::Polygon {
                    vertices: spec.points.clone(),
                }
            }
        };

        let analysis = match spec.analysis_kind {
            AnalysisKindSpec::Behavior => {
                let mode = match spec.mode {
                    ModeSpec::Simple => BehaviorMode::Simple,
                    ModeSpec::Directional => BehaviorMode::Directional(spec.direction.ok_or_else(
                        || ModelError::invalid_zone("directional mode requires a direction"),
                    )?),
                };
                ZoneAnalysis::Behavior { mode }
            }
            AnalysisKindSpec::Counting => match spec.counting_kind {
                Some(CountingKindSpec::Occupancy) => {
                    if geometry.is_line() {
                        return Err(ModelError::invalid_zone(
                            "occupancy counting requires a polygon",
                        ));
                    }
                    ZoneAnalysis::Occupancy
                }
                Some(CountingKindSpec::Flow) => {
                    if !geometry.is_line() {
                        return Err(ModelError::invalid_zone("flow counting requires a line"));
                    }
                    ZoneAnalysis::Flow {
                        filter: spec.flow_direction,
                    }
                }
                None => {
                    return Err(ModelError::invalid_zone(
                        "counting analysis requires counting_kind",
                    ))
                }
            },
        };

        let alert_threshold = if spec.alert_enabled {
            match spec.alert_threshold {
                Some(t) if t > 0 => Some(t),
                _ => {
                    return Err(ModelError::invalid_zone(
                        "alert_enabled requires a positive alert_threshold",
                    ))
                }
            }
        } else {
            None
        };

        let push_tag = spec.push_tag.filter(|t| !t.trim().is_empty());

        Ok(ZoneConfig {
            geometry,
            analysis,
            cooldown_seconds: spec.cooldown_seconds,
            alert_threshold,
            push_tag,
        })
    }
}
