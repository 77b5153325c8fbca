//! Pixel-space geometry shared by the detector, tracker and overlays.

use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

/// A point in pixel (or normalized) coordinates.
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize, JsonSchema)]
pub struct Point {
    pub x: f64,
    pub y: f64,
}

impl Point {
    pub fn new(x: f64, y: f64) -> Self {
        Self { x, y }
    }

    /// Euclidean distance to another point.
    pub fn distance(&self, other: &Point) -> f64 {
        ((self.x - other.x).powi(2) + (self.y - other.y).powi(2)).sqrt()
    }

    /// Scale a normalized `[0,1]` point into a frame of the given size.
    pub fn denormalize(&self, width: u32, height: u32) -> Point {
        Point {
            x: self.x * width as f64,
            y: self.y * height as f64,
        }
    }
}

/// Axis-aligned box in frame pixels, top-left origin.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize, JsonSchema)]
pub struct BoundingBox {
    pub x: f64,
    pub y: f64,
    pub width: f64,
    pub height: f64,
}

impl BoundingBox {
    pub fn new(x: f64, y: f64, width: f64, height: f64) -> Self {
        Self { x, y, width, height }
    }

    /// Create a box from corner coordinates `(x1, y1, x2, y2)`.
    pub fn from_corners(x1: f64, y1: f64, x2: f64, y2: f64) -> Self {
        let (left, right) = if x1 <= x2 { (x1, x2) } else { (x2, x1) };
        let (top, bottom) = if y1 <= y2 { (y1, y2) } else { (y2, y1) };
        Self {
            x: left,
            y: top,
            width: right - left,
            height: bottom - top,
        }
    }

    #[inline]
    pub fn cx(&self) -> f64 {
        self.x + self.width / 2.0
    }

    #[inline]
    pub fn cy(&self) -> f64 {
        self.y + self.height / 2.0
    }

    #[inline]
    pub fn center(&self) -> Point {
        Point::new(self.cx(), self.cy())
    }

    #[inline]
    pub fn x2(&self) -> f64 {
        self.x + self.width
    }

    #[inline]
    pub fn y2(&self) -> f64 {
        self.y + self.height
    }

    #[inline]
    pub fn area(&self) -> f64 {
        self.width * self.height
    }

    /// Intersection over union; 0 for disjoint or degenerate boxes.
    pub fn iou(&self, other: &BoundingBox) -> f64 {
        let overlap_w = (self.x2().min(other.x2()) - self.x.max(other.x)).max(0.0);
        let overlap_h = (self.y2().min(other.y2()) - self.y.max(other.y)).max(0.0);
        let shared = overlap_w * overlap_h;
        if shared <= 0.0 {
            return 0.0;
        }
        shared / (self.area() + other.area() - shared)
    }
}

/// A single detector output.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
pub struct Detection {
    pub bbox: BoundingBox,
    pub confidence: f32,
    pub class_id: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub class_name: Option<String>,
}

impl Detection {
    pub fn new(bbox: BoundingBox, confidence: f32, class_id: u32) -> Self {
        Self {
            bbox,
            confidence,
            class_id,
            class_name: None,
        }
    }
}
