//! Overlay rendering and JPEG encoding for previews and snapshots.

use base64::{engine::general_purpose::STANDARD, Engine as _};
use camwatch_models::{Detection, Point, TrackView, ZoneGeometry};
use image::codecs::jpeg::JpegEncoder;
use image::{ColorType, Rgb, RgbImage};
use imageproc::drawing::{draw_filled_circle_mut, draw_hollow_rect_mut, draw_line_segment_mut};
use imageproc::rect::Rect;

use crate::error::{VisionError, VisionResult};

/// Quality used for live previews.
pub const PREVIEW_JPEG_QUALITY: u8 = 70;
/// Quality used for stored snapshots.
pub const SNAPSHOT_JPEG_QUALITY: u8 = 90;

const ZONE_COLOR: Rgb<u8> = Rgb([255, 64, 64]);

const PALETTE: [[u8; 3]; 8] = [
    [56, 56, 255],
    [151, 157, 255],
    [31, 112, 255],
    [29, 178, 255],
    [49, 210, 207],
    [10, 249, 72],
    [23, 204, 146],
    [134, 219, 61],
];

/// Stable color for a class id.
pub fn class_color(class_id: u32) -> Rgb<u8> {
    Rgb(PALETTE[class_id as usize % PALETTE.len()])
}

/// What to draw on top of a frame.
#[derive(Debug, Default, Clone, Copy)]
pub struct Overlay<'a> {
    pub detections: &'a [Detection],
    pub tracks: &'a [TrackView],
    /// Zone geometry in pixel coordinates.
    pub zone: Option<&'a ZoneGeometry>,
}

/// Draw the overlay onto a copy of `image`.
pub fn annotate(image: &RgbImage, overlay: &Overlay<'_>) -> RgbImage {
    let mut canvas = image.clone();

    if let Some(zone) = overlay.zone {
        draw_zone(&mut canvas, zone);
    }

    for det in overlay.detections {
        draw_box(&mut canvas, det.bbox.x, det.bbox.y, det.bbox.width, det.bbox.height, class_color(det.class_id));
    }

    for track in overlay.tracks {
        let color = class_color(track.class_id);
        for pair in track.trajectory.windows(2) {
            draw_line_segment_mut(&mut canvas, to_f32(&pair[0]), to_f32(&pair[1]), color);
        }
        if let Some(last) = track.trajectory.last() {
            draw_filled_circle_mut(&mut canvas, (last.x as i32, last.y as i32), 3, color);
        }
    }

    canvas
}

fn to_f32(p: &Point) -> (f32, f32) {
    (p.x as f32, p.y as f32)
}

fn draw_box(canvas: &mut RgbImage, x: f64, y: f64, w: f64, h: f64, color: Rgb<u8>) {
    let width = w.round().max(1.0) as u32;
    let height = h.round().max(1.0) as u32;
    let rect = Rect::at(x.round() as i32, y.round() as i32).of_size(width, height);
    draw_hollow_rect_mut(canvas, rect, color);
}

fn draw_zone(canvas: &mut RgbImage, zone: &ZoneGeometry) {
    match zone {
        ZoneGeometry::Line { start, end } => {
            draw_line_segment_mut(canvas, to_f32(start), to_f32(end), ZONE_COLOR);
        }
        ZoneGeometry::Polygon { vertices } => {
            for (i, a) in vertices.iter().enumerate() {
                let b = &vertices[(i + 1) % vertices.len()];
                draw_line_segment_mut(canvas, to_f32(a), to_f32(b), ZONE_COLOR);
            }
        }
    }
}

/// Encode an RGB image as JPEG.
pub fn encode_jpeg(image: &RgbImage, quality: u8) -> VisionResult<Vec<u8>> {
    if image.width() == 0 || image.height() == 0 {
        return Err(VisionError::encode("cannot encode an empty image"));
    }
    let mut buf = Vec::new();
    let mut encoder = JpegEncoder::new_with_quality(&mut buf, quality.clamp(1, 100));
    encoder.encode(image.as_raw(), image.width(), image.height(), ColorType::Rgb8)?;
    Ok(buf)
}

/// Encode an RGB image as base64 JPEG, as carried in preview messages.
pub fn encode_base64_jpeg(image: &RgbImage, quality: u8) -> VisionResult<String> {
    Ok(STANDARD.encode(encode_jpeg(image, quality)?))
}
