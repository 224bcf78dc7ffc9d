/// COCO class ids counted as vehicles: car, motorcycle, bus, truck.
pub const VEHICLE_CLASSES: [u32; 4] = [2, 3, 5, 7];

/// Integer pixel rectangle. Coordinates may fall outside the frame.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct BoundingBox {
    pub x: i32,
    pub y: i32,
    pub width: i32,
    pub height: i32,
}

impl BoundingBox {
    pub fn new(x: i32, y: i32, width: i32, height: i32) -> Self {
        Self {
            x,
            y,
            width,
            height,
        }
    }

    /// Area in square pixels; degenerate rectangles have zero area.
    pub fn area(&self) -> i64 {
        self.width.max(0) as i64 * self.height.max(0) as i64
    }

    /// Intersection over union with `other`, in `0.0..=1.0`.
    pub fn iou(&self, other: &BoundingBox) -> f32 {
        let left = self.x.max(other.x) as i64;
        let top = self.y.max(other.y) as i64;
        let right = (self.x as i64 + self.width.max(0) as i64)
            .min(other.x as i64 + other.width.max(0) as i64);
        let bottom = (self.y as i64 + self.height.max(0) as i64)
            .min(other.y as i64 + other.height.max(0) as i64);
        let intersection = (right - left).max(0) * (bottom - top).max(0);
        let union = self.area() + other.area() - intersection;
        if union <= 0 {
            return 0.0;
        }
        intersection as f32 / union as f32
    }
}

#[derive(Clone, Debug, PartialEq)]
pub struct Detection {
    pub bbox: BoundingBox,
    pub confidence: f32,
    pub class_id: u32,
    pub label: String,
}

/// Vehicles found in one frame, after suppression, highest confidence first.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct DetectionResult {
    pub detections: Vec<Detection>,
    pub frame_width: u32,
    pub frame_height: u32,
}

impl DetectionResult {
    pub fn len(&self) -> usize {
        self.detections.len()
    }

    pub fn is_empty(&self) -> bool {
        self.detections.is_empty()
    }

    pub fn boxes(&self) -> impl Iterator<Item = &BoundingBox> {
        self.detections.iter().map(|d| &d.bbox)
    }
}

/// Built-in names for the vehicle classes, used when no label file is loaded.
pub fn vehicle_label(class_id: u32) -> &'static str {
    match class_id {
        2 => "car",
        3 => "motorcycle",
        5 => "bus",
        7 => "truck",
        _ => "unknown",
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn area_ignores_negative_extent() {
        assert_eq!(BoundingBox::new(0, 0, 40, 25).area(), 1000);
        assert_eq!(BoundingBox::new(5, 5, -3, 10).area(), 0);
    }

    #[test]
    fn iou_of_identical_and_disjoint_boxes() {
        let a = BoundingBox::new(10, 10, 20, 20);
        let b = BoundingBox::new(100, 100, 20, 20);
        assert!((a.iou(&a) - 1.0).abs() < f32::EPSILON);
        assert_eq!(a.iou(&b), 0.0);
    }

    #[test]
    fn iou_of_half_overlap() {
        let a = BoundingBox::new(0, 0, 10, 10);
        let b = BoundingBox::new(5, 0, 10, 10);
        // 50 / (100 + 100 - 50)
        assert!((a.iou(&b) - 1.0 / 3.0).abs() < 1e-6);
    }
}
