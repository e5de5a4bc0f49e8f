use serde::{Deserialize, Serialize};

/// Queue carrying `image_id` items for the detection workers.
pub const DETECT_QUEUE: &str = "detect";
/// Queue carrying `detection_id` items for the Re-ID workers.
pub const REID_QUEUE: &str = "reid";

// --- Detector classes ---

/// Coarse detector class. `Other` covers every non-deer label the detector
/// emits; non-deer detections are persisted for inventory but never enter
/// Re-ID.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DeerClass {
    Doe,
    Fawn,
    Mature,
    Mid,
    Young,
    Other,
}

impl DeerClass {
    pub fn is_deer(&self) -> bool {
        !matches!(self, DeerClass::Other)
    }

    /// Sex implied by the detector class. Antlered classes map to buck.
    pub fn implied_sex(&self) -> Sex {
        match self {
            DeerClass::Mature | DeerClass::Mid | DeerClass::Young => Sex::Buck,
            DeerClass::Doe => Sex::Doe,
            DeerClass::Fawn => Sex::Fawn,
            DeerClass::Other => Sex::Unknown,
        }
    }
}

impl std::fmt::Display for DeerClass {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            DeerClass::Doe => write!(f, "doe"),
            DeerClass::Fawn => write!(f, "fawn"),
            DeerClass::Mature => write!(f, "mature"),
            DeerClass::Mid => write!(f, "mid"),
            DeerClass::Young => write!(f, "young"),
            DeerClass::Other => write!(f, "other"),
        }
    }
}

impl std::str::FromStr for DeerClass {
    type Err = String;
    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s {
            "doe" => Ok(Self::Doe),
            "fawn" => Ok(Self::Fawn),
            "mature" => Ok(Self::Mature),
            "mid" => Ok(Self::Mid),
            "young" => Ok(Self::Young),
            "other" => Ok(Self::Other),
            other => Err(format!("unknown DeerClass: {other}")),
        }
    }
}

// --- Profile sex ---

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Sex {
    Buck,
    Doe,
    Fawn,
    Unknown,
}

impl std::fmt::Display for Sex {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Sex::Buck => write!(f, "buck"),
            Sex::Doe => write!(f, "doe"),
            Sex::Fawn => write!(f, "fawn"),
            Sex::Unknown => write!(f, "unknown"),
        }
    }
}

impl std::str::FromStr for Sex {
    type Err = String;
    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s {
            "buck" => Ok(Self::Buck),
            "doe" => Ok(Self::Doe),
            "fawn" => Ok(Self::Fawn),
            "unknown" => Ok(Self::Unknown),
            other => Err(format!("unknown Sex: {other}")),
        }
    }
}

// --- Image processing status ---

/// State machine: `pending → processing → {completed, failed}`. Any other
/// transition requires operator intervention; the stores enforce this with a
/// compare-and-swap on the stored value.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProcessingStatus {
    Pending,
    Processing,
    Completed,
    Failed,
}

impl ProcessingStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(self, ProcessingStatus::Completed | ProcessingStatus::Failed)
    }
}

impl std::fmt::Display for ProcessingStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ProcessingStatus::Pending => write!(f, "pending"),
            ProcessingStatus::Processing => write!(f, "processing"),
            ProcessingStatus::Completed => write!(f, "completed"),
            ProcessingStatus::Failed => write!(f, "failed"),
        }
    }
}

impl std::str::FromStr for ProcessingStatus {
    type Err = String;
    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s {
            "pending" => Ok(Self::Pending),
            "processing" => Ok(Self::Processing),
            "completed" => Ok(Self::Completed),
            "failed" => Ok(Self::Failed),
            other => Err(format!("unknown ProcessingStatus: {other}")),
        }
    }
}

// --- Bounding box ---

/// Axis-aligned rectangle in image pixel coordinates.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct BBox {
    pub x: i32,
    pub y: i32,
    pub width: i32,
    pub height: i32,
}

impl BBox {
    pub fn new(x: i32, y: i32, width: i32, height: i32) -> Self {
        Self {
            x,
            y,
            width,
            height,
        }
    }

    pub fn area(&self) -> i64 {
        (self.width.max(0) as i64) * (self.height.max(0) as i64)
    }

    /// Area of overlap with another box. Zero when disjoint.
    pub fn intersection(&self, other: &BBox) -> i64 {
        let left = self.x.max(other.x);
        let top = self.y.max(other.y);
        let right = (self.x + self.width).min(other.x + other.width);
        let bottom = (self.y + self.height).min(other.y + other.height);
        if right <= left || bottom <= top {
            return 0;
        }
        ((right - left) as i64) * ((bottom - top) as i64)
    }

    /// Intersection-over-union. Zero when either box is degenerate.
    pub fn iou(&self, other: &BBox) -> f32 {
        let inter = self.intersection(other);
        let union = self.area() + other.area() - inter;
        if union <= 0 {
            return 0.0;
        }
        inter as f32 / union as f32
    }

    /// Expand by `pad` pixels on every side, clamped to an image of
    /// `img_w` x `img_h`.
    pub fn padded(&self, pad: i32, img_w: u32, img_h: u32) -> BBox {
        let left = (self.x - pad).max(0);
        let top = (self.y - pad).max(0);
        let right = (self.x + self.width + pad).min(img_w as i32);
        let bottom = (self.y + self.height + pad).min(img_h as i32);
        BBox {
            x: left,
            y: top,
            width: (right - left).max(0),
            height: (bottom - top).max(0),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::str::FromStr;

    #[test]
    fn class_round_trips_and_rejects_unknown() {
        for class in [
            DeerClass::Doe,
            DeerClass::Fawn,
            DeerClass::Mature,
            DeerClass::Mid,
            DeerClass::Young,
            DeerClass::Other,
        ] {
            assert_eq!(DeerClass::from_str(&class.to_string()).unwrap(), class);
        }
        assert!(DeerClass::from_str("Doe").is_err());
        assert!(DeerClass::from_str("elk").is_err());
    }

    #[test]
    fn implied_sex_maps_antlered_classes_to_buck() {
        assert_eq!(DeerClass::Mature.implied_sex(), Sex::Buck);
        assert_eq!(DeerClass::Mid.implied_sex(), Sex::Buck);
        assert_eq!(DeerClass::Young.implied_sex(), Sex::Buck);
        assert_eq!(DeerClass::Doe.implied_sex(), Sex::Doe);
        assert_eq!(DeerClass::Fawn.implied_sex(), Sex::Fawn);
        assert_eq!(DeerClass::Other.implied_sex(), Sex::Unknown);
    }

    #[test]
    fn status_rejects_non_canonical_forms() {
        assert!(ProcessingStatus::from_str("PENDING").is_err());
        assert!(ProcessingStatus::from_str("done").is_err());
        assert_eq!(
            ProcessingStatus::from_str("failed").unwrap(),
            ProcessingStatus::Failed
        );
    }

    #[test]
    fn iou_of_identical_boxes_is_one() {
        let b = BBox::new(10, 10, 100, 50);
        assert!((b.iou(&b) - 1.0).abs() < 1e-6);
    }

    #[test]
    fn iou_of_disjoint_boxes_is_zero() {
        let a = BBox::new(0, 0, 10, 10);
        let b = BBox::new(100, 100, 10, 10);
        assert_eq!(a.iou(&b), 0.0);
    }

    #[test]
    fn iou_half_overlap() {
        // Two 10x10 boxes overlapping in a 10x5 strip: 50 / 150.
        let a = BBox::new(0, 0, 10, 10);
        let b = BBox::new(0, 5, 10, 10);
        assert!((a.iou(&b) - 50.0 / 150.0).abs() < 1e-6);
    }

    #[test]
    fn padded_clamps_to_image_bounds() {
        let b = BBox::new(2, 3, 10, 10);
        let p = b.padded(5, 20, 20);
        assert_eq!(p, BBox::new(0, 0, 17, 18));
    }
}
