//! The palm detection record shared between CPU and GPU code.

pub mod anchors;

use nalgebra::{Point2, Rotation2, Vector2};

/// Maximum number of detections a pipeline run can produce.
///
/// This value must be matched with `MAX_DETECTION` in the WGSL shaders.
pub const MAX_DETECTIONS: usize = 64;

/// A single detected palm.
///
/// The layout of this structure must be matched with the `Detection` struct
/// defined in the WGSL shaders: 20 consecutive 32-bit floats, no implicit
/// padding. Both sides read and write these records byte-for-byte, so the
/// field order and the three explicit padding floats are part of the
/// contract.
///
/// All coordinates are in normalized image space: `[0, 1]` on both axes,
/// origin in the top-left corner.
#[derive(Debug, Clone, Copy, PartialEq, bytemuck::Pod, bytemuck::Zeroable)]
#[repr(C)]
pub struct Detection {
    /// Center of the axis-aligned bounding box.
    pub center: [f32; 2],
    /// Width and height of the bounding box.
    pub extent: [f32; 2],

    // Key points.
    pub wrist: [f32; 2],
    pub index_mcp: [f32; 2],
    pub middle_mcp: [f32; 2],
    pub ring_mcp: [f32; 2],
    pub pinky_mcp: [f32; 2],
    pub thumb_cmc: [f32; 2],

    /// Confidence score in `[0, 1]`.
    pub score: f32,

    pad: [f32; 3],
}

/// `size_of::<Detection>()`, a cross-boundary constant.
pub const DETECTION_SIZE: usize = 20 * 4;

const _: () = assert!(std::mem::size_of::<Detection>() == DETECTION_SIZE);

impl Detection {
    /// Creates a detection from its bounding box, keypoints, and confidence.
    pub fn new(center: [f32; 2], extent: [f32; 2], keypoints: [[f32; 2]; 6], score: f32) -> Self {
        Self {
            center,
            extent,
            wrist: keypoints[0],
            index_mcp: keypoints[1],
            middle_mcp: keypoints[2],
            ring_mcp: keypoints[3],
            pinky_mcp: keypoints[4],
            thumb_cmc: keypoints[5],
            score,
            pad: [0.0; 3],
        }
    }

    /// Decodes an anchor-relative regressor row into an absolute detection.
    ///
    /// This is the reference implementation of the affine transform performed
    /// by the aggregation shader: the box center and every keypoint are
    /// offsets from the anchor's reference position, scaled by the network's
    /// input size; the box extent is scaled the same way.
    ///
    /// `score` is expected to already have the model's activation (sigmoid)
    /// applied.
    pub fn decode(anchor: [f32; 2], regressors: &[f32; 18], score: f32, image_size: f32) -> Self {
        let s = 1.0 / image_size;
        let at = |i: usize| [anchor[0] + regressors[i] * s, anchor[1] + regressors[i + 1] * s];

        Self::new(
            at(0),
            [regressors[2] * s, regressors[3] * s],
            [at(4), at(6), at(8), at(10), at(12), at(14)],
            score,
        )
    }

    /// Returns the requested keypoint, in normalized image coordinates.
    pub fn keypoint(&self, kp: Keypoint) -> [f32; 2] {
        match kp {
            Keypoint::Wrist => self.wrist,
            Keypoint::IndexFingerMcp => self.index_mcp,
            Keypoint::MiddleFingerMcp => self.middle_mcp,
            Keypoint::RingFingerMcp => self.ring_mcp,
            Keypoint::PinkyMcp => self.pinky_mcp,
            Keypoint::ThumbCmc => self.thumb_cmc,
        }
    }

    /// Returns the bounding box corners as `[min_x, min_y, max_x, max_y]`,
    /// in normalized image coordinates.
    pub fn bounding_rect(&self) -> [f32; 4] {
        [
            self.center[0] - self.extent[0] * 0.5,
            self.center[1] - self.extent[1] * 0.5,
            self.center[0] + self.extent[0] * 0.5,
            self.center[1] + self.extent[1] * 0.5,
        ]
    }

    /// Computes the intersection-over-union of the bounding boxes of `self`
    /// and `other`.
    pub fn iou(&self, other: &Detection) -> f32 {
        let a = self.bounding_rect();
        let b = other.bounding_rect();

        let ix = f32::min(a[2], b[2]) - f32::max(a[0], b[0]);
        let iy = f32::min(a[3], b[3]) - f32::max(a[1], b[1]);
        if ix <= 0.0 || iy <= 0.0 {
            return 0.0;
        }

        let intersection = ix * iy;
        let union = self.extent[0] * self.extent[1] + other.extent[0] * other.extent[1]
            - intersection;
        if union <= 0.0 {
            0.0
        } else {
            intersection / union
        }
    }

    /// Returns the rotation of the palm, in radians, clockwise.
    ///
    /// Computed from the wrist→middle finger direction; an upright palm
    /// (fingers pointing up) has an angle of 0.
    pub fn rotation_angle(&self) -> f32 {
        let finger = Point2::new(self.middle_mcp[0], self.middle_mcp[1]);
        let wrist = Point2::new(self.wrist[0], self.wrist[1]);
        let rel = wrist - finger;
        Rotation2::rotation_between(&Vector2::y(), &rel).angle()
    }
}

/// A keypoint of a [`Detection`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Keypoint {
    Wrist = 0,
    IndexFingerMcp = 1,
    MiddleFingerMcp = 2,
    RingFingerMcp = 3,
    PinkyMcp = 4,
    ThumbCmc = 5,
}

/// A list of all [`Keypoint`]s.
pub const ALL_KEYPOINTS: &[Keypoint] = &[
    Keypoint::Wrist,
    Keypoint::IndexFingerMcp,
    Keypoint::MiddleFingerMcp,
    Keypoint::RingFingerMcp,
    Keypoint::PinkyMcp,
    Keypoint::ThumbCmc,
];

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    #[test]
    fn layout_is_20_floats() {
        assert_eq!(std::mem::size_of::<Detection>(), 80);
        assert_eq!(std::mem::align_of::<Detection>(), 4);

        // The score must land right after the 8 2D vectors.
        let det = Detection::new([0.0; 2], [0.0; 2], [[0.0; 2]; 6], 0.25);
        let raw: &[f32; 20] = bytemuck::cast_ref(&det);
        assert_eq!(raw[16], 0.25);
        assert_eq!(&raw[17..], &[0.0; 3]);
    }

    #[test]
    fn decode_hand_computed() {
        // Anchor at (0.25, 0.5) of a 128px input. Box offset (16, -32) px,
        // size 64x32 px, wrist offset (8, 8) px.
        let mut regressors = [0.0; 18];
        regressors[0] = 16.0;
        regressors[1] = -32.0;
        regressors[2] = 64.0;
        regressors[3] = 32.0;
        regressors[4] = 8.0;
        regressors[5] = 8.0;
        regressors[16] = -8.0; // thumb x
        regressors[17] = 4.0; // thumb y

        let det = Detection::decode([0.25, 0.5], &regressors, 0.9, 128.0);
        assert_relative_eq!(det.center[0], 0.25 + 16.0 / 128.0);
        assert_relative_eq!(det.center[1], 0.5 - 32.0 / 128.0);
        assert_relative_eq!(det.extent[0], 0.5);
        assert_relative_eq!(det.extent[1], 0.25);
        assert_relative_eq!(det.wrist[0], 0.25 + 8.0 / 128.0);
        assert_relative_eq!(det.wrist[1], 0.5 + 8.0 / 128.0);
        assert_relative_eq!(det.keypoint(Keypoint::ThumbCmc)[0], 0.25 - 8.0 / 128.0);
        assert_relative_eq!(det.keypoint(Keypoint::ThumbCmc)[1], 0.5 + 4.0 / 128.0);
        assert_eq!(det.score, 0.9);

        // Keypoints that were not set decode to the anchor position itself.
        assert_relative_eq!(det.keypoint(Keypoint::MiddleFingerMcp)[0], 0.25);
        assert_relative_eq!(det.keypoint(Keypoint::MiddleFingerMcp)[1], 0.5);
    }

    #[test]
    fn iou_of_identical_boxes() {
        let a = Detection::new([0.5, 0.5], [0.2, 0.2], [[0.0; 2]; 6], 0.9);
        assert_relative_eq!(a.iou(&a), 1.0);
    }

    #[test]
    fn iou_of_disjoint_boxes() {
        let a = Detection::new([0.2, 0.2], [0.1, 0.1], [[0.0; 2]; 6], 0.9);
        let b = Detection::new([0.8, 0.8], [0.1, 0.1], [[0.0; 2]; 6], 0.8);
        assert_eq!(a.iou(&b), 0.0);
    }

    #[test]
    fn iou_of_half_overlap() {
        // Two 0.2x0.2 boxes offset by half their width: intersection 0.1*0.2,
        // union 2*0.04 - 0.02.
        let a = Detection::new([0.4, 0.5], [0.2, 0.2], [[0.0; 2]; 6], 0.9);
        let b = Detection::new([0.5, 0.5], [0.2, 0.2], [[0.0; 2]; 6], 0.8);
        assert_relative_eq!(a.iou(&b), 0.02 / 0.06, epsilon = 1e-6);
    }

    #[test]
    fn rotation_of_upright_palm() {
        let mut det = Detection::new([0.5, 0.5], [0.2, 0.2], [[0.0; 2]; 6], 1.0);
        det.wrist = [0.5, 0.8];
        det.middle_mcp = [0.5, 0.4];
        assert_relative_eq!(det.rotation_angle(), 0.0);
    }
}
