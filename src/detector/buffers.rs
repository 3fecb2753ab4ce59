//! GPU buffer ownership.
//!
//! Every buffer the pipeline touches is allocated here, once, at detector
//! construction, and released exactly once at teardown. No other component
//! allocates GPU memory per run.

use wgpu::util::DeviceExt as _;
use wgpu::*;

use crate::detection::{DETECTION_SIZE, MAX_DETECTIONS};
use crate::gpu::Gpu;

/// Byte offset of the first entry in a counted detection list buffer; the
/// header holds the `u32` count plus padding that keeps entries aligned.
pub(crate) const LIST_HEADER_SIZE: u64 = 16;

/// Total size of a counted detection list buffer.
pub(crate) const LIST_SIZE: u64 = LIST_HEADER_SIZE + (MAX_DETECTIONS * DETECTION_SIZE) as u64;

pub(crate) struct Buffers {
    /// Flat `S*S*3` f32 input tensor, written by the preprocess pass.
    pub tensor: Buffer,
    /// Raw per-anchor classification logits.
    pub scores: Buffer,
    /// Per-anchor box/keypoint regressors, 18 f32 each.
    pub boxes: Buffer,
    /// Anchor reference positions, one `vec2<f32>` per anchor.
    pub anchors: Buffer,
    /// Counted candidate list filled by the aggregation pass.
    pub candidates: Buffer,
    /// Counted final list filled by the suppression pass.
    pub accepted: Buffer,
    /// Standalone copy of the final detection count, the source for indirect
    /// draw arguments and the readback cache.
    pub count: Buffer,
    /// Aggregation parameters (image size, threshold, anchor count).
    pub aggregate_params: Buffer,
    /// Suppression parameters (IoU threshold).
    pub suppress_params: Buffer,
    /// Staging buffer for downloading the input tensor to the host.
    pub tensor_staging: Buffer,

    destroyed: bool,
}

impl Buffers {
    pub fn new(gpu: &Gpu, image_size: u32, anchors: &[[f32; 2]], iou_threshold: f32) -> Self {
        let device = gpu.device();
        let tensor_bytes = (image_size as u64 * image_size as u64 * 3) * 4;
        let num_anchors = anchors.len() as u64;

        let storage = |label, size| {
            device.create_buffer(&BufferDescriptor {
                label: Some(label),
                size,
                usage: BufferUsages::STORAGE | BufferUsages::COPY_DST | BufferUsages::COPY_SRC,
                mapped_at_creation: false,
            })
        };

        Self {
            tensor: storage("tensor", tensor_bytes),
            scores: storage("scores", num_anchors * 4),
            boxes: storage("boxes", num_anchors * 18 * 4),
            anchors: device.create_buffer_init(&util::BufferInitDescriptor {
                label: Some("anchors"),
                contents: bytemuck::cast_slice(anchors),
                usage: BufferUsages::STORAGE,
            }),
            candidates: storage("candidates", LIST_SIZE),
            accepted: storage("accepted", LIST_SIZE),
            count: device.create_buffer(&BufferDescriptor {
                label: Some("count"),
                size: 4,
                usage: BufferUsages::COPY_DST | BufferUsages::COPY_SRC,
                mapped_at_creation: false,
            }),
            aggregate_params: device.create_buffer(&BufferDescriptor {
                label: Some("aggregate_params"),
                size: 16,
                usage: BufferUsages::UNIFORM | BufferUsages::COPY_DST,
                mapped_at_creation: false,
            }),
            suppress_params: device.create_buffer_init(&util::BufferInitDescriptor {
                label: Some("suppress_params"),
                contents: bytemuck::cast_slice(&[iou_threshold, 0.0, 0.0, 0.0]),
                usage: BufferUsages::UNIFORM,
            }),
            tensor_staging: device.create_buffer(&BufferDescriptor {
                label: Some("tensor_staging"),
                size: tensor_bytes,
                usage: BufferUsages::MAP_READ | BufferUsages::COPY_DST,
                mapped_at_creation: false,
            }),
            destroyed: false,
        }
    }

    /// Zeroes the append counters of both detection lists.
    ///
    /// Queue writes are ordered before subsequently submitted command
    /// buffers, so calling this before encoding a run is sufficient.
    pub fn reset_counters(&self, gpu: &Gpu) {
        let zero = [0u32];
        gpu.queue()
            .write_buffer(&self.candidates, 0, bytemuck::cast_slice(&zero));
        gpu.queue()
            .write_buffer(&self.accepted, 0, bytemuck::cast_slice(&zero));
    }

    /// Releases every buffer. Safe to call more than once; only the first
    /// call does anything.
    pub fn destroy(&mut self) {
        if self.destroyed {
            return;
        }
        self.destroyed = true;

        for buffer in [
            &self.tensor,
            &self.scores,
            &self.boxes,
            &self.anchors,
            &self.candidates,
            &self.accepted,
            &self.count,
            &self.aggregate_params,
            &self.suppress_params,
            &self.tensor_staging,
        ] {
            buffer.destroy();
        }
    }
}

impl Drop for Buffers {
    fn drop(&mut self) {
        self.destroy();
    }
}
