//! The palm detection pipeline.
//!
//! [`PalmDetector`] drives one run per external frame tick: preprocess →
//! infer → aggregate → suppress. The two postprocess stages run as GPU
//! compute passes over counted detection lists; their ordering is guaranteed
//! by command queue submission order, not by explicit synchronization. A new
//! run must not be issued while a previous run's output is still being
//! consumed elsewhere (e.g. mid-readback); `&mut self` on all run and query
//! methods enforces this within a single detector instance.

mod buffers;
mod readback;

use std::borrow::Cow;
use std::path::Path;

use wgpu::util::DeviceExt as _;
use wgpu::*;

use crate::detection::anchors::Anchors;
use crate::detection::Detection;
use crate::gpu::Gpu;
use crate::image::ImageFrame;
use crate::nn::{ChannelOrder, InferenceEngine, TractEngine};
use crate::preprocess::Preprocessor;
use crate::timer::Timer;
use crate::{Error, Result};

use self::buffers::Buffers;
use self::readback::CountedBufferReader;

/// Vertex count per bounding-box instance when rendering with
/// [`create_draw_args`] (two triangles).
pub const BOX_VERTEX_COUNT: u32 = 6;

/// Vertex count per keypoint/skeleton instance when rendering with
/// [`create_draw_args`] (12 line segments).
pub const KEYPOINT_VERTEX_COUNT: u32 = 24;

/// The GPU programs the pipeline runs, as WGSL source.
///
/// The defaults are the shaders shipped with this crate; they can be
/// swapped out wholesale for customized variants as long as the bind group
/// interfaces stay the same. Sources are validated by `wgpu` at detector
/// construction.
pub struct ShaderSet {
    pub preprocess: Cow<'static, str>,
    pub aggregate: Cow<'static, str>,
    pub suppress: Cow<'static, str>,
}

impl Default for ShaderSet {
    fn default() -> Self {
        Self {
            preprocess: include_str!("shaders/preprocess.wgsl").into(),
            aggregate: include_str!("shaders/aggregate.wgsl").into(),
            suppress: include_str!("shaders/suppress.wgsl").into(),
        }
    }
}

/// Everything a [`PalmDetector`] needs at construction time: the ONNX model
/// asset and the GPU programs. Injected once, treated as immutable
/// configuration afterwards.
pub struct Resources {
    pub model: Vec<u8>,
    pub shaders: ShaderSet,
}

impl Resources {
    /// Bundles an in-memory ONNX model with the default shaders.
    pub fn from_model_bytes(model: Vec<u8>) -> Self {
        Self {
            model,
            shaders: ShaderSet::default(),
        }
    }

    /// Reads the ONNX model from a file and bundles it with the default
    /// shaders.
    pub fn from_model_path<P: AsRef<Path>>(path: P) -> Result<Self> {
        let model = std::fs::read(path.as_ref())
            .map_err(|e| Error::ModelLoad(format!("{}: {e}", path.as_ref().display())))?;
        Ok(Self::from_model_bytes(model))
    }
}

#[derive(Clone, Copy, bytemuck::Pod, bytemuck::Zeroable)]
#[repr(C)]
struct AggregateParams {
    image_size: f32,
    threshold: f32,
    anchor_count: u32,
    _pad: u32,
}

/// A palm detector with GPU-resident postprocessing.
pub struct PalmDetector {
    gpu: &'static Gpu,
    engine: Box<dyn InferenceEngine>,
    preprocessor: Preprocessor,
    buffers: Buffers,
    aggregate: ComputePipeline,
    aggregate_bind_group: BindGroup,
    suppress: ComputePipeline,
    suppress_bind_group: BindGroup,
    readback: CountedBufferReader,
    threshold: f32,
    image_size: u32,
    num_anchors: u32,
    scratch: Vec<f32>,
    t_preprocess: Timer,
    t_infer: Timer,
    t_postprocess: Timer,
}

impl PalmDetector {
    /// Default confidence threshold for [`PalmDetector::set_threshold`].
    pub const DEFAULT_THRESHOLD: f32 = 0.75;

    /// Bounding-box IoU at or above which the suppression pass considers two
    /// detections duplicates.
    pub const IOU_THRESHOLD: f32 = 0.3;

    /// Creates a detector from a resource bundle, loading the contained ONNX
    /// model with the built-in `tract` engine.
    pub fn new(resources: Resources) -> Result<Self> {
        let engine = TractEngine::from_onnx(&resources.model)?;
        Self::with_engine_impl(Box::new(engine), resources.shaders)
    }

    /// Creates a detector around a custom [`InferenceEngine`].
    pub fn with_engine<E: InferenceEngine>(engine: E, shaders: ShaderSet) -> Result<Self> {
        Self::with_engine_impl(Box::new(engine), shaders)
    }

    fn with_engine_impl(engine: Box<dyn InferenceEngine>, shaders: ShaderSet) -> Result<Self> {
        let gpu = Gpu::get();
        let device = gpu.device();

        let image_size = engine.input_size();
        if image_size == 0 || image_size % 16 != 0 {
            return Err(Error::ModelLoad(format!(
                "unsupported input size {image_size} (must be a non-zero multiple of 16)",
            )));
        }

        let anchors = Anchors::for_input_size(image_size);
        if anchors.anchor_count() != engine.num_anchors() {
            return Err(Error::ModelLoad(format!(
                "model predicts {} anchors, but a {image_size}px input implies {}",
                engine.num_anchors(),
                anchors.anchor_count(),
            )));
        }
        let num_anchors = anchors.anchor_count() as u32;

        let buffers = Buffers::new(gpu, image_size, &anchors.to_raw(), Self::IOU_THRESHOLD);
        let preprocessor =
            Preprocessor::new(gpu, &shaders.preprocess, image_size, engine.channel_order());

        // Aggregation pass: params + scores + boxes + anchors in, candidate
        // list out.
        let aggregate_shader = device.create_shader_module(ShaderModuleDescriptor {
            label: Some("aggregate_shader"),
            source: ShaderSource::Wgsl(shaders.aggregate.as_ref().into()),
        });
        let bgl_aggregate = device.create_bind_group_layout(&BindGroupLayoutDescriptor {
            label: Some("bgl_aggregate"),
            entries: &[
                uniform_entry(0),
                storage_entry(1, true),
                storage_entry(2, true),
                storage_entry(3, true),
                storage_entry(4, false),
            ],
        });
        let aggregate = device.create_compute_pipeline(&ComputePipelineDescriptor {
            label: Some("aggregate"),
            layout: Some(
                &device.create_pipeline_layout(&PipelineLayoutDescriptor {
                    label: None,
                    bind_group_layouts: &[&bgl_aggregate],
                    push_constant_ranges: &[],
                }),
            ),
            module: &aggregate_shader,
            entry_point: "aggregate",
        });
        let aggregate_bind_group = device.create_bind_group(&BindGroupDescriptor {
            label: Some("bg_aggregate"),
            layout: &bgl_aggregate,
            entries: &[
                BindGroupEntry {
                    binding: 0,
                    resource: buffers.aggregate_params.as_entire_binding(),
                },
                BindGroupEntry {
                    binding: 1,
                    resource: buffers.scores.as_entire_binding(),
                },
                BindGroupEntry {
                    binding: 2,
                    resource: buffers.boxes.as_entire_binding(),
                },
                BindGroupEntry {
                    binding: 3,
                    resource: buffers.anchors.as_entire_binding(),
                },
                BindGroupEntry {
                    binding: 4,
                    resource: buffers.candidates.as_entire_binding(),
                },
            ],
        });

        // Suppression pass: candidate list in, final list out.
        let suppress_shader = device.create_shader_module(ShaderModuleDescriptor {
            label: Some("suppress_shader"),
            source: ShaderSource::Wgsl(shaders.suppress.as_ref().into()),
        });
        let bgl_suppress = device.create_bind_group_layout(&BindGroupLayoutDescriptor {
            label: Some("bgl_suppress"),
            entries: &[
                uniform_entry(0),
                storage_entry(1, true),
                storage_entry(2, false),
            ],
        });
        let suppress = device.create_compute_pipeline(&ComputePipelineDescriptor {
            label: Some("suppress"),
            layout: Some(
                &device.create_pipeline_layout(&PipelineLayoutDescriptor {
                    label: None,
                    bind_group_layouts: &[&bgl_suppress],
                    push_constant_ranges: &[],
                }),
            ),
            module: &suppress_shader,
            entry_point: "suppress",
        });
        let suppress_bind_group = device.create_bind_group(&BindGroupDescriptor {
            label: Some("bg_suppress"),
            layout: &bgl_suppress,
            entries: &[
                BindGroupEntry {
                    binding: 0,
                    resource: buffers.suppress_params.as_entire_binding(),
                },
                BindGroupEntry {
                    binding: 1,
                    resource: buffers.candidates.as_entire_binding(),
                },
                BindGroupEntry {
                    binding: 2,
                    resource: buffers.accepted.as_entire_binding(),
                },
            ],
        });

        let readback = CountedBufferReader::new(gpu);

        Ok(Self {
            gpu,
            engine,
            preprocessor,
            buffers,
            aggregate,
            aggregate_bind_group,
            suppress,
            suppress_bind_group,
            readback,
            threshold: Self::DEFAULT_THRESHOLD,
            image_size,
            num_anchors,
            scratch: Vec::new(),
            t_preprocess: Timer::new("preprocess"),
            t_infer: Timer::new("infer"),
            t_postprocess: Timer::new("postprocess"),
        })
    }

    /// Side length of the network's square input, in pixels.
    #[inline]
    pub fn image_size(&self) -> u32 {
        self.image_size
    }

    /// Whether the network consumes its input tensor in planar (NCHW) order.
    #[inline]
    pub fn is_nchw(&self) -> bool {
        self.preprocessor.order() == ChannelOrder::Nchw
    }

    /// Sets the confidence threshold used by the aggregation pass, clamped
    /// to `[0, 1]`. Defaults to [`Self::DEFAULT_THRESHOLD`].
    #[inline]
    pub fn set_threshold(&mut self, threshold: f32) {
        self.threshold = threshold.clamp(0.0, 1.0);
    }

    /// Runs the pipeline on an image frame.
    ///
    /// Fails with [`Error::InvalidInput`] for zero-sized frames before any
    /// GPU work is dispatched.
    pub fn process_image(&mut self, image: &ImageFrame) -> Result<()> {
        self.readback.invalidate();

        {
            let _guard = self.t_preprocess.start();
            self.preprocessor
                .upload(self.gpu, image, &self.buffers.tensor)?;

            let mut encoder = self
                .gpu
                .device()
                .create_command_encoder(&CommandEncoderDescriptor { label: None });
            self.preprocessor.encode_pass(&mut encoder);

            // The CPU inference backend consumes the tensor host-side, so
            // fetch it back; a GPU backend would read the buffer directly.
            let tensor_bytes = self.tensor_len() as u64 * 4;
            encoder.copy_buffer_to_buffer(
                &self.buffers.tensor,
                0,
                &self.buffers.tensor_staging,
                0,
                tensor_bytes,
            );
            self.gpu.queue().submit([encoder.finish()]);

            let bytes = readback::map_read(self.gpu, &self.buffers.tensor_staging, tensor_bytes);
            self.scratch.clear();
            self.scratch
                .extend(bytes.chunks_exact(4).map(|b| {
                    f32::from_le_bytes([b[0], b[1], b[2], b[3]])
                }));
            self.buffers.tensor_staging.unmap();
        }

        self.run_model()
    }

    /// Runs the pipeline on a pre-tensorized input, bypassing preprocessing.
    ///
    /// `tensor` must contain exactly `image_size² * 3` values in the
    /// network's channel order.
    pub fn process_tensor(&mut self, tensor: &[f32]) -> Result<()> {
        self.readback.invalidate();

        if tensor.len() != self.tensor_len() {
            return Err(Error::InvalidInput(format!(
                "input tensor has {} values, expected {}",
                tensor.len(),
                self.tensor_len(),
            )));
        }

        self.gpu
            .queue()
            .write_buffer(&self.buffers.tensor, 0, bytemuck::cast_slice(tensor));
        self.scratch.clear();
        self.scratch.extend_from_slice(tensor);

        self.run_model()
    }

    fn tensor_len(&self) -> usize {
        self.image_size as usize * self.image_size as usize * 3
    }

    fn run_model(&mut self) -> Result<()> {
        let output = self.t_infer.time(|| self.engine.infer(&self.scratch))?;

        let n = self.num_anchors as usize;
        if output.scores.len() != n || output.boxes.len() != n * 18 {
            return Err(Error::Inference(format!(
                "engine produced {} scores / {} regressors for {n} anchors",
                output.scores.len(),
                output.boxes.len(),
            )));
        }

        let _guard = self.t_postprocess.start();
        let queue = self.gpu.queue();
        queue.write_buffer(&self.buffers.scores, 0, bytemuck::cast_slice(&output.scores));
        queue.write_buffer(&self.buffers.boxes, 0, bytemuck::cast_slice(&output.boxes));
        queue.write_buffer(
            &self.buffers.aggregate_params,
            0,
            bytemuck::bytes_of(&AggregateParams {
                image_size: self.image_size as f32,
                threshold: self.threshold,
                anchor_count: self.num_anchors,
                _pad: 0,
            }),
        );
        self.buffers.reset_counters(self.gpu);

        let mut encoder = self
            .gpu
            .device()
            .create_command_encoder(&CommandEncoderDescriptor { label: None });
        {
            let mut pass = encoder.begin_compute_pass(&ComputePassDescriptor {
                label: Some("aggregate"),
            });
            pass.set_pipeline(&self.aggregate);
            pass.set_bind_group(0, &self.aggregate_bind_group, &[]);
            pass.dispatch_workgroups((self.num_anchors + 63) / 64, 1, 1);
        }
        {
            let mut pass = encoder.begin_compute_pass(&ComputePassDescriptor {
                label: Some("suppress"),
            });
            pass.set_pipeline(&self.suppress);
            pass.set_bind_group(0, &self.suppress_bind_group, &[]);
            pass.dispatch_workgroups(1, 1, 1);
        }
        // Mirror the final count into the standalone count buffer for the
        // readback cache and indirect draws.
        encoder.copy_buffer_to_buffer(&self.buffers.accepted, 0, &self.buffers.count, 0, 4);
        queue.submit([encoder.finish()]);

        Ok(())
    }

    /// Returns the detections of the most recent run.
    ///
    /// The first call after a run blocks until the GPU work and the
    /// GPU-to-CPU transfer complete; the result is cached until the next
    /// run. Callers that cannot afford to block should stay on the GPU via
    /// [`PalmDetector::detection_buffer`] and
    /// [`PalmDetector::sync_draw_count`] instead.
    pub fn detections(&mut self) -> &[Detection] {
        self.readback
            .cached(self.gpu, &self.buffers.accepted, &self.buffers.count)
    }

    /// The GPU buffer holding the final detection list: a 16-byte header
    /// (count + padding) followed by up to
    /// [`MAX_DETECTIONS`](crate::MAX_DETECTIONS) [`Detection`] records.
    #[inline]
    pub fn detection_buffer(&self) -> &Buffer {
        &self.buffers.accepted
    }

    /// The GPU buffer holding the final detection count as a single `u32`.
    #[inline]
    pub fn count_buffer(&self) -> &Buffer {
        &self.buffers.count
    }

    /// The GPU buffer holding the preprocessed input tensor.
    #[inline]
    pub fn input_buffer(&self) -> &Buffer {
        &self.buffers.tensor
    }

    /// Copies the live detection count into `draw_args` at byte offset 4
    /// (the `instance_count` field), leaving the other indirect draw
    /// arguments untouched. GPU-to-GPU; does not block.
    ///
    /// Call this after each pipeline run and before the corresponding draw;
    /// a stale count renders the wrong number of instances, nothing worse.
    pub fn sync_draw_count(&self, draw_args: &Buffer) {
        let mut encoder = self
            .gpu
            .device()
            .create_command_encoder(&CommandEncoderDescriptor { label: None });
        encoder.copy_buffer_to_buffer(&self.buffers.count, 0, draw_args, 4, 4);
        self.gpu.queue().submit([encoder.finish()]);
    }

    /// Releases all GPU buffers owned by this detector. Idempotent; calling
    /// it twice (or letting `Drop` run afterwards) is a no-op.
    ///
    /// The detector must not be used for further runs afterwards, and must
    /// not be closed while a run's output is still consumed elsewhere.
    pub fn close(&mut self) {
        self.buffers.destroy();
    }

    /// Returns profiling timers for the pipeline stages.
    pub fn timers(&self) -> impl Iterator<Item = &Timer> + '_ {
        [&self.t_preprocess, &self.t_infer, &self.t_postprocess].into_iter()
    }
}

/// Creates an indirect draw argument buffer `[vertex_count, 0, 0, 0]`,
/// ready to have its instance count filled in by
/// [`PalmDetector::sync_draw_count`].
///
/// Use [`BOX_VERTEX_COUNT`] for bounding-box geometry (triangle topology)
/// and [`KEYPOINT_VERTEX_COUNT`] for keypoint/skeleton geometry (line
/// topology).
pub fn create_draw_args(gpu: &Gpu, vertex_count: u32) -> Buffer {
    gpu.device().create_buffer_init(&util::BufferInitDescriptor {
        label: Some("draw_args"),
        contents: bytemuck::cast_slice(&[vertex_count, 0, 0, 0]),
        usage: BufferUsages::INDIRECT | BufferUsages::COPY_DST | BufferUsages::COPY_SRC,
    })
}

fn uniform_entry(binding: u32) -> BindGroupLayoutEntry {
    BindGroupLayoutEntry {
        binding,
        visibility: ShaderStages::COMPUTE,
        ty: BindingType::Buffer {
            ty: BufferBindingType::Uniform,
            has_dynamic_offset: false,
            min_binding_size: None,
        },
        count: None,
    }
}

fn storage_entry(binding: u32, read_only: bool) -> BindGroupLayoutEntry {
    BindGroupLayoutEntry {
        binding,
        visibility: ShaderStages::COMPUTE,
        ty: BindingType::Buffer {
            ty: BufferBindingType::Storage { read_only },
            has_dynamic_offset: false,
            min_binding_size: None,
        },
        count: None,
    }
}

#[cfg(test)]
mod tests {
    use approx::assert_relative_eq;
    use bytemuck::Zeroable;

    use super::*;
    use crate::detection::{DETECTION_SIZE, MAX_DETECTIONS};
    use crate::nn::InferenceOutput;
    use crate::num::logit;

    /// Anchor count of the reference 128px configuration.
    const N: usize = 896;

    struct StubEngine {
        scores: Vec<f32>,
        boxes: Vec<f32>,
    }

    impl InferenceEngine for StubEngine {
        fn input_size(&self) -> u32 {
            128
        }

        fn channel_order(&self) -> ChannelOrder {
            ChannelOrder::Nchw
        }

        fn num_anchors(&self) -> usize {
            self.scores.len()
        }

        fn infer(&mut self, _tensor: &[f32]) -> Result<InferenceOutput> {
            Ok(InferenceOutput {
                scores: self.scores.clone(),
                boxes: self.boxes.clone(),
            })
        }
    }

    /// Raw logits that activate to `confidence` at the given anchors, and to
    /// ~0 everywhere else.
    fn scores(entries: &[(usize, f32)]) -> Vec<f32> {
        let mut v = vec![-100.0; N];
        for &(i, confidence) in entries {
            v[i] = logit(confidence);
        }
        v
    }

    fn boxes(entries: &[(usize, [f32; 18])]) -> Vec<f32> {
        let mut v = vec![0.0; N * 18];
        for &(i, regs) in entries {
            v[i * 18..(i + 1) * 18].copy_from_slice(&regs);
        }
        v
    }

    /// Regressor row that decodes to the given absolute box.
    fn box_regs(anchor_index: usize, center: [f32; 2], extent: [f32; 2]) -> [f32; 18] {
        let anchor = Anchors::for_input_size(128)[anchor_index].position();
        let mut regs = [0.0; 18];
        regs[0] = (center[0] - anchor[0]) * 128.0;
        regs[1] = (center[1] - anchor[1]) * 128.0;
        regs[2] = extent[0] * 128.0;
        regs[3] = extent[1] * 128.0;
        regs
    }

    fn detector(scores: Vec<f32>, boxes: Vec<f32>) -> Option<PalmDetector> {
        if Gpu::try_get().is_none() {
            eprintln!("skipping test: no usable GPU");
            return None;
        }
        Some(PalmDetector::with_engine(StubEngine { scores, boxes }, ShaderSet::default()).unwrap())
    }

    fn blank_frame(width: u32, height: u32) -> ImageFrame {
        ImageFrame::from_rgba8(width, height, vec![0; (width * height * 4) as usize]).unwrap()
    }

    fn blank_tensor() -> Vec<f32> {
        vec![0.0; 128 * 128 * 3]
    }

    /// Reads a counted detection list buffer, returning the raw (unclamped)
    /// counter value and the stored entries.
    fn read_list(det: &PalmDetector, list: &Buffer) -> (u32, Vec<Detection>) {
        let gpu = det.gpu;
        let staging = gpu.device().create_buffer(&BufferDescriptor {
            label: None,
            size: buffers::LIST_SIZE,
            usage: BufferUsages::MAP_READ | BufferUsages::COPY_DST,
            mapped_at_creation: false,
        });
        let mut encoder = gpu
            .device()
            .create_command_encoder(&CommandEncoderDescriptor { label: None });
        encoder.copy_buffer_to_buffer(list, 0, &staging, 0, buffers::LIST_SIZE);
        gpu.queue().submit([encoder.finish()]);

        let bytes = readback::map_read(gpu, &staging, buffers::LIST_SIZE);
        staging.unmap();

        let count = u32::from_le_bytes(bytes[0..4].try_into().unwrap());
        let n = (count as usize).min(MAX_DETECTIONS);
        let mut entries = vec![Detection::zeroed(); n];
        bytemuck::cast_slice_mut::<Detection, u8>(&mut entries)
            .copy_from_slice(&bytes[16..16 + n * DETECTION_SIZE]);
        (count, entries)
    }

    #[test]
    fn reports_model_geometry() {
        let Some(det) = detector(scores(&[]), boxes(&[])) else {
            return;
        };
        assert_eq!(det.image_size(), 128);
        assert!(det.is_nchw());
        assert_eq!(det.tensor_len(), 128 * 128 * 3);
    }

    #[test]
    fn blank_input_produces_no_detections() {
        let Some(mut det) = detector(scores(&[]), boxes(&[])) else {
            return;
        };
        for threshold in [0.01, 0.5, 0.99] {
            det.set_threshold(threshold);
            det.process_image(&blank_frame(32, 32)).unwrap();
            let (count, _) = read_list(&det, &det.buffers.candidates);
            assert_eq!(count, 0);
            assert!(det.detections().is_empty());
        }
    }

    #[test]
    fn threshold_filtering_is_monotonic() {
        let entries = [
            (0, 0.2),
            (40, 0.4),
            (150, 0.6),
            (300, 0.8),
            (450, 0.95),
        ];
        let regs = entries
            .iter()
            .enumerate()
            .map(|(k, &(i, _))| {
                let c = 0.1 + 0.2 * k as f32;
                (i, box_regs(i, [c, c], [0.05, 0.05]))
            })
            .collect::<Vec<_>>();
        let Some(mut det) = detector(scores(&entries), boxes(&regs)) else {
            return;
        };

        let mut last = u32::MAX;
        for (threshold, expected) in [(0.1, 5), (0.3, 4), (0.5, 3), (0.7, 2), (0.9, 1)] {
            det.set_threshold(threshold);
            det.process_tensor(&blank_tensor()).unwrap();
            let (count, _) = read_list(&det, &det.buffers.candidates);
            assert_eq!(count, expected);
            assert!(count <= last);
            last = count;
        }
    }

    #[test]
    fn duplicate_box_keeps_first_stored_candidate() {
        // Two candidates with identical bounding boxes. The suppression pass
        // walks storage order, so the first *appended* one survives, not
        // necessarily the higher-scoring one.
        let center = [0.5, 0.5];
        let extent = [0.2, 0.2];
        let Some(mut det) = detector(
            scores(&[(0, 0.9), (500, 0.8)]),
            boxes(&[
                (0, box_regs(0, center, extent)),
                (500, box_regs(500, center, extent)),
            ]),
        ) else {
            return;
        };

        det.set_threshold(0.75);
        det.process_tensor(&blank_tensor()).unwrap();

        let (candidate_count, candidates) = read_list(&det, &det.buffers.candidates);
        assert_eq!(candidate_count, 2);

        let survivors = det.detections().to_vec();
        assert_eq!(survivors.len(), 1);
        assert!(survivors.len() <= candidates.len());
        assert_eq!(survivors[0], candidates[0]);
    }

    #[test]
    fn distinct_palms_both_survive() {
        let Some(mut det) = detector(
            scores(&[(10, 0.9), (600, 0.8)]),
            boxes(&[
                (10, box_regs(10, [0.25, 0.25], [0.1, 0.1])),
                (600, box_regs(600, [0.75, 0.75], [0.1, 0.1])),
            ]),
        ) else {
            return;
        };

        det.process_tensor(&blank_tensor()).unwrap();

        let first = det.detections().to_vec();
        assert_eq!(first.len(), 2);
        let mut confidences = first.iter().map(|d| d.score).collect::<Vec<_>>();
        confidences.sort_by(|a, b| a.total_cmp(b));
        assert_relative_eq!(confidences[0], 0.8, epsilon = 1e-4);
        assert_relative_eq!(confidences[1], 0.9, epsilon = 1e-4);

        // Repeated access without an intervening run returns the identical
        // cached sequence.
        assert_eq!(det.detections(), &first[..]);
    }

    #[test]
    fn gpu_decode_matches_reference() {
        let regs = [
            16.0, -32.0, 64.0, 32.0, // box
            8.0, 8.0, // wrist
            -8.0, 4.0, // index
            0.0, 0.0, // middle
            10.0, 20.0, // ring
            5.0, 5.0, // pinky
            -16.0, -16.0, // thumb
            99.0, 99.0, // unused trailing keypoint
        ];
        let Some(mut det) = detector(scores(&[(3, 0.9)]), boxes(&[(3, regs)])) else {
            return;
        };

        det.process_tensor(&blank_tensor()).unwrap();

        let anchor = Anchors::for_input_size(128)[3].position();
        let expected = Detection::decode(anchor, &regs, 0.9, 128.0);
        let got = det.detections()[0];
        for (a, b) in [
            (got.center, expected.center),
            (got.extent, expected.extent),
            (got.wrist, expected.wrist),
            (got.index_mcp, expected.index_mcp),
            (got.middle_mcp, expected.middle_mcp),
            (got.ring_mcp, expected.ring_mcp),
            (got.pinky_mcp, expected.pinky_mcp),
            (got.thumb_cmc, expected.thumb_cmc),
        ] {
            assert_relative_eq!(a[0], b[0], epsilon = 1e-5);
            assert_relative_eq!(a[1], b[1], epsilon = 1e-5);
        }
        assert_relative_eq!(got.score, expected.score, epsilon = 1e-4);
    }

    #[test]
    fn append_overflow_is_clamped() {
        // 100 candidates with zero-extent boxes (IoU 0, nothing suppressed):
        // the raw counter keeps counting, stored entries cap at capacity.
        let entries = (0..100).map(|i| (i, 0.9)).collect::<Vec<_>>();
        let Some(mut det) = detector(scores(&entries), boxes(&[])) else {
            return;
        };

        det.process_tensor(&blank_tensor()).unwrap();

        let (raw_count, candidates) = read_list(&det, &det.buffers.candidates);
        assert_eq!(raw_count, 100);
        assert_eq!(candidates.len(), MAX_DETECTIONS);
        assert_eq!(det.detections().len(), MAX_DETECTIONS);
    }

    #[test]
    fn rejects_degenerate_inputs() {
        let Some(mut det) = detector(scores(&[]), boxes(&[])) else {
            return;
        };
        assert!(matches!(
            det.process_image(&blank_frame(0, 32)),
            Err(Error::InvalidInput(_))
        ));
        assert!(matches!(
            det.process_tensor(&[0.0; 16]),
            Err(Error::InvalidInput(_))
        ));
    }

    #[test]
    fn sync_draw_count_fills_instance_count() {
        let Some(mut det) = detector(
            scores(&[(10, 0.9), (600, 0.8)]),
            boxes(&[
                (10, box_regs(10, [0.25, 0.25], [0.1, 0.1])),
                (600, box_regs(600, [0.75, 0.75], [0.1, 0.1])),
            ]),
        ) else {
            return;
        };

        det.process_tensor(&blank_tensor()).unwrap();

        let gpu = det.gpu;
        let args = create_draw_args(gpu, BOX_VERTEX_COUNT);
        det.sync_draw_count(&args);

        let staging = gpu.device().create_buffer(&BufferDescriptor {
            label: None,
            size: 16,
            usage: BufferUsages::MAP_READ | BufferUsages::COPY_DST,
            mapped_at_creation: false,
        });
        let mut encoder = gpu
            .device()
            .create_command_encoder(&CommandEncoderDescriptor { label: None });
        encoder.copy_buffer_to_buffer(&args, 0, &staging, 0, 16);
        gpu.queue().submit([encoder.finish()]);

        let bytes = readback::map_read(gpu, &staging, 16);
        staging.unmap();
        let words: [u32; 4] = [
            u32::from_le_bytes(bytes[0..4].try_into().unwrap()),
            u32::from_le_bytes(bytes[4..8].try_into().unwrap()),
            u32::from_le_bytes(bytes[8..12].try_into().unwrap()),
            u32::from_le_bytes(bytes[12..16].try_into().unwrap()),
        ];
        assert_eq!(words, [BOX_VERTEX_COUNT, 2, 0, 0]);
    }

    #[test]
    fn close_twice_is_noop() {
        let Some(mut det) = detector(scores(&[]), boxes(&[])) else {
            return;
        };
        det.process_tensor(&blank_tensor()).unwrap();
        let _ = det.detections();
        det.close();
        det.close();
    }
}
