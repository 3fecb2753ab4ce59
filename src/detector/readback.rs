//! GPU-to-CPU readback of the final detection list.

use std::sync::mpsc;

use bytemuck::Zeroable;
use wgpu::*;

use crate::detection::{Detection, DETECTION_SIZE, MAX_DETECTIONS};
use crate::gpu::Gpu;

use super::buffers::LIST_HEADER_SIZE;

/// Lazily mirrors a counted GPU detection list on the host.
///
/// The first access after a pipeline run blocks until the GPU work and the
/// transfer complete: it reads the count scalar, then exactly that many
/// detection records. The result is cached until [`invalidate`] is called at
/// the start of the next run, so repeated access is free and returns the
/// identical sequence.
///
/// [`invalidate`]: CountedBufferReader::invalidate
pub(crate) struct CountedBufferReader {
    count_staging: Buffer,
    data_staging: Buffer,
    cache: Option<Vec<Detection>>,
}

impl CountedBufferReader {
    pub fn new(gpu: &Gpu) -> Self {
        let device = gpu.device();
        Self {
            count_staging: device.create_buffer(&BufferDescriptor {
                label: Some("count_staging"),
                size: 4,
                usage: BufferUsages::MAP_READ | BufferUsages::COPY_DST,
                mapped_at_creation: false,
            }),
            data_staging: device.create_buffer(&BufferDescriptor {
                label: Some("detection_staging"),
                size: (MAX_DETECTIONS * DETECTION_SIZE) as u64,
                usage: BufferUsages::MAP_READ | BufferUsages::COPY_DST,
                mapped_at_creation: false,
            }),
            cache: None,
        }
    }

    /// Drops the cached host copy. The next [`cached`] call will read back
    /// from the GPU again.
    ///
    /// [`cached`]: CountedBufferReader::cached
    pub fn invalidate(&mut self) {
        self.cache = None;
    }

    /// Returns the host copy of the detection list, reading it back from the
    /// GPU if the cache is invalid.
    pub fn cached(&mut self, gpu: &Gpu, list: &Buffer, count: &Buffer) -> &[Detection] {
        if self.cache.is_none() {
            self.cache = Some(self.read(gpu, list, count));
        }
        self.cache.as_deref().expect("readback cache not populated")
    }

    fn read(&self, gpu: &Gpu, list: &Buffer, count: &Buffer) -> Vec<Detection> {
        let mut encoder = gpu
            .device()
            .create_command_encoder(&CommandEncoderDescriptor { label: None });
        encoder.copy_buffer_to_buffer(count, 0, &self.count_staging, 0, 4);
        gpu.queue().submit([encoder.finish()]);

        let n = {
            let bytes = map_read(gpu, &self.count_staging, 4);
            u32::from_le_bytes([bytes[0], bytes[1], bytes[2], bytes[3]])
        };
        self.count_staging.unmap();

        // Never read past what the list can actually hold.
        let n = (n as usize).min(MAX_DETECTIONS);
        log::trace!("detection readback: {n} records");
        if n == 0 {
            return Vec::new();
        }

        let data_bytes = (n * DETECTION_SIZE) as u64;
        let mut encoder = gpu
            .device()
            .create_command_encoder(&CommandEncoderDescriptor { label: None });
        encoder.copy_buffer_to_buffer(list, LIST_HEADER_SIZE, &self.data_staging, 0, data_bytes);
        gpu.queue().submit([encoder.finish()]);

        let bytes = map_read(gpu, &self.data_staging, data_bytes);
        self.data_staging.unmap();

        // The byte vector is not necessarily aligned for `Detection`, so
        // copy instead of casting in place.
        let mut detections = vec![Detection::zeroed(); n];
        bytemuck::cast_slice_mut::<Detection, u8>(&mut detections).copy_from_slice(&bytes);
        detections
    }
}

/// Synchronously maps the first `size` bytes of `buffer` for reading.
///
/// The caller must `unmap` the buffer once it is done with the returned data.
pub(crate) fn map_read(gpu: &Gpu, buffer: &Buffer, size: u64) -> Vec<u8> {
    let slice = buffer.slice(..size);
    let (tx, rx) = mpsc::channel();
    slice.map_async(MapMode::Read, move |result| {
        tx.send(result).ok();
    });
    gpu.device().poll(Maintain::Wait);
    rx.recv()
        .expect("map_async callback dropped")
        .expect("failed to map readback buffer");
    slice.get_mapped_range().to_vec()
}
