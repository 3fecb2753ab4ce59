//! GPU image preprocessing.
//!
//! Turns an arbitrarily sized input frame into the network's flat `S*S*3`
//! input tensor with a single compute dispatch. The input texture is cached
//! between runs and only reallocated when the frame size changes.

use wgpu::util::DeviceExt as _;
use wgpu::*;

use crate::gpu::Gpu;
use crate::image::ImageFrame;
use crate::nn::ChannelOrder;
use crate::{Error, Result};

pub(crate) struct Preprocessor {
    pipeline: ComputePipeline,
    bind_group_layout: BindGroupLayout,
    sampler: Sampler,
    params: Buffer,
    texture: Option<Texture>,
    texture_size: Extent3d,
    bind_group: Option<BindGroup>,
    image_size: u32,
    order: ChannelOrder,
}

impl Preprocessor {
    pub fn new(gpu: &Gpu, shader_source: &str, image_size: u32, order: ChannelOrder) -> Self {
        let device = gpu.device();

        let shader = device.create_shader_module(ShaderModuleDescriptor {
            label: Some("preprocess_shader"),
            source: ShaderSource::Wgsl(shader_source.into()),
        });

        let bind_group_layout = device.create_bind_group_layout(&BindGroupLayoutDescriptor {
            label: Some("bgl_preprocess"),
            entries: &[
                BindGroupLayoutEntry {
                    binding: 0,
                    visibility: ShaderStages::COMPUTE,
                    ty: BindingType::Buffer {
                        ty: BufferBindingType::Uniform,
                        has_dynamic_offset: false,
                        min_binding_size: None,
                    },
                    count: None,
                },
                BindGroupLayoutEntry {
                    binding: 1,
                    visibility: ShaderStages::COMPUTE,
                    ty: BindingType::Texture {
                        sample_type: TextureSampleType::Float { filterable: true },
                        view_dimension: TextureViewDimension::D2,
                        multisampled: false,
                    },
                    count: None,
                },
                BindGroupLayoutEntry {
                    binding: 2,
                    visibility: ShaderStages::COMPUTE,
                    ty: BindingType::Sampler(SamplerBindingType::Filtering),
                    count: None,
                },
                BindGroupLayoutEntry {
                    binding: 3,
                    visibility: ShaderStages::COMPUTE,
                    ty: BindingType::Buffer {
                        ty: BufferBindingType::Storage { read_only: false },
                        has_dynamic_offset: false,
                        min_binding_size: None,
                    },
                    count: None,
                },
            ],
        });

        let pipeline_layout = device.create_pipeline_layout(&PipelineLayoutDescriptor {
            label: None,
            bind_group_layouts: &[&bind_group_layout],
            push_constant_ranges: &[],
        });
        let pipeline = device.create_compute_pipeline(&ComputePipelineDescriptor {
            label: Some("preprocess"),
            layout: Some(&pipeline_layout),
            module: &shader,
            entry_point: "preprocess",
        });

        let sampler = device.create_sampler(&SamplerDescriptor {
            label: Some("preprocess_sampler"),
            mag_filter: FilterMode::Linear,
            min_filter: FilterMode::Linear,
            ..Default::default()
        });

        let nchw = match order {
            ChannelOrder::Nchw => 1u32,
            ChannelOrder::Nhwc => 0,
        };
        let params = device.create_buffer_init(&util::BufferInitDescriptor {
            label: Some("preprocess_params"),
            contents: bytemuck::cast_slice(&[image_size, nchw, 0, 0]),
            usage: BufferUsages::UNIFORM,
        });

        Self {
            pipeline,
            bind_group_layout,
            sampler,
            params,
            texture: None,
            texture_size: Extent3d::default(),
            bind_group: None,
            image_size,
            order,
        }
    }

    #[inline]
    pub fn order(&self) -> ChannelOrder {
        self.order
    }

    /// Uploads `frame` into the cached input texture, reallocating it if the
    /// frame size changed.
    ///
    /// Fails with [`Error::InvalidInput`] for zero-sized frames, before any
    /// GPU work is issued.
    pub fn upload(&mut self, gpu: &Gpu, frame: &ImageFrame, tensor: &Buffer) -> Result<()> {
        if frame.width() == 0 || frame.height() == 0 {
            return Err(Error::InvalidInput(format!(
                "degenerate input image ({}x{})",
                frame.width(),
                frame.height(),
            )));
        }

        let size = Extent3d {
            width: frame.width(),
            height: frame.height(),
            depth_or_array_layers: 1,
        };
        if self.texture.is_none() || self.texture_size != size {
            log::trace!(
                "reallocating input texture ({}x{} -> {}x{})",
                self.texture_size.width,
                self.texture_size.height,
                size.width,
                size.height,
            );
            let texture = gpu.device().create_texture(&TextureDescriptor {
                label: Some("input_frame"),
                size,
                mip_level_count: 1,
                sample_count: 1,
                dimension: TextureDimension::D2,
                format: TextureFormat::Rgba8Unorm,
                usage: TextureUsages::TEXTURE_BINDING | TextureUsages::COPY_DST,
                view_formats: &[],
            });

            // The bind group holds the old texture's view, so it has to be
            // recreated along with it.
            self.bind_group = Some(gpu.device().create_bind_group(&BindGroupDescriptor {
                label: Some("bg_preprocess"),
                layout: &self.bind_group_layout,
                entries: &[
                    BindGroupEntry {
                        binding: 0,
                        resource: self.params.as_entire_binding(),
                    },
                    BindGroupEntry {
                        binding: 1,
                        resource: BindingResource::TextureView(
                            &texture.create_view(&Default::default()),
                        ),
                    },
                    BindGroupEntry {
                        binding: 2,
                        resource: BindingResource::Sampler(&self.sampler),
                    },
                    BindGroupEntry {
                        binding: 3,
                        resource: tensor.as_entire_binding(),
                    },
                ],
            }));
            self.texture = Some(texture);
            self.texture_size = size;
        }

        let texture = self.texture.as_ref().expect("input texture not allocated");
        gpu.queue().write_texture(
            ImageCopyTexture {
                texture,
                mip_level: 0,
                origin: Origin3d::default(),
                aspect: TextureAspect::All,
            },
            frame.data(),
            ImageDataLayout {
                offset: 0,
                bytes_per_row: Some(size.width * 4),
                rows_per_image: None,
            },
            size,
        );

        Ok(())
    }

    /// Records the preprocessing dispatch. Must be preceded by a successful
    /// [`Preprocessor::upload`].
    pub fn encode_pass(&self, encoder: &mut CommandEncoder) {
        let bind_group = self
            .bind_group
            .as_ref()
            .expect("preprocess dispatch without uploaded frame");

        let mut pass = encoder.begin_compute_pass(&ComputePassDescriptor {
            label: Some("preprocess"),
        });
        pass.set_pipeline(&self.pipeline);
        pass.set_bind_group(0, bind_group, &[]);
        let groups = (self.image_size + 7) / 8;
        pass.dispatch_workgroups(groups, groups, 1);
    }
}
