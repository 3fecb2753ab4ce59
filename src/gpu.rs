//! Global GPU context.

use std::sync::{Arc, OnceLock};

use anyhow::anyhow;
use wgpu::*;

/// A handle to a GPU.
///
/// The library uses a global GPU handle that can be accessed with
/// [`Gpu::get()`]. This is the primary way to interact with this type, the
/// remaining constructors are rarely needed.
pub struct Gpu {
    instance: Arc<Instance>,
    adapter: Arc<Adapter>,
    device: Arc<Device>,
    queue: Arc<Queue>,
}

static INSTANCE: OnceLock<Option<Gpu>> = OnceLock::new();

impl Gpu {
    /// Returns a reference to the global GPU handle.
    ///
    /// If the global GPU handle hasn't been initialized yet, an appropriate
    /// default GPU will be opened. If this fails, this method will panic.
    pub fn get() -> &'static Gpu {
        Self::try_get().expect("no usable graphics adapter found")
    }

    /// Like [`Gpu::get`], but returns [`None`] instead of panicking when no
    /// usable adapter exists on the system.
    pub fn try_get() -> Option<&'static Gpu> {
        INSTANCE
            .get_or_init(|| match pollster::block_on(Self::open()) {
                Ok(gpu) => Some(gpu),
                Err(err) => {
                    log::error!("failed to open GPU: {err}");
                    None
                }
            })
            .as_ref()
    }

    /// Sets the global GPU handle.
    ///
    /// # Panics
    ///
    /// This will panic if the global GPU handle has already been initialized
    /// by a previous call to [`Gpu::set`], or if [`Gpu::get`] has ever been
    /// called.
    pub fn set(gpu: Self) {
        let mut error = true;
        INSTANCE.get_or_init(|| {
            error = false;
            Some(gpu)
        });

        if error {
            panic!("global GPU handle was already set");
        }
    }

    /// Opens a suitable default GPU.
    pub async fn open() -> anyhow::Result<Self> {
        // The OpenGL backend panics spuriously, so don't enable it.
        let backends = Backends::PRIMARY;
        let instance = wgpu::Instance::new(wgpu::InstanceDescriptor {
            backends,
            ..Default::default()
        });

        log::info!("available graphics adapters:");
        for adapter in instance.enumerate_adapters(backends) {
            let info = adapter.get_info();
            log_adapter("-", &info);
        }

        let adapter = instance
            .request_adapter(&Default::default())
            .await
            .ok_or_else(|| anyhow!("no graphics adapter found"))?;
        log_adapter("using", &adapter.get_info());

        log::debug!("adapter limits: {:?}", adapter.limits());

        let (device, queue) = adapter
            .request_device(
                &DeviceDescriptor {
                    label: None,
                    features: Features::empty(),
                    limits: Limits::downlevel_defaults().using_resolution(adapter.limits()),
                },
                None,
            )
            .await?;

        Ok(Self::from_wgpu(instance, adapter, device, queue))
    }

    /// Creates a [`Gpu`] handle from an existing [`wgpu::Device`] and [`wgpu::Queue`].
    ///
    /// [`Device`] and [`Queue`] can be passed wrapped in [`Arc`]s, which
    /// allows sharing them outside of the library.
    pub fn from_wgpu(
        instance: impl Into<Arc<Instance>>,
        adapter: impl Into<Arc<Adapter>>,
        device: impl Into<Arc<Device>>,
        queue: impl Into<Arc<Queue>>,
    ) -> Self {
        Self {
            instance: instance.into(),
            adapter: adapter.into(),
            device: device.into(),
            queue: queue.into(),
        }
    }

    /// Returns a reference to the [`Instance`].
    #[inline]
    pub fn instance(&self) -> &Arc<Instance> {
        &self.instance
    }

    /// Returns a reference to the [`Adapter`].
    #[inline]
    pub fn adapter(&self) -> &Arc<Adapter> {
        &self.adapter
    }

    /// Returns a reference to the [`Device`].
    #[inline]
    pub fn device(&self) -> &Arc<Device> {
        &self.device
    }

    /// Returns a reference to the [`Queue`].
    #[inline]
    pub fn queue(&self) -> &Arc<Queue> {
        &self.queue
    }
}

fn log_adapter(prefix: &str, info: &AdapterInfo) {
    let backend = match info.backend {
        wgpu::Backend::Empty => "dummy",
        wgpu::Backend::Vulkan => "Vulkan",
        wgpu::Backend::Metal => "Metal",
        wgpu::Backend::Dx12 => "DX12",
        wgpu::Backend::Dx11 => "DX11",
        wgpu::Backend::Gl => "OpenGL",
        wgpu::Backend::BrowserWebGpu => "WebGPU",
    };
    let device_type = match info.device_type {
        wgpu::DeviceType::Other => "Unknown",
        wgpu::DeviceType::IntegratedGpu => "iGPU",
        wgpu::DeviceType::DiscreteGpu => "dGPU",
        wgpu::DeviceType::VirtualGpu => "vGPU",
        wgpu::DeviceType::Cpu => "CPU",
    };
    log::info!("{} [{}] [{}] {}", prefix, backend, device_type, info.name);
}
