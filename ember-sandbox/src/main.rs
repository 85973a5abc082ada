mod window;

use std::time::Instant;
use clap::{Parser, ValueEnum};
use log::info;
use ember_core::cli::EngineArgs;
use ember_rhi::{
    Attachment, AttachmentLoad, AttachmentStore, Backend, ClearValue, CommandListType, DeviceDesc, Headless, Instance,
    InstanceDesc, RhiResult, SwapchainDesc, Vulkan,
};
use window::Surface;

/// Frames a headless run renders when `--frames` is not given.
const HEADLESS_FRAMES: u64 = 120;

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
enum BackendArg {
    Vulkan,
    Dx12,
    Headless,
}

impl BackendArg {
    fn native() -> Self {
        if cfg!(windows) { BackendArg::Dx12 } else { BackendArg::Vulkan }
    }
}

/// Clears a window to a solid color every frame.
#[derive(Parser, Debug)]
#[command(version, about)]
struct SandboxArgs {
    #[command(flatten)]
    engine: EngineArgs,

    /// Rendering backend
    #[arg(short, long, value_enum, default_value_t = BackendArg::native())]
    backend: BackendArg,

    #[arg(long, default_value_t = 1920)]
    width: u32,

    #[arg(long, default_value_t = 1080)]
    height: u32,

    /// Render offscreen on the CPU backend, same as `--backend headless`
    #[arg(long, default_value_t = false)]
    headless: bool,

    /// Stop after this many frames
    #[arg(long)]
    frames: Option<u64>,

    #[arg(long, default_value_t = false)]
    vsync: bool,

    /// Request an HDR10 swapchain
    #[arg(long, default_value_t = false)]
    hdr: bool,

    /// Enable ray tracing on the device if the adapter supports it
    #[arg(long = "ray-tracing", default_value_t = false)]
    ray_tracing: bool,
}

struct FrameTimer {
    frame_count: u64,
    last_time_printed: Instant,
}

impl FrameTimer {
    fn new() -> Self {
        Self {
            frame_count: 0,
            last_time_printed: Instant::now(),
        }
    }

    fn tick(&mut self) {
        self.frame_count += 1;

        let now = Instant::now();
        let elapsed = (now - self.last_time_printed).as_secs_f32();
        if elapsed > 1. {
            info!("Frame rate: {} fps", self.frame_count as f32 / elapsed);
            self.last_time_printed = now;
            self.frame_count = 0;
        }
    }
}

#[profiling::function]
fn run_frames<B: Backend>(instance: Instance<B>, args: &SandboxArgs, mut surface: Option<Surface>) -> Result<(), anyhow::Error> {
    let device = instance.create_device(&DeviceDesc::default().with_ray_tracing(args.ray_tracing))?;
    info!("Running on {} ({:?}).", device.adapter().name, device.backend());

    let queue = device.create_command_queue(CommandListType::Graphics)?;
    let fence = device.create_fence(0)?;
    let allocators = (0..device.frame_count())
        .map(|_| device.create_command_allocator(CommandListType::Graphics))
        .collect::<RhiResult<Vec<_>>>()?;
    let mut list = device.create_command_list(&allocators[0])?;

    let (width, height) = match &surface {
        Some(surface) => surface.inner_size()?,
        None => (args.width, args.height),
    };
    let handles = surface.as_ref().map(Surface::handles).transpose()?;
    let swapchain_desc = SwapchainDesc::new(width.max(1), height.max(1), handles)
        .with_vsync(args.vsync)
        .with_hdr(args.hdr);
    let mut swapchain = device.create_swapchain(&queue, &swapchain_desc)?;

    let pass = device.create_render_pass(
        &[Attachment::color(swapchain.format(), AttachmentLoad::Clear, AttachmentStore::Store)
            .with_clear_value(ClearValue::Color([0.2, 0.3, 0.8, 1.0]))],
        None,
    )?;

    let frame_limit = match (&surface, args.frames) {
        (_, Some(frames)) => Some(frames),
        (None, None) => Some(HEADLESS_FRAMES),
        (Some(_), None) => None,
    };
    let mut frame_fences = vec![0u64; device.frame_count()];
    let mut timer = FrameTimer::new();
    let mut rendered = 0u64;
    let mut minimized = false;

    while frame_limit.is_none_or(|limit| rendered < limit) {
        if let Some(surface) = surface.as_mut() {
            let events = surface.pump();
            if events.close_requested {
                break;
            }
            if let Some((width, height)) = events.resized {
                minimized = width == 0 || height == 0;
                if !minimized {
                    swapchain.resize(width, height)?;
                }
            }
        }
        if minimized {
            continue;
        }

        let frame = device.begin_frame();
        fence.wait(frame_fences[frame])?;

        list.reset(&allocators[frame])?;
        list.begin_recording(false)?;
        {
            let frame_buffer = device.create_frame_buffer(&pass, &[swapchain.current_back_buffer()], None)?;
            list.begin_render_pass(&pass, &frame_buffer)?;
            list.end_render_pass()?;
        }
        list.end_recording()?;

        queue.execute(&[&list])?;
        frame_fences[frame] = queue.signal_next(&fence)?;
        swapchain.present(&queue)?;
        device.end_frame();

        rendered += 1;
        timer.tick();
        profiling::finish_frame!();
    }

    device.wait_execution_gpu_commands(&queue, &fence)?;
    info!("Rendered {} frames.", rendered);
    Ok(())
}

fn instance_desc(surface: Option<&Surface>) -> InstanceDesc {
    InstanceDesc {
        application_name: if surface.is_some() { "Ember Sandbox" } else { "Ember Sandbox (headless)" }.to_owned(),
        ..Default::default()
    }
}

fn main() -> Result<(), anyhow::Error> {
    let args = SandboxArgs::parse();

    let _profiler = ember_core::profile::initialize(args.engine.profile)?;
    ember_core::log::initialize(args.engine.level_filter())?;

    let backend = if args.headless { BackendArg::Headless } else { args.backend };
    match backend {
        BackendArg::Headless => run_frames(Instance::<Headless>::new(&instance_desc(None))?, &args, None),
        BackendArg::Vulkan => {
            let surface = Surface::open(args.width, args.height)?;
            let instance = Instance::<Vulkan>::new(&instance_desc(Some(&surface)).with_display(surface.handles()?.display))?;
            run_frames(instance, &args, Some(surface))
        }
        #[cfg(windows)]
        BackendArg::Dx12 => {
            let surface = Surface::open(args.width, args.height)?;
            let instance = Instance::<ember_rhi::Dx12>::new(&instance_desc(Some(&surface)))?;
            run_frames(instance, &args, Some(surface))
        }
        #[cfg(not(windows))]
        BackendArg::Dx12 => anyhow::bail!("DirectX 12 is only available on Windows"),
    }
}
