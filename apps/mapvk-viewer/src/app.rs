//! Window event handling and the frame loop.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Instant;

use mapvk_gpu::{
    BaseContext, ClearBits, ContextConfig, GpuContext, GpuContextBuilder, HandlerType,
    SurfaceContext,
};
use tracing::{error, info};
use winit::application::ApplicationHandler;
use winit::dpi::PhysicalSize;
use winit::event::WindowEvent;
use winit::event_loop::ActiveEventLoop;
use winit::window::{Window, WindowId};

use crate::ViewerConfig;

/// winit handler owning the viewer state once a window exists.
pub struct Viewer {
    config: ViewerConfig,
    state: Option<ViewerState>,
}

impl Viewer {
    pub fn new(config: ViewerConfig) -> Self {
        Self {
            config,
            state: None,
        }
    }
}

/// GPU objects of a running viewer.
///
/// Torn down in reverse creation order: frame context, surface, device.
struct ViewerState {
    context: Option<BaseContext>,
    surface: SurfaceContext,
    gpu: GpuContext,
    window: Arc<Window>,
    vsync: bool,
    started: Instant,
    presented_frames: Arc<AtomicU64>,
}

impl ApplicationHandler for Viewer {
    fn resumed(&mut self, event_loop: &ActiveEventLoop) {
        if self.state.is_some() {
            return;
        }

        match ViewerState::new(&self.config, event_loop) {
            Ok(state) => {
                self.state = Some(state);
                info!("Viewer ready");
            }
            Err(e) => {
                error!("Failed to initialize viewer: {e:#}");
                event_loop.exit();
            }
        }
    }

    fn window_event(&mut self, event_loop: &ActiveEventLoop, _id: WindowId, event: WindowEvent) {
        let Some(state) = &mut self.state else {
            return;
        };

        match event {
            WindowEvent::CloseRequested => {
                info!("Close requested");
                self.state = None;
                event_loop.exit();
            }
            WindowEvent::RedrawRequested => {
                if let Err(e) = state.render_frame() {
                    error!("Render error: {e:#}");
                    self.state = None;
                    event_loop.exit();
                }
            }
            WindowEvent::Resized(size) => {
                if let Err(e) = state.handle_resize(size) {
                    error!("Resize error: {e:#}");
                }
            }
            _ => {}
        }
    }

    fn about_to_wait(&mut self, _event_loop: &ActiveEventLoop) {
        if let Some(state) = &self.state {
            state.window.request_redraw();
        }
    }
}

impl ViewerState {
    fn new(config: &ViewerConfig, event_loop: &ActiveEventLoop) -> anyhow::Result<Self> {
        let window_attrs = Window::default_attributes()
            .with_title(&config.title)
            .with_inner_size(PhysicalSize::new(config.width, config.height));
        let window = Arc::new(event_loop.create_window(window_attrs)?);

        let gpu = GpuContextBuilder::new()
            .app_name(&config.title)
            .validation(config.validation)
            .build()?;
        info!("GPU: {}", gpu.capabilities().summary());

        // SAFETY: the window is owned by this state and outlives the surface.
        let surface = unsafe { SurfaceContext::from_window(&gpu, window.as_ref())? };

        let mut state = Self {
            context: None,
            surface,
            gpu,
            window,
            vsync: config.vsync,
            started: Instant::now(),
            presented_frames: Arc::new(AtomicU64::new(0)),
        };

        let mut context = BaseContext::new(
            state.gpu.device(),
            state.gpu.capabilities().clone(),
            state.gpu.graphics_queue(),
            state.gpu.graphics_queue_family(),
            ContextConfig::default(),
        )?;
        info!(
            "Renderer: {} ({})",
            context.renderer_name(),
            context.renderer_version()
        );

        let size = state.window.inner_size();
        let description = state
            .surface
            .describe(&state.gpu, size.width, size.height, state.vsync)?;
        context.set_surface(description)?;

        let presented_frames = state.presented_frames.clone();
        context.register_handler(HandlerType::PostPresent, move |_slot| {
            presented_frames.fetch_add(1, Ordering::Relaxed);
        });

        state.context = Some(context);
        Ok(state)
    }

    fn render_frame(&mut self) -> anyhow::Result<()> {
        let Some(context) = self.context.as_mut() else {
            return Ok(());
        };
        if !context.begin_rendering()? {
            return Ok(());
        }

        let t = self.started.elapsed().as_secs_f32();
        context.set_clear_color([
            0.5 + 0.5 * (t * 0.7).sin(),
            0.5 + 0.5 * (t * 1.1).sin(),
            0.5 + 0.5 * (t * 1.3).sin(),
            1.0,
        ]);
        context.clear(ClearBits::all(), ClearBits::COLOR);
        context.set_framebuffer(None);
        context.apply_framebuffer("swapchain")?;

        let extent = context.extent();
        context.set_viewport(0, 0, extent.width, extent.height);

        context.end_rendering()?;
        context.present()?;
        Ok(())
    }

    fn handle_resize(&mut self, size: PhysicalSize<u32>) -> anyhow::Result<()> {
        let Some(context) = self.context.as_mut() else {
            return Ok(());
        };

        // A minimized window has nothing to present to.
        if size.width == 0 || size.height == 0 {
            context.set_present_available(false);
            return Ok(());
        }
        context.set_present_available(true);

        let description = self
            .surface
            .describe(&self.gpu, size.width, size.height, self.vsync)?;
        let extent = description.capabilities.current_extent;
        context.resize(extent.width, extent.height)?;

        info!("Resized to {}x{}", extent.width, extent.height);
        Ok(())
    }
}

impl Drop for ViewerState {
    fn drop(&mut self) {
        info!(
            frames = self.presented_frames.load(Ordering::Relaxed),
            "Shutting down"
        );
        if let Some(mut context) = self.context.take() {
            if let Err(e) = context.reset_surface(false) {
                error!("Failed to release the surface: {e}");
            }
        }
        // SAFETY: the frame context and its swapchain are gone.
        unsafe { self.surface.destroy() };
    }
}
