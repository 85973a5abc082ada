use std::sync::Arc;
use std::time::Duration;
use raw_window_handle::{HasDisplayHandle, HasWindowHandle};
use winit::application::ApplicationHandler;
use winit::dpi::LogicalSize;
use winit::event::WindowEvent;
use winit::event_loop::{ActiveEventLoop, ControlFlow, EventLoop};
use winit::platform::pump_events::{EventLoopExtPumpEvents, PumpStatus};
use winit::window::{Window, WindowId};
use ember_rhi::WindowHandles;

/// What happened to the window since the last pump.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct WindowEvents {
    pub close_requested: bool,
    pub resized: Option<(u32, u32)>,
}

#[derive(Default)]
struct WindowHost {
    width: u32,
    height: u32,
    window: Option<Arc<Window>>,
    create_error: Option<winit::error::OsError>,
    events: WindowEvents,
}

impl ApplicationHandler for WindowHost {
    fn resumed(&mut self, event_loop: &ActiveEventLoop) {
        if self.window.is_some() {
            return;
        }

        let window_attributes = Window::default_attributes()
            .with_title("Ember Sandbox")
            .with_min_inner_size(LogicalSize::new(32, 32))
            .with_inner_size(LogicalSize::new(self.width, self.height));

        match event_loop.create_window(window_attributes) {
            Ok(window) => self.window = Some(Arc::new(window)),
            Err(error) => {
                self.create_error = Some(error);
                event_loop.exit();
            }
        }
    }

    fn window_event(&mut self, event_loop: &ActiveEventLoop, _window_id: WindowId, event: WindowEvent) {
        match event {
            WindowEvent::Resized(size) => {
                self.events.resized = Some((size.width, size.height));
            }
            WindowEvent::CloseRequested => {
                self.events.close_requested = true;
                event_loop.exit();
            }
            _ => {}
        }
    }
}

/// A single window driven by pumping the event loop from the frame loop.
pub struct Surface {
    event_loop: EventLoop<()>,
    host: WindowHost,
}

impl Surface {
    /// Open the window and pump until it exists.
    pub fn open(width: u32, height: u32) -> Result<Self, anyhow::Error> {
        let event_loop = EventLoop::new()?;
        event_loop.set_control_flow(ControlFlow::Poll);

        let mut surface = Self {
            event_loop,
            host: WindowHost {
                width,
                height,
                ..Default::default()
            },
        };
        while surface.host.window.is_none() {
            if let PumpStatus::Exit(code) = surface.event_loop.pump_app_events(Some(Duration::from_millis(10)), &mut surface.host) {
                if let Some(error) = surface.host.create_error.take() {
                    return Err(error.into());
                }
                anyhow::bail!("event loop exited with code {code} before the window opened");
            }
        }
        Ok(surface)
    }

    pub fn window(&self) -> Result<&Window, anyhow::Error> {
        self.host
            .window
            .as_deref()
            .ok_or_else(|| anyhow::anyhow!("window is gone"))
    }

    pub fn handles(&self) -> Result<WindowHandles, anyhow::Error> {
        let window = self.window()?;
        Ok(WindowHandles {
            window: window.window_handle()?.as_raw(),
            display: window.display_handle()?.as_raw(),
        })
    }

    pub fn inner_size(&self) -> Result<(u32, u32), anyhow::Error> {
        let size = self.window()?.inner_size();
        Ok((size.width, size.height))
    }

    #[profiling::function]
    pub fn pump(&mut self) -> WindowEvents {
        if let PumpStatus::Exit(_) = self.event_loop.pump_app_events(Some(Duration::ZERO), &mut self.host) {
            self.host.events.close_requested = true;
        }
        std::mem::take(&mut self.host.events)
    }
}
