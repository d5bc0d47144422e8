// SPDX-License-Identifier: CEPL-1.0
//! Windowing collaborator: winit, plus the few conversions the app needs.
pub use winit;

use vkr_render::RenderSize;
use winit::dpi::{LogicalSize, PhysicalSize};
use winit::window::{Window, WindowAttributes};

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct WindowOptions {
    pub title: String,
    pub width: u32,
    pub height: u32,
}

impl Default for WindowOptions {
    fn default() -> Self {
        Self {
            title: "VKR".to_owned(),
            width: 1920,
            height: 1080,
        }
    }
}

pub fn window_attributes(opts: &WindowOptions) -> WindowAttributes {
    Window::default_attributes()
        .with_title(opts.title.clone())
        .with_inner_size(LogicalSize::new(opts.width.max(1), opts.height.max(1)))
}

/// 0x0 is kept as-is: the renderer treats it as "paused".
pub fn render_size(size: PhysicalSize<u32>) -> RenderSize {
    RenderSize {
        width: size.width,
        height: size.height,
    }
}

/// Current drawable extent, queried live.
pub fn drawable_size(window: &Window) -> RenderSize {
    render_size(window.inner_size())
}
