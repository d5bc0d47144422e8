// SPDX-License-Identifier: CEPL-1.0
use anyhow::Result;
use raw_window_handle::{HasDisplayHandle, HasWindowHandle};

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct RenderSize {
    pub width: u32,
    pub height: u32,
}

impl RenderSize {
    pub fn is_empty(&self) -> bool {
        self.width == 0 || self.height == 0
    }
}

/// How the host paces itself against the GPU between frames.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum FramePacing {
    /// One frame in flight: full device-idle wait after every present.
    #[default]
    Idle,
    /// One fenced frame slot per presentable image.
    Fenced,
}

#[derive(Clone, Copy, Debug, PartialEq)]
pub struct RenderSettings {
    pub clear_color: [f32; 4],
    /// Negative-height viewport so +Y points up in clip space.
    pub flip_y: bool,
    pub pacing: FramePacing,
    /// Image-acquire timeout. Zero makes acquisition non-blocking.
    pub acquire_timeout_ns: u64,
}

impl Default for RenderSettings {
    fn default() -> Self {
        Self {
            clear_color: [0.02, 0.02, 0.04, 1.0],
            flip_y: true,
            pacing: FramePacing::Idle,
            acquire_timeout_ns: 0,
        }
    }
}

/// Result of one pass through the frame loop.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum FrameStatus {
    Presented { image_index: u32 },
    /// Nothing was submitted or presented this iteration.
    Skipped,
}

pub trait Renderer {
    fn new(
        window: &dyn HasWindowHandle,
        display: &dyn HasDisplayHandle,
        size: RenderSize,
        settings: RenderSettings,
    ) -> Result<Self>
    where
        Self: Sized;

    fn resize(&mut self, size: RenderSize) -> Result<()>;
    fn render(&mut self) -> Result<FrameStatus>;
    fn set_clear_color(&mut self, rgba: [f32; 4]);
}
