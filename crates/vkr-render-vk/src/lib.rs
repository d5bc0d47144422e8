// SPDX-License-Identifier: CEPL-1.0
use anyhow::{Context, Result};
use ash::vk;
use raw_window_handle::{HasDisplayHandle, HasWindowHandle};
use tracing::{info, warn};
use vkr_render::{FramePacing, FrameStatus, RenderSettings, RenderSize, Renderer};

pub mod chain;
pub mod context;
pub mod error;
pub mod format;
pub mod frame;
pub mod pipeline;
pub mod sync;
pub mod targets;

pub use chain::PresentationChain;
pub use context::RenderContext;
pub use error::{VkrError, VkrResult};
pub use targets::RenderTargetSet;

use frame::{DrawParams, FramePlan, FrameState};
use pipeline::GraphicsPipeline;
use sync::{Acquire, FrameBackend, FrameSync};

/// Where the chain stands relative to the surface.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
struct ChainStatus {
    /// Nothing to draw into: the drawable or the surface is 0x0.
    paused: bool,
    /// The chain no longer matches the surface; rebuild before drawing.
    stale: bool,
}

/// What the next `render` call does.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum FrameStep {
    Skip,
    Rebuild,
    Draw,
}

impl ChainStatus {
    /// No chain exists yet.
    const UNBUILT: Self = Self {
        paused: true,
        stale: true,
    };

    fn resized(self, chain_extent: vk::Extent2D, size: RenderSize) -> Self {
        if size.is_empty() {
            return Self {
                paused: true,
                ..self
            };
        }
        let differs = chain_extent.width != size.width || chain_extent.height != size.height;
        Self {
            paused: false,
            stale: self.stale || differs,
        }
    }

    fn next_step(self, window: RenderSize) -> FrameStep {
        if window.is_empty() {
            FrameStep::Skip
        } else if self.stale {
            FrameStep::Rebuild
        } else if self.paused {
            FrameStep::Skip
        } else {
            FrameStep::Draw
        }
    }
}

pub struct VkRenderer {
    settings: RenderSettings,
    window_size: RenderSize,
    status: ChainStatus,

    surface_format: vk::SurfaceFormatKHR,
    chain: PresentationChain,
    render_pass: vk::RenderPass,
    targets: RenderTargetSet,
    pipeline: GraphicsPipeline,
    sync: FrameSync,

    // last: dropped after everything above is destroyed
    ctx: RenderContext,
}

// STRICT TEARDOWN ORDER:
// - device idle
// - frame sync (pools free their command buffers)
// - framebuffers + views BEFORE the swapchain they came from
// - pipeline + render pass
// - swapchain (takes its images with it)
// - RenderContext drop: device, surface, instance
// Every step tolerates parts that were never built.
impl Drop for VkRenderer {
    fn drop(&mut self) {
        unsafe {
            let d = &self.ctx.device;
            d.device_wait_idle().ok();

            self.sync.destroy(d);
            self.targets.destroy(d);
            self.pipeline.destroy(d);
            d.destroy_render_pass(self.render_pass, None);
            self.chain.destroy(&self.ctx);
        }
    }
}

// The renderer owns every handle from the first line on, so a failure at
// any later step unwinds through Drop in the right order.
unsafe fn build_renderer(
    window: &dyn HasWindowHandle,
    display: &dyn HasDisplayHandle,
    size: RenderSize,
    settings: RenderSettings,
) -> Result<VkRenderer> {
    let ctx = RenderContext::new(window, display)?;
    let mut r = VkRenderer {
        settings,
        window_size: size,
        status: ChainStatus::UNBUILT,
        surface_format: vk::SurfaceFormatKHR::default(),
        chain: PresentationChain::empty(),
        render_pass: vk::RenderPass::null(),
        targets: RenderTargetSet::empty(),
        pipeline: GraphicsPipeline::empty(),
        sync: FrameSync::empty(settings.pacing),
        ctx,
    };

    // a 0x0 window waits for its first real size
    if !size.is_empty() {
        r.recreate_chain()?;
    }
    Ok(r)
}

impl VkRenderer {
    pub fn extent(&self) -> vk::Extent2D {
        self.chain.extent()
    }

    pub fn image_count(&self) -> usize {
        self.chain.image_count()
    }

    pub fn format(&self) -> vk::Format {
        self.surface_format.format
    }

    pub fn pacing(&self) -> FramePacing {
        self.sync.pacing()
    }

    pub fn is_paused(&self) -> bool {
        self.status.paused
    }

    // STRICT ORDER (recreate):
    // 1) bail out (stay stale, pause) if the surface is 0x0
    // 2) device idle: nothing in flight references the old chain
    // 3) destroy sync + render targets
    // 4) renegotiate format, create new chain from the old one, retire old
    // 5) rebuild render pass + pipeline ONLY if the format changed
    // 6) build render targets + sync for the new image count
    unsafe fn recreate_chain(&mut self) -> Result<()> {
        let caps = self.ctx.surface_capabilities()?;
        if caps.current_extent.width == 0 || caps.current_extent.height == 0 {
            if !self.status.paused {
                info!("vk: surface is 0x0 → paused=true");
            }
            self.status.paused = true;
            return Ok(());
        }

        self.ctx.wait_idle()?;
        self.sync.destroy(&self.ctx.device);
        self.targets.destroy(&self.ctx.device);

        let surface_format = format::query(&self.ctx).context("surface format negotiation")?;
        let mut chain = PresentationChain::create(
            &self.ctx,
            surface_format,
            self.window_size,
            self.chain.handle(),
        )
        .context("create presentation chain")?;
        std::mem::swap(&mut self.chain, &mut chain);
        chain.destroy(&self.ctx);

        if surface_format.format != self.pipeline.format {
            info!(
                "vk: format {:?} → {:?}, building pass + pipeline",
                self.pipeline.format, surface_format.format
            );
            self.pipeline.destroy(&self.ctx.device);
            self.ctx
                .device
                .destroy_render_pass(self.render_pass, None);
            self.render_pass = vk::RenderPass::null();
            self.render_pass = targets::create_render_pass(&self.ctx.device, surface_format.format)?;
            self.pipeline =
                GraphicsPipeline::create(&self.ctx.device, self.render_pass, surface_format.format)
                    .context("create graphics pipeline")?;
        }
        self.surface_format = surface_format;

        self.targets = RenderTargetSet::build(&self.ctx.device, &self.chain, self.render_pass)
            .context("build render targets")?;
        self.sync = FrameSync::create(&self.ctx, self.settings.pacing, self.chain.image_count())
            .context("create frame sync")?;

        self.status = ChainStatus::default();
        Ok(())
    }
}

impl FrameBackend for VkRenderer {
    fn begin_frame(&mut self) -> VkrResult<()> {
        unsafe { self.sync.wait_slot(&self.ctx.device) }
    }

    fn acquire(&mut self) -> VkrResult<Acquire> {
        unsafe {
            sync::acquire(
                &self.ctx,
                self.chain.handle(),
                self.settings.acquire_timeout_ns,
                self.sync.slot().acquire,
            )
        }
    }

    fn record(&mut self, image_index: u32) -> VkrResult<()> {
        let target = self
            .targets
            .get(image_index)
            .ok_or(VkrError::BrokenFrame("acquired image has no render target"))?;
        let draw = DrawParams {
            clear_color: self.settings.clear_color,
            flip_y: self.settings.flip_y,
            pipeline: self.pipeline.pipeline,
            vertex_count: pipeline::TRIANGLE_VERTICES,
        };
        let plan = FramePlan::new(target, self.targets.extent(), &draw);
        let slot = self.sync.slot();
        unsafe { frame::record(&self.ctx.device, slot.pool, slot.cmd, self.render_pass, &plan) }
    }

    fn submit(&mut self, image_index: u32) -> VkrResult<()> {
        let slot = self.sync.slot();
        unsafe {
            sync::submit(
                &self.ctx,
                slot.cmd,
                slot.acquire,
                self.sync.release_for(image_index),
                slot.in_flight,
            )
        }
    }

    fn present(&mut self, image_index: u32) -> VkrResult<bool> {
        unsafe {
            sync::present(
                &self.ctx,
                self.chain.handle(),
                image_index,
                self.sync.release_for(image_index),
            )
        }
    }

    fn settle(&mut self) -> VkrResult<()> {
        if self.sync.pacing() == FramePacing::Idle {
            // the slot's pool is free to reset next frame
            unsafe { self.ctx.wait_idle()? };
        }
        self.sync.advance();
        Ok(())
    }

    fn mark_stale(&mut self) {
        if !self.status.stale {
            warn!("vk: swapchain out of date or suboptimal, rebuilding next frame");
        }
        self.status.stale = true;
    }

    fn frame_state(&mut self) -> &mut FrameState {
        self.sync.state_mut()
    }
}

impl Renderer for VkRenderer {
    fn new(
        window: &dyn HasWindowHandle,
        display: &dyn HasDisplayHandle,
        size: RenderSize,
        settings: RenderSettings,
    ) -> Result<Self> {
        unsafe {
            let r = build_renderer(window, display, size, settings)?;
            if r.is_paused() {
                info!("Vulkan renderer ready, waiting for a non-empty surface");
            } else {
                info!(
                    "Vulkan swapchain ready ({}x{}, {} images, fmt {:?}, pacing {:?})",
                    r.extent().width,
                    r.extent().height,
                    r.image_count(),
                    r.format(),
                    r.pacing()
                );
            }
            Ok(r)
        }
    }

    // Never rebuilds here: the frame loop does it once nothing is in flight.
    fn resize(&mut self, size: RenderSize) -> Result<()> {
        let next = self.status.resized(self.chain.extent(), size);
        if next.paused != self.status.paused {
            info!(
                "vk: resize to {}x{} → paused={}",
                size.width, size.height, next.paused
            );
        }
        self.window_size = size;
        self.status = next;
        Ok(())
    }

    fn render(&mut self) -> Result<FrameStatus> {
        match self.status.next_step(self.window_size) {
            FrameStep::Skip => return Ok(FrameStatus::Skipped),
            FrameStep::Rebuild => {
                unsafe { self.recreate_chain()? };
                // the surface itself may still be 0x0
                if self.status.paused {
                    return Ok(FrameStatus::Skipped);
                }
            }
            FrameStep::Draw => {}
        }

        Ok(sync::drive_frame(self)?)
    }

    fn set_clear_color(&mut self, rgba: [f32; 4]) {
        // picked up by the next recorded frame
        self.settings.clear_color = rgba;
    }
}
