// SPDX-License-Identifier: CEPL-1.0
use ash::vk;
use tracing::info;
use vkr_render::RenderSize;

use crate::context::RenderContext;
use crate::error::{VkResultExt, VkrError, VkrResult};

/// Never fewer than double buffering, even when the device reports 1.
pub const MIN_BUFFERING: u32 = 2;

const COMPOSITE_ALPHA_PREFERENCE: [vk::CompositeAlphaFlagsKHR; 4] = [
    vk::CompositeAlphaFlagsKHR::OPAQUE,
    vk::CompositeAlphaFlagsKHR::PRE_MULTIPLIED,
    vk::CompositeAlphaFlagsKHR::POST_MULTIPLIED,
    vk::CompositeAlphaFlagsKHR::INHERIT,
];

/// `max(2, min_image_count)`, capped by `max_image_count` (0 = no cap).
pub fn image_count(caps: &vk::SurfaceCapabilitiesKHR) -> u32 {
    let want = caps.min_image_count.max(MIN_BUFFERING);
    if caps.max_image_count == 0 {
        want
    } else {
        want.min(caps.max_image_count)
    }
}

pub fn composite_alpha(supported: vk::CompositeAlphaFlagsKHR) -> vk::CompositeAlphaFlagsKHR {
    COMPOSITE_ALPHA_PREFERENCE
        .into_iter()
        .find(|&mode| supported.contains(mode))
        .unwrap_or(vk::CompositeAlphaFlagsKHR::OPAQUE)
}

/// The surface's current extent wins; `u32::MAX` means the window decides,
/// clamped to what the surface accepts.
pub fn extent_from_caps(caps: &vk::SurfaceCapabilitiesKHR, want: RenderSize) -> vk::Extent2D {
    if caps.current_extent.width != u32::MAX {
        caps.current_extent
    } else {
        vk::Extent2D {
            width: want
                .width
                .clamp(caps.min_image_extent.width, caps.max_image_extent.width),
            height: want
                .height
                .clamp(caps.min_image_extent.height, caps.max_image_extent.height),
        }
    }
}

/// Everything that goes into a swapchain, decided from capabilities alone.
#[derive(Clone, Copy, Debug, Default)]
pub struct ChainPlan {
    pub format: vk::SurfaceFormatKHR,
    pub extent: vk::Extent2D,
    pub image_count: u32,
    pub composite_alpha: vk::CompositeAlphaFlagsKHR,
    pub pre_transform: vk::SurfaceTransformFlagsKHR,
    pub present_mode: vk::PresentModeKHR,
}

impl ChainPlan {
    pub fn new(
        caps: &vk::SurfaceCapabilitiesKHR,
        format: vk::SurfaceFormatKHR,
        window: RenderSize,
    ) -> Self {
        Self {
            format,
            extent: extent_from_caps(caps, window),
            image_count: image_count(caps),
            composite_alpha: composite_alpha(caps.supported_composite_alpha),
            pre_transform: caps.current_transform,
            // vsync-bound and strictly ordered; always supported
            present_mode: vk::PresentModeKHR::FIFO,
        }
    }

    fn create_info(
        &self,
        surface: vk::SurfaceKHR,
        old: vk::SwapchainKHR,
    ) -> vk::SwapchainCreateInfoKHR<'static> {
        vk::SwapchainCreateInfoKHR {
            s_type: vk::StructureType::SWAPCHAIN_CREATE_INFO_KHR,
            surface,
            min_image_count: self.image_count,
            image_format: self.format.format,
            image_color_space: self.format.color_space,
            image_extent: self.extent,
            image_array_layers: 1,
            image_usage: vk::ImageUsageFlags::COLOR_ATTACHMENT,
            image_sharing_mode: vk::SharingMode::EXCLUSIVE,
            pre_transform: self.pre_transform,
            composite_alpha: self.composite_alpha,
            present_mode: self.present_mode,
            clipped: vk::TRUE,
            old_swapchain: old,
            ..Default::default()
        }
    }
}

/// The swapchain plus the images the presentation engine owns for it.
/// Images are never destroyed individually; they go with the swapchain.
pub struct PresentationChain {
    pub(crate) handle: vk::SwapchainKHR,
    pub(crate) images: Vec<vk::Image>,
    pub(crate) plan: ChainPlan,
}

impl PresentationChain {
    /// No swapchain yet; `create` fills it in once the surface has an extent.
    pub fn empty() -> Self {
        Self {
            handle: vk::SwapchainKHR::null(),
            images: Vec::new(),
            plan: ChainPlan::default(),
        }
    }

    /// `old` may be null; when set, the driver can recycle its resources.
    /// The caller still destroys `old` afterwards.
    pub unsafe fn create(
        ctx: &RenderContext,
        format: vk::SurfaceFormatKHR,
        window: RenderSize,
        old: vk::SwapchainKHR,
    ) -> VkrResult<Self> {
        ctx.ensure_present_support()?;

        // live caps, not an earlier probe
        let caps = ctx.surface_capabilities()?;
        let plan = ChainPlan::new(&caps, format, window);

        let info = plan.create_info(ctx.surface, old);
        let handle = ctx
            .swapchain_loader
            .create_swapchain(&info, None)
            .check("create_swapchain")?;
        let images = match ctx.swapchain_loader.get_swapchain_images(handle) {
            Ok(images) => images,
            Err(result) => {
                ctx.swapchain_loader.destroy_swapchain(handle, None);
                return Err(VkrError::Vk {
                    call: "get_swapchain_images",
                    result,
                });
            }
        };

        info!(
            "vk: swapchain ready ({}x{}, {} images, requested {}, {:?}, alpha {:?})",
            plan.extent.width,
            plan.extent.height,
            images.len(),
            plan.image_count,
            plan.format.format,
            plan.composite_alpha
        );

        Ok(Self {
            handle,
            images,
            plan,
        })
    }

    /// Safe to call twice; the second call is a no-op.
    pub unsafe fn destroy(&mut self, ctx: &RenderContext) {
        if self.handle == vk::SwapchainKHR::null() {
            return;
        }
        ctx.swapchain_loader.destroy_swapchain(self.handle, None);
        info!("vk: swapchain destroyed ({} images)", self.images.len());
        self.handle = vk::SwapchainKHR::null();
        self.images.clear();
    }

    pub fn handle(&self) -> vk::SwapchainKHR {
        self.handle
    }

    pub fn images(&self) -> &[vk::Image] {
        &self.images
    }

    pub fn image_count(&self) -> usize {
        self.images.len()
    }

    pub fn format(&self) -> vk::Format {
        self.plan.format.format
    }

    pub fn extent(&self) -> vk::Extent2D {
        self.plan.extent
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn caps(min: u32, max: u32) -> vk::SurfaceCapabilitiesKHR {
        vk::SurfaceCapabilitiesKHR {
            min_image_count: min,
            max_image_count: max,
            current_extent: vk::Extent2D {
                width: 1280,
                height: 720,
            },
            min_image_extent: vk::Extent2D {
                width: 1,
                height: 1,
            },
            max_image_extent: vk::Extent2D {
                width: 4096,
                height: 4096,
            },
            current_transform: vk::SurfaceTransformFlagsKHR::IDENTITY,
            supported_composite_alpha: vk::CompositeAlphaFlagsKHR::OPAQUE,
            ..Default::default()
        }
    }

    const FORMAT: vk::SurfaceFormatKHR = vk::SurfaceFormatKHR {
        format: vk::Format::B8G8R8A8_UNORM,
        color_space: vk::ColorSpaceKHR::SRGB_NONLINEAR,
    };

    const WINDOW: RenderSize = RenderSize {
        width: 1920,
        height: 1080,
    };

    #[test]
    fn min_image_count_of_one_still_double_buffers() {
        assert_eq!(image_count(&caps(1, 8)), 2);
    }

    #[test]
    fn image_count_respects_device_bounds() {
        for min in 1..=4 {
            for max in [0, 2, 3, 4, 8] {
                if max != 0 && max < min.max(MIN_BUFFERING) {
                    continue;
                }
                let n = image_count(&caps(min, max));
                assert!(n >= min.max(MIN_BUFFERING), "min={min} max={max} n={n}");
                if max != 0 {
                    assert!(n <= max, "min={min} max={max} n={n}");
                }
            }
        }
    }

    #[test]
    fn unbounded_max_takes_the_minimum() {
        assert_eq!(image_count(&caps(3, 0)), 3);
    }

    #[test]
    fn composite_alpha_follows_preference_order() {
        use vk::CompositeAlphaFlagsKHR as A;
        assert_eq!(composite_alpha(A::OPAQUE | A::INHERIT), A::OPAQUE);
        assert_eq!(
            composite_alpha(A::POST_MULTIPLIED | A::PRE_MULTIPLIED),
            A::PRE_MULTIPLIED
        );
        assert_eq!(
            composite_alpha(A::INHERIT | A::POST_MULTIPLIED),
            A::POST_MULTIPLIED
        );
        assert_eq!(composite_alpha(A::INHERIT), A::INHERIT);
    }

    #[test]
    fn current_extent_wins_over_window_size() {
        let e = extent_from_caps(&caps(2, 3), WINDOW);
        assert_eq!((e.width, e.height), (1280, 720));
    }

    #[test]
    fn undefined_extent_clamps_window_size() {
        let mut c = caps(2, 3);
        c.current_extent = vk::Extent2D {
            width: u32::MAX,
            height: u32::MAX,
        };
        c.max_image_extent = vk::Extent2D {
            width: 1600,
            height: 1600,
        };
        let e = extent_from_caps(&c, WINDOW);
        assert_eq!((e.width, e.height), (1600, 1080));
    }

    #[test]
    fn plan_is_fifo_color_attachment_with_live_transform() {
        let mut c = caps(1, 0);
        c.current_transform = vk::SurfaceTransformFlagsKHR::ROTATE_90;
        let plan = ChainPlan::new(&c, FORMAT, WINDOW);
        assert_eq!(plan.present_mode, vk::PresentModeKHR::FIFO);
        assert_eq!(plan.image_count, 2);

        let info = plan.create_info(vk::SurfaceKHR::null(), vk::SwapchainKHR::null());
        assert_eq!(info.image_usage, vk::ImageUsageFlags::COLOR_ATTACHMENT);
        assert_eq!(info.pre_transform, vk::SurfaceTransformFlagsKHR::ROTATE_90);
        assert_eq!(info.image_format, vk::Format::B8G8R8A8_UNORM);
        assert_eq!(info.min_image_count, 2);
        assert_eq!(info.image_array_layers, 1);
    }

    #[test]
    fn empty_chain_has_nothing_to_destroy() {
        let chain = PresentationChain::empty();
        assert_eq!(chain.handle(), vk::SwapchainKHR::null());
        assert_eq!(chain.image_count(), 0);
        assert_eq!(chain.format(), vk::Format::UNDEFINED);
    }

    #[test]
    fn replanning_with_identical_inputs_is_identical() {
        let c = caps(3, 4);
        let a = ChainPlan::new(&c, FORMAT, WINDOW);
        let b = ChainPlan::new(&c, FORMAT, WINDOW);
        assert_eq!(a.image_count, b.image_count);
        assert_eq!(a.extent, b.extent);
        assert_eq!(a.composite_alpha, b.composite_alpha);
        assert_eq!(a.format.format, b.format.format);
    }
}
