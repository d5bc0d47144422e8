// SPDX-License-Identifier: CEPL-1.0
use ash::prelude::VkResult;
use ash::vk;
use tracing::info;

use crate::chain::PresentationChain;
use crate::error::{VkResultExt, VkrError, VkrResult};

/// The slice of device functionality the render target set needs. Lets the
/// count/extent bookkeeping run without a GPU.
pub trait TargetDevice {
    unsafe fn create_view(&self, info: &vk::ImageViewCreateInfo<'_>) -> VkResult<vk::ImageView>;
    unsafe fn create_framebuffer(
        &self,
        info: &vk::FramebufferCreateInfo<'_>,
    ) -> VkResult<vk::Framebuffer>;
    unsafe fn destroy_view(&self, view: vk::ImageView);
    unsafe fn destroy_framebuffer(&self, framebuffer: vk::Framebuffer);
}

impl TargetDevice for ash::Device {
    unsafe fn create_view(&self, info: &vk::ImageViewCreateInfo<'_>) -> VkResult<vk::ImageView> {
        self.create_image_view(info, None)
    }

    unsafe fn create_framebuffer(
        &self,
        info: &vk::FramebufferCreateInfo<'_>,
    ) -> VkResult<vk::Framebuffer> {
        ash::Device::create_framebuffer(self, info, None)
    }

    unsafe fn destroy_view(&self, view: vk::ImageView) {
        self.destroy_image_view(view, None);
    }

    unsafe fn destroy_framebuffer(&self, framebuffer: vk::Framebuffer) {
        ash::Device::destroy_framebuffer(self, framebuffer, None);
    }
}

/// Single color attachment, cleared on load and kept on store. The pass
/// enters and leaves in COLOR_ATTACHMENT_OPTIMAL; moving to and from the
/// presentable layout is the frame's job, not the pass's.
pub fn color_attachment(format: vk::Format) -> vk::AttachmentDescription {
    vk::AttachmentDescription {
        format,
        samples: vk::SampleCountFlags::TYPE_1,
        load_op: vk::AttachmentLoadOp::CLEAR,
        store_op: vk::AttachmentStoreOp::STORE,
        stencil_load_op: vk::AttachmentLoadOp::DONT_CARE,
        stencil_store_op: vk::AttachmentStoreOp::DONT_CARE,
        initial_layout: vk::ImageLayout::COLOR_ATTACHMENT_OPTIMAL,
        final_layout: vk::ImageLayout::COLOR_ATTACHMENT_OPTIMAL,
        ..Default::default()
    }
}

pub unsafe fn create_render_pass(
    device: &ash::Device,
    format: vk::Format,
) -> VkrResult<vk::RenderPass> {
    let color_att = color_attachment(format);
    let att_ref = vk::AttachmentReference {
        attachment: 0,
        layout: vk::ImageLayout::COLOR_ATTACHMENT_OPTIMAL,
    };

    let subpass = vk::SubpassDescription {
        pipeline_bind_point: vk::PipelineBindPoint::GRAPHICS,
        color_attachment_count: 1,
        p_color_attachments: &att_ref,
        ..Default::default()
    };

    let rp_info = vk::RenderPassCreateInfo {
        s_type: vk::StructureType::RENDER_PASS_CREATE_INFO,
        attachment_count: 1,
        p_attachments: &color_att,
        subpass_count: 1,
        p_subpasses: &subpass,
        ..Default::default()
    };
    device
        .create_render_pass(&rp_info, None)
        .check("create_render_pass")
}

fn color_view_info(image: vk::Image, format: vk::Format) -> vk::ImageViewCreateInfo<'static> {
    vk::ImageViewCreateInfo {
        s_type: vk::StructureType::IMAGE_VIEW_CREATE_INFO,
        image,
        view_type: vk::ImageViewType::TYPE_2D,
        format,
        subresource_range: vk::ImageSubresourceRange {
            aspect_mask: vk::ImageAspectFlags::COLOR,
            base_mip_level: 0,
            level_count: 1,
            base_array_layer: 0,
            layer_count: 1,
        },
        ..Default::default()
    }
}

#[derive(Clone, Copy, Debug)]
pub struct RenderTarget {
    pub image: vk::Image,
    pub view: vk::ImageView,
    pub framebuffer: vk::Framebuffer,
}

/// One view + framebuffer per chain image. Lives and dies with its chain.
pub struct RenderTargetSet {
    targets: Vec<RenderTarget>,
    extent: vk::Extent2D,
}

impl RenderTargetSet {
    pub fn empty() -> Self {
        Self {
            targets: Vec::new(),
            extent: vk::Extent2D::default(),
        }
    }

    pub unsafe fn build<D: TargetDevice>(
        device: &D,
        chain: &PresentationChain,
        render_pass: vk::RenderPass,
    ) -> VkrResult<Self> {
        let extent = chain.extent();
        let mut set = Self {
            targets: Vec::with_capacity(chain.image_count()),
            extent,
        };

        for &image in chain.images() {
            match Self::build_one(device, image, chain.format(), extent, render_pass) {
                Ok(target) => set.targets.push(target),
                Err(e) => {
                    set.destroy(device);
                    return Err(e);
                }
            }
        }

        info!(
            "vk: {} render targets at {}x{}",
            set.targets.len(),
            extent.width,
            extent.height
        );
        Ok(set)
    }

    unsafe fn build_one<D: TargetDevice>(
        device: &D,
        image: vk::Image,
        format: vk::Format,
        extent: vk::Extent2D,
        render_pass: vk::RenderPass,
    ) -> VkrResult<RenderTarget> {
        let view = device
            .create_view(&color_view_info(image, format))
            .check("create_image_view")?;

        let fb_info = vk::FramebufferCreateInfo {
            s_type: vk::StructureType::FRAMEBUFFER_CREATE_INFO,
            render_pass,
            attachment_count: 1,
            p_attachments: &view,
            width: extent.width,
            height: extent.height,
            layers: 1,
            ..Default::default()
        };
        let framebuffer = match device.create_framebuffer(&fb_info) {
            Ok(fb) => fb,
            Err(result) => {
                device.destroy_view(view);
                return Err(VkrError::Vk {
                    call: "create_framebuffer",
                    result,
                });
            }
        };

        Ok(RenderTarget {
            image,
            view,
            framebuffer,
        })
    }

    // framebuffers before the views they reference
    pub unsafe fn destroy<D: TargetDevice>(&mut self, device: &D) {
        for t in self.targets.drain(..) {
            device.destroy_framebuffer(t.framebuffer);
            device.destroy_view(t.view);
        }
    }

    pub fn get(&self, image_index: u32) -> Option<&RenderTarget> {
        self.targets.get(image_index as usize)
    }

    pub fn len(&self) -> usize {
        self.targets.len()
    }

    pub fn is_empty(&self) -> bool {
        self.targets.is_empty()
    }

    pub fn extent(&self) -> vk::Extent2D {
        self.extent
    }
}
