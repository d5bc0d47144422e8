// SPDX-License-Identifier: CEPL-1.0
use ash::vk;

use crate::error::{VkResultExt, VkrError, VkrResult};
use crate::targets::RenderTarget;

/// Per-frame executor state. One full cycle per loop iteration; the host wait
/// after present is what brings it back to `Idle`.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum FrameState {
    #[default]
    Idle,
    Recording,
    Submitted,
}

impl FrameState {
    pub fn begin(self) -> VkrResult<Self> {
        match self {
            FrameState::Idle => Ok(FrameState::Recording),
            state => Err(VkrError::FrameState {
                state,
                event: "begin recording",
            }),
        }
    }

    pub fn submit(self) -> VkrResult<Self> {
        match self {
            FrameState::Recording => Ok(FrameState::Submitted),
            state => Err(VkrError::FrameState {
                state,
                event: "submit",
            }),
        }
    }

    pub fn retire(self) -> VkrResult<Self> {
        match self {
            FrameState::Submitted => Ok(FrameState::Idle),
            state => Err(VkrError::FrameState {
                state,
                event: "retire",
            }),
        }
    }
}

#[derive(Clone, Copy, Debug)]
pub struct LayoutTransition {
    pub old_layout: vk::ImageLayout,
    pub new_layout: vk::ImageLayout,
    pub src_access: vk::AccessFlags,
    pub dst_access: vk::AccessFlags,
    pub src_stage: vk::PipelineStageFlags,
    pub dst_stage: vk::PipelineStageFlags,
}

/// First use of the image this frame: nothing to wait for, unblock color writes.
pub const TO_COLOR_ATTACHMENT: LayoutTransition = LayoutTransition {
    old_layout: vk::ImageLayout::UNDEFINED,
    new_layout: vk::ImageLayout::COLOR_ATTACHMENT_OPTIMAL,
    src_access: vk::AccessFlags::empty(),
    dst_access: vk::AccessFlags::COLOR_ATTACHMENT_WRITE,
    src_stage: vk::PipelineStageFlags::BOTTOM_OF_PIPE,
    dst_stage: vk::PipelineStageFlags::COLOR_ATTACHMENT_OUTPUT,
};

/// Hand-off to the presentation engine, which does no further writes.
pub const TO_PRESENT: LayoutTransition = LayoutTransition {
    old_layout: vk::ImageLayout::COLOR_ATTACHMENT_OPTIMAL,
    new_layout: vk::ImageLayout::PRESENT_SRC_KHR,
    src_access: vk::AccessFlags::COLOR_ATTACHMENT_WRITE,
    dst_access: vk::AccessFlags::empty(),
    src_stage: vk::PipelineStageFlags::COLOR_ATTACHMENT_OUTPUT,
    dst_stage: vk::PipelineStageFlags::TOP_OF_PIPE,
};

#[derive(Clone, Copy, Debug)]
pub enum FrameCommand {
    Barrier(LayoutTransition),
    BeginRenderPass {
        framebuffer: vk::Framebuffer,
        extent: vk::Extent2D,
        clear: [f32; 4],
    },
    SetViewport(vk::Viewport),
    SetScissor(vk::Rect2D),
    BindPipeline(vk::Pipeline),
    Draw { vertex_count: u32 },
    EndRenderPass,
}

#[derive(Clone, Copy, Debug)]
pub struct DrawParams {
    pub clear_color: [f32; 4],
    pub flip_y: bool,
    pub pipeline: vk::Pipeline,
    pub vertex_count: u32,
}

pub fn viewport(extent: vk::Extent2D, flip_y: bool) -> vk::Viewport {
    let (w, h) = (extent.width as f32, extent.height as f32);
    if flip_y {
        vk::Viewport {
            x: 0.0,
            y: h,
            width: w,
            height: -h,
            min_depth: 0.0,
            max_depth: 1.0,
        }
    } else {
        vk::Viewport {
            x: 0.0,
            y: 0.0,
            width: w,
            height: h,
            min_depth: 0.0,
            max_depth: 1.0,
        }
    }
}

/// The command sequence for one frame, kept as data so it can be checked
/// before it is replayed onto a command buffer.
#[derive(Clone, Debug)]
pub struct FramePlan {
    pub image: vk::Image,
    pub commands: Vec<FrameCommand>,
}

impl FramePlan {
    pub fn new(target: &RenderTarget, extent: vk::Extent2D, draw: &DrawParams) -> Self {
        let scissor = vk::Rect2D {
            offset: vk::Offset2D { x: 0, y: 0 },
            extent,
        };
        let commands = vec![
            FrameCommand::Barrier(TO_COLOR_ATTACHMENT),
            FrameCommand::BeginRenderPass {
                framebuffer: target.framebuffer,
                extent,
                clear: draw.clear_color,
            },
            FrameCommand::SetViewport(viewport(extent, draw.flip_y)),
            FrameCommand::SetScissor(scissor),
            FrameCommand::BindPipeline(draw.pipeline),
            FrameCommand::Draw {
                vertex_count: draw.vertex_count,
            },
            FrameCommand::EndRenderPass,
            FrameCommand::Barrier(TO_PRESENT),
        ];
        Self {
            image: target.image,
            commands,
        }
    }

    /// Layouts the image passes through, starting from UNDEFINED.
    pub fn layouts(&self) -> Vec<vk::ImageLayout> {
        let mut out = vec![vk::ImageLayout::UNDEFINED];
        out.extend(self.commands.iter().filter_map(|c| match c {
            FrameCommand::Barrier(t) => Some(t.new_layout),
            _ => None,
        }));
        out
    }

    /// UNDEFINED -> COLOR_ATTACHMENT_OPTIMAL -> PRESENT_SRC_KHR, with all
    /// drawing inside one pass bracketed by the two transitions.
    pub fn validate(&self) -> VkrResult<()> {
        let mut layout = vk::ImageLayout::UNDEFINED;
        let mut in_pass = false;
        let mut passes = 0;

        for cmd in &self.commands {
            match cmd {
                FrameCommand::Barrier(t) => {
                    if in_pass {
                        return Err(VkrError::BrokenFrame("layout transition inside render pass"));
                    }
                    if t.old_layout != layout {
                        return Err(VkrError::BrokenFrame("transition from the wrong layout"));
                    }
                    layout = t.new_layout;
                }
                FrameCommand::BeginRenderPass { .. } => {
                    if in_pass {
                        return Err(VkrError::BrokenFrame("nested render pass"));
                    }
                    if layout != vk::ImageLayout::COLOR_ATTACHMENT_OPTIMAL {
                        return Err(VkrError::BrokenFrame(
                            "render pass begun before the image is renderable",
                        ));
                    }
                    in_pass = true;
                    passes += 1;
                }
                FrameCommand::EndRenderPass => {
                    if !in_pass {
                        return Err(VkrError::BrokenFrame("render pass ended twice"));
                    }
                    in_pass = false;
                }
                FrameCommand::Draw { .. } if !in_pass => {
                    return Err(VkrError::BrokenFrame("draw outside render pass"));
                }
                _ => {}
            }
        }

        if in_pass {
            return Err(VkrError::BrokenFrame("render pass left open"));
        }
        if passes != 1 {
            return Err(VkrError::BrokenFrame("expected exactly one render pass"));
        }
        if layout != vk::ImageLayout::PRESENT_SRC_KHR {
            return Err(VkrError::BrokenFrame("image not left presentable"));
        }
        Ok(())
    }
}

fn image_barrier(image: vk::Image, t: &LayoutTransition) -> vk::ImageMemoryBarrier<'static> {
    vk::ImageMemoryBarrier {
        s_type: vk::StructureType::IMAGE_MEMORY_BARRIER,
        src_access_mask: t.src_access,
        dst_access_mask: t.dst_access,
        old_layout: t.old_layout,
        new_layout: t.new_layout,
        src_queue_family_index: vk::QUEUE_FAMILY_IGNORED,
        dst_queue_family_index: vk::QUEUE_FAMILY_IGNORED,
        image,
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

// STRICT ORDER per frame:
// 1) reset the whole pool (its last submission has retired)
// 2) begin one-time-submit
// 3) replay the validated plan
// 4) end
pub unsafe fn record(
    device: &ash::Device,
    pool: vk::CommandPool,
    cmd: vk::CommandBuffer,
    render_pass: vk::RenderPass,
    plan: &FramePlan,
) -> VkrResult<()> {
    plan.validate()?;

    device
        .reset_command_pool(pool, vk::CommandPoolResetFlags::empty())
        .check("reset_command_pool")?;
    let begin = vk::CommandBufferBeginInfo {
        s_type: vk::StructureType::COMMAND_BUFFER_BEGIN_INFO,
        flags: vk::CommandBufferUsageFlags::ONE_TIME_SUBMIT,
        ..Default::default()
    };
    device
        .begin_command_buffer(cmd, &begin)
        .check("begin_command_buffer")?;

    for command in &plan.commands {
        match *command {
            FrameCommand::Barrier(t) => {
                let barrier = image_barrier(plan.image, &t);
                device.cmd_pipeline_barrier(
                    cmd,
                    t.src_stage,
                    t.dst_stage,
                    vk::DependencyFlags::empty(),
                    &[],
                    &[],
                    std::slice::from_ref(&barrier),
                );
            }
            FrameCommand::BeginRenderPass {
                framebuffer,
                extent,
                clear,
            } => {
                let clears = [vk::ClearValue {
                    color: vk::ClearColorValue { float32: clear },
                }];
                let rp_begin = vk::RenderPassBeginInfo {
                    s_type: vk::StructureType::RENDER_PASS_BEGIN_INFO,
                    render_pass,
                    framebuffer,
                    render_area: vk::Rect2D {
                        offset: vk::Offset2D { x: 0, y: 0 },
                        extent,
                    },
                    clear_value_count: clears.len() as u32,
                    p_clear_values: clears.as_ptr(),
                    ..Default::default()
                };
                device.cmd_begin_render_pass(cmd, &rp_begin, vk::SubpassContents::INLINE);
            }
            FrameCommand::SetViewport(vp) => {
                device.cmd_set_viewport(cmd, 0, std::slice::from_ref(&vp));
            }
            FrameCommand::SetScissor(sc) => {
                device.cmd_set_scissor(cmd, 0, std::slice::from_ref(&sc));
            }
            FrameCommand::BindPipeline(pipeline) => {
                device.cmd_bind_pipeline(cmd, vk::PipelineBindPoint::GRAPHICS, pipeline);
            }
            FrameCommand::Draw { vertex_count } => {
                device.cmd_draw(cmd, vertex_count, 1, 0, 0);
            }
            FrameCommand::EndRenderPass => {
                device.cmd_end_render_pass(cmd);
            }
        }
    }

    device.end_command_buffer(cmd).check("end_command_buffer")
}
