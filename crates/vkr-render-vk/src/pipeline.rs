// SPDX-License-Identifier: CEPL-1.0
use std::io::Cursor;

use ash::util::read_spv;
use ash::vk;

use crate::error::{VkResultExt, VkrError, VkrResult};

pub const TRIANGLE_VERTICES: u32 = 3;

static VERT_SPV: &[u8] = include_bytes!(concat!(env!("OUT_DIR"), "/tri.vert.spv"));
static FRAG_SPV: &[u8] = include_bytes!(concat!(env!("OUT_DIR"), "/tri.frag.spv"));

/// Opaque draw state handed to the frame executor: the two shader stages and
/// a pipeline bound to the render pass. Viewport and scissor are dynamic, so
/// it survives a resize; only a format change needs a rebuild.
pub struct GraphicsPipeline {
    pub layout: vk::PipelineLayout,
    pub pipeline: vk::Pipeline,
    pub format: vk::Format,
}

unsafe fn shader_module(device: &ash::Device, spv: &[u8]) -> VkrResult<vk::ShaderModule> {
    let code = read_spv(&mut Cursor::new(spv)).map_err(VkrError::InvalidSpirv)?;
    let ci = vk::ShaderModuleCreateInfo {
        s_type: vk::StructureType::SHADER_MODULE_CREATE_INFO,
        p_code: code.as_ptr(),
        code_size: code.len() * 4,
        ..Default::default()
    };
    device
        .create_shader_module(&ci, None)
        .check("create_shader_module")
}

impl GraphicsPipeline {
    /// Placeholder with an UNDEFINED format, so the first real format
    /// always triggers a build.
    pub fn empty() -> Self {
        Self {
            layout: vk::PipelineLayout::null(),
            pipeline: vk::Pipeline::null(),
            format: vk::Format::UNDEFINED,
        }
    }

    // STRICT: the render pass MUST be the one the framebuffers were built
    // against (same color format).
    pub unsafe fn create(
        device: &ash::Device,
        render_pass: vk::RenderPass,
        format: vk::Format,
    ) -> VkrResult<Self> {
        let vs = shader_module(device, VERT_SPV)?;
        let fs = match shader_module(device, FRAG_SPV) {
            Ok(fs) => fs,
            Err(e) => {
                device.destroy_shader_module(vs, None);
                return Err(e);
            }
        };

        let built = Self::build(device, render_pass, vs, fs);

        // modules are only needed during pipeline creation
        device.destroy_shader_module(vs, None);
        device.destroy_shader_module(fs, None);

        let (layout, pipeline) = built?;
        Ok(Self {
            layout,
            pipeline,
            format,
        })
    }

    unsafe fn build(
        device: &ash::Device,
        render_pass: vk::RenderPass,
        vs: vk::ShaderModule,
        fs: vk::ShaderModule,
    ) -> VkrResult<(vk::PipelineLayout, vk::Pipeline)> {
        let entry = c"main";
        let stages = [
            vk::PipelineShaderStageCreateInfo {
                s_type: vk::StructureType::PIPELINE_SHADER_STAGE_CREATE_INFO,
                stage: vk::ShaderStageFlags::VERTEX,
                module: vs,
                p_name: entry.as_ptr(),
                ..Default::default()
            },
            vk::PipelineShaderStageCreateInfo {
                s_type: vk::StructureType::PIPELINE_SHADER_STAGE_CREATE_INFO,
                stage: vk::ShaderStageFlags::FRAGMENT,
                module: fs,
                p_name: entry.as_ptr(),
                ..Default::default()
            },
        ];

        // positions come from gl_VertexIndex
        let vertex_input = vk::PipelineVertexInputStateCreateInfo {
            s_type: vk::StructureType::PIPELINE_VERTEX_INPUT_STATE_CREATE_INFO,
            ..Default::default()
        };
        let input_assembly = vk::PipelineInputAssemblyStateCreateInfo {
            s_type: vk::StructureType::PIPELINE_INPUT_ASSEMBLY_STATE_CREATE_INFO,
            topology: vk::PrimitiveTopology::TRIANGLE_LIST,
            ..Default::default()
        };
        let dyn_states = [vk::DynamicState::VIEWPORT, vk::DynamicState::SCISSOR];
        let dynamic_state = vk::PipelineDynamicStateCreateInfo {
            s_type: vk::StructureType::PIPELINE_DYNAMIC_STATE_CREATE_INFO,
            dynamic_state_count: dyn_states.len() as u32,
            p_dynamic_states: dyn_states.as_ptr(),
            ..Default::default()
        };
        let viewport_state = vk::PipelineViewportStateCreateInfo {
            s_type: vk::StructureType::PIPELINE_VIEWPORT_STATE_CREATE_INFO,
            viewport_count: 1,
            scissor_count: 1,
            ..Default::default()
        };
        // no culling: winding flips with the viewport
        let raster = vk::PipelineRasterizationStateCreateInfo {
            s_type: vk::StructureType::PIPELINE_RASTERIZATION_STATE_CREATE_INFO,
            polygon_mode: vk::PolygonMode::FILL,
            cull_mode: vk::CullModeFlags::NONE,
            front_face: vk::FrontFace::COUNTER_CLOCKWISE,
            line_width: 1.0,
            ..Default::default()
        };
        let multisample = vk::PipelineMultisampleStateCreateInfo {
            s_type: vk::StructureType::PIPELINE_MULTISAMPLE_STATE_CREATE_INFO,
            rasterization_samples: vk::SampleCountFlags::TYPE_1,
            ..Default::default()
        };
        let color_blend_att = vk::PipelineColorBlendAttachmentState {
            color_write_mask: vk::ColorComponentFlags::R
                | vk::ColorComponentFlags::G
                | vk::ColorComponentFlags::B
                | vk::ColorComponentFlags::A,
            blend_enable: vk::FALSE,
            ..Default::default()
        };
        let color_blend = vk::PipelineColorBlendStateCreateInfo {
            s_type: vk::StructureType::PIPELINE_COLOR_BLEND_STATE_CREATE_INFO,
            attachment_count: 1,
            p_attachments: &color_blend_att,
            ..Default::default()
        };

        let layout_info = vk::PipelineLayoutCreateInfo {
            s_type: vk::StructureType::PIPELINE_LAYOUT_CREATE_INFO,
            ..Default::default()
        };
        let layout = device
            .create_pipeline_layout(&layout_info, None)
            .check("create_pipeline_layout")?;

        let pipeline_info = vk::GraphicsPipelineCreateInfo {
            s_type: vk::StructureType::GRAPHICS_PIPELINE_CREATE_INFO,
            stage_count: stages.len() as u32,
            p_stages: stages.as_ptr(),
            p_vertex_input_state: &vertex_input,
            p_input_assembly_state: &input_assembly,
            p_viewport_state: &viewport_state,
            p_rasterization_state: &raster,
            p_multisample_state: &multisample,
            p_color_blend_state: &color_blend,
            p_dynamic_state: &dynamic_state,
            layout,
            render_pass,
            subpass: 0,
            ..Default::default()
        };

        match device.create_graphics_pipelines(
            vk::PipelineCache::null(),
            std::slice::from_ref(&pipeline_info),
            None,
        ) {
            Ok(p) => Ok((layout, p[0])),
            Err((_, result)) => {
                device.destroy_pipeline_layout(layout, None);
                Err(VkrError::Vk {
                    call: "create_graphics_pipelines",
                    result,
                })
            }
        }
    }

    /// Leaves null handles behind, so a second call is a no-op.
    pub unsafe fn destroy(&mut self, device: &ash::Device) {
        device.destroy_pipeline(self.pipeline, None);
        device.destroy_pipeline_layout(self.layout, None);
        self.pipeline = vk::Pipeline::null();
        self.layout = vk::PipelineLayout::null();
    }
}
