// SPDX-License-Identifier: CEPL-1.0
use std::ffi::{c_char, CStr, CString};

use anyhow::{anyhow, Context, Result};
#[cfg(debug_assertions)]
use ash::ext::debug_utils;
use ash::khr::{surface, swapchain};
use ash::{vk, Entry, Instance};
use raw_window_handle::{HasDisplayHandle, HasWindowHandle, RawDisplayHandle};
use tracing::info;
#[cfg(debug_assertions)]
use tracing::{debug, error, warn};

use crate::error::{VkResultExt, VkrError, VkrResult};

#[cfg(debug_assertions)]
type DebugState = (debug_utils::Instance, vk::DebugUtilsMessengerEXT);
#[cfg(not(debug_assertions))]
type DebugState = ();

/// Everything the swapchain core needs from device bootstrap, built once and
/// borrowed by every component. Owns the handles; torn down in reverse
/// creation order on drop.
pub struct RenderContext {
    _entry: Entry,
    pub instance: Instance,
    debug: DebugState,

    pub surface_loader: surface::Instance,
    pub surface: vk::SurfaceKHR,

    pub phys: vk::PhysicalDevice,
    pub device: ash::Device,
    pub queue_family: u32,
    pub queue: vk::Queue,

    pub swapchain_loader: swapchain::Device,
}

impl Drop for RenderContext {
    fn drop(&mut self) {
        unsafe {
            self.device.device_wait_idle().ok();
            self.device.destroy_device(None);
            self.surface_loader.destroy_surface(self.surface, None);
            destroy_debug_messenger(&self.debug);
            self.instance.destroy_instance(None);
        }
    }
}

#[cfg(debug_assertions)]
unsafe extern "system" fn debug_callback(
    severity: vk::DebugUtilsMessageSeverityFlagsEXT,
    _types: vk::DebugUtilsMessageTypeFlagsEXT,
    data: *const vk::DebugUtilsMessengerCallbackDataEXT<'_>,
    _user: *mut std::os::raw::c_void,
) -> vk::Bool32 {
    if data.is_null() || (*data).p_message.is_null() {
        return vk::FALSE;
    }
    let msg = CStr::from_ptr((*data).p_message).to_string_lossy();
    if severity.contains(vk::DebugUtilsMessageSeverityFlagsEXT::ERROR) {
        error!(target: "vulkan", "{msg}");
    } else if severity.contains(vk::DebugUtilsMessageSeverityFlagsEXT::WARNING) {
        warn!(target: "vulkan", "{msg}");
    } else {
        debug!(target: "vulkan", "{msg}");
    }
    vk::FALSE
}

#[cfg(debug_assertions)]
unsafe fn create_debug_messenger(entry: &Entry, instance: &Instance) -> Result<DebugState> {
    let loader = debug_utils::Instance::new(entry, instance);
    let ci = vk::DebugUtilsMessengerCreateInfoEXT {
        s_type: vk::StructureType::DEBUG_UTILS_MESSENGER_CREATE_INFO_EXT,
        message_severity: vk::DebugUtilsMessageSeverityFlagsEXT::VERBOSE
            | vk::DebugUtilsMessageSeverityFlagsEXT::WARNING
            | vk::DebugUtilsMessageSeverityFlagsEXT::ERROR,
        message_type: vk::DebugUtilsMessageTypeFlagsEXT::GENERAL
            | vk::DebugUtilsMessageTypeFlagsEXT::VALIDATION
            | vk::DebugUtilsMessageTypeFlagsEXT::PERFORMANCE,
        pfn_user_callback: Some(debug_callback),
        ..Default::default()
    };
    let messenger = loader
        .create_debug_utils_messenger(&ci, None)
        .context("create_debug_utils_messenger")?;
    Ok((loader, messenger))
}

#[cfg(not(debug_assertions))]
unsafe fn create_debug_messenger(_entry: &Entry, _instance: &Instance) -> Result<DebugState> {
    Ok(())
}

#[cfg(debug_assertions)]
unsafe fn destroy_debug_messenger(debug: &DebugState) {
    debug.0.destroy_debug_utils_messenger(debug.1, None);
}

#[cfg(not(debug_assertions))]
unsafe fn destroy_debug_messenger(_debug: &DebugState) {}

unsafe fn create_instance(entry: &Entry, display_raw: RawDisplayHandle) -> Result<Instance> {
    let app_name = CString::new("VKR")?;

    let app_info = vk::ApplicationInfo {
        s_type: vk::StructureType::APPLICATION_INFO,
        p_application_name: app_name.as_ptr(),
        application_version: 0,
        p_engine_name: app_name.as_ptr(),
        engine_version: 0,
        api_version: vk::API_VERSION_1_2,
        ..Default::default()
    };

    let mut ext_vec: Vec<*const c_char> = ash_window::enumerate_required_extensions(display_raw)
        .context("enumerate_required_extensions")?
        .to_vec();

    #[cfg(debug_assertions)]
    ext_vec.push(debug_utils::NAME.as_ptr());

    #[cfg(debug_assertions)]
    let layers = [c"VK_LAYER_KHRONOS_validation".as_ptr()];
    #[cfg(not(debug_assertions))]
    let layers: [*const c_char; 0] = [];

    let create_info = vk::InstanceCreateInfo {
        s_type: vk::StructureType::INSTANCE_CREATE_INFO,
        p_application_info: &app_info,
        enabled_extension_count: ext_vec.len() as u32,
        pp_enabled_extension_names: ext_vec.as_ptr(),
        enabled_layer_count: layers.len() as u32,
        pp_enabled_layer_names: layers.as_ptr(),
        ..Default::default()
    };

    Ok(entry.create_instance(&create_info, None)?)
}

fn device_name(props: &vk::PhysicalDeviceProperties) -> String {
    props
        .device_name_as_c_str()
        .map(|s| s.to_string_lossy().into_owned())
        .unwrap_or_else(|_| "<unnamed>".to_owned())
}

/// First queue family with graphics support that can present to `surface`.
unsafe fn graphics_present_family(
    instance: &Instance,
    surface_loader: &surface::Instance,
    phys: vk::PhysicalDevice,
    surface: vk::SurfaceKHR,
) -> Option<u32> {
    instance
        .get_physical_device_queue_family_properties(phys)
        .iter()
        .enumerate()
        .find(|(i, q)| {
            q.queue_flags.contains(vk::QueueFlags::GRAPHICS)
                && surface_loader
                    .get_physical_device_surface_support(phys, *i as u32, surface)
                    .unwrap_or(false)
        })
        .map(|(i, _)| i as u32)
}

/// Discrete GPUs win; otherwise the first usable device in enumeration order.
unsafe fn pick_device_and_queue(
    instance: &Instance,
    surface_loader: &surface::Instance,
    surface: vk::SurfaceKHR,
) -> Result<(vk::PhysicalDevice, u32)> {
    let mut fallback = None;
    for phys in instance
        .enumerate_physical_devices()
        .context("enumerate_physical_devices")?
    {
        let Some(family) = graphics_present_family(instance, surface_loader, phys, surface) else {
            continue;
        };
        let props = instance.get_physical_device_properties(phys);
        if props.device_type == vk::PhysicalDeviceType::DISCRETE_GPU {
            info!("vk: picking discrete GPU {}", device_name(&props));
            return Ok((phys, family));
        }
        if fallback.is_none() {
            fallback = Some((phys, family, device_name(&props)));
        }
    }

    match fallback {
        Some((phys, family, name)) => {
            info!("vk: picking fallback GPU {name}");
            Ok((phys, family))
        }
        None => Err(VkrError::NoSuitableDevice.into()),
    }
}

impl RenderContext {
    // STRICT ORDER:
    // 1) instance (window-system extensions + validation in debug)
    // 2) surface from THIS instance
    // 3) physical device + queue family queried AGAINST this surface
    // 4) logical device with VK_KHR_swapchain
    pub unsafe fn new(window: &dyn HasWindowHandle, display: &dyn HasDisplayHandle) -> Result<Self> {
        let dh = display
            .display_handle()
            .map_err(|e| anyhow!("{e}"))?
            .as_raw();
        let wh = window.window_handle().map_err(|e| anyhow!("{e}"))?.as_raw();

        let entry = Entry::linked();
        let instance = create_instance(&entry, dh).context("create_instance")?;
        let debug = create_debug_messenger(&entry, &instance)?;

        let surface_loader = surface::Instance::new(&entry, &instance);
        let surface = ash_window::create_surface(&entry, &instance, dh, wh, None)
            .context("ash_window::create_surface")?;

        let (phys, queue_family) = pick_device_and_queue(&instance, &surface_loader, surface)?;

        let priorities = [1.0_f32];
        let qinfo = vk::DeviceQueueCreateInfo {
            s_type: vk::StructureType::DEVICE_QUEUE_CREATE_INFO,
            queue_family_index: queue_family,
            queue_count: 1,
            p_queue_priorities: priorities.as_ptr(),
            ..Default::default()
        };

        let device_exts = [swapchain::NAME.as_ptr()];
        let dinfo = vk::DeviceCreateInfo {
            s_type: vk::StructureType::DEVICE_CREATE_INFO,
            queue_create_info_count: 1,
            p_queue_create_infos: &qinfo,
            enabled_extension_count: device_exts.len() as u32,
            pp_enabled_extension_names: device_exts.as_ptr(),
            ..Default::default()
        };

        let device = instance
            .create_device(phys, &dinfo, None)
            .context("create_device")?;
        let queue = device.get_device_queue(queue_family, 0);
        let swapchain_loader = swapchain::Device::new(&instance, &device);

        Ok(Self {
            _entry: entry,
            instance,
            debug,
            surface_loader,
            surface,
            phys,
            device,
            queue_family,
            queue,
            swapchain_loader,
        })
    }

    /// The queue family must be able to present to the surface. A boolean
    /// capability query, never assumed.
    pub unsafe fn ensure_present_support(&self) -> VkrResult<()> {
        let supported = self
            .surface_loader
            .get_physical_device_surface_support(self.phys, self.queue_family, self.surface)
            .check("get_physical_device_surface_support")?;
        if supported {
            Ok(())
        } else {
            Err(VkrError::PresentUnsupported {
                family: self.queue_family,
            })
        }
    }

    pub unsafe fn surface_capabilities(&self) -> VkrResult<vk::SurfaceCapabilitiesKHR> {
        self.surface_loader
            .get_physical_device_surface_capabilities(self.phys, self.surface)
            .check("get_physical_device_surface_capabilities")
    }

    pub unsafe fn surface_formats(&self) -> VkrResult<Vec<vk::SurfaceFormatKHR>> {
        self.surface_loader
            .get_physical_device_surface_formats(self.phys, self.surface)
            .check("get_physical_device_surface_formats")
    }

    pub unsafe fn wait_idle(&self) -> VkrResult<()> {
        self.device.device_wait_idle().check("device_wait_idle")
    }
}
