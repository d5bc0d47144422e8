// SPDX-License-Identifier: CEPL-1.0
use ash::prelude::VkResult;
use ash::vk;
use thiserror::Error;

use crate::frame::FrameState;

/// Configuration and programmer errors. None of these are recoverable: they
/// mean the device/surface pair cannot be driven as configured.
#[derive(Debug, Error)]
pub enum VkrError {
    #[error("surface offers no 8-bit RGBA/BGRA format (reported: {0:?})")]
    UnsupportedSurfaceFormat(Vec<vk::Format>),

    #[error("queue family {family} cannot present to this surface")]
    PresentUnsupported { family: u32 },

    #[error("no Vulkan device has a graphics queue that can present to this surface")]
    NoSuitableDevice,

    #[error("{call} failed: {result}")]
    Vk {
        call: &'static str,
        #[source]
        result: vk::Result,
    },

    #[error("invalid SPIR-V blob")]
    InvalidSpirv(#[source] std::io::Error),

    #[error("frame command sequence rejected: {0}")]
    BrokenFrame(&'static str),

    #[error("frame executor cannot {event} while {state:?}")]
    FrameState {
        state: FrameState,
        event: &'static str,
    },
}

pub type VkrResult<T> = std::result::Result<T, VkrError>;

pub trait VkResultExt<T> {
    /// Name the failing call so fatal diagnostics say what broke.
    fn check(self, call: &'static str) -> VkrResult<T>;
}

impl<T> VkResultExt<T> for VkResult<T> {
    fn check(self, call: &'static str) -> VkrResult<T> {
        self.map_err(|result| VkrError::Vk { call, result })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn check_names_the_call() {
        let r: VkResult<()> = Err(vk::Result::ERROR_DEVICE_LOST);
        let err = r.check("queue_submit").unwrap_err();
        let msg = err.to_string();
        assert!(msg.starts_with("queue_submit failed"), "{msg}");
        assert!(matches!(
            err,
            VkrError::Vk {
                result: vk::Result::ERROR_DEVICE_LOST,
                ..
            }
        ));
    }
}
