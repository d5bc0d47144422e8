// SPDX-License-Identifier: CEPL-1.0
use ash::vk;
use tracing::info;

use crate::context::RenderContext;
use crate::error::{VkrError, VkrResult};

/// Returned when the surface reports the single "any format" sentinel.
pub const DEFAULT_SURFACE_FORMAT: vk::SurfaceFormatKHR = vk::SurfaceFormatKHR {
    format: vk::Format::R8G8B8A8_UNORM,
    color_space: vk::ColorSpaceKHR::SRGB_NONLINEAR,
};

fn is_rgba8(format: vk::Format) -> bool {
    format == vk::Format::R8G8B8A8_UNORM || format == vk::Format::B8G8R8A8_UNORM
}

/// Pick the presentation format from what the surface reports, in
/// enumeration order. No fallback to an unverified format.
pub fn negotiate(formats: &[vk::SurfaceFormatKHR]) -> VkrResult<vk::SurfaceFormatKHR> {
    if let [only] = formats {
        if only.format == vk::Format::UNDEFINED {
            return Ok(DEFAULT_SURFACE_FORMAT);
        }
    }

    formats
        .iter()
        .copied()
        .find(|f| is_rgba8(f.format))
        .ok_or_else(|| VkrError::UnsupportedSurfaceFormat(formats.iter().map(|f| f.format).collect()))
}

/// Query the surface and negotiate against it.
pub unsafe fn query(ctx: &RenderContext) -> VkrResult<vk::SurfaceFormatKHR> {
    let formats = ctx.surface_formats()?;
    let chosen = negotiate(&formats)?;
    info!(
        "vk: surface format {:?} / {:?} ({} offered)",
        chosen.format,
        chosen.color_space,
        formats.len()
    );
    Ok(chosen)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sf(format: vk::Format, color_space: vk::ColorSpaceKHR) -> vk::SurfaceFormatKHR {
        vk::SurfaceFormatKHR {
            format,
            color_space,
        }
    }

    #[test]
    fn any_format_sentinel_yields_default() {
        let got = negotiate(&[sf(
            vk::Format::UNDEFINED,
            vk::ColorSpaceKHR::SRGB_NONLINEAR,
        )])
        .unwrap();
        assert_eq!(got.format, vk::Format::R8G8B8A8_UNORM);
        assert_eq!(got.color_space, vk::ColorSpaceKHR::SRGB_NONLINEAR);
    }

    #[test]
    fn first_rgba8_in_enumeration_order_wins() {
        let offered = [
            sf(
                vk::Format::A2B10G10R10_UNORM_PACK32,
                vk::ColorSpaceKHR::SRGB_NONLINEAR,
            ),
            sf(
                vk::Format::B8G8R8A8_UNORM,
                vk::ColorSpaceKHR::SRGB_NONLINEAR,
            ),
            sf(
                vk::Format::R8G8B8A8_UNORM,
                vk::ColorSpaceKHR::SRGB_NONLINEAR,
            ),
        ];
        let got = negotiate(&offered).unwrap();
        assert_eq!(got.format, vk::Format::B8G8R8A8_UNORM);
    }

    #[test]
    fn choice_is_always_from_the_reported_list() {
        let lists: [&[vk::SurfaceFormatKHR]; 3] = [
            &[sf(vk::Format::R8G8B8A8_UNORM, vk::ColorSpaceKHR::SRGB_NONLINEAR)],
            &[
                sf(vk::Format::B8G8R8A8_SRGB, vk::ColorSpaceKHR::SRGB_NONLINEAR),
                sf(
                    vk::Format::R8G8B8A8_UNORM,
                    vk::ColorSpaceKHR::DISPLAY_P3_NONLINEAR_EXT,
                ),
            ],
            &[
                sf(vk::Format::UNDEFINED, vk::ColorSpaceKHR::SRGB_NONLINEAR),
                sf(vk::Format::B8G8R8A8_UNORM, vk::ColorSpaceKHR::SRGB_NONLINEAR),
            ],
        ];
        for list in lists {
            let got = negotiate(list).unwrap();
            assert!(
                list.iter()
                    .any(|f| f.format == got.format && f.color_space == got.color_space),
                "{got:?} not in {list:?}"
            );
        }
    }

    #[test]
    fn no_rgba8_format_is_fatal() {
        let offered = [sf(
            vk::Format::R16G16B16A16_SFLOAT,
            vk::ColorSpaceKHR::EXTENDED_SRGB_LINEAR_EXT,
        )];
        match negotiate(&offered) {
            Err(VkrError::UnsupportedSurfaceFormat(seen)) => {
                assert_eq!(seen, vec![vk::Format::R16G16B16A16_SFLOAT])
            }
            other => panic!("expected UnsupportedSurfaceFormat, got {other:?}"),
        }
    }

    #[test]
    fn empty_list_is_fatal() {
        assert!(negotiate(&[]).is_err());
    }
}
