//! The interleaved vertex layout shared by the graphics pipeline, the
//! scene ingestion pass, and the built-in quad.

use bytemuck::{Pod, Zeroable};
use glam::Vec3;
use keel_vk::ash::vk;

/// One vertex as the vertex shader consumes it: 32 bytes, interleaved.
///
/// `basis` holds the tangent-space basis as three packed words (normal,
/// tangent, bitangent in that order), each produced by
/// [`pack_snorm_2_10_10_10`]. The shader unpacks them; the attribute is
/// declared as plain unsigned integers so the exact bit layout survives
/// the trip.
#[repr(C)]
#[derive(Debug, Clone, Copy, PartialEq, Pod, Zeroable)]
pub struct Vertex {
    pub position: [f32; 3],
    pub basis: [u32; 3],
    pub tex_coord: [f32; 2],
}

impl Vertex {
    /// The single vertex buffer binding the pipeline consumes.
    pub fn binding_description() -> vk::VertexInputBindingDescription {
        vk::VertexInputBindingDescription::default()
            .binding(0)
            .stride(std::mem::size_of::<Vertex>() as u32)
            .input_rate(vk::VertexInputRate::VERTEX)
    }

    /// Attribute locations 0..2: position, packed basis, texcoord.
    pub fn attribute_descriptions() -> [vk::VertexInputAttributeDescription; 3] {
        [
            vk::VertexInputAttributeDescription::default()
                .location(0)
                .binding(0)
                .format(vk::Format::R32G32B32_SFLOAT)
                .offset(std::mem::offset_of!(Vertex, position) as u32),
            vk::VertexInputAttributeDescription::default()
                .location(1)
                .binding(0)
                .format(vk::Format::R32G32B32_UINT)
                .offset(std::mem::offset_of!(Vertex, basis) as u32),
            vk::VertexInputAttributeDescription::default()
                .location(2)
                .binding(0)
                .format(vk::Format::R32G32_SFLOAT)
                .offset(std::mem::offset_of!(Vertex, tex_coord) as u32),
        ]
    }
}

/// Pack a unit-range vector into a 2_10_10_10 signed-normalized word.
///
/// `x` lands in the low 10 bits, then `y`, then `z`; the top two bits
/// are left zero. Each component is clamped to `[-1, 1]`, scaled by
/// 511, rounded half away from zero, and stored as the low 10 bits of
/// the two's-complement result, so `-1.0` encodes as `0x201` and `1.0`
/// as `0x1FF`.
pub fn pack_snorm_2_10_10_10(v: Vec3) -> u32 {
    (pack_snorm_10(v.z) << 20) | (pack_snorm_10(v.y) << 10) | pack_snorm_10(v.x)
}

fn pack_snorm_10(v: f32) -> u32 {
    let scaled = (v.clamp(-1.0, 1.0) * 511.0).round();
    (scaled as i32 as u32) & 0x3FF
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn packs_zero_to_zero() {
        assert_eq!(pack_snorm_2_10_10_10(Vec3::ZERO), 0);
    }

    #[test]
    fn saturates_at_both_rails() {
        assert_eq!(pack_snorm_2_10_10_10(Vec3::new(1.0, 0.0, 0.0)), 0x1FF);
        assert_eq!(pack_snorm_2_10_10_10(Vec3::new(7.5, 0.0, 0.0)), 0x1FF);
        assert_eq!(pack_snorm_2_10_10_10(Vec3::new(-1.0, 0.0, 0.0)), 0x201);
        assert_eq!(pack_snorm_2_10_10_10(Vec3::new(-7.5, 0.0, 0.0)), 0x201);
    }

    #[test]
    fn rounds_half_away_from_zero() {
        // 0.5 * 511 = 255.5 rounds up; -0.5 * 511 rounds down.
        assert_eq!(pack_snorm_2_10_10_10(Vec3::new(0.5, 0.0, 0.0)), 256);
        assert_eq!(
            pack_snorm_2_10_10_10(Vec3::new(0.0, -0.5, 0.0)),
            0x300 << 10
        );
    }

    #[test]
    fn components_land_in_their_lanes() {
        let packed = pack_snorm_2_10_10_10(Vec3::new(1.0, 1.0, 1.0));
        assert_eq!(packed, (0x1FF << 20) | (0x1FF << 10) | 0x1FF);
        assert_eq!(packed >> 30, 0);
    }

    #[test]
    fn layout_matches_the_attribute_descriptions() {
        assert_eq!(std::mem::size_of::<Vertex>(), 32);
        assert_eq!(std::mem::offset_of!(Vertex, position), 0);
        assert_eq!(std::mem::offset_of!(Vertex, basis), 12);
        assert_eq!(std::mem::offset_of!(Vertex, tex_coord), 24);
        assert_eq!(Vertex::binding_description().stride, 32);
    }
}
