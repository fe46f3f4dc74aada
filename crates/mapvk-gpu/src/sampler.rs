//! Sampler keys.

use ash::vk;

/// Texture minification and magnification filter.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum TextureFilter {
    Nearest = 0,
    Linear = 1,
}

impl TextureFilter {
    fn from_bits(bits: u32) -> Self {
        if bits == Self::Linear as u32 {
            Self::Linear
        } else {
            Self::Nearest
        }
    }

    fn to_vk(self) -> vk::Filter {
        match self {
            Self::Nearest => vk::Filter::NEAREST,
            Self::Linear => vk::Filter::LINEAR,
        }
    }
}

/// Texture coordinate wrapping.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum TextureWrapping {
    ClampToEdge = 0,
    Repeat = 1,
}

impl TextureWrapping {
    fn from_bits(bits: u32) -> Self {
        if bits == Self::Repeat as u32 {
            Self::Repeat
        } else {
            Self::ClampToEdge
        }
    }

    fn to_vk(self) -> vk::SamplerAddressMode {
        match self {
            Self::ClampToEdge => vk::SamplerAddressMode::CLAMP_TO_EDGE,
            Self::Repeat => vk::SamplerAddressMode::REPEAT,
        }
    }
}

/// Packed sampler description: filter in byte 0, S wrapping in byte 1 and
/// T wrapping in byte 2.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SamplerKey(u32);

impl SamplerKey {
    pub fn new(filter: TextureFilter, wrap_s: TextureWrapping, wrap_t: TextureWrapping) -> Self {
        Self(filter as u32 | (wrap_s as u32) << 8 | (wrap_t as u32) << 16)
    }

    /// The packed value.
    pub fn bits(self) -> u32 {
        self.0
    }

    pub fn filter(self) -> TextureFilter {
        TextureFilter::from_bits(self.0 & 0xFF)
    }

    pub fn wrap_s(self) -> TextureWrapping {
        TextureWrapping::from_bits((self.0 >> 8) & 0xFF)
    }

    pub fn wrap_t(self) -> TextureWrapping {
        TextureWrapping::from_bits((self.0 >> 16) & 0xFF)
    }

    /// Sampler create info for this key.
    pub fn create_info(self) -> vk::SamplerCreateInfo<'static> {
        let filter = self.filter().to_vk();
        vk::SamplerCreateInfo::default()
            .mag_filter(filter)
            .min_filter(filter)
            .mipmap_mode(vk::SamplerMipmapMode::NEAREST)
            .address_mode_u(self.wrap_s().to_vk())
            .address_mode_v(self.wrap_t().to_vk())
            .address_mode_w(self.wrap_s().to_vk())
            .max_anisotropy(1.0)
            .compare_op(vk::CompareOp::ALWAYS)
            .border_color(vk::BorderColor::FLOAT_OPAQUE_WHITE)
    }
}

impl Default for SamplerKey {
    fn default() -> Self {
        Self::new(
            TextureFilter::Linear,
            TextureWrapping::ClampToEdge,
            TextureWrapping::ClampToEdge,
        )
    }
}
