//! Closed table of prompt style presets.

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum StylePreset {
    #[default]
    None,
    Photographic,
    Cinematic,
    Anime,
    DigitalArt,
    OilPainting,
    Watercolor,
    PixelArt,
}

impl StylePreset {
    pub const ALL: [StylePreset; 8] = [
        Self::None,
        Self::Photographic,
        Self::Cinematic,
        Self::Anime,
        Self::DigitalArt,
        Self::OilPainting,
        Self::Watercolor,
        Self::PixelArt,
    ];

    /// Looks a preset up by its kebab-case key.
    pub fn from_key(key: &str) -> Option<Self> {
        serde_plain::from_str(key.trim()).ok()
    }

    /// Like [`StylePreset::from_key`], falling back to `default` for unknown
    /// or missing keys.
    pub fn resolve(key: Option<&str>, default: Self) -> Self {
        key.and_then(Self::from_key).unwrap_or(default)
    }

    pub fn key(self) -> String {
        serde_plain::to_string(&self).unwrap_or_default()
    }

    pub fn modifier(self) -> &'static str {
        match self {
            Self::None => "",
            Self::Photographic => {
                "professional photograph, natural lighting, sharp focus, highly detailed, 8k"
            }
            Self::Cinematic => {
                "cinematic film still, dramatic lighting, shallow depth of field, film grain"
            }
            Self::Anime => "anime artwork, vibrant colors, clean line art, studio anime style",
            Self::DigitalArt => "digital art, concept art, trending on artstation, highly detailed",
            Self::OilPainting => "oil painting, visible brush strokes, rich textures, classical",
            Self::Watercolor => "watercolor painting, soft washes, paper texture, delicate",
            Self::PixelArt => "pixel art, 16-bit, retro game sprite, limited palette",
        }
    }

    /// The prompt the engine actually sees.
    pub fn apply(self, prompt: &str) -> String {
        let prompt = prompt.trim();
        match self.modifier() {
            "" => prompt.to_string(),
            modifier => format!("{prompt}, {modifier}"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unknown_style_falls_back_to_default() {
        assert_eq!(
            StylePreset::resolve(Some("vaporwave"), StylePreset::Cinematic),
            StylePreset::Cinematic
        );
        assert_eq!(StylePreset::resolve(None, StylePreset::None), StylePreset::None);
        assert_eq!(
            StylePreset::resolve(Some("oil-painting"), StylePreset::None),
            StylePreset::OilPainting
        );
    }

    #[test]
    fn keys_round_trip_through_the_table() {
        for preset in StylePreset::ALL {
            assert_eq!(StylePreset::from_key(&preset.key()), Some(preset));
        }
    }

    #[test]
    fn appends_modifier_to_prompt() {
        assert_eq!(StylePreset::None.apply("  a cat "), "a cat");
        let styled = StylePreset::Anime.apply("a cat");
        assert!(styled.starts_with("a cat, anime artwork"));
    }
}
