use crate::activity::LogLevel;
use crate::storage::{self, KEY_THEME, Store};
use crate::stream::ConnectionState;
use anyhow::{Result, bail};
use ratatui::style::Color;
use serde::{Deserialize, Serialize};

/// Console colours, one slot per role.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ThemePalette {
    pub text: Color,
    pub muted: Color,
    pub border: Color,
    pub border_active: Color,
    pub accent: Color,
    pub success: Color,
    pub warning: Color,
    pub error: Color,
    pub emergency: Color,
}

impl Default for ThemePalette {
    fn default() -> Self {
        // Same values `ThemeFile::default` writes out.
        Self {
            text: Color::Rgb(0xEE, 0xF1, 0xF5),
            muted: Color::Rgb(0x8A, 0x93, 0xA3),
            border: Color::Rgb(0x4B, 0x55, 0x63),
            border_active: Color::Rgb(0xF4, 0xA2, 0x61),
            accent: Color::Rgb(0x4C, 0xC9, 0xF0),
            success: Color::Rgb(0x52, 0xB7, 0x88),
            warning: Color::Rgb(0xF9, 0xC7, 0x4F),
            error: Color::Rgb(0xEF, 0x47, 0x6F),
            emergency: Color::Rgb(0xD6, 0x28, 0x28),
        }
    }
}

impl ThemePalette {
    pub fn for_state(&self, state: &ConnectionState) -> Color {
        match state {
            ConnectionState::Idle => self.muted,
            ConnectionState::Connecting => self.warning,
            ConnectionState::Connected => self.success,
            ConnectionState::Failed(_) => self.error,
        }
    }

    pub fn for_level(&self, level: LogLevel) -> Color {
        match level {
            LogLevel::Info => self.accent,
            LogLevel::Warning => self.warning,
            LogLevel::Error => self.error,
            LogLevel::Success => self.success,
        }
    }

    fn resolve(file: &ThemeFile) -> Result<Self> {
        let slot = |name: &str, raw: &str| {
            rgb_from_hex(raw).map_err(|err| err.context(format!("theme colour '{name}'")))
        };
        Ok(Self {
            text: slot("text", &file.text)?,
            muted: slot("muted", &file.muted)?,
            border: slot("border", &file.border)?,
            border_active: slot("border_active", &file.border_active)?,
            accent: slot("accent", &file.accent)?,
            success: slot("success", &file.success)?,
            warning: slot("warning", &file.warning)?,
            error: slot("error", &file.error)?,
            emergency: slot("emergency", &file.emergency)?,
        })
    }
}

/// On-disk form: `#RRGGBB` strings, any slot may be omitted.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
struct ThemeFile {
    text: String,
    muted: String,
    border: String,
    border_active: String,
    accent: String,
    success: String,
    warning: String,
    error: String,
    emergency: String,
}

impl Default for ThemeFile {
    fn default() -> Self {
        let palette = ThemePalette::default();
        Self {
            text: hex_from_rgb(palette.text),
            muted: hex_from_rgb(palette.muted),
            border: hex_from_rgb(palette.border),
            border_active: hex_from_rgb(palette.border_active),
            accent: hex_from_rgb(palette.accent),
            success: hex_from_rgb(palette.success),
            warning: hex_from_rgb(palette.warning),
            error: hex_from_rgb(palette.error),
            emergency: hex_from_rgb(palette.emergency),
        }
    }
}

/// Loads the palette from the `theme` store entry, seeding it with the
/// defaults on first run.
pub fn load_or_create_theme(store: &dyn Store) -> Result<ThemePalette> {
    match storage::load::<ThemeFile>(store, KEY_THEME)? {
        Some(file) => ThemePalette::resolve(&file),
        None => {
            storage::save(store, KEY_THEME, &ThemeFile::default())?;
            Ok(ThemePalette::default())
        }
    }
}

fn rgb_from_hex(raw: &str) -> Result<Color> {
    let digits = raw.trim().trim_start_matches('#');
    if digits.len() != 6 || !digits.bytes().all(|b| b.is_ascii_hexdigit()) {
        bail!("expected #RRGGBB, got '{raw}'");
    }
    let Ok(packed) = u32::from_str_radix(digits, 16) else {
        bail!("'{raw}' is not hexadecimal");
    };
    let [_, r, g, b] = packed.to_be_bytes();
    Ok(Color::Rgb(r, g, b))
}

fn hex_from_rgb(color: Color) -> String {
    match color {
        Color::Rgb(r, g, b) => format!("#{r:02X}{g:02X}{b:02X}"),
        _ => "#FFFFFF".to_owned(),
    }
}
