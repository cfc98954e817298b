use crate::capture::DecodedFrame;
use crate::gallery::CapturedFrame;
use crate::viewer::{CellGeometry, ascii_art};
use chrono::{DateTime, Utc};
use crossterm::event::{KeyCode, KeyEvent, KeyModifiers};
use image::imageops;

#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct FormField {
    pub label: &'static str,
    pub value: String,
    pub required: bool,
}

impl FormField {
    pub fn new(label: &'static str, value: impl Into<String>) -> Self {
        Self {
            label,
            value: value.into(),
            required: false,
        }
    }

    pub fn required(mut self) -> Self {
        self.required = true;
        self
    }
}

#[derive(Debug, PartialEq, Eq)]
pub(crate) enum FormOutcome {
    Editing,
    Cancelled,
    Submitted,
}

/// Small modal form: one or more single-line text fields.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct Form<P> {
    pub title: String,
    pub fields: Vec<FormField>,
    pub focus: usize,
    pub purpose: P,
    pub error: Option<String>,
}

impl<P> Form<P> {
    pub fn new(title: impl Into<String>, purpose: P, fields: Vec<FormField>) -> Self {
        Self {
            title: title.into(),
            fields,
            focus: 0,
            purpose,
            error: None,
        }
    }

    pub fn value(&self, idx: usize) -> &str {
        self.fields.get(idx).map_or("", |field| field.value.trim())
    }

    pub fn handle_key(&mut self, key: KeyEvent) -> FormOutcome {
        match key.code {
            KeyCode::Esc => return FormOutcome::Cancelled,
            KeyCode::Enter => {
                if let Some(missing) = self
                    .fields
                    .iter()
                    .position(|field| field.required && field.value.trim().is_empty())
                {
                    self.error = Some(format!("{} is required", self.fields[missing].label));
                    self.focus = missing;
                    return FormOutcome::Editing;
                }
                return FormOutcome::Submitted;
            }
            KeyCode::Tab | KeyCode::Down => {
                self.focus = (self.focus + 1) % self.fields.len().max(1);
            }
            KeyCode::BackTab | KeyCode::Up => {
                let count = self.fields.len().max(1);
                self.focus = (self.focus + count - 1) % count;
            }
            _ => {
                if let Some(field) = self.fields.get_mut(self.focus) {
                    edit_text_field(&mut field.value, key);
                    self.error = None;
                }
            }
        }
        FormOutcome::Editing
    }
}

pub(crate) fn edit_text_field(target: &mut String, key: KeyEvent) {
    match key.code {
        KeyCode::Backspace => {
            let _ = target.pop();
        }
        KeyCode::Char('u') if key.modifiers.contains(KeyModifiers::CONTROL) => target.clear(),
        KeyCode::Char(c) => {
            if key.modifiers.contains(KeyModifiers::CONTROL)
                || key.modifiers.contains(KeyModifiers::ALT)
            {
                return;
            }
            target.push(c);
        }
        _ => {}
    }
}

/// Keeps both ends of long URLs visible.
pub(crate) fn truncate_middle(value: &str, max_chars: usize) -> String {
    let count = value.chars().count();
    if count <= max_chars || max_chars < 5 {
        return value.to_owned();
    }
    let keep = max_chars - 1;
    let head = keep.div_ceil(2);
    let tail = keep - head;
    let mut out: String = value.chars().take(head).collect();
    out.push('…');
    out.extend(value.chars().skip(count - tail));
    out
}

pub(crate) fn format_age(at: DateTime<Utc>, now: DateTime<Utc>) -> String {
    let secs = (now - at).num_seconds().max(0);
    match secs {
        0..=59 => format!("{secs}s ago"),
        60..=3599 => format!("{}m ago", secs / 60),
        3600..=86_399 => format!("{}h ago", secs / 3600),
        _ => at.format("%Y-%m-%d %H:%M").to_string(),
    }
}

/// OpenWeatherMap icon codes to something a terminal can show.
pub(crate) fn weather_glyph(icon: &str) -> &'static str {
    match icon.get(..2).unwrap_or_default() {
        "01" => "☀",
        "02" | "03" | "04" => "☁",
        "09" | "10" => "☂",
        "11" => "⚡",
        "13" => "❄",
        "50" => "≋",
        _ => "?",
    }
}

pub(crate) fn gauge_bar(value: u8, max: u8, width: usize) -> String {
    let filled = usize::from(value.min(max)) * width / usize::from(max.max(1));
    format!("{}{}", "█".repeat(filled), "░".repeat(width - filled))
}

/// ASCII preview of a stored still, sized to the panel.
pub(crate) fn frame_preview(frame: &CapturedFrame, width: u16, height: u16) -> Option<String> {
    let bytes = frame.jpeg_bytes()?;
    let decoded = DecodedFrame::decode(&bytes, 0).ok()?;
    let gray = imageops::grayscale(decoded.image());
    Some(ascii_art(
        &gray,
        CellGeometry {
            width: usize::from(width.max(2)),
            height: usize::from(height.max(2)),
        },
    ))
}

#[cfg(test)]
mod tests {
    use super::{
        Form, FormField, FormOutcome, format_age, gauge_bar, truncate_middle, weather_glyph,
    };
    use chrono::{Duration, TimeZone, Utc};
    use crossterm::event::{KeyCode, KeyEvent, KeyModifiers};

    fn key(code: KeyCode) -> KeyEvent {
        KeyEvent::new(code, KeyModifiers::NONE)
    }

    fn type_text(form: &mut Form<()>, text: &str) {
        for c in text.chars() {
            assert_eq!(form.handle_key(key(KeyCode::Char(c))), FormOutcome::Editing);
        }
    }

    #[test]
    fn form_requires_fields_before_submit() {
        let mut form = Form::new(
            "New contact",
            (),
            vec![
                FormField::new("Name", "").required(),
                FormField::new("Phone", "").required(),
                FormField::new("Relationship", ""),
            ],
        );
        type_text(&mut form, "Ravi");
        assert_eq!(form.handle_key(key(KeyCode::Enter)), FormOutcome::Editing);
        assert_eq!(form.focus, 1);
        assert!(form.error.as_deref().unwrap().contains("Phone"));

        type_text(&mut form, "+91 1");
        assert_eq!(form.handle_key(key(KeyCode::Enter)), FormOutcome::Submitted);
        assert_eq!(form.value(0), "Ravi");
        assert_eq!(form.value(1), "+91 1");
        assert_eq!(form.value(2), "");
    }

    #[test]
    fn form_backspace_and_cancel() {
        let mut form = Form::new("URL", (), vec![FormField::new("URL", "http://a")]);
        form.handle_key(key(KeyCode::Backspace));
        assert_eq!(form.value(0), "http://");
        form.handle_key(KeyEvent::new(KeyCode::Char('u'), KeyModifiers::CONTROL));
        assert_eq!(form.value(0), "");
        assert_eq!(form.handle_key(key(KeyCode::Esc)), FormOutcome::Cancelled);
    }

    #[test]
    fn truncation_keeps_both_ends() {
        let url = "http://192.168.183.250:5000/object_detection_feed";
        let short = truncate_middle(url, 21);
        assert_eq!(short.chars().count(), 21);
        assert!(short.starts_with("http://192"));
        assert!(short.ends_with("_feed"));
        assert_eq!(truncate_middle("short", 20), "short");
    }

    #[test]
    fn ages_are_humanised() {
        let now = Utc.with_ymd_and_hms(2024, 5, 1, 12, 0, 0).unwrap();
        assert_eq!(format_age(now - Duration::seconds(5), now), "5s ago");
        assert_eq!(format_age(now - Duration::minutes(3), now), "3m ago");
        assert_eq!(format_age(now - Duration::hours(2), now), "2h ago");
        assert_eq!(format_age(now - Duration::days(2), now), "2024-04-29 12:00");
    }

    #[test]
    fn glyphs_and_gauges() {
        assert_eq!(weather_glyph("50d"), "≋");
        assert_eq!(weather_glyph("10n"), "☂");
        assert_eq!(weather_glyph(""), "?");
        assert_eq!(gauge_bar(50, 100, 10), "█████░░░░░");
        assert_eq!(gauge_bar(200, 100, 4), "████");
    }
}
