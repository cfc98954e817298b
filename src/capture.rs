use crate::stream::ConnectionState;
use base64::Engine as _;
use base64::engine::general_purpose::STANDARD as BASE64_ENGINE;
use image::codecs::jpeg::JpegEncoder;
use image::imageops::{self, FilterType};
use image::{ImageFormat, RgbImage};
use thiserror::Error;
use tracing::{debug, warn};

pub const DEFAULT_CAPTURE_WIDTH: u32 = 640;
pub const DEFAULT_CAPTURE_HEIGHT: u32 = 480;
pub const CAPTURE_JPEG_QUALITY: u8 = 95;

const DATA_URL_PREFIX: &str = "data:image/jpeg;base64,";

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum CaptureError {
    #[error("feed is not connected")]
    NotConnected,
    #[error("no frame has been received yet")]
    NoContent,
    #[error("source frame has zero dimensions")]
    ZeroSized,
    #[error("failed drawing frame: {0}")]
    Draw(String),
    #[error("failed encoding JPEG: {0}")]
    Encode(String),
}

/// Something that currently displays pixels and can paint them onto a canvas.
pub trait MediaElement {
    /// Intrinsic size of the current content, when the source reports one.
    fn natural_size(&self) -> Option<(u32, u32)>;

    fn draw_onto(&self, canvas: &mut RgbImage) -> Result<(), CaptureError>;
}

/// Latest decoded frame of an image stream.
#[derive(Debug, Clone)]
pub struct DecodedFrame {
    seq: u64,
    image: RgbImage,
}

impl DecodedFrame {
    pub fn decode(jpeg: &[u8], seq: u64) -> Result<Self, image::ImageError> {
        let image = image::load_from_memory_with_format(jpeg, ImageFormat::Jpeg)?.to_rgb8();
        Ok(Self { seq, image })
    }

    pub fn from_image(image: RgbImage, seq: u64) -> Self {
        Self { seq, image }
    }

    pub fn seq(&self) -> u64 {
        self.seq
    }

    pub fn image(&self) -> &RgbImage {
        &self.image
    }
}

impl MediaElement for DecodedFrame {
    fn natural_size(&self) -> Option<(u32, u32)> {
        let (width, height) = self.image.dimensions();
        (width > 0 && height > 0).then_some((width, height))
    }

    fn draw_onto(&self, canvas: &mut RgbImage) -> Result<(), CaptureError> {
        let (src_w, src_h) = self.image.dimensions();
        if src_w == 0 || src_h == 0 {
            return Err(CaptureError::ZeroSized);
        }
        let (dst_w, dst_h) = canvas.dimensions();
        if (src_w, src_h) == (dst_w, dst_h) {
            canvas.copy_from_slice(self.image.as_raw());
            return Ok(());
        }
        let scaled = imageops::resize(&self.image, dst_w, dst_h, FilterType::Triangle);
        imageops::replace(canvas, &scaled, 0, 0);
        Ok(())
    }
}

/// A playing video element whose pixels are never decoded. It has no intrinsic
/// size, so a capture falls back to the default canvas and stays blank.
#[derive(Debug, Clone, Copy, Default)]
pub struct UndecodedVideo;

impl MediaElement for UndecodedVideo {
    fn natural_size(&self) -> Option<(u32, u32)> {
        None
    }

    fn draw_onto(&self, _canvas: &mut RgbImage) -> Result<(), CaptureError> {
        Ok(())
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct EncodedImage {
    pub width: u32,
    pub height: u32,
    pub jpeg: Vec<u8>,
}

impl EncodedImage {
    pub fn empty() -> Self {
        Self::default()
    }

    pub fn is_empty(&self) -> bool {
        self.jpeg.is_empty()
    }

    pub fn to_data_url(&self) -> String {
        if self.jpeg.is_empty() {
            return String::new();
        }
        let mut out = String::with_capacity(DATA_URL_PREFIX.len() + self.jpeg.len() * 4 / 3 + 4);
        out.push_str(DATA_URL_PREFIX);
        BASE64_ENGINE.encode_string(&self.jpeg, &mut out);
        out
    }
}

pub fn decode_data_url(data_url: &str) -> Option<Vec<u8>> {
    let payload = data_url.strip_prefix(DATA_URL_PREFIX)?;
    BASE64_ENGINE.decode(payload).ok()
}

/// Snapshots whatever `element` shows right now. Every failure is logged
/// and reported as an empty image.
pub fn capture(state: &ConnectionState, element: Option<&dyn MediaElement>) -> EncodedImage {
    match try_capture(state, element) {
        Ok(encoded) => {
            debug!(
                width = encoded.width,
                height = encoded.height,
                bytes = encoded.jpeg.len(),
                "captured frame"
            );
            encoded
        }
        Err(err) => {
            warn!("frame capture skipped: {err}");
            EncodedImage::empty()
        }
    }
}

pub fn try_capture(
    state: &ConnectionState,
    element: Option<&dyn MediaElement>,
) -> Result<EncodedImage, CaptureError> {
    if !state.is_connected() {
        return Err(CaptureError::NotConnected);
    }
    let element = element.ok_or(CaptureError::NoContent)?;

    let (width, height) = element
        .natural_size()
        .filter(|(width, height)| *width > 0 && *height > 0)
        .unwrap_or((DEFAULT_CAPTURE_WIDTH, DEFAULT_CAPTURE_HEIGHT));

    let mut canvas = RgbImage::new(width, height);
    element.draw_onto(&mut canvas)?;
    let jpeg = encode_jpeg(&canvas, CAPTURE_JPEG_QUALITY)?;

    Ok(EncodedImage {
        width,
        height,
        jpeg,
    })
}

pub fn encode_jpeg(canvas: &RgbImage, quality: u8) -> Result<Vec<u8>, CaptureError> {
    let mut jpeg = Vec::new();
    let mut encoder = JpegEncoder::new_with_quality(&mut jpeg, quality);
    encoder
        .encode_image(canvas)
        .map_err(|err| CaptureError::Encode(err.to_string()))?;
    Ok(jpeg)
}
