//! # Payload Validation and Repair
//!
//! Integrity and format checks for binary image payloads returned by (or
//! sent to) generation backends, best-effort re-encoding when the checks
//! fail, and the decode step that turns a backend response into a
//! validated payload.

use std::fmt;
use std::io::Cursor;
use std::path::Path;

use base64::engine::general_purpose::STANDARD;
use base64::Engine as _;
use image::{ColorType, DynamicImage, ImageOutputFormat};
use serde::Serialize;
use tracing::{debug, warn};

use crate::result::OperationResult;
use crate::sanitization::{sanitize_raw, truncate, MESSAGE_ECHO_LIMIT};
use crate::types::{FaultCategory, FaultInfo, FaultSeverity};

/// Detection needs at least this many leading bytes
pub const SIGNATURE_LEN: usize = 8;

/// Default lower bound for a plausible image payload
pub const DEFAULT_MIN_SIZE: usize = 100;

/// Default upper bound (50 MiB)
pub const DEFAULT_MAX_SIZE: usize = 50 * 1024 * 1024;

/// Default upper bound for payloads submitted to an API (20 MiB)
pub const DEFAULT_UPLOAD_MAX_SIZE: usize = 20 * 1024 * 1024;

const JPEG_QUALITY: u8 = 95;

/// Image formats recognised by signature
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ImageFormat {
    Png,
    Jpeg,
    Gif,
    Webp,
    Bmp,
}

impl ImageFormat {
    pub fn as_str(&self) -> &'static str {
        match self {
            ImageFormat::Png => "png",
            ImageFormat::Jpeg => "jpeg",
            ImageFormat::Gif => "gif",
            ImageFormat::Webp => "webp",
            ImageFormat::Bmp => "bmp",
        }
    }

    pub fn media_type(&self) -> &'static str {
        match self {
            ImageFormat::Png => "image/png",
            ImageFormat::Jpeg => "image/jpeg",
            ImageFormat::Gif => "image/gif",
            ImageFormat::Webp => "image/webp",
            ImageFormat::Bmp => "image/bmp",
        }
    }

    /// Parses a short format name such as `png` or `jpg`
    pub fn from_name(name: &str) -> Option<Self> {
        match name.trim().to_lowercase().as_str() {
            "png" => Some(ImageFormat::Png),
            "jpeg" | "jpg" => Some(ImageFormat::Jpeg),
            "gif" => Some(ImageFormat::Gif),
            "webp" => Some(ImageFormat::Webp),
            "bmp" => Some(ImageFormat::Bmp),
            _ => None,
        }
    }

    /// Maps a declared media type to the format it implies
    pub fn from_media_type(media_type: &str) -> Option<Self> {
        match media_type.trim().to_lowercase().as_str() {
            "image/png" => Some(ImageFormat::Png),
            "image/jpeg" | "image/jpg" => Some(ImageFormat::Jpeg),
            "image/gif" => Some(ImageFormat::Gif),
            "image/webp" => Some(ImageFormat::Webp),
            "image/bmp" => Some(ImageFormat::Bmp),
            _ => None,
        }
    }

    /// Whether the format can store an alpha channel
    pub fn supports_alpha(&self) -> bool {
        !matches!(self, ImageFormat::Jpeg)
    }
}

impl fmt::Display for ImageFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Media type for a format name, `application/octet-stream` if unknown
pub fn format_to_media_type(name: &str) -> &'static str {
    ImageFormat::from_name(name)
        .map(|format| format.media_type())
        .unwrap_or("application/octet-stream")
}

struct Signature {
    format: ImageFormat,
    // (offset, bytes) pairs that must all match
    parts: &'static [(usize, &'static [u8])],
}

static SIGNATURES: &[Signature] = &[
    Signature {
        format: ImageFormat::Png,
        parts: &[(0, b"\x89PNG\r\n\x1a\n")],
    },
    Signature {
        format: ImageFormat::Jpeg,
        parts: &[(0, b"\xff\xd8\xff")],
    },
    Signature {
        format: ImageFormat::Gif,
        parts: &[(0, b"GIF87a")],
    },
    Signature {
        format: ImageFormat::Gif,
        parts: &[(0, b"GIF89a")],
    },
    Signature {
        format: ImageFormat::Webp,
        parts: &[(0, b"RIFF"), (8, b"WEBP")],
    },
    Signature {
        format: ImageFormat::Bmp,
        parts: &[(0, b"BM")],
    },
];

/// Detects the image format from leading magic bytes
pub fn detect_format(data: &[u8]) -> Option<ImageFormat> {
    if data.len() < SIGNATURE_LEN {
        return None;
    }

    SIGNATURES
        .iter()
        .find(|signature| {
            signature
                .parts
                .iter()
                .all(|(offset, magic)| data.get(*offset..offset + magic.len()) == Some(*magic))
        })
        .map(|signature| signature.format)
}

/// Size bounds applied by [`validate`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ValidationLimits {
    pub min_size: usize,
    pub max_size: usize,
}

impl Default for ValidationLimits {
    fn default() -> Self {
        Self {
            min_size: DEFAULT_MIN_SIZE,
            max_size: DEFAULT_MAX_SIZE,
        }
    }
}

/// A payload that passed validation
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ValidatedPayload {
    pub bytes: Vec<u8>,
    pub detected_format: ImageFormat,
    pub media_type: &'static str,
    pub size: usize,
}

fn payload_fault<S: Into<String>>(category: FaultCategory, message: S) -> FaultInfo {
    FaultInfo::new(category, FaultSeverity::Fatal, message)
}

fn hex_prefix(data: &[u8], len: usize) -> String {
    data.iter().take(len).map(|b| format!("{:02x}", b)).collect()
}

/// Validates an image payload.
///
/// A format that disagrees with `expected_media_type` is reported as a
/// warning only; the caller decides whether to [`repair`].
pub fn validate(
    data: Vec<u8>,
    expected_media_type: Option<&str>,
    limits: ValidationLimits,
) -> OperationResult<ValidatedPayload> {
    let size = data.len();

    if data.is_empty() {
        return OperationResult::fail(payload_fault(FaultCategory::ImageCorrupt, "Image data is empty"));
    }

    if size < limits.min_size {
        return OperationResult::fail(
            payload_fault(FaultCategory::ImageCorrupt, format!("Image data too small ({} bytes)", size))
                .detail("size", size)
                .detail("min_size", limits.min_size),
        );
    }

    if size > limits.max_size {
        return OperationResult::fail(
            payload_fault(FaultCategory::Validation, format!("Image data too large ({} bytes)", size))
                .detail("size", size)
                .detail("max_size", limits.max_size),
        );
    }

    let detected = match detect_format(&data) {
        Some(format) => format,
        None => {
            return OperationResult::fail(
                payload_fault(
                    FaultCategory::ImageCorrupt,
                    "Could not detect image format - data may be corrupt",
                )
                .detail("first_bytes", hex_prefix(&data, 20)),
            );
        }
    };

    let mut warnings = Vec::new();
    if let Some(expected) = expected_media_type.and_then(ImageFormat::from_media_type) {
        if expected != detected {
            warnings.push(format!(
                "Format mismatch: expected {}, detected {}",
                expected, detected
            ));
        }
    }

    OperationResult::ok(ValidatedPayload {
        bytes: data,
        detected_format: detected,
        media_type: detected.media_type(),
        size,
    })
    .with_warnings(warnings)
    .with_metadata("detected_format", detected.as_str())
}

/// Drops color information the target encoder cannot store
fn fit_color(image: DynamicImage, target: ImageFormat) -> DynamicImage {
    let color = image.color();
    match target {
        ImageFormat::Jpeg => match color {
            ColorType::Rgb8 | ColorType::L8 => image,
            _ => DynamicImage::ImageRgb8(image.to_rgb8()),
        },
        ImageFormat::Bmp => match color {
            ColorType::Rgb8 | ColorType::Rgba8 | ColorType::L8 | ColorType::La8 => image,
            c if c.has_alpha() => DynamicImage::ImageRgba8(image.to_rgba8()),
            _ => DynamicImage::ImageRgb8(image.to_rgb8()),
        },
        ImageFormat::Gif => match color {
            ColorType::Rgba8 => image,
            _ => DynamicImage::ImageRgba8(image.to_rgba8()),
        },
        ImageFormat::Png | ImageFormat::Webp => image,
    }
}

fn output_format(target: ImageFormat) -> Option<ImageOutputFormat> {
    match target {
        ImageFormat::Png => Some(ImageOutputFormat::Png),
        ImageFormat::Jpeg => Some(ImageOutputFormat::Jpeg(JPEG_QUALITY)),
        ImageFormat::Gif => Some(ImageOutputFormat::Gif),
        ImageFormat::Bmp => Some(ImageOutputFormat::Bmp),
        ImageFormat::Webp => None,
    }
}

/// Decodes the payload and re-encodes it as `target`.
///
/// Stateless; callers attempt this at most once per payload. WebP is
/// decode-only: a [`ImageFormat::Webp`] target always fails with a fatal
/// `Validation` fault.
pub fn repair(data: &[u8], target: ImageFormat) -> OperationResult<Vec<u8>> {
    let output = match output_format(target) {
        Some(output) => output,
        None => {
            return OperationResult::fail(
                payload_fault(
                    FaultCategory::Validation,
                    format!("Re-encoding to {} is not supported", target),
                )
                .detail("target_format", target.as_str()),
            );
        }
    };

    let decoded = match image::load_from_memory(data) {
        Ok(decoded) => decoded,
        Err(err) => {
            debug!(error = %err, size = data.len(), "Payload could not be decoded for repair");
            return OperationResult::fail(
                payload_fault(FaultCategory::ImageCorrupt, format!("Could not load image: {}", err)).source(err),
            );
        }
    };

    let prepared = fit_color(decoded, target);
    let mut buffer = Cursor::new(Vec::new());
    if let Err(err) = prepared.write_to(&mut buffer, output) {
        return OperationResult::fail(
            payload_fault(FaultCategory::ImageCorrupt, format!("Failed to fix image: {}", err)).source(err),
        );
    }

    let repaired = buffer.into_inner();
    debug!(
        original_size = data.len(),
        repaired_size = repaired.len(),
        target = %target,
        "Payload re-encoded"
    );

    OperationResult::ok(repaired)
        .with_metadata("original_format", detect_format(data).map(|f| f.as_str()))
        .with_metadata("original_size", data.len())
        .with_metadata("was_converted", true)
}

/// Options for [`prepare_for_upload`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct UploadOptions {
    pub target_format: ImageFormat,
    pub max_size: usize,
    pub auto_fix: bool,
}

impl Default for UploadOptions {
    fn default() -> Self {
        Self {
            target_format: ImageFormat::Png,
            max_size: DEFAULT_UPLOAD_MAX_SIZE,
            auto_fix: true,
        }
    }
}

/// A payload ready to embed in an API request
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct EncodedPayload {
    pub base64: String,
    pub media_type: &'static str,
    pub size: usize,
    pub format: ImageFormat,
}

/// Validates, optionally repairs, and base64-encodes a payload for
/// submission to a backend.
pub fn prepare_for_upload(data: Vec<u8>, options: UploadOptions) -> OperationResult<EncodedPayload> {
    let limits = ValidationLimits {
        max_size: options.max_size,
        ..ValidationLimits::default()
    };

    let mut repaired = false;
    let mut validation = validate(data.clone(), None, limits);

    if let Some(fault) = validation.error() {
        if !options.auto_fix {
            return OperationResult::fail(fault.clone());
        }
        match repair(&data, options.target_format).into_result() {
            Ok(fixed) => {
                repaired = true;
                validation = validate(fixed, None, ValidationLimits::default());
            }
            Err(fault) => return OperationResult::fail(fault),
        }
    }

    let warnings = validation.warnings().to_vec();
    let mut payload = match validation.into_result() {
        Ok(payload) => payload,
        Err(fault) => return OperationResult::fail(fault).with_warnings(warnings),
    };

    if options.auto_fix && !repaired && payload.detected_format != options.target_format {
        match repair(&payload.bytes, options.target_format).into_result() {
            Ok(fixed) => {
                payload.size = fixed.len();
                payload.bytes = fixed;
                payload.detected_format = options.target_format;
                payload.media_type = options.target_format.media_type();
            }
            Err(fault) => {
                warn!(error = %fault, "Could not convert payload to target format, sending as-is");
            }
        }
    }

    OperationResult::ok(EncodedPayload {
        base64: STANDARD.encode(&payload.bytes),
        media_type: payload.media_type,
        size: payload.size,
        format: payload.detected_format,
    })
    .with_warnings(warnings)
    .with_metadata("repaired", repaired)
}

/// Reads a payload from disk and prepares it for upload
pub fn prepare_file_for_upload(path: &Path, options: UploadOptions) -> OperationResult<EncodedPayload> {
    if !path.exists() {
        return OperationResult::fail(
            payload_fault(FaultCategory::Validation, format!("Image file not found: {}", path.display()))
                .detail("path", path.display().to_string()),
        );
    }

    match std::fs::read(path) {
        Ok(data) => prepare_for_upload(data, options),
        Err(err) => OperationResult::fail(
            payload_fault(FaultCategory::Validation, format!("Could not read image file: {}", err)).source(err),
        ),
    }
}

/// Inline image bytes as a backend delivers them
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum InlineData {
    Bytes(Vec<u8>),
    Base64(String),
}

impl InlineData {
    fn into_bytes(self) -> Vec<u8> {
        match self {
            InlineData::Bytes(bytes) => bytes,
            InlineData::Base64(text) => match STANDARD.decode(text.trim()) {
                Ok(bytes) => bytes,
                Err(_) => text.into_bytes(),
            },
        }
    }
}

/// Media type assumed for image parts that declare none
pub const DEFAULT_PART_MEDIA_TYPE: &str = "image/png";

/// One part of a decoded backend response
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ResponsePart {
    Image {
        data: InlineData,
        /// Declared type; [`DEFAULT_PART_MEDIA_TYPE`] when absent
        media_type: Option<String>,
    },
    Text(String),
    Empty,
}

impl ResponsePart {
    fn kind(&self) -> &'static str {
        match self {
            ResponsePart::Image { .. } => "image",
            ResponsePart::Text(_) => "text",
            ResponsePart::Empty => "empty",
        }
    }
}

/// Turns backend response parts into a validated payload.
///
/// Parts are tried in order. An image part that fails validation is
/// repaired to PNG once. A text part that reads like an error message fails
/// the attempt as retryable.
pub fn decode_response(parts: Vec<ResponsePart>) -> OperationResult<ValidatedPayload> {
    let parts_info: Vec<serde_json::Value> = parts
        .iter()
        .enumerate()
        .map(|(index, part)| serde_json::json!({ "index": index, "type": part.kind() }))
        .collect();
    let mut warnings = Vec::new();

    for (index, part) in parts.into_iter().enumerate() {
        match part {
            ResponsePart::Image { data, media_type } => {
                let raw = data.into_bytes();
                let declared = media_type.as_deref().unwrap_or(DEFAULT_PART_MEDIA_TYPE);
                let validation = validate(raw.clone(), Some(declared), ValidationLimits::default());

                if validation.is_success() {
                    if let Err(err) = image::load_from_memory(&raw) {
                        warnings.push(format!("Part {} passed validation but failed to decode: {}", index, err));
                        continue;
                    }
                    return validation
                        .with_warnings(warnings)
                        .with_metadata("source", "inline_data")
                        .with_metadata("part_index", index);
                }

                debug!(part_index = index, "Image part failed validation, attempting repair");
                match repair(&raw, ImageFormat::Png).into_result() {
                    Ok(fixed) => {
                        let revalidated = validate(fixed, None, ValidationLimits { min_size: 1, ..ValidationLimits::default() });
                        if revalidated.is_success() {
                            return revalidated
                                .with_warnings(warnings)
                                .with_warning("Image was auto-fixed from corrupt data")
                                .with_metadata("source", "fixed_inline_data")
                                .with_metadata("part_index", index);
                        }
                    }
                    Err(fault) => {
                        warnings.push(format!("Part {} could not be repaired: {}", index, fault.message()));
                    }
                }
            }
            ResponsePart::Text(text) => {
                let lowered = text.to_lowercase();
                if lowered.contains("error") || lowered.contains("cannot") || lowered.contains("unable") {
                    let fault = FaultInfo::new(
                        FaultCategory::RemoteApi,
                        FaultSeverity::Recoverable,
                        format!(
                            "API returned text instead of image: {}",
                            truncate(&sanitize_raw(&text), MESSAGE_ECHO_LIMIT)
                        ),
                    )
                    .retry_after(std::time::Duration::from_secs(2))
                    .detail("text_response", sanitize_raw(&text));
                    return OperationResult::fail(fault).with_warnings(warnings);
                }
            }
            ResponsePart::Empty => {}
        }
    }

    let fault = FaultInfo::new(
        FaultCategory::RemoteApi,
        FaultSeverity::Recoverable,
        "No valid image found in response",
    )
    .retry_after(std::time::Duration::from_secs(3))
    .detail("parts_info", parts_info);

    OperationResult::fail(fault).with_warnings(warnings)
}
