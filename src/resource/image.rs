//! Image backend: header probing and target-size math.
//!
//! Dimensions are read straight from the PNG, GIF, JPEG and WebP headers.
//! Actual resampling is delegated to an optional [`Rasterizer`]; without one,
//! only transforms that leave the pixels untouched succeed.

use std::collections::BTreeMap;
use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::error::ResourceError;

use super::{Fit, ProcessedResourceData, ResourceBackend, ResourceDescriptor, ResourceKind, ResourceResult};

const PNG_SIGNATURE: &[u8] = b"\x89PNG\r\n\x1a\n";
const DEFAULT_QUALITY: u8 = 85;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ImageFormat {
    Png,
    Gif,
    Jpeg,
    WebP,
}

impl ImageFormat {
    pub fn as_str(self) -> &'static str {
        match self {
            ImageFormat::Png => "png",
            ImageFormat::Gif => "gif",
            ImageFormat::Jpeg => "jpeg",
            ImageFormat::WebP => "webp",
        }
    }

    /// Accepts the usual spellings, including `jpg`.
    pub fn parse(name: &str) -> Option<Self> {
        match name.to_ascii_lowercase().as_str() {
            "png" => Some(ImageFormat::Png),
            "gif" => Some(ImageFormat::Gif),
            "jpg" | "jpeg" => Some(ImageFormat::Jpeg),
            "webp" => Some(ImageFormat::WebP),
            _ => None,
        }
    }
}

/// What the header says about an image.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ImageInfo {
    pub format: ImageFormat,
    pub width: u32,
    pub height: u32,
}

/// Resamples and re-encodes pixels. Implemented outside this crate.
pub trait Rasterizer: Send + Sync {
    fn name(&self) -> &str;

    fn resample(
        &self,
        bytes: &[u8],
        source: &ImageInfo,
        target: (u32, u32),
        fit: Fit,
        format: ImageFormat,
        quality: u8,
    ) -> Result<Vec<u8>, String>;
}

fn be16(b: &[u8], at: usize) -> Option<u32> {
    Some(u32::from(u16::from_be_bytes([*b.get(at)?, *b.get(at + 1)?])))
}

fn le16(b: &[u8], at: usize) -> Option<u32> {
    Some(u32::from(u16::from_le_bytes([*b.get(at)?, *b.get(at + 1)?])))
}

fn le24(b: &[u8], at: usize) -> Option<u32> {
    Some(u32::from_le_bytes([*b.get(at)?, *b.get(at + 1)?, *b.get(at + 2)?, 0]))
}

fn be32(b: &[u8], at: usize) -> Option<u32> {
    Some(u32::from_be_bytes(b.get(at..at + 4)?.try_into().ok()?))
}

/// Read format and dimensions from the image header.
pub fn probe(bytes: &[u8]) -> Option<ImageInfo> {
    if bytes.starts_with(PNG_SIGNATURE) {
        // IHDR is always the first chunk.
        if bytes.get(12..16)? != b"IHDR" {
            return None;
        }
        return Some(ImageInfo {
            format: ImageFormat::Png,
            width: be32(bytes, 16)?,
            height: be32(bytes, 20)?,
        });
    }
    if bytes.starts_with(b"GIF87a") || bytes.starts_with(b"GIF89a") {
        return Some(ImageInfo {
            format: ImageFormat::Gif,
            width: le16(bytes, 6)?,
            height: le16(bytes, 8)?,
        });
    }
    if bytes.starts_with(&[0xFF, 0xD8]) {
        return probe_jpeg(bytes);
    }
    if bytes.starts_with(b"RIFF") && bytes.get(8..12)? == b"WEBP" {
        return probe_webp(bytes);
    }
    None
}

fn probe_jpeg(bytes: &[u8]) -> Option<ImageInfo> {
    let mut i = 2;
    loop {
        while *bytes.get(i)? != 0xFF {
            i += 1;
        }
        while *bytes.get(i)? == 0xFF {
            i += 1;
        }
        let marker = *bytes.get(i)?;
        i += 1;
        match marker {
            // Standalone markers carry no length.
            0x01 | 0xD0..=0xD7 => continue,
            0xD9 | 0xDA => return None,
            0xC0..=0xCF if !matches!(marker, 0xC4 | 0xC8 | 0xCC) => {
                return Some(ImageInfo {
                    format: ImageFormat::Jpeg,
                    height: be16(bytes, i + 3)?,
                    width: be16(bytes, i + 5)?,
                });
            }
            _ => {
                let len = be16(bytes, i)? as usize;
                if len < 2 {
                    return None;
                }
                i += len;
            }
        }
    }
}

fn probe_webp(bytes: &[u8]) -> Option<ImageInfo> {
    let (width, height) = match bytes.get(12..16)? {
        b"VP8 " => (le16(bytes, 26)? & 0x3FFF, le16(bytes, 28)? & 0x3FFF),
        b"VP8L" => {
            let b: [u32; 4] = [
                u32::from(*bytes.get(21)?),
                u32::from(*bytes.get(22)?),
                u32::from(*bytes.get(23)?),
                u32::from(*bytes.get(24)?),
            ];
            let w = 1 + (((b[1] & 0x3F) << 8) | b[0]);
            let h = 1 + (((b[3] & 0x0F) << 10) | (b[2] << 2) | ((b[1] & 0xC0) >> 6));
            (w, h)
        }
        b"VP8X" => (1 + le24(bytes, 24)?, 1 + le24(bytes, 27)?),
        _ => return None,
    };
    Some(ImageInfo {
        format: ImageFormat::WebP,
        width,
        height,
    })
}

fn scaled(len: u32, factor: f64) -> u32 {
    ((f64::from(len) * factor).round() as u32).max(1)
}

/// Output size for `source` under the requested box and fit. Aspect ratio is
/// kept unless `fit` is [`Fit::Exact`].
pub fn target_size(
    source: (u32, u32),
    width: Option<u32>,
    height: Option<u32>,
    fit: Fit,
) -> Result<(u32, u32), String> {
    let (sw, sh) = source;
    if sw == 0 || sh == 0 {
        return Err("source image has zero size".into());
    }
    if width == Some(0) || height == Some(0) {
        return Err("requested width and height must be positive".into());
    }
    let size = match (width, height) {
        (None, None) => source,
        (Some(w), None) => (w, scaled(sh, f64::from(w) / f64::from(sw))),
        (None, Some(h)) => (scaled(sw, f64::from(h) / f64::from(sh)), h),
        (Some(w), Some(h)) => match fit {
            Fit::Exact | Fit::Cover => (w, h),
            Fit::Contain => {
                let factor = (f64::from(w) / f64::from(sw)).min(f64::from(h) / f64::from(sh));
                (scaled(sw, factor).min(w), scaled(sh, factor).min(h))
            }
        },
    };
    Ok(size)
}

/// The image backend.
#[derive(Clone, Default)]
pub struct ImageProbe {
    rasterizer: Option<Arc<dyn Rasterizer>>,
}

impl ImageProbe {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_rasterizer(mut self, rasterizer: Arc<dyn Rasterizer>) -> Self {
        self.rasterizer = Some(rasterizer);
        self
    }
}

impl ResourceBackend for ImageProbe {
    fn name(&self) -> &str {
        "image-probe"
    }

    fn supports(&self, kind: ResourceKind) -> bool {
        kind == ResourceKind::Image
    }

    fn process(&self, descriptor: &ResourceDescriptor) -> ResourceResult<ProcessedResourceData> {
        let info = probe(&descriptor.bytes).ok_or_else(|| ResourceError::Decode {
            resource: descriptor.id.clone(),
            message: "unrecognized image header".into(),
        })?;
        let params = &descriptor.params;
        let target = target_size((info.width, info.height), params.width, params.height, params.fit)
            .map_err(|message| ResourceError::InvalidParams {
                resource: descriptor.id.clone(),
                message,
            })?;
        let format = match params.format.as_deref() {
            None => info.format,
            Some(name) => ImageFormat::parse(name).ok_or_else(|| ResourceError::InvalidParams {
                resource: descriptor.id.clone(),
                message: format!("unsupported output format `{name}`"),
            })?,
        };

        let mut metadata = BTreeMap::from([
            ("source_format".to_string(), info.format.as_str().to_string()),
            ("source_width".to_string(), info.width.to_string()),
            ("source_height".to_string(), info.height.to_string()),
            ("fit".to_string(), params.fit.as_str().to_string()),
        ]);

        let untouched = target == (info.width, info.height) && format == info.format;
        let bytes = if untouched {
            descriptor.bytes.clone()
        } else {
            let rasterizer = match (&self.rasterizer, descriptor.backend_available) {
                (Some(r), None | Some(true)) => r,
                _ => {
                    tracing::warn!(resource = %descriptor.id, "no rasterizer installed, cannot resample");
                    return Err(descriptor.unavailable("rasterizer"));
                }
            };
            metadata.insert("rasterizer".into(), rasterizer.name().to_string());
            rasterizer
                .resample(
                    &descriptor.bytes,
                    &info,
                    target,
                    params.fit,
                    format,
                    params.quality.unwrap_or(DEFAULT_QUALITY),
                )
                .map_err(|message| ResourceError::Decode {
                    resource: descriptor.id.clone(),
                    message,
                })?
        };

        Ok(ProcessedResourceData {
            width: Some(target.0),
            height: Some(target.1),
            format: format.as_str().to_string(),
            bytes,
            metadata,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::resource::TransformParams;

    fn png(width: u32, height: u32) -> Vec<u8> {
        let mut b = PNG_SIGNATURE.to_vec();
        b.extend_from_slice(&13u32.to_be_bytes());
        b.extend_from_slice(b"IHDR");
        b.extend_from_slice(&width.to_be_bytes());
        b.extend_from_slice(&height.to_be_bytes());
        b.extend_from_slice(&[8, 6, 0, 0, 0]);
        b
    }

    fn gif(width: u16, height: u16) -> Vec<u8> {
        let mut b = b"GIF89a".to_vec();
        b.extend_from_slice(&width.to_le_bytes());
        b.extend_from_slice(&height.to_le_bytes());
        b
    }

    fn jpeg(width: u16, height: u16) -> Vec<u8> {
        let mut b = vec![0xFF, 0xD8];
        // APP0 segment of length 16.
        b.extend_from_slice(&[0xFF, 0xE0, 0x00, 0x10]);
        b.extend_from_slice(&[0; 14]);
        // SOF0
        b.extend_from_slice(&[0xFF, 0xC0, 0x00, 0x11, 0x08]);
        b.extend_from_slice(&height.to_be_bytes());
        b.extend_from_slice(&width.to_be_bytes());
        b.extend_from_slice(&[0x03]);
        b
    }

    fn webp_vp8x(width: u32, height: u32) -> Vec<u8> {
        let mut b = b"RIFF".to_vec();
        b.extend_from_slice(&[0; 4]);
        b.extend_from_slice(b"WEBPVP8X");
        b.extend_from_slice(&[10, 0, 0, 0, 0, 0, 0, 0]);
        b.extend_from_slice(&(width - 1).to_le_bytes()[..3]);
        b.extend_from_slice(&(height - 1).to_le_bytes()[..3]);
        b
    }

    struct FakeRasterizer;

    impl Rasterizer for FakeRasterizer {
        fn name(&self) -> &str {
            "fake"
        }

        fn resample(
            &self,
            _bytes: &[u8],
            _source: &ImageInfo,
            target: (u32, u32),
            _fit: Fit,
            format: ImageFormat,
            _quality: u8,
        ) -> Result<Vec<u8>, String> {
            Ok(format!("{}x{}.{}", target.0, target.1, format.as_str()).into_bytes())
        }
    }

    fn resize(bytes: Vec<u8>, width: Option<u32>, height: Option<u32>, fit: Fit) -> ResourceDescriptor {
        ResourceDescriptor::new("img", ResourceKind::Image, bytes).with_params(TransformParams {
            width,
            height,
            fit,
            ..TransformParams::default()
        })
    }

    #[test]
    fn probes_headers() {
        assert_eq!(
            probe(&png(640, 480)),
            Some(ImageInfo { format: ImageFormat::Png, width: 640, height: 480 })
        );
        assert_eq!(
            probe(&gif(32, 16)),
            Some(ImageInfo { format: ImageFormat::Gif, width: 32, height: 16 })
        );
        assert_eq!(
            probe(&jpeg(1024, 768)),
            Some(ImageInfo { format: ImageFormat::Jpeg, width: 1024, height: 768 })
        );
        assert_eq!(
            probe(&webp_vp8x(300, 200)),
            Some(ImageInfo { format: ImageFormat::WebP, width: 300, height: 200 })
        );
        assert_eq!(probe(b"not an image"), None);
        assert_eq!(probe(&png(1, 1)[..18]), None);
    }

    #[test]
    fn target_sizes() {
        let src = (800, 400);
        assert_eq!(target_size(src, None, None, Fit::Contain), Ok((800, 400)));
        assert_eq!(target_size(src, Some(400), None, Fit::Contain), Ok((400, 200)));
        assert_eq!(target_size(src, None, Some(100), Fit::Contain), Ok((200, 100)));
        assert_eq!(target_size(src, Some(200), Some(200), Fit::Contain), Ok((200, 100)));
        assert_eq!(target_size(src, Some(200), Some(200), Fit::Cover), Ok((200, 200)));
        assert_eq!(target_size(src, Some(10), Some(90), Fit::Exact), Ok((10, 90)));
        assert!(target_size(src, Some(0), None, Fit::Contain).is_err());
    }

    #[test]
    fn identity_needs_no_rasterizer() {
        let d = resize(png(64, 64), None, None, Fit::Contain);
        let data = ImageProbe::new().process(&d).unwrap();
        assert_eq!(data.bytes, d.bytes);
        assert_eq!((data.width, data.height), (Some(64), Some(64)));
        assert_eq!(data.format, "png");
    }

    #[test]
    fn resize_without_rasterizer_is_unavailable() {
        let d = resize(png(64, 64), Some(32), None, Fit::Contain);
        assert!(matches!(
            ImageProbe::new().process(&d),
            Err(ResourceError::BackendUnavailable { ref backend, .. }) if backend == "rasterizer"
        ));
    }

    #[test]
    fn resize_with_rasterizer() {
        let probe = ImageProbe::new().with_rasterizer(Arc::new(FakeRasterizer));
        let d = resize(jpeg(400, 200), Some(100), Some(100), Fit::Contain);
        let data = probe.process(&d).unwrap();
        assert_eq!(data.bytes, b"100x50.jpeg");
        assert_eq!(data.metadata["rasterizer"], "fake");

        // The caller can force the backend off.
        let off = d.with_backend_available(false);
        assert!(matches!(
            probe.process(&off),
            Err(ResourceError::BackendUnavailable { .. })
        ));
    }

    #[test]
    fn garbage_is_decode_error() {
        let d = ResourceDescriptor::new("x.png", ResourceKind::Image, b"nope".to_vec());
        assert!(matches!(
            ImageProbe::new().process(&d),
            Err(ResourceError::Decode { .. })
        ));
    }
}
