use chrono::{DateTime, Utc};
use exif::{Context, Field, In, Reader, Tag, Value};
use std::io::Cursor;

/// Tags that describe pixel layout or file structure rather than the capture.
/// They change whenever an image is re-encoded or resized, so they stay out
/// of the signature.
const STRUCTURAL_TAGS: [Tag; 22] = [
    Tag::ImageWidth,
    Tag::ImageLength,
    Tag::BitsPerSample,
    Tag::Compression,
    Tag::PhotometricInterpretation,
    Tag::StripOffsets,
    Tag::SamplesPerPixel,
    Tag::RowsPerStrip,
    Tag::StripByteCounts,
    Tag::PlanarConfiguration,
    // TileWidth and TileLength have no named constant in the reader.
    Tag(Context::Tiff, 0x0142),
    Tag(Context::Tiff, 0x0143),
    Tag::TileOffsets,
    Tag::TileByteCounts,
    Tag::XResolution,
    Tag::YResolution,
    Tag::ResolutionUnit,
    Tag::PixelXDimension,
    Tag::PixelYDimension,
    Tag::ExifIFDPointer,
    Tag::GPSInfoIFDPointer,
    Tag::InteropIFDPointer,
];

/// Embedded capture metadata pulled from an image's EXIF block.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EmbeddedMetadata {
    /// blake3 hex digest over the sorted non-structural primary fields.
    pub signature: String,
    pub camera: Option<String>,
    pub taken_at: Option<DateTime<Utc>>,
}

/// Reads EXIF from in-memory image bytes.
pub struct MetadataReader;

impl MetadataReader {
    pub fn new() -> Self {
        Self
    }

    /// Returns `None` when the bytes carry no EXIF, or only structural tags.
    pub fn read(&self, bytes: &[u8]) -> Option<EmbeddedMetadata> {
        let mut cursor = Cursor::new(bytes);
        let exif = match Reader::new().read_from_container(&mut cursor) {
            Ok(exif) => exif,
            Err(e) => {
                log::trace!("No EXIF block: {}", e);
                return None;
            }
        };

        let entries: Vec<String> = exif
            .fields()
            .filter(|field| field.ifd_num == In::PRIMARY)
            .filter(|field| !STRUCTURAL_TAGS.contains(&field.tag))
            .map(|field| format!("{}={}", field.tag, field.display_value()))
            .collect();
        let signature = signature_of(entries)?;

        let mut camera_parts = Vec::new();
        for tag in [Tag::Make, Tag::Model] {
            if let Some(part) = exif
                .get_field(tag, In::PRIMARY)
                .and_then(|field| self.field_to_string(field))
            {
                let part = part.trim();
                if !part.is_empty() {
                    camera_parts.push(part.to_string());
                }
            }
        }
        let camera = (!camera_parts.is_empty()).then(|| camera_parts.join(" "));

        let taken_at = exif
            .get_field(Tag::DateTimeOriginal, In::PRIMARY)
            .or_else(|| exif.get_field(Tag::DateTime, In::PRIMARY))
            .and_then(|field| self.field_to_string(field))
            .and_then(|value| self.parse_exif_datetime(&value));

        Some(EmbeddedMetadata {
            signature,
            camera,
            taken_at,
        })
    }

    fn field_to_string(&self, field: &Field) -> Option<String> {
        match &field.value {
            Value::Ascii(vec) => vec.first().map(|ascii| {
                String::from_utf8_lossy(ascii)
                    .trim_end_matches('\0')
                    .to_string()
            }),
            Value::Undefined(data, _) => Some(
                String::from_utf8_lossy(data)
                    .trim_end_matches('\0')
                    .to_string(),
            ),
            _ => Some(field.display_value().to_string()),
        }
    }

    /// EXIF datetimes look like "YYYY:MM:DD HH:MM:SS" and carry no zone.
    fn parse_exif_datetime(&self, datetime_str: &str) -> Option<DateTime<Utc>> {
        match chrono::NaiveDateTime::parse_from_str(datetime_str.trim(), "%Y:%m:%d %H:%M:%S") {
            Ok(dt) => Some(dt.and_utc()),
            Err(_) => {
                log::warn!("Failed to parse EXIF datetime: {}", datetime_str);
                None
            }
        }
    }
}

impl Default for MetadataReader {
    fn default() -> Self {
        Self::new()
    }
}

fn signature_of(mut entries: Vec<String>) -> Option<String> {
    if entries.is_empty() {
        return None;
    }
    entries.sort();
    let mut hasher = blake3::Hasher::new();
    for entry in &entries {
        hasher.update(entry.as_bytes());
        hasher.update(b"\n");
    }
    Some(hasher.finalize().to_hex().to_string())
}
