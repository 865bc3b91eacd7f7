use std::collections::HashSet;

use log::warn;
use serde::{Deserialize, Serialize};

use crate::common::errors::ResizeError;
use crate::common::{DEFAULT_FALLBACK_FORMAT, is_encodable};
use crate::operations::store::BlobLocation;

fn default_quality() -> u32 {
    90
}

/// Wire body of `POST /resize`.
#[derive(Debug, Clone, Deserialize, Serialize, Default, PartialEq, Eq)]
pub struct ResizeRequest {
    #[serde(default)]
    pub original_path: String,
    #[serde(default)]
    pub path_to_save: String,
    #[serde(default)]
    pub format: String,
    #[serde(default)]
    pub bucket_name: String,
    #[serde(default)]
    pub region: String,
    #[serde(default)]
    pub sizes: Vec<Size>,
}

#[derive(Debug, Clone, Deserialize, Serialize, Default, PartialEq, Eq)]
pub struct Size {
    #[serde(default)]
    pub size_name: String,
    pub resize_options: Option<ResizeOptions>,
    pub crop_options: Option<CropOptions>,
    pub water_mark_options: Option<WaterMarkOptions>,
    pub format: Option<String>,
    #[serde(default)]
    pub keep_format: bool,
}

#[derive(Debug, Clone, Copy, Deserialize, Serialize, PartialEq, Eq)]
pub struct ResizeOptions {
    pub x: u32,
    pub y: u32,
    #[serde(default)]
    pub quick_resize: bool,
    #[serde(default = "default_quality")]
    pub image_quality: u32,
}

#[derive(Debug, Clone, Copy, Deserialize, Serialize, PartialEq, Eq)]
pub struct CropOptions {
    pub width: u32,
    pub height: u32,
    #[serde(default)]
    pub x: i32,
    #[serde(default)]
    pub y: i32,
}

#[derive(Debug, Clone, Deserialize, Serialize, PartialEq, Eq)]
pub struct WaterMarkOptions {
    pub width: u32,
    pub height: u32,
    #[serde(default)]
    pub x: i32,
    #[serde(default)]
    pub y: i32,
    pub watermark_image_url: String,
}

/// A validated request, with sizes sorted largest first and formats resolved.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResizePlan {
    pub original_path: String,
    pub path_to_save: String,
    pub format: String,
    pub location: BlobLocation,
    pub sizes: Vec<SizeSpec>,
}

/// One output variant of a [`ResizePlan`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SizeSpec {
    pub name: String,
    pub resize: ResizeOptions,
    pub crop: Option<CropOptions>,
    pub watermark: Option<WaterMarkOptions>,
    /// Output format after precedence rules were applied.
    pub format: String,
}

impl ResizeRequest {
    /// Check required fields and turn the wire request into a [`ResizePlan`].
    pub fn validate(self) -> Result<ResizePlan, ResizeError> {
        if self.format.is_empty() {
            return Err(bad_request("format is required field"));
        }
        if self.bucket_name.is_empty() {
            return Err(bad_request("bucket_name is required field"));
        }
        if self.path_to_save.is_empty() {
            return Err(bad_request("path_to_save is required field"));
        }
        if self.original_path.is_empty() {
            return Err(bad_request("original_path is required field"));
        }
        if self.sizes.is_empty() {
            return Err(bad_request("at least 1 size required"));
        }
        if self.region.is_empty() {
            return Err(bad_request("AWS region is required field"));
        }

        let mut sizes = Vec::with_capacity(self.sizes.len());
        let mut names = HashSet::with_capacity(self.sizes.len());
        for (i, size) in self.sizes.into_iter().enumerate() {
            if size.size_name.is_empty() {
                return Err(bad_request(format!("sizes[{i}].size_name is required field")));
            }
            // Names map to blob keys and result entries, so they must be unique.
            if !names.insert(size.size_name.clone()) {
                return Err(bad_request(format!(
                    "sizes[{i}].size_name `{}` is duplicated",
                    size.size_name
                )));
            }
            let Some(resize) = size.resize_options else {
                return Err(bad_request(format!(
                    "sizes[{i}].resize_options is required field"
                )));
            };
            if let Some(format) = &size.format
                && !format.is_empty()
                && !is_encodable(format)
            {
                return Err(bad_request(format!(
                    "sizes[{i}].format `{format}` is not a supported output format"
                )));
            }
            let format = resolve_format(&self.format, size.format.as_deref(), size.keep_format);
            sizes.push(SizeSpec {
                name: size.size_name,
                resize,
                crop: size.crop_options,
                watermark: size.water_mark_options,
                format,
            });
        }

        Ok(ResizePlan {
            original_path: self.original_path,
            path_to_save: self.path_to_save,
            format: self.format,
            location: BlobLocation::new(self.bucket_name, self.region),
            sizes: sort_sizes(sizes),
        })
    }
}

fn bad_request(message: impl Into<String>) -> ResizeError {
    ResizeError::BadRequest(message.into())
}

/// Largest width first, ties broken by largest height. The sort is stable.
pub fn sort_sizes(mut sizes: Vec<SizeSpec>) -> Vec<SizeSpec> {
    sizes.sort_by(|a, b| {
        b.resize
            .x
            .cmp(&a.resize.x)
            .then_with(|| b.resize.y.cmp(&a.resize.y))
    });
    sizes
}

/// Per-size override, then the request format when kept, then the fallback.
pub fn resolve_format(request_format: &str, size_format: Option<&str>, keep_format: bool) -> String {
    if let Some(format) = size_format.filter(|f| !f.is_empty()) {
        return format.to_ascii_lowercase();
    }
    if keep_format {
        if is_encodable(request_format) {
            return request_format.to_ascii_lowercase();
        }
        warn!(
            "Format `{}` cannot be re-encoded, falling back to {}",
            request_format, DEFAULT_FALLBACK_FORMAT
        );
    }
    DEFAULT_FALLBACK_FORMAT.to_string()
}

impl ResizePlan {
    /// Decode pre-shrink hint: the resize bounds of the largest size.
    pub fn normalize_hint(&self) -> Option<(u32, u32)> {
        self.sizes.first().map(|s| (s.resize.x, s.resize.y))
    }
}

impl SizeSpec {
    /// Blob key the size is written to: `<prefix>/<name>.<format>`.
    pub fn destination(&self, path_to_save: &str) -> String {
        format!(
            "{}/{}.{}",
            path_to_save.trim_end_matches('/'),
            self.name,
            self.format
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_helpers::{request_json, size};

    fn request(sizes: Vec<Size>) -> ResizeRequest {
        ResizeRequest {
            original_path: "uploads/original.jpg".into(),
            path_to_save: "out/123".into(),
            format: "png".into(),
            bucket_name: "media".into(),
            region: "eu-west-1".into(),
            sizes,
        }
    }

    fn message(err: ResizeError) -> String {
        assert!(err.is_bad_request(), "expected bad request, got {err:?}");
        err.to_string()
    }

    #[test]
    fn rejects_missing_top_level_fields_in_order() {
        let mut req = request(vec![size("a", 10, 10)]);
        req.format.clear();
        req.bucket_name.clear();
        assert_eq!(message(req.validate().unwrap_err()), "format is required field");

        let mut req = request(vec![size("a", 10, 10)]);
        req.bucket_name.clear();
        assert_eq!(
            message(req.validate().unwrap_err()),
            "bucket_name is required field"
        );

        let mut req = request(vec![size("a", 10, 10)]);
        req.region.clear();
        assert_eq!(
            message(req.validate().unwrap_err()),
            "AWS region is required field"
        );
    }

    #[test]
    fn rejects_empty_sizes() {
        let req = request(vec![]);
        assert_eq!(message(req.validate().unwrap_err()), "at least 1 size required");
    }

    #[test]
    fn rejects_size_without_resize_options_by_index() {
        let mut broken = size("thumb", 10, 10);
        broken.resize_options = None;
        let req = request(vec![size("large", 100, 100), broken]);
        assert_eq!(
            message(req.validate().unwrap_err()),
            "sizes[1].resize_options is required field"
        );
    }

    #[test]
    fn rejects_size_without_name() {
        let req = request(vec![size("", 10, 10)]);
        assert_eq!(
            message(req.validate().unwrap_err()),
            "sizes[0].size_name is required field"
        );
    }

    #[test]
    fn rejects_duplicate_size_names() {
        let req = request(vec![size("a", 800, 600), size("b", 400, 300), size("a", 100, 75)]);
        assert_eq!(
            message(req.validate().unwrap_err()),
            "sizes[2].size_name `a` is duplicated"
        );
    }

    #[test]
    fn rejects_unknown_size_format() {
        let mut s = size("a", 10, 10);
        s.format = Some("psd".into());
        assert_eq!(
            message(request(vec![s]).validate().unwrap_err()),
            "sizes[0].format `psd` is not a supported output format"
        );
    }

    #[test]
    fn sorts_descending_by_width_then_height_stably() {
        let req = request(vec![
            size("small", 100, 50),
            size("wide-short", 800, 100),
            size("wide-tall", 800, 600),
            size("medium", 400, 300),
            size("medium-twin", 400, 300),
        ]);
        let plan = req.validate().unwrap();
        let names: Vec<&str> = plan.sizes.iter().map(|s| s.name.as_str()).collect();
        assert_eq!(
            names,
            vec!["wide-tall", "wide-short", "medium", "medium-twin", "small"]
        );
        assert_eq!(plan.normalize_hint(), Some((800, 600)));
    }

    #[test]
    fn format_precedence() {
        assert_eq!(resolve_format("png", Some("WEBP"), false), "webp");
        assert_eq!(resolve_format("png", Some("webp"), true), "webp");
        assert_eq!(resolve_format("png", None, true), "png");
        assert_eq!(resolve_format("png", None, false), "jpeg");
        assert_eq!(resolve_format("heic", None, true), "jpeg");
        assert_eq!(resolve_format("png", Some(""), true), "png");
    }

    #[test]
    fn destination_joins_prefix_name_and_format() {
        let plan = request(vec![size("thumb", 10, 10)]).validate().unwrap();
        assert_eq!(plan.sizes[0].destination("out/123/"), "out/123/thumb.jpeg");
        assert_eq!(plan.sizes[0].destination("out/123"), "out/123/thumb.jpeg");
    }

    #[test]
    fn decodes_wire_json() {
        let req: ResizeRequest = serde_json::from_str(&request_json()).unwrap();
        let plan = req.validate().unwrap();
        assert_eq!(plan.location.bucket, "media");
        assert_eq!(plan.sizes.len(), 2);
        assert_eq!(plan.sizes[0].name, "large");
        assert_eq!(plan.sizes[1].crop.map(|c| (c.width, c.height)), Some((200, 150)));
        assert_eq!(plan.sizes[1].resize.image_quality, 90);
    }
}
