//! Pure-Rust executor on the `image` crate.
//!
//! The decode pre-shrink hint is ignored: `image` has no scaled JPEG decode,
//! so the memory ceiling is enforced through decoder allocation limits instead.
//!
//! A blocking job cannot be interrupted once started. Outputs are written to a
//! staging sibling and only renamed onto `dst` while the call is still awaited,
//! so a job that outlives its timeout never leaves a file behind.

use std::fs::File;
use std::io::{BufReader, BufWriter};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, PoisonError};

use anyhow::{Context, Result, anyhow, bail};
use async_trait::async_trait;
use image::codecs::jpeg::JpegEncoder;
use image::imageops::{self, FilterType};
use image::{DynamicImage, ImageFormat, ImageReader, Limits};
use log::warn;
use tokio::task::spawn_blocking;

use super::executor::{
    Dimensions, ExecError, ExecLimits, Gravity, Quality, ResizeMode, TransformExecutor,
};

#[derive(Debug, Clone, Default)]
pub struct NativeExecutor {
    limits: ExecLimits,
}

impl NativeExecutor {
    pub fn new(limits: ExecLimits) -> Self {
        Self { limits }
    }

    /// Run `job` on the blocking pool under the configured timeout.
    async fn blocking<T, F>(&self, path: &Path, job: F) -> Result<T, ExecError>
    where
        T: Send + 'static,
        F: FnOnce(&Abandon) -> Result<T> + Send + 'static,
    {
        let path = path.to_path_buf();
        let abandon = Abandon::default();
        let handle = abandon.clone();
        let task = spawn_blocking(move || job(&handle));
        match tokio::time::timeout(self.limits.timeout, task).await {
            Err(_) => {
                abandon.set();
                Err(ExecError::Timeout {
                    program: "image".to_string(),
                    timeout: self.limits.timeout,
                })
            }
            Ok(Err(join_error)) => Err(ExecError::Image {
                path,
                source: anyhow!("blocking image task failed: {join_error}"),
            }),
            Ok(Ok(result)) => result.map_err(|source| ExecError::Image { path, source }),
        }
    }

    fn decoder_limits(&self) -> Limits {
        let mut limits = Limits::default();
        limits.max_alloc = Some(self.limits.memory_mb.saturating_mul(1024 * 1024));
        limits
    }
}

/// Set once the caller stopped waiting for a blocking job.
#[derive(Debug, Clone, Default)]
struct Abandon(Arc<Mutex<bool>>);

impl Abandon {
    fn set(&self) {
        *self.0.lock().unwrap_or_else(PoisonError::into_inner) = true;
    }

    /// Rename `staging` onto `dst` unless the call was abandoned. The lock is
    /// held across the rename, so anything published here lands before the
    /// caller returns and is tracked by it.
    fn publish(&self, staging: &Staging, dst: &Path) -> Result<()> {
        let abandoned = self.0.lock().unwrap_or_else(PoisonError::into_inner);
        if *abandoned {
            bail!("abandoned after timeout, not writing {:?}", dst);
        }
        std::fs::rename(&staging.0, dst)
            .with_context(|| format!("failed to move {:?} onto {:?}", staging.0, dst))
    }
}

/// Hidden sibling of an output path, removed on drop unless renamed away.
struct Staging(PathBuf);

impl Staging {
    fn for_output(dst: &Path) -> Self {
        let name = dst
            .file_name()
            .map(|name| name.to_string_lossy().into_owned())
            .unwrap_or_default();
        Self(dst.with_file_name(format!(".partial-{name}")))
    }
}

impl Drop for Staging {
    fn drop(&mut self) {
        if let Err(err) = std::fs::remove_file(&self.0)
            && err.kind() != std::io::ErrorKind::NotFound
        {
            warn!("Failed to remove staging file {:?}: {}", self.0, err);
        }
    }
}

fn decode(path: &Path, limits: Limits) -> Result<DynamicImage> {
    let mut reader = ImageReader::open(path)
        .with_context(|| format!("failed to open image: {:?}", path))?
        .with_guessed_format()
        .with_context(|| format!("failed to guess image format: {:?}", path))?;
    reader.limits(limits);
    reader
        .decode()
        .with_context(|| format!("failed to decode image: {:?}", path))
}

/// Encode by the extension of `dst`. JPEG output honours `quality`.
fn encode(image: &DynamicImage, dst: &Path, quality: Quality, abandon: &Abandon) -> Result<()> {
    let format = ImageFormat::from_path(dst)
        .with_context(|| format!("unknown output format for {:?}", dst))?;
    let staging = Staging::for_output(dst);
    write_image(image, &staging.0, format, quality)
        .with_context(|| format!("failed to encode {:?}", dst))?;
    abandon.publish(&staging, dst)
}

fn write_image(image: &DynamicImage, path: &Path, format: ImageFormat, quality: Quality) -> Result<()> {
    let file = File::create(path).with_context(|| format!("failed to create {:?}", path))?;
    let mut writer = BufWriter::new(file);
    if format == ImageFormat::Jpeg {
        let encoder = JpegEncoder::new_with_quality(&mut writer, quality.value());
        DynamicImage::ImageRgb8(image.to_rgb8()).write_with_encoder(encoder)?;
    } else {
        image.write_to(&mut writer, format)?;
    }
    writer
        .into_inner()
        .map_err(|err| anyhow!("failed to flush {:?}: {}", path, err.error()))?;
    Ok(())
}

/// EXIF orientation (1..=8), or 1 when the file carries none.
fn read_orientation(path: &Path) -> u32 {
    let Ok(file) = File::open(path) else {
        return 1;
    };
    let mut reader = BufReader::new(file);
    exif::Reader::new()
        .read_from_container(&mut reader)
        .ok()
        .and_then(|exif| {
            exif.get_field(exif::Tag::Orientation, exif::In::PRIMARY)
                .and_then(|field| field.value.get_uint(0))
        })
        .unwrap_or(1)
}

pub fn apply_orientation(image: DynamicImage, orientation: u32) -> DynamicImage {
    match orientation {
        2 => image.fliph(),
        3 => image.rotate180(),
        4 => image.flipv(),
        5 => image.rotate90().fliph(),
        6 => image.rotate90(),
        7 => image.rotate270().fliph(),
        8 => image.rotate270(),
        _ => image,
    }
}

fn filter_for(mode: ResizeMode) -> FilterType {
    match mode {
        ResizeMode::Filtered => FilterType::Lanczos3,
        ResizeMode::Fast => FilterType::Nearest,
    }
}

/// Scale the overlay's alpha channel by `dissolve` percent.
fn dissolve(overlay: DynamicImage, dissolve: u8) -> image::RgbaImage {
    let mut rgba = overlay.to_rgba8();
    if dissolve < 100 {
        for pixel in rgba.pixels_mut() {
            pixel.0[3] = (u16::from(pixel.0[3]) * u16::from(dissolve) / 100) as u8;
        }
    }
    rgba
}

/// Clamp a possibly negative crop window onto the image.
pub fn crop_window(x: i32, y: i32, width: u32, height: u32) -> (u32, u32, u32, u32) {
    let shrink_w = x.min(0).unsigned_abs();
    let shrink_h = y.min(0).unsigned_abs();
    (
        x.max(0) as u32,
        y.max(0) as u32,
        width.saturating_sub(shrink_w),
        height.saturating_sub(shrink_h),
    )
}

#[async_trait]
impl TransformExecutor for NativeExecutor {
    async fn resize(
        &self,
        src: &Path,
        dst: &Path,
        width: u32,
        height: u32,
        quality: Quality,
        mode: ResizeMode,
    ) -> Result<(), ExecError> {
        let (src_path, dst_path): (PathBuf, PathBuf) = (src.into(), dst.into());
        let limits = self.decoder_limits();
        self.blocking(src, move |abandon| {
            let image = decode(&src_path, limits)?;
            let resized = image.resize(width, height, filter_for(mode));
            encode(&resized, &dst_path, quality, abandon)
        })
        .await
    }

    async fn crop(
        &self,
        src: &Path,
        dst: &Path,
        width: u32,
        height: u32,
        x: i32,
        y: i32,
    ) -> Result<(), ExecError> {
        let (src_path, dst_path): (PathBuf, PathBuf) = (src.into(), dst.into());
        let limits = self.decoder_limits();
        self.blocking(src, move |abandon| {
            let image = decode(&src_path, limits)?;
            let (x, y, width, height) = crop_window(x, y, width, height);
            let cropped = image.crop_imm(x, y, width, height);
            encode(&cropped, &dst_path, Quality::new(100), abandon)
        })
        .await
    }

    async fn composite(
        &self,
        overlay: &Path,
        base: &Path,
        dst: &Path,
        x: i32,
        y: i32,
        dissolve_percent: u8,
        gravity: Gravity,
    ) -> Result<(), ExecError> {
        let Gravity::NorthWest = gravity;
        let (overlay_path, base_path, dst_path): (PathBuf, PathBuf, PathBuf) =
            (overlay.into(), base.into(), dst.into());
        let limits = self.decoder_limits();
        self.blocking(base, move |abandon| {
            let top = dissolve(decode(&overlay_path, limits.clone())?, dissolve_percent);
            let mut bottom = decode(&base_path, limits)?.to_rgba8();
            imageops::overlay(&mut bottom, &top, i64::from(x), i64::from(y));
            encode(
                &DynamicImage::ImageRgba8(bottom),
                &dst_path,
                Quality::new(100),
                abandon,
            )
        })
        .await
    }

    async fn normalize(
        &self,
        src: &Path,
        dst: &Path,
        _hint: Option<(u32, u32)>,
    ) -> Result<(), ExecError> {
        let (src_path, dst_path): (PathBuf, PathBuf) = (src.into(), dst.into());
        let limits = self.decoder_limits();
        self.blocking(src, move |abandon| {
            let orientation = read_orientation(&src_path);
            let image = apply_orientation(decode(&src_path, limits)?, orientation);
            // Re-encoding drops every metadata block.
            encode(&image, &dst_path, Quality::new(100), abandon)
        })
        .await
    }

    async fn inspect(&self, path: &Path) -> Result<Dimensions, ExecError> {
        let owned = path.to_path_buf();
        self.blocking(path, move |_| {
            let (width, height) = image::image_dimensions(&owned)
                .with_context(|| format!("failed to read dimensions: {:?}", owned))?;
            Ok(Dimensions { width, height })
        })
        .await
    }
}
