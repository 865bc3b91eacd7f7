use std::ffi::{OsStr, OsString};
use std::path::Path;
use std::time::Instant;

use async_trait::async_trait;
use log::debug;
use tokio::process::Command;

use super::executor::{
    Dimensions, ExecError, ExecLimits, Gravity, Quality, ResizeMode, TransformExecutor,
};

pub const CONVERT: &str = "convert";
pub const COMPOSITE: &str = "composite";
pub const IDENTIFY: &str = "identify";

/// Drives the ImageMagick command line tools.
#[derive(Debug, Clone, Default)]
pub struct MagickExecutor {
    limits: ExecLimits,
}

impl MagickExecutor {
    pub fn new(limits: ExecLimits) -> Self {
        Self { limits }
    }

    fn limit_args(&self) -> Vec<OsString> {
        vec![
            "-limit".into(),
            "memory".into(),
            format!("{}MiB", self.limits.memory_mb).into(),
        ]
    }

    async fn run(&self, program: &str, args: Vec<OsString>) -> Result<String, ExecError> {
        let start_time = Instant::now();
        let mut cmd = Command::new(program);
        cmd.args(&args).kill_on_drop(true);

        let output = match tokio::time::timeout(self.limits.timeout, cmd.output()).await {
            Err(_) => {
                return Err(ExecError::Timeout {
                    program: program.to_string(),
                    timeout: self.limits.timeout,
                });
            }
            Ok(Err(source)) => {
                return Err(ExecError::Spawn {
                    program: program.to_string(),
                    source,
                });
            }
            Ok(Ok(output)) => output,
        };

        if !output.status.success() {
            let mut captured = String::from_utf8_lossy(&output.stderr).trim().to_string();
            if captured.is_empty() {
                captured = String::from_utf8_lossy(&output.stdout).trim().to_string();
            }
            return Err(ExecError::Failed {
                program: program.to_string(),
                status: output.status.to_string(),
                output: captured,
            });
        }

        debug!(
            duration = &*format!("{:?}", start_time.elapsed());
            "{} {:?}", program, args
        );
        Ok(String::from_utf8_lossy(&output.stdout).into_owned())
    }
}

fn os(path: &Path) -> OsString {
    path.as_os_str().to_os_string()
}

/// `+X+Y` style offsets, keeping the sign of negative values.
pub fn geometry_offset(x: i32, y: i32) -> String {
    format!("{x:+}{y:+}")
}

pub fn resize_args(
    src: &Path,
    dst: &Path,
    width: u32,
    height: u32,
    quality: Quality,
    mode: ResizeMode,
) -> Vec<OsString> {
    let op = match mode {
        ResizeMode::Filtered => "-resize",
        ResizeMode::Fast => "-scale",
    };
    vec![
        os(src),
        op.into(),
        format!("{width}x{height}").into(),
        "-quality".into(),
        quality.value().to_string().into(),
        os(dst),
    ]
}

pub fn crop_args(src: &Path, dst: &Path, width: u32, height: u32, x: i32, y: i32) -> Vec<OsString> {
    vec![
        os(src),
        "-crop".into(),
        format!("{width}x{height}{}", geometry_offset(x, y)).into(),
        "+repage".into(),
        os(dst),
    ]
}

pub fn composite_args(
    overlay: &Path,
    base: &Path,
    dst: &Path,
    x: i32,
    y: i32,
    dissolve: u8,
    gravity: Gravity,
) -> Vec<OsString> {
    vec![
        "-dissolve".into(),
        dissolve.to_string().into(),
        "-gravity".into(),
        gravity.as_str().into(),
        "-geometry".into(),
        geometry_offset(x, y).into(),
        os(overlay),
        os(base),
        os(dst),
    ]
}

pub fn normalize_args(src: &Path, dst: &Path, hint: Option<(u32, u32)>) -> Vec<OsString> {
    let mut args: Vec<OsString> = Vec::new();
    if let Some((width, height)) = hint {
        args.push("-define".into());
        args.push(format!("jpeg:size={width}x{height}").into());
    }
    args.extend([os(src), "-auto-orient".into(), "-strip".into(), os(dst)]);
    args
}

pub fn identify_args(path: &Path) -> Vec<OsString> {
    // First frame only, so animated inputs print a single pair.
    let mut first_frame = os(path);
    first_frame.push(OsStr::new("[0]"));
    vec!["-format".into(), "%w\n%h".into(), first_frame]
}

/// Parse `identify -format "%w\n%h"` output.
pub fn parse_identify(output: &str) -> Result<Dimensions, ExecError> {
    let parse_error = || ExecError::Parse {
        program: IDENTIFY.to_string(),
        output: output.to_string(),
    };
    let mut lines = output.lines().map(str::trim).filter(|l| !l.is_empty());
    let width = lines
        .next()
        .and_then(|w| w.parse::<u32>().ok())
        .ok_or_else(parse_error)?;
    let height = lines
        .next()
        .and_then(|h| h.parse::<u32>().ok())
        .ok_or_else(parse_error)?;
    Ok(Dimensions { width, height })
}

#[async_trait]
impl TransformExecutor for MagickExecutor {
    async fn resize(
        &self,
        src: &Path,
        dst: &Path,
        width: u32,
        height: u32,
        quality: Quality,
        mode: ResizeMode,
    ) -> Result<(), ExecError> {
        let mut args = self.limit_args();
        args.extend(resize_args(src, dst, width, height, quality, mode));
        self.run(CONVERT, args).await.map(|_| ())
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
        let mut args = self.limit_args();
        args.extend(crop_args(src, dst, width, height, x, y));
        self.run(CONVERT, args).await.map(|_| ())
    }

    async fn composite(
        &self,
        overlay: &Path,
        base: &Path,
        dst: &Path,
        x: i32,
        y: i32,
        dissolve: u8,
        gravity: Gravity,
    ) -> Result<(), ExecError> {
        let mut args = self.limit_args();
        args.extend(composite_args(overlay, base, dst, x, y, dissolve, gravity));
        self.run(COMPOSITE, args).await.map(|_| ())
    }

    async fn normalize(
        &self,
        src: &Path,
        dst: &Path,
        hint: Option<(u32, u32)>,
    ) -> Result<(), ExecError> {
        let mut args = self.limit_args();
        args.extend(normalize_args(src, dst, hint));
        self.run(CONVERT, args).await.map(|_| ())
    }

    async fn inspect(&self, path: &Path) -> Result<Dimensions, ExecError> {
        let mut args = self.limit_args();
        args.extend(identify_args(path));
        let output = self.run(IDENTIFY, args).await?;
        parse_identify(&output)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::PathBuf;

    fn strings(args: Vec<OsString>) -> Vec<String> {
        args.into_iter()
            .map(|a| a.to_string_lossy().into_owned())
            .collect()
    }

    #[test]
    fn resize_uses_scale_when_quick() {
        let src = PathBuf::from("/w/a.jpg");
        let dst = PathBuf::from("/w/b.jpg");
        assert_eq!(
            strings(resize_args(&src, &dst, 300, 200, Quality::new(80), ResizeMode::Filtered)),
            vec!["/w/a.jpg", "-resize", "300x200", "-quality", "80", "/w/b.jpg"]
        );
        assert_eq!(
            strings(resize_args(&src, &dst, 300, 200, Quality::new(80), ResizeMode::Fast))[1],
            "-scale"
        );
    }

    #[test]
    fn crop_geometry_keeps_offset_sign() {
        let args = strings(crop_args(
            Path::new("in.png"),
            Path::new("out.png"),
            200,
            150,
            50,
            -5,
        ));
        assert_eq!(args, vec!["in.png", "-crop", "200x150+50-5", "+repage", "out.png"]);
    }

    #[test]
    fn composite_places_overlay_before_base() {
        let args = strings(composite_args(
            Path::new("wm.png"),
            Path::new("base.jpeg"),
            Path::new("out.jpeg"),
            10,
            20,
            100,
            Gravity::NorthWest,
        ));
        assert_eq!(
            args,
            vec![
                "-dissolve", "100", "-gravity", "northwest", "-geometry", "+10+20", "wm.png",
                "base.jpeg", "out.jpeg"
            ]
        );
    }

    #[test]
    fn normalize_adds_size_hint_only_when_given() {
        let with_hint = strings(normalize_args(
            Path::new("a.jpg"),
            Path::new("b.jpg"),
            Some((1600, 1200)),
        ));
        assert_eq!(
            with_hint,
            vec!["-define", "jpeg:size=1600x1200", "a.jpg", "-auto-orient", "-strip", "b.jpg"]
        );
        let plain = strings(normalize_args(Path::new("a.jpg"), Path::new("b.jpg"), None));
        assert_eq!(plain, vec!["a.jpg", "-auto-orient", "-strip", "b.jpg"]);
    }

    #[test]
    fn identify_reads_first_frame() {
        let args = strings(identify_args(Path::new("/w/anim.gif")));
        assert_eq!(args, vec!["-format", "%w\n%h", "/w/anim.gif[0]"]);
    }

    #[test]
    fn parses_identify_output() {
        assert_eq!(
            parse_identify("1600\n1200").unwrap(),
            Dimensions {
                width: 1600,
                height: 1200
            }
        );
        assert_eq!(parse_identify(" 300\n200\n").unwrap().height, 200);
        assert!(matches!(
            parse_identify("300"),
            Err(ExecError::Parse { .. })
        ));
        assert!(matches!(
            parse_identify("abc\n12"),
            Err(ExecError::Parse { .. })
        ));
    }

    #[test]
    fn limit_args_carry_memory_ceiling() {
        let executor = MagickExecutor::new(ExecLimits {
            memory_mb: 256,
            ..ExecLimits::default()
        });
        assert_eq!(strings(executor.limit_args()), vec!["-limit", "memory", "256MiB"]);
    }
}
