//! Startup tasks: logger, external tool checks, work directories.

use std::io::Write;
use std::process::Command;

use anstyle::{AnsiColor, Style};
use anyhow::{Context, Result};
use env_logger::{Builder, WriteStyle};
use log::kv::Key;
use log::{error, info};

use crate::bootstrap::config::{ExecutorKind, ResizerConfig, StoreKind};
use crate::operations::aws::AWS;
use crate::operations::magick::{COMPOSITE, CONVERT, IDENTIFY};

const DARK_GREY: Style = Style::new().fg_color(Some(anstyle::Color::Ansi(AnsiColor::BrightBlack)));
const CYAN: Style = Style::new().fg_color(Some(anstyle::Color::Ansi(AnsiColor::Cyan)));

fn paint(style: Style, text: impl std::fmt::Display) -> String {
    format!("{}{}{}", style.render(), text, style.render_reset())
}

// ────────────────────────────────────────────────────────────────
// Logger Initialization
// ────────────────────────────────────────────────────────────────

/// Render the `duration` key-value as `12.34 ms`.
fn format_duration(raw: &str) -> String {
    if let Some(idx) = raw.find(|c: char| c.is_alphabetic() || c == 'µ') {
        let (num, unit) = (&raw[..idx], &raw[idx..]);
        if let Ok(val) = num.parse::<f32>() {
            return format!("{:.2} {}", val, unit);
        }
    }
    raw.to_string()
}

pub fn initialize_logger(level: log::LevelFilter) {
    let result = Builder::new()
        .write_style(WriteStyle::Auto)
        .format(|buf, record| {
            let ts = paint(DARK_GREY, buf.timestamp());

            let level_style = buf.default_level_style(record.level());
            let lvl = format!(
                "{}{}{}",
                level_style.render(),
                record.level(),
                level_style.render_reset()
            );

            let tgt = paint(DARK_GREY, record.target());

            let dur_raw = record
                .key_values()
                .get(Key::from("duration"))
                .map(|v| format_duration(&v.to_string()))
                .unwrap_or_default();

            // Fixed-width column so messages line up.
            let dur = if dur_raw.is_empty() {
                " ".repeat(10)
            } else {
                paint(CYAN, format!("{:>10}", dur_raw))
            };

            writeln!(buf, "{} {} {}", ts, lvl, tgt)?;

            let message = format!("{}", record.args());
            let subsequent_indent = " ".repeat(11);
            let mut lines = message.lines();
            if let Some(first_line) = lines.next() {
                writeln!(buf, "{} {}", dur, first_line)?;
            }
            for line in lines {
                writeln!(buf, "{}{}", subsequent_indent, line)?;
            }
            Ok(())
        })
        .filter(None, level)
        .filter(Some("rocket"), log::LevelFilter::Warn)
        .filter(Some("hyper"), log::LevelFilter::Warn)
        .filter(Some("reqwest"), log::LevelFilter::Warn)
        .try_init();

    if let Err(err) = result {
        eprintln!("Logger already initialized: {err}");
    }
}

// ────────────────────────────────────────────────────────────────
// External Tool Check
// ────────────────────────────────────────────────────────────────

/// Check that `command` is on PATH and log its version. Returns whether it
/// ran successfully.
pub fn check_command(command: &str) -> bool {
    match Command::new(command).arg("--version").output() {
        Ok(output) if output.status.success() => {
            let version_info = String::from_utf8_lossy(&output.stdout);
            let version_line = version_info.lines().next().unwrap_or("Unknown version");
            info!("{} version: {}", command, version_line.trim());
            true
        }
        Ok(_) => {
            error!(
                "`{}` command was found, but it returned an error. Please ensure it's correctly installed.",
                command
            );
            false
        }
        Err(_) => {
            error!(
                "`{}` is not installed or not available in PATH. Please install it before running the service.",
                command
            );
            false
        }
    }
}

/// Check the tools the configured executor and store shell out to.
pub fn check_external_tools(config: &ResizerConfig) -> bool {
    let mut tools = Vec::new();
    if config.executor == ExecutorKind::Magick {
        tools.extend([CONVERT, COMPOSITE, IDENTIFY]);
    }
    if config.store == StoreKind::Aws {
        tools.push(AWS);
    }
    // Check every tool so all missing ones are reported.
    tools
        .into_iter()
        .map(check_command)
        .fold(true, |all, ok| all && ok)
}

// ────────────────────────────────────────────────────────────────
// Folder Initialization
// ────────────────────────────────────────────────────────────────

pub fn initialize_folders(config: &ResizerConfig) -> Result<()> {
    std::fs::create_dir_all(&config.work_dir)
        .with_context(|| format!("Failed to create work dir {:?}", config.work_dir))?;
    let watermark_dir = config.watermark_dir();
    std::fs::create_dir_all(&watermark_dir)
        .with_context(|| format!("Failed to create watermark dir {:?}", watermark_dir))?;
    if config.store == StoreKind::Local {
        std::fs::create_dir_all(&config.store_root)
            .with_context(|| format!("Failed to create store root {:?}", config.store_root))?;
    }
    Ok(())
}

pub fn initialize(config: &ResizerConfig) -> Result<()> {
    initialize_logger(config.level_filter());
    if !check_external_tools(config) {
        anyhow::bail!("required external tools are missing");
    }
    initialize_folders(config)
}
