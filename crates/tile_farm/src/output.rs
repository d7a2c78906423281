use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use image::{ImageFormat, RgbaImage};
use tiles::{Framebuffer, Rgba8Framebuffer};

/// `output` itself for a single frame, otherwise `stem_0003.ext`.
pub fn frame_path(output: &Path, frame: u32, frames: u32) -> PathBuf {
    if frames <= 1 {
        return output.to_path_buf();
    }
    let stem = output
        .file_stem()
        .map(|stem| stem.to_string_lossy().into_owned())
        .unwrap_or_else(|| "frame".to_owned());
    let extension = output
        .extension()
        .map(|extension| extension.to_string_lossy().into_owned())
        .unwrap_or_else(|| "png".to_owned());
    output.with_file_name(format!("{stem}_{frame:04}.{extension}"))
}

pub fn write_png(framebuffer: &Rgba8Framebuffer, path: &Path) -> Result<()> {
    let size = framebuffer.size();
    let image = RgbaImage::from_raw(size.width, size.height, framebuffer.as_bytes().to_vec())
        .context("framebuffer bytes do not match its size")?;
    if let Some(parent) = path.parent().filter(|parent| !parent.as_os_str().is_empty()) {
        std::fs::create_dir_all(parent)
            .with_context(|| format!("create output directory {}", parent.display()))?;
    }
    image
        .save_with_format(path, ImageFormat::Png)
        .with_context(|| format!("write {}", path.display()))?;
    log::info!("wrote {}", path.display());
    Ok(())
}
