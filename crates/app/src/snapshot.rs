use std::path::Path;

use anyhow::{Context, Result, anyhow};
use image::{ImageBuffer, Rgb};
use video_ingest::Frame;

/// Write a BGR8 frame to `path`; the format follows the file extension.
pub fn write_snapshot(frame: &Frame, path: &Path) -> Result<()> {
    let rgb: Vec<u8> = frame
        .data
        .chunks_exact(3)
        .flat_map(|px| [px[2], px[1], px[0]])
        .collect();
    let (width, height) = (frame.width as u32, frame.height as u32);
    let image = ImageBuffer::<Rgb<u8>, Vec<u8>>::from_vec(width, height, rgb)
        .ok_or_else(|| anyhow!("frame buffer does not match {width}x{height}"))?;
    image
        .save(path)
        .with_context(|| format!("failed to write snapshot {}", path.display()))?;
    Ok(())
}
