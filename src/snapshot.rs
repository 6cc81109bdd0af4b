//! Saving frames to disk.

use std::fs::{self, File};
use std::io::BufWriter;
use std::path::{Path, PathBuf};

use image::ExtendedColorType;
use image::codecs::jpeg::JpegEncoder;
use tracing::info;

use crate::OurResult;
use crate::frame::Frame;

/// Encode `frame` as a JPEG in `directory`, named after the current time
pub fn save_snapshot(frame: &Frame, directory: &Path, quality: u8) -> OurResult<PathBuf> {
    fs::create_dir_all(directory)?;
    let filename = format!(
        "snapshot_{}_{:06}.jpg",
        chrono::Local::now().format("%Y%m%d_%H%M%S_%3f"),
        frame.sequence()
    );
    let path = directory.join(filename);

    let image = frame.to_image()?;
    let writer = BufWriter::new(File::create(&path)?);
    let mut encoder = JpegEncoder::new_with_quality(writer, quality.clamp(1, 100));
    if frame.channels() == 1 {
        let luma = image.to_luma8();
        encoder.encode(&luma, luma.width(), luma.height(), ExtendedColorType::L8)?;
    } else {
        let rgb = image.to_rgb8();
        encoder.encode(&rgb, rgb.width(), rgb.height(), ExtendedColorType::Rgb8)?;
    }

    info!("Saved snapshot {}", path.display());
    Ok(path)
}
