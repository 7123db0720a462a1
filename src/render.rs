use crate::{dataset::denormalize_pixel, result::Result};
use anyhow::{anyhow, bail, ensure, Context};
use candle_core::{DType, Tensor};
use image::{
    codecs::gif::{GifEncoder, Repeat},
    Delay, Frame, GrayImage,
};
use std::{
    fs::{self, File},
    io::BufWriter,
    path::{Path, PathBuf},
};
use tracing::debug;

/// File name prefix of the per epoch images.
pub const EPOCH_IMAGE_PREFIX: &str = "image_at_epoch_";

/// The path of the image for `epoch`, ie "image_at_epoch_0007.png".
pub fn epoch_image_path(dir: impl AsRef<Path>, epoch: usize) -> PathBuf {
    dir.as_ref()
        .join(format!("{EPOCH_IMAGE_PREFIX}{epoch:04}.png"))
}

/// Tiles images into a square grid.
///
/// `images` has shape \[n, 1, height, width\] with values in \[-1, 1\]. The grid has
/// `ceil(sqrt(n))` columns, unused tiles are black.
pub fn grid(images: &Tensor) -> Result<GrayImage> {
    let (n, c, h, w) = images.dims4()?;
    ensure!(c == 1, "expected 1 channel, found {c}!");
    ensure!(n > 0, "no images to render!");
    let cols = (n as f64).sqrt().ceil() as usize;
    let rows = (n + cols - 1) / cols;
    let pixels = images
        .to_dtype(DType::F32)?
        .flatten_all()?
        .to_vec1::<f32>()?;
    let mut grid = GrayImage::new((cols * w) as u32, (rows * h) as u32);
    for (i, image) in pixels.chunks_exact(h * w).enumerate() {
        let (x0, y0) = ((i % cols) * w, (i / cols) * h);
        for (j, x) in image.iter().enumerate() {
            let (x, y, value) = (x0 + j % w, y0 + j / w, denormalize_pixel(*x));
            grid.put_pixel(x as u32, y as u32, image::Luma([value]));
        }
    }
    Ok(grid)
}

/// Renders `images` with [`grid`] and saves them as a png.
pub fn save_grid(images: &Tensor, path: impl AsRef<Path>) -> Result<()> {
    let path = path.as_ref();
    grid(images)?
        .save(path)
        .with_context(|| format!("failed to save {}", path.display()))?;
    debug!(path = %path.display(), "saved samples");
    Ok(())
}

/// Assembles the per epoch images in `dir` into an endlessly looping gif.
///
/// Frames are the files named "image_at_epoch_*.png", in lexicographic order.
/// Returns the number of frames.
///
/// **Errors**
/// - There are no images.
/// - The images differ in size.
pub fn save_animation(dir: impl AsRef<Path>, output: impl AsRef<Path>) -> Result<usize> {
    let dir = dir.as_ref();
    let output = output.as_ref();
    let mut paths = Vec::new();
    for entry in fs::read_dir(dir).with_context(|| format!("failed to read {}", dir.display()))? {
        let path = entry?.path();
        let is_frame = path
            .file_name()
            .and_then(|name| name.to_str())
            .map_or(false, |name| {
                name.starts_with(EPOCH_IMAGE_PREFIX) && name.ends_with(".png")
            });
        if is_frame {
            paths.push(path);
        }
    }
    paths.sort();
    if paths.is_empty() {
        bail!("no images found in {}!", dir.display());
    }
    let file = File::create(output)
        .with_context(|| format!("failed to create {}", output.display()))?;
    let mut encoder = GifEncoder::new(BufWriter::new(file));
    encoder.set_repeat(Repeat::Infinite)?;
    let mut size = None;
    for path in paths.iter() {
        let frame = image::open(path)
            .with_context(|| format!("failed to open {}", path.display()))?
            .to_rgba8();
        let dimensions = frame.dimensions();
        if *size.get_or_insert(dimensions) != dimensions {
            return Err(anyhow!(
                "{} is {dimensions:?}, expected {:?}!",
                path.display(),
                size.unwrap_or_default()
            ));
        }
        encoder.encode_frame(Frame::from_parts(
            frame,
            0,
            0,
            Delay::from_numer_denom_ms(100, 1),
        ))?;
    }
    debug!(path = %output.display(), frames = paths.len(), "saved animation");
    Ok(paths.len())
}
