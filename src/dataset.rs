use crate::result::Result;
use anyhow::{anyhow, ensure};
use candle_core::{Device, Tensor};
use ndarray::{Array, Array1, Array4, ArrayView1, ArrayView4, Axis};
use rand::{seq::SliceRandom, Rng};
use rayon::prelude::*;
use std::ops::Range;

/// The MNIST dataset.
pub mod mnist;

/// Maps pixels from \[0, 255\] to \[-1, 1\].
pub fn normalize_pixel(x: u8) -> f32 {
    (x as f32 - 127.5) / 127.5
}

/// Maps values from \[-1, 1\] back to pixels, clamping values outside the range.
pub fn denormalize_pixel(x: f32) -> u8 {
    (x * 127.5 + 127.5).round().clamp(0., 255.) as u8
}

/// Converts u8 images to a normalized f32 tensor with the same shape.
pub fn images_to_tensor(images: ArrayView4<u8>, device: &Device) -> Result<Tensor> {
    let images = images.as_standard_layout();
    let pixels = images
        .as_slice()
        .ok_or_else(|| anyhow!("images are not contiguous!"))?;
    let data: Vec<f32> = pixels.par_iter().copied().map(normalize_pixel).collect();
    Ok(Tensor::from_vec(data, images.dim(), device)?)
}

/// Converts classes to a u32 tensor.
pub fn classes_to_tensor(classes: ArrayView1<u8>, device: &Device) -> Result<Tensor> {
    let data: Vec<u32> = classes.iter().map(|c| *c as u32).collect();
    Ok(Tensor::from_vec(data, classes.len(), device)?)
}

/// Selects a class balanced subset.
///
/// Each of the `classes` classes contributes `samples / classes` items, drawn uniformly with
/// replacement from the items of that class.
///
/// **Errors**
/// - `samples` is not a multiple of `classes`.
/// - A class has no items.
pub fn select_balanced<R: Rng>(
    images: ArrayView4<u8>,
    targets: ArrayView1<u8>,
    samples: usize,
    classes: usize,
    rng: &mut R,
) -> Result<(Array4<u8>, Array1<u8>)> {
    ensure!(
        classes > 0 && samples % classes == 0,
        "{samples} samples cannot be split into {classes} classes!"
    );
    let per_class = samples / classes;
    let mut indices = Vec::with_capacity(samples);
    let mut selected_classes = Vec::with_capacity(samples);
    for class in 0..classes {
        let in_class: Vec<usize> = targets
            .iter()
            .enumerate()
            .filter(|(_, t)| **t as usize == class)
            .map(|(i, _)| i)
            .collect();
        ensure!(!in_class.is_empty(), "no samples for class {class}!");
        for _ in 0..per_class {
            indices.push(in_class[rng.gen_range(0..in_class.len())]);
            selected_classes.push(class as u8);
        }
    }
    Ok((images.select(Axis(0), &indices), Array::from(selected_classes)))
}

/// A batch of images and optionally their classes.
#[derive(Debug)]
pub struct Batch {
    /// Normalized images, shape = \[batch_size, channels, height, width\].
    pub images: Tensor,
    /// Classes, shape = \[batch_size\].
    pub classes: Option<Tensor>,
}

/// Iterator over batches of images.
///
/// The last batch may be smaller than the batch size.
pub struct Batches<'a> {
    images: ArrayView4<'a, u8>,
    classes: Option<ArrayView1<'a, u8>>,
    indices: Vec<usize>,
    offsets: std::iter::StepBy<Range<usize>>,
    batch_size: usize,
    device: Device,
}

impl<'a> Batches<'a> {
    /// Batches `images` in order.
    pub fn new(images: ArrayView4<'a, u8>, batch_size: usize, device: &Device) -> Self {
        let len = images.dim().0;
        let batch_size = batch_size.max(1);
        Self {
            images,
            classes: None,
            indices: (0..len).collect(),
            offsets: (0..len).step_by(batch_size),
            batch_size,
            device: device.clone(),
        }
    }
    /// Includes the classes in each batch.
    ///
    /// **Errors**
    /// - The number of classes does not match the number of images.
    pub fn with_classes(self, classes: ArrayView1<'a, u8>) -> Result<Self> {
        ensure!(classes.len() == self.images.dim().0);
        Ok(Self {
            classes: Some(classes),
            ..self
        })
    }
    /// Shuffles the order of the samples.
    pub fn shuffled<R: Rng>(mut self, rng: &mut R) -> Self {
        self.indices.shuffle(rng);
        self
    }
    fn batch(&self, offset: usize) -> Result<Batch> {
        let end = (offset + self.batch_size).min(self.indices.len());
        let indices = &self.indices[offset..end];
        let images = self.images.select(Axis(0), indices);
        let images = images_to_tensor(images.view(), &self.device)?;
        let classes = if let Some(classes) = self.classes.as_ref() {
            let classes = classes.select(Axis(0), indices);
            Some(classes_to_tensor(classes.view(), &self.device)?)
        } else {
            None
        };
        Ok(Batch { images, classes })
    }
}

impl Iterator for Batches<'_> {
    type Item = Result<Batch>;
    fn next(&mut self) -> Option<Self::Item> {
        let offset = self.offsets.next()?;
        Some(self.batch(offset))
    }
    fn size_hint(&self) -> (usize, Option<usize>) {
        self.offsets.size_hint()
    }
}

impl ExactSizeIterator for Batches<'_> {}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::{rngs::StdRng, SeedableRng};

    fn labeled(n: usize) -> (Array4<u8>, Array1<u8>) {
        let images = Array4::from_shape_fn([n, 1, 28, 28], |(i, _, _, _)| i as u8);
        let classes = Array1::from_shape_fn(n, |i| (i % 10) as u8);
        (images, classes)
    }

    #[test]
    fn pixel_range() {
        assert_eq!(normalize_pixel(0), -1.);
        assert_eq!(normalize_pixel(255), 1.);
        assert_eq!(denormalize_pixel(-1.), 0);
        assert_eq!(denormalize_pixel(1.), 255);
        assert_eq!(denormalize_pixel(3.), 255);
        for x in [0u8, 17, 128, 254] {
            assert_eq!(denormalize_pixel(normalize_pixel(x)), x);
        }
    }

    #[test]
    fn balanced_subset() -> Result<()> {
        let (images, classes) = labeled(200);
        let mut rng = StdRng::seed_from_u64(0);
        let (x, t) = select_balanced(images.view(), classes.view(), 50, 10, &mut rng)?;
        assert_eq!(x.dim(), (50, 1, 28, 28));
        for class in 0..10u8 {
            assert_eq!(t.iter().filter(|c| **c == class).count(), 5);
        }
        for (x, t) in x.outer_iter().zip(t.iter()) {
            assert_eq!(x[[0, 0, 0]] % 10, *t);
        }
        Ok(())
    }

    #[test]
    fn balanced_subset_errors() {
        let (images, classes) = labeled(5);
        let mut rng = StdRng::seed_from_u64(0);
        assert!(select_balanced(images.view(), classes.view(), 10, 10, &mut rng).is_err());
        assert!(select_balanced(images.view(), classes.view(), 15, 10, &mut rng).is_err());
    }

    #[test]
    fn batches_cover_all() -> Result<()> {
        let (images, classes) = labeled(25);
        let mut rng = StdRng::seed_from_u64(1);
        let batches = Batches::new(images.view(), 10, &Device::Cpu)
            .with_classes(classes.view())?
            .shuffled(&mut rng);
        assert_eq!(batches.len(), 3);
        let mut seen = Vec::new();
        for batch in batches {
            let Batch { images, classes } = batch?;
            let classes = classes.unwrap().to_vec1::<u32>()?;
            assert_eq!(images.dims()[0], classes.len());
            assert_eq!(&images.dims()[1..], &[1, 28, 28]);
            seen.extend(classes);
        }
        assert_eq!(seen.len(), 25);
        Ok(())
    }
}
