use crate::dataset::{CifarItem, CHANNELS, IMAGE_BYTES, IMAGE_SIZE};
use anyhow::{Context, Result};
use burn::{
    data::{dataloader::batcher::Batcher, dataset::Dataset},
    prelude::*,
    tensor::ElementConversion,
};
use image::imageops::FilterType;
use mime_guess::MimeGuess;
use std::path::{Path, PathBuf};
use tracing::{debug, warn};

// Same normalisation for every channel: [0, 1] -> [-1, 1]
const MEAN: f32 = 0.5;
const STD: f32 = 0.5;

#[derive(Clone)]
pub(crate) struct CifarBatcher<B: Backend> {
    device: B::Device,
}

#[derive(Debug, Clone)]
pub struct CifarBatch<B: Backend> {
    /// `[batch_size, 3, 32, 32]`
    pub images: Tensor<B, 4>,
    /// `[batch_size]`
    pub targets: Tensor<B, 1, Int>,
}

#[derive(Debug, Clone)]
pub(crate) struct ImageFileBatch<B: Backend> {
    pub images: Tensor<B, 4>,
    pub paths: Vec<PathBuf>,
}

impl<B: Backend> CifarBatcher<B> {
    pub(crate) fn new(device: B::Device) -> Self {
        Self { device }
    }

    /// Stacks channel-first `u8` images into a normalised `[n, 3, 32, 32]` tensor.
    pub(crate) fn images<'a>(&self, images: impl ExactSizeIterator<Item = &'a [u8]>) -> Tensor<B, 4> {
        let n = images.len();
        let data = images
            .flat_map(|pixels| pixels.iter())
            .map(|&p| (p as f32 / 255.0 - MEAN) / STD)
            .collect::<Vec<_>>();
        Tensor::from_data(
            TensorData::new(data, [n, CHANNELS, IMAGE_SIZE, IMAGE_SIZE]),
            &self.device,
        )
    }
}

impl<B: Backend> Batcher<CifarItem, CifarBatch<B>> for CifarBatcher<B> {
    fn batch(&self, items: Vec<CifarItem>) -> CifarBatch<B> {
        let images = self.images(items.iter().map(|item| item.image.as_slice()));
        let targets = items
            .iter()
            .map(|item| (item.label as i64).elem::<B::IntElem>())
            .collect::<Vec<_>>();
        let targets = Tensor::from_data(TensorData::new(targets, [items.len()]), &self.device);

        CifarBatch { images, targets }
    }
}

#[derive(Debug, Clone)]
pub(crate) struct ImageFileItem {
    pixels: Vec<u8>,
    path: PathBuf,
}

impl<B: Backend> Batcher<ImageFileItem, ImageFileBatch<B>> for CifarBatcher<B> {
    fn batch(&self, items: Vec<ImageFileItem>) -> ImageFileBatch<B> {
        ImageFileBatch {
            images: self.images(items.iter().map(|item| item.pixels.as_slice())),
            paths: items.into_iter().map(|item| item.path).collect(),
        }
    }
}

/// Every decodable image under a directory, resized to the CIFAR-10 resolution.
pub(crate) struct ImageFileDataset {
    items: Vec<ImageFileItem>,
}

impl ImageFileDataset {
    pub(crate) fn new(root: impl AsRef<Path>) -> Result<Self> {
        let root = root.as_ref();
        anyhow::ensure!(root.exists(), "{} does not exist", root.display());
        let items = walkdir::WalkDir::new(root)
            .sort_by_file_name()
            .into_iter()
            .filter_map(|res| res.ok())
            .filter(|e| e.file_type().is_file())
            .filter(|e| {
                matches!(MimeGuess::from_path(e.path()).first(), Some(mime) if mime.type_() == "image")
            })
            .filter_map(|e| match open_image(e.path()) {
                Ok(pixels) => Some(ImageFileItem {
                    pixels,
                    path: e.into_path(),
                }),
                Err(err) => {
                    warn!(path = %e.path().display(), "skipping undecodable image: {err:#}");
                    None
                }
            })
            .collect::<Vec<_>>();
        debug!(root = %root.display(), images = items.len(), "collected images");
        Ok(Self { items })
    }
}

impl Dataset<ImageFileItem> for ImageFileDataset {
    fn get(&self, index: usize) -> Option<ImageFileItem> {
        self.items.get(index).cloned()
    }

    fn len(&self) -> usize {
        self.items.len()
    }
}

/// Decodes an image file into channel-first 32x32 RGB bytes.
pub(crate) fn open_image(path: impl AsRef<Path>) -> Result<Vec<u8>> {
    let path = path.as_ref();
    let size = IMAGE_SIZE as u32;
    let rgb = image::open(path)
        .with_context(|| format!("failed to open {}", path.display()))?
        .resize_exact(size, size, FilterType::Triangle)
        .to_rgb8()
        .into_raw();
    let plane = IMAGE_SIZE * IMAGE_SIZE;
    let mut chw = vec![0; IMAGE_BYTES];
    for (i, pixel) in rgb.chunks_exact(CHANNELS).enumerate() {
        for (c, &value) in pixel.iter().enumerate() {
            chw[c * plane + i] = value;
        }
    }
    Ok(chw)
}

#[cfg(test)]
mod tests {
    use super::*;
    use burn::backend::NdArray;
    use image::{Rgb, RgbImage};

    type TestBackend = NdArray<f32>;

    #[test]
    fn test_batch_normalises_to_unit_range() {
        let batcher = CifarBatcher::<TestBackend>::new(Default::default());
        let items = vec![
            CifarItem {
                image: vec![0; IMAGE_BYTES],
                label: 1,
            },
            CifarItem {
                image: vec![255; IMAGE_BYTES],
                label: 8,
            },
        ];
        let batch = batcher.batch(items);
        assert_eq!(batch.images.dims(), [2, 3, 32, 32]);

        let values = batch.images.into_data().to_vec::<f32>().unwrap();
        assert_eq!(values[0], -1.0);
        assert_eq!(values[IMAGE_BYTES], 1.0);

        let targets = batch.targets.into_data().to_vec::<i64>().unwrap();
        assert_eq!(targets, vec![1, 8]);
    }

    #[test]
    fn test_open_image_is_channel_first() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("red.png");
        RgbImage::from_pixel(64, 48, Rgb([255, 0, 10]))
            .save(&path)
            .unwrap();

        let pixels = open_image(&path).unwrap();
        assert_eq!(pixels.len(), IMAGE_BYTES);
        let plane = IMAGE_SIZE * IMAGE_SIZE;
        assert!(pixels[..plane].iter().all(|&p| p == 255));
        assert!(pixels[plane..2 * plane].iter().all(|&p| p == 0));
        assert!(pixels[2 * plane..].iter().all(|&p| p == 10));
    }

    #[test]
    fn test_image_file_dataset_skips_non_images() {
        let dir = tempfile::tempdir().unwrap();
        RgbImage::new(8, 8).save(dir.path().join("a.png")).unwrap();
        RgbImage::new(40, 40).save(dir.path().join("b.jpg")).unwrap();
        std::fs::write(dir.path().join("notes.txt"), "not an image").unwrap();
        std::fs::write(dir.path().join("broken.png"), "not a png").unwrap();

        let dataset = ImageFileDataset::new(dir.path()).unwrap();
        assert_eq!(dataset.len(), 2);
        assert!(dataset.get(0).unwrap().path.ends_with("a.png"));

        let batcher = CifarBatcher::<TestBackend>::new(Default::default());
        let batch: ImageFileBatch<TestBackend> =
            batcher.batch(vec![dataset.get(0).unwrap(), dataset.get(1).unwrap()]);
        assert_eq!(batch.images.dims(), [2, 3, 32, 32]);
        assert_eq!(batch.paths.len(), 2);
    }
}
