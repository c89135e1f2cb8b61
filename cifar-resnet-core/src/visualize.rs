use crate::{
    data::{open_image, CifarBatcher},
    dataset::{class_names, CifarDataset, CifarSplit},
    model::{ActivationCapture, ImageClassifier},
    train::load_trained,
};
use anyhow::{anyhow, ensure, Context, Result};
use burn::{data::dataset::Dataset, prelude::*};
use image::{imageops::FilterType, Rgb, RgbImage};
use rand::Rng;
use std::path::{Path, PathBuf};
use tracing::info;

pub(crate) const FILTERS_FILE: &str = "filters.png";
pub(crate) const ACTIVATIONS_FILE: &str = "activations.png";
pub(crate) const DEFAULT_ACTIVATION_LAYER: &str = "layer1.0";

/// A stack of `count` images of `[channels, height, width]` values, row-major.
#[derive(Debug, Clone, PartialEq)]
pub struct TileStack {
    data: Vec<f32>,
    count: usize,
    channels: usize,
    height: usize,
    width: usize,
}

impl TileStack {
    pub fn new(data: Vec<f32>, [count, channels, height, width]: [usize; 4]) -> Result<Self> {
        ensure!(count > 0, "nothing to draw");
        ensure!(
            channels == 1 || channels == 3,
            "tiles must have 1 or 3 channels, got {channels}"
        );
        ensure!(
            data.len() == count * channels * height * width,
            "{} values do not fill {count}x{channels}x{height}x{width} tiles",
            data.len()
        );
        Ok(Self {
            data,
            count,
            channels,
            height,
            width,
        })
    }

    pub fn from_tensor<B: Backend>(tensor: Tensor<B, 4>) -> Result<Self> {
        let dims = tensor.dims();
        let data = tensor
            .into_data()
            .convert::<f32>()
            .to_vec::<f32>()
            .map_err(|err| anyhow!("unexpected tensor data: {err:?}"))?;
        Self::new(data, dims)
    }

    /// Rescales all values together into [0, 1]. A constant stack becomes all zeros.
    pub fn normalized(mut self) -> Self {
        let (min, max) = self
            .data
            .iter()
            .fold((f32::INFINITY, f32::NEG_INFINITY), |(min, max), &v| {
                (min.min(v), max.max(v))
            });
        let range = max - min;
        if range > f32::EPSILON {
            self.data.iter_mut().for_each(|v| *v = (*v - min) / range);
        } else {
            self.data.fill(0.0);
        }
        self
    }

    fn value(&self, tile: usize, channel: usize, row: usize, col: usize) -> f32 {
        self.data[((tile * self.channels + channel) * self.height + row) * self.width + col]
    }
}

#[derive(Debug, Clone)]
pub struct GridOptions {
    /// Tiles per row
    pub nrow: usize,
    pub padding: usize,
    pub normalize: bool,
    /// Nearest-neighbour upscale until the grid is at least this wide
    pub min_width: u32,
}

impl Default for GridOptions {
    fn default() -> Self {
        Self {
            nrow: 8,
            padding: 2,
            normalize: false,
            min_width: 0,
        }
    }
}

/// Lays tiles out row by row on a black background, single-channel tiles drawn as grey.
///
/// Values are expected in [0, 1] and clamped otherwise.
pub fn make_grid(tiles: TileStack, options: &GridOptions) -> RgbImage {
    let tiles = if options.normalize {
        tiles.normalized()
    } else {
        tiles
    };
    let xmaps = options.nrow.clamp(1, tiles.count);
    let ymaps = tiles.count.div_ceil(xmaps);
    let cell_height = tiles.height + options.padding;
    let cell_width = tiles.width + options.padding;
    let mut grid = RgbImage::new(
        (xmaps * cell_width + options.padding) as u32,
        (ymaps * cell_height + options.padding) as u32,
    );

    for tile in 0..tiles.count {
        let top = (tile / xmaps) * cell_height + options.padding;
        let left = (tile % xmaps) * cell_width + options.padding;
        for row in 0..tiles.height {
            for col in 0..tiles.width {
                let pixel = [0, 1, 2].map(|c| {
                    let channel = if tiles.channels == 1 { 0 } else { c };
                    to_u8(tiles.value(tile, channel, row, col))
                });
                grid.put_pixel((left + col) as u32, (top + row) as u32, Rgb(pixel));
            }
        }
    }

    if grid.width() > 0 && grid.width() < options.min_width {
        let scale = options.min_width.div_ceil(grid.width());
        grid = image::imageops::resize(
            &grid,
            grid.width() * scale,
            grid.height() * scale,
            FilterType::Nearest,
        );
    }
    grid
}

fn to_u8(value: f32) -> u8 {
    (value * 255.0 + 0.5).clamp(0.0, 255.0) as u8
}

/// First-layer convolution filters, eight per row.
pub fn render_filters<B: Backend, M: ImageClassifier<B>>(model: &M) -> Result<RgbImage> {
    let filters = TileStack::from_tensor(model.stem_filters())?;
    Ok(make_grid(
        filters,
        &GridOptions {
            nrow: 8,
            padding: 1,
            normalize: true,
            min_width: 512,
        },
    ))
}

/// The first `channels` feature maps `layer` produces for a single image `[1, 3, H, W]`.
pub fn render_activations<B: Backend, M: ImageClassifier<B>>(
    model: &M,
    image: Tensor<B, 4>,
    layer: &str,
    channels: usize,
) -> Result<RgbImage> {
    let names = model.layer_names();
    ensure!(
        names.iter().any(|name| name == layer),
        "unknown layer `{layer}`, expected one of: {}",
        names.join(", ")
    );
    ensure!(channels > 0, "at least one channel must be drawn");

    let mut capture = ActivationCapture::new([layer]);
    model.forward_captured(image, &mut capture);
    let activation = capture
        .take(layer)
        .ok_or_else(|| anyhow!("layer `{layer}` produced no output"))?;
    let [_, available, height, width] = activation.dims();
    let channels = channels.min(available);
    let activation = activation
        .slice([0..1, 0..channels])
        .reshape([channels, 1, height, width]);

    Ok(make_grid(
        TileStack::from_tensor(activation)?,
        &GridOptions {
            nrow: 4,
            padding: 1,
            normalize: true,
            min_width: 512,
        },
    ))
}

/// Where the image fed to [`render_activations`] comes from.
#[derive(Debug, Clone)]
pub enum ActivationSource {
    /// Test split image at this index, a random one when absent
    TestImage(Option<usize>),
    File(PathBuf),
}

fn save(image: &RgbImage, path: &Path) -> Result<()> {
    image
        .save(path)
        .with_context(|| format!("failed to write {}", path.display()))?;
    info!(path = %path.display(), "saved {}x{} image", image.width(), image.height());
    Ok(())
}

/// Renders the first-layer filters of the model in `artifact_dir` to `filters.png` there.
pub(crate) fn save_filters<B: Backend>(
    artifact_dir: impl AsRef<Path>,
    device: &B::Device,
) -> Result<PathBuf> {
    let artifact_dir = artifact_dir.as_ref();
    let (_, model) = load_trained::<B>(artifact_dir, device)?;
    let path = artifact_dir.join(FILTERS_FILE);
    save(&render_filters(&model)?, &path)?;
    Ok(path)
}

/// Renders activations of `layer` of the model in `artifact_dir` to `activations.png` there.
pub(crate) fn save_activations<B: Backend>(
    artifact_dir: impl AsRef<Path>,
    source: &ActivationSource,
    layer: &str,
    channels: usize,
    device: &B::Device,
) -> Result<PathBuf> {
    let artifact_dir = artifact_dir.as_ref();
    let (config, model) = load_trained::<B>(artifact_dir, device)?;

    let pixels = match source {
        ActivationSource::TestImage(index) => {
            let test_set = CifarDataset::new(&config.data_dir, CifarSplit::Test)?;
            let index = index.unwrap_or_else(|| rand::thread_rng().gen_range(0..test_set.len()));
            let item = test_set
                .get(index)
                .ok_or_else(|| anyhow!("test set has {} images, no index {index}", test_set.len()))?;
            let class = class_names(&config.data_dir)
                .get(item.label as usize)
                .cloned()
                .unwrap_or_default();
            info!(index, class = %class, "capturing activations of a test image");
            item.image
        }
        ActivationSource::File(path) => open_image(path)?,
    };
    let image = CifarBatcher::<B>::new(device.clone()).images(std::iter::once(pixels.as_slice()));

    let path = artifact_dir.join(ACTIVATIONS_FILE);
    save(&render_activations(&model, image, layer, channels)?, &path)?;
    Ok(path)
}
