use crate::{
    data::{CifarBatcher, ImageFileDataset},
    dataset::class_names,
    model::ImageClassifier,
    train::load_trained,
};
use anyhow::{anyhow, ensure, Result};
use burn::{data::dataloader::DataLoaderBuilder, prelude::*, tensor::activation::softmax};
use clap::ValueEnum;
use serde::{Deserialize, Serialize};
use std::{collections::BTreeMap, fmt, path::PathBuf};
use tracing::info;

#[derive(Debug, Clone, Default, ValueEnum, Serialize, Deserialize)]
pub enum Output {
    #[default]
    Tty,
    Json,
}

#[derive(Config, Debug)]
pub struct PredictConfig {
    /// Image file or directory searched recursively
    input: PathBuf,
    output: Output,
    #[config(default = 3)]
    top_k: usize,
    #[config(default = 32)]
    batch_size: usize,
    #[config(default = 4)]
    num_workers: usize,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
struct Guess {
    class: String,
    probability: f32,
}

impl fmt::Display for Guess {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}\t{:.4}", self.class, self.probability)
    }
}

type JsonOutput = BTreeMap<PathBuf, Vec<Guess>>;

/// The `k` most probable classes of one image, most probable first.
fn top_k(probabilities: &[f32], class_names: &[String], k: usize) -> Vec<Guess> {
    let mut ranked = probabilities.iter().copied().enumerate().collect::<Vec<_>>();
    ranked.sort_by(|(_, a), (_, b)| b.total_cmp(a));
    ranked
        .into_iter()
        .take(k)
        .map(|(i, probability)| Guess {
            class: class_names
                .get(i)
                .cloned()
                .unwrap_or_else(|| i.to_string()),
            probability,
        })
        .collect()
}

/// The `top_k` guesses for every image under `config.input`, by the model trained in
/// `artifact_dir`.
fn classify<B: Backend>(
    artifact_dir: impl AsRef<std::path::Path>,
    config: &PredictConfig,
    device: B::Device,
) -> Result<JsonOutput> {
    ensure!(config.top_k > 0, "top_k must be positive");
    let (training, model) = load_trained::<B>(artifact_dir, &device)?;
    let classes = class_names(&training.data_dir);
    let num_classes = training.model.num_classes();

    let images = ImageFileDataset::new(&config.input)?;
    let dataloader_predict = DataLoaderBuilder::new(CifarBatcher::<B>::new(device.clone()))
        .batch_size(config.batch_size)
        .num_workers(config.num_workers)
        .build(images);

    let mut output = JsonOutput::new();
    for batch in dataloader_predict.iter() {
        let probabilities = softmax(model.forward(batch.images), 1)
            .into_data()
            .convert::<f32>()
            .to_vec::<f32>()
            .map_err(|err| anyhow!("unexpected prediction data: {err:?}"))?;
        for (path, probabilities) in batch.paths.into_iter().zip(probabilities.chunks(num_classes)) {
            output.insert(path, top_k(probabilities, &classes, config.top_k));
        }
    }
    info!(images = output.len(), "prediction finished");
    Ok(output)
}

/// One line per image path, each followed by its guesses indented as `class\tprobability`.
fn tty_report(output: &JsonOutput) -> String {
    let mut report = String::new();
    for (path, guesses) in output {
        report.push_str(&format!("{}\n", path.display()));
        for guess in guesses {
            report.push_str(&format!("\t{guess}\n"));
        }
    }
    report
}

/// Classifies every image under `config.input` with the model trained in `artifact_dir`.
pub fn predict<B: Backend>(
    artifact_dir: impl AsRef<std::path::Path>,
    config: PredictConfig,
    device: B::Device,
) -> Result<()> {
    let output = classify::<B>(artifact_dir, &config, device)?;
    match config.output {
        Output::Tty => print!("{}", tty_report(&output)),
        Output::Json => {
            serde_json::to_writer_pretty(std::io::stdout(), &output)?;
            println!();
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{dataset::CIFAR10_CLASSES, train::tests::saved_run};
    use burn::backend::NdArray;
    use image::{Rgb, RgbImage};

    type TestBackend = NdArray<f32>;

    #[test]
    fn test_classify_images_of_a_directory() {
        let dir = tempfile::tempdir().unwrap();
        saved_run(dir.path());
        let input = dir.path().join("images");
        std::fs::create_dir_all(input.join("nested")).unwrap();
        RgbImage::from_pixel(32, 32, Rgb([0, 0, 255])).save(input.join("a.png")).unwrap();
        RgbImage::from_pixel(64, 48, Rgb([0, 255, 0])).save(input.join("nested/b.jpg")).unwrap();
        std::fs::write(input.join("readme.txt"), "not an image").unwrap();

        let config = PredictConfig::new(input.clone(), Output::Json).with_top_k(4);
        let output = classify::<TestBackend>(dir.path(), &config, Default::default()).unwrap();

        assert_eq!(
            output.keys().cloned().collect::<Vec<_>>(),
            vec![input.join("a.png"), input.join("nested/b.jpg")]
        );
        for guesses in output.values() {
            assert_eq!(guesses.len(), 4);
            assert!(guesses.windows(2).all(|w| w[0].probability >= w[1].probability));
            assert!(guesses.iter().all(|g| CIFAR10_CLASSES.contains(&g.class.as_str())));
            let total = guesses.iter().map(|g| g.probability).sum::<f32>();
            assert!(total > 0.0 && total <= 1.0 + 1e-5);
        }
    }

    #[test]
    fn test_classify_rejects_bad_input() {
        let dir = tempfile::tempdir().unwrap();
        saved_run(dir.path());

        let missing = PredictConfig::new(dir.path().join("nowhere"), Output::Tty);
        assert!(classify::<TestBackend>(dir.path(), &missing, Default::default()).is_err());

        let zero = PredictConfig::new(dir.path().to_path_buf(), Output::Tty).with_top_k(0);
        assert!(classify::<TestBackend>(dir.path(), &zero, Default::default()).is_err());
    }

    #[test]
    fn test_top_k_orders_by_probability() {
        let names = ["cat", "dog", "ship"].map(String::from);
        let guesses = top_k(&[0.2, 0.5, 0.3], &names, 2);
        assert_eq!(
            guesses,
            vec![
                Guess {
                    class: "dog".into(),
                    probability: 0.5
                },
                Guess {
                    class: "ship".into(),
                    probability: 0.3
                },
            ]
        );
    }

    #[test]
    fn test_top_k_beyond_class_count() {
        let guesses = top_k(&[0.9, 0.1], &[], 5);
        assert_eq!(guesses.len(), 2);
        assert_eq!(guesses[0].class, "0");
        assert_eq!(guesses[1].to_string(), "1\t0.1000");
    }

    #[test]
    fn test_tty_report_lists_every_guess() {
        let guesses = top_k(&[0.7, 0.2, 0.1], &["cat", "dog", "ship"].map(String::from), 2);
        let output = JsonOutput::from([(PathBuf::from("img/a.png"), guesses)]);
        assert_eq!(tty_report(&output), "img/a.png\n\tcat\t0.7000\n\tdog\t0.2000\n");
    }

    #[test]
    fn test_predict_config_defaults() {
        let config = PredictConfig::new("images".into(), Output::Json);
        assert_eq!(config.top_k, 3);
        assert_eq!(config.batch_size, 32);
    }
}
