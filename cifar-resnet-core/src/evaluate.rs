use crate::{
    data::{CifarBatch, CifarBatcher},
    dataset::{class_names, CifarDataset, CifarSplit},
    model::ImageClassifier,
    train::load_trained,
};
use anyhow::{anyhow, Context, Result};
use burn::{data::dataloader::DataLoaderBuilder, prelude::*};
use serde::{Deserialize, Serialize};
use std::{fs::File, path::Path};
use tracing::{debug, info};

pub(crate) const EVALUATION_FILE: &str = "evaluation.json";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ClassAccuracy {
    pub class: String,
    pub correct: usize,
    pub total: usize,
    /// Percent
    pub accuracy: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EvaluationReport {
    pub correct: usize,
    pub total: usize,
    /// Percent
    pub accuracy: f64,
    pub per_class: Vec<ClassAccuracy>,
}

fn percent(correct: usize, total: usize) -> f64 {
    if total == 0 {
        0.0
    } else {
        100.0 * correct as f64 / total as f64
    }
}

/// Running per-class counts of correct predictions.
#[derive(Debug, Default)]
struct Tally {
    correct: Vec<usize>,
    total: Vec<usize>,
}

impl Tally {
    fn new(num_classes: usize) -> Self {
        Self {
            correct: vec![0; num_classes],
            total: vec![0; num_classes],
        }
    }

    fn add(&mut self, predictions: &[i64], targets: &[i64]) {
        for (&prediction, &target) in predictions.iter().zip(targets) {
            let Ok(class) = usize::try_from(target) else {
                continue;
            };
            if class >= self.total.len() {
                self.correct.resize(class + 1, 0);
                self.total.resize(class + 1, 0);
            }
            self.total[class] += 1;
            if prediction == target {
                self.correct[class] += 1;
            }
        }
    }

    fn report(self, class_names: &[String]) -> EvaluationReport {
        let correct = self.correct.iter().sum();
        let total = self.total.iter().sum();
        let per_class = self
            .correct
            .into_iter()
            .zip(self.total)
            .enumerate()
            .map(|(i, (correct, total))| ClassAccuracy {
                class: class_names
                    .get(i)
                    .cloned()
                    .unwrap_or_else(|| i.to_string()),
                correct,
                total,
                accuracy: percent(correct, total),
            })
            .collect();
        EvaluationReport {
            correct,
            total,
            accuracy: percent(correct, total),
            per_class,
        }
    }
}

/// Counts arg-max predictions matching the targets over every batch.
pub(crate) fn evaluate_model<B: Backend, M: ImageClassifier<B>>(
    model: &M,
    batches: impl Iterator<Item = CifarBatch<B>>,
    class_names: &[String],
) -> Result<EvaluationReport> {
    let mut tally = Tally::new(class_names.len());
    for batch in batches {
        let predictions = model.forward(batch.images).argmax(1).flatten::<1>(0, 1);
        let predictions = predictions
            .into_data()
            .convert::<i64>()
            .to_vec::<i64>()
            .map_err(|err| anyhow!("unexpected prediction data: {err:?}"))?;
        let targets = batch
            .targets
            .into_data()
            .convert::<i64>()
            .to_vec::<i64>()
            .map_err(|err| anyhow!("unexpected target data: {err:?}"))?;
        tally.add(&predictions, &targets);
    }
    Ok(tally.report(class_names))
}

/// Test accuracy of the model saved in `artifact_dir`, also written to `evaluation.json` there.
pub fn evaluate<B: Backend>(
    artifact_dir: impl AsRef<Path>,
    device: &B::Device,
) -> Result<EvaluationReport> {
    let artifact_dir = artifact_dir.as_ref();
    let (config, model) = load_trained::<B>(artifact_dir, device)?;
    let test_set = CifarDataset::new(&config.data_dir, CifarSplit::Test)
        .context("Test set failed to be loaded")?;
    let dataloader_test = DataLoaderBuilder::new(CifarBatcher::<B>::new(device.clone()))
        .batch_size(config.batch_size)
        .num_workers(config.num_workers)
        .build(test_set);

    let report = evaluate_model(
        &model,
        dataloader_test.iter(),
        &class_names(&config.data_dir),
    )?;
    for class in &report.per_class {
        debug!(class = %class.class, correct = class.correct, total = class.total, "{:.2}%", class.accuracy);
    }
    info!("Test Accuracy: {:.2}%", report.accuracy);

    let path = artifact_dir.join(EVALUATION_FILE);
    let file = File::create(&path).with_context(|| format!("failed to create {}", path.display()))?;
    serde_json::to_writer_pretty(file, &report)?;
    Ok(report)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{model::ActivationCapture, train::tests::saved_run};
    use burn::backend::NdArray;

    type TestBackend = NdArray<f32>;

    /// Always predicts the same class.
    struct ConstantClassifier {
        class: usize,
        num_classes: usize,
    }

    impl<B: Backend> ImageClassifier<B> for ConstantClassifier {
        fn forward(&self, images: Tensor<B, 4>) -> Tensor<B, 2> {
            let [batch_size, ..] = images.dims();
            let mut logits = vec![0.0f32; batch_size * self.num_classes];
            for row in logits.chunks_mut(self.num_classes) {
                row[self.class] = 1.0;
            }
            Tensor::from_data(
                TensorData::new(logits, [batch_size, self.num_classes]),
                &images.device(),
            )
        }

        fn forward_captured(
            &self,
            images: Tensor<B, 4>,
            _capture: &mut ActivationCapture<B>,
        ) -> Tensor<B, 2> {
            ImageClassifier::<B>::forward(self, images)
        }

        fn stem_filters(&self) -> Tensor<B, 4> {
            unimplemented!()
        }

        fn layer_names(&self) -> Vec<String> {
            vec![]
        }
    }

    fn batch(targets: &[i64]) -> CifarBatch<TestBackend> {
        let device = Default::default();
        CifarBatch {
            images: Tensor::zeros([targets.len(), 3, 32, 32], &device),
            targets: Tensor::from_data(TensorData::new(targets.to_vec(), [targets.len()]), &device),
        }
    }

    #[test]
    fn test_evaluate_model_counts_per_class() {
        let names = ["a", "b", "c"].map(String::from);
        let model = ConstantClassifier {
            class: 1,
            num_classes: 3,
        };
        let batches = vec![batch(&[1, 1, 0]), batch(&[2, 1])];

        let report = evaluate_model(&model, batches.into_iter(), &names).unwrap();

        assert_eq!(report.correct, 3);
        assert_eq!(report.total, 5);
        assert_eq!(report.accuracy, 60.0);
        assert_eq!(report.per_class[1].class, "b");
        assert_eq!(report.per_class[1].accuracy, 100.0);
        assert_eq!(report.per_class[0].accuracy, 0.0);
        assert_eq!(report.per_class[2].total, 1);
    }

    #[test]
    fn test_empty_evaluation_is_zero() {
        let report = Tally::new(10).report(&[]);
        assert_eq!(report.total, 0);
        assert_eq!(report.accuracy, 0.0);
        assert_eq!(report.per_class[4].class, "4");
    }

    #[test]
    fn test_evaluate_writes_report() {
        let dir = tempfile::tempdir().unwrap();
        saved_run(dir.path());

        let report = evaluate::<TestBackend>(dir.path(), &Default::default()).unwrap();
        assert_eq!(report.total, 3);
        assert_eq!(report.per_class.len(), 10);
        assert_eq!(report.per_class[3].class, "cat");
        assert_eq!(report.per_class[3].total, 2);
        assert_eq!(report.per_class[7].total, 1);

        let written: EvaluationReport =
            serde_json::from_reader(File::open(dir.path().join(EVALUATION_FILE)).unwrap()).unwrap();
        assert_eq!(written, report);
    }

    #[test]
    fn test_evaluate_without_run() {
        let dir = tempfile::tempdir().unwrap();
        assert!(evaluate::<TestBackend>(dir.path(), &Default::default()).is_err());
        assert!(!dir.path().join(EVALUATION_FILE).exists());
    }
}
