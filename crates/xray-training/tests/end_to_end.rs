//! Full runs over a synthetic 100-record image store.

use std::fs;
use std::path::Path;

use burn::backend::Autodiff;
use burn::module::{Module, Param};
use burn::tensor::{backend::Backend, Tensor};
use burn_ndarray::NdArray;
use image::{ImageBuffer, Luma};
use tempfile::TempDir;
use xray_core::{
    ImbalanceStrategy, MonitorMetric, Result, RunConfig, SinkKind, SplitPolicy, DISEASES,
    NO_FINDING, NUM_DISEASES,
};
use xray_dataset::build_dataset;
use xray_training::sink::METRICS_FILE;
use xray_training::{create_run_dir, open_sink, run_experiment, CheckpointManager, Backbone};

type TestBackend = Autodiff<NdArray>;

/// Same logits for every image
#[derive(Module, Debug)]
struct ConstantModel<B: Backend> {
    bias: Param<Tensor<B, 1>>,
}

impl<B: Backend> ConstantModel<B> {
    fn new(device: &B::Device) -> Self {
        Self {
            bias: Param::from_tensor(Tensor::zeros([NUM_DISEASES], device)),
        }
    }
}

impl<B: Backend> Backbone<B> for ConstantModel<B> {
    fn forward(&self, images: Tensor<B, 4>) -> Tensor<B, 2> {
        let [batch, _, _, _] = images.dims();
        Tensor::zeros([batch, NUM_DISEASES], &images.device()) + self.bias.val().unsqueeze()
    }
}

/// Record `i` has finding `d` iff `i + d` is even; every tenth record is
/// `No Finding`. Patient `p` owns records `2p` and `2p + 1`.
/// Logits follow each image's mean intensity, so scores differ per record
#[derive(Module, Debug)]
struct BrightnessModel<B: Backend> {
    bias: Param<Tensor<B, 1>>,
}

impl<B: Backend> BrightnessModel<B> {
    fn new(device: &B::Device) -> Self {
        Self {
            bias: Param::from_tensor(Tensor::zeros([NUM_DISEASES], device)),
        }
    }
}

impl<B: Backend> Backbone<B> for BrightnessModel<B> {
    fn forward(&self, images: Tensor<B, 4>) -> Tensor<B, 2> {
        let [batch, _, _, _] = images.dims();
        let brightness: Tensor<B, 2> = images.flatten(1, 3).mean_dim(1);
        let brightness: Tensor<B, 2> = brightness.expand([batch, NUM_DISEASES]);
        brightness + self.bias.val().unsqueeze()
    }
}

/// Emits NaN logits for every image
#[derive(Module, Debug)]
struct DivergedModel<B: Backend> {
    bias: Param<Tensor<B, 1>>,
}

impl<B: Backend> DivergedModel<B> {
    fn new(device: &B::Device) -> Self {
        Self {
            bias: Param::from_tensor(Tensor::full([NUM_DISEASES], f32::NAN, device)),
        }
    }
}

impl<B: Backend> Backbone<B> for DivergedModel<B> {
    fn forward(&self, images: Tensor<B, 4>) -> Tensor<B, 2> {
        let [batch, _, _, _] = images.dims();
        Tensor::zeros([batch, NUM_DISEASES], &images.device()) + self.bias.val().unsqueeze()
    }
}

fn write_store(root: &Path) -> Result<()> {
    let mut csv = String::from("Image Index,Finding Labels,Follow-up #,Patient ID,Patient Age\n");
    for i in 0..100usize {
        let name = format!("{i:08}_000.png");
        let folder = root
            .join(format!("images_{:03}", 1 + i / 50))
            .join("images");
        fs::create_dir_all(&folder)?;
        ImageBuffer::from_fn(8, 8, |x, y| Luma([((i + x as usize * y as usize) % 256) as u8]))
            .save(folder.join(&name))?;

        let findings = if i % 10 == 0 {
            NO_FINDING.to_string()
        } else {
            DISEASES
                .iter()
                .enumerate()
                .filter(|(d, _)| (i + d) % 2 == 0)
                .map(|(_, name)| *name)
                .collect::<Vec<_>>()
                .join("|")
        };
        csv.push_str(&format!("{name},{findings},0,{},{}\n", i / 2, 40 + i % 30));
    }
    fs::write(root.join("Data_Entry_2017.csv"), csv)?;
    Ok(())
}

fn small_config(base: RunConfig, root: &Path, output: &Path) -> RunConfig {
    let mut config = base;
    config.data.data_root = root.to_path_buf();
    config.data.folder_end = 2;
    config.output_dir = output.to_path_buf();
    config.image_size = 8;
    config.training.num_epochs = 3;
    config.training.patience = 2;
    config.training.batch_size = 16;
    config.training.num_workers = 2;
    config
}

fn final_line(run_dir: &Path) -> Result<serde_json::Value> {
    let contents = fs::read_to_string(run_dir.join(METRICS_FILE))?;
    let last = contents.lines().last().unwrap_or_default();
    Ok(serde_json::from_str(last)?)
}

#[test]
fn test_oversampling_run_tracks_target_f1() -> Result<()> {
    let data = TempDir::new()?;
    let output = TempDir::new()?;
    write_store(data.path())?;
    let config = small_config(RunConfig::densenet_preset(), data.path(), output.path());
    assert_eq!(config.split_policy, SplitPolicy::RecordLevel);
    assert_eq!(config.imbalance, ImbalanceStrategy::Oversampling);

    let prepared = build_dataset(&config)?;
    assert_eq!(prepared.partitions.test.len(), 20);
    assert_eq!(prepared.partitions.validation.len(), 20);

    let (_, run_dir) = create_run_dir(&config)?;
    let mut sink = open_sink(config.sink, &run_dir);
    let device = Default::default();
    let model = BrightnessModel::<TestBackend>::new(&device);

    let outcome = run_experiment::<TestBackend, _>(
        &config,
        model,
        &prepared,
        &run_dir,
        sink.as_mut(),
        &device,
    )?;

    assert!(outcome.epochs_run >= 1 && outcome.epochs_run <= 3);
    assert!(outcome.best_epoch >= 1 && outcome.best_epoch <= outcome.epochs_run);
    assert!(outcome.best_value > 0.0);
    assert!(outcome.checkpoint.exists());
    assert_eq!(CheckpointManager::latest_in_dir(&run_dir)?, outcome.checkpoint);
    assert!(outcome.test.metrics.target.is_some());
    assert!(run_dir.join("config.toml").exists());

    let last = final_line(&run_dir)?;
    assert_eq!(last["kind"], "final");
    for key in [
        "test_loss",
        "test_auc",
        "test_f1",
        "test_target_f1",
        "test_target_threshold",
        "per_class_auc",
        "per_class_f1",
        "checkpoint",
    ] {
        assert!(last.get(key).is_some(), "missing {key}");
    }
    assert_eq!(last["per_class_auc"].as_object().map(|m| m.len()), Some(NUM_DISEASES));
    Ok(())
}

#[test]
fn test_focal_patient_level_run_tracks_mean_auc() -> Result<()> {
    let data = TempDir::new()?;
    let output = TempDir::new()?;
    write_store(data.path())?;
    let mut config = small_config(RunConfig::vit_preset(), data.path(), output.path());
    config.model.patch_size = 8;
    config.sink = SinkKind::Jsonl;
    assert_eq!(config.monitor, MonitorMetric::MeanAuc);

    let prepared = build_dataset(&config)?;
    assert_eq!(prepared.partitions.train.len(), 60);

    let (_, run_dir) = create_run_dir(&config)?;
    let mut sink = open_sink(config.sink, &run_dir);
    let device = Default::default();

    let outcome = run_experiment::<TestBackend, _>(
        &config,
        ConstantModel::<TestBackend>::new(&device),
        &prepared,
        &run_dir,
        sink.as_mut(),
        &device,
    )?;

    // A constant model ranks nothing, so every class sits at chance
    assert!((outcome.best_value - 0.5).abs() < 1e-9);
    assert!(outcome.test.metrics.target.is_none());
    assert_eq!(outcome.history[0].per_class_auc.len(), NUM_DISEASES);

    let last = final_line(&run_dir)?;
    assert_eq!(last["kind"], "final");
    assert!(last.get("test_target_f1").is_none());
    for key in ["test_loss", "test_auc", "test_f1", "per_class_auc", "per_class_f1"] {
        assert!(last.get(key).is_some(), "missing {key}");
    }
    Ok(())
}

#[test]
fn test_diverged_run_writes_no_checkpoint() -> Result<()> {
    let data = TempDir::new()?;
    let output = TempDir::new()?;
    write_store(data.path())?;
    let config = small_config(RunConfig::densenet_preset(), data.path(), output.path());
    assert_eq!(config.monitor, MonitorMetric::TargetF1);

    let prepared = build_dataset(&config)?;
    let (_, run_dir) = create_run_dir(&config)?;
    let mut sink = open_sink(config.sink, &run_dir);
    let device = Default::default();

    let result = run_experiment::<TestBackend, _>(
        &config,
        DivergedModel::<TestBackend>::new(&device),
        &prepared,
        &run_dir,
        sink.as_mut(),
        &device,
    );

    assert!(matches!(result, Err(xray_core::Error::NoCheckpointFound(_))));
    assert!(matches!(
        CheckpointManager::latest_in_dir(&run_dir),
        Err(xray_core::Error::NoCheckpointFound(_))
    ));
    Ok(())
}

#[test]
fn test_missing_data_root_aborts_before_training() {
    let output = TempDir::new().unwrap();
    let config = small_config(
        RunConfig::densenet_preset(),
        Path::new("/nonexistent/xray/root"),
        output.path(),
    );
    assert!(matches!(
        build_dataset(&config),
        Err(xray_core::Error::ConfigurationMissing(_))
    ));
}
