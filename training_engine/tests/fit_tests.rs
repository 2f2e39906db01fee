// training_engine/tests/fit_tests.rs

mod common;

use std::fs;

use common::{tiny_network_config, tiny_training_config, TestBackend};
use image::{Rgb, RgbImage};
use training_engine::{
    data::{DistributedSampler, ImageFolder, MultiCropAugmentation, MultiCropLoader},
    RunContext, Trainer,
};

#[test]
fn fit_runs_epochs_and_writes_logs_and_checkpoints() {
    let dir = tempfile::tempdir().unwrap();
    let data = dir.path().join("data");
    fs::create_dir_all(&data).unwrap();
    for i in 0..4_u32 {
        RgbImage::from_fn(20, 24, |x, y| Rgb([(x * 11 + i) as u8, (y * 7) as u8, (i * 40) as u8]))
            .save(data.join(format!("{i}.png")))
            .unwrap();
    }

    let mut config = tiny_training_config(dir.path());
    config.data.data_path = data.clone();
    config.run.checkpoint_every_step = true;
    config.run.saveckp_freq = 1;
    config.run.permanent_checkpoint_from = 1;

    let folder = ImageFolder::open(&data, None, None).unwrap();
    let sampler = DistributedSampler::new(folder.len(), 0, 1, config.run.seed, true);
    let loader = MultiCropLoader::new(
        folder,
        sampler,
        MultiCropAugmentation::from_config(&config.multicrop),
        config.optim.batch_size_per_gpu,
        config.data.num_workers,
        config.run.seed,
    )
    .unwrap();

    let mut trainer = Trainer::<TestBackend>::with_network_config(
        config,
        &tiny_network_config(),
        RunContext::single(0),
        Default::default(),
        loader.batches_per_epoch(),
    )
    .unwrap();
    let history = trainer.fit(&loader).unwrap();

    assert_eq!(history.len(), 2);
    assert!(history.iter().all(|epoch| epoch.averages["loss"].is_finite()));
    assert_eq!(trainer.start_epoch(), 2);

    let log = fs::read_to_string(dir.path().join("log.txt")).unwrap();
    let lines: Vec<serde_json::Value> = log.lines().map(|line| serde_json::from_str(line).unwrap()).collect();
    assert_eq!(lines.len(), 2);
    assert_eq!(lines[1]["epoch"], 1);
    assert!(lines[0]["train_loss"].is_number());
    assert!(lines[0]["train_lr"].is_number());
    assert!(lines[0]["train_wd"].is_number());

    assert!(dir.path().join("checkpoint").join("meta.json").is_file());
    assert!(!dir.path().join("checkpoint0000").exists());
    assert!(dir.path().join("checkpoint0001").join("teacher.mpk").is_file());

    // Обучение уже завершено: повторный запуск после восстановления ничего не делает.
    let mut resumed = Trainer::<TestBackend>::with_network_config(
        tiny_training_config(dir.path()),
        &tiny_network_config(),
        RunContext::single(0),
        Default::default(),
        loader.batches_per_epoch(),
    )
    .unwrap();
    assert!(resumed.resume_if_present().unwrap());
    assert!(resumed.fit(&loader).unwrap().is_empty());
}
