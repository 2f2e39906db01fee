// training_engine/tests/trainer_tests.rs

mod common;

use std::{sync::Arc, thread};

use burn::module::AutodiffModule;
use common::{flat_values, host, random_views, tiny_network_config, tiny_training_config, TestBackend};
use core_burn::Stream;
use training_engine::{build_network_config, Collective, RunContext, ThreadGroup, Trainer, TrainingError};
use utils_crate::TrainingConfig;

fn trainer(config: TrainingConfig) -> Trainer<TestBackend> {
    Trainer::with_network_config(config, &tiny_network_config(), RunContext::single(0), Default::default(), 1)
        .unwrap()
}

#[test]
fn training_step_updates_student_teacher_and_centers() {
    let dir = tempfile::tempdir().unwrap();
    let mut config = tiny_training_config(dir.path());
    config.optim.momentum_teacher = 0.5;
    let mut trainer = trainer(config);

    let student_before = flat_values(&trainer.student().valid());
    let teacher_before = flat_values(trainer.teacher());
    assert_eq!(student_before, teacher_before);

    let stats = trainer.train_step(&random_views(2, 6), 0, 0).unwrap();
    assert!(stats.loss.is_finite());
    assert!(!stats.skipped);

    for stream in Stream::ALL {
        let center = host(trainer.loss().center(stream).clone());
        assert!(center.iter().any(|v| *v != 0.0), "центр {stream} не обновился");
    }
    assert_ne!(flat_values(&trainer.student().valid()), student_before);
    assert_ne!(flat_values(trainer.teacher()), teacher_before);
}

#[test]
fn momentum_one_keeps_teacher_bit_identical() {
    let dir = tempfile::tempdir().unwrap();
    let mut config = tiny_training_config(dir.path());
    config.optim.momentum_teacher = 1.0;
    let mut trainer = trainer(config);

    let teacher_before = flat_values(trainer.teacher());
    let student_before = flat_values(&trainer.student().valid());
    trainer.train_step(&random_views(2, 6), 0, 0).unwrap();

    assert_eq!(flat_values(trainer.teacher()), teacher_before);
    assert_ne!(flat_values(&trainer.student().valid()), student_before);
}

#[test]
fn frozen_last_layer_is_not_updated() {
    let dir = tempfile::tempdir().unwrap();
    let mut config = tiny_training_config(dir.path());
    config.optim.freeze_last_layer = 1;
    let mut trainer = trainer(config);

    let values = |trainer: &Trainer<TestBackend>| -> Vec<Vec<f32>> {
        let student = trainer.student().valid();
        let registry = trainer.registry();
        registry
            .collect_values(&student)
            .unwrap()
            .into_iter()
            .zip(registry.slots())
            .filter(|(_, slot)| slot.last_layer)
            .map(|(value, _)| host(value))
            .collect()
    };
    let before = values(&trainer);
    assert!(!before.is_empty());
    trainer.train_step(&random_views(2, 6), 0, 0).unwrap();
    assert_eq!(values(&trainer), before);
}

#[test]
fn loss_scaling_keeps_step_finite() {
    let dir = tempfile::tempdir().unwrap();
    let mut config = tiny_training_config(dir.path());
    config.optim.use_fp16 = true;
    let mut trainer = trainer(config);
    let stats = trainer.train_step(&random_views(2, 6), 0, 0).unwrap();
    assert!(stats.loss.is_finite());
    assert_eq!(stats.loss_scale, Some(65536.0));
}

#[test]
fn zero_steps_per_epoch_is_rejected() {
    let dir = tempfile::tempdir().unwrap();
    let result = Trainer::<TestBackend>::with_network_config(
        tiny_training_config(dir.path()),
        &tiny_network_config(),
        RunContext::single(0),
        Default::default(),
        0,
    );
    assert!(matches!(result, Err(TrainingError::Config(_))));
}

#[test]
fn network_config_follows_training_config() {
    let mut config = TrainingConfig::default();
    config.model.out_dim = 1024;
    config.model.head_nlayers = 2;
    let network = build_network_config(&config);
    assert_eq!(network.backbone.embed_dim, 384);
    assert_eq!(network.backbone.num_heads, 6);
    assert_eq!(network.backbone.img_size, [224, 224]);
    assert_eq!(network.head.in_dim, 384);
    assert_eq!(network.head.out_dim, 1024);
    assert_eq!(network.head.nlayers, 2);
}

#[test]
fn workers_stay_in_sync() {
    let group = ThreadGroup::new(2);
    let handles: Vec<_> = group
        .into_iter()
        .map(|member| {
            thread::spawn(move || {
                let dir = tempfile::tempdir().unwrap();
                let config = tiny_training_config(dir.path());
                let collective: Arc<dyn Collective> = Arc::new(member);
                let ctx = RunContext::new(collective, 7);
                let mut trainer =
                    Trainer::<TestBackend>::with_network_config(config, &tiny_network_config(), ctx, Default::default(), 1)
                        .unwrap();
                let initial = flat_values(&trainer.student().valid());
                trainer.train_step(&random_views(2, 6), 0, 0).unwrap();
                (
                    initial,
                    flat_values(&trainer.student().valid()),
                    host(trainer.loss().center(Stream::Cls).clone()),
                )
            })
        })
        .collect();
    let results: Vec<_> = handles.into_iter().map(|h| h.join().unwrap()).collect();
    assert_eq!(results[0].0, results[1].0, "начальные веса не разосланы");
    assert_eq!(results[0].1, results[1].1, "студенты разошлись после шага");
    assert_eq!(results[0].2, results[1].2, "центры разошлись");
}

#[test]
fn divergence_on_one_worker_stops_every_worker() {
    let group = ThreadGroup::new(2);
    let handles: Vec<_> = group
        .into_iter()
        .map(|member| {
            thread::spawn(move || {
                let dir = tempfile::tempdir().unwrap();
                let config = tiny_training_config(dir.path());
                let rank = member.rank();
                let ctx = RunContext::new(Arc::new(member), 7);
                let mut trainer =
                    Trainer::<TestBackend>::with_network_config(config, &tiny_network_config(), ctx, Default::default(), 1)
                        .unwrap();
                let mut views = random_views(2, 6);
                if rank == 1 {
                    views = views.into_iter().map(|view| view.mul_scalar(f32::NAN)).collect();
                }
                trainer.train_step(&views, 0, 0)
            })
        })
        .collect();
    for handle in handles {
        let result = handle.join().unwrap();
        assert!(matches!(result, Err(TrainingError::NonFiniteLoss { .. })));
    }
}
