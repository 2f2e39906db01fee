// training_engine/tests/checkpoint_tests.rs

mod common;

use burn::module::AutodiffModule;
use common::{flat_values, host, random_views, tiny_network_config, tiny_training_config, TestBackend};
use core_burn::Stream;
use training_engine::{
    CheckpointStore, DistillationLoss, DistillationOptimizer, RunContext, Trainer, TrainingError,
};
use utils_crate::OptimizerKind;

fn trainer(dir: &std::path::Path, use_fp16: bool) -> Trainer<TestBackend> {
    let mut config = tiny_training_config(dir);
    config.optim.use_fp16 = use_fp16;
    Trainer::with_network_config(config, &tiny_network_config(), RunContext::single(3), Default::default(), 1)
        .unwrap()
}

#[test]
fn store_layout() {
    let store = CheckpointStore::new("/out");
    assert_eq!(store.primary_dir(), std::path::Path::new("/out/checkpoint"));
    assert_eq!(store.permanent_dir(85), std::path::Path::new("/out/checkpoint0085"));
}

#[test]
fn resume_without_checkpoint_starts_from_scratch() {
    let dir = tempfile::tempdir().unwrap();
    let mut fresh = trainer(dir.path(), false);
    assert!(!fresh.resume_if_present().unwrap());
    assert_eq!(fresh.start_epoch(), 0);
}

#[test]
fn save_and_resume_round_trip() {
    let dir = tempfile::tempdir().unwrap();
    let mut original = trainer(dir.path(), true);
    original.train_step(&random_views(2, 6), 0, 0).unwrap();
    let primary = original.store().primary_dir();
    original.save_checkpoint(&primary, 1).unwrap();

    for file in ["student.mpk", "teacher.mpk", "optimizer.mpk", "dino_loss.mpk", "meta.json"] {
        assert!(primary.join(file).is_file(), "нет {file}");
    }
    let meta = CheckpointStore::load_meta(&primary).unwrap();
    assert_eq!(meta.epoch, 1);
    assert_eq!(&meta.args, original.config());
    assert_eq!(meta.fp16_scaler.as_ref(), original.scaler());

    let mut resumed = trainer(dir.path(), true);
    assert!(resumed.resume_if_present().unwrap());
    assert_eq!(resumed.start_epoch(), 1);
    assert_eq!(flat_values(resumed.teacher()), flat_values(original.teacher()));
    assert_eq!(
        flat_values(&resumed.student().valid()),
        flat_values(&original.student().valid())
    );
    for stream in Stream::ALL {
        assert_eq!(
            host(resumed.loss().center(stream).clone()),
            host(original.loss().center(stream).clone())
        );
    }
    assert_eq!(resumed.scaler(), original.scaler());

    // Восстановленное состояние пригодно для следующего шага.
    let stats = resumed.train_step(&random_views(2, 6), 1, 0).unwrap();
    assert!(stats.loss.is_finite());
}

#[test]
fn overwriting_keeps_a_single_primary() {
    let dir = tempfile::tempdir().unwrap();
    let original = trainer(dir.path(), false);
    let primary = original.store().primary_dir();
    original.save_checkpoint(&primary, 0).unwrap();
    original.save_checkpoint(&primary, 1).unwrap();
    assert_eq!(CheckpointStore::load_meta(&primary).unwrap().epoch, 1);
    assert!(!primary.with_extension("tmp").exists());
}

#[test]
fn loading_missing_checkpoint_fails() {
    let dir = tempfile::tempdir().unwrap();
    let t = trainer(dir.path(), false);
    let mut optimizer = DistillationOptimizer::new(OptimizerKind::Adamw, t.registry());
    let mut loss = DistillationLoss::<TestBackend>::new(common::OUT_DIM, vec![0.04], 0.1, 0.9, &Default::default());
    let result = t.store().load(
        &dir.path().join("nothing"),
        t.student().clone(),
        t.teacher().clone(),
        &mut optimizer,
        &mut loss,
        &Default::default(),
    );
    assert!(matches!(result, Err(TrainingError::Checkpoint(_))));
}

#[test]
fn teacher_backbone_export() {
    use burn::module::Module;
    use burn::record::{FullPrecisionSettings, NamedMpkFileRecorder};
    use common::Inner;
    use training_engine::export_teacher_backbone;

    let dir = tempfile::tempdir().unwrap();
    let mut config = tiny_training_config(dir.path());
    // Экспорт строит сеть по снимку конфигурации, поэтому обучение идет на пресете.
    config.model.arch = utils_crate::BackboneArch::VitTiny;
    config.model.drop_path_rate = 0.0;
    let trained = Trainer::<TestBackend>::new(config, RunContext::single(0), Default::default(), 1).unwrap();
    let primary = trained.store().primary_dir();
    trained.save_checkpoint(&primary, 1).unwrap();

    let output = dir.path().join("export").join("teacher_backbone");
    let args = export_teacher_backbone::<Inner>(&primary, &output, &Default::default()).unwrap();
    assert_eq!(&args, trained.config());
    assert!(output.with_extension("mpk").is_file());

    let backbone = training_engine::build_network_config(&args)
        .backbone
        .init::<Inner>(&Default::default())
        .unwrap()
        .load_file(output, &NamedMpkFileRecorder::<FullPrecisionSettings>::new(), &Default::default())
        .unwrap();
    assert_eq!(flat_values(&backbone), flat_values(&trained.teacher().clone().into_backbone()));
}

#[test]
fn interrupted_swap_still_resumes() {
    let dir = tempfile::tempdir().unwrap();
    let mut original = trainer(dir.path(), false);
    original.train_step(&random_views(2, 6), 0, 0).unwrap();
    let primary = original.store().primary_dir();
    original.save_checkpoint(&primary, 1).unwrap();
    assert!(!primary.with_extension("old").exists());

    // Падение после снятия прежнего чекпоинта, но до переименования нового.
    std::fs::rename(&primary, primary.with_extension("tmp")).unwrap();
    assert!(original.store().has_primary());
    assert_eq!(CheckpointStore::resolve(&primary), Some(primary.with_extension("tmp")));

    let mut resumed = trainer(dir.path(), false);
    assert!(resumed.resume_if_present().unwrap());
    assert_eq!(resumed.start_epoch(), 1);
    assert_eq!(flat_values(resumed.teacher()), flat_values(original.teacher()));

    // Следующая запись восстанавливает основной чекпоинт.
    resumed.save_checkpoint(&primary, 1).unwrap();
    assert!(primary.join("meta.json").is_file());
    assert!(!primary.with_extension("tmp").exists());
}

#[test]
fn incomplete_tmp_falls_back_to_old() {
    let dir = tempfile::tempdir().unwrap();
    let original = trainer(dir.path(), false);
    let primary = original.store().primary_dir();
    original.save_checkpoint(&primary, 2).unwrap();

    // Прежний чекпоинт уже переименован, новый записан не до конца.
    std::fs::rename(&primary, primary.with_extension("old")).unwrap();
    std::fs::create_dir_all(primary.with_extension("tmp")).unwrap();
    std::fs::write(primary.with_extension("tmp").join("student.mpk"), b"partial").unwrap();

    assert_eq!(CheckpointStore::resolve(&primary), Some(primary.with_extension("old")));
    let mut resumed = trainer(dir.path(), false);
    assert!(resumed.resume_if_present().unwrap());
    assert_eq!(resumed.start_epoch(), 2);
}
