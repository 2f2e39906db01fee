// training_engine/src/checkpoint.rs

#![warn(missing_docs, clippy::all, clippy::pedantic, clippy::nursery)]
#![deny(unsafe_code, clippy::unwrap_used, clippy::expect_used)]

//! Чекпоинты полного состояния обучения.
//!
//! Чекпоинт является директорией:
//! - `student.mpk`, `teacher.mpk` - веса сетей;
//! - `optimizer.mpk` - состояние оптимизатора;
//! - `dino_loss.mpk` - центры функции потерь;
//! - `meta.json` - эпоха, с которой продолжать, снимок конфигурации и
//!   состояние масштабирования потерь.
//!
//! Запись идет во временную директорию `<dir>.tmp`. Прежний чекпоинт
//! переименовывается в `<dir>.old`, временная директория занимает его место,
//! после чего `<dir>.old` удаляется. Если процесс упал посреди замены,
//! чтение берет полный `<dir>.tmp`, а затем `<dir>.old`. Полнота определяется
//! по `meta.json`, который пишется последним.

use std::{
    fs,
    path::{Path, PathBuf},
};

use burn::{
    module::Module,
    record::{FullPrecisionSettings, NamedMpkFileRecorder, Recorder},
    tensor::backend::{AutodiffBackend, Backend},
};
use chrono::{DateTime, Utc};
use core_burn::MultiCropNetwork;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};
use utils_crate::{ensure_dir_exists, TrainingConfig};

use crate::{
    trainer::build_network_config, DistillationLoss, DistillationOptimizer, LossScaler, TrainingError,
};

const STUDENT_FILE: &str = "student";
const TEACHER_FILE: &str = "teacher";
const OPTIMIZER_FILE: &str = "optimizer";
const LOSS_FILE: &str = "dino_loss";
const META_FILE: &str = "meta.json";

type CheckpointRecorder = NamedMpkFileRecorder<FullPrecisionSettings>;

/// Метаданные чекпоинта.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CheckpointMeta {
    /// Эпоха, с которой продолжать обучение.
    pub epoch: usize,
    /// Снимок конфигурации запуска.
    pub args: TrainingConfig,
    /// Состояние масштабирования потерь, если оно включено.
    pub fp16_scaler: Option<LossScaler>,
    /// Время записи.
    pub saved_at: DateTime<Utc>,
}

/// Состояние обучения, восстановленное из чекпоинта.
#[derive(Debug)]
pub struct RestoredState<B: AutodiffBackend> {
    /// Студент.
    pub student: MultiCropNetwork<B>,
    /// Учитель.
    pub teacher: MultiCropNetwork<B::InnerBackend>,
    /// Метаданные.
    pub meta: CheckpointMeta,
}

/// Расположение чекпоинтов в выходной директории.
#[derive(Debug, Clone)]
pub struct CheckpointStore {
    output_dir: PathBuf,
}

impl CheckpointStore {
    /// Создает хранилище в `output_dir`.
    pub fn new(output_dir: impl Into<PathBuf>) -> Self {
        Self {
            output_dir: output_dir.into(),
        }
    }

    /// Основной (перезаписываемый) чекпоинт.
    #[must_use]
    pub fn primary_dir(&self) -> PathBuf {
        self.output_dir.join("checkpoint")
    }

    /// Постоянный чекпоинт эпохи.
    #[must_use]
    pub fn permanent_dir(&self, epoch: usize) -> PathBuf {
        self.output_dir.join(format!("checkpoint{epoch:04}"))
    }

    /// Есть ли основной чекпоинт (в том числе оставшийся от прерванной замены).
    #[must_use]
    pub fn has_primary(&self) -> bool {
        Self::resolve(&self.primary_dir()).is_some()
    }

    /// Директория с полным чекпоинтом для `dir`: сама `dir`, иначе
    /// `<dir>.tmp`, иначе `<dir>.old`.
    #[must_use]
    pub fn resolve(dir: &Path) -> Option<PathBuf> {
        [dir.to_path_buf(), dir.with_extension("tmp"), dir.with_extension("old")]
            .into_iter()
            .find(|candidate| candidate.join(META_FILE).is_file())
    }

    /// Записывает чекпоинт в директорию `dir`, заменяя прежний.
    ///
    /// # Аргументы
    /// * `dir` - Директория чекпоинта.
    /// * `student` - Студент.
    /// * `teacher` - Учитель.
    /// * `optimizer` - Оптимизатор студента.
    /// * `loss` - Функция потерь с центрами.
    /// * `meta` - Метаданные.
    ///
    /// # Ошибки
    /// Ошибки файловой системы, рекордера и сериализации JSON.
    pub fn save<B: AutodiffBackend>(
        &self,
        dir: &Path,
        student: &MultiCropNetwork<B>,
        teacher: &MultiCropNetwork<B::InnerBackend>,
        optimizer: &DistillationOptimizer<B::InnerBackend>,
        loss: &DistillationLoss<B>,
        meta: &CheckpointMeta,
    ) -> Result<(), TrainingError> {
        ensure_dir_exists(&self.output_dir)?;
        let tmp = dir.with_extension("tmp");
        let old = dir.with_extension("old");
        if tmp.exists() {
            fs::remove_dir_all(&tmp)?;
        }
        fs::create_dir_all(&tmp)?;

        let recorder = CheckpointRecorder::new();
        student.clone().save_file(tmp.join(STUDENT_FILE), &recorder)?;
        teacher.clone().save_file(tmp.join(TEACHER_FILE), &recorder)?;
        Recorder::<B::InnerBackend>::record(&recorder, optimizer.to_record(), tmp.join(OPTIMIZER_FILE))?;
        Recorder::<B::InnerBackend>::record(&recorder, loss.to_record(), tmp.join(LOSS_FILE))?;
        // meta.json последним: по нему чекпоинт считается полным.
        fs::write(tmp.join(META_FILE), serde_json::to_string_pretty(meta)?)?;

        if old.exists() {
            fs::remove_dir_all(&old)?;
        }
        if dir.exists() {
            fs::rename(dir, &old)?;
        }
        fs::rename(&tmp, dir)?;
        if old.exists() {
            fs::remove_dir_all(&old)?;
        }
        debug!("Чекпоинт записан: {:?} (эпоха {})", dir, meta.epoch);
        Ok(())
    }

    /// Читает метаданные чекпоинта.
    ///
    /// # Ошибки
    /// Ошибки чтения и разбора JSON.
    pub fn load_meta(dir: &Path) -> Result<CheckpointMeta, TrainingError> {
        let content = fs::read_to_string(dir.join(META_FILE))?;
        Ok(serde_json::from_str(&content)?)
    }

    fn resolve_existing(dir: &Path) -> Result<PathBuf, TrainingError> {
        let found = Self::resolve(dir)
            .ok_or_else(|| TrainingError::Checkpoint(format!("Чекпоинт не найден: {dir:?}")))?;
        if found != dir {
            warn!("Чекпоинт {:?} не завершен, используется {:?}", dir, found);
        }
        Ok(found)
    }

    /// Восстанавливает состояние из чекпоинта.
    ///
    /// Оптимизатор и функция потерь загружаются на месте; сети возвращаются.
    ///
    /// # Аргументы
    /// * `dir` - Директория чекпоинта.
    /// * `student` - Студент той же архитектуры.
    /// * `teacher` - Учитель той же архитектуры.
    /// * `optimizer` - Оптимизатор для восстановления.
    /// * `loss` - Функция потерь для восстановления.
    /// * `device` - Устройство.
    ///
    /// # Ошибки
    /// `TrainingError::Checkpoint`, если чекпоинта нет, ошибки рекордера и
    /// несовпадение числа параметров.
    pub fn load<B: AutodiffBackend>(
        &self,
        dir: &Path,
        student: MultiCropNetwork<B>,
        teacher: MultiCropNetwork<B::InnerBackend>,
        optimizer: &mut DistillationOptimizer<B::InnerBackend>,
        loss: &mut DistillationLoss<B>,
        device: &B::Device,
    ) -> Result<RestoredState<B>, TrainingError> {
        let dir = &Self::resolve_existing(dir)?;
        let meta = Self::load_meta(dir)?;
        let recorder = CheckpointRecorder::new();
        let student = student.load_file(dir.join(STUDENT_FILE), &recorder, device)?;
        let teacher = teacher.load_file(dir.join(TEACHER_FILE), &recorder, device)?;
        optimizer.load_record(Recorder::<B::InnerBackend>::load(
            &recorder,
            dir.join(OPTIMIZER_FILE),
            device,
        )?)?;
        loss.load_record(Recorder::<B::InnerBackend>::load(&recorder, dir.join(LOSS_FILE), device)?)?;
        info!("Состояние восстановлено из {:?}: продолжение с эпохи {}", dir, meta.epoch);
        Ok(RestoredState { student, teacher, meta })
    }
}

/// Извлекает backbone учителя из чекпоинта в отдельный файл.
///
/// # Аргументы
/// * `checkpoint_dir` - Директория чекпоинта.
/// * `output` - Путь файла весов (расширение `.mpk` добавляется рекордером).
/// * `device` - Устройство загрузки.
///
/// # Возвращает
/// Конфигурацию запуска из метаданных чекпоинта.
///
/// # Ошибки
/// Ошибки чтения чекпоинта, конфигурации сети и записи.
pub fn export_teacher_backbone<B: Backend>(
    checkpoint_dir: &Path,
    output: &Path,
    device: &B::Device,
) -> Result<TrainingConfig, TrainingError> {
    let checkpoint_dir = &CheckpointStore::resolve_existing(checkpoint_dir)?;
    let meta = CheckpointStore::load_meta(checkpoint_dir)?;
    let recorder = CheckpointRecorder::new();
    let teacher = build_network_config(&meta.args)
        .init::<B>(device)?
        .load_file(checkpoint_dir.join(TEACHER_FILE), &recorder, device)?;
    if let Some(parent) = output.parent().filter(|p| !p.as_os_str().is_empty()) {
        ensure_dir_exists(parent)?;
    }
    teacher.into_backbone().save_file(output.to_path_buf(), &recorder)?;
    info!("Backbone учителя из {:?} записан в {:?}", checkpoint_dir, output);
    Ok(meta.args)
}
