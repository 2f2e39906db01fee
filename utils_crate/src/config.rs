#![warn(
    missing_docs,
    clippy::all,
    clippy::pedantic,
    clippy::nursery,
    clippy::unwrap_used,
    clippy::expect_used
)]
#![deny(unsafe_code)]

//! Конфигурация обучения самодистилляцией с part-токенами.
//!
//! Значения по умолчанию совпадают с рецептом ViT-S/16 на 100 эпох.
//! Файл TOML разбит на секции `[model]`, `[loss]`, `[optim]`, `[multicrop]`,
//! `[data]` и `[run]`; любая секция и любое поле могут быть опущены.

use crate::error::UtilsError;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use tracing::{info, warn};

/// Количество горизонтальных полос, из которых нарезаются локальные виды.
pub const NUM_BANDS: usize = 3;

/// Архитектура backbone.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BackboneArch {
    /// ViT-Tiny: 192 канала, 3 головы.
    #[serde(alias = "deit_tiny")]
    VitTiny,
    /// ViT-Small: 384 канала, 6 голов.
    #[serde(alias = "deit_small")]
    VitSmall,
    /// ViT-Base: 768 каналов, 12 голов.
    VitBase,
}

impl std::fmt::Display for BackboneArch {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            Self::VitTiny => "vit_tiny",
            Self::VitSmall => "vit_small",
            Self::VitBase => "vit_base",
        };
        f.write_str(name)
    }
}

impl std::str::FromStr for BackboneArch {
    type Err = UtilsError;

    /// Разбирает имя архитектуры, включая псевдонимы `deit_tiny` и `deit_small`.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "vit_tiny" | "deit_tiny" => Ok(Self::VitTiny),
            "vit_small" | "deit_small" => Ok(Self::VitSmall),
            "vit_base" => Ok(Self::VitBase),
            other => Err(UtilsError::Config(format!(
                "Неизвестная архитектура: {other:?}. Доступны vit_tiny, vit_small, vit_base."
            ))),
        }
    }
}

/// Тип оптимизатора.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OptimizerKind {
    /// AdamW с раздельным затуханием весов (рекомендуется для ViT).
    Adamw,
    /// SGD с моментом 0.9.
    Sgd,
    /// LARS (для сверточных backbone и больших батчей).
    Lars,
}

/// Полная конфигурация обучения.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TrainingConfig {
    /// Архитектура сети и головы.
    #[serde(default = "default_model_section")]
    pub model: ModelSection,
    /// Параметры функции потерь.
    #[serde(default = "default_loss_section")]
    pub loss: LossSection,
    /// Оптимизация и расписания.
    #[serde(default = "default_optim_section")]
    pub optim: OptimSection,
    /// Параметры multi-crop аугментации.
    #[serde(default = "default_multicrop_section")]
    pub multicrop: MultiCropSection,
    /// Источник данных.
    #[serde(default = "default_data_section")]
    pub data: DataSection,
    /// Служебные параметры запуска.
    #[serde(default = "default_run_section")]
    pub run: RunSection,
}

fn default_model_section() -> ModelSection {
    ModelSection::default()
}
fn default_loss_section() -> LossSection {
    LossSection::default()
}
fn default_optim_section() -> OptimSection {
    OptimSection::default()
}
fn default_multicrop_section() -> MultiCropSection {
    MultiCropSection::default()
}
fn default_data_section() -> DataSection {
    DataSection::default()
}
fn default_run_section() -> RunSection {
    RunSection::default()
}

impl Default for TrainingConfig {
    fn default() -> Self {
        Self {
            model: ModelSection::default(),
            loss: LossSection::default(),
            optim: OptimSection::default(),
            multicrop: MultiCropSection::default(),
            data: DataSection::default(),
            run: RunSection::default(),
        }
    }
}

/// Архитектура сети (под-конфигурация для `TrainingConfig`).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ModelSection {
    /// Имя архитектуры backbone.
    pub arch: BackboneArch,
    /// Размер патча в пикселях.
    pub patch_size: usize,
    /// Размерность выхода каждой из четырех голов.
    pub out_dim: usize,
    /// Нормировать ли последний слой головы (фиксированный единичный масштаб).
    pub norm_last_layer: bool,
    /// Batch norm в MLP головы.
    pub use_bn_in_head: bool,
    /// Вероятность stochastic depth для студента.
    pub drop_path_rate: f64,
    /// Ширина скрытых слоев MLP головы.
    pub head_hidden_dim: usize,
    /// Размерность bottleneck перед последним слоем головы.
    pub head_bottleneck_dim: usize,
    /// Число линейных слоев MLP головы.
    pub head_nlayers: usize,
}

impl Default for ModelSection {
    fn default() -> Self {
        Self {
            arch: BackboneArch::VitSmall,
            patch_size: 16,
            out_dim: 65536,
            norm_last_layer: true,
            use_bn_in_head: false,
            drop_path_rate: 0.1,
            head_hidden_dim: 2048,
            head_bottleneck_dim: 256,
            head_nlayers: 3,
        }
    }
}

/// Параметры функции потерь (под-конфигурация для `TrainingConfig`).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LossSection {
    /// Температура студента.
    pub student_temp: f64,
    /// Момент EMA для центров.
    pub center_momentum: f64,
    /// Начальная температура учителя.
    pub warmup_teacher_temp: f64,
    /// Температура учителя после прогрева.
    pub teacher_temp: f64,
    /// Длительность прогрева температуры учителя в эпохах.
    pub warmup_teacher_temp_epochs: usize,
}

impl Default for LossSection {
    fn default() -> Self {
        Self {
            student_temp: 0.1,
            center_momentum: 0.9,
            warmup_teacher_temp: 0.04,
            teacher_temp: 0.04,
            warmup_teacher_temp_epochs: 0,
        }
    }
}

/// Оптимизация и расписания (под-конфигурация для `TrainingConfig`).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct OptimSection {
    /// Тип оптимизатора.
    pub optimizer: OptimizerKind,
    /// Базовый learning rate для батча 256 (масштабируется линейно).
    pub lr: f64,
    /// Learning rate в конце косинусного расписания.
    pub min_lr: f64,
    /// Число эпох линейного прогрева learning rate.
    pub warmup_epochs: usize,
    /// Начальное значение weight decay.
    pub weight_decay: f64,
    /// Конечное значение weight decay.
    pub weight_decay_end: f64,
    /// Начальный момент EMA учителя (растет по косинусу до 1).
    pub momentum_teacher: f64,
    /// Порог нормы градиента для поэлементного клиппинга (0 отключает).
    pub clip_grad: f64,
    /// Число эпох, в течение которых последний слой головы заморожен.
    pub freeze_last_layer: usize,
    /// Динамическое масштабирование потерь.
    pub use_fp16: bool,
    /// Размер батча на один процесс.
    pub batch_size_per_gpu: usize,
    /// Число эпох обучения.
    pub epochs: usize,
}

impl Default for OptimSection {
    fn default() -> Self {
        Self {
            optimizer: OptimizerKind::Adamw,
            lr: 0.0005,
            min_lr: 1e-6,
            warmup_epochs: 10,
            weight_decay: 0.04,
            weight_decay_end: 0.4,
            momentum_teacher: 0.996,
            clip_grad: 3.0,
            freeze_last_layer: 1,
            use_fp16: true,
            batch_size_per_gpu: 64,
            epochs: 100,
        }
    }
}

/// Параметры multi-crop (под-конфигурация для `TrainingConfig`).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct MultiCropSection {
    /// Диапазон площади глобальных кропов относительно изображения.
    pub global_crops_scale: (f64, f64),
    /// Общее число локальных кропов (делится на три полосы).
    pub local_crops_number: usize,
    /// Диапазон площади локальных кропов относительно полосы.
    pub local_crops_scale: (f64, f64),
    /// Размер глобального вида `(высота, ширина)`.
    pub global_size: (usize, usize),
    /// Размер локального вида `(высота, ширина)`.
    pub local_size: (usize, usize),
    /// Считать ли остаток от деления `local_crops_number` на 3 ошибкой.
    pub strict_local_crops: bool,
}

impl Default for MultiCropSection {
    fn default() -> Self {
        Self {
            global_crops_scale: (0.4, 1.0),
            local_crops_number: 8,
            local_crops_scale: (0.05, 0.4),
            global_size: (224, 224),
            local_size: (96, 96),
            strict_local_crops: false,
        }
    }
}

impl MultiCropSection {
    /// Число локальных видов на одну полосу (деление с округлением вниз).
    #[must_use]
    pub const fn local_crops_per_band(&self) -> usize {
        self.local_crops_number / NUM_BANDS
    }

    /// Число локальных видов, которые отбрасываются из-за деления вниз.
    #[must_use]
    pub const fn dropped_local_crops(&self) -> usize {
        self.local_crops_number % NUM_BANDS
    }
}

/// Источник данных (под-конфигурация для `TrainingConfig`).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DataSection {
    /// Корневая директория с изображениями.
    pub data_path: PathBuf,
    /// Файл со списком относительных путей, которыми ограничивается датасет.
    pub filter_path: Option<PathBuf>,
    /// Сколько первых записей списка оставить.
    pub keep_num: Option<usize>,
    /// Число потоков подготовки данных.
    pub num_workers: usize,
}

impl Default for DataSection {
    fn default() -> Self {
        Self {
            data_path: PathBuf::from("/path/to/imagenet/train/"),
            filter_path: None,
            keep_num: None,
            num_workers: 10,
        }
    }
}

/// Служебные параметры запуска (под-конфигурация для `TrainingConfig`).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RunSection {
    /// Директория для чекпоинтов и `log.txt`.
    pub output_dir: PathBuf,
    /// Базовое зерно генераторов случайных чисел.
    pub seed: u64,
    /// Периодичность постоянных чекпоинтов в эпохах.
    pub saveckp_freq: usize,
    /// Эпоха, начиная с которой пишутся постоянные чекпоинты.
    pub permanent_checkpoint_from: usize,
    /// Перезаписывать основной чекпоинт после каждого шага.
    pub checkpoint_every_step: bool,
    /// Период вывода прогресса в шагах.
    pub log_every: usize,
    /// Директория файловых логов `tracing` (без нее только консоль).
    pub log_dir: Option<PathBuf>,
}

impl Default for RunSection {
    fn default() -> Self {
        Self {
            output_dir: PathBuf::from("."),
            seed: 0,
            saveckp_freq: 5,
            permanent_checkpoint_from: 85,
            checkpoint_every_step: true,
            log_every: 10,
            log_dir: None,
        }
    }
}

impl TrainingConfig {
    /// Загружает конфигурацию из TOML файла.
    /// Если файл не найден, возвращается конфигурация по умолчанию.
    ///
    /// # Аргументы
    /// * `file_path` - Путь к TOML файлу конфигурации.
    ///
    /// # Ошибки
    /// Возвращает `UtilsError::Io` при ошибках чтения файла или `UtilsError::Config`
    /// при ошибках парсинга TOML (в том числе при неизвестном имени архитектуры).
    pub fn load_from_toml(file_path: &Path) -> Result<Self, UtilsError> {
        if !file_path.exists() {
            warn!(
                "Файл конфигурации не найден: {:?}, используется конфигурация по умолчанию.",
                file_path
            );
            return Ok(Self::default());
        }
        let config_str = std::fs::read_to_string(file_path)
            .map_err(|e| UtilsError::io_with_path(e, file_path.to_string_lossy().into_owned()))?;
        Self::from_toml_str(&config_str).map_err(|e| match e {
            UtilsError::Config(msg) => {
                UtilsError::Config(format!("Не удалось разобрать {file_path:?}: {msg}"))
            }
            other => other,
        })
    }

    /// Разбирает конфигурацию из строки TOML.
    ///
    /// # Ошибки
    /// `UtilsError::Config` при синтаксической ошибке или неизвестном значении.
    pub fn from_toml_str(content: &str) -> Result<Self, UtilsError> {
        toml::from_str(content)
            .map_err(|e| UtilsError::Config(format!("Не удалось разобрать TrainingConfig из TOML: {e}")))
    }

    /// Сериализует конфигурацию в TOML.
    ///
    /// # Ошибки
    /// `UtilsError::Serialization`, если сериализация не удалась.
    pub fn to_toml_string(&self) -> Result<String, UtilsError> {
        Ok(toml::to_string_pretty(self)?)
    }

    /// Learning rate после линейного масштабирования по глобальному размеру батча.
    #[must_use]
    #[allow(clippy::cast_precision_loss)]
    pub fn scaled_lr(&self, world_size: usize) -> f64 {
        self.optim.lr * (self.optim.batch_size_per_gpu * world_size) as f64 / 256.0
    }

    /// Проверяет согласованность гиперпараметров до создания моделей.
    ///
    /// Остаток от деления `local_crops_number` на 3 по умолчанию только
    /// логируется: лишние локальные виды отбрасываются. При
    /// `strict_local_crops = true` это ошибка.
    ///
    /// # Ошибки
    /// `UtilsError::Config` с описанием первой найденной проблемы.
    pub fn validate(&self, world_size: usize) -> Result<(), UtilsError> {
        let fail = |msg: String| Err(UtilsError::Config(msg));

        if world_size == 0 {
            return fail("world_size должен быть больше нуля".into());
        }
        if self.optim.epochs == 0 || self.optim.batch_size_per_gpu == 0 {
            return fail("epochs и batch_size_per_gpu должны быть больше нуля".into());
        }
        if self.model.out_dim == 0 || self.model.patch_size == 0 {
            return fail("out_dim и patch_size должны быть больше нуля".into());
        }
        if self.model.head_nlayers == 0 {
            return fail("head_nlayers должен быть не меньше 1".into());
        }
        if self.loss.warmup_teacher_temp_epochs > self.optim.epochs {
            return fail(format!(
                "warmup_teacher_temp_epochs ({}) больше числа эпох ({})",
                self.loss.warmup_teacher_temp_epochs, self.optim.epochs
            ));
        }
        if self.optim.warmup_epochs > self.optim.epochs {
            return fail(format!(
                "warmup_epochs ({}) больше числа эпох ({})",
                self.optim.warmup_epochs, self.optim.epochs
            ));
        }
        if self.loss.student_temp <= 0.0 || self.loss.teacher_temp <= 0.0 || self.loss.warmup_teacher_temp <= 0.0 {
            return fail("температуры должны быть положительными".into());
        }
        if !(0.0..=1.0).contains(&self.loss.center_momentum) {
            return fail(format!("center_momentum вне [0, 1]: {}", self.loss.center_momentum));
        }
        for (name, (h, w)) in [
            ("global_size", self.multicrop.global_size),
            ("local_size", self.multicrop.local_size),
        ] {
            if h == 0 || w == 0 || h % self.model.patch_size != 0 || w % self.model.patch_size != 0 {
                return fail(format!(
                    "{name} ({h}x{w}) должен быть ненулевым и кратным patch_size ({})",
                    self.model.patch_size
                ));
            }
        }
        for (name, (lo, hi)) in [
            ("global_crops_scale", self.multicrop.global_crops_scale),
            ("local_crops_scale", self.multicrop.local_crops_scale),
        ] {
            if !(lo > 0.0 && lo <= hi && hi <= 1.0) {
                return fail(format!("{name} должен удовлетворять 0 < min <= max <= 1, получено ({lo}, {hi})"));
            }
        }
        if self.model.use_bn_in_head && world_size > 1 {
            return fail(
                "use_bn_in_head не поддерживается при нескольких процессах: статистики batch norm не синхронизируются"
                    .into(),
            );
        }
        if self.data.keep_num == Some(0) {
            return fail("keep_num должен быть больше нуля".into());
        }

        let dropped = self.multicrop.dropped_local_crops();
        if dropped > 0 {
            if self.multicrop.strict_local_crops {
                return fail(format!(
                    "local_crops_number ({}) не делится на {NUM_BANDS}",
                    self.multicrop.local_crops_number
                ));
            }
            warn!(
                "local_crops_number = {} не делится на {}: используется {} видов на полосу, {} видов отбрасываются",
                self.multicrop.local_crops_number,
                NUM_BANDS,
                self.multicrop.local_crops_per_band(),
                dropped
            );
        }
        info!(
            "Конфигурация проверена: arch={}, out_dim={}, epochs={}, batch={}x{}",
            self.model.arch, self.model.out_dim, self.optim.epochs, self.optim.batch_size_per_gpu, world_size
        );
        Ok(())
    }
}
