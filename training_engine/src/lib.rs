// training_engine/src/lib.rs

// Включаем строгие правила линтинга для всего крейта.
#![warn(
    missing_docs, // Предупреждать об отсутствующей документации для публичных элементов.
    clippy::all, // Все стандартные проверки Clippy.
    clippy::pedantic, // Более строгие проверки Clippy.
    clippy::nursery // Экспериментальные проверки Clippy.
)]
// Запрещаем небезопасный код и паники на ошибках в библиотечном коде.
#![deny(
    unsafe_code,
    clippy::unwrap_used,
    clippy::expect_used
)]

//! # `training_engine`
//!
//! Самодистилляция vision transformer с part-токенами: студент обучается
//! градиентным спуском, учитель следует за ним экспоненциальным скользящим
//! средним весов, а функция потерь сравнивает распределения четырех потоков
//! (`cls`, `pt1`, `pt2`, `pt3`) по всем допустимым парам видов.
//!
//! ## Структура
//!
//! - `schedule`: косинусные расписания и расписание температуры учителя.
//! - `distributed`: контракт коллективных операций и контекст запуска.
//! - `params`: упорядоченный реестр параметров, сбор градиентов, запись обновлений.
//! - `dispatch`: раскладка видов по полосам и прямые проходы студента и учителя.
//! - `loss`: кросс-энтропия с центрированием и заострением, центры потоков.
//! - `ema`: обновление учителя скользящим средним.
//! - `optimizer`: AdamW, SGD и LARS с двумя группами параметров, обрезка градиентов.
//! - `scaler`: динамическое масштабирование потерь.
//! - `data`: датасет, распределенный сэмплер, multi-crop аугментации, загрузчик.
//! - `checkpoint`: сохранение и восстановление полного состояния обучения.
//! - `metrics`: сглаженные метрики и журнал эпох.
//! - `trainer`: цикл обучения.

pub mod checkpoint;
pub mod data;
pub mod dispatch;
pub mod distributed;
pub mod ema;
pub mod error;
pub mod loss;
pub mod metrics;
pub mod optimizer;
pub mod params;
pub mod scaler;
pub mod schedule;
pub mod trainer;

pub use checkpoint::{export_teacher_backbone, CheckpointMeta, CheckpointStore};
pub use dispatch::{MultiCropDispatcher, StudentLogits, TeacherLogits, ViewLayout};
pub use distributed::{Collective, RunContext, SingleProcess, ThreadGroup};
pub use ema::ema_update;
pub use error::{CollectiveError, TrainingError};
pub use loss::{DistillationLoss, DistillationLossRecord, LossOutput};
pub use metrics::MetricLogger;
pub use optimizer::{DistillationOptimizer, DistillationOptimizerRecord, StepSettings};
pub use params::{ParamGroup, ParamRegistry, ParamSlot};
pub use scaler::LossScaler;
pub use schedule::{cosine_schedule, teacher_temperature_schedule, Schedule};
pub use trainer::{build_network_config, EpochStats, Trainer};
