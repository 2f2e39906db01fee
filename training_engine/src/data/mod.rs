// training_engine/src/data/mod.rs

#![warn(missing_docs, clippy::all, clippy::pedantic, clippy::nursery)]
#![deny(unsafe_code, clippy::unwrap_used, clippy::expect_used)]

//! Подготовка данных: датасет изображений, распределенный сэмплер,
//! multi-crop аугментации и загрузчик пакетов видов.

pub mod augmentation; // Глобальные и локальные виды одного изображения
pub mod dataset; // Рекурсивный список изображений с фильтром
pub mod loader; // Параллельная сборка пакетов видов
pub mod sampler; // Разбиение индексов по участникам

pub use augmentation::{AugmentedView, MultiCropAugmentation};
pub use dataset::ImageFolder;
pub use loader::MultiCropLoader;
pub use sampler::DistributedSampler;
