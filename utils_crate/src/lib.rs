#![warn(
    missing_docs, // Предупреждать, если публичные элементы не документированы.
    clippy::all,
    clippy::pedantic,
    clippy::nursery,
    clippy::unwrap_used, // Предупреждать об использовании .unwrap()
    clippy::expect_used, // Предупреждать об использовании .expect()
    unused_mut,
    unused_imports
)]
#![deny(unsafe_code)]

//! `utils_crate` предоставляет общие структуры данных, обработку ошибок
//! и распространенные утилиты для воркспейса обучения `pass-hub`.
//!
//! # Основные модули:
//!
//! - [`error`]: Определяет общий тип ошибки `UtilsError`.
//! - [`config`]: (фича `config_toml`) `TrainingConfig` со всеми гиперпараметрами
//!   самодистилляции, загрузка из TOML и проверка на старте.
//! - [`path`]: Утилиты для работы с путями файловой системы.
//! - [`logger`]: (фича `logger_utils_feature`) Инициализация логирования на базе `tracing`
//!   с учетом ранга процесса.
//!
//! # Использование фич (Features)
//!
//! ```toml
//! # utils_crate = { path = "../utils_crate", features = ["logger_utils_feature"] }
//! ```

// --- Модуль для общих ошибок ---
pub mod error;
pub use error::UtilsError; // Реэкспорт для удобства использования.

/// Модуль с утилитами для работы с путями файловой системы.
pub mod path;
pub use path::{append_line, ensure_dir_exists, list_files_recursive};

/// Модуль с утилитами для инициализации логирования.
///
/// Активируется фичей `logger_utils_feature`.
#[cfg(feature = "logger_utils_feature")]
pub mod logger;
#[cfg(feature = "logger_utils_feature")]
pub use logger::init_tracing_logger;

/// Модуль конфигурации обучения.
///
/// Активируется фичей `config_toml`.
#[cfg(feature = "config_toml")]
pub mod config;
#[cfg(feature = "config_toml")]
pub use config::{BackboneArch, OptimizerKind, TrainingConfig};
