#![warn(
    missing_docs,
    clippy::all,
    clippy::pedantic,
    clippy::nursery,
    clippy::unwrap_used,
    clippy::expect_used
)]
#![deny(unsafe_code)]

use thiserror::Error; // Генерация `Display` и `std::error::Error` по атрибутам.

/// Общий тип ошибки для утилит `utils_crate`.
///
/// Агрегирует ошибки ввода-вывода, (де)сериализации конфигурации и проверки
/// параметров, которые возникают до начала обучения.
#[derive(Error, Debug)] // `Debug` нужен для `Result::unwrap_err` в тестах и вывода через `{:?}`.
pub enum UtilsError {
    /// Ошибка ввода-вывода (I/O).
    ///
    /// Содержит исходную ошибку `std::io::Error` и опционально путь к файлу/директории,
    /// с которым возникла проблема.
    #[error("Ошибка ввода-вывода: {source}")]
    Io {
        /// Исходная ошибка I/O.
        #[source] // `?` на `std::io::Error` дает `UtilsError::Io` без пути (см. `From` ниже).
        source: std::io::Error,
        /// Опциональный путь, связанный с ошибкой I/O.
        path: Option<String>, // Заполняется через `io_with_path`.
    },

    /// Ошибка сериализации (JSON, TOML).
    #[error("Ошибка сериализации: {0}")]
    Serialization(String),

    /// Ошибка десериализации (JSON, TOML).
    #[error("Ошибка десериализации: {0}")]
    Deserialization(String),

    /// Ошибка конфигурации обучения.
    ///
    /// Например, неверный формат файла или недопустимая комбинация гиперпараметров.
    /// Такие ошибки обнаруживаются на старте, до создания моделей.
    #[error("Ошибка конфигурации: {0}")]
    Config(String), // Сообщение содержит имя поля или раздела TOML.

    /// В утилитарную функцию был передан неверный параметр.
    #[error("Неверный параметр: {0}")]
    InvalidParameter(String),

    /// Запрошенный ресурс (файл, директория) не найден.
    #[error("Ресурс не найден: {0}")]
    ResourceNotFound(String),

    /// Общая ошибка утилиты для случаев, не покрытых другими вариантами.
    #[error("Произошла общая ошибка утилиты: {0}")]
    Generic(String),
}

/// Конвертация из `std::io::Error` в `UtilsError::Io` без пути.
impl From<std::io::Error> for UtilsError {
    fn from(source: std::io::Error) -> Self {
        Self::Io { source, path: None }
    }
}

/// Конвертация из `serde_json::Error` в `UtilsError`.
#[cfg(feature = "config_toml")]
impl From<serde_json::Error> for UtilsError {
    fn from(err: serde_json::Error) -> Self {
        match err.classify() {
            // Ошибки чтения потока остаются ошибками ввода-вывода.
            serde_json::error::Category::Io => Self::Io {
                source: err.into(),
                path: None,
            },
            serde_json::error::Category::Syntax
            | serde_json::error::Category::Data
            | serde_json::error::Category::Eof => {
                Self::Deserialization(format!("Ошибка JSON: {err}"))
            }
        }
    }
}

/// Конвертация из `toml::ser::Error` в `UtilsError::Serialization`.
#[cfg(feature = "config_toml")]
impl From<toml::ser::Error> for UtilsError {
    fn from(err: toml::ser::Error) -> Self {
        Self::Serialization(format!("Ошибка сериализации TOML: {err}"))
    }
}

impl UtilsError {
    /// Вспомогательный конструктор для создания `UtilsError::Io` с указанием пути.
    ///
    /// # Аргументы
    ///
    /// * `source` - Исходная ошибка `std::io::Error`.
    /// * `path` - Путь, с которым возникла проблема.
    pub fn io_with_path(source: std::io::Error, path: impl Into<String>) -> Self {
        Self::Io {
            source,
            path: Some(path.into()),
        }
    }
}
