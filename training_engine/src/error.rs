// training_engine/src/error.rs

#![warn(missing_docs, clippy::all, clippy::pedantic, clippy::nursery)]
#![deny(unsafe_code, clippy::unwrap_used, clippy::expect_used)]

use burn::record::RecorderError; // Сохранение и загрузка `.mpk`.
use core_burn::BurnCoreError; // Ошибки построения и применения модели.
use utils_crate::UtilsError; // Ошибки конфигурации и путей.

/// Ошибки коллективных операций между процессами обучения.
#[derive(thiserror::Error, Debug)]
pub enum CollectiveError {
    /// Другой участник группы паниковал, удерживая общий буфер.
    #[error("Общее состояние группы повреждено: {0}")]
    Poisoned(String), // Текст `PoisonError`; барьеры при этом все равно проходятся.

    /// Участники передали буферы разной длины.
    #[error("Несовпадение длины буфера: ожидалось {expected}, получено {actual}")]
    LengthMismatch {
        /// Длина буфера текущего участника.
        expected: usize,
        /// Длина буфера другого участника.
        actual: usize,
    },

    /// Ранг-источник вне группы.
    #[error("Ранг {root} вне группы размера {world_size}")]
    InvalidRoot {
        /// Запрошенный ранг-источник.
        root: usize,
        /// Размер группы.
        world_size: usize,
    },
}

/// Ошибки обучения.
#[derive(thiserror::Error, Debug)] // Все варианты приводятся к `anyhow::Error` в CLI.
pub enum TrainingError {
    /// Недопустимая конфигурация, обнаруженная на старте.
    #[error("Ошибка конфигурации обучения: {0}")]
    Config(String),

    /// Расписание построено неверно или запрошен шаг вне его.
    #[error("Ошибка расписания: {0}")]
    Schedule(String),

    /// Значение функции потерь перестало быть конечным. Обучение прекращается.
    #[error("Значение потерь {loss} не конечно (эпоха {epoch}, шаг {step}), обучение остановлено")]
    NonFiniteLoss {
        /// Значение потерь.
        loss: f64,
        /// Эпоха.
        epoch: usize,
        /// Глобальный шаг.
        step: usize,
    }, // CLI распознает этот вариант через `downcast_ref` и пишет отдельное сообщение.

    /// Ни одной пары (учитель, студент) для функции потерь.
    #[error("Нет ни одного слагаемого функции потерь")]
    NoLossTerms,

    /// Формы или количество выходов сети не согласованы.
    #[error("Несогласованные выходы: {0}")]
    Shape(String),

    /// Реестры параметров студента и учителя не совпадают.
    #[error("Несовпадение параметров: {0}")]
    ParameterMismatch(String),

    /// Ошибка коллективной операции.
    #[error(transparent)] // Текст исходной ошибки без дополнительного префикса.
    Collective(#[from] CollectiveError),

    /// Ошибка модели.
    #[error(transparent)]
    Model(#[from] BurnCoreError),

    /// Ошибка утилит (конфигурация, пути, логирование).
    #[error(transparent)]
    Utils(#[from] UtilsError),

    /// Ошибка записи или чтения Record.
    #[error("Ошибка записи/чтения Burn (Record): {0}")]
    Recorder(#[from] RecorderError),

    /// Ошибка при работе с чекпоинтом.
    #[error("Ошибка чекпоинта: {0}")]
    Checkpoint(String), // Нет ни основного каталога, ни полной копии `.tmp`/`.old`.

    /// Ошибка подготовки данных.
    #[error("Ошибка данных: {0}")]
    Data(String),

    /// Ошибка декодирования изображения.
    #[error("Ошибка изображения: {0}")]
    Image(#[from] image::ImageError), // Битый или неподдерживаемый файл в `ImageFolder`.

    /// Ошибка ввода-вывода.
    #[error("Ошибка ввода-вывода: {0}")]
    Io(#[from] std::io::Error),

    /// Ошибка JSON.
    #[error("Ошибка JSON: {0}")]
    Json(#[from] serde_json::Error),

    /// Ошибка извлечения данных тензора.
    #[error("Ошибка данных тензора: {0}")]
    TensorData(String), // `TensorData::to_vec` с неверным типом элемента.
}
