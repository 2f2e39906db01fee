// core_burn/src/error.rs

#![warn(missing_docs, clippy::all, clippy::pedantic, clippy::nursery)]
#![deny(unsafe_code, clippy::unwrap_used, clippy::expect_used)]

use burn::record::RecorderError; // Ошибка при сериализации/десериализации (Record).

/// Перечисление всех возможных ошибок, которые могут возникнуть в крейте `core_burn`.
#[derive(thiserror::Error, Debug)] // `thiserror` генерирует `Display` и `Error` по атрибутам `#[error]`.
pub enum BurnCoreError {
    /// Ошибка, связанная с некорректной конфигурацией модели или ее компонентов.
    /// Например, `embed_dim` не делится на число голов.
    #[error("Некорректная конфигурация: {0}")]
    InvalidConfig(String), // Возвращается из `*Config::init` до выделения тензоров.

    /// Ошибка, возникшая при сохранении или загрузке весов.
    #[error("Ошибка записи/чтения Burn (Record): {0}")]
    BurnRecord(#[from] RecorderError), // #[from] позволяет применять `?` к `Recorder::load`.

    /// Несовместимые размеры тензоров (например, изображение не делится на патчи).
    #[error("Несовместимые размеры или форма тензора: {0}")]
    IncompatibleShape(String), // Сообщение содержит ожидаемую и фактическую форму.

    /// Общая или неуточненная ошибка в `core_burn`.
    #[error("Общая ошибка Core Burn: {0}")]
    Generic(String),
}
