// core_burn/src/lib.rs

// Включаем строгие правила линтинга для всего крейта.
#![warn(
    missing_docs, // Предупреждать об отсутствующей документации для публичных элементов.
    clippy::all, // Все стандартные проверки Clippy.
    clippy::pedantic, // Более строгие ("педантичные") проверки Clippy.
    clippy::nursery // Экспериментальные проверки Clippy (могут быть нестабильны).
)]
// Запрещаем использование небезопасных конструкций и потенциально проблемных методов.
#![deny(
    unsafe_code, // Запрет `unsafe` блоков без явного `allow`.
    clippy::unwrap_used, // Запрет использования `.unwrap()`.
    clippy::expect_used // Запрет использования `.expect()`.
)]

//! # `core_burn`
//!
//! Ядро моделей для самодистилляции с part-токенами на фреймворке
//! [Burn](https://burn.dev/). Крейт предоставляет vision transformer, который
//! кроме глобального `[CLS]` токена несет три part-токена (верхняя, средняя и
//! нижняя горизонтальные полосы изображения), проекционную голову из четырех
//! независимых подголов и сеть, объединяющую их.
//!
//! ## Структура
//!
//! - `part`: потоки (`cls`, `pt1`, `pt2`, `pt3`) и селектор части.
//! - `backbone`: контракт прямого прохода backbone.
//! - `architectures`: vision transformer и его пресеты (`vit_tiny`, `vit_small`, `vit_base`).
//! - `pos_embed`: бикубическая интерполяция позиционных эмбеддингов на другую сетку патчей.
//! - `head`: проекционная голова с четырьмя подголовами.
//! - `network`: backbone + голова, единый вход для студента и учителя.
//! - `error`: тип ошибки крейта.

// Объявляем публичные модули, входящие в состав крейта.
pub mod architectures;
pub mod backbone;
pub mod error;
pub mod head;
pub mod network;
pub mod part;
pub mod pos_embed;

// Ошибки
pub use error::BurnCoreError;

// Потоки и селектор части
pub use part::{PartIndex, PartSelector, Stream};

// Контракт backbone
pub use backbone::{Backbone, Embeddings};

// Архитектуры и их конфигурации
pub use architectures::vit::{
    VisionTransformer, VisionTransformerConfig, VisionTransformerRecord, VitAttention,
    VitAttentionConfig, VitBlock, VitBlockConfig, VitMlp, VitMlpConfig,
};
pub use architectures::VitVariant;

// Голова и сеть
pub use head::{ProjectionHead, ProjectionHeadConfig, ProjectionHeadRecord, StreamLogits};
pub use network::{MultiCropNetwork, MultiCropNetworkConfig, MultiCropNetworkRecord, PartAwareNetwork};
