// core_burn/src/backbone.rs

#![warn(missing_docs, clippy::all, clippy::pedantic, clippy::nursery)]
#![deny(unsafe_code, clippy::unwrap_used, clippy::expect_used)]

//! Контракт прямого прохода backbone.

use burn::tensor::{backend::Backend, Tensor};

use crate::{BurnCoreError, PartIndex, PartSelector};

/// Эмбеддинги, которые backbone возвращает для пакета изображений.
///
/// Каждый тензор имеет форму `[batch, embed_dim]`.
#[derive(Debug, Clone)]
pub enum Embeddings<B: Backend> {
    /// Ответ на `PartSelector::AllParts`.
    AllParts {
        /// Глобальный эмбеддинг.
        cls: Tensor<B, 2>,
        /// Эмбеддинги верхней, средней и нижней полос.
        parts: [Tensor<B, 2>; 3],
    },
    /// Ответ на `PartSelector::Part(index)`.
    Part {
        /// Глобальный эмбеддинг.
        cls: Tensor<B, 2>,
        /// Эмбеддинг выбранной полосы.
        part: Tensor<B, 2>,
        /// Какая полоса была выбрана.
        index: PartIndex,
    },
}

/// Backbone, понимающий селектор части.
pub trait Backbone<B: Backend> {
    /// Размерность эмбеддингов.
    fn embed_dim(&self) -> usize;

    /// Прямой проход для пакета изображений `[batch, channels, height, width]`.
    ///
    /// # Ошибки
    /// `BurnCoreError::IncompatibleShape`, если размер изображения не кратен размеру патча
    /// или число каналов не совпадает с конфигурацией.
    fn embed(&self, images: Tensor<B, 4>, selector: PartSelector) -> Result<Embeddings<B>, BurnCoreError>;
}
