// core_burn/src/architectures/vit/mod.rs

#![warn(missing_docs, clippy::all, clippy::pedantic, clippy::nursery)]
#![deny(unsafe_code, clippy::unwrap_used, clippy::expect_used)]

//! Vision transformer с `[CLS]` и тремя part-токенами.
//!
//! Модуль объединяет механизм внимания (`attention`), MLP блока (`ffn`),
//! блок трансформера со stochastic depth (`block`) и саму модель (`model`).

pub mod attention; // Self-attention с общей проекцией qkv
pub mod block; // Pre-norm блок и DropPath
pub mod ffn; // MLP блока
pub mod model; // Patch embedding, токены, позиционные эмбеддинги

// Компоненты внимания
pub use attention::{VitAttention, VitAttentionConfig, VitAttentionRecord};

// Блок трансформера
pub use block::{DropPath, VitBlock, VitBlockConfig, VitBlockRecord};

// MLP
pub use ffn::{VitMlp, VitMlpConfig, VitMlpRecord};

// Основная модель
pub use model::{PatchEmbed, VisionTransformer, VisionTransformerConfig, VisionTransformerRecord};

use burn::{
    module::Param,
    nn::Linear,
    tensor::{backend::Backend, Distribution, Tensor},
};

/// Стандартное отклонение инициализации весов и токенов.
pub(crate) const INIT_STD: f64 = 0.02;

/// Линейный слой с весами `N(0, 0.02)` и нулевым смещением.
pub(crate) fn init_linear<B: Backend>(d_input: usize, d_output: usize, bias: bool, device: &B::Device) -> Linear<B> {
    Linear {
        weight: Param::from_tensor(Tensor::random(
            [d_input, d_output],
            Distribution::Normal(0.0, INIT_STD),
            device,
        )),
        bias: bias.then(|| Param::from_tensor(Tensor::zeros([d_output], device))),
    }
}
