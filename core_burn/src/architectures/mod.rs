// core_burn/src/architectures/mod.rs

#![warn(missing_docs, clippy::all, clippy::pedantic, clippy::nursery)]
#![deny(unsafe_code, clippy::unwrap_used, clippy::expect_used)]

//! Корневой модуль архитектур backbone.
//!
//! Сейчас поддерживается vision transformer с part-токенами; пресеты размеров
//! описываются перечислением [`VitVariant`].

// Подключаем подмодуль vision transformer.
pub mod vit;

use vit::VisionTransformerConfig;

/// Пресет размера vision transformer.
///
/// Все пресеты имеют глубину 12, `mlp_ratio = 4`, bias в `qkv` и `LayerNorm`
/// с `eps = 1e-6`; различаются шириной и числом голов.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum VitVariant {
    /// 192 канала, 3 головы.
    Tiny,
    /// 384 канала, 6 голов.
    Small,
    /// 768 каналов, 12 голов.
    Base,
}

impl VitVariant {
    /// `(embed_dim, num_heads)` пресета.
    #[must_use]
    pub const fn dims(self) -> (usize, usize) {
        match self {
            Self::Tiny => (192, 3),
            Self::Small => (384, 6),
            Self::Base => (768, 12),
        }
    }

    /// Конфигурация backbone для пресета.
    ///
    /// # Аргументы
    /// * `img_size` - Размер глобального вида `[высота, ширина]`, по нему задается сетка позиционных эмбеддингов.
    /// * `patch_size` - Размер патча.
    /// * `drop_path_rate` - Максимальная вероятность stochastic depth (0 для учителя).
    #[must_use]
    pub fn config(self, img_size: [usize; 2], patch_size: usize, drop_path_rate: f64) -> VisionTransformerConfig {
        let (embed_dim, num_heads) = self.dims();
        VisionTransformerConfig::new()
            .with_img_size(img_size)
            .with_patch_size(patch_size)
            .with_embed_dim(embed_dim)
            .with_depth(12)
            .with_num_heads(num_heads)
            .with_mlp_ratio(4.0)
            .with_qkv_bias(true)
            .with_layer_norm_eps(1e-6)
            .with_drop_path_rate(drop_path_rate)
    }
}
