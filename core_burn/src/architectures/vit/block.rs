// core_burn/src/architectures/vit/block.rs

#![warn(missing_docs, clippy::all, clippy::pedantic, clippy::nursery)]
#![deny(unsafe_code, clippy::unwrap_used, clippy::expect_used)]

//! Pre-norm блок трансформера и stochastic depth.

use burn::{
    config::Config,
    module::Module,
    nn::{LayerNorm, LayerNormConfig},
    tensor::{backend::Backend, Distribution, Tensor},
};

use super::{VitAttention, VitAttentionConfig, VitMlp, VitMlpConfig};
use crate::BurnCoreError;

/// Stochastic depth: с вероятностью `prob` обнуляет остаточную ветвь целого примера.
///
/// Как и `Dropout` в Burn, активен только на бэкенде с автодифференцированием,
/// поэтому учитель на внутреннем бэкенде всегда детерминирован.
#[derive(Module, Clone, Debug)]
pub struct DropPath {
    /// Вероятность отбросить ветвь.
    pub prob: f64,
}

impl DropPath {
    /// Создает слой с заданной вероятностью.
    #[must_use]
    pub const fn new(prob: f64) -> Self {
        Self { prob }
    }

    /// Применяет маску по первой оси (пример пакета).
    pub fn forward<B: Backend, const D: usize>(&self, input: Tensor<B, D>) -> Tensor<B, D> {
        if self.prob <= 0.0 || !B::ad_enabled() {
            return input;
        }
        let keep = 1.0 - self.prob;
        let mut shape = [1_usize; D];
        shape[0] = input.dims()[0];
        let mask = Tensor::<B, D>::random(shape, Distribution::Bernoulli(keep), &input.device());
        input.div_scalar(keep).mul(mask)
    }
}

/// Конфигурация для `VitBlock`.
#[derive(Config, Debug)]
pub struct VitBlockConfig {
    /// Размерность токена.
    pub d_model: usize,
    /// Количество голов внимания.
    pub num_heads: usize,
    /// Отношение ширины MLP к `d_model`.
    #[config(default = 4.0)]
    pub mlp_ratio: f64,
    /// Смещение в проекции `qkv`.
    #[config(default = true)]
    pub qkv_bias: bool,
    /// Дропаут выходов.
    #[config(default = 0.0)]
    pub drop_rate: f64,
    /// Дропаут весов внимания.
    #[config(default = 0.0)]
    pub attn_drop_rate: f64,
    /// Вероятность stochastic depth этого блока.
    #[config(default = 0.0)]
    pub drop_path: f64,
    /// Эпсилон `LayerNorm`.
    #[config(default = 1e-6)]
    pub layer_norm_eps: f64,
}

impl VitBlockConfig {
    /// Создает новый экземпляр `VitBlock`.
    ///
    /// # Ошибки
    /// Пробрасывает ошибку конфигурации внимания.
    #[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss, clippy::cast_precision_loss)]
    pub fn init<B: Backend>(&self, device: &B::Device) -> Result<VitBlock<B>, BurnCoreError> {
        let d_hidden = (self.d_model as f64 * self.mlp_ratio) as usize;
        Ok(VitBlock {
            norm1: LayerNormConfig::new(self.d_model)
                .with_epsilon(self.layer_norm_eps)
                .init(device),
            attn: VitAttentionConfig::new(self.d_model, self.num_heads)
                .with_qkv_bias(self.qkv_bias)
                .with_attn_dropout(self.attn_drop_rate)
                .with_proj_dropout(self.drop_rate)
                .init(device)?,
            drop_path: DropPath::new(self.drop_path),
            norm2: LayerNormConfig::new(self.d_model)
                .with_epsilon(self.layer_norm_eps)
                .init(device),
            mlp: VitMlpConfig::new(self.d_model, d_hidden)
                .with_dropout(self.drop_rate)
                .init(device),
        })
    }
}

/// Pre-norm блок: `x + drop_path(attn(norm1(x)))`, затем `x + drop_path(mlp(norm2(x)))`.
#[derive(Module, Debug)]
pub struct VitBlock<B: Backend> {
    norm1: LayerNorm<B>,
    attn: VitAttention<B>,
    drop_path: DropPath,
    norm2: LayerNorm<B>,
    mlp: VitMlp<B>,
}

impl<B: Backend> VitBlock<B> {
    /// Прямой проход блока.
    pub fn forward(&self, x: Tensor<B, 3>) -> Tensor<B, 3> {
        self.forward_with_attention(x).0
    }

    /// Прямой проход, дополнительно возвращающий веса внимания блока.
    pub fn forward_with_attention(&self, x: Tensor<B, 3>) -> (Tensor<B, 3>, Tensor<B, 4>) {
        let (attended, weights) = self.attn.forward(self.norm1.forward(x.clone()));
        let x = x + self.drop_path.forward(attended);
        let x = x.clone() + self.drop_path.forward(self.mlp.forward(self.norm2.forward(x)));
        (x, weights)
    }
}
