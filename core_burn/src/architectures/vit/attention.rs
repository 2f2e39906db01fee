// core_burn/src/architectures/vit/attention.rs

#![warn(missing_docs, clippy::all, clippy::pedantic, clippy::nursery)]
#![deny(unsafe_code, clippy::unwrap_used, clippy::expect_used)]

//! Multi-head self-attention vision transformer с общей проекцией `qkv`.

use burn::{
    config::Config,
    module::Module,
    nn::{Dropout, DropoutConfig, Linear},
    tensor::{activation::softmax, backend::Backend, Tensor},
};

use super::init_linear;
use crate::BurnCoreError;

/// Конфигурация для слоя внимания `VitAttention`.
#[derive(Config, Debug)]
pub struct VitAttentionConfig {
    /// Размерность токена.
    pub d_model: usize,
    /// Количество голов внимания.
    pub num_heads: usize,
    /// Смещение в проекции `qkv`.
    #[config(default = true)]
    pub qkv_bias: bool,
    /// Вероятность дропаута весов внимания.
    #[config(default = 0.0)]
    pub attn_dropout: f64,
    /// Вероятность дропаута после выходной проекции.
    #[config(default = 0.0)]
    pub proj_dropout: f64,
}

impl VitAttentionConfig {
    /// Создает новый экземпляр `VitAttention`.
    ///
    /// # Ошибки
    /// `BurnCoreError::InvalidConfig`, если `d_model` не делится на `num_heads`.
    pub fn init<B: Backend>(&self, device: &B::Device) -> Result<VitAttention<B>, BurnCoreError> {
        if self.num_heads == 0 || self.d_model % self.num_heads != 0 {
            return Err(BurnCoreError::InvalidConfig(format!(
                "d_model ({}) должно быть кратно num_heads ({}).",
                self.d_model, self.num_heads
            )));
        }
        let head_dim = self.d_model / self.num_heads;
        #[allow(clippy::cast_precision_loss)]
        let scale = (head_dim as f64).powf(-0.5);
        Ok(VitAttention {
            qkv: init_linear(self.d_model, self.d_model * 3, self.qkv_bias, device),
            proj: init_linear(self.d_model, self.d_model, true, device),
            attn_dropout: DropoutConfig::new(self.attn_dropout).init(),
            proj_dropout: DropoutConfig::new(self.proj_dropout).init(),
            num_heads: self.num_heads,
            head_dim,
            scale,
        })
    }
}

/// Слой self-attention.
#[derive(Module, Debug)]
pub struct VitAttention<B: Backend> {
    /// Общая проекция для Query, Key и Value.
    qkv: Linear<B>,
    /// Выходная проекция.
    proj: Linear<B>,
    /// Дропаут весов внимания.
    attn_dropout: Dropout,
    /// Дропаут выхода.
    proj_dropout: Dropout,
    /// Количество голов.
    num_heads: usize,
    /// Размерность одной головы.
    head_dim: usize,
    /// Масштаб скоров `head_dim^-0.5`.
    scale: f64,
}

impl<B: Backend> VitAttention<B> {
    /// Выполняет прямой проход через слой внимания.
    ///
    /// # Аргументы
    /// * `hidden_states`: Тензор `[batch, tokens, d_model]`.
    ///
    /// # Возвращает
    /// Кортеж из выхода `[batch, tokens, d_model]` и весов внимания
    /// `[batch, num_heads, tokens, tokens]`.
    pub fn forward(&self, hidden_states: Tensor<B, 3>) -> (Tensor<B, 3>, Tensor<B, 4>) {
        let [batch_size, seq_len, d_model] = hidden_states.dims();

        // Выход qkv раскладывается как [3][num_heads][head_dim] по последней оси.
        let qkv = self.qkv.forward(hidden_states);
        let split = |index: usize| {
            qkv.clone()
                .slice([0..batch_size, 0..seq_len, index * d_model..(index + 1) * d_model])
                .reshape([batch_size, seq_len, self.num_heads, self.head_dim])
                .swap_dims(1, 2)
        };
        let (query, key, value) = (split(0), split(1), split(2));

        let scores = query.matmul(key.transpose()).mul_scalar(self.scale);
        let weights = softmax(scores, 3);
        let attended = self.attn_dropout.forward(weights.clone()).matmul(value);

        let output = attended
            .swap_dims(1, 2)
            .reshape([batch_size, seq_len, d_model]);
        let output = self.proj_dropout.forward(self.proj.forward(output));
        (output, weights)
    }
}
