// core_burn/src/architectures/vit/ffn.rs

#![warn(missing_docs, clippy::all, clippy::pedantic, clippy::nursery)]
#![deny(unsafe_code, clippy::unwrap_used, clippy::expect_used)]

//! MLP блока трансформера: `fc1 -> GELU -> dropout -> fc2 -> dropout`.

use burn::{
    config::Config,
    module::Module,
    nn::{Dropout, DropoutConfig, Gelu, Linear},
    tensor::{backend::Backend, Tensor},
};

use super::init_linear;

/// Конфигурация для `VitMlp`.
#[derive(Config, Debug)]
pub struct VitMlpConfig {
    /// Размерность входа и выхода.
    pub d_model: usize,
    /// Размерность скрытого слоя (`d_model * mlp_ratio`).
    pub d_hidden: usize,
    /// Вероятность дропаута после активации и после `fc2`.
    #[config(default = 0.0)]
    pub dropout: f64,
}

impl VitMlpConfig {
    /// Создает новый экземпляр `VitMlp`.
    ///
    /// # Аргументы
    /// * `device`: Устройство Burn, на котором будут инициализированы веса.
    pub fn init<B: Backend>(&self, device: &B::Device) -> VitMlp<B> {
        VitMlp {
            fc1: init_linear(self.d_model, self.d_hidden, true, device),
            fc2: init_linear(self.d_hidden, self.d_model, true, device),
            activation: Gelu::new(),
            dropout: DropoutConfig::new(self.dropout).init(),
        }
    }
}

/// MLP блока vision transformer.
#[derive(Module, Debug)]
pub struct VitMlp<B: Backend> {
    /// Расширяющая проекция.
    fc1: Linear<B>,
    /// Сжимающая проекция.
    fc2: Linear<B>,
    /// Активация.
    activation: Gelu,
    /// Дропаут.
    dropout: Dropout,
}

impl<B: Backend> VitMlp<B> {
    /// Прямой проход.
    ///
    /// # Аргументы
    /// * `hidden_states`: Тензор `[batch, tokens, d_model]`.
    ///
    /// # Возвращает
    /// Тензор той же формы.
    pub fn forward(&self, hidden_states: Tensor<B, 3>) -> Tensor<B, 3> {
        let x = self.fc1.forward(hidden_states);
        let x = self.activation.forward(x);
        let x = self.dropout.forward(x);
        let x = self.fc2.forward(x);
        self.dropout.forward(x)
    }
}
