// training_engine/src/scaler.rs

#![warn(missing_docs, clippy::all, clippy::pedantic, clippy::nursery)]
#![deny(unsafe_code, clippy::unwrap_used, clippy::expect_used)]

//! Динамическое масштабирование потерь.
//!
//! Потери умножаются на `scale` перед обратным проходом, градиенты делятся на
//! него перед обрезкой и шагом. Если среди градиентов нашлись `inf`/`NaN`,
//! шаг оптимизатора пропускается, а масштаб уменьшается; после
//! `growth_interval` чистых шагов подряд масштаб растет.

use burn::tensor::{backend::Backend, Tensor};
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

/// Состояние масштабирования; сохраняется в чекпоинт как `fp16_scaler`.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct LossScaler {
    /// Текущий множитель.
    pub scale: f64,
    /// Во сколько раз растет множитель.
    pub growth_factor: f64,
    /// Во сколько раз падает множитель при переполнении.
    pub backoff_factor: f64,
    /// Сколько чистых шагов нужно для роста.
    pub growth_interval: usize,
    /// Чистых шагов подряд с последнего изменения.
    pub growth_tracker: usize,
}

impl Default for LossScaler {
    fn default() -> Self {
        Self {
            scale: 65536.0,
            growth_factor: 2.0,
            backoff_factor: 0.5,
            growth_interval: 2000,
            growth_tracker: 0,
        }
    }
}

impl LossScaler {
    /// Умножает потери на текущий множитель.
    pub fn scale_loss<B: Backend>(&self, loss: Tensor<B, 1>) -> Tensor<B, 1> {
        loss.mul_scalar(self.scale)
    }

    /// Делит градиенты на текущий множитель.
    #[must_use]
    pub fn unscale<B: Backend>(&self, grads: Vec<Option<Tensor<B, 1>>>) -> Vec<Option<Tensor<B, 1>>> {
        let inv = 1.0 / self.scale;
        grads
            .into_iter()
            .map(|grad| grad.map(|g| g.mul_scalar(inv)))
            .collect()
    }

    /// Обновляет множитель после шага.
    ///
    /// # Аргументы
    /// * `found_inf` - Были ли среди градиентов неконечные значения.
    pub fn update(&mut self, found_inf: bool) {
        if found_inf {
            self.scale *= self.backoff_factor;
            self.growth_tracker = 0;
            warn!(
                "Неконечные градиенты: шаг пропущен, масштаб потерь снижен до {}",
                self.scale
            );
        } else {
            self.growth_tracker += 1;
            if self.growth_tracker >= self.growth_interval {
                self.scale *= self.growth_factor;
                self.growth_tracker = 0;
                debug!("Масштаб потерь увеличен до {}", self.scale);
            }
        }
    }
}
