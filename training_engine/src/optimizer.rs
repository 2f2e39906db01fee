// training_engine/src/optimizer.rs

#![warn(missing_docs, clippy::all, clippy::pedantic, clippy::nursery)]
#![deny(unsafe_code, clippy::unwrap_used, clippy::expect_used)]

//! Оптимизатор студента с двумя группами параметров.
//!
//! Группа 0 (ранг больше 1) получает затухание весов из расписания, группа 1
//! (смещения и веса нормализаций) идет без затухания. Скорость обучения общая.
//! Состояние хранится по позициям реестра параметров; параметры без градиента
//! на шаге (например, замороженный последний слой) пропускаются вместе со
//! своим счетчиком шагов.

use burn::{
    record::Record,
    tensor::{backend::Backend, ElementConversion, Tensor},
};
use tracing::debug;
use utils_crate::OptimizerKind;

use crate::{ParamGroup, ParamRegistry, TrainingError};

const ADAM_BETA1: f64 = 0.9;
const ADAM_BETA2: f64 = 0.999;
const ADAM_EPSILON: f64 = 1e-8;
const MOMENTUM: f64 = 0.9;
const LARS_ETA: f64 = 0.001;
/// Добавка к норме при обрезке градиентов.
const CLIP_EPSILON: f64 = 1e-6;

/// Гиперпараметры одного шага.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct StepSettings {
    /// Скорость обучения для обеих групп.
    pub lr: f64,
    /// Затухание весов группы 0.
    pub weight_decay: f64,
}

/// Сохраняемое состояние оптимизатора.
#[derive(Record, Debug, Clone)]
pub struct DistillationOptimizerRecord<B: Backend> {
    /// Число выполненных шагов по каждому параметру.
    pub steps: Vec<usize>,
    /// Первый момент (AdamW) или буфер момента (SGD, LARS).
    pub first_moment: Vec<Option<Tensor<B, 1>>>,
    /// Второй момент (только AdamW).
    pub second_moment: Vec<Option<Tensor<B, 1>>>,
}

/// Оптимизатор AdamW, SGD или LARS.
#[derive(Debug, Clone)]
pub struct DistillationOptimizer<B: Backend> {
    kind: OptimizerKind,
    groups: Vec<ParamGroup>,
    steps: Vec<usize>,
    first_moment: Vec<Option<Tensor<B, 1>>>,
    second_moment: Vec<Option<Tensor<B, 1>>>,
}

/// L2-норма одномерного тензора.
fn norm<B: Backend>(tensor: &Tensor<B, 1>) -> f64 {
    tensor
        .clone()
        .powf_scalar(2.0)
        .sum()
        .sqrt()
        .into_scalar()
        .elem::<f64>()
}

impl<B: Backend> DistillationOptimizer<B> {
    /// Создает оптимизатор для параметров реестра.
    pub fn new(kind: OptimizerKind, registry: &ParamRegistry) -> Self {
        let n = registry.len();
        let groups: Vec<ParamGroup> = registry.slots().iter().map(|slot| slot.group).collect();
        debug!(
            "Оптимизатор {:?}: {} параметров с затуханием, {} без",
            kind,
            groups.iter().filter(|g| **g == ParamGroup::Regularized).count(),
            groups.iter().filter(|g| **g == ParamGroup::NotRegularized).count()
        );
        Self {
            kind,
            groups,
            steps: vec![0; n],
            first_moment: vec![None; n],
            second_moment: vec![None; n],
        }
    }

    /// Тип оптимизатора.
    #[must_use]
    pub const fn kind(&self) -> OptimizerKind {
        self.kind
    }

    /// Выполняет шаг по всем параметрам, у которых есть градиент.
    ///
    /// # Аргументы
    /// * `params` - Текущие значения параметров в порядке реестра.
    /// * `grads` - Градиенты в порядке реестра.
    /// * `settings` - Скорость обучения и затухание весов шага.
    ///
    /// # Возвращает
    /// Новые значения (`None` для параметров без градиента).
    ///
    /// # Ошибки
    /// `TrainingError::ParameterMismatch`, если длины не совпадают с реестром.
    #[allow(clippy::cast_possible_truncation, clippy::cast_possible_wrap)]
    pub fn step(
        &mut self,
        params: Vec<Tensor<B, 1>>,
        grads: Vec<Option<Tensor<B, 1>>>,
        settings: StepSettings,
    ) -> Result<Vec<Option<Tensor<B, 1>>>, TrainingError> {
        if params.len() != self.groups.len() || grads.len() != self.groups.len() {
            return Err(TrainingError::ParameterMismatch(format!(
                "Оптимизатор на {} параметров получил {} значений и {} градиентов.",
                self.groups.len(),
                params.len(),
                grads.len()
            )));
        }

        let lr = settings.lr;
        let mut updated = Vec::with_capacity(params.len());
        for (i, (param, grad)) in params.into_iter().zip(grads).enumerate() {
            let Some(grad) = grad else {
                updated.push(None);
                continue;
            };
            let group = self.groups[i];
            let wd = match group {
                ParamGroup::Regularized => settings.weight_decay,
                ParamGroup::NotRegularized => 0.0,
            };
            self.steps[i] += 1;

            let new_value = match self.kind {
                OptimizerKind::Adamw => {
                    let step = self.steps[i] as i32;
                    let param = param.mul_scalar(1.0 - lr * wd);
                    let m = match self.first_moment[i].take() {
                        Some(m) => m.mul_scalar(ADAM_BETA1).add(grad.clone().mul_scalar(1.0 - ADAM_BETA1)),
                        None => grad.clone().mul_scalar(1.0 - ADAM_BETA1),
                    };
                    let grad_sq = grad.clone().mul(grad);
                    let v = match self.second_moment[i].take() {
                        Some(v) => v.mul_scalar(ADAM_BETA2).add(grad_sq.mul_scalar(1.0 - ADAM_BETA2)),
                        None => grad_sq.mul_scalar(1.0 - ADAM_BETA2),
                    };
                    let bias_correction1 = 1.0 - ADAM_BETA1.powi(step);
                    let bias_correction2 = 1.0 - ADAM_BETA2.powi(step);
                    let denom = v
                        .clone()
                        .sqrt()
                        .div_scalar(bias_correction2.sqrt())
                        .add_scalar(ADAM_EPSILON);
                    let update = m.clone().div(denom).mul_scalar(lr / bias_correction1);
                    self.first_moment[i] = Some(m);
                    self.second_moment[i] = Some(v);
                    param.sub(update)
                }
                OptimizerKind::Sgd => {
                    let d_p = grad.add(param.clone().mul_scalar(wd));
                    let buf = match self.first_moment[i].take() {
                        Some(buf) => buf.mul_scalar(MOMENTUM).add(d_p),
                        None => d_p,
                    };
                    let new_value = param.sub(buf.clone().mul_scalar(lr));
                    self.first_moment[i] = Some(buf);
                    new_value
                }
                OptimizerKind::Lars => {
                    let mut d_p = grad;
                    if group == ParamGroup::Regularized {
                        d_p = d_p.add(param.clone().mul_scalar(wd));
                        let param_norm = norm(&param);
                        let update_norm = norm(&d_p);
                        let trust = if param_norm > 0.0 && update_norm > 0.0 {
                            LARS_ETA * param_norm / update_norm
                        } else {
                            1.0
                        };
                        d_p = d_p.mul_scalar(trust);
                    }
                    let mu = match self.first_moment[i].take() {
                        Some(mu) => mu.mul_scalar(MOMENTUM).add(d_p),
                        None => d_p,
                    };
                    let new_value = param.sub(mu.clone().mul_scalar(lr));
                    self.first_moment[i] = Some(mu);
                    new_value
                }
            };
            updated.push(Some(new_value));
        }
        Ok(updated)
    }

    /// Состояние для чекпоинта.
    #[must_use]
    pub fn to_record(&self) -> DistillationOptimizerRecord<B> {
        DistillationOptimizerRecord {
            steps: self.steps.clone(),
            first_moment: self.first_moment.clone(),
            second_moment: self.second_moment.clone(),
        }
    }

    /// Восстанавливает состояние из чекпоинта.
    ///
    /// # Ошибки
    /// `TrainingError::ParameterMismatch`, если число параметров не совпадает.
    pub fn load_record(&mut self, record: DistillationOptimizerRecord<B>) -> Result<(), TrainingError> {
        let n = self.groups.len();
        if record.steps.len() != n || record.first_moment.len() != n || record.second_moment.len() != n {
            return Err(TrainingError::ParameterMismatch(format!(
                "Состояние оптимизатора на {} параметров, ожидалось {}.",
                record.steps.len(),
                n
            )));
        }
        self.steps = record.steps;
        self.first_moment = record.first_moment;
        self.second_moment = record.second_moment;
        Ok(())
    }
}

/// Нормы градиентов (`None` для параметров без градиента).
pub fn gradient_norms<B: Backend>(grads: &[Option<Tensor<B, 1>>]) -> Vec<Option<f64>> {
    grads.iter().map(|grad| grad.as_ref().map(norm)).collect()
}

/// Обрезает норму каждого градиента до `clip`: множитель `clip / (norm + 1e-6)`
/// применяется, если он меньше 1.
///
/// # Аргументы
/// * `grads` - Градиенты в порядке реестра.
/// * `norms` - Их нормы из [`gradient_norms`].
/// * `clip` - Порог; 0 отключает обрезку.
pub fn clip_gradients<B: Backend>(
    grads: Vec<Option<Tensor<B, 1>>>,
    norms: &[Option<f64>],
    clip: f64,
) -> Vec<Option<Tensor<B, 1>>> {
    if clip <= 0.0 {
        return grads;
    }
    grads
        .into_iter()
        .zip(norms)
        .map(|(grad, norm)| match (grad, norm) {
            (Some(grad), Some(norm)) => {
                let coef = clip / (norm + CLIP_EPSILON);
                Some(if coef < 1.0 { grad.mul_scalar(coef) } else { grad })
            }
            (grad, _) => grad,
        })
        .collect()
}

/// Убирает градиенты последних слоев подголов, пока `epoch < freeze_last_layer`.
#[must_use]
pub fn cancel_last_layer_gradients<B: Backend>(
    grads: Vec<Option<Tensor<B, 1>>>,
    registry: &ParamRegistry,
    epoch: usize,
    freeze_last_layer: usize,
) -> Vec<Option<Tensor<B, 1>>> {
    if epoch >= freeze_last_layer {
        return grads;
    }
    grads
        .into_iter()
        .zip(registry.slots())
        .map(|(grad, slot)| if slot.last_layer { None } else { grad })
        .collect()
}
