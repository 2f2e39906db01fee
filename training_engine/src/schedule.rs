// training_engine/src/schedule.rs

#![warn(missing_docs, clippy::all, clippy::pedantic, clippy::nursery)]
#![deny(unsafe_code, clippy::unwrap_used, clippy::expect_used)]

//! Расписания гиперпараметров по шагам и эпохам.
//!
//! Все расписания вычисляются один раз до начала обучения и дальше только
//! читаются по глобальному номеру шага `epoch * steps_per_epoch + step`.

use std::f64::consts::PI;

use crate::TrainingError;

/// Неизменяемая последовательность значений, одно на глобальный шаг.
#[derive(Debug, Clone, PartialEq)]
pub struct Schedule {
    values: Vec<f64>,
}

/// `n` равномерно распределенных значений от `start` до `end` включительно.
#[allow(clippy::cast_precision_loss)]
pub(crate) fn linspace(start: f64, end: f64, n: usize) -> Vec<f64> {
    match n {
        0 => Vec::new(),
        1 => vec![start],
        n => (0..n)
            .map(|i| {
                if i == n - 1 {
                    end
                } else {
                    (end - start).mul_add(i as f64 / (n - 1) as f64, start)
                }
            })
            .collect(),
    }
}

impl Schedule {
    /// Расписание из готовых значений.
    #[must_use]
    pub const fn from_values(values: Vec<f64>) -> Self {
        Self { values }
    }

    /// Косинусное расписание с линейным прогревом.
    ///
    /// Первые `warmup_epochs * steps_per_epoch` значений идут линейно от
    /// `start_warmup_value` до `base_value` (оба конца включены), оставшиеся
    /// `n` значений равны `final + 0.5 * (base - final) * (1 + cos(pi * i / n))`.
    ///
    /// # Ошибки
    /// `TrainingError::Schedule`, если прогрев длиннее обучения или длина
    /// результата не равна `epochs * steps_per_epoch`.
    #[allow(clippy::cast_precision_loss)]
    pub fn cosine(
        base_value: f64,
        final_value: f64,
        epochs: usize,
        steps_per_epoch: usize,
        warmup_epochs: usize,
        start_warmup_value: f64,
    ) -> Result<Self, TrainingError> {
        let total = epochs * steps_per_epoch;
        let warmup_iters = warmup_epochs * steps_per_epoch;
        if warmup_iters > total {
            return Err(TrainingError::Schedule(format!(
                "Прогрев ({warmup_epochs} эпох) длиннее обучения ({epochs} эпох)."
            )));
        }

        let mut values = linspace(start_warmup_value, base_value, warmup_iters);
        let n = total - warmup_iters;
        values.extend((0..n).map(|i| {
            let cos = (PI * i as f64 / n as f64).cos();
            (0.5 * (base_value - final_value)).mul_add(1.0 + cos, final_value)
        }));

        if values.len() != total {
            return Err(TrainingError::Schedule(format!(
                "Длина расписания {} не равна epochs * steps_per_epoch = {}.",
                values.len(),
                total
            )));
        }
        Ok(Self { values })
    }

    /// Значение на глобальном шаге.
    ///
    /// # Ошибки
    /// `TrainingError::Schedule`, если шаг вне расписания.
    pub fn at(&self, step: usize) -> Result<f64, TrainingError> {
        self.values.get(step).copied().ok_or_else(|| {
            TrainingError::Schedule(format!(
                "Шаг {} вне расписания длины {}.",
                step,
                self.values.len()
            ))
        })
    }

    /// Длина расписания.
    #[must_use]
    pub fn len(&self) -> usize {
        self.values.len()
    }

    /// Пусто ли расписание.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    /// Все значения.
    #[must_use]
    pub fn values(&self) -> &[f64] {
        &self.values
    }
}

/// Косинусное расписание, см. [`Schedule::cosine`].
///
/// # Ошибки
/// См. [`Schedule::cosine`].
pub fn cosine_schedule(
    base_value: f64,
    final_value: f64,
    epochs: usize,
    steps_per_epoch: usize,
    warmup_epochs: usize,
    start_warmup_value: f64,
) -> Result<Schedule, TrainingError> {
    Schedule::cosine(
        base_value,
        final_value,
        epochs,
        steps_per_epoch,
        warmup_epochs,
        start_warmup_value,
    )
}

/// Температура учителя по эпохам: линейный прогрев от `warmup_temp` до `temp`
/// за `warmup_epochs` эпох, затем константа.
///
/// # Ошибки
/// `TrainingError::Config`, если `warmup_epochs > epochs`.
pub fn teacher_temperature_schedule(
    warmup_temp: f64,
    temp: f64,
    warmup_epochs: usize,
    epochs: usize,
) -> Result<Vec<f64>, TrainingError> {
    if warmup_epochs > epochs {
        return Err(TrainingError::Config(format!(
            "warmup_teacher_temp_epochs ({warmup_epochs}) больше числа эпох ({epochs})."
        )));
    }
    let mut temps = linspace(warmup_temp, temp, warmup_epochs);
    temps.resize(epochs, temp);
    Ok(temps)
}
