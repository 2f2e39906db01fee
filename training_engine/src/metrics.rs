// training_engine/src/metrics.rs

#![warn(missing_docs, clippy::all, clippy::pedantic, clippy::nursery)]
#![deny(unsafe_code, clippy::unwrap_used, clippy::expect_used)]

//! Сглаженные метрики обучения и журнал эпох `log.txt`.

use std::{
    collections::{BTreeMap, VecDeque},
    fmt,
    path::Path,
};

use serde_json::{Map, Number, Value};
use utils_crate::append_line;

use crate::{RunContext, TrainingError};

/// Размер окна сглаживания.
pub const DEFAULT_WINDOW: usize = 20;

/// Значение с окном последних наблюдений и средним за все время.
#[derive(Debug, Clone, PartialEq)]
pub struct SmoothedValue {
    window: VecDeque<f64>,
    window_size: usize,
    total: f64,
    count: usize,
}

impl SmoothedValue {
    /// Пустое значение с окном `window_size`.
    #[must_use]
    pub fn new(window_size: usize) -> Self {
        Self {
            window: VecDeque::with_capacity(window_size),
            window_size: window_size.max(1),
            total: 0.0,
            count: 0,
        }
    }

    /// Добавляет наблюдение.
    pub fn update(&mut self, value: f64) {
        if self.window.len() == self.window_size {
            self.window.pop_front();
        }
        self.window.push_back(value);
        self.total += value;
        self.count += 1;
    }

    /// Медиана окна.
    #[must_use]
    pub fn median(&self) -> f64 {
        let mut sorted: Vec<f64> = self.window.iter().copied().collect();
        sorted.sort_by(f64::total_cmp);
        sorted.get(sorted.len().saturating_sub(1) / 2).copied().unwrap_or(0.0)
    }

    /// Среднее окна.
    #[must_use]
    #[allow(clippy::cast_precision_loss)]
    pub fn avg(&self) -> f64 {
        if self.window.is_empty() {
            0.0
        } else {
            self.window.iter().sum::<f64>() / self.window.len() as f64
        }
    }

    /// Среднее за все время.
    #[must_use]
    #[allow(clippy::cast_precision_loss)]
    pub fn global_avg(&self) -> f64 {
        if self.count == 0 {
            0.0
        } else {
            self.total / self.count as f64
        }
    }

    /// Последнее наблюдение.
    #[must_use]
    pub fn value(&self) -> f64 {
        self.window.back().copied().unwrap_or(0.0)
    }

    /// Число наблюдений.
    #[must_use]
    pub const fn count(&self) -> usize {
        self.count
    }
}

impl fmt::Display for SmoothedValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:.6} ({:.6})", self.median(), self.global_avg())
    }
}

/// Набор именованных метрик одной эпохи.
#[derive(Debug, Clone, Default)]
pub struct MetricLogger {
    meters: BTreeMap<String, SmoothedValue>,
}

impl MetricLogger {
    /// Пустой набор.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Добавляет наблюдение метрики.
    pub fn update(&mut self, name: &str, value: f64) {
        self.meters
            .entry(name.to_string())
            .or_insert_with(|| SmoothedValue::new(DEFAULT_WINDOW))
            .update(value);
    }

    /// Метрика по имени.
    #[must_use]
    pub fn meter(&self, name: &str) -> Option<&SmoothedValue> {
        self.meters.get(name)
    }

    /// Суммирует счетчики и суммы всех метрик по участникам.
    ///
    /// Окна остаются локальными; синхронизируются только средние за эпоху.
    /// Набор метрик у всех участников одинаков.
    ///
    /// # Ошибки
    /// Ошибки коллективной операции.
    #[allow(
        clippy::cast_precision_loss,
        clippy::cast_possible_truncation,
        clippy::cast_sign_loss
    )]
    pub fn synchronize(&mut self, ctx: &RunContext) -> Result<(), TrainingError> {
        if ctx.world_size == 1 {
            return Ok(());
        }
        let mut buffer: Vec<f32> = self
            .meters
            .values()
            .flat_map(|meter| [meter.count as f32, meter.total as f32])
            .collect();
        ctx.collective.all_reduce_sum(&mut buffer)?;
        for (meter, pair) in self.meters.values_mut().zip(buffer.chunks_exact(2)) {
            meter.count = pair[0].round() as usize;
            meter.total = f64::from(pair[1]);
        }
        Ok(())
    }

    /// Средние за все время по каждой метрике.
    #[must_use]
    pub fn global_averages(&self) -> BTreeMap<String, f64> {
        self.meters
            .iter()
            .map(|(name, meter)| (name.clone(), meter.global_avg()))
            .collect()
    }
}

impl fmt::Display for MetricLogger {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut first = true;
        for (name, meter) in &self.meters {
            if !first {
                f.write_str("  ")?;
            }
            write!(f, "{name}: {meter}")?;
            first = false;
        }
        Ok(())
    }
}

/// Дописывает в журнал строку эпохи `{"train_<метрика>": значение, ..., "epoch": n}`.
///
/// # Ошибки
/// Ошибки записи файла.
pub fn append_epoch_log(path: &Path, averages: &BTreeMap<String, f64>, epoch: usize) -> Result<(), TrainingError> {
    let mut record = Map::new();
    for (name, value) in averages {
        let value = Number::from_f64(*value).map_or(Value::Null, Value::Number);
        record.insert(format!("train_{name}"), value);
    }
    record.insert("epoch".to_string(), Value::from(epoch));
    append_line(path, &Value::Object(record).to_string())?;
    Ok(())
}
