// training_engine/src/params.rs

#![warn(missing_docs, clippy::all, clippy::pedantic, clippy::nursery)]
#![deny(unsafe_code, clippy::unwrap_used, clippy::expect_used)]

//! Упорядоченный реестр параметров студента.
//!
//! Порядок слотов совпадает с порядком обхода модуля `Module::visit`, поэтому
//! одна и та же позиция относится к одному и тому же параметру у студента, у
//! учителя (`student.valid()` сохраняет структуру и идентификаторы) и в
//! состоянии оптимизатора. Вся покомпонентная работа (градиенты, шаг
//! оптимизатора, EMA, рассылка весов) индексируется позициями реестра.

use std::collections::{HashMap, HashSet};

use burn::{
    module::{AutodiffModule, Module, ModuleMapper, ModuleVisitor, ParamId},
    tensor::{
        backend::{AutodiffBackend, Backend},
        Tensor, TensorData,
    },
};
use tracing::debug;

use crate::{RunContext, TrainingError};

/// Группа параметров оптимизатора.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ParamGroup {
    /// Матрицы и тензоры ранга больше 1: получают затухание весов.
    Regularized,
    /// Смещения и веса нормализаций (ранг 1): без затухания.
    NotRegularized,
}

/// Один параметр реестра.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParamSlot {
    /// Идентификатор параметра.
    pub id: ParamId,
    /// Форма.
    pub shape: Vec<usize>,
    /// Группа оптимизатора.
    pub group: ParamGroup,
    /// Параметр последнего слоя одной из подголов.
    pub last_layer: bool,
}

impl ParamSlot {
    /// Число элементов.
    #[must_use]
    pub fn num_elements(&self) -> usize {
        self.shape.iter().product()
    }
}

/// Выгружает тензор в вектор `f32` на хосте.
///
/// # Ошибки
/// `TrainingError::TensorData`, если данные нельзя представить как `f32`.
pub fn to_host<B: Backend, const D: usize>(tensor: Tensor<B, D>) -> Result<Vec<f32>, TrainingError> {
    tensor
        .into_data()
        .convert::<f32>()
        .to_vec::<f32>()
        .map_err(|e| TrainingError::TensorData(format!("{e:?}")))
}

/// Одномерный тензор из значений хоста.
pub fn from_host<B: Backend>(values: Vec<f32>, device: &B::Device) -> Tensor<B, 1> {
    let len = values.len();
    Tensor::from_data(TensorData::new(values, [len]), device)
}

fn flatten<B: Backend, const D: usize>(tensor: Tensor<B, D>) -> Tensor<B, 1> {
    let n = tensor.shape().num_elements();
    tensor.reshape([n])
}

struct SlotCollector {
    slots: Vec<ParamSlot>,
    last_layer: HashSet<ParamId>,
}

impl<B: Backend> ModuleVisitor<B> for SlotCollector {
    fn visit_float<const D: usize>(&mut self, id: ParamId, tensor: &Tensor<B, D>) {
        let group = if D > 1 {
            ParamGroup::Regularized
        } else {
            ParamGroup::NotRegularized
        };
        self.slots.push(ParamSlot {
            id,
            shape: tensor.dims().to_vec(),
            group,
            last_layer: self.last_layer.contains(&id),
        });
    }
}

struct ValueCollector<B: Backend> {
    values: Vec<(ParamId, Tensor<B, 1>)>,
}

impl<B: Backend> ModuleVisitor<B> for ValueCollector<B> {
    fn visit_float<const D: usize>(&mut self, id: ParamId, tensor: &Tensor<B, D>) {
        self.values.push((id, flatten(tensor.clone())));
    }
}

struct GradientCollector<'a, B: AutodiffBackend> {
    grads: &'a B::Gradients,
    values: Vec<(ParamId, Option<Tensor<B::InnerBackend, 1>>)>,
}

impl<B: AutodiffBackend> ModuleVisitor<B> for GradientCollector<'_, B> {
    fn visit_float<const D: usize>(&mut self, id: ParamId, tensor: &Tensor<B, D>) {
        self.values.push((id, tensor.grad(self.grads).map(flatten)));
    }
}

/// Записывает новые значения в параметры по их позиции в реестре.
struct ValueWriter<'a, B: Backend> {
    index: &'a HashMap<ParamId, usize>,
    updates: Vec<Option<Tensor<B, 1>>>,
    mismatches: Vec<String>,
}

impl<B: Backend> ModuleMapper<B> for ValueWriter<'_, B> {
    fn map_float<const D: usize>(&mut self, id: ParamId, tensor: Tensor<B, D>) -> Tensor<B, D> {
        let Some(update) = self.index.get(&id).and_then(|&i| self.updates.get_mut(i)).and_then(Option::take) else {
            return tensor;
        };
        let dims = tensor.dims();
        if update.dims()[0] != tensor.shape().num_elements() {
            self.mismatches.push(format!("{id:?}: {:?} <- {}", dims, update.dims()[0]));
            return tensor;
        }
        let value = update.reshape(dims);
        if tensor.is_require_grad() {
            value.require_grad()
        } else {
            value
        }
    }
}

/// Реестр параметров.
#[derive(Debug, Clone)]
pub struct ParamRegistry {
    slots: Vec<ParamSlot>,
    index: HashMap<ParamId, usize>,
}

impl ParamRegistry {
    /// Строит реестр обходом модуля.
    ///
    /// # Аргументы
    /// * `module` - Модуль студента.
    /// * `last_layer_ids` - Параметры последних слоев подголов.
    pub fn from_module<B: Backend, M: Module<B>>(module: &M, last_layer_ids: &[ParamId]) -> Self {
        let mut collector = SlotCollector {
            slots: Vec::new(),
            last_layer: last_layer_ids.iter().copied().collect(),
        };
        module.visit(&mut collector);
        let index = collector
            .slots
            .iter()
            .enumerate()
            .map(|(i, slot)| (slot.id, i))
            .collect();
        let registry = Self {
            slots: collector.slots,
            index,
        };
        debug!(
            "Реестр параметров: {} слотов, {} элементов, {} в последних слоях",
            registry.len(),
            registry.num_elements(),
            registry.slots.iter().filter(|s| s.last_layer).count()
        );
        registry
    }

    /// Слоты в порядке обхода.
    #[must_use]
    pub fn slots(&self) -> &[ParamSlot] {
        &self.slots
    }

    /// Число слотов.
    #[must_use]
    pub fn len(&self) -> usize {
        self.slots.len()
    }

    /// Пуст ли реестр.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }

    /// Общее число элементов всех параметров.
    #[must_use]
    pub fn num_elements(&self) -> usize {
        self.slots.iter().map(ParamSlot::num_elements).sum()
    }

    /// Позиция параметра в реестре.
    #[must_use]
    pub fn position(&self, id: &ParamId) -> Option<usize> {
        self.index.get(id).copied()
    }

    /// Проверяет, что другой модуль (учитель) имеет те же слоты в том же порядке.
    ///
    /// # Ошибки
    /// `TrainingError::ParameterMismatch` при расхождении числа, формы или идентификаторов.
    pub fn check_compatible<B: Backend, M: Module<B>>(&self, other: &M) -> Result<(), TrainingError> {
        let mut collector = SlotCollector {
            slots: Vec::new(),
            last_layer: HashSet::new(),
        };
        other.visit(&mut collector);
        if collector.slots.len() != self.slots.len() {
            return Err(TrainingError::ParameterMismatch(format!(
                "У студента {} параметров, у учителя {}.",
                self.slots.len(),
                collector.slots.len()
            )));
        }
        for (i, (ours, theirs)) in self.slots.iter().zip(&collector.slots).enumerate() {
            if ours.id != theirs.id || ours.shape != theirs.shape {
                return Err(TrainingError::ParameterMismatch(format!(
                    "Слот {}: {:?} {:?} против {:?} {:?}.",
                    i, ours.id, ours.shape, theirs.id, theirs.shape
                )));
            }
        }
        Ok(())
    }

    fn ordered<T>(&self, values: Vec<(ParamId, T)>) -> Result<Vec<T>, TrainingError> {
        if values.len() != self.slots.len() {
            return Err(TrainingError::ParameterMismatch(format!(
                "Ожидалось {} параметров, обход дал {}.",
                self.slots.len(),
                values.len()
            )));
        }
        values
            .into_iter()
            .zip(&self.slots)
            .map(|((id, value), slot)| {
                if id == slot.id {
                    Ok(value)
                } else {
                    Err(TrainingError::ParameterMismatch(format!(
                        "Порядок обхода изменился: {:?} вместо {:?}.",
                        id, slot.id
                    )))
                }
            })
            .collect()
    }

    /// Значения параметров модуля в порядке реестра, каждый как одномерный тензор.
    ///
    /// # Ошибки
    /// `TrainingError::ParameterMismatch`, если структура модуля не совпадает с реестром.
    pub fn collect_values<B: Backend, M: Module<B>>(&self, module: &M) -> Result<Vec<Tensor<B, 1>>, TrainingError> {
        let mut collector = ValueCollector { values: Vec::new() };
        module.visit(&mut collector);
        self.ordered(collector.values)
    }

    /// Градиенты параметров студента в порядке реестра (`None`, если параметр
    /// не участвовал в вычислении потерь).
    ///
    /// # Ошибки
    /// `TrainingError::ParameterMismatch`, если структура модуля не совпадает с реестром.
    pub fn collect_gradients<B: AutodiffBackend, M: AutodiffModule<B>>(
        &self,
        module: &M,
        grads: &B::Gradients,
    ) -> Result<Vec<Option<Tensor<B::InnerBackend, 1>>>, TrainingError> {
        let mut collector = GradientCollector {
            grads,
            values: Vec::new(),
        };
        module.visit(&mut collector);
        self.ordered(collector.values)
    }

    /// Заменяет значения параметров, для которых передано `Some`.
    ///
    /// Параметры, требовавшие градиент, снова помечаются `require_grad`.
    ///
    /// # Ошибки
    /// `TrainingError::ParameterMismatch`, если число значений или элементов не совпадает.
    pub fn write_values<B: Backend, M: Module<B>>(
        &self,
        module: M,
        updates: Vec<Option<Tensor<B, 1>>>,
    ) -> Result<M, TrainingError> {
        if updates.len() != self.slots.len() {
            return Err(TrainingError::ParameterMismatch(format!(
                "Передано {} обновлений для {} параметров.",
                updates.len(),
                self.slots.len()
            )));
        }
        let mut writer = ValueWriter {
            index: &self.index,
            updates,
            mismatches: Vec::new(),
        };
        let module = module.map(&mut writer);
        if writer.mismatches.is_empty() {
            Ok(module)
        } else {
            Err(TrainingError::ParameterMismatch(writer.mismatches.join("; ")))
        }
    }

    /// Рассылает параметры главного процесса всем участникам.
    ///
    /// # Ошибки
    /// Ошибки коллективной операции или выгрузки данных.
    pub fn broadcast_from_main<B: Backend, M: Module<B>>(&self, module: M, ctx: &RunContext) -> Result<M, TrainingError> {
        if ctx.world_size == 1 {
            return Ok(module);
        }
        let values = self.collect_values(&module)?;
        let device = values
            .first()
            .map(Tensor::device)
            .ok_or_else(|| TrainingError::ParameterMismatch("Модуль без параметров.".to_string()))?;
        let mut buffer = Vec::with_capacity(self.num_elements());
        for value in values {
            buffer.extend(to_host(value)?);
        }
        ctx.collective.broadcast(&mut buffer, 0)?;

        let mut offset = 0;
        let updates = self
            .slots
            .iter()
            .map(|slot| {
                let n = slot.num_elements();
                let chunk = buffer[offset..offset + n].to_vec();
                offset += n;
                Some(from_host::<B>(chunk, &device))
            })
            .collect();
        debug!("Параметры получены от ранга 0 ({} элементов)", buffer.len());
        self.write_values(module, updates)
    }
}

/// Усредняет градиенты по участникам одной упакованной операцией.
///
/// Позиции `None` одинаковы у всех участников (одинаковый граф вычислений) и
/// в буфер не попадают.
///
/// # Ошибки
/// Ошибки коллективной операции или выгрузки данных.
pub fn sync_gradients<B: Backend>(
    grads: Vec<Option<Tensor<B, 1>>>,
    ctx: &RunContext,
) -> Result<Vec<Option<Tensor<B, 1>>>, TrainingError> {
    if ctx.world_size == 1 {
        return Ok(grads);
    }
    let mut buffer = Vec::new();
    let mut layout = Vec::with_capacity(grads.len());
    for grad in grads {
        match grad {
            Some(grad) => {
                let device = grad.device();
                let host = to_host(grad)?;
                layout.push(Some((host.len(), device)));
                buffer.extend(host);
            }
            None => layout.push(None),
        }
    }
    ctx.all_reduce_mean(&mut buffer)?;

    let mut offset = 0;
    Ok(layout
        .into_iter()
        .map(|entry| {
            entry.map(|(n, device)| {
                let chunk = buffer[offset..offset + n].to_vec();
                offset += n;
                from_host::<B>(chunk, &device)
            })
        })
        .collect())
}
