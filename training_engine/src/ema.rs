// training_engine/src/ema.rs

#![warn(missing_docs, clippy::all, clippy::pedantic, clippy::nursery)]
#![deny(unsafe_code, clippy::unwrap_used, clippy::expect_used)]

//! Обновление учителя экспоненциальным скользящим средним весов студента.

use burn::{
    module::{Module, ModuleMapper, ModuleVisitor, ParamId},
    tensor::{backend::Backend, Tensor},
};

use crate::TrainingError;

struct StudentValues<B: Backend> {
    values: Vec<Tensor<B, 1>>,
}

impl<B: Backend> ModuleVisitor<B> for StudentValues<B> {
    fn visit_float<const D: usize>(&mut self, _id: ParamId, tensor: &Tensor<B, D>) {
        let n = tensor.shape().num_elements();
        self.values.push(tensor.clone().reshape([n]));
    }
}

struct EmaMapper<B: Backend> {
    student: std::vec::IntoIter<Tensor<B, 1>>,
    momentum: f64,
    visited: usize,
    errors: Vec<String>,
}

impl<B: Backend> ModuleMapper<B> for EmaMapper<B> {
    fn map_float<const D: usize>(&mut self, _id: ParamId, tensor: Tensor<B, D>) -> Tensor<B, D> {
        let position = self.visited;
        self.visited += 1;
        let Some(student) = self.student.next() else {
            self.errors.push(format!("у студента нет параметра на позиции {position}"));
            return tensor;
        };
        let dims = tensor.dims();
        let n: usize = dims.iter().product();
        if student.dims()[0] != n {
            self.errors.push(format!(
                "позиция {}: {} элементов у учителя, {} у студента",
                position,
                n,
                student.dims()[0]
            ));
            return tensor;
        }
        tensor
            .mul_scalar(self.momentum)
            .add(student.reshape(dims).mul_scalar(1.0 - self.momentum))
    }
}

/// `teacher = teacher * m + student * (1 - m)` для каждого параметра в порядке обхода.
///
/// Студент передается без графа вычислений (обычно `student.valid()`), учитель
/// живет на том же бэкенде. При `m = 1` учитель не меняется, при `m = 0`
/// становится копией студента. Скользящие статистики `BatchNorm` не являются
/// параметрами и не усредняются: голова нормализует по статистикам батча.
///
/// # Аргументы
/// * `student` - Источник новых значений.
/// * `teacher` - Обновляемая сеть.
/// * `momentum` - Коэффициент `m` на текущем шаге.
///
/// # Ошибки
/// `TrainingError::ParameterMismatch`, если число параметров или элементов различается.
pub fn ema_update<B: Backend, M: Module<B>>(student: &M, teacher: M, momentum: f64) -> Result<M, TrainingError> {
    let mut values = StudentValues { values: Vec::new() };
    student.visit(&mut values);
    let student_count = values.values.len();

    let mut mapper = EmaMapper {
        student: values.values.into_iter(),
        momentum,
        visited: 0,
        errors: Vec::new(),
    };
    let teacher = teacher.map(&mut mapper);

    if mapper.visited != student_count {
        mapper.errors.push(format!(
            "у студента {} параметров, у учителя {}",
            student_count, mapper.visited
        ));
    }
    if mapper.errors.is_empty() {
        Ok(teacher)
    } else {
        Err(TrainingError::ParameterMismatch(format!(
            "EMA учителя: {}",
            mapper.errors.join("; ")
        )))
    }
}
