// training_engine/src/loss.rs

#![warn(missing_docs, clippy::all, clippy::pedantic, clippy::nursery)]
#![deny(unsafe_code, clippy::unwrap_used, clippy::expect_used)]

//! Функция потерь самодистилляции с центрированием и заострением.
//!
//! Для каждого из четырех потоков распределение учителя
//! `softmax((t - center) / temp(epoch))` на каждом глобальном виде
//! сравнивается кросс-энтропией с `log_softmax(s / student_temp)` студента на
//! каждом другом виде того же потока. Слагаемые всех потоков усредняются с
//! общим знаменателем. После вычисления потерь центры потоков сдвигаются к
//! среднему логитов учителя по всем участникам.

use burn::{
    record::Record,
    tensor::{
        activation::{log_softmax, softmax},
        backend::{AutodiffBackend, Backend},
        Tensor, TensorData,
    },
};
use core_burn::Stream;
use tracing::trace;

use crate::{
    dispatch::{split_rows, NUM_GLOBAL_VIEWS},
    params::to_host,
    Collective, StudentLogits, TeacherLogits, TrainingError,
};

/// Сохраняемое состояние функции потерь: четыре центра `[1, out_dim]`.
#[derive(Record, Debug, Clone)]
pub struct DistillationLossRecord<B: Backend> {
    /// Центр глобального потока.
    pub center_cls: Tensor<B, 2>,
    /// Центр верхней полосы.
    pub center_pt1: Tensor<B, 2>,
    /// Центр средней полосы.
    pub center_pt2: Tensor<B, 2>,
    /// Центр нижней полосы.
    pub center_pt3: Tensor<B, 2>,
}

/// Результат шага функции потерь.
#[derive(Debug, Clone)]
pub struct LossOutput<B: Backend> {
    /// Скалярные потери `[1]` с графом вычислений студента.
    pub loss: Tensor<B, 1>,
    /// Число слагаемых по потокам в порядке `Stream::ALL`.
    pub terms: [usize; 4],
}

impl<B: Backend> LossOutput<B> {
    /// Общее число слагаемых.
    #[must_use]
    pub fn total_terms(&self) -> usize {
        self.terms.iter().sum()
    }
}

/// Функция потерь с состоянием центров.
///
/// Центры живут на внутреннем бэкенде и меняются только внутри
/// [`DistillationLoss::compute`], один раз за шаг.
#[derive(Debug, Clone)]
pub struct DistillationLoss<B: AutodiffBackend> {
    centers: [Tensor<B::InnerBackend, 2>; 4],
    teacher_temps: Vec<f64>,
    student_temp: f64,
    center_momentum: f64,
}

impl<B: AutodiffBackend> DistillationLoss<B> {
    /// Создает функцию потерь с нулевыми центрами.
    ///
    /// # Аргументы
    /// * `out_dim` - Размерность логитов.
    /// * `teacher_temps` - Температура учителя по эпохам.
    /// * `student_temp` - Температура студента.
    /// * `center_momentum` - Момент скользящего среднего центров.
    /// * `device` - Устройство центров.
    pub fn new(
        out_dim: usize,
        teacher_temps: Vec<f64>,
        student_temp: f64,
        center_momentum: f64,
        device: &<B::InnerBackend as Backend>::Device,
    ) -> Self {
        Self {
            centers: std::array::from_fn(|_| Tensor::zeros([1, out_dim], device)),
            teacher_temps,
            student_temp,
            center_momentum,
        }
    }

    /// Текущий центр потока.
    #[must_use]
    pub fn center(&self, stream: Stream) -> &Tensor<B::InnerBackend, 2> {
        &self.centers[stream.index()]
    }

    /// Температура учителя на эпохе.
    ///
    /// # Ошибки
    /// `TrainingError::Schedule`, если эпоха вне расписания.
    pub fn teacher_temp(&self, epoch: usize) -> Result<f64, TrainingError> {
        self.teacher_temps.get(epoch).copied().ok_or_else(|| {
            TrainingError::Schedule(format!(
                "Эпоха {} вне расписания температуры длины {}.",
                epoch,
                self.teacher_temps.len()
            ))
        })
    }

    /// Вычисляет потери шага и обновляет центры.
    ///
    /// # Аргументы
    /// * `teacher` - Логиты учителя на двух глобальных видах.
    /// * `student` - Списки логитов студента по потокам.
    /// * `epoch` - Текущая эпоха (выбирает температуру учителя).
    /// * `collective` - Коллективные операции для синхронизации центров.
    ///
    /// # Ошибки
    /// `TrainingError::Shape` при несогласованных размерах,
    /// `TrainingError::NoLossTerms`, если не нашлось ни одной пары видов,
    /// ошибки коллективной операции.
    pub fn compute(
        &mut self,
        teacher: &TeacherLogits<B::InnerBackend>,
        student: &StudentLogits<B>,
        epoch: usize,
        collective: &dyn Collective,
    ) -> Result<LossOutput<B>, TrainingError> {
        let temp = self.teacher_temp(epoch)?;
        let mut total: Option<Tensor<B, 1>> = None;
        let mut terms = [0_usize; 4];

        for stream in Stream::ALL {
            let logits = teacher.stream(stream).clone();
            let [rows, _] = logits.dims();
            let centered = logits.sub(self.centers[stream.index()].clone());
            let probs = softmax(centered.div_scalar(temp), 1);
            let targets = split_rows(probs, NUM_GLOBAL_VIEWS)?;
            let batch = rows / NUM_GLOBAL_VIEWS;

            let log_probs = student
                .stream(stream)
                .iter()
                .map(|chunk| {
                    let [chunk_rows, _] = chunk.dims();
                    if chunk_rows == batch {
                        Ok(log_softmax(chunk.clone().div_scalar(self.student_temp), 1))
                    } else {
                        Err(TrainingError::Shape(format!(
                            "Поток {stream}: кусок студента {chunk_rows} строк, у учителя {batch}."
                        )))
                    }
                })
                .collect::<Result<Vec<_>, _>>()?;

            for (iq, target) in targets.into_iter().enumerate() {
                let q = Tensor::<B, 2>::from_inner(target);
                for (v, log_p) in log_probs.iter().enumerate() {
                    if v == iq {
                        continue;
                    }
                    let term = q.clone().neg().mul(log_p.clone()).sum_dim(1).mean();
                    total = Some(match total {
                        Some(acc) => acc.add(term),
                        None => term,
                    });
                    terms[stream.index()] += 1;
                }
            }
        }

        let count: usize = terms.iter().sum();
        let total = total.ok_or(TrainingError::NoLossTerms)?;
        #[allow(clippy::cast_precision_loss)]
        let loss = total.div_scalar(count as f64);
        trace!("Слагаемых потерь по потокам: {:?}", terms);

        self.update_centers(teacher, collective)?;
        Ok(LossOutput { loss, terms })
    }

    /// Сдвигает центры к среднему логитов учителя по всем участникам.
    ///
    /// Суммы строк четырех потоков упаковываются в один буфер и сводятся одной
    /// операцией `all_reduce_sum`.
    fn update_centers(
        &mut self,
        teacher: &TeacherLogits<B::InnerBackend>,
        collective: &dyn Collective,
    ) -> Result<(), TrainingError> {
        let [rows, out_dim] = teacher.stream(Stream::Cls).dims();
        let mut buffer = Vec::with_capacity(4 * out_dim);
        for stream in Stream::ALL {
            let logits = teacher.stream(stream);
            if logits.dims() != [rows, out_dim] {
                return Err(TrainingError::Shape(format!(
                    "Логиты учителя потока {stream}: {:?}, ожидалось {:?}.",
                    logits.dims(),
                    [rows, out_dim]
                )));
            }
            buffer.extend(to_host(logits.clone().sum_dim(0))?);
        }
        collective.all_reduce_sum(&mut buffer)?;

        #[allow(clippy::cast_precision_loss)]
        let denom = (rows * collective.world_size()) as f32;
        let m = self.center_momentum;
        for stream in Stream::ALL {
            let i = stream.index();
            let mean: Vec<f32> = buffer[i * out_dim..(i + 1) * out_dim]
                .iter()
                .map(|value| value / denom)
                .collect();
            let center = &self.centers[i];
            let batch_center =
                Tensor::<B::InnerBackend, 2>::from_data(TensorData::new(mean, [1, out_dim]), &center.device());
            self.centers[i] = center
                .clone()
                .mul_scalar(m)
                .add(batch_center.mul_scalar(1.0 - m));
        }
        Ok(())
    }

    /// Состояние центров для чекпоинта.
    #[must_use]
    pub fn to_record(&self) -> DistillationLossRecord<B::InnerBackend> {
        let [cls, pt1, pt2, pt3] = self.centers.clone();
        DistillationLossRecord {
            center_cls: cls,
            center_pt1: pt1,
            center_pt2: pt2,
            center_pt3: pt3,
        }
    }

    /// Восстанавливает центры из чекпоинта.
    ///
    /// # Ошибки
    /// `TrainingError::Shape`, если размерность центров не совпадает.
    pub fn load_record(&mut self, record: DistillationLossRecord<B::InnerBackend>) -> Result<(), TrainingError> {
        let centers = [record.center_cls, record.center_pt1, record.center_pt2, record.center_pt3];
        for (ours, theirs) in self.centers.iter().zip(&centers) {
            if ours.dims() != theirs.dims() {
                return Err(TrainingError::Shape(format!(
                    "Центр из чекпоинта {:?}, ожидалось {:?}.",
                    theirs.dims(),
                    ours.dims()
                )));
            }
        }
        self.centers = centers;
        Ok(())
    }
}
