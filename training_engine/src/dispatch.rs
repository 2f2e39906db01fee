// training_engine/src/dispatch.rs

#![warn(missing_docs, clippy::all, clippy::pedantic, clippy::nursery)]
#![deny(unsafe_code, clippy::unwrap_used, clippy::expect_used)]

//! Раскладка видов по режимам прямого прохода и сборка списков по потокам.
//!
//! Виды шага упорядочены так: два глобальных, затем локальные виды полосы 0,
//! полосы 1 и полосы 2, по `local_crops_number / 3` на полосу. Учитель видит
//! только глобальные виды в режиме всех частей. Студент видит все виды:
//! глобальные в режиме всех частей, локальные виды полосы `k` в режиме
//! `Part(k)`.

use std::ops::Range;

use burn::tensor::{backend::Backend, Tensor};
use core_burn::{part::NUM_PARTS, PartAwareNetwork, PartIndex, PartSelector, Stream, StreamLogits};
use tracing::debug;

use crate::TrainingError;

/// Число глобальных видов.
pub const NUM_GLOBAL_VIEWS: usize = 2;

/// Раскладка видов одного шага.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ViewLayout {
    per_band: usize,
    dropped: usize,
}

impl ViewLayout {
    /// Раскладка для `local_crops_number` локальных видов (деление вниз).
    #[must_use]
    pub const fn new(local_crops_number: usize) -> Self {
        Self {
            per_band: local_crops_number / NUM_PARTS,
            dropped: local_crops_number % NUM_PARTS,
        }
    }

    /// Локальных видов на полосу.
    #[must_use]
    pub const fn per_band(&self) -> usize {
        self.per_band
    }

    /// Сколько локальных видов отбрасывается.
    #[must_use]
    pub const fn dropped(&self) -> usize {
        self.dropped
    }

    /// Сколько видов используется на шаге.
    #[must_use]
    pub const fn num_views(&self) -> usize {
        NUM_GLOBAL_VIEWS + NUM_PARTS * self.per_band
    }

    /// Позиции видов полосы в общем списке.
    #[must_use]
    pub const fn band_range(&self, band: PartIndex) -> Range<usize> {
        let start = NUM_GLOBAL_VIEWS + band.index() * self.per_band;
        start..start + self.per_band
    }

    /// Длина списка студента для потока: все виды для `cls`, глобальные и
    /// виды своей полосы для частей.
    #[must_use]
    pub const fn stream_len(&self, stream: Stream) -> usize {
        match stream {
            Stream::Cls => self.num_views(),
            Stream::Part1 | Stream::Part2 | Stream::Part3 => NUM_GLOBAL_VIEWS + self.per_band,
        }
    }
}

/// Логиты учителя по потокам, каждый `[2 * batch, out_dim]` (оба глобальных вида подряд).
#[derive(Debug, Clone)]
pub struct TeacherLogits<B: Backend> {
    /// Потоки в порядке `Stream::ALL`.
    pub streams: [Tensor<B, 2>; 4],
}

impl<B: Backend> TeacherLogits<B> {
    /// Логиты потока.
    #[must_use]
    pub fn stream(&self, stream: Stream) -> &Tensor<B, 2> {
        &self.streams[stream.index()]
    }
}

/// Логиты студента по потокам: список кусков по `batch` строк, по одному на вид.
#[derive(Debug, Clone)]
pub struct StudentLogits<B: Backend> {
    /// Списки в порядке `Stream::ALL`.
    pub streams: [Vec<Tensor<B, 2>>; 4],
}

impl<B: Backend> StudentLogits<B> {
    /// Список кусков потока.
    #[must_use]
    pub fn stream(&self, stream: Stream) -> &[Tensor<B, 2>] {
        &self.streams[stream.index()]
    }
}

/// Делит `[n * batch, d]` на `n` кусков по `batch` строк.
pub(crate) fn split_rows<B: Backend>(tensor: Tensor<B, 2>, chunks: usize) -> Result<Vec<Tensor<B, 2>>, TrainingError> {
    let [rows, dim] = tensor.dims();
    if chunks == 0 || rows % chunks != 0 {
        return Err(TrainingError::Shape(format!(
            "{rows} строк нельзя разделить на {chunks} равных кусков."
        )));
    }
    let batch = rows / chunks;
    Ok((0..chunks)
        .map(|i| tensor.clone().slice([i * batch..(i + 1) * batch, 0..dim]))
        .collect())
}

/// Диспетчер видов.
#[derive(Debug, Clone, Copy)]
pub struct MultiCropDispatcher {
    layout: ViewLayout,
}

impl MultiCropDispatcher {
    /// Создает диспетчер для заданного числа локальных видов.
    #[must_use]
    pub const fn new(local_crops_number: usize) -> Self {
        Self {
            layout: ViewLayout::new(local_crops_number),
        }
    }

    /// Раскладка видов.
    #[must_use]
    pub const fn layout(&self) -> ViewLayout {
        self.layout
    }

    fn check_views<B: Backend>(&self, views: &[Tensor<B, 4>], needed: usize) -> Result<(), TrainingError> {
        if views.len() < needed {
            return Err(TrainingError::Shape(format!(
                "Передано {} видов, нужно минимум {}.",
                views.len(),
                needed
            )));
        }
        Ok(())
    }

    /// Прямой проход учителя по двум глобальным видам.
    ///
    /// # Ошибки
    /// `TrainingError::Shape`, если видов меньше двух или сеть вернула не все потоки.
    pub fn teacher_forward<B: Backend, N: PartAwareNetwork<B>>(
        &self,
        network: &N,
        views: &[Tensor<B, 4>],
    ) -> Result<TeacherLogits<B>, TrainingError> {
        self.check_views(views, NUM_GLOBAL_VIEWS)?;
        let globals = Tensor::cat(views[..NUM_GLOBAL_VIEWS].to_vec(), 0);
        match network.forward_views(globals, PartSelector::AllParts)? {
            StreamLogits::AllStreams { cls, pt1, pt2, pt3 } => Ok(TeacherLogits {
                streams: [cls, pt1, pt2, pt3],
            }),
            StreamLogits::PartStream { .. } => Err(TrainingError::Shape(
                "Сеть вернула одну часть в режиме всех частей.".to_string(),
            )),
        }
    }

    /// Прямой проход студента по всем видам.
    ///
    /// Лишние виды сверх `num_views()` игнорируются.
    ///
    /// # Ошибки
    /// `TrainingError::Shape`, если видов меньше, чем требует раскладка, или
    /// сеть вернула выход не того режима.
    pub fn student_forward<B: Backend, N: PartAwareNetwork<B>>(
        &self,
        network: &N,
        views: &[Tensor<B, 4>],
    ) -> Result<StudentLogits<B>, TrainingError> {
        let layout = self.layout;
        self.check_views(views, layout.num_views())?;
        if views.len() > layout.num_views() {
            debug!(
                "Отброшено {} видов сверх раскладки ({} на полосу)",
                views.len() - layout.num_views(),
                layout.per_band()
            );
        }

        let globals = Tensor::cat(views[..NUM_GLOBAL_VIEWS].to_vec(), 0);
        let StreamLogits::AllStreams { cls, pt1, pt2, pt3 } =
            network.forward_views(globals, PartSelector::AllParts)?
        else {
            return Err(TrainingError::Shape(
                "Сеть вернула одну часть в режиме всех частей.".to_string(),
            ));
        };

        let mut streams: [Vec<Tensor<B, 2>>; 4] = [
            split_rows(cls, NUM_GLOBAL_VIEWS)?,
            split_rows(pt1, NUM_GLOBAL_VIEWS)?,
            split_rows(pt2, NUM_GLOBAL_VIEWS)?,
            split_rows(pt3, NUM_GLOBAL_VIEWS)?,
        ];

        if layout.per_band() > 0 {
            for band in PartIndex::ALL {
                let band_views = Tensor::cat(views[layout.band_range(band)].to_vec(), 0);
                match network.forward_views(band_views, PartSelector::Part(band))? {
                    StreamLogits::PartStream { cls, part, index } if index == band => {
                        streams[Stream::Cls.index()].extend(split_rows(cls, layout.per_band())?);
                        streams[band.stream().index()].extend(split_rows(part, layout.per_band())?);
                    }
                    _ => {
                        return Err(TrainingError::Shape(format!(
                            "Сеть вернула выход не для полосы {band:?}."
                        )))
                    }
                }
            }
        }
        Ok(StudentLogits { streams })
    }
}
