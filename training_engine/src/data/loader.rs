// training_engine/src/data/loader.rs

#![warn(missing_docs, clippy::all, clippy::pedantic, clippy::nursery)]
#![deny(unsafe_code, clippy::unwrap_used, clippy::expect_used)]

//! Загрузчик пакетов видов.
//!
//! Примеры пакета декодируются и аугментируются параллельно в собственном
//! пуле `rayon`. Генератор каждого примера зависит только от зерна, эпохи и
//! индекса изображения, поэтому результат не зависит от числа потоков.

use burn::tensor::{backend::Backend, Tensor, TensorData};
use rand::SeedableRng;
use rand_chacha::ChaCha8Rng;
use rayon::{prelude::*, ThreadPool, ThreadPoolBuilder};
use tracing::{debug, info};

use super::{AugmentedView, DistributedSampler, ImageFolder, MultiCropAugmentation};
use crate::TrainingError;

/// Загрузчик пакетов для одного участника.
#[derive(Debug)]
pub struct MultiCropLoader {
    dataset: ImageFolder,
    sampler: DistributedSampler,
    augmentation: MultiCropAugmentation,
    batch_size: usize,
    seed: u64,
    pool: ThreadPool,
}

impl MultiCropLoader {
    /// Создает загрузчик.
    ///
    /// # Аргументы
    /// * `dataset` - Список изображений.
    /// * `sampler` - Сэмплер участника.
    /// * `augmentation` - Аугментации.
    /// * `batch_size` - Примеров в пакете на участника.
    /// * `num_workers` - Потоков подготовки данных (0 означает один поток).
    /// * `seed` - Базовое зерно аугментаций.
    ///
    /// # Ошибки
    /// `TrainingError::Data` при нулевом размере пакета или если пул потоков не создался.
    pub fn new(
        dataset: ImageFolder,
        sampler: DistributedSampler,
        augmentation: MultiCropAugmentation,
        batch_size: usize,
        num_workers: usize,
        seed: u64,
    ) -> Result<Self, TrainingError> {
        if batch_size == 0 {
            return Err(TrainingError::Data("Размер пакета должен быть больше нуля.".to_string()));
        }
        let pool = ThreadPoolBuilder::new()
            .num_threads(num_workers.max(1))
            .thread_name(|i| format!("pass-data-{i}"))
            .build()
            .map_err(|e| TrainingError::Data(format!("Не удалось создать пул потоков данных: {e}")))?;
        let loader = Self {
            dataset,
            sampler,
            augmentation,
            batch_size,
            seed,
            pool,
        };
        info!(
            "Загрузчик: {} примеров на участника, {} пакетов по {} за эпоху, {} видов на пример",
            loader.sampler.num_samples(),
            loader.batches_per_epoch(),
            batch_size,
            loader.augmentation.num_views()
        );
        Ok(loader)
    }

    /// Число полных пакетов за эпоху (неполный последний пакет отбрасывается).
    #[must_use]
    pub const fn batches_per_epoch(&self) -> usize {
        self.sampler.num_samples() / self.batch_size
    }

    /// Число видов на пример.
    #[must_use]
    pub const fn num_views(&self) -> usize {
        self.augmentation.num_views()
    }

    /// Порядок индексов участника на эпоху.
    #[must_use]
    pub fn epoch_order(&self, epoch: usize) -> Vec<usize> {
        self.sampler.indices(epoch)
    }

    fn sample_seed(&self, epoch: usize, index: usize) -> u64 {
        self.seed
            .wrapping_mul(0x9E37_79B9_7F4A_7C15)
            .wrapping_add((epoch as u64) << 32)
            .wrapping_add(index as u64)
    }

    /// Собирает пакет видов.
    ///
    /// # Аргументы
    /// * `order` - Порядок эпохи из [`MultiCropLoader::epoch_order`].
    /// * `epoch` - Номер эпохи.
    /// * `batch` - Номер пакета внутри эпохи.
    /// * `device` - Устройство тензоров.
    ///
    /// # Возвращает
    /// По одному тензору `[batch_size, 3, H, W]` на вид, в порядке
    /// `[global_0, global_1, local_0 ..]`.
    ///
    /// # Ошибки
    /// `TrainingError::Data` для пакета вне эпохи, ошибки чтения и декодирования изображений.
    pub fn load_batch<B: Backend>(
        &self,
        order: &[usize],
        epoch: usize,
        batch: usize,
        device: &B::Device,
    ) -> Result<Vec<Tensor<B, 4>>, TrainingError> {
        let start = batch * self.batch_size;
        let indices = order.get(start..start + self.batch_size).ok_or_else(|| {
            TrainingError::Data(format!(
                "Пакет {} вне эпохи из {} примеров.",
                batch,
                order.len()
            ))
        })?;

        let samples: Vec<Vec<AugmentedView>> = self.pool.install(|| {
            indices
                .par_iter()
                .map(|&index| {
                    let image = self.dataset.load(index)?;
                    let mut rng = ChaCha8Rng::seed_from_u64(self.sample_seed(epoch, index));
                    self.augmentation.apply(&image, &mut rng)
                })
                .collect::<Result<_, TrainingError>>()
        })?;
        debug!("Пакет {} эпохи {}: {} примеров", batch, epoch, samples.len());

        (0..self.num_views())
            .map(|view| {
                let (height, width) = self.augmentation.view_size(view);
                let mut buffer = Vec::with_capacity(self.batch_size * 3 * height * width);
                for sample in &samples {
                    let augmented = sample.get(view).ok_or_else(|| {
                        TrainingError::Data(format!("У примера нет вида {view}."))
                    })?;
                    buffer.extend_from_slice(&augmented.data);
                }
                Ok(Tensor::from_data(
                    TensorData::new(buffer, [self.batch_size, 3, height, width]),
                    device,
                ))
            })
            .collect()
    }
}
