// training_engine/src/data/dataset.rs

#![warn(missing_docs, clippy::all, clippy::pedantic, clippy::nursery)]
#![deny(unsafe_code, clippy::unwrap_used, clippy::expect_used)]

//! Датасет изображений из директории.

use std::{
    fs,
    path::{Path, PathBuf},
};

use image::RgbImage;
use tracing::{info, warn};
use utils_crate::list_files_recursive;

use crate::TrainingError;

/// Поддерживаемые расширения изображений.
pub const IMAGE_EXTENSIONS: [&str; 5] = ["jpg", "jpeg", "png", "bmp", "webp"];

/// Упорядоченный список файлов изображений.
///
/// Метки классов не используются: обучение идет без разметки.
#[derive(Debug, Clone)]
pub struct ImageFolder {
    root: PathBuf,
    samples: Vec<PathBuf>,
}

impl ImageFolder {
    /// Собирает список изображений.
    ///
    /// Без `filter_path` берутся все изображения под `root` (рекурсивно, в
    /// отсортированном порядке). С `filter_path` берутся пути из файла списка,
    /// по одному относительному пути на строку, разрешенные относительно
    /// `root`. `keep_num` оставляет первые `keep_num` записей.
    ///
    /// # Ошибки
    /// `TrainingError::Data`, если список пуст, ошибки чтения директории и файла списка.
    pub fn open(root: &Path, filter_path: Option<&Path>, keep_num: Option<usize>) -> Result<Self, TrainingError> {
        let mut samples = match filter_path {
            Some(list) => fs::read_to_string(list)?
                .lines()
                .map(str::trim)
                .filter(|line| !line.is_empty())
                .map(|line| root.join(line))
                .collect(),
            None => list_files_recursive(root, &IMAGE_EXTENSIONS)?,
        };

        if let Some(keep) = keep_num {
            if keep > samples.len() {
                warn!(
                    "keep_num = {} больше числа изображений ({}), используются все",
                    keep,
                    samples.len()
                );
            }
            samples.truncate(keep);
        }
        if samples.is_empty() {
            return Err(TrainingError::Data(format!("В {root:?} не найдено ни одного изображения.")));
        }
        info!("Данные загружены: {} изображений из {:?}", samples.len(), root);
        Ok(Self {
            root: root.to_path_buf(),
            samples,
        })
    }

    /// Корневая директория.
    #[must_use]
    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Число изображений.
    #[must_use]
    pub fn len(&self) -> usize {
        self.samples.len()
    }

    /// Пуст ли датасет.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.samples.is_empty()
    }

    /// Путь к изображению по индексу.
    #[must_use]
    pub fn path(&self, index: usize) -> Option<&Path> {
        self.samples.get(index).map(PathBuf::as_path)
    }

    /// Читает и декодирует изображение в RGB.
    ///
    /// # Ошибки
    /// `TrainingError::Data` при неверном индексе, `TrainingError::Image` при ошибке декодирования.
    pub fn load(&self, index: usize) -> Result<RgbImage, TrainingError> {
        let path = self.path(index).ok_or_else(|| {
            TrainingError::Data(format!("Индекс {} вне датасета из {} изображений.", index, self.len()))
        })?;
        Ok(image::open(path)?.into_rgb8())
    }
}
