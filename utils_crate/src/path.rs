#![warn(
    missing_docs,
    clippy::all,
    clippy::pedantic,
    clippy::nursery,
    clippy::unwrap_used,
    clippy::expect_used
)]
#![deny(unsafe_code)]

use crate::error::UtilsError;
use std::fs::{self, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};
use tracing::{debug, error, info};

/// Гарантирует, что директория существует, создавая ее при необходимости.
///
/// # Аргументы
/// * `dir_path` - Путь к директории, существование которой нужно обеспечить.
///
/// # Ошибки
/// Возвращает `UtilsError::Io`, если директория не может быть создана.
/// Возвращает `UtilsError::InvalidParameter`, если по указанному пути находится файл.
pub fn ensure_dir_exists(dir_path: &Path) -> Result<(), UtilsError> {
    if !dir_path.exists() {
        info!("Создание директории: {:?}", dir_path);
        fs::create_dir_all(dir_path)
            .map_err(|e| UtilsError::io_with_path(e, dir_path.to_string_lossy().into_owned()))?;
        debug!("Директория создана: {:?}", dir_path);
    } else if !dir_path.is_dir() {
        let err_msg = format!("Путь {dir_path:?} существует, но не является директорией.");
        error!("{}", err_msg);
        return Err(UtilsError::InvalidParameter(err_msg));
    } else {
        debug!("Директория уже существует: {:?}", dir_path);
    }
    Ok(())
}

/// Рекурсивно собирает файлы с заданными расширениями.
///
/// Расширения сравниваются без учета регистра. Результат отсортирован, поэтому
/// порядок не зависит от файловой системы: все процессы видят один и тот же
/// список и один и тот же индекс соответствует одному и тому же файлу.
///
/// # Аргументы
/// * `root` - Корневая директория поиска.
/// * `extensions` - Допустимые расширения без точки (например, `["jpg", "png"]`).
///
/// # Ошибки
/// `UtilsError::ResourceNotFound`, если `root` не является директорией,
/// `UtilsError::Io` при ошибке чтения.
pub fn list_files_recursive(root: &Path, extensions: &[&str]) -> Result<Vec<PathBuf>, UtilsError> {
    if !root.is_dir() {
        return Err(UtilsError::ResourceNotFound(format!(
            "Директория с данными не найдена: {root:?}"
        )));
    }
    let mut found = Vec::new();
    let mut pending = vec![root.to_path_buf()];
    while let Some(dir) = pending.pop() {
        let entries = fs::read_dir(&dir)
            .map_err(|e| UtilsError::io_with_path(e, dir.to_string_lossy().into_owned()))?;
        for entry in entries {
            let path = entry
                .map_err(|e| UtilsError::io_with_path(e, dir.to_string_lossy().into_owned()))?
                .path();
            if path.is_dir() {
                pending.push(path);
            } else if path
                .extension()
                .and_then(|ext| ext.to_str())
                .is_some_and(|ext| extensions.iter().any(|allowed| allowed.eq_ignore_ascii_case(ext)))
            {
                found.push(path);
            }
        }
    }
    found.sort();
    debug!("В {:?} найдено {} файлов", root, found.len());
    Ok(found)
}

/// Дописывает строку в конец файла, создавая файл при необходимости.
///
/// # Ошибки
/// `UtilsError::Io` при ошибке открытия или записи.
pub fn append_line(file_path: &Path, line: &str) -> Result<(), UtilsError> {
    let path_str = || file_path.to_string_lossy().into_owned();
    let mut file = OpenOptions::new()
        .create(true)
        .append(true)
        .open(file_path)
        .map_err(|e| UtilsError::io_with_path(e, path_str()))?;
    writeln!(file, "{line}").map_err(|e| UtilsError::io_with_path(e, path_str()))
}
