#![warn(
    missing_docs,
    clippy::all,
    clippy::pedantic,
    clippy::nursery,
    clippy::unwrap_used,
    clippy::expect_used
)]
#![deny(unsafe_code)]

//! Модуль для инициализации глобального логгера на основе `tracing`.
//!
//! Функциональность этого модуля активируется фичей `logger_utils_feature`.

use tracing::Level;
use tracing_subscriber::{
    filter::Directive, fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter, Layer,
};

use std::{fs, io, path::Path};

use crate::error::UtilsError;

/// Инициализирует глобальный подписчик `tracing`.
///
/// Настраивает вывод в консоль и, опционально, в файл с ежедневной ротацией.
/// Фильтрует по `RUST_LOG` и явным уровням. Процессы с `rank > 0` пишут в консоль
/// только предупреждения и ошибки, чтобы журнал распределенного запуска не
/// дублировался `world_size` раз.
///
/// # Аргументы
/// * `app_name` - Имя приложения (для фильтров и имени файла лога).
/// * `rank` - Ранг текущего процесса.
/// * `console_level` - Уровень для консоли главного процесса.
/// * `file_level` - Уровень для файла.
/// * `log_dir` - Опциональная директория для файлов логов.
///
/// # Ошибки
/// `UtilsError::Config` при невалидной директиве фильтра,
/// `UtilsError::Generic` при повторной инициализации.
/// Проблемы с созданием директории лога выводятся предупреждением и отключают
/// только файловый слой.
#[allow(clippy::module_name_repetitions)]
pub fn init_tracing_logger(
    app_name: &str,
    rank: usize,
    console_level: Level,
    file_level: Level,
    log_dir: Option<&Path>,
) -> Result<(), UtilsError> {
    let base_env_filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));

    // EnvFilter не принимает дефисы в именах целей.
    let sanitized_app_name = app_name.replace('-', "_");
    let effective_console_level = if rank == 0 { console_level } else { Level::WARN };

    let directive = |level: Level| {
        format!("{sanitized_app_name}={level}")
            .parse::<Directive>()
            .map_err(|e| UtilsError::Config(format!("Неверная директива логирования: {e}")))
    };

    let console_filter = base_env_filter
        .clone()
        .add_directive(directive(effective_console_level)?);

    let console_layer = fmt::layer()
        .with_writer(io::stderr)
        .with_ansi(true)
        .with_target(true)
        .with_filter(console_filter);

    let mut layers: Vec<Box<dyn Layer<_> + Send + Sync + 'static>> = Vec::new();
    layers.push(console_layer.boxed());

    let mut file_logging = false;
    if let Some(dir) = log_dir {
        if let Err(e) = fs::create_dir_all(dir) {
            // tracing еще не инициализирован.
            eprintln!(
                "[ПРЕДУПРЕЖДЕНИЕ] Не удалось создать директорию логов {dir:?}: {e}. Логирование в файл отключено."
            );
        } else {
            let file_appender =
                tracing_appender::rolling::daily(dir, format!("{app_name}.rank{rank}.log"));
            let file_filter = base_env_filter.add_directive(directive(file_level)?);
            let file_layer = fmt::layer()
                .with_writer(file_appender)
                .with_ansi(false)
                .with_filter(file_filter);
            layers.push(file_layer.boxed());
            file_logging = true;
        }
    }

    tracing_subscriber::registry()
        .with(layers)
        .try_init()
        .map_err(|e| UtilsError::Generic(format!("Не удалось инициализировать логгер: {e}")))?;

    match log_dir {
        Some(dir) if file_logging => tracing::info!(
            "Логгер инициализирован (ранг {}). Уровень консоли: {}. Логирование в файл: {:?} (уровень {}).",
            rank,
            effective_console_level,
            dir,
            file_level
        ),
        Some(dir) => tracing::warn!(
            "Логгер инициализирован (ранг {}). Директория логов {:?} недоступна, только консоль.",
            rank,
            dir
        ),
        None => tracing::info!(
            "Логгер инициализирован (ранг {}). Только вывод в консоль (уровень {}).",
            rank,
            effective_console_level
        ),
    }
    Ok(())
}
