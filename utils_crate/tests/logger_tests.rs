#![cfg(feature = "logger_utils_feature")]

use serial_test::serial;
use std::fs;
use std::path::Path;
use tempfile::tempdir;
use tracing::Level;
use utils_crate::error::UtilsError;
use utils_crate::logger::init_tracing_logger;

// Глобальный подписчик устанавливается один раз на процесс теста, поэтому
// повторная инициализация ожидаемо возвращает `UtilsError::Generic`.
fn already_initialized(err: &UtilsError) -> bool {
    matches!(err, UtilsError::Generic(msg) if msg.contains("инициализировать логгер"))
}

fn log_file_contains(log_dir: &Path, prefix: &str, expected: &str) -> bool {
    std::thread::sleep(std::time::Duration::from_millis(100));
    let Ok(entries) = fs::read_dir(log_dir) else {
        return false;
    };
    entries
        .filter_map(Result::ok)
        .map(|entry| entry.path())
        .filter(|p| {
            p.file_name()
                .is_some_and(|n| n.to_string_lossy().starts_with(prefix))
        })
        .any(|p| fs::read_to_string(p).is_ok_and(|content| content.contains(expected)))
}

#[test]
#[serial]
fn test_logger_init_with_file() {
    let temp_dir = tempdir().unwrap();
    let app_name = "pass_logger_test";
    let message = "Сообщение для записи в файл из utils_crate.";

    match init_tracing_logger(app_name, 0, Level::INFO, Level::DEBUG, Some(temp_dir.path())) {
        Ok(()) => {
            tracing::info!(target: "pass_logger_test", "{}", message);
            assert!(log_file_contains(temp_dir.path(), app_name, message));
        }
        Err(e) if already_initialized(&e) => {}
        Err(e) => panic!("Неожиданная ошибка при инициализации логгера: {e:?}"),
    }
}

#[test]
#[serial]
fn test_logger_second_init_is_an_error() {
    let first = init_tracing_logger("pass_logger_twice", 1, Level::INFO, Level::INFO, None);
    if let Err(e) = &first {
        assert!(already_initialized(e));
    }
    let second = init_tracing_logger("pass_logger_twice", 1, Level::INFO, Level::INFO, None);
    assert!(matches!(second, Err(ref e) if already_initialized(e)));
}

#[test]
#[serial]
fn test_logger_file_creation_failure_does_not_panic() {
    let blocker = tempdir().unwrap();
    let file_in_the_way = blocker.path().join("not_a_dir");
    fs::write(&file_in_the_way, b"x").unwrap();

    match init_tracing_logger(
        "pass_logger_bad_dir",
        0,
        Level::INFO,
        Level::DEBUG,
        Some(&file_in_the_way.join("logs")),
    ) {
        Ok(()) => tracing::info!("Логгер работает без файлового слоя."),
        Err(e) if already_initialized(&e) => {}
        Err(e) => panic!("Неожиданная ошибка: {e:?}"),
    }
}
