use std::io;
use utils_crate::error::UtilsError;

#[test]
fn test_io_error_conversion() {
    let utils_err = UtilsError::io_with_path(
        io::Error::new(io::ErrorKind::NotFound, "file not found"),
        "checkpoint/meta.json",
    );
    match utils_err {
        UtilsError::Io { source, path: Some(p) } => {
            assert_eq!(source.kind(), io::ErrorKind::NotFound);
            assert_eq!(p, "checkpoint/meta.json");
        }
        other => panic!("Ожидался UtilsError::Io с путем, получено {other:?}"),
    }

    let without_path: UtilsError = io::Error::new(io::ErrorKind::Other, "other io error").into();
    assert!(matches!(without_path, UtilsError::Io { path: None, .. }));
}

#[test]
fn test_config_error_formatting() {
    let err = UtilsError::Config("local_crops_number (8) не делится на 3".to_string());
    assert_eq!(
        err.to_string(),
        "Ошибка конфигурации: local_crops_number (8) не делится на 3"
    );
}

#[cfg(feature = "config_toml")]
#[test]
fn test_serde_json_error_conversion() {
    let err: UtilsError = serde_json::from_str::<serde_json::Value>("{not json")
        .unwrap_err()
        .into();
    assert!(matches!(err, UtilsError::Deserialization(_)));
}
