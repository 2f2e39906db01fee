#[cfg(feature = "config_toml")]
mod training_config_feature_tests {
    use std::io::Write;
    use std::path::Path;
    use tempfile::NamedTempFile;
    use utils_crate::config::{BackboneArch, OptimizerKind, TrainingConfig};
    use utils_crate::error::UtilsError;

    #[test]
    fn test_training_config_default_values_ct() {
        let config = TrainingConfig::default();
        assert_eq!(config.model.arch, BackboneArch::VitSmall);
        assert_eq!(config.model.out_dim, 65536);
        assert!((config.loss.student_temp - 0.1).abs() < f64::EPSILON);
        assert!((config.loss.center_momentum - 0.9).abs() < f64::EPSILON);
        assert!((config.optim.momentum_teacher - 0.996).abs() < f64::EPSILON);
        assert_eq!(config.optim.optimizer, OptimizerKind::Adamw);
        assert_eq!(config.optim.freeze_last_layer, 1);
        assert_eq!(config.multicrop.local_crops_number, 8);
        assert_eq!(config.run.saveckp_freq, 5);
    }

    #[test]
    fn test_training_config_load_from_toml_exists_ct() {
        let mut temp_file = NamedTempFile::new().unwrap();
        let toml_content = r#"
            [model]
            arch = "vit_tiny"
            out_dim = 4096
            use_bn_in_head = true

            [loss]
            warmup_teacher_temp = 0.02
            teacher_temp = 0.07
            warmup_teacher_temp_epochs = 30

            [optim]
            optimizer = "lars"
            epochs = 300
            batch_size_per_gpu = 32

            [multicrop]
            local_crops_number = 9
            global_size = [256, 128]
            local_size = [128, 64]

            [data]
            data_path = "/data/market1501"
            keep_num = 1000

            [run]
            output_dir = "/tmp/pass"
            seed = 42
        "#;
        writeln!(temp_file, "{toml_content}").unwrap();

        let config = TrainingConfig::load_from_toml(temp_file.path()).unwrap();
        assert_eq!(config.model.arch, BackboneArch::VitTiny);
        assert_eq!(config.model.out_dim, 4096);
        assert!(config.model.use_bn_in_head);
        assert_eq!(config.loss.warmup_teacher_temp_epochs, 30);
        assert_eq!(config.optim.optimizer, OptimizerKind::Lars);
        assert_eq!(config.optim.epochs, 300);
        assert_eq!(config.multicrop.local_crops_number, 9);
        assert_eq!(config.multicrop.global_size, (256, 128));
        assert_eq!(config.data.keep_num, Some(1000));
        assert_eq!(config.run.seed, 42);
        // Не заданные поля берутся по умолчанию.
        assert_eq!(config.model.patch_size, 16);
        assert!((config.optim.clip_grad - 3.0).abs() < f64::EPSILON);
    }

    #[test]
    fn test_training_config_deit_alias_ct() {
        let config = TrainingConfig::from_toml_str("[model]\narch = \"deit_small\"\n").unwrap();
        assert_eq!(config.model.arch, BackboneArch::VitSmall);
    }

    #[test]
    fn test_backbone_arch_from_str_ct() {
        assert_eq!("vit_base".parse::<BackboneArch>().unwrap(), BackboneArch::VitBase);
        assert_eq!("deit_tiny".parse::<BackboneArch>().unwrap(), BackboneArch::VitTiny);
        assert_eq!(BackboneArch::VitSmall.to_string().parse::<BackboneArch>().unwrap(), BackboneArch::VitSmall);
        assert!(matches!("resnet50".parse::<BackboneArch>(), Err(UtilsError::Config(_))));
    }

    #[test]
    fn test_training_config_unknown_arch_fails_fast_ct() {
        let result = TrainingConfig::from_toml_str("[model]\narch = \"resnet50\"\n");
        match result {
            Err(UtilsError::Config(msg)) => assert!(msg.contains("TrainingConfig")),
            other => panic!("Ожидалась ошибка конфигурации, получено {other:?}"),
        }
    }

    #[test]
    fn test_training_config_file_not_found_ct() {
        let non_existent_path = Path::new("/totally/non/existent/path/pass.toml");
        let config = TrainingConfig::load_from_toml(non_existent_path).unwrap();
        assert_eq!(config, TrainingConfig::default());
    }

    #[test]
    fn test_training_config_invalid_toml_ct() {
        let mut temp_file = NamedTempFile::new().unwrap();
        writeln!(temp_file, "[optim]\nepochs = \"many\"").unwrap();
        let result = TrainingConfig::load_from_toml(temp_file.path());
        assert!(matches!(result, Err(UtilsError::Config(_))));
    }

    #[test]
    fn test_training_config_toml_round_trip_ct() {
        let mut config = TrainingConfig::default();
        config.model.arch = BackboneArch::VitBase;
        config.data.filter_path = Some("/data/list.txt".into());
        let text = config.to_toml_string().unwrap();
        let parsed = TrainingConfig::from_toml_str(&text).unwrap();
        assert_eq!(parsed, config);
    }

    #[test]
    fn test_validate_accepts_defaults_ct() {
        TrainingConfig::default().validate(1).unwrap();
    }

    #[test]
    fn test_validate_local_crops_remainder_ct() {
        let mut config = TrainingConfig::default();
        config.multicrop.local_crops_number = 8;
        assert_eq!(config.multicrop.local_crops_per_band(), 2);
        assert_eq!(config.multicrop.dropped_local_crops(), 2);
        assert!(config.validate(1).is_ok());

        config.multicrop.strict_local_crops = true;
        assert!(matches!(config.validate(1), Err(UtilsError::Config(_))));

        config.multicrop.local_crops_number = 9;
        assert!(config.validate(1).is_ok());
    }

    #[test]
    fn test_validate_rejects_inconsistent_values_ct() {
        let mut config = TrainingConfig::default();
        config.loss.warmup_teacher_temp_epochs = config.optim.epochs + 1;
        assert!(config.validate(1).is_err());

        let mut config = TrainingConfig::default();
        config.multicrop.local_size = (90, 96);
        assert!(config.validate(1).is_err());

        let mut config = TrainingConfig::default();
        config.model.use_bn_in_head = true;
        assert!(config.validate(1).is_ok());
        assert!(config.validate(2).is_err());
    }

    #[test]
    fn test_scaled_lr_ct() {
        let config = TrainingConfig::default();
        // 0.0005 * 64 * 4 / 256
        assert!((config.scaled_lr(4) - 0.0005).abs() < 1e-12);
        assert!((config.scaled_lr(1) - 0.000_125).abs() < 1e-12);
    }
}
