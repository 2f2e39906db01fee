// training_engine/tests/common/mod.rs

#![allow(dead_code)]

use std::path::Path;

use burn::{
    module::Module,
    tensor::{backend::Backend, Distribution, Tensor},
};
use burn_autodiff::Autodiff;
use burn_ndarray::NdArray;
use core_burn::{MultiCropNetworkConfig, ProjectionHeadConfig, VisionTransformerConfig};
use training_engine::{params::to_host, ParamRegistry};
use utils_crate::TrainingConfig;

pub type Inner = NdArray<f32>;
pub type TestBackend = Autodiff<Inner>;

pub const OUT_DIM: usize = 8;

/// Сеть на 16x16 с патчем 8: один блок, ширина 16.
pub fn tiny_network_config() -> MultiCropNetworkConfig {
    MultiCropNetworkConfig::new(
        VisionTransformerConfig::new()
            .with_img_size([16, 16])
            .with_patch_size(8)
            .with_embed_dim(16)
            .with_depth(1)
            .with_num_heads(2)
            .with_drop_path_rate(0.1),
        ProjectionHeadConfig::new(16, OUT_DIM)
            .with_hidden_dim(16)
            .with_bottleneck_dim(8),
    )
}

/// Конфигурация обучения под `tiny_network_config`.
pub fn tiny_training_config(output_dir: &Path) -> TrainingConfig {
    let mut config = TrainingConfig::default();
    config.model.patch_size = 8;
    config.model.out_dim = OUT_DIM;
    config.model.head_hidden_dim = 16;
    config.model.head_bottleneck_dim = 8;
    config.loss.warmup_teacher_temp_epochs = 0;
    config.optim.epochs = 2;
    config.optim.warmup_epochs = 0;
    config.optim.freeze_last_layer = 0;
    config.optim.batch_size_per_gpu = 2;
    config.optim.lr = 0.5;
    config.optim.use_fp16 = false;
    config.multicrop.global_size = (16, 16);
    config.multicrop.local_size = (8, 8);
    config.multicrop.local_crops_number = 6;
    config.data.data_path = output_dir.to_path_buf();
    config.data.num_workers = 2;
    config.run.output_dir = output_dir.to_path_buf();
    config.run.checkpoint_every_step = false;
    config
}

/// Два глобальных вида 16x16 и `locals` локальных 8x8.
pub fn random_views<B: Backend>(batch: usize, locals: usize) -> Vec<Tensor<B, 4>> {
    let device = Default::default();
    let mut views = Vec::with_capacity(2 + locals);
    for _ in 0..2 {
        views.push(Tensor::random([batch, 3, 16, 16], Distribution::Normal(0.0, 1.0), &device));
    }
    for _ in 0..locals {
        views.push(Tensor::random([batch, 3, 8, 8], Distribution::Normal(0.0, 1.0), &device));
    }
    views
}

/// Все параметры модуля в порядке обхода, значения на хосте.
pub fn flat_values<B: Backend, M: Module<B>>(module: &M) -> Vec<f32> {
    let registry = ParamRegistry::from_module(module, &[]);
    registry
        .collect_values(module)
        .unwrap()
        .into_iter()
        .flat_map(|value| to_host(value).unwrap())
        .collect()
}

pub fn host<B: Backend, const D: usize>(tensor: Tensor<B, D>) -> Vec<f32> {
    to_host(tensor).unwrap()
}
