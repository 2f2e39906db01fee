// core_burn/src/network.rs

#![warn(missing_docs, clippy::all, clippy::pedantic, clippy::nursery)]
#![deny(unsafe_code, clippy::unwrap_used, clippy::expect_used)]

//! Сеть для самодистилляции: backbone и проекционная голова.
//!
//! Студент и учитель являются экземплярами одной и той же `MultiCropNetwork`;
//! различается только бэкенд (учитель живет на внутреннем бэкенде без
//! автодифференцирования).

use burn::{
    config::Config,
    module::{Module, ParamId},
    tensor::{backend::Backend, Tensor},
};
use tracing::info;

use crate::{
    Backbone, BurnCoreError, PartSelector, ProjectionHead, ProjectionHeadConfig, StreamLogits,
    VisionTransformer, VisionTransformerConfig,
};

/// Сеть, которая принимает пакет видов вместе с селектором части.
///
/// Диспетчер видов работает только через этот трейт.
pub trait PartAwareNetwork<B: Backend> {
    /// Прямой проход пакета `[batch, C, H, W]`.
    ///
    /// # Ошибки
    /// Ошибки формы входа из backbone.
    fn forward_views(&self, images: Tensor<B, 4>, selector: PartSelector) -> Result<StreamLogits<B>, BurnCoreError>;
}

/// Конфигурация `MultiCropNetwork`.
#[derive(Config, Debug)]
pub struct MultiCropNetworkConfig {
    /// Конфигурация backbone.
    pub backbone: VisionTransformerConfig,
    /// Конфигурация головы; `in_dim` должен совпадать с `embed_dim` backbone.
    pub head: ProjectionHeadConfig,
}

impl MultiCropNetworkConfig {
    /// Создает сеть.
    ///
    /// # Ошибки
    /// `BurnCoreError::InvalidConfig`, если размерности backbone и головы не
    /// согласованы, а также ошибки конфигураций компонентов.
    pub fn init<B: Backend>(&self, device: &B::Device) -> Result<MultiCropNetwork<B>, BurnCoreError> {
        if self.head.in_dim != self.backbone.embed_dim {
            return Err(BurnCoreError::InvalidConfig(format!(
                "in_dim головы ({}) не совпадает с embed_dim backbone ({}).",
                self.head.in_dim, self.backbone.embed_dim
            )));
        }
        let network = MultiCropNetwork {
            backbone: self.backbone.init(device)?,
            head: self.head.init(device)?,
        };
        info!(
            "Сеть создана: {} параметров, out_dim={}",
            network.num_params(),
            self.head.out_dim
        );
        Ok(network)
    }
}

/// Backbone + голова.
#[derive(Module, Debug)]
pub struct MultiCropNetwork<B: Backend> {
    backbone: VisionTransformer<B>,
    head: ProjectionHead<B>,
}

impl<B: Backend> MultiCropNetwork<B> {
    /// Backbone сети.
    pub const fn backbone(&self) -> &VisionTransformer<B> {
        &self.backbone
    }

    /// Проекционная голова.
    pub const fn head(&self) -> &ProjectionHead<B> {
        &self.head
    }

    /// Забирает backbone, отбрасывая голову.
    pub fn into_backbone(self) -> VisionTransformer<B> {
        self.backbone
    }

    /// Параметры последних слоев подголов (для заморозки в первые эпохи).
    pub fn last_layer_param_ids(&self) -> Vec<ParamId> {
        self.head.last_layer_param_ids()
    }
}

impl<B: Backend> PartAwareNetwork<B> for MultiCropNetwork<B> {
    fn forward_views(&self, images: Tensor<B, 4>, selector: PartSelector) -> Result<StreamLogits<B>, BurnCoreError> {
        let embeddings = self.backbone.embed(images, selector)?;
        Ok(self.head.forward(embeddings))
    }
}
