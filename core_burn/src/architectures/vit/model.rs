// core_burn/src/architectures/vit/model.rs

#![warn(missing_docs, clippy::all, clippy::pedantic, clippy::nursery)]
#![deny(unsafe_code, clippy::unwrap_used, clippy::expect_used)]

//! Vision transformer с глобальным `[CLS]` и тремя part-токенами.
//!
//! Последовательность токенов в режиме `AllParts`:
//! `[CLS, PT1, PT2, PT3, patch_1, ..., patch_N]`, в режиме `Part(i)`:
//! `[CLS, PT_i, patch_1, ..., patch_N]`. Позиционные эмбеддинги патчей
//! обучаются для сетки глобального вида и интерполируются для других размеров.

use burn::{
    config::Config,
    module::{Module, Param},
    nn::{
        conv::{Conv2d, Conv2dConfig},
        Dropout, DropoutConfig, LayerNorm, LayerNormConfig,
    },
    tensor::{backend::Backend, Distribution, Tensor},
};
use tracing::{debug, trace};

use super::{VitBlock, VitBlockConfig, INIT_STD};
use crate::{
    part::NUM_PARTS, pos_embed::interpolate_pos_embed, Backbone, BurnCoreError, Embeddings,
    PartIndex, PartSelector,
};

/// Конфигурация для `VisionTransformer`.
#[derive(Config, Debug)]
pub struct VisionTransformerConfig {
    /// Размер глобального вида `[высота, ширина]`.
    #[config(default = "[224, 224]")]
    pub img_size: [usize; 2],
    /// Размер квадратного патча.
    #[config(default = 16)]
    pub patch_size: usize,
    /// Число каналов входа.
    #[config(default = 3)]
    pub in_channels: usize,
    /// Размерность токена.
    #[config(default = 768)]
    pub embed_dim: usize,
    /// Количество блоков.
    #[config(default = 12)]
    pub depth: usize,
    /// Количество голов внимания.
    #[config(default = 12)]
    pub num_heads: usize,
    /// Отношение ширины MLP к `embed_dim`.
    #[config(default = 4.0)]
    pub mlp_ratio: f64,
    /// Смещение в проекции `qkv`.
    #[config(default = true)]
    pub qkv_bias: bool,
    /// Дропаут токенов и выходов блоков.
    #[config(default = 0.0)]
    pub drop_rate: f64,
    /// Дропаут весов внимания.
    #[config(default = 0.0)]
    pub attn_drop_rate: f64,
    /// Вероятность stochastic depth последнего блока; растет линейно от 0.
    #[config(default = 0.0)]
    pub drop_path_rate: f64,
    /// Эпсилон `LayerNorm`.
    #[config(default = 1e-6)]
    pub layer_norm_eps: f64,
}

impl VisionTransformerConfig {
    /// Сетка патчей глобального вида `(высота, ширина)`.
    #[must_use]
    pub const fn grid(&self) -> (usize, usize) {
        (self.img_size[0] / self.patch_size, self.img_size[1] / self.patch_size)
    }

    /// Вероятности stochastic depth по блокам: `linspace(0, drop_path_rate, depth)`.
    #[must_use]
    #[allow(clippy::cast_precision_loss)]
    pub fn drop_path_rates(&self) -> Vec<f64> {
        match self.depth {
            0 => Vec::new(),
            1 => vec![0.0],
            depth => (0..depth)
                .map(|i| self.drop_path_rate * i as f64 / (depth - 1) as f64)
                .collect(),
        }
    }

    /// Создает новый экземпляр `VisionTransformer`.
    ///
    /// # Аргументы
    /// * `device`: Устройство Burn для инициализации параметров.
    ///
    /// # Возвращает
    /// `Result<VisionTransformer<B>, BurnCoreError>`.
    ///
    /// # Ошибки
    /// `BurnCoreError::InvalidConfig`, если размер изображения не кратен патчу,
    /// глубина равна нулю или `embed_dim` не делится на число голов.
    pub fn init<B: Backend>(&self, device: &B::Device) -> Result<VisionTransformer<B>, BurnCoreError> {
        if self.patch_size == 0
            || self.img_size[0] % self.patch_size != 0
            || self.img_size[1] % self.patch_size != 0
        {
            return Err(BurnCoreError::InvalidConfig(format!(
                "Размер изображения {:?} должен быть кратен размеру патча {}.",
                self.img_size, self.patch_size
            )));
        }
        if self.depth == 0 {
            return Err(BurnCoreError::InvalidConfig(
                "Глубина трансформера должна быть больше нуля.".to_string(),
            ));
        }

        let (grid_h, grid_w) = self.grid();
        let dim = self.embed_dim;
        let normal = || Distribution::Normal(0.0, INIT_STD);

        let blocks = self
            .drop_path_rates()
            .into_iter()
            .map(|drop_path| {
                VitBlockConfig::new(dim, self.num_heads)
                    .with_mlp_ratio(self.mlp_ratio)
                    .with_qkv_bias(self.qkv_bias)
                    .with_drop_rate(self.drop_rate)
                    .with_attn_drop_rate(self.attn_drop_rate)
                    .with_drop_path(drop_path)
                    .with_layer_norm_eps(self.layer_norm_eps)
                    .init(device)
            })
            .collect::<Result<Vec<_>, _>>()?;

        debug!(
            "VisionTransformer: dim={}, depth={}, heads={}, сетка {}x{}",
            dim, self.depth, self.num_heads, grid_h, grid_w
        );

        Ok(VisionTransformer {
            patch_embed: PatchEmbed {
                proj: Conv2dConfig::new([self.in_channels, dim], [self.patch_size, self.patch_size])
                    .with_stride([self.patch_size, self.patch_size])
                    .init(device),
            },
            cls_token: Param::from_tensor(Tensor::random([1, 1, dim], normal(), device)),
            part_tokens: Param::from_tensor(Tensor::random([1, NUM_PARTS, dim], normal(), device)),
            cls_pos: Param::from_tensor(Tensor::zeros([1, 1, dim], device)),
            part_pos: Param::from_tensor(Tensor::random([1, NUM_PARTS, dim], normal(), device)),
            pos_embed: Param::from_tensor(Tensor::random([1, grid_h * grid_w, dim], normal(), device)),
            pos_drop: DropoutConfig::new(self.drop_rate).init(),
            blocks,
            norm: LayerNormConfig::new(dim)
                .with_epsilon(self.layer_norm_eps)
                .init(device),
            in_channels: self.in_channels,
            patch_size: self.patch_size,
            grid_h,
            grid_w,
            embed_dim: dim,
        })
    }
}

/// Нарезка изображения на патчи сверткой с шагом, равным размеру патча.
#[derive(Module, Debug)]
pub struct PatchEmbed<B: Backend> {
    proj: Conv2d<B>,
}

impl<B: Backend> PatchEmbed<B> {
    /// `[batch, channels, h, w]` -> `[batch, (h/p)*(w/p), embed_dim]`.
    pub fn forward(&self, images: Tensor<B, 4>) -> Tensor<B, 3> {
        let x = self.proj.forward(images);
        let [batch, dim, gh, gw] = x.dims();
        x.reshape([batch, dim, gh * gw]).swap_dims(1, 2)
    }
}

/// Vision transformer с part-токенами.
#[derive(Module, Debug)]
pub struct VisionTransformer<B: Backend> {
    patch_embed: PatchEmbed<B>,
    /// `[1, 1, dim]`.
    cls_token: Param<Tensor<B, 3>>,
    /// Токены полос `[1, 3, dim]` в порядке верх, середина, низ.
    part_tokens: Param<Tensor<B, 3>>,
    /// Позиция `[CLS]`, инициализируется нулями.
    cls_pos: Param<Tensor<B, 3>>,
    /// Позиции part-токенов `[1, 3, dim]`.
    part_pos: Param<Tensor<B, 3>>,
    /// Позиции патчей глобальной сетки `[1, grid_h*grid_w, dim]`.
    pos_embed: Param<Tensor<B, 3>>,
    pos_drop: Dropout,
    blocks: Vec<VitBlock<B>>,
    norm: LayerNorm<B>,
    in_channels: usize,
    patch_size: usize,
    grid_h: usize,
    grid_w: usize,
    embed_dim: usize,
}

impl<B: Backend> VisionTransformer<B> {
    /// Количество блоков.
    #[must_use]
    pub fn depth(&self) -> usize {
        self.blocks.len()
    }

    /// Размер патча.
    #[must_use]
    pub const fn patch_size(&self) -> usize {
        self.patch_size
    }

    fn part_slice(param: &Param<Tensor<B, 3>>, index: PartIndex) -> Tensor<B, 3> {
        let i = index.index();
        let tensor = param.val();
        let [_, _, dim] = tensor.dims();
        tensor.slice([0..1, i..i + 1, 0..dim])
    }

    /// Строит последовательность токенов с позиционными эмбеддингами.
    ///
    /// # Ошибки
    /// `BurnCoreError::IncompatibleShape` при неверном числе каналов или
    /// размере, не кратном патчу.
    pub fn prepare_tokens(&self, images: Tensor<B, 4>, selector: PartSelector) -> Result<Tensor<B, 3>, BurnCoreError> {
        let [batch, channels, height, width] = images.dims();
        if channels != self.in_channels {
            return Err(BurnCoreError::IncompatibleShape(format!(
                "Ожидалось {} каналов, получено {}.",
                self.in_channels, channels
            )));
        }
        if height % self.patch_size != 0 || width % self.patch_size != 0 {
            return Err(BurnCoreError::IncompatibleShape(format!(
                "Размер {}x{} не кратен размеру патча {}.",
                height, width, self.patch_size
            )));
        }
        let target = (height / self.patch_size, width / self.patch_size);
        let patches = self.patch_embed.forward(images);

        let (tokens, mut positions) = match selector {
            PartSelector::AllParts => (
                vec![self.cls_token.val(), self.part_tokens.val()],
                vec![self.cls_pos.val(), self.part_pos.val()],
            ),
            PartSelector::Part(index) => (
                vec![self.cls_token.val(), Self::part_slice(&self.part_tokens, index)],
                vec![self.cls_pos.val(), Self::part_slice(&self.part_pos, index)],
            ),
        };
        let patch_pos = interpolate_pos_embed(self.pos_embed.val(), (self.grid_h, self.grid_w), target);
        trace!("prepare_tokens: {:?}, сетка {:?}", selector, target);

        let prefix = Tensor::cat(tokens, 1).repeat_dim(0, batch);
        positions.push(patch_pos);
        let positions = Tensor::cat(positions, 1).repeat_dim(0, batch);

        let x = Tensor::cat(vec![prefix, patches], 1) + positions;
        Ok(self.pos_drop.forward(x))
    }

    /// Прогоняет все блоки и финальную нормализацию.
    ///
    /// # Ошибки
    /// См. [`Self::prepare_tokens`].
    pub fn forward_tokens(&self, images: Tensor<B, 4>, selector: PartSelector) -> Result<Tensor<B, 3>, BurnCoreError> {
        let mut x = self.prepare_tokens(images, selector)?;
        for block in &self.blocks {
            x = block.forward(x);
        }
        Ok(self.norm.forward(x))
    }

    /// Веса внимания последнего блока в режиме `AllParts`.
    ///
    /// # Возвращает
    /// Тензор `[batch, num_heads, tokens, tokens]`.
    ///
    /// # Ошибки
    /// См. [`Self::prepare_tokens`].
    pub fn last_self_attention(&self, images: Tensor<B, 4>) -> Result<Tensor<B, 4>, BurnCoreError> {
        let mut x = self.prepare_tokens(images, PartSelector::AllParts)?;
        let last = self.blocks.len().saturating_sub(1);
        for block in &self.blocks[..last] {
            x = block.forward(x);
        }
        let block = self.blocks.get(last).ok_or_else(|| {
            BurnCoreError::Generic("В трансформере нет ни одного блока.".to_string())
        })?;
        Ok(block.forward_with_attention(x).1)
    }
}

fn token_at<B: Backend>(tokens: &Tensor<B, 3>, index: usize) -> Tensor<B, 2> {
    let [batch, _, dim] = tokens.dims();
    tokens
        .clone()
        .slice([0..batch, index..index + 1, 0..dim])
        .reshape([batch, dim])
}

impl<B: Backend> Backbone<B> for VisionTransformer<B> {
    fn embed_dim(&self) -> usize {
        self.embed_dim
    }

    fn embed(&self, images: Tensor<B, 4>, selector: PartSelector) -> Result<Embeddings<B>, BurnCoreError> {
        let x = self.forward_tokens(images, selector)?;
        Ok(match selector {
            PartSelector::AllParts => Embeddings::AllParts {
                cls: token_at(&x, 0),
                parts: [token_at(&x, 1), token_at(&x, 2), token_at(&x, 3)],
            },
            PartSelector::Part(index) => Embeddings::Part {
                cls: token_at(&x, 0),
                part: token_at(&x, 1),
                index,
            },
        })
    }
}
