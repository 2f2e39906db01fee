// core_burn/src/head.rs

#![warn(missing_docs, clippy::all, clippy::pedantic, clippy::nursery)]
#![deny(unsafe_code, clippy::unwrap_used, clippy::expect_used)]

//! Проекционная голова из четырех независимых подголов.
//!
//! Каждая подгола: MLP (`nlayers` линейных слоев с GELU и опциональным
//! `BatchNorm` между ними) -> L2-нормализация -> линейный слой с весовой
//! нормализацией без смещения. Подголовы не делят параметры: у каждого потока
//! (`cls`, `pt1`, `pt2`, `pt3`) свое пространство логитов.

use burn::{
    config::Config,
    module::{Module, Param, ParamId},
    nn::{BatchNorm, BatchNormConfig, Gelu, Linear},
    tensor::{backend::Backend, Distribution, Tensor},
};

use crate::{architectures::vit::init_linear, BurnCoreError, Embeddings, PartIndex, Stream};

/// Порог нормы при L2-нормализации.
const NORMALIZE_EPS: f64 = 1e-12;

/// Конфигурация `ProjectionHead`.
#[derive(Config, Debug)]
pub struct ProjectionHeadConfig {
    /// Размерность входного эмбеддинга.
    pub in_dim: usize,
    /// Размерность логитов.
    pub out_dim: usize,
    /// `BatchNorm` после скрытых линейных слоев.
    #[config(default = false)]
    pub use_bn: bool,
    /// Фиксировать множитель весовой нормализации последнего слоя равным 1.
    #[config(default = true)]
    pub norm_last_layer: bool,
    /// Число линейных слоев MLP (минимум 1).
    #[config(default = 3)]
    pub nlayers: usize,
    /// Ширина скрытых слоев.
    #[config(default = 2048)]
    pub hidden_dim: usize,
    /// Размерность выхода MLP перед последним слоем.
    #[config(default = 256)]
    pub bottleneck_dim: usize,
}

impl ProjectionHeadConfig {
    /// Создает голову с четырьмя подголовами.
    ///
    /// # Ошибки
    /// `BurnCoreError::InvalidConfig` при нулевых размерностях.
    pub fn init<B: Backend>(&self, device: &B::Device) -> Result<ProjectionHead<B>, BurnCoreError> {
        if self.in_dim == 0 || self.out_dim == 0 || self.bottleneck_dim == 0 || self.hidden_dim == 0 {
            return Err(BurnCoreError::InvalidConfig(format!(
                "Размерности головы должны быть положительны: in={}, hidden={}, bottleneck={}, out={}.",
                self.in_dim, self.hidden_dim, self.bottleneck_dim, self.out_dim
            )));
        }
        Ok(ProjectionHead {
            cls: self.init_sub_head(device),
            pt1: self.init_sub_head(device),
            pt2: self.init_sub_head(device),
            pt3: self.init_sub_head(device),
        })
    }

    fn init_sub_head<B: Backend>(&self, device: &B::Device) -> SubHead<B> {
        let nlayers = self.nlayers.max(1);
        let mut dims = vec![self.in_dim];
        dims.extend(std::iter::repeat(self.hidden_dim).take(nlayers - 1));
        dims.push(self.bottleneck_dim);

        let linears = dims
            .windows(2)
            .map(|pair| init_linear(pair[0], pair[1], true, device))
            .collect();
        let norms = if self.use_bn {
            (0..nlayers - 1)
                .map(|_| BatchNormConfig::new(self.hidden_dim).init(device))
                .collect()
        } else {
            Vec::new()
        };

        SubHead {
            mlp: ProjectionMlp {
                linears,
                norms,
                activation: Gelu::new(),
            },
            last_layer: WeightNormLinear::new(self.bottleneck_dim, self.out_dim, !self.norm_last_layer, device),
        }
    }
}

/// MLP подголовы.
#[derive(Module, Debug)]
pub struct ProjectionMlp<B: Backend> {
    linears: Vec<Linear<B>>,
    /// Пусто, если `BatchNorm` выключен. Нормализация всегда по батчу.
    norms: Vec<BatchNorm<B, 1>>,
    activation: Gelu,
}

impl<B: Backend> ProjectionMlp<B> {
    /// `[batch, in_dim]` -> `[batch, bottleneck_dim]`.
    pub fn forward(&self, input: Tensor<B, 2>) -> Tensor<B, 2> {
        let last = self.linears.len().saturating_sub(1);
        let mut x = input;
        for (i, linear) in self.linears.iter().enumerate() {
            x = linear.forward(x);
            if i < last {
                if let Some(norm) = self.norms.get(i) {
                    x = batch_statistics_norm(norm, x);
                }
                x = self.activation.forward(x);
            }
        }
        x
    }
}

/// `BatchNorm` по статистикам текущего батча независимо от режима бэкенда.
///
/// Скользящие средние слоя не используются: учитель работает без autodiff,
/// и `BatchNorm::forward` перешел бы у него в режим инференса.
fn batch_statistics_norm<B: Backend>(norm: &BatchNorm<B, 1>, x: Tensor<B, 2>) -> Tensor<B, 2> {
    let mean = x.clone().mean_dim(0);
    let var = x.clone().var_bias(0); // смещенная дисперсия, как при обучении
    let x_hat = x.sub(mean).div(var.add_scalar(norm.epsilon).sqrt());
    x_hat
        .mul(norm.gamma.val().unsqueeze::<2>())
        .add(norm.beta.val().unsqueeze::<2>())
}

/// Линейный слой без смещения с весовой нормализацией `w = g * v / ||v||`.
///
/// Норма берется по входной оси для каждого выхода. `g = None` означает
/// фиксированный множитель 1.
#[derive(Module, Debug)]
pub struct WeightNormLinear<B: Backend> {
    /// Направление `[in, out]`.
    pub v: Param<Tensor<B, 2>>,
    /// Обучаемый множитель `[out]`.
    pub g: Option<Param<Tensor<B, 1>>>,
}

impl<B: Backend> WeightNormLinear<B> {
    /// Создает слой: `v ~ U(-1/sqrt(in), 1/sqrt(in))`, `g = 1`.
    #[allow(clippy::cast_precision_loss)]
    pub fn new(d_input: usize, d_output: usize, trainable_gain: bool, device: &B::Device) -> Self {
        let bound = 1.0 / (d_input as f64).sqrt();
        Self {
            v: Param::from_tensor(Tensor::random(
                [d_input, d_output],
                Distribution::Uniform(-bound, bound),
                device,
            )),
            g: trainable_gain.then(|| Param::from_tensor(Tensor::ones([d_output], device))),
        }
    }

    /// Эффективная матрица весов `[in, out]`.
    pub fn weight(&self) -> Tensor<B, 2> {
        let v = self.v.val();
        let norm = v.clone().powf_scalar(2.0).sum_dim(0).sqrt();
        let direction = v.div(norm);
        match &self.g {
            Some(g) => direction.mul(g.val().unsqueeze::<2>()),
            None => direction,
        }
    }

    /// `[batch, in]` -> `[batch, out]`.
    pub fn forward(&self, input: Tensor<B, 2>) -> Tensor<B, 2> {
        input.matmul(self.weight())
    }

    /// Идентификаторы параметров слоя.
    pub fn param_ids(&self) -> Vec<ParamId> {
        let mut ids = vec![self.v.id];
        if let Some(g) = &self.g {
            ids.push(g.id);
        }
        ids
    }
}

/// Одна подголова: MLP, L2-нормализация, последний слой.
#[derive(Module, Debug)]
pub struct SubHead<B: Backend> {
    mlp: ProjectionMlp<B>,
    last_layer: WeightNormLinear<B>,
}

impl<B: Backend> SubHead<B> {
    /// `[batch, in_dim]` -> `[batch, out_dim]`.
    pub fn forward(&self, input: Tensor<B, 2>) -> Tensor<B, 2> {
        let x = self.mlp.forward(input);
        let norm = x.clone().powf_scalar(2.0).sum_dim(1).sqrt().clamp_min(NORMALIZE_EPS);
        self.last_layer.forward(x.div(norm))
    }

    /// Последний слой с весовой нормализацией.
    pub const fn last_layer(&self) -> &WeightNormLinear<B> {
        &self.last_layer
    }
}

/// Логиты головы.
#[derive(Debug, Clone)]
pub enum StreamLogits<B: Backend> {
    /// Все четыре потока, каждый `[batch, out_dim]`.
    AllStreams {
        /// Глобальный поток.
        cls: Tensor<B, 2>,
        /// Верхняя полоса.
        pt1: Tensor<B, 2>,
        /// Средняя полоса.
        pt2: Tensor<B, 2>,
        /// Нижняя полоса.
        pt3: Tensor<B, 2>,
    },
    /// Глобальный поток и одна полоса.
    PartStream {
        /// Глобальный поток.
        cls: Tensor<B, 2>,
        /// Поток выбранной полосы.
        part: Tensor<B, 2>,
        /// Выбранная полоса.
        index: PartIndex,
    },
}

/// Голова из четырех подголов.
#[derive(Module, Debug)]
pub struct ProjectionHead<B: Backend> {
    cls: SubHead<B>,
    pt1: SubHead<B>,
    pt2: SubHead<B>,
    pt3: SubHead<B>,
}

impl<B: Backend> ProjectionHead<B> {
    /// Подголова потока.
    pub const fn sub_head(&self, stream: Stream) -> &SubHead<B> {
        match stream {
            Stream::Cls => &self.cls,
            Stream::Part1 => &self.pt1,
            Stream::Part2 => &self.pt2,
            Stream::Part3 => &self.pt3,
        }
    }

    /// Применяет подголовы к эмбеддингам backbone.
    ///
    /// Каждый эмбеддинг проходит только через подголову своего потока.
    pub fn forward(&self, embeddings: Embeddings<B>) -> StreamLogits<B> {
        match embeddings {
            Embeddings::AllParts { cls, parts: [p1, p2, p3] } => StreamLogits::AllStreams {
                cls: self.cls.forward(cls),
                pt1: self.pt1.forward(p1),
                pt2: self.pt2.forward(p2),
                pt3: self.pt3.forward(p3),
            },
            Embeddings::Part { cls, part, index } => StreamLogits::PartStream {
                cls: self.cls.forward(cls),
                part: self.sub_head(index.stream()).forward(part),
                index,
            },
        }
    }

    /// Идентификаторы параметров последних слоев всех четырех подголов.
    pub fn last_layer_param_ids(&self) -> Vec<ParamId> {
        Stream::ALL
            .iter()
            .flat_map(|stream| self.sub_head(*stream).last_layer().param_ids())
            .collect()
    }
}
