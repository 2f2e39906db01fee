// training_engine/src/trainer.rs

#![warn(missing_docs, clippy::all, clippy::pedantic, clippy::nursery)]
#![deny(unsafe_code, clippy::unwrap_used, clippy::expect_used)]

//! Цикл обучения.
//!
//! Шаг: прямые проходы учителя и студента, потери с обновлением центров,
//! обратный проход, усреднение градиентов по участникам, обрезка, заморозка
//! последних слоев, шаг оптимизатора, обновление учителя скользящим средним.
//! Учитель является `student.valid()` на внутреннем бэкенде и в графе
//! вычислений не участвует.

use std::{
    collections::BTreeMap,
    path::Path,
    time::{Duration, Instant},
};

use burn::{
    module::AutodiffModule,
    tensor::{backend::AutodiffBackend, ElementConversion, Tensor},
};
use chrono::Utc;
use core_burn::{MultiCropNetwork, MultiCropNetworkConfig, ProjectionHeadConfig, VitVariant};
use tracing::{debug, error, info};
use utils_crate::{BackboneArch, TrainingConfig};

use crate::{
    checkpoint::CheckpointMeta,
    data::MultiCropLoader,
    dispatch::NUM_GLOBAL_VIEWS,
    ema_update,
    metrics::append_epoch_log,
    optimizer::{cancel_last_layer_gradients, clip_gradients, gradient_norms},
    params::sync_gradients,
    teacher_temperature_schedule, CheckpointStore, DistillationLoss, DistillationOptimizer, LossScaler,
    MetricLogger, MultiCropDispatcher, ParamRegistry, RunContext, Schedule, StepSettings, TrainingError,
};

/// Конфигурация сети студента по конфигурации обучения.
///
/// Stochastic depth задается `drop_path_rate`; учитель получается из
/// студента через `valid()`, где он не действует.
#[must_use]
pub fn build_network_config(config: &TrainingConfig) -> MultiCropNetworkConfig {
    let variant = match config.model.arch {
        BackboneArch::VitTiny => VitVariant::Tiny,
        BackboneArch::VitSmall => VitVariant::Small,
        BackboneArch::VitBase => VitVariant::Base,
    };
    let (height, width) = config.multicrop.global_size;
    let backbone = variant.config([height, width], config.model.patch_size, config.model.drop_path_rate);
    let head = ProjectionHeadConfig::new(backbone.embed_dim, config.model.out_dim)
        .with_use_bn(config.model.use_bn_in_head)
        .with_norm_last_layer(config.model.norm_last_layer)
        .with_nlayers(config.model.head_nlayers)
        .with_hidden_dim(config.model.head_hidden_dim)
        .with_bottleneck_dim(config.model.head_bottleneck_dim);
    MultiCropNetworkConfig::new(backbone, head)
}

/// Итоги одного шага.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct StepStats {
    /// Значение потерь (до масштабирования).
    pub loss: f64,
    /// Скорость обучения шага.
    pub lr: f64,
    /// Затухание весов шага.
    pub weight_decay: f64,
    /// Момент учителя шага.
    pub momentum: f64,
    /// Множитель потерь после шага, если масштабирование включено.
    pub loss_scale: Option<f64>,
    /// Шаг оптимизатора пропущен из-за неконечных градиентов.
    pub skipped: bool,
}

/// Итоги эпохи.
#[derive(Debug, Clone, PartialEq)]
pub struct EpochStats {
    /// Номер эпохи.
    pub epoch: usize,
    /// Средние метрик по всем участникам.
    pub averages: BTreeMap<String, f64>,
    /// Длительность эпохи.
    pub elapsed: Duration,
}

/// Состояние обучения одного участника.
pub struct Trainer<B: AutodiffBackend> {
    config: TrainingConfig,
    ctx: RunContext,
    device: B::Device,
    student: MultiCropNetwork<B>,
    teacher: MultiCropNetwork<B::InnerBackend>,
    registry: ParamRegistry,
    optimizer: DistillationOptimizer<B::InnerBackend>,
    loss: DistillationLoss<B>,
    scaler: Option<LossScaler>,
    dispatcher: MultiCropDispatcher,
    lr_schedule: Schedule,
    wd_schedule: Schedule,
    momentum_schedule: Schedule,
    steps_per_epoch: usize,
    start_epoch: usize,
    store: CheckpointStore,
}

impl<B: AutodiffBackend> Trainer<B> {
    /// Создает студента, учителя, оптимизатор, функцию потерь и расписания.
    ///
    /// # Аргументы
    /// * `config` - Конфигурация обучения.
    /// * `ctx` - Ранг, размер группы, зерно и коллективные операции.
    /// * `device` - Устройство.
    /// * `steps_per_epoch` - Шагов в эпохе (пакетов загрузчика).
    ///
    /// # Ошибки
    /// Ошибки проверки конфигурации, создания сети и построения расписаний.
    pub fn new(
        config: TrainingConfig,
        ctx: RunContext,
        device: B::Device,
        steps_per_epoch: usize,
    ) -> Result<Self, TrainingError> {
        let network_config = build_network_config(&config);
        Self::with_network_config(config, &network_config, ctx, device, steps_per_epoch)
    }

    /// Как [`Trainer::new`], но с явной конфигурацией сети.
    ///
    /// # Ошибки
    /// См. [`Trainer::new`].
    pub fn with_network_config(
        config: TrainingConfig,
        network_config: &MultiCropNetworkConfig,
        ctx: RunContext,
        device: B::Device,
        steps_per_epoch: usize,
    ) -> Result<Self, TrainingError> {
        config.validate(ctx.world_size)?;
        if steps_per_epoch == 0 {
            return Err(TrainingError::Config(
                "В эпохе нет ни одного полного пакета: данных меньше, чем batch_size_per_gpu * world_size."
                    .to_string(),
            ));
        }
        if network_config.head.out_dim != config.model.out_dim {
            return Err(TrainingError::Config(format!(
                "out_dim сети ({}) не совпадает с out_dim конфигурации ({}).",
                network_config.head.out_dim, config.model.out_dim
            )));
        }
        B::seed(ctx.rank_seed());

        let student: MultiCropNetwork<B> = network_config.init(&device)?;
        let registry = ParamRegistry::from_module(&student, &student.last_layer_param_ids());
        let student = registry.broadcast_from_main(student, &ctx)?;
        let teacher = student.valid();
        registry.check_compatible(&teacher)?;

        let epochs = config.optim.epochs;
        let lr_schedule = Schedule::cosine(
            config.scaled_lr(ctx.world_size),
            config.optim.min_lr,
            epochs,
            steps_per_epoch,
            config.optim.warmup_epochs,
            0.0,
        )?;
        let wd_schedule = Schedule::cosine(
            config.optim.weight_decay,
            config.optim.weight_decay_end,
            epochs,
            steps_per_epoch,
            0,
            0.0,
        )?;
        let momentum_schedule = Schedule::cosine(config.optim.momentum_teacher, 1.0, epochs, steps_per_epoch, 0, 0.0)?;
        let teacher_temps = teacher_temperature_schedule(
            config.loss.warmup_teacher_temp,
            config.loss.teacher_temp,
            config.loss.warmup_teacher_temp_epochs,
            epochs,
        )?;

        let loss = DistillationLoss::new(
            config.model.out_dim,
            teacher_temps,
            config.loss.student_temp,
            config.loss.center_momentum,
            &device,
        );
        let optimizer = DistillationOptimizer::new(config.optim.optimizer, &registry);
        let scaler = config.optim.use_fp16.then(LossScaler::default);
        let dispatcher = MultiCropDispatcher::new(config.multicrop.local_crops_number);
        let store = CheckpointStore::new(config.run.output_dir.clone());

        info!(
            "Обучение: ранг {}/{}, {} эпох по {} шагов, lr {:.3e} (после масштабирования), оптимизатор {:?}",
            ctx.rank,
            ctx.world_size,
            epochs,
            steps_per_epoch,
            config.scaled_lr(ctx.world_size),
            config.optim.optimizer
        );
        Ok(Self {
            config,
            ctx,
            device,
            student,
            teacher,
            registry,
            optimizer,
            loss,
            scaler,
            dispatcher,
            lr_schedule,
            wd_schedule,
            momentum_schedule,
            steps_per_epoch,
            start_epoch: 0,
            store,
        })
    }

    /// Студент.
    pub const fn student(&self) -> &MultiCropNetwork<B> {
        &self.student
    }

    /// Учитель.
    pub const fn teacher(&self) -> &MultiCropNetwork<B::InnerBackend> {
        &self.teacher
    }

    /// Функция потерь с текущими центрами.
    pub const fn loss(&self) -> &DistillationLoss<B> {
        &self.loss
    }

    /// Реестр параметров студента.
    pub const fn registry(&self) -> &ParamRegistry {
        &self.registry
    }

    /// Состояние масштабирования потерь.
    pub const fn scaler(&self) -> Option<&LossScaler> {
        self.scaler.as_ref()
    }

    /// Эпоха, с которой начнется [`Trainer::fit`].
    pub const fn start_epoch(&self) -> usize {
        self.start_epoch
    }

    /// Конфигурация обучения.
    pub const fn config(&self) -> &TrainingConfig {
        &self.config
    }

    /// Хранилище чекпоинтов.
    pub const fn store(&self) -> &CheckpointStore {
        &self.store
    }

    /// Восстанавливает состояние из основного чекпоинта, если он есть.
    ///
    /// # Возвращает
    /// `true`, если состояние восстановлено.
    ///
    /// # Ошибки
    /// Ошибки чтения чекпоинта и несовпадение структуры сетей.
    pub fn resume_if_present(&mut self) -> Result<bool, TrainingError> {
        if !self.store.has_primary() {
            debug!("Чекпоинт для продолжения не найден, обучение с нуля");
            return Ok(false);
        }
        let dir = self.store.primary_dir();
        let restored = self.store.load(
            &dir,
            self.student.clone(),
            self.teacher.clone(),
            &mut self.optimizer,
            &mut self.loss,
            &self.device,
        )?;
        // Идентификаторы параметров приходят из чекпоинта.
        let registry = ParamRegistry::from_module(&restored.student, &restored.student.last_layer_param_ids());
        registry.check_compatible(&restored.teacher)?;
        self.registry = registry;
        self.student = restored.student;
        self.teacher = restored.teacher;
        if self.scaler.is_some() {
            if let Some(scaler) = restored.meta.fp16_scaler {
                self.scaler = Some(scaler);
            }
        }
        self.start_epoch = restored.meta.epoch;
        Ok(true)
    }

    /// Один шаг обучения.
    ///
    /// # Аргументы
    /// * `views` - Пакеты видов `[global_0, global_1, local_0 ..]`.
    /// * `epoch` - Эпоха.
    /// * `step` - Шаг внутри эпохи.
    ///
    /// # Ошибки
    /// `TrainingError::NonFiniteLoss` при неконечных потерях, ошибки форм,
    /// расписаний и коллективных операций.
    pub fn train_step(&mut self, views: &[Tensor<B, 4>], epoch: usize, step: usize) -> Result<StepStats, TrainingError> {
        let it = epoch * self.steps_per_epoch + step;
        let lr = self.lr_schedule.at(it)?;
        let weight_decay = self.wd_schedule.at(it)?;
        let momentum = self.momentum_schedule.at(it)?;

        let teacher_views: Vec<Tensor<B::InnerBackend, 4>> = views
            .iter()
            .take(NUM_GLOBAL_VIEWS)
            .map(|view| view.clone().inner())
            .collect();
        let teacher_logits = self.dispatcher.teacher_forward(&self.teacher, &teacher_views)?;
        let student_logits = self.dispatcher.student_forward(&self.student, views)?;
        let output = self
            .loss
            .compute(&teacher_logits, &student_logits, epoch, self.ctx.collective.as_ref())?;

        let loss = output.loss.clone().into_scalar().elem::<f64>();
        if !self.finite_on_all_ranks(loss)? {
            error!("Потери не конечны хотя бы у одного участника (локально {}), обучение остановлено", loss);
            return Err(TrainingError::NonFiniteLoss { loss, epoch, step: it });
        }

        let scaled = match &self.scaler {
            Some(scaler) => scaler.scale_loss(output.loss),
            None => output.loss,
        };
        let grads = scaled.backward();
        let grads = self.registry.collect_gradients(&self.student, &grads)?;
        let grads = sync_gradients(grads, &self.ctx)?;
        let grads = match &self.scaler {
            Some(scaler) => scaler.unscale(grads),
            None => grads,
        };

        let norms = gradient_norms(&grads);
        let found_inf = norms.iter().flatten().any(|norm| !norm.is_finite());
        let grads = clip_gradients(grads, &norms, self.config.optim.clip_grad);
        let grads = cancel_last_layer_gradients(grads, &self.registry, epoch, self.config.optim.freeze_last_layer);

        let skipped = found_inf && self.scaler.is_some();
        if !skipped {
            let params = self.registry.collect_values(&self.student.valid())?;
            let updates = self
                .optimizer
                .step(params, grads, StepSettings { lr, weight_decay })?
                .into_iter()
                .map(|update| update.map(Tensor::<B, 1>::from_inner))
                .collect();
            self.student = self.registry.write_values(self.student.clone(), updates)?;
        }
        if let Some(scaler) = &mut self.scaler {
            scaler.update(found_inf);
        }

        self.teacher = ema_update(&self.student.valid(), self.teacher.clone(), momentum)?;

        Ok(StepStats {
            loss,
            lr,
            weight_decay,
            momentum,
            loss_scale: self.scaler.map(|scaler| scaler.scale),
            skipped,
        })
    }

    /// Конечны ли потери у всех участников.
    ///
    /// Останавливаются все участники сразу: иначе оставшиеся ждали бы
    /// упавшего в следующей коллективной операции.
    fn finite_on_all_ranks(&self, loss: f64) -> Result<bool, TrainingError> {
        if self.ctx.world_size == 1 {
            return Ok(loss.is_finite());
        }
        let mut diverged = [if loss.is_finite() { 0.0 } else { 1.0 }];
        self.ctx.collective.all_reduce_sum(&mut diverged)?;
        Ok(diverged[0] == 0.0)
    }

    /// Записывает чекпоинт; `next_epoch` сохраняется как эпоха продолжения.
    ///
    /// # Ошибки
    /// Ошибки записи.
    pub fn save_checkpoint(&self, dir: &Path, next_epoch: usize) -> Result<(), TrainingError> {
        let meta = CheckpointMeta {
            epoch: next_epoch,
            args: self.config.clone(),
            fp16_scaler: self.scaler,
            saved_at: Utc::now(),
        };
        self.store
            .save(dir, &self.student, &self.teacher, &self.optimizer, &self.loss, &meta)
    }

    /// Обучает с текущей эпохи до конца.
    ///
    /// Основной чекпоинт перезаписывается после каждого шага (если
    /// `checkpoint_every_step`) с текущей эпохой и в конце эпохи со следующей.
    ///
    /// # Ошибки
    /// Любая ошибка шага, загрузки данных или записи прерывает обучение.
    #[allow(clippy::cast_precision_loss)]
    pub fn fit(&mut self, loader: &MultiCropLoader) -> Result<Vec<EpochStats>, TrainingError> {
        if loader.batches_per_epoch() != self.steps_per_epoch {
            return Err(TrainingError::Config(format!(
                "Загрузчик дает {} пакетов за эпоху, расписания построены на {}.",
                loader.batches_per_epoch(),
                self.steps_per_epoch
            )));
        }
        let epochs = self.config.optim.epochs;
        let log_every = self.config.run.log_every.max(1);
        let log_path = self.config.run.output_dir.join("log.txt");
        let mut history = Vec::with_capacity(epochs.saturating_sub(self.start_epoch));

        info!("Начало обучения с эпохи {} до {}", self.start_epoch, epochs);
        for epoch in self.start_epoch..epochs {
            let started = Instant::now();
            let order = loader.epoch_order(epoch);
            let mut metrics = MetricLogger::new();

            for step in 0..self.steps_per_epoch {
                let views = loader.load_batch::<B>(&order, epoch, step, &self.device)?;
                let stats = self.train_step(&views, epoch, step)?;
                metrics.update("loss", stats.loss);
                metrics.update("lr", stats.lr);
                metrics.update("wd", stats.weight_decay);

                if step % log_every == 0 || step + 1 == self.steps_per_epoch {
                    info!(
                        "Эпоха: [{}/{}] [{}/{}] {}",
                        epoch,
                        epochs,
                        step,
                        self.steps_per_epoch,
                        metrics
                    );
                }
                if self.config.run.checkpoint_every_step && self.ctx.is_main_process() {
                    self.save_checkpoint(&self.store.primary_dir(), epoch)?;
                }
            }

            metrics.synchronize(&self.ctx)?;
            let averages = metrics.global_averages();
            let elapsed = started.elapsed();
            let summary: Vec<String> = averages.iter().map(|(name, value)| format!("{name}: {value:.6}")).collect();
            info!(
                "Эпоха {} завершена за {:.1} с. Средние: {}",
                epoch,
                elapsed.as_secs_f64(),
                summary.join("  ")
            );

            if self.ctx.is_main_process() {
                self.save_checkpoint(&self.store.primary_dir(), epoch + 1)?;
                let freq = self.config.run.saveckp_freq;
                if freq > 0 && epoch >= self.config.run.permanent_checkpoint_from && epoch % freq == 0 {
                    self.save_checkpoint(&self.store.permanent_dir(epoch), epoch + 1)?;
                    info!("Постоянный чекпоинт эпохи {} записан", epoch);
                }
                append_epoch_log(&log_path, &averages, epoch)?;
            }
            self.start_epoch = epoch + 1;
            history.push(EpochStats {
                epoch,
                averages,
                elapsed,
            });
        }
        Ok(history)
    }
}

impl<B: AutodiffBackend> std::fmt::Debug for Trainer<B> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Trainer")
            .field("rank", &self.ctx.rank)
            .field("world_size", &self.ctx.world_size)
            .field("params", &self.registry.len())
            .field("steps_per_epoch", &self.steps_per_epoch)
            .field("start_epoch", &self.start_epoch)
            .finish_non_exhaustive()
    }
}

