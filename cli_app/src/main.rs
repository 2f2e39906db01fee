// cli_app/src/main.rs

#![warn(missing_docs, clippy::all, clippy::pedantic, clippy::nursery)]
#![deny(unsafe_code, clippy::unwrap_used, clippy::expect_used)]

//! `pass-train`: обучение vision transformer с part-токенами самодистилляцией.
//!
//! Подкоманды:
//! - `train` - обучение по конфигурации TOML с переопределениями из командной строки;
//! - `export-teacher` - извлечение backbone учителя из чекпоинта.

use std::{
    panic::{catch_unwind, AssertUnwindSafe},
    path::{Path, PathBuf},
    process::ExitCode,
    sync::{mpsc, Arc},
    thread,
    time::Instant,
};

use anyhow::{anyhow, Context, Result};
use clap::{Parser, Subcommand};
use tracing::{error, info, Level};
use training_engine::{
    data::{DistributedSampler, ImageFolder, MultiCropAugmentation, MultiCropLoader},
    export_teacher_backbone, Collective, EpochStats, RunContext, ThreadGroup, Trainer, TrainingError,
};
use utils_crate::{ensure_dir_exists, init_tracing_logger, BackboneArch, TrainingConfig};

#[cfg(feature = "ndarray_backend_cli")]
type ConcreteBackend = burn_ndarray::NdArray<f32>;
#[cfg(all(feature = "tch_backend_cli", not(feature = "ndarray_backend_cli")))]
type ConcreteBackend = burn_tch::LibTorch<f32>;
#[cfg(all(
    feature = "wgpu_backend_cli",
    not(any(feature = "ndarray_backend_cli", feature = "tch_backend_cli"))
))]
type ConcreteBackend = burn_wgpu::Wgpu;

#[cfg(not(any(feature = "ndarray_backend_cli", feature = "tch_backend_cli", feature = "wgpu_backend_cli")))]
compile_error!("Включите одну из фич бэкенда: ndarray_backend_cli, tch_backend_cli, wgpu_backend_cli.");

/// Бэкенд обучения.
type SelectedBackend = burn_autodiff::Autodiff<ConcreteBackend>;

const APP_NAME: &str = "pass-train";

/// Обучение PASS: самодистилляция ViT с cls и тремя part-токенами.
#[derive(Debug, Parser)]
#[command(name = APP_NAME, version, about)]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Обучение (с продолжением из `<output_dir>/checkpoint`, если он есть).
    Train(TrainArgs),
    /// Извлечение backbone учителя из чекпоинта.
    ExportTeacher(ExportArgs),
}

/// Аргументы `train`. Переопределения применяются поверх файла конфигурации.
#[derive(Debug, clap::Args)]
struct TrainArgs {
    /// Файл конфигурации TOML. Без файла используются значения по умолчанию.
    #[arg(short, long, default_value = "pass.toml")]
    config: PathBuf,
    /// Директория чекпоинтов и журнала.
    #[arg(long)]
    output_dir: Option<PathBuf>,
    /// Корень датасета.
    #[arg(long)]
    data_path: Option<PathBuf>,
    /// Число эпох.
    #[arg(long)]
    epochs: Option<usize>,
    /// Размер пакета на участника.
    #[arg(long)]
    batch_size_per_gpu: Option<usize>,
    /// Зерно.
    #[arg(long)]
    seed: Option<u64>,
    /// Архитектура: vit_tiny, vit_small, vit_base (или deit_tiny, deit_small).
    #[arg(long)]
    arch: Option<BackboneArch>,
    /// Число участников data-parallel обучения (потоки одного процесса,
    /// устройство бэкенда по умолчанию у всех).
    #[arg(long, default_value_t = 1, value_parser = clap::value_parser!(u16).range(1..))]
    world_size: u16,
}

impl TrainArgs {
    fn apply_overrides(&self, config: &mut TrainingConfig) {
        if let Some(dir) = &self.output_dir {
            config.run.output_dir.clone_from(dir);
        }
        if let Some(path) = &self.data_path {
            config.data.data_path.clone_from(path);
        }
        if let Some(epochs) = self.epochs {
            config.optim.epochs = epochs;
        }
        if let Some(batch) = self.batch_size_per_gpu {
            config.optim.batch_size_per_gpu = batch;
        }
        if let Some(seed) = self.seed {
            config.run.seed = seed;
        }
        if let Some(arch) = self.arch {
            config.model.arch = arch;
        }
    }
}

/// Аргументы `export-teacher`.
#[derive(Debug, clap::Args)]
struct ExportArgs {
    /// Директория чекпоинта (`<output_dir>/checkpoint` или `checkpointNNNN`).
    checkpoint: PathBuf,
    /// Путь файла весов backbone (без расширения).
    output: PathBuf,
    /// Директория файлов лога.
    #[arg(long)]
    log_dir: Option<PathBuf>,
}

fn main() -> ExitCode {
    let cli = Cli::parse();
    match run(cli) {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            if let Some(TrainingError::NonFiniteLoss { loss, epoch, step }) = e.downcast_ref::<TrainingError>() {
                error!("Обучение расходится (потери {loss} на эпохе {epoch}, шаг {step}).");
            } else {
                error!("Ошибка: {e:#}");
            }
            // Логгер мог не успеть инициализироваться.
            eprintln!("{APP_NAME}: {e:#}");
            ExitCode::FAILURE
        }
    }
}

fn run(cli: Cli) -> Result<()> {
    match cli.command {
        Command::Train(args) => train(&args),
        Command::ExportTeacher(args) => export(&args),
    }
}

fn train(args: &TrainArgs) -> Result<()> {
    let mut config = TrainingConfig::load_from_toml(&args.config)
        .with_context(|| format!("Чтение конфигурации {:?}", args.config))?;
    args.apply_overrides(&mut config);

    init_tracing_logger(
        APP_NAME,
        0,
        Level::INFO,
        Level::DEBUG,
        config.run.log_dir.as_deref(),
    )?;
    info!("{} {}", APP_NAME, env!("CARGO_PKG_VERSION"));

    let world_size = usize::from(args.world_size);
    config.validate(world_size)?;
    ensure_dir_exists(&config.run.output_dir)?;
    save_config_snapshot(&config, &config.run.output_dir.join("config.toml"))?;
    info!(
        "Архитектура {}, {} эпох, пакет {} на участника, участников {}, выход {:?}",
        config.model.arch,
        config.optim.epochs,
        config.optim.batch_size_per_gpu,
        world_size,
        config.run.output_dir
    );

    let dataset = ImageFolder::open(
        &config.data.data_path,
        config.data.filter_path.as_deref(),
        config.data.keep_num,
    )?;
    info!("Данные: {} изображений в {:?}", dataset.len(), dataset.root());

    let started = Instant::now();
    let history = train_data_parallel(&config, &dataset, world_size)?;
    info!(
        "Обучение завершено: {} эпох за {}",
        history.len(),
        format_duration(started.elapsed().as_secs())
    );
    Ok(())
}

/// Обучает `world_size` участников, по одному потоку на ранг.
///
/// Первая ошибка любого участника возвращается сразу; остальные потоки
/// завершаются вместе с процессом.
///
/// # Возвращает
/// Историю эпох главного участника.
fn train_data_parallel(config: &TrainingConfig, dataset: &ImageFolder, world_size: usize) -> Result<Vec<EpochStats>> {
    if world_size == 1 {
        return run_rank(config.clone(), dataset.clone(), RunContext::single(config.run.seed));
    }

    let (sender, receiver) = mpsc::channel();
    for member in ThreadGroup::new(world_size) {
        let rank = member.rank();
        let (config, dataset, sender) = (config.clone(), dataset.clone(), sender.clone());
        thread::Builder::new()
            .name(format!("pass-rank-{rank}"))
            .spawn(move || {
                let ctx = RunContext::new(Arc::new(member), config.run.seed);
                let result = catch_unwind(AssertUnwindSafe(|| run_rank(config, dataset, ctx)))
                    .unwrap_or_else(|_| Err(anyhow!("Участник {rank} аварийно завершился")));
                // Получатель мог уже выйти после ошибки другого участника.
                let _ = sender.send((rank, result));
            })
            .with_context(|| format!("Не удалось запустить поток участника {rank}"))?;
    }
    drop(sender);

    let mut main_history = None;
    for _ in 0..world_size {
        let (rank, result) = receiver.recv().context("Потоки участников завершились без результата")?;
        let history = result.with_context(|| format!("Участник {rank}"))?;
        if rank == 0 {
            main_history = Some(history);
        }
    }
    main_history.context("Нет результата главного участника")
}

/// Обучение одного участника: свой сэмплер, загрузчик и `Trainer`.
fn run_rank(config: TrainingConfig, dataset: ImageFolder, ctx: RunContext) -> Result<Vec<EpochStats>> {
    let sampler = DistributedSampler::new(dataset.len(), ctx.rank, ctx.world_size, config.run.seed, true);
    let augmentation = MultiCropAugmentation::from_config(&config.multicrop);
    let loader = MultiCropLoader::new(
        dataset,
        sampler,
        augmentation,
        config.optim.batch_size_per_gpu,
        config.data.num_workers,
        config.run.seed,
    )?;

    let device = Default::default();
    let steps_per_epoch = loader.batches_per_epoch();
    let rank = ctx.rank;
    let mut trainer = Trainer::<SelectedBackend>::new(config, ctx, device, steps_per_epoch)?;
    if trainer.resume_if_present()? && rank == 0 {
        info!("Продолжение обучения с эпохи {}", trainer.start_epoch());
    }
    Ok(trainer.fit(&loader)?)
}

fn export(args: &ExportArgs) -> Result<()> {
    init_tracing_logger(APP_NAME, 0, Level::INFO, Level::DEBUG, args.log_dir.as_deref())?;
    let device = Default::default();
    let config = export_teacher_backbone::<ConcreteBackend>(&args.checkpoint, &args.output, &device)
        .with_context(|| format!("Экспорт учителя из {:?}", args.checkpoint))?;
    info!("Экспортирован backbone {} (patch {})", config.model.arch, config.model.patch_size);
    Ok(())
}

fn save_config_snapshot(config: &TrainingConfig, path: &Path) -> Result<()> {
    std::fs::write(path, config.to_toml_string()?).with_context(|| format!("Запись {path:?}"))?;
    Ok(())
}

/// Длительность в виде `ч:мм:сс`.
fn format_duration(total_secs: u64) -> String {
    format!("{}:{:02}:{:02}", total_secs / 3600, (total_secs / 60) % 60, total_secs % 60)
}
