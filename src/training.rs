use crate::cli::TrainArgs;
use crate::error::{self, PinnError};
use crate::metrics::{EpochMetrics, LossReport};
use crate::model::{Surrogate, SurrogateConfig};
use crate::loss::LossWeights;
use crate::pinn::PlatePinn;
use crate::plate::{Plate, PlateConfig};
use crate::schedule::{EarlyStopping, ReduceOnPlateau, StopDecision};
use crate::sensors::{load_measurements, save_measurements};
use crate::{
    CONFIG_FILENAME, HISTORY_FILENAME, LOSS_GRAPH_FILENAME, MODEL_FILENAME, PLATE_FILENAME,
    SENSORS_FILENAME,
};
use burn::backend::{Autodiff, NdArray};
use burn::config::Config;
use burn::module::{AutodiffModule, Module};
use burn::optim::{AdamConfig, GradientsParams, Optimizer};
use burn::record::{FullPrecisionSettings, NamedMpkFileRecorder};
use burn::tensor::backend::AutodiffBackend;
use plotters::prelude::*;
use rand::SeedableRng;
use rand::rngs::StdRng;
use std::collections::BTreeMap;
use std::fs::File;
use std::io::BufWriter;
use std::path::Path;
use std::time::Instant;

type MyBackend = Autodiff<NdArray<f32>>;

/// 学習設定
#[derive(Config)]
pub struct TrainingConfig {
    /// 使用するオプティマイザの設定
    pub optimizer: AdamConfig,
    /// 初期学習率
    #[config(default = 1e-3)]
    pub learning_rate: f64,
    /// 損失の重みの学習率。学習率の減衰は適用しません。
    #[config(default = 1e-5)]
    pub weight_learning_rate: f64,
    /// 学習エポック数
    #[config(default = 200)]
    pub num_epochs: usize,
    /// 1エポックあたりのステップ数
    #[config(default = 50)]
    pub steps_per_epoch: usize,
    /// 1ステップで板の内部から取る点の数
    #[config(default = 800)]
    pub domain_points: usize,
    /// 1ステップで各辺から取る点の数
    #[config(default = 100)]
    pub boundary_points: usize,
    /// 隠れ層のユニット数
    #[config(default = 20)]
    pub hidden_size: usize,
    /// 全結合層の数
    #[config(default = 4)]
    pub num_layers: usize,
    /// 改善が止まったときの学習率の倍率
    #[config(default = 0.5)]
    pub lr_factor: f64,
    #[config(default = 10)]
    pub lr_patience: usize,
    #[config(default = 1e-6)]
    pub min_learning_rate: f64,
    #[config(default = 30)]
    pub early_stopping_patience: usize,
    #[config(default = 0.0)]
    pub early_stopping_min_delta: f32,
    /// 何エポックごとにログを出すか
    #[config(default = 10)]
    pub log_interval: usize,
    #[config(default = 42)]
    pub seed: u64,
}

impl TrainingConfig {
    pub fn surrogate(&self, plate: &Plate) -> SurrogateConfig {
        SurrogateConfig::new(plate.input_dim())
            .with_hidden_size(self.hidden_size)
            .with_num_layers(self.num_layers)
            .with_input_scale(plate.input_scales())
            .with_output_scale(plate.characteristic_deflection())
    }

    /// 学習開始前に設定を検証します。
    pub fn validate(&self) -> error::Result<()> {
        let positive = [
            ("num_epochs", self.num_epochs),
            ("steps_per_epoch", self.steps_per_epoch),
            ("hidden_size", self.hidden_size),
        ];
        for (name, value) in positive {
            if value == 0 {
                return Err(PinnError::Config(format!("{name} は1以上である必要があります")));
            }
        }
        if self.num_layers < 2 {
            return Err(PinnError::Config(
                "num_layers は2以上である必要があります".to_string(),
            ));
        }
        if self.domain_points + 4 * self.boundary_points == 0 {
            return Err(PinnError::Config(
                "バッチには計測点以外の点が少なくとも1点必要です".to_string(),
            ));
        }
        if !(self.learning_rate > 0.0 && self.lr_factor > 0.0 && self.lr_factor <= 1.0) {
            return Err(PinnError::Config(format!(
                "学習率 {} と減衰率 {} が不正です",
                self.learning_rate, self.lr_factor
            )));
        }
        if !(self.weight_learning_rate >= 0.0 && self.weight_learning_rate.is_finite()) {
            return Err(PinnError::Config(format!(
                "重みの学習率 {} が不正です",
                self.weight_learning_rate
            )));
        }
        Ok(())
    }
}

/// 学習の結果
pub struct TrainingOutcome<B: AutodiffBackend> {
    /// 検証損失が最良だったときのモデル
    pub model: PlatePinn<B>,
    pub history: Vec<EpochMetrics>,
    pub best_epoch: Option<usize>,
    pub stopped_early: bool,
}

/// PINNモデルを学習します。
///
/// 各ステップで新しいコロケーション点を取り、損失を最小化したあと、
/// 損失の重みを明示的に射影します。検証損失は固定のバッチで評価し、
/// 学習率の減衰と早期終了の判定に使います。
///
/// 勾配は損失を [`Plate::residual_scale`] で割った値から求めます。損失の値そのものは
/// `(q/D)²` 程度と小さく、Adamの `epsilon` より勾配が小さくなるためです。
/// サロゲートと重みは同じ勾配から、それぞれの学習率で更新します。
pub fn train<B: AutodiffBackend>(
    config: &TrainingConfig,
    plate: &Plate,
    device: &B::Device,
) -> error::Result<TrainingOutcome<B>> {
    config.validate()?;
    B::seed(config.seed);
    let mut rng = StdRng::seed_from_u64(config.seed);

    let mut model = PlatePinn::<B>::new(&config.surrogate(plate), plate, device)?;
    let mut surrogate_optim = config.optimizer.init::<B, Surrogate<B>>();
    let mut weight_optim = config.optimizer.init::<B, LossWeights<B>>();
    let residual_scale = plate.residual_scale();
    let mut plateau = ReduceOnPlateau::new(
        config.learning_rate,
        config.lr_factor,
        config.lr_patience,
        config.min_learning_rate,
    );
    let mut stopper =
        EarlyStopping::new(config.early_stopping_patience, config.early_stopping_min_delta);

    let validation_batch = plate.sample_batch(&mut rng, config.domain_points, config.boundary_points);
    let mut best_model = None;
    let mut history = Vec::with_capacity(config.num_epochs);
    let mut stopped_early = false;

    for epoch in 1..=config.num_epochs {
        let learning_rate = plateau.learning_rate();
        let mut reports = Vec::with_capacity(config.steps_per_epoch);
        let mut skipped_steps = 0;

        for _ in 0..config.steps_per_epoch {
            let batch = plate.sample_batch(&mut rng, config.domain_points, config.boundary_points);
            let output = model.loss(plate, &batch)?;
            let report = output.report()?;
            if !report.is_finite() {
                skipped_steps += 1;
                log::warn!(
                    "[Epoch {}] 損失が有限値ではないため、このステップの更新を見送ります: {:?}",
                    epoch,
                    report.terms
                );
                continue;
            }
            reports.push(report);

            let mut grads = output.total.div_scalar(residual_scale).backward();
            let surrogate_grads = GradientsParams::from_module(&mut grads, model.surrogate());
            let weight_grads = GradientsParams::from_module(&mut grads, model.weights());
            let (surrogate, weights) = model.into_parts();
            let surrogate = surrogate_optim.step(learning_rate, surrogate, surrogate_grads);
            let weights = weight_optim.step(config.weight_learning_rate, weights, weight_grads);
            model = PlatePinn::from_parts(surrogate, weights).adapt_weights();
        }

        let validation = model.valid().loss(plate, &validation_batch)?.report()?;
        let train = summarize_epoch(&reports, &validation);
        if reports.is_empty() {
            log::warn!("[Epoch {}] すべてのステップが見送られました", epoch);
        }
        let metrics = EpochMetrics {
            epoch,
            learning_rate,
            contributions: train.contributions(),
            min_weight: train.min_weight(),
            train,
            validation,
            skipped_steps,
        };

        if epoch % config.log_interval.max(1) == 0 || epoch == 1 {
            log::info!(
                "[Epoch {}] Total Loss: {:.6e}, Validation Loss: {:.6e}, lr: {:.2e}, Terms: {}, Weights: {}",
                epoch,
                metrics.train.total,
                metrics.validation.total,
                learning_rate,
                format_terms(&metrics.train.terms),
                format_terms(&metrics.train.weights),
            );
        }

        let monitored = if metrics.validation.is_finite() {
            metrics.validation.total
        } else {
            f32::INFINITY
        };
        history.push(metrics);

        plateau.observe(monitored);
        match stopper.observe(epoch, monitored) {
            StopDecision::Improved => best_model = Some(model.clone()),
            StopDecision::Continue => {}
            StopDecision::Stop => {
                log::info!(
                    "[Epoch {}] {}エポック改善がないため学習を終了します",
                    epoch,
                    config.early_stopping_patience
                );
                stopped_early = true;
                break;
            }
        }
    }

    if let Some(epoch) = stopper.best_epoch() {
        log::info!(
            "最良のモデル (Epoch {}, Validation Loss: {:.6e}) を復元します",
            epoch,
            stopper.best()
        );
    }

    Ok(TrainingOutcome {
        model: best_model.unwrap_or(model),
        history,
        best_epoch: stopper.best_epoch(),
        stopped_early,
    })
}

/// 学習ステップの平均。有効なステップがなければ損失をNaNとした結果を返します。
fn summarize_epoch(reports: &[LossReport], validation: &LossReport) -> LossReport {
    LossReport::mean(reports).unwrap_or_else(|| LossReport::unavailable(validation))
}

fn format_terms(values: &BTreeMap<String, f32>) -> String {
    values
        .iter()
        .map(|(name, value)| format!("{name}={value:.3e}"))
        .collect::<Vec<_>>()
        .join(", ")
}

/// `train`サブコマンドを実行します。
pub fn run(args: &TrainArgs) -> error::Result<()> {
    let device = Default::default();

    // --- 設定とデータの準備 ---
    let plate_config = match &args.plate {
        Some(path) => PlateConfig::load(path)?,
        None => PlateConfig::new(),
    };
    let mut config = match &args.config {
        Some(path) => TrainingConfig::load(path)?,
        None => TrainingConfig::new(AdamConfig::new()),
    };
    if let Some(epochs) = args.epochs {
        config.num_epochs = epochs;
    }
    let measurements = load_measurements(&args.sensors)?;
    log::info!(
        "センサー計測値を '{}' から {} 点読み込みました",
        args.sensors.display(),
        measurements.len()
    );
    let plate = Plate::new(&plate_config, measurements)?;

    let artifacts = args.artifacts.as_path();
    std::fs::create_dir_all(artifacts)?;
    config.save(artifacts.join(CONFIG_FILENAME))?;
    plate_config.save(artifacts.join(PLATE_FILENAME))?;
    save_measurements(artifacts.join(SENSORS_FILENAME), plate.measurements())?;

    log::info!(
        "学習を開始します (Kirchhoff-Love平板, T = {}, E = {}, ν = {}, D = {:.4}) - バックエンド: NdArray (CPU)",
        plate.thickness(),
        plate.youngs_modulus(),
        plate.poisson_ratio(),
        plate.flexural_rigidity()
    );
    let training_start = Instant::now();
    let outcome = train::<MyBackend>(&config, &plate, &device)?;
    let training_duration = training_start.elapsed();
    log::info!("学習が完了しました。");
    log::info!("=> 学習時間: {:.2?}", training_duration);
    if outcome.stopped_early {
        log::info!("=> 早期終了しました (最良エポック: {:?})", outcome.best_epoch);
    }

    // --- 結果の保存と描画 ---
    let history_path = artifacts.join(HISTORY_FILENAME);
    serde_json::to_writer_pretty(BufWriter::new(File::create(&history_path)?), &outcome.history)?;
    log::info!("=> 学習履歴を '{}' に保存しました。", history_path.display());

    let graph_path = artifacts.join(LOSS_GRAPH_FILENAME);
    plot_loss_history(&outcome.history, &graph_path).map_err(|e| PinnError::Plot(e.to_string()))?;
    log::info!("=> 損失グラフを '{}' に保存しました。", graph_path.display());

    save_surrogate(outcome.model.into_surrogate().valid(), artifacts)?;
    Ok(())
}

/// 学習済みサロゲートを保存します。
pub fn save_surrogate<B: burn::prelude::Backend>(model: Surrogate<B>, artifacts: &Path) -> error::Result<()> {
    let path = artifacts.join(MODEL_FILENAME);
    log::info!("学習済みモデルを保存中...");
    model.save_file(
        path.clone(),
        &NamedMpkFileRecorder::<FullPrecisionSettings>::new(),
    )?;
    log::info!("=> モデルを '{}' に保存しました。", path.display());
    Ok(())
}

/// 学習過程の損失をグラフとしてPNGファイルに出力します。
fn plot_loss_history(
    history: &[EpochMetrics],
    path: &Path,
) -> std::result::Result<(), Box<dyn std::error::Error>> {
    let log_loss = |value: f32| {
        if value.is_finite() {
            value.max(f32::MIN_POSITIVE).log10()
        } else {
            f32::NAN
        }
    };

    let mut series: Vec<(String, Vec<f32>)> = vec![
        (
            "Total Loss".to_string(),
            history.iter().map(|m| log_loss(m.train.total)).collect(),
        ),
        (
            "Validation Loss".to_string(),
            history.iter().map(|m| log_loss(m.validation.total)).collect(),
        ),
    ];
    if let Some(first) = history.first() {
        for name in first.train.terms.keys() {
            let values = history
                .iter()
                .map(|m| log_loss(m.train.terms.get(name).copied().unwrap_or(0.0)))
                .collect();
            series.push((name.clone(), values));
        }
    }

    let finite = series.iter().flat_map(|(_, v)| v.iter()).filter(|v| v.is_finite());
    let (min_log_loss, max_log_loss) = finite.fold((f32::INFINITY, f32::NEG_INFINITY), |(lo, hi), v| {
        (lo.min(*v), hi.max(*v))
    });
    let (min_log_loss, max_log_loss) = if min_log_loss.is_finite() {
        (min_log_loss - 0.5, max_log_loss + 0.5)
    } else {
        (-6.0, 0.0)
    };

    let root = BitMapBackend::new(path, (800, 600)).into_drawing_area();
    root.fill(&WHITE)?;
    let mut chart = ChartBuilder::on(&root)
        .caption("Loss History", ("sans-serif", 40).into_font())
        .margin(10)
        .x_label_area_size(40)
        .y_label_area_size(50)
        .build_cartesian_2d(0..history.len().max(1), min_log_loss..max_log_loss)?;
    chart
        .configure_mesh()
        .y_desc("Loss (log10 scale)")
        .x_desc("Epochs")
        .draw()?;

    let colors = [RED, BLUE, GREEN, MAGENTA, CYAN, BLACK, YELLOW];
    for (i, (label, values)) in series.iter().enumerate() {
        let color = colors[i % colors.len()];
        chart
            .draw_series(LineSeries::new(
                values
                    .iter()
                    .enumerate()
                    .filter(|(_, val)| val.is_finite())
                    .map(|(i, &val)| (i, val)),
                &color,
            ))?
            .label(label.as_str())
            .legend(move |(x, y)| PathElement::new(vec![(x, y), (x + 20, y)], &color));
    }
    chart
        .configure_series_labels()
        .background_style(&WHITE.mix(0.8))
        .border_style(&BLACK)
        .draw()?;
    root.present()?;
    Ok(())
}
