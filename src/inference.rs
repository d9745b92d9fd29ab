use crate::batch::{CollocationBatch, CollocationPoint, PointKind};
use crate::cli::InferArgs;
use crate::derivatives::{Partial, extract};
use crate::error::{PinnError, Result};
use crate::metrics::{ErrorMetrics, tensor_values};
use crate::model::Surrogate;
use crate::moments::bending_moments;
use crate::plate::{LoadModel, Plate, PlateConfig};
use crate::sensors::load_measurements;
use crate::training::TrainingConfig;
use crate::{
    CONFIG_FILENAME, DEFLECTION_PLOT_FILENAME, MODEL_FILENAME, PLATE_FILENAME, SENSORS_FILENAME,
};
use burn::backend::NdArray;
use burn::config::Config;
use burn::module::Module;
use burn::prelude::Backend;
use burn::record::{FullPrecisionSettings, NamedMpkFileRecorder};
use plotters::prelude::*;
use std::path::Path;
use std::time::Instant;

type MyBackend = NdArray<f32>;

/// 点ごとの予測値（たわみと曲げモーメント）
#[derive(Debug, Clone, Default)]
pub struct Prediction {
    pub points: Vec<CollocationPoint>,
    pub deflection: Vec<f32>,
    pub mx: Vec<f32>,
    pub my: Vec<f32>,
}

/// 成果物ディレクトリから板と学習済みサロゲートを読み込みます。
pub fn load_artifacts<B: Backend>(artifacts: &Path, device: &B::Device) -> Result<(Plate, Surrogate<B>)> {
    let model_path = artifacts.join(MODEL_FILENAME);
    if !model_path.exists() {
        return Err(PinnError::ModelNotFound(model_path.display().to_string()));
    }
    let config = TrainingConfig::load(artifacts.join(CONFIG_FILENAME))?;
    let plate_config = PlateConfig::load(artifacts.join(PLATE_FILENAME))?;
    let measurements = load_measurements(artifacts.join(SENSORS_FILENAME))?;
    let plate = Plate::new(&plate_config, measurements)?;

    log::info!("保存済みモデルを '{}' からロード中...", model_path.display());
    let model = config.surrogate(&plate).init::<B>(device).load_file(
        model_path,
        &NamedMpkFileRecorder::<FullPrecisionSettings>::new(),
        device,
    )?;
    Ok((plate, model))
}

/// 任意の点でたわみと曲げモーメントを予測します。
pub fn predict<B: Backend>(
    model: &Surrogate<B>,
    plate: &Plate,
    points: Vec<CollocationPoint>,
    device: &B::Device,
) -> Result<Prediction> {
    let batch = CollocationBatch::new(points);
    let inputs = batch.inputs::<B>(plate.input_dim(), device)?;
    let output = extract(model, inputs, plate.layout())?;
    let (mx, my) = bending_moments(
        output.get(Partial::Uxx)?,
        output.get(Partial::Uyy)?,
        plate.flexural_rigidity(),
        plate.poisson_ratio(),
    );
    Ok(Prediction {
        deflection: tensor_values(output.get(Partial::U)?)?,
        mx: tensor_values(mx)?,
        my: tensor_values(my)?,
        points: batch.points().to_vec(),
    })
}

/// 板全体を `n x n` の格子で評価します。
pub fn predict_grid<B: Backend>(
    model: &Surrogate<B>,
    plate: &Plate,
    n: usize,
    load: Option<f32>,
    device: &B::Device,
) -> Result<Prediction> {
    if n < 2 {
        return Err(PinnError::Config(format!(
            "格子点の数は2以上である必要があります (値: {n})"
        )));
    }
    let mut points = Vec::with_capacity(n * n);
    for j in 0..n {
        let y = plate.height() * j as f32 / (n - 1) as f32;
        for i in 0..n {
            let x = plate.width() * i as f32 / (n - 1) as f32;
            points.push(CollocationPoint::new(x, y, load, PointKind::Interior));
        }
    }
    predict(model, plate, points, device)
}

/// `infer`サブコマンドを実行します。
pub fn run(args: &InferArgs) -> Result<()> {
    let device = Default::default();
    log::info!("推論を実行します - バックエンド: NdArray (CPU)");
    let inference_start = Instant::now();

    let (plate, model) = load_artifacts::<MyBackend>(&args.artifacts, &device)?;
    let load = match plate.load_model() {
        LoadModel::Fixed(_) => {
            if args.load.is_some() {
                log::warn!("固定荷重モデルのため --load は無視されます");
            }
            None
        }
        LoadModel::Variable { min, max } => {
            let load = args.load.unwrap_or(0.5 * (min + max));
            if !(min..=max).contains(&load) {
                log::warn!("荷重 {load} は学習範囲 [{min}, {max}] の外側です");
            }
            Some(load)
        }
    };

    let grid = predict_grid(&model, &plate, args.grid, load, &device)?;
    let landmarks = vec![
        CollocationPoint::new(0.5 * plate.width(), 0.5 * plate.height(), load, PointKind::Interior),
        CollocationPoint::new(0.0, 0.0, load, PointKind::Interior),
    ];
    let summary = predict(&model, &plate, landmarks, &device)?;
    let inference_duration = inference_start.elapsed();

    log::info!(
        "推論が完了しました。入力グリッド数: {}x{}={}",
        args.grid,
        args.grid,
        grid.deflection.len()
    );
    log::info!("=> 推論時間: {:.2?}", inference_duration);
    log::info!(
        "中央のたわみ: {:.6e}, 曲げモーメント (mx, my): ({:.6e}, {:.6e})",
        summary.deflection[0],
        summary.mx[0],
        summary.my[0]
    );
    log::info!("角点のたわみ: {:.6e}", summary.deflection[1]);

    let sensor_points = plate
        .measurements()
        .iter()
        .map(|m| CollocationPoint::new(m.x, m.y, if load.is_some() { m.load } else { None }, PointKind::Interior))
        .collect();
    let sensors = predict(&model, &plate, sensor_points, &device)?;
    for (m, w) in plate.measurements().iter().zip(&sensors.deflection) {
        log::info!(
            "計測点 ({}, {}): 計測値 {:.6e}, 予測値 {:.6e}",
            m.x,
            m.y,
            m.deflection,
            w
        );
    }

    let reference: Option<Vec<f32>> = grid
        .points
        .iter()
        .map(|p| plate.reference_deflection(p.x, p.y, p.load))
        .collect();
    if let Some(errors) = reference.and_then(|r| ErrorMetrics::compute(&grid.deflection, &r)) {
        log::info!(
            "Navier解との比較: 相対L2誤差 {:.4}, 最大絶対誤差 {:.6e}, 平均絶対誤差 {:.6e}",
            errors.relative_l2,
            errors.max_abs,
            errors.mean_abs
        );
    }

    let plot_path = args.artifacts.join(DEFLECTION_PLOT_FILENAME);
    plot_deflection(&grid, &plate, args.grid, &plot_path).map_err(|e| PinnError::Plot(e.to_string()))?;
    log::info!("=> たわみ分布を '{}' に保存しました。", plot_path.display());

    Ok(())
}

/// 格子上のたわみをカラーマップとしてPNGファイルに出力します。
fn plot_deflection(
    grid: &Prediction,
    plate: &Plate,
    n: usize,
    path: &Path,
) -> std::result::Result<(), Box<dyn std::error::Error>> {
    let root = BitMapBackend::new(path, (700, 600)).into_drawing_area();
    root.fill(&WHITE)?;
    let mut chart = ChartBuilder::on(&root)
        .caption("Deflection", ("sans-serif", 40).into_font())
        .margin(10)
        .x_label_area_size(40)
        .y_label_area_size(50)
        .build_cartesian_2d(0f32..plate.width(), 0f32..plate.height())?;
    chart
        .configure_mesh()
        .disable_mesh()
        .x_desc("x")
        .y_desc("y")
        .draw()?;

    let (lo, hi) = grid
        .deflection
        .iter()
        .fold((f32::INFINITY, f32::NEG_INFINITY), |(lo, hi), w| (lo.min(*w), hi.max(*w)));
    let span = (hi - lo).max(f32::MIN_POSITIVE);
    let dx = plate.width() / (n - 1) as f32;
    let dy = plate.height() / (n - 1) as f32;

    chart.draw_series(grid.points.iter().zip(&grid.deflection).map(|(p, w)| {
        let t = ((w - lo) / span) as f64;
        let color = HSLColor(240.0 / 360.0 * (1.0 - t), 0.8, 0.5);
        Rectangle::new(
            [
                (p.x - 0.5 * dx, p.y - 0.5 * dy),
                (p.x + 0.5 * dx, p.y + 0.5 * dy),
            ],
            color.filled(),
        )
    }))?;
    root.present()?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::SurrogateConfig;
    use crate::plate::LoadConfig;
    use crate::sensors::Measurement;

    #[test]
    fn grid_covers_plate_in_row_major_order() {
        let device = Default::default();
        let plate = Plate::new(&PlateConfig::new(), vec![Measurement::new(2.0, 2.0, 0.0)]).unwrap();
        let model = SurrogateConfig::new(2).init::<MyBackend>(&device);

        let grid = predict_grid(&model, &plate, 5, None, &device).unwrap();

        assert_eq!(grid.deflection.len(), 25);
        assert_eq!(grid.mx.len(), 25);
        assert_eq!((grid.points[0].x, grid.points[0].y), (0.0, 0.0));
        assert_eq!((grid.points[4].x, grid.points[4].y), (4.0, 0.0));
        assert_eq!((grid.points[24].x, grid.points[24].y), (4.0, 4.0));
        assert!(predict_grid(&model, &plate, 1, None, &device).is_err());
    }

    #[test]
    fn variable_load_grid_needs_load() {
        let device = Default::default();
        let config = PlateConfig::new().with_load(LoadConfig::Variable { min: 0.0, max: 0.02 });
        let plate = Plate::new(&config, vec![Measurement::new(2.0, 2.0, 0.0).with_load(0.01)]).unwrap();
        let model = SurrogateConfig::new(3).init::<MyBackend>(&device);

        assert!(predict_grid(&model, &plate, 3, None, &device).is_err());
        let grid = predict_grid(&model, &plate, 3, Some(0.01), &device).unwrap();
        assert_eq!(grid.deflection.len(), 9);
    }

    #[test]
    fn missing_model_is_reported() {
        let device = Default::default();
        let err = load_artifacts::<MyBackend>(Path::new("no/such/artifacts"), &device).unwrap_err();
        assert!(matches!(err, PinnError::ModelNotFound(_)));
    }
}
