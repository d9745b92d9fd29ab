//! # 平板モデル
//!
//! 単純支持された薄肉弾性平板（Kirchhoff-Love板）の物理定数、荷重、
//! センサー計測値をまとめて保持します。構築後は不変です。

use crate::batch::{CollocationBatch, CollocationPoint, Edge, PointKind};
use crate::derivatives::OutputLayout;
use crate::error::{self, PinnError};
use crate::residual::ResidualTerm;
use crate::sensors::Measurement;
use burn::config::Config;
use rand::Rng;
use std::f64::consts::PI;

/// 境界判定に用いる絶対許容誤差
pub const BOUNDARY_TOLERANCE: f32 = 1e-7;

/// 固定荷重モデルで計測値の荷重を板の荷重と比較するときの相対許容誤差
const LOAD_TOLERANCE: f32 = 1e-6;

/// Navier級数で足し合わせる最大の調和次数（奇数のみ使用）
const NAVIER_MAX_HARMONIC: usize = 49;

/// 平板の物理定数と荷重の設定
#[derive(Config, Debug)]
pub struct PlateConfig {
    /// 板厚
    #[config(default = 0.2)]
    pub thickness: f32,
    /// ヤング率
    #[config(default = 31724.0)]
    pub youngs_modulus: f32,
    /// ポアソン比
    #[config(default = 0.2)]
    pub poisson_ratio: f32,
    /// x方向の寸法
    #[config(default = 4.0)]
    pub width: f32,
    /// y方向の寸法
    #[config(default = 4.0)]
    pub height: f32,
    #[config(default = "LoadConfig::Uniform { magnitude: 0.00948 }")]
    pub load: LoadConfig,
    #[config(default = "CornerPolicy::Sum")]
    pub corner_policy: CornerPolicy,
}

/// 荷重の与え方
#[derive(Config, Debug, PartialEq)]
pub enum LoadConfig {
    /// 一様分布荷重
    Uniform { magnitude: f32 },
    /// `amplitude * sin(πx/W) * sin(πy/H)` の正弦分布荷重
    Sinusoidal { amplitude: f32 },
    /// 荷重の大きさをモデル入力として扱う（一様分布、範囲 `[min, max]`）
    Variable { min: f32, max: f32 },
}

/// 角点（2辺に同時に乗る点）の境界指示値の扱い
#[derive(Config, Debug, PartialEq)]
pub enum CornerPolicy {
    /// 4つの辺判定の和。角点は2になる。
    Sum,
    /// 4つの辺判定の論理和。角点も1になる。
    Clamp,
}

/// 位置の関数として与えられる固定荷重
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum LoadFunction {
    Uniform(f32),
    Sinusoidal(f32),
}

impl LoadFunction {
    /// 一様荷重の大きさ、または正弦分布荷重の振幅
    pub fn magnitude(&self) -> f32 {
        match self {
            LoadFunction::Uniform(q) | LoadFunction::Sinusoidal(q) => *q,
        }
    }
}

/// 荷重の扱い方（固定荷重か、荷重の大きさを入力とするか）
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum LoadModel {
    Fixed(LoadFunction),
    Variable { min: f32, max: f32 },
}

/// 単純支持された矩形平板
#[derive(Debug, Clone)]
pub struct Plate {
    thickness: f32,
    youngs_modulus: f32,
    poisson_ratio: f32,
    width: f32,
    height: f32,
    flexural_rigidity: f32,
    load: LoadModel,
    corner_policy: CornerPolicy,
    measurements: Vec<Measurement>,
}

impl Plate {
    /// 設定とセンサー計測値から平板を構築します。
    ///
    /// 物理定数が不正な場合や計測値が空の場合は、学習開始前にエラーを返します。
    pub fn new(config: &PlateConfig, measurements: Vec<Measurement>) -> error::Result<Self> {
        for (name, value) in [
            ("thickness", config.thickness),
            ("youngs_modulus", config.youngs_modulus),
            ("width", config.width),
            ("height", config.height),
        ] {
            if !(value.is_finite() && value > 0.0) {
                return Err(PinnError::Config(format!(
                    "{name} は正の有限値である必要があります (値: {value})"
                )));
            }
        }
        let nu = config.poisson_ratio;
        if !(nu > -1.0 && nu < 0.5) {
            return Err(PinnError::Config(format!(
                "poisson_ratio は (-1, 0.5) の範囲である必要があります (値: {nu})"
            )));
        }

        let load = match config.load {
            LoadConfig::Uniform { magnitude } => LoadModel::Fixed(LoadFunction::Uniform(magnitude)),
            LoadConfig::Sinusoidal { amplitude } => {
                LoadModel::Fixed(LoadFunction::Sinusoidal(amplitude))
            }
            LoadConfig::Variable { min, max } => {
                if !(min.is_finite() && max.is_finite() && min < max) {
                    return Err(PinnError::Config(format!(
                        "荷重範囲は min < max である必要があります (min: {min}, max: {max})"
                    )));
                }
                LoadModel::Variable { min, max }
            }
        };

        if measurements.is_empty() {
            return Err(PinnError::MissingMeasurements);
        }
        for (i, m) in measurements.iter().enumerate() {
            let inside = (0.0..=config.width).contains(&m.x) && (0.0..=config.height).contains(&m.y);
            if !inside || !m.deflection.is_finite() {
                return Err(PinnError::Config(format!(
                    "計測点 {i} ({}, {}) が板の範囲外か、たわみが有限値ではありません",
                    m.x, m.y
                )));
            }
            match (load, m.load) {
                (LoadModel::Variable { .. }, None) => {
                    return Err(PinnError::Config(format!(
                        "可変荷重モデルでは計測点 {i} に荷重 (load) が必要です"
                    )));
                }
                (LoadModel::Fixed(function), Some(measured)) => {
                    let configured = function.magnitude();
                    let tolerance = LOAD_TOLERANCE * configured.abs().max(measured.abs());
                    if (measured - configured).abs() > tolerance {
                        return Err(PinnError::Config(format!(
                            "計測点 {i} の荷重 {measured} が板の荷重 {configured} と一致しません"
                        )));
                    }
                }
                _ => {}
            }
        }

        let t = config.thickness;
        let flexural_rigidity = config.youngs_modulus * t.powi(3) / (12.0 * (1.0 - nu * nu));

        Ok(Self {
            thickness: t,
            youngs_modulus: config.youngs_modulus,
            poisson_ratio: nu,
            width: config.width,
            height: config.height,
            flexural_rigidity,
            load,
            corner_policy: config.corner_policy.clone(),
            measurements,
        })
    }

    pub fn thickness(&self) -> f32 {
        self.thickness
    }

    pub fn youngs_modulus(&self) -> f32 {
        self.youngs_modulus
    }

    pub fn poisson_ratio(&self) -> f32 {
        self.poisson_ratio
    }

    pub fn width(&self) -> f32 {
        self.width
    }

    pub fn height(&self) -> f32 {
        self.height
    }

    /// 曲げ剛性 `D = E·T³ / (12·(1−ν²))`
    pub fn flexural_rigidity(&self) -> f32 {
        self.flexural_rigidity
    }

    /// 代表たわみ `q / (π⁴·D·(1/W² + 1/H²)²)`。
    ///
    /// 正弦分布荷重に対する最大たわみで、サロゲート出力の尺度に使います。
    /// 可変荷重モデルでは荷重範囲の絶対値の大きい方を `q` とします。
    pub fn characteristic_deflection(&self) -> f32 {
        let q = self.reference_load();
        if q == 0.0 {
            return 1.0;
        }
        let k = 1.0 / (self.width * self.width) + 1.0 / (self.height * self.height);
        q / (std::f32::consts::PI.powi(4) * self.flexural_rigidity * k * k)
    }

    /// サロゲート入力に掛ける係数。座標は板の寸法で、荷重は代表荷重で割ります。
    pub fn input_scales(&self) -> Vec<f32> {
        let mut scales = vec![1.0 / self.width, 1.0 / self.height];
        if self.is_variable_load() {
            let q = self.reference_load();
            scales.push(if q == 0.0 { 1.0 } else { 1.0 / q });
        }
        scales
    }

    /// 二乗残差の代表値 `(q/D)²`。学習時に目的関数をこの値で割って無次元化します。
    pub fn residual_scale(&self) -> f32 {
        let q = self.reference_load();
        if q == 0.0 {
            return 1.0;
        }
        (q / self.flexural_rigidity).powi(2)
    }

    fn reference_load(&self) -> f32 {
        match self.load {
            LoadModel::Fixed(function) => function.magnitude().abs(),
            LoadModel::Variable { min, max } => min.abs().max(max.abs()),
        }
    }

    pub fn load_model(&self) -> LoadModel {
        self.load
    }

    pub fn measurements(&self) -> &[Measurement] {
        &self.measurements
    }

    pub fn is_variable_load(&self) -> bool {
        matches!(self.load, LoadModel::Variable { .. })
    }

    /// サロゲートの出力レイアウト
    pub fn layout(&self) -> OutputLayout {
        match self.load {
            LoadModel::Fixed(_) => OutputLayout::FixedLoad,
            LoadModel::Variable { .. } => OutputLayout::VariableLoad,
        }
    }

    /// サロゲートの入力次元（x, y と、可変荷重なら荷重の大きさ）
    pub fn input_dim(&self) -> usize {
        self.layout().input_dim()
    }

    /// 学習で有効な残差項。損失の重みはこの順に並びます。
    pub fn active_terms(&self) -> Vec<ResidualTerm> {
        match self.load {
            LoadModel::Fixed(_) => vec![
                ResidualTerm::Governing,
                ResidualTerm::Deflection,
                ResidualTerm::Moment,
                ResidualTerm::Data,
            ],
            LoadModel::Variable { .. } => vec![
                ResidualTerm::Deflection,
                ResidualTerm::Moment,
                ResidualTerm::Data,
                ResidualTerm::LoadConsistency,
            ],
        }
    }

    /// 固定荷重 `q(x, y)` を返します。可変荷重モデルでは `None` です。
    pub fn load_at(&self, x: f32, y: f32) -> Option<f32> {
        match self.load {
            LoadModel::Fixed(LoadFunction::Uniform(q)) => Some(q),
            LoadModel::Fixed(LoadFunction::Sinusoidal(q0)) => {
                let sx = (std::f32::consts::PI * x / self.width).sin();
                let sy = (std::f32::consts::PI * y / self.height).sin();
                Some(q0 * sx * sy)
            }
            LoadModel::Variable { .. } => None,
        }
    }

    /// 境界指示値。4辺それぞれの 0/1 判定を `corner_policy` に従って合成します。
    pub fn boundary_indicator(&self, x: f32, y: f32) -> f32 {
        let on_edge = |value: f32, target: f32| (value - target).abs() <= BOUNDARY_TOLERANCE;
        let hits = [
            on_edge(x, 0.0),
            on_edge(x, self.width),
            on_edge(y, 0.0),
            on_edge(y, self.height),
        ]
        .iter()
        .filter(|hit| **hit)
        .count();

        match self.corner_policy {
            CornerPolicy::Sum => hits as f32,
            CornerPolicy::Clamp => hits.min(1) as f32,
        }
    }

    /// コロケーション点のバッチを生成します。
    ///
    /// 並び順は 内部点 → x=0 辺 → x=W 辺 → y=0 辺 → y=H 辺 → 計測点 です。
    /// 計測点は常に末尾に同じ順序で追加されます。
    pub fn sample_batch<R: Rng + ?Sized>(
        &self,
        rng: &mut R,
        domain_count: usize,
        boundary_count: usize,
    ) -> CollocationBatch {
        let mut points =
            Vec::with_capacity(domain_count + 4 * boundary_count + self.measurements.len());

        for _ in 0..domain_count {
            let x = rng.random_range(0.0..=self.width);
            let y = rng.random_range(0.0..=self.height);
            let load = self.sample_load(rng);
            points.push(CollocationPoint::new(x, y, load, PointKind::Interior));
        }

        for edge in Edge::ALL {
            for _ in 0..boundary_count {
                let (x, y) = match edge {
                    Edge::Left => (0.0, rng.random_range(0.0..=self.height)),
                    Edge::Right => (self.width, rng.random_range(0.0..=self.height)),
                    Edge::Bottom => (rng.random_range(0.0..=self.width), 0.0),
                    Edge::Top => (rng.random_range(0.0..=self.width), self.height),
                };
                let load = self.sample_load(rng);
                points.push(CollocationPoint::new(x, y, load, PointKind::Edge(edge)));
            }
        }

        let variable = self.is_variable_load();
        for (i, m) in self.measurements.iter().enumerate() {
            let load = if variable { m.load } else { None };
            points.push(CollocationPoint::new(m.x, m.y, load, PointKind::Measurement(i)));
        }

        CollocationBatch::new(points)
    }

    fn sample_load<R: Rng + ?Sized>(&self, rng: &mut R) -> Option<f32> {
        match self.load {
            LoadModel::Fixed(_) => None,
            LoadModel::Variable { min, max } => Some(rng.random_range(min..=max)),
        }
    }

    /// 単純支持矩形板のNavier解によるたわみ。
    ///
    /// 可変荷重モデルでは `load` を一様荷重の大きさとして用います。
    /// 参照解を持たない場合は `None` を返します。
    pub fn reference_deflection(&self, x: f32, y: f32, load: Option<f32>) -> Option<f32> {
        let (a, b) = (self.width as f64, self.height as f64);
        let d = self.flexural_rigidity as f64;
        let (x, y) = (x as f64, y as f64);

        let uniform = |q: f64| {
            let mut sum = 0.0;
            for m in (1..=NAVIER_MAX_HARMONIC).step_by(2) {
                let mf = m as f64;
                let sx = (mf * PI * x / a).sin();
                for n in (1..=NAVIER_MAX_HARMONIC).step_by(2) {
                    let nf = n as f64;
                    let sy = (nf * PI * y / b).sin();
                    let k = (mf / a).powi(2) + (nf / b).powi(2);
                    sum += sx * sy / (mf * nf * k * k);
                }
            }
            16.0 * q / (PI.powi(6) * d) * sum
        };

        let w = match self.load {
            LoadModel::Fixed(LoadFunction::Uniform(q)) => uniform(q as f64),
            LoadModel::Fixed(LoadFunction::Sinusoidal(q0)) => {
                let k = 1.0 / (a * a) + 1.0 / (b * b);
                q0 as f64 / (PI.powi(4) * d * k * k) * (PI * x / a).sin() * (PI * y / b).sin()
            }
            LoadModel::Variable { .. } => uniform(load? as f64),
        };
        Some(w as f32)
    }
}
