//! # 物理情報ニューラルネットワーク (PINN) ライブラリ
//!
//! `burn` フレームワークを使用して、単純支持された薄肉平板（Kirchhoff-Love板）の
//! たわみと曲げモーメントを、支配方程式・境界条件・少数のセンサー計測値から
//! 学習するための主要なコンポーネントを提供します。

pub mod batch;
pub mod cli;
pub mod derivatives;
pub mod error;
pub mod inference;
pub mod loss;
pub mod metrics;
pub mod model;
pub mod moments;
pub mod pinn;
pub mod plate;
pub mod residual;
pub mod schedule;
pub mod sensors;
pub mod training;

/// 成果物を保存する既定のディレクトリ
pub const ARTIFACT_DIR: &str = "artifacts";
/// モデルを保存するファイル名
pub const MODEL_FILENAME: &str = "model.mpk";
/// 学習設定のファイル名
pub const CONFIG_FILENAME: &str = "config.json";
/// 平板設定のファイル名
pub const PLATE_FILENAME: &str = "plate.json";
/// 学習に使ったセンサー計測値のファイル名
pub const SENSORS_FILENAME: &str = "sensors.json";
/// エポックごとの学習記録のファイル名
pub const HISTORY_FILENAME: &str = "history.json";
/// 損失グラフのファイル名
pub const LOSS_GRAPH_FILENAME: &str = "loss_graph.png";
/// たわみ分布図のファイル名
pub const DEFLECTION_PLOT_FILENAME: &str = "deflection.png";
