use clap::{Args, Parser, Subcommand};
use std::path::PathBuf;

/// clapでコマンドラインの構造を定義します。
#[derive(Parser, Debug)]
#[command(author, version, about = "A Physics-Informed Neural Network (PINN) for Kirchhoff-Love plate bending with Burn", long_about = None)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,
}

/// 実行するサブコマンドを定義します（train または infer）。
#[derive(Subcommand, Debug)]
pub enum Commands {
    /// PINNモデルを学習し、結果をファイルに保存します
    Train(TrainArgs),
    /// 保存されたPINNモデルを使い、推論を実行します
    Infer(InferArgs),
}

#[derive(Args, Debug)]
pub struct TrainArgs {
    /// センサー計測値のJSONファイル
    #[arg(short, long, default_value = "data/sensors.json")]
    pub sensors: PathBuf,
    /// 平板設定のJSONファイル（省略時は既定の4x4板）
    #[arg(short, long)]
    pub plate: Option<PathBuf>,
    /// 学習設定のJSONファイル
    #[arg(short, long)]
    pub config: Option<PathBuf>,
    /// 成果物の保存先
    #[arg(short, long, default_value = crate::ARTIFACT_DIR)]
    pub artifacts: PathBuf,
    /// 学習エポック数（設定ファイルの値を上書き）
    #[arg(short, long)]
    pub epochs: Option<usize>,
}

#[derive(Args, Debug)]
pub struct InferArgs {
    /// 学習時の成果物ディレクトリ
    #[arg(short, long, default_value = crate::ARTIFACT_DIR)]
    pub artifacts: PathBuf,
    /// 評価グリッドの1辺あたりの点数
    #[arg(short, long, default_value_t = 50)]
    pub grid: usize,
    /// 可変荷重モデルで評価する荷重の大きさ
    #[arg(short, long)]
    pub load: Option<f32>,
}
