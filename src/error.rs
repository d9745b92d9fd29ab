//! クレート共通のエラー型

use thiserror::Error;

/// 学習・推論で発生するエラー
#[derive(Error, Debug)]
pub enum PinnError {
    #[error("設定エラー: {0}")]
    Config(String),

    #[error("センサー計測データがありません。少なくとも1点の計測値が必要です")]
    MissingMeasurements,

    #[error("バッチ構成が不正です: {0}")]
    BatchLayout(String),

    #[error("サロゲート出力の形式が不正です: {0}")]
    OutputLayout(String),

    #[error("テンソルの読み出しに失敗しました: {0}")]
    Tensor(String),

    #[error("モデルファイル '{0}' が見つかりません。最初に 'train' コマンドでモデルを学習・保存してください")]
    ModelNotFound(String),

    #[error("グラフの描画に失敗しました: {0}")]
    Plot(String),

    #[error("入出力エラー: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSONエラー: {0}")]
    Json(#[from] serde_json::Error),

    #[error("モデルの保存・読み込みに失敗しました: {0}")]
    Recorder(#[from] burn::record::RecorderError),

    #[error("設定ファイルの読み込みに失敗しました: {0}")]
    ConfigFile(#[from] burn::config::ConfigError),
}

pub type Result<T> = std::result::Result<T, PinnError>;
