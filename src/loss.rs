//! # 適応的な重み付き損失
//!
//! 残差項ごとに学習可能な非負の重みを持ち、損失は「正規化した重み」と
//! 「各残差のバッチ平均」の内積になります。
//!
//! 損失の評価は重みを読むだけです。[0, 1] へのクリップと再正規化は
//! 学習ループがオプティマイザの更新後に [`LossWeights::project`] で明示的に行います。

use crate::error::Result;
use crate::metrics::{LossReport, tensor_values};
use crate::residual::{ResidualTerm, Residuals};
use burn::module::{Module, Param};
use burn::prelude::Backend;
use burn::tensor::Tensor;

/// 0除算を避けるための下限
pub const WEIGHT_EPSILON: f32 = 1e-12;

/// 残差項ごとの学習可能な重み
#[derive(Module, Debug)]
pub struct LossWeights<B: Backend> {
    weights: Param<Tensor<B, 1>>,
}

impl<B: Backend> LossWeights<B> {
    /// `count` 個の重みを等しい値 `1 / count` で初期化します。
    pub fn new(count: usize, device: &B::Device) -> Self {
        let count = count.max(1);
        let weights = Tensor::<B, 1>::ones([count], device).div_scalar(count as f32);
        Self {
            weights: Param::from_tensor(weights),
        }
    }

    pub fn len(&self) -> usize {
        self.weights.val().dims()[0]
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn device(&self) -> B::Device {
        self.weights.val().device()
    }

    /// 現在の生の重み
    pub fn raw(&self) -> Tensor<B, 1> {
        self.weights.val()
    }

    /// 和が1になるように正規化した重み。重み自体は変更しません。
    pub fn normalized(&self) -> Tensor<B, 1> {
        let w = self.weights.val();
        let total = w.clone().sum().clamp_min(WEIGHT_EPSILON);
        w / total
    }

    /// 重みを [0, 1] にクリップし、和が1になるよう再正規化します。
    ///
    /// オプティマイザの更新ごとに1回だけ呼び出します。
    pub fn project(self) -> Self {
        let weights = self.weights.map(|w| {
            let w = w.clamp(0.0, 1.0);
            let total = w.clone().sum().clamp_min(WEIGHT_EPSILON);
            (w / total).detach().require_grad()
        });
        Self { weights }
    }

    /// 残差から損失を計算します。
    pub fn evaluate(&self, residuals: &Residuals<B>) -> LossOutput<B> {
        let terms: Vec<ResidualTerm> = residuals.terms().iter().map(|(t, _)| *t).collect();
        let means = Tensor::cat(
            residuals
                .terms()
                .iter()
                .map(|(_, r)| r.clone().mean())
                .collect::<Vec<_>>(),
            0,
        );
        let weights = self.normalized();
        let total = (weights.clone() * means.clone()).sum();
        LossOutput {
            terms,
            total,
            term_means: means,
            weights,
        }
    }
}

/// 1回の損失評価の結果
#[derive(Debug)]
pub struct LossOutput<B: Backend> {
    pub terms: Vec<ResidualTerm>,
    /// 最小化するスカラー損失 `[1]`
    pub total: Tensor<B, 1>,
    /// 各残差項のバッチ平均 `[k]`
    pub term_means: Tensor<B, 1>,
    /// 正規化された重み `[k]`
    pub weights: Tensor<B, 1>,
}

impl<B: Backend> LossOutput<B> {
    /// ログ出力用に値を取り出します。
    pub fn report(&self) -> Result<LossReport> {
        let total = tensor_values(self.total.clone())?;
        let means = tensor_values(self.term_means.clone())?;
        let weights = tensor_values(self.weights.clone())?;
        Ok(LossReport::new(
            total.first().copied().unwrap_or(f32::NAN),
            self.terms.iter().copied().zip(means).collect(),
            self.terms.iter().copied().zip(weights).collect(),
        ))
    }
}
