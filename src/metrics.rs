//! 損失・誤差の集計
//!
//! 可視化やログ出力から切り離すため、値はすべて項目名をキーとするマップで保持します。

use crate::error::{PinnError, Result};
use crate::residual::ResidualTerm;
use burn::prelude::Backend;
use burn::tensor::Tensor;
use serde::Serialize;
use std::collections::BTreeMap;

/// 寄与率の計算で損失がちょうど0のときに代わりに使う値
pub const LOSS_EPSILON: f32 = 1e-12;

/// テンソルの値を `f32` のベクトルとして取り出します。
pub fn tensor_values<B: Backend, const D: usize>(tensor: Tensor<B, D>) -> Result<Vec<f32>> {
    tensor
        .into_data()
        .convert::<f32>()
        .to_vec::<f32>()
        .map_err(|e| PinnError::Tensor(format!("{e:?}")))
}

/// 1回の損失評価の値
#[derive(Serialize, Debug, Clone, PartialEq)]
pub struct LossReport {
    pub total: f32,
    /// 残差項ごとのバッチ平均
    pub terms: BTreeMap<String, f32>,
    /// 正規化された重み
    pub weights: BTreeMap<String, f32>,
}

impl LossReport {
    pub fn new(
        total: f32,
        terms: Vec<(ResidualTerm, f32)>,
        weights: Vec<(ResidualTerm, f32)>,
    ) -> Self {
        let named = |values: Vec<(ResidualTerm, f32)>| -> BTreeMap<String, f32> {
            values
                .into_iter()
                .map(|(term, value)| (term.name().to_string(), value))
                .collect()
        };
        Self {
            total,
            terms: named(terms),
            weights: named(weights),
        }
    }

    /// NaN・Infを含まないかどうか
    pub fn is_finite(&self) -> bool {
        self.total.is_finite() && self.terms.values().all(|v| v.is_finite())
    }

    /// 各項の寄与率（%）。損失が0のときは [`LOSS_EPSILON`] で割ります。
    pub fn contributions(&self) -> BTreeMap<String, f32> {
        let denominator = self.total.abs().max(LOSS_EPSILON);
        self.terms
            .iter()
            .map(|(name, mean)| {
                let weight = self.weights.get(name).copied().unwrap_or(0.0);
                (name.clone(), 100.0 * weight * mean / denominator)
            })
            .collect()
    }

    /// 最小の重み。重みが0付近に張り付いていないかの確認に使います。
    pub fn min_weight(&self) -> f32 {
        self.weights.values().copied().fold(f32::INFINITY, f32::min)
    }

    /// 値を持たない評価結果。項目名と重みは `like` から引き継ぎ、損失はNaNにします。
    ///
    /// エポック内のすべてのステップが見送られたときの学習損失として使います。
    pub fn unavailable(like: &LossReport) -> LossReport {
        LossReport {
            total: f32::NAN,
            terms: like.terms.keys().map(|name| (name.clone(), f32::NAN)).collect(),
            weights: like.weights.clone(),
        }
    }

    /// 複数の評価結果の平均
    pub fn mean(reports: &[LossReport]) -> Option<LossReport> {
        let first = reports.first()?;
        let n = reports.len() as f32;
        let average = |select: fn(&LossReport) -> &BTreeMap<String, f32>| -> BTreeMap<String, f32> {
            select(first)
                .keys()
                .map(|name| {
                    let sum: f32 = reports
                        .iter()
                        .map(|r| select(r).get(name).copied().unwrap_or(0.0))
                        .sum();
                    (name.clone(), sum / n)
                })
                .collect()
        };
        Some(LossReport {
            total: reports.iter().map(|r| r.total).sum::<f32>() / n,
            terms: average(|r| &r.terms),
            weights: average(|r| &r.weights),
        })
    }
}

/// エポックごとの学習記録
#[derive(Serialize, Debug, Clone)]
pub struct EpochMetrics {
    pub epoch: usize,
    pub learning_rate: f64,
    /// 学習ステップの平均
    pub train: LossReport,
    /// 検証バッチでの評価
    pub validation: LossReport,
    /// 学習ステップでの各項の寄与率（%）
    pub contributions: BTreeMap<String, f32>,
    pub min_weight: f32,
    /// NaN・Infのため更新を見送ったステップ数
    pub skipped_steps: usize,
}

/// 参照解に対する誤差
#[derive(Serialize, Debug, Clone, Copy, PartialEq)]
pub struct ErrorMetrics {
    /// 相対L2誤差 `‖pred − ref‖ / ‖ref‖`
    pub relative_l2: f32,
    pub max_abs: f32,
    pub mean_abs: f32,
}

impl ErrorMetrics {
    pub fn compute(predicted: &[f32], reference: &[f32]) -> Option<Self> {
        if predicted.is_empty() || predicted.len() != reference.len() {
            return None;
        }
        let mut diff_sq = 0.0f64;
        let mut ref_sq = 0.0f64;
        let mut max_abs = 0.0f32;
        let mut sum_abs = 0.0f64;
        for (p, r) in predicted.iter().zip(reference) {
            let d = p - r;
            diff_sq += (d as f64).powi(2);
            ref_sq += (*r as f64).powi(2);
            max_abs = max_abs.max(d.abs());
            sum_abs += d.abs() as f64;
        }
        Some(Self {
            relative_l2: (diff_sq.sqrt() / ref_sq.sqrt().max(LOSS_EPSILON as f64)) as f32,
            max_abs,
            mean_abs: (sum_abs / predicted.len() as f64) as f32,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    fn report(total: f32, terms: [f32; 2], weights: [f32; 2]) -> LossReport {
        LossReport::new(
            total,
            vec![(ResidualTerm::Deflection, terms[0]), (ResidualTerm::Data, terms[1])],
            vec![(ResidualTerm::Deflection, weights[0]), (ResidualTerm::Data, weights[1])],
        )
    }

    #[test]
    fn contributions_sum_to_hundred() {
        let r = report(0.5 * 2.0 + 0.5 * 4.0, [2.0, 4.0], [0.5, 0.5]);
        let c = r.contributions();
        assert_relative_eq!(c["L_w"], 100.0 / 3.0, max_relative = 1e-5);
        assert_relative_eq!(c["L_D"], 200.0 / 3.0, max_relative = 1e-5);
    }

    #[test]
    fn zero_total_does_not_divide_by_zero() {
        let r = report(0.0, [0.0, 0.0], [0.5, 0.5]);
        let c = r.contributions();
        assert!(c.values().all(|v| *v == 0.0));
        assert!(r.is_finite());
    }

    #[test]
    fn non_finite_terms_are_flagged() {
        let r = report(f32::NAN, [f32::NAN, 1.0], [0.5, 0.5]);
        assert!(!r.is_finite());
    }

    #[test]
    fn mean_averages_every_field() {
        let a = report(1.0, [1.0, 3.0], [0.2, 0.8]);
        let b = report(3.0, [3.0, 5.0], [0.4, 0.6]);
        let m = LossReport::mean(&[a, b]).unwrap();
        assert_relative_eq!(m.total, 2.0);
        assert_relative_eq!(m.terms["L_D"], 4.0);
        assert_relative_eq!(m.weights["L_w"], 0.3, max_relative = 1e-6);
        assert_relative_eq!(m.min_weight(), 0.3, max_relative = 1e-6);
        assert!(LossReport::mean(&[]).is_none());
    }

    #[test]
    fn unavailable_report_keeps_names_but_not_values() {
        let validation = report(2.0, [1.0, 3.0], [0.2, 0.8]);
        let r = LossReport::unavailable(&validation);
        assert!(r.total.is_nan());
        assert!(!r.is_finite());
        assert_eq!(r.terms.keys().collect::<Vec<_>>(), validation.terms.keys().collect::<Vec<_>>());
        assert!(r.terms.values().all(|v| v.is_nan()));
        assert_eq!(r.weights, validation.weights);
    }

    #[test]
    fn error_metrics_against_reference() {
        let m = ErrorMetrics::compute(&[1.0, 2.0, 2.0], &[1.0, 2.0, 4.0]).unwrap();
        assert_relative_eq!(m.max_abs, 2.0);
        assert_relative_eq!(m.mean_abs, 2.0 / 3.0, max_relative = 1e-6);
        assert_relative_eq!(m.relative_l2, 2.0 / 21.0f32.sqrt(), max_relative = 1e-6);
        assert!(ErrorMetrics::compute(&[1.0], &[]).is_none());
    }
}
