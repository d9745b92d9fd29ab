//! # 残差の組み立て
//!
//! サロゲートの出力から、支配方程式・境界条件・計測値に対する点ごとの二乗残差を作ります。
//! どの残差もバッチの点数と同じ長さ `[n, 1]` で、対象外の点は0になります。

use crate::batch::{CollocationBatch, PointKind};
use crate::derivatives::{Partial, SurrogateOutput};
use crate::error::{PinnError, Result};
use crate::moments::bending_moments;
use crate::plate::Plate;
use burn::prelude::Backend;
use burn::tensor::Tensor;

/// 残差項の種類
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum ResidualTerm {
    /// 支配方程式 `∇⁴u − q/D`
    Governing,
    /// 境界でのたわみ0
    Deflection,
    /// 境界での曲げモーメント0
    Moment,
    /// 計測値との差
    Data,
    /// 荷重の大きさに関する線形性 `u_pp = 0`
    LoadConsistency,
}

impl ResidualTerm {
    pub fn name(&self) -> &'static str {
        match self {
            ResidualTerm::Governing => "L_f",
            ResidualTerm::Deflection => "L_w",
            ResidualTerm::Moment => "L_m",
            ResidualTerm::Data => "L_D",
            ResidualTerm::LoadConsistency => "L_p",
        }
    }
}

/// 有効な残差項ごとの点別二乗残差
#[derive(Debug)]
pub struct Residuals<B: Backend> {
    terms: Vec<(ResidualTerm, Tensor<B, 2>)>,
}

impl<B: Backend> Residuals<B> {
    pub fn terms(&self) -> &[(ResidualTerm, Tensor<B, 2>)] {
        &self.terms
    }

    pub fn get(&self, term: ResidualTerm) -> Option<&Tensor<B, 2>> {
        self.terms.iter().find(|(t, _)| *t == term).map(|(_, r)| r)
    }

    pub fn into_terms(self) -> Vec<(ResidualTerm, Tensor<B, 2>)> {
        self.terms
    }
}

impl Plate {
    /// バッチとサロゲート出力から残差を計算します。
    ///
    /// 計測点がバッチ末尾に並んでいない場合や、出力の形が合わない場合はエラーを返します。
    pub fn compute_residuals<B: Backend>(
        &self,
        batch: &CollocationBatch,
        output: &SurrogateOutput<B>,
    ) -> Result<Residuals<B>> {
        if output.layout() != self.layout() {
            return Err(PinnError::OutputLayout(format!(
                "出力レイアウト {:?} は板のレイアウト {:?} と一致しません",
                output.layout(),
                self.layout()
            )));
        }
        if output.len() != batch.len() {
            return Err(PinnError::BatchLayout(format!(
                "出力の点数 {} がバッチの点数 {} と一致しません",
                output.len(),
                batch.len()
            )));
        }
        batch.measurement_range(self.measurements().len())?;

        let device = output.packed().device();
        let d = self.flexural_rigidity();
        let u = output.get(Partial::U)?;

        let indicator = batch.column::<B>(&device, |p| self.boundary_indicator(p.x, p.y));
        let deflection = (indicator.clone() * u.clone()).powf_scalar(2.0);

        let (mx, my) = bending_moments(
            output.get(Partial::Uxx)?,
            output.get(Partial::Uyy)?,
            d,
            self.poisson_ratio(),
        );
        let moment =
            (indicator.clone() * mx).powf_scalar(2.0) + (indicator.clone() * my).powf_scalar(2.0);

        let mask = batch.column::<B>(&device, |p| match p.kind {
            PointKind::Measurement(_) => 1.0,
            _ => 0.0,
        });
        let target = batch.column::<B>(&device, |p| match p.kind {
            PointKind::Measurement(i) => self.measurements()[i].deflection,
            _ => 0.0,
        });
        let data = (mask * (u - target)).powf_scalar(2.0);

        let mut terms = Vec::with_capacity(4);
        for term in self.active_terms() {
            let residual = match term {
                ResidualTerm::Governing => {
                    let load = batch.column::<B>(&device, |p| {
                        self.load_at(p.x, p.y).unwrap_or(0.0) / d
                    });
                    let f = output.get(Partial::Uxxxx)?
                        + output.get(Partial::Uxxyy)?.mul_scalar(2.0)
                        + output.get(Partial::Uyyyy)?
                        - load;
                    f.powf_scalar(2.0)
                }
                ResidualTerm::Deflection => deflection.clone(),
                ResidualTerm::Moment => moment.clone(),
                ResidualTerm::Data => data.clone(),
                // 境界では指示値の分だけ重くします（内部1倍、辺2倍、角点3倍）
                ResidualTerm::LoadConsistency => (indicator.clone().add_scalar(1.0)
                    * output.get(Partial::Upp)?)
                .powf_scalar(2.0),
            };
            terms.push((term, residual));
        }

        Ok(Residuals { terms })
    }
}
