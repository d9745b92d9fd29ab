use crate::batch::CollocationBatch;
use crate::derivatives::extract;
use crate::error::{PinnError, Result};
use crate::loss::{LossOutput, LossWeights};
use crate::model::{Surrogate, SurrogateConfig};
use crate::plate::Plate;
use burn::module::Module;
use burn::prelude::Backend;

/// サロゲートと損失の重みをまとめた学習対象。
///
/// 重みはネットワークのパラメータと同じ損失から同時に更新されます。
#[derive(Module, Debug)]
pub struct PlatePinn<B: Backend> {
    surrogate: Surrogate<B>,
    weights: LossWeights<B>,
}

impl<B: Backend> PlatePinn<B> {
    /// 板のレイアウトに合わせてサロゲートと重みを初期化します。
    pub fn new(config: &SurrogateConfig, plate: &Plate, device: &B::Device) -> Result<Self> {
        if config.input_dim != plate.input_dim() {
            return Err(PinnError::Config(format!(
                "サロゲートの入力次元 {} は板の入力次元 {} と一致しません",
                config.input_dim,
                plate.input_dim()
            )));
        }
        if !config.input_scale.is_empty() && config.input_scale.len() != config.input_dim {
            return Err(PinnError::Config(format!(
                "入力の尺度の数 {} は入力次元 {} と一致しません",
                config.input_scale.len(),
                config.input_dim
            )));
        }
        Ok(Self {
            surrogate: config.init(device),
            weights: LossWeights::new(plate.active_terms().len(), device),
        })
    }

    pub fn surrogate(&self) -> &Surrogate<B> {
        &self.surrogate
    }

    pub fn weights(&self) -> &LossWeights<B> {
        &self.weights
    }

    pub fn into_surrogate(self) -> Surrogate<B> {
        self.surrogate
    }

    /// サロゲートと重みを別々のオプティマイザで更新するために分解します。
    pub fn into_parts(self) -> (Surrogate<B>, LossWeights<B>) {
        (self.surrogate, self.weights)
    }

    pub fn from_parts(surrogate: Surrogate<B>, weights: LossWeights<B>) -> Self {
        Self { surrogate, weights }
    }

    /// バッチに対する損失を評価します。重みは変更しません。
    pub fn loss(&self, plate: &Plate, batch: &CollocationBatch) -> Result<LossOutput<B>> {
        let device = self.weights.device();
        let inputs = batch.inputs::<B>(plate.input_dim(), &device)?;
        let output = extract(&self.surrogate, inputs, plate.layout())?;
        let residuals = plate.compute_residuals(batch, &output)?;
        if residuals.terms().len() != self.weights.len() {
            return Err(PinnError::Config(format!(
                "残差項の数 {} と重みの数 {} が一致しません",
                residuals.terms().len(),
                self.weights.len()
            )));
        }
        Ok(self.weights.evaluate(&residuals))
    }

    /// オプティマイザの更新後に、損失の重みを [0, 1] に収めて再正規化します。
    pub fn adapt_weights(self) -> Self {
        Self {
            surrogate: self.surrogate,
            weights: self.weights.project(),
        }
    }
}
