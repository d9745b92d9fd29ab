use crate::derivatives::Jet;
use burn::config::Config;
use burn::module::Module;
use burn::nn::{Initializer, Linear, LinearConfig, Tanh};
use burn::prelude::Backend;
use burn::tensor::Tensor;

/// サロゲートネットワークの構成
#[derive(Config, Debug)]
pub struct SurrogateConfig {
    /// 入力次元（x, y と、可変荷重なら荷重の大きさ）
    pub input_dim: usize,
    /// 隠れ層のユニット数
    #[config(default = 20)]
    pub hidden_size: usize,
    /// 全結合層の数（出力層を含む）
    #[config(default = 4)]
    pub num_layers: usize,
    /// 入力の各列に掛ける係数。空なら入力をそのまま使います。
    #[config(default = "Vec::new()")]
    pub input_scale: Vec<f32>,
    /// ネットワーク出力に掛ける代表たわみ
    #[config(default = 1.0)]
    pub output_scale: f32,
}

impl SurrogateConfig {
    /// 新しいモデルを初期化します。
    ///
    /// tanhのような飽和型の活性化関数に合わせて、重みはXavier正規分布で初期化します。
    pub fn init<B: Backend>(&self, device: &B::Device) -> Surrogate<B> {
        let linear = |d_input: usize, d_output: usize| {
            LinearConfig::new(d_input, d_output)
                .with_initializer(Initializer::XavierNormal { gain: 1.0 })
                .init::<B>(device)
        };
        let mut linears = Vec::new();
        linears.push(linear(self.input_dim, self.hidden_size));
        for _ in 1..self.num_layers.saturating_sub(1) {
            linears.push(linear(self.hidden_size, self.hidden_size));
        }
        linears.push(linear(self.hidden_size, 1));
        Surrogate {
            linears,
            activation: Tanh::new(),
            input_scale: self.input_scale.clone(),
            output_scale: self.output_scale,
        }
    }
}

/// 平板のたわみを近似するニューラルネットワーク。
///
/// 座標(x, y)（可変荷重の場合は荷重の大きさpも）を入力とし、
/// その点におけるたわみuを予測する多層パーセプトロン（MLP）です。
/// 入力は `input_scale` で無次元化し、出力は `output_scale` 倍して返します。
#[derive(Module, Debug)]
pub struct Surrogate<B: Backend> {
    linears: Vec<Linear<B>>,
    activation: Tanh,
    input_scale: Vec<f32>,
    output_scale: f32,
}

impl<B: Backend> Surrogate<B> {
    /// 入力次元
    pub fn input_dim(&self) -> usize {
        self.linears
            .first()
            .map(|linear| linear.weight.val().dims()[0])
            .unwrap_or(0)
    }

    /// 入力の列ごとの係数 `[1, input_dim]`
    fn input_row(&self, device: &B::Device) -> Option<Tensor<B, 2>> {
        if self.input_scale.is_empty() {
            return None;
        }
        let d = self.input_scale.len();
        Some(Tensor::<B, 1>::from_floats(self.input_scale.as_slice(), device).reshape([1, d]))
    }

    /// モデルの順伝播を実行します。
    pub fn forward(&self, input: Tensor<B, 2>) -> Tensor<B, 2> {
        let last = self.linears.len().saturating_sub(1);
        let mut x = match self.input_row(&input.device()) {
            Some(row) => input * row,
            None => input,
        };
        for (i, linear) in self.linears.iter().enumerate() {
            x = linear.forward(x);
            if i < last {
                x = self.activation.forward(x);
            }
        }
        x.mul_scalar(self.output_scale)
    }

    /// 入力に関する偏微分を伴って順伝播します。
    ///
    /// 各層で値と偏微分を同時に更新するため、出力のジェットには
    /// 入力ジェットで指定した次数までの偏微分が入ります。
    pub fn forward_jet(&self, jet: Jet<B>) -> Jet<B> {
        let last = self.linears.len().saturating_sub(1);
        let mut jet = match self.input_row(&jet.device()) {
            Some(row) => jet.scale_inputs(row),
            None => jet,
        };
        for (i, linear) in self.linears.iter().enumerate() {
            jet = jet.linear(linear);
            if i < last {
                jet = jet.tanh();
            }
        }
        jet.mul_scalar(self.output_scale)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use burn::backend::NdArray;

    type TestBackend = NdArray<f32>;

    #[test]
    fn builds_requested_depth() {
        let device = Default::default();
        let model = SurrogateConfig::new(3)
            .with_hidden_size(8)
            .with_num_layers(5)
            .init::<TestBackend>(&device);

        assert_eq!(model.linears.len(), 5);
        assert_eq!(model.input_dim(), 3);
        let out = model.forward(Tensor::zeros([7, 3], &device));
        assert_eq!(out.dims(), [7, 1]);
    }

    #[test]
    fn scales_inputs_and_output() {
        let device = Default::default();
        let scaled = SurrogateConfig::new(2)
            .with_hidden_size(8)
            .with_input_scale(vec![0.5, 0.25])
            .with_output_scale(2.0)
            .init::<TestBackend>(&device);
        let plain = Surrogate {
            linears: scaled.linears.clone(),
            activation: Tanh::new(),
            input_scale: Vec::new(),
            output_scale: 1.0,
        };

        let x = Tensor::<TestBackend, 2>::from_floats([[2.0, 4.0], [-1.0, 0.8]], &device);
        let x_scaled = Tensor::<TestBackend, 2>::from_floats([[1.0, 1.0], [-0.5, 0.2]], &device);
        let a = scaled.forward(x).into_data().to_vec::<f32>().unwrap();
        let b = plain.forward(x_scaled).into_data().to_vec::<f32>().unwrap();
        for (a, b) in a.iter().zip(&b) {
            assert!((a - 2.0 * b).abs() < 1e-6, "{a} vs {}", 2.0 * b);
        }
    }
}
