//! # 導関数の抽出
//!
//! サロゲートの出力uについて、入力座標に関する高階偏微分を計算します。
//!
//! 値と偏微分の組（ジェット）を各層に通して前進方向に伝播します。
//! 全結合層は線形なので偏微分には重みだけが掛かり、tanhではFaà di Brunoの公式で
//! 4階までの合成を行います。すべて `burn` のテンソル演算なので、
//! パラメータに関する勾配は通常の逆伝播でこの計算全体を通り抜けます。

use crate::error::{PinnError, Result};
use crate::model::Surrogate;
use burn::nn::Linear;
use burn::prelude::Backend;
use burn::tensor::Tensor;

/// 伝播できる最大の微分階数
pub const MAX_ORDER: usize = 4;

/// 出力ベクトルに並ぶ量
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Partial {
    U,
    Uxx,
    Uyy,
    Uxxxx,
    Uyyyy,
    Uxxyy,
    /// 荷重の大きさに関する2階微分
    Upp,
}

/// サロゲート出力ベクトルのレイアウト
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OutputLayout {
    /// 入力 (x, y)、出力 `[u, u_xx, u_yy, u_xxxx, u_yyyy, u_xxyy]`
    FixedLoad,
    /// 入力 (x, y, p)、出力 `[u, u_xx, u_yy, u_pp]`
    VariableLoad,
}

impl OutputLayout {
    pub fn partials(&self) -> &'static [Partial] {
        match self {
            OutputLayout::FixedLoad => &[
                Partial::U,
                Partial::Uxx,
                Partial::Uyy,
                Partial::Uxxxx,
                Partial::Uyyyy,
                Partial::Uxxyy,
            ],
            OutputLayout::VariableLoad => &[Partial::U, Partial::Uxx, Partial::Uyy, Partial::Upp],
        }
    }

    pub fn width(&self) -> usize {
        self.partials().len()
    }

    pub fn input_dim(&self) -> usize {
        match self {
            OutputLayout::FixedLoad => 2,
            OutputLayout::VariableLoad => 3,
        }
    }

    pub fn index_of(&self, partial: Partial) -> Option<usize> {
        self.partials().iter().position(|p| *p == partial)
    }

    /// 入力軸ごとに必要な微分階数
    fn axis_orders(&self) -> &'static [usize] {
        match self {
            OutputLayout::FixedLoad => &[4, 4],
            OutputLayout::VariableLoad => &[2, 2, 2],
        }
    }

    fn needs_mixed(&self) -> bool {
        matches!(self, OutputLayout::FixedLoad)
    }
}

/// 各点の予測値と偏微分を `[n, width]` に詰めたもの
#[derive(Debug)]
pub struct SurrogateOutput<B: Backend> {
    layout: OutputLayout,
    packed: Tensor<B, 2>,
}

impl<B: Backend> SurrogateOutput<B> {
    pub fn new(layout: OutputLayout, packed: Tensor<B, 2>) -> Result<Self> {
        let [_, width] = packed.dims();
        if width != layout.width() {
            return Err(PinnError::OutputLayout(format!(
                "{layout:?} の列数は {} ですが、{width} 列が渡されました",
                layout.width()
            )));
        }
        Ok(Self { layout, packed })
    }

    pub fn layout(&self) -> OutputLayout {
        self.layout
    }

    /// 点の数
    pub fn len(&self) -> usize {
        self.packed.dims()[0]
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn packed(&self) -> &Tensor<B, 2> {
        &self.packed
    }

    /// 指定した量の列 `[n, 1]` を取り出します。
    pub fn get(&self, partial: Partial) -> Result<Tensor<B, 2>> {
        let index = self.layout.index_of(partial).ok_or_else(|| {
            PinnError::OutputLayout(format!("{:?} には {partial:?} が含まれません", self.layout))
        })?;
        let n = self.len();
        Ok(self.packed.clone().slice([0..n, index..index + 1]))
    }
}

/// サロゲートを評価し、レイアウトで指定された偏微分を計算します。
pub fn extract<B: Backend>(
    model: &Surrogate<B>,
    inputs: Tensor<B, 2>,
    layout: OutputLayout,
) -> Result<SurrogateOutput<B>> {
    let [_, input_dim] = inputs.dims();
    if input_dim != layout.input_dim() || model.input_dim() != input_dim {
        return Err(PinnError::OutputLayout(format!(
            "入力次元が一致しません (入力: {input_dim}, モデル: {}, {layout:?}: {})",
            model.input_dim(),
            layout.input_dim()
        )));
    }
    let jet = model.forward_jet(Jet::seed(inputs, layout.axis_orders(), layout.needs_mixed()));
    SurrogateOutput::new(layout, jet.pack(layout)?)
}

/// 値と入力に関する偏微分の組。
///
/// `axes[a][k]` は入力軸 `a` に関する `k + 1` 階の偏微分です。
pub struct Jet<B: Backend> {
    value: Tensor<B, 2>,
    axes: Vec<Vec<Tensor<B, 2>>>,
    mixed: Option<MixedPartials<B>>,
}

/// x・y軸の混合偏微分（xy, xxy, xyy, xxyy）
struct MixedPartials<B: Backend> {
    xy: Tensor<B, 2>,
    xxy: Tensor<B, 2>,
    xyy: Tensor<B, 2>,
    xxyy: Tensor<B, 2>,
}

impl<B: Backend> Jet<B> {
    /// 入力そのもののジェット。各軸の1階微分は単位ベクトル、高階は0です。
    pub(crate) fn seed(inputs: Tensor<B, 2>, orders: &[usize], mixed: bool) -> Self {
        let [n, d] = inputs.dims();
        let device = inputs.device();
        let axes = orders
            .iter()
            .enumerate()
            .map(|(axis, &order)| {
                let columns = (0..d)
                    .map(|j| {
                        if j == axis {
                            Tensor::ones([n, 1], &device)
                        } else {
                            Tensor::zeros([n, 1], &device)
                        }
                    })
                    .collect::<Vec<_>>();
                let mut derivs = vec![Tensor::cat(columns, 1)];
                for _ in 1..order.clamp(1, MAX_ORDER) {
                    derivs.push(Tensor::zeros([n, d], &device));
                }
                derivs
            })
            .collect::<Vec<_>>();

        let mixed_supported = orders.len() >= 2 && orders[0] >= 2 && orders[1] >= 2;
        let mixed = (mixed && mixed_supported).then(|| MixedPartials {
            xy: Tensor::zeros([n, d], &device),
            xxy: Tensor::zeros([n, d], &device),
            xyy: Tensor::zeros([n, d], &device),
            xxyy: Tensor::zeros([n, d], &device),
        });

        Self {
            value: inputs,
            axes,
            mixed,
        }
    }

    pub fn device(&self) -> B::Device {
        self.value.device()
    }

    /// 入力軸 `axis` に関する `order` 階の偏微分
    pub fn partial(&self, axis: usize, order: usize) -> Option<Tensor<B, 2>> {
        self.axes.get(axis)?.get(order.checked_sub(1)?).cloned()
    }

    /// 全結合層を通します。バイアスは値にのみ加わります。
    pub fn linear(self, linear: &Linear<B>) -> Self {
        let weight = linear.weight.val();
        let through = |t: Tensor<B, 2>| t.matmul(weight.clone());
        Self {
            value: linear.forward(self.value),
            axes: self
                .axes
                .into_iter()
                .map(|derivs| derivs.into_iter().map(&through).collect())
                .collect(),
            mixed: self.mixed.map(|m| MixedPartials {
                xy: through(m.xy),
                xxy: through(m.xxy),
                xyy: through(m.xyy),
                xxyy: through(m.xxyy),
            }),
        }
    }

    /// 入力の各列に係数を掛けます。`row` は `[1, input_dim]` です。
    ///
    /// 入力段で呼び出し、各軸の1階微分が係数そのものになるようにします。
    pub fn scale_inputs(self, row: Tensor<B, 2>) -> Self {
        let scale = |t: Tensor<B, 2>| t * row.clone();
        self.map(scale)
    }

    /// 値と偏微分のすべてに定数を掛けます。
    pub fn mul_scalar(self, factor: f32) -> Self {
        self.map(|t| t.mul_scalar(factor))
    }

    fn map(self, f: impl Fn(Tensor<B, 2>) -> Tensor<B, 2>) -> Self {
        Self {
            value: f(self.value),
            axes: self
                .axes
                .into_iter()
                .map(|derivs| derivs.into_iter().map(&f).collect())
                .collect(),
            mixed: self.mixed.map(|m| MixedPartials {
                xy: f(m.xy),
                xxy: f(m.xxy),
                xyy: f(m.xyy),
                xxyy: f(m.xxyy),
            }),
        }
    }

    /// tanhを通します。
    pub fn tanh(self) -> Self {
        let axis_order = self.axes.iter().map(Vec::len).max().unwrap_or(0);
        let order = if self.mixed.is_some() {
            MAX_ORDER
        } else {
            axis_order
        };
        let t = self.value.tanh();
        let s = tanh_derivatives(&t, order);

        let mixed = self
            .mixed
            .as_ref()
            .map(|m| m.chain(&s, &self.axes[0], &self.axes[1]));
        let axes = self.axes.iter().map(|z| chain_axis(&s, z)).collect();

        Self {
            value: t,
            axes,
            mixed,
        }
    }

    fn pack(self, layout: OutputLayout) -> Result<Tensor<B, 2>> {
        let mut columns = Vec::with_capacity(layout.width());
        for &partial in layout.partials() {
            let column = match partial {
                Partial::U => Some(self.value.clone()),
                Partial::Uxx => self.partial(0, 2),
                Partial::Uyy => self.partial(1, 2),
                Partial::Uxxxx => self.partial(0, 4),
                Partial::Uyyyy => self.partial(1, 4),
                Partial::Upp => self.partial(2, 2),
                Partial::Uxxyy => self.mixed.as_ref().map(|m| m.xxyy.clone()),
            };
            columns.push(column.ok_or_else(|| {
                PinnError::OutputLayout(format!("{partial:?} は伝播されていません"))
            })?);
        }
        Ok(Tensor::cat(columns, 1))
    }
}

impl<B: Backend> MixedPartials<B> {
    fn chain(&self, s: &[Tensor<B, 2>], x: &[Tensor<B, 2>], y: &[Tensor<B, 2>]) -> Self {
        let (zx, zxx) = (&x[0], &x[1]);
        let (zy, zyy) = (&y[0], &y[1]);
        let zxy = &self.xy;
        let zx2 = mul(zx, zx);
        let zy2 = mul(zy, zy);
        let zx_zy = mul(zx, zy);

        let xy = mul(&s[1], &zx_zy) + mul(&s[0], zxy);
        let xxy = mul(&s[2], &mul(&zx2, zy))
            + mul(&s[1], &(mul(zx, zxy).mul_scalar(2.0) + mul(zy, zxx)))
            + mul(&s[0], &self.xxy);
        let xyy = mul(&s[2], &mul(&zy2, zx))
            + mul(&s[1], &(mul(zy, zxy).mul_scalar(2.0) + mul(zx, zyy)))
            + mul(&s[0], &self.xyy);
        let xxyy = mul(&s[3], &mul(&zx2, &zy2))
            + mul(
                &s[2],
                &(mul(&zx2, zyy) + mul(&zy2, zxx) + mul(&zx_zy, zxy).mul_scalar(4.0)),
            )
            + mul(
                &s[1],
                &((mul(zxy, zxy) + mul(zx, &self.xyy) + mul(zy, &self.xxy)).mul_scalar(2.0)
                    + mul(zxx, zyy)),
            )
            + mul(&s[0], &self.xxyy);

        Self { xy, xxy, xyy, xxyy }
    }
}

fn mul<B: Backend>(a: &Tensor<B, 2>, b: &Tensor<B, 2>) -> Tensor<B, 2> {
    a.clone() * b.clone()
}

/// `t = tanh(z)` から tanh の1〜`order`階導関数を求めます。
fn tanh_derivatives<B: Backend>(t: &Tensor<B, 2>, order: usize) -> Vec<Tensor<B, 2>> {
    let mut s: Vec<Tensor<B, 2>> = Vec::with_capacity(order);
    if order == 0 {
        return s;
    }
    s.push(mul(t, t).neg().add_scalar(1.0));
    if order > 1 {
        s.push(mul(t, &s[0]).mul_scalar(-2.0));
    }
    if order > 2 {
        s.push((mul(&s[0], &s[0]) + mul(t, &s[1])).mul_scalar(-2.0));
    }
    if order > 3 {
        s.push((mul(&s[0], &s[1]).mul_scalar(3.0) + mul(t, &s[2])).mul_scalar(-2.0));
    }
    s
}

/// 1変数の合成 h = σ(z) の偏微分（Faà di Bruno）
fn chain_axis<B: Backend>(s: &[Tensor<B, 2>], z: &[Tensor<B, 2>]) -> Vec<Tensor<B, 2>> {
    let mut out = Vec::with_capacity(z.len());
    let Some(z1) = z.first() else {
        return out;
    };
    out.push(mul(&s[0], z1));

    let Some(z2) = z.get(1) else {
        return out;
    };
    let z1_2 = mul(z1, z1);
    out.push(mul(&s[1], &z1_2) + mul(&s[0], z2));

    let Some(z3) = z.get(2) else {
        return out;
    };
    out.push(
        mul(&s[2], &mul(&z1_2, z1))
            + mul(&s[1], &mul(z1, z2)).mul_scalar(3.0)
            + mul(&s[0], z3),
    );

    let Some(z4) = z.get(3) else {
        return out;
    };
    out.push(
        mul(&s[3], &mul(&z1_2, &z1_2))
            + mul(&s[2], &mul(&z1_2, z2)).mul_scalar(6.0)
            + mul(
                &s[1],
                &(mul(z2, z2).mul_scalar(3.0) + mul(z1, z3).mul_scalar(4.0)),
            )
            + mul(&s[0], z4),
    );
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::SurrogateConfig;
    use burn::backend::NdArray;
    use burn::tensor::TensorData;

    type TestBackend = NdArray<f64>;

    const H: f64 = 1e-2;

    /// `f64` のまま `[rows, cols]` のテンソルを作ります。
    fn inputs(values: &[f64], rows: usize, cols: usize) -> Tensor<TestBackend, 2> {
        let device = Default::default();
        Tensor::from_data(TensorData::new(values.to_vec(), [rows, cols]), &device)
    }

    fn model(input_dim: usize) -> Surrogate<TestBackend> {
        TestBackend::seed(42);
        let device = Default::default();
        SurrogateConfig::new(input_dim)
            .with_hidden_size(6)
            .with_num_layers(3)
            .init::<TestBackend>(&device)
    }

    fn eval(model: &Surrogate<TestBackend>, point: &[f64]) -> f64 {
        model.forward(inputs(point, 1, point.len())).into_scalar()
    }

    fn shifted(point: &[f64], steps: &[(usize, f64)]) -> Vec<f64> {
        let mut p = point.to_vec();
        for &(axis, k) in steps {
            p[axis] += k * H;
        }
        p
    }

    fn fd_second(model: &Surrogate<TestBackend>, point: &[f64], axis: usize) -> f64 {
        let f = |k| eval(model, &shifted(point, &[(axis, k)]));
        (f(1.0) - 2.0 * f(0.0) + f(-1.0)) / (H * H)
    }

    fn fd_fourth(model: &Surrogate<TestBackend>, point: &[f64], axis: usize) -> f64 {
        let f = |k| eval(model, &shifted(point, &[(axis, k)]));
        (f(2.0) - 4.0 * f(1.0) + 6.0 * f(0.0) - 4.0 * f(-1.0) + f(-2.0)) / H.powi(4)
    }

    fn fd_xxyy(model: &Surrogate<TestBackend>, point: &[f64]) -> f64 {
        let c = [(-1.0, 1.0), (0.0, -2.0), (1.0, 1.0)];
        let mut sum = 0.0;
        for (i, ci) in c {
            for (j, cj) in c {
                sum += ci * cj * eval(model, &shifted(point, &[(0, i), (1, j)]));
            }
        }
        sum / H.powi(4)
    }

    fn assert_close(actual: f64, expected: f64, label: &str) {
        let tolerance = 1e-2 * expected.abs().max(1.0);
        assert!(
            (actual - expected).abs() <= tolerance,
            "{label}: jet {actual} vs finite difference {expected}"
        );
    }

    fn row(output: &SurrogateOutput<TestBackend>, i: usize) -> Vec<f64> {
        let width = output.layout().width();
        let values = output.packed().clone().into_data().to_vec::<f64>().unwrap();
        values[i * width..(i + 1) * width].to_vec()
    }

    #[test]
    fn fixed_load_partials_match_finite_differences() {
        let model = model(2);
        let points = [[0.3, -0.2], [0.7, 0.5], [-0.4, 0.9]];
        let flat: Vec<f64> = points.iter().flatten().copied().collect();

        let output = extract(&model, inputs(&flat, 3, 2), OutputLayout::FixedLoad).unwrap();

        assert_eq!(output.packed().dims(), [3, 6]);
        for (i, point) in points.iter().enumerate() {
            let r = row(&output, i);
            assert_close(r[0], eval(&model, point), "u");
            assert_close(r[1], fd_second(&model, point, 0), "u_xx");
            assert_close(r[2], fd_second(&model, point, 1), "u_yy");
            assert_close(r[3], fd_fourth(&model, point, 0), "u_xxxx");
            assert_close(r[4], fd_fourth(&model, point, 1), "u_yyyy");
            assert_close(r[5], fd_xxyy(&model, point), "u_xxyy");
        }
    }

    #[test]
    fn variable_load_partials_match_finite_differences() {
        let model = model(3);
        let point = [0.2, 0.6, -0.3];

        let output = extract(&model, inputs(&point, 1, 3), OutputLayout::VariableLoad).unwrap();

        assert_eq!(output.packed().dims(), [1, 4]);
        let r = row(&output, 0);
        assert_close(r[0], eval(&model, &point), "u");
        assert_close(r[1], fd_second(&model, &point, 0), "u_xx");
        assert_close(r[2], fd_second(&model, &point, 1), "u_yy");
        assert_close(r[3], fd_second(&model, &point, 2), "u_pp");
    }

    #[test]
    fn rejects_mismatched_inputs_and_missing_partials() {
        let model = model(2);
        let device = Default::default();
        let inputs = Tensor::<TestBackend, 2>::zeros([4, 3], &device);
        assert!(extract(&model, inputs, OutputLayout::VariableLoad).is_err());

        let inputs = Tensor::<TestBackend, 2>::zeros([4, 2], &device);
        let output = extract(&model, inputs, OutputLayout::FixedLoad).unwrap();
        assert!(output.get(Partial::Upp).is_err());
        assert_eq!(output.get(Partial::Uxxyy).unwrap().dims(), [4, 1]);
    }

    #[test]
    fn scaled_surrogate_partials_match_finite_differences() {
        TestBackend::seed(7);
        let device = Default::default();
        let model = SurrogateConfig::new(2)
            .with_hidden_size(6)
            .with_num_layers(3)
            .with_input_scale(vec![0.25, 0.5])
            .with_output_scale(3e-4)
            .init::<TestBackend>(&device);
        let point = [1.3, 0.7];

        let output = extract(&model, inputs(&point, 1, 2), OutputLayout::FixedLoad).unwrap();

        let r = row(&output, 0);
        let h = 4.0 * H;
        let f = |dx: f64, dy: f64| eval(&model, &[point[0] + dx * h, point[1] + dy * h]);
        let u_xx = (f(1.0, 0.0) - 2.0 * f(0.0, 0.0) + f(-1.0, 0.0)) / (h * h);
        let u_yy = (f(0.0, 1.0) - 2.0 * f(0.0, 0.0) + f(0.0, -1.0)) / (h * h);
        // 出力と入力の係数を除いた無次元の値で比較する
        assert_close(r[0] / 3e-4, f(0.0, 0.0) / 3e-4, "u");
        assert_close(r[1] / (3e-4 * 0.0625), u_xx / (3e-4 * 0.0625), "u_xx");
        assert_close(r[2] / (3e-4 * 0.25), u_yy / (3e-4 * 0.25), "u_yy");
    }

    #[test]
    fn output_requires_layout_width() {
        let device = Default::default();
        let packed = Tensor::<TestBackend, 2>::zeros([2, 5], &device);
        assert!(SurrogateOutput::new(OutputLayout::FixedLoad, packed).is_err());
    }
}
