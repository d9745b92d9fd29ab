//! 曲げモーメントの計算

use burn::prelude::Backend;
use burn::tensor::Tensor;

/// 2階微分から曲げモーメントを求めます。
///
/// `mx = −D(u_xx + ν·u_yy)`, `my = −D(ν·u_xx + u_yy)`
pub fn bending_moments<B: Backend>(
    u_xx: Tensor<B, 2>,
    u_yy: Tensor<B, 2>,
    flexural_rigidity: f32,
    poisson_ratio: f32,
) -> (Tensor<B, 2>, Tensor<B, 2>) {
    let mx = (u_xx.clone() + u_yy.clone().mul_scalar(poisson_ratio)).mul_scalar(-flexural_rigidity);
    let my = (u_xx.mul_scalar(poisson_ratio) + u_yy).mul_scalar(-flexural_rigidity);
    (mx, my)
}
