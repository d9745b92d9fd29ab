//! コロケーション点のバッチ
//!
//! 各点は発生元（内部・境界の各辺・計測点）のタグを持ちます。
//! 残差計算はタグを参照してデータ損失を配置し、計測点が末尾に並んでいることも検証します。

use crate::error::{PinnError, Result};
use burn::prelude::Backend;
use burn::tensor::Tensor;
use std::ops::Range;

/// 板の4辺。並び順はバッチ内の境界グループの並び順と一致します。
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Edge {
    /// x = 0
    Left,
    /// x = W
    Right,
    /// y = 0
    Bottom,
    /// y = H
    Top,
}

impl Edge {
    pub const ALL: [Edge; 4] = [Edge::Left, Edge::Right, Edge::Bottom, Edge::Top];
}

/// 点の発生元
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PointKind {
    Interior,
    Edge(Edge),
    /// 板が保持する計測値のインデックス
    Measurement(usize),
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct CollocationPoint {
    pub x: f32,
    pub y: f32,
    /// 可変荷重モデルでの荷重の大きさ
    pub load: Option<f32>,
    pub kind: PointKind,
}

impl CollocationPoint {
    pub fn new(x: f32, y: f32, load: Option<f32>, kind: PointKind) -> Self {
        Self { x, y, load, kind }
    }
}

/// 1ステップ分のコロケーション点
#[derive(Debug, Clone, Default)]
pub struct CollocationBatch {
    points: Vec<CollocationPoint>,
}

impl CollocationBatch {
    pub fn new(points: Vec<CollocationPoint>) -> Self {
        Self { points }
    }

    pub fn len(&self) -> usize {
        self.points.len()
    }

    pub fn is_empty(&self) -> bool {
        self.points.is_empty()
    }

    pub fn points(&self) -> &[CollocationPoint] {
        &self.points
    }

    pub fn measurement_count(&self) -> usize {
        self.points
            .iter()
            .filter(|p| matches!(p.kind, PointKind::Measurement(_)))
            .count()
    }

    /// 計測点が末尾 `expected` 個を順番どおりに占めていることを確認し、その範囲を返します。
    pub fn measurement_range(&self, expected: usize) -> Result<Range<usize>> {
        let len = self.points.len();
        if expected >= len {
            return Err(PinnError::BatchLayout(format!(
                "バッチサイズ {len} が計測点の数 {expected} 以下です"
            )));
        }
        let found = self.measurement_count();
        if found != expected {
            return Err(PinnError::BatchLayout(format!(
                "計測点の数が一致しません (期待: {expected}, バッチ内: {found})"
            )));
        }
        let start = len - expected;
        for (offset, p) in self.points[start..].iter().enumerate() {
            if p.kind != PointKind::Measurement(offset) {
                return Err(PinnError::BatchLayout(format!(
                    "位置 {} は計測点 {offset} である必要があります (実際: {:?})",
                    start + offset,
                    p.kind
                )));
            }
        }
        Ok(start..len)
    }

    /// サロゲートへの入力テンソル `[n, input_dim]` を作ります。
    ///
    /// `input_dim` が3の場合は各点の荷重を3列目に置きます。
    pub fn inputs<B: Backend>(&self, input_dim: usize, device: &B::Device) -> Result<Tensor<B, 2>> {
        if self.is_empty() {
            return Err(PinnError::BatchLayout("点を含まないバッチは評価できません".to_string()));
        }
        let n = self.points.len();
        let mut coords = Vec::with_capacity(n * input_dim);
        for (i, p) in self.points.iter().enumerate() {
            match input_dim {
                2 => coords.extend([p.x, p.y]),
                3 => {
                    let load = p.load.ok_or_else(|| {
                        PinnError::BatchLayout(format!("位置 {i} の点に荷重がありません"))
                    })?;
                    coords.extend([p.x, p.y, load]);
                }
                _ => {
                    return Err(PinnError::Config(format!(
                        "入力次元 {input_dim} には対応していません"
                    )));
                }
            }
        }
        let coords_1d = Tensor::<B, 1>::from_floats(coords.as_slice(), device);
        Ok(coords_1d.reshape([n, input_dim]))
    }

    /// 各点に関数を適用した列テンソル `[n, 1]` を作ります。
    pub fn column<B: Backend>(
        &self,
        device: &B::Device,
        f: impl Fn(&CollocationPoint) -> f32,
    ) -> Tensor<B, 2> {
        let values: Vec<f32> = self.points.iter().map(f).collect();
        Tensor::<B, 1>::from_floats(values.as_slice(), device).reshape([self.points.len(), 1])
    }
}
