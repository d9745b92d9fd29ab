//! 学習率の減衰と早期終了
//!
//! どちらもエポックごとに検証損失を1回観測するだけの単純なポーリングです。
//! burnの早期終了は `Learner` を前提としますが、学習ループは損失の重みの射影を
//! オプティマイザの各ステップ直後に行うため `Learner` を使わず、ここで直接判定します。

/// 改善が止まったら学習率を一定の倍率で下げます。
#[derive(Debug, Clone)]
pub struct ReduceOnPlateau {
    learning_rate: f64,
    factor: f64,
    patience: usize,
    min_learning_rate: f64,
    best: f32,
    wait: usize,
}

impl ReduceOnPlateau {
    pub fn new(learning_rate: f64, factor: f64, patience: usize, min_learning_rate: f64) -> Self {
        Self {
            learning_rate,
            factor,
            patience,
            min_learning_rate,
            best: f32::INFINITY,
            wait: 0,
        }
    }

    pub fn learning_rate(&self) -> f64 {
        self.learning_rate
    }

    /// 損失を観測し、次のエポックで使う学習率を返します。
    pub fn observe(&mut self, loss: f32) -> f64 {
        if loss < self.best {
            self.best = loss;
            self.wait = 0;
            return self.learning_rate;
        }
        self.wait += 1;
        if self.wait > self.patience {
            let reduced = (self.learning_rate * self.factor).max(self.min_learning_rate);
            if reduced < self.learning_rate {
                log::info!(
                    "学習率を {:.3e} から {:.3e} に下げます",
                    self.learning_rate,
                    reduced
                );
            }
            self.learning_rate = reduced;
            self.wait = 0;
        }
        self.learning_rate
    }
}

/// 早期終了の判定結果
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StopDecision {
    /// 最良値を更新した
    Improved,
    Continue,
    Stop,
}

/// 一定エポック改善がなければ学習を打ち切ります。
#[derive(Debug, Clone)]
pub struct EarlyStopping {
    patience: usize,
    min_delta: f32,
    best: f32,
    best_epoch: Option<usize>,
    wait: usize,
}

impl EarlyStopping {
    pub fn new(patience: usize, min_delta: f32) -> Self {
        Self {
            patience,
            min_delta,
            best: f32::INFINITY,
            best_epoch: None,
            wait: 0,
        }
    }

    pub fn best(&self) -> f32 {
        self.best
    }

    pub fn best_epoch(&self) -> Option<usize> {
        self.best_epoch
    }

    pub fn observe(&mut self, epoch: usize, loss: f32) -> StopDecision {
        if loss < self.best - self.min_delta {
            self.best = loss;
            self.best_epoch = Some(epoch);
            self.wait = 0;
            return StopDecision::Improved;
        }
        self.wait += 1;
        if self.wait >= self.patience {
            StopDecision::Stop
        } else {
            StopDecision::Continue
        }
    }
}
