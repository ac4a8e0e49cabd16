//! 重连退避策略：指数增长、上限截断、随机抖动，重试次数不限

use rand::Rng;
use std::time::Duration;

/// 重连退避策略
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ReconnectPolicy {
    /// 首次重连的基础延迟
    pub base_delay: Duration,
    /// 延迟上限
    pub max_delay: Duration,
    /// 抖动比例（0.0 ~ 1.0），实际延迟在 `nominal * (1 ± jitter)` 之间
    pub jitter: f64,
}

impl Default for ReconnectPolicy {
    fn default() -> Self {
        Self {
            base_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(30),
            jitter: 0.5,
        }
    }
}

impl ReconnectPolicy {
    /// 第 `attempt` 次重连（从 0 开始）的名义延迟，不含抖动
    pub fn nominal_delay(&self, attempt: u32) -> Duration {
        let factor = 2u32.saturating_pow(attempt.min(16));
        self.base_delay
            .checked_mul(factor)
            .unwrap_or(self.max_delay)
            .min(self.max_delay)
    }

    /// 第 `attempt` 次重连的实际延迟（随机抖动）
    pub fn next_delay(&self, attempt: u32) -> Duration {
        let sample: f64 = rand::thread_rng().gen_range(0.0..1.0);
        self.delay_with_sample(attempt, sample)
    }

    /// 抖动比例截断到 [0, 1]；NaN / 无穷回退到默认值
    pub fn effective_jitter(&self) -> f64 {
        if self.jitter.is_finite() {
            self.jitter.clamp(0.0, 1.0)
        } else {
            Self::default().jitter
        }
    }

    /// `sample` 取值 [0, 1)，0.5 对应名义延迟
    pub fn delay_with_sample(&self, attempt: u32, sample: f64) -> Duration {
        let nominal = self.nominal_delay(attempt).as_secs_f64();
        let jitter = self.effective_jitter();
        let sample = if sample.is_finite() { sample.clamp(0.0, 1.0) } else { 0.5 };
        let scale = 1.0 - jitter + 2.0 * jitter * sample;
        Duration::try_from_secs_f64(nominal * scale)
            .unwrap_or(self.max_delay)
            .min(self.max_delay)
    }
}
