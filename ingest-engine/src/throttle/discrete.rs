// 离散时间段节流器实现
//
// 第 k 个时间段的配额为 ceil((k+1)·R/D) - ceil(k·R/D)，
// 等价于：累加器以 D-1 为初值，每进入一个时间段加 R，每放行一次减 D。

use tokio::time::{Duration, Instant};
use tracing::{debug, info, trace};

use crate::error::IngestError;

const NANOS_PER_SECOND: u128 = 1_000_000_000;

/// 离散时间段节流器
///
/// 每个会话持有一个实例，会话启动时重置。
/// 错过的时间段不会累积配额，所以长时间空闲之后也不会出现追赶式突发。
#[derive(Debug)]
pub struct DiscreteTimePeriodsThrottler {
    /// 目标帧率 R（次/秒）
    rate: u32,
    /// 离散度 D（时间段/秒）
    discreteness: u32,
    /// 第0个时间段的起点，第一次调用时确定
    epoch: Option<Instant>,
    /// 当前时间段序号
    current_period: u64,
    /// 当前时间段剩余配额
    remaining: u32,
    /// 进入当前时间段后留下的余数
    accumulator: u64,
    /// 已放行次数
    permitted: u64,
}

impl DiscreteTimePeriodsThrottler {
    /// 创建节流器
    ///
    /// # 错误
    ///
    /// - `rate == 0` 时返回 `IngestError::InvalidRate`
    /// - `discreteness == 0` 或 `discreteness < rate` 时返回 `IngestError::InvalidDiscreteness`
    pub fn new(rate: u32, discreteness: u32) -> Result<Self, IngestError> {
        if rate == 0 {
            return Err(IngestError::InvalidRate(rate));
        }
        if discreteness == 0 || discreteness < rate {
            return Err(IngestError::InvalidDiscreteness { rate, discreteness });
        }

        info!(
            "Creating DiscreteTimePeriodsThrottler: rate={}/s, discreteness={}Hz, period={:.3}ms",
            rate,
            discreteness,
            1000.0 / discreteness as f64
        );

        Ok(Self {
            rate,
            discreteness,
            epoch: None,
            current_period: 0,
            remaining: 0,
            accumulator: 0,
            permitted: 0,
        })
    }

    pub fn rate(&self) -> u32 {
        self.rate
    }

    pub fn discreteness(&self) -> u32 {
        self.discreteness
    }

    /// 单个时间段的长度
    pub fn period_duration(&self) -> Duration {
        Duration::from_nanos((NANOS_PER_SECOND / self.discreteness as u128) as u64)
    }

    /// 已放行次数
    pub fn permitted(&self) -> u64 {
        self.permitted
    }

    /// 当前时间段的累加器余数
    pub fn accumulator(&self) -> u64 {
        self.accumulator
    }

    /// 第 `period` 个时间段的配额
    pub fn quota_for_period(&self, period: u64) -> u32 {
        let (quota, _) = self.distribute(period);
        quota
    }

    /// 计算第 `period` 个时间段的配额和留下的余数
    fn distribute(&self, period: u64) -> (u32, u64) {
        let rate = self.rate as u128;
        let discreteness = self.discreteness as u128;
        // 进入该时间段之前累加器中的余数
        let carried = (period as u128 * rate + (discreteness - 1)) % discreteness;
        let total = carried + rate;
        ((total / discreteness) as u32, (total % discreteness) as u64)
    }

    fn enter_period(&mut self, period: u64) {
        let (quota, remainder) = self.distribute(period);
        self.current_period = period;
        self.remaining = quota;
        self.accumulator = remainder;
        trace!("Entered period {}: quota={}, remainder={}", period, quota, remainder);
    }

    /// 第 `period` 个时间段的起点
    ///
    /// 直接由序号换算，避免逐段累加带来的舍入漂移。
    fn period_start(&self, epoch: Instant, period: u64) -> Instant {
        let offset = period as u128 * NANOS_PER_SECOND / self.discreteness as u128;
        epoch + Duration::from_nanos(offset as u64)
    }

    fn period_at(&self, epoch: Instant, now: Instant) -> u64 {
        let elapsed = now.saturating_duration_since(epoch).as_nanos();
        (elapsed * self.discreteness as u128 / NANOS_PER_SECOND) as u64
    }

    /// 预留一个放行名额，返回允许放行的时刻
    ///
    /// 当前时间段还有配额时返回 `now`（消耗一个配额）；
    /// 否则返回下一个拥有配额的时间段的起点，并预先占用该时间段的一个名额。
    pub fn reserve(&mut self, now: Instant) -> Instant {
        let epoch = match self.epoch {
            Some(epoch) => epoch,
            None => {
                self.epoch = Some(now);
                self.enter_period(0);
                now
            }
        };

        let observed = self.period_at(epoch, now);
        if observed > self.current_period {
            self.enter_period(observed);
        }

        if self.remaining == 0 {
            let mut next = self.current_period + 1;
            loop {
                self.enter_period(next);
                if self.remaining > 0 {
                    break;
                }
                next += 1;
            }
        }

        self.remaining -= 1;
        self.permitted += 1;

        // 预留到未来时间段的名额必须等到该时间段开始
        now.max(self.period_start(epoch, self.current_period))
    }

    /// 节流：配额用尽时挂起到下一个时间段边界，返回等待的时长
    pub async fn throttle(&mut self) -> Duration {
        let now = Instant::now();
        let deadline = self.reserve(now);

        if deadline <= now {
            return Duration::ZERO;
        }

        let wait = deadline - now;
        debug!(
            "Throttling {:.3}ms (period {}, permitted {})",
            wait.as_secs_f64() * 1000.0,
            self.current_period,
            self.permitted
        );
        tokio::time::sleep_until(deadline).await;
        wait
    }

    /// 重置节流器，下一次调用重新确定时间段起点
    pub fn reset(&mut self) {
        debug!("Resetting DiscreteTimePeriodsThrottler");
        self.epoch = None;
        self.current_period = 0;
        self.remaining = 0;
        self.accumulator = 0;
        self.permitted = 0;
    }
}
