// 帧率节流 - 离散时间段节流器
//
// 把一秒划分为 D 个等长时间段，把目标帧率 R 均匀分配到这些时间段里，
// 避免"一次性突发发送后长时间空闲"的发送模式。
//
// # 核心组件
//
// - `DiscreteTimePeriodsThrottler`: 基于整数累加（Bresenham）的时间段配额调度器
//
// # 设计目标
//
// 1. **无漂移**: 任意连续 D 个时间段内恰好放行 R 次
// 2. **均匀分布**: 相邻时间段的配额差不超过1
// 3. **可测试**: 截止时间的计算只依赖传入的时刻，可以用模拟时钟验证

pub mod discrete;

// 重新导出核心类型
pub use discrete::DiscreteTimePeriodsThrottler;

/// 默认离散度（每秒时间段数）
pub const DEFAULT_DISCRETENESS_HZ: u32 = 25;
