//! 転流タイミングエンジン
//!
//! ゼロクロス間隔から転流周期（4転流分、period4x）を指数移動平均で求め、
//! 進角設定と回転数から次の転流までの待ち時間を計算する。
//! デマグ（消磁）検出の頻度もここで追跡する。

use crate::params::{DemagComp, Tuning};
use crate::timing::{saturate16, Stamp};

/// 1転流ステップ分の待ち時間 [ticks]
///
/// ゼロクロス → `comm` → 転流 → `advance` → `zc_scan` → スキャン開始（`zc_timeout` まで）
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct WaitSchedule {
    /// ゼロクロスから転流まで
    pub comm: u16,
    /// 転流から次の区間の開始まで
    pub advance: u16,
    /// スキャン開始までの待ち（7.5°）
    pub zc_scan: u16,
    /// ゼロクロス待ちのタイムアウト（15°）
    pub zc_timeout: u16,
}

/// デマグ検出頻度の移動平均（8サンプル、0-256）
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct DemagMetric {
    value: u16,
}

impl DemagMetric {
    pub const fn new() -> Self {
        Self { value: 0 }
    }

    pub fn value(&self) -> u16 {
        self.value
    }

    /// 1回分の検出結果を反映
    pub fn update(&mut self, detected: bool, floor: u16) -> u16 {
        let sample = if detected { 256 } else { 0 };
        let next = (7 * self.value as u32 + sample) / 8;
        self.value = (next as u16).max(floor);
        self.value
    }

    pub fn reset(&mut self) {
        self.value = 0;
    }
}

impl Default for DemagMetric {
    fn default() -> Self {
        Self::new()
    }
}

/// 転流タイミングの状態
#[derive(Debug, Clone, Copy)]
pub struct CommTiming {
    period4x: u16,
    last_zc: Stamp,
    demag: DemagMetric,
    tuning: Tuning,
}

impl CommTiming {
    pub fn new(tuning: Tuning) -> Self {
        Self {
            period4x: u16::MAX,
            last_zc: Stamp(0),
            demag: DemagMetric::new(),
            tuning,
        }
    }

    /// 始動プロファイルから周期を設定し直す
    pub fn reset(&mut self, period4x: u16, zero_cross: Stamp) {
        self.period4x = period4x.max(self.tuning.min_period4x);
        self.last_zc = zero_cross;
        self.demag.reset();
    }

    /// 4転流分の平均周期 [ticks]
    #[inline(always)]
    pub fn period4x(&self) -> u16 {
        self.period4x
    }

    /// period4x の上位バイト
    #[inline(always)]
    pub fn period_hi(&self) -> u8 {
        (self.period4x >> 8) as u8
    }

    pub fn last_zero_cross(&self) -> Stamp {
        self.last_zc
    }

    pub fn demag_metric(&self) -> u16 {
        self.demag.value()
    }

    /// 平均化窓 (a, b): p = p - p/2^a + new/2^b
    fn averaging_window(&self) -> (u32, u32) {
        let hi = self.period_hi();
        if hi >= self.tuning.slow_breakpoint {
            (4, 2)
        } else if hi >= self.tuning.mid_breakpoint {
            (3, 1)
        } else {
            (2, 0)
        }
    }

    /// ゼロクロス検出時の周期更新
    ///
    /// 前回のゼロクロスからの経過ティックを1転流分として平均に取り込み、更新後の
    /// period4x を返す。65535ティックを超える間隔は 0xFFFF に飽和する。
    pub fn on_zero_cross(&mut self, stamp: Stamp) -> u16 {
        let interval = saturate16(stamp.ticks_since(self.last_zc)) as u32;
        self.last_zc = stamp;

        let (a, b) = self.averaging_window();
        let p = self.period4x as u32;
        let next = p - (p >> a) + (interval >> b);
        self.period4x = saturate16(next).max(self.tuning.min_period4x);
        self.period4x
    }

    /// デマグ補正後の進角レベル（1-5）
    pub fn effective_timing(&self, level: u8) -> u8 {
        let mut timing = level.clamp(1, 5);
        let metric = self.demag.value();
        if metric >= crate::params::tuning::DEMAG_ADVANCE_1 {
            timing += 1;
        }
        if metric >= crate::params::tuning::DEMAG_ADVANCE_2 {
            timing += 1;
        }
        timing.min(5)
    }

    /// 待ち時間の計算
    pub fn compute_wait_schedule(&self, level: u8, damped: bool) -> WaitSchedule {
        let min = self.tuning.min_wait_ticks;
        let hi = self.period_hi();

        let extra = if damped { 1 } else { 0 };
        let mut reduction = self.tuning.overhead_ticks + extra;
        if hi < 3 {
            reduction += 2 + extra;
        }
        if hi < 2 {
            reduction += 2 + extra;
        }

        // 15°
        let base = (self.period4x / 16)
            .saturating_sub(reduction)
            .max(2 * min);
        let half = (base / 2).max(min);

        let timing = self.effective_timing(level);
        let (long, short) = if timing % 2 == 0 {
            (base + half, half)
        } else {
            (2 * base - min, min)
        };
        let (comm, advance) = match timing {
            3 => (base, base),
            t if t < 3 => (long, short),
            _ => (short, long),
        };

        WaitSchedule {
            comm,
            advance,
            zc_scan: half,
            zc_timeout: base,
        }
    }

    /// デマグ判定を反映し、電力カットが必要なら true
    pub fn on_demag(&mut self, detected: bool, comp: DemagComp, enabled: bool) -> bool {
        let metric = self
            .demag
            .update(detected, crate::params::tuning::DEMAG_METRIC_FLOOR);
        enabled && comp != DemagComp::Off && metric >= comp.power_off_threshold()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn timing() -> CommTiming {
        CommTiming::new(Tuning::default())
    }

    /// 一定間隔のゼロクロスを n 回与える
    fn feed(t: &mut CommTiming, start: u32, interval: u32, n: u32) -> u32 {
        let mut at = start;
        for _ in 0..n {
            at = at.wrapping_add(interval);
            t.on_zero_cross(Stamp(at));
        }
        at
    }

    #[test]
    fn test_period_converges_to_four_intervals() {
        for interval in [300u32, 1_500, 3_333] {
            let mut t = timing();
            t.reset(0x7F00, Stamp(0));
            feed(&mut t, 0, interval, 400);
            let expected = 4 * interval as i32;
            let err = (t.period4x() as i32 - expected).abs();
            assert!(
                err <= expected / 50 + 8,
                "interval {} -> period4x {}",
                interval,
                t.period4x()
            );
        }
    }

    #[test]
    fn test_period_clamps() {
        let mut t = timing();
        t.reset(0x0400, Stamp(0));
        // 非常に短い間隔でも最小値を下回らない
        feed(&mut t, 0, 1, 200);
        assert_eq!(t.period4x(), Tuning::default().min_period4x);

        // 長い間隔は 0xFFFF に飽和し、巻き戻らない
        let mut t = timing();
        t.reset(0xF000, Stamp(0));
        feed(&mut t, 0, 200_000, 50);
        assert_eq!(t.period4x(), 0xFFFF);
    }

    #[test]
    fn test_zero_cross_across_counter_wrap() {
        let mut t = timing();
        let start = u32::MAX - 500;
        t.reset(4 * 1_000, Stamp(start));
        feed(&mut t, start, 1_000, 100);
        assert!((t.period4x() as i32 - 4_000).abs() < 100);
    }

    #[test]
    fn test_medium_timing_splits_evenly() {
        let mut t = timing();
        t.reset(0x2000, Stamp(0));
        let w = t.compute_wait_schedule(3, false);
        assert_eq!(w.comm, w.advance);
        assert_eq!(w.zc_timeout, w.comm);
        assert_eq!(w.zc_scan, w.comm / 2);
        assert_eq!(w.comm, 0x2000 / 16 - 2);
    }

    #[test]
    fn test_timing_levels_keep_half_sector() {
        let mut t = timing();
        t.reset(0x2000, Stamp(0));
        let base = t.compute_wait_schedule(3, false).comm;
        for level in 1..=5 {
            let w = t.compute_wait_schedule(level, false);
            assert_eq!(w.comm + w.advance, 2 * base, "level {}", level);
        }
        // 低レベルほど転流が遅く、高レベルほど早い
        let low = t.compute_wait_schedule(1, false);
        let high = t.compute_wait_schedule(5, false);
        assert!(low.comm > high.comm);
        assert!(low.advance < high.advance);
    }

    #[test]
    fn test_waits_respect_minimum() {
        let mut t = timing();
        t.reset(0x0100, Stamp(0));
        let min = Tuning::default().min_wait_ticks;
        for level in 1..=5 {
            for damped in [false, true] {
                let w = t.compute_wait_schedule(level, damped);
                assert!(w.comm >= min && w.advance >= min);
                assert!(w.zc_scan >= min && w.zc_timeout >= min);
            }
        }
    }

    #[test]
    fn test_demag_metric_floor_and_threshold() {
        let mut t = timing();
        assert!(!t.on_demag(false, DemagComp::Low, true));
        assert_eq!(t.demag_metric(), 120);

        let mut cut = false;
        for _ in 0..20 {
            cut = t.on_demag(true, DemagComp::Low, true);
        }
        assert!(cut);
        assert!(t.demag_metric() >= 160);

        // 補償オフ、または無効時はカットしない
        assert!(!t.on_demag(true, DemagComp::Off, true));
        assert!(!t.on_demag(true, DemagComp::High, false));
    }

    #[test]
    fn test_demag_advances_timing() {
        let mut t = timing();
        assert_eq!(t.effective_timing(3), 3);
        for _ in 0..20 {
            t.on_demag(true, DemagComp::High, true);
        }
        assert_eq!(t.effective_timing(3), 5);
        assert_eq!(t.effective_timing(5), 5);
    }
}
