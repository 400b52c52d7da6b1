//! オープンループ始動（ステップ始動）
//!
//! 一定の起動パワーで転流周期を少しずつ縮めながら強制転流し、毎ステップ
//! コンパレータをスキャンする。ゼロクロスが規定回数連続で確認できたら
//! 閉ループ（InitialRun）に移行する。

use crate::esc::{drive_phase, EscHal};
use crate::params::{startup as defaults, Tuning};
use crate::phase::{CommPhase, PhaseDriver};
use crate::sequencer::StopReason;
use crate::shared::{SharedState, ThrottleCommand};
use crate::timing::{saturate16, Stamp};
use crate::zero_cross::{await_zero_cross, ScanContext};

/// 1ステップの判定
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum StepVerdict {
    Continue,
    Confirmed,
    Failed,
}

/// 1回の始動試行の結果
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum AttemptOutcome {
    /// 閉ループ移行（最後のゼロクロスと推定周期）
    Confirmed { period4x: u16, zero_cross: Stamp },
    /// 連続未検出が上限を超えた
    Failed,
    /// 停止指令・信号ロストで中断
    Aborted(StopReason),
}

/// ステップ始動の状態
#[derive(Debug, Clone, Copy)]
pub struct SteppedStart {
    step_ticks: u16,
    consecutive_ok: u8,
    consecutive_miss: u8,
    steps: u16,
    tuning: Tuning,
}

impl SteppedStart {
    pub fn new(tuning: &Tuning) -> Self {
        Self {
            step_ticks: tuning.initial_step_ticks,
            consecutive_ok: 0,
            consecutive_miss: 0,
            steps: 0,
            tuning: *tuning,
        }
    }

    pub fn step_ticks(&self) -> u16 {
        self.step_ticks
    }

    pub fn consecutive_ok(&self) -> u8 {
        self.consecutive_ok
    }

    pub fn steps(&self) -> u16 {
        self.steps
    }

    /// 1ステップのスキャン結果を反映
    pub fn record(&mut self, detected: bool) -> StepVerdict {
        self.steps = self.steps.saturating_add(1);
        if detected {
            self.consecutive_miss = 0;
            self.consecutive_ok = self.consecutive_ok.saturating_add(1);
            if self.consecutive_ok >= self.tuning.startup_ok_required {
                return StepVerdict::Confirmed;
            }
        } else {
            self.consecutive_ok = 0;
            self.consecutive_miss = self.consecutive_miss.saturating_add(1);
            if self.consecutive_miss > self.tuning.startup_fail_bound {
                return StepVerdict::Failed;
            }
        }
        StepVerdict::Continue
    }

    /// 次のステップへ加速
    pub fn accelerate(&mut self) {
        let next = self.step_ticks as u32 * self.tuning.accel_factor as u32 / 256;
        self.step_ticks = saturate16(next).max(self.tuning.min_step_ticks);
    }

    /// スキャンのタイムアウト
    ///
    /// 確認数が少ないうちはスタンプの最下位ビットで半分に縮め、回転子と
    /// 強制転流が同じ位相で噛み合ったまま抜けられなくなるのを防ぐ。
    pub fn scan_timeout(&self, remaining: u16, at: Stamp) -> u16 {
        if self.consecutive_ok < defaults::RANDOMIZE_BELOW_OK && at.0 & 1 == 0 {
            remaining / 2
        } else {
            remaining
        }
    }

    /// 1回の始動試行
    ///
    /// 呼び出し前にPWM制御値（起動デューティ、方向）を設定しておくこと。
    pub fn run<H: EscHal + ?Sized>(
        &mut self,
        hal: &mut H,
        shared: &SharedState,
        driver: &PhaseDriver,
        phase: &mut CommPhase,
        high_frequency_pwm: bool,
    ) -> AttemptOutcome {
        loop {
            match shared.throttle() {
                ThrottleCommand::SignalLost => return AttemptOutcome::Aborted(StopReason::SignalLost),
                t if t.is_stop() => return AttemptOutcome::Aborted(StopReason::ThrottleStop),
                _ => {}
            }

            *phase = phase.next();
            drive_phase(hal, shared, driver, *phase);
            let started = hal.now();
            let step = self.step_ticks;

            // 転流直後はブランキング
            let blank = step / 4;
            hal.schedule_timeout(blank);
            hal.wait_for_timeout();

            let ctx = ScanContext {
                period4x: step.saturating_mul(4),
                startup: true,
                high_frequency_pwm,
                startup_noise_gap: self.tuning.startup_noise_gap,
            };
            let edge = driver.pattern(*phase).edge;
            let timeout = self.scan_timeout(step - blank, started);
            let scan = await_zero_cross(hal, shared, edge, timeout, &ctx);

            match self.record(scan.detected()) {
                StepVerdict::Confirmed => {
                    debug!("Startup confirmed after {} steps, step={}", self.steps, step);
                    return AttemptOutcome::Confirmed {
                        period4x: step.saturating_mul(4),
                        zero_cross: scan.stamp(),
                    };
                }
                StepVerdict::Failed => {
                    debug!("Startup attempt failed after {} steps", self.steps);
                    return AttemptOutcome::Failed;
                }
                StepVerdict::Continue => {}
            }

            // ステップ周期の残り
            let elapsed = hal.elapsed_since(started);
            if elapsed < step as u32 {
                hal.schedule_timeout(step - elapsed as u16);
                hal.wait_for_timeout();
            }
            self.accelerate();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn start() -> SteppedStart {
        SteppedStart::new(&Tuning::default())
    }

    #[test]
    fn test_acceleration_profile() {
        let mut s = start();
        let mut last = s.step_ticks();
        assert_eq!(last, defaults::INITIAL_STEP_TICKS);
        for _ in 0..100 {
            s.accelerate();
            assert!(s.step_ticks() <= last);
            last = s.step_ticks();
        }
        assert_eq!(last, defaults::MIN_STEP_TICKS);
    }

    #[test]
    fn test_confirmation_needs_consecutive_reads() {
        let mut s = start();
        for _ in 0..defaults::OK_REQUIRED - 1 {
            assert_eq!(s.record(true), StepVerdict::Continue);
        }
        // 1回でも外れたら数え直し
        assert_eq!(s.record(false), StepVerdict::Continue);
        for _ in 0..defaults::OK_REQUIRED - 1 {
            assert_eq!(s.record(true), StepVerdict::Continue);
        }
        assert_eq!(s.record(true), StepVerdict::Confirmed);
    }

    #[test]
    fn test_failure_bound() {
        let mut s = start();
        for _ in 0..defaults::FAIL_BOUND {
            assert_eq!(s.record(false), StepVerdict::Continue);
        }
        assert_eq!(s.record(false), StepVerdict::Failed);
    }

    #[test]
    fn test_scan_timeout_randomisation() {
        let mut s = start();
        assert_eq!(s.scan_timeout(1_000, Stamp(2)), 500);
        assert_eq!(s.scan_timeout(1_000, Stamp(3)), 1_000);
        for _ in 0..defaults::RANDOMIZE_BELOW_OK {
            s.record(true);
        }
        assert_eq!(s.scan_timeout(1_000, Stamp(2)), 1_000);
    }
}
