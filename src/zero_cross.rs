//! ゼロクロス検出
//!
//! 非駆動相の逆起電力コンパレータをサンプリングし、PWMスイッチングノイズと
//! 転流直後のデマグ（リンギング）を除外してゼロクロスの瞬間を決める。

use crate::phase::Edge;
use crate::shared::SharedState;
use crate::timing::{CommTimer, Stamp};

/// 逆起電力コンパレータ
pub trait Comparator {
    /// 選択中のコンパレータ出力（非駆動相が中点より高ければ true）
    fn comparator_high(&mut self) -> bool;
}

/// 回転数に応じたサンプリング回数
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct ReadRequirement {
    /// 連続して必要な正しい判定の回数
    pub ok: u8,
    /// 1回の判定で読む高速サンプル数
    pub fast: u8,
}

/// 低速ほど多く読んでノイズに強くする
pub fn read_requirement(period4x: u16) -> ReadRequirement {
    let (ok, fast) = if period4x > 0x0F00 {
        (3, 3)
    } else if period4x > 0x0A00 {
        (3, 2)
    } else if period4x > 0x0500 {
        (2, 2)
    } else {
        (1, 1)
    };
    ReadRequirement { ok, fast }
}

/// スキャン条件
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ScanContext {
    pub period4x: u16,
    /// 始動中（SteppedStart / InitialRun）
    pub startup: bool,
    /// 高周波PWM
    pub high_frequency_pwm: bool,
    /// 始動中のノイズ窓 [ticks]
    pub startup_noise_gap: u16,
}

/// PWMエッジ直後に読み飛ばす時間 [ticks]
pub fn noise_gap(ctx: &ScanContext, pwm_on: bool) -> u16 {
    if ctx.startup {
        return ctx.startup_noise_gap;
    }
    let mut gap = (ctx.period4x >> 9).min(7) + 1;
    if !pwm_on {
        gap *= 2;
    }
    if ctx.high_frequency_pwm {
        gap *= 2;
    }
    gap
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum ZcOutcome {
    /// ゼロクロスを検出
    Detected(Stamp),
    /// 検出前にタイムアウト
    TimedOut(Stamp),
}

/// スキャン結果
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct ZcScan {
    pub outcome: ZcOutcome,
    /// スキャン終了時点でデマグの疑いが残っていたか
    pub demag: bool,
    /// コンパレータ読み出し回数
    pub reads: u16,
}

impl ZcScan {
    pub fn detected(&self) -> bool {
        matches!(self.outcome, ZcOutcome::Detected(_))
    }

    pub fn stamp(&self) -> Stamp {
        match self.outcome {
            ZcOutcome::Detected(s) | ZcOutcome::TimedOut(s) => s,
        }
    }
}

/// ゼロクロス待ち
///
/// 呼び出し時に `timeout` ティックのタイムアウトを予約してスキャンする。
/// 通常運転ではデマグの疑いありで開始し、交差後のレベルを先に読んだら
/// リンギングとして捨てる。交差前のレベルを初めて読んだ時点で疑いを解き、
/// タイムアウトを period4x まで延長する。
pub fn await_zero_cross<H>(
    hal: &mut H,
    shared: &SharedState,
    edge: Edge,
    timeout: u16,
    ctx: &ScanContext,
) -> ZcScan
where
    H: Comparator + CommTimer + ?Sized,
{
    hal.schedule_timeout(timeout);

    let post = edge.post_level();
    let req = read_requirement(ctx.period4x);
    let mut demag = !ctx.startup;
    let mut ok = 0u8;
    let mut reads = 0u16;

    loop {
        // 始動中は最低1回読むまでタイムアウトを無視する
        if !hal.timeout_pending() && (!ctx.startup || reads > 0) {
            return ZcScan {
                outcome: ZcOutcome::TimedOut(hal.now()),
                demag,
                reads,
            };
        }

        let pwm = shared.pwm_status();
        if hal.elapsed_since(pwm.last_edge) < noise_gap(ctx, pwm.on) as u32 {
            continue;
        }

        let mut pre_seen = false;
        for _ in 0..req.fast {
            reads = reads.saturating_add(1);
            if hal.comparator_high() != post {
                pre_seen = true;
                break;
            }
        }

        if pre_seen {
            ok = 0;
            if demag {
                demag = false;
                hal.schedule_timeout(ctx.period4x);
            }
            continue;
        }

        if demag {
            continue;
        }

        ok += 1;
        if ok >= req.ok {
            return ZcScan {
                outcome: ZcOutcome::Detected(hal.now()),
                demag,
                reads,
            };
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::timing::WaitStatus;

    /// 仮想時計とスクリプトされたコンパレータ
    struct ScriptedInput {
        now: u32,
        deadline: u32,
        /// この時刻以降は交差後レベル
        cross_at: u32,
        /// この時刻までは交差後レベル（リンギング）
        ringing_until: u32,
        edge: Edge,
    }

    impl ScriptedInput {
        fn new(edge: Edge, cross_at: u32) -> Self {
            Self {
                now: 0,
                deadline: 0,
                cross_at,
                ringing_until: 0,
                edge,
            }
        }
    }

    impl CommTimer for ScriptedInput {
        fn now(&mut self) -> Stamp {
            Stamp(self.now)
        }

        fn schedule_timeout(&mut self, ticks: u16) {
            self.deadline = self.now + ticks as u32;
        }

        fn timeout_pending(&mut self) -> bool {
            self.now += 1;
            self.now < self.deadline
        }

        fn wait_for_timeout(&mut self) -> WaitStatus {
            self.now = self.now.max(self.deadline);
            WaitStatus::Elapsed
        }
    }

    impl Comparator for ScriptedInput {
        fn comparator_high(&mut self) -> bool {
            self.now += 1;
            let post = self.edge.post_level();
            if self.now < self.ringing_until || self.now >= self.cross_at {
                post
            } else {
                !post
            }
        }
    }

    fn run_ctx(period4x: u16) -> ScanContext {
        ScanContext {
            period4x,
            startup: false,
            high_frequency_pwm: false,
            startup_noise_gap: 20,
        }
    }

    #[test]
    fn test_read_requirement_scales_with_speed() {
        assert_eq!(read_requirement(0x2000), ReadRequirement { ok: 3, fast: 3 });
        assert_eq!(read_requirement(0x0B00), ReadRequirement { ok: 3, fast: 2 });
        assert_eq!(read_requirement(0x0600), ReadRequirement { ok: 2, fast: 2 });
        assert_eq!(read_requirement(0x0300), ReadRequirement { ok: 1, fast: 1 });
    }

    #[test]
    fn test_noise_gap() {
        let mut ctx = run_ctx(0x0800);
        assert_eq!(noise_gap(&ctx, true), 5);
        assert_eq!(noise_gap(&ctx, false), 10);
        ctx.high_frequency_pwm = true;
        assert_eq!(noise_gap(&ctx, false), 20);
        ctx.period4x = 0xFFFF;
        ctx.high_frequency_pwm = false;
        assert_eq!(noise_gap(&ctx, true), 8);
        ctx.startup = true;
        assert_eq!(noise_gap(&ctx, true), 20);
    }

    #[test]
    fn test_detects_crossing_after_pre_level() {
        let shared = SharedState::new();
        for edge in [Edge::Rising, Edge::Falling] {
            let mut hal = ScriptedInput::new(edge, 300);
            let scan = await_zero_cross(&mut hal, &shared, edge, 1_000, &run_ctx(0x2000));
            assert!(scan.detected());
            assert!(!scan.demag);
            let at = scan.stamp().0;
            assert!(at >= 300 && at < 330, "detected at {}", at);
        }
    }

    #[test]
    fn test_ringing_is_rejected() {
        let shared = SharedState::new();
        let mut hal = ScriptedInput::new(Edge::Rising, 500);
        hal.ringing_until = 100;
        let scan = await_zero_cross(&mut hal, &shared, Edge::Rising, 1_000, &run_ctx(0x2000));
        assert!(scan.detected());
        assert!(scan.stamp().0 >= 500);
    }

    #[test]
    fn test_demag_for_whole_window_times_out_with_demag() {
        let shared = SharedState::new();
        // 最初から交差後レベルのまま
        let mut hal = ScriptedInput::new(Edge::Falling, 0);
        let scan = await_zero_cross(&mut hal, &shared, Edge::Falling, 200, &run_ctx(0x2000));
        assert!(!scan.detected());
        assert!(scan.demag);
    }

    #[test]
    fn test_stuck_comparator_times_out_without_demag() {
        let shared = SharedState::new();
        let mut hal = ScriptedInput::new(Edge::Rising, u32::MAX);
        let scan = await_zero_cross(&mut hal, &shared, Edge::Rising, 200, &run_ctx(0x2000));
        assert!(!scan.detected());
        assert!(!scan.demag);
        // 疑いが解けた時点でタイムアウトが period4x に延長される
        assert!(hal.now >= 0x2000);
    }

    #[test]
    fn test_startup_reads_once_before_timing_out() {
        let shared = SharedState::new();
        let mut hal = ScriptedInput::new(Edge::Rising, 0);
        let mut ctx = run_ctx(0x7F00);
        ctx.startup = true;
        // 予約済みタイムアウトが既に切れていても1回は読む
        let scan = await_zero_cross(&mut hal, &shared, Edge::Rising, 0, &ctx);
        assert!(scan.reads > 0);
    }

    #[test]
    fn test_noise_window_skips_recent_pwm_edge() {
        let shared = SharedState::new();
        let mut hal = ScriptedInput::new(Edge::Rising, 0);
        let mut ctx = run_ctx(0x0300);
        ctx.startup = true;
        shared.record_pwm_edge(true, Stamp(0));
        let scan = await_zero_cross(&mut hal, &shared, Edge::Rising, 1_000, &ctx);
        assert!(scan.detected());
        assert!(scan.stamp().0 >= 20);
    }
}
