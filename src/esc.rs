//! ESCコントローラ
//!
//! 転流ループが所有する状態（フェーズ、周期、ガバナー、制限値、状態遷移）を
//! 1つの構造体にまとめる。割り込みと共有するフィールドは `SharedState` 経由でのみ触る。
//!
//! ## 1転流ステップ
//! 1. スキャン待ち（7.5°）
//! 2. ゼロクロス待ち
//! 3. 周期更新、転流待ちを予約、ランスロット処理、デマグ判定
//! 4. 転流待ち → 転流
//! 5. 進角待ち

use crate::comm_timing::{CommTiming, WaitSchedule};
use crate::governor::Governor;
use crate::limiter::PowerLimiter;
use crate::params::{
    protection, startup_pwm, Direction, ParamError, Params, Settings, HOUSEKEEPING_PERIOD_MS,
};
use crate::phase::{CommPhase, PhaseDriver, PwmGate, SwitchBank};
use crate::sequencer::{transition, BeepPattern, Effects, EscEvent, EscState, StopReason};
use crate::shared::{PwmControl, SharedState, ThrottleCommand};
use crate::startup::{AttemptOutcome, SteppedStart};
use crate::timing::{delay_ticks, ms_to_ticks, saturate16, CommTimer, Stamp};
use crate::zero_cross::{await_zero_cross, Comparator, ScanContext, ZcScan};

/// ビープ（または代替の信号出力）
pub trait Beeper {
    /// 信号要求（ブロックしないこと）
    fn signal(&mut self, pattern: BeepPattern);
}

/// コントローラが必要とするハードウェア
pub trait EscHal: SwitchBank + Comparator + CommTimer + Beeper {}

impl<T> EscHal for T where T: SwitchBank + Comparator + CommTimer + Beeper + ?Sized {}

/// アイドル時のポーリング結果
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum IdleStatus {
    /// 指定時間後に再度ポーリング
    Wait { ms: u32 },
    /// 始動する（`run_motor` を呼ぶ）
    Start,
}

/// 運転統計
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct RunStats {
    pub commutations: u32,
    pub demag_events: u32,
    pub power_cuts: u32,
    pub zc_timeouts: u32,
    pub startup_failures: u32,
}

/// 統計をログに出す間隔 [回転]
const STATS_LOG_REVOLUTIONS: u32 = 4096;

/// アイドル中の時間管理
#[derive(Debug, Clone, Copy)]
struct IdleTracker {
    stop_since: Option<Stamp>,
    start_since: Option<Stamp>,
    lost_since: Option<Stamp>,
    idle_since: Stamp,
    last_beacon: Option<Stamp>,
    guard: Option<(Stamp, u32)>,
    /// 逆転停止後は停止指令なしで再アーミングする
    rearm_any: bool,
    /// アーミング待ち中の最大スロットル
    arm_peak: u8,
}

impl IdleTracker {
    fn new(now: Stamp) -> Self {
        Self {
            stop_since: None,
            start_since: None,
            lost_since: None,
            idle_since: now,
            last_beacon: None,
            guard: None,
            rearm_any: false,
            arm_peak: 0,
        }
    }

    fn restart(&mut self, now: Stamp) {
        self.stop_since = None;
        self.start_since = None;
        self.lost_since = None;
        self.idle_since = now;
        self.last_beacon = None;
    }

    fn held_ms(since: &mut Option<Stamp>, now: Stamp) -> u32 {
        let start = *since.get_or_insert(now);
        crate::timing::ticks_to_ms(now.ticks_since(start))
    }

    fn guard_expired(&self, now: Stamp) -> bool {
        match self.guard {
            Some((at, ms)) => now.ticks_since(at) >= ms_to_ticks(ms),
            None => true,
        }
    }
}

/// 運転中のカウンタ
#[derive(Debug, Clone, Copy)]
struct RunCounters {
    slot: u8,
    last_housekeeping: Stamp,
    stop_ticks: u8,
    lost_ticks: u8,
    rotations_left: u8,
    revolutions: u32,
    braking: bool,
    demag_enabled: bool,
    duty: u8,
    schedule: WaitSchedule,
}

impl RunCounters {
    fn new(now: Stamp, rotations: u8) -> Self {
        Self {
            slot: 0,
            last_housekeeping: now,
            stop_ticks: 0,
            lost_ticks: 0,
            rotations_left: rotations,
            revolutions: 0,
            braking: false,
            demag_enabled: false,
            duty: 0,
            schedule: WaitSchedule {
                comm: 0,
                advance: 0,
                zc_scan: 0,
                zc_timeout: 0,
            },
        }
    }
}

/// 転流（PWM割り込みへのフェーズ公開とスイッチ切り替えを一括で行う）
pub(crate) fn drive_phase<H: SwitchBank + ?Sized>(
    hal: &mut H,
    shared: &SharedState,
    driver: &PhaseDriver,
    phase: CommPhase,
) {
    critical_section::with(|_| {
        let mut control = PwmControl::new();
        shared.update_pwm_control(|c| {
            c.phase = phase;
            c.power_cut = false;
            control = *c;
        });
        if control.braking {
            driver.brake(hal);
            hal.select_comparator(driver.pattern(phase).floating);
        } else {
            let gate = PwmGate {
                pwm_on: shared.pwm_status().on,
                drive_low: control.drives_low_side(),
                damped: control.damped,
            };
            driver.set_phase(hal, phase, gate);
        }
    });
}

/// ESCコントローラ
pub struct Esc<'a, H: EscHal> {
    hal: H,
    shared: &'a SharedState,
    settings: Settings,
    state: EscState,
    driver: PhaseDriver,
    phase: CommPhase,
    timing: CommTiming,
    governor: Governor,
    limiter: PowerLimiter,
    idle: IdleTracker,
    run: RunCounters,
    stats: RunStats,
}

impl<'a, H: EscHal> Esc<'a, H> {
    /// パラメータを検証してコントローラを作る
    pub fn new(hal: H, shared: &'a SharedState, params: &Params) -> Result<Self, ParamError> {
        let settings = params.decode()?;
        Ok(Self::with_settings(hal, shared, settings))
    }

    pub fn with_settings(mut hal: H, shared: &'a SharedState, settings: Settings) -> Self {
        let reversed = settings.direction == Direction::Reversed;
        let driver = PhaseDriver::new(reversed);
        driver.power_off(&mut hal);
        shared.update_pwm_control(|c| {
            *c = PwmControl::new();
            c.damped = settings.pwm_mode.damped();
            c.reversed = reversed;
        });

        let now = hal.now();
        hal.signal(BeepPattern::PowerOn);
        info!(
            "ESC ready: timing={} pwm={:?} direction={:?}",
            settings.comm_timing,
            settings.pwm_mode,
            settings.direction
        );

        Self {
            timing: CommTiming::new(settings.tuning),
            governor: Governor::new(&settings),
            limiter: PowerLimiter::new(&settings),
            idle: IdleTracker::new(now),
            run: RunCounters::new(now, settings.tuning.initial_run_rotations),
            stats: RunStats::default(),
            phase: CommPhase::Phase6,
            state: EscState::PowerOnWait,
            driver,
            settings,
            shared,
            hal,
        }
    }

    pub fn state(&self) -> EscState {
        self.state
    }

    pub fn settings(&self) -> &Settings {
        &self.settings
    }

    pub fn phase(&self) -> CommPhase {
        self.phase
    }

    pub fn timing(&self) -> &CommTiming {
        &self.timing
    }

    pub fn governor(&self) -> &Governor {
        &self.governor
    }

    pub fn limiter(&self) -> &PowerLimiter {
        &self.limiter
    }

    pub fn stats(&self) -> RunStats {
        self.stats
    }

    /// 直近に適用したデューティ
    pub fn duty(&self) -> u8 {
        self.run.duty
    }

    pub fn hal(&self) -> &H {
        &self.hal
    }

    pub fn hal_mut(&mut self) -> &mut H {
        &mut self.hal
    }

    /// 状態遷移と副作用の実行
    fn dispatch(&mut self, event: EscEvent) -> bool {
        let Some((next, effects)) = transition(self.state, event) else {
            trace!("Ignored {:?} in {:?}", event, self.state);
            return false;
        };
        info!("{:?} -> {:?} ({:?})", self.state, next, event);
        self.apply(effects);
        self.state = next;
        true
    }

    fn apply(&mut self, effects: Effects) {
        if effects.power_off {
            self.driver.power_off(&mut self.hal);
            self.shared.update_pwm_control(|c| {
                c.spinning = false;
                c.duty = 0;
                c.power_cut = false;
                c.braking = false;
            });
        }
        if effects.reset_run_state {
            self.governor.reset();
            self.limiter.stop();
            self.run = RunCounters::new(self.hal.now(), self.settings.tuning.initial_run_rotations);
        }
        let now = self.hal.now();
        if effects.restart_guard {
            let mut ms = self.settings.restart_delay_ms;
            if effects.reversal_delay {
                ms += protection::REVERSAL_DELAY_MS;
                self.idle.rearm_any = true;
            }
            self.idle.guard = Some((now, ms));
            self.idle.restart(now);
        }
        if let Some(pattern) = effects.beep {
            self.hal.signal(pattern);
        }
    }

    fn stop(&mut self, reason: StopReason) -> StopReason {
        match reason {
            StopReason::ThrottleStop | StopReason::Reversal => info!("Motor stopped: {:?}", reason),
            _ => warn!("Motor stopped: {:?} period4x={}", reason, self.timing.period4x()),
        }
        self.dispatch(reason.event());
        reason
    }

    /// アイドル中のポーリング（PowerOnWait / Armed / Stopped）
    ///
    /// 経過時間は転流タイマーで測るので、呼び出し間隔は一定でなくてよい。
    pub fn poll_idle(&mut self) -> IdleStatus {
        let wait = IdleStatus::Wait {
            ms: protection::IDLE_POLL_MS,
        };
        let now = self.hal.now();
        let throttle = self.shared.throttle();

        match throttle {
            ThrottleCommand::Duty { duty: 0, .. } | ThrottleCommand::SignalLost => {
                self.idle.start_since = None;
            }
            ThrottleCommand::Duty { .. } => {
                self.idle.idle_since = now;
                self.idle.last_beacon = None;
            }
        }

        match self.state {
            EscState::PowerOnWait => {
                if let ThrottleCommand::Duty { duty, .. } = throttle {
                    self.idle.arm_peak = self.idle.arm_peak.max(duty);
                }
                let armable = match throttle {
                    ThrottleCommand::SignalLost => false,
                    ThrottleCommand::Duty { duty, .. } => duty == 0 || self.idle.rearm_any,
                };
                if !armable {
                    self.idle.stop_since = None;
                } else if IdleTracker::held_ms(&mut self.idle.stop_since, now) >= protection::ARM_MS
                {
                    self.idle.stop_since = None;
                    self.idle.rearm_any = false;
                    // スロットルを動かさずに再アーミングしたら前回の目標を使う
                    if self.idle.arm_peak > 0 {
                        self.governor.set_arm_target(self.idle.arm_peak);
                        self.idle.arm_peak = 0;
                    }
                    self.limiter.arm(self.shared.supply());
                    self.dispatch(EscEvent::StopHeld);
                }
            }
            EscState::Armed => match throttle {
                ThrottleCommand::SignalLost => {
                    let limit_ms = protection::SIGNAL_TIMEOUT_TICKS as u32 * HOUSEKEEPING_PERIOD_MS;
                    if IdleTracker::held_ms(&mut self.idle.lost_since, now) >= limit_ms {
                        self.dispatch(EscEvent::SignalTimeout);
                    }
                }
                ThrottleCommand::Duty { duty, reverse } => {
                    self.idle.lost_since = None;
                    if duty > 0
                        && IdleTracker::held_ms(&mut self.idle.start_since, now)
                            >= protection::START_FILTER_MS
                        && self.idle.guard_expired(now)
                    {
                        self.idle.start_since = None;
                        self.set_direction(reverse);
                        if self.dispatch(EscEvent::StartRequested) {
                            return IdleStatus::Start;
                        }
                    }
                }
            },
            EscState::Stopped => {
                if throttle.is_stop() {
                    self.dispatch(EscEvent::StopAcknowledged);
                }
            }
            _ => return IdleStatus::Start,
        }

        self.beacon(now);
        wait
    }

    fn beacon(&mut self, now: Stamp) {
        if !matches!(self.state, EscState::PowerOnWait | EscState::Armed) {
            return;
        }
        let Some(delay_ms) = self.settings.beacon_delay_ms else {
            return;
        };
        if now.ticks_since(self.idle.idle_since) < ms_to_ticks(delay_ms) {
            return;
        }
        let due = match self.idle.last_beacon {
            Some(at) => now.ticks_since(at) >= ms_to_ticks(protection::BEACON_INTERVAL_MS),
            None => true,
        };
        if due {
            self.idle.last_beacon = Some(now);
            self.hal.signal(BeepPattern::Beacon);
        }
    }

    fn set_direction(&mut self, reverse: bool) {
        let reversed = match self.settings.direction {
            Direction::Normal => false,
            Direction::Reversed => true,
            Direction::Bidirectional => reverse,
        };
        self.driver.set_reversed(reversed);
        self.shared.update_pwm_control(|c| c.reversed = reversed);
    }

    fn scan_context(&self) -> ScanContext {
        ScanContext {
            period4x: self.timing.period4x(),
            startup: self.state.is_startup(),
            high_frequency_pwm: self.settings.pwm_mode.high_frequency(),
            startup_noise_gap: self.settings.tuning.startup_noise_gap,
        }
    }

    /// ステップ始動から閉ループ1ステップ目まで
    ///
    /// `poll_idle` が `Start` を返した後に呼ぶ。
    pub fn start(&mut self) -> Result<(), StopReason> {
        if self.state != EscState::SteppedStart {
            warn!("start() called in {:?}", self.state);
            return Err(StopReason::ThrottleStop);
        }

        let tuning = self.settings.tuning;
        let mut power_index = self.settings.startup_power_index;
        let mut failures = 0u8;

        loop {
            let pwm = startup_pwm(power_index);
            self.limiter.reset_for_start(pwm);
            let duty = self.limiter.apply(pwm);
            self.run.duty = duty;
            self.shared.update_pwm_control(|c| {
                c.duty = duty;
                c.spinning = true;
                c.braking = false;
                c.power_cut = false;
            });
            debug!("Startup attempt {}: pwm={}", failures + 1, duty);

            let mut attempt = SteppedStart::new(&tuning);
            let outcome = attempt.run(
                &mut self.hal,
                self.shared,
                &self.driver,
                &mut self.phase,
                self.settings.pwm_mode.high_frequency(),
            );

            match outcome {
                AttemptOutcome::Confirmed {
                    period4x,
                    zero_cross,
                } => {
                    self.dispatch(EscEvent::StartupConfirmed);
                    self.timing.reset(period4x, zero_cross);
                    self.run = RunCounters::new(self.hal.now(), tuning.initial_run_rotations);
                    if let ThrottleCommand::Duty { duty, .. } = self.shared.throttle() {
                        self.governor.spool_request(duty);
                    }
                    self.schedule_commutation(zero_cross);
                    self.hal.wait_for_timeout();
                    self.advance();
                    return Ok(());
                }
                AttemptOutcome::Failed => {
                    failures = failures.saturating_add(1);
                    self.stats.startup_failures += 1;
                    if failures >= self.settings.startup_retries {
                        return Err(self.stop(StopReason::StartupFailed));
                    }
                    self.dispatch(EscEvent::StartupRetry);
                    delay_ticks(&mut self.hal, ms_to_ticks(crate::params::startup::SETTLE_MS));
                    power_index = power_index.saturating_add(1);
                }
                AttemptOutcome::Aborted(reason) => return Err(self.stop(reason)),
            }
        }
    }

    /// 始動してから停止するまで運転する
    pub fn run_motor(&mut self) -> StopReason {
        if let Err(reason) = self.start() {
            return reason;
        }
        loop {
            if let Some(reason) = self.commutate_step() {
                return reason;
            }
        }
    }

    /// 閉ループの1転流ステップ
    ///
    /// モーターが止まったら停止理由を返す（状態は遷移済み）。
    pub fn commutate_step(&mut self) -> Option<StopReason> {
        if !matches!(self.state, EscState::InitialRun | EscState::NormalRun) {
            return None;
        }

        self.hal.schedule_timeout(self.run.schedule.zc_scan);
        self.hal.wait_for_timeout();

        // 初期ラン中は交差前レベルを待たずに長いタイムアウトを使う
        let timeout = if self.state.is_startup() {
            self.timing.period4x()
        } else {
            self.run.schedule.zc_timeout
        };
        let ctx = self.scan_context();
        let edge = self.driver.pattern(self.phase).edge;
        let scan = await_zero_cross(&mut self.hal, self.shared, edge, timeout, &ctx);

        if let Some(reason) = self.on_scan(scan) {
            return Some(self.stop(reason));
        }
        self.hal.wait_for_timeout();
        self.advance();
        None
    }

    /// ゼロクロス（またはタイムアウト）後の処理。転流待ちを予約して戻る。
    fn on_scan(&mut self, scan: ZcScan) -> Option<StopReason> {
        if !scan.detected() {
            self.stats.zc_timeouts += 1;
            if !scan.demag && !self.run.braking {
                return Some(StopReason::SyncLost);
            }
        }
        if scan.demag {
            self.stats.demag_events += 1;
        }

        self.timing.on_zero_cross(scan.stamp());
        self.schedule_commutation(scan.stamp());

        let cut = self
            .timing
            .on_demag(scan.demag, self.settings.demag_comp, self.run.demag_enabled);
        if cut && !self.run.braking {
            self.shared.update_pwm_control(|c| c.power_cut = true);
            self.driver.cut_low_side(&mut self.hal);
            self.stats.power_cuts += 1;
        }

        let stop = self.run_slot();
        self.publish_duty();
        stop
    }

    /// 次の待ち時間を計算し、ゼロクロス起点で転流待ちを予約
    fn schedule_commutation(&mut self, zero_cross: Stamp) {
        self.run.schedule = self
            .timing
            .compute_wait_schedule(self.settings.comm_timing, self.settings.pwm_mode.damped());
        let since = saturate16(self.hal.elapsed_since(zero_cross));
        let comm = self.run.schedule.comm.saturating_sub(since).max(1);
        self.hal.schedule_timeout(comm);
    }

    /// 転流して進角待ち
    fn advance(&mut self) {
        self.phase = self.phase.next();
        drive_phase(&mut self.hal, self.shared, &self.driver, self.phase);
        self.stats.commutations = self.stats.commutations.wrapping_add(1);
        self.run.slot = (self.run.slot + 1) % 6;

        self.hal.schedule_timeout(self.run.schedule.advance);
        self.hal.wait_for_timeout();
    }

    /// 1回転を6スロットに分けた処理
    fn run_slot(&mut self) -> Option<StopReason> {
        let period4x = self.timing.period4x();
        let startup = self.state.is_startup();

        match self.run.slot {
            0 => {
                let throttle = self.governor.command();
                self.governor
                    .update_activation(throttle, startup || self.run.braking, period4x);
            }
            1 => {
                self.governor
                    .update(period4x, self.run.duty, self.limiter.pwm_limit());
            }
            2 => {
                self.limiter.update_low_rpm(period4x, startup);
                self.run.demag_enabled = self.limiter.demag_enabled(period4x, self.run.duty, startup);
            }
            3 => {
                let elapsed = self.hal.elapsed_since(self.run.last_housekeeping);
                let period = ms_to_ticks(HOUSEKEEPING_PERIOD_MS);
                if elapsed >= period {
                    self.run.last_housekeeping = if elapsed >= 2 * period {
                        self.hal.now()
                    } else {
                        self.run.last_housekeeping.offset(period)
                    };
                    return self.housekeeping();
                }
            }
            5 => return self.end_of_revolution(period4x),
            _ => {}
        }
        None
    }

    /// 32ms周期の処理（スロットル、信号ロスト、スプールアップ、電源監視）
    fn housekeeping(&mut self) -> Option<StopReason> {
        match self.shared.throttle() {
            ThrottleCommand::SignalLost => {
                self.run.lost_ticks = self.run.lost_ticks.saturating_add(1);
                if self.run.lost_ticks >= protection::SIGNAL_TIMEOUT_TICKS {
                    return Some(StopReason::SignalLost);
                }
            }
            ThrottleCommand::Duty { duty, reverse } => {
                self.run.lost_ticks = 0;
                if duty == 0 {
                    self.run.stop_ticks = self.run.stop_ticks.saturating_add(1);
                    if self.state.is_startup() || self.run.stop_ticks >= self.settings.rc_stop_limit {
                        return Some(StopReason::ThrottleStop);
                    }
                } else {
                    self.run.stop_ticks = 0;
                }

                if self.settings.direction == Direction::Bidirectional
                    && duty > 0
                    && reverse != self.driver.is_reversed()
                {
                    if self.state.is_startup() {
                        return Some(StopReason::Reversal);
                    }
                    if !self.run.braking {
                        info!("Direction change: braking");
                        self.run.braking = true;
                        self.governor.deactivate();
                        self.shared.update_pwm_control(|c| {
                            c.braking = true;
                            c.duty = 0;
                        });
                        self.driver.brake(&mut self.hal);
                    }
                }
                self.governor.spool_request(duty);
            }
        }

        self.limiter.housekeeping(
            self.shared.supply(),
            self.governor.output(),
            self.governor.is_active(),
        );
        None
    }

    /// 回転ごとの停止判定と初期ランの回転数
    fn end_of_revolution(&mut self, period4x: u16) -> Option<StopReason> {
        self.run.revolutions = self.run.revolutions.wrapping_add(1);

        if self.run.braking {
            if period4x > protection::BRAKE_STOP_PERIOD4X {
                return Some(StopReason::Reversal);
            }
        } else if period4x > protection::STALL_PERIOD4X {
            return Some(StopReason::Stall);
        }

        if self.state == EscState::InitialRun {
            self.run.rotations_left = self.run.rotations_left.saturating_sub(1);
            if self.run.rotations_left == 0 {
                self.dispatch(EscEvent::RotationsDone);
            }
        }

        if self.run.revolutions % STATS_LOG_REVOLUTIONS == 0 {
            info!(
                "period4x={} duty={} limit={} demag={} cuts={}",
                period4x,
                self.run.duty,
                self.limiter.pwm_limit(),
                self.timing.demag_metric(),
                self.stats.power_cuts
            );
        }
        None
    }

    /// 制限後のデューティをPWM割り込みに公開
    fn publish_duty(&mut self) {
        let duty = if self.run.braking {
            0
        } else {
            self.limiter.apply(self.governor.output())
        };
        self.run.duty = duty;
        self.shared.update_pwm_control(|c| c.duty = duty);
    }
}
