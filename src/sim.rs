//! テスト用のボード・モーターモデル
//!
//! 仮想時計（1ティック＝500ns）、記録用スイッチバンク、簡易ローターを持つ。
//! ローターは転流の `max(rotor_delay, 直前の転流間隔/2)` 後にゼロクロスし、
//! 進角15°の閉ループでは `4/3 × rotor_delay` の転流間隔に収束する。

use crate::esc::{Beeper, Esc, IdleStatus};
use crate::phase::tests::RecordingBank;
use crate::phase::{pwm_edge, Edge, Leg, Side, SwitchBank};
use crate::sequencer::BeepPattern;
use crate::shared::{SharedState, ThrottleCommand};
use crate::timing::{ms_to_ticks, ticks_to_ms, CommTimer, Stamp, WaitStatus};
use crate::zero_cross::Comparator;

/// 全スイッチオフがこれ以上続いた後の通電を新しい始動試行とみなす
const ATTEMPT_GAP_TICKS: u32 = 2_000;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum ComparatorMode {
    /// ローターモデルどおり
    Rotor,
    /// 交差前レベルに張り付き
    StuckPre,
    /// 10転流中9回はタイムアウトまで交差後レベル（リンギング）
    DemagNineOfTen,
    /// ブレーキ中は転流ごとに減速する
    Decelerating,
    /// ブレーキなしで少しずつ減速する（失速）
    Stalling,
}

pub(crate) struct SimBoard<'a> {
    pub bank: RecordingBank,
    shared: &'a SharedState,
    now: u32,
    deadline: u32,
    pub rotor_delay: u32,
    pub comparator: ComparatorMode,
    /// 最初のN回の始動試行はコンパレータが反応しない
    pub fail_attempts: u32,
    pub attempts: u32,
    /// PWMエッジの間隔（Noneなら割り込みを模擬しない）
    pub pwm_half_period: Option<u32>,
    pub beeps: Vec<BeepPattern>,
    pub commutations: u32,
    last_comm: Option<u32>,
    crossing_at: u32,
    edge: Edge,
    ringing: bool,
    stuck: bool,
    off_since: Option<u32>,
    pwm_on: bool,
    next_pwm_edge: u32,
    throttle: Option<Box<dyn Fn(u32) -> ThrottleCommand>>,
}

impl<'a> SimBoard<'a> {
    pub fn new(shared: &'a SharedState) -> Self {
        Self {
            bank: RecordingBank::new(),
            shared,
            now: 0,
            deadline: 0,
            rotor_delay: 2_500,
            comparator: ComparatorMode::Rotor,
            fail_attempts: 0,
            attempts: 0,
            pwm_half_period: None,
            beeps: Vec::new(),
            commutations: 0,
            last_comm: None,
            crossing_at: u32::MAX,
            edge: Edge::Rising,
            ringing: false,
            stuck: false,
            off_since: Some(0),
            pwm_on: true,
            next_pwm_edge: 0,
            throttle: None,
        }
    }

    pub fn now_ticks(&self) -> u32 {
        self.now
    }

    pub fn now_ms(&self) -> u32 {
        ticks_to_ms(self.now)
    }

    /// 経過時間[ms] → スロットル指令
    pub fn set_throttle_profile(&mut self, profile: impl Fn(u32) -> ThrottleCommand + 'static) {
        self.throttle = Some(Box::new(profile));
        self.sync_inputs();
    }

    pub fn clear_throttle_profile(&mut self) {
        self.throttle = None;
    }

    pub fn advance_ms(&mut self, ms: u32) {
        self.tick(ms_to_ticks(ms));
        self.sync_inputs();
    }

    fn sync_inputs(&mut self) {
        if let Some(profile) = &self.throttle {
            self.shared.set_throttle(profile(ticks_to_ms(self.now)));
        }
    }

    /// 時計を進め、その間のPWMエッジを処理する
    fn tick(&mut self, ticks: u32) {
        let target = self.now + ticks;
        if let Some(half) = self.pwm_half_period {
            while self.next_pwm_edge <= target {
                self.now = self.now.max(self.next_pwm_edge);
                self.pwm_on = !self.pwm_on;
                let control = self.shared.pwm_control();
                pwm_edge(&mut self.bank, &control, self.pwm_on);
                self.shared.record_pwm_edge(self.pwm_on, Stamp(self.now));
                self.next_pwm_edge += half;
            }
        }
        self.now = self.now.max(target);
    }
}

impl SwitchBank for SimBoard<'_> {
    fn set_switch(&mut self, leg: Leg, side: Side, on: bool) {
        if on {
            if let Some(since) = self.off_since.take() {
                if self.now - since >= ATTEMPT_GAP_TICKS {
                    self.attempts += 1;
                    self.stuck = self.attempts <= self.fail_attempts;
                    self.last_comm = None;
                }
            }
        }
        self.bank.set_switch(leg, side, on);
        if !on && self.off_since.is_none() && self.bank.all_off() {
            self.off_since = Some(self.now);
        }
    }

    // PWMエッジはクリティカルセクション明けまで遅らせるので、ここでは処理しない
    fn dead_time(&mut self) {
        self.bank.dead_time();
        self.now += 1;
    }

    fn select_comparator(&mut self, leg: Leg) {
        self.bank.select_comparator(leg);

        let control = self.shared.pwm_control();
        self.edge = control.phase.pattern().edge;
        let interval = self.last_comm.map_or(0, |t| self.now - t);
        self.last_comm = Some(self.now);
        self.commutations += 1;

        let delay = match self.comparator {
            ComparatorMode::Decelerating if control.braking => interval + interval / 8,
            ComparatorMode::Stalling => {
                (interval - interval / 4 + interval / 16).max(self.rotor_delay)
            }
            _ => self.rotor_delay.max(interval / 2),
        };
        self.crossing_at = self.now + delay;
        self.ringing = self.comparator == ComparatorMode::DemagNineOfTen && self.commutations % 10 != 0;
    }
}

impl Comparator for SimBoard<'_> {
    fn comparator_high(&mut self) -> bool {
        self.tick(1);
        let post = self.edge.post_level();
        if self.stuck || self.comparator == ComparatorMode::StuckPre {
            return !post;
        }
        if self.ringing || self.now >= self.crossing_at {
            post
        } else {
            !post
        }
    }
}

impl CommTimer for SimBoard<'_> {
    fn now(&mut self) -> Stamp {
        Stamp(self.now)
    }

    fn schedule_timeout(&mut self, ticks: u16) {
        self.deadline = self.now + ticks as u32;
        self.sync_inputs();
    }

    fn timeout_pending(&mut self) -> bool {
        self.tick(1);
        self.now < self.deadline
    }

    fn wait_for_timeout(&mut self) -> WaitStatus {
        if self.now >= self.deadline {
            return WaitStatus::AlreadyElapsed;
        }
        self.tick(self.deadline - self.now);
        WaitStatus::Elapsed
    }
}

impl Beeper for SimBoard<'_> {
    fn signal(&mut self, pattern: BeepPattern) {
        self.beeps.push(pattern);
    }
}

/// 始動要求が出るまでアイドルポーリングを回す
pub(crate) fn run_until_start(esc: &mut Esc<'_, SimBoard<'_>>, max_ms: u32) -> bool {
    let until = esc.hal().now_ms() + max_ms;
    while esc.hal().now_ms() < until {
        match esc.poll_idle() {
            IdleStatus::Start => return true,
            IdleStatus::Wait { ms } => esc.hal_mut().advance_ms(ms),
        }
    }
    false
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::phase::{CommPhase, PhaseDriver, PwmGate};

    #[test]
    fn test_rotor_crossing_follows_commutation() {
        let shared = SharedState::new();
        let mut board = SimBoard::new(&shared);
        let driver = PhaseDriver::new(false);
        let gate = PwmGate {
            pwm_on: true,
            drive_low: true,
            damped: false,
        };
        board.advance_ms(5);
        shared.update_pwm_control(|c| c.phase = CommPhase::Phase1);
        driver.set_phase(&mut board, CommPhase::Phase1, gate);
        assert_eq!(board.attempts, 1);

        let post = Edge::Rising.post_level();
        assert_eq!(board.comparator_high(), !post);
        board.tick(2_500);
        assert_eq!(board.comparator_high(), post);
    }

    #[test]
    fn test_pwm_edges_are_recorded() {
        let shared = SharedState::new();
        let mut board = SimBoard::new(&shared);
        board.pwm_half_period = Some(50);
        board.tick(120);
        let status = shared.pwm_status();
        assert_eq!(status.last_edge, Stamp(100));
        assert!(!status.on);
    }
}
