//! フェーズドライバ
//!
//! 論理的な転流フェーズ（1-6）とダンプドモードから、6個のスイッチ（3レグ×ハイ/ロー）の
//! オン/オフを決める。ハイサイドは転流区間中ずっとオン、ローサイドをPWMでチョップする。
//!
//! ## 安全上の不変条件
//! 同じレグのハイサイドとローサイドを同時にオンにしない。あるレグでスイッチをオフにしてから
//! 相補側をオンにするまでには必ず `SwitchBank::dead_time` を挟む。

use crate::shared::PwmControl;

/// モーターのレグ
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum Leg {
    A,
    B,
    C,
}

impl Leg {
    pub const ALL: [Leg; 3] = [Leg::A, Leg::B, Leg::C];

    /// 逆転時のレグ入れ替え（A⇔C）
    #[inline(always)]
    pub fn mirrored(self, reversed: bool) -> Leg {
        match (self, reversed) {
            (Leg::A, true) => Leg::C,
            (Leg::C, true) => Leg::A,
            (leg, _) => leg,
        }
    }
}

/// スイッチの位置
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum Side {
    High,
    Low,
}

impl Side {
    /// 同じレグの相補スイッチ
    pub fn complement(self) -> Side {
        match self {
            Side::High => Side::Low,
            Side::Low => Side::High,
        }
    }
}

/// 非駆動相の逆起電力が中点を横切る向き
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum Edge {
    Rising,
    Falling,
}

impl Edge {
    /// ゼロクロス後にコンパレータが示すレベル
    #[inline(always)]
    pub fn post_level(self) -> bool {
        matches!(self, Edge::Rising)
    }
}

/// 転流フェーズ（ラン状態 run1..run6 と一対一）
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum CommPhase {
    Phase1,
    Phase2,
    Phase3,
    Phase4,
    Phase5,
    Phase6,
}

impl CommPhase {
    pub const ALL: [CommPhase; 6] = [
        CommPhase::Phase1,
        CommPhase::Phase2,
        CommPhase::Phase3,
        CommPhase::Phase4,
        CommPhase::Phase5,
        CommPhase::Phase6,
    ];

    /// 次のフェーズ（6の次は1）
    pub fn next(self) -> CommPhase {
        match self {
            CommPhase::Phase1 => CommPhase::Phase2,
            CommPhase::Phase2 => CommPhase::Phase3,
            CommPhase::Phase3 => CommPhase::Phase4,
            CommPhase::Phase4 => CommPhase::Phase5,
            CommPhase::Phase5 => CommPhase::Phase6,
            CommPhase::Phase6 => CommPhase::Phase1,
        }
    }

    /// フェーズ番号（1-6）
    pub fn number(self) -> u8 {
        self.index() as u8 + 1
    }

    fn index(self) -> usize {
        match self {
            CommPhase::Phase1 => 0,
            CommPhase::Phase2 => 1,
            CommPhase::Phase3 => 2,
            CommPhase::Phase4 => 3,
            CommPhase::Phase5 => 4,
            CommPhase::Phase6 => 5,
        }
    }

    /// 正転時のテーブル行
    pub fn pattern(self) -> PhasePattern {
        PHASE_TABLE[self.index()]
    }
}

/// 1フェーズ分のスイッチ割り当て
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PhasePattern {
    /// ハイサイドを常時オンにするレグ
    pub high: Leg,
    /// ローサイドをPWMでチョップするレグ
    pub chopped: Leg,
    /// 非駆動（コンパレータ監視）レグ
    pub floating: Leg,
    /// 期待するゼロクロスの向き
    pub edge: Edge,
}

impl PhasePattern {
    /// 逆転を反映したパターン
    pub fn oriented(self, reversed: bool) -> PhasePattern {
        PhasePattern {
            high: self.high.mirrored(reversed),
            chopped: self.chopped.mirrored(reversed),
            floating: self.floating.mirrored(reversed),
            edge: self.edge,
        }
    }
}

const fn row(high: Leg, chopped: Leg, floating: Leg, edge: Edge) -> PhasePattern {
    PhasePattern {
        high,
        chopped,
        floating,
        edge,
    }
}

/// 転流テーブル（正転）
const PHASE_TABLE: [PhasePattern; 6] = [
    row(Leg::B, Leg::C, Leg::A, Edge::Rising),
    row(Leg::A, Leg::C, Leg::B, Edge::Falling),
    row(Leg::A, Leg::B, Leg::C, Edge::Rising),
    row(Leg::C, Leg::B, Leg::A, Edge::Falling),
    row(Leg::C, Leg::A, Leg::B, Edge::Rising),
    row(Leg::B, Leg::A, Leg::C, Edge::Falling),
];

/// パワー段のスイッチ群
pub trait SwitchBank {
    /// 1個のスイッチをオン/オフ
    fn set_switch(&mut self, leg: Leg, side: Side, on: bool);

    /// デッドタイム待ち（ハードウェア固有、非ゼロ）
    fn dead_time(&mut self);

    /// ゼロクロス検出に使うコンパレータ入力を選択
    fn select_comparator(&mut self, leg: Leg);
}

/// 6スイッチのビットマスク
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
struct SwitchSet(u8);

impl SwitchSet {
    fn bit(leg: Leg, side: Side) -> u8 {
        let shift = match leg {
            Leg::A => 0,
            Leg::B => 2,
            Leg::C => 4,
        };
        match side {
            Side::High => 1 << shift,
            Side::Low => 2 << shift,
        }
    }

    fn with(self, leg: Leg, side: Side) -> SwitchSet {
        SwitchSet(self.0 | Self::bit(leg, side))
    }

    fn contains(self, leg: Leg, side: Side) -> bool {
        self.0 & Self::bit(leg, side) != 0
    }
}

/// `set_phase` 時点のPWM状態
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PwmGate {
    /// PWMオン期間中か
    pub pwm_on: bool,
    /// ローサイドを駆動してよいか（デューティ>0、電力カットなし）
    pub drive_low: bool,
    /// ダンプドモード
    pub damped: bool,
}

/// フェーズドライバ
#[derive(Debug, Clone, Copy)]
pub struct PhaseDriver {
    reversed: bool,
}

impl PhaseDriver {
    pub const fn new(reversed: bool) -> Self {
        Self { reversed }
    }

    /// 回転方向を設定（モーター停止中のみ呼ぶこと）
    pub fn set_reversed(&mut self, reversed: bool) {
        self.reversed = reversed;
    }

    pub fn is_reversed(&self) -> bool {
        self.reversed
    }

    /// 方向を反映したフェーズのパターン
    pub fn pattern(&self, phase: CommPhase) -> PhasePattern {
        phase.pattern().oriented(self.reversed)
    }

    fn target_set(&self, phase: CommPhase, gate: PwmGate) -> SwitchSet {
        let p = self.pattern(phase);
        let mut set = SwitchSet::default().with(p.high, Side::High);
        if gate.pwm_on {
            if gate.drive_low {
                set = set.with(p.chopped, Side::Low);
            }
        } else if gate.damped {
            set = set.with(p.chopped, Side::High);
        }
        set
    }

    /// 転流
    ///
    /// 1. 新しいフェーズで不要なスイッチをすべてオフ
    /// 2. デッドタイム
    /// 3. 新しいフェーズのスイッチをオン
    /// 4. コンパレータを非駆動レグに切り替え
    ///
    /// PWM割り込みと同じスイッチを触るため、全体をクリティカルセクション内で実行する。
    pub fn set_phase<B: SwitchBank + ?Sized>(&self, bank: &mut B, phase: CommPhase, gate: PwmGate) {
        let target = self.target_set(phase, gate);
        critical_section::with(|_| {
            for leg in Leg::ALL {
                for side in [Side::High, Side::Low] {
                    if !target.contains(leg, side) {
                        bank.set_switch(leg, side, false);
                    }
                }
            }
            bank.dead_time();
            for leg in Leg::ALL {
                for side in [Side::High, Side::Low] {
                    if target.contains(leg, side) {
                        bank.set_switch(leg, side, true);
                    }
                }
            }
            bank.select_comparator(self.pattern(phase).floating);
        });
    }

    /// 全スイッチオフ
    pub fn power_off<B: SwitchBank + ?Sized>(&self, bank: &mut B) {
        critical_section::with(|_| {
            for leg in Leg::ALL {
                bank.set_switch(leg, Side::Low, false);
                bank.set_switch(leg, Side::High, false);
            }
        });
    }

    /// デマグ電力カット（全ローサイドオフ）
    pub fn cut_low_side<B: SwitchBank + ?Sized>(&self, bank: &mut B) {
        critical_section::with(|_| {
            for leg in Leg::ALL {
                bank.set_switch(leg, Side::Low, false);
            }
        });
    }

    /// ブレーキ（全ローサイドオフ→デッドタイム→全ハイサイドオン）
    pub fn brake<B: SwitchBank + ?Sized>(&self, bank: &mut B) {
        critical_section::with(|_| {
            for leg in Leg::ALL {
                bank.set_switch(leg, Side::Low, false);
            }
            bank.dead_time();
            for leg in Leg::ALL {
                bank.set_switch(leg, Side::High, true);
            }
        });
    }
}

/// PWMエッジ処理（PWM割り込みから呼ぶ）
///
/// オンエッジ: (ダンプド時)ハイサイドオフ → デッドタイム → ローサイドオン
/// オフエッジ: ローサイドオフ → (ダンプド時)デッドタイム → ハイサイドオン
pub fn pwm_edge<B: SwitchBank + ?Sized>(bank: &mut B, control: &PwmControl, on: bool) {
    if control.braking || !control.spinning {
        return;
    }
    let leg = control
        .phase
        .pattern()
        .oriented(control.reversed)
        .chopped;

    if on {
        if control.damped {
            bank.set_switch(leg, Side::High, false);
            bank.dead_time();
        }
        if control.drives_low_side() {
            bank.set_switch(leg, Side::Low, true);
        }
    } else {
        bank.set_switch(leg, Side::Low, false);
        if control.damped {
            bank.dead_time();
            bank.set_switch(leg, Side::High, true);
        }
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;

    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub(crate) enum BankEvent {
        Switch(Leg, Side, bool),
        DeadTime,
        Comparator(Leg),
    }

    /// 操作を記録し、デッドタイム違反を検出するスイッチバンク
    #[derive(Default)]
    pub(crate) struct RecordingBank {
        pub events: Vec<BankEvent>,
        on: [[bool; 2]; 3],
        /// オフにした後まだデッドタイムを挟んでいないスイッチ
        unsettled: [[bool; 2]; 3],
        pub violations: u32,
    }

    fn leg_idx(leg: Leg) -> usize {
        match leg {
            Leg::A => 0,
            Leg::B => 1,
            Leg::C => 2,
        }
    }

    fn side_idx(side: Side) -> usize {
        match side {
            Side::High => 0,
            Side::Low => 1,
        }
    }

    impl RecordingBank {
        pub fn new() -> Self {
            Self::default()
        }

        pub fn is_on(&self, leg: Leg, side: Side) -> bool {
            self.on[leg_idx(leg)][side_idx(side)]
        }

        pub fn all_off(&self) -> bool {
            self.on.iter().all(|l| !l[0] && !l[1])
        }
    }

    impl SwitchBank for RecordingBank {
        fn set_switch(&mut self, leg: Leg, side: Side, on: bool) {
            self.events.push(BankEvent::Switch(leg, side, on));
            let l = leg_idx(leg);
            let s = side_idx(side);
            if on {
                if self.on[l][1 - s] || self.unsettled[l][1 - s] {
                    self.violations += 1;
                }
            } else if self.on[l][s] {
                self.unsettled[l][s] = true;
            }
            self.on[l][s] = on;
        }

        fn dead_time(&mut self) {
            self.events.push(BankEvent::DeadTime);
            self.unsettled = [[false; 2]; 3];
        }

        fn select_comparator(&mut self, leg: Leg) {
            self.events.push(BankEvent::Comparator(leg));
        }
    }

    fn gates() -> [PwmGate; 6] {
        let mut out = [PwmGate {
            pwm_on: true,
            drive_low: true,
            damped: false,
        }; 6];
        let mut i = 0;
        for pwm_on in [true, false] {
            for (drive_low, damped) in [(true, false), (true, true), (false, true)] {
                out[i] = PwmGate {
                    pwm_on,
                    drive_low,
                    damped,
                };
                i += 1;
            }
        }
        out
    }

    #[test]
    fn test_phase_sequence() {
        let mut phase = CommPhase::Phase1;
        for expected in [2, 3, 4, 5, 6, 1] {
            phase = phase.next();
            assert_eq!(phase.number(), expected);
        }
    }

    #[test]
    fn test_floating_leg_is_undriven() {
        for reversed in [false, true] {
            for phase in CommPhase::ALL {
                let p = phase.pattern().oriented(reversed);
                assert_ne!(p.high, p.chopped);
                assert_ne!(p.floating, p.high);
                assert_ne!(p.floating, p.chopped);
            }
        }
    }

    #[test]
    fn test_edges_alternate() {
        for phase in CommPhase::ALL {
            assert_ne!(phase.pattern().edge, phase.next().pattern().edge);
        }
    }

    #[test]
    fn test_set_phase_never_shoots_through() {
        for reversed in [false, true] {
            let driver = PhaseDriver::new(reversed);
            let mut bank = RecordingBank::new();
            for gate in gates() {
                // 全フェーズ×全ゲート状態を2周回す
                let mut phase = CommPhase::Phase1;
                for _ in 0..12 {
                    driver.set_phase(&mut bank, phase, gate);
                    phase = phase.next();
                }
            }
            assert_eq!(bank.violations, 0);
        }
    }

    #[test]
    fn test_set_phase_selects_floating_comparator() {
        let driver = PhaseDriver::new(false);
        let mut bank = RecordingBank::new();
        let gate = PwmGate {
            pwm_on: true,
            drive_low: true,
            damped: false,
        };
        driver.set_phase(&mut bank, CommPhase::Phase1, gate);
        assert_eq!(bank.events.last(), Some(&BankEvent::Comparator(Leg::A)));
        assert!(bank.is_on(Leg::B, Side::High));
        assert!(bank.is_on(Leg::C, Side::Low));

        driver.set_phase(&mut bank, CommPhase::Phase2, gate);
        assert!(!bank.is_on(Leg::B, Side::High));
        assert!(bank.is_on(Leg::A, Side::High));
        assert!(bank.is_on(Leg::C, Side::Low));
        assert_eq!(bank.events.last(), Some(&BankEvent::Comparator(Leg::B)));
    }

    #[test]
    fn test_pwm_edges_respect_dead_time() {
        let driver = PhaseDriver::new(false);
        for damped in [false, true] {
            let mut bank = RecordingBank::new();
            let mut control = PwmControl {
                duty: 128,
                damped,
                spinning: true,
                ..PwmControl::new()
            };
            for phase in CommPhase::ALL {
                control.phase = phase;
                let gate = PwmGate {
                    pwm_on: true,
                    drive_low: true,
                    damped,
                };
                driver.set_phase(&mut bank, phase, gate);
                for _ in 0..4 {
                    pwm_edge(&mut bank, &control, false);
                    pwm_edge(&mut bank, &control, true);
                }
            }
            assert_eq!(bank.violations, 0);
        }
    }

    #[test]
    fn test_damped_off_edge_turns_on_complement() {
        let mut bank = RecordingBank::new();
        let control = PwmControl {
            duty: 128,
            damped: true,
            spinning: true,
            phase: CommPhase::Phase3,
            ..PwmControl::new()
        };
        pwm_edge(&mut bank, &control, true);
        assert!(bank.is_on(Leg::B, Side::Low));
        pwm_edge(&mut bank, &control, false);
        assert!(!bank.is_on(Leg::B, Side::Low));
        assert!(bank.is_on(Leg::B, Side::High));
        assert_eq!(bank.violations, 0);
    }

    #[test]
    fn test_power_cut_blocks_low_side() {
        let mut bank = RecordingBank::new();
        let control = PwmControl {
            duty: 200,
            spinning: true,
            power_cut: true,
            ..PwmControl::new()
        };
        pwm_edge(&mut bank, &control, true);
        assert!(bank.all_off());
    }

    #[test]
    fn test_brake_and_power_off() {
        let driver = PhaseDriver::new(false);
        let mut bank = RecordingBank::new();
        let gate = PwmGate {
            pwm_on: true,
            drive_low: true,
            damped: false,
        };
        driver.set_phase(&mut bank, CommPhase::Phase4, gate);
        driver.brake(&mut bank);
        for leg in Leg::ALL {
            assert!(bank.is_on(leg, Side::High));
            assert!(!bank.is_on(leg, Side::Low));
        }
        driver.power_off(&mut bank);
        assert!(bank.all_off());
        assert_eq!(bank.violations, 0);
    }
}
