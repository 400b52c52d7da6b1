//! 割り込みコンテキストと共有する状態
//!
//! メインループが所有する状態のうち、割り込みハンドラ（PWM、RC入力、監視タスク）と
//! 共有するフィールドだけをここに置く。各フィールドはクリティカルセクションで保護された
//! `Cell` に入れ、読み書きは値のコピー単位で行う。

use core::cell::Cell;

use embassy_sync::blocking_mutex::raw::CriticalSectionRawMutex;
use embassy_sync::blocking_mutex::Mutex;

use crate::phase::CommPhase;
use crate::timing::Stamp;

/// メインループ → PWM割り込み
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct PwmControl {
    /// 制限後のデューティ（0-255）
    pub duty: u8,
    /// 現在の転流フェーズ
    pub phase: CommPhase,
    /// ダンプドモード（PWMオフ期間に同じレグのハイサイドをオン）
    pub damped: bool,
    /// 回転方向反転（A相とC相を入れ替え）
    pub reversed: bool,
    /// デマグによる電力カット中（次の転流まで）
    pub power_cut: bool,
    /// 方向転換ブレーキ中（全ハイサイドオン、PWMは何もしない）
    pub braking: bool,
    /// モーター駆動中
    pub spinning: bool,
}

impl PwmControl {
    pub const fn new() -> Self {
        Self {
            duty: 0,
            phase: CommPhase::Phase1,
            damped: false,
            reversed: false,
            power_cut: false,
            braking: false,
            spinning: false,
        }
    }

    /// ローサイドをオンにしてよいか
    #[inline(always)]
    pub fn drives_low_side(&self) -> bool {
        self.spinning && !self.braking && !self.power_cut && self.duty > 0
    }
}

impl Default for PwmControl {
    fn default() -> Self {
        Self::new()
    }
}

/// PWM割り込み → メインループ
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct PwmStatus {
    /// PWMオン期間中か
    pub on: bool,
    /// 最後のPWMエッジのスタンプ
    pub last_edge: Stamp,
}

impl PwmStatus {
    pub const fn new() -> Self {
        Self {
            on: true,
            last_edge: Stamp(0),
        }
    }
}

impl Default for PwmStatus {
    fn default() -> Self {
        Self::new()
    }
}

/// スロットル指令（RCパルスデコーダの出力）
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum ThrottleCommand {
    /// 正規化済みデューティ 0-255 と方向（双方向モードのみ有効）
    Duty { duty: u8, reverse: bool },
    /// 入力信号なし
    SignalLost,
}

impl ThrottleCommand {
    /// 正転デューティ指令
    pub const fn forward(duty: u8) -> Self {
        Self::Duty {
            duty,
            reverse: false,
        }
    }

    /// 停止指令（デューティ0）か
    pub fn is_stop(&self) -> bool {
        matches!(self, Self::Duty { duty: 0, .. })
    }
}

/// 電源監視サンプル（フィルタ済み）
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct SupplySample {
    /// バス電圧 [mV]
    pub millivolts: u16,
    /// 温度 [°C]
    pub temperature_c: i16,
}

impl SupplySample {
    pub const fn new() -> Self {
        Self {
            millivolts: 0,
            temperature_c: 25,
        }
    }
}

impl Default for SupplySample {
    fn default() -> Self {
        Self::new()
    }
}

/// 割り込み共有状態
pub struct SharedState {
    pwm_control: Mutex<CriticalSectionRawMutex, Cell<PwmControl>>,
    pwm_status: Mutex<CriticalSectionRawMutex, Cell<PwmStatus>>,
    throttle: Mutex<CriticalSectionRawMutex, Cell<ThrottleCommand>>,
    supply: Mutex<CriticalSectionRawMutex, Cell<Option<SupplySample>>>,
}

impl SharedState {
    pub const fn new() -> Self {
        Self {
            pwm_control: Mutex::new(Cell::new(PwmControl::new())),
            pwm_status: Mutex::new(Cell::new(PwmStatus::new())),
            throttle: Mutex::new(Cell::new(ThrottleCommand::SignalLost)),
            supply: Mutex::new(Cell::new(None)),
        }
    }

    /// PWM制御値を読む（PWM割り込みから）
    #[inline(always)]
    pub fn pwm_control(&self) -> PwmControl {
        self.pwm_control.lock(|c| c.get())
    }

    /// PWM制御値を書き換える（メインループから）
    #[inline(always)]
    pub fn update_pwm_control(&self, f: impl FnOnce(&mut PwmControl)) {
        self.pwm_control.lock(|c| {
            let mut value = c.get();
            f(&mut value);
            c.set(value);
        });
    }

    /// PWMエッジを記録（PWM割り込みから）
    #[inline(always)]
    pub fn record_pwm_edge(&self, on: bool, at: Stamp) {
        self.pwm_status.lock(|c| c.set(PwmStatus { on, last_edge: at }));
    }

    /// 最後のPWMエッジ
    #[inline(always)]
    pub fn pwm_status(&self) -> PwmStatus {
        self.pwm_status.lock(|c| c.get())
    }

    /// スロットル指令を書き込む（RC入力から）
    pub fn set_throttle(&self, command: ThrottleCommand) {
        self.throttle.lock(|c| c.set(command));
    }

    /// 最新のスロットル指令
    pub fn throttle(&self) -> ThrottleCommand {
        self.throttle.lock(|c| c.get())
    }

    /// 電源監視値を書き込む
    pub fn set_supply(&self, sample: SupplySample) {
        self.supply.lock(|c| c.set(Some(sample)));
    }

    /// 最新の電源監視値（未測定ならNone）
    pub fn supply(&self) -> Option<SupplySample> {
        self.supply.lock(|c| c.get())
    }
}

impl Default for SharedState {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_initial_state_is_safe() {
        let shared = SharedState::new();
        let ctl = shared.pwm_control();
        assert!(!ctl.spinning);
        assert!(!ctl.drives_low_side());
        assert_eq!(shared.throttle(), ThrottleCommand::SignalLost);
        assert!(shared.supply().is_none());
    }

    #[test]
    fn test_update_pwm_control() {
        let shared = SharedState::new();
        shared.update_pwm_control(|c| {
            c.duty = 120;
            c.spinning = true;
        });
        assert!(shared.pwm_control().drives_low_side());

        shared.update_pwm_control(|c| c.power_cut = true);
        assert!(!shared.pwm_control().drives_low_side());
    }

    #[test]
    fn test_throttle_stop() {
        assert!(ThrottleCommand::forward(0).is_stop());
        assert!(!ThrottleCommand::forward(1).is_stop());
        assert!(!ThrottleCommand::SignalLost.is_stop());
    }
}
