//! ゲートドライバとコンパレータのボード実装
//!
//! 6本のゲート信号（GPIOE）をBSRRで直接操作し、逆起電力コンパレータの
//! 出力（GPIOB）をIDRから読みます。BSRRへの書き込みは単発のストアなので、
//! メインループとPWM割り込みが同じピンを触っても読み書きが競合しない。
//!
//! ## ピン配置
//! - PE9/PE8: A相 ハイ/ロー
//! - PE11/PE10: B相 ハイ/ロー
//! - PE13/PE12: C相 ハイ/ロー
//! - PB6/PB7/PB8: A/B/C相コンパレータ出力

use embassy_stm32::pac;
use g4_esc::phase::{Leg, Side, SwitchBank};
use g4_esc::timing::{CommTimer, Stamp};
use g4_esc::zero_cross::Comparator;
use g4_esc::{BeepPattern, Beeper};

use crate::comm_timer::CommTimerHandle;
use crate::config::{comparator, gate};
use crate::state::SIGNALS;

/// ゲートドライバのGPIO初期化
///
/// 全ピンをLowに落としてから出力に切り替える。
///
/// # Safety
/// PACを使用した直接的なレジスタ操作を含むため、unsafe
pub unsafe fn init_gate_pins() {
    let rcc = pac::RCC;
    let gpioe = pac::GPIOE;
    let gpiob = pac::GPIOB;

    rcc.ahb2enr().modify(|w| {
        w.set_gpioeen(true);
        w.set_gpioben(true);
    });

    for pin in [gate::A_HIGH, gate::A_LOW, gate::B_HIGH, gate::B_LOW, gate::C_HIGH, gate::C_LOW] {
        gpioe.bsrr().write(|w| w.set_br(pin, true));
        gpioe
            .ospeedr()
            .modify(|w| w.set_ospeedr(pin, pac::gpio::vals::Ospeedr::VERY_HIGH_SPEED));
        gpioe
            .pupdr()
            .modify(|w| w.set_pupdr(pin, pac::gpio::vals::Pupdr::PULL_DOWN));
        gpioe
            .moder()
            .modify(|w| w.set_moder(pin, pac::gpio::vals::Moder::OUTPUT));
    }

    for pin in [comparator::A_PIN, comparator::B_PIN, comparator::C_PIN] {
        gpiob
            .moder()
            .modify(|w| w.set_moder(pin, pac::gpio::vals::Moder::INPUT));
        gpiob
            .pupdr()
            .modify(|w| w.set_pupdr(pin, pac::gpio::vals::Pupdr::FLOATING));
    }
}

/// 6石のFETスイッチ
#[derive(Clone, Copy)]
pub struct FetBank {
    _private: (),
}

impl FetBank {
    /// # Safety
    /// `init_gate_pins` の後に呼ぶこと
    pub unsafe fn new() -> Self {
        Self { _private: () }
    }

    #[inline(always)]
    fn pin(leg: Leg, side: Side) -> usize {
        match (leg, side) {
            (Leg::A, Side::High) => gate::A_HIGH,
            (Leg::A, Side::Low) => gate::A_LOW,
            (Leg::B, Side::High) => gate::B_HIGH,
            (Leg::B, Side::Low) => gate::B_LOW,
            (Leg::C, Side::High) => gate::C_HIGH,
            (Leg::C, Side::Low) => gate::C_LOW,
        }
    }
}

impl SwitchBank for FetBank {
    #[inline(always)]
    fn set_switch(&mut self, leg: Leg, side: Side, on: bool) {
        let pin = Self::pin(leg, side);
        if on {
            pac::GPIOE.bsrr().write(|w| w.set_bs(pin, true));
        } else {
            pac::GPIOE.bsrr().write(|w| w.set_br(pin, true));
        }
    }

    #[inline(always)]
    fn dead_time(&mut self) {
        cortex_m::asm::delay(gate::DEAD_TIME_CYCLES);
    }

    // 比較器はIDRの読み出し先を切り替えるだけなので `Board` 側で持つ
    fn select_comparator(&mut self, _leg: Leg) {}
}

/// ESCコントローラに渡すボード一式
pub struct Board {
    fets: FetBank,
    timer: CommTimerHandle,
    comparator_pin: usize,
}

impl Board {
    /// # Safety
    /// `init_gate_pins` と `comm_timer::init_comm_timer` の後に呼ぶこと
    pub unsafe fn new() -> Self {
        Self {
            fets: unsafe { FetBank::new() },
            timer: CommTimerHandle::new(),
            comparator_pin: comparator::A_PIN,
        }
    }
}

impl SwitchBank for Board {
    #[inline(always)]
    fn set_switch(&mut self, leg: Leg, side: Side, on: bool) {
        self.fets.set_switch(leg, side, on);
    }

    #[inline(always)]
    fn dead_time(&mut self) {
        self.fets.dead_time();
    }

    fn select_comparator(&mut self, leg: Leg) {
        self.comparator_pin = match leg {
            Leg::A => comparator::A_PIN,
            Leg::B => comparator::B_PIN,
            Leg::C => comparator::C_PIN,
        };
    }
}

impl Comparator for Board {
    #[inline(always)]
    fn comparator_high(&mut self) -> bool {
        pac::GPIOB.idr().read().idr(self.comparator_pin) as u8 != 0
    }
}

impl CommTimer for Board {
    #[inline(always)]
    fn now(&mut self) -> Stamp {
        self.timer.now()
    }

    #[inline(always)]
    fn schedule_timeout(&mut self, ticks: u16) {
        self.timer.schedule_timeout(ticks);
    }

    #[inline(always)]
    fn timeout_pending(&mut self) -> bool {
        self.timer.timeout_pending()
    }
}

impl Beeper for Board {
    fn signal(&mut self, pattern: BeepPattern) {
        if SIGNALS.try_send(pattern).is_err() {
            warn!("Signal queue full, dropped {:?}", pattern);
        }
    }
}
