//! TIM3ベースのソフトウェアPWM
//!
//! 周期の頭（Update）でオン、CC1一致でオフのエッジを出し、それぞれ
//! `g4_esc::phase::pwm_edge` でその時点の転流フェーズのローサイドを操作する。
//! デューティは周期の頭で共有状態から読み直す。

use embassy_stm32::pac;
use embassy_stm32::time::Hertz;
use g4_esc::phase::pwm_edge;

use crate::comm_timer;
use crate::config::pwm::{IRQ_PRIORITY, TIMER_CLOCK};
use crate::motor_driver::FetBank;
use crate::state::SHARED;

/// TIM3の初期化
///
/// # Safety
/// PACを使用した直接的なレジスタ操作を含むため、unsafe。
/// `motor_driver::init_gate_pins` の後に呼ぶこと。
pub unsafe fn init_pwm_timer(frequency: Hertz) {
    let rcc = pac::RCC;
    let tim3 = pac::TIM3;

    rcc.apb1enr1().modify(|w| w.set_tim3en(true));

    tim3.cr1().modify(|w| w.set_cen(false));
    tim3.psc().write_value(0);
    tim3.arr().write(|w| w.set_arr(period_ticks(frequency)));
    tim3.ccr(0).modify(|w| w.set_ccr(0));

    tim3.dier().modify(|w| {
        w.set_uie(true);
        w.set_ccie(0, true);
    });

    unsafe {
        cortex_m::peripheral::NVIC::unmask(pac::Interrupt::TIM3);
        let mut cp = cortex_m::Peripherals::steal();
        cp.NVIC.set_priority(pac::Interrupt::TIM3, IRQ_PRIORITY);
    }

    tim3.cnt().write_value(pac::timer::regs::CntCore(0));
    tim3.egr().write(|w| w.set_ug(true));
    tim3.sr().write(|w| w.0 = 0);
    tim3.cr1().modify(|w| {
        w.set_cen(true);
        w.set_urs(pac::timer::vals::Urs::COUNTER_ONLY);
    });
}

/// PWM周期 [タイマーティック]
fn period_ticks(frequency: Hertz) -> u16 {
    (TIMER_CLOCK.0 / frequency.0).saturating_sub(1).min(u16::MAX as u32) as u16
}

/// デューティ（0-255）→ コンペア値
#[inline(always)]
fn compare_value(duty: u8, period: u16) -> u16 {
    (duty as u32 * period as u32 / 255) as u16
}

/// TIM3割り込みハンドラー（Update + Capture/Compare 1）
///
/// # Safety
/// 割り込みコンテキストで実行されるため、処理は最小限にする
#[inline(always)]
pub unsafe fn tim3_irq_handler() {
    let tim3 = pac::TIM3;
    let sr = tim3.sr().read();
    let control = SHARED.pwm_control();
    let mut fets = unsafe { FetBank::new() };

    // 周期の頭：オンエッジ
    if sr.uif() {
        tim3.sr().modify(|w| w.set_uif(false));
        let period = tim3.arr().read().arr();
        tim3.ccr(0).modify(|w| w.set_ccr(compare_value(control.duty, period)));
        if control.duty > 0 {
            pwm_edge(&mut fets, &control, true);
            SHARED.record_pwm_edge(true, comm_timer::now());
        }
    }

    // コンペア一致：オフエッジ
    if sr.ccif(0) {
        tim3.sr().modify(|w| w.set_ccif(0, false));
        if control.duty < u8::MAX {
            pwm_edge(&mut fets, &control, false);
            SHARED.record_pwm_edge(false, comm_timer::now());
        }
    }
}

/// TIM3割り込みのRust側エントリーポイント
#[allow(non_snake_case)]
#[no_mangle]
pub unsafe extern "C" fn TIM3() {
    tim3_irq_handler();
}
