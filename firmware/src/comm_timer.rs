//! TIM2ベースの転流タイマー
//!
//! 32ビットのフリーランカウンタを2MHz（1ティック = 500ns）で回し、
//! 時刻スタンプとワンショットのタイムアウトを提供します。
//!
//! ## ハードウェア構成
//! - TIM2: 32ビット汎用タイマー、クロック170MHz（APB1）
//! - PSC = 84 → 2MHz
//! - CC1: タイムアウト用のアウトプットコンペア（割り込みのみ、ピン出力なし）
//!
//! ## 動作
//! 1. `schedule_timeout` で CCR1 = CNT + ticks を設定し、保留フラグを立てる
//! 2. コンペア一致でCC1割り込みが発生し、保留フラグを下ろして割り込みを止める
//! 3. メインループは `timeout_pending` をポーリングする

use core::sync::atomic::{AtomicBool, Ordering};

use embassy_stm32::pac;
use g4_esc::timing::{CommTimer, Stamp};

use crate::config::comm_timer::{IRQ_PRIORITY, PRESCALER};

/// タイムアウト待ち中フラグ（CC1割り込みでクリア）
static TIMEOUT_PENDING: AtomicBool = AtomicBool::new(false);

/// TIM2の初期化
///
/// # Safety
/// PACを使用した直接的なレジスタ操作を含むため、unsafe
pub unsafe fn init_comm_timer() {
    let rcc = pac::RCC;
    let tim2 = pac::TIM2;

    rcc.apb1enr1().modify(|w| w.set_tim2en(true));

    tim2.cr1().modify(|w| w.set_cen(false));
    tim2.psc().write_value(PRESCALER);
    tim2.arr().write_value(u32::MAX);

    // CC1はフリーズモード（比較のみ）
    tim2.dier().write(|w| w.0 = 0);

    unsafe {
        cortex_m::peripheral::NVIC::unmask(pac::Interrupt::TIM2);
        let mut cp = cortex_m::Peripherals::steal();
        cp.NVIC.set_priority(pac::Interrupt::TIM2, IRQ_PRIORITY);
    }

    tim2.cnt().write_value(0);
    tim2.egr().write(|w| w.set_ug(true)); // プリスケーラ反映
    tim2.sr().write(|w| w.0 = 0);
    tim2.cr1().modify(|w| {
        w.set_cen(true);
        w.set_urs(pac::timer::vals::Urs::COUNTER_ONLY);
    });
}

/// 現在のカウンタ値
#[inline(always)]
pub fn now() -> Stamp {
    Stamp(pac::TIM2.cnt().read())
}

/// TIM2割り込みハンドラー（Capture/Compare 1）
///
/// # Safety
/// 割り込みコンテキストで実行されるため、処理は最小限にする
#[inline(always)]
pub unsafe fn tim2_irq_handler() {
    let tim2 = pac::TIM2;
    let sr = tim2.sr().read();

    if sr.ccif(0) {
        tim2.sr().modify(|w| w.set_ccif(0, false));
        tim2.dier().modify(|w| w.set_ccie(0, false));
        TIMEOUT_PENDING.store(false, Ordering::Release);
    }
}

/// TIM2割り込みのRust側エントリーポイント
#[allow(non_snake_case)]
#[no_mangle]
pub unsafe extern "C" fn TIM2() {
    tim2_irq_handler();
}

/// `CommTimer` の実装
///
/// コンペア値を書いた直後に一致時刻を過ぎると割り込みが来ないので、
/// 経過ティックでも満了を判定する。
pub struct CommTimerHandle {
    scheduled_at: Stamp,
    ticks: u32,
}

impl CommTimerHandle {
    pub fn new() -> Self {
        Self {
            scheduled_at: now(),
            ticks: 0,
        }
    }
}

impl CommTimer for CommTimerHandle {
    #[inline(always)]
    fn now(&mut self) -> Stamp {
        now()
    }

    fn schedule_timeout(&mut self, ticks: u16) {
        let tim2 = pac::TIM2;
        let ticks = ticks.max(1) as u32;
        critical_section::with(|_| {
            let start = tim2.cnt().read();
            self.scheduled_at = Stamp(start);
            self.ticks = ticks;
            TIMEOUT_PENDING.store(true, Ordering::Release);
            tim2.sr().modify(|w| w.set_ccif(0, false));
            tim2.ccr(0).write_value(start.wrapping_add(ticks));
            tim2.dier().modify(|w| w.set_ccie(0, true));
        });
    }

    fn timeout_pending(&mut self) -> bool {
        if !TIMEOUT_PENDING.load(Ordering::Acquire) {
            return false;
        }
        if now().ticks_since(self.scheduled_at) >= self.ticks {
            TIMEOUT_PENDING.store(false, Ordering::Release);
            pac::TIM2.dier().modify(|w| w.set_ccie(0, false));
            return false;
        }
        true
    }
}
