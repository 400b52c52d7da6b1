//! 表示タスク
//!
//! ESCの通知（電源投入、アーミング、ビーコン等）をLEDの点滅パターンで表示します。

use embassy_stm32::gpio::Output;
use embassy_time::{Duration, Timer};
use g4_esc::BeepPattern;

use crate::state::SIGNALS;

/// (LED番号, 点灯時間ms, 消灯時間ms) の並び
fn blink_sequence(pattern: BeepPattern) -> &'static [(usize, u64, u64)] {
    match pattern {
        BeepPattern::PowerOn => &[(0, 100, 50), (1, 100, 50), (2, 100, 50)],
        BeepPattern::Armed => &[(1, 400, 100)],
        BeepPattern::Beacon => &[(2, 250, 250), (2, 250, 250)],
        BeepPattern::SignalLost => &[(0, 100, 100), (0, 100, 100), (0, 100, 100)],
        BeepPattern::StartupFailed => &[(0, 500, 100), (2, 500, 100)],
    }
}

#[embassy_executor::task]
pub async fn signal_task(mut leds: [Output<'static>; 3]) {
    info!("Signal task started");

    for led in leds.iter_mut() {
        led.set_low();
    }

    loop {
        let pattern = SIGNALS.receive().await;
        debug!("Signal: {:?}", pattern);

        for &(index, on_ms, off_ms) in blink_sequence(pattern) {
            leds[index].set_high();
            Timer::after(Duration::from_millis(on_ms)).await;
            leds[index].set_low();
            Timer::after(Duration::from_millis(off_ms)).await;
        }
    }
}
