//! RC入力タスク
//!
//! PA0のサーボパルス幅を測り、正規化したスロットル指令を共有状態に書き込む。
//! パルス幅は転流タイマーのスタンプ（500ns）で測る。
//! 一定時間パルスが来なければ信号ロストにする。

use embassy_futures::select::{select, Either};
use embassy_stm32::exti::ExtiInput;
use embassy_time::{Duration, Timer};
use g4_esc::timing::TICK_NS;
use g4_esc::ThrottleCommand;

use crate::comm_timer;
use crate::config::rc::{
    CENTER_PULSE_US, MAX_PULSE_US, MIN_PULSE_US, SIGNAL_TIMEOUT_MS, VALID_RANGE_US,
};
use crate::state::SHARED;

#[embassy_executor::task]
pub async fn rc_input_task(mut input: ExtiInput<'static>, bidirectional: bool) {
    info!("RC input task started (bidirectional={})", bidirectional);

    let mut lost = true;
    loop {
        let timeout = Timer::after(Duration::from_millis(SIGNAL_TIMEOUT_MS));
        match select(measure_pulse(&mut input), timeout).await {
            Either::First(width_us) => match decode_pulse(width_us, bidirectional) {
                Some(command) => {
                    if lost {
                        info!("RC signal acquired: {}us", width_us);
                        lost = false;
                    }
                    SHARED.set_throttle(command);
                }
                None => trace!("Pulse out of range: {}us", width_us),
            },
            Either::Second(()) => {
                if !lost {
                    warn!("RC signal lost");
                    lost = true;
                }
                SHARED.set_throttle(ThrottleCommand::SignalLost);
            }
        }
    }
}

/// 立ち上がりから立ち下がりまでの時間 [µs]
async fn measure_pulse(input: &mut ExtiInput<'static>) -> u32 {
    input.wait_for_rising_edge().await;
    let start = comm_timer::now();
    input.wait_for_falling_edge().await;
    comm_timer::now().ticks_since(start) * TICK_NS / 1_000
}

/// パルス幅 → スロットル指令
///
/// 単方向は1000-2000µsを0-255に、双方向は1500µsを中立として両側に割り当てる。
/// 範囲外のパルスは `None`。
pub fn decode_pulse(width_us: u32, bidirectional: bool) -> Option<ThrottleCommand> {
    let (low, high) = VALID_RANGE_US;
    if !(low..=high).contains(&width_us) {
        return None;
    }
    let width = width_us.clamp(MIN_PULSE_US, MAX_PULSE_US);

    if !bidirectional {
        let duty = (width - MIN_PULSE_US) * 255 / (MAX_PULSE_US - MIN_PULSE_US);
        return Some(ThrottleCommand::forward(duty as u8));
    }

    let reverse = width < CENTER_PULSE_US;
    let span = MAX_PULSE_US - CENTER_PULSE_US;
    let duty = width.abs_diff(CENTER_PULSE_US).min(span) * 255 / span;
    Some(ThrottleCommand::Duty {
        duty: duty as u8,
        reverse,
    })
}
