//! モーター制御タスク
//!
//! アイドル中は `poll_idle` の指示どおりに待ち、始動要求が出たら停止まで
//! 転流ループを回す。転流ループは割り込み待ちのビジーループなので、
//! このタスクはスレッドモードの最低優先度エグゼキュータで動かす。

use embassy_time::{Duration, Timer};
use g4_esc::{Esc, IdleStatus, Settings};

use crate::motor_driver::Board;
use crate::state::SHARED;

#[embassy_executor::task]
pub async fn motor_control_task(board: Board, settings: Settings) {
    info!("Motor control task started");

    let mut esc = Esc::with_settings(board, &SHARED, settings);

    loop {
        match esc.poll_idle() {
            IdleStatus::Wait { ms } => {
                Timer::after(Duration::from_millis(ms as u64)).await;
            }
            IdleStatus::Start => {
                let reason = esc.run_motor();
                info!("Run ended ({:?}): {:?}", reason, esc.stats());
                // 転流中は他のスレッドモードタスクが止まっているので一度譲る
                embassy_futures::yield_now().await;
            }
        }
    }
}
