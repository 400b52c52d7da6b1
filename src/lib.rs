//! センサレスBLDC ESC 転流制御
//!
//! 逆起電力のゼロクロスを検出して6ステップ転流を行う。ハードウェアには依存せず、
//! スイッチ・コンパレータ・タイマーをトレイト越しに操作する。
//!
//! - [`esc::Esc`]: 状態遷移と転流ループ
//! - [`phase`]: スイッチパターンとデッドタイム
//! - [`zero_cross`]: コンパレータのスキャン
//! - [`comm_timing`]: 周期推定と待ち時間
//! - [`governor`] / [`limiter`]: 出力デューティの決定
#![cfg_attr(not(test), no_std)]

mod fmt;

pub mod comm_timing;
pub mod esc;
pub mod governor;
pub mod limiter;
pub mod params;
pub mod phase;
pub mod sequencer;
pub mod shared;
pub mod startup;
pub mod timing;
pub mod zero_cross;

#[cfg(test)]
mod sim;

pub use esc::{Beeper, Esc, EscHal, IdleStatus, RunStats};
pub use params::{ParamError, Params, Settings};
pub use sequencer::{BeepPattern, EscState, StopReason};
pub use shared::{SharedState, SupplySample, ThrottleCommand};
