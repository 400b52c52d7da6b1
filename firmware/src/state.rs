//! グローバル共有状態
//!
//! 割り込みハンドラとタスクが共有する状態。中身はクリティカルセクションで保護される。

use embassy_sync::blocking_mutex::raw::CriticalSectionRawMutex;
use embassy_sync::channel::Channel;
use g4_esc::{BeepPattern, SharedState};

/// PWM制御値、スロットル指令、電源サンプル
pub static SHARED: SharedState = SharedState::new();

/// 表示パターン（モーター制御 → 表示タスク）
pub static SIGNALS: Channel<CriticalSectionRawMutex, BeepPattern, 4> = Channel::new();
