//! タスクモジュール
//!
//! 各タスクの実装を分離して管理します。

pub mod motor_control;
pub mod rc_input;
pub mod signal;
pub mod supply_monitor;

// タスク関数を再エクスポート
pub use motor_control::motor_control_task;
pub use rc_input::rc_input_task;
pub use signal::signal_task;
pub use supply_monitor::supply_monitor_task;
