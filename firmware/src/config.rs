//! 設定モジュール
//!
//! ボード固有の定数と、ESC設定コードの永続化機能を提供します。

pub mod eeprom;
pub mod params;
pub mod storage;

pub use params::*;

pub use storage::StoredConfig;

pub use eeprom::load_or_initialize_config;
