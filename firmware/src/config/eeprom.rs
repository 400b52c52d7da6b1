//! 設定ページの読み書き
//!
//! STM32G431VBの最終フラッシュページ（ページ63）に `StoredConfig` を1つだけ置く。

use embassy_stm32::{crc::Crc, flash::Flash, mode::Blocking};

use super::storage::StoredConfig;

/// フラッシュページサイズ（2KB）
pub const FLASH_PAGE_SIZE: usize = 2048;

/// 設定ページ番号
pub const LAST_PAGE_NUMBER: u8 = 63;

/// 設定ページの絶対アドレス（128KB - 2KB）
pub const LAST_PAGE_START: u32 = 0x0801F800;

/// `blocking_erase`/`blocking_write` はフラッシュ先頭からのオフセットを取る
const LAST_PAGE_OFFSET: u32 = LAST_PAGE_START - 0x0800_0000;

#[derive(Debug, Clone, Copy)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum EepromError {
    FlashWriteError,
    FlashEraseError,
    CrcMismatch,
    /// マジックナンバーかバージョンが違う（未書き込みページを含む）
    InvalidMagic,
    InvalidSize,
    /// CRCは正しいが設定コードが範囲外
    InvalidParams,
}

/// 設定ページをそのままコピーする
fn read_page() -> [u8; core::mem::size_of::<StoredConfig>()] {
    let mut buffer = [0u8; core::mem::size_of::<StoredConfig>()];
    let base = LAST_PAGE_START as usize;
    for (i, byte) in buffer.iter_mut().enumerate() {
        *byte = unsafe { core::ptr::read_volatile((base + i) as *const u8) };
    }
    buffer
}

/// ヘッダ → CRC → 設定コードの順に検証
fn validate(config: &StoredConfig, crc: &mut Crc) -> Result<(), EepromError> {
    if !config.validate_header() {
        warn!(
            "No ESC config: magic=0x{:08X} version={}",
            config.magic, config.version
        );
        return Err(EepromError::InvalidMagic);
    }
    if !config.verify_crc(crc) {
        error!("ESC config CRC mismatch (stored 0x{:08X})", config.crc32);
        return Err(EepromError::CrcMismatch);
    }
    config.params.decode().map(|_| ()).map_err(|e| {
        error!("ESC config codes out of range: {:?}", e);
        EepromError::InvalidParams
    })
}

/// 保存済み設定を読む
pub fn read_config(crc: &mut Crc) -> Result<StoredConfig, EepromError> {
    let config = StoredConfig::from_bytes(&read_page()).ok_or(EepromError::InvalidSize)?;
    validate(&config, crc)?;
    Ok(config)
}

/// CRCを付けて設定ページを書き直す
pub fn write_config(
    flash: &mut Flash<'_, Blocking>,
    crc: &mut Crc,
    config: &mut StoredConfig,
) -> Result<(), EepromError> {
    config.crc32 = config.calculate_crc(crc);

    flash
        .blocking_erase(LAST_PAGE_OFFSET, LAST_PAGE_OFFSET + FLASH_PAGE_SIZE as u32)
        .map_err(|e| {
            error!("Erase of page {} failed: {:?}", LAST_PAGE_NUMBER, e);
            EepromError::FlashEraseError
        })?;
    flash
        .blocking_write(LAST_PAGE_OFFSET, config.as_bytes())
        .map_err(|e| {
            error!("Write of page {} failed: {:?}", LAST_PAGE_NUMBER, e);
            EepromError::FlashWriteError
        })?;

    debug!("ESC config written: crc=0x{:08X}", config.crc32);
    Ok(())
}

pub fn initialize_default_config(
    flash: &mut Flash<'_, Blocking>,
    crc: &mut Crc,
) -> Result<StoredConfig, EepromError> {
    let mut config = StoredConfig::default();
    write_config(flash, crc, &mut config)?;
    info!("Default ESC config stored (version {})", config.version);
    Ok(config)
}

/// 保存済み設定を読み、無効ならデフォルトを書き込んで返す
///
/// 書き込みにも失敗した場合はRAM上のデフォルトで動かす。
pub fn load_or_initialize_config(flash: &mut Flash<'_, Blocking>, crc: &mut Crc) -> StoredConfig {
    if let Ok(config) = read_config(crc) {
        return config;
    }
    initialize_default_config(flash, crc).unwrap_or_else(|e| {
        error!("Default config not stored: {:?}", e);
        StoredConfig::default()
    })
}
