//! 設定パラメータの永続化構造体
//!
//! ESCの設定コード（`Params`）をフラッシュの最終ページに保存するための構造体

use g4_esc::Params;

/// 設定データのマジックナンバー（"ESC1"のASCII）
pub const CONFIG_MAGIC: u32 = 0x3143_5345;

/// 現在の設定バージョン
pub const CONFIG_VERSION: u16 = 2;

/// 永続化される設定構造体
///
/// サイズ制約：2KB（フラッシュページサイズ）以内
#[repr(C)]
#[derive(Debug, Clone, Copy)]
pub struct StoredConfig {
    /// マジックナンバー（データ識別用）
    pub magic: u32,

    /// 設定バージョン番号
    pub version: u16,

    /// パディング（アライメント調整）
    _padding: u16,

    /// ESC設定コード（18バイト）
    pub params: Params,

    /// 予約（フラッシュのダブルワード境界合わせ）
    _reserved: [u8; 2],

    /// CRC32チェックサム（最後に配置）
    pub crc32: u32,
}

impl StoredConfig {
    /// デフォルト設定を生成
    pub const fn default() -> Self {
        Self::with_params(Params::default())
    }

    pub const fn with_params(params: Params) -> Self {
        Self {
            magic: CONFIG_MAGIC,
            version: CONFIG_VERSION,
            _padding: 0,
            params,
            _reserved: [0; 2],
            crc32: 0,
        }
    }

    /// CRC32フィールドを除くバイト列（CRC計算用）
    pub fn as_bytes_for_crc(&self) -> &[u8] {
        let ptr = self as *const Self as *const u8;
        let total_size = core::mem::size_of::<Self>();
        let crc_size = core::mem::size_of::<u32>();
        unsafe { core::slice::from_raw_parts(ptr, total_size - crc_size) }
    }

    /// 構造体全体のバイト列（書き込み用）
    pub fn as_bytes(&self) -> &[u8] {
        let ptr = self as *const Self as *const u8;
        unsafe { core::slice::from_raw_parts(ptr, core::mem::size_of::<Self>()) }
    }

    /// バイト配列から構造体を復元
    ///
    /// 全フィールドが整数なので、どんなビット列でも値としては有効。
    /// 中身の正しさは `validate_header` と `verify_crc` で確かめる。
    pub fn from_bytes(bytes: &[u8]) -> Option<Self> {
        if bytes.len() < core::mem::size_of::<Self>() {
            return None;
        }
        let ptr = bytes.as_ptr() as *const Self;
        Some(unsafe { core::ptr::read_unaligned(ptr) })
    }

    /// マジックナンバーとバージョンを検証
    pub fn validate_header(&self) -> bool {
        self.magic == CONFIG_MAGIC && self.version == CONFIG_VERSION
    }

    /// CRC32チェックサムを計算
    pub fn calculate_crc(&self, crc: &mut embassy_stm32::crc::Crc) -> u32 {
        let words = crc_words(self.as_bytes_for_crc());
        crc.reset();
        crc.feed_words(&words[..CRC_WORDS])
    }

    /// CRC32チェックサムを検証
    pub fn verify_crc(&self, crc: &mut embassy_stm32::crc::Crc) -> bool {
        self.calculate_crc(crc) == self.crc32
    }
}

const CRC_WORDS: usize = (core::mem::size_of::<StoredConfig>() - 4).div_ceil(4);

/// リトルエンディアンの32ビットワード列に詰め直す（端数はゼロ埋め）
fn crc_words(data: &[u8]) -> [u32; CRC_WORDS] {
    let mut words = [0u32; CRC_WORDS];
    for (word, chunk) in words.iter_mut().zip(data.chunks(4)) {
        let mut bytes = [0u8; 4];
        bytes[..chunk.len()].copy_from_slice(chunk);
        *word = u32::from_le_bytes(bytes);
    }
    words
}

// コンパイル時サイズチェック
const _: () = {
    const SIZE: usize = core::mem::size_of::<StoredConfig>();
    assert!(SIZE <= 2048, "StoredConfig size exceeds flash page size");
    assert!(SIZE % 8 == 0, "StoredConfig must be a whole number of flash double words");
};
