//! タイミングプリミティブ
//!
//! 500nsティックのフリーランカウンタとワンショットタイムアウトを抽象化します。
//! 上位モジュールの待ち時間はすべてこのティック単位で表現します。

/// 1ティックの長さ [ns]
pub const TICK_NS: u32 = 500;

/// 1msあたりのティック数
pub const TICKS_PER_MS: u32 = 1_000_000 / TICK_NS;

/// タイマー読み出し1回あたりのコスト [ticks]
///
/// カウンタ読み出し（バスアクセス＋比較）は測定値を常に同じ向きに偏らせるため、
/// 待ち時間の短縮項に含めて相殺する。170MHzで数十サイクル、1ティック未満。
pub const READ_OVERHEAD_TICKS: u16 = 1;

/// ワンショットタイムアウトで表現できる最大ティック数（約32.8ms）
pub const MAX_TIMEOUT_TICKS: u16 = u16::MAX;

/// ラッチしたカウンタ値
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct Stamp(pub u32);

impl Stamp {
    /// `earlier` からの経過ティック数
    ///
    /// 32ビットカウンタの1周（約35分）未満であればラップアラウンドを跨いでも正しい。
    #[inline(always)]
    pub fn ticks_since(self, earlier: Stamp) -> u32 {
        self.0.wrapping_sub(earlier.0)
    }

    /// `ticks` 後のスタンプ
    #[inline(always)]
    pub fn offset(self, ticks: u32) -> Stamp {
        Stamp(self.0.wrapping_add(ticks))
    }
}

/// 経過ティックを16ビットに飽和させる（小さい値に巻き戻らない）
#[inline(always)]
pub fn saturate16(ticks: u32) -> u16 {
    if ticks > u16::MAX as u32 {
        u16::MAX
    } else {
        ticks as u16
    }
}

/// ミリ秒をティックに変換
#[inline(always)]
pub const fn ms_to_ticks(ms: u32) -> u32 {
    ms.saturating_mul(TICKS_PER_MS)
}

/// ティックをミリ秒に変換（切り捨て）
#[inline(always)]
pub const fn ticks_to_ms(ticks: u32) -> u32 {
    ticks / TICKS_PER_MS
}

/// `wait_for_timeout` の結果
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum WaitStatus {
    /// 待機中にタイムアウトした
    Elapsed,
    /// 呼び出し時点で既にタイムアウト済み（処理が遅れている）
    AlreadyElapsed,
}

/// 転流用タイマー
///
/// `schedule_timeout` は常に直前の予約を上書きする。予約は1本だけ。
pub trait CommTimer {
    /// 現在のカウンタ値をラッチ
    fn now(&mut self) -> Stamp;

    /// ワンショットタイムアウトを予約（ノンブロッキング）
    fn schedule_timeout(&mut self, ticks: u16);

    /// 予約したタイムアウトがまだ満了していないか
    fn timeout_pending(&mut self) -> bool;

    /// 予約したタイムアウトの満了までビジーウェイト
    ///
    /// 割り込みは許可したまま待つので、PWM割り込みは遅延しない。
    fn wait_for_timeout(&mut self) -> WaitStatus {
        if !self.timeout_pending() {
            return WaitStatus::AlreadyElapsed;
        }
        while self.timeout_pending() {
            core::hint::spin_loop();
        }
        WaitStatus::Elapsed
    }

    /// ラッチ済みスタンプからの経過ティック
    fn elapsed_since(&mut self, then: Stamp) -> u32 {
        self.now().ticks_since(then)
    }
}

/// 任意長の待機（32msを超える場合は分割してタイムアウトを繰り返す）
pub fn delay_ticks<T: CommTimer + ?Sized>(timer: &mut T, ticks: u32) {
    let mut remaining = ticks;
    while remaining > 0 {
        let chunk = saturate16(remaining);
        timer.schedule_timeout(chunk);
        timer.wait_for_timeout();
        remaining -= chunk as u32;
    }
}
