//! ESC状態遷移テーブル
//!
//! 状態遷移は (状態, イベント) → (次の状態, 副作用) の純粋関数。
//! 副作用の実行は `esc` モジュールが担う。

/// ESCの状態
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum EscState {
    /// 電源投入後、有効な停止指令を待っている
    PowerOnWait,
    /// アーミング済み、始動指令待ち
    Armed,
    /// オープンループ始動
    SteppedStart,
    /// 閉ループ、スプールアップ制限中
    InitialRun,
    /// 通常運転
    NormalRun,
    /// 始動失敗で停止（スロットルが停止位置に戻るまでラッチ）
    Stopped,
}

impl EscState {
    /// モーターを駆動している状態か
    pub fn is_running(self) -> bool {
        matches!(
            self,
            EscState::SteppedStart | EscState::InitialRun | EscState::NormalRun
        )
    }

    /// 始動中（ガバナー・デマグ補償を使わない）か
    pub fn is_startup(self) -> bool {
        matches!(self, EscState::SteppedStart | EscState::InitialRun)
    }
}

/// 状態遷移イベント
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum EscEvent {
    /// 停止指令がアーミング時間続いた
    StopHeld,
    /// 始動指令（フィルタ済み、再始動禁止時間経過後）
    StartRequested,
    /// 入力信号ロスト
    SignalTimeout,
    /// 始動中に必要数のゼロクロスを確認
    StartupConfirmed,
    /// 始動試行に失敗、再試行する
    StartupRetry,
    /// 始動の再試行回数を使い切った
    StartupExhausted,
    /// 初期ランの回転数を消化
    RotationsDone,
    /// 停止指令が継続した
    ThrottleStop,
    /// 回転方向の反転要求
    Reversal,
    /// 周期が停止判定を超えた
    Stall,
    /// 説明のつかないゼロクロスタイムアウト
    SyncLost,
    /// 停止ラッチ中にスロットルが停止位置に戻った
    StopAcknowledged,
}

/// 停止理由
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum StopReason {
    ThrottleStop,
    SignalLost,
    Stall,
    SyncLost,
    Reversal,
    StartupFailed,
}

impl StopReason {
    /// 停止理由に対応する遷移イベント
    pub fn event(self) -> EscEvent {
        match self {
            StopReason::ThrottleStop => EscEvent::ThrottleStop,
            StopReason::SignalLost => EscEvent::SignalTimeout,
            StopReason::Stall => EscEvent::Stall,
            StopReason::SyncLost => EscEvent::SyncLost,
            StopReason::Reversal => EscEvent::Reversal,
            StopReason::StartupFailed => EscEvent::StartupExhausted,
        }
    }
}

/// ビープ音（LED等の信号）パターン
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum BeepPattern {
    PowerOn,
    Armed,
    Beacon,
    SignalLost,
    StartupFailed,
}

/// 遷移に伴う副作用
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct Effects {
    /// 全スイッチオフ
    pub power_off: bool,
    /// デューティ・ガバナー・制限値をゼロに戻す
    pub reset_run_state: bool,
    /// 再始動禁止時間を開始
    pub restart_guard: bool,
    /// 逆転時の追加待ち
    pub reversal_delay: bool,
    pub beep: Option<BeepPattern>,
}

impl Effects {
    const NONE: Effects = Effects {
        power_off: false,
        reset_run_state: false,
        restart_guard: false,
        reversal_delay: false,
        beep: None,
    };

    /// モーター停止時の共通処理
    const MOTOR_OFF: Effects = Effects {
        power_off: true,
        reset_run_state: true,
        restart_guard: true,
        reversal_delay: false,
        beep: None,
    };

    const fn beep(self, pattern: BeepPattern) -> Effects {
        Effects {
            beep: Some(pattern),
            ..self
        }
    }
}

/// 状態遷移
///
/// 定義されていない組み合わせは `None`（状態を変えない）。
pub fn transition(state: EscState, event: EscEvent) -> Option<(EscState, Effects)> {
    use EscEvent::*;
    use EscState::*;

    let next = match (state, event) {
        (PowerOnWait, StopHeld) => (Armed, Effects::NONE.beep(BeepPattern::Armed)),

        (Armed, StartRequested) => (SteppedStart, Effects::NONE),
        (Armed, SignalTimeout) => (
            PowerOnWait,
            Effects::MOTOR_OFF.beep(BeepPattern::SignalLost),
        ),

        (SteppedStart, StartupConfirmed) => (InitialRun, Effects::NONE),
        (SteppedStart, StartupRetry) => (
            SteppedStart,
            Effects {
                power_off: true,
                ..Effects::NONE
            },
        ),
        (SteppedStart, StartupExhausted) => (
            Stopped,
            Effects::MOTOR_OFF.beep(BeepPattern::StartupFailed),
        ),

        (InitialRun, RotationsDone) => (NormalRun, Effects::NONE),

        (SteppedStart | InitialRun | NormalRun, ThrottleStop | Stall | SyncLost) => {
            (PowerOnWait, Effects::MOTOR_OFF)
        }
        (SteppedStart | InitialRun | NormalRun, SignalTimeout) => (
            PowerOnWait,
            Effects::MOTOR_OFF.beep(BeepPattern::SignalLost),
        ),
        (SteppedStart | InitialRun | NormalRun, Reversal) => (
            PowerOnWait,
            Effects {
                reversal_delay: true,
                ..Effects::MOTOR_OFF
            },
        ),

        (Stopped, StopAcknowledged) => (PowerOnWait, Effects::NONE),

        _ => return None,
    };
    Some(next)
}

#[cfg(test)]
mod tests {
    use super::*;

    const ALL_STATES: [EscState; 6] = [
        EscState::PowerOnWait,
        EscState::Armed,
        EscState::SteppedStart,
        EscState::InitialRun,
        EscState::NormalRun,
        EscState::Stopped,
    ];

    const ALL_EVENTS: [EscEvent; 12] = [
        EscEvent::StopHeld,
        EscEvent::StartRequested,
        EscEvent::SignalTimeout,
        EscEvent::StartupConfirmed,
        EscEvent::StartupRetry,
        EscEvent::StartupExhausted,
        EscEvent::RotationsDone,
        EscEvent::ThrottleStop,
        EscEvent::Reversal,
        EscEvent::Stall,
        EscEvent::SyncLost,
        EscEvent::StopAcknowledged,
    ];

    #[test]
    fn test_happy_path() {
        let (s, e) = transition(EscState::PowerOnWait, EscEvent::StopHeld).unwrap();
        assert_eq!(s, EscState::Armed);
        assert_eq!(e.beep, Some(BeepPattern::Armed));
        let (s, _) = transition(s, EscEvent::StartRequested).unwrap();
        assert_eq!(s, EscState::SteppedStart);
        let (s, _) = transition(s, EscEvent::StartupConfirmed).unwrap();
        assert_eq!(s, EscState::InitialRun);
        let (s, _) = transition(s, EscEvent::RotationsDone).unwrap();
        assert_eq!(s, EscState::NormalRun);
    }

    #[test]
    fn test_every_motor_off_cuts_power() {
        for state in ALL_STATES {
            for event in ALL_EVENTS {
                if let Some((next, effects)) = transition(state, event) {
                    if state.is_running() && !next.is_running() {
                        assert!(effects.power_off, "{:?} {:?}", state, event);
                        assert!(effects.reset_run_state);
                        assert!(effects.restart_guard);
                    }
                }
            }
        }
    }

    #[test]
    fn test_run_failures_return_to_power_on_wait() {
        for state in [EscState::InitialRun, EscState::NormalRun] {
            for event in [
                EscEvent::Stall,
                EscEvent::SyncLost,
                EscEvent::ThrottleStop,
                EscEvent::SignalTimeout,
            ] {
                let (next, _) = transition(state, event).unwrap();
                assert_eq!(next, EscState::PowerOnWait);
            }
        }
    }

    #[test]
    fn test_reversal_adds_delay() {
        let (next, effects) = transition(EscState::NormalRun, EscEvent::Reversal).unwrap();
        assert_eq!(next, EscState::PowerOnWait);
        assert!(effects.reversal_delay);
    }

    #[test]
    fn test_stopped_latches() {
        for event in ALL_EVENTS {
            let result = transition(EscState::Stopped, event);
            if event == EscEvent::StopAcknowledged {
                assert_eq!(result.map(|r| r.0), Some(EscState::PowerOnWait));
            } else {
                assert!(result.is_none());
            }
        }
    }

    #[test]
    fn test_transitions_are_one_directional() {
        // 運転状態からアイドルの Armed へ直接戻ることはない
        for state in [EscState::SteppedStart, EscState::InitialRun, EscState::NormalRun] {
            for event in ALL_EVENTS {
                if let Some((next, _)) = transition(state, event) {
                    assert_ne!(next, EscState::Armed);
                }
            }
        }
    }
}
