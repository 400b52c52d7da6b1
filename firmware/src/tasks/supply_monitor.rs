//! 電源監視タスク
//!
//! バス電圧と基板温度を100msごとに読み、共有状態に書き込みます。

use embassy_stm32::adc::{Adc, AnyAdcChannel};
use embassy_stm32::peripherals;
use embassy_time::{Duration, Ticker};

use crate::config::supply::PERIOD_MS;
use crate::state::SHARED;
use crate::supply_monitor::{SupplyMonitor, SupplyMonitorConfig};

/// ログ間隔 [監視周期]
const LOG_INTERVAL: u32 = 50;

#[embassy_executor::task]
pub async fn supply_monitor_task(
    mut adc: Adc<'static, peripherals::ADC2>,
    mut voltage_pin: AnyAdcChannel<peripherals::ADC2>,
    mut thermistor_pin: AnyAdcChannel<peripherals::ADC2>,
) {
    info!("Supply monitor task started");

    let mut monitor = SupplyMonitor::new(SupplyMonitorConfig::default());

    // 初回の読み値でフィルタを初期化
    let voltage_raw = adc.blocking_read(&mut voltage_pin);
    let temperature_raw = adc.blocking_read(&mut thermistor_pin);
    let sample = monitor.initialize_with_adc(voltage_raw, temperature_raw);
    SHARED.set_supply(sample);
    info!(
        "Initial supply: {}mV, {}C (ADC raw: {}, {})",
        sample.millivolts, sample.temperature_c, voltage_raw, temperature_raw
    );

    let mut ticker = Ticker::every(Duration::from_millis(PERIOD_MS));
    let mut log_counter = 0u32;

    loop {
        ticker.next().await;

        let voltage_raw = adc.blocking_read(&mut voltage_pin);
        let temperature_raw = adc.blocking_read(&mut thermistor_pin);
        let sample = monitor.update(voltage_raw, temperature_raw);
        SHARED.set_supply(sample);

        log_counter += 1;
        if log_counter >= LOG_INTERVAL {
            log_counter = 0;
            debug!("[Supply] {}mV, {}C", sample.millivolts, sample.temperature_c);
        }
    }
}
