//! 電源電圧・基板温度の監視
//!
//! PC1（分圧回路）からバス電圧、PC2（NTCサーミスタ）から基板温度を読み、
//! ローパスフィルタをかけて `SupplySample` にまとめます。
//! 低電圧・過温度の判定と出力制限はESCコアのリミッター側で行う。

use g4_esc::SupplySample;

use crate::config::{supply, thermistor};

/// 監視パラメータ
pub struct SupplyMonitorConfig {
    /// 分圧抵抗の上側 [Ω]
    pub r_upper: f32,
    /// 分圧抵抗の下側 [Ω]
    pub r_lower: f32,
    /// ADC分解能（12ビット = 4096）
    pub adc_max: u16,
    /// ADC基準電圧 [V]
    pub vref: f32,
    /// ローパスフィルタ係数（0.0-1.0、大きいほど応答速度が速い）
    pub filter_alpha: f32,
    /// サーミスタの25°C抵抗 [Ω]
    pub ntc_r25: f32,
    /// サーミスタのB定数 [K]
    pub ntc_beta: f32,
    /// サーミスタの直列抵抗 [Ω]
    pub ntc_series: f32,
}

impl Default for SupplyMonitorConfig {
    fn default() -> Self {
        Self {
            // V_bus = V_adc * (33.3k + 3.3k) / 3.3k = V_adc * 11.09
            r_upper: supply::R_UPPER,
            r_lower: supply::R_LOWER,
            adc_max: supply::ADC_MAX,
            vref: supply::VREF,
            filter_alpha: supply::FILTER_ALPHA,
            ntc_r25: thermistor::R25,
            ntc_beta: thermistor::BETA,
            ntc_series: thermistor::R_SERIES,
        }
    }
}

/// 電源監視コントローラ
pub struct SupplyMonitor {
    config: SupplyMonitorConfig,
    voltage: f32,
    temperature: f32,
}

const KELVIN_25C: f32 = 298.15;
const KELVIN_0C: f32 = 273.15;

impl SupplyMonitor {
    pub fn new(config: SupplyMonitorConfig) -> Self {
        Self {
            config,
            voltage: 0.0,
            temperature: 25.0,
        }
    }

    /// ADC生値からバス電圧 [V] を計算
    fn adc_to_voltage(&self, adc_raw: u16) -> f32 {
        let v_adc = (adc_raw as f32 / self.config.adc_max as f32) * self.config.vref;
        let divider_ratio = (self.config.r_upper + self.config.r_lower) / self.config.r_lower;
        v_adc * divider_ratio
    }

    /// ADC生値から温度 [°C] を計算（B定数式）
    ///
    /// NTCは下側。`R_ntc = R_series * raw / (max - raw)`、
    /// `1/T = 1/T25 + ln(R_ntc / R25) / B`
    fn adc_to_temperature(&self, adc_raw: u16) -> f32 {
        let max = self.config.adc_max as f32;
        let raw = (adc_raw as f32).clamp(1.0, max - 1.0);
        let r_ntc = self.config.ntc_series * raw / (max - raw);
        let inv_t = 1.0 / KELVIN_25C + libm::logf(r_ntc / self.config.ntc_r25) / self.config.ntc_beta;
        1.0 / inv_t - KELVIN_0C
    }

    /// フィルタを初回の読み値で初期化（起動直後の誤判定防止）
    pub fn initialize_with_adc(&mut self, voltage_raw: u16, temperature_raw: u16) -> SupplySample {
        self.voltage = self.adc_to_voltage(voltage_raw);
        self.temperature = self.adc_to_temperature(temperature_raw);
        self.sample()
    }

    /// 新しい読み値でフィルタを更新
    pub fn update(&mut self, voltage_raw: u16, temperature_raw: u16) -> SupplySample {
        let alpha = self.config.filter_alpha;
        self.voltage = alpha * self.adc_to_voltage(voltage_raw) + (1.0 - alpha) * self.voltage;
        self.temperature =
            alpha * self.adc_to_temperature(temperature_raw) + (1.0 - alpha) * self.temperature;
        self.sample()
    }

    /// 現在のフィルタ値
    pub fn sample(&self) -> SupplySample {
        SupplySample {
            millivolts: libm::roundf(self.voltage * 1000.0).clamp(0.0, u16::MAX as f32) as u16,
            temperature_c: libm::roundf(self.temperature).clamp(-40.0, 150.0) as i16,
        }
    }
}
