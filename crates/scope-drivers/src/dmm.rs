//! Built-in digital voltmeter (LeCroy and Tek `DVM` option).

use crate::driver::ScopeDriver;
use crate::family::Vendor;
use async_trait::async_trait;
use scope_core::{Multimeter, MultimeterMode, ScopeError, ScopeResult};

/// Digits the instruments display for a DVM reading.
const METER_DIGITS: u32 = 4;

fn lecroy_mode_name(mode: MultimeterMode) -> &'static str {
    match mode {
        MultimeterMode::DcVoltage => "DC",
        MultimeterMode::DcRmsAmplitude => "DC RMS",
        MultimeterMode::AcRmsAmplitude => "ACRMS",
        MultimeterMode::Frequency => "Frequency",
    }
}

fn tek_mode_name(mode: MultimeterMode) -> &'static str {
    match mode {
        MultimeterMode::DcVoltage => "DC",
        MultimeterMode::DcRmsAmplitude => "ACDCRMS",
        MultimeterMode::AcRmsAmplitude => "ACRMS",
        MultimeterMode::Frequency => "FREQUENCY",
    }
}

/// Either vendor's spelling; `None` for `OFF` and anything unknown.
fn parse_mode(text: &str) -> Option<MultimeterMode> {
    let upper: String = text
        .chars()
        .filter(|c| !c.is_whitespace())
        .collect::<String>()
        .to_ascii_uppercase();
    match upper.as_str() {
        "DC" => Some(MultimeterMode::DcVoltage),
        "DCRMS" | "ACDCRMS" => Some(MultimeterMode::DcRmsAmplitude),
        "ACRMS" => Some(MultimeterMode::AcRmsAmplitude),
        s if s.starts_with("FREQ") => Some(MultimeterMode::Frequency),
        _ => None,
    }
}

impl ScopeDriver {
    fn require_meter(&self) -> ScopeResult<()> {
        if self.options().dvm && matches!(self.vendor(), Vendor::LeCroy | Vendor::Tektronix) {
            Ok(())
        } else {
            Err(ScopeError::Unsupported(format!("multimeter on {}", self.family)))
        }
    }

    fn queue_meter_mode(&self, mode: MultimeterMode) {
        match self.vendor() {
            Vendor::LeCroy => {
                self.vbs_set("Acquisition.DVM.DvmMode", format!("\"{}\"", lecroy_mode_name(mode)))
            }
            _ => self
                .pipe
                .send_queued(format!("DVM:MODE {}", tek_mode_name(mode))),
        }
    }
}

#[async_trait]
impl Multimeter for ScopeDriver {
    async fn set_meter_mode(&self, mode: MultimeterMode) -> ScopeResult<()> {
        self.require_meter()?;
        let mut cache = self.cache.lock().await;
        cache.meter_mode = Some(mode);
        self.queue_meter_mode(mode);
        Ok(())
    }

    async fn meter_mode(&self) -> ScopeResult<MultimeterMode> {
        self.require_meter()?;
        let mut cache = self.cache.lock().await;
        if let Some(mode) = cache.meter_mode {
            return Ok(mode);
        }
        let text = match self.vendor() {
            Vendor::LeCroy => self.vbs_get("Acquisition.DVM.DvmMode").await?,
            _ => self.query_text("DVM:MODE?").await?,
        };
        // a stopped Tek meter reports OFF; it resumes in DC
        let mode = parse_mode(&text).unwrap_or_default();
        cache.meter_mode = Some(mode);
        Ok(mode)
    }

    async fn set_meter_autorange(&self, enable: bool) -> ScopeResult<()> {
        self.require_meter()?;
        let mut cache = self.cache.lock().await;
        cache.meter_autorange = Some(enable);
        match self.vendor() {
            Vendor::LeCroy => self.vbs_set(
                "Acquisition.DVM.AutoRange",
                if enable { "True" } else { "False" },
            ),
            _ => self
                .pipe
                .send_queued(format!("DVM:AUTORANGE {}", u8::from(enable))),
        }
        Ok(())
    }

    async fn meter_autorange(&self) -> ScopeResult<bool> {
        self.require_meter()?;
        let mut cache = self.cache.lock().await;
        if let Some(on) = cache.meter_autorange {
            return Ok(on);
        }
        let on = match self.vendor() {
            Vendor::LeCroy => {
                scope_scpi::parse_bool(&self.vbs_get("Acquisition.DVM.AutoRange").await?)?
            }
            _ => self.query_flag("DVM:AUTORANGE?").await?,
        };
        cache.meter_autorange = Some(on);
        Ok(on)
    }

    async fn set_meter_channel(&self, channel: usize) -> ScopeResult<()> {
        self.require_meter()?;
        let n = self.analog_number(channel)?;
        let mut cache = self.cache.lock().await;
        cache.meter_channel = Some(channel);
        match self.vendor() {
            Vendor::LeCroy => self.vbs_set("Acquisition.DVM.DvmSource", format!("\"C{}\"", n)),
            _ => self.pipe.send_queued(format!("DVM:SOURCE CH{}", n)),
        }
        Ok(())
    }

    async fn meter_channel(&self) -> ScopeResult<usize> {
        self.require_meter()?;
        let mut cache = self.cache.lock().await;
        if let Some(channel) = cache.meter_channel {
            return Ok(channel);
        }
        let text = match self.vendor() {
            Vendor::LeCroy => self.vbs_get("Acquisition.DVM.DvmSource").await?,
            _ => self.query_text("DVM:SOURCE?").await?,
        };
        let number: usize = text
            .trim_start_matches(|c: char| !c.is_ascii_digit())
            .parse()
            .map_err(|_| ScopeError::parse(&text, "meter source"))?;
        let channel = self.analog_index(number);
        cache.meter_channel = Some(channel);
        Ok(channel)
    }

    async fn start_meter(&self) -> ScopeResult<()> {
        match self.vendor() {
            Vendor::LeCroy => {
                self.require_meter()?;
                self.vbs_set("Acquisition.DVM.DvmEnable", "True");
            }
            _ => {
                // Tek has no separate enable: a mode other than OFF runs it
                let mode = self.meter_mode().await?;
                self.queue_meter_mode(mode);
            }
        }
        self.pipe.flush().await
    }

    async fn stop_meter(&self) -> ScopeResult<()> {
        self.require_meter()?;
        match self.vendor() {
            Vendor::LeCroy => self.vbs_set("Acquisition.DVM.DvmEnable", "False"),
            _ => self.pipe.send_queued("DVM:MODE OFF"),
        }
        self.pipe.flush().await
    }

    async fn meter_value(&self) -> ScopeResult<f64> {
        self.require_meter()?;
        match self.vendor() {
            Vendor::LeCroy => {
                let path = if self.meter_mode().await? == MultimeterMode::Frequency {
                    "Acquisition.DVM.Frequency"
                } else {
                    "Acquisition.DVM.Voltage"
                };
                self.vbs_f64(path).await
            }
            _ => self.query_number("DVM:MEASUREMENT:VALUE?").await,
        }
    }

    fn meter_digits(&self) -> u32 {
        METER_DIGITS
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::driver::DriverSettings;
    use crate::sim::lecroy::LeCroySim;
    use crate::sim::siglent::SiglentSim;
    use crate::sim::tek::TekSim;
    use scope_scpi::{MockHandle, MockTransport, Responder};

    async fn connect(sim: impl Responder + 'static) -> (ScopeDriver, MockHandle) {
        let transport = MockTransport::new(sim);
        let handle = transport.handle();
        let scope = ScopeDriver::connect(Box::new(transport), DriverSettings::default())
            .await
            .unwrap();
        (scope, handle)
    }

    #[test]
    fn test_parse_mode() {
        assert_eq!(parse_mode("DC"), Some(MultimeterMode::DcVoltage));
        assert_eq!(parse_mode("DC RMS"), Some(MultimeterMode::DcRmsAmplitude));
        assert_eq!(parse_mode("ACDCRMS"), Some(MultimeterMode::DcRmsAmplitude));
        assert_eq!(parse_mode("FREQuency"), Some(MultimeterMode::Frequency));
        assert_eq!(parse_mode("OFF"), None);
    }

    #[tokio::test]
    async fn test_requires_option() {
        let (scope, _) = connect(TekSim::new("MSO64", "")).await;
        assert!(matches!(
            scope.meter_value().await,
            Err(ScopeError::Unsupported(_))
        ));
        let (scope, _) = connect(SiglentSim::new("SDS2104X Plus")).await;
        assert!(scope.set_meter_mode(MultimeterMode::DcVoltage).await.is_err());
    }

    #[tokio::test]
    async fn test_tek_meter() {
        let (scope, handle) = connect(TekSim::new("MSO64", "DVM")).await;
        assert_eq!(scope.meter_mode().await.unwrap(), MultimeterMode::DcVoltage);
        scope.set_meter_channel(2).await.unwrap();
        scope.set_meter_mode(MultimeterMode::Frequency).await.unwrap();
        scope.start_meter().await.unwrap();
        assert!(handle.commands().contains(&"DVM:SOURCE CH3".to_string()));
        assert!((scope.meter_value().await.unwrap() - 1.0e6).abs() < 1e-3);

        scope.stop_meter().await.unwrap();
        assert_eq!(handle.commands().last().unwrap(), "DVM:MODE OFF");
        assert_eq!(scope.meter_digits(), 4);
    }

    #[tokio::test]
    async fn test_lecroy_meter() {
        let (scope, _) = connect(LeCroySim::new("WAVERUNNER9254M", "DVM")).await;
        assert_eq!(scope.meter_channel().await.unwrap(), 0);
        assert!((scope.meter_value().await.unwrap() - 0.3536).abs() < 1e-9);

        scope.set_meter_mode(MultimeterMode::Frequency).await.unwrap();
        scope.pipe.flush().await.unwrap();
        scope.flush_config_cache().await.unwrap();
        assert_eq!(scope.meter_mode().await.unwrap(), MultimeterMode::Frequency);
        assert!((scope.meter_value().await.unwrap() - 1.0e6).abs() < 1e-3);
    }

    #[tokio::test]
    async fn test_meter_channel_must_be_analog() {
        let (scope, _) = connect(TekSim::new("MSO64", "DVM")).await;
        let dvm = scope.channel_by_name("DVM").unwrap();
        assert!(scope.set_meter_channel(dvm).await.is_err());
    }
}
