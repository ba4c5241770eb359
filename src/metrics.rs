use prometheus::{Encoder, GaugeVec, Opts, Registry, TextEncoder};

use crate::plug::{Endpoint, PowerReading};

const NAMESPACE: &str = "plugs";

/// Prometheus gauges for every plug, in a registry owned by this struct.
pub struct Metrics {
    registry: Registry,
    power: GaugeVec,
    voltage: GaugeVec,
    current: GaugeVec,
    energy: GaugeVec,
    error: GaugeVec,
}

impl Metrics {
    pub fn new() -> Result<Self, prometheus::Error> {
        let registry = Registry::new();
        let outlet_gauge = |name: &str, help: &str| -> Result<GaugeVec, prometheus::Error> {
            let gauge = GaugeVec::new(
                Opts::new(name, help).namespace(NAMESPACE),
                &["alias", "plug_ip"],
            )?;
            registry.register(Box::new(gauge.clone()))?;
            Ok(gauge)
        };

        let power = outlet_gauge("current_power", "Realtime power draw in milliwatts")?;
        let voltage = outlet_gauge("current_voltage", "Realtime voltage in millivolts")?;
        let current = outlet_gauge("current_amperage", "Realtime current in milliamps")?;
        let energy = outlet_gauge("total_energy", "Cumulative energy in watt-hours")?;

        let error = GaugeVec::new(
            Opts::new("current_error", "1 if the last poll of the plug failed").namespace(NAMESPACE),
            &["plug_ip"],
        )?;
        registry.register(Box::new(error.clone()))?;

        Ok(Self {
            registry,
            power,
            voltage,
            current,
            energy,
            error,
        })
    }

    pub fn record_power(&self, alias: &str, endpoint: &Endpoint, reading: &PowerReading) {
        let plug_ip = endpoint.label();
        let labels = [alias, plug_ip.as_str()];
        self.power.with_label_values(&labels).set(reading.power_mw());
        self.voltage.with_label_values(&labels).set(reading.voltage_mv());
        self.current.with_label_values(&labels).set(reading.current_ma());
        self.energy.with_label_values(&labels).set(reading.total_wh());
    }

    pub fn set_error(&self, endpoint: &Endpoint, failed: bool) {
        self.error
            .with_label_values(&[endpoint.label().as_str()])
            .set(if failed { 1.0 } else { 0.0 });
    }

    /// Text exposition of every registered gauge.
    pub fn render(&self) -> Result<String, prometheus::Error> {
        let mut buffer = Vec::new();
        TextEncoder::new().encode(&self.registry.gather(), &mut buffer)?;
        String::from_utf8(buffer).map_err(|e| prometheus::Error::Msg(e.to_string()))
    }

    #[cfg(test)]
    pub(crate) fn error_flag(&self, endpoint: &Endpoint) -> f64 {
        self.error
            .with_label_values(&[endpoint.label().as_str()])
            .get()
    }

    #[cfg(test)]
    pub(crate) fn power_mw(&self, alias: &str, endpoint: &Endpoint) -> f64 {
        self.power
            .with_label_values(&[alias, endpoint.label().as_str()])
            .get()
    }
}
