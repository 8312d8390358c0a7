//! The sampling loop: poll each selected port until its conversion is ready, convert,
//! filter, and adjust gain, then wait before the next round.

use std::fmt;
use std::time::Duration;

use chrono::{DateTime, Local};
use mcp342x::{BusTransport, ConfigRegister, Gain, Resolution};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::autotune;
use crate::average::RollingAverage;
use crate::calibration::CalibrationTable;
use crate::conversion::{self, Reading};
use crate::registry::{DeviceRegistry, Port};
use crate::Error;

/// Loop parameters that are not part of the port wiring.
#[derive(Debug, Clone)]
pub struct SamplerOptions {
    /// Ports to sample, in order. Ports above the registry's maximum are skipped.
    pub ports: Vec<u8>,
    pub samples: u32,
    pub delay: Duration,
    pub auto_gain: bool,
    pub calibrate_v: Option<f64>,
    /// Max reads per conversion; `None` polls until the chip reports ready.
    pub poll_limit: Option<u32>,
}

/// How a run ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunOutcome {
    Completed,
    Cancelled,
}

/// One converted sample of one port.
#[derive(Debug, Clone, PartialEq)]
pub struct PortRecord {
    pub timestamp: DateTime<Local>,
    pub sample: u32,
    pub port: u8,
    pub board: u8,
    pub chip: u8,
    pub channel: u8,
    pub address: u8,
    pub resolution: Resolution,
    /// Gain the sample was taken with.
    pub gain: Gain,
    pub status: u8,
    pub tries: u32,
    pub reading: Reading,
    pub average_true_v: f64,
    pub calibrating: bool,
}

impl PortRecord {
    pub fn millivolts(&self) -> f64 {
        self.reading.volt * 1000.0
    }
}

impl fmt::Display for PortRecord {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let r = &self.reading;
        write!(
            f,
            "port: {:2}, ch:{} raw value={:7}, adcV={:<11.8}, volt={:11.7}, trueV={:11.7} \
             (RollAvgTrueV={:11.7}, mV={:13.6}, tries={:3}, bits={}, gain={}, Rl={:9.0}, trueI={:<11.8} mA",
            self.port,
            self.channel,
            r.raw_code,
            r.adc_v,
            r.volt,
            r.true_v,
            self.average_true_v,
            self.millivolts(),
            self.tries,
            self.resolution,
            self.gain,
            r.rl,
            r.true_i * 1000.0,
        )?;
        if self.calibrating {
            write!(f, ", calI={:12.8} mA", r.cal_i * 1000.0)?;
        }
        write!(f, ")")
    }
}

/// Owns the bus and all per-port state for the duration of a run.
pub struct Sampler<B> {
    bus: B,
    registry: DeviceRegistry,
    table: CalibrationTable,
    averages: Vec<RollingAverage>,
    options: SamplerOptions,
}

impl<B: BusTransport> Sampler<B> {
    pub fn new(bus: B, registry: DeviceRegistry, table: CalibrationTable, options: SamplerOptions) -> Self {
        let averages = vec![RollingAverage::default(); registry.max_port() as usize];
        Self { bus, registry, table, averages, options }
    }

    pub fn registry(&self) -> &DeviceRegistry {
        &self.registry
    }

    /// Rolling trueV average of a port, `None` before its first sample.
    pub fn average(&self, port: u8) -> Option<f64> {
        self.averages.get((port as usize).checked_sub(1)?)?.average()
    }

    /// Run all sample rounds, handing each record to `sink`.
    ///
    /// Cancellation is observed during the pause between rounds and between reads of a
    /// conversion that is not ready yet; a finished conversion is always recorded. A
    /// missing calibration entry aborts the run.
    #[tracing::instrument(skip_all, fields(samples = self.options.samples))]
    pub async fn run<F>(&mut self, cancel: &CancellationToken, mut sink: F) -> Result<RunOutcome, Error>
    where
        F: FnMut(&PortRecord),
    {
        let max_port = self.registry.max_port();
        let ports = self.options.ports.clone();
        for sample in 1..=self.options.samples {
            for &port in &ports {
                if port == 0 || port > max_port {
                    debug!("Port {} not registered (max {}), skipping", port, max_port);
                    continue;
                }
                match self.sample_port(sample, port, cancel) {
                    Ok(record) => sink(&record),
                    Err(Error::Cancelled { port }) => {
                        info!("Cancelled in sample {} while port {} was converting", sample, port);
                        return Ok(RunOutcome::Cancelled);
                    }
                    Err(e @ Error::MissingCalibration { .. }) => return Err(e),
                    Err(e) => warn!("Port {} skipped in sample {}: {}", port, sample, e),
                }
            }

            if sample == self.options.samples {
                break;
            }
            tokio::select! {
                biased;
                _ = cancel.cancelled() => {
                    info!("Cancelled after sample {}", sample);
                    return Ok(RunOutcome::Cancelled);
                }
                _ = tokio::time::sleep(self.options.delay) => {}
            }
        }
        Ok(RunOutcome::Completed)
    }

    /// Read, convert, filter and tune one port.
    fn sample_port(&mut self, sample: u32, port: u8, cancel: &CancellationToken) -> Result<PortRecord, Error> {
        let poll_limit = self.options.poll_limit;
        let calibrate_v = self.options.calibrate_v;
        let auto_gain = self.options.auto_gain;

        let entry = self.registry.get_mut(port).ok_or(Error::NoSuchPort(port))?;
        let gain = entry.state.gain;
        let tries = poll_until_ready(&mut self.bus, entry, poll_limit, cancel)?;

        let config = entry.config.register(gain);
        if !config.matches_status(entry.state.status) {
            warn!(
                "Port {} status does not match config: wrote {}, read {}",
                port,
                config,
                ConfigRegister::decode(entry.state.status)
            );
        }

        let code = mcp342x::decode_raw_code(entry.data_bytes(), entry.config.resolution)?;
        let reading = conversion::convert(
            code,
            entry.config.resolution,
            gain,
            entry.config.divider,
            &self.table,
            calibrate_v,
        )?;
        entry.state.reading = Some(reading);
        entry.state.tries = tries;

        let avg = &mut self.averages[port as usize - 1];
        avg.add(reading.true_v);
        let average_true_v = avg.average().unwrap_or(reading.true_v);

        let record = PortRecord {
            timestamp: Local::now(),
            sample,
            port,
            board: entry.config.board,
            chip: entry.config.chip,
            channel: entry.config.channel.number(),
            address: entry.config.address,
            resolution: entry.config.resolution,
            gain,
            status: entry.state.status,
            tries,
            reading,
            average_true_v,
            calibrating: calibrate_v.is_some(),
        };

        if auto_gain {
            let next = autotune::next_gain(code, entry.config.resolution, gain);
            if next != gain {
                let (lower, upper) = autotune::limits(entry.config.resolution);
                debug!("Port {} gain {} -> {} (raw {}, limits {}..{})", port, gain, next, code, lower, upper);
                entry.state.gain = next;
            }
        }

        Ok(record)
    }
}

/// Read the port until the status byte reports a finished conversion.
///
/// Returns the number of reads taken. A cancel is honoured between reads, never during one.
fn poll_until_ready<B: BusTransport>(
    bus: &mut B,
    entry: &mut Port,
    limit: Option<u32>,
    cancel: &CancellationToken,
) -> Result<u32, Error> {
    let mut tries = 0;
    loop {
        tries += 1;
        let block = entry.config.read_block(bus, entry.state.gain)?;
        entry.record_block(block);
        if !ConfigRegister::decode(entry.state.status).not_ready {
            return Ok(tries);
        }
        if limit.is_some_and(|limit| tries >= limit) {
            return Err(Error::NotReady { port: entry.config.port, tries });
        }
        if cancel.is_cancelled() {
            return Err(Error::Cancelled { port: entry.config.port });
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::calibration::TrimConstants;
    use crate::conversion::Divider;
    use crate::testing::{Response, ScriptedBus};
    use test_log::test;

    const DIVIDER: Divider = Divider { r1: 120_000.0, r2: 20_000.0 };
    const ADDRESSES: [u8; 2] = [0x68, 0x69];

    fn options(ports: &[u8], samples: u32) -> SamplerOptions {
        SamplerOptions {
            ports: ports.to_vec(),
            samples,
            delay: Duration::ZERO,
            auto_gain: false,
            calibrate_v: None,
            poll_limit: None,
        }
    }

    fn sampler(
        bus: ScriptedBus,
        resolution: Resolution,
        gain: Gain,
        options: SamplerOptions,
    ) -> Sampler<ScriptedBus> {
        let mut bus = bus;
        let registry = DeviceRegistry::build(&mut bus, &ADDRESSES, resolution, gain, DIVIDER).unwrap();
        Sampler::new(bus, registry, CalibrationTable::measured(), options)
    }

    /// Registry probing consumes one read for each of the 8 ports before the loop starts.
    fn probed(address: u8) -> ScriptedBus {
        ScriptedBus::responsive().with_code(address, 0).with_code(address, 0).with_code(address, 0).with_code(address, 0)
    }

    async fn collect<B: BusTransport>(s: &mut Sampler<B>, cancel: &CancellationToken) -> (RunOutcome, Vec<PortRecord>) {
        let mut records = Vec::new();
        let outcome = s.run(cancel, |r| records.push(r.clone())).await.unwrap();
        (outcome, records)
    }

    #[test(tokio::test)]
    async fn reference_sample_end_to_end() {
        let bus = probed(0x68).with_code(0x68, 18771);
        let mut s = sampler(bus, Resolution::Bits18, Gain::G1, options(&[1], 1));
        let (outcome, records) = collect(&mut s, &CancellationToken::new()).await;

        assert_eq!(outcome, RunOutcome::Completed);
        assert_eq!(records.len(), 1);
        let r = &records[0];
        assert_eq!((r.port, r.board, r.chip, r.channel, r.address), (1, 1, 1, 1, 0x68));
        assert_eq!(r.reading.raw_code, 18771);
        assert!((r.reading.adc_v - 0.293296875).abs() < 1e-12);
        assert!((r.reading.volt - 2.053078125).abs() < 1e-9);
        assert!((r.millivolts() - 2053.078125).abs() < 1e-6);
        assert_eq!(r.average_true_v, r.reading.true_v);
        assert_eq!(r.tries, 1);
        assert_eq!(r.gain, Gain::G1);
    }

    #[test(tokio::test)]
    async fn polls_until_ready() {
        let bus = probed(0x68)
            .with_response(0x68, Response::NotReady)
            .with_response(0x68, Response::NotReady)
            .with_code(0x68, 100);
        let mut s = sampler(bus, Resolution::Bits16, Gain::G1, options(&[1], 1));
        let (_, records) = collect(&mut s, &CancellationToken::new()).await;
        assert_eq!(records[0].tries, 3);
        assert_eq!(records[0].reading.raw_code, 100);
    }

    #[test(tokio::test)]
    async fn poll_limit_skips_stuck_port() {
        let mut bus = ScriptedBus::responsive();
        let registry = DeviceRegistry::build(&mut bus, &ADDRESSES, Resolution::Bits12, Gain::G1, DIVIDER).unwrap();
        let mut bus = bus.with_stuck_address(0x68);
        let mut opts = options(&[1, 5], 2);
        opts.poll_limit = Some(5);
        let mut s = Sampler::new(&mut bus, registry, CalibrationTable::measured(), opts);
        let (outcome, records) = collect(&mut s, &CancellationToken::new()).await;
        drop(s);

        assert_eq!(outcome, RunOutcome::Completed);
        assert_eq!(records.iter().map(|r| r.port).collect::<Vec<_>>(), vec![5, 5]);
        // 8 probes, then per sample 5 reads of port 1 and 1 of port 5
        assert_eq!(bus.reads(), 8 + 2 * 6);
    }

    #[test(tokio::test)]
    async fn unregistered_ports_not_sampled() {
        let bus = ScriptedBus::responsive().with_dead_address(0x69);
        let mut s = sampler(bus, Resolution::Bits18, Gain::G1, options(&[3, 5, 6, 4], 1));
        assert_eq!(s.registry().max_port(), 4);
        let (_, records) = collect(&mut s, &CancellationToken::new()).await;
        assert_eq!(records.iter().map(|r| r.port).collect::<Vec<_>>(), vec![3, 4]);
    }

    #[test(tokio::test)]
    async fn rolling_average_per_port() {
        let mut bus = probed(0x68);
        for code in [1000, 2000, 3000] {
            bus.push(0x68, Response::Code(code));
        }
        let mut s = sampler(bus, Resolution::Bits16, Gain::G1, options(&[1, 5], 3));
        let (_, records) = collect(&mut s, &CancellationToken::new()).await;
        let port1: Vec<_> = records.iter().filter(|r| r.port == 1).collect();
        assert_eq!(port1.len(), 3);
        let mean = port1.iter().map(|r| r.reading.true_v).sum::<f64>() / 3.0;
        assert!((port1[2].average_true_v - mean).abs() < 1e-12);
        assert!((s.average(1).unwrap() - mean).abs() < 1e-12);
        // port 5 is on the second chip and always reads 0
        assert_eq!(s.average(5), Some(0.0));
        assert_eq!(s.average(2), None);
    }

    #[test(tokio::test)]
    async fn auto_gain_steps_between_samples() {
        let mut bus = probed(0x68);
        for code in [18771, 38008, 70000] {
            bus.push(0x68, Response::Code(code));
        }
        let mut opts = options(&[1], 3);
        opts.auto_gain = true;
        let mut s = sampler(bus, Resolution::Bits18, Gain::G1, opts);
        let (_, records) = collect(&mut s, &CancellationToken::new()).await;

        let gains: Vec<_> = records.iter().map(|r| r.gain).collect();
        assert_eq!(gains, vec![Gain::G1, Gain::G2, Gain::G4]);
        assert_eq!(s.registry().get(1).unwrap().state.gain, Gain::G4);
        // each conversion is scaled with the gain it was taken at
        assert!((records[1].reading.adc_v - 38008.0 * 15.625e-6 / 2.0).abs() < 1e-12);
    }

    #[test(tokio::test)]
    async fn fixed_gain_never_changes() {
        let mut bus = probed(0x68);
        bus.push(0x68, Response::Code(10));
        bus.push(0x68, Response::Code(10));
        let mut s = sampler(bus, Resolution::Bits18, Gain::G2, options(&[1], 2));
        let (_, records) = collect(&mut s, &CancellationToken::new()).await;
        assert!(records.iter().all(|r| r.gain == Gain::G2));
    }

    #[test(tokio::test)]
    async fn cancel_between_rounds() {
        let mut s = sampler(ScriptedBus::responsive(), Resolution::Bits12, Gain::G1, options(&[1, 2], 5));
        let cancel = CancellationToken::new();
        cancel.cancel();
        let (outcome, records) = collect(&mut s, &cancel).await;
        assert_eq!(outcome, RunOutcome::Cancelled);
        // the round in progress is finished before stopping
        assert_eq!(records.len(), 2);
    }

    #[test(tokio::test)]
    async fn cancel_stops_waiting_on_stuck_port() {
        let bus = ScriptedBus::responsive().with_stuck_address(0x68);
        let mut s = sampler(bus, Resolution::Bits18, Gain::G1, options(&[5, 1, 6], 3));
        let cancel = CancellationToken::new();
        cancel.cancel();
        let (outcome, records) = collect(&mut s, &cancel).await;
        assert_eq!(outcome, RunOutcome::Cancelled);
        assert_eq!(records.iter().map(|r| r.port).collect::<Vec<_>>(), vec![5]);
    }

    #[test(tokio::test)]
    async fn stuck_port_reads_once_per_cancel_check() {
        let mut bus = ScriptedBus::responsive();
        let registry = DeviceRegistry::build(&mut bus, &ADDRESSES, Resolution::Bits18, Gain::G1, DIVIDER).unwrap();
        let mut bus = bus.with_stuck_address(0x68);
        let mut s = Sampler::new(&mut bus, registry, CalibrationTable::measured(), options(&[1], 1));
        let cancel = CancellationToken::new();
        cancel.cancel();
        let (outcome, records) = collect(&mut s, &cancel).await;
        drop(s);

        assert_eq!(outcome, RunOutcome::Cancelled);
        assert!(records.is_empty());
        // 8 probes, then the one not-ready read that preceded the cancel check
        assert_eq!(bus.reads(), 8 + 1);
    }

    #[test(tokio::test)]
    async fn status_mismatch_still_recorded() {
        // ready status reporting gain 2 while gain 1 was written
        let bus = probed(0x68).with_block(0x68, vec![0x00, 0x49, 0x53, 0x1d]);
        let mut s = sampler(bus, Resolution::Bits18, Gain::G1, options(&[1], 2));
        let (outcome, records) = collect(&mut s, &CancellationToken::new()).await;

        assert_eq!(outcome, RunOutcome::Completed);
        assert_eq!(records.len(), 2);
        assert_eq!(records[0].status, 0x1d);
        assert_eq!(records[0].reading.raw_code, 18771);
        // converted with the gain that was written
        assert_eq!(records[0].gain, Gain::G1);
        assert!((records[0].reading.adc_v - 0.293296875).abs() < 1e-12);
        assert_eq!(records[1].status, 0x1c);
    }

    #[test(tokio::test)]
    async fn missing_calibration_aborts() {
        let mut bus = ScriptedBus::responsive();
        let registry = DeviceRegistry::build(&mut bus, &ADDRESSES, Resolution::Bits16, Gain::G1, DIVIDER).unwrap();
        // no entries for 16 bits
        let mut table = CalibrationTable::empty();
        for res in [Resolution::Bits12, Resolution::Bits14, Resolution::Bits18] {
            for gain in Gain::ALL {
                table = table.with_entry(res, gain, TrimConstants { c1: 0.0, c2: 0.0, c3: 1.0e6 });
            }
        }
        let mut s = Sampler::new(bus, registry, table, options(&[1], 1));
        let err = s.run(&CancellationToken::new(), |_| {}).await.unwrap_err();
        assert_eq!(err, Error::MissingCalibration { bits: 16, gain: 1 });
    }

    #[test(tokio::test)]
    async fn bus_error_skips_port_for_one_round() {
        let mut bus = probed(0x68);
        bus.push(0x68, Response::Fail);
        bus.push(0x68, Response::Code(42));
        let mut s = sampler(bus, Resolution::Bits14, Gain::G1, options(&[1], 2));
        let (outcome, records) = collect(&mut s, &CancellationToken::new()).await;
        assert_eq!(outcome, RunOutcome::Completed);
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].sample, 2);
        assert_eq!(records[0].reading.raw_code, 42);
    }

    #[test]
    fn record_line_format() {
        let record = PortRecord {
            timestamp: Local::now(),
            sample: 1,
            port: 5,
            board: 1,
            chip: 2,
            channel: 1,
            address: 0x69,
            resolution: Resolution::Bits18,
            gain: Gain::G1,
            status: 0x1c,
            tries: 354,
            reading: Reading { raw_code: 18771, adc_v: 0.293296875, volt: 2.053078125, ..Default::default() },
            average_true_v: 0.0,
            calibrating: false,
        };
        let line = record.to_string();
        assert!(line.starts_with("port:  5, ch:1 raw value=  18771, adcV=0.29329688"), "{}", line);
        assert!(line.contains("2053.078125"), "{}", line);
        assert!(line.contains("tries=354"), "{}", line);
        assert!(!line.contains("calI"));
    }
}
