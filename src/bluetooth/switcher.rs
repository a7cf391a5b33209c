//! Entertainment/telephony switching loop.
//!
//! Entertainment plays for a fixed time, then a simulated outgoing call
//! interrupts it. The simulator hangs up on its own and entertainment resumes,
//! which counts as one switch. While a leg is active, every tone the simulator
//! sends must be heard back within the response budget.

use crate::bluetooth::entertainment::BluetoothEntertainment;
use crate::bluetooth::report::{EnduranceReportWriter, LatencyStats, SwitchReport};
use crate::bluetooth::simulator::{PhoneSimuHandler, SimulatorLink, SimulatorSnapshot};
use crate::bluetooth::telephone::{BluetoothTelephone, CallTransition};
use crate::clock::{Clock, SystemClock};
use crate::config::Settings;
use crate::error::{AppResult, HarnessError};
use crate::protocol::Command;
use crate::target::Target;
use log::{error, info, warn};
use std::sync::Arc;
use std::time::{Duration, Instant};

const DISCOVERY_RETRY: Duration = Duration::from_millis(500);
const DIAL_SETTLE: Duration = Duration::from_secs(2);
const TEARDOWN_SETTLE: Duration = Duration::from_secs(1);
const PLAYING: &str = "Playing";

/// Alternates entertainment playback and phone calls on the device under test,
/// validating every frequency round trip on both legs.
pub struct BluetoothServicesSwitcher {
    settings: Settings,
    link: Box<dyn SimulatorLink>,
    target: Arc<dyn Target>,
    clock: Arc<dyn Clock>,
    entertainment: BluetoothEntertainment,
    telephone: BluetoothTelephone,
    avrcp_client_address: String,
    stop_entertainment: bool,
    entertainment_active_time: Instant,
    last_activity_time: Instant,
    report: SwitchReport,
    reports: Option<EnduranceReportWriter>,
}

impl BluetoothServicesSwitcher {
    /// Connects to the simulator apps on the configured host.
    pub fn connect(settings: &Settings, target: Arc<dyn Target>) -> AppResult<Self> {
        let handler = PhoneSimuHandler::connect(settings)?;
        info!("Audio telnet log: '{}'", handler.log_path().display());
        Ok(Self::with_link(Box::new(handler), settings, target, Arc::new(SystemClock)))
    }

    /// Switcher over an existing simulator link and clock.
    pub fn with_link(
        link: Box<dyn SimulatorLink>,
        settings: &Settings,
        target: Arc<dyn Target>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        let now = clock.now();
        Self {
            entertainment: BluetoothEntertainment::new(&settings.switcher, clock.clone()),
            telephone: BluetoothTelephone::new(&settings.switcher, clock.clone()),
            settings: settings.clone(),
            link,
            target,
            clock,
            avrcp_client_address: String::new(),
            stop_entertainment: false,
            entertainment_active_time: now,
            last_activity_time: now,
            report: SwitchReport::default(),
            reports: None,
        }
    }

    /// Device address learned from the HFP app.
    pub fn hfp_client_address(&self) -> &str {
        self.telephone.hfp_client_address()
    }

    /// Device address learned from the AVRCP app.
    pub fn avrcp_client_address(&self) -> &str {
        &self.avrcp_client_address
    }

    /// Counters and latency statistics of the current run.
    pub fn report(&self) -> SwitchReport {
        SwitchReport {
            entertainment_latency: LatencyStats::from_samples(self.entertainment.latencies()),
            phone_latency: LatencyStats::from_samples(self.telephone.latencies()),
            ..self.report.clone()
        }
    }

    /// Runs `switch_count` entertainment to phone to entertainment cycles.
    ///
    /// With `assess`, the statistics are logged and a leg without any
    /// positive latency fails the run. A loop failure takes precedence over
    /// the assessment.
    pub fn switch_bluetooth_services(
        &mut self,
        media_source: &str,
        switch_count: u32,
        assess: bool,
    ) -> AppResult<SwitchReport> {
        self.entertainment.reset();
        self.entertainment.set_active(true);
        self.telephone.reset();
        self.stop_entertainment = false;
        self.report = SwitchReport::default();

        self.link.start()?;
        self.entertainment.stop_audio(self.link.as_ref())?;
        self.telephone.set_default_phone_frequency(self.link.as_ref())?;
        self.telephone.set_default_call_duration(self.link.as_ref())?;
        self.wait_for_dev_in_phonesimu()?;
        // entertainment is active after this
        self.ensure_init_in_phonesimu()?;

        let outcome = self.run_switches(media_source, switch_count);
        let report = self.report();
        if assess {
            report.log_summary();
        }
        outcome?;
        if assess {
            assess_report(&report)?;
        }
        Ok(report)
    }

    fn wait_for_dev_in_phonesimu(&mut self) -> AppResult<()> {
        let timeout = self.settings.switcher.init_timeout;
        let deadline = self.clock.now() + timeout;
        loop {
            if self.clock.now() >= deadline {
                return Err(HarnessError::SetupTimeout {
                    what: "Device discovery",
                    timeout,
                });
            }
            info!("Waiting for HFP & AVRCP device");
            let data = self.link.get_data(false)?;
            if !data.hfp_cli_addr.is_empty() {
                self.telephone.set_hfp_client_address(&data.hfp_cli_addr);
            }
            if !data.avrcp.addr.is_empty() {
                self.avrcp_client_address = data.avrcp.addr.clone();
            }
            if !self.avrcp_client_address.is_empty() && !self.telephone.hfp_client_address().is_empty() {
                break;
            }
            self.link.send_command(&Command::HfStatus)?;
            self.link.send_command(&Command::CtStatus)?;
            self.clock.sleep(DISCOVERY_RETRY);
        }
        info!("HFP device is {}", self.telephone.hfp_client_address());
        Ok(())
    }

    fn ensure_init_in_phonesimu(&mut self) -> AppResult<()> {
        let switcher = &self.settings.switcher;
        self.entertainment
            .set_next_frequency_with_strength(self.link.as_ref(), switcher.not_playing_strength)?;

        info!("Launching new alsa-micro worker");
        let results = self.target.results_dir();
        let interval = self.settings.analysis.record_interval;
        let commands = [
            Command::NewAlsaMicro {
                device: switcher.micro_device.clone(),
                sample_rate: self.settings.analysis.sample_rate,
            },
            // micro hears entertainment, SCO carries the device microphone
            Command::AlsaMicroRecord {
                path: results.join("ent_recording").display().to_string(),
                interval,
            },
            Command::ScoAudioRecord {
                path: results.join("sco_recording").display().to_string(),
                interval,
            },
        ];
        for command in &commands {
            self.link.send_command(command)?;
        }

        self.entertainment.init_entertainment(self.link.as_ref())?;
        self.entertainment_active_time = self.clock.now();
        self.last_activity_time = self.entertainment_active_time;
        Ok(())
    }

    fn run_switches(&mut self, media_source: &str, switch_count: u32) -> AppResult<()> {
        let poll = self.settings.switcher.poll_interval;
        while self.report.switches < switch_count {
            let mut data = self.link.get_data(true)?;
            let mut changed = false;
            if data.avrcp.updated {
                self.entertainment_updated(&data)?;
                changed = true;
            }
            if data.phone.updated {
                self.phone_updated(&data)?;
                changed = true;
            }
            if changed {
                // the updates above requested new tones; keep later flags for the next round
                data = self.link.get_data(false)?;
            }

            let now = self.clock.now();
            if now.saturating_duration_since(self.last_activity_time) > self.settings.switcher.max_switch_time {
                let phone_active = self.telephone.is_active();
                let entertainment_active = self.entertainment.is_active();
                error!(
                    "Switching Failed: Phone Status:{} Entertainment Status:{}",
                    phone_active, entertainment_active
                );
                return Err(HarnessError::SwitchingStalled {
                    phone_active,
                    entertainment_active,
                });
            }

            if self.telephone.is_active() && self.entertainment.is_active() {
                info!("Phone and Entertainment are both active");
                self.clock.sleep(poll);
                continue;
            }

            if self.entertainment.is_active()
                && !self.stop_entertainment
                && self.act_on_entertainment(now, &data, media_source)?
            {
                continue;
            }

            if self.telephone.is_active() {
                self.act_on_phone(now, &data)?;
            }
            self.clock.sleep(poll);
        }
        Ok(())
    }

    fn entertainment_updated(&mut self, data: &SimulatorSnapshot) -> AppResult<()> {
        self.last_activity_time = self.clock.now();
        if self.entertainment.update_status(self.link.as_ref(), data)? == PLAYING {
            self.report.entertainment.total += 1;
            self.entertainment_active_time = self.entertainment.requested_at();
        }
        Ok(())
    }

    fn phone_updated(&mut self, data: &SimulatorSnapshot) -> AppResult<()> {
        self.last_activity_time = self.clock.now();
        match self
            .telephone
            .phone_updated(self.link.as_ref(), self.target.as_ref(), data)?
        {
            CallTransition::Began => {
                self.report.incoming.total += 1;
                self.report.outgoing.total += 1;
            }
            CallTransition::Ended => {
                self.report.switches += 1;
                self.entertainment.replay_entertainment(self.link.as_ref())?;
                info!("Successfully made Switch Number: {}", self.report.switches);
            }
            CallTransition::Unchanged => {}
        }
        Ok(())
    }

    /// Returns `true` when entertainment time is up and a call was started.
    fn act_on_entertainment(
        &mut self,
        now: Instant,
        data: &SimulatorSnapshot,
        media_source: &str,
    ) -> AppResult<bool> {
        let link = self.link.as_ref();
        if now.saturating_duration_since(self.entertainment_active_time)
            >= self.settings.switcher.entertainment_duration
        {
            self.entertainment.pause_entertainment(link)?;
            info!("Entertainment Audio Time Up. Starting Phone Call.");
            self.telephone.simulate_outgoing_call(link)?;
            self.stop_entertainment = true;

            self.clock.sleep(DIAL_SETTLE);
            self.telephone
                .validate_active_call_from_ui(self.target.as_ref(), "after_dialing");
            return Ok(true);
        }

        self.entertainment
            .validate_entertainment_from_ui(self.target.as_ref(), media_source)?;
        // the micro may report before playback does: require
        // requested == played == recorded
        if self.entertainment.is_simulating_entertainment_frequency(data) {
            if self.entertainment.validate_entertainment_frequency(link, data)? {
                self.report.entertainment.pass();
            } else if now.saturating_duration_since(self.entertainment.requested_at())
                > self.settings.switcher.max_response_time
            {
                error!(
                    "Failure: Entertainment audio not responding, Entertainment Freq Reported: {}Hz \
                     Entertainment Freq Set: {}Hz Entertainment Freq Recorded: {}Hz",
                    data.entertainment.frequency,
                    self.entertainment.requested_frequency(),
                    data.micro.frequency
                );
                self.report.entertainment.fail();
                self.entertainment.set_next_playing_frequency(link)?;
            }
        }
        Ok(false)
    }

    fn act_on_phone(&mut self, now: Instant, data: &SimulatorSnapshot) -> AppResult<()> {
        let link = self.link.as_ref();
        let budget = self.settings.switcher.max_response_time;
        self.stop_entertainment = false;

        if self.telephone.is_simulating_phone(data) {
            if self.telephone.validate_micro_frequency(link, data)? {
                self.report.incoming.pass();
            } else if now.saturating_duration_since(self.telephone.phone_requested_at()) > budget {
                error!("Failure: Incoming Phone audio not responding");
                warn!(
                    "Incoming Frequency Set: {}Hz Frequency Played: {}Hz Frequency Recorded: {}Hz",
                    self.telephone.phone_frequency(),
                    data.phone.frequency,
                    data.micro.frequency
                );
                self.report.incoming.fail();
                self.telephone.set_next_phone_frequency(link)?;
            }
        }

        if self.telephone.is_simulating_speaker(data) {
            if self.telephone.validate_speaker_frequency(link, data)? {
                self.report.outgoing.pass();
            } else if now.saturating_duration_since(self.telephone.speaker_requested_at()) > budget {
                error!("Failure: Outgoing Phone audio not responding");
                warn!(
                    "Outgoing Frequency Set: {}Hz Frequency Played: {}Hz Frequency Recorded: {}Hz",
                    self.telephone.speaker_frequency(),
                    data.speaker.frequency,
                    data.sco.frequency
                );
                self.report.outgoing.fail();
                self.telephone.set_next_speaker_frequency(link)?;
            }
        }
        Ok(())
    }

    /// Stops the recorders and the comm handler, if it was started.
    pub fn ensure_teardown_phonesimu(&mut self) -> AppResult<()> {
        if !self.link.is_started() {
            return Ok(());
        }
        self.entertainment.terminate(self.link.as_ref())?;
        self.clock.sleep(TEARDOWN_SETTLE);
        self.link.stop();
        Ok(())
    }

    /// Creates the endurance CSV reports under the results directory.
    pub fn prepare_reports(&mut self) -> AppResult<()> {
        self.reports = Some(EnduranceReportWriter::prepare_reports(self.target.results_dir())?);
        Ok(())
    }

    /// Appends the current run to the reports; prepares them first if needed.
    pub fn append_report_rows(&mut self, lifecycle: u32) -> AppResult<()> {
        if self.reports.is_none() {
            self.prepare_reports()?;
        }
        let report = self.report();
        match &self.reports {
            Some(writer) => writer.append_report_rows(lifecycle, &report),
            None => Ok(()),
        }
    }
}

fn assess_report(report: &SwitchReport) -> AppResult<()> {
    if report.phone_latency.is_none() {
        return Err(HarnessError::NoLatencies("phone call"));
    }
    if report.entertainment_latency.is_none() {
        return Err(HarnessError::NoLatencies("entertainment"));
    }
    Ok(())
}
