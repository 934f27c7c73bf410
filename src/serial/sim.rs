//! In-memory serial backend and macropad firmware emulator.
//!
//! Test helper exposed unconditionally so integration tests and the CLI's
//! `--simulate` mode can drive the full connection and update flows without hardware.
use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::{Duration, Instant};

use super::{DisplayMode, Result, SerialBackend, SerialDeviceInfo, SerialError, SerialTransport};

const DEFAULT_LAYOUT: &str = r#"{
  "version": "1.0",
  "device": "FeatherS3",
  "display": {
    "mode": "layer",
    "enabled": true
  },
  "currentLayer": 1,
  "layers": [
    {
      "id": 1,
      "name": "Layer 1",
      "buttons": {
        "1": { "action": "Key Press", "key": "A", "enabled": true }
      },
      "knobs": {}
    }
  ]
}"#;

// DTR/RTS transitions that put an ESP32-S3 into its ROM bootloader
const BOOTLOADER_PATTERN: [ControlLine; 5] = [
    ControlLine::Dtr(false),
    ControlLine::Rts(true),
    ControlLine::Dtr(true),
    ControlLine::Dtr(false),
    ControlLine::Rts(false),
];

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|e| e.into_inner())
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ControlLine {
    Dtr(bool),
    Rts(bool),
}

enum UploadPhase {
    Idle,
    AwaitingBegin,
    Collecting(Vec<String>),
}

struct DeviceState {
    responsive: bool,
    muted: HashSet<String>,
    version: String,
    battery_line: String,
    config: String,
    display: (DisplayMode, bool),
    clock: Option<String>,
    received: Vec<String>,
    control_log: Vec<ControlLine>,
    bootloader_requests: usize,
    incoming: String,
    outbox: VecDeque<u8>,
    upload: UploadPhase,
}

impl DeviceState {
    fn reply(&mut self, line: &str) {
        self.outbox.extend(line.as_bytes());
        self.outbox.push_back(b'\n');
    }

    fn handle_line(&mut self, line: &str) {
        self.received.push(line.to_string());

        if let UploadPhase::Collecting(body) = &mut self.upload {
            if line != "END_JSON" {
                body.push(line.to_string());
                return;
            }
            let text = body.join("\n");
            self.upload = UploadPhase::Idle;
            if !self.responsive || self.muted.contains(line) {
                return;
            }
            match serde_json::from_str::<serde_json::Value>(&text) {
                Ok(_) => {
                    self.config = text;
                    self.reply("UPLOAD_OK");
                }
                Err(e) => self.reply(&format!("UPLOAD_FAIL: {}", e)),
            }
            return;
        }

        if !self.responsive || self.muted.contains(command_name(line)) {
            return;
        }

        match line {
            "PING" => self.reply("PONG"),
            "BATTERY_STATUS" => {
                let battery = self.battery_line.clone();
                self.reply(&battery);
            }
            "GET_VERSION" => {
                self.reply("FeatherS3 ready");
                self.reply("layers loaded: 1");
                let version = format!("VERSION:{}", self.version);
                self.reply(&version);
            }
            "UPLOAD_LAYER_CONFIG" => {
                self.upload = UploadPhase::AwaitingBegin;
                self.reply("READY_FOR_LAYER_CONFIG");
            }
            "BEGIN_JSON" if matches!(self.upload, UploadPhase::AwaitingBegin) => {
                self.upload = UploadPhase::Collecting(Vec::new());
            }
            "GET_CURRENT_CONFIG" => {
                let body = format!("CURRENT_CONFIG:{}", self.config.trim_end());
                self.reply(&body);
                self.reply("");
                self.reply("");
            }
            "DOWNLOAD_CONFIG" => match serde_json::from_str::<serde_json::Value>(&self.config) {
                Ok(value) => self.reply(&format!("CONFIG:{}", value)),
                Err(_) => self.reply("DOWNLOAD_ERROR"),
            },
            _ => {
                if let Some(args) = line.strip_prefix("SET_DISPLAY_MODE:") {
                    let mut parts = args.splitn(2, ',');
                    let mode = parts.next().unwrap_or_default().parse::<DisplayMode>();
                    let enabled = parts.next().map(|e| e.trim().eq_ignore_ascii_case("true")).unwrap_or(true);
                    match mode {
                        Ok(mode) => {
                            self.display = (mode, enabled);
                            self.reply("DISPLAY_MODE_SET");
                        }
                        Err(_) => self.reply("DISPLAY_MODE_ERROR: Invalid mode"),
                    }
                } else if let Some(time) = line.strip_prefix("SET_TIME:") {
                    match chrono::NaiveTime::parse_from_str(time.trim(), "%H:%M") {
                        Ok(_) => {
                            self.clock = Some(time.trim().to_string());
                            self.reply("TIME_SET");
                        }
                        Err(_) => self.reply("TIME_ERROR: Invalid time format"),
                    }
                } else {
                    self.reply(&format!("UNKNOWN_COMMAND: {}", line));
                }
            }
        }
    }

    fn record_control(&mut self, line: ControlLine) -> bool {
        self.control_log.push(line);
        let n = self.control_log.len();
        if n >= BOOTLOADER_PATTERN.len() && self.control_log[n - BOOTLOADER_PATTERN.len()..] == BOOTLOADER_PATTERN {
            self.bootloader_requests += 1;
            return true;
        }
        false
    }
}

fn command_name(line: &str) -> &str {
    line.split(':').next().unwrap_or(line)
}

/// Emulated macropad firmware. Cloning shares the same device.
#[derive(Clone)]
pub struct SimulatedDevice {
    state: Arc<Mutex<DeviceState>>,
}

impl Default for SimulatedDevice {
    fn default() -> Self {
        Self::new()
    }
}

impl SimulatedDevice {
    pub fn new() -> Self {
        Self {
            state: Arc::new(Mutex::new(DeviceState {
                responsive: true,
                muted: HashSet::new(),
                version: "1.0.0".to_string(),
                battery_line: "BATTERY:87,4.05,Discharging".to_string(),
                config: DEFAULT_LAYOUT.to_string(),
                display: (DisplayMode::Layer, true),
                clock: None,
                received: Vec::new(),
                control_log: Vec::new(),
                bootloader_requests: 0,
                incoming: String::new(),
                outbox: VecDeque::new(),
                upload: UploadPhase::Idle,
            })),
        }
    }

    /// A device that stops answering keeps receiving but sends nothing back.
    pub fn set_responsive(&self, responsive: bool) {
        lock(&self.state).responsive = responsive;
    }

    /// Ignore one command (matched on the text before the first `:`).
    pub fn mute(&self, command: &str) {
        lock(&self.state).muted.insert(command.to_string());
    }

    pub fn set_version(&self, version: &str) {
        lock(&self.state).version = version.to_string();
    }

    pub fn set_battery_line(&self, line: &str) {
        lock(&self.state).battery_line = line.to_string();
    }

    pub fn set_config(&self, json: &str) {
        lock(&self.state).config = json.to_string();
    }

    pub fn config(&self) -> String {
        lock(&self.state).config.clone()
    }

    pub fn display(&self) -> (DisplayMode, bool) {
        lock(&self.state).display
    }

    pub fn clock(&self) -> Option<String> {
        lock(&self.state).clock.clone()
    }

    pub fn received_lines(&self) -> Vec<String> {
        lock(&self.state).received.clone()
    }

    pub fn control_log(&self) -> Vec<ControlLine> {
        lock(&self.state).control_log.clone()
    }

    pub fn bootloader_requested(&self) -> bool {
        lock(&self.state).bootloader_requests > 0
    }

    fn write(&self, data: &[u8]) {
        let mut state = lock(&self.state);
        state.incoming.push_str(&String::from_utf8_lossy(data));
        while let Some(pos) = state.incoming.find('\n') {
            let raw: String = state.incoming.drain(..=pos).collect();
            let line = raw.trim_end_matches(|c| c == '\r' || c == '\n').to_string();
            state.handle_line(&line);
        }
    }

    fn pending(&self) -> usize {
        lock(&self.state).outbox.len()
    }

    fn read(&self, buffer: &mut [u8]) -> usize {
        let mut state = lock(&self.state);
        let n = buffer.len().min(state.outbox.len());
        for (slot, byte) in buffer.iter_mut().zip(state.outbox.drain(..n)) {
            *slot = byte;
        }
        n
    }

    fn clear_input(&self) {
        lock(&self.state).outbox.clear();
    }
}

#[derive(Clone)]
struct PortEntry {
    info: SerialDeviceInfo,
    device: Option<SimulatedDevice>,
}

struct Reenumeration {
    ports: Vec<SerialDeviceInfo>,
    delay: Duration,
}

#[derive(Default)]
struct BackendState {
    ports: Vec<PortEntry>,
    pending: Vec<(Instant, PortEntry)>,
    plans: HashMap<String, Reenumeration>,
    scripted: VecDeque<Vec<SerialDeviceInfo>>,
    busy: HashSet<String>,
    fail_enumeration: bool,
    open_log: Vec<String>,
}

impl BackendState {
    fn promote_pending(&mut self) {
        let now = Instant::now();
        let (ready, waiting): (Vec<_>, Vec<_>) = self.pending.drain(..).partition(|(at, _)| *at <= now);
        self.pending = waiting;
        for (_, entry) in ready {
            if !self.ports.iter().any(|p| p.info.port_name == entry.info.port_name) {
                self.ports.push(entry);
            }
        }
    }

    fn is_attached(&self, port_name: &str) -> bool {
        self.ports.iter().any(|p| p.info.port_name == port_name)
    }

    fn reenumerate(&mut self, from: &str) {
        let Some(plan) = self.plans.remove(from) else {
            return;
        };
        self.ports.retain(|p| p.info.port_name != from);
        let at = Instant::now() + plan.delay;
        for info in plan.ports {
            self.pending.push((at, PortEntry { info, device: None }));
        }
        log::debug!("Simulated {} re-enumerating", from);
    }
}

/// Scriptable port listing with attachable simulated devices.
#[derive(Clone, Default)]
pub struct SimBackend {
    state: Arc<Mutex<BackendState>>,
}

impl SimBackend {
    pub fn new() -> Self {
        Self::default()
    }

    /// Plug a device in on the given port.
    pub fn attach(&self, info: SerialDeviceInfo, device: SimulatedDevice) {
        let mut state = lock(&self.state);
        state.ports.retain(|p| p.info.port_name != info.port_name);
        state.ports.push(PortEntry {
            info,
            device: Some(device),
        });
    }

    /// A port that opens but never answers.
    pub fn attach_port(&self, info: SerialDeviceInfo) {
        let mut state = lock(&self.state);
        state.ports.retain(|p| p.info.port_name != info.port_name);
        state.ports.push(PortEntry { info, device: None });
    }

    pub fn detach(&self, port_name: &str) {
        lock(&self.state).ports.retain(|p| p.info.port_name != port_name);
    }

    /// Opening a busy port fails as if another process held it.
    pub fn set_busy(&self, port_name: &str, busy: bool) {
        let mut state = lock(&self.state);
        if busy {
            state.busy.insert(port_name.to_string());
        } else {
            state.busy.remove(port_name);
        }
    }

    pub fn fail_enumeration(&self, fail: bool) {
        lock(&self.state).fail_enumeration = fail;
    }

    /// Return `listing` from the next enumeration instead of the attached ports.
    /// Queued listings are consumed in order.
    pub fn queue_listing(&self, listing: Vec<SerialDeviceInfo>) {
        lock(&self.state).scripted.push_back(listing);
    }

    /// When the device on `from` receives the bootloader control sequence, `from`
    /// disappears at once and `to` ports appear, in order, after `delay`.
    pub fn on_bootloader_reenumerate(&self, from: &str, to: &[SerialDeviceInfo], delay: Duration) {
        lock(&self.state).plans.insert(
            from.to_string(),
            Reenumeration {
                ports: to.to_vec(),
                delay,
            },
        );
    }

    /// Every port name passed to `open`, including failed attempts.
    pub fn open_log(&self) -> Vec<String> {
        lock(&self.state).open_log.clone()
    }
}

impl SerialBackend for SimBackend {
    fn available_ports(&self) -> Result<Vec<SerialDeviceInfo>> {
        let mut state = lock(&self.state);
        if state.fail_enumeration {
            return Err(SerialError::PortUnavailable("simulated enumeration failure".to_string()));
        }
        if let Some(listing) = state.scripted.pop_front() {
            return Ok(listing);
        }
        state.promote_pending();
        Ok(state.ports.iter().map(|p| p.info.clone()).collect())
    }

    fn open(&self, port_name: &str, _baud_rate: u32) -> Result<Box<dyn SerialTransport>> {
        let mut state = lock(&self.state);
        state.open_log.push(port_name.to_string());
        state.promote_pending();

        if state.busy.contains(port_name) {
            return Err(SerialError::PortUnavailable(format!("{}: Access is denied", port_name)));
        }
        let entry = state
            .ports
            .iter()
            .find(|p| p.info.port_name == port_name)
            .cloned()
            .ok_or_else(|| SerialError::PortUnavailable(format!("{}: No such port", port_name)))?;

        Ok(Box::new(SimPort {
            name: port_name.to_string(),
            device: entry.device,
            backend: Arc::clone(&self.state),
        }))
    }
}

struct SimPort {
    name: String,
    device: Option<SimulatedDevice>,
    backend: Arc<Mutex<BackendState>>,
}

impl SimPort {
    fn ensure_attached(&self) -> Result<()> {
        if lock(&self.backend).is_attached(&self.name) {
            Ok(())
        } else {
            Err(SerialError::Io(std::io::Error::new(
                std::io::ErrorKind::BrokenPipe,
                format!("{} was removed", self.name),
            )))
        }
    }

    fn control(&mut self, line: ControlLine) -> Result<()> {
        self.ensure_attached()?;
        if let Some(device) = &self.device {
            if lock(&device.state).record_control(line) {
                lock(&self.backend).reenumerate(&self.name);
            }
        }
        Ok(())
    }
}

impl SerialTransport for SimPort {
    fn port_name(&self) -> &str {
        &self.name
    }

    fn write_all(&mut self, data: &[u8]) -> Result<()> {
        self.ensure_attached()?;
        if let Some(device) = &self.device {
            device.write(data);
        }
        Ok(())
    }

    fn bytes_to_read(&mut self) -> Result<u32> {
        self.ensure_attached()?;
        Ok(self.device.as_ref().map(|d| d.pending() as u32).unwrap_or(0))
    }

    fn read(&mut self, buffer: &mut [u8]) -> Result<usize> {
        Ok(self.device.as_ref().map(|d| d.read(buffer)).unwrap_or(0))
    }

    fn clear_input(&mut self) -> Result<()> {
        if let Some(device) = &self.device {
            device.clear_input();
        }
        Ok(())
    }

    fn set_dtr(&mut self, level: bool) -> Result<()> {
        self.control(ControlLine::Dtr(level))
    }

    fn set_rts(&mut self, level: bool) -> Result<()> {
        self.control(ControlLine::Rts(level))
    }
}
