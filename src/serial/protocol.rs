use std::fmt;
use std::str::FromStr;
use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};

use super::reader::CommandSpec;
use super::{LineReader, ResponseMatcher, Result, SerialError, SerialTransport};

const CONFIG_PREFIX: &str = "CURRENT_CONFIG:";
const LEGACY_CONFIG_PREFIX: &str = "CONFIG:";

const UPLOAD_FAILURES: &[&str] = &["UPLOAD_FAIL", "CONFIG_ERROR"];
const BATTERY_FAILURES: &[&str] = &["BATTERY_ERROR", "UNKNOWN_COMMAND"];
const DISPLAY_FAILURES: &[&str] = &["DISPLAY_MODE_ERROR", "UNKNOWN_COMMAND"];
const TIME_FAILURES: &[&str] = &["TIME_ERROR", "UNKNOWN_COMMAND"];
const DOWNLOAD_FAILURES: &[&str] = &["DOWNLOAD_ERROR", "UNKNOWN_COMMAND"];

/// Deadlines for each command family.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProtocolTimeouts {
    pub poll_interval: Duration,
    pub ping: Duration,
    pub command: Duration,
    pub version: Duration,
    pub battery: Duration,
    pub upload_ready: Duration,
    pub upload_result: Duration,
    pub config_read: Duration,
    /// Gap between JSON body lines so the device's receive buffer keeps up.
    pub line_delay: Duration,
}

impl Default for ProtocolTimeouts {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_millis(10),
            ping: Duration::from_millis(1500),
            command: Duration::from_millis(2000),
            version: Duration::from_millis(1500),
            battery: Duration::from_millis(1000),
            upload_ready: Duration::from_millis(2000),
            upload_result: Duration::from_millis(5000),
            config_read: Duration::from_millis(5000),
            line_delay: Duration::from_millis(10),
        }
    }
}

/// What the device's on-board display shows.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DisplayMode {
    Layer,
    Battery,
    Time,
    Off,
}

impl DisplayMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            DisplayMode::Layer => "layer",
            DisplayMode::Battery => "battery",
            DisplayMode::Time => "time",
            DisplayMode::Off => "off",
        }
    }
}

impl fmt::Display for DisplayMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for DisplayMode {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "layer" => Ok(DisplayMode::Layer),
            "battery" => Ok(DisplayMode::Battery),
            "time" => Ok(DisplayMode::Time),
            "off" => Ok(DisplayMode::Off),
            other => Err(format!("unknown display mode '{}'", other)),
        }
    }
}

/// Parsed `BATTERY:<percent>,<voltage>,<status>` reply.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BatteryReport {
    pub percent: u8,
    pub voltage: Option<f32>,
    pub status: Option<String>,
}

impl BatteryReport {
    pub fn parse(line: &str) -> Result<Self> {
        let body = line
            .trim()
            .strip_prefix("BATTERY:")
            .ok_or_else(|| SerialError::ProtocolError(format!("Unexpected battery reply: {}", line)))?;

        let mut fields = body.split(',').map(str::trim);
        let percent = fields
            .next()
            .and_then(|p| p.parse::<f32>().ok())
            .ok_or_else(|| SerialError::ProtocolError(format!("Invalid battery percent: {}", body)))?;

        let voltage = fields.next().and_then(|v| v.parse::<f32>().ok());
        let status = fields.next().filter(|s| !s.is_empty()).map(str::to_string);

        Ok(Self {
            percent: percent.round().clamp(0.0, 100.0) as u8,
            voltage,
            status,
        })
    }
}

/// Line-oriented command client bound to one open serial channel.
pub struct DeviceProtocolClient {
    transport: Option<Box<dyn SerialTransport>>,
    reader: LineReader,
    timeouts: ProtocolTimeouts,
    bytes_written: u64,
}

impl DeviceProtocolClient {
    pub fn new(transport: Box<dyn SerialTransport>, timeouts: ProtocolTimeouts) -> Self {
        Self {
            transport: Some(transport),
            reader: LineReader::new(timeouts.poll_interval),
            timeouts,
            bytes_written: 0,
        }
    }

    pub fn is_open(&self) -> bool {
        self.transport.is_some()
    }

    pub fn port_name(&self) -> Option<&str> {
        self.transport.as_deref().map(|t| t.port_name())
    }

    pub fn timeouts(&self) -> &ProtocolTimeouts {
        &self.timeouts
    }

    /// Bytes written plus bytes read over the lifetime of this channel.
    pub fn bytes_transferred(&self) -> u64 {
        self.bytes_written + self.reader.bytes_read()
    }

    /// Release the port. Safe to call repeatedly.
    pub fn close(&mut self) {
        if let Some(transport) = self.transport.take() {
            log::debug!("Closing serial channel {}", transport.port_name());
        }
        self.reader.reset();
    }

    fn transport(&mut self) -> Result<&mut (dyn SerialTransport + 'static)> {
        self.transport.as_deref_mut().ok_or(SerialError::NotConnected)
    }

    fn send_line(&mut self, line: &str) -> Result<()> {
        let transport = self.transport.as_deref_mut().ok_or(SerialError::NotConnected)?;
        log::trace!("-> {}", line);
        let framed = format!("{}\n", line);
        transport.write_all(framed.as_bytes())?;
        self.bytes_written += framed.len() as u64;
        Ok(())
    }

    fn discard_input(&mut self) -> Result<()> {
        self.transport()?.clear_input()?;
        self.reader.reset();
        Ok(())
    }

    async fn wait_for(&mut self, spec: &CommandSpec) -> Result<Vec<String>> {
        let transport = self.transport.as_deref_mut().ok_or(SerialError::NotConnected)?;
        self.reader.read_until(transport, spec).await
    }

    /// Discard stale input, send one command and wait for its reply.
    async fn request(&mut self, command: &str, spec: CommandSpec) -> Result<Vec<String>> {
        self.discard_input()?;
        self.send_line(command)?;
        self.wait_for(&spec).await
    }

    /// Liveness and handshake probe.
    pub async fn ping(&mut self) -> Result<()> {
        let spec = CommandSpec::new("PING", self.timeouts.ping, ResponseMatcher::EqualsIgnoreCase("PONG"));
        self.request("PING", spec).await?;
        Ok(())
    }

    pub async fn battery_status(&mut self) -> Result<BatteryReport> {
        let spec = CommandSpec::new("BATTERY_STATUS", self.timeouts.battery, ResponseMatcher::UntilPrefix("BATTERY:"))
            .failing_on(BATTERY_FAILURES);
        let lines = self.request("BATTERY_STATUS", spec).await?;
        let line = lines
            .iter()
            .find(|l| l.starts_with("BATTERY:"))
            .ok_or_else(|| SerialError::ProtocolError("Missing BATTERY: line".to_string()))?;
        BatteryReport::parse(line)
    }

    /// Firmware version string. The reply may follow unrelated output, so every
    /// line in the window is scanned.
    pub async fn firmware_version(&mut self) -> Result<String> {
        let spec = CommandSpec::new("GET_VERSION", self.timeouts.version, ResponseMatcher::Contains("VERSION:"))
            .failing_on(&["UNKNOWN_COMMAND"]);
        let lines = self.request("GET_VERSION", spec).await?;

        lines
            .iter()
            .find_map(|l| l.find("VERSION:").map(|idx| l[idx + "VERSION:".len()..].trim().to_string()))
            .filter(|v| !v.is_empty())
            .ok_or_else(|| SerialError::ProtocolError("Empty VERSION reply".to_string()))
    }

    /// Chunked upload of a layout document.
    pub async fn upload_layer_config(&mut self, json: &str) -> Result<()> {
        let ready = CommandSpec::new(
            "UPLOAD_LAYER_CONFIG",
            self.timeouts.upload_ready,
            ResponseMatcher::Contains("READY_FOR_LAYER_CONFIG"),
        )
        .failing_on(UPLOAD_FAILURES);
        self.request("UPLOAD_LAYER_CONFIG", ready).await?;

        self.send_line("BEGIN_JSON")?;
        let mut sent = 0usize;
        for line in json.lines().filter(|l| !l.trim().is_empty()) {
            self.send_line(line)?;
            sent += 1;
            tokio::time::sleep(self.timeouts.line_delay).await;
        }
        self.send_line("END_JSON")?;
        log::debug!("Sent layout body in {} lines", sent);

        let result = CommandSpec::new("END_JSON", self.timeouts.upload_result, ResponseMatcher::Contains("UPLOAD_OK"))
            .failing_on(UPLOAD_FAILURES);
        self.wait_for(&result).await?;
        log::info!("Layout upload accepted by device");
        Ok(())
    }

    /// Read back the layout the device is running.
    ///
    /// The document arrives as `CURRENT_CONFIG:<first line>` followed by
    /// continuation lines and ends with two consecutive blank lines.
    pub async fn current_config(&mut self) -> Result<String> {
        self.discard_input()?;
        self.send_line("GET_CURRENT_CONFIG")?;

        let deadline = Instant::now() + self.timeouts.config_read;
        let mut body: Vec<String> = Vec::new();
        let mut started = false;
        let mut blank_run = 0;

        loop {
            let transport = self.transport.as_deref_mut().ok_or(SerialError::NotConnected)?;
            for raw in self.reader.poll_available(transport)? {
                if !started {
                    let line = raw.trim();
                    if line.starts_with("CONFIG_ERROR") || line.starts_with("UNKNOWN_COMMAND") {
                        return Err(SerialError::ProtocolError(line.to_string()));
                    }
                    if let Some(first) = line.strip_prefix(CONFIG_PREFIX) {
                        started = true;
                        if !first.is_empty() {
                            body.push(first.to_string());
                        }
                    }
                    continue;
                }

                if raw.trim().is_empty() {
                    blank_run += 1;
                    if blank_run >= 2 {
                        return Ok(body.join("\n"));
                    }
                } else {
                    blank_run = 0;
                    body.push(raw);
                }
            }

            if Instant::now() >= deadline {
                if started {
                    log::debug!("GET_CURRENT_CONFIG ended at deadline after {} lines", body.len());
                    return Ok(body.join("\n"));
                }
                log::warn!("GET_CURRENT_CONFIG timeout after {:?}", self.timeouts.config_read);
                return Err(SerialError::Timeout);
            }

            tokio::time::sleep(self.timeouts.poll_interval).await;
        }
    }

    /// Older firmware: the whole document on a single `CONFIG:` line.
    pub async fn download_config(&mut self) -> Result<String> {
        let spec = CommandSpec::new(
            "DOWNLOAD_CONFIG",
            self.timeouts.config_read,
            ResponseMatcher::UntilPrefix(LEGACY_CONFIG_PREFIX),
        )
        .failing_on(DOWNLOAD_FAILURES);
        let lines = self.request("DOWNLOAD_CONFIG", spec).await?;

        lines
            .iter()
            .find_map(|l| l.strip_prefix(LEGACY_CONFIG_PREFIX))
            .map(|json| json.trim().to_string())
            .ok_or_else(|| SerialError::ProtocolError("Missing CONFIG: line".to_string()))
    }

    pub async fn set_display_mode(&mut self, mode: DisplayMode, enabled: bool) -> Result<()> {
        let command = format!("SET_DISPLAY_MODE:{},{}", mode, enabled);
        let spec = CommandSpec::new("SET_DISPLAY_MODE", self.timeouts.command, ResponseMatcher::Contains("DISPLAY_MODE_SET"))
            .failing_on(DISPLAY_FAILURES);
        self.request(&command, spec).await?;
        Ok(())
    }

    pub async fn set_time(&mut self, time: chrono::NaiveTime) -> Result<()> {
        let command = format!("SET_TIME:{}", time.format("%H:%M"));
        let spec = CommandSpec::new("SET_TIME", self.timeouts.command, ResponseMatcher::Contains("TIME_SET"))
            .failing_on(TIME_FAILURES);
        self.request(&command, spec).await?;
        Ok(())
    }

    /// Hold BOOT, pulse reset, release BOOT.
    pub async fn enter_bootloader(&mut self) -> Result<()> {
        let steps: [(Option<bool>, Option<bool>, u64); 4] = [
            (Some(false), Some(true), 100),
            (Some(true), None, 50),
            (Some(false), None, 50),
            (None, Some(false), 300),
        ];

        for (dtr, rts, wait_ms) in steps {
            let transport = self.transport()?;
            if let Some(level) = dtr {
                transport.set_dtr(level)?;
            }
            if let Some(level) = rts {
                transport.set_rts(level)?;
            }
            tokio::time::sleep(Duration::from_millis(wait_ms)).await;
        }

        log::info!("Bootloader control-line sequence sent");
        Ok(())
    }
}

impl Drop for DeviceProtocolClient {
    fn drop(&mut self) {
        self.close();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::serial::sim::{SimBackend, SimulatedDevice};
    use crate::serial::{SerialBackend, SerialDeviceInfo};

    fn fast_timeouts() -> ProtocolTimeouts {
        ProtocolTimeouts {
            poll_interval: Duration::from_millis(1),
            ping: Duration::from_millis(100),
            command: Duration::from_millis(100),
            version: Duration::from_millis(100),
            battery: Duration::from_millis(100),
            upload_ready: Duration::from_millis(100),
            upload_result: Duration::from_millis(200),
            config_read: Duration::from_millis(200),
            line_delay: Duration::from_millis(0),
        }
    }

    fn client_for(device: &SimulatedDevice) -> DeviceProtocolClient {
        let backend = SimBackend::new();
        backend.attach(SerialDeviceInfo::bare("COM3"), device.clone());
        let transport = backend.open("COM3", 115200).unwrap();
        DeviceProtocolClient::new(transport, fast_timeouts())
    }

    #[test]
    fn battery_report_parsing() {
        let report = BatteryReport::parse("BATTERY:87,4.05,Discharging").unwrap();
        assert_eq!(report.percent, 87);
        assert_eq!(report.voltage, Some(4.05));
        assert_eq!(report.status.as_deref(), Some("Discharging"));

        assert_eq!(BatteryReport::parse("BATTERY:140").unwrap().percent, 100);
        assert!(BatteryReport::parse("BATTERY:abc").is_err());
    }

    #[test]
    fn display_mode_parsing() {
        assert_eq!("Time".parse::<DisplayMode>().unwrap(), DisplayMode::Time);
        assert!("clock".parse::<DisplayMode>().is_err());
        assert_eq!(DisplayMode::Battery.to_string(), "battery");
    }

    #[tokio::test]
    async fn ping_succeeds_on_pong() {
        let device = SimulatedDevice::new();
        let mut client = client_for(&device);
        client.ping().await.unwrap();
        assert!(client.bytes_transferred() > 0);
    }

    #[tokio::test]
    async fn silent_device_times_out_without_closing() {
        let device = SimulatedDevice::new();
        device.set_responsive(false);
        let mut client = client_for(&device);

        let err = client.ping().await.unwrap_err();
        assert!(err.is_timeout());
        assert!(client.is_open());
    }

    #[tokio::test]
    async fn every_command_times_out_on_a_silent_device() {
        let device = SimulatedDevice::new();
        device.set_responsive(false);
        let mut client = client_for(&device);
        let time = chrono::NaiveTime::from_hms_opt(12, 30, 0).unwrap();

        assert!(client.battery_status().await.unwrap_err().is_timeout());
        assert!(client.firmware_version().await.unwrap_err().is_timeout());
        assert!(client.upload_layer_config("{}").await.unwrap_err().is_timeout());
        assert!(client.current_config().await.unwrap_err().is_timeout());
        assert!(client.set_display_mode(DisplayMode::Layer, true).await.unwrap_err().is_timeout());
        assert!(client.set_time(time).await.unwrap_err().is_timeout());
        assert!(client.is_open());

        device.set_responsive(true);
        client.ping().await.unwrap();
    }

    #[tokio::test]
    async fn upload_times_out_waiting_for_result() {
        let device = SimulatedDevice::new();
        device.mute("END_JSON");
        let mut client = client_for(&device);

        let err = client.upload_layer_config("{\"currentLayer\": 1}").await.unwrap_err();
        assert!(err.is_timeout());
        assert!(client.is_open());

        let received = device.received_lines();
        assert!(received.contains(&"BEGIN_JSON".to_string()), "body is only sent after READY");
        assert_eq!(received.last().map(String::as_str), Some("END_JSON"));
    }

    #[tokio::test]
    async fn closed_client_fails_fast() {
        let device = SimulatedDevice::new();
        let mut client = client_for(&device);
        client.close();
        client.close();

        assert!(matches!(client.ping().await, Err(SerialError::NotConnected)));
        assert!(matches!(client.current_config().await, Err(SerialError::NotConnected)));
        assert!(device.received_lines().is_empty());
    }

    #[tokio::test]
    async fn version_found_after_noise() {
        let device = SimulatedDevice::new();
        device.set_version("2.1.0");
        let mut client = client_for(&device);
        assert_eq!(client.firmware_version().await.unwrap(), "2.1.0");
    }

    #[tokio::test]
    async fn upload_then_read_back() {
        let device = SimulatedDevice::new();
        let mut client = client_for(&device);
        let json = "{\n  \"version\": \"1.0\",\n\n  \"currentLayer\": 1\n}";

        client.upload_layer_config(json).await.unwrap();
        let back = client.current_config().await.unwrap();

        let strip = |s: &str| s.chars().filter(|c| !c.is_whitespace()).collect::<String>();
        assert_eq!(strip(&back), strip(json));
    }

    #[tokio::test]
    async fn invalid_upload_is_refused() {
        let device = SimulatedDevice::new();
        let mut client = client_for(&device);
        let err = client.upload_layer_config("{ not json").await.unwrap_err();
        assert!(matches!(err, SerialError::ProtocolError(msg) if msg.contains("UPLOAD_FAIL")));
    }

    #[tokio::test]
    async fn display_and_time_commands() {
        let device = SimulatedDevice::new();
        let mut client = client_for(&device);

        client.set_display_mode(DisplayMode::Time, true).await.unwrap();
        client
            .set_time(chrono::NaiveTime::from_hms_opt(9, 5, 0).unwrap())
            .await
            .unwrap();

        let received = device.received_lines();
        assert!(received.contains(&"SET_DISPLAY_MODE:time,true".to_string()));
        assert!(received.contains(&"SET_TIME:09:05".to_string()));
        assert_eq!(device.display(), (DisplayMode::Time, true));
    }

    #[tokio::test]
    async fn battery_error_is_protocol_error() {
        let device = SimulatedDevice::new();
        device.set_battery_line("BATTERY_ERROR");
        let mut client = client_for(&device);
        assert!(matches!(client.battery_status().await, Err(SerialError::ProtocolError(_))));
    }

    #[tokio::test]
    async fn legacy_download_returns_single_line_document() {
        let device = SimulatedDevice::new();
        let mut client = client_for(&device);
        client.upload_layer_config("{\"currentLayer\": 2}").await.unwrap();
        let json = client.download_config().await.unwrap();
        let value: serde_json::Value = serde_json::from_str(&json).unwrap();
        assert_eq!(value["currentLayer"], 2);
    }

    #[tokio::test]
    async fn bootloader_sequence_is_recognised() {
        let device = SimulatedDevice::new();
        let mut client = client_for(&device);
        client.enter_bootloader().await.unwrap();
        assert!(device.bootloader_requested());
    }
}
