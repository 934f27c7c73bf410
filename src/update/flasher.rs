use std::ffi::OsString;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::Duration;

use async_trait::async_trait;
use tokio::process::Command;

use super::models::{FlashStep, UpdateError, UpdateResult};

pub const FLASH_BAUD: u32 = 921600;
pub const DEFAULT_CHIP: &str = "esp32s3";
pub const STEP_TIMEOUT: Duration = Duration::from_secs(120);

/// Captured output of one successful flashing step
#[derive(Debug, Clone, Default)]
pub struct FlashOutput {
    pub stdout: String,
    pub stderr: String,
}

/// Runs one erase, write or verify pass against a port.
#[async_trait]
pub trait Flasher: Send + Sync {
    async fn run_step(&self, port: &str, step: FlashStep, image: &Path) -> UpdateResult<FlashOutput>;
}

/// `esptool` invoked as an external process.
#[derive(Debug, Clone)]
pub struct EspTool {
    program: PathBuf,
    /// Arguments placed before esptool's own, e.g. `-m esptool` for a Python launcher.
    launcher_args: Vec<String>,
    chip: String,
    baud: u32,
    step_timeout: Duration,
}

impl EspTool {
    pub fn new(program: impl Into<PathBuf>) -> Self {
        Self {
            program: program.into(),
            launcher_args: Vec::new(),
            chip: DEFAULT_CHIP.to_string(),
            baud: FLASH_BAUD,
            step_timeout: STEP_TIMEOUT,
        }
    }

    /// Run esptool as a module of the given Python interpreter.
    pub fn python_module(interpreter: impl Into<PathBuf>) -> Self {
        Self::new(interpreter).with_launcher_args(["-m", "esptool"])
    }

    pub fn with_launcher_args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.launcher_args = args.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_chip(mut self, chip: impl Into<String>) -> Self {
        self.chip = chip.into();
        self
    }

    pub fn with_baud(mut self, baud: u32) -> Self {
        self.baud = baud;
        self
    }

    pub fn with_step_timeout(mut self, step_timeout: Duration) -> Self {
        self.step_timeout = step_timeout;
        self
    }

    pub fn program(&self) -> &Path {
        &self.program
    }

    /// Locate esptool: an explicitly configured path, then `esptool`/`esptool.py`
    /// on `PATH`, then `python3 -m esptool` / `python -m esptool`.
    pub fn discover(configured: Option<&Path>) -> UpdateResult<Self> {
        if let Some(path) = configured {
            if path.is_file() {
                log::debug!("Using configured esptool: {}", path.display());
                return Ok(Self::new(path));
            }
            log::warn!("Configured esptool {} does not exist, searching PATH", path.display());
        }

        for name in ["esptool", "esptool.py"] {
            if let Some(found) = find_on_path(name) {
                log::debug!("Found esptool on PATH: {}", found.display());
                return Ok(Self::new(found));
            }
        }

        for interpreter in ["python3", "python"] {
            if let Some(found) = find_on_path(interpreter) {
                log::debug!("Falling back to {} -m esptool", found.display());
                return Ok(Self::python_module(found));
            }
        }

        Err(UpdateError::FlasherNotFound(
            "install esptool (pip install esptool) or set flasher.esptool_path".to_string(),
        ))
    }

    /// Full argument list for one step.
    pub fn command_args(&self, port: &str, step: FlashStep, image: &Path) -> Vec<OsString> {
        let mut args: Vec<OsString> = self.launcher_args.iter().map(OsString::from).collect();
        args.extend(
            ["--port", port, "--baud", self.baud.to_string().as_str(), "--chip", self.chip.as_str()]
                .iter()
                .map(OsString::from),
        );

        match step {
            FlashStep::Erase => args.push("erase-flash".into()),
            FlashStep::Write => {
                args.push("write_flash".into());
                args.push("0x0".into());
                args.push(image.as_os_str().to_owned());
            }
            FlashStep::Verify => {
                args.push("verify_flash".into());
                args.push("0x0".into());
                args.push(image.as_os_str().to_owned());
            }
        }
        args
    }
}

/// Logs each step instead of touching the device. Used by `--simulate`.
#[derive(Debug, Clone, Copy, Default)]
pub struct DryRunFlasher;

#[async_trait]
impl Flasher for DryRunFlasher {
    async fn run_step(&self, port: &str, step: FlashStep, image: &Path) -> UpdateResult<FlashOutput> {
        log::info!("[dry run] {} {} on {}", step, image.display(), port);
        Ok(FlashOutput {
            stdout: format!("{} skipped", step),
            stderr: String::new(),
        })
    }
}

fn find_on_path(name: &str) -> Option<PathBuf> {
    let paths = std::env::var_os("PATH")?;
    std::env::split_paths(&paths).find_map(|dir| {
        let candidate = dir.join(name);
        if candidate.is_file() {
            return Some(candidate);
        }
        let exe = dir.join(format!("{}.exe", name));
        exe.is_file().then_some(exe)
    })
}

fn tail(text: &str, lines: usize) -> String {
    let all: Vec<&str> = text.lines().filter(|l| !l.trim().is_empty()).collect();
    all[all.len().saturating_sub(lines)..].join(" | ")
}

#[async_trait]
impl Flasher for EspTool {
    async fn run_step(&self, port: &str, step: FlashStep, image: &Path) -> UpdateResult<FlashOutput> {
        let args = self.command_args(port, step, image);
        log::info!("Running esptool {} on {}", step, port);
        log::debug!("{} {:?}", self.program.display(), args);

        let child = Command::new(&self.program)
            .args(&args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| match e.kind() {
                std::io::ErrorKind::NotFound => {
                    UpdateError::FlasherNotFound(format!("{}: {}", self.program.display(), e))
                }
                _ => UpdateError::Io(e),
            })?;

        // Dropping the child on timeout kills the process
        let output = match tokio::time::timeout(self.step_timeout, child.wait_with_output()).await {
            Ok(result) => result?,
            Err(_) => {
                log::error!("esptool {} on {} timed out after {:?}", step, port, self.step_timeout);
                return Err(UpdateError::FlashStepFailed {
                    step,
                    port: port.to_string(),
                    detail: format!("timed out after {:?}", self.step_timeout),
                });
            }
        };

        let stdout = String::from_utf8_lossy(&output.stdout).into_owned();
        let stderr = String::from_utf8_lossy(&output.stderr).into_owned();

        if output.status.success() {
            log::debug!("esptool {} output: {}", step, tail(&stdout, 3));
            return Ok(FlashOutput { stdout, stderr });
        }

        let detail = match tail(&stderr, 3) {
            t if t.is_empty() => format!("exit status {}: {}", output.status, tail(&stdout, 3)),
            t => format!("exit status {}: {}", output.status, t),
        };
        log::error!("esptool {} on {} failed: {}", step, port, detail);
        Err(UpdateError::FlashStepFailed {
            step,
            port: port.to_string(),
            detail,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn builds_esptool_arguments() {
        let tool = EspTool::new("esptool");
        let image = Path::new("/tmp/fw.bin");

        let erase: Vec<String> = tool
            .command_args("COM12", FlashStep::Erase, image)
            .into_iter()
            .map(|a| a.to_string_lossy().into_owned())
            .collect();
        assert_eq!(
            erase,
            ["--port", "COM12", "--baud", "921600", "--chip", "esp32s3", "erase-flash"]
        );

        let write: Vec<String> = EspTool::python_module("python3")
            .command_args("COM12", FlashStep::Write, image)
            .into_iter()
            .map(|a| a.to_string_lossy().into_owned())
            .collect();
        assert_eq!(&write[..2], ["-m", "esptool"]);
        assert_eq!(&write[write.len() - 3..], ["write_flash", "0x0", "/tmp/fw.bin"]);
    }

    #[test]
    fn tail_keeps_last_non_blank_lines() {
        assert_eq!(tail("a\n\nb\nc\n", 2), "b | c");
        assert_eq!(tail("", 2), "");
    }

    #[tokio::test]
    async fn missing_program_is_reported() {
        let tool = EspTool::new("/nonexistent/esptool-padawan");
        let err = tool
            .run_step("COM1", FlashStep::Erase, Path::new("fw.bin"))
            .await
            .unwrap_err();
        assert!(matches!(err, UpdateError::FlasherNotFound(_)));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn shell_stand_in_reports_exit_status() {
        let dir = tempfile::tempdir().unwrap();
        let script = dir.path().join("fake-esptool.sh");
        let log = dir.path().join("calls.log");
        std::fs::write(
            &script,
            format!(
                "echo \"$@\" >> {}\ncase \"$*\" in *write_flash*) echo 'A fatal error occurred' >&2; exit 2;; esac\necho ok\n",
                log.display()
            ),
        )
        .unwrap();

        // Run through sh so the freshly written script never needs exec permission
        let tool = EspTool::new("/bin/sh").with_launcher_args([script.to_string_lossy().into_owned()]);
        let image = dir.path().join("fw.bin");

        tool.run_step("COM12", FlashStep::Erase, &image).await.unwrap();
        let err = tool.run_step("COM12", FlashStep::Write, &image).await.unwrap_err();
        match err {
            UpdateError::FlashStepFailed { step, port, detail } => {
                assert_eq!(step, FlashStep::Write);
                assert_eq!(port, "COM12");
                assert!(detail.contains("A fatal error occurred"));
            }
            other => panic!("unexpected error: {other:?}"),
        }

        let calls = std::fs::read_to_string(&log).unwrap();
        assert!(calls.lines().next().unwrap().ends_with("erase-flash"));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn hung_tool_is_killed_after_timeout() {
        let tool = EspTool::new("/bin/sh")
            .with_launcher_args(["-c", "sleep 5", "sh"])
            .with_step_timeout(Duration::from_millis(100));
        let err = tool
            .run_step("COM12", FlashStep::Verify, Path::new("fw.bin"))
            .await
            .unwrap_err();
        assert!(matches!(err, UpdateError::FlashStepFailed { step: FlashStep::Verify, .. }));
    }
}
