//! Mock Hardware Implementations
//!
//! Provides simulated devices for running the control loop without a bench.
//! All mock devices use async-safe operations (tokio::time::sleep, not std::thread::sleep).
//!
//! # Available Mocks
//!
//! - `MockMotion` - gantry with per-tool positions and travel timing
//! - `MockDecapper` - electromagnet and line-break sensor sharing one cap state
//! - `MockPump` - syringe pump that tallies withdrawn and infused volume
//! - `MockPotentiostat` - scripted OCP readings and technique failures
//! - `MockCamera` - image capture
//! - `MockAlerts` - records notifications, replays queued operator commands
//!
//! `MockRig` bundles one of each and hands out a [`Toolkit`].

use anyhow::Result;
use async_trait::async_trait;
use parking_lot::{Mutex, RwLock};
use std::collections::{HashMap, VecDeque};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::time::{sleep, Duration};

use super::ports::{
    AlertChannel, AlertPort, CameraPort, DecapperPort, MotionPort, OcpReading, PotentiostatPort,
    PumpPort, SensorPort, Tool,
};
use super::Toolkit;
use crate::experiment::{CaWaveform, CvWaveform};
use crate::labware::Coordinates;

// =============================================================================
// MockMotion - Simulated Gantry
// =============================================================================

/// Mock gantry with realistic timing
///
/// Simulates a three-axis gantry with:
/// - configurable travel speed (default 500 mm/sec)
/// - independent positions per mounted tool
/// - a log of every commanded move
pub struct MockMotion {
    positions: RwLock<HashMap<Tool, Coordinates>>,
    moves: Mutex<Vec<(Tool, Coordinates)>>,
    speed_mm_per_sec: f64,
}

impl MockMotion {
    pub fn new() -> Self {
        Self::with_speed(500.0)
    }

    /// # Arguments
    /// * `speed_mm_per_sec` - travel speed in mm/sec
    pub fn with_speed(speed_mm_per_sec: f64) -> Self {
        Self {
            positions: RwLock::new(HashMap::new()),
            moves: Mutex::new(Vec::new()),
            speed_mm_per_sec,
        }
    }

    /// Every move issued so far.
    pub fn moves(&self) -> Vec<(Tool, Coordinates)> {
        self.moves.lock().clone()
    }

    pub fn move_count(&self) -> usize {
        self.moves.lock().len()
    }
}

impl Default for MockMotion {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl MotionPort for MockMotion {
    async fn home(&self) -> Result<()> {
        self.positions.write().clear();
        tracing::debug!("MockMotion: homed");
        Ok(())
    }

    async fn move_to(&self, target: Coordinates, tool: Tool) -> Result<Coordinates> {
        let current = self.positions.read().get(&tool).copied().unwrap_or_default();
        let distance = ((target.x - current.x).powi(2)
            + (target.y - current.y).powi(2)
            + (target.z - current.z).powi(2))
        .sqrt();
        let delay_ms = (distance / self.speed_mm_per_sec * 1000.0) as u64;

        // CRITICAL: Use tokio::time::sleep, NOT std::thread::sleep
        sleep(Duration::from_millis(delay_ms)).await;

        self.positions.write().insert(tool, target);
        self.moves.lock().push((tool, target));
        tracing::trace!(%tool, x = target.x, y = target.y, z = target.z, "MockMotion: moved");
        Ok(target)
    }

    async fn position(&self, tool: Tool) -> Result<Coordinates> {
        Ok(self.positions.read().get(&tool).copied().unwrap_or_default())
    }

    async fn set_feed_rate(&self, mm_per_min: f64) -> Result<()> {
        if mm_per_min <= 0.0 {
            anyhow::bail!("MockMotion: feed rate must be positive, got {mm_per_min}");
        }
        Ok(())
    }
}

// =============================================================================
// MockDecapper - Electromagnet + Line-Break Sensor
// =============================================================================

#[derive(Default)]
struct DecapperState {
    holding: bool,
    failed_grips_left: u32,
    engage_count: u32,
}

/// Simulated decapper head.
///
/// The line-break sensor reports `true` while a cap is held. Grips can be
/// scripted to fail so retry behaviour can be exercised.
#[derive(Default)]
pub struct MockDecapper {
    state: Mutex<DecapperState>,
}

impl MockDecapper {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make the next `n` engagements miss the cap.
    pub fn fail_next_grips(&self, n: u32) {
        self.state.lock().failed_grips_left = n;
    }

    pub fn holding(&self) -> bool {
        self.state.lock().holding
    }

    pub fn engage_count(&self) -> u32 {
        self.state.lock().engage_count
    }
}

#[async_trait]
impl DecapperPort for MockDecapper {
    async fn engage(&self) -> Result<()> {
        let mut state = self.state.lock();
        state.engage_count += 1;
        if state.failed_grips_left > 0 {
            state.failed_grips_left -= 1;
            state.holding = false;
        } else {
            state.holding = true;
        }
        Ok(())
    }

    async fn release(&self) -> Result<()> {
        self.state.lock().holding = false;
        Ok(())
    }
}

#[async_trait]
impl SensorPort for MockDecapper {
    async fn line_break(&self) -> Result<bool> {
        Ok(self.state.lock().holding)
    }
}

// =============================================================================
// MockPump - Simulated Syringe Pump
// =============================================================================

#[derive(Debug, Default, Clone, Copy, PartialEq)]
pub struct PumpTotals {
    pub withdrawn_ul: f64,
    pub infused_ul: f64,
    pub blown_out_ul: f64,
}

/// Syringe pump that records volumes instead of moving a plunger.
#[derive(Default)]
pub struct MockPump {
    totals: Mutex<PumpTotals>,
}

impl MockPump {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn totals(&self) -> PumpTotals {
        *self.totals.lock()
    }
}

#[async_trait]
impl PumpPort for MockPump {
    async fn withdraw(&self, volume_ul: f64) -> Result<()> {
        if volume_ul < 0.0 {
            anyhow::bail!("MockPump: negative withdraw {volume_ul}");
        }
        self.totals.lock().withdrawn_ul += volume_ul;
        Ok(())
    }

    async fn infuse(&self, volume_ul: f64, blowout_ul: f64) -> Result<()> {
        let mut totals = self.totals.lock();
        totals.infused_ul += volume_ul;
        totals.blown_out_ul += blowout_ul;
        Ok(())
    }
}

// =============================================================================
// MockPotentiostat
// =============================================================================

/// Potentiostat with scripted OCP readings.
///
/// Readings are consumed front to back; once the script is empty every
/// measurement passes at 0.25 V. CA and CV can be made to fail.
pub struct MockPotentiostat {
    ocp_script: Mutex<VecDeque<(bool, f64)>>,
    fail_ca: RwLock<bool>,
    fail_cv: RwLock<bool>,
    runs: Mutex<Vec<String>>,
}

impl MockPotentiostat {
    pub fn new() -> Self {
        Self {
            ocp_script: Mutex::new(VecDeque::new()),
            fail_ca: RwLock::new(false),
            fail_cv: RwLock::new(false),
            runs: Mutex::new(Vec::new()),
        }
    }

    /// Queue OCP results `(passed, final_voltage)`.
    pub fn script_ocp(&self, readings: impl IntoIterator<Item = (bool, f64)>) {
        self.ocp_script.lock().extend(readings);
    }

    pub fn set_fail_ca(&self, fail: bool) {
        *self.fail_ca.write() = fail;
    }

    pub fn set_fail_cv(&self, fail: bool) {
        *self.fail_cv.write() = fail;
    }

    /// Techniques run so far, e.g. `["ocp", "ca"]`.
    pub fn runs(&self) -> Vec<String> {
        self.runs.lock().clone()
    }
}

impl Default for MockPotentiostat {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl PotentiostatPort for MockPotentiostat {
    async fn run_ocp(&self, output: &Path) -> Result<OcpReading> {
        sleep(Duration::from_millis(10)).await;
        self.runs.lock().push("ocp".into());
        let (passed, final_voltage) = self.ocp_script.lock().pop_front().unwrap_or((true, 0.25));
        Ok(OcpReading {
            passed,
            final_voltage,
            data: output.to_path_buf(),
        })
    }

    async fn run_ca(&self, waveform: &CaWaveform, output: &Path) -> Result<PathBuf> {
        sleep(Duration::from_millis(10)).await;
        self.runs.lock().push("ca".into());
        if *self.fail_ca.read() {
            anyhow::bail!("MockPotentiostat: CA aborted at {} V", waveform.step_1_voltage);
        }
        Ok(output.to_path_buf())
    }

    async fn run_cv(&self, waveform: &CvWaveform, output: &Path) -> Result<PathBuf> {
        sleep(Duration::from_millis(10)).await;
        self.runs.lock().push("cv".into());
        if *self.fail_cv.read() {
            anyhow::bail!(
                "MockPotentiostat: CV aborted after {} cycles",
                waveform.cycle_count
            );
        }
        Ok(output.to_path_buf())
    }
}

// =============================================================================
// MockCamera
// =============================================================================

#[derive(Default)]
pub struct MockCamera {
    captures: Mutex<Vec<PathBuf>>,
}

impl MockCamera {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn captures(&self) -> Vec<PathBuf> {
        self.captures.lock().clone()
    }
}

#[async_trait]
impl CameraPort for MockCamera {
    async fn capture(&self, path: &Path) -> Result<(PathBuf, bool)> {
        // Simulate 30fps frame readout time
        sleep(Duration::from_millis(33)).await;
        self.captures.lock().push(path.to_path_buf());
        Ok((path.to_path_buf(), true))
    }
}

// =============================================================================
// MockAlerts
// =============================================================================

/// Records outgoing notifications and replays operator commands.
#[derive(Default)]
pub struct MockAlerts {
    sent: Mutex<Vec<(AlertChannel, String)>>,
    commands: Mutex<VecDeque<String>>,
}

impl MockAlerts {
    pub fn new() -> Self {
        Self::default()
    }

    /// Queue a command as if an operator had typed it.
    pub fn push_command(&self, command: &str) {
        self.commands.lock().push_back(command.to_string());
    }

    pub fn sent(&self) -> Vec<(AlertChannel, String)> {
        self.sent.lock().clone()
    }

    /// Whether any message on `channel` contains `needle`.
    pub fn contains(&self, channel: AlertChannel, needle: &str) -> bool {
        self.sent
            .lock()
            .iter()
            .any(|(c, m)| *c == channel && m.contains(needle))
    }
}

#[async_trait]
impl AlertPort for MockAlerts {
    async fn send(&self, channel: AlertChannel, message: &str) -> Result<()> {
        self.sent.lock().push((channel, message.to_string()));
        Ok(())
    }

    async fn send_file(&self, channel: AlertChannel, path: &Path, caption: &str) -> Result<()> {
        self.sent
            .lock()
            .push((channel, format!("{caption}: {}", path.display())));
        Ok(())
    }

    async fn poll_commands(&self) -> Result<Vec<String>> {
        Ok(self.commands.lock().drain(..).collect())
    }
}

// =============================================================================
// MockRig
// =============================================================================

/// One of every mock device.
#[derive(Clone)]
pub struct MockRig {
    pub motion: Arc<MockMotion>,
    pub decapper: Arc<MockDecapper>,
    pub pump: Arc<MockPump>,
    pub potentiostat: Arc<MockPotentiostat>,
    pub camera: Arc<MockCamera>,
    pub alerts: Arc<MockAlerts>,
}

impl MockRig {
    pub fn new() -> Self {
        Self {
            motion: Arc::new(MockMotion::new()),
            decapper: Arc::new(MockDecapper::new()),
            pump: Arc::new(MockPump::new()),
            potentiostat: Arc::new(MockPotentiostat::new()),
            camera: Arc::new(MockCamera::new()),
            alerts: Arc::new(MockAlerts::new()),
        }
    }

    pub fn toolkit(&self) -> Toolkit {
        Toolkit {
            motion: self.motion.clone(),
            sensor: self.decapper.clone(),
            decapper: self.decapper.clone(),
            pump: self.pump.clone(),
            potentiostat: self.potentiostat.clone(),
            camera: self.camera.clone(),
            alerts: self.alerts.clone(),
        }
    }
}

impl Default for MockRig {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test(start_paused = true)]
    async fn test_mock_motion_tracks_tools_separately() {
        let motion = MockMotion::new();
        motion
            .move_to(Coordinates::new(10.0, 0.0, 0.0), Tool::Pipette)
            .await
            .unwrap();
        assert_eq!(
            motion.position(Tool::Pipette).await.unwrap(),
            Coordinates::new(10.0, 0.0, 0.0)
        );
        assert_eq!(
            motion.position(Tool::Electrode).await.unwrap(),
            Coordinates::default()
        );
        assert_eq!(motion.move_count(), 1);
    }

    #[tokio::test]
    async fn test_mock_potentiostat_script() {
        let pstat = MockPotentiostat::new();
        pstat.script_ocp([(false, 0.0005)]);
        let first = pstat.run_ocp(Path::new("a.txt")).await.unwrap();
        let second = pstat.run_ocp(Path::new("b.txt")).await.unwrap();
        assert!(!first.passed);
        assert!(second.passed);
        assert_eq!(pstat.runs(), vec!["ocp", "ocp"]);
    }

    #[tokio::test]
    async fn test_mock_alerts_drain_commands() {
        let alerts = MockAlerts::new();
        alerts.push_command("pause");
        alerts.push_command("resume");
        assert_eq!(alerts.poll_commands().await.unwrap(), vec!["pause", "resume"]);
        assert!(alerts.poll_commands().await.unwrap().is_empty());
    }
}
