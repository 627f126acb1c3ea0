//! Device delay from position counters and hardware timestamps
//!
//! Two sources are available: the device play head, which is cheap but
//! coarse, and a hardware timestamp pairing a frame position with the
//! monotonic time it was played at. The timestamp is preferred and
//! extrapolated to "now"; the play head is the fallback.
//!
//! Platform streams may restart internally (typically after an underrun) and
//! report positions from zero again. A backward jump re-anchors a baseline
//! so the effective head keeps counting from where it was.

use crate::config::SinkConfig;
use crate::device::{Device, DeviceTimestamp};

const NANOS_PER_SEC: f64 = 1_000_000_000.0;

/// Pause time not yet reflected in a delay report
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct PauseState {
    pause_ms: f64,
}

impl PauseState {
    pub fn add(&mut self, millis: u32) {
        self.pause_ms += millis as f64;
    }

    pub fn pending_ms(&self) -> f64 {
        self.pause_ms
    }

    /// Consume the pending pause, in seconds
    pub fn take_secs(&mut self) -> f64 {
        let secs = self.pause_ms / 1000.0;
        self.pause_ms = 0.0;
        secs
    }

    pub fn clear(&mut self) {
        self.pause_ms = 0.0;
    }
}

/// Which source a delay came from
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DelaySource {
    Timestamp,
    HeadPosition,
}

/// Result of one reconciliation cycle
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Reconciliation {
    /// Unsmoothed delay in seconds, pause included
    pub delay_secs: f64,
    /// Effective play head after rebasing
    pub head_frames: u64,
    pub source: DelaySource,
    /// A backward jump was detected this cycle
    pub discontinuity: bool,
    pub timestamp: Option<DeviceTimestamp>,
}

/// Polling cadence and regression tolerance
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReconcilerSettings {
    pub refresh_calls: u32,
    pub refresh_interval_nanos: u64,
    pub tolerance_frames: u64,
}

impl From<&SinkConfig> for ReconcilerSettings {
    fn from(config: &SinkConfig) -> Self {
        Self {
            refresh_calls: config.timestamp_refresh_calls.max(1),
            refresh_interval_nanos: config.timestamp_refresh_interval().as_nanos() as u64,
            tolerance_frames: config.discontinuity_tolerance_frames,
        }
    }
}

impl Default for ReconcilerSettings {
    fn default() -> Self {
        Self::from(&SinkConfig::default())
    }
}

#[derive(Debug)]
pub struct TimestampReconciler {
    sample_rate: u32,
    settings: ReconcilerSettings,
    /// Added to raw device positions
    baseline: u64,
    last_raw_head: Option<u64>,
    /// Effective head, never decreases
    head: u64,
    cached: Option<DeviceTimestamp>,
    last_raw_stamp: Option<u64>,
    calls_since_poll: u32,
    last_poll_nanos: Option<u64>,
    discontinuities: u64,
    /// Device is playing; a paused device keeps its buffer but not its clock
    running: bool,
}

impl TimestampReconciler {
    pub fn new(sample_rate: u32, settings: ReconcilerSettings) -> Self {
        Self {
            sample_rate: sample_rate.max(1),
            settings,
            baseline: 0,
            last_raw_head: None,
            head: 0,
            cached: None,
            last_raw_stamp: None,
            calls_since_poll: 0,
            last_poll_nanos: None,
            discontinuities: 0,
            running: true,
        }
    }

    /// Effective play head as of the last cycle
    pub fn head_frames(&self) -> u64 {
        self.head
    }

    /// Track whether the device is playing.
    ///
    /// Timestamps are not extrapolated while paused, and the first query
    /// after a resume fetches a fresh one.
    pub fn set_running(&mut self, running: bool) {
        if self.running != running {
            self.running = running;
            self.cached = None;
            self.last_poll_nanos = None;
        }
    }

    pub fn is_running(&self) -> bool {
        self.running
    }

    /// Map a raw device position onto the effective timeline without
    /// updating any state. A position below the last observed one is read
    /// as a restarted counter.
    pub fn effective_position(&self, raw: u64, frames_written: u64) -> u64 {
        let baseline = if self.regressed(raw, self.last_raw_head) {
            self.rebased()
        } else {
            self.baseline
        };
        (baseline + raw).max(self.head).min(frames_written)
    }

    /// Feed a raw head reading, rebasing on a backward jump. Returns true
    /// when a discontinuity was detected.
    pub fn observe_head(&mut self, raw: u64, frames_written: u64) -> bool {
        let discontinuity = self.regressed(raw, self.last_raw_head);
        if discontinuity {
            let baseline = self.rebased();
            tracing::warn!(
                "Device position went backwards ({} -> {}), resyncing at frame {}",
                self.last_raw_head.unwrap_or_default(),
                raw,
                baseline + raw
            );
            self.baseline = baseline;
            self.cached = None;
            self.last_raw_stamp = None;
            self.discontinuities += 1;
        }
        self.last_raw_head = Some(raw);
        self.head = (self.baseline + raw).max(self.head).min(frames_written);
        discontinuity
    }

    /// Baseline after the counter restarted from zero: everything it counted
    /// before stays played
    fn rebased(&self) -> u64 {
        self.baseline + self.last_raw_head.unwrap_or_default()
    }

    pub fn cached_timestamp(&self) -> Option<DeviceTimestamp> {
        self.cached
    }

    pub fn discontinuities(&self) -> u64 {
        self.discontinuities
    }

    fn frames_to_secs(&self, frames: f64) -> f64 {
        frames / self.sample_rate as f64
    }

    fn regressed(&self, raw: u64, last: Option<u64>) -> bool {
        matches!(last, Some(last) if raw.saturating_add(self.settings.tolerance_frames) < last)
    }

    fn timestamp_due(&self, now: u64) -> bool {
        match self.last_poll_nanos {
            None => true,
            Some(last) => {
                self.calls_since_poll >= self.settings.refresh_calls
                    || now.saturating_sub(last) >= self.settings.refresh_interval_nanos
            }
        }
    }

    /// Run one cycle against `device`.
    ///
    /// `frames_written` is the total the device has accepted this session.
    /// Pending pause time is consumed into the result.
    pub fn reconcile(
        &mut self,
        device: &mut dyn Device,
        frames_written: u64,
        pause: &mut PauseState,
        now: u64,
    ) -> Reconciliation {
        let raw_head = device.position_frames();
        let mut discontinuity = self.observe_head(raw_head, frames_written);

        self.calls_since_poll = self.calls_since_poll.saturating_add(1);
        if !discontinuity && self.running && self.timestamp_due(now) {
            self.calls_since_poll = 0;
            self.last_poll_nanos = Some(now);
            match device.timestamp() {
                Some(stamp) if self.regressed(stamp.position_frames, self.last_raw_stamp) => {
                    tracing::warn!(
                        "Hardware timestamp went backwards ({} -> {})",
                        self.last_raw_stamp.unwrap_or_default(),
                        stamp.position_frames
                    );
                    self.cached = None;
                    self.last_raw_stamp = None;
                    self.discontinuities += 1;
                    discontinuity = true;
                }
                Some(stamp) => {
                    self.cached = Some(stamp);
                    self.last_raw_stamp = Some(stamp.position_frames);
                }
                None => self.cached = None,
            }
        }

        let pending = frames_written.saturating_sub(self.head);
        let mut delay_secs = self.frames_to_secs(pending as f64);
        let mut source = DelaySource::HeadPosition;

        if let (false, true, Some(stamp)) = (discontinuity, self.running, self.cached) {
            let stamp_head = (self.baseline + stamp.position_frames) as f64;
            let elapsed = now.saturating_sub(stamp.nanos) as f64 / NANOS_PER_SEC;
            let played = stamp_head + elapsed * self.sample_rate as f64;
            let written = frames_written as f64;
            delay_secs = self
                .frames_to_secs(written - played)
                .clamp(0.0, self.frames_to_secs(written));
            source = DelaySource::Timestamp;
        }

        delay_secs += pause.take_secs();

        Reconciliation {
            delay_secs,
            head_frames: self.head,
            source,
            discontinuity,
            timestamp: self.cached,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::DeviceError;

    /// Device that reports whatever the test sets
    #[derive(Default)]
    struct Scripted {
        position: u64,
        stamp: Option<DeviceTimestamp>,
        stamp_polls: usize,
    }

    impl Device for Scripted {
        fn write(&mut self, bytes: &[u8]) -> Result<usize, DeviceError> {
            Ok(bytes.len() / 4)
        }
        fn position_frames(&mut self) -> u64 {
            self.position
        }
        fn timestamp(&mut self) -> Option<DeviceTimestamp> {
            self.stamp_polls += 1;
            self.stamp
        }
        fn play(&mut self) {}
        fn pause(&mut self) {}
        fn stop(&mut self) {}
        fn close(&mut self) {}
        fn is_open(&self) -> bool {
            true
        }
    }

    fn reconciler() -> TimestampReconciler {
        TimestampReconciler::new(48000, ReconcilerSettings::default())
    }

    #[test]
    fn test_fallback_is_buffer_fill() {
        let mut rec = reconciler();
        let mut device = Scripted { position: 2400, ..Default::default() };
        let mut pause = PauseState::default();

        let r = rec.reconcile(&mut device, 9600, &mut pause, 0);
        assert_eq!(r.source, DelaySource::HeadPosition);
        assert!((r.delay_secs - 0.15).abs() < 1e-9);
    }

    #[test]
    fn test_timestamp_is_extrapolated_to_now() {
        let mut rec = reconciler();
        let mut device = Scripted {
            position: 4800,
            stamp: Some(DeviceTimestamp { position_frames: 4800, nanos: 1_000_000_000 }),
            ..Default::default()
        };
        let mut pause = PauseState::default();

        // 9600 written, 4800 played at t=1s, now t=1.05s: 2400 more played
        let r = rec.reconcile(&mut device, 9600, &mut pause, 1_050_000_000);
        assert_eq!(r.source, DelaySource::Timestamp);
        assert!((r.delay_secs - 0.05).abs() < 1e-9);
    }

    #[test]
    fn test_timestamp_polled_at_bounded_rate() {
        let mut rec = reconciler();
        let mut device = Scripted {
            stamp: Some(DeviceTimestamp { position_frames: 10, nanos: 0 }),
            ..Default::default()
        };
        let mut pause = PauseState::default();

        for _ in 0..6 {
            rec.reconcile(&mut device, 48000, &mut pause, 0);
        }
        // first call, then every second call
        assert_eq!(device.stamp_polls, 3);
    }

    #[test]
    fn test_head_regression_resyncs_baseline() {
        let mut rec = reconciler();
        let mut device = Scripted { position: 5000, ..Default::default() };
        let mut pause = PauseState::default();

        let before = rec.reconcile(&mut device, 9600, &mut pause, 0);
        device.position = 0;
        let after = rec.reconcile(&mut device, 9600, &mut pause, 0);

        assert!(after.discontinuity);
        assert!(after.delay_secs >= 0.0);
        assert!(after.delay_secs <= before.delay_secs + 1e-12);
        assert_eq!(after.head_frames, 5000);
        assert_eq!(rec.discontinuities(), 1);

        // Counting resumes from the re-anchored head
        device.position = 100;
        let next = rec.reconcile(&mut device, 9600, &mut pause, 0);
        assert_eq!(next.head_frames, 5100);
        assert!(!next.discontinuity);
    }

    #[test]
    fn test_regressed_timestamp_falls_back() {
        let mut rec = reconciler();
        let mut device = Scripted {
            position: 4000,
            stamp: Some(DeviceTimestamp { position_frames: 4000, nanos: 0 }),
            ..Default::default()
        };
        let mut pause = PauseState::default();
        rec.reconcile(&mut device, 9600, &mut pause, 0);

        device.stamp = Some(DeviceTimestamp { position_frames: 100, nanos: 0 });
        let r = rec.reconcile(&mut device, 9600, &mut pause, 200_000_000);
        assert!(r.discontinuity);
        assert_eq!(r.source, DelaySource::HeadPosition);
        assert_eq!(rec.cached_timestamp(), None);
    }

    #[test]
    fn test_pause_is_added_once() {
        let mut rec = reconciler();
        let mut device = Scripted { position: 9600, ..Default::default() };
        let mut pause = PauseState::default();
        pause.add(250);

        let r = rec.reconcile(&mut device, 9600, &mut pause, 0);
        assert!((r.delay_secs - 0.25).abs() < 1e-9);
        assert_eq!(pause.pending_ms(), 0.0);

        let r = rec.reconcile(&mut device, 9600, &mut pause, 0);
        assert_eq!(r.delay_secs, 0.0);
    }

    #[test]
    fn test_head_is_clamped_to_written() {
        let mut rec = reconciler();
        let mut device = Scripted { position: 20000, ..Default::default() };
        let mut pause = PauseState::default();

        let r = rec.reconcile(&mut device, 9600, &mut pause, 0);
        assert_eq!(r.head_frames, 9600);
        assert_eq!(r.delay_secs, 0.0);
    }

    #[test]
    fn test_restarted_counter_keeps_played_frames() {
        let mut rec = reconciler();
        let mut device = Scripted { position: 5000, ..Default::default() };
        let mut pause = PauseState::default();
        rec.reconcile(&mut device, 9600, &mut pause, 0);

        // Restart, then the remaining 4600 frames play out
        assert!(rec.observe_head(4600, 9600));
        assert_eq!(rec.head_frames(), 9600);
        assert!(!rec.observe_head(4600, 9600));
        assert_eq!(rec.head_frames(), 9600);
    }

    #[test]
    fn test_effective_position_rebases_without_mutation() {
        let mut rec = reconciler();
        rec.observe_head(5000, 9600);

        assert_eq!(rec.effective_position(4000, 9600), 9000);
        assert_eq!(rec.effective_position(6000, 9600), 6000);
        // Nothing was recorded by the reads above
        assert_eq!(rec.head_frames(), 5000);
        assert_eq!(rec.discontinuities(), 0);
    }

    #[test]
    fn test_paused_device_does_not_extrapolate() {
        let mut rec = reconciler();
        let mut device = Scripted {
            position: 960,
            stamp: Some(DeviceTimestamp { position_frames: 960, nanos: 0 }),
            ..Default::default()
        };
        let mut pause = PauseState::default();

        let playing = rec.reconcile(&mut device, 4800, &mut pause, 0);
        assert!((playing.delay_secs - 0.08).abs() < 1e-9);

        rec.set_running(false);
        assert!(!rec.is_running());
        let polls = device.stamp_polls;
        for step in 1..=5 {
            let r = rec.reconcile(&mut device, 4800, &mut pause, step * 100_000_000);
            assert_eq!(r.source, DelaySource::HeadPosition);
            assert!((r.delay_secs - 0.08).abs() < 1e-9);
        }
        assert_eq!(device.stamp_polls, polls);

        // Resume refetches before extrapolating again
        rec.set_running(true);
        device.stamp = Some(DeviceTimestamp { position_frames: 960, nanos: 600_000_000 });
        let resumed = rec.reconcile(&mut device, 4800, &mut pause, 600_000_000);
        assert_eq!(resumed.source, DelaySource::Timestamp);
        assert!((resumed.delay_secs - 0.08).abs() < 1e-9);
    }
}
