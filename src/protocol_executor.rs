use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use crate::board_protocol::{BoardCommand, SamplingFlags, SAMPLE_BUFFER_CAPACITY};
use crate::calibration::{CalibrationProfile, CalibrationStore};
use crate::config::FeedbackConfig;
use crate::device_session::{DeviceSession, SamplingRequest, SessionError};
use crate::measurement::{mean, MeasurementResult, SampleBuffer, SampleConverter, LOW_ACTUATION_VOLTAGE};
use crate::post_processing::{normalize_force, smooth, PostProcessError};
use crate::safety::{
    check_current, check_voltage_tolerance, check_waveform, predicted_current, SafetyError, ToleranceLog,
    ToleranceViolation, ToleranceWarning,
};

/// Longest sleep while a step holds its electrodes.
const ACTUATION_POLL: Duration = Duration::from_millis(20);

/// Set point corrections tried on one point before its violations are kept.
pub const MAX_OUTPUT_ADJUSTMENTS: u32 = 5;

#[derive(Debug, thiserror::Error)]
pub enum ExecutorError {
    #[error("Session error: {0}")]
    Session(#[from] SessionError),

    #[error("Safety error: {0}")]
    Safety(#[from] SafetyError),

    #[error("Post-processing error: {0}")]
    PostProcess(#[from] PostProcessError),

    #[error("Invalid step {index}: {reason}")]
    InvalidStep { index: usize, reason: String },
}

/// Re-measure with a raised voltage until the force lands in the band.
#[derive(Debug, Clone, PartialEq)]
pub struct RetryPolicy {
    /// Total attempts, the first one included.
    pub max_attempts: u32,
    /// Accepted force band (µN/mm, or F when normalisation is off).
    pub acceptable_force: (f64, f64),
    /// Volts added for every further attempt.
    pub increase_voltage: f64,
}

#[derive(Debug, Clone, PartialEq, Default)]
pub enum FeedbackAction {
    /// Actuate, measure if samples were requested, never retry.
    #[default]
    None,
    Retry(RetryPolicy),
    /// Measure at `steps` log-spaced frequencies at the step voltage.
    SweepFrequency { start: f64, end: f64, steps: usize },
    /// Measure at `steps` evenly spaced voltages at the step frequency.
    SweepVoltage { start: f64, end: f64, steps: usize },
}

/// One step of a protocol: what to actuate, for how long, and what to measure.
#[derive(Debug, Clone, PartialEq)]
pub struct ProtocolStep {
    /// Actuation voltage (V RMS).
    pub voltage: f64,
    pub frequency: f64,
    pub duration: Duration,
    /// Samples to take over the duration; 0 actuates without measuring.
    pub requested_samples: usize,
    /// Electrode switch states, one per channel.
    pub channels: Vec<bool>,
    /// Area of the actuated electrodes (mm²).
    pub actuated_area: f64,
    pub feedback: FeedbackAction,
}

impl ProtocolStep {
    pub fn new(voltage: f64, frequency: f64, duration: Duration) -> Self {
        Self {
            voltage,
            frequency,
            duration,
            requested_samples: 0,
            channels: Vec::new(),
            actuated_area: 0.0,
            feedback: FeedbackAction::None,
        }
    }

    pub fn with_samples(mut self, requested_samples: usize) -> Self {
        self.requested_samples = requested_samples;
        self
    }

    pub fn with_channels(mut self, channels: Vec<bool>, actuated_area: f64) -> Self {
        self.channels = channels;
        self.actuated_area = actuated_area;
        self
    }

    pub fn with_feedback(mut self, feedback: FeedbackAction) -> Self {
        self.feedback = feedback;
        self
    }

    /// `(voltage, frequency)` of every measurement point, in order.
    fn points(&self) -> Vec<(f64, f64)> {
        match self.feedback {
            FeedbackAction::SweepFrequency { start, end, steps } => (0..steps)
                .map(|i| (self.voltage, start * (end / start).powf(fraction(i, steps))))
                .collect(),
            FeedbackAction::SweepVoltage { start, end, steps } => (0..steps)
                .map(|i| (start + (end - start) * fraction(i, steps), self.frequency))
                .collect(),
            FeedbackAction::None | FeedbackAction::Retry(_) => vec![(self.voltage, self.frequency)],
        }
    }
}

fn fraction(i: usize, steps: usize) -> f64 {
    if steps < 2 {
        0.0
    } else {
        i as f64 / (steps - 1) as f64
    }
}

/// Timing the board is asked to sample with.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SampleSchedule {
    pub n_samples: u16,
    pub sampling_window_ms: u16,
    pub delay_between_windows_ms: u16,
}

impl SampleSchedule {
    pub fn period_ms(&self) -> u64 {
        u64::from(self.sampling_window_ms) + u64::from(self.delay_between_windows_ms)
    }

    pub fn to_request(&self, flags: SamplingFlags) -> SamplingRequest {
        SamplingRequest {
            sampling_window_ms: self.sampling_window_ms,
            n_windows: self.n_samples,
            delay_between_windows_ms: self.delay_between_windows_ms,
            flags,
        }
    }
}

/// Spread up to `requested` samples over `duration` without exceeding `capacity`.
///
/// The sample period is the longer of the minimum period (sampling window
/// plus minimum delay) and the duration divided evenly; the sample count is
/// then cut to what fits in the duration at that period.
pub fn compute_schedule(
    duration: Duration,
    requested: usize,
    sampling_window_ms: u16,
    min_delay_ms: u16,
    capacity: usize,
) -> SampleSchedule {
    let n = requested.min(capacity).min(usize::from(u16::MAX)) as u64;
    let duration_ms = duration.as_millis().min(u128::from(u64::MAX)) as u64;
    let window = u64::from(sampling_window_ms);
    let min_period = window + u64::from(min_delay_ms);
    if n == 0 || duration_ms == 0 {
        return SampleSchedule {
            n_samples: 0,
            sampling_window_ms,
            delay_between_windows_ms: min_delay_ms,
        };
    }

    let max_period = window + u64::from(u16::MAX);
    let period = min_period.max(duration_ms.div_ceil(n)).min(max_period).max(1);
    let effective = n.min(duration_ms.div_ceil(period));
    SampleSchedule {
        n_samples: effective as u16,
        sampling_window_ms,
        delay_between_windows_ms: (period - window) as u16,
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StepState {
    Idle,
    Actuating,
    Sampling,
    Validating,
    Retrying,
    Completed,
    Aborted,
    Cancelled,
}

impl fmt::Display for StepState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Idle => "idle",
            Self::Actuating => "actuating",
            Self::Sampling => "sampling",
            Self::Validating => "validating",
            Self::Retrying => "retrying",
            Self::Completed => "completed",
            Self::Aborted => "aborted",
            Self::Cancelled => "cancelled",
        };
        f.write_str(name)
    }
}

struct StepTracker {
    index: usize,
    state: StepState,
}

impl StepTracker {
    fn new(index: usize) -> Self {
        Self {
            index,
            state: StepState::Idle,
        }
    }

    fn transition(&mut self, next: StepState) {
        log::debug!("Step {}: {} -> {}", self.index, self.state, next);
        self.state = next;
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StepStatus {
    Completed,
    /// Retries ran out with the force outside the band or no usable
    /// samples. Not an error.
    OutOfBand,
    Cancelled,
}

#[derive(Debug, Clone, PartialEq)]
pub struct StepReport {
    pub index: usize,
    /// One result per attempt or sweep point, partial ones included.
    pub measurements: Vec<MeasurementResult>,
    pub attempts: u32,
    pub status: StepStatus,
    pub tolerance_violations: usize,
}

impl StepReport {
    pub fn last_measurement(&self) -> Option<&MeasurementResult> {
        self.measurements.last()
    }
}

#[derive(Debug)]
pub enum ProtocolOutcome {
    Completed,
    Cancelled { step: usize },
    Aborted { step: usize, error: ExecutorError },
}

#[derive(Debug)]
pub struct ProtocolReport {
    pub steps: Vec<StepReport>,
    pub outcome: ProtocolOutcome,
    /// Every voltage tolerance violation of the run, reported once.
    pub tolerance_warning: Option<ToleranceWarning>,
}

impl ProtocolReport {
    pub fn is_completed(&self) -> bool {
        matches!(self.outcome, ProtocolOutcome::Completed)
    }

    /// Step reports, or the error that aborted the run.
    pub fn into_result(self) -> Result<Vec<StepReport>, ExecutorError> {
        match self.outcome {
            ProtocolOutcome::Aborted { error, .. } => Err(error),
            ProtocolOutcome::Completed | ProtocolOutcome::Cancelled { .. } => Ok(self.steps),
        }
    }
}

/// Requests cancellation of a running protocol from any thread.
#[derive(Debug, Clone, Default)]
pub struct CancelHandle(Arc<AtomicBool>);

impl CancelHandle {
    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }

    fn reset(&self) {
        self.0.store(false, Ordering::SeqCst);
    }
}

/// State carried from one step to the next within a protocol run.
#[derive(Debug)]
pub struct ProtocolRun {
    tolerance: ToleranceLog,
    output_correction: f64,
}

impl Default for ProtocolRun {
    fn default() -> Self {
        Self {
            tolerance: ToleranceLog::new(),
            output_correction: 1.0,
        }
    }
}

impl ProtocolRun {
    pub fn new() -> Self {
        Self::default()
    }

    /// Factor between the requested actuation voltage and the set point sent
    /// to the board. Stays 1 unless amplifier gain adjustment is enabled.
    pub fn output_correction(&self) -> f64 {
        self.output_correction
    }

    /// Every tolerance violation recorded so far, as one warning.
    pub fn finish(mut self) -> Option<ToleranceWarning> {
        self.tolerance.flush()
    }
}

struct PointMeasurement {
    result: Option<MeasurementResult>,
    /// Samples were requested for this point.
    sampled: bool,
    interrupted: bool,
}

/// Runs protocol steps against a connected board.
#[derive(Debug, Default)]
pub struct ProtocolExecutor {
    cancel: CancelHandle,
}

impl ProtocolExecutor {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel_handle(&self) -> CancelHandle {
        self.cancel.clone()
    }

    /// Run `steps` in order.
    ///
    /// Cancellation is honoured between steps and, best effort, between
    /// buffer polls. All switches are commanded off when the run ends,
    /// whatever the outcome.
    pub fn run_protocol(
        &self,
        session: &mut DeviceSession,
        store: &mut CalibrationStore,
        steps: &[ProtocolStep],
    ) -> ProtocolReport {
        let span = tracing::info_span!("protocol", steps = steps.len());
        let _entered = span.enter();
        self.cancel.reset();
        log::info!("Running protocol of {} steps", steps.len());

        let mut run = ProtocolRun::new();
        let mut reports = Vec::with_capacity(steps.len());
        let mut outcome = ProtocolOutcome::Completed;
        for (index, step) in steps.iter().enumerate() {
            if self.cancel.is_cancelled() {
                log::info!("Protocol cancelled before step {}", index);
                outcome = ProtocolOutcome::Cancelled { step: index };
                break;
            }
            match self.run_step(session, store, index, step, &mut run) {
                Ok(report) => {
                    let cancelled = report.status == StepStatus::Cancelled;
                    reports.push(report);
                    if cancelled {
                        outcome = ProtocolOutcome::Cancelled { step: index };
                        break;
                    }
                }
                Err(error) => {
                    log::error!("Protocol aborted in step {}: {}", index, error);
                    outcome = ProtocolOutcome::Aborted { step: index, error };
                    break;
                }
            }
        }

        if session.is_ready() {
            if let Err(e) = session.safe_off() {
                log::error!("Failed to switch electrodes off after protocol: {}", e);
            }
        }
        let tolerance_warning = run.finish();
        if let Some(warning) = &tolerance_warning {
            log::warn!("Actuation voltage out of tolerance: {}", warning);
        }
        ProtocolReport {
            steps: reports,
            outcome,
            tolerance_warning,
        }
    }

    /// Run one step. Any error leaves the board with all switches off.
    pub fn run_step(
        &self,
        session: &mut DeviceSession,
        store: &mut CalibrationStore,
        index: usize,
        step: &ProtocolStep,
        run: &mut ProtocolRun,
    ) -> Result<StepReport, ExecutorError> {
        let span = tracing::info_span!("step", index, voltage = step.voltage, frequency = step.frequency);
        let _entered = span.enter();
        #[cfg(feature = "cpu-profiling")]
        let _zone = tracy_client::Client::running()
            .map(|client| client.span(tracy_client::span_location!("run_step"), 0));

        let mut tracker = StepTracker::new(index);
        let result = self.run_points(session, store, index, step, run, &mut tracker);
        if result.is_err() {
            tracker.transition(StepState::Aborted);
            if session.is_ready() {
                if let Err(e) = session.safe_off() {
                    log::error!("Failed to switch electrodes off after step {}: {}", index, e);
                }
            }
        }
        result
    }

    fn validate_step(session: &DeviceSession, index: usize, step: &ProtocolStep) -> Result<(), ExecutorError> {
        let invalid = |reason: String| ExecutorError::InvalidStep { index, reason };
        let handshake = session.handshake().ok_or(SessionError::NotConnected)?;
        if step.channels.len() > usize::from(handshake.channel_count) {
            return Err(invalid(format!(
                "{} channels given, board has {}",
                step.channels.len(),
                handshake.channel_count
            )));
        }
        if !step.actuated_area.is_finite() || step.actuated_area < 0.0 {
            return Err(invalid(format!("actuated area {} mm²", step.actuated_area)));
        }
        match &step.feedback {
            FeedbackAction::Retry(policy) => {
                let (low, high) = policy.acceptable_force;
                if policy.max_attempts == 0 || low > high {
                    return Err(invalid(format!("retry policy {policy:?}")));
                }
            }
            FeedbackAction::SweepFrequency { start, end, steps } => {
                if *steps == 0 || *start <= 0.0 || *end <= 0.0 {
                    return Err(invalid(format!("frequency sweep {start}..{end} Hz in {steps} steps")));
                }
            }
            FeedbackAction::SweepVoltage { steps, .. } => {
                if *steps == 0 {
                    return Err(invalid("voltage sweep without points".to_string()));
                }
            }
            FeedbackAction::None => {}
        }
        Ok(())
    }

    fn run_points(
        &self,
        session: &mut DeviceSession,
        store: &mut CalibrationStore,
        index: usize,
        step: &ProtocolStep,
        run: &mut ProtocolRun,
        tracker: &mut StepTracker,
    ) -> Result<StepReport, ExecutorError> {
        Self::validate_step(session, index, step)?;
        let (max_attempts, increase_voltage) = match &step.feedback {
            FeedbackAction::Retry(policy) => (policy.max_attempts, policy.increase_voltage),
            _ => (1, 0.0),
        };
        let mut report = StepReport {
            index,
            measurements: Vec::new(),
            attempts: 0,
            status: StepStatus::Completed,
            tolerance_violations: 0,
        };

        'points: for (base_voltage, frequency) in step.points() {
            for attempt in 1..=max_attempts {
                if self.cancel.is_cancelled() {
                    tracker.transition(StepState::Cancelled);
                    report.status = StepStatus::Cancelled;
                    return Ok(report);
                }
                let voltage = base_voltage + increase_voltage * f64::from(attempt - 1);
                report.attempts += 1;

                let point = self.measure_with_adjustment(
                    session,
                    store,
                    index,
                    step,
                    voltage,
                    frequency,
                    run,
                    &mut report,
                    tracker,
                )?;
                if point.interrupted {
                    report.measurements.extend(point.result);
                    tracker.transition(StepState::Cancelled);
                    report.status = StepStatus::Cancelled;
                    return Ok(report);
                }

                let failure = match point.result {
                    None if !point.sampled => continue 'points,
                    None => "no usable samples".to_string(),
                    Some(result) => {
                        let force = result.force_estimate;
                        report.measurements.push(result);
                        let FeedbackAction::Retry(policy) = &step.feedback else {
                            continue 'points;
                        };
                        let (low, high) = policy.acceptable_force;
                        if (low..=high).contains(&force) {
                            log::debug!("Step {}: force {:.3} within band after {} attempts", index, force, attempt);
                            continue 'points;
                        }
                        format!("force {:.3} outside [{}, {}]", force, low, high)
                    }
                };
                if attempt == max_attempts {
                    log::warn!("Step {}: {} after {} attempts", index, failure, attempt);
                    report.status = StepStatus::OutOfBand;
                    continue 'points;
                }
                let next_voltage = base_voltage + increase_voltage * f64::from(attempt);
                let limits = &session.config().limits;
                if let Err(e) = check_waveform(next_voltage * run.output_correction, frequency, limits) {
                    log::warn!("Step {}: {}, not retrying at {} V: {}", index, failure, next_voltage, e);
                    report.status = StepStatus::OutOfBand;
                    continue 'points;
                }
                tracker.transition(StepState::Retrying);
                log::info!("Step {}: {}, retrying at {} V", index, failure, next_voltage);
            }
        }

        if report.status == StepStatus::Completed {
            tracker.transition(StepState::Completed);
        }
        Ok(report)
    }

    /// Measure one point, re-issuing it with a corrected set point while the
    /// measured actuation misses `voltage` and gain adjustment is enabled.
    ///
    /// Violations of the attempt that is kept are recorded, even when that
    /// attempt fails.
    #[allow(clippy::too_many_arguments)]
    fn measure_with_adjustment(
        &self,
        session: &mut DeviceSession,
        store: &mut CalibrationStore,
        index: usize,
        step: &ProtocolStep,
        voltage: f64,
        frequency: f64,
        run: &mut ProtocolRun,
        report: &mut StepReport,
        tracker: &mut StepTracker,
    ) -> Result<PointMeasurement, ExecutorError> {
        let auto_adjust = session.config().feedback.auto_adjust_amplifier_gain;
        let mut adjustments = 0;
        loop {
            let set_point = voltage * run.output_correction;
            let mut violations = Vec::new();
            let point = self.measure_point(
                session,
                store,
                step,
                voltage,
                set_point,
                frequency,
                &mut violations,
                tracker,
            );

            if auto_adjust && !violations.is_empty() {
                let measured = match &point {
                    Ok(PointMeasurement {
                        result: Some(result),
                        interrupted: false,
                        ..
                    }) => result.mean_actuation_voltage().filter(|v| *v >= LOW_ACTUATION_VOLTAGE),
                    _ => None,
                };
                if let Some(measured) = measured {
                    let correction = run.output_correction * voltage / measured;
                    let limits = &session.config().limits;
                    if adjustments == MAX_OUTPUT_ADJUSTMENTS {
                        log::error!("Step {}: {} V not reached after {} adjustments", index, voltage, adjustments);
                    } else if let Err(e) = check_waveform(voltage * correction, frequency, limits) {
                        log::warn!("Step {}: cannot correct set point for {} V: {}", index, voltage, e);
                    } else {
                        adjustments += 1;
                        log::info!(
                            "Step {}: measured {:.1} V for {} V, set point now {:.1} V",
                            index,
                            measured,
                            voltage,
                            voltage * correction
                        );
                        run.output_correction = correction;
                        continue;
                    }
                }
            }

            report.tolerance_violations += violations.len();
            run.tolerance.record(index, violations);
            return point;
        }
    }

    /// Actuate one point at `set_point` and, if samples were requested,
    /// measure it against the requested `voltage`. The electrodes stay
    /// actuated for the whole step duration.
    #[allow(clippy::too_many_arguments)]
    fn measure_point(
        &self,
        session: &mut DeviceSession,
        store: &mut CalibrationStore,
        step: &ProtocolStep,
        voltage: f64,
        set_point: f64,
        frequency: f64,
        violations: &mut Vec<ToleranceViolation>,
        tracker: &mut StepTracker,
    ) -> Result<PointMeasurement, ExecutorError> {
        let aref = session
            .handshake()
            .map(|handshake| handshake.aref_volts)
            .ok_or(SessionError::NotConnected)?;
        let feedback = session.config().feedback.clone();
        check_waveform(set_point, frequency, &session.config().limits)?;

        let profile = store.profile().clone();
        let known_stray = store.cached_stray_capacitance(frequency, set_point).unwrap_or(0.0);
        let expected_capacitance = profile.capacitance_baseline * step.actuated_area + known_stray;
        check_current(
            predicted_current(set_point, frequency, expected_capacitance),
            profile.current_limit,
        )?;

        let schedule = compute_schedule(
            step.duration,
            step.requested_samples,
            feedback.sampling_window_ms,
            feedback.min_delay_between_windows_ms,
            SAMPLE_BUFFER_CAPACITY,
        );
        let stray = if schedule.n_samples > 0 {
            store.stray_capacitance_or_measure(frequency, set_point, || {
                measure_stray(session, &profile, &feedback, aref, set_point, frequency)
            })?
        } else {
            0.0
        };

        tracker.transition(StepState::Actuating);
        session.request(&BoardCommand::SetWaveformFrequency(frequency as f32))?;
        session.request(&BoardCommand::SetWaveformVoltage(set_point as f32))?;
        session.request(&BoardCommand::SetSwitchStates(step.channels.clone()))?;
        let actuated_at = Instant::now();

        if schedule.n_samples == 0 {
            let interrupted = self.hold(step.duration);
            return Ok(PointMeasurement {
                result: None,
                sampled: false,
                interrupted,
            });
        }

        tracker.transition(StepState::Sampling);
        let request = schedule.to_request(sampling_flags(&feedback));
        let cancel = self.cancel.clone();
        let acquisition = session.acquire_samples(&request, &move || cancel.is_cancelled())?;

        tracker.transition(StepState::Validating);
        let converter = SampleConverter {
            profile: &profile,
            aref,
            frequency,
            period_ms: schedule.period_ms() as f64,
        };
        let result = process(
            &converter,
            &acquisition.buffer,
            &feedback,
            step.actuated_area,
            voltage,
            stray,
            violations,
        )?;
        let interrupted = acquisition.interrupted || self.hold(step.duration.saturating_sub(actuated_at.elapsed()));
        Ok(PointMeasurement {
            result,
            sampled: true,
            interrupted,
        })
    }

    /// Keep the electrodes actuated for `duration`; `true` if cancelled first.
    fn hold(&self, duration: Duration) -> bool {
        let deadline = Instant::now() + duration;
        loop {
            if self.cancel.is_cancelled() {
                return true;
            }
            let now = Instant::now();
            if now >= deadline {
                return false;
            }
            thread::sleep((deadline - now).min(ACTUATION_POLL));
        }
    }
}

fn sampling_flags(feedback: &FeedbackConfig) -> SamplingFlags {
    SamplingFlags {
        rms: feedback.use_rms,
        anti_aliasing_filter: feedback.use_anti_aliasing_filter,
    }
}

/// Capacitance seen with every switch off at this waveform.
fn measure_stray(
    session: &mut DeviceSession,
    profile: &CalibrationProfile,
    feedback: &FeedbackConfig,
    aref: f64,
    voltage: f64,
    frequency: f64,
) -> Result<f64, ExecutorError> {
    session.safe_off()?;
    session.request(&BoardCommand::SetWaveformFrequency(frequency as f32))?;
    session.request(&BoardCommand::SetWaveformVoltage(voltage as f32))?;
    let request = SamplingRequest {
        sampling_window_ms: feedback.sampling_window_ms,
        n_windows: feedback.stabilization_windows,
        delay_between_windows_ms: feedback.min_delay_between_windows_ms,
        flags: sampling_flags(feedback),
    };
    let acquisition = session.acquire_samples(&request, &|| false)?;
    let converter = SampleConverter {
        profile,
        aref,
        frequency,
        period_ms: request.period().as_secs_f64() * 1e3,
    };
    let mut capacitances = Vec::with_capacity(acquisition.buffer.len());
    for sample in converter.convert_all(&acquisition.buffer) {
        check_current(sample.current, profile.current_limit)?;
        capacitances.push(sample.capacitance);
    }
    Ok(mean(&capacitances).unwrap_or(0.0))
}

/// Validate converted samples and derive the reported series.
fn process(
    converter: &SampleConverter<'_>,
    buffer: &SampleBuffer,
    feedback: &FeedbackConfig,
    actuated_area: f64,
    voltage: f64,
    stray: f64,
    violations: &mut Vec<ToleranceViolation>,
) -> Result<Option<MeasurementResult>, ExecutorError> {
    let profile = converter.profile;
    let samples = converter.convert_all(buffer);
    let skipped = buffer.len() - samples.len();
    if skipped > 0 {
        log::debug!("Skipped {} saturated samples", skipped);
    }
    if samples.is_empty() {
        return Ok(None);
    }

    for sample in &samples {
        violations.extend(check_voltage_tolerance(
            voltage,
            sample.actuation_voltage,
            profile.voltage_tolerance,
        ));
        check_current(sample.current, profile.current_limit)?;
    }

    let time_ms: Vec<f64> = samples.iter().map(|s| s.time_ms).collect();
    let actuation_voltage: Vec<f64> = samples.iter().map(|s| s.actuation_voltage).collect();
    let impedance: Vec<f64> = samples.iter().map(|s| s.impedance).collect();
    let device_capacitance: Vec<f64> = samples.iter().map(|s| s.capacitance - stray).collect();

    if mean(&actuation_voltage).is_some_and(|v| v < LOW_ACTUATION_VOLTAGE) {
        log::warn!(
            "Measured actuation below {} V RMS; check that the amplifier is powered",
            LOW_ACTUATION_VOLTAGE
        );
    }

    let (capacitance, filter_applied) = smooth(&device_capacitance, &feedback.filter)?;
    let (force, force_normalized) = normalize_force(
        &capacitance,
        &actuation_voltage,
        actuated_area,
        profile,
        feedback.normalize_force,
    );
    let force_estimate = mean(&force).unwrap_or(0.0);

    Ok(Some(MeasurementResult {
        frequency: converter.frequency,
        voltage,
        actuated_area,
        time_ms,
        actuation_voltage,
        impedance,
        capacitance,
        force,
        force_estimate,
        amplifier_gain: profile.amplifier_gain,
        vgnd_high: profile.vgnd_high,
        vgnd_low: profile.vgnd_low,
        filter_applied,
        force_normalized,
        tolerance_violations_ignored: !violations.is_empty(),
    }))
}
