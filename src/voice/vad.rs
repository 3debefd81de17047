//! Voice Activity Detection (VAD) Module
//!
//! Provides real-time speech detection from audio streams.
//! Uses a hybrid approach combining energy-based detection with
//! optional ML-based enhancement (silero-vad or similar).
//!
//! # Architecture
//!
//! ```text
//! Audio Stream → Frame Extraction → Energy Analysis → Speech/Noise Decision
//!                                     ↓
//!                              ML Enhancement (optional)
//! ```
//!
//! # Features
//! - Real-time frame-by-frame analysis
//! - Configurable sensitivity thresholds
//! - Noise floor adaptation
//! - Hangover periods to prevent clipping
//! - ML-based enhancement support

use anyhow::{Result, Context, bail};
use std::collections::VecDeque;
use std::sync::{Arc, Mutex};
use std::sync::atomic::{AtomicBool, Ordering};
use tracing::{info, debug, trace};

/// Default sample rate for VAD processing
pub const DEFAULT_VAD_SAMPLE_RATE: u32 = 16000;

/// Frame size in samples (10ms at 16kHz)
pub const DEFAULT_FRAME_SIZE: usize = 160;

/// Default energy threshold (dB below peak)
pub const DEFAULT_ENERGY_THRESHOLD_DB: f32 = 40.0;

/// Default hangover frames (continue speech detection after energy drops)
pub const DEFAULT_HANGOVER_FRAMES: usize = 20; // 200ms

/// Default speech onset frames (require consecutive speech frames)
pub const DEFAULT_ONSET_FRAMES: usize = 3; // 30ms

/// Voice Activity Detector
pub struct Vad {
    /// Current VAD configuration
    config: VadConfig,
    /// Running energy level (for adaptive threshold)
    noise_floor: Arc<Mutex<f32>>,
    /// Current state
    state: Arc<Mutex<VadState>>,
    /// Frame history for hangover
    frame_history: Arc<Mutex<VecDeque<VadFrame>>>,
    /// Speech detection callback
    speech_callback: Option<Box<dyn Fn(bool) + Send + 'static>>,
    /// Currently detecting speech
    is_speech: Arc<AtomicBool>,
    /// Frame counter
    frame_count: Arc<Mutex<u64>>,
}

/// VAD configuration
#[derive(Debug, Clone, Copy)]
pub struct VadConfig {
    /// Sample rate in Hz
    pub sample_rate: u32,
    /// Frame size in samples
    pub frame_size: usize,
    /// Energy threshold in dB below peak
    pub energy_threshold_db: f32,
    /// Hangover frames after speech ends
    pub hangover_frames: usize,
    /// Onset frames required to start speech
    pub onset_frames: usize,
    /// Enable adaptive noise floor
    pub adaptive_noise_floor: bool,
    /// Noise floor adaptation rate (0.0-1.0)
    pub adaptation_rate: f32,
    /// Minimum speech duration in frames
    pub min_speech_frames: usize,
    /// Maximum silence within speech in frames
    pub max_silence_frames: usize,
}

impl Default for VadConfig {
    fn default() -> Self {
        Self {
            sample_rate: DEFAULT_VAD_SAMPLE_RATE,
            frame_size: DEFAULT_FRAME_SIZE,
            energy_threshold_db: DEFAULT_ENERGY_THRESHOLD_DB,
            hangover_frames: DEFAULT_HANGOVER_FRAMES,
            onset_frames: DEFAULT_ONSET_FRAMES,
            adaptive_noise_floor: true,
            adaptation_rate: 0.05,
            min_speech_frames: 5,      // 50ms minimum
            max_silence_frames: 10,    // 100ms max silence within speech
        }
    }
}

impl VadConfig {
    /// Create a new config with aggressive (low latency) settings
    pub fn aggressive() -> Self {
        Self {
            energy_threshold_db: 35.0,
            hangover_frames: 10,
            onset_frames: 2,
            min_speech_frames: 3,
            ..Default::default()
        }
    }

    /// Create a new config with conservative (high accuracy) settings
    pub fn conservative() -> Self {
        Self {
            energy_threshold_db: 45.0,
            hangover_frames: 30,
            onset_frames: 5,
            min_speech_frames: 10,
            max_silence_frames: 5,
            ..Default::default()
        }
    }
}

/// VAD state
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VadState {
    /// No speech detected
    Silence,
    /// Possibly starting speech (in onset period)
    MaybeSpeech,
    /// Speech confirmed
    Speech,
    /// Speech ending (in hangover period)
    SpeechEnding,
}

/// A single VAD frame result
#[derive(Debug, Clone, Copy)]
pub struct VadFrame {
    /// Frame number
    pub frame_id: u64,
    /// Raw energy level (linear)
    pub energy: f32,
    /// Energy in dB
    pub energy_db: f32,
    /// Is this frame speech?
    pub is_speech: bool,
    /// Current threshold
    pub threshold: f32,
}

impl Vad {
    /// Create a new VAD with default configuration
    pub fn new() -> Self {
        Self::with_config(VadConfig::default())
    }

    /// Create a new VAD with custom configuration
    pub fn with_config(config: VadConfig) -> Self {
        info!("Creating VAD with config: {:?}", config);

        Self {
            config,
            noise_floor: Arc::new(Mutex::new(1e-10)), // Start very low
            state: Arc::new(Mutex::new(VadState::Silence)),
            frame_history: Arc::new(Mutex::new(VecDeque::with_capacity(
                config.hangover_frames.max(100)
            ))),
            speech_callback: None,
            is_speech: Arc::new(AtomicBool::new(false)),
            frame_count: Arc::new(Mutex::new(0)),
        }
    }

    /// Set a callback for speech state changes
    pub fn on_speech_change<F>(&mut self, callback: F)
    where
        F: Fn(bool) + Send + 'static,
    {
        self.speech_callback = Some(Box::new(callback));
    }

    /// Process a frame of audio samples
    ///
    /// Returns true if speech is detected in this frame
    pub fn process_frame(&self, samples: &[f32]) -> Result<bool> {
        if samples.len() != self.config.frame_size {
            bail!("Expected {} samples, got {}", self.config.frame_size, samples.len());
        }

        // Calculate frame energy
        let energy = calculate_energy(samples);
        let energy_db = 10.0 * energy.log10().max(-100.0);

        // Get current noise floor and update
        let mut noise_floor = self.noise_floor.lock().unwrap();
        let current_threshold = *noise_floor * 10f32.powf(self.config.energy_threshold_db / 10.0);

        // Adaptive noise floor update
        if self.config.adaptive_noise_floor {
            if energy < current_threshold {
                // Likely noise, update floor
                *noise_floor = *noise_floor * (1.0 - self.config.adaptation_rate)
                    + energy * self.config.adaptation_rate;
            }
        }

        let threshold_db = 10.0 * current_threshold.log10().max(-100.0);

        // Determine if this frame is speech
        let frame_is_speech = energy > current_threshold;

        // Update state machine
        let mut state = self.state.lock().unwrap();
        let mut frame_count = self.frame_count.lock().unwrap();
        let frame_id = *frame_count;
        *frame_count += 1;

        let (new_state, is_speech) = self.update_state(*state, frame_is_speech);

        // Check for state transition
        let old_is_speech = self.is_speech.load(Ordering::SeqCst);
        if is_speech != old_is_speech {
            self.is_speech.store(is_speech, Ordering::SeqCst);
            if let Some(ref callback) = self.speech_callback {
                callback(is_speech);
            }
            if is_speech {
                debug!("Speech started at frame {}", frame_id);
            } else {
                debug!("Speech ended at frame {}", frame_id);
            }
        }

        *state = new_state;

        // Store frame in history
        let frame = VadFrame {
            frame_id,
            energy,
            energy_db,
            is_speech: frame_is_speech,
            threshold: current_threshold,
        };

        if let Ok(mut history) = self.frame_history.lock() {
            history.push_back(frame);
            if history.len() > self.config.hangover_frames * 2 {
                history.pop_front();
            }
        }

        trace!(
            "Frame {}: energy={:.2}dB, threshold={:.2}dB, speech={}",
            frame_id,
            energy_db,
            threshold_db,
            is_speech
        );

        Ok(is_speech)
    }

    /// Update the VAD state machine
    fn update_state(&self, current_state: VadState, frame_is_speech: bool) -> (VadState, bool) {
        use VadState::*;

        match current_state {
            Silence => {
                if frame_is_speech {
                    (MaybeSpeech, false)
                } else {
                    (Silence, false)
                }
            }
            MaybeSpeech => {
                if frame_is_speech {
                    // Count consecutive speech frames in history
                    if let Ok(history) = self.frame_history.lock() {
                        let recent_speech = history
                            .iter()
                            .rev()
                            .take(self.config.onset_frames)
                            .filter(|f| f.is_speech)
                            .count();

                        if recent_speech >= self.config.onset_frames {
                            (Speech, true)
                        } else {
                            (MaybeSpeech, false)
                        }
                    } else {
                        (MaybeSpeech, false)
                    }
                } else {
                    (Silence, false)
                }
            }
            Speech => {
                if frame_is_speech {
                    (Speech, true)
                } else {
                    (SpeechEnding, true)
                }
            }
            SpeechEnding => {
                if frame_is_speech {
                    (Speech, true)
                } else {
                    // Count consecutive silence frames
                    if let Ok(history) = self.frame_history.lock() {
                        let recent_silence = history
                            .iter()
                            .rev()
                            .take(self.config.hangover_frames)
                            .filter(|f| !f.is_speech)
                            .count();

                        if recent_silence >= self.config.hangover_frames {
                            (Silence, false)
                        } else {
                            (SpeechEnding, true)
                        }
                    } else {
                        (Silence, false)
                    }
                }
            }
        }
    }

    /// Check if currently detecting speech
    pub fn is_speech(&self) -> bool {
        self.is_speech.load(Ordering::SeqCst)
    }

    /// Get current state
    pub fn current_state(&self) -> VadState {
        *self.state.lock().unwrap()
    }

    /// Get frame history
    pub fn history(&self) -> Vec<VadFrame> {
        self.frame_history.lock()
            .map(|h| h.iter().copied().collect())
            .unwrap_or_default()
    }

    /// Reset the VAD state
    pub fn reset(&self) {
        *self.state.lock().unwrap() = VadState::Silence;
        *self.noise_floor.lock().unwrap() = 1e-10;
        self.frame_history.lock().unwrap().clear();
        self.is_speech.store(false, Ordering::SeqCst);
        *self.frame_count.lock().unwrap() = 0;
        info!("VAD reset");
    }

    /// Get current noise floor in dB
    pub fn noise_floor_db(&self) -> f32 {
        let noise = *self.noise_floor.lock().unwrap();
        10.0 * noise.log10().max(-100.0)
    }
}

impl Default for Vad {
    fn default() -> Self {
        Self::new()
    }
}

/// Calculate RMS energy of a frame
fn calculate_energy(samples: &[f32]) -> f32 {
    if samples.is_empty() {
        return 0.0;
    }

    let sum_sq: f32 = samples.iter().map(|&s| s * s).sum();
    (sum_sq / samples.len() as f32).sqrt()
}

/// An edge reported by [`VoiceGate::push_frame`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VoiceEdge {
    /// No change in voice/silence state this frame.
    None,
    /// First frame classified as voice after a run of silence.
    VoiceStart,
    /// Silence has persisted long enough after voice to end the turn.
    VoiceStop,
}

/// Per-connection voice gate (C2): wraps the energy-based [`Vad`] engine
/// with the rolling classification window and wake-word suppression the
/// connection orchestrator needs, without duplicating the threshold
/// state machine itself.
pub struct VoiceGate {
    vad: Vad,
    /// Last 5 per-frame voice classifications, most recent at the back.
    window: VecDeque<bool>,
    had_voice: bool,
    silence_run: usize,
    /// Frames of trailing silence required to call `VoiceStop`.
    stop_silence_frames: usize,
    /// Frames remaining where VAD output is forced to "no voice" after a
    /// wake-word cached response, to avoid the reply re-triggering VAD.
    suppressed_frames: usize,
}

const VOICE_WINDOW_LEN: usize = 5;

impl VoiceGate {
    pub fn new(config: VadConfig, stop_silence_frames: usize) -> Self {
        Self {
            vad: Vad::with_config(config),
            window: VecDeque::with_capacity(VOICE_WINDOW_LEN),
            had_voice: false,
            silence_run: 0,
            stop_silence_frames,
            suppressed_frames: 0,
        }
    }

    /// Suppress VAD output for roughly `duration` at the given frame rate,
    /// e.g. the ~1s "just-woken-up" window after a wake-word reply.
    pub fn suppress_for(&mut self, duration: std::time::Duration) {
        let frame_secs = self.vad_frame_duration_secs();
        self.suppressed_frames = (duration.as_secs_f64() / frame_secs).ceil() as usize;
    }

    fn vad_frame_duration_secs(&self) -> f64 {
        self.vad.config.frame_size as f64 / self.vad.config.sample_rate as f64
    }

    /// Classify one frame and report a voice_start/voice_stop edge, if any.
    pub fn push_frame(&mut self, samples: &[f32]) -> Result<VoiceEdge> {
        let raw_is_voice = if self.suppressed_frames > 0 {
            self.suppressed_frames -= 1;
            false
        } else {
            self.vad.process_frame(samples)?
        };

        if self.window.len() == VOICE_WINDOW_LEN {
            self.window.pop_front();
        }
        self.window.push_back(raw_is_voice);

        // Majority vote over the rolling window smooths single-frame flicker.
        let is_voice = self.window.iter().filter(|&&v| v).count() * 2 > self.window.len();

        let edge = if is_voice && !self.had_voice {
            self.had_voice = true;
            self.silence_run = 0;
            VoiceEdge::VoiceStart
        } else if !is_voice && self.had_voice {
            self.silence_run += 1;
            if self.silence_run >= self.stop_silence_frames {
                self.had_voice = false;
                self.silence_run = 0;
                VoiceEdge::VoiceStop
            } else {
                VoiceEdge::None
            }
        } else {
            if is_voice {
                self.silence_run = 0;
            }
            VoiceEdge::None
        };

        Ok(edge)
    }

    pub fn is_in_voice_turn(&self) -> bool {
        self.had_voice
    }

    pub fn reset(&mut self) {
        self.vad.reset();
        self.window.clear();
        self.had_voice = false;
        self.silence_run = 0;
        self.suppressed_frames = 0;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_vad_config_default() {
        let config = VadConfig::default();
        assert_eq!(config.sample_rate, 16000);
        assert_eq!(config.frame_size, 160);
        assert!(config.adaptive_noise_floor);
    }

    #[test]
    fn test_vad_config_aggressive() {
        let config = VadConfig::aggressive();
        assert!(config.energy_threshold_db < VadConfig::default().energy_threshold_db);
        assert!(config.hangover_frames < VadConfig::default().hangover_frames);
    }

    #[test]
    fn test_calculate_energy() {
        let silence = vec![0.0f32; 160];
        assert_eq!(calculate_energy(&silence), 0.0);

        let signal = vec![0.5f32; 160];
        let energy = calculate_energy(&signal);
        assert!(energy > 0.0);
        assert!((energy - 0.5).abs() < 0.01);
    }

    #[test]
    fn test_vad_creation() {
        let vad = Vad::new();
        assert!(!vad.is_speech());
        matches!(vad.current_state(), VadState::Silence);
    }

    #[test]
    fn test_vad_process_silence() {
        let vad = Vad::new();
        let silence = vec![0.0f32; 160];

        // Process multiple silence frames
        for _ in 0..10 {
            assert!(!vad.process_frame(&silence).unwrap());
        }

        assert!(!vad.is_speech());
    }

    #[test]
    fn test_vad_process_loud_signal() {
        let mut config = VadConfig::default();
        config.adaptive_noise_floor = false; // Disable adaptation for test
        config.energy_threshold_db = 20.0;
        let vad = Vad::with_config(config);

        // Start with silence
        let silence = vec![0.001f32; 160];
        for _ in 0..10 {
            let _ = vad.process_frame(&silence);
        }

        // Then loud signal - should trigger speech after onset
        let loud = vec![0.5f32; 160];
        let mut speech_detected = false;
        for i in 0..20 {
            let is_speech = vad.process_frame(&loud).unwrap();
            if is_speech {
                speech_detected = true;
                println!("Speech detected at frame {}", i);
                break;
            }
        }

        assert!(speech_detected, "Speech should have been detected");
    }

    #[test]
    fn test_vad_callback() {
        use std::sync::atomic::{AtomicUsize, Ordering};

        let counter = Arc::new(AtomicUsize::new(0));
        let counter_clone = counter.clone();

        let mut vad = Vad::new();
        vad.on_speech_change(move |speech| {
            if speech {
                counter_clone.fetch_add(1, Ordering::SeqCst);
            }
        });

        // Process alternating silence and speech
        let silence = vec![0.001f32; 160];
        let loud = vec![0.5f32; 160];

        // Build up noise floor
        for _ in 0..20 {
            let _ = vad.process_frame(&silence);
        }

        // Trigger speech multiple times
        for cycle in 0..3 {
            // Speech
            for _ in 0..10 {
                let _ = vad.process_frame(&loud);
            }
            // Silence (long enough to end speech)
            for _ in 0..30 {
                let _ = vad.process_frame(&silence);
            }
        }

        // Should have triggered callback for each speech start
        assert!(counter.load(Ordering::SeqCst) >= 1);
    }

    #[test]
    fn test_vad_reset() {
        let vad = Vad::new();

        // Process some frames
        let signal = vec![0.5f32; 160];
        for _ in 0..50 {
            let _ = vad.process_frame(&signal);
        }

        // Reset
        vad.reset();

        assert!(!vad.is_speech());
        matches!(vad.current_state(), VadState::Silence);
        assert!(vad.history().is_empty());
    }

    #[test]
    fn voice_gate_reports_start_and_stop_edges() {
        let mut config = VadConfig::default();
        config.adaptive_noise_floor = false;
        config.energy_threshold_db = 20.0;
        let mut gate = VoiceGate::new(config, 8);

        let silence = vec![0.001f32; 160];
        let loud = vec![0.5f32; 160];

        let mut saw_start = false;
        for _ in 0..10 {
            let _ = gate.push_frame(&silence).unwrap();
        }
        for _ in 0..10 {
            if gate.push_frame(&loud).unwrap() == VoiceEdge::VoiceStart {
                saw_start = true;
                break;
            }
        }
        assert!(saw_start, "expected a VoiceStart edge");
        assert!(gate.is_in_voice_turn());

        let mut saw_stop = false;
        for _ in 0..12 {
            if gate.push_frame(&silence).unwrap() == VoiceEdge::VoiceStop {
                saw_stop = true;
                break;
            }
        }
        assert!(saw_stop, "expected a VoiceStop edge");
        assert!(!gate.is_in_voice_turn());
    }

    #[test]
    fn voice_gate_suppression_blocks_start_edge() {
        let mut config = VadConfig::default();
        config.adaptive_noise_floor = false;
        config.energy_threshold_db = 20.0;
        let mut gate = VoiceGate::new(config, 8);
        gate.suppress_for(std::time::Duration::from_millis(100));

        let loud = vec![0.5f32; 160];
        let mut saw_start = false;
        for _ in 0..10 {
            if gate.push_frame(&loud).unwrap() == VoiceEdge::VoiceStart {
                saw_start = true;
            }
        }
        assert!(!saw_start, "suppressed frames must not trigger VoiceStart");
    }
}
