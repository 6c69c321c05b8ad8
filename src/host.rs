//! Host boundary
//!
//! [`HostContext`] is the state a plugin host shares with the patch: audio
//! buffers, MIDI events, transport position and automatable parameters. It
//! is created once per session and handed to each terminal module at
//! construction, so modules never have to look up a process-wide context.
//!
//! [`HostContext::run`] performs one host callback: it publishes the host's
//! buffers, steps the engine one block and hands the patch's output back.

use crate::atomic::{AtomicF32, AtomicF64};
use crate::config::HostConfig;
use crate::engine::Engine;
use parking_lot::{Mutex, MutexGuard};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use tracing::info;

/// Number of automatable parameters the host exposes to the patch
pub const MODULE_PARAMETER_COUNT: usize = 24;

/// A short MIDI message at a frame offset within the current block
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct MidiEvent {
    /// Frame offset within the block
    pub frame: u32,
    size: u8,
    data: [u8; 4],
}

impl MidiEvent {
    /// `None` for empty messages and for messages longer than 4 bytes (SysEx)
    pub fn new(frame: u32, bytes: &[u8]) -> Option<Self> {
        if bytes.is_empty() || bytes.len() > 4 {
            return None;
        }
        let mut data = [0u8; 4];
        data[..bytes.len()].copy_from_slice(bytes);
        Some(Self {
            frame,
            size: bytes.len() as u8,
            data,
        })
    }

    pub fn bytes(&self) -> &[u8] {
        &self.data[..self.size as usize]
    }
}

/// Bar/beat/tick position as reported by the host
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Bbt {
    pub bar: i32,
    pub beat: i32,
    pub beats_per_bar: i32,
    pub beat_type: i32,
    pub bar_start_tick: f64,
    pub beats_per_minute: f64,
    pub tick: f64,
    pub ticks_per_beat: f64,
}

/// What the host reports about its transport at the start of a block
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct HostTransport {
    pub playing: bool,
    pub frame: u64,
    pub bbt: Option<Bbt>,
}

/// Transport state shared with the patch
///
/// The host writes it once per block. Time modules copy the counters when
/// playback starts or jumps and advance their own copy frame by frame.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct TimePosition {
    pub playing: bool,
    /// Set when playback started or jumped this block
    pub reset: bool,
    pub bbt_valid: bool,
    pub bar: i32,
    pub beat: i32,
    pub beats_per_bar: i32,
    pub beat_type: i32,
    pub frame: u64,
    pub bar_start_tick: f64,
    pub beats_per_minute: f64,
    pub tick: f64,
    pub tick_clock: f64,
    pub ticks_per_beat: f64,
    pub ticks_per_clock: f64,
    pub ticks_per_frame: f64,
}

impl Default for TimePosition {
    fn default() -> Self {
        Self {
            playing: false,
            reset: false,
            bbt_valid: false,
            bar: 1,
            beat: 1,
            beats_per_bar: 4,
            beat_type: 4,
            frame: 0,
            bar_start_tick: 0.0,
            beats_per_minute: 120.0,
            tick: 0.0,
            tick_clock: 0.0,
            ticks_per_beat: 1920.0,
            ticks_per_clock: 480.0,
            ticks_per_frame: 0.0,
        }
    }
}

/// Per-block audio buffers, one `Vec` per channel
#[derive(Debug, Default)]
pub(crate) struct AudioBuffers {
    inputs: Vec<Vec<f32>>,
    outputs: Vec<Vec<f32>>,
}

impl AudioBuffers {
    fn new(inputs: usize, outputs: usize, frames: usize) -> Self {
        Self {
            inputs: vec![vec![0.0; frames]; inputs],
            outputs: vec![vec![0.0; frames]; outputs],
        }
    }

    pub(crate) fn num_inputs(&self) -> usize {
        self.inputs.len()
    }

    pub(crate) fn num_outputs(&self) -> usize {
        self.outputs.len()
    }

    pub(crate) fn input(&self, channel: usize, frame: usize) -> f32 {
        self.inputs
            .get(channel)
            .and_then(|buf| buf.get(frame))
            .copied()
            .unwrap_or(0.0)
    }

    pub(crate) fn output(&self, channel: usize, frame: usize) -> f32 {
        self.outputs
            .get(channel)
            .and_then(|buf| buf.get(frame))
            .copied()
            .unwrap_or(0.0)
    }

    pub(crate) fn add_output(&mut self, channel: usize, frame: usize, value: f32) {
        if let Some(sample) = self.outputs.get_mut(channel).and_then(|buf| buf.get_mut(frame)) {
            *sample += value;
        }
    }

    fn load(&mut self, inputs: &[&[f32]], frames: usize) {
        for (c, buf) in self.inputs.iter_mut().enumerate() {
            buf.clear();
            match inputs.get(c) {
                Some(src) => buf.extend_from_slice(&src[..frames]),
                None => buf.resize(frames, 0.0),
            }
        }
        for buf in &mut self.outputs {
            buf.clear();
            buf.resize(frames, 0.0);
        }
    }
}

/// State shared between the host and the terminal modules of one patch
#[derive(Debug)]
pub struct HostContext {
    sample_rate: AtomicF64,
    buffer_size: AtomicUsize,
    parameters: [AtomicF32; MODULE_PARAMETER_COUNT],
    smooth_parameters: AtomicBool,
    time: Mutex<TimePosition>,
    next_expected_frame: Mutex<u64>,
    audio: Mutex<AudioBuffers>,
    midi: Mutex<Vec<MidiEvent>>,
}

impl HostContext {
    pub fn new(config: &HostConfig) -> Arc<Self> {
        Arc::new(Self {
            sample_rate: AtomicF64::new(config.sample_rate as f64),
            buffer_size: AtomicUsize::new(config.buffer_size),
            parameters: std::array::from_fn(|_| AtomicF32::new(0.0)),
            smooth_parameters: AtomicBool::new(config.smooth_parameters),
            time: Mutex::new(TimePosition::default()),
            next_expected_frame: Mutex::new(0),
            audio: Mutex::new(AudioBuffers::new(
                config.audio_inputs,
                config.audio_outputs,
                config.buffer_size,
            )),
            midi: Mutex::new(Vec::with_capacity(256)),
        })
    }

    pub fn sample_rate(&self) -> f64 {
        self.sample_rate.get()
    }

    /// Record a new host sample rate and forward it to the engine
    pub fn set_sample_rate(&self, engine: &Engine, sample_rate: f64) {
        self.sample_rate.set(sample_rate);
        engine.set_sample_rate(sample_rate as f32);
    }

    pub fn buffer_size(&self) -> usize {
        self.buffer_size.load(Ordering::Relaxed)
    }

    /// Takes effect for modules at their next sample rate change
    pub fn set_buffer_size(&self, buffer_size: usize) {
        self.buffer_size.store(buffer_size.max(1), Ordering::Relaxed);
    }

    /// Host parameter `index`; out-of-range indices read 0
    pub fn parameter(&self, index: usize) -> f32 {
        self.parameters.get(index).map_or(0.0, AtomicF32::get)
    }

    pub fn set_parameter(&self, index: usize, value: f32) {
        if let Some(p) = self.parameters.get(index) {
            p.set(value);
        }
    }

    pub fn smooth_parameters(&self) -> bool {
        self.smooth_parameters.load(Ordering::Relaxed)
    }

    pub fn set_smooth_parameters(&self, smooth: bool) {
        self.smooth_parameters.store(smooth, Ordering::Relaxed);
    }

    pub fn time(&self) -> TimePosition {
        *self.time.lock()
    }

    pub(crate) fn audio(&self) -> MutexGuard<'_, AudioBuffers> {
        self.audio.lock()
    }

    /// This block's MIDI events, sorted by frame
    pub(crate) fn midi_events(&self) -> MutexGuard<'_, Vec<MidiEvent>> {
        self.midi.lock()
    }

    pub fn num_audio_inputs(&self) -> usize {
        self.audio.lock().num_inputs()
    }

    pub fn num_audio_outputs(&self) -> usize {
        self.audio.lock().num_outputs()
    }

    /// Publish the host's transport for a block of `frames` frames
    ///
    /// Playback counts as reset when it starts at frame 0 or when the host
    /// position jumps by more than two frames from where the last block ended.
    pub fn update_transport(&self, transport: &HostTransport, frames: usize) {
        let mut next_expected = self.next_expected_frame.lock();
        let mut time = self.time.lock();

        let jumped = next_expected.abs_diff(transport.frame) > 2;
        let mut reset = transport.playing && (transport.frame == 0 || jumped);
        // hosts that cannot report a frame position
        if time.playing == transport.playing && transport.frame == 0 && time.frame == 0 {
            reset = false;
        }

        time.playing = transport.playing;
        time.bbt_valid = transport.bbt.is_some();
        time.frame = transport.frame;

        if let Some(bbt) = transport.bbt {
            let sample_rate = self.sample_rate();
            let samples_per_tick = 60.0 * sample_rate / bbt.beats_per_minute / bbt.ticks_per_beat;
            time.bar = bbt.bar;
            time.beat = bbt.beat;
            time.beats_per_bar = bbt.beats_per_bar;
            time.beat_type = bbt.beat_type;
            time.bar_start_tick = bbt.bar_start_tick;
            time.beats_per_minute = bbt.beats_per_minute;
            time.tick = bbt.tick;
            time.ticks_per_beat = bbt.ticks_per_beat;
            time.ticks_per_clock = bbt.ticks_per_beat / bbt.beat_type as f64;
            time.ticks_per_frame = 1.0 / samples_per_tick;
            time.tick_clock = bbt.tick % time.ticks_per_clock;
        }

        time.reset = reset;
        *next_expected = if transport.playing {
            transport.frame + frames as u64
        } else {
            0
        };
    }

    /// Run one host audio callback
    ///
    /// The block length is the shortest of the given buffers. Output buffers
    /// are overwritten with what the patch produced.
    pub fn run(
        &self,
        engine: &Engine,
        inputs: &[&[f32]],
        outputs: &mut [&mut [f32]],
        midi: &[MidiEvent],
    ) {
        let frames = inputs
            .iter()
            .map(|buf| buf.len())
            .chain(outputs.iter().map(|buf| buf.len()))
            .min()
            .unwrap_or(0);
        if frames == 0 {
            return;
        }
        if frames > self.buffer_size() {
            info!(frames, "host block larger than configured buffer size");
            self.set_buffer_size(frames);
        }

        self.audio.lock().load(inputs, frames);
        {
            let mut events = self.midi.lock();
            events.clear();
            events.extend(midi.iter().filter(|e| (e.frame as usize) < frames));
            events.sort_by_key(|e| e.frame);
        }

        engine.step_block(frames);

        let audio = self.audio.lock();
        for (c, out) in outputs.iter_mut().enumerate() {
            match audio.outputs.get(c) {
                Some(src) => out[..frames].copy_from_slice(&src[..frames]),
                None => out[..frames].fill(0.0),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    fn context() -> Arc<HostContext> {
        HostContext::new(&HostConfig::default())
    }

    #[test]
    fn test_midi_event_bytes() {
        let event = MidiEvent::new(3, &[0x90, 60, 100]).unwrap();
        assert_eq!(event.bytes(), &[0x90, 60, 100]);
        assert!(MidiEvent::new(0, &[]).is_none());
        assert!(MidiEvent::new(0, &[0xF0, 1, 2, 3, 0xF7]).is_none());
    }

    #[test]
    fn test_parameters() {
        let host = context();
        host.set_parameter(3, 0.75);
        host.set_parameter(MODULE_PARAMETER_COUNT, 1.0);
        assert_eq!(host.parameter(3), 0.75);
        assert_eq!(host.parameter(MODULE_PARAMETER_COUNT), 0.0);
    }

    #[test]
    fn test_transport_ticks() {
        let host = context();
        let bbt = Bbt {
            bar: 2,
            beat: 3,
            beats_per_bar: 4,
            beat_type: 4,
            bar_start_tick: 0.0,
            beats_per_minute: 120.0,
            tick: 600.0,
            ticks_per_beat: 1920.0,
        };
        host.update_transport(
            &HostTransport {
                playing: true,
                frame: 4800,
                bbt: Some(bbt),
            },
            256,
        );
        let time = host.time();
        assert!(time.playing && time.bbt_valid && time.reset);
        assert_eq!((time.bar, time.beat), (2, 3));
        assert_relative_eq!(time.ticks_per_clock, 480.0);
        assert_relative_eq!(time.tick_clock, 120.0);
        // 120 bpm at 48 kHz: 24000 frames per beat
        assert_relative_eq!(time.ticks_per_frame, 1920.0 / 24000.0, epsilon = 1e-12);

        // contiguous next block is not a reset
        host.update_transport(
            &HostTransport {
                playing: true,
                frame: 4800 + 256,
                bbt: Some(bbt),
            },
            256,
        );
        assert!(!host.time().reset);
    }

    #[test]
    fn test_run_without_modules_outputs_silence() {
        let host = context();
        let engine = Engine::new(48000.0);
        let input = [0.5f32; 64];
        let mut left = [1.0f32; 64];
        let mut right = [1.0f32; 64];
        host.run(&engine, &[&input, &input], &mut [&mut left, &mut right], &[]);
        assert!(left.iter().chain(right.iter()).all(|&v| v == 0.0));
        assert_eq!(engine.frame(), 64);
    }

    #[test]
    fn test_run_drops_late_midi() {
        let host = context();
        let engine = Engine::new(48000.0);
        let events = [
            MidiEvent::new(100, &[0x90, 60, 1]).unwrap(),
            MidiEvent::new(5, &[0x80, 60, 0]).unwrap(),
            MidiEvent::new(2, &[0x90, 62, 1]).unwrap(),
        ];
        let mut out = [0.0f32; 16];
        host.run(&engine, &[], &mut [&mut out], &events);
        let frames: Vec<u32> = host.midi_events().iter().map(|e| e.frame).collect();
        assert_eq!(frames, vec![2, 5]);
    }
}
