//! Native renderer: symphonia decode, cpal output.
//!
//! `prepare` spawns a decoder thread that probes the source and reports
//! `Prepared`, then waits for `start`. Decoded samples flow through a ring
//! buffer to a cpal stream owned by the output thread. Position is counted
//! from frames the device has actually pulled.

use std::fs::File;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use cpal::traits::{DeviceTrait, HostTrait, StreamTrait};
use parking_lot::Mutex;
use symphonia::core::audio::SampleBuffer;
use symphonia::core::codecs::{Decoder, DecoderOptions};
use symphonia::core::errors::Error as DecodeError;
use symphonia::core::formats::{FormatOptions, FormatReader, SeekMode, SeekTo};
use symphonia::core::io::MediaSourceStream;
use symphonia::core::meta::MetadataOptions;
use symphonia::core::probe::Hint;
use symphonia::core::units::Time;

use super::{Renderer, RendererEvent, Reporter};
use crate::error::RendererError;

/// About four seconds of 48 kHz stereo.
const RING_CAPACITY: usize = 48_000 * 2 * 4;

/// Platform "unknown" error code.
const UNKNOWN_ERROR: i32 = 1;

/// Renderer backed by the default output device.
pub struct AudioRenderer {
    state: Arc<RenderState>,
}

struct RenderState {
    /// Not started yet, or paused by the player.
    paused: AtomicBool,
    /// Tear down the current source.
    stop_signal: AtomicBool,
    /// Decoder reached end of stream.
    drained: AtomicBool,
    /// Output pulled fewer samples than it needed.
    underrun: AtomicBool,
    sample_rate: AtomicU32,
    channels: AtomicU32,
    /// Rate the device is fed at, after resampling.
    output_rate: AtomicU32,
    /// Position the played-sample count is relative to (last seek).
    base_ms: AtomicU64,
    /// Interleaved samples pulled by the device since `base_ms`.
    played_samples: AtomicU64,
    seek_to: Mutex<Option<u64>>,
    samples: Mutex<SampleRing>,
    reporter: Mutex<Option<Reporter>>,
    /// Current source, kept for replays after completion.
    source: Mutex<Option<PathBuf>>,
    decoder_thread: Mutex<Option<thread::JoinHandle<()>>>,
    output_thread: Mutex<Option<thread::JoinHandle<()>>>,
}

impl RenderState {
    fn report(&self, event: RendererEvent) {
        if let Some(reporter) = self.reporter.lock().as_ref() {
            reporter.report(event);
        }
    }

    fn position_ms(&self) -> u64 {
        let channels = self.channels.load(Ordering::SeqCst).max(1) as u64;
        let rate = self.output_rate.load(Ordering::SeqCst).max(1) as u64;
        let frames = self.played_samples.load(Ordering::SeqCst) / channels;
        self.base_ms.load(Ordering::SeqCst) + frames * 1000 / rate
    }
}

impl AudioRenderer {
    pub fn new() -> Self {
        Self {
            state: Arc::new(RenderState {
                paused: AtomicBool::new(true),
                stop_signal: AtomicBool::new(false),
                drained: AtomicBool::new(false),
                underrun: AtomicBool::new(false),
                sample_rate: AtomicU32::new(44_100),
                channels: AtomicU32::new(2),
                output_rate: AtomicU32::new(44_100),
                base_ms: AtomicU64::new(0),
                played_samples: AtomicU64::new(0),
                seek_to: Mutex::new(None),
                samples: Mutex::new(SampleRing::new(RING_CAPACITY)),
                reporter: Mutex::new(None),
                source: Mutex::new(None),
                decoder_thread: Mutex::new(None),
                output_thread: Mutex::new(None),
            }),
        }
    }

    /// Stop both threads and wait for them. Position survives.
    fn halt(&self) {
        self.state.stop_signal.store(true, Ordering::SeqCst);
        self.state.paused.store(true, Ordering::SeqCst);
        self.state.samples.lock().clear();

        let handles = [
            self.state.decoder_thread.lock().take(),
            self.state.output_thread.lock().take(),
        ];
        for handle in handles.into_iter().flatten() {
            join_logged(handle);
        }
    }

    fn rewind(&self) {
        self.state.base_ms.store(0, Ordering::SeqCst);
        self.state.played_samples.store(0, Ordering::SeqCst);
        *self.state.seek_to.lock() = None;
    }

    /// Open `path` on a fresh decoder thread. `announce` reports `Prepared`
    /// once the source probes.
    fn spawn_decoder(&self, path: PathBuf, announce: bool) {
        let finished = self.state.decoder_thread.lock().take();
        if let Some(done) = finished {
            join_logged(done);
        }
        self.state.stop_signal.store(false, Ordering::SeqCst);
        self.state.drained.store(false, Ordering::SeqCst);
        self.state.underrun.store(false, Ordering::SeqCst);

        let state = Arc::clone(&self.state);
        *self.state.decoder_thread.lock() = Some(thread::spawn(move || {
            let (format, decoder, track_id) = match open_source(&path, &state) {
                Ok(opened) => opened,
                Err(e) => {
                    log::warn!("sonata: cannot open {}: {}", path.display(), e);
                    state.report(RendererEvent::Error(map_decode_error(&e)));
                    return;
                }
            };
            if state.stop_signal.load(Ordering::SeqCst) {
                return;
            }
            if announce {
                state.report(RendererEvent::Prepared);
            }
            if let Err(e) = decode_to_ring(format, decoder, track_id, &state) {
                log::error!("sonata: decode error: {}", e);
                state.report(RendererEvent::Error(map_decode_error(&e)));
            }
            state.drained.store(true, Ordering::SeqCst);
        }));
    }
}

impl Default for AudioRenderer {
    fn default() -> Self {
        Self::new()
    }
}

impl Renderer for AudioRenderer {
    fn prepare(&self, uri: &str, reporter: Reporter) -> Result<(), RendererError> {
        let path = resolve_source(uri)?;
        self.halt();
        self.rewind();
        *self.state.reporter.lock() = Some(reporter);
        *self.state.source.lock() = Some(path.clone());
        self.spawn_decoder(path, true);
        Ok(())
    }

    fn start(&self) {
        self.state.paused.store(false, Ordering::SeqCst);

        // Played out: reopen the source for a replay.
        let decoder_done = self
            .state
            .decoder_thread
            .lock()
            .as_ref()
            .map_or(false, |h| h.is_finished());
        if decoder_done && self.state.drained.load(Ordering::SeqCst) {
            let source = self.state.source.lock().clone();
            if let Some(path) = source {
                self.spawn_decoder(path, false);
            }
        }

        let mut output = self.state.output_thread.lock();
        if output.as_ref().map_or(true, |h| h.is_finished()) {
            if let Some(done) = output.take() {
                join_logged(done);
            }
            let state = Arc::clone(&self.state);
            *output = Some(thread::spawn(move || {
                if let Err(e) = output_from_ring(&state) {
                    log::error!("sonata: output error: {}", e);
                    state.report(RendererEvent::Error(RendererError::Source(e)));
                }
            }));
        }
    }

    fn pause(&self) {
        self.state.paused.store(true, Ordering::SeqCst);
    }

    fn stop(&self) {
        self.halt();
    }

    fn reset(&self) {
        self.halt();
        self.rewind();
        *self.state.reporter.lock() = None;
        *self.state.source.lock() = None;
    }

    fn release(&self) {
        self.reset();
    }

    fn seek(&self, position_ms: u64) {
        let reopen = {
            let mut ring = self.state.samples.lock();
            let mut pending = self.state.seek_to.lock();
            // Decoder already past the last packet: it has to be reopened.
            let reopen = self.state.drained.load(Ordering::SeqCst)
                && self.state.decoder_thread.lock().is_some();
            if reopen {
                self.state.drained.store(false, Ordering::SeqCst);
            }
            ring.clear();
            *pending = Some(position_ms);
            self.state.base_ms.store(position_ms, Ordering::SeqCst);
            self.state.played_samples.store(0, Ordering::SeqCst);
            reopen
        };
        if reopen {
            let source = self.state.source.lock().clone();
            if let Some(path) = source {
                self.spawn_decoder(path, false);
            }
        }
    }

    fn position_ms(&self) -> u64 {
        self.state.position_ms()
    }
}

impl Drop for AudioRenderer {
    fn drop(&mut self) {
        self.halt();
    }
}

fn join_logged(handle: thread::JoinHandle<()>) {
    if handle.join().is_err() {
        log::error!("sonata: renderer thread panicked");
    }
}

/// Accept plain paths and `file://` URIs; anything else is refused up front.
fn resolve_source(uri: &str) -> Result<PathBuf, RendererError> {
    let path = match uri.strip_prefix("file://") {
        Some(rest) => rest,
        None if uri.contains("://") => {
            return Err(RendererError::Source(format!("unsupported source: {}", uri)))
        }
        None => uri,
    };
    if path.is_empty() {
        return Err(RendererError::Source("empty source".into()));
    }
    let path = PathBuf::from(path);
    if !path.is_file() {
        return Err(RendererError::Source(format!("no such file: {}", path.display())));
    }
    Ok(path)
}

fn map_decode_error(e: &DecodeError) -> RendererError {
    match e {
        DecodeError::IoError(_) => RendererError::Io,
        DecodeError::DecodeError(_) | DecodeError::SeekError(_) | DecodeError::LimitError(_) => {
            RendererError::Malformed
        }
        DecodeError::Unsupported(_) => RendererError::Unsupported,
        _ => RendererError::Unknown(UNKNOWN_ERROR),
    }
}

type OpenedSource = (Box<dyn FormatReader>, Box<dyn Decoder>, u32);

/// Probe the container and build a decoder for its default track.
fn open_source(path: &Path, state: &RenderState) -> Result<OpenedSource, DecodeError> {
    let file = File::open(path)?;
    let mss = MediaSourceStream::new(Box::new(file), Default::default());

    let mut hint = Hint::new();
    if let Some(ext) = path.extension().and_then(|e| e.to_str()) {
        hint.with_extension(ext);
    }

    let probed = symphonia::default::get_probe().format(
        &hint,
        mss,
        &FormatOptions::default(),
        &MetadataOptions::default(),
    )?;
    let format = probed.format;
    let track = format
        .default_track()
        .ok_or(DecodeError::Unsupported("no default track"))?;
    let track_id = track.id;

    let sample_rate = track.codec_params.sample_rate.unwrap_or(44_100).max(1);
    let channels = track.codec_params.channels.map(|c| c.count() as u32).unwrap_or(2).max(1);
    state.sample_rate.store(sample_rate, Ordering::SeqCst);
    state.channels.store(channels, Ordering::SeqCst);
    state.output_rate.store(device_rate(sample_rate), Ordering::SeqCst);

    let decoder = symphonia::default::get_codecs().make(&track.codec_params, &DecoderOptions::default())?;
    Ok((format, decoder, track_id))
}

fn decode_to_ring(
    mut format: Box<dyn FormatReader>,
    mut decoder: Box<dyn Decoder>,
    track_id: u32,
    state: &RenderState,
) -> Result<(), DecodeError> {
    let sample_rate = state.sample_rate.load(Ordering::SeqCst);
    let output_rate = state.output_rate.load(Ordering::SeqCst);
    let channels = state.channels.load(Ordering::SeqCst) as u16;
    let mut resampler = if output_rate != sample_rate {
        log::info!("sonata: resampling {}Hz -> {}Hz", sample_rate, output_rate);
        Some(LinearResampler::new(sample_rate, output_rate, channels))
    } else {
        None
    };

    loop {
        if state.stop_signal.load(Ordering::SeqCst) {
            return Ok(());
        }

        let seek = state.seek_to.lock().take();
        if let Some(ms) = seek {
            let time = Time::new(ms / 1000, (ms % 1000) as f64 / 1000.0);
            match format.seek(SeekMode::Accurate, SeekTo::Time { time, track_id: Some(track_id) }) {
                Ok(_) => {
                    decoder.reset();
                    state.samples.lock().clear();
                    state.base_ms.store(ms, Ordering::SeqCst);
                    state.played_samples.store(0, Ordering::SeqCst);
                    state.drained.store(false, Ordering::SeqCst);
                }
                Err(e) => log::warn!("sonata: seek to {}ms failed: {}", ms, e),
            }
        }

        let packet = match format.next_packet() {
            Ok(packet) => packet,
            Err(DecodeError::IoError(ref e)) if e.kind() == std::io::ErrorKind::UnexpectedEof => {
                let pending = state.seek_to.lock();
                if pending.is_some() {
                    continue;
                }
                state.drained.store(true, Ordering::SeqCst);
                return Ok(());
            }
            Err(e) => return Err(e),
        };
        if packet.track_id() != track_id {
            continue;
        }

        let decoded = match decoder.decode(&packet) {
            Ok(decoded) => decoded,
            // A corrupt packet is skipped, not fatal.
            Err(DecodeError::DecodeError(e)) => {
                log::debug!("sonata: skipping packet: {}", e);
                continue;
            }
            Err(e) => return Err(e),
        };
        let spec = *decoded.spec();
        let mut buffer = SampleBuffer::<f32>::new(decoded.capacity() as u64, spec);
        buffer.copy_interleaved_ref(decoded);
        let samples = match resampler.as_mut() {
            Some(rs) => rs.process(buffer.samples()),
            None => buffer.samples().to_vec(),
        };

        // Back-pressure: wait for room, or for a stop or seek.
        loop {
            {
                let mut ring = state.samples.lock();
                if ring.free() >= samples.len() {
                    ring.push(&samples);
                    break;
                }
            }
            if state.stop_signal.load(Ordering::SeqCst) {
                return Ok(());
            }
            if state.seek_to.lock().is_some() {
                break;
            }
            thread::sleep(Duration::from_millis(5));
        }
    }
}

/// Own the cpal stream until the source is stopped or played out.
fn output_from_ring(state: &Arc<RenderState>) -> Result<(), String> {
    let host = cpal::default_host();
    let device = host
        .default_output_device()
        .ok_or_else(|| "no output device".to_string())?;

    let rate = state.output_rate.load(Ordering::SeqCst);
    let ring_channels = state.channels.load(Ordering::SeqCst).max(1) as u16;
    let supports_layout = device
        .supported_output_configs()
        .map(|mut configs| {
            configs.any(|range| {
                range.sample_format() == cpal::SampleFormat::F32
                    && range.channels() >= ring_channels
                    && range.min_sample_rate().0 <= rate
                    && range.max_sample_rate().0 >= rate
            })
        })
        .unwrap_or(false);
    let config = if supports_layout {
        cpal::StreamConfig {
            channels: ring_channels,
            sample_rate: cpal::SampleRate(rate),
            buffer_size: cpal::BufferSize::Default,
        }
    } else {
        let default = device.default_output_config().map_err(|e| e.to_string())?;
        if default.sample_format() != cpal::SampleFormat::F32 {
            return Err(format!("device does not take f32 (got {:?})", default.sample_format()));
        }
        default.into()
    };
    let out_channels = config.channels.max(1);

    let cb = Arc::clone(state);
    let stream = device
        .build_output_stream(
            &config,
            move |data: &mut [f32], _: &cpal::OutputCallbackInfo| {
                if cb.paused.load(Ordering::SeqCst) {
                    data.fill(0.0);
                    return;
                }
                // Counted under the ring lock so a seek never sees stale samples land.
                let pulled = if ring_channels == out_channels {
                    let mut ring = cb.samples.lock();
                    let n = ring.pull(data);
                    cb.played_samples.fetch_add(n as u64, Ordering::SeqCst);
                    (n, data.len())
                } else {
                    let frames = data.len() / out_channels as usize;
                    let mut tmp = vec![0.0f32; frames * ring_channels as usize];
                    let n = {
                        let mut ring = cb.samples.lock();
                        let n = ring.pull(&mut tmp);
                        cb.played_samples.fetch_add(n as u64, Ordering::SeqCst);
                        n
                    };
                    adapt_channels(&tmp, ring_channels, data, out_channels);
                    (n, tmp.len())
                };
                if pulled.0 < pulled.1 {
                    cb.underrun.store(true, Ordering::SeqCst);
                }
            },
            |err| log::error!("sonata: cpal error: {}", err),
            None,
        )
        .map_err(|e| e.to_string())?;
    stream.play().map_err(|e| e.to_string())?;

    let mut buffering = false;
    loop {
        thread::sleep(Duration::from_millis(25));
        if state.stop_signal.load(Ordering::SeqCst) {
            break;
        }
        let buffered = state.samples.lock().len;
        let drained = state.drained.load(Ordering::SeqCst);
        if drained && buffered == 0 {
            state.report(RendererEvent::Completed);
            break;
        }
        let starved = state.underrun.swap(false, Ordering::SeqCst) && !drained;
        if starved && !buffering && !state.paused.load(Ordering::SeqCst) {
            buffering = true;
            state.report(RendererEvent::BufferingStart);
        } else if buffering && buffered >= RING_CAPACITY / 4 {
            buffering = false;
            state.report(RendererEvent::BufferingEnd);
        }
    }
    Ok(())
}

/// Rate the default device will be opened at for a track of `track_rate`.
fn device_rate(track_rate: u32) -> u32 {
    let Some(device) = cpal::default_host().default_output_device() else {
        return track_rate;
    };
    let supports_track = device
        .supported_output_configs()
        .map(|mut configs| {
            configs.any(|range| range.min_sample_rate().0 <= track_rate && range.max_sample_rate().0 >= track_rate)
        })
        .unwrap_or(false);
    if supports_track {
        track_rate
    } else {
        device
            .default_output_config()
            .map(|c| c.sample_rate().0)
            .unwrap_or(track_rate)
    }
}

// ---------------------------------------------------------------------------
// Sample plumbing
// ---------------------------------------------------------------------------

/// Fixed-capacity ring of interleaved f32 samples.
struct SampleRing {
    buf: Vec<f32>,
    read_pos: usize,
    write_pos: usize,
    len: usize,
}

impl SampleRing {
    fn new(capacity: usize) -> Self {
        Self { buf: vec![0.0; capacity.max(1)], read_pos: 0, write_pos: 0, len: 0 }
    }

    fn free(&self) -> usize {
        self.buf.len() - self.len
    }

    /// Samples beyond capacity are dropped.
    fn push(&mut self, samples: &[f32]) {
        for &s in samples.iter().take(self.free()) {
            self.buf[self.write_pos] = s;
            self.write_pos = (self.write_pos + 1) % self.buf.len();
            self.len += 1;
        }
    }

    /// Fill `out`, zero-padding on underrun. Returns samples actually read.
    fn pull(&mut self, out: &mut [f32]) -> usize {
        let n = out.len().min(self.len);
        for sample in out.iter_mut().take(n) {
            *sample = self.buf[self.read_pos];
            self.read_pos = (self.read_pos + 1) % self.buf.len();
        }
        self.len -= n;
        out[n..].fill(0.0);
        n
    }

    fn clear(&mut self) {
        self.read_pos = 0;
        self.write_pos = 0;
        self.len = 0;
    }
}

/// Linear interpolation between neighbouring frames.
struct LinearResampler {
    ratio: f64,
    phase: f64,
    channels: usize,
}

impl LinearResampler {
    fn new(src_rate: u32, dst_rate: u32, channels: u16) -> Self {
        Self {
            ratio: dst_rate.max(1) as f64 / src_rate.max(1) as f64,
            phase: 0.0,
            channels: channels.max(1) as usize,
        }
    }

    fn process(&mut self, input: &[f32]) -> Vec<f32> {
        let ch = self.channels;
        let in_frames = input.len() / ch;
        if in_frames == 0 {
            return Vec::new();
        }
        let mut output = Vec::with_capacity(((in_frames as f64) * self.ratio).ceil() as usize * ch);
        while (self.phase as usize) < in_frames {
            let idx = self.phase as usize;
            let frac = (self.phase - idx as f64) as f32;
            let next = (idx + 1).min(in_frames - 1);
            for c in 0..ch {
                let s0 = input[idx * ch + c];
                let s1 = input[next * ch + c];
                output.push(s0 + (s1 - s0) * frac);
            }
            self.phase += 1.0 / self.ratio;
        }
        self.phase = (self.phase - in_frames as f64).max(0.0);
        output
    }
}

/// Up- or down-mix interleaved frames from `src_ch` to `dst_ch` channels.
fn adapt_channels(src: &[f32], src_ch: u16, dst: &mut [f32], dst_ch: u16) {
    let src_ch = src_ch.max(1) as usize;
    let dst_ch = dst_ch.max(1) as usize;
    let sample = |i: usize| src.get(i).copied().unwrap_or(0.0);

    for (frame, out) in dst.chunks_mut(dst_ch).enumerate() {
        let base = frame * src_ch;
        if src_ch == 1 {
            out.fill(sample(base));
        } else if dst_ch == 1 {
            let sum: f32 = (0..src_ch).map(|c| sample(base + c)).sum();
            out[0] = sum / src_ch as f32;
        } else {
            for (c, slot) in out.iter_mut().enumerate() {
                *slot = if c < src_ch { sample(base + c) } else { 0.0 };
            }
        }
    }
}
