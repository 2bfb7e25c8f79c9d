//! Local audio: capture → conditioning → gain (mute) → µ-law frames on the
//! published track. Remote tracks come back out through [`AudioOutput`].
use std::{
    sync::{
        atomic::{AtomicU32, Ordering},
        Arc,
    },
    time::Duration,
};
use async_trait::async_trait;
use bytes::Bytes;
use tokio::{sync::mpsc, task::JoinHandle};
use tracing::{debug, info, warn};
use webrtc::{
    api::media_engine::MIME_TYPE_PCMU,
    media::Sample,
    rtp_transceiver::rtp_codec::RTCRtpCodecCapability,
    track::track_local::track_local_static_sample::TrackLocalStaticSample,
};

use super::MeshErr;

pub const MESH_SAMPLE_RATE: u32 = 8_000;
pub const FRAME: Duration = Duration::from_millis(20);
pub const FRAME_SAMPLES: usize = 160;
pub const PCMU_PAYLOAD_TYPE: u8 = 0;

/* ------------ 擷取 ------------ */
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CaptureConstraints {
    pub channels:          u16,
    pub echo_cancellation: bool,
    pub noise_suppression: bool,
    pub auto_gain_control: bool,
}

impl CaptureConstraints {
    /// Mono voice with every processing flag on.
    pub fn voice() -> Self {
        Self { channels: 1, echo_cancellation: true, noise_suppression: true, auto_gain_control: true }
    }
}

/// Releases a capture device once, on `stop` or on drop.
pub struct StopHandle(Option<Box<dyn FnOnce() + Send + Sync>>);

impl StopHandle {
    pub fn new(f: impl FnOnce() + Send + Sync + 'static) -> Self { Self(Some(Box::new(f))) }
    pub fn noop() -> Self { Self(None) }

    pub fn stop(&mut self) {
        if let Some(f) = self.0.take() {
            f();
        }
    }
}

impl Drop for StopHandle {
    fn drop(&mut self) { self.stop(); }
}

/// Mono f32 frames from a capture device at its native rate.
pub struct CapturedStream {
    pub sample_rate: u32,
    pub frames:      mpsc::Receiver<Vec<f32>>,
    pub stop:        StopHandle,
}

#[async_trait]
pub trait MediaDevices: Send + Sync {
    async fn acquire(&self, constraints: &CaptureConstraints) -> Result<CapturedStream, MeshErr>;
}

/* ------------ 增益（靜音） ------------ */
/// Shared software gain; mute is gain 0 so the track itself never changes.
#[derive(Clone)]
pub struct GainStage(Arc<AtomicU32>);

impl GainStage {
    pub fn new(muted: bool) -> Self {
        Self(Arc::new(AtomicU32::new(if muted { 0f32 } else { 1f32 }.to_bits())))
    }

    pub fn set_muted(&self, muted: bool) {
        let g: f32 = if muted { 0.0 } else { 1.0 };
        self.0.store(g.to_bits(), Ordering::Relaxed);
    }

    pub fn gain(&self) -> f32 { f32::from_bits(self.0.load(Ordering::Relaxed)) }
    pub fn is_muted(&self) -> bool { self.gain() == 0.0 }

    pub fn apply(&self, frame: &mut [f32]) {
        let g = self.gain();
        for s in frame.iter_mut() {
            *s *= g;
        }
    }
}

/* ------------ 前處理 ------------ */
const TARGET_RMS: f32 = 0.1;
const GATE_RMS: f32 = 0.005;
const BOOST_MIN: f32 = 0.25;
const BOOST_MAX: f32 = 8.0;
const BOOST_SMOOTHING: f32 = 0.1;

/// Software stand-in for the capture processing flags: a noise gate and a
/// smoothed automatic gain.
pub struct Conditioner {
    gate:  bool,
    agc:   bool,
    boost: f32,
}

impl Conditioner {
    pub fn new(c: &CaptureConstraints) -> Self {
        Self { gate: c.noise_suppression, agc: c.auto_gain_control, boost: 1.0 }
    }

    pub fn process(&mut self, frame: &mut [f32]) {
        let level = rms(frame);
        if self.gate && level < GATE_RMS {
            frame.iter_mut().for_each(|s| *s = 0.0);
            return;
        }
        if self.agc && level > f32::EPSILON {
            let want = (TARGET_RMS / level).clamp(BOOST_MIN, BOOST_MAX);
            self.boost += (want - self.boost) * BOOST_SMOOTHING;
            for s in frame.iter_mut() {
                *s = (*s * self.boost).clamp(-1.0, 1.0);
            }
        }
    }
}

fn rms(frame: &[f32]) -> f32 {
    if frame.is_empty() {
        return 0.0;
    }
    (frame.iter().map(|s| s * s).sum::<f32>() / frame.len() as f32).sqrt()
}

/// Streaming linear interpolation between rates. The read position and the
/// last input sample carry over between calls, so chunked input produces the
/// same stream as one long buffer.
#[derive(Debug, Clone)]
pub struct Resampler {
    step: f64,
    pos:  f64,
    last: Option<f32>,
}

impl Resampler {
    pub fn new(from: u32, to: u32) -> Self {
        let step = if from == 0 || to == 0 { 1.0 } else { from as f64 / to as f64 };
        Self { step, pos: 0.0, last: None }
    }

    pub fn is_passthrough(&self) -> bool { self.step == 1.0 }

    pub fn process(&mut self, input: &[f32]) -> Vec<f32> {
        if self.is_passthrough() || input.is_empty() {
            return input.to_vec();
        }
        // 上一段的最後一個取樣當作索引 0
        let carried = usize::from(self.last.is_some());
        let at = |i: usize| if i < carried { self.last.unwrap_or_default() } else { input[i - carried] };
        let span = (input.len() + carried - 1) as f64;

        let mut out = Vec::with_capacity((input.len() as f64 / self.step) as usize + 1);
        while self.pos < span {
            let idx = self.pos as usize;
            let frac = (self.pos - idx as f64) as f32;
            let (a, b) = (at(idx), at(idx + 1));
            out.push(a + (b - a) * frac);
            self.pos += self.step;
        }
        self.pos -= span;
        self.last = input.last().copied();
        out
    }
}

/* ------------ G.711 µ-law ------------ */
const MULAW_BIAS: i32 = 0x84;
const MULAW_CLIP: i32 = 32_635;

pub fn mulaw_encode(sample: i16) -> u8 {
    let mut s = sample as i32;
    let sign = if s < 0 { 0x80 } else { 0 };
    if s < 0 {
        s = -s;
    }
    s = s.min(MULAW_CLIP) + MULAW_BIAS;
    let exponent = (7 - (s << 17).leading_zeros().min(7)) as i32;
    let mantissa = (s >> (exponent + 3)) & 0x0F;
    !(sign | (exponent << 4) | mantissa) as u8
}

pub fn mulaw_decode(byte: u8) -> i16 {
    let b = !byte as i32;
    let sign = b & 0x80;
    let exponent = (b >> 4) & 0x07;
    let mantissa = b & 0x0F;
    let magnitude = (((mantissa << 3) + MULAW_BIAS) << exponent) - MULAW_BIAS;
    (if sign != 0 { -magnitude } else { magnitude }) as i16
}

pub fn encode_pcmu(pcm: &[f32]) -> Vec<u8> {
    pcm.iter()
        .map(|s| mulaw_encode((s.clamp(-1.0, 1.0) * i16::MAX as f32) as i16))
        .collect()
}

pub fn decode_pcmu(payload: &[u8]) -> Vec<f32> {
    payload.iter().map(|b| mulaw_decode(*b) as f32 / i16::MAX as f32).collect()
}

/* ------------ 發佈 ------------ */
#[async_trait]
pub trait FrameSink: Send + Sync {
    async fn write_frame(&self, payload: Bytes, duration: Duration) -> Result<(), MeshErr>;
}

#[async_trait]
impl FrameSink for TrackLocalStaticSample {
    async fn write_frame(&self, payload: Bytes, duration: Duration) -> Result<(), MeshErr> {
        self.write_sample(&Sample { data: payload, duration, ..Default::default() }).await?;
        Ok(())
    }
}

/// The one outgoing track every link carries.
pub fn published_track() -> Arc<TrackLocalStaticSample> {
    Arc::new(TrackLocalStaticSample::new(
        RTCRtpCodecCapability {
            mime_type: MIME_TYPE_PCMU.to_owned(),
            clock_rate: MESH_SAMPLE_RATE,
            channels: 1,
            ..Default::default()
        },
        "audio".to_owned(),
        "mesh-voice".to_owned(),
    ))
}

/// Running capture pipeline. Dropping it releases the device.
pub struct AudioPipeline {
    stop: StopHandle,
    task: JoinHandle<()>,
}

impl AudioPipeline {
    pub fn start(
        stream: CapturedStream,
        constraints: &CaptureConstraints,
        gain: GainStage,
        sink: Arc<dyn FrameSink>,
    ) -> Self {
        if constraints.echo_cancellation {
            warn!("echo cancellation is not available in software, capturing without it");
        }
        let CapturedStream { sample_rate, mut frames, stop } = stream;
        let mut cond = Conditioner::new(constraints);
        info!(sample_rate, muted = gain.is_muted(), "audio pipeline started");

        let task = tokio::spawn(async move {
            let mut pending: Vec<f32> = Vec::with_capacity(FRAME_SAMPLES * 2);
            let mut rate = Resampler::new(sample_rate, MESH_SAMPLE_RATE);
            while let Some(mut frame) = frames.recv().await {
                cond.process(&mut frame);
                gain.apply(&mut frame);
                pending.extend(rate.process(&frame));
                while pending.len() >= FRAME_SAMPLES {
                    let chunk: Vec<f32> = pending.drain(..FRAME_SAMPLES).collect();
                    if let Err(e) = sink.write_frame(Bytes::from(encode_pcmu(&chunk)), FRAME).await {
                        debug!(error = %e, "frame not published");
                    }
                }
            }
            debug!("capture ended");
        });
        Self { stop, task }
    }

    pub fn stop(self) {
        drop(self);
    }
}

impl Drop for AudioPipeline {
    fn drop(&mut self) {
        self.stop.stop();
        self.task.abort();
    }
}

/* ------------ 播放 ------------ */
/// Destination for decoded remote audio, keyed by remote session id.
pub trait AudioOutput: Send + Sync {
    fn play(&self, from: &str, pcm: &[f32]);
    fn release(&self, _from: &str) {}
}

pub struct NullOutput;

impl AudioOutput for NullOutput {
    fn play(&self, _from: &str, _pcm: &[f32]) {}
}
