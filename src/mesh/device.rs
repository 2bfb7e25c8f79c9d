//! Default microphone and speaker through cpal. The cpal stream is not
//! `Send`, so each one lives on its own thread until told to stop.
use std::{
    collections::{HashMap, VecDeque},
    sync::{mpsc as std_mpsc, Arc, Mutex},
    thread,
};
use async_trait::async_trait;
use cpal::{
    traits::{DeviceTrait, HostTrait, StreamTrait},
    FromSample, Sample, SampleFormat, SizedSample,
};
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, info, warn};

use super::{
    audio::{self, AudioOutput, CaptureConstraints, CapturedStream, MediaDevices, StopHandle},
    MeshErr,
};

/// Roughly 1 s of queued capture before frames are dropped.
const CAPTURE_QUEUE: usize = 64;

/* ------------ 麥克風 ------------ */
pub struct CpalDevices;

#[async_trait]
impl MediaDevices for CpalDevices {
    async fn acquire(&self, constraints: &CaptureConstraints) -> Result<CapturedStream, MeshErr> {
        let (ready_tx, ready_rx) = oneshot::channel::<Result<u32, String>>();
        let (stop_tx, stop_rx) = std_mpsc::channel::<()>();
        let (frames_tx, frames_rx) = mpsc::channel::<Vec<f32>>(CAPTURE_QUEUE);
        let wanted = constraints.channels;

        thread::spawn(move || {
            let (stream, rate) = match open_input(frames_tx, wanted) {
                Ok(v) => v,
                Err(e) => { ready_tx.send(Err(e)).ok(); return; }
            };
            ready_tx.send(Ok(rate)).ok();
            // stop 訊號或 handle 被丟掉都會醒來
            stop_rx.recv().ok();
            drop(stream);
            debug!("capture device released");
        });

        let sample_rate = ready_rx
            .await
            .map_err(|_| MeshErr::Media("capture thread exited".into()))?
            .map_err(MeshErr::Media)?;
        Ok(CapturedStream {
            sample_rate,
            frames: frames_rx,
            stop: StopHandle::new(move || { stop_tx.send(()).ok(); }),
        })
    }
}

fn open_input(frames: mpsc::Sender<Vec<f32>>, wanted: u16) -> Result<(cpal::Stream, u32), String> {
    let device = cpal::default_host()
        .default_input_device()
        .ok_or("no input device available")?;
    let config = device.default_input_config().map_err(|e| e.to_string())?;
    info!(device = ?device.name().ok(), ?config, "opening capture device");
    if config.channels() != wanted {
        debug!(have = config.channels(), wanted, "downmixing capture to mono");
    }

    let stream = match config.sample_format() {
        SampleFormat::F32 => build_input::<f32>(&device, &config.clone().into(), frames),
        SampleFormat::I16 => build_input::<i16>(&device, &config.clone().into(), frames),
        SampleFormat::U16 => build_input::<u16>(&device, &config.clone().into(), frames),
        other => return Err(format!("unsupported sample format {other:?}")),
    }?;
    stream.play().map_err(|e| e.to_string())?;
    Ok((stream, config.sample_rate().0))
}

fn build_input<T>(
    device: &cpal::Device,
    config: &cpal::StreamConfig,
    frames: mpsc::Sender<Vec<f32>>,
) -> Result<cpal::Stream, String>
where
    T: SizedSample + Send + 'static,
    f32: FromSample<T>,
{
    let channels = config.channels.max(1) as usize;
    device
        .build_input_stream(
            config,
            move |data: &[T], _: &cpal::InputCallbackInfo| {
                let mono: Vec<f32> = data
                    .chunks(channels)
                    .map(|ch| ch.iter().map(|s| s.to_sample::<f32>()).sum::<f32>() / ch.len() as f32)
                    .collect();
                // 佇列滿了就丟，不阻塞音訊執行緒
                frames.try_send(mono).ok();
            },
            |e| warn!(error = %e, "capture stream error"),
            None,
        )
        .map_err(|e| e.to_string())
}

/* ------------ 喇叭 ------------ */
/// One remote voice: samples at the device rate waiting to be mixed.
struct Voice {
    queue: VecDeque<f32>,
    rate:  audio::Resampler,
}

type Queues = Arc<Mutex<HashMap<String, Voice>>>;

/// Mixes every remote voice into the default output device.
pub struct CpalOutput {
    queues: Queues,
    rate:   u32,
    _stop:  std_mpsc::Sender<()>,
}

impl CpalOutput {
    pub fn open() -> Result<Self, MeshErr> {
        let queues: Queues = Arc::default();
        let (ready_tx, ready_rx) = std_mpsc::sync_channel::<Result<u32, String>>(1);
        let (stop_tx, stop_rx) = std_mpsc::channel::<()>();
        let q = queues.clone();

        thread::spawn(move || {
            let (stream, rate) = match open_output(q) {
                Ok(v) => v,
                Err(e) => { ready_tx.send(Err(e)).ok(); return; }
            };
            ready_tx.send(Ok(rate)).ok();
            stop_rx.recv().ok();
            drop(stream);
        });

        let rate = ready_rx
            .recv()
            .map_err(|_| MeshErr::Media("playback thread exited".into()))?
            .map_err(MeshErr::Media)?;
        Ok(Self { queues, rate, _stop: stop_tx })
    }
}

impl AudioOutput for CpalOutput {
    fn play(&self, from: &str, pcm: &[f32]) {
        let Ok(mut qs) = self.queues.lock() else { return };
        let voice = qs.entry(from.to_string()).or_insert_with(|| Voice {
            queue: VecDeque::new(),
            rate:  audio::Resampler::new(audio::MESH_SAMPLE_RATE, self.rate),
        });
        let samples = voice.rate.process(pcm);
        voice.queue.extend(samples);
        let cap = self.rate as usize;
        if voice.queue.len() > cap {
            let excess = voice.queue.len() - cap;
            voice.queue.drain(..excess);
        }
    }

    fn release(&self, from: &str) {
        if let Ok(mut qs) = self.queues.lock() {
            qs.remove(from);
        }
    }
}

fn open_output(queues: Queues) -> Result<(cpal::Stream, u32), String> {
    let device = cpal::default_host()
        .default_output_device()
        .ok_or("no output device available")?;
    let config = device.default_output_config().map_err(|e| e.to_string())?;
    info!(device = ?device.name().ok(), ?config, "opening playback device");

    let stream = match config.sample_format() {
        SampleFormat::F32 => build_output::<f32>(&device, &config.clone().into(), queues),
        SampleFormat::I16 => build_output::<i16>(&device, &config.clone().into(), queues),
        SampleFormat::U16 => build_output::<u16>(&device, &config.clone().into(), queues),
        other => return Err(format!("unsupported sample format {other:?}")),
    }?;
    stream.play().map_err(|e| e.to_string())?;
    Ok((stream, config.sample_rate().0))
}

fn build_output<T>(
    device: &cpal::Device,
    config: &cpal::StreamConfig,
    queues: Queues,
) -> Result<cpal::Stream, String>
where
    T: SizedSample + FromSample<f32> + Send + 'static,
{
    let channels = config.channels.max(1) as usize;
    device
        .build_output_stream(
            config,
            move |data: &mut [T], _: &cpal::OutputCallbackInfo| match queues.lock() {
                Ok(mut voices) => mix_into(data, channels, Some(&mut *voices)),
                Err(_) => mix_into(data, channels, None),
            },
            |e| warn!(error = %e, "playback stream error"),
            None,
        )
        .map_err(|e| e.to_string())
}

/// Fills one device buffer with the sum of every voice; silence without voices.
fn mix_into<T>(data: &mut [T], channels: usize, mut voices: Option<&mut HashMap<String, Voice>>)
where
    T: SizedSample + FromSample<f32>,
{
    for frame in data.chunks_mut(channels.max(1)) {
        let mixed: f32 = match voices.as_deref_mut() {
            Some(vs) => vs.values_mut().filter_map(|v| v.queue.pop_front()).sum(),
            None => 0.0,
        };
        let v = T::from_sample(mixed.clamp(-1.0, 1.0));
        frame.iter_mut().for_each(|s| *s = v);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn voice(samples: &[f32]) -> Voice {
        Voice { queue: samples.iter().copied().collect(), rate: audio::Resampler::new(8_000, 8_000) }
    }

    #[test]
    fn voices_are_summed_per_frame() {
        let mut vs = HashMap::new();
        vs.insert("b".to_string(), voice(&[0.25, 0.25]));
        vs.insert("c".to_string(), voice(&[0.5]));
        let mut data = [9.0f32; 6];
        mix_into(&mut data, 2, Some(&mut vs));
        assert_eq!(data, [0.75, 0.75, 0.25, 0.25, 0.0, 0.0]);
    }

    #[test]
    fn unreadable_voices_play_silence() {
        let mut data = [9.0f32; 4];
        mix_into(&mut data, 2, None);
        assert_eq!(data, [0.0; 4]);
    }
}
