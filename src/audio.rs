//! アップロード音声の正規化
//!
//! 任意のコンテナをデコード → モノラル化 → 無音区間除去（任意）→ 16kHz へリサンプル →
//! 16-bit PCM の WAV へ再エンコードする。
use std::any::Any;
use std::io::{Cursor, ErrorKind};
use std::panic;

use audiopus::coder::Decoder as OpusDecoder;
use audiopus::{Channels, SampleRate};
use rubato::{
    Resampler, SincFixedIn, SincInterpolationParameters, SincInterpolationType, WindowFunction,
};
use symphonia::core::audio::SampleBuffer;
use symphonia::core::codecs::{CodecParameters, DecoderOptions, CODEC_TYPE_NULL, CODEC_TYPE_OPUS};
use symphonia::core::errors::Error as SymphoniaError;
use symphonia::core::formats::{FormatOptions, FormatReader, Packet};
use symphonia::core::io::MediaSourceStream;
use symphonia::core::meta::MetadataOptions;
use symphonia::core::probe::Hint;
use tracing::{debug, warn};

use crate::config::{AudioConfig, SilenceConfig};
use crate::error::{RelayError, RelayResult, TranscodeError};

pub const TARGET_SAMPLE_RATE: u32 = 16_000;
pub const TARGET_CHANNELS: u16 = 1;
pub const TARGET_BITS_PER_SAMPLE: u16 = 16;

/// Opus は常に 48kHz でデコードする
const OPUS_SAMPLE_RATE: u32 = 48_000;
/// 1パケットの最大長（120ms @ 48kHz）
const OPUS_MAX_FRAME_SAMPLES: usize = 5_760;
/// OpusHead が読めないときのプリスキップ
const OPUS_DEFAULT_PRE_SKIP: usize = 312;
/// リサンプラの sinc フィルタ長
const RESAMPLE_SINC_LEN: usize = 256;
/// 無音判定の窓幅
const SILENCE_FRAME_MS: usize = 10;

/// デコード済み（モノラル化済み）の音声
#[derive(Debug, Clone)]
pub struct DecodedAudio {
    pub samples: Vec<f32>,
    pub sample_rate: u32,
    /// 元ストリームのチャンネル数
    pub channels: usize,
}

/// モノラル・16kHz・16-bit PCM の WAV バイト列
#[derive(Debug, Clone)]
pub struct NormalizedAudio {
    bytes: Vec<u8>,
    duration_ms: u64,
}

impl NormalizedAudio {
    pub fn sample_rate(&self) -> u32 {
        TARGET_SAMPLE_RATE
    }

    pub fn channels(&self) -> u16 {
        TARGET_CHANNELS
    }

    pub fn bits_per_sample(&self) -> u16 {
        TARGET_BITS_PER_SAMPLE
    }

    pub fn duration_ms(&self) -> u64 {
        self.duration_ms
    }

    pub fn len(&self) -> usize {
        self.bytes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.bytes.is_empty()
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.bytes
    }

    pub fn into_bytes(self) -> Vec<u8> {
        self.bytes
    }
}

#[derive(Debug, Clone)]
pub struct AudioNormalizer {
    source_format: String,
    silence: SilenceConfig,
}

impl AudioNormalizer {
    pub fn new(config: &AudioConfig) -> Self {
        Self {
            source_format: config.source_format.to_ascii_lowercase(),
            silence: config.silence.clone(),
        }
    }

    /// 生のアップロードを正規化する
    ///
    /// `format_hint` はアップロードの拡張子などから得たコンテナ形式。無ければ
    /// 先頭バイトから推定し、それも無理なら設定の `source_format` を使う。
    /// ヒントはプローブ順の優先度に使うだけなので、外れていてもデコードはできる。
    pub fn normalize(&self, raw: &[u8], format_hint: Option<&str>) -> RelayResult<NormalizedAudio> {
        if raw.is_empty() {
            return Err(RelayError::EmptyAudio);
        }

        let hint = format_hint
            .or_else(|| detect_audio_format(raw))
            .unwrap_or(&self.source_format);

        // 壊れたコンテナでデマルチプレクサが panic することがあるので入力エラーとして扱う
        let decoded = panic::catch_unwind(|| decode_audio(raw, hint))
            .map_err(|payload| TranscodeError::Panicked(panic_message(payload.as_ref())))??;
        debug!(
            input_bytes = raw.len(),
            hint,
            sample_rate = decoded.sample_rate,
            channels = decoded.channels,
            samples = decoded.samples.len(),
            "decoded upload"
        );

        let samples = if self.silence.enabled {
            let before = decoded.samples.len();
            let trimmed = strip_silence(&decoded.samples, decoded.sample_rate, &self.silence);
            debug!(before, after = trimmed.len(), "silence stripped");
            trimmed
        } else {
            decoded.samples
        };

        let resampled = resample(samples, decoded.sample_rate, TARGET_SAMPLE_RATE)?;
        let duration_ms = resampled.len() as u64 * 1000 / TARGET_SAMPLE_RATE as u64;
        let bytes = encode_wav(&resampled, TARGET_SAMPLE_RATE)?;

        Ok(NormalizedAudio { bytes, duration_ms })
    }
}

/// panic のペイロードから文字列を取り出す
pub fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(message) = payload.downcast_ref::<&str>() {
        message.to_string()
    } else if let Some(message) = payload.downcast_ref::<String>() {
        message.clone()
    } else {
        "unknown panic".to_string()
    }
}

/// バイト列をデコードしてモノラルの f32 サンプルにする
pub fn decode_audio(bytes: &[u8], format_hint: &str) -> Result<DecodedAudio, TranscodeError> {
    let mss = MediaSourceStream::new(Box::new(Cursor::new(bytes.to_vec())), Default::default());

    let mut hint = Hint::new();
    hint.with_extension(format_hint);

    let meta_opts: MetadataOptions = Default::default();
    let fmt_opts: FormatOptions = Default::default();

    let probed = symphonia::default::get_probe()
        .format(&hint, mss, &fmt_opts, &meta_opts)
        .map_err(TranscodeError::Probe)?;
    let mut format = probed.format;

    let (track_id, codec_params) = {
        let track = format
            .tracks()
            .iter()
            .find(|t| t.codec_params.codec != CODEC_TYPE_NULL)
            .ok_or(TranscodeError::NoAudioTrack)?;

        (track.id, track.codec_params.clone())
    };

    // ブラウザ録音（WebM/Ogg）の Opus は symphonia ではデコードできないので libopus に回す
    if codec_params.codec == CODEC_TYPE_OPUS {
        decode_opus(format.as_mut(), track_id, &codec_params)
    } else {
        decode_pcm(format.as_mut(), track_id, &codec_params)
    }
}

/// 次のパケットを読む。ストリーム終端は `None`
fn next_packet(format: &mut dyn FormatReader) -> Result<Option<Packet>, TranscodeError> {
    match format.next_packet() {
        Ok(packet) => Ok(Some(packet)),
        Err(SymphoniaError::ResetRequired) => Ok(None),
        Err(SymphoniaError::IoError(ref err)) if err.kind() == ErrorKind::UnexpectedEof => {
            Ok(None)
        }
        Err(err) => Err(TranscodeError::Decode(err)),
    }
}

fn decode_pcm(
    format: &mut dyn FormatReader,
    track_id: u32,
    codec_params: &CodecParameters,
) -> Result<DecodedAudio, TranscodeError> {
    let dec_opts: DecoderOptions = Default::default();
    let mut decoder = symphonia::default::get_codecs()
        .make(codec_params, &dec_opts)
        .map_err(TranscodeError::UnsupportedCodec)?;

    let mut samples = Vec::new();
    let mut sample_rate = codec_params.sample_rate;
    let mut channels = codec_params.channels.map(|ch| ch.count()).unwrap_or(1);

    while let Some(packet) = next_packet(format)? {
        if packet.track_id() != track_id {
            continue;
        }

        match decoder.decode(&packet) {
            Ok(audio_buf) => {
                let spec = *audio_buf.spec();
                if audio_buf.frames() == 0 {
                    continue;
                }
                sample_rate = Some(spec.rate);
                channels = spec.channels.count().max(1);

                let mut buffer = SampleBuffer::<f32>::new(audio_buf.capacity() as u64, spec);
                buffer.copy_interleaved_ref(audio_buf);
                mix_to_mono(buffer.samples(), channels, &mut samples);
            }
            // 壊れたパケットは読み飛ばす
            Err(SymphoniaError::DecodeError(reason)) => {
                warn!(reason, "skipping undecodable packet");
            }
            Err(SymphoniaError::IoError(ref err)) if err.kind() == ErrorKind::UnexpectedEof => {
                break;
            }
            Err(err) => return Err(TranscodeError::Decode(err)),
        }
    }

    if samples.is_empty() {
        return Err(TranscodeError::NoSamples);
    }

    let sample_rate = sample_rate.ok_or(TranscodeError::MissingSampleRate)?;

    Ok(DecodedAudio {
        samples,
        sample_rate,
        channels,
    })
}

fn decode_opus(
    format: &mut dyn FormatReader,
    track_id: u32,
    codec_params: &CodecParameters,
) -> Result<DecodedAudio, TranscodeError> {
    // libopus のモノラル出力はステレオストリームもダウンミックスしてくれる
    let mut decoder =
        OpusDecoder::new(SampleRate::Hz48000, Channels::Mono).map_err(TranscodeError::Opus)?;
    let channels = codec_params.channels.map(|ch| ch.count()).unwrap_or(1);

    let mut frame = vec![0f32; OPUS_MAX_FRAME_SAMPLES];
    let mut samples = Vec::new();

    while let Some(packet) = next_packet(format)? {
        if packet.track_id() != track_id || packet.data.is_empty() {
            continue;
        }

        let input = audiopus::packet::Packet::try_from(&packet.data[..])
            .map_err(TranscodeError::Opus)?;
        let output =
            audiopus::MutSignals::try_from(&mut frame[..]).map_err(TranscodeError::Opus)?;
        let decoded = decoder
            .decode_float(Some(input), output, false)
            .map_err(TranscodeError::Opus)?;

        samples.extend_from_slice(&frame[..decoded.min(frame.len())]);
    }

    // エンコーダのプリスキップ分を捨てる
    let pre_skip = opus_pre_skip(codec_params);
    if pre_skip > 0 {
        samples.drain(..pre_skip.min(samples.len()));
    }

    if samples.is_empty() {
        return Err(TranscodeError::NoSamples);
    }

    Ok(DecodedAudio {
        samples,
        sample_rate: OPUS_SAMPLE_RATE,
        channels,
    })
}

/// Opus のプリスキップ（48kHz のサンプル数）
///
/// Ogg ではデマルチプレクサが `delay` に入れてくれるが、WebM では入らないので
/// CodecPrivate の OpusHead から読む。どちらも無ければ libopus の既定値を使う。
pub fn opus_pre_skip(codec_params: &CodecParameters) -> usize {
    if let Some(delay) = codec_params.delay {
        return delay as usize;
    }

    codec_params
        .extra_data
        .as_deref()
        .filter(|head| head.len() >= 12 && head.starts_with(b"OpusHead"))
        .map(|head| u16::from_le_bytes([head[10], head[11]]) as usize)
        .unwrap_or(OPUS_DEFAULT_PRE_SKIP)
}

/// インターリーブされたサンプルを平均してモノラルにする
fn mix_to_mono(interleaved: &[f32], channels: usize, out: &mut Vec<f32>) {
    if channels <= 1 {
        out.extend_from_slice(interleaved);
        return;
    }

    out.extend(
        interleaved
            .chunks_exact(channels)
            .map(|frame| frame.iter().sum::<f32>() / channels as f32),
    );
}

pub fn rms(samples: &[f32]) -> f32 {
    if samples.is_empty() {
        return 0.0;
    }
    let sum: f32 = samples.iter().map(|s| s * s).sum();
    (sum / samples.len() as f32).sqrt()
}

/// フルスケール 1.0 に対する dBFS。無音は負の無限大
pub fn dbfs(samples: &[f32]) -> f32 {
    let value = rms(samples);
    if value <= 0.0 {
        f32::NEG_INFINITY
    } else {
        20.0 * value.log10()
    }
}

/// 閾値以下の区間が `min_silence_ms` 以上続く部分を取り除く
///
/// 残す音声の両側には `keep_silence_ms` 分の余白を残す。全体が無音の場合は
/// 元のサンプルをそのまま返す。
pub fn strip_silence(samples: &[f32], sample_rate: u32, params: &SilenceConfig) -> Vec<f32> {
    if samples.is_empty() || sample_rate == 0 {
        return samples.to_vec();
    }

    let frame_len = (sample_rate as usize * SILENCE_FRAME_MS / 1000).max(1);
    let min_frames = (params.min_silence_ms as usize).div_ceil(SILENCE_FRAME_MS).max(1);
    let keep = sample_rate as usize * params.keep_silence_ms as usize / 1000;
    let len = samples.len();

    let silent: Vec<bool> = samples
        .chunks(frame_len)
        .map(|frame| dbfs(frame) <= params.threshold_dbfs)
        .collect();

    // 長い無音区間（サンプル位置）を集める
    let mut removals = Vec::new();
    let mut run_start: Option<usize> = None;
    for (index, &is_silent) in silent.iter().chain(std::iter::once(&false)).enumerate() {
        match (is_silent, run_start) {
            (true, None) => run_start = Some(index),
            (false, Some(start)) => {
                if index - start >= min_frames {
                    removals.push((start * frame_len, (index * frame_len).min(len)));
                }
                run_start = None;
            }
            _ => {}
        }
    }

    if removals.is_empty() {
        return samples.to_vec();
    }
    if removals.len() == 1 && removals[0] == (0, len) {
        return samples.to_vec();
    }

    let mut output = Vec::with_capacity(len);
    let mut cursor = 0;
    for (start, end) in removals {
        let cut_start = if start == 0 { 0 } else { start + keep };
        let cut_end = if end == len { len } else { end.saturating_sub(keep) };
        if cut_start >= cut_end {
            continue;
        }
        output.extend_from_slice(&samples[cursor..cut_start]);
        cursor = cut_end;
    }
    output.extend_from_slice(&samples[cursor..]);

    output
}

/// 入力レートから出力レートへリサンプル
pub fn resample(
    samples: Vec<f32>,
    input_rate: u32,
    output_rate: u32,
) -> Result<Vec<f32>, TranscodeError> {
    if samples.is_empty() {
        return Err(TranscodeError::NoSamples);
    }

    if input_rate == output_rate {
        return Ok(samples);
    }

    let ratio = output_rate as f64 / input_rate as f64;
    let expected = ((samples.len() as f64 * ratio).round() as usize).max(1);

    // 1チャンクで処理すると末尾 sinc_len/2 サンプル分が出力されないので、
    // 無音で埋めてから期待長に切り詰める（数ミリ秒の短いクリップも通す）
    let mut padded = samples;
    padded.resize(padded.len() + RESAMPLE_SINC_LEN, 0.0);

    let params = SincInterpolationParameters {
        sinc_len: RESAMPLE_SINC_LEN,
        f_cutoff: 0.95,
        interpolation: SincInterpolationType::Linear,
        oversampling_factor: 256,
        window: WindowFunction::BlackmanHarris2,
    };

    let mut resampler = SincFixedIn::<f32>::new(
        ratio,
        2.0,
        params,
        padded.len(),
        1, // モノラル
    )
    .map_err(|e| TranscodeError::Resample(e.to_string()))?;

    let input_channels = vec![padded];
    let output_channels = resampler
        .process(&input_channels, None)
        .map_err(|e| TranscodeError::Resample(e.to_string()))?;

    let mut output = output_channels
        .into_iter()
        .next()
        .filter(|channel| !channel.is_empty())
        .ok_or(TranscodeError::NoSamples)?;
    output.truncate(expected);
    Ok(output)
}

/// f32 サンプルを 16-bit PCM モノラルの WAV にする
pub fn encode_wav(samples: &[f32], sample_rate: u32) -> Result<Vec<u8>, TranscodeError> {
    let spec = hound::WavSpec {
        channels: TARGET_CHANNELS,
        sample_rate,
        bits_per_sample: TARGET_BITS_PER_SAMPLE,
        sample_format: hound::SampleFormat::Int,
    };

    let mut cursor = Cursor::new(Vec::new());
    {
        let mut writer = hound::WavWriter::new(&mut cursor, spec).map_err(TranscodeError::Encode)?;
        for &sample in samples {
            let clamped = if sample.is_finite() { sample.clamp(-1.0, 1.0) } else { 0.0 };
            let value = (clamped * i16::MAX as f32).round() as i16;
            writer.write_sample(value).map_err(TranscodeError::Encode)?;
        }
        writer.finalize().map_err(TranscodeError::Encode)?;
    }

    Ok(cursor.into_inner())
}

/// 先頭バイトからコンテナ形式を推定
pub fn detect_audio_format(bytes: &[u8]) -> Option<&'static str> {
    if bytes.len() >= 12 && &bytes[0..4] == b"RIFF" && &bytes[8..12] == b"WAVE" {
        Some("wav")
    } else if bytes.len() >= 4 && bytes[0..4] == [0x1A, 0x45, 0xDF, 0xA3] {
        Some("webm")
    } else if bytes.len() >= 4 && &bytes[0..4] == b"OggS" {
        Some("ogg")
    } else if bytes.len() >= 4 && &bytes[0..4] == b"fLaC" {
        Some("flac")
    } else if bytes.len() >= 8 && &bytes[4..8] == b"ftyp" {
        Some("m4a")
    } else if bytes.len() >= 3 && &bytes[0..3] == b"ID3" {
        Some("mp3")
    } else if bytes.len() >= 2 && bytes[0] == 0xFF && (bytes[1] & 0xE0) == 0xE0 {
        Some("mp3")
    } else {
        None
    }
}
