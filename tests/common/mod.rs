// 各テストバイナリで使う関数が異なるため
#![allow(dead_code)]

use std::io::Cursor;
use std::net::SocketAddr;
use std::sync::{Arc, Mutex};

use axum::{
    body::{Body, Bytes},
    http::{header::CONTENT_TYPE, HeaderMap, Request, StatusCode, Uri},
    routing::post,
    Router,
};
use pronunciation_relay::config::{Config, SubscriptionKey};

pub const PROVIDER_PATH: &str = "/speech/recognition/conversation/cognitiveservices/v1";
pub const BOUNDARY: &str = "relay-test-boundary";
pub const TEST_KEY: &str = "test-subscription-key";

/// テスト用設定（キー設定済み、送信先はモックプロバイダ）
pub fn test_config(endpoint: Option<String>) -> Config {
    let mut config = Config::default();
    config.provider.subscription_key = Some(SubscriptionKey::new(TEST_KEY));
    config.provider.endpoint = endpoint;
    config
}

/// 440Hz のサイン波を 16-bit PCM WAV で生成
pub fn sine_wav(sample_rate: u32, channels: u16, seconds: f32) -> Vec<u8> {
    let spec = hound::WavSpec {
        channels,
        sample_rate,
        bits_per_sample: 16,
        sample_format: hound::SampleFormat::Int,
    };

    let frames = (sample_rate as f32 * seconds) as usize;
    let mut cursor = Cursor::new(Vec::new());
    {
        let mut writer = hound::WavWriter::new(&mut cursor, spec).unwrap();
        for i in 0..frames {
            let t = i as f32 / sample_rate as f32;
            let sample = (2.0 * std::f32::consts::PI * 440.0 * t).sin() * 0.5;
            for _ in 0..channels {
                writer.write_sample((sample * i16::MAX as f32) as i16).unwrap();
            }
        }
        writer.finalize().unwrap();
    }
    cursor.into_inner()
}

/// 16kHz モノラルで「無音 → サイン波 → 無音」の WAV を生成
pub fn padded_tone_wav(silence_seconds: f32, tone_seconds: f32) -> Vec<u8> {
    let sample_rate = 16_000u32;
    let spec = hound::WavSpec {
        channels: 1,
        sample_rate,
        bits_per_sample: 16,
        sample_format: hound::SampleFormat::Int,
    };

    let silence = (sample_rate as f32 * silence_seconds) as usize;
    let tone = (sample_rate as f32 * tone_seconds) as usize;

    let mut cursor = Cursor::new(Vec::new());
    {
        let mut writer = hound::WavWriter::new(&mut cursor, spec).unwrap();
        for _ in 0..silence {
            writer.write_sample(0i16).unwrap();
        }
        for i in 0..tone {
            let t = i as f32 / sample_rate as f32;
            let sample = (2.0 * std::f32::consts::PI * 440.0 * t).sin() * 0.5;
            writer.write_sample((sample * i16::MAX as f32) as i16).unwrap();
        }
        for _ in 0..silence {
            writer.write_sample(0i16).unwrap();
        }
        writer.finalize().unwrap();
    }
    cursor.into_inner()
}

/// WAV のヘッダー情報とフレーム数
pub fn read_wav_spec(bytes: &[u8]) -> (hound::WavSpec, u32) {
    let reader = hound::WavReader::new(Cursor::new(bytes.to_vec())).unwrap();
    (reader.spec(), reader.duration())
}

/// `audio` / `text` フィールドを持つ multipart 本文
pub fn multipart_body(audio: Option<(&str, &[u8])>, text: Option<&str>) -> Vec<u8> {
    let mut body = Vec::new();

    if let Some((file_name, bytes)) = audio {
        body.extend_from_slice(format!("--{}\r\n", BOUNDARY).as_bytes());
        body.extend_from_slice(
            format!(
                "Content-Disposition: form-data; name=\"audio\"; filename=\"{}\"\r\n",
                file_name
            )
            .as_bytes(),
        );
        body.extend_from_slice(b"Content-Type: application/octet-stream\r\n\r\n");
        body.extend_from_slice(bytes);
        body.extend_from_slice(b"\r\n");
    }

    if let Some(text) = text {
        body.extend_from_slice(format!("--{}\r\n", BOUNDARY).as_bytes());
        body.extend_from_slice(b"Content-Disposition: form-data; name=\"text\"\r\n\r\n");
        body.extend_from_slice(text.as_bytes());
        body.extend_from_slice(b"\r\n");
    }

    body.extend_from_slice(format!("--{}--\r\n", BOUNDARY).as_bytes());
    body
}

pub fn assess_request(body: Vec<u8>) -> Request<Body> {
    Request::builder()
        .method("POST")
        .uri("/assess")
        .header(
            CONTENT_TYPE,
            format!("multipart/form-data; boundary={}", BOUNDARY),
        )
        .body(Body::from(body))
        .unwrap()
}

pub async fn body_bytes(response: axum::response::Response) -> Bytes {
    axum::body::to_bytes(response.into_body(), usize::MAX)
        .await
        .unwrap()
}

#[derive(Debug, Clone)]
pub struct CapturedRequest {
    pub uri: String,
    pub headers: HeaderMap,
    pub body: Vec<u8>,
}

impl CapturedRequest {
    /// `Pronunciation-Assessment` ヘッダーの JSON
    pub fn assessment_header(&self) -> serde_json::Value {
        let raw = self
            .headers
            .get("pronunciation-assessment")
            .expect("assessment header missing");
        serde_json::from_slice(raw.as_bytes()).unwrap()
    }
}

/// 固定の応答を返すモックプロバイダ
pub struct MockProvider {
    pub addr: SocketAddr,
    pub requests: Arc<Mutex<Vec<CapturedRequest>>>,
}

impl MockProvider {
    pub fn endpoint(&self) -> String {
        format!("http://{}{}", self.addr, PROVIDER_PATH)
    }

    pub fn captured(&self) -> Vec<CapturedRequest> {
        self.requests.lock().unwrap().clone()
    }
}

pub async fn spawn_provider(status: StatusCode, body: &'static str) -> MockProvider {
    let requests = Arc::new(Mutex::new(Vec::new()));
    let captured = Arc::clone(&requests);

    let app = Router::new().route(
        PROVIDER_PATH,
        post(move |uri: Uri, headers: HeaderMap, payload: Bytes| {
            let captured = Arc::clone(&captured);
            async move {
                captured.lock().unwrap().push(CapturedRequest {
                    uri: uri.to_string(),
                    headers,
                    body: payload.to_vec(),
                });
                (status, [(CONTENT_TYPE, "application/json")], body)
            }
        }),
    );

    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });

    MockProvider { addr, requests }
}

/// 何も待ち受けていないアドレス
pub async fn unused_endpoint() -> String {
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    drop(listener);
    format!("http://{}{}", addr, PROVIDER_PATH)
}

/// Opus の 20ms フレーム（48kHz）
const OPUS_FRAME_SAMPLES: usize = 960;
/// テスト用 Ogg/Opus のプリスキップ
pub const OPUS_PRE_SKIP: u16 = 312;

/// ブラウザ録音と同じ Ogg/Opus（48kHz モノラル、440Hz）を libopus で生成
pub fn sine_ogg_opus(seconds: f32) -> Vec<u8> {
    use audiopus::{coder::Encoder, Application, Channels, SampleRate};

    let encoder = Encoder::new(SampleRate::Hz48000, Channels::Mono, Application::Audio).unwrap();

    let total = (48_000.0 * seconds) as usize;
    let pcm: Vec<f32> = (0..total)
        .map(|i| (2.0 * std::f32::consts::PI * 440.0 * i as f32 / 48_000.0).sin() * 0.5)
        .collect();

    let mut head = b"OpusHead".to_vec();
    head.push(1); // version
    head.push(1); // channels
    head.extend_from_slice(&OPUS_PRE_SKIP.to_le_bytes());
    head.extend_from_slice(&48_000u32.to_le_bytes());
    head.extend_from_slice(&0i16.to_le_bytes()); // output gain
    head.push(0); // mapping family

    let vendor = b"relay-test";
    let mut tags = b"OpusTags".to_vec();
    tags.extend_from_slice(&(vendor.len() as u32).to_le_bytes());
    tags.extend_from_slice(vendor);
    tags.extend_from_slice(&0u32.to_le_bytes());

    let mut ogg = Vec::new();
    let mut sequence = 0u32;
    write_ogg_page(&mut ogg, 0x02, 0, sequence, &head);
    sequence += 1;
    write_ogg_page(&mut ogg, 0x00, 0, sequence, &tags);

    let frames: Vec<&[f32]> = pcm.chunks_exact(OPUS_FRAME_SAMPLES).collect();
    let mut granule = OPUS_PRE_SKIP as u64;
    let mut packet = vec![0u8; 4_000];
    for (index, frame) in frames.iter().enumerate() {
        let len = encoder.encode_float(frame, &mut packet).unwrap();
        granule += OPUS_FRAME_SAMPLES as u64;
        sequence += 1;
        let flags = if index + 1 == frames.len() { 0x04 } else { 0x00 };
        write_ogg_page(&mut ogg, flags, granule, sequence, &packet[..len]);
    }

    ogg
}

/// 1パケットだけを載せた Ogg ページを書き出す
fn write_ogg_page(out: &mut Vec<u8>, flags: u8, granule: u64, sequence: u32, packet: &[u8]) {
    const SERIAL: u32 = 0x5245_4C59;

    let mut lacing = vec![255u8; packet.len() / 255];
    lacing.push((packet.len() % 255) as u8);

    let start = out.len();
    out.extend_from_slice(b"OggS");
    out.push(0); // version
    out.push(flags);
    out.extend_from_slice(&granule.to_le_bytes());
    out.extend_from_slice(&SERIAL.to_le_bytes());
    out.extend_from_slice(&sequence.to_le_bytes());
    out.extend_from_slice(&0u32.to_le_bytes()); // checksum（後で埋める）
    out.push(lacing.len() as u8);
    out.extend_from_slice(&lacing);
    out.extend_from_slice(packet);

    let crc = ogg_crc(&out[start..]);
    out[start + 22..start + 26].copy_from_slice(&crc.to_le_bytes());
}

/// Ogg のページ CRC（多項式 0x04C11DB7、反転なし）
fn ogg_crc(data: &[u8]) -> u32 {
    let mut crc = 0u32;
    for &byte in data {
        crc ^= (byte as u32) << 24;
        for _ in 0..8 {
            crc = if crc & 0x8000_0000 != 0 {
                (crc << 1) ^ 0x04C1_1DB7
            } else {
                crc << 1
            };
        }
    }
    crc
}
