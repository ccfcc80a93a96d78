mod common;

use pronunciation_relay::{
    assessment::*,
    audio::AudioNormalizer,
    client::AssessmentClient,
    config::{AssessmentTransport, AudioConfig, Config},
    error::RelayError,
};
use serde_json::Value;

use common::{read_wav_spec, sine_wav, test_config, TEST_KEY};

fn normalized_sample() -> pronunciation_relay::audio::NormalizedAudio {
    let input = sine_wav(44_100, 2, 2.0);
    AudioNormalizer::new(&AudioConfig::default())
        .normalize(&input, Some("wav"))
        .unwrap()
}

fn client_for(config: &Config) -> AssessmentClient {
    AssessmentClient::new(config).unwrap()
}

/// 44.1kHz ステレオ2秒の録音から組み立てた送信リクエストの形
#[test]
fn test_end_to_end_request_shape() {
    let config = test_config(None);
    let request = client_for(&config)
        .prepare(normalized_sample(), "Hello, how are you?")
        .unwrap();

    assert_eq!(request.method(), reqwest::Method::POST);
    assert_eq!(
        request.url().as_str(),
        "https://eastus.stt.speech.microsoft.com/speech/recognition/conversation/cognitiveservices/v1?language=en-US"
    );

    let headers = request.headers();
    assert_eq!(
        headers.get("content-type").unwrap(),
        "audio/wav; codecs=audio/pcm; samplerate=16000"
    );
    assert_eq!(headers.get("Ocp-Apim-Subscription-Key").unwrap(), TEST_KEY);

    let assessment: Value =
        serde_json::from_slice(headers.get("Pronunciation-Assessment").unwrap().as_bytes()).unwrap();
    assert_eq!(assessment["ReferenceText"], "Hello, how are you?");
    assert_eq!(assessment["GradingSystem"], "HundredMark");
    assert_eq!(assessment["Granularity"], "Phoneme");
    assert_eq!(assessment["Dimension"], "Comprehensive");
    assert_eq!(assessment["EnableMiscue"], false);
    assert!(assessment.get("PhonemeAlphabet").is_none());

    let body = request.body().and_then(|b| b.as_bytes()).unwrap();
    assert!(body.len() > 44);
    assert_eq!(&body[0..4], b"RIFF");
    let (spec, frames) = read_wav_spec(body);
    assert_eq!(spec.channels, 1);
    assert_eq!(spec.sample_rate, 16_000);
    assert_eq!(spec.bits_per_sample, 16);
    assert!(frames > 0);
}

#[test]
fn test_assessment_header_is_single_line_json() {
    let config = test_config(None);
    let request = client_for(&config)
        .prepare(normalized_sample(), "line one\nline two")
        .unwrap();

    let raw = request.headers().get(ASSESSMENT_HEADER).unwrap().as_bytes();
    assert!(!raw.contains(&b'\n'));
    let assessment: Value = serde_json::from_slice(raw).unwrap();
    assert_eq!(assessment["ReferenceText"], "line one\nline two");
}

#[test]
fn test_non_ascii_reference_text_in_header() {
    let config = test_config(None);
    let request = client_for(&config)
        .prepare(normalized_sample(), "Ça va très bien")
        .unwrap();

    let raw = request.headers().get(ASSESSMENT_HEADER).unwrap().as_bytes();
    let assessment: Value = serde_json::from_slice(raw).unwrap();
    assert_eq!(assessment["ReferenceText"], "Ça va très bien");
}

#[test]
fn test_query_transport_moves_config_to_url() {
    let mut config = test_config(None);
    config.provider.transport = AssessmentTransport::Query;
    config.provider.detailed_response = true;

    let request = client_for(&config)
        .prepare(normalized_sample(), "Hello, how are you?")
        .unwrap();

    assert!(request.headers().get(ASSESSMENT_HEADER).is_none());

    let pairs: Vec<(String, String)> = request
        .url()
        .query_pairs()
        .map(|(k, v)| (k.into_owned(), v.into_owned()))
        .collect();
    assert!(pairs.contains(&("language".to_string(), "en-US".to_string())));
    assert!(pairs.contains(&("format".to_string(), "detailed".to_string())));

    let (_, encoded) = pairs
        .iter()
        .find(|(k, _)| k == ASSESSMENT_QUERY_PARAM)
        .expect("assessment query parameter missing");
    let assessment: Value = serde_json::from_str(encoded).unwrap();
    assert_eq!(assessment["ReferenceText"], "Hello, how are you?");
}

#[test]
fn test_region_and_language_shape_endpoint() {
    let mut config = test_config(None);
    config.provider.region = "westeurope".to_string();
    config.provider.language = "en-GB".to_string();

    let request = client_for(&config)
        .prepare(normalized_sample(), "Good morning")
        .unwrap();

    assert_eq!(request.url().host_str(), Some("westeurope.stt.speech.microsoft.com"));
    assert_eq!(request.url().query(), Some("language=en-GB"));
}

#[test]
fn test_scoring_options_are_forwarded() {
    let mut config = test_config(None);
    config.assessment.enable_miscue = true;
    config.assessment.phoneme_alphabet = Some("IPA".to_string());

    let request = client_for(&config)
        .prepare(normalized_sample(), "Hello")
        .unwrap();

    let assessment: Value =
        serde_json::from_slice(request.headers().get(ASSESSMENT_HEADER).unwrap().as_bytes()).unwrap();
    assert_eq!(assessment["EnableMiscue"], true);
    assert_eq!(assessment["PhonemeAlphabet"], "IPA");
}

#[test]
fn test_missing_reference_text_fails_before_request() {
    let config = test_config(None);
    let result = client_for(&config).prepare(normalized_sample(), "  ");
    assert!(matches!(result, Err(RelayError::MissingReferenceText)));
}

#[test]
fn test_subscription_key_header_is_sensitive() {
    let config = test_config(None);
    let request = client_for(&config)
        .prepare(normalized_sample(), "Hello")
        .unwrap();

    let key = request.headers().get(SUBSCRIPTION_KEY_HEADER).unwrap();
    assert!(key.is_sensitive());
    assert!(!request.url().as_str().contains(TEST_KEY));
}
