//! Codec capability matching
//!
//! Decides whether two codec descriptors denote the same stream format and
//! which producer codec a consumer will receive.

use std::collections::BTreeMap;
use voxroom_protocol::{
    MediaKind, RtpCapabilities, RtpCodecCapability, RtpCodecParameters, RtpParameters,
};

/// Audio sample rate used for Opus (48kHz)
pub const OPUS_CLOCK_RATE: u32 = 48000;

/// Opus is always negotiated as stereo
pub const OPUS_CHANNELS: u8 = 2;

pub const VIDEO_CLOCK_RATE: u32 = 90000;

/// First dynamic payload type handed out to router codecs
const DYNAMIC_PAYLOAD_BASE: u8 = 100;

/// Codecs a router offers when none are configured: Opus for voice, VP8 for video
pub fn default_media_codecs() -> Vec<RtpCodecCapability> {
    vec![
        RtpCodecCapability {
            kind: MediaKind::Audio,
            mime_type: "audio/opus".to_string(),
            preferred_payload_type: None,
            clock_rate: OPUS_CLOCK_RATE,
            channels: Some(OPUS_CHANNELS),
            parameters: BTreeMap::from([
                ("minptime".to_string(), "10".to_string()),
                ("useinbandfec".to_string(), "1".to_string()),
            ]),
        },
        RtpCodecCapability {
            kind: MediaKind::Video,
            mime_type: "video/VP8".to_string(),
            preferred_payload_type: None,
            clock_rate: VIDEO_CLOCK_RATE,
            channels: None,
            parameters: BTreeMap::new(),
        },
    ]
}

/// Build the capability descriptor a router advertises, filling in payload types
pub fn router_capabilities(media_codecs: &[RtpCodecCapability]) -> RtpCapabilities {
    let codecs = media_codecs
        .iter()
        .enumerate()
        .map(|(index, codec)| {
            let mut codec = codec.clone();
            if codec.preferred_payload_type.is_none() {
                codec.preferred_payload_type = Some(DYNAMIC_PAYLOAD_BASE.saturating_add(index as u8));
            }
            codec
        })
        .collect();

    RtpCapabilities { codecs }
}

pub fn kind_of_mime(mime_type: &str) -> Option<MediaKind> {
    let (kind, _) = mime_type.split_once('/')?;
    match kind.to_ascii_lowercase().as_str() {
        "audio" => Some(MediaKind::Audio),
        "video" => Some(MediaKind::Video),
        _ => None,
    }
}

fn same_format(
    mime_a: &str,
    clock_a: u32,
    channels_a: Option<u8>,
    mime_b: &str,
    clock_b: u32,
    channels_b: Option<u8>,
) -> bool {
    if !mime_a.eq_ignore_ascii_case(mime_b) || clock_a != clock_b {
        return false;
    }

    // Audio codecs without an explicit channel count are mono
    match kind_of_mime(mime_a) {
        Some(MediaKind::Audio) => channels_a.unwrap_or(1) == channels_b.unwrap_or(1),
        _ => true,
    }
}

pub fn capability_matches(capability: &RtpCodecCapability, codec: &RtpCodecParameters) -> bool {
    same_format(
        &capability.mime_type,
        capability.clock_rate,
        capability.channels,
        &codec.mime_type,
        codec.clock_rate,
        codec.channels,
    )
}

/// First codec of `parameters` the router does not support, if any
pub fn unsupported_codec<'a>(
    router: &RtpCapabilities,
    parameters: &'a RtpParameters,
) -> Option<&'a RtpCodecParameters> {
    parameters
        .codecs
        .iter()
        .find(|codec| !router.codecs.iter().any(|cap| capability_matches(cap, codec)))
}

/// Pick the producer codec the consumer can decode, rewritten to the
/// consumer's preferred payload type.
///
/// Returns `None` when the consumer declared no compatible codec.
pub fn select_consumer_codec(
    producer: &RtpParameters,
    consumer: &RtpCapabilities,
) -> Option<RtpCodecParameters> {
    producer.codecs.iter().find_map(|codec| {
        consumer
            .codecs
            .iter()
            .find(|cap| capability_matches(cap, codec))
            .map(|cap| RtpCodecParameters {
                payload_type: cap.preferred_payload_type.unwrap_or(codec.payload_type),
                ..codec.clone()
            })
    })
}
