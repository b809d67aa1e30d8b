//! Pre-configured test data fixtures for SFU testing.
//!
//! Provides builders and test data for:
//! - Peers with different roles
//! - Client receive capabilities
//! - Producer RTP parameters (Opus, VP8, and a codec no router offers)
//! - DTLS parameters for transport connects

use common::types::MediaKind;
use sfu_controller::actors::PeerIdentity;
use sfu_controller::engine::mock::default_router_capabilities;
use sfu_controller::engine::types::{DtlsFingerprint, DtlsRole, RtpCodecParameters};
use sfu_controller::engine::{DtlsParameters, RtpCapabilities, RtpParameters};
use uuid::Uuid;

/// Test peer fixture.
#[derive(Debug, Clone)]
pub struct TestPeer {
    /// User ID.
    pub user_id: String,
    /// Display name.
    pub display_name: String,
    /// Role in the classroom.
    pub role: String,
}

impl TestPeer {
    /// Create a student named `name`.
    #[must_use]
    pub fn new(name: impl Into<String>) -> Self {
        let name = name.into();
        Self {
            user_id: format!("user-{name}"),
            display_name: name,
            role: "student".to_string(),
        }
    }

    /// Create a test peer with a random name.
    #[must_use]
    pub fn random() -> Self {
        Self::new(format!("peer-{}", Uuid::new_v4()))
    }

    /// Make this peer the teacher.
    #[must_use]
    pub fn teacher(mut self) -> Self {
        self.role = "teacher".to_string();
        self
    }

    /// Identity as handed to `join`.
    #[must_use]
    pub fn identity(&self) -> PeerIdentity {
        PeerIdentity {
            user_id: self.user_id.clone(),
            display_name: self.display_name.clone(),
            role: self.role.clone(),
        }
    }
}

/// Receive capabilities matching what `MockEngine` routers offer.
#[must_use]
pub fn client_capabilities() -> RtpCapabilities {
    default_router_capabilities()
}

/// Receive capabilities without any video codec.
#[must_use]
pub fn audio_only_capabilities() -> RtpCapabilities {
    let mut capabilities = default_router_capabilities();
    capabilities.codecs.retain(|c| c.kind == MediaKind::Audio);
    capabilities
}

/// DTLS parameters a browser would send on connect.
#[must_use]
pub fn client_dtls() -> DtlsParameters {
    DtlsParameters {
        role: Some(DtlsRole::Client),
        fingerprints: vec![DtlsFingerprint {
            algorithm: "sha-256".to_string(),
            value: "3A:7F:1C:9E:22:B4:5D:08".to_string(),
        }],
    }
}

fn codec(mime_type: &str, payload_type: u8, clock_rate: u32, channels: Option<u8>) -> RtpParameters {
    RtpParameters {
        codecs: vec![RtpCodecParameters {
            mime_type: mime_type.to_string(),
            payload_type,
            clock_rate,
            channels,
            parameters: serde_json::Map::new(),
        }],
        ..RtpParameters::default()
    }
}

/// RTP parameters of an Opus microphone track.
#[must_use]
pub fn opus_parameters() -> RtpParameters {
    codec("audio/opus", 100, 48_000, Some(2))
}

/// RTP parameters of a VP8 camera track.
#[must_use]
pub fn vp8_parameters() -> RtpParameters {
    codec("video/VP8", 101, 90_000, None)
}

/// RTP parameters for `kind`.
#[must_use]
pub fn parameters_for(kind: MediaKind) -> RtpParameters {
    match kind {
        MediaKind::Audio => opus_parameters(),
        MediaKind::Video => vp8_parameters(),
    }
}
