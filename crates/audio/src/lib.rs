//! voxlink-audio – Audio-Manager
//!
//! Audio-Ressourcen einer Voice-Session:
//! - Playback-Sinks pro entferntem Audio-Track (ueber ein [`AudioBackend`])
//! - Ausgabe-Lautstaerke und Mikrofon-Mute
//! - Frequenzanalyse fuer Ein- und Ausgabe
//! - Roh-Audio-Capture als Container-Chunks oder PCM (f32/i16)
//! - Headless-Backend mit Opus-Paketstrom

pub mod analyser;
pub mod backend;
pub mod capture;
pub mod codec;
pub mod error;
pub mod headless;
pub mod manager;
pub mod volume;

// Bequeme Re-Exporte der wichtigsten Typen
pub use analyser::FrequencyAnalyser;
pub use backend::{
    AudioBackend, ContainerEncoder, GraphState, PlaybackListener, PlaybackSink, PlaybackStatus,
};
pub use capture::{
    AudioCaptureConfig, CaptureCallback, CaptureChunk, CaptureData, CaptureEinstellungen,
    CaptureFormat, CaptureOptions, CaptureSource,
};
pub use codec::OpusPacketEncoder;
pub use error::{AudioError, AudioResult};
pub use headless::HeadlessBackend;
pub use manager::{AudioFrame, AudioManager, AudioPegel};
pub use volume::OutputVolume;
