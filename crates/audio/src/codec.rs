//! Opus-Paketstrom-Encoder
//!
//! Kapselt audiopus fuer den headless Capture-Pfad. Ausgabe ist ein
//! einfacher Paketstrom: pro Opus-Paket ein 2-Byte Big-Endian
//! Laengenpraefix gefolgt vom Paket. Ein Chunk enthaelt so viele Pakete,
//! wie in die konfigurierte Chunk-Dauer passen.

use audiopus::{coder::Encoder, Application, Bitrate, Channels, SampleRate};
use bytes::{BufMut, Bytes, BytesMut};
use tracing::debug;

use crate::backend::ContainerEncoder;
use crate::error::{AudioError, AudioResult};

/// MIME-Typ des Paketstroms
pub const OPUS_MIME: &str = "audio/opus";

/// Opus-Frame-Dauer in ms
const FRAME_MS: u32 = 20;
/// Sprach-Bitrate in bit/s
const BITRATE: i32 = 32_000;
/// Maximale Paketgroesse eines Opus-Frames
const MAX_PAKET: usize = 4000;

/// Opus-Encoder mit Chunk-Bildung
pub struct OpusPacketEncoder {
    encoder: Encoder,
    frame_size: usize,
    pakete_pro_chunk: usize,
    /// Noch nicht kodierte Samples
    pcm: Vec<f32>,
    /// Kodierte, noch nicht ausgegebene Pakete
    chunk: BytesMut,
    pakete_im_chunk: usize,
}

impl OpusPacketEncoder {
    /// Erstellt einen Mono-VoIP-Encoder
    pub fn new(sample_rate: u32, chunk_size_ms: u32) -> AudioResult<Self> {
        let rate = abtastrate(sample_rate)?;
        let mut encoder = Encoder::new(rate, Channels::Mono, Application::Voip)
            .map_err(|e| AudioError::CodecFehler(e.to_string()))?;

        encoder
            .set_bitrate(Bitrate::BitsPerSecond(BITRATE))
            .map_err(|e| AudioError::CodecFehler(e.to_string()))?;

        let frame_size = (sample_rate * FRAME_MS / 1000) as usize;
        let pakete_pro_chunk = (chunk_size_ms / FRAME_MS).max(1) as usize;

        debug!(
            sample_rate,
            frame_size, pakete_pro_chunk, "OpusPacketEncoder erstellt"
        );

        Ok(Self {
            encoder,
            frame_size,
            pakete_pro_chunk,
            pcm: Vec::with_capacity(frame_size),
            chunk: BytesMut::new(),
            pakete_im_chunk: 0,
        })
    }

    /// Erwartete Frame-Groesse in Samples
    pub fn frame_size(&self) -> usize {
        self.frame_size
    }

    fn frame_kodieren(&mut self, frame: &[f32]) -> AudioResult<()> {
        let mut paket = [0u8; MAX_PAKET];
        let laenge = self
            .encoder
            .encode_float(frame, &mut paket)
            .map_err(|e| AudioError::CodecFehler(e.to_string()))?;

        self.chunk.put_u16(laenge as u16);
        self.chunk.put_slice(&paket[..laenge]);
        self.pakete_im_chunk += 1;
        Ok(())
    }

    fn chunk_entnehmen(&mut self) -> Bytes {
        self.pakete_im_chunk = 0;
        self.chunk.split().freeze()
    }
}

impl ContainerEncoder for OpusPacketEncoder {
    fn mime_type(&self) -> &str {
        OPUS_MIME
    }

    fn push(&mut self, samples: &[f32]) -> AudioResult<Option<Bytes>> {
        self.pcm.extend_from_slice(samples);

        let mut fertig: Option<BytesMut> = None;
        while self.pcm.len() >= self.frame_size {
            let frame: Vec<f32> = self.pcm.drain(..self.frame_size).collect();
            self.frame_kodieren(&frame)?;

            if self.pakete_im_chunk == self.pakete_pro_chunk {
                let chunk = self.chunk_entnehmen();
                fertig.get_or_insert_with(BytesMut::new).put(chunk);
            }
        }
        Ok(fertig.map(BytesMut::freeze))
    }

    fn stop(&mut self) -> AudioResult<Option<Bytes>> {
        // Letzten angefangenen Frame mit Stille auffuellen
        if !self.pcm.is_empty() {
            let mut frame = std::mem::take(&mut self.pcm);
            frame.resize(self.frame_size, 0.0);
            self.frame_kodieren(&frame)?;
        }
        if self.pakete_im_chunk == 0 {
            return Ok(None);
        }
        Ok(Some(self.chunk_entnehmen()))
    }
}

/// Zerlegt einen Paketstrom wieder in einzelne Opus-Pakete
pub fn pakete_zerlegen(mut daten: &[u8]) -> AudioResult<Vec<&[u8]>> {
    let mut pakete = Vec::new();
    while !daten.is_empty() {
        if daten.len() < 2 {
            return Err(AudioError::CodecFehler("abgeschnittenes Laengenpraefix".into()));
        }
        let laenge = u16::from_be_bytes([daten[0], daten[1]]) as usize;
        let rest = &daten[2..];
        if rest.len() < laenge {
            return Err(AudioError::CodecFehler(format!(
                "Paket abgeschnitten: {} von {} Bytes",
                rest.len(),
                laenge
            )));
        }
        pakete.push(&rest[..laenge]);
        daten = &rest[laenge..];
    }
    Ok(pakete)
}

fn abtastrate(rate: u32) -> AudioResult<SampleRate> {
    match rate {
        8_000 => Ok(SampleRate::Hz8000),
        12_000 => Ok(SampleRate::Hz12000),
        16_000 => Ok(SampleRate::Hz16000),
        24_000 => Ok(SampleRate::Hz24000),
        48_000 => Ok(SampleRate::Hz48000),
        andere => Err(AudioError::CodecFehler(format!(
            "Opus unterstuetzt {} Hz nicht",
            andere
        ))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use audiopus::coder::Decoder;

    fn sinus(n: usize, rate: u32) -> Vec<f32> {
        (0..n)
            .map(|i| (std::f32::consts::TAU * 440.0 * i as f32 / rate as f32).sin() * 0.3)
            .collect()
    }

    #[test]
    fn encoder_frame_size_48k() {
        let enc = OpusPacketEncoder::new(48_000, 100).unwrap();
        assert_eq!(enc.frame_size(), 960);
    }

    #[test]
    fn encoder_ungueltige_abtastrate() {
        assert!(OpusPacketEncoder::new(44_100, 100).is_err());
    }

    #[test]
    fn chunk_nach_konfigurierter_dauer() {
        let mut enc = OpusPacketEncoder::new(16_000, 100).unwrap();
        // 80 ms: noch kein Chunk
        assert!(enc.push(&sinus(1280, 16_000)).unwrap().is_none());
        // weitere 20 ms: 5 Pakete = 100 ms
        let chunk = enc.push(&sinus(320, 16_000)).unwrap().unwrap();
        let pakete = pakete_zerlegen(&chunk).unwrap();
        assert_eq!(pakete.len(), 5);
    }

    #[test]
    fn pakete_dekodierbar() {
        let mut enc = OpusPacketEncoder::new(48_000, 20).unwrap();
        let chunk = enc.push(&sinus(960, 48_000)).unwrap().unwrap();
        let pakete = pakete_zerlegen(&chunk).unwrap();

        let mut dec = Decoder::new(SampleRate::Hz48000, Channels::Mono).unwrap();
        let mut out = vec![0.0f32; 960];
        let n = dec.decode_float(Some(pakete[0]), &mut out, false).unwrap();
        assert_eq!(n, 960);
    }

    #[test]
    fn stop_liefert_rest() {
        let mut enc = OpusPacketEncoder::new(16_000, 100).unwrap();
        enc.push(&sinus(400, 16_000)).unwrap();
        let rest = enc.stop().unwrap().unwrap();
        // 400 Samples = 1 voller + 1 aufgefuellter Frame
        assert_eq!(pakete_zerlegen(&rest).unwrap().len(), 2);
        assert!(enc.stop().unwrap().is_none());
    }

    #[test]
    fn zerlegen_erkennt_abgeschnittene_daten() {
        assert!(pakete_zerlegen(&[0, 5, 1, 2]).is_err());
        assert!(pakete_zerlegen(&[7]).is_err());
        assert!(pakete_zerlegen(&[]).unwrap().is_empty());
    }
}
