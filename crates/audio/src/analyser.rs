//! Frequenzanalyse (Byte-Spektrum)
//!
//! Liefert pro Aufruf `FFT_GROESSE / 2` Bins im Bereich 0..=255, so wie ein
//! Web-Audio-Analyser: Blackman-Fenster, Betrag normiert auf die FFT-Groesse,
//! exponentielle Glaettung ueber die Aufrufe und lineare Abbildung von
//! `MIN_DB..MAX_DB` auf Bytes.

use std::collections::VecDeque;
use std::sync::Arc;

use rustfft::{num_complex::Complex, Fft, FftPlanner};

/// FFT-Laenge in Samples
pub const FFT_GROESSE: usize = 256;
/// Glaettungskonstante zwischen zwei Abfragen
pub const GLAETTUNG: f32 = 0.8;
pub const MIN_DB: f32 = -100.0;
pub const MAX_DB: f32 = -30.0;

/// Analyser fuer ein Audiosignal
pub struct FrequencyAnalyser {
    fft: Arc<dyn Fft<f32>>,
    fenster: Vec<f32>,
    /// Die letzten `FFT_GROESSE` Samples
    zeitbereich: VecDeque<f32>,
    /// Geglaettete Betraege pro Bin
    geglaettet: Vec<f32>,
}

impl FrequencyAnalyser {
    pub fn neu() -> Self {
        let mut planner = FftPlanner::new();
        let fft = planner.plan_fft_forward(FFT_GROESSE);

        Self {
            fft,
            fenster: blackman(FFT_GROESSE),
            zeitbereich: VecDeque::with_capacity(FFT_GROESSE),
            geglaettet: vec![0.0; FFT_GROESSE / 2],
        }
    }

    /// Nimmt neue Samples auf (aeltere werden verdraengt)
    pub fn einspeisen(&mut self, samples: &[f32]) {
        let ueberspringen = samples.len().saturating_sub(FFT_GROESSE);
        for &s in &samples[ueberspringen..] {
            if self.zeitbereich.len() == FFT_GROESSE {
                self.zeitbereich.pop_front();
            }
            self.zeitbereich.push_back(if s.is_finite() { s } else { 0.0 });
        }
    }

    /// Berechnet das aktuelle Byte-Spektrum
    pub fn byte_frequency_data(&mut self) -> Vec<u8> {
        // Fehlende Samples vorne mit Stille auffuellen
        let fehlend = FFT_GROESSE - self.zeitbereich.len();
        let mut puffer: Vec<Complex<f32>> = std::iter::repeat(0.0)
            .take(fehlend)
            .chain(self.zeitbereich.iter().copied())
            .zip(&self.fenster)
            .map(|(s, w)| Complex::new(s * w, 0.0))
            .collect();

        self.fft.process(&mut puffer);

        let norm = 1.0 / FFT_GROESSE as f32;
        let skala = 255.0 / (MAX_DB - MIN_DB);

        self.geglaettet
            .iter_mut()
            .zip(&puffer)
            .map(|(alt, bin)| {
                let betrag = bin.norm() * norm;
                *alt = GLAETTUNG * *alt + (1.0 - GLAETTUNG) * betrag;
                let db = 20.0 * alt.max(f32::MIN_POSITIVE).log10();
                (skala * (db - MIN_DB)).floor().clamp(0.0, 255.0) as u8
            })
            .collect()
    }

    /// Verwirft Signal und Glaettungszustand
    pub fn zuruecksetzen(&mut self) {
        self.zeitbereich.clear();
        self.geglaettet.iter_mut().for_each(|v| *v = 0.0);
    }
}

impl Default for FrequencyAnalyser {
    fn default() -> Self {
        Self::neu()
    }
}

/// Blackman-Fenster (alpha = 0.16)
fn blackman(n: usize) -> Vec<f32> {
    let alpha = 0.16f32;
    let a0 = 0.5 * (1.0 - alpha);
    let a1 = 0.5;
    let a2 = 0.5 * alpha;
    (0..n)
        .map(|i| {
            let x = std::f32::consts::TAU * i as f32 / n as f32;
            a0 - a1 * x.cos() + a2 * (2.0 * x).cos()
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sinus_auf_bin(bin: usize, amplitude: f32) -> Vec<f32> {
        (0..FFT_GROESSE)
            .map(|i| {
                amplitude
                    * (std::f32::consts::TAU * bin as f32 * i as f32 / FFT_GROESSE as f32).sin()
            })
            .collect()
    }

    #[test]
    fn stille_ergibt_nullen() {
        let mut a = FrequencyAnalyser::neu();
        a.einspeisen(&[0.0; 512]);
        let daten = a.byte_frequency_data();
        assert_eq!(daten.len(), FFT_GROESSE / 2);
        assert!(daten.iter().all(|&b| b == 0));
    }

    #[test]
    fn ohne_signal_leeres_spektrum_auf_null() {
        let mut a = FrequencyAnalyser::neu();
        assert!(a.byte_frequency_data().iter().all(|&b| b == 0));
    }

    #[test]
    fn sinus_spitze_im_richtigen_bin() {
        let mut a = FrequencyAnalyser::neu();
        a.einspeisen(&sinus_auf_bin(8, 0.5));
        let daten = a.byte_frequency_data();

        let (max_bin, _) = daten
            .iter()
            .enumerate()
            .max_by_key(|(_, &b)| b)
            .unwrap();
        assert_eq!(max_bin, 8);
        assert!(daten[8] > 200, "Spitze zu schwach: {}", daten[8]);
        assert!(daten[60] < 50, "Leckage zu stark: {}", daten[60]);
    }

    #[test]
    fn glaettung_steigt_ueber_mehrere_abfragen() {
        let mut a = FrequencyAnalyser::neu();
        a.einspeisen(&sinus_auf_bin(20, 0.01));
        let erste = a.byte_frequency_data()[20];
        let zweite = a.byte_frequency_data()[20];
        assert!(zweite > erste);
    }

    #[test]
    fn zuruecksetzen_loescht_zustand() {
        let mut a = FrequencyAnalyser::neu();
        a.einspeisen(&sinus_auf_bin(8, 0.5));
        a.byte_frequency_data();
        a.zuruecksetzen();
        assert!(a.byte_frequency_data().iter().all(|&b| b == 0));
    }

    #[test]
    fn blackman_raender_nahe_null() {
        let w = blackman(FFT_GROESSE);
        assert!(w[0].abs() < 1e-6);
        assert!((w[FFT_GROESSE / 2] - 1.0).abs() < 1e-4);
    }
}
