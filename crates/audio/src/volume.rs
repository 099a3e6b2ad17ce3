//! Ausgabe-Lautstaerke
//!
//! Ein einziger Wert fuer alle Playback-Sinks einer Session. Gilt fuer
//! bestehende und kuenftige Sinks gleichermassen.

/// Begrenzte Ausgabe-Lautstaerke (0.0..=1.0, 1.0 = normal)
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct OutputVolume(f32);

impl OutputVolume {
    /// Erstellt eine Lautstaerke, NaN wird zu 0.0
    pub fn neu(volume: f32) -> Self {
        Self(begrenzen(volume))
    }

    pub fn wert(&self) -> f32 {
        self.0
    }

    /// Gibt true zurueck wenn die Ausgabe stumm ist
    pub fn ist_stumm(&self) -> bool {
        self.0 == 0.0
    }
}

impl Default for OutputVolume {
    fn default() -> Self {
        Self(1.0)
    }
}

impl From<f32> for OutputVolume {
    fn from(v: f32) -> Self {
        Self::neu(v)
    }
}

fn begrenzen(volume: f32) -> f32 {
    if volume.is_nan() {
        0.0
    } else {
        volume.clamp(0.0, 1.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn volume_default_eins() {
        assert!((OutputVolume::default().wert() - 1.0).abs() < f32::EPSILON);
    }

    #[test]
    fn volume_clamp_max() {
        assert_eq!(OutputVolume::neu(1.7).wert(), 1.0);
        assert_eq!(OutputVolume::neu(f32::INFINITY).wert(), 1.0);
    }

    #[test]
    fn volume_clamp_min() {
        assert_eq!(OutputVolume::neu(-0.3).wert(), 0.0);
        assert!(OutputVolume::neu(-5.0).ist_stumm());
    }

    #[test]
    fn volume_nan_wird_null() {
        assert_eq!(OutputVolume::neu(f32::NAN).wert(), 0.0);
    }

    #[test]
    fn volume_zwischenwert_unveraendert() {
        assert!((OutputVolume::from(0.42).wert() - 0.42).abs() < f32::EPSILON);
    }
}
