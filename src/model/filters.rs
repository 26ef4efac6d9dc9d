//! Audio filters applied node-side.
//!
//! Each filter keeps only the fields you set; unset fields are left out of the payload and the
//! node falls back to its own defaults. [`Filters::merge`] updates only what the other value
//! sets, [`Filters::reset`] clears everything.

use serde::{Deserialize, Serialize};

pub const EQUALIZER_BANDS: usize = 15;
pub const MIN_GAIN: f64 = -0.25;
pub const MAX_GAIN: f64 = 1.0;

macro_rules! filter {
    ($(#[$meta:meta])* $name:ident { $($field:ident),+ $(,)? }) => {
        $(#[$meta])*
        #[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
        #[serde(rename_all = "camelCase")]
        pub struct $name {
            $(
                #[serde(default, skip_serializing_if = "Option::is_none")]
                pub $field: Option<f64>,
            )+
        }

        impl $name {
            pub fn is_empty(&self) -> bool {
                true $(&& self.$field.is_none())+
            }

            /// Overwrites the fields `other` sets, keeps the rest.
            pub fn merge(&mut self, other: &Self) {
                $(
                    if other.$field.is_some() {
                        self.$field = other.$field;
                    }
                )+
            }

            pub fn reset(&mut self) {
                *self = Self::default();
            }
        }
    };
}

filter!(
    /// Uses equalization to eliminate part of a band, usually targeting vocals.
    Karaoke { level, mono_level, filter_band, filter_width }
);
filter!(
    /// Speed, pitch and rate.
    Timescale { speed, pitch, rate }
);
filter!(
    /// Quickly oscillates the volume.
    Tremolo { frequency, depth }
);
filter!(
    /// Quickly oscillates the pitch.
    Vibrato { frequency, depth }
);
filter!(Rotation { rotation_hz });
filter!(Distortion {
    sin_offset,
    sin_scale,
    cos_offset,
    cos_scale,
    tan_offset,
    tan_scale,
    offset,
    scale,
});
filter!(
    /// How much each stereo channel bleeds into the other. All `0.5` yields mono.
    ChannelMix { left_to_left, left_to_right, right_to_left, right_to_right }
);
filter!(
    /// Smoothing of `1.0` or less disables the filter.
    LowPass { smoothing }
);

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct EqualizerBand {
    pub band: u8,
    pub gain: f64,
}

/// Fifteen bands, `0..=14`, each gain clamped to `[-0.25, 1.0]`.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
#[serde(from = "Vec<EqualizerBand>", into = "Vec<EqualizerBand>")]
pub struct Equalizer {
    gains: [f64; EQUALIZER_BANDS],
}

impl Equalizer {
    /// Builds an equalizer from `bands`. Bands outside `0..=14` are ignored and bands not
    /// mentioned stay flat.
    pub fn new(bands: &[EqualizerBand]) -> Self {
        let mut equalizer = Self::default();
        for band in bands {
            equalizer.set_band(band.band, band.gain);
        }
        equalizer
    }

    /// Returns `false` (and changes nothing) for bands outside `0..=14`.
    pub fn set_band(&mut self, band: u8, gain: f64) -> bool {
        match self.gains.get_mut(band as usize) {
            Some(slot) => {
                *slot = gain.clamp(MIN_GAIN, MAX_GAIN);
                true
            }
            None => false,
        }
    }

    pub fn gain(&self, band: u8) -> Option<f64> {
        self.gains.get(band as usize).copied()
    }

    pub fn bands(&self) -> Vec<EqualizerBand> {
        self.gains
            .iter()
            .enumerate()
            .map(|(band, &gain)| EqualizerBand { band: band as u8, gain })
            .collect()
    }

    pub fn is_flat(&self) -> bool {
        self.gains.iter().all(|&gain| gain == 0.0)
    }

    pub fn reset(&mut self) {
        *self = Self::default();
    }
}

impl From<Vec<EqualizerBand>> for Equalizer {
    fn from(bands: Vec<EqualizerBand>) -> Self {
        Self::new(&bands)
    }
}

impl From<Equalizer> for Vec<EqualizerBand> {
    fn from(equalizer: Equalizer) -> Self {
        equalizer.bands()
    }
}

/// The full filter chain of a player.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Filters {
    /// `0.0..=5.0`, where `1.0` is 100%. Above `1.0` may clip.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub volume: Option<f64>,
    #[serde(default, skip_serializing_if = "Equalizer::is_flat")]
    pub equalizer: Equalizer,
    #[serde(default, skip_serializing_if = "Karaoke::is_empty")]
    pub karaoke: Karaoke,
    #[serde(default, skip_serializing_if = "Timescale::is_empty")]
    pub timescale: Timescale,
    #[serde(default, skip_serializing_if = "Tremolo::is_empty")]
    pub tremolo: Tremolo,
    #[serde(default, skip_serializing_if = "Vibrato::is_empty")]
    pub vibrato: Vibrato,
    #[serde(default, skip_serializing_if = "Rotation::is_empty")]
    pub rotation: Rotation,
    #[serde(default, skip_serializing_if = "Distortion::is_empty")]
    pub distortion: Distortion,
    #[serde(default, skip_serializing_if = "ChannelMix::is_empty")]
    pub channel_mix: ChannelMix,
    #[serde(default, skip_serializing_if = "LowPass::is_empty")]
    pub low_pass: LowPass,
}

impl Filters {
    pub fn is_empty(&self) -> bool {
        self == &Self::default()
    }

    /// Applies whatever `other` sets on top of `self`. A non-flat equalizer in `other`
    /// replaces the whole equalizer.
    pub fn merge(&mut self, other: &Filters) {
        if other.volume.is_some() {
            self.volume = other.volume;
        }
        if !other.equalizer.is_flat() {
            self.equalizer = other.equalizer;
        }
        self.karaoke.merge(&other.karaoke);
        self.timescale.merge(&other.timescale);
        self.tremolo.merge(&other.tremolo);
        self.vibrato.merge(&other.vibrato);
        self.rotation.merge(&other.rotation);
        self.distortion.merge(&other.distortion);
        self.channel_mix.merge(&other.channel_mix);
        self.low_pass.merge(&other.low_pass);
    }

    pub fn reset(&mut self) {
        *self = Self::default();
    }
}
