use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::device::coords::{NormPoint, NormRect};

/// Party quest flavours. All share one state machine; they differ only in the
/// data of their [`VariantDescriptor`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Variant {
    Sleepywood,
    Ludibrium,
    Orbis,
}

impl Default for Variant {
    fn default() -> Self {
        Variant::Sleepywood
    }
}

/// Everything the controller needs to know about one variant.
#[derive(Debug)]
pub struct VariantDescriptor {
    pub variant: Variant,
    /// Quest selection card shown on the party quest screen.
    pub indicator: &'static str,
    /// Where the selection card may legitimately appear.
    pub indicator_region: NormRect,
    /// Shown while waiting for a party.
    pub queue_indicator: &'static str,
    /// Stage banners in stage order; index 0 is the first stage.
    pub stages: &'static [&'static str],
    /// Known position of the selection card, used when it can't be found.
    pub fallback: NormPoint,
}

impl VariantDescriptor {
    pub fn final_stage(&self) -> usize {
        self.stages.len().saturating_sub(1)
    }
}

const THIRD: f32 = 1.0 / 3.0;

// Card positions measured on a 960x540 screen: x = 300, 480, 660 at y = 350.
static DESCRIPTORS: [VariantDescriptor; 3] = [
    VariantDescriptor {
        variant: Variant::Sleepywood,
        indicator: "sleepywood",
        indicator_region: (0.0, 0.0, THIRD, 1.0),
        queue_indicator: "in_queue",
        stages: &["sleepywood_wave_1", "sleepywood_wave_2", "sleepywood_wave_3"],
        fallback: (300.0 / 960.0, 350.0 / 540.0),
    },
    VariantDescriptor {
        variant: Variant::Ludibrium,
        indicator: "ludibrium",
        indicator_region: (THIRD, 0.0, THIRD, 1.0),
        queue_indicator: "in_queue_ludi",
        stages: &["ludibrium_wave_11", "ludibrium_wave_22", "ludibrium_wave_33"],
        fallback: (480.0 / 960.0, 350.0 / 540.0),
    },
    VariantDescriptor {
        variant: Variant::Orbis,
        indicator: "orbis",
        indicator_region: (2.0 * THIRD, 0.0, THIRD, 1.0),
        queue_indicator: "in_queue",
        stages: &["orbis_wave_1", "orbis_wave_2", "orbis_wave_3"],
        fallback: (660.0 / 960.0, 350.0 / 540.0),
    },
];

impl Variant {
    pub const ALL: [Variant; 3] = [Variant::Sleepywood, Variant::Ludibrium, Variant::Orbis];

    pub fn descriptor(self) -> &'static VariantDescriptor {
        match self {
            Variant::Sleepywood => &DESCRIPTORS[0],
            Variant::Ludibrium => &DESCRIPTORS[1],
            Variant::Orbis => &DESCRIPTORS[2],
        }
    }

    pub fn name(self) -> &'static str {
        match self {
            Variant::Sleepywood => "sleepywood",
            Variant::Ludibrium => "ludibrium",
            Variant::Orbis => "orbis",
        }
    }
}

impl fmt::Display for Variant {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for Variant {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Variant::ALL
            .into_iter()
            .find(|v| v.name().eq_ignore_ascii_case(s.trim()))
            .ok_or_else(|| format!("unknown quest '{}', expected sleepywood, ludibrium or orbis", s))
    }
}
