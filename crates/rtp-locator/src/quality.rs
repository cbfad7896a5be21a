use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Bits that can be ignored unless configured otherwise.
pub const DEFAULT_IGNORABLE_BITS: [u32; 6] = [0, 1, 2, 3, 4, 8];

/// Defect description for each bit of the archive quality keyword. Empty means unassigned.
pub const QUALITY_BIT_DESCRIPTIONS: [&str; 32] = [
    "FLAT_REC == MISSING (flatfield data not available)",
    "ORB_REC == MISSING (orbit data not available)",
    "ASD_REC == MISSING (ancillary science data not available)",
    "MPO_REC == MISSING (master pointing data not available)",
    "RSUN_LF/X0_LF/Y0_LF == MISSING (limb fit not acceptable)",
    "",
    "",
    "",
    "MISSVALS > 0",
    "MISSVALS > 0.01*TOTVALS",
    "MISSVALS > 0.05*TOTVALS",
    "MISSVALS > 0.25*TOTVALS",
    "ACS_MODE != SCIENCE (spacecraft not in science pointing mode)",
    "ACS_ECLP == YES (spacecraft eclipse flag set)",
    "ACS_SUNP == NO (spacecraft sun presence flag not set)",
    "ACS_SAFE == YES (spacecraft safemode flag set)",
    "IMG_TYPE == DARK (dark image)",
    "ISS loop open",
    "calibration image",
    "HCFTID == 17 (CAL mode image)",
    "focus out of range",
    "AIAGP6 != 0 (register flag)",
    "",
    "",
    "",
    "",
    "",
    "",
    "",
    "",
    "quicklook image",
    "image not available",
];

#[derive(Debug, Error, PartialEq, Eq)]
#[error("quality bit {0} is out of range (0..32)")]
pub struct InvalidBit(pub u32);

/// 32-bit quality flag word read from a candidate file.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct QualityMask(pub u32);

impl QualityMask {
    /// Residual flags once the ignorable bits are cleared.
    pub fn residual(self, ignorable: IgnorableBits) -> QualityMask {
        QualityMask(self.0 & !ignorable.mask())
    }

    pub fn is_clean(self, ignorable: IgnorableBits) -> bool {
        self.residual(ignorable).0 == 0
    }

    pub fn defects(self) -> Vec<&'static str> {
        (0..32u32)
            .filter(|bit| self.0 & (1 << bit) != 0)
            .map(|bit| match QUALITY_BIT_DESCRIPTIONS[bit as usize] {
                "" => "unknown defect",
                d => d,
            })
            .collect()
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct IgnorableBits(u32);

impl IgnorableBits {
    pub fn new(bits: &[u32]) -> Result<Self, InvalidBit> {
        let mut mask = 0u32;
        for &bit in bits {
            if bit >= 32 {
                return Err(InvalidBit(bit));
            }
            mask |= 1 << bit;
        }
        Ok(Self(mask))
    }

    pub fn none() -> Self {
        Self(0)
    }

    pub fn mask(self) -> u32 {
        self.0
    }
}

impl Default for IgnorableBits {
    fn default() -> Self {
        let mask = DEFAULT_IGNORABLE_BITS.iter().fold(0u32, |m, bit| m | (1 << bit));
        Self(mask)
    }
}
