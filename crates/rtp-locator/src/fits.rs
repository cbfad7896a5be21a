use std::fs::File;
use std::io::{BufReader, Read, Seek, SeekFrom};
use std::path::Path;

use thiserror::Error;

use crate::QualityMask;

pub const BLOCK_LEN: usize = 2880;
pub const CARD_LEN: usize = 80;

#[derive(Debug, Error)]
pub enum HeaderError {
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("not a FITS file (no SIMPLE card)")]
    NotFits,
    #[error("HDU {0} not present")]
    MissingHdu(usize),
    #[error("keyword {0} not found")]
    MissingKeyword(String),
    #[error("keyword {keyword} has non-integer value {value:?}")]
    BadValue { keyword: String, value: String },
    #[error("HDU {0} declares a data unit too large to skip")]
    DataTooLarge(usize),
}

/// Reads the quality word of a candidate file.
pub trait QualityReader: Send + Sync {
    fn quality(&self, path: &Path) -> Result<QualityMask, HeaderError>;
}

/// Reads an integer header keyword from one HDU of a FITS file.
#[derive(Clone, Debug)]
pub struct FitsHeaderReader {
    pub hdu_index: usize,
    pub keyword: String,
}

impl FitsHeaderReader {
    pub fn new(hdu_index: usize, keyword: impl Into<String>) -> Self {
        Self { hdu_index, keyword: keyword.into() }
    }
}

impl QualityReader for FitsHeaderReader {
    fn quality(&self, path: &Path) -> Result<QualityMask, HeaderError> {
        let mut reader = BufReader::new(File::open(path)?);
        let mut hdu = 0;
        loop {
            let header = read_header(&mut reader).map_err(|e| match e {
                HeaderError::Io(io) if io.kind() == std::io::ErrorKind::UnexpectedEof && hdu > 0 => {
                    HeaderError::MissingHdu(self.hdu_index)
                }
                other => other,
            })?;
            if hdu == 0 && header.first().map(|(k, _)| k.as_str()) != Some("SIMPLE") {
                return Err(HeaderError::NotFits);
            }
            if hdu == self.hdu_index {
                let value = header
                    .iter()
                    .find(|(k, _)| *k == self.keyword)
                    .map(|(_, v)| v.clone())
                    .ok_or_else(|| HeaderError::MissingKeyword(self.keyword.clone()))?;
                let bad = || HeaderError::BadValue { keyword: self.keyword.clone(), value: value.clone() };
                let parsed: i64 = value.parse().map_err(|_| bad())?;
                // signed 32-bit header ints wrap into the flag word
                let word = u32::try_from(parsed).or_else(|_| i32::try_from(parsed).map(|v| v as u32)).map_err(|_| bad())?;
                return Ok(QualityMask(word));
            }
            let skip = data_len(&header)
                .and_then(padded)
                .and_then(|n| i64::try_from(n).ok())
                .ok_or(HeaderError::DataTooLarge(hdu))?;
            reader.seek(SeekFrom::Current(skip))?;
            hdu += 1;
        }
    }
}

/// Header cards up to `END`, as (keyword, raw value) with comments stripped.
fn read_header(reader: &mut impl Read) -> Result<Vec<(String, String)>, HeaderError> {
    let mut cards = Vec::new();
    let mut block = [0u8; BLOCK_LEN];
    let mut first = true;
    loop {
        reader.read_exact(&mut block)?;
        for card in block.chunks(CARD_LEN) {
            let text = String::from_utf8_lossy(card);
            let key = text.get(..8).unwrap_or(&text).trim_end().to_string();
            if first && key != "SIMPLE" && key != "XTENSION" {
                return Err(HeaderError::NotFits);
            }
            first = false;
            if key == "END" {
                return Ok(cards);
            }
            if text.get(8..10) == Some("= ") {
                let raw = text.get(10..).unwrap_or_default();
                cards.push((key, card_value(raw)));
            }
        }
    }
}

fn card_value(raw: &str) -> String {
    let raw = raw.trim();
    if let Some(rest) = raw.strip_prefix('\'') {
        return rest.split('\'').next().unwrap_or_default().trim_end().to_string();
    }
    raw.split('/').next().unwrap_or_default().trim().to_string()
}

fn int_card(header: &[(String, String)], key: &str) -> Option<i64> {
    header.iter().find(|(k, _)| k == key).and_then(|(_, v)| v.parse().ok())
}

/// Data unit size: |BITPIX|/8 * GCOUNT * (PCOUNT + NAXIS1*...*NAXISn), `None` on overflow.
fn data_len(header: &[(String, String)]) -> Option<u64> {
    let naxis = int_card(header, "NAXIS").unwrap_or(0);
    if naxis <= 0 {
        return Some(0);
    }
    let bitpix = int_card(header, "BITPIX").unwrap_or(8).unsigned_abs();
    let pcount = int_card(header, "PCOUNT").unwrap_or(0).max(0).unsigned_abs();
    let gcount = int_card(header, "GCOUNT").unwrap_or(1).max(1).unsigned_abs();
    let pixels = (1..=naxis).try_fold(1u64, |acc, n| {
        acc.checked_mul(int_card(header, &format!("NAXIS{n}")).unwrap_or(0).max(0).unsigned_abs())
    })?;
    (bitpix / 8).checked_mul(gcount)?.checked_mul(pcount.checked_add(pixels)?)
}

fn padded(len: u64) -> Option<u64> {
    len.div_ceil(BLOCK_LEN as u64).checked_mul(BLOCK_LEN as u64)
}
