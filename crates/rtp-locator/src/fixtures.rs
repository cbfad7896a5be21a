//! Minimal FITS writers for tests that need real quality-flagged candidates.

use std::io::Write;
use std::path::Path;

use crate::fits::{BLOCK_LEN, CARD_LEN};

fn card(key: &str, value: &str) -> String {
    format!("{:<8}= {:>20}", key, value)
}

fn push_header(out: &mut Vec<u8>, cards: &[String]) {
    let start = out.len();
    for c in cards.iter().map(String::as_str).chain(std::iter::once("END")) {
        out.extend(format!("{:<width$}", c, width = CARD_LEN).bytes().take(CARD_LEN));
    }
    let pad = (BLOCK_LEN - (out.len() - start) % BLOCK_LEN) % BLOCK_LEN;
    out.extend(std::iter::repeat(b' ').take(pad));
}

/// Write a FITS file whose HDU `hdu_index` carries `keyword = quality`.
///
/// The primary HDU has no data; each extension is a tiny 4x2 16-bit image so
/// readers have to skip a real data unit.
pub fn write_fits_with_quality(path: &Path, hdu_index: usize, keyword: &str, quality: i64) -> std::io::Result<()> {
    let mut out = Vec::new();
    let quality_card = card(keyword, &quality.to_string());

    let mut primary = vec![card("SIMPLE", "T"), card("BITPIX", "8"), card("NAXIS", "0"), card("EXTEND", "T")];
    if hdu_index == 0 {
        primary.push(quality_card.clone());
    }
    push_header(&mut out, &primary);

    for hdu in 1..=hdu_index {
        let mut ext = vec![
            card("XTENSION", "'IMAGE   '"),
            card("BITPIX", "16"),
            card("NAXIS", "2"),
            card("NAXIS1", "4"),
            card("NAXIS2", "2"),
            card("PCOUNT", "0"),
            card("GCOUNT", "1"),
        ];
        if hdu == hdu_index {
            ext.push(format!("{} / quality flags", quality_card));
        }
        push_header(&mut out, &ext);
        out.extend(std::iter::repeat(0u8).take(16));
        out.extend(std::iter::repeat(0u8).take(BLOCK_LEN - 16));
    }

    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    let mut f = std::fs::File::create(path)?;
    f.write_all(&out)?;
    Ok(())
}

/// Write a data-less primary HDU carrying `cards` verbatim, for headers no real writer would emit.
pub fn write_primary_header(path: &Path, cards: &[(&str, &str)]) -> std::io::Result<()> {
    let mut out = Vec::new();
    let cards: Vec<String> = std::iter::once(("SIMPLE", "T")).chain(cards.iter().copied()).map(|(k, v)| card(k, v)).collect();
    push_header(&mut out, &cards);
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    std::fs::write(path, out)
}
