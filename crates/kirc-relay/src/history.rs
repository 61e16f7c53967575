//! History pages: compacted with bincode and, when the requester's public
//! key is known, sealed to it. A sealed page keeps the newest entries that
//! fit the seal bound.

use base64::{Engine as _, engine::general_purpose::STANDARD as BASE64};
use bincode::Options;
use tracing::debug;

use kirc_crypto::{Identity, PublicKey, SEAL_MAX_PLAINTEXT, open, seal};
use kirc_types::models::HistoryEntry;
use kirc_types::{KircError, Result};

fn codec() -> impl Options {
    bincode::DefaultOptions::new().with_limit(SEAL_MAX_PLAINTEXT as u64)
}

/// Dense binary page. Fails if the page exceeds the seal bound.
pub fn compact(entries: &[HistoryEntry]) -> Result<Vec<u8>> {
    codec().serialize(entries).map_err(|e| match *e {
        bincode::ErrorKind::SizeLimit => KircError::PayloadTooLarge {
            len: entries.iter().map(|entry| entry.content.len()).sum(),
            max: SEAL_MAX_PLAINTEXT,
        },
        other => KircError::Malformed(format!("history page: {}", other)),
    })
}

pub fn expand(bytes: &[u8]) -> Result<Vec<HistoryEntry>> {
    codec()
        .deserialize(bytes)
        .map_err(|e| KircError::Malformed(format!("history page: {}", e)))
}

/// Seal the newest entries that fit. Returns the base64 sealed page and
/// how many entries it holds.
pub fn seal_page(recipient: &PublicKey, entries: &[HistoryEntry]) -> Result<(String, usize)> {
    let mut start = 0;
    let page = loop {
        match compact(&entries[start..]) {
            Ok(page) => break page,
            Err(KircError::PayloadTooLarge { .. }) => start += 1,
            Err(e) => return Err(e),
        }
    };
    if start > 0 {
        debug!("History page trimmed by {} oldest entries to fit", start);
    }

    let sealed = seal(recipient, &page)?;
    Ok((BASE64.encode(sealed), entries.len() - start))
}

pub fn open_page(identity: &Identity, sealed_page: &str) -> Result<Vec<HistoryEntry>> {
    let sealed = BASE64
        .decode(sealed_page)
        .map_err(|e| KircError::Malformed(format!("sealed page: {}", e)))?;
    expand(&open(identity, &sealed)?)
}
