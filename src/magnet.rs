use std::collections::HashSet;

use data_encoding::BASE32;
use magnet_url::Magnet;

use crate::model::TorrentRecord;

/// A magnet link found in the clipboard that may be offered to the user.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MagnetCandidate {
    pub display_name: Option<String>,
    /// Lowercase 40-character hex.
    pub info_hash: String,
    pub raw: String,
}

impl MagnetCandidate {
    /// Returns `None` for anything that is not a magnet link carrying a
    /// BitTorrent info hash.
    pub fn parse(text: &str) -> Option<Self> {
        let raw = text.trim();
        if !raw.starts_with("magnet:") {
            return None;
        }
        let magnet = match Magnet::new(raw) {
            Ok(magnet) => magnet,
            Err(err) => {
                log::debug!("ignoring malformed magnet link: {err:?}");
                return None;
            }
        };
        let info_hash = btih_topic(raw).and_then(normalize_info_hash)?;
        let display_name = magnet
            .display_name()
            .map(decode_display_name)
            .filter(|name| !name.is_empty());
        Some(Self {
            display_name,
            info_hash,
            raw: raw.to_string(),
        })
    }

    pub fn label(&self) -> &str {
        self.display_name.as_deref().unwrap_or(&self.info_hash)
    }
}

/// Normalises a hex or base32 info hash to lowercase hex.
pub fn normalize_info_hash(hash: &str) -> Option<String> {
    match hash.len() {
        40 => hex::decode(hash).ok().map(hex::encode),
        32 => BASE32
            .decode(hash.to_ascii_uppercase().as_bytes())
            .ok()
            .map(hex::encode),
        _ => None,
    }
}

/// The hash of the first `xt=urn:btih:` exact topic. Other topic kinds
/// (sha1, btmh) name content Transmission cannot add by magnet.
fn btih_topic(raw: &str) -> Option<&str> {
    const PREFIX: &str = "urn:btih:";
    let (_, query) = raw.split_once('?')?;
    query
        .split('&')
        .filter_map(|pair| pair.strip_prefix("xt="))
        .find(|topic| {
            topic
                .get(..PREFIX.len())
                .is_some_and(|head| head.eq_ignore_ascii_case(PREFIX))
        })
        .map(|topic| &topic[PREFIX.len()..])
}

pub fn info_hash_of(link: &str) -> Option<String> {
    MagnetCandidate::parse(link).map(|candidate| candidate.info_hash)
}

/// Info hashes of every tracked torrent, read from its magnet link and
/// falling back to the daemon's hash string.
pub fn tracked_hashes(torrents: &[TorrentRecord]) -> HashSet<String> {
    torrents
        .iter()
        .filter_map(|torrent| {
            torrent
                .magnet_link
                .as_deref()
                .and_then(info_hash_of)
                .or_else(|| normalize_info_hash(&torrent.hash_string))
        })
        .collect()
}

fn decode_display_name(raw: &str) -> String {
    let spaced = raw.replace('+', " ");
    match urlencoding::decode(&spaced) {
        Ok(decoded) => decoded.into_owned(),
        Err(_) => spaced,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::tests::record;

    const HEX: &str = "c12fe1c06bba254a9dc9f519b335aa7c1367a88a";

    #[test]
    fn parses_hex_magnet_with_display_name() {
        let text = format!("  magnet:?xt=urn:btih:{}&dn=Big%20Buck+Bunny\n", HEX.to_uppercase());
        let candidate = MagnetCandidate::parse(&text).expect("candidate");
        assert_eq!(candidate.info_hash, HEX);
        assert_eq!(candidate.display_name.as_deref(), Some("Big Buck Bunny"));
        assert_eq!(candidate.raw, text.trim());
        assert_eq!(candidate.label(), "Big Buck Bunny");
    }

    #[test]
    fn base32_and_hex_hashes_compare_equal() {
        let bytes = hex::decode(HEX).unwrap();
        let base32 = BASE32.encode(&bytes);
        assert_eq!(base32.len(), 32);
        assert_eq!(normalize_info_hash(&base32).as_deref(), Some(HEX));
        assert_eq!(
            normalize_info_hash(&base32.to_lowercase()).as_deref(),
            Some(HEX)
        );
    }

    #[test]
    fn rejects_non_magnet_text() {
        assert!(MagnetCandidate::parse("").is_none());
        assert!(MagnetCandidate::parse("https://example.com/file.torrent").is_none());
        assert!(MagnetCandidate::parse("magnet:?dn=missing-hash").is_none());
        assert!(MagnetCandidate::parse("magnet:?xt=urn:btih:nothex").is_none());
        assert!(MagnetCandidate::parse(&format!("magnet:?xt=urn:sha1:{HEX}&dn=x")).is_none());
    }

    #[test]
    fn picks_btih_topic_among_several() {
        let text = format!("magnet:?xt=urn:sha1:{}&xt=URN:BTIH:{HEX}&dn=x", "0".repeat(40));
        assert_eq!(btih_topic(&text), Some(HEX));
        assert_eq!(btih_topic(&format!("magnet:?xt=urn:sha1:{HEX}")), None);
        assert_eq!(btih_topic("magnet:"), None);
    }

    #[test]
    fn label_falls_back_to_hash() {
        let candidate = MagnetCandidate::parse(&format!("magnet:?xt=urn:btih:{HEX}")).unwrap();
        assert_eq!(candidate.display_name, None);
        assert_eq!(candidate.label(), HEX);
    }

    #[test]
    fn tracked_hashes_reads_links_and_hash_strings() {
        let mut by_link = record(1, "a");
        by_link.magnet_link = Some(format!("magnet:?xt=urn:btih:{HEX}&dn=a"));
        let mut by_hash = record(2, "b");
        by_hash.hash_string = "0123456789abcdef0123456789ABCDEF01234567".to_string();
        let hashes = tracked_hashes(&[by_link, by_hash, record(3, "c")]);
        assert_eq!(hashes.len(), 2);
        assert!(hashes.contains(HEX));
        assert!(hashes.contains("0123456789abcdef0123456789abcdef01234567"));
    }
}
