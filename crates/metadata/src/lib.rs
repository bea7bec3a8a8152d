use std::fs::File;
use std::io::Read;
use std::path::Path;

use common::{AttrMap, AttrValue};
use lofty::error::LoftyError;
use lofty::prelude::{AudioFile, ItemKey, TaggedFileExt};

const RATING_SCAN_LIMIT: usize = 64 * 1024;

#[derive(Debug, Default, Clone)]
pub struct TagAttributes {
    pub attributes: AttrMap,
    pub format_info: AttrMap,
}

#[derive(Debug)]
pub enum MetadataError {
    Io(std::io::Error),
    Lofty(LoftyError),
}

impl std::fmt::Display for MetadataError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            MetadataError::Io(err) => write!(f, "io error: {}", err),
            MetadataError::Lofty(err) => write!(f, "tag parse error: {}", err),
        }
    }
}

impl std::error::Error for MetadataError {}

impl From<std::io::Error> for MetadataError {
    fn from(err: std::io::Error) -> Self {
        MetadataError::Io(err)
    }
}

impl From<LoftyError> for MetadataError {
    fn from(err: LoftyError) -> Self {
        MetadataError::Lofty(err)
    }
}

pub fn read_attributes(path: &Path) -> Result<TagAttributes, MetadataError> {
    let tagged_file = lofty::read_from_path(path)?;
    let properties = tagged_file.properties();

    let mut out = TagAttributes::default();

    let duration_ms = properties.duration().as_millis();
    if duration_ms > 0 {
        let clamped = duration_ms.min(i64::MAX as u128) as i64;
        out.format_info
            .insert("duration_ms".to_string(), AttrValue::Number(clamped));
    }
    if let Some(rate) = properties.sample_rate() {
        out.format_info
            .insert("sample_rate".to_string(), AttrValue::Number(i64::from(rate)));
    }
    if let Some(channels) = properties.channels() {
        out.format_info
            .insert("channels".to_string(), AttrValue::Number(i64::from(channels)));
    }
    if let Some(bitrate) = properties.audio_bitrate().or(properties.overall_bitrate()) {
        out.format_info
            .insert("bitrate".to_string(), AttrValue::Number(i64::from(bitrate)));
    }
    if let Some(ext) = path.extension().and_then(|e| e.to_str()) {
        out.format_info
            .insert("codec".to_string(), AttrValue::Text(ext.to_ascii_lowercase()));
    }

    if let Some(tag) = tagged_file.primary_tag().or_else(|| tagged_file.first_tag()) {
        set_text(&mut out.attributes, "title", tag.get_string(&ItemKey::TrackTitle));
        set_text(&mut out.attributes, "album", tag.get_string(&ItemKey::AlbumTitle));
        let album_artist = tag.get_string(&ItemKey::AlbumArtist);
        let track_artist = tag.get_string(&ItemKey::TrackArtist);
        set_text(&mut out.attributes, "album_artist", album_artist);
        set_text(&mut out.attributes, "artist", track_artist.or(album_artist));
        set_number(
            &mut out.attributes,
            "track",
            tag.get_string(&ItemKey::TrackNumber).and_then(parse_index),
        );
        set_number(
            &mut out.attributes,
            "disc",
            tag.get_string(&ItemKey::DiscNumber).and_then(parse_index),
        );
        set_number(
            &mut out.attributes,
            "year",
            tag.get_string(&ItemKey::Year).and_then(parse_year),
        );
        if let Some(value) = tag.get_string(&ItemKey::Genre) {
            let genres = parse_genres(value);
            if !genres.is_empty() {
                out.attributes
                    .insert("genre".to_string(), AttrValue::List(genres));
            }
        }
        set_text(&mut out.attributes, "comment", tag.get_string(&ItemKey::Comment));
    }

    Ok(out)
}

// ID3v2 POPM frames carry a 0-255 rating byte that lofty does not surface.
// Scanning the file head for the frame is enough for files written by the
// usual taggers; anything unreadable simply yields no rating.
pub fn derive_rating(path: &Path, extension: &str) -> AttrMap {
    let mut out = AttrMap::new();
    if extension != "mp3" {
        return out;
    }
    let head = match read_head(path, RATING_SCAN_LIMIT) {
        Ok(head) => head,
        Err(_) => return out,
    };
    if let Some(stars) = popm_stars(&head) {
        out.insert("rating".to_string(), AttrValue::Number(stars));
    }
    out
}

fn read_head(path: &Path, limit: usize) -> std::io::Result<Vec<u8>> {
    let file = File::open(path)?;
    let mut buf = Vec::with_capacity(limit.min(8192));
    file.take(limit as u64).read_to_end(&mut buf)?;
    Ok(buf)
}

fn popm_stars(bytes: &[u8]) -> Option<i64> {
    let start = find_frame(bytes, b"POPM")?;
    // 4-byte id, 4-byte size, 2 flag bytes, then a NUL-terminated email
    // followed by the rating byte.
    let body = bytes.get(start + 10..)?;
    let nul = body.iter().position(|b| *b == 0)?;
    let rating = *body.get(nul + 1)?;
    star_band(rating)
}

fn find_frame(bytes: &[u8], id: &[u8]) -> Option<usize> {
    bytes.windows(id.len()).position(|window| window == id)
}

fn star_band(rating: u8) -> Option<i64> {
    match rating {
        0 => None,
        1..=31 => Some(1),
        32..=95 => Some(2),
        96..=159 => Some(3),
        160..=223 => Some(4),
        _ => Some(5),
    }
}

fn set_text(map: &mut AttrMap, key: &str, value: Option<&str>) {
    if let Some(value) = value {
        let trimmed = value.trim();
        if !trimmed.is_empty() {
            map.insert(key.to_string(), AttrValue::Text(trimmed.to_string()));
        }
    }
}

fn set_number(map: &mut AttrMap, key: &str, value: Option<i64>) {
    if let Some(value) = value {
        map.insert(key.to_string(), AttrValue::Number(value));
    }
}

fn parse_index(text: &str) -> Option<i64> {
    let head = text.split('/').next().unwrap_or(text).trim();
    head.parse().ok()
}

fn parse_year(text: &str) -> Option<i64> {
    let mut digits = String::new();
    for ch in text.chars() {
        if ch.is_ascii_digit() {
            digits.push(ch);
            if digits.len() == 4 {
                break;
            }
        } else if !digits.is_empty() {
            break;
        }
    }
    if digits.is_empty() {
        None
    } else {
        digits.parse().ok()
    }
}

fn parse_genres(text: &str) -> Vec<String> {
    let mut out = Vec::new();
    for part in text.split(&[';', ',', '/', '|', '\0'][..]) {
        let trimmed = part.trim();
        if trimmed.is_empty() {
            continue;
        }
        out.push(trimmed.to_string());
    }
    if out.is_empty() {
        let trimmed = text.trim();
        if !trimmed.is_empty() {
            out.push(trimmed.to_string());
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;

    fn popm_bytes(rating: u8) -> Vec<u8> {
        let mut bytes = b"ID3\x04\x00\x00\x00\x00\x00\x40".to_vec();
        bytes.extend_from_slice(b"POPM");
        bytes.extend_from_slice(&[0, 0, 0, 24]);
        bytes.extend_from_slice(&[0, 0]);
        bytes.extend_from_slice(b"tagger@example.com\0");
        bytes.push(rating);
        bytes.extend_from_slice(&[0, 0, 0, 0]);
        bytes
    }

    #[test]
    fn parse_index_handles_slash_forms() {
        assert_eq!(parse_index("3/12"), Some(3));
        assert_eq!(parse_index(" 7 "), Some(7));
        assert_eq!(parse_index("abc"), None);
    }

    #[test]
    fn parse_year_scans_digit_runs() {
        assert_eq!(parse_year("1969-01-01"), Some(1969));
        assert_eq!(parse_year("released 1971"), Some(1971));
        assert_eq!(parse_year("no digits"), None);
    }

    #[test]
    fn parse_genres_splits_delimiters() {
        assert_eq!(
            parse_genres("Jazz; Bebop / Cool"),
            vec!["Jazz".to_string(), "Bebop".to_string(), "Cool".to_string()]
        );
        assert_eq!(parse_genres("  "), Vec::<String>::new());
    }

    #[test]
    fn star_band_maps_popm_ranges() {
        assert_eq!(star_band(0), None);
        assert_eq!(star_band(1), Some(1));
        assert_eq!(star_band(31), Some(1));
        assert_eq!(star_band(32), Some(2));
        assert_eq!(star_band(96), Some(3));
        assert_eq!(star_band(160), Some(4));
        assert_eq!(star_band(224), Some(5));
        assert_eq!(star_band(255), Some(5));
    }

    #[test]
    fn popm_stars_reads_rating_byte() {
        assert_eq!(popm_stars(&popm_bytes(196)), Some(4));
        assert_eq!(popm_stars(&popm_bytes(0)), None);
        assert_eq!(popm_stars(b"no frame here"), None);
    }

    #[test]
    fn derive_rating_reads_mp3_head() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("rated.mp3");
        fs::write(&path, popm_bytes(255)).unwrap();
        let attrs = derive_rating(&path, "mp3");
        assert_eq!(attrs.get("rating"), Some(&AttrValue::Number(5)));
    }

    #[test]
    fn derive_rating_ignores_other_formats() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("rated.flac");
        fs::write(&path, popm_bytes(255)).unwrap();
        assert!(derive_rating(&path, "flac").is_empty());
        assert!(derive_rating(dir.path().join("absent.mp3").as_path(), "mp3").is_empty());
    }
}
