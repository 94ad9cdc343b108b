//! Reads a firmware bundle: a ZIP archive holding a plain-text manifest
//! and one file per image, and turns it into an ordered list of
//! [`Segment`]s ready for [`crate::flasher::Flasher::write_segments`].

use std::io::Read;

use crate::error::Error;
use crate::flasher::Segment;

/// Manifest entry names recognized inside the archive, in lookup order.
/// `manifest.txt` is this crate's own convention; the legacy name is
/// what bundles produced by the original firmware repository tool use.
const MANIFEST_NAMES: &[&str] = &["manifest.txt", "firmware_repository_fat.txt"];

/// One `<address>:<filename>` line from the manifest, before its
/// payload has been read out of the archive.
#[derive(Clone, Debug, PartialEq, Eq)]
struct ManifestEntry {
    address: u32,
    filename: String,
}

/// Parsed manifest: an optional version string plus the ordered entry
/// list. Pure and archive-independent, so it can be unit tested
/// directly against manifest text.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
struct Manifest {
    version: Option<String>,
    entries: Vec<ManifestEntry>,
}

fn parse_manifest(text: &str, firmware_only: bool) -> Manifest {
    let mut manifest = Manifest::default();

    for raw_line in text.lines() {
        let line = raw_line.trim();
        if let Some(version) = line.strip_prefix('#') {
            if manifest.version.is_none() {
                manifest.version = Some(version.trim().to_string());
            }
            continue;
        }

        let Some((addr_text, filename)) = line.split_once(':') else {
            continue;
        };
        let Ok(address) = u32::from_str_radix(addr_text.trim(), 16) else {
            continue;
        };
        let filename = filename.trim();
        if firmware_only && !filename.starts_with("user") {
            continue;
        }
        manifest.entries.push(ManifestEntry {
            address,
            filename: filename.to_string(),
        });
    }

    manifest.entries.sort_by_key(|entry| entry.address);
    manifest
}

/// The version string embedded in a bundle's manifest, and its ordered
/// segments. Read once from a ZIP archive at `path`.
pub struct Bundle {
    pub version: Option<String>,
    pub segments: Vec<Segment>,
}

impl Bundle {
    /// Read and parse a bundle from `reader` (typically an open file).
    /// `firmware_only` restricts accepted entries to filenames starting
    /// with `user`, per the bundle's firmware-only mode.
    pub fn load<R: Read + std::io::Seek>(reader: R, firmware_only: bool) -> Result<Self, Error> {
        let mut archive = zip::ZipArchive::new(reader)?;

        let manifest_text = read_manifest_text(&mut archive)?;
        let manifest = parse_manifest(&manifest_text, firmware_only);

        let mut segments = Vec::with_capacity(manifest.entries.len());
        for entry in &manifest.entries {
            let mut file = archive
                .by_name(&entry.filename)
                .map_err(|_| Error::MissingBundleEntry(entry.filename.clone()))?;
            let mut payload = Vec::with_capacity(file.size() as usize);
            file.read_to_end(&mut payload)?;
            segments.push(Segment::new(entry.address, payload));
        }

        Ok(Bundle {
            version: manifest.version,
            segments,
        })
    }
}

fn read_manifest_text<R: Read + std::io::Seek>(
    archive: &mut zip::ZipArchive<R>,
) -> Result<String, Error> {
    for name in MANIFEST_NAMES {
        if let Ok(mut file) = archive.by_name(name) {
            let mut text = String::new();
            file.read_to_string(&mut text)?;
            return Ok(text);
        }
    }
    Err(Error::MissingBundleEntry("<manifest>".to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    const MANIFEST: &str = "# 1.2.3\n\
        00000000:boot.bin\n\
        00001000:user1.bin\n\
        00081000:user2.bin\n";

    #[test]
    fn parses_all_entries_in_ascending_order() {
        let manifest = parse_manifest(MANIFEST, false);
        assert_eq!(manifest.version.as_deref(), Some("1.2.3"));
        assert_eq!(
            manifest
                .entries
                .iter()
                .map(|e| (e.address, e.filename.as_str()))
                .collect::<Vec<_>>(),
            vec![
                (0x00000000, "boot.bin"),
                (0x00001000, "user1.bin"),
                (0x00081000, "user2.bin"),
            ]
        );
    }

    #[test]
    fn firmware_only_keeps_just_user_prefixed_entries() {
        let manifest = parse_manifest(MANIFEST, true);
        assert_eq!(
            manifest
                .entries
                .iter()
                .map(|e| e.filename.as_str())
                .collect::<Vec<_>>(),
            vec!["user1.bin", "user2.bin"]
        );
    }

    #[test]
    fn unrecognized_lines_are_ignored() {
        let text = "not a manifest line\n00001000:a.bin\n:::\n";
        let manifest = parse_manifest(text, false);
        assert_eq!(manifest.entries.len(), 1);
        assert_eq!(manifest.entries[0].filename, "a.bin");
    }

    #[test]
    fn parse_is_a_pure_function_of_the_text() {
        let a = parse_manifest(MANIFEST, false);
        let b = parse_manifest(MANIFEST, false);
        assert_eq!(a, b);
    }
}
