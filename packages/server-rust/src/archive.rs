//! Api archive packing and unpacking.

use std::io::{Read, Write};
use std::path::{Component, Path};

use flate2::read::GzDecoder;
use flate2::write::GzEncoder;
use flate2::Compression;
use tar::{Archive, Builder, EntryType};

#[derive(Debug, thiserror::Error)]
pub enum ArchiveError {
    #[error("archive entry {0} escapes the target folder")]
    PathTraversal(String),
    #[error("archive entry {path} has unsupported type {kind:?}")]
    UnsupportedEntry { path: String, kind: EntryType },
    #[error("archive i/o failure: {0}")]
    Io(#[from] std::io::Error),
}

pub trait ArchiveCodec: Send + Sync {
    /// Whether `file_name` looks like an archive this codec reads.
    fn supports(&self, file_name: &str) -> bool;

    /// Unpacks `reader` into `target`, which must exist.
    ///
    /// # Errors
    ///
    /// Fails on malformed archives and on entries that would land outside
    /// `target` or aren't plain files or folders.
    fn decompress(&self, reader: &mut dyn Read, target: &Path) -> Result<(), ArchiveError>;

    /// Packs the contents of `source` into `writer`.
    ///
    /// # Errors
    ///
    /// Returns an error if `source` can't be read or `writer` fails.
    fn compress(&self, source: &Path, writer: &mut dyn Write) -> Result<(), ArchiveError>;
}

/// Gzip compressed tarballs (`.tar.gz`, `.tgz`, and the `.api` extension
/// used for published apis).
#[derive(Debug, Default, Clone, Copy)]
pub struct TarGzCodec;

impl ArchiveCodec for TarGzCodec {
    fn supports(&self, file_name: &str) -> bool {
        let name = file_name.to_ascii_lowercase();
        [".tar.gz", ".tgz", ".api"].iter().any(|ext| name.ends_with(ext))
    }

    fn decompress(&self, reader: &mut dyn Read, target: &Path) -> Result<(), ArchiveError> {
        let mut archive = Archive::new(GzDecoder::new(reader));
        for entry in archive.entries()? {
            let mut entry = entry?;
            let path = entry.path()?.into_owned();
            let shown = path.display().to_string();
            if path
                .components()
                .any(|c| !matches!(c, Component::Normal(_) | Component::CurDir))
            {
                return Err(ArchiveError::PathTraversal(shown));
            }
            let kind = entry.header().entry_type();
            if !(kind.is_file() || kind.is_dir()) {
                return Err(ArchiveError::UnsupportedEntry { path: shown, kind });
            }
            entry.unpack_in(target)?;
        }
        Ok(())
    }

    fn compress(&self, source: &Path, writer: &mut dyn Write) -> Result<(), ArchiveError> {
        let encoder = GzEncoder::new(writer, Compression::default());
        let mut builder = Builder::new(encoder);
        builder.append_dir_all(".", source)?;
        builder.into_inner()?.finish()?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn supports_known_extensions() {
        assert!(TarGzCodec.supports("billing.tar.gz"));
        assert!(TarGzCodec.supports("billing.TGZ"));
        assert!(TarGzCodec.supports("billing.api"));
        assert!(!TarGzCodec.supports("billing.zip"));
    }

    #[test]
    fn compress_then_decompress_keeps_tree() {
        let source = tempfile::tempdir().unwrap();
        std::fs::create_dir_all(source.path().join("resources/services")).unwrap();
        std::fs::write(source.path().join("api.json"), r#"{"namespace":"x"}"#).unwrap();
        std::fs::write(source.path().join("resources/services/a.json"), "{}").unwrap();

        let mut bytes = Vec::new();
        TarGzCodec.compress(source.path(), &mut bytes).unwrap();

        let target = tempfile::tempdir().unwrap();
        TarGzCodec.decompress(&mut bytes.as_slice(), target.path()).unwrap();
        assert!(target.path().join("api.json").is_file());
        assert!(target.path().join("resources/services/a.json").is_file());
    }

    #[test]
    fn symlink_entries_are_rejected() {
        let mut builder = Builder::new(GzEncoder::new(Vec::new(), Compression::default()));
        let mut header = tar::Header::new_gnu();
        header.set_entry_type(EntryType::Symlink);
        header.set_size(0);
        builder
            .append_link(&mut header, "link", "/etc/passwd")
            .unwrap();
        let bytes = builder.into_inner().unwrap().finish().unwrap();

        let target = tempfile::tempdir().unwrap();
        let err = TarGzCodec.decompress(&mut bytes.as_slice(), target.path()).unwrap_err();
        assert!(matches!(err, ArchiveError::UnsupportedEntry { .. }));
    }
}
