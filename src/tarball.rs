use std::{
    io::Cursor,
    path::{Path, PathBuf},
};

use crate::error::{Error, Result};

// Uncompressed POSIX tar is the wire format for all container file
// transfer, on both backends.

/// A tar holding exactly one file entry named `name`.
pub(crate) fn single_file(name: &str, content: &[u8], mode: u32) -> Result<Vec<u8>> {
    let mut builder = tar::Builder::new(Vec::new());
    let mut header = tar::Header::new_gnu();
    header.set_size(content.len() as u64);
    header.set_mode(mode);
    header.set_cksum();
    builder
        .append_data(&mut header, name, content)
        .map_err(Error::Io)?;
    builder.into_inner().map_err(Error::Io)
}

/// Tars the contents of `dir` with entries relative to it, so extraction
/// into a target directory reproduces the tree without a wrapping
/// directory.
pub(crate) fn directory_contents(dir: &Path) -> Result<Vec<u8>> {
    let mut builder = tar::Builder::new(Vec::new());
    builder.follow_symlinks(true);
    builder.append_dir_all(".", dir).map_err(Error::Io)?;
    builder.into_inner().map_err(Error::Io)
}

/// Extracts an archive into `dest`, returning the extracted regular files.
pub(crate) fn extract_into(archive: &[u8], dest: &Path) -> Result<Vec<PathBuf>> {
    std::fs::create_dir_all(dest)?;
    let mut extracted = Vec::new();
    let mut archive = tar::Archive::new(Cursor::new(archive));
    for entry in archive.entries().map_err(Error::Io)? {
        let mut entry = entry.map_err(Error::Io)?;
        let is_file = entry.header().entry_type().is_file();
        let path = entry.path().map_err(Error::Io)?.into_owned();
        entry.unpack_in(dest).map_err(Error::Io)?;
        if is_file {
            extracted.push(dest.join(path));
        }
    }
    Ok(extracted)
}

/// Pulls the first regular file entry out of an archive, as downloads of a
/// single container file arrive wrapped in a tar.
pub(crate) fn first_file(archive: &[u8]) -> Result<Vec<u8>> {
    let mut archive = tar::Archive::new(Cursor::new(archive));
    for entry in archive.entries().map_err(Error::Io)? {
        let mut entry = entry.map_err(Error::Io)?;
        if entry.header().entry_type().is_file() {
            let mut content = Vec::with_capacity(entry.size() as usize);
            std::io::copy(&mut entry, &mut content).map_err(Error::Io)?;
            return Ok(content);
        }
    }
    Err(Error::Transfer("archive holds no file entry".to_owned()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn single_file_round_trip() {
        let content = b"#!/bin/sh\ndate\n";
        let archive = single_file("log_time.sh", content, 0o755).unwrap();
        assert_eq!(first_file(&archive).unwrap(), content);
    }

    #[test]
    fn binary_content_survives() {
        let content: Vec<u8> = (0..=255u8).cycle().take(4096).collect();
        let archive = single_file("blob.bin", &content, 0o644).unwrap();
        assert_eq!(first_file(&archive).unwrap(), content);
    }

    #[test]
    fn directory_round_trip_preserves_relative_paths() {
        let src = tempfile::tempdir().unwrap();
        std::fs::create_dir(src.path().join("nested")).unwrap();
        std::fs::write(src.path().join("Dockerfile"), "FROM alpine:latest\n").unwrap();
        std::fs::write(src.path().join("nested/data.txt"), "payload").unwrap();

        let archive = directory_contents(src.path()).unwrap();
        let dest = tempfile::tempdir().unwrap();
        let files = extract_into(&archive, dest.path()).unwrap();

        assert_eq!(files.len(), 2);
        assert_eq!(
            std::fs::read_to_string(dest.path().join("Dockerfile")).unwrap(),
            "FROM alpine:latest\n"
        );
        assert_eq!(
            std::fs::read_to_string(dest.path().join("nested/data.txt")).unwrap(),
            "payload"
        );
    }

    #[test]
    fn empty_archive_has_no_file() {
        let archive = tar::Builder::new(Vec::new()).into_inner().unwrap();
        assert!(first_file(&archive).is_err());
    }
}
