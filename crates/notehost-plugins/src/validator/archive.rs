//! Archive entry path and file-type checks

use std::io::{self, Read, Seek, SeekFrom};

const EOCD_SIGNATURE: [u8; 4] = [0x50, 0x4b, 0x05, 0x06];
const EOCD_LEN: u64 = 22;
const MAX_COMMENT_LEN: u64 = u16::MAX as u64;

/// Extensions that are never allowed inside a plugin archive
const DANGEROUS_EXTENSIONS: [&str; 12] = [
    "exe", "dll", "so", "dylib", "sh", "bash", "bat", "cmd", "ps1", "com", "msi", "scr",
];

/// Text-like or bytecode entries worth scanning for suspicious calls
const SCANNABLE_EXTENSIONS: [&str; 21] = [
    "js", "mjs", "cjs", "ts", "json", "toml", "yaml", "yml", "txt", "html", "htm", "xml", "py",
    "lua", "rb", "class", "wasm", "wat", "properties", "java", "kt",
];

/// Normalize an archive entry name, or `None` if it would land outside the
/// extraction root.
///
/// Both separators are honored because archives built on Windows may use
/// backslashes. Depth is tracked component by component so `a/../b` is fine
/// while `a/../../b` is not.
pub fn normalize_entry_path(name: &str) -> Option<String> {
    if name.is_empty() || name.contains('\0') {
        return None;
    }
    if name.starts_with('/') || name.starts_with('\\') {
        return None;
    }
    let bytes = name.as_bytes();
    if bytes.len() >= 2 && bytes[1] == b':' && bytes[0].is_ascii_alphabetic() {
        return None;
    }

    let mut parts: Vec<&str> = Vec::new();
    for component in name.split(['/', '\\']) {
        match component {
            "" | "." => {}
            ".." => {
                parts.pop()?;
            }
            other => parts.push(other),
        }
    }

    if parts.is_empty() {
        None
    } else {
        Some(parts.join("/"))
    }
}

/// Total entry count from the end-of-central-directory record, read without
/// parsing the central directory itself.
///
/// Returns `None` when no record is found or the count is the ZIP64
/// placeholder; the caller then falls back to a full parse.
pub(crate) fn declared_entry_count<R: Read + Seek>(reader: &mut R) -> io::Result<Option<u64>> {
    let len = reader.seek(SeekFrom::End(0))?;
    if len < EOCD_LEN {
        return Ok(None);
    }
    let tail_len = len.min(EOCD_LEN + MAX_COMMENT_LEN);
    reader.seek(SeekFrom::Start(len - tail_len))?;
    let mut tail = vec![0u8; tail_len as usize];
    reader.read_exact(&mut tail)?;
    reader.seek(SeekFrom::Start(0))?;

    let last_start = tail.len() - EOCD_LEN as usize;
    let Some(at) = (0..=last_start)
        .rev()
        .find(|&i| tail[i..i + 4] == EOCD_SIGNATURE)
    else {
        return Ok(None);
    };
    let total = u16::from_le_bytes([tail[at + 10], tail[at + 11]]);
    if total == u16::MAX {
        return Ok(None);
    }
    Ok(Some(u64::from(total)))
}

pub(crate) fn extension(path: &str) -> Option<String> {
    let file_name = path.rsplit('/').next()?;
    let (stem, ext) = file_name.rsplit_once('.')?;
    if stem.is_empty() && !file_name[1..].contains('.') {
        // dotfile such as ".env"
        return None;
    }
    Some(ext.to_ascii_lowercase())
}

pub(crate) fn is_dangerous_extension(ext: &str) -> bool {
    DANGEROUS_EXTENSIONS.contains(&ext)
}

pub(crate) fn is_scannable_extension(ext: &str) -> bool {
    SCANNABLE_EXTENSIONS.contains(&ext)
}

/// Recognize native executable headers regardless of file name
pub(crate) fn executable_magic(head: &[u8]) -> Option<&'static str> {
    if head.starts_with(b"\x7fELF") {
        return Some("ELF executable");
    }
    if head.starts_with(b"MZ") {
        return Some("PE/DOS executable");
    }
    const MACH_O: [[u8; 4]; 4] = [
        [0xfe, 0xed, 0xfa, 0xce],
        [0xfe, 0xed, 0xfa, 0xcf],
        [0xce, 0xfa, 0xed, 0xfe],
        [0xcf, 0xfa, 0xed, 0xfe],
    ];
    if MACH_O.iter().any(|magic| head.starts_with(magic)) {
        return Some("Mach-O executable");
    }
    None
}
