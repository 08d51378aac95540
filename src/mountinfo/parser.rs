//! Mount table line parser for Linux systems.
//!
//! Parses lines in `/proc/mounts` (a.k.a. `/etc/mtab`) format. See
//! [`fstab(5)`](https://man7.org/linux/man-pages/man5/fstab.5.html) for details on
//! the structure:
//!
//! ```text
//! /dev/sdb1 /home/pouch ext4 rw,relatime,prjquota,data=ordered 0 0
//! ```

use std::borrow::Cow;

/// Represents a parsed mount table line.
#[derive(Debug, PartialEq, Eq)]
pub struct MountEntry<'a> {
    /// Mounted device or pseudo filesystem name.
    pub device: Cow<'a, str>,
    /// Mount point, with octal escapes (`\040`, ...) decoded.
    pub mount_point: Cow<'a, str>,
    /// Filesystem type (e.g., `ext4`, `xfs`).
    pub fs_type: &'a str,
    /// Comma separated mount options.
    pub options: &'a str,
}

impl MountEntry<'_> {
    /// Returns true if the given option is present in the option list.
    pub fn has_option(&self, option: &str) -> bool {
        self.options.split(',').any(|o| o == option)
    }
}

/// Named fields in a mount table line.
#[derive(Debug)]
pub enum MountField {
    Device,
    MountPoint,
    FsType,
    Options,
    Dump,
    Pass,
}

impl std::fmt::Display for MountField {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            MountField::Device => "device",
            MountField::MountPoint => "mount_point",
            MountField::FsType => "fs_type",
            MountField::Options => "options",
            MountField::Dump => "dump",
            MountField::Pass => "pass",
        };
        write!(f, "{name}")
    }
}

/// Errors that may occur when parsing a mount table line.
#[derive(Debug, thiserror::Error)]
pub enum ParseError {
    #[error("missing `{field}` in line: `{line}`")]
    MissingField { field: MountField, line: String },

    #[error("unexpected trailing fields in line: `{0}`")]
    TrailingFields(String),
}

/// Parses a single line of mount table data.
///
/// Exactly six whitespace separated fields are expected. Apart from decoding octal
/// escapes in the device and mount point, the returned entry borrows from `line`.
///
/// # Errors
///
/// Returns [`ParseError::MissingField`] if the line has fewer than six fields and
/// [`ParseError::TrailingFields`] if it has more.
pub fn parse_mount_line(line: &str) -> Result<MountEntry<'_>, ParseError> {
    let mut fields = line.split_whitespace();
    let mut next = |field: MountField| {
        fields.next().ok_or_else(|| ParseError::MissingField {
            field,
            line: line.to_owned(),
        })
    };

    let device = next(MountField::Device)?;
    let mount_point = next(MountField::MountPoint)?;
    let fs_type = next(MountField::FsType)?;
    let options = next(MountField::Options)?;
    next(MountField::Dump)?;
    next(MountField::Pass)?;

    if fields.next().is_some() {
        return Err(ParseError::TrailingFields(line.to_owned()));
    }

    Ok(MountEntry {
        device: unescape_octal(device),
        mount_point: unescape_octal(mount_point),
        fs_type,
        options,
    })
}

/// Decodes the `\ooo` escapes the kernel uses for space, tab, newline and backslash.
fn unescape_octal(field: &str) -> Cow<'_, str> {
    if !field.contains('\\') {
        return Cow::Borrowed(field);
    }

    let bytes = field.as_bytes();
    let mut out = Vec::with_capacity(bytes.len());
    let mut i = 0;
    while i < bytes.len() {
        if bytes[i] == b'\\' && i + 4 <= bytes.len() {
            let digits = &bytes[i + 1..i + 4];
            if digits.iter().all(|d| (b'0'..=b'7').contains(d)) {
                let value = digits
                    .iter()
                    .fold(0u32, |acc, d| acc * 8 + u32::from(d - b'0'));
                if let Ok(value) = u8::try_from(value) {
                    out.push(value);
                    i += 4;
                    continue;
                }
            }
        }
        out.push(bytes[i]);
        i += 1;
    }

    Cow::Owned(String::from_utf8_lossy(&out).into_owned())
}
