// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

/*! Writing of `ar` containers.

Package installers on devices parse the outer `ar` container with a fixed
expectation of its header layout, so headers are synthesized by hand rather
than by a general purpose `ar` writer. Every member header is exactly 60
bytes:

| field  | width | content                        |
|--------|-------|--------------------------------|
| name   | 16    | member name, space padded      |
| mtime  | 12    | decimal seconds since epoch    |
| uid    | 6     | `0`                            |
| gid    | 6     | `0`                            |
| mode   | 8     | `100644`                       |
| size   | 10    | decimal member length          |
| end    | 2     | `` ` `` followed by `\n`       |

Members whose length is odd are followed by a single `\n` so the next header
starts on an even offset.
*/

use std::io::Write;

/// Global header that starts every `ar` container.
pub const AR_MAGIC: &[u8; 8] = b"!<arch>\n";

/// Length of a member header.
pub const AR_HEADER_LEN: usize = 60;

/// Terminator of every member header.
pub const AR_HEADER_END: &[u8; 2] = b"`\n";

fn pad_field(out: &mut Vec<u8>, value: &str, width: usize) {
    let bytes = value.as_bytes();
    let len = bytes.len().min(width);
    out.extend_from_slice(&bytes[..len]);
    out.extend(std::iter::repeat(b' ').take(width - len));
}

/// Encode the 60 byte header for a member.
///
/// Names longer than 16 bytes are truncated; package members never are.
pub fn encode_header(name: &str, mtime: u64, size: u64) -> [u8; AR_HEADER_LEN] {
    let mut out = Vec::with_capacity(AR_HEADER_LEN);
    pad_field(&mut out, name, 16);
    pad_field(&mut out, &mtime.to_string(), 12);
    pad_field(&mut out, "0", 6);
    pad_field(&mut out, "0", 6);
    pad_field(&mut out, "100644", 8);
    pad_field(&mut out, &size.to_string(), 10);
    out.extend_from_slice(AR_HEADER_END);

    let mut header = [0u8; AR_HEADER_LEN];
    header.copy_from_slice(&out);
    header
}

/// Streams members into an `ar` container.
pub struct ArWriter<W: Write> {
    writer: W,
    mtime: u64,
}

impl<W: Write> ArWriter<W> {
    /// Construct a new writer, emitting the global header immediately.
    pub fn new(mut writer: W, mtime: u64) -> std::io::Result<Self> {
        writer.write_all(AR_MAGIC)?;

        Ok(Self { writer, mtime })
    }

    /// Append a member with the given name and content.
    pub fn append(&mut self, name: &str, data: &[u8]) -> std::io::Result<()> {
        self.writer
            .write_all(&encode_header(name, self.mtime, data.len() as u64))?;
        self.writer.write_all(data)?;

        if data.len() % 2 == 1 {
            self.writer.write_all(b"\n")?;
        }

        Ok(())
    }

    /// Flush and return the underlying writer.
    pub fn into_inner(mut self) -> std::io::Result<W> {
        self.writer.flush()?;

        Ok(self.writer)
    }
}
