// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

/*! The `control` file stored in `control.tar.gz`.

A control file is an ordered list of `Name: value` fields terminated by a
blank line.
*/

use std::io::Write;

/// Version of the packager recorded in generated control files.
pub const PACKAGER_VERSION: &str = env!("CARGO_PKG_VERSION");

/// Encryption algorithm recorded for encrypted packages.
pub const ENCRYPT_ALGORITHM: &str = "AES-256-CBC";

/// An ordered set of control fields.
#[derive(Clone, Debug, Default, Eq, PartialEq)]
pub struct ControlFile {
    fields: Vec<(String, String)>,
}

impl ControlFile {
    /// Build the control file for a package.
    ///
    /// Field order is fixed.
    pub fn for_package(
        package: &str,
        version: &str,
        architecture: &str,
        installed_size: u64,
        encrypted: bool,
    ) -> Self {
        let mut control = Self::default();
        control.add_field("Package", package);
        control.add_field("Version", version);
        control.add_field("Section", "misc");
        control.add_field("Priority", "optional");
        control.add_field("Architecture", architecture);
        control.add_field("Installed-Size", &installed_size.to_string());
        control.add_field("Maintainer", "N/A <nobody@example.com>");
        control.add_field("Description", "This is a webOS application.");
        control.add_field("webOS-Package-Format-Version", "2");
        control.add_field("webOS-Packager-Version", PACKAGER_VERSION);
        if encrypted {
            control.add_field("Encrypt-Algorithm", ENCRYPT_ALGORITHM);
        }

        control
    }

    pub fn add_field(&mut self, name: &str, value: &str) {
        self.fields.push((name.to_string(), value.to_string()));
    }

    /// Obtain the value of the first field with the given name.
    pub fn field(&self, name: &str) -> Option<&str> {
        self.fields
            .iter()
            .find(|(k, _)| k.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }

    pub fn iter_fields(&self) -> impl Iterator<Item = (&str, &str)> {
        self.fields.iter().map(|(k, v)| (k.as_str(), v.as_str()))
    }

    /// Parse control file content.
    ///
    /// Continuation lines (starting with whitespace) are appended to the
    /// previous field. Parsing stops at the first blank line after a field.
    pub fn parse(content: &str) -> Self {
        let mut control = Self::default();

        for line in content.lines() {
            if line.trim().is_empty() {
                if control.fields.is_empty() {
                    continue;
                }
                break;
            }

            if line.starts_with(' ') || line.starts_with('\t') {
                if let Some((_, value)) = control.fields.last_mut() {
                    value.push('\n');
                    value.push_str(line.trim());
                }
                continue;
            }

            if let Some((name, value)) = line.split_once(':') {
                control.add_field(name.trim(), value.trim());
            }
        }

        control
    }

    pub fn write<W: Write>(&self, writer: &mut W) -> std::io::Result<()> {
        for (name, value) in &self.fields {
            writeln!(writer, "{}: {}", name, value)?;
        }
        writer.write_all(b"\n")
    }

    pub fn to_bytes(&self) -> Vec<u8> {
        let mut buffer = vec![];
        self.write(&mut buffer)
            .expect("writing to a Vec should not fail");
        buffer
    }
}
