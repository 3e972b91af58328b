// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

/*! `package.properties` parsing.

The file holds `key = value` lines. Keys of the form `filemode.<octal>`
assign that mode to the comma separated list of application-relative files
in the value:

```text
filemode.755 = bin/launcher,bin/helper
```
*/

use {
    crate::error::{IoResultExt, Result},
    log::warn,
    std::{collections::BTreeMap, path::Path},
};

pub const PROPERTIES_FILENAME: &str = "package.properties";

const FILEMODE_PREFIX: &str = "filemode.";

/// Parse `package.properties` content into a map of relative path to mode.
pub fn parse_file_modes(content: &str) -> BTreeMap<String, u32> {
    let mut modes = BTreeMap::new();

    for line in content.lines() {
        let line = line.trim();
        if line.is_empty() || line.starts_with('#') || line.starts_with('!') {
            continue;
        }

        let (key, value) = match line.split_once('=') {
            Some((k, v)) => (k.trim(), v.trim()),
            None => continue,
        };

        let mode = match key.strip_prefix(FILEMODE_PREFIX) {
            Some(m) => m,
            None => continue,
        };

        let mode = match u32::from_str_radix(mode, 8) {
            Ok(mode) if mode <= 0o7777 => mode,
            _ => {
                warn!("ignoring invalid file mode in {}: {}", PROPERTIES_FILENAME, key);
                continue;
            }
        };

        for file in value.split(',').map(str::trim).filter(|f| !f.is_empty()) {
            modes.insert(file.trim_start_matches("./").to_string(), mode);
        }
    }

    modes
}

/// Load file mode overrides from `<dir>/package.properties`, if present.
pub fn load_file_modes(dir: &Path) -> Result<BTreeMap<String, u32>> {
    let path = dir.join(PROPERTIES_FILENAME);
    if !path.is_file() {
        return Ok(BTreeMap::new());
    }

    let content = std::fs::read_to_string(&path).with_path(&path)?;

    Ok(parse_file_modes(&content))
}

#[cfg(test)]
mod tests {
    use {super::*, indoc::indoc};

    #[test]
    fn parse() {
        let modes = parse_file_modes(indoc! {"
            # comment
            filemode.755 = bin/launcher, ./bin/helper
            filemode.600=secret.key
            filemode.999 = ignored
            other.key = value
        "});

        assert_eq!(modes.len(), 3);
        assert_eq!(modes["bin/launcher"], 0o755);
        assert_eq!(modes["bin/helper"], 0o755);
        assert_eq!(modes["secret.key"], 0o600);
    }
}
