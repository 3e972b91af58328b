// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

/*! Resolving assets declared by application manifests.

Asset fields of `appinfo.json` (icons, splash images, ...) and of localized
`resources/<locale>/appinfo.json` files must reference files inside the
application directory.
*/

use {
    crate::{
        error::{IpkError, Result},
        files::{FileEntry, FileKind},
        manifest::{read_json_file, AppManifest, APPINFO_FILENAME},
    },
    log::debug,
    serde_json::Value,
    std::path::{Component, Path, PathBuf},
};

/// Manifest fields holding asset paths.
pub const ASSET_FIELDS: &[&str] = &[
    "icon",
    "largeIcon",
    "miniicon",
    "mediumIcon",
    "splashicon",
    "splashBackground",
    "bgImage",
    "imageForRecents",
];

/// Prefix marking an asset resolved at runtime.
pub const DYNAMIC_PROPERTY_MARKER: char = '$';

/// Directory holding localized manifests.
pub const RESOURCES_DIR: &str = "resources";

fn asset_values(manifest: &Value) -> Vec<String> {
    ASSET_FIELDS
        .iter()
        .filter_map(|field| manifest.get(*field).and_then(Value::as_str))
        .filter(|s| !s.is_empty())
        .map(str::to_string)
        .collect()
}

/// Lexically normalize a relative path, rejecting escapes above the root.
fn normalize_relative(path: &Path) -> Option<PathBuf> {
    let mut out = PathBuf::new();

    for component in path.components() {
        match component {
            Component::Normal(c) => out.push(c),
            Component::CurDir => {}
            Component::ParentDir => {
                if !out.pop() {
                    return None;
                }
            }
            Component::RootDir | Component::Prefix(_) => return None,
        }
    }

    Some(out)
}

/// Localized manifests below `<app_dir>/resources`.
pub fn localized_manifests(app_dir: &Path) -> Result<Vec<PathBuf>> {
    let resources = app_dir.join(RESOURCES_DIR);
    if !resources.is_dir() {
        return Ok(vec![]);
    }

    let mut found = vec![];
    for entry in walkdir::WalkDir::new(&resources).sort_by(|a, b| a.file_name().cmp(b.file_name()))
    {
        let entry = entry?;
        if entry.file_type().is_file() && entry.file_name() == APPINFO_FILENAME {
            found.push(entry.path().to_path_buf());
        }
    }

    Ok(found)
}

/// Resolve every asset declared by the application into copy entries.
///
/// Paths are relative to the manifest declaring them and must stay within
/// the application directory. Missing files are an error unless the asset
/// starts with [DYNAMIC_PROPERTY_MARKER].
pub fn resolve_assets(app: &AppManifest) -> Result<Vec<FileEntry>> {
    let mut declared = vec![(app.dir.clone(), asset_values(&app.raw))];

    for path in localized_manifests(&app.dir)? {
        let manifest = read_json_file(&path)?;
        let dir = path.parent().unwrap_or(&app.dir).to_path_buf();
        declared.push((dir, asset_values(&manifest)));
    }

    let mut entries: Vec<FileEntry> = vec![];

    for (dir, assets) in declared {
        let dir_rel = dir.strip_prefix(&app.dir)?.to_path_buf();

        for asset in assets {
            if asset.starts_with(DYNAMIC_PROPERTY_MARKER) {
                debug!("skipping dynamic asset {}", asset);
                continue;
            }

            let relative_path = normalize_relative(&dir_rel.join(&asset))
                .ok_or_else(|| IpkError::AssetOutsideApp(dir.join(&asset)))?;
            let source_path = app.dir.join(&relative_path);

            if !source_path.is_file() {
                return Err(IpkError::MissingAsset(source_path));
            }

            if entries.iter().any(|e| e.relative_path == relative_path) {
                continue;
            }

            entries.push(FileEntry {
                kind: FileKind::File,
                base_path: app.dir.clone(),
                relative_path,
                source_path,
                is_under_base: true,
                symlink_target: None,
            });
        }
    }

    Ok(entries)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn app_with(dir: &Path, extra: &str) -> Result<AppManifest> {
        std::fs::write(
            dir.join(APPINFO_FILENAME),
            format!(
                r#"{{"id": "com.test", "version": "1.0.0", "type": "web", "main": "index.html"{}}}"#,
                extra
            ),
        )?;
        AppManifest::load(dir)
    }

    #[test]
    fn resolves_main_and_localized_assets() -> Result<()> {
        let td = tempfile::tempdir()?;
        let dir = td.path();
        std::fs::create_dir_all(dir.join("images"))?;
        std::fs::create_dir_all(dir.join("resources/ko/KR"))?;
        std::fs::write(dir.join("images/icon.png"), "png")?;
        std::fs::write(dir.join("resources/ko/KR/icon.png"), "png")?;
        std::fs::write(
            dir.join("resources/ko/KR/appinfo.json"),
            r#"{"icon": "icon.png", "largeIcon": "../../../images/icon.png"}"#,
        )?;

        let app = app_with(dir, r#", "icon": "images/icon.png", "splashBackground": "$splash""#)?;
        let entries = resolve_assets(&app)?;

        let paths = entries
            .iter()
            .map(|e| e.relative_path.clone())
            .collect::<Vec<_>>();
        assert_eq!(
            paths,
            vec![
                PathBuf::from("images/icon.png"),
                PathBuf::from("resources/ko/KR/icon.png"),
            ]
        );

        Ok(())
    }

    #[test]
    fn missing_asset() -> Result<()> {
        let td = tempfile::tempdir()?;
        let app = app_with(td.path(), r#", "icon": "icon.png""#)?;
        assert!(matches!(
            resolve_assets(&app),
            Err(IpkError::MissingAsset(_))
        ));

        Ok(())
    }

    #[test]
    fn escaping_asset() -> Result<()> {
        let td = tempfile::tempdir()?;
        let app = app_with(td.path(), r#", "icon": "../icon.png""#)?;
        assert!(matches!(
            resolve_assets(&app),
            Err(IpkError::AssetOutsideApp(_))
        ));

        Ok(())
    }
}
