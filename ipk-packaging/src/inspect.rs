// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

/*! Reporting on the content of existing `.ipk` files.

The outer `ar` container is unpacked into a scratch directory, its tarballs
are extracted and the metadata files found inside are summarized. Which
fields are surfaced is driven by [REPORT_SECTIONS].
*/

use {
    crate::{
        archive::{CONTROL_TAR_NAME, DATA_TAR_NAME},
        control::ControlFile,
        error::{IoResultExt, IpkError, Result},
        manifest::{decode_text, APPINFO_FILENAME, PACKAGEINFO_FILENAME, SERVICES_FILENAME},
    },
    log::{debug, info},
    serde_json::Value,
    std::{
        io::{Cursor, Read},
        path::{Path, PathBuf},
    },
};

/// Where a report section reads its data from.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum ReportSource {
    /// The `control` file.
    Control,
    /// `usr/palm/applications/*/appinfo.json`.
    AppInfo,
    /// `usr/palm/packages/*/packageinfo.json`.
    PackageInfo,
    /// `usr/palm/services/*/services.json`.
    ServiceInfo,
    /// `package.json` files nested in application or service directories.
    NodePackage,
}

/// One section of a package report.
#[derive(Clone, Copy, Debug)]
pub struct ReportSection {
    pub source: ReportSource,
    /// Fields listed in the terse report, in order.
    pub fields: &'static [&'static str],
}

pub const REPORT_SECTIONS: &[ReportSection] = &[
    ReportSection {
        source: ReportSource::Control,
        fields: &[
            "Package",
            "Version",
            "Architecture",
            "Installed-Size",
            "webOS-Packager-Version",
            "Encrypt-Algorithm",
        ],
    },
    ReportSection {
        source: ReportSource::PackageInfo,
        fields: &["id", "version", "app", "services", "loc_name", "vendor"],
    },
    ReportSection {
        source: ReportSource::AppInfo,
        fields: &["id", "version", "type", "main", "title", "vendor", "icon"],
    },
    ReportSection {
        source: ReportSource::ServiceInfo,
        fields: &["id", "description", "services"],
    },
    ReportSection {
        source: ReportSource::NodePackage,
        fields: &["name", "version", "main"],
    },
];

const PALM_ROOT: &str = "usr/palm";
const NODE_PACKAGE_FILENAME: &str = "package.json";

/// Contents of an unpacked package.
struct Unpacked {
    control: String,
    /// Extracted data tree, absent for encrypted packages.
    data_root: Option<PathBuf>,
}

fn tar_reader(name: &str, data: Vec<u8>) -> Result<Box<dyn Read>> {
    let tail = name
        .strip_prefix("control.tar")
        .or_else(|| name.strip_prefix("data.tar"))
        .unwrap_or(name);

    match tail {
        "" => Ok(Box::new(Cursor::new(data))),
        ".gz" => Ok(Box::new(libflate::gzip::Decoder::new(Cursor::new(data))?)),
        _ => Err(IpkError::UnsupportedCompression(name.to_string())),
    }
}

fn unpack(ipk: &Path, scratch: &Path) -> Result<Unpacked> {
    let fh = std::fs::File::open(ipk).with_path(ipk)?;
    let mut archive = ar::Archive::new(std::io::BufReader::new(fh));

    let mut control_tar = None;
    let mut data_tar = None;

    while let Some(entry) = archive.next_entry() {
        let mut entry = entry?;
        let name = String::from_utf8_lossy(entry.header().identifier())
            .trim_end_matches('/')
            .to_string();

        let mut data = vec![];
        entry.read_to_end(&mut data)?;

        if name == "debian-binary" {
            continue;
        }

        let path = scratch.join(&name);
        debug!("extracting {} to {}", name, path.display());
        if name.starts_with("control.tar") {
            std::fs::write(&path, &data).with_path(&path)?;
            control_tar = Some(tar_reader(&name, data)?);
        } else if name.starts_with("data.tar") {
            std::fs::write(&path, &data).with_path(&path)?;
            data_tar = Some((name, data));
        } else {
            return Err(IpkError::UnknownArchiveEntry(name));
        }
    }

    let control_dir = scratch.join("control");
    let mut control_tar = control_tar.ok_or(IpkError::MissingArchiveEntry(CONTROL_TAR_NAME))?;
    tar::Archive::new(&mut control_tar)
        .unpack(&control_dir)
        .with_path(&control_dir)?;

    let control_path = control_dir.join("control");
    let control = decode_text(&std::fs::read(&control_path).with_path(&control_path)?);

    let (data_name, data) = data_tar.ok_or(IpkError::MissingArchiveEntry(DATA_TAR_NAME))?;

    if ControlFile::parse(&control).field("Encrypt-Algorithm").is_some() {
        debug!("{} is encrypted; not extracting", data_name);
        return Ok(Unpacked {
            control,
            data_root: None,
        });
    }

    let data_dir = scratch.join("data");
    tar::Archive::new(tar_reader(&data_name, data)?)
        .unpack(&data_dir)
        .with_path(&data_dir)?;

    Ok(Unpacked {
        control,
        data_root: Some(data_dir),
    })
}

/// Files named `file_name` directly inside each subdirectory of `dir`.
fn manifests_in(dir: &Path, file_name: &str) -> Result<Vec<PathBuf>> {
    if !dir.is_dir() {
        return Ok(vec![]);
    }

    let mut found = vec![];
    for entry in walkdir::WalkDir::new(dir)
        .min_depth(2)
        .max_depth(2)
        .sort_by(|a, b| a.file_name().cmp(b.file_name()))
    {
        let entry = entry?;
        if entry.file_type().is_file() && entry.file_name() == file_name {
            found.push(entry.path().to_path_buf());
        }
    }

    Ok(found)
}

fn node_packages(palm: &Path) -> Result<Vec<PathBuf>> {
    let mut found = vec![];

    for sub in ["applications", "services"] {
        let dir = palm.join(sub);
        if !dir.is_dir() {
            continue;
        }

        let walker = walkdir::WalkDir::new(&dir)
            .min_depth(2)
            .sort_by(|a, b| a.file_name().cmp(b.file_name()))
            .into_iter()
            .filter_entry(|e| e.file_name() != "node_modules");

        for entry in walker {
            let entry = entry?;
            if entry.file_type().is_file() && entry.file_name() == NODE_PACKAGE_FILENAME {
                found.push(entry.path().to_path_buf());
            }
        }
    }

    Ok(found)
}

fn source_files(source: ReportSource, data_root: &Path) -> Result<Vec<PathBuf>> {
    let palm = data_root.join(PALM_ROOT);

    match source {
        ReportSource::Control => Ok(vec![]),
        ReportSource::AppInfo => manifests_in(&palm.join("applications"), APPINFO_FILENAME),
        ReportSource::PackageInfo => manifests_in(&palm.join("packages"), PACKAGEINFO_FILENAME),
        ReportSource::ServiceInfo => manifests_in(&palm.join("services"), SERVICES_FILENAME),
        ReportSource::NodePackage => node_packages(&palm),
    }
}

fn format_value(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        Value::Array(items) => items
            .iter()
            .map(format_value)
            .collect::<Vec<_>>()
            .join(", "),
        Value::Object(map) => match map.get("name") {
            Some(name) => format_value(name),
            None => value.to_string(),
        },
        other => other.to_string(),
    }
}

#[derive(Default)]
struct Report {
    lines: Vec<String>,
}

impl Report {
    fn heading(&mut self, heading: &str) {
        if !self.lines.is_empty() {
            self.lines.push(String::new());
        }
        self.lines.push(format!("[{}]", heading));
    }

    fn line(&mut self, line: impl Into<String>) {
        self.lines.push(line.into());
    }

    fn finish(mut self) -> String {
        self.lines.push(String::new());
        self.lines.join("\n")
    }
}

fn render(unpacked: &Unpacked, detail: bool) -> Result<String> {
    let mut report = Report::default();

    for section in REPORT_SECTIONS {
        if section.source == ReportSource::Control {
            report.heading("control");
            if detail {
                report.line(unpacked.control.trim_end());
            } else {
                let control = ControlFile::parse(&unpacked.control);
                for field in section.fields {
                    if let Some(value) = control.field(field) {
                        report.line(format!("{}: {}", field, value));
                    }
                }
            }
            continue;
        }

        let data_root = match &unpacked.data_root {
            Some(root) => root,
            None => continue,
        };

        for path in source_files(section.source, data_root)? {
            let rel = path.strip_prefix(data_root)?;
            report.heading(&rel.display().to_string());

            let text = decode_text(&std::fs::read(&path).with_path(&path)?);
            if detail {
                report.line(text.trim_end());
                continue;
            }

            let value: Value = serde_json::from_str(&text)
                .map_err(|e| IpkError::InvalidJson(rel.to_path_buf(), e))?;
            for field in section.fields {
                if let Some(v) = value.get(*field) {
                    report.line(format!("{}: {}", field, format_value(v)));
                }
            }
        }
    }

    if unpacked.data_root.is_none() {
        report.heading(DATA_TAR_NAME);
        report.line("payload is encrypted");
    }

    Ok(report.finish())
}

/// Produce a report on the package at `ipk`.
///
/// The terse report lists selected fields under a heading per metadata file.
/// With `detail` set the raw content of each file is shown instead.
pub fn analyze(ipk: &Path, detail: bool) -> Result<String> {
    analyze_in(ipk, detail, &std::env::temp_dir())
}

/// [analyze] with the scratch directory created under `scratch_parent`.
///
/// The scratch directory is removed before returning, on success or failure.
pub fn analyze_in(ipk: &Path, detail: bool, scratch_parent: &Path) -> Result<String> {
    if !ipk.is_file() {
        return Err(IpkError::PackageNotFound(ipk.to_path_buf()));
    }

    info!("analyzing {}", ipk.display());
    let scratch = tempfile::Builder::new()
        .prefix("ipk-inspect-")
        .tempdir_in(scratch_parent)
        .with_path(scratch_parent)?;

    let unpacked = unpack(ipk, scratch.path())?;

    render(&unpacked, detail)
}

#[cfg(test)]
mod tests {
    use {
        super::*,
        crate::{
            ar::ArWriter,
            archive::{assemble, gzip, write_memory_tar, AssembleOptions, PackageMeta},
        },
    };

    fn staged_app() -> Result<tempfile::TempDir> {
        let td = tempfile::tempdir()?;
        let palm = td.path().join(PALM_ROOT);
        let app = palm.join("applications/com.test.app");
        std::fs::create_dir_all(&app)?;
        std::fs::create_dir_all(palm.join("packages/com.test.app"))?;
        std::fs::create_dir_all(palm.join("services/com.test.app.service"))?;
        std::fs::write(
            app.join(APPINFO_FILENAME),
            r#"{"id": "com.test.app", "version": "1.0.0", "type": "web", "main": "index.html"}"#,
        )?;
        std::fs::write(app.join("index.html"), "<html></html>")?;
        std::fs::create_dir_all(app.join("lib/node_modules/dep"))?;
        std::fs::write(app.join("lib/package.json"), r#"{"name": "lib", "version": "0.1.0"}"#)?;
        std::fs::write(app.join("lib/node_modules/dep/package.json"), r#"{"name": "dep"}"#)?;
        std::fs::write(
            palm.join("packages/com.test.app").join(PACKAGEINFO_FILENAME),
            r#"{"id": "com.test.app", "version": "1.0.0", "app": "com.test.app", "services": ["com.test.app.service"]}"#,
        )?;
        std::fs::write(
            palm.join("services/com.test.app.service").join(SERVICES_FILENAME),
            r#"{"id": "com.test.app.service", "services": [{"name": "com.test.app.service"}]}"#,
        )?;

        Ok(td)
    }

    fn build(out: &Path) -> Result<PathBuf> {
        let staged = staged_app()?;
        let meta = PackageMeta {
            name: "com.test.app".into(),
            version: "1.0.0".into(),
            architecture: None,
        };

        assemble(staged.path(), &meta, out, &AssembleOptions::default())
    }

    #[test]
    fn reports_package_and_version() -> Result<()> {
        let out = tempfile::tempdir()?;
        let ipk = build(out.path())?;

        let report = analyze(&ipk, false)?;
        let lines = report.lines().collect::<Vec<_>>();
        assert!(lines.contains(&"Package: com.test.app"), "{}", report);
        assert!(lines.contains(&"Version: 1.0.0"), "{}", report);
        assert!(lines.contains(&"type: web"), "{}", report);
        assert!(lines.contains(&"services: com.test.app.service"), "{}", report);
        assert!(lines.contains(&"name: lib"), "{}", report);
        assert!(!lines.contains(&"name: dep"), "{}", report);

        Ok(())
    }

    #[test]
    fn detailed_report_dumps_files() -> Result<()> {
        let out = tempfile::tempdir()?;
        let ipk = build(out.path())?;

        let report = analyze(&ipk, true)?;
        assert!(report.contains("Section: misc"));
        assert!(report.contains(r#""main": "index.html""#));

        Ok(())
    }

    #[test]
    fn missing_package() {
        assert!(matches!(
            analyze(Path::new("/nonexistent/package.ipk"), false),
            Err(IpkError::PackageNotFound(_))
        ));
    }

    #[test]
    fn xz_rejected_and_scratch_removed() -> Result<()> {
        let td = tempfile::tempdir()?;
        let scratch_parent = td.path().join("scratch");
        std::fs::create_dir_all(&scratch_parent)?;

        let ipk = td.path().join("bad.ipk");
        let mut writer = ArWriter::new(std::fs::File::create(&ipk)?, 0)?;
        writer.append("debian-binary", b"2.0\n")?;
        writer.append("control.tar.xz", b"\xfd7zXZ\0")?;
        writer.append("data.tar.xz", b"\xfd7zXZ\0")?;
        writer.into_inner()?;

        assert!(matches!(
            analyze_in(&ipk, false, &scratch_parent),
            Err(IpkError::UnsupportedCompression(_))
        ));
        assert_eq!(std::fs::read_dir(&scratch_parent)?.count(), 0);

        let good = build(td.path())?;
        analyze_in(&good, false, &scratch_parent)?;
        assert_eq!(std::fs::read_dir(&scratch_parent)?.count(), 0);

        Ok(())
    }

    #[test]
    fn encrypted_reports_control_only() -> Result<()> {
        let td = tempfile::tempdir()?;
        let control = ControlFile::for_package("com.test.app", "1.0.0", "all", 16, true);
        let mut control_tar = vec![];
        write_memory_tar(&mut control_tar, &[("control".into(), control.to_bytes())], 0)?;

        let ipk = td.path().join("enc.ipk");
        let mut writer = ArWriter::new(std::fs::File::create(&ipk)?, 0)?;
        writer.append("debian-binary", b"2.0\n")?;
        writer.append(CONTROL_TAR_NAME, &gzip(&control_tar)?)?;
        writer.append(DATA_TAR_NAME, &[0u8; 16])?;
        writer.into_inner()?;

        let report = analyze(&ipk, false)?;
        assert!(report.contains("Encrypt-Algorithm: AES-256-CBC"));
        assert!(report.contains("payload is encrypted"));

        Ok(())
    }
}
