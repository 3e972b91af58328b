// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

/*! Building packages from input directories.

A [PackageRequest] describes a build. [PackageBuilder] validates the inputs,
stages them into a temporary tree mirroring the installed layout on the
device and assembles the result:

```text
<staging>/data/usr/palm/applications/<app id>/...
<staging>/data/usr/palm/packages/<package id>/packageinfo.json
<staging>/data/usr/palm/services/<service id>/...
```

All manifest validation happens before the staging directory is created.
The staging directory is removed on every exit path unless the request asks
for it to be kept.
*/

use {
    crate::{
        archive::{apply_modes, assemble, AssembleOptions, PackageMeta},
        assets::resolve_assets,
        elf::detect_architecture,
        encrypt::encrypt_package,
        error::{IoResultExt, IpkError, Result},
        files::{collect_files, Copier, FileEntry},
        manifest::{
            check_account_templates, check_service_info, AppManifest, PackageManifest,
            ServiceDescriptor, APPINFO_FILENAME, PACKAGEINFO_FILENAME,
        },
        properties::load_file_modes,
        services::{discover_services, SERVICE_SEARCH_DEPTH},
        signing::SigningConfig,
    },
    log::{debug, info, warn},
    serde::Serialize,
    std::{
        collections::BTreeMap,
        path::{Path, PathBuf},
        time::SystemTime,
    },
};

const APPLICATIONS_DIR: &str = "usr/palm/applications";
const PACKAGES_DIR: &str = "usr/palm/packages";
const SERVICES_DIR: &str = "usr/palm/services";

/// Patterns always excluded from staged trees.
const STRAY_EXCLUDES: &[&str] = &["*.ipk", ".DS_Store"];

/// Describes a package build.
#[derive(Clone, Debug)]
pub struct PackageRequest {
    inputs: Vec<PathBuf>,
    outdir: PathBuf,
    minify: bool,
    rom: bool,
    encrypt: bool,
    encrypt_key: Option<PathBuf>,
    force: bool,
    sign_key: Option<PathBuf>,
    certificate: Option<PathBuf>,
    exclude: Vec<String>,
    pkgid: Option<String>,
    pkgversion: Option<String>,
    pkginfofile: Option<PathBuf>,
    no_clean: bool,
    mtime: Option<SystemTime>,
    staging_parent: Option<PathBuf>,
}

impl PackageRequest {
    /// Package the directories `inputs` into `outdir`.
    pub fn new(inputs: Vec<PathBuf>, outdir: impl Into<PathBuf>) -> Self {
        Self {
            inputs,
            outdir: outdir.into(),
            minify: true,
            rom: false,
            encrypt: false,
            encrypt_key: None,
            force: false,
            sign_key: None,
            certificate: None,
            exclude: vec![],
            pkgid: None,
            pkgversion: None,
            pkginfofile: None,
            no_clean: false,
            mtime: None,
            staging_parent: None,
        }
    }

    /// Set whether JavaScript sources are minified.
    pub fn set_minify(mut self, minify: bool) -> Self {
        self.minify = minify;
        self
    }

    /// Emit the staged directory tree instead of an archive.
    pub fn set_rom(mut self, rom: bool) -> Self {
        self.rom = rom;
        self
    }

    pub fn set_encrypt(mut self, encrypt: bool) -> Self {
        self.encrypt = encrypt;
        self
    }

    /// Wrap encryption keys with the public key at `path` instead of the bundled one.
    pub fn set_encrypt_key(mut self, path: Option<PathBuf>) -> Self {
        self.encrypt_key = path;
        self
    }

    /// Pick the first application when several are found instead of failing.
    pub fn set_force(mut self, force: bool) -> Self {
        self.force = force;
        self
    }

    /// Sign with the private key and certificate at the given paths.
    pub fn set_signing(mut self, key: Option<PathBuf>, certificate: Option<PathBuf>) -> Self {
        self.sign_key = key;
        self.certificate = certificate;
        self
    }

    /// Add a glob pattern of files to leave out of the package.
    pub fn add_exclude(mut self, pattern: impl Into<String>) -> Self {
        self.exclude.push(pattern.into());
        self
    }

    pub fn set_pkgid(mut self, id: Option<String>) -> Self {
        self.pkgid = id;
        self
    }

    pub fn set_pkgversion(mut self, version: Option<String>) -> Self {
        self.pkgversion = version;
        self
    }

    /// Use an existing `packageinfo.json` instead of synthesizing one.
    pub fn set_pkginfofile(mut self, path: Option<PathBuf>) -> Self {
        self.pkginfofile = path;
        self
    }

    /// Keep the staging directory after the build.
    pub fn set_no_clean(mut self, no_clean: bool) -> Self {
        self.no_clean = no_clean;
        self
    }

    /// Set the modification time of archive members.
    ///
    /// Defaults to the time of the build.
    pub fn set_mtime(mut self, time: Option<SystemTime>) -> Self {
        self.mtime = time;
        self
    }

    /// Create staging directories under `path` instead of the system temporary directory.
    pub fn set_staging_parent(mut self, path: Option<PathBuf>) -> Self {
        self.staging_parent = path;
        self
    }

    pub fn inputs(&self) -> &[PathBuf] {
        &self.inputs
    }

    pub fn outdir(&self) -> &Path {
        &self.outdir
    }
}

/// Result of a successful build.
#[derive(Clone, Debug)]
pub struct BuildOutput {
    /// The written package, or the output directory in ROM mode.
    pub path: PathBuf,
    /// Staging directory left in place when cleanup was disabled.
    pub staging_dir: Option<PathBuf>,
}

/// Result of validating inputs without building.
#[derive(Clone, Debug, Serialize)]
pub struct CheckSummary {
    pub app_id: Option<String>,
    pub package_id: String,
    pub package_version: String,
    pub services: Vec<String>,
}

/// Input directories sorted by role.
#[derive(Debug, Default)]
struct Inputs {
    app_dir: Option<PathBuf>,
    package_dirs: Vec<PathBuf>,
    /// Every input, searched for services.
    roots: Vec<PathBuf>,
}

fn classify_inputs(inputs: &[PathBuf], force: bool) -> Result<Inputs> {
    let mut classified = Inputs::default();
    let mut app_dirs = vec![];

    for input in inputs {
        let dir = input
            .canonicalize()
            .map_err(|_| IpkError::SourceNotFound(input.clone()))?;

        if dir.join(APPINFO_FILENAME).is_file() {
            app_dirs.push(dir.clone());
        } else if dir.join(PACKAGEINFO_FILENAME).is_file() {
            classified.package_dirs.push(dir.clone());
        }

        classified.roots.push(dir);
    }

    if app_dirs.len() > 1 {
        if !force {
            return Err(IpkError::MultipleApps(app_dirs));
        }
        warn!(
            "multiple applications found; packaging only {}",
            app_dirs[0].display()
        );
    }
    classified.app_dir = app_dirs.into_iter().next();

    Ok(classified)
}

/// Everything learned from the inputs before touching the filesystem.
#[derive(Debug)]
struct Prepared {
    app: Option<AppManifest>,
    package: PackageManifest,
    package_dirs: Vec<PathBuf>,
    services: Vec<ServiceDescriptor>,
    assets: Vec<FileEntry>,
    signing: Option<SigningConfig>,
}

fn prepare(request: &PackageRequest) -> Result<Prepared> {
    if request.pkgid.is_some() && request.pkginfofile.is_some() {
        return Err(IpkError::ConflictingOptions(
            "--pkgid and --pkginfofile cannot be used together",
        ));
    }

    let signing =
        SigningConfig::from_paths(request.sign_key.as_deref(), request.certificate.as_deref())?;

    let inputs = classify_inputs(&request.inputs, request.force)?;

    let app = match &inputs.app_dir {
        Some(dir) => {
            info!("loading application from {}", dir.display());
            let app = AppManifest::load(dir)?;
            app.check()?;
            check_account_templates(dir)?;
            Some(app)
        }
        None => None,
    };

    let package = if let Some(path) = &request.pkginfofile {
        PackageManifest::load(path)?
    } else if let Some(dir) = inputs.package_dirs.first() {
        PackageManifest::load(&dir.join(PACKAGEINFO_FILENAME))?
    } else if let Some(app) = &app {
        let existing = app.dir.join(PACKAGEINFO_FILENAME);
        if existing.is_file() {
            PackageManifest::load(&existing)?
        } else {
            PackageManifest::from_app(
                app,
                request.pkgid.as_deref(),
                request.pkgversion.as_deref(),
            )
        }
    } else if let Some(id) = &request.pkgid {
        PackageManifest::for_services(id, request.pkgversion.as_deref())
    } else {
        PackageManifest {
            id: String::new(),
            version: String::new(),
            app: None,
            services: vec![],
            extra: Default::default(),
        }
    };

    info!("discovering services");
    let services = discover_services(&inputs.roots, SERVICE_SEARCH_DEPTH)?
        .into_iter()
        .filter(|s| s.valid)
        .collect::<Vec<_>>();

    if app.is_none() && inputs.package_dirs.is_empty() && services.is_empty() {
        return Err(IpkError::NoPackageContent);
    }
    if package.id.is_empty() {
        return Err(IpkError::MissingPackageId);
    }
    package.check()?;

    for service in &services {
        check_account_templates(&service.source_dir)?;
    }
    check_service_info(&services, &package.id)?;

    let assets = match &app {
        Some(app) => resolve_assets(app)?,
        None => vec![],
    };

    Ok(Prepared {
        app,
        package,
        package_dirs: inputs.package_dirs,
        services,
        assets,
        signing,
    })
}

/// Validate the inputs of `request` without staging anything.
pub fn check_inputs(request: &PackageRequest) -> Result<CheckSummary> {
    let prepared = prepare(request)?;

    Ok(CheckSummary {
        app_id: prepared.app.as_ref().map(|a| a.id.clone()),
        package_id: prepared.package.id,
        package_version: prepared.package.version,
        services: prepared.services.into_iter().map(|s| s.id).collect(),
    })
}

/// Sets the process umask for the guard's lifetime.
#[cfg(unix)]
struct UmaskGuard {
    previous: libc::mode_t,
}

#[cfg(unix)]
impl UmaskGuard {
    fn set(mask: libc::mode_t) -> Self {
        // SAFETY: umask cannot fail.
        let previous = unsafe { libc::umask(mask) };
        Self { previous }
    }
}

#[cfg(unix)]
impl Drop for UmaskGuard {
    fn drop(&mut self) {
        unsafe {
            libc::umask(self.previous);
        }
    }
}

#[cfg(not(unix))]
struct UmaskGuard;

#[cfg(not(unix))]
impl UmaskGuard {
    fn set(_mask: u32) -> Self {
        Self
    }
}

/// A staging directory, removed on drop unless kept.
struct StagingDir {
    dir: Option<tempfile::TempDir>,
    path: PathBuf,
    keep: bool,
}

impl StagingDir {
    fn new(parent: &Path, keep: bool) -> Result<Self> {
        let dir = tempfile::Builder::new()
            .prefix("ipk-build-")
            .tempdir_in(parent)
            .with_path(parent)?;
        let path = dir.path().to_path_buf();
        debug!("staging in {}", path.display());

        Ok(Self {
            dir: Some(dir),
            path,
            keep,
        })
    }

    fn path(&self) -> &Path {
        &self.path
    }
}

impl Drop for StagingDir {
    fn drop(&mut self) {
        if let Some(dir) = self.dir.take() {
            if self.keep {
                let path = dir.keep();
                info!("keeping staging directory {}", path.display());
            }
        }
    }
}

/// State threaded through the staging stages.
struct BuildContext<'a> {
    request: &'a PackageRequest,
    prepared: Prepared,
    data_root: PathBuf,
    copier: Copier,
    excludes: Vec<glob::Pattern>,
    file_modes: BTreeMap<PathBuf, u32>,
    architecture: Option<String>,
}

impl<'a> BuildContext<'a> {
    fn app_stage_dir(&self) -> Option<PathBuf> {
        self.prepared
            .app
            .as_ref()
            .map(|app| self.data_root.join(APPLICATIONS_DIR).join(&app.id))
    }

    fn package_stage_dir(&self) -> PathBuf {
        self.data_root
            .join(PACKAGES_DIR)
            .join(&self.prepared.package.id)
    }

    fn add_excludes(&mut self) -> Result<()> {
        let mut patterns = STRAY_EXCLUDES
            .iter()
            .map(|s| s.to_string())
            .collect::<Vec<_>>();
        patterns.extend(self.request.exclude.iter().cloned());
        if let Some(app) = &self.prepared.app {
            patterns.extend(app.exclude.iter().cloned());
        }

        for pattern in patterns {
            self.excludes.push(glob::Pattern::new(&pattern)?);
        }

        Ok(())
    }

    fn write_package_info(&self) -> Result<()> {
        let dir = self.package_stage_dir();
        std::fs::create_dir_all(&dir).with_path(&dir)?;
        let path = self.prepared.package.write_to_dir(&dir)?;
        debug!("wrote {}", path.display());

        Ok(())
    }

    fn copy_app(&mut self) -> Result<()> {
        let (app_dir, dest) = match (&self.prepared.app, self.app_stage_dir()) {
            (Some(app), Some(dest)) => (app.dir.clone(), dest),
            _ => return Ok(()),
        };

        info!("copying application files");
        std::fs::create_dir_all(&dest).with_path(&dest)?;
        let entries = collect_files(&app_dir, &app_dir)?;
        self.copier.copy(&entries, &dest)
    }

    fn copy_services(&mut self) -> Result<()> {
        let services = self.prepared.services.clone();

        for service in &services {
            info!("copying service {}", service.id);
            let dest = self.data_root.join(SERVICES_DIR).join(&service.id);
            std::fs::create_dir_all(&dest).with_path(&dest)?;
            let entries = collect_files(&service.source_dir, &service.source_dir)?;
            self.copier.copy(&entries, &dest)?;

            if !self.prepared.package.services.contains(&service.id) {
                self.prepared.package.services.push(service.id.clone());
            }
        }

        Ok(())
    }

    /// Remove service trees copied along with the application.
    fn remove_nested_services(&self) -> Result<()> {
        let (app, app_stage) = match (&self.prepared.app, self.app_stage_dir()) {
            (Some(app), Some(dest)) => (app, dest),
            _ => return Ok(()),
        };

        for service in &self.prepared.services {
            if let Ok(rel) = service.source_dir.strip_prefix(&app.dir) {
                if rel.as_os_str().is_empty() {
                    continue;
                }
                let nested = app_stage.join(rel);
                if nested.is_dir() {
                    debug!("removing nested service {}", nested.display());
                    std::fs::remove_dir_all(&nested).with_path(&nested)?;
                }
            }
        }

        Ok(())
    }

    fn copy_assets(&mut self) -> Result<()> {
        if let Some(dest) = self.app_stage_dir() {
            let assets = self.prepared.assets.clone();
            self.copier.copy_remaining(&assets, &dest)?;
        }

        Ok(())
    }

    fn copy_package_dirs(&mut self) -> Result<()> {
        let dest = self.package_stage_dir();

        for dir in self.prepared.package_dirs.clone() {
            let entries = collect_files(&dir, &dir)?
                .into_iter()
                .filter(|e| e.relative_path != Path::new(PACKAGEINFO_FILENAME))
                .collect::<Vec<_>>();
            self.copier.copy(&entries, &dest)?;
        }

        Ok(())
    }

    fn load_file_modes(&mut self) -> Result<()> {
        let (app, app_rel) = match &self.prepared.app {
            Some(app) => (app, Path::new(APPLICATIONS_DIR).join(&app.id)),
            None => return Ok(()),
        };

        for (file, mode) in load_file_modes(&app.dir)? {
            debug!("mode {:o} for {}", mode, file);
            self.file_modes.insert(app_rel.join(file), mode);
        }

        Ok(())
    }

    /// Delete staged entries matching an exclude pattern.
    ///
    /// Patterns are matched against each entry's file name and against its
    /// path relative to the application, package or service directory it
    /// belongs to.
    fn apply_excludes(&self) -> Result<()> {
        let mut matched = vec![];

        for sub in [APPLICATIONS_DIR, PACKAGES_DIR, SERVICES_DIR] {
            let dir = self.data_root.join(sub);
            if !dir.is_dir() {
                continue;
            }

            for entry in walkdir::WalkDir::new(&dir).min_depth(2) {
                let entry = entry?;
                let rel = entry.path().strip_prefix(&dir)?;
                let rel = rel.components().skip(1).collect::<PathBuf>();
                let rel = rel.to_string_lossy();
                let name = entry.file_name().to_string_lossy();

                if self
                    .excludes
                    .iter()
                    .any(|p| p.matches(&rel) || p.matches(&name))
                {
                    matched.push((entry.path().to_path_buf(), entry.file_type().is_dir()));
                }
            }
        }

        for (path, is_dir) in matched {
            if path.symlink_metadata().is_err() {
                continue;
            }
            debug!("excluding {}", path.display());
            if is_dir {
                std::fs::remove_dir_all(&path).with_path(&path)?;
            } else {
                std::fs::remove_file(&path).with_path(&path)?;
            }
        }

        Ok(())
    }

    fn tag_architecture(&mut self) {
        let main = match (&self.prepared.app, self.app_stage_dir()) {
            (Some(app), Some(dest)) => app.main.as_ref().map(|m| dest.join(m)),
            _ => None,
        };

        if let Some(main) = main.filter(|p| p.is_file()) {
            self.architecture = detect_architecture(&main);
            if let Some(arch) = &self.architecture {
                info!("detected architecture {}", arch);
            }
        }
    }

    fn meta(&self) -> PackageMeta {
        PackageMeta {
            name: self.prepared.package.id.clone(),
            version: self.prepared.package.version.clone(),
            architecture: self.architecture.clone(),
        }
    }

    /// Populate the data tree.
    fn stage(&mut self) -> Result<()> {
        let _umask = UmaskGuard::set(0);

        self.add_excludes()?;
        std::fs::create_dir_all(self.package_stage_dir()).with_path(self.package_stage_dir())?;
        self.write_package_info()?;
        self.copy_app()?;
        self.copy_services()?;
        self.write_package_info()?;
        self.remove_nested_services()?;
        self.copy_assets()?;
        self.copy_package_dirs()?;
        self.load_file_modes()?;
        apply_modes(&self.data_root, &self.file_modes)?;
        self.apply_excludes()?;
        self.tag_architecture();

        Ok(())
    }
}

/// Move `from` over `to`, leaving any existing `to` intact on failure.
fn move_file(from: &Path, to: &Path) -> Result<()> {
    if std::fs::rename(from, to).is_ok() {
        return Ok(());
    }

    // Likely a cross-device move. Copy next to the destination first so the
    // final replacement is still a rename.
    let parent = to.parent().unwrap_or_else(|| Path::new("."));
    let partial = tempfile::Builder::new()
        .prefix(".ipk-partial-")
        .tempfile_in(parent)
        .with_path(parent)?;
    let mut source = std::fs::File::open(from).with_path(from)?;
    std::io::copy(&mut source, &mut partial.as_file()).with_path(partial.path())?;
    partial.persist(to).map_err(|e| IpkError::IoPath(to.to_path_buf(), e.error))?;
    std::fs::remove_file(from).with_path(from)?;

    Ok(())
}

/// Builds a package from a frozen [PackageRequest].
#[derive(Clone, Debug)]
pub struct PackageBuilder {
    request: PackageRequest,
}

impl PackageBuilder {
    pub fn new(request: PackageRequest) -> Self {
        Self { request }
    }

    pub fn request(&self) -> &PackageRequest {
        &self.request
    }

    /// Run the build.
    pub fn build(&self) -> Result<BuildOutput> {
        let request = &self.request;
        let prepared = prepare(request)?;

        let parent = request
            .staging_parent
            .clone()
            .unwrap_or_else(std::env::temp_dir);
        let staging = StagingDir::new(&parent, request.no_clean)?;

        let mut ctx = BuildContext {
            request,
            prepared,
            data_root: staging.path().join("data"),
            copier: Copier::new(request.minify),
            excludes: vec![],
            file_modes: BTreeMap::new(),
            architecture: None,
        };

        ctx.stage()?;

        std::fs::create_dir_all(&request.outdir).with_path(&request.outdir)?;

        let path = if request.rom {
            if request.encrypt {
                warn!("encryption is not applied to ROM output");
            }
            info!("copying staged tree to {}", request.outdir.display());
            let entries = collect_files(&ctx.data_root, &ctx.data_root)?;
            Copier::new(false).copy(&entries, &request.outdir)?;
            request.outdir.clone()
        } else {
            let meta = ctx.meta();
            let options = AssembleOptions {
                signing: ctx.prepared.signing.clone(),
                file_modes: ctx.file_modes.clone(),
                mtime: request.mtime,
            };
            let plain = assemble(&ctx.data_root, &meta, staging.path(), &options)?;

            if request.encrypt {
                encrypt_package(
                    &plain,
                    request.encrypt_key.as_deref(),
                    &meta,
                    &request.outdir,
                    request.mtime,
                )?
            } else {
                let dest = request.outdir.join(meta.file_name());
                move_file(&plain, &dest)?;
                dest
            }
        };

        info!("created {}", path.display());

        Ok(BuildOutput {
            path,
            staging_dir: if request.no_clean {
                Some(staging.path().to_path_buf())
            } else {
                None
            },
        })
    }
}

#[cfg(test)]
mod tests {
    use {
        super::*,
        crate::{control::ControlFile, inspect::analyze, signing::SIGNATURE_FILENAME},
        std::{collections::HashMap, io::Read},
    };

    fn testdata(name: &str) -> PathBuf {
        Path::new(env!("CARGO_MANIFEST_DIR"))
            .join("testdata")
            .join(name)
    }

    fn write_app(dir: &Path, id: &str) -> Result<()> {
        std::fs::create_dir_all(dir)?;
        std::fs::write(
            dir.join(APPINFO_FILENAME),
            format!(
                r#"{{"id": "{}", "version": "1.0.0", "type": "web", "main": "index.html"}}"#,
                id
            ),
        )?;
        std::fs::write(dir.join("index.html"), "<html></html>")?;

        Ok(())
    }

    fn write_service(dir: &Path, id: &str) -> Result<()> {
        std::fs::create_dir_all(dir)?;
        std::fs::write(
            dir.join("services.json"),
            format!(r#"{{"id": "{0}", "services": [{{"name": "{0}"}}]}}"#, id),
        )?;
        std::fs::write(dir.join("service.js"), "var service = 1;")?;

        Ok(())
    }

    fn ar_members(path: &Path) -> Result<HashMap<String, Vec<u8>>> {
        let mut archive = ar::Archive::new(std::fs::File::open(path)?);
        let mut members = HashMap::new();
        while let Some(entry) = archive.next_entry() {
            let mut entry = entry?;
            let name = String::from_utf8_lossy(entry.header().identifier()).to_string();
            let mut data = vec![];
            entry.read_to_end(&mut data)?;
            members.insert(name, data);
        }
        Ok(members)
    }

    fn tar_files(gz: &[u8]) -> Result<HashMap<String, (u32, Vec<u8>)>> {
        let decoder = libflate::gzip::Decoder::new(std::io::Cursor::new(gz))?;
        let mut archive = tar::Archive::new(decoder);
        let mut files = HashMap::new();
        for entry in archive.entries()? {
            let mut entry = entry?;
            let name = String::from_utf8_lossy(&entry.path_bytes()).to_string();
            let mode = entry.header().mode()?;
            let mut data = vec![];
            entry.read_to_end(&mut data)?;
            files.insert(name, (mode, data));
        }
        Ok(files)
    }

    #[test]
    fn web_app_package() -> Result<()> {
        let td = tempfile::tempdir()?;
        let app = td.path().join("app");
        write_app(&app, "com.test.app")?;
        let out = td.path().join("out");

        let output = PackageBuilder::new(PackageRequest::new(vec![app], &out)).build()?;
        assert_eq!(output.path, out.join("com.test.app_1.0.0_all.ipk"));
        assert!(output.path.is_file());
        assert!(output.staging_dir.is_none());

        let report = analyze(&output.path, false)?;
        let lines = report.lines().collect::<Vec<_>>();
        assert!(lines.contains(&"Package: com.test.app"), "{}", report);
        assert!(lines.contains(&"Version: 1.0.0"), "{}", report);

        let members = ar_members(&output.path)?;
        let data = tar_files(&members["data.tar.gz"])?;
        assert!(data.contains_key("./usr/palm/applications/com.test.app/index.html"));
        let (_, info) = &data["./usr/palm/packages/com.test.app/packageinfo.json"];
        let info: serde_json::Value = serde_json::from_slice(info).unwrap();
        assert_eq!(info["app"], "com.test.app");

        Ok(())
    }

    #[test]
    fn pkgversion_overrides_synthesized_info() -> Result<()> {
        let td = tempfile::tempdir()?;
        let app = td.path().join("app");
        write_app(&app, "com.test.app")?;
        let out = td.path().join("out");

        let request = PackageRequest::new(vec![app], &out)
            .set_pkgid(Some("com.test.pkg".into()))
            .set_pkgversion(Some("2.1.0".into()));
        let output = PackageBuilder::new(request).build()?;
        assert_eq!(output.path, out.join("com.test.pkg_2.1.0_all.ipk"));

        Ok(())
    }

    #[test]
    fn signed_package() -> Result<()> {
        let td = tempfile::tempdir()?;
        let app = td.path().join("app");
        write_app(&app, "com.test.app")?;
        let out = td.path().join("out");

        let request = PackageRequest::new(vec![app], &out).set_signing(
            Some(testdata("sign-key.pem")),
            Some(testdata("sign-cert.pem")),
        );
        let output = PackageBuilder::new(request).build()?;
        assert_eq!(output.path, out.join("com.test.app_1.0.0_all.ipk"));

        let members = ar_members(&output.path)?;
        let control = tar_files(&members["control.tar.gz"])?;
        assert!(control.contains_key(&format!("./{}", SIGNATURE_FILENAME)));
        assert!(control.contains_key("./sign-cert.pem"));

        Ok(())
    }

    #[test]
    fn incomplete_signing_is_rejected() -> Result<()> {
        let td = tempfile::tempdir()?;
        let app = td.path().join("app");
        write_app(&app, "com.test.app")?;

        let request = PackageRequest::new(vec![app], td.path().join("out"))
            .set_signing(Some(testdata("sign-key.pem")), None);
        assert!(matches!(
            PackageBuilder::new(request).build(),
            Err(IpkError::IncompleteSigningConfig)
        ));

        Ok(())
    }

    #[test]
    fn exclude_pattern() -> Result<()> {
        let td = tempfile::tempdir()?;
        let app = td.path().join("app");
        write_app(&app, "com.test.app")?;
        std::fs::write(app.join("tmpFile"), "scratch")?;
        std::fs::write(app.join("old.ipk"), "stale")?;
        std::fs::create_dir_all(app.join("sub"))?;
        std::fs::write(app.join("sub/tmpFile"), "scratch")?;
        let out = td.path().join("out");

        let request = PackageRequest::new(vec![app], &out).add_exclude("tmpFile");
        let output = PackageBuilder::new(request).build()?;

        let members = ar_members(&output.path)?;
        let data = tar_files(&members["data.tar.gz"])?;
        assert!(data.contains_key("./usr/palm/applications/com.test.app/index.html"));
        assert!(data.keys().all(|k| !k.ends_with("tmpFile")), "{:?}", data.keys());
        assert!(data.keys().all(|k| !k.ends_with(".ipk")));

        Ok(())
    }

    #[test]
    fn multiple_apps_fail_before_staging() -> Result<()> {
        let td = tempfile::tempdir()?;
        let first = td.path().join("first");
        let second = td.path().join("second");
        write_app(&first, "com.test.first")?;
        write_app(&second, "com.test.second")?;
        let staging = td.path().join("staging");
        std::fs::create_dir_all(&staging)?;

        let request = PackageRequest::new(vec![first, second], td.path().join("out"))
            .set_staging_parent(Some(staging.clone()));
        match PackageBuilder::new(request.clone()).build() {
            Err(IpkError::MultipleApps(dirs)) => assert_eq!(dirs.len(), 2),
            other => panic!("unexpected result: {:?}", other),
        }
        assert_eq!(std::fs::read_dir(&staging)?.count(), 0);
        assert!(!td.path().join("out").exists());

        let output = PackageBuilder::new(request.set_force(true)).build()?;
        assert!(output.path.ends_with("com.test.first_1.0.0_all.ipk"));
        assert_eq!(std::fs::read_dir(&staging)?.count(), 0);

        Ok(())
    }

    #[test]
    fn staging_removed_on_failure() -> Result<()> {
        let td = tempfile::tempdir()?;
        let app = td.path().join("app");
        write_app(&app, "com.test.app")?;
        let staging = td.path().join("staging");
        std::fs::create_dir_all(&staging)?;

        let request = PackageRequest::new(vec![app], td.path().join("out"))
            .add_exclude("[")
            .set_staging_parent(Some(staging.clone()));
        assert!(matches!(
            PackageBuilder::new(request).build(),
            Err(IpkError::Pattern(_))
        ));
        assert_eq!(std::fs::read_dir(&staging)?.count(), 0);

        Ok(())
    }

    #[test]
    fn no_clean_keeps_staging() -> Result<()> {
        let td = tempfile::tempdir()?;
        let app = td.path().join("app");
        write_app(&app, "com.test.app")?;
        let staging = td.path().join("staging");
        std::fs::create_dir_all(&staging)?;

        let request = PackageRequest::new(vec![app], td.path().join("out"))
            .set_no_clean(true)
            .set_staging_parent(Some(staging));
        let output = PackageBuilder::new(request).build()?;

        let kept = output.staging_dir.expect("staging directory should be reported");
        assert!(kept
            .join("data/usr/palm/applications/com.test.app/appinfo.json")
            .is_file());

        Ok(())
    }

    #[test]
    fn services_are_staged_separately() -> Result<()> {
        let td = tempfile::tempdir()?;
        let app = td.path().join("app");
        write_app(&app, "com.test.app")?;
        write_service(&app.join("services/helper"), "com.test.app.helper")?;
        let out = td.path().join("out");

        let request = PackageRequest::new(vec![app], &out).set_rom(true);
        let output = PackageBuilder::new(request).build()?;
        assert_eq!(output.path, out);

        let palm = out.join("usr/palm");
        assert!(palm
            .join("services/com.test.app.helper/services.json")
            .is_file());
        assert!(!palm
            .join("applications/com.test.app/services/helper")
            .exists());
        assert!(palm.join("applications/com.test.app/index.html").is_file());

        let info: serde_json::Value = serde_json::from_slice(&std::fs::read(
            palm.join("packages/com.test.app").join(PACKAGEINFO_FILENAME),
        )?)
        .unwrap();
        assert_eq!(info["services"][0], "com.test.app.helper");

        Ok(())
    }

    #[test]
    fn move_file_replaces_destination() -> Result<()> {
        let td = tempfile::tempdir()?;
        let from = td.path().join("new.ipk");
        let to = td.path().join("pkg.ipk");
        std::fs::write(&from, "new")?;
        std::fs::write(&to, "old")?;

        move_file(&from, &to)?;
        assert_eq!(std::fs::read_to_string(&to)?, "new");
        assert!(!from.exists());

        Ok(())
    }

    #[test]
    fn failed_move_keeps_existing_package() -> Result<()> {
        let td = tempfile::tempdir()?;
        let to = td.path().join("pkg.ipk");
        std::fs::write(&to, "old")?;

        assert!(move_file(&td.path().join("missing.ipk"), &to).is_err());
        assert_eq!(std::fs::read_to_string(&to)?, "old");
        assert_eq!(std::fs::read_dir(td.path())?.count(), 1);

        Ok(())
    }

    #[cfg(unix)]
    #[test]
    fn rom_output_carries_file_modes() -> Result<()> {
        use std::os::unix::fs::PermissionsExt;

        let td = tempfile::tempdir()?;
        let app = td.path().join("app");
        write_app(&app, "com.test.app")?;
        std::fs::create_dir_all(app.join("bin"))?;
        std::fs::write(app.join("bin/run"), "#!/bin/sh\n")?;
        std::fs::set_permissions(app.join("bin/run"), std::fs::Permissions::from_mode(0o644))?;
        std::fs::write(app.join("private.txt"), "x")?;
        std::fs::set_permissions(
            app.join("private.txt"),
            std::fs::Permissions::from_mode(0o600),
        )?;
        std::fs::write(app.join("package.properties"), "filemode.755 = bin/run\n")?;
        let out = td.path().join("out");

        let request = PackageRequest::new(vec![app], &out).set_rom(true);
        PackageBuilder::new(request).build()?;

        let staged = out.join("usr/palm/applications/com.test.app");
        let mode = |rel: &str| -> Result<u32> {
            Ok(std::fs::metadata(staged.join(rel))?.permissions().mode() & 0o7777)
        };
        assert_eq!(mode("bin/run")?, 0o755);
        assert_eq!(mode("private.txt")?, 0o604);

        Ok(())
    }

    #[cfg(unix)]
    #[test]
    fn symlink_to_ancestor_fails_cleanly() -> Result<()> {
        let td = tempfile::tempdir()?;
        let app = td.path().join("app");
        write_app(&app, "com.test.app")?;
        std::os::unix::fs::symlink(td.path(), app.join("up"))?;
        let staging = td.path().join("staging");
        std::fs::create_dir_all(&staging)?;

        let request = PackageRequest::new(vec![app], td.path().join("out"))
            .set_staging_parent(Some(staging.clone()));
        assert!(matches!(
            PackageBuilder::new(request).build(),
            Err(IpkError::SymlinkCycle { .. })
        ));
        assert_eq!(std::fs::read_dir(&staging)?.count(), 0);

        Ok(())
    }

    #[test]
    fn service_outside_namespace_is_rejected() -> Result<()> {
        let td = tempfile::tempdir()?;
        let app = td.path().join("app");
        let service = td.path().join("service");
        write_app(&app, "com.example.app")?;
        write_service(&service, "com.other.service")?;

        let request = PackageRequest::new(vec![app, service], td.path().join("out"));
        assert!(matches!(
            PackageBuilder::new(request).build(),
            Err(IpkError::ServiceIdMismatch { .. })
        ));

        Ok(())
    }

    #[test]
    fn services_only_package() -> Result<()> {
        let td = tempfile::tempdir()?;
        let service = td.path().join("service");
        write_service(&service, "com.test.pkg.service")?;
        let out = td.path().join("out");

        let request = PackageRequest::new(vec![service.clone()], &out);
        assert!(matches!(
            PackageBuilder::new(request).build(),
            Err(IpkError::MissingPackageId)
        ));

        let request =
            PackageRequest::new(vec![service], &out).set_pkgid(Some("com.test.pkg".into()));
        let output = PackageBuilder::new(request).build()?;
        assert_eq!(output.path, out.join("com.test.pkg_1.0.0_all.ipk"));

        let members = ar_members(&output.path)?;
        let data = tar_files(&members["data.tar.gz"])?;
        assert!(data.contains_key("./usr/palm/services/com.test.pkg.service/service.js"));

        Ok(())
    }

    #[test]
    fn pkgid_conflicts_with_pkginfofile() -> Result<()> {
        let td = tempfile::tempdir()?;
        let app = td.path().join("app");
        write_app(&app, "com.test.app")?;

        let request = PackageRequest::new(vec![app], td.path().join("out"))
            .set_pkgid(Some("com.test.app".into()))
            .set_pkginfofile(Some(td.path().join("packageinfo.json")));
        assert!(matches!(
            PackageBuilder::new(request).build(),
            Err(IpkError::ConflictingOptions(_))
        ));

        Ok(())
    }

    #[test]
    fn minify_and_file_modes() -> Result<()> {
        let td = tempfile::tempdir()?;
        let app = td.path().join("app");
        write_app(&app, "com.test.app")?;
        std::fs::write(app.join("app.js"), "// remove me\nvar answer = 42;\n")?;
        std::fs::create_dir_all(app.join("node_modules/dep"))?;
        std::fs::write(app.join("node_modules/dep/index.js"), "// keep me\n")?;
        std::fs::create_dir_all(app.join("bin"))?;
        std::fs::write(app.join("bin/run"), "#!/bin/sh\n")?;
        std::fs::write(app.join("package.properties"), "filemode.755 = bin/run\n")?;
        let out = td.path().join("out");

        let output = PackageBuilder::new(PackageRequest::new(vec![app], &out)).build()?;
        let members = ar_members(&output.path)?;
        let data = tar_files(&members["data.tar.gz"])?;
        let prefix = "./usr/palm/applications/com.test.app";

        let (_, js) = &data[&format!("{}/app.js", prefix)];
        let js = String::from_utf8_lossy(js);
        assert!(!js.contains("remove me"), "{}", js);
        assert!(js.contains("42"));

        let (_, dep) = &data[&format!("{}/node_modules/dep/index.js", prefix)];
        assert_eq!(dep.as_slice(), b"// keep me\n");

        let (mode, _) = &data[&format!("{}/bin/run", prefix)];
        assert_eq!(*mode, 0o755);

        Ok(())
    }

    #[test]
    fn encrypted_package() -> Result<()> {
        let td = tempfile::tempdir()?;
        let app = td.path().join("app");
        write_app(&app, "com.test.app")?;
        let out = td.path().join("out");

        let request = PackageRequest::new(vec![app], &out).set_encrypt(true);
        let output = PackageBuilder::new(request).build()?;
        assert_eq!(output.path, out.join("com.test.app_1.0.0_all.ipk"));

        let members = ar_members(&output.path)?;
        let control = tar_files(&members["control.tar.gz"])?;
        assert!(control.contains_key("./key"));
        assert!(control.contains_key("./iv"));
        let (_, control) = &control["./control"];
        let control = ControlFile::parse(&String::from_utf8_lossy(control));
        assert_eq!(control.field("Encrypt-Algorithm"), Some("AES-256-CBC"));

        Ok(())
    }

    #[test]
    fn check_reports_without_staging() -> Result<()> {
        let td = tempfile::tempdir()?;
        let app = td.path().join("app");
        write_app(&app, "com.test.app")?;
        write_service(&app.join("svc"), "com.test.app.svc")?;

        let summary = check_inputs(&PackageRequest::new(vec![app], td.path().join("out")))?;
        assert_eq!(summary.app_id.as_deref(), Some("com.test.app"));
        assert_eq!(summary.package_id, "com.test.app");
        assert_eq!(summary.package_version, "1.0.0");
        assert_eq!(summary.services, vec!["com.test.app.svc".to_string()]);
        assert!(!td.path().join("out").exists());

        Ok(())
    }

    #[test]
    fn missing_input() {
        let request = PackageRequest::new(vec![PathBuf::from("/nonexistent/app")], "out");
        assert!(matches!(
            PackageBuilder::new(request).build(),
            Err(IpkError::SourceNotFound(_))
        ));
    }
}
