// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

/*! Loading and validating `appinfo.json`, `packageinfo.json` and `services.json`.

Manifests come from arbitrary editors and locales. Raw bytes are charset
detected and transcoded to UTF-8, with any byte order mark removed, before
being parsed as JSON.
*/

use {
    crate::error::{IoResultExt, IpkError, Result},
    jsonschema::JSONSchema,
    log::{debug, warn},
    once_cell::sync::Lazy,
    regex::Regex,
    serde_json::{Map, Value},
    std::path::{Path, PathBuf},
};

pub const APPINFO_FILENAME: &str = "appinfo.json";
pub const PACKAGEINFO_FILENAME: &str = "packageinfo.json";
pub const SERVICES_FILENAME: &str = "services.json";
pub const ACCOUNT_TEMPLATES_FILENAME: &str = "account-templates.json";

/// Version assumed when `appinfo.json` does not declare one.
pub const DEFAULT_VERSION: &str = "1.0.0";

static ID_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^[a-z0-9.+-]*$").expect("id regex should compile"));

static VERSION_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"^(\d|[1-9]\d{0,8})\.(\d|[1-9]\d{0,8})\.(\d|[1-9]\d{0,8})$")
        .expect("version regex should compile")
});

static LEGACY_SCRIPT_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r#"(?is)<script[^>]*\ssrc\s*=\s*["'][^"']*enyo\.js["'][^>]*>"#)
        .expect("legacy script regex should compile")
});

static APP_SCHEMA: Lazy<Value> = Lazy::new(|| {
    serde_json::from_str(include_str!(
        "../schema/ApplicationDescription.schema.json"
    ))
    .expect("bundled schema should be valid JSON")
});

/// Decode manifest bytes to a UTF-8 string.
///
/// A byte order mark selects the encoding. Otherwise valid UTF-8 is taken as
/// is and anything else goes through charset detection.
pub fn decode_text(data: &[u8]) -> String {
    if let Some((encoding, bom_len)) = encoding_rs::Encoding::for_bom(data) {
        let (text, _) = encoding.decode_without_bom_handling(&data[bom_len..]);
        return text.into_owned();
    }

    if let Ok(text) = std::str::from_utf8(data) {
        return text.to_string();
    }

    let mut detector = chardetng::EncodingDetector::new();
    detector.feed(data, true);
    let encoding = detector.guess(None, true);
    debug!("manifest charset detected as {}", encoding.name());
    let (text, _) = encoding.decode_without_bom_handling(data);

    text.into_owned()
}

/// Read a JSON file, normalizing its encoding first.
pub fn read_json_file(path: &Path) -> Result<Value> {
    let data = std::fs::read(path).with_path(path)?;
    let text = decode_text(&data);

    serde_json::from_str(&text).map_err(|e| IpkError::InvalidJson(path.to_path_buf(), e))
}

/// Ensure an identifier satisfies the id grammar.
pub fn validate_id(id: &str) -> Result<()> {
    if id.is_empty() || !ID_RE.is_match(id) {
        Err(IpkError::InvalidIdRule(id.to_string()))
    } else {
        Ok(())
    }
}

/// Ensure a version satisfies the `major.minor.patch` grammar.
pub fn validate_version(version: &str) -> Result<()> {
    if VERSION_RE.is_match(version) {
        Ok(())
    } else {
        Err(IpkError::InvalidVersionRule(version.to_string()))
    }
}

fn string_field(value: &Value, field: &str) -> Option<String> {
    value.get(field).and_then(Value::as_str).map(str::to_string)
}

/// Application type declared by `appinfo.json`.
#[derive(Clone, Debug, Eq, PartialEq)]
pub enum AppType {
    Web,
    Stub,
    Native,
    NativeBuiltin,
    NativeAppshell,
    Qml,
    /// Legacy type exempt from schema validation.
    Clock,
    Other(String),
}

impl AppType {
    pub fn from_manifest(s: &str) -> Self {
        match s {
            "web" => Self::Web,
            "stub" => Self::Stub,
            "native" => Self::Native,
            "native_builtin" => Self::NativeBuiltin,
            "native_appshell" => Self::NativeAppshell,
            "qml" => Self::Qml,
            "clock" => Self::Clock,
            other => Self::Other(other.to_string()),
        }
    }

    /// Whether the `main` entry of this type is a compiled binary.
    pub fn is_native(&self) -> bool {
        matches!(
            self,
            Self::Native | Self::NativeBuiltin | Self::NativeAppshell
        )
    }
}

/// Parsed `appinfo.json`.
#[derive(Clone, Debug)]
pub struct AppManifest {
    /// Directory holding the manifest.
    pub dir: PathBuf,
    pub id: String,
    pub version: String,
    pub app_type: Option<AppType>,
    pub main: Option<String>,
    pub title: Option<String>,
    pub vendor: Option<String>,
    /// Extra exclude patterns declared by the application.
    pub exclude: Vec<String>,
    /// The full document, with defaults applied.
    pub raw: Value,
}

impl AppManifest {
    /// Load `appinfo.json` from a directory.
    ///
    /// A missing `version` defaults to [DEFAULT_VERSION]. A missing `id` is
    /// reported by [Self::check] rather than here.
    pub fn load(dir: &Path) -> Result<Self> {
        let path = dir.join(APPINFO_FILENAME);
        let mut raw = read_json_file(&path)?;

        if let Some(obj) = raw.as_object_mut() {
            if !obj.contains_key("version") {
                obj.insert("version".into(), Value::String(DEFAULT_VERSION.into()));
            }
        }

        Ok(Self {
            dir: dir.to_path_buf(),
            id: string_field(&raw, "id").unwrap_or_default(),
            version: string_field(&raw, "version").unwrap_or_else(|| DEFAULT_VERSION.into()),
            app_type: string_field(&raw, "type").map(|t| AppType::from_manifest(&t)),
            main: string_field(&raw, "main"),
            title: string_field(&raw, "title"),
            vendor: string_field(&raw, "vendor"),
            exclude: raw
                .get("exclude")
                .and_then(Value::as_array)
                .map(|a| {
                    a.iter()
                        .filter_map(Value::as_str)
                        .map(str::to_string)
                        .collect()
                })
                .unwrap_or_default(),
            raw,
        })
    }

    /// Path to the `main` entry, if declared.
    pub fn main_path(&self) -> Option<PathBuf> {
        self.main.as_ref().map(|m| self.dir.join(m))
    }

    /// Validate the manifest.
    ///
    /// Required fields and the id and version grammars are checked first.
    /// Legacy framework applications are rejected. Everything except `clock`
    /// applications is then validated against the bundled schema, with all
    /// violations reported together.
    pub fn check(&self) -> Result<()> {
        if self.raw.get("id").is_none() {
            return Err(IpkError::RequiredField {
                file: APPINFO_FILENAME.into(),
                field: "id",
            });
        }
        validate_id(&self.id)?;
        validate_version(&self.version)?;

        self.check_legacy_framework()?;

        if self.app_type == Some(AppType::Clock) {
            debug!("skipping schema validation for clock application");
            return Ok(());
        }

        validate_app_schema(&self.raw)
    }

    fn check_legacy_framework(&self) -> Result<()> {
        if !self.dir.join("package.js").is_file() {
            return Ok(());
        }

        let main = match self.main_path() {
            Some(p)
                if p.extension()
                    .map(|e| e.eq_ignore_ascii_case("html") || e.eq_ignore_ascii_case("htm"))
                    .unwrap_or(false) =>
            {
                p
            }
            _ => return Ok(()),
        };

        let data = match std::fs::read(&main) {
            Ok(data) => data,
            Err(_) => return Ok(()),
        };

        if LEGACY_SCRIPT_RE.is_match(&decode_text(&data)) {
            Err(IpkError::UnsupportedLegacyFramework(self.dir.clone()))
        } else {
            Ok(())
        }
    }
}

/// Validate an application description against the bundled schema.
pub fn validate_app_schema(instance: &Value) -> Result<()> {
    let schema = JSONSchema::compile(&APP_SCHEMA)
        .map_err(|e| IpkError::SchemaViolation(format!("invalid bundled schema: {}", e)))?;

    let result = schema.validate(instance);

    if let Err(errors) = result {
        let lines = errors
            .map(|e| {
                let location = e
                    .instance_path
                    .to_string()
                    .trim_start_matches('/')
                    .replace('/', ".");
                if location.is_empty() {
                    e.to_string()
                } else {
                    format!("{} {}", location, e)
                }
            })
            .collect::<Vec<_>>();

        return Err(IpkError::SchemaViolation(lines.join("\n")));
    }

    Ok(())
}

/// Parsed `packageinfo.json`.
#[derive(Clone, Debug)]
pub struct PackageManifest {
    pub id: String,
    pub version: String,
    /// Id of the application this package carries.
    pub app: Option<String>,
    /// Service ids, recorded while staging.
    pub services: Vec<String>,
    /// Remaining fields, preserved on write.
    pub extra: Map<String, Value>,
}

impl PackageManifest {
    /// Load a `packageinfo.json` file.
    pub fn load(path: &Path) -> Result<Self> {
        let raw = read_json_file(path)?;
        let file = path.display().to_string();

        let mut extra = match raw {
            Value::Object(map) => map,
            _ => Map::new(),
        };

        let id = match extra.remove("id") {
            Some(Value::String(s)) => s,
            _ => {
                return Err(IpkError::RequiredField { file, field: "id" });
            }
        };
        let version = match extra.remove("version") {
            Some(Value::String(s)) => s,
            _ => DEFAULT_VERSION.to_string(),
        };
        let app = match extra.remove("app") {
            Some(Value::String(s)) => Some(s),
            _ => None,
        };
        let services = match extra.remove("services") {
            Some(Value::Array(a)) => a
                .into_iter()
                .filter_map(|v| v.as_str().map(str::to_string))
                .collect(),
            _ => vec![],
        };

        Ok(Self {
            id,
            version,
            app,
            services,
            extra,
        })
    }

    /// Synthesize package info for an application.
    pub fn from_app(app: &AppManifest, id: Option<&str>, version: Option<&str>) -> Self {
        let mut extra = Map::new();
        if let Some(title) = &app.title {
            extra.insert("loc_name".into(), Value::String(title.clone()));
        }
        if let Some(vendor) = &app.vendor {
            extra.insert("vendor".into(), Value::String(vendor.clone()));
        }

        Self {
            id: id.unwrap_or(&app.id).to_string(),
            version: version.unwrap_or(&app.version).to_string(),
            app: Some(app.id.clone()),
            services: vec![],
            extra,
        }
    }

    /// Synthesize package info for a services-only package.
    pub fn for_services(id: &str, version: Option<&str>) -> Self {
        Self {
            id: id.to_string(),
            version: version.unwrap_or(DEFAULT_VERSION).to_string(),
            app: None,
            services: vec![],
            extra: Map::new(),
        }
    }

    pub fn check(&self) -> Result<()> {
        validate_id(&self.id)?;
        validate_version(&self.version)
    }

    /// Serialize to the on-device JSON representation.
    pub fn to_json(&self) -> Value {
        let mut map = self.extra.clone();
        map.insert("id".into(), Value::String(self.id.clone()));
        map.insert("version".into(), Value::String(self.version.clone()));
        if let Some(app) = &self.app {
            map.insert("app".into(), Value::String(app.clone()));
        }
        if !self.services.is_empty() {
            map.insert(
                "services".into(),
                Value::Array(
                    self.services
                        .iter()
                        .map(|s| Value::String(s.clone()))
                        .collect(),
                ),
            );
        }

        Value::Object(map)
    }

    /// Write `packageinfo.json` into a directory.
    pub fn write_to_dir(&self, dir: &Path) -> Result<PathBuf> {
        let path = dir.join(PACKAGEINFO_FILENAME);
        let data = serde_json::to_vec_pretty(&self.to_json())
            .map_err(|e| IpkError::InvalidJson(path.clone(), e))?;
        std::fs::write(&path, data).with_path(&path)?;

        Ok(path)
    }
}

/// One discovered `services.json`.
#[derive(Clone, Debug)]
pub struct ServiceDescriptor {
    /// Directory holding `services.json`.
    pub source_dir: PathBuf,
    /// Declared service id.
    pub id: String,
    /// Names from the `services[]` array, in declaration order.
    pub service_names: Vec<String>,
    /// False when required fields are missing.
    pub valid: bool,
    pub raw: Value,
}

impl ServiceDescriptor {
    /// Load `services.json` from a directory.
    ///
    /// Missing fields mark the descriptor invalid rather than failing.
    pub fn load(dir: &Path) -> Result<Self> {
        let raw = read_json_file(&dir.join(SERVICES_FILENAME))?;

        let id = string_field(&raw, "id").unwrap_or_default();
        let service_names = raw
            .get("services")
            .and_then(Value::as_array)
            .map(|a| {
                a.iter()
                    .filter_map(|s| s.get("name").and_then(Value::as_str))
                    .map(str::to_string)
                    .collect::<Vec<_>>()
            })
            .unwrap_or_default();

        let valid = !id.is_empty() && !service_names.is_empty();
        if !valid {
            warn!(
                "ignoring {}: \"id\" and \"services[].name\" are required",
                dir.join(SERVICES_FILENAME).display()
            );
        }

        Ok(Self {
            source_dir: dir.to_path_buf(),
            id,
            service_names,
            valid,
            raw,
        })
    }
}

/// Ensure every valid service is namespaced under the package id.
///
/// The first declared service name of each service must start with
/// `<package_id>.`. Any mismatch fails the whole build.
pub fn check_service_info(services: &[ServiceDescriptor], package_id: &str) -> Result<()> {
    let prefix = format!("{}.", package_id);

    for service in services.iter().filter(|s| s.valid) {
        validate_id(&service.id)?;

        let name = service.service_names.first().unwrap_or(&service.id);
        if !name.starts_with(&prefix) {
            return Err(IpkError::ServiceIdMismatch {
                service: name.clone(),
                package_id: package_id.to_string(),
            });
        }
    }

    Ok(())
}

/// Reject directories holding `account-templates.json`.
pub fn check_account_templates(dir: &Path) -> Result<()> {
    if dir.join(ACCOUNT_TEMPLATES_FILENAME).exists() {
        Err(IpkError::AccountTemplatesUnsupported(dir.to_path_buf()))
    } else {
        Ok(())
    }
}
