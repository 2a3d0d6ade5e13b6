use regex::Regex;
use std::{collections::HashMap, sync::LazyLock};
use strum::{Display, EnumIter, EnumString, IntoStaticStr};

use crate::{
    error::{OutputError, VeldResult},
    sim::Replicate,
};

/// Output destination protocol.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, Display, EnumString, EnumIter, IntoStaticStr,
)]
#[strum(serialize_all = "lowercase")]
pub enum Protocol {
    File,
    Minio,
    Stdout,
    Memory,
}

/// Serialization format, inferred from the destination path's extension.
///
/// `Csv` and `Text` serialize in-crate. `NetCdf` and `GeoTiff` destinations
/// parse and resolve templates here, but their byte encoding comes from the
/// raster collaborator; only the per-attribute file naming lives in this
/// module.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, Display, EnumString, EnumIter, IntoStaticStr,
)]
#[strum(serialize_all = "lowercase")]
pub enum FileType {
    Csv,
    Text,
    #[strum(serialize = "netcdf")]
    NetCdf,
    #[strum(serialize = "geotiff")]
    GeoTiff,
}

impl FileType {
    fn from_path(path: &str) -> FileType {
        match path.rsplit('.').next() {
            Some("csv") => FileType::Csv,
            Some("nc") => FileType::NetCdf,
            Some("tif") | Some("tiff") => FileType::GeoTiff,
            _ => FileType::Text,
        }
    }
}

static TARGET_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^([a-z]+)://([^/]*)(?:/(.*))?$").expect("valid target regex"));

static TEMPLATE_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\{([A-Za-z0-9_]+)\}").expect("valid template regex"));

/// A parsed output destination: `protocol://[host]/path`.
#[derive(Debug, Clone, PartialEq)]
pub struct OutputTarget {
    pub protocol: Protocol,
    pub host: Option<String>,
    pub path: String,
    pub file_type: FileType,
}

impl OutputTarget {
    pub fn parse(uri: &str) -> VeldResult<Self> {
        let captures = TARGET_RE
            .captures(uri)
            .ok_or_else(|| OutputError::InvalidTarget(uri.to_string()))?;

        let protocol: Protocol = captures[1]
            .parse()
            .map_err(|_| OutputError::UnsupportedProtocol(captures[1].to_string()))?;
        let host = match &captures[2] {
            "" => None,
            host => Some(host.to_string()),
        };
        let mut path = captures
            .get(3)
            .map(|m| m.as_str().to_string())
            .unwrap_or_default();

        if path.is_empty() && matches!(protocol, Protocol::File | Protocol::Minio) {
            return Err(OutputError::InvalidTarget(format!("{uri}: missing path")).into());
        }
        // `file:///abs/path` has an empty host and an absolute path.
        if protocol == Protocol::File && host.is_none() {
            path.insert(0, '/');
        }

        Ok(Self {
            protocol,
            host,
            file_type: FileType::from_path(&path),
            path,
        })
    }

    /// Resolves `{placeholder}` templates in the path. Unknown placeholders
    /// fail with `UnknownTemplateVar`.
    pub fn resolve_path(&self, vars: &TemplateVars) -> VeldResult<String> {
        let mut result = String::with_capacity(self.path.len());
        let mut last = 0;
        for captures in TEMPLATE_RE.captures_iter(&self.path) {
            let whole = captures.get(0).expect("match");
            let name = &captures[1];
            let value = vars
                .get(name)
                .ok_or_else(|| OutputError::UnknownTemplateVar(name.to_string()))?;
            result.push_str(&self.path[last..whole.start()]);
            result.push_str(value);
            last = whole.end();
        }
        result.push_str(&self.path[last..]);
        Ok(result)
    }
}

/// Template variables available to output paths: `{replicate}`, `{user}`,
/// `{editor}`, plus user custom tags.
#[derive(Debug, Clone, Default)]
pub struct TemplateVars {
    values: HashMap<String, String>,
}

impl TemplateVars {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_replicate(mut self, replicate: Replicate) -> Self {
        self.values
            .insert("replicate".to_string(), replicate.0.to_string());
        self
    }

    pub fn with_user(mut self, user: &str) -> Self {
        self.values.insert("user".to_string(), user.to_string());
        self
    }

    pub fn with_editor(mut self, editor: &str) -> Self {
        self.values.insert("editor".to_string(), editor.to_string());
        self
    }

    /// Adds a user custom tag. Keys the engine owns are rejected.
    pub fn with_custom_tag(mut self, key: &str, value: &str) -> VeldResult<Self> {
        if key == "replicate" {
            return Err(OutputError::InvalidTarget(format!(
                "custom tag '{key}' shadows a reserved template variable"
            ))
            .into());
        }
        self.values.insert(key.to_string(), value.to_string());
        Ok(self)
    }

    pub fn get(&self, name: &str) -> Option<&str> {
        self.values.get(name).map(|v| v.as_str())
    }
}

/// `{basename}_{attr}_{replicate}.{ext}` naming for per-attribute exports
/// (NetCDF and friends).
pub fn per_attribute_file(basename: &str, attr: &str, replicate: Replicate, ext: &str) -> String {
    format!("{basename}_{attr}_{}.{ext}", replicate.0)
}

/// `{basename}_{attr}_{t}_{replicate}.tiff` naming for per-timestep GeoTIFF
/// exports.
pub fn per_timestep_file(basename: &str, attr: &str, step: u64, replicate: Replicate) -> String {
    format!("{basename}_{attr}_{step}_{}.tiff", replicate.0)
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn test_parse_file_target() {
        let target = OutputTarget::parse("file:///tmp/out/export_{replicate}.csv").unwrap();
        assert_eq!(target.protocol, Protocol::File);
        assert_eq!(target.host, None);
        assert_eq!(target.path, "/tmp/out/export_{replicate}.csv");
        assert_eq!(target.file_type, FileType::Csv);
    }

    #[test]
    fn test_parse_minio_target_with_host() {
        let target = OutputTarget::parse("minio://bucket/results/run.csv").unwrap();
        assert_eq!(target.protocol, Protocol::Minio);
        assert_eq!(target.host.as_deref(), Some("bucket"));
        assert_eq!(target.path, "results/run.csv");
    }

    #[test]
    fn test_parse_stdout_without_path() {
        let target = OutputTarget::parse("stdout://").unwrap();
        assert_eq!(target.protocol, Protocol::Stdout);
        assert_eq!(target.file_type, FileType::Text);
    }

    #[test]
    fn test_unsupported_protocol_rejected() {
        let err = OutputTarget::parse("gopher://x/y").unwrap_err();
        assert!(matches!(
            err,
            crate::error::VeldError::Output(OutputError::UnsupportedProtocol(_))
        ));
    }

    #[test]
    fn test_template_resolution() {
        let target = OutputTarget::parse("file:///out/{user}/run_{replicate}.csv").unwrap();
        let vars = TemplateVars::new()
            .with_user("ada")
            .with_replicate(Replicate(3));
        assert_eq!(target.resolve_path(&vars).unwrap(), "/out/ada/run_3.csv");
    }

    #[test]
    fn test_unknown_template_var_fails() {
        let target = OutputTarget::parse("file:///out/{mystery}.csv").unwrap();
        let err = target.resolve_path(&TemplateVars::new()).unwrap_err();
        assert!(matches!(
            err,
            crate::error::VeldError::Output(OutputError::UnknownTemplateVar(name)) if name == "mystery"
        ));
    }

    #[test]
    fn test_custom_tag_cannot_shadow_replicate() {
        let err = TemplateVars::new().with_custom_tag("replicate", "9");
        assert!(err.is_err());
    }

    #[test]
    fn test_custom_tag_resolution() {
        let target = OutputTarget::parse("file:///out/{scenario}.csv").unwrap();
        let vars = TemplateVars::new().with_custom_tag("scenario", "drought").unwrap();
        assert_eq!(target.resolve_path(&vars).unwrap(), "/out/drought.csv");
    }

    #[test]
    fn test_per_attribute_and_per_timestep_naming() {
        assert_eq!(
            per_attribute_file("export", "age", Replicate(2), "nc"),
            "export_age_2.nc"
        );
        assert_eq!(
            per_timestep_file("export", "age", 7, Replicate(2)),
            "export_age_7_2.tiff"
        );
    }
}
