//! Per-device tool manifests.
//!
//! A manifest is a JSON document produced next to a firmware build. It names
//! the device and enumerates the tools the firmware dispatches on, one numeric
//! tag each. The manifest is the ABI between the firmware and the host
//! adapter: the adapter never hardcodes a tag other than the reserved
//! identification tag 0.

use std::collections::HashSet;
use std::path::{Path, PathBuf};

use mculink_protocol::{WireType, DEVICE_ID_TAG};
use serde::Deserialize;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ManifestError {
    #[error("manifest {} is unreadable: {source}", path.display())]
    Io {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("manifest {} is not valid JSON: {source}", path.display())]
    Parse {
        path: PathBuf,
        source: serde_json::Error,
    },
    #[error("invalid manifest: {0}")]
    Invalid(String),
}

/// One callable tool as the device dispatches it.
#[derive(Debug, Clone)]
pub struct ToolDescriptor {
    pub tag: u8,
    pub name: String,
    pub description: String,
    /// `None` stands for a void return (bare-CRC response frame).
    pub return_type: Option<WireType>,
    pub params: Vec<Parameter>,
}

#[derive(Debug, Clone)]
pub struct Parameter {
    pub name: String,
    pub ty: WireType,
}

/// A validated, immutable device manifest.
#[derive(Debug, Clone)]
pub struct Manifest {
    pub name: String,
    pub description: String,
    pub version: String,
    pub tools: Vec<ToolDescriptor>,
}

// On-disk schema; converted into the typed model during validation.

#[derive(Debug, Deserialize)]
struct RawManifest {
    name: String,
    description: String,
    version: String,
    functions: Vec<RawTool>,
}

#[derive(Debug, Deserialize)]
struct RawTool {
    tag: u8,
    name: String,
    desc: String,
    #[serde(rename = "return")]
    return_type: Option<String>,
    params: Vec<RawParam>,
}

#[derive(Debug, Deserialize)]
struct RawParam {
    name: String,
    #[serde(rename = "type")]
    ty: String,
}

impl Manifest {
    /// Read, parse, and validate a manifest file.
    pub fn load(path: &Path) -> Result<Self, ManifestError> {
        let content = std::fs::read_to_string(path).map_err(|source| ManifestError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        let raw: RawManifest =
            serde_json::from_str(&content).map_err(|source| ManifestError::Parse {
                path: path.to_path_buf(),
                source,
            })?;
        Self::validate(raw)
    }

    pub fn from_json(content: &str) -> Result<Self, ManifestError> {
        let raw: RawManifest =
            serde_json::from_str(content).map_err(|source| ManifestError::Parse {
                path: PathBuf::from("<inline>"),
                source,
            })?;
        Self::validate(raw)
    }

    fn validate(raw: RawManifest) -> Result<Self, ManifestError> {
        let mut names = HashSet::new();
        let mut tags = HashSet::new();
        let mut tools = Vec::with_capacity(raw.functions.len());

        for func in raw.functions {
            if func.name.is_empty() {
                return Err(ManifestError::Invalid(format!(
                    "tool with tag {} has an empty name",
                    func.tag
                )));
            }
            if !names.insert(func.name.clone()) {
                return Err(ManifestError::Invalid(format!(
                    "duplicate tool name '{}'",
                    func.name
                )));
            }
            if !tags.insert(func.tag) {
                return Err(ManifestError::Invalid(format!(
                    "duplicate tool tag {}",
                    func.tag
                )));
            }

            let return_type = match func.return_type.as_deref() {
                None => None,
                Some(s) => Some(WireType::from_name(s).ok_or_else(|| {
                    ManifestError::Invalid(format!(
                        "tool '{}' has unknown return type '{s}'",
                        func.name
                    ))
                })?),
            };

            let mut param_names = HashSet::new();
            let mut params = Vec::with_capacity(func.params.len());
            for param in func.params {
                if !param_names.insert(param.name.clone()) {
                    return Err(ManifestError::Invalid(format!(
                        "tool '{}' has duplicate parameter name '{}'",
                        func.name, param.name
                    )));
                }
                if param.ty == "void" {
                    return Err(ManifestError::Invalid(format!(
                        "tool '{}' parameter '{}' cannot be void",
                        func.name, param.name
                    )));
                }
                let ty = WireType::from_name(&param.ty).ok_or_else(|| {
                    ManifestError::Invalid(format!(
                        "tool '{}' parameter '{}' has unknown type '{}'",
                        func.name, param.name, param.ty
                    ))
                })?;
                params.push(Parameter {
                    name: param.name,
                    ty,
                });
            }

            if func.tag == DEVICE_ID_TAG
                && (func.name != "deviceId"
                    || return_type != Some(WireType::CStr)
                    || !params.is_empty())
            {
                return Err(ManifestError::Invalid(
                    "tag 0 is reserved for deviceId() -> CStr with no parameters".into(),
                ));
            }

            tools.push(ToolDescriptor {
                tag: func.tag,
                name: func.name,
                description: func.desc,
                return_type,
                params,
            });
        }

        Ok(Manifest {
            name: raw.name,
            description: raw.description,
            version: raw.version,
            tools,
        })
    }

    pub fn by_name(&self, name: &str) -> Option<&ToolDescriptor> {
        self.tools.iter().find(|t| t.name == name)
    }

    pub fn by_tag(&self, tag: u8) -> Option<&ToolDescriptor> {
        self.tools.iter().find(|t| t.tag == tag)
    }
}

impl ToolDescriptor {
    /// `name(param: type, ...) -> ret` rendering for logs.
    pub fn signature(&self) -> String {
        let params: Vec<String> = self
            .params
            .iter()
            .map(|p| format!("{}: {}", p.name, p.ty.name()))
            .collect();
        let ret = self
            .return_type
            .map(|t| format!(" -> {}", t.name()))
            .unwrap_or_default();
        format!("{}({}){}", self.name, params.join(", "), ret)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    const VALID: &str = r#"{
        "name": "Test Robot",
        "description": "A test device",
        "version": "1.0.0",
        "functions": [
            { "tag": 0, "name": "deviceId", "desc": "Identify", "return": "CStr", "params": [] },
            { "tag": 1, "name": "blinkLED", "desc": "Blink", "return": null,
              "params": [ { "name": "n", "type": "i16" } ] },
            { "tag": 2, "name": "getTemperature", "desc": "Read temp", "return": "i16", "params": [] }
        ]
    }"#;

    #[test]
    fn valid_manifest_loads() {
        let manifest = Manifest::from_json(VALID).unwrap();
        assert_eq!(manifest.name, "Test Robot");
        assert_eq!(manifest.tools.len(), 3);

        let blink = manifest.by_name("blinkLED").unwrap();
        assert_eq!(blink.tag, 1);
        assert_eq!(blink.return_type, None);
        assert_eq!(blink.params[0].ty, WireType::I16);
        assert_eq!(blink.signature(), "blinkLED(n: i16)");

        assert_eq!(manifest.by_tag(2).unwrap().name, "getTemperature");
        assert!(manifest.by_tag(9).is_none());
        assert!(manifest.by_name("nope").is_none());
    }

    #[test]
    fn load_reads_from_disk() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("test-robot.json");
        let mut file = std::fs::File::create(&path).unwrap();
        file.write_all(VALID.as_bytes()).unwrap();

        let manifest = Manifest::load(&path).unwrap();
        assert_eq!(manifest.version, "1.0.0");
    }

    #[test]
    fn missing_file_is_io_error() {
        let err = Manifest::load(Path::new("/nonexistent/robot.json")).unwrap_err();
        assert!(matches!(err, ManifestError::Io { .. }));
    }

    #[test]
    fn malformed_json_is_parse_error() {
        let err = Manifest::from_json("{ not json").unwrap_err();
        assert!(matches!(err, ManifestError::Parse { .. }));
    }

    fn manifest_with_functions(functions: &str) -> Result<Manifest, ManifestError> {
        Manifest::from_json(&format!(
            r#"{{ "name": "x", "description": "", "version": "1", "functions": [{functions}] }}"#
        ))
    }

    #[test]
    fn duplicate_tags_rejected() {
        let err = manifest_with_functions(
            r#"{ "tag": 1, "name": "a", "desc": "", "return": null, "params": [] },
               { "tag": 1, "name": "b", "desc": "", "return": null, "params": [] }"#,
        )
        .unwrap_err();
        assert!(err.to_string().contains("duplicate tool tag 1"));
    }

    #[test]
    fn duplicate_names_rejected() {
        let err = manifest_with_functions(
            r#"{ "tag": 1, "name": "a", "desc": "", "return": null, "params": [] },
               { "tag": 2, "name": "a", "desc": "", "return": null, "params": [] }"#,
        )
        .unwrap_err();
        assert!(err.to_string().contains("duplicate tool name 'a'"));
    }

    #[test]
    fn empty_name_rejected() {
        let err = manifest_with_functions(
            r#"{ "tag": 1, "name": "", "desc": "", "return": null, "params": [] }"#,
        )
        .unwrap_err();
        assert!(err.to_string().contains("empty name"));
    }

    #[test]
    fn tag_zero_must_be_device_id() {
        // Wrong name.
        let err = manifest_with_functions(
            r#"{ "tag": 0, "name": "reset", "desc": "", "return": "CStr", "params": [] }"#,
        )
        .unwrap_err();
        assert!(err.to_string().contains("reserved"));

        // Wrong return type.
        let err = manifest_with_functions(
            r#"{ "tag": 0, "name": "deviceId", "desc": "", "return": "i16", "params": [] }"#,
        )
        .unwrap_err();
        assert!(err.to_string().contains("reserved"));

        // Unexpected parameters.
        let err = manifest_with_functions(
            r#"{ "tag": 0, "name": "deviceId", "desc": "", "return": "CStr",
                 "params": [ { "name": "x", "type": "i16" } ] }"#,
        )
        .unwrap_err();
        assert!(err.to_string().contains("reserved"));
    }

    #[test]
    fn void_parameter_rejected() {
        let err = manifest_with_functions(
            r#"{ "tag": 1, "name": "a", "desc": "", "return": null,
                 "params": [ { "name": "x", "type": "void" } ] }"#,
        )
        .unwrap_err();
        assert!(err.to_string().contains("cannot be void"));
    }

    #[test]
    fn unknown_types_rejected() {
        let err = manifest_with_functions(
            r#"{ "tag": 1, "name": "a", "desc": "", "return": "f32", "params": [] }"#,
        )
        .unwrap_err();
        assert!(err.to_string().contains("unknown return type 'f32'"));

        let err = manifest_with_functions(
            r#"{ "tag": 1, "name": "a", "desc": "", "return": null,
                 "params": [ { "name": "x", "type": "u8" } ] }"#,
        )
        .unwrap_err();
        assert!(err.to_string().contains("unknown type 'u8'"));
    }

    #[test]
    fn duplicate_parameter_names_rejected() {
        let err = manifest_with_functions(
            r#"{ "tag": 1, "name": "a", "desc": "", "return": null,
                 "params": [ { "name": "x", "type": "i16" }, { "name": "x", "type": "i32" } ] }"#,
        )
        .unwrap_err();
        assert!(err.to_string().contains("duplicate parameter name 'x'"));
    }
}
