//! Deployable asset bundles for lambda instances.
//!
//! User files are validated, placed under `app/` and merged with the runtime
//! wrapper that boots them on the provider. The wrapper reads the user entry
//! point from [`ENTRYPOINT_ENV`].

use std::collections::BTreeMap;

use serde::Deserialize;
use serde_json::{json, Value};

use crate::error::{DeployError, DeployResult};
use crate::types::InstanceId;

/// Optional manifest describing how the bundle runs.
pub const MANIFEST_FILE: &str = "lodestar.json";

/// Only runtime currently accepted in the manifest.
pub const SUPPORTED_RUNTIME: &str = "typescript.deno";

/// Env var holding the user entry point, relative to `app/`.
pub const ENTRYPOINT_ENV: &str = "LODESTAR_SERVER_ENTRYPOINT";

/// Directory user files are placed in.
const APP_DIR: &str = "app";

const ENTRY_NAMES: [&str; 6] = ["index", "app", "main", "server", "boot", "mcp"];
const ENTRY_EXTENSIONS: [&str; 4] = ["ts", "js", "cjs", "mjs"];

const BOOT_TS: &str = r#"const entry = Deno.env.get("LODESTAR_SERVER_ENTRYPOINT");
if (!entry) throw new Error("LODESTAR_SERVER_ENTRYPOINT is not set");
await import(new URL(`./app/${entry}`, import.meta.url).href);
"#;

/// File names tried, in order, when `package.json` has no `main`.
#[must_use]
pub fn common_entry_points() -> Vec<String> {
    ENTRY_NAMES
        .iter()
        .flat_map(|name| ENTRY_EXTENSIONS.iter().map(move |ext| format!("{name}.{ext}")))
        .collect()
}

/// Typed view of the fields we read from `package.json`.
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
#[allow(dead_code)]
struct PackageJson {
    name: Option<String>,
    version: Option<String>,
    main: Option<String>,
    dependencies: Option<BTreeMap<String, String>>,
    dev_dependencies: Option<BTreeMap<String, String>>,
}

/// Runtime wrapper merged into every bundle.
#[derive(Debug, Clone)]
pub struct RuntimeWrapper {
    entrypoint: String,
    files: BTreeMap<String, String>,
}

impl Default for RuntimeWrapper {
    fn default() -> Self {
        Self {
            entrypoint: "boot.ts".to_owned(),
            files: BTreeMap::from([("boot.ts".to_owned(), BOOT_TS.to_owned())]),
        }
    }
}

impl RuntimeWrapper {
    /// Wrapper with custom files and entry point.
    #[must_use]
    pub fn new(entrypoint: impl Into<String>, files: BTreeMap<String, String>) -> Self {
        Self {
            entrypoint: entrypoint.into(),
            files,
        }
    }

    /// Validate `user_files` and merge them with the wrapper.
    pub fn prepare(
        &self,
        instance_id: &InstanceId,
        user_files: &BTreeMap<String, String>,
    ) -> DeployResult<PreparedBundle> {
        if let Some(raw) = user_files.get(MANIFEST_FILE) {
            check_manifest(raw)?;
        }

        let raw_package = user_files.get("package.json").ok_or_else(|| {
            DeployError::validation("missing_package_json", "Missing package.json file")
        })?;
        let (package_value, package) = parse_package_json(raw_package)?;

        let mut files = self.files.clone();
        for (path, content) in user_files {
            let placed = place_user_file(path)?;
            if files.contains_key(&placed) {
                return Err(DeployError::validation(
                    "invalid_file",
                    format!("File {path} is reserved and cannot be used in the bundle"),
                ));
            }
            files.insert(placed, content.clone());
        }

        let user_entry = package
            .main
            .filter(|m| !m.is_empty())
            .or_else(|| {
                common_entry_points()
                    .into_iter()
                    .find(|name| user_files.contains_key(name))
            })
            .ok_or_else(|| {
                DeployError::validation(
                    "missing_entry_point",
                    format!(
                        "Could not determine entry point. Set \"main\" in package.json or add one of: {}",
                        common_entry_points().join(", ")
                    ),
                )
            })?;

        files.insert(
            "package.json".to_owned(),
            render_package_json(package_value, &self.entrypoint),
        );
        files.insert(
            "lodestar-deployment.json".to_owned(),
            json!({
                "entrypoint": user_entry,
                "instance": { "id": instance_id.as_str() },
            })
            .to_string(),
        );

        Ok(PreparedBundle {
            entrypoint: self.entrypoint.clone(),
            env: BTreeMap::from([(ENTRYPOINT_ENV.to_owned(), user_entry)]),
            files,
        })
    }
}

/// A validated bundle ready to upload.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PreparedBundle {
    /// File the provider starts.
    pub entrypoint: String,
    /// Environment the wrapper needs.
    pub env: BTreeMap<String, String>,
    /// Every file in the bundle, by path.
    pub files: BTreeMap<String, String>,
}

fn check_manifest(raw: &str) -> DeployResult<()> {
    let manifest: Value = serde_json::from_str(raw).map_err(|_| {
        DeployError::validation("invalid_manifest", format!("Unable to parse {MANIFEST_FILE}"))
    })?;
    let object = manifest.as_object().ok_or_else(|| {
        DeployError::validation(
            "invalid_manifest",
            format!("Invalid {MANIFEST_FILE}: expected an object"),
        )
    })?;

    match object.get("runtime").and_then(Value::as_str) {
        Some(SUPPORTED_RUNTIME) => Ok(()),
        _ => Err(DeployError::validation(
            "invalid_runtime",
            format!("Only {SUPPORTED_RUNTIME} runtime is supported"),
        )),
    }
}

fn parse_package_json(raw: &str) -> DeployResult<(Value, PackageJson)> {
    let value: Value = serde_json::from_str(raw).map_err(|_| {
        DeployError::validation("invalid_package_json", "Unable to parse package.json file")
    })?;
    let package = PackageJson::deserialize(&value).map_err(|e| {
        DeployError::validation(
            "invalid_package_json",
            format!("Invalid package.json file: {e}"),
        )
    })?;
    Ok((value, package))
}

fn place_user_file(path: &str) -> DeployResult<String> {
    let escapes = path.starts_with('/')
        || path.contains('\\')
        || path.split('/').any(|segment| segment == ".." || segment.is_empty());
    if escapes {
        return Err(DeployError::validation(
            "invalid_file",
            format!("File path {path} is not allowed"),
        ));
    }
    Ok(format!("{APP_DIR}/{path}"))
}

fn render_package_json(mut package: Value, entrypoint: &str) -> String {
    if let Some(object) = package.as_object_mut() {
        object.insert("main".to_owned(), Value::String(entrypoint.to_owned()));
        let deps = object
            .entry("dependencies")
            .or_insert_with(|| Value::Object(serde_json::Map::new()));
        if let Some(deps) = deps.as_object_mut() {
            deps.entry("@modelcontextprotocol/sdk")
                .or_insert_with(|| Value::String("latest".to_owned()));
        }
    }
    serde_json::to_string_pretty(&package).unwrap_or_else(|_| package.to_string())
}
