//! Parsing of `esy.json` / `package.json` manifests.
//!
//! The build description lives in the `"esy"` object of an otherwise ordinary
//! package.json document. A document without that object is not an error; it
//! simply carries no build metadata.

use super::{BuildManifest, BuildType, Command, CommandList, ExportedEnv};
use serde::Deserialize;
use std::collections::BTreeMap;

/// Top-level package.json document. Fields other than the ones below are
/// ignored.
#[derive(Debug, Deserialize)]
struct PackageJson {
    #[serde(default)]
    name: Option<String>,
    #[serde(default)]
    version: Option<String>,
    #[serde(default)]
    esy: Option<EsySection>,
}

/// The `"esy"` object of a package.json. Unknown fields are ignored rather
/// than rejected.
#[derive(Debug, Deserialize, Default)]
struct EsySection {
    #[serde(default)]
    build: Option<CommandsJson>,
    #[serde(default)]
    install: Option<CommandsJson>,
    #[serde(default, rename = "buildDev")]
    build_dev: Option<CommandsJson>,
    #[serde(default, rename = "buildsInSource")]
    builds_in_source: Option<BuildsInSourceJson>,
    #[serde(default, rename = "buildEnv")]
    build_env: BTreeMap<String, String>,
    #[serde(default, rename = "exportedEnv")]
    exported_env: BTreeMap<String, ExportedEnv>,
}

/// Commands are written as a single line, or a list of lines and arg-vectors.
#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum CommandsJson {
    Single(String),
    Many(Vec<CommandJson>),
}

#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum CommandJson {
    Line(String),
    Args(Vec<String>),
}

/// `buildsInSource` is a boolean or one of the tagged strings `"unsafe"` and
/// `"_build"`.
#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum BuildsInSourceJson {
    Flag(bool),
    Tagged(String),
}

pub(super) fn parse(
    data: &str,
    name_fallback: Option<&str>,
) -> Result<Option<BuildManifest>, String> {
    let doc: PackageJson = serde_json::from_str(data).map_err(|e| e.to_string())?;

    let Some(esy) = doc.esy else {
        return Ok(None);
    };

    let build_type = match esy.builds_in_source {
        None | Some(BuildsInSourceJson::Flag(false)) => BuildType::OutOfSource,
        Some(BuildsInSourceJson::Flag(true)) => BuildType::InSource,
        Some(BuildsInSourceJson::Tagged(tag)) => match tag.as_str() {
            "unsafe" => BuildType::Unsafe,
            "_build" => BuildType::JbuilderLike,
            other => return Err(format!("invalid buildsInSource value: {:?}", other)),
        },
    };

    Ok(Some(BuildManifest {
        name: doc.name.or_else(|| name_fallback.map(str::to_string)),
        version: doc.version,
        build_type,
        build: CommandList::Esy(commands(esy.build)),
        install: CommandList::Esy(commands(esy.install)),
        build_dev: esy.build_dev.map(|c| commands(Some(c))),
        exported_env: esy.exported_env,
        build_env: esy.build_env,
        patches: Vec::new(),
        substs: Vec::new(),
    }))
}

fn commands(value: Option<CommandsJson>) -> Vec<Command> {
    match value {
        None => Vec::new(),
        Some(CommandsJson::Single(line)) => vec![Command::line(&line)],
        Some(CommandsJson::Many(entries)) => entries
            .into_iter()
            .map(|entry| match entry {
                CommandJson::Line(line) => Command::line(&line),
                CommandJson::Args(args) => Command::new(args),
            })
            .collect(),
    }
}
