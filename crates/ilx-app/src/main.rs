use std::env;
use std::path::{Path, PathBuf};

use anyhow::{bail, Context, Result};
use ilx_config::ExtensionManifest;
use ilx_core::logging;
use ilx_mod_credentials::StaticCredentials;
use ilx_remote::server::{IlxServer, ServerInfo};

const DEFAULT_PLUGIN_ID: &str = "ilx.credentials";
const MANIFEST_FILE: &str = "plugin.toml";

/// Locate the manifest describing this extension.
///
/// Precedence: `ILX_PLUGIN_MANIFEST` env var > `plugin.toml` in the working
/// directory (the host starts extensions from their manifest directory).
fn manifest_path() -> Option<PathBuf> {
    if let Ok(path) = env::var("ILX_PLUGIN_MANIFEST") {
        return Some(PathBuf::from(path));
    }

    let local = PathBuf::from(MANIFEST_FILE);
    local.is_file().then_some(local)
}

fn load_manifest(path: Option<&Path>) -> Result<Option<ExtensionManifest>> {
    match path {
        Some(path) => ExtensionManifest::from_path(path)
            .map(Some)
            .with_context(|| format!("failed to load extension identity from {}", path.display())),
        None => Ok(None),
    }
}

fn server_info(manifest: Option<&ExtensionManifest>) -> ServerInfo {
    match manifest {
        Some(manifest) => ServerInfo {
            plugin_id: manifest.id.clone(),
            plugin_version: manifest.version.clone(),
        },
        None => ServerInfo {
            plugin_id: DEFAULT_PLUGIN_ID.to_string(),
            plugin_version: env!("CARGO_PKG_VERSION").to_string(),
        },
    }
}

/// Register every method this extension serves.
fn build_server(manifest: Option<&ExtensionManifest>) -> Result<IlxServer> {
    let mut server = IlxServer::new(server_info(manifest));
    ilx_mod_credentials::register(&mut server, StaticCredentials)
        .context("failed to register getCredentials")?;

    if let Some(manifest) = manifest {
        let registered = server.methods();
        let missing: Vec<&str> = manifest
            .methods
            .exported
            .iter()
            .map(String::as_str)
            .filter(|method| !registered.contains(method))
            .collect();
        if !missing.is_empty() {
            bail!(
                "manifest exports methods this extension does not register: {}",
                missing.join(", ")
            );
        }
    }

    Ok(server)
}

fn main() -> Result<()> {
    if let Err(err) = logging::init() {
        eprintln!("warning: {err:#}");
    }

    let manifest = load_manifest(manifest_path().as_deref())?;
    let mut server = build_server(manifest.as_ref())?;

    tracing::info!(
        plugin_id = %server.info().plugin_id,
        version = %server.info().plugin_version,
        "extension ready"
    );

    server.listen_stdio()?;
    Ok(())
}
