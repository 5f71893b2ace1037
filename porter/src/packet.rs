//! A node in the dependency forest: the root project, or a specific version
//! of a dependency (spec.md §3 "Packet"). Packets exclusively own their
//! `files` and `bundles`; the forest itself (shared `(name, version)` nodes,
//! the parent-walk used for bare-specifier resolution) is assembled by
//! `App`, which is the only thing that can see more than one Packet at once.

use std::collections::{HashMap, HashSet};
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use serde::Deserialize;

use crate::bundle::Bundle;
use crate::module::{Module, PacketRef};
use crate::resolver::BrowserValue;
use crate::transpile::{PassthroughTranspiler, ScriptTranspiler, StyleTranspiler};

/// The subset of a package manifest Porter reads. Real manifests carry far
/// more; everything else is irrelevant to module resolution.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct ManifestFile {
    pub name: String,
    pub version: String,
    pub main: Option<String>,
    pub dependencies: HashMap<String, String>,
    #[serde(deserialize_with = "deserialize_browser", default)]
    pub browser: HashMap<String, BrowserValue>,
}

fn deserialize_browser<'de, D>(
    deserializer: D,
) -> Result<HashMap<String, BrowserValue>, D::Error>
where
    D: serde::Deserializer<'de>,
{
    let raw: HashMap<String, serde_json::Value> = HashMap::deserialize(deserializer)?;
    Ok(raw
        .into_iter()
        .map(|(k, v)| {
            let value = match v {
                serde_json::Value::Bool(false) => BrowserValue::Disabled,
                serde_json::Value::String(s) => BrowserValue::Rewrite(s),
                _ => BrowserValue::Disabled,
            };
            (k, value)
        })
        .collect())
}

impl ManifestFile {
    /// Reads `package.json`-equivalent manifest at `dir/package.json`.
    /// Missing or unparsable manifests degrade to an unnamed manifest with
    /// no declared dependencies rather than erroring — a Packet without a
    /// manifest is still a valid (if dependency-less) node.
    pub fn load(dir: &Path) -> Self {
        let path = dir.join("package.json");
        fs::read_to_string(path)
            .ok()
            .and_then(|text| serde_json::from_str(&text).ok())
            .unwrap_or_default()
    }
}

/// What `prepare` decided about the transpiler to use. The actual transform
/// logic is an external collaborator (spec.md §1); this only records which
/// config shape was found, so tests and the cache fingerprint can see it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TranspilerKind {
    None,
    Babel,
    TypeScript,
}

pub struct Packet {
    pub key: PacketRef,
    pub root: PathBuf,
    pub name: String,
    pub version: String,
    pub main: Option<String>,
    pub dependencies: HashMap<String, String>,
    pub browser: HashMap<String, BrowserValue>,
    /// Directory specifiers known to be required, recorded by the resolver's
    /// directory rule so a lazy directory-require loader can enumerate them.
    pub folder: HashSet<String>,
    /// Ordered source roots; only meaningful for the root Packet.
    pub paths: Vec<PathBuf>,
    pub files: HashMap<String, Module>,
    pub bundles: HashMap<String, Bundle>,
    pub parent: Option<PacketRef>,
    /// Snapshot of this Packet's own declared-version graph.
    pub lock: HashMap<String, String>,
    pub transpiler_kind: TranspilerKind,
    pub script_transpiler: Arc<dyn ScriptTranspiler>,
    pub style_transpiler: Arc<dyn StyleTranspiler>,
    pub isolated: bool,
}

impl Packet {
    pub fn new_root(root: PathBuf, paths: Vec<PathBuf>) -> Self {
        let manifest = ManifestFile::load(&root);
        let mut packet = Self::from_manifest(PacketRef::Root, root, None, manifest);
        packet.paths = if paths.is_empty() {
            vec![packet.root.clone()]
        } else {
            paths
        };
        packet
    }

    pub fn new_dependency(key: PacketRef, root: PathBuf, parent: PacketRef) -> Self {
        let manifest = ManifestFile::load(&root);
        Self::from_manifest(key, root, Some(parent), manifest)
    }

    fn from_manifest(
        key: PacketRef,
        root: PathBuf,
        parent: Option<PacketRef>,
        manifest: ManifestFile,
    ) -> Self {
        let (name, version) = match &key {
            PacketRef::Root => (manifest.name.clone(), manifest.version.clone()),
            PacketRef::Dependency { name, version } => (name.clone(), version.clone()),
        };
        let lock = manifest.dependencies.clone();
        Self {
            key,
            root: root.clone(),
            name,
            version,
            main: manifest.main,
            dependencies: manifest.dependencies,
            browser: manifest.browser,
            folder: HashSet::new(),
            paths: vec![root],
            files: HashMap::new(),
            bundles: HashMap::new(),
            parent,
            lock,
            transpiler_kind: TranspilerKind::None,
            script_transpiler: Arc::new(PassthroughTranspiler),
            style_transpiler: Arc::new(PassthroughTranspiler),
            isolated: false,
        }
    }

    /// Probes the Packet's manifest and directory tree for a transpiler
    /// configuration, fixing `transpiler_kind`/`script_transpiler` for the
    /// rest of this Packet's lifetime (spec.md §4.3 "The chosen transpiler
    /// is fixed per Packet"). Only the built-in pass-through implementation
    /// ships with Porter; a host embedding Porter supplies real ones via
    /// `with_script_transpiler`/`with_style_transpiler`.
    pub fn prepare(&mut self) {
        self.transpiler_kind = if self.root.join("tsconfig.json").is_file() {
            TranspilerKind::TypeScript
        } else if ["babel.config.js", "babel.config.json", ".babelrc"]
            .iter()
            .any(|f| self.root.join(f).is_file())
        {
            TranspilerKind::Babel
        } else {
            TranspilerKind::None
        };
    }

    pub fn with_script_transpiler(&mut self, transpiler: Arc<dyn ScriptTranspiler>) {
        self.script_transpiler = transpiler;
    }

    pub fn with_style_transpiler(&mut self, transpiler: Arc<dyn StyleTranspiler>) {
        self.style_transpiler = transpiler;
    }

    /// Directory of an already-present module, used as the resolution base
    /// for its dependency specifiers.
    pub fn module_dir(&self, module_id: &str) -> PathBuf {
        self.files
            .get(module_id)
            .and_then(|m| m.fpath.parent().map(Path::to_path_buf))
            .unwrap_or_else(|| self.root.clone())
    }

    /// Resolves `spec` against this Packet's source roots (for entry points,
    /// spec.md §4.3): the first root under which the extension/directory
    /// rules succeed wins.
    pub fn resolve_entry(&self, spec: &str, exts: &[&str]) -> Option<PathBuf> {
        for root in &self.paths {
            if let Some(found) = crate::resolver::resolve_relative(root, spec, exts) {
                return Some(found.path);
            }
        }
        None
    }

    pub fn relative_id(&self, fpath: &Path) -> String {
        let rel = self
            .paths
            .iter()
            .find_map(|root| fpath.strip_prefix(root).ok())
            .or_else(|| fpath.strip_prefix(&self.root).ok())
            .unwrap_or(fpath);
        crate::module::canonical_id(rel)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn loads_manifest_dependencies_and_browser_field() {
        let dir = tempdir().unwrap();
        fs::write(
            dir.path().join("package.json"),
            r#"{
                "name": "yen",
                "version": "1.2.4",
                "main": "index.js",
                "dependencies": {"emitter": "1.0.0"},
                "browser": {"./fs-shim.js": false, "./a.js": "./b.js"}
            }"#,
        )
        .unwrap();

        let packet = Packet::new_dependency(
            PacketRef::dependency("yen", "1.2.4"),
            dir.path().to_path_buf(),
            PacketRef::Root,
        );
        assert_eq!(packet.name, "yen");
        assert_eq!(packet.version, "1.2.4");
        assert_eq!(packet.main.as_deref(), Some("index.js"));
        assert_eq!(packet.dependencies.get("emitter").unwrap(), "1.0.0");
        assert_eq!(packet.browser.get("./fs-shim.js"), Some(&BrowserValue::Disabled));
        assert_eq!(
            packet.browser.get("./a.js"),
            Some(&BrowserValue::Rewrite("./b.js".to_string()))
        );
    }

    #[test]
    fn missing_manifest_degrades_gracefully() {
        let dir = tempdir().unwrap();
        let packet = Packet::new_root(dir.path().to_path_buf(), vec![]);
        assert!(packet.name.is_empty());
        assert!(packet.dependencies.is_empty());
    }

    #[test]
    fn prepare_detects_typescript_config() {
        let dir = tempdir().unwrap();
        fs::write(dir.path().join("tsconfig.json"), "{}").unwrap();
        let mut packet = Packet::new_root(dir.path().to_path_buf(), vec![]);
        packet.prepare();
        assert_eq!(packet.transpiler_kind, TranspilerKind::TypeScript);
    }
}
