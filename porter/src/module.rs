//! A single source file plus its transpiled form and dependency edges
//! (spec.md §3 "Module"). Modules never hold a strong reference back to
//! their owning Packet — that would make the forest a reference cycle; a
//! `PacketRef` key into `App`'s packet forest stands in for it instead,
//! matching how the teacher's own `ModuleMap` (bundler/src/bundle/modules.rs)
//! tracks modules by path rather than by parent pointer.

use std::collections::HashSet;
use std::path::PathBuf;
use std::time::SystemTime;

/// Identifies a Packet within the forest: the root project, or a concrete
/// `name@version` dependency (spec.md §3 "Across the forest, `(name,
/// version)` uniquely identifies a Packet").
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum PacketRef {
    Root,
    Dependency { name: String, version: String },
}

impl PacketRef {
    pub fn dependency(name: impl Into<String>, version: impl Into<String>) -> Self {
        PacketRef::Dependency {
            name: name.into(),
            version: version.into(),
        }
    }

    pub fn is_root(&self) -> bool {
        matches!(self, PacketRef::Root)
    }
}

impl std::fmt::Display for PacketRef {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            PacketRef::Root => write!(f, "<root>"),
            PacketRef::Dependency { name, version } => write!(f, "{name}@{version}"),
        }
    }
}

/// A Module reference that can cross Packet boundaries: the pair the Bundler
/// walks when following `children`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ModuleRef {
    pub packet: PacketRef,
    pub id: String,
}

impl ModuleRef {
    pub fn new(packet: PacketRef, id: impl Into<String>) -> Self {
        Self {
            packet,
            id: id.into(),
        }
    }
}

/// One source file belonging to a Packet (spec.md §3 "Module").
#[derive(Debug, Clone)]
pub struct Module {
    /// Canonical, Packet-relative id. Ends in `.js` or `.css` regardless of
    /// the on-disk extension, with one exception: a required `.json` file
    /// keeps its own `.json` id, since that's the specifier a `require()`
    /// site actually uses.
    pub id: String,
    /// Disk-relative path, rooted at the owning Packet's directory (not at
    /// whichever `paths` entry matched — that's what `id` is relative to).
    /// May differ from `id` in extension, e.g. `home.ts` on disk vs.
    /// `home.js` canonical id.
    pub file: PathBuf,
    /// Absolute path on disk.
    pub fpath: PathBuf,
    /// Transpiled output.
    pub code: String,
    /// Source map for `code`, if the transpiler produced one.
    pub map: Option<String>,
    /// Ordered, de-duplicated sequence of resolved dependencies.
    pub children: Vec<ModuleRef>,
    /// Transitive closure including `self`, recomputed after each parse or
    /// reload via `Packet::recompute_family`.
    pub family: HashSet<ModuleRef>,
    pub is_root_entry: bool,
    pub is_preload: bool,
    pub is_worker: bool,
    /// Placeholder generated for a specifier that failed to resolve.
    pub fake: bool,
    /// Reachable from a preload entry's closure.
    pub preloaded: bool,
    /// Treated as a leaf for bundling purposes (e.g. a wasm artifact) —
    /// never emitted inline.
    pub isolated: bool,
    pub mtime: Option<SystemTime>,
}

impl Module {
    pub fn new(id: impl Into<String>, file: PathBuf, fpath: PathBuf) -> Self {
        let id = id.into();
        Self {
            id,
            file,
            fpath,
            code: String::new(),
            map: None,
            children: Vec::new(),
            family: HashSet::new(),
            is_root_entry: false,
            is_preload: false,
            is_worker: false,
            fake: false,
            preloaded: false,
            isolated: false,
            mtime: None,
        }
    }

    /// A placeholder module for an unresolved specifier: connected (so the
    /// graph stays whole) but empty (spec.md §4.2 "Missing file yields
    /// 'unresolved'... which the caller may represent as a `fake` Module").
    pub fn fake(id: impl Into<String>) -> Self {
        let id = id.into();
        Self {
            fake: true,
            ..Self::new(id, PathBuf::new(), PathBuf::new())
        }
    }

    /// The canonical output extension: `.js` or `.css`.
    pub fn format(&self) -> &'static str {
        if self.id.ends_with(".css") {
            "css"
        } else {
            "js"
        }
    }
}

/// Normalizes an on-disk file extension into the canonical output
/// extension: `.ts`/`.tsx`/`.jsx` collapse into `.js`; `.less` collapses
/// into `.css`. `.json` is deliberately left alone — a required JSON file is
/// wrapped into a CommonJS module (see `transpile::wrap_json`) but keeps its
/// own id at the `define()` call site, since that's the one any client-side
/// `require("./foo.json")` actually looks up under.
pub fn canonical_id(relative_path: &std::path::Path) -> String {
    let path_str = relative_path.to_string_lossy().replace('\\', "/");
    match relative_path.extension().and_then(|e| e.to_str()) {
        Some("ts") | Some("tsx") | Some("jsx") => replace_extension(&path_str, "js"),
        Some("less") => replace_extension(&path_str, "css"),
        _ => path_str,
    }
}

fn replace_extension(path_str: &str, new_ext: &str) -> String {
    match path_str.rfind('.') {
        Some(idx) => format!("{}.{new_ext}", &path_str[..idx]),
        None => format!("{path_str}.{new_ext}"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::Path;

    #[test]
    fn canonical_id_collapses_extensions() {
        assert_eq!(canonical_id(Path::new("home.ts")), "home.js");
        assert_eq!(canonical_id(Path::new("home.tsx")), "home.js");
        assert_eq!(canonical_id(Path::new("data.json")), "data.json");
        assert_eq!(canonical_id(Path::new("theme.less")), "theme.css");
        assert_eq!(canonical_id(Path::new("home.js")), "home.js");
        assert_eq!(canonical_id(Path::new("nested/a.tsx")), "nested/a.js");
    }

    #[test]
    fn fake_module_is_empty_and_flagged() {
        let m = Module::fake("missing-dep");
        assert!(m.fake);
        assert!(m.children.is_empty());
        assert!(m.code.is_empty());
    }
}
