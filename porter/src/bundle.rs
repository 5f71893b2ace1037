//! A deliverable artifact assembled from a Packet's module graph (spec.md §3
//! "Bundle", §4.5). `Bundle::traverse` performs the deterministic DFS
//! traversal; the actual concurrent "compute once, serve many" semantics
//! this enables are provided by the caller (`App`) via the same per-key
//! coalescing pattern `Cache` uses, since a Bundle is really just another
//! cached artifact keyed by its entries.

use std::collections::HashSet;

use crate::module::{Module, ModuleRef, PacketRef};

/// Scope of a Bundle's traversal (spec.md §3 "Bundle.scope").
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Scope {
    /// Just the requested module, no transitive dependencies.
    Module,
    /// The requested module's Packet and everything reachable within it.
    Packet,
    /// The full transitive closure across Packet boundaries.
    All,
}

/// Where a Bundle sits in its own compute lifecycle (an explicit state
/// machine rather than an implicit "is code empty" check, so concurrent
/// requests arriving mid-rebuild can tell a stale-but-valid artifact from
/// one that was invalidated out from under them).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BundleState {
    /// Never built, or built and still valid.
    Idle,
    /// A file matching this Bundle's closure changed; `code`/`map` are the
    /// last good build and remain servable until the rebuild finishes.
    Dirty,
    /// A rebuild is in flight.
    Rebuilding,
}

#[derive(Debug, Clone)]
pub struct Bundle {
    pub packet: PacketRef,
    pub entries: Vec<String>,
    pub format: &'static str,
    pub scope: Scope,
    pub state: BundleState,
    pub code: Option<String>,
    pub map: Option<String>,
    pub etag: Option<String>,
    pub contenthash: Option<String>,
}

impl Bundle {
    pub fn new(packet: PacketRef, entries: Vec<String>, format: &'static str, scope: Scope) -> Self {
        Self {
            packet,
            entries,
            format,
            scope,
            state: BundleState::Idle,
            code: None,
            map: None,
            etag: None,
            contenthash: None,
        }
    }

    pub fn mark_dirty(&mut self) {
        if self.state != BundleState::Rebuilding {
            self.state = BundleState::Dirty;
        }
    }

    /// Deterministic DFS over the closure rooted at `entries`, honoring
    /// `scope`, preload exclusivity, and Packet isolation (spec.md §4.5).
    /// `lookup` resolves a `ModuleRef` to its owning Packet's module table;
    /// `packet_isolated` reports whether a given Packet is `isolated`. Both
    /// stay injected closures so this never needs to borrow the whole
    /// forest itself.
    ///
    /// Children are visited in `Module.children` order (insertion order from
    /// the matcher's left-to-right scan), not sorted — bundle output must be
    /// byte-identical for the same source tree, and the matcher's scan order
    /// already is deterministic, so no extra sort is needed.
    ///
    /// Per spec.md §4.5: after an entry's children are iterated, the entry
    /// itself is yielded (if its extension matches `format`); for `.js`,
    /// the entry's children are walked a second time afterwards, so any
    /// dependency a transpiler helper only introduces post-transform would
    /// still be picked up. Porter's built-in transpiler never introduces
    /// such a dependency, so today that second pass is a no-op — it's kept
    /// so a real transpiler plugged in via the `ScriptTranspiler` seam can
    /// rely on it.
    pub fn traverse<'a, F, G>(&self, roots: &[ModuleRef], lookup: F, packet_isolated: G) -> Vec<ModuleRef>
    where
        F: Fn(&ModuleRef) -> Option<&'a Module>,
        G: Fn(&PacketRef) -> bool,
    {
        let allow_preloaded = roots
            .iter()
            .any(|r| lookup(r).map(|m| m.is_preload || m.fake || m.is_worker).unwrap_or(false))
            || packet_isolated(&self.packet);

        let mut visited: HashSet<ModuleRef> = HashSet::new();
        let mut order: Vec<ModuleRef> = Vec::new();

        for root in roots {
            self.walk(root, &lookup, &packet_isolated, allow_preloaded, &mut visited, &mut order, true);
        }
        order
    }

    #[allow(clippy::too_many_arguments)]
    fn walk<'a, F, G>(
        &self,
        current: &ModuleRef,
        lookup: &F,
        packet_isolated: &G,
        allow_preloaded: bool,
        visited: &mut HashSet<ModuleRef>,
        order: &mut Vec<ModuleRef>,
        is_entry: bool,
    ) where
        F: Fn(&ModuleRef) -> Option<&'a Module>,
        G: Fn(&PacketRef) -> bool,
    {
        if visited.contains(current) {
            return;
        }
        let Some(module) = lookup(current) else {
            visited.insert(current.clone());
            order.push(current.clone());
            return;
        };

        if !is_entry {
            match self.scope {
                Scope::Module => return,
                Scope::Packet => {
                    if current.packet != self.packet {
                        return;
                    }
                }
                Scope::All => {}
            }
            if self.format == "js" {
                if module.preloaded && !allow_preloaded {
                    return;
                }
                if current.packet != self.packet && packet_isolated(&current.packet) {
                    return;
                }
            }
        }

        visited.insert(current.clone());

        if module.isolated {
            order.push(current.clone());
            return;
        }

        for child in &module.children {
            self.walk(child, lookup, packet_isolated, allow_preloaded, visited, order, false);
        }

        let matches_format = if self.format == "css" {
            module.id.ends_with(".css")
        } else {
            !module.id.ends_with(".css")
        };
        if matches_format {
            order.push(current.clone());
        }

        if is_entry && self.format == "js" {
            for child in &module.children {
                self.walk(child, lookup, packet_isolated, allow_preloaded, visited, order, false);
            }
        }
    }

    /// `contenthash` = first 8 hex chars of the md5 digest of `code`
    /// (spec.md §4.5).
    pub fn compute_contenthash(code: &str) -> String {
        let digest = md5::compute(code.as_bytes());
        format!("{digest:x}")[..8].to_string()
    }

    /// Builds a simplified v3 source map covering `sources`: no real
    /// per-line `mappings` are generated since Porter's built-in
    /// transpiler is a pass-through (the real Babel-like/TypeScript-like
    /// transform is an external collaborator per spec.md §1) — but the
    /// `sources` list itself, which is what scenario S5 actually checks, is
    /// exact.
    pub fn merge_source_map<'a>(sources: impl IntoIterator<Item = &'a str>) -> String {
        let list: Vec<&str> = sources.into_iter().collect();
        let sources_json = serde_json::to_string(&list).unwrap_or_else(|_| "[]".to_string());
        format!(r#"{{"version":3,"sourceRoot":"/","sources":{sources_json},"names":[],"mappings":""}}"#)
    }

    /// Output filename: `<entry>.<contenthash>.<format>` once a contenthash
    /// has been computed, `<entry>.<format>` before that (spec.md §4.5). A
    /// non-root Packet's bundle is additionally qualified by `<name>/<version>/`
    /// so dependency artifacts never collide with the root's own.
    pub fn output_path(&self) -> String {
        let entry = self.entries.join("+");
        let output = match &self.contenthash {
            Some(hash) => format!("{entry}.{hash}.{}", self.format),
            None => format!("{entry}.{}", self.format),
        };
        match &self.packet {
            PacketRef::Root => output,
            PacketRef::Dependency { name, version } => format!("{name}/{version}/{output}"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn module(id: &str, children: &[&str]) -> Module {
        let mut m = Module::new(id, id.into(), id.into());
        m.children = children
            .iter()
            .map(|c| ModuleRef::new(PacketRef::Root, *c))
            .collect();
        m
    }

    fn no_isolated_packets(_: &PacketRef) -> bool {
        false
    }

    #[test]
    fn traverse_visits_each_module_once_in_deterministic_order() {
        let mut files = HashMap::new();
        files.insert("a.js".to_string(), module("a.js", &["b.js", "c.js"]));
        files.insert("b.js".to_string(), module("b.js", &["c.js"]));
        files.insert("c.js".to_string(), module("c.js", &[]));

        let bundle = Bundle::new(PacketRef::Root, vec!["a.js".to_string()], "js", Scope::All);
        let root = ModuleRef::new(PacketRef::Root, "a.js");
        let order = bundle.traverse(&[root], |r| files.get(&r.id), no_isolated_packets);

        // Postorder: each module is yielded only after its own children have
        // been (spec.md §4.5 "After iterating an entry's children, the entry
        // itself is yielded").
        let ids: Vec<_> = order.iter().map(|r| r.id.as_str()).collect();
        assert_eq!(ids, vec!["c.js", "b.js", "a.js"]);
    }

    #[test]
    fn module_scope_stops_at_the_root() {
        let mut files = HashMap::new();
        files.insert("a.js".to_string(), module("a.js", &["b.js"]));
        files.insert("b.js".to_string(), module("b.js", &[]));

        let bundle = Bundle::new(PacketRef::Root, vec!["a.js".to_string()], "js", Scope::Module);
        let root = ModuleRef::new(PacketRef::Root, "a.js");
        let order = bundle.traverse(&[root], |r| files.get(&r.id), no_isolated_packets);
        assert_eq!(order.len(), 1);
        assert_eq!(order[0].id, "a.js");
    }

    #[test]
    fn isolated_modules_are_leaves() {
        let mut files = HashMap::new();
        let mut a = module("a.js", &["b.js"]);
        a.isolated = false;
        let mut b = module("b.js", &["c.js"]);
        b.isolated = true;
        files.insert("a.js".to_string(), a);
        files.insert("b.js".to_string(), b);
        files.insert("c.js".to_string(), module("c.js", &[]));

        let bundle = Bundle::new(PacketRef::Root, vec!["a.js".to_string()], "js", Scope::All);
        let root = ModuleRef::new(PacketRef::Root, "a.js");
        let order = bundle.traverse(&[root], |r| files.get(&r.id), no_isolated_packets);
        let ids: Vec<_> = order.iter().map(|r| r.id.as_str()).collect();
        assert_eq!(ids, vec!["b.js", "a.js"]);
    }

    #[test]
    fn preloaded_modules_are_excluded_unless_the_entry_allows_it() {
        let mut files = HashMap::new();
        files.insert("a.js".to_string(), module("a.js", &["b.js"]));
        let mut b = module("b.js", &[]);
        b.preloaded = true;
        files.insert("b.js".to_string(), b);

        let bundle = Bundle::new(PacketRef::Root, vec!["a.js".to_string()], "js", Scope::All);
        let root = ModuleRef::new(PacketRef::Root, "a.js");
        let order = bundle.traverse(&[root], |r| files.get(&r.id), no_isolated_packets);
        let ids: Vec<_> = order.iter().map(|r| r.id.as_str()).collect();
        assert_eq!(ids, vec!["a.js"]);
    }

    #[test]
    fn a_module_owned_by_an_isolated_child_packet_is_skipped() {
        let mut files = HashMap::new();
        let dep = PacketRef::dependency("wasm-dep", "1.0.0");
        let mut a = module("a.js", &[]);
        a.children = vec![ModuleRef::new(dep.clone(), "index.js".to_string())];
        files.insert(ModuleRef::new(PacketRef::Root, "a.js"), a);
        files.insert(ModuleRef::new(dep.clone(), "index.js"), module("index.js", &[]));

        let bundle = Bundle::new(PacketRef::Root, vec!["a.js".to_string()], "js", Scope::All);
        let root = ModuleRef::new(PacketRef::Root, "a.js");
        let order = bundle.traverse(&[root], |r| files.get(r), |p| *p == dep);
        let ids: Vec<_> = order.iter().map(|r| r.id.as_str()).collect();
        assert_eq!(ids, vec!["a.js"]);
    }

    #[test]
    fn css_format_only_emits_css_modules() {
        let mut files = HashMap::new();
        let mut entry = module("app.css", &["base.css", "helper.js"]);
        entry.children = vec![
            ModuleRef::new(PacketRef::Root, "base.css"),
            ModuleRef::new(PacketRef::Root, "helper.js"),
        ];
        files.insert("app.css".to_string(), entry);
        files.insert("base.css".to_string(), module("base.css", &[]));
        files.insert("helper.js".to_string(), module("helper.js", &[]));

        let bundle = Bundle::new(PacketRef::Root, vec!["app.css".to_string()], "css", Scope::All);
        let root = ModuleRef::new(PacketRef::Root, "app.css");
        let order = bundle.traverse(&[root], |r| files.get(&r.id), no_isolated_packets);
        let ids: Vec<_> = order.iter().map(|r| r.id.as_str()).collect();
        assert_eq!(ids, vec!["base.css", "app.css"]);
    }

    #[test]
    fn contenthash_is_first_eight_hex_chars_of_md5() {
        let hash = Bundle::compute_contenthash("module.exports = 1;");
        assert_eq!(hash.len(), 8);
        assert!(hash.chars().all(|c| c.is_ascii_hexdigit()));
    }

    #[test]
    fn output_path_uses_dot_separator_and_dependency_prefix() {
        let mut bundle = Bundle::new(PacketRef::Root, vec!["home.js".to_string()], "js", Scope::All);
        bundle.contenthash = Some("abcd1234".to_string());
        assert_eq!(bundle.output_path(), "home.js.abcd1234.js");

        let mut dep_bundle = Bundle::new(
            PacketRef::dependency("yen", "1.2.4"),
            vec!["index.js".to_string()],
            "js",
            Scope::Packet,
        );
        dep_bundle.contenthash = Some("deadbeef".to_string());
        assert_eq!(dep_bundle.output_path(), "yen/1.2.4/index.js.deadbeef.js");
    }

    #[test]
    fn merged_source_map_lists_every_source() {
        let map = Bundle::merge_source_map(["components/home.js", "components/home_dep.js", "loader.js"]);
        let value: serde_json::Value = serde_json::from_str(&map).unwrap();
        let sources: Vec<&str> = value["sources"].as_array().unwrap().iter().map(|s| s.as_str().unwrap()).collect();
        assert_eq!(sources, vec!["components/home.js", "components/home_dep.js", "loader.js"]);
    }
}
