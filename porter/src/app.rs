//! Root composition: owns the Config, the Cache, and the whole Packet
//! forest, and is the only thing that sees more than one Packet at once
//! (spec.md §3 "App"). `read_asset` is the plain-function realization of the
//! HTTP contract described in §6 — Porter has no HTTP server of its own
//! (out of scope per spec.md §1), a host embeds this behind whatever
//! middleware it likes, the way the teacher's `dino-server` sits in front of
//! `bundler` rather than the other way around.

use std::collections::{HashMap, HashSet, VecDeque};
use std::path::{Path, PathBuf};

use tracing::{debug, warn};

use crate::bundle::{Bundle, BundleState, Scope};
use crate::cache::{Cache, CacheEntry};
use crate::config::Config;
use crate::error::{BundleError, PorterError, ResolveError};
use crate::matcher::{find_all_css, find_all_js};
use crate::module::{canonical_id, Module, ModuleRef, PacketRef};
use crate::packet::Packet;
use crate::resolver::{self, BrowserOverride, CSS_EXTENSIONS, JS_EXTENSIONS};

/// Outcome of resolving a specifier against the forest (spec.md §4.2).
enum Resolution {
    Found {
        packet: PacketRef,
        fpath: PathBuf,
        id: String,
        case_mismatch: bool,
    },
    Disabled {
        packet: PacketRef,
        id: String,
    },
    Unresolved,
}

/// The plain-function equivalent of an HTTP response (spec.md §6).
#[derive(Debug, Clone)]
pub enum AssetResponse {
    Ok {
        body: Vec<u8>,
        content_type: &'static str,
        etag: String,
        /// Always `max-age=0` (spec.md §6): Porter never serves a bundle
        /// as cacheable without revalidation, since a reload can change its
        /// contenthash at any time.
        cache_control: &'static str,
        /// Source mtime backing this response, where one exists (spec.md
        /// §6 "`Last-Modified` from the source mtime").
        last_modified: Option<std::time::SystemTime>,
    },
    NotModified,
    NotFound,
}

/// Request-side knobs a host would normally read off headers/query string.
#[derive(Debug, Clone, Default)]
pub struct ReadOptions {
    pub if_none_match: Option<String>,
}

pub struct App {
    pub config: Config,
    pub cache: std::sync::Arc<Cache>,
    pub packets: HashMap<PacketRef, Packet>,
}

impl App {
    pub fn new(config: Config) -> Self {
        let cache = std::sync::Arc::new(Cache::new(config.dest.clone()));
        let mut root = Packet::new_root(config.root.clone(), config.paths.clone());
        root.prepare();
        let mut packets = HashMap::new();
        packets.insert(PacketRef::Root, root);
        let mut app = Self {
            config,
            cache,
            packets,
        };
        app.purge_cache();
        app
    }

    fn purge_cache(&self) {
        if self.config.cache.persist {
            return;
        }
        if let Err(err) = self.cache.remove_all(&self.config.cache.except) {
            warn!(?err, "failed to purge cache on startup");
        }
    }

    pub fn add_dependency_packet(&mut self, name: &str, version: &str, root: PathBuf, parent: PacketRef) {
        let key = PacketRef::dependency(name, version);
        let mut packet = Packet::new_dependency(key.clone(), root, parent);
        packet.prepare();
        self.packets.insert(key, packet);
    }

    fn extensions_for(specifier: &str) -> &'static [&'static str] {
        if specifier.ends_with(".css") || specifier.ends_with(".less") {
            CSS_EXTENSIONS
        } else {
            JS_EXTENSIONS
        }
    }

    fn resolve(
        &self,
        from: &PacketRef,
        from_dir: &Path,
        specifier: &str,
        exts: &[&str],
    ) -> Resolution {
        if let Some(from_packet) = self.packets.get(from) {
            match resolver::apply_browser_field(specifier, &from_packet.browser) {
                BrowserOverride::Disabled => {
                    let id = canonical_id(Path::new(specifier.trim_start_matches("./")));
                    return Resolution::Disabled {
                        packet: from.clone(),
                        id,
                    };
                }
                BrowserOverride::Rewrite(target) => {
                    return self.resolve(from, from_dir, &target, exts);
                }
                BrowserOverride::Unchanged => {}
            }
        }

        if specifier.starts_with('.') {
            return match resolver::resolve_relative(from_dir, specifier, exts) {
                Some(found) => {
                    let Some(packet) = self.packets.get(from) else {
                        return Resolution::Unresolved;
                    };
                    let id = packet.relative_id(&found.path);
                    Resolution::Found {
                        packet: from.clone(),
                        fpath: found.path,
                        id,
                        case_mismatch: found.case_mismatch,
                    }
                }
                None => Resolution::Unresolved,
            };
        }

        if let Some(rewritten) = resolver::apply_alias(specifier, &self.config.resolve.alias) {
            let root_dir = self
                .packets
                .get(&PacketRef::Root)
                .map(|p| p.root.clone())
                .unwrap_or_default();
            return self.resolve(&PacketRef::Root, &root_dir, &rewritten, exts);
        }

        self.resolve_bare(from, specifier, exts)
    }

    fn resolve_bare(&self, from: &PacketRef, specifier: &str, exts: &[&str]) -> Resolution {
        let (name, subpath) = split_bare_specifier(specifier);
        let mut cursor = Some(from.clone());
        while let Some(current_ref) = cursor {
            let Some(current) = self.packets.get(&current_ref) else {
                break;
            };
            if let Some(version) = current.lock.get(&name) {
                let target_ref = PacketRef::dependency(&name, version);
                let Some(target) = self.packets.get(&target_ref) else {
                    return Resolution::Unresolved;
                };
                let entry = subpath
                    .clone()
                    .unwrap_or_else(|| target.main.clone().unwrap_or_else(|| "index.js".to_string()));
                let entry = if entry.starts_with('.') {
                    entry
                } else {
                    format!("./{entry}")
                };
                let target_root = target.root.clone();
                return self.resolve(&target_ref, &target_root, &entry, exts);
            }
            cursor = current.parent.clone();
        }
        Resolution::Unresolved
    }

    pub fn parse_entry(
        &mut self,
        packet_ref: PacketRef,
        spec: &str,
    ) -> Result<ModuleRef, PorterError> {
        let exts = Self::extensions_for(spec);
        let (fpath, id) = {
            let packet = self.packets.get(&packet_ref).ok_or_else(|| {
                ResolveError::PacketNotFound {
                    name: packet_ref.to_string(),
                    from: spec.to_string(),
                }
            })?;
            let fpath = packet.resolve_entry(spec, exts).ok_or_else(|| ResolveError::NotFound {
                specifier: spec.to_string(),
                from: packet.root.display().to_string(),
            })?;
            let id = packet.relative_id(&fpath);
            (fpath, id)
        };

        self.ensure_parsed(packet_ref.clone(), id.clone(), fpath)?;
        if let Some(module) = self
            .packets
            .get_mut(&packet_ref)
            .and_then(|p| p.files.get_mut(&id))
        {
            module.is_root_entry = true;
        }
        self.recompute_family();
        Ok(ModuleRef::new(packet_ref, id))
    }

    /// Iterative (non-recursive), worklist-driven parse: resolves `fpath`,
    /// transpiles through the Cache, extracts dependency specifiers, and
    /// queues every unparsed dependency. A module is inserted into `files`
    /// the moment it's visited, before its own children are queued, so a
    /// cycle just finds the id already present and stops (spec.md §4.3,
    /// §8 invariant 4).
    fn ensure_parsed(
        &mut self,
        packet_ref: PacketRef,
        id: String,
        fpath: PathBuf,
    ) -> Result<(), PorterError> {
        let mut worklist: VecDeque<(PacketRef, String, PathBuf)> = VecDeque::new();
        worklist.push_back((packet_ref, id, fpath));

        while let Some((pref, mid, mpath)) = worklist.pop_front() {
            let already = self
                .packets
                .get(&pref)
                .map(|p| p.files.contains_key(&mid))
                .unwrap_or(false);
            if already {
                continue;
            }

            let source = std::fs::read_to_string(&mpath)?;
            let is_css = mid.ends_with(".css");
            let packet_root = self.packets.get(&pref).map(|p| p.root.clone()).unwrap_or_default();
            let fingerprint = {
                let packet = self.packets.get(&pref).unwrap();
                if is_css {
                    packet.style_transpiler.fingerprint()
                } else {
                    packet.script_transpiler.fingerprint()
                }
            };
            let source_hash = crate::cache::source_hash(&source, &fingerprint);

            let cache = self.cache.clone();
            let transpiled = {
                let packet = self.packets.get(&pref).unwrap();
                let mpath_clone = mpath.clone();
                let source_clone = source.clone();
                if is_css {
                    let style = packet.style_transpiler.clone();
                    cache.get_or_compute(&mid, &source_hash, move || {
                        let out = style
                            .transpile(&mpath_clone, &source_clone)
                            .map_err(crate::error::CacheError::from_transpile)?;
                        Ok(CacheEntry {
                            code: out.code,
                            map: out.map,
                        })
                    })?
                } else {
                    let script = packet.script_transpiler.clone();
                    cache.get_or_compute(&mid, &source_hash, move || {
                        let out = script
                            .transpile(&mpath_clone, &source_clone)
                            .map_err(crate::error::CacheError::from_transpile)?;
                        Ok(CacheEntry {
                            code: out.code,
                            map: out.map,
                        })
                    })?
                }
            };

            let raw_specifiers = if is_css {
                find_all_css(&transpiled.code)?
            } else {
                find_all_js(&transpiled.code)?
            };

            let file_rel = mpath.strip_prefix(&packet_root).unwrap_or(&mpath).to_path_buf();
            let mut module = Module::new(mid.clone(), file_rel, mpath.clone());
            module.code = transpiled.code;
            module.map = transpiled.map;
            module.mtime = std::fs::metadata(&mpath).and_then(|m| m.modified()).ok();

            let from_dir = mpath.parent().map(Path::to_path_buf).unwrap_or_default();
            let child_exts = if is_css { CSS_EXTENSIONS } else { JS_EXTENSIONS };
            let mut children = Vec::new();
            for raw in raw_specifiers {
                match self.resolve(&pref, &from_dir, &raw, child_exts) {
                    Resolution::Found {
                        packet,
                        fpath: child_fpath,
                        id: child_id,
                        case_mismatch,
                    } => {
                        if case_mismatch {
                            warn!(specifier = %raw, id = %child_id, "resolved path differs in case from disk");
                        }
                        children.push(ModuleRef::new(packet.clone(), child_id.clone()));
                        let pending = self
                            .packets
                            .get(&packet)
                            .map(|p| !p.files.contains_key(&child_id))
                            .unwrap_or(true);
                        if pending {
                            worklist.push_back((packet, child_id, child_fpath));
                        }
                    }
                    Resolution::Disabled { packet, id } => {
                        children.push(ModuleRef::new(packet.clone(), id.clone()));
                        if let Some(target) = self.packets.get_mut(&packet) {
                            let fake_id = id.clone();
                            target.files.entry(id).or_insert_with(|| Module::fake(fake_id));
                        }
                    }
                    Resolution::Unresolved => {
                        debug!(specifier = %raw, from = %mid, "dependency did not resolve");
                        let fake_id = raw.clone();
                        children.push(ModuleRef::new(pref.clone(), fake_id.clone()));
                        if let Some(target) = self.packets.get_mut(&pref) {
                            target.files.entry(fake_id).or_insert_with(|| Module::fake(raw.clone()));
                        }
                    }
                }
            }
            module.children = children;

            if let Some(target) = self.packets.get_mut(&pref) {
                target.files.insert(mid, module);
            }
        }
        Ok(())
    }

    /// Bounded least-fixed-point relaxation over every Module's `children`
    /// edge, computing `family` (the transitive closure including self) for
    /// the whole forest at once. Monotone (a set only ever grows), so it's
    /// cycle-safe without a separate visited-set.
    fn recompute_family(&mut self) {
        let mut children_of: HashMap<ModuleRef, Vec<ModuleRef>> = HashMap::new();
        for (pref, packet) in &self.packets {
            for (id, module) in &packet.files {
                children_of.insert(ModuleRef::new(pref.clone(), id.clone()), module.children.clone());
            }
        }
        let mut family: HashMap<ModuleRef, HashSet<ModuleRef>> = children_of
            .keys()
            .map(|k| (k.clone(), HashSet::from([k.clone()])))
            .collect();

        let mut changed = true;
        let mut guard = 0usize;
        while changed && guard <= children_of.len() {
            changed = false;
            guard += 1;
            for (key, children) in &children_of {
                let mut additions = Vec::new();
                if let Some(current) = family.get(key) {
                    for child in children {
                        if let Some(child_family) = family.get(child) {
                            for m in child_family {
                                if !current.contains(m) {
                                    additions.push(m.clone());
                                }
                            }
                        }
                    }
                }
                if !additions.is_empty() {
                    changed = true;
                    family.get_mut(key).unwrap().extend(additions);
                }
            }
        }

        for (key, set) in family {
            if let Some(packet) = self.packets.get_mut(&key.packet) {
                if let Some(module) = packet.files.get_mut(&key.id) {
                    module.family = set;
                }
            }
        }
    }

    /// The id a module is wrapped under at its `define()` call site: its own
    /// id when it belongs to the bundle's own Packet, `<name>/<version>/<id>`
    /// when it was pulled in from a dependency Packet — the same addressing
    /// a `porter.lock`-aware client `require()` needs to pick the right
    /// version.
    fn emission_id(bundle_packet: &PacketRef, module_ref: &ModuleRef) -> String {
        if &module_ref.packet == bundle_packet {
            return module_ref.id.clone();
        }
        match &module_ref.packet {
            PacketRef::Root => module_ref.id.clone(),
            PacketRef::Dependency { name, version } => format!("{name}/{version}/{}", module_ref.id),
        }
    }

    pub fn obtain_bundle(
        &mut self,
        packet_ref: PacketRef,
        entries: Vec<String>,
        format: &'static str,
        scope: Scope,
    ) -> Result<String, PorterError> {
        let bundle_key = entries.join("+");
        let roots: Vec<ModuleRef> = entries
            .iter()
            .map(|e| ModuleRef::new(packet_ref.clone(), e.clone()))
            .collect();
        let any_present = roots.iter().any(|root| {
            self.packets
                .get(&root.packet)
                .map(|p| p.files.contains_key(&root.id))
                .unwrap_or(false)
        });
        if !any_present {
            // A missing script entry is fatal; a missing CSS companion (no
            // stylesheet next to a JS entry) is just an empty bundle
            // (spec.md §7: "`Bundle.obtain` treats a missing script entry as
            // fatal ... but a missing CSS companion as empty").
            if format == "css" {
                let bundle = self
                    .packets
                    .get_mut(&packet_ref)
                    .unwrap()
                    .bundles
                    .entry(bundle_key.clone())
                    .or_insert_with(|| Bundle::new(packet_ref.clone(), entries.clone(), format, scope));
                bundle.code = Some(String::new());
                bundle.map = Some(Bundle::merge_source_map(std::iter::empty::<&str>()));
                let contenthash = Bundle::compute_contenthash("");
                bundle.contenthash = Some(contenthash.clone());
                bundle.etag = Some(contenthash);
                bundle.state = BundleState::Idle;
                return Ok(String::new());
            }
            return Err(BundleError::MissingEntry(
                roots.first().map(|r| r.id.clone()).unwrap_or_default(),
            )
            .into());
        }

        let files_snapshot: HashMap<ModuleRef, Module> = self
            .packets
            .iter()
            .flat_map(|(pref, packet)| {
                packet
                    .files
                    .iter()
                    .map(move |(id, m)| (ModuleRef::new(pref.clone(), id.clone()), m.clone()))
            })
            .collect();
        let isolated_packets: HashSet<PacketRef> = self
            .packets
            .iter()
            .filter(|(_, p)| p.isolated)
            .map(|(k, _)| k.clone())
            .collect();

        let bundle = self
            .packets
            .get_mut(&packet_ref)
            .unwrap()
            .bundles
            .entry(bundle_key.clone())
            .or_insert_with(|| Bundle::new(packet_ref.clone(), entries.clone(), format, scope));
        bundle.state = BundleState::Rebuilding;

        let order = bundle.traverse(&roots, |r| files_snapshot.get(r), |p| isolated_packets.contains(p));

        let is_root_entry_bundle = roots
            .first()
            .and_then(|r| files_snapshot.get(r))
            .map(|m| m.is_root_entry)
            .unwrap_or(false);

        let mut code = String::new();
        let mut seen_sources = HashSet::new();
        let mut sources: Vec<String> = Vec::new();
        for module_ref in &order {
            let Some(module) = files_snapshot.get(module_ref) else {
                continue;
            };
            let emit_id = Self::emission_id(&packet_ref, module_ref);
            code.push_str(&wrap_module(&emit_id, &module.code));

            if !module.fake {
                let source = module.file.to_string_lossy().replace('\\', "/");
                if !source.is_empty() && seen_sources.insert(source.clone()) {
                    sources.push(source);
                }
            }
        }
        if is_root_entry_bundle && format == "js" {
            sources.push("loader.js".to_string());
        }
        let bundle_map = Bundle::merge_source_map(sources.iter().map(String::as_str));
        let contenthash = Bundle::compute_contenthash(&code);

        let bundle = self
            .packets
            .get_mut(&packet_ref)
            .unwrap()
            .bundles
            .get_mut(&bundle_key)
            .unwrap();
        bundle.code = Some(code.clone());
        bundle.map = Some(bundle_map.clone());
        bundle.contenthash = Some(contenthash.clone());
        bundle.etag = Some(contenthash);
        bundle.state = BundleState::Idle;
        let output_path = bundle.output_path();

        self.persist_bundle(&output_path, &code, &bundle_map)?;
        self.update_manifest(&bundle_key, &output_path)?;
        Ok(code)
    }

    /// Writes the bundle body plus its sibling `.map` under `dest`, matching
    /// the persisted layout spec.md §6 describes: `<file>.<hash>.<ext>` (or
    /// `<name>/<version>/<file>.<hash>.<ext>` for a dependency bundle).
    fn persist_bundle(&self, output_path: &str, code: &str, map: &str) -> Result<(), PorterError> {
        self.cache.write_file(Path::new(output_path), code.as_bytes())?;
        self.cache
            .write_file(Path::new(&format!("{output_path}.map")), map.as_bytes())?;
        Ok(())
    }

    /// Appends one logical-entry-id → hashed-filename pair to the persisted
    /// manifest (spec.md §6: "a manifest mapping logical entry ids to their
    /// hashed filenames"). Read-modify-write since a manifest is small and
    /// bundle builds aren't on any hot request path a host would parallelize
    /// against itself.
    fn update_manifest(&self, logical_id: &str, output_path: &str) -> Result<(), PorterError> {
        let manifest_path = Path::new("manifest.json");
        let mut manifest: serde_json::Map<String, serde_json::Value> = self
            .cache
            .read_file(manifest_path)
            .and_then(|bytes| serde_json::from_slice(&bytes).ok())
            .unwrap_or_default();
        manifest.insert(logical_id.to_string(), serde_json::Value::String(output_path.to_string()));
        let bytes = serde_json::to_vec_pretty(&manifest)?;
        self.cache.write_file(manifest_path, &bytes)?;
        Ok(())
    }

    pub fn mark_dirty(&mut self, changed: &ModuleRef) {
        for packet in self.packets.values_mut() {
            for bundle in packet.bundles.values_mut() {
                let bundle_root_in_family = bundle.entries.iter().any(|e| {
                    packet
                        .files
                        .get(e)
                        .map(|m| m.family.contains(changed))
                        .unwrap_or(false)
                });
                if bundle_root_in_family {
                    bundle.mark_dirty();
                }
            }
        }
    }

    /// Finds which Packet/id owns the module whose source lives at `path`
    /// (an absolute path, as delivered by `Watcher::changed()`).
    fn locate_module_by_path(&self, path: &Path) -> Option<(PacketRef, String, PathBuf)> {
        for (pref, packet) in &self.packets {
            for module in packet.files.values() {
                if module.fpath == path {
                    return Some((pref.clone(), module.id.clone(), module.fpath.clone()));
                }
            }
        }
        None
    }

    /// `Packet.reload(event, relPath)` (spec.md §4.6): re-runs `parseFile`
    /// on the changed source, replacing its `children`/`code`/`map`, then
    /// schedules every Bundle whose `family` contains it for `_reload`.
    /// Idempotent — calling it twice for the same unchanged path (spec.md
    /// §9's open question about unreliable recursive watches on some
    /// platforms) just reparses identical content and reloads bundles that
    /// are already fresh, a no-op in effect.
    pub fn reload(&mut self, _event: &str, path: &Path) -> Result<(), PorterError> {
        let Some((packet_ref, id, fpath)) = self.locate_module_by_path(path) else {
            return Ok(());
        };
        if let Some(packet) = self.packets.get_mut(&packet_ref) {
            packet.files.remove(&id);
        }
        self.ensure_parsed(packet_ref.clone(), id.clone(), fpath)?;
        self.recompute_family();

        let changed = ModuleRef::new(packet_ref, id);
        self.mark_dirty(&changed);
        self.reload_dirty_bundles()
    }

    /// Drains whatever paths a live `Watcher` has debounced since the last
    /// poll and reloads each one. A host embedding Porter calls this from
    /// its own event loop; Porter has no event loop to drive the watcher
    /// into on its own (spec.md §1 excludes process/CLI entry points).
    pub fn poll_watch(&mut self, watcher: &crate::watcher::Watcher) -> Result<(), PorterError> {
        for path in watcher.changed() {
            self.reload("change", &path)?;
        }
        Ok(())
    }

    fn reload_dirty_bundles(&mut self) -> Result<(), PorterError> {
        let mut dirty: Vec<(PacketRef, String)> = Vec::new();
        for (pref, packet) in &self.packets {
            for (key, bundle) in &packet.bundles {
                if bundle.state == BundleState::Dirty {
                    dirty.push((pref.clone(), key.clone()));
                }
            }
        }
        for (pref, key) in dirty {
            self.reload_bundle(&pref, &key)?;
        }
        Ok(())
    }

    /// `Bundle._reload` (spec.md §4.6): deletes the stale output file,
    /// clears cached `code`/`map`/`etag`/`contenthash`, and triggers a
    /// fresh `obtain`.
    fn reload_bundle(&mut self, packet_ref: &PacketRef, bundle_key: &str) -> Result<(), PorterError> {
        let Some((output_path, entries, format, scope)) = self.packets.get(packet_ref).and_then(|p| {
            p.bundles
                .get(bundle_key)
                .map(|b| (b.output_path(), b.entries.clone(), b.format, b.scope))
        }) else {
            return Ok(());
        };

        let _ = std::fs::remove_file(self.cache.dest().join(&output_path));
        if let Some(packet) = self.packets.get_mut(packet_ref) {
            if let Some(bundle) = packet.bundles.get_mut(bundle_key) {
                bundle.code = None;
                bundle.map = None;
                bundle.etag = None;
                bundle.contenthash = None;
                bundle.state = BundleState::Rebuilding;
            }
        }
        self.obtain_bundle(packet_ref.clone(), entries, format, scope)?;
        Ok(())
    }

    /// Splits `<name>/<version>/<path>` special ids (spec.md §6) from the
    /// set of dependency Packets currently in the forest.
    fn split_versioned_path(&self, path: &str) -> Option<(String, String, String)> {
        for key in self.packets.keys() {
            if let PacketRef::Dependency { name, version } = key {
                let prefix = format!("{name}/{version}/");
                if let Some(rest) = path.strip_prefix(prefix.as_str()) {
                    return Some((name.clone(), version.clone(), rest.to_string()));
                }
            }
        }
        None
    }

    pub fn read_asset(&mut self, path: &str, opts: &ReadOptions) -> Result<AssetResponse, PorterError> {
        let (path, is_main) = split_main_query(path);

        if path == "loaderConfig.json" {
            let body = serde_json::to_vec_pretty(&self.loader_config())?;
            return Ok(AssetResponse::Ok {
                body,
                content_type: "application/json",
                etag: "loader-config".to_string(),
                cache_control: "max-age=0",
                last_modified: None,
            });
        }
        if path == "loader.js" {
            let body = format!("{LOADER_JS}\n{}", self.loader_config_js()?);
            return Ok(AssetResponse::Ok {
                body: body.into_bytes(),
                content_type: "application/javascript",
                etag: "loader".to_string(),
                cache_control: "max-age=0",
                last_modified: None,
            });
        }
        if path == "porter-sw.js" {
            return Ok(AssetResponse::Ok {
                body: PORTER_SW_JS.as_bytes().to_vec(),
                content_type: "application/javascript",
                etag: "porter-sw".to_string(),
                cache_control: "max-age=0",
                last_modified: None,
            });
        }
        if self.config.source.serve {
            if let Some(response) = self.read_raw_source(path)? {
                return Ok(response);
            }
        }
        if let Some(stem) = path.strip_suffix(".map") {
            return self.read_source_map(stem);
        }
        if let Some((name, version, rest)) = self.split_versioned_path(path) {
            return self.read_dependency_asset(&name, &version, &rest, opts);
        }

        let content_type = if path.ends_with(".css") {
            "text/css"
        } else {
            "application/javascript"
        };
        let format: &'static str = if path.ends_with(".css") { "css" } else { "js" };
        let entry = canonical_id(Path::new(path));

        let present = self
            .packets
            .get(&PacketRef::Root)
            .map(|p| p.files.contains_key(&entry))
            .unwrap_or(false);
        if !present {
            match self.parse_entry(PacketRef::Root, &entry) {
                Ok(_) => {}
                Err(PorterError::Resolve(_)) => return Ok(AssetResponse::NotFound),
                Err(err) => return Err(err),
            }
        }
        if is_main {
            if let Some(module) = self
                .packets
                .get_mut(&PacketRef::Root)
                .and_then(|p| p.files.get_mut(&entry))
            {
                module.is_root_entry = true;
            }
        }

        let code = self.obtain_bundle(PacketRef::Root, vec![entry.clone()], format, Scope::All)?;
        let etag = self
            .packets
            .get(&PacketRef::Root)
            .and_then(|p| p.bundles.get(&entry))
            .and_then(|b| b.etag.clone())
            .unwrap_or_default();

        if let Some(candidate) = &opts.if_none_match {
            if candidate == &etag {
                return Ok(AssetResponse::NotModified);
            }
        }

        let body = if is_main && format == "js" {
            format!("{LOADER_JS}\n{}{code}\nporter.import(\"{entry}\");\n", self.lock_snapshot_js())
        } else {
            code
        };

        let last_modified = self.latest_mtime(&PacketRef::Root, &entry);
        Ok(AssetResponse::Ok {
            body: body.into_bytes(),
            content_type,
            etag,
            cache_control: "max-age=0",
            last_modified,
        })
    }

    /// Serves a file's raw, untranspiled contents straight off disk when
    /// `source.serve` is on (spec.md §6: "any path under a configured source
    /// root or `node_modules` returns raw source for devtools"). Returns
    /// `None` for any path outside those two roots so the caller falls back
    /// to the normal bundle routes.
    fn read_raw_source(&self, path: &str) -> Result<Option<AssetResponse>, PorterError> {
        let under_source_root = {
            let root = self.config.source.root.trim_start_matches('/');
            root.is_empty() || path.starts_with(root)
        };
        let under_node_modules = path.starts_with("node_modules/");
        if !under_source_root && !under_node_modules {
            return Ok(None);
        }

        let rel = if under_node_modules {
            Path::new(path).to_path_buf()
        } else {
            let root = self.config.source.root.trim_start_matches('/');
            Path::new(path.strip_prefix(root).unwrap_or(path)).to_path_buf()
        };
        let fpath = self.config.root.join(&rel);
        let Ok(contents) = std::fs::read(&fpath) else {
            return Ok(None);
        };
        let content_type = if path.ends_with(".css") {
            "text/css"
        } else if path.ends_with(".json") {
            "application/json"
        } else {
            "application/javascript"
        };
        let last_modified = std::fs::metadata(&fpath).and_then(|m| m.modified()).ok();
        let etag = format!("{:x}", md5::compute(&contents));
        Ok(Some(AssetResponse::Ok {
            body: contents,
            content_type,
            etag,
            cache_control: "max-age=0",
            last_modified,
        }))
    }

    /// `<path>.map` sibling route (spec.md §6): re-obtains the same bundle
    /// (a no-op if it's already built) and serves its merged source map.
    fn read_source_map(&mut self, stem: &str) -> Result<AssetResponse, PorterError> {
        let format: &'static str = if stem.ends_with(".css") { "css" } else { "js" };
        let entry = canonical_id(Path::new(stem));

        let present = self
            .packets
            .get(&PacketRef::Root)
            .map(|p| p.files.contains_key(&entry))
            .unwrap_or(false);
        if !present {
            match self.parse_entry(PacketRef::Root, &entry) {
                Ok(_) => {}
                Err(PorterError::Resolve(_)) => return Ok(AssetResponse::NotFound),
                Err(err) => return Err(err),
            }
        }

        self.obtain_bundle(PacketRef::Root, vec![entry.clone()], format, Scope::All)?;
        let map = self
            .packets
            .get(&PacketRef::Root)
            .and_then(|p| p.bundles.get(&entry))
            .and_then(|b| b.map.clone())
            .unwrap_or_else(|| "{}".to_string());

        Ok(AssetResponse::Ok {
            body: map.into_bytes(),
            content_type: "application/json",
            etag: format!("{entry}.map"),
            cache_control: "max-age=0",
            last_modified: self.latest_mtime(&PacketRef::Root, &entry),
        })
    }

    /// `<name>/<version>/<path>` special id (spec.md §6): serves a file out
    /// of a specific dependency Packet rather than the root.
    fn read_dependency_asset(
        &mut self,
        name: &str,
        version: &str,
        rest: &str,
        opts: &ReadOptions,
    ) -> Result<AssetResponse, PorterError> {
        let packet_ref = PacketRef::dependency(name, version);
        if !self.packets.contains_key(&packet_ref) {
            return Ok(AssetResponse::NotFound);
        }

        let content_type = if rest.ends_with(".css") {
            "text/css"
        } else {
            "application/javascript"
        };
        let format: &'static str = if rest.ends_with(".css") { "css" } else { "js" };
        let entry = canonical_id(Path::new(rest));

        let present = self
            .packets
            .get(&packet_ref)
            .map(|p| p.files.contains_key(&entry))
            .unwrap_or(false);
        if !present {
            match self.parse_entry(packet_ref.clone(), &entry) {
                Ok(_) => {}
                Err(PorterError::Resolve(_)) => return Ok(AssetResponse::NotFound),
                Err(err) => return Err(err),
            }
        }

        let code = self.obtain_bundle(packet_ref.clone(), vec![entry.clone()], format, Scope::Packet)?;
        let etag = self
            .packets
            .get(&packet_ref)
            .and_then(|p| p.bundles.get(&entry))
            .and_then(|b| b.etag.clone())
            .unwrap_or_default();

        if let Some(candidate) = &opts.if_none_match {
            if candidate == &etag {
                return Ok(AssetResponse::NotModified);
            }
        }

        Ok(AssetResponse::Ok {
            body: code.into_bytes(),
            content_type,
            etag,
            cache_control: "max-age=0",
            last_modified: self.latest_mtime(&packet_ref, &entry),
        })
    }

    /// The newest mtime among an entry's own family (spec.md §6
    /// `Last-Modified`): a reload bumping any dependency's mtime should also
    /// bump the bundle's.
    fn latest_mtime(&self, packet_ref: &PacketRef, entry: &str) -> Option<std::time::SystemTime> {
        let packet = self.packets.get(packet_ref)?;
        let entry_module = packet.files.get(entry)?;
        let mut latest = entry_module.mtime;
        for member in &entry_module.family {
            if let Some(module) = self.packets.get(&member.packet).and_then(|p| p.files.get(&member.id)) {
                latest = match (latest, module.mtime) {
                    (Some(a), Some(b)) => Some(a.max(b)),
                    (a, None) => a,
                    (None, b) => b,
                };
            }
        }
        latest
    }

    fn loader_config(&self) -> serde_json::Value {
        let mut lock = serde_json::Map::new();
        for packet in self.packets.values() {
            for (name, version) in &packet.lock {
                lock.insert(name.clone(), serde_json::Value::String(version.clone()));
            }
        }
        serde_json::json!({ "lock": lock, "preload": self.config.preload })
    }

    /// `loader.js` is served as "runtime loader with config appended"
    /// (spec.md §6) rather than a bare script: the same descriptor
    /// `loaderConfig.json` serves, assigned onto `porter.config` so the
    /// loader has its lock table and preload list before any module runs.
    fn loader_config_js(&self) -> Result<String, PorterError> {
        let json = serde_json::to_string(&self.loader_config())?;
        Ok(format!("Object.assign(porter.config, {json});\n"))
    }

    /// `Object.assign(porter.lock, …)` (spec.md §4.5): the flattened lock
    /// snapshot a root-entry request prepends so the client loader can
    /// dispatch bare `require()` calls to the right `(name, version)`.
    fn lock_snapshot_js(&self) -> String {
        let mut lock = serde_json::Map::new();
        for packet in self.packets.values() {
            for (name, version) in &packet.lock {
                lock.insert(name.clone(), serde_json::Value::String(version.clone()));
            }
        }
        let json = serde_json::to_string(&serde_json::Value::Object(lock)).unwrap_or_else(|_| "{}".to_string());
        format!("Object.assign(porter.lock, {json});\n")
    }
}

/// Wraps one module's transpiled code into the `define(id, factory)` form
/// every emitted bundle module takes (spec.md §4.5, scenario S1). `require`
/// is resolved to the loader's own registry at runtime, matching the
/// AMD/CommonJS-hybrid shape a `porter.js`-style client loader expects.
fn wrap_module(id: &str, code: &str) -> String {
    format!("define(\"{id}\", function(require, exports, module) {{\n{code}\n}});\n\n")
}

/// Splits the `?main` query off a request path (spec.md §6: "The `?main`
/// query marks the request as the application entry"). Request decoding in
/// general is an external collaborator's job (spec.md §1's out-of-scope
/// list), but this one bit is part of the asset contract itself: it decides
/// whether `read_asset` prepends the loader and appends `porter.import`.
fn split_main_query(path: &str) -> (&str, bool) {
    match path.split_once('?') {
        Some((id, "main")) => (id, true),
        Some((id, _)) => (id, false),
        None => (path, false),
    }
}

const LOADER_JS: &str = r#"(function (global) {
  var porter = global.porter || (global.porter = {});
  porter.lock = porter.lock || {};
  porter.config = porter.config || {};
  var registry = porter.registry || (porter.registry = {});
  var cache = porter.cache || (porter.cache = {});

  function define(id, factory) {
    registry[id] = factory;
  }

  function req(id) {
    if (cache[id]) return cache[id].exports;
    var factory = registry[id];
    if (!factory) throw new Error('porter: module "' + id + '" is not defined');
    var module = { exports: {} };
    cache[id] = module;
    factory(req, module.exports, module);
    return module.exports;
  }

  porter.define = define;
  porter.import = req;
  global.define = define;
})(typeof window !== 'undefined' ? window : this);"#;

const PORTER_SW_JS: &str = r#"self.addEventListener('install', function (event) {
  self.skipWaiting();
});

self.addEventListener('activate', function (event) {
  event.waitUntil(self.clients.claim());
});"#;

fn split_bare_specifier(specifier: &str) -> (String, Option<String>) {
    if let Some(rest) = specifier.strip_prefix('@') {
        return match rest.find('/') {
            Some(slash) => {
                let (pkg, after) = rest.split_at(slash);
                let name = format!("@{pkg}");
                let after = &after[1..];
                if after.is_empty() {
                    (name, None)
                } else {
                    (name, Some(after.to_string()))
                }
            }
            None => (format!("@{rest}"), None),
        };
    }
    match specifier.split_once('/') {
        Some((name, rest)) => (name.to_string(), Some(rest.to_string())),
        None => (specifier.to_string(), None),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use tempfile::tempdir;

    fn make_app(root: &Path) -> App {
        let mut config = Config::default();
        config.root = root.to_path_buf();
        config.paths = vec![root.to_path_buf()];
        config.dest = root.join("public");
        App::new(config)
    }

    #[test]
    fn parses_entry_and_follows_relative_requires() {
        let dir = tempdir().unwrap();
        fs::write(dir.path().join("home.js"), "require('./a');").unwrap();
        fs::write(dir.path().join("a.js"), "module.exports = 'a';").unwrap();

        let mut app = make_app(dir.path());
        let entry = app.parse_entry(PacketRef::Root, "home.js").unwrap();
        let root = app.packets.get(&PacketRef::Root).unwrap();
        assert!(root.files.contains_key(&entry.id));
        assert!(root.files.contains_key("a.js"));
        assert!(root.files.get(&entry.id).unwrap().is_root_entry);
    }

    #[test]
    fn unresolved_specifier_produces_a_fake_module_not_an_error() {
        let dir = tempdir().unwrap();
        fs::write(dir.path().join("home.js"), "require('totally-missing');").unwrap();

        let mut app = make_app(dir.path());
        let entry = app.parse_entry(PacketRef::Root, "home.js").unwrap();
        let root = app.packets.get(&PacketRef::Root).unwrap();
        let home = root.files.get(&entry.id).unwrap();
        let missing = root.files.get(&home.children[0].id).unwrap();
        assert!(missing.fake);
    }

    #[test]
    fn bundle_wraps_every_module_in_a_define_call() {
        let dir = tempdir().unwrap();
        fs::write(dir.path().join("home.js"), "require('./a');").unwrap();
        fs::write(dir.path().join("a.js"), "module.exports = 'a';").unwrap();

        let mut app = make_app(dir.path());
        app.parse_entry(PacketRef::Root, "home.js").unwrap();
        let code = app
            .obtain_bundle(PacketRef::Root, vec!["home.js".to_string()], "js", Scope::All)
            .unwrap();
        assert!(code.contains("define(\"home.js\""));
        assert!(code.contains("define(\"a.js\""));
    }

    #[test]
    fn bare_specifier_resolves_through_dependency_lock() {
        let dir = tempdir().unwrap();
        fs::write(
            dir.path().join("package.json"),
            r#"{"name":"app","version":"1.0.0","dependencies":{"yen":"1.2.4"}}"#,
        )
        .unwrap();
        fs::write(dir.path().join("home.js"), "var $ = require('yen');").unwrap();
        let dep_root = dir.path().join("yen-1.2.4");
        fs::create_dir_all(&dep_root).unwrap();
        fs::write(
            dep_root.join("package.json"),
            r#"{"name":"yen","version":"1.2.4","main":"index.js"}"#,
        )
        .unwrap();
        fs::write(dep_root.join("index.js"), "module.exports = function () {};").unwrap();

        let mut app = make_app(dir.path());
        app.add_dependency_packet("yen", "1.2.4", dep_root, PacketRef::Root);
        let entry = app.parse_entry(PacketRef::Root, "home.js").unwrap();
        let root = app.packets.get(&PacketRef::Root).unwrap();
        let home = root.files.get(&entry.id).unwrap();
        assert_eq!(home.children[0].packet, PacketRef::dependency("yen", "1.2.4"));
        assert_eq!(home.children[0].id, "index.js");
    }

    #[test]
    fn read_asset_supports_conditional_requests() {
        let dir = tempdir().unwrap();
        fs::write(dir.path().join("home.js"), "module.exports = 1;").unwrap();
        let mut app = make_app(dir.path());

        let AssetResponse::Ok { etag, body, .. } = app.read_asset("home.js", &ReadOptions::default()).unwrap() else {
            panic!("expected a fresh asset");
        };
        assert!(!body.is_empty());

        let repeat = app
            .read_asset(
                "home.js",
                &ReadOptions {
                    if_none_match: Some(etag),
                },
            )
            .unwrap();
        assert!(matches!(repeat, AssetResponse::NotModified));
    }

    #[test]
    fn main_query_prepends_loader_and_lock_and_appends_import() {
        let dir = tempdir().unwrap();
        fs::write(dir.path().join("home.js"), "module.exports = 1;").unwrap();
        let mut app = make_app(dir.path());

        let AssetResponse::Ok { body, .. } = app.read_asset("home.js?main", &ReadOptions::default()).unwrap() else {
            panic!("expected a fresh asset");
        };
        let text = String::from_utf8(body).unwrap();
        assert!(text.contains("porter.lock"));
        assert!(text.contains("Object.assign(porter.lock"));
        assert!(text.contains("define(\"home.js\""));
        assert!(text.contains("porter.import(\"home.js\");"));
    }

    #[test]
    fn ok_responses_carry_cache_control_and_last_modified() {
        let dir = tempdir().unwrap();
        fs::write(dir.path().join("home.js"), "module.exports = 1;").unwrap();
        let mut app = make_app(dir.path());

        let AssetResponse::Ok {
            cache_control,
            last_modified,
            ..
        } = app.read_asset("home.js", &ReadOptions::default()).unwrap()
        else {
            panic!("expected a fresh asset");
        };
        assert_eq!(cache_control, "max-age=0");
        assert!(last_modified.is_some());
    }

    #[test]
    fn loader_js_has_its_config_appended() {
        let dir = tempdir().unwrap();
        let mut app = make_app(dir.path());
        let AssetResponse::Ok { body, .. } = app.read_asset("loader.js", &ReadOptions::default()).unwrap() else {
            panic!("expected loader.js to resolve");
        };
        let text = String::from_utf8(body).unwrap();
        assert!(text.contains("porter.config = porter.config || {};"));
        assert!(text.contains("Object.assign(porter.config,"));
        assert!(text.contains("\"lock\""));
        assert!(text.contains("\"preload\""));
    }

    #[test]
    fn missing_css_companion_is_an_empty_bundle_not_an_error() {
        let dir = tempdir().unwrap();
        fs::write(dir.path().join("home.js"), "module.exports = 1;").unwrap();
        let mut app = make_app(dir.path());

        let code = app
            .obtain_bundle(PacketRef::Root, vec!["home.css".to_string()], "css", Scope::All)
            .unwrap();
        assert_eq!(code, "");
    }

    #[test]
    fn missing_script_entry_is_a_fatal_bundle_error() {
        let dir = tempdir().unwrap();
        fs::write(dir.path().join("home.js"), "module.exports = 1;").unwrap();
        let mut app = make_app(dir.path());

        let err = app
            .obtain_bundle(PacketRef::Root, vec!["missing.js".to_string()], "js", Scope::All)
            .unwrap_err();
        assert!(matches!(err, PorterError::Bundle(BundleError::MissingEntry(_))));
    }

    #[test]
    fn obtaining_a_bundle_persists_it_and_records_the_manifest() {
        let dir = tempdir().unwrap();
        fs::write(dir.path().join("home.js"), "module.exports = 1;").unwrap();
        let mut app = make_app(dir.path());
        app.parse_entry(PacketRef::Root, "home.js").unwrap();
        app.obtain_bundle(PacketRef::Root, vec!["home.js".to_string()], "js", Scope::All)
            .unwrap();

        let root = app.packets.get(&PacketRef::Root).unwrap();
        let output_path = root.bundles.get("home.js").unwrap().output_path();
        assert!(app.cache.dest().join(&output_path).exists());
        assert!(app.cache.dest().join(format!("{output_path}.map")).exists());

        let manifest: serde_json::Value =
            serde_json::from_slice(&app.cache.read_file(Path::new("manifest.json")).unwrap()).unwrap();
        assert_eq!(manifest["home.js"], serde_json::Value::String(output_path));
    }

    #[test]
    fn devtools_source_serving_returns_raw_file_contents() {
        let dir = tempdir().unwrap();
        fs::write(dir.path().join("home.js"), "var x = 1; // raw").unwrap();
        let mut config = Config::default();
        config.root = dir.path().to_path_buf();
        config.paths = vec![dir.path().to_path_buf()];
        config.dest = dir.path().join("public");
        config.source.serve = true;
        let mut app = App::new(config);

        let AssetResponse::Ok { body, content_type, .. } =
            app.read_asset("home.js", &ReadOptions::default()).unwrap()
        else {
            panic!("expected the raw source to resolve");
        };
        assert_eq!(content_type, "application/javascript");
        assert_eq!(String::from_utf8(body).unwrap(), "var x = 1; // raw");
    }
}
