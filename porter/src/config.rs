//! Project configuration, enumerated in full in the design's external
//! interfaces section. Deserializable from a `porter.yml` (or constructed
//! programmatically by an embedding app).

use std::collections::HashMap;
use std::path::PathBuf;

use serde::Deserialize;

fn default_dest() -> PathBuf {
    PathBuf::from("public")
}

fn default_paths() -> Vec<PathBuf> {
    vec![PathBuf::from(".")]
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct SourceConfig {
    /// Expose raw sources for devtools under their configured root.
    pub serve: bool,
    /// Public URL prefix for source-map `sources` entries.
    pub root: String,
}

impl Default for SourceConfig {
    fn default() -> Self {
        Self {
            serve: false,
            root: "/".to_string(),
        }
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct BundleConfig {
    /// Packet names whose contents must not be inlined into root bundles.
    pub exclude: Vec<String>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct TranspileConfig {
    /// Dependency packet names transpiled despite being external.
    pub include: Vec<String>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct ResolveConfig {
    /// Prefix rewrite table applied before bare-specifier resolution.
    pub alias: HashMap<String, String>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct CacheConfig {
    /// Ids excluded from the startup cache purge.
    pub except: Vec<String>,
    /// Keep the cache across restarts.
    pub persist: bool,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct Config {
    pub root: PathBuf,
    #[serde(default = "default_paths")]
    pub paths: Vec<PathBuf>,
    #[serde(default = "default_dest")]
    pub dest: PathBuf,
    /// Explicit entry module ids; empty means "every non-root-entry .js file".
    pub entries: Vec<String>,
    /// Ordered preload entries whose closure is pre-attached to root bundles.
    pub preload: Vec<String>,
    pub bundle: BundleConfig,
    pub transpile: TranspileConfig,
    pub resolve: ResolveConfig,
    pub source: SourceConfig,
    pub cache: CacheConfig,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            root: PathBuf::from("."),
            paths: default_paths(),
            dest: default_dest(),
            entries: Vec::new(),
            preload: Vec::new(),
            bundle: BundleConfig::default(),
            transpile: TranspileConfig::default(),
            resolve: ResolveConfig::default(),
            source: SourceConfig::default(),
            cache: CacheConfig::default(),
        }
    }
}

impl Config {
    pub fn from_yaml(text: &str) -> anyhow::Result<Self> {
        Ok(serde_yaml::from_str(text)?)
    }

    pub fn is_excluded_from_bundle(&self, packet_name: &str) -> bool {
        self.bundle.exclude.iter().any(|n| n == packet_name)
    }

    pub fn should_transpile_dependency(&self, packet_name: &str) -> bool {
        self.transpile.include.iter().any(|n| n == packet_name)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_sane() {
        let cfg = Config::default();
        assert_eq!(cfg.dest, PathBuf::from("public"));
        assert_eq!(cfg.paths, vec![PathBuf::from(".")]);
        assert!(!cfg.cache.persist);
    }

    #[test]
    fn parses_partial_yaml() {
        let yaml = r#"
root: /srv/app
bundle:
  exclude: ["react"]
resolve:
  alias:
    "@": "./components"
"#;
        let cfg = Config::from_yaml(yaml).unwrap();
        assert_eq!(cfg.root, PathBuf::from("/srv/app"));
        assert_eq!(cfg.bundle.exclude, vec!["react".to_string()]);
        assert_eq!(cfg.resolve.alias.get("@").unwrap(), "./components");
        // unspecified fields keep their defaults
        assert_eq!(cfg.dest, PathBuf::from("public"));
    }
}
