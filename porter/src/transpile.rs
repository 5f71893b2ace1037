//! Transpiler seam (spec.md §1: "the core... consumes these through narrow
//! interfaces"). The actual Babel-like/TypeScript-like transform and the
//! CSS-import/autoprefixer pipeline are external collaborators; Porter only
//! defines the trait boundary and a pass-through default, the same way the
//! teacher's bundler plugs `Load`/`Resolve` into `swc_bundler::Bundler`
//! rather than owning the transform itself.

use std::path::Path;

use crate::error::TranspileError;

/// A single transpilation result: the emitted code plus an optional source
/// map (JSON, v3 format).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Transpiled {
    pub code: String,
    pub map: Option<String>,
}

/// Fingerprints the options a transpiler was configured with, so that
/// `Cache`'s `sourceHash` changes whenever the configuration would produce
/// different output for the same source.
pub trait OptionFingerprint {
    fn fingerprint(&self) -> String;
}

/// Transpiles a single script module (`.js`/`.jsx`/`.ts`/`.tsx`/`.json`) into
/// plain JS. Implementations are chosen once per Packet during `prepare`
/// (spec.md §4.3).
pub trait ScriptTranspiler: Send + Sync {
    fn transpile(&self, file: &Path, source: &str) -> Result<Transpiled, TranspileError>;
    fn fingerprint(&self) -> String;
}

/// Transpiles a single stylesheet module (`.css`/`.less`).
pub trait StyleTranspiler: Send + Sync {
    fn transpile(&self, file: &Path, source: &str) -> Result<Transpiled, TranspileError>;
    fn fingerprint(&self) -> String;
}

/// Identity transpiler: emits the source unchanged. This is what a Packet
/// falls back to when `prepare` finds no babel-style config file or
/// TypeScript configuration (spec.md §4.3), and it's enough to make JSON
/// imports work via `wrap_json`, matching the teacher's own JSON handling in
/// `bundle::modules::FsModuleLoader::wrap_json`.
#[derive(Debug, Default, Clone)]
pub struct PassthroughTranspiler;

impl ScriptTranspiler for PassthroughTranspiler {
    fn transpile(&self, file: &Path, source: &str) -> Result<Transpiled, TranspileError> {
        let code = if file.extension().and_then(|e| e.to_str()) == Some("json") {
            wrap_json(source)
        } else {
            source.to_string()
        };
        Ok(Transpiled { code, map: None })
    }

    fn fingerprint(&self) -> String {
        "passthrough".to_string()
    }
}

impl StyleTranspiler for PassthroughTranspiler {
    fn transpile(&self, _file: &Path, source: &str) -> Result<Transpiled, TranspileError> {
        Ok(Transpiled {
            code: source.to_string(),
            map: None,
        })
    }

    fn fingerprint(&self) -> String {
        "passthrough".to_string()
    }
}

fn wrap_json(source: &str) -> String {
    format!("module.exports = {source};")
}
