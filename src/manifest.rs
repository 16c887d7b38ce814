//! Kit definition file (YAML)
//!
//! ```yaml
//! library: demo_lib
//! output_root: out
//! kits:
//!   - name: KitA
//!     targets:
//!       - name: synth
//!         command: "make synth"
//!         output_path: synth/netlist.v
//!   - name: KitB
//!     targets:
//!       - name: pnr
//!         command: ["make", "pnr"]
//!         output_path: pnr/top.def
//!         depends_on: ["KitA::synth"]
//!     depends_on_kits: [KitA]
//! ```

use repack_core::{CommandSpec, Error, Kit, KitTarget, Result, TargetId};
use serde::Deserialize;
use std::collections::{BTreeMap, HashMap, HashSet};
use std::path::{Path, PathBuf};

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct KitManifest {
    #[serde(default)]
    pub library: Option<String>,
    /// Relative output paths resolve against this.
    #[serde(default)]
    pub output_root: Option<PathBuf>,
    pub kits: Vec<KitEntry>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct KitEntry {
    pub name: String,
    #[serde(default)]
    pub targets: Vec<TargetEntry>,
    #[serde(default)]
    pub depends_on_kits: Vec<String>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct TargetEntry {
    pub name: String,
    pub command: CommandSpec,
    pub output_path: PathBuf,
    #[serde(default)]
    pub env: BTreeMap<String, String>,
    #[serde(default)]
    pub cwd: Option<PathBuf>,
    /// `kit::target`, or a bare target name in the same kit.
    #[serde(default)]
    pub depends_on: Vec<String>,
}

impl KitManifest {
    pub fn load(path: &Path) -> Result<Self> {
        let text = std::fs::read_to_string(path)
            .map_err(|e| Error::config(format!("cannot read kit file {}: {e}", path.display())))?;
        Self::from_yaml(&text).map_err(|e| match e {
            Error::ConfigError(msg) => Error::config(format!("{}: {msg}", path.display())),
            other => other,
        })
    }

    pub fn from_yaml(text: &str) -> Result<Self> {
        serde_yaml::from_str(text).map_err(|e| Error::config(e.to_string()))
    }

    /// Typed kits. Relative `output_root` and `cwd` values resolve against `base_dir`
    /// (normally the kit file's directory).
    pub fn into_kits(self, base_dir: &Path) -> Result<Vec<Kit>> {
        let output_root = match &self.output_root {
            Some(root) => base_dir.join(root),
            None => base_dir.to_path_buf(),
        };

        let mut kits = Vec::with_capacity(self.kits.len());
        for entry in self.kits {
            let mut kit = Kit::new(&entry.name);
            kit.depends_on_kits = entry.depends_on_kits;
            for t in entry.targets {
                let mut target = KitTarget::new(&entry.name, &t.name, t.command, output_root.join(&t.output_path));
                for dep in &t.depends_on {
                    target = target.after(resolve_dependency(&entry.name, dep)?);
                }
                target.env = t.env;
                target.cwd = t.cwd.map(|cwd| base_dir.join(cwd));
                kit = kit.with_target(target);
            }
            kits.push(kit);
        }
        Ok(kits)
    }
}

fn resolve_dependency(kit: &str, dep: &str) -> Result<TargetId> {
    let dep = dep.trim();
    if dep.is_empty() {
        return Err(Error::config(format!("empty dependency in kit '{kit}'")));
    }
    if dep.contains(repack_core::ID_SEPARATOR) {
        dep.parse()
    } else {
        Ok(TargetId::new(kit, dep))
    }
}

/// Restrict `kits` to `names` plus every kit they need, in declaration order.
/// An empty `names` keeps everything.
pub fn select_kits(kits: Vec<Kit>, names: &[String]) -> Result<Vec<Kit>> {
    if names.is_empty() {
        return Ok(kits);
    }
    let by_name: HashMap<&str, &Kit> = kits.iter().map(|k| (k.name.as_str(), k)).collect();

    let mut wanted: HashSet<String> = HashSet::new();
    let mut stack: Vec<String> = names.to_vec();
    while let Some(name) = stack.pop() {
        let kit = by_name
            .get(name.as_str())
            .ok_or_else(|| Error::config(format!("unknown kit '{name}'")))?;
        if !wanted.insert(name.clone()) {
            continue;
        }
        stack.extend(kit.depends_on_kits.iter().cloned());
        for target in &kit.targets {
            stack.extend(target.depends_on.iter().map(|d| d.kit().to_string()));
        }
    }

    Ok(kits.into_iter().filter(|k| wanted.contains(&k.name)).collect())
}
