use std::collections::{BTreeMap, BTreeSet};
use std::path::{Path, PathBuf};

use anyhow::{Context, Result, bail};
use serde::Deserialize;
use tracing::debug;

/// Per-image metadata, read from `image_info.json` in each image directory.
#[derive(Debug, Clone, Deserialize)]
pub struct ImageInfo {
    /// Tag to build the image under. Directories without one are skipped.
    #[serde(default)]
    pub image_name: Option<String>,
    #[serde(default)]
    pub active: bool,
    /// Image names that must be built before this one.
    #[serde(default)]
    pub depends_on: Vec<String>,
}

/// Scan `images_root` and produce a build order respecting `depends_on`.
///
/// Each subdirectory carrying an `image_info.json` with `active: true` and
/// an `image_name` becomes one `(name, directory)` entry. Ordering is a
/// deterministic topological sort; a dependency cycle or a dependency on an
/// image that is missing or inactive is fatal.
pub fn build_plan(images_root: &Path) -> Result<Vec<(String, PathBuf)>> {
    let mut images: BTreeMap<String, PathBuf> = BTreeMap::new();
    let mut deps: BTreeMap<String, Vec<String>> = BTreeMap::new();

    let entries = std::fs::read_dir(images_root)
        .with_context(|| format!("failed to read image directory {}", images_root.display()))?;
    for entry in entries {
        let entry = entry?;
        let dir = entry.path();
        let info_path = dir.join("image_info.json");
        if !info_path.is_file() {
            continue;
        }
        let contents = std::fs::read_to_string(&info_path)
            .with_context(|| format!("failed to read {}", info_path.display()))?;
        let info: ImageInfo = serde_json::from_str(&contents)
            .with_context(|| format!("invalid {}", info_path.display()))?;
        if !info.active {
            debug!(dir = %dir.display(), "skipping inactive image");
            continue;
        }
        let Some(name) = info.image_name else {
            debug!(dir = %dir.display(), "skipping image without a name");
            continue;
        };
        if images.insert(name.clone(), dir).is_some() {
            bail!("duplicate image name {name:?} under {}", images_root.display());
        }
        deps.insert(name, info.depends_on);
    }

    // Kahn's algorithm over the declared dependencies. Dependencies that
    // were never collected keep their dependents' indegree above zero, so
    // missing images surface as an unsortable remainder just like cycles.
    let mut indegree: BTreeMap<&str, usize> = BTreeMap::new();
    for (name, wanted) in &deps {
        indegree.entry(name).or_insert(0);
        for _ in wanted {
            *indegree.entry(name).or_insert(0) += 1;
        }
    }

    let mut ready: BTreeSet<&str> = indegree
        .iter()
        .filter(|&(_, &count)| count == 0)
        .map(|(&name, _)| name)
        .collect();
    let mut order: Vec<String> = Vec::with_capacity(images.len());

    while let Some(&name) = ready.iter().next() {
        ready.remove(name);
        order.push(name.to_string());
        for (dependent, wanted) in &deps {
            if wanted.iter().any(|d| d == name) {
                let count = indegree
                    .get_mut(dependent.as_str())
                    .context("dependent missing from indegree map")?;
                *count = count.saturating_sub(wanted.iter().filter(|d| *d == name).count());
                if *count == 0 {
                    ready.insert(dependent);
                }
            }
        }
    }

    if order.len() != images.len() {
        let stuck: Vec<&String> = deps
            .keys()
            .filter(|name| !order.contains(*name))
            .collect();
        bail!("circular or missing image dependencies involving {stuck:?}");
    }

    Ok(order
        .into_iter()
        .map(|name| {
            let dir = images[&name].clone();
            (name, dir)
        })
        .collect())
}
