//! Lexical confinement of model-supplied relative paths.

use std::path::{Component, Path, PathBuf};

/// Normalize `relative` so it can be joined under a root without escaping it.
///
/// Root and prefix components are dropped (absolute paths become relative),
/// `.` is ignored, and `..` only pops segments that were pushed earlier, so it
/// can never climb above the root. Purely lexical: symlinks are not resolved.
pub fn confine_relative(relative: &Path) -> PathBuf {
    let mut parts: Vec<&std::ffi::OsStr> = Vec::new();
    for component in relative.components() {
        match component {
            Component::Normal(name) => parts.push(name),
            Component::ParentDir => {
                parts.pop();
            }
            Component::CurDir | Component::RootDir | Component::Prefix(_) => {}
        }
    }
    parts.iter().collect()
}

/// Join `relative` under `root` after confinement.
pub fn join_confined(root: &Path, relative: &str) -> PathBuf {
    // Model output mixes separators; treat backslashes as separators too.
    let unified = relative.replace('\\', "/");
    root.join(confine_relative(Path::new(&unified)))
}
