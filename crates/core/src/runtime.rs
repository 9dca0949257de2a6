//! Locating the ONNX Runtime shared library for `ort`'s dynamic loading.

use std::env;
use std::path::{Path, PathBuf};

use tracing::{info, warn};

#[cfg(target_os = "linux")]
const ORT_LIB_NAME: &str = "libonnxruntime.so";
#[cfg(target_os = "macos")]
const ORT_LIB_NAME: &str = "libonnxruntime.dylib";
#[cfg(windows)]
const ORT_LIB_NAME: &str = "onnxruntime.dll";

/// How `ORT_DYLIB_PATH` ended up set (or not).
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum OrtLibResolution {
    /// Already set by the environment; left untouched.
    FromEnv(PathBuf),
    /// Found in a candidate directory and exported.
    Discovered(PathBuf),
    NotFound,
}

/// Probe order: `<exe>/` (Windows), `<exe>/lib`, `<exe>/../lib`, `<cwd>/lib`,
/// then the system lib directories on Unix.
fn candidate_lib_dirs() -> Vec<PathBuf> {
    let mut dirs = Vec::new();
    if let Ok(exe) = env::current_exe().and_then(|p| p.canonicalize()) {
        if let Some(exe_dir) = exe.parent() {
            #[cfg(windows)]
            dirs.push(exe_dir.to_path_buf());
            dirs.push(exe_dir.join("lib"));
            if let Some(parent) = exe_dir.parent() {
                dirs.push(parent.join("lib"));
            }
        }
    }
    if let Ok(cwd) = env::current_dir() {
        let cwd_lib = cwd.join("lib");
        if !dirs.contains(&cwd_lib) {
            dirs.push(cwd_lib);
        }
    }
    #[cfg(unix)]
    {
        dirs.push(PathBuf::from("/usr/local/lib"));
        dirs.push(PathBuf::from("/usr/lib"));
    }
    dirs
}

fn find_ort_dylib_in_dirs(dirs: &[PathBuf]) -> Option<PathBuf> {
    dirs.iter()
        .map(|dir| dir.join(ORT_LIB_NAME))
        .find(|candidate| candidate.is_file())
}

/// Export `ORT_DYLIB_PATH` if it is unset and a library can be found.
///
/// Call at the very start of `main()`, before any ORT or tracing init.
pub fn setup_runtime_libs() -> OrtLibResolution {
    if let Some(existing) = env::var_os("ORT_DYLIB_PATH") {
        return OrtLibResolution::FromEnv(PathBuf::from(existing));
    }
    match find_ort_dylib_in_dirs(&candidate_lib_dirs()) {
        Some(path) => {
            env::set_var("ORT_DYLIB_PATH", &path);
            OrtLibResolution::Discovered(path)
        }
        None => OrtLibResolution::NotFound,
    }
}

/// Call after tracing is initialized.
pub fn log_runtime_lib_status(resolution: &OrtLibResolution) {
    match resolution {
        OrtLibResolution::FromEnv(path) | OrtLibResolution::Discovered(path) => {
            if Path::new(path).is_file() {
                info!(path = %path.display(), "ORT library resolved");
            } else {
                warn!(path = %path.display(), "ORT_DYLIB_PATH is set but the file does not exist");
            }
        }
        OrtLibResolution::NotFound => {
            warn!("ORT_DYLIB_PATH not set, ORT will try default search paths");
        }
    }
}
