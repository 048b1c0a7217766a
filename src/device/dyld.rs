//! Device kernel symbol resolution.
//!
//! At handle-registration time, every incarnation carrying a `dyld` name
//! gets its symbol resolved against a `;`-separated list of search paths
//! (directories map to `lib<stem>_sm<cap>.so`, files are used directly)
//! and finally against the host process's own symbol table. The lookup
//! starts at the device's compute capability and retries with lower
//! capability suffixes down to the bare name.

use crate::error::DeviceError;
use libloading::Library;
use std::path::{Path, PathBuf};
use tracing::debug;

/// Compute capabilities a kernel library may be specialized for.
pub const LEGAL_CAPABILITIES: [u32; 8] = [10, 11, 12, 13, 20, 21, 30, 35];

/// File stem of capability-specialized kernel libraries.
pub const KERNEL_LIB_STEM: &str = "dagflow_kernels";

/// Raw device kernel entry point.
pub type KernelFn = unsafe extern "C" fn(*mut core::ffi::c_void) -> i32;

/// A resolved kernel symbol. The originating library is kept alive for
/// as long as the resolution is.
pub struct ResolvedKernel {
    pub symbol_name: String,
    func: KernelFn,
    _lib: Library,
}

impl ResolvedKernel {
    pub fn get(&self) -> KernelFn {
        self.func
    }
}

impl std::fmt::Debug for ResolvedKernel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ResolvedKernel")
            .field("symbol", &self.symbol_name)
            .finish()
    }
}

/// Capability ladder: the device's capability first (when legal), then
/// every lower legal capability, then `None` for the unsuffixed name.
pub fn capability_ladder(capability: u32) -> Vec<Option<u32>> {
    let mut ladder: Vec<Option<u32>> = LEGAL_CAPABILITIES
        .iter()
        .rev()
        .filter(|&&c| c <= capability)
        .map(|&c| Some(c))
        .collect();
    ladder.push(None);
    ladder
}

/// Symbol name for a capability rung: `name_SM<cap>` or the bare name.
pub fn symbol_name(fname: &str, cap: Option<u32>) -> String {
    match cap {
        Some(cap) => format!("{fname}_SM{cap}"),
        None => fname.to_string(),
    }
}

/// Library file a directory entry maps to for a capability rung.
pub fn library_file(dir: &Path, cap: Option<u32>) -> PathBuf {
    match cap {
        Some(cap) => dir.join(format!("lib{KERNEL_LIB_STEM}_sm{cap}.so")),
        None => dir.join(format!("lib{KERNEL_LIB_STEM}.so")),
    }
}

/// Resolves `fname` for a device of the given compute capability,
/// searching `search_path` (a `;`-separated list of directories and
/// files) and then the host process itself.
pub fn resolve(
    fname: &str,
    capability: u32,
    search_path: &str,
) -> Result<ResolvedKernel, DeviceError> {
    for cap in capability_ladder(capability) {
        let symbol = symbol_name(fname, cap);

        for entry in search_path.split(';').filter(|e| !e.is_empty()) {
            let path = Path::new(entry);
            let Ok(meta) = std::fs::metadata(path) else {
                debug!(path = entry, "kernel search path entry does not exist");
                continue;
            };
            let candidate = if meta.is_dir() {
                library_file(path, cap)
            } else {
                path.to_path_buf()
            };
            if let Some(resolved) = try_library(&candidate, &symbol) {
                return Ok(resolved);
            }
        }

        if let Some(resolved) = try_self(&symbol) {
            return Ok(resolved);
        }
    }

    Err(DeviceError::NotFound(fname.to_string()))
}

fn try_library(path: &Path, symbol: &str) -> Option<ResolvedKernel> {
    // SAFETY: loading an arbitrary shared object runs its initializers;
    // the search path is operator-controlled configuration.
    let lib = match unsafe { Library::new(path) } {
        Ok(lib) => lib,
        Err(e) => {
            debug!(path = %path.display(), error = %e, "could not open kernel library");
            return None;
        }
    };
    let func = {
        // SAFETY: the symbol is used through the fixed KernelFn ABI.
        let sym = unsafe { lib.get::<KernelFn>(symbol.as_bytes()) }.ok()?;
        *sym
    };
    debug!(symbol, path = %path.display(), "resolved kernel symbol");
    Some(ResolvedKernel {
        symbol_name: symbol.to_string(),
        func,
        _lib: lib,
    })
}

#[cfg(unix)]
fn try_self(symbol: &str) -> Option<ResolvedKernel> {
    let lib: Library = libloading::os::unix::Library::this().into();
    let func = {
        // SAFETY: as in try_library.
        let sym = unsafe { lib.get::<KernelFn>(symbol.as_bytes()) }.ok()?;
        *sym
    };
    debug!(symbol, "resolved kernel symbol in the host process");
    Some(ResolvedKernel {
        symbol_name: symbol.to_string(),
        func,
        _lib: lib,
    })
}

#[cfg(not(unix))]
fn try_self(_symbol: &str) -> Option<ResolvedKernel> {
    None
}
