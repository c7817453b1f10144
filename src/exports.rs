//! Resolution of well-known exports in system modules.
//!
//! System DLLs such as `kernel32.dll` load at the same base address in every
//! process of a session, so resolving an export locally yields an address
//! that is equally valid inside the target. This is how the engine finds the
//! native loader entry point (`LoadLibraryA`) it hands to the universal call.

use std::ffi::CString;

use windows_sys::Win32::System::LibraryLoader::{GetModuleHandleA, GetProcAddress};

use crate::{debug, Error, Result};

/// Resolves `symbol` inside the already-loaded `module`.
///
/// Fails with [`Error::ModuleNotFound`] if the module is not mapped into the
/// current process, and [`Error::ExportNotFound`] if the symbol is missing
/// from its export table.
pub fn resolve_export(module: &str, symbol: &str) -> Result<usize> {
    let module_name =
        CString::new(module).map_err(|_| Error::ModuleNotFound(module.to_string()))?;
    let symbol_name =
        CString::new(symbol).map_err(|_| Error::ExportNotFound(symbol.to_string()))?;

    let handle = unsafe { GetModuleHandleA(module_name.as_ptr().cast()) };
    if handle.is_null() {
        return Err(Error::ModuleNotFound(module.to_string()));
    }

    let address = unsafe { GetProcAddress(handle, symbol_name.as_ptr().cast()) }
        .ok_or_else(|| Error::ExportNotFound(symbol.to_string()))?;

    let address = address as usize;
    debug!(module, symbol, address, "export resolved");
    Ok(address)
}
