//! Making a module's bytes addressable.
//!
//! [`FileSystemLoader`] simulates the Windows search order over a [`LookupPath`] and reads the
//! file; on Windows, [`WindowsLoader`] asks the OS loader to map the image without running it.

use fs_err as fs;
use std::path::{Path, PathBuf};

use crate::common::LookupError;
use crate::lookup_path::LookupPath;
use crate::metadata::AssemblyName;

/// An image mapped into memory by the OS loader, viewed from its base address
pub trait MappedView {
    fn bytes(&self) -> &[u8];
}

pub enum ModuleImage {
    /// File contents, addressed through section raw data pointers
    File(Vec<u8>),
    /// Loaded image, addressed by relative virtual address
    Mapped(Box<dyn MappedView>),
}

impl ModuleImage {
    pub fn bytes(&self) -> &[u8] {
        match self {
            ModuleImage::File(b) => b,
            ModuleImage::Mapped(v) => v.bytes(),
        }
    }

    pub fn is_mapped(&self) -> bool {
        matches!(self, ModuleImage::Mapped(_))
    }
}

pub struct LoadedModule {
    pub resolved_path: PathBuf,
    pub image: ModuleImage,
}

/// Turns a module name (file name, path or assembly display name) into an addressable image
pub trait ModuleLoader: Send + Sync {
    fn load(&self, name: &str) -> Result<LoadedModule, LookupError>;
}

/// File names to try for a requested module
fn candidate_file_names(name: &str) -> Result<Vec<String>, LookupError> {
    if AssemblyName::is_display_name(name) {
        let assembly = AssemblyName::parse(name)?;
        Ok(vec![
            format!("{}.dll", assembly.name),
            format!("{}.exe", assembly.name),
        ])
    } else {
        Ok(vec![name.to_owned()])
    }
}

/// Reads modules from disk, locating them through the simulated DLL search order
pub struct FileSystemLoader {
    lookup_path: LookupPath,
}

impl FileSystemLoader {
    pub fn new(lookup_path: LookupPath) -> Self {
        Self { lookup_path }
    }

    pub fn lookup_path(&self) -> &LookupPath {
        &self.lookup_path
    }

    fn find(&self, name: &str) -> Result<Option<PathBuf>, LookupError> {
        let as_path = Path::new(name);
        if as_path.components().count() > 1 && as_path.is_file() {
            return Ok(Some(as_path.to_owned()));
        }
        for candidate in candidate_file_names(name)? {
            if let Some(found) = self.lookup_path.search_dll(&candidate)? {
                tracing::trace!(module = name, location = ?found.location, "found");
                return Ok(Some(found.fullpath));
            }
        }
        Ok(None)
    }
}

impl ModuleLoader for FileSystemLoader {
    fn load(&self, name: &str) -> Result<LoadedModule, LookupError> {
        let path = self.find(name)?.ok_or_else(|| LookupError::not_found(name))?;
        let bytes = fs::read(&path).map_err(|e| LookupError::ModuleLoadFailure {
            name: name.to_owned(),
            code: e.raw_os_error().map(|c| c as u32),
            message: e.to_string(),
        })?;
        Ok(LoadedModule {
            resolved_path: path,
            image: ModuleImage::File(bytes),
        })
    }
}

#[cfg(windows)]
pub use self::windows::WindowsLoader;

#[cfg(windows)]
mod windows {
    extern crate winapi;

    use std::ffi::OsString;
    use std::iter::once;
    use std::os::windows::ffi::{OsStrExt, OsStringExt};
    use std::path::PathBuf;

    use winapi::shared::minwindef::{DWORD, HMODULE};
    use winapi::um::errhandlingapi::GetLastError;
    use winapi::um::libloaderapi::{
        FreeLibrary, GetModuleFileNameW, LoadLibraryExW, DONT_RESOLVE_DLL_REFERENCES,
    };
    use winapi::um::processthreadsapi::GetCurrentProcess;
    use winapi::um::psapi::{GetModuleInformation, MODULEINFO};

    use super::{candidate_file_names, LoadedModule, MappedView, ModuleImage, ModuleLoader};
    use crate::common::LookupError;

    fn last_error(name: &str) -> LookupError {
        let code = unsafe { GetLastError() };
        LookupError::ModuleLoadFailure {
            name: name.to_owned(),
            code: Some(code),
            message: std::io::Error::from_raw_os_error(code as i32).to_string(),
        }
    }

    /// A module mapped with `DONT_RESOLVE_DLL_REFERENCES`; released when dropped
    struct LoadedLibrary {
        handle: HMODULE,
        size: usize,
    }

    impl LoadedLibrary {
        fn load(name: &str, file_name: &str) -> Result<Self, LookupError> {
            let wide: Vec<u16> = std::ffi::OsStr::new(file_name)
                .encode_wide()
                .chain(once(0))
                .collect();
            let handle = unsafe {
                LoadLibraryExW(wide.as_ptr(), std::ptr::null_mut(), DONT_RESOLVE_DLL_REFERENCES)
            };
            if handle.is_null() {
                return Err(last_error(name));
            }
            let mut library = Self { handle, size: 0 };

            let mut info = MODULEINFO {
                lpBaseOfDll: std::ptr::null_mut(),
                SizeOfImage: 0,
                EntryPoint: std::ptr::null_mut(),
            };
            let ok = unsafe {
                GetModuleInformation(
                    GetCurrentProcess(),
                    handle,
                    &mut info,
                    std::mem::size_of::<MODULEINFO>() as DWORD,
                )
            };
            if ok == 0 {
                return Err(last_error(name));
            }
            library.size = info.SizeOfImage as usize;
            Ok(library)
        }

        fn file_name(&self, name: &str) -> Result<PathBuf, LookupError> {
            const BFR_SIZE: usize = 32768;
            let mut bfr = vec![0u16; BFR_SIZE];
            let len = unsafe { GetModuleFileNameW(self.handle, bfr.as_mut_ptr(), BFR_SIZE as DWORD) };
            if len == 0 {
                return Err(last_error(name));
            }
            Ok(OsString::from_wide(&bfr[..len as usize]).into())
        }
    }

    impl MappedView for LoadedLibrary {
        fn bytes(&self) -> &[u8] {
            // the low bits of a module handle flag data-file mappings; this one is an image mapping
            // spanning SizeOfImage bytes from its base for as long as the handle is held
            unsafe { std::slice::from_raw_parts(self.handle as *const u8, self.size) }
        }
    }

    impl Drop for LoadedLibrary {
        fn drop(&mut self) {
            unsafe {
                FreeLibrary(self.handle);
            }
        }
    }

    /// Lets the OS loader locate and map modules, without resolving their own imports
    #[derive(Debug, Clone, Copy, Default)]
    pub struct WindowsLoader;

    impl ModuleLoader for WindowsLoader {
        fn load(&self, name: &str) -> Result<LoadedModule, LookupError> {
            let mut failure = None;
            for candidate in candidate_file_names(name)? {
                match LoadedLibrary::load(name, &candidate) {
                    Ok(library) => {
                        let resolved_path = library.file_name(name)?;
                        return Ok(LoadedModule {
                            resolved_path,
                            image: ModuleImage::Mapped(Box::new(library)),
                        });
                    }
                    Err(e) => failure = Some(e),
                }
            }
            Err(failure.unwrap_or_else(|| LookupError::not_found(name)))
        }
    }

}
