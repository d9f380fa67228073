#[cfg(windows)]
extern crate winapi;
use crate::common::LookupError;
use fs_err as fs;
use std::collections::HashMap;
#[cfg(windows)]
use std::ffi::OsString;
#[cfg(windows)]
use std::os::windows::ffi::OsStringExt;
use std::path::{Path, PathBuf};

/// Prefixes of API set contract names; the loader redirects them instead of searching for a file
const API_SET_PREFIXES: [&str; 2] = ["api-ms-", "ext-ms-"];

/// Whether the module name designates an API set contract rather than a real file
pub fn is_api_set_name(library: &str) -> bool {
    let lower = library.to_ascii_lowercase();
    API_SET_PREFIXES.iter().any(|p| lower.starts_with(p))
}

// supported DLL search modes: standard for desktop application, safe or unsafe
// https://docs.microsoft.com/en-us/windows/win32/dlls/dynamic-link-library-search-order#standard-search-order-for-desktop-applications

/// Description of a Windows system
/// If running from within Windows we extract the available information from the environment
/// variables and the Windows API.
/// If running in another OS we can only guess the directories, and can't do anything about the PATH
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WindowsSystem {
    pub safe_dll_search_mode_on: Option<bool>,
    pub win_dir: PathBuf,
    pub sys_dir: PathBuf,
    // sys16_dir ignored, since it is not supported on 64-bit systems
    pub system_path: Option<Vec<PathBuf>>,
}

impl WindowsSystem {
    /// Collect information about the host operating system
    #[cfg(windows)]
    pub fn current() -> Result<Self, LookupError> {
        let win_dir = get_windows_directory()?;
        let sys_dir = get_system_directory()?;

        let path = std::env::var("PATH").ok().map(|s| {
            s.split(';')
                .filter_map(|subs| fs::canonicalize(subs).ok())
                .collect()
        });
        Ok(Self {
            safe_dll_search_mode_on: None,
            win_dir,
            sys_dir,
            system_path: path,
        })
    }

    /// Collect information about the Windows operating system installed on the partition the target
    /// executable lies into
    pub fn from_exe_location<P: AsRef<Path>>(p: P) -> Option<Self> {
        Self::find_root(&p).and_then(Self::from_root)
    }

    /// Try finding a Windows installation along the path to the target executable
    /// Rationale: the user may have mounted a Windows partition at an unknown depth in the filesystem
    fn find_root<P: AsRef<Path>>(p: P) -> Option<PathBuf> {
        p.as_ref()
            .parent()?
            .ancestors()
            .find(|a| Self::from_root(a).is_some())
            .map(Path::to_owned)
    }

    /// Collect information about the Windows installation at the given path
    /// The path should point to the C:\ partition
    pub fn from_root<P: AsRef<Path>>(root_path: P) -> Option<Self> {
        let win_dir = root_path.as_ref().join("Windows");
        let sys_dir = win_dir.join("System32");
        if sys_dir.is_dir() {
            Some(Self {
                safe_dll_search_mode_on: None,
                win_dir,
                sys_dir,
                system_path: None,
            })
        } else {
            None
        }
    }

    /// Directory holding the forwarder DLLs implementing API set contracts
    pub fn api_set_dir(&self) -> PathBuf {
        self.sys_dir.join("downlevel")
    }
}

/// Fetch the path to a system directory through the Windows API
#[cfg(windows)]
fn get_winapi_directory(
    a: unsafe extern "system" fn(
        winapi::um::winnt::LPWSTR,
        winapi::shared::minwindef::UINT,
    ) -> winapi::shared::minwindef::UINT,
) -> Result<PathBuf, std::io::Error> {
    use std::io::Error;

    const BFR_SIZE: usize = 512;
    let mut bfr: [u16; BFR_SIZE] = [0; BFR_SIZE];

    let ret: u32 = unsafe { a(bfr.as_mut_ptr(), BFR_SIZE as u32) };
    if ret == 0 {
        Err(Error::last_os_error())
    } else {
        let valid_bfr = &bfr[..ret as usize];
        fs::canonicalize(OsString::from_wide(valid_bfr))
    }
}

/// Get the path to the System directory (typically C:\Windows\System32)
#[cfg(windows)]
fn get_system_directory() -> Result<PathBuf, std::io::Error> {
    get_winapi_directory(winapi::um::sysinfoapi::GetSystemDirectoryW)
}

/// Get the path to the Windows directory (typically C:\Windows)
#[cfg(windows)]
fn get_windows_directory() -> Result<PathBuf, std::io::Error> {
    get_winapi_directory(winapi::um::sysinfoapi::GetWindowsDirectoryW)
}

/// Caches the content of already scanned directories, to avoid repeated expensive filesystem access
#[derive(Default)]
pub(crate) struct WinFileSystemCache {
    files_in_dirs: HashMap<PathBuf, HashMap<String, PathBuf>>,
}

impl WinFileSystemCache {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    /// Look up `filename` in `folder` ignoring case, as the Windows loader does.
    /// A folder that cannot be read is treated as empty.
    pub(crate) fn test_file_in_folder_case_insensitive<Q: AsRef<Path>>(
        &mut self,
        filename: &str,
        folder: Q,
    ) -> Result<Option<PathBuf>, LookupError> {
        let folder = folder.as_ref();
        if !self.files_in_dirs.contains_key(folder) {
            if let Err(e) = self.scan_folder(folder) {
                tracing::debug!(folder = %folder.display(), error = %e, "skipping unreadable directory");
                self.files_in_dirs.insert(folder.to_owned(), HashMap::new());
            }
        }
        let dir = self.files_in_dirs.get(folder).ok_or_else(|| {
            LookupError::ScanError(format!("Could not scan directory {}", folder.display()))
        })?;
        Ok(dir.get(&filename.to_lowercase()).map(|p| folder.join(p)))
    }

    pub(crate) fn scan_folder<P: AsRef<Path>>(&mut self, folder: P) -> Result<(), LookupError> {
        if let std::collections::hash_map::Entry::Vacant(e) =
            self.files_in_dirs.entry(folder.as_ref().to_owned())
        {
            let matching_entries: HashMap<String, PathBuf> = fs::read_dir(folder.as_ref())?
                .filter_map(|entry| entry.ok())
                .filter(|entry| entry.metadata().is_ok_and(|m| m.is_file()))
                .filter_map(|entry| {
                    entry
                        .file_name()
                        .to_str()
                        .map(|s| (s.to_lowercase(), entry.file_name().into()))
                })
                .collect();
            e.insert(matching_entries);
        }
        Ok(())
    }
}
