use crate::query::LookupQuery;
use crate::system::{is_api_set_name, WinFileSystemCache};
use crate::LookupError;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

/// Directory/set of DLLs to be searched, and relative metadata
#[derive(Eq, PartialEq, Debug, Clone)]
pub enum LookupPathEntry {
    /// Directory where the root executable sits
    ExecutableDir(PathBuf),
    /// Directory containing the "proxy" DLLs that implement the API set feature
    ApiSet(PathBuf),
    /// Windows System directory (typically C:\Windows\System32)
    SystemDir(PathBuf),
    // SystemDir16, // ignored
    /// Windows directory (typically C:\Windows)
    WindowsDir(PathBuf),
    /// Working directory of the (virtual) process whose DLL lookup we are simulating
    WorkingDir(PathBuf),
    /// PATH as specified by the system (value PATH variable in the shell executing the process)
    SystemPath(PathBuf),
    /// Additional path entries specified by the user
    UserPath(PathBuf),
}

impl LookupPathEntry {
    pub fn is_system(&self) -> bool {
        matches!(
            self,
            Self::ApiSet(_) | Self::WindowsDir(_) | Self::SystemDir(_)
        )
    }

    pub fn get_path(&self) -> &Path {
        match self {
            Self::ExecutableDir(p)
            | Self::ApiSet(p)
            | Self::SystemDir(p)
            | Self::WindowsDir(p)
            | Self::WorkingDir(p)
            | Self::SystemPath(p)
            | Self::UserPath(p) => p,
        }
    }
}

/// Full location of a DLL found during lookup
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LookupResult {
    pub location: LookupPathEntry,
    pub fullpath: PathBuf,
}

/// Sorted list of directories to be looked up when searching for a DLL
/// It is built from a query, depending on the current system configuration
/// (availability of a Windows root, and its configuration that influences the lookup)
pub struct LookupPath {
    pub query: LookupQuery,
    pub entries: Vec<LookupPathEntry>,
    fs_cache: Mutex<WinFileSystemCache>,
}

impl LookupPath {
    pub fn new(query: LookupQuery) -> Self {
        let entries = if let Some(system) = &query.system {
            let system_entries = vec![
                LookupPathEntry::SystemDir(system.sys_dir.clone()),
                // 16-bit system directory ignored
                LookupPathEntry::WindowsDir(system.win_dir.clone()),
            ];
            let apiset_entry = vec![LookupPathEntry::ApiSet(system.api_set_dir())];

            if system.safe_dll_search_mode_on.unwrap_or(true) {
                // default mode (assume if not specified)
                [
                    apiset_entry,
                    vec![LookupPathEntry::ExecutableDir(query.target.app_dir.clone())],
                    system_entries,
                    vec![LookupPathEntry::WorkingDir(query.target.working_dir.clone())],
                    Self::system_path_entries(&query),
                    Self::user_path_entries(&query),
                ]
                .concat()
            } else {
                // if HKEY_LOCAL_MACHINE\System\CurrentControlSet\Control\Session Manager\SafeDllSearchMode is 0
                [
                    apiset_entry,
                    vec![
                        LookupPathEntry::ExecutableDir(query.target.app_dir.clone()),
                        LookupPathEntry::WorkingDir(query.target.working_dir.clone()),
                    ],
                    system_entries,
                    Self::system_path_entries(&query),
                    Self::user_path_entries(&query),
                ]
                .concat()
            }
        } else {
            [
                vec![
                    LookupPathEntry::ExecutableDir(query.target.app_dir.clone()),
                    LookupPathEntry::WorkingDir(query.target.working_dir.clone()),
                ],
                Self::user_path_entries(&query),
            ]
            .concat()
        };

        Self {
            query,
            entries,
            fs_cache: Mutex::new(WinFileSystemCache::new()),
        }
    }

    /// Get the PATH entries specified by the system
    fn system_path_entries(q: &LookupQuery) -> Vec<LookupPathEntry> {
        q.system
            .as_ref()
            .and_then(|s| s.system_path.as_ref())
            .map(|path| {
                path.iter()
                    .map(|s| LookupPathEntry::SystemPath(s.clone()))
                    .collect()
            })
            .unwrap_or_default()
    }

    /// Get the PATH entries that were provided by the user when running the program
    fn user_path_entries(q: &LookupQuery) -> Vec<LookupPathEntry> {
        q.target
            .user_path
            .iter()
            .map(|s| LookupPathEntry::UserPath(s.clone()))
            .collect::<Vec<_>>()
    }

    // linearize the lookup context into a single vector of directories
    pub fn search_path(&self) -> Vec<PathBuf> {
        self.entries.iter().map(|e| e.get_path().to_owned()).collect()
    }

    /// Looks for a DLL by name, following the entries in order.
    /// API set contracts are only looked up in the API set directory.
    pub fn search_dll(&self, library: &str) -> Result<Option<LookupResult>, LookupError> {
        let api_set = is_api_set_name(library);
        for e in &self.entries {
            if matches!(e, LookupPathEntry::ApiSet(_)) != api_set {
                continue;
            }
            if let Some(r) = self.search_file_in_folder(library, e.get_path())? {
                return Ok(Some(LookupResult {
                    location: e.clone(),
                    fullpath: r,
                }));
            }
        }
        Ok(None)
    }

    fn search_file_in_folder<P: AsRef<Path>>(
        &self,
        filename: &str,
        p: P,
    ) -> Result<Option<PathBuf>, LookupError> {
        self.fs_cache
            .lock()
            .map_err(|_| LookupError::ScanError("directory cache lock poisoned".to_owned()))?
            .test_file_in_folder_case_insensitive(filename, p.as_ref())
    }
}
