//! Data structures that must be filled with the input and the parameters for the dependency scan

use crate::common::LookupError;
use crate::system::WindowsSystem;
use fs_err as fs;
use serde::Serialize;
use std::path::{Path, PathBuf};

#[derive(Clone, Debug)]
pub struct LookupTarget {
    /// Path to the target executable
    pub target_exe: PathBuf,
    /// Parent directory of target_exe, cached for performance purposes
    pub app_dir: PathBuf,
    /// Working directory as it should appear in the search path
    pub working_dir: PathBuf,
    /// Additional executable search path set by the user
    pub user_path: Vec<PathBuf>,
}

/// Parameters of a resolution run
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct ResolveOptions {
    /// Collapse every occurrence of a module into a single shared node
    pub unique: bool,
    /// Maximum recursion depth; the root is at depth 0
    pub max_depth: Option<usize>,
    /// Upper bound on modules loaded concurrently; 0 behaves as 1
    pub max_concurrency: usize,
}

impl Default for ResolveOptions {
    fn default() -> Self {
        Self {
            unique: false,
            max_depth: None,
            max_concurrency: 1,
        }
    }
}

impl ResolveOptions {
    pub fn workers(&self) -> usize {
        self.max_concurrency.max(1)
    }
}

/// Complete specification of a search task
#[derive(Clone, Debug)]
pub struct LookupQuery {
    pub system: Option<WindowsSystem>,
    pub target: LookupTarget,
    pub parameters: ResolveOptions,
}

impl LookupQuery {
    /// autodetects the settings with sensible defaults
    ///
    /// The working directory will be set to the one containing the executable (i.e. the app_dir)
    pub fn deduce_from_executable_location<P: AsRef<Path>>(
        target_exe: P,
    ) -> Result<Self, LookupError> {
        let target_exe = fs::canonicalize(target_exe.as_ref())?;
        let app_dir = target_exe.parent().ok_or_else(|| {
            LookupError::ContextDeductionError(
                "Could not find application directory for given executable ".to_owned()
                    + target_exe.to_str().unwrap_or(""),
            )
        })?;

        #[cfg(windows)]
        let system = Some(WindowsSystem::current()?);
        #[cfg(not(windows))]
        let system = WindowsSystem::from_exe_location(&target_exe);

        Ok(Self {
            system,
            target: LookupTarget {
                user_path: Vec::new(),
                app_dir: app_dir.to_owned(),
                working_dir: app_dir.to_owned(),
                target_exe: target_exe.clone(),
            },
            parameters: ResolveOptions::default(),
        })
    }

    /// Use the Windows installation rooted at `root` (the mount point of the C:\ partition)
    pub fn with_windows_root<P: AsRef<Path>>(mut self, root: P) -> Result<Self, LookupError> {
        self.system = Some(WindowsSystem::from_root(&root).ok_or_else(|| {
            LookupError::ContextDeductionError(format!(
                "No Windows installation found at {}",
                root.as_ref().display()
            ))
        })?);
        Ok(self)
    }
}

#[cfg(test)]
mod tests {
    use crate::common::LookupError;
    use crate::query::{LookupQuery, ResolveOptions};
    use fs_err as fs;

    #[test]
    fn build_query() -> Result<(), LookupError> {
        let dir = tempfile::tempdir()?;
        let exe_path = dir.path().join("DepRunTest.exe");
        fs::write(&exe_path, b"MZ")?;

        let query = LookupQuery::deduce_from_executable_location(&exe_path)?;
        let expected_dir = fs::canonicalize(dir.path())?;
        assert!(query.target.target_exe.ends_with("DepRunTest.exe"));
        assert_eq!(&query.target.working_dir, &expected_dir);
        assert_eq!(&query.target.app_dir, &expected_dir);
        assert!(query.target.user_path.is_empty());
        assert_eq!(query.parameters, ResolveOptions::default());
        #[cfg(windows)]
        {
            use crate::system::WindowsSystem;
            assert_eq!(&query.system.unwrap(), &WindowsSystem::current()?);
        }
        Ok(())
    }

    #[test]
    fn missing_executable_is_an_error() {
        assert!(LookupQuery::deduce_from_executable_location("/definitely/not/here.exe").is_err());
    }

    #[test]
    fn explicit_windows_root() -> Result<(), LookupError> {
        let root = tempfile::tempdir()?;
        fs::create_dir_all(root.path().join("Windows").join("System32"))?;
        let exe_path = root.path().join("app.exe");
        fs::write(&exe_path, b"MZ")?;

        let query = LookupQuery::deduce_from_executable_location(&exe_path)?
            .with_windows_root(root.path())?;
        let system = query.system.expect("system");
        assert_eq!(system.win_dir, root.path().join("Windows"));

        let empty = tempfile::tempdir()?;
        assert!(matches!(
            LookupQuery::deduce_from_executable_location(&exe_path)?
                .with_windows_root(empty.path()),
            Err(LookupError::ContextDeductionError(_))
        ));
        Ok(())
    }

    #[test]
    fn zero_concurrency_means_one_worker() {
        let options = ResolveOptions {
            max_concurrency: 0,
            ..Default::default()
        };
        assert_eq!(options.workers(), 1);
    }
}
