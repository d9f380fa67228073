use fs_err as fs;
use std::path::Path;
use thiserror::Error;

/// Windows error code reported when a module cannot be found on the lookup path
pub const ERROR_MOD_NOT_FOUND: u32 = 126;

/// Failures while decoding a single executable image
#[derive(Error, Debug)]
pub enum ImageError {
    /// A read would cross the declared end of the image
    #[error("Image is too small or contains an invalid offset or count")]
    ImageTooSmall,

    #[error("Bad image format: {0}")]
    BadImageFormat(String),

    /// The directory's virtual address is zero or is not covered by any section.
    /// Callers treat this as "table absent".
    #[error("Directory at RVA {virtual_address:#x} is not contained in any section")]
    DirectoryNotFound { virtual_address: u32 },

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

impl ImageError {
    pub(crate) fn bad_format<S: Into<String>>(message: S) -> Self {
        ImageError::BadImageFormat(message.into())
    }
}

#[derive(Error, Debug)]
pub enum LookupError {
    /// The module loader could not make the module addressable
    #[error("Could not load {name}: {message}")]
    ModuleLoadFailure {
        name: String,
        code: Option<u32>,
        message: String,
    },

    /// The only failure that aborts a whole resolution run
    #[error("Could not resolve root module {name}: {detail}")]
    RootUnresolvable { name: String, detail: String },

    #[error("Assembly name parse error: {0}")]
    ParseError(String),

    #[error("Lookup context building error: {0}")]
    ContextDeductionError(String),

    #[error("Scan error: {0}")]
    ScanError(String),

    #[error(transparent)]
    ImageError(#[from] ImageError),

    #[error(transparent)]
    IOError(#[from] std::io::Error),
}

impl LookupError {
    pub(crate) fn not_found(name: &str) -> Self {
        LookupError::ModuleLoadFailure {
            name: name.to_owned(),
            code: Some(ERROR_MOD_NOT_FOUND),
            message: "The specified module could not be found".to_owned(),
        }
    }
}

/// Lossy conversion of a path for display purposes
pub fn path_to_string<P: AsRef<Path>>(p: P) -> String {
    p.as_ref().to_string_lossy().into_owned()
}

/// Remove the `\\?\` prefix that canonicalization adds on Windows
pub fn decanonicalize(s: &str) -> String {
    s.strip_prefix(r"\\?\").unwrap_or(s).to_owned()
}

/// Canonical path, without the verbatim prefix, as a string
pub fn readable_canonical_path<P: AsRef<Path>>(p: P) -> Result<String, LookupError> {
    Ok(decanonicalize(&path_to_string(fs::canonicalize(p.as_ref())?)))
}
