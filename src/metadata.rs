//! Managed metadata: assembly identity and referenced assemblies.
//!
//! Only the parts of the ECMA-335 physical layout needed to reach the `Assembly` and `AssemblyRef`
//! tables are decoded; every table preceding them is sized from the row counts and heap widths.

use once_cell::sync::Lazy;
use regex::Regex;
use serde::Serialize;
use sha1::{Digest, Sha1};
use std::fmt;

use crate::common::{ImageError, LookupError};
use crate::image::BinaryImage;
use crate::reader::ImageReader;

const METADATA_SIGNATURE: u32 = 0x424A_5342; // "BSJB"

const HEAP_STRING_WIDE: u8 = 0x01;
const HEAP_GUID_WIDE: u8 = 0x02;
const HEAP_BLOB_WIDE: u8 = 0x04;
const HEAP_EXTRA_DATA: u8 = 0x40;

const ASSEMBLY_FLAG_PUBLIC_KEY: u32 = 0x0001;

// table numbers
const MODULE: usize = 0x00;
const TYPE_REF: usize = 0x01;
const TYPE_DEF: usize = 0x02;
const FIELD: usize = 0x04;
const METHOD_DEF: usize = 0x06;
const PARAM: usize = 0x08;
const INTERFACE_IMPL: usize = 0x09;
const MEMBER_REF: usize = 0x0A;
const DECL_SECURITY: usize = 0x0E;
const STAND_ALONE_SIG: usize = 0x11;
const EVENT: usize = 0x14;
const PROPERTY: usize = 0x17;
const MODULE_REF: usize = 0x1A;
const TYPE_SPEC: usize = 0x1B;
const ASSEMBLY: usize = 0x20;
const ASSEMBLY_REF: usize = 0x23;
const FILE: usize = 0x26;
const EXPORTED_TYPE: usize = 0x27;
const MANIFEST_RESOURCE: usize = 0x28;
const GENERIC_PARAM: usize = 0x2A;
const METHOD_SPEC: usize = 0x2B;
const GENERIC_PARAM_CONSTRAINT: usize = 0x2C;

struct CodedIndex {
    tag_bits: u32,
    tables: &'static [usize],
}

static TYPE_DEF_OR_REF: CodedIndex = CodedIndex {
    tag_bits: 2,
    tables: &[TYPE_DEF, TYPE_REF, TYPE_SPEC],
};
static HAS_CONSTANT: CodedIndex = CodedIndex {
    tag_bits: 2,
    tables: &[FIELD, PARAM, PROPERTY],
};
static HAS_CUSTOM_ATTRIBUTE: CodedIndex = CodedIndex {
    tag_bits: 5,
    tables: &[
        METHOD_DEF,
        FIELD,
        TYPE_REF,
        TYPE_DEF,
        PARAM,
        INTERFACE_IMPL,
        MEMBER_REF,
        MODULE,
        DECL_SECURITY,
        PROPERTY,
        EVENT,
        STAND_ALONE_SIG,
        MODULE_REF,
        TYPE_SPEC,
        ASSEMBLY,
        ASSEMBLY_REF,
        FILE,
        EXPORTED_TYPE,
        MANIFEST_RESOURCE,
        GENERIC_PARAM,
        GENERIC_PARAM_CONSTRAINT,
        METHOD_SPEC,
    ],
};
static HAS_FIELD_MARSHAL: CodedIndex = CodedIndex {
    tag_bits: 1,
    tables: &[FIELD, PARAM],
};
static HAS_DECL_SECURITY: CodedIndex = CodedIndex {
    tag_bits: 2,
    tables: &[TYPE_DEF, METHOD_DEF, ASSEMBLY],
};
static MEMBER_REF_PARENT: CodedIndex = CodedIndex {
    tag_bits: 3,
    tables: &[TYPE_DEF, TYPE_REF, MODULE_REF, METHOD_DEF, TYPE_SPEC],
};
static HAS_SEMANTICS: CodedIndex = CodedIndex {
    tag_bits: 1,
    tables: &[EVENT, PROPERTY],
};
static METHOD_DEF_OR_REF: CodedIndex = CodedIndex {
    tag_bits: 1,
    tables: &[METHOD_DEF, MEMBER_REF],
};
static MEMBER_FORWARDED: CodedIndex = CodedIndex {
    tag_bits: 1,
    tables: &[FIELD, METHOD_DEF],
};
static CUSTOM_ATTRIBUTE_TYPE: CodedIndex = CodedIndex {
    tag_bits: 3,
    tables: &[METHOD_DEF, MEMBER_REF],
};
static RESOLUTION_SCOPE: CodedIndex = CodedIndex {
    tag_bits: 2,
    tables: &[MODULE, MODULE_REF, ASSEMBLY_REF, TYPE_REF],
};

enum Column {
    Fixed(u64),
    Str,
    Guid,
    Blob,
    Table(usize),
    Coded(&'static CodedIndex),
}

use Column::{Blob, Coded, Fixed, Guid, Str, Table};

/// Row schemas of tables 0x00 up to and including AssemblyRef
static SCHEMAS: [&[Column]; ASSEMBLY_REF + 1] = [
    /* Module */ &[Fixed(2), Str, Guid, Guid, Guid],
    /* TypeRef */ &[Coded(&RESOLUTION_SCOPE), Str, Str],
    /* TypeDef */
    &[
        Fixed(4),
        Str,
        Str,
        Coded(&TYPE_DEF_OR_REF),
        Table(FIELD),
        Table(METHOD_DEF),
    ],
    /* FieldPtr */ &[Table(FIELD)],
    /* Field */ &[Fixed(2), Str, Blob],
    /* MethodPtr */ &[Table(METHOD_DEF)],
    /* MethodDef */ &[Fixed(4), Fixed(2), Fixed(2), Str, Blob, Table(PARAM)],
    /* ParamPtr */ &[Table(PARAM)],
    /* Param */ &[Fixed(2), Fixed(2), Str],
    /* InterfaceImpl */ &[Table(TYPE_DEF), Coded(&TYPE_DEF_OR_REF)],
    /* MemberRef */ &[Coded(&MEMBER_REF_PARENT), Str, Blob],
    /* Constant */ &[Fixed(2), Coded(&HAS_CONSTANT), Blob],
    /* CustomAttribute */
    &[
        Coded(&HAS_CUSTOM_ATTRIBUTE),
        Coded(&CUSTOM_ATTRIBUTE_TYPE),
        Blob,
    ],
    /* FieldMarshal */ &[Coded(&HAS_FIELD_MARSHAL), Blob],
    /* DeclSecurity */ &[Fixed(2), Coded(&HAS_DECL_SECURITY), Blob],
    /* ClassLayout */ &[Fixed(2), Fixed(4), Table(TYPE_DEF)],
    /* FieldLayout */ &[Fixed(4), Table(FIELD)],
    /* StandAloneSig */ &[Blob],
    /* EventMap */ &[Table(TYPE_DEF), Table(EVENT)],
    /* EventPtr */ &[Table(EVENT)],
    /* Event */ &[Fixed(2), Str, Coded(&TYPE_DEF_OR_REF)],
    /* PropertyMap */ &[Table(TYPE_DEF), Table(PROPERTY)],
    /* PropertyPtr */ &[Table(PROPERTY)],
    /* Property */ &[Fixed(2), Str, Blob],
    /* MethodSemantics */ &[Fixed(2), Table(METHOD_DEF), Coded(&HAS_SEMANTICS)],
    /* MethodImpl */
    &[
        Table(TYPE_DEF),
        Coded(&METHOD_DEF_OR_REF),
        Coded(&METHOD_DEF_OR_REF),
    ],
    /* ModuleRef */ &[Str],
    /* TypeSpec */ &[Blob],
    /* ImplMap */ &[Fixed(2), Coded(&MEMBER_FORWARDED), Str, Table(MODULE_REF)],
    /* FieldRVA */ &[Fixed(4), Table(FIELD)],
    /* EncLog */ &[Fixed(4), Fixed(4)],
    /* EncMap */ &[Fixed(4)],
    /* Assembly */ &[Fixed(4), Fixed(8), Fixed(4), Blob, Str, Str],
    /* AssemblyProcessor */ &[Fixed(4)],
    /* AssemblyOS */ &[Fixed(12)],
    /* AssemblyRef */ &[Fixed(8), Fixed(4), Blob, Str, Str, Blob],
];

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default, Serialize)]
pub struct AssemblyVersion {
    pub major: u16,
    pub minor: u16,
    pub build: u16,
    pub revision: u16,
}

impl fmt::Display for AssemblyVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}.{}.{}.{}",
            self.major, self.minor, self.build, self.revision
        )
    }
}

/// Identity of a managed assembly.
///
/// Displays as the assembly's full name, e.g.
/// `mscorlib, Version=4.0.0.0, Culture=neutral, PublicKeyToken=b77a5c561934e089`.
/// A name without a version displays as the simple name only.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize)]
pub struct AssemblyName {
    pub name: String,
    pub version: Option<AssemblyVersion>,
    /// `None` is the neutral culture
    pub culture: Option<String>,
    /// Empty when the assembly is not strong-named
    pub public_key_token: Vec<u8>,
}

static NAME_PROPERTY: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"^\s*([A-Za-z]+)\s*=\s*(.*?)\s*$").expect("assembly name property regex is valid")
});

impl AssemblyName {
    pub fn simple(name: &str) -> Self {
        Self {
            name: name.to_owned(),
            version: None,
            culture: None,
            public_key_token: vec![],
        }
    }

    /// Parse a display name such as `Foo, Version=1.0.0.0, Culture=neutral, PublicKeyToken=null`
    pub fn parse(display_name: &str) -> Result<Self, LookupError> {
        let mut parts = display_name.split(',');
        let name = parts.next().unwrap_or_default().trim();
        if name.is_empty() {
            return Err(LookupError::ParseError(format!(
                "missing simple name in '{display_name}'"
            )));
        }
        let mut assembly = Self::simple(name);

        for part in parts {
            let captures = NAME_PROPERTY.captures(part).ok_or_else(|| {
                LookupError::ParseError(format!("malformed property '{part}' in '{display_name}'"))
            })?;
            let value = &captures[2];
            match captures[1].to_ascii_lowercase().as_str() {
                "version" => assembly.version = Some(parse_version(value)?),
                "culture" => {
                    assembly.culture = match value {
                        "" | "neutral" => None,
                        c => Some(c.to_owned()),
                    }
                }
                "publickeytoken" => {
                    assembly.public_key_token = if value.eq_ignore_ascii_case("null") {
                        vec![]
                    } else {
                        parse_hex(value)?
                    }
                }
                // processorArchitecture, Retargetable, ContentType
                _ => {}
            }
        }
        Ok(assembly)
    }

    /// Whether a requested module name is an assembly display name rather than a file name
    pub fn is_display_name(name: &str) -> bool {
        name.contains(',')
    }
}

impl fmt::Display for AssemblyName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.name)?;
        let Some(version) = &self.version else {
            return Ok(());
        };
        write!(
            f,
            ", Version={version}, Culture={}, PublicKeyToken=",
            self.culture.as_deref().unwrap_or("neutral")
        )?;
        if self.public_key_token.is_empty() {
            write!(f, "null")
        } else {
            self.public_key_token
                .iter()
                .try_for_each(|b| write!(f, "{b:02x}"))
        }
    }
}

fn parse_version(s: &str) -> Result<AssemblyVersion, LookupError> {
    let parts = s
        .split('.')
        .map(|p| p.trim().parse::<u16>())
        .collect::<Result<Vec<_>, _>>()
        .map_err(|e| LookupError::ParseError(format!("invalid version '{s}': {e}")))?;
    if !(2..=4).contains(&parts.len()) {
        return Err(LookupError::ParseError(format!("invalid version '{s}'")));
    }
    let at = |i: usize| parts.get(i).copied().unwrap_or(0);
    Ok(AssemblyVersion {
        major: at(0),
        minor: at(1),
        build: at(2),
        revision: at(3),
    })
}

fn parse_hex(s: &str) -> Result<Vec<u8>, LookupError> {
    if s.len() % 2 != 0 || !s.is_ascii() {
        return Err(LookupError::ParseError(format!("invalid public key token '{s}'")));
    }
    (0..s.len())
        .step_by(2)
        .map(|i| {
            u8::from_str_radix(&s[i..i + 2], 16)
                .map_err(|e| LookupError::ParseError(format!("invalid public key token '{s}': {e}")))
        })
        .collect()
}

/// The public key token is the last 8 bytes of the key's SHA-1 hash, reversed
pub fn public_key_token(public_key: &[u8]) -> Vec<u8> {
    if public_key.is_empty() {
        return vec![];
    }
    Sha1::digest(public_key).iter().rev().take(8).copied().collect()
}

/// The assembly defined by a metadata blob and the assemblies it references, in table order
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct AssemblyManifest {
    /// `None` for modules without an assembly manifest (e.g. netmodules)
    pub identity: Option<AssemblyName>,
    pub references: Vec<AssemblyName>,
}

/// Enumerates the managed references of a decoded image
pub trait ReferenceEnumerator: Send + Sync {
    /// `data` is the same buffer the image was decoded from.
    /// Returns `None` when the image carries no managed metadata.
    fn manifest(
        &self,
        image: &BinaryImage,
        data: &[u8],
    ) -> Result<Option<AssemblyManifest>, ImageError>;
}

/// Reads the manifest straight from the image's metadata tables
#[derive(Debug, Clone, Copy, Default)]
pub struct MetadataReader;

impl ReferenceEnumerator for MetadataReader {
    fn manifest(
        &self,
        image: &BinaryImage,
        data: &[u8],
    ) -> Result<Option<AssemblyManifest>, ImageError> {
        let Some(region) = image.metadata_region() else {
            return Ok(None);
        };
        let start = usize::try_from(region.start).map_err(|_| ImageError::ImageTooSmall)?;
        let metadata = slice(data, start, region.size)?;
        read_manifest(metadata).map(Some)
    }
}

fn slice(data: &[u8], start: usize, size: u32) -> Result<&[u8], ImageError> {
    start
        .checked_add(size as usize)
        .and_then(|end| data.get(start..end))
        .ok_or(ImageError::ImageTooSmall)
}

#[derive(Default)]
struct Streams<'a> {
    tables: Option<&'a [u8]>,
    strings: &'a [u8],
    blob: &'a [u8],
}

/// Decode the manifest from a metadata root (the bytes starting at the `BSJB` signature)
pub fn read_manifest(metadata: &[u8]) -> Result<AssemblyManifest, ImageError> {
    let streams = read_stream_headers(metadata)?;
    let tables = streams
        .tables
        .ok_or_else(|| ImageError::bad_format("Metadata has no tables stream"))?;
    let layout = TablesLayout::read(tables)?;
    let heaps = Heaps {
        strings: streams.strings,
        blob: streams.blob,
    };

    let mut r = ImageReader::from_bytes(tables)?;
    let identity = if layout.rows[ASSEMBLY] > 0 {
        r.seek(layout.table_offset(ASSEMBLY))?;
        Some(read_assembly_row(&mut r, &layout, &heaps)?)
    } else {
        None
    };

    let mut references = Vec::with_capacity(layout.rows[ASSEMBLY_REF] as usize);
    if layout.rows[ASSEMBLY_REF] > 0 {
        r.seek(layout.table_offset(ASSEMBLY_REF))?;
        for _ in 0..layout.rows[ASSEMBLY_REF] {
            references.push(read_assembly_ref_row(&mut r, &layout, &heaps)?);
        }
    }

    Ok(AssemblyManifest {
        identity,
        references,
    })
}

fn read_stream_headers(metadata: &[u8]) -> Result<Streams<'_>, ImageError> {
    let mut r = ImageReader::from_bytes(metadata)?;
    if r.read_u32()? != METADATA_SIGNATURE {
        return Err(ImageError::bad_format("Invalid metadata signature"));
    }
    // major and minor version, reserved
    r.skip(8)?;
    let version_length = r.read_u32()?;
    r.skip(u64::from(version_length))?;
    // flags
    r.skip(2)?;

    let mut streams = Streams::default();
    for _ in 0..r.read_u16()? {
        let offset = r.read_u32()?;
        let size = r.read_u32()?;
        let name = r.read_c_string()?;
        // names are NUL-terminated and padded to a 4-byte boundary
        let consumed = name.len() as u64 + 1;
        r.skip((4 - consumed % 4) % 4)?;

        let content = slice(metadata, offset as usize, size)?;
        match name.as_str() {
            "#~" | "#-" => streams.tables = Some(content),
            "#Strings" => streams.strings = content,
            "#Blob" => streams.blob = content,
            _ => {}
        }
    }
    Ok(streams)
}

struct TablesLayout {
    rows: [u32; 64],
    heap_sizes: u8,
    /// Offset of the first table's rows within the tables stream
    data_start: u64,
}

impl TablesLayout {
    fn read(tables: &[u8]) -> Result<Self, ImageError> {
        let mut r = ImageReader::from_bytes(tables)?;
        // reserved, major and minor version
        r.skip(6)?;
        let heap_sizes = r.read_u8()?;
        r.skip(1)?;
        let valid = r.read_u64()?;
        // sorted
        r.skip(8)?;

        let mut rows = [0u32; 64];
        for (table, count) in rows.iter_mut().enumerate() {
            if valid & (1u64 << table) != 0 {
                *count = r.read_u32()?;
            }
        }
        if heap_sizes & HEAP_EXTRA_DATA != 0 {
            r.skip(4)?;
        }

        Ok(Self {
            rows,
            heap_sizes,
            data_start: r.offset(),
        })
    }

    fn heap_index_size(&self, wide_flag: u8) -> u64 {
        if self.heap_sizes & wide_flag != 0 {
            4
        } else {
            2
        }
    }

    fn table_index_size(&self, table: usize) -> u64 {
        if self.rows[table] < 0x1_0000 {
            2
        } else {
            4
        }
    }

    fn coded_index_size(&self, coded: &CodedIndex) -> u64 {
        let max_rows = coded
            .tables
            .iter()
            .map(|&t| self.rows[t])
            .max()
            .unwrap_or(0);
        if max_rows < (1u32 << (16 - coded.tag_bits)) {
            2
        } else {
            4
        }
    }

    fn column_size(&self, column: &Column) -> u64 {
        match column {
            Fixed(width) => *width,
            Str => self.heap_index_size(HEAP_STRING_WIDE),
            Guid => self.heap_index_size(HEAP_GUID_WIDE),
            Blob => self.heap_index_size(HEAP_BLOB_WIDE),
            Table(t) => self.table_index_size(*t),
            Coded(c) => self.coded_index_size(c),
        }
    }

    fn row_size(&self, table: usize) -> u64 {
        SCHEMAS[table].iter().map(|c| self.column_size(c)).sum()
    }

    fn table_offset(&self, table: usize) -> u64 {
        self.data_start
            + (0..table)
                .map(|t| u64::from(self.rows[t]) * self.row_size(t))
                .sum::<u64>()
    }
}

struct Heaps<'a> {
    strings: &'a [u8],
    blob: &'a [u8],
}

impl Heaps<'_> {
    fn string(&self, index: u32) -> Result<String, ImageError> {
        let tail = self
            .strings
            .get(index as usize..)
            .ok_or(ImageError::ImageTooSmall)?;
        let len = tail
            .iter()
            .position(|&b| b == 0)
            .ok_or(ImageError::ImageTooSmall)?;
        Ok(String::from_utf8_lossy(&tail[..len]).into_owned())
    }

    fn blob(&self, index: u32) -> Result<&[u8], ImageError> {
        let tail = self
            .blob
            .get(index as usize..)
            .ok_or(ImageError::ImageTooSmall)?;
        let byte = |i: usize| tail.get(i).copied().map(usize::from).ok_or(ImageError::ImageTooSmall);
        let first = byte(0)?;
        let (header, len) = if first & 0x80 == 0 {
            (1, first)
        } else if first & 0xC0 == 0x80 {
            (2, (first & 0x3F) << 8 | byte(1)?)
        } else if first & 0xE0 == 0xC0 {
            (
                4,
                (first & 0x1F) << 24 | byte(1)? << 16 | byte(2)? << 8 | byte(3)?,
            )
        } else {
            return Err(ImageError::bad_format("Invalid blob length prefix"));
        };
        tail.get(header..header + len)
            .ok_or(ImageError::ImageTooSmall)
    }
}

fn read_heap_index<R: std::io::Read + std::io::Seek>(
    r: &mut ImageReader<R>,
    layout: &TablesLayout,
    wide_flag: u8,
) -> Result<u32, ImageError> {
    if layout.heap_index_size(wide_flag) == 4 {
        r.read_u32()
    } else {
        r.read_u16().map(u32::from)
    }
}

fn read_version<R: std::io::Read + std::io::Seek>(
    r: &mut ImageReader<R>,
) -> Result<AssemblyVersion, ImageError> {
    Ok(AssemblyVersion {
        major: r.read_u16()?,
        minor: r.read_u16()?,
        build: r.read_u16()?,
        revision: r.read_u16()?,
    })
}

fn culture(name: String) -> Option<String> {
    Some(name).filter(|c| !c.is_empty() && c != "neutral")
}

fn read_assembly_row<R: std::io::Read + std::io::Seek>(
    r: &mut ImageReader<R>,
    layout: &TablesLayout,
    heaps: &Heaps,
) -> Result<AssemblyName, ImageError> {
    // hash algorithm
    r.skip(4)?;
    let version = read_version(r)?;
    // flags
    r.skip(4)?;
    let public_key = read_heap_index(r, layout, HEAP_BLOB_WIDE)?;
    let name = read_heap_index(r, layout, HEAP_STRING_WIDE)?;
    let culture_name = read_heap_index(r, layout, HEAP_STRING_WIDE)?;

    Ok(AssemblyName {
        name: heaps.string(name)?,
        version: Some(version),
        culture: culture(heaps.string(culture_name)?),
        public_key_token: public_key_token(heaps.blob(public_key)?),
    })
}

fn read_assembly_ref_row<R: std::io::Read + std::io::Seek>(
    r: &mut ImageReader<R>,
    layout: &TablesLayout,
    heaps: &Heaps,
) -> Result<AssemblyName, ImageError> {
    let version = read_version(r)?;
    let flags = r.read_u32()?;
    let key_or_token = read_heap_index(r, layout, HEAP_BLOB_WIDE)?;
    let name = read_heap_index(r, layout, HEAP_STRING_WIDE)?;
    let culture_name = read_heap_index(r, layout, HEAP_STRING_WIDE)?;
    // hash value
    read_heap_index(r, layout, HEAP_BLOB_WIDE)?;

    let key_or_token = heaps.blob(key_or_token)?;
    let public_key_token = if flags & ASSEMBLY_FLAG_PUBLIC_KEY != 0 {
        public_key_token(key_or_token)
    } else {
        key_or_token.to_vec()
    };

    Ok(AssemblyName {
        name: heaps.string(name)?,
        version: Some(version),
        culture: culture(heaps.string(culture_name)?),
        public_key_token,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testutil::{metadata_root, PeBuilder, MSCORLIB_TOKEN};

    #[test]
    fn full_name_display() -> Result<(), LookupError> {
        let name = AssemblyName {
            name: "mscorlib".to_owned(),
            version: Some(AssemblyVersion {
                major: 4,
                minor: 0,
                build: 0,
                revision: 0,
            }),
            culture: None,
            public_key_token: MSCORLIB_TOKEN.to_vec(),
        };
        let full = "mscorlib, Version=4.0.0.0, Culture=neutral, PublicKeyToken=b77a5c561934e089";
        assert_eq!(name.to_string(), full);
        assert_eq!(AssemblyName::parse(full)?, name);
        assert_eq!(AssemblyName::simple("Foo").to_string(), "Foo");
        Ok(())
    }

    #[test]
    fn parse_display_names() -> Result<(), LookupError> {
        let n = AssemblyName::parse("Foo.Bar,Version=1.2, Culture=de-DE, PublicKeyToken=null, processorArchitecture=MSIL")?;
        assert_eq!(n.name, "Foo.Bar");
        assert_eq!(
            n.version,
            Some(AssemblyVersion {
                major: 1,
                minor: 2,
                build: 0,
                revision: 0
            })
        );
        assert_eq!(n.culture.as_deref(), Some("de-DE"));
        assert!(n.public_key_token.is_empty());
        assert_eq!(
            n.to_string(),
            "Foo.Bar, Version=1.2.0.0, Culture=de-DE, PublicKeyToken=null"
        );

        assert!(AssemblyName::parse(" , Version=1.0.0.0").is_err());
        assert!(AssemblyName::parse("Foo, Version=one").is_err());
        assert!(AssemblyName::parse("Foo, PublicKeyToken=abc").is_err());
        assert!(AssemblyName::is_display_name("Foo, Version=1.0.0.0"));
        assert!(!AssemblyName::is_display_name("foo.dll"));
        Ok(())
    }

    #[test]
    fn token_is_reversed_sha1_tail() {
        let key = b"not really a public key";
        let hash = Sha1::digest(key);
        let token = public_key_token(key);
        assert_eq!(token.len(), 8);
        assert_eq!(token[0], hash[19]);
        assert_eq!(token[7], hash[12]);
        assert!(public_key_token(&[]).is_empty());
    }

    #[test]
    fn manifest_from_metadata_root() -> Result<(), ImageError> {
        let root = metadata_root(
            "Demo",
            &[
                ("mscorlib", MSCORLIB_TOKEN),
                ("System.Core", MSCORLIB_TOKEN),
            ],
        );
        let manifest = read_manifest(&root)?;
        let identity = manifest.identity.expect("assembly row");
        assert_eq!(
            identity.to_string(),
            "Demo, Version=1.0.0.0, Culture=neutral, PublicKeyToken=null"
        );
        let refs: Vec<String> = manifest.references.iter().map(|r| r.to_string()).collect();
        assert_eq!(
            refs,
            [
                "mscorlib, Version=4.0.0.0, Culture=neutral, PublicKeyToken=b77a5c561934e089",
                "System.Core, Version=4.0.0.0, Culture=neutral, PublicKeyToken=b77a5c561934e089",
            ]
        );
        Ok(())
    }

    #[test]
    fn manifest_through_the_image() -> Result<(), ImageError> {
        let builder = PeBuilder::new().managed("Demo", &[("mscorlib", MSCORLIB_TOKEN)]);
        let file = builder.build_file();
        let image = BinaryImage::parse_bytes(&file)?;
        let manifest = MetadataReader.manifest(&image, &file)?.expect("metadata");
        assert_eq!(manifest.references.len(), 1);

        let mapped = builder.build_mapped();
        let image = BinaryImage::parse_mapped(&mapped)?;
        assert_eq!(MetadataReader.manifest(&image, &mapped)?, Some(manifest));

        let native = PeBuilder::new().build_file();
        let image = BinaryImage::parse_bytes(&native)?;
        assert_eq!(MetadataReader.manifest(&image, &native)?, None);
        Ok(())
    }

    #[test]
    fn bad_signature_is_rejected() {
        let mut root = metadata_root("Demo", &[]);
        root[0] = b'X';
        assert!(matches!(
            read_manifest(&root),
            Err(ImageError::BadImageFormat(_))
        ));
    }

    #[test]
    fn row_sizes_follow_heap_and_table_widths() {
        let mut layout = TablesLayout {
            rows: [0; 64],
            heap_sizes: 0,
            data_start: 0,
        };
        assert_eq!(layout.row_size(ASSEMBLY), 22);
        assert_eq!(layout.row_size(ASSEMBLY_REF), 20);
        assert_eq!(layout.row_size(TYPE_DEF), 14);

        layout.heap_sizes = HEAP_STRING_WIDE | HEAP_BLOB_WIDE;
        assert_eq!(layout.row_size(ASSEMBLY_REF), 28);

        // 5 tag bits leave room for 2^11 rows in a 2-byte coded index
        layout.rows[METHOD_DEF] = 1 << 11;
        assert_eq!(layout.column_size(&Coded(&HAS_CUSTOM_ATTRIBUTE)), 4);
        assert_eq!(layout.column_size(&Coded(&METHOD_DEF_OR_REF)), 2);
    }
}
