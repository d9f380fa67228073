//! Synthetic images and an in-memory module loader for tests

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Mutex;

use crate::common::LookupError;
use crate::loader::{LoadedModule, MappedView, ModuleImage, ModuleLoader};
use crate::metadata::AssemblyName;

pub const MSCORLIB_TOKEN: [u8; 8] = [0xb7, 0x7a, 0x5c, 0x56, 0x19, 0x34, 0xe0, 0x89];

const PE_HEADER_OFFSET: usize = 0x80;
const FILE_ALIGNMENT: usize = 0x200;
const SECTION_ALIGNMENT: usize = 0x1000;
const TEXT_RVA: u32 = 0x1000;
const RDATA_RVA: u32 = 0x2000;

fn align(v: usize, to: usize) -> usize {
    v.div_ceil(to) * to
}

fn put_u16(buf: &mut Vec<u8>, v: u16) {
    buf.extend_from_slice(&v.to_le_bytes());
}

fn put_u32(buf: &mut Vec<u8>, v: u32) {
    buf.extend_from_slice(&v.to_le_bytes());
}

fn put_u64(buf: &mut Vec<u8>, v: u64) {
    buf.extend_from_slice(&v.to_le_bytes());
}

fn patch_u32(buf: &mut [u8], at: usize, v: u32) {
    buf[at..at + 4].copy_from_slice(&v.to_le_bytes());
}

fn pad_to(buf: &mut Vec<u8>, alignment: usize) {
    buf.resize(align(buf.len(), alignment), 0);
}

struct Section {
    name: &'static str,
    virtual_address: u32,
    virtual_size: u32,
    data: Vec<u8>,
}

#[derive(Clone)]
struct Managed {
    name: String,
    references: Vec<(String, [u8; 8])>,
}

#[derive(Clone, Default)]
pub struct PeBuilder {
    pe32_plus: bool,
    dll: bool,
    extra_sections: usize,
    imports: Vec<String>,
    delay_imports: Vec<String>,
    managed: Option<Managed>,
    runtime_header_directory_size: Option<u32>,
    optional_header_padding: usize,
}

impl PeBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn pe32_plus(mut self) -> Self {
        self.pe32_plus = true;
        self
    }

    pub fn dll(mut self) -> Self {
        self.dll = true;
        self
    }

    pub fn extra_sections(mut self, count: usize) -> Self {
        self.extra_sections = count;
        self
    }

    pub fn import(mut self, name: &str) -> Self {
        self.imports.push(name.to_owned());
        self
    }

    pub fn delay_import(mut self, name: &str) -> Self {
        self.delay_imports.push(name.to_owned());
        self
    }

    pub fn managed(mut self, name: &str, references: &[(&str, [u8; 8])]) -> Self {
        self.managed = Some(Managed {
            name: name.to_owned(),
            references: references
                .iter()
                .map(|(n, t)| (n.to_string(), *t))
                .collect(),
        });
        self
    }

    pub fn runtime_header_directory_size(mut self, size: u32) -> Self {
        self.runtime_header_directory_size = Some(size);
        self
    }

    /// Zero bytes between the data directories and the section table, counted in SizeOfOptionalHeader
    pub fn optional_header_padding(mut self, bytes: usize) -> Self {
        self.optional_header_padding = bytes;
        self
    }

    fn optional_header_size(&self) -> usize {
        let standard = if self.pe32_plus { 240 } else { 224 };
        standard + self.optional_header_padding
    }

    /// Contents of .rdata and the directories pointing into it: import, delay import, runtime header
    fn rdata(&self) -> (Vec<u8>, [(u32, u32); 3]) {
        let mut data = vec![];
        let mut directories = [(0u32, 0u32); 3];
        let rva = |offset: usize| RDATA_RVA + offset as u32;

        let import_size = if self.imports.is_empty() {
            0
        } else {
            (self.imports.len() + 1) * 20
        };
        let delay_size = if self.delay_imports.is_empty() {
            0
        } else {
            (self.delay_imports.len() + 1) * 32
        };
        data.resize(import_size + delay_size, 0);

        for (i, name) in self.imports.iter().enumerate() {
            let name_rva = rva(data.len());
            data.extend_from_slice(name.as_bytes());
            data.push(0);
            patch_u32(&mut data, i * 20 + 12, name_rva);
        }
        for (i, name) in self.delay_imports.iter().enumerate() {
            let name_rva = rva(data.len());
            data.extend_from_slice(name.as_bytes());
            data.push(0);
            let descriptor = import_size + i * 32;
            patch_u32(&mut data, descriptor, 1);
            patch_u32(&mut data, descriptor + 4, name_rva);
        }
        if import_size > 0 {
            directories[0] = (rva(0), import_size as u32);
        }
        if delay_size > 0 {
            directories[1] = (rva(import_size), delay_size as u32);
        }

        if let Some(managed) = &self.managed {
            pad_to(&mut data, 4);
            let header = data.len();
            let references: Vec<(&str, [u8; 8])> = managed
                .references
                .iter()
                .map(|(n, t)| (n.as_str(), *t))
                .collect();
            let metadata = metadata_root(&managed.name, &references);

            put_u32(&mut data, 72);
            put_u16(&mut data, 2);
            put_u16(&mut data, 5);
            let metadata_rva = rva(header + 72);
            put_u32(&mut data, metadata_rva);
            put_u32(&mut data, metadata.len() as u32);
            // flags: IL only
            put_u32(&mut data, 1);
            data.resize(header + 72, 0);
            data.extend_from_slice(&metadata);

            directories[2] = (
                rva(header),
                self.runtime_header_directory_size.unwrap_or(72),
            );
        }
        (data, directories)
    }

    fn sections(&self) -> (Vec<Section>, [(u32, u32); 3]) {
        let (rdata, directories) = self.rdata();
        let mut sections = vec![
            Section {
                name: ".text",
                virtual_address: TEXT_RVA,
                virtual_size: 0x100,
                data: vec![0xc3; 0x100],
            },
            Section {
                name: ".rdata",
                virtual_address: RDATA_RVA,
                virtual_size: rdata.len().max(1) as u32,
                data: rdata,
            },
        ];
        for i in 0..self.extra_sections {
            let name: &'static str = [".sec0", ".sec1", ".sec2", ".sec3", ".sec4", ".sec5"][i];
            sections.push(Section {
                name,
                virtual_address: RDATA_RVA + ((i + 1) * SECTION_ALIGNMENT) as u32,
                virtual_size: 0x10,
                data: vec![0; 0x10],
            });
        }
        (sections, directories)
    }

    fn headers(&self, sections: &[Section], directories: [(u32, u32); 3], raw: &[u32]) -> Vec<u8> {
        let mut h = vec![0u8; PE_HEADER_OFFSET];
        h[0] = b'M';
        h[1] = b'Z';
        patch_u32(&mut h, 60, PE_HEADER_OFFSET as u32);
        h.extend_from_slice(b"PE\0\0");

        let size_of_headers = self.size_of_headers(sections.len());
        let last = sections.last().map_or(0, |s| {
            s.virtual_address as usize + align(s.virtual_size as usize, SECTION_ALIGNMENT)
        });

        // COFF header
        put_u16(&mut h, if self.pe32_plus { 0x8664 } else { 0x14c });
        put_u16(&mut h, sections.len() as u16);
        put_u32(&mut h, 0);
        put_u32(&mut h, 0);
        put_u32(&mut h, 0);
        put_u16(&mut h, self.optional_header_size() as u16);
        put_u16(&mut h, if self.dll { 0x2002 } else { 0x0002 });

        // optional header
        let word = |h: &mut Vec<u8>, v: u64| {
            if self.pe32_plus {
                put_u64(h, v)
            } else {
                put_u32(h, v as u32)
            }
        };
        put_u16(&mut h, if self.pe32_plus { 0x20b } else { 0x10b });
        h.push(14);
        h.push(0);
        put_u32(&mut h, 0x200);
        put_u32(&mut h, 0x200);
        put_u32(&mut h, 0);
        put_u32(&mut h, TEXT_RVA);
        put_u32(&mut h, TEXT_RVA);
        if !self.pe32_plus {
            put_u32(&mut h, 0);
        }
        word(
            &mut h,
            if self.pe32_plus {
                0x1_8000_0000
            } else {
                0x40_0000
            },
        );
        put_u32(&mut h, SECTION_ALIGNMENT as u32);
        put_u32(&mut h, FILE_ALIGNMENT as u32);
        for v in [6u16, 0, 0, 0, 6, 0] {
            put_u16(&mut h, v);
        }
        put_u32(&mut h, 0);
        put_u32(&mut h, last as u32);
        put_u32(&mut h, size_of_headers as u32);
        put_u32(&mut h, 0);
        put_u16(&mut h, 3);
        put_u16(&mut h, 0x8160);
        word(&mut h, 0x10_0000);
        word(&mut h, 0x1000);
        word(&mut h, 0x10_0000);
        word(&mut h, 0x1000);
        put_u32(&mut h, 0);
        put_u32(&mut h, 16);
        for index in 0..16 {
            let (va, size) = match index {
                1 => directories[0],
                13 => directories[1],
                14 => directories[2],
                _ => (0, 0),
            };
            put_u32(&mut h, va);
            put_u32(&mut h, size);
        }
        h.resize(h.len() + self.optional_header_padding, 0);

        for (section, pointer) in sections.iter().zip(raw) {
            let mut name = [0u8; 8];
            name[..section.name.len()].copy_from_slice(section.name.as_bytes());
            h.extend_from_slice(&name);
            put_u32(&mut h, section.virtual_size);
            put_u32(&mut h, section.virtual_address);
            put_u32(&mut h, align(section.data.len(), FILE_ALIGNMENT) as u32);
            put_u32(&mut h, *pointer);
            put_u32(&mut h, 0);
            put_u32(&mut h, 0);
            put_u16(&mut h, 0);
            put_u16(&mut h, 0);
            put_u32(&mut h, 0x4000_0040);
        }
        h.resize(size_of_headers, 0);
        h
    }

    fn size_of_headers(&self, sections: usize) -> usize {
        align(
            PE_HEADER_OFFSET + 24 + self.optional_header_size() + sections * 40,
            FILE_ALIGNMENT,
        )
    }

    /// Image as it is laid out on disk
    pub fn build_file(&self) -> Vec<u8> {
        let (sections, directories) = self.sections();
        let mut pointer = self.size_of_headers(sections.len());
        let mut raw = vec![];
        for s in &sections {
            raw.push(pointer as u32);
            pointer += align(s.data.len(), FILE_ALIGNMENT);
        }

        let mut image = self.headers(&sections, directories, &raw);
        for s in &sections {
            image.extend_from_slice(&s.data);
            pad_to(&mut image, FILE_ALIGNMENT);
        }
        image
    }

    /// Image as the OS loader maps it: every section at its virtual address
    pub fn build_mapped(&self) -> Vec<u8> {
        let file = self.build_file();
        let (sections, _) = self.sections();
        let mut pointer = self.size_of_headers(sections.len());
        let size_of_image = sections.last().map_or(pointer, |s| {
            s.virtual_address as usize + align(s.virtual_size as usize, SECTION_ALIGNMENT)
        });

        let mut view = vec![0u8; size_of_image];
        view[..pointer].copy_from_slice(&file[..pointer]);
        for s in &sections {
            let va = s.virtual_address as usize;
            view[va..va + s.data.len()].copy_from_slice(&file[pointer..pointer + s.data.len()]);
            pointer += align(s.data.len(), FILE_ALIGNMENT);
        }
        view
    }
}

/// A metadata root with `#~`, `#Strings` and `#Blob` streams defining assembly `name` 1.0.0.0
/// and one AssemblyRef 4.0.0.0 per entry of `references`
pub fn metadata_root(name: &str, references: &[(&str, [u8; 8])]) -> Vec<u8> {
    let mut strings = vec![0u8];
    let mut intern = |s: &str| {
        let index = strings.len() as u16;
        strings.extend_from_slice(s.as_bytes());
        strings.push(0);
        index
    };
    let name_index = intern(name);
    let reference_names: Vec<u16> = references.iter().map(|(n, _)| intern(n)).collect();

    let mut blob = vec![0u8];
    let token_indices: Vec<u16> = references
        .iter()
        .map(|(_, token)| {
            let index = blob.len() as u16;
            blob.push(8);
            blob.extend_from_slice(token);
            index
        })
        .collect();

    let mut tables = vec![];
    put_u32(&mut tables, 0);
    tables.extend_from_slice(&[2, 0, 0, 1]);
    let mut valid = 1u64 << 0x20;
    if !references.is_empty() {
        valid |= 1u64 << 0x23;
    }
    put_u64(&mut tables, valid);
    put_u64(&mut tables, 0);
    put_u32(&mut tables, 1);
    if !references.is_empty() {
        put_u32(&mut tables, references.len() as u32);
    }
    // Assembly
    put_u32(&mut tables, 0x8004);
    for v in [1u16, 0, 0, 0] {
        put_u16(&mut tables, v);
    }
    put_u32(&mut tables, 0);
    put_u16(&mut tables, 0);
    put_u16(&mut tables, name_index);
    put_u16(&mut tables, 0);
    // AssemblyRef
    for (name, token) in reference_names.iter().zip(&token_indices) {
        for v in [4u16, 0, 0, 0] {
            put_u16(&mut tables, v);
        }
        put_u32(&mut tables, 0);
        put_u16(&mut tables, *token);
        put_u16(&mut tables, *name);
        put_u16(&mut tables, 0);
        put_u16(&mut tables, 0);
    }

    for stream in [&mut tables, &mut strings, &mut blob] {
        pad_to(stream, 4);
    }

    let mut root = vec![];
    root.extend_from_slice(b"BSJB");
    put_u16(&mut root, 1);
    put_u16(&mut root, 1);
    put_u32(&mut root, 0);
    put_u32(&mut root, 12);
    root.extend_from_slice(b"v4.0.30319\0\0");
    put_u16(&mut root, 0);
    put_u16(&mut root, 3);

    let headers_len = 12 + 20 + 16;
    let mut offset = root.len() + headers_len;
    for (stream, padded_name) in [
        (&tables, &b"#~\0\0"[..]),
        (&strings, &b"#Strings\0\0\0\0"[..]),
        (&blob, &b"#Blob\0\0\0"[..]),
    ] {
        put_u32(&mut root, offset as u32);
        put_u32(&mut root, stream.len() as u32);
        root.extend_from_slice(padded_name);
        offset += stream.len();
    }
    root.extend_from_slice(&tables);
    root.extend_from_slice(&strings);
    root.extend_from_slice(&blob);
    root
}

pub struct MappedBuffer(pub Vec<u8>);

impl MappedView for MappedBuffer {
    fn bytes(&self) -> &[u8] {
        &self.0
    }
}

/// Serves images from memory, keyed by lowercase file name; counts load requests per name
#[derive(Default)]
pub struct MemoryLoader {
    modules: HashMap<String, Vec<u8>>,
    mapped: bool,
    loads: Mutex<HashMap<String, usize>>,
}

impl MemoryLoader {
    pub fn new() -> Self {
        Self::default()
    }

    /// Hand images out as mapped views instead of file buffers
    pub fn mapped(mut self) -> Self {
        self.mapped = true;
        self
    }

    pub fn with(mut self, name: &str, builder: PeBuilder) -> Self {
        let image = if self.mapped {
            builder.build_mapped()
        } else {
            builder.build_file()
        };
        self.modules.insert(name.to_lowercase(), image);
        self
    }

    pub fn with_bytes(mut self, name: &str, bytes: Vec<u8>) -> Self {
        self.modules.insert(name.to_lowercase(), bytes);
        self
    }

    pub fn load_count(&self, name: &str) -> usize {
        self.loads
            .lock()
            .expect("load counter")
            .get(&name.to_lowercase())
            .copied()
            .unwrap_or(0)
    }

    pub fn total_loads(&self) -> usize {
        self.loads.lock().expect("load counter").values().sum()
    }
}

impl ModuleLoader for MemoryLoader {
    fn load(&self, name: &str) -> Result<LoadedModule, LookupError> {
        let key = if AssemblyName::is_display_name(name) {
            format!("{}.dll", AssemblyName::parse(name)?.name).to_lowercase()
        } else {
            name.to_lowercase()
        };
        *self
            .loads
            .lock()
            .expect("load counter")
            .entry(name.to_lowercase())
            .or_default() += 1;

        let bytes = self
            .modules
            .get(&key)
            .ok_or_else(|| LookupError::not_found(name))?
            .clone();
        let image = if self.mapped {
            ModuleImage::Mapped(Box::new(MappedBuffer(bytes)))
        } else {
            ModuleImage::File(bytes)
        };
        Ok(LoadedModule {
            resolved_path: PathBuf::from("/virtual").join(&key),
            image,
        })
    }
}
