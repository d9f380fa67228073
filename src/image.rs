//! Decoding of PE/COFF headers, section table, runtime (CLR) header and metadata region

use serde::Serialize;
use std::io::{Read, Seek};

use crate::common::ImageError;
use crate::reader::ImageReader;

pub const DOS_SIGNATURE: u16 = 0x5A4D;
pub const PE_SIGNATURE: u32 = 0x0000_4550;
const DOS_LFANEW_OFFSET: u64 = 60;

pub const COFF_HEADER_SIZE: u64 = 20;
pub const SECTION_HEADER_SIZE: u64 = 40;
pub const RUNTIME_HEADER_SIZE: u32 = 72;
const NUMBER_OF_DIRECTORIES: usize = 16;

pub const IMAGE_FILE_DLL: u16 = 0x2000;
pub const IMAGE_FILE_EXECUTABLE_IMAGE: u16 = 0x0002;
pub const IMAGE_SUBSYSTEM_WINDOWS_CUI: u16 = 3;

/// Name of the section holding managed metadata in COFF-only object files
pub const CORMETA_SECTION: &str = ".cormeta";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
pub struct DirectoryEntry {
    pub virtual_address: u32,
    pub size: u32,
}

impl DirectoryEntry {
    fn read<R: Read + Seek>(r: &mut ImageReader<R>) -> Result<Self, ImageError> {
        Ok(Self {
            virtual_address: r.read_u32()?,
            size: r.read_u32()?,
        })
    }

    /// A zero address marks an absent table, whatever the size says
    pub fn is_present(&self) -> bool {
        self.virtual_address != 0
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum Magic {
    Pe32,
    Pe32Plus,
}

impl Magic {
    pub const PE32: u16 = 0x10b;
    pub const PE32_PLUS: u16 = 0x20b;

    fn from_u16(v: u16) -> Result<Self, ImageError> {
        match v {
            Self::PE32 => Ok(Magic::Pe32),
            Self::PE32_PLUS => Ok(Magic::Pe32Plus),
            _ => Err(ImageError::bad_format(format!(
                "Unknown optional header magic {v:#x}"
            ))),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CoffHeader {
    pub machine: u16,
    pub number_of_sections: u16,
    pub time_date_stamp: u32,
    pub pointer_to_symbol_table: u32,
    pub number_of_symbols: u32,
    pub size_of_optional_header: u16,
    pub characteristics: u16,
}

impl CoffHeader {
    fn read<R: Read + Seek>(r: &mut ImageReader<R>) -> Result<Self, ImageError> {
        Ok(Self {
            machine: r.read_u16()?,
            number_of_sections: r.read_u16()?,
            time_date_stamp: r.read_u32()?,
            pointer_to_symbol_table: r.read_u32()?,
            number_of_symbols: r.read_u32()?,
            size_of_optional_header: r.read_u16()?,
            characteristics: r.read_u16()?,
        })
    }
}

/// The well-known entries of the optional header's directory table.
/// The sixteenth (reserved) entry is consumed but not kept.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize)]
pub struct DataDirectories {
    pub export_table: DirectoryEntry,
    pub import_table: DirectoryEntry,
    pub resource_table: DirectoryEntry,
    pub exception_table: DirectoryEntry,
    pub certificate_table: DirectoryEntry,
    pub base_relocation_table: DirectoryEntry,
    pub debug_table: DirectoryEntry,
    pub copyright_table: DirectoryEntry,
    pub global_pointer_table: DirectoryEntry,
    pub thread_local_storage_table: DirectoryEntry,
    pub load_config_table: DirectoryEntry,
    pub bound_import_table: DirectoryEntry,
    pub import_address_table: DirectoryEntry,
    pub delay_import_table: DirectoryEntry,
    pub runtime_header_table: DirectoryEntry,
}

impl DataDirectories {
    fn read<R: Read + Seek>(r: &mut ImageReader<R>) -> Result<Self, ImageError> {
        let mut entries = [DirectoryEntry::default(); NUMBER_OF_DIRECTORIES];
        for entry in entries.iter_mut() {
            *entry = DirectoryEntry::read(r)?;
        }
        let [export_table, import_table, resource_table, exception_table, certificate_table, base_relocation_table, debug_table, copyright_table, global_pointer_table, thread_local_storage_table, load_config_table, bound_import_table, import_address_table, delay_import_table, runtime_header_table, _reserved] =
            entries;
        Ok(Self {
            export_table,
            import_table,
            resource_table,
            exception_table,
            certificate_table,
            base_relocation_table,
            debug_table,
            copyright_table,
            global_pointer_table,
            thread_local_storage_table,
            load_config_table,
            bound_import_table,
            import_address_table,
            delay_import_table,
            runtime_header_table,
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct OptionalHeader {
    pub magic: Magic,
    pub major_linker_version: u8,
    pub minor_linker_version: u8,
    pub size_of_code: u32,
    pub size_of_initialized_data: u32,
    pub size_of_uninitialized_data: u32,
    pub address_of_entry_point: u32,
    pub base_of_code: u32,
    /// Not present in PE32+ images
    pub base_of_data: Option<u32>,
    pub image_base: u64,
    pub section_alignment: u32,
    pub file_alignment: u32,
    pub major_operating_system_version: u16,
    pub minor_operating_system_version: u16,
    pub major_image_version: u16,
    pub minor_image_version: u16,
    pub major_subsystem_version: u16,
    pub minor_subsystem_version: u16,
    pub win32_version_value: u32,
    pub size_of_image: u32,
    pub size_of_headers: u32,
    pub check_sum: u32,
    pub subsystem: u16,
    pub dll_characteristics: u16,
    pub size_of_stack_reserve: u64,
    pub size_of_stack_commit: u64,
    pub size_of_heap_reserve: u64,
    pub size_of_heap_commit: u64,
    pub loader_flags: u32,
    pub number_of_rva_and_sizes: u32,
    pub directories: DataDirectories,
}

impl OptionalHeader {
    fn read<R: Read + Seek>(r: &mut ImageReader<R>) -> Result<Self, ImageError> {
        let magic = Magic::from_u16(r.read_u16()?)?;
        let wide = magic == Magic::Pe32Plus;
        // fields that are 4 bytes in PE32 and 8 bytes in PE32+
        let read_word = |r: &mut ImageReader<R>| -> Result<u64, ImageError> {
            if wide {
                r.read_u64()
            } else {
                r.read_u32().map(u64::from)
            }
        };

        Ok(Self {
            magic,
            major_linker_version: r.read_u8()?,
            minor_linker_version: r.read_u8()?,
            size_of_code: r.read_u32()?,
            size_of_initialized_data: r.read_u32()?,
            size_of_uninitialized_data: r.read_u32()?,
            address_of_entry_point: r.read_u32()?,
            base_of_code: r.read_u32()?,
            base_of_data: if wide { None } else { Some(r.read_u32()?) },
            image_base: read_word(r)?,
            section_alignment: r.read_u32()?,
            file_alignment: r.read_u32()?,
            major_operating_system_version: r.read_u16()?,
            minor_operating_system_version: r.read_u16()?,
            major_image_version: r.read_u16()?,
            minor_image_version: r.read_u16()?,
            major_subsystem_version: r.read_u16()?,
            minor_subsystem_version: r.read_u16()?,
            win32_version_value: r.read_u32()?,
            size_of_image: r.read_u32()?,
            size_of_headers: r.read_u32()?,
            check_sum: r.read_u32()?,
            subsystem: r.read_u16()?,
            dll_characteristics: r.read_u16()?,
            size_of_stack_reserve: read_word(r)?,
            size_of_stack_commit: read_word(r)?,
            size_of_heap_reserve: read_word(r)?,
            size_of_heap_commit: read_word(r)?,
            loader_flags: r.read_u32()?,
            number_of_rva_and_sizes: r.read_u32()?,
            directories: DataDirectories::read(r)?,
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SectionHeader {
    pub name: String,
    pub virtual_size: u32,
    pub virtual_address: u32,
    pub size_of_raw_data: u32,
    pub pointer_to_raw_data: u32,
    pub pointer_to_relocations: u32,
    pub pointer_to_line_numbers: u32,
    pub number_of_relocations: u16,
    pub number_of_line_numbers: u16,
    pub characteristics: u32,
}

impl SectionHeader {
    fn read<R: Read + Seek>(r: &mut ImageReader<R>) -> Result<Self, ImageError> {
        Ok(Self {
            name: r.read_null_padded_utf8(8)?,
            virtual_size: r.read_u32()?,
            virtual_address: r.read_u32()?,
            size_of_raw_data: r.read_u32()?,
            pointer_to_raw_data: r.read_u32()?,
            pointer_to_relocations: r.read_u32()?,
            pointer_to_line_numbers: r.read_u32()?,
            number_of_relocations: r.read_u16()?,
            number_of_line_numbers: r.read_u16()?,
            characteristics: r.read_u32()?,
        })
    }

    /// Whether `rva` falls within `[virtual_address, virtual_address + virtual_size)`
    pub fn contains(&self, rva: u32) -> bool {
        let start = u64::from(self.virtual_address);
        let end = start + u64::from(self.virtual_size);
        (start..end).contains(&u64::from(rva))
    }
}

/// The CLI header of a managed image
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RuntimeHeader {
    pub size: u32,
    pub major_runtime_version: u16,
    pub minor_runtime_version: u16,
    pub metadata: DirectoryEntry,
    pub flags: u32,
    pub entry_point_token_or_rva: u32,
    pub resources: DirectoryEntry,
    pub strong_name_signature: DirectoryEntry,
    pub code_manager_table: DirectoryEntry,
    pub vtable_fixups: DirectoryEntry,
    pub export_address_table_jumps: DirectoryEntry,
    pub managed_native_header: DirectoryEntry,
}

impl RuntimeHeader {
    fn read<R: Read + Seek>(r: &mut ImageReader<R>) -> Result<Self, ImageError> {
        Ok(Self {
            size: r.read_u32()?,
            major_runtime_version: r.read_u16()?,
            minor_runtime_version: r.read_u16()?,
            metadata: DirectoryEntry::read(r)?,
            flags: r.read_u32()?,
            entry_point_token_or_rva: r.read_u32()?,
            resources: DirectoryEntry::read(r)?,
            strong_name_signature: DirectoryEntry::read(r)?,
            code_manager_table: DirectoryEntry::read(r)?,
            vtable_fixups: DirectoryEntry::read(r)?,
            export_address_table_jumps: DirectoryEntry::read(r)?,
            managed_native_header: DirectoryEntry::read(r)?,
        })
    }
}

/// Span of the managed metadata, as an offset into the same source the image was decoded from
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct MetadataRegion {
    pub start: u64,
    pub size: u32,
}

/// How addresses inside the image are interpreted
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum Layout {
    /// A file on disk: directories resolve through the sections' raw data pointers
    File,
    /// An image mapped by the OS loader: relative virtual addresses are offsets from the base
    Mapped,
}

/// Decoded headers of a PE or COFF-only image. Immutable once constructed.
#[derive(Debug, Clone, Serialize)]
pub struct BinaryImage {
    layout: Layout,
    coff_header_offset: u64,
    coff_header: CoffHeader,
    optional_header_offset: Option<u64>,
    optional_header: Option<OptionalHeader>,
    section_headers: Vec<SectionHeader>,
    runtime_header_offset: Option<u64>,
    runtime_header: Option<RuntimeHeader>,
    metadata_region: Option<MetadataRegion>,
}

impl BinaryImage {
    /// Decode a file-layout image from the reader's window
    pub fn parse<R: Read + Seek>(reader: &mut ImageReader<R>) -> Result<Self, ImageError> {
        Self::decode(reader, Layout::File)
    }

    pub fn parse_bytes(data: &[u8]) -> Result<Self, ImageError> {
        Self::parse(&mut ImageReader::from_bytes(data)?)
    }

    /// Decode an image mapped into memory by the OS loader, `view` starting at its base address
    pub fn parse_mapped(view: &[u8]) -> Result<Self, ImageError> {
        Self::decode(&mut ImageReader::from_bytes(view)?, Layout::Mapped)
    }

    fn decode<R: Read + Seek>(r: &mut ImageReader<R>, layout: Layout) -> Result<Self, ImageError> {
        let coff_only = !skip_dos_header(r)?;

        let coff_header_offset = r.offset();
        let coff_header = CoffHeader::read(r)?;

        let (optional_header_offset, optional_header) = if coff_only {
            (None, None)
        } else {
            let offset = r.offset();
            (Some(offset), Some(OptionalHeader::read(r)?))
        };

        // the section table follows SizeOfOptionalHeader, not the directories we decoded
        let table = coff_header_offset
            + COFF_HEADER_SIZE
            + u64::from(coff_header.size_of_optional_header);
        if r.offset() != table {
            r.seek(table)?;
        }
        let section_headers = (0..coff_header.number_of_sections)
            .map(|_| SectionHeader::read(r))
            .collect::<Result<Vec<_>, _>>()?;

        let mut image = Self {
            layout,
            coff_header_offset,
            coff_header,
            optional_header_offset,
            optional_header,
            section_headers,
            runtime_header_offset: None,
            runtime_header: None,
            metadata_region: None,
        };

        if let Some(offset) = image.find_runtime_header()? {
            r.seek(offset)?;
            image.runtime_header_offset = Some(offset);
            image.runtime_header = Some(RuntimeHeader::read(r)?);
        }
        image.metadata_region = image.find_metadata_region(r.size())?;

        Ok(image)
    }

    fn find_runtime_header(&self) -> Result<Option<u64>, ImageError> {
        let Some(optional_header) = &self.optional_header else {
            return Ok(None);
        };
        let directory = &optional_header.directories.runtime_header_table;
        let Some(offset) = self.try_locate(directory, false)? else {
            return Ok(None);
        };
        if directory.size < RUNTIME_HEADER_SIZE {
            return Err(ImageError::bad_format("Invalid runtime header size"));
        }
        Ok(Some(offset))
    }

    fn find_metadata_region(&self, image_size: u64) -> Result<Option<MetadataRegion>, ImageError> {
        let (start, size) = if self.is_coff_only() {
            match self.section_by_name(CORMETA_SECTION) {
                Some(s) if self.layout == Layout::Mapped => {
                    (u64::from(s.virtual_address), s.virtual_size)
                }
                Some(s) => (u64::from(s.pointer_to_raw_data), s.size_of_raw_data),
                None => return Ok(None),
            }
        } else {
            let Some(runtime_header) = &self.runtime_header else {
                return Ok(None);
            };
            let start = match self.locate(&runtime_header.metadata, false) {
                Ok(start) => start,
                Err(ImageError::DirectoryNotFound { .. }) => {
                    return Err(ImageError::bad_format(
                        "Runtime header is missing its metadata directory",
                    ))
                }
                Err(e) => return Err(e),
            };
            (start, runtime_header.metadata.size)
        };

        // a mapped view spans SizeOfImage, which the loader already validated
        if self.layout == Layout::File {
            let size = u64::from(size);
            let past_end = image_size.checked_sub(size).map_or(true, |room| start > room);
            if start >= image_size || size == 0 || past_end {
                return Err(ImageError::bad_format("Invalid metadata section span"));
            }
        }

        Ok(Some(MetadataRegion { start, size }))
    }

    pub fn layout(&self) -> Layout {
        self.layout
    }

    pub fn is_loaded_image(&self) -> bool {
        self.layout == Layout::Mapped
    }

    pub fn coff_header_offset(&self) -> u64 {
        self.coff_header_offset
    }

    pub fn coff_header(&self) -> &CoffHeader {
        &self.coff_header
    }

    pub fn optional_header_offset(&self) -> Option<u64> {
        self.optional_header_offset
    }

    pub fn optional_header(&self) -> Option<&OptionalHeader> {
        self.optional_header.as_ref()
    }

    pub fn section_headers(&self) -> &[SectionHeader] {
        &self.section_headers
    }

    pub fn runtime_header_offset(&self) -> Option<u64> {
        self.runtime_header_offset
    }

    pub fn runtime_header(&self) -> Option<&RuntimeHeader> {
        self.runtime_header.as_ref()
    }

    pub fn metadata_region(&self) -> Option<MetadataRegion> {
        self.metadata_region
    }

    pub fn is_coff_only(&self) -> bool {
        self.optional_header.is_none()
    }

    pub fn is_managed(&self) -> bool {
        self.runtime_header.is_some()
    }

    pub fn is_dll(&self) -> bool {
        self.coff_header.characteristics & IMAGE_FILE_DLL != 0
    }

    pub fn is_exe(&self) -> bool {
        !self.is_dll() && self.coff_header.characteristics & IMAGE_FILE_EXECUTABLE_IMAGE != 0
    }

    pub fn is_console_application(&self) -> bool {
        self.optional_header
            .as_ref()
            .is_some_and(|h| h.subsystem == IMAGE_SUBSYSTEM_WINDOWS_CUI)
    }

    /// First section (in table order) whose virtual range contains `rva`
    pub fn section_containing(&self, rva: u32) -> Option<&SectionHeader> {
        self.section_headers.iter().find(|s| s.contains(rva))
    }

    pub fn section_by_name(&self, name: &str) -> Option<&SectionHeader> {
        self.section_headers.iter().find(|s| s.name == name)
    }
}

/// Returns false when the image has no DOS stub and should be decoded as COFF-only.
/// On success the reader is positioned at the COFF header.
fn skip_dos_header<R: Read + Seek>(r: &mut ImageReader<R>) -> Result<bool, ImageError> {
    let magic = r.read_u16()?;
    if magic != DOS_SIGNATURE {
        // anonymous object headers (import libraries, LTCG objects) start with 0x0000 0xFFFF
        if magic == 0 && r.read_u16()? == 0xFFFF {
            return Err(ImageError::bad_format("Unknown file format"));
        }
        r.seek(0)?;
        return Ok(false);
    }

    r.seek(DOS_LFANEW_OFFSET)?;
    let pe_header_offset = r.read_u32()?;
    r.seek(u64::from(pe_header_offset))?;
    if r.read_u32()? != PE_SIGNATURE {
        return Err(ImageError::bad_format("Invalid PE signature"));
    }
    Ok(true)
}
