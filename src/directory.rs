//! Locating directories inside an image and walking its import and delay-load tables

use serde::Serialize;
use std::io::{Cursor, Read, Seek};

use crate::common::ImageError;
use crate::image::{BinaryImage, DirectoryEntry, Layout};
use crate::reader::ImageReader;

/// IMAGE_IMPORT_DESCRIPTOR: OriginalFirstThunk, TimeDateStamp, ForwarderChain, Name, FirstThunk
const IMPORT_DESCRIPTOR_SIZE: u64 = 20;
const IMPORT_DESCRIPTOR_NAME_OFFSET: u64 = 12;

/// IMAGE_DELAYLOAD_DESCRIPTOR: Attributes, DllNameRVA, ModuleHandleRVA, ImportAddressTableRVA,
/// ImportNameTableRVA, BoundImportAddressTableRVA, UnloadInformationTableRVA, TimeDateStamp
const DELAY_IMPORT_DESCRIPTOR_SIZE: u64 = 32;
const DELAY_IMPORT_DESCRIPTOR_NAME_OFFSET: u64 = 4;
/// Set when the descriptor holds RVAs; old (VC6) descriptors hold virtual addresses instead
const DELAY_ATTRIBUTE_RVA_BASED: u32 = 0x1;

impl BinaryImage {
    /// Offset of a directory in the addressing space the image was decoded from.
    ///
    /// Fails with [`ImageError::DirectoryNotFound`] when the address is zero or no section contains it.
    /// Unless `allow_cross_section` is set, the whole directory must fit in its section.
    pub fn locate(
        &self,
        directory: &DirectoryEntry,
        allow_cross_section: bool,
    ) -> Result<u64, ImageError> {
        let rva = directory.virtual_address;
        let not_found = ImageError::DirectoryNotFound {
            virtual_address: rva,
        };
        if !directory.is_present() {
            return Err(not_found);
        }
        let section = self.section_containing(rva).ok_or(not_found)?;

        let delta = rva - section.virtual_address;
        if !allow_cross_section && directory.size > section.virtual_size - delta {
            return Err(ImageError::bad_format(format!(
                "Section {} is too small for the directory at RVA {rva:#x}",
                section.name
            )));
        }

        Ok(match self.layout() {
            Layout::Mapped => u64::from(rva),
            Layout::File => u64::from(section.pointer_to_raw_data) + u64::from(delta),
        })
    }

    /// Like [`BinaryImage::locate`], with a missing directory reported as `None`
    pub fn try_locate(
        &self,
        directory: &DirectoryEntry,
        allow_cross_section: bool,
    ) -> Result<Option<u64>, ImageError> {
        match self.locate(directory, allow_cross_section) {
            Ok(offset) => Ok(Some(offset)),
            Err(ImageError::DirectoryNotFound { .. }) => Ok(None),
            Err(e) => Err(e),
        }
    }
}

/// Module names listed in an image's native import tables, in table order
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ImportedModules {
    pub imports: Vec<String>,
    pub delay_imports: Vec<String>,
}

/// Walks the descriptor tables of an image over the same bytes it was decoded from
pub struct TableWalker<'a, R> {
    image: &'a BinaryImage,
    reader: ImageReader<R>,
}

impl<'a, 'b> TableWalker<'a, Cursor<&'b [u8]>> {
    pub fn from_bytes(image: &'a BinaryImage, data: &'b [u8]) -> Result<Self, ImageError> {
        Ok(Self::new(image, ImageReader::from_bytes(data)?))
    }
}

impl<'a, R: Read + Seek> TableWalker<'a, R> {
    pub fn new(image: &'a BinaryImage, reader: ImageReader<R>) -> Self {
        Self { image, reader }
    }

    pub fn imported_modules(&mut self) -> Result<ImportedModules, ImageError> {
        Ok(ImportedModules {
            imports: self.import_names()?,
            delay_imports: self.delay_import_names()?,
        })
    }

    pub fn import_names(&mut self) -> Result<Vec<String>, ImageError> {
        let Some(directory) = self
            .image
            .optional_header()
            .map(|h| h.directories.import_table)
        else {
            return Ok(vec![]);
        };
        self.walk(&directory, IMPORT_DESCRIPTOR_SIZE, |walker, descriptor| {
            walker.reader.seek(descriptor + IMPORT_DESCRIPTOR_NAME_OFFSET)?;
            walker.reader.read_u32()
        })
    }

    pub fn delay_import_names(&mut self) -> Result<Vec<String>, ImageError> {
        let Some((directory, image_base)) = self
            .image
            .optional_header()
            .map(|h| (h.directories.delay_import_table, h.image_base))
        else {
            return Ok(vec![]);
        };
        self.walk(&directory, DELAY_IMPORT_DESCRIPTOR_SIZE, |walker, descriptor| {
            walker.reader.seek(descriptor)?;
            let attributes = walker.reader.read_u32()?;
            walker
                .reader
                .seek(descriptor + DELAY_IMPORT_DESCRIPTOR_NAME_OFFSET)?;
            let name = walker.reader.read_u32()?;
            if attributes & DELAY_ATTRIBUTE_RVA_BASED == 0 && u64::from(name) > image_base {
                Ok((u64::from(name) - image_base) as u32)
            } else {
                Ok(name)
            }
        })
    }

    /// Reads descriptors of `stride` bytes until one whose name address is zero
    fn walk<F>(
        &mut self,
        directory: &DirectoryEntry,
        stride: u64,
        name_rva: F,
    ) -> Result<Vec<String>, ImageError>
    where
        F: Fn(&mut Self, u64) -> Result<u32, ImageError>,
    {
        let mut names = vec![];
        let Some(table) = self.image.try_locate(directory, true)? else {
            return Ok(names);
        };

        let mut descriptor = table;
        loop {
            let rva = name_rva(self, descriptor)?;
            if rva == 0 {
                break;
            }
            names.push(self.read_name(rva)?);
            descriptor += stride;
        }
        Ok(names)
    }

    fn read_name(&mut self, rva: u32) -> Result<String, ImageError> {
        let location = DirectoryEntry {
            virtual_address: rva,
            size: 0,
        };
        let offset = match self.image.locate(&location, true) {
            Ok(offset) => offset,
            Err(ImageError::DirectoryNotFound { .. }) => {
                return Err(ImageError::bad_format(format!(
                    "Imported module name at RVA {rva:#x} lies outside every section"
                )))
            }
            Err(e) => return Err(e),
        };
        self.reader.seek(offset)?;
        self.reader.read_c_string()
    }
}
