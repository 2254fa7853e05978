/// Minimal PE image reader
///
/// Walks a mapped PE image far enough to find its CodeView (RSDS) debug
/// record, which names the PDB and carries the GUID/age pair symbol stores
/// are keyed by. The image is read through a [`RemoteStream`], so offsets
/// are RVAs.

use goblin::pe::data_directories::DataDirectory;
use goblin::pe::debug::{CodeviewPDB70DebugInfo, ImageDebugDirectory, IMAGE_DEBUG_TYPE_CODEVIEW};
use goblin::pe::header::{Header, DOS_MAGIC, PE_POINTER_OFFSET};
use scroll::Pread;
use thiserror::Error;

use crate::commands::{CommandError, MemoryAccess};
use crate::memory::RemoteStream;

// COFF and optional headers, data directories included, fit well inside this
const NT_HEADERS_SPAN: usize = 0x200;
const MAX_HEADER_OFFSET: u32 = 0x1000;
const MAX_DEBUG_ENTRIES: u32 = 16;
const MAX_PDB_NAME: usize = 260;
const RSDS_HEADER_SIZE: usize = 24;

#[derive(Error, Debug)]
pub enum PeError {
    #[error("Memory read failed: {0}")]
    Read(#[from] CommandError),
    #[error("Missing MZ signature")]
    NotMz,
    #[error("Invalid image headers: {0}")]
    Parse(#[from] goblin::error::Error),
    #[error("Invalid debug directory: {0}")]
    Scroll(#[from] scroll::Error),
    #[error("Malformed image: {0}")]
    Malformed(String),
}

pub type Result<T> = std::result::Result<T, PeError>;

/// CodeView identity of a module
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DebugDescriptor {
    pub pdb_name: String,
    pub guid: [u8; 16],
    pub age: u32,
}

impl DebugDescriptor {
    /// GUID text as used by symbol stores: Data1-3 in their native
    /// little-endian order, then Data4 bytewise, then the age, all uppercase
    pub fn guid_string(&self) -> String {
        let g = &self.guid;
        let data1 = u32::from_le_bytes([g[0], g[1], g[2], g[3]]);
        let data2 = u16::from_le_bytes([g[4], g[5]]);
        let data3 = u16::from_le_bytes([g[6], g[7]]);
        let data4: String = g[8..].iter().map(|b| format!("{:02X}", b)).collect();
        format!("{:08X}{:04X}{:04X}{}", data1, data2, data3, data4)
    }

    /// `<GUID><age>` directory name of this PDB in a symbol store
    pub fn symbol_key(&self) -> String {
        format!("{}{:X}", self.guid_string(), self.age)
    }
}

impl std::fmt::Display for DebugDescriptor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{} {}", self.pdb_name, self.symbol_key())
    }
}

/// Find the CodeView descriptor of the image mapped at the stream's base.
/// `Ok(None)` means the image is valid but carries no RSDS record.
pub async fn read_debug_descriptor<M: MemoryAccess>(
    stream: &mut RemoteStream<'_, M>,
) -> Result<Option<DebugDescriptor>> {
    // cheap rejection before pulling the whole header span over the wire
    if stream.read_u16(0).await? != DOS_MAGIC {
        return Err(PeError::NotMz);
    }
    let e_lfanew = stream.read_u32(PE_POINTER_OFFSET as u64).await?;
    if e_lfanew == 0 || e_lfanew > MAX_HEADER_OFFSET {
        return Err(PeError::Malformed(format!("e_lfanew {:#x}", e_lfanew)));
    }

    let headers = stream.read_at(0, e_lfanew as usize + NT_HEADERS_SPAN).await?;
    let header = Header::parse(&headers)?;
    let debug_table: Option<DataDirectory> = header
        .optional_header
        .as_ref()
        .and_then(|optional| optional.data_directories.get_debug_table())
        .copied();

    let Some(table) = debug_table else {
        return Ok(None);
    };
    if table.virtual_address == 0 || table.size == 0 {
        return Ok(None);
    }

    let entry_size = std::mem::size_of::<ImageDebugDirectory>();
    let entries = (table.size / entry_size as u32).min(MAX_DEBUG_ENTRIES) as usize;
    let directory = stream
        .read_at(table.virtual_address as u64, entries * entry_size)
        .await?;

    for index in 0..entries {
        let entry: ImageDebugDirectory = directory.pread_with(index * entry_size, scroll::LE)?;
        if entry.data_type != IMAGE_DEBUG_TYPE_CODEVIEW
            || entry.address_of_raw_data == 0
            || (entry.size_of_data as usize) < RSDS_HEADER_SIZE
        {
            continue;
        }

        let len = (entry.size_of_data as usize).min(RSDS_HEADER_SIZE + MAX_PDB_NAME);
        let record = stream.read_at(entry.address_of_raw_data as u64, len).await?;

        // the record now sits at offset 0 of its own buffer
        let local = ImageDebugDirectory {
            size_of_data: len as u32,
            address_of_raw_data: 0,
            pointer_to_raw_data: 0,
            ..entry
        };
        return match CodeviewPDB70DebugInfo::parse(&record, &local)? {
            Some(info) => descriptor_from_codeview(&info).map(Some),
            None => Err(PeError::Malformed("CodeView entry is not an RSDS record".to_string())),
        };
    }

    Ok(None)
}

fn descriptor_from_codeview(info: &CodeviewPDB70DebugInfo<'_>) -> Result<DebugDescriptor> {
    let name = info.filename;
    let end = name.iter().position(|b| *b == 0).unwrap_or(name.len());
    let pdb_name = String::from_utf8_lossy(&name[..end]).into_owned();
    if pdb_name.is_empty() {
        return Err(PeError::Malformed("empty PDB name".to_string()));
    }

    Ok(DebugDescriptor {
        pdb_name,
        guid: info.signature,
        age: info.age,
    })
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::memory::tests::FakeMemory;

    pub(crate) const TEST_GUID: [u8; 16] = [
        0x78, 0x56, 0x34, 0x12, 0xbc, 0x9a, 0xf0, 0xde, 0x01, 0x02, 0x03, 0x04, 0x05, 0x06, 0x07, 0x08,
    ];

    fn put_u16(image: &mut [u8], at: usize, value: u16) {
        image[at..at + 2].copy_from_slice(&value.to_le_bytes());
    }

    fn put_u32(image: &mut [u8], at: usize, value: u32) {
        image[at..at + 4].copy_from_slice(&value.to_le_bytes());
    }

    /// A one-page PE32+ image whose debug directory points at an RSDS record
    pub(crate) fn build_image(pdb_name: &str) -> Vec<u8> {
        let mut image = vec![0u8; 0x1000];
        image[..2].copy_from_slice(b"MZ");
        put_u32(&mut image, 0x3c, 0x80);
        image[0x80..0x84].copy_from_slice(b"PE\0\0");
        // COFF header: AMD64, no sections, standard PE32+ optional header size
        put_u16(&mut image, 0x84, 0x8664);
        put_u16(&mut image, 0x84 + 16, 0xf0);

        let optional = 0x80 + 24;
        put_u16(&mut image, optional, 0x20b);
        put_u32(&mut image, optional + 108, 16);
        let debug_dir = optional + 112 + 6 * 8;
        put_u32(&mut image, debug_dir, 0x300);
        put_u32(&mut image, debug_dir + 4, 28);

        // IMAGE_DEBUG_DIRECTORY
        put_u32(&mut image, 0x300 + 12, 2);
        put_u32(&mut image, 0x300 + 16, (24 + pdb_name.len() + 1) as u32);
        put_u32(&mut image, 0x300 + 20, 0x400);

        image[0x400..0x404].copy_from_slice(b"RSDS");
        image[0x404..0x414].copy_from_slice(&TEST_GUID);
        put_u32(&mut image, 0x414, 2);
        image[0x418..0x418 + pdb_name.len()].copy_from_slice(pdb_name.as_bytes());
        image
    }

    #[tokio::test]
    async fn test_read_debug_descriptor() {
        let memory = FakeMemory::new(0xfffff800_00000000, build_image("ntkrnlmp.pdb"));
        let mut stream = RemoteStream::new(&memory, 0xfffff800_00000000);

        let descriptor = read_debug_descriptor(&mut stream).await.unwrap().unwrap();
        assert_eq!(descriptor.pdb_name, "ntkrnlmp.pdb");
        assert_eq!(descriptor.guid, TEST_GUID);
        assert_eq!(descriptor.age, 2);
        assert_eq!(descriptor.symbol_key(), "123456789ABCDEF001020304050607082");
    }

    #[tokio::test]
    async fn test_rejects_non_images() {
        let memory = FakeMemory::new(0x1000, vec![0u8; 0x1000]);
        let mut stream = RemoteStream::new(&memory, 0x1000);
        assert!(matches!(
            read_debug_descriptor(&mut stream).await,
            Err(PeError::NotMz)
        ));

        let mut image = build_image("hal.pdb");
        image[0x80] = b'X';
        let memory = FakeMemory::new(0x1000, image);
        let mut stream = RemoteStream::new(&memory, 0x1000);
        assert!(matches!(
            read_debug_descriptor(&mut stream).await,
            Err(PeError::Parse(_))
        ));
    }

    #[tokio::test]
    async fn test_image_without_debug_directory() {
        let mut image = build_image("hal.pdb");
        put_u32(&mut image, 0x80 + 24 + 112 + 6 * 8, 0);
        let memory = FakeMemory::new(0x1000, image);
        let mut stream = RemoteStream::new(&memory, 0x1000);
        assert!(read_debug_descriptor(&mut stream).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_codeview_without_rsds() {
        let mut image = build_image("hal.pdb");
        image[0x400..0x404].copy_from_slice(b"NB10");
        let memory = FakeMemory::new(0x1000, image);
        let mut stream = RemoteStream::new(&memory, 0x1000);
        assert!(matches!(
            read_debug_descriptor(&mut stream).await,
            Err(PeError::Malformed(_))
        ));
    }

    #[tokio::test]
    async fn test_empty_pdb_name() {
        let memory = FakeMemory::new(0x1000, build_image(""));
        let mut stream = RemoteStream::new(&memory, 0x1000);
        assert!(matches!(
            read_debug_descriptor(&mut stream).await,
            Err(PeError::Malformed(_))
        ));
    }
}
