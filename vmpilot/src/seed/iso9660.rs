//! # Minimal ISO-9660 image writer and reader
//!
//! Produces a single-session image with one root directory holding regular
//! files, which is all a cloud-init seed needs. Rock Ridge extensions
//! (SUSP `SP`/`CE`/`ER`, RRIP `PX`/`NM`) are recorded so that guests mount
//! the files under their original lowercase names such as `user-data`
//! rather than the mangled ISO level 1 identifiers.
//!
//! Image layout, in 2048 byte logical sectors:
//!
//! | sector | content |
//! |---|---|
//! | 0-15 | system area, zeroed |
//! | 16 | primary volume descriptor |
//! | 17 | volume descriptor set terminator |
//! | 18 | type L path table |
//! | 19 | type M path table |
//! | 20.. | root directory |
//! | next | SUSP continuation area holding the `ER` entry |
//! | next.. | file data, one extent per file |
//!
//! The image is padded with zeros up to the requested capacity.
use std::path::Path;

use chrono::{DateTime, Datelike, Timelike, Utc};

pub const SECTOR_SIZE: usize = 2048;

const PVD_LBA: u32 = 16;
const TERMINATOR_LBA: u32 = 17;
const L_PATH_TABLE_LBA: u32 = 18;
const M_PATH_TABLE_LBA: u32 = 19;
const ROOT_DIR_LBA: u32 = 20;
const ROOT_RECORD_OFFSET: usize = 156;
const PATH_TABLE_SIZE: u32 = 10;

const FLAG_DIRECTORY: u8 = 0x02;
/// Keeps a file's directory record, Rock Ridge entries included, under 255 bytes
const MAX_NAME_LEN: usize = 128;

const DIR_MODE: u32 = 0o040555;
const FILE_MODE: u32 = 0o100444;

const RRIP_ID: &str = "RRIP_1991A";
const RRIP_DESCRIPTOR: &str =
    "THE ROCK RIDGE INTERCHANGE PROTOCOL PROVIDES SUPPORT FOR POSIX FILE SYSTEM SEMANTICS";
const RRIP_SOURCE: &str = "PLEASE CONTACT DISC PUBLISHER FOR SPECIFICATION SOURCE.  SEE PUBLISHER IDENTIFIER IN PRIMARY VOLUME DESCRIPTOR FOR CONTACT INFORMATION.";

#[derive(thiserror::Error, Debug)]
pub enum IsoError {
    #[error("image needs {required} bytes but capacity is {capacity} bytes")]
    CapacityExceeded { required: u64, capacity: u64 },
    #[error("a file named {0} already exists in the image")]
    DuplicateName(String),
    #[error("invalid file name {0:?}")]
    InvalidName(String),
    #[error("invalid volume identifier {0:?}, expected up to 32 characters among A-Z 0-9 _")]
    InvalidVolumeId(String),
    #[error("no file named {0} in the image")]
    NotFound(String),
    #[error("corrupt image: {0}")]
    Corrupt(String),
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

#[derive(Debug, Clone)]
struct IsoFile {
    name: String,
    identifier: Vec<u8>,
    data: Vec<u8>,
}

/// Position of every structure in the image, computed before anything is
/// written so that directory records can point at file extents.
#[derive(Debug)]
struct Layout {
    root_sectors: u32,
    continuation_lba: u32,
    extents: Vec<u32>,
    total_sectors: u32,
}

/// Accumulates files in memory and lays them out in [IsoWriter::finalize]
#[derive(Debug)]
pub struct IsoWriter {
    volume_id: String,
    capacity_sectors: u32,
    recorded_at: DateTime<Utc>,
    files: Vec<IsoFile>,
}

fn both_endian_u32(value: u32) -> [u8; 8] {
    let mut bytes = [0u8; 8];
    bytes[..4].copy_from_slice(&value.to_le_bytes());
    bytes[4..].copy_from_slice(&value.to_be_bytes());
    bytes
}

fn both_endian_u16(value: u16) -> [u8; 4] {
    let mut bytes = [0u8; 4];
    bytes[..2].copy_from_slice(&value.to_le_bytes());
    bytes[2..].copy_from_slice(&value.to_be_bytes());
    bytes
}

fn sectors_for(len: usize) -> u32 {
    len.div_ceil(SECTOR_SIZE) as u32
}

fn padded(text: &str, width: usize) -> Vec<u8> {
    let mut field = text.as_bytes().to_vec();
    field.resize(width, b' ');
    field
}

/// ISO level 1 identifier (`BASENAME.EXT;1`) for a file name
fn iso_identifier(name: &str) -> Vec<u8> {
    let (base, extension) = match name.rsplit_once('.') {
        Some((base, extension)) if !base.is_empty() => (base, extension),
        _ => (name, ""),
    };
    let mangle = |part: &str, limit: usize| -> String {
        part.chars()
            .map(|c| match c.to_ascii_uppercase() {
                c @ ('A'..='Z' | '0'..='9' | '_') => c,
                _ => '_',
            })
            .take(limit)
            .collect()
    };
    format!("{}.{};1", mangle(base, 8), mangle(extension, 3)).into_bytes()
}

fn rr_px(mode: u32, links: u32) -> Vec<u8> {
    let mut entry = vec![b'P', b'X', 36, 1];
    entry.extend_from_slice(&both_endian_u32(mode));
    entry.extend_from_slice(&both_endian_u32(links));
    entry.extend_from_slice(&both_endian_u32(0));
    entry.extend_from_slice(&both_endian_u32(0));
    entry
}

fn rr_nm(name: &str) -> Vec<u8> {
    let mut entry = vec![b'N', b'M', (5 + name.len()) as u8, 1, 0];
    entry.extend_from_slice(name.as_bytes());
    entry
}

fn susp_sp() -> Vec<u8> {
    vec![b'S', b'P', 7, 1, 0xBE, 0xEF, 0]
}

fn susp_ce(lba: u32, offset: u32, len: u32) -> Vec<u8> {
    let mut entry = vec![b'C', b'E', 28, 1];
    entry.extend_from_slice(&both_endian_u32(lba));
    entry.extend_from_slice(&both_endian_u32(offset));
    entry.extend_from_slice(&both_endian_u32(len));
    entry
}

fn susp_er() -> Vec<u8> {
    let len = 8 + RRIP_ID.len() + RRIP_DESCRIPTOR.len() + RRIP_SOURCE.len();
    let mut entry = vec![
        b'E',
        b'R',
        len as u8,
        1,
        RRIP_ID.len() as u8,
        RRIP_DESCRIPTOR.len() as u8,
        RRIP_SOURCE.len() as u8,
        1,
    ];
    entry.extend_from_slice(RRIP_ID.as_bytes());
    entry.extend_from_slice(RRIP_DESCRIPTOR.as_bytes());
    entry.extend_from_slice(RRIP_SOURCE.as_bytes());
    entry
}

impl IsoWriter {
    /// `capacity` is the size of the final image in bytes, rounded down to a
    /// whole number of sectors
    pub fn new(volume_id: &str, capacity: u64) -> Result<IsoWriter, IsoError> {
        let valid = !volume_id.is_empty()
            && volume_id.len() <= 32
            && volume_id
                .chars()
                .all(|c| c.is_ascii_uppercase() || c.is_ascii_digit() || c == '_');
        if !valid {
            return Err(IsoError::InvalidVolumeId(volume_id.to_string()));
        }
        let capacity_sectors = u32::try_from(capacity / SECTOR_SIZE as u64).unwrap_or(u32::MAX);
        Ok(IsoWriter {
            volume_id: volume_id.to_string(),
            capacity_sectors,
            recorded_at: Utc::now(),
            files: Vec::new(),
        })
    }

    /// Timestamp recorded on the volume and every directory record
    pub fn with_recorded_at(mut self, recorded_at: DateTime<Utc>) -> IsoWriter {
        self.recorded_at = recorded_at;
        self
    }

    fn capacity_bytes(&self) -> u64 {
        u64::from(self.capacity_sectors) * SECTOR_SIZE as u64
    }

    /// Queue a file in the root directory, fails if the image would no longer
    /// fit in its capacity
    pub fn add_file(&mut self, name: &str, data: Vec<u8>) -> Result<(), IsoError> {
        if name.is_empty() || name.len() > MAX_NAME_LEN || name.contains('/') || name.contains('\0') {
            return Err(IsoError::InvalidName(name.to_string()));
        }
        let identifier = iso_identifier(name);
        if self
            .files
            .iter()
            .any(|f| f.name == name || f.identifier == identifier)
        {
            return Err(IsoError::DuplicateName(name.to_string()));
        }

        self.files.push(IsoFile {
            name: name.to_string(),
            identifier,
            data,
        });
        self.files.sort_by(|a, b| a.identifier.cmp(&b.identifier));

        let layout = self.layout();
        if layout.total_sectors > self.capacity_sectors {
            self.files.retain(|f| f.name != name);
            return Err(IsoError::CapacityExceeded {
                required: u64::from(layout.total_sectors) * SECTOR_SIZE as u64,
                capacity: self.capacity_bytes(),
            });
        }
        Ok(())
    }

    fn date(&self) -> [u8; 7] {
        let t = &self.recorded_at;
        [
            (t.year() - 1900).clamp(0, 255) as u8,
            t.month() as u8,
            t.day() as u8,
            t.hour() as u8,
            t.minute() as u8,
            t.second().min(59) as u8,
            0,
        ]
    }

    fn volume_date(&self) -> Vec<u8> {
        let t = &self.recorded_at;
        let mut field = format!(
            "{:04}{:02}{:02}{:02}{:02}{:02}00",
            t.year().clamp(0, 9999),
            t.month(),
            t.day(),
            t.hour(),
            t.minute(),
            t.second().min(59)
        )
        .into_bytes();
        field.push(0);
        field
    }

    fn directory_record(
        &self,
        extent: u32,
        size: u32,
        flags: u8,
        identifier: &[u8],
        system_use: &[u8],
    ) -> Vec<u8> {
        let mut record = vec![0u8; 33];
        record[2..10].copy_from_slice(&both_endian_u32(extent));
        record[10..18].copy_from_slice(&both_endian_u32(size));
        record[18..25].copy_from_slice(&self.date());
        record[25] = flags;
        record[28..32].copy_from_slice(&both_endian_u16(1));
        record[32] = identifier.len() as u8;
        record.extend_from_slice(identifier);
        if identifier.len() % 2 == 0 {
            record.push(0);
        }
        record.extend_from_slice(system_use);
        if record.len() % 2 == 1 {
            record.push(0);
        }
        record[0] = record.len() as u8;
        record
    }

    /// Records of the root directory in on-disk order, `.` and `..` first
    fn root_records(&self, layout: &Layout) -> Vec<Vec<u8>> {
        let root_size = layout.root_sectors * SECTOR_SIZE as u32;
        let mut dot_system_use = susp_sp();
        dot_system_use.extend(susp_ce(layout.continuation_lba, 0, susp_er().len() as u32));
        dot_system_use.extend(rr_px(DIR_MODE, 2));

        let mut records = vec![
            self.directory_record(ROOT_DIR_LBA, root_size, FLAG_DIRECTORY, &[0], &dot_system_use),
            self.directory_record(
                ROOT_DIR_LBA,
                root_size,
                FLAG_DIRECTORY,
                &[1],
                &rr_px(DIR_MODE, 2),
            ),
        ];
        for (file, extent) in self.files.iter().zip(&layout.extents) {
            let mut system_use = rr_px(FILE_MODE, 1);
            system_use.extend(rr_nm(&file.name));
            records.push(self.directory_record(
                *extent,
                file.data.len() as u32,
                0,
                &file.identifier,
                &system_use,
            ));
        }
        records
    }

    /// Directory records may not straddle a sector boundary, returns the
    /// offset of each record inside the directory extent
    fn pack_records(records: &[Vec<u8>]) -> (Vec<usize>, u32) {
        let mut offsets = Vec::with_capacity(records.len());
        let mut offset = 0usize;
        for record in records {
            let used = offset % SECTOR_SIZE;
            if used + record.len() > SECTOR_SIZE {
                offset += SECTOR_SIZE - used;
            }
            offsets.push(offset);
            offset += record.len();
        }
        (offsets, sectors_for(offset).max(1))
    }

    fn layout(&self) -> Layout {
        // Record lengths don't depend on extent values, so a first pass with
        // placeholder positions is enough to size the root directory.
        let draft = Layout {
            root_sectors: 1,
            continuation_lba: 0,
            extents: vec![0; self.files.len()],
            total_sectors: 0,
        };
        let (_, root_sectors) = Self::pack_records(&self.root_records(&draft));

        let continuation_lba = ROOT_DIR_LBA + root_sectors;
        let mut next_lba = continuation_lba + 1;
        let mut extents = Vec::with_capacity(self.files.len());
        for file in &self.files {
            extents.push(next_lba);
            next_lba += sectors_for(file.data.len());
        }

        Layout {
            root_sectors,
            continuation_lba,
            extents,
            total_sectors: next_lba,
        }
    }

    fn primary_volume_descriptor(&self, layout: &Layout) -> Vec<u8> {
        let mut pvd = vec![0u8; SECTOR_SIZE];
        pvd[0] = 1;
        pvd[1..6].copy_from_slice(b"CD001");
        pvd[6] = 1;
        pvd[8..40].copy_from_slice(&padded("LINUX", 32));
        pvd[40..72].copy_from_slice(&padded(&self.volume_id, 32));
        pvd[80..88].copy_from_slice(&both_endian_u32(self.capacity_sectors));
        pvd[120..124].copy_from_slice(&both_endian_u16(1));
        pvd[124..128].copy_from_slice(&both_endian_u16(1));
        pvd[128..132].copy_from_slice(&both_endian_u16(SECTOR_SIZE as u16));
        pvd[132..140].copy_from_slice(&both_endian_u32(PATH_TABLE_SIZE));
        pvd[140..144].copy_from_slice(&L_PATH_TABLE_LBA.to_le_bytes());
        pvd[148..152].copy_from_slice(&M_PATH_TABLE_LBA.to_be_bytes());

        let root = self.directory_record(
            ROOT_DIR_LBA,
            layout.root_sectors * SECTOR_SIZE as u32,
            FLAG_DIRECTORY,
            &[0],
            &[],
        );
        pvd[ROOT_RECORD_OFFSET..ROOT_RECORD_OFFSET + root.len()].copy_from_slice(&root);

        pvd[190..318].copy_from_slice(&padded("", 128));
        pvd[318..446].copy_from_slice(&padded("", 128));
        pvd[446..574].copy_from_slice(&padded("VMPILOT", 128));
        pvd[574..702].copy_from_slice(&padded("VMPILOT", 128));
        pvd[702..739].copy_from_slice(&padded("", 37));
        pvd[739..776].copy_from_slice(&padded("", 37));
        pvd[776..813].copy_from_slice(&padded("", 37));

        let created = self.volume_date();
        pvd[813..830].copy_from_slice(&created);
        pvd[830..847].copy_from_slice(&created);
        let mut unset = b"0000000000000000".to_vec();
        unset.push(0);
        pvd[847..864].copy_from_slice(&unset);
        pvd[864..881].copy_from_slice(&unset);
        pvd[881] = 1;
        pvd
    }

    fn path_table(big_endian: bool) -> Vec<u8> {
        let mut table = vec![1u8, 0];
        if big_endian {
            table.extend_from_slice(&ROOT_DIR_LBA.to_be_bytes());
            table.extend_from_slice(&1u16.to_be_bytes());
        } else {
            table.extend_from_slice(&ROOT_DIR_LBA.to_le_bytes());
            table.extend_from_slice(&1u16.to_le_bytes());
        }
        table.extend_from_slice(&[0, 0]);
        table
    }

    /// Lay every structure out and return the complete image
    pub fn finalize(self) -> Result<Vec<u8>, IsoError> {
        let layout = self.layout();
        if layout.total_sectors > self.capacity_sectors {
            return Err(IsoError::CapacityExceeded {
                required: u64::from(layout.total_sectors) * SECTOR_SIZE as u64,
                capacity: self.capacity_bytes(),
            });
        }

        let mut image = vec![0u8; self.capacity_bytes() as usize];
        let sector = |lba: u32| lba as usize * SECTOR_SIZE;

        image[sector(PVD_LBA)..sector(PVD_LBA + 1)]
            .copy_from_slice(&self.primary_volume_descriptor(&layout));

        let terminator = sector(TERMINATOR_LBA);
        image[terminator] = 255;
        image[terminator + 1..terminator + 6].copy_from_slice(b"CD001");
        image[terminator + 6] = 1;

        let l_table = Self::path_table(false);
        image[sector(L_PATH_TABLE_LBA)..sector(L_PATH_TABLE_LBA) + l_table.len()]
            .copy_from_slice(&l_table);
        let m_table = Self::path_table(true);
        image[sector(M_PATH_TABLE_LBA)..sector(M_PATH_TABLE_LBA) + m_table.len()]
            .copy_from_slice(&m_table);

        let records = self.root_records(&layout);
        let (offsets, _) = Self::pack_records(&records);
        let root = sector(ROOT_DIR_LBA);
        for (record, offset) in records.iter().zip(offsets) {
            image[root + offset..root + offset + record.len()].copy_from_slice(record);
        }

        let er = susp_er();
        let continuation = sector(layout.continuation_lba);
        image[continuation..continuation + er.len()].copy_from_slice(&er);

        for (file, extent) in self.files.iter().zip(&layout.extents) {
            let start = sector(*extent);
            image[start..start + file.data.len()].copy_from_slice(&file.data);
        }

        Ok(image)
    }
}

/// One file found in the root directory of an image
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IsoEntry {
    /// Rock Ridge name when present, ISO identifier otherwise
    pub name: String,
    extent: u32,
    size: u32,
}

/// Read-only view over an image, only the root directory is inspected
#[derive(Debug)]
pub struct IsoImage {
    data: Vec<u8>,
}

fn read_u32_le(data: &[u8], offset: usize) -> Result<u32, IsoError> {
    data.get(offset..offset + 4)
        .map(|b| u32::from_le_bytes([b[0], b[1], b[2], b[3]]))
        .ok_or_else(|| IsoError::Corrupt(format!("truncated field at offset {}", offset)))
}

/// Name carried by an `NM` entry in a system use area, if any
fn rock_ridge_name(system_use: &[u8]) -> Option<String> {
    let mut pos = 0;
    while pos + 4 <= system_use.len() {
        let len = system_use[pos + 2] as usize;
        if len < 4 || pos + len > system_use.len() {
            break;
        }
        if &system_use[pos..pos + 2] == b"NM" && len >= 5 {
            return Some(String::from_utf8_lossy(&system_use[pos + 5..pos + len]).into_owned());
        }
        pos += len;
    }
    None
}

impl IsoImage {
    pub fn open<P: AsRef<Path>>(path: P) -> Result<IsoImage, IsoError> {
        IsoImage::from_bytes(std::fs::read(path)?)
    }

    pub fn from_bytes(data: Vec<u8>) -> Result<IsoImage, IsoError> {
        let pvd = PVD_LBA as usize * SECTOR_SIZE;
        if data.len() < pvd + SECTOR_SIZE || data[pvd] != 1 || &data[pvd + 1..pvd + 6] != b"CD001"
        {
            return Err(IsoError::Corrupt(
                "missing primary volume descriptor".to_string(),
            ));
        }
        Ok(IsoImage { data })
    }

    fn pvd(&self) -> &[u8] {
        let start = PVD_LBA as usize * SECTOR_SIZE;
        &self.data[start..start + SECTOR_SIZE]
    }

    pub fn volume_id(&self) -> String {
        String::from_utf8_lossy(&self.pvd()[40..72])
            .trim_end()
            .to_string()
    }

    /// Size of the volume in bytes as recorded in the descriptor
    pub fn volume_size(&self) -> Result<u64, IsoError> {
        let sectors = read_u32_le(self.pvd(), 80)?;
        Ok(u64::from(sectors) * SECTOR_SIZE as u64)
    }

    fn root_extent(&self) -> Result<&[u8], IsoError> {
        let root = &self.pvd()[ROOT_RECORD_OFFSET..];
        let lba = read_u32_le(root, 2)? as usize;
        let size = read_u32_le(root, 10)? as usize;
        let start = lba * SECTOR_SIZE;
        self.data
            .get(start..start + size)
            .ok_or_else(|| IsoError::Corrupt("root directory out of bounds".to_string()))
    }

    /// Walk the root directory, yielding (identifier, system use, extent, size)
    fn records(&self) -> Result<Vec<(Vec<u8>, Vec<u8>, u32, u32)>, IsoError> {
        let dir = self.root_extent()?;
        let mut records = Vec::new();
        let mut pos = 0;
        while pos < dir.len() {
            let len = dir[pos] as usize;
            if len == 0 {
                pos = (pos / SECTOR_SIZE + 1) * SECTOR_SIZE;
                continue;
            }
            let record = dir
                .get(pos..pos + len)
                .ok_or_else(|| IsoError::Corrupt("directory record out of bounds".to_string()))?;
            if len < 34 {
                return Err(IsoError::Corrupt("directory record too short".to_string()));
            }
            let id_len = record[32] as usize;
            let id_end = 33 + id_len;
            if id_end > len {
                return Err(IsoError::Corrupt("identifier out of bounds".to_string()));
            }
            let su_start = (id_end + (id_len + 1) % 2).min(len);
            records.push((
                record[33..id_end].to_vec(),
                record[su_start..].to_vec(),
                read_u32_le(record, 2)?,
                read_u32_le(record, 10)?,
            ));
            pos += len;
        }
        Ok(records)
    }

    /// Whether the root directory starts with a SUSP `SP` indicator
    pub fn has_rock_ridge(&self) -> bool {
        match self.records() {
            Ok(records) => records
                .first()
                .map(|(_, system_use, _, _)| system_use.starts_with(&[b'S', b'P', 7, 1, 0xBE, 0xEF]))
                .unwrap_or(false),
            Err(_) => false,
        }
    }

    pub fn entries(&self) -> Result<Vec<IsoEntry>, IsoError> {
        Ok(self
            .records()?
            .into_iter()
            .filter(|(identifier, _, _, _)| identifier.as_slice() != [0] && identifier.as_slice() != [1])
            .map(|(identifier, system_use, extent, size)| {
                let name = rock_ridge_name(&system_use).unwrap_or_else(|| {
                    let raw = String::from_utf8_lossy(&identifier).into_owned();
                    let raw = raw.split(';').next().unwrap_or_default();
                    raw.trim_end_matches('.').to_string()
                });
                IsoEntry { name, extent, size }
            })
            .collect())
    }

    pub fn read_file(&self, name: &str) -> Result<Vec<u8>, IsoError> {
        let entry = self
            .entries()?
            .into_iter()
            .find(|e| e.name == name)
            .ok_or_else(|| IsoError::NotFound(name.to_string()))?;
        let start = entry.extent as usize * SECTOR_SIZE;
        self.data
            .get(start..start + entry.size as usize)
            .map(|b| b.to_vec())
            .ok_or_else(|| IsoError::Corrupt(format!("extent of {} out of bounds", name)))
    }
}
