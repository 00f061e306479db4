//! Minimal FAT12 image builder with VFAT long filenames.
//!
//! Produces the 1 MiB cloud-init "NoCloud" seed disk: volume label
//! CIDATA, a handful of files in the root directory, nothing else. Output
//! is fully deterministic for a given input set: files are laid out in
//! sorted name order, timestamps are fixed, and the volume id is derived
//! from the content digest, so rebuilding a seed never dirties a VM.

use std::collections::BTreeMap;

use anyhow::{bail, Result};
use sha2::{Digest as _, Sha256};

const SECTOR_SIZE: usize = 512;
const TOTAL_SECTORS: usize = 2048; // 1 MiB
const RESERVED_SECTORS: usize = 1;
const NUM_FATS: usize = 2;
const SECTORS_PER_FAT: usize = 6;
const ROOT_ENTRY_COUNT: usize = 128;
const DIR_ENTRY_SIZE: usize = 32;
const ROOT_DIR_SECTORS: usize = ROOT_ENTRY_COUNT * DIR_ENTRY_SIZE / SECTOR_SIZE; // 8
const FIRST_DATA_SECTOR: usize = RESERVED_SECTORS + NUM_FATS * SECTORS_PER_FAT + ROOT_DIR_SECTORS; // 21
const FAT_ENTRY_EOC: u16 = 0xFFF;
const MEDIA_DESCRIPTOR: u8 = 0xF8;

/// FAT date/time for 2000-01-01 00:00:00, used for every entry.
const FIXED_DATE: u16 = ((2000 - 1980) << 9) | (1 << 5) | 1;
const FIXED_TIME: u16 = 0;

/// Builds the complete FAT12 image. `files` maps filename to content;
/// the BTreeMap keeps layout order deterministic.
pub fn build_fat12(label: &str, files: &BTreeMap<String, Vec<u8>>) -> Result<Vec<u8>> {
    let mut b = Fat12Builder::new(label, files);
    for (name, content) in files {
        b.add_file(name, content)?;
    }
    Ok(b.finish())
}

struct Fat12Builder {
    volume_id: u32,
    label: [u8; 11],
    fat: Vec<u8>,
    root_dir: Vec<u8>,
    data: Vec<u8>,
    next_cluster: u16,
    root_used: usize,
    short_seq: u32,
}

impl Fat12Builder {
    fn new(label: &str, files: &BTreeMap<String, Vec<u8>>) -> Self {
        // Volume id from the content digest keeps the image reproducible.
        let mut hasher = Sha256::new();
        for (name, content) in files {
            hasher.update(name.as_bytes());
            hasher.update([0]);
            hasher.update(content);
        }
        let digest = hasher.finalize();
        let volume_id = u32::from_le_bytes([digest[0], digest[1], digest[2], digest[3]]);

        let mut b = Self {
            volume_id,
            label: pad_label(label),
            fat: vec![0u8; SECTORS_PER_FAT * SECTOR_SIZE],
            root_dir: vec![0u8; ROOT_ENTRY_COUNT * DIR_ENTRY_SIZE],
            data: Vec::new(),
            next_cluster: 2,
            root_used: 0,
            short_seq: 0,
        };
        set_fat_entry(&mut b.fat, 0, 0xF00 | MEDIA_DESCRIPTOR as u16);
        set_fat_entry(&mut b.fat, 1, FAT_ENTRY_EOC);
        b.add_volume_label();
        b
    }

    fn add_volume_label(&mut self) {
        let off = self.root_used * DIR_ENTRY_SIZE;
        self.root_dir[off..off + 11].copy_from_slice(&self.label);
        self.root_dir[off + 11] = 0x08; // volume label attribute
        put_timestamps(&mut self.root_dir[off..off + DIR_ENTRY_SIZE]);
        self.root_used += 1;
    }

    fn add_file(&mut self, name: &str, content: &[u8]) -> Result<()> {
        let num_clusters = content.len().div_ceil(SECTOR_SIZE);

        let mut start_cluster = 0u16;
        if num_clusters > 0 {
            let available = (TOTAL_SECTORS - FIRST_DATA_SECTOR) + 2;
            if self.next_cluster as usize + num_clusters > available {
                bail!("fat12: not enough space for {name}");
            }
            start_cluster = self.next_cluster;
            for i in 0..num_clusters {
                let c = self.next_cluster as usize + i;
                if i == num_clusters - 1 {
                    set_fat_entry(&mut self.fat, c, FAT_ENTRY_EOC);
                } else {
                    set_fat_entry(&mut self.fat, c, (c + 1) as u16);
                }
            }
            // File data, padded to whole sectors.
            self.data.extend_from_slice(content);
            let pad = num_clusters * SECTOR_SIZE - content.len();
            self.data.extend(std::iter::repeat(0u8).take(pad));
            self.next_cluster += num_clusters as u16;
        }

        let short_name = if needs_lfn(name) {
            self.short_seq += 1;
            let short = generate_short_name(name, self.short_seq);
            for entry in make_lfn_entries(name, &short) {
                if self.root_used >= ROOT_ENTRY_COUNT {
                    bail!("fat12: root directory full");
                }
                let off = self.root_used * DIR_ENTRY_SIZE;
                self.root_dir[off..off + DIR_ENTRY_SIZE].copy_from_slice(&entry);
                self.root_used += 1;
            }
            short
        } else {
            to_short_name(name)
        };

        if self.root_used >= ROOT_ENTRY_COUNT {
            bail!("fat12: root directory full");
        }
        let off = self.root_used * DIR_ENTRY_SIZE;
        self.root_dir[off..off + 11].copy_from_slice(&short_name);
        self.root_dir[off + 11] = 0x20; // archive
        put_timestamps(&mut self.root_dir[off..off + DIR_ENTRY_SIZE]);
        self.root_dir[off + 26..off + 28].copy_from_slice(&start_cluster.to_le_bytes());
        self.root_dir[off + 28..off + 32].copy_from_slice(&(content.len() as u32).to_le_bytes());
        self.root_used += 1;
        Ok(())
    }

    /// Lays out boot sector, both FAT copies, root directory, file data,
    /// and zero padding to the full 1 MiB.
    fn finish(self) -> Vec<u8> {
        let mut image = Vec::with_capacity(TOTAL_SECTORS * SECTOR_SIZE);
        image.extend_from_slice(&self.boot_sector());
        for _ in 0..NUM_FATS {
            image.extend_from_slice(&self.fat);
        }
        image.extend_from_slice(&self.root_dir);
        image.extend_from_slice(&self.data);
        image.resize(TOTAL_SECTORS * SECTOR_SIZE, 0);
        image
    }

    fn boot_sector(&self) -> [u8; SECTOR_SIZE] {
        let mut boot = [0u8; SECTOR_SIZE];
        // x86 jump + NOP.
        boot[0] = 0xEB;
        boot[1] = 0x3C;
        boot[2] = 0x90;
        boot[3..11].copy_from_slice(b"COCOON  ");
        boot[11..13].copy_from_slice(&(SECTOR_SIZE as u16).to_le_bytes());
        boot[13] = 1; // sectors per cluster
        boot[14..16].copy_from_slice(&(RESERVED_SECTORS as u16).to_le_bytes());
        boot[16] = NUM_FATS as u8;
        boot[17..19].copy_from_slice(&(ROOT_ENTRY_COUNT as u16).to_le_bytes());
        boot[19..21].copy_from_slice(&(TOTAL_SECTORS as u16).to_le_bytes());
        boot[21] = MEDIA_DESCRIPTOR;
        boot[22..24].copy_from_slice(&(SECTORS_PER_FAT as u16).to_le_bytes());
        boot[24..26].copy_from_slice(&32u16.to_le_bytes()); // sectors per track
        boot[26..28].copy_from_slice(&64u16.to_le_bytes()); // heads
        boot[36] = 0x80; // drive number
        boot[38] = 0x29; // extended boot signature
        boot[39..43].copy_from_slice(&self.volume_id.to_le_bytes());
        boot[43..54].copy_from_slice(&self.label);
        boot[54..62].copy_from_slice(b"FAT12   ");
        boot[510] = 0x55;
        boot[511] = 0xAA;
        boot
    }
}

/// Writes a 12-bit value into the packed FAT at the given cluster index.
fn set_fat_entry(fat: &mut [u8], cluster: usize, val: u16) {
    let off = cluster + cluster / 2;
    if off + 1 >= fat.len() {
        return;
    }
    let mut word = u16::from_le_bytes([fat[off], fat[off + 1]]);
    if cluster % 2 == 0 {
        word = (word & 0xF000) | (val & 0x0FFF);
    } else {
        word = (word & 0x000F) | ((val & 0x0FFF) << 4);
    }
    fat[off..off + 2].copy_from_slice(&word.to_le_bytes());
}

/// True when the name does not fit plain uppercase 8.3.
fn needs_lfn(name: &str) -> bool {
    let upper = name.to_ascii_uppercase();
    let (base, ext) = match upper.rsplit_once('.') {
        Some((b, e)) => (b, e),
        None => (upper.as_str(), ""),
    };
    base.len() > 8
        || ext.len() > 3
        || name != upper
        || name.matches('.').count() > 1
}

fn pad_label(label: &str) -> [u8; 11] {
    let mut out = [b' '; 11];
    for (i, b) in label.to_ascii_uppercase().bytes().take(11).enumerate() {
        out[i] = b;
    }
    out
}

fn to_short_name(name: &str) -> [u8; 11] {
    let mut out = [b' '; 11];
    let upper = name.to_ascii_uppercase();
    let (base, ext) = match upper.rsplit_once('.') {
        Some((b, e)) => (b, e),
        None => (upper.as_str(), ""),
    };
    for (i, b) in base.bytes().take(8).enumerate() {
        out[i] = b;
    }
    for (i, b) in ext.bytes().take(3).enumerate() {
        out[8 + i] = b;
    }
    out
}

/// 8.3 name with a numeric tail, e.g. `META-D~1   `, the short alias
/// behind an LFN chain.
fn generate_short_name(name: &str, seq: u32) -> [u8; 11] {
    let mut out = [b' '; 11];
    let upper = name.to_ascii_uppercase();
    let (base, ext) = match upper.rsplit_once('.') {
        Some((b, e)) => (b.replace('.', ""), e.to_string()),
        None => (upper.clone(), String::new()),
    };

    let tail = format!("~{seq}");
    let max_base = 8 - tail.len();
    let mut short_base: String = base.chars().take(max_base).collect();
    short_base.push_str(&tail);
    for (i, b) in short_base.bytes().take(8).enumerate() {
        out[i] = b;
    }
    for (i, b) in ext.bytes().take(3).enumerate() {
        out[8 + i] = b;
    }
    out
}

/// VFAT long-filename entries in on-disk order: highest sequence number
/// first, immediately before the short-name entry.
fn make_lfn_entries(name: &str, short_name: &[u8; 11]) -> Vec<[u8; DIR_ENTRY_SIZE]> {
    let units: Vec<u16> = name.encode_utf16().collect();
    let chksum = lfn_checksum(short_name);
    let num_entries = (units.len() + 12) / 13;

    let mut entries = Vec::with_capacity(num_entries);
    for i in 0..num_entries {
        let mut entry = [0u8; DIR_ENTRY_SIZE];
        let mut seq = (i + 1) as u8;
        if i == num_entries - 1 {
            seq |= 0x40; // last-in-chain marker
        }
        entry[0] = seq;
        entry[11] = 0x0F; // LFN attribute
        entry[13] = chksum;

        let base = i * 13;
        put_lfn_chars(&mut entry[1..11], &units, base, 5);
        put_lfn_chars(&mut entry[14..26], &units, base + 5, 6);
        put_lfn_chars(&mut entry[28..32], &units, base + 11, 2);
        entries.push(entry);
    }
    entries.reverse();
    entries
}

/// UCS-2 slots: characters, then one null terminator, then 0xFFFF fill.
fn put_lfn_chars(dst: &mut [u8], units: &[u16], offset: usize, count: usize) {
    for j in 0..count {
        let idx = offset + j;
        let pos = j * 2;
        match idx.cmp(&units.len()) {
            std::cmp::Ordering::Less => {
                dst[pos..pos + 2].copy_from_slice(&units[idx].to_le_bytes());
            }
            std::cmp::Ordering::Equal => {} // null terminator
            std::cmp::Ordering::Greater => {
                dst[pos..pos + 2].copy_from_slice(&0xFFFFu16.to_le_bytes());
            }
        }
    }
}

fn lfn_checksum(short_name: &[u8; 11]) -> u8 {
    short_name
        .iter()
        .fold(0u8, |sum, &b| sum.rotate_right(1).wrapping_add(b))
}

fn put_timestamps(entry: &mut [u8]) {
    entry[14..16].copy_from_slice(&FIXED_TIME.to_le_bytes());
    entry[16..18].copy_from_slice(&FIXED_DATE.to_le_bytes());
    entry[18..20].copy_from_slice(&FIXED_DATE.to_le_bytes()); // last access
    entry[22..24].copy_from_slice(&FIXED_TIME.to_le_bytes());
    entry[24..26].copy_from_slice(&FIXED_DATE.to_le_bytes());
}

#[cfg(test)]
mod tests {
    use super::*;

    fn cidata_files() -> BTreeMap<String, Vec<u8>> {
        let mut files = BTreeMap::new();
        files.insert("meta-data".to_string(), b"instance-id: vm1\n".to_vec());
        files.insert("user-data".to_string(), b"#cloud-config\n".to_vec());
        files.insert("network-config".to_string(), b"version: 2\n".to_vec());
        files
    }

    #[test]
    fn image_is_one_mib_with_boot_signature() {
        let image = build_fat12("CIDATA", &cidata_files()).unwrap();
        assert_eq!(image.len(), 1 << 20);
        assert_eq!(image[510], 0x55);
        assert_eq!(image[511], 0xAA);
        assert_eq!(&image[54..62], b"FAT12   ");
        assert_eq!(&image[43..49], b"CIDATA");
        assert_eq!(&image[3..11], b"COCOON  ");
    }

    #[test]
    fn deterministic_for_same_input() {
        let a = build_fat12("CIDATA", &cidata_files()).unwrap();
        let b = build_fat12("CIDATA", &cidata_files()).unwrap();
        assert_eq!(a, b);

        let mut changed = cidata_files();
        changed.insert("user-data".to_string(), b"#cloud-config\nx: 1\n".to_vec());
        let c = build_fat12("CIDATA", &changed).unwrap();
        assert_ne!(a, c);
    }

    #[test]
    fn file_contents_land_in_data_area() {
        let image = build_fat12("CIDATA", &cidata_files()).unwrap();
        let data_start = FIRST_DATA_SECTOR * SECTOR_SIZE;
        // BTreeMap order: meta-data, network-config, user-data.
        assert_eq!(
            &image[data_start..data_start + 17],
            b"instance-id: vm1\n"
        );
        let second = data_start + SECTOR_SIZE;
        assert_eq!(&image[second..second + 11], b"version: 2\n");
    }

    #[test]
    fn lfn_entries_present_for_lowercase_names() {
        let image = build_fat12("CIDATA", &cidata_files()).unwrap();
        // Root dir starts after reserved + FATs; first entry is the
        // volume label, then an LFN chain for "meta-data".
        let root_start = (RESERVED_SECTORS + NUM_FATS * SECTORS_PER_FAT) * SECTOR_SIZE;
        assert_eq!(image[root_start + 11], 0x08, "volume label first");
        let second = root_start + DIR_ENTRY_SIZE;
        assert_eq!(image[second + 11], 0x0F, "LFN entry follows");
        assert_eq!(image[second] & 0x40, 0x40, "chain starts with last marker");
    }

    #[test]
    fn short_name_mechanics() {
        assert!(!needs_lfn("README.TXT"));
        assert!(needs_lfn("meta-data")); // lowercase
        assert!(needs_lfn("NETWORK-CONFIG")); // base > 8
        assert!(needs_lfn("A.B.C")); // two dots

        assert_eq!(&to_short_name("README.TXT"), b"README  TXT");
        let short = generate_short_name("network-config", 1);
        assert_eq!(&short[..8], b"NETWOR~1");
    }

    #[test]
    fn too_much_data_is_rejected() {
        let mut files = BTreeMap::new();
        files.insert("big".to_string(), vec![0u8; 2 << 20]);
        assert!(build_fat12("CIDATA", &files).is_err());
    }
}
