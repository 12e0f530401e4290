use std::fs::{remove_file, File};
use std::io::{Read, Seek, SeekFrom, Write};
use std::sync::{Arc, Mutex};

use log::info;

#[derive(Debug, PartialEq)]
pub enum SwapFileError {
    OverCapacity,
    IncorrectPageSize,
    ShortRead,
    ShortWrite,
}

/// The swap area: a single backing file of exactly `slot_count * PAGE_SIZE`
/// bytes, slot `i` occupying the byte range `[i * PAGE_SIZE, (i+1) * PAGE_SIZE)`.
/// Which slot belongs to which page is the kernel's bookkeeping, not ours.
#[derive(Debug, Clone)]
pub struct SwapFile<const PAGE_SIZE: usize, const CAPACITY: usize> {
    file_name: String,
    file: Arc<Mutex<File>>,
}

pub fn make_name(name: &str) -> String {
    let name = name.replace('-', "_");
    let mut file_name = String::from("SWAP_FILE_");
    file_name.push_str(&name);
    file_name
}

impl<const PAGE_SIZE: usize, const CAPACITY: usize> SwapFile<PAGE_SIZE, CAPACITY> {
    pub fn create(name: &str) -> Result<Self, std::io::Error> {
        assert_eq!(
            CAPACITY % PAGE_SIZE,
            0,
            "Capacity must be a multiple of PageSize"
        );
        let file = File::options()
            .truncate(true)
            .write(true)
            .read(true)
            .create(true)
            .open(make_name(name))?;
        file.set_len(CAPACITY as u64)?;
        Ok(Self {
            file_name: String::from(name),
            file: Arc::new(Mutex::new(file)),
        })
    }

    pub const fn slot_count() -> usize {
        CAPACITY / PAGE_SIZE
    }

    pub fn name(&self) -> &str {
        &self.file_name
    }

    /// Remove the backing file; called when the kernel shuts down.
    pub fn delete(name: &str) -> Result<(), std::io::Error> {
        remove_file(make_name(name))
    }

    pub fn read_slot(&self, slot: usize) -> Result<Box<[u8; PAGE_SIZE]>, SwapFileError> {
        if slot >= Self::slot_count() {
            return Err(SwapFileError::OverCapacity);
        }
        let mut file = self.file.lock().unwrap();
        info!("Start reading slot[{}]", slot);
        file.seek(SeekFrom::Start((slot * PAGE_SIZE) as u64))
            .map_err(|_| SwapFileError::ShortRead)?;
        let mut page = Box::new([0; PAGE_SIZE]);
        file.read_exact(&mut *page)
            .map_err(|_| SwapFileError::ShortRead)?;
        info!("Done reading slot[{}]", slot);
        Ok(page)
    }

    pub fn write_slot(&self, slot: usize, page: &[u8]) -> Result<(), SwapFileError> {
        if page.len() != PAGE_SIZE {
            return Err(SwapFileError::IncorrectPageSize);
        }
        if slot >= Self::slot_count() {
            return Err(SwapFileError::OverCapacity);
        }
        let mut file = self.file.lock().unwrap();
        info!("Start writing slot[{}]", slot);
        file.seek(SeekFrom::Start((slot * PAGE_SIZE) as u64))
            .map_err(|_| SwapFileError::ShortWrite)?;
        file.write_all(page).map_err(|_| SwapFileError::ShortWrite)?;
        info!("Done writing slot[{}]", slot);
        Ok(())
    }
}
