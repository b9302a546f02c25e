//! Registered memory areas and the item level read and write rules.
use std::{
    collections::HashMap,
    sync::{Arc, Mutex, MutexGuard, RwLock},
};

use s7_protocol::{
    pdu::{ITEM_ADDRESS_OUT_OF_RANGE, ITEM_NOT_AVAILABLE, ITEM_TYPE_INCONSISTENT},
    types::{AddressSpec, Area, WordLen},
};

use crate::error::ServerError;

/// One registered buffer, guarded by its own lock.
#[derive(Debug)]
pub struct MemoryArea {
    data: Mutex<Vec<u8>>,
}

impl MemoryArea {
    fn new(data: Vec<u8>) -> MemoryArea {
        MemoryArea {
            data: Mutex::new(data),
        }
    }

    fn lock(&self) -> MutexGuard<'_, Vec<u8>> {
        // A panicking handler never leaves a buffer half updated, so the data stays usable.
        self.data.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn with<R>(&self, f: impl FnOnce(&[u8]) -> R) -> R {
        f(&self.lock())
    }

    pub fn with_mut<R>(&self, f: impl FnOnce(&mut [u8]) -> R) -> R {
        f(&mut self.lock())
    }
}

/// Areas keyed by `(area, index)`. Only data blocks have more than one instance;
/// the index of every other area is ignored.
#[derive(Debug, Default)]
pub struct AreaTable {
    areas: RwLock<HashMap<(Area, u16), Arc<MemoryArea>>>,
}

fn key(area: Area, index: u16) -> (Area, u16) {
    match area {
        Area::DB => (area, index),
        Area::PE | Area::PA | Area::MK | Area::CT | Area::TM => (area, 0),
    }
}

impl AreaTable {
    pub fn register(&self, area: Area, index: u16, data: Vec<u8>) -> Result<(), ServerError> {
        let mut areas = self.areas.write().unwrap_or_else(|p| p.into_inner());
        let key = key(area, index);
        if areas.contains_key(&key) {
            return Err(ServerError::AreaAlreadyExists { area, index });
        }
        log::debug!("Registered {}{} with {} bytes", area, key.1, data.len());
        areas.insert(key, Arc::new(MemoryArea::new(data)));
        Ok(())
    }

    /// Removes an area and hands back its final contents.
    pub fn unregister(&self, area: Area, index: u16) -> Result<Vec<u8>, ServerError> {
        let removed = self
            .areas
            .write()
            .unwrap_or_else(|p| p.into_inner())
            .remove(&key(area, index))
            .ok_or(ServerError::UnknownArea { area, index })?;
        Ok(removed.with(|data| data.to_vec()))
    }

    pub fn get(&self, area: Area, index: u16) -> Option<Arc<MemoryArea>> {
        self.areas
            .read()
            .unwrap_or_else(|p| p.into_inner())
            .get(&key(area, index))
            .cloned()
    }

    /// Numbers of all registered data blocks, ascending.
    pub fn db_numbers(&self) -> Vec<u16> {
        let mut numbers: Vec<u16> = self
            .areas
            .read()
            .unwrap_or_else(|p| p.into_inner())
            .keys()
            .filter(|(area, _)| *area == Area::DB)
            .map(|(_, index)| *index)
            .collect();
        numbers.sort_unstable();
        numbers
    }

    /// Serves one read item; errors are item return codes.
    pub fn read_item(&self, spec: &AddressSpec) -> Result<Vec<u8>, u8> {
        let area = self
            .get(spec.area, spec.db_number)
            .ok_or(ITEM_NOT_AVAILABLE)?;
        area.with(|data| {
            if spec.word_len == WordLen::Bit {
                let (byte, bit) = (spec.start as usize / 8, spec.start % 8);
                return match data.get(byte) {
                    Some(value) => Ok(vec![(value >> bit) & 0x01]),
                    None => Err(ITEM_ADDRESS_OUT_OF_RANGE),
                };
            }
            let offset = byte_offset(spec);
            if offset >= data.len() {
                return Err(ITEM_ADDRESS_OUT_OF_RANGE);
            }
            let size = spec.byte_len();
            let end = (offset + size).min(data.len());
            let mut out = data[offset..end].to_vec();
            if out.len() < size {
                log::warn!(
                    "Read of {} bytes at {} of {}{} runs past its {} bytes, padding with zeros",
                    size,
                    offset,
                    spec.area,
                    spec.db_number,
                    data.len()
                );
                out.resize(size, 0);
            }
            Ok(out)
        })
    }

    /// Serves one write item; errors are item return codes.
    pub fn write_item(&self, spec: &AddressSpec, payload: &[u8]) -> Result<(), u8> {
        let area = self
            .get(spec.area, spec.db_number)
            .ok_or(ITEM_NOT_AVAILABLE)?;
        area.with_mut(|data| {
            if spec.word_len == WordLen::Bit {
                let (byte, bit) = (spec.start as usize / 8, spec.start % 8);
                let value = payload.first().ok_or(ITEM_TYPE_INCONSISTENT)?;
                let target = data.get_mut(byte).ok_or(ITEM_ADDRESS_OUT_OF_RANGE)?;
                if value & 0x01 == 1 {
                    *target |= 1 << bit;
                } else {
                    *target &= !(1 << bit);
                }
                return Ok(());
            }
            let size = spec.byte_len();
            if payload.len() < size {
                return Err(ITEM_TYPE_INCONSISTENT);
            }
            let offset = byte_offset(spec);
            if offset >= data.len() {
                return Err(ITEM_ADDRESS_OUT_OF_RANGE);
            }
            let end = (offset + size).min(data.len());
            if end - offset < size {
                log::warn!(
                    "Write of {} bytes at {} of {}{} truncated to {} bytes",
                    size,
                    offset,
                    spec.area,
                    spec.db_number,
                    end - offset
                );
            }
            data[offset..end].copy_from_slice(&payload[..end - offset]);
            Ok(())
        })
    }
}

/// Counters and timers are addressed by element, everything else by byte.
fn byte_offset(spec: &AddressSpec) -> usize {
    match spec.word_len {
        WordLen::Counter | WordLen::Timer => spec.start as usize * spec.word_len.size(),
        _ => spec.start as usize,
    }
}
