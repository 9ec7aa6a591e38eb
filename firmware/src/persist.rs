//! Persistent configuration: the paired monitor address and the name-map
//! key, stored in a `sequential-storage` map over the on-chip flash region
//! that the stock partition table reserves for NVS.
//!
//! A missing record is not an error; callers substitute their defaults.

use core::ops::Range;

use embassy_embedded_hal::adapter::BlockingAsync;
use esp_storage::FlashStorage;
use log::warn;
use sequential_storage::cache::NoCache;
use sequential_storage::map;

use hr_lora::wire::Addr;

const CONFIG_RANGE: Range<u32> = 0x9000..0xf000;

const KEY_PAIRED_ADDR: u8 = 0x01;
const KEY_NAME_MAP_KEY: u8 = 0x02;

const DATA_BUF_LEN: usize = 32;

type Flash = BlockingAsync<FlashStorage>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PersistError {
    Io,
}

/// Owner of the flash-backed config map. Held by the relay task; boot code
/// uses it once to restore state before the tasks start.
pub struct ConfigStore {
    flash: Flash,
    buf: [u8; DATA_BUF_LEN],
}

impl ConfigStore {
    /// Prepares the backing store. A corrupted map region is erased and
    /// reported as empty; only medium errors fail, and those are fatal to
    /// boot.
    pub async fn init() -> Result<Self, PersistError> {
        let mut store = Self {
            flash: BlockingAsync::new(FlashStorage::new()),
            buf: [0; DATA_BUF_LEN],
        };
        let probe = map::fetch_item::<u8, u8, _>(
            &mut store.flash,
            CONFIG_RANGE,
            &mut NoCache::new(),
            &mut store.buf,
            &KEY_NAME_MAP_KEY,
        )
        .await;
        match probe {
            Ok(_) => Ok(store),
            Err(sequential_storage::Error::Corrupted { .. }) => {
                warn!("config region corrupted; erasing");
                sequential_storage::erase_all(&mut store.flash, CONFIG_RANGE)
                    .await
                    .map_err(|_| PersistError::Io)?;
                Ok(store)
            }
            Err(_) => Err(PersistError::Io),
        }
    }

    pub async fn paired_addr(&mut self) -> Result<Option<Addr>, PersistError> {
        let item = map::fetch_item::<u8, &[u8], _>(
            &mut self.flash,
            CONFIG_RANGE,
            &mut NoCache::new(),
            &mut self.buf,
            &KEY_PAIRED_ADDR,
        )
        .await
        .map_err(|_| PersistError::Io)?;
        Ok(item.and_then(|raw| raw.try_into().ok()))
    }

    pub async fn set_paired_addr(&mut self, addr: &Addr) -> Result<(), PersistError> {
        map::store_item::<u8, &[u8], _>(
            &mut self.flash,
            CONFIG_RANGE,
            &mut NoCache::new(),
            &mut self.buf,
            &KEY_PAIRED_ADDR,
            &addr.as_slice(),
        )
        .await
        .map_err(|_| PersistError::Io)
    }

    pub async fn clear_paired_addr(&mut self) -> Result<(), PersistError> {
        map::remove_item::<u8, _>(
            &mut self.flash,
            CONFIG_RANGE,
            &mut NoCache::new(),
            &mut self.buf,
            &KEY_PAIRED_ADDR,
        )
        .await
        .map_err(|_| PersistError::Io)
    }

    pub async fn name_map_key(&mut self) -> Result<Option<u8>, PersistError> {
        map::fetch_item::<u8, u8, _>(
            &mut self.flash,
            CONFIG_RANGE,
            &mut NoCache::new(),
            &mut self.buf,
            &KEY_NAME_MAP_KEY,
        )
        .await
        .map_err(|_| PersistError::Io)
    }

    pub async fn set_name_map_key(&mut self, key: u8) -> Result<(), PersistError> {
        map::store_item::<u8, u8, _>(
            &mut self.flash,
            CONFIG_RANGE,
            &mut NoCache::new(),
            &mut self.buf,
            &KEY_NAME_MAP_KEY,
            &key,
        )
        .await
        .map_err(|_| PersistError::Io)
    }
}
