//! Block grid, pending edits and map persistence
//!
//! Sessions never write to the grid. Accepted edits are queued and applied by
//! the scheduler's tick task, which hands the applied changes back so they can
//! be broadcast in the order they took effect.

use crate::error::WorldError;
use crate::session::Pose;
use crate::utils::{get_timestamp, lock};
use log::{debug, info};
use serde::{Deserialize, Serialize};
use shared::block;
use shared::{BlockMode, BlockPos, Position};
use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Mutex, RwLock, RwLockReadGuard, RwLockWriteGuard};

/// Persisted map: dimensions, spawn point and one byte per block.
///
/// Blocks are stored y-major: `index = (y * length + z) * width + x`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MapData {
    pub width: u16,
    pub height: u16,
    pub length: u16,
    pub spawn: Position,
    pub spawn_yaw: u8,
    pub spawn_pitch: u8,
    pub blocks: Vec<u8>,
}

impl MapData {
    /// Flat placeholder map: dirt up to half height, a grass layer on top,
    /// bedrock at the bottom.
    pub fn flat(width: u16, height: u16, length: u16) -> Result<Self, WorldError> {
        if width == 0 || height == 0 || length == 0 {
            return Err(WorldError::InvalidDimensions(width, height, length));
        }
        let surface = height / 2;
        let layer = usize::from(width) * usize::from(length);
        let mut blocks = Vec::with_capacity(layer * usize::from(height));
        for y in 0..height {
            let id = match y {
                0 => block::BEDROCK,
                y if y < surface => block::DIRT,
                y if y == surface => block::GRASS,
                _ => block::AIR,
            };
            blocks.extend(std::iter::repeat(id).take(layer));
        }

        let spawn = Position::from_blocks(
            f32::from(width) / 2.0,
            f32::from(surface) + 2.0,
            f32::from(length) / 2.0,
        );
        Ok(Self {
            width,
            height,
            length,
            spawn,
            spawn_yaw: 0,
            spawn_pitch: 0,
            blocks,
        })
    }

    pub fn volume(&self) -> usize {
        usize::from(self.width) * usize::from(self.height) * usize::from(self.length)
    }

    pub fn contains(&self, pos: BlockPos) -> bool {
        pos.x < self.width && pos.y < self.height && pos.z < self.length
    }

    fn index(&self, pos: BlockPos) -> Option<usize> {
        if !self.contains(pos) {
            return None;
        }
        let (w, l) = (usize::from(self.width), usize::from(self.length));
        Some((usize::from(pos.y) * l + usize::from(pos.z)) * w + usize::from(pos.x))
    }

    pub fn get(&self, pos: BlockPos) -> Option<u8> {
        self.index(pos).map(|i| self.blocks[i])
    }

    /// Writes a block; returns whether the grid changed.
    pub fn set(&mut self, pos: BlockPos, id: u8) -> bool {
        match self.index(pos) {
            Some(i) if self.blocks[i] != id => {
                self.blocks[i] = id;
                true
            }
            _ => false,
        }
    }

    /// Checks the block array matches the declared dimensions.
    pub fn verify(&self) -> Result<(), WorldError> {
        if self.width == 0 || self.height == 0 || self.length == 0 {
            return Err(WorldError::InvalidDimensions(self.width, self.height, self.length));
        }
        if self.blocks.len() != self.volume() {
            return Err(WorldError::SizeMismatch {
                expected: self.volume(),
                actual: self.blocks.len(),
            });
        }
        Ok(())
    }
}

/// Where maps are loaded from and saved to.
pub trait MapStore: Send + Sync {
    /// Loads the stored map, or `None` when nothing has been saved yet.
    fn load(&self) -> Result<Option<MapData>, WorldError>;
    fn save(&self, map: &MapData) -> Result<(), WorldError>;
    /// Writes a copy of `map` next to the live one and returns its path.
    fn backup(&self, map: &MapData) -> Result<PathBuf, WorldError>;
}

/// Stores maps as bincode files.
pub struct FileMapStore {
    path: PathBuf,
    backup_dir: PathBuf,
}

impl FileMapStore {
    pub fn new(path: impl Into<PathBuf>, backup_dir: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            backup_dir: backup_dir.into(),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn write_atomic(path: &Path, map: &MapData) -> Result<(), WorldError> {
        if let Some(dir) = path.parent().filter(|d| !d.as_os_str().is_empty()) {
            fs::create_dir_all(dir)?;
        }
        let bytes = bincode::serialize(map)?;
        let temp = path.with_extension("tmp");
        {
            let mut file = fs::File::create(&temp)?;
            file.write_all(&bytes)?;
            file.sync_all()?;
        }
        fs::rename(&temp, path)?;
        Ok(())
    }
}

impl MapStore for FileMapStore {
    fn load(&self) -> Result<Option<MapData>, WorldError> {
        let bytes = match fs::read(&self.path) {
            Ok(bytes) => bytes,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(e.into()),
        };
        let map: MapData = bincode::deserialize(&bytes)?;
        map.verify()?;
        Ok(Some(map))
    }

    fn save(&self, map: &MapData) -> Result<(), WorldError> {
        Self::write_atomic(&self.path, map)
    }

    fn backup(&self, map: &MapData) -> Result<PathBuf, WorldError> {
        let stem = self
            .path
            .file_stem()
            .and_then(|s| s.to_str())
            .unwrap_or("map");
        let target = self.backup_dir.join(format!("{}-{}.map", stem, get_timestamp()));
        Self::write_atomic(&target, map)?;
        Ok(target)
    }
}

/// Keeps the last saved map in memory. For embedders that persist maps
/// elsewhere, and for tests.
#[derive(Default)]
pub struct MemoryMapStore {
    saved: Mutex<Option<MapData>>,
    saves: AtomicUsize,
}

impl MemoryMapStore {
    pub fn save_count(&self) -> usize {
        self.saves.load(Ordering::Acquire)
    }

    pub fn last_saved(&self) -> Option<MapData> {
        lock(&self.saved).clone()
    }
}

impl MapStore for MemoryMapStore {
    fn load(&self) -> Result<Option<MapData>, WorldError> {
        Ok(self.last_saved())
    }

    fn save(&self, map: &MapData) -> Result<(), WorldError> {
        *lock(&self.saved) = Some(map.clone());
        self.saves.fetch_add(1, Ordering::AcqRel);
        Ok(())
    }

    fn backup(&self, _map: &MapData) -> Result<PathBuf, WorldError> {
        Ok(PathBuf::from("memory"))
    }
}

impl<T: MapStore + ?Sized> MapStore for std::sync::Arc<T> {
    fn load(&self) -> Result<Option<MapData>, WorldError> {
        (**self).load()
    }

    fn save(&self, map: &MapData) -> Result<(), WorldError> {
        (**self).save(map)
    }

    fn backup(&self, map: &MapData) -> Result<PathBuf, WorldError> {
        (**self).backup(map)
    }
}

/// Decides whether a player may change a block.
pub trait BlockPolicy: Send + Sync {
    fn can_place_block(&self, player: &str, pos: BlockPos, old: u8, new: u8) -> bool;
}

/// Classic survival-free rules: no unknown ids, no bedrock, no liquids.
#[derive(Debug, Default, Clone, Copy)]
pub struct DefaultBlockPolicy;

impl BlockPolicy for DefaultBlockPolicy {
    fn can_place_block(&self, _player: &str, _pos: BlockPos, old: u8, new: u8) -> bool {
        new <= block::MAX_BLOCK && old != block::BEDROCK && new != block::BEDROCK && !block::is_liquid(new)
    }
}

/// A block edit that has been applied to the grid.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BlockChange {
    pub pos: BlockPos,
    pub block: u8,
}

pub struct World {
    map: RwLock<MapData>,
    pending: Mutex<Vec<BlockChange>>,
    dirty: AtomicBool,
    store: Box<dyn MapStore>,
    policy: Box<dyn BlockPolicy>,
}

impl World {
    pub fn new(map: MapData, store: Box<dyn MapStore>, policy: Box<dyn BlockPolicy>) -> Result<Self, WorldError> {
        map.verify()?;
        Ok(Self {
            map: RwLock::new(map),
            pending: Mutex::new(Vec::new()),
            dirty: AtomicBool::new(false),
            store,
            policy,
        })
    }

    /// Loads the stored map, creating and saving a flat one if none exists.
    pub fn load_or_create(
        store: Box<dyn MapStore>,
        policy: Box<dyn BlockPolicy>,
        (width, height, length): (u16, u16, u16),
    ) -> Result<Self, WorldError> {
        let map = match store.load()? {
            Some(map) => {
                info!("Loaded {}x{}x{} map", map.width, map.height, map.length);
                map
            }
            None => {
                let map = MapData::flat(width, height, length)?;
                store.save(&map)?;
                info!("Created flat {}x{}x{} map", width, height, length);
                map
            }
        };
        Self::new(map, store, policy)
    }

    fn read(&self) -> RwLockReadGuard<'_, MapData> {
        self.map.read().unwrap_or_else(std::sync::PoisonError::into_inner)
    }

    fn write(&self) -> RwLockWriteGuard<'_, MapData> {
        self.map.write().unwrap_or_else(std::sync::PoisonError::into_inner)
    }

    pub fn dimensions(&self) -> (u16, u16, u16) {
        let map = self.read();
        (map.width, map.height, map.length)
    }

    pub fn spawn(&self) -> Pose {
        let map = self.read();
        Pose {
            position: map.spawn,
            yaw: map.spawn_yaw,
            pitch: map.spawn_pitch,
        }
    }

    pub fn block_at(&self, pos: BlockPos) -> Option<u8> {
        self.read().get(pos)
    }

    /// Copy of the block array for the level stream.
    pub fn blocks(&self) -> Vec<u8> {
        self.read().blocks.clone()
    }

    pub fn snapshot(&self) -> MapData {
        self.read().clone()
    }

    /// Validates an edit and queues it for the next tick.
    ///
    /// Returns the block the client should be shown instead when the edit is
    /// denied, and `None` when it was queued or falls outside the map.
    pub fn request_block_change(&self, player: &str, pos: BlockPos, mode: BlockMode, id: u8) -> Option<u8> {
        let Some(current) = self.block_at(pos) else {
            debug!("{} tried to edit outside the map at {:?}", player, pos);
            return None;
        };
        let new = match mode {
            BlockMode::Destroy => block::AIR,
            BlockMode::Place => id,
        };
        if !self.policy.can_place_block(player, pos, current, new) {
            debug!("denied {} placing {} at {:?}", player, new, pos);
            return Some(current);
        }
        lock(&self.pending).push(BlockChange { pos, block: new });
        None
    }

    pub fn pending_count(&self) -> usize {
        lock(&self.pending).len()
    }

    /// Applies every queued edit and returns the ones that changed the grid.
    pub fn tick(&self) -> Vec<BlockChange> {
        let queued = std::mem::take(&mut *lock(&self.pending));
        if queued.is_empty() {
            return queued;
        }
        let mut map = self.write();
        let applied: Vec<_> = queued.into_iter().filter(|c| map.set(c.pos, c.block)).collect();
        if !applied.is_empty() {
            self.dirty.store(true, Ordering::Release);
        }
        applied
    }

    pub fn is_dirty(&self) -> bool {
        self.dirty.load(Ordering::Acquire)
    }

    /// Saves the map if it changed since the last save. Returns whether a
    /// save happened.
    pub fn save_if_dirty(&self) -> Result<bool, WorldError> {
        if !self.dirty.swap(false, Ordering::AcqRel) {
            return Ok(false);
        }
        let map = self.snapshot();
        if let Err(e) = self.store.save(&map) {
            self.dirty.store(true, Ordering::Release);
            return Err(e);
        }
        Ok(true)
    }

    pub fn save(&self) -> Result<(), WorldError> {
        self.dirty.store(false, Ordering::Release);
        let map = self.snapshot();
        if let Err(e) = self.store.save(&map) {
            self.dirty.store(true, Ordering::Release);
            return Err(e);
        }
        Ok(())
    }

    pub fn backup(&self) -> Result<PathBuf, WorldError> {
        let map = self.snapshot();
        let path = self.store.backup(&map)?;
        info!("Backed up map to {}", path.display());
        Ok(path)
    }
}
