//! RocksDB-backed persistent cell store.
//!
//! Column families:
//! - `grids`   grid bookkeeping (bincode, keyed by grid_id)
//! - `sheets`  sheet records (bincode, keyed by grid_id:sheet_id)
//! - `layouts` sheet layouts (bincode, keyed by grid_id:sheet_id)
//! - `cells`   cell records (JSON, keyed by grid_id:sheet_id:row:col)
//!
//! Cell keys are `<grid:16><sheet:16><row:4 BE><col:4 BE>`, so a forward scan
//! from the 32-byte sheet prefix yields a sheet's cells in `(row, col)` order.
//! Cell values stay JSON because `value`/`style` are free-form.
//!
//! Mutations that read before they write (`upsert_*`, `delete_range`,
//! `shift`) are serialized by a writer mutex and committed as one
//! `WriteBatch`, so each call is atomic with respect to the others.

use async_trait::async_trait;
use gridsync_core::{
    Axis, Cell, CellPatch, GridId, GridRecord, LayoutPatch, SheetId, SheetLayout, SheetRecord,
    UserId,
};
use rocksdb::{
    BlockBasedOptions, Cache, ColumnFamily, ColumnFamilyDescriptor, DBCompressionType,
    DBWithThreadMode, Direction, IteratorMode, Options, SingleThreaded, SliceTransform,
    WriteBatch, WriteOptions,
};
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard};

use super::cells::CellStore;
use super::{plan_shift, StoreError, StoreResult};

const CF_GRIDS: &str = "grids";
const CF_SHEETS: &str = "sheets";
const CF_LAYOUTS: &str = "layouts";
const CF_CELLS: &str = "cells";

const COLUMN_FAMILIES: &[&str] = &[CF_GRIDS, CF_SHEETS, CF_LAYOUTS, CF_CELLS];

const SHEET_PREFIX_LEN: usize = 32;
const CELL_KEY_LEN: usize = SHEET_PREFIX_LEN + 8;

/// Store configuration.
#[derive(Debug, Clone)]
pub struct StoreConfig {
    /// Database directory path
    pub path: PathBuf,
    /// Block cache size in bytes (default: 128MB)
    pub block_cache_size: usize,
    /// Bloom filter bits per key (default: 10)
    pub bloom_filter_bits: i32,
    /// fsync on every write (default: false)
    pub sync_writes: bool,
    /// Max open files for RocksDB (default: 512)
    pub max_open_files: i32,
    /// Write buffer size per column family (default: 32MB)
    pub write_buffer_size: usize,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            path: PathBuf::from("gridsync_data"),
            block_cache_size: 128 * 1024 * 1024,
            bloom_filter_bits: 10,
            sync_writes: false,
            max_open_files: 512,
            write_buffer_size: 32 * 1024 * 1024,
        }
    }
}

impl StoreConfig {
    /// Small caches, caller-provided directory.
    pub fn for_testing(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            block_cache_size: 8 * 1024 * 1024,
            bloom_filter_bits: 10,
            sync_writes: false,
            max_open_files: 64,
            write_buffer_size: 4 * 1024 * 1024,
        }
    }
}

fn encode_bin<T: Serialize>(value: &T) -> StoreResult<Vec<u8>> {
    bincode::serde::encode_to_vec(value, bincode::config::standard())
        .map_err(|e| StoreError::Serialization(e.to_string()))
}

fn decode_bin<T: DeserializeOwned>(bytes: &[u8]) -> StoreResult<T> {
    let (value, _) = bincode::serde::decode_from_slice(bytes, bincode::config::standard())
        .map_err(|e| StoreError::Serialization(e.to_string()))?;
    Ok(value)
}

fn grid_key(grid: GridId) -> Vec<u8> {
    grid.as_bytes().to_vec()
}

fn sheet_key(grid: GridId, sheet: SheetId) -> Vec<u8> {
    let mut key = Vec::with_capacity(SHEET_PREFIX_LEN);
    key.extend_from_slice(grid.as_bytes());
    key.extend_from_slice(sheet.as_bytes());
    key
}

fn cell_key(grid: GridId, sheet: SheetId, row: u32, col: u32) -> Vec<u8> {
    let mut key = Vec::with_capacity(CELL_KEY_LEN);
    key.extend_from_slice(grid.as_bytes());
    key.extend_from_slice(sheet.as_bytes());
    key.extend_from_slice(&row.to_be_bytes());
    key.extend_from_slice(&col.to_be_bytes());
    key
}

/// `(row, col)` from a full cell key.
fn cell_position(key: &[u8]) -> Option<(u32, u32)> {
    if key.len() != CELL_KEY_LEN {
        return None;
    }
    let row = u32::from_be_bytes(key[32..36].try_into().ok()?);
    let col = u32::from_be_bytes(key[36..40].try_into().ok()?);
    Some((row, col))
}

/// RocksDB-backed [`CellStore`].
pub struct RocksCellStore {
    db: DBWithThreadMode<SingleThreaded>,
    config: StoreConfig,
    writer: Mutex<()>,
}

impl RocksCellStore {
    /// Open the store, creating the database and column families if missing.
    pub fn open(config: StoreConfig) -> StoreResult<Self> {
        let mut db_opts = Options::default();
        db_opts.create_if_missing(true);
        db_opts.create_missing_column_families(true);
        db_opts.set_max_open_files(config.max_open_files);
        db_opts.set_keep_log_file_num(5);
        db_opts.increase_parallelism(num_cpus());

        let cf_descriptors: Vec<ColumnFamilyDescriptor> = COLUMN_FAMILIES
            .iter()
            .map(|name| ColumnFamilyDescriptor::new(*name, Self::cf_options(name, &config)))
            .collect();

        let db = DBWithThreadMode::<SingleThreaded>::open_cf_descriptors(
            &db_opts,
            &config.path,
            cf_descriptors,
        )?;

        log::info!("Opened cell store at {}", config.path.display());

        Ok(Self {
            db,
            config,
            writer: Mutex::new(()),
        })
    }

    fn cf_options(name: &str, config: &StoreConfig) -> Options {
        let mut opts = Options::default();

        let mut block_opts = BlockBasedOptions::default();
        let cache = Cache::new_lru_cache(config.block_cache_size);
        block_opts.set_block_cache(&cache);
        block_opts.set_bloom_filter(config.bloom_filter_bits as f64, false);
        block_opts.set_block_size(16 * 1024);
        opts.set_block_based_table_factory(&block_opts);

        opts.set_compression_type(DBCompressionType::Lz4);
        opts.set_write_buffer_size(config.write_buffer_size);

        match name {
            CF_GRIDS | CF_LAYOUTS => {
                opts.set_max_write_buffer_number(2);
            }
            CF_SHEETS => {
                // Scanned by grid id
                opts.set_max_write_buffer_number(2);
                opts.set_prefix_extractor(SliceTransform::create_fixed_prefix(16));
            }
            CF_CELLS => {
                // Many small writes, scanned by grid:sheet
                opts.set_max_write_buffer_number(4);
                opts.set_prefix_extractor(SliceTransform::create_fixed_prefix(SHEET_PREFIX_LEN));
            }
            _ => {}
        }

        opts
    }

    pub fn path(&self) -> &Path {
        &self.config.path
    }

    /// Flush memtables to disk.
    pub fn flush(&self) -> StoreResult<()> {
        for name in COLUMN_FAMILIES {
            self.db.flush_cf(self.cf(name)?)?;
        }
        Ok(())
    }

    fn cf(&self, name: &str) -> StoreResult<&ColumnFamily> {
        self.db
            .cf_handle(name)
            .ok_or_else(|| StoreError::Database(format!("Column family '{name}' not found")))
    }

    fn lock_writer(&self) -> StoreResult<MutexGuard<'_, ()>> {
        self.writer
            .lock()
            .map_err(|_| StoreError::Unavailable("writer lock poisoned".to_string()))
    }

    fn write(&self, batch: WriteBatch) -> StoreResult<()> {
        let mut write_opts = WriteOptions::default();
        write_opts.set_sync(self.config.sync_writes);
        self.db.write_opt(batch, &write_opts)?;
        Ok(())
    }

    fn get_bin<T: DeserializeOwned>(&self, cf_name: &str, key: &[u8]) -> StoreResult<Option<T>> {
        let cf = self.cf(cf_name)?;
        match self.db.get_cf(cf, key)? {
            Some(bytes) => Ok(Some(decode_bin(&bytes)?)),
            None => Ok(None),
        }
    }

    /// Every `(key, value)` under `prefix`, in key order.
    fn scan_prefix(&self, cf_name: &str, prefix: &[u8]) -> StoreResult<Vec<(Box<[u8]>, Box<[u8]>)>> {
        let cf = self.cf(cf_name)?;
        let iter = self
            .db
            .iterator_cf(cf, IteratorMode::From(prefix, Direction::Forward));

        let mut items = Vec::new();
        for item in iter {
            let (key, value) = item?;
            if !key.starts_with(prefix) {
                break;
            }
            items.push((key, value));
        }
        Ok(items)
    }

    fn sheet_cells(&self, grid: GridId, sheet: SheetId) -> StoreResult<BTreeMap<(u32, u32), Cell>> {
        let mut cells = BTreeMap::new();
        for (key, value) in self.scan_prefix(CF_CELLS, &sheet_key(grid, sheet))? {
            let Some(position) = cell_position(&key) else {
                log::warn!("Skipping malformed cell key of {} bytes", key.len());
                continue;
            };
            let cell: Cell = serde_json::from_slice(&value)?;
            cells.insert(position, cell);
        }
        Ok(cells)
    }

    fn list_sheets_sync(&self, grid: GridId) -> StoreResult<Vec<SheetRecord>> {
        let mut sheets = self
            .scan_prefix(CF_SHEETS, &grid_key(grid))?
            .iter()
            .map(|(_, value)| decode_bin::<SheetRecord>(value))
            .collect::<StoreResult<Vec<_>>>()?;
        sheets.sort_by_key(SheetRecord::creation_order);
        Ok(sheets)
    }

    fn put_sheet_sync(&self, sheet: &SheetRecord) -> StoreResult<()> {
        let cf = self.cf(CF_SHEETS)?;
        let mut batch = WriteBatch::default();
        batch.put_cf(cf, sheet_key(sheet.grid_id, sheet.id), encode_bin(sheet)?);
        self.write(batch)
    }

    fn touch_grid_sync(&self, grid: GridId, editor: Option<UserId>, at: u64) -> StoreResult<()> {
        let _writer = self.lock_writer()?;
        let mut record: GridRecord = self
            .get_bin(CF_GRIDS, &grid_key(grid))?
            .unwrap_or_else(|| GridRecord::new(grid));
        record.last_modified = Some(at);
        record.last_editor = editor;

        let cf = self.cf(CF_GRIDS)?;
        let mut batch = WriteBatch::default();
        batch.put_cf(cf, grid_key(grid), encode_bin(&record)?);
        self.write(batch)
    }

    fn upsert_layout_sync(
        &self,
        grid: GridId,
        sheet: SheetId,
        patch: &LayoutPatch,
    ) -> StoreResult<SheetLayout> {
        let _writer = self.lock_writer()?;
        let key = sheet_key(grid, sheet);
        let mut layout: SheetLayout = self.get_bin(CF_LAYOUTS, &key)?.unwrap_or_default();
        patch.apply_to(&mut layout);

        let cf = self.cf(CF_LAYOUTS)?;
        let mut batch = WriteBatch::default();
        batch.put_cf(cf, key, encode_bin(&layout)?);
        self.write(batch)?;
        Ok(layout)
    }

    fn put_layout_sync(&self, grid: GridId, sheet: SheetId, layout: &SheetLayout) -> StoreResult<()> {
        let _writer = self.lock_writer()?;
        let cf = self.cf(CF_LAYOUTS)?;
        let mut batch = WriteBatch::default();
        batch.put_cf(cf, sheet_key(grid, sheet), encode_bin(layout)?);
        self.write(batch)
    }

    fn get_cell_sync(&self, grid: GridId, sheet: SheetId, row: u32, col: u32) -> StoreResult<Option<Cell>> {
        let cf = self.cf(CF_CELLS)?;
        match self.db.get_cf(cf, cell_key(grid, sheet, row, col))? {
            Some(bytes) => Ok(Some(serde_json::from_slice(&bytes)?)),
            None => Ok(None),
        }
    }

    fn upsert_cell_sync(
        &self,
        grid: GridId,
        sheet: SheetId,
        row: u32,
        col: u32,
        patch: &CellPatch,
    ) -> StoreResult<Cell> {
        let _writer = self.lock_writer()?;
        let existing = self.get_cell_sync(grid, sheet, row, col)?;
        let cell = patch.apply(existing, grid, sheet, row, col);

        let cf = self.cf(CF_CELLS)?;
        let mut batch = WriteBatch::default();
        batch.put_cf(cf, cell_key(grid, sheet, row, col), serde_json::to_vec(&cell)?);
        self.write(batch)?;
        Ok(cell)
    }

    fn delete_range_sync(
        &self,
        grid: GridId,
        sheet: SheetId,
        axis: Axis,
        start: u32,
        end: u32,
    ) -> StoreResult<u64> {
        let _writer = self.lock_writer()?;
        let cf = self.cf(CF_CELLS)?;

        let mut batch = WriteBatch::default();
        let mut removed = 0u64;
        for (key, _) in self.scan_prefix(CF_CELLS, &sheet_key(grid, sheet))? {
            let Some((row, col)) = cell_position(&key) else {
                continue;
            };
            let index = axis.index_of(row, col);
            if index >= start && index <= end {
                batch.delete_cf(cf, &key);
                removed += 1;
            }
        }

        if removed > 0 {
            self.write(batch)?;
        }
        Ok(removed)
    }

    fn shift_sync(
        &self,
        grid: GridId,
        sheet: SheetId,
        axis: Axis,
        from: u32,
        delta: i64,
    ) -> StoreResult<u64> {
        let _writer = self.lock_writer()?;
        let mut cells = self.sheet_cells(grid, sheet)?;
        let moves = plan_shift(cells.keys().copied(), axis, from, delta)?;
        if moves.is_empty() {
            return Ok(0);
        }

        let cf = self.cf(CF_CELLS)?;
        let mut batch = WriteBatch::default();
        // Deletes first: a later put may reuse a key vacated earlier in the plan.
        for m in &moves {
            batch.delete_cf(cf, cell_key(grid, sheet, m.from.0, m.from.1));
        }
        for m in &moves {
            let Some(mut cell) = cells.remove(&m.from) else {
                continue;
            };
            cell.row = m.to.0;
            cell.col = m.to.1;
            batch.put_cf(cf, cell_key(grid, sheet, m.to.0, m.to.1), serde_json::to_vec(&cell)?);
        }
        self.write(batch)?;

        log::debug!(
            "Shifted {} cells of sheet {sheet} along {axis} from {from} by {delta}",
            moves.len()
        );
        Ok(moves.len() as u64)
    }
}

#[async_trait]
impl CellStore for RocksCellStore {
    async fn list_sheets(&self, grid: GridId) -> StoreResult<Vec<SheetRecord>> {
        self.list_sheets_sync(grid)
    }

    async fn put_sheet(&self, sheet: SheetRecord) -> StoreResult<()> {
        self.put_sheet_sync(&sheet)
    }

    async fn get_grid(&self, grid: GridId) -> StoreResult<Option<GridRecord>> {
        self.get_bin(CF_GRIDS, &grid_key(grid))
    }

    async fn touch_grid(&self, grid: GridId, editor: Option<UserId>, at: u64) -> StoreResult<()> {
        self.touch_grid_sync(grid, editor, at)
    }

    async fn get_layout(&self, grid: GridId, sheet: SheetId) -> StoreResult<Option<SheetLayout>> {
        self.get_bin(CF_LAYOUTS, &sheet_key(grid, sheet))
    }

    async fn upsert_layout(
        &self,
        grid: GridId,
        sheet: SheetId,
        patch: &LayoutPatch,
    ) -> StoreResult<SheetLayout> {
        self.upsert_layout_sync(grid, sheet, patch)
    }

    async fn put_layout(
        &self,
        grid: GridId,
        sheet: SheetId,
        layout: SheetLayout,
    ) -> StoreResult<()> {
        self.put_layout_sync(grid, sheet, &layout)
    }

    async fn get_cell(
        &self,
        grid: GridId,
        sheet: SheetId,
        row: u32,
        col: u32,
    ) -> StoreResult<Option<Cell>> {
        self.get_cell_sync(grid, sheet, row, col)
    }

    async fn list_cells(&self, grid: GridId, sheet: SheetId) -> StoreResult<Vec<Cell>> {
        Ok(self.sheet_cells(grid, sheet)?.into_values().collect())
    }

    async fn upsert_cell(
        &self,
        grid: GridId,
        sheet: SheetId,
        row: u32,
        col: u32,
        patch: &CellPatch,
    ) -> StoreResult<Cell> {
        self.upsert_cell_sync(grid, sheet, row, col, patch)
    }

    async fn delete_range(
        &self,
        grid: GridId,
        sheet: SheetId,
        axis: Axis,
        start: u32,
        end: u32,
    ) -> StoreResult<u64> {
        self.delete_range_sync(grid, sheet, axis, start, end)
    }

    async fn shift(
        &self,
        grid: GridId,
        sheet: SheetId,
        axis: Axis,
        from: u32,
        delta: i64,
    ) -> StoreResult<u64> {
        self.shift_sync(grid, sheet, axis, from, delta)
    }
}

fn num_cpus() -> i32 {
    std::thread::available_parallelism()
        .map(|n| n.get() as i32)
        .unwrap_or(4)
}
