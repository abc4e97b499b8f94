use chrono::{DateTime, Duration, Utc};
use image::{ImageFormat, RgbaImage};
use rs978::config::Settings;
use rs978::decode::products::image::{blocks_per_row, south_first_block};
use rs978::model::{
    ImagePayload, ProductType, BIN_NOT_INCLUDED, BIN_NO_DATA, BLOCK_BINS,
    BLOCK_HEIGHT, BLOCK_WIDTH,
};
use std::collections::HashMap;
use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};
use tracing::{debug, warn};

/**
 * Image assembly: per-block tiles merge into a dense raster per
 * (product, scale). The raster is the minimum bounding box of the live
 * blocks; bins never covered stay at the not-included sentinel, bins
 * explicitly broadcast as no-data (wire value 7) hold the no-data
 * sentinel. Radar-like composites evict tiles more than ten minutes
 * older than the newest (exactly ten minutes is kept).
 *
 * Rendering is gated by a quiet period so partially transmitted frames
 * never reach the PNG output.
 */

/// Wire bin value reserved for "no data at this bin"
pub const WIRE_NO_DATA: u8 = 7;

pub const RADAR_EVICT_MINUTES: i64 = 10;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct RasterKey {
    pub product_id: u16,
    pub scale: u8,
}

#[derive(Debug)]
pub struct Raster {
    pub product_type: ProductType,
    pub key: RasterKey,
    /// West edge in lon bins, south edge in lat bins (signed, equator 0)
    west: i64,
    south: i64,
    width: usize,
    height: usize,
    bins: Vec<u8>,
    /// Live blocks and their validity times
    blocks: HashMap<u32, DateTime<Utc>>,
    last_write: DateTime<Utc>,
    dirty: bool,
}

/// Block position in bin coordinates: (west bin, south bin)
fn block_grid(block_number: u32, scale: u8) -> (i64, i64) {
    let per_row = blocks_per_row(scale) as i64;
    let south_first = south_first_block(scale) as i64;
    let number = block_number as i64;
    let (row, column) = if number < south_first {
        (number / per_row, number % per_row)
    } else {
        (-((number - south_first) / per_row) - 1, (number - south_first) % per_row)
    };
    (column * BLOCK_WIDTH as i64, row * BLOCK_HEIGHT as i64)
}

impl Raster {
    fn new(product_type: ProductType, key: RasterKey, now: DateTime<Utc>) -> Self {
        Raster {
            product_type,
            key,
            west: 0,
            south: 0,
            width: 0,
            height: 0,
            bins: Vec::new(),
            blocks: HashMap::new(),
            last_write: now,
            dirty: false,
        }
    }

    pub fn block_count(&self) -> usize {
        self.blocks.len()
    }

    pub fn size(&self) -> (usize, usize) {
        (self.width, self.height)
    }

    /// Geographic (west, south, east, north) of the raster in degrees
    pub fn bounds_deg(&self, bin_width: f64, bin_height: f64) -> (f64, f64, f64, f64) {
        (
            self.west as f64 * bin_width,
            self.south as f64 * bin_height,
            (self.west + self.width as i64) as f64 * bin_width,
            (self.south + self.height as i64) as f64 * bin_height,
        )
    }

    pub fn bin_at(&self, x: i64, y: i64) -> Option<u8> {
        if x < self.west
            || y < self.south
            || x >= self.west + self.width as i64
            || y >= self.south + self.height as i64
        {
            return None;
        }
        let row_from_top = (self.south + self.height as i64 - 1 - y) as usize;
        Some(self.bins[row_from_top * self.width + (x - self.west) as usize])
    }

    fn set_bin(&mut self, x: i64, y: i64, value: u8) {
        let row_from_top = (self.south + self.height as i64 - 1 - y) as usize;
        self.bins[row_from_top * self.width + (x - self.west) as usize] = value;
    }

    /// Grow to the minimum bounding box also covering the given block
    /// rectangle; newly covered bins start not-included
    fn enlarge(&mut self, block_west: i64, block_south: i64) {
        let block_east = block_west + BLOCK_WIDTH as i64;
        let block_north = block_south + BLOCK_HEIGHT as i64;
        if self.width == 0 {
            self.west = block_west;
            self.south = block_south;
            self.width = BLOCK_WIDTH;
            self.height = BLOCK_HEIGHT;
            self.bins = vec![BIN_NOT_INCLUDED; BLOCK_BINS];
            return;
        }
        let west = self.west.min(block_west);
        let south = self.south.min(block_south);
        let east = (self.west + self.width as i64).max(block_east);
        let north = (self.south + self.height as i64).max(block_north);
        if west == self.west
            && south == self.south
            && east == self.west + self.width as i64
            && north == self.south + self.height as i64
        {
            return;
        }
        self.reshape(west, south, east, north);
    }

    /// Copy-and-pad into a new extent (used both to grow and to crop)
    fn reshape(&mut self, west: i64, south: i64, east: i64, north: i64) {
        let width = (east - west) as usize;
        let height = (north - south) as usize;
        let mut bins = vec![BIN_NOT_INCLUDED; width * height];
        for y in self.south.max(south)..(self.south + self.height as i64).min(north) {
            for x in self.west.max(west)..(self.west + self.width as i64).min(east)
            {
                let value = self
                    .bin_at(x, y)
                    .expect("old extent bin");
                let row_from_top = (south + height as i64 - 1 - y) as usize;
                bins[row_from_top * width + (x - west) as usize] = value;
            }
        }
        self.west = west;
        self.south = south;
        self.width = width;
        self.height = height;
        self.bins = bins;
    }

    /// Shrink back to the minimum bounding box of the live blocks
    fn fit_to_blocks(&mut self) {
        if self.blocks.is_empty() {
            self.width = 0;
            self.height = 0;
            self.bins.clear();
            return;
        }
        let mut west = i64::MAX;
        let mut south = i64::MAX;
        let mut east = i64::MIN;
        let mut north = i64::MIN;
        for &number in self.blocks.keys() {
            let (bw, bs) = block_grid(number, self.key.scale);
            west = west.min(bw);
            south = south.min(bs);
            east = east.max(bw + BLOCK_WIDTH as i64);
            north = north.max(bs + BLOCK_HEIGHT as i64);
        }
        if west != self.west
            || south != self.south
            || east != self.west + self.width as i64
            || north != self.south + self.height as i64
        {
            self.reshape(west, south, east, north);
        }
    }

    fn clear_block(&mut self, block_number: u32) {
        let (bw, bs) = block_grid(block_number, self.key.scale);
        for ly in 0..BLOCK_HEIGHT as i64 {
            for lx in 0..BLOCK_WIDTH as i64 {
                self.set_bin(bw + lx, bs + ly, BIN_NOT_INCLUDED);
            }
        }
    }

    /// Write one block, evicting stale radar tiles first
    pub fn apply(&mut self, payload: &ImagePayload, now: DateTime<Utc>) {
        if self.product_type.is_radar_like() {
            let newest = self
                .blocks
                .values()
                .copied()
                .chain(std::iter::once(payload.valid_time))
                .max()
                .expect("at least the new block");
            let stale: Vec<u32> = self
                .blocks
                .iter()
                .filter(|(_, valid)| {
                    newest - **valid
                        > Duration::minutes(RADAR_EVICT_MINUTES)
                })
                .map(|(number, _)| *number)
                .collect();
            for number in &stale {
                self.clear_block(*number);
                self.blocks.remove(number);
            }
            if !stale.is_empty() {
                debug!(
                    product = %self.product_type,
                    evicted = stale.len(),
                    "stale radar tiles evicted"
                );
                self.fit_to_blocks();
            }
            // A late arrival already more than ten minutes behind the
            // composite is rejected outright
            if newest - payload.valid_time
                > Duration::minutes(RADAR_EVICT_MINUTES)
            {
                debug!(
                    block = payload.block_number,
                    "stale radar tile rejected"
                );
                return;
            }
        }

        let (bw, bs) = block_grid(payload.block_number, self.key.scale);
        self.enlarge(bw, bs);
        for (index, &value) in payload.bins.iter().enumerate() {
            let lx = (index % BLOCK_WIDTH) as i64;
            let ly = (index / BLOCK_WIDTH) as i64;
            // Payload rows run from the block's north edge
            let y = bs + (BLOCK_HEIGHT as i64 - 1 - ly);
            let stored = if value == WIRE_NO_DATA {
                BIN_NO_DATA
            } else {
                value
            };
            self.set_bin(bw + lx, y, stored);
        }
        self.blocks.insert(payload.block_number, payload.valid_time);
        self.last_write = now;
        self.dirty = true;
    }

    /// Drop a block whose product record expired
    pub fn remove_block(&mut self, block_number: u32, now: DateTime<Utc>) {
        if self.blocks.remove(&block_number).is_some() {
            self.clear_block(block_number);
            self.fit_to_blocks();
            self.last_write = now;
            self.dirty = true;
        }
    }

    pub fn newest_valid_time(&self) -> Option<DateTime<Utc>> {
        self.blocks.values().copied().max()
    }

    /// Map bins through the product palette and write PNG plus world file,
    /// atomically
    pub fn render(
        &mut self,
        settings: &Settings,
        dir: &Path,
    ) -> std::io::Result<PathBuf> {
        let (not_included, no_data) = sentinel_colors(settings);
        let palette = effective_palette(settings, self.key.product_id);
        let mut data = Vec::with_capacity(self.width * self.height * 4);
        for &bin in &self.bins {
            let rgba = match bin {
                BIN_NOT_INCLUDED => not_included,
                BIN_NO_DATA => no_data,
                value => palette[value as usize & 0x07],
            };
            data.extend_from_slice(&rgba);
        }
        let image = RgbaImage::from_raw(
            self.width as u32,
            self.height as u32,
            data,
        )
        .ok_or_else(|| {
            std::io::Error::new(std::io::ErrorKind::InvalidData, "raster size")
        })?;

        fs::create_dir_all(dir)?;
        let stem = format!("{}-{}", self.product_type, self.key.scale);
        let path = dir.join(format!("{stem}.png"));
        let tmp = dir.join(format!(".{stem}.png.tmp"));
        image
            .save_with_format(&tmp, ImageFormat::Png)
            .map_err(|e| std::io::Error::new(std::io::ErrorKind::Other, e))?;
        fs::rename(&tmp, &path)?;

        self.write_world_file(dir, &stem)?;
        self.dirty = false;
        Ok(path)
    }

    fn write_world_file(&self, dir: &Path, stem: &str) -> std::io::Result<()> {
        let factor = match self.key.scale {
            0 => 1.0,
            1 => 5.0,
            _ => 9.0,
        };
        let bin_width = 1.5 / 60.0 * factor;
        let bin_height = 1.0 / 60.0 * factor;
        let (west, _, _, north) = self.bounds_deg(bin_width, bin_height);
        let tmp = dir.join(format!(".{stem}.wld.tmp"));
        let mut file = fs::File::create(&tmp)?;
        // Pixel size, rotation, rotation, negative pixel height, then the
        // center of the upper-left pixel
        writeln!(file, "{bin_width}")?;
        writeln!(file, "0.0")?;
        writeln!(file, "0.0")?;
        writeln!(file, "{}", -bin_height)?;
        writeln!(file, "{}", west + bin_width / 2.0)?;
        writeln!(file, "{}", north - bin_height / 2.0)?;
        fs::rename(&tmp, dir.join(format!("{stem}.wld")))?;
        Ok(())
    }
}

/// Sentinel rendering per the image map configuration: 0 both
/// transparent, 1 distinct debug colors, 2 both the configured color
fn sentinel_colors(settings: &Settings) -> ([u8; 4], [u8; 4]) {
    let [r, g, b] = settings.not_included_rgb;
    match settings.image_map_configuration {
        1 => ([0xff, 0x00, 0xff, 0xff], [0x00, 0xff, 0xff, 0xff]),
        2 => ([r, g, b, 0xff], [r, g, b, 0xff]),
        _ => ([0, 0, 0, 0], [0, 0, 0, 0]),
    }
}

/// The configured palette: the built-in table with any leading entries
/// replaced by the per-product override
pub fn effective_palette(settings: &Settings, product_id: u16) -> [[u8; 4]; 8] {
    let mut colors = palette(product_id);
    if let Some(replacement) = settings.palette_overrides.get(&product_id) {
        for (slot, rgba) in colors.iter_mut().zip(replacement.iter()) {
            *slot = *rgba;
        }
    }
    colors
}

/// Bin palettes, wire values 0..=6 (7 is the no-data encoding)
pub fn palette(product_id: u16) -> [[u8; 4]; 8] {
    match product_id {
        // Reflectivity greens through reds
        63 | 64 => [
            [0x00, 0x00, 0x00, 0x00],
            [0x00, 0xe0, 0x00, 0xff],
            [0x00, 0xa0, 0x00, 0xff],
            [0xe0, 0xe0, 0x00, 0xff],
            [0xe0, 0xa0, 0x00, 0xff],
            [0xe0, 0x00, 0x00, 0xff],
            [0xa0, 0x00, 0xa0, 0xff],
            [0x00, 0x00, 0x00, 0x00],
        ],
        // Lightning strike density, blues
        103 => [
            [0x00, 0x00, 0x00, 0x00],
            [0xc0, 0xc0, 0xff, 0xff],
            [0x90, 0x90, 0xff, 0xff],
            [0x60, 0x60, 0xff, 0xff],
            [0x30, 0x30, 0xe0, 0xff],
            [0x10, 0x10, 0xc0, 0xff],
            [0x00, 0x00, 0x90, 0xff],
            [0x00, 0x00, 0x00, 0x00],
        ],
        // Icing and turbulence severities, cloud tops heights
        _ => [
            [0x00, 0x00, 0x00, 0x00],
            [0xd0, 0xf0, 0xff, 0xff],
            [0xa0, 0xd0, 0xff, 0xff],
            [0x70, 0xa8, 0xe8, 0xff],
            [0x48, 0x80, 0xc8, 0xff],
            [0x28, 0x58, 0xa0, 0xff],
            [0x10, 0x30, 0x70, 0xff],
            [0x00, 0x00, 0x00, 0x00],
        ],
    }
}

/// The legend document stored alongside the imagery
pub fn legend(product_id: u16) -> serde_json::Value {
    let palette = palette(product_id);
    serde_json::json!({
        "product_id": product_id,
        "bins": (0..7)
            .map(|value| serde_json::json!({
                "value": value,
                "rgba": palette[value as usize],
            }))
            .collect::<Vec<_>>(),
        "no_data": WIRE_NO_DATA,
    })
}

pub struct RasterSet {
    settings: Settings,
    rasters: HashMap<RasterKey, Raster>,
}

impl RasterSet {
    pub fn new(settings: Settings) -> Self {
        RasterSet {
            settings,
            rasters: HashMap::new(),
        }
    }

    pub fn apply(
        &mut self,
        product_type: ProductType,
        product_id: u16,
        payload: &ImagePayload,
        now: DateTime<Utc>,
    ) {
        if payload.bins.len() != BLOCK_BINS {
            warn!(
                block = payload.block_number,
                bins = payload.bins.len(),
                "image block dropped, raster untouched"
            );
            return;
        }
        let key = RasterKey {
            product_id,
            scale: payload.scale,
        };
        let raster = self
            .rasters
            .entry(key)
            .or_insert_with(|| Raster::new(product_type, key, now));
        raster.apply(payload, now);
    }

    pub fn remove_block(
        &mut self,
        product_id: u16,
        scale: u8,
        block_number: u32,
        now: DateTime<Utc>,
    ) {
        if let Some(raster) = self.rasters.get_mut(&RasterKey {
            product_id,
            scale,
        }) {
            raster.remove_block(block_number, now);
        }
    }

    pub fn get(&self, product_id: u16, scale: u8) -> Option<&Raster> {
        self.rasters.get(&RasterKey { product_id, scale })
    }

    /// Render every dirty raster whose quiet period has elapsed
    pub fn render_due(
        &mut self,
        now: DateTime<Utc>,
        dir: &Path,
    ) -> Vec<PathBuf> {
        let quiet =
            Duration::seconds(self.settings.image_quiet_seconds as i64);
        let mut rendered = Vec::new();
        let settings = self.settings.clone();
        for raster in self.rasters.values_mut() {
            if raster.width == 0 {
                raster.dirty = false;
                continue;
            }
            if raster.dirty && now - raster.last_write >= quiet {
                match raster.render(&settings, dir) {
                    Ok(path) => rendered.push(path),
                    Err(error) => {
                        warn!(%error, "render failed, keeping raster dirty")
                    }
                }
            }
        }
        rendered
    }

    pub fn keys(&self) -> Vec<RasterKey> {
        self.rasters.keys().copied().collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn payload(
        block_number: u32,
        valid: DateTime<Utc>,
        value: u8,
    ) -> ImagePayload {
        ImagePayload {
            block_number,
            scale: 0,
            valid_time: valid,
            bins: vec![value; BLOCK_BINS],
        }
    }

    fn t0() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2021, 5, 14, 7, 0, 0).unwrap()
    }

    #[test]
    fn test_bounding_box_grows_to_minimum() {
        let mut set = RasterSet::new(Settings::default());
        // Two blocks on the same row with a gap between them
        set.apply(ProductType::CloudTops, 84, &payload(450, t0(), 1), t0());
        set.apply(ProductType::CloudTops, 84, &payload(452, t0(), 2), t0());
        let raster = set.get(84, 0).unwrap();
        assert_eq!(raster.size(), (96, 4));
        // The uncovered middle block stays not-included
        assert_eq!(raster.bin_at(0, 4), Some(1));
        assert_eq!(raster.bin_at(40, 4), Some(BIN_NOT_INCLUDED));
        assert_eq!(raster.bin_at(64, 4), Some(2));
    }

    #[test]
    fn test_no_data_sentinel_preserved() {
        let mut set = RasterSet::new(Settings::default());
        set.apply(
            ProductType::CloudTops,
            84,
            &payload(0, t0(), WIRE_NO_DATA),
            t0(),
        );
        let raster = set.get(84, 0).unwrap();
        assert_eq!(raster.bin_at(0, 0), Some(BIN_NO_DATA));
    }

    #[test]
    fn test_every_bin_is_sentinel_or_palette() {
        let mut set = RasterSet::new(Settings::default());
        set.apply(ProductType::NexradConus, 64, &payload(0, t0(), 3), t0());
        set.apply(ProductType::NexradConus, 64, &payload(901, t0(), 5), t0());
        let raster = set.get(64, 0).unwrap();
        let (width, height) = raster.size();
        for y in 0..height as i64 {
            for x in 0..width as i64 {
                let bin = raster
                    .bin_at(raster.west + x, raster.south + y)
                    .unwrap();
                assert!(
                    bin == BIN_NOT_INCLUDED || bin == BIN_NO_DATA || bin < 7,
                    "bin {bin:#x} out of domain"
                );
            }
        }
    }

    #[test]
    fn test_radar_eviction_is_inclusive_at_ten_minutes() {
        let mut set = RasterSet::new(Settings::default());
        let old = t0();
        let edge = t0() + Duration::minutes(10);
        let newest = t0() + Duration::minutes(11);

        set.apply(ProductType::NexradConus, 64, &payload(0, old, 1), old);
        set.apply(ProductType::NexradConus, 64, &payload(1, edge, 2), edge);
        set.apply(
            ProductType::NexradConus,
            64,
            &payload(2, newest, 3),
            newest,
        );

        let raster = set.get(64, 0).unwrap();
        // The 11-minute-old tile is gone; the exactly-10-minute tile stays
        assert_eq!(raster.block_count(), 2);
        assert_eq!(raster.bin_at(32, 0), Some(2));
        assert_eq!(raster.bin_at(64, 0), Some(3));
        for (_, valid) in &raster.blocks {
            assert!(newest - *valid <= Duration::minutes(10));
        }
    }

    #[test]
    fn test_palette_override() {
        let mut settings = Settings::default();
        settings
            .palette_overrides
            .insert(64, vec![[0, 0, 0, 0], [0x11, 0x22, 0x33, 0xff]]);
        let colors = effective_palette(&settings, 64);
        assert_eq!(colors[1], [0x11, 0x22, 0x33, 0xff]);
        // Entries past the override keep the built-in values
        assert_eq!(colors[2], palette(64)[2]);
        // Other products are untouched
        assert_eq!(effective_palette(&settings, 103), palette(103));
    }

    #[test]
    fn test_stale_radar_arrival_rejected() {
        let mut set = RasterSet::new(Settings::default());
        let newest = t0() + Duration::minutes(30);
        set.apply(ProductType::NexradConus, 64, &payload(0, newest, 1), newest);
        // Half an hour behind the composite: never written
        set.apply(ProductType::NexradConus, 64, &payload(1, t0(), 2), newest);
        let raster = set.get(64, 0).unwrap();
        assert_eq!(raster.block_count(), 1);
        assert_eq!(raster.bin_at(32, 0), None);
    }

    #[test]
    fn test_quiet_period_gates_rendering() {
        let mut settings = Settings::default();
        settings.image_quiet_seconds = 10;
        let dir = tempfile::tempdir().unwrap();
        let mut set = RasterSet::new(settings);

        // Blocks arrive one second apart for five seconds
        for i in 0..5 {
            let at = t0() + Duration::seconds(i);
            set.apply(
                ProductType::NexradConus,
                64,
                &payload(i as u32, at, 1),
                at,
            );
            assert!(
                set.render_due(at, dir.path()).is_empty(),
                "no render during arrivals"
            );
        }
        // Nine seconds after the last write: still quiet
        assert!(set
            .render_due(t0() + Duration::seconds(13), dir.path())
            .is_empty());
        // Ten seconds after: exactly one render
        let rendered =
            set.render_due(t0() + Duration::seconds(14), dir.path());
        assert_eq!(rendered.len(), 1);
        assert!(rendered[0].ends_with("NEXRAD_CONUS-0.png"));
        assert!(dir.path().join("NEXRAD_CONUS-0.wld").exists());
        // And nothing further while no new block arrives
        assert!(set
            .render_due(t0() + Duration::seconds(30), dir.path())
            .is_empty());
    }

    #[test]
    fn test_block_removal_shrinks_extent() {
        let mut set = RasterSet::new(Settings::default());
        set.apply(ProductType::CloudTops, 84, &payload(450, t0(), 1), t0());
        set.apply(ProductType::CloudTops, 84, &payload(452, t0(), 2), t0());
        set.remove_block(84, 0, 452, t0() + Duration::seconds(1));
        let raster = set.get(84, 0).unwrap();
        assert_eq!(raster.size(), (32, 4));
        assert_eq!(raster.block_count(), 1);
    }
}
