//! Process-wide calibration + policy snapshot consumed by the hit processor
//! and both groupers (`SPEC_FULL.md` §4.9, §6, §10.3).

use std::collections::HashSet;
use std::convert::TryInto;
use std::fs;
use std::path::{Path, PathBuf};

use crate::error::{Error, Result};

/// Channels are addressed globally as `channel | (chip << 6) | (slave << 12)
/// | (port << 17)`, identically to the `.modf` table's formula (§6).
pub fn global_channel_id(port: u32, slave: u32, chip: u32, channel: u32) -> u32 {
    channel | (chip << 6) | (slave << 12) | (port << 17)
}

pub const MAX_TRIGGER_REGIONS: i32 = 4096;
const CHANNEL_BLOCK_SIZE: usize = 4096;

bitflags! {
    /// Selects which calibration tables a `SystemConfig::load` call pulls
    /// in. A bit set without a matching path in `CalibrationPaths` is a
    /// `MissingCalibrationTable` error -- the loader refuses a partial
    /// config rather than silently proceeding (§7).
    pub struct LoadMask: u32 {
        const TDC_CALIBRATION       = 0b0000_0001;
        const QDC_CALIBRATION       = 0b0000_0010;
        const ENERGY_CALIBRATION    = 0b0000_0100;
        const TIME_OFFSET           = 0b0000_1000;
        const CHANNEL_MAP           = 0b0001_0000;
        const TRIGGER_MAP           = 0b0010_0000;
        const ALL = Self::TDC_CALIBRATION.bits
            | Self::QDC_CALIBRATION.bits
            | Self::ENERGY_CALIBRATION.bits
            | Self::TIME_OFFSET.bits
            | Self::CHANNEL_MAP.bits
            | Self::TRIGGER_MAP.bits;
    }
}

#[derive(Debug, Default)]
pub struct CalibrationPaths {
    pub tdc_calibration_table: Option<PathBuf>,
    pub qdc_calibration_table: Option<PathBuf>,
    pub energy_calibration_table: Option<PathBuf>,
    pub time_offset_table: Option<PathBuf>,
    pub channel_map_table: Option<PathBuf>,
    pub trigger_map_table: Option<PathBuf>,
}

/// TDC calibration for one (channel, tac, branch) triple: `t0, a0 (m), a1
/// (tB), a2` in the quadratic inverse of §4.5.
#[derive(Debug, Clone, Copy, Default)]
pub struct TacConfig {
    pub t0: f64,
    pub m: f64,
    pub t_b: f64,
    pub a2: f64,
}

/// QDC calibration for one (channel, tac): ten polynomial coefficients, of
/// which §4.5's charge-mode energy formula uses `p0..p4`.
#[derive(Debug, Clone, Copy)]
pub struct QdcConfig {
    pub p: [f64; 10],
}

impl Default for QdcConfig {
    fn default() -> Self {
        QdcConfig { p: [0.0; 10] }
    }
}

/// Energy linearisation coefficients, loaded per §6 but not consumed by the
/// core §4.5 formula; see `DESIGN.md` for why this table is kept separate
/// from the hit processor's hot path.
#[derive(Debug, Clone, Copy, Default)]
pub struct EnergyConfig {
    pub p: [f64; 4],
}

#[derive(Debug, Clone)]
pub struct ChannelConfig {
    pub region: i32,
    pub xi: i32,
    pub yi: i32,
    pub x: f32,
    pub y: f32,
    pub z: f32,
    pub time_offset: f64,
    pub tac_t: [TacConfig; 4],
    pub tac_e: [TacConfig; 4],
    pub qdc: [QdcConfig; 4],
    pub energy_cal: [EnergyConfig; 4],
}

impl Default for ChannelConfig {
    fn default() -> Self {
        ChannelConfig {
            region: -1,
            xi: 0,
            yi: 0,
            x: 0.0,
            y: 0.0,
            z: 0.0,
            time_offset: 0.0,
            tac_t: [TacConfig::default(); 4],
            tac_e: [TacConfig::default(); 4],
            qdc: [QdcConfig::default(); 4],
            energy_cal: [EnergyConfig::default(); 4],
        }
    }
}

/// Strip a trailing `\r`, strip an unescaped `#`-comment, trim, and collapse
/// internal whitespace runs to a single tab (§4.9's line-normalisation
/// rule, shared by every calibration table and the step index).
pub fn normalize_line(line: &str) -> String {
    let line = line.trim_end_matches('\r');
    let line = match line.find('#') {
        Some(idx) => &line[..idx],
        None => line,
    };
    line.split_whitespace().collect::<Vec<_>>().join("\t")
}

#[derive(Default)]
pub struct SystemConfig {
    channels: Vec<Option<Box<[ChannelConfig; CHANNEL_BLOCK_SIZE]>>>,
    multihit_allowed: HashSet<(i32, i32)>,
    coincidence_allowed: HashSet<(i32, i32)>,

    pub require_tdc: bool,
    pub require_qdc: bool,
    pub channel_map_loaded: bool,

    pub group_time_window: f64,
    pub group_max_distance: f64,
    pub group_min_energy: f64,
    pub group_max_energy: f64,
    pub group_max_hits: usize,
    pub group_min_hits: usize,

    pub coincidence_time_window: f64,
}

impl SystemConfig {
    fn new(mask: LoadMask) -> Self {
        SystemConfig {
            channels: Vec::new(),
            multihit_allowed: HashSet::new(),
            coincidence_allowed: HashSet::new(),
            require_tdc: mask.contains(LoadMask::TDC_CALIBRATION),
            require_qdc: mask.contains(LoadMask::QDC_CALIBRATION),
            channel_map_loaded: mask.contains(LoadMask::CHANNEL_MAP),
            // defaults mirror sw_trigger section defaults
            group_time_window: 20.0,
            group_max_distance: 100.0,
            group_min_energy: -1.0e6,
            group_max_energy: 1.0e6,
            group_max_hits: 64,
            group_min_hits: 1,
            coincidence_time_window: 2.0,
        }
    }

    pub fn channel_config(&self, global_channel_id: u32) -> ChannelConfig {
        let index_h = (global_channel_id as usize) / CHANNEL_BLOCK_SIZE;
        let index_l = (global_channel_id as usize) % CHANNEL_BLOCK_SIZE;
        self.channels
            .get(index_h)
            .and_then(|block| block.as_ref())
            .map(|block| block[index_l].clone())
            .unwrap_or_default()
    }

    fn touch_channel_config(&mut self, global_channel_id: u32) -> &mut ChannelConfig {
        let index_h = (global_channel_id as usize) / CHANNEL_BLOCK_SIZE;
        let index_l = (global_channel_id as usize) % CHANNEL_BLOCK_SIZE;
        if self.channels.len() <= index_h {
            self.channels.resize_with(index_h + 1, || None);
        }
        if self.channels[index_h].is_none() {
            let block: Vec<ChannelConfig> = (0..CHANNEL_BLOCK_SIZE)
                .map(|_| ChannelConfig::default())
                .collect();
            let block: Box<[ChannelConfig; CHANNEL_BLOCK_SIZE]> =
                block.into_boxed_slice().try_into().unwrap_or_else(|_| {
                    panic!("channel config block must have exactly CHANNEL_BLOCK_SIZE entries")
                });
            self.channels[index_h] = Some(block);
        }
        &mut self.channels[index_h].as_mut().unwrap()[index_l]
    }

    /// `false` whenever either region is negative, regardless of the
    /// matrix contents (§4.7, §4.8).
    pub fn is_multihit_allowed(&self, r1: i32, r2: i32) -> bool {
        r1 >= 0 && r2 >= 0 && self.multihit_allowed.contains(&(r1, r2))
    }

    pub fn is_coincidence_allowed(&self, r1: i32, r2: i32) -> bool {
        r1 >= 0 && r2 >= 0 && self.coincidence_allowed.contains(&(r1, r2))
    }

    pub fn load(mask: LoadMask, paths: &CalibrationPaths) -> Result<SystemConfig> {
        let mut config = SystemConfig::new(mask);

        if mask.contains(LoadMask::TDC_CALIBRATION) {
            let path = require_path(&paths.tdc_calibration_table)?;
            load_tdc_calibration(&mut config, path)?;
        }
        if mask.contains(LoadMask::QDC_CALIBRATION) {
            let path = require_path(&paths.qdc_calibration_table)?;
            load_qdc_calibration(&mut config, path)?;
        }
        if mask.contains(LoadMask::ENERGY_CALIBRATION) {
            let path = require_path(&paths.energy_calibration_table)?;
            load_energy_calibration(&mut config, path)?;
        }
        if mask.contains(LoadMask::TIME_OFFSET) {
            let path = require_path(&paths.time_offset_table)?;
            load_time_offset(&mut config, path)?;
        }
        if mask.contains(LoadMask::CHANNEL_MAP) {
            let path = require_path(&paths.channel_map_table)?;
            load_channel_map(&mut config, path)?;
        }
        if mask.contains(LoadMask::TRIGGER_MAP) {
            let path = require_path(&paths.trigger_map_table)?;
            load_trigger_map(&mut config, path)?;
        }

        Ok(config)
    }
}

fn require_path(path: &Option<PathBuf>) -> Result<&Path> {
    path.as_deref()
        .ok_or_else(|| Error::MissingCalibrationTable {
            path: PathBuf::new(),
        })
}

fn read_lines(path: &Path) -> Result<Vec<String>> {
    let contents = fs::read_to_string(path).map_err(|inner| Error::CalibrationTableRead {
        path: path.to_path_buf(),
        inner,
    })?;
    Ok(contents.lines().map(normalize_line).collect())
}

fn parse_fields(line: &str) -> Vec<&str> {
    if line.is_empty() {
        Vec::new()
    } else {
        line.split('\t').collect()
    }
}

fn load_tdc_calibration(config: &mut SystemConfig, path: &Path) -> Result<()> {
    for line in read_lines(path)? {
        let f = parse_fields(&line);
        if f.len() != 10 {
            continue;
        }
        let (port, slave, chip, channel, tac, branch) = match (
            f[0].parse::<u32>(),
            f[1].parse::<u32>(),
            f[2].parse::<u32>(),
            f[3].parse::<u32>(),
            f[4].parse::<usize>(),
            f[5],
        ) {
            (Ok(a), Ok(b), Ok(c), Ok(d), Ok(e), branch) if e < 4 => (a, b, c, d, e, branch),
            _ => continue,
        };
        let (t0, a0, a1, a2) = match (
            f[6].parse::<f64>(),
            f[7].parse::<f64>(),
            f[8].parse::<f64>(),
            f[9].parse::<f64>(),
        ) {
            (Ok(a), Ok(b), Ok(c), Ok(d)) => (a, b, c, d),
            _ => continue,
        };

        let gid = global_channel_id(port, slave, chip, channel);
        let tac_cfg = TacConfig {
            t0,
            m: a0,
            t_b: a1,
            a2,
        };
        let channel_cfg = config.touch_channel_config(gid);
        match branch.to_ascii_uppercase().as_str() {
            "T" => channel_cfg.tac_t[tac] = tac_cfg,
            "E" => channel_cfg.tac_e[tac] = tac_cfg,
            _ => continue,
        }
    }
    Ok(())
}

fn load_qdc_calibration(config: &mut SystemConfig, path: &Path) -> Result<()> {
    for line in read_lines(path)? {
        let f = parse_fields(&line);
        if f.len() != 15 {
            continue;
        }
        let (port, slave, chip, channel, tac) = match (
            f[0].parse::<u32>(),
            f[1].parse::<u32>(),
            f[2].parse::<u32>(),
            f[3].parse::<u32>(),
            f[4].parse::<usize>(),
        ) {
            (Ok(a), Ok(b), Ok(c), Ok(d), Ok(e)) if e < 4 => (a, b, c, d, e),
            _ => continue,
        };
        let mut p = [0.0f64; 10];
        let mut ok = true;
        for (i, slot) in p.iter_mut().enumerate() {
            match f[5 + i].parse::<f64>() {
                Ok(v) => *slot = v,
                Err(_) => {
                    ok = false;
                    break;
                }
            }
        }
        if !ok {
            continue;
        }
        let gid = global_channel_id(port, slave, chip, channel);
        config.touch_channel_config(gid).qdc[tac] = QdcConfig { p };
    }
    Ok(())
}

fn load_energy_calibration(config: &mut SystemConfig, path: &Path) -> Result<()> {
    for line in read_lines(path)? {
        let f = parse_fields(&line);
        if f.len() != 9 {
            continue;
        }
        let (port, slave, chip, channel, tac) = match (
            f[0].parse::<u32>(),
            f[1].parse::<u32>(),
            f[2].parse::<u32>(),
            f[3].parse::<u32>(),
            f[4].parse::<usize>(),
        ) {
            (Ok(a), Ok(b), Ok(c), Ok(d), Ok(e)) if e < 4 => (a, b, c, d, e),
            _ => continue,
        };
        let mut p = [0.0f64; 4];
        let mut ok = true;
        for (i, slot) in p.iter_mut().enumerate() {
            match f[5 + i].parse::<f64>() {
                Ok(v) => *slot = v,
                Err(_) => {
                    ok = false;
                    break;
                }
            }
        }
        if !ok {
            continue;
        }
        let gid = global_channel_id(port, slave, chip, channel);
        config.touch_channel_config(gid).energy_cal[tac] = EnergyConfig { p };
    }
    Ok(())
}

fn load_time_offset(config: &mut SystemConfig, path: &Path) -> Result<()> {
    for line in read_lines(path)? {
        let f = parse_fields(&line);
        if f.len() != 5 {
            continue;
        }
        let (port, slave, chip, channel) = match (
            f[0].parse::<u32>(),
            f[1].parse::<u32>(),
            f[2].parse::<u32>(),
            f[3].parse::<u32>(),
        ) {
            (Ok(a), Ok(b), Ok(c), Ok(d)) => (a, b, c, d),
            _ => continue,
        };
        let t0 = match f[4].parse::<f64>() {
            Ok(v) => v,
            Err(_) => continue,
        };
        let gid = global_channel_id(port, slave, chip, channel);
        config.touch_channel_config(gid).time_offset = t0;
    }
    Ok(())
}

fn load_channel_map(config: &mut SystemConfig, path: &Path) -> Result<()> {
    for line in read_lines(path)? {
        let f = parse_fields(&line);
        if f.len() != 9 {
            continue;
        }
        let (port, slave, chip, channel) = match (
            f[0].parse::<u32>(),
            f[1].parse::<u32>(),
            f[2].parse::<u32>(),
            f[3].parse::<u32>(),
        ) {
            (Ok(a), Ok(b), Ok(c), Ok(d)) => (a, b, c, d),
            _ => continue,
        };
        let (region, xi, yi) = match (f[4].parse::<i32>(), f[5].parse::<i32>(), f[6].parse::<i32>()) {
            (Ok(a), Ok(b), Ok(c)) => (a, b, c),
            _ => continue,
        };
        let (x, y, z) = match (f[7].parse::<f32>(), f[8].parse::<f32>(), f.get(9).map(|s| s.parse::<f32>())) {
            (Ok(a), Ok(b), Some(Ok(c))) => (a, b, c),
            (Ok(a), Ok(b), None) => (a, b, 0.0),
            _ => continue,
        };
        let gid = global_channel_id(port, slave, chip, channel);
        let cfg = config.touch_channel_config(gid);
        cfg.region = region;
        cfg.xi = xi;
        cfg.yi = yi;
        cfg.x = x;
        cfg.y = y;
        cfg.z = z;
    }
    Ok(())
}

fn load_trigger_map(config: &mut SystemConfig, path: &Path) -> Result<()> {
    for (line_no, line) in read_lines(path)?.into_iter().enumerate() {
        if line.is_empty() {
            continue;
        }
        let f = parse_fields(&line);
        if f.len() != 3 {
            return Err(Error::InvalidTriggerMapEntry {
                line_no,
                line,
                reason: "expected exactly 3 fields: region1 region2 kind",
            });
        }
        let r1 = f[0]
            .parse::<i32>()
            .map_err(|_| Error::InvalidTriggerMapEntry {
                line_no,
                line: line.clone(),
                reason: "region1 is not an integer",
            })?;
        let r2 = f[1]
            .parse::<i32>()
            .map_err(|_| Error::InvalidTriggerMapEntry {
                line_no,
                line: line.clone(),
                reason: "region2 is not an integer",
            })?;
        if !(0..MAX_TRIGGER_REGIONS).contains(&r1) || !(0..MAX_TRIGGER_REGIONS).contains(&r2) {
            return Err(Error::InvalidTriggerMapEntry {
                line_no,
                line: line.clone(),
                reason: "region id out of range [0, MAX_TRIGGER_REGIONS)",
            });
        }
        let kind = f[2].to_ascii_uppercase();
        match kind.as_str() {
            "C" => {
                config.coincidence_allowed.insert((r1, r2));
                config.coincidence_allowed.insert((r2, r1));
            }
            "M" => {
                config.multihit_allowed.insert((r1, r2));
                config.multihit_allowed.insert((r2, r1));
            }
            _ => {
                return Err(Error::InvalidTriggerMapEntry {
                    line_no,
                    line,
                    reason: "kind must be 'C' or 'M'",
                })
            }
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn global_channel_id_matches_modf_formula() {
        assert_eq!(global_channel_id(1, 2, 3, 4), 4 | (3 << 6) | (2 << 12) | (1 << 17));
    }

    #[test]
    fn normalize_line_strips_comments_and_collapses_whitespace() {
        assert_eq!(
            normalize_line("  1\t 2  3   # a comment \r"),
            "1\t2\t3"
        );
    }

    #[test]
    fn missing_region_defaults_to_minus_one() {
        let config = SystemConfig::new(LoadMask::empty());
        let cfg = config.channel_config(12345);
        assert_eq!(cfg.region, -1);
        assert!(!config.is_multihit_allowed(cfg.region, 0));
    }

    #[test]
    fn trigger_map_is_symmetric_and_region_negative_short_circuits() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("trigger.txt");
        let mut f = fs::File::create(&path).unwrap();
        writeln!(f, "0\t1\tC").unwrap();
        writeln!(f, "2\t3\tM").unwrap();

        let mut config = SystemConfig::new(LoadMask::empty());
        load_trigger_map(&mut config, &path).unwrap();

        assert!(config.is_coincidence_allowed(0, 1));
        assert!(config.is_coincidence_allowed(1, 0));
        assert!(!config.is_coincidence_allowed(0, 2));
        assert!(config.is_multihit_allowed(2, 3));
        assert!(config.is_multihit_allowed(3, 2));
        assert!(!config.is_multihit_allowed(-1, 3));
    }

    #[test]
    fn trigger_map_rejects_out_of_range_region() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("trigger.txt");
        let mut f = fs::File::create(&path).unwrap();
        writeln!(f, "0\t99999\tC").unwrap();

        let mut config = SystemConfig::new(LoadMask::empty());
        assert!(load_trigger_map(&mut config, &path).is_err());
    }
}
