//! Converts `RawHit` (raw TDC/QDC codes) into calibrated `Hit` (picoseconds
//! and absolute energy units), `SPEC_FULL.md` §4.5.

use crate::buffer::EventBuffer;
use crate::config::SystemConfig;
use crate::event::{Hit, RawHit};
use crate::handler::Handler;
use std::sync::Arc;

/// Solves the quadratic TDC inverse `fine = a2*q^2 + m*q + ...` for the
/// branch root used by the firmware's own decoder, grounded in
/// `ProcessHit.cpp`'s `q_T`/`q_E` formula.
fn quadratic_inverse(fine: u16, m: f64, t_b: f64, a2: f64) -> f64 {
    (2.0 * a2 * t_b + (4.0 * a2 * fine as f64 + m * m).sqrt() - m) / (2.0 * a2)
}

pub struct HitProcessor {
    config: Arc<SystemConfig>,
}

impl HitProcessor {
    pub fn new(config: Arc<SystemConfig>) -> Self {
        HitProcessor { config }
    }
}

impl Handler<RawHit, Hit> for HitProcessor {
    fn handle_events(&mut self, buffer: EventBuffer<RawHit>) -> EventBuffer<Hit> {
        let n = buffer.len();
        let require_tdc = self.config.require_tdc;
        let require_qdc = self.config.require_qdc;

        let raws: Vec<*const RawHit> = buffer.as_slice().iter().map(|h| h as *const RawHit).collect();
        let inputs: Vec<RawHit> = buffer.as_slice().to_vec();
        let mut out: EventBuffer<Hit> = EventBuffer::derived_from(n, buffer);

        for (raw_ptr, input) in raws.into_iter().zip(inputs.into_iter()) {
            let mut valid = input.valid;
            let channel_cfg = self.config.channel_config(input.channel_id);
            let ct = channel_cfg.tac_t[input.tac_id as usize];
            let ce = channel_cfg.tac_e[input.tac_id as usize];
            let cq = channel_cfg.qdc[input.tac_id as usize];

            let q_t = quadratic_inverse(input.tfine, ct.m, ct.t_b, ct.a2);
            let time = input.time as f64 - q_t;
            valid &= ct.m != 0.0 || !require_tdc;

            let (time_end, energy);
            if !input.qdc_mode {
                let q_e = quadratic_inverse(input.efine, ce.m, ce.t_b, ce.a2);
                time_end = input.time_end as f64 - q_e;
                energy = time_end - time;
                valid &= ce.m != 0.0 || !require_tdc;
            } else {
                time_end = input.time_end as f64;
                let ti = time_end - time;
                let q0 = cq.p[0]
                    + cq.p[1] * ti
                    + cq.p[2] * ti * ti
                    + cq.p[3] * ti * ti * ti
                    + cq.p[4] * ti * ti * ti * ti;
                energy = input.efine as f64 - q0;
                valid &= cq.p[1] != 0.0 || !require_qdc;
            }

            let region = if self.config.channel_map_loaded {
                channel_cfg.region
            } else {
                (input.channel_id / 128) as i32
            };

            out.push(Hit {
                valid,
                raw: raw_ptr,
                time,
                time_end,
                energy,
                region,
                xi: channel_cfg.xi,
                yi: channel_cfg.yi,
                x: channel_cfg.x,
                y: channel_cfg.y,
                z: channel_cfg.z,
            });
        }

        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{CalibrationPaths, LoadMask};
    use std::fs;
    use std::io::Write;

    fn push_raw(buffer: &mut EventBuffer<RawHit>, qdc_mode: bool, tfine: u16, efine: u16, time: i64, time_end: i64) {
        buffer.push(RawHit {
            valid: true,
            qdc_mode,
            channel_id: 0,
            tac_id: 0,
            frame_id: 0,
            tcoarse: 0,
            ecoarse: 0,
            tfine,
            efine,
            time,
            time_end,
        });
    }

    #[test]
    fn missing_calibration_marks_hit_invalid_without_dropping_it() {
        // Load a TDC calibration table that only covers channel 1, so
        // require_tdc is true but channel 0's entry stays at its zeroed
        // default (m == 0.0).
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("tdc.tsv");
        let mut f = fs::File::create(&path).unwrap();
        writeln!(f, "0\t0\t0\t1\t0\tT\t0.0\t1.0\t0.0\t1.0").unwrap();
        drop(f);

        let paths = CalibrationPaths {
            tdc_calibration_table: Some(path),
            ..Default::default()
        };
        let config = Arc::new(SystemConfig::load(LoadMask::TDC_CALIBRATION, &paths).unwrap());

        let mut buffer: EventBuffer<RawHit> = EventBuffer::new(1, 0, 0);
        push_raw(&mut buffer, false, 100, 200, 1000, 2000);

        let mut processor = HitProcessor::new(config);
        let out = processor.handle_events(buffer);
        assert_eq!(out.len(), 1);
        assert!(!out.as_slice()[0].valid);
    }

    #[test]
    fn region_defaults_to_channel_div_128_when_no_channel_map_loaded() {
        let config = Arc::new(SystemConfig::load(LoadMask::empty(), &CalibrationPaths::default()).unwrap());
        let mut buffer: EventBuffer<RawHit> = EventBuffer::new(1, 0, 0);
        push_raw(&mut buffer, true, 50, 60, 500, 600);

        let mut processor = HitProcessor::new(config);
        let out = processor.handle_events(buffer);
        assert_eq!(out.as_slice()[0].region, 0);
    }
}
