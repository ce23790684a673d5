//! Forms two-photon `Coincidence`s within a time-sorted `GammaPhoton`
//! buffer, `SPEC_FULL.md` §4.8.

use std::sync::Arc;

use crate::buffer::EventBuffer;
use crate::config::SystemConfig;
use crate::event::{Coincidence, GammaPhoton};
use crate::handler::Handler;

const OVERLAP: f64 = 200.0;

#[derive(Default, Debug, Clone, Copy)]
pub struct CoincidenceReport {
    pub prompts: u64,
}

pub struct CoincidenceGrouper {
    config: Arc<SystemConfig>,
    report: CoincidenceReport,
}

impl CoincidenceGrouper {
    pub fn new(config: Arc<SystemConfig>) -> Self {
        CoincidenceGrouper {
            config,
            report: CoincidenceReport::default(),
        }
    }

    pub fn counters(&self) -> CoincidenceReport {
        self.report
    }
}

impl Handler<GammaPhoton, Coincidence> for CoincidenceGrouper {
    fn handle_events(&mut self, buffer: EventBuffer<GammaPhoton>) -> EventBuffer<Coincidence> {
        let window = self.config.coincidence_time_window;
        let n = buffer.len();
        let photons: Vec<*const GammaPhoton> = buffer.as_slice().iter().map(|p| p as *const GammaPhoton).collect();
        let mut out: EventBuffer<Coincidence> = EventBuffer::derived_from(n, buffer);

        for i in 0..n {
            let p1 = unsafe { &*photons[i] };
            for j in (i + 1)..n {
                let p2 = unsafe { &*photons[j] };
                if (p2.time - p1.time) > (window + OVERLAP) {
                    break;
                }
                if !self.config.is_coincidence_allowed(p1.region, p2.region) {
                    continue;
                }
                if (p1.time - p2.time).abs() <= window {
                    let first_is_p1 = p1.region > p2.region;
                    let photons = if first_is_p1 {
                        [photons[i], photons[j]]
                    } else {
                        [photons[j], photons[i]]
                    };
                    out.push(Coincidence {
                        valid: true,
                        n_photons: 2,
                        photons,
                    });
                    self.report.prompts += 1;
                }
            }
        }

        out
    }

    fn report(&self) {
        info!("CoincidenceGrouper: {} prompts passed", self.report.prompts);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{CalibrationPaths, LoadMask};
    use std::fs;
    use std::io::Write;

    fn photon(time: f64, region: i32) -> GammaPhoton {
        GammaPhoton {
            valid: true,
            time,
            energy: 500.0,
            region,
            x: 0.0,
            y: 0.0,
            z: 0.0,
            n_hits: 1,
            hits: Vec::new(),
        }
    }

    fn config_with_trigger_map(entries: &str, window: f64) -> Arc<SystemConfig> {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("trigger.txt");
        let mut f = fs::File::create(&path).unwrap();
        write!(f, "{}", entries).unwrap();

        let paths = CalibrationPaths {
            trigger_map_table: Some(path),
            ..Default::default()
        };
        let mut config = SystemConfig::load(LoadMask::TRIGGER_MAP, &paths).unwrap();
        config.coincidence_time_window = window;
        Arc::new(config)
    }

    #[test]
    fn forms_coincidence_and_orders_higher_region_first() {
        let config = config_with_trigger_map("0\t1\tC\n", 5.0);
        let mut buffer: EventBuffer<GammaPhoton> = EventBuffer::new(2, 0, 0);
        buffer.push(photon(0.0, 0));
        buffer.push(photon(2.0, 1));

        let mut grouper = CoincidenceGrouper::new(config);
        let out = grouper.handle_events(buffer);
        assert_eq!(out.len(), 1);
        let c = &out.as_slice()[0];
        assert_eq!(c.n_photons, 2);
        unsafe {
            assert_eq!(c.photon(0).unwrap().region, 1);
            assert_eq!(c.photon(1).unwrap().region, 0);
        }
    }

    #[test]
    fn disallowed_region_pair_never_coincides() {
        let config = config_with_trigger_map("", 5.0);
        let mut buffer: EventBuffer<GammaPhoton> = EventBuffer::new(2, 0, 0);
        buffer.push(photon(0.0, 0));
        buffer.push(photon(1.0, 1));

        let mut grouper = CoincidenceGrouper::new(config);
        let out = grouper.handle_events(buffer);
        assert_eq!(out.len(), 0);
    }

    #[test]
    fn outside_time_window_is_rejected() {
        let config = config_with_trigger_map("0\t1\tC\n", 1.0);
        let mut buffer: EventBuffer<GammaPhoton> = EventBuffer::new(2, 0, 0);
        buffer.push(photon(0.0, 0));
        buffer.push(photon(50.0, 1));

        let mut grouper = CoincidenceGrouper::new(config);
        let out = grouper.handle_events(buffer);
        assert_eq!(out.len(), 0);
    }
}
