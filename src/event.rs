//! Value types that flow through the pipeline: one struct per pipeline stage
//! boundary, from the undecoded hardware word up to a two-photon coincidence.

/// Hard upper bound on stored hits in a single `GammaPhoton`.
pub const MAX_HITS_PER_PHOTON: usize = 256;

/// Exactly two photons make a coincidence; kept as a constant rather than a
/// literal `2` so the intent reads at call sites.
pub const PHOTONS_PER_COINCIDENCE: usize = 2;

/// A still-packed 64 bit event word paired with the frame it arrived in.
/// Produced by the reader, consumed by the decoder.
#[derive(Debug, Clone, Copy, Default)]
pub struct UndecodedHit {
    pub frame_id: u64,
    pub event_word: u64,
}

/// A decoded hardware event, before calibration.
#[derive(Debug, Clone, Copy)]
pub struct RawHit {
    pub valid: bool,
    pub qdc_mode: bool,
    pub channel_id: u32,
    pub tac_id: u8,
    pub frame_id: u64,
    pub tcoarse: u16,
    pub ecoarse: u16,
    pub tfine: u16,
    pub efine: u16,
    pub time: i64,
    pub time_end: i64,
}

impl Default for RawHit {
    fn default() -> Self {
        RawHit {
            valid: false,
            qdc_mode: false,
            channel_id: 0,
            tac_id: 0,
            frame_id: 0,
            tcoarse: 0,
            ecoarse: 0,
            tfine: 0,
            efine: 0,
            time: 0,
            time_end: 0,
        }
    }
}

/// A calibrated physical hit. `raw` is a weak back-reference into the
/// `RawHit` buffer this was derived from; it stays valid for as long as the
/// `Hit` buffer's parent chain is alive (see `buffer::EventBuffer`).
#[derive(Debug, Clone, Copy)]
pub struct Hit {
    pub valid: bool,
    pub raw: *const RawHit,
    pub time: f64,
    pub time_end: f64,
    pub energy: f64,
    pub region: i32,
    pub xi: i32,
    pub yi: i32,
    pub x: f32,
    pub y: f32,
    pub z: f32,
}

impl Default for Hit {
    fn default() -> Self {
        Hit {
            valid: false,
            raw: std::ptr::null(),
            time: 0.0,
            time_end: 0.0,
            energy: 0.0,
            region: -1,
            xi: 0,
            yi: 0,
            x: 0.0,
            y: 0.0,
            z: 0.0,
        }
    }
}

// Safety: `raw` only ever points into a `RawHit` buffer owned by this
// `Hit`'s buffer's parent chain, which moves as a unit wherever the buffer
// moves (see `buffer::EventBuffer`); the pointee therefore travels with its
// pointer across a thread hand-off.
unsafe impl Send for Hit {}

impl Hit {
    /// Borrow the `RawHit` this hit was derived from.
    ///
    /// # Safety
    /// The caller must ensure the buffer that owns the pointee is still
    /// alive; this always holds while the `Hit` lives inside a buffer whose
    /// parent chain has not been dropped.
    pub unsafe fn raw(&self) -> Option<&RawHit> {
        self.raw.as_ref()
    }
}

/// A clustered set of hits attributed to one gamma interaction.
#[derive(Debug, Clone)]
pub struct GammaPhoton {
    pub valid: bool,
    pub time: f64,
    pub energy: f64,
    pub region: i32,
    pub x: f32,
    pub y: f32,
    pub z: f32,
    pub n_hits: u32,
    pub hits: Vec<*const Hit>,
}

impl Default for GammaPhoton {
    fn default() -> Self {
        GammaPhoton {
            valid: false,
            time: 0.0,
            energy: 0.0,
            region: -1,
            x: 0.0,
            y: 0.0,
            z: 0.0,
            n_hits: 0,
            hits: Vec::new(),
        }
    }
}

// Safety: same argument as `Hit`'s impl above, one level up the parent
// chain.
unsafe impl Send for GammaPhoton {}

impl GammaPhoton {
    /// Borrow the seed (highest-energy) hit, if any is stored.
    ///
    /// # Safety
    /// Same contract as `Hit::raw`: valid as long as the owning buffer's
    /// parent chain is alive.
    pub unsafe fn seed(&self) -> Option<&Hit> {
        self.hits.first().and_then(|p| p.as_ref())
    }
}

/// Exactly two gamma photons within a time window.
#[derive(Debug, Clone, Copy)]
pub struct Coincidence {
    pub valid: bool,
    pub n_photons: u8,
    pub photons: [*const GammaPhoton; PHOTONS_PER_COINCIDENCE],
}

impl Default for Coincidence {
    fn default() -> Self {
        Coincidence {
            valid: false,
            n_photons: 0,
            photons: [std::ptr::null(); PHOTONS_PER_COINCIDENCE],
        }
    }
}

// Safety: same argument as `Hit`'s impl above, two levels up the parent
// chain.
unsafe impl Send for Coincidence {}

impl Coincidence {
    /// # Safety
    /// Same contract as `Hit::raw`.
    pub unsafe fn photon(&self, i: usize) -> Option<&GammaPhoton> {
        self.photons.get(i).and_then(|p| p.as_ref())
    }
}
