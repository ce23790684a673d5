//! Offline reader-to-coincidence pipeline for a SiPM-based positron-emission
//! / radiation-detection DAQ platform. See `SPEC_FULL.md` for the full
//! specification this crate implements.

#[macro_use]
extern crate bitflags;
#[macro_use]
extern crate failure_derive;
extern crate crossbeam_channel;
extern crate failure;
#[macro_use]
extern crate log;
extern crate num_cpus;
extern crate strum;
#[macro_use]
extern crate strum_macros;

#[cfg(test)]
extern crate pretty_assertions;
#[cfg(test)]
extern crate rand;
#[cfg(test)]
extern crate tempfile;

pub mod buffer;
pub mod coincidence;
pub mod config;
pub mod decode;
pub mod error;
pub mod event;
pub mod grouper;
pub mod handler;
pub mod hit_processor;
pub mod pipeline;
pub mod pool;
pub mod reader;
pub mod sink;
pub mod sort;

pub use crate::error::{Error, Result};
